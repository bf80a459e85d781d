/// Coverage tracer: feeds the worker-local coverage map from opcode hooks
use std::cell::RefCell;
use std::rc::Rc;

use crate::chain::tracers::{FrameExit, OpcodeCtx, Tracer};
use crate::coverage::CoverageMap;

/// Maintains the worker's per-PC bitmaps. Bytecodes are registered lazily
/// the first time an instruction of theirs executes, so init code (whose
/// hash covers appended constructor arguments) needs no up-front
/// registration.
pub struct CoverageTracer {
    map: Rc<RefCell<CoverageMap>>,
}

impl CoverageTracer {
    pub fn new(map: Rc<RefCell<CoverageMap>>) -> Self {
        Self { map }
    }
}

impl Tracer for CoverageTracer {
    fn on_opcode(&mut self, ctx: &OpcodeCtx<'_>) {
        let mut map = self.map.borrow_mut();
        if !map.is_registered(ctx.code_hash, ctx.is_init) {
            map.register(ctx.code_hash, ctx.is_init, ctx.code);
        }
        map.mark_executed(ctx.code_hash, ctx.is_init, ctx.pc);
    }

    fn on_exit(&mut self, exit: &FrameExit) {
        if exit.reverted {
            self.map
                .borrow_mut()
                .mark_reverted(exit.code_hash, exit.is_init, exit.last_pc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revm::primitives::B256;

    const CODE: &[u8] = &[0x60, 0x01, 0x60, 0x02, 0x01, 0x00];

    #[test]
    fn test_lazy_registration_and_marking() {
        let map = Rc::new(RefCell::new(CoverageMap::new()));
        let mut tracer = CoverageTracer::new(map.clone());
        let hash = B256([7u8; 32]);
        tracer.on_opcode(&OpcodeCtx {
            pc: 0,
            opcode: 0x60,
            address: revm::primitives::B160([1u8; 20]),
            code_hash: hash,
            is_init: false,
            code: CODE,
            stack_top: None,
            stack_second: None,
        });
        assert!(map.borrow().is_registered(hash, false));
        assert_eq!(map.borrow().bits_set(), 1);

        tracer.on_exit(&FrameExit {
            address: revm::primitives::B160([1u8; 20]),
            code_hash: hash,
            is_init: false,
            reverted: true,
            last_pc: 4,
        });
        assert_eq!(map.borrow().bits_set(), 2);
    }
}
