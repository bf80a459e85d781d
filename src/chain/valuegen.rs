/// Value-generation tracer: mines runtime values into the mutator pool
use std::cell::RefCell;
use std::rc::Rc;

use crate::chain::tracers::{CallOutcome, OpcodeCtx, RawLog, Tracer};
use crate::mutator::ValuePool;

const OP_SSTORE: u8 = 0x55;

/// Records literals the campaign observes at run time: event topics and
/// payloads, call return data, and storage writes. These feed the
/// from-literal-pool mutation strategy alongside compile-time mined
/// constants.
pub struct ValueGenTracer {
    pool: Rc<RefCell<ValuePool>>,
}

impl ValueGenTracer {
    pub fn new(pool: Rc<RefCell<ValuePool>>) -> Self {
        Self { pool }
    }
}

impl Tracer for ValueGenTracer {
    fn on_opcode(&mut self, ctx: &OpcodeCtx<'_>) {
        if ctx.opcode == OP_SSTORE {
            if let Some(value) = ctx.stack_second {
                self.pool.borrow_mut().add_word(value);
            }
        }
    }

    fn on_log(&mut self, log: &RawLog) {
        let mut pool = self.pool.borrow_mut();
        // topic0 is the event signature, not a domain value
        for topic in log.topics.iter().skip(1) {
            pool.add_literal(&topic.0);
        }
        for word in log.data.chunks(32) {
            pool.add_literal(word);
        }
    }

    fn on_tx_end(&mut self, outcome: &CallOutcome) {
        let data = match outcome {
            CallOutcome::Success { output, .. } => output.as_slice(),
            CallOutcome::Reverted { data, .. } => data.as_slice(),
            _ => return,
        };
        let mut pool = self.pool.borrow_mut();
        for word in data.chunks(32) {
            pool.add_literal(word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{u256_to_be, EVMU256};
    use revm::primitives::{B160, B256};

    #[test]
    fn test_sstore_values_are_mined() {
        let pool = Rc::new(RefCell::new(ValuePool::new()));
        let mut tracer = ValueGenTracer::new(pool.clone());
        tracer.on_opcode(&OpcodeCtx {
            pc: 10,
            opcode: OP_SSTORE,
            address: B160([1u8; 20]),
            code_hash: B256([2u8; 32]),
            is_init: false,
            code: &[],
            stack_top: Some(EVMU256::from(1u64)),
            stack_second: Some(EVMU256::from(0xbeefu64)),
        });
        assert!(pool
            .borrow()
            .words()
            .contains(&u256_to_be(EVMU256::from(0xbeefu64))));
    }

    #[test]
    fn test_log_mining_skips_topic0() {
        let pool = Rc::new(RefCell::new(ValuePool::new()));
        let mut tracer = ValueGenTracer::new(pool.clone());
        tracer.on_log(&RawLog {
            address: B160([1u8; 20]),
            topics: vec![B256([0xaa; 32]), B256([0xbb; 32])],
            data: vec![0x11; 32],
        });
        let pool = pool.borrow();
        assert!(!pool.words().contains(&[0xaa; 32]));
        assert!(pool.words().contains(&[0xbb; 32]));
        assert!(pool.words().contains(&[0x11; 32]));
    }

    #[test]
    fn test_return_data_is_mined() {
        let pool = Rc::new(RefCell::new(ValuePool::new()));
        let mut tracer = ValueGenTracer::new(pool.clone());
        tracer.on_tx_end(&CallOutcome::Success {
            output: u256_to_be(EVMU256::from(77u64)).to_vec(),
            created: None,
            gas_used: 21000,
            logs: vec![],
        });
        assert!(pool
            .borrow()
            .words()
            .contains(&u256_to_be(EVMU256::from(77u64))));
    }
}
