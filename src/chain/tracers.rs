/// Tracer pipeline: hooks dispatched by the chain's inspector in
/// registration order. Tracers never hold the chain; each hook borrows its
/// context for the duration of the call.
use crate::types::{EVMAddress, EVMHash, EVMU256};

/// Result of one top-level call, as a closed variant set. Reverts carry
/// their raw payload; only payloads with selector data are assertion
/// candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success {
        output: Vec<u8>,
        created: Option<EVMAddress>,
        gas_used: u64,
        logs: Vec<RawLog>,
    },
    Reverted {
        data: Vec<u8>,
        gas_used: u64,
    },
    OutOfGas {
        gas_used: u64,
    },
    InvalidOpcode,
    Halted {
        reason: String,
    },
    /// a cheatcode expectation was not met (e.g. expected revert missing)
    CheatcodeViolation {
        message: String,
    },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }

    pub fn revert_data(&self) -> Option<&[u8]> {
        match self {
            CallOutcome::Reverted { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn gas_used(&self) -> u64 {
        match self {
            CallOutcome::Success { gas_used, .. }
            | CallOutcome::Reverted { gas_used, .. }
            | CallOutcome::OutOfGas { gas_used } => *gas_used,
            _ => 0,
        }
    }

    pub fn output(&self) -> Option<&[u8]> {
        match self {
            CallOutcome::Success { output, .. } => Some(output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: EVMAddress,
    pub topics: Vec<EVMHash>,
    pub data: Vec<u8>,
}

/// Per-opcode context handed to `on_opcode`.
pub struct OpcodeCtx<'a> {
    pub pc: usize,
    pub opcode: u8,
    pub address: EVMAddress,
    pub code_hash: EVMHash,
    pub is_init: bool,
    pub code: &'a [u8],
    pub stack_top: Option<EVMU256>,
    pub stack_second: Option<EVMU256>,
}

#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub address: EVMAddress,
    pub code_hash: EVMHash,
    pub is_init: bool,
}

#[derive(Debug, Clone)]
pub struct FrameExit {
    pub address: EVMAddress,
    pub code_hash: EVMHash,
    pub is_init: bool,
    pub reverted: bool,
    /// pc of the last executed instruction of the frame (the revert site
    /// when `reverted`)
    pub last_pc: usize,
}

pub trait Tracer {
    fn on_tx_start(&mut self) {}
    fn on_enter(&mut self, _frame: &FrameInfo) {}
    fn on_opcode(&mut self, _ctx: &OpcodeCtx<'_>) {}
    fn on_log(&mut self, _log: &RawLog) {}
    fn on_exit(&mut self, _exit: &FrameExit) {}
    fn on_tx_end(&mut self, _outcome: &CallOutcome) {}
}

/// Tracers in registration order; the chain dispatches to each in turn.
#[derive(Default)]
pub struct TracerStack {
    tracers: Vec<Box<dyn Tracer>>,
}

impl TracerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, tracer: Box<dyn Tracer>) {
        self.tracers.push(tracer);
    }

    pub fn len(&self) -> usize {
        self.tracers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracers.is_empty()
    }

    pub fn on_tx_start(&mut self) {
        for tracer in &mut self.tracers {
            tracer.on_tx_start();
        }
    }

    pub fn on_enter(&mut self, frame: &FrameInfo) {
        for tracer in &mut self.tracers {
            tracer.on_enter(frame);
        }
    }

    pub fn on_opcode(&mut self, ctx: &OpcodeCtx<'_>) {
        for tracer in &mut self.tracers {
            tracer.on_opcode(ctx);
        }
    }

    pub fn on_log(&mut self, log: &RawLog) {
        for tracer in &mut self.tracers {
            tracer.on_log(log);
        }
    }

    pub fn on_exit(&mut self, exit: &FrameExit) {
        for tracer in &mut self.tracers {
            tracer.on_exit(exit);
        }
    }

    pub fn on_tx_end(&mut self, outcome: &CallOutcome) {
        for tracer in &mut self.tracers {
            tracer.on_tx_end(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        label: &'static str,
        order: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Tracer for Recorder {
        fn on_tx_start(&mut self) {
            self.order.borrow_mut().push(self.label);
        }
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let order = Rc::new(RefCell::new(vec![]));
        let mut stack = TracerStack::new();
        stack.attach(Box::new(Recorder {
            label: "first",
            order: order.clone(),
        }));
        stack.attach(Box::new(Recorder {
            label: "second",
            order: order.clone(),
        }));
        stack.on_tx_start();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }
}
