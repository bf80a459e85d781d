/// In-process EVM test chain: block assembly, snapshot/restore, tracer
/// multiplexing and cheatcode interception.
pub mod coverage;
pub mod db;
pub mod tracers;
pub mod valuegen;

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use std::sync::Arc;

use crate::accounts::FuzzerAccount;
use crate::cheatcodes::console::{self, CONSOLE_ADDRESS};
use crate::cheatcodes::{self, CheatCtx, CheatResult, CheatcodeState, CHEATCODE_ADDRESS};
use crate::fork::{ForkBackend, ForkError, ForkedStateProvider};
use crate::sequence::Call;
use crate::types::{EVMAddress, EVMU256, SnapshotId};
use db::ChainDb;
use tracers::{CallOutcome, FrameExit, FrameInfo, OpcodeCtx, RawLog, Tracer, TracerStack};

use revm::interpreter::{CallInputs, CreateInputs, Gas, InstructionResult, Interpreter};
use revm::primitives::{
    EVMError, Env, ExecutionResult, Halt, Output, SpecId, TransactTo, B160, B256, U256,
};
use revm::{DatabaseCommit, EVMData, Inspector, EVM};

const INITIAL_BALANCE_SHIFT: usize = 1;
pub const DEFAULT_GENESIS_TIMESTAMP: u64 = 1_600_000_000;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no pending block is open")]
    NoPendingBlock,
    #[error("a pending block is already open")]
    PendingBlockOpen,
    #[error("unknown snapshot id {0}")]
    UnknownSnapshot(SnapshotId),
    #[error("call names sender index {0} but only {1} accounts exist")]
    UnknownSender(u32, usize),
    #[error("evm execution failed: {0}")]
    Evm(String),
    #[error(transparent)]
    Fork(#[from] ForkError),
}

/// Executable form of one call, with the sender index resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallMessage {
    pub caller: EVMAddress,
    pub to: Option<EVMAddress>,
    pub value: EVMU256,
    pub gas: u64,
    pub gas_price: EVMU256,
    pub data: Vec<u8>,
}

impl CallMessage {
    pub fn resolve(call: &Call, accounts: &[FuzzerAccount]) -> Result<Self, ChainError> {
        let account = accounts
            .get(call.sender as usize)
            .ok_or(ChainError::UnknownSender(call.sender, accounts.len()))?;
        Ok(Self {
            caller: account.address,
            to: call.to,
            value: call.value,
            gas: call.gas,
            gas_price: call.gas_price,
            data: call.data.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct CommittedBlock {
    pub header: BlockHeader,
    pub messages: Vec<CallMessage>,
    pub results: Vec<CallOutcome>,
}

/// Events published by the chain. The bus is owned per chain replica and
/// subscribers are registered at build time: no process-global state.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    PendingBlockCommitted {
        header: BlockHeader,
        messages: Vec<CallMessage>,
        results: Vec<CallOutcome>,
    },
    RevertedToSnapshot {
        id: SnapshotId,
    },
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<Box<dyn FnMut(&ChainEvent)>>,
}

impl EventBus {
    pub fn subscribe(&mut self, subscriber: Box<dyn FnMut(&ChainEvent)>) {
        self.subscribers.push(subscriber);
    }

    fn publish(&mut self, event: &ChainEvent) {
        for subscriber in &mut self.subscribers {
            subscriber(event);
        }
    }
}

struct ChainSnapshot {
    id: SnapshotId,
    db: ChainDb,
    block_number: u64,
    timestamp: u64,
    committed_len: usize,
}

struct PendingBlock {
    header: BlockHeader,
    base_db: ChainDb,
    base_number: u64,
    base_timestamp: u64,
    /// snapshot frontier when the block was opened; discard reverts the
    /// fork provider to it
    base_scope: SnapshotId,
    messages: Vec<CallMessage>,
    results: Vec<CallOutcome>,
}

/// One worker's chain replica.
pub struct TestChain {
    db: ChainDb,
    backend: ForkBackend,
    tracers: TracerStack,
    cheats: CheatcodeState,
    events: EventBus,
    block_number: u64,
    timestamp: u64,
    next_snapshot_id: SnapshotId,
    /// id attributed to imports happening on the current frontier; always
    /// strictly greater than every live snapshot id
    scope_id: SnapshotId,
    snapshots: Vec<ChainSnapshot>,
    pending: Option<PendingBlock>,
    committed: Vec<CommittedBlock>,
}

impl TestChain {
    /// Build a chain over `backend` and pre-fund the sender set.
    pub fn new(backend: ForkBackend, accounts: &[FuzzerAccount]) -> Result<Self, ChainError> {
        let mut chain = Self {
            db: db::fresh(backend.clone()),
            backend,
            tracers: TracerStack::new(),
            cheats: CheatcodeState::default(),
            events: EventBus::default(),
            block_number: 0,
            timestamp: DEFAULT_GENESIS_TIMESTAMP,
            next_snapshot_id: 0,
            scope_id: 0,
            snapshots: vec![],
            pending: None,
            committed: vec![],
        };
        chain.advance_scope();
        let balance = U256::MAX >> INITIAL_BALANCE_SHIFT;
        for account in accounts {
            db::set_balance(&mut chain.db, account.address, balance)?;
        }
        Ok(chain)
    }

    pub fn attach_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracers.attach(tracer);
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn provider(&self) -> Option<&Arc<ForkedStateProvider>> {
        self.backend.provider()
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn db_entry_count(&self) -> usize {
        db::entry_count(&self.db)
    }

    pub fn has_pending_block(&self) -> bool {
        self.pending.is_some()
    }

    fn alloc_snapshot_id(&mut self) -> SnapshotId {
        self.next_snapshot_id += 1;
        self.next_snapshot_id
    }

    /// Imports after this point belong to a scope newer than every live
    /// snapshot, so reverting to any of them un-learns the imports.
    fn advance_scope(&mut self) {
        self.scope_id = self.alloc_snapshot_id();
        if let Some(provider) = self.backend.provider() {
            provider.set_current_snapshot(self.scope_id);
        }
    }

    /// `Empty → PendingOpen`.
    pub fn begin_pending_block(&mut self, number: u64, timestamp: u64) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockOpen);
        }
        let base_scope = self.scope_id;
        self.advance_scope();
        self.pending = Some(PendingBlock {
            header: BlockHeader {
                number: number.max(self.block_number + 1),
                timestamp: timestamp.max(self.timestamp + 1),
            },
            base_db: self.db.clone(),
            base_number: self.block_number,
            base_timestamp: self.timestamp,
            base_scope,
            messages: vec![],
            results: vec![],
        });
        Ok(())
    }

    /// Execute a call against committed state plus earlier pending calls.
    /// `PendingOpen → PendingOpen`.
    pub fn add_call(&mut self, message: CallMessage) -> Result<CallOutcome, ChainError> {
        if self.pending.is_none() {
            return Err(ChainError::NoPendingBlock);
        }
        let header = self
            .pending
            .as_ref()
            .map(|p| p.header.clone())
            .expect("pending checked above");
        let outcome = self.execute_message(&message, header.number, header.timestamp, true, true)?;
        let pending = self.pending.as_mut().expect("pending checked above");
        pending.messages.push(message);
        pending.results.push(outcome.clone());
        Ok(outcome)
    }

    /// `PendingOpen → Committed`: seal the block into history and publish
    /// `PendingBlockCommitted`.
    pub fn commit_pending_block(&mut self) -> Result<BlockHeader, ChainError> {
        let pending = self.pending.take().ok_or(ChainError::NoPendingBlock)?;
        let header = pending.header.clone();
        self.block_number = header.number;
        self.timestamp = header.timestamp;
        let block = CommittedBlock {
            header: header.clone(),
            messages: pending.messages,
            results: pending.results,
        };
        self.events.publish(&ChainEvent::PendingBlockCommitted {
            header: header.clone(),
            messages: block.messages.clone(),
            results: block.results.clone(),
        });
        self.committed.push(block);
        Ok(header)
    }

    /// Drop in-memory tentative work. Callable from any state; a no-op
    /// when no block is open.
    pub fn discard_pending_block(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.db = pending.base_db;
            self.block_number = pending.base_number;
            self.timestamp = pending.base_timestamp;
            if let Some(provider) = self.backend.provider() {
                provider.notify_reverted_to(pending.base_scope);
            }
            self.scope_id = pending.base_scope;
            self.advance_scope();
        }
    }

    /// Capture the committed chain tip. Snapshots form a stack of monotone
    /// ids.
    pub fn snapshot(&mut self) -> Result<SnapshotId, ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockOpen);
        }
        let id = self.alloc_snapshot_id();
        self.snapshots.push(ChainSnapshot {
            id,
            db: self.db.clone(),
            block_number: self.block_number,
            timestamp: self.timestamp,
            committed_len: self.committed.len(),
        });
        self.advance_scope();
        Ok(id)
    }

    /// Drop all blocks after snapshot `id` and un-learn the fork imports
    /// recorded since. The snapshot itself stays valid.
    pub fn revert_to(&mut self, id: SnapshotId) -> Result<(), ChainError> {
        self.discard_pending_block();
        let index = self
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or(ChainError::UnknownSnapshot(id))?;
        let snapshot = &self.snapshots[index];
        self.db = snapshot.db.clone();
        self.block_number = snapshot.block_number;
        self.timestamp = snapshot.timestamp;
        self.committed.truncate(snapshot.committed_len);
        self.snapshots.truncate(index + 1);
        if let Some(provider) = self.backend.provider() {
            provider.notify_reverted_to(id);
        }
        self.scope_id = id;
        self.advance_scope();
        self.events.publish(&ChainEvent::RevertedToSnapshot { id });
        Ok(())
    }

    /// Deploy a contract as its own block. Returns the created address and
    /// the raw outcome (a revert keeps the address empty).
    pub fn deploy(
        &mut self,
        deployer: EVMAddress,
        init_code: Vec<u8>,
        value: EVMU256,
    ) -> Result<(Option<EVMAddress>, CallOutcome), ChainError> {
        self.begin_pending_block(self.block_number + 1, self.timestamp + 1)?;
        let message = CallMessage {
            caller: deployer,
            to: None,
            value,
            gas: 30_000_000,
            gas_price: U256::ZERO,
            data: init_code,
        };
        let outcome = self.add_call(message)?;
        self.commit_pending_block()?;
        let created = match &outcome {
            CallOutcome::Success { created, .. } => *created,
            _ => None,
        };
        Ok((created, outcome))
    }

    /// Read-only call against the committed tip: no tracers, no commit, no
    /// block. Used for property and optimization evaluation.
    pub fn view_call(
        &mut self,
        caller: EVMAddress,
        to: EVMAddress,
        data: Vec<u8>,
    ) -> Result<CallOutcome, ChainError> {
        let message = CallMessage {
            caller,
            to: Some(to),
            value: U256::ZERO,
            gas: 30_000_000,
            gas_price: U256::ZERO,
            data,
        };
        self.execute_message(
            &message,
            self.block_number + 1,
            self.timestamp + 1,
            false,
            false,
        )
    }

    fn build_env(&self, message: &CallMessage, number: u64, timestamp: u64) -> Env {
        let mut env = Env::default();
        env.cfg.spec_id = SpecId::LATEST;
        env.block.number = U256::from(number);
        env.block.timestamp = U256::from(timestamp);
        env.block.coinbase = B160([0u8; 20]);
        env.block.difficulty = U256::ZERO;
        env.block.prevrandao = Some(B256::zero());
        env.block.basefee = U256::ZERO;
        env.block.gas_limit = U256::MAX;
        env.tx.caller = message.caller;
        env.tx.gas_limit = message.gas;
        env.tx.gas_price = message.gas_price;
        env.tx.gas_priority_fee = None;
        env.tx.transact_to = match message.to {
            Some(to) => TransactTo::Call(to),
            None => TransactTo::create(),
        };
        env.tx.value = message.value;
        env.tx.data = Bytes::from(message.data.clone());
        env.tx.chain_id = None;
        env.tx.nonce = None;
        env.tx.access_list = vec![];
        env
    }

    fn execute_message(
        &mut self,
        message: &CallMessage,
        number: u64,
        timestamp: u64,
        commit: bool,
        with_tracers: bool,
    ) -> Result<CallOutcome, ChainError> {
        let env = self.build_env(message, number, timestamp);
        let mut evm: EVM<ChainDb> = EVM::new();
        evm.env = env;
        evm.database(std::mem::replace(&mut self.db, db::fresh(ForkBackend::Local)));

        let run = if with_tracers {
            self.cheats.begin_tx();
            self.tracers.on_tx_start();
            let bridge = InspectorBridge {
                tracers: &mut self.tracers,
                cheats: &mut self.cheats,
                frames: vec![],
                pending_create: message.to.is_none(),
            };
            evm.inspect(bridge)
        } else {
            evm.transact()
        };

        // the env may have been warped/rolled by cheatcodes
        let block_env = evm.env.block.clone();
        self.db = evm.db.take().expect("database moved into evm above");

        let result_and_state = match run {
            Ok(result) => result,
            Err(EVMError::Database(fork_error)) => {
                if with_tracers {
                    self.cheats.end_tx();
                }
                return Err(ChainError::Fork(fork_error));
            }
            Err(e) => {
                if with_tracers {
                    self.cheats.end_tx();
                }
                return Err(ChainError::Evm(format!("{:?}", e)));
            }
        };

        let mut outcome = classify_result(result_and_state.result);
        if with_tracers {
            self.cheats.end_tx();
            if !self.cheats.violations.is_empty() {
                outcome = CallOutcome::CheatcodeViolation {
                    message: self.cheats.violations.join("; "),
                };
                self.cheats.violations.clear();
            }
            self.tracers.on_tx_end(&outcome);
        }

        if commit {
            if let Some(provider) = self.backend.provider() {
                for (address, account) in result_and_state.state.iter() {
                    for slot in account.storage.keys() {
                        provider.mark_slot_written(*address, *slot, self.scope_id);
                    }
                }
            }
            self.db.commit(result_and_state.state);
            if let Some(pending) = self.pending.as_mut() {
                pending.header.number =
                    u64::try_from(block_env.number).unwrap_or(pending.header.number);
                pending.header.timestamp =
                    u64::try_from(block_env.timestamp).unwrap_or(pending.header.timestamp);
            }
        }
        trace!("executed call to {:?}: {:?}", message.to, outcome_tag(&outcome));
        Ok(outcome)
    }
}

fn outcome_tag(outcome: &CallOutcome) -> &'static str {
    match outcome {
        CallOutcome::Success { .. } => "success",
        CallOutcome::Reverted { .. } => "reverted",
        CallOutcome::OutOfGas { .. } => "out-of-gas",
        CallOutcome::InvalidOpcode => "invalid-opcode",
        CallOutcome::Halted { .. } => "halted",
        CallOutcome::CheatcodeViolation { .. } => "cheatcode-violation",
    }
}

fn classify_result(result: ExecutionResult) -> CallOutcome {
    match result {
        ExecutionResult::Success {
            gas_used,
            logs,
            output,
            ..
        } => {
            let (data, created) = match output {
                Output::Call(data) => (data.to_vec(), None),
                Output::Create(data, address) => (data.to_vec(), address),
            };
            CallOutcome::Success {
                output: data,
                created,
                gas_used,
                logs: logs
                    .into_iter()
                    .map(|log| RawLog {
                        address: log.address,
                        topics: log.topics,
                        data: log.data.to_vec(),
                    })
                    .collect(),
            }
        }
        ExecutionResult::Revert { gas_used, output } => CallOutcome::Reverted {
            data: output.to_vec(),
            gas_used,
        },
        ExecutionResult::Halt { reason, gas_used } => match reason {
            Halt::OutOfGas(_) => CallOutcome::OutOfGas { gas_used },
            Halt::OpcodeNotFound | Halt::InvalidFEOpcode => CallOutcome::InvalidOpcode,
            other => CallOutcome::Halted {
                reason: format!("{:?}", other),
            },
        },
    }
}

struct FrameMeta {
    address: EVMAddress,
    code_hash: B256,
    is_init: bool,
    last_pc: usize,
}

/// Bridges revm's inspector hooks to the tracer pipeline and the
/// cheatcode precompiles. Owned for the duration of one transaction.
struct InspectorBridge<'a> {
    tracers: &'a mut TracerStack,
    cheats: &'a mut CheatcodeState,
    frames: Vec<FrameMeta>,
    /// the next interpreter frame runs init code
    pending_create: bool,
}

impl<'a> InspectorBridge<'a> {
    fn is_precompile_target(address: EVMAddress) -> bool {
        address == CHEATCODE_ADDRESS || address == CONSOLE_ADDRESS
    }

    fn pop_frame(&mut self, address: EVMAddress, reverted: bool, by_init: bool) {
        let matches_top = self
            .frames
            .last()
            .map(|f| if by_init { f.is_init } else { f.address == address })
            .unwrap_or(false);
        if matches_top {
            let frame = self.frames.pop().expect("top frame checked above");
            self.tracers.on_exit(&FrameExit {
                address: frame.address,
                code_hash: frame.code_hash,
                is_init: frame.is_init,
                reverted,
                last_pc: frame.last_pc,
            });
        }
    }
}

impl<'a> Inspector<ChainDb> for InspectorBridge<'a> {
    fn initialize_interp(
        &mut self,
        interp: &mut Interpreter,
        _data: &mut EVMData<'_, ChainDb>,
        _is_static: bool,
    ) -> InstructionResult {
        let frame = FrameMeta {
            address: interp.contract.address,
            code_hash: interp.contract.bytecode.hash(),
            is_init: std::mem::take(&mut self.pending_create),
            last_pc: 0,
        };
        self.tracers.on_enter(&FrameInfo {
            address: frame.address,
            code_hash: frame.code_hash,
            is_init: frame.is_init,
        });
        self.frames.push(frame);
        InstructionResult::Continue
    }

    fn step(
        &mut self,
        interp: &mut Interpreter,
        _data: &mut EVMData<'_, ChainDb>,
        _is_static: bool,
    ) -> InstructionResult {
        let pc = interp.program_counter();
        if let Some(frame) = self.frames.last_mut() {
            frame.last_pc = pc;
        }
        let ctx = OpcodeCtx {
            pc,
            opcode: interp.current_opcode(),
            address: interp.contract.address,
            code_hash: interp.contract.bytecode.hash(),
            is_init: self.frames.last().map(|f| f.is_init).unwrap_or(false),
            code: interp.contract.bytecode.original_bytecode_slice(),
            stack_top: interp.stack.peek(0).ok(),
            stack_second: interp.stack.peek(1).ok(),
        };
        self.tracers.on_opcode(&ctx);
        InstructionResult::Continue
    }

    fn log(
        &mut self,
        _evm_data: &mut EVMData<'_, ChainDb>,
        address: &B160,
        topics: &[B256],
        data: &Bytes,
    ) {
        let log = RawLog {
            address: *address,
            topics: topics.to_vec(),
            data: data.to_vec(),
        };
        self.cheats.observe_log(&log);
        self.tracers.on_log(&log);
    }

    fn call(
        &mut self,
        data: &mut EVMData<'_, ChainDb>,
        inputs: &mut CallInputs,
        _is_static: bool,
    ) -> (InstructionResult, Gas, Bytes) {
        if inputs.contract == CONSOLE_ADDRESS {
            console::log(&inputs.input);
            return (
                InstructionResult::Return,
                Gas::new(inputs.gas_limit),
                Bytes::new(),
            );
        }
        if inputs.contract == CHEATCODE_ADDRESS {
            let mut ctx = CheatCtx {
                env: data.env,
                db: data.db,
                state: self.cheats,
            };
            let calldata = inputs.input.clone();
            return match cheatcodes::dispatch(&mut ctx, &calldata) {
                CheatResult::Return(out) => (
                    InstructionResult::Return,
                    Gas::new(inputs.gas_limit),
                    Bytes::from(out),
                ),
                CheatResult::Revert(out) => (
                    InstructionResult::Revert,
                    Gas::new(inputs.gas_limit),
                    Bytes::from(out),
                ),
            };
        }
        // pranks only redirect calls made by contracts, not the top-level
        // sender
        if !self.frames.is_empty() {
            if let Some(prank) = self.cheats.prank.clone() {
                inputs.context.caller = prank.new_caller;
                inputs.transfer.source = prank.new_caller;
                if prank.single_call {
                    self.cheats.prank = None;
                }
            }
        }
        (InstructionResult::Continue, Gas::new(0), Bytes::new())
    }

    fn call_end(
        &mut self,
        _data: &mut EVMData<'_, ChainDb>,
        inputs: &CallInputs,
        remaining_gas: Gas,
        ret: InstructionResult,
        out: Bytes,
        _is_static: bool,
    ) -> (InstructionResult, Gas, Bytes) {
        if Self::is_precompile_target(inputs.contract) {
            return (ret, remaining_gas, out);
        }
        let reverted = ret == InstructionResult::Revert;
        // an armed expectRevert resolves against the next completed
        // sub-call
        if self.frames.len() >= 2 {
            if let Some(expected) = self.cheats.expected_revert.take() {
                self.pop_frame(inputs.context.address, reverted, false);
                return if reverted && expected.matches(&out) {
                    (InstructionResult::Return, remaining_gas, Bytes::new())
                } else {
                    self.cheats.violations.push(format!(
                        "expected revert was not observed on call to {:?}",
                        inputs.context.address
                    ));
                    (ret, remaining_gas, out)
                };
            }
        }
        self.pop_frame(inputs.context.address, reverted, false);
        (ret, remaining_gas, out)
    }

    fn create(
        &mut self,
        _data: &mut EVMData<'_, ChainDb>,
        _inputs: &mut CreateInputs,
    ) -> (InstructionResult, Option<B160>, Gas, Bytes) {
        self.pending_create = true;
        (InstructionResult::Continue, None, Gas::new(0), Bytes::new())
    }

    fn create_end(
        &mut self,
        _data: &mut EVMData<'_, ChainDb>,
        _inputs: &CreateInputs,
        ret: InstructionResult,
        address: Option<B160>,
        remaining_gas: Gas,
        out: Bytes,
    ) -> (InstructionResult, Option<B160>, Gas, Bytes) {
        let reverted = ret == InstructionResult::Revert;
        self.pop_frame(B160([0u8; 20]), reverted, true);
        (ret, address, remaining_gas, out)
    }
}
