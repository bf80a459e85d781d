/// Worker: owns one chain replica and runs the deploy → mutate → replay →
/// evaluate loop.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::abi::{decode_values, encode_call, AbiFunction, AbiValue};
use crate::accounts::FuzzerAccount;
use crate::cache::RemoteStateCache;
use crate::chain::tracers::CallOutcome;
use crate::chain::{
    coverage::CoverageTracer, valuegen::ValueGenTracer, CallMessage, ChainError, ChainEvent,
    TestChain,
};
use crate::contracts::ContractDefinition;
use crate::corpus::{Corpus, SequenceClass};
use crate::coverage::CoverageMap;
use crate::fork::{ForkBackend, ForkError, ForkedStateProvider};
use crate::mutator::{generate_value, mutate_sequence, mutate_value, ValuePool};
use crate::reverts::{classify_revert, is_assertion_failure, CallRevertRecord, RevertReport, RevertSender};
use crate::rpc::RpcClientPool;
use crate::sequence::{Call, CallSequence};
use crate::shrink::Shrinker;
use crate::testcase::{TestCaseId, TestCaseKind, TestCaseRegistry};
use crate::types::{be_to_u256, keccak, CancelToken, EVMAddress, EVMU256, SnapshotId};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("no contract deployed successfully")]
    NothingDeployed,
}

/// Per-iteration metrics delta, reported through the supervisor's channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsDelta {
    pub calls: u64,
    pub sequences: u64,
    pub failures: u64,
    pub gas: u64,
    pub new_bits: u64,
    /// +1 entering shrink, -1 leaving
    pub shrinking: i64,
}

/// Campaign-wide collaborators shared by every worker.
#[derive(Clone)]
pub struct WorkerShared {
    pub accounts: Arc<Vec<FuzzerAccount>>,
    pub contracts: Arc<Vec<ContractDefinition>>,
    pub corpus: Arc<Corpus>,
    pub global_coverage: Arc<Mutex<CoverageMap>>,
    pub global_pool: Arc<Mutex<ValuePool>>,
    pub registry: Arc<Mutex<TestCaseRegistry>>,
    pub metrics: Sender<MetricsDelta>,
    pub token: Arc<CancelToken>,
    pub fork: Option<(Arc<RemoteStateCache>, Arc<RpcClientPool>)>,
    pub settings: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub campaign_seed: u64,
    pub max_tx_sequence_length: usize,
    pub worker_database_entry_limit: usize,
    pub shrink_limit: usize,
    pub fail_fast: bool,
}

/// Fixed derivation of the per-worker RNG seed from the campaign seed.
fn worker_seed(campaign_seed: u64, index: usize) -> u64 {
    let mut material = campaign_seed.to_be_bytes().to_vec();
    material.extend_from_slice(&(index as u64).to_be_bytes());
    let digest = keccak(&material);
    u64::from_be_bytes(digest[..8].try_into().expect("8-byte slice"))
}

struct DeployedTarget {
    address: EVMAddress,
    name: String,
    functions: Vec<AbiFunction>,
}

struct FailureHit {
    case: TestCaseId,
    message: String,
}

/// Thread body. Runs chain instances back to back: an instance ends when
/// the state database outgrows its entry limit (worker recycling) or the
/// campaign is cancelled.
pub fn run_worker(
    index: usize,
    shared: WorkerShared,
    revert_sender: Option<RevertSender>,
) -> Result<(), WorkerError> {
    let revert_sender = revert_sender.map(|s| Rc::new(RefCell::new(s)));
    let mut rng = StdRng::seed_from_u64(worker_seed(shared.settings.campaign_seed, index));
    while !shared.token.is_cancelled() {
        let outcome = WorkerInstance::build(index, &shared, revert_sender.clone(), &mut rng)
            .and_then(|mut instance| instance.run(&mut rng));
        if let Err(e) = outcome {
            // a worker dying is fatal for the campaign; tear it down
            shared.token.cancel();
            return Err(e);
        }
    }
    debug!("worker {} exited", index);
    Ok(())
}

struct WorkerInstance<'a> {
    index: usize,
    shared: &'a WorkerShared,
    chain: TestChain,
    targets: Vec<DeployedTarget>,
    post_deploy: SnapshotId,
    local_coverage: Rc<RefCell<CoverageMap>>,
    local_pool: Rc<RefCell<ValuePool>>,
    property_cases: Vec<(TestCaseId, AbiFunction)>,
    optimization_cases: Vec<(TestCaseId, AbiFunction)>,
    iterations: u64,
}

impl<'a> WorkerInstance<'a> {
    fn build(
        index: usize,
        shared: &'a WorkerShared,
        revert_sender: Option<Rc<RefCell<RevertSender>>>,
        rng: &mut StdRng,
    ) -> Result<Self, WorkerError> {
        let backend = match &shared.fork {
            Some((cache, pool)) => ForkBackend::Forked(Arc::new(ForkedStateProvider::new(
                cache.clone(),
                pool.client_for(index),
                shared.token.clone(),
            ))),
            None => ForkBackend::Local,
        };
        let mut chain = TestChain::new(backend, &shared.accounts)?;

        let local_coverage = Rc::new(RefCell::new(CoverageMap::new()));
        let local_pool = Rc::new(RefCell::new(ValuePool::new()));
        {
            let mut pool = local_pool.borrow_mut();
            for contract in shared.contracts.iter() {
                for literal in &contract.literals {
                    pool.add_literal(literal);
                }
            }
            for account in shared.accounts.iter() {
                pool.add_address(account.address);
            }
            shared
                .global_pool
                .lock()
                .expect("value pool lock poisoned")
                .merge_into(&mut pool);
        }
        chain.attach_tracer(Box::new(CoverageTracer::new(local_coverage.clone())));
        chain.attach_tracer(Box::new(ValueGenTracer::new(local_pool.clone())));

        if let Some(sender) = revert_sender {
            chain.events_mut().subscribe(Box::new(move |event| {
                if let ChainEvent::PendingBlockCommitted {
                    messages, results, ..
                } = event
                {
                    let records = messages
                        .iter()
                        .zip(results)
                        .filter_map(|(message, result)| {
                            // creations carry init code, not a selector
                            message.to?;
                            let data = &message.data;
                            if data.len() < 4 {
                                return None;
                            }
                            let mut selector = [0u8; 4];
                            selector.copy_from_slice(&data[..4]);
                            Some(CallRevertRecord {
                                selector,
                                reverted: matches!(result, CallOutcome::Reverted { .. }),
                                reason: result.revert_data().map(classify_revert),
                            })
                        })
                        .collect();
                    sender.borrow_mut().send(RevertReport { records });
                }
            }));
        }

        // deploy targets; constructor reverts drop the target with a warning
        let deployer = shared.accounts[0].address;
        let mut targets = vec![];
        let local_pool_snapshot = local_pool.borrow().clone();
        for contract in shared.contracts.iter() {
            let mut init_code = contract.init_code.clone();
            if let Some(ctor_inputs) = &contract.abi.constructor {
                let args: Vec<AbiValue> = ctor_inputs
                    .iter()
                    .map(|ty| generate_value(ty, rng, &local_pool_snapshot, &sender_addresses(&shared.accounts)))
                    .collect();
                init_code.extend_from_slice(&crate::abi::encode_values(&args));
            }
            match chain.deploy(deployer, init_code, EVMU256::ZERO)? {
                (Some(address), outcome) if outcome.is_success() => {
                    debug!(
                        "worker {}: deployed {} at 0x{}",
                        index,
                        contract.name,
                        hex::encode(address.0)
                    );
                    let mut registry = shared.registry.lock().expect("registry lock poisoned");
                    registry.register_contract(address, &contract.name, &contract.abi);
                    targets.push(DeployedTarget {
                        address,
                        name: contract.name.clone(),
                        functions: contract
                            .abi
                            .functions
                            .iter()
                            .filter(|f| !f.is_view)
                            .cloned()
                            .collect(),
                    });
                }
                (_, outcome) => {
                    warn!(
                        "worker {}: dropping target {}: deployment failed ({:?})",
                        index, contract.name, outcome
                    );
                }
            }
        }
        if targets.is_empty() {
            return Err(WorkerError::NothingDeployed);
        }

        let (property_cases, optimization_cases) = {
            let mut registry = shared.registry.lock().expect("registry lock poisoned");
            registry.start_all();
            (
                registry.cases_of_kind(TestCaseKind::Property),
                registry.cases_of_kind(TestCaseKind::Optimization),
            )
        };

        let post_deploy = chain.snapshot()?;
        Ok(Self {
            index,
            shared,
            chain,
            targets,
            post_deploy,
            local_coverage,
            local_pool,
            property_cases,
            optimization_cases,
            iterations: 0,
        })
    }

    fn run(&mut self, rng: &mut StdRng) -> Result<(), WorkerError> {
        loop {
            if self.shared.token.is_cancelled() {
                return Ok(());
            }
            self.iteration(rng)?;
            self.iterations += 1;
            if self.chain.db_entry_count() > self.shared.settings.worker_database_entry_limit {
                info!(
                    "worker {}: database entry limit reached, recycling chain",
                    self.index
                );
                return Ok(());
            }
        }
    }

    fn iteration(&mut self, rng: &mut StdRng) -> Result<(), WorkerError> {
        let mut sequence = match self.shared.corpus.draw_seed(rng) {
            Some(seed) => seed,
            None => self.fresh_sequence(rng),
        };
        self.mutate(&mut sequence, rng);
        if sequence.is_empty() {
            return Ok(());
        }

        let mut delta = MetricsDelta {
            sequences: 1,
            ..MetricsDelta::default()
        };
        let (executed_fully, failure) = self.execute_sequence(&sequence, &mut delta)?;
        self.chain.revert_to(self.post_deploy)?;

        // merge this sequence's bits; the lock serializes the new-bit claim
        let local = std::mem::take(&mut *self.local_coverage.borrow_mut());
        let new_bits = self
            .shared
            .global_coverage
            .lock()
            .expect("coverage lock poisoned")
            .merge(&local);
        delta.new_bits = new_bits;

        match failure {
            Some(hit) => {
                delta.failures = 1;
                let first_hit = !self
                    .shared
                    .registry
                    .lock()
                    .expect("registry lock poisoned")
                    .is_failed(hit.case);
                // a failed property would trip on every later sequence;
                // stop evaluating it
                self.property_cases.retain(|(id, _)| *id != hit.case);
                if first_hit {
                    let _ = self.shared.metrics.send(MetricsDelta {
                        shrinking: 1,
                        ..MetricsDelta::default()
                    });
                    let witness = self.shrink_witness(sequence, &hit);
                    let _ = self.shared.metrics.send(MetricsDelta {
                        shrinking: -1,
                        ..MetricsDelta::default()
                    });
                    info!(
                        "worker {}: test case failed: {} (witness of {} calls)",
                        self.index,
                        hit.message,
                        witness.len()
                    );
                    self.shared
                        .corpus
                        .submit(witness.clone(), SequenceClass::Witness);
                    self.shared
                        .registry
                        .lock()
                        .expect("registry lock poisoned")
                        .record_failure(hit.case, witness, hit.message);
                    if self.shared.settings.fail_fast {
                        self.shared.token.cancel();
                    }
                }
            }
            None => {
                if executed_fully && new_bits > 0 {
                    self.shared.corpus.submit(sequence, SequenceClass::Seed);
                }
            }
        }

        let _ = self.shared.metrics.send(delta);

        // periodic two-way literal pool sync
        if self.iterations % 16 == 15 {
            let mut global = self
                .shared
                .global_pool
                .lock()
                .expect("value pool lock poisoned");
            self.local_pool.borrow().merge_into(&mut global);
            global.merge_into(&mut self.local_pool.borrow_mut());
        }
        Ok(())
    }

    /// Execute every call of the sequence on top of the post-deploy
    /// snapshot, evaluating test cases along the way. Returns whether the
    /// whole sequence executed (RPC faults cut it short) and the first
    /// failure, if any.
    fn execute_sequence(
        &mut self,
        sequence: &CallSequence,
        delta: &mut MetricsDelta,
    ) -> Result<(bool, Option<FailureHit>), WorkerError> {
        for call in &sequence.calls {
            // corpus entries from an earlier campaign may name more
            // accounts than this one has
            let Ok(message) = CallMessage::resolve(call, &self.shared.accounts) else {
                return Ok((false, None));
            };
            let number = self.chain.block_number() + call.block_delay.max(1) as u64;
            let timestamp = self.chain.timestamp() + call.time_delay.max(1) as u64;
            self.chain.begin_pending_block(number, timestamp)?;
            let outcome = match self.chain.add_call(message) {
                Ok(outcome) => outcome,
                Err(ChainError::Fork(ForkError::Rpc(e))) => {
                    // remote import failed after retries: the call counts
                    // as reverted and the sequence is not corpus material
                    warn!("worker {}: remote state import failed: {}", self.index, e);
                    self.chain.discard_pending_block();
                    return Ok((false, None));
                }
                Err(e) => return Err(e.into()),
            };
            self.chain.commit_pending_block()?;
            delta.calls += 1;
            delta.gas += outcome.gas_used();

            if let Some(hit) = self.assertion_failure(call, &outcome) {
                return Ok((true, Some(hit)));
            }
            if let Some(hit) = self.property_failure()? {
                return Ok((true, Some(hit)));
            }
        }
        self.sample_optimizations()?;
        Ok((true, None))
    }

    /// A revert carrying the assertion panic code fails the assertion case
    /// of the called method; cheatcode violations fail it too.
    fn assertion_failure(&self, call: &Call, outcome: &CallOutcome) -> Option<FailureHit> {
        let to = call.to?;
        let selector = call.selector()?;
        let target = self.targets.iter().find(|t| t.address == to)?;
        let function = target.functions.iter().find(|f| f.selector == selector)?;
        // only methods the registry tracks as assertion cases can fail
        if !function.outputs.is_empty() {
            return None;
        }
        match outcome {
            CallOutcome::Reverted { data, .. } if is_assertion_failure(data) => Some(FailureHit {
                case: (to, selector),
                message: format!("assertion failed in {}.{}", target.name, function.signature),
            }),
            CallOutcome::CheatcodeViolation { message } => Some(FailureHit {
                case: (to, selector),
                message: format!(
                    "cheatcode violation in {}.{}: {}",
                    target.name, function.signature, message
                ),
            }),
            _ => None,
        }
    }

    /// Properties must hold after every call: a false return or a revert
    /// is a failure.
    fn property_failure(&mut self) -> Result<Option<FailureHit>, WorkerError> {
        let caller = self.shared.accounts[0].address;
        for ((contract, selector), function) in &self.property_cases {
            if property_violated(&mut self.chain, caller, *contract, *selector)? {
                return Ok(Some(FailureHit {
                    case: (*contract, *selector),
                    message: format!("property {} violated", function.signature),
                }));
            }
        }
        Ok(None)
    }

    fn sample_optimizations(&mut self) -> Result<(), WorkerError> {
        if self.optimization_cases.is_empty() {
            return Ok(());
        }
        let caller = self.shared.accounts[0].address;
        for ((contract, selector), _function) in &self.optimization_cases {
            let outcome =
                self.chain
                    .view_call(caller, *contract, encode_call(*selector, &[]))?;
            if let Some(output) = outcome.output() {
                if output.len() >= 32 {
                    let value = be_to_u256(&output[..32]);
                    self.shared
                        .registry
                        .lock()
                        .expect("registry lock poisoned")
                        .record_optimization((*contract, *selector), value);
                }
            }
        }
        Ok(())
    }

    fn shrink_witness(&mut self, witness: CallSequence, hit: &FailureHit) -> CallSequence {
        let shrinker = Shrinker::new(self.shared.settings.shrink_limit);
        let accounts = self.shared.accounts.clone();
        let case = hit.case;
        let is_property = self
            .property_cases
            .iter()
            .any(|(id, _)| *id == case);
        let caller = accounts[0].address;

        let chain = &mut self.chain;
        let post_deploy = self.post_deploy;
        let targets = &self.targets;
        let mut oracle = |candidate: &CallSequence| -> bool {
            replay_triggers_failure(
                chain,
                post_deploy,
                candidate,
                &accounts,
                caller,
                case,
                is_property,
            )
            .unwrap_or(false)
        };

        let simplify = |call: &Call| simplify_call(call, targets);
        let outcome = shrinker.shrink(witness, &mut oracle, simplify);
        // leave the chain on the clean snapshot for the caller
        let _ = self.chain.revert_to(self.post_deploy);
        outcome.witness
    }

    fn fresh_sequence(&self, rng: &mut StdRng) -> CallSequence {
        let cap = self.shared.settings.max_tx_sequence_length;
        let length = rng.gen_range(1..=4usize.min(cap).max(1));
        let calls = (0..length)
            .filter_map(|_| self.random_call(rng))
            .collect();
        CallSequence::new(calls)
    }

    fn random_call(&self, rng: &mut StdRng) -> Option<Call> {
        let target = &self.targets[rng.gen_range(0..self.targets.len())];
        if target.functions.is_empty() {
            return None;
        }
        let function = &target.functions[rng.gen_range(0..target.functions.len())];
        let pool = self.local_pool.borrow();
        let senders = sender_addresses(&self.shared.accounts);
        let args: Vec<AbiValue> = function
            .inputs
            .iter()
            .map(|ty| generate_value(ty, rng, &pool, &senders))
            .collect();
        let mut call = Call::to_contract(
            rng.gen_range(0..self.shared.accounts.len()) as u32,
            target.address,
            encode_call(function.selector, &args),
        );
        if function.is_payable && rng.gen_bool(0.25) {
            call.value = EVMU256::from(rng.gen_range(0..=1_000_000u64));
        }
        call.block_delay = rng.gen_range(1..=4);
        call.time_delay = rng.gen_range(1..=600);
        Some(call)
    }

    fn mutate(&self, sequence: &mut CallSequence, rng: &mut StdRng) {
        let targets = &self.targets;
        let pool = self.local_pool.borrow().clone();
        let senders = sender_addresses(&self.shared.accounts);
        let max_len = self.shared.settings.max_tx_sequence_length;
        let account_count = self.shared.accounts.len();

        let tweak = |call: &mut Call, rng: &mut StdRng| {
            let Some(selector) = call.selector() else {
                return;
            };
            let Some(function) = targets
                .iter()
                .find(|t| Some(t.address) == call.to)
                .and_then(|t| t.functions.iter().find(|f| f.selector == selector))
            else {
                return;
            };
            if function.inputs.is_empty() {
                return;
            }
            let Ok(mut args) = decode_values(&function.inputs, &call.data[4..]) else {
                return;
            };
            let victim = rng.gen_range(0..args.len());
            mutate_value(&mut args[victim], rng, &pool, &senders);
            call.data = encode_call(selector, &args);
        };
        let fresh = |rng: &mut StdRng| self.random_call(rng);
        mutate_sequence(sequence, rng, max_len, account_count, tweak, fresh);
    }
}

fn sender_addresses(accounts: &[FuzzerAccount]) -> Vec<EVMAddress> {
    accounts.iter().map(|a| a.address).collect()
}

fn property_violated(
    chain: &mut TestChain,
    caller: EVMAddress,
    contract: EVMAddress,
    selector: [u8; 4],
) -> Result<bool, WorkerError> {
    let outcome = chain.view_call(caller, contract, encode_call(selector, &[]))?;
    Ok(match outcome {
        CallOutcome::Success { output, .. } => {
            output.len() < 32 || output[..32].iter().all(|b| *b == 0)
        }
        CallOutcome::Reverted { .. } => true,
        _ => true,
    })
}

/// Replay a shrink candidate from the clean snapshot and check whether the
/// targeted case still fails.
#[allow(clippy::too_many_arguments)]
fn replay_triggers_failure(
    chain: &mut TestChain,
    post_deploy: SnapshotId,
    candidate: &CallSequence,
    accounts: &[FuzzerAccount],
    caller: EVMAddress,
    case: TestCaseId,
    is_property: bool,
) -> Result<bool, WorkerError> {
    chain.revert_to(post_deploy)?;
    let mut triggered = false;
    for call in &candidate.calls {
        let message = match CallMessage::resolve(call, accounts) {
            Ok(message) => message,
            Err(_) => break,
        };
        let number = chain.block_number() + call.block_delay.max(1) as u64;
        let timestamp = chain.timestamp() + call.time_delay.max(1) as u64;
        chain.begin_pending_block(number, timestamp)?;
        let outcome = match chain.add_call(message) {
            Ok(outcome) => outcome,
            Err(ChainError::Fork(ForkError::Rpc(_))) => {
                chain.discard_pending_block();
                break;
            }
            Err(e) => return Err(e.into()),
        };
        chain.commit_pending_block()?;

        if is_property {
            if property_violated(chain, caller, case.0, case.1)? {
                triggered = true;
                break;
            }
        } else if call.to == Some(case.0) && call.selector() == Some(case.1) {
            let failed = match &outcome {
                CallOutcome::Reverted { data, .. } => is_assertion_failure(data),
                CallOutcome::CheatcodeViolation { .. } => true,
                _ => false,
            };
            if failed {
                triggered = true;
                break;
            }
        }
    }
    chain.revert_to(post_deploy)?;
    Ok(triggered)
}

/// Zero/min/shorter-bytes canonical forms of one call's arguments, one
/// argument at a time.
fn simplify_call(call: &Call, targets: &[DeployedTarget]) -> Vec<Call> {
    let Some(selector) = call.selector() else {
        return vec![];
    };
    let Some(function) = targets
        .iter()
        .find(|t| Some(t.address) == call.to)
        .and_then(|t| t.functions.iter().find(|f| f.selector == selector))
    else {
        return vec![];
    };
    if function.inputs.is_empty() {
        return vec![];
    }
    let Ok(args) = decode_values(&function.inputs, &call.data[4..]) else {
        return vec![];
    };
    let mut candidates = vec![];
    for index in 0..args.len() {
        let canonical = function.inputs[index].default_value();
        if args[index] == canonical {
            continue;
        }
        let mut simpler = args.clone();
        simpler[index] = canonical;
        let mut candidate = call.clone();
        candidate.data = encode_call(selector, &simpler);
        candidates.push(candidate);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_seed_derivation_is_fixed() {
        assert_eq!(worker_seed(0xdead, 0), worker_seed(0xdead, 0));
        assert_ne!(worker_seed(0xdead, 0), worker_seed(0xdead, 1));
        assert_ne!(worker_seed(0xdead, 0), worker_seed(0xbeef, 0));
    }

    #[test]
    fn test_simplify_call_produces_zeroed_args() {
        let function = AbiFunction {
            name: "setX".into(),
            inputs: vec![crate::abi::AbiType::Uint(256)],
            outputs: vec![],
            is_view: false,
            is_payable: false,
            selector: [1, 2, 3, 4],
            signature: "setX(uint256)".into(),
        };
        let address = crate::types::fixed_address("00000000000000000000000000000000000000dd");
        let targets = vec![DeployedTarget {
            address,
            name: "T".into(),
            functions: vec![function],
        }];
        let call = Call::to_contract(
            0,
            address,
            encode_call([1, 2, 3, 4], &[AbiValue::Uint(EVMU256::from(77u64), 256)]),
        );
        let candidates = simplify_call(&call, &targets);
        assert_eq!(candidates.len(), 1);
        let args = decode_values(
            &[crate::abi::AbiType::Uint(256)],
            &candidates[0].data[4..],
        )
        .unwrap();
        assert_eq!(args[0], AbiValue::Uint(EVMU256::ZERO, 256));
    }
}
