/// Fuzzer supervisor: owns the worker cohort, global maps and shutdown
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use crossbeam::channel::unbounded;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};

use crate::abi::decode_values;
use crate::accounts::{build_accounts, FuzzerAccount};
use crate::cache::RemoteStateCache;
use crate::config::{CompilationConfig, FuzzConfig};
use crate::contracts::{ContractDefinition, ContractLoader};
use crate::corpus::Corpus;
use crate::coverage::CoverageMap;
use crate::mutator::ValuePool;
use crate::reverts::{write_artifacts, RevertAggregator};
use crate::rpc::{RpcClientPool, DEFAULT_MAX_RETRIES};
use crate::sequence::{Call, CallSequence};
use crate::testcase::{TestCaseRegistry, TestCaseStatus};
use crate::types::CancelToken;
use crate::worker::{run_worker, MetricsDelta, WorkerSettings, WorkerShared};

/// exit code signalled when at least one test case failed
pub const EXIT_TEST_FAILED: i32 = 7;

/// Global campaign counters; all monotone except the shrinking gauge.
#[derive(Debug, Default)]
pub struct CampaignMetrics {
    pub calls_tested: AtomicU64,
    pub sequences_tested: AtomicU64,
    pub failed_sequences: AtomicU64,
    pub gas_used: AtomicU64,
    pub branches_hit: AtomicU64,
    pub workers_shrinking: AtomicI64,
}

impl CampaignMetrics {
    fn fold(&self, delta: &MetricsDelta) {
        self.calls_tested.fetch_add(delta.calls, Ordering::Relaxed);
        self.sequences_tested.fetch_add(delta.sequences, Ordering::Relaxed);
        self.failed_sequences.fetch_add(delta.failures, Ordering::Relaxed);
        self.gas_used.fetch_add(delta.gas, Ordering::Relaxed);
        self.branches_hit.fetch_add(delta.new_bits, Ordering::Relaxed);
        self.workers_shrinking.fetch_add(delta.shrinking, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct CaseSummary {
    pub contract: String,
    pub signature: String,
    pub status: TestCaseStatus,
    pub message: Option<String>,
    pub witness: Option<CallSequence>,
}

#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub calls_tested: u64,
    pub sequences_tested: u64,
    pub failed_sequences: u64,
    pub gas_used: u64,
    pub branches_hit: u64,
    pub corpus_entries: usize,
    pub cases: Vec<CaseSummary>,
    pub exit_code: i32,
}

pub struct Fuzzer {
    config: FuzzConfig,
    accounts: Arc<Vec<FuzzerAccount>>,
    contracts: Arc<Vec<ContractDefinition>>,
    campaign_seed: u64,
    token: Arc<CancelToken>,
    metrics: Arc<CampaignMetrics>,
    registry: Arc<Mutex<TestCaseRegistry>>,
}

impl Fuzzer {
    pub fn new(config: FuzzConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let contracts = match &config.compilation {
            CompilationConfig::DirectCompiler { artifact_directory } => {
                ContractLoader::from_artifact_dir(artifact_directory)?
            }
            CompilationConfig::ProjectToolchain { combined_json } => {
                ContractLoader::from_combined_json(combined_json)?
            }
        };
        let campaign_seed = config.fuzzing.campaign_seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        });
        let mut rng = StdRng::seed_from_u64(campaign_seed);
        let accounts = build_accounts(config.accounts.generate, &config.accounts.keys, &mut rng)?;
        info!(
            "campaign seed 0x{:x}: {} contracts, {} accounts, {} workers",
            campaign_seed,
            contracts.contracts.len(),
            accounts.len(),
            config.fuzzing.workers
        );
        let registry = TestCaseRegistry::new(config.fuzzing.test_prefixes.clone());
        Ok(Self {
            config,
            accounts: Arc::new(accounts),
            contracts: Arc::new(contracts.contracts),
            campaign_seed,
            token: Arc::new(CancelToken::new()),
            metrics: Arc::new(CampaignMetrics::default()),
            registry: Arc::new(Mutex::new(registry)),
        })
    }

    /// Request shutdown. Idempotent: returns true only on the first call.
    /// Workers stop at their next iteration boundary, never mid-call.
    pub fn stop(&self) -> bool {
        self.token.cancel()
    }

    pub fn cancel_token(&self) -> Arc<CancelToken> {
        self.token.clone()
    }

    pub fn metrics(&self) -> Arc<CampaignMetrics> {
        self.metrics.clone()
    }

    /// Run the campaign to completion and emit the final report.
    pub fn run(&self) -> anyhow::Result<CampaignReport> {
        let corpus = Arc::new(
            Corpus::open(self.config.fuzzing.corpus_directory.clone())
                .context("opening corpus directory")?,
        );
        info!("corpus loaded with {} active sequences", corpus.active_count());

        let mut cache_lifecycle = None;
        let fork = if self.config.fork.enabled {
            let cache = Arc::new(RemoteStateCache::open(
                &self.config.fork.cache_directory,
                &self.config.fork.rpc_url,
                self.config.fork.block_height,
            )?);
            cache_lifecycle = Some(cache.spawn_lifecycle(self.token.clone()));
            let pool = Arc::new(RpcClientPool::new(
                &self.config.fork.rpc_url,
                self.config.fork.block_height,
                self.config.fork.pool_size,
                DEFAULT_MAX_RETRIES,
            ));
            Some((cache, pool))
        } else {
            None
        };

        let aggregator = if self.config.fuzzing.reversion_reporter.enabled {
            Some(RevertAggregator::spawn(self.token.clone()))
        } else {
            None
        };

        let (metrics_tx, metrics_rx) = unbounded::<MetricsDelta>();
        let global_coverage = Arc::new(Mutex::new(CoverageMap::new()));
        let global_pool = Arc::new(Mutex::new(ValuePool::new()));

        let shared = WorkerShared {
            accounts: self.accounts.clone(),
            contracts: self.contracts.clone(),
            corpus: corpus.clone(),
            global_coverage: global_coverage.clone(),
            global_pool,
            registry: self.registry.clone(),
            metrics: metrics_tx,
            token: self.token.clone(),
            fork,
            settings: WorkerSettings {
                campaign_seed: self.campaign_seed,
                max_tx_sequence_length: self.config.fuzzing.max_tx_sequence_length,
                worker_database_entry_limit: self.config.fuzzing.worker_database_entry_limit,
                shrink_limit: self.config.fuzzing.shrink_limit,
                fail_fast: self.config.fuzzing.fail_fast,
            },
        };

        let mut handles = vec![];
        for index in 0..self.config.fuzzing.workers {
            let shared = shared.clone();
            let revert_sender = aggregator.as_ref().map(|a| a.sender());
            let handle = std::thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || run_worker(index, shared, revert_sender))
                .context("spawning worker thread")?;
            handles.push(handle);
        }
        // the supervisor's own copies must go so the metrics channel
        // disconnects once every worker exits
        drop(shared);

        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.fuzzing.timeout);
        let test_limit = self.config.fuzzing.test_limit;
        loop {
            match metrics_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(delta) => {
                    self.metrics.fold(&delta);
                    if test_limit > 0
                        && self.metrics.calls_tested.load(Ordering::Relaxed) >= test_limit
                        && self.stop()
                    {
                        info!("test limit of {} calls reached, stopping", test_limit);
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
            if !timeout.is_zero() && started.elapsed() >= timeout && self.stop() {
                info!("timeout of {:?} elapsed, stopping", timeout);
            }
            if handles.iter().all(|h| h.is_finished()) {
                break;
            }
        }
        // cancelled or not, the cohort is winding down; make it official
        self.stop();

        let mut worker_failure = false;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("worker failed: {}", e);
                    worker_failure = true;
                }
                Err(_) => {
                    error!("worker panicked (internal invariant violation)");
                    worker_failure = true;
                }
            }
        }
        while let Ok(delta) = metrics_rx.try_recv() {
            self.metrics.fold(&delta);
        }

        corpus.close();
        if let Some(aggregator) = aggregator {
            let call_metrics = aggregator.finish();
            write_artifacts(Path::new("."), &call_metrics)
                .context("writing reversion artifacts")?;
            info!(
                "reversion statistics written for {} functions",
                call_metrics.functions.len()
            );
        }
        if let Some(lifecycle) = cache_lifecycle {
            lifecycle
                .join()
                .map_err(|_| anyhow!("cache lifecycle thread panicked"))?
                .context("flushing remote state cache on shutdown")?;
        }

        let report = self.build_report(&corpus, worker_failure);
        self.log_report(&report);
        Ok(report)
    }

    fn build_report(&self, corpus: &Corpus, worker_failure: bool) -> CampaignReport {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.finish();
        let cases: Vec<CaseSummary> = registry
            .cases()
            .iter()
            .map(|case| CaseSummary {
                contract: case.contract_name.clone(),
                signature: case.function.signature.clone(),
                status: case.status,
                message: case.message.clone(),
                witness: case.witness.clone(),
            })
            .collect();
        let any_failed = registry.any_failed();
        let exit_code = if any_failed {
            EXIT_TEST_FAILED
        } else if worker_failure {
            1
        } else {
            0
        };
        CampaignReport {
            calls_tested: self.metrics.calls_tested.load(Ordering::Relaxed),
            sequences_tested: self.metrics.sequences_tested.load(Ordering::Relaxed),
            failed_sequences: self.metrics.failed_sequences.load(Ordering::Relaxed),
            gas_used: self.metrics.gas_used.load(Ordering::Relaxed),
            branches_hit: self.metrics.branches_hit.load(Ordering::Relaxed),
            corpus_entries: corpus.len(),
            cases,
            exit_code,
        }
    }

    fn log_report(&self, report: &CampaignReport) {
        info!(
            "campaign finished: {} calls, {} sequences, {} coverage bits, {} corpus entries",
            report.calls_tested, report.sequences_tested, report.branches_hit, report.corpus_entries
        );
        for case in &report.cases {
            match case.status {
                TestCaseStatus::Failed => {
                    error!(
                        "[FAILED] {}.{}: {}",
                        case.contract,
                        case.signature,
                        case.message.as_deref().unwrap_or("no detail")
                    );
                    if let Some(witness) = &case.witness {
                        for (step, line) in self.describe_sequence(witness).iter().enumerate() {
                            error!("  {}. {}", step + 1, line);
                        }
                    }
                }
                TestCaseStatus::Passed => info!("[PASSED] {}.{}", case.contract, case.signature),
                TestCaseStatus::Skipped => {
                    warn!("[SKIPPED] {}.{}", case.contract, case.signature)
                }
                _ => {}
            }
        }
    }

    /// Human-readable rendering of a witness sequence.
    pub fn describe_sequence(&self, sequence: &CallSequence) -> Vec<String> {
        sequence
            .calls
            .iter()
            .map(|call| self.describe_call(call))
            .collect()
    }

    fn describe_call(&self, call: &Call) -> String {
        let sender = self
            .accounts
            .get(call.sender as usize)
            .map(|a| format!("0x{}", hex::encode(a.address.0)))
            .unwrap_or_else(|| format!("account[{}]", call.sender));
        let Some(to) = call.to else {
            return format!("{} deploys {} bytes of init code", sender, call.data.len());
        };
        let described = call.selector().and_then(|selector| {
            self.contracts.iter().find_map(|contract| {
                let function = contract.abi.function_by_selector(selector)?;
                let args = decode_values(&function.inputs, &call.data[4..]).ok()?;
                Some(format!(
                    "{}({})",
                    function.name,
                    args.iter().map(|a| a.to_string()).join(", ")
                ))
            })
        });
        let callee = described.unwrap_or_else(|| format!("raw 0x{}", hex::encode(&call.data)));
        format!(
            "{} -> 0x{}: {} [block +{}, time +{}s]",
            sender,
            hex::encode(to.0),
            callee,
            call.block_delay,
            call.time_delay
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FuzzingConfig;
    use std::io::Write;

    fn artifact_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("hydrafuzz-e2e-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Init code returning a runtime of up to 32 bytes.
    fn init_for(runtime: &[u8]) -> Vec<u8> {
        assert!(runtime.len() <= 32);
        let mut padded = runtime.to_vec();
        padded.resize(32, 0);
        let mut code = vec![0x7f];
        code.extend_from_slice(&padded);
        code.extend_from_slice(&[0x60, 0x00, 0x52]);
        code.extend_from_slice(&[0x60, runtime.len() as u8, 0x60, 0x00, 0xf3]);
        code
    }

    /// A contract whose runtime is a single STOP: every call succeeds and
    /// nothing can ever fail.
    fn write_trivial_target(dir: &std::path::Path) {
        let abi = r#"[
            {"type":"function","name":"poke","stateMutability":"nonpayable","inputs":[{"name":"x","type":"uint256"}],"outputs":[]}
        ]"#;
        std::fs::File::create(dir.join("Trivial.abi"))
            .unwrap()
            .write_all(abi.as_bytes())
            .unwrap();
        std::fs::File::create(dir.join("Trivial.bin"))
            .unwrap()
            .write_all(hex::encode(init_for(&[0x00])).as_bytes())
            .unwrap();
    }

    fn quick_config(dir: &std::path::Path, corpus: &std::path::Path) -> FuzzConfig {
        FuzzConfig {
            compilation: CompilationConfig::DirectCompiler {
                artifact_directory: dir.display().to_string(),
            },
            fuzzing: FuzzingConfig {
                workers: 2,
                test_limit: 200,
                max_tx_sequence_length: 4,
                corpus_directory: corpus.to_path_buf(),
                campaign_seed: Some(0xdead),
                ..FuzzingConfig::default()
            },
            ..FuzzConfig::default()
        }
    }

    #[test]
    fn test_campaign_runs_to_test_limit() {
        crate::logger::init_test();
        let dir = artifact_dir("limit");
        write_trivial_target(&dir);
        let corpus_dir = dir.join("corpus");

        let fuzzer = Fuzzer::new(quick_config(&dir, &corpus_dir)).unwrap();
        let report = fuzzer.run().unwrap();
        assert!(report.calls_tested >= 200);
        assert_eq!(report.exit_code, 0);
        // the STOP-only target has no assertion candidates but the calls
        // still counted
        assert!(report.sequences_tested > 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    /// Init code for arbitrary-length runtimes: CODECOPY the tail of the
    /// init code and return it.
    fn init_codecopy(runtime: &[u8]) -> Vec<u8> {
        let len = runtime.len() as u16;
        let offset = 15u16;
        let mut code = vec![];
        code.extend_from_slice(&[0x61, (len >> 8) as u8, len as u8]);
        code.extend_from_slice(&[0x61, (offset >> 8) as u8, offset as u8]);
        code.extend_from_slice(&[0x60, 0x00, 0x39]);
        code.extend_from_slice(&[0x61, (len >> 8) as u8, len as u8]);
        code.extend_from_slice(&[0x60, 0x00, 0xf3]);
        assert_eq!(code.len(), offset as usize);
        code.extend_from_slice(runtime);
        code
    }

    /// Dispatcher with setX(uint256) -> slot 0, setY(uint256) -> slot 1,
    /// property_not_both() -> !(x == 10 && y == 80). The 10 and 80
    /// comparison constants are PUSH2-encoded so literal mining seeds the
    /// mutator with them.
    fn property_target_runtime() -> Vec<u8> {
        let sel_x = crate::types::selector_of("setX(uint256)");
        let sel_y = crate::types::selector_of("setY(uint256)");
        let sel_p = crate::types::selector_of("property_not_both()");
        let mut code = vec![0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c];
        for (selector, dest) in [(sel_x, 0x28u16), (sel_y, 0x30u16), (sel_p, 0x38u16)] {
            code.push(0x80);
            code.push(0x63);
            code.extend_from_slice(&selector);
            code.push(0x14);
            code.extend_from_slice(&[0x61, (dest >> 8) as u8, dest as u8]);
            code.push(0x57);
        }
        code.push(0x00);
        assert_eq!(code.len(), 0x28);
        // setX: sstore(0, calldataload(4))
        code.extend_from_slice(&[0x5b, 0x60, 0x04, 0x35, 0x60, 0x00, 0x55, 0x00]);
        assert_eq!(code.len(), 0x30);
        // setY: sstore(1, calldataload(4))
        code.extend_from_slice(&[0x5b, 0x60, 0x04, 0x35, 0x60, 0x01, 0x55, 0x00]);
        assert_eq!(code.len(), 0x38);
        // property_not_both: iszero(and(eq(sload(0), 10), eq(sload(1), 80)))
        code.extend_from_slice(&[
            0x5b, 0x60, 0x00, 0x54, 0x61, 0x00, 0x0a, 0x14, 0x60, 0x01, 0x54, 0x61, 0x00, 0x50,
            0x14, 0x16, 0x15, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
        ]);
        code
    }

    fn write_property_target(dir: &std::path::Path) {
        let abi = r#"[
            {"type":"function","name":"setX","stateMutability":"nonpayable","inputs":[{"name":"v","type":"uint256"}],"outputs":[]},
            {"type":"function","name":"setY","stateMutability":"nonpayable","inputs":[{"name":"v","type":"uint256"}],"outputs":[]},
            {"type":"function","name":"property_not_both","stateMutability":"view","inputs":[],"outputs":[{"name":"","type":"bool"}]}
        ]"#;
        std::fs::File::create(dir.join("Prop.abi"))
            .unwrap()
            .write_all(abi.as_bytes())
            .unwrap();
        std::fs::File::create(dir.join("Prop.bin"))
            .unwrap()
            .write_all(hex::encode(init_codecopy(&property_target_runtime())).as_bytes())
            .unwrap();
    }

    /// Dispatcher with f(uint256) that raises the assertion panic
    /// (Panic(0x01)) when the argument equals 42.
    fn assertion_target_runtime() -> Vec<u8> {
        let sel_f = crate::types::selector_of("f(uint256)");
        let mut code = vec![0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c, 0x80, 0x63];
        code.extend_from_slice(&sel_f);
        code.extend_from_slice(&[0x14, 0x61, 0x00, 0x12, 0x57, 0x00]);
        assert_eq!(code.len(), 0x12);
        // f: jump to the panic block when calldataload(4) == 42
        code.extend_from_slice(&[
            0x5b, 0x60, 0x04, 0x35, 0x61, 0x00, 0x2a, 0x14, 0x61, 0x00, 0x1f, 0x57, 0x00,
        ]);
        assert_eq!(code.len(), 0x1f);
        // revert Panic(uint256 = 1)
        code.extend_from_slice(&[
            0x5b, 0x63, 0x4e, 0x48, 0x7b, 0x71, 0x60, 0xe0, 0x1b, 0x60, 0x00, 0x52, 0x60, 0x01,
            0x60, 0x20, 0x52, 0x60, 0x24, 0x60, 0x00, 0xfd,
        ]);
        code
    }

    fn write_assertion_target(dir: &std::path::Path) {
        let abi = r#"[
            {"type":"function","name":"f","stateMutability":"nonpayable","inputs":[{"name":"a","type":"uint256"}],"outputs":[]}
        ]"#;
        std::fs::File::create(dir.join("Asserting.abi"))
            .unwrap()
            .write_all(abi.as_bytes())
            .unwrap();
        std::fs::File::create(dir.join("Asserting.bin"))
            .unwrap()
            .write_all(hex::encode(init_codecopy(&assertion_target_runtime())).as_bytes())
            .unwrap();
    }

    fn witness_args(call: &Call) -> Option<(String, u64)> {
        let selector = call.selector()?;
        let value = crate::types::be_to_u256(&call.data[4..]);
        let name = if selector == crate::types::selector_of("setX(uint256)") {
            "setX"
        } else if selector == crate::types::selector_of("setY(uint256)") {
            "setY"
        } else if selector == crate::types::selector_of("f(uint256)") {
            "f"
        } else {
            return None;
        };
        Some((name.to_string(), u64::try_from(value).ok()?))
    }

    /// Dispatcher with g(uint256) switching on the argument modulo 5;
    /// every branch stores to a distinct slot from distinct code.
    fn switch_target_runtime() -> Vec<u8> {
        let sel_g = crate::types::selector_of("g(uint256)");
        let mut code = vec![0x60, 0x00, 0x35, 0x60, 0xe0, 0x1c, 0x80, 0x63];
        code.extend_from_slice(&sel_g);
        code.extend_from_slice(&[0x14, 0x61, 0x00, 0x12, 0x57, 0x00]);
        assert_eq!(code.len(), 0x12);
        // g: r = calldataload(4) % 5
        code.extend_from_slice(&[0x5b, 0x60, 0x05, 0x60, 0x04, 0x35, 0x06]);
        assert_eq!(code.len(), 0x19);
        for (residue, dest) in [(0u8, 0x3fu16), (1, 0x46), (2, 0x4d), (3, 0x54)] {
            code.extend_from_slice(&[0x80, 0x60, residue, 0x14]);
            code.extend_from_slice(&[0x61, (dest >> 8) as u8, dest as u8, 0x57]);
        }
        assert_eq!(code.len(), 0x39);
        // fallthrough branch (r == 4): sstore(5, 1)
        code.extend_from_slice(&[0x60, 0x01, 0x60, 0x05, 0x55, 0x00]);
        // branches 0..=3: sstore(residue + 1, 1)
        for slot in 1u8..=4 {
            code.extend_from_slice(&[0x5b, 0x60, 0x01, 0x60, slot, 0x55, 0x00]);
        }
        assert_eq!(code.len(), 0x5b);
        code
    }

    #[test]
    fn test_coverage_convergence_fills_corpus() {
        crate::logger::init_test();
        let dir = artifact_dir("switch");
        let abi = r#"[
            {"type":"function","name":"g","stateMutability":"nonpayable","inputs":[{"name":"v","type":"uint256"}],"outputs":[]}
        ]"#;
        std::fs::File::create(dir.join("Switch.abi"))
            .unwrap()
            .write_all(abi.as_bytes())
            .unwrap();
        std::fs::File::create(dir.join("Switch.bin"))
            .unwrap()
            .write_all(hex::encode(init_codecopy(&switch_target_runtime())).as_bytes())
            .unwrap();

        let mut config = quick_config(&dir, &dir.join("corpus"));
        config.fuzzing.test_limit = 20_000;
        // single-call sequences: every accepted entry maps to one branch
        config.fuzzing.max_tx_sequence_length = 1;
        let fuzzer = Fuzzer::new(config).unwrap();
        let report = fuzzer.run().unwrap();
        assert_eq!(report.exit_code, 0);
        // each of the five branches contributed at least one accepted
        // sequence
        assert!(
            report.corpus_entries >= 5,
            "corpus only has {} entries",
            report.corpus_entries
        );
        assert!(report.branches_hit > 0);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_property_violation_discovery() {
        crate::logger::init_test();
        let dir = artifact_dir("property");
        write_property_target(&dir);
        let corpus_dir = dir.join("corpus");

        let mut config = quick_config(&dir, &corpus_dir);
        config.fuzzing.test_limit = 400_000;
        config.fuzzing.max_tx_sequence_length = 6;
        config.fuzzing.fail_fast = true;
        config.fuzzing.campaign_seed = Some(0xDEAD);
        let fuzzer = Fuzzer::new(config.clone()).unwrap();
        let report = fuzzer.run().unwrap();

        assert_eq!(report.exit_code, EXIT_TEST_FAILED, "property never violated");
        let failed: Vec<&CaseSummary> = report
            .cases
            .iter()
            .filter(|c| c.status == TestCaseStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].signature.contains("property_not_both"));

        let witness = failed[0].witness.as_ref().expect("failure carries witness");
        assert!(witness.len() <= 4, "witness not minimized: {} calls", witness.len());
        let args: Vec<(String, u64)> = witness
            .calls
            .iter()
            .filter_map(|c| witness_args(c))
            .collect();
        assert!(args.contains(&("setX".to_string(), 10)));
        assert!(args.contains(&("setY".to_string(), 80)));

        // failure reproducibility: the witness is stored in the corpus
        // directory under its content hash
        let stored = corpus_dir.join(witness.digest_hex().unwrap());
        assert!(stored.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_assertion_discovery() {
        crate::logger::init_test();
        let dir = artifact_dir("assertion");
        write_assertion_target(&dir);

        let mut config = quick_config(&dir, &dir.join("corpus"));
        config.fuzzing.test_limit = 200_000;
        config.fuzzing.fail_fast = true;
        let fuzzer = Fuzzer::new(config.clone()).unwrap();
        let report = fuzzer.run().unwrap();

        assert_eq!(report.exit_code, EXIT_TEST_FAILED, "assertion never hit");
        let failed: Vec<&CaseSummary> = report
            .cases
            .iter()
            .filter(|c| c.status == TestCaseStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].signature.contains("f(uint256)"));

        let witness = failed[0].witness.as_ref().expect("failure carries witness");
        assert_eq!(witness.len(), 1, "witness should shrink to one call");
        assert_eq!(
            witness_args(&witness.calls[0]),
            Some(("f".to_string(), 42))
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = artifact_dir("stop");
        write_trivial_target(&dir);
        let fuzzer = Fuzzer::new(quick_config(&dir, &dir.join("corpus"))).unwrap();
        assert!(fuzzer.stop());
        assert!(!fuzzer.stop());
        // a cancelled campaign still terminates and reports cleanly
        let report = fuzzer.run().unwrap();
        assert_eq!(report.exit_code, 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
