/// Per-function reversion statistics, folded through a bounded channel
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::CancelToken;

/// `Panic(uint256)`: compiler-inserted Solidity panics
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];
/// `Error(string)`: require/revert with a message
pub const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// panic code raised by a failed `assert`
pub const ASSERT_PANIC_CODE: u8 = 0x01;

/// Channel capacity; overflow drops the oldest unsent report (an accepted,
/// documented statistics-only loss).
pub const REPORT_CHANNEL_CAPACITY: usize = 500;

#[derive(Debug, Error)]
pub enum RevertStatsError {
    #[error("cannot write revert artifact {0}: {1}")]
    Write(String, std::io::Error),
    #[error("revert artifact serialization failed: {0}")]
    Serialize(serde_json::Error),
}

/// Classified revert payload of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertReason {
    /// Solidity panic with its one-byte class code
    Panic(u8),
    /// custom error or require-with-message, keyed by selector
    Custom([u8; 4]),
    /// revert with no or unrecognizably short data
    Bare,
}

impl RevertReason {
    /// Fold into a 4-byte key. Panic codes are smuggled into the low byte
    /// of an otherwise-zero selector so they fit the same key space.
    pub fn key(&self) -> [u8; 4] {
        match self {
            RevertReason::Panic(code) => [0, 0, 0, *code],
            RevertReason::Custom(selector) => *selector,
            RevertReason::Bare => [0, 0, 0, 0],
        }
    }
}

/// Classify raw revert data. Only payloads carrying at least a selector
/// become assertion candidates.
pub fn classify_revert(data: &[u8]) -> RevertReason {
    if data.len() < 4 {
        return RevertReason::Bare;
    }
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&data[..4]);
    if selector == PANIC_SELECTOR && data.len() >= 36 {
        return RevertReason::Panic(data[35]);
    }
    RevertReason::Custom(selector)
}

/// Is this revert payload a failed Solidity `assert`?
pub fn is_assertion_failure(data: &[u8]) -> bool {
    matches!(classify_revert(data), RevertReason::Panic(code) if code == ASSERT_PANIC_CODE)
}

/// Outcome of one call in a committed block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRevertRecord {
    pub selector: [u8; 4],
    pub reverted: bool,
    pub reason: Option<RevertReason>,
}

/// Per-block batch of call outcomes, the unit sent to the aggregator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevertReport {
    pub records: Vec<CallRevertRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetrics {
    pub total_calls: u64,
    pub reverted_calls: u64,
    pub revert_reasons: HashMap<[u8; 4], u64>,
}

impl FunctionMetrics {
    pub fn revert_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.reverted_calls as f64 / self.total_calls as f64
        }
    }
}

/// The aggregate: function selector → call/revert counts and a revert
/// reason taxonomy.
#[derive(Debug, Clone, Default)]
pub struct CallMetrics {
    pub functions: HashMap<[u8; 4], FunctionMetrics>,
}

impl CallMetrics {
    pub fn fold(&mut self, report: &RevertReport) {
        for record in &report.records {
            let entry = self.functions.entry(record.selector).or_default();
            entry.total_calls += 1;
            if record.reverted {
                entry.reverted_calls += 1;
                let key = record.reason.unwrap_or(RevertReason::Bare).key();
                *entry.revert_reasons.entry(key).or_default() += 1;
            }
        }
    }
}

/// Serialized form of the final report, hex-keyed so the JSON is stable
/// and diffable across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevertArtifact {
    pub functions: BTreeMap<String, FunctionArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionArtifact {
    pub total_calls: u64,
    pub reverted_calls: u64,
    pub revert_rate: f64,
    pub reasons: BTreeMap<String, u64>,
    /// change in revert rate versus the previous run, when one existed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert_rate_delta: Option<f64>,
}

impl RevertArtifact {
    pub fn from_metrics(metrics: &CallMetrics, previous: Option<&RevertArtifact>) -> Self {
        let mut functions = BTreeMap::new();
        for (selector, stats) in &metrics.functions {
            let name = hex::encode(selector);
            let delta = previous
                .and_then(|p| p.functions.get(&name))
                .map(|prior| stats.revert_rate() - prior.revert_rate);
            functions.insert(
                name,
                FunctionArtifact {
                    total_calls: stats.total_calls,
                    reverted_calls: stats.reverted_calls,
                    revert_rate: stats.revert_rate(),
                    reasons: stats
                        .revert_reasons
                        .iter()
                        .map(|(key, count)| (hex::encode(key), *count))
                        .collect(),
                    revert_rate_delta: delta,
                },
            );
        }
        Self { functions }
    }

    fn to_html(&self) -> String {
        let mut rows = String::new();
        for (selector, stats) in &self.functions {
            let delta = stats
                .revert_rate_delta
                .map(|d| format!("{:+.2}%", d * 100.0))
                .unwrap_or_else(|| "-".to_string());
            let reasons = stats
                .reasons
                .iter()
                .map(|(key, count)| format!("0x{}: {}", key, count))
                .join("<br/>");
            rows.push_str(&format!(
                "<tr><td>0x{}</td><td>{}</td><td>{}</td><td>{:.2}%</td><td>{}</td><td>{}</td></tr>\n",
                selector,
                stats.total_calls,
                stats.reverted_calls,
                stats.revert_rate * 100.0,
                delta,
                reasons,
            ));
        }
        format!(
            "<!DOCTYPE html>\n<html><head><title>Reversion statistics</title>\
             <style>table{{border-collapse:collapse}}td,th{{border:1px solid #999;padding:4px 8px}}</style>\
             </head><body><h1>Reversion statistics</h1>\
             <table><tr><th>Function</th><th>Calls</th><th>Reverts</th><th>Rate</th><th>&Delta; rate</th><th>Reasons</th></tr>\n{}</table></body></html>\n",
            rows
        )
    }
}

/// Write `revert_stats.json` and `revert_stats.html` under `dir`,
/// computing per-function deltas against a previous JSON report if one is
/// present.
pub fn write_artifacts(dir: &Path, metrics: &CallMetrics) -> Result<(), RevertStatsError> {
    std::fs::create_dir_all(dir).map_err(|e| RevertStatsError::Write(dir.display().to_string(), e))?;
    let json_path = dir.join("revert_stats.json");
    let previous: Option<RevertArtifact> = std::fs::read_to_string(&json_path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok());
    if previous.is_some() {
        debug!("previous revert report found, computing deltas");
    }

    let artifact = RevertArtifact::from_metrics(metrics, previous.as_ref());
    let json = serde_json::to_string_pretty(&artifact).map_err(RevertStatsError::Serialize)?;
    std::fs::write(&json_path, json)
        .map_err(|e| RevertStatsError::Write(json_path.display().to_string(), e))?;
    let html_path = dir.join("revert_stats.html");
    std::fs::write(&html_path, artifact.to_html())
        .map_err(|e| RevertStatsError::Write(html_path.display().to_string(), e))?;
    Ok(())
}

/// Worker-side sender with drop-oldest backpressure: when the bounded
/// channel refuses a report, the oldest pending one is discarded rather
/// than blocking the fuzz loop.
pub struct RevertSender {
    tx: Sender<RevertReport>,
    pending: VecDeque<RevertReport>,
    dropped: u64,
}

const MAX_PENDING_REPORTS: usize = 8;

impl RevertSender {
    pub fn send(&mut self, report: RevertReport) {
        if report.records.is_empty() {
            return;
        }
        self.pending.push_back(report);
        while let Some(front) = self.pending.pop_front() {
            match self.tx.try_send(front) {
                Ok(()) => {}
                Err(TrySendError::Full(report)) => {
                    self.pending.push_front(report);
                    while self.pending.len() > MAX_PENDING_REPORTS {
                        self.pending.pop_front();
                        self.dropped += 1;
                        debug!("revert report channel full, dropped oldest pending report");
                    }
                    return;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.pending.clear();
                    return;
                }
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Background consumer folding worker reports into the aggregate. It stops
/// when the supervisor's shutdown token fires, when its own cancel is
/// invoked, or when all senders hang up; pending reports are drained
/// before the fold is returned.
pub struct RevertAggregator {
    tx: Sender<RevertReport>,
    handle: JoinHandle<CallMetrics>,
    own_cancel: Arc<CancelToken>,
}

impl RevertAggregator {
    pub fn spawn(shutdown: Arc<CancelToken>) -> Self {
        let (tx, rx) = bounded::<RevertReport>(REPORT_CHANNEL_CAPACITY);
        let own_cancel = Arc::new(CancelToken::new());
        let consumer_cancel = own_cancel.clone();
        let handle = std::thread::Builder::new()
            .name("revert-aggregator".into())
            .spawn(move || Self::consume(rx, shutdown, consumer_cancel))
            .expect("failed to spawn revert aggregator");
        Self {
            tx,
            handle,
            own_cancel,
        }
    }

    fn consume(
        rx: Receiver<RevertReport>,
        shutdown: Arc<CancelToken>,
        own_cancel: Arc<CancelToken>,
    ) -> CallMetrics {
        let mut metrics = CallMetrics::default();
        loop {
            if shutdown.is_cancelled() || own_cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(report) => metrics.fold(&report),
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        // drain whatever is still queued
        while let Ok(report) = rx.try_recv() {
            metrics.fold(&report);
        }
        metrics
    }

    pub fn sender(&self) -> RevertSender {
        RevertSender {
            tx: self.tx.clone(),
            pending: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Stop the consumer and return the final aggregate.
    pub fn finish(self) -> CallMetrics {
        self.own_cancel.cancel();
        drop(self.tx);
        match self.handle.join() {
            Ok(metrics) => metrics,
            Err(_) => {
                warn!("revert aggregator thread panicked; statistics lost");
                CallMetrics::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(selector: [u8; 4], reverted: bool, reason: Option<RevertReason>) -> CallRevertRecord {
        CallRevertRecord {
            selector,
            reverted,
            reason,
        }
    }

    #[test]
    fn test_classify() {
        // Panic(uint256) with code 0x01
        let mut panic_data = PANIC_SELECTOR.to_vec();
        panic_data.extend_from_slice(&[0u8; 31]);
        panic_data.push(0x01);
        assert_eq!(classify_revert(&panic_data), RevertReason::Panic(0x01));
        assert!(is_assertion_failure(&panic_data));

        assert_eq!(classify_revert(&[]), RevertReason::Bare);
        assert_eq!(
            classify_revert(&[0xab, 0xcd, 0xef, 0x01, 0x00]),
            RevertReason::Custom([0xab, 0xcd, 0xef, 0x01])
        );
        assert!(!is_assertion_failure(&[0xab, 0xcd, 0xef, 0x01]));
    }

    #[test]
    fn test_panic_key_smuggling() {
        assert_eq!(RevertReason::Panic(0x11).key(), [0, 0, 0, 0x11]);
        assert_eq!(
            RevertReason::Custom([1, 2, 3, 4]).key(),
            [1, 2, 3, 4]
        );
    }

    #[test]
    fn test_fold() {
        let mut metrics = CallMetrics::default();
        let sel = [0xaa, 0xbb, 0xcc, 0xdd];
        metrics.fold(&RevertReport {
            records: vec![
                record(sel, false, None),
                record(sel, true, Some(RevertReason::Panic(0x11))),
                record(sel, true, Some(RevertReason::Panic(0x11))),
            ],
        });
        let stats = &metrics.functions[&sel];
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.reverted_calls, 2);
        assert_eq!(stats.revert_reasons[&[0, 0, 0, 0x11]], 2);
        assert!((stats.revert_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregator_roundtrip() {
        let shutdown = Arc::new(CancelToken::new());
        let aggregator = RevertAggregator::spawn(shutdown);
        let mut sender = aggregator.sender();
        let sel = [1, 2, 3, 4];
        for _ in 0..10 {
            sender.send(RevertReport {
                records: vec![record(sel, true, Some(RevertReason::Bare))],
            });
        }
        let metrics = aggregator.finish();
        assert_eq!(metrics.functions[&sel].total_calls, 10);
        assert_eq!(metrics.functions[&sel].reverted_calls, 10);
    }

    #[test]
    fn test_artifact_roundtrip_and_delta() {
        let mut metrics = CallMetrics::default();
        let sel = [9, 9, 9, 9];
        metrics.fold(&RevertReport {
            records: vec![
                record(sel, true, Some(RevertReason::Panic(0x01))),
                record(sel, false, None),
            ],
        });

        let artifact = RevertArtifact::from_metrics(&metrics, None);
        let json = serde_json::to_string(&artifact).unwrap();
        let decoded: RevertArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.functions.len(), 1);
        let stats = &decoded.functions[&hex::encode(sel)];
        assert_eq!(stats.reverted_calls, 1);
        assert_eq!(stats.reasons[&"00000001".to_string()], 1);

        // all calls revert in the next run: delta is +0.5
        let mut next = CallMetrics::default();
        next.fold(&RevertReport {
            records: vec![record(sel, true, Some(RevertReason::Panic(0x01)))],
        });
        let with_delta = RevertArtifact::from_metrics(&next, Some(&decoded));
        let delta = with_delta.functions[&hex::encode(sel)]
            .revert_rate_delta
            .unwrap();
        assert!((delta - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_write_artifacts() {
        let dir = std::env::temp_dir().join(format!("hydrafuzz-reverts-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let mut metrics = CallMetrics::default();
        metrics.fold(&RevertReport {
            records: vec![record([1, 1, 1, 1], true, Some(RevertReason::Bare))],
        });
        write_artifacts(&dir, &metrics).unwrap();
        assert!(dir.join("revert_stats.json").exists());
        let html = std::fs::read_to_string(dir.join("revert_stats.html")).unwrap();
        assert!(html.contains("0x01010101"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
