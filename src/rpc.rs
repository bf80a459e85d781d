/// Bounded pool of JSON-RPC connections with request coalescing and
/// linear-backoff retries
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::types::{be_to_u256, CancelToken, EVMAddress, EVMU256};

pub const DEFAULT_MAX_RETRIES: usize = 3;
const BACKOFF_UNIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed rpc response: {0}")]
    Malformed(String),
    #[error("rpc error: {0}")]
    Remote(String),
    #[error("request cancelled")]
    Cancelled,
}

/// The wire seam. Production uses blocking reqwest; tests substitute a
/// scripted transport so coalescing and retry behavior are observable
/// without an endpoint.
pub trait RpcTransport: Send + Sync {
    fn post(&self, body: &str) -> Result<String, RpcError>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }
}

impl RpcTransport for HttpTransport {
    fn post(&self, body: &str) -> Result<String, RpcError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        response.text().map_err(|e| RpcError::Transport(e.to_string()))
    }
}

struct InflightSlot {
    result: Mutex<Option<Result<Value, RpcError>>>,
    cond: Condvar,
}

/// One long-lived connection. Identical in-flight requests are coalesced:
/// the request key is `(method, canonical_json(args))` and late callers
/// await the first caller's result instead of going to the wire.
pub struct RpcClient {
    transport: Arc<dyn RpcTransport>,
    block_tag: String,
    max_retries: usize,
    request_id: AtomicU64,
    inflight: Mutex<HashMap<String, Arc<InflightSlot>>>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn RpcTransport>, block_height: u64, max_retries: usize) -> Self {
        Self {
            transport,
            block_tag: if block_height == 0 {
                "latest".to_string()
            } else {
                format!("0x{:x}", block_height)
            },
            max_retries,
            request_id: AtomicU64::new(1),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn request(
        &self,
        method: &str,
        params: Value,
        token: &CancelToken,
    ) -> Result<Value, RpcError> {
        let key = format!("{}:{}", method, params);

        let (slot, leader) = {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            match inflight.get(&key) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(InflightSlot {
                        result: Mutex::new(None),
                        cond: Condvar::new(),
                    });
                    inflight.insert(key.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            debug!("coalescing rpc request {}", key);
            return self.await_slot(&slot, token);
        }

        let outcome = self.perform(method, &params, token);
        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.remove(&key);
        }
        {
            let mut result = slot.result.lock().expect("slot lock poisoned");
            *result = Some(outcome.clone());
        }
        slot.cond.notify_all();
        outcome
    }

    fn await_slot(&self, slot: &InflightSlot, token: &CancelToken) -> Result<Value, RpcError> {
        let mut result = slot.result.lock().expect("slot lock poisoned");
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            if token.is_cancelled() {
                return Err(RpcError::Cancelled);
            }
            let (guard, _timeout) = slot
                .cond
                .wait_timeout(result, Duration::from_millis(50))
                .expect("slot lock poisoned");
            result = guard;
        }
    }

    /// Issue the request with up to `max_retries` retries and linear
    /// backoff; every failure class is treated as transient and the last
    /// error is surfaced verbatim.
    fn perform(&self, method: &str, params: &Value, token: &CancelToken) -> Result<Value, RpcError> {
        let mut last_error = RpcError::Transport("no attempt made".to_string());
        for attempt in 0..=self.max_retries {
            if token.is_cancelled() {
                return Err(RpcError::Cancelled);
            }
            if attempt > 0 {
                if token.wait_timeout(BACKOFF_UNIT * attempt as u32) {
                    return Err(RpcError::Cancelled);
                }
            }
            match self.perform_once(method, params) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!("rpc {} attempt {} failed: {}", method, attempt + 1, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn perform_once(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });
        let raw = self.transport.post(&body.to_string())?;
        let parsed: Value =
            serde_json::from_str(&raw).map_err(|e| RpcError::Malformed(e.to_string()))?;
        if let Some(error) = parsed.get("error") {
            if !error.is_null() {
                return Err(RpcError::Remote(error.to_string()));
            }
        }
        match parsed.get("result") {
            Some(result) if !result.is_null() => Ok(result.clone()),
            _ => Err(RpcError::Malformed("response carries no result".to_string())),
        }
    }

    fn hex_field(value: &Value) -> Result<&str, RpcError> {
        value
            .as_str()
            .ok_or_else(|| RpcError::Malformed(format!("expected hex string, got {}", value)))
    }

    pub fn get_balance(&self, address: EVMAddress, token: &CancelToken) -> Result<EVMU256, RpcError> {
        let result = self.request(
            "eth_getBalance",
            json!([format!("0x{:x}", address), self.block_tag]),
            token,
        )?;
        let raw = Self::hex_field(&result)?.trim_start_matches("0x");
        let bytes = hex::decode(pad_even(raw)).map_err(|e| RpcError::Malformed(e.to_string()))?;
        Ok(be_to_u256(&bytes))
    }

    pub fn get_nonce(&self, address: EVMAddress, token: &CancelToken) -> Result<u64, RpcError> {
        let result = self.request(
            "eth_getTransactionCount",
            json!([format!("0x{:x}", address), self.block_tag]),
            token,
        )?;
        let raw = Self::hex_field(&result)?.trim_start_matches("0x");
        u64::from_str_radix(raw, 16).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    pub fn get_code(&self, address: EVMAddress, token: &CancelToken) -> Result<Vec<u8>, RpcError> {
        let result = self.request(
            "eth_getCode",
            json!([format!("0x{:x}", address), self.block_tag]),
            token,
        )?;
        let raw = Self::hex_field(&result)?.trim_start_matches("0x");
        hex::decode(raw).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    pub fn get_storage_at(
        &self,
        address: EVMAddress,
        slot: EVMU256,
        token: &CancelToken,
    ) -> Result<[u8; 32], RpcError> {
        let result = self.request(
            "eth_getStorageAt",
            json!([
                format!("0x{:x}", address),
                format!("0x{:x}", slot),
                self.block_tag
            ]),
            token,
        )?;
        let raw = Self::hex_field(&result)?.trim_start_matches("0x");
        let bytes = hex::decode(pad_even(raw)).map_err(|e| RpcError::Malformed(e.to_string()))?;
        let mut out = [0u8; 32];
        let start = 32usize.saturating_sub(bytes.len());
        out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
        Ok(out)
    }
}

fn pad_even(hex: &str) -> String {
    if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex.to_string()
    }
}

/// Bounded pool over a single endpoint. Each worker pins to one connection
/// by ordinal so workers never contend for RPC slots.
pub struct RpcClientPool {
    clients: Vec<Arc<RpcClient>>,
}

impl RpcClientPool {
    pub fn new(endpoint: &str, block_height: u64, pool_size: usize, max_retries: usize) -> Self {
        let clients = (0..pool_size.max(1))
            .map(|_| {
                Arc::new(RpcClient::new(
                    Arc::new(HttpTransport::new(endpoint)),
                    block_height,
                    max_retries,
                ))
            })
            .collect();
        Self { clients }
    }

    pub fn with_clients(clients: Vec<Arc<RpcClient>>) -> Self {
        Self { clients }
    }

    pub fn client_for(&self, worker_index: usize) -> Arc<RpcClient> {
        Arc::clone(&self.clients[worker_index % self.clients.len()])
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedTransport {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Duration,
        result: String,
    }

    impl ScriptedTransport {
        fn new(result: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                delay: Duration::from_millis(0),
                result: result.to_string(),
            }
        }
    }

    impl RpcTransport for ScriptedTransport {
        fn post(&self, _body: &str) -> Result<String, RpcError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if call < self.fail_first {
                return Err(RpcError::Transport(format!("connection refused #{}", call)));
            }
            Ok(self.result.clone())
        }
    }

    fn ok_body(result: &str) -> String {
        format!("{{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"{}\"}}", result)
    }

    #[test]
    fn test_retry_then_success() {
        let transport = Arc::new(ScriptedTransport {
            fail_first: 2,
            ..ScriptedTransport::new(&ok_body("0x2a"))
        });
        let client = RpcClient::new(transport.clone(), 0, 3);
        let token = CancelToken::new();
        let value = client
            .request("eth_chainId", json!([]), &token)
            .unwrap();
        assert_eq!(value, json!("0x2a"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retries_exhausted_surfaces_last_error() {
        let transport = Arc::new(ScriptedTransport {
            fail_first: usize::MAX,
            ..ScriptedTransport::new("")
        });
        let client = RpcClient::new(transport.clone(), 0, 2);
        let token = CancelToken::new();
        let err = client.request("eth_chainId", json!([]), &token).unwrap_err();
        // 1 initial attempt + 2 retries, last error text preserved
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RpcError::Transport(ref m) if m.contains("#2")));
    }

    #[test]
    fn test_remote_error_is_retried_and_surfaced() {
        let transport = Arc::new(ScriptedTransport::new(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"error\":{\"code\":-32000,\"message\":\"header not found\"}}",
        ));
        let client = RpcClient::new(transport.clone(), 0, 1);
        let token = CancelToken::new();
        let err = client.request("eth_getBalance", json!([]), &token).unwrap_err();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, RpcError::Remote(ref m) if m.contains("header not found")));
    }

    #[test]
    fn test_coalescing_single_outbound_request() {
        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(200),
            ..ScriptedTransport::new(&ok_body("0x01"))
        });
        let client = Arc::new(RpcClient::new(transport.clone(), 0, 0));

        let mut handles = vec![];
        for _ in 0..4 {
            let client = Arc::clone(&client);
            handles.push(std::thread::spawn(move || {
                let token = CancelToken::new();
                client.request("eth_getCode", json!(["0xabc", "latest"]), &token)
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), json!("0x01"));
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_distinct_requests_not_coalesced() {
        let transport = Arc::new(ScriptedTransport::new(&ok_body("0x01")));
        let client = RpcClient::new(transport.clone(), 0, 0);
        let token = CancelToken::new();
        client.request("eth_getCode", json!(["0xa", "latest"]), &token).unwrap();
        client.request("eth_getCode", json!(["0xb", "latest"]), &token).unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pool_pins_by_ordinal() {
        let clients: Vec<Arc<RpcClient>> = (0..3)
            .map(|_| {
                Arc::new(RpcClient::new(
                    Arc::new(ScriptedTransport::new(&ok_body("0x0"))) as Arc<dyn RpcTransport>,
                    0,
                    0,
                ))
            })
            .collect();
        let pool = RpcClientPool::with_clients(clients.clone());
        assert!(Arc::ptr_eq(&pool.client_for(0), &clients[0]));
        assert!(Arc::ptr_eq(&pool.client_for(4), &clients[1]));
        assert!(Arc::ptr_eq(&pool.client_for(5), &clients[2]));
    }

    #[test]
    fn test_get_storage_parses_short_words() {
        let transport = Arc::new(ScriptedTransport::new(&ok_body("0x7b")));
        let client = RpcClient::new(transport, 0, 0);
        let token = CancelToken::new();
        let word = client
            .get_storage_at(crate::types::fixed_address("00000000000000000000000000000000000000aa"), EVMU256::from(0u64), &token)
            .unwrap();
        assert_eq!(word[31], 0x7b);
        assert!(word[..31].iter().all(|b| *b == 0));
    }
}
