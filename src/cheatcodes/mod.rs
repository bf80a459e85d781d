/// Cheatcode precompiles: fixed-address contracts dispatched by ABI
/// selector that manipulate the test environment.
pub mod console;

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::abi::{decode_values, encode_values, AbiType, AbiValue};
use crate::chain::db::{self, ChainDb};
use crate::chain::tracers::RawLog;
use crate::types::{h256_of, selector_of, EVMAddress, EVMU256};
use revm::primitives::{Env, B160, U256};

/// 0x7109709ECfa91a80626fF3989D68f67F5b1DD12D
pub const CHEATCODE_ADDRESS: B160 = B160([
    113, 9, 112, 158, 207, 169, 26, 128, 98, 111, 243, 152, 157, 104, 246, 127, 91, 29, 209, 45,
]);

/// Prank information: the sender to impersonate for upcoming calls.
#[derive(Debug, Clone)]
pub struct Prank {
    pub new_caller: EVMAddress,
    /// true: expires after the next call; false: until stopPrank
    pub single_call: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertMatch {
    Any,
    Selector([u8; 4]),
    Exact(Vec<u8>),
}

impl RevertMatch {
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            RevertMatch::Any => true,
            RevertMatch::Selector(selector) => data.get(..4) == Some(&selector[..]),
            RevertMatch::Exact(expected) => data == expected.as_slice(),
        }
    }
}

/// Lifecycle of one expectEmit declaration: the next emitted log becomes
/// the pattern, a later identical log satisfies it.
#[derive(Debug, Clone)]
pub enum EmitExpectation {
    Pending,
    Armed(RawLog),
    Matched,
}

/// Frame-local cheat state, owned by the chain and reset per transaction
/// where noted. Handlers read and write it through [`CheatCtx`].
#[derive(Debug, Default)]
pub struct CheatcodeState {
    pub prank: Option<Prank>,
    pub expected_revert: Option<RevertMatch>,
    pub expected_emits: Vec<EmitExpectation>,
    /// unmet expectations; turns the call outcome into a violation
    pub violations: Vec<String>,
}

impl CheatcodeState {
    /// Expectations are scoped to one transaction; pranks started with
    /// startPrank survive across calls.
    pub fn begin_tx(&mut self) {
        self.expected_revert = None;
        self.expected_emits.clear();
        self.violations.clear();
    }

    /// Flag expectations the transaction left unmet.
    pub fn end_tx(&mut self) {
        if self.expected_revert.take().is_some() {
            self.violations
                .push("expected revert was not observed".to_string());
        }
        if self
            .expected_emits
            .iter()
            .any(|e| matches!(e, EmitExpectation::Armed(_) | EmitExpectation::Pending))
        {
            self.violations
                .push("expected event was not emitted".to_string());
        }
        self.expected_emits.clear();
        if self.prank.as_ref().map(|p| p.single_call).unwrap_or(false) {
            self.prank = None;
        }
    }

    pub fn observe_log(&mut self, log: &RawLog) {
        for expectation in self.expected_emits.iter_mut() {
            if matches!(expectation, EmitExpectation::Pending) {
                *expectation = EmitExpectation::Armed(log.clone());
                return;
            }
        }
        for expectation in self.expected_emits.iter_mut() {
            if let EmitExpectation::Armed(pattern) = expectation {
                if pattern.topics == log.topics && pattern.data == log.data {
                    *expectation = EmitExpectation::Matched;
                    return;
                }
            }
        }
    }
}

/// What a handler hands back: ABI-packed success output, or a raw revert
/// (selector-bearing payload) that propagates to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheatResult {
    Return(Vec<u8>),
    Revert(Vec<u8>),
}

/// Encode `Error(string)` revert data, the shape solidity callers expect.
pub fn error_revert(message: &str) -> Vec<u8> {
    let mut out = crate::reverts::ERROR_SELECTOR.to_vec();
    out.extend_from_slice(&encode_values(&[AbiValue::Str(message.to_string())]));
    out
}

/// Live context a handler runs against.
pub struct CheatCtx<'a> {
    pub env: &'a mut Env,
    pub db: &'a mut ChainDb,
    pub state: &'a mut CheatcodeState,
}

type CheatHandler = fn(&mut CheatCtx<'_>, &[AbiValue]) -> CheatResult;

pub struct CheatcodeDef {
    pub signature: &'static str,
    pub inputs: Vec<AbiType>,
    handler: CheatHandler,
}

fn def(signature: &'static str, handler: CheatHandler) -> ([u8; 4], CheatcodeDef) {
    let args = &signature[signature.find('(').expect("signature has args") + 1
        ..signature.len() - 1];
    let inputs = if args.is_empty() {
        vec![]
    } else {
        args.split(',')
            .map(|a| AbiType::parse(a).expect("cheatcode signature type"))
            .collect()
    };
    (
        selector_of(signature),
        CheatcodeDef {
            signature,
            inputs,
            handler,
        },
    )
}

/// selector → (input schema, handler); `required_gas` is zero for every
/// entry.
static REGISTRY: Lazy<HashMap<[u8; 4], CheatcodeDef>> = Lazy::new(|| {
    HashMap::from([
        def("warp(uint256)", cheat_warp),
        def("roll(uint256)", cheat_roll),
        def("prank(address)", cheat_prank),
        def("startPrank(address)", cheat_start_prank),
        def("stopPrank()", cheat_stop_prank),
        def("deal(address,uint256)", cheat_deal),
        def("store(address,bytes32,bytes32)", cheat_store),
        def("load(address,bytes32)", cheat_load),
        def("etch(address,bytes)", cheat_etch),
        def("expectRevert()", cheat_expect_revert_any),
        def("expectRevert(bytes4)", cheat_expect_revert_selector),
        def("expectRevert(bytes)", cheat_expect_revert_bytes),
        def("expectEmit()", cheat_expect_emit),
    ])
});

/// Dispatch a call made to the cheatcode address.
pub fn dispatch(ctx: &mut CheatCtx<'_>, calldata: &[u8]) -> CheatResult {
    if calldata.len() < 4 {
        return CheatResult::Revert(error_revert("malformed cheatcode call"));
    }
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&calldata[..4]);
    let Some(definition) = REGISTRY.get(&selector) else {
        return CheatResult::Revert(error_revert("unknown cheatcode selector"));
    };
    let args = match decode_values(&definition.inputs, &calldata[4..]) {
        Ok(args) => args,
        Err(_) => {
            return CheatResult::Revert(error_revert(&format!(
                "malformed arguments for {}",
                definition.signature
            )))
        }
    };
    (definition.handler)(ctx, &args)
}

fn arg_word(args: &[AbiValue], index: usize) -> EVMU256 {
    match args.get(index) {
        Some(AbiValue::Uint(v, _)) | Some(AbiValue::Int(v, _)) => *v,
        Some(AbiValue::FixedBytes(b)) => crate::types::be_to_u256(b),
        _ => U256::ZERO,
    }
}

fn arg_address(args: &[AbiValue], index: usize) -> EVMAddress {
    match args.get(index) {
        Some(AbiValue::Address(a)) => *a,
        _ => B160([0u8; 20]),
    }
}

fn arg_bytes(args: &[AbiValue], index: usize) -> Vec<u8> {
    match args.get(index) {
        Some(AbiValue::Bytes(b)) | Some(AbiValue::FixedBytes(b)) => b.clone(),
        _ => vec![],
    }
}

/// Sets `block.timestamp`.
fn cheat_warp(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    ctx.env.block.timestamp = arg_word(args, 0);
    CheatResult::Return(vec![])
}

/// Sets `block.number`.
fn cheat_roll(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    ctx.env.block.number = arg_word(args, 0);
    CheatResult::Return(vec![])
}

/// Impersonates the sender of the next call.
fn cheat_prank(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    ctx.state.prank = Some(Prank {
        new_caller: arg_address(args, 0),
        single_call: true,
    });
    CheatResult::Return(vec![])
}

fn cheat_start_prank(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    ctx.state.prank = Some(Prank {
        new_caller: arg_address(args, 0),
        single_call: false,
    });
    CheatResult::Return(vec![])
}

fn cheat_stop_prank(ctx: &mut CheatCtx<'_>, _args: &[AbiValue]) -> CheatResult {
    ctx.state.prank = None;
    CheatResult::Return(vec![])
}

/// Sets an address' balance.
fn cheat_deal(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    match db::set_balance(ctx.db, arg_address(args, 0), arg_word(args, 1)) {
        Ok(()) => CheatResult::Return(vec![]),
        Err(e) => CheatResult::Revert(error_revert(&e.to_string())),
    }
}

/// Writes a raw storage slot.
fn cheat_store(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    match db::set_storage(
        ctx.db,
        arg_address(args, 0),
        arg_word(args, 1),
        arg_word(args, 2),
    ) {
        Ok(()) => CheatResult::Return(vec![]),
        Err(e) => CheatResult::Revert(error_revert(&e.to_string())),
    }
}

/// Reads a raw storage slot.
fn cheat_load(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    match db::read_storage(ctx.db, arg_address(args, 0), arg_word(args, 1)) {
        Ok(value) => CheatResult::Return(h256_of(value).0.to_vec()),
        Err(e) => CheatResult::Revert(error_revert(&e.to_string())),
    }
}

/// Replaces an address' code.
fn cheat_etch(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    match db::set_code(ctx.db, arg_address(args, 0), arg_bytes(args, 1)) {
        Ok(()) => CheatResult::Return(vec![]),
        Err(e) => CheatResult::Revert(error_revert(&e.to_string())),
    }
}

fn cheat_expect_revert_any(ctx: &mut CheatCtx<'_>, _args: &[AbiValue]) -> CheatResult {
    ctx.state.expected_revert = Some(RevertMatch::Any);
    CheatResult::Return(vec![])
}

fn cheat_expect_revert_selector(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    let bytes = arg_bytes(args, 0);
    let mut selector = [0u8; 4];
    selector.copy_from_slice(&bytes[..4.min(bytes.len())]);
    ctx.state.expected_revert = Some(RevertMatch::Selector(selector));
    CheatResult::Return(vec![])
}

fn cheat_expect_revert_bytes(ctx: &mut CheatCtx<'_>, args: &[AbiValue]) -> CheatResult {
    ctx.state.expected_revert = Some(RevertMatch::Exact(arg_bytes(args, 0)));
    CheatResult::Return(vec![])
}

fn cheat_expect_emit(ctx: &mut CheatCtx<'_>, _args: &[AbiValue]) -> CheatResult {
    ctx.state.expected_emits.push(EmitExpectation::Pending);
    CheatResult::Return(vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::encode_call;
    use crate::fork::ForkBackend;
    use revm::primitives::B256;

    fn ctx_parts() -> (Env, ChainDb, CheatcodeState) {
        (Env::default(), db::fresh(ForkBackend::Local), CheatcodeState::default())
    }

    fn run(env: &mut Env, db: &mut ChainDb, state: &mut CheatcodeState, data: &[u8]) -> CheatResult {
        let mut ctx = CheatCtx { env, db, state };
        dispatch(&mut ctx, data)
    }

    #[test]
    fn test_warp_and_roll() {
        let (mut env, mut db, mut state) = ctx_parts();
        let data = encode_call(
            selector_of("warp(uint256)"),
            &[AbiValue::Uint(U256::from(1234u64), 256)],
        );
        assert_eq!(
            run(&mut env, &mut db, &mut state, &data),
            CheatResult::Return(vec![])
        );
        assert_eq!(env.block.timestamp, U256::from(1234u64));

        let data = encode_call(
            selector_of("roll(uint256)"),
            &[AbiValue::Uint(U256::from(77u64), 256)],
        );
        run(&mut env, &mut db, &mut state, &data);
        assert_eq!(env.block.number, U256::from(77u64));
    }

    #[test]
    fn test_store_load_roundtrip() {
        let (mut env, mut db, mut state) = ctx_parts();
        let target = B160([9u8; 20]);
        let slot = [1u8; 32];
        let value = [2u8; 32];
        let data = encode_call(
            selector_of("store(address,bytes32,bytes32)"),
            &[
                AbiValue::Address(target),
                AbiValue::FixedBytes(slot.to_vec()),
                AbiValue::FixedBytes(value.to_vec()),
            ],
        );
        run(&mut env, &mut db, &mut state, &data);

        let data = encode_call(
            selector_of("load(address,bytes32)"),
            &[AbiValue::Address(target), AbiValue::FixedBytes(slot.to_vec())],
        );
        match run(&mut env, &mut db, &mut state, &data) {
            CheatResult::Return(out) => assert_eq!(out, value.to_vec()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_selector_reverts() {
        let (mut env, mut db, mut state) = ctx_parts();
        let result = run(&mut env, &mut db, &mut state, &[0xde, 0xad, 0xbe, 0xef]);
        match result {
            CheatResult::Revert(data) => {
                assert_eq!(&data[..4], &crate::reverts::ERROR_SELECTOR);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expect_emit_lifecycle() {
        let mut state = CheatcodeState::default();
        state.expected_emits.push(EmitExpectation::Pending);
        let pattern = RawLog {
            address: B160([1u8; 20]),
            topics: vec![B256([3u8; 32])],
            data: vec![1, 2, 3],
        };
        // declaration log arms the expectation
        state.observe_log(&pattern);
        assert!(matches!(state.expected_emits[0], EmitExpectation::Armed(_)));
        // matching log satisfies it
        state.observe_log(&pattern.clone());
        assert!(matches!(state.expected_emits[0], EmitExpectation::Matched));
        state.end_tx();
        assert!(state.violations.is_empty());
    }

    #[test]
    fn test_unmet_expectations_become_violations() {
        let mut state = CheatcodeState::default();
        state.expected_revert = Some(RevertMatch::Any);
        state.expected_emits.push(EmitExpectation::Pending);
        state.end_tx();
        assert_eq!(state.violations.len(), 2);
    }

    #[test]
    fn test_revert_match_forms() {
        assert!(RevertMatch::Any.matches(&[]));
        assert!(RevertMatch::Selector([1, 2, 3, 4]).matches(&[1, 2, 3, 4, 9]));
        assert!(!RevertMatch::Selector([1, 2, 3, 4]).matches(&[9, 2, 3, 4]));
        assert!(RevertMatch::Exact(vec![5, 6]).matches(&[5, 6]));
        assert!(!RevertMatch::Exact(vec![5, 6]).matches(&[5, 6, 7]));
    }
}
