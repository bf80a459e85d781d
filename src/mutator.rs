/// Typed value generation and mutation, fed by mined and observed literals
use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::abi::{AbiType, AbiValue};
use crate::sequence::{Call, CallSequence};
use crate::types::{be_to_u256, u256_to_be, EVMAddress, EVMU256};
use revm::primitives::B160;

/// Shared pool of interesting values: constants mined from bytecode at
/// load time plus values observed by the value-generation tracer at run
/// time. Per-worker pools merge into a global one at report boundaries.
#[derive(Debug, Clone, Default)]
pub struct ValuePool {
    words: Vec<[u8; 32]>,
    blobs: Vec<Vec<u8>>,
    addresses: Vec<EVMAddress>,
    seen_words: HashSet<[u8; 32]>,
    seen_blobs: HashSet<Vec<u8>>,
    seen_addresses: HashSet<EVMAddress>,
}

impl ValuePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb a raw literal: short ones widen into a word, long ones are
    /// kept as byte blobs, 20-byte ones double as address candidates.
    pub fn add_literal(&mut self, literal: &[u8]) {
        if literal.is_empty() {
            return;
        }
        if literal.len() <= 32 {
            let mut word = [0u8; 32];
            word[32 - literal.len()..].copy_from_slice(literal);
            self.add_word_raw(word);
        } else {
            self.add_blob(literal.to_vec());
        }
        if literal.len() == 20 {
            let mut address = [0u8; 20];
            address.copy_from_slice(literal);
            self.add_address(B160(address));
        }
    }

    fn add_word_raw(&mut self, word: [u8; 32]) {
        if self.seen_words.insert(word) {
            self.words.push(word);
        }
    }

    pub fn add_word(&mut self, value: EVMU256) {
        self.add_word_raw(u256_to_be(value));
    }

    pub fn add_blob(&mut self, blob: Vec<u8>) {
        if self.seen_blobs.insert(blob.clone()) {
            self.blobs.push(blob);
        }
    }

    pub fn add_address(&mut self, address: EVMAddress) {
        if self.seen_addresses.insert(address) {
            self.addresses.push(address);
        }
    }

    pub fn merge_into(&self, other: &mut ValuePool) {
        for word in &self.words {
            other.add_word_raw(*word);
        }
        for blob in &self.blobs {
            other.add_blob(blob.clone());
        }
        for address in &self.addresses {
            other.add_address(*address);
        }
    }

    pub fn words(&self) -> &[[u8; 32]] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len() + self.blobs.len() + self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn draw_word(&self, rng: &mut StdRng) -> Option<EVMU256> {
        self.words.choose(rng).map(|w| be_to_u256(w))
    }

    fn draw_blob(&self, rng: &mut StdRng) -> Option<Vec<u8>> {
        self.blobs.choose(rng).cloned()
    }

    fn draw_address(&self, rng: &mut StdRng) -> Option<EVMAddress> {
        self.addresses.choose(rng).copied()
    }
}

fn uint_max(bits: usize) -> EVMU256 {
    if bits >= 256 {
        EVMU256::MAX
    } else {
        (EVMU256::from(1u64) << bits) - EVMU256::from(1u64)
    }
}

/// Two's complement minimum of a signed type, as its 256-bit word.
fn int_min_word(bits: usize) -> EVMU256 {
    EVMU256::MAX - (EVMU256::from(1u64) << (bits - 1)) + EVMU256::from(1u64)
}

fn int_max_word(bits: usize) -> EVMU256 {
    (EVMU256::from(1u64) << (bits - 1)) - EVMU256::from(1u64)
}

fn random_word(rng: &mut StdRng) -> EVMU256 {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes[..]);
    be_to_u256(&bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    LiteralPool,
    Boundary,
    Mutation,
    FreshRandom,
}

fn pick_strategy(rng: &mut StdRng, pool: &ValuePool, has_previous: bool) -> Strategy {
    let roll = rng.gen_range(0..100u32);
    match roll {
        0..=34 if !pool.is_empty() => Strategy::LiteralPool,
        35..=59 => Strategy::Boundary,
        60..=84 if has_previous => Strategy::Mutation,
        _ => Strategy::FreshRandom,
    }
}

fn boundary_word(rng: &mut StdRng, bits: usize, signed: bool) -> EVMU256 {
    if signed {
        match rng.gen_range(0..5u32) {
            0 => EVMU256::ZERO,
            1 => EVMU256::from(1u64),
            2 => EVMU256::MAX, // -1 in two's complement
            3 => int_min_word(bits),
            _ => int_max_word(bits),
        }
    } else {
        match rng.gen_range(0..5u32) {
            0 => EVMU256::ZERO,
            1 => EVMU256::from(1u64),
            2 => EVMU256::from(2u64),
            3 => uint_max(bits),
            _ => uint_max(bits) - EVMU256::from(1u64),
        }
    }
}

fn tweak_word(rng: &mut StdRng, current: EVMU256) -> EVMU256 {
    match rng.gen_range(0..3u32) {
        // bit flip
        0 => current ^ (EVMU256::from(1u64) << rng.gen_range(0..256usize)),
        // arithmetic tweak
        1 => {
            let delta = EVMU256::from(rng.gen_range(1..=16u64));
            if rng.gen_bool(0.5) {
                current.wrapping_add(delta)
            } else {
                current.wrapping_sub(delta)
            }
        }
        // byte splice
        _ => {
            let mut bytes = u256_to_be(current);
            bytes[rng.gen_range(0..32usize)] = rng.gen();
            be_to_u256(&bytes)
        }
    }
}

fn mask_for(ty: &AbiType, word: EVMU256) -> EVMU256 {
    match ty {
        AbiType::Uint(bits) => word & uint_max(*bits),
        // signed words stay full width; the ABI carries sign extension
        AbiType::Int(_) => word,
        _ => word,
    }
}

const MAX_FRESH_BLOB: usize = 96;
const MAX_FRESH_ARRAY: usize = 4;

/// Produce a value of `ty`, drawing from the pool, boundaries, or fresh
/// randomness. Deterministic for a given RNG state and pool content.
pub fn generate_value(
    ty: &AbiType,
    rng: &mut StdRng,
    pool: &ValuePool,
    senders: &[EVMAddress],
) -> AbiValue {
    match ty {
        AbiType::Uint(bits) => {
            let word = match pick_strategy(rng, pool, false) {
                Strategy::LiteralPool => pool.draw_word(rng).unwrap_or_else(|| random_word(rng)),
                Strategy::Boundary => boundary_word(rng, *bits, false),
                _ => random_word(rng),
            };
            AbiValue::Uint(mask_for(ty, word), *bits)
        }
        AbiType::Int(bits) => {
            let word = match pick_strategy(rng, pool, false) {
                Strategy::LiteralPool => pool.draw_word(rng).unwrap_or_else(|| random_word(rng)),
                Strategy::Boundary => boundary_word(rng, *bits, true),
                _ => random_word(rng),
            };
            AbiValue::Int(word, *bits)
        }
        AbiType::Address => {
            let address = match rng.gen_range(0..4u32) {
                0 if !senders.is_empty() => senders[rng.gen_range(0..senders.len())],
                1 => pool
                    .draw_address(rng)
                    .or_else(|| senders.first().copied())
                    .unwrap_or_else(|| B160([0u8; 20])),
                2 => B160([0u8; 20]),
                _ => {
                    let mut bytes = [0u8; 20];
                    rng.fill(&mut bytes[..]);
                    B160(bytes)
                }
            };
            AbiValue::Address(address)
        }
        AbiType::Bool => AbiValue::Bool(rng.gen_bool(0.5)),
        AbiType::FixedBytes(n) => {
            let word = match pick_strategy(rng, pool, false) {
                Strategy::LiteralPool => pool.draw_word(rng).unwrap_or_else(|| random_word(rng)),
                _ => random_word(rng),
            };
            AbiValue::FixedBytes(u256_to_be(word)[32 - n..].to_vec())
        }
        AbiType::Bytes => {
            let blob = match pick_strategy(rng, pool, false) {
                Strategy::LiteralPool => pool.draw_blob(rng),
                _ => None,
            }
            .unwrap_or_else(|| {
                let len = rng.gen_range(0..=MAX_FRESH_BLOB);
                (0..len).map(|_| rng.gen()).collect()
            });
            AbiValue::Bytes(blob)
        }
        AbiType::String => {
            let len = rng.gen_range(0..=MAX_FRESH_BLOB / 2);
            let body: String = (0..len)
                .map(|_| char::from(rng.gen_range(b' '..=b'~')))
                .collect();
            AbiValue::Str(body)
        }
        AbiType::Array(inner) => {
            let len = rng.gen_range(0..=MAX_FRESH_ARRAY);
            AbiValue::Array(
                (**inner).clone(),
                (0..len)
                    .map(|_| generate_value(inner, rng, pool, senders))
                    .collect(),
            )
        }
        AbiType::FixedArray(inner, n) => AbiValue::FixedArray(
            (0..*n)
                .map(|_| generate_value(inner, rng, pool, senders))
                .collect(),
        ),
        AbiType::Tuple(parts) => AbiValue::Tuple(
            parts
                .iter()
                .map(|part| generate_value(part, rng, pool, senders))
                .collect(),
        ),
    }
}

/// Perturb an existing value in place.
pub fn mutate_value(
    value: &mut AbiValue,
    rng: &mut StdRng,
    pool: &ValuePool,
    senders: &[EVMAddress],
) {
    match value {
        AbiValue::Uint(word, bits) => {
            let next = match pick_strategy(rng, pool, true) {
                Strategy::LiteralPool => pool.draw_word(rng).unwrap_or_else(|| tweak_word(rng, *word)),
                Strategy::Boundary => boundary_word(rng, *bits, false),
                Strategy::Mutation => tweak_word(rng, *word),
                Strategy::FreshRandom => random_word(rng),
            };
            *word = next & uint_max(*bits);
        }
        AbiValue::Int(word, bits) => {
            let next = match pick_strategy(rng, pool, true) {
                Strategy::LiteralPool => pool.draw_word(rng).unwrap_or_else(|| tweak_word(rng, *word)),
                Strategy::Boundary => boundary_word(rng, *bits, true),
                Strategy::Mutation => tweak_word(rng, *word),
                Strategy::FreshRandom => random_word(rng),
            };
            *word = next;
        }
        AbiValue::Address(_) | AbiValue::Bool(_) => {
            *value = generate_value(&value.type_of(), rng, pool, senders);
        }
        AbiValue::FixedBytes(bytes) => {
            if !bytes.is_empty() {
                let index = rng.gen_range(0..bytes.len());
                bytes[index] ^= 1 << rng.gen_range(0..8u32);
            }
        }
        AbiValue::Bytes(blob) => match rng.gen_range(0..3u32) {
            0 => blob.push(rng.gen()),
            1 => {
                blob.pop();
            }
            _ => {
                if blob.is_empty() {
                    blob.push(rng.gen());
                } else {
                    let index = rng.gen_range(0..blob.len());
                    blob[index] = rng.gen();
                }
            }
        },
        AbiValue::Str(body) => {
            if rng.gen_bool(0.5) && !body.is_empty() {
                body.pop();
            } else {
                body.push(char::from(rng.gen_range(b' '..=b'~')));
            }
        }
        AbiValue::Array(elem_ty, items) => match rng.gen_range(0..3u32) {
            0 if items.len() < MAX_FRESH_ARRAY * 4 => {
                items.push(generate_value(elem_ty, rng, pool, senders))
            }
            1 if !items.is_empty() => {
                items.remove(rng.gen_range(0..items.len()));
            }
            _ => {
                if let Some(item) = items.choose_mut(rng) {
                    mutate_value(item, rng, pool, senders);
                } else {
                    items.push(generate_value(elem_ty, rng, pool, senders));
                }
            }
        },
        AbiValue::FixedArray(items) | AbiValue::Tuple(items) => {
            if let Some(item) = items.choose_mut(rng) {
                mutate_value(item, rng, pool, senders);
            }
        }
    }
}

/// Structural sequence mutations. `tweak_call` perturbs one call's
/// arguments; `fresh_call` synthesizes a brand new one. Both are supplied
/// by the worker, which knows the deployed targets.
pub fn mutate_sequence<T, F>(
    sequence: &mut CallSequence,
    rng: &mut StdRng,
    max_len: usize,
    sender_count: usize,
    mut tweak_call: T,
    mut fresh_call: F,
) where
    T: FnMut(&mut Call, &mut StdRng),
    F: FnMut(&mut StdRng) -> Option<Call>,
{
    if sequence.calls.is_empty() {
        if let Some(call) = fresh_call(rng) {
            sequence.calls.push(call);
        }
        return;
    }
    let rounds = 1 + rng.gen_range(0..3u32);
    for _ in 0..rounds {
        match rng.gen_range(0..5u32) {
            // perturb one call's arguments
            0 => {
                let index = rng.gen_range(0..sequence.calls.len());
                tweak_call(&mut sequence.calls[index], rng);
            }
            // swap the sender
            1 => {
                let index = rng.gen_range(0..sequence.calls.len());
                sequence.calls[index].sender = rng.gen_range(0..sender_count.max(1)) as u32;
            }
            // insert a new call
            2 => {
                if sequence.calls.len() < max_len {
                    if let Some(call) = fresh_call(rng) {
                        let index = rng.gen_range(0..=sequence.calls.len());
                        sequence.calls.insert(index, call);
                    }
                }
            }
            // delete a call
            3 => {
                if sequence.calls.len() > 1 {
                    let index = rng.gen_range(0..sequence.calls.len());
                    sequence.calls.remove(index);
                }
            }
            // duplicate with a tweak
            _ => {
                if sequence.calls.len() < max_len {
                    let index = rng.gen_range(0..sequence.calls.len());
                    let mut copy = sequence.calls[index].clone();
                    tweak_call(&mut copy, rng);
                    sequence.calls.insert(index, copy);
                }
            }
        }
    }
    sequence.calls.truncate(max_len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_pool_dedup_and_merge() {
        let mut local = ValuePool::new();
        local.add_literal(&[0xde, 0xad]);
        local.add_literal(&[0xde, 0xad]);
        local.add_literal(&[0xaa; 20]);
        assert_eq!(local.words.len(), 2);
        assert_eq!(local.addresses.len(), 1);

        let mut global = ValuePool::new();
        global.add_literal(&[0xde, 0xad]);
        local.merge_into(&mut global);
        assert_eq!(global.words.len(), 2);
        assert_eq!(global.addresses.len(), 1);
    }

    #[test]
    fn test_generated_uint_respects_width() {
        let mut rng = StdRng::seed_from_u64(3);
        let pool = ValuePool::new();
        for _ in 0..64 {
            match generate_value(&AbiType::Uint(8), &mut rng, &pool, &[]) {
                AbiValue::Uint(word, 8) => assert!(word <= EVMU256::from(255u64)),
                other => panic!("unexpected value {:?}", other),
            }
        }
    }

    #[test]
    fn test_generation_is_deterministic() {
        let mut pool = ValuePool::new();
        pool.add_literal(&[0x12, 0x34]);
        let ty = AbiType::Tuple(vec![AbiType::Uint(256), AbiType::Bytes, AbiType::Address]);
        let a = generate_value(&ty, &mut StdRng::seed_from_u64(99), &pool, &[]);
        let b = generate_value(&ty, &mut StdRng::seed_from_u64(99), &pool, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_int_boundaries() {
        assert_eq!(int_max_word(8), EVMU256::from(127u64));
        // -128 as a 256-bit word ends in 0x80 with a full sign extension
        let min = int_min_word(8);
        let bytes = u256_to_be(min);
        assert_eq!(bytes[31], 0x80);
        assert!(bytes[..31].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn test_sequence_mutation_respects_cap() {
        let mut rng = StdRng::seed_from_u64(5);
        let base = Call::to_contract(0, B160([1u8; 20]), vec![1, 2, 3, 4]);
        let mut sequence = CallSequence::new(vec![base.clone()]);
        for _ in 0..50 {
            mutate_sequence(
                &mut sequence,
                &mut rng,
                3,
                2,
                |call, rng| call.data.push(rng.gen()),
                |_| Some(base.clone()),
            );
            assert!(!sequence.is_empty());
            assert!(sequence.len() <= 3);
            for call in &sequence.calls {
                assert!(call.sender < 2);
            }
        }
    }
}
