/// Per-instruction coverage bitmaps, keyed by code hash
use std::collections::HashMap;

use crate::types::EVMHash;

/// Instruction-start PCs of a bytecode, push-data aware. Index `i` of the
/// returned vector is the rank of the instruction starting at PC
/// `offsets[i]`.
pub fn instruction_offsets(code: &[u8]) -> Vec<usize> {
    let mut offsets = vec![];
    let mut pc = 0usize;
    while pc < code.len() {
        offsets.push(pc);
        let op = code[pc];
        pc += 1;
        if (0x60..=0x7f).contains(&op) {
            pc += (op - 0x5f) as usize;
        }
    }
    offsets
}

/// Coverage of one bytecode: an `executed` and a `reverted-at` bitmap, one
/// bit per instruction. Bits only ever transition 0 → 1.
#[derive(Debug, Clone, Default)]
pub struct CodeCoverage {
    executed: Vec<u64>,
    reverted: Vec<u64>,
    pc_to_index: HashMap<usize, usize>,
    instruction_count: usize,
}

impl CodeCoverage {
    pub fn new(code: &[u8]) -> Self {
        let offsets = instruction_offsets(code);
        let words = (offsets.len() + 63) / 64;
        Self {
            executed: vec![0; words],
            reverted: vec![0; words],
            instruction_count: offsets.len(),
            pc_to_index: offsets
                .into_iter()
                .enumerate()
                .map(|(index, pc)| (pc, index))
                .collect(),
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_count
    }

    fn set_bit(words: &mut [u64], index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        let word = &mut words[index / 64];
        let fresh = *word & mask == 0;
        *word |= mask;
        fresh
    }

    /// Mark the instruction at `pc` executed; true if the bit is new.
    pub fn mark_executed(&mut self, pc: usize) -> bool {
        match self.pc_to_index.get(&pc) {
            Some(&index) => Self::set_bit(&mut self.executed, index),
            None => false,
        }
    }

    /// Mark the instruction at `pc` as a revert site; true if new.
    pub fn mark_reverted(&mut self, pc: usize) -> bool {
        match self.pc_to_index.get(&pc) {
            Some(&index) => Self::set_bit(&mut self.reverted, index),
            None => false,
        }
    }

    /// Union `other` in; returns how many bits were newly set.
    pub fn merge(&mut self, other: &CodeCoverage) -> u64 {
        let mut fresh = 0u64;
        for (mine, theirs) in self.executed.iter_mut().zip(&other.executed) {
            fresh += (*theirs & !*mine).count_ones() as u64;
            *mine |= *theirs;
        }
        for (mine, theirs) in self.reverted.iter_mut().zip(&other.reverted) {
            fresh += (*theirs & !*mine).count_ones() as u64;
            *mine |= *theirs;
        }
        fresh
    }

    pub fn bits_set(&self) -> u64 {
        self.executed
            .iter()
            .chain(self.reverted.iter())
            .map(|w| w.count_ones() as u64)
            .sum()
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Serialized form: executed bitmap followed by the reverted bitmap,
    /// both `instruction_count` bits long, little-endian bit order.
    pub fn encode(&self) -> Vec<u8> {
        let byte_len = (self.instruction_count + 7) / 8;
        let mut out = vec![0u8; byte_len * 2];
        for index in 0..self.instruction_count {
            if self.executed[index / 64] & (1u64 << (index % 64)) != 0 {
                out[index / 8] |= 1 << (index % 8);
            }
            if self.reverted[index / 64] & (1u64 << (index % 64)) != 0 {
                out[byte_len + index / 8] |= 1 << (index % 8);
            }
        }
        out
    }
}

/// Coverage key: which bytecode, and whether it was running as init code.
pub type CoverageKey = (EVMHash, bool);

/// A set of per-code bitmaps. Workers each own a local map; the campaign
/// owns a global one, merged under a single lock so the new-bit decision
/// is serialized.
#[derive(Debug, Clone, Default)]
pub struct CoverageMap {
    codes: HashMap<CoverageKey, CodeCoverage>,
}

impl CoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently start tracking a bytecode.
    pub fn register(&mut self, hash: EVMHash, is_init: bool, code: &[u8]) {
        self.codes
            .entry((hash, is_init))
            .or_insert_with(|| CodeCoverage::new(code));
    }

    pub fn is_registered(&self, hash: EVMHash, is_init: bool) -> bool {
        self.codes.contains_key(&(hash, is_init))
    }

    pub fn mark_executed(&mut self, hash: EVMHash, is_init: bool, pc: usize) {
        if let Some(coverage) = self.codes.get_mut(&(hash, is_init)) {
            coverage.mark_executed(pc);
        }
    }

    pub fn mark_reverted(&mut self, hash: EVMHash, is_init: bool, pc: usize) {
        if let Some(coverage) = self.codes.get_mut(&(hash, is_init)) {
            coverage.mark_reverted(pc);
        }
    }

    /// OR-merge a worker map in. Unknown codes are adopted wholesale.
    /// Returns the number of newly set bits: the caller's coverage delta.
    pub fn merge(&mut self, other: &CoverageMap) -> u64 {
        let mut fresh = 0u64;
        for (key, theirs) in &other.codes {
            match self.codes.get_mut(key) {
                Some(mine) => fresh += mine.merge(theirs),
                None => {
                    fresh += theirs.bits_set();
                    self.codes.insert(*key, theirs.clone());
                }
            }
        }
        fresh
    }

    pub fn bits_set(&self) -> u64 {
        self.codes.values().map(|c| c.bits_set()).sum()
    }

    pub fn encode_code(&self, hash: EVMHash, is_init: bool) -> Option<Vec<u8>> {
        self.codes.get(&(hash, is_init)).map(|c| c.encode())
    }

    pub fn code_coverage(&self, hash: EVMHash, is_init: bool) -> Option<&CodeCoverage> {
        self.codes.get(&(hash, is_init))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revm::primitives::B256;

    // PUSH2 0xffff; JUMPDEST; STOP  -> instructions at pc 0, 3, 4
    const CODE: &[u8] = &[0x61, 0xff, 0xff, 0x5b, 0x00];

    fn hash(byte: u8) -> EVMHash {
        B256([byte; 32])
    }

    #[test]
    fn test_instruction_offsets_skip_push_data() {
        assert_eq!(instruction_offsets(CODE), vec![0, 3, 4]);
    }

    #[test]
    fn test_push_data_pcs_are_ignored() {
        let mut coverage = CodeCoverage::new(CODE);
        assert!(coverage.mark_executed(0));
        assert!(!coverage.mark_executed(1));
        assert_eq!(coverage.bits_set(), 1);
    }

    #[test]
    fn test_monotone_bits() {
        let mut coverage = CodeCoverage::new(CODE);
        assert!(coverage.mark_executed(3));
        assert!(!coverage.mark_executed(3));
        assert!(coverage.mark_reverted(3));
        assert!(!coverage.mark_reverted(3));
        assert_eq!(coverage.bits_set(), 2);
    }

    #[test]
    fn test_merge_delta_serialized() {
        let mut global = CoverageMap::new();
        global.register(hash(1), false, CODE);

        let mut local = CoverageMap::new();
        local.register(hash(1), false, CODE);
        local.mark_executed(hash(1), false, 0);
        local.mark_executed(hash(1), false, 4);

        // first merge claims both bits, the identical second merge none
        assert_eq!(global.merge(&local), 2);
        assert_eq!(global.merge(&local), 0);

        let mut other = CoverageMap::new();
        other.register(hash(1), false, CODE);
        other.mark_executed(hash(1), false, 0);
        other.mark_reverted(hash(1), false, 3);
        assert_eq!(global.merge(&other), 1);
        assert_eq!(global.bits_set(), 3);
    }

    #[test]
    fn test_merge_adopts_unknown_codes() {
        let mut global = CoverageMap::new();
        let mut local = CoverageMap::new();
        local.register(hash(2), true, CODE);
        local.mark_executed(hash(2), true, 0);
        assert_eq!(global.merge(&local), 1);
        assert!(global.is_registered(hash(2), true));
    }

    #[test]
    fn test_encode_little_endian_bit_order() {
        let mut coverage = CodeCoverage::new(CODE);
        coverage.mark_executed(0); // instruction rank 0
        coverage.mark_executed(4); // instruction rank 2
        coverage.mark_reverted(3); // instruction rank 1
        let encoded = coverage.encode();
        // 3 instructions -> 1 byte per bitmap
        assert_eq!(encoded.len(), 2);
        assert_eq!(encoded[0], 0b0000_0101);
        assert_eq!(encoded[1], 0b0000_0010);
    }
}
