//! Byte-level mutators in the style of AFL's deterministic and havoc stages.
//!
//! Every mutator copies its input before touching it. Inputs too short for a
//! mutator's width come back unchanged.

use super::{InputType, MutationError, MutationType, Mutator};
use crate::random::SharedRandom;

/// AFL's default bound for arithmetic deltas.
pub const ARITH_MAX: u32 = 35;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 10] = [
    -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];

pub const INTERESTING_32: [i32; 8] = [
    i32::MIN,
    -100_663_046,
    -32769,
    32768,
    65535,
    65536,
    100_663_045,
    i32::MAX,
];

fn check_width(width: usize) -> usize {
    match width {
        1 | 2 | 4 => width,
        _ => 1,
    }
}

/// True when `offset..offset + width` does not fit in `len`, including on overflow.
fn window_exceeds(offset: usize, width: usize, len: usize) -> bool {
    offset.checked_add(width).is_none_or(|end| end > len)
}

fn width_mask(width: usize) -> u64 {
    (1u64 << (width * 8)) - 1
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn write_be(dst: &mut [u8], value: u64) {
    let width = dst.len();
    let be = value.to_be_bytes();
    dst.copy_from_slice(&be[8 - width..]);
}

fn parse_integer(input: &[u8]) -> Option<i64> {
    std::str::from_utf8(input).ok()?.trim().parse::<i64>().ok()
}

/// Flips `width` contiguous bits. Bits are numbered MSB first within a byte.
pub struct BitFlipMutator {
    width: usize,
    name: String,
    rng: SharedRandom,
}

impl BitFlipMutator {
    pub fn new(width: usize, rng: SharedRandom) -> Self {
        let width = check_width(width);
        Self {
            width,
            name: format!("bitflip_{width}"),
            rng,
        }
    }

    pub fn mutate_at(&self, input: &[u8], bit_pos: usize) -> Result<Vec<u8>, MutationError> {
        let total_bits = input.len() * 8;
        if window_exceeds(bit_pos, self.width, total_bits) {
            return Err(MutationError::OutOfRange {
                offset: bit_pos,
                width: self.width,
                len: total_bits,
            });
        }
        let mut out = input.to_vec();
        for bit in bit_pos..bit_pos + self.width {
            out[bit / 8] ^= 0x80 >> (bit % 8);
        }
        Ok(out)
    }
}

impl Mutator for BitFlipMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Flips contiguous bits at a random bit offset"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let total_bits = input.len() * 8;
        if total_bits < self.width {
            return Ok(input.to_vec());
        }
        let bit_pos = self.rng.uniform_int(total_bits - self.width + 1);
        self.mutate_at(input, bit_pos)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::BitFlip
    }
}

/// XORs `width` contiguous bytes with `0xFF`.
pub struct ByteFlipMutator {
    width: usize,
    name: String,
    rng: SharedRandom,
}

impl ByteFlipMutator {
    pub fn new(width: usize, rng: SharedRandom) -> Self {
        let width = check_width(width);
        Self {
            width,
            name: format!("byteflip_{width}"),
            rng,
        }
    }

    pub fn mutate_at(&self, input: &[u8], pos: usize) -> Result<Vec<u8>, MutationError> {
        if window_exceeds(pos, self.width, input.len()) {
            return Err(MutationError::OutOfRange {
                offset: pos,
                width: self.width,
                len: input.len(),
            });
        }
        let mut out = input.to_vec();
        out[pos..pos + self.width].iter_mut().for_each(|b| *b ^= 0xFF);
        Ok(out)
    }
}

impl Mutator for ByteFlipMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Inverts contiguous bytes at a random offset"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if input.len() < self.width {
            return Ok(input.to_vec());
        }
        let pos = self.rng.uniform_int(input.len() - self.width + 1);
        self.mutate_at(input, pos)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::BitFlip
    }
}

/// Adds a small signed delta to a big-endian integer, wrapping on overflow.
pub struct ArithmeticMutator {
    width: usize,
    max_delta: u32,
    name: String,
    rng: SharedRandom,
}

impl ArithmeticMutator {
    pub fn new(width: usize, max_delta: u32, rng: SharedRandom) -> Self {
        let width = check_width(width);
        Self {
            width,
            max_delta,
            name: format!("arith_{}", width * 8),
            rng,
        }
    }

    /// A delta in `[-max_delta, max_delta]`, never zero.
    fn random_delta(&self) -> i64 {
        let max = i64::from(self.max_delta);
        let span = (2 * self.max_delta as usize) + 1;
        let delta = self.rng.uniform_int(span) as i64 - max;
        if delta == 0 { 1 } else { delta }
    }

    pub fn mutate_at(
        &self,
        input: &[u8],
        offset: usize,
        delta: i64,
    ) -> Result<Vec<u8>, MutationError> {
        if window_exceeds(offset, self.width, input.len()) {
            return Err(MutationError::OutOfRange {
                offset,
                width: self.width,
                len: input.len(),
            });
        }
        let mut out = input.to_vec();
        let window = &mut out[offset..offset + self.width];
        let value = read_be(window);
        let updated = (value as i64).wrapping_add(delta) as u64 & width_mask(self.width);
        write_be(window, updated);
        Ok(out)
    }

    /// Treats the input as a decimal integer string. Falls back to raw-byte
    /// arithmetic when it does not parse.
    pub fn mutate_integer_string(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        match parse_integer(input) {
            Some(value) => Ok(value
                .wrapping_add(self.random_delta())
                .to_string()
                .into_bytes()),
            None => self.mutate(input),
        }
    }
}

impl Mutator for ArithmeticMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Adds a bounded random delta to an integer at a random offset"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if input.len() < self.width {
            return Ok(input.to_vec());
        }
        let offset = self.rng.uniform_int(input.len() - self.width + 1);
        self.mutate_at(input, offset, self.random_delta())
    }

    fn mutate_with_type(
        &self,
        input: &[u8],
        input_type: InputType,
    ) -> Result<Vec<u8>, MutationError> {
        match input_type {
            InputType::Integer => self.mutate_integer_string(input),
            _ => self.mutate(input),
        }
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::ArithmeticAdd
    }
}

/// Overwrites an integer slot with a boundary constant.
pub struct InterestingValueMutator {
    width: usize,
    name: String,
    values: Vec<i64>,
    rng: SharedRandom,
}

impl InterestingValueMutator {
    pub fn new(width: usize, rng: SharedRandom) -> Self {
        let width = check_width(width);
        let mut values: Vec<i64> = INTERESTING_8.iter().map(|v| i64::from(*v)).collect();
        if width >= 2 {
            values.extend(INTERESTING_16.iter().map(|v| i64::from(*v)));
        }
        if width >= 4 {
            values.extend(INTERESTING_32.iter().map(|v| i64::from(*v)));
        }
        Self {
            width,
            name: format!("interesting_{}", width * 8),
            values,
            rng,
        }
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    fn pick(&self) -> i64 {
        self.values[self.rng.uniform_int(self.values.len())]
    }

    /// Replaces the whole string with a stringified interesting value.
    pub fn mutate_integer_string(&self, _input: &[u8]) -> Vec<u8> {
        self.pick().to_string().into_bytes()
    }
}

impl Mutator for InterestingValueMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Substitutes a classic boundary integer at a random offset"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if input.len() < self.width {
            return Ok(input.to_vec());
        }
        let offset = self.rng.uniform_int(input.len() - self.width + 1);
        let mut out = input.to_vec();
        let window = &mut out[offset..offset + self.width];
        write_be(window, self.pick() as u64 & width_mask(self.width));
        if self.width > 1 && self.rng.coin() {
            window.reverse();
        }
        Ok(out)
    }

    fn mutate_with_type(
        &self,
        input: &[u8],
        input_type: InputType,
    ) -> Result<Vec<u8>, MutationError> {
        match input_type {
            InputType::Integer => Ok(self.mutate_integer_string(input)),
            _ => self.mutate(input),
        }
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::InterestingValues
    }
}

/// Swaps an adjacent byte pair (width 2) or reverses a 4-byte window.
pub struct ByteSwapMutator {
    width: usize,
    name: String,
    rng: SharedRandom,
}

impl ByteSwapMutator {
    pub fn new(width: usize, rng: SharedRandom) -> Self {
        let width = if width == 4 { 4 } else { 2 };
        Self {
            width,
            name: format!("byteswap_{width}"),
            rng,
        }
    }
}

impl Mutator for ByteSwapMutator {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Swaps byte order inside a small window"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if input.len() < self.width {
            return Ok(input.to_vec());
        }
        let offset = self.rng.uniform_int(input.len() - self.width + 1);
        let mut out = input.to_vec();
        out[offset..offset + self.width].reverse();
        Ok(out)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::ByteSwap
    }
}

/// Replaces `count` positions, chosen with replacement, with random bytes.
pub struct RandomByteMutator {
    count: usize,
    rng: SharedRandom,
}

impl RandomByteMutator {
    pub fn new(count: usize, rng: SharedRandom) -> Self {
        Self {
            count: count.max(1),
            rng,
        }
    }
}

impl Mutator for RandomByteMutator {
    fn name(&self) -> &str {
        "random_byte"
    }

    fn description(&self) -> &str {
        "Overwrites random positions with random bytes"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let mut out = input.to_vec();
        if out.is_empty() {
            return Ok(out);
        }
        for _ in 0..self.count {
            let pos = self.rng.uniform_int(out.len());
            out[pos] = self.rng.byte();
        }
        Ok(out)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Havoc
    }
}

/// Removes a contiguous run of bytes, always leaving at least one.
pub struct DeleteMutator {
    max_delete: usize,
    rng: SharedRandom,
}

impl DeleteMutator {
    pub fn new(max_delete: usize, rng: SharedRandom) -> Self {
        Self {
            max_delete: max_delete.max(1),
            rng,
        }
    }
}

impl Mutator for DeleteMutator {
    fn name(&self) -> &str {
        "delete"
    }

    fn description(&self) -> &str {
        "Deletes a contiguous run of bytes"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if input.len() <= 1 {
            return Ok(input.to_vec());
        }
        let limit = self.max_delete.min(input.len() - 1);
        let n = 1 + self.rng.uniform_int(limit);
        let offset = self.rng.uniform_int(input.len() - n + 1);
        let mut out = Vec::with_capacity(input.len() - n);
        out.extend_from_slice(&input[..offset]);
        out.extend_from_slice(&input[offset + n..]);
        Ok(out)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Havoc
    }
}

/// Inserts a run of random bytes, possibly at the very end.
pub struct InsertMutator {
    max_insert: usize,
    rng: SharedRandom,
}

impl InsertMutator {
    pub fn new(max_insert: usize, rng: SharedRandom) -> Self {
        Self {
            max_insert: max_insert.max(1),
            rng,
        }
    }
}

impl Mutator for InsertMutator {
    fn name(&self) -> &str {
        "insert"
    }

    fn description(&self) -> &str {
        "Inserts random bytes at a random offset"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        let n = 1 + self.rng.uniform_int(self.max_insert);
        let offset = self.rng.uniform_int(input.len() + 1);
        let mut out = Vec::with_capacity(input.len() + n);
        out.extend_from_slice(&input[..offset]);
        out.extend(self.rng.bytes(n));
        out.extend_from_slice(&input[offset..]);
        Ok(out)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Havoc
    }
}

/// Copies a run of the input and splices it in elsewhere.
pub struct CloneMutator {
    max_clone: usize,
    rng: SharedRandom,
}

impl CloneMutator {
    pub fn new(max_clone: usize, rng: SharedRandom) -> Self {
        Self {
            max_clone: max_clone.max(1),
            rng,
        }
    }
}

impl Mutator for CloneMutator {
    fn name(&self) -> &str {
        "clone"
    }

    fn description(&self) -> &str {
        "Duplicates a run of bytes at a random destination"
    }

    fn mutate(&self, input: &[u8]) -> Result<Vec<u8>, MutationError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let n = 1 + self.rng.uniform_int(self.max_clone.min(input.len()));
        let src = self.rng.uniform_int(input.len() - n + 1);
        let dst = self.rng.uniform_int(input.len() + 1);
        let mut out = Vec::with_capacity(input.len() + n);
        out.extend_from_slice(&input[..dst]);
        out.extend_from_slice(&input[src..src + n]);
        out.extend_from_slice(&input[dst..]);
        Ok(out)
    }

    fn mutation_type(&self) -> MutationType {
        MutationType::Havoc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandom;

    fn rng() -> SharedRandom {
        SeededRandom::shared(0xA5A5)
    }

    fn bit_diff(a: &[u8], b: &[u8]) -> u32 {
        a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
    }

    #[test]
    fn bitflip_at_flips_exactly_width_bits_and_is_involutive() {
        let input = b"\x00\xFF\x5A\x01".to_vec();
        for width in [1, 2, 4] {
            let m = BitFlipMutator::new(width, rng());
            for pos in 0..=(input.len() * 8 - width) {
                let once = m.mutate_at(&input, pos).unwrap();
                assert_eq!(bit_diff(&input, &once), width as u32);
                assert_eq!(m.mutate_at(&once, pos).unwrap(), input);
            }
        }
    }

    #[test]
    fn bitflip_at_is_msb_first() {
        let m = BitFlipMutator::new(1, rng());
        assert_eq!(m.mutate_at(&[0x00], 0).unwrap(), vec![0x80]);
        assert_eq!(m.mutate_at(&[0x00], 7).unwrap(), vec![0x01]);
    }

    #[test]
    fn bitflip_at_out_of_range_errors() {
        let m = BitFlipMutator::new(4, rng());
        assert_eq!(
            m.mutate_at(&[0u8], 5),
            Err(MutationError::OutOfRange {
                offset: 5,
                width: 4,
                len: 8
            })
        );
        assert!(m.mutate(&[]).unwrap().is_empty());
    }

    #[test]
    fn explicit_offsets_near_usize_max_are_out_of_range() {
        let far = usize::MAX - 1;
        assert!(matches!(
            BitFlipMutator::new(4, rng()).mutate_at(&[0u8; 4], far),
            Err(MutationError::OutOfRange { .. })
        ));
        assert!(matches!(
            ByteFlipMutator::new(4, rng()).mutate_at(&[0u8; 4], far),
            Err(MutationError::OutOfRange { .. })
        ));
        assert!(matches!(
            ArithmeticMutator::new(4, ARITH_MAX, rng()).mutate_at(&[0u8; 4], far, 1),
            Err(MutationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn byteflip_at_xors_window_and_restores() {
        let input = vec![1u8, 2, 3, 4, 5];
        let m = ByteFlipMutator::new(2, rng());
        let once = m.mutate_at(&input, 1).unwrap();
        assert_eq!(once, vec![1, !2, !3, 4, 5]);
        assert_eq!(m.mutate_at(&once, 1).unwrap(), input);
        assert!(m.mutate_at(&input, 4).is_err());
        assert_eq!(ByteFlipMutator::new(4, rng()).mutate(&[9, 9]).unwrap(), vec![9, 9]);
    }

    #[test]
    fn arithmetic_wraps_big_endian() {
        let m = ArithmeticMutator::new(2, ARITH_MAX, rng());
        assert_eq!(m.mutate_at(&[0xFF, 0xFF], 0, 1).unwrap(), vec![0x00, 0x00]);
        assert_eq!(m.mutate_at(&[0x00, 0x00], 0, -1).unwrap(), vec![0xFF, 0xFF]);
        assert_eq!(m.mutate_at(&[0x01, 0x00], 0, 2).unwrap(), vec![0x01, 0x02]);
        assert!(m.mutate_at(&[0x00], 0, 1).is_err());
    }

    #[test]
    fn arithmetic_random_mutation_changes_one_window() {
        let m = ArithmeticMutator::new(1, ARITH_MAX, rng());
        let input = vec![100u8; 8];
        for _ in 0..50 {
            let out = m.mutate(&input).unwrap();
            let changed: Vec<_> = out.iter().zip(&input).filter(|(a, b)| a != b).collect();
            assert_eq!(changed.len(), 1);
            let diff = (*changed[0].0 as i32 - *changed[0].1 as i32).abs();
            assert!((1..=ARITH_MAX as i32).contains(&diff));
        }
    }

    #[test]
    fn arithmetic_integer_string_variant() {
        let m = ArithmeticMutator::new(4, 5, rng());
        for _ in 0..20 {
            let out = m.mutate_with_type(b"-40", InputType::Integer).unwrap();
            let value: i64 = std::str::from_utf8(&out).unwrap().parse().unwrap();
            assert!((-45..=-35).contains(&value) && value != -40);
        }
        // Non-numeric input falls back to raw arithmetic and keeps the length.
        let out = m.mutate_with_type(b"abcd", InputType::Integer).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn interesting_values_come_from_tables() {
        let m = InterestingValueMutator::new(1, rng());
        let table: Vec<u8> = INTERESTING_8.iter().map(|v| *v as u8).collect();
        for _ in 0..50 {
            let out = m.mutate(&[0x55]).unwrap();
            assert!(table.contains(&out[0]));
        }
        let wide = InterestingValueMutator::new(4, rng());
        assert!(wide.values().contains(&i64::from(i32::MAX)));
        assert!(wide.values().contains(&255));
        let out = wide.mutate_with_type(b"12", InputType::Integer).unwrap();
        let value: i64 = std::str::from_utf8(&out).unwrap().parse().unwrap();
        assert!(wide.values().contains(&value));
    }

    #[test]
    fn byteswap_known_vectors() {
        assert_eq!(
            ByteSwapMutator::new(2, rng()).mutate(&[0x12, 0x34]).unwrap(),
            vec![0x34, 0x12]
        );
        assert_eq!(
            ByteSwapMutator::new(4, rng())
                .mutate(&[0x12, 0x34, 0x56, 0x78])
                .unwrap(),
            vec![0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(ByteSwapMutator::new(4, rng()).mutate(&[1, 2]).unwrap(), vec![1, 2]);
    }

    #[test]
    fn delete_insert_clone_lengths() {
        let input: Vec<u8> = (0..20).collect();
        let delete = DeleteMutator::new(16, rng());
        let insert = InsertMutator::new(16, rng());
        let clone = CloneMutator::new(32, rng());
        for _ in 0..50 {
            let d = delete.mutate(&input).unwrap();
            assert!(!d.is_empty() && d.len() < input.len() && input.len() - d.len() <= 16);

            let i = insert.mutate(&input).unwrap();
            assert!(i.len() > input.len() && i.len() - input.len() <= 16);

            let c = clone.mutate(&input).unwrap();
            assert!(c.len() > input.len() && c.len() <= input.len() * 2);
        }
        assert_eq!(delete.mutate(&[7]).unwrap(), vec![7]);
        assert!(!insert.mutate(&[]).unwrap().is_empty());
        assert!(clone.mutate(&[]).unwrap().is_empty());
    }

    #[test]
    fn mutators_never_touch_caller_buffer() {
        let input = vec![0x10u8, 0x20, 0x30, 0x40];
        let snapshot = input.clone();
        let r = rng();
        let _ = RandomByteMutator::new(4, r.clone()).mutate(&input);
        let _ = ByteSwapMutator::new(4, r.clone()).mutate(&input);
        let _ = ArithmeticMutator::new(4, ARITH_MAX, r).mutate(&input);
        assert_eq!(input, snapshot);
    }
}
