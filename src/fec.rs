//! Systolic binary-matrix FEC decoder for the fragmentation session.
//!
//! Data fragments (index `1..=k`) land directly at their final offset on the
//! block device. Redundancy fragments (index `k+1..=k+r`) each carry the XOR
//! of a pseudo-random subset of data rows, chosen by [`parity_mask`]. The
//! codec keeps only the k×k triangular elimination *mask* matrix in RAM —
//! the accumulated payload of every row (solved or still-pending) lives on
//! the block device, in the data-row area once solved and in a parallel
//! scratch area, one slot per possible pivot column, while pending.
//!
//! `MAX_FRAGMENTS` bounds `k`; sessions that ask for more report
//! [`Status::OutOfMemory`] at setup rather than at some later fragment.

use crate::block_device::{DeviceError, Storage};
use crate::status::Status;

/// Upper bound on `nb_frag` this decoder will track. Matches the worked
/// memory-budget example (k=200 costs 5000 bytes of mask storage).
pub const MAX_FRAGMENTS: usize = 200;

/// Largest `frag_size` the wire format allows (one byte on the wire).
pub const MAX_FRAG_SIZE: usize = 255;

const BITSET_BYTES: usize = (MAX_FRAGMENTS + 7) / 8;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bitset {
    bits: [u8; BITSET_BYTES],
}

impl Bitset {
    pub const fn new() -> Self {
        Self {
            bits: [0u8; BITSET_BYTES],
        }
    }

    pub fn get(&self, i: usize) -> bool {
        (self.bits[i / 8] >> (i % 8)) & 1 != 0
    }

    pub fn set(&mut self, i: usize) {
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn clear(&mut self, i: usize) {
        self.bits[i / 8] &= !(1 << (i % 8));
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_all_ones(&self, limit: usize) -> bool {
        (0..limit).all(|i| self.get(i))
    }

    /// Lowest set bit below `limit`, if any.
    pub fn leading_bit(&self, limit: usize) -> Option<usize> {
        (0..limit).find(|&i| self.get(i))
    }

    /// The sole set bit below `limit`, if there is exactly one.
    pub fn single_bit(&self, limit: usize) -> Option<usize> {
        let mut found = None;
        for i in 0..limit {
            if self.get(i) {
                if found.is_some() {
                    return None;
                }
                found = Some(i);
            }
        }
        found
    }

    pub fn xor_with(&mut self, other: &Bitset) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a ^= b;
        }
    }
}

impl Default for Bitset {
    fn default() -> Self {
        Self::new()
    }
}

/// Fibonacci LFSR with characteristic polynomial `x^23 + x^18 + 1`: feedback
/// taps bits 22 and 17, the bit shifted out is the generator's output.
struct Lfsr23 {
    state: u32,
}

impl Lfsr23 {
    fn seeded(seed: u16) -> Self {
        // low 16 bits, padded - the seed never fills the full 23-bit state.
        Self {
            state: (seed as u32) & 0x7f_ffff,
        }
    }

    fn step(&mut self) -> bool {
        let feedback = ((self.state >> 22) ^ (self.state >> 17)) & 1;
        let out = self.state & 1;
        self.state = ((self.state >> 1) | (feedback << 22)) & 0x7f_ffff;
        out != 0
    }
}

/// Deterministic pseudo-random parity mask for redundancy row `j` (1-based)
/// over `k` data columns. Bit-identical between encoder and decoder is the
/// entire point — this must never change shape once devices are deployed.
pub fn parity_mask(j: u16, k: usize) -> Bitset {
    let m = k.next_power_of_two();
    let mut lfsr = Lfsr23::seeded(j);

    loop {
        let mut mask = Bitset::new();
        let mut rejected = false;
        for col in 0..m {
            if lfsr.step() {
                if col >= k {
                    rejected = true;
                } else {
                    mask.set(col);
                }
            }
        }
        if !rejected {
            return mask;
        }
        // Keep advancing the same LFSR state (no reseed) until a window of m
        // bits lands entirely within the first k columns.
    }
}

fn xor_bytes(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

pub struct FecCodec {
    k: usize,
    frag_size: usize,
    flash_offset: u32,
    data_received: Bitset,
    matrix: [Option<Bitset>; MAX_FRAGMENTS],
    complete: bool,
}

impl FecCodec {
    pub fn new(k: usize, frag_size: usize, flash_offset: u32) -> Result<Self, Status> {
        if k == 0 || k > MAX_FRAGMENTS || frag_size == 0 || frag_size > MAX_FRAG_SIZE {
            return Err(Status::OutOfMemory);
        }
        Ok(Self {
            k,
            frag_size,
            flash_offset,
            data_received: Bitset::new(),
            matrix: [None; MAX_FRAGMENTS],
            complete: false,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn received_count(&self) -> usize {
        self.data_received.count_ones()
    }

    pub fn has_data(&self, index1: usize) -> bool {
        index1 >= 1 && index1 <= self.k && self.data_received.get(index1 - 1)
    }

    fn data_offset(&self, col: usize) -> u32 {
        self.flash_offset + (col as u32) * (self.frag_size as u32)
    }

    fn scratch_offset(&self, col: usize) -> u32 {
        self.flash_offset + ((self.k + col) as u32) * (self.frag_size as u32)
    }

    fn check_complete(&mut self) {
        self.complete = self.data_received.is_all_ones(self.k);
    }

    /// Push every stored row whose mask still references any of `queue`'s
    /// columns toward resolution, promoting rows that collapse to a single
    /// remaining unknown.
    fn propagate<S: Storage>(
        &mut self,
        storage: &mut S,
        mut queue: heapless::Vec<usize, MAX_FRAGMENTS>,
    ) -> Result<(), Status> {
        let k = self.k;
        let frag_size = self.frag_size;
        let mut known = [0u8; MAX_FRAG_SIZE];
        let mut scratch = [0u8; MAX_FRAG_SIZE];

        while let Some(resolved) = queue.pop() {
            storage
                .read_bytes(&mut known[..frag_size], self.data_offset(resolved))
                .map_err(device_err)?;

            for pivot in 0..k {
                let pivot_scratch_offset = self.scratch_offset(pivot);
                let Some(mask) = self.matrix[pivot].as_mut() else {
                    continue;
                };
                if !mask.get(resolved) {
                    continue;
                }

                storage
                    .read_bytes(&mut scratch[..frag_size], pivot_scratch_offset)
                    .map_err(device_err)?;
                xor_bytes(&mut scratch[..frag_size], &known[..frag_size]);
                mask.clear(resolved);

                if mask.is_empty() {
                    self.matrix[pivot] = None;
                    continue;
                }

                storage
                    .program_bytes(&scratch[..frag_size], pivot_scratch_offset)
                    .map_err(device_err)?;

                if let Some(solved) = mask.single_bit(k) {
                    if !self.data_received.get(solved) {
                        let solved_data_offset = self.data_offset(solved);
                        storage
                            .program_bytes(&scratch[..frag_size], solved_data_offset)
                            .map_err(device_err)?;
                        self.data_received.set(solved);
                        self.matrix[pivot] = None;
                        crate::log::trace!("fec: recovered column {} by elimination", solved);
                        // queue is bounded by k distinct columns; silently
                        // drop rather than panic if somehow exceeded.
                        let _ = queue.push(solved);
                    } else {
                        self.matrix[pivot] = None;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a data fragment (1-based `index`). Returns `true` if the
    /// session is now complete.
    pub fn process_data_row<S: Storage>(
        &mut self,
        storage: &mut S,
        index1: usize,
        payload: &[u8],
    ) -> Result<bool, Status> {
        if index1 < 1 || index1 > self.k || payload.len() != self.frag_size {
            return Err(Status::ParameterError);
        }
        let col = index1 - 1;
        if self.data_received.get(col) {
            return Ok(self.complete);
        }

        storage
            .program_bytes(payload, self.data_offset(col))
            .map_err(device_err)?;
        self.data_received.set(col);

        let mut queue = heapless::Vec::new();
        let _ = queue.push(col);
        self.propagate(storage, queue)?;

        self.check_complete();
        Ok(self.complete)
    }

    /// Handle a redundancy fragment. `redundancy_index` is 1-based (`j` in
    /// `[1, r]`, *not* `k + j`) — it seeds the parity generator directly.
    pub fn process_redundancy_row<S: Storage>(
        &mut self,
        storage: &mut S,
        redundancy_index: u16,
        payload: &[u8],
    ) -> Result<bool, Status> {
        if payload.len() != self.frag_size {
            return Err(Status::ParameterError);
        }
        if self.complete {
            return Ok(true);
        }

        let k = self.k;
        let frag_size = self.frag_size;
        let mut mask = parity_mask(redundancy_index, k);
        let mut working = [0u8; MAX_FRAG_SIZE];
        working[..frag_size].copy_from_slice(payload);

        // Reduce against already-known data rows.
        for col in 0..k {
            if mask.get(col) && self.data_received.get(col) {
                let mut known = [0u8; MAX_FRAG_SIZE];
                storage
                    .read_bytes(&mut known[..frag_size], self.data_offset(col))
                    .map_err(device_err)?;
                xor_bytes(&mut working[..frag_size], &known[..frag_size]);
                mask.clear(col);
            }
        }

        // Online Gaussian elimination against stored redundancy rows.
        loop {
            let Some(pivot) = mask.leading_bit(k) else {
                // Empty mask: either fully redundant (zero payload) or a
                // parity inconsistency.
                if working[..frag_size].iter().all(|&b| b == 0) {
                    return Ok(self.complete);
                }
                return Err(Status::MatrixError);
            };

            match self.matrix[pivot] {
                Some(existing) => {
                    let mut existing_payload = [0u8; MAX_FRAG_SIZE];
                    storage
                        .read_bytes(&mut existing_payload[..frag_size], self.scratch_offset(pivot))
                        .map_err(device_err)?;
                    mask.xor_with(&existing);
                    xor_bytes(&mut working[..frag_size], &existing_payload[..frag_size]);
                    continue;
                }
                None => {
                    if mask.count_ones() == 1 {
                        // Already solved: this row determines data column `pivot` directly.
                        if !self.data_received.get(pivot) {
                            storage
                                .program_bytes(&working[..frag_size], self.data_offset(pivot))
                                .map_err(device_err)?;
                            self.data_received.set(pivot);

                            let mut queue = heapless::Vec::new();
                            let _ = queue.push(pivot);
                            self.propagate(storage, queue)?;
                        }
                    } else {
                        storage
                            .program_bytes(&working[..frag_size], self.scratch_offset(pivot))
                            .map_err(device_err)?;
                        self.matrix[pivot] = Some(mask);
                    }
                    break;
                }
            }
        }

        self.check_complete();
        Ok(self.complete)
    }
}

fn device_err(_: DeviceError) -> Status {
    Status::StorageError
}
