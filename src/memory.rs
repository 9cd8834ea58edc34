/// Register block memory for simulated devices
///
/// A device owns four of these blocks (coils, discrete inputs, input
/// registers, holding registers). Each block is a flat byte buffer with a
/// bit-granular size, guarded by a reader-writer lock, plus a monotonic
/// change counter that observers poll to refresh their views.
///
/// Addressing is 0-based. Bit offsets count from bit 0 of byte 0 (LSB
/// first); register offsets are 16-bit steps with each register stored low
/// byte first in the buffer. Reads clamp their count to the bits/registers
/// actually present; an offset outside the block is an error.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::ExceptionCode;

/// Chunk size for the word-phased masked copy
const WORD: usize = std::mem::size_of::<usize>();

#[derive(Debug)]
struct BlockState {
    data: Vec<u8>,
    size_bits: usize,
}

impl BlockState {
    fn size_regs(&self) -> usize {
        self.size_bits / 16
    }

    /// Clamped packed-bit read; `bit_off` must be inside the block
    fn read_bits(&self, bit_off: usize, bit_cnt: usize) -> (Vec<u8>, usize) {
        let avail = self.size_bits - bit_off;
        let cnt = bit_cnt.min(avail);
        let out_len = (cnt + 7) / 8;
        let mut out = vec![0u8; out_len];

        let base = bit_off / 8;
        let shift = bit_off % 8;
        for (j, slot) in out.iter_mut().enumerate() {
            let lo = self.data.get(base + j).copied().unwrap_or(0);
            *slot = if shift == 0 {
                lo
            } else {
                let hi = self.data.get(base + j + 1).copied().unwrap_or(0);
                (lo >> shift) | (hi << (8 - shift))
            };
        }

        // Bits past the requested count stay zero
        let excess = out_len * 8 - cnt;
        if excess > 0 {
            out[out_len - 1] &= 0xFF >> excess;
        }
        (out, cnt)
    }

    /// Clamped masked-bit write; returns the number of bits written
    fn write_bits(&mut self, bit_off: usize, bit_cnt: usize, src: &[u8]) -> usize {
        let avail = self.size_bits - bit_off;
        let cnt = bit_cnt.min(avail).min(src.len() * 8);
        if cnt == 0 {
            return 0;
        }

        let base = bit_off / 8;
        let shift = bit_off % 8;
        let end = bit_off + cnt;
        let last = (end - 1) / 8;

        let get_src = |i: isize| -> u8 {
            if i >= 0 && (i as usize) < src.len() {
                src[i as usize]
            } else {
                0
            }
        };

        for d in base..=last {
            let r = (d - base) as isize;
            let val = if shift == 0 {
                get_src(r)
            } else {
                (get_src(r) << shift) | (get_src(r - 1) >> (8 - shift))
            };

            // Bit positions of this byte covered by the write
            let lo = bit_off.max(d * 8) - d * 8;
            let hi = end.min((d + 1) * 8) - d * 8;
            let mask = (0xFFu8 << lo) & (0xFFu8 >> (8 - hi));
            self.data[d] = (self.data[d] & !mask) | (val & mask);
        }
        cnt
    }

    /// Clamped register read; `reg_off` must be inside the block
    fn read_regs(&self, reg_off: usize, cnt: usize) -> Vec<u16> {
        let avail = self.size_regs() - reg_off;
        let cnt = cnt.min(avail);
        (0..cnt)
            .map(|i| {
                let b = (reg_off + i) * 2;
                u16::from_le_bytes([self.data[b], self.data[b + 1]])
            })
            .collect()
    }

    /// Clamped register write; returns the number of registers written
    fn write_regs(&mut self, reg_off: usize, values: &[u16]) -> usize {
        let avail = self.size_regs() - reg_off;
        let cnt = values.len().min(avail);
        for (i, &v) in values[..cnt].iter().enumerate() {
            let b = (reg_off + i) * 2;
            let bytes = v.to_le_bytes();
            self.data[b] = bytes[0];
            self.data[b + 1] = bytes[1];
        }
        cnt
    }
}

/// Thread-safe bit/register memory with a change counter
#[derive(Debug)]
pub struct RegisterBlock {
    state: RwLock<BlockState>,
    change_counter: AtomicU64,
}

impl RegisterBlock {
    /// Create a block of `size_bits` zeroed bits
    pub fn new(size_bits: usize) -> Self {
        Self {
            state: RwLock::new(BlockState {
                data: vec![0; (size_bits + 7) / 8],
                size_bits,
            }),
            change_counter: AtomicU64::new(0),
        }
    }

    /// Create a block sized in whole registers
    pub fn with_regs(count: usize) -> Self {
        Self::new(count * 16)
    }

    /// Block size in bits
    pub fn size_bits(&self) -> usize {
        self.state.read().size_bits
    }

    /// Number of whole registers in the block
    pub fn size_regs(&self) -> usize {
        self.state.read().size_regs()
    }

    /// Buffer length in bytes
    pub fn size_bytes(&self) -> usize {
        self.state.read().data.len()
    }

    /// Current change counter value
    ///
    /// Incremented exactly once per successful write or resize. Observers
    /// poll this without taking the block lock.
    pub fn change_counter(&self) -> u64 {
        self.change_counter.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.change_counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Resize to `size_bits`, discarding all contents
    pub fn resize_bits(&self, size_bits: usize) {
        let mut state = self.state.write();
        state.data = vec![0; (size_bits + 7) / 8];
        state.size_bits = size_bits;
        drop(state);
        self.bump();
    }

    /// Resize to `count` whole bytes, discarding all contents
    pub fn resize_bytes(&self, count: usize) {
        self.resize_bits(count * 8);
    }

    /// Resize to `count` whole registers, discarding all contents
    pub fn resize_regs(&self, count: usize) {
        self.resize_bits(count * 16);
    }

    /// Read up to `bit_cnt` bits packed LSB-first
    ///
    /// The count is clamped to the bits remaining after `bit_off`; the
    /// clamped count comes back with the bytes.
    pub fn read_bits(&self, bit_off: usize, bit_cnt: usize) -> Result<(Vec<u8>, usize), ExceptionCode> {
        let state = self.state.read();
        if bit_off >= state.size_bits {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(state.read_bits(bit_off, bit_cnt))
    }

    /// Write up to `bit_cnt` bits from packed LSB-first bytes
    ///
    /// Bits outside the written range keep their value. The count is
    /// clamped like [`read_bits`](Self::read_bits); a zero-bit write is
    /// rejected.
    pub fn write_bits(&self, bit_off: usize, bit_cnt: usize, src: &[u8]) -> Result<(), ExceptionCode> {
        if bit_cnt == 0 {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        if src.is_empty() {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let mut state = self.state.write();
        if bit_off >= state.size_bits {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        state.write_bits(bit_off, bit_cnt, src);
        drop(state);
        self.bump();
        Ok(())
    }

    /// Read up to `count` bits as one bool per bit
    pub fn read_bools(&self, bit_off: usize, count: usize) -> Result<Vec<bool>, ExceptionCode> {
        let (bytes, cnt) = self.read_bits(bit_off, count)?;
        Ok(unpack_bools(&bytes, cnt))
    }

    /// Write one bool per bit
    pub fn write_bools(&self, bit_off: usize, values: &[bool]) -> Result<(), ExceptionCode> {
        self.write_bits(bit_off, values.len(), &pack_bools(values))
    }

    /// Read up to `count` registers
    pub fn read_regs(&self, reg_off: usize, count: usize) -> Result<Vec<u16>, ExceptionCode> {
        let state = self.state.read();
        if reg_off >= state.size_regs() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(state.read_regs(reg_off, count))
    }

    /// Write registers, clamped to the block end
    pub fn write_regs(&self, reg_off: usize, values: &[u16]) -> Result<(), ExceptionCode> {
        if values.is_empty() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut state = self.state.write();
        if reg_off >= state.size_regs() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        state.write_regs(reg_off, values);
        drop(state);
        self.bump();
        Ok(())
    }

    /// Read-modify-write a single register under one lock acquisition
    ///
    /// Returns the value written back. The mask-write function code builds
    /// on this.
    pub fn update_reg(
        &self,
        reg_off: usize,
        f: impl FnOnce(u16) -> u16,
    ) -> Result<u16, ExceptionCode> {
        let mut state = self.state.write();
        if reg_off >= state.size_regs() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let b = reg_off * 2;
        let cur = u16::from_le_bytes([state.data[b], state.data[b + 1]]);
        let next = f(cur);
        let bytes = next.to_le_bytes();
        state.data[b] = bytes[0];
        state.data[b + 1] = bytes[1];
        drop(state);
        self.bump();
        Ok(next)
    }

    /// Read a grid of bool rows under one lock acquisition
    ///
    /// Row `r` starts at `start + r * row_len`. Rows that begin past the
    /// block end are dropped; the last kept row may come back short.
    pub fn read_frame_bools(
        &self,
        start: usize,
        row_len: usize,
        rows: usize,
    ) -> Result<Vec<Vec<bool>>, ExceptionCode> {
        if row_len == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let state = self.state.read();
        if start >= state.size_bits {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut out = Vec::with_capacity(rows);
        for r in 0..rows {
            let off = start + r * row_len;
            if off >= state.size_bits {
                break;
            }
            let (bytes, cnt) = state.read_bits(off, row_len);
            out.push(unpack_bools(&bytes, cnt));
        }
        Ok(out)
    }

    /// Write a grid of bool rows under one lock acquisition
    pub fn write_frame_bools(
        &self,
        start: usize,
        row_len: usize,
        rows: &[Vec<bool>],
    ) -> Result<(), ExceptionCode> {
        if row_len == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let mut state = self.state.write();
        if start >= state.size_bits {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut wrote = false;
        for (r, row) in rows.iter().enumerate() {
            let off = start + r * row_len;
            if off >= state.size_bits || row.is_empty() {
                continue;
            }
            let cnt = row.len().min(row_len);
            state.write_bits(off, cnt, &pack_bools(&row[..cnt]));
            wrote = true;
        }
        drop(state);
        // The counter only moves when a row actually landed
        if wrote {
            self.bump();
        }
        Ok(())
    }

    /// Read a grid of register rows under one lock acquisition
    pub fn read_frame_regs(
        &self,
        start: usize,
        row_len: usize,
        rows: usize,
    ) -> Result<Vec<Vec<u16>>, ExceptionCode> {
        if row_len == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let state = self.state.read();
        if start >= state.size_regs() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut out = Vec::with_capacity(rows);
        for r in 0..rows {
            let off = start + r * row_len;
            if off >= state.size_regs() {
                break;
            }
            out.push(state.read_regs(off, row_len));
        }
        Ok(out)
    }

    /// Write a grid of register rows under one lock acquisition
    pub fn write_frame_regs(
        &self,
        start: usize,
        row_len: usize,
        rows: &[Vec<u16>],
    ) -> Result<(), ExceptionCode> {
        if row_len == 0 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let mut state = self.state.write();
        if start >= state.size_regs() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        let mut wrote = false;
        for (r, row) in rows.iter().enumerate() {
            let off = start + r * row_len;
            if off >= state.size_regs() || row.is_empty() {
                continue;
            }
            let cnt = row.len().min(row_len);
            state.write_regs(off, &row[..cnt]);
            wrote = true;
        }
        drop(state);
        if wrote {
            self.bump();
        }
        Ok(())
    }

    /// Copy a raw byte range out of the buffer
    pub fn mem_get(&self, byte_off: usize, len: usize) -> Result<Vec<u8>, ExceptionCode> {
        let state = self.state.read();
        if byte_off + len > state.data.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(state.data[byte_off..byte_off + len].to_vec())
    }

    /// Masked raw byte write: `dst = (dst & !mask) | (bytes & mask)`
    ///
    /// The merge runs one native machine word at a time with unaligned
    /// prefix and suffix bytes handled individually; the result is
    /// byte-identical to the per-byte formula.
    pub fn mem_set_mask(
        &self,
        byte_off: usize,
        bytes: &[u8],
        mask: &[u8],
    ) -> Result<(), ExceptionCode> {
        if bytes.len() != mask.len() {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let mut state = self.state.write();
        if byte_off + bytes.len() > state.data.len() {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        let dst = &mut state.data[byte_off..byte_off + bytes.len()];
        let len = dst.len();
        let mut i = 0;

        // Prefix up to a word-aligned buffer offset
        while i < len && (byte_off + i) % WORD != 0 {
            dst[i] = (dst[i] & !mask[i]) | (bytes[i] & mask[i]);
            i += 1;
        }
        // Word-sized body
        while i + WORD <= len {
            let mut d = [0u8; WORD];
            let mut s = [0u8; WORD];
            let mut m = [0u8; WORD];
            d.copy_from_slice(&dst[i..i + WORD]);
            s.copy_from_slice(&bytes[i..i + WORD]);
            m.copy_from_slice(&mask[i..i + WORD]);
            let out = (usize::from_ne_bytes(d) & !usize::from_ne_bytes(m))
                | (usize::from_ne_bytes(s) & usize::from_ne_bytes(m));
            dst[i..i + WORD].copy_from_slice(&out.to_ne_bytes());
            i += WORD;
        }
        // Suffix
        while i < len {
            dst[i] = (dst[i] & !mask[i]) | (bytes[i] & mask[i]);
            i += 1;
        }

        drop(state);
        self.bump();
        Ok(())
    }
}

/// Pack bools into LSB-first bytes
pub fn pack_bools(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` LSB-first bits into bools
pub fn unpack_bools(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|b| (b >> (i % 8)) & 1 != 0)
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Bit-by-bit reference used to pin the shifted byte implementation
    struct NaiveBits {
        bits: Vec<bool>,
    }

    impl NaiveBits {
        fn new(size: usize) -> Self {
            Self { bits: vec![false; size] }
        }

        fn write(&mut self, off: usize, cnt: usize, src: &[u8]) {
            let cnt = cnt.min(self.bits.len() - off).min(src.len() * 8);
            for i in 0..cnt {
                self.bits[off + i] = (src[i / 8] >> (i % 8)) & 1 != 0;
            }
        }

        fn read(&self, off: usize, cnt: usize) -> Vec<u8> {
            let cnt = cnt.min(self.bits.len() - off);
            let mut out = vec![0u8; (cnt + 7) / 8];
            for i in 0..cnt {
                if self.bits[off + i] {
                    out[i / 8] |= 1 << (i % 8);
                }
            }
            out
        }
    }

    #[test]
    fn test_bit_roundtrip_preserves_neighbors() {
        let block = RegisterBlock::new(64);
        // Surround the target range with set bits
        block.write_bools(0, &[true; 64]).unwrap();

        let pattern = [true, false, true, true, false];
        block.write_bools(13, &pattern).unwrap();

        assert_eq!(block.read_bools(13, 5).unwrap(), pattern);
        // Both neighbors untouched
        assert_eq!(block.read_bools(12, 1).unwrap(), vec![true]);
        assert_eq!(block.read_bools(18, 1).unwrap(), vec![true]);
    }

    #[test]
    fn test_unaligned_bit_io_matches_reference() {
        let size = 200;
        for off in [0, 1, 3, 7, 8, 13, 30, 77] {
            for cnt in [1, 2, 7, 8, 9, 16, 23, 40] {
                let block = RegisterBlock::new(size);
                let mut naive = NaiveBits::new(size);

                // Deterministic backdrop
                let backdrop: Vec<u8> = (0..size / 8).map(|i| (i as u8).wrapping_mul(37)).collect();
                block.write_bits(0, size, &backdrop).unwrap();
                naive.write(0, size, &backdrop);

                let src: Vec<u8> = (0..(cnt + 7) / 8)
                    .map(|i| (i as u8).wrapping_mul(91).wrapping_add(off as u8))
                    .collect();
                block.write_bits(off, cnt, &src).unwrap();
                naive.write(off, cnt, &src);

                // Compare the whole buffer, not just the written range
                let (got, n) = block.read_bits(0, size).unwrap();
                assert_eq!(n, size);
                assert_eq!(got, naive.read(0, size), "off={} cnt={}", off, cnt);
            }
        }
    }

    #[test]
    fn test_read_clamps_and_reports_count() {
        let block = RegisterBlock::new(20);
        let (bytes, cnt) = block.read_bits(15, 100).unwrap();
        assert_eq!(cnt, 5);
        assert_eq!(bytes.len(), 1);

        assert!(matches!(
            block.read_bits(20, 1),
            Err(ExceptionCode::IllegalDataAddress)
        ));
    }

    #[test]
    fn test_register_operations() {
        let block = RegisterBlock::with_regs(8);

        block.write_regs(2, &[0x1234, 0xABCD]).unwrap();
        assert_eq!(block.read_regs(2, 2).unwrap(), vec![0x1234, 0xABCD]);

        // Clamped read past the end
        assert_eq!(block.read_regs(6, 10).unwrap().len(), 2);
        assert!(block.read_regs(8, 1).is_err());

        // Neighbor registers stay zero
        assert_eq!(block.read_regs(1, 1).unwrap(), vec![0]);
        assert_eq!(block.read_regs(4, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_partial_trailing_register_not_addressable() {
        // 20 bits is one whole register plus four stray bits
        let block = RegisterBlock::new(20);
        assert_eq!(block.size_regs(), 1);
        assert!(block.read_regs(1, 1).is_err());
        assert!(block.write_regs(1, &[1]).is_err());
    }

    #[test]
    fn test_mem_set_mask_matches_naive() {
        for off in [0, 1, 5, 8, 11] {
            for len in [1, 3, 8, 16, 21] {
                let block = RegisterBlock::new(64 * 8);
                let backdrop: Vec<u8> = (0..64).map(|i| (i as u8).wrapping_mul(29)).collect();
                block.write_bits(0, 64 * 8, &backdrop).unwrap();

                let bytes: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(53)).collect();
                let mask: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(17).wrapping_add(3)).collect();
                block.mem_set_mask(off, &bytes, &mask).unwrap();

                let mut expected = backdrop.clone();
                for i in 0..len {
                    expected[off + i] =
                        (expected[off + i] & !mask[i]) | (bytes[i] & mask[i]);
                }
                assert_eq!(
                    block.mem_get(0, 64).unwrap(),
                    expected,
                    "off={} len={}",
                    off,
                    len
                );
            }
        }
    }

    #[test]
    fn test_mem_set_mask_validation() {
        let block = RegisterBlock::new(32);
        assert!(matches!(
            block.mem_set_mask(0, &[1, 2], &[0xFF]),
            Err(ExceptionCode::IllegalDataValue)
        ));
        assert!(matches!(
            block.mem_set_mask(3, &[1, 2], &[0xFF, 0xFF]),
            Err(ExceptionCode::IllegalDataAddress)
        ));
    }

    #[test]
    fn test_change_counter_bumps_once_per_call() {
        let block = RegisterBlock::with_regs(16);
        assert_eq!(block.change_counter(), 0);

        block.write_regs(0, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(block.change_counter(), 1);

        block.write_bools(0, &[true; 40]).unwrap();
        assert_eq!(block.change_counter(), 2);

        block
            .write_frame_regs(0, 4, &[vec![9; 4], vec![8; 4]])
            .unwrap();
        assert_eq!(block.change_counter(), 3);

        // Failed writes leave the counter alone
        assert!(block.write_regs(100, &[1]).is_err());
        assert_eq!(block.change_counter(), 3);

        block.resize_regs(8);
        assert_eq!(block.change_counter(), 4);
    }

    #[test]
    fn test_resize_discards_contents() {
        let block = RegisterBlock::with_regs(4);
        block.write_regs(0, &[0xFFFF; 4]).unwrap();
        block.resize_regs(8);
        assert_eq!(block.read_regs(0, 8).unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_update_reg_applies_function() {
        let block = RegisterBlock::with_regs(4);
        block.write_regs(1, &[0b1010]).unwrap();
        let next = block.update_reg(1, |cur| cur | 0b0101).unwrap();
        assert_eq!(next, 0b1111);
        assert_eq!(block.read_regs(1, 1).unwrap(), vec![0b1111]);
        assert!(block.update_reg(4, |c| c).is_err());
    }

    #[test]
    fn test_frame_transfers() {
        let block = RegisterBlock::with_regs(10);
        let counter = block.change_counter();
        block
            .write_frame_regs(0, 3, &[vec![1, 2, 3], vec![4, 5, 6]])
            .unwrap();
        assert_eq!(block.change_counter(), counter + 1);
        let rows = block.read_frame_regs(0, 3, 2).unwrap();
        assert_eq!(rows, vec![vec![1, 2, 3], vec![4, 5, 6]]);

        // Rows past the end are dropped, last row may be short
        let rows = block.read_frame_regs(6, 3, 5).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].len(), 1);
    }

    #[test]
    fn test_frame_write_without_landed_rows_keeps_counter() {
        let block = RegisterBlock::with_regs(10);
        let counter = block.change_counter();

        // No rows at all
        block.write_frame_regs(0, 3, &[]).unwrap();
        // Rows present but every one empty
        block.write_frame_regs(0, 3, &[vec![], vec![]]).unwrap();
        // Every row starts past the block end
        block.write_frame_regs(9, 4, &[vec![], vec![7, 8]]).unwrap();
        assert_eq!(block.change_counter(), counter);

        let bits = RegisterBlock::new(16);
        let bit_counter = bits.change_counter();
        bits.write_frame_bools(0, 8, &[]).unwrap();
        bits.write_frame_bools(0, 8, &[vec![], vec![]]).unwrap();
        assert_eq!(bits.change_counter(), bit_counter);

        // One landing row bumps exactly once
        bits.write_frame_bools(0, 8, &[vec![], vec![true, false]])
            .unwrap();
        assert_eq!(bits.change_counter(), bit_counter + 1);
    }

    #[test]
    fn test_concurrent_disjoint_writers_no_torn_reads() {
        let block = Arc::new(RegisterBlock::with_regs(64));
        let writers = 4;
        let per_writer = 16;
        let iterations = 200;

        let mut handles = Vec::new();
        for w in 0..writers {
            let block = Arc::clone(&block);
            handles.push(std::thread::spawn(move || {
                let base = w * per_writer;
                for i in 0..iterations {
                    let marker = ((w as u16) << 12) | (i as u16 & 0x0FFF);
                    block.write_regs(base, &vec![marker; per_writer]).unwrap();
                }
            }));
        }
        for _ in 0..2 {
            let block = Arc::clone(&block);
            handles.push(std::thread::spawn(move || {
                for _ in 0..iterations {
                    for w in 0..writers {
                        let regs = block.read_regs(w * per_writer, per_writer).unwrap();
                        for &r in &regs {
                            // A torn value would carry a foreign writer tag
                            assert!(r == 0 || (r >> 12) as usize == w);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for w in 0..writers {
            let regs = block.read_regs(w * per_writer, per_writer).unwrap();
            let expected = ((w as u16) << 12) | ((iterations - 1) as u16 & 0x0FFF);
            assert_eq!(regs, vec![expected; per_writer]);
        }
    }
}
