//! Typed values and multi-register encodings.
//!
//! Device memory is untyped bits and 16-bit registers; simulation actions
//! and the generic device accessor work on typed values up to 64 bits wide.
//! This module holds the mapping between the two:
//!
//! - [`DataType`] / [`Value`]: the eleven supported value types.
//! - [`ByteOrder`]: whether a register carries its word big- or
//!   little-endian. `be` leaves a 16-bit value numerically identical to its
//!   register.
//! - [`RegisterOrder`]: how the words of a 32/64-bit value are laid out
//!   across consecutive registers. The four orders are fixed permutation
//!   tables over the value's words counted from the least significant end,
//!   so `R0R1R2R3` puts the low word at the low address and `R3R2R1R0`
//!   produces the textbook big-endian register sequence. All four tables
//!   are their own inverse, which is why encode and decode share them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExceptionCode;

/// Value types addressable through the generic device accessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Single bit
    #[serde(alias = "bool")]
    Bit,
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 16-bit integer
    #[default]
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 32-bit integer
    UInt32,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 64-bit integer
    UInt64,
    /// IEEE 754 single precision
    #[serde(alias = "float")]
    Float32,
    /// IEEE 754 double precision
    #[serde(alias = "double")]
    Float64,
}

impl DataType {
    /// Width of the type in bits
    pub fn bits(self) -> u32 {
        match self {
            DataType::Bit => 1,
            DataType::Int8 | DataType::UInt8 => 8,
            DataType::Int16 | DataType::UInt16 => 16,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 32,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 64,
        }
    }

    /// Number of 16-bit registers the type occupies (minimum 1)
    ///
    /// Sub-register types still claim a whole register; they live in its
    /// low byte (or low bit).
    pub fn registers(self) -> u16 {
        ((self.bits() + 15) / 16).max(1) as u16
    }

    /// True for Float32/Float64
    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bit => "bit",
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/// Byte order of a word within its register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// High byte first on the wire; the register number equals the word
    #[default]
    #[serde(rename = "be", alias = "BE", alias = "big_endian")]
    BigEndian,
    /// Low byte first; the register carries the word byte-swapped
    #[serde(rename = "le", alias = "LE", alias = "little_endian")]
    LittleEndian,
}

impl ByteOrder {
    /// Apply the order to a single register word
    pub fn apply(self, word: u16) -> u16 {
        match self {
            ByteOrder::BigEndian => word,
            ByteOrder::LittleEndian => word.swap_bytes(),
        }
    }
}

/// Word layout of a 32/64-bit value across consecutive registers
///
/// Slot `i` (ascending register address) carries value word `table()[i]`,
/// with words counted from the least significant end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegisterOrder {
    /// Low word at the low address
    #[default]
    #[serde(rename = "r0r1r2r3", alias = "R0R1R2R3")]
    R0R1R2R3,
    /// High word at the low address (textbook big-endian registers)
    #[serde(rename = "r3r2r1r0", alias = "R3R2R1R0")]
    R3R2R1R0,
    /// Adjacent word pairs swapped
    #[serde(rename = "r1r0r3r2", alias = "R1R0R3R2")]
    R1R0R3R2,
    /// 32-bit halves swapped
    #[serde(rename = "r2r3r0r1", alias = "R2R3R0R1")]
    R2R3R0R1,
}

impl RegisterOrder {
    /// The permutation table, slot index to word index
    pub const fn table(self) -> [usize; 4] {
        match self {
            RegisterOrder::R0R1R2R3 => [0, 1, 2, 3],
            RegisterOrder::R3R2R1R0 => [3, 2, 1, 0],
            RegisterOrder::R1R0R3R2 => [1, 0, 3, 2],
            RegisterOrder::R2R3R0R1 => [2, 3, 0, 1],
        }
    }

    /// Whether a 32-bit value leads with its most significant word
    ///
    /// The 32-bit projection of the table: orders whose first slot falls in
    /// the upper half reverse the two words.
    pub fn msw_first(self) -> bool {
        self.table()[0] >= 2
    }
}

/// A typed value read from or written to device memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Bit(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
}

impl Value {
    /// The value's type tag
    pub fn data_type(self) -> DataType {
        match self {
            Value::Bit(_) => DataType::Bit,
            Value::Int8(_) => DataType::Int8,
            Value::UInt8(_) => DataType::UInt8,
            Value::Int16(_) => DataType::Int16,
            Value::UInt16(_) => DataType::UInt16,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Int64(_) => DataType::Int64,
            Value::UInt64(_) => DataType::UInt64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
        }
    }

    /// Numeric view of the value
    ///
    /// 64-bit integers above 2^53 lose precision here; the simulation
    /// actions only use this for range comparisons.
    pub fn as_f64(self) -> f64 {
        match self {
            Value::Bit(v) => v as u8 as f64,
            Value::Int8(v) => v as f64,
            Value::UInt8(v) => v as f64,
            Value::Int16(v) => v as f64,
            Value::UInt16(v) => v as f64,
            Value::Int32(v) => v as f64,
            Value::UInt32(v) => v as f64,
            Value::Int64(v) => v as f64,
            Value::UInt64(v) => v as f64,
            Value::Float32(v) => v as f64,
            Value::Float64(v) => v,
        }
    }

    /// Construct a value of `dtype` from a float, saturating at the type's
    /// bounds
    pub fn from_f64(dtype: DataType, v: f64) -> Value {
        match dtype {
            DataType::Bit => Value::Bit(v != 0.0),
            DataType::Int8 => Value::Int8(v as i8),
            DataType::UInt8 => Value::UInt8(v as u8),
            DataType::Int16 => Value::Int16(v as i16),
            DataType::UInt16 => Value::UInt16(v as u16),
            DataType::Int32 => Value::Int32(v as i32),
            DataType::UInt32 => Value::UInt32(v as u32),
            DataType::Int64 => Value::Int64(v as i64),
            DataType::UInt64 => Value::UInt64(v as u64),
            DataType::Float32 => Value::Float32(v as f32),
            DataType::Float64 => Value::Float64(v),
        }
    }

    /// Add `step`, wrapping at the integer type's boundary
    ///
    /// Floats add without wrapping; the increment action applies its own
    /// min/max wrap afterwards.
    pub fn wrapping_step(self, step: f64) -> Value {
        let istep = step as i128;
        match self {
            Value::Bit(v) => Value::Bit(((v as i128).wrapping_add(istep) & 1) != 0),
            Value::Int8(v) => Value::Int8((v as i128).wrapping_add(istep) as i8),
            Value::UInt8(v) => Value::UInt8((v as i128).wrapping_add(istep) as u8),
            Value::Int16(v) => Value::Int16((v as i128).wrapping_add(istep) as i16),
            Value::UInt16(v) => Value::UInt16((v as i128).wrapping_add(istep) as u16),
            Value::Int32(v) => Value::Int32((v as i128).wrapping_add(istep) as i32),
            Value::UInt32(v) => Value::UInt32((v as i128).wrapping_add(istep) as u32),
            Value::Int64(v) => Value::Int64((v as i128).wrapping_add(istep) as i64),
            Value::UInt64(v) => Value::UInt64((v as i128).wrapping_add(istep) as u64),
            Value::Float32(v) => Value::Float32(v + step as f32),
            Value::Float64(v) => Value::Float64(v + step),
        }
    }

    /// Raw bit pattern, zero-extended to 64 bits
    fn to_raw(self) -> u64 {
        match self {
            Value::Bit(v) => v as u64,
            Value::Int8(v) => v as u8 as u64,
            Value::UInt8(v) => v as u64,
            Value::Int16(v) => v as u16 as u64,
            Value::UInt16(v) => v as u64,
            Value::Int32(v) => v as u32 as u64,
            Value::UInt32(v) => v as u64,
            Value::Int64(v) => v as u64,
            Value::UInt64(v) => v,
            Value::Float32(v) => v.to_bits() as u64,
            Value::Float64(v) => v.to_bits(),
        }
    }

    /// Rebuild a value of `dtype` from a raw bit pattern
    fn from_raw(dtype: DataType, raw: u64) -> Value {
        match dtype {
            DataType::Bit => Value::Bit(raw & 1 != 0),
            DataType::Int8 => Value::Int8(raw as u8 as i8),
            DataType::UInt8 => Value::UInt8(raw as u8),
            DataType::Int16 => Value::Int16(raw as u16 as i16),
            DataType::UInt16 => Value::UInt16(raw as u16),
            DataType::Int32 => Value::Int32(raw as u32 as i32),
            DataType::UInt32 => Value::UInt32(raw as u32),
            DataType::Int64 => Value::Int64(raw as i64),
            DataType::UInt64 => Value::UInt64(raw),
            DataType::Float32 => Value::Float32(f32::from_bits(raw as u32)),
            DataType::Float64 => Value::Float64(f64::from_bits(raw)),
        }
    }
}

/// Encode a value into register words using the given orders
///
/// Returns `dtype.registers()` words. Sub-register types come back
/// zero-extended in a single word; register-class callers merge them into
/// the target register's low byte themselves.
pub fn value_to_registers(value: Value, byte_order: ByteOrder, reg_order: RegisterOrder) -> Vec<u16> {
    let dtype = value.data_type();
    let raw = value.to_raw();
    let count = dtype.registers() as usize;

    // Words counted from the least significant end
    let words: Vec<u16> = (0..count).map(|i| (raw >> (16 * i)) as u16).collect();

    let placed: Vec<u16> = match count {
        1 => words,
        2 => {
            if reg_order.msw_first() {
                vec![words[1], words[0]]
            } else {
                words
            }
        }
        4 => {
            let table = reg_order.table();
            (0..4).map(|slot| words[table[slot]]).collect()
        }
        _ => words,
    };

    placed.into_iter().map(|w| byte_order.apply(w)).collect()
}

/// Decode register words into a value of `dtype`
///
/// Inverse of [`value_to_registers`]; the permutation tables are their own
/// inverse, so the same table drives both directions.
pub fn registers_to_value(
    dtype: DataType,
    regs: &[u16],
    byte_order: ByteOrder,
    reg_order: RegisterOrder,
) -> Result<Value, ExceptionCode> {
    let count = dtype.registers() as usize;
    if regs.len() < count {
        return Err(ExceptionCode::IllegalDataAddress);
    }

    let unswapped: Vec<u16> = regs[..count].iter().map(|&w| byte_order.apply(w)).collect();

    let words: Vec<u16> = match count {
        1 => unswapped,
        2 => {
            if reg_order.msw_first() {
                vec![unswapped[1], unswapped[0]]
            } else {
                unswapped
            }
        }
        4 => {
            let table = reg_order.table();
            (0..4).map(|word| unswapped[table[word]]).collect()
        }
        _ => unswapped,
    };

    let mut raw: u64 = 0;
    for (i, &w) in words.iter().enumerate() {
        raw |= (w as u64) << (16 * i);
    }

    Ok(Value::from_raw(dtype, raw))
}

/// Encode a value into the byte layout used by bit-class memory
///
/// Each register word is emitted low byte first, matching the block's
/// internal storage; 8-bit types emit their single byte.
pub fn value_to_bytes(value: Value, byte_order: ByteOrder, reg_order: RegisterOrder) -> Vec<u8> {
    let dtype = value.data_type();
    if dtype.bits() == 8 {
        return vec![value.to_raw() as u8];
    }
    let regs = value_to_registers(value, byte_order, reg_order);
    let mut bytes = Vec::with_capacity(regs.len() * 2);
    for w in regs {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    bytes
}

/// Decode bit-class bytes into a value of `dtype`
pub fn bytes_to_value(
    dtype: DataType,
    bytes: &[u8],
    byte_order: ByteOrder,
    reg_order: RegisterOrder,
) -> Result<Value, ExceptionCode> {
    if dtype.bits() == 8 {
        if bytes.is_empty() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        return Ok(Value::from_raw(dtype, bytes[0] as u64));
    }
    let count = dtype.registers() as usize;
    if bytes.len() < count * 2 {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    let regs: Vec<u16> = bytes[..count * 2]
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    registers_to_value(dtype, &regs, byte_order, reg_order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_order_tables_are_involutions() {
        for order in [
            RegisterOrder::R0R1R2R3,
            RegisterOrder::R3R2R1R0,
            RegisterOrder::R1R0R3R2,
            RegisterOrder::R2R3R0R1,
        ] {
            let table = order.table();
            for slot in 0..4 {
                assert_eq!(table[table[slot]], slot, "{:?} is not self-inverse", order);
            }
        }
    }

    #[test]
    fn test_u32_word_placement() {
        let v = Value::UInt32(0x1122_3344);

        // Low word first
        let regs = value_to_registers(v, ByteOrder::BigEndian, RegisterOrder::R0R1R2R3);
        assert_eq!(regs, vec![0x3344, 0x1122]);

        // High word first (textbook layout)
        let regs = value_to_registers(v, ByteOrder::BigEndian, RegisterOrder::R3R2R1R0);
        assert_eq!(regs, vec![0x1122, 0x3344]);

        // Byte swap applies within each register
        let regs = value_to_registers(v, ByteOrder::LittleEndian, RegisterOrder::R3R2R1R0);
        assert_eq!(regs, vec![0x2211, 0x4433]);
    }

    #[test]
    fn test_u64_permutations() {
        let v = Value::UInt64(0x0011_2233_4455_6677);
        // Words from the least significant end: w0=6677 w1=4455 w2=2233 w3=0011
        let cases = [
            (RegisterOrder::R0R1R2R3, vec![0x6677, 0x4455, 0x2233, 0x0011]),
            (RegisterOrder::R3R2R1R0, vec![0x0011, 0x2233, 0x4455, 0x6677]),
            (RegisterOrder::R1R0R3R2, vec![0x4455, 0x6677, 0x0011, 0x2233]),
            (RegisterOrder::R2R3R0R1, vec![0x2233, 0x0011, 0x6677, 0x4455]),
        ];
        for (order, expected) in cases {
            let regs = value_to_registers(v, ByteOrder::BigEndian, order);
            assert_eq!(regs, expected, "{:?}", order);
            let back = registers_to_value(DataType::UInt64, &regs, ByteOrder::BigEndian, order)
                .unwrap();
            assert_eq!(back, v, "{:?}", order);
        }
    }

    #[test]
    fn test_float_roundtrip() {
        for order in [
            RegisterOrder::R0R1R2R3,
            RegisterOrder::R3R2R1R0,
            RegisterOrder::R1R0R3R2,
            RegisterOrder::R2R3R0R1,
        ] {
            for bo in [ByteOrder::BigEndian, ByteOrder::LittleEndian] {
                let v = Value::Float32(123.5);
                let regs = value_to_registers(v, bo, order);
                assert_eq!(regs.len(), 2);
                let back = registers_to_value(DataType::Float32, &regs, bo, order).unwrap();
                assert_eq!(back, v);

                let v = Value::Float64(-0.015625);
                let regs = value_to_registers(v, bo, order);
                assert_eq!(regs.len(), 4);
                let back = registers_to_value(DataType::Float64, &regs, bo, order).unwrap();
                assert_eq!(back, v);
            }
        }
    }

    #[test]
    fn test_sixteen_bit_identity_under_be() {
        // With big-endian bytes a 16-bit value and its register coincide
        let regs = value_to_registers(
            Value::UInt16(0xABCD),
            ByteOrder::BigEndian,
            RegisterOrder::R0R1R2R3,
        );
        assert_eq!(regs, vec![0xABCD]);

        let regs = value_to_registers(
            Value::UInt16(0xABCD),
            ByteOrder::LittleEndian,
            RegisterOrder::R0R1R2R3,
        );
        assert_eq!(regs, vec![0xCDAB]);
    }

    #[test]
    fn test_wrapping_step() {
        assert_eq!(Value::UInt8(0xFF).wrapping_step(1.0), Value::UInt8(0));
        assert_eq!(Value::UInt8(0).wrapping_step(-1.0), Value::UInt8(0xFF));
        assert_eq!(Value::Int16(32767).wrapping_step(1.0), Value::Int16(-32768));
        assert_eq!(Value::UInt16(9).wrapping_step(3.0), Value::UInt16(12));
        assert_eq!(
            Value::Float32(1.5).wrapping_step(0.25),
            Value::Float32(1.75)
        );
    }

    #[test]
    fn test_from_f64_saturates() {
        assert_eq!(Value::from_f64(DataType::UInt8, 300.0), Value::UInt8(255));
        assert_eq!(Value::from_f64(DataType::UInt8, -5.0), Value::UInt8(0));
        assert_eq!(Value::from_f64(DataType::Int8, 200.0), Value::Int8(127));
    }

    #[test]
    fn test_bytes_roundtrip_for_bit_class_values() {
        let v = Value::UInt32(0xDEAD_BEEF);
        let bytes = value_to_bytes(v, ByteOrder::BigEndian, RegisterOrder::R0R1R2R3);
        assert_eq!(bytes.len(), 4);
        let back = bytes_to_value(
            DataType::UInt32,
            &bytes,
            ByteOrder::BigEndian,
            RegisterOrder::R0R1R2R3,
        )
        .unwrap();
        assert_eq!(back, v);

        let v = Value::UInt8(0x7F);
        let bytes = value_to_bytes(v, ByteOrder::BigEndian, RegisterOrder::R0R1R2R3);
        assert_eq!(bytes, vec![0x7F]);
    }
}
