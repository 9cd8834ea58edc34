//! Simulated Modbus server device.
//!
//! A [`Device`] bundles the four memory classes with the policy that sits
//! between them and the protocol: per-function quantity quotas, the
//! read-only flag, the exception-status address, default byte/register
//! orders for typed access, and the artificial response delay gate.
//!
//! Every protocol-facing operation validates before it mutates. A request
//! that fails quota, bounds or policy checks leaves memory untouched and
//! maps to a single [`ExceptionCode`].
//!
//! | Class              | Table | Width  | Protocol writes |
//! |--------------------|-------|--------|-----------------|
//! | Coils              | 0x    | 1 bit  | yes             |
//! | Discrete inputs    | 1x    | 1 bit  | no              |
//! | Input registers    | 3x    | 16 bit | no              |
//! | Holding registers  | 4x    | 16 bit | yes             |
//!
//! Discrete inputs and input registers are writable only through the
//! typed accessors ([`Device::set_value`]), which is how the simulation
//! engine and embedding UIs feed them.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::data::{
    bytes_to_value, registers_to_value, value_to_bytes, value_to_registers, ByteOrder, DataType,
    RegisterOrder, Value,
};
use crate::error::ExceptionCode;
use crate::memory::RegisterBlock;

/// Longest server id carried in a Report Server ID response
pub const MAX_SERVER_ID_LEN: usize = 32;

/// The four Modbus memory classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemClass {
    /// 0x table, bit-wide, read/write
    #[serde(alias = "0x", alias = "coil")]
    Coils,
    /// 1x table, bit-wide, read-only on the wire
    #[serde(alias = "1x", alias = "discrete")]
    DiscreteInputs,
    /// 3x table, register-wide, read-only on the wire
    #[serde(alias = "3x", alias = "input")]
    InputRegisters,
    /// 4x table, register-wide, read/write
    #[serde(alias = "4x", alias = "holding")]
    HoldingRegisters,
}

impl MemClass {
    /// Bit-wide classes address individual bits; register classes address
    /// 16-bit registers
    pub fn is_bit_class(self) -> bool {
        matches!(self, MemClass::Coils | MemClass::DiscreteInputs)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemClass::Coils => "coils",
            MemClass::DiscreteInputs => "discrete_inputs",
            MemClass::InputRegisters => "input_registers",
            MemClass::HoldingRegisters => "holding_registers",
        }
    }
}

/// A memory class plus an offset within it
///
/// The offset counts bits for bit classes and registers for register
/// classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAddress {
    pub class: MemClass,
    pub offset: u16,
}

impl MemAddress {
    pub fn new(class: MemClass, offset: u16) -> Self {
        Self { class, offset }
    }
}

/// Per-function maximum quantities
///
/// Requests above a quota are rejected with `IllegalDataAddress` before any
/// memory access. Defaults follow the Modbus application protocol limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceQuotas {
    pub max_read_coils: u16,
    pub max_read_discrete_inputs: u16,
    pub max_read_holding_registers: u16,
    pub max_read_input_registers: u16,
    pub max_write_multiple_coils: u16,
    pub max_write_multiple_registers: u16,
    /// Applies to both the read and the write count of function 0x17
    pub max_read_write_registers: u16,
}

impl Default for DeviceQuotas {
    fn default() -> Self {
        Self {
            max_read_coils: 2000,
            max_read_discrete_inputs: 2000,
            max_read_holding_registers: 125,
            max_read_input_registers: 125,
            max_write_multiple_coils: 1968,
            max_write_multiple_registers: 123,
            max_read_write_registers: 121,
        }
    }
}

/// A simulated server device: four memory blocks plus access policy
#[derive(Debug)]
pub struct Device {
    name: String,
    coils: RegisterBlock,
    discrete_inputs: RegisterBlock,
    input_registers: RegisterBlock,
    holding_registers: RegisterBlock,
    quotas: DeviceQuotas,
    read_only: AtomicBool,
    exception_status: MemAddress,
    byte_order: ByteOrder,
    reg_order: RegisterOrder,
    delay_ms: u64,
    /// Epoch ms when the currently delayed request was first seen; 0 = idle.
    /// One gate per device, shared by every port that maps it.
    delay_started: AtomicI64,
}

impl Device {
    /// Create a device covering the full Modbus address space
    ///
    /// 65536 bits in each bit class and 65536 registers in each register
    /// class, all zeroed. Blocks can be resized afterwards through
    /// [`block`](Self::block).
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            coils: RegisterBlock::new(65536),
            discrete_inputs: RegisterBlock::new(65536),
            input_registers: RegisterBlock::with_regs(65536),
            holding_registers: RegisterBlock::with_regs(65536),
            quotas: DeviceQuotas::default(),
            read_only: AtomicBool::new(false),
            exception_status: MemAddress::new(MemClass::Coils, 0),
            byte_order: ByteOrder::default(),
            reg_order: RegisterOrder::default(),
            delay_ms: 0,
            delay_started: AtomicI64::new(0),
        }
    }

    /// Replace the quota set
    pub fn with_quotas(mut self, quotas: DeviceQuotas) -> Self {
        self.quotas = quotas;
        self
    }

    /// Set the artificial response delay
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set the address served by Read Exception Status (0x07)
    pub fn with_exception_status(mut self, addr: MemAddress) -> Self {
        self.exception_status = addr;
        self
    }

    /// Set the default orders used by the typed accessors
    pub fn with_orders(mut self, byte_order: ByteOrder, reg_order: RegisterOrder) -> Self {
        self.byte_order = byte_order;
        self.reg_order = reg_order;
        self
    }

    /// Set the initial read-only state
    pub fn with_read_only(self, read_only: bool) -> Self {
        self.read_only.store(read_only, Ordering::Relaxed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quotas(&self) -> &DeviceQuotas {
        &self.quotas
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn reg_order(&self) -> RegisterOrder {
        self.reg_order
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Whether protocol writes are currently rejected
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    /// Toggle protocol write rejection at runtime
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }

    /// The block backing a memory class
    pub fn block(&self, class: MemClass) -> &RegisterBlock {
        match class {
            MemClass::Coils => &self.coils,
            MemClass::DiscreteInputs => &self.discrete_inputs,
            MemClass::InputRegisters => &self.input_registers,
            MemClass::HoldingRegisters => &self.holding_registers,
        }
    }

    pub fn coils(&self) -> &RegisterBlock {
        &self.coils
    }

    pub fn discrete_inputs(&self) -> &RegisterBlock {
        &self.discrete_inputs
    }

    pub fn input_registers(&self) -> &RegisterBlock {
        &self.input_registers
    }

    pub fn holding_registers(&self) -> &RegisterBlock {
        &self.holding_registers
    }

    // ---- delay gate ----

    /// Non-blocking artificial delay gate
    ///
    /// With a configured delay, the first call stamps the shared in-flight
    /// timestamp and reports `false`; later calls keep reporting `false`
    /// until the delay has elapsed, then clear the stamp and report `true`.
    /// Devices without a delay always report `true`.
    pub fn delay_elapsed(&self, now_ms: i64) -> bool {
        if self.delay_ms == 0 {
            return true;
        }
        let started = self.delay_started.load(Ordering::Acquire);
        if started == 0 {
            // Lost races leave the earlier stamp in place
            let _ = self
                .delay_started
                .compare_exchange(0, now_ms, Ordering::AcqRel, Ordering::Acquire);
            false
        } else if now_ms.saturating_sub(started) >= self.delay_ms as i64 {
            self.delay_started.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    // ---- validation helpers ----

    fn check_writable(&self) -> Result<(), ExceptionCode> {
        if self.is_read_only() {
            Err(ExceptionCode::IllegalFunction)
        } else {
            Ok(())
        }
    }

    /// Zero counts and counts above the quota are both addressing errors
    fn check_read(&self, count: u16, quota: u16) -> Result<(), ExceptionCode> {
        if count == 0 || count > quota {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    fn check_bit_range(block: &RegisterBlock, addr: u16, count: u16) -> Result<(), ExceptionCode> {
        if addr as usize + count as usize > block.size_bits() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    fn check_reg_range(block: &RegisterBlock, addr: u16, count: u16) -> Result<(), ExceptionCode> {
        if addr as usize + count as usize > block.size_regs() {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    // ---- read function codes ----

    /// Read Coils (0x01)
    pub fn read_coils(&self, addr: u16, count: u16) -> Result<Vec<bool>, ExceptionCode> {
        self.check_read(count, self.quotas.max_read_coils)?;
        Self::check_bit_range(&self.coils, addr, count)?;
        self.coils.read_bools(addr as usize, count as usize)
    }

    /// Read Discrete Inputs (0x02)
    pub fn read_discrete_inputs(&self, addr: u16, count: u16) -> Result<Vec<bool>, ExceptionCode> {
        self.check_read(count, self.quotas.max_read_discrete_inputs)?;
        Self::check_bit_range(&self.discrete_inputs, addr, count)?;
        self.discrete_inputs.read_bools(addr as usize, count as usize)
    }

    /// Read Holding Registers (0x03)
    pub fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.check_read(count, self.quotas.max_read_holding_registers)?;
        Self::check_reg_range(&self.holding_registers, addr, count)?;
        self.holding_registers.read_regs(addr as usize, count as usize)
    }

    /// Read Input Registers (0x04)
    pub fn read_input_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.check_read(count, self.quotas.max_read_input_registers)?;
        Self::check_reg_range(&self.input_registers, addr, count)?;
        self.input_registers.read_regs(addr as usize, count as usize)
    }

    /// Read Exception Status (0x07)
    ///
    /// Returns the 8 status bits at the configured address, reinterpreted
    /// by the owning class: bit classes pack 8 bits from the bit offset,
    /// register classes take the register's low byte.
    pub fn read_exception_status(&self) -> Result<u8, ExceptionCode> {
        let addr = self.exception_status;
        let block = self.block(addr.class);
        if addr.class.is_bit_class() {
            let (bytes, _) = block.read_bits(addr.offset as usize, 8)?;
            Ok(bytes.first().copied().unwrap_or(0))
        } else {
            let regs = block.read_regs(addr.offset as usize, 1)?;
            match regs.first() {
                Some(&r) => Ok(r as u8),
                None => Err(ExceptionCode::IllegalDataAddress),
            }
        }
    }

    /// Report Server ID (0x11) payload: the device name, truncated
    pub fn report_server_id(&self) -> Vec<u8> {
        let bytes = self.name.as_bytes();
        bytes[..bytes.len().min(MAX_SERVER_ID_LEN)].to_vec()
    }

    // ---- write function codes ----

    /// Write Single Coil (0x05)
    pub fn write_single_coil(&self, addr: u16, value: bool) -> Result<(), ExceptionCode> {
        self.check_writable()?;
        Self::check_bit_range(&self.coils, addr, 1)?;
        self.coils.write_bools(addr as usize, &[value])
    }

    /// Write Single Register (0x06)
    pub fn write_single_register(&self, addr: u16, value: u16) -> Result<(), ExceptionCode> {
        self.check_writable()?;
        Self::check_reg_range(&self.holding_registers, addr, 1)?;
        self.holding_registers.write_regs(addr as usize, &[value])
    }

    /// Write Multiple Coils (0x0F)
    pub fn write_multiple_coils(&self, addr: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        self.check_writable()?;
        let count = values.len() as u16;
        if values.is_empty() || count > self.quotas.max_write_multiple_coils {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Self::check_bit_range(&self.coils, addr, count)?;
        self.coils.write_bools(addr as usize, values)
    }

    /// Write Multiple Registers (0x10)
    pub fn write_multiple_registers(&self, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        self.check_writable()?;
        let count = values.len() as u16;
        if values.is_empty() || count > self.quotas.max_write_multiple_registers {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Self::check_reg_range(&self.holding_registers, addr, count)?;
        self.holding_registers.write_regs(addr as usize, values)
    }

    /// Mask Write Register (0x16): `result = (current & and) | (or & !and)`
    ///
    /// The read-modify-write happens under a single lock acquisition.
    pub fn mask_write_register(
        &self,
        addr: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> Result<(), ExceptionCode> {
        self.check_writable()?;
        self.holding_registers
            .update_reg(addr as usize, |cur| (cur & and_mask) | (or_mask & !and_mask))
            .map(|_| ())
    }

    /// Read/Write Multiple Registers (0x17)
    ///
    /// Both ranges are validated up front; the write lands before the read,
    /// so a read range overlapping the write range sees the new values.
    pub fn read_write_multiple_registers(
        &self,
        read_addr: u16,
        read_count: u16,
        write_addr: u16,
        values: &[u16],
    ) -> Result<Vec<u16>, ExceptionCode> {
        self.check_writable()?;
        self.check_read(read_count, self.quotas.max_read_write_registers)?;
        let write_count = values.len() as u16;
        if values.is_empty() || write_count > self.quotas.max_read_write_registers {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Self::check_reg_range(&self.holding_registers, read_addr, read_count)?;
        Self::check_reg_range(&self.holding_registers, write_addr, write_count)?;

        self.holding_registers.write_regs(write_addr as usize, values)?;
        self.holding_registers
            .read_regs(read_addr as usize, read_count as usize)
    }

    // ---- typed accessors ----

    /// Read a typed value using the device's default orders
    pub fn value(&self, addr: MemAddress, dtype: DataType) -> Result<Value, ExceptionCode> {
        self.value_with(addr, dtype, self.byte_order, self.reg_order)
    }

    /// Read a typed value with explicit orders
    ///
    /// Bit-class offsets count bits, register-class offsets count
    /// registers. Sub-register types in register classes read the
    /// register's low byte (or report whether it is non-zero for `Bit`).
    pub fn value_with(
        &self,
        addr: MemAddress,
        dtype: DataType,
        byte_order: ByteOrder,
        reg_order: RegisterOrder,
    ) -> Result<Value, ExceptionCode> {
        let block = self.block(addr.class);
        let off = addr.offset as usize;
        if addr.class.is_bit_class() {
            if dtype == DataType::Bit {
                let bits = block.read_bools(off, 1)?;
                return Ok(Value::Bit(bits.first().copied().unwrap_or(false)));
            }
            let want = dtype.bits() as usize;
            let (bytes, got) = block.read_bits(off, want)?;
            if got < want {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            bytes_to_value(dtype, &bytes, byte_order, reg_order)
        } else {
            match dtype {
                DataType::Bit => {
                    let regs = block.read_regs(off, 1)?;
                    match regs.first() {
                        Some(&r) => Ok(Value::Bit(r != 0)),
                        None => Err(ExceptionCode::IllegalDataAddress),
                    }
                }
                DataType::Int8 => {
                    let regs = block.read_regs(off, 1)?;
                    match regs.first() {
                        Some(&r) => Ok(Value::Int8(r as u8 as i8)),
                        None => Err(ExceptionCode::IllegalDataAddress),
                    }
                }
                DataType::UInt8 => {
                    let regs = block.read_regs(off, 1)?;
                    match regs.first() {
                        Some(&r) => Ok(Value::UInt8(r as u8)),
                        None => Err(ExceptionCode::IllegalDataAddress),
                    }
                }
                _ => {
                    let want = dtype.registers() as usize;
                    let regs = block.read_regs(off, want)?;
                    if regs.len() < want {
                        return Err(ExceptionCode::IllegalDataAddress);
                    }
                    registers_to_value(dtype, &regs, byte_order, reg_order)
                }
            }
        }
    }

    /// Write a typed value using the device's default orders
    ///
    /// The typed accessors are the simulation/UI path: the read-only flag
    /// only guards protocol writes and is not checked here, and all four
    /// memory classes are writable, the wire-read-only ones included.
    pub fn set_value(&self, addr: MemAddress, value: Value) -> Result<(), ExceptionCode> {
        self.set_value_with(addr, value, self.byte_order, self.reg_order)
    }

    /// Write a typed value with explicit orders
    pub fn set_value_with(
        &self,
        addr: MemAddress,
        value: Value,
        byte_order: ByteOrder,
        reg_order: RegisterOrder,
    ) -> Result<(), ExceptionCode> {
        let block = self.block(addr.class);
        let off = addr.offset as usize;
        let dtype = value.data_type();
        if addr.class.is_bit_class() {
            if let Value::Bit(b) = value {
                Self::check_bit_range(block, addr.offset, 1)?;
                return block.write_bools(off, &[b]);
            }
            let bits = dtype.bits() as usize;
            if off + bits > block.size_bits() {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            let bytes = value_to_bytes(value, byte_order, reg_order);
            block.write_bits(off, bits, &bytes)
        } else {
            match value {
                Value::Bit(b) => block.update_reg(off, |_| b as u16).map(|_| ()),
                Value::Int8(v) => block
                    .update_reg(off, |cur| (cur & 0xFF00) | (v as u8 as u16))
                    .map(|_| ()),
                Value::UInt8(v) => block
                    .update_reg(off, |cur| (cur & 0xFF00) | (v as u16))
                    .map(|_| ()),
                _ => {
                    let count = dtype.registers();
                    Self::check_reg_range(block, addr.offset, count)?;
                    let regs = value_to_registers(value, byte_order, reg_order);
                    block.write_regs(off, &regs)
                }
            }
        }
    }
}
