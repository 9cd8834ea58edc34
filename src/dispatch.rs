//! Unit id dispatch: routing requests to devices.
//!
//! A [`DeviceTable`] maps the 256 possible unit ids onto shared devices.
//! Ports hold one table each; several units may point at the same device
//! and several ports may share one table.
//!
//! Every operation returns a [`UnitReply`]:
//!
//! - `Ready(Ok(_))` / `Ready(Err(code))`: the request ran, or failed with
//!   the exception code to send back. Unmapped units fail with
//!   `GatewayPathUnavailable` without touching any memory.
//! - `Pending`: the target device has an artificial response delay that has
//!   not elapsed yet. The caller parks the request and retries on a later
//!   pass; the table never blocks.
//! - `Broadcast`: the request was a broadcast write, fanned out to every
//!   distinct device. No response travels back for these.

use std::sync::Arc;

use crate::device::Device;
use crate::error::ExceptionCode;
use crate::protocol::{Request, Response, UnitId};

/// Unit id reserved for broadcast requests
pub const BROADCAST_UNIT: UnitId = 0;

/// Outcome of dispatching one request to a unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitReply<T> {
    /// The operation executed; payload or exception code
    Ready(Result<T, ExceptionCode>),
    /// Artificial delay still running; retry on a later pass
    Pending,
    /// Broadcast write executed; responses are suppressed
    Broadcast,
}

impl<T> UnitReply<T> {
    /// Map the success payload, keeping the other arms
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> UnitReply<U> {
        match self {
            UnitReply::Ready(Ok(v)) => UnitReply::Ready(Ok(f(v))),
            UnitReply::Ready(Err(e)) => UnitReply::Ready(Err(e)),
            UnitReply::Pending => UnitReply::Pending,
            UnitReply::Broadcast => UnitReply::Broadcast,
        }
    }
}

enum Gate<'a> {
    Go(&'a Arc<Device>),
    Unmapped,
    Delayed,
}

/// Unit id to device routing table
#[derive(Debug, Default)]
pub struct DeviceTable {
    units: Vec<Option<Arc<Device>>>,
    broadcast_enabled: bool,
}

impl DeviceTable {
    /// Create an empty table with broadcast disabled
    pub fn new() -> Self {
        Self {
            units: vec![None; 256],
            broadcast_enabled: false,
        }
    }

    /// Enable or disable broadcast handling for unit 0
    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast_enabled = enabled;
        self
    }

    /// Map a unit id to a device
    pub fn map(&mut self, unit: UnitId, device: Arc<Device>) {
        if self.units.is_empty() {
            self.units = vec![None; 256];
        }
        self.units[unit as usize] = Some(device);
    }

    /// Remove a unit mapping
    pub fn unmap(&mut self, unit: UnitId) {
        if let Some(slot) = self.units.get_mut(unit as usize) {
            *slot = None;
        }
    }

    /// The device mapped at a unit id, if any
    pub fn device(&self, unit: UnitId) -> Option<&Arc<Device>> {
        self.units.get(unit as usize).and_then(|d| d.as_ref())
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.broadcast_enabled
    }

    /// Units with a mapping, for diagnostics
    pub fn mapped_units(&self) -> Vec<UnitId> {
        self.units
            .iter()
            .enumerate()
            .filter_map(|(u, d)| d.as_ref().map(|_| u as UnitId))
            .collect()
    }

    fn is_broadcast(&self, unit: UnitId) -> bool {
        self.broadcast_enabled && unit == BROADCAST_UNIT
    }

    /// Resolve the unit and consult the device's delay gate
    fn gate(&self, unit: UnitId, now_ms: i64) -> Gate<'_> {
        match self.device(unit) {
            None => Gate::Unmapped,
            Some(dev) => {
                if dev.delay_elapsed(now_ms) {
                    Gate::Go(dev)
                } else {
                    Gate::Delayed
                }
            }
        }
    }

    /// Every distinct mapped device, deduplicated by identity
    fn distinct_devices(&self) -> Vec<&Arc<Device>> {
        let mut out: Vec<&Arc<Device>> = Vec::new();
        for dev in self.units.iter().flatten() {
            if !out.iter().any(|d| Arc::ptr_eq(d, dev)) {
                out.push(dev);
            }
        }
        out
    }

    // ---- read operations ----

    pub fn read_coils(&self, unit: UnitId, addr: u16, count: u16, now_ms: i64) -> UnitReply<Vec<bool>> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.read_coils(addr, count)),
        }
    }

    pub fn read_discrete_inputs(
        &self,
        unit: UnitId,
        addr: u16,
        count: u16,
        now_ms: i64,
    ) -> UnitReply<Vec<bool>> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.read_discrete_inputs(addr, count)),
        }
    }

    pub fn read_holding_registers(
        &self,
        unit: UnitId,
        addr: u16,
        count: u16,
        now_ms: i64,
    ) -> UnitReply<Vec<u16>> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.read_holding_registers(addr, count)),
        }
    }

    pub fn read_input_registers(
        &self,
        unit: UnitId,
        addr: u16,
        count: u16,
        now_ms: i64,
    ) -> UnitReply<Vec<u16>> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.read_input_registers(addr, count)),
        }
    }

    pub fn read_exception_status(&self, unit: UnitId, now_ms: i64) -> UnitReply<u8> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.read_exception_status()),
        }
    }

    pub fn report_server_id(&self, unit: UnitId, now_ms: i64) -> UnitReply<Vec<u8>> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(Ok(dev.report_server_id())),
        }
    }

    // ---- write operations (broadcast-capable) ----

    pub fn write_single_coil(
        &self,
        unit: UnitId,
        addr: u16,
        value: bool,
        now_ms: i64,
    ) -> UnitReply<()> {
        if self.is_broadcast(unit) {
            for dev in self.distinct_devices() {
                let _ = dev.write_single_coil(addr, value);
            }
            return UnitReply::Broadcast;
        }
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.write_single_coil(addr, value)),
        }
    }

    pub fn write_single_register(
        &self,
        unit: UnitId,
        addr: u16,
        value: u16,
        now_ms: i64,
    ) -> UnitReply<()> {
        if self.is_broadcast(unit) {
            for dev in self.distinct_devices() {
                let _ = dev.write_single_register(addr, value);
            }
            return UnitReply::Broadcast;
        }
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.write_single_register(addr, value)),
        }
    }

    pub fn write_multiple_coils(
        &self,
        unit: UnitId,
        addr: u16,
        values: &[bool],
        now_ms: i64,
    ) -> UnitReply<()> {
        if self.is_broadcast(unit) {
            for dev in self.distinct_devices() {
                let _ = dev.write_multiple_coils(addr, values);
            }
            return UnitReply::Broadcast;
        }
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.write_multiple_coils(addr, values)),
        }
    }

    pub fn write_multiple_registers(
        &self,
        unit: UnitId,
        addr: u16,
        values: &[u16],
        now_ms: i64,
    ) -> UnitReply<()> {
        if self.is_broadcast(unit) {
            for dev in self.distinct_devices() {
                let _ = dev.write_multiple_registers(addr, values);
            }
            return UnitReply::Broadcast;
        }
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.write_multiple_registers(addr, values)),
        }
    }

    pub fn mask_write_register(
        &self,
        unit: UnitId,
        addr: u16,
        and_mask: u16,
        or_mask: u16,
        now_ms: i64,
    ) -> UnitReply<()> {
        if self.is_broadcast(unit) {
            for dev in self.distinct_devices() {
                let _ = dev.mask_write_register(addr, and_mask, or_mask);
            }
            return UnitReply::Broadcast;
        }
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.mask_write_register(addr, and_mask, or_mask)),
        }
    }

    /// Function 0x17 carries a read, so it never broadcasts
    pub fn read_write_multiple_registers(
        &self,
        unit: UnitId,
        read_addr: u16,
        read_count: u16,
        write_addr: u16,
        values: &[u16],
        now_ms: i64,
    ) -> UnitReply<Vec<u16>> {
        match self.gate(unit, now_ms) {
            Gate::Unmapped => UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable)),
            Gate::Delayed => UnitReply::Pending,
            Gate::Go(dev) => UnitReply::Ready(dev.read_write_multiple_registers(
                read_addr, read_count, write_addr, values,
            )),
        }
    }

    /// Dispatch a parsed request and package the reply
    ///
    /// `Ready(Err(code))` still needs the engine to wrap it into an
    /// exception PDU with the request's function code.
    pub fn execute(&self, unit: UnitId, request: &Request, now_ms: i64) -> UnitReply<Response> {
        let function = request.function();
        match request {
            Request::ReadCoils { addr, count } => self
                .read_coils(unit, *addr, *count, now_ms)
                .map(|bits| Response::Bits { function, bits }),
            Request::ReadDiscreteInputs { addr, count } => self
                .read_discrete_inputs(unit, *addr, *count, now_ms)
                .map(|bits| Response::Bits { function, bits }),
            Request::ReadHoldingRegisters { addr, count } => self
                .read_holding_registers(unit, *addr, *count, now_ms)
                .map(|regs| Response::Registers { function, regs }),
            Request::ReadInputRegisters { addr, count } => self
                .read_input_registers(unit, *addr, *count, now_ms)
                .map(|regs| Response::Registers { function, regs }),
            Request::WriteSingleCoil { addr, value } => self
                .write_single_coil(unit, *addr, *value, now_ms)
                .map(|_| Response::Echo {
                    function,
                    addr: *addr,
                    value: if *value { 0xFF00 } else { 0x0000 },
                }),
            Request::WriteSingleRegister { addr, value } => self
                .write_single_register(unit, *addr, *value, now_ms)
                .map(|_| Response::Echo { function, addr: *addr, value: *value }),
            Request::ReadExceptionStatus => self
                .read_exception_status(unit, now_ms)
                .map(Response::ExceptionStatus),
            Request::WriteMultipleCoils { addr, values } => self
                .write_multiple_coils(unit, *addr, values, now_ms)
                .map(|_| Response::Echo {
                    function,
                    addr: *addr,
                    value: values.len() as u16,
                }),
            Request::WriteMultipleRegisters { addr, values } => self
                .write_multiple_registers(unit, *addr, values, now_ms)
                .map(|_| Response::Echo {
                    function,
                    addr: *addr,
                    value: values.len() as u16,
                }),
            Request::ReportServerId => self
                .report_server_id(unit, now_ms)
                .map(Response::ServerId),
            Request::MaskWriteRegister { addr, and_mask, or_mask } => self
                .mask_write_register(unit, *addr, *and_mask, *or_mask, now_ms)
                .map(|_| Response::MaskWrite {
                    addr: *addr,
                    and_mask: *and_mask,
                    or_mask: *or_mask,
                }),
            Request::ReadWriteMultipleRegisters {
                read_addr,
                read_count,
                write_addr,
                values,
            } => self
                .read_write_multiple_registers(
                    unit, *read_addr, *read_count, *write_addr, values, now_ms,
                )
                .map(|regs| Response::Registers { function, regs }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::protocol::ServerFunction;

    fn table_with(units: &[(UnitId, Arc<Device>)]) -> DeviceTable {
        let mut table = DeviceTable::new();
        for (unit, dev) in units {
            table.map(*unit, Arc::clone(dev));
        }
        table
    }

    #[test]
    fn test_unmapped_unit_is_gateway_path_unavailable() {
        let dev = Arc::new(Device::new("d1"));
        let table = table_with(&[(1, Arc::clone(&dev))]);
        let counter = dev.holding_registers().change_counter();

        assert_eq!(
            table.read_holding_registers(9, 0, 4, 0),
            UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable))
        );
        assert_eq!(
            table.write_single_register(9, 0, 1, 0),
            UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable))
        );
        // No memory was touched
        assert_eq!(dev.holding_registers().change_counter(), counter);
    }

    #[test]
    fn test_mapped_unit_dispatches() {
        let dev = Arc::new(Device::new("d1"));
        let table = table_with(&[(5, Arc::clone(&dev))]);

        assert_eq!(table.write_single_register(5, 3, 77, 0), UnitReply::Ready(Ok(())));
        assert_eq!(
            table.read_holding_registers(5, 3, 1, 0),
            UnitReply::Ready(Ok(vec![77]))
        );
    }

    #[test]
    fn test_delay_yields_pending_then_ready() {
        let dev = Arc::new(Device::new("slow").with_delay_ms(30));
        let table = table_with(&[(2, dev)]);

        assert_eq!(table.read_holding_registers(2, 0, 1, 1000), UnitReply::Pending);
        assert_eq!(table.read_holding_registers(2, 0, 1, 1010), UnitReply::Pending);
        assert_eq!(
            table.read_holding_registers(2, 0, 1, 1031),
            UnitReply::Ready(Ok(vec![0]))
        );
        // Next request starts a fresh delay window
        assert_eq!(table.read_holding_registers(2, 0, 1, 1032), UnitReply::Pending);
    }

    #[test]
    fn test_broadcast_fans_out_once_per_device() {
        let a = Arc::new(Device::new("a"));
        let b = Arc::new(Device::new("b"));
        // Device a is mapped twice; the fan-out must still hit it once
        let table = table_with(&[(1, Arc::clone(&a)), (2, Arc::clone(&a)), (3, Arc::clone(&b))])
            .with_broadcast(true);

        let a_before = a.holding_registers().change_counter();
        let b_before = b.holding_registers().change_counter();

        assert_eq!(
            table.write_single_register(BROADCAST_UNIT, 0, 42, 0),
            UnitReply::Broadcast
        );
        assert_eq!(a.holding_registers().change_counter(), a_before + 1);
        assert_eq!(b.holding_registers().change_counter(), b_before + 1);
        assert_eq!(a.read_holding_registers(0, 1), Ok(vec![42]));
        assert_eq!(b.read_holding_registers(0, 1), Ok(vec![42]));
    }

    #[test]
    fn test_broadcast_disabled_unit_zero_is_ordinary() {
        let dev = Arc::new(Device::new("d"));
        let table = table_with(&[(1, dev)]);
        assert_eq!(
            table.write_single_register(0, 0, 1, 0),
            UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable))
        );
    }

    #[test]
    fn test_broadcast_reads_fall_through_to_unit_zero() {
        let dev = Arc::new(Device::new("at-zero"));
        dev.holding_registers().write_regs(0, &[7]).unwrap();
        let table = table_with(&[(0, dev)]).with_broadcast(true);

        assert_eq!(
            table.read_holding_registers(0, 0, 1, 0),
            UnitReply::Ready(Ok(vec![7]))
        );
    }

    #[test]
    fn test_execute_packages_responses() {
        let dev = Arc::new(Device::new("d"));
        let table = table_with(&[(1, dev)]);

        let reply = table.execute(
            1,
            &Request::WriteSingleRegister { addr: 2, value: 0xBEEF },
            0,
        );
        assert_eq!(
            reply,
            UnitReply::Ready(Ok(Response::Echo {
                function: ServerFunction::WriteSingleRegister,
                addr: 2,
                value: 0xBEEF,
            }))
        );

        let reply = table.execute(1, &Request::ReadHoldingRegisters { addr: 2, count: 1 }, 0);
        assert_eq!(
            reply,
            UnitReply::Ready(Ok(Response::Registers {
                function: ServerFunction::ReadHoldingRegisters,
                regs: vec![0xBEEF],
            }))
        );

        let reply = table.execute(7, &Request::ReadExceptionStatus, 0);
        assert_eq!(
            reply,
            UnitReply::Ready(Err(ExceptionCode::GatewayPathUnavailable))
        );
    }
}
