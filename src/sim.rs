//! Simulation actions: periodic value generators running against devices.
//!
//! Each [`SimAction`] binds one behavior to a typed location in device
//! memory. The [`SimEngine`] drives all actions from a single task on a
//! fixed base tick; an action with a longer period runs when its period has
//! elapsed, an action with period zero runs on every tick.
//!
//! Actions write through the typed device accessors, so they update
//! read-only devices and input classes that protocol writes cannot touch.

use std::sync::Arc;
use std::time::Duration;
use log::warn;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::data::{ByteOrder, DataType, RegisterOrder, Value};
use crate::device::{Device, MemAddress};
use crate::error::ExceptionCode;
use crate::logging::SharedSink;

/// Base tick of the simulation engine
pub const BASE_TICK_MS: u64 = 50;

/// What an action does on each run
#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    /// Step the value, wrapping back to `min` when it leaves `[min, max]`
    Increment { step: f64, min: f64, max: f64 },
    /// `amplitude * sin(2pi * (t - phase) / period) + shift` over epoch time
    Sine {
        period_ms: i64,
        phase_ms: i64,
        amplitude: f64,
        shift: f64,
    },
    /// Uniform value in `[min, max]`
    Random { min: f64, max: f64 },
    /// Copy `count` bits or registers from another location on the device
    Copy { source: MemAddress, count: u16 },
}

/// One periodic behavior bound to a typed memory location
pub struct SimAction {
    device: Arc<Device>,
    address: MemAddress,
    data_type: DataType,
    period_ms: i64,
    kind: ActionKind,
    byte_order: ByteOrder,
    reg_order: RegisterOrder,
    last_run: i64,
    warned: bool,
}

impl SimAction {
    /// New action using the device's default value orders
    pub fn new(
        device: Arc<Device>,
        address: MemAddress,
        data_type: DataType,
        period_ms: i64,
        kind: ActionKind,
    ) -> Self {
        let byte_order = device.byte_order();
        let reg_order = device.reg_order();
        Self {
            device,
            address,
            data_type,
            period_ms,
            kind,
            byte_order,
            reg_order,
            last_run: 0,
            warned: false,
        }
    }

    /// Override the value orders for this action only
    pub fn with_orders(mut self, byte_order: ByteOrder, reg_order: RegisterOrder) -> Self {
        self.byte_order = byte_order;
        self.reg_order = reg_order;
        self
    }

    /// Stamp the period origin; the first run happens one period later
    pub fn init(&mut self, now_ms: i64) {
        self.last_run = now_ms;
    }

    /// Stamp the terminal tick; a later `tick` waits a full period again
    pub fn finish(&mut self, now_ms: i64) {
        self.last_run = now_ms;
        self.warned = false;
    }

    /// Run the action if its period has elapsed
    pub fn tick(&mut self, now_ms: i64) {
        if self.period_ms > 0 && now_ms - self.last_run < self.period_ms {
            return;
        }
        self.last_run = now_ms;
        match self.run(now_ms) {
            Ok(()) => self.warned = false,
            Err(code) => {
                // Warn once per failure streak, not once per tick
                if !self.warned {
                    warn!(
                        "action on {} {}:{} failed: {}",
                        self.device.name(),
                        self.address.class.as_str(),
                        self.address.offset,
                        code
                    );
                    self.warned = true;
                }
            }
        }
    }

    /// Run the action unconditionally
    pub fn run(&self, now_ms: i64) -> Result<(), ExceptionCode> {
        match &self.kind {
            ActionKind::Increment { step, min, max } => {
                let current = self.read_value()?;
                let mut next = current.wrapping_step(*step);
                let v = next.as_f64();
                if v < *min || v > *max {
                    next = Value::from_f64(self.data_type, *min);
                }
                self.write_value(next)
            }
            ActionKind::Sine {
                period_ms,
                phase_ms,
                amplitude,
                shift,
            } => {
                if *period_ms <= 0 {
                    return Ok(());
                }
                let turns = (now_ms - phase_ms) as f64 / *period_ms as f64;
                let v = amplitude * (turns * std::f64::consts::TAU).sin() + shift;
                self.write_value(Value::from_f64(self.data_type, v))
            }
            ActionKind::Random { min, max } => {
                let (lo, hi) = if min <= max { (*min, *max) } else { (*max, *min) };
                let v = if lo == hi {
                    lo
                } else {
                    rand::thread_rng().gen_range(lo..=hi)
                };
                self.write_value(Value::from_f64(self.data_type, v))
            }
            ActionKind::Copy { source, count } => self.run_copy(*source, *count),
        }
    }

    fn read_value(&self) -> Result<Value, ExceptionCode> {
        self.device
            .value_with(self.address, self.data_type, self.byte_order, self.reg_order)
    }

    fn write_value(&self, value: Value) -> Result<(), ExceptionCode> {
        self.device
            .set_value_with(self.address, value, self.byte_order, self.reg_order)
    }

    fn run_copy(&self, source: MemAddress, count: u16) -> Result<(), ExceptionCode> {
        // Copies stay within one shape: bits to bits, registers to registers
        if source.class.is_bit_class() != self.address.class.is_bit_class() {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if count == 0 {
            return Ok(());
        }
        let src = self.device.block(source.class);
        let dst = self.device.block(self.address.class);
        if source.class.is_bit_class() {
            let bits = src.read_bools(source.offset as usize, count as usize)?;
            dst.write_bools(self.address.offset as usize, &bits)
        } else {
            let regs = src.read_regs(source.offset as usize, count as usize)?;
            dst.write_regs(self.address.offset as usize, &regs)
        }
    }
}

/// Drives all simulation actions from one task
pub struct SimEngine {
    sink: SharedSink,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SimEngine {
    /// Spawn the tick loop
    pub fn spawn(mut actions: Vec<SimAction>, sink: SharedSink) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        sink.info("sim", &format!("engine started, {} actions", actions.len()));

        let handle = tokio::spawn(async move {
            let start = chrono::Utc::now().timestamp_millis();
            for action in &mut actions {
                action.init(start);
            }
            let mut ticker = tokio::time::interval(Duration::from_millis(BASE_TICK_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = chrono::Utc::now().timestamp_millis();
                        for action in &mut actions {
                            action.tick(now);
                        }
                    }
                }
            }
            let end = chrono::Utc::now().timestamp_millis();
            for action in &mut actions {
                action.finish(end);
            }
        });

        Self {
            sink,
            token,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop the tick loop and join the task
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.sink.info("sim", "engine stopped");
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemClass;
    use crate::logging::NullSink;

    fn holding(offset: u16) -> MemAddress {
        MemAddress::new(MemClass::HoldingRegisters, offset)
    }

    // Test the increment wrap rule

    #[test]
    fn test_increment_wraps_to_min_beyond_max() {
        let dev = Arc::new(Device::new("inc"));
        dev.set_value(holding(0), Value::UInt8(9)).unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt8,
            0,
            ActionKind::Increment { step: 3.0, min: 0.0, max: 10.0 },
        );

        // 9 steps to 12, which exceeds 10, so the value wraps to min
        let mut seen = Vec::new();
        for _ in 0..4 {
            action.run(0).unwrap();
            seen.push(dev.value(holding(0), DataType::UInt8).unwrap().as_f64());
        }
        assert_eq!(seen, vec![0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_increment_integer_overflow_wraps_then_clamps() {
        let dev = Arc::new(Device::new("inc16"));
        dev.set_value(holding(0), Value::Int16(i16::MAX)).unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::Int16,
            0,
            ActionKind::Increment { step: 1.0, min: -100.0, max: 32767.0 },
        );

        // 32767 + 1 wraps to -32768, which is below min
        action.run(0).unwrap();
        assert_eq!(dev.value(holding(0), DataType::Int16).unwrap(), Value::Int16(-100));
    }

    #[test]
    fn test_increment_float_step() {
        let dev = Arc::new(Device::new("incf"));
        dev.set_value(holding(0), Value::Float32(1.5)).unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::Float32,
            0,
            ActionKind::Increment { step: 0.25, min: 0.0, max: 100.0 },
        );
        action.run(0).unwrap();
        assert_eq!(
            dev.value(holding(0), DataType::Float32).unwrap(),
            Value::Float32(1.75)
        );
    }

    // Test the sine generator at known phase points

    #[test]
    fn test_sine_quarter_period_hits_amplitude() {
        let dev = Arc::new(Device::new("sine"));
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::Float32,
            0,
            ActionKind::Sine {
                period_ms: 10_000,
                phase_ms: 0,
                amplitude: 100.0,
                shift: 0.0,
            },
        );

        action.run(2_500).unwrap();
        let peak = dev.value(holding(0), DataType::Float32).unwrap().as_f64();
        assert!((peak - 100.0).abs() < 1e-3, "quarter period peak was {}", peak);

        action.run(7_500).unwrap();
        let trough = dev.value(holding(0), DataType::Float32).unwrap().as_f64();
        assert!((trough + 100.0).abs() < 1e-3, "trough was {}", trough);
    }

    #[test]
    fn test_sine_phase_and_shift() {
        let dev = Arc::new(Device::new("sine2"));
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::Float64,
            0,
            ActionKind::Sine {
                period_ms: 10_000,
                phase_ms: 2_500,
                amplitude: 50.0,
                shift: 10.0,
            },
        );

        // Quarter period after the phase origin
        action.run(5_000).unwrap();
        let v = dev.value(holding(0), DataType::Float64).unwrap().as_f64();
        assert!((v - 60.0).abs() < 1e-9, "shifted peak was {}", v);
    }

    #[test]
    fn test_sine_zero_period_is_noop() {
        let dev = Arc::new(Device::new("sine0"));
        dev.set_value(holding(0), Value::UInt16(77)).unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt16,
            0,
            ActionKind::Sine { period_ms: 0, phase_ms: 0, amplitude: 1.0, shift: 0.0 },
        );
        action.run(1234).unwrap();
        assert_eq!(dev.value(holding(0), DataType::UInt16).unwrap(), Value::UInt16(77));
    }

    // Test the random generator bounds

    #[test]
    fn test_random_stays_in_range() {
        let dev = Arc::new(Device::new("rand"));
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::Int16,
            0,
            ActionKind::Random { min: 10.0, max: 20.0 },
        );
        for _ in 0..50 {
            action.run(0).unwrap();
            let v = dev.value(holding(0), DataType::Int16).unwrap().as_f64();
            assert!((10.0..=20.0).contains(&v), "out of range: {}", v);
        }
    }

    #[test]
    fn test_random_tolerates_swapped_bounds() {
        let dev = Arc::new(Device::new("rand2"));
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt16,
            0,
            ActionKind::Random { min: 20.0, max: 10.0 },
        );
        for _ in 0..20 {
            action.run(0).unwrap();
            let v = dev.value(holding(0), DataType::UInt16).unwrap().as_f64();
            assert!((10.0..=20.0).contains(&v));
        }
    }

    // Test copies

    #[test]
    fn test_copy_registers_across_classes() {
        let dev = Arc::new(Device::new("copy"));
        dev.input_registers().write_regs(0, &[1, 2, 3]).unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(10),
            DataType::UInt16,
            0,
            ActionKind::Copy {
                source: MemAddress::new(MemClass::InputRegisters, 0),
                count: 3,
            },
        );
        action.run(0).unwrap();
        assert_eq!(dev.read_holding_registers(10, 3), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn test_copy_bits() {
        let dev = Arc::new(Device::new("copy-bits"));
        dev.coils()
            .write_bools(0, &[true, false, true, true, false])
            .unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            MemAddress::new(MemClass::DiscreteInputs, 8),
            DataType::Bit,
            0,
            ActionKind::Copy {
                source: MemAddress::new(MemClass::Coils, 0),
                count: 5,
            },
        );
        action.run(0).unwrap();
        assert_eq!(
            dev.read_discrete_inputs(8, 5),
            Ok(vec![true, false, true, true, false])
        );
    }

    #[test]
    fn test_copy_rejects_mixed_shapes() {
        let dev = Arc::new(Device::new("copy-mixed"));
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt16,
            0,
            ActionKind::Copy {
                source: MemAddress::new(MemClass::Coils, 0),
                count: 8,
            },
        );
        assert_eq!(action.run(0), Err(ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn test_action_orders_override_device_defaults() {
        let dev = Arc::new(Device::new("orders"));
        dev.set_value_with(
            holding(0),
            Value::UInt32(0x0001_0002),
            ByteOrder::BigEndian,
            RegisterOrder::R3R2R1R0,
        )
        .unwrap();
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt32,
            0,
            ActionKind::Increment { step: 1.0, min: 0.0, max: 4_294_967_295.0 },
        )
        .with_orders(ByteOrder::BigEndian, RegisterOrder::R3R2R1R0);

        action.run(0).unwrap();
        // R3R2R1R0 keeps the most significant word in the first register
        assert_eq!(dev.read_holding_registers(0, 2), Ok(vec![0x0001, 0x0003]));
    }

    // Test period gating through tick()

    #[test]
    fn test_tick_respects_period() {
        let dev = Arc::new(Device::new("period"));
        let mut action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt16,
            100,
            ActionKind::Increment { step: 1.0, min: 0.0, max: 65535.0 },
        );

        action.tick(1000);
        action.tick(1050); // period not elapsed, skipped
        action.tick(1100);
        assert_eq!(
            dev.value(holding(0), DataType::UInt16).unwrap(),
            Value::UInt16(2)
        );

        // finish closes the window, so the next tick waits a full period
        action.finish(1150);
        action.tick(1200);
        assert_eq!(
            dev.value(holding(0), DataType::UInt16).unwrap(),
            Value::UInt16(2)
        );
        action.tick(1250);
        assert_eq!(
            dev.value(holding(0), DataType::UInt16).unwrap(),
            Value::UInt16(3)
        );
    }

    // Test the engine loop end to end

    #[tokio::test]
    async fn test_engine_ticks_actions() {
        let dev = Arc::new(Device::new("engine"));
        let action = SimAction::new(
            Arc::clone(&dev),
            holding(0),
            DataType::UInt16,
            0,
            ActionKind::Increment { step: 1.0, min: 0.0, max: 65535.0 },
        );

        let engine = SimEngine::spawn(vec![action], Arc::new(NullSink));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.is_running());
        engine.stop().await;

        let v = dev.value(holding(0), DataType::UInt16).unwrap().as_f64();
        assert!(v >= 1.0, "no tick ran, value {}", v);
    }
}
