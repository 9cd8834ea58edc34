//! Settings dictionaries: the JSON surface that describes a project.
//!
//! Every struct here deserializes leniently: missing fields fall back to
//! defaults and unknown keys are ignored, so a partial dictionary from a UI
//! or an older file still loads. Actions are carried as raw JSON values in
//! [`ProjectSettings`] and parsed one by one at run start, so one bad action
//! is dropped with a log line instead of failing the whole project.
//!
//! Addresses accept two spellings:
//!
//! | Form       | Example                                      | Meaning |
//! |------------|----------------------------------------------|---------|
//! | combined   | `"400001"`, `"30105"`                        | class digit (0/1/3/4) + 1-based address |
//! | structured | `{"class": "holding_registers", "offset": 0}`| explicit class and 0-based offset |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data::{ByteOrder, DataType, RegisterOrder};
use crate::device::{DeviceQuotas, MemAddress, MemClass};
use crate::error::{SimError, SimResult};
use crate::serial::SerialConfig;
use crate::sim::ActionKind;
use crate::DEFAULT_TCP_PORT;

/// A memory address in either combined or structured notation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressSpec {
    Combined(String),
    Parts { class: MemClass, offset: u16 },
}

impl AddressSpec {
    pub fn resolve(&self) -> SimResult<MemAddress> {
        match self {
            AddressSpec::Combined(text) => parse_combined(text),
            AddressSpec::Parts { class, offset } => Ok(MemAddress::new(*class, *offset)),
        }
    }
}

impl Default for AddressSpec {
    fn default() -> Self {
        AddressSpec::Parts {
            class: MemClass::HoldingRegisters,
            offset: 0,
        }
    }
}

impl From<MemAddress> for AddressSpec {
    fn from(addr: MemAddress) -> Self {
        AddressSpec::Parts {
            class: addr.class,
            offset: addr.offset,
        }
    }
}

/// Parse combined notation: class digit plus 1-based address
///
/// Accepts 5 digit (`40001`) and 6 digit (`400001`) forms. The class digit
/// is 0 for coils, 1 for discrete inputs, 3 for input registers and 4 for
/// holding registers.
fn parse_combined(text: &str) -> SimResult<MemAddress> {
    let digits = text.trim();
    if !(digits.len() == 5 || digits.len() == 6)
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(SimError::configuration(format!(
            "bad combined address '{}'",
            text
        )));
    }
    let class = match &digits[..1] {
        "0" => MemClass::Coils,
        "1" => MemClass::DiscreteInputs,
        "3" => MemClass::InputRegisters,
        "4" => MemClass::HoldingRegisters,
        other => {
            return Err(SimError::configuration(format!(
                "unknown memory class digit '{}' in '{}'",
                other, text
            )))
        }
    };
    let number: u32 = digits[1..].parse().map_err(|_| {
        SimError::configuration(format!("bad combined address '{}'", text))
    })?;
    if number == 0 || number > 65_536 {
        return Err(SimError::configuration(format!(
            "combined address '{}' out of range",
            text
        )));
    }
    Ok(MemAddress::new(class, (number - 1) as u16))
}

/// A typed value written to device memory at load time
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InitialValue {
    pub address: AddressSpec,
    pub data_type: DataType,
    pub value: f64,
}

/// One simulated device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub name: String,
    /// Block sizes: bits for the bit classes, registers for the others
    pub coils: usize,
    pub discrete_inputs: usize,
    pub input_registers: usize,
    pub holding_registers: usize,
    pub read_only: bool,
    pub delay_ms: u64,
    pub byte_order: ByteOrder,
    pub reg_order: RegisterOrder,
    pub quotas: DeviceQuotas,
    pub exception_status: Option<AddressSpec>,
    pub initial: Vec<InitialValue>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            coils: 65_536,
            discrete_inputs: 65_536,
            input_registers: 65_536,
            holding_registers: 65_536,
            read_only: false,
            delay_ms: 0,
            byte_order: ByteOrder::default(),
            reg_order: RegisterOrder::default(),
            quotas: DeviceQuotas::default(),
            exception_status: None,
            initial: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    #[default]
    Tcp,
    Rtu,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParitySetting {
    #[default]
    None,
    Even,
    Odd,
}

impl From<ParitySetting> for tokio_serial::Parity {
    fn from(p: ParitySetting) -> Self {
        match p {
            ParitySetting::None => tokio_serial::Parity::None,
            ParitySetting::Even => tokio_serial::Parity::Even,
            ParitySetting::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// One served port: a transport plus its unit map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub name: String,
    pub kind: PortKind,
    /// TCP only
    pub bind_address: String,
    /// Serial only
    pub serial_path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: ParitySetting,
    /// Honor unit 0 broadcast writes on this port
    pub broadcast: bool,
    /// Unit id (as decimal string, JSON keys are strings) to device name
    pub units: BTreeMap<String, String>,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: PortKind::Tcp,
            bind_address: format!("0.0.0.0:{}", DEFAULT_TCP_PORT),
            serial_path: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: ParitySetting::None,
            broadcast: false,
            units: BTreeMap::new(),
        }
    }
}

impl PortSettings {
    /// Map the serial fields onto a line configuration
    pub fn serial_config(&self) -> SimResult<SerialConfig> {
        if self.serial_path.is_empty() {
            return Err(SimError::configuration("serial port path is empty"));
        }
        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(SimError::configuration(format!(
                    "unsupported data bits: {}",
                    other
                )))
            }
        };
        let stop_bits = match self.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(SimError::configuration(format!(
                    "unsupported stop bits: {}",
                    other
                )))
            }
        };
        Ok(SerialConfig {
            path: self.serial_path.clone(),
            baud_rate: self.baud_rate,
            data_bits,
            stop_bits,
            parity: self.parity.into(),
        })
    }
}

fn default_data_type() -> DataType {
    DataType::UInt16
}

fn default_period() -> i64 {
    1000
}

fn default_step() -> f64 {
    1.0
}

fn default_max() -> f64 {
    65_535.0
}

fn default_sine_period() -> i64 {
    10_000
}

fn default_amplitude() -> f64 {
    1.0
}

fn default_count() -> u16 {
    1
}

/// What an action does, selected by the `action` key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ActionKindSettings {
    Increment {
        #[serde(default = "default_step")]
        step: f64,
        #[serde(default)]
        min: f64,
        #[serde(default = "default_max")]
        max: f64,
    },
    Sine {
        /// Renamed to avoid clashing with the action's own period
        #[serde(rename = "sine_period_ms", default = "default_sine_period")]
        period_ms: i64,
        #[serde(default)]
        phase_ms: i64,
        #[serde(default = "default_amplitude")]
        amplitude: f64,
        #[serde(default)]
        shift: f64,
    },
    Random {
        #[serde(default)]
        min: f64,
        #[serde(default = "default_max")]
        max: f64,
    },
    Copy {
        source: AddressSpec,
        #[serde(default = "default_count")]
        count: u16,
    },
}

impl ActionKindSettings {
    pub fn resolve(&self) -> SimResult<ActionKind> {
        Ok(match self {
            ActionKindSettings::Increment { step, min, max } => ActionKind::Increment {
                step: *step,
                min: *min,
                max: *max,
            },
            ActionKindSettings::Sine {
                period_ms,
                phase_ms,
                amplitude,
                shift,
            } => ActionKind::Sine {
                period_ms: *period_ms,
                phase_ms: *phase_ms,
                amplitude: *amplitude,
                shift: *shift,
            },
            ActionKindSettings::Random { min, max } => ActionKind::Random {
                min: *min,
                max: *max,
            },
            ActionKindSettings::Copy { source, count } => ActionKind::Copy {
                source: source.resolve()?,
                count: *count,
            },
        })
    }
}

/// One simulation action as a flat dictionary
///
/// `device`, `address` and the `action` selector are required; everything
/// else defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSettings {
    pub device: String,
    pub address: AddressSpec,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
    #[serde(default = "default_period")]
    pub period_ms: i64,
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    #[serde(default)]
    pub reg_order: Option<RegisterOrder>,
    #[serde(flatten)]
    pub kind: ActionKindSettings,
}

/// The whole project: devices, ports and actions
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProjectSettings {
    pub name: String,
    pub devices: Vec<DeviceSettings>,
    pub ports: Vec<PortSettings>,
    /// Kept raw so each action can be parsed and dropped individually
    pub actions: Vec<serde_json::Value>,
}

impl ProjectSettings {
    pub fn from_json(text: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: serde_json::Value) -> SimResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json_pretty(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
