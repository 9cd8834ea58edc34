//! # Voltage Simulator - Modbus Server Device Simulator
//!
//! A Modbus server device simulator in pure Rust: it holds addressable
//! register and coil memory, answers Modbus requests over TCP, RTU and
//! ASCII transports, and can mutate its own memory over time to imitate
//! live process values.
//!
//! ## Features
//!
//! - **Complete server surface**: TCP (MBAP), RTU (CRC-16) and ASCII (LRC)
//!   engines behind one pluggable trait
//! - **Simulated devices**: four memory classes per device with quotas,
//!   read-only mode, artificial response delays and exception status
//! - **Unit routing**: 256-entry dispatch tables with broadcast support,
//!   shareable between ports
//! - **Value simulation**: increment ramps, sine waves, random noise and
//!   intra-memory copies on a periodic engine
//! - **Typed access**: 11 data types with configurable byte and register
//!   order for multi-register values
//! - **JSON projects**: lenient settings dictionaries describing devices,
//!   ports and actions
//!
//! ## Answered Function Codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x07 | Read Exception Status |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//! | 0x11 | Report Server ID |
//! | 0x16 | Mask Write Register |
//! | 0x17 | Read/Write Multiple Registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voltage_simulator::{ProjectSettings, Runtime, SimResult};
//!
//! #[tokio::main]
//! async fn main() -> SimResult<()> {
//!     let settings = ProjectSettings::from_json(r#"{
//!         "name": "demo",
//!         "devices": [{"name": "meter"}],
//!         "ports": [{"kind": "tcp", "bind_address": "0.0.0.0:1502",
//!                    "units": {"1": "meter"}}]
//!     }"#)?;
//!
//!     let mut runtime = Runtime::new(settings)?;
//!     runtime.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     runtime.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Poking device memory directly
//!
//! ```rust
//! use voltage_simulator::{DataType, Device, MemAddress, MemClass, Value};
//!
//! let device = Device::new("meter");
//! device.write_single_register(0, 0x1234)?;
//! let value = device.value(
//!     MemAddress::new(MemClass::HoldingRegisters, 0),
//!     DataType::UInt16,
//! )?;
//! assert_eq!(value, Value::UInt16(0x1234));
//! # Ok::<(), voltage_simulator::ExceptionCode>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  ┌────────────┐  ┌──────────────┐
//! │ TCP engine │  │ RTU engine │  │ ASCII engine │
//! └────────────┘  └────────────┘  └──────────────┘
//!        │              │                │
//!        └──────────────┼────────────────┘
//!                       │ requests
//! ┌──────────────┐      │       ┌──────────────┐
//! │  PortRuntime │──────┤       │  SimEngine   │
//! └──────────────┘      │       └──────────────┘
//!                       │               │ typed values
//!               ┌───────────────┐       │
//!               │  DeviceTable  │       │
//!               └───────────────┘       │
//!                       │               │
//!               ┌───────────────────────────────┐
//!               │  Device (4 × RegisterBlock)   │
//!               └───────────────────────────────┘
//! ```

/// Core error types and Modbus exception codes
pub mod error;

/// Typed values, byte order and register order handling
pub mod data;

/// Thread-safe bit/register memory blocks
pub mod memory;

/// Server-side PDU parsing and encoding
pub mod protocol;

/// Simulated devices: memory classes plus access policy
pub mod device;

/// Unit id routing tables
pub mod dispatch;

/// Event sinks for frame, connection and error reporting
pub mod logging;

/// TCP server engine and the engine trait
pub mod server;

/// RTU and ASCII serial server engines
pub mod serial;

/// Port task lifecycle
pub mod port;

/// Periodic simulation actions
pub mod sim;

/// JSON settings dictionaries
pub mod settings;

/// Project orchestration
pub mod runtime;

// Re-export main types for convenience
pub use data::{ByteOrder, DataType, RegisterOrder, Value};
pub use device::{Device, DeviceQuotas, MemAddress, MemClass, MAX_SERVER_ID_LEN};
pub use dispatch::{DeviceTable, UnitReply, BROADCAST_UNIT};
pub use error::{ExceptionCode, SimError, SimResult};
pub use logging::{
    CallbackSink, Direction, EventCallback, EventSink, LogLevel, NullSink, SharedSink,
    TracingSink,
};
pub use memory::RegisterBlock;
pub use port::PortRuntime;
pub use protocol::{Request, Response, ServerFunction, UnitId};
pub use runtime::Runtime;
pub use serial::{AsciiServerEngine, RtuServerEngine, SerialConfig, MAX_RTU_ADU};
pub use server::{EngineStats, ServerEngine, TcpServerEngine, MAX_ADU_SIZE, MBAP_HEADER_LEN};
pub use settings::{
    ActionKindSettings, ActionSettings, AddressSpec, DeviceSettings, InitialValue,
    ParitySetting, PortKind, PortSettings, ProjectSettings,
};
pub use sim::{ActionKind, SimAction, SimEngine};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Simulator v{} - Modbus TCP/RTU/ASCII server device simulator",
        VERSION
    )
}
