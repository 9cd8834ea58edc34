//! Runtime orchestrator: builds and runs a whole project.
//!
//! A [`Runtime`] owns the device list (the owner of record; tables and
//! actions hold `Arc` clones), the spawned port tasks and the simulation
//! engine. Devices are built when the runtime is constructed, so callers
//! can inspect and seed memory before serving starts. Ports and actions
//! are wired at [`Runtime::start`] and torn down at [`Runtime::stop`].

use log::warn;
use std::sync::Arc;

use crate::data::Value;
use crate::device::Device;
use crate::dispatch::DeviceTable;
use crate::error::{SimError, SimResult};
use crate::logging::{SharedSink, TracingSink};
use crate::port::PortRuntime;
use crate::serial::{AsciiServerEngine, RtuServerEngine};
use crate::server::{EngineStats, ServerEngine, TcpServerEngine};
use crate::settings::{ActionSettings, DeviceSettings, PortKind, PortSettings, ProjectSettings};
use crate::sim::{SimAction, SimEngine};

pub struct Runtime {
    settings: ProjectSettings,
    sink: SharedSink,
    devices: Vec<Arc<Device>>,
    ports: Vec<PortRuntime>,
    sim: Option<SimEngine>,
}

impl Runtime {
    /// Build the runtime with the default tracing sink
    pub fn new(settings: ProjectSettings) -> SimResult<Self> {
        Self::with_sink(settings, Arc::new(TracingSink::default()))
    }

    /// Build the runtime with an injected event sink
    ///
    /// Devices are created here; a bad device or initial value fails the
    /// whole load.
    pub fn with_sink(settings: ProjectSettings, sink: SharedSink) -> SimResult<Self> {
        let mut devices: Vec<Arc<Device>> = Vec::new();
        for spec in &settings.devices {
            if spec.name.is_empty() {
                return Err(SimError::configuration("device name is empty"));
            }
            if devices.iter().any(|d| d.name() == spec.name) {
                return Err(SimError::configuration(format!(
                    "duplicate device name '{}'",
                    spec.name
                )));
            }
            devices.push(Arc::new(build_device(spec)?));
        }
        Ok(Self {
            settings,
            sink,
            devices,
            ports: Vec::new(),
            sim: None,
        })
    }

    pub fn settings(&self) -> &ProjectSettings {
        &self.settings
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Look up a device by name
    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// Spawn all port tasks and the simulation engine
    pub async fn start(&mut self) -> SimResult<()> {
        if !self.ports.is_empty() || self.sim.is_some() {
            return Err(SimError::internal("runtime already started"));
        }

        let port_specs = self.settings.ports.clone();
        for (index, spec) in port_specs.iter().enumerate() {
            let table = Arc::new(self.build_table(spec)?);
            let engine: Box<dyn ServerEngine> = match spec.kind {
                PortKind::Tcp => {
                    let bind = spec.bind_address.parse().map_err(|e| {
                        SimError::configuration(format!(
                            "bad bind address '{}': {}",
                            spec.bind_address, e
                        ))
                    })?;
                    Box::new(TcpServerEngine::new(bind, table, Arc::clone(&self.sink)))
                }
                PortKind::Rtu => Box::new(RtuServerEngine::new(
                    spec.serial_config()?,
                    table,
                    Arc::clone(&self.sink),
                )),
                PortKind::Ascii => Box::new(AsciiServerEngine::new(
                    spec.serial_config()?,
                    table,
                    Arc::clone(&self.sink),
                )),
            };
            let name = if spec.name.is_empty() {
                format!("port{}", index)
            } else {
                spec.name.clone()
            };
            self.ports
                .push(PortRuntime::spawn(&name, engine, Arc::clone(&self.sink)));
        }

        let mut actions = Vec::new();
        for raw in &self.settings.actions {
            let parsed: ActionSettings = match serde_json::from_value(raw.clone()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("dropping unparseable action: {}", e);
                    continue;
                }
            };
            match self.build_action(&parsed) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("dropping action for device '{}': {}", parsed.device, e),
            }
        }
        if !actions.is_empty() {
            self.sim = Some(SimEngine::spawn(actions, Arc::clone(&self.sink)));
        }

        self.sink.info(
            "runtime",
            &format!(
                "started: {} devices, {} ports",
                self.devices.len(),
                self.ports.len()
            ),
        );
        Ok(())
    }

    /// Stop everything; returns final per-port counters
    pub async fn stop(&mut self) -> Vec<(String, EngineStats)> {
        let mut stats = Vec::new();
        for port in std::mem::take(&mut self.ports) {
            let name = port.name().to_string();
            if let Some(s) = port.stop().await {
                stats.push((name, s));
            }
        }
        if let Some(sim) = self.sim.take() {
            sim.stop().await;
        }
        self.sink.info("runtime", "stopped");
        stats
    }

    /// Whether any port task or the simulation engine is still alive
    pub fn is_running(&self) -> bool {
        self.ports.iter().any(|p| p.is_running())
            || self.sim.as_ref().map(|s| s.is_running()).unwrap_or(false)
    }

    fn build_table(&self, spec: &PortSettings) -> SimResult<DeviceTable> {
        let mut table = DeviceTable::new().with_broadcast(spec.broadcast);
        for (key, device_name) in &spec.units {
            let unit: u8 = key.trim().parse().map_err(|_| {
                SimError::configuration(format!("bad unit id '{}'", key))
            })?;
            let device = self.device(device_name).ok_or_else(|| {
                SimError::configuration(format!(
                    "unit {} references unknown device '{}'",
                    unit, device_name
                ))
            })?;
            table.map(unit, Arc::clone(device));
        }
        Ok(table)
    }

    fn build_action(&self, spec: &ActionSettings) -> SimResult<SimAction> {
        let device = self.device(&spec.device).ok_or_else(|| {
            SimError::configuration(format!("unknown device '{}'", spec.device))
        })?;
        let address = spec.address.resolve()?;
        let kind = spec.kind.resolve()?;
        let byte_order = spec.byte_order.unwrap_or_else(|| device.byte_order());
        let reg_order = spec.reg_order.unwrap_or_else(|| device.reg_order());
        Ok(SimAction::new(
            Arc::clone(device),
            address,
            spec.data_type,
            spec.period_ms,
            kind,
        )
        .with_orders(byte_order, reg_order))
    }
}

/// Build one device from its settings
fn build_device(spec: &DeviceSettings) -> SimResult<Device> {
    let mut device = Device::new(&spec.name)
        .with_quotas(spec.quotas.clone())
        .with_delay_ms(spec.delay_ms)
        .with_orders(spec.byte_order, spec.reg_order)
        .with_read_only(spec.read_only);
    if let Some(status_addr) = &spec.exception_status {
        device = device.with_exception_status(status_addr.resolve()?);
    }
    device.coils().resize_bits(spec.coils);
    device.discrete_inputs().resize_bits(spec.discrete_inputs);
    device.input_registers().resize_regs(spec.input_registers);
    device.holding_registers().resize_regs(spec.holding_registers);

    for init in &spec.initial {
        let addr = init.address.resolve()?;
        device
            .set_value(addr, Value::from_f64(init.data_type, init.value))
            .map_err(|code| {
                SimError::configuration(format!(
                    "initial value at {}:{} rejected: {}",
                    addr.class.as_str(),
                    addr.offset,
                    code
                ))
            })?;
    }
    Ok(device)
}
