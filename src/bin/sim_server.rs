/// Voltage Simulator Server
///
/// Runs a simulated Modbus installation described by a JSON project file,
/// or a built-in demo project when no path is given.

use log::{error, info};
use tokio::signal;

use voltage_simulator::{ProjectSettings, Runtime};

const DEMO_PROJECT: &str = r#"{
    "name": "demo",
    "devices": [
        {
            "name": "meter",
            "initial": [
                {"address": "400001", "data_type": "uint16", "value": 4096},
                {"address": "400002", "data_type": "uint16", "value": 4097},
                {"address": "300001", "data_type": "float32", "value": 230.0},
                {"address": "000001", "data_type": "bool", "value": 1}
            ]
        }
    ],
    "ports": [
        {
            "name": "tcp-main",
            "kind": "tcp",
            "bind_address": "127.0.0.1:5020",
            "units": {"1": "meter"}
        }
    ],
    "actions": [
        {
            "device": "meter", "address": "300003", "action": "sine",
            "data_type": "float32", "period_ms": 500,
            "sine_period_ms": 10000, "amplitude": 10.0, "shift": 230.0
        },
        {
            "device": "meter", "address": "400010", "action": "increment",
            "data_type": "uint16", "period_ms": 1000, "step": 1, "max": 1000
        }
    ]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("🚀 Voltage Simulator Server");
    println!("===========================");
    println!("{}", voltage_simulator::info());
    println!();

    let json = match std::env::args().nth(1) {
        Some(path) => {
            info!("📄 Loading project from {}", path);
            std::fs::read_to_string(&path)?
        }
        None => {
            info!("📄 No project file given, running the built-in demo project");
            DEMO_PROJECT.to_string()
        }
    };

    let settings = ProjectSettings::from_json(&json)?;
    info!(
        "🔧 Project '{}': {} devices, {} ports, {} actions",
        settings.name,
        settings.devices.len(),
        settings.ports.len(),
        settings.actions.len()
    );

    let mut runtime = Runtime::new(settings)?;
    runtime.start().await?;

    info!("✅ Simulator running");
    for device in runtime.devices() {
        info!("   device '{}'", device.name());
    }
    println!();
    println!("💡 Testing suggestions:");
    println!("   - Point any Modbus TCP client at the configured bind address");
    println!("   - Read holding registers 0-9 and watch the simulated values move");
    println!("   - Press Ctrl+C to stop the simulator");
    println!();

    match signal::ctrl_c().await {
        Ok(()) => info!("🛑 Received interrupt signal, stopping..."),
        Err(err) => error!("❌ Failed to listen for interrupt signal: {}", err),
    }

    let stats = runtime.stop().await;
    for (port, s) in &stats {
        info!("📊 Port '{}' statistics:", port);
        info!("   Connections: {}", s.connections_total);
        info!("   Requests: {}", s.requests_total);
        info!("   Responses: {}", s.responses_total);
        info!("   Exceptions: {}", s.exceptions_total);
        info!("   Broadcasts: {}", s.broadcasts_total);
        info!("   Frame errors: {}", s.frame_errors);
        info!("   Bytes received: {} bytes", s.bytes_received);
        info!("   Bytes sent: {} bytes", s.bytes_sent);
        info!("   Uptime: {} seconds", s.uptime_seconds);
    }

    println!();
    println!("✅ Simulator stopped safely");

    Ok(())
}
