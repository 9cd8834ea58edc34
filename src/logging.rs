//! Event reporting for ports and the simulation engine.
//!
//! The simulator never logs through process-wide statics on its hot paths.
//! Every port runtime and engine is handed an [`EventSink`]; the embedding
//! application decides where events go. Two implementations ship here:
//!
//! - [`TracingSink`]: frames to `tracing`, everything else to `log`. The
//!   default for binaries.
//! - [`CallbackSink`]: forwards formatted lines to a caller-supplied
//!   closure, for UIs that render a traffic monitor.
//!
//! [`NullSink`] discards everything and is what tests use.

use std::sync::Arc;

/// Log levels for the callback event system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Frame direction relative to the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frame transmitted by the simulator
    Tx,
    /// Frame received from a client
    Rx,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        }
    }
}

/// Shared handle to an event sink
pub type SharedSink = Arc<dyn EventSink>;

/// Receiver for simulator events
///
/// `source` is the configured port name (or `"sim"` for the simulation
/// engine). Implementations must be cheap: ports call `frame` for every
/// request/response pair.
pub trait EventSink: Send + Sync {
    /// A raw frame crossed the wire
    fn frame(&self, source: &str, direction: Direction, data: &[u8]);

    /// A connection-level event (client connected/disconnected, port opened)
    fn connection(&self, source: &str, message: &str);

    /// An error with a numeric status (0 when none applies)
    fn error(&self, source: &str, status: i32, message: &str);

    /// General informational event
    fn info(&self, source: &str, message: &str);
}

/// Format a byte slice the way traffic monitors expect it
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sink that forwards to the `tracing`/`log` ecosystem
///
/// Frame hex lines go to `tracing` at info level so traffic can be filtered
/// by target; connection and error events use the `log` macros.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn frame(&self, source: &str, direction: Direction, data: &[u8]) {
        tracing::info!(
            "[{}] {} packet ({} bytes): {}",
            source,
            direction.as_str(),
            data.len(),
            hex_dump(data)
        );
    }

    fn connection(&self, source: &str, message: &str) {
        log::info!("[{}] {}", source, message);
    }

    fn error(&self, source: &str, status: i32, message: &str) {
        if status != 0 {
            log::error!("[{}] {} (status={})", source, message, status);
        } else {
            log::error!("[{}] {}", source, message);
        }
    }

    fn info(&self, source: &str, message: &str) {
        log::info!("[{}] {}", source, message);
    }
}

/// Type alias for event callback functions
///
/// The callback receives a log level, the source (port) name and the
/// formatted message.
pub type EventCallback = Box<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

/// Sink that forwards events to a caller-supplied closure
#[derive(Clone)]
pub struct CallbackSink {
    callback: Option<Arc<EventCallback>>,
    min_level: LogLevel,
}

impl CallbackSink {
    /// Create a new callback sink
    pub fn new(callback: Option<EventCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// Create a sink with default console output
    pub fn console() -> Self {
        let callback: EventCallback = Box::new(|level, source, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error => eprintln!("[{}] ERROR [{}]: {}", timestamp, source, message),
                LogLevel::Warn => eprintln!("[{}] WARN [{}]: {}", timestamp, source, message),
                LogLevel::Info => println!("[{}] INFO [{}]: {}", timestamp, source, message),
                LogLevel::Debug => println!("[{}] DEBUG [{}]: {}", timestamp, source, message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    fn emit(&self, level: LogLevel, source: &str, message: &str) {
        if let Some(ref callback) = self.callback {
            if level as u8 <= self.min_level as u8 {
                callback(level, source, message);
            }
        }
    }
}

impl EventSink for CallbackSink {
    fn frame(&self, source: &str, direction: Direction, data: &[u8]) {
        let message = format!(
            "{} packet ({} bytes): {}",
            direction.as_str(),
            data.len(),
            hex_dump(data)
        );
        self.emit(LogLevel::Debug, source, &message);
    }

    fn connection(&self, source: &str, message: &str) {
        self.emit(LogLevel::Info, source, message);
    }

    fn error(&self, source: &str, status: i32, message: &str) {
        if status != 0 {
            self.emit(LogLevel::Error, source, &format!("{} (status={})", message, status));
        } else {
            self.emit(LogLevel::Error, source, message);
        }
    }

    fn info(&self, source: &str, message: &str) {
        self.emit(LogLevel::Info, source, message);
    }
}

/// Sink that discards every event
#[derive(Debug, Default, Clone)]
pub struct NullSink;

impl EventSink for NullSink {
    fn frame(&self, _source: &str, _direction: Direction, _data: &[u8]) {}
    fn connection(&self, _source: &str, _message: &str) {}
    fn error(&self, _source: &str, _status: i32, _message: &str) {}
    fn info(&self, _source: &str, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0xAB, 0x00]), "01 AB 00");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_callback_sink_formats_frames() {
        let lines: Arc<Mutex<Vec<(LogLevel, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let callback: EventCallback = Box::new(move |level, source, message| {
            captured
                .lock()
                .unwrap()
                .push((level, source.to_string(), message.to_string()));
        });
        let sink = CallbackSink::new(Some(callback), LogLevel::Debug);

        sink.frame("tcp-502", Direction::Tx, &[0x01, 0x03, 0x02]);
        sink.connection("tcp-502", "client connected");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, "tcp-502");
        assert!(lines[0].2.contains("TX packet (3 bytes): 01 03 02"));
        assert_eq!(lines[1].2, "client connected");
    }

    #[test]
    fn test_callback_sink_respects_min_level() {
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        let callback: EventCallback = Box::new(move |_, _, message| {
            captured.lock().unwrap().push(message.to_string());
        });
        // Info-level sink drops the Debug-level frame dumps
        let sink = CallbackSink::new(Some(callback), LogLevel::Info);

        sink.frame("rtu-1", Direction::Rx, &[0xFF]);
        sink.error("rtu-1", 104, "connection reset");

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("connection reset"));
        assert!(lines[0].contains("status=104"));
    }
}
