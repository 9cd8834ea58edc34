/// Serial server engines
///
/// RTU and ASCII share the serial transport but differ in framing:
///
/// | Mode  | Delimiter            | Integrity | Encoding    |
/// |-------|----------------------|-----------|-------------|
/// | RTU   | 3.5 char idle gap    | CRC-16    | raw binary  |
/// | ASCII | `:` start, CRLF end  | LRC       | hex pairs   |
///
/// Both engines run the same poll-driven pass shape as the TCP engine: one
/// frame in, one response out, with delayed devices parking the request
/// until a later pass.

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use log::debug;

use crate::dispatch::{DeviceTable, UnitReply};
use crate::error::{SimError, SimResult};
use crate::logging::{Direction, SharedSink};
use crate::protocol::{Request, Response, UnitId};
use crate::server::{EngineStats, ServerEngine, POLL_INTERVAL};

/// Largest RTU ADU: unit id, 253 byte PDU, CRC
pub const MAX_RTU_ADU: usize = 256;

/// Largest ASCII frame: colon, 2 hex chars per byte, CR LF
pub const MAX_ASCII_FRAME: usize = 513;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// CRC-16/MODBUS checksum; transmitted low byte first
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// LRC checksum: two's complement of the byte sum
pub fn lrc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)).wrapping_neg()
}

/// Inter-frame silence that delimits RTU frames
///
/// 3.5 character times at 11 bits per character, with the conventional
/// 1750 microsecond floor above 19200 baud.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate > 19_200 {
        return Duration::from_micros(1750);
    }
    let char_time_us = 11_000_000 / baud_rate as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

/// Serial line parameters
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl SerialConfig {
    /// 8N1 at the given baud rate
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }

    fn open(&self) -> SimResult<SerialStream> {
        tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .open_native_async()
            .map_err(|e| SimError::connection(format!("failed to open {}: {}", self.path, e)))
    }
}

/// Dispatch state shared by the RTU and ASCII engines
///
/// Owns the single parked-request slot: serial lines are half duplex, so at
/// most one request waits behind a device delay. A new frame arriving while
/// one is parked means the master timed out and retried; the retry replaces
/// the parked request.
struct SerialCore {
    table: Arc<DeviceTable>,
    stats: EngineStats,
    parked: Option<(UnitId, Request)>,
}

impl SerialCore {
    fn new(table: Arc<DeviceTable>) -> Self {
        Self {
            table,
            stats: EngineStats::default(),
            parked: None,
        }
    }

    /// Dispatch one decoded ADU; returns the response PDU if one goes back
    fn dispatch(&mut self, unit: UnitId, pdu: &[u8], now_ms: i64) -> Option<Vec<u8>> {
        self.stats.requests_total += 1;
        let broadcast = unit == crate::dispatch::BROADCAST_UNIT && self.table.broadcast_enabled();

        let request = match Request::parse(pdu) {
            Ok(request) => request,
            Err(reply) => {
                if broadcast {
                    return None;
                }
                self.stats.exceptions_total += 1;
                return Some(Response::Exception(reply).encode());
            }
        };

        match self.table.execute(unit, &request, now_ms) {
            UnitReply::Broadcast => {
                self.stats.broadcasts_total += 1;
                None
            }
            UnitReply::Pending => {
                if self.parked.is_some() {
                    debug!("replacing parked request for unit {}", unit);
                }
                self.parked = Some((unit, request));
                None
            }
            UnitReply::Ready(Ok(resp)) => Some(resp.encode()),
            UnitReply::Ready(Err(code)) => {
                self.stats.exceptions_total += 1;
                Some(Response::exception(request.function().to_u8(), code).encode())
            }
        }
    }

    /// Retry the parked request; returns `(unit, response pdu)` once ready
    fn retry_parked(&mut self, now_ms: i64) -> Option<(UnitId, Vec<u8>)> {
        let (unit, request) = self.parked.take()?;
        match self.table.execute(unit, &request, now_ms) {
            UnitReply::Pending => {
                self.parked = Some((unit, request));
                None
            }
            UnitReply::Broadcast => None,
            UnitReply::Ready(Ok(resp)) => Some((unit, resp.encode())),
            UnitReply::Ready(Err(code)) => {
                self.stats.exceptions_total += 1;
                Some((
                    unit,
                    Response::exception(request.function().to_u8(), code).encode(),
                ))
            }
        }
    }

    fn snapshot(&self, started_at: Option<Instant>) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.parked_requests = self.parked.is_some() as u64;
        stats.active_connections = started_at.is_some() as u64;
        if let Some(started) = started_at {
            stats.uptime_seconds = started.elapsed().as_secs();
        }
        stats
    }
}

/// Modbus RTU server engine
pub struct RtuServerEngine {
    config: SerialConfig,
    gap: Duration,
    core: SerialCore,
    sink: SharedSink,
    stream: Option<SerialStream>,
    buf: Vec<u8>,
    started_at: Option<Instant>,
    closed: bool,
}

impl RtuServerEngine {
    pub fn new(config: SerialConfig, table: Arc<DeviceTable>, sink: SharedSink) -> Self {
        let gap = frame_gap(config.baud_rate);
        Self {
            config,
            gap,
            core: SerialCore::new(table),
            sink,
            stream: None,
            buf: Vec::new(),
            started_at: None,
            closed: false,
        }
    }

    async fn transmit(&mut self, unit: UnitId, pdu: &[u8]) -> SimResult<()> {
        let mut adu = Vec::with_capacity(pdu.len() + 3);
        adu.push(unit);
        adu.extend_from_slice(pdu);
        adu.extend_from_slice(&crc16(&adu).to_le_bytes());

        self.sink.frame(&self.describe(), Direction::Tx, &adu);
        if let Some(stream) = self.stream.as_mut() {
            stream.write_all(&adu).await?;
            self.core.stats.responses_total += 1;
            self.core.stats.bytes_sent += adu.len() as u64;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> SimResult<()> {
        if frame.len() < 4 {
            self.core.stats.frame_errors += 1;
            self.sink
                .error(&self.describe(), 0, &format!("runt frame ({} bytes)", frame.len()));
            return Ok(());
        }
        let body = &frame[..frame.len() - 2];
        let expected = crc16(body);
        let actual = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        if expected != actual {
            self.core.stats.frame_errors += 1;
            let err = SimError::crc_mismatch(expected, actual);
            self.sink.error(&self.describe(), 0, &err.to_string());
            return Ok(());
        }

        self.sink.frame(&self.describe(), Direction::Rx, frame);
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(pdu) = self.core.dispatch(body[0], &body[1..], now) {
            self.transmit(body[0], &pdu).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServerEngine for RtuServerEngine {
    fn describe(&self) -> String {
        format!("rtu://{}", self.config.path)
    }

    async fn process(&mut self) -> SimResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.stream.is_none() {
            self.stream = Some(self.config.open()?);
            self.started_at = Some(Instant::now());
            self.sink.info(
                &self.describe(),
                &format!("serving at {} baud", self.config.baud_rate),
            );
        }

        let now = chrono::Utc::now().timestamp_millis();
        if let Some((unit, pdu)) = self.core.retry_parked(now) {
            self.transmit(unit, &pdu).await?;
        }

        // A frame ends when the line stays silent for the inter-frame gap
        let mut chunk = [0u8; MAX_RTU_ADU];
        loop {
            let wait = if self.buf.is_empty() { POLL_INTERVAL } else { self.gap };
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return Ok(()),
            };
            match timeout(wait, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(SimError::connection("serial port closed")),
                Ok(Ok(n)) => {
                    self.core.stats.bytes_received += n as u64;
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() > MAX_RTU_ADU {
                        self.core.stats.frame_errors += 1;
                        self.sink.error(&self.describe(), 0, "frame overrun, discarding");
                        self.buf.clear();
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if self.buf.is_empty() {
                        return Ok(()); // idle pass
                    }
                    break;
                }
            }
        }

        let frame = std::mem::take(&mut self.buf);
        self.handle_frame(&frame).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stream = None;
        self.closed = true;
        self.sink.connection(&self.describe(), "serial port closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn stats(&self) -> EngineStats {
        self.core.snapshot(self.started_at)
    }
}

/// Extract the next complete ASCII frame, decoded to raw bytes
///
/// Noise before the `:` start marker is discarded. `Ok(None)` means the
/// frame is still incomplete.
fn ascii_extract(buf: &mut Vec<u8>) -> SimResult<Option<Vec<u8>>> {
    let start = match buf.iter().position(|&b| b == b':') {
        Some(pos) => {
            buf.drain(..pos);
            0
        }
        None => {
            buf.clear();
            return Ok(None);
        }
    };
    let lf = match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None => {
            if buf.len() > MAX_ASCII_FRAME {
                buf.clear();
                return Err(SimError::frame("ASCII frame overrun"));
            }
            return Ok(None);
        }
    };
    if lf < 2 || buf[lf - 1] != b'\r' {
        buf.drain(..=lf);
        return Err(SimError::frame("ASCII frame missing CR before LF"));
    }
    let hex_chars = buf[start + 1..lf - 1].to_vec();
    buf.drain(..=lf);
    let decoded = hex::decode(&hex_chars)
        .map_err(|e| SimError::frame(format!("bad ASCII hex: {}", e)))?;
    Ok(Some(decoded))
}

/// Encode unit id and PDU as an ASCII frame with trailing LRC
fn ascii_encode(unit: UnitId, pdu: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(pdu.len() + 2);
    raw.push(unit);
    raw.extend_from_slice(pdu);
    raw.push(lrc(&raw));

    let mut out = Vec::with_capacity(raw.len() * 2 + 3);
    out.push(b':');
    out.extend_from_slice(hex::encode_upper(&raw).as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

/// Modbus ASCII server engine
pub struct AsciiServerEngine {
    config: SerialConfig,
    core: SerialCore,
    sink: SharedSink,
    stream: Option<SerialStream>,
    buf: Vec<u8>,
    started_at: Option<Instant>,
    closed: bool,
}

impl AsciiServerEngine {
    pub fn new(config: SerialConfig, table: Arc<DeviceTable>, sink: SharedSink) -> Self {
        Self {
            config,
            core: SerialCore::new(table),
            sink,
            stream: None,
            buf: Vec::new(),
            started_at: None,
            closed: false,
        }
    }

    async fn transmit(&mut self, unit: UnitId, pdu: &[u8]) -> SimResult<()> {
        let frame = ascii_encode(unit, pdu);
        self.sink.frame(&self.describe(), Direction::Tx, &frame);
        if let Some(stream) = self.stream.as_mut() {
            stream.write_all(&frame).await?;
            self.core.stats.responses_total += 1;
            self.core.stats.bytes_sent += frame.len() as u64;
        }
        Ok(())
    }

    async fn handle_decoded(&mut self, decoded: &[u8]) -> SimResult<()> {
        if decoded.len() < 3 {
            self.core.stats.frame_errors += 1;
            self.sink.error(&self.describe(), 0, "runt ASCII frame");
            return Ok(());
        }
        let body = &decoded[..decoded.len() - 1];
        let expected = lrc(body);
        let actual = decoded[decoded.len() - 1];
        if expected != actual {
            self.core.stats.frame_errors += 1;
            let err = SimError::lrc_mismatch(expected, actual);
            self.sink.error(&self.describe(), 0, &err.to_string());
            return Ok(());
        }

        self.sink.frame(&self.describe(), Direction::Rx, decoded);
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(pdu) = self.core.dispatch(body[0], &body[1..], now) {
            self.transmit(body[0], &pdu).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ServerEngine for AsciiServerEngine {
    fn describe(&self) -> String {
        format!("ascii://{}", self.config.path)
    }

    async fn process(&mut self) -> SimResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.stream.is_none() {
            self.stream = Some(self.config.open()?);
            self.started_at = Some(Instant::now());
            self.sink.info(
                &self.describe(),
                &format!("serving at {} baud", self.config.baud_rate),
            );
        }

        let now = chrono::Utc::now().timestamp_millis();
        if let Some((unit, pdu)) = self.core.retry_parked(now) {
            self.transmit(unit, &pdu).await?;
        }

        let mut chunk = [0u8; 256];
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };
        match timeout(POLL_INTERVAL, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(SimError::connection("serial port closed")),
            Ok(Ok(n)) => {
                self.core.stats.bytes_received += n as u64;
                self.buf.extend_from_slice(&chunk[..n]);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(()), // idle pass
        }

        loop {
            match ascii_extract(&mut self.buf) {
                Ok(Some(decoded)) => self.handle_decoded(&decoded).await?,
                Ok(None) => break,
                Err(e) => {
                    self.core.stats.frame_errors += 1;
                    self.sink.error(&self.describe(), 0, &e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stream = None;
        self.closed = true;
        self.sink.connection(&self.describe(), "serial port closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn stats(&self) -> EngineStats {
        self.core.snapshot(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    // Test checksums against published reference frames

    #[test]
    fn test_crc16_reference_vector() {
        // Request: read 2 holding registers at 0 from unit 1.
        // The wire carries the CRC low byte first: C4 0B.
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        let crc = crc16(&frame);
        assert_eq!(crc, 0x0BC4);
        assert_eq!(crc.to_le_bytes(), [0xC4, 0x0B]);
    }

    #[test]
    fn test_crc16_detects_corruption() {
        let mut frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        let good = crc16(&frame);
        frame[1] = 0x04;
        assert_ne!(crc16(&frame), good);
    }

    #[test]
    fn test_lrc_reference_vector() {
        // Same request in ASCII mode: ":010300000002FA\r\n"
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(lrc(&body), 0xFA);
        // Appending the LRC makes the byte sum zero
        let mut with_lrc = body.to_vec();
        with_lrc.push(0xFA);
        let sum = with_lrc.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_frame_gap() {
        assert_eq!(frame_gap(9600), Duration::from_micros(4007));
        assert_eq!(frame_gap(19_200), Duration::from_micros(2002));
        assert_eq!(frame_gap(115_200), Duration::from_micros(1750));
    }

    // Test ASCII framing

    #[test]
    fn test_ascii_encode_reference_frame() {
        let frame = ascii_encode(0x01, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(frame, b":010300000002FA\r\n".to_vec());
    }

    #[test]
    fn test_ascii_extract_skips_noise() {
        let mut buf = b"garbage:010300000002FA\r\n".to_vec();
        let decoded = ascii_extract(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xFA]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ascii_extract_incomplete() {
        let mut buf = b":0103000000".to_vec();
        assert_eq!(ascii_extract(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 11);

        buf.extend_from_slice(b"02FA\r\n");
        let decoded = ascii_extract(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), 7);
    }

    #[test]
    fn test_ascii_extract_rejects_bad_frames() {
        // LF without CR
        let mut buf = b":0103\n".to_vec();
        assert!(ascii_extract(&mut buf).is_err());
        assert!(buf.is_empty());

        // Odd hex digit count
        let mut buf = b":010\r\n".to_vec();
        assert!(ascii_extract(&mut buf).is_err());
    }

    // Test the shared dispatch core without a physical port

    #[test]
    fn test_core_dispatches_and_encodes() {
        let mut table = DeviceTable::new();
        let dev = Arc::new(Device::new("core"));
        dev.write_single_register(2, 0x0102).unwrap();
        table.map(1, dev);
        let mut core = SerialCore::new(Arc::new(table));

        // Read holding register 2
        let pdu = core.dispatch(1, &[0x03, 0x00, 0x02, 0x00, 0x01], 0).unwrap();
        assert_eq!(pdu, vec![0x03, 0x02, 0x01, 0x02]);
        assert_eq!(core.stats.requests_total, 1);
    }

    #[test]
    fn test_core_suppresses_broadcast_response() {
        let mut table = DeviceTable::new();
        let dev = Arc::new(Device::new("core"));
        table.map(1, Arc::clone(&dev));
        let mut core = SerialCore::new(Arc::new(table.with_broadcast(true)));

        // Broadcast write single register 0 = 7
        let reply = core.dispatch(0, &[0x06, 0x00, 0x00, 0x00, 0x07], 0);
        assert_eq!(reply, None);
        assert_eq!(core.stats.broadcasts_total, 1);
        assert_eq!(dev.read_holding_registers(0, 1), Ok(vec![7]));
    }

    #[test]
    fn test_core_parks_and_retries_delayed_request() {
        let mut table = DeviceTable::new();
        table.map(1, Arc::new(Device::new("slow").with_delay_ms(50)));
        let mut core = SerialCore::new(Arc::new(table));

        assert_eq!(core.dispatch(1, &[0x03, 0x00, 0x00, 0x00, 0x01], 1000), None);
        assert!(core.parked.is_some());
        assert_eq!(core.retry_parked(1040), None);
        let (unit, pdu) = core.retry_parked(1051).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(pdu, vec![0x03, 0x02, 0x00, 0x00]);
        assert!(core.parked.is_none());
    }

    #[test]
    fn test_core_wraps_exception() {
        let table = DeviceTable::new();
        let mut core = SerialCore::new(Arc::new(table));
        // No unit mapped anywhere
        let pdu = core.dispatch(5, &[0x03, 0x00, 0x00, 0x00, 0x01], 0).unwrap();
        assert_eq!(pdu, vec![0x83, 0x0A]);
        assert_eq!(core.stats.exceptions_total, 1);
    }
}
