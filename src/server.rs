/// TCP server engine
///
/// Serves Modbus TCP (MBAP framing) on one listening socket. The engine is
/// poll driven: [`ServerEngine::process`] runs one bounded service pass and
/// returns, so the owning port task can interleave passes with cancellation.
/// All connections are serviced on that single task; requests parked behind
/// a device response delay are retried on later passes without blocking the
/// rest of the traffic.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use log::debug;

use crate::dispatch::{DeviceTable, UnitReply};
use crate::error::{SimError, SimResult};
use crate::logging::{Direction, SharedSink};
use crate::protocol::{Request, Response, UnitId};

/// MBAP header length: transaction id, protocol id, length, unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal TCP ADU (header plus 253 byte PDU)
pub const MAX_ADU_SIZE: usize = 260;

/// How long one pass waits for a new connection or serial byte
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Protocol engine behind a port
///
/// Implementations own their transport. `process` runs one bounded pass
/// (accept, read, dispatch, respond) and must stay responsive: the caller
/// loops over it under a cancellation token and expects each pass to finish
/// within roughly [`POLL_INTERVAL`].
#[async_trait]
pub trait ServerEngine: Send {
    /// Endpoint description for log lines, e.g. `tcp://0.0.0.0:502`
    fn describe(&self) -> String;

    /// Run one bounded service pass
    async fn process(&mut self) -> SimResult<()>;

    /// Release the transport; later passes become no-ops
    async fn close(&mut self);

    /// Whether the transport has been released
    fn is_closed(&self) -> bool;

    /// Snapshot of traffic counters
    fn stats(&self) -> EngineStats;
}

/// Traffic counters reported by an engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub connections_total: u64,
    pub active_connections: u64,
    pub requests_total: u64,
    pub responses_total: u64,
    pub exceptions_total: u64,
    pub broadcasts_total: u64,
    pub parked_requests: u64,
    pub frame_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

/// One complete MBAP frame peeled off a connection buffer
#[derive(Debug, PartialEq)]
struct AduFrame {
    transaction_id: u16,
    unit: UnitId,
    pdu: Vec<u8>,
}

/// Peel the next complete frame off the front of `buf`
///
/// Returns `Ok(None)` while the frame is still incomplete. A malformed
/// header (nonzero protocol id, impossible length) is unrecoverable for a
/// byte stream and reported as an error.
fn peel_frame(buf: &mut Vec<u8>) -> SimResult<Option<AduFrame>> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != 0 {
        return Err(SimError::frame(format!(
            "unexpected MBAP protocol id {}",
            protocol_id
        )));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if length < 2 || length + 6 > MAX_ADU_SIZE {
        return Err(SimError::frame(format!("impossible MBAP length {}", length)));
    }
    let total = 6 + length;
    if buf.len() < total {
        return Ok(None);
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let unit = buf[6];
    let pdu = buf[MBAP_HEADER_LEN..total].to_vec();
    buf.drain(..total);
    Ok(Some(AduFrame { transaction_id, unit, pdu }))
}

/// Wrap a response PDU in an MBAP header
fn mbap_wrap(transaction_id: u16, unit: UnitId, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    adu.extend_from_slice(&transaction_id.to_be_bytes());
    adu.extend_from_slice(&0u16.to_be_bytes());
    adu.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    adu.push(unit);
    adu.extend_from_slice(pdu);
    adu
}

struct ParkedRequest {
    transaction_id: u16,
    unit: UnitId,
    request: Request,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
    parked: Option<ParkedRequest>,
    dead: bool,
}

/// Modbus TCP server engine
pub struct TcpServerEngine {
    bind_address: SocketAddr,
    table: Arc<DeviceTable>,
    sink: SharedSink,
    listener: Option<TcpListener>,
    connections: Vec<Connection>,
    stats: EngineStats,
    started_at: Option<Instant>,
    closed: bool,
}

impl TcpServerEngine {
    pub fn new(bind_address: SocketAddr, table: Arc<DeviceTable>, sink: SharedSink) -> Self {
        Self {
            bind_address,
            table,
            sink,
            listener: None,
            connections: Vec::new(),
            stats: EngineStats::default(),
            started_at: None,
            closed: false,
        }
    }

    /// The bound address, once the first pass has bound the listener
    ///
    /// Useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn bind(&mut self) -> SimResult<()> {
        let listener = TcpListener::bind(self.bind_address).await.map_err(|e| {
            SimError::connection(format!("failed to bind {}: {}", self.bind_address, e))
        })?;
        self.sink
            .info(&self.describe(), &format!("listening on {}", self.bind_address));
        self.listener = Some(listener);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    async fn accept_pass(&mut self) {
        let listener = match &self.listener {
            Some(l) => l,
            None => return,
        };
        match timeout(POLL_INTERVAL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                self.sink
                    .connection(&self.describe(), &format!("client connected: {}", peer));
                self.stats.connections_total += 1;
                self.connections.push(Connection {
                    stream,
                    peer,
                    buf: Vec::new(),
                    parked: None,
                    dead: false,
                });
            }
            Ok(Err(e)) => {
                self.sink
                    .error(&self.describe(), 0, &format!("accept failed: {}", e));
            }
            Err(_) => {} // poll timeout, nothing waiting
        }
    }

    /// Retry requests parked behind a device delay
    async fn parked_pass(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        let label = self.describe();
        for conn in &mut self.connections {
            let parked = match conn.parked.take() {
                Some(p) => p,
                None => continue,
            };
            match self.table.execute(parked.unit, &parked.request, now) {
                UnitReply::Pending => conn.parked = Some(parked),
                UnitReply::Broadcast => self.stats.broadcasts_total += 1,
                UnitReply::Ready(result) => {
                    let pdu = match result {
                        Ok(resp) => resp.encode(),
                        Err(code) => {
                            self.stats.exceptions_total += 1;
                            Response::exception(parked.request.function().to_u8(), code).encode()
                        }
                    };
                    Self::send(
                        conn,
                        parked.transaction_id,
                        parked.unit,
                        &pdu,
                        &label,
                        &self.sink,
                        &mut self.stats,
                    )
                    .await;
                }
            }
        }
    }

    async fn read_pass(&mut self) {
        let label = self.describe();
        for conn in &mut self.connections {
            if conn.dead {
                continue;
            }
            let mut chunk = [0u8; 1024];
            match conn.stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!("client {} disconnected", conn.peer);
                    conn.dead = true;
                    continue;
                }
                Ok(n) => {
                    self.stats.bytes_received += n as u64;
                    self.sink.frame(
                        &format!("{}/{}", label, conn.peer),
                        Direction::Rx,
                        &chunk[..n],
                    );
                    conn.buf.extend_from_slice(&chunk[..n]);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    self.sink
                        .error(&label, 0, &format!("read from {} failed: {}", conn.peer, e));
                    conn.dead = true;
                    continue;
                }
            }

            // Backlogged frames wait while a parked request holds the line,
            // which preserves per-connection ordering
            while conn.parked.is_none() {
                let frame = match peel_frame(&mut conn.buf) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        self.sink
                            .error(&label, 0, &format!("bad frame from {}: {}", conn.peer, e));
                        self.stats.frame_errors += 1;
                        conn.dead = true;
                        break;
                    }
                };
                Self::handle_frame(conn, frame, &self.table, &label, &self.sink, &mut self.stats)
                    .await;
            }
        }
        self.reap();
    }

    async fn handle_frame(
        conn: &mut Connection,
        frame: AduFrame,
        table: &Arc<DeviceTable>,
        label: &str,
        sink: &SharedSink,
        stats: &mut EngineStats,
    ) {
        stats.requests_total += 1;
        let request = match Request::parse(&frame.pdu) {
            Ok(request) => request,
            Err(reply) => {
                stats.exceptions_total += 1;
                let pdu = Response::Exception(reply).encode();
                Self::send(conn, frame.transaction_id, frame.unit, &pdu, label, sink, stats).await;
                return;
            }
        };

        let now = chrono::Utc::now().timestamp_millis();
        match table.execute(frame.unit, &request, now) {
            UnitReply::Pending => {
                conn.parked = Some(ParkedRequest {
                    transaction_id: frame.transaction_id,
                    unit: frame.unit,
                    request,
                });
            }
            UnitReply::Broadcast => stats.broadcasts_total += 1,
            UnitReply::Ready(result) => {
                let pdu = match result {
                    Ok(resp) => resp.encode(),
                    Err(code) => {
                        stats.exceptions_total += 1;
                        Response::exception(request.function().to_u8(), code).encode()
                    }
                };
                Self::send(conn, frame.transaction_id, frame.unit, &pdu, label, sink, stats).await;
            }
        }
    }

    async fn send(
        conn: &mut Connection,
        transaction_id: u16,
        unit: UnitId,
        pdu: &[u8],
        label: &str,
        sink: &SharedSink,
        stats: &mut EngineStats,
    ) {
        let adu = mbap_wrap(transaction_id, unit, pdu);
        sink.frame(&format!("{}/{}", label, conn.peer), Direction::Tx, &adu);
        match conn.stream.write_all(&adu).await {
            Ok(()) => {
                stats.responses_total += 1;
                stats.bytes_sent += adu.len() as u64;
            }
            Err(e) => {
                sink.error(label, 0, &format!("write to {} failed: {}", conn.peer, e));
                conn.dead = true;
            }
        }
    }

    fn reap(&mut self) {
        let label = self.describe();
        for conn in self.connections.iter().filter(|c| c.dead) {
            self.sink
                .connection(&label, &format!("client disconnected: {}", conn.peer));
        }
        self.connections.retain(|c| !c.dead);
    }
}

#[async_trait]
impl ServerEngine for TcpServerEngine {
    fn describe(&self) -> String {
        format!("tcp://{}", self.bind_address)
    }

    async fn process(&mut self) -> SimResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.listener.is_none() {
            self.bind().await?;
        }
        self.parked_pass().await;
        self.accept_pass().await;
        self.read_pass().await;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.listener = None;
        for conn in &mut self.connections {
            let _ = conn.stream.shutdown().await;
        }
        self.connections.clear();
        self.closed = true;
        self.sink.connection(&self.describe(), "listener closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn stats(&self) -> EngineStats {
        let mut stats = self.stats.clone();
        stats.active_connections = self.connections.len() as u64;
        stats.parked_requests = self
            .connections
            .iter()
            .filter(|c| c.parked.is_some())
            .count() as u64;
        if let Some(started) = self.started_at {
            stats.uptime_seconds = started.elapsed().as_secs();
        }
        stats
    }
}
