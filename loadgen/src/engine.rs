use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::LoadgenConfig;
use crate::conn::{
    CloseReason, ConnConfig, ConnError, ConnEvent, H3SessionFactory, H3Session, Level, PktInfo,
    QuicConn, StreamWriteOutcome, TransportParams, ALPN_H3, CID_LEN, MAX_UDP_PAYLOAD_SIZE,
    QUIC_TX_DATALEN, QUIC_VERSION_MIN, QUIC_VERSION_V1, STATELESS_RESET_TOKEN_LEN,
};
use crate::qlog::QlogSink;
use crate::stats::WorkerStats;
use crate::udp::{DatagramSocket, SendOutcome, TokioDatagramSocket};

/// HTTP/3 "no error" application code, substituted when the peer closes a
/// stream without carrying one.
const H3_NO_ERROR: u64 = 0x100;

/// Datagrams consumed per `read_quic` invocation before yielding back to the
/// event loop.
const MAX_DGRAMS_PER_READ: usize = 100;

const DEFAULT_MAX_UDP_PAYLOAD: usize = 1472;

fn clock_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic nanoseconds since an arbitrary process epoch. The same clock
/// feeds `initial_ts`, per-packet timestamps, and expiry comparisons.
pub fn timestamp() -> u64 {
    clock_epoch().elapsed().as_nanos() as u64
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("connection close requested")]
    CloseRequested,
}

/// The single pending tx descriptor kept while the socket is unwritable.
struct BlockedPacket {
    remote: SocketAddr,
    data: Bytes,
    gso_size: usize,
}

/// Computes the client transport parameters from the configured windows.
pub fn transport_params(config: &LoadgenConfig) -> TransportParams {
    let max_stream_data = std::cmp::min((1u64 << 26) - 1, (1u64 << config.window_bits) - 1);
    TransportParams {
        initial_max_stream_data_bidi_local: max_stream_data,
        initial_max_stream_data_uni: max_stream_data,
        initial_max_data: (1u64 << config.connection_window_bits) - 1,
        initial_max_streams_bidi: 0,
        initial_max_streams_uni: 100,
        max_idle_timeout_ns: 30 * 1_000_000_000,
    }
}

/// Fresh 8-byte connection id from the CSPRNG.
pub fn generate_cid() -> [u8; CID_LEN] {
    let mut cid = [0u8; CID_LEN];
    OsRng.fill_bytes(&mut cid);
    cid
}

/// New connection id plus its 16-byte stateless reset token, for rotation
/// and path migration.
pub fn generate_new_cid() -> ([u8; CID_LEN], [u8; STATELESS_RESET_TOKEN_LEN]) {
    let mut token = [0u8; STATELESS_RESET_TOKEN_LEN];
    OsRng.fill_bytes(&mut token);
    (generate_cid(), token)
}

/// Assembles the connection setup for one client: random CIDs, wire version
/// derived from the first ALPN token, transport parameters, and the qlog
/// sink when tracing is enabled.
pub fn build_conn_config(
    config: &LoadgenConfig,
    worker_id: usize,
    client_id: usize,
) -> io::Result<ConnConfig> {
    let version = match config.alpn_list.first() {
        Some(alpn) if alpn == ALPN_H3 => QUIC_VERSION_V1,
        _ => QUIC_VERSION_MIN,
    };
    let qlog = match &config.qlog_file_base {
        Some(base) => Some(QlogSink::open(base, worker_id, client_id)?),
        None => None,
    };
    Ok(ConnConfig {
        version,
        scid: generate_cid(),
        dcid: generate_cid(),
        initial_ts: timestamp(),
        params: transport_params(config),
        max_udp_payload_size: config.max_udp_payload_size,
        qlog,
    })
}

/// Drives one QUIC client connection end to end: datagram rx with GRO
/// fan-out, aggregated tx with at most one blocked descriptor, the packet
/// timer, and the HTTP/3 session bridge.
pub struct QuicEngine<C: QuicConn, S: DatagramSocket> {
    conn: Option<C>,
    socket: S,
    session: Option<Box<dyn H3Session>>,
    session_factory: Box<dyn H3SessionFactory>,
    last_error: CloseReason,
    tx_data: Vec<u8>,
    rx_buf: Vec<u8>,
    blocked: Option<BlockedPacket>,
    pkt_timer_deadline: Option<tokio::time::Instant>,
    close_requested: bool,
    max_udp_payload: usize,
    qlog: Option<QlogSink>,
    stats: Arc<WorkerStats>,
}

impl<C: QuicConn, S: DatagramSocket> QuicEngine<C, S> {
    pub fn new(
        conn: C,
        socket: S,
        session_factory: Box<dyn H3SessionFactory>,
        stats: Arc<WorkerStats>,
        qlog: Option<QlogSink>,
        max_udp_payload: Option<usize>,
    ) -> Self {
        Self {
            conn: Some(conn),
            socket,
            session: None,
            session_factory,
            last_error: CloseReason::None,
            tx_data: vec![0u8; QUIC_TX_DATALEN],
            rx_buf: vec![0u8; 64 * 1024],
            blocked: None,
            pkt_timer_deadline: None,
            close_requested: false,
            max_udp_payload: max_udp_payload.unwrap_or(DEFAULT_MAX_UDP_PAYLOAD),
            qlog,
            stats,
        }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn last_error(&self) -> CloseReason {
        self.last_error
    }

    pub fn send_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn pkt_timer_deadline(&self) -> Option<tokio::time::Instant> {
        self.pkt_timer_deadline
    }

    fn record_conn_error(&mut self, err: ConnError) {
        if self.last_error.is_set() {
            return;
        }
        self.last_error = match err {
            ConnError::Crypto => {
                let alert = self.conn.as_ref().and_then(|c| c.tls_alert()).unwrap_or(0);
                CloseReason::TlsAlert(alert)
            }
            ConnError::Proto(code) => CloseReason::Lib(code),
        };
    }

    /// Drain up to `MAX_DGRAMS_PER_READ` datagrams from the socket and feed
    /// them to the state machine. The receive timestamp is sampled once per
    /// invocation, not per datagram.
    pub fn read_quic(&mut self) -> Result<(), EngineError> {
        let ts = timestamp();
        let mut pktcnt = 0usize;

        while pktcnt < MAX_DGRAMS_PER_READ {
            let info = match self.socket.recv(&mut self.rx_buf)? {
                Some(info) => info,
                None => return Ok(()),
            };
            // With GRO the blob is logically ceil(nread / gso_size)
            // datagrams.
            let gso_size = if info.gro_size == 0 {
                info.len
            } else {
                info.gro_size
            };
            if gso_size == 0 {
                continue;
            }
            self.stats
                .add_dgram_recv(info.len.div_ceil(gso_size) as u64);

            let mut off = 0;
            while off < info.len {
                let datalen = gso_size.min(info.len - off);
                pktcnt += 1;
                let result = {
                    let Self { conn, rx_buf, .. } = self;
                    let conn = conn.as_mut().ok_or(EngineError::CloseRequested)?;
                    conn.read_pkt(
                        info.from,
                        PktInfo { ecn: info.ecn },
                        &rx_buf[off..off + datalen],
                        ts,
                    )
                };
                let events = match result {
                    Ok(events) => events,
                    Err(err) => {
                        self.record_conn_error(err);
                        return Err(err.into());
                    }
                };
                self.process_events(events)?;
                off += datalen;
            }
        }

        Ok(())
    }

    pub(crate) fn process_events(&mut self, events: Vec<ConnEvent>) -> Result<(), EngineError> {
        for event in events {
            match event {
                ConnEvent::HandshakeCompleted => {
                    debug!("quic handshake completed");
                }
                ConnEvent::RecvRxKey { level } => {
                    // Only the first 1-RTT rx-key install constructs the
                    // HTTP/3 session; earlier levels and key updates are
                    // ignored.
                    if level == Level::OneRtt && self.session.is_none() {
                        self.session = Some(self.session_factory.create()?);
                        debug!("http/3 session initialized");
                    }
                }
                ConnEvent::RecvStreamData {
                    stream_id,
                    fin,
                    data,
                } => {
                    self.stats.add_bytes(data.len() as u64);
                    let nconsumed = match self.session.as_mut() {
                        Some(session) => session.read_stream(stream_id, &data, fin)?,
                        None => {
                            warn!(stream_id, "stream data before http/3 session; dropped");
                            continue;
                        }
                    };
                    if let Some(conn) = self.conn.as_mut() {
                        conn.extend_max_stream_offset(stream_id, nconsumed as u64);
                        conn.extend_max_offset(nconsumed as u64);
                    }
                }
                ConnEvent::AckedStreamData { stream_id, datalen } => {
                    if let Some(session) = self.session.as_mut() {
                        session.add_ack_offset(stream_id, datalen)?;
                    }
                }
                ConnEvent::StreamClose {
                    stream_id,
                    app_error_code,
                } => {
                    if let Some(session) = self.session.as_mut() {
                        session.close_stream(stream_id, app_error_code.unwrap_or(H3_NO_ERROR))?;
                    }
                }
                ConnEvent::StreamReset { stream_id }
                | ConnEvent::StreamStopSending { stream_id } => {
                    if let Some(session) = self.session.as_mut() {
                        session.shutdown_stream_read(stream_id);
                    }
                }
                ConnEvent::ExtendMaxLocalStreamsBidi => {
                    if let Some(session) = self.session.as_mut() {
                        session.extend_max_local_streams()?;
                    }
                }
                ConnEvent::ExtendMaxStreamData { stream_id } => {
                    if let Some(session) = self.session.as_mut() {
                        session.unblock_stream(stream_id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Flush pending tx: retry the blocked descriptor first, then aggregate
    /// fresh packets from the state machine and hand them to the socket.
    pub fn write_quic(&mut self) -> Result<(), EngineError> {
        if self.close_requested {
            return Err(EngineError::CloseRequested);
        }

        if self.blocked.is_some() {
            self.send_blocked_packet()?;
            if self.blocked.is_some() {
                return Ok(());
            }
        }

        let ts = timestamp();
        let mut pos = 0usize;
        let mut gso_size = 0usize;

        loop {
            let (stream_id, fin, bufs) = self.next_stream_data()?;

            let dest_end = (pos + self.max_udp_payload).min(self.tx_data.len());
            let conn = self.conn.as_mut().ok_or(EngineError::CloseRequested)?;
            let outcome =
                conn.writev_stream(&mut self.tx_data[pos..dest_end], stream_id, &bufs, fin, ts);

            match outcome {
                StreamWriteOutcome::StreamDataBlocked => {
                    if let Some(session) = self.session.as_mut() {
                        session.block_stream(stream_id);
                    }
                    continue;
                }
                StreamWriteOutcome::StreamShutWr => {
                    if let Some(session) = self.session.as_mut() {
                        session.shutdown_stream_write(stream_id);
                    }
                    continue;
                }
                StreamWriteOutcome::WriteMore { ndatalen } => {
                    if let Some(session) = self.session.as_mut() {
                        session.add_write_offset(stream_id, ndatalen)?;
                    }
                    continue;
                }
                StreamWriteOutcome::Err(err) => {
                    self.record_conn_error(err);
                    return Err(err.into());
                }
                StreamWriteOutcome::Written { nwrite, ndatalen } => {
                    if ndatalen >= 0 {
                        if let Some(session) = self.session.as_mut() {
                            session.add_write_offset(stream_id, ndatalen as usize)?;
                        }
                    }
                    if nwrite == 0 {
                        break;
                    }
                    if gso_size == 0 {
                        gso_size = nwrite;
                    }
                    pos += nwrite;
                    // A short datagram terminates the GSO batch, as does a
                    // buffer without room for one more full payload.
                    if nwrite < gso_size || pos + self.max_udp_payload > self.tx_data.len() {
                        break;
                    }
                }
            }
        }

        self.restart_pkt_timer();

        if pos == 0 {
            return Ok(());
        }

        let remote = self
            .conn
            .as_ref()
            .ok_or(EngineError::CloseRequested)?
            .remote_addr();
        let batch_gso = if pos > gso_size { gso_size } else { 0 };
        let data = Bytes::copy_from_slice(&self.tx_data[..pos]);
        self.send_or_blocked(remote, data, batch_gso)
    }

    fn next_stream_data(&mut self) -> Result<(i64, bool, Vec<Bytes>), EngineError> {
        let has_credit = self
            .conn
            .as_ref()
            .map(|c| c.max_data_left() > 0)
            .unwrap_or(false);
        if !has_credit {
            return Ok((-1, false, Vec::new()));
        }
        match self.session.as_mut() {
            Some(session) => match session.next_write_stream() {
                Ok(Some((stream_id, fin, bufs))) => Ok((stream_id, fin, bufs)),
                Ok(None) => Ok((-1, false, Vec::new())),
                Err(err) => {
                    self.record_conn_error(err);
                    Err(err.into())
                }
            },
            None => Ok((-1, false, Vec::new())),
        }
    }

    fn send_or_blocked(
        &mut self,
        remote: SocketAddr,
        data: Bytes,
        gso_size: usize,
    ) -> Result<(), EngineError> {
        let total = data.len();
        match self.socket.send(remote, &data, gso_size)? {
            SendOutcome::Sent(n) if n == total => {
                let seg = if gso_size == 0 { total } else { gso_size };
                self.stats.add_dgram_sent(total.div_ceil(seg.max(1)) as u64);
                Ok(())
            }
            SendOutcome::Sent(n) => {
                self.on_send_blocked(remote, data.slice(n..), gso_size);
                Ok(())
            }
            SendOutcome::WouldBlock => {
                self.on_send_blocked(remote, data, gso_size);
                Ok(())
            }
        }
    }

    fn on_send_blocked(&mut self, remote: SocketAddr, data: Bytes, gso_size: usize) {
        debug_assert!(self.blocked.is_none());
        trace!(len = data.len(), gso_size, "udp send blocked");
        self.blocked = Some(BlockedPacket {
            remote,
            data,
            gso_size,
        });
    }

    /// Retry the single blocked descriptor. On a partial accept the residual
    /// stays blocked; on success the slot clears.
    pub fn send_blocked_packet(&mut self) -> Result<(), EngineError> {
        let pkt = match self.blocked.take() {
            Some(pkt) => pkt,
            None => return Ok(()),
        };
        let total = pkt.data.len();
        match self.socket.send(pkt.remote, &pkt.data, pkt.gso_size)? {
            SendOutcome::Sent(n) if n == total => {
                trace!(len = total, "blocked udp send flushed");
                Ok(())
            }
            SendOutcome::Sent(n) => {
                self.blocked = Some(BlockedPacket {
                    remote: pkt.remote,
                    data: pkt.data.slice(n..),
                    gso_size: pkt.gso_size,
                });
                Ok(())
            }
            SendOutcome::WouldBlock => {
                self.blocked = Some(pkt);
                Ok(())
            }
        }
    }

    fn restart_pkt_timer(&mut self) {
        let expiry = self.conn.as_ref().and_then(|c| c.expiry());
        self.pkt_timer_deadline = expiry.map(|at| {
            let now = timestamp();
            let delta = at.saturating_sub(now).max(1);
            tokio::time::Instant::now() + Duration::from_nanos(delta)
        });
    }

    /// Packet timer fired. Expiry failure is fatal to the connection.
    pub fn handle_pkt_timeout(&mut self) -> Result<(), EngineError> {
        let ts = timestamp();
        let conn = self.conn.as_mut().ok_or(EngineError::CloseRequested)?;
        if let Err(err) = conn.handle_expiry(ts) {
            self.record_conn_error(err);
            return Err(err.into());
        }
        Ok(())
    }

    /// Fatal teardown: update the worker's accounting, then release the
    /// state machine and the qlog sink.
    pub fn fail(&mut self) {
        self.stats.record_client_failure();
        self.close_connection();
    }

    /// Send a single best-effort CONNECTION_CLOSE packet, then free the
    /// state machine and the qlog sink.
    pub fn close_connection(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];
            let reason = self.last_error;
            if let Some(n) = conn.write_connection_close(&mut buf, reason, timestamp()) {
                if n > 0 {
                    let remote = conn.remote_addr();
                    let _ = self.socket.send(remote, &buf[..n], 0);
                }
            }
        }
        self.conn = None;
        self.session = None;
        self.qlog = None;
    }
}

impl<C: QuicConn> QuicEngine<C, TokioDatagramSocket> {
    /// Event loop for one client over a real UDP socket: socket readiness,
    /// blocked-send retry, and the packet timer.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let io = self.socket.inner();
        let far_future = tokio::time::Instant::now() + Duration::from_secs(86400);
        loop {
            let deadline = self.pkt_timer_deadline().unwrap_or(far_future);
            let timer_armed = self.pkt_timer_deadline().is_some();
            let want_write = self.send_blocked();

            let step = tokio::select! {
                ready = io.readable() => {
                    ready
                        .map_err(EngineError::from)
                        .and_then(|()| self.read_quic())
                        .and_then(|()| self.write_quic())
                }
                ready = io.writable(), if want_write => {
                    ready
                        .map_err(EngineError::from)
                        .and_then(|()| self.write_quic())
                }
                _ = tokio::time::sleep_until(deadline), if timer_armed => {
                    self.handle_pkt_timeout().and_then(|()| self.write_quic())
                }
            };

            if let Err(err) = step {
                debug!(error = %err, "quic client failed");
                self.fail();
                return Err(err);
            }
        }
    }
}
