use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;

use crate::qlog::QlogSink;

/// Aggregate transmit buffer size for one `write_quic` batch.
pub const QUIC_TX_DATALEN: usize = 64 * 1024;

/// Largest single UDP payload the engine will ever ask the state machine to
/// produce (connection-close packets use a buffer of this size).
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65527;

/// QUIC v1 (RFC 9000) wire version.
pub const QUIC_VERSION_V1: u32 = 0x0000_0001;

/// Minimum wire version the state machine supports (draft-compatible mode).
pub const QUIC_VERSION_MIN: u32 = 0xff00_001d;

/// ALPN token that selects HTTP/3 over QUIC v1.
pub const ALPN_H3: &str = "h3";

pub const CID_LEN: usize = 8;
pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// TLS encryption level reported with receive-key install events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

/// Error returned by the protocol state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    /// TLS handshake failure; the alert is fetched from the state machine.
    #[error("crypto failure")]
    Crypto,
    /// Any other library error, identified by its error code.
    #[error("protocol error {0}")]
    Proto(i32),
}

/// The reason recorded for the eventual CONNECTION_CLOSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseReason {
    #[default]
    None,
    TlsAlert(u8),
    Lib(i32),
    App(u64),
}

impl CloseReason {
    pub fn is_set(&self) -> bool {
        !matches!(self, CloseReason::None)
    }
}

/// Events surfaced by `read_pkt`. This is the ngtcp2-style callback pack
/// inverted into data the engine consumes after each datagram.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    HandshakeCompleted,
    RecvStreamData {
        stream_id: i64,
        fin: bool,
        data: Bytes,
    },
    AckedStreamData {
        stream_id: i64,
        datalen: usize,
    },
    StreamClose {
        stream_id: i64,
        /// None when the peer did not carry an application error code; the
        /// engine substitutes H3 NO_ERROR.
        app_error_code: Option<u64>,
    },
    StreamReset {
        stream_id: i64,
    },
    StreamStopSending {
        stream_id: i64,
    },
    ExtendMaxLocalStreamsBidi,
    ExtendMaxStreamData {
        stream_id: i64,
    },
    RecvRxKey {
        level: Level,
    },
}

/// Outcome of a single vectored stream write into the aggregate buffer.
#[derive(Debug)]
pub enum StreamWriteOutcome {
    /// A datagram of `nwrite` bytes was produced. `ndatalen` is the number of
    /// stream-data bytes consumed, or -1 if no stream data was written.
    Written { nwrite: usize, ndatalen: i64 },
    /// The stream is blocked on flow control; nothing was written.
    StreamDataBlocked,
    /// The write side of the stream has been shut down.
    StreamShutWr,
    /// `ndatalen` stream bytes were accepted but the packet has room for
    /// more; call again with the next stream.
    WriteMore { ndatalen: usize },
    Err(ConnError),
}

/// ECN and related per-packet metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktInfo {
    pub ecn: u8,
}

/// Transport parameters the engine requests at connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout_ns: u64,
}

/// Everything the state machine needs to come up as a client connection.
pub struct ConnConfig {
    pub version: u32,
    pub scid: [u8; CID_LEN],
    pub dcid: [u8; CID_LEN],
    pub initial_ts: u64,
    pub params: TransportParams,
    pub max_udp_payload_size: Option<usize>,
    pub qlog: Option<QlogSink>,
}

/// The QUIC protocol state machine as seen by the engine. Implementations
/// wrap the actual protocol library; tests substitute scripted fakes.
pub trait QuicConn: Send {
    /// Feed one datagram (or one GRO segment). Returns the callback events
    /// raised while processing it.
    fn read_pkt(
        &mut self,
        remote: SocketAddr,
        pi: PktInfo,
        data: &[u8],
        ts: u64,
    ) -> Result<Vec<ConnEvent>, ConnError>;

    /// Write the next packet into `dest`, coalescing the given stream data.
    /// `stream_id` is -1 when no stream data is on offer. The engine always
    /// requests write-more and padding semantics; `fin` marks the final
    /// stream chunk.
    fn writev_stream(
        &mut self,
        dest: &mut [u8],
        stream_id: i64,
        data: &[Bytes],
        fin: bool,
        ts: u64,
    ) -> StreamWriteOutcome;

    /// Build a CONNECTION_CLOSE packet. Returns the packet length, or None
    /// if the connection is in a state where no close packet can be sent.
    fn write_connection_close(
        &mut self,
        dest: &mut [u8],
        reason: CloseReason,
        ts: u64,
    ) -> Option<usize>;

    /// Earliest timer expiry in the engine's clock, or None when no timer is
    /// armed.
    fn expiry(&self) -> Option<u64>;

    fn handle_expiry(&mut self, ts: u64) -> Result<(), ConnError>;

    /// Connection-level flow control credit still available for sending.
    fn max_data_left(&self) -> u64;

    fn extend_max_stream_offset(&mut self, stream_id: i64, n: u64);

    fn extend_max_offset(&mut self, n: u64);

    /// The TLS alert associated with the last crypto failure, if any.
    fn tls_alert(&self) -> Option<u8>;

    /// Remote address of the active network path.
    fn remote_addr(&self) -> SocketAddr;
}

/// The HTTP/3 session layered on the connection once 1-RTT keys exist.
pub trait H3Session: Send {
    /// Deliver received stream bytes; returns the number of bytes consumed
    /// for flow-control accounting.
    fn read_stream(&mut self, stream_id: i64, data: &[u8], fin: bool) -> Result<usize, ConnError>;

    /// The next chunk of stream data to transmit: `(stream_id, fin, bufs)`,
    /// or None when nothing is ready.
    fn next_write_stream(&mut self) -> Result<Option<(i64, bool, Vec<Bytes>)>, ConnError>;

    fn add_write_offset(&mut self, stream_id: i64, n: usize) -> Result<(), ConnError>;

    fn add_ack_offset(&mut self, stream_id: i64, n: usize) -> Result<(), ConnError>;

    fn block_stream(&mut self, stream_id: i64);

    fn unblock_stream(&mut self, stream_id: i64);

    fn shutdown_stream_read(&mut self, stream_id: i64);

    fn shutdown_stream_write(&mut self, stream_id: i64);

    fn close_stream(&mut self, stream_id: i64, app_error_code: u64) -> Result<(), ConnError>;

    fn extend_max_local_streams(&mut self) -> Result<(), ConnError>;
}

/// Builds the HTTP/3 session when the engine sees the first 1-RTT receive
/// key. Invoked at most once per connection.
pub trait H3SessionFactory: Send {
    fn create(&mut self) -> Result<Box<dyn H3Session>, ConnError>;
}

impl<F> H3SessionFactory for F
where
    F: FnMut() -> Result<Box<dyn H3Session>, ConnError> + Send,
{
    fn create(&mut self) -> Result<Box<dyn H3Session>, ConnError> {
        self()
    }
}
