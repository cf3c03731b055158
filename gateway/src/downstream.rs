use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::DownstreamConfig;
use crate::error::ProxyError;

/// Progress of one message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Initial,
    HeaderComplete,
    Body,
    MsgComplete,
    MsgReset,
    MsgBadHeader,
    StreamClosed,
}

impl StreamState {
    /// Terminal states for which no RST_STREAM is submitted on detach.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::MsgReset | StreamState::MsgBadHeader | StreamState::MsgComplete
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectProto {
    #[default]
    None,
    Websocket,
    Extended,
}

/// Facts about the client connection that feed header rewriting.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client IP as appended to x-forwarded-for and `for=`.
    pub peer_ip: String,
    /// Local listener address used for the `by=` parameter.
    pub local_hostport: String,
    /// False while the client-side TLS handshake is still in early data.
    pub tls_handshake_finished: bool,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            peer_ip: String::new(),
            local_hostport: String::new(),
            tls_handshake_finished: true,
        }
    }
}

/// Response-side events delivered from a downstream connection back to the
/// upstream session that owns the Downstream.
#[derive(Debug)]
pub enum ResponseEvent {
    Headers {
        status: StatusCode,
        headers: HeaderMap,
    },
    Data(Bytes),
    Trailers(HeaderMap),
    End,
    Error(ProxyError),
}

#[derive(Debug, Clone, Default)]
pub struct RequestCtx {
    pub method: Method,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: HeaderMap,
    pub trailers: Option<HeaderMap>,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub upgrade_request: bool,
    pub connect_proto: ConnectProto,
    /// HTTP/1.0-style request without an authority of its own.
    pub no_authority: bool,
    pub http_major: u8,
    pub http_minor: u8,
    /// The upstream parser saw body intent even without a content length.
    pub expect_body: bool,
    /// Bytes parked in the blocked buffer, not yet granted to the origin.
    pub unconsumed_body_length: u64,
}

impl RequestCtx {
    /// A proxy-style CONNECT (not websocket/extended tunneling).
    pub fn regular_connect_method(&self) -> bool {
        self.method == Method::CONNECT && self.connect_proto == ConnectProto::None
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseCtx {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub trailers: Option<HeaderMap>,
    /// Bytes received from the origin but not yet released back to its
    /// flow-control window.
    pub unconsumed_body_length: u64,
}

/// One in-flight request/response pair being proxied. Lives in exactly one
/// upstream session and at most one downstream connection at a time.
pub struct Downstream {
    pub request: RequestCtx,
    pub response: ResponseCtx,
    pub request_state: StreamState,
    pub response_state: StreamState,

    /// Request body ready to hand to the origin.
    pub request_buf: VecDeque<Bytes>,
    /// Body received before the request headers were pushed to the origin.
    pub blocked_request_buf: VecDeque<Bytes>,
    pub blocked_request_data_eof: bool,

    pub upstream_stream_id: Option<u32>,
    pub downstream_stream_id: Option<u32>,

    pub request_pending: bool,
    pub request_header_sent: bool,
    pub upgraded: bool,

    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,

    /// Keeps this request's config generation alive until completion.
    pub config: Arc<DownstreamConfig>,

    pub client: ClientInfo,

    pub response_events: Option<UnboundedSender<ResponseEvent>>,
    /// Wakes the request-body pump when new bytes or EOF arrive.
    pub body_wake: Arc<Notify>,
}

pub type SharedDownstream = Arc<Mutex<Downstream>>;

impl Downstream {
    pub fn new(
        request: RequestCtx,
        config: Arc<DownstreamConfig>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            request,
            response: ResponseCtx::default(),
            request_state: StreamState::Initial,
            response_state: StreamState::Initial,
            request_buf: VecDeque::new(),
            blocked_request_buf: VecDeque::new(),
            blocked_request_data_eof: false,
            upstream_stream_id: None,
            downstream_stream_id: None,
            request_pending: false,
            request_header_sent: false,
            upgraded: false,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
            config,
            client: ClientInfo::default(),
            response_events: None,
            body_wake: Arc::new(Notify::new()),
        }
    }

    pub fn shared(self) -> SharedDownstream {
        Arc::new(Mutex::new(self))
    }

    /// Park a request-body chunk until the origin headers have been sent.
    pub fn push_blocked_request_data(&mut self, data: Bytes) {
        self.request.unconsumed_body_length += data.len() as u64;
        self.blocked_request_buf.push_back(data);
    }

    /// Move blocked body bytes into the live buffer once the request header
    /// block is on the wire.
    pub fn promote_blocked_request(&mut self) {
        while let Some(chunk) = self.blocked_request_buf.pop_front() {
            self.request.unconsumed_body_length =
                self.request.unconsumed_body_length.saturating_sub(chunk.len() as u64);
            self.request_buf.push_back(chunk);
        }
        if self.blocked_request_data_eof {
            self.blocked_request_data_eof = false;
            self.request_state = StreamState::MsgComplete;
        }
    }

    pub fn send_response_event(&self, event: ResponseEvent) {
        if let Some(tx) = &self.response_events {
            let _ = tx.send(event);
        }
    }

    pub fn reset_read_deadline(&mut self) {
        self.read_deadline = Some(Instant::now() + self.read_timeout);
    }

    pub fn disable_read_deadline(&mut self) {
        self.read_deadline = None;
    }

    pub fn reset_write_deadline(&mut self) {
        self.write_deadline = Some(Instant::now() + self.write_timeout);
    }

    pub fn ensure_write_deadline(&mut self) {
        if self.write_deadline.is_none() {
            self.reset_write_deadline();
        }
    }

    pub fn disable_write_deadline(&mut self) {
        self.write_deadline = None;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpOptions;

    fn downstream() -> Downstream {
        let config = Arc::new(DownstreamConfig::new(1, vec![], HttpOptions::default()));
        Downstream::new(
            RequestCtx::default(),
            config,
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn blocked_body_is_accounted_and_promoted() {
        let mut d = downstream();
        d.push_blocked_request_data(Bytes::from_static(b"hello"));
        d.push_blocked_request_data(Bytes::from_static(b"world"));
        d.blocked_request_data_eof = true;
        assert_eq!(d.request.unconsumed_body_length, 10);
        assert!(d.request_buf.is_empty());

        d.promote_blocked_request();
        assert_eq!(d.request.unconsumed_body_length, 0);
        assert_eq!(d.request_buf.len(), 2);
        assert!(d.blocked_request_buf.is_empty());
        assert_eq!(d.request_state, StreamState::MsgComplete);
        assert!(!d.blocked_request_data_eof);
    }

    #[test]
    fn terminal_response_states() {
        assert!(StreamState::MsgComplete.is_terminal());
        assert!(StreamState::MsgReset.is_terminal());
        assert!(StreamState::MsgBadHeader.is_terminal());
        assert!(!StreamState::HeaderComplete.is_terminal());
        assert!(!StreamState::StreamClosed.is_terminal());
    }

    #[test]
    fn regular_connect_excludes_tunnel_protocols() {
        let mut req = RequestCtx {
            method: Method::CONNECT,
            ..RequestCtx::default()
        };
        assert!(req.regular_connect_method());
        req.connect_proto = ConnectProto::Websocket;
        assert!(!req.regular_connect_method());
    }
}
