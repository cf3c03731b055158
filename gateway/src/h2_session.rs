use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Reason, SendStream};
use http::header::HeaderValue;
use http::Method;
use slab::Slab;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::config::{Endpoint, HttpOptions};
use crate::downstream::{ConnectProto, ResponseEvent, SharedDownstream, StreamState};
use crate::error::ProxyError;
use crate::http_rewrite::{build_request, AuthorityPlacement, BuiltRequest};

const STREAM_WINDOW: u32 = 2 * 1024 * 1024;
const CONN_WINDOW: u32 = 5 * 1024 * 1024;

/// One multiplexed HTTP/2 client connection to a specific origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Resolving,
    Connecting,
    Connected,
    ConnectFailing,
    Disconnecting,
}

/// Handle to an attached stream within a session.
pub type StreamKey = usize;

/// Seam over the receive-window release so flow-control accounting is
/// observable in tests; the production impl wraps `h2::FlowControl`.
pub(crate) trait WindowReleaser: Send {
    fn release(&mut self, n: usize);
}

struct H2FlowReleaser(h2::FlowControl);

impl WindowReleaser for H2FlowReleaser {
    fn release(&mut self, n: usize) {
        if let Err(err) = self.0.release_capacity(n) {
            debug!(error = %err, "release_capacity failed");
        }
    }
}

struct StreamData {
    downstream: SharedDownstream,
    send: Option<Arc<StdMutex<SendStream<Bytes>>>>,
    releaser: Option<Box<dyn WindowReleaser>>,
    seq: Option<u32>,
}

struct Inner {
    state: SessionState,
    sender: Option<SendRequest<Bytes>>,
    streams: Slab<StreamData>,
    next_seq: u32,
}

pub struct Http2Session {
    endpoint: Endpoint,
    options: Arc<HttpOptions>,
    via_token: String,
    inner: StdMutex<Inner>,
    write_notify: Notify,
    self_ref: Weak<Http2Session>,
}

impl Http2Session {
    pub fn new(endpoint: Endpoint, options: Arc<HttpOptions>, via_token: String) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            endpoint,
            options,
            via_token,
            inner: StdMutex::new(Inner {
                state: SessionState::Disconnected,
                sender: None,
                streams: Slab::new(),
                next_seq: 1,
            }),
            write_notify: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("session still referenced")
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    /// New requests may only be submitted while connected.
    pub fn can_push_request(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// A session is reusable while it has not started tearing down.
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connected | SessionState::Connecting | SessionState::Resolving
        )
    }

    fn set_state(&self, state: SessionState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Link a Downstream into the session. HTTP/2 disables HTTP/1-style
    /// Upgrade, so the flag is cleared for plain requests here.
    pub fn attach_downstream(&self, downstream: SharedDownstream) -> StreamKey {
        {
            let mut d = downstream.lock().unwrap();
            if d.request.method != Method::CONNECT && d.request.connect_proto == ConnectProto::None
            {
                d.request.upgrade_request = false;
            }
            d.reset_read_deadline();
        }
        let key = self.inner.lock().unwrap().streams.insert(StreamData {
            downstream,
            send: None,
            releaser: None,
            seq: None,
        });
        self.write_notify.notify_waiters();
        trace!(endpoint = %self.endpoint.hostport(), key, "downstream attached");
        key
    }

    /// Unlink a Downstream. Submits RST_STREAM unless the response already
    /// reached a terminal state, and returns any unconsumed body bytes to
    /// the peer's window exactly once. Tolerates re-entrant calls.
    pub fn detach_downstream(&self, key: StreamKey) {
        let entry = { self.inner.lock().unwrap().streams.try_remove(key) };
        let Some(mut entry) = entry else { return };

        let (terminal, residual, upgraded, request_closed) = {
            let mut d = entry.downstream.lock().unwrap();
            let residual = d.response.unconsumed_body_length;
            d.response.unconsumed_body_length = 0;
            d.disable_read_deadline();
            d.disable_write_deadline();
            (
                d.response_state.is_terminal(),
                residual,
                d.upgraded,
                d.request_state == StreamState::StreamClosed,
            )
        };

        if let Some(send) = &entry.send {
            if !terminal {
                // Upgraded tunnels that ran to stream close part cleanly.
                let reason = if upgraded && request_closed {
                    Reason::NO_ERROR
                } else {
                    Reason::INTERNAL_ERROR
                };
                send.lock().unwrap().send_reset(reason);
            }
        }

        if residual > 0 {
            if let Some(releaser) = entry.releaser.as_mut() {
                releaser.release(residual as usize);
            }
        }

        self.write_notify.notify_waiters();
        trace!(key, residual, "downstream detached");
    }

    /// Release `n` received bytes back to the stream and connection
    /// windows. Skipping this stalls the origin.
    pub fn consume(&self, key: StreamKey, n: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(sd) = inner.streams.get_mut(key) {
                if let Some(releaser) = sd.releaser.as_mut() {
                    releaser.release(n);
                }
                let mut d = sd.downstream.lock().unwrap();
                d.response.unconsumed_body_length =
                    d.response.unconsumed_body_length.saturating_sub(n as u64);
            }
        }
        self.write_notify.notify_waiters();
    }

    /// RST_STREAM with an explicit reason; the timeout path uses NO_ERROR.
    pub fn reset_stream(&self, key: StreamKey, reason: Reason) {
        let send = {
            let inner = self.inner.lock().unwrap();
            inner.streams.get(key).and_then(|sd| sd.send.clone())
        };
        if let Some(send) = send {
            send.lock().unwrap().send_reset(reason);
            self.write_notify.notify_waiters();
        }
    }

    /// Kick the dial state machine if the session is down.
    pub fn signal_connect(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                SessionState::Disconnected | SessionState::ConnectFailing => {
                    inner.state = SessionState::Resolving;
                }
                _ => return,
            }
        }
        let session = self.arc();
        tokio::spawn(async move {
            if let Err(err) = session.connect().await {
                warn!(
                    endpoint = %session.endpoint.hostport(),
                    error = %err,
                    "origin connect failed"
                );
                session.on_connect_failed(err);
            }
        });
    }

    async fn connect(&self) -> Result<(), ProxyError> {
        let host = self.endpoint.host.clone();
        let port = self.endpoint.port;
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|err| ProxyError::Dial(format!("resolve {host}: {err}")))?
            .next()
            .ok_or_else(|| ProxyError::Dial(format!("resolve {host}: no addresses")))?;

        self.set_state(SessionState::Connecting);

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|err| ProxyError::Dial(format!("connect {addr}: {err}")))?;
        let _ = tcp.set_nodelay(true);

        if self.endpoint.tls {
            let connector = h2_tls_connector()?;
            let name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ProxyError::Dial(format!("invalid server name {host}")))?;
            let io = connector
                .connect(name, tcp)
                .await
                .map_err(|err| ProxyError::Dial(format!("tls {host}: {err}")))?;
            self.establish(io).await
        } else {
            self.establish(tcp).await
        }
    }

    async fn establish<T>(&self, io: T) -> Result<(), ProxyError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = h2::client::Builder::new()
            .initial_window_size(STREAM_WINDOW)
            .initial_connection_window_size(CONN_WINDOW)
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|err| ProxyError::Dial(format!("h2 handshake: {err}")))?;

        {
            let mut inner = self.inner.lock().unwrap();
            inner.sender = Some(sender);
            inner.state = SessionState::Connected;
        }
        debug!(endpoint = %self.endpoint.hostport(), "origin session connected");

        let session = self.arc();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(
                    endpoint = %session.endpoint.hostport(),
                    error = %err,
                    "origin session closed"
                );
            }
            session.on_connection_closed();
        });

        self.flush_pending();
        Ok(())
    }

    /// Push headers for every Downstream that queued while the session was
    /// still connecting.
    fn flush_pending(&self) {
        let pending: Vec<StreamKey> = {
            let inner = self.inner.lock().unwrap();
            inner
                .streams
                .iter()
                .filter(|(_, sd)| sd.downstream.lock().unwrap().request_pending)
                .map(|(key, _)| key)
                .collect()
        };
        for key in pending {
            let session = self.arc();
            tokio::spawn(async move {
                if let Err(err) = session.push_request_headers(key).await {
                    session.fail_stream(key, err);
                }
            });
        }
    }

    /// Submit the request head for one attached Downstream. Outside
    /// CONNECTED the request is marked pending and the dial is kicked; it
    /// will be flushed on the transition to CONNECTED.
    pub async fn push_request_headers(&self, key: StreamKey) -> Result<(), ProxyError> {
        let snapshot = {
            let inner = self.inner.lock().unwrap();
            inner
                .streams
                .get(key)
                .map(|sd| (sd.downstream.clone(), inner.sender.clone(), inner.state))
        };
        let Some((downstream, sender, state)) = snapshot else {
            return Ok(());
        };

        if state != SessionState::Connected {
            downstream.lock().unwrap().request_pending = true;
            self.signal_connect();
            return Ok(());
        }

        let sender =
            sender.ok_or_else(|| ProxyError::Protocol("connected session has no sender".into()))?;

        let built = {
            let mut d = downstream.lock().unwrap();
            d.request_pending = false;
            if d.request.connect_proto != ConnectProto::None && self.options.http2_proxy {
                return Err(ProxyError::Protocol(
                    "extended connect not allowed through http2 proxy".into(),
                ));
            }
            build_request(
                &d.request,
                &self.endpoint,
                &self.options,
                &d.client,
                &self.via_token,
            )
        };
        let request = to_h2_request(&built)?;

        let mut sender = sender.ready().await.map_err(map_h2_error)?;
        let (response, send_stream) = sender
            .send_request(request, !built.expects_body)
            .map_err(map_h2_error)?;
        let send = Arc::new(StdMutex::new(send_stream));

        let seq = {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 2;
            match inner.streams.get_mut(key) {
                Some(sd) => {
                    sd.send = Some(Arc::clone(&send));
                    sd.seq = Some(seq);
                }
                None => {
                    // Detached while the submit was in flight.
                    send.lock().unwrap().send_reset(Reason::CANCEL);
                    return Ok(());
                }
            }
            seq
        };

        let wake = {
            let mut d = downstream.lock().unwrap();
            d.downstream_stream_id = Some(seq);
            d.request_header_sent = true;
            d.promote_blocked_request();
            if built.expects_body {
                d.reset_write_deadline();
            }
            Arc::clone(&d.body_wake)
        };

        if built.expects_body {
            tokio::spawn(run_body_pump(
                Arc::clone(&downstream),
                Arc::clone(&send),
                wake,
            ));
        }

        tokio::spawn(run_response(
            self.arc(),
            key,
            Arc::clone(&downstream),
            response,
        ));

        self.write_notify.notify_waiters();
        Ok(())
    }

    fn set_releaser(&self, key: StreamKey, releaser: Box<dyn WindowReleaser>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sd) = inner.streams.get_mut(key) {
            sd.releaser = Some(releaser);
        }
    }

    fn fail_stream(&self, key: StreamKey, error: ProxyError) {
        let entry = { self.inner.lock().unwrap().streams.try_remove(key) };
        if let Some(entry) = entry {
            let mut d = entry.downstream.lock().unwrap();
            d.response_state = StreamState::MsgReset;
            d.send_response_event(ResponseEvent::Error(error));
        }
    }

    fn on_connect_failed(&self, error: ProxyError) {
        self.set_state(SessionState::ConnectFailing);
        self.drain_streams(|_| error.clone());
    }

    /// The connection driver exited. Every attached Downstream is surfaced
    /// as 502, or aborted if its response was already under way.
    fn on_connection_closed(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sender = None;
            if inner.state == SessionState::Connected {
                inner.state = SessionState::Disconnecting;
            }
        }
        self.drain_streams(|state| {
            if matches!(state, StreamState::HeaderComplete | StreamState::Body) {
                ProxyError::StreamReset
            } else {
                ProxyError::Protocol("origin session lost".into())
            }
        });
    }

    fn drain_streams(&self, error_for: impl Fn(StreamState) -> ProxyError) {
        let drained: Vec<StreamData> = {
            let mut inner = self.inner.lock().unwrap();
            let keys: Vec<StreamKey> = inner.streams.iter().map(|(key, _)| key).collect();
            keys.into_iter()
                .filter_map(|key| inner.streams.try_remove(key))
                .collect()
        };
        for entry in drained {
            let mut d = entry.downstream.lock().unwrap();
            if d.response_state.is_terminal() {
                continue;
            }
            let err = error_for(d.response_state);
            d.response_state = StreamState::MsgReset;
            d.send_response_event(ResponseEvent::Error(err));
        }
    }

    #[cfg(test)]
    fn insert_test_stream(
        &self,
        downstream: SharedDownstream,
        releaser: Box<dyn WindowReleaser>,
    ) -> StreamKey {
        self.inner.lock().unwrap().streams.insert(StreamData {
            downstream,
            send: None,
            releaser: Some(releaser),
            seq: None,
        })
    }
}

fn h2_tls_connector() -> Result<tokio_rustls::TlsConnector, ProxyError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

fn map_h2_error(err: h2::Error) -> ProxyError {
    if err.reason().is_some() {
        ProxyError::StreamReset
    } else {
        ProxyError::Protocol(err.to_string())
    }
}

fn to_h2_request(built: &BuiltRequest) -> Result<http::Request<()>, ProxyError> {
    let map_err = |err: http::Error| ProxyError::Protocol(err.to_string());

    let uri = if built.scheme.is_none() {
        http::Uri::builder()
            .authority(built.authority.as_str())
            .build()
            .map_err(map_err)?
    } else {
        http::Uri::builder()
            .scheme(built.scheme.as_deref().unwrap_or("http"))
            .authority(built.authority.as_str())
            .path_and_query(built.path.as_deref().unwrap_or("/"))
            .build()
            .map_err(map_err)?
    };

    let mut request = http::Request::builder()
        .method(built.method.clone())
        .uri(uri)
        .body(())
        .map_err(map_err)?;
    *request.headers_mut() = built.headers.clone();

    if built.authority_placement == AuthorityPlacement::HostHeader {
        if let Ok(value) = HeaderValue::from_str(&built.authority) {
            request.headers_mut().insert(http::header::HOST, value);
        }
    }
    if let Some(proto) = built.protocol {
        request
            .extensions_mut()
            .insert(h2::ext::Protocol::from_static(proto));
    }
    Ok(request)
}

/// The request data provider: defers while the body buffer is empty,
/// signals EOF once the buffer drains with the request complete, and
/// finishes with trailers when present (keeping END_STREAM off the last
/// data frame).
async fn run_body_pump(
    downstream: SharedDownstream,
    send: Arc<StdMutex<SendStream<Bytes>>>,
    wake: Arc<tokio::sync::Notify>,
) {
    enum Step {
        Send(Bytes),
        Finish(Option<http::HeaderMap>),
        Wait,
    }

    loop {
        let notified = wake.notified();
        let step = {
            let mut d = downstream.lock().unwrap();
            if let Some(chunk) = d.request_buf.pop_front() {
                Step::Send(chunk)
            } else if d.request_state == StreamState::MsgComplete && eof_ready(&d) {
                Step::Finish(d.request.trailers.clone())
            } else {
                Step::Wait
            }
        };

        match step {
            Step::Wait => notified.await,
            Step::Send(mut chunk) => {
                while !chunk.is_empty() {
                    send.lock().unwrap().reserve_capacity(chunk.len());
                    let granted = futures_util::future::poll_fn(|cx| {
                        send.lock().unwrap().poll_capacity(cx)
                    })
                    .await;
                    let n = match granted {
                        Some(Ok(0)) => continue,
                        Some(Ok(n)) => n.min(chunk.len()),
                        Some(Err(err)) => {
                            debug!(error = %err, "request body capacity lost");
                            return;
                        }
                        None => return,
                    };
                    let piece = chunk.split_to(n);
                    if let Err(err) = send.lock().unwrap().send_data(piece, false) {
                        debug!(error = %err, "request body send failed");
                        return;
                    }
                    downstream.lock().unwrap().reset_write_deadline();
                }
            }
            Step::Finish(trailers) => {
                let mut stream = send.lock().unwrap();
                let result = match trailers {
                    Some(trailers) if !trailers.is_empty() => stream.send_trailers(trailers),
                    _ => stream.send_data(Bytes::new(), true),
                };
                if let Err(err) = result {
                    debug!(error = %err, "request end send failed");
                }
                return;
            }
        }
    }
}

/// EOF is withheld for upgrade requests until the upgrade response header
/// has been seen without the tunnel being established.
fn eof_ready(d: &crate::downstream::Downstream) -> bool {
    !d.request.upgrade_request
        || (d.response_state == StreamState::HeaderComplete && !d.upgraded)
}

async fn run_response(
    session: Arc<Http2Session>,
    key: StreamKey,
    downstream: SharedDownstream,
    response: h2::client::ResponseFuture,
) {
    let resp = match response.await {
        Ok(resp) => resp,
        Err(err) => {
            let mut d = downstream.lock().unwrap();
            d.response_state = StreamState::MsgReset;
            d.send_response_event(ResponseEvent::Error(map_h2_error(err)));
            return;
        }
    };

    let (parts, mut body) = resp.into_parts();
    session.set_releaser(key, Box::new(H2FlowReleaser(body.flow_control().clone())));

    {
        let mut d = downstream.lock().unwrap();
        d.response.status = parts.status;
        d.response.headers = parts.headers.clone();
        d.response_state = StreamState::HeaderComplete;
        let tunnel = d.request.method == Method::CONNECT
            || d.request.connect_proto != ConnectProto::None;
        if tunnel && parts.status.is_success() {
            d.upgraded = true;
        }
        d.reset_read_deadline();
        d.send_response_event(ResponseEvent::Headers {
            status: parts.status,
            headers: parts.headers,
        });
        // The EOF decision for upgrade requests may have changed.
        d.body_wake.notify_one();
    }

    loop {
        match body.data().await {
            Some(Ok(chunk)) => {
                let mut d = downstream.lock().unwrap();
                d.response.unconsumed_body_length += chunk.len() as u64;
                d.response_state = StreamState::Body;
                d.reset_read_deadline();
                d.send_response_event(ResponseEvent::Data(chunk));
            }
            Some(Err(err)) => {
                let mut d = downstream.lock().unwrap();
                d.response_state = StreamState::MsgReset;
                d.send_response_event(ResponseEvent::Error(map_h2_error(err)));
                return;
            }
            None => break,
        }
    }

    match body.trailers().await {
        Ok(trailers) => {
            let mut d = downstream.lock().unwrap();
            if let Some(trailers) = trailers {
                d.response.trailers = Some(trailers.clone());
                d.send_response_event(ResponseEvent::Trailers(trailers));
            }
            d.response_state = StreamState::MsgComplete;
            d.disable_read_deadline();
            d.send_response_event(ResponseEvent::End);
        }
        Err(err) => {
            let mut d = downstream.lock().unwrap();
            d.response_state = StreamState::MsgReset;
            d.send_response_event(ResponseEvent::Error(map_h2_error(err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownstreamConfig, OriginProtocol};
    use crate::downstream::{Downstream, RequestCtx};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingReleaser {
        released: Arc<AtomicUsize>,
    }

    impl WindowReleaser for RecordingReleaser {
        fn release(&mut self, n: usize) {
            self.released.fetch_add(n, Ordering::SeqCst);
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "origin.internal".to_string(),
            port: 3000,
            tls: false,
            upgrade_scheme: false,
            protocol: OriginProtocol::Http2,
        }
    }

    fn session() -> Arc<Http2Session> {
        Http2Session::new(
            endpoint(),
            Arc::new(HttpOptions::default()),
            "gateway".to_string(),
        )
    }

    fn downstream() -> SharedDownstream {
        let config = Arc::new(DownstreamConfig::new(1, vec![], HttpOptions::default()));
        Downstream::new(
            RequestCtx::default(),
            config,
            Duration::from_secs(30),
            Duration::from_secs(30),
        )
        .shared()
    }

    #[tokio::test]
    async fn detach_consumes_residual_exactly_once() {
        let session = session();
        let d = downstream();
        d.lock().unwrap().response.unconsumed_body_length = 4096;
        let released = Arc::new(AtomicUsize::new(0));
        let key = session.insert_test_stream(
            Arc::clone(&d),
            Box::new(RecordingReleaser {
                released: Arc::clone(&released),
            }),
        );

        session.detach_downstream(key);
        assert_eq!(released.load(Ordering::SeqCst), 4096);
        assert_eq!(d.lock().unwrap().response.unconsumed_body_length, 0);
        assert_eq!(session.stream_count(), 0);

        // Re-entrant detach is a no-op.
        session.detach_downstream(key);
        assert_eq!(released.load(Ordering::SeqCst), 4096);
    }

    #[tokio::test]
    async fn flow_control_conservation() {
        let session = session();
        let d = downstream();
        let released = Arc::new(AtomicUsize::new(0));
        let key = session.insert_test_stream(
            Arc::clone(&d),
            Box::new(RecordingReleaser {
                released: Arc::clone(&released),
            }),
        );

        // The response task delivered 10000 bytes.
        d.lock().unwrap().response.unconsumed_body_length = 10_000;

        session.consume(key, 3_000);
        session.consume(key, 2_500);
        assert_eq!(d.lock().unwrap().response.unconsumed_body_length, 4_500);

        session.detach_downstream(key);
        // Released via consume plus the residual on detach equals the bytes
        // delivered by the session.
        assert_eq!(released.load(Ordering::SeqCst), 10_000);
    }

    #[tokio::test]
    async fn attach_clears_upgrade_for_plain_requests() {
        let session = session();
        let d = downstream();
        d.lock().unwrap().request.upgrade_request = true;
        session.attach_downstream(Arc::clone(&d));
        assert!(!d.lock().unwrap().request.upgrade_request);

        let ws = downstream();
        {
            let mut guard = ws.lock().unwrap();
            guard.request.upgrade_request = true;
            guard.request.connect_proto = ConnectProto::Websocket;
        }
        session.attach_downstream(Arc::clone(&ws));
        assert!(ws.lock().unwrap().request.upgrade_request);
    }

    #[tokio::test]
    async fn push_outside_connected_marks_pending() {
        let session = session();
        let d = downstream();
        let key = session.attach_downstream(Arc::clone(&d));

        assert!(!session.can_push_request());
        session.push_request_headers(key).await.unwrap();

        assert!(d.lock().unwrap().request_pending);
        // The dial state machine was kicked out of Disconnected.
        assert_ne!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connection_loss_drains_streams_as_errors() {
        let session = session();
        let d = downstream();
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.lock().unwrap().response_events = Some(tx);
        session.attach_downstream(Arc::clone(&d));

        session.on_connection_closed();

        match rx.recv().await {
            Some(ResponseEvent::Error(err)) => {
                assert_eq!(err.status(), http::StatusCode::BAD_GATEWAY);
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(session.stream_count(), 0);
        assert_eq!(
            d.lock().unwrap().response_state,
            StreamState::MsgReset
        );
    }

    #[tokio::test]
    async fn started_response_is_aborted_on_connection_loss() {
        let session = session();
        let d = downstream();
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut guard = d.lock().unwrap();
            guard.response_events = Some(tx);
            guard.response_state = StreamState::Body;
        }
        session.attach_downstream(Arc::clone(&d));

        session.on_connection_closed();

        match rx.recv().await {
            Some(ResponseEvent::Error(ProxyError::StreamReset)) => {}
            other => panic!("expected stream reset, got {other:?}"),
        }
    }

    #[test]
    fn connect_request_uri_is_authority_form() {
        let built = BuiltRequest {
            method: Method::CONNECT,
            scheme: None,
            authority: "tunnel.example.com:443".to_string(),
            authority_placement: AuthorityPlacement::PseudoHeader,
            path: None,
            protocol: None,
            headers: http::HeaderMap::new(),
            expects_body: true,
        };
        let request = to_h2_request(&built).unwrap();
        assert_eq!(request.uri().authority().unwrap(), "tunnel.example.com:443");
        assert!(request.uri().path_and_query().is_none());
    }

    #[test]
    fn websocket_request_carries_protocol_extension() {
        let built = BuiltRequest {
            method: Method::CONNECT,
            scheme: Some("https".to_string()),
            authority: "app.example.com".to_string(),
            authority_placement: AuthorityPlacement::PseudoHeader,
            path: Some("/chat".to_string()),
            protocol: Some("websocket"),
            headers: http::HeaderMap::new(),
            expects_body: true,
        };
        let request = to_h2_request(&built).unwrap();
        assert!(request.extensions().get::<h2::ext::Protocol>().is_some());
        assert_eq!(request.uri().path(), "/chat");
    }
}
