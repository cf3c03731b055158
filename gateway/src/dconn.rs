use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http::header::HeaderValue;
use http::Method;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::config::{Endpoint, HttpOptions};
use crate::downstream::{ResponseEvent, SharedDownstream, StreamState};
use crate::error::ProxyError;
use crate::h2_session::{Http2Session, StreamKey};
use crate::h3_pool::H3ConnectionPool;
use crate::http_rewrite::{build_request, BuiltRequest};
use crate::pool::PoolEntry;

pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

/// The capability "send this Downstream to an origin and deliver its
/// response", independent of the origin protocol.
#[async_trait]
pub trait DownstreamConnection: Send + Sync {
    /// Submit the (rewritten) request head. May queue when the underlying
    /// session is still coming up.
    async fn push_request_headers(&self) -> Result<(), ProxyError>;

    /// Hand over a chunk of request body. Chunks arriving before the header
    /// block is on the wire are parked in the blocked buffer.
    fn push_upload_data_chunk(&self, data: Bytes);

    /// The client finished sending the request body.
    fn end_upload_data(&self);

    /// `consumed` response-body bytes were forwarded to the client; release
    /// them to the origin's flow-control window.
    fn resume_read(&self, consumed: usize);

    /// Downstream read/write timer fired.
    fn on_timeout(&self);

    /// Unbind the Downstream from the origin.
    fn detach(&self);
}

fn buffer_upload_chunk(downstream: &SharedDownstream, data: Bytes) {
    let mut d = downstream.lock().unwrap();
    if !d.request_header_sent {
        d.push_blocked_request_data(data);
        return;
    }
    d.request_buf.push_back(data);
    d.ensure_write_deadline();
    d.body_wake.notify_one();
}

fn finish_upload(downstream: &SharedDownstream) {
    let mut d = downstream.lock().unwrap();
    if !d.request_header_sent {
        d.blocked_request_data_eof = true;
        return;
    }
    d.request_state = StreamState::MsgComplete;
    d.body_wake.notify_one();
}

fn deliver_error(downstream: &SharedDownstream, error: ProxyError) {
    let mut d = downstream.lock().unwrap();
    d.response_state = StreamState::MsgReset;
    d.send_response_event(ResponseEvent::Error(error));
}

// ---------------------------------------------------------------------------
// HTTP/2: a stream on a shared multiplexed session.

pub struct Http2DownstreamConnection {
    session: Arc<Http2Session>,
    key: StreamKey,
    downstream: SharedDownstream,
}

impl Http2DownstreamConnection {
    pub fn new(session: Arc<Http2Session>, downstream: SharedDownstream) -> Self {
        let key = session.attach_downstream(Arc::clone(&downstream));
        Self {
            session,
            key,
            downstream,
        }
    }
}

#[async_trait]
impl DownstreamConnection for Http2DownstreamConnection {
    async fn push_request_headers(&self) -> Result<(), ProxyError> {
        self.session.push_request_headers(self.key).await
    }

    fn push_upload_data_chunk(&self, data: Bytes) {
        buffer_upload_chunk(&self.downstream, data);
    }

    fn end_upload_data(&self) {
        finish_upload(&self.downstream);
    }

    fn resume_read(&self, consumed: usize) {
        if consumed > 0 {
            self.session.consume(self.key, consumed);
        }
    }

    fn on_timeout(&self) {
        self.session.reset_stream(self.key, h2::Reason::NO_ERROR);
    }

    fn detach(&self) {
        self.session.detach_downstream(self.key);
    }
}

impl Drop for Http2DownstreamConnection {
    fn drop(&mut self) {
        self.session.detach_downstream(self.key);
    }
}

// ---------------------------------------------------------------------------
// HTTP/1: an exclusive pooled socket driven through hyper's http1 client.

/// Idle HTTP/1 origin connection as cached by the worker's pool.
pub struct PooledH1 {
    pub sender: hyper::client::conn::http1::SendRequest<ProxyBody>,
}

impl PoolEntry for PooledH1 {
    fn is_healthy(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Dial a fresh HTTP/1 origin connection.
pub async fn dial_h1(endpoint: &Endpoint) -> Result<PooledH1, ProxyError> {
    let addr = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|err| ProxyError::Dial(format!("resolve {}: {err}", endpoint.host)))?
        .next()
        .ok_or_else(|| ProxyError::Dial(format!("resolve {}: no addresses", endpoint.host)))?;
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|err| ProxyError::Dial(format!("connect {addr}: {err}")))?;
    let _ = tcp.set_nodelay(true);

    if endpoint.tls {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let name = rustls::pki_types::ServerName::try_from(endpoint.host.clone())
            .map_err(|_| ProxyError::Dial(format!("invalid server name {}", endpoint.host)))?;
        let io = connector
            .connect(name, tcp)
            .await
            .map_err(|err| ProxyError::Dial(format!("tls {}: {err}", endpoint.host)))?;
        handshake_h1(io).await
    } else {
        handshake_h1(tcp).await
    }
}

async fn handshake_h1<T>(io: T) -> Result<PooledH1, ProxyError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|err| ProxyError::Dial(format!("h1 handshake: {err}")))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "h1 origin connection closed");
        }
    });
    Ok(PooledH1 { sender })
}

pub struct Http1DownstreamConnection {
    downstream: SharedDownstream,
    endpoint: Endpoint,
    options: Arc<HttpOptions>,
    via_token: String,
    sender: StdMutex<Option<PooledH1>>,
}

impl Http1DownstreamConnection {
    pub fn new(
        downstream: SharedDownstream,
        endpoint: Endpoint,
        options: Arc<HttpOptions>,
        via_token: String,
        conn: PooledH1,
    ) -> Self {
        Self {
            downstream,
            endpoint,
            options,
            via_token,
            sender: StdMutex::new(Some(conn)),
        }
    }

    /// Reclaim the connection for the pool after a clean exchange.
    pub fn take_back(&self) -> Option<PooledH1> {
        self.sender.lock().unwrap().take()
    }
}

#[async_trait]
impl DownstreamConnection for Http1DownstreamConnection {
    async fn push_request_headers(&self) -> Result<(), ProxyError> {
        let mut pooled = self
            .sender
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ProxyError::Protocol("h1 connection already consumed".into()))?;

        let built = {
            let mut d = self.downstream.lock().unwrap();
            d.request_pending = false;
            build_request(
                &d.request,
                &self.endpoint,
                &self.options,
                &d.client,
                &self.via_token,
            )
        };
        if built.method == Method::CONNECT {
            return Err(ProxyError::Protocol(
                "tunnel requests need an http/2 origin".into(),
            ));
        }

        let (body, pump_tx) = if built.expects_body {
            let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
            (channel_body(rx), Some(tx))
        } else {
            (empty_body(), None)
        };

        let request = h1_request(&built, body)?;

        let wake = {
            let mut d = self.downstream.lock().unwrap();
            d.request_header_sent = true;
            d.promote_blocked_request();
            if built.expects_body {
                d.reset_write_deadline();
            }
            Arc::clone(&d.body_wake)
        };

        if let Some(tx) = pump_tx {
            tokio::spawn(run_h1_body_pump(Arc::clone(&self.downstream), tx, wake));
        }

        pooled
            .sender
            .ready()
            .await
            .map_err(|err| ProxyError::Dial(format!("h1 not ready: {err}")))?;
        let response = pooled.sender.send_request(request);
        *self.sender.lock().unwrap() = Some(pooled);

        tokio::spawn(run_h1_response(Arc::clone(&self.downstream), response));
        Ok(())
    }

    fn push_upload_data_chunk(&self, data: Bytes) {
        buffer_upload_chunk(&self.downstream, data);
    }

    fn end_upload_data(&self) {
        finish_upload(&self.downstream);
    }

    fn resume_read(&self, _consumed: usize) {
        // hyper manages the h1 socket's read window itself.
    }

    fn on_timeout(&self) {
        // Dropping the sender tears the socket down.
        self.sender.lock().unwrap().take();
    }

    fn detach(&self) {}
}

fn h1_request(built: &BuiltRequest, body: ProxyBody) -> Result<http::Request<ProxyBody>, ProxyError> {
    let mut request = http::Request::builder()
        .method(built.method.clone())
        .uri(built.path.as_deref().unwrap_or("/"))
        .body(body)
        .map_err(|err| ProxyError::Protocol(err.to_string()))?;
    *request.headers_mut() = built.headers.clone();
    if let Ok(value) = HeaderValue::from_str(&built.authority) {
        request.headers_mut().insert(http::header::HOST, value);
    }
    Ok(request)
}

fn channel_body(rx: mpsc::Receiver<Result<Frame<Bytes>, Infallible>>) -> ProxyBody {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    StreamBody::new(stream).boxed()
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).boxed()
}

async fn run_h1_body_pump(
    downstream: SharedDownstream,
    tx: mpsc::Sender<Result<Frame<Bytes>, Infallible>>,
    wake: Arc<Notify>,
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
            } else if d.request_state == StreamState::MsgComplete {
                Step::Finish(d.request.trailers.clone())
            } else {
                Step::Wait
            }
        };
        match step {
            Step::Wait => notified.await,
            Step::Send(chunk) => {
                if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                    return;
                }
                downstream.lock().unwrap().reset_write_deadline();
            }
            Step::Finish(trailers) => {
                if let Some(trailers) = trailers {
                    if !trailers.is_empty() {
                        let _ = tx.send(Ok(Frame::trailers(trailers))).await;
                    }
                }
                return;
            }
        }
    }
}

async fn run_h1_response<F>(downstream: SharedDownstream, response: F)
where
    F: std::future::Future<Output = hyper::Result<http::Response<hyper::body::Incoming>>>
        + Send
        + 'static,
{
    let resp = match response.await {
        Ok(resp) => resp,
        Err(err) => {
            deliver_error(&downstream, ProxyError::Protocol(err.to_string()));
            return;
        }
    };

    let (parts, mut body) = resp.into_parts();
    {
        let mut d = downstream.lock().unwrap();
        d.response.status = parts.status;
        d.response.headers = parts.headers.clone();
        d.response_state = StreamState::HeaderComplete;
        d.reset_read_deadline();
        d.send_response_event(ResponseEvent::Headers {
            status: parts.status,
            headers: parts.headers,
        });
    }

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => match frame.into_data() {
                Ok(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    let mut d = downstream.lock().unwrap();
                    d.response_state = StreamState::Body;
                    d.reset_read_deadline();
                    d.send_response_event(ResponseEvent::Data(data));
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        let mut d = downstream.lock().unwrap();
                        d.response.trailers = Some(trailers.clone());
                        d.send_response_event(ResponseEvent::Trailers(trailers));
                    }
                }
            },
            Err(err) => {
                deliver_error(&downstream, ProxyError::Protocol(err.to_string()));
                return;
            }
        }
    }

    let mut d = downstream.lock().unwrap();
    d.response_state = StreamState::MsgComplete;
    d.disable_read_deadline();
    d.send_response_event(ResponseEvent::End);
}

// ---------------------------------------------------------------------------
// HTTP/3: a request stream on a shared quinn connection.

pub struct Http3DownstreamConnection {
    downstream: SharedDownstream,
    endpoint: Endpoint,
    options: Arc<HttpOptions>,
    via_token: String,
    pool: Arc<H3ConnectionPool>,
}

impl Http3DownstreamConnection {
    pub(crate) fn new(
        downstream: SharedDownstream,
        endpoint: Endpoint,
        options: Arc<HttpOptions>,
        via_token: String,
        pool: Arc<H3ConnectionPool>,
    ) -> Self {
        Self {
            downstream,
            endpoint,
            options,
            via_token,
            pool,
        }
    }
}

#[async_trait]
impl DownstreamConnection for Http3DownstreamConnection {
    async fn push_request_headers(&self) -> Result<(), ProxyError> {
        let built = {
            let mut d = self.downstream.lock().unwrap();
            d.request_pending = false;
            build_request(
                &d.request,
                &self.endpoint,
                &self.options,
                &d.client,
                &self.via_token,
            )
        };
        if built.method == Method::CONNECT {
            return Err(ProxyError::Protocol(
                "tunnel requests need an http/2 origin".into(),
            ));
        }

        let request = h3_request(&built)?;
        let mut send_request = self.pool.get_or_connect(&self.endpoint).await?;

        let wake = {
            let mut d = self.downstream.lock().unwrap();
            d.request_header_sent = true;
            d.promote_blocked_request();
            if built.expects_body {
                d.reset_write_deadline();
            }
            Arc::clone(&d.body_wake)
        };

        let downstream = Arc::clone(&self.downstream);
        let pool = Arc::clone(&self.pool);
        let endpoint = self.endpoint.clone();
        let expects_body = built.expects_body;
        tokio::spawn(async move {
            let result = run_h3_exchange(&downstream, &mut send_request, request, expects_body, wake)
                .await;
            if let Err(err) = result {
                warn!(origin = %endpoint.hostport(), error = %err, "h3 exchange failed");
                pool.invalidate(&endpoint).await;
                deliver_error(&downstream, err);
            }
        });
        Ok(())
    }

    fn push_upload_data_chunk(&self, data: Bytes) {
        buffer_upload_chunk(&self.downstream, data);
    }

    fn end_upload_data(&self) {
        finish_upload(&self.downstream);
    }

    fn resume_read(&self, _consumed: usize) {
        // The QUIC stack extends stream windows as data is drained.
    }

    fn on_timeout(&self) {}

    fn detach(&self) {}
}

fn h3_request(built: &BuiltRequest) -> Result<http::Request<()>, ProxyError> {
    let map_err = |err: http::Error| ProxyError::Protocol(err.to_string());
    let uri = http::Uri::builder()
        .scheme(built.scheme.as_deref().unwrap_or("https"))
        .authority(built.authority.as_str())
        .path_and_query(built.path.as_deref().unwrap_or("/"))
        .build()
        .map_err(map_err)?;
    let mut request = http::Request::builder()
        .method(built.method.clone())
        .uri(uri)
        .version(http::Version::HTTP_3)
        .body(())
        .map_err(map_err)?;
    *request.headers_mut() = built.headers.clone();
    Ok(request)
}

enum RequestBodyStep {
    Chunk(Bytes),
    Done,
    Wait,
}

fn h3_request_body_step(downstream: &SharedDownstream) -> RequestBodyStep {
    let mut d = downstream.lock().unwrap();
    if let Some(chunk) = d.request_buf.pop_front() {
        RequestBodyStep::Chunk(chunk)
    } else if d.request_state == StreamState::MsgComplete {
        RequestBodyStep::Done
    } else {
        RequestBodyStep::Wait
    }
}

async fn run_h3_exchange(
    downstream: &SharedDownstream,
    send_request: &mut crate::h3_pool::H3SendRequest,
    request: http::Request<()>,
    expects_body: bool,
    wake: Arc<Notify>,
) -> Result<(), ProxyError> {
    let proto_err = |err: h3::error::StreamError| ProxyError::Protocol(format!("h3: {err}"));

    let mut stream = send_request
        .send_request(request)
        .await
        .map_err(proto_err)?;

    if expects_body {
        loop {
            let notified = wake.notified();
            let step = h3_request_body_step(downstream);
            match step {
                RequestBodyStep::Chunk(chunk) => {
                    stream.send_data(chunk).await.map_err(proto_err)?;
                    downstream.lock().unwrap().reset_write_deadline();
                }
                RequestBodyStep::Done => break,
                RequestBodyStep::Wait => {
                    notified.await;
                    continue;
                }
            }
        }
    }
    stream.finish().await.map_err(proto_err)?;

    let resp = stream.recv_response().await.map_err(proto_err)?;
    {
        let mut d = downstream.lock().unwrap();
        d.response.status = resp.status();
        d.response.headers = resp.headers().clone();
        d.response_state = StreamState::HeaderComplete;
        d.reset_read_deadline();
        d.send_response_event(ResponseEvent::Headers {
            status: resp.status(),
            headers: resp.headers().clone(),
        });
    }

    while let Some(mut chunk) = stream.recv_data().await.map_err(proto_err)? {
        let data = chunk.copy_to_bytes(chunk.remaining());
        if data.is_empty() {
            continue;
        }
        let mut d = downstream.lock().unwrap();
        d.response_state = StreamState::Body;
        d.reset_read_deadline();
        d.send_response_event(ResponseEvent::Data(data));
    }

    let mut d = downstream.lock().unwrap();
    d.response_state = StreamState::MsgComplete;
    d.disable_read_deadline();
    d.send_response_event(ResponseEvent::End);
    Ok(())
}
