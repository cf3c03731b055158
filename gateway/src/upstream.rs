use bytes::Bytes;
use futures_util::stream;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Response, StatusCode, Version};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::config::{DownstreamAddrGroup, Endpoint, OriginProtocol};
use crate::dconn::{
    dial_h1, DownstreamConnection, Http1DownstreamConnection, Http2DownstreamConnection,
    Http3DownstreamConnection,
};
use crate::downstream::{
    ClientInfo, ConnectProto, Downstream, RequestCtx, ResponseEvent, SharedDownstream,
    StreamState,
};
use crate::error::ProxyError;
use crate::pool::PoolKey;
use crate::worker::WorkerContext;

/// Response body handed back to hyper; an error mid-stream resets the
/// client-side stream.
pub type UpstreamBody = http_body_util::combinators::BoxBody<Bytes, io::Error>;

/// Serve one accepted client connection on this worker: TLS with ALPN
/// selection between h2 and http/1.1 when configured, plain HTTP/1.1
/// otherwise.
pub async fn serve_tcp_connection(ctx: Arc<WorkerContext>, stream: TcpStream, peer: SocketAddr) {
    let local_hostport = stream
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let client = ClientInfo {
        peer_ip: peer.ip().to_string(),
        local_hostport,
        tls_handshake_finished: true,
    };

    match ctx.tls.clone() {
        Some(tls) => {
            let tls_stream = match tls.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            let is_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
            let client = ClientInfo {
                tls_handshake_finished: true,
                ..client
            };
            serve_http(ctx, TokioIo::new(tls_stream), client, is_h2, "https").await;
        }
        None => {
            serve_http(ctx, TokioIo::new(stream), client, false, "http").await;
        }
    }
}

async fn serve_http<I>(
    ctx: Arc<WorkerContext>,
    io: I,
    client: ClientInfo,
    is_h2: bool,
    scheme: &'static str,
) where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req: http::Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        let client = client.clone();
        async move { handle_request(ctx, client, scheme, req).await }
    });

    if is_h2 {
        let result = http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await;
        if let Err(err) = result {
            debug!(error = %err, "serving HTTP/2 connection failed");
        }
    } else {
        let result = http1::Builder::new().serve_connection(io, service).await;
        if let Err(err) = result {
            debug!(error = %err, "serving HTTP/1.1 connection failed");
        }
    }
}

async fn handle_request(
    ctx: Arc<WorkerContext>,
    client: ClientInfo,
    scheme: &'static str,
    req: http::Request<Incoming>,
) -> Result<Response<UpstreamBody>, Infallible> {
    match proxy_request(ctx, client, scheme, req).await {
        Ok(response) => Ok(response),
        Err(err) => {
            error!(error = %err, "request failed");
            Ok(error_response(&err))
        }
    }
}

async fn proxy_request(
    ctx: Arc<WorkerContext>,
    client: ClientInfo,
    scheme: &'static str,
    req: http::Request<Incoming>,
) -> Result<Response<UpstreamBody>, ProxyError> {
    let config = ctx.config.current();
    let (parts, body) = req.into_parts();

    let authority = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let group = config
        .find_group(&authority, parts.uri.path())
        .ok_or(ProxyError::NoRoute)?
        .clone();

    let request = request_ctx_from_parts(&parts, &authority, scheme);
    let downstream = Downstream::new(
        request,
        Arc::clone(&config),
        ctx.settings.read_timeout,
        ctx.settings.write_timeout,
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let downstream: SharedDownstream = downstream.shared();
    {
        let mut d = downstream.lock().unwrap();
        d.client = client;
        d.response_events = Some(events_tx);
    }

    let retry_limit = group.retry_limit.max(1);
    let mut body = Some(body);
    let mut attempt = 0;
    let mut last_error = ProxyError::Overloaded;

    let (conn, status, headers) = loop {
        attempt += 1;
        if attempt > retry_limit {
            return Err(last_error);
        }

        let endpoint = ctx
            .next_endpoint(&group)
            .cloned()
            .ok_or(ProxyError::NoRoute)?;
        trace!(
            group = %group.name,
            endpoint = %endpoint.hostport(),
            attempt,
            "forwarding request"
        );

        let conn = match open_origin_conn(&ctx, &group, &endpoint, Arc::clone(&downstream)).await
        {
            Ok(conn) => conn,
            Err(err @ ProxyError::Dial(_)) => {
                last_error = err;
                continue;
            }
            Err(err) => return Err(err),
        };
        let dconn = conn.dconn();

        if let Err(err) = dconn.push_request_headers().await {
            match err {
                ProxyError::Dial(_) if !header_sent(&downstream) => {
                    last_error = err;
                    continue;
                }
                err => return Err(err),
            }
        }

        if let Some(body) = body.take() {
            spawn_request_body_pump(body, conn.dconn(), Arc::clone(&downstream));
        }

        match first_response_event(&ctx, &mut events_rx, &dconn).await? {
            FirstEvent::Headers { status, headers } => break (conn, status, headers),
            FirstEvent::RetryableDial(err) => {
                if header_sent(&downstream) {
                    return Err(err);
                }
                last_error = err;
                continue;
            }
        }
    };

    Ok(streaming_response(ctx, conn, status, headers, events_rx))
}

fn header_sent(downstream: &SharedDownstream) -> bool {
    downstream.lock().unwrap().request_header_sent
}

enum FirstEvent {
    Headers {
        status: StatusCode,
        headers: HeaderMap,
    },
    RetryableDial(ProxyError),
}

async fn first_response_event(
    ctx: &Arc<WorkerContext>,
    events: &mut mpsc::UnboundedReceiver<ResponseEvent>,
    dconn: &Arc<dyn DownstreamConnection>,
) -> Result<FirstEvent, ProxyError> {
    loop {
        let event = tokio::time::timeout(ctx.settings.read_timeout, events.recv()).await;
        match event {
            Err(_) => {
                dconn.on_timeout();
                return Err(ProxyError::Timeout);
            }
            Ok(None) => return Err(ProxyError::Protocol("response channel closed".into())),
            Ok(Some(ResponseEvent::Headers { status, headers })) => {
                return Ok(FirstEvent::Headers { status, headers });
            }
            Ok(Some(ResponseEvent::Error(err @ ProxyError::Dial(_)))) => {
                return Ok(FirstEvent::RetryableDial(err));
            }
            Ok(Some(ResponseEvent::Error(err))) => return Err(err),
            Ok(Some(_)) => continue,
        }
    }
}

enum OriginConn {
    H1(Arc<Http1DownstreamConnection>, PoolKey),
    H2(Arc<Http2DownstreamConnection>),
    H3(Arc<Http3DownstreamConnection>),
}

impl OriginConn {
    fn dconn(&self) -> Arc<dyn DownstreamConnection> {
        match self {
            OriginConn::H1(conn, _) => Arc::clone(conn) as Arc<dyn DownstreamConnection>,
            OriginConn::H2(conn) => Arc::clone(conn) as Arc<dyn DownstreamConnection>,
            OriginConn::H3(conn) => Arc::clone(conn) as Arc<dyn DownstreamConnection>,
        }
    }

    /// Clean completion: h1 sockets go back to the idle pool, h2 streams
    /// detach from their shared session.
    async fn finish(self, ctx: &Arc<WorkerContext>) {
        match self {
            OriginConn::H1(conn, key) => {
                if let Some(pooled) = conn.take_back() {
                    ctx.h1_pool.release(key, pooled).await;
                }
            }
            OriginConn::H2(conn) => conn.detach(),
            OriginConn::H3(_) => {}
        }
    }
}

async fn open_origin_conn(
    ctx: &Arc<WorkerContext>,
    group: &DownstreamAddrGroup,
    endpoint: &Endpoint,
    downstream: SharedDownstream,
) -> Result<OriginConn, ProxyError> {
    let options = {
        let d = downstream.lock().unwrap();
        Arc::new(d.config.http.clone())
    };
    let via_token = ctx.settings.via_token.clone();

    match endpoint.protocol {
        OriginProtocol::Http2 => {
            let session = ctx.session_for(&group.name, endpoint, options);
            Ok(OriginConn::H2(Arc::new(Http2DownstreamConnection::new(
                session, downstream,
            ))))
        }
        OriginProtocol::Http1 => {
            let key = PoolKey {
                group: group.name.clone(),
                endpoint: endpoint.clone(),
            };
            let pooled = match ctx.h1_pool.acquire(&key).await {
                Some(pooled) => pooled,
                None => dial_h1(endpoint).await?,
            };
            Ok(OriginConn::H1(
                Arc::new(Http1DownstreamConnection::new(
                    downstream,
                    endpoint.clone(),
                    options,
                    via_token,
                    pooled,
                )),
                key,
            ))
        }
        OriginProtocol::Http3 => Ok(OriginConn::H3(Arc::new(Http3DownstreamConnection::new(
            downstream,
            endpoint.clone(),
            options,
            via_token,
            Arc::clone(&ctx.h3_pool),
        )))),
    }
}

fn spawn_request_body_pump(
    body: Incoming,
    dconn: Arc<dyn DownstreamConnection>,
    downstream: SharedDownstream,
) {
    tokio::spawn(async move {
        let mut body = body;
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => {
                        if !data.is_empty() {
                            dconn.push_upload_data_chunk(data);
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            downstream.lock().unwrap().request.trailers = Some(trailers);
                        }
                    }
                },
                Err(err) => {
                    debug!(error = %err, "client request body failed");
                    downstream.lock().unwrap().request_state = StreamState::MsgReset;
                    return;
                }
            }
        }
        dconn.end_upload_data();
    });
}

struct BodyStreamState {
    events: mpsc::UnboundedReceiver<ResponseEvent>,
    conn: Option<OriginConn>,
    ctx: Arc<WorkerContext>,
}

fn streaming_response(
    ctx: Arc<WorkerContext>,
    conn: OriginConn,
    status: StatusCode,
    headers: HeaderMap,
    events: mpsc::UnboundedReceiver<ResponseEvent>,
) -> Response<UpstreamBody> {
    let state = BodyStreamState {
        events,
        conn: Some(conn),
        ctx,
    };

    let body_stream = stream::unfold(state, |mut state| async move {
        loop {
            match state.events.recv().await {
                Some(ResponseEvent::Data(data)) => {
                    if let Some(conn) = &state.conn {
                        conn.dconn().resume_read(data.len());
                    }
                    return Some((Ok(Frame::data(data)), state));
                }
                Some(ResponseEvent::Trailers(trailers)) => {
                    return Some((Ok(Frame::trailers(trailers)), state));
                }
                Some(ResponseEvent::End) | None => {
                    if let Some(conn) = state.conn.take() {
                        let ctx = Arc::clone(&state.ctx);
                        conn.finish(&ctx).await;
                    }
                    return None;
                }
                Some(ResponseEvent::Error(err)) => {
                    // Dropping the conn aborts the origin side.
                    state.conn.take();
                    return Some((Err(io::Error::other(err.to_string())), state));
                }
                Some(ResponseEvent::Headers { .. }) => continue,
            }
        }
    });

    let mut response = Response::new(StreamBody::new(body_stream).boxed());
    *response.status_mut() = status;
    *response.headers_mut() = filter_response_headers(headers);
    response
}

fn filter_response_headers(headers: HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        match name.as_str() {
            "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
            | "upgrade" => continue,
            _ => {
                out.append(name.clone(), value.clone());
            }
        }
    }
    out
}

fn error_response(err: &ProxyError) -> Response<UpstreamBody> {
    let body = Full::new(Bytes::from(err.to_string()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = err.status();
    response.headers_mut().insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn request_ctx_from_parts(
    parts: &http::request::Parts,
    authority: &str,
    scheme: &'static str,
) -> RequestCtx {
    let (http_major, http_minor) = match parts.version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_11 => (1, 1),
        Version::HTTP_2 => (2, 0),
        _ => (3, 0),
    };

    let content_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let chunked = parts
        .headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let mut connect_proto = ConnectProto::None;
    let mut upgrade_request = false;

    if parts.method == Method::CONNECT {
        // Extended CONNECT carries :protocol on HTTP/2 and later.
        connect_proto = match parts.extensions.get::<hyper::ext::Protocol>() {
            Some(proto) if proto.as_str().eq_ignore_ascii_case("websocket") => {
                ConnectProto::Websocket
            }
            Some(_) => ConnectProto::Extended,
            None => ConnectProto::None,
        };
    } else if is_websocket_upgrade(parts) {
        connect_proto = ConnectProto::Websocket;
        upgrade_request = true;
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    RequestCtx {
        method: parts.method.clone(),
        scheme: scheme.to_string(),
        authority: authority.to_string(),
        path,
        headers: parts.headers.clone(),
        trailers: None,
        content_length,
        chunked,
        upgrade_request,
        connect_proto,
        no_authority: authority.is_empty(),
        http_major,
        http_minor,
        expect_body: chunked,
        unconsumed_body_length: 0,
    }
}

fn is_websocket_upgrade(parts: &http::request::Parts) -> bool {
    parts.method == Method::GET
        && parts.version == Version::HTTP_11
        && header_has_token(&parts.headers, "connection", "upgrade")
        && header_has_token(&parts.headers, "upgrade", "websocket")
        && parts.headers.get("sec-websocket-key").is_some()
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts_for(req: http::request::Builder) -> http::request::Parts {
        let (parts, _) = req.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn request_ctx_detects_websocket_upgrade() {
        let parts = parts_for(
            http::Request::builder()
                .method(Method::GET)
                .uri("/chat")
                .version(Version::HTTP_11)
                .header("connection", "keep-alive, Upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        );
        let ctx = request_ctx_from_parts(&parts, "app.example.com", "https");
        assert_eq!(ctx.connect_proto, ConnectProto::Websocket);
        assert!(ctx.upgrade_request);
        assert_eq!(ctx.http_major, 1);
        assert_eq!(ctx.http_minor, 1);
    }

    #[test]
    fn request_ctx_parses_body_intent() {
        let parts = parts_for(
            http::Request::builder()
                .method(Method::POST)
                .uri("/upload")
                .header(CONTENT_LENGTH, "42"),
        );
        let ctx = request_ctx_from_parts(&parts, "a", "http");
        assert_eq!(ctx.content_length, Some(42));
        assert!(!ctx.chunked);

        let parts = parts_for(
            http::Request::builder()
                .method(Method::POST)
                .uri("/upload")
                .header(TRANSFER_ENCODING, "chunked"),
        );
        let ctx = request_ctx_from_parts(&parts, "a", "http");
        assert!(ctx.chunked);
        assert!(ctx.expect_body);
    }

    #[test]
    fn error_response_maps_status() {
        let resp = error_response(&ProxyError::Timeout);
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        let resp = error_response(&ProxyError::Dial("x".into()));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn response_header_filter_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("content-type", "text/html".parse().unwrap());
        let filtered = filter_response_headers(headers);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert_eq!(filtered.get("content-type").unwrap(), "text/html");
    }
}
