use bytes::Bytes;
use gateway::{
    DownstreamAddrGroup, DownstreamConfig, Endpoint, GatewayConfig, GatewayServer, HttpOptions,
    OriginProtocol,
};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

async fn origin_service(
    req: http::Request<Incoming>,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let via = req.headers().get("via").cloned();
    let xff = req.headers().get("x-forwarded-for").cloned();

    let mut response = http::Response::new(Full::new(Bytes::from_static(b"hello from origin")));
    if let Some(via) = via {
        response.headers_mut().insert("echo-via", via);
    }
    if let Some(xff) = xff {
        response.headers_mut().insert("echo-xff", xff);
    }
    Ok(response)
}

async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_service))
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn proxies_to_http1_origin_with_rewritten_headers() {
    let origin_addr = spawn_origin().await;

    let mut http = HttpOptions::default();
    http.xff.add = true;
    let group = DownstreamAddrGroup {
        name: "default".to_string(),
        host: None,
        path_prefix: "/".to_string(),
        endpoints: vec![Endpoint {
            host: "127.0.0.1".to_string(),
            port: origin_addr.port(),
            tls: false,
            upgrade_scheme: false,
            protocol: OriginProtocol::Http1,
        }],
        weight: 1,
        retry_limit: 2,
    };
    let config = DownstreamConfig::new(1, vec![group], http);
    let settings = GatewayConfig {
        num_workers: 1,
        ..GatewayConfig::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let server = GatewayServer::new(settings, config, gateway_addr, None, None);
    let server_task =
        tokio::spawn(async move { server.run_with_listener(listener, shutdown_rx).await });

    let mut client = TcpStream::connect(gateway_addr).await.unwrap();
    client
        .write_all(
            b"GET /hello HTTP/1.1\r\nHost: app.example.com\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("response within deadline")
        .unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("hello from origin"), "got: {response}");
    // The origin observed the rewritten request headers.
    assert!(response.contains("echo-via: 1.1 gateway"), "got: {response}");
    assert!(response.contains("echo-xff: 127.0.0.1"), "got: {response}");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), server_task).await;
}
