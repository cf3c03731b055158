use bytes::Bytes;
use futures_util::future;
use h3::client::SendRequest;
use h3_quinn::OpenStreams;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::config::Endpoint;
use crate::error::ProxyError;

pub(crate) type H3SendRequest = SendRequest<OpenStreams, Bytes>;

#[derive(Clone, Hash, Eq, PartialEq)]
struct H3OriginKey {
    host: String,
    port: u16,
}

impl H3OriginKey {
    fn new(endpoint: &Endpoint) -> Self {
        Self {
            host: endpoint.host.to_ascii_lowercase(),
            port: endpoint.port,
        }
    }
}

struct H3Connection {
    send_request: H3SendRequest,
}

enum H3PoolEntry {
    Ready(H3Connection),
    Connecting(Arc<Notify>),
}

/// Shared HTTP/3 origin connections, one per endpoint, established lazily.
/// Concurrent callers of a connecting endpoint wait for the dial instead of
/// racing their own.
pub(crate) struct H3ConnectionPool {
    endpoint: Mutex<Option<quinn::Endpoint>>,
    entries: Mutex<HashMap<H3OriginKey, H3PoolEntry>>,
}

impl H3ConnectionPool {
    pub(crate) fn new() -> Self {
        Self {
            endpoint: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn get_or_connect(
        &self,
        origin: &Endpoint,
    ) -> Result<H3SendRequest, ProxyError> {
        let key = H3OriginKey::new(origin);
        loop {
            enum Action {
                Ready(H3SendRequest),
                Wait(Arc<Notify>),
                Connect(Arc<Notify>),
            }

            let action = {
                let mut entries = self.entries.lock().await;
                match entries.get(&key) {
                    Some(H3PoolEntry::Ready(conn)) => Action::Ready(conn.send_request.clone()),
                    Some(H3PoolEntry::Connecting(notify)) => Action::Wait(Arc::clone(notify)),
                    None => {
                        let notify = Arc::new(Notify::new());
                        entries.insert(key.clone(), H3PoolEntry::Connecting(Arc::clone(&notify)));
                        Action::Connect(notify)
                    }
                }
            };

            match action {
                Action::Ready(send_request) => return Ok(send_request),
                Action::Wait(notify) => {
                    notify.notified().await;
                }
                Action::Connect(notify) => {
                    let connection = match self.connect(origin).await {
                        Ok(connection) => connection,
                        Err(err) => {
                            let mut entries = self.entries.lock().await;
                            entries.remove(&key);
                            notify.notify_waiters();
                            return Err(err);
                        }
                    };
                    let send_request = connection.send_request.clone();
                    let mut entries = self.entries.lock().await;
                    entries.insert(key, H3PoolEntry::Ready(connection));
                    notify.notify_waiters();
                    return Ok(send_request);
                }
            }
        }
    }

    pub(crate) async fn invalidate(&self, origin: &Endpoint) {
        let key = H3OriginKey::new(origin);
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&key) {
            if let H3PoolEntry::Connecting(notify) = entry {
                notify.notify_waiters();
            }
            debug!(
                host = %origin.host,
                port = origin.port,
                "http3 origin connection invalidated"
            );
        }
    }

    async fn client_endpoint(&self) -> Result<quinn::Endpoint, ProxyError> {
        let mut slot = self.endpoint.lock().await;
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.clone());
        }

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tls.enable_early_data = true;
        tls.alpn_protocols = vec![b"h3".to_vec()];

        let mut endpoint =
            quinn::Endpoint::client(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
                .map_err(|err| ProxyError::Dial(format!("quic endpoint: {err}")))?;
        let client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(tls)
                .map_err(|err| ProxyError::Dial(format!("quic tls: {err}")))?,
        ));
        endpoint.set_default_client_config(client_config);

        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }

    async fn connect(&self, origin: &Endpoint) -> Result<H3Connection, ProxyError> {
        let endpoint = self.client_endpoint().await?;

        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((origin.host.as_str(), origin.port))
                .await
                .map_err(|err| ProxyError::Dial(format!("resolve {}: {err}", origin.host)))?
                .collect();
        let addr = addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ProxyError::Dial(format!("resolve {}: no addresses", origin.host)))?;

        let connecting = endpoint
            .connect(addr, &origin.host)
            .map_err(|err| ProxyError::Dial(format!("quic connect: {err}")))?;
        let conn = connecting
            .await
            .map_err(|err| ProxyError::Dial(format!("quic connect: {err}")))?;

        let quinn_conn = h3_quinn::Connection::new(conn);
        let (mut driver, send_request) = h3::client::new(quinn_conn)
            .await
            .map_err(|err| ProxyError::Dial(format!("h3 setup: {err}")))?;

        tokio::spawn(async move {
            let _ = future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        Ok(H3Connection { send_request })
    }
}
