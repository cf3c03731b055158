use bytes::Bytes;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{
    DownstreamAddrGroup, DownstreamConfig, Endpoint, GatewayConfig, HttpOptions,
    SharedDownstreamConfig,
};
use crate::dconn::PooledH1;
use crate::h2_session::Http2Session;
use crate::h3_pool::H3ConnectionPool;
use crate::pool::{ConnectionPool, PoolKey};
use crate::tls::TlsFrontend;

pub const WORKER_ID_LEN: usize = 8;

/// Worker identity, also used as the leading bytes of QUIC connection ids
/// so datagrams route back to the owning worker.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId([u8; WORKER_ID_LEN]);

impl WorkerId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; WORKER_ID_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; WORKER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; WORKER_ID_LEN] {
        &self.0
    }

    /// Whether `dcid` starts with this worker id.
    pub fn matches_dcid(&self, dcid: &[u8]) -> bool {
        dcid.len() >= WORKER_ID_LEN && dcid[..WORKER_ID_LEN] == self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Work dispatched onto a worker's event channel.
pub enum WorkerEvent {
    Accept {
        stream: TcpStream,
        peer: SocketAddr,
    },
    QuicDatagram {
        data: Bytes,
        remote: SocketAddr,
        local: SocketAddr,
        ecn: u8,
    },
    ReplaceDownstream(Arc<DownstreamConfig>),
    GracefulShutdown,
}

#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub accepted_connections: AtomicU64,
    pub quic_datagrams: AtomicU64,
    pub active_connections: AtomicUsize,
}

/// Everything request handling on one worker reaches for: the current
/// config snapshot, origin sessions and pools, TLS contexts, and counters.
pub struct WorkerContext {
    pub worker_id: WorkerId,
    pub settings: GatewayConfig,
    pub config: SharedDownstreamConfig,
    sessions: StdMutex<HashMap<PoolKey, Arc<Http2Session>>>,
    pub h1_pool: ConnectionPool<PooledH1>,
    pub(crate) h3_pool: Arc<H3ConnectionPool>,
    pub metrics: WorkerMetrics,
    pub tls: Option<Arc<TlsFrontend>>,
    endpoint_rr: AtomicUsize,
}

impl WorkerContext {
    pub fn new(
        worker_id: WorkerId,
        settings: GatewayConfig,
        config: SharedDownstreamConfig,
        tls: Option<Arc<TlsFrontend>>,
    ) -> Arc<Self> {
        let h1_pool = ConnectionPool::new(
            settings.pool_idle_timeout,
            settings.pool_per_key_limit,
            settings.pool_global_limit,
        );
        Arc::new(Self {
            worker_id,
            settings,
            config,
            sessions: StdMutex::new(HashMap::new()),
            h1_pool,
            h3_pool: Arc::new(H3ConnectionPool::new()),
            metrics: WorkerMetrics::default(),
            tls,
            endpoint_rr: AtomicUsize::new(0),
        })
    }

    /// The shared HTTP/2 session for an origin, replacing one that has
    /// started tearing down.
    pub fn session_for(
        &self,
        group: &str,
        endpoint: &Endpoint,
        options: Arc<HttpOptions>,
    ) -> Arc<Http2Session> {
        let key = PoolKey {
            group: group.to_string(),
            endpoint: endpoint.clone(),
        };
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&key) {
            if session.is_healthy() {
                return Arc::clone(session);
            }
        }
        let session = Http2Session::new(
            endpoint.clone(),
            options,
            self.settings.via_token.clone(),
        );
        sessions.insert(key, Arc::clone(&session));
        session
    }

    pub fn next_endpoint<'a>(&self, group: &'a DownstreamAddrGroup) -> Option<&'a Endpoint> {
        if group.endpoints.is_empty() {
            return None;
        }
        let idx = self.endpoint_rr.fetch_add(1, Ordering::Relaxed) % group.endpoints.len();
        group.endpoints.get(idx)
    }
}

/// Handle held by the connection handler for one spawned worker.
pub struct WorkerHandle {
    ctx: Arc<WorkerContext>,
    tx: mpsc::Sender<WorkerEvent>,
    join: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.ctx.worker_id
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    pub fn try_send(&self, event: WorkerEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    pub async fn send(&self, event: WorkerEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn current_downstream_config(&self) -> Arc<DownstreamConfig> {
        self.ctx.config.current()
    }

    pub fn active_connections(&self) -> usize {
        self.ctx.metrics.active_connections.load(Ordering::Relaxed)
    }

    pub async fn join(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Spawn one worker task with its own event channel and config view.
pub fn spawn_worker(
    settings: GatewayConfig,
    initial_config: Arc<DownstreamConfig>,
    tls: Option<Arc<TlsFrontend>>,
) -> WorkerHandle {
    let worker_id = WorkerId::generate();
    let config = SharedDownstreamConfig::from_arc(initial_config);
    let ctx = WorkerContext::new(worker_id, settings.clone(), config, tls);
    let (tx, rx) = mpsc::channel(1024);

    let worker = Worker {
        ctx: Arc::clone(&ctx),
        events: rx,
        drain_timeout: settings.shutdown_drain_timeout,
    };
    let join = tokio::spawn(worker.run());
    info!(worker_id = ?ctx.worker_id, "worker started");

    WorkerHandle {
        ctx,
        tx,
        join: StdMutex::new(Some(join)),
    }
}

struct Worker {
    ctx: Arc<WorkerContext>,
    events: mpsc::Receiver<WorkerEvent>,
    drain_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        let mut graceful = false;
        let mut drain_deadline: Option<tokio::time::Instant> = None;

        loop {
            let deadline = drain_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        None => break,
                        Some(event) => {
                            if self.handle_event(event, &mut graceful, &mut drain_deadline) {
                                break;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if graceful => {
                    warn!(worker_id = ?self.ctx.worker_id, "drain deadline reached");
                    break;
                }
            }

            if graceful && self.ctx.metrics.active_connections.load(Ordering::Relaxed) == 0 {
                break;
            }
        }

        info!(worker_id = ?self.ctx.worker_id, "worker stopped");
    }

    /// Returns true when the run loop should exit.
    fn handle_event(
        &self,
        event: WorkerEvent,
        graceful: &mut bool,
        drain_deadline: &mut Option<tokio::time::Instant>,
    ) -> bool {
        match event {
            WorkerEvent::Accept { stream, peer } => {
                if *graceful {
                    debug!(worker_id = ?self.ctx.worker_id, %peer, "accept rejected during shutdown");
                    return false;
                }
                self.ctx
                    .metrics
                    .accepted_connections
                    .fetch_add(1, Ordering::Relaxed);
                self.ctx
                    .metrics
                    .active_connections
                    .fetch_add(1, Ordering::Relaxed);
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    crate::upstream::serve_tcp_connection(Arc::clone(&ctx), stream, peer).await;
                    ctx.metrics
                        .active_connections
                        .fetch_sub(1, Ordering::Relaxed);
                });
                false
            }
            WorkerEvent::QuicDatagram { data, remote, .. } => {
                // The QUIC/TLS server machinery is a separate layer; the
                // dispatch contract ends with delivery to the owning worker.
                self.ctx
                    .metrics
                    .quic_datagrams
                    .fetch_add(1, Ordering::Relaxed);
                trace!(
                    worker_id = ?self.ctx.worker_id,
                    %remote,
                    len = data.len(),
                    "quic datagram delivered"
                );
                false
            }
            WorkerEvent::ReplaceDownstream(config) => {
                debug!(
                    worker_id = ?self.ctx.worker_id,
                    generation = config.generation,
                    "downstream config replaced"
                );
                self.ctx.config.store(config);
                false
            }
            WorkerEvent::GracefulShutdown => {
                *graceful = true;
                *drain_deadline =
                    Some(tokio::time::Instant::now() + self.drain_timeout);
                self.ctx.metrics.active_connections.load(Ordering::Relaxed) == 0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_prefix_match() {
        let id = WorkerId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(id.matches_dcid(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        assert!(id.matches_dcid(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(!id.matches_dcid(&[1, 2, 3, 4, 5, 6, 7]));
        assert!(!id.matches_dcid(&[9, 2, 3, 4, 5, 6, 7, 8, 9]));
    }

    #[test]
    fn generated_worker_ids_differ() {
        let a = WorkerId::generate();
        let b = WorkerId::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[tokio::test]
    async fn worker_exits_on_graceful_shutdown() {
        let config = Arc::new(DownstreamConfig::new(1, vec![], HttpOptions::default()));
        let handle = spawn_worker(GatewayConfig::default(), config, None);
        assert!(handle.send(WorkerEvent::GracefulShutdown).await);
        handle.join().await;
    }

    #[tokio::test]
    async fn worker_applies_config_replacement() {
        let config = Arc::new(DownstreamConfig::new(1, vec![], HttpOptions::default()));
        let handle = spawn_worker(GatewayConfig::default(), config, None);
        assert_eq!(handle.current_downstream_config().generation, 1);

        let next = Arc::new(DownstreamConfig::new(2, vec![], HttpOptions::default()));
        assert!(handle.send(WorkerEvent::ReplaceDownstream(next)).await);

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if handle.current_downstream_config().generation == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("config replacement applied");
    }
}
