use bytes::Bytes;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::config::{DownstreamConfig, GatewayConfig, SharedDownstreamConfig};
use crate::quic_ipc::{DgramForward, QuicIpcSender};
use crate::tls::TlsFrontend;
use crate::worker::{spawn_worker, WorkerEvent, WorkerHandle, WorkerId, WORKER_ID_LEN};

/// Cross-thread events processed in FIFO post order by the handler's loop.
/// Only REPLACE_DOWNSTREAM is posted today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEventType {
    None,
    ReplaceDownstream,
}

pub struct SerialEvent {
    pub kind: SerialEventType,
    pub config: Arc<DownstreamConfig>,
}

/// A worker process in its graceful shutdown period, still owning QUIC
/// connections whose CIDs carry its worker ids.
pub struct QuicLingeringWorkerProcess {
    pub worker_ids: Vec<WorkerId>,
    pub ipc: Arc<QuicIpcSender>,
}

/// Pull the destination connection id out of a QUIC packet header. Short
/// headers carry no length, so only the worker-id prefix is taken.
pub fn extract_dcid(data: &[u8]) -> Option<&[u8]> {
    let first = *data.first()?;
    if first & 0x80 != 0 {
        let len = *data.get(5)? as usize;
        data.get(6..6 + len)
    } else {
        data.get(1..1 + WORKER_ID_LEN)
    }
}

/// Process-wide coordinator: spawns workers, distributes accepted
/// connections round-robin, routes QUIC datagrams by CID, and applies
/// config replacements posted from other threads.
pub struct ConnectionHandler {
    workers: Vec<WorkerHandle>,
    worker_index: HashMap<WorkerId, usize>,
    round_robin: AtomicUsize,
    serial_events: StdMutex<Vec<SerialEvent>>,
    serial_wakeup: Notify,
    serial_stop: AtomicBool,
    config: SharedDownstreamConfig,
    graceful_shutdown: AtomicBool,
    lingering: StdMutex<Vec<QuicLingeringWorkerProcess>>,
    self_ref: Weak<ConnectionHandler>,
}

impl ConnectionHandler {
    pub fn new(
        initial: DownstreamConfig,
        settings: GatewayConfig,
        tls: Option<Arc<TlsFrontend>>,
    ) -> Arc<Self> {
        let num_workers = settings.num_workers.max(1);
        let initial = Arc::new(initial);
        let config = SharedDownstreamConfig::from_arc(Arc::clone(&initial));

        let workers: Vec<WorkerHandle> = (0..num_workers)
            .map(|_| spawn_worker(settings.clone(), Arc::clone(&initial), tls.clone()))
            .collect();
        let worker_index = workers
            .iter()
            .enumerate()
            .map(|(idx, worker)| (worker.id(), idx))
            .collect();

        info!(num_workers, "connection handler started");
        Arc::new_cyclic(|self_ref| Self {
            workers,
            worker_index,
            round_robin: AtomicUsize::new(0),
            serial_events: StdMutex::new(Vec::new()),
            serial_wakeup: Notify::new(),
            serial_stop: AtomicBool::new(false),
            config,
            graceful_shutdown: AtomicBool::new(false),
            lingering: StdMutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn find_worker(&self, id: &WorkerId) -> Option<&WorkerHandle> {
        self.worker_index.get(id).map(|&idx| &self.workers[idx])
    }

    pub fn current_config(&self) -> Arc<DownstreamConfig> {
        self.config.current()
    }

    pub fn get_graceful_shutdown(&self) -> bool {
        self.graceful_shutdown.load(Ordering::SeqCst)
    }

    /// Stop accepting, tell every worker to drain, and unblock the serial
    /// loop so it can exit.
    pub fn set_graceful_shutdown(&self, value: bool) {
        self.graceful_shutdown.store(value, Ordering::SeqCst);
        if value {
            for worker in &self.workers {
                let _ = worker.try_send(WorkerEvent::GracefulShutdown);
            }
            self.serial_stop.store(true, Ordering::SeqCst);
            self.serial_wakeup.notify_one();
        }
    }

    pub async fn join_workers(&self) {
        for worker in &self.workers {
            worker.join().await;
        }
    }

    pub fn total_active_connections(&self) -> usize {
        self.workers.iter().map(WorkerHandle::active_connections).sum()
    }

    /// Bind an accepted TCP connection to the next worker round-robin.
    /// Returns false when the accept is rejected (graceful shutdown or a
    /// saturated worker queue).
    pub async fn handle_accept(&self, stream: TcpStream, peer: SocketAddr) -> bool {
        if self.get_graceful_shutdown() {
            debug!(%peer, "accept rejected: graceful shutdown");
            return false;
        }
        let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx]
            .send(WorkerEvent::Accept { stream, peer })
            .await
    }

    /// Route one QUIC datagram: the worker whose id prefixes the DCID, a
    /// lingering sibling process, or a stable hash fallback for
    /// client-chosen initial CIDs.
    pub async fn handle_quic_datagram(
        &self,
        data: Bytes,
        remote: SocketAddr,
        local: SocketAddr,
        ecn: u8,
    ) {
        let Some(dcid) = extract_dcid(&data) else {
            trace!(%remote, "undecodable quic packet dropped");
            return;
        };

        let prefix_worker = dcid
            .get(..WORKER_ID_LEN)
            .and_then(|prefix| prefix.try_into().ok())
            .map(WorkerId::from_bytes)
            .and_then(|id| self.find_worker(&id));
        if let Some(worker) = prefix_worker {
            let _ = worker
                .send(WorkerEvent::QuicDatagram {
                    data,
                    remote,
                    local,
                    ecn,
                })
                .await;
            return;
        }

        if let Some(ipc) = self.match_lingering_worker_process(dcid) {
            let msg = DgramForward {
                remote,
                local,
                ecn,
                pkt_info: 0,
                payload: data,
            };
            if let Err(err) = ipc.forward(&msg).await {
                warn!(error = %err, "quic datagram forward failed");
            }
            return;
        }

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        dcid.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.workers.len();
        let _ = self.workers[idx]
            .send(WorkerEvent::QuicDatagram {
                data,
                remote,
                local,
                ecn,
            })
            .await;
    }

    pub fn set_quic_lingering_worker_processes(
        &self,
        processes: Vec<QuicLingeringWorkerProcess>,
    ) {
        *self.lingering.lock().unwrap() = processes;
    }

    /// The IPC channel of the lingering process owning a worker id that
    /// prefixes `dcid`, if any.
    pub fn match_lingering_worker_process(&self, dcid: &[u8]) -> Option<Arc<QuicIpcSender>> {
        let lingering = self.lingering.lock().unwrap();
        lingering
            .iter()
            .find(|process| process.worker_ids.iter().any(|id| id.matches_dcid(dcid)))
            .map(|process| Arc::clone(&process.ipc))
    }

    pub fn send_replace_downstream(&self, config: Arc<DownstreamConfig>) {
        self.send_serial_event(SerialEvent {
            kind: SerialEventType::ReplaceDownstream,
            config,
        });
    }

    /// Post a serial event from any thread; the loop thread drains in post
    /// order.
    pub fn send_serial_event(&self, event: SerialEvent) {
        self.serial_events.lock().unwrap().push(event);
        self.serial_wakeup.notify_one();
    }

    /// Drain and apply queued serial events in order.
    pub fn apply_serial_events(&self) {
        let events: Vec<SerialEvent> = {
            let mut queue = self.serial_events.lock().unwrap();
            queue.drain(..).collect()
        };
        for event in events {
            match event.kind {
                SerialEventType::ReplaceDownstream => {
                    self.worker_replace_downstream(event.config);
                }
                SerialEventType::None => {}
            }
        }
    }

    fn worker_replace_downstream(&self, config: Arc<DownstreamConfig>) {
        info!(generation = config.generation, "replacing downstream config");
        self.config.store(Arc::clone(&config));
        for worker in &self.workers {
            let _ = worker.try_send(WorkerEvent::ReplaceDownstream(Arc::clone(&config)));
        }
    }

    /// Run the serial-event loop until graceful shutdown.
    pub fn start_serial_loop(&self) {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                let Some(handler) = weak.upgrade() else { break };
                handler.serial_wakeup.notified().await;
                handler.apply_serial_events();
                if handler.serial_stop.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpOptions;
    use crate::quic_ipc::QuicIpcReceiver;
    use std::time::Duration;
    use tokio::net::UnixDatagram;

    fn config(generation: u64) -> DownstreamConfig {
        DownstreamConfig::new(generation, vec![], HttpOptions::default())
    }

    fn handler(num_workers: usize) -> Arc<ConnectionHandler> {
        let settings = GatewayConfig {
            num_workers,
            ..GatewayConfig::default()
        };
        ConnectionHandler::new(config(1), settings, None)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if check() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn extract_dcid_short_and_long_headers() {
        // Long header: flags, 4-byte version, dcid len, dcid.
        let mut long = vec![0xc0, 0, 0, 0, 1, 4];
        long.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(extract_dcid(&long), Some(&[0xaa, 0xbb, 0xcc, 0xdd][..]));

        // Short header: flags then the CID, of which the worker-id prefix
        // is taken.
        let mut short = vec![0x40];
        short.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(extract_dcid(&short), Some(&[1, 2, 3, 4, 5, 6, 7, 8][..]));

        assert_eq!(extract_dcid(&[]), None);
        assert_eq!(extract_dcid(&[0xc0, 0, 0, 0, 1]), None);
        assert_eq!(extract_dcid(&[0x40, 1, 2]), None);
    }

    #[tokio::test]
    async fn replace_downstream_posted_from_other_thread() {
        let handler = handler(2);
        handler.start_serial_loop();

        let held = handler.workers()[0].current_downstream_config();
        assert_eq!(held.generation, 1);

        let poster = Arc::clone(&handler);
        std::thread::spawn(move || {
            poster.send_replace_downstream(Arc::new(config(7)));
        })
        .join()
        .unwrap();

        let h = Arc::clone(&handler);
        wait_for(move || {
            h.current_config().generation == 7
                && h.workers()
                    .iter()
                    .all(|w| w.current_downstream_config().generation == 7)
        })
        .await;

        // An in-flight holder keeps the old generation alive.
        assert_eq!(held.generation, 1);

        handler.set_graceful_shutdown(true);
        handler.join_workers().await;
    }

    #[tokio::test]
    async fn serial_events_apply_in_post_order() {
        let handler = handler(1);
        for generation in [2, 3, 4] {
            handler.send_replace_downstream(Arc::new(config(generation)));
        }
        handler.apply_serial_events();
        assert_eq!(handler.current_config().generation, 4);

        handler.set_graceful_shutdown(true);
        handler.join_workers().await;
    }

    #[tokio::test]
    async fn quic_datagram_routes_by_worker_id_prefix() {
        let handler = handler(2);
        let target = &handler.workers()[1];

        let mut packet = vec![0x40];
        packet.extend_from_slice(target.id().as_bytes());
        packet.extend_from_slice(&[0xee; 12]);

        handler
            .handle_quic_datagram(
                Bytes::from(packet),
                "198.51.100.7:50000".parse().unwrap(),
                "10.0.0.1:443".parse().unwrap(),
                0,
            )
            .await;

        let ctx = Arc::clone(handler.workers()[1].context());
        wait_for(move || ctx.metrics.quic_datagrams.load(Ordering::Relaxed) == 1).await;
        assert_eq!(
            handler.workers()[0]
                .context()
                .metrics
                .quic_datagrams
                .load(Ordering::Relaxed),
            0
        );

        handler.set_graceful_shutdown(true);
        handler.join_workers().await;
    }

    #[tokio::test]
    async fn lingering_worker_receives_forwarded_datagram() {
        let handler = handler(1);
        let (tx_sock, rx_sock) = UnixDatagram::pair().unwrap();
        let lingering_id = WorkerId::from_bytes([9; 8]);
        handler.set_quic_lingering_worker_processes(vec![QuicLingeringWorkerProcess {
            worker_ids: vec![lingering_id],
            ipc: Arc::new(QuicIpcSender::new(tx_sock)),
        }]);

        let mut packet = vec![0x40];
        packet.extend_from_slice(lingering_id.as_bytes());
        packet.extend_from_slice(&[0x11; 20]);
        let payload = Bytes::from(packet);

        let remote: SocketAddr = "198.51.100.7:50000".parse().unwrap();
        let local: SocketAddr = "10.0.0.1:443".parse().unwrap();
        handler
            .handle_quic_datagram(payload.clone(), remote, local, 1)
            .await;

        let mut receiver = QuicIpcReceiver::new(rx_sock);
        let msg = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, payload);
        assert_eq!(msg.remote, remote);
        assert_eq!(msg.local, local);
        assert_eq!(msg.ecn, 1);

        handler.set_graceful_shutdown(true);
        handler.join_workers().await;
    }

    #[tokio::test]
    async fn graceful_shutdown_rejects_new_accepts() {
        let handler = handler(1);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::net::TcpStream::connect(addr);
        let (accepted, _) = tokio::join!(listener.accept(), client);
        let (stream, peer) = accepted.unwrap();

        handler.set_graceful_shutdown(true);
        assert!(!handler.handle_accept(stream, peer).await);

        handler.join_workers().await;
    }
}
