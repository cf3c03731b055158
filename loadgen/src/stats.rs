use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters shared by every client the worker drives.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub udp_dgram_recv: AtomicU64,
    pub udp_dgram_sent: AtomicU64,
    pub bytes_total: AtomicU64,
    /// Clients torn down by a fatal engine error (expiry failure included).
    pub client_failures: AtomicU64,
}

impl WorkerStats {
    pub fn add_dgram_recv(&self, n: u64) {
        self.udp_dgram_recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dgram_sent(&self, n: u64) {
        self.udp_dgram_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_client_failure(&self) {
        self.client_failures.fetch_add(1, Ordering::Relaxed);
    }
}
