use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Result of a non-blocking send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// `n` bytes were accepted by the kernel. May be a prefix of the buffer
    /// when segmentation offload hands back a partial batch.
    Sent(usize),
    /// The socket buffer is full; retry when the socket signals writable.
    WouldBlock,
}

/// One received datagram: length, sender, and the GRO segment size (0 when
/// the kernel did not coalesce).
#[derive(Debug, Clone, Copy)]
pub struct RecvInfo {
    pub len: usize,
    pub from: SocketAddr,
    pub gro_size: usize,
    pub ecn: u8,
}

/// Datagram I/O seam over sendmsg/recvmsg semantics. The engine only ever
/// talks to this trait so the blocked-send and GRO paths are testable
/// without a kernel.
pub trait DatagramSocket: Send {
    /// Send `data` to `to`. When `gso_size` is non-zero the buffer holds
    /// multiple datagrams of that segment size.
    fn send(&self, to: SocketAddr, data: &[u8], gso_size: usize) -> io::Result<SendOutcome>;

    /// Receive one datagram into `buf`, or None when nothing is queued.
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<RecvInfo>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Tokio-backed implementation. Plain UDP: no segmentation offload, so a
/// batch with a `gso_size` is sent segment by segment and receives never
/// report coalescing.
pub struct TokioDatagramSocket {
    socket: std::sync::Arc<UdpSocket>,
}

impl TokioDatagramSocket {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: std::sync::Arc::new(socket),
        }
    }

    /// Shared handle for readiness waiting outside the engine borrow.
    pub fn inner(&self) -> std::sync::Arc<UdpSocket> {
        std::sync::Arc::clone(&self.socket)
    }
}

impl DatagramSocket for TokioDatagramSocket {
    fn send(&self, to: SocketAddr, data: &[u8], gso_size: usize) -> io::Result<SendOutcome> {
        // Without UDP_SEGMENT support each segment goes out on its own.
        let mut off = 0;
        let seg = if gso_size == 0 { data.len() } else { gso_size };
        while off < data.len() {
            let end = (off + seg).min(data.len());
            match self.socket.try_send_to(&data[off..end], to) {
                Ok(_) => off = end,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if off == 0 {
                        return Ok(SendOutcome::WouldBlock);
                    }
                    return Ok(SendOutcome::Sent(off));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(SendOutcome::Sent(data.len()))
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<RecvInfo>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => Ok(Some(RecvInfo {
                len,
                from,
                gro_size: 0,
                ecn: 0,
            })),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
