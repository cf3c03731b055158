use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::net::UnixDatagram;

/// Message types on the per-process QUIC IPC socket. Only DGRAM_FORWARD is
/// sent today; the enum survives for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QuicIpcType {
    None = 0,
    DgramForward = 1,
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("truncated IPC message")]
    Truncated,
    #[error("unknown IPC message type {0}")]
    UnknownType(u8),
    #[error("malformed address (len {0})")]
    BadAddress(usize),
}

/// A forwarded QUIC UDP datagram and its metadata, exchanged between
/// sibling worker processes during graceful rollover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DgramForward {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub ecn: u8,
    pub pkt_info: u32,
    pub payload: Bytes,
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.put_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.put_slice(&ip.octets()),
    }
    buf.put_u16(addr.port());
}

fn addr_len(addr: &SocketAddr) -> u8 {
    match addr {
        SocketAddr::V4(_) => 6,
        SocketAddr::V6(_) => 18,
    }
}

fn take_addr(buf: &mut Bytes, len: usize) -> Result<SocketAddr, IpcError> {
    if buf.remaining() < len {
        return Err(IpcError::Truncated);
    }
    let ip = match len {
        6 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        18 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(IpcError::BadAddress(other)),
    };
    let port = buf.get_u16();
    Ok(SocketAddr::new(ip, port))
}

/// Frame layout: `{type, remote_addrlen, local_addrlen, ecn, pkt_info,
/// remote_addr, local_addr, payload}`.
pub fn encode_dgram_forward(msg: &DgramForward) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + 36 + msg.payload.len());
    buf.put_u8(QuicIpcType::DgramForward as u8);
    buf.put_u8(addr_len(&msg.remote));
    buf.put_u8(addr_len(&msg.local));
    buf.put_u8(msg.ecn);
    buf.put_u32(msg.pkt_info);
    put_addr(&mut buf, &msg.remote);
    put_addr(&mut buf, &msg.local);
    buf.put_slice(&msg.payload);
    buf.freeze()
}

pub fn decode_dgram_forward(data: Bytes) -> Result<DgramForward, IpcError> {
    let mut buf = data;
    if buf.remaining() < 8 {
        return Err(IpcError::Truncated);
    }
    let kind = buf.get_u8();
    if kind != QuicIpcType::DgramForward as u8 {
        return Err(IpcError::UnknownType(kind));
    }
    let remote_len = buf.get_u8() as usize;
    let local_len = buf.get_u8() as usize;
    let ecn = buf.get_u8();
    let pkt_info = buf.get_u32();
    let remote = take_addr(&mut buf, remote_len)?;
    let local = take_addr(&mut buf, local_len)?;
    Ok(DgramForward {
        remote,
        local,
        ecn,
        pkt_info,
        payload: buf,
    })
}

/// Sending half of the rollover IPC channel, bound to one lingering worker
/// process.
pub struct QuicIpcSender {
    socket: UnixDatagram,
}

impl QuicIpcSender {
    pub fn new(socket: UnixDatagram) -> Self {
        Self { socket }
    }

    pub async fn forward(&self, msg: &DgramForward) -> io::Result<()> {
        let frame = encode_dgram_forward(msg);
        self.socket.send(&frame).await.map(|_| ())
    }
}

/// Receiving half, owned by the outgoing worker process.
pub struct QuicIpcReceiver {
    socket: UnixDatagram,
    buf: Vec<u8>,
}

impl QuicIpcReceiver {
    pub fn new(socket: UnixDatagram) -> Self {
        Self {
            socket,
            buf: vec![0u8; 64 * 1024],
        }
    }

    pub async fn recv(&mut self) -> io::Result<Result<DgramForward, IpcError>> {
        let n = self.socket.recv(&mut self.buf).await?;
        Ok(decode_dgram_forward(Bytes::copy_from_slice(&self.buf[..n])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(remote: SocketAddr, local: SocketAddr) -> DgramForward {
        DgramForward {
            remote,
            local,
            ecn: 2,
            pkt_info: 0xdead_beef,
            payload: Bytes::from_static(b"quic-initial-packet"),
        }
    }

    #[test]
    fn dgram_forward_roundtrip_v4() {
        let msg = sample(
            "198.51.100.7:50000".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );
        let decoded = decode_dgram_forward(encode_dgram_forward(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn dgram_forward_roundtrip_v6() {
        let msg = sample(
            "[2001:db8::1]:50000".parse().unwrap(),
            "[::1]:443".parse().unwrap(),
        );
        let decoded = decode_dgram_forward(encode_dgram_forward(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let msg = sample(
            "198.51.100.7:50000".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );
        let frame = encode_dgram_forward(&msg);
        for cut in [0, 4, 7, 10] {
            assert!(decode_dgram_forward(frame.slice(..cut)).is_err());
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let msg = sample(
            "198.51.100.7:50000".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );
        let mut frame = BytesMut::from(&encode_dgram_forward(&msg)[..]);
        frame[0] = 9;
        match decode_dgram_forward(frame.freeze()) {
            Err(IpcError::UnknownType(9)) => {}
            other => panic!("expected unknown type, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_over_socketpair() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let sender = QuicIpcSender::new(a);
        let mut receiver = QuicIpcReceiver::new(b);

        let msg = sample(
            "198.51.100.7:50000".parse().unwrap(),
            "10.0.0.1:443".parse().unwrap(),
        );
        sender.forward(&msg).await.unwrap();
        let got = receiver.recv().await.unwrap().unwrap();
        assert_eq!(got, msg);
    }
}
