use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{DownstreamConfig, GatewayConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::handler::ConnectionHandler;
use crate::tls::TlsFrontend;

/// Install the process-wide TLS crypto provider once.
pub fn init_crypto() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Front door of the gateway: binds the listeners, owns the connection
/// handler, and runs the accept/dispatch loops until shutdown.
pub struct GatewayServer {
    settings: GatewayConfig,
    initial_config: DownstreamConfig,
    listen_addr: SocketAddr,
    quic_listen_addr: Option<SocketAddr>,
    tls: Option<Arc<TlsFrontend>>,
}

impl GatewayServer {
    pub fn new(
        settings: GatewayConfig,
        initial_config: DownstreamConfig,
        listen_addr: SocketAddr,
        quic_listen_addr: Option<SocketAddr>,
        tls: Option<Arc<TlsFrontend>>,
    ) -> Self {
        Self {
            settings,
            initial_config,
            listen_addr,
            quic_listen_addr,
            tls,
        }
    }

    /// Bind and serve. A bind failure is the fatal startup error path.
    pub async fn run(self, shutdown_rx: watch::Receiver<()>) -> GatewayResult<()> {
        let listener = bind_tcp_listener(self.listen_addr)?;
        self.run_with_listener(listener, shutdown_rx).await
    }

    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> GatewayResult<()> {
        init_crypto();

        let handler = ConnectionHandler::new(
            self.initial_config,
            self.settings.clone(),
            self.tls.clone(),
        );
        handler.start_serial_loop();

        let local = listener.local_addr().map_err(GatewayError::Listener)?;
        info!(addr = %local, "gateway listening");

        let udp = match self.quic_listen_addr {
            Some(addr) => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(GatewayError::Listener)?;
                info!(addr = %addr, "quic listener bound");
                Some(socket)
            }
            None => None,
        };
        let mut udp_buf = vec![0u8; 64 * 1024];

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("gateway shutting down");
                    break Ok(());
                }
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            let _ = handler.handle_accept(stream, peer).await;
                        }
                        Err(err) => {
                            error!(error = %err, "listener failed");
                            break Err(GatewayError::Listener(err));
                        }
                    }
                }
                recv = recv_udp(udp.as_ref(), &mut udp_buf) => {
                    match recv {
                        Ok((n, remote)) => {
                            let local = udp
                                .as_ref()
                                .and_then(|s| s.local_addr().ok())
                                .unwrap_or(local);
                            handler
                                .handle_quic_datagram(
                                    Bytes::copy_from_slice(&udp_buf[..n]),
                                    remote,
                                    local,
                                    0,
                                )
                                .await;
                        }
                        Err(err) => {
                            error!(error = %err, "quic listener failed");
                        }
                    }
                }
            }
        };

        handler.set_graceful_shutdown(true);
        handler.join_workers().await;
        result
    }
}

async fn recv_udp(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn bind_tcp_listener(addr: SocketAddr) -> GatewayResult<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(GatewayError::Listener)?;
    let _ = socket.set_reuseaddr(true);
    socket.bind(addr).map_err(GatewayError::Listener)?;
    socket.listen(1024).map_err(GatewayError::Listener)
}
