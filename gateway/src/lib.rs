pub mod config;
pub mod dconn;
pub mod downstream;
pub mod error;
pub mod h2_session;
mod h3_pool;
pub mod handler;
pub mod http_rewrite;
pub mod pool;
pub mod quic_ipc;
pub mod server;
pub mod tls;
pub mod upstream;
pub mod worker;

pub use config::{
    DownstreamAddrGroup, DownstreamConfig, Endpoint, GatewayConfig, HttpOptions, OriginProtocol,
    SharedDownstreamConfig,
};
pub use downstream::{ClientInfo, ConnectProto, Downstream, StreamState};
pub use error::{GatewayError, GatewayResult, ProxyError};
pub use h2_session::{Http2Session, SessionState};
pub use handler::{ConnectionHandler, QuicLingeringWorkerProcess, SerialEvent, SerialEventType};
pub use pool::{ConnectionPool, PoolEntry, PoolKey};
pub use server::{init_crypto, GatewayServer};
pub use tls::{hostname_match, CertLookupTree, CertStore, TlsFrontend};
pub use worker::{WorkerEvent, WorkerHandle, WorkerId};
