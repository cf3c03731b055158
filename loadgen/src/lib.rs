pub mod config;
pub mod conn;
pub mod engine;
pub mod qlog;
pub mod stats;
pub mod udp;

pub use config::LoadgenConfig;
pub use conn::{
    CloseReason, ConnConfig, ConnError, ConnEvent, H3Session, H3SessionFactory, Level, QuicConn,
    StreamWriteOutcome, TransportParams,
};
pub use engine::{build_conn_config, generate_new_cid, timestamp, EngineError, QuicEngine};
pub use qlog::QlogSink;
pub use stats::WorkerStats;
pub use udp::{DatagramSocket, SendOutcome, TokioDatagramSocket};
