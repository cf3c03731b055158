/// Engine configuration shared by every client a worker spawns.
#[derive(Debug, Clone)]
pub struct LoadgenConfig {
    /// Per-stream flow control window, as a power-of-two exponent.
    pub window_bits: u32,
    /// Connection-level flow control window, as a power-of-two exponent.
    pub connection_window_bits: u32,
    /// ALPN tokens in preference order; the first one picks the wire version.
    pub alpn_list: Vec<String>,
    /// When set, each client appends its qlog trace to
    /// `{base}.{worker_id}.{client_id}.sqlog`.
    pub qlog_file_base: Option<String>,
    /// Overrides the state machine's tx payload sizing when set.
    pub max_udp_payload_size: Option<usize>,
}

impl Default for LoadgenConfig {
    fn default() -> Self {
        Self {
            window_bits: 30,
            connection_window_bits: 30,
            alpn_list: vec![crate::conn::ALPN_H3.to_string()],
            qlog_file_base: None,
            max_udp_payload_size: None,
        }
    }
}
