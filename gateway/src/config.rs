use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Protocol spoken to an origin endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginProtocol {
    Http1,
    Http2,
    Http3,
}

impl OriginProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginProtocol::Http1 => "http1",
            OriginProtocol::Http2 => "http2",
            OriginProtocol::Http3 => "http3",
        }
    }

    pub fn alpn(&self) -> &'static [u8] {
        match self {
            OriginProtocol::Http1 => b"http/1.1",
            OriginProtocol::Http2 => b"h2",
            OriginProtocol::Http3 => b"h3",
        }
    }
}

/// One origin server address within a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Rewrite `:scheme: http` to `https` when forwarding to this origin.
    pub upgrade_scheme: bool,
    pub protocol: OriginProtocol,
}

impl Endpoint {
    pub fn hostport(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ordered endpoints sharing the same routing predicates.
#[derive(Debug, Clone)]
pub struct DownstreamAddrGroup {
    pub name: String,
    /// Exact-host predicate; None matches any authority.
    pub host: Option<String>,
    /// Path-prefix predicate; the longest matching prefix wins.
    pub path_prefix: String,
    pub endpoints: Vec<Endpoint>,
    pub weight: u32,
    /// Dial attempts per request before surfacing 502.
    pub retry_limit: usize,
}

impl DownstreamAddrGroup {
    fn matches(&self, host: &str, path: &str) -> bool {
        if let Some(want) = &self.host {
            // Authority comparison ignores an explicit port.
            let bare = host.split(':').next().unwrap_or(host);
            if !want.eq_ignore_ascii_case(bare) {
                return false;
            }
        }
        path.starts_with(&self.path_prefix)
    }
}

/// Addition policy for the `forwarded` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedParams {
    pub by: bool,
    pub for_: bool,
    pub host: bool,
    pub proto: bool,
}

impl ForwardedParams {
    pub fn any(&self) -> bool {
        self.by || self.for_ || self.host || self.proto
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForwardedOptions {
    pub strip_incoming: bool,
    pub params: ForwardedParams,
}

#[derive(Debug, Clone, Default)]
pub struct XffOptions {
    pub strip_incoming: bool,
    pub add: bool,
}

#[derive(Debug, Clone, Default)]
pub struct XfpOptions {
    pub strip_incoming: bool,
    pub add: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EarlyDataOptions {
    pub strip_incoming: bool,
}

/// Global HTTP rewrite options carried by every config generation.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub forwarded: ForwardedOptions,
    pub xff: XffOptions,
    pub xfp: XfpOptions,
    pub early_data: EarlyDataOptions,
    pub no_cookie_crumbling: bool,
    pub no_via: bool,
    pub no_host_rewrite: bool,
    /// Operating as a forward HTTP/2 proxy; disables scheme/authority
    /// rewriting the same way a regular CONNECT does.
    pub http2_proxy: bool,
    pub add_request_headers: Vec<(String, String)>,
}

/// Immutable snapshot of all origin groups and global HTTP options.
/// Replacement happens only by publishing a new snapshot; in-flight requests
/// keep their generation alive through the `Arc`.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub generation: u64,
    pub groups: Vec<DownstreamAddrGroup>,
    pub http: HttpOptions,
}

impl DownstreamConfig {
    pub fn new(generation: u64, groups: Vec<DownstreamAddrGroup>, http: HttpOptions) -> Self {
        Self {
            generation,
            groups,
            http,
        }
    }

    /// Select the group for an authority/path pair: host-predicated groups
    /// beat catch-alls, then the longest path prefix wins.
    pub fn find_group(&self, host: &str, path: &str) -> Option<&DownstreamAddrGroup> {
        self.groups
            .iter()
            .filter(|g| g.matches(host, path))
            .max_by_key(|g| (g.host.is_some(), g.path_prefix.len()))
    }
}

/// The atomically swapped current snapshot. Readers load a cheap `Arc`
/// clone; the connection handler stores replacements.
#[derive(Clone)]
pub struct SharedDownstreamConfig {
    inner: Arc<ArcSwap<DownstreamConfig>>,
}

impl SharedDownstreamConfig {
    pub fn new(config: DownstreamConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn from_arc(config: Arc<DownstreamConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::new(config)),
        }
    }

    pub fn current(&self) -> Arc<DownstreamConfig> {
        self.inner.load_full()
    }

    pub fn store(&self, config: Arc<DownstreamConfig>) {
        self.inner.store(config);
    }
}

/// Server-level settings fixed at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub num_workers: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Idle window after which a pooled origin connection is discarded.
    pub pool_idle_timeout: Duration,
    pub pool_per_key_limit: usize,
    pub pool_global_limit: usize,
    /// Idle deadline for draining connections during graceful shutdown.
    pub shutdown_drain_timeout: Duration,
    /// Name used in the `via` header.
    pub via_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(60),
            pool_per_key_limit: 8,
            pool_global_limit: 64,
            shutdown_drain_timeout: Duration::from_secs(30),
            via_token: "gateway".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port: 8080,
            tls: false,
            upgrade_scheme: false,
            protocol: OriginProtocol::Http2,
        }
    }

    fn group(name: &str, host: Option<&str>, prefix: &str) -> DownstreamAddrGroup {
        DownstreamAddrGroup {
            name: name.to_string(),
            host: host.map(str::to_string),
            path_prefix: prefix.to_string(),
            endpoints: vec![endpoint(name)],
            weight: 1,
            retry_limit: 1,
        }
    }

    #[test]
    fn find_group_prefers_host_then_longest_prefix() {
        let config = DownstreamConfig::new(
            1,
            vec![
                group("catchall", None, "/"),
                group("api", None, "/api/"),
                group("static", Some("cdn.example.com"), "/"),
            ],
            HttpOptions::default(),
        );

        assert_eq!(config.find_group("x", "/index.html").unwrap().name, "catchall");
        assert_eq!(config.find_group("x", "/api/v1").unwrap().name, "api");
        assert_eq!(
            config.find_group("cdn.example.com", "/api/v1").unwrap().name,
            "static"
        );
        assert_eq!(
            config.find_group("CDN.EXAMPLE.COM:443", "/x").unwrap().name,
            "static"
        );
    }

    #[test]
    fn shared_config_swaps_generations() {
        let shared = SharedDownstreamConfig::new(DownstreamConfig::new(
            1,
            vec![],
            HttpOptions::default(),
        ));
        let old = shared.current();
        assert_eq!(old.generation, 1);

        shared.store(Arc::new(DownstreamConfig::new(
            7,
            vec![],
            HttpOptions::default(),
        )));
        assert_eq!(shared.current().generation, 7);
        // The old generation stays alive while someone holds it.
        assert_eq!(old.generation, 1);
    }
}
