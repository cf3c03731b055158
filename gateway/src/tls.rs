use rustls::ServerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;

use crate::error::GatewayError;

/// Wildcard entry stored at the trie node for the pattern's domain suffix.
/// `prefix`/`suffix` are the pieces of the leftmost label around the `*`.
#[derive(Debug)]
struct WildcardEntry {
    prefix: String,
    suffix: String,
    index: usize,
}

impl WildcardEntry {
    /// Match kind, highest first: left-label wildcard (`*w`), then middle
    /// wildcard (`xy*`), then a bare parent-suffix `*`.
    fn kind(&self) -> u8 {
        if self.prefix.is_empty() && !self.suffix.is_empty() {
            3
        } else if !self.prefix.is_empty() {
            2
        } else {
            1
        }
    }

    fn matches(&self, label: &str) -> bool {
        !label.contains('.')
            && label.len() > self.prefix.len() + self.suffix.len()
            && label.starts_with(&self.prefix)
            && label.ends_with(&self.suffix)
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<u8, TrieNode>,
    exact: Option<usize>,
    wildcards: Vec<WildcardEntry>,
}

/// Reverse-suffix trie over hostnames. Exact patterns terminate a full
/// reversed walk; wildcard patterns hang off the node for their domain
/// suffix and are checked against the not-yet-consumed leftmost label.
#[derive(Debug, Default)]
pub struct CertLookupTree {
    root: TrieNode,
}

impl CertLookupTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `pattern` with the caller's candidate `index`. If the pattern
    /// is already present the first-assigned index is returned instead and
    /// the caller appends its context to that slot.
    pub fn add_cert(&mut self, pattern: &str, index: usize) -> usize {
        let pattern = pattern.to_ascii_lowercase();
        if pattern.is_empty() {
            return index;
        }

        if let Some(star) = pattern.find('*') {
            let first_dot = pattern.find('.');
            // A wildcard is only honored in the leftmost label; anything
            // else is stored as a literal.
            let in_leftmost = first_dot.map(|d| star < d).unwrap_or(true);
            if in_leftmost {
                let dot = match first_dot {
                    Some(d) => d,
                    // A lone wildcard label has no suffix to anchor on.
                    None => return index,
                };
                let label = &pattern[..dot];
                let rest = &pattern[dot..];
                let entry = WildcardEntry {
                    prefix: label[..star].to_string(),
                    suffix: label[star + 1..].to_string(),
                    index,
                };
                let node = Self::walk_mut(&mut self.root, rest);
                if let Some(existing) = node
                    .wildcards
                    .iter()
                    .find(|e| e.prefix == entry.prefix && e.suffix == entry.suffix)
                {
                    return existing.index;
                }
                node.wildcards.push(entry);
                return index;
            }
        }

        let node = Self::walk_mut(&mut self.root, &pattern);
        match node.exact {
            Some(existing) => existing,
            None => {
                node.exact = Some(index);
                index
            }
        }
    }

    fn walk_mut<'a>(mut node: &'a mut TrieNode, s: &str) -> &'a mut TrieNode {
        for &b in s.as_bytes().iter().rev() {
            node = node.children.entry(b).or_default();
        }
        node
    }

    /// The highest-priority matching index for `hostname`, if any.
    /// Priority: exact > left-label wildcard > middle wildcard > bare `*`.
    pub fn lookup(&self, hostname: &str) -> Option<usize> {
        let hostname = hostname.to_ascii_lowercase();
        if hostname.is_empty() || !hostname.is_ascii() {
            return None;
        }

        let bytes = hostname.as_bytes();
        let mut node = &self.root;
        let mut best: Option<(u8, usize, usize)> = None;
        let mut consumed = 0usize;

        loop {
            // The unconsumed front of the hostname is the leftmost-label
            // candidate for wildcards anchored at this node.
            let remaining = &hostname[..hostname.len() - consumed];
            for entry in &node.wildcards {
                if entry.matches(remaining) {
                    let cand = (entry.kind(), entry.prefix.len() + entry.suffix.len(), entry.index);
                    if best.map(|b| (cand.0, cand.1) > (b.0, b.1)).unwrap_or(true) {
                        best = Some(cand);
                    }
                }
            }

            if consumed == bytes.len() {
                if let Some(index) = node.exact {
                    return Some(index);
                }
                break;
            }

            let b = bytes[bytes.len() - 1 - consumed];
            match node.children.get(&b) {
                Some(child) => {
                    node = child;
                    consumed += 1;
                }
                None => break,
            }
        }

        best.map(|(_, _, index)| index)
    }
}

/// Certificate-level hostname match used when validating origin
/// certificates: wildcard only in the leftmost label, matching at least one
/// character, with at least two labels required after it.
pub fn hostname_match(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('\0').to_ascii_lowercase();
    let hostname = hostname.trim_end_matches('\0').to_ascii_lowercase();
    if pattern.is_empty() || hostname.is_empty() {
        return false;
    }

    let star = match pattern.find('*') {
        Some(star) => star,
        None => return pattern == hostname,
    };

    let dot = match pattern.find('.') {
        Some(dot) => dot,
        None => return false,
    };
    if star > dot {
        return false;
    }
    // At least two dots must follow the wildcard label.
    if pattern[dot..].matches('.').count() < 2 {
        return false;
    }

    let label = &pattern[..dot];
    let rest = &pattern[dot..];
    if !hostname.ends_with(rest) {
        return false;
    }
    let host_label = &hostname[..hostname.len() - rest.len()];
    if host_label.contains('.') {
        return false;
    }

    let prefix = &label[..star];
    let suffix = &label[star + 1..];
    host_label.len() > prefix.len() + suffix.len()
        && host_label.starts_with(prefix)
        && host_label.ends_with(suffix)
}

/// TLS contexts indexed by the lookup tree. Contexts sharing a hostname but
/// differing by signature algorithm live in the same slot, in insertion
/// order.
#[derive(Default)]
pub struct CertStore {
    tree: CertLookupTree,
    slots: Vec<Vec<Arc<ServerConfig>>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `config` under `hostname`. Duplicate hostnames append to the
    /// existing slot.
    pub fn add(&mut self, hostname: &str, config: Arc<ServerConfig>) -> usize {
        let candidate = self.slots.len();
        let index = self.tree.add_cert(hostname, candidate);
        if index == candidate {
            self.slots.push(vec![config]);
        } else {
            self.slots[index].push(config);
        }
        index
    }

    /// Resolve the context for an SNI name; `None` falls back to slot 0.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<ServerConfig>> {
        let index = match server_name {
            Some(name) => self.tree.lookup(name)?,
            None => 0,
        };
        self.slots.get(index).and_then(|slot| slot.first()).cloned()
    }

    pub fn slot(&self, index: usize) -> Option<&[Arc<ServerConfig>]> {
        self.slots.get(index).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Client-facing TLS termination: the certificate is chosen per SNI via
/// the lookup tree before the handshake proceeds.
pub struct TlsFrontend {
    store: CertStore,
}

impl TlsFrontend {
    pub fn new(store: CertStore) -> Result<Self, GatewayError> {
        if store.is_empty() {
            return Err(GatewayError::Config(
                "TLS frontend requires at least one certificate".into(),
            ));
        }
        Ok(Self { store })
    }

    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>, GatewayError> {
        let acceptor =
            tokio_rustls::LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor
            .await
            .map_err(|err| GatewayError::Tls(err.to_string()))?;
        let server_name = start.client_hello().server_name().map(str::to_string);
        let config = self
            .store
            .select(server_name.as_deref())
            .ok_or_else(|| {
                GatewayError::Tls(format!(
                    "no certificate for {}",
                    server_name.as_deref().unwrap_or("<no sni>")
                ))
            })?;
        start
            .into_stream(config)
            .await
            .map_err(|err| GatewayError::Tls(err.to_string()))
    }
}

/// Build a server context from PEM bytes, advertising h2 and http/1.1.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ServerConfig>, GatewayError> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| GatewayError::Tls(err.to_string()))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|err| GatewayError::Tls(err.to_string()))?
        .ok_or_else(|| GatewayError::Tls("no private key found".into()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| GatewayError::Tls(err.to_string()))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_tree_wildcard_priorities() {
        let mut tree = CertLookupTree::new();
        let hostnames = [
            "example.com",             // 0
            "www.example.org",         // 1
            "*www.example.org",        // 2
            "xy*.host.domain",         // 3
            "*yy.host.domain",         // 4
            "nghttp2.sourceforge.net", // 5
            "sourceforge.net",         // 6
            "sourceforge.net",         // 7, duplicate
            "*.foo.bar",               // 8, oo.bar is a suffix of *.foo.bar
            "oo.bar",                  // 9
        ];
        for (idx, hostname) in hostnames.iter().enumerate() {
            tree.add_cert(hostname, idx);
        }

        assert_eq!(tree.lookup("example.com"), Some(0));
        assert_eq!(tree.lookup("www.example.org"), Some(1));
        assert_eq!(tree.lookup("2www.example.org"), Some(2));
        assert_eq!(tree.lookup("www2.example.org"), None);
        assert_eq!(tree.lookup("xy1.host.domain"), Some(3));
        // * must match at least one character.
        assert_eq!(tree.lookup("yy.host.domain"), None);
        assert_eq!(tree.lookup("xyy.host.domain"), Some(4));
        assert_eq!(tree.lookup(""), None);
        assert_eq!(tree.lookup("nghttp2.sourceforge.net"), Some(5));
        assert_eq!(tree.lookup("sourceforge.net"), Some(6));
        let truncated = "pdylay.sourceforge.net";
        for i in 0..7 {
            assert_eq!(tree.lookup(&truncated[i..]), None);
        }
        assert_eq!(tree.lookup("x.foo.bar"), Some(8));
        assert_eq!(tree.lookup("oo.bar"), Some(9));
    }

    #[test]
    fn lookup_tree_plain_names() {
        let mut tree = CertLookupTree::new();
        let names = ["rab", "zab", "zzub", "ab"];
        for (idx, name) in names.iter().enumerate() {
            tree.add_cert(name, idx);
        }
        for (idx, name) in names.iter().enumerate() {
            assert_eq!(tree.lookup(name), Some(idx));
        }
    }

    #[test]
    fn lookup_is_insertion_order_independent() {
        let patterns = [
            ("example.com", 0),
            ("*www.example.org", 1),
            ("xy*.host.domain", 2),
            ("*.foo.bar", 3),
        ];
        let hosts = ["example.com", "2www.example.org", "xy1.host.domain", "x.foo.bar"];

        let mut forward = CertLookupTree::new();
        for (p, i) in patterns {
            forward.add_cert(p, i);
        }
        let mut reverse = CertLookupTree::new();
        for (p, i) in patterns.iter().rev() {
            reverse.add_cert(p, *i);
        }
        for host in hosts {
            assert_eq!(forward.lookup(host), reverse.lookup(host));
        }
    }

    #[test]
    fn duplicate_insert_returns_first_index() {
        let mut tree = CertLookupTree::new();
        assert_eq!(tree.add_cert("example.com", 0), 0);
        assert_eq!(tree.add_cert("example.com", 5), 0);
        assert_eq!(tree.add_cert("*.example.com", 1), 1);
        assert_eq!(tree.add_cert("*.example.com", 6), 1);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut tree = CertLookupTree::new();
        tree.add_cert("Example.COM", 0);
        assert_eq!(tree.lookup("EXAMPLE.com"), Some(0));
    }

    #[test]
    fn hostname_match_rules() {
        assert!(hostname_match("example.com", "example.com"));
        assert!(hostname_match("example.com", "EXAMPLE.com"));

        assert!(hostname_match("*.example.com", "www.example.com"));
        assert!(hostname_match("*w.example.com", "www.example.com"));
        assert!(hostname_match("www*.example.com", "www1.example.com"));
        assert!(hostname_match("www*.example.com", "WWW12.EXAMPLE.com"));
        // At least 2 dots are required after '*'.
        assert!(!hostname_match("*.com", "example.com"));
        assert!(!hostname_match("*", "example.com"));
        // '*' must be in the leftmost label.
        assert!(!hostname_match("blog.*.example.com", "blog.my.example.com"));
        assert!(!hostname_match("client*.example.com", "server.example.com"));
        // '*' must match at least one character.
        assert!(!hostname_match("www*.example.com", "www.example.com"));

        assert!(!hostname_match("example.com", "nghttp2.org"));
        assert!(!hostname_match("www.example.com", "example.com"));
        assert!(!hostname_match("example.com", "www.example.com"));
    }
}
