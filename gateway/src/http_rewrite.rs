use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};

use crate::config::{Endpoint, HttpOptions};
use crate::downstream::{ClientInfo, ConnectProto, RequestCtx};

/// Where the chosen authority goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityPlacement {
    PseudoHeader,
    HostHeader,
}

/// The fully rewritten request head ready for submission to an origin.
#[derive(Debug)]
pub struct BuiltRequest {
    pub method: Method,
    /// None for a proxy-style CONNECT.
    pub scheme: Option<String>,
    pub authority: String,
    pub authority_placement: AuthorityPlacement,
    /// None for a proxy-style CONNECT.
    pub path: Option<String>,
    /// `:protocol` for extended CONNECT tunneling.
    pub protocol: Option<&'static str>,
    pub headers: HeaderMap,
    /// Submit with a request body provider.
    pub expects_body: bool,
}

/// Headers that never cross the proxy boundary. Cookie and the
/// forwarding-related fields are handled separately by policy.
fn is_dropped_in_copy(name: &str, options: &HttpOptions) -> bool {
    match name {
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
        | "te" | "host" | "http2-settings" | "sec-websocket-key" | "via" | "forwarded"
        | "x-forwarded-for" | "x-forwarded-proto" => true,
        "early-data" => options.early_data.strip_incoming,
        "cookie" => !options.no_cookie_crumbling,
        _ => false,
    }
}

fn append(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.append(HeaderName::from_static(name), value);
    }
}

fn first_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Build the origin-side request head for one Downstream, applying the
/// host-rewrite, scheme-upgrade, tunneling, and per-header policies.
pub fn build_request(
    req: &RequestCtx,
    endpoint: &Endpoint,
    options: &HttpOptions,
    client: &ClientInfo,
    via_token: &str,
) -> BuiltRequest {
    let no_host_rewrite =
        options.no_host_rewrite || options.http2_proxy || req.regular_connect_method();

    let authority = if no_host_rewrite && !req.authority.is_empty() {
        req.authority.clone()
    } else {
        endpoint.hostport()
    };

    let (method, protocol) = match req.connect_proto {
        ConnectProto::Websocket => (Method::CONNECT, Some("websocket")),
        _ => (req.method.clone(), None),
    };

    let (scheme, path, authority_placement) = if req.regular_connect_method() {
        (None, None, AuthorityPlacement::PseudoHeader)
    } else {
        let scheme = if endpoint.tls && endpoint.upgrade_scheme && req.scheme == "http" {
            "https".to_string()
        } else {
            req.scheme.clone()
        };
        let path = if req.method == Method::OPTIONS && req.path.is_empty() {
            "*".to_string()
        } else {
            req.path.clone()
        };
        let placement = if !req.no_authority || req.connect_proto != ConnectProto::None {
            AuthorityPlacement::PseudoHeader
        } else {
            AuthorityPlacement::HostHeader
        };
        (Some(scheme), Some(path), placement)
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len() + 8);
    for (name, value) in req.headers.iter() {
        if is_dropped_in_copy(name.as_str(), options) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !options.no_cookie_crumbling {
        crumble_cookies(&req.headers, &mut headers);
    }

    if !client.tls_handshake_finished {
        append(&mut headers, "early-data", "1");
    }

    let fwd_in = if options.forwarded.strip_incoming {
        None
    } else {
        first_value(&req.headers, "forwarded")
    };
    if options.forwarded.params.any() {
        let mut params = options.forwarded.params;
        if options.http2_proxy || req.regular_connect_method() {
            params.proto = false;
        }
        let value = create_forwarded(params, client, &req.authority, &req.scheme);
        match (fwd_in, value.is_empty()) {
            (Some(existing), false) => {
                append(&mut headers, "forwarded", &format!("{existing}, {value}"))
            }
            (Some(existing), true) => append(&mut headers, "forwarded", existing),
            (None, false) => append(&mut headers, "forwarded", &value),
            (None, true) => {}
        }
    } else if let Some(existing) = fwd_in {
        append(&mut headers, "forwarded", existing);
    }

    let xff_in = if options.xff.strip_incoming {
        None
    } else {
        first_value(&req.headers, "x-forwarded-for")
    };
    if options.xff.add {
        let value = match xff_in {
            Some(existing) => format!("{existing}, {}", client.peer_ip),
            None => client.peer_ip.clone(),
        };
        append(&mut headers, "x-forwarded-for", &value);
    } else if let Some(existing) = xff_in {
        append(&mut headers, "x-forwarded-for", existing);
    }

    if !options.http2_proxy && !req.regular_connect_method() {
        let xfp_in = if options.xfp.strip_incoming {
            None
        } else {
            first_value(&req.headers, "x-forwarded-proto")
        };
        if options.xfp.add {
            // Matches the :scheme sent on the wire before any upgrade.
            let value = match xfp_in {
                Some(existing) => format!("{existing}, {}", req.scheme),
                None => req.scheme.clone(),
            };
            append(&mut headers, "x-forwarded-proto", &value);
        } else if let Some(existing) = xfp_in {
            append(&mut headers, "x-forwarded-proto", existing);
        }
    }

    let via_in = first_value(&req.headers, "via");
    if options.no_via {
        if let Some(existing) = via_in {
            append(&mut headers, "via", existing);
        }
    } else {
        let own = via_value(req.http_major, req.http_minor, via_token);
        let value = match via_in {
            Some(existing) => format!("{existing}, {own}"),
            None => own,
        };
        append(&mut headers, "via", &value);
    }

    // HTTP/1 clients may list keywords other than "trailers"; only that one
    // is forwarded.
    if let Some(te) = first_value(&req.headers, "te") {
        if te
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case("trailers"))
        {
            append(&mut headers, "te", "trailers");
        }
    }

    for (name, value) in &options.add_request_headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    // A body provider is attached whenever body bytes can still arrive,
    // including chunked requests with no declared length.
    let expects_body = req.method == Method::CONNECT
        || req.connect_proto != ConnectProto::None
        || req.chunked
        || req.content_length.map(|n| n > 0).unwrap_or(false)
        || req.expect_body;

    BuiltRequest {
        method,
        scheme,
        authority,
        authority_placement,
        path,
        protocol,
        headers,
        expects_body,
    }
}

fn crumble_cookies(incoming: &HeaderMap, out: &mut HeaderMap) {
    for value in incoming.get_all("cookie") {
        let Ok(value) = value.to_str() else { continue };
        for crumb in value.split(';') {
            let crumb = crumb.trim();
            if !crumb.is_empty() {
                append(out, "cookie", crumb);
            }
        }
    }
}

fn via_value(major: u8, minor: u8, token: &str) -> String {
    if major >= 2 {
        format!("{major} {token}")
    } else {
        format!("{major}.{minor} {token}")
    }
}

fn create_forwarded(
    params: crate::config::ForwardedParams,
    client: &ClientInfo,
    authority: &str,
    scheme: &str,
) -> String {
    let mut parts = Vec::new();
    if params.by && !client.local_hostport.is_empty() {
        parts.push(format!("by={}", client.local_hostport));
    }
    if params.for_ && !client.peer_ip.is_empty() {
        parts.push(format!("for={}", client.peer_ip));
    }
    if params.host && !authority.is_empty() {
        parts.push(format!("host={authority}"));
    }
    if params.proto && !scheme.is_empty() {
        parts.push(format!("proto={scheme}"));
    }
    parts.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForwardedParams, OriginProtocol};

    fn endpoint(tls: bool, upgrade_scheme: bool) -> Endpoint {
        Endpoint {
            host: "origin.internal".to_string(),
            port: 3000,
            tls,
            upgrade_scheme,
            protocol: OriginProtocol::Http2,
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            peer_ip: "192.0.2.1".to_string(),
            local_hostport: "10.0.0.1:443".to_string(),
            tls_handshake_finished: true,
        }
    }

    fn base_request() -> RequestCtx {
        RequestCtx {
            method: Method::GET,
            scheme: "http".to_string(),
            authority: "app.example.com".to_string(),
            path: "/index.html".to_string(),
            http_major: 2,
            http_minor: 0,
            ..RequestCtx::default()
        }
    }

    #[test]
    fn scheme_upgrade_and_xff_append() {
        let mut req = base_request();
        req.headers
            .insert("x-forwarded-for", "198.51.100.9".parse().unwrap());
        let mut options = HttpOptions::default();
        options.no_host_rewrite = true;
        options.xff.add = true;

        let built = build_request(&req, &endpoint(true, true), &options, &client(), "gateway");

        assert_eq!(built.scheme.as_deref(), Some("https"));
        assert_eq!(built.authority, "app.example.com");
        assert_eq!(built.authority_placement, AuthorityPlacement::PseudoHeader);
        assert_eq!(
            built.headers.get("x-forwarded-for").unwrap(),
            "198.51.100.9, 192.0.2.1"
        );
    }

    #[test]
    fn host_rewrite_uses_origin_hostport() {
        let req = base_request();
        let options = HttpOptions::default();
        let built = build_request(&req, &endpoint(false, false), &options, &client(), "gateway");
        assert_eq!(built.authority, "origin.internal:3000");
        assert_eq!(built.scheme.as_deref(), Some("http"));
    }

    #[test]
    fn websocket_tunnel_uses_extended_connect() {
        let mut req = base_request();
        req.connect_proto = ConnectProto::Websocket;
        req.headers
            .insert("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap());
        req.headers
            .insert("sec-websocket-version", "13".parse().unwrap());

        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client(),
            "gateway",
        );

        assert_eq!(built.method, Method::CONNECT);
        assert_eq!(built.protocol, Some("websocket"));
        assert!(built.headers.get("sec-websocket-key").is_none());
        assert!(built.headers.get("sec-websocket-version").is_some());
        assert!(built.expects_body);
    }

    #[test]
    fn options_asterisk_form() {
        let mut req = base_request();
        req.method = Method::OPTIONS;
        req.path = String::new();
        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client(),
            "gateway",
        );
        assert_eq!(built.path.as_deref(), Some("*"));
    }

    #[test]
    fn regular_connect_keeps_client_authority() {
        let mut req = base_request();
        req.method = Method::CONNECT;
        req.authority = "tunnel.example.com:443".to_string();
        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client(),
            "gateway",
        );
        assert_eq!(built.authority, "tunnel.example.com:443");
        assert!(built.scheme.is_none());
        assert!(built.path.is_none());
        assert!(built.expects_body);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut req = base_request();
        req.headers.insert("connection", "upgrade".parse().unwrap());
        req.headers.insert("upgrade", "websocket".parse().unwrap());
        req.headers.insert("keep-alive", "timeout=5".parse().unwrap());
        req.headers
            .insert("transfer-encoding", "chunked".parse().unwrap());
        req.headers.insert("te", "trailers, deflate".parse().unwrap());
        req.headers.insert("accept", "*/*".parse().unwrap());

        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client(),
            "gateway",
        );

        for name in ["connection", "upgrade", "keep-alive", "transfer-encoding"] {
            assert!(built.headers.get(name).is_none(), "{name} leaked");
        }
        assert_eq!(built.headers.get("te").unwrap(), "trailers");
        assert_eq!(built.headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn cookies_are_crumbled() {
        let mut req = base_request();
        req.headers
            .insert("cookie", "alpha=1; beta=2; gamma=3".parse().unwrap());
        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client(),
            "gateway",
        );
        let crumbs: Vec<_> = built.headers.get_all("cookie").iter().collect();
        assert_eq!(crumbs, ["alpha=1", "beta=2", "gamma=3"]);

        let mut options = HttpOptions::default();
        options.no_cookie_crumbling = true;
        let built = build_request(&req, &endpoint(false, false), &options, &client(), "gateway");
        let crumbs: Vec<_> = built.headers.get_all("cookie").iter().collect();
        assert_eq!(crumbs, ["alpha=1; beta=2; gamma=3"]);
    }

    #[test]
    fn via_is_appended_unless_disabled() {
        let mut req = base_request();
        req.headers.insert("via", "1.1 edge1".parse().unwrap());
        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client(),
            "gateway",
        );
        assert_eq!(built.headers.get("via").unwrap(), "1.1 edge1, 2 gateway");

        let mut options = HttpOptions::default();
        options.no_via = true;
        let built = build_request(&req, &endpoint(false, false), &options, &client(), "gateway");
        assert_eq!(built.headers.get("via").unwrap(), "1.1 edge1");
    }

    #[test]
    fn early_data_marker_during_handshake() {
        let req = base_request();
        let mut client = client();
        client.tls_handshake_finished = false;
        let built = build_request(
            &req,
            &endpoint(false, false),
            &HttpOptions::default(),
            &client,
            "gateway",
        );
        assert_eq!(built.headers.get("early-data").unwrap(), "1");
    }

    #[test]
    fn forwarded_params_respect_connect_and_merge() {
        let mut req = base_request();
        req.headers
            .insert("forwarded", "for=203.0.113.5".parse().unwrap());
        let mut options = HttpOptions::default();
        options.forwarded.params = ForwardedParams {
            by: false,
            for_: true,
            host: false,
            proto: true,
        };

        let built = build_request(&req, &endpoint(false, false), &options, &client(), "gateway");
        assert_eq!(
            built.headers.get("forwarded").unwrap(),
            "for=203.0.113.5, for=192.0.2.1;proto=http"
        );

        options.http2_proxy = true;
        let built = build_request(&req, &endpoint(false, false), &options, &client(), "gateway");
        assert_eq!(
            built.headers.get("forwarded").unwrap(),
            "for=203.0.113.5, for=192.0.2.1"
        );
    }

    #[test]
    fn body_provider_conditions() {
        let mut req = base_request();
        assert!(!build_request(&req, &endpoint(false, false), &HttpOptions::default(), &client(), "g").expects_body);

        req.content_length = Some(10);
        assert!(build_request(&req, &endpoint(false, false), &HttpOptions::default(), &client(), "g").expects_body);

        req.content_length = None;
        req.chunked = true;
        assert!(build_request(&req, &endpoint(false, false), &HttpOptions::default(), &client(), "g").expects_body);

        req.chunked = false;
        req.expect_body = true;
        assert!(build_request(&req, &endpoint(false, false), &HttpOptions::default(), &client(), "g").expects_body);
    }
}
