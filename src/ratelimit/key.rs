//! Rate limit key derivation from requests.

use std::net::{IpAddr, Ipv6Addr};

use http::Request;
use ipnet::{IpNet, Ipv6Net};

use crate::error::{Result, SlidegateError};
use crate::proxy::RemoteAddr;

/// Separator written after every component of a composed key.
pub const KEY_SEPARATOR: char = ':';

/// Client IP header set by trust-boundary proxies and CDNs.
pub const TRUE_CLIENT_IP: &str = "true-client-ip";
/// Client IP header set by nginx-style proxies.
pub const X_REAL_IP: &str = "x-real-ip";
/// Comma-separated chain of client and proxy addresses.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Strategy for turning a request into a rate limit key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyDeriver {
    /// The same key for every request, limiting all clients together.
    Fixed(String),
    /// The connection peer address. Ignores client-supplied headers.
    ConnectionAddress,
    /// The client address declared by upstream proxies, falling back to the
    /// connection peer address.
    ///
    /// With an empty trusted list the headers are always honored. Otherwise
    /// they are only honored when the peer is inside one of the networks.
    DeclaredClientAddress {
        /// Networks of proxies allowed to declare the client address
        trusted_proxies: Vec<IpNet>,
    },
    /// The request path.
    Path,
    /// Every component key followed by `KEY_SEPARATOR`, in order.
    Composed(Vec<KeyDeriver>),
}

impl KeyDeriver {
    /// A deriver that always returns `key`.
    pub fn fixed(key: impl Into<String>) -> Self {
        KeyDeriver::Fixed(key.into())
    }

    /// Key by connection peer address.
    pub fn by_ip() -> Self {
        KeyDeriver::ConnectionAddress
    }

    /// Key by proxy-declared client address, trusting any peer.
    pub fn by_real_ip() -> Self {
        KeyDeriver::DeclaredClientAddress {
            trusted_proxies: Vec::new(),
        }
    }

    /// Key by proxy-declared client address, trusting only peers inside `trusted_proxies`.
    pub fn by_real_ip_from(trusted_proxies: Vec<IpNet>) -> Self {
        KeyDeriver::DeclaredClientAddress { trusted_proxies }
    }

    /// Key by request path.
    pub fn by_path() -> Self {
        KeyDeriver::Path
    }

    /// Combine several derivers into one compound key.
    pub fn composed(derivers: Vec<KeyDeriver>) -> Self {
        KeyDeriver::Composed(derivers)
    }

    /// Derive the key for a request.
    pub fn derive<B>(&self, req: &Request<B>) -> Result<String> {
        match self {
            KeyDeriver::Fixed(key) => Ok(key.clone()),
            KeyDeriver::ConnectionAddress => key_by_ip(req),
            KeyDeriver::DeclaredClientAddress { trusted_proxies } => {
                key_by_real_ip(req, trusted_proxies)
            }
            KeyDeriver::Path => Ok(req.uri().path().to_string()),
            KeyDeriver::Composed(derivers) => {
                let mut key = String::new();
                for deriver in derivers {
                    key.push_str(&deriver.derive(req)?);
                    key.push(KEY_SEPARATOR);
                }
                Ok(key)
            }
        }
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        KeyDeriver::fixed("*")
    }
}

/// The connection peer address, with IPv4-mapped IPv6 reported as IPv4.
fn peer_ip<B>(req: &Request<B>) -> Result<IpAddr> {
    req.extensions()
        .get::<RemoteAddr>()
        .map(|peer| peer.ip().to_canonical())
        .ok_or_else(|| {
            SlidegateError::KeyDerivation("connection address is not available".to_string())
        })
}

fn key_by_ip<B>(req: &Request<B>) -> Result<String> {
    Ok(canonicalize_ip(&peer_ip(req)?.to_string()))
}

fn key_by_real_ip<B>(req: &Request<B>, trusted_proxies: &[IpNet]) -> Result<String> {
    if trusted_proxies.is_empty() {
        return match declared_client_ip(req)? {
            Some(ip) => Ok(canonicalize_ip(&ip)),
            None => key_by_ip(req),
        };
    }

    let peer = peer_ip(req)?;
    if trusted_proxies.iter().any(|net| net.contains(&peer)) {
        if let Some(ip) = declared_client_ip(req)? {
            return Ok(canonicalize_ip(&ip));
        }
    }

    Ok(canonicalize_ip(&peer.to_string()))
}

/// The client address declared in request headers, if any.
///
/// `True-Client-IP` wins over `X-Real-IP`, which wins over the first entry of
/// `X-Forwarded-For`.
fn declared_client_ip<B>(req: &Request<B>) -> Result<Option<String>> {
    for name in [TRUE_CLIENT_IP, X_REAL_IP] {
        if let Some(value) = header_str(req, name)? {
            return Ok(Some(value.to_string()));
        }
    }

    Ok(header_str(req, X_FORWARDED_FOR)?.map(|xff| first_forwarded_for(xff).to_string()))
}

fn header_str<'a, B>(req: &'a Request<B>, name: &str) -> Result<Option<&'a str>> {
    match req.headers().get(name) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|e| {
            SlidegateError::KeyDerivation(format!("malformed {} header: {}", name, e))
        }),
    }
}

/// The first entry of an `X-Forwarded-For` value.
pub fn first_forwarded_for(value: &str) -> &str {
    match value.find(", ") {
        Some(end) => &value[..end],
        None => value,
    }
}

/// Reduce an address to the form used for rate limit keys.
///
/// IPv4 addresses are kept as they are. IPv6 addresses are masked to their
/// /64 prefix, since providers usually hand a whole /64 to a single
/// customer. Anything else is returned unchanged.
pub fn canonicalize_ip(ip: &str) -> String {
    // A '.' before any ':' marks IPv4, including IPv4 with a port.
    match ip.find(|c: char| c == '.' || c == ':') {
        Some(pos) if ip.as_bytes()[pos] == b':' => {}
        _ => return ip.to_string(),
    }

    match ip.parse::<Ipv6Addr>() {
        Ok(addr) => match Ipv6Net::new(addr, 64) {
            Ok(net) => net.network().to_string(),
            Err(_) => ip.to_string(),
        },
        Err(_) => ip.to_string(),
    }
}

/// Parse a CIDR or bare address into a network.
pub fn parse_trusted_proxy(value: &str) -> Result<IpNet> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| SlidegateError::Config(format!("invalid trusted proxy '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn request(path: &str, peer: Option<&str>, headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(()).unwrap();
        if let Some(peer) = peer {
            let addr: SocketAddr = peer.parse().unwrap();
            req.extensions_mut().insert(RemoteAddr(addr));
        }
        req
    }

    #[test]
    fn test_canonicalize_ipv4_unchanged() {
        assert_eq!(canonicalize_ip("203.0.113.5"), "203.0.113.5");
        assert_eq!(canonicalize_ip("203.0.113.5:1234"), "203.0.113.5:1234");
    }

    #[test]
    fn test_canonicalize_ipv6_masks_to_prefix() {
        assert_eq!(canonicalize_ip("2001:db8:abcd:0012::1"), "2001:db8:abcd:12::");
        assert_eq!(
            canonicalize_ip("2001:db8:abcd:12:ffff:1:2:3"),
            "2001:db8:abcd:12::"
        );
    }

    #[test]
    fn test_canonicalize_non_ip_unchanged() {
        assert_eq!(canonicalize_ip("api-key-123"), "api-key-123");
        assert_eq!(canonicalize_ip(""), "");
    }

    #[test]
    fn test_canonicalize_unparsable_ipv6_unchanged() {
        assert_eq!(canonicalize_ip("not:an:address"), "not:an:address");
    }

    #[test]
    fn test_first_forwarded_for() {
        assert_eq!(first_forwarded_for("1.2.3.4, 5.6.7.8"), "1.2.3.4");
        assert_eq!(first_forwarded_for("1.2.3.4"), "1.2.3.4");
        // Only ", " separates entries.
        assert_eq!(first_forwarded_for("1.2.3.4,5.6.7.8"), "1.2.3.4,5.6.7.8");
    }

    #[test]
    fn test_fixed_key() {
        let req = request("/", None, &[]);
        assert_eq!(KeyDeriver::fixed("global").derive(&req).unwrap(), "global");
    }

    #[test]
    fn test_by_ip_ignores_headers() {
        let req = request("/", Some("10.0.0.1:5"), &[(X_REAL_IP, "1.1.1.1")]);
        assert_eq!(KeyDeriver::by_ip().derive(&req).unwrap(), "10.0.0.1");
    }

    #[test]
    fn test_by_ip_drops_port() {
        let req = request("/", Some("203.0.113.5:1234"), &[]);
        assert_eq!(KeyDeriver::by_ip().derive(&req).unwrap(), "203.0.113.5");
    }

    #[test]
    fn test_by_ip_canonicalizes_ipv6_peer() {
        let req = request("/", Some("[2001:db8:abcd:12::1]:443"), &[]);
        assert_eq!(KeyDeriver::by_ip().derive(&req).unwrap(), "2001:db8:abcd:12::");
    }

    #[test]
    fn test_by_ip_without_peer_fails() {
        let req = request("/", None, &[]);
        let err = KeyDeriver::by_ip().derive(&req).unwrap_err();
        assert!(matches!(err, SlidegateError::KeyDerivation(_)));
    }

    #[test]
    fn test_real_ip_header_precedence() {
        let peer = Some("10.0.0.1:5");
        let deriver = KeyDeriver::by_real_ip();

        let req = request(
            "/",
            peer,
            &[
                (TRUE_CLIENT_IP, "1.1.1.1"),
                (X_REAL_IP, "2.2.2.2"),
                (X_FORWARDED_FOR, "3.3.3.3, 4.4.4.4"),
            ],
        );
        assert_eq!(deriver.derive(&req).unwrap(), "1.1.1.1");

        let req = request(
            "/",
            peer,
            &[(X_REAL_IP, "2.2.2.2"), (X_FORWARDED_FOR, "3.3.3.3, 4.4.4.4")],
        );
        assert_eq!(deriver.derive(&req).unwrap(), "2.2.2.2");

        let req = request("/", peer, &[(X_FORWARDED_FOR, "3.3.3.3, 4.4.4.4")]);
        assert_eq!(deriver.derive(&req).unwrap(), "3.3.3.3");

        let req = request("/", peer, &[]);
        assert_eq!(deriver.derive(&req).unwrap(), "10.0.0.1");
    }

    #[test]
    fn test_real_ip_canonicalizes_header_value() {
        let req = request("/", Some("10.0.0.1:5"), &[(X_REAL_IP, "2001:db8:1:2:3:4:5:6")]);
        assert_eq!(KeyDeriver::by_real_ip().derive(&req).unwrap(), "2001:db8:1:2::");
    }

    #[test]
    fn test_real_ip_malformed_header_fails() {
        let mut req = request("/", Some("10.0.0.1:5"), &[]);
        req.headers_mut().insert(
            X_REAL_IP,
            http::HeaderValue::from_bytes(b"\xff\xfe").unwrap(),
        );
        let err = KeyDeriver::by_real_ip().derive(&req).unwrap_err();
        assert!(matches!(err, SlidegateError::KeyDerivation(_)));
    }

    #[test]
    fn test_real_ip_untrusted_peer_uses_connection_address() {
        let trusted = vec![parse_trusted_proxy("192.168.0.0/16").unwrap()];
        let deriver = KeyDeriver::by_real_ip_from(trusted);

        let from_proxy = request("/", Some("192.168.1.10:80"), &[(X_REAL_IP, "1.1.1.1")]);
        assert_eq!(deriver.derive(&from_proxy).unwrap(), "1.1.1.1");

        let direct = request("/", Some("10.0.0.1:80"), &[(X_REAL_IP, "1.1.1.1")]);
        assert_eq!(deriver.derive(&direct).unwrap(), "10.0.0.1");
    }

    #[test]
    fn test_by_path() {
        let req = request("/api/users?page=2", None, &[]);
        assert_eq!(KeyDeriver::by_path().derive(&req).unwrap(), "/api/users");
    }

    #[test]
    fn test_composed_key() {
        let req = request("/a", Some("10.0.0.1:5"), &[]);
        let deriver = KeyDeriver::composed(vec![KeyDeriver::by_path(), KeyDeriver::by_ip()]);
        assert_eq!(deriver.derive(&req).unwrap(), "/a:10.0.0.1:");
    }

    #[test]
    fn test_composed_key_returns_first_failure() {
        let mut req = request("/a", None, &[]);
        req.headers_mut().insert(
            X_REAL_IP,
            http::HeaderValue::from_bytes(b"\xff\xfe").unwrap(),
        );

        let header_first = KeyDeriver::composed(vec![
            KeyDeriver::by_path(),
            KeyDeriver::by_real_ip(),
            KeyDeriver::by_ip(),
        ]);
        let err = header_first.derive(&req).unwrap_err();
        assert!(
            matches!(&err, SlidegateError::KeyDerivation(msg) if msg.contains("malformed x-real-ip")),
            "unexpected error: {}",
            err
        );

        let peer_first = KeyDeriver::composed(vec![KeyDeriver::by_ip(), KeyDeriver::by_real_ip()]);
        let err = peer_first.derive(&req).unwrap_err();
        assert!(
            matches!(&err, SlidegateError::KeyDerivation(msg) if msg.contains("connection address")),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_real_ip_headers_do_not_need_peer() {
        let req = request("/", None, &[(X_REAL_IP, "2.2.2.2")]);
        assert_eq!(KeyDeriver::by_real_ip().derive(&req).unwrap(), "2.2.2.2");
    }

    #[test]
    fn test_ipv4_mapped_peers_keep_separate_keys() {
        let a = request("/", Some("[::ffff:1.2.3.4]:5"), &[]);
        let b = request("/", Some("[::ffff:9.8.7.6]:5"), &[]);

        assert_eq!(KeyDeriver::by_ip().derive(&a).unwrap(), "1.2.3.4");
        assert_eq!(KeyDeriver::by_ip().derive(&b).unwrap(), "9.8.7.6");
        assert_eq!(KeyDeriver::by_real_ip().derive(&a).unwrap(), "1.2.3.4");
    }

    #[test]
    fn test_ipv4_mapped_peer_matches_ipv4_trusted_network() {
        let deriver =
            KeyDeriver::by_real_ip_from(vec![parse_trusted_proxy("192.168.0.0/16").unwrap()]);

        let from_proxy = request(
            "/",
            Some("[::ffff:192.168.1.10]:80"),
            &[(X_REAL_IP, "1.1.1.1")],
        );
        assert_eq!(deriver.derive(&from_proxy).unwrap(), "1.1.1.1");

        let direct = request("/", Some("[::ffff:8.8.8.8]:80"), &[(X_REAL_IP, "1.1.1.1")]);
        assert_eq!(deriver.derive(&direct).unwrap(), "8.8.8.8");
    }

    #[test]
    fn test_parse_trusted_proxy() {
        assert_eq!(
            parse_trusted_proxy("10.0.0.0/8").unwrap().to_string(),
            "10.0.0.0/8"
        );
        assert_eq!(
            parse_trusted_proxy("10.1.2.3").unwrap().to_string(),
            "10.1.2.3/32"
        );
        assert!(parse_trusted_proxy("nope").is_err());
    }
}
