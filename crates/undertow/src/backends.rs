use std::collections::HashMap;

/// Local backends that routed streams are delivered to
///
/// With no map every stream goes to the default backend. With a map, the
/// forwarded host of a stream picks the backend, trying keys in this order:
///
/// 1. exact `host:port`
/// 2. `port`
/// 3. `0.0.0.0:port`
/// 4. `host`
///
/// and falling back to the default backend.
#[derive(Debug, Clone, Default)]
pub struct Backends {
    default: Option<String>,
    map: HashMap<String, String>,
}

impl Backends {
    /// Every stream goes to `addr`
    pub fn single(addr: impl Into<String>) -> Self {
        Self {
            default: Some(addr.into()),
            map: HashMap::new(),
        }
    }

    pub fn new(default: Option<String>, map: HashMap<String, String>) -> Self {
        let map = map
            .into_iter()
            .map(|(key, addr)| (key.to_ascii_lowercase(), addr))
            .collect();
        Self { default, map }
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.map.is_empty()
    }

    /// Backend address for a stream whose forwarded host is `forwarded_host`
    pub fn select(&self, forwarded_host: &str) -> Option<&str> {
        if self.map.is_empty() {
            return self.default.as_deref();
        }

        let forwarded_host = forwarded_host.to_ascii_lowercase();
        let (host, port) = split_host_port(&forwarded_host);

        let mut candidates = vec![forwarded_host.clone()];
        if let Some(port) = port {
            candidates.push(port.to_string());
            candidates.push(format!("0.0.0.0:{}", port));
        }
        candidates.push(host.to_string());

        candidates
            .iter()
            .find_map(|key| self.map.get(key))
            .or(self.default.as_ref())
            .map(String::as_str)
    }
}

/// Split `host:port`, `[v6]:port` or a bare host
fn split_host_port(authority: &str) -> (&str, Option<&str>) {
    if let Some(rest) = authority.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => (authority, None),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (authority, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(default: Option<&str>, entries: &[(&str, &str)]) -> Backends {
        Backends::new(
            default.map(str::to_string),
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_single_backend_takes_everything() {
        let backends = Backends::single("127.0.0.1:3000");
        assert_eq!(backends.select("a.example:80"), Some("127.0.0.1:3000"));
        assert_eq!(backends.select(""), Some("127.0.0.1:3000"));
    }

    #[test]
    fn test_precedence_with_overlapping_keys() {
        let backends = backends(
            Some("default:1"),
            &[
                ("a.example:8080", "exact:1"),
                ("8080", "port:1"),
                ("0.0.0.0:8080", "any:1"),
                ("a.example", "host:1"),
            ],
        );

        assert_eq!(backends.select("a.example:8080"), Some("exact:1"));
        assert_eq!(backends.select("b.example:8080"), Some("port:1"));
        assert_eq!(backends.select("a.example:9090"), Some("host:1"));
        assert_eq!(backends.select("a.example"), Some("host:1"));
        assert_eq!(backends.select("b.example:9090"), Some("default:1"));
    }

    #[test]
    fn test_any_address_key_beats_host() {
        let backends = backends(None, &[("0.0.0.0:22", "ssh:22"), ("a.example", "host:1")]);

        assert_eq!(backends.select("a.example:22"), Some("ssh:22"));
        assert_eq!(backends.select("127.0.0.1:22"), Some("ssh:22"));
        assert_eq!(backends.select("c.example:80"), None);
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let backends = backends(None, &[("A.Example", "host:1")]);
        assert_eq!(backends.select("a.EXAMPLE:443"), Some("host:1"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.example:80"), ("a.example", Some("80")));
        assert_eq!(split_host_port("a.example"), ("a.example", None));
        assert_eq!(split_host_port("[::1]:8080"), ("::1", Some("8080")));
        assert_eq!(split_host_port("::1"), ("::1", None));
    }
}
