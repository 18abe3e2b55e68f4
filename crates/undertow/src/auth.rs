use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::header::{HeaderMap, PROXY_AUTHORIZATION};

/// Proxy credentials required from CONNECT and absolute-form callers
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Both parts must be set for authentication to be enforced
    pub fn new(user: Option<String>, password: Option<String>) -> Option<Self> {
        match (user, password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some(Self { user, password })
            }
            _ => None,
        }
    }

    /// Whether `headers` carry a matching `Proxy-Authorization`
    pub fn authorize(&self, headers: &HeaderMap) -> bool {
        headers
            .get(PROXY_AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_basic_proxy_auth)
            .is_some_and(|(user, password)| user == self.user && password == self.password)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Parse a `Basic` authorization value into user and password
///
/// `"Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="` yields `("Aladdin", "open sesame")`.
pub fn parse_basic_proxy_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_parse_basic_proxy_auth() {
        assert_eq!(
            parse_basic_proxy_auth("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="),
            Some(("Aladdin".to_string(), "open sesame".to_string()))
        );
        // Password may contain colons
        assert_eq!(
            parse_basic_proxy_auth(&format!("Basic {}", STANDARD.encode("u:p:q"))),
            Some(("u".to_string(), "p:q".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_malformed_values() {
        assert_eq!(parse_basic_proxy_auth(""), None);
        assert_eq!(parse_basic_proxy_auth("Bearer QWxhZGRpbjpvcGVuIHNlc2FtZQ=="), None);
        assert_eq!(parse_basic_proxy_auth("basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="), None);
        assert_eq!(parse_basic_proxy_auth("Basic not-base64!"), None);
        assert_eq!(
            parse_basic_proxy_auth(&format!("Basic {}", STANDARD.encode("nocolon"))),
            None
        );
    }

    #[test]
    fn test_authorize() {
        let credentials = Credentials::new(Some("Aladdin".into()), Some("open sesame".into()))
            .unwrap();

        let mut headers = HeaderMap::new();
        assert!(!credentials.authorize(&headers));

        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="),
        );
        assert!(credentials.authorize(&headers));

        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ"),
        );
        assert!(!credentials.authorize(&headers));
    }

    #[test]
    fn test_incomplete_credentials_disable_auth() {
        assert!(Credentials::new(Some("user".into()), None).is_none());
        assert!(Credentials::new(Some("user".into()), Some(String::new())).is_none());
        assert!(Credentials::new(None, None).is_none());
    }
}
