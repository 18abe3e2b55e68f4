use http::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;

use crate::messages::{Action, ControlMessage, Protocol};

pub const ACTION_HEADER: &str = "action";
pub const PROTOCOL_HEADER: &str = "protocol";
pub const FORWARDED_HOST_HEADER: &str = "forwarded-host";
pub const FORWARDED_FOR_HEADER: &str = "forwarded-for";
pub const FORWARDED_BY_HEADER: &str = "forwarded-by";
pub const URL_PATH_HEADER: &str = "url-path";
pub const REMOTE_ADDR_HEADER: &str = "remote-addr";

/// Errors that can occur while encoding or decoding a control message
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid value for header {0}")]
    InvalidHeader(&'static str),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
}

/// Header wire form
///
/// ```text
/// action:         client-session
/// protocol:       http | http-connect | tcp
/// forwarded-host: <host[:port]>      (optional)
/// forwarded-for:  <ip:port>          (optional)
/// forwarded-by:   <host or address>  (optional)
/// url-path:       <path>             (optional)
/// remote-addr:    <ip>               (optional)
/// ```
impl ControlMessage {
    /// Write the message into `headers`, replacing any previous values
    pub fn write_to(&self, headers: &mut HeaderMap) -> Result<(), ProtocolError> {
        headers.insert(
            HeaderName::from_static(ACTION_HEADER),
            HeaderValue::from_static(self.action.as_str()),
        );
        headers.insert(
            HeaderName::from_static(PROTOCOL_HEADER),
            HeaderValue::from_static(self.protocol.as_str()),
        );

        let optional = [
            (FORWARDED_HOST_HEADER, &self.forwarded_host),
            (FORWARDED_FOR_HEADER, &self.forwarded_for),
            (FORWARDED_BY_HEADER, &self.forwarded_by),
            (URL_PATH_HEADER, &self.url_path),
            (REMOTE_ADDR_HEADER, &self.remote_addr),
        ];
        for (name, value) in optional {
            if value.is_empty() {
                headers.remove(name);
                continue;
            }
            let value =
                HeaderValue::from_str(value).map_err(|_| ProtocolError::InvalidHeader(name))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        Ok(())
    }

    /// Read a message back from request headers
    pub fn read_from(headers: &HeaderMap) -> Result<Self, ProtocolError> {
        let action: Action = required(headers, ACTION_HEADER)?.parse()?;
        let protocol: Protocol = required(headers, PROTOCOL_HEADER)?.parse()?;

        Ok(Self {
            action,
            protocol,
            forwarded_host: optional(headers, FORWARDED_HOST_HEADER)?,
            forwarded_for: optional(headers, FORWARDED_FOR_HEADER)?,
            forwarded_by: optional(headers, FORWARDED_BY_HEADER)?,
            url_path: optional(headers, URL_PATH_HEADER)?,
            remote_addr: optional(headers, REMOTE_ADDR_HEADER)?,
        })
    }
}

fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ProtocolError> {
    headers
        .get(name)
        .ok_or(ProtocolError::MissingHeader(name))?
        .to_str()
        .map_err(|_| ProtocolError::InvalidHeader(name))
}

fn optional(headers: &HeaderMap, name: &'static str) -> Result<String, ProtocolError> {
    match headers.get(name) {
        Some(value) => value
            .to_str()
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidHeader(name)),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated(action: Action, protocol: Protocol) -> ControlMessage {
        ControlMessage {
            action,
            protocol,
            forwarded_host: "a.example:8080".to_string(),
            forwarded_for: "203.0.113.7:51234".to_string(),
            forwarded_by: "0.0.0.0:2222".to_string(),
            url_path: "/some/path".to_string(),
            remote_addr: "203.0.113.7".to_string(),
        }
    }

    #[test]
    fn test_roundtrip_every_action_and_protocol() {
        for action in Action::ALL {
            for protocol in Protocol::ALL {
                let msg = populated(action, protocol);
                let mut headers = HeaderMap::new();
                msg.write_to(&mut headers).unwrap();

                let decoded = ControlMessage::read_from(&headers).unwrap();
                assert_eq!(decoded, msg);
            }
        }
    }

    #[test]
    fn test_roundtrip_with_unset_fields() {
        let msg = ControlMessage::session(Protocol::Tcp);
        let mut headers = HeaderMap::new();
        msg.write_to(&mut headers).unwrap();

        assert!(headers.get(URL_PATH_HEADER).is_none());
        assert_eq!(ControlMessage::read_from(&headers).unwrap(), msg);
    }

    #[test]
    fn test_write_replaces_stale_fields() {
        let mut headers = HeaderMap::new();
        populated(Action::RequestClientSession, Protocol::Http)
            .write_to(&mut headers)
            .unwrap();

        let msg = ControlMessage::session(Protocol::Tcp);
        msg.write_to(&mut headers).unwrap();

        assert_eq!(ControlMessage::read_from(&headers).unwrap(), msg);
    }

    #[test]
    fn test_missing_protocol_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTION_HEADER, HeaderValue::from_static("client-session"));

        match ControlMessage::read_from(&headers) {
            Err(ProtocolError::MissingHeader(name)) => assert_eq!(name, PROTOCOL_HEADER),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_values_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTION_HEADER, HeaderValue::from_static("client-session"));
        headers.insert(PROTOCOL_HEADER, HeaderValue::from_static("udp"));
        assert!(matches!(
            ControlMessage::read_from(&headers),
            Err(ProtocolError::UnknownProtocol(_))
        ));

        headers.insert(ACTION_HEADER, HeaderValue::from_static("register"));
        assert!(matches!(
            ControlMessage::read_from(&headers),
            Err(ProtocolError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_unencodable_value_is_rejected() {
        let mut msg = ControlMessage::session(Protocol::Http);
        msg.url_path = "/bad\npath".to_string();

        let mut headers = HeaderMap::new();
        match msg.write_to(&mut headers) {
            Err(ProtocolError::InvalidHeader(name)) => assert_eq!(name, URL_PATH_HEADER),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
