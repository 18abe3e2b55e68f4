//! TCP keep-alive settings for long lived control connections

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::TunnelError;

/// Keep-alive probe schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Idle time before the first probe
    pub idle: Duration,
    /// Unanswered probes before the connection is considered dead
    pub count: u32,
    /// Time between probes
    pub interval: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(15 * 60),
            count: 8,
            interval: Duration::from_secs(5),
        }
    }
}

impl KeepAlive {
    /// Enable keep-alive on `stream` with this schedule
    pub fn apply(&self, stream: &TcpStream) -> Result<(), TunnelError> {
        let params = TcpKeepalive::new().with_time(self.idle);

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "freebsd",
            target_os = "windows"
        ))]
        let params = params.with_interval(self.interval);

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "freebsd"
        ))]
        let params = params.with_retries(self.count);

        SockRef::from(stream).set_tcp_keepalive(&params)?;
        Ok(())
    }
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "idle_time={},count={},interval={}",
            format_duration(self.idle),
            self.count,
            format_duration(self.interval)
        )
    }
}

/// Parses `idle_time=1m,count=5,interval=5s`
///
/// Keys may appear in any order; missing keys keep their default.
impl FromStr for KeepAlive {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut keepalive = KeepAlive::default();

        for option in s.split(',') {
            let (key, value) = option.split_once('=').ok_or_else(|| {
                TunnelError::KeepAlive(format!(
                    "option {:?} must be formatted as \"key=value\"",
                    option
                ))
            })?;
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() {
                return Err(TunnelError::KeepAlive(format!(
                    "option {:?} has an empty value",
                    key
                )));
            }

            match key {
                "idle_time" => keepalive.idle = parse_duration(value)?,
                "interval" => keepalive.interval = parse_duration(value)?,
                "count" => {
                    keepalive.count = value.parse().map_err(|_| {
                        TunnelError::KeepAlive(format!("invalid count {:?}", value))
                    })?
                }
                other => {
                    return Err(TunnelError::KeepAlive(format!(
                        "unknown option {:?}",
                        other
                    )))
                }
            }
        }

        Ok(keepalive)
    }
}

/// Parse a duration such as `250ms`, `5s`, `1m` or `2h`
///
/// Components can be chained (`1m30s`). A bare number is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, TunnelError> {
    let invalid = || TunnelError::KeepAlive(format!("invalid duration {:?}", s));

    let mut rest = s.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 60 * 60),
            _ => return Err(invalid()),
        };
        total += unit;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{}ms", millis)
    } else if millis % 3_600_000 == 0 && millis > 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else {
        format!("{}s", millis / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let keepalive = KeepAlive::default();
        assert_eq!(keepalive.idle, Duration::from_secs(900));
        assert_eq!(keepalive.count, 8);
        assert_eq!(keepalive.interval, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_options() {
        let keepalive: KeepAlive = "idle_time=1m, count=5 ,interval=5s".parse().unwrap();
        assert_eq!(
            keepalive,
            KeepAlive {
                idle: Duration::from_secs(60),
                count: 5,
                interval: Duration::from_secs(5),
            }
        );
    }

    #[test]
    fn test_partial_options_keep_defaults() {
        let keepalive: KeepAlive = "count=3".parse().unwrap();
        assert_eq!(keepalive.count, 3);
        assert_eq!(keepalive.idle, KeepAlive::default().idle);
    }

    #[test]
    fn test_invalid_options() {
        for bad in [
            "idle_time",
            "idle_time=",
            "count=many",
            "interval=5",
            "timeout=5s",
        ] {
            assert!(bad.parse::<KeepAlive>().is_err(), "{} should fail", bad);
        }
    }

    #[test]
    fn test_display_parses_back() {
        let keepalive = KeepAlive {
            idle: Duration::from_secs(90),
            count: 2,
            interval: Duration::from_millis(1500),
        };
        assert_eq!(keepalive.to_string(), "idle_time=90s,count=2,interval=1500ms");
        assert_eq!(keepalive.to_string().parse::<KeepAlive>().unwrap(), keepalive);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[tokio::test]
    async fn test_apply_to_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        KeepAlive::default().apply(&stream).unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }
}
