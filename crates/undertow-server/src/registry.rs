use std::sync::Arc;

use dashmap::DashMap;
use http::uri::Authority;

use crate::error::{RegistryError, TransportError};
use crate::transport::Transport;

/// Host key to live client connection
///
/// Holds at most one connection per host. Lookups never wait: a host
/// without a live connection simply has no entry.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, Transport>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `transport` for `host`, replacing any previous connection
    ///
    /// A replaced connection is left open; it is dropped from routing only.
    pub fn add(&self, host: &str, transport: Transport) -> Result<(), RegistryError> {
        let key = host_key(host)?;
        let id = transport.id();

        if let Some(previous) = self.entries.insert(key, transport) {
            tracing::info!(
                host,
                connection = id,
                previous = previous.id(),
                "Replaced connection"
            );
        } else {
            tracing::debug!(host, connection = id, "Added connection");
        }
        Ok(())
    }

    /// Live connection for `host`, if any
    pub fn resolve(&self, host: &str) -> Option<Transport> {
        let key = host.to_ascii_lowercase();
        let transport = self.entries.get(&key)?.clone();

        if transport.is_closed() {
            self.invalidate_connection(&key, transport.id());
            return None;
        }
        Some(transport)
    }

    /// Remove whatever connection is registered for `host`
    pub fn invalidate(&self, host: &str) {
        if self.entries.remove(&host.to_ascii_lowercase()).is_some() {
            tracing::debug!(host, "Invalidated host");
        }
    }

    /// Remove the entry for `host` only if it still holds connection `id`
    ///
    /// Returns whether an entry was removed. A connection that has already
    /// been replaced cannot evict its successor.
    pub fn invalidate_connection(&self, host: &str, id: u64) -> bool {
        let removed = self
            .entries
            .remove_if(&host.to_ascii_lowercase(), |_, transport| transport.id() == id)
            .is_some();
        if removed {
            tracing::debug!(host, connection = id, "Invalidated connection");
        }
        removed
    }

    /// Drop the entry for `host` when `err` shows its connection is gone
    pub fn report_failure(&self, host: &str, transport: &Transport, err: &TransportError) {
        if err.is_connection_level() || transport.is_closed() {
            tracing::warn!(
                host,
                connection = transport.id(),
                error = %err,
                "Connection failed, removing from registry"
            );
            self.invalidate_connection(host, transport.id());
        }
    }

    /// Close every registered connection and empty the registry
    pub fn close_all(&self) {
        self.entries.retain(|_, transport| {
            transport.close();
            false
        });
    }

    pub fn hosts(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalized registry key; must be a bare host, since requests are routed
/// by their host without its port
pub(crate) fn host_key(host: &str) -> Result<String, RegistryError> {
    let invalid = || RegistryError::InvalidHost(host.to_string());

    if host.is_empty() || host.contains('@') {
        return Err(invalid());
    }
    let authority: Authority = host.parse().map_err(|_| invalid())?;
    if authority.host().is_empty() || authority.port().is_some() {
        return Err(invalid());
    }
    Ok(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::idle_transport;

    #[tokio::test]
    async fn test_add_then_resolve() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;

        registry.add("a.example", transport.clone()).unwrap();

        let resolved = registry.resolve("a.example").unwrap();
        assert_eq!(resolved.id(), transport.id());
        assert!(registry.resolve("b.example").is_none());
    }

    #[tokio::test]
    async fn test_lookup_is_case_insensitive() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;

        registry.add("A.Example", transport).unwrap();
        assert!(registry.resolve("a.example").is_some());
        assert_eq!(registry.hosts(), vec!["a.example".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_hosts_are_rejected() {
        let registry = Registry::new();

        for host in [
            "",
            "user@a.example",
            "a b",
            "a.example/path",
            ":80",
            "a.example:8080",
        ] {
            let (transport, _far) = idle_transport().await;
            assert!(
                matches!(
                    registry.add(host, transport),
                    Err(RegistryError::InvalidHost(_))
                ),
                "{:?} should be rejected",
                host
            );
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_last_writer_wins_without_closing_previous() {
        let registry = Registry::new();
        let (first, _far1) = idle_transport().await;
        let (second, _far2) = idle_transport().await;

        registry.add("a.example", first.clone()).unwrap();
        registry.add("a.example", second.clone()).unwrap();

        assert_eq!(registry.resolve("a.example").unwrap().id(), second.id());
        assert_eq!(registry.len(), 1);
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;

        registry.add("a.example", transport).unwrap();
        registry.invalidate("a.example");
        registry.invalidate("a.example");
        registry.invalidate("never.example");

        assert!(registry.resolve("a.example").is_none());
    }

    #[tokio::test]
    async fn test_superseded_connection_cannot_evict_successor() {
        let registry = Registry::new();
        let (first, _far1) = idle_transport().await;
        let (second, _far2) = idle_transport().await;

        registry.add("a.example", first.clone()).unwrap();
        registry.add("a.example", second.clone()).unwrap();

        assert!(!registry.invalidate_connection("a.example", first.id()));
        assert_eq!(registry.resolve("a.example").unwrap().id(), second.id());

        assert!(registry.invalidate_connection("a.example", second.id()));
        assert!(registry.resolve("a.example").is_none());
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_resolved() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;

        registry.add("a.example", transport.clone()).unwrap();
        transport.close();

        assert!(registry.resolve("a.example").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_report_failure_only_evicts_on_connection_errors() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;
        registry.add("a.example", transport.clone()).unwrap();

        let stream_error = TransportError::Status(hyper::StatusCode::BAD_REQUEST);
        registry.report_failure("a.example", &transport, &stream_error);
        assert!(registry.resolve("a.example").is_some());

        registry.report_failure("a.example", &transport, &TransportError::Closed);
        assert!(registry.resolve("a.example").is_none());
    }

    #[tokio::test]
    async fn test_resolve_does_not_block_while_adding() {
        let registry = Registry::new();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (transport, far) = idle_transport().await;
                registry.add(&format!("h{}.example", i), transport).unwrap();
                far
            }));
        }

        let lookups = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            for _ in 0..100 {
                let _ = registry.resolve("h0.example");
                let _ = registry.resolve("missing.example");
                tokio::task::yield_now().await;
            }
        });
        lookups.await.expect("resolve must not block");

        let mut far_ends = Vec::new();
        for task in tasks {
            far_ends.push(task.await.unwrap());
        }
        assert_eq!(registry.len(), 8);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = Registry::new();
        let (transport, _far) = idle_transport().await;
        registry.add("a.example", transport.clone()).unwrap();

        registry.close_all();

        assert!(registry.is_empty());
        assert!(transport.is_closed());
    }
}
