//! Connected producer sessions.

use std::collections::HashMap;

use parking_lot::Mutex;

/// One connected producer session.
#[derive(Clone, Debug)]
pub struct ProducerSession {
    pub name: String,
    /// The session negotiated dedup by replicated ledger position.
    pub supports_repl_dedup_v2: bool,
}

/// Tracks which producer names are currently connected, and the publish
/// capabilities each session negotiated.
///
/// Last-active bookkeeping for *disconnected* producers lives in the dedup
/// engine, which owns the purge lifecycle; the registry only feeds it
/// connect/disconnect events.
#[derive(Default)]
pub struct ProducerRegistry {
    sessions: Mutex<HashMap<String, ProducerSession>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Reconnecting under the same name replaces the
    /// previous session's capabilities.
    pub fn connect(&self, name: &str, supports_repl_dedup_v2: bool) {
        self.sessions.lock().insert(
            name.to_string(),
            ProducerSession {
                name: name.to_string(),
                supports_repl_dedup_v2,
            },
        );
    }

    /// Remove a session, returning it if it was connected.
    pub fn disconnect(&self, name: &str) -> Option<ProducerSession> {
        self.sessions.lock().remove(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.sessions.lock().contains_key(name)
    }

    pub fn supports_repl_dedup_v2(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .get(name)
            .map(|s| s.supports_repl_dedup_v2)
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_disconnect() {
        let registry = ProducerRegistry::new();
        registry.connect("alpha", true);
        assert!(registry.is_connected("alpha"));
        assert!(registry.supports_repl_dedup_v2("alpha"));

        // Reconnect downgrades the capability.
        registry.connect("alpha", false);
        assert!(!registry.supports_repl_dedup_v2("alpha"));

        let session = registry.disconnect("alpha").unwrap();
        assert_eq!(session.name, "alpha");
        assert!(!registry.is_connected("alpha"));
        assert!(registry.disconnect("alpha").is_none());
    }
}
