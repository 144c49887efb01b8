//! Unified Redis key builder
//!
//! Every key the orchestrator touches is built here so that the layout can be
//! read in one place and isolated per deployment with a prefix.

use crate::Config;

#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a new `KeyBuilder` with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches(':').to_string(),
        }
    }

    /// Create `KeyBuilder` from configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.redis.key_prefix.clone())
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    // ==================== Quota ====================

    /// Live concurrent-stream counter of a quota owner
    ///
    /// Type: String (integer, INCR/DECR only)
    #[must_use]
    pub fn quota_counter(&self, owner_id: &str) -> String {
        format!("{}:quota:{}", self.prefix, owner_id)
    }

    // ==================== Sessions ====================

    /// One stream session per `(type, model_id)`
    ///
    /// Type: Hash { session: JSON, status: running|terminated }
    #[must_use]
    pub fn session(&self, stream_type: &str, model_id: &str) -> String {
        format!("{}:session:{}:{}", self.prefix, stream_type, model_id)
    }

    /// Index of all session keys (Set of "type:model_id")
    #[must_use]
    pub fn session_index(&self) -> String {
        format!("{}:sessions", self.prefix)
    }

    // ==================== Shared streams ====================

    /// Shared stream row
    ///
    /// Type: Hash { stream: JSON, client_count: integer }
    #[must_use]
    pub fn shared_stream(&self, stream_key: &str) -> String {
        format!("{}:shared:{}", self.prefix, stream_key)
    }

    /// Attached viewers of a shared stream
    ///
    /// Type: Hash { client_id: JSON }
    #[must_use]
    pub fn shared_clients(&self, stream_key: &str) -> String {
        format!("{}:shared:{}:clients", self.prefix, stream_key)
    }

    /// Append-only samples of a shared stream (List of JSON)
    #[must_use]
    pub fn shared_stats(&self, stream_key: &str) -> String {
        format!("{}:shared:{}:stats", self.prefix, stream_key)
    }

    /// Index of all shared stream keys (Set)
    #[must_use]
    pub fn shared_index(&self) -> String {
        format!("{}:shared-index", self.prefix)
    }

    // ==================== Locks ====================

    /// Creation marker / distributed lock
    #[must_use]
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("tvmux")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_use_prefix() {
        let keys = KeyBuilder::new("prod:");
        assert_eq!(keys.quota_counter("7"), "prod:quota:7");
        assert_eq!(keys.session("channel", "42"), "prod:session:channel:42");
        assert_eq!(keys.shared_clients("channel:42"), "prod:shared:channel:42:clients");
        assert_eq!(keys.lock("create:channel:42"), "prod:lock:create:channel:42");
    }

    #[test]
    fn test_default_prefix() {
        assert_eq!(KeyBuilder::default().prefix(), "tvmux");
        assert_eq!(KeyBuilder::default().session_index(), "tvmux:sessions");
    }
}
