//! Notification coordinator configuration

use serde::{Deserialize, Serialize};

/// Settings for [`NotificationCoordinator`](crate::NotificationCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Wait between announcing a claim and re-checking for siblings.
    pub grace_ms: u64,
    /// How long a message id stays handled.
    pub dedup_ttl_ms: u64,
    /// Period of the in-memory mirror sweep.
    pub sweep_interval_ms: u64,
    /// Bus topic carrying claims.
    pub topic: String,
    /// Preview length before truncation.
    pub max_preview_chars: usize,
    /// Namespace for persisted preferences.
    pub namespace: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            grace_ms: 60,
            dedup_ttl_ms: 60_000,
            sweep_interval_ms: 30_000,
            topic: "courier.notify.claims".to_string(),
            max_preview_chars: 140,
            namespace: "courier".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NotifyConfig::default();
        assert_eq!(cfg.grace_ms, 60);
        assert_eq!(cfg.dedup_ttl_ms, 60_000);
        assert_eq!(cfg.sweep_interval_ms, 30_000);
        assert_eq!(cfg.max_preview_chars, 140);
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let cfg: NotifyConfig = serde_json::from_str(r#"{"grace_ms": 100}"#).unwrap();
        assert_eq!(cfg.grace_ms, 100);
        assert_eq!(cfg.dedup_ttl_ms, 60_000);
        assert_eq!(cfg.namespace, "courier");
    }
}
