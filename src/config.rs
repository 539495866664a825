// config.rs - Agency Configuration
//
//! Immutable configuration for every agency component.
//!
//! The whole tree is built once (by the binary, from a file plus environment
//! overrides) and handed to components at construction; nothing reads global
//! state afterwards.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::WalletRef;

/// Top-level agency configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgencyConfig {
    /// HTTP listen address
    pub listen_address: String,

    /// Secret mixed into every derived wallet key
    pub wallet_key_secret: String,

    /// Forward Agent identity
    pub forward_agent: ForwardAgentConfig,

    /// Entity/message storage
    pub storage: StorageConfig,

    /// Wallet vault used by the local identity provider
    pub identity: IdentityConfig,

    /// New-message notifications
    pub notifications: NotificationsConfig,

    /// Webhook dispatch
    pub webhook: WebhookConfig,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            wallet_key_secret: "agency-wallet-secret".to_string(),
            forward_agent: ForwardAgentConfig::default(),
            storage: StorageConfig::default(),
            identity: IdentityConfig::default(),
            notifications: NotificationsConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl AgencyConfig {
    /// Config for tests: everything in memory, short timeouts
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                path: None,
            },
            identity: IdentityConfig { path: None },
            notifications: NotificationsConfig {
                backend: NotificationBackend::Memory,
                ..NotificationsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Build the wallet reference for a wallet name.
    ///
    /// The key is derived from the agency secret and the name, so records only
    /// ever persist the name.
    pub fn wallet_ref(&self, wallet_name: &str) -> WalletRef {
        let mut hasher = Sha256::new();
        hasher.update(self.wallet_key_secret.as_bytes());
        hasher.update(b":");
        hasher.update(wallet_name.as_bytes());
        WalletRef {
            name: wallet_name.to_string(),
            key: hex::encode(hasher.finalize()),
        }
    }
}

/// Forward Agent identity configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardAgentConfig {
    /// Wallet holding the Forward Agent's key
    pub wallet_name: String,

    /// Optional 32-byte seed for a deterministic DID
    pub seed: Option<String>,

    /// Public endpoint advertised by `GET /agency`
    pub endpoint: Option<String>,
}

impl Default for ForwardAgentConfig {
    fn default() -> Self {
        Self {
            wallet_name: "forward-agent".to_string(),
            seed: None,
            endpoint: None,
        }
    }
}

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory storage (for testing)
    Memory,
    /// sled database on disk
    Sled,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: Some(PathBuf::from("./data/storage")),
        }
    }
}

/// Wallet vault configuration; no path means a temporary vault
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub path: Option<PathBuf>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./data/wallets")),
        }
    }
}

/// Notification backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationBackend {
    /// Notifications switched off; long-polls answer 409
    Disabled,
    /// In-process pub/sub
    Memory,
    /// sled-backed pub/sub
    Sled,
}

/// Notification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub backend: NotificationBackend,

    pub path: Option<PathBuf>,

    /// Upper bound for a caller-supplied long-poll timeout
    pub max_long_poll_ms: u64,

    /// Timeout used when the caller supplies none
    pub default_long_poll_ms: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            backend: NotificationBackend::Memory,
            path: None,
            max_long_poll_ms: 30_000,
            default_long_poll_ms: 30_000,
        }
    }
}

impl NotificationsConfig {
    /// Clamp a requested long-poll timeout to the configured ceiling
    pub fn long_poll_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_long_poll_ms)
            .min(self.max_long_poll_ms);
        Duration::from_millis(ms)
    }
}

/// Webhook dispatch configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,

    /// Response timeout for a single webhook POST
    pub response_timeout_ms: u64,

    /// How long an idle pooled connection is kept
    pub pool_idle_timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            response_timeout_ms: 1_000,
            pool_idle_timeout_secs: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = AgencyConfig::default();
        assert_eq!(config.listen_address, "0.0.0.0:8080");
        assert_eq!(config.notifications.max_long_poll_ms, 30_000);
        assert_eq!(config.storage.backend, StorageBackend::Sled);
    }

    #[test]
    fn test_wallet_ref_is_deterministic() {
        let config = AgencyConfig::default();
        let a = config.wallet_ref("agent-owner1");
        let b = config.wallet_ref("agent-owner1");
        let c = config.wallet_ref("agent-owner2");

        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_eq!(a.key.len(), 64);
    }

    #[test]
    fn test_long_poll_timeout_is_capped() {
        let config = NotificationsConfig::default();
        assert_eq!(config.long_poll_timeout(Some(500)), Duration::from_millis(500));
        assert_eq!(
            config.long_poll_timeout(Some(120_000)),
            Duration::from_millis(30_000)
        );
        assert_eq!(config.long_poll_timeout(None), Duration::from_millis(30_000));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: AgencyConfig = serde_json::from_str(
            r#"{"listen_address":"127.0.0.1:9000","storage":{"backend":"memory"}}"#,
        )
        .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:9000");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.webhook.response_timeout_ms, 1_000);
    }
}
