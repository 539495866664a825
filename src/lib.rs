// lib.rs - SSI Agency
//
// Store-and-forward relay for encrypted, DID-addressed agent-to-agent
// messaging.

//! # ssi-agency
//!
//! An always-online mediator for agents that are not. Owners onboard through
//! the Forward Agent, get a cloud Agent, and provision one Agent-Connection
//! per pairwise relationship. Third parties forward encrypted messages to a
//! connection; the agency stores them and raises notifications until the
//! owner downloads and acknowledges them.
//!
//! ```ignore
//! use ssi_agency::{Agency, AgencyConfig, server};
//!
//! let agency = std::sync::Arc::new(Agency::in_memory(AgencyConfig::in_memory()).await?);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! server::serve(agency, listener, std::future::pending()).await?;
//! ```

pub mod agency;
pub mod client;
pub mod config;
pub mod entities;
pub mod error;
pub mod identity;
pub mod messages;
pub mod notifications;
pub mod observability;
pub mod routing;
pub mod server;
pub mod storage;
pub mod webhook;

// Re-export commonly used types
pub use agency::Agency;
pub use client::AgencyClient;
pub use config::{AgencyConfig, NotificationBackend, StorageBackend};
pub use error::{AgencyError, ErrorEnvelope};
pub use identity::{DidInfo, IdentityError, IdentityProvider, LocalIdentityProvider};
pub use messages::AgencyMessage;
pub use notifications::{NotificationError, Notifier};
pub use storage::{MemoryStorage, SledStorage, Storage, StorageError};
pub use webhook::WebhookDispatcher;

pub use observability::{
    MetricsConfig, MetricsHandle, TracingConfig, TracingFormat, init_metrics, init_tracing,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
