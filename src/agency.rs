// agency.rs - Agency Wiring
//
//! Builds the component graph and exposes the operations served over HTTP.
//!
//! Leaves (storage, identity, notifications, webhook) are built first. The
//! Router, Resolver and Forward Agent reference each other, so they are
//! created together with `Arc::new_cyclic`; the `Agency` holds the only
//! strong reference to the Router.

use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AgencyConfig;
use crate::entities::{AgencyServices, ForwardAgent};
use crate::error::{AgencyError, ErrorEnvelope, Result};
use crate::identity::{DidInfo, IdentityProvider, LocalIdentityProvider};
use crate::notifications::{FlagStore, MemoryFlagStore, Notifier};
use crate::observability::{record_long_poll, record_request};
use crate::routing::{MessageRouter, Resolver, Router};
use crate::storage::{MemoryStorage, Storage, StorageError};
use crate::webhook::WebhookDispatcher;

/// A wired agency
pub struct Agency {
    services: Arc<AgencyServices>,
    forward_agent: Arc<ForwardAgent>,
    resolver: Arc<Resolver>,
    _router: Arc<Router>,
}

impl Agency {
    /// Wire the agency over the given backends
    pub async fn wire(
        config: AgencyConfig,
        storage: Arc<dyn Storage>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Notifier,
        webhook: WebhookDispatcher,
    ) -> Result<Self> {
        let services = Arc::new(AgencyServices {
            config,
            storage,
            identity,
            notifier,
            webhook,
        });

        let wallet = ForwardAgent::bootstrap(&services).await?;

        let mut parts = None;
        let router = Arc::new_cyclic(|weak: &Weak<Router>| {
            let weak_router: Weak<dyn MessageRouter> = weak.clone();
            let forward_agent = Arc::new(ForwardAgent::new(
                services.clone(),
                wallet,
                weak_router.clone(),
            ));
            let resolver = Arc::new(Resolver::new(
                services.clone(),
                forward_agent.clone(),
                weak_router,
            ));
            parts = Some((forward_agent, resolver.clone()));
            Router::new(resolver)
        });
        let (forward_agent, resolver) = parts.ok_or(AgencyError::RouterUnavailable)?;

        info!(
            did = %forward_agent.did(),
            notifications = services.notifier.is_available(),
            "Agency wired"
        );

        Ok(Self {
            services,
            forward_agent,
            resolver,
            _router: router,
        })
    }

    /// Everything in memory; used by tests and ephemeral deployments
    pub async fn in_memory(config: AgencyConfig) -> Result<Self> {
        let identity = LocalIdentityProvider::in_memory()?;
        let flags: Arc<dyn FlagStore> = Arc::new(MemoryFlagStore::new());
        let webhook = WebhookDispatcher::new(&config.webhook).unwrap_or_else(|e| {
            warn!(error = %e, "Webhooks disabled");
            WebhookDispatcher::disabled()
        });

        Self::wire(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(identity),
            Notifier::new(Some(flags)),
            webhook,
        )
        .await
    }

    pub fn config(&self) -> &AgencyConfig {
        &self.services.config
    }

    pub fn forward_agent_info(&self) -> &DidInfo {
        self.forward_agent.did_info()
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn notifier(&self) -> &Notifier {
        &self.services.notifier
    }

    pub fn notifications_available(&self) -> bool {
        self.services.notifier.is_available()
    }

    /// Handle one inbound envelope
    pub async fn handle_message(&self, bytes: &[u8]) -> std::result::Result<Vec<u8>, ErrorEnvelope> {
        let start = Instant::now();
        let result = self.forward_agent.handle_message(bytes).await;
        record_request(start.elapsed(), result.is_ok());
        result
    }

    /// Long-poll the agent's V2 flag; `timeout_ms` is capped by configuration
    pub async fn wait_for_notifications(&self, agent_did: &str, timeout_ms: Option<u64>) -> Result<bool> {
        let timeout = self.services.config.notifications.long_poll_timeout(timeout_ms);
        let notified = self
            .services
            .notifier
            .v2
            .wait_for_new_message(agent_did, timeout)
            .await?;
        record_long_poll(notified);
        Ok(notified)
    }

    /// Clear V1, V2 (if `ack_utime` is recent enough) and the stored flag
    pub async fn ack_notifications(&self, agent_did: &str, ack_utime: Option<i64>) -> Result<()> {
        self.services
            .notifier
            .ack_new_message(agent_did, ack_utime)
            .await?;

        match self.services.storage.set_has_new_message(agent_did, false).await {
            Ok(()) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                debug!(agent_did, "Ack for an unknown agent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
