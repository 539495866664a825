// routing/resolver.rs - Entity Resolver

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tracing::trace;

use super::{EntityResolver, MessageRouter};
use crate::entities::{AgencyServices, AgentAo, AgentConnectionAo, EntityHandle, ForwardAgent};
use crate::error::Result;
use crate::storage::EntityRecord;

/// Builds an entity handle for an address on every call.
/// The identity provider's open-wallet cache is the only cache.
pub struct Resolver {
    services: Arc<AgencyServices>,
    forward_agent: Arc<ForwardAgent>,
    router: Weak<dyn MessageRouter>,
}

impl Resolver {
    pub fn new(
        services: Arc<AgencyServices>,
        forward_agent: Arc<ForwardAgent>,
        router: Weak<dyn MessageRouter>,
    ) -> Self {
        Self {
            services,
            forward_agent,
            router,
        }
    }
}

#[async_trait]
impl EntityResolver for Resolver {
    async fn resolve(&self, did_or_verkey: &str) -> Result<Option<EntityHandle>> {
        if did_or_verkey == self.forward_agent.did() || did_or_verkey == self.forward_agent.verkey() {
            return Ok(Some(EntityHandle::ForwardAgent(self.forward_agent.clone())));
        }

        let record = self
            .services
            .storage
            .load_entity_record_by_did_or_verkey(did_or_verkey)
            .await?;

        let handle = match record {
            None => {
                trace!(did_or_verkey, "No entity for address");
                return Ok(None);
            }
            Some(EntityRecord::ForwardAgent(_)) => EntityHandle::ForwardAgent(self.forward_agent.clone()),
            Some(EntityRecord::Agent(record)) => EntityHandle::Agent(
                AgentAo::load(self.services.clone(), record, self.router.clone()).await?,
            ),
            Some(EntityRecord::AgentConnection(record)) => EntityHandle::AgentConnection(
                AgentConnectionAo::load(self.services.clone(), record).await?,
            ),
        };

        Ok(Some(handle))
    }
}
