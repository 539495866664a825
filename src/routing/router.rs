// routing/router.rs - Message Router

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{EntityResolver, HandleRoutedMessage, MessageRouter, RoutedPayload};
use crate::error::{AgencyError, Result};
use crate::observability::{record_message_routed, record_recipient_not_found};

/// Routes payloads to resolved entities
pub struct Router {
    resolver: Arc<dyn EntityResolver>,
}

impl Router {
    pub fn new(resolver: Arc<dyn EntityResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl MessageRouter for Router {
    #[instrument(skip(self, payload))]
    async fn route_msg(&self, address: &str, payload: RoutedPayload) -> Result<Vec<u8>> {
        let Some(entity) = self.resolver.resolve(address).await? else {
            record_recipient_not_found();
            return Err(AgencyError::RecipientNotFound(address.to_string()));
        };

        debug!(entity_type = entity.entity_type(), did = entity.did(), "Routing message");
        record_message_routed(entity.entity_type());
        entity.handle_routed_message(payload).await
    }
}
