// routing/mod.rs - Entity Resolution and Routing
//
//! Addressing layer between the Forward Agent and the entities.
//!
//! ```text
//!  ForwardAgent / Agent
//!        |  route_msg(address, payload)
//!        v
//!  +-----------+   resolve(did_or_verkey)   +-----------+
//!  |  Router   |--------------------------->| Resolver  |---> Storage
//!  +-----------+                            +-----------+
//!        |  handle_routed_message(payload)        |
//!        v                                        v
//!  EntityHandle  <----------- built per call -----+
//! ```
//!
//! The Router is held strongly by the [`Agency`](crate::Agency) only; entities
//! and the Resolver reach it through a `Weak` reference.

pub mod resolver;
pub mod router;

pub use resolver::Resolver;
pub use router::Router;

use async_trait::async_trait;
use serde_json::Value;

use crate::entities::EntityHandle;
use crate::error::{AgencyError, Result};

/// Payload delivered to an entity
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedPayload {
    /// An envelope encrypted to the addressed entity
    Sealed(Vec<u8>),

    /// A message carried by an Aries forward, opaque to the agency
    Relayed(Value),
}

impl RoutedPayload {
    /// Wrap the `@msg` of a legacy forward
    pub fn sealed(msg: &Value) -> Result<Self> {
        serde_json::to_vec(msg)
            .map(Self::Sealed)
            .map_err(|e| AgencyError::MalformedMessage(e.to_string()))
    }
}

/// Delivers a payload to whichever entity owns an address
#[async_trait]
pub trait MessageRouter: Send + Sync {
    async fn route_msg(&self, address: &str, payload: RoutedPayload) -> Result<Vec<u8>>;
}

/// Maps a DID or verkey to a live entity
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// `None` when no entity owns the address
    async fn resolve(&self, did_or_verkey: &str) -> Result<Option<EntityHandle>>;
}

/// Implemented by every entity
#[async_trait]
pub trait HandleRoutedMessage: Send + Sync {
    async fn handle_routed_message(&self, payload: RoutedPayload) -> Result<Vec<u8>>;
}
