use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::types::NodeView;

/// A reachable remote participant.
#[async_trait]
pub trait Connection: Send + Sync {
    fn node_view(&self) -> NodeView;

    /// Does this node hold an object with the given identifier?
    async fn has_object(&self, id: Uuid) -> Result<bool>;
}

/// Registry of currently active connections, in a stable order.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn list_active_connections(&self) -> Result<Vec<Arc<dyn Connection>>>;
}

/// A stored data object resolved for a computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: Uuid,
    pub payload: serde_json::Value,
}

/// Local content/object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<StoredObject>>;
    async fn put(&self, object: StoredObject) -> Result<()>;
}

/// Persistence for encoded policy state, keyed by policy identity.
#[async_trait]
pub trait PolicyStateStore: Send + Sync {
    async fn load(&self, policy_id: Uuid) -> Result<Option<Vec<u8>>>;
    async fn save(&self, policy_id: Uuid, bytes: Vec<u8>) -> Result<()>;
}
