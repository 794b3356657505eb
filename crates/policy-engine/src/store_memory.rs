//! In-memory implementations of the external-collaborator ports.
//!
//! Back the tests and the CLI dry runs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{Connection, ConnectionRegistry, ObjectStore, PolicyStateStore, StoredObject};
use crate::types::NodeView;

/// A connection that owns a fixed set of identifiers.
pub struct MemoryConnection {
    node: NodeView,
    objects: RwLock<BTreeSet<Uuid>>,
    delay: Option<Duration>,
    fail: bool,
}

impl MemoryConnection {
    pub fn new(node: NodeView) -> Self {
        Self {
            node,
            objects: RwLock::new(BTreeSet::new()),
            delay: None,
            fail: false,
        }
    }

    pub fn with_objects(self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            objects: RwLock::new(ids.into_iter().collect()),
            ..self
        }
    }

    /// Sleep before every answer (simulates a stalled peer)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every query errors (simulates a broken peer)
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub async fn add_object(&self, id: Uuid) {
        self.objects.write().await.insert(id);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn node_view(&self) -> NodeView {
        self.node.clone()
    }

    async fn has_object(&self, id: Uuid) -> Result<bool> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(anyhow!("connection to {} is down", self.node.node_name));
        }
        Ok(self.objects.read().await.contains(&id))
    }
}

#[derive(Default)]
pub struct MemoryConnectionRegistry {
    connections: RwLock<Vec<Arc<dyn Connection>>>,
}

impl MemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: Arc<dyn Connection>) {
        self.connections.write().await.push(connection);
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn list_active_connections(&self) -> Result<Vec<Arc<dyn Connection>>> {
        Ok(self.connections.read().await.clone())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<Uuid, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, id: Uuid) -> Result<Option<StoredObject>> {
        Ok(self.objects.read().await.get(&id).cloned())
    }

    async fn put(&self, object: StoredObject) -> Result<()> {
        self.objects.write().await.insert(object.id, object);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPolicyStateStore {
    states: RwLock<BTreeMap<Uuid, Vec<u8>>>,
}

impl MemoryPolicyStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStateStore for MemoryPolicyStateStore {
    async fn load(&self, policy_id: Uuid) -> Result<Option<Vec<u8>>> {
        Ok(self.states.read().await.get(&policy_id).cloned())
    }

    async fn save(&self, policy_id: Uuid, bytes: Vec<u8>) -> Result<()> {
        self.states.write().await.insert(policy_id, bytes);
        Ok(())
    }
}
