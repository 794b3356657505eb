//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use policy_engine::store_memory::{MemoryConnection, MemoryConnectionRegistry, MemoryObjectStore, MemoryPolicyStateStore};
use policy_engine::{EngineConfig, ExecutionContext, NodeView, PolicyEngine, TypeRegistry, VerifyKey};
use std::sync::Arc;
use uuid::Uuid;

pub const RATE_LIMITED: &str = r#"
;; release results at most @limit times
(class RateLimited [CustomOutputPolicy]
  :params [limit]
  :defaults {:limit 3}
  :state {:released 0}
  :outputs ["model"]
  :public {:limit @limit :released @released}
  :admit (< @released @limit)
  :on-admit {:released (+ @released 1)})
"#;

pub const ONLY_DATA: &str = r#"
(class OnlyData [CustomInputPolicy]
  :accept (= @key "data"))
"#;

pub struct Harness {
    pub engine: PolicyEngine,
    pub connections: Arc<MemoryConnectionRegistry>,
    pub objects: Arc<MemoryObjectStore>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    let connections = Arc::new(MemoryConnectionRegistry::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let engine = PolicyEngine::new(
        config,
        Arc::new(TypeRegistry::with_builtins()),
        connections.clone(),
        objects.clone(),
        Arc::new(MemoryPolicyStateStore::new()),
    )
    .expect("default config is valid");
    Harness {
        engine,
        connections,
        objects,
    }
}

pub fn key(name: &str) -> VerifyKey {
    VerifyKey::from_bytes(name.as_bytes())
}

pub fn node(name: &str) -> NodeView {
    NodeView {
        node_name: name.to_string(),
        node_id: Uuid::new_v4(),
        verify_key: key(name),
    }
}

pub fn ctx(node: &NodeView, user: &str) -> ExecutionContext {
    ExecutionContext {
        node: node.clone(),
        credentials: key(user),
    }
}

pub async fn connect(harness: &Harness, node: &NodeView, ids: &[Uuid]) {
    harness
        .connections
        .register(Arc::new(MemoryConnection::new(node.clone()).with_objects(ids.iter().copied())))
        .await;
}
