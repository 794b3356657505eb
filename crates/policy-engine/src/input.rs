//! Input governance
//!
//! Every input identifier is attributed to the node that owns it; a
//! computation may only read the inputs its policy lists for the executing
//! node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GovernanceError, OwnershipError};
use crate::store::{ConnectionRegistry, ObjectStore, StoredObject};
use crate::types::{ExecutionContext, InputValue, NodeView};

/// Allowed inputs per owning node: node -> {argument name -> identifier}
pub type NodeInputs = BTreeMap<NodeView, BTreeMap<String, Uuid>>;

/// Inputs a computation may read, resolved from the local store
pub type AllowedInputs = BTreeMap<String, StoredObject>;

/// Attribute each argument to the first connection that owns its identifier.
///
/// Connections are asked in registry order. A connection that errors or does
/// not answer within `timeout` counts as not owning the object. When two
/// connections own the same identifier the first one wins; no conflict is
/// raised.
pub async fn partition_by_node(
    kwargs: &BTreeMap<String, InputValue>,
    registry: &dyn ConnectionRegistry,
    timeout: Duration,
) -> Result<NodeInputs, OwnershipError> {
    let connections = registry
        .list_active_connections()
        .await
        .map_err(|e| OwnershipError::Connection(e.to_string()))?;

    let mut resolved = NodeInputs::new();
    for (argument, value) in kwargs {
        let id = value.uid().ok_or_else(|| OwnershipError::MissingUid {
            argument: argument.clone(),
        })?;

        let mut owner = None;
        for connection in &connections {
            let node = connection.node_view();
            match tokio::time::timeout(timeout, connection.has_object(id)).await {
                Ok(Ok(true)) => {
                    owner = Some(node);
                    break;
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => warn!(node = %node, %id, error = %e, "ownership query failed"),
                Err(_) => warn!(node = %node, %id, ?timeout, "ownership query timed out"),
            }
        }

        let node = owner.ok_or_else(|| OwnershipError::Unclaimed {
            argument: argument.clone(),
            id,
        })?;
        debug!(%argument, %id, node = %node, "input attributed");
        resolved.entry(node).or_default().insert(argument.clone(), id);
    }
    Ok(resolved)
}

#[async_trait]
pub trait InputPolicy: Send + Sync {
    fn id(&self) -> Uuid;

    fn inputs(&self) -> &NodeInputs;

    fn policy_code(&self) -> String;

    /// Per-candidate hook applied after the allow-list. Builtins accept all.
    fn accepts(&self, _argument: &str, _id: Uuid, _context: &ExecutionContext) -> Result<bool, GovernanceError> {
        Ok(true)
    }

    /// Keep only the kwargs listed for the executing node.
    ///
    /// Unlisted keys are dropped. A listed key carrying a different
    /// identifier is a violation.
    fn allowed_ids_only(
        &self,
        kwargs: &BTreeMap<String, InputValue>,
        context: &ExecutionContext,
    ) -> Result<BTreeMap<String, Uuid>, GovernanceError> {
        let allowed = self
            .inputs()
            .iter()
            .find(|(node, _)| node.node_id == context.node.node_id)
            .map(|(_, inputs)| inputs)
            .ok_or_else(|| GovernanceError::NotOwner {
                node: context.node.to_string(),
            })?;

        let mut filtered = BTreeMap::new();
        for (argument, value) in kwargs {
            let Some(expected) = allowed.get(argument) else {
                debug!(%argument, "dropping input not in allow-list");
                continue;
            };
            match value.uid() {
                Some(id) if id == *expected => {
                    filtered.insert(argument.clone(), id);
                }
                found => {
                    return Err(GovernanceError::Violation {
                        argument: argument.clone(),
                        expected: expected.to_string(),
                        found: found.map_or_else(|| "no identifier".to_string(), |id| id.to_string()),
                    })
                }
            }
        }
        Ok(filtered)
    }

    /// Allow-list the candidates, then resolve each against the object store
    async fn filter_kwargs(
        &self,
        kwargs: &BTreeMap<String, InputValue>,
        context: &ExecutionContext,
        code_id: Uuid,
        store: &dyn ObjectStore,
    ) -> Result<AllowedInputs, GovernanceError> {
        let allowed = self.allowed_ids_only(kwargs, context)?;
        let mut accepted = BTreeMap::new();
        for (argument, id) in allowed {
            if self.accepts(&argument, id, context)? {
                accepted.insert(argument, id);
            } else {
                debug!(%argument, %id, "input refused by policy predicate");
            }
        }
        debug!(policy = %self.id(), %code_id, count = accepted.len(), "inputs filtered");
        retrieve_from_db(accepted, store).await
    }
}

pub async fn retrieve_from_db(
    allowed: BTreeMap<String, Uuid>,
    store: &dyn ObjectStore,
) -> Result<AllowedInputs, GovernanceError> {
    let mut out = AllowedInputs::new();
    for (argument, id) in allowed {
        let object = store
            .get(id)
            .await
            .map_err(|e| GovernanceError::Store(e.to_string()))?
            .ok_or_else(|| GovernanceError::ObjectMissing {
                argument: argument.clone(),
                id,
            })?;
        out.insert(argument, object);
    }
    Ok(out)
}

/// Exact allow-list filtering over resolved inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExactMatch {
    pub id: Uuid,
    pub inputs: NodeInputs,
    pub node_uid: Option<Uuid>,
}

impl ExactMatch {
    pub fn new(inputs: NodeInputs) -> Self {
        Self {
            id: Uuid::new_v4(),
            inputs,
            node_uid: None,
        }
    }

    /// Build from raw kwargs by resolving ownership
    pub async fn resolve(
        kwargs: &BTreeMap<String, InputValue>,
        registry: &dyn ConnectionRegistry,
        timeout: Duration,
    ) -> Result<Self, OwnershipError> {
        Ok(Self::new(partition_by_node(kwargs, registry, timeout).await?))
    }
}

impl InputPolicy for ExactMatch {
    fn id(&self) -> Uuid {
        self.id
    }

    fn inputs(&self) -> &NodeInputs {
        &self.inputs
    }

    fn policy_code(&self) -> String {
        "(class ExactMatch [InputPolicy]\n  :doc \"allow exactly the resolved inputs\")".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::{MemoryConnection, MemoryConnectionRegistry, MemoryObjectStore};
    use crate::types::VerifyKey;
    use std::sync::Arc;

    fn node(name: &str) -> NodeView {
        NodeView {
            node_name: name.to_string(),
            node_id: Uuid::new_v4(),
            verify_key: VerifyKey::from_bytes(name.as_bytes()),
        }
    }

    fn ctx(node: &NodeView) -> ExecutionContext {
        ExecutionContext {
            node: node.clone(),
            credentials: VerifyKey::from_bytes(b"scientist"),
        }
    }

    fn kwargs(pairs: &[(&str, InputValue)]) -> BTreeMap<String, InputValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_first_owner_wins() {
        let (a, b) = (node("a"), node("b"));
        let id = Uuid::new_v4();
        let registry = MemoryConnectionRegistry::new();
        registry.register(Arc::new(MemoryConnection::new(a.clone()).with_objects([id]))).await;
        registry.register(Arc::new(MemoryConnection::new(b.clone()).with_objects([id]))).await;

        let resolved = partition_by_node(&kwargs(&[("x", id.into())]), &registry, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&a]["x"], id);
    }

    #[tokio::test]
    async fn test_missing_uid() {
        let registry = MemoryConnectionRegistry::new();
        let err = partition_by_node(
            &kwargs(&[("x", InputValue::ActionObject { id: None })]),
            &registry,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err, OwnershipError::MissingUid { argument: "x".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_is_not_an_owner() {
        let (slow, b) = (node("slow"), node("b"));
        let id = Uuid::new_v4();
        let registry = MemoryConnectionRegistry::new();
        registry
            .register(Arc::new(
                MemoryConnection::new(slow)
                    .with_objects([id])
                    .with_delay(Duration::from_secs(60)),
            ))
            .await;
        registry.register(Arc::new(MemoryConnection::new(b.clone()).with_objects([id]))).await;

        let resolved = partition_by_node(&kwargs(&[("x", id.into())]), &registry, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(resolved.keys().collect::<Vec<_>>(), vec![&b]);
    }

    #[tokio::test]
    async fn test_failing_connection_is_skipped() {
        let b = node("b");
        let id = Uuid::new_v4();
        let registry = MemoryConnectionRegistry::new();
        registry.register(Arc::new(MemoryConnection::new(node("down")).failing())).await;
        registry.register(Arc::new(MemoryConnection::new(b.clone()).with_objects([id]))).await;

        let policy = ExactMatch::resolve(&kwargs(&[("x", id.into())]), &registry, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(policy.inputs[&b]["x"], id);
    }

    #[tokio::test]
    async fn test_allowed_ids_only_violation_and_not_owner() {
        let a = node("a");
        let id = Uuid::new_v4();
        let mut inputs = NodeInputs::new();
        inputs.insert(a.clone(), BTreeMap::from([("data".to_string(), id)]));
        let policy = ExactMatch::new(inputs);

        let err = policy
            .allowed_ids_only(&kwargs(&[("data", Uuid::new_v4().into())]), &ctx(&a))
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Violation { .. }));

        let err = policy
            .allowed_ids_only(&kwargs(&[("data", id.into())]), &ctx(&node("stranger")))
            .unwrap_err();
        assert!(matches!(err, GovernanceError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_filter_kwargs_missing_object() {
        let a = node("a");
        let id = Uuid::new_v4();
        let mut inputs = NodeInputs::new();
        inputs.insert(a.clone(), BTreeMap::from([("data".to_string(), id)]));
        let policy = ExactMatch::new(inputs);
        let store = MemoryObjectStore::new();

        let err = policy
            .filter_kwargs(&kwargs(&[("data", id.into())]), &ctx(&a), Uuid::new_v4(), &store)
            .await
            .unwrap_err();
        assert_eq!(err, GovernanceError::ObjectMissing { argument: "data".into(), id });
    }
}
