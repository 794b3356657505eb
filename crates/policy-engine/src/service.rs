//! `PolicyEngine` - the facade the outer service layer talks to

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec;
use crate::config::EngineConfig;
use crate::custom::CustomPolicy;
use crate::error::{ExecutionError, GovernanceError, OwnershipError, PolicyError, Result};
use crate::input::{partition_by_node, AllowedInputs, InputPolicy, NodeInputs};
use crate::loader::Loader;
use crate::output::OutputPolicy;
use crate::pipeline::{self, TransformContext};
use crate::registry::TypeRegistry;
use crate::state::PolicyState;
use crate::store::{ConnectionRegistry, ObjectStore, PolicyStateStore};
use crate::types::{ExecutionContext, InitArgs, InputValue, OutputHistory, OutputIds, SubmitUserPolicy, UserPolicy, VerifyKey};

pub struct PolicyEngine {
    config: EngineConfig,
    registry: Arc<TypeRegistry>,
    loader: Loader,
    connections: Arc<dyn ConnectionRegistry>,
    objects: Arc<dyn ObjectStore>,
    states: Arc<dyn PolicyStateStore>,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl PolicyEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<TypeRegistry>,
        connections: Arc<dyn ConnectionRegistry>,
        objects: Arc<dyn ObjectStore>,
        states: Arc<dyn PolicyStateStore>,
    ) -> Result<Self> {
        config.validate()?;
        let loader = Loader::new(
            Arc::clone(&registry),
            config.compile_options(),
            config.max_eval_steps,
            config.fallback_version,
        );
        Ok(Self {
            config,
            registry,
            loader,
            connections,
            objects,
            states,
            locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    // ── Submission ──

    /// Validate, canonicalize and compile a submission. All or nothing.
    pub fn submit(&self, submission: SubmitUserPolicy, credentials: &VerifyKey) -> Result<UserPolicy> {
        let options = self.config.compile_options();
        if self.config.restricted_precheck {
            submission.compile(&options)?;
        }
        let ctx = TransformContext::new(credentials.clone(), options);
        let policy = pipeline::run(submission, &ctx)?;
        info!(id = %policy.id, unique_name = %policy.unique_name, "policy submitted");
        Ok(policy)
    }

    // ── Instantiation ──

    pub fn instantiate(&self, policy: &UserPolicy, args: InitArgs) -> Result<CustomPolicy, ExecutionError> {
        let class = self.loader.load(policy)?;
        CustomPolicy::instantiate(class, args, self.config.max_eval_steps)
    }

    /// Instantiate a custom input policy and attribute its inputs
    pub async fn instantiate_input(
        &self,
        policy: &UserPolicy,
        args: InitArgs,
        kwargs: &BTreeMap<String, InputValue>,
    ) -> Result<CustomPolicy> {
        let instance = self.instantiate(policy, args)?.into_input()?;
        let inputs = self.resolve_ownership(kwargs).await?;
        Ok(CustomPolicy::Input(instance.with_inputs(inputs)))
    }

    // ── Input governance ──

    pub async fn resolve_ownership(&self, kwargs: &BTreeMap<String, InputValue>) -> Result<NodeInputs, OwnershipError> {
        partition_by_node(kwargs, self.connections.as_ref(), self.config.connection_timeout()).await
    }

    pub async fn filter_inputs(
        &self,
        policy: &dyn InputPolicy,
        kwargs: &BTreeMap<String, InputValue>,
        context: &ExecutionContext,
        code_id: Uuid,
    ) -> Result<AllowedInputs> {
        Ok(policy
            .filter_kwargs(kwargs, context, code_id, self.objects.as_ref())
            .await?)
    }

    // ── Output governance ──

    pub fn apply_output(
        &self,
        policy: &mut dyn OutputPolicy,
        context: &ExecutionContext,
        outputs: impl Into<OutputIds>,
    ) -> Result<OutputHistory, GovernanceError> {
        policy.apply_output(context, outputs.into())
    }

    /// Store a policy's state under its id
    pub async fn save_policy_state(&self, state: &PolicyState) -> Result<()> {
        let bytes = codec::serialize(state)?;
        self.states
            .save(state.id(), bytes)
            .await
            .map_err(|e| PolicyError::Store(e.to_string()))
    }

    pub async fn load_policy_state(&self, policy_id: Uuid) -> Result<PolicyState> {
        let bytes = self
            .states
            .load(policy_id)
            .await
            .map_err(|e| PolicyError::Store(e.to_string()))?
            .ok_or(PolicyError::UnknownPolicy(policy_id))?;
        let state: PolicyState = codec::deserialize(&bytes)?;
        state.check()?;
        Ok(state)
    }

    /// load -> decode -> apply -> encode -> save, one writer per policy id
    pub async fn apply_output_persisted(
        &self,
        policy_id: Uuid,
        context: &ExecutionContext,
        outputs: impl Into<OutputIds>,
    ) -> Result<OutputHistory> {
        let lock = self.lock_for(policy_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_output_locked(policy_id, context, outputs.into()).await
        };
        self.release_lock(policy_id, lock);
        result
    }

    async fn apply_output_locked(
        &self,
        policy_id: Uuid,
        context: &ExecutionContext,
        outputs: OutputIds,
    ) -> Result<OutputHistory> {
        let state = self.load_policy_state(policy_id).await?;
        let (record, updated) = match state {
            PolicyState::OutputPolicy(mut p) => (p.apply_output(context, outputs)?, PolicyState::from(p)),
            PolicyState::OutputPolicyExecuteCount(mut p) => (p.apply_output(context, outputs)?, PolicyState::from(p)),
            PolicyState::OutputPolicyExecuteOnce(mut p) => (p.apply_output(context, outputs)?, PolicyState::from(p)),
            PolicyState::CustomOutput(state) => {
                let version = self.loader.fallback_version();
                let class = self
                    .registry
                    .lookup(&state.unique_name, version)
                    .and_then(|t| t.as_custom().cloned())
                    .ok_or_else(|| ExecutionError::LoadFailed {
                        unique_name: state.unique_name.clone(),
                        primary: "no source available for persisted instance".to_string(),
                        fallback: format!("{}_{} is not registered", state.unique_name, version),
                    })?;
                let mut policy = CustomPolicy::rehydrate(class, state, self.config.max_eval_steps)?.into_output()?;
                let record = policy.apply_output(context, outputs)?;
                (record, PolicyState::from(&policy))
            }
            other => {
                return Err(ExecutionError::StateMismatch {
                    expected: "an output policy".to_string(),
                    found: other.kind().to_string(),
                }
                .into())
            }
        };
        self.save_policy_state(&updated).await?;
        debug!(%policy_id, "persisted output state updated");
        Ok(record)
    }

    fn lock_for(&self, policy_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(policy_id).or_default())
    }

    /// Drop the caller's handle; the entry goes once no other caller holds it
    fn release_lock(&self, policy_id: Uuid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(&policy_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&policy_id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ── Persistence codec ──

    pub fn update_policy_state(&self, state: &PolicyState) -> Result<Vec<u8>> {
        codec::serialize(state)
    }

    /// Rebuild a custom instance from bytes produced by `update_policy_state`
    pub fn get_policy_object(&self, policy: &UserPolicy, bytes: &[u8]) -> Result<CustomPolicy> {
        let state = match codec::deserialize::<PolicyState>(bytes)? {
            PolicyState::CustomInput(s) | PolicyState::CustomOutput(s) => s,
            other => {
                return Err(ExecutionError::StateMismatch {
                    expected: policy.unique_name.clone(),
                    found: other.kind().to_string(),
                }
                .into())
            }
        };
        let class = self.loader.load(policy)?;
        Ok(CustomPolicy::rehydrate(class, state, self.config.max_eval_steps)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputPolicyExecuteCount;
    use crate::store_memory::{MemoryConnectionRegistry, MemoryObjectStore, MemoryPolicyStateStore};
    use crate::types::NodeView;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            EngineConfig::default(),
            Arc::new(TypeRegistry::with_builtins()),
            Arc::new(MemoryConnectionRegistry::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryPolicyStateStore::new()),
        )
        .unwrap()
    }

    fn ctx() -> ExecutionContext {
        let key = VerifyKey::from_bytes(b"carol");
        ExecutionContext {
            node: NodeView {
                node_name: "n".into(),
                node_id: Uuid::nil(),
                verify_key: key.clone(),
            },
            credentials: key,
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_eval_steps: 0,
            ..EngineConfig::default()
        };
        let result = PolicyEngine::new(
            config,
            Arc::new(TypeRegistry::new()),
            Arc::new(MemoryConnectionRegistry::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryPolicyStateStore::new()),
        );
        assert!(matches!(result, Err(PolicyError::Config(_))));
    }

    #[test]
    fn test_precheck_refuses_foreign_decoration() {
        let src = "#(native)\n(class A [CustomOutputPolicy])";
        let err = engine()
            .submit(SubmitUserPolicy::new(src, "A", vec![]), &VerifyKey::from_bytes(b"k"))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_persisted_apply_on_unknown_policy() {
        let err = engine()
            .apply_output_persisted(Uuid::new_v4(), &ctx(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_POLICY");
    }

    #[tokio::test]
    async fn test_persisted_apply_on_input_state() {
        let engine = engine();
        let state = PolicyState::ExactMatch(crate::input::ExactMatch::new(NodeInputs::new()));
        engine.save_policy_state(&state).await.unwrap();
        let err = engine
            .apply_output_persisted(state.id(), &ctx(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Execution(ExecutionError::StateMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lock_table_empties_after_releases() {
        let engine = Arc::new(engine());
        let mut ids = Vec::new();
        for _ in 0..4 {
            let policy = OutputPolicyExecuteCount::new(2, vec![]);
            ids.push(policy.id);
            engine.save_policy_state(&policy.into()).await.unwrap();
        }

        let mut tasks = Vec::new();
        for id in ids.iter().cycle().take(12).copied() {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine.apply_output_persisted(id, &ctx(), Uuid::new_v4()).await
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }
        assert_eq!(engine.lock_count(), 0);

        // failed calls release too
        let _ = engine.apply_output_persisted(Uuid::new_v4(), &ctx(), Uuid::new_v4()).await;
        assert_eq!(engine.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_persisted_count_is_refused() {
        let engine = engine();
        let forged = OutputPolicyExecuteCount::new(3, vec![]).with_count(5);
        let id = forged.id;
        engine
            .states
            .save(id, codec::serialize(&PolicyState::from(forged)).unwrap())
            .await
            .unwrap();

        let err = engine.load_policy_state(id).await.unwrap_err();
        assert_eq!(err.code(), "CORRUPT_STATE");
        let err = engine.apply_output_persisted(id, &ctx(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PolicyError::Governance(GovernanceError::CorruptState(_))));
    }

    #[tokio::test]
    async fn test_persisted_count_survives_reload() {
        let engine = engine();
        let policy = OutputPolicyExecuteCount::new(2, vec![]);
        let id = policy.id;
        engine.save_policy_state(&policy.into()).await.unwrap();

        engine.apply_output_persisted(id, &ctx(), Uuid::new_v4()).await.unwrap();
        engine.apply_output_persisted(id, &ctx(), Uuid::new_v4()).await.unwrap();
        let err = engine.apply_output_persisted(id, &ctx(), Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_exhausted());

        match engine.load_policy_state(id).await.unwrap() {
            PolicyState::OutputPolicyExecuteCount(p) => {
                assert_eq!(p.count(), 2);
                assert_eq!(p.output_history.len(), 2);
            }
            other => panic!("unexpected state {}", other.kind()),
        }
    }
}
