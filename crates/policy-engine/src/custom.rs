//! User-authored governance types
//!
//! A custom instance is its persisted state plus the loaded class. The state
//! keeps the construction arguments so an instance can be rebuilt after a
//! round trip through storage.

use policy_lang::{BaseKind, EvalError, Evaluator, OutputCapture, PolicyClass, Scope, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, trace};
use uuid::Uuid;

use crate::error::{ExecutionError, GovernanceError};
use crate::input::{InputPolicy, NodeInputs};
use crate::output::OutputPolicy;
use crate::types::{ExecutionContext, InitArgs, OutputHistory, OutputIds};

/// Serializable part of a custom policy instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPolicyState {
    pub id: Uuid,
    pub unique_name: String,
    pub base: BaseKind,
    pub init_args: Vec<Value>,
    pub init_kwargs: BTreeMap<String, Value>,
    pub params: BTreeMap<String, Value>,
    pub fields: BTreeMap<String, Value>,
    pub output_history: Vec<OutputHistory>,
    pub inputs: NodeInputs,
    pub node_uid: Option<Uuid>,
}

/// Runs one evaluation with its own capture, which is drained on every exit.
fn with_evaluator<T>(
    class: &str,
    budget: u64,
    f: impl FnOnce(&mut Evaluator<'_>) -> Result<T, EvalError>,
) -> Result<T, EvalError> {
    let mut capture = OutputCapture::new();
    let result = f(&mut Evaluator::new(budget, &mut capture));
    for line in capture.take() {
        trace!(class, %line, "policy output");
    }
    result
}

/// Map positional then keyword arguments onto declared parameters
pub fn bind_arguments(
    class: &PolicyClass,
    args: &InitArgs,
    budget: u64,
) -> Result<BTreeMap<String, Value>, ExecutionError> {
    if args.args.len() > class.params.len() {
        return Err(ExecutionError::TooManyArguments {
            expected: class.params.len(),
            found: args.args.len(),
        });
    }
    if let Some(unknown) = args.kwargs.keys().find(|k| !class.params.contains(k)) {
        return Err(ExecutionError::UnexpectedArgument(unknown.clone()));
    }

    let mut bound = BTreeMap::new();
    for (i, param) in class.params.iter().enumerate() {
        let positional = args.args.get(i);
        let keyword = args.kwargs.get(param);
        let value = match (positional, keyword) {
            (Some(_), Some(_)) => return Err(ExecutionError::UnexpectedArgument(param.clone())),
            (Some(v), None) | (None, Some(v)) => v.clone(),
            (None, None) => match class.default_for(param) {
                Some(expr) => with_evaluator(&class.name, budget, |ev| ev.eval(expr, &Scope::new()))?,
                None => return Err(ExecutionError::MissingArgument(param.clone())),
            },
        };
        bound.insert(param.clone(), value);
    }
    Ok(bound)
}

#[derive(Debug, Clone)]
struct Core {
    state: CustomPolicyState,
    class: Arc<PolicyClass>,
    budget: u64,
}

impl Core {
    fn construct(class: Arc<PolicyClass>, args: InitArgs, budget: u64) -> Result<Self, ExecutionError> {
        let params = bind_arguments(&class, &args, budget)?;

        let mut scope = Scope::new();
        scope.extend(params.clone());
        let mut fields = BTreeMap::new();
        with_evaluator(&class.name, budget, |ev| {
            for (name, expr) in &class.state {
                fields.insert(name.clone(), ev.eval(expr, &scope)?);
            }
            Ok(())
        })?;

        Ok(Self {
            state: CustomPolicyState {
                id: Uuid::new_v4(),
                unique_name: class.name.clone(),
                base: class.base,
                init_args: args.args,
                init_kwargs: args.kwargs,
                params,
                fields,
                output_history: Vec::new(),
                inputs: NodeInputs::new(),
                node_uid: None,
            },
            class,
            budget,
        })
    }

    fn scope(&self) -> Scope {
        let mut scope = Scope::new();
        scope.extend(self.state.params.clone());
        scope.extend(self.state.fields.clone());
        scope
    }

    fn public_state(&self, scope: &Scope) -> Result<Value, GovernanceError> {
        let mut out = BTreeMap::new();
        with_evaluator(&self.class.name, self.budget, |ev| {
            for (name, expr) in &self.class.public {
                out.insert(name.clone(), ev.eval(expr, scope)?);
            }
            Ok(())
        })?;
        Ok(Value::Map(out))
    }
}

/// Instance of a class based on `CustomOutputPolicy`
#[derive(Debug, Clone)]
pub struct CustomOutputPolicy(Core);

impl CustomOutputPolicy {
    pub fn state(&self) -> &CustomPolicyState {
        &self.0.state
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.state.fields.get(name)
    }

    fn scope(&self, context: Option<&ExecutionContext>, outputs: Option<&OutputIds>) -> Scope {
        let count = i64::try_from(self.0.state.output_history.len()).unwrap_or(i64::MAX);
        self.0
            .scope()
            .with("count", Value::Int(count))
            .with("outputs", outputs.map_or(Value::List(Vec::new()), OutputIds::to_value))
            .with(
                "user",
                context.map_or(Value::Nil, |c| Value::Str(c.credentials.to_string())),
            )
    }
}

impl OutputPolicy for CustomOutputPolicy {
    fn id(&self) -> Uuid {
        self.0.state.id
    }

    fn output_history(&self) -> &[OutputHistory] {
        &self.0.state.output_history
    }

    fn outputs(&self) -> &[String] {
        &self.0.class.outputs
    }

    /// Evaluate `:admit`, then compute every `:on-admit` update against the
    /// pre-release scope. State is only touched once everything succeeded.
    fn apply_output(
        &mut self,
        context: &ExecutionContext,
        outputs: OutputIds,
    ) -> Result<OutputHistory, GovernanceError> {
        let scope = self.scope(Some(context), Some(&outputs));
        let class = Arc::clone(&self.0.class);

        let updates = with_evaluator(&class.name, self.0.budget, |ev| {
            let admitted = match &class.admit {
                Some(expr) => ev.eval_bool(expr, &scope, "admit")?,
                None => true,
            };
            if !admitted {
                return Ok(None);
            }
            let mut updates = Vec::with_capacity(class.on_admit.len());
            for (name, expr) in &class.on_admit {
                updates.push((name.clone(), ev.eval(expr, &scope)?));
            }
            Ok(Some(updates))
        })?;

        let Some(updates) = updates else {
            return Err(GovernanceError::Rejected {
                policy: class.name.clone(),
            });
        };

        let record = OutputHistory::new(outputs, &context.credentials);
        self.0.state.output_history.push(record.clone());
        self.0.state.fields.extend(updates);
        info!(policy = %self.0.state.id, class = %class.name, "output released");
        Ok(record)
    }

    fn public_state(&self) -> Result<Value, GovernanceError> {
        self.0.public_state(&self.scope(None, None))
    }

    fn policy_code(&self) -> String {
        self.0.class.source.clone()
    }
}

/// Instance of a class based on `CustomInputPolicy`
#[derive(Debug, Clone)]
pub struct CustomInputPolicy(Core);

impl CustomInputPolicy {
    pub fn state(&self) -> &CustomPolicyState {
        &self.0.state
    }

    pub fn with_inputs(mut self, inputs: NodeInputs) -> Self {
        self.0.state.inputs = inputs;
        self
    }

    pub fn public_state(&self) -> Result<Value, GovernanceError> {
        self.0.public_state(&self.0.scope())
    }
}

impl InputPolicy for CustomInputPolicy {
    fn id(&self) -> Uuid {
        self.0.state.id
    }

    fn inputs(&self) -> &NodeInputs {
        &self.0.state.inputs
    }

    fn policy_code(&self) -> String {
        self.0.class.source.clone()
    }

    fn accepts(&self, argument: &str, id: Uuid, context: &ExecutionContext) -> Result<bool, GovernanceError> {
        let Some(expr) = &self.0.class.accept else {
            return Ok(true);
        };
        let scope = self
            .0
            .scope()
            .with("key", Value::from(argument))
            .with("id", Value::Str(id.to_string()))
            .with("user", Value::Str(context.credentials.to_string()));
        Ok(with_evaluator(&self.0.class.name, self.0.budget, |ev| {
            ev.eval_bool(expr, &scope, "accept")
        })?)
    }
}

/// A constructed custom policy of either base
#[derive(Debug, Clone)]
pub enum CustomPolicy {
    Input(CustomInputPolicy),
    Output(CustomOutputPolicy),
}

impl CustomPolicy {
    pub fn instantiate(class: Arc<PolicyClass>, args: InitArgs, budget: u64) -> Result<Self, ExecutionError> {
        let core = Core::construct(class, args, budget)?;
        Ok(match core.state.base {
            BaseKind::Input => CustomPolicy::Input(CustomInputPolicy(core)),
            BaseKind::Output => CustomPolicy::Output(CustomOutputPolicy(core)),
        })
    }

    /// Re-attach persisted state to its loaded class
    pub fn rehydrate(class: Arc<PolicyClass>, state: CustomPolicyState, budget: u64) -> Result<Self, ExecutionError> {
        if state.unique_name != class.name {
            return Err(ExecutionError::StateMismatch {
                expected: class.name.clone(),
                found: state.unique_name,
            });
        }
        if state.base != class.base {
            return Err(ExecutionError::WrongKind {
                unique_name: class.name.clone(),
                expected: state.base,
                found: class.base,
            });
        }
        let core = Core { state, class, budget };
        Ok(match core.state.base {
            BaseKind::Input => CustomPolicy::Input(CustomInputPolicy(core)),
            BaseKind::Output => CustomPolicy::Output(CustomOutputPolicy(core)),
        })
    }

    pub fn state(&self) -> &CustomPolicyState {
        match self {
            CustomPolicy::Input(p) => p.state(),
            CustomPolicy::Output(p) => p.state(),
        }
    }

    pub fn base(&self) -> BaseKind {
        self.state().base
    }

    pub fn policy_code(&self) -> String {
        match self {
            CustomPolicy::Input(p) => InputPolicy::policy_code(p),
            CustomPolicy::Output(p) => OutputPolicy::policy_code(p),
        }
    }

    pub fn into_output(self) -> Result<CustomOutputPolicy, ExecutionError> {
        match self {
            CustomPolicy::Output(p) => Ok(p),
            CustomPolicy::Input(p) => Err(ExecutionError::WrongKind {
                unique_name: p.0.state.unique_name,
                expected: BaseKind::Output,
                found: BaseKind::Input,
            }),
        }
    }

    pub fn into_input(self) -> Result<CustomInputPolicy, ExecutionError> {
        match self {
            CustomPolicy::Input(p) => Ok(p),
            CustomPolicy::Output(p) => Err(ExecutionError::WrongKind {
                unique_name: p.0.state.unique_name,
                expected: BaseKind::Input,
                found: BaseKind::Output,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeView, VerifyKey};
    use policy_lang::{canonicalize, compile_standard, CompileOptions};

    fn class(src: &str) -> Arc<PolicyClass> {
        let canonical = canonicalize(src, "P_k_h", &CompileOptions::default()).unwrap();
        Arc::new(compile_standard(&canonical.parsed_code, &CompileOptions::default()).unwrap().class)
    }

    fn ctx() -> ExecutionContext {
        let key = VerifyKey::from_bytes(b"bob");
        ExecutionContext {
            node: NodeView {
                node_name: "n".into(),
                node_id: Uuid::nil(),
                verify_key: key.clone(),
            },
            credentials: key,
        }
    }

    const LIMITED: &str = r#"
(class Limited [CustomOutputPolicy]
  :params [limit]
  :defaults {:limit 2}
  :state {:released 0}
  :public {:limit @limit :released @released}
  :admit (< @released @limit)
  :on-admit {:released (+ @released 1)})
"#;

    #[test]
    fn test_binding_rules() {
        let class = class(LIMITED);
        let bound = bind_arguments(&class, &InitArgs::new(), 100).unwrap();
        assert_eq!(bound["limit"], Value::Int(2));

        let bound = bind_arguments(&class, &InitArgs::new().arg(5i64), 100).unwrap();
        assert_eq!(bound["limit"], Value::Int(5));

        let err = bind_arguments(&class, &InitArgs::new().kwarg("cap", 1i64), 100).unwrap_err();
        assert_eq!(err, ExecutionError::UnexpectedArgument("cap".into()));

        let err = bind_arguments(&class, &InitArgs::new().arg(1i64).arg(2i64), 100).unwrap_err();
        assert!(matches!(err, ExecutionError::TooManyArguments { expected: 1, found: 2 }));

        let err = bind_arguments(&class, &InitArgs::new().arg(1i64).kwarg("limit", 2i64), 100).unwrap_err();
        assert_eq!(err, ExecutionError::UnexpectedArgument("limit".into()));
    }

    #[test]
    fn test_missing_argument() {
        let class = class("(class A [CustomOutputPolicy] :params [limit])");
        let err = bind_arguments(&class, &InitArgs::new(), 100).unwrap_err();
        assert_eq!(err, ExecutionError::MissingArgument("limit".into()));
    }

    #[test]
    fn test_custom_output_admits_then_rejects() {
        let mut policy = CustomPolicy::instantiate(class(LIMITED), InitArgs::new(), 1000)
            .unwrap()
            .into_output()
            .unwrap();

        policy.apply_output(&ctx(), Uuid::new_v4().into()).unwrap();
        policy.apply_output(&ctx(), Uuid::new_v4().into()).unwrap();
        assert_eq!(policy.field("released"), Some(&Value::Int(2)));

        let err = policy.apply_output(&ctx(), Uuid::new_v4().into()).unwrap_err();
        assert_eq!(err, GovernanceError::Rejected { policy: "P_k_h".into() });
        assert_eq!(policy.output_history().len(), 2);
        assert_eq!(policy.field("released"), Some(&Value::Int(2)));

        let Value::Map(public) = policy.public_state().unwrap() else {
            panic!("public state is a map");
        };
        assert_eq!(public["released"], Value::Int(2));
        assert_eq!(public["limit"], Value::Int(2));
    }

    #[test]
    fn test_failed_update_leaves_state_untouched() {
        let src = "(class A [CustomOutputPolicy] :state {:n 0 :last 0} :on-admit {:n (+ @n 1) :last (/ 1 0)})";
        let mut policy = CustomPolicy::instantiate(class(src), InitArgs::new(), 1000)
            .unwrap()
            .into_output()
            .unwrap();
        let err = policy.apply_output(&ctx(), Uuid::new_v4().into()).unwrap_err();
        assert!(matches!(err, GovernanceError::Evaluation(EvalError::DivisionByZero { .. })));
        assert_eq!(policy.field("n"), Some(&Value::Int(0)));
        assert!(policy.output_history().is_empty());
    }

    #[test]
    fn test_print_does_not_fail_construction() {
        let src = r#"(class A [CustomOutputPolicy] :state {:note (print "constructing")})"#;
        let policy = CustomPolicy::instantiate(class(src), InitArgs::new(), 1000).unwrap();
        assert_eq!(policy.state().fields["note"], Value::Nil);
    }

    #[test]
    fn test_input_accept_predicate() {
        let src = r#"(class OnlyData [CustomInputPolicy] :accept (= @key "data"))"#;
        let policy = CustomPolicy::instantiate(class(src), InitArgs::new(), 1000)
            .unwrap()
            .into_input()
            .unwrap();
        assert!(policy.accepts("data", Uuid::new_v4(), &ctx()).unwrap());
        assert!(!policy.accepts("labels", Uuid::new_v4(), &ctx()).unwrap());
    }

    #[test]
    fn test_rehydrate_checks_class() {
        let policy = CustomPolicy::instantiate(class(LIMITED), InitArgs::new(), 1000).unwrap();
        let mut state = policy.state().clone();
        state.unique_name = "Other".into();
        let err = CustomPolicy::rehydrate(class(LIMITED), state, 1000).unwrap_err();
        assert!(matches!(err, ExecutionError::StateMismatch { .. }));
    }

    #[test]
    fn test_wrong_kind() {
        let policy = CustomPolicy::instantiate(class(LIMITED), InitArgs::new(), 1000).unwrap();
        assert!(matches!(policy.into_input(), Err(ExecutionError::WrongKind { .. })));
    }
}
