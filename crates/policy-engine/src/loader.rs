//! Loads a runnable class for a persisted user policy
//!
//! Primary path: standard-compile `parsed_code`, evaluate the class body
//! (its `:defaults`) under a fresh capture, and pick the class out by
//! `unique_name`. Success registers the class at the fallback version, so
//! the fallback path finds exactly what the primary path produced.
//!
//! Fallback path: look `{unique_name}_{fallback_version}` up in the
//! registry. When both fail, both causes are reported.

use policy_lang::{compile_standard, CompileOptions, Evaluator, OutputCapture, PolicyClass, Scope};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::error::ExecutionError;
use crate::registry::{GovernedType, TypeRegistry};
use crate::types::{UserPolicy, UserPolicyStatus};

/// Drains captured output when dropped, on success and error alike.
pub struct CaptureScope<'a> {
    owner: &'a str,
    capture: OutputCapture,
}

impl<'a> CaptureScope<'a> {
    pub fn new(owner: &'a str) -> Self {
        Self {
            owner,
            capture: OutputCapture::new(),
        }
    }

    pub fn capture(&mut self) -> &mut OutputCapture {
        &mut self.capture
    }
}

impl Drop for CaptureScope<'_> {
    fn drop(&mut self) {
        for line in self.capture.take() {
            trace!(class = self.owner, %line, "captured policy output");
        }
    }
}

pub struct Loader {
    registry: Arc<TypeRegistry>,
    options: CompileOptions,
    max_eval_steps: u64,
    fallback_version: u32,
}

impl Loader {
    pub fn new(registry: Arc<TypeRegistry>, options: CompileOptions, max_eval_steps: u64, fallback_version: u32) -> Self {
        Self {
            registry,
            options,
            max_eval_steps,
            fallback_version,
        }
    }

    /// Registry version loaded classes are stored under
    pub fn fallback_version(&self) -> u32 {
        self.fallback_version
    }

    pub fn load(&self, policy: &UserPolicy) -> Result<Arc<PolicyClass>, ExecutionError> {
        if policy.status == UserPolicyStatus::Denied {
            return Err(ExecutionError::Denied {
                unique_name: policy.unique_name.clone(),
            });
        }

        let primary = match self.execute(policy) {
            Ok(class) => {
                let class = Arc::new(class);
                self.registry.register(
                    &policy.unique_name,
                    self.fallback_version,
                    GovernedType::Custom(Arc::clone(&class)),
                );
                return Ok(class);
            }
            Err(reason) => reason,
        };

        warn!(
            unique_name = %policy.unique_name,
            reason = %primary,
            version = self.fallback_version,
            "primary load failed, trying registry"
        );
        match self.registry.lookup(&policy.unique_name, self.fallback_version) {
            Some(GovernedType::Custom(class)) => Ok(class),
            other => {
                let fallback = match other {
                    Some(GovernedType::Builtin(kind)) => {
                        format!("registered type is builtin {}", kind.canonical_name())
                    }
                    _ => format!(
                        "{}_{} is not registered",
                        policy.unique_name, self.fallback_version
                    ),
                };
                error!(unique_name = %policy.unique_name, %primary, %fallback, "policy could not be loaded");
                Err(ExecutionError::LoadFailed {
                    unique_name: policy.unique_name.clone(),
                    primary,
                    fallback,
                })
            }
        }
    }

    fn execute(&self, policy: &UserPolicy) -> Result<PolicyClass, String> {
        let unit = compile_standard(&policy.parsed_code, &self.options).map_err(|e| e.to_string())?;
        let class = unit.class;
        if class.name != policy.unique_name {
            return Err(format!(
                "compiled unit defines '{}', not '{}'",
                class.name, policy.unique_name
            ));
        }

        let mut scope = CaptureScope::new(&policy.unique_name);
        let mut evaluator = Evaluator::new(self.max_eval_steps, scope.capture());
        for (param, expr) in &class.defaults {
            evaluator
                .eval(expr, &Scope::new())
                .map_err(|e| format!("default for '{}': {}", param, e))?;
        }
        debug!(unique_name = %class.name, steps = evaluator.steps_used(), "class body evaluated");
        Ok(class)
    }
}
