//! Engine data model
//!
//! Everything here is plain data. Anything that ends up inside persisted
//! policy state uses derived serde only, so bincode round-trips it.

use chrono::{DateTime, Utc};
use policy_lang::{compile_restricted, compile_standard, BaseKind, CompileOptions, CompiledUnit, ValidationError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{PolicyError, Result};

// =============================================================================
// IDENTITIES
// =============================================================================

/// Hex-encoded public verification key of an acting party
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VerifyKey(String);

impl VerifyKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Accepts any even-length hex string; normalised to lowercase
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VerifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a remote participant, used to attribute data ownership
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeView {
    pub node_name: String,
    pub node_id: Uuid,
    pub verify_key: VerifyKey,
}

impl fmt::Display for NodeView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.node_name, self.node_id)
    }
}

/// Who is acting, and on which node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub node: NodeView,
    pub credentials: VerifyKey,
}

// =============================================================================
// INPUTS / OUTPUTS
// =============================================================================

/// An argument value handed to a computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputValue {
    Id(Uuid),
    ActionObject { id: Option<Uuid> },
    TwinObject { id: Option<Uuid> },
    Asset { action_id: Option<Uuid> },
}

impl InputValue {
    /// The identifier ownership is resolved against
    pub fn uid(&self) -> Option<Uuid> {
        match self {
            InputValue::Id(id) => Some(*id),
            InputValue::ActionObject { id } | InputValue::TwinObject { id } => *id,
            InputValue::Asset { action_id } => *action_id,
        }
    }
}

impl From<Uuid> for InputValue {
    fn from(id: Uuid) -> Self {
        InputValue::Id(id)
    }
}

/// Identifiers released by one `apply_output` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputIds {
    List(Vec<Uuid>),
    Named(BTreeMap<String, Uuid>),
}

impl OutputIds {
    pub fn len(&self) -> usize {
        match self {
            OutputIds::List(ids) => ids.len(),
            OutputIds::Named(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<Uuid> {
        match self {
            OutputIds::List(ids) => ids.clone(),
            OutputIds::Named(ids) => ids.values().copied().collect(),
        }
    }

    /// Interpreter view: a list of id strings, or a map of name to id string
    pub fn to_value(&self) -> Value {
        match self {
            OutputIds::List(ids) => Value::List(ids.iter().map(|id| Value::Str(id.to_string())).collect()),
            OutputIds::Named(ids) => Value::Map(
                ids.iter()
                    .map(|(k, id)| (k.clone(), Value::Str(id.to_string())))
                    .collect(),
            ),
        }
    }
}

impl From<Uuid> for OutputIds {
    fn from(id: Uuid) -> Self {
        OutputIds::List(vec![id])
    }
}

impl From<Vec<Uuid>> for OutputIds {
    fn from(ids: Vec<Uuid>) -> Self {
        OutputIds::List(ids)
    }
}

impl From<BTreeMap<String, Uuid>> for OutputIds {
    fn from(ids: BTreeMap<String, Uuid>) -> Self {
        OutputIds::Named(ids)
    }
}

/// Immutable audit record of one release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHistory {
    pub output_time: DateTime<Utc>,
    pub outputs: OutputIds,
    pub executing_user_verify_key: VerifyKey,
}

impl OutputHistory {
    pub fn new(outputs: OutputIds, credentials: &VerifyKey) -> Self {
        Self {
            output_time: Utc::now(),
            outputs,
            executing_user_verify_key: credentials.clone(),
        }
    }
}

/// Positional and keyword arguments for constructing a custom policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl InitArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }
}

// =============================================================================
// USER POLICY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserPolicyStatus {
    Submitted,
    Approved,
    Denied,
}

impl UserPolicyStatus {
    /// Submitted -> Approved | Denied, Approved -> Denied. Denied is terminal.
    pub fn transition(self, to: UserPolicyStatus) -> Result<UserPolicyStatus> {
        use UserPolicyStatus::*;
        match (self, to) {
            (Submitted, Approved) | (Submitted, Denied) | (Approved, Denied) => Ok(to),
            (from, to) => Err(PolicyError::InvalidTransition { from, to }),
        }
    }
}

/// Formal parameters derived from the declared input names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub parameters: Vec<String>,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.parameters.join(", "))
    }
}

/// Untrusted submission envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitUserPolicy {
    pub code: String,
    pub class_name: String,
    pub input_names: Vec<String>,
}

impl SubmitUserPolicy {
    pub fn new(code: impl Into<String>, class_name: impl Into<String>, input_names: Vec<String>) -> Self {
        Self {
            code: code.into(),
            class_name: class_name.into(),
            input_names,
        }
    }

    /// Restricted compile of the raw envelope, before anything is persisted
    pub fn compile(&self, options: &CompileOptions) -> std::result::Result<CompiledUnit, ValidationError> {
        compile_restricted(&self.code, options)
    }
}

/// A validated, canonicalized submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPolicy {
    pub id: Uuid,
    pub raw_code: String,
    pub parsed_code: String,
    pub code_hash: String,
    pub class_name: String,
    pub unique_name: String,
    pub signature: Signature,
    pub base: BaseKind,
    pub user_verify_key: VerifyKey,
    pub status: UserPolicyStatus,
    pub state_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserPolicy {
    /// Standard compile of `parsed_code`. Derived on demand, never stored.
    pub fn byte_code(&self, options: &CompileOptions) -> std::result::Result<CompiledUnit, ValidationError> {
        compile_standard(&self.parsed_code, options)
    }

    pub fn valid(&self, options: &CompileOptions) -> bool {
        self.byte_code(options).is_ok()
    }

    pub fn policy_code(&self) -> &str {
        &self.raw_code
    }

    pub fn approve(&mut self) -> Result<()> {
        self.status = self.status.transition(UserPolicyStatus::Approved)?;
        Ok(())
    }

    pub fn deny(&mut self) -> Result<()> {
        self.status = self.status.transition(UserPolicyStatus::Denied)?;
        Ok(())
    }
}
