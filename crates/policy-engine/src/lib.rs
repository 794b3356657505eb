//! Governance core for remotely submitted computations
//!
//! A submission is validated and canonicalized into a [`UserPolicy`], loaded
//! into a runnable class on demand, and instantiated per request. Input
//! policies decide which upstream objects a computation may read; output
//! policies gate every release of its results.
//!
//! ```text
//! SubmitUserPolicy ──pipeline──▶ UserPolicy ──loader──▶ PolicyClass
//!                                                        │
//!                      InputPolicy ◀── instantiate ──────┤
//!                      OutputPolicy ◀────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod custom;
pub mod error;
pub mod hash;
pub mod input;
pub mod loader;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;
pub mod store_memory;
pub mod types;

pub use config::EngineConfig;
pub use custom::{CustomInputPolicy, CustomOutputPolicy, CustomPolicy, CustomPolicyState};
pub use error::{ExecutionError, GovernanceError, OwnershipError, PolicyError, Result};
pub use input::{partition_by_node, AllowedInputs, ExactMatch, InputPolicy, NodeInputs};
pub use output::{BasicOutputPolicy, OutputPolicy, OutputPolicyExecuteCount, OutputPolicyExecuteOnce};
pub use registry::{BuiltinKind, GovernedType, TypeKey, TypeRegistry};
pub use service::PolicyEngine;
pub use state::PolicyState;
pub use types::{
    ExecutionContext, InitArgs, InputValue, NodeView, OutputHistory, OutputIds, Signature, SubmitUserPolicy,
    UserPolicy, UserPolicyStatus, VerifyKey,
};
