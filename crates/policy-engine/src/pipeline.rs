//! Submission transform pipeline
//!
//! ```text
//! SubmitUserPolicy
//!   -> generate_id -> hash_code -> generate_unique_name -> generate_signature
//!   -> check_class_code -> compile_code -> add_credentials
//!   -> UserPolicy
//! ```
//!
//! Each step is a pure function of the draft and the context. The first
//! failure aborts the run; a `UserPolicy` is only built once every step
//! has succeeded.

use chrono::{DateTime, Utc};
use policy_lang::{canonicalize, compile_standard, BaseKind, CompileOptions};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PolicyError, Result};
use crate::hash::{code_hash, unique_name};
use crate::types::{Signature, SubmitUserPolicy, UserPolicy, UserPolicyStatus, VerifyKey};

/// Everything a run may depend on besides the submission itself
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub credentials: VerifyKey,
    pub id: Uuid,
    pub now: DateTime<Utc>,
    pub options: CompileOptions,
}

impl TransformContext {
    pub fn new(credentials: VerifyKey, options: CompileOptions) -> Self {
        Self {
            credentials,
            id: Uuid::new_v4(),
            now: Utc::now(),
            options,
        }
    }
}

/// Partially transformed submission
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub raw_code: String,
    pub class_name: String,
    pub input_names: Vec<String>,
    pub id: Option<Uuid>,
    pub code_hash: Option<String>,
    pub unique_name: Option<String>,
    pub signature: Option<Signature>,
    pub parsed_code: Option<String>,
    pub base: Option<BaseKind>,
    pub compiled: bool,
    pub user_verify_key: Option<VerifyKey>,
}

impl From<SubmitUserPolicy> for Draft {
    fn from(submission: SubmitUserPolicy) -> Self {
        Self {
            raw_code: submission.code,
            class_name: submission.class_name,
            input_names: submission.input_names,
            ..Default::default()
        }
    }
}

pub type Step = fn(Draft, &TransformContext) -> Result<Draft>;

pub const STEPS: &[(&str, Step)] = &[
    ("generate_id", generate_id),
    ("hash_code", hash_code),
    ("generate_unique_name", generate_unique_name),
    ("generate_signature", generate_signature),
    ("check_class_code", check_class_code),
    ("compile_code", compile_code),
    ("add_credentials", add_credentials),
];

pub fn run(submission: SubmitUserPolicy, ctx: &TransformContext) -> Result<UserPolicy> {
    let mut draft = Draft::from(submission);
    for (name, step) in STEPS {
        draft = step(draft, ctx)?;
        debug!(step = name, class = %draft.class_name, "pipeline step complete");
    }
    finish(draft, ctx)
}

pub fn generate_id(mut draft: Draft, ctx: &TransformContext) -> Result<Draft> {
    draft.id = Some(ctx.id);
    Ok(draft)
}

pub fn hash_code(mut draft: Draft, _ctx: &TransformContext) -> Result<Draft> {
    draft.code_hash = Some(code_hash(&draft.raw_code));
    Ok(draft)
}

pub fn generate_unique_name(mut draft: Draft, ctx: &TransformContext) -> Result<Draft> {
    let hash = draft.code_hash.as_deref().ok_or(PolicyError::Incomplete("hash_code"))?;
    draft.unique_name = Some(unique_name(&draft.class_name, &ctx.credentials, hash));
    Ok(draft)
}

pub fn generate_signature(mut draft: Draft, _ctx: &TransformContext) -> Result<Draft> {
    draft.signature = Some(Signature {
        parameters: draft.input_names.clone(),
    });
    Ok(draft)
}

/// Validate and canonicalize. Whatever class the source defines is renamed
/// to the unique name, so a differing envelope name is only logged.
pub fn check_class_code(mut draft: Draft, ctx: &TransformContext) -> Result<Draft> {
    let unique = draft
        .unique_name
        .as_deref()
        .ok_or(PolicyError::Incomplete("generate_unique_name"))?;
    let canonical = canonicalize(&draft.raw_code, unique, &ctx.options)?;
    if canonical.original_name != draft.class_name {
        warn!(
            declared = %draft.class_name,
            defined = %canonical.original_name,
            "declared class name differs from source"
        );
    }
    draft.parsed_code = Some(canonical.parsed_code);
    draft.base = Some(canonical.base);
    Ok(draft)
}

pub fn compile_code(mut draft: Draft, ctx: &TransformContext) -> Result<Draft> {
    let parsed = draft
        .parsed_code
        .as_deref()
        .ok_or(PolicyError::Incomplete("check_class_code"))?;
    compile_standard(parsed, &ctx.options)?;
    draft.compiled = true;
    Ok(draft)
}

pub fn add_credentials(mut draft: Draft, ctx: &TransformContext) -> Result<Draft> {
    draft.user_verify_key = Some(ctx.credentials.clone());
    Ok(draft)
}

fn finish(draft: Draft, ctx: &TransformContext) -> Result<UserPolicy> {
    if !draft.compiled {
        return Err(PolicyError::Incomplete("compile_code"));
    }
    Ok(UserPolicy {
        id: draft.id.ok_or(PolicyError::Incomplete("generate_id"))?,
        code_hash: draft.code_hash.ok_or(PolicyError::Incomplete("hash_code"))?,
        unique_name: draft.unique_name.ok_or(PolicyError::Incomplete("generate_unique_name"))?,
        signature: draft.signature.ok_or(PolicyError::Incomplete("generate_signature"))?,
        parsed_code: draft.parsed_code.ok_or(PolicyError::Incomplete("check_class_code"))?,
        base: draft.base.ok_or(PolicyError::Incomplete("check_class_code"))?,
        user_verify_key: draft.user_verify_key.ok_or(PolicyError::Incomplete("add_credentials"))?,
        raw_code: draft.raw_code,
        class_name: draft.class_name,
        status: UserPolicyStatus::Submitted,
        state_type: None,
        created_at: ctx.now,
    })
}
