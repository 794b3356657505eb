//! Compile surfaces
//!
//! - `compile_restricted`: gate for raw, untrusted submissions. Applies
//!   resource limits and the decoration allow-list before anything else.
//! - `compile_standard`: compiles canonical text (as produced by
//!   [`crate::canonical::canonicalize`]) into a runnable [`PolicyClass`].
//!
//! Both lower every expression member, so an unknown operator can never
//! reach the interpreter.

use tracing::debug;

use crate::ast::{ClassDef, Module, Node};
use crate::canonical::{has_canonical_marker, CANONICAL_MARKER};
use crate::expr::Expr;
use crate::parser::parse_module;
use crate::validator::{
    check_limits, check_source_size, enforce_no_free_variables, free_variables, single_class, validate_module, BaseKind,
    FreeVariable, Limits, ValidationError, ValidationStats,
};

/// Decorations a raw submission may carry; everything else is refused
pub const ALLOWED_DECORATIONS: &[&str] = &[CANONICAL_MARKER];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub limits: Limits,
    pub reject_free_variables: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            reject_free_variables: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Restricted,
    Standard,
}

/// A class lowered into evaluable members
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyClass {
    pub name: String,
    pub base: BaseKind,
    pub params: Vec<String>,
    pub defaults: Vec<(String, Expr)>,
    pub state: Vec<(String, Expr)>,
    pub outputs: Vec<String>,
    pub public: Vec<(String, Expr)>,
    pub doc: Option<String>,
    pub admit: Option<Expr>,
    pub on_admit: Vec<(String, Expr)>,
    pub accept: Option<Expr>,
    /// Rendered class text
    pub source: String,
}

impl PolicyClass {
    pub fn default_for(&self, param: &str) -> Option<&Expr> {
        self.defaults.iter().find(|(k, _)| k == param).map(|(_, e)| e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    pub mode: CompileMode,
    pub class: PolicyClass,
    pub stats: ValidationStats,
    pub free_variables: Vec<FreeVariable>,
}

pub fn compile_restricted(source: &str, options: &CompileOptions) -> Result<CompiledUnit, ValidationError> {
    check_source_size(source, &options.limits)?;
    let module = parse_module(source)?;
    let stats = check_limits(source, &module, &options.limits)?;

    let class = single_class(&module)?;
    if let Some(bad) = class
        .decorations
        .iter()
        .find(|d| !ALLOWED_DECORATIONS.contains(&d.name.as_str()))
    {
        return Err(ValidationError::DisallowedDecoration(bad.name.clone()));
    }

    finish(CompileMode::Restricted, &module, stats, options)
}

pub fn compile_standard(source: &str, options: &CompileOptions) -> Result<CompiledUnit, ValidationError> {
    check_source_size(source, &options.limits)?;
    let module = parse_module(source)?;
    let class = single_class(&module)?;
    if !has_canonical_marker(class) {
        return Err(ValidationError::NotCanonical(format!(
            "class '{}' must carry exactly one #({}) marker",
            class.name, CANONICAL_MARKER
        )));
    }
    let stats = check_limits(source, &module, &options.limits)?;

    finish(CompileMode::Standard, &module, stats, options)
}

fn finish(
    mode: CompileMode,
    module: &Module,
    stats: ValidationStats,
    options: &CompileOptions,
) -> Result<CompiledUnit, ValidationError> {
    let (class, base) = validate_module(module)?;
    let free = free_variables(class, base);
    if options.reject_free_variables {
        enforce_no_free_variables(&free)?;
    }
    let lowered = lower_class(class, base)?;
    debug!(class = %lowered.name, ?mode, nodes = stats.node_count, "compiled policy class");
    Ok(CompiledUnit {
        mode,
        class: lowered,
        stats,
        free_variables: free,
    })
}

/// Lower a shape-checked class
pub fn lower_class(class: &ClassDef, base: BaseKind) -> Result<PolicyClass, ValidationError> {
    let mut lowered = PolicyClass {
        name: class.name.clone(),
        base,
        params: Vec::new(),
        defaults: Vec::new(),
        state: Vec::new(),
        outputs: Vec::new(),
        public: Vec::new(),
        doc: None,
        admit: None,
        on_admit: Vec::new(),
        accept: None,
        source: class.to_source(),
    };

    for member in &class.members {
        let key = member.key.as_str();
        match key {
            "params" => {
                lowered.params = member
                    .value
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Node::as_ident)
                    .map(str::to_string)
                    .collect();
            }
            "outputs" => {
                lowered.outputs = member
                    .value
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(Node::as_string)
                    .map(str::to_string)
                    .collect();
            }
            "doc" => lowered.doc = member.value.as_string().map(str::to_string),
            "defaults" => lowered.defaults = lower_map(key, &member.value)?,
            "state" => lowered.state = lower_map(key, &member.value)?,
            "public" => lowered.public = lower_map(key, &member.value)?,
            "on-admit" => lowered.on_admit = lower_map(key, &member.value)?,
            "admit" => lowered.admit = Some(lower(key, &member.value)?),
            "accept" => lowered.accept = Some(lower(key, &member.value)?),
            // validate_module already rejected anything else
            _ => {}
        }
    }
    Ok(lowered)
}

fn lower(member: &str, node: &Node) -> Result<Expr, ValidationError> {
    Expr::lower(node).map_err(|source| ValidationError::Expression {
        member: member.to_string(),
        source,
    })
}

fn lower_map(member: &str, node: &Node) -> Result<Vec<(String, Expr)>, ValidationError> {
    node.as_map()
        .unwrap_or_default()
        .iter()
        .map(|(k, v)| lower(member, v).map(|e| (k.clone(), e)))
        .collect()
}
