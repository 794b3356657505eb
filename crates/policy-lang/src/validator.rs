//! Shape validation for policy modules
//!
//! A submittable module contains exactly one class whose single base is one
//! of the two capability markers. Members come from a closed set and some
//! are only meaningful for one base.
//!
//! # Checks
//!
//! - exactly one class, nothing else but comments
//! - base is `CustomInputPolicy` or `CustomOutputPolicy`
//! - members known, not duplicated, valid for the base, well-shaped
//! - resource limits (size, node count, depth, string length)
//! - free `@name` references (collected; enforcement is the caller's call)

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::ast::{ClassDef, Item, Literal, Module, Node, Span};
use crate::expr::LowerError;
use crate::parser::ParseError;

pub const INPUT_POLICY_BASE: &str = "CustomInputPolicy";
pub const OUTPUT_POLICY_BASE: &str = "CustomOutputPolicy";

// =============================================================================
// ERROR TYPES
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("policy source must contain only a class definition (found {classes} class(es) and {other} other form(s))")]
    NotSingleClass { classes: usize, other: usize },

    #[error("class '{class}' must have exactly one base, CustomInputPolicy or CustomOutputPolicy (found [{}])", .found.join(" "))]
    InvalidBase { class: String, found: Vec<String> },

    #[error("unknown member :{member} at offset {offset}")]
    UnknownMember { member: String, offset: usize },

    #[error("duplicate member :{member} at offset {offset}")]
    DuplicateMember { member: String, offset: usize },

    #[error("member :{member} is not allowed on {base} classes")]
    MemberNotAllowed { member: String, base: BaseKind },

    #[error("member :{member} is malformed: {reason}")]
    InvalidMember { member: String, reason: String },

    #[error("in member :{member}: {source}")]
    Expression {
        member: String,
        #[source]
        source: LowerError,
    },

    #[error("unresolved name(s): {}", .names.iter().map(|n| format!("@{}", n)).collect::<Vec<_>>().join(", "))]
    FreeVariables { names: Vec<String> },

    #[error("decoration #({0}) is not allowed")]
    DisallowedDecoration(String),

    #[error("source is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("class has {count} nodes, limit is {limit}")]
    TooManyNodes { count: usize, limit: usize },

    #[error("expression nesting depth {depth} exceeds limit {limit}")]
    TooDeep { depth: usize, limit: usize },

    #[error("string literal of {len} characters exceeds limit {limit}")]
    StringTooLong { len: usize, limit: usize },

    #[error("'{0}' is not a valid class name")]
    InvalidName(String),

    #[error("source is not in canonical form: {0}")]
    NotCanonical(String),
}

// =============================================================================
// BASES AND MEMBERS
// =============================================================================

/// Which governance contract a custom class implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseKind {
    Input,
    Output,
}

impl BaseKind {
    pub fn from_marker(name: &str) -> Option<Self> {
        match name {
            INPUT_POLICY_BASE => Some(BaseKind::Input),
            OUTPUT_POLICY_BASE => Some(BaseKind::Output),
            _ => None,
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            BaseKind::Input => INPUT_POLICY_BASE,
            BaseKind::Output => OUTPUT_POLICY_BASE,
        }
    }

    /// Names bound by the engine when a member of this base is evaluated
    pub fn context_bindings(self) -> &'static [&'static str] {
        match self {
            BaseKind::Input => &["key", "id", "user"],
            BaseKind::Output => &["count", "outputs", "user"],
        }
    }
}

impl fmt::Display for BaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Params,
    Defaults,
    State,
    Outputs,
    Public,
    Doc,
    Admit,
    OnAdmit,
    Accept,
}

impl MemberKind {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "params" => MemberKind::Params,
            "defaults" => MemberKind::Defaults,
            "state" => MemberKind::State,
            "outputs" => MemberKind::Outputs,
            "public" => MemberKind::Public,
            "doc" => MemberKind::Doc,
            "admit" => MemberKind::Admit,
            "on-admit" => MemberKind::OnAdmit,
            "accept" => MemberKind::Accept,
            _ => return None,
        })
    }

    pub fn allowed_on(self, base: BaseKind) -> bool {
        match self {
            MemberKind::Admit | MemberKind::OnAdmit => base == BaseKind::Output,
            MemberKind::Accept => base == BaseKind::Input,
            _ => true,
        }
    }
}

/// A `@name` with no binding in its class
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeVariable {
    pub name: String,
    pub member: String,
    pub offset: usize,
}

/// Resource limits applied before anything is lowered or evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_source_bytes: usize,
    pub max_nodes: usize,
    pub max_depth: usize,
    pub max_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_source_bytes: 64 * 1024,
            max_nodes: 4096,
            max_depth: 32,
            max_string_len: 4096,
        }
    }
}

/// Statistics gathered during validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationStats {
    pub source_bytes: usize,
    pub node_count: usize,
    pub max_depth: usize,
    pub longest_string: usize,
    pub symbol_ref_count: usize,
}

// =============================================================================
// VALIDATOR
// =============================================================================

/// The only class in the module, or `NotSingleClass`
pub fn single_class(module: &Module) -> Result<&ClassDef, ValidationError> {
    let mut classes = 0;
    let mut other = 0;
    for item in module.significant_items() {
        match item {
            Item::Class(_) => classes += 1,
            _ => other += 1,
        }
    }
    match (classes, other, module.classes().next()) {
        (1, 0, Some(class)) => Ok(class),
        _ => Err(ValidationError::NotSingleClass { classes, other }),
    }
}

pub fn class_base(class: &ClassDef) -> Result<BaseKind, ValidationError> {
    match class.bases.as_slice() {
        [single] => BaseKind::from_marker(single).ok_or_else(|| ValidationError::InvalidBase {
            class: class.name.clone(),
            found: class.bases.clone(),
        }),
        _ => Err(ValidationError::InvalidBase {
            class: class.name.clone(),
            found: class.bases.clone(),
        }),
    }
}

/// Full shape check: one class, recognized base, well-formed members
pub fn validate_module(module: &Module) -> Result<(&ClassDef, BaseKind), ValidationError> {
    let class = single_class(module)?;
    let base = class_base(class)?;
    check_members(class, base)?;
    Ok((class, base))
}

pub fn check_members(class: &ClassDef, base: BaseKind) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for member in &class.members {
        let kind = MemberKind::from_key(&member.key).ok_or_else(|| ValidationError::UnknownMember {
            member: member.key.clone(),
            offset: member.span.start,
        })?;
        if !seen.insert(member.key.as_str()) {
            return Err(ValidationError::DuplicateMember {
                member: member.key.clone(),
                offset: member.span.start,
            });
        }
        if !kind.allowed_on(base) {
            return Err(ValidationError::MemberNotAllowed {
                member: member.key.clone(),
                base,
            });
        }
        check_member_shape(kind, &member.key, &member.value)?;
    }

    let params = param_names(class);
    if let Some(defaults) = class.member("defaults").and_then(|m| m.value.as_map()) {
        if let Some((key, _)) = defaults.iter().find(|(k, _)| !params.contains(k.as_str())) {
            return Err(invalid("defaults", format!("'{}' is not a declared parameter", key)));
        }
    }

    let state = state_names(class);
    if let Some(updates) = class.member("on-admit").and_then(|m| m.value.as_map()) {
        if let Some((key, _)) = updates.iter().find(|(k, _)| !state.contains(k.as_str())) {
            return Err(invalid("on-admit", format!("'{}' is not a state field", key)));
        }
    }
    if let Some(shadowed) = state.iter().find(|s| params.contains(*s)) {
        return Err(invalid("state", format!("'{}' shadows a parameter", shadowed)));
    }
    let bound = base.context_bindings();
    if let Some(name) = params.iter().find(|p| bound.contains(*p)) {
        return Err(invalid("params", format!("'{}' is bound by the engine on {}", name, base)));
    }
    if let Some(name) = state.iter().find(|s| bound.contains(*s)) {
        return Err(invalid("state", format!("'{}' is bound by the engine on {}", name, base)));
    }
    Ok(())
}

fn check_member_shape(kind: MemberKind, key: &str, value: &Node) -> Result<(), ValidationError> {
    match kind {
        MemberKind::Params => {
            let items = value
                .as_list()
                .ok_or_else(|| invalid(key, "expected a list of names"))?;
            let mut seen = BTreeSet::new();
            for item in items {
                let name = item
                    .as_ident()
                    .ok_or_else(|| invalid(key, format!("expected a name, found {}", item.to_source())))?;
                if !seen.insert(name) {
                    return Err(invalid(key, format!("parameter '{}' declared twice", name)));
                }
            }
        }
        MemberKind::Outputs => {
            let items = value
                .as_list()
                .ok_or_else(|| invalid(key, "expected a list of strings"))?;
            if let Some(bad) = items.iter().find(|i| i.as_string().is_none()) {
                return Err(invalid(key, format!("expected a string, found {}", bad.to_source())));
            }
        }
        MemberKind::Defaults | MemberKind::State | MemberKind::Public | MemberKind::OnAdmit => {
            value.as_map().ok_or_else(|| invalid(key, "expected a map"))?;
        }
        MemberKind::Doc => {
            value.as_string().ok_or_else(|| invalid(key, "expected a string"))?;
        }
        MemberKind::Admit | MemberKind::Accept => {}
    }
    Ok(())
}

fn invalid(member: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidMember {
        member: member.to_string(),
        reason: reason.into(),
    }
}

pub fn param_names(class: &ClassDef) -> BTreeSet<&str> {
    class
        .member("params")
        .and_then(|m| m.value.as_list())
        .map(|items| items.iter().filter_map(Node::as_ident).collect())
        .unwrap_or_default()
}

pub fn state_names(class: &ClassDef) -> BTreeSet<&str> {
    class
        .member("state")
        .and_then(|m| m.value.as_map())
        .map(|entries| entries.iter().map(|(k, _)| k.as_str()).collect())
        .unwrap_or_default()
}

/// Every `@name` not bound by params, state, or the base's context bindings
pub fn free_variables(class: &ClassDef, base: BaseKind) -> Vec<FreeVariable> {
    let mut bound = param_names(class);
    bound.extend(state_names(class));
    bound.extend(base.context_bindings().iter().copied());

    let mut free = Vec::new();
    for member in &class.members {
        member.value.for_each_symbol(&mut |name, span: Span| {
            if !bound.contains(name) {
                free.push(FreeVariable {
                    name: name.to_string(),
                    member: member.key.clone(),
                    offset: span.start,
                });
            }
        });
    }
    free
}

/// Reject when any free variable was found
pub fn enforce_no_free_variables(free: &[FreeVariable]) -> Result<(), ValidationError> {
    if free.is_empty() {
        return Ok(());
    }
    let names: BTreeSet<&str> = free.iter().map(|f| f.name.as_str()).collect();
    Err(ValidationError::FreeVariables {
        names: names.into_iter().map(str::to_string).collect(),
    })
}

/// Size gate, run before the source reaches the parser
pub fn check_source_size(source: &str, limits: &Limits) -> Result<(), ValidationError> {
    if source.len() > limits.max_source_bytes {
        return Err(ValidationError::SourceTooLarge {
            size: source.len(),
            limit: limits.max_source_bytes,
        });
    }
    Ok(())
}

pub fn check_limits(source: &str, module: &Module, limits: &Limits) -> Result<ValidationStats, ValidationError> {
    check_source_size(source, limits)?;
    let mut stats = ValidationStats {
        source_bytes: source.len(),
        ..Default::default()
    };

    let mut roots: Vec<&Node> = Vec::new();
    for item in &module.items {
        match item {
            Item::Class(class) => {
                roots.extend(class.members.iter().map(|m| &m.value));
                roots.extend(class.decorations.iter().flat_map(|d| d.arguments.iter().map(|(_, v)| v)));
            }
            Item::Form(node) => roots.push(node),
            Item::Comment(_) => {}
        }
    }

    for node in roots {
        stats.node_count += node.node_count();
        stats.max_depth = stats.max_depth.max(node.depth());
        walk_strings(node, &mut |len| stats.longest_string = stats.longest_string.max(len));
        node.for_each_symbol(&mut |_, _| stats.symbol_ref_count += 1);
    }

    if stats.node_count > limits.max_nodes {
        return Err(ValidationError::TooManyNodes {
            count: stats.node_count,
            limit: limits.max_nodes,
        });
    }
    if stats.max_depth > limits.max_depth {
        return Err(ValidationError::TooDeep {
            depth: stats.max_depth,
            limit: limits.max_depth,
        });
    }
    if stats.longest_string > limits.max_string_len {
        return Err(ValidationError::StringTooLong {
            len: stats.longest_string,
            limit: limits.max_string_len,
        });
    }
    Ok(stats)
}

fn walk_strings(node: &Node, f: &mut impl FnMut(usize)) {
    match node {
        Node::Literal(Literal::String(s)) => f(s.chars().count()),
        Node::List { items, .. } | Node::Call { args: items, .. } => {
            items.iter().for_each(|n| walk_strings(n, f))
        }
        Node::Map { entries, .. } => entries.iter().for_each(|(_, n)| walk_strings(n, f)),
        Node::Literal(_) | Node::Ident(_) | Node::SymbolRef { .. } => {}
    }
}

/// `[A-Za-z_][A-Za-z0-9_-]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    fn validate(src: &str) -> Result<BaseKind, ValidationError> {
        let module = parse_module(src)?;
        validate_module(&module).map(|(_, base)| base)
    }

    #[test]
    fn test_valid_output_class() {
        let src = r#"
            (class Limited [CustomOutputPolicy]
              :params [limit]
              :state {:released 0}
              :admit (< @released @limit)
              :on-admit {:released (+ @released 1)})
        "#;
        assert_eq!(validate(src), Ok(BaseKind::Output));
    }

    #[test]
    fn test_two_classes_rejected() {
        let src = "(class A [CustomInputPolicy]) (class B [CustomInputPolicy])";
        assert_eq!(
            validate(src),
            Err(ValidationError::NotSingleClass { classes: 2, other: 0 })
        );
    }

    #[test]
    fn test_stray_form_rejected() {
        let src = "(import os) (class A [CustomInputPolicy])";
        let err = validate(src).unwrap_err();
        assert!(err.to_string().contains("must contain only a class definition"));
    }

    #[test]
    fn test_comments_are_not_forms() {
        let src = ";; header\n(class A [CustomInputPolicy])\n;; trailer";
        assert_eq!(validate(src), Ok(BaseKind::Input));
    }

    #[test]
    fn test_unknown_base_rejected() {
        let err = validate("(class A [Policy])").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidBase { .. }));

        let err = validate("(class A [CustomInputPolicy CustomOutputPolicy])").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidBase { .. }));

        let err = validate("(class A [])").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidBase { .. }));
    }

    #[test]
    fn test_member_rules() {
        let err = validate("(class A [CustomInputPolicy] :admit true)").unwrap_err();
        assert!(matches!(err, ValidationError::MemberNotAllowed { .. }));

        let err = validate("(class A [CustomOutputPolicy] :doc \"a\" :doc \"b\")").unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateMember { .. }));

        let err = validate("(class A [CustomOutputPolicy] :run (print 1))").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownMember { .. }));

        let err = validate("(class A [CustomOutputPolicy] :params [1])").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMember { .. }));

        let err = validate("(class A [CustomOutputPolicy] :params [a] :defaults {:b 1})").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMember { .. }));

        let err = validate("(class A [CustomOutputPolicy] :state {:n 0} :on-admit {:m 1})").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMember { .. }));
    }

    #[test]
    fn test_engine_bound_names_cannot_be_declared() {
        let err = validate("(class A [CustomOutputPolicy] :state {:count 0} :admit (< @count 3))").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMember { ref member, .. } if member == "state"));
        assert!(err.to_string().contains("'count' is bound by the engine"));

        let err = validate("(class A [CustomOutputPolicy] :params [user])").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMember { ref member, .. } if member == "params"));

        let err = validate("(class A [CustomInputPolicy] :params [key])").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidMember { ref member, .. } if member == "params"));

        // bindings are per base
        assert_eq!(validate("(class A [CustomInputPolicy] :params [count])"), Ok(BaseKind::Input));
        assert_eq!(validate("(class A [CustomOutputPolicy] :state {:key 0})"), Ok(BaseKind::Output));
    }

    #[test]
    fn test_free_variables_collected() {
        let src = "(class A [CustomOutputPolicy] :params [limit] :admit (< @count (+ @limit @extra)))";
        let module = parse_module(src).unwrap();
        let (class, base) = validate_module(&module).unwrap();
        let free = free_variables(class, base);
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].name, "extra");
        assert_eq!(free[0].member, "admit");
        assert!(matches!(
            enforce_no_free_variables(&free),
            Err(ValidationError::FreeVariables { .. })
        ));
    }

    #[test]
    fn test_context_bindings_depend_on_base() {
        let src = "(class A [CustomInputPolicy] :accept (= @count 0))";
        let module = parse_module(src).unwrap();
        let (class, base) = validate_module(&module).unwrap();
        assert_eq!(free_variables(class, base)[0].name, "count");
    }

    #[test]
    fn test_limits() {
        let src = r#"(class A [CustomOutputPolicy] :doc "0123456789")"#;
        let module = parse_module(src).unwrap();

        let stats = check_limits(src, &module, &Limits::default()).unwrap();
        assert_eq!(stats.longest_string, 10);

        let tight = Limits {
            max_string_len: 5,
            ..Limits::default()
        };
        assert!(matches!(
            check_limits(src, &module, &tight),
            Err(ValidationError::StringTooLong { len: 10, limit: 5 })
        ));

        let tiny = Limits {
            max_source_bytes: 10,
            ..Limits::default()
        };
        assert!(matches!(
            check_limits(src, &module, &tiny),
            Err(ValidationError::SourceTooLarge { .. })
        ));
    }

    #[test]
    fn test_depth_limit() {
        let src = "(class A [CustomOutputPolicy] :admit (not (not (not (not true)))))";
        let module = parse_module(src).unwrap();
        let shallow = Limits {
            max_depth: 3,
            ..Limits::default()
        };
        assert!(matches!(
            check_limits(src, &module, &shallow),
            Err(ValidationError::TooDeep { depth: 5, limit: 3 })
        ));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("Limited_ab12_ff00"));
        assert!(is_identifier("_x-y"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a b"));
    }
}
