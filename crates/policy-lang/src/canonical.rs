//! Canonical rewrite of a submitted policy class
//!
//! The canonical text is what gets persisted as `parsed_code` and what the
//! standard compiler accepts. Rendering is deterministic, so canonicalizing
//! canonical text with the same name is a no-op.

use tracing::warn;

use crate::ast::{ClassDef, Decoration, Literal, Node};
use crate::compiler::CompileOptions;
use crate::parser::parse_module;
use crate::validator::{
    check_limits, check_source_size, enforce_no_free_variables, free_variables, is_identifier, validate_module, BaseKind, FreeVariable,
    ValidationError,
};

/// Name of the marker that makes a class discoverable to the registry
pub const CANONICAL_MARKER: &str = "serializable";

pub fn canonical_marker() -> Decoration {
    Decoration {
        name: CANONICAL_MARKER.to_string(),
        arguments: vec![(
            "recursive-serde".to_string(),
            Node::Literal(Literal::Boolean(true)),
        )],
    }
}

/// True when the class carries exactly the canonical marker and nothing else
pub fn has_canonical_marker(class: &ClassDef) -> bool {
    matches!(class.decorations.as_slice(), [only] if *only == canonical_marker())
}

/// Result of canonicalizing one submission
#[derive(Debug, Clone, PartialEq)]
pub struct Canonical {
    /// Rendered class under its unique name
    pub parsed_code: String,
    /// Class name as submitted
    pub original_name: String,
    pub base: BaseKind,
    pub free_variables: Vec<FreeVariable>,
}

/// Validate `source` and rewrite its single class under `unique_name`.
///
/// Resource limits apply as in the restricted compile. With
/// `reject_free_variables` off, unresolved `@name`s are only logged.
pub fn canonicalize(
    source: &str,
    unique_name: &str,
    options: &CompileOptions,
) -> Result<Canonical, ValidationError> {
    if !is_identifier(unique_name) {
        return Err(ValidationError::InvalidName(unique_name.to_string()));
    }

    check_source_size(source, &options.limits)?;
    let module = parse_module(source)?;
    check_limits(source, &module, &options.limits)?;
    let (class, base) = validate_module(&module)?;

    let free = free_variables(class, base);
    if options.reject_free_variables {
        enforce_no_free_variables(&free)?;
    } else if !free.is_empty() {
        let names: Vec<&str> = free.iter().map(|f| f.name.as_str()).collect();
        warn!(class = %class.name, ?names, "policy references unresolved names; not enforced");
    }

    Ok(Canonical {
        parsed_code: rewrite(class, unique_name).to_source(),
        original_name: class.name.clone(),
        base,
        free_variables: free,
    })
}

/// Rename, drop every decoration, attach the canonical marker
pub fn rewrite(class: &ClassDef, unique_name: &str) -> ClassDef {
    ClassDef {
        name: unique_name.to_string(),
        decorations: vec![canonical_marker()],
        ..class.clone()
    }
}
