//! Policy source language
//!
//! Governed computations are described as a single S-expression class:
//!
//! ```text
//! (class RateLimited [CustomOutputPolicy]
//!   :params [limit]
//!   :state {:released 0}
//!   :admit (< @released @limit)
//!   :on-admit {:released (+ @released 1)})
//! ```
//!
//! This crate parses that text, checks its shape, rewrites it into canonical
//! form and lowers it into expressions over a closed operator set evaluated
//! with a step budget. It performs no I/O.

pub mod ast;
pub mod canonical;
pub mod compiler;
pub mod expr;
pub mod parser;
pub mod validator;
pub mod value;

pub use ast::{ClassDef, Decoration, Item, Literal, Member, Module, Node, Span};
pub use canonical::{canonical_marker, canonicalize, Canonical, CANONICAL_MARKER};
pub use compiler::{compile_restricted, compile_standard, CompileMode, CompileOptions, CompiledUnit, PolicyClass};
pub use expr::{EvalError, Evaluator, Expr, LowerError, Op, OutputCapture, Scope};
pub use parser::{parse_expression, parse_module, ParseError};
pub use validator::{BaseKind, FreeVariable, Limits, ValidationError, INPUT_POLICY_BASE, OUTPUT_POLICY_BASE};
pub use value::Value;
