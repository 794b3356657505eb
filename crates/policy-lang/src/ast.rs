//! AST for policy source
//!
//! A policy module is a flat list of items. Only one shape is accepted by
//! the validator (a single decorated class), but the parser is deliberately
//! wider so that rejections carry a precise reason instead of a syntax error.
//!
//! ```text
//! ;; comments are dropped by the canonicalizer
//! #(serializable :recursive-serde true)
//! (class RateLimited [CustomOutputPolicy]
//!   :params [limit]
//!   :state {:released 0}
//!   :admit (< @released @limit)
//!   :on-admit {:released (+ @released 1)})
//! ```

use serde::{Deserialize, Serialize};

// =============================================================================
// CORE AST TYPES
// =============================================================================

/// A parsed policy module
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Module {
    pub items: Vec<Item>,
}

impl Module {
    /// Class definitions at the top level, in source order
    pub fn classes(&self) -> impl Iterator<Item = &ClassDef> {
        self.items.iter().filter_map(|item| match item {
            Item::Class(class) => Some(class),
            _ => None,
        })
    }

    /// Top-level items that are not comments
    pub fn significant_items(&self) -> impl Iterator<Item = &Item> {
        self.items
            .iter()
            .filter(|item| !matches!(item, Item::Comment(_)))
    }
}

/// A top-level item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    Class(ClassDef),
    /// Any other top-level form, e.g. `(import os)`
    Form(Node),
    Comment(String),
}

/// `#(name :key value ...)` attached to the class that follows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decoration {
    pub name: String,
    pub arguments: Vec<(String, Node)>,
}

impl Decoration {
    pub fn to_source(&self) -> String {
        let mut out = format!("#({}", self.name);
        for (key, value) in &self.arguments {
            out.push_str(&format!(" :{} {}", key, value.to_source()));
        }
        out.push(')');
        out
    }
}

/// A `:key value` entry in a class body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub key: String,
    pub value: Node,
    pub span: Span,
}

/// `(class Name [Base] :member value ...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<String>,
    pub decorations: Vec<Decoration>,
    pub members: Vec<Member>,
    pub span: Span,
}

impl ClassDef {
    pub fn member(&self, key: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.key == key)
    }

    /// Render the class (with its decorations) back to source.
    ///
    /// Members go one per line with two-space indentation so canonical text
    /// is stable and diffable.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for decoration in &self.decorations {
            out.push_str(&decoration.to_source());
            out.push('\n');
        }
        out.push_str(&format!("(class {} [{}]", self.name, self.bases.join(" ")));
        for member in &self.members {
            out.push_str(&format!("\n  :{} {}", member.key, member.value.to_source()));
        }
        out.push(')');
        out
    }
}

// =============================================================================
// VALUES / EXPRESSIONS
// =============================================================================

/// Terminal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Nil,
    Boolean(bool),
    Integer(i64),
    String(String),
}

/// A value or expression node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Literal(Literal),
    /// Bare identifier. Only meaningful in binding positions (`:params`).
    Ident(String),
    /// `@name` reference to a parameter, state field or context binding
    SymbolRef { name: String, span: Span },
    List { items: Vec<Node>, span: Span },
    Map { entries: Vec<(String, Node)>, span: Span },
    /// `(op arg ...)`
    Call { op: String, args: Vec<Node>, span: Span },
}

impl Node {
    pub fn is_symbol_ref(&self) -> bool {
        matches!(self, Node::SymbolRef { .. })
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Node::Literal(Literal::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Node::Literal(Literal::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Node::Ident(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List { items, .. } => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(String, Node)]> {
        match self {
            Node::Map { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Number of nodes in this subtree, including itself
    pub fn node_count(&self) -> usize {
        1 + match self {
            Node::List { items, .. } => items.iter().map(Node::node_count).sum(),
            Node::Map { entries, .. } => entries.iter().map(|(_, v)| v.node_count()).sum(),
            Node::Call { args, .. } => args.iter().map(Node::node_count).sum(),
            _ => 0,
        }
    }

    /// Nesting depth of this subtree (a leaf has depth 1)
    pub fn depth(&self) -> usize {
        1 + match self {
            Node::List { items, .. } => items.iter().map(Node::depth).max().unwrap_or(0),
            Node::Map { entries, .. } => entries.iter().map(|(_, v)| v.depth()).max().unwrap_or(0),
            Node::Call { args, .. } => args.iter().map(Node::depth).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Visit every `@name` reference in this subtree
    pub fn for_each_symbol<'a>(&'a self, f: &mut impl FnMut(&'a str, Span)) {
        match self {
            Node::SymbolRef { name, span } => f(name, *span),
            Node::List { items, .. } => items.iter().for_each(|n| n.for_each_symbol(f)),
            Node::Map { entries, .. } => entries.iter().for_each(|(_, n)| n.for_each_symbol(f)),
            Node::Call { args, .. } => args.iter().for_each(|n| n.for_each_symbol(f)),
            Node::Literal(_) | Node::Ident(_) => {}
        }
    }

    /// Render back to source
    pub fn to_source(&self) -> String {
        match self {
            Node::Literal(Literal::Nil) => "nil".to_string(),
            Node::Literal(Literal::Boolean(b)) => b.to_string(),
            Node::Literal(Literal::Integer(i)) => i.to_string(),
            Node::Literal(Literal::String(s)) => quote(s),
            Node::Ident(name) => name.clone(),
            Node::SymbolRef { name, .. } => format!("@{}", name),
            Node::List { items, .. } => {
                let inner: Vec<String> = items.iter().map(Node::to_source).collect();
                format!("[{}]", inner.join(" "))
            }
            Node::Map { entries, .. } => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!(":{} {}", k, v.to_source()))
                    .collect();
                format!("{{{}}}", inner.join(" "))
            }
            Node::Call { op, args, .. } => {
                if args.is_empty() {
                    format!("({})", op)
                } else {
                    let inner: Vec<String> = args.iter().map(Node::to_source).collect();
                    format!("({} {})", op, inner.join(" "))
                }
            }
        }
    }
}

/// Escape and quote a string literal
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Byte offsets into the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}
