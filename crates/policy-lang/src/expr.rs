//! Closed-set expressions and the fuel-bounded evaluator.
//!
//! Policy members are lowered from [`Node`] into [`Expr`] once, at compile
//! time. Lowering is where the operator set is closed: anything that is not
//! an [`Op`] is rejected before a policy can ever run.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::ast::Node;
use crate::value::Value;

/// Operators understood by the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    If,
    Len,
    Contains,
    Get,
    Str,
    Print,
}

impl Op {
    pub const ALL: [Op; 20] = [
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Rem,
        Op::Eq,
        Op::Ne,
        Op::Lt,
        Op::Le,
        Op::Gt,
        Op::Ge,
        Op::And,
        Op::Or,
        Op::Not,
        Op::If,
        Op::Len,
        Op::Contains,
        Op::Get,
        Op::Str,
        Op::Print,
    ];

    pub fn from_symbol(symbol: &str) -> Option<Op> {
        Op::ALL.iter().copied().find(|op| op.symbol() == symbol)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Rem => "%",
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::And => "and",
            Op::Or => "or",
            Op::Not => "not",
            Op::If => "if",
            Op::Len => "len",
            Op::Contains => "contains",
            Op::Get => "get",
            Op::Str => "str",
            Op::Print => "print",
        }
    }

    /// (min, max) argument count; `None` means unbounded
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Op::Add | Op::Mul | Op::And | Op::Or => (2, None),
            Op::Sub | Op::Div | Op::Rem => (2, Some(2)),
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => (2, Some(2)),
            Op::Not | Op::Len | Op::Str => (1, Some(1)),
            Op::If => (3, Some(3)),
            Op::Contains => (2, Some(2)),
            Op::Get => (2, Some(3)),
            Op::Print => (0, None),
        }
    }

    fn accepts(self, count: usize) -> bool {
        let (min, max) = self.arity();
        count >= min && max.map_or(true, |max| count <= max)
    }

    fn arity_text(self) -> String {
        match self.arity() {
            (min, None) => format!("at least {}", min),
            (min, Some(max)) if min == max => format!("exactly {}", min),
            (min, Some(max)) => format!("{} to {}", min, max),
        }
    }
}

/// A lowered expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Var(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Call { op: Op, args: Vec<Expr> },
}

/// Reasons a node cannot be lowered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LowerError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' takes {expected} argument(s), got {found}")]
    Arity {
        op: &'static str,
        expected: String,
        found: usize,
    },

    #[error("bare name '{0}' is not an expression (use @{0} to reference a binding)")]
    BareName(String),
}

impl Expr {
    pub fn lower(node: &Node) -> Result<Expr, LowerError> {
        match node {
            Node::Literal(lit) => Ok(Expr::Const(Value::from(lit))),
            Node::Ident(name) => Err(LowerError::BareName(name.clone())),
            Node::SymbolRef { name, .. } => Ok(Expr::Var(name.clone())),
            Node::List { items, .. } => items
                .iter()
                .map(Expr::lower)
                .collect::<Result<Vec<_>, _>>()
                .map(Expr::List),
            Node::Map { entries, .. } => entries
                .iter()
                .map(|(k, v)| Expr::lower(v).map(|e| (k.clone(), e)))
                .collect::<Result<Vec<_>, _>>()
                .map(Expr::Map),
            Node::Call { op, args, .. } => {
                let op = Op::from_symbol(op).ok_or_else(|| LowerError::UnknownOperator(op.clone()))?;
                if !op.accepts(args.len()) {
                    return Err(LowerError::Arity {
                        op: op.symbol(),
                        expected: op.arity_text(),
                        found: args.len(),
                    });
                }
                let args = args.iter().map(Expr::lower).collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::Call { op, args })
            }
        }
    }

    /// True when the expression is a literal with no computation
    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Const(_))
    }
}

// =============================================================================
// EVALUATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("evaluation budget of {budget} steps exhausted")]
    BudgetExhausted { budget: u64 },

    #[error("unbound name '@{0}'")]
    UnboundName(String),

    #[error("'{op}' expected {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("division by zero in '{op}'")]
    DivisionByZero { op: &'static str },

    #[error("integer overflow in '{op}'")]
    Overflow { op: &'static str },
}

/// Name bindings visible to an expression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    pub fn extend<I>(&mut self, bindings: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.vars.extend(bindings);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// Sink for `print` output.
///
/// Output is never written to the process stdout; whoever owns the capture
/// decides what to do with the lines once evaluation is over.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    lines: Vec<String>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }
}

/// Tree-walking evaluator. Every node visited costs one unit of fuel.
pub struct Evaluator<'c> {
    budget: u64,
    fuel: u64,
    capture: &'c mut OutputCapture,
}

impl<'c> Evaluator<'c> {
    pub fn new(budget: u64, capture: &'c mut OutputCapture) -> Self {
        Self {
            budget,
            fuel: budget,
            capture,
        }
    }

    pub fn steps_used(&self) -> u64 {
        self.budget - self.fuel
    }

    pub fn eval(&mut self, expr: &Expr, scope: &Scope) -> Result<Value, EvalError> {
        if self.fuel == 0 {
            return Err(EvalError::BudgetExhausted {
                budget: self.budget,
            });
        }
        self.fuel -= 1;

        match expr {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Var(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UnboundName(name.clone())),
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, e) in entries {
                    out.insert(k.clone(), self.eval(e, scope)?);
                }
                Ok(Value::Map(out))
            }
            Expr::Call { op, args } => self.call(*op, args, scope),
        }
    }

    /// Evaluate and require a boolean result
    pub fn eval_bool(&mut self, expr: &Expr, scope: &Scope, op: &'static str) -> Result<bool, EvalError> {
        let value = self.eval(expr, scope)?;
        value.as_bool().ok_or(EvalError::TypeMismatch {
            op,
            expected: "bool",
            found: value.type_name(),
        })
    }

    fn call(&mut self, op: Op, args: &[Expr], scope: &Scope) -> Result<Value, EvalError> {
        let sym = op.symbol();
        match op {
            Op::And => {
                for arg in args {
                    if !self.eval_bool(arg, scope, sym)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Op::Or => {
                for arg in args {
                    if self.eval_bool(arg, scope, sym)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Op::If => {
                if self.eval_bool(&args[0], scope, sym)? {
                    self.eval(&args[1], scope)
                } else {
                    self.eval(&args[2], scope)
                }
            }
            _ => {
                let values = args
                    .iter()
                    .map(|e| self.eval(e, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                self.apply(op, values)
            }
        }
    }

    fn apply(&mut self, op: Op, mut values: Vec<Value>) -> Result<Value, EvalError> {
        let sym = op.symbol();
        match op {
            Op::Add => {
                let first = values.remove(0);
                values.into_iter().try_fold(first, |acc, v| add(acc, v))
            }
            Op::Mul => {
                let mut acc = 1i64;
                for v in &values {
                    acc = acc.checked_mul(int(sym, v)?).ok_or(EvalError::Overflow { op: sym })?;
                }
                Ok(Value::Int(acc))
            }
            Op::Sub | Op::Div | Op::Rem => {
                let a = int(sym, &values[0])?;
                let b = int(sym, &values[1])?;
                let result = match op {
                    Op::Sub => a.checked_sub(b),
                    _ if b == 0 => return Err(EvalError::DivisionByZero { op: sym }),
                    Op::Div => a.checked_div(b),
                    _ => a.checked_rem(b),
                };
                result.map(Value::Int).ok_or(EvalError::Overflow { op: sym })
            }
            Op::Eq => Ok(Value::Bool(values[0] == values[1])),
            Op::Ne => Ok(Value::Bool(values[0] != values[1])),
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let ordering = match (&values[0], &values[1]) {
                    (Value::Int(a), Value::Int(b)) => a.cmp(b),
                    (Value::Str(a), Value::Str(b)) => a.cmp(b),
                    (Value::Int(_), other) | (Value::Str(_), other) | (other, _) => {
                        return Err(EvalError::TypeMismatch {
                            op: sym,
                            expected: "two ints or two strings",
                            found: other.type_name(),
                        })
                    }
                };
                Ok(Value::Bool(match op {
                    Op::Lt => ordering.is_lt(),
                    Op::Le => ordering.is_le(),
                    Op::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
            Op::Not => match values[0] {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                ref other => Err(EvalError::TypeMismatch {
                    op: sym,
                    expected: "bool",
                    found: other.type_name(),
                }),
            },
            Op::Len => {
                let len = match &values[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Map(entries) => entries.len(),
                    other => {
                        return Err(EvalError::TypeMismatch {
                            op: sym,
                            expected: "string, list or map",
                            found: other.type_name(),
                        })
                    }
                };
                i64::try_from(len).map(Value::Int).map_err(|_| EvalError::Overflow { op: sym })
            }
            Op::Contains => match (&values[0], &values[1]) {
                (Value::List(items), needle) => Ok(Value::Bool(items.contains(needle))),
                (Value::Map(entries), Value::Str(key)) => Ok(Value::Bool(entries.contains_key(key))),
                (Value::Str(hay), Value::Str(needle)) => Ok(Value::Bool(hay.contains(needle.as_str()))),
                (other, _) => Err(EvalError::TypeMismatch {
                    op: sym,
                    expected: "list, map with string key, or string",
                    found: other.type_name(),
                }),
            },
            Op::Get => {
                let default = if values.len() == 3 { values.pop() } else { None };
                let found = match (&values[0], &values[1]) {
                    (Value::List(items), Value::Int(i)) => {
                        usize::try_from(*i).ok().and_then(|i| items.get(i)).cloned()
                    }
                    (Value::Map(entries), Value::Str(key)) => entries.get(key).cloned(),
                    (other, _) => {
                        return Err(EvalError::TypeMismatch {
                            op: sym,
                            expected: "list with int index or map with string key",
                            found: other.type_name(),
                        })
                    }
                };
                Ok(found.or(default).unwrap_or(Value::Nil))
            }
            Op::Str => Ok(Value::Str(match &values[0] {
                Value::Str(s) => s.clone(),
                other => other.to_string(),
            })),
            Op::Print => {
                let line: Vec<String> = values
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect();
                self.capture.write(line.join(" "));
                Ok(Value::Nil)
            }
            Op::And | Op::Or | Op::If => unreachable!("short-circuit ops are handled in call()"),
        }
    }
}

fn int(op: &'static str, value: &Value) -> Result<i64, EvalError> {
    value.as_int().ok_or(EvalError::TypeMismatch {
        op,
        expected: "int",
        found: value.type_name(),
    })
}

fn add(acc: Value, v: Value) -> Result<Value, EvalError> {
    match (acc, v) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or(EvalError::Overflow { op: "+" }),
        (Value::Str(mut a), Value::Str(b)) => {
            a.push_str(&b);
            Ok(Value::Str(a))
        }
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (a, b) => Err(EvalError::TypeMismatch {
            op: "+",
            expected: "matching ints, strings or lists",
            found: if matches!(a, Value::Int(_) | Value::Str(_) | Value::List(_)) {
                b.type_name()
            } else {
                a.type_name()
            },
        }),
    }
}
