// ---------------------------------------------------------------------------
// Expression AST and runtime scalar
// ---------------------------------------------------------------------------

/// Runtime value produced by the evaluator. Composite reading payloads
/// surface as arrays so the array functions apply uniformly.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Str(String),
    Bool(bool),
    Array(Vec<Scalar>),
}

impl Scalar {
    pub fn numbers(ns: &[f64]) -> Self {
        Scalar::Array(ns.iter().copied().map(Scalar::Number).collect())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric elements of an array scalar.
    pub fn as_numeric_array(&self) -> Option<Vec<f64>> {
        match self {
            Scalar::Array(items) => items.iter().map(Scalar::as_number).collect(),
            _ => None,
        }
    }

    /// Display form used by templates and string concatenation.
    pub fn display_string(&self) -> String {
        match self {
            Scalar::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Scalar::Str(s) => s.clone(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Array(items) => {
                let parts: Vec<String> = items.iter().map(Scalar::display_string).collect();
                format!("[{}]", parts.join(","))
            }
        }
    }
}

/// Parsed expression tree. Field refs hold the full dotted path
/// (`value.x`, `tags.site`).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    StringLit(String),
    Bool(bool),
    Field(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    FuncCall {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Expr {
    /// Collect every field path referenced by this expression, for data-type
    /// inference over rules.
    pub fn field_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Field(path) => out.push(path),
            Expr::Neg(inner) | Expr::Not(inner) => inner.field_paths(out),
            Expr::BinOp { left, right, .. } => {
                left.field_paths(out);
                right.field_paths(out);
            }
            Expr::InList { expr, list, .. } => {
                expr.field_paths(out);
                for item in list {
                    item.field_paths(out);
                }
            }
            Expr::FuncCall { args, .. } => {
                for arg in args {
                    arg.field_paths(out);
                }
            }
            Expr::Number(_) | Expr::StringLit(_) | Expr::Bool(_) => {}
        }
    }
}
