//! The expression language shared by `expression` conditions, `script`
//! conditions, and expression transforms: a winnow-parsed AST evaluated with
//! nil-propagating semantics over one reading.

mod ast;
mod eval;
mod funcs;
mod parser;
mod script;

pub use ast::{BinOp, Expr, Scalar};
pub use eval::{EvalCtx, eval_expr};
pub use parser::parse_expression;
pub use script::{DEFAULT_MAX_OPS, DEFAULT_WALL_TIME, Script};

pub(crate) use eval::{compare_scalars, scalars_equal};

/// Invoke one library function on pre-evaluated arguments (transforms reuse
/// the condition function library this way).
pub fn call_function(name: &str, args: &[Option<Scalar>]) -> Option<Scalar> {
    funcs::call(name, args)
}
