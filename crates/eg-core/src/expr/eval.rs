use std::collections::HashMap;
use std::time::Instant;

use super::ast::{BinOp, Expr, Scalar};
use super::funcs;
use crate::reading::Reading;

// ---------------------------------------------------------------------------
// EvalCtx — reading scope, local bindings, optional instruction budget
// ---------------------------------------------------------------------------

/// Evaluation scope for one expression run. Plain condition expressions run
/// unmetered; scripts run with an instruction budget and a wall-time cap.
pub struct EvalCtx<'a> {
    pub reading: &'a Reading,
    pub locals: HashMap<String, Scalar>,
    ops_left: u64,
    deadline: Option<Instant>,
    exhausted: bool,
}

impl<'a> EvalCtx<'a> {
    pub fn new(reading: &'a Reading) -> Self {
        Self {
            reading,
            locals: HashMap::new(),
            ops_left: u64::MAX,
            deadline: None,
            exhausted: false,
        }
    }

    pub fn with_budget(reading: &'a Reading, max_ops: u64, deadline: Instant) -> Self {
        Self {
            reading,
            locals: HashMap::new(),
            ops_left: max_ops,
            deadline: Some(deadline),
            exhausted: false,
        }
    }

    /// True once the instruction budget or wall-time cap is spent.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Charge one AST node. The deadline is only polled every 64 ops to keep
    /// the hot path cheap.
    fn tick(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if self.ops_left == 0 {
            self.exhausted = true;
            return false;
        }
        self.ops_left -= 1;
        if self.ops_left % 64 == 0
            && let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            self.exhausted = true;
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluate an expression against the scope, returning `None` for nil.
///
/// Nil propagates: a missing field, a type mismatch, or an undefined
/// operation yields `None` rather than an error, and comparisons against nil
/// are false. The caller distinguishes budget exhaustion via
/// [`EvalCtx::exhausted`].
pub fn eval_expr(expr: &Expr, ctx: &mut EvalCtx<'_>) -> Option<Scalar> {
    if !ctx.tick() {
        return None;
    }
    match expr {
        Expr::Number(n) => Some(Scalar::Number(*n)),
        Expr::StringLit(s) => Some(Scalar::Str(s.clone())),
        Expr::Bool(b) => Some(Scalar::Bool(*b)),
        Expr::Field(path) => {
            if let Some(local) = ctx.locals.get(path) {
                return Some(local.clone());
            }
            ctx.reading.field(path)
        }
        Expr::Neg(inner) => match eval_expr(inner, ctx)? {
            Scalar::Number(n) => Some(Scalar::Number(-n)),
            _ => None,
        },
        Expr::Not(inner) => match eval_expr(inner, ctx)? {
            Scalar::Bool(b) => Some(Scalar::Bool(!b)),
            _ => None,
        },
        Expr::BinOp { op, left, right } => eval_binop(*op, left, right, ctx),
        Expr::InList {
            expr: target,
            list,
            negated,
        } => {
            let target_val = eval_expr(target, ctx)?;
            let found = list.iter().any(|item| {
                eval_expr(item, ctx)
                    .map(|v| scalars_equal(&target_val, &v))
                    .unwrap_or(false)
            });
            Some(Scalar::Bool(if *negated { !found } else { found }))
        }
        Expr::FuncCall { name, args } => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval_expr(arg, ctx));
                if ctx.exhausted {
                    return None;
                }
            }
            funcs::call(name, &evaluated)
        }
    }
}

fn eval_binop(op: BinOp, left: &Expr, right: &Expr, ctx: &mut EvalCtx<'_>) -> Option<Scalar> {
    match op {
        BinOp::And => {
            let lv = eval_expr(left, ctx);
            let rv = eval_expr(right, ctx);
            three_valued_and(lv, rv)
        }
        BinOp::Or => {
            let lv = eval_expr(left, ctx);
            let rv = eval_expr(right, ctx);
            three_valued_or(lv, rv)
        }
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let lv = eval_expr(left, ctx)?;
            let rv = eval_expr(right, ctx)?;
            Some(Scalar::Bool(compare_scalars(op, &lv, &rv)))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            let ln = eval_expr(left, ctx)?.as_number()?;
            let rn = eval_expr(right, ctx)?.as_number()?;
            eval_arithmetic(op, ln, rn)
        }
    }
}

/// Three-valued (SQL NULL) logical AND: a definite `false` wins even when
/// the other side is nil.
fn three_valued_and(lv: Option<Scalar>, rv: Option<Scalar>) -> Option<Scalar> {
    match (lv.as_ref(), rv.as_ref()) {
        (Some(Scalar::Bool(false)), _) | (_, Some(Scalar::Bool(false))) => {
            Some(Scalar::Bool(false))
        }
        (Some(Scalar::Bool(true)), Some(Scalar::Bool(true))) => Some(Scalar::Bool(true)),
        _ => None,
    }
}

/// Three-valued (SQL NULL) logical OR.
fn three_valued_or(lv: Option<Scalar>, rv: Option<Scalar>) -> Option<Scalar> {
    match (lv.as_ref(), rv.as_ref()) {
        (Some(Scalar::Bool(true)), _) | (_, Some(Scalar::Bool(true))) => Some(Scalar::Bool(true)),
        (Some(Scalar::Bool(false)), Some(Scalar::Bool(false))) => Some(Scalar::Bool(false)),
        _ => None,
    }
}

fn eval_arithmetic(op: BinOp, lv: f64, rv: f64) -> Option<Scalar> {
    let result = match op {
        BinOp::Add => lv + rv,
        BinOp::Sub => lv - rv,
        BinOp::Mul => lv * rv,
        BinOp::Div => {
            if rv == 0.0 {
                return None;
            }
            lv / rv
        }
        BinOp::Mod => {
            if rv == 0.0 {
                return None;
            }
            lv % rv
        }
        _ => return None,
    };
    Some(Scalar::Number(result))
}

pub(crate) fn scalars_equal(a: &Scalar, b: &Scalar) -> bool {
    match (a, b) {
        (Scalar::Number(x), Scalar::Number(y)) => (x - y).abs() < f64::EPSILON,
        (Scalar::Str(x), Scalar::Str(y)) => x == y,
        (Scalar::Bool(x), Scalar::Bool(y)) => x == y,
        _ => false,
    }
}

pub(crate) fn compare_scalars(op: BinOp, lv: &Scalar, rv: &Scalar) -> bool {
    match (lv, rv) {
        (Scalar::Number(a), Scalar::Number(b)) => match op {
            BinOp::Eq => (a - b).abs() < f64::EPSILON,
            BinOp::Ne => (a - b).abs() >= f64::EPSILON,
            BinOp::Lt => a < b,
            BinOp::Gt => a > b,
            BinOp::Le => a <= b,
            BinOp::Ge => a >= b,
            _ => false,
        },
        (Scalar::Str(a), Scalar::Str(b)) => {
            let ord = a.cmp(b);
            match op {
                BinOp::Eq => ord.is_eq(),
                BinOp::Ne => !ord.is_eq(),
                BinOp::Lt => ord.is_lt(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Le => ord.is_le(),
                BinOp::Ge => ord.is_ge(),
                _ => false,
            }
        }
        (Scalar::Bool(a), Scalar::Bool(b)) => match op {
            BinOp::Eq => a == b,
            BinOp::Ne => a != b,
            _ => false,
        },
        _ => false, // type mismatch
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::parse_expression;
    use crate::reading::Value;
    use std::time::Duration;

    fn reading() -> Reading {
        let mut r = Reading::new("d1", "temperature", Value::Float(25.0));
        r.tags.insert("site".into(), "north".into());
        r
    }

    fn eval_str(src: &str, r: &Reading) -> Option<Scalar> {
        let expr = parse_expression(src).unwrap();
        let mut ctx = EvalCtx::new(r);
        eval_expr(&expr, &mut ctx)
    }

    #[test]
    fn arithmetic_over_value() {
        let r = reading();
        assert_eq!(
            eval_str("value * 1.8 + 32", &r),
            Some(Scalar::Number(77.0)),
        );
    }

    #[test]
    fn comparisons_coerce_numbers() {
        let r = Reading::new("d1", "k", Value::Int(30));
        // int payload compared against a float literal
        assert_eq!(eval_str("value >= 29.5", &r), Some(Scalar::Bool(true)));
    }

    #[test]
    fn missing_field_is_nil_and_compares_false() {
        let r = reading();
        assert_eq!(eval_str("tags.missing == \"x\"", &r), None);
        // but a definite false on one side of `and` wins
        assert_eq!(
            eval_str("value < 0 and tags.missing == \"x\"", &r),
            Some(Scalar::Bool(false)),
        );
    }

    #[test]
    fn division_by_zero_is_nil() {
        let r = reading();
        assert_eq!(eval_str("value / 0", &r), None);
    }

    #[test]
    fn string_operators_require_strings() {
        let r = reading();
        assert_eq!(eval_str("contains(value, \"x\")", &r), None);
        assert_eq!(
            eval_str("contains(tags.site, \"ort\")", &r),
            Some(Scalar::Bool(true)),
        );
    }

    #[test]
    fn locals_shadow_reading_fields() {
        let r = reading();
        let expr = parse_expression("x * 2").unwrap();
        let mut ctx = EvalCtx::new(&r);
        ctx.locals.insert("x".into(), Scalar::Number(21.0));
        assert_eq!(eval_expr(&expr, &mut ctx), Some(Scalar::Number(42.0)));
    }

    #[test]
    fn budget_exhaustion_flags_ctx() {
        let r = reading();
        let expr = parse_expression("1 + 2 + 3 + 4 + 5 + 6").unwrap();
        let mut ctx =
            EvalCtx::with_budget(&r, 3, Instant::now() + Duration::from_secs(1));
        assert_eq!(eval_expr(&expr, &mut ctx), None);
        assert!(ctx.exhausted());
    }
}
