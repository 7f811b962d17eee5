use std::time::{Duration, Instant};

use orion_error::prelude::*;
use winnow::combinator::opt;
use winnow::prelude::*;
use winnow::token::literal;

use super::ast::{Expr, Scalar};
use super::eval::{EvalCtx, eval_expr};
use super::parser::{ident, kw, parse_expr, ws_skip};
use crate::error::{CoreReason, CoreResult};
use crate::reading::Reading;

/// Default instruction budget for a script run.
pub const DEFAULT_MAX_OPS: u64 = 10_000;
/// Default wall-time cap for a script run.
pub const DEFAULT_WALL_TIME: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Script — let-bindings followed by a result expression
// ---------------------------------------------------------------------------

/// A sandboxed script:
///
/// ```text
/// let f = value * 1.8 + 32;
/// let hot = f > 86;
/// hot and quality == 0
/// ```
///
/// Each binding introduces a local visible to later statements and the final
/// expression. Scripts run with an instruction budget and a wall-time cap;
/// exceeding either is a condition error, not a hang.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    bindings: Vec<(String, Expr)>,
    result: Expr,
    max_ops: u64,
    wall_time: Duration,
}

impl Script {
    pub fn compile(src: &str) -> Result<Self, String> {
        Self::compile_with_limits(src, DEFAULT_MAX_OPS, DEFAULT_WALL_TIME)
    }

    pub fn compile_with_limits(
        src: &str,
        max_ops: u64,
        wall_time: Duration,
    ) -> Result<Self, String> {
        let mut input = src;
        let (bindings, result) =
            parse_script(&mut input).map_err(|e| format!("script parse error: {e}"))?;
        if !input.trim().is_empty() {
            return Err(format!("trailing input {:?} in script", input.trim()));
        }
        Ok(Self {
            bindings,
            result,
            max_ops,
            wall_time,
        })
    }

    /// Run against one reading. Nil results surface as `Ok(None)`; a spent
    /// budget or deadline is an error so callers can count it.
    pub fn run(&self, reading: &Reading) -> CoreResult<Option<Scalar>> {
        let deadline = Instant::now() + self.wall_time;
        let mut ctx = EvalCtx::with_budget(reading, self.max_ops, deadline);

        for (name, expr) in &self.bindings {
            let value = eval_expr(expr, &mut ctx);
            if ctx.exhausted() {
                return Err(self.budget_error());
            }
            if let Some(value) = value {
                ctx.locals.insert(name.clone(), value);
            }
        }

        let result = eval_expr(&self.result, &mut ctx);
        if ctx.exhausted() {
            return Err(self.budget_error());
        }
        Ok(result)
    }

    fn budget_error(&self) -> crate::error::CoreError {
        StructError::from(CoreReason::Condition).with_detail(format!(
            "script exceeded its budget (max_ops={}, wall={:?})",
            self.max_ops, self.wall_time
        ))
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

type Bindings = Vec<(String, Expr)>;

fn parse_script(input: &mut &str) -> ModalResult<(Bindings, Expr)> {
    let mut bindings = Vec::new();
    loop {
        ws_skip.parse_next(input)?;
        if opt(kw("let")).parse_next(input)?.is_none() {
            break;
        }
        ws_skip.parse_next(input)?;
        let name = ident.parse_next(input)?;
        ws_skip.parse_next(input)?;
        literal("=").parse_next(input)?;
        ws_skip.parse_next(input)?;
        let expr = parse_expr(input)?;
        ws_skip.parse_next(input)?;
        literal(";").parse_next(input)?;
        bindings.push((name.to_string(), expr));
    }

    ws_skip.parse_next(input)?;
    let _ = opt(kw("return")).parse_next(input)?;
    ws_skip.parse_next(input)?;
    let result = parse_expr(input)?;
    ws_skip.parse_next(input)?;
    let _ = opt(literal(";")).parse_next(input)?;
    ws_skip.parse_next(input)?;
    Ok((bindings, result))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;

    fn reading(v: f64) -> Reading {
        Reading::new("d1", "temperature", Value::Float(v))
    }

    #[test]
    fn bindings_feed_the_result() {
        let script = Script::compile(
            "let f = value * 1.8 + 32;\nlet hot = f > 86;\nhot and quality == 0",
        )
        .unwrap();
        let out = script.run(&reading(35.0)).unwrap();
        assert_eq!(out, Some(Scalar::Bool(true)));

        let out = script.run(&reading(10.0)).unwrap();
        assert_eq!(out, Some(Scalar::Bool(false)));
    }

    #[test]
    fn return_keyword_is_optional_sugar() {
        let a = Script::compile("return value + 1;").unwrap();
        let b = Script::compile("value + 1").unwrap();
        assert_eq!(a.run(&reading(1.0)).unwrap(), b.run(&reading(1.0)).unwrap());
    }

    #[test]
    fn ops_budget_is_enforced() {
        let script =
            Script::compile_with_limits("1+1+1+1+1+1+1+1", 4, Duration::from_secs(5)).unwrap();
        let err = script.run(&reading(0.0)).unwrap_err();
        assert!(err.to_string().contains("budget"));
    }

    #[test]
    fn nil_binding_leaves_local_unset() {
        let script = Script::compile("let x = tags.missing; isnull(x)").unwrap();
        let out = script.run(&reading(1.0)).unwrap();
        assert_eq!(out, Some(Scalar::Bool(true)));
    }

    #[test]
    fn compile_rejects_trailing_garbage() {
        assert!(Script::compile("let x = 1; x; y z").is_err());
        assert!(Script::compile("let = 1; 2").is_err());
    }
}
