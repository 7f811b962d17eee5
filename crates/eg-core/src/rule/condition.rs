use std::sync::OnceLock;
use std::time::Duration;

use orion_error::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreReason, CoreResult};
use crate::expr::{
    self, BinOp, EvalCtx, Expr, Scalar, Script, compare_scalars, eval_expr, scalars_equal,
};
use crate::reading::Reading;

// ---------------------------------------------------------------------------
// Condition — the serde-facing recursive tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Simple {
        field: String,
        operator: SimpleOp,
        value: serde_json::Value,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
    Expression {
        expression: String,
    },
    Script {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_ops: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimpleOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Startswith,
    Endswith,
    Regex,
    In,
}

// ---------------------------------------------------------------------------
// CompiledCondition — regexes and expressions compiled once at load
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CompiledCondition {
    Simple {
        field: String,
        op: SimpleOp,
        value: Scalar,
        /// Present only for `regex`; compiled at rule load.
        regex: Option<Regex>,
        /// Present only for `in`.
        list: Vec<Scalar>,
    },
    And(Vec<CompiledCondition>),
    Or(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
    Expression(Expr),
    Script(LazyScript),
}

/// Deferred-compile script body: compiled on first evaluation, the outcome
/// cached for the snapshot's lifetime.
#[derive(Debug)]
pub struct LazyScript {
    source: String,
    max_ops: u64,
    wall_time: Duration,
    compiled: OnceLock<Result<Script, String>>,
}

impl LazyScript {
    fn get(&self) -> Result<&Script, CoreError> {
        self.compiled
            .get_or_init(|| {
                Script::compile_with_limits(&self.source, self.max_ops, self.wall_time)
            })
            .as_ref()
            .map_err(|e| StructError::from(CoreReason::Condition).with_detail(e.clone()))
    }
}

impl Condition {
    /// Compile the tree: parse expressions, compile regexes, normalize `in`
    /// lists. Structural problems are configuration errors and keep the
    /// snapshot from installing.
    pub fn compile(&self) -> CoreResult<CompiledCondition> {
        match self {
            Condition::Simple {
                field,
                operator,
                value,
            } => {
                let scalar = json_to_scalar(value);
                let regex = match operator {
                    SimpleOp::Regex => {
                        let Scalar::Str(pattern) = &scalar else {
                            return Err(config_err(format!(
                                "regex operator on {field:?} requires a string pattern"
                            )));
                        };
                        Some(Regex::new(pattern).map_err(|e| {
                            config_err(format!("invalid regex for {field:?}: {e}"))
                        })?)
                    }
                    _ => None,
                };
                let list = match operator {
                    SimpleOp::In => match value {
                        serde_json::Value::Array(items) => {
                            items.iter().map(json_to_scalar).collect()
                        }
                        _ => {
                            return Err(config_err(format!(
                                "in operator on {field:?} requires an array value"
                            )));
                        }
                    },
                    _ => Vec::new(),
                };
                Ok(CompiledCondition::Simple {
                    field: field.clone(),
                    op: *operator,
                    value: scalar,
                    regex,
                    list,
                })
            }
            Condition::And { conditions } => Ok(CompiledCondition::And(
                conditions.iter().map(Condition::compile).collect::<CoreResult<_>>()?,
            )),
            Condition::Or { conditions } => Ok(CompiledCondition::Or(
                conditions.iter().map(Condition::compile).collect::<CoreResult<_>>()?,
            )),
            Condition::Not { condition } => {
                Ok(CompiledCondition::Not(Box::new(condition.compile()?)))
            }
            Condition::Expression { expression } => {
                let expr = expr::parse_expression(expression).map_err(config_err)?;
                Ok(CompiledCondition::Expression(expr))
            }
            Condition::Script {
                script,
                max_ops,
                timeout_ms,
            } => Ok(CompiledCondition::Script(LazyScript {
                source: script.clone(),
                max_ops: max_ops.unwrap_or(expr::DEFAULT_MAX_OPS),
                wall_time: timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(expr::DEFAULT_WALL_TIME),
                compiled: OnceLock::new(),
            })),
        }
    }
}

impl CompiledCondition {
    /// Evaluate against one reading. A missing field is false, never an
    /// error; expression/script failures are condition errors and skip the
    /// rule for this reading.
    pub fn evaluate(&self, reading: &Reading) -> CoreResult<bool> {
        match self {
            CompiledCondition::Simple {
                field,
                op,
                value,
                regex,
                list,
            } => {
                let Some(actual) = reading.field(field) else {
                    return Ok(false);
                };
                Ok(eval_simple(&actual, *op, value, regex.as_ref(), list))
            }
            CompiledCondition::And(children) => {
                for child in children {
                    if !child.evaluate(reading)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            CompiledCondition::Or(children) => {
                for child in children {
                    if child.evaluate(reading)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CompiledCondition::Not(child) => Ok(!child.evaluate(reading)?),
            CompiledCondition::Expression(expr) => {
                let mut ctx = EvalCtx::new(reading);
                match eval_expr(expr, &mut ctx) {
                    Some(Scalar::Bool(b)) => Ok(b),
                    None => Ok(false),
                    Some(other) => Err(StructError::from(CoreReason::Condition).with_detail(
                        format!("expression evaluated to non-boolean {other:?}"),
                    )),
                }
            }
            CompiledCondition::Script(lazy) => {
                let script = lazy.get()?;
                match script.run(reading)? {
                    Some(Scalar::Bool(b)) => Ok(b),
                    None => Ok(false),
                    Some(other) => Err(StructError::from(CoreReason::Condition)
                        .with_detail(format!("script evaluated to non-boolean {other:?}"))),
                }
            }
        }
    }

    /// Field paths referenced by simple and expression nodes, for data-type
    /// inference.
    pub fn field_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            CompiledCondition::Simple { field, .. } => out.push(field),
            CompiledCondition::And(children) | CompiledCondition::Or(children) => {
                for child in children {
                    child.field_paths(out);
                }
            }
            CompiledCondition::Not(child) => child.field_paths(out),
            CompiledCondition::Expression(expr) => expr.field_paths(out),
            CompiledCondition::Script(_) => {}
        }
    }
}

fn eval_simple(
    actual: &Scalar,
    op: SimpleOp,
    expected: &Scalar,
    regex: Option<&Regex>,
    list: &[Scalar],
) -> bool {
    match op {
        SimpleOp::Eq => scalars_equal(actual, expected),
        SimpleOp::Ne => !scalars_equal(actual, expected),
        SimpleOp::Gt => compare_scalars(BinOp::Gt, actual, expected),
        SimpleOp::Gte => compare_scalars(BinOp::Ge, actual, expected),
        SimpleOp::Lt => compare_scalars(BinOp::Lt, actual, expected),
        SimpleOp::Lte => compare_scalars(BinOp::Le, actual, expected),
        SimpleOp::Contains => match (actual, expected) {
            (Scalar::Str(a), Scalar::Str(e)) => a.contains(e.as_str()),
            _ => false,
        },
        SimpleOp::Startswith => match (actual, expected) {
            (Scalar::Str(a), Scalar::Str(e)) => a.starts_with(e.as_str()),
            _ => false,
        },
        SimpleOp::Endswith => match (actual, expected) {
            (Scalar::Str(a), Scalar::Str(e)) => a.ends_with(e.as_str()),
            _ => false,
        },
        SimpleOp::Regex => match (actual, regex) {
            (Scalar::Str(a), Some(re)) => re.is_match(a),
            _ => false,
        },
        SimpleOp::In => list.iter().any(|item| scalars_equal(actual, item)),
    }
}

/// Numeric comparisons coerce int↔float by mapping both onto f64.
fn json_to_scalar(value: &serde_json::Value) -> Scalar {
    match value {
        serde_json::Value::Number(n) => Scalar::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Scalar::Str(s.clone()),
        serde_json::Value::Bool(b) => Scalar::Bool(*b),
        serde_json::Value::Array(items) => {
            Scalar::Array(items.iter().map(json_to_scalar).collect())
        }
        _ => Scalar::Bool(false),
    }
}

fn config_err(detail: impl Into<String>) -> CoreError {
    StructError::from(CoreReason::Config).with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;
    use serde_json::json;

    fn reading(v: f64) -> Reading {
        let mut r = Reading::new("d1", "temperature", Value::Float(v));
        r.tags.insert("site".into(), "north-7".into());
        r
    }

    fn compile(json: serde_json::Value) -> CompiledCondition {
        let cond: Condition = serde_json::from_value(json).unwrap();
        cond.compile().unwrap()
    }

    #[test]
    fn simple_numeric_compare_coerces_int_and_float() {
        let cond = compile(json!({
            "type": "simple", "field": "value", "operator": "gt", "value": 30
        }));
        assert!(cond.evaluate(&reading(30.5)).unwrap());
        assert!(!cond.evaluate(&reading(29.0)).unwrap());

        let int_reading = Reading::new("d1", "k", Value::Int(31));
        assert!(cond.evaluate(&int_reading).unwrap());
    }

    #[test]
    fn missing_field_is_false_not_error() {
        let cond = compile(json!({
            "type": "simple", "field": "tags.absent", "operator": "eq", "value": "x"
        }));
        assert!(!cond.evaluate(&reading(1.0)).unwrap());
    }

    #[test]
    fn and_or_not_short_circuit() {
        let cond = compile(json!({
            "type": "and",
            "conditions": [
                {"type": "simple", "field": "key", "operator": "eq", "value": "temperature"},
                {"type": "or", "conditions": [
                    {"type": "simple", "field": "value", "operator": "gte", "value": 100},
                    {"type": "not", "condition":
                        {"type": "simple", "field": "tags.site", "operator": "startswith", "value": "south"}},
                ]},
            ]
        }));
        assert!(cond.evaluate(&reading(5.0)).unwrap());
    }

    #[test]
    fn regex_compiles_once_and_matches() {
        let cond = compile(json!({
            "type": "simple", "field": "tags.site", "operator": "regex", "value": "^north-\\d+$"
        }));
        assert!(cond.evaluate(&reading(1.0)).unwrap());
    }

    #[test]
    fn invalid_regex_is_config_error() {
        let cond: Condition = serde_json::from_value(json!({
            "type": "simple", "field": "key", "operator": "regex", "value": "("
        }))
        .unwrap();
        assert!(cond.compile().is_err());
    }

    #[test]
    fn in_operator_needs_array() {
        let ok: Condition = serde_json::from_value(json!({
            "type": "simple", "field": "device_id", "operator": "in", "value": ["d1", "d2"]
        }))
        .unwrap();
        assert!(ok.compile().unwrap().evaluate(&reading(1.0)).unwrap());

        let bad: Condition = serde_json::from_value(json!({
            "type": "simple", "field": "device_id", "operator": "in", "value": "d1"
        }))
        .unwrap();
        assert!(bad.compile().is_err());
    }

    #[test]
    fn expression_condition() {
        let cond = compile(json!({
            "type": "expression",
            "expression": "key == \"temperature\" and value * 1.8 + 32 > 86"
        }));
        assert!(cond.evaluate(&reading(35.0)).unwrap());
        assert!(!cond.evaluate(&reading(10.0)).unwrap());
    }

    #[test]
    fn expression_parse_failure_is_config_error() {
        let cond: Condition = serde_json::from_value(json!({
            "type": "expression", "expression": "value >"
        }))
        .unwrap();
        assert!(cond.compile().is_err());
    }

    #[test]
    fn script_condition_compiles_lazily() {
        let cond = compile(json!({
            "type": "script",
            "script": "let f = value * 1.8 + 32; f > 86"
        }));
        assert!(cond.evaluate(&reading(35.0)).unwrap());
    }

    #[test]
    fn bad_script_surfaces_condition_error_per_reading() {
        let cond = compile(json!({
            "type": "script", "script": "let x = ;"
        }));
        assert!(cond.evaluate(&reading(1.0)).is_err());
        // and again — the compile failure is cached, not retried
        assert!(cond.evaluate(&reading(1.0)).is_err());
    }
}
