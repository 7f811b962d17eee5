use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use orion_error::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreReason, CoreResult};
use crate::expr::{self, EvalCtx, Expr, Scalar, eval_expr};
use crate::reading::{Matrix, Reading, Value, Vector3};
use crate::stats;

// ---------------------------------------------------------------------------
// TransformParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformParams {
    #[serde(rename = "type")]
    pub kind: TransformKind,
    /// Kind-specific parameters.
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// When set, the transform spawns a derived reading under this key and
    /// the original reading continues down the pipeline (both are exposed
    /// downstream). When unset, the value is overwritten in place.
    #[serde(default)]
    pub output_key: Option<String>,
    /// Explicit target type: `int`, `float`, `string`, `bool`.
    #[serde(default)]
    pub output_type: Option<String>,
    /// Decimal digits for numeric output.
    #[serde(default)]
    pub precision: Option<i32>,
    #[serde(default)]
    pub error_action: ErrorAction,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    /// Additional subject the derived reading is published to.
    #[serde(default)]
    pub publish_subject: Option<String>,
    /// With `output_key`: substitute the derived reading for subsequent
    /// actions instead of the original.
    #[serde(default)]
    pub replace_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    Scale,
    Offset,
    Expression,
    UnitConvert,
    Lookup,
    Round,
    Clamp,
    Format,
    Map,
    GeoDistance,
    GeoBearing,
    GeoGeofence,
    VectorMagnitude,
    VectorNormalize,
    VectorStats,
    VectorTransform,
    ColorConvert,
    ArrayAggregate,
    MatrixOperation,
    CompositeToArray,
    TimeseriesAnalysis,
    ExtractField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    #[default]
    Error,
    Ignore,
    Default,
}

// ---------------------------------------------------------------------------
// ExprCache — expression transforms compile once per source string
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ExprCache {
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl ExprCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, source: &str) -> CoreResult<Arc<Expr>> {
        let mut cache = self.cache.lock().expect("expr cache lock poisoned");
        if let Some(expr) = cache.get(source) {
            return Ok(Arc::clone(expr));
        }
        let expr = Arc::new(
            expr::parse_expression(source)
                .map_err(|e| StructError::from(CoreReason::Action).with_detail(e))?,
        );
        cache.insert(source.to_string(), Arc::clone(&expr));
        Ok(expr)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

pub enum TransformOutcome {
    /// In-place overwrite: continue with the modified reading.
    Replaced(Reading),
    /// `output_key` set: a derived reading to publish; `replace_current`
    /// selects which of the two continues down the pipeline.
    Derived {
        derived: Reading,
        replace_current: bool,
    },
    /// `error_action = ignore` swallowed a failure.
    Dropped,
}

/// Run one transform. Failures honour `error_action`: `error` propagates,
/// `ignore` drops the reading, `default` substitutes `default_value`.
pub fn apply(
    exprs: &ExprCache,
    params: &TransformParams,
    reading: &Reading,
) -> CoreResult<TransformOutcome> {
    let value = match compute(exprs, params, reading) {
        Ok(v) => v,
        Err(e) => match params.error_action {
            ErrorAction::Error => return Err(e),
            ErrorAction::Ignore => return Ok(TransformOutcome::Dropped),
            ErrorAction::Default => match &params.default_value {
                Some(v) => json_to_value(v).ok_or_else(|| {
                    action_err("default_value is not a usable reading value".to_string())
                })?,
                None => return Err(action_err("error_action=default without default_value")),
            },
        },
    };
    let value = finish_value(value, params)?;

    match &params.output_key {
        None => {
            let mut out = reading.clone();
            out.value = value;
            Ok(TransformOutcome::Replaced(out))
        }
        Some(key) => {
            let mut derived = reading.clone();
            derived.key = key.clone();
            derived.value = value;
            Ok(TransformOutcome::Derived {
                derived,
                replace_current: params.replace_current,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Kind implementations
// ---------------------------------------------------------------------------

fn compute(
    exprs: &ExprCache,
    params: &TransformParams,
    reading: &Reading,
) -> CoreResult<Value> {
    let p = &params.parameters;
    match params.kind {
        TransformKind::Scale => {
            let factor = req_f64(p, "factor")?;
            Ok(Value::Float(numeric(reading)? * factor))
        }
        TransformKind::Offset => {
            let offset = req_f64(p, "offset")?;
            Ok(Value::Float(numeric(reading)? + offset))
        }
        TransformKind::Expression => {
            let source = req_str(p, "expression")?;
            let expr = exprs.get(source)?;
            let mut ctx = EvalCtx::new(reading);
            // `x` is the conventional name for the current value.
            if let Some(current) = reading.field("value") {
                ctx.locals.insert("x".to_string(), current);
            }
            match eval_expr(&expr, &mut ctx) {
                Some(scalar) => scalar_to_value(scalar)
                    .ok_or_else(|| action_err("expression produced no usable value")),
                None => Err(action_err(format!("expression {source:?} evaluated to nil"))),
            }
        }
        TransformKind::UnitConvert => {
            let from = req_str(p, "from")?;
            let to = req_str(p, "to")?;
            Ok(Value::Float(convert_unit(numeric(reading)?, from, to)?))
        }
        TransformKind::Lookup | TransformKind::Map => {
            let table = p
                .get("table")
                .or_else(|| p.get("mapping"))
                .and_then(|v| v.as_object())
                .ok_or_else(|| action_err("lookup/map requires a table object"))?;
            let key = reading
                .field("value")
                .map(|s| s.display_string())
                .ok_or_else(|| action_err("lookup on a reading without a value"))?;
            match table.get(&key).or_else(|| p.get("default")) {
                Some(mapped) => json_to_value(mapped)
                    .ok_or_else(|| action_err("lookup table value is not a reading value")),
                None => Err(action_err(format!("no lookup mapping for {key:?}"))),
            }
        }
        TransformKind::Round => {
            let digits = opt_f64(p, "digits").unwrap_or(0.0) as i32;
            let factor = 10_f64.powi(digits);
            Ok(Value::Float((numeric(reading)? * factor).round() / factor))
        }
        TransformKind::Clamp => {
            let lo = req_f64(p, "min")?;
            let hi = req_f64(p, "max")?;
            if lo > hi {
                return Err(action_err("clamp with min > max"));
            }
            Ok(Value::Float(numeric(reading)?.clamp(lo, hi)))
        }
        TransformKind::Format => {
            let template = req_str(p, "template")?;
            Ok(Value::String(crate::template::expand(
                template,
                reading,
                &HashMap::new(),
            )))
        }
        TransformKind::GeoDistance | TransformKind::GeoBearing | TransformKind::GeoGeofence => {
            geo_transform(params.kind, p, reading)
        }
        TransformKind::VectorMagnitude => {
            Ok(Value::Float(vector(reading)?.magnitude()))
        }
        TransformKind::VectorNormalize => {
            let v = vector(reading)?;
            let mag = v.magnitude();
            if mag == 0.0 {
                return Err(action_err("cannot normalize a zero vector"));
            }
            Ok(Value::Vector3(Vector3 {
                x: v.x / mag,
                y: v.y / mag,
                z: v.z / mag,
            }))
        }
        TransformKind::VectorStats => {
            let v = vector(reading)?;
            let comps = [v.x, v.y, v.z];
            let mean = stats::mean(&comps).unwrap_or(0.0);
            let min = comps.iter().copied().fold(f64::INFINITY, f64::min);
            let max = comps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Ok(Value::Array(vec![mean, min, max, v.magnitude()]))
        }
        TransformKind::VectorTransform => {
            let v = vector(reading)?;
            match req_str(p, "operation")? {
                "scale" => {
                    let f = req_f64(p, "factor")?;
                    Ok(Value::Vector3(Vector3 { x: v.x * f, y: v.y * f, z: v.z * f }))
                }
                "rotate" => {
                    let rad = req_f64(p, "angle")?.to_radians();
                    let (sin, cos) = rad.sin_cos();
                    Ok(Value::Vector3(Vector3 {
                        x: v.x * cos - v.y * sin,
                        y: v.x * sin + v.y * cos,
                        z: v.z,
                    }))
                }
                other => Err(action_err(format!("unknown vector operation {other:?}"))),
            }
        }
        TransformKind::ColorConvert => {
            let Value::Color(c) = &reading.value else {
                return Err(action_err("color_convert requires a color reading"));
            };
            match req_str(p, "to")? {
                "hsv" => {
                    let (h, s, v) = c.to_hsv();
                    Ok(Value::Array(vec![h, s, v]))
                }
                "hsl" => {
                    let (h, s, l) = c.to_hsl();
                    Ok(Value::Array(vec![h, s, l]))
                }
                other => Err(action_err(format!("unknown color space {other:?}"))),
            }
        }
        TransformKind::ArrayAggregate => {
            let values = numeric_array(reading)?;
            let func = req_str(p, "function")?;
            let out = match func {
                "mean" | "avg" => stats::mean(&values),
                "sum" => Some(values.iter().sum()),
                "min" => values.iter().copied().reduce(f64::min),
                "max" => values.iter().copied().reduce(f64::max),
                "stddev" => stats::stddev(&values),
                "median" => stats::median(&values),
                _ => func
                    .strip_prefix('p')
                    .and_then(|d| d.parse::<f64>().ok())
                    .and_then(|pct| stats::percentile(&values, pct)),
            };
            out.map(Value::Float)
                .ok_or_else(|| action_err(format!("array function {func:?} failed")))
        }
        TransformKind::MatrixOperation => {
            let Value::Matrix(m) = &reading.value else {
                return Err(action_err("matrix_operation requires a matrix reading"));
            };
            matrix_op(req_str(p, "operation")?, m)
        }
        TransformKind::CompositeToArray => {
            let scalar = reading
                .field("value")
                .ok_or_else(|| action_err("reading has no value"))?;
            let nums = scalar
                .as_numeric_array()
                .ok_or_else(|| action_err("value does not flatten to numbers"))?;
            Ok(Value::Array(nums))
        }
        TransformKind::TimeseriesAnalysis => {
            let Value::Series(s) = &reading.value else {
                return Err(action_err("timeseries_analysis requires a series reading"));
            };
            match req_str(p, "analysis")? {
                "mean" => stats::mean(&s.values)
                    .map(Value::Float)
                    .ok_or_else(|| action_err("empty series")),
                "min" => s.values.iter().copied().reduce(f64::min)
                    .map(Value::Float)
                    .ok_or_else(|| action_err("empty series")),
                "max" => s.values.iter().copied().reduce(f64::max)
                    .map(Value::Float)
                    .ok_or_else(|| action_err("empty series")),
                // least-squares slope in units per second
                "trend" => trend_per_second(s).map(Value::Float)
                    .ok_or_else(|| action_err("series too short for a trend")),
                other => Err(action_err(format!("unknown analysis {other:?}"))),
            }
        }
        TransformKind::ExtractField => {
            let field = req_str(p, "field")?;
            let path = format!("value.{field}");
            let scalar = reading
                .field(&path)
                .ok_or_else(|| action_err(format!("no composite field {field:?}")))?;
            scalar_to_value(scalar).ok_or_else(|| action_err("field is not a scalar"))
        }
    }
}

fn geo_transform(
    kind: TransformKind,
    p: &serde_json::Map<String, serde_json::Value>,
    reading: &Reading,
) -> CoreResult<Value> {
    let Value::Location(loc) = &reading.value else {
        return Err(action_err("geo transform requires a location reading"));
    };
    let lat = req_f64(p, "lat")?;
    let lon = req_f64(p, "lon")?;
    let here = [
        Some(Scalar::Number(loc.latitude)),
        Some(Scalar::Number(loc.longitude)),
        Some(Scalar::Number(lat)),
        Some(Scalar::Number(lon)),
    ];
    match kind {
        TransformKind::GeoDistance => expr_func("distance", &here),
        TransformKind::GeoBearing => expr_func("bearing", &here),
        TransformKind::GeoGeofence => {
            let radius = req_f64(p, "radius")?;
            let mut args = here.to_vec();
            args.push(Some(Scalar::Number(radius)));
            expr_func("geofence", &args)
        }
        _ => unreachable!("geo_transform called with non-geo kind"),
    }
}

/// Route through the shared expression function library.
fn expr_func(name: &str, args: &[Option<Scalar>]) -> CoreResult<Value> {
    crate::expr::call_function(name, args)
        .and_then(scalar_to_value)
        .ok_or_else(|| action_err(format!("function {name:?} failed")))
}

fn matrix_op(op: &str, m: &Matrix) -> CoreResult<Value> {
    if m.elements.len() != m.rows * m.cols {
        return Err(action_err("matrix dimensions disagree with elements"));
    }
    match op {
        "transpose" => {
            let mut out = vec![0.0; m.elements.len()];
            for r in 0..m.rows {
                for c in 0..m.cols {
                    out[c * m.rows + r] = m.elements[r * m.cols + c];
                }
            }
            Ok(Value::Matrix(Matrix {
                rows: m.cols,
                cols: m.rows,
                elements: out,
            }))
        }
        "trace" => {
            if m.rows != m.cols {
                return Err(action_err("trace requires a square matrix"));
            }
            Ok(Value::Float(
                (0..m.rows).map(|i| m.elements[i * m.cols + i]).sum(),
            ))
        }
        "determinant" => {
            if m.rows != m.cols || m.rows == 0 || m.rows > 3 {
                return Err(action_err("determinant supports square matrices up to 3×3"));
            }
            let e = &m.elements;
            let det = match m.rows {
                1 => e[0],
                2 => e[0] * e[3] - e[1] * e[2],
                _ => {
                    e[0] * (e[4] * e[8] - e[5] * e[7]) - e[1] * (e[3] * e[8] - e[5] * e[6])
                        + e[2] * (e[3] * e[7] - e[4] * e[6])
                }
            };
            Ok(Value::Float(det))
        }
        other => Err(action_err(format!("unknown matrix operation {other:?}"))),
    }
}

fn trend_per_second(s: &crate::reading::Series) -> Option<f64> {
    if s.values.len() < 2 || s.timestamps.len() != s.values.len() {
        return None;
    }
    let t0 = s.timestamps[0];
    let xs: Vec<f64> = s.timestamps.iter().map(|t| (t - t0) as f64 / 1e9).collect();
    let mean_x = stats::mean(&xs)?;
    let mean_y = stats::mean(&s.values)?;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in xs.iter().zip(&s.values) {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    (den != 0.0).then(|| num / den)
}

// ---------------------------------------------------------------------------
// value plumbing
// ---------------------------------------------------------------------------

fn finish_value(value: Value, params: &TransformParams) -> CoreResult<Value> {
    let value = match value {
        Value::Float(f) => match params.precision {
            Some(digits) => {
                let factor = 10_f64.powi(digits);
                Value::Float((f * factor).round() / factor)
            }
            None => Value::Float(f),
        },
        other => other,
    };
    match params.output_type.as_deref() {
        None => Ok(value),
        Some("float") => value
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| action_err("output_type=float on non-numeric result")),
        Some("int") => value
            .as_f64()
            .map(|f| Value::Int(f.round() as i64))
            .ok_or_else(|| action_err("output_type=int on non-numeric result")),
        Some("string") => Ok(match value {
            Value::String(s) => Value::String(s),
            other => Value::String(other.display_string()),
        }),
        Some("bool") => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            _ => Err(action_err("output_type=bool on non-boolean result")),
        },
        Some(other) => Err(action_err(format!("unknown output_type {other:?}"))),
    }
}

fn scalar_to_value(scalar: Scalar) -> Option<Value> {
    match scalar {
        Scalar::Number(n) => Some(Value::Float(n)),
        Scalar::Str(s) => Some(Value::String(s)),
        Scalar::Bool(b) => Some(Value::Bool(b)),
        Scalar::Array(items) => {
            let nums: Option<Vec<f64>> = items.iter().map(Scalar::as_number).collect();
            nums.map(Value::Array)
        }
    }
}

fn json_to_value(v: &serde_json::Value) -> Option<Value> {
    match v {
        serde_json::Value::Number(n) => {
            if n.is_i64() {
                n.as_i64().map(Value::Int)
            } else {
                n.as_f64().map(Value::Float)
            }
        }
        serde_json::Value::String(s) => Some(Value::String(s.clone())),
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Array(items) => {
            let nums: Option<Vec<f64>> = items.iter().map(serde_json::Value::as_f64).collect();
            nums.map(Value::Array)
        }
        _ => None,
    }
}

fn numeric(reading: &Reading) -> CoreResult<f64> {
    reading
        .value
        .as_f64()
        .ok_or_else(|| action_err("transform requires a numeric reading"))
}

fn vector(reading: &Reading) -> CoreResult<Vector3> {
    match &reading.value {
        Value::Vector3(v) => Ok(v.clone()),
        _ => Err(action_err("transform requires a vector3 reading")),
    }
}

fn numeric_array(reading: &Reading) -> CoreResult<Vec<f64>> {
    match &reading.value {
        Value::Array(a) => Ok(a.clone()),
        Value::Series(s) => Ok(s.values.clone()),
        Value::Matrix(m) => Ok(m.elements.clone()),
        _ => Err(action_err("transform requires an array-like reading")),
    }
}

fn req_f64(p: &serde_json::Map<String, serde_json::Value>, key: &str) -> CoreResult<f64> {
    opt_f64(p, key).ok_or_else(|| action_err(format!("missing numeric parameter {key:?}")))
}

fn opt_f64(p: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<f64> {
    p.get(key).and_then(serde_json::Value::as_f64)
}

fn req_str<'a>(
    p: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> CoreResult<&'a str> {
    p.get(key)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| action_err(format!("missing string parameter {key:?}")))
}

fn action_err(detail: impl Into<String>) -> CoreError {
    StructError::from(CoreReason::Action).with_detail(detail.into())
}

/// Unit conversion over a small table: each unit maps to a base quantity.
fn convert_unit(v: f64, from: &str, to: &str) -> CoreResult<f64> {
    let from = from.to_ascii_uppercase();
    let to = to.to_ascii_uppercase();
    if from == to {
        return Ok(v);
    }

    // temperature converts through Celsius
    let to_c = |v: f64, unit: &str| -> Option<f64> {
        match unit {
            "C" => Some(v),
            "F" => Some((v - 32.0) / 1.8),
            "K" => Some(v - 273.15),
            _ => None,
        }
    };
    let from_c = |v: f64, unit: &str| -> Option<f64> {
        match unit {
            "C" => Some(v),
            "F" => Some(v * 1.8 + 32.0),
            "K" => Some(v + 273.15),
            _ => None,
        }
    };
    if let Some(c) = to_c(v, &from)
        && let Some(result) = from_c(c, &to)
    {
        return Ok(result);
    }

    // linear units convert through an SI factor
    let factor = |unit: &str| -> Option<f64> {
        match unit {
            // length → metres
            "MM" => Some(0.001),
            "CM" => Some(0.01),
            "M" => Some(1.0),
            "KM" => Some(1000.0),
            "IN" => Some(0.0254),
            "FT" => Some(0.3048),
            "MI" => Some(1609.344),
            // pressure → pascals
            "PA" => Some(1.0),
            "KPA" => Some(1000.0),
            "BAR" => Some(100_000.0),
            "PSI" => Some(6894.757),
            // speed → metres/second
            "MPS" => Some(1.0),
            "KMH" => Some(1.0 / 3.6),
            "MPH" => Some(0.44704),
            _ => None,
        }
    };
    match (factor(&from), factor(&to)) {
        (Some(f), Some(t)) => Ok(v * f / t),
        _ => Err(action_err(format!("cannot convert {from:?} to {to:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{Location, Series};
    use serde_json::json;

    fn params(v: serde_json::Value) -> TransformParams {
        serde_json::from_value(v).unwrap()
    }

    fn float_reading(v: f64) -> Reading {
        let mut r = Reading::new("d1", "temperature", Value::Float(v));
        r.tags.insert("site".into(), "north".into());
        r
    }

    #[test]
    fn expression_with_output_key_spawns_derived() {
        // transform(expression "x*1.8+32", output_key=temperature_f, precision=1)
        let p = params(json!({
            "type": "expression",
            "parameters": {"expression": "x * 1.8 + 32"},
            "output_key": "temperature_f",
            "precision": 1
        }));
        let cache = ExprCache::new();
        let out = apply(&cache, &p, &float_reading(25.0)).unwrap();
        let TransformOutcome::Derived { derived, replace_current } = out else {
            panic!("expected a derived reading");
        };
        assert!(!replace_current);
        assert_eq!(derived.key, "temperature_f");
        assert_eq!(derived.value, Value::Float(77.0));
        assert_eq!(derived.value.type_name(), "float");
        assert_eq!(derived.tags.get("site").map(String::as_str), Some("north"));
    }

    #[test]
    fn scale_overwrites_in_place() {
        let p = params(json!({"type": "scale", "parameters": {"factor": 2.0}}));
        let cache = ExprCache::new();
        let out = apply(&cache, &p, &float_reading(21.0)).unwrap();
        let TransformOutcome::Replaced(r) = out else { panic!() };
        assert_eq!(r.value, Value::Float(42.0));
        assert_eq!(r.key, "temperature");
    }

    #[test]
    fn unit_convert_round_trips() {
        let cache = ExprCache::new();
        let c_to_f = params(json!({
            "type": "unit_convert", "parameters": {"from": "C", "to": "F"}
        }));
        let f_to_c = params(json!({
            "type": "unit_convert", "parameters": {"from": "F", "to": "C"}
        }));
        let TransformOutcome::Replaced(f) =
            apply(&cache, &c_to_f, &float_reading(25.0)).unwrap()
        else {
            panic!()
        };
        assert_eq!(f.value, Value::Float(77.0));
        let TransformOutcome::Replaced(back) = apply(&cache, &f_to_c, &f).unwrap() else {
            panic!()
        };
        let Value::Float(v) = back.value else { panic!() };
        assert!((v - 25.0).abs() < 1e-9);
    }

    #[test]
    fn error_action_policies() {
        let cache = ExprCache::new();
        // lookup with no mapping and no default
        let base = json!({
            "type": "lookup", "parameters": {"table": {"1": "on"}}
        });

        let err = params(base.clone());
        assert!(apply(&cache, &err, &float_reading(9.0)).is_err());

        let mut ignore = base.clone();
        ignore["error_action"] = json!("ignore");
        assert!(matches!(
            apply(&cache, &params(ignore), &float_reading(9.0)).unwrap(),
            TransformOutcome::Dropped,
        ));

        let mut fallback = base;
        fallback["error_action"] = json!("default");
        fallback["default_value"] = json!("unknown");
        let TransformOutcome::Replaced(r) =
            apply(&cache, &params(fallback), &float_reading(9.0)).unwrap()
        else {
            panic!()
        };
        assert_eq!(r.value, Value::String("unknown".into()));
    }

    #[test]
    fn geo_distance_from_reference() {
        let cache = ExprCache::new();
        let p = params(json!({
            "type": "geo_distance", "parameters": {"lat": 52.37, "lon": 4.89}
        }));
        let r = Reading::new(
            "gps",
            "pos",
            Value::Location(Location {
                latitude: 48.86,
                longitude: 2.35,
                altitude: None,
                speed: None,
                heading: None,
                accuracy: None,
            }),
        );
        let TransformOutcome::Replaced(out) = apply(&cache, &p, &r).unwrap() else {
            panic!()
        };
        let Value::Float(metres) = out.value else { panic!() };
        assert!((425_000.0..435_000.0).contains(&metres));
    }

    #[test]
    fn matrix_transpose_and_trace() {
        let cache = ExprCache::new();
        let m = Reading::new(
            "m",
            "mat",
            Value::Matrix(Matrix {
                rows: 2,
                cols: 2,
                elements: vec![1.0, 2.0, 3.0, 4.0],
            }),
        );
        let p = params(json!({"type": "matrix_operation", "parameters": {"operation": "trace"}}));
        let TransformOutcome::Replaced(out) = apply(&cache, &p, &m).unwrap() else { panic!() };
        assert_eq!(out.value, Value::Float(5.0));

        let p = params(json!({
            "type": "matrix_operation", "parameters": {"operation": "transpose"}
        }));
        let TransformOutcome::Replaced(out) = apply(&cache, &p, &m).unwrap() else { panic!() };
        let Value::Matrix(t) = out.value else { panic!() };
        assert_eq!(t.elements, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn timeseries_trend() {
        let cache = ExprCache::new();
        let r = Reading::new(
            "s",
            "series",
            Value::Series(Series {
                timestamps: vec![0, 1_000_000_000, 2_000_000_000],
                values: vec![1.0, 2.0, 3.0],
            }),
        );
        let p = params(json!({
            "type": "timeseries_analysis", "parameters": {"analysis": "trend"}
        }));
        let TransformOutcome::Replaced(out) = apply(&cache, &p, &r).unwrap() else { panic!() };
        let Value::Float(slope) = out.value else { panic!() };
        assert!((slope - 1.0).abs() < 1e-9);
    }

    #[test]
    fn output_type_coercion() {
        let cache = ExprCache::new();
        let p = params(json!({
            "type": "scale", "parameters": {"factor": 1.0}, "output_type": "int"
        }));
        let TransformOutcome::Replaced(r) = apply(&cache, &p, &float_reading(41.6)).unwrap()
        else {
            panic!()
        };
        assert_eq!(r.value, Value::Int(42));
    }
}
