use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expr::Scalar;

// ---------------------------------------------------------------------------
// Value — typed payload of one telemetry sample
// ---------------------------------------------------------------------------

/// Reading payload. Serialized adjacently tagged so a reading carries a
/// `type` discriminant next to its `value` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Location(Location),
    Vector3(Vector3),
    Color(Color),
    Array(Vec<f64>),
    Matrix(Matrix),
    Series(Series),
    /// Named-number map, emitted by aggregation flushes
    /// (`{"avg": 20.0, "max": 30.0}`).
    Object(std::collections::BTreeMap<String, f64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    /// Hue [0,360), saturation [0,1], value [0,1].
    pub fn to_hsv(&self) -> (f64, f64, f64) {
        let r = self.r as f64 / 255.0;
        let g = self.g as f64 / 255.0;
        let b = self.b as f64 / 255.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let h = if delta == 0.0 {
            0.0
        } else if max == r {
            60.0 * (((g - b) / delta).rem_euclid(6.0))
        } else if max == g {
            60.0 * ((b - r) / delta + 2.0)
        } else {
            60.0 * ((r - g) / delta + 4.0)
        };
        let s = if max == 0.0 { 0.0 } else { delta / max };
        (h, s, max)
    }

    /// Hue [0,360), saturation [0,1], lightness [0,1].
    pub fn to_hsl(&self) -> (f64, f64, f64) {
        let (h, _, _) = self.to_hsv();
        let r = self.r as f64 / 255.0;
        let g = self.g as f64 / 255.0;
        let b = self.b as f64 / 255.0;
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let l = (max + min) / 2.0;
        let delta = max - min;
        let s = if delta == 0.0 {
            0.0
        } else {
            delta / (1.0 - (2.0 * l - 1.0).abs())
        };
        (h, s, l)
    }

    /// Perceived brightness [0,1] (ITU-R BT.601 luma weights).
    pub fn brightness(&self) -> f64 {
        (0.299 * self.r as f64 + 0.587 * self.g as f64 + 0.114 * self.b as f64) / 255.0
    }
}

/// Row-major numeric matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub elements: Vec<f64>,
}

/// Paired timestamp (epoch nanos) / value series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl Value {
    /// Discriminant name matching the wire `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Location(_) => "location",
            Value::Vector3(_) => "vector3",
            Value::Color(_) => "color",
            Value::Array(_) => "array",
            Value::Matrix(_) => "matrix",
            Value::Series(_) => "series",
            Value::Object(_) => "object",
        }
    }

    /// Numeric view of scalar payloads; `None` for everything else.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Display form used for lookup keys and string coercion.
    pub fn display_string(&self) -> String {
        value_scalar(self).display_string()
    }

    /// Rough in-memory footprint, used for aggregate memory accounting.
    pub fn approx_bytes(&self) -> usize {
        match self {
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => 8,
            Value::String(s) => s.len() + 24,
            Value::Location(_) => 48,
            Value::Vector3(_) => 24,
            Value::Color(_) => 3,
            Value::Array(a) => a.len() * 8 + 24,
            Value::Matrix(m) => m.elements.len() * 8 + 40,
            Value::Series(s) => s.timestamps.len() * 16 + 48,
            Value::Object(m) => m.iter().map(|(k, _)| k.len() + 32).sum::<usize>() + 24,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading — the unit of flow
// ---------------------------------------------------------------------------

/// One telemetry sample. Readings are value-copied onto the bus and treated
/// as immutable between action boundaries; handlers that add tags must clone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub key: String,
    #[serde(flatten)]
    pub value: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,
}

impl Reading {
    pub fn new(device_id: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            device_id: device_id.into(),
            key: key.into(),
            value,
            timestamp: Utc::now(),
            tags: HashMap::new(),
            quality: Some(0),
        }
    }

    /// Enforce the model invariants: non-empty device and key, nonzero
    /// timestamp.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_id.is_empty() {
            return Err("device_id must be non-empty".into());
        }
        if self.key.is_empty() {
            return Err("key must be non-empty".into());
        }
        if self.timestamp.timestamp_nanos_opt().unwrap_or(0) == 0 {
            return Err("timestamp must be nonzero".into());
        }
        Ok(())
    }

    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(0)
    }

    /// Resolve a dot-notation field path against this reading.
    ///
    /// Supported roots: `device_id`, `key`, `type`, `value`, `value.<sub>`,
    /// `timestamp` (epoch nanos), `quality`, `tags.<name>`. A missing field
    /// resolves to `None`; comparisons against it evaluate false rather than
    /// raising.
    pub fn field(&self, path: &str) -> Option<Scalar> {
        match path {
            "device_id" => return Some(Scalar::Str(self.device_id.clone())),
            "key" => return Some(Scalar::Str(self.key.clone())),
            "type" => return Some(Scalar::Str(self.value.type_name().to_string())),
            "timestamp" => return Some(Scalar::Number(self.timestamp_nanos() as f64)),
            "quality" => return self.quality.map(|q| Scalar::Number(q as f64)),
            "value" => return Some(value_scalar(&self.value)),
            _ => {}
        }
        if let Some(tag) = path.strip_prefix("tags.") {
            return self.tags.get(tag).map(|v| Scalar::Str(v.clone()));
        }
        if let Some(sub) = path.strip_prefix("value.") {
            return composite_field(&self.value, sub);
        }
        None
    }
}

/// Top-level `value` as an evaluator scalar. Composite payloads surface as
/// numeric arrays so array functions apply uniformly.
fn value_scalar(value: &Value) -> Scalar {
    match value {
        Value::Int(i) => Scalar::Number(*i as f64),
        Value::Float(f) => Scalar::Number(*f),
        Value::Bool(b) => Scalar::Bool(*b),
        Value::String(s) => Scalar::Str(s.clone()),
        Value::Location(l) => Scalar::numbers(&[l.latitude, l.longitude]),
        Value::Vector3(v) => Scalar::numbers(&[v.x, v.y, v.z]),
        Value::Color(c) => Scalar::numbers(&[c.r as f64, c.g as f64, c.b as f64]),
        Value::Array(a) => Scalar::numbers(a),
        Value::Matrix(m) => Scalar::numbers(&m.elements),
        Value::Series(s) => Scalar::numbers(&s.values),
        Value::Object(m) => Scalar::numbers(&m.values().copied().collect::<Vec<_>>()),
    }
}

fn composite_field(value: &Value, sub: &str) -> Option<Scalar> {
    let num = |n: f64| Some(Scalar::Number(n));
    match (value, sub) {
        (Value::Location(l), "latitude" | "lat") => num(l.latitude),
        (Value::Location(l), "longitude" | "lon") => num(l.longitude),
        (Value::Location(l), "altitude") => l.altitude.map(Scalar::Number),
        (Value::Location(l), "speed") => l.speed.map(Scalar::Number),
        (Value::Location(l), "heading") => l.heading.map(Scalar::Number),
        (Value::Location(l), "accuracy") => l.accuracy.map(Scalar::Number),
        (Value::Vector3(v), "x") => num(v.x),
        (Value::Vector3(v), "y") => num(v.y),
        (Value::Vector3(v), "z") => num(v.z),
        (Value::Vector3(v), "magnitude") => num(v.magnitude()),
        (Value::Color(c), "r") => num(c.r as f64),
        (Value::Color(c), "g") => num(c.g as f64),
        (Value::Color(c), "b") => num(c.b as f64),
        (Value::Color(c), "hue") => num(c.to_hsv().0),
        (Value::Color(c), "saturation") => num(c.to_hsv().1),
        (Value::Color(c), "brightness") => num(c.brightness()),
        (Value::Color(c), "lightness") => num(c.to_hsl().2),
        (Value::Array(a), "length") => num(a.len() as f64),
        (Value::Matrix(m), "rows") => num(m.rows as f64),
        (Value::Matrix(m), "cols") => num(m.cols as f64),
        (Value::Series(s), "length") => num(s.values.len() as f64),
        (Value::Series(s), "first") => s.values.first().copied().map(Scalar::Number),
        (Value::Series(s), "last") => s.values.last().copied().map(Scalar::Number),
        (Value::Object(m), name) => m.get(name).copied().map(Scalar::Number),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_shape_carries_type_discriminant() {
        let r = Reading::new("d1", "temperature", Value::Float(25.5));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["type"], "float");
        assert_eq!(json["value"], 25.5);
        assert_eq!(json["device_id"], "d1");

        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn serde_roundtrip_composite() {
        let r = Reading::new(
            "gps-1",
            "position",
            Value::Location(Location {
                latitude: 52.37,
                longitude: 4.89,
                altitude: Some(11.0),
                speed: None,
                heading: None,
                accuracy: None,
            }),
        );
        let json = serde_json::to_string(&r).unwrap();
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
        assert_eq!(back.value.type_name(), "location");
    }

    #[test]
    fn validate_rejects_empty_device() {
        let mut r = Reading::new("d1", "k", Value::Int(1));
        r.device_id.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_key() {
        let mut r = Reading::new("d1", "k", Value::Int(1));
        r.key.clear();
        assert!(r.validate().is_err());
    }

    #[test]
    fn field_paths_resolve() {
        let mut r = Reading::new("d1", "temperature", Value::Float(25.5));
        r.tags.insert("site".into(), "north".into());

        assert_eq!(r.field("device_id"), Some(Scalar::Str("d1".into())));
        assert_eq!(r.field("value"), Some(Scalar::Number(25.5)));
        assert_eq!(r.field("tags.site"), Some(Scalar::Str("north".into())));
        assert_eq!(r.field("tags.missing"), None);
        assert_eq!(r.field("value.x"), None);
    }

    #[test]
    fn composite_field_paths() {
        let r = Reading::new(
            "imu-1",
            "accel",
            Value::Vector3(Vector3 { x: 3.0, y: 4.0, z: 0.0 }),
        );
        assert_eq!(r.field("value.x"), Some(Scalar::Number(3.0)));
        assert_eq!(r.field("value.magnitude"), Some(Scalar::Number(5.0)));

        let g = Reading::new(
            "gps-1",
            "pos",
            Value::Location(Location {
                latitude: 1.0,
                longitude: 2.0,
                altitude: None,
                speed: None,
                heading: None,
                accuracy: None,
            }),
        );
        assert_eq!(g.field("value.latitude"), Some(Scalar::Number(1.0)));
        assert_eq!(g.field("value.lat"), Some(Scalar::Number(1.0)));
        assert_eq!(g.field("value.altitude"), None);
    }

    #[test]
    fn color_derivations() {
        let red = Color { r: 255, g: 0, b: 0 };
        let (h, s, v) = red.to_hsv();
        assert_eq!(h, 0.0);
        assert_eq!(s, 1.0);
        assert_eq!(v, 1.0);
        assert!((red.brightness() - 0.299).abs() < 1e-9);
    }
}
