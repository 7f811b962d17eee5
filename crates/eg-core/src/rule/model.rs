use chrono::{DateTime, Utc};
use orion_error::prelude::*;
use serde::{Deserialize, Serialize};

use crate::action::alert::AlertParams;
use crate::action::filter::FilterParams;
use crate::action::forward::ForwardParams;
use crate::action::transform::TransformParams;
use crate::aggregate::AggregateParams;
use crate::error::{CoreError, CoreReason, CoreResult};
use crate::reading::Value;

use super::condition::{CompiledCondition, Condition, SimpleOp};

// ---------------------------------------------------------------------------
// Rule — the versioned user-facing record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower fires earlier within a matching group; ties break by id.
    #[serde(default)]
    pub priority: i32,
    /// Optional composite-class hint (`"location"`, `"vector3d"`, …);
    /// unknown strings fall back to inference from field access patterns.
    #[serde(default)]
    pub data_type: Option<String>,
    pub conditions: Condition,
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Incremented by the store on each successful reload that changed this
    /// rule's content.
    #[serde(default)]
    pub version: u64,
}

fn default_true() -> bool {
    true
}

impl Rule {
    /// Equality over user content, ignoring the bookkeeping fields the
    /// store maintains.
    pub fn content_eq(&self, other: &Rule) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.description == other.description
            && self.tags == other.tags
            && self.enabled == other.enabled
            && self.priority == other.priority
            && self.data_type == other.data_type
            && self.conditions == other.conditions
            && self.actions == other.actions
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(config_err("rule id must be non-empty"));
        }
        if self.actions.is_empty() {
            return Err(config_err(format!("rule {:?} has no actions", self.id)));
        }
        for action in &self.actions {
            action.validate(&self.id)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ActionSpec
// ---------------------------------------------------------------------------

/// One pipeline step: the `type` tag selects the handler, `parameters`
/// carries the type-specific map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum ActionSpec {
    Alert(AlertParams),
    Transform(TransformParams),
    Filter(FilterParams),
    Aggregate(AggregateParams),
    Forward(ForwardParams),
}

impl ActionSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActionSpec::Alert(_) => "alert",
            ActionSpec::Transform(_) => "transform",
            ActionSpec::Filter(_) => "filter",
            ActionSpec::Aggregate(_) => "aggregate",
            ActionSpec::Forward(_) => "forward",
        }
    }

    fn validate(&self, rule_id: &str) -> CoreResult<()> {
        match self {
            ActionSpec::Aggregate(p) => p.validate(),
            ActionSpec::Forward(p) => {
                if p.targets.is_empty() {
                    return Err(config_err(format!(
                        "rule {rule_id:?}: forward action without targets"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// DataClass — composite payload classes for the rule index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataClass {
    Location,
    Vector3,
    Color,
    Array,
    Matrix,
    Series,
}

impl DataClass {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "location" => DataClass::Location,
            "vector3d" | "vector3" => DataClass::Vector3,
            "color" => DataClass::Color,
            "array" => DataClass::Array,
            "matrix" => DataClass::Matrix,
            "timeseries" | "series" => DataClass::Series,
            _ => return None,
        })
    }

    pub fn of_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Location(_) => DataClass::Location,
            Value::Vector3(_) => DataClass::Vector3,
            Value::Color(_) => DataClass::Color,
            Value::Array(_) => DataClass::Array,
            Value::Matrix(_) => DataClass::Matrix,
            Value::Series(_) => DataClass::Series,
            _ => return None,
        })
    }

    /// Best-effort inference from the `value.<field>` paths a condition
    /// touches.
    pub fn infer(paths: &[&str]) -> Option<Self> {
        for path in paths {
            let Some(sub) = path.strip_prefix("value.") else {
                continue;
            };
            let class = match sub {
                "latitude" | "lat" | "longitude" | "lon" | "altitude" | "speed" | "heading"
                | "accuracy" => DataClass::Location,
                "x" | "y" | "z" | "magnitude" => DataClass::Vector3,
                "r" | "g" | "b" | "hue" | "saturation" | "brightness" | "lightness" => {
                    DataClass::Color
                }
                "rows" | "cols" => DataClass::Matrix,
                "first" | "last" => DataClass::Series,
                "length" => DataClass::Array,
                _ => continue,
            };
            return Some(class);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// CompiledRule
// ---------------------------------------------------------------------------

/// A rule with its condition tree compiled and its index facets extracted.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: Rule,
    pub condition: CompiledCondition,
    pub data_class: Option<DataClass>,
    /// Devices this rule is pinned to; empty means the wildcard bucket.
    pub devices: Vec<String>,
    /// Keys this rule is pinned to; empty means the wildcard bucket.
    pub keys: Vec<String>,
}

impl CompiledRule {
    pub fn compile(rule: Rule) -> CoreResult<Self> {
        rule.validate()?;
        let condition = rule.conditions.compile().map_err(|e| {
            StructError::from(CoreReason::Config)
                .with_detail(format!("rule {:?}: {e}", rule.id))
        })?;

        let data_class = match &rule.data_type {
            Some(name) => DataClass::parse(name).or_else(|| {
                let mut paths = Vec::new();
                condition.field_paths(&mut paths);
                DataClass::infer(&paths)
            }),
            None => None,
        };

        let devices = equality_facet(&rule.conditions, "device_id").unwrap_or_default();
        let keys = equality_facet(&rule.conditions, "key").unwrap_or_default();

        Ok(Self {
            rule,
            condition,
            data_class,
            devices,
            keys,
        })
    }
}

/// Extract the set of values a conjunctively-reachable equality predicate
/// pins `field` to. `None` means the rule belongs in the wildcard bucket.
fn equality_facet(cond: &Condition, field: &str) -> Option<Vec<String>> {
    match cond {
        Condition::Simple {
            field: f,
            operator: SimpleOp::Eq,
            value: serde_json::Value::String(s),
        } if f == field => Some(vec![s.clone()]),
        Condition::Simple {
            field: f,
            operator: SimpleOp::In,
            value: serde_json::Value::Array(items),
        } if f == field => {
            let values: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            (!values.is_empty()).then_some(values)
        }
        Condition::And { conditions } => {
            conditions.iter().find_map(|c| equality_facet(c, field))
        }
        // Every branch must pin the field for an `or` to constrain it.
        Condition::Or { conditions } => {
            let mut union = Vec::new();
            for branch in conditions {
                union.extend(equality_facet(branch, field)?);
            }
            union.sort();
            union.dedup();
            Some(union)
        }
        _ => None,
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
    use serde_json::json;

    fn rule_json(conditions: serde_json::Value) -> Rule {
        serde_json::from_value(json!({
            "id": "r1",
            "conditions": conditions,
            "actions": [
                {"type": "alert", "parameters": {"level": "warning", "message": "m"}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn device_facet_from_eq() {
        let rule = rule_json(json!({
            "type": "and",
            "conditions": [
                {"type": "simple", "field": "device_id", "operator": "eq", "value": "d1"},
                {"type": "simple", "field": "value", "operator": "gt", "value": 30}
            ]
        }));
        let compiled = CompiledRule::compile(rule).unwrap();
        assert_eq!(compiled.devices, vec!["d1"]);
        assert!(compiled.keys.is_empty());
    }

    #[test]
    fn facet_from_in_list_and_or() {
        let rule = rule_json(json!({
            "type": "or",
            "conditions": [
                {"type": "simple", "field": "key", "operator": "eq", "value": "temp"},
                {"type": "simple", "field": "key", "operator": "in", "value": ["rpm", "temp"]}
            ]
        }));
        let compiled = CompiledRule::compile(rule).unwrap();
        assert_eq!(compiled.keys, vec!["rpm", "temp"]);
    }

    #[test]
    fn or_with_unpinned_branch_is_wildcard() {
        let rule = rule_json(json!({
            "type": "or",
            "conditions": [
                {"type": "simple", "field": "device_id", "operator": "eq", "value": "d1"},
                {"type": "simple", "field": "value", "operator": "gt", "value": 10}
            ]
        }));
        let compiled = CompiledRule::compile(rule).unwrap();
        assert!(compiled.devices.is_empty());
    }

    #[test]
    fn data_class_explicit_and_inferred() {
        let mut rule = rule_json(json!({
            "type": "simple", "field": "value.latitude", "operator": "gt", "value": 50
        }));
        rule.data_type = Some("location".to_string());
        assert_eq!(
            CompiledRule::compile(rule.clone()).unwrap().data_class,
            Some(DataClass::Location),
        );

        // unknown short string falls back to inference over field paths
        rule.data_type = Some("gps".to_string());
        assert_eq!(
            CompiledRule::compile(rule).unwrap().data_class,
            Some(DataClass::Location),
        );
    }

    #[test]
    fn content_eq_ignores_bookkeeping() {
        let a = rule_json(json!({
            "type": "simple", "field": "value", "operator": "gt", "value": 1
        }));
        let mut b = a.clone();
        b.version = 7;
        b.updated_at = Some(Utc::now());
        assert!(a.content_eq(&b));

        b.priority = 5;
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn validate_rejects_empty_actions() {
        let mut rule = rule_json(json!({
            "type": "simple", "field": "value", "operator": "gt", "value": 1
        }));
        rule.actions.clear();
        assert!(rule.validate().is_err());
    }
}
