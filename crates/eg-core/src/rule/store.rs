use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use orion_error::prelude::*;

use crate::error::{CoreError, CoreReason, CoreResult};
use crate::reading::Reading;

use super::model::{CompiledRule, DataClass, Rule};

// ---------------------------------------------------------------------------
// RuleSet — one immutable snapshot with its indexes
// ---------------------------------------------------------------------------

/// Compiled rule snapshot. Readers acquire it once per reading evaluation
/// and hold it until done; installs replace the whole set atomically.
pub struct RuleSet {
    /// Sorted by (priority, id). Disabled rules are kept (for version
    /// bookkeeping) but never indexed.
    rules: Vec<Arc<CompiledRule>>,
    by_device: HashMap<String, Vec<usize>>,
    wildcard_device: Vec<usize>,
    by_key: HashMap<String, Vec<usize>>,
    wildcard_key: Vec<usize>,
    by_class: HashMap<DataClass, Vec<usize>>,
    pub version: u64,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            by_device: HashMap::new(),
            wildcard_device: Vec::new(),
            by_key: HashMap::new(),
            wildcard_key: Vec::new(),
            by_class: HashMap::new(),
            version: 0,
        }
    }

    /// Compile and index a rule list. Any structural failure (duplicate id,
    /// bad condition, bad action) rejects the whole snapshot.
    pub fn compile(mut rules: Vec<Rule>, version: u64) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id.clone()) {
                return Err(StructError::from(CoreReason::Config)
                    .with_detail(format!("duplicate rule id {:?}", rule.id)));
            }
        }
        rules.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

        let compiled: Vec<Arc<CompiledRule>> = rules
            .into_iter()
            .map(|r| CompiledRule::compile(r).map(Arc::new))
            .collect::<CoreResult<_>>()?;

        let mut set = Self {
            rules: compiled,
            by_device: HashMap::new(),
            wildcard_device: Vec::new(),
            by_key: HashMap::new(),
            wildcard_key: Vec::new(),
            by_class: HashMap::new(),
            version,
        };

        for (idx, rule) in set.rules.iter().enumerate() {
            if !rule.rule.enabled {
                continue;
            }
            if rule.devices.is_empty() {
                set.wildcard_device.push(idx);
            } else {
                for device in &rule.devices {
                    set.by_device.entry(device.clone()).or_default().push(idx);
                }
            }
            if rule.keys.is_empty() {
                set.wildcard_key.push(idx);
            } else {
                for key in &rule.keys {
                    set.by_key.entry(key.clone()).or_default().push(idx);
                }
            }
            if let Some(class) = rule.data_class {
                set.by_class.entry(class).or_default().push(idx);
            }
        }

        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.iter().any(|r| r.rule.id == rule_id)
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|r| r.rule.id == rule_id)
    }

    /// Candidate rules for one reading: the intersection of the device
    /// bucket (specific ∪ wildcard), the key bucket, and the data-class
    /// bucket, in (priority, id) order.
    pub fn candidates(&self, reading: &Reading) -> Vec<Arc<CompiledRule>> {
        let mut device_idx: BTreeSet<usize> = self.wildcard_device.iter().copied().collect();
        if let Some(pinned) = self.by_device.get(&reading.device_id) {
            device_idx.extend(pinned.iter().copied());
        }

        let mut key_idx: HashSet<usize> = self.wildcard_key.iter().copied().collect();
        if let Some(pinned) = self.by_key.get(&reading.key) {
            key_idx.extend(pinned.iter().copied());
        }

        let reading_class = DataClass::of_value(&reading.value);

        device_idx
            .into_iter()
            .filter(|idx| key_idx.contains(idx))
            .map(|idx| &self.rules[idx])
            .filter(|rule| match rule.data_class {
                None => true,
                Some(class) => reading_class == Some(class),
            })
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RuleStore — atomic snapshot holder
// ---------------------------------------------------------------------------

/// Holds the live snapshot behind an atomic pointer swap. In-flight
/// evaluations keep the `Arc` they acquired; removed rules stop matching
/// new readings the moment a new snapshot installs.
pub struct RuleStore {
    current: ArcSwap<RuleSet>,
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::empty()),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Validate, version-reconcile, compile, and atomically install a new
    /// rule list. On error the running snapshot is untouched.
    pub fn install(&self, mut rules: Vec<Rule>) -> CoreResult<Arc<RuleSet>> {
        let prev = self.snapshot();
        reconcile_versions(&mut rules, &prev);
        let next = Arc::new(RuleSet::compile(rules, prev.version + 1)?);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }
}

/// Carry version/created_at across reloads: unchanged content keeps its
/// version; changed content increments it.
fn reconcile_versions(rules: &mut [Rule], prev: &RuleSet) {
    let now = Utc::now();
    for rule in rules.iter_mut() {
        match prev.get(&rule.id) {
            Some(old) => {
                rule.created_at = old.rule.created_at;
                if rule.content_eq(&old.rule) {
                    rule.version = old.rule.version;
                    rule.updated_at = old.rule.updated_at;
                } else {
                    rule.version = old.rule.version + 1;
                    rule.updated_at = Some(now);
                }
            }
            None => {
                rule.version = rule.version.max(1);
                rule.created_at.get_or_insert(now);
                rule.updated_at.get_or_insert(now);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Directory loading
// ---------------------------------------------------------------------------

/// Load every `*.json` rule file in `dir` (each an array of rules), sorted
/// by file name for deterministic order.
pub fn load_rules_dir(dir: &Path) -> CoreResult<Vec<Rule>> {
    let paths = eg_config::resolve_glob("*.json", dir)
        .map_err(|e| config_err(format!("scan rules dir {}: {e}", dir.display())))?;

    let mut rules = Vec::new();
    for path in paths {
        let body = std::fs::read_to_string(&path)
            .map_err(|e| config_err(format!("read {}: {e}", path.display())))?;
        let mut file_rules: Vec<Rule> = serde_json::from_str(&body)
            .map_err(|e| config_err(format!("parse {}: {e}", path.display())))?;
        rules.append(&mut file_rules);
    }
    Ok(rules)
}

fn config_err(detail: impl Into<String>) -> CoreError {
    StructError::from(CoreReason::Config).with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
