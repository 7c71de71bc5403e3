//! Compiled-rule cache over the rules table. Evaluation paths take an
//! immutable snapshot; mutations go through this type so every change
//! invalidates the cache and flags cached content scans for rescan.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::detectors::LoadedRule;
use crate::model::{Rule, RuleSpec};
use crate::store::Store;

/// An immutable view of the enabled ruleset at one point in time. The
/// fingerprint identifies scan-relevant rule state; results tagged with it
/// stay valid exactly as long as it does not change.
pub struct RuleSnapshot {
    pub rules: Vec<LoadedRule>,
    pub report_threshold: f64,
    pub fingerprint: String,
}

struct Cached {
    snapshot: Arc<RuleSnapshot>,
    loaded_at: Instant,
}

pub struct RuleStore {
    store: Store,
    ttl: Duration,
    default_report_threshold: f64,
    cache: Mutex<Option<Cached>>,
}

impl RuleStore {
    pub fn new(store: Store, ttl: Duration, default_report_threshold: f64) -> Self {
        RuleStore {
            store,
            ttl,
            default_report_threshold,
            cache: Mutex::new(None),
        }
    }

    /// The current compiled ruleset, reloaded from the database when the
    /// cached copy is older than the TTL.
    pub fn snapshot(&self) -> Result<Arc<RuleSnapshot>> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(cached) = cache.as_ref() {
                if cached.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&cached.snapshot));
                }
            }
        }
        let snapshot = Arc::new(self.load()?);
        let mut cache = self.cache.lock().unwrap();
        *cache = Some(Cached {
            snapshot: Arc::clone(&snapshot),
            loaded_at: Instant::now(),
        });
        Ok(snapshot)
    }

    fn load(&self) -> Result<RuleSnapshot> {
        let mut rules = Vec::new();
        for rule in self.store.list_rules(true)? {
            let key = rule.key();
            match LoadedRule::compile(rule) {
                Ok(loaded) => rules.push(loaded),
                // One broken rule must not take the whole ruleset down.
                Err(e) => log::error!("skipping rule {key}: {e}"),
            }
        }
        let fingerprint = fingerprint(&self.store.ruleset_fingerprint_input()?);
        Ok(RuleSnapshot {
            rules,
            report_threshold: self.store.report_threshold(self.default_report_threshold),
            fingerprint,
        })
    }

    pub fn invalidate_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }

    /// Cache drop plus rescan flags; called after every rule mutation.
    fn after_mutation(&self) -> Result<()> {
        self.invalidate_cache();
        let stale = self.store.mark_all_scans_stale()?;
        log::info!("ruleset changed, {stale} cached scans flagged for rescan");
        Ok(())
    }

    /// Create a rule, rejecting specs whose pattern does not compile.
    pub fn create_rule(&self, spec: &RuleSpec, created_by: &str) -> Result<Rule> {
        validate_spec(spec)?;
        let rule = self.store.create_rule(spec, created_by)?;
        self.after_mutation()?;
        Ok(rule)
    }

    pub fn update_rule(&self, id: i64, spec: &RuleSpec, updated_by: &str) -> Result<bool> {
        validate_spec(spec)?;
        let changed = self.store.update_rule(id, spec, updated_by)?;
        if changed {
            self.after_mutation()?;
        }
        Ok(changed)
    }

    pub fn delete_rule(&self, id: i64) -> Result<bool> {
        let deleted = self.store.delete_rule(id)?;
        if deleted {
            self.after_mutation()?;
        }
        Ok(deleted)
    }

    pub fn set_rule_enabled(&self, id: i64, enabled: bool, updated_by: &str) -> Result<bool> {
        let changed = self.store.set_rule_enabled(id, enabled, updated_by)?;
        if changed {
            self.after_mutation()?;
        }
        Ok(changed)
    }

    pub fn record_trigger(&self, rule_id: i64, content: &serde_json::Value) -> Result<()> {
        self.store.record_rule_trigger(rule_id, content)
    }
}

/// Compile the spec as a throwaway rule so bad patterns are rejected at
/// write time instead of surfacing on the next scan.
fn validate_spec(spec: &RuleSpec) -> Result<()> {
    let candidate = Rule {
        id: 0,
        name: spec.name.clone(),
        detector_type: spec.detector_type,
        pattern: spec.pattern.clone(),
        secondary_pattern: spec.secondary_pattern.clone(),
        boolean_operator: spec.boolean_operator,
        weight: spec.weight,
        enabled: spec.enabled,
        action_type: spec.action_type,
        trigger_threshold: spec.trigger_threshold,
        action_duration_seconds: spec.action_duration_seconds,
        action_warning_text: spec.action_warning_text.clone(),
        warning_preset_id: spec.warning_preset_id.clone(),
        target_fields: spec.target_fields.clone(),
        match_options: spec.match_options,
        behavioral_params: spec.behavioral_params.clone(),
        media_params: spec.media_params.clone(),
        description: spec.description.clone(),
        trigger_count: 0,
        last_triggered_at: None,
        created_by: String::new(),
        updated_by: None,
    };
    LoadedRule::compile(candidate)
        .map(|_| ())
        .with_context(|| format!("rule '{}' failed validation", spec.name))
}

/// Hex sha256 over the sorted per-rule lines, `|`-joined.
fn fingerprint(lines: &[String]) -> String {
    hex::encode(Sha256::digest(lines.join("|").as_bytes()))
}
