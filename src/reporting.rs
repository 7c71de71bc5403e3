//! Analysis persistence and report filing. Every violation is written to
//! the analyses table whether or not anything is reported; the report
//! itself is deduplicated by a deterministic key so re-running the same
//! outcome can never file twice.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::client::ModerationApi;
use crate::domains::DomainTracker;
use crate::enforcement::Enforcer;
use crate::model::{ActionType, ScanOutcome};
use crate::rule_store::RuleStore;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ReportingOptions {
    pub policy_version: String,
    pub report_category: String,
    pub forward_remote_reports: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct AnalyzeSummary {
    pub analyses_written: usize,
    pub actions_dispatched: usize,
    pub report_filed: bool,
}

pub struct ReportPipeline {
    store: Store,
    api: Arc<dyn ModerationApi>,
    rules: Arc<RuleStore>,
    enforcer: Arc<Enforcer>,
    domains: Arc<DomainTracker>,
    options: ReportingOptions,
}

/// Field order is the canonical order; the digest depends on it.
#[derive(Serialize)]
struct DedupeInput<'a> {
    account_id: &'a str,
    hit_count: usize,
    policy_version: &'a str,
    ruleset_sha: &'a str,
    status_ids: &'a [String],
}

pub fn make_dedupe_key(
    account_id: &str,
    hit_count: usize,
    policy_version: &str,
    ruleset_sha: &str,
    status_ids: &[String],
) -> String {
    let input = DedupeInput {
        account_id,
        hit_count,
        policy_version,
        ruleset_sha,
        status_ids,
    };
    let canonical = serde_json::to_string(&input).expect("dedupe input serializes");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

impl ReportPipeline {
    pub fn new(
        store: Store,
        api: Arc<dyn ModerationApi>,
        rules: Arc<RuleStore>,
        enforcer: Arc<Enforcer>,
        domains: Arc<DomainTracker>,
        options: ReportingOptions,
    ) -> Self {
        ReportPipeline {
            store,
            api,
            rules,
            enforcer,
            domains,
            options,
        }
    }

    /// Persist the outcome's violations, dispatch per-rule actions, and file
    /// a report when the aggregate score clears the threshold.
    pub async fn analyze_and_maybe_report(&self, outcome: &ScanOutcome) -> Result<AnalyzeSummary> {
        let snapshot = self.rules.snapshot()?;
        let account_id = &outcome.account.id;
        let mut summary = AnalyzeSummary::default();

        for violation in &outcome.violations {
            let evidence = serde_json::to_value(&violation.evidence)?;
            let status_id = violation.evidence.matched_status_ids.first().cloned();
            self.store.insert_analysis(
                account_id,
                status_id.as_deref(),
                &violation.rule_key,
                violation.score,
                &evidence,
            )?;
            summary.analyses_written += 1;
            self.rules.record_trigger(violation.rule_id, &evidence)?;

            // Non-report actions dispatch per rule, gated on that rule's own
            // trigger threshold.
            if let Some(loaded) = snapshot.rules.iter().find(|r| r.rule.id == violation.rule_id)
            {
                if loaded.rule.action_type != ActionType::Report
                    && violation.score >= loaded.rule.trigger_threshold
                {
                    self.enforcer
                        .perform_action(&loaded.rule, account_id, &evidence)
                        .await?;
                    summary.actions_dispatched += 1;
                }
            }
        }

        if outcome.score >= snapshot.report_threshold {
            // Domain accounting only counts outcomes that cleared the report
            // threshold; sub-threshold noise must not accrue toward
            // defederation.
            let domain = outcome.account.domain();
            if domain != "local" {
                self.domains.track_violation(&domain)?;
            }
            summary.report_filed = self.file_report(outcome, &snapshot.fingerprint).await?;
        }
        Ok(summary)
    }

    async fn file_report(&self, outcome: &ScanOutcome, ruleset_sha: &str) -> Result<bool> {
        let account_id = &outcome.account.id;
        let status_ids = outcome.involved_status_ids();
        let dedupe_key = make_dedupe_key(
            account_id,
            outcome.violations.len(),
            &self.options.policy_version,
            ruleset_sha,
            &status_ids,
        );

        let hits: Vec<&str> = outcome
            .violations
            .iter()
            .map(|v| v.rule_key.as_str())
            .collect();
        let comment = format!(
            "[AUTO] score={:.2}; hits={}",
            outcome.score,
            hits.join(",")
        );

        let inserted =
            self.store
                .insert_report_if_new(account_id, status_ids.first().map(String::as_str), &dedupe_key, &comment)?;
        if !inserted {
            // Already filed, unless an earlier attempt died between the row
            // insert and the upstream call. Only that gap is worth retrying.
            let existing = self.store.report_by_key(&dedupe_key)?;
            let needs_backfill = existing
                .as_ref()
                .map_or(false, |r| r.remote_report_id.is_none());
            if !needs_backfill || self.options.dry_run {
                log::debug!("report {dedupe_key} already filed for account {account_id}");
                return Ok(false);
            }
        }

        if self.options.dry_run {
            log::info!("dry run: would report account {account_id}: {comment}");
            return Ok(inserted);
        }

        let forward = self.options.forward_remote_reports && outcome.account.domain() != "local";
        let remote = self
            .api
            .create_report(
                account_id,
                &status_ids,
                &comment,
                &self.options.report_category,
                forward,
            )
            .await
            .with_context(|| format!("filing report for account {account_id}"))?;
        self.store.set_remote_report_id(&dedupe_key, &remote.id)?;
        log::info!("filed report {} for account {account_id}", remote.id);
        Ok(true)
    }
}
