//! Scan orchestration: paged account polling with persisted cursors, and
//! per-account evaluation guarded by a content-hash cache. A cached result
//! is reused only while its ruleset fingerprint is current and the row has
//! not been flagged for rescan.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::client::ModerationApi;
use crate::error;
use crate::model::{AdminAccount, ScanOutcome, SessionType, Violation};
use crate::rule_store::RuleStore;
use crate::store::Store;

/// Pause before the single in-poll retry of a failed listing call.
const LISTING_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub max_pages_per_poll: u32,
    pub batch_size: u32,
    pub max_statuses_to_fetch: u32,
    pub scan_cache_ttl_days: i64,
}

#[derive(Debug, Default)]
pub struct PollStats {
    pub session_id: i64,
    pub accounts_seen: usize,
    pub cache_hits: usize,
    pub completed: bool,
}

pub struct Scanner {
    store: Store,
    api: Arc<dyn ModerationApi>,
    rules: Arc<RuleStore>,
    limits: ScanLimits,
}

/// Digest of the scan-relevant profile surface. serde_json maps serialize
/// with sorted keys, so the canonical form is stable.
pub fn content_hash(account: &AdminAccount) -> String {
    let profile = &account.account;
    let fields: Vec<[&str; 2]> = profile
        .fields
        .iter()
        .map(|f| [f.name.as_str(), f.value.as_str()])
        .collect();
    let canonical = serde_json::json!({
        "username": profile.username,
        "display_name": profile.display_name,
        "note": profile.note,
        "avatar": profile.avatar,
        "header": profile.header,
        "fields": fields,
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

impl Scanner {
    pub fn new(
        store: Store,
        api: Arc<dyn ModerationApi>,
        rules: Arc<RuleStore>,
        limits: ScanLimits,
    ) -> Self {
        Scanner {
            store,
            api,
            rules,
            limits,
        }
    }

    /// Evaluate one account against the current ruleset. Returns None on a
    /// cache hit or when nothing scored.
    pub async fn scan_account(&self, account: &AdminAccount) -> Result<Option<ScanOutcome>> {
        let snapshot = self.rules.snapshot()?;
        let hash = content_hash(account);

        if let Some(cached) = self.store.get_content_scan(&hash)? {
            if !cached.needs_rescan && cached.rules_version.as_deref() == Some(&snapshot.fingerprint)
            {
                log::debug!("cache hit for account {}", account.id);
                return Ok(None);
            }
        }

        let posts = self
            .api
            .list_account_posts(&account.id, self.limits.max_statuses_to_fetch)
            .await
            .with_context(|| format!("fetching posts for account {}", account.id))?;

        let mut violations: Vec<Violation> = Vec::new();
        for loaded in &snapshot.rules {
            violations.extend(loaded.evaluate(account, &posts));
        }
        let score: f64 = violations.iter().map(|v| v.score).sum();

        let result = serde_json::json!({
            "score": score,
            "violations": violations,
        });
        self.store
            .upsert_content_scan(&hash, &account.id, &result, &snapshot.fingerprint)?;
        self.store.record_account_scan(&account.id, &hash)?;

        if score > 0.0 {
            Ok(Some(ScanOutcome {
                account: account.clone(),
                score,
                violations,
            }))
        } else {
            Ok(None)
        }
    }

    /// Walk up to `max_pages_per_poll` pages of one account stream,
    /// persisting the cursor after each page so the next poll resumes where
    /// this one stopped. Scored accounts are appended to `outcomes`.
    pub async fn poll(
        &self,
        session_type: SessionType,
        outcomes: &mut Vec<ScanOutcome>,
    ) -> Result<PollStats> {
        let origin = session_type.as_str();
        let snapshot = self.rules.snapshot()?;
        let session_id = self.store.start_session(
            session_type,
            &serde_json::json!({"rules_version": snapshot.fingerprint}),
        )?;
        let cursor_name = format!("{origin}_accounts");
        let mut cursor = self
            .store
            .cursor_position(&cursor_name)?
            .filter(|c| !c.is_empty());

        let mut stats = PollStats {
            session_id,
            ..PollStats::default()
        };

        for page_index in 0..self.limits.max_pages_per_poll {
            let page = match self
                .api
                .list_admin_accounts(origin, "active", cursor.as_deref(), self.limits.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) if error::is_retryable(&e) => {
                    // One retry after a short pause covers a blip; anything
                    // worse is handed to the job-level backoff.
                    log::warn!("{origin} account listing failed, retrying once: {e:#}");
                    tokio::time::sleep(LISTING_RETRY_DELAY).await;
                    match self
                        .api
                        .list_admin_accounts(
                            origin,
                            "active",
                            cursor.as_deref(),
                            self.limits.batch_size,
                        )
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => {
                            self.store.finish_session(session_id, "failed")?;
                            return Err(e.context(format!("{origin} poll failed")));
                        }
                    }
                }
                Err(e) => {
                    self.store.finish_session(session_id, "failed")?;
                    return Err(e.context(format!("{origin} poll failed")));
                }
            };

            if page_index == 0 {
                // Estimate only: first page size extrapolated over the page limit.
                let estimate =
                    page.accounts.len() as i64 * i64::from(self.limits.max_pages_per_poll);
                self.store.set_session_total(session_id, estimate)?;
            }

            for account in &page.accounts {
                self.store.upsert_account(account)?;
                match self.scan_account(account).await {
                    Ok(Some(outcome)) => outcomes.push(outcome),
                    Ok(None) => stats.cache_hits += 1,
                    Err(e) => {
                        // A single unscannable account is logged and skipped.
                        log::error!("failed to scan account {}: {e:#}", account.id)
                    }
                }
                stats.accounts_seen += 1;
                self.store.bump_session_progress(session_id, &account.id)?;
            }

            cursor = page.next_cursor;
            self.store
                .save_cursor(&cursor_name, cursor.as_deref().unwrap_or(""))?;
            self.store.set_session_cursor(session_id, cursor.as_deref())?;

            if cursor.is_none() {
                stats.completed = true;
                break;
            }
        }

        if stats.completed {
            self.store.finish_session(session_id, "completed")?;
            log::info!(
                "{origin} poll completed, {} accounts seen, {} cache hits",
                stats.accounts_seen,
                stats.cache_hits
            );
        } else {
            log::info!(
                "{origin} poll paused at page limit, {} accounts seen",
                stats.accounts_seen
            );
        }
        Ok(stats)
    }

    /// Re-scan known accounts across previously seen remote domains. Works
    /// from the accounts table instead of the admin listing, so coverage
    /// grows as ordinary polls discover accounts.
    pub async fn poll_federated(&self, outcomes: &mut Vec<ScanOutcome>) -> Result<PollStats> {
        let snapshot = self.rules.snapshot()?;
        let session_id = self.store.start_session(
            SessionType::Federated,
            &serde_json::json!({"rules_version": snapshot.fingerprint}),
        )?;
        let mut stats = PollStats {
            session_id,
            ..PollStats::default()
        };

        let domains = self.store.known_domains(self.limits.batch_size)?;
        let mut pending = Vec::new();
        for domain in &domains {
            pending.extend(self.store.accounts_for_domain(domain, self.limits.batch_size)?);
        }
        self.store.set_session_total(session_id, pending.len() as i64)?;

        for known in &pending {
            let account = known.to_admin_account();
            match self.scan_account(&account).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => stats.cache_hits += 1,
                Err(e) => log::error!("failed to scan account {}: {e:#}", account.id),
            }
            stats.accounts_seen += 1;
            self.store.bump_session_progress(session_id, &account.id)?;
        }

        stats.completed = true;
        self.store.finish_session(session_id, "completed")?;
        log::info!(
            "federated sweep completed, {} domains, {} accounts seen, {} cache hits",
            domains.len(),
            stats.accounts_seen,
            stats.cache_hits
        );
        Ok(stats)
    }

    /// Time-driven cache invalidation: flag rows older than the TTL.
    pub fn expire_stale_scans(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(self.limits.scan_cache_ttl_days);
        let flagged = self.store.mark_scans_stale_before(cutoff)?;
        if flagged > 0 {
            log::info!("{flagged} cached scans aged out");
        }
        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProfileField, TargetField};
    use crate::test_support::{account_with_bio, keyword_spec, post, remote_account, MockApi};
    use std::time::Duration as StdDuration;

    fn limits() -> ScanLimits {
        ScanLimits {
            max_pages_per_poll: 3,
            batch_size: 20,
            max_statuses_to_fetch: 5,
            scan_cache_ttl_days: 7,
        }
    }

    fn scanner_with(api: Arc<MockApi>) -> (Scanner, Store, Arc<RuleStore>) {
        let store = Store::open_in_memory().unwrap();
        let rules = Arc::new(RuleStore::new(
            store.clone(),
            StdDuration::from_secs(300),
            1.0,
        ));
        let scanner = Scanner::new(store.clone(), api, rules.clone(), limits());
        (scanner, store, rules)
    }

    #[test]
    fn content_hash_tracks_profile_surface() {
        let a = account_with_bio("hello");
        let b = account_with_bio("hello");
        assert_eq!(content_hash(&a), content_hash(&b));

        let changed = account_with_bio("different bio");
        assert_ne!(content_hash(&a), content_hash(&changed));

        let mut with_field = account_with_bio("hello");
        with_field.account.fields.push(ProfileField {
            name: "site".to_string(),
            value: "https://spam.example".to_string(),
        });
        assert_ne!(content_hash(&a), content_hash(&with_field));
    }

    #[tokio::test]
    async fn matching_account_yields_outcome() {
        let api = Arc::new(MockApi::new());
        let (scanner, _store, rules) = scanner_with(api.clone());
        let mut spec = keyword_spec("casino", 2.0);
        spec.target_fields = Some(vec![TargetField::Bio]);
        rules.create_rule(&spec, "admin").unwrap();

        let account = account_with_bio("best casino in town");
        let outcome = scanner.scan_account(&account).await.unwrap().unwrap();
        assert_eq!(outcome.score, 2.0);
        assert_eq!(outcome.violations.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_account_hits_cache() {
        let api = Arc::new(MockApi::new());
        let (scanner, store, rules) = scanner_with(api.clone());
        rules.create_rule(&keyword_spec("casino", 2.0), "admin").unwrap();

        let account = account_with_bio("best casino in town");
        assert!(scanner.scan_account(&account).await.unwrap().is_some());
        // Second pass with identical content: cache hit, no outcome.
        assert!(scanner.scan_account(&account).await.unwrap().is_none());
        assert_eq!(store.content_scan_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn rule_change_invalidates_cache() {
        let api = Arc::new(MockApi::new());
        let (scanner, _store, rules) = scanner_with(api.clone());
        rules.create_rule(&keyword_spec("casino", 2.0), "admin").unwrap();

        let account = account_with_bio("best casino in town");
        assert!(scanner.scan_account(&account).await.unwrap().is_some());

        // New rule: fingerprint moves and every row is flagged, so the same
        // content is evaluated again.
        rules.create_rule(&keyword_spec("adult", 1.0), "admin").unwrap();
        let outcome = scanner.scan_account(&account).await.unwrap().unwrap();
        assert_eq!(outcome.score, 2.0);
    }

    #[tokio::test]
    async fn zero_score_accounts_are_cached_but_not_enqueued() {
        let api = Arc::new(MockApi::new());
        let (scanner, store, rules) = scanner_with(api.clone());
        rules.create_rule(&keyword_spec("casino", 2.0), "admin").unwrap();

        let account = account_with_bio("nothing to see");
        assert!(scanner.scan_account(&account).await.unwrap().is_none());
        assert_eq!(store.content_scan_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn poll_persists_cursor_between_pages() {
        let api = Arc::new(MockApi::new());
        let (scanner, store, rules) = scanner_with(api.clone());
        let mut spec = keyword_spec("casino", 2.0);
        spec.target_fields = Some(vec![TargetField::Bio]);
        rules.create_rule(&spec, "admin").unwrap();

        let mut spammer = account_with_bio("casino here");
        spammer.id = "s1".to_string();
        spammer.account.id = "s1".to_string();
        api.set_posts("s1", vec![post("p1", "hello")]);
        api.push_page("remote", vec![spammer], Some("cursor-2"));
        api.push_page("remote", vec![account_with_bio("clean")], None);

        let mut outcomes = Vec::new();
        let stats = scanner.poll(SessionType::Remote, &mut outcomes).await.unwrap();

        assert!(stats.completed);
        assert_eq!(stats.accounts_seen, 2);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].account.id, "s1");
        // Exhausted stream resets the cursor.
        assert_eq!(
            store.cursor_position("remote_accounts").unwrap().as_deref(),
            Some("")
        );
        let session = store.get_session(stats.session_id).unwrap().unwrap();
        assert_eq!(session.status, "completed");
        assert_eq!(session.accounts_processed, 2);
    }

    #[tokio::test]
    async fn poll_stops_at_page_limit() {
        let api = Arc::new(MockApi::new());
        let (scanner, store, _rules) = scanner_with(api.clone());
        for i in 0..4 {
            api.push_page(
                "remote",
                vec![account_with_bio("clean")],
                Some(&format!("c{i}")),
            );
        }

        let mut outcomes = Vec::new();
        let stats = scanner.poll(SessionType::Remote, &mut outcomes).await.unwrap();
        assert!(!stats.completed);
        assert_eq!(stats.accounts_seen, 3);
        assert_eq!(
            store.cursor_position("remote_accounts").unwrap().as_deref(),
            Some("c2")
        );
        // The session stays active for the next poll to pick up.
        let session = store.get_session(stats.session_id).unwrap().unwrap();
        assert_eq!(session.status, "active");
        // One-account pages extrapolate over the three-page limit.
        assert_eq!(session.total_accounts, Some(3));
    }

    #[tokio::test]
    async fn federated_sweep_rescans_known_remote_accounts() {
        let api = Arc::new(MockApi::new());
        let (scanner, store, rules) = scanner_with(api.clone());
        rules.create_rule(&keyword_spec("casino", 2.0), "admin").unwrap();

        store
            .upsert_account(&remote_account("r1", "spammer@bad.example"))
            .unwrap();
        // Local accounts belong to the local poll, not the sweep.
        store.upsert_account(&account_with_bio("clean")).unwrap();
        api.set_posts("r1", vec![post("p1", "casino night")]);

        let mut outcomes = Vec::new();
        let stats = scanner.poll_federated(&mut outcomes).await.unwrap();
        assert!(stats.completed);
        assert_eq!(stats.accounts_seen, 1);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].account.id, "r1");

        let session = store.get_session(stats.session_id).unwrap().unwrap();
        assert_eq!(session.session_type, "federated");
        assert_eq!(session.status, "completed");
        assert_eq!(session.total_accounts, Some(1));

        // A second sweep over unchanged content is all cache hits.
        let mut again = Vec::new();
        let stats = scanner.poll_federated(&mut again).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_listing_error_is_retried_once() {
        let api = Arc::new(MockApi::new());
        let (scanner, _store, _rules) = scanner_with(api.clone());
        api.push_page_error("remote", "gateway timeout");
        api.push_page("remote", vec![account_with_bio("clean")], None);

        let mut outcomes = Vec::new();
        let stats = scanner.poll(SessionType::Remote, &mut outcomes).await.unwrap();
        assert!(stats.completed);
        assert_eq!(stats.accounts_seen, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_listing_failure_fails_the_session() {
        let api = Arc::new(MockApi::new());
        let (scanner, store, _rules) = scanner_with(api.clone());
        api.push_page_error("remote", "gateway timeout");
        api.push_page_error("remote", "gateway timeout");

        let mut outcomes = Vec::new();
        let err = scanner
            .poll(SessionType::Remote, &mut outcomes)
            .await
            .unwrap_err();
        assert!(crate::error::is_retryable(&err));

        let session = store.get_session(1).unwrap().unwrap();
        assert_eq!(session.status, "failed");
    }
}
