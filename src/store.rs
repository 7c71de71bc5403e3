//! SQLite persistence for every engine entity. The database is the sole
//! coordination point between workers: uniqueness constraints (content
//! hash, dedupe key, domain, scheduled-action pair) make duplicate work
//! harmless. Transactions stay scoped to a single unit of work.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::model::{
    AccountAction, AdminAccount, DetectorType, Rule, RuleSpec, SessionType,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    detector_type TEXT NOT NULL,
    pattern TEXT NOT NULL,
    secondary_pattern TEXT,
    boolean_operator TEXT,
    weight REAL NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    action_type TEXT NOT NULL,
    trigger_threshold REAL NOT NULL DEFAULT 1.0,
    action_duration_seconds INTEGER,
    action_warning_text TEXT,
    warning_preset_id TEXT,
    target_fields TEXT,
    match_options TEXT,
    behavioral_params TEXT,
    media_params TEXT,
    description TEXT,
    trigger_count INTEGER NOT NULL DEFAULT 0,
    last_triggered_at TEXT,
    last_triggered_content TEXT,
    created_by TEXT NOT NULL DEFAULT 'system',
    updated_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL UNIQUE,
    acct TEXT NOT NULL,
    domain TEXT NOT NULL,
    last_checked_at TEXT,
    content_hash TEXT,
    last_full_scan_at TEXT
);

CREATE TABLE IF NOT EXISTS analyses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    status_id TEXT,
    rule_key TEXT NOT NULL,
    score REAL NOT NULL,
    evidence TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS content_scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_hash TEXT NOT NULL UNIQUE,
    account_id TEXT NOT NULL,
    scan_result TEXT,
    rules_version TEXT,
    needs_rescan INTEGER NOT NULL DEFAULT 0,
    last_scanned_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scan_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    accounts_processed INTEGER NOT NULL DEFAULT 0,
    total_accounts INTEGER,
    current_cursor TEXT,
    last_account_id TEXT,
    rules_applied TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS domain_alerts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL UNIQUE,
    violation_count INTEGER NOT NULL DEFAULT 0,
    last_violation_at TEXT,
    defederation_threshold INTEGER NOT NULL DEFAULT 10,
    is_defederated INTEGER NOT NULL DEFAULT 0,
    defederated_at TEXT,
    defederated_by TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduled_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    action_to_reverse TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(account_id, action_to_reverse)
);

CREATE TABLE IF NOT EXISTS reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    status_id TEXT,
    remote_report_id TEXT,
    dedupe_key TEXT NOT NULL UNIQUE,
    comment TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    target_account_id TEXT NOT NULL,
    rule_id INTEGER,
    evidence TEXT,
    api_response TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cursors (
    name TEXT PRIMARY KEY,
    position TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_by TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS ix_analyses_account ON analyses(account_id);
CREATE INDEX IF NOT EXISTS ix_content_scans_account ON content_scans(account_id);
CREATE INDEX IF NOT EXISTS ix_content_scans_needs_rescan ON content_scans(needs_rescan);
CREATE INDEX IF NOT EXISTS ix_scan_sessions_type_status ON scan_sessions(session_type, status);
CREATE INDEX IF NOT EXISTS ix_scheduled_actions_expiry ON scheduled_actions(expires_at);
CREATE INDEX IF NOT EXISTS ix_domain_alerts_count ON domain_alerts(violation_count);
";

fn ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn now_ts() -> String {
    ts(Utc::now())
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[derive(Debug, Clone)]
pub struct ContentScanRow {
    pub content_hash: String,
    pub account_id: String,
    pub rules_version: Option<String>,
    pub needs_rescan: bool,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub session_type: String,
    pub status: String,
    pub accounts_processed: i64,
    pub total_accounts: Option<i64>,
    pub current_cursor: Option<String>,
    pub last_account_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KnownAccount {
    pub account_id: String,
    pub acct: String,
}

impl KnownAccount {
    /// Minimal profile reconstruction for rescans from the accounts table.
    /// The full acct string stands in for the username so content hashes
    /// stay distinct per account.
    pub fn to_admin_account(&self) -> AdminAccount {
        let mut account = AdminAccount::default();
        account.id = self.account_id.clone();
        account.account.id = self.account_id.clone();
        account.account.username = self.acct.clone();
        account.account.acct = self.acct.clone();
        account
    }
}

#[derive(Debug, Clone)]
pub struct DomainAlertRow {
    pub domain: String,
    pub violation_count: i64,
    pub defederation_threshold: i64,
    pub is_defederated: bool,
    pub defederated_by: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduledActionRow {
    pub id: i64,
    pub account_id: String,
    pub action_to_reverse: AccountAction,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct ReportRow {
    pub id: i64,
    pub account_id: String,
    pub remote_report_id: Option<String>,
    pub dedupe_key: String,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub action_type: String,
    pub target_account_id: String,
    pub rule_id: Option<i64>,
    pub api_response: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RuleTriggerStats {
    pub id: i64,
    pub name: String,
    pub detector_type: String,
    pub enabled: bool,
    pub trigger_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

/// Handle to the engine database. Cheap to clone; all clones share one
/// connection behind a mutex.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Clone for Store {
    fn clone(&self) -> Self {
        Store {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize schema")?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---- config -----------------------------------------------------------

    pub fn get_config_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM config WHERE key = ?", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn set_config_value(
        &self,
        key: &str,
        value: &serde_json::Value,
        updated_by: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO config (key, value, updated_by, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                 updated_by = excluded.updated_by, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, updated_by, now_ts()],
        )?;
        Ok(())
    }

    /// Boolean config flag, false when missing or not a boolean.
    pub fn config_flag(&self, key: &str) -> bool {
        match self.get_config_value(key) {
            Ok(Some(serde_json::Value::Bool(b))) => b,
            Ok(Some(serde_json::Value::Object(map))) => map
                .get("enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn report_threshold(&self, fallback: f64) -> f64 {
        match self.get_config_value("report_threshold") {
            Ok(Some(v)) => v
                .as_f64()
                .or_else(|| v.get("threshold").and_then(|t| t.as_f64()))
                .unwrap_or(fallback),
            _ => fallback,
        }
    }

    // ---- accounts ---------------------------------------------------------

    pub fn upsert_account(&self, account: &AdminAccount) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (account_id, acct, domain, last_checked_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET acct = excluded.acct,
                 domain = excluded.domain, last_checked_at = excluded.last_checked_at",
            params![
                account.id,
                account.account.acct,
                account.domain(),
                now_ts()
            ],
        )?;
        Ok(())
    }

    /// Distinct remote domains seen by earlier polls.
    pub fn known_domains(&self, limit: u32) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT domain FROM accounts WHERE domain != 'local'
             ORDER BY domain LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![limit], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn accounts_for_domain(&self, domain: &str, limit: u32) -> Result<Vec<KnownAccount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT account_id, acct FROM accounts WHERE domain = ?
             ORDER BY account_id LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![domain, limit], |r| {
                Ok(KnownAccount {
                    account_id: r.get(0)?,
                    acct: r.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_account_scan(&self, account_id: &str, content_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET content_hash = ?, last_full_scan_at = ? WHERE account_id = ?",
            params![content_hash, now_ts(), account_id],
        )?;
        Ok(())
    }

    // ---- cursors ----------------------------------------------------------

    pub fn cursor_position(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let pos: Option<Option<String>> = conn
            .query_row(
                "SELECT position FROM cursors WHERE name = ?",
                params![name],
                |r| r.get(0),
            )
            .optional()?;
        Ok(pos.flatten())
    }

    pub fn save_cursor(&self, name: &str, position: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cursors (name, position, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET position = excluded.position,
                 updated_at = excluded.updated_at",
            params![name, position, now_ts()],
        )?;
        Ok(())
    }

    // ---- content scans ----------------------------------------------------

    pub fn get_content_scan(&self, content_hash: &str) -> Result<Option<ContentScanRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT content_hash, account_id, rules_version, needs_rescan
                 FROM content_scans WHERE content_hash = ?",
                params![content_hash],
                |r| {
                    Ok(ContentScanRow {
                        content_hash: r.get(0)?,
                        account_id: r.get(1)?,
                        rules_version: r.get(2)?,
                        needs_rescan: r.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Insert or refresh the cache row for this content hash. Rescanning
    /// clears `needs_rescan`.
    pub fn upsert_content_scan(
        &self,
        content_hash: &str,
        account_id: &str,
        scan_result: &serde_json::Value,
        rules_version: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO content_scans
                 (content_hash, account_id, scan_result, rules_version, needs_rescan, last_scanned_at)
             VALUES (?, ?, ?, ?, 0, ?)
             ON CONFLICT(content_hash) DO UPDATE SET
                 scan_result = excluded.scan_result,
                 rules_version = excluded.rules_version,
                 needs_rescan = 0,
                 last_scanned_at = excluded.last_scanned_at",
            params![
                content_hash,
                account_id,
                serde_json::to_string(scan_result)?,
                rules_version,
                now_ts()
            ],
        )?;
        Ok(())
    }

    /// Rule-driven invalidation: every cached scan must be redone.
    pub fn mark_all_scans_stale(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("UPDATE content_scans SET needs_rescan = 1", [])?)
    }

    /// Time-driven invalidation: only rows last scanned before the cutoff.
    pub fn mark_scans_stale_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(
            "UPDATE content_scans SET needs_rescan = 1 WHERE last_scanned_at < ?",
            params![ts(cutoff)],
        )?)
    }

    #[cfg(test)]
    pub fn backdate_content_scan(&self, content_hash: &str, to: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE content_scans SET last_scanned_at = ? WHERE content_hash = ?",
            params![ts(to), content_hash],
        )?;
        Ok(())
    }

    pub fn content_scan_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM content_scans", [], |r| r.get(0))?)
    }

    // ---- scan sessions ----------------------------------------------------

    /// Reuse the active session for this type, or start a fresh one.
    pub fn start_session(
        &self,
        session_type: SessionType,
        rules_applied: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM scan_sessions WHERE session_type = ? AND status = 'active'
                 ORDER BY id LIMIT 1",
                params![session_type.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO scan_sessions (session_type, status, rules_applied, started_at)
             VALUES (?, 'active', ?, ?)",
            params![
                session_type.as_str(),
                serde_json::to_string(rules_applied)?,
                now_ts()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_session(&self, session_id: i64, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_sessions SET status = ?, completed_at = ? WHERE id = ?",
            params![status, now_ts(), session_id],
        )?;
        Ok(())
    }

    pub fn bump_session_progress(&self, session_id: i64, last_account_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_sessions SET accounts_processed = accounts_processed + 1,
                 last_account_id = ? WHERE id = ?",
            params![last_account_id, session_id],
        )?;
        Ok(())
    }

    pub fn set_session_total(&self, session_id: i64, total: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_sessions SET total_accounts = ? WHERE id = ?",
            params![total, session_id],
        )?;
        Ok(())
    }

    pub fn set_session_cursor(&self, session_id: i64, cursor: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scan_sessions SET current_cursor = ? WHERE id = ?",
            params![cursor, session_id],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: i64) -> Result<Option<SessionRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, session_type, status, accounts_processed, total_accounts,
                        current_cursor, last_account_id
                 FROM scan_sessions WHERE id = ?",
                params![session_id],
                |r| {
                    Ok(SessionRow {
                        id: r.get(0)?,
                        session_type: r.get(1)?,
                        status: r.get(2)?,
                        accounts_processed: r.get(3)?,
                        total_accounts: r.get(4)?,
                        current_cursor: r.get(5)?,
                        last_account_id: r.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---- domain alerts ----------------------------------------------------

    pub fn record_domain_violation(
        &self,
        domain: &str,
        default_threshold: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ts();
        conn.execute(
            "INSERT INTO domain_alerts
                 (domain, violation_count, last_violation_at, defederation_threshold,
                  created_at, updated_at)
             VALUES (?, 1, ?, ?, ?, ?)
             ON CONFLICT(domain) DO UPDATE SET
                 violation_count = violation_count + 1,
                 last_violation_at = excluded.last_violation_at,
                 updated_at = excluded.updated_at",
            params![domain, now, default_threshold, now, now],
        )?;
        Ok(())
    }

    pub fn get_domain_alert(&self, domain: &str) -> Result<Option<DomainAlertRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT domain, violation_count, defederation_threshold, is_defederated,
                        defederated_by, notes
                 FROM domain_alerts WHERE domain = ?",
                params![domain],
                map_domain_alert,
            )
            .optional()?;
        Ok(row)
    }

    /// Flip the defederation flag, only if it was still unset. Returns true
    /// when this call performed the flip.
    pub fn mark_defederated(&self, domain: &str, actor: &str, notes: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE domain_alerts SET is_defederated = 1, defederated_at = ?,
                 defederated_by = ?, notes = ?, updated_at = ?
             WHERE domain = ? AND is_defederated = 0",
            params![now_ts(), actor, notes, now_ts(), domain],
        )?;
        Ok(changed > 0)
    }

    pub fn list_domain_alerts(&self, limit: u32) -> Result<Vec<DomainAlertRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT domain, violation_count, defederation_threshold, is_defederated,
                    defederated_by, notes
             FROM domain_alerts ORDER BY violation_count DESC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![limit], map_domain_alert)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ---- scheduled actions ------------------------------------------------

    /// Create or extend the pending reversal for (account, action). The
    /// expiry only ever moves forward.
    pub fn schedule_reversal(
        &self,
        account_id: &str,
        action: AccountAction,
        expires_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_actions (account_id, action_to_reverse, expires_at, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, action_to_reverse) DO UPDATE SET
                 expires_at = MAX(expires_at, excluded.expires_at)",
            params![account_id, action.as_str(), expires_at, now_ts()],
        )?;
        Ok(())
    }

    pub fn due_scheduled_actions(&self, now_unix: i64) -> Result<Vec<ScheduledActionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, action_to_reverse, expires_at
             FROM scheduled_actions WHERE expires_at <= ? ORDER BY expires_at",
        )?;
        let rows = stmt
            .query_map(params![now_unix], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, account_id, action, expires_at)| {
                let action_to_reverse = AccountAction::from_str(&action)
                    .map_err(crate::error::EngineError::Invariant)?;
                Ok(ScheduledActionRow {
                    id,
                    account_id,
                    action_to_reverse,
                    expires_at,
                })
            })
            .collect()
    }

    pub fn delete_scheduled_action(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM scheduled_actions WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn pending_reversal(
        &self,
        account_id: &str,
        action: AccountAction,
    ) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let expires: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM scheduled_actions
                 WHERE account_id = ? AND action_to_reverse = ?",
                params![account_id, action.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(expires)
    }

    // ---- analyses ---------------------------------------------------------

    pub fn insert_analysis(
        &self,
        account_id: &str,
        status_id: Option<&str>,
        rule_key: &str,
        score: f64,
        evidence: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO analyses (account_id, status_id, rule_key, score, evidence, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                account_id,
                status_id,
                rule_key,
                score,
                serde_json::to_string(evidence)?,
                now_ts()
            ],
        )?;
        Ok(())
    }

    pub fn analysis_count(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM analyses WHERE account_id = ?",
            params![account_id],
            |r| r.get(0),
        )?)
    }

    // ---- reports ----------------------------------------------------------

    /// Insert a pending report unless the dedupe key already exists.
    /// Returns true when a new row was created.
    pub fn insert_report_if_new(
        &self,
        account_id: &str,
        status_id: Option<&str>,
        dedupe_key: &str,
        comment: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO reports (account_id, status_id, dedupe_key, comment, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![account_id, status_id, dedupe_key, comment, now_ts()],
        )?;
        Ok(inserted > 0)
    }

    pub fn set_remote_report_id(&self, dedupe_key: &str, remote_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE reports SET remote_report_id = ? WHERE dedupe_key = ?",
            params![remote_id, dedupe_key],
        )?;
        Ok(())
    }

    pub fn report_by_key(&self, dedupe_key: &str) -> Result<Option<ReportRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, account_id, remote_report_id, dedupe_key, comment
                 FROM reports WHERE dedupe_key = ?",
                params![dedupe_key],
                |r| {
                    Ok(ReportRow {
                        id: r.get(0)?,
                        account_id: r.get(1)?,
                        remote_report_id: r.get(2)?,
                        dedupe_key: r.get(3)?,
                        comment: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn report_count(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM reports WHERE account_id = ?",
            params![account_id],
            |r| r.get(0),
        )?)
    }

    // ---- audit log --------------------------------------------------------

    pub fn insert_audit(
        &self,
        action_type: &str,
        target_account_id: &str,
        rule_id: Option<i64>,
        evidence: &serde_json::Value,
        api_response: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_log (action_type, target_account_id, rule_id, evidence,
                                    api_response, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                action_type,
                target_account_id,
                rule_id,
                serde_json::to_string(evidence)?,
                serde_json::to_string(api_response)?,
                now_ts()
            ],
        )?;
        Ok(())
    }

    pub fn audit_rows(&self, target_account_id: &str) -> Result<Vec<AuditRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, action_type, target_account_id, rule_id, api_response
             FROM audit_log WHERE target_account_id = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![target_account_id], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<i64>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(id, action_type, target_account_id, rule_id, raw)| {
                let api_response = match raw {
                    Some(s) => Some(serde_json::from_str(&s)?),
                    None => None,
                };
                Ok(AuditRow {
                    id,
                    action_type,
                    target_account_id,
                    rule_id,
                    api_response,
                })
            })
            .collect()
    }

    // ---- rules ------------------------------------------------------------

    pub fn create_rule(&self, spec: &RuleSpec, created_by: &str) -> Result<Rule> {
        let conn = self.conn.lock().unwrap();
        let now = now_ts();
        conn.execute(
            "INSERT INTO rules (name, detector_type, pattern, secondary_pattern,
                 boolean_operator, weight, enabled, action_type, trigger_threshold,
                 action_duration_seconds, action_warning_text, warning_preset_id,
                 target_fields, match_options, behavioral_params, media_params,
                 description, created_by, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                spec.name,
                spec.detector_type.as_str(),
                spec.pattern,
                spec.secondary_pattern,
                spec.boolean_operator.map(|o| o.as_str()),
                spec.weight,
                spec.enabled as i64,
                spec.action_type.as_str(),
                spec.trigger_threshold,
                spec.action_duration_seconds,
                spec.action_warning_text,
                spec.warning_preset_id,
                opt_json(&spec.target_fields)?,
                opt_json(&spec.match_options)?,
                opt_json(&spec.behavioral_params)?,
                opt_json(&spec.media_params)?,
                spec.description,
                created_by,
                now,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_rule(id)?
            .context("rule vanished immediately after insert")
    }

    pub fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("{RULE_SELECT} WHERE id = ?"),
                params![id],
                map_rule_raw,
            )
            .optional()?;
        drop(conn);
        raw.map(finish_rule).transpose()
    }

    pub fn list_rules(&self, enabled_only: bool) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let sql = if enabled_only {
            format!("{RULE_SELECT} WHERE enabled = 1 ORDER BY id")
        } else {
            format!("{RULE_SELECT} ORDER BY id")
        };
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], map_rule_raw)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(finish_rule).collect()
    }

    pub fn update_rule(&self, id: i64, spec: &RuleSpec, updated_by: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE rules SET name = ?, detector_type = ?, pattern = ?,
                 secondary_pattern = ?, boolean_operator = ?, weight = ?, enabled = ?,
                 action_type = ?, trigger_threshold = ?, action_duration_seconds = ?,
                 action_warning_text = ?, warning_preset_id = ?, target_fields = ?,
                 match_options = ?, behavioral_params = ?, media_params = ?,
                 description = ?, updated_by = ?, updated_at = ?
             WHERE id = ?",
            params![
                spec.name,
                spec.detector_type.as_str(),
                spec.pattern,
                spec.secondary_pattern,
                spec.boolean_operator.map(|o| o.as_str()),
                spec.weight,
                spec.enabled as i64,
                spec.action_type.as_str(),
                spec.trigger_threshold,
                spec.action_duration_seconds,
                spec.action_warning_text,
                spec.warning_preset_id,
                opt_json(&spec.target_fields)?,
                opt_json(&spec.match_options)?,
                opt_json(&spec.behavioral_params)?,
                opt_json(&spec.media_params)?,
                spec.description,
                updated_by,
                now_ts(),
                id
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_rule(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM rules WHERE id = ?", params![id])? > 0)
    }

    pub fn set_rule_enabled(&self, id: i64, enabled: bool, updated_by: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE rules SET enabled = ?, updated_by = ?, updated_at = ? WHERE id = ?",
            params![enabled as i64, updated_by, now_ts(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn record_rule_trigger(
        &self,
        id: i64,
        triggered_content: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE rules SET trigger_count = trigger_count + 1, last_triggered_at = ?,
                 last_triggered_content = ? WHERE id = ?",
            params![now_ts(), serde_json::to_string(triggered_content)?, id],
        )?;
        Ok(())
    }

    pub fn rule_trigger_stats(&self) -> Result<Vec<RuleTriggerStats>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, detector_type, enabled, trigger_count, last_triggered_at
             FROM rules ORDER BY trigger_count DESC, id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(RuleTriggerStats {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    detector_type: r.get(2)?,
                    enabled: r.get::<_, i64>(3)? != 0,
                    trigger_count: r.get(4)?,
                    last_triggered_at: r
                        .get::<_, Option<String>>(5)?
                        .as_deref()
                        .and_then(parse_ts),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fingerprint input: one line per enabled rule, sorted, so the digest
    /// changes exactly when scan-relevant rule state changes.
    pub fn ruleset_fingerprint_input(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, pattern, weight, enabled FROM rules WHERE enabled = 1")?;
        let mut lines = stmt
            .query_map([], |r| {
                Ok(format!(
                    "{}:{}:{}:{}",
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                    r.get::<_, i64>(3)? != 0
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        lines.sort();
        Ok(lines)
    }
}

const RULE_SELECT: &str = "SELECT id, name, detector_type, pattern, secondary_pattern,
    boolean_operator, weight, enabled, action_type, trigger_threshold,
    action_duration_seconds, action_warning_text, warning_preset_id, target_fields,
    match_options, behavioral_params, media_params, description, trigger_count,
    last_triggered_at, created_by, updated_by FROM rules";

struct RuleRaw {
    id: i64,
    name: String,
    detector_type: String,
    pattern: String,
    secondary_pattern: Option<String>,
    boolean_operator: Option<String>,
    weight: f64,
    enabled: bool,
    action_type: String,
    trigger_threshold: f64,
    action_duration_seconds: Option<i64>,
    action_warning_text: Option<String>,
    warning_preset_id: Option<String>,
    target_fields: Option<String>,
    match_options: Option<String>,
    behavioral_params: Option<String>,
    media_params: Option<String>,
    description: Option<String>,
    trigger_count: i64,
    last_triggered_at: Option<String>,
    created_by: String,
    updated_by: Option<String>,
}

fn map_rule_raw(r: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRaw> {
    Ok(RuleRaw {
        id: r.get(0)?,
        name: r.get(1)?,
        detector_type: r.get(2)?,
        pattern: r.get(3)?,
        secondary_pattern: r.get(4)?,
        boolean_operator: r.get(5)?,
        weight: r.get(6)?,
        enabled: r.get::<_, i64>(7)? != 0,
        action_type: r.get(8)?,
        trigger_threshold: r.get(9)?,
        action_duration_seconds: r.get(10)?,
        action_warning_text: r.get(11)?,
        warning_preset_id: r.get(12)?,
        target_fields: r.get(13)?,
        match_options: r.get(14)?,
        behavioral_params: r.get(15)?,
        media_params: r.get(16)?,
        description: r.get(17)?,
        trigger_count: r.get(18)?,
        last_triggered_at: r.get(19)?,
        created_by: r.get(20)?,
        updated_by: r.get(21)?,
    })
}

fn finish_rule(raw: RuleRaw) -> Result<Rule> {
    Ok(Rule {
        id: raw.id,
        name: raw.name,
        detector_type: DetectorType::from_str(&raw.detector_type)
            .map_err(crate::error::EngineError::Invariant)?,
        pattern: raw.pattern,
        secondary_pattern: raw.secondary_pattern,
        boolean_operator: raw
            .boolean_operator
            .as_deref()
            .map(crate::model::BooleanOperator::from_str)
            .transpose()
            .map_err(crate::error::EngineError::Invariant)?,
        weight: raw.weight,
        enabled: raw.enabled,
        action_type: crate::model::ActionType::from_str(&raw.action_type)
            .map_err(crate::error::EngineError::Invariant)?,
        trigger_threshold: raw.trigger_threshold,
        action_duration_seconds: raw.action_duration_seconds,
        action_warning_text: raw.action_warning_text,
        warning_preset_id: raw.warning_preset_id,
        target_fields: parse_opt_json(raw.target_fields.as_deref())?,
        match_options: parse_opt_json(raw.match_options.as_deref())?,
        behavioral_params: parse_opt_json(raw.behavioral_params.as_deref())?,
        media_params: parse_opt_json(raw.media_params.as_deref())?,
        description: raw.description,
        trigger_count: raw.trigger_count,
        last_triggered_at: raw.last_triggered_at.as_deref().and_then(parse_ts),
        created_by: raw.created_by,
        updated_by: raw.updated_by,
    })
}

fn map_domain_alert(r: &rusqlite::Row<'_>) -> rusqlite::Result<DomainAlertRow> {
    Ok(DomainAlertRow {
        domain: r.get(0)?,
        violation_count: r.get(1)?,
        defederation_threshold: r.get(2)?,
        is_defederated: r.get::<_, i64>(3)? != 0,
        defederated_by: r.get(4)?,
        notes: r.get(5)?,
    })
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(Into::into))
        .transpose()
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>> {
    raw.map(|s| serde_json::from_str(s).map_err(Into::into))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionType, MatchOptions, TargetField};
    use crate::test_support::keyword_spec;
    use chrono::Duration;

    #[test]
    fn rule_round_trip_preserves_typed_config() {
        let store = Store::open_in_memory().unwrap();
        let mut spec = keyword_spec("casino,adult", 2.0);
        spec.target_fields = Some(vec![TargetField::Bio]);
        spec.match_options = Some(MatchOptions {
            case_sensitive: true,
            word_boundaries: false,
        });
        spec.action_duration_seconds = Some(3600);

        let rule = store.create_rule(&spec, "admin").unwrap();
        let loaded = store.get_rule(rule.id).unwrap().unwrap();
        assert_eq!(loaded.pattern, "casino,adult");
        assert_eq!(loaded.target_fields, Some(vec![TargetField::Bio]));
        assert!(loaded.match_options.unwrap().case_sensitive);
        assert_eq!(loaded.action_duration_seconds, Some(3600));
        assert_eq!(loaded.action_type, ActionType::Report);
        assert_eq!(loaded.created_by, "admin");
    }

    #[test]
    fn content_scan_upsert_keeps_one_row_per_hash() {
        let store = Store::open_in_memory().unwrap();
        let result = serde_json::json!({"score": 1.0});
        store
            .upsert_content_scan("hash1", "acct1", &result, "v1")
            .unwrap();
        store
            .upsert_content_scan("hash1", "acct1", &result, "v2")
            .unwrap();
        assert_eq!(store.content_scan_count().unwrap(), 1);
        let row = store.get_content_scan("hash1").unwrap().unwrap();
        assert_eq!(row.rules_version.as_deref(), Some("v2"));
        assert!(!row.needs_rescan);
    }

    #[test]
    fn stale_marking_modes() {
        let store = Store::open_in_memory().unwrap();
        let result = serde_json::json!({});
        store
            .upsert_content_scan("old", "a", &result, "v1")
            .unwrap();
        store
            .upsert_content_scan("new", "b", &result, "v1")
            .unwrap();
        store
            .backdate_content_scan("old", Utc::now() - Duration::days(30))
            .unwrap();

        // Time-driven: only the old row.
        let cutoff = Utc::now() - Duration::days(7);
        assert_eq!(store.mark_scans_stale_before(cutoff).unwrap(), 1);
        assert!(store.get_content_scan("old").unwrap().unwrap().needs_rescan);
        assert!(!store.get_content_scan("new").unwrap().unwrap().needs_rescan);

        // Rule-driven: everything.
        assert_eq!(store.mark_all_scans_stale().unwrap(), 2);
        assert!(store.get_content_scan("new").unwrap().unwrap().needs_rescan);
    }

    #[test]
    fn active_session_is_reused() {
        let store = Store::open_in_memory().unwrap();
        let rules = serde_json::json!({"rules_version": "abc"});
        let first = store.start_session(SessionType::Remote, &rules).unwrap();
        let second = store.start_session(SessionType::Remote, &rules).unwrap();
        assert_eq!(first, second);

        // A different stream gets its own session.
        let local = store.start_session(SessionType::Local, &rules).unwrap();
        assert_ne!(first, local);

        // Completing frees the slot.
        store.finish_session(first, "completed").unwrap();
        let third = store.start_session(SessionType::Remote, &rules).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn session_total_is_recorded() {
        let store = Store::open_in_memory().unwrap();
        let rules = serde_json::json!({"rules_version": "abc"});
        let id = store.start_session(SessionType::Remote, &rules).unwrap();
        assert!(store.get_session(id).unwrap().unwrap().total_accounts.is_none());

        store.set_session_total(id, 60).unwrap();
        let session = store.get_session(id).unwrap().unwrap();
        assert_eq!(session.total_accounts, Some(60));
    }

    #[test]
    fn known_domains_exclude_local_accounts() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_account(&crate::test_support::remote_account("r1", "one@bad.example"))
            .unwrap();
        store
            .upsert_account(&crate::test_support::remote_account("r2", "two@bad.example"))
            .unwrap();
        store
            .upsert_account(&crate::test_support::account_with_bio("hello"))
            .unwrap();

        assert_eq!(store.known_domains(10).unwrap(), vec!["bad.example"]);
        let accounts = store.accounts_for_domain("bad.example", 10).unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account_id, "r1");

        let rebuilt = accounts[0].to_admin_account();
        assert_eq!(rebuilt.id, "r1");
        assert_eq!(rebuilt.domain(), "bad.example");
    }

    #[test]
    fn scheduled_action_expiry_only_extends() {
        let store = Store::open_in_memory().unwrap();
        store
            .schedule_reversal("acct1", AccountAction::Unsilence, 1000)
            .unwrap();
        store
            .schedule_reversal("acct1", AccountAction::Unsilence, 500)
            .unwrap();
        assert_eq!(
            store
                .pending_reversal("acct1", AccountAction::Unsilence)
                .unwrap(),
            Some(1000)
        );

        store
            .schedule_reversal("acct1", AccountAction::Unsilence, 2000)
            .unwrap();
        assert_eq!(
            store
                .pending_reversal("acct1", AccountAction::Unsilence)
                .unwrap(),
            Some(2000)
        );
    }

    #[test]
    fn report_dedupe_key_is_unique() {
        let store = Store::open_in_memory().unwrap();
        assert!(store
            .insert_report_if_new("acct1", None, "key1", "[AUTO] first")
            .unwrap());
        assert!(!store
            .insert_report_if_new("acct1", None, "key1", "[AUTO] second")
            .unwrap());
        assert_eq!(store.report_count("acct1").unwrap(), 1);
    }

    #[test]
    fn domain_violation_counter_increments() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..3 {
            store.record_domain_violation("bad.example", 10).unwrap();
        }
        let alert = store.get_domain_alert("bad.example").unwrap().unwrap();
        assert_eq!(alert.violation_count, 3);
        assert!(!alert.is_defederated);
    }

    #[test]
    fn mark_defederated_fires_once() {
        let store = Store::open_in_memory().unwrap();
        store.record_domain_violation("bad.example", 1).unwrap();
        assert!(store
            .mark_defederated("bad.example", "automated_system", "note")
            .unwrap());
        assert!(!store
            .mark_defederated("bad.example", "automated_system", "note")
            .unwrap());
    }

    #[test]
    fn cursor_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.cursor_position("remote_accounts").unwrap(), None);
        store.save_cursor("remote_accounts", "12345").unwrap();
        assert_eq!(
            store.cursor_position("remote_accounts").unwrap().as_deref(),
            Some("12345")
        );
        store.save_cursor("remote_accounts", "67890").unwrap();
        assert_eq!(
            store.cursor_position("remote_accounts").unwrap().as_deref(),
            Some("67890")
        );
    }

    #[test]
    fn config_flag_reads_bool_and_object_forms() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.config_flag("panic_stop"));
        store
            .set_config_value("panic_stop", &serde_json::json!(true), "test")
            .unwrap();
        assert!(store.config_flag("panic_stop"));
        store
            .set_config_value("panic_stop", &serde_json::json!({"enabled": false}), "test")
            .unwrap();
        assert!(!store.config_flag("panic_stop"));
    }

    #[test]
    fn report_threshold_from_config_table() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.report_threshold(1.0), 1.0);
        store
            .set_config_value("report_threshold", &serde_json::json!(2.5), "test")
            .unwrap();
        assert_eq!(store.report_threshold(1.0), 2.5);
    }

    #[test]
    fn trigger_stats_reflect_recorded_hits() {
        let store = Store::open_in_memory().unwrap();
        let rule = store
            .create_rule(&keyword_spec("spam", 1.0), "system")
            .unwrap();
        store
            .record_rule_trigger(rule.id, &serde_json::json!({"bio": "spam"}))
            .unwrap();
        store
            .record_rule_trigger(rule.id, &serde_json::json!({"bio": "spam again"}))
            .unwrap();
        let stats = store.rule_trigger_stats().unwrap();
        assert_eq!(stats[0].trigger_count, 2);
        assert!(stats[0].last_triggered_at.is_some());
    }
}
