use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which detector evaluates a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorType {
    Keyword,
    Regex,
    Behavioral,
    Media,
}

impl DetectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorType::Keyword => "keyword",
            DetectorType::Regex => "regex",
            DetectorType::Behavioral => "behavioral",
            DetectorType::Media => "media",
        }
    }
}

impl FromStr for DetectorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(DetectorType::Keyword),
            "regex" => Ok(DetectorType::Regex),
            "behavioral" => Ok(DetectorType::Behavioral),
            "media" => Ok(DetectorType::Media),
            other => Err(format!("unknown detector type: {other}")),
        }
    }
}

impl fmt::Display for DetectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The enforcement action a rule requests when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Report,
    Warn,
    Silence,
    Suspend,
    Disable,
    Sensitive,
    DomainBlock,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Report => "report",
            ActionType::Warn => "warn",
            ActionType::Silence => "silence",
            ActionType::Suspend => "suspend",
            ActionType::Disable => "disable",
            ActionType::Sensitive => "sensitive",
            ActionType::DomainBlock => "domain_block",
        }
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report" => Ok(ActionType::Report),
            "warn" => Ok(ActionType::Warn),
            "silence" => Ok(ActionType::Silence),
            "suspend" => Ok(ActionType::Suspend),
            "disable" => Ok(ActionType::Disable),
            "sensitive" => Ok(ActionType::Sensitive),
            "domain_block" => Ok(ActionType::DomainBlock),
            other => Err(format!("unknown action type: {other}")),
        }
    }
}

/// Concrete account-level operations the dispatcher can send upstream.
/// This is a superset of [`ActionType`]: it includes the reversal verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountAction {
    Warn,
    Silence,
    Suspend,
    Disable,
    Sensitive,
    Unsilence,
    Unsuspend,
    Report,
}

impl AccountAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountAction::Warn => "warn",
            AccountAction::Silence => "silence",
            AccountAction::Suspend => "suspend",
            AccountAction::Disable => "disable",
            AccountAction::Sensitive => "sensitive",
            AccountAction::Unsilence => "unsilence",
            AccountAction::Unsuspend => "unsuspend",
            AccountAction::Report => "report",
        }
    }

    /// The reversal operation for a temporary action, if one exists.
    pub fn reversal(&self) -> Option<AccountAction> {
        match self {
            AccountAction::Silence => Some(AccountAction::Unsilence),
            AccountAction::Suspend => Some(AccountAction::Unsuspend),
            _ => None,
        }
    }
}

impl FromStr for AccountAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warn" => Ok(AccountAction::Warn),
            "silence" => Ok(AccountAction::Silence),
            "suspend" => Ok(AccountAction::Suspend),
            "disable" => Ok(AccountAction::Disable),
            "sensitive" => Ok(AccountAction::Sensitive),
            "unsilence" => Ok(AccountAction::Unsilence),
            "unsuspend" => Ok(AccountAction::Unsuspend),
            "report" => Ok(AccountAction::Report),
            other => Err(format!("unknown account action: {other}")),
        }
    }
}

impl fmt::Display for AccountAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule's primary and secondary patterns combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BooleanOperator {
    And,
    Or,
}

impl BooleanOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            BooleanOperator::And => "AND",
            BooleanOperator::Or => "OR",
        }
    }
}

impl FromStr for BooleanOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" => Ok(BooleanOperator::And),
            "OR" => Ok(BooleanOperator::Or),
            other => Err(format!("unknown boolean operator: {other}")),
        }
    }
}

/// Profile fields a text detector can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Username,
    DisplayName,
    Bio,
    Content,
}

impl TargetField {
    pub const ALL: [TargetField; 4] = [
        TargetField::Username,
        TargetField::DisplayName,
        TargetField::Bio,
        TargetField::Content,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::Username => "username",
            TargetField::DisplayName => "display_name",
            TargetField::Bio => "bio",
            TargetField::Content => "content",
        }
    }
}

/// Matching knobs for keyword rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchOptions {
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default = "default_true")]
    pub word_boundaries: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            case_sensitive: false,
            word_boundaries: true,
        }
    }
}

/// Thresholds for the behavioral detector. All fields are optional in rule
/// JSON and fall back to these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehavioralParams {
    #[serde(default = "default_window_hours")]
    pub time_window_hours: f64,
    #[serde(default = "default_post_threshold")]
    pub post_threshold: u32,
    #[serde(default = "default_link_threshold")]
    pub link_threshold: u32,
    #[serde(default = "default_min_age_days")]
    pub min_account_age_days: i64,
    #[serde(default = "default_post_rate")]
    pub post_rate_threshold: f64,
    #[serde(default = "default_repetition")]
    pub repetition_threshold: f64,
}

fn default_window_hours() -> f64 {
    1.0
}
fn default_post_threshold() -> u32 {
    10
}
fn default_link_threshold() -> u32 {
    5
}
fn default_min_age_days() -> i64 {
    7
}
fn default_post_rate() -> f64 {
    12.0
}
fn default_repetition() -> f64 {
    0.8
}

impl Default for BehavioralParams {
    fn default() -> Self {
        BehavioralParams {
            time_window_hours: default_window_hours(),
            post_threshold: default_post_threshold(),
            link_threshold: default_link_threshold(),
            min_account_age_days: default_min_age_days(),
            post_rate_threshold: default_post_rate(),
            repetition_threshold: default_repetition(),
        }
    }
}

/// What part of a media attachment the pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTarget {
    AltText,
    MimeType,
    UrlHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaParams {
    pub match_target: MediaTarget,
}

/// A moderation policy unit, as stored in the rules table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub detector_type: DetectorType,
    pub pattern: String,
    pub secondary_pattern: Option<String>,
    pub boolean_operator: Option<BooleanOperator>,
    pub weight: f64,
    pub enabled: bool,
    pub action_type: ActionType,
    pub trigger_threshold: f64,
    pub action_duration_seconds: Option<i64>,
    pub action_warning_text: Option<String>,
    pub warning_preset_id: Option<String>,
    pub target_fields: Option<Vec<TargetField>>,
    pub match_options: Option<MatchOptions>,
    pub behavioral_params: Option<BehavioralParams>,
    pub media_params: Option<MediaParams>,
    pub description: Option<String>,
    pub trigger_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub updated_by: Option<String>,
}

impl Rule {
    /// The fields this rule scans, defaulting to all of them.
    pub fn scoped_fields(&self) -> Vec<TargetField> {
        match &self.target_fields {
            Some(fields) if !fields.is_empty() => fields.clone(),
            _ => TargetField::ALL.to_vec(),
        }
    }

    /// Stable key used for analysis rows, e.g. `keyword/casino-spam`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.detector_type.as_str(), self.name)
    }
}

/// Fields supplied when creating a rule; id and bookkeeping are filled in
/// by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub detector_type: DetectorType,
    pub pattern: String,
    #[serde(default)]
    pub secondary_pattern: Option<String>,
    #[serde(default)]
    pub boolean_operator: Option<BooleanOperator>,
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub action_type: ActionType,
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: f64,
    #[serde(default)]
    pub action_duration_seconds: Option<i64>,
    #[serde(default)]
    pub action_warning_text: Option<String>,
    #[serde(default)]
    pub warning_preset_id: Option<String>,
    #[serde(default)]
    pub target_fields: Option<Vec<TargetField>>,
    #[serde(default)]
    pub match_options: Option<MatchOptions>,
    #[serde(default)]
    pub behavioral_params: Option<BehavioralParams>,
    #[serde(default)]
    pub media_params: Option<MediaParams>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_trigger_threshold() -> f64 {
    1.0
}

/// A profile field shown on an account page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// The nested profile object on an admin account record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountProfile {
    pub id: String,
    #[serde(default)]
    pub acct: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    /// The account bio.
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub header: String,
    #[serde(default)]
    pub fields: Vec<ProfileField>,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub followers_count: i64,
    #[serde(default)]
    pub statuses_count: i64,
}

/// An admin-level account listing record. Admin metadata lives on the outer
/// object; the public profile is nested under `account`. Behavioral rules
/// need both, so neither side may be flattened away.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminAccount {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub silenced: bool,
    #[serde(default)]
    pub ips: Vec<AccountIp>,
    pub account: AccountProfile,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountIp {
    #[serde(default)]
    pub ip: String,
}

impl AdminAccount {
    /// The remote domain of the account, or `"local"`.
    pub fn domain(&self) -> String {
        match self.account.acct.split_once('@') {
            Some((_, domain)) => domain.to_string(),
            None => "local".to_string(),
        }
    }
}

/// A single post with its attachments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub media_attachments: Vec<MediaAttachment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub id: String,
    /// Alt text, if the author provided any.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Supporting detail for a violation. Serialized into analysis and audit
/// rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub matched_terms: Vec<String>,
    #[serde(default)]
    pub matched_status_ids: Vec<String>,
    #[serde(default)]
    pub matched_pattern: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// One scored rule hit for an account. Transient: persisted only as
/// analysis rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: i64,
    pub rule_key: String,
    pub rule_type: DetectorType,
    pub score: f64,
    pub evidence: Evidence,
}

/// The result of scanning one account, handed from the poll loop to the
/// analyze job so posts are not fetched twice.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub account: AdminAccount,
    pub score: f64,
    pub violations: Vec<Violation>,
}

impl ScanOutcome {
    /// Distinct post ids implicated by the violations, sorted.
    pub fn involved_status_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .violations
            .iter()
            .flat_map(|v| v.evidence.matched_status_ids.iter().cloned())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Poll stream identity; also the `origin` filter for the admin listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Local,
    Remote,
    Federated,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Local => "local",
            SessionType::Remote => "remote",
            SessionType::Federated => "federated",
        }
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(SessionType::Local),
            "remote" => Ok(SessionType::Remote),
            "federated" => Ok(SessionType::Federated),
            other => Err(format!("unknown session type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_fields_default_to_all() {
        let rule = crate::test_support::keyword_rule("spam", 1.0);
        assert_eq!(rule.scoped_fields(), TargetField::ALL.to_vec());
    }

    #[test]
    fn domain_extraction() {
        let mut acct = AdminAccount::default();
        acct.account.acct = "spammer@bad.example".to_string();
        assert_eq!(acct.domain(), "bad.example");

        acct.account.acct = "localuser".to_string();
        assert_eq!(acct.domain(), "local");
    }

    #[test]
    fn reversal_only_for_temporary_actions() {
        assert_eq!(
            AccountAction::Silence.reversal(),
            Some(AccountAction::Unsilence)
        );
        assert_eq!(
            AccountAction::Suspend.reversal(),
            Some(AccountAction::Unsuspend)
        );
        assert_eq!(AccountAction::Warn.reversal(), None);
        assert_eq!(AccountAction::Report.reversal(), None);
    }

    #[test]
    fn enum_round_trips() {
        for s in ["keyword", "regex", "behavioral", "media"] {
            assert_eq!(s.parse::<DetectorType>().unwrap().as_str(), s);
        }
        for s in [
            "report",
            "warn",
            "silence",
            "suspend",
            "disable",
            "sensitive",
            "domain_block",
        ] {
            assert_eq!(s.parse::<ActionType>().unwrap().as_str(), s);
        }
    }
}
