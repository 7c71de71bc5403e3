//! Shared fixtures for unit tests: rule builders, account and post
//! factories, and an in-memory `ModerationApi` that records every call.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::client::{AccountPage, ModerationApi, RemoteReport};
use crate::error::EngineError;
use crate::model::{
    AccountAction, ActionType, AdminAccount, DetectorType, MediaParams, MediaTarget, Post, Rule,
    RuleSpec,
};

pub fn keyword_spec(pattern: &str, weight: f64) -> RuleSpec {
    RuleSpec {
        name: format!("test-{}", pattern.replace([',', ' '], "-")),
        detector_type: DetectorType::Keyword,
        pattern: pattern.to_string(),
        secondary_pattern: None,
        boolean_operator: None,
        weight,
        enabled: true,
        action_type: ActionType::Report,
        trigger_threshold: 1.0,
        action_duration_seconds: None,
        action_warning_text: None,
        warning_preset_id: None,
        target_fields: None,
        match_options: None,
        behavioral_params: None,
        media_params: None,
        description: None,
    }
}

fn rule_from_spec(spec: RuleSpec) -> Rule {
    Rule {
        id: 1,
        name: spec.name,
        detector_type: spec.detector_type,
        pattern: spec.pattern,
        secondary_pattern: spec.secondary_pattern,
        boolean_operator: spec.boolean_operator,
        weight: spec.weight,
        enabled: spec.enabled,
        action_type: spec.action_type,
        trigger_threshold: spec.trigger_threshold,
        action_duration_seconds: spec.action_duration_seconds,
        action_warning_text: spec.action_warning_text,
        warning_preset_id: spec.warning_preset_id,
        target_fields: spec.target_fields,
        match_options: spec.match_options,
        behavioral_params: spec.behavioral_params,
        media_params: spec.media_params,
        description: spec.description,
        trigger_count: 0,
        last_triggered_at: None,
        created_by: "system".to_string(),
        updated_by: None,
    }
}

pub fn keyword_rule(pattern: &str, weight: f64) -> Rule {
    rule_from_spec(keyword_spec(pattern, weight))
}

pub fn regex_rule(pattern: &str, weight: f64) -> Rule {
    let mut spec = keyword_spec(pattern, weight);
    spec.detector_type = DetectorType::Regex;
    rule_from_spec(spec)
}

pub fn behavioral_rule(pattern: &str, weight: f64) -> Rule {
    let mut spec = keyword_spec(pattern, weight);
    spec.detector_type = DetectorType::Behavioral;
    rule_from_spec(spec)
}

pub fn media_rule(pattern: &str, target: MediaTarget, weight: f64) -> Rule {
    let mut spec = keyword_spec(pattern, weight);
    spec.detector_type = DetectorType::Media;
    spec.media_params = Some(MediaParams {
        match_target: target,
    });
    rule_from_spec(spec)
}

pub fn account_with_bio(bio: &str) -> AdminAccount {
    let mut account = AdminAccount::default();
    account.id = "a1".to_string();
    account.account.id = "a1".to_string();
    account.account.acct = "tester".to_string();
    account.account.username = "tester".to_string();
    account.account.display_name = "Tester".to_string();
    account.account.note = bio.to_string();
    account
}

pub fn remote_account(id: &str, acct: &str) -> AdminAccount {
    let mut account = account_with_bio("");
    account.id = id.to_string();
    account.account.id = id.to_string();
    account.account.acct = acct.to_string();
    account.account.username = acct.split('@').next().unwrap_or(acct).to_string();
    account
}

pub fn post(id: &str, content: &str) -> Post {
    Post {
        id: id.to_string(),
        content: content.to_string(),
        created_at: Some(Utc::now()),
        media_attachments: Vec::new(),
    }
}

pub fn timed_post(id: &str, content: &str, created_at: DateTime<Utc>) -> Post {
    Post {
        created_at: Some(created_at),
        ..post(id, content)
    }
}

/// Everything the mock API was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    Report {
        account_id: String,
        status_ids: Vec<String>,
        comment: String,
    },
    Action {
        account_id: String,
        action: AccountAction,
        duration_seconds: Option<i64>,
    },
    Unsilence(String),
    Unsuspend(String),
}

/// In-memory API double. Pages and posts are queued by the test; every
/// mutating call is recorded. Queued errors are consumed one at a time.
#[derive(Default)]
pub struct MockApi {
    pages: Mutex<HashMap<String, VecDeque<Result<AccountPage, String>>>>,
    posts: Mutex<HashMap<String, Vec<Post>>>,
    action_errors: Mutex<VecDeque<String>>,
    report_errors: Mutex<VecDeque<String>>,
    reversal_errors: Mutex<VecDeque<String>>,
    report_counter: Mutex<u64>,
    pub calls: Mutex<Vec<ApiCall>>,
}

impl MockApi {
    pub fn new() -> Self {
        MockApi::default()
    }

    pub fn push_page(&self, origin: &str, accounts: Vec<AdminAccount>, next: Option<&str>) {
        self.pages
            .lock()
            .unwrap()
            .entry(origin.to_string())
            .or_default()
            .push_back(Ok(AccountPage {
                accounts,
                next_cursor: next.map(str::to_string),
            }));
    }

    pub fn push_page_error(&self, origin: &str, message: &str) {
        self.pages
            .lock()
            .unwrap()
            .entry(origin.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn set_posts(&self, account_id: &str, posts: Vec<Post>) {
        self.posts
            .lock()
            .unwrap()
            .insert(account_id.to_string(), posts);
    }

    pub fn fail_next_action(&self, message: &str) {
        self.action_errors
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    pub fn fail_next_report(&self, message: &str) {
        self.report_errors
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    pub fn fail_next_reversal(&self, message: &str) {
        self.reversal_errors
            .lock()
            .unwrap()
            .push_back(message.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModerationApi for MockApi {
    async fn list_admin_accounts(
        &self,
        origin: &str,
        _status: &str,
        _cursor: Option<&str>,
        _limit: u32,
    ) -> Result<AccountPage> {
        let next = self
            .pages
            .lock()
            .unwrap()
            .get_mut(origin)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(page)) => Ok(page),
            Some(Err(message)) => Err(EngineError::Transient(message).into()),
            None => Ok(AccountPage {
                accounts: Vec::new(),
                next_cursor: None,
            }),
        }
    }

    async fn list_account_posts(&self, account_id: &str, _limit: u32) -> Result<Vec<Post>> {
        Ok(self
            .posts
            .lock()
            .unwrap()
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_report(
        &self,
        account_id: &str,
        status_ids: &[String],
        comment: &str,
        _category: &str,
        _forward: bool,
    ) -> Result<RemoteReport> {
        if let Some(message) = self.report_errors.lock().unwrap().pop_front() {
            return Err(EngineError::Transient(message).into());
        }
        self.calls.lock().unwrap().push(ApiCall::Report {
            account_id: account_id.to_string(),
            status_ids: status_ids.to_vec(),
            comment: comment.to_string(),
        });
        let mut counter = self.report_counter.lock().unwrap();
        *counter += 1;
        Ok(RemoteReport {
            id: format!("r{counter}"),
        })
    }

    async fn moderate_account(
        &self,
        account_id: &str,
        action: AccountAction,
        _text: Option<&str>,
        _warning_preset_id: Option<&str>,
        duration_seconds: Option<i64>,
    ) -> Result<serde_json::Value> {
        if let Some(message) = self.action_errors.lock().unwrap().pop_front() {
            return Err(EngineError::Transient(message).into());
        }
        self.calls.lock().unwrap().push(ApiCall::Action {
            account_id: account_id.to_string(),
            action,
            duration_seconds,
        });
        Ok(serde_json::json!({"ok": true}))
    }

    async fn unsilence_account(&self, account_id: &str) -> Result<serde_json::Value> {
        if let Some(message) = self.reversal_errors.lock().unwrap().pop_front() {
            return Err(EngineError::Transient(message).into());
        }
        self.calls
            .lock()
            .unwrap()
            .push(ApiCall::Unsilence(account_id.to_string()));
        Ok(serde_json::json!({"ok": true}))
    }

    async fn unsuspend_account(&self, account_id: &str) -> Result<serde_json::Value> {
        if let Some(message) = self.reversal_errors.lock().unwrap().pop_front() {
            return Err(EngineError::Transient(message).into());
        }
        self.calls
            .lock()
            .unwrap()
            .push(ApiCall::Unsuspend(account_id.to_string()));
        Ok(serde_json::json!({"ok": true}))
    }
}
