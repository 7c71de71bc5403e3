//! Enforcement dispatcher. Every attempt leaves exactly one audit row, in
//! dry-run and live mode alike, whether the upstream call succeeded or not.
//! Temporary actions with a duration get a scheduled reversal whose expiry
//! only ever extends.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::client::ModerationApi;
use crate::model::{AccountAction, ActionType, Rule};
use crate::store::Store;

pub struct Enforcer {
    store: Store,
    api: Arc<dyn ModerationApi>,
    dry_run: bool,
}

/// The account-level verb for a rule action, or None for actions that are
/// not dispatched against a single account (report, domain_block).
fn account_action_for(action_type: ActionType) -> Option<AccountAction> {
    match action_type {
        ActionType::Warn => Some(AccountAction::Warn),
        ActionType::Silence => Some(AccountAction::Silence),
        ActionType::Suspend => Some(AccountAction::Suspend),
        ActionType::Disable => Some(AccountAction::Disable),
        ActionType::Sensitive => Some(AccountAction::Sensitive),
        ActionType::Report | ActionType::DomainBlock => None,
    }
}

impl Enforcer {
    pub fn new(store: Store, api: Arc<dyn ModerationApi>, dry_run: bool) -> Self {
        Enforcer {
            store,
            api,
            dry_run,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Dispatch the rule's account action. Upstream failures are recorded in
    /// the audit row and swallowed; one misbehaving account must not stall
    /// the batch.
    pub async fn perform_action(
        &self,
        rule: &Rule,
        account_id: &str,
        evidence: &serde_json::Value,
    ) -> Result<()> {
        let action = match account_action_for(rule.action_type) {
            Some(action) => action,
            None => return Ok(()),
        };

        if self.dry_run {
            log::info!(
                "dry run: would {action} account {account_id} for rule {}",
                rule.key()
            );
            self.store.insert_audit(
                action.as_str(),
                account_id,
                Some(rule.id),
                evidence,
                &serde_json::json!({"dry_run": true}),
            )?;
            return Ok(());
        }

        let outcome = self
            .api
            .moderate_account(
                account_id,
                action,
                rule.action_warning_text.as_deref(),
                rule.warning_preset_id.as_deref(),
                rule.action_duration_seconds,
            )
            .await;

        match outcome {
            Ok(response) => {
                self.store.insert_audit(
                    action.as_str(),
                    account_id,
                    Some(rule.id),
                    evidence,
                    &response,
                )?;
                if let (Some(reversal), Some(duration)) =
                    (action.reversal(), rule.action_duration_seconds)
                {
                    let expires_at = Utc::now().timestamp() + duration;
                    self.store
                        .schedule_reversal(account_id, reversal, expires_at)?;
                    log::info!(
                        "scheduled {reversal} for account {account_id} at unix {expires_at}"
                    );
                }
            }
            Err(e) => {
                log::error!("{action} failed for account {account_id}: {e:#}");
                self.store.insert_audit(
                    action.as_str(),
                    account_id,
                    Some(rule.id),
                    evidence,
                    &serde_json::json!({"error": format!("{e:#}")}),
                )?;
            }
        }
        Ok(())
    }

    /// Reverse every scheduled action that has expired. A failed reversal
    /// keeps its row and is retried on the next sweep.
    pub async fn process_expired_actions(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let due = self.store.due_scheduled_actions(now)?;
        let mut reversed = 0;
        for item in due {
            let outcome = match item.action_to_reverse {
                AccountAction::Unsilence => self.api.unsilence_account(&item.account_id).await,
                AccountAction::Unsuspend => self.api.unsuspend_account(&item.account_id).await,
                other => {
                    log::error!(
                        "scheduled action {} for account {} is not reversible, dropping",
                        other,
                        item.account_id
                    );
                    self.store.delete_scheduled_action(item.id)?;
                    continue;
                }
            };
            match outcome {
                Ok(response) => {
                    self.store.insert_audit(
                        item.action_to_reverse.as_str(),
                        &item.account_id,
                        None,
                        &serde_json::json!({"scheduled": true}),
                        &response,
                    )?;
                    self.store.delete_scheduled_action(item.id)?;
                    reversed += 1;
                }
                Err(e) => {
                    log::warn!(
                        "failed to {} account {}, will retry: {e:#}",
                        item.action_to_reverse,
                        item.account_id
                    );
                }
            }
        }
        Ok(reversed)
    }
}
