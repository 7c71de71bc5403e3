//! Admin API client. The `ModerationApi` trait is the seam between the
//! engine and the instance; the HTTP implementation maps transport and
//! status failures onto the retryable/permanent split in `error`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::Config;
use crate::error::EngineError;
use crate::model::{AccountAction, AdminAccount, Post};

/// One page of the admin account listing plus the cursor for the next one.
#[derive(Debug, Clone)]
pub struct AccountPage {
    pub accounts: Vec<AdminAccount>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteReport {
    pub id: String,
}

#[async_trait]
pub trait ModerationApi: Send + Sync {
    /// List accounts for moderation review. `origin` is "local" or
    /// "remote"; `cursor` is the max_id from the previous page.
    async fn list_admin_accounts(
        &self,
        origin: &str,
        status: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<AccountPage>;

    async fn list_account_posts(&self, account_id: &str, limit: u32) -> Result<Vec<Post>>;

    /// File a report against an account. The rule id list sent upstream is
    /// always empty; our rules are not the instance's rules.
    async fn create_report(
        &self,
        account_id: &str,
        status_ids: &[String],
        comment: &str,
        category: &str,
        forward: bool,
    ) -> Result<RemoteReport>;

    /// Perform an admin account action (silence, suspend, warn, ...).
    async fn moderate_account(
        &self,
        account_id: &str,
        action: AccountAction,
        text: Option<&str>,
        warning_preset_id: Option<&str>,
        duration_seconds: Option<i64>,
    ) -> Result<serde_json::Value>;

    async fn unsilence_account(&self, account_id: &str) -> Result<serde_json::Value>;

    async fn unsuspend_account(&self, account_id: &str) -> Result<serde_json::Value>;
}

/// reqwest-backed implementation talking to a single instance.
pub struct HttpModerationApi {
    http: reqwest::Client,
    base: String,
    admin_token: String,
    bot_token: String,
    max_id_re: Regex,
}

impl HttpModerationApi {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent())
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;
        Ok(HttpModerationApi {
            http,
            base: config.instance_base.trim_end_matches('/').to_string(),
            admin_token: config.admin_token.clone(),
            bot_token: config.bot_token.clone(),
            max_id_re: Regex::new(r"max_id=([^&>\s]+)").context("max_id regex")?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Pull the next-page cursor out of the RFC 5988 Link header.
    fn next_cursor(&self, response: &reqwest::Response) -> Option<String> {
        let link = response.headers().get(reqwest::header::LINK)?;
        let link = link.to_str().ok()?;
        let next_part = link
            .split(',')
            .find(|part| part.contains("rel=\"next\""))?;
        self.max_id_re
            .captures(next_part)
            .map(|c| c[1].to_string())
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(EngineError::Transient(format!("api returned {status}: {message}")).into())
        } else {
            Err(EngineError::Permanent {
                status: status.as_u16(),
                message,
            }
            .into())
        }
    }
}

/// Timeouts and connection failures are worth retrying; anything else from
/// the transport layer is not.
fn transport_error(err: reqwest::Error) -> anyhow::Error {
    if err.is_timeout() || err.is_connect() {
        EngineError::Transient(err.to_string()).into()
    } else {
        anyhow::Error::new(err)
    }
}

#[async_trait]
impl ModerationApi for HttpModerationApi {
    async fn list_admin_accounts(
        &self,
        origin: &str,
        status: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<AccountPage> {
        let mut request = self
            .http
            .get(self.url("/api/v2/admin/accounts"))
            .bearer_auth(&self.admin_token)
            .query(&[
                ("origin", origin),
                ("status", status),
                ("limit", &limit.to_string()),
            ]);
        if let Some(max_id) = cursor {
            request = request.query(&[("max_id", max_id)]);
        }
        let response = request.send().await.map_err(transport_error)?;
        let response = self.check(response).await?;
        let next_cursor = self.next_cursor(&response);
        let accounts: Vec<AdminAccount> = response
            .json()
            .await
            .context("failed to decode admin account page")?;
        Ok(AccountPage {
            accounts,
            next_cursor,
        })
    }

    async fn list_account_posts(&self, account_id: &str, limit: u32) -> Result<Vec<Post>> {
        let response = self
            .http
            .get(self.url(&format!("/api/v1/accounts/{account_id}/statuses")))
            .bearer_auth(&self.admin_token)
            .query(&[("limit", limit.to_string())])
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check(response).await?;
        response
            .json()
            .await
            .with_context(|| format!("failed to decode posts for account {account_id}"))
    }

    async fn create_report(
        &self,
        account_id: &str,
        status_ids: &[String],
        comment: &str,
        category: &str,
        forward: bool,
    ) -> Result<RemoteReport> {
        let body = serde_json::json!({
            "account_id": account_id,
            "status_ids": status_ids,
            "comment": comment,
            "category": category,
            "forward": forward,
            "rule_ids": [],
        });
        let response = self
            .http
            .post(self.url("/api/v1/reports"))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check(response).await?;
        response
            .json()
            .await
            .context("failed to decode report response")
    }

    async fn moderate_account(
        &self,
        account_id: &str,
        action: AccountAction,
        text: Option<&str>,
        warning_preset_id: Option<&str>,
        duration_seconds: Option<i64>,
    ) -> Result<serde_json::Value> {
        let mut body = serde_json::json!({ "type": action.as_str() });
        if let Some(text) = text {
            body["text"] = serde_json::json!(text);
        }
        if let Some(preset) = warning_preset_id {
            body["warning_preset_id"] = serde_json::json!(preset);
        }
        if let Some(duration) = duration_seconds {
            body["duration"] = serde_json::json!(duration);
        }
        let response = self
            .http
            .post(self.url(&format!("/api/v1/admin/accounts/{account_id}/action")))
            .bearer_auth(&self.admin_token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check(response).await?;
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }

    async fn unsilence_account(&self, account_id: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url(&format!("/api/v1/admin/accounts/{account_id}/unsilence")))
            .bearer_auth(&self.admin_token)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check(response).await?;
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }

    async fn unsuspend_account(&self, account_id: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .post(self.url(&format!("/api/v1/admin/accounts/{account_id}/unsuspend")))
            .bearer_auth(&self.admin_token)
            .send()
            .await
            .map_err(transport_error)?;
        let response = self.check(response).await?;
        Ok(response.json().await.unwrap_or(serde_json::Value::Null))
    }
}
