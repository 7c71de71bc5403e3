//! Media detector: matches attachment alt text, MIME type, or a digest of
//! the attachment URL for known-bad-media detection. Every attachment of
//! every post is checked.

use regex::RegexBuilder;
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::model::{AdminAccount, Evidence, MediaTarget, Post, Rule, Violation};

use super::make_violation;

#[derive(Debug)]
pub struct MediaDetector {
    target: MediaTarget,
    pattern: String,
    alt_text_re: Option<regex::Regex>,
}

impl MediaDetector {
    pub fn compile(rule: &Rule) -> Result<Self, EngineError> {
        let params = rule.media_params.as_ref().ok_or_else(|| {
            EngineError::invariant(format!("media rule '{}' has no media_params", rule.name))
        })?;
        let alt_text_re = match params.match_target {
            MediaTarget::AltText => Some(
                RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        EngineError::invariant(format!(
                            "rule '{}' has invalid alt-text pattern: {e}"
                        , rule.name))
                    })?,
            ),
            _ => None,
        };
        Ok(MediaDetector {
            target: params.match_target,
            pattern: rule.pattern.trim().to_lowercase(),
            alt_text_re,
        })
    }

    pub fn evaluate(
        &self,
        rule: &Rule,
        _account: &AdminAccount,
        posts: &[Post],
    ) -> Vec<Violation> {
        let mut matched_status_ids: Vec<String> = Vec::new();
        let mut matched_attachment_ids: Vec<String> = Vec::new();

        for post in posts {
            let mut post_hit = false;
            for attachment in &post.media_attachments {
                let hit = match self.target {
                    MediaTarget::AltText => attachment
                        .description
                        .as_deref()
                        .zip(self.alt_text_re.as_ref())
                        .map_or(false, |(alt, re)| re.is_match(alt)),
                    MediaTarget::MimeType => attachment
                        .mime_type
                        .as_deref()
                        .map_or(false, |mime| mime.eq_ignore_ascii_case(&self.pattern)),
                    MediaTarget::UrlHash => {
                        url_digest(&attachment.url) == self.pattern
                    }
                };
                if hit {
                    post_hit = true;
                    matched_attachment_ids.push(attachment.id.clone());
                }
            }
            if post_hit {
                matched_status_ids.push(post.id.clone());
            }
        }

        if matched_attachment_ids.is_empty() {
            return Vec::new();
        }

        let mut evidence = Evidence {
            matched_status_ids,
            matched_pattern: Some(self.pattern.clone()),
            ..Evidence::default()
        };
        evidence.metrics.insert(
            "matched_attachments".to_string(),
            serde_json::json!(matched_attachment_ids),
        );
        vec![make_violation(rule, evidence)]
    }
}

/// Hex sha256 of an attachment address, the key used for known-bad media.
pub fn url_digest(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}
