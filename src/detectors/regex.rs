//! Regex detector: one case-insensitive pattern per rule, optionally
//! combined with a secondary pattern. Under AND both patterns must match
//! the same field text; under OR either one is enough.

use regex::{Regex, RegexBuilder};

use crate::error::EngineError;
use crate::model::{
    AdminAccount, BooleanOperator, Evidence, Post, Rule, TargetField, Violation,
};

use super::{make_violation, profile_text};

#[derive(Debug)]
pub struct RegexDetector {
    primary: Regex,
    secondary: Option<Regex>,
    operator: BooleanOperator,
}

impl RegexDetector {
    pub fn compile(rule: &Rule) -> Result<Self, EngineError> {
        let primary = build(&rule.pattern, &rule.name)?;
        let secondary = match &rule.secondary_pattern {
            Some(pattern) => Some(build(pattern, &rule.name)?),
            None => None,
        };
        Ok(RegexDetector {
            primary,
            secondary,
            operator: rule.boolean_operator.unwrap_or(BooleanOperator::Or),
        })
    }

    pub fn evaluate(
        &self,
        rule: &Rule,
        account: &AdminAccount,
        posts: &[Post],
    ) -> Vec<Violation> {
        let mut violations = Vec::new();

        for field in rule.scoped_fields() {
            if field == TargetField::Content {
                // Each post is matched independently; the violation covers
                // the content field once, listing every matching post.
                let mut matched_ids: Vec<String> = Vec::new();
                let mut first_match: Option<String> = None;
                for post in posts {
                    if let Some(m) = self.field_match(&post.content) {
                        matched_ids.push(post.id.clone());
                        first_match.get_or_insert(m);
                    }
                }
                if let Some(matched) = first_match {
                    let mut evidence = Evidence {
                        matched_status_ids: matched_ids,
                        matched_pattern: Some(matched),
                        ..Evidence::default()
                    };
                    evidence
                        .metrics
                        .insert("field".to_string(), serde_json::json!("content"));
                    violations.push(make_violation(rule, evidence));
                }
            } else if let Some(text) = profile_text(field, account) {
                if let Some(matched) = self.field_match(text) {
                    let mut evidence = Evidence {
                        matched_pattern: Some(matched),
                        ..Evidence::default()
                    };
                    evidence
                        .metrics
                        .insert("field".to_string(), serde_json::json!(field.as_str()));
                    violations.push(make_violation(rule, evidence));
                }
            }
        }

        violations
    }

    /// The literal matched substring, or None if the compound condition is
    /// not satisfied by this text.
    fn field_match(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        match (&self.secondary, self.operator) {
            (None, _) => self.primary.find(text).map(|m| m.as_str().to_string()),
            (Some(secondary), BooleanOperator::And) => {
                let m = self.primary.find(text)?;
                if secondary.is_match(text) {
                    Some(m.as_str().to_string())
                } else {
                    None
                }
            }
            (Some(secondary), BooleanOperator::Or) => self
                .primary
                .find(text)
                .or_else(|| secondary.find(text))
                .map(|m| m.as_str().to_string()),
        }
    }
}

fn build(pattern: &str, rule_name: &str) -> Result<Regex, EngineError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            EngineError::invariant(format!("rule '{rule_name}' has invalid regex: {e}"))
        })
}
