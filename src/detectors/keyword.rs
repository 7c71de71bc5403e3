//! Keyword detector: the pattern is a comma-separated term list matched
//! against the rule's target fields and post content.

use crate::error::EngineError;
use crate::model::{AdminAccount, Evidence, MatchOptions, Post, Rule, TargetField, Violation};

use super::{make_violation, profile_text};

#[derive(Debug)]
pub struct KeywordDetector {
    terms: Vec<String>,
    options: MatchOptions,
}

impl KeywordDetector {
    pub fn compile(rule: &Rule) -> Result<Self, EngineError> {
        let terms: Vec<String> = rule
            .pattern
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Err(EngineError::invariant(format!(
                "keyword rule '{}' has no terms",
                rule.name
            )));
        }
        Ok(KeywordDetector {
            terms,
            options: rule.match_options.unwrap_or_default(),
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
                // One violation for the content field as a whole; evidence
                // lists every post that matched.
                let mut matched_terms: Vec<String> = Vec::new();
                let mut matched_ids: Vec<String> = Vec::new();
                for post in posts {
                    let hits = self.matched_terms(&post.content);
                    if !hits.is_empty() {
                        matched_ids.push(post.id.clone());
                        for hit in hits {
                            if !matched_terms.contains(&hit) {
                                matched_terms.push(hit);
                            }
                        }
                    }
                }
                if !matched_terms.is_empty() {
                    let mut evidence = Evidence {
                        matched_terms,
                        matched_status_ids: matched_ids,
                        ..Evidence::default()
                    };
                    evidence
                        .metrics
                        .insert("field".to_string(), serde_json::json!("content"));
                    violations.push(make_violation(rule, evidence));
                }
            } else if let Some(text) = profile_text(field, account) {
                let hits = self.matched_terms(text);
                if !hits.is_empty() {
                    let mut evidence = Evidence {
                        matched_terms: hits,
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

    fn matched_terms(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        self.terms
            .iter()
            .filter(|term| contains_term(text, term, &self.options))
            .cloned()
            .collect()
    }
}

fn contains_term(text: &str, term: &str, options: &MatchOptions) -> bool {
    let (haystack, needle) = if options.case_sensitive {
        (text.to_string(), term.to_string())
    } else {
        (text.to_lowercase(), term.to_lowercase())
    };

    if options.word_boundaries {
        contains_word(&haystack, &needle)
    } else {
        haystack.contains(&needle)
    }
}

/// Whole-word containment: "spam" matches in "this is spam content" but not
/// inside "spammer".
fn contains_word(haystack: &str, needle: &str) -> bool {
    for (idx, matched) in haystack.match_indices(needle) {
        let before_ok = haystack[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[idx + matched.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{account_with_bio, keyword_rule, post};

    #[test]
    fn word_boundaries_reject_substrings() {
        let options = MatchOptions {
            case_sensitive: false,
            word_boundaries: true,
        };
        assert!(contains_term("this is spam content", "spam", &options));
        assert!(!contains_term("this is spammer content", "spam", &options));
    }

    #[test]
    fn substring_mode_matches_inside_words() {
        let options = MatchOptions {
            case_sensitive: false,
            word_boundaries: false,
        };
        assert!(contains_term("this is spam content", "spam", &options));
        assert!(contains_term("this is spammer content", "spam", &options));
    }

    #[test]
    fn case_sensitivity_is_honored() {
        let sensitive = MatchOptions {
            case_sensitive: true,
            word_boundaries: true,
        };
        assert!(!contains_term("Free SPAM here", "spam", &sensitive));

        let insensitive = MatchOptions::default();
        assert!(contains_term("Free SPAM here", "spam", &insensitive));
    }

    #[test]
    fn bio_scoped_rule_yields_one_violation_with_flat_score() {
        let mut rule = keyword_rule("casino,adult", 2.0);
        rule.target_fields = Some(vec![TargetField::Bio]);
        let loaded = KeywordDetector::compile(&rule).unwrap();

        let account = account_with_bio("best casino in town");
        let violations = loaded.evaluate(&rule, &account, &[]);

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].score, 2.0);
        assert_eq!(violations[0].evidence.matched_terms, vec!["casino"]);
    }

    #[test]
    fn content_field_aggregates_posts() {
        let mut rule = keyword_rule("casino", 1.0);
        rule.target_fields = Some(vec![TargetField::Content]);
        let loaded = KeywordDetector::compile(&rule).unwrap();

        let account = account_with_bio("harmless bio");
        let posts = vec![
            post("10", "visit my casino"),
            post("11", "nothing"),
            post("12", "casino again"),
        ];
        let violations = loaded.evaluate(&rule, &account, &posts);

        assert_eq!(violations.len(), 1);
        assert_eq!(
            violations[0].evidence.matched_status_ids,
            vec!["10".to_string(), "12".to_string()]
        );
    }

    #[test]
    fn multiple_matched_terms_still_score_once() {
        let mut rule = keyword_rule("casino,adult", 2.0);
        rule.target_fields = Some(vec![TargetField::Bio]);
        let loaded = KeywordDetector::compile(&rule).unwrap();

        let account = account_with_bio("adult casino fun");
        let violations = loaded.evaluate(&rule, &account, &[]);

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].score, 2.0);
        assert_eq!(violations[0].evidence.matched_terms.len(), 2);
    }

    #[test]
    fn empty_pattern_fails_compile() {
        let rule = keyword_rule(" , ,", 1.0);
        assert!(KeywordDetector::compile(&rule).is_err());
    }
}
