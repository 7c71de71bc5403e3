//! Behavioral detector: the rule pattern names a behavior class and the
//! recent-posts window is reduced to metrics (posting rate, link domain
//! distribution, content repetition). The window is anchored at the newest
//! post so evaluation stays deterministic for a given input.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use url::Url;

use crate::error::EngineError;
use crate::model::{AdminAccount, BehavioralParams, Evidence, Post, Rule, Violation};

use super::make_violation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorClass {
    RapidPosting,
    LinkSpam,
    AutomationDisclosure,
    NewAccountActivity,
}

impl BehaviorClass {
    fn parse(pattern: &str) -> Option<BehaviorClass> {
        match pattern.trim().to_lowercase().as_str() {
            "rapid_posting" => Some(BehaviorClass::RapidPosting),
            "link_spam" => Some(BehaviorClass::LinkSpam),
            "automation_disclosure" => Some(BehaviorClass::AutomationDisclosure),
            "new_account_activity" => Some(BehaviorClass::NewAccountActivity),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct BehavioralDetector {
    class: BehaviorClass,
    params: BehavioralParams,
    link_re: Regex,
}

impl BehavioralDetector {
    pub fn compile(rule: &Rule) -> Result<Self, EngineError> {
        let class = BehaviorClass::parse(&rule.pattern).ok_or_else(|| {
            EngineError::invariant(format!(
                "rule '{}' names unknown behavior class '{}'",
                rule.name, rule.pattern
            ))
        })?;
        let link_re = Regex::new(r#"https?://[^\s"'<>]+"#)
            .map_err(|e| EngineError::invariant(format!("link regex: {e}")))?;
        Ok(BehavioralDetector {
            class,
            params: rule.behavioral_params.clone().unwrap_or_default(),
            link_re,
        })
    }

    pub fn evaluate(
        &self,
        rule: &Rule,
        account: &AdminAccount,
        posts: &[Post],
    ) -> Vec<Violation> {
        let metrics = self.window_metrics(account, posts);
        let mut violations = Vec::new();

        let triggered = match self.class {
            BehaviorClass::RapidPosting => {
                metrics.posts_in_window >= self.params.post_threshold as usize
            }
            BehaviorClass::LinkSpam => metrics.total_links >= self.params.link_threshold as usize,
            BehaviorClass::AutomationDisclosure => {
                if account.account.bot {
                    // A disclosed bot is judged on raw throughput.
                    metrics.posting_rate >= self.params.post_rate_threshold
                } else {
                    // Undisclosed automation shows up as templated content.
                    metrics.posts_in_window >= 3
                        && metrics.repetition >= self.params.repetition_threshold
                }
            }
            BehaviorClass::NewAccountActivity => match metrics.account_age_days {
                Some(age) => {
                    age < self.params.min_account_age_days
                        && metrics.posts_in_window >= self.params.post_threshold as usize
                }
                None => false,
            },
        };

        if triggered {
            violations.push(make_violation(rule, metrics.into_evidence(self.class)));
        }
        violations
    }

    fn window_metrics(&self, account: &AdminAccount, posts: &[Post]) -> WindowMetrics {
        let window_hours = self.params.time_window_hours.max(0.01);
        let anchor: Option<DateTime<Utc>> = posts.iter().filter_map(|p| p.created_at).max();

        let window_start =
            anchor.map(|a| a - Duration::seconds((window_hours * 3600.0) as i64));
        let in_window: Vec<&Post> = match window_start {
            Some(start) => posts
                .iter()
                .filter(|p| p.created_at.map_or(false, |t| t >= start))
                .collect(),
            // Without timestamps every fetched post counts toward the window.
            None => posts.iter().collect(),
        };

        let mut total_links = 0usize;
        let mut domains: HashSet<String> = HashSet::new();
        let mut templates: HashSet<String> = HashSet::new();
        for post in &in_window {
            for m in self.link_re.find_iter(&post.content) {
                total_links += 1;
                if let Ok(parsed) = Url::parse(m.as_str()) {
                    if let Some(host) = parsed.host_str() {
                        domains.insert(host.to_lowercase());
                    }
                }
            }
            templates.insert(normalize_template(&post.content));
        }

        let repetition = if in_window.is_empty() {
            0.0
        } else {
            1.0 - templates.len() as f64 / in_window.len() as f64
        };

        let account_age_days = match (anchor, account.account.created_at) {
            (Some(anchor), Some(created)) => Some((anchor - created).num_days()),
            _ => None,
        };

        WindowMetrics {
            posts_in_window: in_window.len(),
            window_hours,
            posting_rate: in_window.len() as f64 / window_hours,
            total_links,
            distinct_link_domains: domains.len(),
            repetition,
            account_age_days,
        }
    }
}

struct WindowMetrics {
    posts_in_window: usize,
    window_hours: f64,
    posting_rate: f64,
    total_links: usize,
    distinct_link_domains: usize,
    repetition: f64,
    account_age_days: Option<i64>,
}

impl WindowMetrics {
    fn into_evidence(self, class: BehaviorClass) -> Evidence {
        let mut evidence = Evidence::default();
        let m = &mut evidence.metrics;
        m.insert(
            "behavior".to_string(),
            serde_json::json!(format!("{class:?}")),
        );
        m.insert(
            "posts_in_window".to_string(),
            serde_json::json!(self.posts_in_window),
        );
        m.insert(
            "window_hours".to_string(),
            serde_json::json!(self.window_hours),
        );
        m.insert(
            "posting_rate".to_string(),
            serde_json::json!(self.posting_rate),
        );
        m.insert(
            "total_links".to_string(),
            serde_json::json!(self.total_links),
        );
        m.insert(
            "distinct_link_domains".to_string(),
            serde_json::json!(self.distinct_link_domains),
        );
        m.insert(
            "repetition".to_string(),
            serde_json::json!(self.repetition),
        );
        if let Some(age) = self.account_age_days {
            m.insert("account_age_days".to_string(), serde_json::json!(age));
        }
        evidence
    }
}

/// Collapse a post body to a template key so near-identical posts count as
/// repeats: tags stripped, lowercased, punctuation removed, prefix only.
fn normalize_template(content: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for c in content.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            _ if c.is_alphanumeric() || c.is_whitespace() => {
                out.extend(c.to_lowercase());
            }
            _ => {}
        }
    }
    let collapsed: String = out.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectorType;
    use crate::test_support::{account_with_bio, behavioral_rule, timed_post};
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn rapid_posting_trips_at_threshold() {
        let mut rule = behavioral_rule("rapid_posting", 3.0);
        rule.behavioral_params = Some(BehavioralParams {
            post_threshold: 5,
            time_window_hours: 1.0,
            ..BehavioralParams::default()
        });
        let detector = BehavioralDetector::compile(&rule).unwrap();
        let account = account_with_bio("");

        let posts: Vec<_> = (0..5)
            .map(|i| timed_post(&i.to_string(), "hi", base_time() - Duration::minutes(i)))
            .collect();
        let violations = detector.evaluate(&rule, &account, &posts);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_type, DetectorType::Behavioral);

        let few: Vec<_> = posts.into_iter().take(4).collect();
        assert!(detector.evaluate(&rule, &account, &few).is_empty());
    }

    #[test]
    fn posts_outside_window_do_not_count() {
        let mut rule = behavioral_rule("rapid_posting", 1.0);
        rule.behavioral_params = Some(BehavioralParams {
            post_threshold: 2,
            time_window_hours: 1.0,
            ..BehavioralParams::default()
        });
        let detector = BehavioralDetector::compile(&rule).unwrap();
        let account = account_with_bio("");

        let posts = vec![
            timed_post("1", "now", base_time()),
            timed_post("2", "long ago", base_time() - Duration::hours(5)),
        ];
        assert!(detector.evaluate(&rule, &account, &posts).is_empty());
    }

    #[test]
    fn link_spam_counts_links() {
        let mut rule = behavioral_rule("link_spam", 2.0);
        rule.behavioral_params = Some(BehavioralParams {
            link_threshold: 3,
            ..BehavioralParams::default()
        });
        let detector = BehavioralDetector::compile(&rule).unwrap();
        let account = account_with_bio("");

        let posts = vec![
            timed_post(
                "1",
                "see https://a.example/x and https://a.example/y",
                base_time(),
            ),
            timed_post("2", "also https://b.example/z", base_time()),
        ];
        let violations = detector.evaluate(&rule, &account, &posts);
        assert_eq!(violations.len(), 1);
        assert_eq!(
            violations[0].evidence.metrics["total_links"],
            serde_json::json!(3)
        );
        assert_eq!(
            violations[0].evidence.metrics["distinct_link_domains"],
            serde_json::json!(2)
        );
    }

    #[test]
    fn automation_disclosure_splits_on_bot_flag() {
        let mut rule = behavioral_rule("automation_disclosure", 1.0);
        rule.behavioral_params = Some(BehavioralParams {
            time_window_hours: 1.0,
            post_rate_threshold: 4.0,
            repetition_threshold: 0.5,
            ..BehavioralParams::default()
        });
        let detector = BehavioralDetector::compile(&rule).unwrap();

        // Bot at 5 posts/hour: over the rate threshold.
        let mut bot = account_with_bio("");
        bot.account.bot = true;
        let varied: Vec<_> = (0..5)
            .map(|i| {
                timed_post(
                    &i.to_string(),
                    &format!("unique post number {i}"),
                    base_time() - Duration::minutes(i),
                )
            })
            .collect();
        assert_eq!(detector.evaluate(&rule, &bot, &varied).len(), 1);

        // Non-bot with the same varied content: repetition is low, no hit.
        let human = account_with_bio("");
        assert!(detector.evaluate(&rule, &human, &varied).is_empty());

        // Non-bot posting the same template repeatedly: flagged.
        let templated: Vec<_> = (0..5)
            .map(|i| {
                timed_post(
                    &i.to_string(),
                    "Buy now at my shop!!!",
                    base_time() - Duration::minutes(i),
                )
            })
            .collect();
        assert_eq!(detector.evaluate(&rule, &human, &templated).len(), 1);
    }

    #[test]
    fn new_account_activity_needs_young_account_and_volume() {
        let mut rule = behavioral_rule("new_account_activity", 1.0);
        rule.behavioral_params = Some(BehavioralParams {
            post_threshold: 3,
            min_account_age_days: 7,
            time_window_hours: 24.0,
            ..BehavioralParams::default()
        });
        let detector = BehavioralDetector::compile(&rule).unwrap();

        let mut fresh = account_with_bio("");
        fresh.account.created_at = Some(base_time() - Duration::days(2));
        let posts: Vec<_> = (0..3)
            .map(|i| timed_post(&i.to_string(), "post", base_time() - Duration::hours(i)))
            .collect();
        assert_eq!(detector.evaluate(&rule, &fresh, &posts).len(), 1);

        let mut old = account_with_bio("");
        old.account.created_at = Some(base_time() - Duration::days(400));
        assert!(detector.evaluate(&rule, &old, &posts).is_empty());
    }

    #[test]
    fn unknown_class_fails_compile() {
        let rule = behavioral_rule("time_travel", 1.0);
        assert!(BehavioralDetector::compile(&rule).is_err());
    }
}
