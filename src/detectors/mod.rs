//! Rule detectors. Each variant turns one rule plus an account snapshot and
//! its recent posts into zero or more scored violations. Detectors are pure
//! with respect to their inputs and hold only state compiled from the rule
//! at load time, so a bad pattern fails when the rule is loaded, not on
//! every evaluation.

pub mod behavioral;
pub mod keyword;
pub mod media;
pub mod regex;

pub use behavioral::BehavioralDetector;
pub use keyword::KeywordDetector;
pub use media::MediaDetector;
pub use regex::RegexDetector;

use crate::error::EngineError;
use crate::model::{
    AdminAccount, DetectorType, Evidence, Post, Rule, TargetField, Violation,
};

/// A compiled detector for one rule.
#[derive(Debug)]
pub enum Detector {
    Keyword(KeywordDetector),
    Regex(RegexDetector),
    Behavioral(BehavioralDetector),
    Media(MediaDetector),
}

impl Detector {
    pub fn compile(rule: &Rule) -> Result<Self, EngineError> {
        match rule.detector_type {
            DetectorType::Keyword => KeywordDetector::compile(rule).map(Detector::Keyword),
            DetectorType::Regex => RegexDetector::compile(rule).map(Detector::Regex),
            DetectorType::Behavioral => {
                BehavioralDetector::compile(rule).map(Detector::Behavioral)
            }
            DetectorType::Media => MediaDetector::compile(rule).map(Detector::Media),
        }
    }

    pub fn evaluate(
        &self,
        rule: &Rule,
        account: &AdminAccount,
        posts: &[Post],
    ) -> Vec<Violation> {
        match self {
            Detector::Keyword(d) => d.evaluate(rule, account, posts),
            Detector::Regex(d) => d.evaluate(rule, account, posts),
            Detector::Behavioral(d) => d.evaluate(rule, account, posts),
            Detector::Media(d) => d.evaluate(rule, account, posts),
        }
    }
}

/// A rule paired with its compiled detector. This is what the rule store
/// hands out to the scan orchestrator.
#[derive(Debug)]
pub struct LoadedRule {
    pub rule: Rule,
    detector: Detector,
}

impl LoadedRule {
    pub fn compile(rule: Rule) -> Result<Self, EngineError> {
        let detector = Detector::compile(&rule)?;
        Ok(LoadedRule { rule, detector })
    }

    pub fn evaluate(&self, account: &AdminAccount, posts: &[Post]) -> Vec<Violation> {
        self.detector.evaluate(&self.rule, account, posts)
    }
}

/// The text of a profile-scoped field. `Content` has no single text; post
/// content is handled per post by each detector.
pub(crate) fn profile_text(field: TargetField, account: &AdminAccount) -> Option<&str> {
    match field {
        TargetField::Username => Some(&account.account.username),
        TargetField::DisplayName => Some(&account.account.display_name),
        TargetField::Bio => Some(&account.account.note),
        TargetField::Content => None,
    }
}

pub(crate) fn make_violation(rule: &Rule, evidence: Evidence) -> Violation {
    // Score is the flat rule weight: matching three terms in one field is
    // still one violation worth `weight`.
    Violation {
        rule_id: rule.id,
        rule_key: rule.key(),
        rule_type: rule.detector_type,
        score: rule.weight,
        evidence,
    }
}
