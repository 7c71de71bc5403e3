//! Automated moderation sidecar for a federated social instance. Polls the
//! admin account listing, evaluates accounts against stored rules, and
//! dispatches reports and moderation actions with a full audit trail.

pub mod client;
pub mod config;
pub mod detectors;
pub mod domains;
pub mod enforcement;
pub mod error;
pub mod jobs;
pub mod model;
pub mod reporting;
pub mod rule_store;
pub mod scanner;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use error::EngineError;
