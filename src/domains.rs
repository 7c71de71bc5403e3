//! Per-domain violation accounting. Every cross-domain violation bumps a
//! counter; crossing the domain's threshold flips a defederation marker
//! exactly once. The marker never auto-clears, an operator has to do that.

use anyhow::Result;

use crate::store::{DomainAlertRow, Store};

pub const DEFEDERATION_ACTOR: &str = "automated_system";

pub struct DomainTracker {
    store: Store,
    default_threshold: u32,
}

impl DomainTracker {
    pub fn new(store: Store, default_threshold: u32) -> Self {
        DomainTracker {
            store,
            default_threshold,
        }
    }

    /// Count one violation against `domain`. Returns the alert row when this
    /// call crossed the threshold, None otherwise.
    pub fn track_violation(&self, domain: &str) -> Result<Option<DomainAlertRow>> {
        if domain == "local" || domain.is_empty() {
            return Ok(None);
        }
        self.store
            .record_domain_violation(domain, self.default_threshold)?;
        let alert = match self.store.get_domain_alert(domain)? {
            Some(alert) => alert,
            None => return Ok(None),
        };
        if alert.is_defederated || alert.violation_count < alert.defederation_threshold {
            return Ok(None);
        }
        let notes = format!(
            "Automatic defederation after {} violations",
            alert.violation_count
        );
        // The UPDATE is guarded on is_defederated = 0, so two racing workers
        // cannot both observe the flip.
        if !self
            .store
            .mark_defederated(domain, DEFEDERATION_ACTOR, &notes)?
        {
            return Ok(None);
        }
        log::warn!(
            "domain {domain} crossed defederation threshold ({} violations)",
            alert.violation_count
        );
        self.store.get_domain_alert(domain)
    }

    pub fn list_alerts(&self, limit: u32) -> Result<Vec<DomainAlertRow>> {
        self.store.list_domain_alerts(limit)
    }
}
