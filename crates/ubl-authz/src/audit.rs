// SPDX-License-Identifier: MIT OR Apache-2.0

//! Audit entries for authorization decisions.
//!
//! Audit entries are themselves events: the runtime appends one per
//! decision (allow or deny), so the audit trail inherits the ledger's
//! tamper evidence.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_core::{ActorRef, EventInput, EventInputBuilder, LedgerResult};
use ubl_domain::{aggregate_types, event_types};

use crate::{AccessDecision, AccessRequest};

/// A recorded authorization decision with its full chain of reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditEntry {
    /// The request as evaluated.
    pub request: AccessRequest,
    /// The decision, grants, and reasoning.
    pub decision: AccessDecision,
}

impl AuditEntry {
    /// Pair a request with its decision.
    #[must_use]
    pub fn new(request: AccessRequest, decision: AccessDecision) -> Self {
        Self { request, decision }
    }

    /// Render the entry as an event input on the audit aggregate.
    ///
    /// Each entry opens its own single-event aggregate, so audit appends
    /// never contend on versions.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the entry cannot be serialized.
    pub fn to_event_input(&self) -> LedgerResult<EventInput> {
        let payload = serde_json::to_value(self)?;
        Ok(EventInputBuilder::new(
            event_types::ACCESS_EVALUATED,
            aggregate_types::AUDIT,
            format!("audit-{}", ubl_core::new_event_id()),
        )
        .version(1)
        .payload(payload)
        .actor(ActorRef::system_component("ledger", "authz"))
        .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccessContext;
    use chrono::{TimeZone, Utc};

    fn entry(allowed: bool) -> AuditEntry {
        AuditEntry::new(
            AccessRequest {
                actor: ActorRef::party("ent-john"),
                action: "read".into(),
                resource: "Realm:realm-1".into(),
                context: AccessContext::at(Utc.timestamp_millis_opt(1_000).unwrap()),
            },
            AccessDecision {
                allowed,
                granted_by: vec![],
                denied_by_policy: (!allowed).then(|| "lockdown".to_string()),
                allowed_by_policy: None,
                reasoning: vec!["test".into()],
            },
        )
    }

    #[test]
    fn audit_entry_round_trips() {
        let e = entry(true);
        let json = serde_json::to_string(&e).unwrap();
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn denials_are_audited_too() {
        let input = entry(false).to_event_input().unwrap();
        assert_eq!(input.event_type, event_types::ACCESS_EVALUATED);
        assert_eq!(input.aggregate_type, aggregate_types::AUDIT);
        assert_eq!(input.aggregate_version, 1);
        assert_eq!(input.payload["decision"]["allowed"], false);
        assert_eq!(
            input.payload["decision"]["denied_by_policy"],
            "lockdown"
        );
    }

    #[test]
    fn each_entry_gets_its_own_aggregate() {
        let a = entry(true).to_event_input().unwrap();
        let b = entry(true).to_event_input().unwrap();
        assert_ne!(a.aggregate_id, b.aggregate_id);
    }
}
