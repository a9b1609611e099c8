//! Quota/entitlement collaborator interface.
//!
//! Admission control proper (plans, credits, tiering) lives upstream; the
//! gate only asks for an allow/deny verdict before any queue interaction.
//! A denial must leave no trace in the durable tables.

use async_trait::async_trait;

use renderq_models::WorkKind;

/// Verdict from the entitlement service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allow,
    Deny(String),
}

/// Upstream quota check, consulted before admission.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check_quota(&self, identity: &str, kind: WorkKind) -> QuotaDecision;
}

/// Quota gate that admits everything.
///
/// Used when entitlement enforcement happens at an outer layer (or not at
/// all, e.g. internal deployments).
pub struct AllowAllQuota;

#[async_trait]
impl QuotaGate for AllowAllQuota {
    async fn check_quota(&self, _identity: &str, _kind: WorkKind) -> QuotaDecision {
        QuotaDecision::Allow
    }
}
