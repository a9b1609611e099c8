//! Execution leases.
//!
//! A [`LeaseRecord`] coordinates which worker instance is currently
//! executing a unit of work. It is 1:1 with the work product by key but
//! governs execution only, never result visibility. Liveness is tracked
//! via heartbeat; a processing lease whose heartbeat goes quiet past the
//! reaper cutoff is presumed abandoned.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::work_key::WorkKey;

/// Lease status. Terminal outcomes live on the product; a lease is either
/// waiting or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Available for any instance to claim
    #[default]
    Queued,
    /// Held by `owner_instance_id`
    Processing,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Queued => "queued",
            LeaseStatus::Processing => "processing",
        }
    }

    /// Parse from the persisted string form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(LeaseStatus::Queued),
            "processing" => Some(LeaseStatus::Processing),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable execution-coordination record, 1:1 with a work product.
///
/// Invariant: `Processing` implies `owner_instance_id` is set and
/// `heartbeat_at` is being refreshed at an interval strictly shorter than
/// the reaper staleness cutoff.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LeaseRecord {
    /// Work fingerprint (primary key, foreign to the product)
    pub key: WorkKey,
    /// Current status
    pub status: LeaseStatus,
    /// Instance currently holding the lease
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_instance_id: Option<String>,
    /// When the current owner claimed the lease
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// When execution started under the current owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Executions attempted so far (including crash recoveries)
    #[serde(default)]
    pub attempt_count: u32,
    /// Error from the most recent attempt, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl LeaseRecord {
    /// Create a fresh queued lease.
    pub fn new_queued(key: WorkKey) -> Self {
        Self {
            key,
            status: LeaseStatus::Queued,
            owner_instance_id: None,
            claimed_at: None,
            heartbeat_at: None,
            started_at: None,
            attempt_count: 0,
            last_error: None,
        }
    }

    /// Claim the lease for an instance.
    pub fn claim(&mut self, owner: impl Into<String>) {
        let now = Utc::now();
        self.status = LeaseStatus::Processing;
        self.owner_instance_id = Some(owner.into());
        self.claimed_at = Some(now);
        self.heartbeat_at = Some(now);
        self.started_at = Some(now);
    }

    /// Record a liveness signal.
    pub fn record_heartbeat(&mut self) {
        self.heartbeat_at = Some(Utc::now());
    }

    /// Release the lease back to the queue, clearing ownership.
    pub fn release(&mut self, attempt_increment: u32, last_error: Option<String>) {
        self.status = LeaseStatus::Queued;
        self.owner_instance_id = None;
        self.claimed_at = None;
        self.heartbeat_at = None;
        self.started_at = None;
        self.attempt_count = self.attempt_count.saturating_add(attempt_increment);
        self.last_error = last_error;
    }

    /// Check whether this lease is held by the given instance.
    pub fn owned_by(&self, instance_id: &str) -> bool {
        self.status == LeaseStatus::Processing
            && self.owner_instance_id.as_deref() == Some(instance_id)
    }

    /// Check whether a processing lease has gone stale.
    ///
    /// Stale means the owner stopped heartbeating past the cutoff, or
    /// never heartbeat at all and claimed longer ago than the cutoff
    /// (crashed between claim and first heartbeat).
    pub fn is_stale(&self, cutoff_secs: i64) -> bool {
        if self.status != LeaseStatus::Processing {
            return false;
        }

        let now = Utc::now();
        match self.heartbeat_at {
            Some(hb) => (now - hb).num_seconds() > cutoff_secs,
            None => match self.claimed_at {
                Some(claimed) => (now - claimed).num_seconds() > cutoff_secs,
                // Processing with neither timestamp is already invariant
                // breakage; treat as stale so the reaper repairs it.
                None => true,
            },
        }
    }
}
