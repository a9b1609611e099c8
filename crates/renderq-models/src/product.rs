//! Durable work products.
//!
//! A [`WorkProduct`] is the content-addressed record of a unit of work's
//! result: one row per [`WorkKey`], living forever as the dedup cache.
//! Execution coordination lives on the companion lease record, not here.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::request::RenderSpec;
use crate::work_key::WorkKey;

/// Kind of derived artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Trimmed, optionally subtitled clip
    Clip,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Clip => "clip",
        }
    }

    /// Parse from the persisted string form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "clip" => Some(WorkKind::Clip),
            _ => None,
        }
    }
}

/// Kind-specific result payload.
///
/// Persisted as a tagged union rather than an opaque blob so each kind
/// keeps a typed schema at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultPayload {
    /// Result of a clip render
    Clip {
        /// Rendered clip duration in seconds
        duration_secs: f64,
        /// Output width in pixels
        width: u32,
        /// Output height in pixels
        height: u32,
        /// Whether subtitles were burned in
        subtitles_burned: bool,
    },
}

/// Work product status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    /// Waiting for a worker
    #[default]
    Queued,
    /// A worker is rendering
    Processing,
    /// Render finished, artifact available
    Completed,
    /// Render failed permanently
    Failed,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Queued => "queued",
            ProductStatus::Processing => "processing",
            ProductStatus::Completed => "completed",
            ProductStatus::Failed => "failed",
        }
    }

    /// Parse from the persisted string form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ProductStatus::Queued),
            "processing" => Some(ProductStatus::Processing),
            "completed" => Some(ProductStatus::Completed),
            "failed" => Some(ProductStatus::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state (no more transitions expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProductStatus::Completed | ProductStatus::Failed)
    }
}

impl std::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable, content-addressed record of a unit of work's result.
///
/// Invariants:
/// - exactly one product per key (primary key on the table)
/// - `Completed` implies `artifact_ref` set and `error` clear
/// - `Failed` implies `error` set and `artifact_ref` clear
/// - `Queued`/`Processing` imply both clear
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkProduct {
    /// Work fingerprint (primary key)
    pub key: WorkKey,
    /// Kind of artifact
    pub kind: WorkKind,
    /// Normalized render parameters, persisted so any instance can
    /// execute the work from the durable record alone
    pub spec: RenderSpec,
    /// Current status
    pub status: ProductStatus,
    /// Kind-specific result payload (terminal success only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<ResultPayload>,
    /// External storage locator for the artifact (terminal success only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    /// Failure description (terminal failure only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl WorkProduct {
    /// Create a fresh queued product.
    pub fn new_queued(key: WorkKey, spec: RenderSpec) -> Self {
        let now = Utc::now();
        Self {
            key,
            kind: spec.kind,
            spec,
            status: ProductStatus::Queued,
            result_payload: None,
            artifact_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the product is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark as processing.
    pub fn start(&mut self) {
        self.status = ProductStatus::Processing;
        self.updated_at = Utc::now();
    }

    /// Mark as completed with the produced artifact.
    pub fn complete(&mut self, artifact_ref: impl Into<String>, payload: ResultPayload) {
        self.status = ProductStatus::Completed;
        self.artifact_ref = Some(artifact_ref.into());
        self.result_payload = Some(payload);
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Mark as permanently failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ProductStatus::Failed;
        self.error = Some(error.into());
        self.artifact_ref = None;
        self.result_payload = None;
        self.updated_at = Utc::now();
    }

    /// Return the product to the queue (transient failure requeue).
    pub fn requeue(&mut self) {
        self.status = ProductStatus::Queued;
        self.updated_at = Utc::now();
    }

    /// Check the status/field invariants hold.
    pub fn invariants_hold(&self) -> bool {
        match self.status {
            ProductStatus::Completed => self.artifact_ref.is_some() && self.error.is_none(),
            ProductStatus::Failed => self.error.is_some() && self.artifact_ref.is_none(),
            ProductStatus::Queued | ProductStatus::Processing => {
                self.artifact_ref.is_none() && self.error.is_none()
            }
        }
    }
}
