//! Render request types and validation.
//!
//! A [`WorkRequest`] is the unvalidated client-facing shape. It is never
//! persisted; admission validates it, normalizes the time range, and folds
//! it into a [`crate::WorkKey`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::product::WorkKind;

/// Maximum reasonable clip window (24 hours in seconds).
pub const MAX_RANGE_SECS: f64 = 86400.0;

/// Clip length used when a request carries no explicit time range.
pub const DEFAULT_CLIP_SECS: f64 = 60.0;

/// Reference to a source asset inside a container (upload batch, channel, etc.).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SourceRef {
    /// Source asset ID
    pub asset_id: String,
    /// Container the asset lives in
    pub container_id: String,
}

impl SourceRef {
    pub fn new(asset_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            container_id: container_id.into(),
        }
    }
}

/// Half-open time window into the source asset, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TimeRange {
    /// Start offset in seconds
    pub start_secs: f64,
    /// End offset in seconds
    pub end_secs: f64,
}

impl TimeRange {
    /// Create a validated time range.
    pub fn new(start_secs: f64, end_secs: f64) -> Result<Self, RequestError> {
        let range = Self {
            start_secs,
            end_secs,
        };
        range.validate()?;
        Ok(range)
    }

    /// Validate ordering and bounds.
    pub fn validate(&self) -> Result<(), RequestError> {
        if !self.start_secs.is_finite() || !self.end_secs.is_finite() {
            return Err(RequestError::NonFiniteRange);
        }
        if self.start_secs < 0.0 || self.end_secs < 0.0 {
            return Err(RequestError::NegativeRange);
        }
        if self.start_secs >= self.end_secs {
            return Err(RequestError::StartNotBeforeEnd);
        }
        if self.end_secs > MAX_RANGE_SECS {
            return Err(RequestError::ExceedsMaxRange(MAX_RANGE_SECS));
        }
        Ok(())
    }

    /// Start offset rounded to whole milliseconds.
    ///
    /// All fingerprinting goes through the millisecond form so that
    /// floating-point noise (10.0 vs 10.000000001) cannot split the key
    /// space for semantically identical requests.
    pub fn start_ms(&self) -> i64 {
        (self.start_secs * 1000.0).round() as i64
    }

    /// End offset rounded to whole milliseconds.
    pub fn end_ms(&self) -> i64 {
        (self.end_secs * 1000.0).round() as i64
    }

    /// Window duration in seconds, from the rounded endpoints.
    pub fn duration_secs(&self) -> f64 {
        (self.end_ms() - self.start_ms()) as f64 / 1000.0
    }
}

/// Output aspect treatment for the rendered clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    /// Keep the source aspect ratio
    #[default]
    Source,
    /// 9:16 portrait crop
    Portrait,
    /// 1:1 square crop
    Square,
}

impl Aspect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aspect::Source => "source",
            Aspect::Portrait => "portrait",
            Aspect::Square => "square",
        }
    }
}

/// Render option set.
///
/// Every field here feeds the work fingerprint; an option the render
/// pipeline consumes but the fingerprint ignores would let two different
/// artifacts share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub struct ClipOptions {
    /// Burn subtitles into the clip
    #[serde(default)]
    pub subtitles: bool,
    /// Output aspect treatment
    #[serde(default)]
    pub aspect: Aspect,
}

/// A client request for a derived clip. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkRequest {
    /// Kind of artifact requested
    pub kind: WorkKind,
    /// Source asset reference
    pub source: SourceRef,
    /// Requested window; `None` derives a default leading window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Render options
    #[serde(default)]
    pub options: ClipOptions,
}

impl WorkRequest {
    /// Create a clip request.
    pub fn clip(source: SourceRef, time_range: Option<TimeRange>, options: ClipOptions) -> Self {
        Self {
            kind: WorkKind::Clip,
            source,
            time_range,
            options,
        }
    }

    /// Validate the request and fold it into its normalized form.
    ///
    /// Rejection happens here, before any hashing or persistence: a
    /// malformed request must never reach the durable tables.
    pub fn normalize(&self) -> Result<RenderSpec, RequestError> {
        if self.source.asset_id.trim().is_empty() {
            return Err(RequestError::MissingSource("asset_id"));
        }
        if self.source.container_id.trim().is_empty() {
            return Err(RequestError::MissingSource("container_id"));
        }

        let time_range = match self.time_range {
            Some(range) => {
                range.validate()?;
                range
            }
            // No range requested: leading window of the asset.
            None => TimeRange::new(0.0, DEFAULT_CLIP_SECS)?,
        };

        Ok(RenderSpec {
            kind: self.kind,
            source: self.source.clone(),
            time_range,
            options: self.options,
        })
    }
}

/// Normalized, validated render parameters.
///
/// This is what gets fingerprinted and what travels with the work product,
/// so any instance that claims the lease can execute the render without
/// the original submitter being alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenderSpec {
    /// Kind of artifact requested
    pub kind: WorkKind,
    /// Source asset reference
    pub source: SourceRef,
    /// Validated clip window
    pub time_range: TimeRange,
    /// Render options
    pub options: ClipOptions,
}

/// Request validation error. Never persisted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("Missing source reference: {0}")]
    MissingSource(&'static str),

    #[error("Time range values must be finite")]
    NonFiniteRange,

    #[error("Time range cannot be negative")]
    NegativeRange,

    #[error("Start time must be before end time")]
    StartNotBeforeEnd,

    #[error("Time range exceeds maximum window ({0} seconds)")]
    ExceedsMaxRange(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_validation() {
        assert!(TimeRange::new(0.0, 30.0).is_ok());
        assert!(matches!(
            TimeRange::new(30.0, 10.0),
            Err(RequestError::StartNotBeforeEnd)
        ));
        assert!(matches!(
            TimeRange::new(10.0, 10.0),
            Err(RequestError::StartNotBeforeEnd)
        ));
        assert!(matches!(
            TimeRange::new(-1.0, 10.0),
            Err(RequestError::NegativeRange)
        ));
        assert!(matches!(
            TimeRange::new(0.0, f64::NAN),
            Err(RequestError::NonFiniteRange)
        ));
        assert!(matches!(
            TimeRange::new(0.0, MAX_RANGE_SECS + 1.0),
            Err(RequestError::ExceedsMaxRange(_))
        ));
    }

    #[test]
    fn test_time_range_millisecond_rounding() {
        let a = TimeRange::new(10.0, 20.0).unwrap();
        let b = TimeRange::new(10.000_000_1, 19.999_999_9).unwrap();
        assert_eq!(a.start_ms(), b.start_ms());
        assert_eq!(a.end_ms(), b.end_ms());
        assert_eq!(a.duration_secs(), 10.0);
    }

    #[test]
    fn test_missing_source_rejected() {
        let req = WorkRequest::clip(SourceRef::new("", "c1"), None, ClipOptions::default());
        assert!(matches!(
            req.normalize(),
            Err(RequestError::MissingSource("asset_id"))
        ));

        let req = WorkRequest::clip(SourceRef::new("a1", "  "), None, ClipOptions::default());
        assert!(matches!(
            req.normalize(),
            Err(RequestError::MissingSource("container_id"))
        ));
    }

    #[test]
    fn test_default_range_derived() {
        let req = WorkRequest::clip(SourceRef::new("a1", "c1"), None, ClipOptions::default());
        let spec = req.normalize().unwrap();
        assert_eq!(spec.time_range.start_secs, 0.0);
        assert_eq!(spec.time_range.end_secs, DEFAULT_CLIP_SECS);
        assert_eq!(spec.kind, WorkKind::Clip);
    }
}
