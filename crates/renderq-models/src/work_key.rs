//! Content-addressed work fingerprints.
//!
//! A [`WorkKey`] deterministically identifies one unit of render work:
//! identical semantic inputs always produce the identical key, independent
//! of field ordering in the wire request or floating-point noise in the
//! time range. The key doubles as the poll token and as the primary key of
//! both durable tables.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::request::RenderSpec;

/// Length of the hex-encoded key.
pub const WORK_KEY_LEN: usize = 64;

/// SHA-256 fingerprint of a unit of work, as 64 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct WorkKey(String);

impl WorkKey {
    /// Compute the fingerprint for a normalized request.
    ///
    /// The canonical encoding is length-prefixed per field so opaque ids
    /// cannot collide across field boundaries, and times enter as rounded
    /// milliseconds. Every input the render collaborator consumes must
    /// appear here; audit this function when adding options.
    pub fn compute(spec: &RenderSpec) -> Self {
        let mut canon = String::with_capacity(128);
        push_field(&mut canon, spec.kind.as_str());
        push_field(&mut canon, &spec.source.asset_id);
        push_field(&mut canon, &spec.source.container_id);
        push_field(&mut canon, &spec.time_range.start_ms().to_string());
        push_field(&mut canon, &spec.time_range.end_ms().to_string());
        push_field(&mut canon, if spec.options.subtitles { "subs=1" } else { "subs=0" });
        push_field(&mut canon, spec.options.aspect.as_str());

        let digest = Sha256::digest(canon.as_bytes());
        Self(format!("{:x}", digest))
    }

    /// Parse a key from its hex form (e.g. an incoming poll token).
    pub fn parse(s: &str) -> Result<Self, WorkKeyError> {
        if s.len() != WORK_KEY_LEN {
            return Err(WorkKeyError::InvalidLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(WorkKeyError::InvalidEncoding);
        }
        Ok(Self(s.to_string()))
    }

    /// Get the inner hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn push_field(buf: &mut String, field: &str) {
    buf.push_str(&field.len().to_string());
    buf.push(':');
    buf.push_str(field);
    buf.push('|');
}

/// Work key parsing error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkKeyError {
    #[error("Invalid key length {0}, expected 64 hex chars")]
    InvalidLength(usize),

    #[error("Key must be lowercase hex")]
    InvalidEncoding,
}
