//! Store metrics collection.
//!
//! Provides standardized metrics for monitoring the durable tables:
//! - Operation counters by operation and outcome
//! - Conditional-write conflict counter (lost CAS races)

use metrics::counter;

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Total store operations by operation and outcome.
    pub const OPERATIONS_TOTAL: &str = "renderq_store_operations_total";

    /// Conditional writes that found their precondition already violated.
    pub const CONFLICTS_TOTAL: &str = "renderq_store_conflicts_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record a completed store operation.
pub fn record_operation(operation: &'static str, ok: bool) {
    counter!(
        names::OPERATIONS_TOTAL,
        "operation" => operation,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

/// Record a conditional write that lost its race (precondition not met).
pub fn record_conflict(operation: &'static str) {
    counter!(
        names::CONFLICTS_TOTAL,
        "operation" => operation
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::OPERATIONS_TOTAL.contains("operations"));
        assert!(names::CONFLICTS_TOTAL.contains("conflicts"));
    }
}
