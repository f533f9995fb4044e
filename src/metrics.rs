//! Metric helpers for reassembly tables.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Every series carries a `table`
//! label naming the reassembly table. With the `metrics` feature disabled the
//! helpers compile to nothing.

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::fragment::AnomalyKind;

/// Name of the counter tracking fragments accepted into a reconstruction.
pub const FRAGMENTS_TOTAL: &str = "reassembly_fragments_total";
/// Name of the counter tracking completed messages.
pub const COMPLETED_TOTAL: &str = "reassembly_completed_total";
/// Name of the counter tracking newly recorded anomalies.
pub const ANOMALIES_TOTAL: &str = "reassembly_anomalies_total";
/// Name of the counter tracking rejected operations.
pub const ERRORS_TOTAL: &str = "reassembly_errors_total";

/// Record a fragment handed to `table`.
pub fn inc_fragments(table: &str) {
    #[cfg(feature = "metrics")]
    counter!(FRAGMENTS_TOTAL, "table" => table.to_owned()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = table;
}

/// Record a message completed in `table`.
pub fn inc_completed(table: &str) {
    #[cfg(feature = "metrics")]
    counter!(COMPLETED_TOTAL, "table" => table.to_owned()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = table;
}

/// Record an anomaly newly observed in `table`.
pub fn inc_anomalies(table: &str, kind: AnomalyKind) {
    #[cfg(feature = "metrics")]
    counter!(ANOMALIES_TOTAL, "table" => table.to_owned(), "kind" => kind.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = (table, kind);
}

/// Record an operation on `table` that returned an error.
pub fn inc_errors(table: &str) {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL, "table" => table.to_owned()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = table;
}
