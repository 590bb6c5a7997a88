//! Validated, immutable query results

use aq_store::Row;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::query_spec::QuerySpec;

/// A row dropped because its score lies outside `[0, 100]` or is not finite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub variable: String,
    pub timestamp: NaiveDateTime,
    pub score: f64,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dropped row {}@{}: anomaly_score {} outside [0, 100]",
            self.variable, self.timestamp, self.score
        )
    }
}

/// Rows returned by one catalog query, in store order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSet {
    pub spec: QuerySpec,
    pub fetched_at: NaiveDateTime,
    pub rows: Vec<Row>,
    pub violations: Vec<IntegrityViolation>,
}

impl RowSet {
    /// Keep rows whose score is absent or within bounds, recording the rest.
    #[must_use]
    pub fn validated(spec: QuerySpec, fetched_at: NaiveDateTime, rows: Vec<Row>) -> Self {
        let mut kept = Vec::with_capacity(rows.len());
        let mut violations = Vec::new();

        for row in rows {
            match row.anomaly_score {
                Some(score) if !score.is_finite() || !(0.0..=100.0).contains(&score) => {
                    warn!(
                        query = %spec.query_id,
                        variable = %row.variable,
                        timestamp = %row.timestamp,
                        score,
                        "Dropping row with out-of-range anomaly score"
                    );
                    violations.push(IntegrityViolation {
                        variable: row.variable,
                        timestamp: row.timestamp,
                        score,
                    });
                }
                _ => kept.push(row),
            }
        }

        Self {
            spec,
            fetched_at,
            rows: kept,
            violations,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Violation messages for `Served::warnings`
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}
