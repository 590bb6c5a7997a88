//! aq_query - Query layer for the anomaly query service
//!
//! This crate provides:
//! - The fixed catalog of parameterized anomaly queries
//! - A TTL result cache with single-flight fetches and serve-stale-on-error
//! - Pure aggregations (timelines, heatmap pivot, severity buckets, rankings)
//! - Row integrity validation
//! - `QueryService`, the entry point used by presentation layers

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregate;
pub mod cache;
pub mod catalog;
pub mod query_spec;
pub mod rowset;
pub mod service;
pub mod severity;

pub use aggregate::{
    Alert, DailyBucket, HeatmapMatrix, HourlyBucket, ScoreBin, ScoreHistogram, VariableRanking,
    VariableSummary,
};
pub use aq_store::{QueryRequest, Row, RowStore, SqlParam};
pub use cache::{CacheStatsSnapshot, CachedRows, EntryState, ResultCache};
pub use query_spec::{CacheKey, QueryId, QueryParams, QuerySpec, ScoreBound, TimeWindow};
pub use rowset::{IntegrityViolation, RowSet};
pub use service::{Clock, QueryService, Served};
pub use severity::{SeverityLevel, SeverityThresholds};

/// Error categories surfaced to callers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionError,
    QueryError,
    InvalidParameters,
    DataIntegrity,
    Internal,
}

/// Query errors
///
/// Cloneable so a single failed fetch can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Row store unreachable: {0}")]
    Connection(String),

    #[error("Query rejected: {0}")]
    Query(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Connection(_) => ErrorKind::ConnectionError,
            QueryError::Query(_) => ErrorKind::QueryError,
            QueryError::InvalidParameters(_) => ErrorKind::InvalidParameters,
            QueryError::DataIntegrity(_) => ErrorKind::DataIntegrity,
            QueryError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidParameters(message.into())
    }
}

impl From<aq_store::StoreError> for QueryError {
    fn from(err: aq_store::StoreError) -> Self {
        match err {
            aq_store::StoreError::QueryError(e) => QueryError::Query(e.to_string()),
            other => QueryError::Connection(other.to_string()),
        }
    }
}
