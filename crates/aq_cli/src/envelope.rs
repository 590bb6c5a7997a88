//! JSON envelope wrapped around every query result
//!
//! Consumers get the same metadata regardless of which catalog entry ran:
//! a schema identifier, when the output was produced, when the rows were
//! fetched, whether the result is degraded and any data-quality warnings.

use aq_query::Served;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct QueryEnvelope<T: Serialize> {
    /// Schema version identifier (e.g. "aq.recent_anomalies.v1")
    pub schema_version: String,

    pub generated_at: NaiveDateTime,

    /// When the underlying rows were read from the store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<NaiveDateTime>,

    /// Rows came from an expired cache entry after a failed refresh
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,

    pub data: T,
}

impl<T: Serialize> QueryEnvelope<T> {
    pub fn new(name: &str, data: T) -> Self {
        Self {
            schema_version: format!("aq.{name}.v1"),
            generated_at: Local::now().naive_local(),
            fetched_at: None,
            degraded: false,
            warnings: Vec::new(),
            data,
        }
    }

    /// Wrap a served query result, carrying over its metadata
    pub fn served(name: &str, served: Served<T>) -> Self {
        let mut envelope = Self::new(name, served.data);
        envelope.fetched_at = Some(served.fetched_at);
        envelope.degraded = served.degraded;
        envelope.warnings = served.warnings;
        envelope
    }
}
