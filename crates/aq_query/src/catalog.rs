//! Fixed catalog of parameterized row queries.
//!
//! Each [`QueryId`] maps to one SQL template. Only the clause fragments in
//! this file are ever concatenated into SQL text; every value from a
//! [`QuerySpec`] travels as a bound [`SqlParam`].

use aq_store::schema::{ROW_PROJECTION, tables};
use aq_store::{QueryRequest, SqlParam};
use chrono::NaiveDateTime;

use crate::query_spec::{QueryId, QuerySpec};

const ANOMALIES_ONLY: &str = "is_anomaly = TRUE";
const SCORED_ONLY: &str = "anomaly_score IS NOT NULL";

const BY_SCORE: &str = "anomaly_score DESC, ds DESC";
const BY_TIME: &str = "ds ASC, variable ASC";
const BY_VARIABLE: &str = "variable ASC, ds ASC";
const BY_SCORE_VALUE: &str = "anomaly_score ASC";

struct SqlBuilder {
    conditions: Vec<&'static str>,
    params: Vec<SqlParam>,
}

impl SqlBuilder {
    fn new() -> Self {
        Self {
            conditions: Vec::new(),
            params: Vec::new(),
        }
    }

    fn filter(&mut self, condition: &'static str) -> &mut Self {
        self.conditions.push(condition);
        self
    }

    fn bind(&mut self, condition: &'static str, param: SqlParam) -> &mut Self {
        self.conditions.push(condition);
        self.params.push(param);
        self
    }

    fn build(self, order_by: &str) -> QueryRequest {
        let mut sql = format!(
            "SELECT {ROW_PROJECTION} FROM {}",
            tables::ANOMALY_DETECTOR
        );
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(order_by);
        QueryRequest::new(sql, self.params)
    }
}

/// Extra filter a catalog entry applies on top of the shared parameters
fn entry_filter(query_id: QueryId) -> Option<&'static str> {
    match query_id {
        QueryId::RecentAnomalies
        | QueryId::CriticalAlerts
        | QueryId::TimelineHourly
        | QueryId::TopVariables => Some(ANOMALIES_ONLY),
        QueryId::ScoreHistogram => Some(SCORED_ONLY),
        QueryId::PerVariableSummary
        | QueryId::TimelineDaily
        | QueryId::HeatmapMatrix
        | QueryId::VariableTrend => None,
    }
}

fn entry_order(query_id: QueryId) -> &'static str {
    match query_id {
        QueryId::RecentAnomalies | QueryId::CriticalAlerts => BY_SCORE,
        QueryId::PerVariableSummary | QueryId::HeatmapMatrix | QueryId::TopVariables => {
            BY_VARIABLE
        }
        QueryId::ScoreHistogram => BY_SCORE_VALUE,
        QueryId::TimelineDaily | QueryId::TimelineHourly | QueryId::VariableTrend => BY_TIME,
    }
}

/// Build the store request for `spec`, resolving trailing windows at `now`.
///
/// Row limits are not pushed down: rows dropped by integrity validation must
/// not shrink a ranked result, so truncation happens after validation.
#[must_use]
pub fn build_request(spec: &QuerySpec, now: NaiveDateTime) -> QueryRequest {
    let mut sql = SqlBuilder::new();

    if let Some(condition) = entry_filter(spec.query_id) {
        sql.filter(condition);
    }

    let (start, end) = spec.params.window.resolve(now);
    if let Some(start) = start {
        sql.bind("ds >= ?", SqlParam::Timestamp(start));
    }
    if let Some(end) = end {
        sql.bind("ds < ?", SqlParam::Timestamp(end));
    }
    if let Some(variable) = &spec.params.variable {
        sql.bind("variable = ?", SqlParam::Text(variable.clone()));
    }
    if let Some(min_score) = spec.params.min_score {
        sql.bind("anomaly_score >= ?", SqlParam::Float(min_score.value()));
    }

    sql.build(entry_order(spec.query_id))
}
