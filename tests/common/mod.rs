#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use aq_store::{AnomalyStore, Row};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Initialize tracing once for integration tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .init();
    });
}

/// Generate a unique temporary DuckDB path for a test.
pub fn temp_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("aq_{test_name}_{nanos}.duckdb"))
}

/// Build a default config with a test-scoped DB path.
pub fn temp_config(test_name: &str) -> aq_config::AqConfig {
    let mut config = aq_config::AqConfig::default();
    config.store.db_path = temp_db_path(test_name);
    config.store.retry_backoff_ms = 5;
    config
}

/// Fixed "now" shared by the fixtures and the service clock
pub fn fixture_now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 9, 14)
        .unwrap()
        .and_hms_opt(18, 0, 0)
        .unwrap()
}

pub fn hours_ago(hours: i64) -> NaiveDateTime {
    fixture_now() - TimeDelta::hours(hours)
}

/// An anomalous observation well outside its interval
pub fn anomaly(variable: &str, at: NaiveDateTime, score: f64) -> Row {
    Row::new(at, variable, 140.0, 100.0, 95.0, 105.0).with_score(score)
}

/// An observation inside its interval
pub fn normal(variable: &str, at: NaiveDateTime) -> Row {
    Row::new(at, variable, 100.5, 100.0, 95.0, 105.0).with_score(2.0)
}

/// Eight anomalies in the last day scored 60, 76, 81, 90, 95, 40, 77, 88,
/// plus normal points and an older anomaly outside a 24 hour window.
pub fn scenario_rows() -> Vec<Row> {
    let variables = ["ARO_FC103", "ARO_LC101", "ARO_PC101", "ARO_FC105"];
    let scores = [60.0, 76.0, 81.0, 90.0, 95.0, 40.0, 77.0, 88.0];

    let mut rows: Vec<Row> = scores
        .iter()
        .enumerate()
        .map(|(i, score)| anomaly(variables[i % variables.len()], hours_ago(i as i64 + 1), *score))
        .collect();
    for (i, variable) in variables.iter().enumerate() {
        rows.push(normal(variable, hours_ago(i as i64 + 2)));
    }
    rows.push(anomaly("ARO_FC103", hours_ago(30), 99.0));
    rows
}

pub fn seeded_store(rows: &[Row]) -> AnomalyStore {
    let store = AnomalyStore::open_memory().expect("open in-memory store");
    store.insert_rows(rows).expect("insert fixture rows");
    store
}
