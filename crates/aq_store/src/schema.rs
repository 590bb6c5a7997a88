//! Schema definitions and constants

/// Table names
pub mod tables {
    pub const ANOMALY_DETECTOR: &str = "anomaly_detector";
}

/// Projection every row query selects, in [`crate::Row`] field order.
///
/// Nullable flag columns collapse to `FALSE`; a missing residual is derived
/// from the actual and predicted values.
pub const ROW_PROJECTION: &str = "ds, variable, y, yhat, yhat_lower, yhat_upper, \
     COALESCE(residual, y - yhat) AS residual, \
     COALESCE(outside_interval, FALSE) AS outside_interval, \
     COALESCE(high_residual, FALSE) AS high_residual, \
     COALESCE(is_anomaly, FALSE) AS is_anomaly, \
     anomaly_score, \
     COALESCE(prediction_error_pct, 0.0) AS prediction_error_pct";

/// Insert statement used by [`crate::AnomalyStore::insert_rows`]
pub const INSERT_ROW: &str = "INSERT INTO anomaly_detector \
     (ds, variable, y, yhat, yhat_lower, yhat_upper, residual, outside_interval, \
      high_residual, is_anomaly, anomaly_score, prediction_error_pct) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";
