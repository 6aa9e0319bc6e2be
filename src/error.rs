use polars::error::PolarsError;
use thiserror::Error;

use crate::transforms::TransformError;

/// Failure while loading data from the warehouse.
///
/// Callers branch on [`LoadError::is_connection_failure`]: connectivity problems
/// may be papered over with mock data, anything else aborts the load.
#[derive(Clone, Debug, Error)]
pub enum LoadError {
    #[error("MOTHERDUCK_TOKEN environment variable not set")]
    MissingToken,
    #[error("failed to connect to database `{database}`: {message}")]
    Unavailable { database: String, message: String },
    #[error("query failed: {message}")]
    QueryFailed { message: String, sql: Option<String> },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid identifier `{0}`: only letters, digits and underscores are allowed")]
    InvalidIdentifier(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl LoadError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, LoadError::MissingToken | LoadError::Unavailable { .. })
    }

    pub fn query(message: impl Into<String>, sql: &str) -> Self {
        LoadError::QueryFailed {
            message: message.into(),
            sql: Some(sql.to_string()),
        }
    }

    /// SQL text of the failed statement, if one was issued.
    pub fn sql(&self) -> Option<&str> {
        match self {
            LoadError::QueryFailed { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }
}

impl From<TransformError> for LoadError {
    fn from(e: TransformError) -> Self {
        match e {
            TransformError::Polars(e) => e.into(),
            other => LoadError::InvalidData(other.to_string()),
        }
    }
}

impl From<PolarsError> for LoadError {
    fn from(e: PolarsError) -> Self {
        LoadError::QueryFailed {
            message: e.to_string(),
            sql: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_distinguished_from_query_failures() {
        assert!(LoadError::MissingToken.is_connection_failure());
        assert!(LoadError::Unavailable {
            database: "mca_data".into(),
            message: "timeout".into()
        }
        .is_connection_failure());
        let err = LoadError::query("no such table", "SELECT * FROM nope");
        assert!(!err.is_connection_failure());
        assert_eq!(err.sql(), Some("SELECT * FROM nope"));
        assert!(!LoadError::InvalidFilter("x".into()).is_connection_failure());

        let err = LoadError::from(TransformError::InvalidDenominator {
            column: "area_km2".into(),
            rows: 2,
        });
        assert!(matches!(err, LoadError::InvalidData(_)));
        assert!(!err.is_connection_failure());
    }
}
