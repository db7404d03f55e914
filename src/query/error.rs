use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

/// Errors the query layer surfaces to callers.
///
/// Capability absences (missing stored procedure, missing column, missing
/// typed projection) are deliberately not represented here: they are
/// recovered inside the layer by falling back or excluding columns, and only
/// show up in logs.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no active organization for this request")]
    NoOrganization,
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Database(String),
    #[error("custom field filter '{field}' could not be evaluated: {message}")]
    FilterEvaluation { field: String, message: String },
    #[error("invalid filter payload: {0}")]
    InvalidFilter(String),
}

impl QueryError {
    /// Maps a diesel error that is not recoverable as a capability absence.
    pub fn from_db(err: diesel::result::Error) -> Self {
        use crate::query::capability::{classify_db_error, DbErrorClass};
        match classify_db_error(&err) {
            DbErrorClass::Connection => Self::Connection(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            // Distinct from an empty list: the UI must render an error
            // state, not "you have no leads".
            Self::NoOrganization => StatusCode::CONFLICT,
            Self::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            Self::Connection(_) | Self::Database(_) | Self::FilterEvaluation { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
