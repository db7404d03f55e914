//! API Router
//!
//! Combines the list-view, catalog, and health endpoints into a unified
//! router.

use axum::routing::get;
use axum::Router;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use std::sync::Arc;

use crate::query::error::QueryError;
use crate::shared::state::AppState;

/// Configure all API routes from all modules
pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(crate::leads::api::configure())
        .merge(crate::projects::api::configure())
        .merge(crate::catalog::configure())
        .route("/health", get(health))
}

#[derive(QueryableByName)]
struct HealthRow {
    #[diesel(sql_type = Integer)]
    #[allow(dead_code)]
    ok: i32,
}

async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<&'static str, QueryError> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| QueryError::Connection(e.to_string()))?;
    let _: Vec<HealthRow> = diesel::sql_query("SELECT 1 AS ok")
        .load(&mut conn)
        .map_err(QueryError::from_db)?;
    Ok("ok")
}
