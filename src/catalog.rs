//! Catalog endpoints backing the filter UI: pipeline statuses and
//! custom-field definitions per entity kind.

use crate::query::error::QueryError;
use crate::shared::models::{CustomFieldDefinition, EntityKind, PipelineStatus};
use crate::shared::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use diesel::prelude::*;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct KindParams {
    pub kind: String,
}

fn parse_kind(raw: &str) -> Result<EntityKind, QueryError> {
    EntityKind::from_str(raw)
        .ok_or_else(|| QueryError::InvalidFilter(format!("unknown entity kind '{raw}'")))
}

pub async fn list_statuses(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KindParams>,
) -> Result<Json<Vec<PipelineStatus>>, QueryError> {
    use crate::shared::schema::pipeline_statuses::dsl::*;

    let kind = parse_kind(&params.kind)?;
    let org = state
        .orgs
        .active_org()?
        .ok_or(QueryError::NoOrganization)?;
    let mut conn = state
        .conn
        .get()
        .map_err(|e| QueryError::Connection(e.to_string()))?;

    let statuses = pipeline_statuses
        .filter(org_id.eq(org))
        .filter(entity_kind.eq(kind.as_str()))
        .order(sort_order.asc())
        .load::<PipelineStatus>(&mut conn)
        .map_err(QueryError::from_db)?;
    Ok(Json(statuses))
}

pub async fn list_field_definitions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KindParams>,
) -> Result<Json<Vec<CustomFieldDefinition>>, QueryError> {
    use crate::shared::schema::custom_field_definitions::dsl::*;

    let kind = parse_kind(&params.kind)?;
    let org = state
        .orgs
        .active_org()?
        .ok_or(QueryError::NoOrganization)?;
    let mut conn = state
        .conn
        .get()
        .map_err(|e| QueryError::Connection(e.to_string()))?;

    let definitions = custom_field_definitions
        .filter(org_id.eq(org))
        .filter(entity_kind.eq(kind.as_str()))
        .order(field_key.asc())
        .load::<CustomFieldDefinition>(&mut conn)
        .map_err(QueryError::from_db)?;
    Ok(Json(definitions))
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/catalog/statuses", get(list_statuses))
        .route("/catalog/fields", get(list_field_definitions))
}
