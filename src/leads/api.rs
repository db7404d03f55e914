use crate::leads::{LeadListItem, LeadMetrics};
use crate::query::error::QueryError;
use crate::query::filters::ListParams;
use crate::query::PageResult;
use crate::shared::state::AppState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct ListViewState {
    pub initial_loading: bool,
    pub page_loading: bool,
    pub total: i64,
}

pub async fn list_leads(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<PageResult<LeadListItem>>, QueryError> {
    let request = params.into_page_request()?;
    let result = state.leads.fetch_page(request).await?;
    Ok(Json(result))
}

pub async fn refetch_leads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PageResult<LeadListItem>>, QueryError> {
    let result = state.leads.refetch().await?;
    Ok(Json(result))
}

pub async fn lead_metrics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LeadMetrics>, QueryError> {
    let metrics = state.leads.fetch_metrics().await?;
    Ok(Json(metrics))
}

pub async fn lead_list_state(State(state): State<Arc<AppState>>) -> Json<ListViewState> {
    let facade = &state.leads.facade;
    Json(ListViewState {
        initial_loading: facade.initial_loading.load(Ordering::SeqCst),
        page_loading: facade.page_loading.load(Ordering::SeqCst),
        total: facade.visible_total(),
    })
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/leads/list", get(list_leads))
        .route("/leads/refetch", post(refetch_leads))
        .route("/leads/metrics", get(lead_metrics))
        .route("/leads/state", get(lead_list_state))
}
