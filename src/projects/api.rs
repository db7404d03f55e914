use crate::leads::api::ListViewState;
use crate::projects::ProjectListItem;
use crate::query::error::QueryError;
use crate::query::filters::ListParams;
use crate::query::PageResult;
use crate::shared::state::AppState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<PageResult<ProjectListItem>>, QueryError> {
    let request = params.into_page_request()?;
    let result = state.projects.fetch_page(request).await?;
    Ok(Json(result))
}

pub async fn refetch_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PageResult<ProjectListItem>>, QueryError> {
    let result = state.projects.refetch().await?;
    Ok(Json(result))
}

pub async fn project_list_state(State(state): State<Arc<AppState>>) -> Json<ListViewState> {
    Json(ListViewState {
        initial_loading: state.projects.initial_loading.load(Ordering::SeqCst),
        page_loading: state.projects.page_loading.load(Ordering::SeqCst),
        total: state.projects.visible_total(),
    })
}

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects/list", get(list_projects))
        .route("/projects/refetch", post(refetch_projects))
        .route("/projects/state", get(project_list_state))
}
