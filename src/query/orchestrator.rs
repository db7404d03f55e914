//! Optimized-versus-fallback query orchestration.
//!
//! The optimized path is one server-side procedure call that pages, filters,
//! and sorts in the database. Deployments that predate the procedure (or one
//! of its columns) raise a capability error; the orchestrator then rebuilds
//! the same result from narrower queries and in-process filtering/sorting.
//! Connection failures are not capability absences and propagate unchanged.

use crate::query::attributes::{resolve_custom_filters, AttributeStore};
use crate::query::capability::{classify_db_error, DbErrorClass};
use crate::query::error::QueryError;
use crate::query::filters::{EntityFilters, PageRequest};
use crate::query::sort::sort_entities;
use crate::query::ListEntity;
use crate::shared::models::EntityKind;
use log::{debug, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Backing queries for one entity type. Implementations return raw diesel
/// errors so the orchestrator can classify them.
pub trait EntitySource: Send + Sync + 'static {
    type Item: ListEntity;

    fn kind(&self) -> EntityKind;

    /// The optimized server-side call: one page, already filtered and
    /// sorted, with the filtered total alongside. Attempted exactly once per
    /// fetch.
    fn fetch_paged(
        &self,
        org: Uuid,
        request: &PageRequest,
    ) -> Result<(Vec<Self::Item>, i64), diesel::result::Error>;

    /// Fallback base set: every entity of the tenant with the denormalized
    /// display attributes joined in, unfiltered and unsorted.
    fn fetch_all(&self, org: Uuid) -> Result<Vec<Self::Item>, diesel::result::Error>;

    /// The tenant's custom-field definitions for this entity kind, used to
    /// validate incoming filter payloads.
    fn load_definitions(
        &self,
        org: Uuid,
    ) -> Result<Vec<crate::shared::models::CustomFieldDefinition>, diesel::result::Error>;
}

pub struct QueryOrchestrator<S: EntitySource> {
    source: Arc<S>,
    attributes: Arc<dyn AttributeStore>,
}

impl<S: EntitySource> QueryOrchestrator<S> {
    pub fn new(source: Arc<S>, attributes: Arc<dyn AttributeStore>) -> Self {
        Self { source, attributes }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn fetch(
        &self,
        org: Uuid,
        request: &PageRequest,
    ) -> Result<(Vec<S::Item>, i64), QueryError> {
        match self.source.fetch_paged(org, request) {
            Ok(page) => Ok(page),
            Err(err) => match classify_db_error(&err) {
                DbErrorClass::Connection => Err(QueryError::Connection(err.to_string())),
                class => {
                    if class.is_capability_absence() {
                        debug!(
                            "Optimized {} query unavailable ({err}); reconstructing client-side",
                            self.source.kind()
                        );
                    } else {
                        warn!(
                            "Optimized {} query failed ({err}); reconstructing client-side",
                            self.source.kind()
                        );
                    }
                    self.fetch_fallback(org, request)
                }
            },
        }
    }

    fn fetch_fallback(
        &self,
        org: Uuid,
        request: &PageRequest,
    ) -> Result<(Vec<S::Item>, i64), QueryError> {
        let mut items = self
            .source
            .fetch_all(org)
            .map_err(QueryError::from_db)?;

        let allowed = resolve_custom_filters(
            self.attributes.as_ref(),
            org,
            self.source.kind(),
            &request.filters.custom,
        )?;
        if let Some(allowed) = allowed {
            items.retain(|item| allowed.contains(&item.id()));
        }

        apply_intrinsic_filters(&mut items, &request.filters);

        let filtered_total = items.len() as i64;
        sort_entities(&mut items, &request.sort);

        let from = request.offset().max(0) as usize;
        let to = (from + request.page_size.max(0) as usize).min(items.len());
        let page = if from >= items.len() {
            Vec::new()
        } else {
            items[from..to].to_vec()
        };
        // Callers that opted out of the count get the page length, the same
        // lower bound the optimized path reports in that case.
        let total = if request.include_count {
            filtered_total
        } else {
            page.len() as i64
        };
        Ok((page, total))
    }
}

fn apply_intrinsic_filters<T: ListEntity>(items: &mut Vec<T>, filters: &EntityFilters) {
    if let Some(status_ids) = &filters.status_ids {
        if !status_ids.is_empty() {
            items.retain(|item| {
                item.status_id()
                    .map_or(false, |id| status_ids.contains(&id))
            });
        }
    }
    if let Some(search) = &filters.search {
        let needle = search.trim().to_lowercase();
        if !needle.is_empty() {
            items.retain(|item| item.matches_search(&needle));
        }
    }
}
