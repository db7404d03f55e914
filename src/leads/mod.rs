pub mod api;
pub mod source;

pub use source::{LeadListItem, LeadSource};

use crate::core::organization::OrgResolver;
use crate::query::attributes::AttributeStore;
use crate::query::capability::{run_with_column_retry, ColumnSupport, TrackedColumn};
use crate::query::error::QueryError;
use crate::query::facade::EntityQueryFacade;
use crate::query::filters::PageRequest;
use crate::query::prefetch::PrefetchCache;
use crate::query::PageResult;
use crate::shared::utils::DbPool;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text, Uuid as DieselUuid};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCount {
    pub status_id: Option<Uuid>,
    pub status_name: Option<String>,
    pub count: i64,
}

/// Pipeline header numbers for the leads view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadMetrics {
    pub total: i64,
    pub by_status: Vec<StatusCount>,
}

#[derive(QueryableByName)]
struct StatusCountRow {
    #[diesel(sql_type = Nullable<DieselUuid>)]
    status_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    status_name: Option<String>,
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Lead list facade plus the metrics slot.
///
/// The page list and the metrics list are separate targets: each applies
/// last-writer-wins under its own token, so a slow metrics call is never
/// dropped because the page call finished first.
pub struct LeadsService {
    pub facade: Arc<EntityQueryFacade<LeadSource>>,
    pool: DbPool,
    support: Arc<ColumnSupport>,
    metrics_seq: AtomicU64,
    metrics_applied: AtomicU64,
    metrics: RwLock<Option<LeadMetrics>>,
}

impl LeadsService {
    pub fn new(
        source: Arc<LeadSource>,
        attributes: Arc<dyn AttributeStore>,
        orgs: Arc<dyn OrgResolver>,
        prefetch: PrefetchCache,
        pool: DbPool,
        support: Arc<ColumnSupport>,
    ) -> Self {
        Self {
            facade: Arc::new(EntityQueryFacade::new(source, attributes, orgs, prefetch)),
            pool,
            support,
            metrics_seq: AtomicU64::new(0),
            metrics_applied: AtomicU64::new(0),
            metrics: RwLock::new(None),
        }
    }

    pub async fn fetch_page(
        &self,
        request: PageRequest,
    ) -> Result<PageResult<LeadListItem>, QueryError> {
        self.facade.fetch_page(request).await
    }

    pub async fn refetch(&self) -> Result<PageResult<LeadListItem>, QueryError> {
        self.facade.refetch().await
    }

    pub async fn fetch_metrics(&self) -> Result<LeadMetrics, QueryError> {
        let org = self.facade.active_org()?;
        let token = self.metrics_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut conn = self
            .pool
            .get()
            .map_err(|e| QueryError::Connection(e.to_string()))?;

        let rows: Vec<StatusCountRow> = run_with_column_retry(&self.support, |support| {
            let archived_clause = if support.supports(TrackedColumn::LeadArchivedAt) {
                " AND l.archived_at IS NULL"
            } else {
                ""
            };
            diesel::sql_query(format!(
                "SELECT l.status_id, s.name AS status_name, COUNT(*) AS count \
                 FROM leads l \
                 LEFT JOIN pipeline_statuses s ON s.id = l.status_id \
                 WHERE l.org_id = $1{archived_clause} \
                 GROUP BY l.status_id, s.name \
                 ORDER BY count DESC"
            ))
            .bind::<DieselUuid, _>(org)
            .load(&mut conn)
        })
        .map_err(QueryError::from_db)?;

        let metrics = LeadMetrics {
            total: rows.iter().map(|r| r.count).sum(),
            by_status: rows
                .into_iter()
                .map(|r| StatusCount {
                    status_id: r.status_id,
                    status_name: r.status_name,
                    count: r.count,
                })
                .collect(),
        };

        self.apply_metrics(token, metrics.clone());
        Ok(metrics)
    }

    pub fn current_metrics(&self) -> Option<LeadMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_metrics(&self, token: u64, metrics: LeadMetrics) -> bool {
        let mut current = self.metrics_applied.load(Ordering::SeqCst);
        loop {
            if token <= current {
                return false;
            }
            match self.metrics_applied.compare_exchange(
                current,
                token,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        *self
            .metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics);
        true
    }
}
