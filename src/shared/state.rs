use crate::config::AppConfig;
use crate::core::organization::{DbOrgResolver, OrgResolver};
use crate::leads::{LeadSource, LeadsService};
use crate::projects::{ProjectSource, ProjectsService};
use crate::query::attributes::PgAttributeStore;
use crate::query::capability::ColumnSupport;
use crate::query::prefetch::{PrefetchCache, RedisSnapshotStore, SnapshotStore, SystemClock};
use crate::shared::utils::DbPool;
use redis::Client as RedisClient;
use std::sync::Arc;

pub struct AppState {
    pub conn: DbPool,
    pub cache: Option<Arc<RedisClient>>,
    pub config: AppConfig,
    /// Column-support map shared by every query path in the process.
    pub column_support: Arc<ColumnSupport>,
    pub orgs: Arc<dyn OrgResolver>,
    pub leads: Arc<LeadsService>,
    pub projects: Arc<ProjectsService>,
}

impl AppState {
    pub fn new(conn: DbPool, cache: Option<Arc<RedisClient>>, config: AppConfig) -> Self {
        let column_support = Arc::new(ColumnSupport::new(config.schema.legacy_schema));
        let orgs: Arc<dyn OrgResolver> = Arc::new(DbOrgResolver::new(conn.clone()));
        let attributes = Arc::new(PgAttributeStore::new(
            conn.clone(),
            Arc::clone(&column_support),
        ));
        let clock = Arc::new(SystemClock);
        let snapshots: Option<Arc<dyn SnapshotStore>> = cache
            .as_ref()
            .map(|client| Arc::new(RedisSnapshotStore::new(Arc::clone(client))) as Arc<dyn SnapshotStore>);
        let prefetch = PrefetchCache::new(snapshots, clock);

        let leads = Arc::new(LeadsService::new(
            Arc::new(LeadSource::new(conn.clone(), Arc::clone(&column_support))),
            attributes.clone(),
            orgs.clone(),
            prefetch.clone(),
            conn.clone(),
            Arc::clone(&column_support),
        ));
        let projects = Arc::new(ProjectsService::new(
            Arc::new(ProjectSource::new(conn.clone(), Arc::clone(&column_support))),
            attributes,
            orgs.clone(),
            prefetch,
        ));

        Self {
            conn,
            cache,
            config,
            column_support,
            orgs,
            leads,
            projects,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("cache", &self.cache.is_some())
            .field("config", &self.config)
            .finish()
    }
}
