//! Data-fetch facade, one instance per entity type.
//!
//! Composes the prefetch cache, the fallback orchestrator, and the page
//! merger behind a single `fetch_page` operation, and owns the UI-visible
//! slots. Concurrent fetches are independent; application to the visible
//! slot is guarded by a monotonically increasing request token so a stale
//! response never overwrites a newer one.

use crate::core::organization::OrgResolver;
use crate::query::attributes::AttributeStore;
use crate::query::error::QueryError;
use crate::query::filters::{validate_custom_filters, PageRequest};
use crate::query::merge::{merge_pages, AccessMode};
use crate::query::orchestrator::{EntitySource, QueryOrchestrator};
use crate::query::prefetch::PrefetchCache;
use crate::query::PageResult;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

pub struct EntityQueryFacade<S: EntitySource> {
    orchestrator: QueryOrchestrator<S>,
    prefetch: PrefetchCache,
    orgs: Arc<dyn OrgResolver>,
    request_seq: AtomicU64,
    page_applied: AtomicU64,
    /// True until the first page has been applied.
    pub initial_loading: AtomicBool,
    /// True while any page fetch (foreground or revalidation) is in flight.
    pub page_loading: AtomicBool,
    visible: RwLock<Vec<S::Item>>,
    total: AtomicI64,
    last_request: RwLock<PageRequest>,
}

impl<S: EntitySource> EntityQueryFacade<S> {
    pub fn new(
        source: Arc<S>,
        attributes: Arc<dyn AttributeStore>,
        orgs: Arc<dyn OrgResolver>,
        prefetch: PrefetchCache,
    ) -> Self {
        Self {
            orchestrator: QueryOrchestrator::new(source, attributes),
            prefetch,
            orgs,
            request_seq: AtomicU64::new(0),
            page_applied: AtomicU64::new(0),
            initial_loading: AtomicBool::new(true),
            page_loading: AtomicBool::new(false),
            visible: RwLock::new(Vec::new()),
            total: AtomicI64::new(0),
            last_request: RwLock::new(PageRequest::default()),
        }
    }

    pub fn active_org(&self) -> Result<Uuid, QueryError> {
        self.orgs
            .active_org()?
            .ok_or(QueryError::NoOrganization)
    }

    pub async fn fetch_page(
        self: &Arc<Self>,
        request: PageRequest,
    ) -> Result<PageResult<S::Item>, QueryError> {
        let org = self.active_org()?;

        if !request.filters.custom.is_empty() {
            let definitions = self
                .orchestrator
                .source()
                .load_definitions(org)
                .map_err(QueryError::from_db)?;
            validate_custom_filters(&definitions, &request.filters.custom)?;
        }

        *self
            .last_request
            .write()
            .unwrap_or_else(PoisonError::into_inner) = request.clone();

        let token = self.next_token();
        self.page_loading.store(true, Ordering::SeqCst);
        let mode = if request.append {
            AccessMode::Append
        } else {
            AccessMode::Replace
        };

        if request.is_default_view() {
            let kind = self.orchestrator.source().kind();
            if let Some((items, total)) = self.prefetch.read::<S::Item>(kind, org) {
                debug!("Serving {kind} page 1 from prefetch snapshot, revalidating");
                self.apply_page(token, items.clone(), total, AccessMode::Replace);
                self.revalidate_in_background(org, request);
                return Ok(PageResult {
                    items,
                    count: total,
                });
            }
        }

        let result = self.orchestrator.fetch(org, &request);
        self.page_loading.store(false, Ordering::SeqCst);
        let (items, total) = result?;
        self.apply_page(token, items.clone(), total, mode);
        Ok(PageResult {
            items,
            count: total,
        })
    }

    /// Re-runs the last requested view against live data.
    pub async fn refetch(self: &Arc<Self>) -> Result<PageResult<S::Item>, QueryError> {
        let request = self
            .last_request
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.fetch_page(request).await
    }

    /// The list the UI currently renders. Fetch failures leave this intact;
    /// callers keep the previous page on screen and offer a retry.
    pub fn visible_items(&self) -> Vec<S::Item> {
        self.visible
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn visible_total(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    fn next_token(&self) -> u64 {
        self.request_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn revalidate_in_background(self: &Arc<Self>, org: Uuid, request: PageRequest) {
        let facade = Arc::clone(self);
        tokio::spawn(async move {
            let token = facade.next_token();
            match facade.orchestrator.fetch(org, &request) {
                Ok((items, total)) => {
                    facade.apply_page(token, items, total, AccessMode::Replace);
                }
                Err(err) => {
                    // The snapshot already painted; the stale view stays up.
                    error!("Background revalidation failed: {err}");
                }
            }
            facade.page_loading.store(false, Ordering::SeqCst);
        });
    }

    /// Applies a completed fetch to the visible slot unless a newer request
    /// already has. Returns whether the result was applied.
    pub(crate) fn apply_page(
        &self,
        token: u64,
        items: Vec<S::Item>,
        total: i64,
        mode: AccessMode,
    ) -> bool {
        let mut current = self.page_applied.load(Ordering::SeqCst);
        loop {
            if token <= current {
                debug!("Ignoring result of superseded request {token} (newest {current})");
                return false;
            }
            match self.page_applied.compare_exchange(
                current,
                token,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let mut visible = self
            .visible
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::take(&mut *visible);
        *visible = merge_pages(previous, items, mode);
        self.total.store(total, Ordering::SeqCst);
        self.initial_loading.store(false, Ordering::SeqCst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::organization::StaticOrgResolver;
    use crate::leads::LeadListItem;
    use crate::query::filters::CustomFieldFilter;
    use crate::query::prefetch::{Clock, SnapshotStore};
    use crate::query::sort::sort_entities;
    use crate::shared::models::{CustomFieldDefinition, EntityKind};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use diesel::result::DatabaseErrorKind;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Clone, Copy, PartialEq)]
    enum PagedBehavior {
        Serve,
        MissingFunction,
        ConnectionDown,
    }

    struct MockLeadSource {
        dataset: Vec<LeadListItem>,
        paged: PagedBehavior,
        definitions: Vec<CustomFieldDefinition>,
    }

    impl MockLeadSource {
        fn new(dataset: Vec<LeadListItem>, paged: PagedBehavior) -> Self {
            Self {
                dataset,
                paged,
                definitions: Vec::new(),
            }
        }
    }

    impl EntitySource for MockLeadSource {
        type Item = LeadListItem;

        fn kind(&self) -> EntityKind {
            EntityKind::Lead
        }

        fn fetch_paged(
            &self,
            _org: Uuid,
            request: &PageRequest,
        ) -> Result<(Vec<LeadListItem>, i64), diesel::result::Error> {
            match self.paged {
                PagedBehavior::Serve => {
                    // Simulates the server-side procedure: filter, sort,
                    // page, with the filtered total alongside.
                    let mut items = self.dataset.clone();
                    if let Some(search) = &request.filters.search {
                        let needle = search.trim().to_lowercase();
                        if !needle.is_empty() {
                            items.retain(|i| {
                                crate::query::ListEntity::matches_search(i, &needle)
                            });
                        }
                    }
                    if let Some(ids) = &request.filters.status_ids {
                        if !ids.is_empty() {
                            items.retain(|i| i.status_id.map_or(false, |s| ids.contains(&s)));
                        }
                    }
                    let total = items.len() as i64;
                    sort_entities(&mut items, &request.sort);
                    let from = request.offset().max(0) as usize;
                    let to = (from + request.page_size as usize).min(items.len());
                    let page = if from >= items.len() {
                        Vec::new()
                    } else {
                        items[from..to].to_vec()
                    };
                    Ok((page, total))
                }
                PagedBehavior::MissingFunction => Err(diesel::result::Error::DatabaseError(
                    DatabaseErrorKind::Unknown,
                    Box::new(
                        "function leads_filter_paged(uuid, integer, integer, text, text, \
                         uuid[], jsonb) does not exist"
                            .to_string(),
                    ),
                )),
                PagedBehavior::ConnectionDown => Err(diesel::result::Error::DatabaseError(
                    DatabaseErrorKind::ClosedConnection,
                    Box::new("server closed the connection unexpectedly".to_string()),
                )),
            }
        }

        fn fetch_all(&self, _org: Uuid) -> Result<Vec<LeadListItem>, diesel::result::Error> {
            Ok(self.dataset.clone())
        }

        fn load_definitions(
            &self,
            _org: Uuid,
        ) -> Result<Vec<CustomFieldDefinition>, diesel::result::Error> {
            Ok(self.definitions.clone())
        }
    }

    struct NoCustomStore;

    impl AttributeStore for NoCustomStore {
        fn typed_ids(
            &self,
            _org: Uuid,
            _kind: EntityKind,
            _field_key: &str,
            _filter: &CustomFieldFilter,
        ) -> Result<HashSet<Uuid>, QueryError> {
            Ok(HashSet::new())
        }

        fn raw_ids(
            &self,
            _org: Uuid,
            _kind: EntityKind,
            _field_key: &str,
            _filter: &CustomFieldFilter,
        ) -> Result<HashSet<Uuid>, QueryError> {
            Ok(HashSet::new())
        }
    }

    struct MemorySnapshots(Mutex<HashMap<String, String>>);

    impl SnapshotStore for MemorySnapshots {
        fn get(&self, key: &str) -> Option<String> {
            self.0.lock().ok()?.get(key).cloned()
        }
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn lead(name: &str, minutes_ago: i64) -> LeadListItem {
        let updated = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
            - Duration::minutes(minutes_ago);
        LeadListItem {
            id: Uuid::new_v4(),
            client_name: name.to_string(),
            email: None,
            phone: None,
            source: None,
            session_type: None,
            status_id: None,
            status_name: None,
            custom_fields: serde_json::json!({}),
            created_at: updated,
            updated_at: updated,
            last_contacted_at: None,
        }
    }

    fn facade_with(
        dataset: Vec<LeadListItem>,
        paged: PagedBehavior,
        org: Option<Uuid>,
        prefetch: PrefetchCache,
    ) -> Arc<EntityQueryFacade<MockLeadSource>> {
        Arc::new(EntityQueryFacade::new(
            Arc::new(MockLeadSource::new(dataset, paged)),
            Arc::new(NoCustomStore),
            Arc::new(StaticOrgResolver(org)),
            prefetch,
        ))
    }

    #[tokio::test]
    async fn test_fetch_applies_to_visible_slot() {
        let dataset = vec![lead("ana", 1), lead("bruno", 2)];
        let facade = facade_with(
            dataset,
            PagedBehavior::Serve,
            Some(Uuid::new_v4()),
            PrefetchCache::disabled(),
        );
        assert!(facade.initial_loading.load(Ordering::SeqCst));

        let result = facade.fetch_page(PageRequest::default()).await.unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.count, 2);
        assert_eq!(facade.visible_items().len(), 2);
        assert_eq!(facade.visible_total(), 2);
        assert!(!facade.initial_loading.load(Ordering::SeqCst));
        assert!(!facade.page_loading.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_org_is_fatal() {
        let facade = facade_with(
            vec![lead("ana", 1)],
            PagedBehavior::Serve,
            None,
            PrefetchCache::disabled(),
        );
        let err = facade.fetch_page(PageRequest::default()).await.unwrap_err();
        assert!(matches!(err, QueryError::NoOrganization));
        // Previously rendered data stays in place on failure.
        assert!(facade.visible_items().is_empty());
    }

    #[tokio::test]
    async fn test_connection_error_propagates_without_fallback() {
        let facade = facade_with(
            vec![lead("ana", 1)],
            PagedBehavior::ConnectionDown,
            Some(Uuid::new_v4()),
            PrefetchCache::disabled(),
        );
        let err = facade.fetch_page(PageRequest::default()).await.unwrap_err();
        assert!(matches!(err, QueryError::Connection(_)));
    }

    #[tokio::test]
    async fn test_missing_procedure_falls_back() {
        let dataset = vec![lead("ana", 3), lead("bruno", 1), lead("carla", 2)];
        let facade = facade_with(
            dataset,
            PagedBehavior::MissingFunction,
            Some(Uuid::new_v4()),
            PrefetchCache::disabled(),
        );
        let result = facade.fetch_page(PageRequest::default()).await.unwrap();
        assert_eq!(result.count, 3);
        // Default sort is updated_at desc.
        let names: Vec<_> = result.items.iter().map(|i| i.client_name.as_str()).collect();
        assert_eq!(names, vec!["bruno", "carla", "ana"]);
    }

    #[tokio::test]
    async fn test_stale_result_is_not_applied() {
        let facade = facade_with(
            Vec::new(),
            PagedBehavior::Serve,
            Some(Uuid::new_v4()),
            PrefetchCache::disabled(),
        );
        let newer = vec![lead("newer", 1)];
        let stale = vec![lead("stale", 2)];

        assert!(facade.apply_page(2, newer.clone(), 1, AccessMode::Replace));
        assert!(!facade.apply_page(1, stale, 1, AccessMode::Replace));
        assert_eq!(facade.visible_items()[0].client_name, "newer");
    }

    #[tokio::test]
    async fn test_append_mode_merges_pages() {
        let facade = facade_with(
            Vec::new(),
            PagedBehavior::Serve,
            Some(Uuid::new_v4()),
            PrefetchCache::disabled(),
        );
        let first = vec![lead("ana", 1)];
        let second = vec![lead("bruno", 2)];
        facade.apply_page(1, first, 2, AccessMode::Replace);
        facade.apply_page(2, second, 2, AccessMode::Append);

        let names: Vec<_> = facade
            .visible_items()
            .iter()
            .map(|i| i.client_name.clone())
            .collect();
        assert_eq!(names, vec!["ana", "bruno"]);
    }

    #[tokio::test]
    async fn test_prefetch_hit_serves_snapshot_then_revalidates() {
        let org = Uuid::new_v4();
        let live = vec![lead("live", 1)];
        let snapshot_item = lead("snapshot", 60);

        let now = Utc::now();
        let envelope = serde_json::json!({
            "timestamp": now.timestamp() - 10,
            "items": [snapshot_item],
            "total": 1,
            "ttl_secs": 300,
        })
        .to_string();
        let mut map = HashMap::new();
        map.insert(
            crate::query::prefetch::snapshot_key(EntityKind::Lead, org),
            envelope,
        );
        let prefetch = PrefetchCache::new(
            Some(Arc::new(MemorySnapshots(Mutex::new(map)))),
            Arc::new(FixedClock(now)),
        );

        let facade = facade_with(live, PagedBehavior::Serve, Some(org), prefetch);
        let result = facade.fetch_page(PageRequest::default()).await.unwrap();
        // The snapshot paints first.
        assert_eq!(result.items[0].client_name, "snapshot");

        // The background fetch revalidates the slot with live data.
        for _ in 0..100 {
            if facade.visible_items()[0].client_name == "live" {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("revalidation never applied the live result");
    }

    #[tokio::test]
    async fn test_non_default_view_bypasses_prefetch() {
        let org = Uuid::new_v4();
        let live = vec![lead("live", 1)];

        let now = Utc::now();
        let envelope = serde_json::json!({
            "timestamp": now.timestamp(),
            "items": [lead("snapshot", 60)],
            "total": 1,
            "ttl_secs": 300,
        })
        .to_string();
        let mut map = HashMap::new();
        map.insert(
            crate::query::prefetch::snapshot_key(EntityKind::Lead, org),
            envelope,
        );
        let prefetch = PrefetchCache::new(
            Some(Arc::new(MemorySnapshots(Mutex::new(map)))),
            Arc::new(FixedClock(now)),
        );

        let facade = facade_with(live, PagedBehavior::Serve, Some(org), prefetch);
        let mut request = PageRequest::default();
        request.filters.search = Some("live".to_string());
        let result = facade.fetch_page(request).await.unwrap();
        assert_eq!(result.items[0].client_name, "live");
    }
}
