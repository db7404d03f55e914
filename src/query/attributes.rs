//! Custom-attribute filtering.
//!
//! Tenant-defined fields live in two parallel representations: a typed
//! projection (pre-cast columns, fast predicates in SQL) and the raw text
//! table it is derived from. Both sit behind one `AttributeStore` interface;
//! the resolver prefers the typed strategy and falls back to raw when the
//! projection is unavailable on a deployment.

use crate::query::capability::{classify_db_error, ColumnSupport, DbErrorClass, TrackedColumn};
use crate::query::error::QueryError;
use crate::query::filters::{
    CustomFieldFilter, CustomFilterMap, TriState, FALSE_TOKENS, TRUE_TOKENS,
};
use crate::shared::models::EntityKind;
use crate::shared::utils::DbPool;
use diesel::prelude::*;
use diesel::sql_types::{Array, Date, Float8, Text, Uuid as DieselUuid};
use diesel::PgConnection;
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub trait AttributeStore: Send + Sync {
    /// Entity IDs matching `filter` via the typed projection. An error means
    /// the typed strategy cannot evaluate this filter here (projection
    /// absent, column missing, query failed) and the caller should try raw.
    fn typed_ids(
        &self,
        org: Uuid,
        kind: EntityKind,
        field_key: &str,
        filter: &CustomFieldFilter,
    ) -> Result<HashSet<Uuid>, QueryError>;

    /// Entity IDs matching `filter` via the raw text table, tenant-scoped by
    /// joining through the owning entity.
    fn raw_ids(
        &self,
        org: Uuid,
        kind: EntityKind,
        field_key: &str,
        filter: &CustomFieldFilter,
    ) -> Result<HashSet<Uuid>, QueryError>;
}

/// Intersection of entity IDs satisfying every active filter.
///
/// `None` means no custom-field filtering was requested, which is distinct
/// from `Some(empty)` ("no results can match"). Evaluation short-circuits the
/// moment the running intersection drops to zero, so no queries are issued
/// for filters ordered after it.
pub fn resolve_custom_filters(
    store: &dyn AttributeStore,
    org: Uuid,
    kind: EntityKind,
    filters: &CustomFilterMap,
) -> Result<Option<HashSet<Uuid>>, QueryError> {
    let mut allowed: Option<HashSet<Uuid>> = None;

    for (key, filter) in filters {
        if filter.is_inert() {
            continue;
        }
        let ids = match store.typed_ids(org, kind, key, filter) {
            Ok(ids) => ids,
            Err(typed_err) => {
                debug!("Typed attribute query for '{key}' failed ({typed_err}); trying raw");
                store
                    .raw_ids(org, kind, key, filter)
                    .map_err(|raw_err| QueryError::FilterEvaluation {
                        field: key.clone(),
                        message: format!("typed: {typed_err}; raw: {raw_err}"),
                    })?
            }
        };

        allowed = Some(match allowed.take() {
            None => ids,
            Some(previous) => previous.intersection(&ids).copied().collect(),
        });

        if allowed.as_ref().is_some_and(HashSet::is_empty) {
            return Ok(Some(HashSet::new()));
        }
    }

    Ok(allowed)
}

#[derive(QueryableByName)]
struct EntityIdRow {
    #[diesel(sql_type = DieselUuid)]
    entity_id: Uuid,
}

#[derive(QueryableByName)]
struct RawValueRow {
    #[diesel(sql_type = DieselUuid)]
    entity_id: Uuid,
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    value: Option<String>,
}

pub struct PgAttributeStore {
    pool: DbPool,
    support: Arc<ColumnSupport>,
}

impl PgAttributeStore {
    pub fn new(pool: DbPool, support: Arc<ColumnSupport>) -> Self {
        Self { pool, support }
    }

    fn conn(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>,
        QueryError,
    > {
        self.pool
            .get()
            .map_err(|e| QueryError::Connection(e.to_string()))
    }

    /// Notes what a failed typed query revealed, then hands the error back
    /// so the resolver can fall back to the raw strategy.
    fn typed_failure(&self, err: diesel::result::Error) -> QueryError {
        match classify_db_error(&err) {
            DbErrorClass::MissingColumn(name) => {
                if let Some(col) = TrackedColumn::from_column_name(&name) {
                    self.support.mark_unsupported(col);
                }
            }
            DbErrorClass::MissingRelation => {
                debug!("Typed attribute projection not present on this deployment");
            }
            _ => {}
        }
        QueryError::from_db(err)
    }
}

fn ilike_pattern(needle: &str) -> String {
    format!("%{}%", needle.trim())
}

fn collect_ids(rows: Vec<EntityIdRow>) -> HashSet<Uuid> {
    rows.into_iter().map(|r| r.entity_id).collect()
}

impl AttributeStore for PgAttributeStore {
    fn typed_ids(
        &self,
        org: Uuid,
        kind: EntityKind,
        field_key: &str,
        filter: &CustomFieldFilter,
    ) -> Result<HashSet<Uuid>, QueryError> {
        let mut conn = self.conn()?;
        let table = kind.table_name();

        let rows: Vec<EntityIdRow> = match filter {
            CustomFieldFilter::Text { contains } => diesel::sql_query(
                "SELECT entity_id FROM custom_field_values_typed \
                 WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                   AND value_text ILIKE $4",
            )
            .bind::<DieselUuid, _>(org)
            .bind::<Text, _>(kind.as_str())
            .bind::<Text, _>(field_key)
            .bind::<Text, _>(ilike_pattern(contains))
            .load(&mut conn),

            CustomFieldFilter::Checkbox { state } => match state {
                TriState::Any => return Ok(HashSet::new()),
                TriState::Checked => diesel::sql_query(
                    "SELECT entity_id FROM custom_field_values_typed \
                     WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                       AND value_bool = TRUE",
                )
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .load(&mut conn),
                // Unchecked covers false, NULL, and entities with no value
                // row at all, so it anchors on the entity table.
                TriState::Unchecked => diesel::sql_query(format!(
                    "SELECT e.id AS entity_id FROM {table} e \
                     WHERE e.org_id = $1 \
                       AND NOT EXISTS ( \
                         SELECT 1 FROM custom_field_values_typed t \
                          WHERE t.org_id = $1 AND t.entity_kind = $2 \
                            AND t.field_key = $3 AND t.entity_id = e.id \
                            AND t.value_bool = TRUE)"
                ))
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .load(&mut conn),
            },

            CustomFieldFilter::Select { options } => {
                let patterns: Vec<String> = options
                    .iter()
                    .filter(|o| !o.trim().is_empty())
                    .map(|o| ilike_pattern(o))
                    .collect();
                diesel::sql_query(
                    "SELECT entity_id FROM custom_field_values_typed \
                     WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                       AND value_text ILIKE ANY($4)",
                )
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .bind::<Array<Text>, _>(patterns)
                .load(&mut conn)
            }

            CustomFieldFilter::Date { from, to } => match (from, to) {
                (Some(from), Some(to)) => diesel::sql_query(
                    "SELECT entity_id FROM custom_field_values_typed \
                     WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                       AND value_date >= $4 AND value_date <= $5",
                )
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .bind::<Date, _>(from)
                .bind::<Date, _>(to)
                .load(&mut conn),
                (Some(from), None) => diesel::sql_query(
                    "SELECT entity_id FROM custom_field_values_typed \
                     WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                       AND value_date >= $4",
                )
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .bind::<Date, _>(from)
                .load(&mut conn),
                (None, Some(to)) => diesel::sql_query(
                    "SELECT entity_id FROM custom_field_values_typed \
                     WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                       AND value_date <= $4",
                )
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .bind::<Date, _>(to)
                .load(&mut conn),
                (None, None) => return Ok(HashSet::new()),
            },

            CustomFieldFilter::Number { min, max } => {
                // Once the numeric projection column is known to be missing
                // there is no point re-probing; the raw strategy takes over.
                if !self.support.supports(TrackedColumn::TypedNumberValue) {
                    return Err(QueryError::Database(
                        "numeric projection column unavailable".to_string(),
                    ));
                }
                match (min, max) {
                    (Some(min), Some(max)) => diesel::sql_query(
                        "SELECT entity_id FROM custom_field_values_typed \
                         WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                           AND value_number >= $4 AND value_number <= $5",
                    )
                    .bind::<DieselUuid, _>(org)
                    .bind::<Text, _>(kind.as_str())
                    .bind::<Text, _>(field_key)
                    .bind::<Float8, _>(min)
                    .bind::<Float8, _>(max)
                    .load(&mut conn),
                    (Some(min), None) => diesel::sql_query(
                        "SELECT entity_id FROM custom_field_values_typed \
                         WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                           AND value_number >= $4",
                    )
                    .bind::<DieselUuid, _>(org)
                    .bind::<Text, _>(kind.as_str())
                    .bind::<Text, _>(field_key)
                    .bind::<Float8, _>(min)
                    .load(&mut conn),
                    (None, Some(max)) => diesel::sql_query(
                        "SELECT entity_id FROM custom_field_values_typed \
                         WHERE org_id = $1 AND entity_kind = $2 AND field_key = $3 \
                           AND value_number <= $4",
                    )
                    .bind::<DieselUuid, _>(org)
                    .bind::<Text, _>(kind.as_str())
                    .bind::<Text, _>(field_key)
                    .bind::<Float8, _>(max)
                    .load(&mut conn),
                    (None, None) => return Ok(HashSet::new()),
                }
            }
        }
        .map_err(|e| self.typed_failure(e))?;

        Ok(collect_ids(rows))
    }

    fn raw_ids(
        &self,
        org: Uuid,
        kind: EntityKind,
        field_key: &str,
        filter: &CustomFieldFilter,
    ) -> Result<HashSet<Uuid>, QueryError> {
        let mut conn = self.conn()?;
        let table = kind.table_name();

        // Checkbox needs entity-anchored queries so that "unchecked" can
        // include entities without any value row.
        if let CustomFieldFilter::Checkbox { state } = filter {
            let rows: Vec<EntityIdRow> = match state {
                TriState::Any => return Ok(HashSet::new()),
                TriState::Checked => diesel::sql_query(format!(
                    "SELECT v.entity_id FROM custom_field_values v \
                     JOIN {table} e ON e.id = v.entity_id \
                     WHERE e.org_id = $1 AND v.entity_kind = $2 AND v.field_key = $3 \
                       AND LOWER(TRIM(v.value)) = ANY($4)"
                ))
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .bind::<Array<Text>, _>(TRUE_TOKENS.to_vec())
                .load(&mut conn),
                TriState::Unchecked => diesel::sql_query(format!(
                    "SELECT e.id AS entity_id FROM {table} e \
                     WHERE e.org_id = $1 \
                       AND NOT EXISTS ( \
                         SELECT 1 FROM custom_field_values v \
                          WHERE v.entity_kind = $2 AND v.field_key = $3 \
                            AND v.entity_id = e.id AND v.value IS NOT NULL \
                            AND LOWER(TRIM(v.value)) <> ALL($4))"
                ))
                .bind::<DieselUuid, _>(org)
                .bind::<Text, _>(kind.as_str())
                .bind::<Text, _>(field_key)
                .bind::<Array<Text>, _>(FALSE_TOKENS.to_vec())
                .load(&mut conn),
            }
            .map_err(QueryError::from_db)?;
            return Ok(collect_ids(rows));
        }

        // Everything else fetches the field's value rows and evaluates the
        // reference predicate in-process.
        let rows: Vec<RawValueRow> = diesel::sql_query(format!(
            "SELECT v.entity_id, v.value FROM custom_field_values v \
             JOIN {table} e ON e.id = v.entity_id \
             WHERE e.org_id = $1 AND v.entity_kind = $2 AND v.field_key = $3"
        ))
        .bind::<DieselUuid, _>(org)
        .bind::<Text, _>(kind.as_str())
        .bind::<Text, _>(field_key)
        .load(&mut conn)
        .map_err(QueryError::from_db)?;

        Ok(rows
            .into_iter()
            .filter(|row| filter.matches_raw(row.value.as_deref()))
            .map(|row| row.entity_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory store evaluating the reference predicate over raw values.
    /// `typed_fails` simulates a deployment without the typed projection.
    struct MemoryAttributeStore {
        values: BTreeMap<String, Vec<(Uuid, Option<String>)>>,
        entities: Vec<Uuid>,
        typed_fails: bool,
        raw_fails: bool,
        calls: Mutex<Vec<String>>,
    }

    impl MemoryAttributeStore {
        fn new(entities: Vec<Uuid>) -> Self {
            Self {
                values: BTreeMap::new(),
                entities,
                typed_fails: true,
                raw_fails: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_value(mut self, key: &str, entity: Uuid, value: Option<&str>) -> Self {
            self.values
                .entry(key.to_string())
                .or_default()
                .push((entity, value.map(str::to_string)));
            self
        }

        fn evaluate(&self, field_key: &str, filter: &CustomFieldFilter) -> HashSet<Uuid> {
            let rows = self.values.get(field_key).cloned().unwrap_or_default();
            match filter {
                CustomFieldFilter::Checkbox {
                    state: TriState::Unchecked,
                } => self
                    .entities
                    .iter()
                    .filter(|id| {
                        let value = rows
                            .iter()
                            .find(|(entity, _)| entity == *id)
                            .and_then(|(_, v)| v.clone());
                        filter.matches_raw(value.as_deref())
                    })
                    .copied()
                    .collect(),
                _ => rows
                    .iter()
                    .filter(|(_, v)| filter.matches_raw(v.as_deref()))
                    .map(|(id, _)| *id)
                    .collect(),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl AttributeStore for MemoryAttributeStore {
        fn typed_ids(
            &self,
            _org: Uuid,
            _kind: EntityKind,
            field_key: &str,
            filter: &CustomFieldFilter,
        ) -> Result<HashSet<Uuid>, QueryError> {
            self.calls.lock().unwrap().push(format!("typed:{field_key}"));
            if self.typed_fails {
                return Err(QueryError::Database("relation does not exist".to_string()));
            }
            Ok(self.evaluate(field_key, filter))
        }

        fn raw_ids(
            &self,
            _org: Uuid,
            _kind: EntityKind,
            field_key: &str,
            filter: &CustomFieldFilter,
        ) -> Result<HashSet<Uuid>, QueryError> {
            self.calls.lock().unwrap().push(format!("raw:{field_key}"));
            if self.raw_fails {
                return Err(QueryError::Database("raw query failed".to_string()));
            }
            Ok(self.evaluate(field_key, filter))
        }
    }

    fn checkbox(state: TriState) -> CustomFieldFilter {
        CustomFieldFilter::Checkbox { state }
    }

    fn text(contains: &str) -> CustomFieldFilter {
        CustomFieldFilter::Text {
            contains: contains.to_string(),
        }
    }

    #[test]
    fn test_no_active_filters_resolves_to_none() {
        let store = MemoryAttributeStore::new(vec![]);
        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Any));
        let resolved =
            resolve_custom_filters(&store, Uuid::new_v4(), EntityKind::Lead, &filters).unwrap();
        assert!(resolved.is_none());
        assert_eq!(store.call_count(), 0);
    }

    #[test]
    fn test_vip_checkbox_scenario() {
        // Lead A has vip=true, B has vip=false, C has no value row.
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let store = MemoryAttributeStore::new(vec![a, b, c])
            .with_value("vip", a, Some("true"))
            .with_value("vip", b, Some("false"));
        let org = Uuid::new_v4();

        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Checked));
        let resolved = resolve_custom_filters(&store, org, EntityKind::Lead, &filters)
            .unwrap()
            .unwrap();
        assert_eq!(resolved, HashSet::from([a]));

        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Unchecked));
        let resolved = resolve_custom_filters(&store, org, EntityKind::Lead, &filters)
            .unwrap()
            .unwrap();
        assert_eq!(resolved, HashSet::from([b, c]));

        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Any));
        let resolved =
            resolve_custom_filters(&store, org, EntityKind::Lead, &filters).unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn test_intersection_across_filters() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let store = MemoryAttributeStore::new(vec![a, b, c])
            .with_value("vip", a, Some("yes"))
            .with_value("vip", b, Some("yes"))
            .with_value("venue", b, Some("Outdoor"))
            .with_value("venue", c, Some("Outdoor"));
        let org = Uuid::new_v4();

        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Checked));
        filters.insert("venue".to_string(), text("outdoor"));
        let resolved = resolve_custom_filters(&store, org, EntityKind::Lead, &filters)
            .unwrap()
            .unwrap();
        assert_eq!(resolved, HashSet::from([b]));

        // Same result with only one filter active each way.
        let mut vip_only = CustomFilterMap::new();
        vip_only.insert("vip".to_string(), checkbox(TriState::Checked));
        let vip_set = resolve_custom_filters(&store, org, EntityKind::Lead, &vip_only)
            .unwrap()
            .unwrap();
        let mut venue_only = CustomFilterMap::new();
        venue_only.insert("venue".to_string(), text("outdoor"));
        let venue_set = resolve_custom_filters(&store, org, EntityKind::Lead, &venue_only)
            .unwrap()
            .unwrap();
        let expected: HashSet<Uuid> = vip_set.intersection(&venue_set).copied().collect();
        assert_eq!(resolved, expected);
    }

    #[test]
    fn test_short_circuit_stops_issuing_queries() {
        let a = Uuid::new_v4();
        // "aaa" sorts before the others, matches nothing.
        let store = MemoryAttributeStore::new(vec![a])
            .with_value("bbb", a, Some("match"))
            .with_value("ccc", a, Some("match"));
        let org = Uuid::new_v4();

        let mut filters = CustomFilterMap::new();
        filters.insert("aaa".to_string(), text("nothing"));
        filters.insert("bbb".to_string(), text("match"));
        filters.insert("ccc".to_string(), text("match"));

        let resolved = resolve_custom_filters(&store, org, EntityKind::Lead, &filters)
            .unwrap()
            .unwrap();
        assert!(resolved.is_empty());
        // One typed attempt plus its raw fallback for "aaa"; nothing for the
        // filters ordered after it.
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["typed:aaa".to_string(), "raw:aaa".to_string()]);
    }

    #[test]
    fn test_both_strategies_failing_propagates() {
        let mut store = MemoryAttributeStore::new(vec![]);
        store.raw_fails = true;
        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Checked));
        let err = resolve_custom_filters(&store, Uuid::new_v4(), EntityKind::Lead, &filters)
            .unwrap_err();
        assert!(matches!(err, QueryError::FilterEvaluation { ref field, .. } if field == "vip"));
    }

    #[test]
    fn test_typed_strategy_preferred_when_available() {
        let a = Uuid::new_v4();
        let mut store = MemoryAttributeStore::new(vec![a]).with_value("vip", a, Some("true"));
        store.typed_fails = false;
        let mut filters = CustomFilterMap::new();
        filters.insert("vip".to_string(), checkbox(TriState::Checked));
        let resolved =
            resolve_custom_filters(&store, Uuid::new_v4(), EntityKind::Lead, &filters)
                .unwrap()
                .unwrap();
        assert_eq!(resolved, HashSet::from([a]));
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["typed:vip".to_string()]);
    }
}
