use crate::query::capability::{run_with_column_retry, ColumnSupport, TrackedColumn};
use crate::query::filters::PageRequest;
use crate::query::orchestrator::EntitySource;
use crate::query::ListEntity;
use crate::shared::models::{CustomFieldDefinition, EntityKind};
use crate::shared::utils::{pool_error_to_db, DbPool};
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel::sql_types::{
    Array, BigInt, Bool, Date, Float8, Int4, Jsonb, Nullable, Text, Timestamptz,
    Uuid as DieselUuid,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectListItem {
    pub id: Uuid,
    pub name: String,
    pub client_name: String,
    pub status_id: Option<Uuid>,
    pub status_name: Option<String>,
    pub shoot_date: Option<NaiveDate>,
    pub session_count: i64,
    pub total_amount: f64,
    pub paid_amount: f64,
    pub balance_due: f64,
    pub custom_fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ListEntity for ProjectListItem {
    fn id(&self) -> Uuid {
        self.id
    }

    fn status_id(&self) -> Option<Uuid> {
        self.status_id
    }

    fn sort_value(&self, field: &str) -> Value {
        match field {
            "name" => Value::String(self.name.clone()),
            "client_name" => Value::String(self.client_name.clone()),
            "status" | "status_name" => self
                .status_name
                .as_ref()
                .map(|v| Value::String(v.clone()))
                .unwrap_or(Value::Null),
            "shoot_date" => self
                .shoot_date
                .map(|d| Value::String(d.to_string()))
                .unwrap_or(Value::Null),
            "session_count" => Value::from(self.session_count),
            "total_amount" => Value::from(self.total_amount),
            "paid_amount" => Value::from(self.paid_amount),
            "balance_due" => Value::from(self.balance_due),
            "created_at" => Value::String(self.created_at.to_rfc3339()),
            "updated_at" => Value::String(self.updated_at.to_rfc3339()),
            "completed_at" => self
                .completed_at
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
            custom => self
                .custom_fields
                .get(custom)
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    fn matches_search(&self, needle: &str) -> bool {
        let fields = [
            Some(self.name.as_str()),
            Some(self.client_name.as_str()),
            self.status_name.as_deref(),
        ];
        fields
            .into_iter()
            .flatten()
            .any(|f| f.to_lowercase().contains(needle))
    }
}

#[derive(QueryableByName)]
struct PagedProjectRow {
    #[diesel(sql_type = DieselUuid)]
    id: Uuid,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    client_name: String,
    #[diesel(sql_type = Nullable<DieselUuid>)]
    status_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    status_name: Option<String>,
    #[diesel(sql_type = Nullable<Date>)]
    shoot_date: Option<NaiveDate>,
    #[diesel(sql_type = BigInt)]
    session_count: i64,
    #[diesel(sql_type = Float8)]
    total_amount: f64,
    #[diesel(sql_type = Float8)]
    paid_amount: f64,
    #[diesel(sql_type = Jsonb)]
    custom_fields: Value,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    completed_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    total_count: i64,
}

#[derive(QueryableByName)]
struct ProjectBaseRow {
    #[diesel(sql_type = DieselUuid)]
    id: Uuid,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    client_name: String,
    #[diesel(sql_type = Nullable<DieselUuid>)]
    status_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    status_name: Option<String>,
    #[diesel(sql_type = Nullable<Date>)]
    shoot_date: Option<NaiveDate>,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    completed_at: Option<DateTime<Utc>>,
}

#[derive(QueryableByName)]
struct SessionCountRow {
    #[diesel(sql_type = DieselUuid)]
    project_id: Uuid,
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct PaymentTotalsRow {
    #[diesel(sql_type = DieselUuid)]
    project_id: Uuid,
    #[diesel(sql_type = Float8)]
    total_amount: f64,
    #[diesel(sql_type = Float8)]
    paid_amount: f64,
}

#[derive(QueryableByName)]
struct RawFieldRow {
    #[diesel(sql_type = DieselUuid)]
    entity_id: Uuid,
    #[diesel(sql_type = Text)]
    field_key: String,
    #[diesel(sql_type = Nullable<Text>)]
    value: Option<String>,
}

pub struct ProjectSource {
    pool: DbPool,
    support: Arc<ColumnSupport>,
}

impl ProjectSource {
    pub fn new(pool: DbPool, support: Arc<ColumnSupport>) -> Self {
        Self { pool, support }
    }
}

impl EntitySource for ProjectSource {
    type Item = ProjectListItem;

    fn kind(&self) -> EntityKind {
        EntityKind::Project
    }

    fn fetch_paged(
        &self,
        org: Uuid,
        request: &PageRequest,
    ) -> Result<(Vec<ProjectListItem>, i64), diesel::result::Error> {
        let mut conn = self.pool.get().map_err(pool_error_to_db)?;

        let filter_payload =
            serde_json::to_value(&request.filters).unwrap_or_else(|_| serde_json::json!({}));

        let rows: Vec<PagedProjectRow> = diesel::sql_query(
            "SELECT id, name, client_name, status_id, status_name, shoot_date, \
                    session_count, total_amount, paid_amount, custom_fields, \
                    created_at, updated_at, completed_at, total_count \
             FROM projects_filter_paged($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind::<DieselUuid, _>(org)
        .bind::<Int4, _>(request.page as i32)
        .bind::<Int4, _>(request.page_size as i32)
        .bind::<Text, _>(&request.sort.field)
        .bind::<Text, _>(request.sort.direction.as_sql())
        .bind::<Nullable<Array<DieselUuid>>, _>(&request.filters.status_ids)
        .bind::<Jsonb, _>(filter_payload)
        .bind::<Bool, _>(request.include_count)
        .load(&mut conn)?;

        let total = rows.first().map(|r| r.total_count).unwrap_or(0);
        let items = rows
            .into_iter()
            .map(|row| ProjectListItem {
                id: row.id,
                name: row.name,
                client_name: row.client_name,
                status_id: row.status_id,
                status_name: row.status_name,
                shoot_date: row.shoot_date,
                session_count: row.session_count,
                total_amount: row.total_amount,
                paid_amount: row.paid_amount,
                balance_due: row.total_amount - row.paid_amount,
                custom_fields: row.custom_fields,
                created_at: row.created_at,
                updated_at: row.updated_at,
                completed_at: row.completed_at,
            })
            .collect();
        Ok((items, total))
    }

    fn fetch_all(&self, org: Uuid) -> Result<Vec<ProjectListItem>, diesel::result::Error> {
        let mut conn = self.pool.get().map_err(pool_error_to_db)?;

        let rows: Vec<ProjectBaseRow> = run_with_column_retry(&self.support, |support| {
            let completed = if support.supports(TrackedColumn::ProjectCompletedAt) {
                "p.completed_at"
            } else {
                "NULL::timestamptz AS completed_at"
            };
            diesel::sql_query(format!(
                "SELECT p.id, p.name, p.client_name, p.status_id, \
                        s.name AS status_name, p.shoot_date, \
                        p.created_at, p.updated_at, {completed} \
                 FROM projects p \
                 LEFT JOIN pipeline_statuses s ON s.id = p.status_id \
                 WHERE p.org_id = $1"
            ))
            .bind::<DieselUuid, _>(org)
            .load(&mut conn)
        })?;

        let session_counts: Vec<SessionCountRow> = diesel::sql_query(
            "SELECT project_id, COUNT(*) AS count \
             FROM shoot_sessions WHERE org_id = $1 GROUP BY project_id",
        )
        .bind::<DieselUuid, _>(org)
        .load(&mut conn)?;
        let sessions: HashMap<Uuid, i64> = session_counts
            .into_iter()
            .map(|r| (r.project_id, r.count))
            .collect();

        let payment_totals: Vec<PaymentTotalsRow> = diesel::sql_query(
            "SELECT project_id, \
                    COALESCE(SUM(amount), 0) AS total_amount, \
                    COALESCE(SUM(amount) FILTER (WHERE paid_at IS NOT NULL), 0) AS paid_amount \
             FROM payments WHERE org_id = $1 GROUP BY project_id",
        )
        .bind::<DieselUuid, _>(org)
        .load(&mut conn)?;
        let payments: HashMap<Uuid, (f64, f64)> = payment_totals
            .into_iter()
            .map(|r| (r.project_id, (r.total_amount, r.paid_amount)))
            .collect();

        let values: Vec<RawFieldRow> = diesel::sql_query(
            "SELECT v.entity_id, v.field_key, v.value \
             FROM custom_field_values v \
             JOIN projects p ON p.id = v.entity_id \
             WHERE p.org_id = $1 AND v.entity_kind = 'project'",
        )
        .bind::<DieselUuid, _>(org)
        .load(&mut conn)?;
        let mut fields_by_project: HashMap<Uuid, serde_json::Map<String, Value>> = HashMap::new();
        for row in values {
            fields_by_project.entry(row.entity_id).or_default().insert(
                row.field_key,
                row.value.map(Value::String).unwrap_or(Value::Null),
            );
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let (total_amount, paid_amount) =
                    payments.get(&row.id).copied().unwrap_or((0.0, 0.0));
                ProjectListItem {
                    id: row.id,
                    name: row.name,
                    client_name: row.client_name,
                    status_id: row.status_id,
                    status_name: row.status_name,
                    shoot_date: row.shoot_date,
                    session_count: sessions.get(&row.id).copied().unwrap_or(0),
                    total_amount,
                    paid_amount,
                    balance_due: total_amount - paid_amount,
                    custom_fields: fields_by_project
                        .remove(&row.id)
                        .map(Value::Object)
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                    completed_at: row.completed_at,
                }
            })
            .collect())
    }

    fn load_definitions(
        &self,
        org: Uuid,
    ) -> Result<Vec<CustomFieldDefinition>, diesel::result::Error> {
        use crate::shared::schema::custom_field_definitions::dsl::*;

        let mut conn = self.pool.get().map_err(pool_error_to_db)?;
        custom_field_definitions
            .filter(org_id.eq(org))
            .filter(entity_kind.eq(EntityKind::Project.as_str()))
            .order(field_key.asc())
            .load::<CustomFieldDefinition>(&mut conn)
    }
}
