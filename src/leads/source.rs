use crate::query::capability::{run_with_column_retry, ColumnSupport, TrackedColumn};
use crate::query::filters::PageRequest;
use crate::query::orchestrator::EntitySource;
use crate::query::ListEntity;
use crate::shared::models::{CustomFieldDefinition, EntityKind};
use crate::shared::utils::{pool_error_to_db, DbPool};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{
    Array, BigInt, Bool, Int4, Jsonb, Nullable, Text, Timestamptz, Uuid as DieselUuid,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadListItem {
    pub id: Uuid,
    pub client_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub session_type: Option<String>,
    pub status_id: Option<Uuid>,
    pub status_name: Option<String>,
    pub custom_fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_contacted_at: Option<DateTime<Utc>>,
}

impl ListEntity for LeadListItem {
    fn id(&self) -> Uuid {
        self.id
    }

    fn status_id(&self) -> Option<Uuid> {
        self.status_id
    }

    fn sort_value(&self, field: &str) -> Value {
        match field {
            "client_name" => Value::String(self.client_name.clone()),
            "email" => opt_string(&self.email),
            "phone" => opt_string(&self.phone),
            "source" => opt_string(&self.source),
            "session_type" => opt_string(&self.session_type),
            "status" | "status_name" => opt_string(&self.status_name),
            "created_at" => Value::String(self.created_at.to_rfc3339()),
            "updated_at" => Value::String(self.updated_at.to_rfc3339()),
            "last_contacted_at" => self
                .last_contacted_at
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
            Some(self.client_name.as_str()),
            self.email.as_deref(),
            self.phone.as_deref(),
            self.source.as_deref(),
            self.session_type.as_deref(),
            self.status_name.as_deref(),
        ];
        fields
            .into_iter()
            .flatten()
            .any(|f| f.to_lowercase().contains(needle))
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|v| Value::String(v.clone()))
        .unwrap_or(Value::Null)
}

#[derive(QueryableByName)]
struct PagedLeadRow {
    #[diesel(sql_type = DieselUuid)]
    id: Uuid,
    #[diesel(sql_type = Text)]
    client_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    email: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    phone: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    source: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    session_type: Option<String>,
    #[diesel(sql_type = Nullable<DieselUuid>)]
    status_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    status_name: Option<String>,
    #[diesel(sql_type = Jsonb)]
    custom_fields: Value,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_contacted_at: Option<DateTime<Utc>>,
    #[diesel(sql_type = BigInt)]
    total_count: i64,
}

impl PagedLeadRow {
    fn into_item(self) -> LeadListItem {
        LeadListItem {
            id: self.id,
            client_name: self.client_name,
            email: self.email,
            phone: self.phone,
            source: self.source,
            session_type: self.session_type,
            status_id: self.status_id,
            status_name: self.status_name,
            custom_fields: self.custom_fields,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_contacted_at: self.last_contacted_at,
        }
    }
}

#[derive(QueryableByName)]
struct LeadBaseRow {
    #[diesel(sql_type = DieselUuid)]
    id: Uuid,
    #[diesel(sql_type = Text)]
    client_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    email: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    phone: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    source: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    session_type: Option<String>,
    #[diesel(sql_type = Nullable<DieselUuid>)]
    status_id: Option<Uuid>,
    #[diesel(sql_type = Nullable<Text>)]
    status_name: Option<String>,
    #[diesel(sql_type = Timestamptz)]
    created_at: DateTime<Utc>,
    #[diesel(sql_type = Timestamptz)]
    updated_at: DateTime<Utc>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_contacted_at: Option<DateTime<Utc>>,
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

pub struct LeadSource {
    pool: DbPool,
    support: Arc<ColumnSupport>,
}

impl LeadSource {
    pub fn new(pool: DbPool, support: Arc<ColumnSupport>) -> Self {
        Self { pool, support }
    }
}

impl EntitySource for LeadSource {
    type Item = LeadListItem;

    fn kind(&self) -> EntityKind {
        EntityKind::Lead
    }

    fn fetch_paged(
        &self,
        org: Uuid,
        request: &PageRequest,
    ) -> Result<(Vec<LeadListItem>, i64), diesel::result::Error> {
        let mut conn = self.pool.get().map_err(pool_error_to_db)?;

        let filter_payload =
            serde_json::to_value(&request.filters).unwrap_or_else(|_| serde_json::json!({}));

        let rows: Vec<PagedLeadRow> = diesel::sql_query(
            "SELECT id, client_name, email, phone, source, session_type, status_id, \
                    status_name, custom_fields, created_at, updated_at, \
                    last_contacted_at, total_count \
             FROM leads_filter_paged($1, $2, $3, $4, $5, $6, $7, $8)",
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
        let items = rows.into_iter().map(PagedLeadRow::into_item).collect();
        Ok((items, total))
    }

    fn fetch_all(&self, org: Uuid) -> Result<Vec<LeadListItem>, diesel::result::Error> {
        let mut conn = self.pool.get().map_err(pool_error_to_db)?;

        let rows: Vec<LeadBaseRow> = run_with_column_retry(&self.support, |support| {
            let last_contacted = if support.supports(TrackedColumn::LeadLastContactedAt) {
                "l.last_contacted_at"
            } else {
                "NULL::timestamptz AS last_contacted_at"
            };
            let archived_clause = if support.supports(TrackedColumn::LeadArchivedAt) {
                " AND l.archived_at IS NULL"
            } else {
                ""
            };
            diesel::sql_query(format!(
                "SELECT l.id, l.client_name, l.email, l.phone, l.source, \
                        l.session_type, l.status_id, s.name AS status_name, \
                        l.created_at, l.updated_at, {last_contacted} \
                 FROM leads l \
                 LEFT JOIN pipeline_statuses s ON s.id = l.status_id \
                 WHERE l.org_id = $1{archived_clause}"
            ))
            .bind::<DieselUuid, _>(org)
            .load(&mut conn)
        })?;

        let values: Vec<RawFieldRow> = diesel::sql_query(
            "SELECT v.entity_id, v.field_key, v.value \
             FROM custom_field_values v \
             JOIN leads l ON l.id = v.entity_id \
             WHERE l.org_id = $1 AND v.entity_kind = 'lead'",
        )
        .bind::<DieselUuid, _>(org)
        .load(&mut conn)?;

        let mut fields_by_lead: HashMap<Uuid, serde_json::Map<String, Value>> = HashMap::new();
        for row in values {
            fields_by_lead.entry(row.entity_id).or_default().insert(
                row.field_key,
                row.value.map(Value::String).unwrap_or(Value::Null),
            );
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let custom_fields = fields_by_lead
                    .remove(&row.id)
                    .map(Value::Object)
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                LeadListItem {
                    id: row.id,
                    client_name: row.client_name,
                    email: row.email,
                    phone: row.phone,
                    source: row.source,
                    session_type: row.session_type,
                    status_id: row.status_id,
                    status_name: row.status_name,
                    custom_fields,
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                    last_contacted_at: row.last_contacted_at,
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
            .filter(entity_kind.eq(EntityKind::Lead.as_str()))
            .order(field_key.asc())
            .load::<CustomFieldDefinition>(&mut conn)
    }
}
