use crate::shared::schema::{custom_field_definitions, organizations, pipeline_statuses};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity families served by the paginated query layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Lead,
    Project,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Project => "project",
        }
    }

    /// Base table holding entities of this kind. Only ever interpolated into
    /// SQL from this fixed set, never from request input.
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Lead => "leads",
            Self::Project => "projects",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "lead" | "leads" => Some(Self::Lead),
            "project" | "projects" => Some(Self::Project),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(primary_key(org_id))]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub org_id: Uuid,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = pipeline_statuses)]
pub struct PipelineStatus {
    pub id: Uuid,
    pub org_id: Uuid,
    pub entity_kind: String,
    pub name: String,
    pub color: Option<String>,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = custom_field_definitions)]
pub struct CustomFieldDefinition {
    pub id: Uuid,
    pub org_id: Uuid,
    pub entity_kind: String,
    pub field_key: String,
    pub label: String,
    pub field_type: String,
    pub options: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
