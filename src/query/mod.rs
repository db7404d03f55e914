//! Resilient paginated entity-query layer.
//!
//! Serves sorted, filtered, paginated list views over a per-tenant
//! custom-attribute model, tolerating backend schemas that evolve under it.
//! One optimized server-side call is preferred; when that capability is
//! absent the same result is reconstructed client-side from narrower
//! queries, with an identical output contract.

pub mod attributes;
pub mod capability;
pub mod error;
pub mod facade;
pub mod filters;
pub mod merge;
pub mod orchestrator;
pub mod prefetch;
pub mod sort;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// An entity as it appears in a list view. Both query paths produce items of
/// the same shape; nothing downstream can tell which path served them.
pub trait ListEntity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn id(&self) -> Uuid;
    fn status_id(&self) -> Option<Uuid>;
    /// Value used for ordering by `field`. Unknown fields resolve to the
    /// entity's custom-field map, then to null.
    fn sort_value(&self, field: &str) -> serde_json::Value;
    /// Free-text search over the entity's display columns. `needle` is
    /// already trimmed and lowercased.
    fn matches_search(&self, needle: &str) -> bool;
}

#[derive(Debug, Clone, Serialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub count: i64,
}
