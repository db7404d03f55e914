//! Filter shapes accepted by the list views.
//!
//! A filter that is unset, empty, or "any" is inert: it constrains nothing
//! and the resolver never issues a query for it.

use crate::query::error::QueryError;
use crate::shared::models::CustomFieldDefinition;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Raw values treated as "checked" on the untyped attribute path.
pub const TRUE_TOKENS: [&str; 4] = ["true", "1", "yes", "y"];
/// Raw values treated as "unchecked"; a NULL or missing value also counts.
pub const FALSE_TOKENS: [&str; 5] = ["false", "0", "no", "n", ""];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    Checked,
    Unchecked,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CustomFieldFilter {
    Text {
        contains: String,
    },
    Checkbox {
        state: TriState,
    },
    /// OR semantics: a stored value matches if it contains any requested
    /// option, case-insensitively.
    Select {
        options: Vec<String>,
    },
    /// Inclusive range; either bound may be omitted.
    Date {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    /// Inclusive range; either bound may be omitted.
    Number {
        min: Option<f64>,
        max: Option<f64>,
    },
}

impl CustomFieldFilter {
    pub fn is_inert(&self) -> bool {
        match self {
            Self::Text { contains } => contains.trim().is_empty(),
            Self::Checkbox { state } => *state == TriState::Any,
            Self::Select { options } => options.iter().all(|o| o.trim().is_empty()),
            Self::Date { from, to } => from.is_none() && to.is_none(),
            Self::Number { min, max } => min.is_none() && max.is_none(),
        }
    }

    /// The declared type a definition must carry for this filter shape.
    pub fn expected_field_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Checkbox { .. } => "checkbox",
            Self::Select { .. } => "select",
            Self::Date { .. } => "date",
            Self::Number { .. } => "number",
        }
    }

    /// Reference predicate over a raw (untyped text) attribute value.
    ///
    /// This is what the untyped fallback path evaluates after fetching a
    /// field's value rows. `None` means the entity has no row (or a NULL
    /// value) for the field.
    pub fn matches_raw(&self, value: Option<&str>) -> bool {
        match self {
            Self::Text { contains } => match value {
                Some(v) => v.to_lowercase().contains(&contains.trim().to_lowercase()),
                None => false,
            },
            Self::Checkbox { state } => {
                let normalized = value.map(|v| v.trim().to_lowercase());
                match state {
                    TriState::Any => true,
                    TriState::Checked => normalized
                        .as_deref()
                        .is_some_and(|v| TRUE_TOKENS.contains(&v)),
                    TriState::Unchecked => match normalized.as_deref() {
                        None => true,
                        Some(v) => FALSE_TOKENS.contains(&v),
                    },
                }
            }
            Self::Select { options } => match value {
                Some(v) => {
                    let stored = v.to_lowercase();
                    options
                        .iter()
                        .filter(|o| !o.trim().is_empty())
                        .any(|o| stored.contains(&o.trim().to_lowercase()))
                }
                None => false,
            },
            Self::Date { from, to } => match value.and_then(parse_raw_date) {
                Some(d) => from.map_or(true, |f| d >= f) && to.map_or(true, |t| d <= t),
                None => false,
            },
            // Raw values carry no numeric projection, so this compares the
            // text representations. "9" > "10" lexicographically; known
            // precision limitation of the untyped path, kept rather than
            // silently changing filter semantics.
            Self::Number { min, max } => match value {
                Some(v) => {
                    min.map_or(true, |m| v >= m.to_string().as_str())
                        && max.map_or(true, |m| v <= m.to_string().as_str())
                }
                None => false,
            },
        }
    }
}

fn parse_raw_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

/// Keyed by field key. A BTreeMap keeps evaluation order deterministic,
/// which the short-circuit behavior of the resolver depends on.
pub type CustomFilterMap = BTreeMap<String, CustomFieldFilter>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityFilters {
    pub search: Option<String>,
    pub status_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub custom: CustomFilterMap,
}

impl EntityFilters {
    pub fn is_empty(&self) -> bool {
        self.search.as_deref().map_or(true, |s| s.trim().is_empty())
            && self.status_ids.as_ref().map_or(true, |ids| ids.is_empty())
            && self.custom.values().all(CustomFieldFilter::is_inert)
    }

    pub fn active_custom(&self) -> impl Iterator<Item = (&String, &CustomFieldFilter)> {
        self.custom.iter().filter(|(_, f)| !f.is_inert())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "asc" | "ascending" => Some(Self::Asc),
            "desc" | "descending" => Some(Self::Desc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: SortDirection,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: "updated_at".to_string(),
            direction: SortDirection::Desc,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: i64 = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based.
    pub page: i64,
    pub page_size: i64,
    pub sort: Sort,
    pub filters: EntityFilters,
    pub include_count: bool,
    /// Forward-scroll consumption: merge the fetched page into the visible
    /// list instead of replacing it.
    pub append: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: Sort::default(),
            filters: EntityFilters::default(),
            include_count: true,
            append: false,
        }
    }
}

impl PageRequest {
    /// The prefetch snapshot only ever covers this exact view.
    pub fn is_default_view(&self) -> bool {
        self.page == 1
            && self.page_size == DEFAULT_PAGE_SIZE
            && self.sort == Sort::default()
            && self.filters.is_empty()
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).max(0) * self.page_size
    }
}

/// Query-string parameters accepted by the list endpoints. `filters` is a
/// JSON-encoded object of custom-field filters keyed by field key.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub search: Option<String>,
    /// Comma-separated status UUIDs.
    pub status_ids: Option<String>,
    pub filters: Option<String>,
    pub include_count: Option<bool>,
    pub append: Option<bool>,
}

impl ListParams {
    pub fn into_page_request(self) -> Result<PageRequest, QueryError> {
        let page = self.page.unwrap_or(1);
        if page < 1 {
            return Err(QueryError::InvalidFilter("page must be >= 1".to_string()));
        }
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size < 1 {
            return Err(QueryError::InvalidFilter(
                "page_size must be > 0".to_string(),
            ));
        }

        let mut sort = Sort::default();
        if let Some(field) = self.sort_by {
            if !field.trim().is_empty() {
                sort.field = field;
            }
        }
        if let Some(dir) = self.sort_dir {
            sort.direction = SortDirection::from_str(&dir).ok_or_else(|| {
                QueryError::InvalidFilter(format!("unknown sort direction '{dir}'"))
            })?;
        }

        let status_ids = match self.status_ids.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let ids = raw
                    .split(',')
                    .map(|part| Uuid::parse_str(part.trim()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| {
                        QueryError::InvalidFilter("status_ids must be UUIDs".to_string())
                    })?;
                Some(ids)
            }
        };

        let custom: CustomFilterMap = match self.filters.as_deref().map(str::trim) {
            None | Some("") => CustomFilterMap::new(),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| QueryError::InvalidFilter(format!("bad filter payload: {e}")))?,
        };

        Ok(PageRequest {
            page,
            page_size,
            sort,
            filters: EntityFilters {
                search: self.search,
                status_ids,
                custom,
            },
            include_count: self.include_count.unwrap_or(true),
            append: self.append.unwrap_or(false),
        })
    }
}

/// Rejects filters that do not line up with the tenant's field definitions.
/// Unknown keys and shape/type mismatches are caller errors, not data.
pub fn validate_custom_filters(
    definitions: &[CustomFieldDefinition],
    filters: &CustomFilterMap,
) -> Result<(), QueryError> {
    for (key, filter) in filters {
        let Some(def) = definitions.iter().find(|d| &d.field_key == key) else {
            return Err(QueryError::InvalidFilter(format!(
                "unknown custom field '{key}'"
            )));
        };
        let expected = filter.expected_field_type();
        // Single- and multi-select definitions share the select filter shape.
        let matches = def.field_type == expected
            || (expected == "select" && def.field_type == "multiselect");
        if !matches {
            return Err(QueryError::InvalidFilter(format!(
                "custom field '{key}' is {}, filter is {expected}",
                def.field_type
            )));
        }
    }
    Ok(())
}
