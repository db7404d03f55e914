//! Schema-drift tracking.
//!
//! Deployments migrate at their own pace, so some columns this code selects
//! may not exist yet on a given install. The support map records which
//! optional columns the live schema has been observed to lack. Transitions
//! are one-way (supported -> unsupported) and last for the process lifetime;
//! the map is rebuilt from scratch on restart.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedColumn {
    LeadLastContactedAt,
    LeadArchivedAt,
    ProjectCompletedAt,
    /// Numeric column of the typed custom-attribute projection.
    TypedNumberValue,
}

impl TrackedColumn {
    pub const ALL: [TrackedColumn; 4] = [
        TrackedColumn::LeadLastContactedAt,
        TrackedColumn::LeadArchivedAt,
        TrackedColumn::ProjectCompletedAt,
        TrackedColumn::TypedNumberValue,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Self::LeadLastContactedAt => "last_contacted_at",
            Self::LeadArchivedAt => "archived_at",
            Self::ProjectCompletedAt => "completed_at",
            Self::TypedNumberValue => "value_number",
        }
    }

    /// Columns gated behind the legacy-schema deployment flag. These start
    /// unsupported instead of being discovered through a failed query.
    pub const FLAG_GATED: [TrackedColumn; 3] = [
        TrackedColumn::LeadLastContactedAt,
        TrackedColumn::LeadArchivedAt,
        TrackedColumn::ProjectCompletedAt,
    ];

    pub fn from_column_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.column_name() == name)
    }
}

pub struct ColumnSupport {
    map: RwLock<HashMap<TrackedColumn, bool>>,
}

impl ColumnSupport {
    pub fn new(legacy_schema: bool) -> Self {
        let mut map = HashMap::new();
        if legacy_schema {
            for col in TrackedColumn::FLAG_GATED {
                map.insert(col, false);
            }
        }
        Self {
            map: RwLock::new(map),
        }
    }

    /// Seeds arbitrary unsupported columns, mostly for tests.
    pub fn with_unsupported(columns: &[TrackedColumn]) -> Self {
        let support = Self::new(false);
        for col in columns {
            support.mark_unsupported(*col);
        }
        support
    }

    pub fn supports(&self, column: TrackedColumn) -> bool {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&column)
            .copied()
            .unwrap_or(true)
    }

    pub fn mark_unsupported(&self, column: TrackedColumn) {
        let previous = self
            .map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(column, false);
        if previous != Some(false) {
            warn!(
                "Schema does not expose column '{}'; excluding it for the rest of this process",
                column.column_name()
            );
        }
    }
}

impl std::fmt::Debug for ColumnSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ColumnSupport").field("map", &*map).finish()
    }
}

/// What a failed query tells us about the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbErrorClass {
    /// `column "x" does not exist` — a capability absence recoverable by
    /// excluding the column.
    MissingColumn(String),
    /// `function ... does not exist` — the server-side paged filter
    /// procedure is absent on this deployment.
    MissingFunction,
    /// `relation ... does not exist` — e.g. the typed attribute projection
    /// has not been materialized.
    MissingRelation,
    /// The connection itself failed. Never treated as a capability absence.
    Connection,
    Other,
}

impl DbErrorClass {
    pub fn is_capability_absence(&self) -> bool {
        matches!(
            self,
            Self::MissingColumn(_) | Self::MissingFunction | Self::MissingRelation
        )
    }
}

/// The single place that turns backend errors into capability knowledge.
/// Postgres reports absences with stable message shapes; nothing outside
/// this function matches on error strings.
pub fn classify_db_error(err: &DieselError) -> DbErrorClass {
    match err {
        DieselError::DatabaseError(kind, info) => {
            if matches!(
                kind,
                DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand
            ) {
                return DbErrorClass::Connection;
            }
            let message = info.message();
            if let Some(column) = missing_column_name(message) {
                DbErrorClass::MissingColumn(column)
            } else if message.contains("function") && message.contains("does not exist") {
                DbErrorClass::MissingFunction
            } else if message.contains("relation") && message.contains("does not exist") {
                DbErrorClass::MissingRelation
            } else {
                DbErrorClass::Other
            }
        }
        _ => DbErrorClass::Other,
    }
}

/// Parses the column name out of `column "x" does not exist` and
/// `column x.y does not exist`, stripping any table qualifier.
fn missing_column_name(message: &str) -> Option<String> {
    let rest = message.strip_prefix("column ")?;
    let name_part = rest.split(" does not exist").next()?;
    if name_part == rest {
        return None;
    }
    let name = name_part.trim_matches('"');
    let unqualified = name.rsplit('.').next().unwrap_or(name);
    if unqualified.is_empty() {
        None
    } else {
        Some(unqualified.trim_matches('"').to_string())
    }
}

/// Runs a query whose shape depends on the support map, downgrading and
/// retrying when the backend reports a tracked column as missing. Bounded by
/// the number of tracked columns, so it always terminates.
pub fn run_with_column_retry<T, F>(support: &ColumnSupport, mut attempt: F) -> Result<T, DieselError>
where
    F: FnMut(&ColumnSupport) -> Result<T, DieselError>,
{
    let mut last_err: Option<DieselError> = None;
    for _ in 0..=TrackedColumn::ALL.len() {
        match attempt(support) {
            Ok(value) => return Ok(value),
            Err(err) => {
                let downgraded = match classify_db_error(&err) {
                    DbErrorClass::MissingColumn(name) => {
                        match TrackedColumn::from_column_name(&name) {
                            Some(col) if support.supports(col) => {
                                debug!(
                                    "Retrying query without missing column '{}'",
                                    col.column_name()
                                );
                                support.mark_unsupported(col);
                                true
                            }
                            _ => false,
                        }
                    }
                    _ => false,
                };
                if !downgraded {
                    return Err(err);
                }
                last_err = Some(err);
            }
        }
    }
    // Every tracked column has been excluded and the query still failed.
    Err(last_err.unwrap_or(DieselError::NotFound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::result::Error as DieselError;

    fn undefined_column(name: &str) -> DieselError {
        DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new(format!("column \"{name}\" does not exist")),
        )
    }

    #[test]
    fn test_classify_missing_column() {
        let err = undefined_column("last_contacted_at");
        assert_eq!(
            classify_db_error(&err),
            DbErrorClass::MissingColumn("last_contacted_at".to_string())
        );
    }

    #[test]
    fn test_classify_qualified_column() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("column l.archived_at does not exist".to_string()),
        );
        assert_eq!(
            classify_db_error(&err),
            DbErrorClass::MissingColumn("archived_at".to_string())
        );
    }

    #[test]
    fn test_classify_missing_function() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new(
                "function leads_filter_paged(uuid, integer) does not exist".to_string(),
            ),
        );
        assert_eq!(classify_db_error(&err), DbErrorClass::MissingFunction);
        assert!(classify_db_error(&err).is_capability_absence());
    }

    #[test]
    fn test_classify_missing_relation() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::Unknown,
            Box::new("relation \"custom_field_values_typed\" does not exist".to_string()),
        );
        assert_eq!(classify_db_error(&err), DbErrorClass::MissingRelation);
    }

    #[test]
    fn test_classify_connection() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::ClosedConnection,
            Box::new("server closed the connection unexpectedly".to_string()),
        );
        assert_eq!(classify_db_error(&err), DbErrorClass::Connection);
        assert!(!classify_db_error(&err).is_capability_absence());
    }

    #[test]
    fn test_flag_gated_columns_start_unsupported() {
        let support = ColumnSupport::new(true);
        assert!(!support.supports(TrackedColumn::LeadLastContactedAt));
        assert!(!support.supports(TrackedColumn::LeadArchivedAt));
        assert!(!support.supports(TrackedColumn::ProjectCompletedAt));
        // Not gated by the flag.
        assert!(support.supports(TrackedColumn::TypedNumberValue));
    }

    #[test]
    fn test_mark_unsupported_is_one_way() {
        let support = ColumnSupport::new(false);
        assert!(support.supports(TrackedColumn::LeadArchivedAt));
        support.mark_unsupported(TrackedColumn::LeadArchivedAt);
        assert!(!support.supports(TrackedColumn::LeadArchivedAt));
        support.mark_unsupported(TrackedColumn::LeadArchivedAt);
        assert!(!support.supports(TrackedColumn::LeadArchivedAt));
    }

    #[test]
    fn test_retry_excludes_column_then_succeeds() {
        let support = ColumnSupport::new(false);
        let mut attempts = 0;
        let result = run_with_column_retry(&support, |support| {
            attempts += 1;
            if support.supports(TrackedColumn::LeadLastContactedAt) {
                Err(undefined_column("last_contacted_at"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.ok(), Some(42));
        assert_eq!(attempts, 2);
        assert!(!support.supports(TrackedColumn::LeadLastContactedAt));

        // Same shape again: the column is skipped without re-probing.
        let mut attempts = 0;
        let result = run_with_column_retry(&support, |support| {
            attempts += 1;
            if support.supports(TrackedColumn::LeadLastContactedAt) {
                Err(undefined_column("last_contacted_at"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.ok(), Some(7));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_retry_cascades_across_columns() {
        let support = ColumnSupport::new(false);
        let result = run_with_column_retry(&support, |support| {
            if support.supports(TrackedColumn::LeadLastContactedAt) {
                Err(undefined_column("last_contacted_at"))
            } else if support.supports(TrackedColumn::LeadArchivedAt) {
                Err(undefined_column("archived_at"))
            } else {
                Ok("ok")
            }
        });
        assert_eq!(result.ok(), Some("ok"));
        assert!(!support.supports(TrackedColumn::LeadLastContactedAt));
        assert!(!support.supports(TrackedColumn::LeadArchivedAt));
    }

    #[test]
    fn test_retry_propagates_untracked_errors() {
        let support = ColumnSupport::new(false);
        let result: Result<(), _> = run_with_column_retry(&support, |_| {
            Err(undefined_column("some_unrelated_column"))
        });
        assert!(result.is_err());
    }
}
