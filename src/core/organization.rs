//! Organization resolution for multi-tenant requests.
//!
//! Every query-layer operation is scoped to exactly one organization. The
//! resolver is a trait so the facades can be exercised with a fixed or
//! absent organization in tests.

use crate::query::error::QueryError;
use crate::shared::utils::DbPool;
use diesel::prelude::*;
use log::warn;
use uuid::Uuid;

pub trait OrgResolver: Send + Sync {
    /// Returns the caller's active organization, or `None` when the caller
    /// has no organization at all. Infrastructure failures are errors, not
    /// `None`, so "no organization" is never conflated with "lookup broke".
    fn active_org(&self) -> Result<Option<Uuid>, QueryError>;
}

/// Resolves the deployment's active organization from the database.
pub struct DbOrgResolver {
    pool: DbPool,
}

impl DbOrgResolver {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl OrgResolver for DbOrgResolver {
    fn active_org(&self) -> Result<Option<Uuid>, QueryError> {
        use crate::shared::schema::organizations::dsl::*;

        let mut conn = self
            .pool
            .get()
            .map_err(|e| QueryError::Connection(e.to_string()))?;

        let resolved = organizations
            .order(created_at.asc())
            .select(org_id)
            .first::<Uuid>(&mut conn)
            .optional()
            .map_err(QueryError::from_db)?;

        if resolved.is_none() {
            warn!("No organization provisioned for this deployment");
        }
        Ok(resolved)
    }
}

/// Fixed resolver for tests and tooling.
pub struct StaticOrgResolver(pub Option<Uuid>);

impl OrgResolver for StaticOrgResolver {
    fn active_org(&self) -> Result<Option<Uuid>, QueryError> {
        Ok(self.0)
    }
}
