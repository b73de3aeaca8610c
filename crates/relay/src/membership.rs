// Organisation membership lookups.
//
// The `organisation_members` table is owned by the account service; the
// relay only reads it.

use std::{collections::HashSet, sync::Arc};

use anyhow::Context;
use callboard_common::types::{OrganisationId, UserId};
use tokio::sync::RwLock;

use crate::{config::DatabaseConfig, db::pool};

#[derive(Clone)]
pub enum OrganisationMembershipStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<HashSet<(OrganisationId, UserId)>>>),
}

impl OrganisationMembershipStore {
    /// Postgres-backed store when a database is configured, in-memory otherwise.
    pub async fn connect(database: Option<&DatabaseConfig>) -> anyhow::Result<Self> {
        match database {
            Some(config) => Ok(Self::Postgres(pool::connect(config).await?)),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashSet::new())))
    }

    pub async fn is_active_member(
        &self,
        organisation_id: OrganisationId,
        user_id: UserId,
    ) -> anyhow::Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let found = sqlx::query_scalar::<_, i32>(
                    r#"
                    SELECT 1
                    FROM organisation_members
                    WHERE organisation_id = $1
                      AND user_id = $2
                      AND status = 'active'
                    "#,
                )
                .bind(organisation_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to query organisation membership")?;

                Ok(found.is_some())
            }
            Self::Memory(store) => Ok(store.read().await.contains(&(organisation_id, user_id))),
        }
    }

    /// Adds a member to the in-memory store. No-op for the Postgres variant.
    pub async fn grant(&self, organisation_id: OrganisationId, user_id: UserId) {
        if let Self::Memory(store) = self {
            store.write().await.insert((organisation_id, user_id));
        }
    }

    /// Removes a member from the in-memory store. No-op for the Postgres variant.
    pub async fn revoke(&self, organisation_id: OrganisationId, user_id: UserId) {
        if let Self::Memory(store) = self {
            store.write().await.remove(&(organisation_id, user_id));
        }
    }
}
