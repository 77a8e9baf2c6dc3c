//! PostgreSQL schema migrations
//!
//! Applied in order, each in its own transaction, and recorded in
//! `schema_migrations` so reruns skip what is already there.

use deadpool_postgres::{Pool, PoolError};
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration: {0}")]
    Postgres(#[from] PgError),
}

struct Migration {
    id: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "ip pools, ip addresses and queued messages",
        sql: r#"
CREATE TABLE IF NOT EXISTS ip_pools (
    id BIGSERIAL PRIMARY KEY,
    uuid UUID NOT NULL UNIQUE,
    name TEXT NOT NULL,
    pool_type TEXT NOT NULL DEFAULT 'local',
    "default" BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT chk_pool_type CHECK (pool_type IN ('local', 'proxy')),
    CONSTRAINT chk_proxy_not_default CHECK (NOT (pool_type = 'proxy' AND "default"))
);

CREATE TABLE IF NOT EXISTS ip_addresses (
    id BIGSERIAL PRIMARY KEY,
    ip_pool_id BIGINT NOT NULL REFERENCES ip_pools(id),
    ipv4 TEXT NOT NULL,
    ipv6 TEXT,
    hostname TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 100,
    proxy_port INTEGER NOT NULL DEFAULT 1080,
    proxy_username TEXT,
    proxy_password TEXT,
    verified_at TIMESTAMPTZ,
    verification_error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT uq_ip_addresses_pool_ipv4 UNIQUE (ip_pool_id, ipv4),
    CONSTRAINT chk_priority_range CHECK (priority BETWEEN 0 AND 100)
);

CREATE TABLE IF NOT EXISTS queued_messages (
    id BIGSERIAL PRIMARY KEY,
    message_id BIGINT NOT NULL,
    domain TEXT NOT NULL,
    ip_address_id BIGINT REFERENCES ip_addresses(id),
    attempts INTEGER NOT NULL DEFAULT 0,
    retry_after TIMESTAMPTZ,
    locked_by TEXT,
    locked_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#,
    },
    Migration {
        id: 2,
        description: "indexes for host resolution and claiming",
        sql: r"
CREATE INDEX IF NOT EXISTS idx_ip_addresses_ipv4 ON ip_addresses(ipv4);
CREATE INDEX IF NOT EXISTS idx_ip_addresses_ipv6 ON ip_addresses(ipv6) WHERE ipv6 IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_ip_addresses_pool ON ip_addresses(ip_pool_id, priority DESC);

CREATE INDEX IF NOT EXISTS idx_queued_messages_unlocked
    ON queued_messages(id)
    WHERE locked_by IS NULL AND locked_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_queued_messages_lock
    ON queued_messages(locked_by, locked_at);
CREATE INDEX IF NOT EXISTS idx_queued_messages_ip_address
    ON queued_messages(ip_address_id);
",
    },
    Migration {
        id: 3,
        description: "unique ipv6 across local addresses",
        sql: r"
DROP INDEX IF EXISTS idx_ip_addresses_ipv6;
CREATE UNIQUE INDEX IF NOT EXISTS uq_ip_addresses_ipv6
    ON ip_addresses(ipv6)
    WHERE ipv6 IS NOT NULL;
",
    },
];

/// Proxy addresses never carry an IPv6 address, so every non-null `ipv6`
/// belongs to a local pool and this index covers the cross-pool rule.
pub const IPV6_UNIQUE_INDEX: &str = "uq_ip_addresses_ipv6";

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &Pool) -> Result<(), MigrationError> {
    let mut client = pool.get().await?;
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             );",
        )
        .await?;

    for migration in MIGRATIONS {
        let already_applied: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM schema_migrations WHERE id = $1)",
                &[&migration.id],
            )
            .await?
            .try_get(0)?;

        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        info!(
            id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_ids_are_sequential() {
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(usize::try_from(migration.id).unwrap(), index + 1);
            assert!(!migration.description.is_empty());
        }
    }

    #[test]
    fn test_ipv6_index_is_created_by_a_migration() {
        assert!(
            MIGRATIONS
                .iter()
                .any(|migration| migration.sql.contains(IPV6_UNIQUE_INDEX))
        );
    }
}
