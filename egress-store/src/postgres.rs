use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use egress_queue::{
    ClaimRequest, ClaimToken, MessageId, NewQueuedMessage, QueueError, QueueStore, QueuedMessage,
};
use egress_registry::{
    AddressDraft, AddressId, AddressParams, IpAddress, IpPool, NewPool, PoolId, PoolType,
    PoolUpdate, RegistryError, RegistryStore, ValidationError, VerificationRecord, validation,
};
use tokio_postgres::{NoTls, Row, Transaction, error::SqlState};
use tracing::instrument;
use uuid::Uuid;

use crate::{MigrationError, PostgresError, migrations::IPV6_UNIQUE_INDEX, run_migrations};

const POOL_COLUMNS: &str = r#"id, uuid, name, pool_type, "default", created_at"#;

const ADDRESS_SELECT: &str = "SELECT a.id, a.ip_pool_id, p.pool_type, a.ipv4, a.ipv6, \
     a.hostname, a.priority, a.proxy_port, a.proxy_username, a.proxy_password, a.verified_at, \
     a.verification_error, a.created_at \
     FROM ip_addresses a JOIN ip_pools p ON p.id = a.ip_pool_id";

const MESSAGE_COLUMNS: &str =
    "id, message_id, domain, ip_address_id, attempts, retry_after, locked_by, locked_at, created_at";

/// Stamp up to `$5` claimable rows with the token in one statement.
///
/// The inner select locks the rows it picks and skips rows another claimer
/// has already locked, so two concurrent statements can never pick the same
/// row. The outer update re-checks nothing; the lock guarantees the row is
/// still unclaimed.
const CLAIM_SQL: &str = "UPDATE queued_messages
SET locked_by = $1, locked_at = $2
WHERE id IN (
    SELECT id
    FROM queued_messages
    WHERE locked_by IS NULL
      AND locked_at IS NULL
      AND (retry_after IS NULL OR retry_after <= $3)
      AND (ip_address_id IS NULL OR ip_address_id = ANY($4))
    ORDER BY id
    LIMIT $5
    FOR UPDATE SKIP LOCKED
)";

fn parse_pool_type(value: &str) -> Result<PoolType, PostgresError> {
    PoolType::from_str(value).map_err(|err| PostgresError::Mapping(err.to_string()))
}

fn row_to_pool(row: &Row) -> Result<IpPool, PostgresError> {
    Ok(IpPool {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        pool_type: parse_pool_type(row.try_get("pool_type")?)?,
        default: row.try_get("default")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_address(row: &Row) -> Result<IpAddress, PostgresError> {
    Ok(IpAddress {
        id: row.try_get("id")?,
        pool_id: row.try_get("ip_pool_id")?,
        pool_type: parse_pool_type(row.try_get("pool_type")?)?,
        ipv4: row.try_get("ipv4")?,
        ipv6: row.try_get("ipv6")?,
        hostname: row.try_get("hostname")?,
        priority: row.try_get("priority")?,
        proxy_port: row.try_get("proxy_port")?,
        proxy_username: row.try_get("proxy_username")?,
        proxy_password: row.try_get("proxy_password")?,
        verified_at: row.try_get("verified_at")?,
        verification_error: row.try_get("verification_error")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_message(row: &Row) -> Result<QueuedMessage, PostgresError> {
    Ok(QueuedMessage {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        domain: row.try_get("domain")?,
        ip_address_id: row.try_get("ip_address_id")?,
        attempts: row.try_get("attempts")?,
        retry_after: row.try_get("retry_after")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn count(row: &Row) -> Result<i64, PostgresError> {
    Ok(row.try_get(0)?)
}

/// Turn a unique-key violation on `(ip_pool_id, ipv4)` into the validation
/// error a concurrent insert would have produced.
fn address_write_error(err: tokio_postgres::Error, draft: &AddressDraft) -> PostgresError {
    if err.code() != Some(&SqlState::UNIQUE_VIOLATION) {
        return err.into();
    }

    let constraint = err.as_db_error().and_then(|db| db.constraint());
    let taken = match (constraint, &draft.ipv6) {
        (Some(IPV6_UNIQUE_INDEX), Some(ipv6)) => ValidationError::Taken {
            field: "ipv6",
            value: ipv6.clone(),
        },
        _ => ValidationError::Taken {
            field: "ipv4",
            value: draft.ipv4.clone(),
        },
    };
    RegistryError::from(taken).into()
}

async fn pool_in(tx: &Transaction<'_>, id: PoolId) -> Result<IpPool, PostgresError> {
    tx.query_opt(
        &format!("SELECT {POOL_COLUMNS} FROM ip_pools WHERE id = $1 FOR UPDATE"),
        &[&id],
    )
    .await?
    .map(|row| row_to_pool(&row))
    .transpose()?
    .ok_or_else(|| RegistryError::PoolNotFound(id).into())
}

/// Rows a draft could collide with under the uniqueness rules.
async fn colliding(tx: &Transaction<'_>, draft: &AddressDraft) -> Result<Vec<IpAddress>, PostgresError> {
    tx.query(
        &format!(
            "{ADDRESS_SELECT}
             WHERE (a.ip_pool_id = $1 AND a.ipv4 = $2)
                OR (p.pool_type = 'local' AND a.ipv6 IS NOT NULL AND a.ipv6 = $3)"
        ),
        &[&draft.pool_id, &draft.ipv4, &draft.ipv6],
    )
    .await?
    .iter()
    .map(row_to_address)
    .collect()
}

#[instrument(skip(pool))]
async fn create_pool(pool: &Pool, new: NewPool) -> Result<IpPool, PostgresError> {
    validation::pool(&new.name, new.pool_type, new.default).map_err(RegistryError::from)?;

    let client = pool.get().await?;
    let row = client
        .query_one(
            &format!(
                r#"INSERT INTO ip_pools (uuid, name, pool_type, "default")
                   VALUES ($1, $2, $3, $4)
                   RETURNING {POOL_COLUMNS}"#
            ),
            &[
                &Uuid::new_v4(),
                &new.name.trim(),
                &new.pool_type.as_str(),
                &new.default,
            ],
        )
        .await?;

    row_to_pool(&row)
}

#[instrument(skip(pool))]
async fn update_pool(pool: &Pool, id: PoolId, update: PoolUpdate) -> Result<IpPool, PostgresError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let mut updated = update.apply(&pool_in(&tx, id).await?);
    validation::pool(&updated.name, updated.pool_type, updated.default)
        .map_err(RegistryError::from)?;
    updated.name = updated.name.trim().to_string();

    tx.execute(
        r#"UPDATE ip_pools SET name = $2, "default" = $3 WHERE id = $1"#,
        &[&id, &updated.name, &updated.default],
    )
    .await?;
    tx.commit().await?;

    Ok(updated)
}

#[instrument(skip(pool))]
async fn delete_pool(pool: &Pool, id: PoolId) -> Result<(), PostgresError> {
    let client = pool.get().await?;

    let deleted = client
        .execute(
            "DELETE FROM ip_pools
             WHERE id = $1
               AND NOT EXISTS (SELECT 1 FROM ip_addresses WHERE ip_pool_id = $1)",
            &[&id],
        )
        .await?;
    if deleted > 0 {
        return Ok(());
    }

    let row = client
        .query_opt(
            "SELECT (SELECT COUNT(*) FROM ip_addresses WHERE ip_pool_id = p.id)
             FROM ip_pools p WHERE p.id = $1",
            &[&id],
        )
        .await?;

    Err(match row {
        None => RegistryError::PoolNotFound(id),
        Some(row) => RegistryError::PoolInUse {
            id,
            addresses: usize::try_from(count(&row)?).unwrap_or(usize::MAX),
        },
    }
    .into())
}

async fn create_address(
    pool: &Pool,
    pool_id: PoolId,
    params: AddressParams,
) -> Result<IpAddress, PostgresError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let owner = pool_in(&tx, pool_id).await?;
    let draft = validation::address(&owner, None, params).map_err(RegistryError::from)?;
    validation::unique(&draft, None, &colliding(&tx, &draft).await?)
        .map_err(RegistryError::from)?;

    let row = tx
        .query_one(
            "INSERT INTO ip_addresses
                (ip_pool_id, ipv4, ipv6, hostname, priority, proxy_port, proxy_username, proxy_password)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id, created_at",
            &[
                &draft.pool_id,
                &draft.ipv4,
                &draft.ipv6,
                &draft.hostname,
                &draft.priority,
                &draft.proxy_port,
                &draft.proxy_username,
                &draft.proxy_password,
            ],
        )
        .await
        .map_err(|err| address_write_error(err, &draft))?;
    tx.commit().await?;

    Ok(IpAddress {
        id: row.try_get("id")?,
        pool_id: draft.pool_id,
        pool_type: draft.pool_type,
        ipv4: draft.ipv4,
        ipv6: draft.ipv6,
        hostname: draft.hostname,
        priority: draft.priority,
        proxy_port: draft.proxy_port,
        proxy_username: draft.proxy_username,
        proxy_password: draft.proxy_password,
        verified_at: None,
        verification_error: None,
        created_at: row.try_get("created_at")?,
    })
}

async fn update_address(
    pool: &Pool,
    id: AddressId,
    params: AddressParams,
) -> Result<IpAddress, PostgresError> {
    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let existing = tx
        .query_opt(&format!("{ADDRESS_SELECT} WHERE a.id = $1 FOR UPDATE OF a"), &[&id])
        .await?
        .map(|row| row_to_address(&row))
        .transpose()?
        .ok_or(RegistryError::AddressNotFound(id))?;

    let owner = pool_in(&tx, existing.pool_id).await?;
    let draft =
        validation::address(&owner, Some(&existing), params).map_err(RegistryError::from)?;
    validation::unique(&draft, Some(id), &colliding(&tx, &draft).await?)
        .map_err(RegistryError::from)?;

    tx.execute(
        "UPDATE ip_addresses
         SET ipv4 = $2, ipv6 = $3, hostname = $4, priority = $5, proxy_port = $6,
             proxy_username = $7, proxy_password = $8
         WHERE id = $1",
        &[
            &id,
            &draft.ipv4,
            &draft.ipv6,
            &draft.hostname,
            &draft.priority,
            &draft.proxy_port,
            &draft.proxy_username,
            &draft.proxy_password,
        ],
    )
    .await
    .map_err(|err| address_write_error(err, &draft))?;
    tx.commit().await?;

    Ok(IpAddress {
        ipv4: draft.ipv4,
        ipv6: draft.ipv6,
        hostname: draft.hostname,
        priority: draft.priority,
        proxy_port: draft.proxy_port,
        proxy_username: draft.proxy_username,
        proxy_password: draft.proxy_password,
        ..existing
    })
}

#[instrument(skip(pool))]
async fn delete_address(pool: &Pool, id: AddressId) -> Result<(), PostgresError> {
    let client = pool.get().await?;

    let deleted = client
        .execute(
            "DELETE FROM ip_addresses
             WHERE id = $1
               AND NOT EXISTS (SELECT 1 FROM queued_messages WHERE ip_address_id = $1)",
            &[&id],
        )
        .await?;
    if deleted > 0 {
        return Ok(());
    }

    let row = client
        .query_opt(
            "SELECT (SELECT COUNT(*) FROM queued_messages WHERE ip_address_id = a.id)
             FROM ip_addresses a WHERE a.id = $1",
            &[&id],
        )
        .await?;

    Err(match row {
        None => RegistryError::AddressNotFound(id),
        Some(row) => RegistryError::AddressInUse {
            id,
            queued: u64::try_from(count(&row)?).unwrap_or_default(),
        },
    }
    .into())
}

/// PostgreSQL-backed registry and queue, shared by every worker host
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl PostgresStore {
    #[must_use]
    pub const fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a connection pool for `url`. No connection is opened until the
    /// first query.
    ///
    /// # Errors
    ///
    /// Fails if `url` is not a valid connection string.
    pub fn connect(url: &str, max_connections: usize) -> Result<Self, PostgresError> {
        tokio_postgres::Config::from_str(url)
            .map_err(|err| PostgresError::InvalidConfig(err.to_string()))?;

        let mut cfg = Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(max_connections.max(1)));

        Ok(Self::new(cfg.create_pool(Some(Runtime::Tokio1), NoTls)?))
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Apply any outstanding schema migrations.
    ///
    /// # Errors
    ///
    /// Fails if the database is unreachable or a migration fails.
    pub async fn migrate(&self) -> Result<(), MigrationError> {
        run_migrations(&self.pool).await
    }

    async fn query_addresses(
        &self,
        clause: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<IpAddress>, PostgresError> {
        let client = self.pool.get().await?;
        client
            .query(&format!("{ADDRESS_SELECT} {clause}"), params)
            .await?
            .iter()
            .map(row_to_address)
            .collect()
    }

    async fn query_pools(
        &self,
        clause: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<IpPool>, PostgresError> {
        let client = self.pool.get().await?;
        client
            .query(&format!("SELECT {POOL_COLUMNS} FROM ip_pools {clause}"), params)
            .await?
            .iter()
            .map(row_to_pool)
            .collect()
    }

    async fn query_ids(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<i64>, PostgresError> {
        let client = self.pool.get().await?;
        client
            .query(sql, params)
            .await?
            .iter()
            .map(|row| Ok(row.try_get(0)?))
            .collect()
    }

    async fn query_messages(
        &self,
        clause: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<QueuedMessage>, PostgresError> {
        let client = self.pool.get().await?;
        client
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM queued_messages {clause}"),
                params,
            )
            .await?
            .iter()
            .map(row_to_message)
            .collect()
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64, PostgresError> {
        let client = self.pool.get().await?;
        Ok(client.execute(sql, params).await?)
    }
}

#[async_trait]
impl RegistryStore for PostgresStore {
    async fn create_pool(&self, pool: NewPool) -> egress_registry::Result<IpPool> {
        Ok(create_pool(&self.pool, pool).await?)
    }

    async fn update_pool(
        &self,
        id: PoolId,
        update: PoolUpdate,
    ) -> egress_registry::Result<IpPool> {
        Ok(update_pool(&self.pool, id, update).await?)
    }

    async fn delete_pool(&self, id: PoolId) -> egress_registry::Result<()> {
        Ok(delete_pool(&self.pool, id).await?)
    }

    async fn pool(&self, id: PoolId) -> egress_registry::Result<Option<IpPool>> {
        Ok(self
            .query_pools("WHERE id = $1", &[&id])
            .await?
            .into_iter()
            .next())
    }

    async fn pool_by_uuid(&self, uuid: Uuid) -> egress_registry::Result<Option<IpPool>> {
        Ok(self
            .query_pools("WHERE uuid = $1", &[&uuid])
            .await?
            .into_iter()
            .next())
    }

    async fn pools(&self) -> egress_registry::Result<Vec<IpPool>> {
        Ok(self.query_pools("ORDER BY name, id", &[]).await?)
    }

    async fn default_pool(&self) -> egress_registry::Result<Option<IpPool>> {
        Ok(self
            .query_pools(r#"WHERE "default" ORDER BY id LIMIT 1"#, &[])
            .await?
            .into_iter()
            .next())
    }

    async fn create_address(
        &self,
        pool_id: PoolId,
        params: AddressParams,
    ) -> egress_registry::Result<IpAddress> {
        Ok(create_address(&self.pool, pool_id, params).await?)
    }

    async fn update_address(
        &self,
        id: AddressId,
        params: AddressParams,
    ) -> egress_registry::Result<IpAddress> {
        Ok(update_address(&self.pool, id, params).await?)
    }

    async fn delete_address(&self, id: AddressId) -> egress_registry::Result<()> {
        Ok(delete_address(&self.pool, id).await?)
    }

    async fn address(&self, id: AddressId) -> egress_registry::Result<Option<IpAddress>> {
        Ok(self
            .query_addresses("WHERE a.id = $1", &[&id])
            .await?
            .into_iter()
            .next())
    }

    async fn addresses_in_pool(
        &self,
        pool_id: PoolId,
    ) -> egress_registry::Result<Vec<IpAddress>> {
        Ok(self
            .query_addresses(
                "WHERE a.ip_pool_id = $1 ORDER BY a.priority DESC, a.id",
                &[&pool_id],
            )
            .await?)
    }

    async fn local_address_ids(
        &self,
        ipv4: &[String],
        ipv6: &[String],
    ) -> egress_registry::Result<Vec<AddressId>> {
        Ok(self
            .query_ids(
                "SELECT a.id
                 FROM ip_addresses a JOIN ip_pools p ON p.id = a.ip_pool_id
                 WHERE p.pool_type = 'local'
                   AND (a.ipv4 = ANY($1) OR a.ipv6 = ANY($2))
                 ORDER BY a.id",
                &[&ipv4, &ipv6],
            )
            .await?)
    }

    async fn proxy_address_ids(&self) -> egress_registry::Result<Vec<AddressId>> {
        Ok(self
            .query_ids(
                "SELECT a.id
                 FROM ip_addresses a JOIN ip_pools p ON p.id = a.ip_pool_id
                 WHERE p.pool_type = 'proxy'
                 ORDER BY a.id",
                &[],
            )
            .await?)
    }

    async fn record_verification(
        &self,
        id: AddressId,
        record: VerificationRecord,
    ) -> egress_registry::Result<()> {
        let updated = self
            .execute(
                "UPDATE ip_addresses SET verified_at = $2, verification_error = $3 WHERE id = $1",
                &[&id, &record.verified_at, &record.verification_error],
            )
            .await?;

        if updated == 0 {
            return Err(RegistryError::AddressNotFound(id));
        }

        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn enqueue(&self, message: NewQueuedMessage) -> egress_queue::Result<QueuedMessage> {
        let client = self.pool.get().await.map_err(PostgresError::from)?;

        let row = client
            .query_one(
                &format!(
                    "INSERT INTO queued_messages (message_id, domain, ip_address_id, retry_after)
                     VALUES ($1, $2, $3, $4)
                     RETURNING {MESSAGE_COLUMNS}"
                ),
                &[
                    &message.message_id,
                    &message.domain,
                    &message.ip_address_id,
                    &message.retry_after,
                ],
            )
            .await
            .map_err(|err| match message.ip_address_id {
                Some(id) if err.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) => {
                    QueueError::Registry(RegistryError::AddressNotFound(id))
                }
                _ => PostgresError::from(err).into(),
            })?;

        Ok(row_to_message(&row)?)
    }

    async fn get(&self, id: MessageId) -> egress_queue::Result<Option<QueuedMessage>> {
        Ok(self
            .query_messages("WHERE id = $1", &[&id])
            .await?
            .into_iter()
            .next())
    }

    #[instrument(skip_all, fields(token = %request.token, limit = request.limit))]
    async fn claim(&self, request: &ClaimRequest<'_>) -> egress_queue::Result<u64> {
        let eligible = request.eligible.to_vec();
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);

        Ok(self
            .execute(
                CLAIM_SQL,
                &[
                    &request.token.locker(),
                    &request.token.locked_at(),
                    &request.now,
                    &eligible,
                    &limit,
                ],
            )
            .await?)
    }

    async fn claimed(&self, token: &ClaimToken) -> egress_queue::Result<Vec<QueuedMessage>> {
        Ok(self
            .query_messages(
                "WHERE locked_by = $1 AND locked_at = $2 ORDER BY id",
                &[&token.locker(), &token.locked_at()],
            )
            .await?)
    }

    async fn release(
        &self,
        id: MessageId,
        retry_after: Option<DateTime<Utc>>,
    ) -> egress_queue::Result<()> {
        let updated = self
            .execute(
                "UPDATE queued_messages
                 SET locked_by = NULL,
                     locked_at = NULL,
                     retry_after = COALESCE($2::timestamptz, retry_after),
                     attempts = attempts + CASE WHEN $2::timestamptz IS NULL THEN 0 ELSE 1 END
                 WHERE id = $1",
                &[&id, &retry_after],
            )
            .await?;

        if updated == 0 {
            return Err(QueueError::MessageNotFound(id));
        }

        Ok(())
    }

    async fn remove(&self, id: MessageId) -> egress_queue::Result<()> {
        let deleted = self
            .execute("DELETE FROM queued_messages WHERE id = $1", &[&id])
            .await?;

        if deleted == 0 {
            return Err(QueueError::MessageNotFound(id));
        }

        Ok(())
    }
}
