//! Persistence for the purchase index: the staging and final relations, the
//! persisted sync flags and the durable batch-task queue.
//!
//! Two backends implement the same traits: [`PgStore`] (sqlx/Postgres, reading
//! WooCommerce-style source tables) and [`MemoryStore`] (in-process, used by tests
//! and local demos).

mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cbp_core::{BatchTask, IdColumn, MissingMetaPolicy, SyncState};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub use memory::{MemoryLineItem, MemoryOrder, MemoryStore};

pub const CRATE_NAME: &str = "cbp-storage";

const SYNC_STATE_KEY: &str = "sync_state";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("relation {0} does not exist; run ensure_schema first")]
    SchemaMissing(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Physical relation names, validated once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    prefix: String,
    name: String,
}

impl TableNames {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> StorageResult<Self> {
        let prefix = prefix.into();
        let name = name.into();
        if name.is_empty() {
            return Err(StorageError::Config("table name must not be empty".into()));
        }
        if !is_identifier(&name) {
            return Err(StorageError::Config(format!(
                "table name `{name}` may only contain ASCII letters, digits and underscores"
            )));
        }
        if !prefix.is_empty() && !is_identifier(&prefix) {
            return Err(StorageError::Config(format!(
                "table prefix `{prefix}` may only contain ASCII letters, digits and underscores"
            )));
        }
        Ok(Self { prefix, name })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn final_table(&self) -> String {
        format!("{}{}", self.prefix, self.name)
    }

    pub fn staging_table(&self) -> String {
        format!("{}{}_staging", self.prefix, self.name)
    }

    pub fn queue_table(&self) -> String {
        format!("{}{}_queue", self.prefix, self.name)
    }

    pub fn state_table(&self) -> String {
        format!("{}{}_state", self.prefix, self.name)
    }

    fn source(&self, table: &str) -> String {
        format!("{}{}", self.prefix, table)
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parameters of the purchase existence check.
#[derive(Debug, Clone, Copy)]
pub struct PurchaseFilter<'a> {
    pub product_id: i64,
    pub user_id: i64,
    /// Normalized candidate emails; never empty.
    pub emails: &'a [String],
    /// Order statuses that count as paid; `None` skips the live order join.
    pub paid_statuses: Option<&'a [String]>,
}

/// Staging/final relation operations used by the batch transformer and lookup.
#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// Create missing relations, columns and indexes. Idempotent.
    async fn ensure_schema(&self) -> StorageResult<()>;

    async fn truncate_staging(&self) -> StorageResult<()>;

    /// Copy up to `limit` source lines, ordered by line item id and starting at
    /// `offset`, into staging. Returns the number of rows staged.
    async fn stage_source_lines(
        &self,
        offset: u64,
        limit: u64,
        policy: MissingMetaPolicy,
    ) -> StorageResult<u64>;

    /// Coerce missing, empty or non-numeric values of one staging column to `0`.
    async fn repair_staging_ids(&self, column: IdColumn) -> StorageResult<u64>;

    /// Insert staged rows into the final relation, skipping existing keys.
    async fn merge_staging(&self) -> StorageResult<u64>;

    async fn account_email(&self, user_id: i64) -> StorageResult<Option<String>>;

    async fn find_purchase(&self, filter: PurchaseFilter<'_>) -> StorageResult<bool>;

    /// Delete final rows whose product, variation or order id equals `source_id`.
    async fn remove_entries_for_source_id(&self, source_id: i64) -> StorageResult<u64>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_state(&self) -> StorageResult<SyncState>;
    async fn save_state(&self, state: &SyncState) -> StorageResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: i64,
    pub task: BatchTask,
}

/// Durable FIFO of pending batch tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push(&self, task: BatchTask) -> StorageResult<i64>;
    async fn front(&self) -> StorageResult<Option<QueuedTask>>;
    async fn replace(&self, id: i64, task: BatchTask) -> StorageResult<()>;
    async fn remove(&self, id: i64) -> StorageResult<()>;
    async fn is_empty(&self) -> StorageResult<bool>;

    /// Claim the single worker slot shared by every process draining this queue.
    ///
    /// Returns false when another holder already has it. The slot is released by
    /// [`TaskQueue::release_worker_lock`] or when the holder's connection ends.
    async fn try_acquire_worker_lock(&self) -> StorageResult<bool>;
    async fn release_worker_lock(&self) -> StorageResult<()>;
}

const STAGING_COLUMNS: &[(&str, &str)] = &[
    ("product_id", "TEXT"),
    ("variation_id", "TEXT"),
    ("order_id", "TEXT"),
    ("customer_id", "TEXT"),
    ("customer_email", "TEXT"),
];

const FINAL_COLUMNS: &[(&str, &str)] = &[
    ("id", "BIGSERIAL PRIMARY KEY"),
    ("product_id", "BIGINT NOT NULL DEFAULT 0"),
    ("variation_id", "BIGINT NOT NULL DEFAULT 0"),
    ("order_id", "BIGINT NOT NULL DEFAULT 0"),
    ("customer_id", "BIGINT NOT NULL DEFAULT 0"),
    ("customer_email", "TEXT NOT NULL DEFAULT ''"),
];

const QUEUE_COLUMNS: &[(&str, &str)] = &[
    ("id", "BIGSERIAL PRIMARY KEY"),
    ("payload", "JSONB NOT NULL"),
    ("created_at", "TIMESTAMPTZ NOT NULL DEFAULT NOW()"),
];

const STATE_COLUMNS: &[(&str, &str)] = &[
    ("name", "TEXT PRIMARY KEY"),
    ("value", "JSONB NOT NULL"),
    ("updated_at", "TIMESTAMPTZ NOT NULL DEFAULT NOW()"),
];

/// `CREATE TABLE IF NOT EXISTS` followed by one `ADD COLUMN IF NOT EXISTS` per declared column.
fn table_ddl(table: &str, columns: &[(&str, &str)]) -> Vec<String> {
    let definitions = columns
        .iter()
        .map(|(name, ty)| format!("{name} {ty}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut statements = vec![format!("CREATE TABLE IF NOT EXISTS {table} ({definitions})")];
    statements.extend(
        columns
            .iter()
            .map(|(name, ty)| format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {name} {ty}")),
    );
    statements
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    tables: TableNames,
    /// Session holding the worker advisory lock; advisory locks belong to a connection.
    worker_lock: Arc<Mutex<Option<PoolConnection<Postgres>>>>,
}

impl fmt::Debug for PgStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgStore")
            .field("tables", &self.tables)
            .finish_non_exhaustive()
    }
}

impl PgStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self {
            pool,
            tables,
            worker_lock: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn connect(database_url: &str, tables: TableNames) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, tables))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    fn schema_statements(&self) -> Vec<String> {
        let final_table = self.tables.final_table();
        let mut statements = Vec::new();
        statements.extend(table_ddl(&self.tables.staging_table(), STAGING_COLUMNS));
        statements.extend(table_ddl(&final_table, FINAL_COLUMNS));
        statements.push(format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {final_table}_purchase_key \
             ON {final_table} (product_id, variation_id, customer_id, customer_email, order_id)"
        ));
        for column in ["order_id", "variation_id", "customer_email"] {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {final_table}_{column} ON {final_table} ({column})"
            ));
        }
        statements.extend(table_ddl(&self.tables.queue_table(), QUEUE_COLUMNS));
        statements.extend(table_ddl(&self.tables.state_table(), STATE_COLUMNS));
        statements
    }
}

/// Page of source lines into staging, one row per line item.
///
/// Metadata is read through scalar subqueries so duplicated meta keys can never
/// multiply a line item and break offset pagination.
fn extraction_sql(tables: &TableNames, policy: MissingMetaPolicy) -> String {
    let staging = tables.staging_table();
    let items = tables.source("woocommerce_order_items");
    let itemmeta = tables.source("woocommerce_order_itemmeta");
    let posts = tables.source("posts");
    let postmeta = tables.source("postmeta");
    let required = match policy {
        MissingMetaPolicy::Strict => {
            "WHERE lines.product_id IS NOT NULL \
               AND lines.variation_id IS NOT NULL \
               AND lines.customer_id IS NOT NULL \
               AND lines.customer_email IS NOT NULL"
        }
        MissingMetaPolicy::Lenient => "",
    };
    format!(
        r#"
        INSERT INTO {staging} (product_id, variation_id, order_id, customer_id, customer_email)
        SELECT lines.product_id, lines.variation_id, lines.order_id, lines.customer_id, lines.customer_email
          FROM (
            SELECT items.order_item_id,
                   (SELECT MAX(m.meta_value) FROM {itemmeta} m
                     WHERE m.order_item_id = items.order_item_id AND m.meta_key = '_product_id') AS product_id,
                   (SELECT MAX(m.meta_value) FROM {itemmeta} m
                     WHERE m.order_item_id = items.order_item_id AND m.meta_key = '_variation_id') AS variation_id,
                   items.order_id::TEXT AS order_id,
                   (SELECT MAX(m.meta_value) FROM {postmeta} m
                     WHERE m.post_id = items.order_id AND m.meta_key = '_customer_user') AS customer_id,
                   (SELECT MAX(m.meta_value) FROM {postmeta} m
                     WHERE m.post_id = items.order_id AND m.meta_key = '_billing_email') AS customer_email
              FROM {items} items
              JOIN {posts} orders
                ON orders.id = items.order_id
               AND orders.post_type = 'shop_order'
             WHERE items.order_item_type = 'line_item'
          ) lines
         {required}
         ORDER BY lines.order_item_id
         LIMIT $1 OFFSET $2
        "#
    )
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl PurchaseStore for PgStore {
    async fn ensure_schema(&self) -> StorageResult<()> {
        for statement in self.schema_statements() {
            debug!(%statement, "applying schema statement");
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn truncate_staging(&self) -> StorageResult<()> {
        let sql = format!("TRUNCATE TABLE {}", self.tables.staging_table());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn stage_source_lines(
        &self,
        offset: u64,
        limit: u64,
        policy: MissingMetaPolicy,
    ) -> StorageResult<u64> {
        let sql = extraction_sql(&self.tables, policy);
        let result = sqlx::query(&sql)
            .bind(to_sql_count(limit))
            .bind(to_sql_count(offset))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn repair_staging_ids(&self, column: IdColumn) -> StorageResult<u64> {
        let column = column.column_name();
        let sql = format!(
            "UPDATE {staging} SET {column} = '0' \
             WHERE {column} IS NULL OR {column} !~ '^[0-9]{{1,18}}$'",
            staging = self.tables.staging_table(),
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn merge_staging(&self) -> StorageResult<u64> {
        let sql = format!(
            r#"
            INSERT INTO {final_table} (product_id, variation_id, order_id, customer_id, customer_email)
            SELECT CAST(product_id AS BIGINT),
                   CAST(variation_id AS BIGINT),
                   CAST(order_id AS BIGINT),
                   CAST(customer_id AS BIGINT),
                   LOWER(TRIM(COALESCE(customer_email, '')))
              FROM {staging}
            ON CONFLICT (product_id, variation_id, customer_id, customer_email, order_id) DO NOTHING
            "#,
            final_table = self.tables.final_table(),
            staging = self.tables.staging_table(),
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn account_email(&self, user_id: i64) -> StorageResult<Option<String>> {
        let sql = format!(
            "SELECT user_email FROM {} WHERE id = $1",
            self.tables.source("users")
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        let email = match row {
            Some(row) => row.try_get::<Option<String>, _>("user_email")?,
            None => None,
        };
        Ok(email.filter(|e| !e.trim().is_empty()))
    }

    async fn find_purchase(&self, filter: PurchaseFilter<'_>) -> StorageResult<bool> {
        let final_table = self.tables.final_table();
        let (join, status_clause) = match filter.paid_statuses {
            Some(_) => (
                format!(
                    "JOIN {} orders ON orders.id = purchases.order_id",
                    self.tables.source("posts")
                ),
                "AND orders.post_status = ANY($4)",
            ),
            None => (String::new(), ""),
        };
        let sql = format!(
            r#"
            SELECT 1 AS found
              FROM {final_table} purchases
              {join}
             WHERE (purchases.product_id = $1 OR purchases.variation_id = $1)
               AND (purchases.customer_email = ANY($2)
                    OR ($3 > 0 AND purchases.customer_id = $3))
               {status_clause}
             LIMIT 1
            "#
        );
        let mut query = sqlx::query(&sql)
            .bind(filter.product_id)
            .bind(filter.emails.to_vec())
            .bind(filter.user_id);
        if let Some(statuses) = filter.paid_statuses {
            query = query.bind(statuses.to_vec());
        }
        Ok(query.fetch_optional(&self.pool).await?.is_some())
    }

    async fn remove_entries_for_source_id(&self, source_id: i64) -> StorageResult<u64> {
        // 0 is the repaired "unknown" id and never names a source record
        if source_id <= 0 {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE product_id = $1 OR variation_id = $1 OR order_id = $1",
            self.tables.final_table()
        );
        let result = sqlx::query(&sql).bind(source_id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn load_state(&self) -> StorageResult<SyncState> {
        let sql = format!(
            "SELECT value FROM {} WHERE name = $1",
            self.tables.state_table()
        );
        let row = sqlx::query(&sql)
            .bind(SYNC_STATE_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let Json(state) = row.try_get::<Json<SyncState>, _>("value")?;
                Ok(state)
            }
            None => Ok(SyncState::default()),
        }
    }

    async fn save_state(&self, state: &SyncState) -> StorageResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (name, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
               SET value = EXCLUDED.value,
                   updated_at = NOW()
            "#,
            self.tables.state_table()
        );
        sqlx::query(&sql)
            .bind(SYNC_STATE_KEY)
            .bind(Json(state))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgStore {
    async fn push(&self, task: BatchTask) -> StorageResult<i64> {
        let sql = format!(
            "INSERT INTO {} (payload) VALUES ($1) RETURNING id",
            self.tables.queue_table()
        );
        let row = sqlx::query(&sql)
            .bind(Json(task))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn front(&self) -> StorageResult<Option<QueuedTask>> {
        let sql = format!(
            "SELECT id, payload FROM {} ORDER BY id LIMIT 1",
            self.tables.queue_table()
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let Json(task) = row.try_get::<Json<BatchTask>, _>("payload")?;
                Ok(Some(QueuedTask {
                    id: row.try_get("id")?,
                    task,
                }))
            }
            None => Ok(None),
        }
    }

    async fn replace(&self, id: i64, task: BatchTask) -> StorageResult<()> {
        let sql = format!(
            "UPDATE {} SET payload = $2 WHERE id = $1",
            self.tables.queue_table()
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(Json(task))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: i64) -> StorageResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.tables.queue_table());
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn is_empty(&self) -> StorageResult<bool> {
        let sql = format!(
            "SELECT NOT EXISTS (SELECT 1 FROM {}) AS empty",
            self.tables.queue_table()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get("empty")?)
    }

    async fn try_acquire_worker_lock(&self) -> StorageResult<bool> {
        let mut held = self.worker_lock.lock().await;
        if held.is_some() {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
            .bind(self.tables.staging_table())
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            debug!(staging = %self.tables.staging_table(), "worker lock acquired");
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release_worker_lock(&self) -> StorageResult<()> {
        let Some(mut conn) = self.worker_lock.lock().await.take() else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1)::bigint)")
            .bind(self.tables.staging_table())
            .execute(&mut *conn)
            .await?;
        debug!(staging = %self.tables.staging_table(), "worker lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_reject_empty_and_unsafe_names() {
        assert!(matches!(TableNames::new("wp_", ""), Err(StorageError::Config(_))));
        assert!(matches!(
            TableNames::new("wp_", "purchases; DROP TABLE users"),
            Err(StorageError::Config(_))
        ));
        assert!(matches!(TableNames::new("wp-", "purchases"), Err(StorageError::Config(_))));
        assert!(TableNames::new("", "purchases").is_ok());
    }

    #[test]
    fn table_names_derive_every_relation() {
        let tables = TableNames::new("wp_", "wc_customer_bought_product").unwrap();
        assert_eq!(tables.final_table(), "wp_wc_customer_bought_product");
        assert_eq!(tables.staging_table(), "wp_wc_customer_bought_product_staging");
        assert_eq!(tables.queue_table(), "wp_wc_customer_bought_product_queue");
        assert_eq!(tables.state_table(), "wp_wc_customer_bought_product_state");
        assert_eq!(tables.source("posts"), "wp_posts");
    }

    #[test]
    fn table_ddl_adds_every_declared_column() {
        let statements = table_ddl("t", &[("a", "TEXT"), ("b", "BIGINT NOT NULL DEFAULT 0")]);
        assert_eq!(statements[0], "CREATE TABLE IF NOT EXISTS t (a TEXT, b BIGINT NOT NULL DEFAULT 0)");
        assert_eq!(statements[1], "ALTER TABLE t ADD COLUMN IF NOT EXISTS a TEXT");
        assert_eq!(
            statements[2],
            "ALTER TABLE t ADD COLUMN IF NOT EXISTS b BIGINT NOT NULL DEFAULT 0"
        );
    }

    #[test]
    fn strict_extraction_requires_all_metadata() {
        let tables = TableNames::new("wp_", "cbp").unwrap();

        let strict = extraction_sql(&tables, MissingMetaPolicy::Strict);
        assert!(strict.contains("lines.customer_email IS NOT NULL"));
        assert!(strict.contains("ORDER BY lines.order_item_id"));

        let lenient = extraction_sql(&tables, MissingMetaPolicy::Lenient);
        assert!(!lenient.contains("IS NOT NULL"));
    }
}
