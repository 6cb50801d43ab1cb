//! Postgres 版缓冲存储（SqlBackingStore）
//!
//! 适合已有数据库连接、不希望管理文件卷的服务：
//! - 事件作为表行存储：`id BIGSERIAL` 主键、`event_data JSONB`、`created_at TIMESTAMPTZ`，
//!   并在 `(created_at, id)` 上建索引以支持按序扫描；
//! - 连接池由宿主应用注入，本存储从不创建也从不关闭连接池；
//! - 表名来自配置，无法参数化绑定，因此在拼接任何 SQL 之前必须通过标识符校验；
//! - 写入前先做行数检查，多写者并发时上限是软约束；
//! - 无法解析的行在读取时移入 `<表名>_deadletter` 并从主表删除，
//!   不再占用容量，也不会挡住其后的有效事件。
//!
//! 表结构（`skip_migration` 为 false 时自动创建）：
//!
//! ```sql
//! CREATE TABLE audit_events (
//!     id BIGSERIAL PRIMARY KEY,
//!     event_data JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX ON audit_events (created_at, id);
//! CREATE TABLE audit_events_deadletter (
//!     id BIGSERIAL PRIMARY KEY,
//!     source_id BIGINT NOT NULL,
//!     event_data JSONB NOT NULL,
//!     error TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
use super::{BackingStore, Batch};
use crate::error::{AuditError, AuditResult};
use crate::event::AuditEvent;
use crate::metrics::{StoreMetrics, StoreOp};
use async_trait::async_trait;
use prometheus::Registry;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use std::sync::LazyLock;

static SQL_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("SQL identifier pattern must compile")
});

/// 校验配置来源的 SQL 标识符：字母或下划线开头，后接字母、数字或下划线
pub fn is_valid_sql_identifier(name: &str) -> bool {
    SQL_IDENTIFIER.is_match(name)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SqlStoreConfig {
    /// 表名（默认 "audit_events"）
    pub table_name: Option<String>,
    /// 每批读取的事件数（默认 100）
    pub batch_size: Option<u32>,
    /// 最多缓冲的事件数（默认 10000）
    pub max_events: Option<u64>,
    /// 跳过自动建表（默认 false）
    pub skip_migration: Option<bool>,
}

impl SqlStoreConfig {
    pub const DEFAULT_TABLE_NAME: &'static str = "audit_events";
    pub const DEFAULT_BATCH_SIZE: u32 = 100;
    pub const DEFAULT_MAX_EVENTS: u64 = 10_000;
}

/// 在表名校验通过后一次性构造的语句
#[derive(Debug, Clone)]
struct Statements {
    create_table: String,
    create_index: String,
    create_dead_letter: String,
    insert: String,
    select_batch: String,
    delete: String,
    move_to_dead_letter: String,
    count: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGSERIAL PRIMARY KEY, \
                 event_data JSONB NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {table}_created_at_id_idx ON {table} (created_at, id)"
            ),
            create_dead_letter: format!(
                "CREATE TABLE IF NOT EXISTS {table}_deadletter (\
                 id BIGSERIAL PRIMARY KEY, \
                 source_id BIGINT NOT NULL, \
                 event_data JSONB NOT NULL, \
                 error TEXT NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW())"
            ),
            insert: format!("INSERT INTO {table} (event_data) VALUES ($1)"),
            select_batch: format!(
                "SELECT id, event_data FROM {table} \
                 WHERE NOT (id = ANY($2)) \
                 ORDER BY created_at ASC, id ASC LIMIT $1"
            ),
            delete: format!("DELETE FROM {table} WHERE id = ANY($1)"),
            move_to_dead_letter: format!(
                "WITH moved AS (DELETE FROM {table} WHERE id = $1 RETURNING id, event_data) \
                 INSERT INTO {table}_deadletter (source_id, event_data, error) \
                 SELECT id, event_data, $2 FROM moved"
            ),
            count: format!("SELECT COUNT(*) FROM {table}"),
        }
    }
}

pub struct SqlBackingStore {
    pool: PgPool,
    table_name: String,
    batch_size: i64,
    max_events: u64,
    statements: Statements,
    metrics: StoreMetrics,
}

impl SqlBackingStore {
    pub async fn init(
        config: SqlStoreConfig,
        pool: PgPool,
        registry: &Registry,
    ) -> AuditResult<Self> {
        let table_name = config
            .table_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| SqlStoreConfig::DEFAULT_TABLE_NAME.to_string());
        if !is_valid_sql_identifier(&table_name) {
            return Err(AuditError::invalid_config(format!(
                "invalid table name: {table_name:?}"
            )));
        }

        let batch_size = config
            .batch_size
            .unwrap_or(SqlStoreConfig::DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(AuditError::invalid_config(
                "batch_size must be greater than zero for sql backing store",
            ));
        }
        let max_events = config
            .max_events
            .unwrap_or(SqlStoreConfig::DEFAULT_MAX_EVENTS);
        if max_events == 0 {
            return Err(AuditError::invalid_config(
                "max_events must be greater than zero for sql backing store",
            ));
        }

        let statements = Statements::for_table(&table_name);
        if !config.skip_migration.unwrap_or(false) {
            sqlx::query(&statements.create_table)
                .execute(&pool)
                .await?;
            sqlx::query(&statements.create_index)
                .execute(&pool)
                .await?;
            sqlx::query(&statements.create_dead_letter)
                .execute(&pool)
                .await?;
            tracing::debug!(table = %table_name, "sql backing store table ensured");
        }

        let metrics = StoreMetrics::register(
            registry,
            "Current number of events in the SQL backing store.",
            false,
        )?;

        Ok(Self {
            pool,
            table_name,
            batch_size: i64::from(batch_size),
            max_events,
            statements,
            metrics,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub async fn count_events(&self) -> AuditResult<u64> {
        let count: i64 = sqlx::query_scalar(&self.statements.count)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// 将无法解析的行移入死信表；失败时返回 false，调用方需在本次读取中跳过该行
    async fn dead_letter_row(&self, id: i64, error: &str) -> bool {
        match sqlx::query(&self.statements.move_to_dead_letter)
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
        {
            Ok(_) => {
                self.metrics.record_error(StoreOp::DeadLetterWrite);
                tracing::warn!(
                    table = %self.table_name,
                    row_id = id,
                    "undecodable audit event moved to dead-letter table"
                );
                true
            }
            Err(err) => {
                self.metrics.record_error(StoreOp::DeadLetterWriteFailed);
                tracing::error!(
                    table = %self.table_name,
                    row_id = id,
                    error = %err,
                    "failed to move undecodable audit event to dead-letter table"
                );
                false
            }
        }
    }
}

#[async_trait]
impl BackingStore for SqlBackingStore {
    async fn write(&self, event: &AuditEvent) -> AuditResult<()> {
        let current = self.count_events().await.inspect_err(|_| {
            self.metrics.record_error(StoreOp::WriteCount);
        })?;
        if current >= self.max_events {
            self.metrics.record_error(StoreOp::WriteFull);
            return Err(AuditError::StoreFull {
                current,
                limit: self.max_events,
            });
        }

        let event_data = serde_json::to_value(event).map_err(|err| {
            self.metrics.record_error(StoreOp::WriteMarshal);
            AuditError::from(err)
        })?;

        sqlx::query(&self.statements.insert)
            .bind(event_data)
            .execute(&self.pool)
            .await
            .map_err(|err| {
                self.metrics.record_error(StoreOp::WriteInsert);
                AuditError::from(err)
            })?;

        self.metrics.writes.inc();
        Ok(())
    }

    async fn read_batch(&self) -> AuditResult<Option<Batch>> {
        // 本次读取中未能移入死信表的行
        let mut skipped: Vec<i64> = Vec::new();

        let (events, ids) = loop {
            let rows: Vec<(i64, Value)> = sqlx::query_as(&self.statements.select_batch)
                .bind(self.batch_size)
                .bind(skipped.as_slice())
                .fetch_all(&self.pool)
                .await
                .map_err(|err| {
                    self.metrics.record_error(StoreOp::ReadQuery);
                    AuditError::from(err)
                })?;
            if rows.is_empty() {
                return Ok(None);
            }

            let mut events = Vec::with_capacity(rows.len());
            let mut ids = Vec::with_capacity(rows.len());
            for (id, event_data) in rows {
                match serde_json::from_value::<AuditEvent>(event_data) {
                    Ok(event) => {
                        events.push(event);
                        ids.push(id);
                    }
                    Err(err) => {
                        self.metrics.record_error(StoreOp::ReadUnmarshal);
                        let error = format!("failed to unmarshal event: {err}");
                        if !self.dead_letter_row(id, &error).await {
                            skipped.push(id);
                        }
                    }
                }
            }

            if !events.is_empty() {
                break (events, ids);
            }
        };

        self.metrics.reads.inc_by(events.len() as u64);
        let pool = self.pool.clone();
        let delete = self.statements.delete.clone();
        let metrics = self.metrics.clone();
        Ok(Some(Batch::new(events, move || async move {
            sqlx::query(&delete)
                .bind(ids)
                .execute(&pool)
                .await
                .map_err(|err| {
                    metrics.record_error(StoreOp::CommitDelete);
                    AuditError::from(err)
                })?;
            Ok(())
        })))
    }

    async fn update_metrics(&self) -> AuditResult<()> {
        let count = self.count_events().await?;
        self.metrics.size.set(count as i64);
        Ok(())
    }

    /// 连接池归宿主应用所有，这里不关闭
    async fn close(&self) -> AuditResult<()> {
        Ok(())
    }
}
