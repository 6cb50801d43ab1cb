//! 缓冲存储（BackingStore）
//!
//! Broker 不可用时用于暂存审计事件的持久化 FIFO 容器：
//! - `write`：追加事件，达到容量上限时返回可判别的 `AuditError::StoreFull`；
//! - `read_batch`：返回最早的一批事件及一次性的提交令牌 `Batch`，
//!   只有 `Batch::commit` 才会真正移除事件（至少一次语义，可能重复）；
//! - `update_metrics`：低开销的周期性指标刷新；
//! - `close`：释放资源，但从不关闭由调用方注入的共享资源（如数据库连接池）。
//!
//! 内置实现：内存（`memory`）、文件（`file`）与 Postgres（`sql`），
//! 通过 `factory` 按配置中的类型字符串装配，并支持注册自定义实现。
//!
mod factory;
mod file;
mod memory;
#[cfg(feature = "postgres")]
mod sql;

pub use factory::{
    BackingStoreFactories, BackingStoreFactory, StoreConfig, StoreContext, StoreSpec,
};
pub use file::{FileBackingStore, FileStoreConfig};
pub use memory::{MemoryBackingStore, MemoryStoreConfig};
#[cfg(feature = "postgres")]
pub use sql::{SqlBackingStore, SqlStoreConfig, is_valid_sql_identifier};

use crate::{error::AuditResult, event::AuditEvent};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::fmt;
use std::future::Future;

type CommitFn = Box<dyn FnOnce() -> BoxFuture<'static, AuditResult<()>> + Send + Sync>;

/// 一批待投递事件及其一次性提交令牌
///
/// 提交前不得再次调用 `read_batch`；丢弃未提交的批次等价于放弃本次读取，
/// 这些事件会在下一次 `read_batch` 中再次出现。
pub struct Batch {
    events: Vec<AuditEvent>,
    commit: CommitFn,
}

impl Batch {
    pub fn new<F, Fut>(events: Vec<AuditEvent>, commit: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AuditResult<()>> + Send + 'static,
    {
        Self {
            events,
            commit: Box::new(move || Box::pin(commit())),
        }
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// 确认本批事件已投递，从存储中永久移除
    pub async fn commit(self) -> AuditResult<()> {
        (self.commit)().await
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// 缓冲存储协议
///
/// 实现必须支持来自多个任务的并发 `write` 与 `read_batch`。
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// 持久化一个事件
    async fn write(&self, event: &AuditEvent) -> AuditResult<()>;

    /// 读取最早的一批事件；存储为空时返回 `Ok(None)`
    async fn read_batch(&self) -> AuditResult<Option<Batch>>;

    /// 刷新容量类指标，需足够廉价以支持每隔数秒调用
    async fn update_metrics(&self) -> AuditResult<()>;

    /// 释放资源
    async fn close(&self) -> AuditResult<()> {
        Ok(())
    }
}
