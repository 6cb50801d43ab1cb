//! 内存版缓冲存储（MemoryBackingStore）
//!
//! 适合没有持久卷的服务在 Broker 短暂不可用时做零配置缓冲：
//! - 以互斥锁保护的有序队列，容量上限为 `max_events`（默认 1000）；
//! - `read_batch` 返回当前全部事件的副本，提交时只移除这批事件，
//!   读取与提交之间新写入的事件会被保留；
//! - 进程重启即丢失数据。
//!
use super::{BackingStore, Batch};
use crate::error::{AuditError, AuditResult};
use crate::event::AuditEvent;
use crate::metrics::{StoreMetrics, StoreOp};
use async_trait::async_trait;
use prometheus::Registry;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    /// 最多缓冲的事件数（默认 1000）
    pub max_events: Option<usize>,
}

impl MemoryStoreConfig {
    pub const DEFAULT_MAX_EVENTS: usize = 1000;
}

pub struct MemoryBackingStore {
    max_events: usize,
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    metrics: StoreMetrics,
}

impl MemoryBackingStore {
    pub fn init(config: MemoryStoreConfig, registry: &Registry) -> AuditResult<Self> {
        let max_events = config
            .max_events
            .unwrap_or(MemoryStoreConfig::DEFAULT_MAX_EVENTS);
        if max_events == 0 {
            return Err(AuditError::invalid_config(
                "max_events must be greater than zero for memory backing store",
            ));
        }

        let metrics = StoreMetrics::register(
            registry,
            "Current number of events in the in-memory backing store.",
            false,
        )?;

        Ok(Self {
            max_events,
            events: Arc::new(Mutex::new(VecDeque::new())),
            metrics,
        })
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn write(&self, event: &AuditEvent) -> AuditResult<()> {
        let mut events = self.events.lock().await;
        if events.len() >= self.max_events {
            self.metrics.record_error(StoreOp::WriteFull);
            return Err(AuditError::StoreFull {
                current: events.len() as u64,
                limit: self.max_events as u64,
            });
        }

        events.push_back(event.clone());
        self.metrics.writes.inc();
        Ok(())
    }

    async fn read_batch(&self) -> AuditResult<Option<Batch>> {
        let events = self.events.lock().await;
        if events.is_empty() {
            return Ok(None);
        }

        let copied: Vec<AuditEvent> = events.iter().cloned().collect();
        let count = copied.len();
        let buffer = self.events.clone();
        self.metrics.reads.inc_by(count as u64);

        Ok(Some(Batch::new(copied, move || async move {
            let mut events = buffer.lock().await;
            let count = count.min(events.len());
            events.drain(..count);
            Ok(())
        })))
    }

    async fn update_metrics(&self) -> AuditResult<()> {
        let len = self.events.lock().await.len();
        self.metrics.size.set(len as i64);
        Ok(())
    }
}
