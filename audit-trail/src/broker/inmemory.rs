//! 内存版 Broker（InMemoryBroker）
//!
//! 基于 `tokio::sync::broadcast` 的轻量 Broker，实现 `BrokerConnector`：
//! - 发布成功的事件被记录下来，并广播给 `subscribe` 返回的事件流；
//! - `set_available(false)` 模拟故障：建立连接与发布均失败；
//! - `close_connections` 使所有已建立的连接失效，模拟 Broker 侧断开；
//! - 典型用途：测试环境、示例与本地开发。
//!
//! 注意：若无订阅者，广播会被忽略，但事件仍记录在 `published` 中。

use super::{BrokerConnection, BrokerConnector};
use crate::error::{AuditError, AuditResult};
use crate::event::AuditEvent;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

struct Shared {
    tx: broadcast::Sender<AuditEvent>,
    published: Mutex<Vec<AuditEvent>>,
    available: AtomicBool,
    connects: AtomicUsize,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Shared>,
}

impl InMemoryBroker {
    /// 创建一个内存 Broker，`capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Shared {
                tx,
                published: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// 已成功发布的事件（按发布顺序）
    pub fn published(&self) -> Vec<AuditEvent> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn published_ids(&self) -> Vec<String> {
        self.published()
            .iter()
            .map(|event| event.id().to_string())
            .collect()
    }

    /// 成功建立的连接总数
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn close_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// 返回一个 'static 生命周期的事件流，便于在 tokio::spawn 中使用
    pub fn subscribe(&self) -> BoxStream<'static, AuditResult<AuditEvent>> {
        let rx = self.inner.tx.subscribe();
        let stream = BroadcastStream::new(rx)
            .map(|r| r.map_err(|e| AuditError::broker(e.to_string())));
        Box::pin(stream)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, _uri: &str, queue: &str) -> AuditResult<Box<dyn BrokerConnection>> {
        if !self.is_available() {
            return Err(AuditError::broker("broker unavailable: connection refused"));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConnection {
            shared: self.inner.clone(),
            queue: queue.to_string(),
            generation: self.inner.generation.load(Ordering::SeqCst),
            connected_at: Instant::now(),
            closed: false,
        }))
    }
}

struct InMemoryConnection {
    shared: Arc<Shared>,
    queue: String,
    generation: u64,
    connected_at: Instant,
    closed: bool,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn publish_event(&mut self, event: &AuditEvent) -> AuditResult<()> {
        if self.is_closed() {
            return Err(AuditError::broker("connection closed"));
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            self.closed = true;
            return Err(AuditError::broker(format!(
                "broker unavailable: failed to publish to {}",
                self.queue
            )));
        }

        self.shared
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        // 若当前无订阅者，broadcast 的 send 会返回错误，这里视为非致命并忽略
        let _ = self.shared.tx.send(event.clone());
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed || self.generation != self.shared.generation.load(Ordering::SeqCst)
    }

    fn connected_at(&self) -> Instant {
        self.connected_at
    }
}
