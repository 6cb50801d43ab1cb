//! Broker 连接管理
//!
//! 审计循环只需要“发布一条记录，得到成功或失败”，因此 Broker 被抽象为两层协议：
//! - `BrokerConnector`：按 URI 与队列名建立连接；
//! - `BrokerConnection`：单条发布、断开、是否已关闭以及建立时间；
//! - `ConnectionManager`：由审计循环独占，在每次发布前检查连接，
//!   缺失、已关闭或超过最大存活时间时断开并重连；发布失败后丢弃当前连接，
//!   下次发布自动重连。
//!
mod inmemory;

pub use inmemory::InMemoryBroker;

use crate::error::{AuditError, AuditResult};
use crate::event::AuditEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 一条已建立的 Broker 连接
#[async_trait]
pub trait BrokerConnection: Send {
    /// 发布单个事件
    async fn publish_event(&mut self, event: &AuditEvent) -> AuditResult<()>;

    async fn disconnect(&mut self);

    fn is_closed(&self) -> bool;

    /// 连接建立的时刻，用于按存活时间轮换
    fn connected_at(&self) -> Instant;
}

/// 连接工厂
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, uri: &str, queue: &str) -> AuditResult<Box<dyn BrokerConnection>>;
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    uri: String,
    queue: String,
    max_age: Duration,
    connection: Option<Box<dyn BrokerConnection>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        uri: impl Into<String>,
        queue: impl Into<String>,
        max_age: Duration,
    ) -> Self {
        Self {
            connector,
            uri: uri.into(),
            queue: queue.into(),
            max_age,
            connection: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|conn| !conn.is_closed())
    }

    /// 发布单个事件，必要时先重建连接
    pub async fn publish(&mut self, event: &AuditEvent) -> AuditResult<()> {
        self.refresh().await?;
        let Some(conn) = self.connection.as_mut() else {
            return Err(AuditError::broker("no broker connection"));
        };

        match conn.publish_event(event).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.disconnect().await;
                Err(err)
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.disconnect().await;
        }
    }

    async fn refresh(&mut self) -> AuditResult<()> {
        let stale = match &self.connection {
            None => true,
            Some(conn) => conn.is_closed() || conn.connected_at().elapsed() >= self.max_age,
        };
        if !stale {
            return Ok(());
        }

        self.disconnect().await;
        let conn = self
            .connector
            .connect(&self.uri, &self.queue)
            .await
            .inspect_err(|err| {
                tracing::warn!(queue = %self.queue, error = %err, "failed to connect to broker");
            })?;
        tracing::debug!(queue = %self.queue, "broker connection established");
        self.connection = Some(conn);
        Ok(())
    }
}
