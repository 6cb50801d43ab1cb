//! 审计入口（Auditor）
//!
//! 将配置、存储装配与投递循环串联起来：
//! 1. 通过 `BackingStoreFactories` 按 `AuditorSettings::backing_store` 构造缓冲存储；
//! 2. 在 `StoreContext` 携带的注册表上注册循环指标；
//! 3. 启动 `AuditTrail`，对外暴露 `AuditSender`；
//! 4. `shutdown` 取消循环、等待退出并关闭存储。
//!
use crate::broker::BrokerConnector;
use crate::config::AuditorSettings;
use crate::error::AuditResult;
use crate::event::AuditEvent;
use crate::metrics::TrailMetrics;
use crate::store::{BackingStore, BackingStoreFactories, StoreContext};
use crate::trail::{AuditSender, AuditTrail, TrailHandle};
use std::sync::Arc;

pub struct Auditor {
    sender: AuditSender,
    handle: TrailHandle,
    store: Arc<dyn BackingStore>,
    metrics: TrailMetrics,
}

impl Auditor {
    pub async fn start(
        settings: AuditorSettings,
        connector: Arc<dyn BrokerConnector>,
        ctx: &StoreContext,
        factories: &BackingStoreFactories,
    ) -> AuditResult<Self> {
        let store = factories.build(&settings.backing_store, ctx).await?;
        let metrics = TrailMetrics::register(ctx.registry())?;

        let (sender, handle) = AuditTrail::builder()
            .connector(connector)
            .store(store.clone())
            .broker_uri(settings.broker_uri)
            .queue_name(settings.queue_name.clone())
            .metrics(metrics.clone())
            .config(settings.trail)
            .build()
            .start();

        tracing::info!(
            queue = %settings.queue_name,
            backing_store = %settings.backing_store.kind,
            "auditor started"
        );

        Ok(Self {
            sender,
            handle,
            store,
            metrics,
        })
    }

    pub fn sender(&self) -> AuditSender {
        self.sender.clone()
    }

    pub fn metrics(&self) -> &TrailMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// 提交事件；通道已满时等待
    pub async fn record(&self, event: AuditEvent) -> AuditResult<()> {
        self.sender.send(event).await
    }

    /// 停止循环并关闭存储；已缓冲但未回放的事件保留在存储中
    pub async fn shutdown(self) -> AuditResult<()> {
        let Self { handle, store, .. } = self;
        handle.shutdown();
        handle.join().await;
        store.close().await
    }
}
