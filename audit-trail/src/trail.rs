//! 审计投递循环（AuditTrail）
//!
//! 统一编排“接收 → 直接发布 → 失败缓冲 → 周期回放”的长驻任务：
//! - 从有界通道接收事件并直接发布到 Broker，失败时写入缓冲存储；
//! - 缓冲存储已满时暂存该事件并停止读取通道，背压经由通道传递给生产者；
//! - 周期从缓冲存储读取批次，全部发布成功后才提交；
//! - 周期刷新存储指标；
//! - 提供关闭与等待的 `TrailHandle`。
//!
//! 投递语义为至少一次，且不保证顺序，下游需按事件 id 去重。
//!
use crate::broker::{BrokerConnector, ConnectionManager};
use crate::error::{AuditError, AuditResult};
use crate::event::AuditEvent;
use crate::metrics::TrailMetrics;
use crate::store::BackingStore;
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// AuditTrail：
/// - 独占 Broker 连接，按存活时间轮换
/// - 与其他组件共享 `BackingStore`
#[derive(Builder)]
pub struct AuditTrail {
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn BackingStore>,
    #[builder(into)]
    broker_uri: String,
    #[builder(into)]
    queue_name: String,
    metrics: TrailMetrics,
    #[builder(default)]
    config: AuditTrailConfig,
}

impl AuditTrail {
    /// 创建通道并启动循环，返回生产者句柄与运行句柄
    pub fn start(self) -> (AuditSender, TrailHandle) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = self.spawn(rx);
        (AuditSender { tx }, handle)
    }

    /// 在调用方提供的通道上启动循环
    pub fn spawn(self, rx: mpsc::Receiver<AuditEvent>) -> TrailHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(rx, token.clone()));
        TrailHandle {
            token,
            task: Some(task),
        }
    }

    /// 运行审计循环。
    ///
    /// 唯一的退出条件是 `token` 被取消；所有发送端被丢弃后循环不再读取通道，
    /// 但仍继续回放缓冲存储直至取消。
    ///
    /// 背压的余量：存储写满后，触发写满的那个事件暂存在循环内，通道还能再容纳
    /// `channel_capacity` 个事件，此后生产者的 `send` 才开始等待。
    /// 例如 `max_events = 3`、通道容量为 1 时，第 6 次提交才会阻塞。正在进行的发布、写入与回放会在取消时被放弃，
    /// 已接收但尚未写入存储的那一个事件可能因此丢失。
    pub async fn run(self, mut rx: mpsc::Receiver<AuditEvent>, token: CancellationToken) {
        let mut drain_ticker = ticker(self.config.drain_interval);
        let mut metrics_ticker = ticker(self.config.metrics_interval);
        let mut worker = Worker {
            connection: ConnectionManager::new(
                self.connector,
                self.broker_uri,
                self.queue_name,
                self.config.connection_max_age,
            ),
            store: self.store,
            metrics: self.metrics,
            parked: None,
            inbound_open: true,
        };
        tracing::debug!(queue = %worker.connection.queue(), "audit trail started");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = drain_ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = worker.drain(&mut rx) => {}
                    }
                }
                _ = metrics_ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = worker.refresh_metrics() => {}
                    }
                }
                received = rx.recv(), if worker.accepting() => {
                    let Some(event) = received else {
                        worker.inbound_open = false;
                        tracing::info!("all audit senders dropped, inbound channel closed");
                        continue;
                    };
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        _ = worker.handle_event(event) => {}
                    }
                }
            }
        }

        if let Some(event) = worker.parked.take() {
            tracing::warn!(event_id = %event.id(), "audit trail stopped with an unbuffered event");
        }
        worker.connection.disconnect().await;
        tracing::debug!("audit trail stopped");
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// 循环内部状态，只在循环任务中存在
struct Worker {
    connection: ConnectionManager,
    store: Arc<dyn BackingStore>,
    metrics: TrailMetrics,
    /// 存储已满时暂存的事件
    parked: Option<AuditEvent>,
    inbound_open: bool,
}

impl Worker {
    fn accepting(&self) -> bool {
        self.inbound_open && self.parked.is_none()
    }

    async fn handle_event(&mut self, event: AuditEvent) {
        match self.connection.publish(&event).await {
            Ok(()) => self.metrics.published.inc(),
            Err(err) => {
                self.metrics.publish_failures.inc();
                tracing::warn!(
                    event_id = %event.id(),
                    error = %err,
                    "failed to publish audit event, buffering"
                );
                self.buffer(event).await;
            }
        }
    }

    async fn buffer(&mut self, event: AuditEvent) {
        match self.store.write(&event).await {
            Ok(()) => self.metrics.buffered.inc(),
            Err(err) if err.is_store_full() => {
                tracing::warn!(
                    event_id = %event.id(),
                    error = %err,
                    "backing store full, pausing intake"
                );
                self.parked = Some(event);
                self.metrics.backpressure.set(1);
            }
            Err(err) => {
                self.metrics.dropped.inc();
                tracing::error!(
                    event_id = %event.id(),
                    error = %err,
                    "failed to buffer audit event, event dropped"
                );
            }
        }
    }

    /// 把通道中已排队的事件直接写入存储，不尝试发布
    async fn absorb_inbound(&mut self, rx: &mut mpsc::Receiver<AuditEvent>) {
        while self.accepting() {
            match rx.try_recv() {
                Ok(event) => self.buffer(event).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.inbound_open = false;
                    break;
                }
            }
        }
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<AuditEvent>) {
        let mut batches = 0usize;
        let mut events = 0usize;

        loop {
            self.absorb_inbound(rx).await;

            let batch = match self.store.read_batch().await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read buffered audit events");
                    break;
                }
            };

            let mut delivered = true;
            for event in batch.events() {
                if let Err(err) = self.connection.publish(event).await {
                    self.metrics.publish_failures.inc();
                    tracing::warn!(
                        event_id = %event.id(),
                        error = %err,
                        "failed to publish buffered audit event, drain aborted"
                    );
                    delivered = false;
                    break;
                }
            }
            if !delivered {
                break;
            }

            let count = batch.len();
            if let Err(err) = batch.commit().await {
                tracing::warn!(error = %err, "failed to commit drained audit events");
                break;
            }
            self.metrics.drained.inc_by(count as u64);
            batches += 1;
            events += count;
        }

        if batches == 0 {
            return;
        }
        tracing::info!(batches, events, "drained buffered audit events");

        self.metrics.backpressure.set(0);
        if let Some(event) = self.parked.take() {
            self.handle_event(event).await;
        }
    }

    async fn refresh_metrics(&mut self) {
        if let Err(err) = self.store.update_metrics().await {
            tracing::warn!(error = %err, "failed to update backing store metrics");
        }
    }
}

/// 审计循环配置
#[derive(Clone, Copy, Debug)]
pub struct AuditTrailConfig {
    /// 入站通道容量，满时 `AuditSender::send` 等待
    pub channel_capacity: usize,
    /// 缓冲回放间隔
    pub drain_interval: Duration,
    /// 存储指标刷新间隔
    pub metrics_interval: Duration,
    /// Broker 连接最大存活时间
    pub connection_max_age: Duration,
}

impl AuditTrailConfig {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 20;
}

impl Default for AuditTrailConfig {
    fn default() -> Self {
        Self {
            channel_capacity: Self::DEFAULT_CHANNEL_CAPACITY,
            drain_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(10),
            connection_max_age: Duration::from_secs(5 * 60),
        }
    }
}

/// 生产者句柄，可自由克隆
#[derive(Clone, Debug)]
pub struct AuditSender {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSender {
    /// 提交事件；通道已满时等待，循环停止后返回 `TrailClosed`
    pub async fn send(&self, event: AuditEvent) -> AuditResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AuditError::TrailClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 循环运行句柄：用于优雅关闭与等待任务结束
pub struct TrailHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TrailHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TrailHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
