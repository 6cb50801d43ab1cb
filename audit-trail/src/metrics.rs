//! 观测指标（metrics）
//!
//! 所有指标都注册到调用方显式传入的 `prometheus::Registry`，不存在全局默认注册表：
//! - `StoreMetrics`：缓冲存储的读写计数、按操作区分的错误计数与容量/文件数仪表；
//! - `TrailMetrics`：投递循环的发布、缓冲、丢弃与背压状态。
//!
//! 同名指标在同一注册表内只能注册一次，重复注册返回 `AuditError::Metrics`。
//!
use crate::error::AuditResult;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// 存储错误计数的 `operation` 标签取值
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    WriteStat,
    WriteFull,
    WriteOpen,
    WriteMarshal,
    WriteIo,
    WriteSync,
    WriteClose,
    WriteCount,
    WriteInsert,
    ReadOpen,
    ReadScan,
    ReadQuery,
    ReadUnmarshal,
    CorruptedEvent,
    DeadLetterWrite,
    DeadLetterWriteFailed,
    DeadLetterRewrite,
    CommitRemove,
    CommitDelete,
}

impl StoreOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOp::WriteStat => "write_stat",
            StoreOp::WriteFull => "write_full",
            StoreOp::WriteOpen => "write_open",
            StoreOp::WriteMarshal => "write_marshal",
            StoreOp::WriteIo => "write_io",
            StoreOp::WriteSync => "write_sync",
            StoreOp::WriteClose => "write_close",
            StoreOp::WriteCount => "write_count",
            StoreOp::WriteInsert => "write_insert",
            StoreOp::ReadOpen => "read_open",
            StoreOp::ReadScan => "read_scan",
            StoreOp::ReadQuery => "read_query",
            StoreOp::ReadUnmarshal => "read_unmarshal",
            StoreOp::CorruptedEvent => "corrupted_event",
            StoreOp::DeadLetterWrite => "deadletter_write",
            StoreOp::DeadLetterWriteFailed => "deadletter_write_failed",
            StoreOp::DeadLetterRewrite => "deadletter_rewrite",
            StoreOp::CommitRemove => "commit_remove",
            StoreOp::CommitDelete => "commit_delete",
        }
    }
}

/// 缓冲存储指标
#[derive(Clone, Debug)]
pub struct StoreMetrics {
    pub(crate) writes: IntCounter,
    pub(crate) reads: IntCounter,
    pub(crate) errors: IntCounterVec,
    pub(crate) size: IntGauge,
    pub(crate) files: Option<IntGauge>,
}

impl StoreMetrics {
    /// 注册存储指标；`size_help` 说明容量单位（字节或事件数），
    /// `with_file_gauge` 仅文件存储开启
    pub fn register(
        registry: &Registry,
        size_help: &str,
        with_file_gauge: bool,
    ) -> AuditResult<Self> {
        let writes = IntCounter::new(
            "audit_backing_store_writes_total",
            "Total number of audit events written to the backing store.",
        )?;
        let reads = IntCounter::new(
            "audit_backing_store_reads_total",
            "Total number of audit events read from the backing store.",
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "audit_backing_store_errors_total",
                "Total number of errors encountered by the backing store.",
            ),
            &["operation"],
        )?;
        let size = IntGauge::new("audit_backing_store_size", size_help)?;

        registry.register(Box::new(writes.clone()))?;
        registry.register(Box::new(reads.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(size.clone()))?;

        let files = if with_file_gauge {
            let files = IntGauge::new(
                "audit_backing_store_files",
                "Current number of files in the backing store.",
            )?;
            registry.register(Box::new(files.clone()))?;
            Some(files)
        } else {
            None
        };

        Ok(Self {
            writes,
            reads,
            errors,
            size,
            files,
        })
    }

    pub(crate) fn record_error(&self, op: StoreOp) {
        self.errors.with_label_values(&[op.as_str()]).inc();
    }

    #[cfg(test)]
    pub(crate) fn error_count(&self, op: StoreOp) -> u64 {
        self.errors.with_label_values(&[op.as_str()]).get()
    }
}

/// 投递循环指标
#[derive(Clone, Debug)]
pub struct TrailMetrics {
    pub(crate) published: IntCounter,
    pub(crate) publish_failures: IntCounter,
    pub(crate) buffered: IntCounter,
    pub(crate) dropped: IntCounter,
    pub(crate) drained: IntCounter,
    pub(crate) backpressure: IntGauge,
}

impl TrailMetrics {
    pub fn register(registry: &Registry) -> AuditResult<Self> {
        let published = IntCounter::new(
            "audit_trail_published_total",
            "Total number of audit events published to the broker.",
        )?;
        let publish_failures = IntCounter::new(
            "audit_trail_publish_failures_total",
            "Total number of failed attempts to publish an audit event.",
        )?;
        let buffered = IntCounter::new(
            "audit_trail_buffered_total",
            "Total number of audit events written to the backing store after a failed publish.",
        )?;
        let dropped = IntCounter::new(
            "audit_trail_dropped_total",
            "Total number of audit events lost because the backing store rejected them.",
        )?;
        let drained = IntCounter::new(
            "audit_trail_drained_total",
            "Total number of buffered audit events delivered and committed.",
        )?;
        let backpressure = IntGauge::new(
            "audit_trail_backpressure",
            "1 while intake is paused because the backing store is full.",
        )?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(buffered.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(drained.clone()))?;
        registry.register(Box::new(backpressure.clone()))?;

        Ok(Self {
            published,
            publish_failures,
            buffered,
            dropped,
            drained,
            backpressure,
        })
    }

    pub fn published(&self) -> u64 {
        self.published.get()
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.get()
    }

    pub fn buffered(&self) -> u64 {
        self.buffered.get()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }

    pub fn drained(&self) -> u64 {
        self.drained.get()
    }

    pub fn backpressure_active(&self) -> bool {
        self.backpressure.get() != 0
    }
}
