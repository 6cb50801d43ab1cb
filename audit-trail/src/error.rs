//! 审计投递统一错误定义
//!
//! 聚焦配置、容量、传输与存储 I/O 等最小必要集合：
//! - `StoreFull` 是可判别的容量错误，仅用于触发背压，不视为告警；
//! - 其余存储/投递错误均为瞬时错误，由调用方记录并在下次调度时重试；
//! - 损坏记录不会以错误形式返回，而是在文件存储内部转入死信文件。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AuditError {
    // --- 配置 ---
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("unknown backing store type: {0}")]
    UnknownStoreType(String),

    // --- 容量 ---
    #[error("backing store full: current size {current} exceeds limit {limit}")]
    StoreFull { current: u64, limit: u64 },

    // --- 存储 ---
    #[error("io error: op={op}, reason={source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("database error: {reason}")]
    Database { reason: String },

    // --- 投递 ---
    #[error("broker error: {reason}")]
    Broker { reason: String },
    #[error("audit trail is no longer accepting events")]
    TrailClosed,

    // --- 观测 ---
    #[error("metrics error: {source}")]
    Metrics {
        #[from]
        source: prometheus::Error,
    },
}

/// 统一 Result 类型别名
pub type AuditResult<T> = Result<T, AuditError>;

impl AuditError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }

    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    /// 是否为容量已满；调用方据此施加背压而非重试
    pub fn is_store_full(&self) -> bool {
        matches!(self, Self::StoreFull { .. })
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for AuditError {
    fn from(err: sqlx::Error) -> Self {
        AuditError::Database {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_full_is_distinguishable() {
        let full = AuditError::StoreFull {
            current: 3,
            limit: 3,
        };
        assert!(full.is_store_full());
        assert_eq!(
            full.to_string(),
            "backing store full: current size 3 exceeds limit 3"
        );

        let io = AuditError::io("write", std::io::Error::other("disk gone"));
        assert!(!io.is_store_full());
        assert!(!AuditError::broker("down").is_store_full());
    }
}
