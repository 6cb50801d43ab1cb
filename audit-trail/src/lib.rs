//! 审计事件可靠投递库（audit-trail）
//!
//! 接收应用持续产生的审计事件，提交到消息 Broker，并在 Broker 不可用时进行持久缓冲，
//! 最终以“至少一次”语义送达，且内存占用有界、不会静默丢失事件：
//! - 事件（`event`）：携带调用方分配的 id 的任意 JSON 记录
//! - 缓冲存储（`store`）：内存、文件与 Postgres 三种实现，以及按配置装配的工厂
//! - Broker 连接（`broker`）：连接协议、按存活时间轮换的连接管理与内存实现
//! - 投递循环（`trail`）：直接发布、失败缓冲、周期回放与背压
//! - 指标（`metrics`）：注册到调用方显式传入的 Prometheus 注册表
//! - 配置（`config`）与入口（`auditor`）
//!
//! 典型用法：
//! 1. 通过 `AuditorSettings::from_env` 读取配置；
//! 2. 准备 `StoreContext`（指标注册表，可选的数据库连接池）与 `BrokerConnector`；
//! 3. `Auditor::start` 启动投递循环，使用 `Auditor::record` 或 `AuditSender` 提交事件；
//! 4. 退出前调用 `Auditor::shutdown`。
//!
pub mod auditor;
pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod store;
pub mod trail;

pub use auditor::Auditor;
pub use config::AuditorSettings;
pub use error::{AuditError, AuditResult};
pub use event::AuditEvent;
pub use trail::{AuditSender, AuditTrail, AuditTrailConfig, TrailHandle};
