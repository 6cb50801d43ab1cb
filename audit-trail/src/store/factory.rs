//! 缓冲存储装配（factory）
//!
//! 将 `{"type": ..., "params": {...}}` 形式的 JSON 配置解析为具体的 `BackingStore`：
//! - 内置类型 `memory` / `file` / `sql` 是封闭的 `StoreConfig` 枚举；
//! - `BackingStoreFactories` 允许调用方按类型名注册自定义构造器，
//!   同名注册优先于内置类型；
//! - `StoreContext` 显式携带指标注册表与（可选的）共享数据库连接池，
//!   不存在任何全局默认值。
//!
use super::{BackingStore, FileBackingStore, FileStoreConfig, MemoryBackingStore, MemoryStoreConfig};
#[cfg(feature = "postgres")]
use super::{SqlBackingStore, SqlStoreConfig};
use crate::error::{AuditError, AuditResult};
use futures_util::future::BoxFuture;
use prometheus::Registry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// 缓冲存储的原始配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

impl StoreSpec {
    pub fn new(kind: impl Into<String>, params: Value) -> Self {
        Self {
            kind: kind.into(),
            params,
        }
    }

    pub fn parse(json: &str) -> AuditResult<Self> {
        serde_json::from_str(json).map_err(|err| {
            AuditError::invalid_config(format!("failed to parse backing store config: {err}"))
        })
    }
}

impl Default for StoreSpec {
    fn default() -> Self {
        Self::new("memory", Value::Null)
    }
}

/// 构造存储时注入的依赖
#[derive(Clone)]
pub struct StoreContext {
    registry: Registry,
    #[cfg(feature = "postgres")]
    pool: Option<sqlx::PgPool>,
}

impl StoreContext {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            #[cfg(feature = "postgres")]
            pool: None,
        }
    }

    /// 注入宿主应用的连接池；存储只借用，不负责关闭
    #[cfg(feature = "postgres")]
    pub fn with_pool(mut self, pool: sqlx::PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[cfg(feature = "postgres")]
    pub fn pool(&self) -> Option<&sqlx::PgPool> {
        self.pool.as_ref()
    }
}

impl fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreContext").finish_non_exhaustive()
    }
}

/// 内置缓冲存储类型
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory(MemoryStoreConfig),
    File(FileStoreConfig),
    #[cfg(feature = "postgres")]
    Sql(SqlStoreConfig),
}

impl StoreConfig {
    pub fn from_spec(spec: &StoreSpec) -> AuditResult<Self> {
        match spec.kind.as_str() {
            "memory" => Ok(Self::Memory(parse_params("memory", &spec.params)?)),
            "file" => Ok(Self::File(parse_params("file", &spec.params)?)),
            #[cfg(feature = "postgres")]
            "sql" => Ok(Self::Sql(parse_params("sql", &spec.params)?)),
            other => Err(AuditError::UnknownStoreType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::File(_) => "file",
            #[cfg(feature = "postgres")]
            Self::Sql(_) => "sql",
        }
    }

    pub async fn build(self, ctx: &StoreContext) -> AuditResult<Arc<dyn BackingStore>> {
        let store: Arc<dyn BackingStore> = match self {
            Self::Memory(config) => Arc::new(MemoryBackingStore::init(config, ctx.registry())?),
            Self::File(config) => Arc::new(FileBackingStore::init(config, ctx.registry()).await?),
            #[cfg(feature = "postgres")]
            Self::Sql(config) => {
                let pool = ctx.pool().cloned().ok_or_else(|| {
                    AuditError::invalid_config(
                        "database pool is required for sql backing store",
                    )
                })?;
                Arc::new(SqlBackingStore::init(config, pool, ctx.registry()).await?)
            }
        };
        Ok(store)
    }
}

fn parse_params<T>(kind: &str, params: &Value) -> AuditResult<T>
where
    T: DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).map_err(|err| {
        AuditError::invalid_config(format!("failed to parse {kind} backing store config: {err}"))
    })
}

/// 自定义缓冲存储构造器
pub type BackingStoreFactory = Arc<
    dyn Fn(Value, StoreContext) -> BoxFuture<'static, AuditResult<Arc<dyn BackingStore>>>
        + Send
        + Sync,
>;

/// 类型名到构造器的注册表
#[derive(Clone, Default)]
pub struct BackingStoreFactories {
    custom: HashMap<String, BackingStoreFactory>,
}

impl BackingStoreFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Value, StoreContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AuditResult<Arc<dyn BackingStore>>> + Send + 'static,
    {
        let factory: BackingStoreFactory =
            Arc::new(move |params, ctx| Box::pin(factory(params, ctx)));
        self.custom.insert(kind.into(), factory);
        self
    }

    pub async fn build(
        &self,
        spec: &StoreSpec,
        ctx: &StoreContext,
    ) -> AuditResult<Arc<dyn BackingStore>> {
        if let Some(factory) = self.custom.get(&spec.kind) {
            return factory(spec.params.clone(), ctx.clone()).await;
        }
        StoreConfig::from_spec(spec)?.build(ctx).await
    }
}

impl fmt::Debug for BackingStoreFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.custom.keys().collect();
        kinds.sort();
        f.debug_struct("BackingStoreFactories")
            .field("custom", &kinds)
            .finish()
    }
}
