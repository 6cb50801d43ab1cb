//! 审计事件（AuditEvent）
//!
//! 审计事件是不透明的结构化记录：除调用方分配的 `id` 外，其余字段任意。
//! 序列化为单个扁平 JSON 对象 `{"id": ..., <fields>}`，
//! 在通道、缓冲存储与 Broker 之间原样传递，创建后不再修改。
//!
use crate::error::AuditResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 事件标识符，应唯一（不强制），下游按此去重
    id: String,
    /// 业务字段，结构由调用方决定
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// 追加一个业务字段；`id` 由构造函数确定，同名字段会被忽略
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != "id" {
            self.fields.insert(key, value.into());
        }
        self
    }

    /// 从任意 JSON 对象构造事件，对象必须包含字符串类型的 `id`
    pub fn from_value(value: Value) -> AuditResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
