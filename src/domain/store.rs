use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::services::error::{ErrorCode, ServiceError};

/// 文档主键字段
pub const ID_FIELD: &str = "id";

/// 存储错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document {id} not found in {collection}")]
    NotFound { collection: String, id: String },
    #[error("Document {id} already exists in {collection}")]
    Conflict { collection: String, id: String },
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound { .. } => ServiceError::not_found(message),
            StoreError::Conflict { .. } => ServiceError::domain("CONFLICT", message, 409),
            StoreError::InvalidDocument(_) => ServiceError::validation(message),
            StoreError::Unavailable(_) => {
                ServiceError::new(ErrorCode::ServiceUnavailable, message, 503)
            }
        }
    }
}

/// 文档存储接口：按字符串主键存取 JSON 对象
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// 按顶层字段相等过滤，空过滤条件返回整个集合
    async fn find_many(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Value>, StoreError>;

    /// 缺少 `id` 时自动生成，返回保存后的文档
    async fn create(&self, collection: &str, document: Value) -> Result<Value, StoreError>;

    /// 合并顶层字段，`id` 不可修改
    async fn update(&self, collection: &str, id: &str, changes: Value) -> Result<Value, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}

/// 进程内文档存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    collections: Arc<DashMap<String, BTreeMap<String, Value>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储离线，之后所有操作返回 [`StoreError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|documents| documents.len())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }
}

fn into_object(document: Value) -> Result<Map<String, Value>, StoreError> {
    match document {
        Value::Object(object) => Ok(object),
        other => Err(StoreError::InvalidDocument(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

fn matches_filter(document: &Value, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| document.get(field) == Some(expected))
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|documents| documents.get(id).cloned()))
    }

    async fn find_many(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
    ) -> Result<Vec<Value>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .collections
            .get(collection)
            .map(|documents| {
                documents
                    .values()
                    .filter(|document| matches_filter(document, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, collection: &str, document: Value) -> Result<Value, StoreError> {
        self.ensure_available()?;
        let mut object = into_object(document)?;
        let id = match object.get(ID_FIELD).cloned() {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::String(_)) | None => {
                let id = Uuid::new_v4().to_string();
                object.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
            Some(other) => {
                return Err(StoreError::InvalidDocument(format!(
                    "'{ID_FIELD}' must be a string, got {other}"
                )));
            }
        };

        let mut documents = self.collections.entry(collection.to_string()).or_default();
        if documents.contains_key(&id) {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                id,
            });
        }
        let document = Value::Object(object);
        documents.insert(id, document.clone());
        Ok(document)
    }

    async fn update(&self, collection: &str, id: &str, changes: Value) -> Result<Value, StoreError> {
        self.ensure_available()?;
        let changes = into_object(changes)?;
        let not_found = || StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };

        let mut documents = self.collections.get_mut(collection).ok_or_else(not_found)?;
        let document = documents.get_mut(id).ok_or_else(not_found)?;
        if let Value::Object(object) = document {
            for (field, value) in changes {
                if field != ID_FIELD {
                    object.insert(field, value);
                }
            }
        }
        Ok(document.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        Ok(self
            .collections
            .get_mut(collection)
            .is_some_and(|mut documents| documents.remove(id).is_some()))
    }
}
