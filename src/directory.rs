//! 用户目录查询与用户存储契约
//!
//! `UserStore` 是对底层文档存储的抽象：按键读取用户文档（字段表），
//! 以及对会话字段的部分合并写入（merge write，不整篇替换，
//! 避免覆盖其他子系统并发写入的无关字段）。
//!
//! `Directory` 在其上提供尽力而为的查询：任何底层失败（不存在、
//! 存储错误）都降级为默认值，绝不向调用方传播硬错误 ——
//! 缺一个显示名只是外观问题，不能让通知管道中止。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::event::pick_str;

/// 查不到显示名时的默认值
pub const DEFAULT_NAME: &str = "Someone";

/// 会话字段的部分合并写入
#[derive(Debug, Clone)]
pub struct SessionPatch {
    /// forceLogout 标志
    pub force_logout: Option<bool>,
    /// activeDeviceToken（空字符串表示清除）
    pub active_device_token: Option<String>,
    /// deviceInfo（任意 JSON 对象）
    pub device_info: Option<Value>,
    /// lastSessionUpdate 时间戳
    pub last_session_update: DateTime<Utc>,
}

impl SessionPatch {
    /// 转换为存储字段表（只包含出现的字段）
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(force_logout) = self.force_logout {
            fields.insert("forceLogout".to_string(), Value::Bool(force_logout));
        }
        if let Some(token) = &self.active_device_token {
            fields.insert(
                "activeDeviceToken".to_string(),
                Value::String(token.clone()),
            );
        }
        if let Some(info) = &self.device_info {
            fields.insert("deviceInfo".to_string(), info.clone());
        }
        fields.insert(
            "lastSessionUpdate".to_string(),
            Value::String(self.last_session_update.to_rfc3339()),
        );
        fields
    }
}

/// 用户文档存储契约
///
/// “文档不存在”是正常结果（Ok(None)），不是错误。
#[async_trait]
pub trait UserStore: Send + Sync {
    /// 按用户 ID 读取用户文档（字段表）
    async fn fetch_user(&self, user_id: &str) -> Result<Option<Value>>;

    /// 合并写入会话字段（部分更新，保留其他字段）
    async fn merge_session(&self, user_id: &str, patch: &SessionPatch) -> Result<()>;
}

/// 内存用户存储（测试和本地模式）
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, Value>>,
    /// 预设的 merge 失败计划（每次 merge 取出队首，true = 注入失败）
    merge_failure_plan: Mutex<Vec<bool>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            merge_failure_plan: Mutex::new(Vec::new()),
        }
    }

    /// 插入用户文档
    pub async fn insert_user(&self, user_id: impl Into<String>, doc: Value) {
        self.users.write().await.insert(user_id.into(), doc);
    }

    /// 设置 merge 失败计划（用于注入 Phase 1 / Phase 2 写失败）
    pub async fn set_merge_failure_plan(&self, plan: Vec<bool>) {
        *self.merge_failure_plan.lock().await = plan;
    }

    /// 读取用户文档快照
    pub async fn snapshot(&self, user_id: &str) -> Option<Value> {
        self.users.read().await.get(user_id).cloned()
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<Value>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn merge_session(&self, user_id: &str, patch: &SessionPatch) -> Result<()> {
        {
            let mut plan = self.merge_failure_plan.lock().await;
            if !plan.is_empty() && plan.remove(0) {
                return Err(anyhow!("injected merge failure"));
            }
        }

        let mut users = self.users.write().await;
        let doc = users
            .entry(user_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(existing) = doc {
            for (key, value) in patch.to_fields() {
                existing.insert(key, value);
            }
            Ok(())
        } else {
            Err(anyhow!("user document for {} is not an object", user_id))
        }
    }
}

/// HTTP 文档存储配置
#[derive(Debug, Clone)]
pub struct HttpUserStoreConfig {
    /// 文档 API 基础 URL（如 http://localhost:8089）
    pub base_url: String,
    /// Bearer token（认证用）
    pub auth_token: String,
    /// 请求超时（秒）
    pub timeout_secs: u64,
}

/// 基于 HTTP 文档 API 的用户存储
///
/// GET /users/{id} 读取文档（404 视为不存在），
/// PATCH /users/{id} 以部分字段体做合并写入。
pub struct HttpUserStore {
    client: reqwest::Client,
    config: HttpUserStoreConfig,
}

impl HttpUserStore {
    pub fn new(config: HttpUserStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn user_url(&self, user_id: &str) -> String {
        format!(
            "{}/users/{}",
            self.config.base_url.trim_end_matches('/'),
            user_id
        )
    }
}

#[async_trait]
impl UserStore for HttpUserStore {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<Value>> {
        let response = self
            .client
            .get(self.user_url(user_id))
            .bearer_auth(&self.config.auth_token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json().await?))
    }

    async fn merge_session(&self, user_id: &str, patch: &SessionPatch) -> Result<()> {
        let body = Value::Object(patch.to_fields());
        self.client
            .patch(self.user_url(user_id))
            .bearer_auth(&self.config.auth_token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// 用户目录（尽力而为的字段查询）
#[derive(Clone)]
pub struct Directory {
    store: Arc<dyn UserStore>,
}

impl Directory {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// 读取用户文档，任何失败都降级为 None 并记录日志
    async fn fetch(&self, user_id: &str) -> Option<Value> {
        match self.store.fetch_user(user_id).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "User lookup failed, degrading to default");
                None
            }
        }
    }

    /// 查询推送 token（查不到返回 None）
    pub async fn resolve_token(&self, user_id: &str) -> Option<String> {
        let doc = self.fetch(user_id).await?;
        pick_str(&doc, &["fcmToken"]).map(String::from)
    }

    /// 查询显示名（查不到返回 "Someone"）
    ///
    /// 字段漂移：`name` 优先于 `displayName`。
    pub async fn resolve_name(&self, user_id: &str) -> String {
        match self.fetch(user_id).await {
            Some(doc) => pick_str(&doc, &["name", "displayName"])
                .unwrap_or(DEFAULT_NAME)
                .to_string(),
            None => DEFAULT_NAME.to_string(),
        }
    }

    /// 查询头像 URL（`photoUrl` 优先于 `photoURL`）
    pub async fn resolve_photo(&self, user_id: &str) -> Option<String> {
        let doc = self.fetch(user_id).await?;
        pick_str(&doc, &["photoUrl", "photoURL"]).map(String::from)
    }
}
