//! 配置模块
//!
//! 读取优先级：
//! 1. 配置文件 `~/.config/supper-push/config.json`（JSON 格式）
//! 2. 环境变量 `SUPPER_PUSH_*`（逐字段覆盖文件值）
//! 3. 内置默认值

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 默认 FCM API 端点
pub const DEFAULT_FCM_ENDPOINT: &str = "https://fcm.googleapis.com";

/// 默认请求超时（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 默认两阶段接管等待间隔（毫秒）
pub const DEFAULT_GRACE_MS: u64 = 500;

/// 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// FCM API 端点
    pub fcm_endpoint: String,
    /// FCM 项目 ID
    pub fcm_project_id: String,
    /// FCM OAuth bearer token
    pub fcm_auth_token: String,
    /// 用户文档存储端点
    pub store_base_url: String,
    /// 用户文档存储 bearer token
    pub store_auth_token: String,
    /// 接管协议等待间隔（毫秒）
    pub grace_ms: u64,
    /// HTTP 请求超时（秒）
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fcm_endpoint: DEFAULT_FCM_ENDPOINT.to_string(),
            fcm_project_id: String::new(),
            fcm_auth_token: String::new(),
            store_base_url: String::new(),
            store_auth_token: String::new(),
            grace_ms: DEFAULT_GRACE_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl AppConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("supper-push")
            .join("config.json")
    }

    /// 从默认位置加载（文件不存在时用默认值），再套环境变量覆盖
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_path(&Self::default_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// 从指定文件加载（文件不存在时用默认值）
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// 环境变量覆盖（SUPPER_PUSH_*）
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SUPPER_PUSH_FCM_ENDPOINT") {
            self.fcm_endpoint = v;
        }
        if let Ok(v) = std::env::var("SUPPER_PUSH_FCM_PROJECT_ID") {
            self.fcm_project_id = v;
        }
        if let Ok(v) = std::env::var("SUPPER_PUSH_FCM_AUTH_TOKEN") {
            self.fcm_auth_token = v;
        }
        if let Ok(v) = std::env::var("SUPPER_PUSH_STORE_BASE_URL") {
            self.store_base_url = v;
        }
        if let Ok(v) = std::env::var("SUPPER_PUSH_STORE_AUTH_TOKEN") {
            self.store_auth_token = v;
        }
        if let Ok(v) = std::env::var("SUPPER_PUSH_GRACE_MS") {
            if let Ok(ms) = v.parse() {
                self.grace_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SUPPER_PUSH_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.timeout_secs = secs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_file_missing() {
        let config = AppConfig::load_from_path(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.fcm_endpoint, DEFAULT_FCM_ENDPOINT);
        assert_eq!(config.grace_ms, DEFAULT_GRACE_MS);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"fcm_project_id": "supper-prod", "grace_ms": 250}}"#
        )
        .unwrap();

        let config = AppConfig::load_from_path(file.path()).unwrap();
        // 指定的字段生效，缺省字段用默认值
        assert_eq!(config.fcm_project_id, "supper-prod");
        assert_eq!(config.grace_ms, 250);
        assert_eq!(config.fcm_endpoint, DEFAULT_FCM_ENDPOINT);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(AppConfig::load_from_path(file.path()).is_err());
    }
}
