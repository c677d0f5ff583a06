//! 会话仲裁器 - 单活跃设备的两阶段接管协议
//!
//! 新设备登录（device N）必须终止同一账号在其他设备（device M）上的
//! 会话，且不能丢失发给慢轮询旧设备的登出信号。没有中心会话服务器，
//! 只有共享的每用户记录，协议是严格的两步状态迁移，绝不跳步：
//!
//! `Idle` → `LogoutSignaled`（forceLogout=true，token 清空）
//!        → `NewDeviceActive`（forceLogout=false，token=新设备）
//!
//! 1. Phase 1（signal）：合并写入 forceLogout=true + activeDeviceToken=""，
//!    借共享状态广播：其他设备的会话监听观察到 forceLogout=true 后自行退出。
//! 2. 固定等待约 500ms：共享状态的传播相对并发重连的旧设备不是瞬时的，
//!    不等待的话 Phase 2 可能在旧设备看到信号之前把 forceLogout 写回
//!    false，登出就丢了。这是拿延迟换正确性的权衡，不是实现细节。
//! 3. Phase 2（claim）：写入新 token + deviceInfo，清 forceLogout。
//!    Phase 2 完成后新设备才算权威。
//!
//! 失败语义：Phase 1 失败则整个 claim 失败，不尝试 Phase 2；
//! Phase 2 在 Phase 1 之后失败则账号停在 LogoutSignaled（无任何活跃
//! 设备），这是更安全的失败态，错误上报给新设备，由它整体重试。
//!
//! 同一用户两个新设备并发 claim 不做串行化，结果是后写者赢 ——
//! 已知且接受的限制，不是单胜者协议。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::directory::{SessionPatch, UserStore};

/// Phase 1 和 Phase 2 之间的等待间隔
pub const GRACE_INTERVAL: Duration = Duration::from_millis(500);

/// 调用方身份（由外层认证层提供）
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// 已认证的用户 ID（None = 未认证）
    pub uid: Option<String>,
}

impl AuthContext {
    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { uid: None }
    }
}

/// 设备会话接管请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaim {
    /// 目标用户
    pub user_id: String,
    /// 新设备的本地 token
    pub local_token: String,
    /// 设备信息（任意对象，可选）
    pub device_info: Option<Value>,
}

/// claim 成功响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub success: bool,
    pub message: String,
}

/// 失败发生在哪个阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    /// Phase 1：登出信号写入
    Signal,
    /// Phase 2：新设备声明写入
    Claim,
}

impl ClaimPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimPhase::Signal => "signal",
            ClaimPhase::Claim => "claim",
        }
    }
}

/// claim 错误
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimError {
    /// 调用方未认证
    Unauthenticated,
    /// 调用方试图接管别人的会话
    CrossUser { caller: String, target: String },
    /// 缺少 localToken
    MissingToken,
    /// 某一阶段的存储写入失败
    PhaseFailure { phase: ClaimPhase, detail: String },
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimError::Unauthenticated => write!(f, "Unauthorized: User not authenticated"),
            ClaimError::CrossUser { caller, target } => write!(
                f,
                "Unauthorized: caller {} cannot claim session of user {}",
                caller, target
            ),
            ClaimError::MissingToken => write!(f, "Missing required parameter: localToken"),
            ClaimError::PhaseFailure { phase, detail } => {
                write!(f, "Force logout failed at {} phase: {}", phase.as_str(), detail)
            }
        }
    }
}

impl std::error::Error for ClaimError {}

/// 日志里只露 token 前 8 个字符
fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// 会话仲裁器
#[derive(Clone)]
pub struct SessionArbitrator {
    store: Arc<dyn UserStore>,
    grace: Duration,
}

impl SessionArbitrator {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self {
            store,
            grace: GRACE_INTERVAL,
        }
    }

    /// 覆盖等待间隔（测试用）
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// 执行一次设备接管
    ///
    /// 授权前置条件在任何写入之前检查：未认证和跨用户的 claim
    /// 直接拒绝，不产生任何状态变更。
    pub async fn claim(
        &self,
        auth: &AuthContext,
        claim: &SessionClaim,
    ) -> Result<ClaimResponse, ClaimError> {
        let caller = auth.uid.as_deref().ok_or(ClaimError::Unauthenticated)?;
        if caller != claim.user_id {
            return Err(ClaimError::CrossUser {
                caller: caller.to_string(),
                target: claim.user_id.clone(),
            });
        }
        if claim.local_token.is_empty() {
            return Err(ClaimError::MissingToken);
        }

        info!(
            user_id = %claim.user_id,
            token = %redact_token(&claim.local_token),
            "Force logout called"
        );

        // Phase 1：置 forceLogout 并清 token，其他设备立即登出
        let signal = SessionPatch {
            force_logout: Some(true),
            active_device_token: Some(String::new()),
            device_info: None,
            last_session_update: Utc::now(),
        };
        self.store
            .merge_session(&claim.user_id, &signal)
            .await
            .map_err(|e| {
                error!(user_id = %claim.user_id, error = %e, "Phase 1 write failed");
                ClaimError::PhaseFailure {
                    phase: ClaimPhase::Signal,
                    detail: e.to_string(),
                }
            })?;
        info!(user_id = %claim.user_id, "forceLogout signal sent");

        // 等旧设备收到并处理登出信号
        sleep(self.grace).await;

        // Phase 2：新设备成为活跃设备，清除登出标志
        let takeover = SessionPatch {
            force_logout: Some(false),
            active_device_token: Some(claim.local_token.clone()),
            device_info: Some(
                claim
                    .device_info
                    .clone()
                    .unwrap_or_else(|| Value::Object(Default::default())),
            ),
            last_session_update: Utc::now(),
        };
        self.store
            .merge_session(&claim.user_id, &takeover)
            .await
            .map_err(|e| {
                // 账号停在 LogoutSignaled：没有任何设备活跃，
                // 好过出现两个同时有效的 token
                error!(
                    user_id = %claim.user_id,
                    error = %e,
                    "Phase 2 write failed, user left logged out everywhere"
                );
                ClaimError::PhaseFailure {
                    phase: ClaimPhase::Claim,
                    detail: e.to_string(),
                }
            })?;

        info!(user_id = %claim.user_id, "Force logout completed, new device active");
        Ok(ClaimResponse {
            success: true,
            message: "Force logout completed".to_string(),
        })
    }
}
