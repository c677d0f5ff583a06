//! 投递网关 - 把信封发往推送传输并归类结果
//!
//! 传输本身是黑盒（`PushTransport` trait）：网关只负责
//! 空 token 短路、调用传输、把传输错误归类为
//! `InvalidToken`（token 已失效，上报给调用方做外部清理）
//! 或 `TransientError`（记日志，不重试，接受至多一次投递语义）。

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::envelope::NotificationEnvelope;

/// 投递结果
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// 已发送
    Sent,
    /// 跳过：事件没有可解析的接收者
    SkippedNoRecipient,
    /// 跳过：接收者就是发起者（自通知防护）
    SkippedSelf,
    /// 跳过：接收者没有推送 token
    SkippedNoToken,
    /// 传输报告 token 失效（待外部清理，不重试）
    InvalidToken,
    /// 传输瞬时失败（已记日志，不重试）
    TransientError,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::SkippedNoRecipient => "skipped_no_recipient",
            DeliveryOutcome::SkippedSelf => "skipped_self",
            DeliveryOutcome::SkippedNoToken => "skipped_no_token",
            DeliveryOutcome::InvalidToken => "invalid_token",
            DeliveryOutcome::TransientError => "transient_error",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层错误（由具体传输归类）
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// token 不再注册 / 无效
    InvalidToken(String),
    /// 其他失败（网络、配额、服务端错误）
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::InvalidToken(detail) => write!(f, "invalid token: {}", detail),
            TransportError::Other(detail) => write!(f, "transport error: {}", detail),
        }
    }
}

impl std::error::Error for TransportError {}

/// 交给传输的完整消息
#[derive(Debug, Clone)]
pub struct PushMessage {
    /// 接收方 token
    pub token: String,
    /// 标题
    pub title: String,
    /// 正文
    pub body: String,
    /// 数据表
    pub data: HashMap<String, String>,
    /// 平台提示
    pub hints: crate::envelope::DeliveryHints,
}

/// 推送传输 trait（黑盒发送原语）
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// 传输名称（用于日志）
    fn name(&self) -> &str;

    /// 发送一条消息，成功返回传输侧的消息 ID
    async fn send(&self, message: &PushMessage) -> Result<String, TransportError>;
}

/// 投递网关
#[derive(Clone)]
pub struct DeliveryGateway {
    transport: Arc<dyn PushTransport>,
}

impl DeliveryGateway {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self { transport }
    }

    /// 发送一个信封到指定 token
    ///
    /// 空 token 直接短路为 `SkippedNoToken`，不触碰传输。
    /// 失败不重试：发起方的领域写入不会因通知失败回滚。
    pub async fn send(&self, token: &str, envelope: &NotificationEnvelope) -> DeliveryOutcome {
        if token.is_empty() {
            warn!("No push token provided, skipping notification");
            return DeliveryOutcome::SkippedNoToken;
        }

        let message = PushMessage {
            token: token.to_string(),
            title: envelope.title.clone(),
            body: envelope.body.clone(),
            data: envelope.data.clone(),
            hints: envelope.hints.clone(),
        };

        match self.transport.send(&message).await {
            Ok(message_id) => {
                info!(
                    transport = self.transport.name(),
                    message_id = %message_id,
                    "Notification sent successfully"
                );
                DeliveryOutcome::Sent
            }
            Err(TransportError::InvalidToken(detail)) => {
                warn!(
                    transport = self.transport.name(),
                    detail = %detail,
                    "Invalid push token, should be removed"
                );
                DeliveryOutcome::InvalidToken
            }
            Err(TransportError::Other(detail)) => {
                error!(
                    transport = self.transport.name(),
                    detail = %detail,
                    "Error sending notification"
                );
                DeliveryOutcome::TransientError
            }
        }
    }
}

/// FCM HTTP v1 传输配置
#[derive(Debug, Clone)]
pub struct FcmConfig {
    /// API 基础 URL（如 https://fcm.googleapis.com）
    pub endpoint: String,
    /// 项目 ID
    pub project_id: String,
    /// OAuth bearer token
    pub auth_token: String,
    /// 请求超时（秒）
    pub timeout_secs: u64,
}

/// FCM HTTP v1 传输
pub struct FcmTransport {
    client: reqwest::Client,
    config: FcmConfig,
}

impl FcmTransport {
    pub fn new(config: FcmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    /// 组装 FCM v1 消息体（notification + data + android/apns 提示）
    fn build_body(message: &PushMessage) -> serde_json::Value {
        let hints = &message.hints;

        let mut android_notification = serde_json::json!({
            "channel_id": hints.channel_id,
            "notification_priority": format!("PRIORITY_{}", hints.notification_priority.to_uppercase()),
            "default_sound": true,
            "default_vibrate_timings": true,
        });
        if hints.visibility_public {
            android_notification["visibility"] = serde_json::json!("PUBLIC");
        }

        let mut android = serde_json::json!({
            "priority": "HIGH",
            "notification": android_notification,
        });
        if let Some(ttl) = hints.ttl {
            android["ttl"] = serde_json::json!(format!("{}s", ttl.as_secs()));
        }

        let mut aps = serde_json::json!({
            "alert": { "title": message.title, "body": message.body },
            "sound": "default",
            "badge": 1,
        });
        if hints.content_available {
            aps["content-available"] = serde_json::json!(1);
        }
        if hints.mutable_content {
            aps["mutable-content"] = serde_json::json!(1);
        }
        if let Some(category) = &hints.apns_category {
            aps["category"] = serde_json::json!(category);
        }

        let mut apns_headers = serde_json::json!({});
        if hints.notification_priority == "max" {
            apns_headers["apns-priority"] = serde_json::json!("10");
            apns_headers["apns-push-type"] = serde_json::json!("alert");
        }

        serde_json::json!({
            "message": {
                "token": message.token,
                "notification": { "title": message.title, "body": message.body },
                "data": message.data,
                "android": android,
                "apns": { "headers": apns_headers, "payload": { "aps": aps } },
            }
        })
    }

    /// 判断错误响应是否意味着 token 失效
    fn is_invalid_token(status: reqwest::StatusCode, body: &str) -> bool {
        status == reqwest::StatusCode::NOT_FOUND
            || body.contains("UNREGISTERED")
            || body.contains("INVALID_ARGUMENT")
    }
}

#[async_trait]
impl PushTransport for FcmTransport {
    fn name(&self) -> &str {
        "fcm"
    }

    async fn send(&self, message: &PushMessage) -> Result<String, TransportError> {
        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.config.endpoint.trim_end_matches('/'),
            self.config.project_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.auth_token)
            .json(&Self::build_body(message))
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;
            let message_id = body
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(message_id);
        }

        let body = response.text().await.unwrap_or_default();
        if Self::is_invalid_token(status, &body) {
            Err(TransportError::InvalidToken(format!("{}: {}", status, body)))
        } else {
            Err(TransportError::Other(format!("{}: {}", status, body)))
        }
    }
}

/// 记录型传输（测试用）：记下每条消息，按预设脚本返回结果
pub struct RecordingTransport {
    sent: Mutex<Vec<PushMessage>>,
    /// 预设结果队列（空则全部成功）
    script: Mutex<Vec<Result<String, TransportError>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            script: Mutex::new(Vec::new()),
        }
    }

    /// 预设后续 send 调用的结果
    pub async fn set_script(&self, script: Vec<Result<String, TransportError>>) {
        *self.script.lock().await = script;
    }

    /// 已发送的消息
    pub async fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &PushMessage) -> Result<String, TransportError> {
        self.sent.lock().await.push(message.clone());
        let mut script = self.script.lock().await;
        if script.is_empty() {
            Ok(format!("recorded-{}", self.sent.lock().await.len()))
        } else {
            script.remove(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PayloadBuilder;

    fn envelope() -> NotificationEnvelope {
        PayloadBuilder::message("Alice", "conv-1", "alice", Some("hi"), None)
    }

    #[tokio::test]
    async fn test_empty_token_short_circuits() {
        let transport = Arc::new(RecordingTransport::new());
        let gateway = DeliveryGateway::new(transport.clone());

        let outcome = gateway.send("", &envelope()).await;

        assert_eq!(outcome, DeliveryOutcome::SkippedNoToken);
        // 传输完全没有被调用
        assert_eq!(transport.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_successful_send() {
        let transport = Arc::new(RecordingTransport::new());
        let gateway = DeliveryGateway::new(transport.clone());

        let outcome = gateway.send("tok-1", &envelope()).await;

        assert_eq!(outcome, DeliveryOutcome::Sent);
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, "tok-1");
        assert_eq!(sent[0].title, "Alice");
    }

    #[tokio::test]
    async fn test_invalid_token_classified() {
        let transport = Arc::new(RecordingTransport::new());
        transport
            .set_script(vec![Err(TransportError::InvalidToken(
                "UNREGISTERED".to_string(),
            ))])
            .await;
        let gateway = DeliveryGateway::new(transport);

        assert_eq!(
            gateway.send("stale-tok", &envelope()).await,
            DeliveryOutcome::InvalidToken
        );
    }

    #[tokio::test]
    async fn test_transient_error_not_retried() {
        let transport = Arc::new(RecordingTransport::new());
        transport
            .set_script(vec![Err(TransportError::Other("503".to_string()))])
            .await;
        let gateway = DeliveryGateway::new(transport.clone());

        assert_eq!(
            gateway.send("tok-1", &envelope()).await,
            DeliveryOutcome::TransientError
        );
        // 一次失败就是一次调用，没有重试
        assert_eq!(transport.sent_count().await, 1);
    }

    #[test]
    fn test_fcm_invalid_token_detection() {
        assert!(FcmTransport::is_invalid_token(
            reqwest::StatusCode::NOT_FOUND,
            ""
        ));
        assert!(FcmTransport::is_invalid_token(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"error":{"status":"INVALID_ARGUMENT"}}"#
        ));
        assert!(FcmTransport::is_invalid_token(
            reqwest::StatusCode::GONE,
            r#"{"error":{"status":"UNREGISTERED"}}"#
        ));
        assert!(!FcmTransport::is_invalid_token(
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "quota exceeded"
        ));
    }

    #[test]
    fn test_fcm_body_for_call() {
        let call = PayloadBuilder::call("call-1", "alice", "Alice", None);
        let message = PushMessage {
            token: "tok".to_string(),
            title: call.title.clone(),
            body: call.body.clone(),
            data: call.data.clone(),
            hints: call.hints.clone(),
        };
        let body = FcmTransport::build_body(&message);

        let msg = &body["message"];
        assert_eq!(msg["token"], "tok");
        assert_eq!(msg["android"]["ttl"], "60s");
        assert_eq!(msg["android"]["notification"]["channel_id"], "calls");
        assert_eq!(msg["apns"]["headers"]["apns-priority"], "10");
        assert_eq!(msg["apns"]["payload"]["aps"]["category"], "INCOMING_CALL");
        assert_eq!(msg["apns"]["payload"]["aps"]["content-available"], 1);
    }

    #[test]
    fn test_fcm_body_for_chat() {
        let chat = envelope();
        let message = PushMessage {
            token: "tok".to_string(),
            title: chat.title.clone(),
            body: chat.body.clone(),
            data: chat.data.clone(),
            hints: chat.hints.clone(),
        };
        let body = FcmTransport::build_body(&message);

        let msg = &body["message"];
        assert_eq!(msg["android"]["notification"]["channel_id"], "chat_messages");
        assert!(msg["android"].get("ttl").is_none());
        assert!(msg["apns"]["headers"].get("apns-priority").is_none());
    }
}
