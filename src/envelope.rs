//! 通知 Payload 构建模块
//!
//! 按事件类型把已解析的事件信息转换为可发送的通知信封
//! （标题、正文、字符串数据表、平台投递提示）。
//! 纯函数式构建：同样输入永远产出同样的信封，不做任何 I/O。
//!
//! 文案规则：
//! - 消息：正文 = 消息文本；只有图片时 `"Sent you a photo"`，
//!   图片加文本时 `"[Photo] " + 文本`；超 100 字符截断为 97 字符 + `"..."`
//! - 来电：固定标题 `"Incoming Call"`，正文 `"<name> is calling you"`
//! - 咨询：`"<client> sent an inquiry for <service>"`，
//!   带留言时改为 `"<client>: \"<留言截断 47 + ...>\""`
//! - 连接请求：`"<sender> wants to connect with you"`

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

/// 客户端点击路由标记
pub const CLICK_ACTION: &str = "FLUTTER_NOTIFICATION_CLICK";

/// 消息正文最大长度（字符）
const BODY_MAX_CHARS: usize = 100;
/// 截断后保留的字符数（加 "..." 后恰好 100）
const BODY_CUT_CHARS: usize = 97;

/// 咨询留言最大长度（字符）
const INQUIRY_MSG_MAX_CHARS: usize = 50;
/// 咨询留言截断后保留的字符数
const INQUIRY_MSG_CUT_CHARS: usize = 47;

/// 来电通知 TTL
const CALL_TTL: Duration = Duration::from_secs(60);

/// 平台投递提示（priority / ttl / channel / category 等）
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryHints {
    /// Android 通知渠道
    pub channel_id: String,
    /// Android 通知优先级（"high" | "max"）
    pub notification_priority: String,
    /// 消息存活时间（None = 平台默认）
    pub ttl: Option<Duration>,
    /// 锁屏是否完整展示（来电用）
    pub visibility_public: bool,
    /// APNs category（来电用 INCOMING_CALL，触发全屏 UI）
    pub apns_category: Option<String>,
    /// APNs content-available（杀进程状态下唤醒处理 data payload）
    pub content_available: bool,
    /// APNs mutable-content
    pub mutable_content: bool,
}

impl DeliveryHints {
    /// 普通消息类通知的提示
    pub fn chat() -> Self {
        Self {
            channel_id: "chat_messages".to_string(),
            notification_priority: "high".to_string(),
            ttl: None,
            visibility_public: false,
            apns_category: None,
            content_available: false,
            mutable_content: false,
        }
    }

    /// 来电通知的提示
    ///
    /// 高优先级 + 60 秒 TTL + alert 和 data 双 payload：
    /// 接收端即使应用进程被杀也要能弹出全屏来电 UI，
    /// 纯通知回落路径对这个 killed-app 场景是必需的。
    pub fn call() -> Self {
        Self {
            channel_id: "calls".to_string(),
            notification_priority: "max".to_string(),
            ttl: Some(CALL_TTL),
            visibility_public: true,
            apns_category: Some("INCOMING_CALL".to_string()),
            content_available: true,
            mutable_content: true,
        }
    }
}

/// 就绪待发的通知信封
#[derive(Debug, Clone)]
pub struct NotificationEnvelope {
    /// 标题
    pub title: String,
    /// 正文
    pub body: String,
    /// 数据表（type 判别式 + 关联 ID + click_action）
    pub data: HashMap<String, String>,
    /// 平台投递提示
    pub hints: DeliveryHints,
}

/// 超长时按字符截断并追加 "..."
fn truncate_with_ellipsis(text: &str, max_chars: usize, cut_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(cut_chars).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

/// Payload 构建器
pub struct PayloadBuilder;

impl PayloadBuilder {
    /// 构建消息通知
    pub fn message(
        sender_name: &str,
        conversation_id: &str,
        sender_id: &str,
        text: Option<&str>,
        image_url: Option<&str>,
    ) -> NotificationEnvelope {
        let text = text.unwrap_or_default();
        let has_image = image_url.is_some_and(|url| !url.is_empty());

        let body = if has_image && text.is_empty() {
            "Sent you a photo".to_string()
        } else if has_image {
            format!("[Photo] {}", text)
        } else {
            text.to_string()
        };
        let body = truncate_with_ellipsis(&body, BODY_MAX_CHARS, BODY_CUT_CHARS);

        let data = HashMap::from([
            ("type".to_string(), "message".to_string()),
            ("conversationId".to_string(), conversation_id.to_string()),
            ("senderId".to_string(), sender_id.to_string()),
            ("senderName".to_string(), sender_name.to_string()),
            ("click_action".to_string(), CLICK_ACTION.to_string()),
        ]);

        NotificationEnvelope {
            title: sender_name.to_string(),
            body,
            data,
            hints: DeliveryHints::chat(),
        }
    }

    /// 构建来电通知
    pub fn call(
        call_id: &str,
        caller_id: &str,
        caller_name: &str,
        caller_photo: Option<&str>,
    ) -> NotificationEnvelope {
        let data = HashMap::from([
            ("type".to_string(), "call".to_string()),
            ("callId".to_string(), call_id.to_string()),
            ("callerId".to_string(), caller_id.to_string()),
            ("callerName".to_string(), caller_name.to_string()),
            (
                "callerPhoto".to_string(),
                caller_photo.unwrap_or_default().to_string(),
            ),
            ("click_action".to_string(), CLICK_ACTION.to_string()),
            (
                "timestamp".to_string(),
                Utc::now().timestamp_millis().to_string(),
            ),
        ]);

        NotificationEnvelope {
            title: "Incoming Call".to_string(),
            body: format!("{} is calling you", caller_name),
            data,
            hints: DeliveryHints::call(),
        }
    }

    /// 构建咨询通知
    pub fn inquiry(
        client_name: &str,
        inquiry_id: &str,
        client_id: &str,
        service_name: Option<&str>,
        message: Option<&str>,
    ) -> NotificationEnvelope {
        let service_name = service_name.filter(|s| !s.is_empty()).unwrap_or("your service");

        let body = match message.filter(|m| !m.is_empty()) {
            Some(message) => {
                let truncated =
                    truncate_with_ellipsis(message, INQUIRY_MSG_MAX_CHARS, INQUIRY_MSG_CUT_CHARS);
                format!("{}: \"{}\"", client_name, truncated)
            }
            None => format!("{} sent an inquiry for {}", client_name, service_name),
        };

        let data = HashMap::from([
            ("type".to_string(), "inquiry".to_string()),
            ("inquiryId".to_string(), inquiry_id.to_string()),
            ("clientId".to_string(), client_id.to_string()),
            ("clientName".to_string(), client_name.to_string()),
            ("serviceName".to_string(), service_name.to_string()),
            ("click_action".to_string(), CLICK_ACTION.to_string()),
        ]);

        NotificationEnvelope {
            title: "New Inquiry".to_string(),
            body,
            data,
            hints: DeliveryHints::chat(),
        }
    }

    /// 构建连接请求通知
    pub fn connection_request(
        sender_name: &str,
        request_id: &str,
        sender_id: &str,
    ) -> NotificationEnvelope {
        let data = HashMap::from([
            ("type".to_string(), "connection_request".to_string()),
            ("requestId".to_string(), request_id.to_string()),
            ("senderId".to_string(), sender_id.to_string()),
            ("senderName".to_string(), sender_name.to_string()),
            ("click_action".to_string(), CLICK_ACTION.to_string()),
        ]);

        NotificationEnvelope {
            title: "Connection Request".to_string(),
            body: format!("{} wants to connect with you", sender_name),
            data,
            hints: DeliveryHints::chat(),
        }
    }
}
