//! 统一领域事件结构
//!
//! 定义触发通知的四类领域事件（消息、来电、咨询、连接请求），
//! 以及从上游原始文档中提取字段的规则。
//!
//! 上游生产者存在 schema 漂移（同一字段有多个历史名称），
//! 统一用按优先级排序的字段提取函数处理，而不是在管道里散落分支：
//! - 来电接收方: `receiverId` → `calleeId`
//! - 咨询客户: `clientId` → `userId`
//! - 连接请求发送方: `fromUserId` → `senderId`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 按优先级从 JSON 文档中提取第一个非空字符串字段
///
/// 两个字段同时存在时，排在前面的名称优先。
pub fn pick_str<'a>(doc: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| doc.get(*name).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// 统一的领域事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// 事件类型
    #[serde(flatten)]
    pub kind: DomainEventKind,
    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

/// 事件类型枚举
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEventKind {
    /// 新消息（conversations/{conversationId}/messages/{messageId}）
    MessageCreated {
        conversation_id: String,
        sender_id: String,
        receiver_id: Option<String>,
        text: Option<String>,
        image_url: Option<String>,
    },
    /// 新来电（calls/{callId}）
    CallCreated {
        call_id: String,
        caller_id: String,
        receiver_id: Option<String>,
        status: String,
        caller_name: Option<String>,
        caller_photo: Option<String>,
    },
    /// 新咨询（users/{professionalId}/inquiries/{inquiryId}）
    InquiryCreated {
        professional_id: String,
        inquiry_id: String,
        client_id: Option<String>,
        service_name: Option<String>,
        message: Option<String>,
    },
    /// 新连接请求（users/{userId}/connection_requests/{requestId}）
    ConnectionRequestCreated {
        recipient_user_id: String,
        request_id: String,
        sender_id: Option<String>,
    },
}

impl DomainEvent {
    /// 创建新事件
    pub fn new(kind: DomainEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// 事件的发起者（发送方/呼叫方/客户/请求方）
    pub fn actor_id(&self) -> Option<&str> {
        match &self.kind {
            DomainEventKind::MessageCreated { sender_id, .. } => Some(sender_id.as_str()),
            DomainEventKind::CallCreated { caller_id, .. } => Some(caller_id.as_str()),
            DomainEventKind::InquiryCreated { client_id, .. } => client_id.as_deref(),
            DomainEventKind::ConnectionRequestCreated { sender_id, .. } => sender_id.as_deref(),
        }
    }

    /// 事件的通知接收者
    pub fn recipient_id(&self) -> Option<&str> {
        match &self.kind {
            DomainEventKind::MessageCreated { receiver_id, .. } => receiver_id.as_deref(),
            DomainEventKind::CallCreated { receiver_id, .. } => receiver_id.as_deref(),
            DomainEventKind::InquiryCreated {
                professional_id, ..
            } => Some(professional_id.as_str()),
            DomainEventKind::ConnectionRequestCreated {
                recipient_user_id, ..
            } => Some(recipient_user_id.as_str()),
        }
    }

    /// 事件类型名（用于日志）
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            DomainEventKind::MessageCreated { .. } => "message",
            DomainEventKind::CallCreated { .. } => "call",
            DomainEventKind::InquiryCreated { .. } => "inquiry",
            DomainEventKind::ConnectionRequestCreated { .. } => "connection_request",
        }
    }
}

/// 从原始文档构造事件（触发器输入）
impl DomainEvent {
    /// 消息事件：conversationId 来自触发路径，其余来自文档字段
    pub fn message_from_doc(conversation_id: impl Into<String>, doc: &Value) -> Option<Self> {
        let sender_id = pick_str(doc, &["senderId"])?.to_string();
        Some(Self::new(DomainEventKind::MessageCreated {
            conversation_id: conversation_id.into(),
            sender_id,
            receiver_id: pick_str(doc, &["receiverId"]).map(String::from),
            text: doc.get("text").and_then(Value::as_str).map(String::from),
            image_url: pick_str(doc, &["imageUrl"]).map(String::from),
        }))
    }

    /// 来电事件：callId 来自触发路径
    pub fn call_from_doc(call_id: impl Into<String>, doc: &Value) -> Option<Self> {
        let caller_id = pick_str(doc, &["callerId"])?.to_string();
        Some(Self::new(DomainEventKind::CallCreated {
            call_id: call_id.into(),
            caller_id,
            receiver_id: pick_str(doc, &["receiverId", "calleeId"]).map(String::from),
            status: pick_str(doc, &["status"]).unwrap_or_default().to_string(),
            caller_name: pick_str(doc, &["callerName"]).map(String::from),
            caller_photo: pick_str(doc, &["callerPhoto"]).map(String::from),
        }))
    }

    /// 咨询事件：professionalId 和 inquiryId 来自触发路径
    pub fn inquiry_from_doc(
        professional_id: impl Into<String>,
        inquiry_id: impl Into<String>,
        doc: &Value,
    ) -> Self {
        Self::new(DomainEventKind::InquiryCreated {
            professional_id: professional_id.into(),
            inquiry_id: inquiry_id.into(),
            client_id: pick_str(doc, &["clientId", "userId"]).map(String::from),
            service_name: pick_str(doc, &["serviceName"]).map(String::from),
            message: doc.get("message").and_then(Value::as_str).map(String::from),
        })
    }

    /// 连接请求事件：recipientUserId 和 requestId 来自触发路径
    pub fn connection_request_from_doc(
        recipient_user_id: impl Into<String>,
        request_id: impl Into<String>,
        doc: &Value,
    ) -> Self {
        Self::new(DomainEventKind::ConnectionRequestCreated {
            recipient_user_id: recipient_user_id.into(),
            request_id: request_id.into(),
            sender_id: pick_str(doc, &["fromUserId", "senderId"]).map(String::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pick_str_preference_order() {
        let doc = json!({"receiverId": "u1", "calleeId": "u2"});
        // 两个字段都在时，排在前面的优先
        assert_eq!(pick_str(&doc, &["receiverId", "calleeId"]), Some("u1"));
        assert_eq!(pick_str(&doc, &["calleeId", "receiverId"]), Some("u2"));
    }

    #[test]
    fn test_pick_str_fallback() {
        let doc = json!({"calleeId": "u2"});
        assert_eq!(pick_str(&doc, &["receiverId", "calleeId"]), Some("u2"));
        assert_eq!(pick_str(&doc, &["receiverId"]), None);
    }

    #[test]
    fn test_pick_str_skips_empty() {
        let doc = json!({"receiverId": "", "calleeId": "u2"});
        assert_eq!(pick_str(&doc, &["receiverId", "calleeId"]), Some("u2"));
    }

    #[test]
    fn test_message_from_doc() {
        let doc = json!({
            "senderId": "alice",
            "receiverId": "bob",
            "text": "hello",
        });
        let event = DomainEvent::message_from_doc("conv-1", &doc).unwrap();

        assert_eq!(event.actor_id(), Some("alice"));
        assert_eq!(event.recipient_id(), Some("bob"));
        assert_eq!(event.kind_name(), "message");
    }

    #[test]
    fn test_message_from_doc_missing_sender() {
        let doc = json!({"receiverId": "bob"});
        assert!(DomainEvent::message_from_doc("conv-1", &doc).is_none());
    }

    #[test]
    fn test_call_from_doc_callee_fallback() {
        let doc = json!({
            "callerId": "alice",
            "calleeId": "bob",
            "status": "ringing",
        });
        let event = DomainEvent::call_from_doc("call-1", &doc).unwrap();

        assert_eq!(event.recipient_id(), Some("bob"));
        if let DomainEventKind::CallCreated { status, .. } = &event.kind {
            assert_eq!(status, "ringing");
        } else {
            panic!("Expected CallCreated event kind");
        }
    }

    #[test]
    fn test_inquiry_from_doc_user_id_fallback() {
        let doc = json!({
            "userId": "client-1",
            "serviceName": "Plumbing",
        });
        let event = DomainEvent::inquiry_from_doc("pro-1", "inq-1", &doc);

        assert_eq!(event.actor_id(), Some("client-1"));
        assert_eq!(event.recipient_id(), Some("pro-1"));
    }

    #[test]
    fn test_inquiry_from_doc_no_client() {
        let doc = json!({"serviceName": "Plumbing"});
        let event = DomainEvent::inquiry_from_doc("pro-1", "inq-1", &doc);
        // 缺少客户 ID 的咨询也能构造，由管道决定跳过
        assert_eq!(event.actor_id(), None);
    }

    #[test]
    fn test_connection_request_sender_fallback() {
        let doc = json!({"senderId": "alice"});
        let event = DomainEvent::connection_request_from_doc("bob", "req-1", &doc);

        assert_eq!(event.actor_id(), Some("alice"));
        assert_eq!(event.recipient_id(), Some("bob"));
    }

    #[test]
    fn test_event_kind_serialization() {
        let event = DomainEvent::new(DomainEventKind::CallCreated {
            call_id: "call-1".to_string(),
            caller_id: "alice".to_string(),
            receiver_id: Some("bob".to_string()),
            status: "calling".to_string(),
            caller_name: None,
            caller_photo: None,
        });

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"call_created\""));

        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, event.kind);
    }
}
