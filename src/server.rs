//! JSON-line 请求服务 - 对外暴露 dispatch 和 claim 两个操作
//!
//! 从 stdin 逐行读取 JSON 请求，向 stdout 逐行写回 JSON 响应。
//! 每个请求在独立的 tokio 任务里处理：事件之间、事件和 claim 之间
//! 互不排序，可完全并发（包括同一用户的多个请求）。
//!
//! 请求格式：
//! `{"id": 1, "method": "dispatch", "params": {"path": "calls/c1", "fields": {...}}}`
//! `{"id": 2, "method": "claim", "params": {"authUid": "u1", "localToken": "t", "deviceInfo": {}}}`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::event::DomainEvent;
use crate::session::{AuthContext, SessionArbitrator, SessionClaim};

/// 请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

/// 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// 错误响应体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
}

impl WireResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WireError {
                message: message.into(),
            }),
        }
    }
}

/// dispatch 请求参数
#[derive(Debug, Deserialize)]
struct DispatchParams {
    /// 层级触发路径（标识父实体和事件 ID）
    path: String,
    /// 原始文档字段
    #[serde(default)]
    fields: Value,
}

/// claim 请求参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimParams {
    /// 已认证的调用方（由前置认证层填入）
    auth_uid: Option<String>,
    /// 目标用户（缺省时取 authUid）
    user_id: Option<String>,
    /// 新设备 token
    #[serde(default)]
    local_token: String,
    /// 设备信息
    device_info: Option<Value>,
}

/// 把层级触发路径和文档字段解析成领域事件
///
/// 支持的路径：
/// - `conversations/{conversationId}/messages/{messageId}`
/// - `calls/{callId}`
/// - `users/{professionalId}/inquiries/{inquiryId}`
/// - `users/{userId}/connection_requests/{requestId}`
pub fn parse_trigger(path: &str, fields: &Value) -> Option<DomainEvent> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["conversations", conversation_id, "messages", _message_id] => {
            DomainEvent::message_from_doc(*conversation_id, fields)
        }
        ["calls", call_id] => DomainEvent::call_from_doc(*call_id, fields),
        ["users", professional_id, "inquiries", inquiry_id] => Some(
            DomainEvent::inquiry_from_doc(*professional_id, *inquiry_id, fields),
        ),
        ["users", user_id, "connection_requests", request_id] => Some(
            DomainEvent::connection_request_from_doc(*user_id, *request_id, fields),
        ),
        _ => None,
    }
}

/// 请求服务
#[derive(Clone)]
pub struct Server {
    dispatcher: Dispatcher,
    arbitrator: SessionArbitrator,
}

impl Server {
    pub fn new(dispatcher: Dispatcher, arbitrator: SessionArbitrator) -> Self {
        Self {
            dispatcher,
            arbitrator,
        }
    }

    /// 处理一个请求
    pub async fn handle_request(&self, request: WireRequest) -> WireResponse {
        match request.method.as_str() {
            "dispatch" => self.handle_dispatch(request.id, request.params).await,
            "claim" => self.handle_claim(request.id, request.params).await,
            other => WireResponse::err(request.id, format!("Unknown method: {}", other)),
        }
    }

    async fn handle_dispatch(&self, id: Option<Value>, params: Option<Value>) -> WireResponse {
        let params: DispatchParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => return WireResponse::err(id, "Missing params"),
            Err(e) => return WireResponse::err(id, format!("Bad dispatch params: {}", e)),
        };

        let event = match parse_trigger(&params.path, &params.fields) {
            Some(event) => event,
            None => {
                return WireResponse::err(
                    id,
                    format!("Unrecognized trigger path: {}", params.path),
                )
            }
        };

        // 通知是尽力而为：结果只记录，不影响触发方
        let outcome = self.dispatcher.dispatch(&event).await;
        let result = match outcome {
            Some(outcome) => serde_json::json!({
                "event": event.kind_name(),
                "outcome": outcome.as_str(),
            }),
            None => serde_json::json!({
                "event": event.kind_name(),
                "outcome": "dropped",
            }),
        };
        WireResponse::ok(id, result)
    }

    async fn handle_claim(&self, id: Option<Value>, params: Option<Value>) -> WireResponse {
        let params: ClaimParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => return WireResponse::err(id, "Missing params"),
            Err(e) => return WireResponse::err(id, format!("Bad claim params: {}", e)),
        };

        let auth = AuthContext {
            uid: params.auth_uid.clone(),
        };
        let user_id = params
            .user_id
            .or(params.auth_uid)
            .unwrap_or_default();
        let claim = SessionClaim {
            user_id,
            local_token: params.local_token,
            device_info: params.device_info,
        };

        match self.arbitrator.claim(&auth, &claim).await {
            Ok(response) => WireResponse::ok(
                id,
                serde_json::json!({
                    "success": response.success,
                    "message": response.message,
                }),
            ),
            Err(e) => WireResponse::err(id, e.to_string()),
        }
    }

    /// 运行 stdio 服务循环
    ///
    /// 每行一个请求，spawn 独立任务处理；响应经 channel 串行写出，
    /// 顺序不保证，靠 id 关联。
    pub async fn run(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        let (tx, mut rx) = mpsc::unbounded_channel::<WireResponse>();

        let writer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(response) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&response) {
                    let _ = stdout.write_all(line.as_bytes()).await;
                    let _ = stdout.write_all(b"\n").await;
                    let _ = stdout.flush().await;
                }
            }
        });

        info!("supper-push server started (stdio mode)");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request: WireRequest = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Failed to parse request line");
                    let _ = tx.send(WireResponse::err(None, format!("Parse error: {}", e)));
                    continue;
                }
            };

            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = server.handle_request(request).await;
                let _ = tx.send(response);
            });
        }

        drop(tx);
        let _ = writer.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Directory, MemoryUserStore};
    use crate::gateway::{DeliveryGateway, RecordingTransport};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn server_with(store: Arc<MemoryUserStore>, transport: Arc<RecordingTransport>) -> Server {
        let dispatcher = Dispatcher::new(
            Directory::new(store.clone()),
            DeliveryGateway::new(transport),
        );
        let arbitrator = SessionArbitrator::new(store).with_grace(Duration::ZERO);
        Server::new(dispatcher, arbitrator)
    }

    #[test]
    fn test_parse_trigger_paths() {
        let fields = json!({"senderId": "a", "receiverId": "b"});
        let event = parse_trigger("conversations/c1/messages/m1", &fields).unwrap();
        assert_eq!(event.kind_name(), "message");

        let fields = json!({"callerId": "a", "receiverId": "b", "status": "ringing"});
        let event = parse_trigger("calls/call-1", &fields).unwrap();
        assert_eq!(event.kind_name(), "call");

        let fields = json!({"clientId": "a"});
        let event = parse_trigger("users/pro-1/inquiries/inq-1", &fields).unwrap();
        assert_eq!(event.kind_name(), "inquiry");

        let fields = json!({"fromUserId": "a"});
        let event = parse_trigger("users/u1/connection_requests/req-1", &fields).unwrap();
        assert_eq!(event.kind_name(), "connection_request");

        assert!(parse_trigger("bogus/path", &json!({})).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_request_roundtrip() {
        let store = Arc::new(MemoryUserStore::new());
        store
            .insert_user("bob", json!({"name": "Bob", "fcmToken": "tok-bob"}))
            .await;
        store.insert_user("alice", json!({"name": "Alice"})).await;
        let transport = Arc::new(RecordingTransport::new());
        let server = server_with(store, transport.clone());

        let request = WireRequest {
            id: Some(json!(1)),
            method: "dispatch".to_string(),
            params: Some(json!({
                "path": "conversations/c1/messages/m1",
                "fields": {"senderId": "alice", "receiverId": "bob", "text": "hi"},
            })),
        };
        let response = server.handle_request(request).await;

        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["outcome"], "sent");
        assert_eq!(transport.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_path_is_error() {
        let server = server_with(
            Arc::new(MemoryUserStore::new()),
            Arc::new(RecordingTransport::new()),
        );
        let request = WireRequest {
            id: Some(json!(2)),
            method: "dispatch".to_string(),
            params: Some(json!({"path": "nope", "fields": {}})),
        };
        let response = server.handle_request(request).await;
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_call_state_update_reports_dropped() {
        let server = server_with(
            Arc::new(MemoryUserStore::new()),
            Arc::new(RecordingTransport::new()),
        );
        let request = WireRequest {
            id: Some(json!(3)),
            method: "dispatch".to_string(),
            params: Some(json!({
                "path": "calls/call-1",
                "fields": {"callerId": "a", "receiverId": "b", "status": "ended"},
            })),
        };
        let response = server.handle_request(request).await;
        assert_eq!(response.result.unwrap()["outcome"], "dropped");
    }

    #[tokio::test]
    async fn test_claim_request_roundtrip() {
        let store = Arc::new(MemoryUserStore::new());
        store.insert_user("u1", json!({})).await;
        let server = server_with(store.clone(), Arc::new(RecordingTransport::new()));

        let request = WireRequest {
            id: Some(json!(4)),
            method: "claim".to_string(),
            params: Some(json!({
                "authUid": "u1",
                "localToken": "tok-new",
                "deviceInfo": {"model": "Pixel 8"},
            })),
        };
        let response = server.handle_request(request).await;

        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["success"], true);
        let doc = store.snapshot("u1").await.unwrap();
        assert_eq!(doc["activeDeviceToken"], "tok-new");
    }

    #[tokio::test]
    async fn test_claim_unauthenticated_is_error() {
        let server = server_with(
            Arc::new(MemoryUserStore::new()),
            Arc::new(RecordingTransport::new()),
        );
        let request = WireRequest {
            id: Some(json!(5)),
            method: "claim".to_string(),
            params: Some(json!({"localToken": "tok"})),
        };
        let response = server.handle_request(request).await;

        let error = response.error.unwrap();
        assert!(error.message.contains("not authenticated"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = server_with(
            Arc::new(MemoryUserStore::new()),
            Arc::new(RecordingTransport::new()),
        );
        let request = WireRequest {
            id: None,
            method: "bogus".to_string(),
            params: None,
        };
        let response = server.handle_request(request).await;
        assert!(response.error.unwrap().message.contains("Unknown method"));
    }
}
