//! 事件路由 / 通知分发管道
//!
//! 每个入站领域事件走同一条单向流水线：
//! 提取发起者和接收者 → 自通知防护 → 查接收者 token →
//! 按需查发起者显示名/头像 → 构建信封 → 投递 → 记录结果。
//!
//! 核心安全保证：动作的发起者永远不是通知目标，
//! 即使上游数据畸形也一样。防护在任何 I/O 之前执行。
//!
//! 各事件相互独立，管道自身没有共享可变状态，
//! 可以任意并发调用（包括同一用户的两个事件）。

use tracing::{info, warn};

use crate::directory::Directory;
use crate::envelope::PayloadBuilder;
use crate::event::{DomainEvent, DomainEventKind};
use crate::gateway::{DeliveryGateway, DeliveryOutcome};

/// 视为新来电的状态（其余状态是通话状态更新，静默丢弃）
const INCOMING_CALL_STATUSES: [&str; 3] = ["calling", "ringing", "pending"];

/// 通知分发器
#[derive(Clone)]
pub struct Dispatcher {
    directory: Directory,
    gateway: DeliveryGateway,
}

impl Dispatcher {
    pub fn new(directory: Directory, gateway: DeliveryGateway) -> Self {
        Self { directory, gateway }
    }

    /// 分发一个领域事件
    ///
    /// 返回 None 表示事件被静默丢弃（非新来电的通话状态更新），
    /// 否则返回投递结果。
    pub async fn dispatch(&self, event: &DomainEvent) -> Option<DeliveryOutcome> {
        let kind = event.kind_name();

        // 自通知防护：发起者或接收者缺失、或两者相同时一律跳过，
        // 发起者缺失时防护无法验证，按同样方式跳过
        let actor = match event.actor_id() {
            Some(actor) => actor,
            None => {
                warn!(event = kind, "No actor id in event, skipping");
                return Some(DeliveryOutcome::SkippedNoRecipient);
            }
        };
        let recipient = match event.recipient_id() {
            Some(recipient) => recipient,
            None => {
                warn!(event = kind, "No valid recipient, skipping");
                return Some(DeliveryOutcome::SkippedNoRecipient);
            }
        };
        if recipient == actor {
            warn!(event = kind, user_id = %actor, "Actor is recipient, skipping");
            return Some(DeliveryOutcome::SkippedSelf);
        }

        // 来电状态门：只有新来电才通知
        if let DomainEventKind::CallCreated { status, .. } = &event.kind {
            if !INCOMING_CALL_STATUSES.contains(&status.as_str()) {
                info!(status = %status, "Call status is not a new call, skipping");
                return None;
            }
        }

        let token = match self.directory.resolve_token(recipient).await {
            Some(token) => token,
            None => {
                warn!(event = kind, recipient = %recipient, "No push token for recipient");
                return Some(DeliveryOutcome::SkippedNoToken);
            }
        };

        let envelope = match &event.kind {
            DomainEventKind::MessageCreated {
                conversation_id,
                sender_id,
                text,
                image_url,
                ..
            } => {
                let sender_name = self.directory.resolve_name(sender_id).await;
                PayloadBuilder::message(
                    &sender_name,
                    conversation_id,
                    sender_id,
                    text.as_deref(),
                    image_url.as_deref(),
                )
            }
            DomainEventKind::CallCreated {
                call_id,
                caller_id,
                caller_name,
                caller_photo,
                ..
            } => {
                // 名字和头像优先取事件载荷，缺了再查目录
                let caller_name = match caller_name {
                    Some(name) => name.clone(),
                    None => self.directory.resolve_name(caller_id).await,
                };
                let caller_photo = match caller_photo {
                    Some(photo) => Some(photo.clone()),
                    None => self.directory.resolve_photo(caller_id).await,
                };
                PayloadBuilder::call(call_id, caller_id, &caller_name, caller_photo.as_deref())
            }
            DomainEventKind::InquiryCreated {
                inquiry_id,
                service_name,
                message,
                ..
            } => {
                let client_name = self.directory.resolve_name(actor).await;
                PayloadBuilder::inquiry(
                    &client_name,
                    inquiry_id,
                    actor,
                    service_name.as_deref(),
                    message.as_deref(),
                )
            }
            DomainEventKind::ConnectionRequestCreated { request_id, .. } => {
                let sender_name = self.directory.resolve_name(actor).await;
                PayloadBuilder::connection_request(&sender_name, request_id, actor)
            }
        };

        let outcome = self.gateway.send(&token, &envelope).await;
        info!(
            event = kind,
            recipient = %recipient,
            actor = %actor,
            outcome = %outcome,
            "Dispatch completed"
        );
        Some(outcome)
    }
}
