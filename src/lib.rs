//! Supper Push - 事件通知分发与设备会话仲裁
//!
//! 每个领域事件（消息、来电、咨询、连接请求）只通知唯一的目标接收者，
//! 发起者永远不会收到自己触发的通知；登录冲突时通过两阶段接管协议
//! 仲裁哪台设备持有活跃会话。

pub mod config;
pub mod directory;
pub mod dispatch;
pub mod envelope;
pub mod event;
pub mod gateway;
pub mod server;
pub mod session;

pub use config::AppConfig;
pub use directory::{Directory, HttpUserStore, HttpUserStoreConfig, MemoryUserStore, SessionPatch, UserStore};
pub use dispatch::Dispatcher;
pub use envelope::{DeliveryHints, NotificationEnvelope, PayloadBuilder};
pub use event::{DomainEvent, DomainEventKind};
pub use gateway::{
    DeliveryGateway, DeliveryOutcome, FcmConfig, FcmTransport, PushMessage, PushTransport,
    RecordingTransport, TransportError,
};
pub use server::{parse_trigger, Server, WireRequest, WireResponse};
pub use session::{
    AuthContext, ClaimError, ClaimPhase, ClaimResponse, SessionArbitrator, SessionClaim,
};
