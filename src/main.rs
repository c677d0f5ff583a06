//! Supper Push CLI
//!
//! 事件通知分发与设备会话仲裁服务

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use supper_push::{
    parse_trigger, AppConfig, AuthContext, DeliveryGateway, Directory, Dispatcher, FcmConfig,
    FcmTransport, HttpUserStore, HttpUserStoreConfig, MemoryUserStore, PushTransport,
    RecordingTransport, Server, SessionArbitrator, SessionClaim, UserStore,
};

#[derive(Parser)]
#[command(name = "spush")]
#[command(about = "Supper Push - 事件通知分发与设备会话仲裁")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动 stdio JSON-line 服务
    Serve,
    /// 分发单个事件（触发器输入）
    Dispatch {
        /// 层级触发路径（如 calls/call-1）
        #[arg(long)]
        path: String,
        /// 原始文档字段（JSON）
        #[arg(long)]
        fields: String,
        /// Dry-run 模式（只构建不发送）
        #[arg(long)]
        dry_run: bool,
    },
    /// 提交一次设备会话接管
    Claim {
        /// 已认证的用户 ID
        #[arg(long)]
        user_id: String,
        /// 新设备的本地 token
        #[arg(long)]
        token: String,
        /// 设备信息（JSON 对象，可选）
        #[arg(long)]
        device_info: Option<String>,
    },
}

/// 按配置装配用户存储（没配存储端点时退回内存模式）
fn build_store(config: &AppConfig) -> Result<Arc<dyn UserStore>> {
    if config.store_base_url.is_empty() {
        warn!("No store_base_url configured, using in-memory user store");
        return Ok(Arc::new(MemoryUserStore::new()));
    }
    let store = HttpUserStore::new(HttpUserStoreConfig {
        base_url: config.store_base_url.clone(),
        auth_token: config.store_auth_token.clone(),
        timeout_secs: config.timeout_secs,
    })?;
    Ok(Arc::new(store))
}

/// 按配置装配推送传输
fn build_transport(config: &AppConfig) -> Result<Arc<dyn PushTransport>> {
    if config.fcm_project_id.is_empty() {
        return Err(anyhow!(
            "fcm_project_id is not configured (config file or SUPPER_PUSH_FCM_PROJECT_ID)"
        ));
    }
    let transport = FcmTransport::new(FcmConfig {
        endpoint: config.fcm_endpoint.clone(),
        project_id: config.fcm_project_id.clone(),
        auth_token: config.fcm_auth_token.clone(),
        timeout_secs: config.timeout_secs,
    })?;
    Ok(Arc::new(transport))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Serve => {
            let store = build_store(&config)?;
            let transport = build_transport(&config)?;
            let dispatcher = Dispatcher::new(
                Directory::new(store.clone()),
                DeliveryGateway::new(transport),
            );
            let arbitrator = SessionArbitrator::new(store)
                .with_grace(Duration::from_millis(config.grace_ms));
            Server::new(dispatcher, arbitrator).run().await
        }
        Commands::Dispatch {
            path,
            fields,
            dry_run,
        } => {
            let fields: serde_json::Value = serde_json::from_str(&fields)?;
            let event = parse_trigger(&path, &fields)
                .ok_or_else(|| anyhow!("Unrecognized trigger path: {}", path))?;

            let store = build_store(&config)?;
            let recording = Arc::new(RecordingTransport::new());
            let transport: Arc<dyn PushTransport> = if dry_run {
                recording.clone()
            } else {
                build_transport(&config)?
            };
            let dispatcher = Dispatcher::new(
                Directory::new(store),
                DeliveryGateway::new(transport),
            );

            let outcome = dispatcher.dispatch(&event).await;
            match outcome {
                Some(outcome) => info!(event = event.kind_name(), outcome = %outcome, "Dispatched"),
                None => info!(event = event.kind_name(), "Event dropped (not notification-worthy)"),
            }

            if dry_run {
                for message in recording.sent().await {
                    eprintln!(
                        "[DRY-RUN] Would send to {}: {} / {}",
                        message.token, message.title, message.body
                    );
                }
            }
            Ok(())
        }
        Commands::Claim {
            user_id,
            token,
            device_info,
        } => {
            let device_info = device_info
                .map(|raw| serde_json::from_str(&raw))
                .transpose()?;
            let store = build_store(&config)?;
            let arbitrator = SessionArbitrator::new(store)
                .with_grace(Duration::from_millis(config.grace_ms));

            let auth = AuthContext::authenticated(user_id.clone());
            let claim = SessionClaim {
                user_id,
                local_token: token,
                device_info,
            };
            let response = arbitrator
                .claim(&auth, &claim)
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            info!(message = %response.message, "Claim completed");
            Ok(())
        }
    }
}
