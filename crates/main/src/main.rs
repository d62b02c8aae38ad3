//! 聊天同步客户端入口
//!
//! 建立会话、水合房间目录，然后持续输出引擎事件直到收到 Ctrl-C。

use std::{env, sync::Arc};

use anyhow::Context;
use application::{
    Backoff, ChannelConnector, ChatApi, Clock, Credential, CredentialStore, EngineConfig,
    EngineDependencies, EngineEvent, RealtimeChannel, RetryConfig, SessionManager, SessionPolicy,
    SessionSignal, SyncEngine, SystemClock,
};
use config::ClientConfig;
use domain::UserId;
use infrastructure::{HttpChatApi, WsConnector};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::DirectoryHydrated { rooms } => info!(rooms, "房间目录已同步"),
        EngineEvent::DirectoryHydrationFailed { reason } => warn!(%reason, "房间目录同步失败"),
        EngineEvent::RoomUpdated { room_id } => info!(%room_id, "房间已更新"),
        EngineEvent::RoomRemoved { room_id } => info!(%room_id, "房间已移除"),
        EngineEvent::TimelineChanged {
            room_id,
            generation,
        } => info!(%room_id, generation, "时间线已变化"),
        EngineEvent::TimelineResyncFailed { room_id, reason } => {
            warn!(%room_id, %reason, "时间线重新同步失败")
        }
        EngineEvent::MessageStateChanged {
            room_id,
            message_id,
            state,
        } => info!(%room_id, %message_id, ?state, "消息状态变化"),
        EngineEvent::InvitationAnnounced(invitation) => {
            info!(
                invitation_id = %invitation.id,
                room = %invitation.room.name,
                headline = %invitation.headline(),
                "收到邀请"
            )
        }
        EngineEvent::InvitationDismissed {
            invitation_id,
            expired,
        } => info!(%invitation_id, expired, "邀请通知已关闭"),
        EngineEvent::Session(SessionSignal::CredentialRejected { reason }) => {
            warn!(%reason, "凭证被拒绝，需要重新登录")
        }
        EngineEvent::Session(SessionSignal::RetriesExhausted { attempts }) => {
            warn!(attempts, "重连次数已用尽")
        }
        EngineEvent::Session(signal) => info!(?signal, "会话状态变化"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = ClientConfig::load().context("加载客户端配置失败")?;

    let token = env::var("CHATROOM_CLIENT_TOKEN").context("缺少 CHATROOM_CLIENT_TOKEN")?;
    let user_id: Uuid = env::var("CHATROOM_CLIENT_USER_ID")
        .context("缺少 CHATROOM_CLIENT_USER_ID")?
        .parse()
        .context("CHATROOM_CLIENT_USER_ID 不是合法的 UUID")?;
    let user_id = UserId::from(user_id);

    info!(api = %cfg.server.api_url, ws = %cfg.server.ws_url, %user_id, "启动聊天同步客户端");

    let credentials = CredentialStore::new();
    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(
        cfg.server.api_url.clone(),
        credentials.clone(),
        cfg.server.request_timeout(),
    )?);
    let connector: Arc<dyn ChannelConnector> = Arc::new(WsConnector::new(
        cfg.server.ws_url.clone(),
        cfg.session.handshake_timeout(),
    ));

    let retry = RetryConfig::new(
        cfg.session.max_reconnect_attempts,
        Backoff::exponential(cfg.session.base_delay(), cfg.session.max_delay()),
    );
    let policy = SessionPolicy {
        retry: retry.clone(),
        inbound_capacity: cfg.session.inbound_capacity,
        ..SessionPolicy::default()
    };

    let (session, inbound) = SessionManager::establish(
        connector,
        credentials,
        Credential::new(user_id, token),
        policy,
    )
    .await
    .context("建立会话失败")?;

    let mut engine_config = EngineConfig::new(user_id);
    engine_config.page_size = cfg.timeline.page_size;
    engine_config.command_capacity = cfg.engine.command_capacity;
    engine_config.event_capacity = cfg.engine.event_capacity;
    engine_config.rehydrate_retry = retry;

    let channel: Arc<dyn RealtimeChannel> = Arc::new(session.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (engine, engine_task) = SyncEngine::spawn(
        engine_config,
        EngineDependencies { api, channel, clock },
        inbound,
        session.signals(),
    );
    let mut events = engine.subscribe();

    match engine.hydrate().await {
        Ok(count) => {
            for room in engine.rooms().await? {
                info!(room_id = %room.id, name = %room.name, unread = room.unread_count, "房间");
            }
            info!(rooms = count, "初始同步完成");
        }
        Err(err) => warn!(error = %err, "初始同步失败，等待重连后重试"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("收到退出信号");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    if let Err(err) = engine.shutdown().await {
        warn!(error = %err, "关闭同步引擎时出错");
    }
    session.teardown().await;
    engine_task.await.context("同步引擎任务异常退出")?;

    info!("客户端已退出");
    Ok(())
}
