//! 会话管理器
//!
//! 一个后台任务独占实时链路：处理外部命令、转发入站事件、
//! 断线后按有上限的指数退避重连，并在重连后恢复全部房间订阅。
//! 依赖方通过 `watch` 观察连接状态，通过 `broadcast` 接收会话信号。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{ClientEvent, RoomId, ServerEvent};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelConnector, ChannelLink, Credential, CredentialStore, LinkFrame, RealtimeChannel,
};
use crate::error::ConnectionError;
use crate::retry::RetryConfig;

const COMMAND_CAPACITY: usize = 64;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 会话信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// 重连成功且订阅已恢复，依赖方应从上次的位置重新同步
    Reconnected,
    /// 链路断开，即将重连
    Disconnected { reason: String },
    /// 重连时握手被拒绝，等待 `rebind`
    CredentialRejected { reason: String },
    /// 重连次数用尽，等待 `rebind` 或 `teardown`
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub retry: RetryConfig,
    pub inbound_capacity: usize,
    pub signal_capacity: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            inbound_capacity: 256,
            signal_capacity: 16,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum SessionCommand {
    Send {
        event: ClientEvent,
        reply: Reply<Result<(), ConnectionError>>,
    },
    Subscribe {
        room_id: RoomId,
        reply: Reply<Result<(), ConnectionError>>,
    },
    Unsubscribe {
        room_id: RoomId,
        reply: Reply<Result<(), ConnectionError>>,
    },
    Rebind {
        credential: Credential,
        reply: Reply<()>,
    },
    Teardown {
        reply: Reply<()>,
    },
}

/// 按房间引用计数的订阅集合
#[derive(Debug, Default)]
struct SubscriptionSet {
    counts: HashMap<RoomId, usize>,
}

impl SubscriptionSet {
    /// 返回是否为第一个订阅者
    fn acquire(&mut self, room_id: RoomId) -> bool {
        let count = self.counts.entry(room_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// 返回是否为最后一个订阅者
    fn release(&mut self, room_id: RoomId) -> bool {
        match self.counts.get_mut(&room_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&room_id);
                true
            }
            None => false,
        }
    }

    fn rooms(&self) -> Vec<RoomId> {
        self.counts.keys().copied().collect()
    }
}

/// 会话管理器句柄
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    signals: broadcast::Sender<SessionSignal>,
    credentials: CredentialStore,
}

impl SessionManager {
    /// 用凭证建立会话
    ///
    /// 首次握手失败直接返回错误，不进入重连。成功后返回入站事件流。
    pub async fn establish(
        connector: Arc<dyn ChannelConnector>,
        credentials: CredentialStore,
        credential: Credential,
        policy: SessionPolicy,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), ConnectionError> {
        credentials.replace(credential.clone());
        let link = match connector.connect(&credential).await {
            Ok(link) => link,
            Err(err) => {
                credentials.clear();
                warn!(user_id = %credential.user_id(), error = %err, "建立会话失败");
                return Err(err);
            }
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(policy.inbound_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (signal_tx, _) = broadcast::channel(policy.signal_capacity);

        let task = SessionTask {
            connector,
            credentials: credentials.clone(),
            policy,
            subscriptions: SubscriptionSet::default(),
            commands: command_rx,
            inbound: inbound_tx,
            state: state_tx,
            signals: signal_tx.clone(),
            teardown_replies: Vec::new(),
        };
        tokio::spawn(task.run(link));

        info!(user_id = %credential.user_id(), "会话已建立");
        Ok((
            Self {
                commands: command_tx,
                state: state_rx,
                signals: signal_tx,
                credentials,
            },
            inbound_rx,
        ))
    }

    /// 替换凭证并立即重新打开链路，订阅集合保持不变
    pub async fn rebind(&self, credential: Credential) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Rebind { credential, reply })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)
    }

    /// 关闭链路并结束会话，可重复调用
    pub async fn teardown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Teardown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn signals(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    async fn call(
        &self,
        build: impl FnOnce(Reply<Result<(), ConnectionError>>) -> SessionCommand,
    ) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }
}

#[async_trait]
impl RealtimeChannel for SessionManager {
    async fn send(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        self.call(|reply| SessionCommand::Send { event, reply }).await
    }

    async fn subscribe(&self, room_id: RoomId) -> Result<(), ConnectionError> {
        self.call(|reply| SessionCommand::Subscribe { room_id, reply })
            .await
    }

    async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ConnectionError> {
        self.call(|reply| SessionCommand::Unsubscribe { room_id, reply })
            .await
    }
}

enum Phase {
    Connected(Box<dyn ChannelLink>),
    Reconnecting { attempt: u32, immediate: bool },
    Parked,
    Closed,
}

struct SessionTask {
    connector: Arc<dyn ChannelConnector>,
    credentials: CredentialStore,
    policy: SessionPolicy,
    subscriptions: SubscriptionSet,
    commands: mpsc::Receiver<SessionCommand>,
    inbound: mpsc::Sender<ServerEvent>,
    state: watch::Sender<ConnectionState>,
    signals: broadcast::Sender<SessionSignal>,
    teardown_replies: Vec<Reply<()>>,
}

impl SessionTask {
    async fn run(mut self, link: Box<dyn ChannelLink>) {
        let mut phase = Phase::Connected(link);
        loop {
            phase = match phase {
                Phase::Connected(link) => self.drive(link).await,
                Phase::Reconnecting { attempt, immediate } => {
                    self.reconnect(attempt, immediate).await
                }
                Phase::Parked => self.park().await,
                Phase::Closed => break,
            };
        }

        self.credentials.clear();
        self.state.send_replace(ConnectionState::Disconnected);
        for reply in self.teardown_replies.drain(..) {
            let _ = reply.send(());
        }
        info!("会话已关闭");
    }

    async fn drive(&mut self, mut link: Box<dyn ChannelLink>) -> Phase {
        self.state.send_replace(ConnectionState::Connected);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        link.close().await;
                        return Phase::Closed;
                    };
                    match command {
                        SessionCommand::Send { event, reply } => {
                            let result = link.send(&event).await;
                            let failed = result.clone().err();
                            let _ = reply.send(result);
                            if let Some(err) = failed {
                                return self.drop_link(link, err).await;
                            }
                        }
                        SessionCommand::Subscribe { room_id, reply } => {
                            let result = if self.subscriptions.acquire(room_id) {
                                link.send(&ClientEvent::Subscribe { room_id }).await
                            } else {
                                Ok(())
                            };
                            let failed = result.clone().err();
                            let _ = reply.send(result);
                            if let Some(err) = failed {
                                return self.drop_link(link, err).await;
                            }
                        }
                        SessionCommand::Unsubscribe { room_id, reply } => {
                            let result = if self.subscriptions.release(room_id) {
                                link.send(&ClientEvent::Unsubscribe { room_id }).await
                            } else {
                                Ok(())
                            };
                            let failed = result.clone().err();
                            let _ = reply.send(result);
                            if let Some(err) = failed {
                                return self.drop_link(link, err).await;
                            }
                        }
                        SessionCommand::Rebind { credential, reply } => {
                            info!(user_id = %credential.user_id(), "凭证已更新，重新打开链路");
                            self.credentials.replace(credential);
                            link.close().await;
                            let _ = reply.send(());
                            return Phase::Reconnecting { attempt: 0, immediate: true };
                        }
                        SessionCommand::Teardown { reply } => {
                            self.teardown_replies.push(reply);
                            link.close().await;
                            return Phase::Closed;
                        }
                    }
                }
                frame = link.recv() => {
                    match frame {
                        Ok(LinkFrame::Event(event)) => {
                            if self.inbound.send(event).await.is_err() {
                                debug!("入站事件的接收方已关闭");
                            }
                        }
                        Ok(LinkFrame::Undecodable(err)) => {
                            warn!(error = %err, "丢弃无法解码的入站帧");
                        }
                        Err(err) => {
                            warn!(error = %err, "实时链路断开");
                            self.emit(SessionSignal::Disconnected { reason: err.to_string() });
                            return Phase::Reconnecting { attempt: 0, immediate: false };
                        }
                    }
                }
            }
        }
    }

    async fn drop_link(&mut self, mut link: Box<dyn ChannelLink>, err: ConnectionError) -> Phase {
        warn!(error = %err, "发送失败，放弃当前链路");
        link.close().await;
        self.emit(SessionSignal::Disconnected {
            reason: err.to_string(),
        });
        Phase::Reconnecting {
            attempt: 0,
            immediate: false,
        }
    }

    async fn reconnect(&mut self, previous: u32, immediate: bool) -> Phase {
        let attempt = previous + 1;
        let max_attempts = self.policy.retry.max_attempts;
        if attempt > max_attempts {
            warn!(attempts = max_attempts, "重连次数已用尽");
            self.state.send_replace(ConnectionState::Disconnected);
            self.emit(SessionSignal::RetriesExhausted {
                attempts: max_attempts,
            });
            return Phase::Parked;
        }

        self.state.send_replace(ConnectionState::Connecting);
        let delay = if immediate {
            Duration::ZERO
        } else {
            self.policy.retry.backoff.delay_at(attempt)
        };
        info!(attempt, delay_ms = delay.as_millis() as u64, "准备重连");

        // 退避期间继续处理命令
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Phase::Closed;
                    };
                    if let Some(next) = self.handle_offline(command) {
                        return next;
                    }
                }
            }
        }

        let Some(credential) = self.credentials.current() else {
            warn!("没有可用的凭证，停止重连");
            return Phase::Parked;
        };

        match self.connector.connect(&credential).await {
            Ok(mut link) => {
                let rooms = self.subscriptions.rooms();
                for room_id in &rooms {
                    if let Err(err) = link
                        .send(&ClientEvent::Subscribe { room_id: *room_id })
                        .await
                    {
                        warn!(room_id = %room_id, error = %err, "恢复订阅失败");
                        link.close().await;
                        return Phase::Reconnecting {
                            attempt,
                            immediate: false,
                        };
                    }
                }
                info!(attempt, rooms = rooms.len(), "重连成功，订阅已恢复");
                self.state.send_replace(ConnectionState::Connected);
                self.emit(SessionSignal::Reconnected);
                Phase::Connected(link)
            }
            Err(err) if err.is_credential_rejection() => {
                warn!(error = %err, "重连握手被拒绝，等待新的凭证");
                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(SessionSignal::CredentialRejected {
                    reason: err.to_string(),
                });
                Phase::Parked
            }
            Err(err) => {
                warn!(attempt, error = %err, "重连失败");
                Phase::Reconnecting {
                    attempt,
                    immediate: false,
                }
            }
        }
    }

    async fn park(&mut self) -> Phase {
        self.state.send_replace(ConnectionState::Disconnected);
        loop {
            let Some(command) = self.commands.recv().await else {
                return Phase::Closed;
            };
            if let Some(next) = self.handle_offline(command) {
                return next;
            }
        }
    }

    /// 没有链路时的命令处理；返回值表示需要切换阶段
    fn handle_offline(&mut self, command: SessionCommand) -> Option<Phase> {
        match command {
            SessionCommand::Send { event, reply } => {
                debug!(event = event.name(), "链路未连接，拒绝发送");
                let _ = reply.send(Err(ConnectionError::NotConnected));
                None
            }
            SessionCommand::Subscribe { room_id, reply } => {
                // 重连成功后统一恢复
                self.subscriptions.acquire(room_id);
                let _ = reply.send(Ok(()));
                None
            }
            SessionCommand::Unsubscribe { room_id, reply } => {
                self.subscriptions.release(room_id);
                let _ = reply.send(Ok(()));
                None
            }
            SessionCommand::Rebind { credential, reply } => {
                info!(user_id = %credential.user_id(), "凭证已更新，立即重连");
                self.credentials.replace(credential);
                let _ = reply.send(());
                Some(Phase::Reconnecting {
                    attempt: 0,
                    immediate: true,
                })
            }
            SessionCommand::Teardown { reply } => {
                self.teardown_replies.push(reply);
                Some(Phase::Closed)
            }
        }
    }

    fn emit(&self, signal: SessionSignal) {
        if self.signals.send(signal).is_err() {
            debug!("没有会话信号的订阅者");
        }
    }
}
