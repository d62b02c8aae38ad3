//! 同步引擎
//!
//! 一个任务独占房间目录、当前时间线、生命周期追踪和通知中继，
//! 按到达顺序处理四类输入：界面命令、服务器推送、会话信号、后台 REST 请求的完成通知。
//! 网络调用都放到独立任务里执行，结果再回到事件循环，状态因此只在一个地方被修改。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{
    ClientEvent, DeliveryState, DomainError, Invitation, InvitationId, Lifecycle, LifecycleEvent,
    Message, MessageDraft, MessageId, Room, RoomEvent, RoomId, RoomRecord, ServerEvent, UserId,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::broadcaster::{EngineEvent, EngineEventBroadcaster, EngineEventStream};
use crate::channel::RealtimeChannel;
use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult, ConnectionError, RequestError};
use crate::lifecycle::{LifecycleChange, LifecycleTracker, SeenTransition};
use crate::notification::NotificationRelay;
use crate::retry::{retry_async, Backoff, RetryConfig};
use crate::room_directory::{ApplyOutcome, HydrationTicket, RoomDirectory};
use crate::session::SessionSignal;
use crate::timeline::{MessageTimeline, PageKind, PageTicket};

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub current_user: UserId,
    pub page_size: u32,
    pub command_capacity: usize,
    pub event_capacity: usize,
    /// 重连后重新水合使用的重试策略
    pub rehydrate_retry: RetryConfig,
}

impl EngineConfig {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            page_size: 10,
            command_capacity: 64,
            event_capacity: 256,
            rehydrate_retry: RetryConfig::new(
                5,
                Backoff::exponential(Duration::from_millis(500), Duration::from_secs(10)),
            ),
        }
    }
}

/// 引擎的外部协作方
#[derive(Clone)]
pub struct EngineDependencies {
    pub api: Arc<dyn ChatApi>,
    pub channel: Arc<dyn RealtimeChannel>,
    pub clock: Arc<dyn Clock>,
}

/// 一次翻页请求的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageResult {
    /// 本次请求的页码；历史已到头时为 `None`
    pub page: Option<u32>,
    pub exhausted: bool,
    /// 时间线当前的消息总数
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineItem {
    pub message: Message,
    pub optimistic: bool,
    pub state: Option<DeliveryState>,
}

/// 当前时间线的快照，新的在前
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineView {
    pub room_id: RoomId,
    pub generation: u64,
    pub exhausted: bool,
    pub items: Vec<TimelineItem>,
}

enum EngineCommand {
    Hydrate {
        reply: Reply<ApplicationResult<usize>>,
    },
    RefreshRoom {
        room_id: RoomId,
        reply: Reply<ApplicationResult<()>>,
    },
    OpenRoom {
        room_id: RoomId,
        reply: Reply<u64>,
    },
    CloseRoom {
        reply: Reply<()>,
    },
    FetchPage {
        reply: Reply<ApplicationResult<PageResult>>,
    },
    Submit {
        draft: MessageDraft,
        reply: Reply<ApplicationResult<MessageId>>,
    },
    Retry {
        message_id: MessageId,
        reply: Reply<ApplicationResult<()>>,
    },
    Discard {
        message_id: MessageId,
        reply: Reply<ApplicationResult<()>>,
    },
    MarkSeen {
        message_id: MessageId,
        in_view: bool,
        reply: Reply<ApplicationResult<bool>>,
    },
    ListInvitations {
        reply: Reply<ApplicationResult<Vec<Invitation>>>,
    },
    ResolveInvitation {
        invitation_id: InvitationId,
        accept: bool,
        reply: Reply<ApplicationResult<()>>,
    },
    InviteUser {
        room_id: RoomId,
        user_id: UserId,
        reply: Reply<ApplicationResult<()>>,
    },
    CreateGroup {
        name: String,
        reply: Reply<ApplicationResult<RoomId>>,
    },
    DismissAnnouncement {
        invitation_id: InvitationId,
        reply: Reply<bool>,
    },
    Rooms {
        reply: Reply<Vec<Room>>,
    },
    Room {
        room_id: RoomId,
        reply: Reply<Option<Room>>,
    },
    Timeline {
        reply: Reply<Option<TimelineView>>,
    },
    Lifecycle {
        message_id: MessageId,
        reply: Reply<Option<Lifecycle>>,
    },
    Announcements {
        reply: Reply<Vec<Invitation>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// 后台任务的完成通知
enum Completion {
    Hydrated {
        ticket: HydrationTicket,
        result: Result<Vec<RoomRecord>, RequestError>,
    },
    LastMessage {
        room_id: RoomId,
        result: Result<Option<Message>, RequestError>,
    },
    RoomDetails {
        room_id: RoomId,
        result: Result<RoomRecord, RequestError>,
        reply: Reply<ApplicationResult<()>>,
    },
    Page {
        ticket: PageTicket,
        result: Result<Vec<Message>, RequestError>,
    },
    SendFailed {
        message_id: MessageId,
        error: ConnectionError,
    },
    InvitationResolved {
        invitation_id: InvitationId,
        accepted: bool,
        result: Result<(), RequestError>,
        reply: Reply<ApplicationResult<()>>,
    },
    GroupCreated {
        result: Result<RoomRecord, RequestError>,
        reply: Reply<ApplicationResult<RoomId>>,
    },
}

/// 按顺序交给实时通道的出站操作
enum Outbound {
    Event(ClientEvent),
    Subscribe(RoomId),
    Unsubscribe(RoomId),
}

/// 界面层持有的引擎句柄
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: EngineEventBroadcaster,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineCommand,
    ) -> ApplicationResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ApplicationError::EngineClosed)?;
        rx.await.map_err(|_| ApplicationError::EngineClosed)
    }

    pub fn subscribe(&self) -> EngineEventStream {
        self.events.subscribe()
    }

    pub fn subscribe_room(&self, room_id: RoomId) -> EngineEventStream {
        self.events.subscribe_room(room_id)
    }

    /// 拉取房间列表快照，返回房间数
    pub async fn hydrate(&self) -> ApplicationResult<usize> {
        self.request(|reply| EngineCommand::Hydrate { reply }).await?
    }

    pub async fn refresh_room(&self, room_id: RoomId) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::RefreshRoom { room_id, reply })
            .await?
    }

    /// 打开房间时间线，返回新的代号
    pub async fn open_room(&self, room_id: RoomId) -> ApplicationResult<u64> {
        self.request(|reply| EngineCommand::OpenRoom { room_id, reply })
            .await
    }

    pub async fn close_room(&self) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::CloseRoom { reply }).await
    }

    /// 加载下一页更旧的消息
    pub async fn fetch_page(&self) -> ApplicationResult<PageResult> {
        self.request(|reply| EngineCommand::FetchPage { reply }).await?
    }

    pub async fn submit(&self, draft: MessageDraft) -> ApplicationResult<MessageId> {
        self.request(|reply| EngineCommand::Submit { draft, reply })
            .await?
    }

    pub async fn retry(&self, message_id: MessageId) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::Retry { message_id, reply })
            .await?
    }

    pub async fn discard(&self, message_id: MessageId) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::Discard { message_id, reply })
            .await?
    }

    /// 返回是否真的发出了已读标记
    pub async fn mark_seen(&self, message_id: MessageId, in_view: bool) -> ApplicationResult<bool> {
        self.request(|reply| EngineCommand::MarkSeen {
            message_id,
            in_view,
            reply,
        })
        .await?
    }

    pub async fn list_invitations(&self) -> ApplicationResult<Vec<Invitation>> {
        self.request(|reply| EngineCommand::ListInvitations { reply })
            .await?
    }

    pub async fn accept_invitation(&self, invitation_id: InvitationId) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::ResolveInvitation {
            invitation_id,
            accept: true,
            reply,
        })
        .await?
    }

    pub async fn reject_invitation(&self, invitation_id: InvitationId) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::ResolveInvitation {
            invitation_id,
            accept: false,
            reply,
        })
        .await?
    }

    pub async fn invite_user(&self, room_id: RoomId, user_id: UserId) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::InviteUser {
            room_id,
            user_id,
            reply,
        })
        .await?
    }

    pub async fn create_group(&self, name: impl Into<String>) -> ApplicationResult<RoomId> {
        let name = name.into();
        self.request(|reply| EngineCommand::CreateGroup { name, reply })
            .await?
    }

    pub async fn dismiss_announcement(&self, invitation_id: InvitationId) -> ApplicationResult<bool> {
        self.request(|reply| EngineCommand::DismissAnnouncement {
            invitation_id,
            reply,
        })
        .await
    }

    pub async fn rooms(&self) -> ApplicationResult<Vec<Room>> {
        self.request(|reply| EngineCommand::Rooms { reply }).await
    }

    pub async fn room(&self, room_id: RoomId) -> ApplicationResult<Option<Room>> {
        self.request(|reply| EngineCommand::Room { room_id, reply })
            .await
    }

    pub async fn timeline(&self) -> ApplicationResult<Option<TimelineView>> {
        self.request(|reply| EngineCommand::Timeline { reply }).await
    }

    pub async fn lifecycle(&self, message_id: MessageId) -> ApplicationResult<Option<Lifecycle>> {
        self.request(|reply| EngineCommand::Lifecycle { message_id, reply })
            .await
    }

    pub async fn announcements(&self) -> ApplicationResult<Vec<Invitation>> {
        self.request(|reply| EngineCommand::Announcements { reply })
            .await
    }

    pub async fn shutdown(&self) -> ApplicationResult<()> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }
}

pub struct SyncEngine {
    config: EngineConfig,
    api: Arc<dyn ChatApi>,
    clock: Arc<dyn Clock>,
    directory: RoomDirectory,
    timeline: Option<MessageTimeline>,
    generation: u64,
    tracker: LifecycleTracker,
    relay: NotificationRelay,
    events: EngineEventBroadcaster,
    outbound: mpsc::UnboundedSender<Outbound>,
    completions: mpsc::UnboundedSender<Completion>,
    hydration_waiters: Vec<(HydrationTicket, Reply<ApplicationResult<usize>>)>,
    /// 按请求序号登记的翻页等待者及其页码
    page_waiters: HashMap<u64, (u32, Reply<ApplicationResult<PageResult>>)>,
}

impl SyncEngine {
    /// 启动引擎任务
    ///
    /// `inbound` 和 `signals` 通常来自 `SessionManager::establish` 与 `SessionManager::signals`。
    pub fn spawn(
        config: EngineConfig,
        deps: EngineDependencies,
        inbound: mpsc::Receiver<ServerEvent>,
        signals: broadcast::Receiver<SessionSignal>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let events = EngineEventBroadcaster::new(config.event_capacity.max(1));

        tokio::spawn(forward_outbound(
            deps.channel,
            outbound_rx,
            completion_tx.clone(),
        ));

        let engine = SyncEngine {
            directory: RoomDirectory::new(config.current_user),
            tracker: LifecycleTracker::new(config.current_user),
            config,
            api: deps.api,
            clock: deps.clock,
            timeline: None,
            generation: 0,
            relay: NotificationRelay::new(),
            events: events.clone(),
            outbound: outbound_tx,
            completions: completion_tx,
            hydration_waiters: Vec::new(),
            page_waiters: HashMap::new(),
        };
        let task = tokio::spawn(engine.run(command_rx, completion_rx, inbound, signals));
        (
            EngineHandle {
                commands: command_tx,
                events,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut inbound: mpsc::Receiver<ServerEvent>,
        mut signals: broadcast::Receiver<SessionSignal>,
    ) {
        info!(user_id = %self.config.current_user, "同步引擎已启动");
        let mut inbound_open = true;
        let mut signals_open = true;

        loop {
            let deadline = self.relay.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => self.handle_server_event(event),
                    None => {
                        warn!("入站事件流已结束");
                        inbound_open = false;
                    }
                },
                signal = signals.recv(), if signals_open => match signal {
                    Ok(signal) => self.handle_signal(signal),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "会话信号落后，按重连处理");
                        self.fail_pending_sends("会话信号落后");
                        self.handle_signal(SessionSignal::Reconnected);
                    }
                    Err(broadcast::error::RecvError::Closed) => signals_open = false,
                },
                _ = sleep_until(deadline) => self.expire_announcements(),
            }
        }
        info!("同步引擎已停止");
    }

    fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    fn send_outbound(&self, outbound: Outbound) {
        if self.outbound.send(outbound).is_err() {
            warn!("出站转发任务已停止");
        }
    }

    // ---------------------------------------------------------------------
    // 命令
    // ---------------------------------------------------------------------

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Hydrate { reply } => {
                let ticket = self.directory.begin_hydration();
                self.hydration_waiters.push((ticket, reply));
                self.start_hydration(ticket, false);
            }
            EngineCommand::RefreshRoom { room_id, reply } => {
                let api = self.api.clone();
                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let result = api.fetch_room(room_id).await;
                    let _ = completions.send(Completion::RoomDetails {
                        room_id,
                        result,
                        reply,
                    });
                });
            }
            EngineCommand::OpenRoom { room_id, reply } => {
                let _ = reply.send(self.open_room(room_id));
            }
            EngineCommand::CloseRoom { reply } => {
                self.close_active();
                let _ = reply.send(());
            }
            EngineCommand::FetchPage { reply } => self.fetch_page(reply),
            EngineCommand::Submit { draft, reply } => {
                let _ = reply.send(self.submit(draft));
            }
            EngineCommand::Retry { message_id, reply } => {
                let _ = reply.send(self.retry(message_id));
            }
            EngineCommand::Discard { message_id, reply } => {
                let _ = reply.send(self.discard(message_id));
            }
            EngineCommand::MarkSeen {
                message_id,
                in_view,
                reply,
            } => {
                let _ = reply.send(self.mark_seen(message_id, in_view));
            }
            EngineCommand::ListInvitations { reply } => {
                let api = self.api.clone();
                tokio::spawn(async move {
                    let result = api.list_invitations().await.map_err(ApplicationError::from);
                    let _ = reply.send(result);
                });
            }
            EngineCommand::ResolveInvitation {
                invitation_id,
                accept,
                reply,
            } => {
                let api = self.api.clone();
                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let result = if accept {
                        api.accept_invitation(invitation_id).await
                    } else {
                        api.reject_invitation(invitation_id).await
                    };
                    let _ = completions.send(Completion::InvitationResolved {
                        invitation_id,
                        accepted: accept,
                        result,
                        reply,
                    });
                });
            }
            EngineCommand::InviteUser {
                room_id,
                user_id,
                reply,
            } => {
                let api = self.api.clone();
                tokio::spawn(async move {
                    let result = api
                        .invite_user(room_id, user_id)
                        .await
                        .map_err(ApplicationError::from);
                    let _ = reply.send(result);
                });
            }
            EngineCommand::CreateGroup { name, reply } => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    let _ = reply.send(Err(DomainError::validation_error(
                        "name",
                        "群组名称不能为空",
                    )
                    .into()));
                    return;
                }
                let api = self.api.clone();
                let completions = self.completions.clone();
                tokio::spawn(async move {
                    let result = api.create_group(&name).await;
                    let _ = completions.send(Completion::GroupCreated { result, reply });
                });
            }
            EngineCommand::DismissAnnouncement {
                invitation_id,
                reply,
            } => {
                let _ = reply.send(self.dismiss_announcement(invitation_id, false));
            }
            EngineCommand::Rooms { reply } => {
                let rooms = self.directory.rooms().into_iter().cloned().collect();
                let _ = reply.send(rooms);
            }
            EngineCommand::Room { room_id, reply } => {
                let _ = reply.send(self.directory.room(room_id).cloned());
            }
            EngineCommand::Timeline { reply } => {
                let _ = reply.send(self.timeline_view());
            }
            EngineCommand::Lifecycle { message_id, reply } => {
                let _ = reply.send(self.tracker.get(message_id).cloned());
            }
            EngineCommand::Announcements { reply } => {
                let active = self
                    .relay
                    .active()
                    .into_iter()
                    .map(|announcement| announcement.invitation.clone())
                    .collect();
                let _ = reply.send(active);
            }
            EngineCommand::Shutdown { reply } => {
                // 由事件循环处理
                let _ = reply.send(());
            }
        }
    }

    fn start_hydration(&self, ticket: HydrationTicket, with_retry: bool) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        let retry = self.config.rehydrate_retry.clone();
        tokio::spawn(async move {
            let result = if with_retry {
                retry_async(&retry, || api.list_rooms()).await
            } else {
                api.list_rooms().await
            };
            let _ = completions.send(Completion::Hydrated { ticket, result });
        });
    }

    fn rehydrate(&mut self, with_retry: bool) {
        let ticket = self.directory.begin_hydration();
        self.start_hydration(ticket, with_retry);
    }

    /// 重新同步按水合的重试策略退避重试，普通翻页失败直接交给调用方
    fn start_page(&self, ticket: PageTicket, page_size: u32) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        let retry = self.config.rehydrate_retry.clone();
        tokio::spawn(async move {
            let fetch = || api.fetch_messages(ticket.room_id, ticket.page, page_size);
            let result = match ticket.kind {
                PageKind::Resync => retry_async(&retry, fetch).await,
                PageKind::History => fetch().await,
            };
            let _ = completions.send(Completion::Page { ticket, result });
        });
    }

    fn open_room(&mut self, room_id: RoomId) -> u64 {
        self.close_active();
        self.generation += 1;
        let generation = self.generation;
        self.timeline = Some(MessageTimeline::new(
            room_id,
            generation,
            self.config.page_size,
        ));
        self.send_outbound(Outbound::Subscribe(room_id));
        info!(room_id = %room_id, generation, "打开房间时间线");
        self.publish(EngineEvent::TimelineChanged {
            room_id,
            generation,
        });
        generation
    }

    /// 关闭当前时间线，未完成的翻页请求一律作废
    fn close_active(&mut self) {
        let Some(timeline) = self.timeline.take() else {
            return;
        };
        for (_, (_, reply)) in self.page_waiters.drain() {
            let _ = reply.send(Err(ApplicationError::Discarded));
        }
        self.send_outbound(Outbound::Unsubscribe(timeline.room_id()));
        let forgotten = self.tracker.forget_room(timeline.room_id());
        debug!(
            room_id = %timeline.room_id(),
            generation = timeline.generation(),
            forgotten,
            "关闭房间时间线"
        );
    }

    fn fetch_page(&mut self, reply: Reply<ApplicationResult<PageResult>>) {
        let Some(timeline) = self.timeline.as_mut() else {
            let _ = reply.send(Err(ApplicationError::not_found("timeline", "active")));
            return;
        };
        match timeline.request_page() {
            None => {
                let _ = reply.send(Ok(PageResult {
                    page: None,
                    exhausted: true,
                    total: timeline.len(),
                }));
            }
            Some(ticket) => {
                let page_size = timeline.page_size();
                debug!(room_id = %ticket.room_id, page = ticket.page, "请求历史分页");
                self.page_waiters.insert(ticket.seq, (ticket.page, reply));
                self.start_page(ticket, page_size);
            }
        }
    }

    fn submit(&mut self, draft: MessageDraft) -> ApplicationResult<MessageId> {
        let room_id = draft.room_id;
        let body = draft.validate()?;
        let now = self.clock.now();
        let current_user = self.config.current_user;
        let Some(timeline) = self
            .timeline
            .as_mut()
            .filter(|timeline| timeline.room_id() == room_id)
        else {
            return Err(ApplicationError::not_found("timeline", room_id));
        };

        let message = Message::optimistic(MessageId::generate(), room_id, current_user, body, now);
        let message_id = message.id;
        let generation = timeline.generation();
        timeline.submit_optimistic(message.clone());
        self.tracker.track_optimistic(message_id, room_id);

        self.send_outbound(Outbound::Event(ClientEvent::SendMessage {
            client_message_id: message_id,
            room_id,
            body: message.body,
        }));
        debug!(room_id = %room_id, message_id = %message_id, "提交乐观消息");
        self.publish(EngineEvent::TimelineChanged {
            room_id,
            generation,
        });
        self.publish(EngineEvent::MessageStateChanged {
            room_id,
            message_id,
            state: DeliveryState::Pending,
        });
        Ok(message_id)
    }

    fn require_failed(&self, message_id: MessageId) -> ApplicationResult<()> {
        let lifecycle = self
            .tracker
            .get(message_id)
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
        if lifecycle.state() != DeliveryState::Failed {
            return Err(DomainError::business_rule_violation("只能处理发送失败的消息").into());
        }
        Ok(())
    }

    fn retry(&mut self, message_id: MessageId) -> ApplicationResult<()> {
        self.require_failed(message_id)?;
        let message = self
            .timeline
            .as_ref()
            .and_then(|timeline| timeline.get(message_id))
            .map(|entry| entry.message.clone())
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;

        if let Some(change) = self.tracker.apply(message_id, &LifecycleEvent::Retry) {
            self.publish_change(&change);
        }
        info!(message_id = %message_id, "重新发送消息");
        self.send_outbound(Outbound::Event(ClientEvent::SendMessage {
            client_message_id: message_id,
            room_id: message.room_id,
            body: message.body,
        }));
        Ok(())
    }

    fn discard(&mut self, message_id: MessageId) -> ApplicationResult<()> {
        self.require_failed(message_id)?;
        let timeline = self
            .timeline
            .as_mut()
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
        let removed = timeline
            .discard(message_id)
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
        let generation = timeline.generation();
        self.tracker.forget(message_id);
        debug!(message_id = %message_id, "丢弃发送失败的消息");
        self.publish(EngineEvent::TimelineChanged {
            room_id: removed.room_id,
            generation,
        });
        Ok(())
    }

    fn mark_seen(&mut self, message_id: MessageId, in_view: bool) -> ApplicationResult<bool> {
        let message = self
            .timeline
            .as_ref()
            .and_then(|timeline| timeline.get(message_id))
            .map(|entry| entry.message.clone())
            .ok_or_else(|| ApplicationError::not_found("message", message_id))?;
        match self.tracker.request_seen(&message, in_view) {
            Some(transition) => {
                self.apply_seen(transition);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 已读列表、未读数与 `mark-seen` 在同一步里完成
    fn apply_seen(&mut self, transition: SeenTransition) {
        let change = self.tracker.commit_seen(&transition);
        if let Some(timeline) = self.timeline.as_mut() {
            timeline.mark_seen_by(transition.message_id, &[transition.viewer]);
        }
        let outcome = self.directory.apply_event(RoomEvent::MessageSeen {
            room_id: transition.room_id,
            message_id: transition.message_id,
        });
        self.send_outbound(Outbound::Event(ClientEvent::MarkSeen {
            message_id: transition.message_id,
        }));
        self.publish_change(&change);
        if outcome == ApplyOutcome::Applied {
            self.publish(EngineEvent::RoomUpdated {
                room_id: transition.room_id,
            });
        }
    }

    fn dismiss_announcement(&mut self, invitation_id: InvitationId, expired: bool) -> bool {
        if self.relay.dismiss(invitation_id).is_none() {
            return false;
        }
        self.publish(EngineEvent::InvitationDismissed {
            invitation_id,
            expired,
        });
        true
    }

    fn timeline_view(&self) -> Option<TimelineView> {
        let timeline = self.timeline.as_ref()?;
        let items = timeline
            .entries()
            .into_iter()
            .map(|entry| TimelineItem {
                message: entry.message.clone(),
                optimistic: entry.optimistic,
                state: self
                    .tracker
                    .get(entry.message.id)
                    .map(Lifecycle::indicator),
            })
            .collect();
        Some(TimelineView {
            room_id: timeline.room_id(),
            generation: timeline.generation(),
            exhausted: timeline.is_exhausted(),
            items,
        })
    }

    fn shutdown(&mut self) {
        self.close_active();
        for (_, reply) in self.hydration_waiters.drain(..) {
            let _ = reply.send(Err(ApplicationError::EngineClosed));
        }
        self.relay.clear();
    }

    // ---------------------------------------------------------------------
    // 后台完成
    // ---------------------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Hydrated { ticket, result } => self.finish_hydration(ticket, result),
            Completion::LastMessage { room_id, result } => match result {
                Ok(Some(message)) => {
                    if self.directory.set_last_message(&message) {
                        self.publish(EngineEvent::RoomUpdated { room_id });
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(room_id = %room_id, error = %err, "拉取最后消息失败"),
            },
            Completion::RoomDetails {
                room_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(record) => {
                        self.directory.upsert_room(record);
                        self.publish(EngineEvent::RoomUpdated { room_id });
                        Ok(())
                    }
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "刷新房间信息失败");
                        Err(err.into())
                    }
                };
                let _ = reply.send(outcome);
            }
            Completion::Page { ticket, result } => self.finish_page(ticket, result),
            Completion::SendFailed { message_id, error } => {
                warn!(message_id = %message_id, error = %error, "消息发送失败");
                self.apply_lifecycle(message_id, LifecycleEvent::TransportFailed);
            }
            Completion::InvitationResolved {
                invitation_id,
                accepted,
                result,
                reply,
            } => {
                if result.is_ok() {
                    self.dismiss_announcement(invitation_id, false);
                    if accepted {
                        info!(invitation_id = %invitation_id, "已接受邀请，刷新房间目录");
                        self.rehydrate(false);
                    }
                }
                let _ = reply.send(result.map_err(ApplicationError::from));
            }
            Completion::GroupCreated { result, reply } => {
                let outcome = match result {
                    Ok(record) => {
                        let room_id = record.id;
                        self.directory.upsert_room(record);
                        self.publish(EngineEvent::RoomUpdated { room_id });
                        info!(room_id = %room_id, "群组已创建");
                        self.rehydrate(false);
                        Ok(room_id)
                    }
                    Err(err) => Err(err.into()),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn finish_hydration(
        &mut self,
        ticket: HydrationTicket,
        result: Result<Vec<RoomRecord>, RequestError>,
    ) {
        let outcome = match result {
            Ok(records) => self.directory.complete_hydration(ticket, records),
            Err(err) => Err(self.directory.fail_hydration(ticket, err)),
        };

        match &outcome {
            Ok(report) => {
                self.publish(EngineEvent::DirectoryHydrated {
                    rooms: report.rooms,
                });
                for room_id in &report.missing_last_message {
                    self.fetch_last_message(*room_id);
                }
                if report.stale {
                    info!("重放时发现未知房间，重新水合");
                    self.rehydrate(false);
                }
            }
            Err(ApplicationError::Discarded) => {}
            Err(err) => {
                warn!(error = %err, "房间目录水合失败，保留原有状态");
                self.publish(EngineEvent::DirectoryHydrationFailed {
                    reason: err.to_string(),
                });
            }
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .hydration_waiters
            .drain(..)
            .partition(|(waiting_for, _)| *waiting_for == ticket);
        self.hydration_waiters = waiting;
        for (_, reply) in ready {
            let _ = reply.send(outcome.clone().map(|report| report.rooms));
        }
    }

    fn fetch_last_message(&self, room_id: RoomId) {
        let api = self.api.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = api.fetch_last_message(room_id).await;
            let _ = completions.send(Completion::LastMessage { room_id, result });
        });
    }

    fn finish_page(&mut self, ticket: PageTicket, result: Result<Vec<Message>, RequestError>) {
        let Some(timeline) = self
            .timeline
            .as_mut()
            .filter(|timeline| timeline.owns(&ticket))
        else {
            debug!(room_id = %ticket.room_id, generation = ticket.generation, "丢弃已切换房间的分页响应");
            return;
        };

        let outcome = timeline.complete_page(ticket, result);
        let total = timeline.len();
        let exhausted = timeline.is_exhausted();
        let room_id = timeline.room_id();
        let generation = timeline.generation();
        // 已经不在等待队列里的请求：被失败回退作废，或者历史已到头
        let settled: Vec<u64> = self
            .page_waiters
            .keys()
            .copied()
            .filter(|seq| !timeline.is_outstanding(*seq))
            .collect();

        match outcome {
            Ok(outcome) => {
                for message in &outcome.ingested {
                    let change = self.tracker.observe(message);
                    if change.changed() {
                        self.publish_change(&change);
                    }
                }
                if !outcome.ingested.is_empty() {
                    self.publish(EngineEvent::TimelineChanged {
                        room_id,
                        generation,
                    });
                }
                if ticket.kind == PageKind::Resync {
                    debug!(room_id = %room_id, "重新同步完成");
                }
                for seq in settled {
                    let Some((page, reply)) = self.page_waiters.remove(&seq) else {
                        continue;
                    };
                    let result = if outcome.applied.contains(&seq) {
                        Ok(PageResult {
                            page: Some(page),
                            exhausted,
                            total,
                        })
                    } else if exhausted {
                        Ok(PageResult {
                            page: None,
                            exhausted,
                            total,
                        })
                    } else {
                        Err(ApplicationError::Discarded)
                    };
                    let _ = reply.send(result);
                }
            }
            Err(err) => {
                if ticket.kind == PageKind::Resync {
                    warn!(room_id = %room_id, error = %err, "重新同步失败，时间线可能缺少断线期间的消息");
                    self.publish(EngineEvent::TimelineResyncFailed {
                        room_id,
                        reason: err.to_string(),
                    });
                }
                for seq in settled {
                    let Some((_, reply)) = self.page_waiters.remove(&seq) else {
                        continue;
                    };
                    let result = if seq == ticket.seq {
                        Err(err.clone())
                    } else {
                        Err(ApplicationError::Discarded)
                    };
                    let _ = reply.send(result);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // 服务器推送
    // ---------------------------------------------------------------------

    fn handle_server_event(&mut self, event: ServerEvent) {
        debug!(event = event.name(), "处理服务器事件");
        match event {
            ServerEvent::Message(message) => self.on_message(message),
            ServerEvent::DeliveryAck { message_id } => {
                self.apply_lifecycle(message_id, LifecycleEvent::DeliveryAck);
            }
            ServerEvent::SeenUpdate {
                message_id,
                seen_by,
            } => {
                if let Some(timeline) = self.timeline.as_mut() {
                    if timeline.mark_seen_by(message_id, &seen_by) {
                        let (room_id, generation) = (timeline.room_id(), timeline.generation());
                        self.publish(EngineEvent::TimelineChanged {
                            room_id,
                            generation,
                        });
                    }
                }
                self.apply_lifecycle(message_id, LifecycleEvent::SeenBy(seen_by));
            }
            ServerEvent::Invitation(invitation) => {
                if self.relay.announce(invitation.clone(), Instant::now()) {
                    info!(invitation_id = %invitation.id, room = %invitation.room.name, "收到房间邀请");
                    self.publish(EngineEvent::InvitationAnnounced(invitation));
                }
            }
            ServerEvent::MembershipChange {
                room_id,
                user_id,
                change,
            } => self.apply_room_event(RoomEvent::MembershipChange {
                room_id,
                user_id,
                change,
            }),
            ServerEvent::SendRejected {
                client_message_id,
                reason,
            } => {
                warn!(
                    message_id = %client_message_id,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "服务器拒绝了消息"
                );
                self.apply_lifecycle(client_message_id, LifecycleEvent::TransportFailed);
            }
        }
    }

    fn on_message(&mut self, message: Message) {
        self.apply_room_event(RoomEvent::NewMessage(message.clone()));

        let mut in_view = false;
        if let Some(timeline) = self
            .timeline
            .as_mut()
            .filter(|timeline| timeline.room_id() == message.room_id)
        {
            timeline.ingest_push(message.clone());
            in_view = true;
            let (room_id, generation) = (timeline.room_id(), timeline.generation());
            self.publish(EngineEvent::TimelineChanged {
                room_id,
                generation,
            });
        }
        if in_view || self.tracker.contains(message.id) {
            let change = self.tracker.observe(&message);
            if change.changed() {
                self.publish_change(&change);
            }
        }
    }

    fn apply_room_event(&mut self, event: RoomEvent) {
        let room_id = event.room_id();
        match self.directory.apply_event(event) {
            ApplyOutcome::Applied => self.publish(EngineEvent::RoomUpdated { room_id }),
            ApplyOutcome::RoomRemoved => {
                if self
                    .timeline
                    .as_ref()
                    .map_or(false, |timeline| timeline.room_id() == room_id)
                {
                    self.close_active();
                }
                self.publish(EngineEvent::RoomRemoved { room_id });
            }
            ApplyOutcome::HydrationRequired(ticket) => {
                info!(room_id = %room_id, "遇到未知房间，重新水合目录");
                self.start_hydration(ticket, false);
            }
            ApplyOutcome::HydrationPending | ApplyOutcome::Ignored => {}
        }
    }

    fn apply_lifecycle(&mut self, message_id: MessageId, event: LifecycleEvent) {
        if let Some(change) = self.tracker.apply(message_id, &event) {
            if change.changed() {
                self.publish_change(&change);
            }
        }
    }

    fn publish_change(&self, change: &LifecycleChange) {
        self.publish(EngineEvent::MessageStateChanged {
            room_id: change.room_id,
            message_id: change.message_id,
            state: change.after.indicator(),
        });
    }

    // ---------------------------------------------------------------------
    // 会话信号与定时器
    // ---------------------------------------------------------------------

    fn handle_signal(&mut self, signal: SessionSignal) {
        if let SessionSignal::Disconnected { reason } = &signal {
            self.fail_pending_sends(reason);
        }
        if signal == SessionSignal::Reconnected {
            info!("会话已重连，重新同步房间目录和当前时间线");
            self.rehydrate(true);
            if let Some(timeline) = self.timeline.as_mut() {
                let ticket = timeline.resync_ticket();
                let page_size = timeline.page_size();
                self.start_page(ticket, page_size);
            }
        }
        self.publish(EngineEvent::Session(signal));
    }

    /// 断线时还没确认的发送都视为失败，交给用户重试或丢弃；
    /// 服务器其实已经收到的会在重新同步时被确认
    fn fail_pending_sends(&mut self, reason: &str) {
        let changes = self.tracker.fail_pending();
        if changes.is_empty() {
            return;
        }
        warn!(count = changes.len(), reason, "链路断开，未确认的消息标记为发送失败");
        for change in &changes {
            self.publish_change(change);
        }
    }

    fn expire_announcements(&mut self) {
        for announcement in self.relay.expire(Instant::now()) {
            debug!(invitation_id = %announcement.id(), "邀请公告已过期");
            self.publish(EngineEvent::InvitationDismissed {
                invitation_id: announcement.id(),
                expired: true,
            });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 出站转发任务，保证发送、订阅和退订按提交顺序到达通道
async fn forward_outbound(
    channel: Arc<dyn RealtimeChannel>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Event(event) => {
                let name = event.name();
                let pending_send = match &event {
                    ClientEvent::SendMessage {
                        client_message_id, ..
                    } => Some(*client_message_id),
                    _ => None,
                };
                if let Err(error) = channel.send(event).await {
                    match pending_send {
                        Some(message_id) => {
                            let _ = completions.send(Completion::SendFailed { message_id, error });
                        }
                        None => warn!(event = name, error = %error, "出站事件发送失败"),
                    }
                }
            }
            Outbound::Subscribe(room_id) => {
                if let Err(error) = channel.subscribe(room_id).await {
                    warn!(room_id = %room_id, error = %error, "订阅房间失败");
                }
            }
            Outbound::Unsubscribe(room_id) => {
                if let Err(error) = channel.unsubscribe(room_id).await {
                    warn!(room_id = %room_id, error = %error, "退订房间失败");
                }
            }
        }
    }
    debug!("出站转发任务结束");
}
