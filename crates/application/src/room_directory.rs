//! 房间目录
//!
//! 维护房间 ID 到房间聚合的映射，把 REST 快照和实时增量合并在一起。
//! 水合进行中收到的事件会立即生效并同时缓冲；快照到达后整体替换状态，
//! 再把缓冲区重放到快照之上。快照已经反映的消息在重放时不会重复计数。

use std::collections::{HashMap, HashSet};

use domain::{MembershipChangeKind, Message, MessageId, Room, RoomEvent, RoomId, RoomRecord, UserId};
use tracing::{debug, info};

use crate::error::{ApplicationError, ApplicationResult, RequestError};

/// 一次水合请求的票据，较新的票据会取代旧的
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HydrationTicket(u64);

/// `apply_event` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// 重复推送或对未知房间无意义的事件
    Ignored,
    /// 当前用户离开，房间已移除
    RoomRemoved,
    /// 目录已过期，需要用这个票据发起水合
    HydrationRequired(HydrationTicket),
    /// 目录已过期，但已有水合在进行
    HydrationPending,
}

/// 一次水合完成后的汇总
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HydrationReport {
    pub rooms: usize,
    pub replayed: usize,
    /// 快照里没有最后消息的房间，需要单独拉取
    pub missing_last_message: Vec<RoomId>,
    /// 重放时遇到了快照里没有的房间
    pub stale: bool,
}

struct PendingHydration {
    ticket: HydrationTicket,
    buffer: Vec<RoomEvent>,
}

pub struct RoomDirectory {
    current_user: UserId,
    rooms: HashMap<RoomId, Room>,
    counted: HashSet<MessageId>,
    pending: Option<PendingHydration>,
    next_ticket: u64,
}

impl RoomDirectory {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            rooms: HashMap::new(),
            counted: HashSet::new(),
            pending: None,
            next_ticket: 0,
        }
    }

    /// 开始一次水合，之前未完成的水合被取代，但其缓冲的事件保留
    pub fn begin_hydration(&mut self) -> HydrationTicket {
        self.next_ticket += 1;
        let ticket = HydrationTicket(self.next_ticket);
        let buffer = self
            .pending
            .take()
            .map(|pending| pending.buffer)
            .unwrap_or_default();
        self.pending = Some(PendingHydration { ticket, buffer });
        debug!(ticket = ticket.0, "开始水合房间目录");
        ticket
    }

    pub fn is_hydrating(&self) -> bool {
        self.pending.is_some()
    }

    fn is_current(&self, ticket: HydrationTicket) -> bool {
        self.pending
            .as_ref()
            .map_or(false, |pending| pending.ticket == ticket)
    }

    /// 用快照整体替换目录状态，再重放缓冲的事件
    pub fn complete_hydration(
        &mut self,
        ticket: HydrationTicket,
        records: Vec<RoomRecord>,
    ) -> ApplicationResult<HydrationReport> {
        if !self.is_current(ticket) {
            debug!(ticket = ticket.0, "丢弃被取代的水合结果");
            return Err(ApplicationError::Discarded);
        }
        let buffer = self
            .pending
            .take()
            .map(|pending| pending.buffer)
            .unwrap_or_default();

        self.rooms = records
            .into_iter()
            .map(|record| (record.id, Room::from(record)))
            .collect();
        // 快照的未读数已经包含了各房间的最后消息；之前记下的 ID 随快照一起作废
        self.counted = self
            .rooms
            .values()
            .filter_map(|room| room.last_message.as_ref().map(|last| last.message_id))
            .collect();

        let mut report = HydrationReport {
            rooms: self.rooms.len(),
            ..HydrationReport::default()
        };

        let mut replayed_messages = HashSet::new();
        for event in buffer {
            match &event {
                RoomEvent::NewMessage(message) => {
                    if !replayed_messages.insert(message.id) {
                        continue;
                    }
                    self.counted.insert(message.id);
                    match self.rooms.get_mut(&message.room_id) {
                        None => report.stale = true,
                        Some(room) if room.reflects(message) => {}
                        Some(room) => {
                            room.record_message(message);
                            if !message.is_from(self.current_user) {
                                room.increment_unread();
                            }
                            report.replayed += 1;
                        }
                    }
                }
                RoomEvent::MembershipChange {
                    room_id,
                    user_id,
                    change: MembershipChangeKind::Joined,
                } if *user_id == self.current_user && !self.rooms.contains_key(room_id) => {
                    report.stale = true;
                }
                RoomEvent::MessageSeen {
                    room_id,
                    message_id,
                } if self
                    .rooms
                    .get(room_id)
                    .map_or(false, |room| room.last_seen_by(*message_id, self.current_user)) =>
                {
                    debug!(room_id = %room_id, message_id = %message_id, "快照已反映该已读，跳过重放");
                }
                _ => {
                    if self.apply_now(&event) == ApplyOutcome::Applied {
                        report.replayed += 1;
                    }
                }
            }
        }

        report.missing_last_message = self
            .rooms
            .values()
            .filter(|room| room.last_message.is_none())
            .map(|room| room.id)
            .collect();

        info!(
            rooms = report.rooms,
            replayed = report.replayed,
            "房间目录水合完成"
        );
        Ok(report)
    }

    /// 水合失败，保留原有状态；缓冲的事件已经生效过，直接丢弃
    pub fn fail_hydration(&mut self, ticket: HydrationTicket, err: RequestError) -> ApplicationError {
        if !self.is_current(ticket) {
            return ApplicationError::Discarded;
        }
        self.pending = None;
        ApplicationError::Request(err)
    }

    /// 应用一条房间级事件
    pub fn apply_event(&mut self, event: RoomEvent) -> ApplyOutcome {
        if let Some(pending) = self.pending.as_mut() {
            pending.buffer.push(event.clone());
        }
        let outcome = self.apply_now(&event);
        if let ApplyOutcome::HydrationRequired(_) = outcome {
            // 新水合要能重放触发它的这条事件
            if let Some(pending) = self.pending.as_mut() {
                pending.buffer.push(event);
            }
        }
        outcome
    }

    fn stale_directory(&mut self) -> ApplyOutcome {
        if self.is_hydrating() {
            ApplyOutcome::HydrationPending
        } else {
            ApplyOutcome::HydrationRequired(self.begin_hydration())
        }
    }

    fn apply_now(&mut self, event: &RoomEvent) -> ApplyOutcome {
        match event {
            RoomEvent::NewMessage(message) => {
                if !self.rooms.contains_key(&message.room_id) {
                    debug!(room_id = %message.room_id, "未知房间的新消息，目录需要重新水合");
                    return self.stale_directory();
                }
                if !self.counted.insert(message.id) {
                    debug!(message_id = %message.id, "重复推送，忽略");
                    return ApplyOutcome::Ignored;
                }
                let current_user = self.current_user;
                let Some(room) = self.rooms.get_mut(&message.room_id) else {
                    return ApplyOutcome::Ignored;
                };
                room.record_message(message);
                if !message.is_from(current_user) {
                    room.increment_unread();
                }
                ApplyOutcome::Applied
            }
            RoomEvent::MembershipChange {
                room_id,
                user_id,
                change,
            } => {
                let is_self = *user_id == self.current_user;
                let Some(room) = self.rooms.get_mut(room_id) else {
                    return if is_self && *change == MembershipChangeKind::Joined {
                        self.stale_directory()
                    } else {
                        ApplyOutcome::Ignored
                    };
                };
                match change {
                    MembershipChangeKind::Joined => {
                        room.add_member(*user_id);
                    }
                    MembershipChangeKind::Left if is_self => {
                        self.rooms.remove(room_id);
                        info!(room_id = %room_id, "当前用户已离开房间");
                        return ApplyOutcome::RoomRemoved;
                    }
                    MembershipChangeKind::Left => {
                        room.remove_member(*user_id);
                    }
                    MembershipChangeKind::PromotedToAdmin => {
                        room.promote(*user_id);
                    }
                }
                ApplyOutcome::Applied
            }
            RoomEvent::MessageSeen { room_id, .. } => {
                if self.decrement_unread(*room_id) {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::Ignored
                }
            }
        }
    }

    pub fn increment_unread(&mut self, room_id: RoomId) -> bool {
        match self.rooms.get_mut(&room_id) {
            Some(room) => {
                room.increment_unread();
                true
            }
            None => false,
        }
    }

    /// 不会低于零
    pub fn decrement_unread(&mut self, room_id: RoomId) -> bool {
        self.rooms
            .get_mut(&room_id)
            .map_or(false, |room| room.decrement_unread())
    }

    /// 单独拉取到的最后消息，只在比现有的更新时生效，不影响未读数
    pub fn set_last_message(&mut self, message: &Message) -> bool {
        self.rooms
            .get_mut(&message.room_id)
            .map_or(false, |room| room.record_message(message))
    }

    /// 插入本地创建或推送来的新房间；已存在时只刷新描述信息
    pub fn upsert_room(&mut self, record: RoomRecord) {
        match self.rooms.get_mut(&record.id) {
            Some(room) => room.apply_details(&record),
            None => {
                self.rooms.insert(record.id, Room::from(record));
            }
        }
    }

    pub fn room(&self, room_id: RoomId) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    /// 按最近活跃时间倒序，其次按名称
    pub fn rooms(&self) -> Vec<&Room> {
        let mut rooms: Vec<&Room> = self.rooms.values().collect();
        rooms.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.name.cmp(&b.name))
        });
        rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
        self.counted.clear();
        self.pending = None;
    }
}
