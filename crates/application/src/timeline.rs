//! 消息时间线（每个正在查看的房间一个）
//!
//! 把历史分页、实时推送和本地乐观发送合并成按 ID 去重的有序缓存。
//! 显示顺序为 `created_at` 倒序，时间相同时按插入序号正序。
//! 分页响应按请求顺序生效，即使它们乱序到达。

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use domain::{Message, MessageId, RoomId, Timestamp, UserId};
use tracing::{debug, warn};

use crate::error::{ApplicationError, ApplicationResult, RequestError};

/// 时间线中的一条记录
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: Message,
    /// 插入序号，服务器回显合并后保持不变
    pub seq: u64,
    /// 是否为尚未被服务器确认的本地消息
    pub optimistic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// 向更旧的方向翻页
    History,
    /// 重连后重新拉取第一页，不移动游标
    Resync,
}

/// 一次分页请求的票据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    pub room_id: RoomId,
    pub generation: u64,
    pub seq: u64,
    pub page: u32,
    pub kind: PageKind,
}

/// 分页响应生效后的结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageOutcome {
    /// 本次生效的请求序号（按顺序），响应被缓冲时为空
    pub applied: Vec<u64>,
    /// 生效的全部消息（含与已有记录合并的）
    pub ingested: Vec<Message>,
    /// 新插入的条目数
    pub inserted: usize,
    pub exhausted: bool,
}

/// `ingest_push` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    /// 与已有记录合并；`was_optimistic` 表示这是乐观消息的回显
    Merged { was_optimistic: bool },
}

pub struct MessageTimeline {
    room_id: RoomId,
    generation: u64,
    page_size: u32,
    entries: HashMap<MessageId, TimelineEntry>,
    order: BTreeMap<(Reverse<Timestamp>, u64), MessageId>,
    next_insert: u64,
    /// 下一次要请求的页码
    next_page: u32,
    exhausted: bool,
    next_request: u64,
    /// 已发出但尚未生效的历史分页：请求序号 -> 页码
    outstanding: BTreeMap<u64, u32>,
    /// 提前到达、等待前序分页的响应
    arrived: BTreeMap<u64, Vec<Message>>,
}

impl MessageTimeline {
    pub fn new(room_id: RoomId, generation: u64, page_size: u32) -> Self {
        Self {
            room_id,
            generation,
            page_size,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_insert: 0,
            next_page: 1,
            exhausted: false,
            next_request: 0,
            outstanding: BTreeMap::new(),
            arrived: BTreeMap::new(),
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    /// 票据是否属于当前时间线
    pub fn owns(&self, ticket: &PageTicket) -> bool {
        ticket.room_id == self.room_id && ticket.generation == self.generation
    }

    /// 请求下一页更旧的消息；历史已到头时返回 `None`
    pub fn request_page(&mut self) -> Option<PageTicket> {
        if self.exhausted {
            return None;
        }
        let ticket = self.ticket(self.next_page, PageKind::History);
        self.outstanding.insert(ticket.seq, ticket.page);
        self.next_page += 1;
        Some(ticket)
    }

    /// 重连后的重新同步票据
    pub fn resync_ticket(&mut self) -> PageTicket {
        self.ticket(1, PageKind::Resync)
    }

    fn ticket(&mut self, page: u32, kind: PageKind) -> PageTicket {
        self.next_request += 1;
        PageTicket {
            room_id: self.room_id,
            generation: self.generation,
            seq: self.next_request,
            page,
            kind,
        }
    }

    /// 分页响应到达
    pub fn complete_page(
        &mut self,
        ticket: PageTicket,
        result: Result<Vec<Message>, RequestError>,
    ) -> ApplicationResult<PageOutcome> {
        if !self.owns(&ticket) {
            return Err(ApplicationError::Discarded);
        }
        match ticket.kind {
            PageKind::Resync => {
                let messages = result?;
                let mut outcome = PageOutcome::default();
                self.absorb(messages, &mut outcome);
                debug!(room_id = %self.room_id, merged = outcome.ingested.len(), "重新同步第一页");
                Ok(outcome)
            }
            PageKind::History => {
                if !self.outstanding.contains_key(&ticket.seq) {
                    debug!(room_id = %self.room_id, seq = ticket.seq, "丢弃已失效的分页响应");
                    return Err(ApplicationError::Discarded);
                }
                match result {
                    Ok(messages) => {
                        self.arrived.insert(ticket.seq, messages);
                        Ok(self.drain_in_order())
                    }
                    Err(err) => {
                        self.rewind(ticket.seq, ticket.page);
                        warn!(room_id = %self.room_id, page = ticket.page, error = %err, "分页请求失败");
                        Err(ApplicationError::Request(err))
                    }
                }
            }
        }
    }

    /// 依次应用从最早的未完成请求开始、已经到达的响应
    fn drain_in_order(&mut self) -> PageOutcome {
        let mut outcome = PageOutcome::default();
        loop {
            let Some((seq, page)) = self
                .outstanding
                .first_key_value()
                .map(|(seq, page)| (*seq, *page))
            else {
                break;
            };
            let Some(messages) = self.arrived.remove(&seq) else {
                break;
            };
            self.outstanding.remove(&seq);
            outcome.applied.push(seq);
            if messages.is_empty() {
                debug!(room_id = %self.room_id, page, "历史消息已到头");
                self.exhausted = true;
                self.outstanding.clear();
                self.arrived.clear();
                break;
            }
            self.absorb(messages, &mut outcome);
        }
        outcome.exhausted = self.exhausted;
        outcome
    }

    /// 失败的分页使它之后的请求全部失效，游标回退到失败的页码
    fn rewind(&mut self, failed_seq: u64, failed_page: u32) {
        let invalid: Vec<u64> = self.outstanding.range(failed_seq..).map(|(seq, _)| *seq).collect();
        for seq in invalid {
            self.outstanding.remove(&seq);
            self.arrived.remove(&seq);
        }
        self.next_page = failed_page;
    }

    /// 请求是否仍在等待生效
    pub fn is_outstanding(&self, seq: u64) -> bool {
        self.outstanding.contains_key(&seq)
    }

    fn absorb(&mut self, messages: Vec<Message>, outcome: &mut PageOutcome) {
        for message in messages {
            if message.room_id != self.room_id {
                warn!(room_id = %self.room_id, message_id = %message.id, "分页中混入了其他房间的消息");
                continue;
            }
            if self.upsert(message.clone(), false) == IngestOutcome::Inserted {
                outcome.inserted += 1;
            }
            outcome.ingested.push(message);
        }
    }

    /// 实时推送：已存在则合并服务器字段，否则插入
    pub fn ingest_push(&mut self, message: Message) -> IngestOutcome {
        self.upsert(message, false)
    }

    /// 插入乐观消息
    pub fn submit_optimistic(&mut self, message: Message) -> u64 {
        self.upsert(message.clone(), true);
        self.entries.get(&message.id).map_or(0, |entry| entry.seq)
    }

    fn upsert(&mut self, mut message: Message, optimistic: bool) -> IngestOutcome {
        match self.entries.get_mut(&message.id) {
            Some(entry) => {
                // 已读列表只增不减
                let seen: BTreeSet<UserId> = entry
                    .message
                    .seen_by
                    .iter()
                    .chain(message.seen_by.iter())
                    .copied()
                    .collect();
                message.seen_by = seen.into_iter().collect();

                let was_optimistic = entry.optimistic;
                self.order
                    .remove(&(Reverse(entry.message.created_at), entry.seq));
                self.order
                    .insert((Reverse(message.created_at), entry.seq), message.id);
                entry.message = message;
                entry.optimistic = entry.optimistic && optimistic;
                IngestOutcome::Merged { was_optimistic }
            }
            None => {
                self.next_insert += 1;
                let seq = self.next_insert;
                self.order
                    .insert((Reverse(message.created_at), seq), message.id);
                self.entries.insert(
                    message.id,
                    TimelineEntry {
                        message,
                        seq,
                        optimistic,
                    },
                );
                IngestOutcome::Inserted
            }
        }
    }

    /// 把用户追加到消息的已读列表
    pub fn mark_seen_by(&mut self, message_id: MessageId, users: &[UserId]) -> bool {
        let Some(entry) = self.entries.get_mut(&message_id) else {
            return false;
        };
        let mut changed = false;
        for user in users {
            if !entry.message.seen_by.contains(user) {
                entry.message.seen_by.push(*user);
                changed = true;
            }
        }
        changed
    }

    /// 移除一条尚未确认的乐观消息
    pub fn discard(&mut self, message_id: MessageId) -> Option<Message> {
        match self.entries.get(&message_id) {
            Some(entry) if entry.optimistic => {}
            _ => return None,
        }
        let entry = self.entries.remove(&message_id)?;
        self.order
            .remove(&(Reverse(entry.message.created_at), entry.seq));
        Some(entry.message)
    }

    pub fn get(&self, message_id: MessageId) -> Option<&TimelineEntry> {
        self.entries.get(&message_id)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.entries.contains_key(&message_id)
    }

    /// 按显示顺序排列的记录
    pub fn entries(&self) -> Vec<&TimelineEntry> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{message, room_id, user};

    fn page_of(room: RoomId, newest: i64, count: i64) -> Vec<Message> {
        (0..count).map(|i| message(room, user(), newest - i)).collect()
    }

    fn ids(timeline: &MessageTimeline) -> Vec<MessageId> {
        timeline.entries().iter().map(|e| e.message.id).collect()
    }

    #[test]
    fn test_pages_until_exhausted() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 10);

        let t1 = timeline.request_page().unwrap();
        timeline.complete_page(t1, Ok(page_of(room, 100, 10))).unwrap();
        let t2 = timeline.request_page().unwrap();
        timeline.complete_page(t2, Ok(page_of(room, 90, 10))).unwrap();
        let t3 = timeline.request_page().unwrap();
        assert_eq!(t3.page, 3);
        let outcome = timeline.complete_page(t3, Ok(vec![])).unwrap();

        assert!(outcome.exhausted);
        assert_eq!(timeline.len(), 20);
        assert!(timeline.request_page().is_none());
    }

    #[test]
    fn test_out_of_order_pages_apply_in_request_order() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 2);
        let first = page_of(room, 100, 2);
        let second = page_of(room, 98, 2);

        let t1 = timeline.request_page().unwrap();
        let t2 = timeline.request_page().unwrap();

        let early = timeline.complete_page(t2, Ok(second.clone())).unwrap();
        assert!(early.applied.is_empty());
        assert!(timeline.is_empty());

        let outcome = timeline.complete_page(t1, Ok(first.clone())).unwrap();
        assert_eq!(outcome.applied, vec![t1.seq, t2.seq]);
        assert_eq!(outcome.inserted, 4);

        let expected: Vec<MessageId> = first.iter().chain(second.iter()).map(|m| m.id).collect();
        assert_eq!(ids(&timeline), expected);
    }

    #[test]
    fn test_failed_page_rewinds_cursor() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 2);

        let t1 = timeline.request_page().unwrap();
        let t2 = timeline.request_page().unwrap();
        let err = timeline
            .complete_page(t1, Err(RequestError::http(500, "boom")))
            .unwrap_err();
        assert!(matches!(err, ApplicationError::Request(_)));

        // 之后的请求一并失效
        assert_eq!(
            timeline.complete_page(t2, Ok(page_of(room, 98, 2))),
            Err(ApplicationError::Discarded)
        );
        assert!(timeline.is_empty());

        let retry = timeline.request_page().unwrap();
        assert_eq!(retry.page, 1);
    }

    #[test]
    fn test_overlapping_pages_are_deduplicated() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 3);
        let first = page_of(room, 100, 3);
        // 服务器端插入了新消息，第二页与第一页重叠一条
        let mut second = vec![first[2].clone()];
        second.extend(page_of(room, 90, 2));

        let t1 = timeline.request_page().unwrap();
        timeline.complete_page(t1, Ok(first)).unwrap();
        let t2 = timeline.request_page().unwrap();
        let outcome = timeline.complete_page(t2, Ok(second)).unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(timeline.len(), 5);
    }

    #[test]
    fn test_optimistic_echo_collapses_into_one_entry() {
        let room = room_id();
        let me = user();
        let mut timeline = MessageTimeline::new(room, 1, 10);
        let local = message(room, me, 50);

        let seq = timeline.submit_optimistic(local.clone());
        assert!(timeline.get(local.id).unwrap().optimistic);

        // 回显携带服务器时间
        let mut echo = local.clone();
        echo.created_at = local.created_at + chrono::Duration::milliseconds(30);
        assert_eq!(
            timeline.ingest_push(echo.clone()),
            IngestOutcome::Merged { was_optimistic: true }
        );

        let entry = timeline.get(local.id).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(entry.seq, seq);
        assert!(!entry.optimistic);
        assert_eq!(entry.message.created_at, echo.created_at);
        assert_eq!(timeline.entries().len(), 1);
    }

    #[test]
    fn test_same_timestamp_keeps_insertion_order() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 10);
        let a = message(room, user(), 10);
        let b = message(room, user(), 10);
        let newer = message(room, user(), 20);

        timeline.ingest_push(a.clone());
        timeline.ingest_push(b.clone());
        timeline.ingest_push(newer.clone());

        assert_eq!(ids(&timeline), vec![newer.id, a.id, b.id]);
    }

    #[test]
    fn test_merge_keeps_seen_by() {
        let room = room_id();
        let viewer = user();
        let mut timeline = MessageTimeline::new(room, 1, 10);
        let original = message(room, user(), 10);

        timeline.ingest_push(original.clone());
        assert!(timeline.mark_seen_by(original.id, &[viewer]));
        // 较旧的历史记录不会抹掉已读
        timeline.ingest_push(original.clone());

        assert!(timeline.get(original.id).unwrap().message.is_seen_by(viewer));
    }

    #[test]
    fn test_resync_does_not_move_cursor() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 2);
        let t1 = timeline.request_page().unwrap();
        timeline.complete_page(t1, Ok(page_of(room, 100, 2))).unwrap();
        let t2 = timeline.request_page().unwrap();
        timeline.complete_page(t2, Ok(vec![])).unwrap();
        assert!(timeline.is_exhausted());

        let resync = timeline.resync_ticket();
        let outcome = timeline
            .complete_page(resync, Ok(page_of(room, 200, 2)))
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert!(timeline.is_exhausted());
        assert!(timeline.request_page().is_none());
    }

    #[test]
    fn test_foreign_ticket_is_discarded() {
        let room = room_id();
        let mut old = MessageTimeline::new(room, 1, 10);
        let ticket = old.request_page().unwrap();

        let mut current = MessageTimeline::new(room_id(), 2, 10);
        assert_eq!(
            current.complete_page(ticket, Ok(page_of(room, 10, 1))),
            Err(ApplicationError::Discarded)
        );
        assert!(current.is_empty());
    }

    #[test]
    fn test_discard_only_removes_optimistic_entries() {
        let room = room_id();
        let mut timeline = MessageTimeline::new(room, 1, 10);
        let local = message(room, user(), 10);
        let remote = message(room, user(), 11);

        timeline.submit_optimistic(local.clone());
        timeline.ingest_push(remote.clone());

        assert!(timeline.discard(remote.id).is_none());
        assert_eq!(timeline.discard(local.id).unwrap().id, local.id);
        assert_eq!(ids(&timeline), vec![remote.id]);
    }
}
