//! 测试用的假协作方

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use domain::{
    ClientEvent, Invitation, InvitationId, Message, MessageBody, MessageId, RoomId, RoomRecord,
    ServerEvent, Timestamp, UserId,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::api::ChatApi;
use crate::channel::{ChannelConnector, ChannelLink, Credential, LinkFrame, RealtimeChannel};
use crate::error::{ConnectionError, RequestError};

pub fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

pub fn room_id() -> RoomId {
    RoomId::from(Uuid::new_v4())
}

/// 固定基准时间加偏移秒数
pub fn at(seconds: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub fn message(room_id: RoomId, sender_id: UserId, seconds: i64) -> Message {
    Message::optimistic(
        MessageId::generate(),
        room_id,
        sender_id,
        MessageBody::text(format!("message at {}", seconds)),
        at(seconds),
    )
}

pub fn room_record(id: RoomId, name: &str, unread: u32, last: Option<Message>) -> RoomRecord {
    RoomRecord {
        id,
        name: name.to_string(),
        is_group: true,
        members: vec![],
        admins: vec![],
        last_message: last,
        unread_messages_count: unread,
        avatar: None,
    }
}

/// 轮询直到条件成立
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ---------------------------------------------------------------------------
// 实时链路
// ---------------------------------------------------------------------------

/// 测试持有的链路另一端
pub struct FakeRemote {
    sent: mpsc::UnboundedReceiver<ClientEvent>,
    push: mpsc::UnboundedSender<Result<LinkFrame, ConnectionError>>,
}

impl FakeRemote {
    pub async fn next_sent(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("link closed")
    }

    pub fn try_sent(&mut self) -> Option<ClientEvent> {
        self.sent.try_recv().ok()
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.push.send(Ok(LinkFrame::Event(event)));
    }

    pub fn push_frame(&self, frame: Result<LinkFrame, ConnectionError>) {
        let _ = self.push.send(frame);
    }
}

struct FakeLink {
    sent: mpsc::UnboundedSender<ClientEvent>,
    frames: mpsc::UnboundedReceiver<Result<LinkFrame, ConnectionError>>,
}

#[async_trait]
impl ChannelLink for FakeLink {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectionError> {
        self.sent
            .send(event.clone())
            .map_err(|_| ConnectionError::transport("remote gone"))
    }

    async fn recv(&mut self) -> Result<LinkFrame, ConnectionError> {
        self.frames
            .recv()
            .await
            .unwrap_or(Err(ConnectionError::Closed))
    }

    async fn close(&mut self) {
        self.frames.close();
    }
}

/// 按脚本返回握手结果的连接器；脚本为空时握手成功
pub struct FakeConnector {
    script: Mutex<VecDeque<Result<(), ConnectionError>>>,
    remotes: mpsc::UnboundedSender<FakeRemote>,
    tokens: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<FakeRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Mutex::new(VecDeque::new()),
            remotes: tx,
            tokens: Mutex::new(Vec::new()),
        };
        (std::sync::Arc::new(connector), rx)
    }

    pub fn script(&self, outcome: Result<(), ConnectionError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn ChannelLink>, ConnectionError> {
        self.tokens
            .lock()
            .unwrap()
            .push(credential.token().to_string());
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome?;

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let _ = self.remotes.send(FakeRemote {
            sent: sent_rx,
            push: push_tx,
        });
        Ok(Box::new(FakeLink {
            sent: sent_tx,
            frames: push_rx,
        }))
    }
}

/// 记录所有出站事件的通道
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<ClientEvent>>,
    subscriptions: Mutex<Vec<(RoomId, bool)>>,
    fail_sends: AtomicBool,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }

    /// `(room_id, subscribed)` 按调用顺序
    pub fn subscriptions(&self) -> Vec<(RoomId, bool)> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RealtimeChannel for RecordingChannel {
    async fn send(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    async fn subscribe(&self, room_id: RoomId) -> Result<(), ConnectionError> {
        self.subscriptions.lock().unwrap().push((room_id, true));
        Ok(())
    }

    async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ConnectionError> {
        self.subscriptions.lock().unwrap().push((room_id, false));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

type Pending<T> = oneshot::Receiver<Result<T, RequestError>>;
pub type Gate<T> = oneshot::Sender<Result<T, RequestError>>;

fn ready<T>(result: Result<T, RequestError>) -> Pending<T> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

async fn resolve<T>(pending: Option<Pending<T>>, fallback: Result<T, RequestError>) -> Result<T, RequestError> {
    match pending {
        Some(rx) => rx
            .await
            .unwrap_or_else(|_| Err(RequestError::transport("gate dropped"))),
        None => fallback,
    }
}

/// 按脚本应答的 REST 协作方
///
/// `push_*` 立即可用的应答，`hold_*` 返回一个闸门，由测试决定何时放行。
#[derive(Default)]
pub struct ScriptedApi {
    room_lists: Mutex<VecDeque<Pending<Vec<RoomRecord>>>>,
    pages: Mutex<HashMap<(RoomId, u32), VecDeque<Pending<Vec<Message>>>>>,
    details: Mutex<HashMap<RoomId, RoomRecord>>,
    last_messages: Mutex<HashMap<RoomId, Message>>,
    invitations: Mutex<Vec<Invitation>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn push_room_list(&self, result: Result<Vec<RoomRecord>, RequestError>) {
        self.room_lists.lock().unwrap().push_back(ready(result));
    }

    pub fn hold_room_list(&self) -> Gate<Vec<RoomRecord>> {
        let (tx, rx) = oneshot::channel();
        self.room_lists.lock().unwrap().push_back(rx);
        tx
    }

    pub fn push_page(&self, room_id: RoomId, page: u32, result: Result<Vec<Message>, RequestError>) {
        self.pages
            .lock()
            .unwrap()
            .entry((room_id, page))
            .or_default()
            .push_back(ready(result));
    }

    pub fn hold_page(&self, room_id: RoomId, page: u32) -> Gate<Vec<Message>> {
        let (tx, rx) = oneshot::channel();
        self.pages
            .lock()
            .unwrap()
            .entry((room_id, page))
            .or_default()
            .push_back(rx);
        tx
    }

    pub fn set_details(&self, record: RoomRecord) {
        self.details.lock().unwrap().insert(record.id, record);
    }

    pub fn set_last_message(&self, message: Message) {
        self.last_messages
            .lock()
            .unwrap()
            .insert(message.room_id, message);
    }

    pub fn set_invitations(&self, invitations: Vec<Invitation>) {
        *self.invitations.lock().unwrap() = invitations;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, RequestError> {
        self.record("list_rooms".into());
        let pending = self.room_lists.lock().unwrap().pop_front();
        resolve(pending, Err(RequestError::http(500, "unscripted"))).await
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<RoomRecord, RequestError> {
        self.record(format!("fetch_room {}", room_id));
        let record = self.details.lock().unwrap().get(&room_id).cloned();
        record.ok_or_else(|| RequestError::http(404, "room not found"))
    }

    async fn fetch_messages(
        &self,
        room_id: RoomId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Message>, RequestError> {
        self.record(format!("fetch_messages {} {} {}", room_id, page, size));
        let pending = self
            .pages
            .lock()
            .unwrap()
            .get_mut(&(room_id, page))
            .and_then(|queue| queue.pop_front());
        resolve(pending, Ok(vec![])).await
    }

    async fn fetch_last_message(&self, room_id: RoomId) -> Result<Option<Message>, RequestError> {
        self.record(format!("fetch_last_message {}", room_id));
        Ok(self.last_messages.lock().unwrap().get(&room_id).cloned())
    }

    async fn list_invitations(&self) -> Result<Vec<Invitation>, RequestError> {
        self.record("list_invitations".into());
        Ok(self.invitations.lock().unwrap().clone())
    }

    async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<(), RequestError> {
        self.record(format!("accept_invitation {}", invitation_id));
        Ok(())
    }

    async fn reject_invitation(&self, invitation_id: InvitationId) -> Result<(), RequestError> {
        self.record(format!("reject_invitation {}", invitation_id));
        Ok(())
    }

    async fn invite_user(&self, room_id: RoomId, user_id: UserId) -> Result<(), RequestError> {
        self.record(format!("invite_user {} {}", room_id, user_id));
        Ok(())
    }

    async fn create_group(&self, name: &str) -> Result<RoomRecord, RequestError> {
        self.record(format!("create_group {}", name));
        Ok(room_record(room_id(), name, 0, None))
    }
}
