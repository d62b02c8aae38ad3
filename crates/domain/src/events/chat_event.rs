//! 实时通道上的事件
//!
//! 帧格式为 `{"event": "...", "data": {...}}`，字段名使用 camelCase。

use crate::entities::{invitation::Invitation, message::Message, message::MessageBody};
use crate::value_objects::{MessageId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// 客户端发往服务器的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// 发送消息，`client_message_id` 由客户端生成，回显时沿用
    #[serde(rename_all = "camelCase")]
    SendMessage {
        client_message_id: MessageId,
        room_id: RoomId,
        body: MessageBody,
    },
    /// 标记消息已读
    #[serde(rename_all = "camelCase")]
    MarkSeen { message_id: MessageId },
    /// 订阅房间
    #[serde(rename_all = "camelCase")]
    Subscribe { room_id: RoomId },
    /// 取消订阅房间
    #[serde(rename_all = "camelCase")]
    Unsubscribe { room_id: RoomId },
}

impl ClientEvent {
    /// 事件名（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::MarkSeen { .. } => "mark-seen",
            ClientEvent::Subscribe { .. } => "subscribe",
            ClientEvent::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// 成员变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChangeKind {
    Joined,
    Left,
    PromotedToAdmin,
}

/// 服务器推送的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// 新消息（也包括自己发送消息的回显）
    Message(Message),
    /// 投递确认
    #[serde(rename_all = "camelCase")]
    DeliveryAck { message_id: MessageId },
    /// 已读更新，`seen_by` 为累积列表
    #[serde(rename_all = "camelCase")]
    SeenUpdate {
        message_id: MessageId,
        seen_by: Vec<UserId>,
    },
    /// 收到邀请
    Invitation(Invitation),
    /// 房间成员变更
    #[serde(rename_all = "camelCase")]
    MembershipChange {
        room_id: RoomId,
        user_id: UserId,
        change: MembershipChangeKind,
    },
    /// 服务器拒绝了发送请求
    #[serde(rename_all = "camelCase")]
    SendRejected {
        client_message_id: MessageId,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ServerEvent {
    /// 事件名（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::DeliveryAck { .. } => "delivery-ack",
            ServerEvent::SeenUpdate { .. } => "seen-update",
            ServerEvent::Invitation(_) => "invitation",
            ServerEvent::MembershipChange { .. } => "membership-change",
            ServerEvent::SendRejected { .. } => "send-rejected",
        }
    }
}

/// 房间目录关心的事件
///
/// 水合期间这些事件会被缓冲，快照就绪后按到达顺序重放。
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// 房间收到新消息
    NewMessage(Message),
    /// 成员变更
    MembershipChange {
        room_id: RoomId,
        user_id: UserId,
        change: MembershipChangeKind,
    },
    /// 本地用户读过了房间里的一条消息
    MessageSeen { room_id: RoomId, message_id: MessageId },
}

impl RoomEvent {
    pub fn room_id(&self) -> RoomId {
        match self {
            RoomEvent::NewMessage(message) => message.room_id,
            RoomEvent::MembershipChange { room_id, .. } => *room_id,
            RoomEvent::MessageSeen { room_id, .. } => *room_id,
        }
    }
}
