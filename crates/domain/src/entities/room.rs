//! 聊天室实体定义
//!
//! `RoomRecord` 是 REST 快照里的形状，`Room` 是目录里维护的聚合。

use crate::entities::message::Message;
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 最后一条消息的预览长度
const PREVIEW_CHARS: usize = 64;

/// 最后一条消息的弱引用
///
/// 只保存摘要，消息本身归时间线所有。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageRef {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub created_at: Timestamp,
    pub preview: String,
    /// 快照时刻已读过这条消息的用户
    pub seen_by: BTreeSet<UserId>,
}

impl LastMessageRef {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id,
            sender_id: message.sender_id,
            created_at: message.created_at,
            preview: message.get_preview(PREVIEW_CHARS),
            seen_by: message.seen_by.iter().copied().collect(),
        }
    }
}

/// 聊天室快照记录（REST 返回的形状）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: RoomId,
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default)]
    pub admins: Vec<UserId>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_messages_count: u32,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// 聊天室聚合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    /// 聊天室唯一ID
    pub id: RoomId,
    /// 显示名称
    pub name: String,
    /// 是否为群组
    pub is_group: bool,
    /// 成员集合
    pub members: BTreeSet<UserId>,
    /// 管理员集合
    pub admins: BTreeSet<UserId>,
    /// 最后一条消息
    pub last_message: Option<LastMessageRef>,
    /// 未读数量（非负）
    pub unread_count: u32,
    /// 头像引用
    pub avatar: Option<String>,
}

impl From<RoomRecord> for Room {
    fn from(record: RoomRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            is_group: record.is_group,
            members: record.members.into_iter().collect(),
            admins: record.admins.into_iter().collect(),
            last_message: record.last_message.as_ref().map(LastMessageRef::from_message),
            unread_count: record.unread_messages_count,
            avatar: record.avatar,
        }
    }
}

impl Room {
    /// 如果消息比当前记录的最后一条更新，则更新最后消息引用
    pub fn record_message(&mut self, message: &Message) -> bool {
        let newer = match &self.last_message {
            None => true,
            Some(last) => last.message_id != message.id && message.is_newer_than(last.created_at),
        };
        if newer {
            self.last_message = Some(LastMessageRef::from_message(message));
        }
        newer
    }

    /// 快照是否已经包含了这条消息（同一条，或快照里的最后消息不早于它）
    pub fn reflects(&self, message: &Message) -> bool {
        self.last_message.as_ref().map_or(false, |last| {
            last.message_id == message.id || last.created_at >= message.created_at
        })
    }

    /// 最后一条消息是否就是 `message_id`，且快照里 `user_id` 已读过它
    pub fn last_seen_by(&self, message_id: MessageId, user_id: UserId) -> bool {
        self.last_message.as_ref().map_or(false, |last| {
            last.message_id == message_id && last.seen_by.contains(&user_id)
        })
    }

    /// 未读数加一
    pub fn increment_unread(&mut self) {
        self.unread_count = self.unread_count.saturating_add(1);
    }

    /// 未读数减一，不会小于零；返回是否真的减少了
    pub fn decrement_unread(&mut self) -> bool {
        if self.unread_count == 0 {
            return false;
        }
        self.unread_count -= 1;
        true
    }

    pub fn has_member(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admins.contains(&user_id)
    }

    pub fn add_member(&mut self, user_id: UserId) -> bool {
        self.members.insert(user_id)
    }

    pub fn remove_member(&mut self, user_id: UserId) -> bool {
        self.admins.remove(&user_id);
        self.members.remove(&user_id)
    }

    pub fn promote(&mut self, user_id: UserId) -> bool {
        self.members.insert(user_id);
        self.admins.insert(user_id)
    }

    /// 用单个房间详情刷新描述性字段，不触碰未读数和最后消息
    pub fn apply_details(&mut self, record: &RoomRecord) {
        self.name = record.name.clone();
        self.is_group = record.is_group;
        self.avatar = record.avatar.clone();
        self.members = record.members.iter().copied().collect();
        self.admins = record.admins.iter().copied().collect();
    }

    /// 最近活跃时间
    pub fn last_activity(&self) -> Option<Timestamp> {
        self.last_message.as_ref().map(|last| last.created_at)
    }
}
