//! 邀请实体定义
//!
//! 邀请是短暂的通知，只存在于通知中继的队列里。

use crate::value_objects::{InvitationId, RoomId, UserId};
use serde::{Deserialize, Serialize};

/// 用户摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// 被邀请加入的房间摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationRoom {
    pub id: RoomId,
    pub name: String,
}

/// 邀请
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub id: InvitationId,
    pub from: UserSummary,
    pub to: UserId,
    pub room: InvitationRoom,
}

impl Invitation {
    /// 通知文案
    pub fn headline(&self) -> String {
        let sender = self
            .from
            .full_name
            .clone()
            .unwrap_or_else(|| self.from.id.to_string());
        format!("{} 邀请你加入 {}", sender, self.room.name)
    }
}
