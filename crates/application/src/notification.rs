//! 通知中继
//!
//! 短暂的公告（目前只有邀请），按 ID 去重，5 秒后自动消失，也可以提前关闭。
//! 与房间目录等持久状态完全解耦。

use std::collections::HashMap;
use std::time::Duration;

use domain::{Invitation, InvitationId};
use tokio::time::Instant;

/// 公告的存活时间
pub const ANNOUNCEMENT_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub invitation: Invitation,
    pub expires_at: Instant,
}

impl Announcement {
    pub fn id(&self) -> InvitationId {
        self.invitation.id
    }
}

pub struct NotificationRelay {
    ttl: Duration,
    live: HashMap<InvitationId, Announcement>,
}

impl NotificationRelay {
    pub fn new() -> Self {
        Self::with_ttl(ANNOUNCEMENT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            live: HashMap::new(),
        }
    }

    /// 发布公告；同一 ID 仍在显示时不会重复
    pub fn announce(&mut self, invitation: Invitation, now: Instant) -> bool {
        if self.live.contains_key(&invitation.id) {
            return false;
        }
        self.live.insert(
            invitation.id,
            Announcement {
                invitation,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    /// 提前关闭；已经关闭的 ID 返回 `None`
    pub fn dismiss(&mut self, id: InvitationId) -> Option<Announcement> {
        self.live.remove(&id)
    }

    /// 移除所有到期的公告
    pub fn expire(&mut self, now: Instant) -> Vec<Announcement> {
        let due: Vec<InvitationId> = self
            .live
            .values()
            .filter(|announcement| announcement.expires_at <= now)
            .map(Announcement::id)
            .collect();
        due.into_iter()
            .filter_map(|id| self.live.remove(&id))
            .collect()
    }

    /// 最近的到期时间，事件循环据此休眠
    pub fn next_deadline(&self) -> Option<Instant> {
        self.live
            .values()
            .map(|announcement| announcement.expires_at)
            .min()
    }

    /// 当前显示中的公告，先到期的在前
    pub fn active(&self) -> Vec<&Announcement> {
        let mut active: Vec<&Announcement> = self.live.values().collect();
        active.sort_by_key(|announcement| announcement.expires_at);
        active
    }

    pub fn clear(&mut self) {
        self.live.clear();
    }
}

impl Default for NotificationRelay {
    fn default() -> Self {
        Self::new()
    }
}
