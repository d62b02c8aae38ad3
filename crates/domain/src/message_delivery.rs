//! 消息投递生命周期
//!
//! `Pending → Sent → Delivered → Seen`，`Failed` 只能由 `Pending` 进入。
//! 状态只前进不后退（用户主动重试除外），同一事件重复或乱序到达都不会回退。

use crate::value_objects::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// 已乐观插入，等待服务器确认
    Pending,
    /// 传输失败，等待用户重试或丢弃
    Failed,
    /// 服务器已回显
    Sent,
    /// 已送达
    Delivered,
    /// 已读
    Seen,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending | DeliveryState::Failed => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Delivered => 2,
            DeliveryState::Seen => 3,
        }
    }

    /// 是否已被服务器确认
    pub fn is_confirmed(self) -> bool {
        self.rank() > 0
    }
}

/// 驱动生命周期的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// 乐观消息收到服务器回显
    Echoed { seen_by: Vec<UserId> },
    /// 通过历史分页或他人推送得到的记录
    Recorded { seen_by: Vec<UserId> },
    /// 投递确认
    DeliveryAck,
    /// 已读更新（累积）
    SeenBy(Vec<UserId>),
    /// 传输失败
    TransportFailed,
    /// 用户重试
    Retry,
}

/// 单条消息的生命周期状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: DeliveryState,
    seen_by: BTreeSet<UserId>,
}

impl Lifecycle {
    /// 乐观消息的初始状态
    pub fn pending() -> Self {
        Self {
            state: DeliveryState::Pending,
            seen_by: BTreeSet::new(),
        }
    }

    /// 由服务器记录推导出的初始状态
    pub fn from_record(seen_by: &[UserId]) -> Self {
        Self::pending().apply(&LifecycleEvent::Recorded {
            seen_by: seen_by.to_vec(),
        })
    }

    /// 纯状态转换：返回新的生命周期，自身不变
    pub fn apply(&self, event: &LifecycleEvent) -> Lifecycle {
        let mut next = self.clone();
        match event {
            LifecycleEvent::TransportFailed => {
                if next.state == DeliveryState::Pending {
                    next.state = DeliveryState::Failed;
                }
            }
            LifecycleEvent::Retry => {
                if next.state == DeliveryState::Failed {
                    next.state = DeliveryState::Pending;
                }
            }
            LifecycleEvent::Echoed { seen_by } => {
                next.confirm(DeliveryState::Sent);
                next.seen_by.extend(seen_by.iter().copied());
            }
            LifecycleEvent::Recorded { seen_by } => {
                next.confirm(DeliveryState::Delivered);
                next.seen_by.extend(seen_by.iter().copied());
            }
            LifecycleEvent::DeliveryAck => next.confirm(DeliveryState::Delivered),
            LifecycleEvent::SeenBy(users) => next.seen_by.extend(users.iter().copied()),
        }
        if !next.seen_by.is_empty() {
            next.confirm(DeliveryState::Seen);
        }
        next
    }

    fn confirm(&mut self, target: DeliveryState) {
        if target.rank() > self.state.rank() {
            self.state = target;
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// 对外展示的状态：已读列表非空即视为已读，不考虑成员总数
    pub fn indicator(&self) -> DeliveryState {
        if self.seen_by.is_empty() {
            self.state
        } else {
            DeliveryState::Seen
        }
    }

    pub fn seen_by(&self) -> &BTreeSet<UserId> {
        &self.seen_by
    }

    pub fn is_seen_by(&self, user_id: UserId) -> bool {
        self.seen_by.contains(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[test]
    fn test_message_delivery_lifecycle() {
        let viewer = user();
        let lifecycle = Lifecycle::pending();
        assert_eq!(lifecycle.state(), DeliveryState::Pending);

        let lifecycle = lifecycle.apply(&LifecycleEvent::Echoed { seen_by: vec![] });
        assert_eq!(lifecycle.state(), DeliveryState::Sent);

        let lifecycle = lifecycle.apply(&LifecycleEvent::DeliveryAck);
        assert_eq!(lifecycle.state(), DeliveryState::Delivered);

        let lifecycle = lifecycle.apply(&LifecycleEvent::SeenBy(vec![viewer]));
        assert_eq!(lifecycle.state(), DeliveryState::Seen);
        assert!(lifecycle.is_seen_by(viewer));
    }

    #[test]
    fn test_delivered_and_seen_commute() {
        let viewer = user();
        let start = Lifecycle::pending().apply(&LifecycleEvent::Echoed { seen_by: vec![] });

        let a = start
            .apply(&LifecycleEvent::DeliveryAck)
            .apply(&LifecycleEvent::SeenBy(vec![viewer]));
        let b = start
            .apply(&LifecycleEvent::SeenBy(vec![viewer]))
            .apply(&LifecycleEvent::DeliveryAck);

        assert_eq!(a, b);
        assert_eq!(a.state(), DeliveryState::Seen);
    }

    #[test]
    fn test_failed_only_from_pending() {
        let failed = Lifecycle::pending().apply(&LifecycleEvent::TransportFailed);
        assert_eq!(failed.state(), DeliveryState::Failed);

        // 已确认的消息不会再被标记为失败
        let sent = Lifecycle::pending()
            .apply(&LifecycleEvent::Echoed { seen_by: vec![] })
            .apply(&LifecycleEvent::TransportFailed);
        assert_eq!(sent.state(), DeliveryState::Sent);
    }

    #[test]
    fn test_late_echo_supersedes_failure() {
        let lifecycle = Lifecycle::pending()
            .apply(&LifecycleEvent::TransportFailed)
            .apply(&LifecycleEvent::Echoed { seen_by: vec![] });
        assert_eq!(lifecycle.state(), DeliveryState::Sent);
    }

    #[test]
    fn test_retry_returns_failed_to_pending() {
        let lifecycle = Lifecycle::pending()
            .apply(&LifecycleEvent::TransportFailed)
            .apply(&LifecycleEvent::Retry);
        assert_eq!(lifecycle.state(), DeliveryState::Pending);

        // 非失败状态下的重试没有效果
        let delivered = Lifecycle::from_record(&[]).apply(&LifecycleEvent::Retry);
        assert_eq!(delivered.state(), DeliveryState::Delivered);
    }

    #[test]
    fn test_seen_by_accumulates() {
        let (a, b) = (user(), user());
        let lifecycle = Lifecycle::from_record(&[a])
            .apply(&LifecycleEvent::SeenBy(vec![b]))
            .apply(&LifecycleEvent::SeenBy(vec![a]));

        assert_eq!(lifecycle.seen_by().len(), 2);
        assert_eq!(lifecycle.indicator(), DeliveryState::Seen);
    }

    #[test]
    fn test_record_without_viewers_is_delivered() {
        let lifecycle = Lifecycle::from_record(&[]);
        assert_eq!(lifecycle.indicator(), DeliveryState::Delivered);
        assert!(lifecycle.apply(&LifecycleEvent::SeenBy(vec![])).seen_by().is_empty());
    }
}
