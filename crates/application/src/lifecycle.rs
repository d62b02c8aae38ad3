//! 消息生命周期追踪
//!
//! 为每条消息保存 `Lifecycle`，状态转换本身由领域层的纯函数完成。

use std::collections::HashMap;

use domain::{DeliveryState, Lifecycle, LifecycleEvent, Message, MessageId, RoomId, UserId};
use tracing::debug;

/// 一次状态变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleChange {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub before: Option<Lifecycle>,
    pub after: Lifecycle,
}

impl LifecycleChange {
    pub fn changed(&self) -> bool {
        self.before.as_ref() != Some(&self.after)
    }
}

/// 已批准的标记已读请求
///
/// 同时携带两个增量：把查看者加入已读列表，以及所属房间的未读数减一。
/// 引擎在同一步里应用两者，然后才发出 `mark-seen`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenTransition {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub viewer: UserId,
}

struct Tracked {
    room_id: RoomId,
    lifecycle: Lifecycle,
}

pub struct LifecycleTracker {
    current_user: UserId,
    states: HashMap<MessageId, Tracked>,
}

impl LifecycleTracker {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            states: HashMap::new(),
        }
    }

    /// 开始追踪一条乐观消息
    pub fn track_optimistic(&mut self, message_id: MessageId, room_id: RoomId) -> Lifecycle {
        let lifecycle = Lifecycle::pending();
        self.states.insert(
            message_id,
            Tracked {
                room_id,
                lifecycle: lifecycle.clone(),
            },
        );
        lifecycle
    }

    /// 观察到一条服务器记录（推送、回显或历史分页）
    ///
    /// 尚未确认的本地消息视为回显，其余视为已送达的记录。
    pub fn observe(&mut self, message: &Message) -> LifecycleChange {
        let before = self
            .states
            .get(&message.id)
            .map(|tracked| tracked.lifecycle.clone());
        let event = match &before {
            Some(lifecycle) if !lifecycle.state().is_confirmed() => LifecycleEvent::Echoed {
                seen_by: message.seen_by.clone(),
            },
            _ => LifecycleEvent::Recorded {
                seen_by: message.seen_by.clone(),
            },
        };
        let after = before
            .as_ref()
            .map(|lifecycle| lifecycle.apply(&event))
            .unwrap_or_else(|| Lifecycle::from_record(&message.seen_by));
        self.states.insert(
            message.id,
            Tracked {
                room_id: message.room_id,
                lifecycle: after.clone(),
            },
        );
        LifecycleChange {
            message_id: message.id,
            room_id: message.room_id,
            before,
            after,
        }
    }

    /// 对已追踪的消息应用事件；未知消息返回 `None`
    pub fn apply(&mut self, message_id: MessageId, event: &LifecycleEvent) -> Option<LifecycleChange> {
        let Some(tracked) = self.states.get_mut(&message_id) else {
            debug!(message_id = %message_id, "忽略未追踪消息的生命周期事件");
            return None;
        };
        let before = tracked.lifecycle.clone();
        tracked.lifecycle = before.apply(event);
        Some(LifecycleChange {
            message_id,
            room_id: tracked.room_id,
            before: Some(before),
            after: tracked.lifecycle.clone(),
        })
    }

    /// 判断是否可以标记已读
    ///
    /// 只有当消息在视野内、发送者不是当前用户、且当前用户还不在已读列表里时才批准。
    pub fn request_seen(&self, message: &Message, in_view: bool) -> Option<SeenTransition> {
        if !in_view || message.is_from(self.current_user) || message.is_seen_by(self.current_user) {
            return None;
        }
        if self
            .states
            .get(&message.id)
            .map_or(false, |tracked| tracked.lifecycle.is_seen_by(self.current_user))
        {
            return None;
        }
        Some(SeenTransition {
            message_id: message.id,
            room_id: message.room_id,
            viewer: self.current_user,
        })
    }

    /// 应用已批准的已读转换中属于生命周期的那一半
    pub fn commit_seen(&mut self, transition: &SeenTransition) -> LifecycleChange {
        let event = LifecycleEvent::SeenBy(vec![transition.viewer]);
        let before = self
            .states
            .get(&transition.message_id)
            .map(|tracked| tracked.lifecycle.clone());
        let after = before
            .as_ref()
            .unwrap_or(&Lifecycle::from_record(&[]))
            .apply(&event);
        self.states.insert(
            transition.message_id,
            Tracked {
                room_id: transition.room_id,
                lifecycle: after.clone(),
            },
        );
        LifecycleChange {
            message_id: transition.message_id,
            room_id: transition.room_id,
            before,
            after,
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&Lifecycle> {
        self.states.get(&message_id).map(|tracked| &tracked.lifecycle)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.states.contains_key(&message_id)
    }

    pub fn forget(&mut self, message_id: MessageId) -> Option<Lifecycle> {
        self.states
            .remove(&message_id)
            .map(|tracked| tracked.lifecycle)
    }

    /// 链路中断后，所有仍在等待确认的消息都转为失败
    pub fn fail_pending(&mut self) -> Vec<LifecycleChange> {
        let mut changes = Vec::new();
        for (message_id, tracked) in self.states.iter_mut() {
            if tracked.lifecycle.state() != DeliveryState::Pending {
                continue;
            }
            let before = tracked.lifecycle.clone();
            tracked.lifecycle = before.apply(&LifecycleEvent::TransportFailed);
            changes.push(LifecycleChange {
                message_id: *message_id,
                room_id: tracked.room_id,
                before: Some(before),
                after: tracked.lifecycle.clone(),
            });
        }
        changes
    }

    /// 丢弃某个房间的全部记录，返回丢弃的条数
    pub fn forget_room(&mut self, room_id: RoomId) -> usize {
        let before = self.states.len();
        self.states.retain(|_, tracked| tracked.room_id != room_id);
        before - self.states.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}
