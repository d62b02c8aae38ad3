//! 引擎事件广播
//!
//! 界面层通过订阅这些事件得知状态变化，再通过查询命令读取快照。

use domain::{DeliveryState, Invitation, InvitationId, MessageId, RoomId};
use tokio::sync::broadcast;
use tracing::warn;

use crate::session::SessionSignal;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// 房间目录已用快照替换
    DirectoryHydrated { rooms: usize },
    /// 目录水合失败，原有状态保留
    DirectoryHydrationFailed { reason: String },
    /// 单个房间的未读数、最后消息或成员发生变化
    RoomUpdated { room_id: RoomId },
    RoomRemoved { room_id: RoomId },
    /// 当前时间线的内容发生变化
    TimelineChanged { room_id: RoomId, generation: u64 },
    /// 重连后的重新同步在重试后仍然失败，时间线可能缺消息
    TimelineResyncFailed { room_id: RoomId, reason: String },
    MessageStateChanged {
        room_id: RoomId,
        message_id: MessageId,
        state: DeliveryState,
    },
    InvitationAnnounced(Invitation),
    InvitationDismissed { invitation_id: InvitationId, expired: bool },
    Session(SessionSignal),
}

impl EngineEvent {
    /// 事件所属的房间（如果有）
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            EngineEvent::RoomUpdated { room_id }
            | EngineEvent::RoomRemoved { room_id }
            | EngineEvent::TimelineChanged { room_id, .. }
            | EngineEvent::TimelineResyncFailed { room_id, .. }
            | EngineEvent::MessageStateChanged { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EngineEventBroadcaster {
    sender: broadcast::Sender<EngineEvent>,
}

impl EngineEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        // 没有订阅者时直接丢弃
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EngineEventStream {
        EngineEventStream::new(self.sender.subscribe(), None)
    }

    /// 只接收某个房间的事件
    pub fn subscribe_room(&self, room_id: RoomId) -> EngineEventStream {
        EngineEventStream::new(self.sender.subscribe(), Some(room_id))
    }
}

impl Default for EngineEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct EngineEventStream {
    receiver: broadcast::Receiver<EngineEvent>,
    room_id: Option<RoomId>,
}

impl EngineEventStream {
    pub fn new(receiver: broadcast::Receiver<EngineEvent>, room_id: Option<RoomId>) -> Self {
        Self { receiver, room_id }
    }

    /// 引擎关闭后返回 `None`；落后太多时跳过丢失的事件继续接收
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => match self.room_id {
                    Some(room_id) if event.room_id() != Some(room_id) => continue,
                    _ => return Some(event),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "引擎事件订阅者落后，部分事件被跳过");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::room_id;

    #[tokio::test]
    async fn test_room_stream_filters_other_rooms() {
        let broadcaster = EngineEventBroadcaster::new(16);
        let (mine, other) = (room_id(), room_id());
        let mut stream = broadcaster.subscribe_room(mine);

        broadcaster.publish(EngineEvent::RoomUpdated { room_id: other });
        broadcaster.publish(EngineEvent::DirectoryHydrated { rooms: 2 });
        broadcaster.publish(EngineEvent::RoomUpdated { room_id: mine });

        assert_eq!(
            stream.recv().await,
            Some(EngineEvent::RoomUpdated { room_id: mine })
        );
    }

    #[tokio::test]
    async fn test_stream_ends_when_engine_drops() {
        let broadcaster = EngineEventBroadcaster::new(16);
        let mut stream = broadcaster.subscribe();
        broadcaster.publish(EngineEvent::DirectoryHydrated { rooms: 1 });
        drop(broadcaster);

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }
}
