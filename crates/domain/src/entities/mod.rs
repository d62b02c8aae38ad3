//! 领域实体定义
//!
//! 包含客户端缓存的核心实体：聊天室、消息、邀请。

pub mod invitation;
pub mod message;
pub mod room;

// 重新导出核心实体
pub use invitation::{Invitation, InvitationRoom, UserSummary};
pub use message::{Message, MessageBody, MessageDraft, MAX_TEXT_LENGTH};
pub use room::{LastMessageRef, Room, RoomRecord};
