//! 聊天客户端同步引擎的领域模型
//!
//! 包含房间、消息、邀请等实体，实时通道事件，以及消息投递生命周期的纯状态转换。

pub mod entities;
pub mod errors;
pub mod events;
pub mod message_delivery;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use message_delivery::*;
pub use value_objects::*;
