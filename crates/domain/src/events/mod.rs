//! 领域事件定义
//!
//! 实时通道上的入站/出站事件，以及目录消费的房间事件。

pub mod chat_event;

// 重新导出事件类型
pub use chat_event::*;
