//! 应用层实现。
//!
//! 客户端同步引擎：会话管理、房间目录、消息时间线、生命周期追踪和通知中继。
//! 这里只依赖领域模型和若干端口（REST、实时链路、时钟），具体适配器在基础设施层。

pub mod api;
pub mod broadcaster;
pub mod channel;
pub mod clock;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notification;
pub mod retry;
pub mod room_directory;
pub mod session;
pub mod timeline;

#[cfg(test)]
mod session_tests;
#[cfg(test)]
mod test_support;

pub use api::ChatApi;
pub use broadcaster::{EngineEvent, EngineEventBroadcaster, EngineEventStream};
pub use channel::{
    ChannelConnector, ChannelLink, Credential, CredentialStore, LinkFrame, RealtimeChannel,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    EngineConfig, EngineDependencies, EngineHandle, PageResult, SyncEngine, TimelineItem,
    TimelineView,
};
pub use error::{ApplicationError, ApplicationResult, ConnectionError, DecodeError, RequestError};
pub use lifecycle::{LifecycleChange, LifecycleTracker, SeenTransition};
pub use notification::{Announcement, NotificationRelay, ANNOUNCEMENT_TTL};
pub use retry::{retry_async, Backoff, RetryConfig, Retryable};
pub use room_directory::{ApplyOutcome, HydrationReport, HydrationTicket, RoomDirectory};
pub use session::{ConnectionState, SessionManager, SessionPolicy, SessionSignal};
pub use timeline::{IngestOutcome, MessageTimeline, PageKind, PageOutcome, PageTicket, TimelineEntry};
