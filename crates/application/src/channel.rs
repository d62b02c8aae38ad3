//! 实时通道抽象
//!
//! `ChannelConnector`/`ChannelLink` 是传输层要实现的接口，
//! `RealtimeChannel` 是同步引擎看到的接口（由会话管理器实现）。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{ClientEvent, RoomId, ServerEvent, UserId};
use tokio::sync::watch;

use crate::error::{ConnectionError, DecodeError};

/// 不透明的 bearer 凭证
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    user_id: UserId,
    token: String,
}

impl Credential {
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` 头的值
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"***")
            .finish()
    }
}

/// REST 适配器和通道连接器共享的凭证句柄
///
/// 只有会话管理器会替换其中的凭证。
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<watch::Sender<Option<Credential>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            inner: Arc::new(sender),
        }
    }

    /// 预先放入凭证
    pub fn with_credential(credential: Credential) -> Self {
        let (sender, _) = watch::channel(Some(credential));
        Self {
            inner: Arc::new(sender),
        }
    }

    pub fn current(&self) -> Option<Credential> {
        self.inner.borrow().clone()
    }

    pub(crate) fn replace(&self, credential: Credential) {
        self.inner.send_replace(Some(credential));
    }

    pub(crate) fn clear(&self) {
        self.inner.send_replace(None);
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("present", &self.inner.borrow().is_some())
            .finish()
    }
}

/// 链路上收到的一帧
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    Event(ServerEvent),
    /// 无法解码的帧，记录后丢弃，不影响后续帧
    Undecodable(DecodeError),
}

/// 一条已建立的双工链路
#[async_trait]
pub trait ChannelLink: Send {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectionError>;

    /// 对端关闭时返回 `ConnectionError::Closed`
    async fn recv(&mut self) -> Result<LinkFrame, ConnectionError>;

    async fn close(&mut self);
}

/// 使用凭证建立链路
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, credential: &Credential)
        -> Result<Box<dyn ChannelLink>, ConnectionError>;
}

/// 同步引擎使用的实时通道
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// 未连接时立即返回 `ConnectionError::NotConnected`
    async fn send(&self, event: ClientEvent) -> Result<(), ConnectionError>;

    /// 引用计数订阅，第一个订阅者才会真正发出 `subscribe`
    async fn subscribe(&self, room_id: RoomId) -> Result<(), ConnectionError>;

    /// 最后一个订阅者退出时才会发出 `unsubscribe`
    async fn unsubscribe(&self, room_id: RoomId) -> Result<(), ConnectionError>;
}
