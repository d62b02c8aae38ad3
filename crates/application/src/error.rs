use domain::DomainError;
use thiserror::Error;

/// 实时通道错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel not connected")]
    NotConnected,
    #[error("reconnect gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("session closed")]
    Closed,
}

impl ConnectionError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn handshake_rejected(reason: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            reason: reason.into(),
        }
    }

    /// 凭证被服务器拒绝，重试没有意义
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::HandshakeRejected { .. })
    }
}

/// REST 调用错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request transport error: {0}")]
    Transport(String),
    #[error("response decode error: {0}")]
    Decode(String),
}

impl RequestError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}

/// 入站帧解码错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unsupported frame: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("request error: {0}")]
    Request(#[from] RequestError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("stale response discarded")]
    Discarded,
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("sync engine closed")]
    EngineClosed,
}

impl ApplicationError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        ApplicationError::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// 本地输入校验失败
    pub fn is_validation(&self) -> bool {
        matches!(self, ApplicationError::Domain(err) if err.is_validation())
    }
}

pub type ApplicationResult<T> = Result<T, ApplicationError>;
