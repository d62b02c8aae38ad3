//! 客户端配置中心
//!
//! 加载顺序：内置默认值 -> 可选配置文件（`CHATROOM_CLIENT_CONFIG_FILE`）-> 环境变量
//! （`CHATROOM_CLIENT_*`，层级用 `__` 分隔）。加载后统一做一次校验。

use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

pub const ENV_PREFIX: &str = "CHATROOM_CLIENT_";
pub const CONFIG_FILE_ENV: &str = "CHATROOM_CLIENT_CONFIG_FILE";

/// 不属于配置树的环境变量（凭证和文件路径），提取时忽略
const RESERVED_KEYS: [&str; 3] = ["token", "user_id", "config_file"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置加载失败: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("配置校验失败: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("配置不一致: {0}")]
    Inconsistent(String),
}

/// 服务端地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(url)]
    pub api_url: String,
    #[validate(url)]
    pub ws_url: String,
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

/// 会话与重连策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SessionConfig {
    #[validate(range(min = 1, max = 100))]
    pub max_reconnect_attempts: u32,
    #[validate(range(min = 10))]
    pub base_delay_ms: u64,
    #[validate(range(min = 10))]
    pub max_delay_ms: u64,
    #[validate(range(min = 1, max = 120))]
    pub handshake_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub inbound_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TimelineConfig {
    /// 每页消息条数
    #[validate(range(min = 1, max = 100))]
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EngineSettings {
    #[validate(range(min = 1))]
    pub command_capacity: usize,
    #[validate(range(min = 1))]
    pub event_capacity: usize,
}

/// 客户端全局配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ClientConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub session: SessionConfig,
    #[validate(nested)]
    pub timeline: TimelineConfig,
    #[validate(nested)]
    pub engine: EngineSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                api_url: "http://127.0.0.1:8080".into(),
                ws_url: "ws://127.0.0.1:8080/ws".into(),
                request_timeout_secs: 15,
            },
            session: SessionConfig {
                max_reconnect_attempts: 10,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                handshake_timeout_secs: 10,
                inbound_capacity: 256,
            },
            timeline: TimelineConfig { page_size: 10 },
            engine: EngineSettings {
                command_capacity: 64,
                event_capacity: 256,
            },
        }
    }
}

impl ClientConfig {
    /// 按 默认值 -> 文件 -> 环境变量 的优先级加载
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// 组装配置源，调用方可以在此基础上继续 merge
    pub fn figment() -> Figment {
        let mut fig = Figment::new().merge(Serialized::defaults(ClientConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if path.ends_with(".yml") || path.ends_with(".yaml") {
                fig = fig.merge(Yaml::file(path));
            } else if path.ends_with(".json") {
                fig = fig.merge(Json::file(path));
            } else {
                fig = fig.merge(Toml::file(path));
            }
        }
        fig.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&RESERVED_KEYS)
                .split("__"),
        )
    }

    pub fn from_figment(fig: Figment) -> Result<Self, ConfigError> {
        let cfg: ClientConfig = fig.extract().map_err(Box::new)?;
        cfg.validate()?;
        if cfg.session.base_delay_ms > cfg.session.max_delay_ms {
            return Err(ConfigError::Inconsistent(format!(
                "session.base_delay_ms ({}) 大于 session.max_delay_ms ({})",
                cfg.session.base_delay_ms, cfg.session.max_delay_ms
            )));
        }
        Ok(cfg)
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SessionConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
