//! 基础设施层实现。
//!
//! 提供实时通道和 REST 协作方的网络适配器，实现应用层定义的端口。

pub mod codec;
pub mod rest;
pub mod websocket;

pub use codec::{decode_server_event, encode_client_event};
pub use rest::HttpChatApi;
pub use websocket::{WsConnector, WsLink};
