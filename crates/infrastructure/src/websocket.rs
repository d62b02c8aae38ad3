//! WebSocket 实时通道适配器
//!
//! 握手时在 `Authorization` 头里携带 bearer 凭证。401/403 视为凭证被拒，
//! 其他失败（包括握手超时）视为可重试的传输错误。

use std::time::Duration;

use application::{ChannelConnector, ChannelLink, ConnectionError, Credential, DecodeError, LinkFrame};
use async_trait::async_trait;
use domain::ClientEvent;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::codec::{decode_server_event, encode_client_event};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 按配置的地址建立 WebSocket 链路
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            handshake_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn ChannelLink>, ConnectionError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::transport(format!("invalid websocket url: {}", e)))?;
        let bearer = HeaderValue::from_str(&credential.bearer())
            .map_err(|_| ConnectionError::handshake_rejected("credential is not a valid header value"))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(url = %self.url, user_id = %credential.user_id(), "开始 WebSocket 握手");
        let stream = match tokio::time::timeout(self.handshake_timeout, connect_async(request)).await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(WsError::Http(response))) => {
                let status = response.status();
                warn!(url = %self.url, status = status.as_u16(), "WebSocket 握手被拒绝");
                return Err(
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        ConnectionError::handshake_rejected(format!("HTTP {}", status.as_u16()))
                    } else {
                        ConnectionError::transport(format!("handshake failed: HTTP {}", status.as_u16()))
                    },
                );
            }
            Ok(Err(err)) => return Err(ConnectionError::transport(err.to_string())),
            Err(_) => {
                return Err(ConnectionError::transport(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                )))
            }
        };

        info!(url = %self.url, user_id = %credential.user_id(), "WebSocket 已连接");
        Ok(Box::new(WsLink { stream }))
    }
}

/// 一条已建立的 WebSocket 链路
pub struct WsLink {
    stream: WsStream,
}

fn decode_frame(text: &str) -> LinkFrame {
    match decode_server_event(text) {
        Ok(event) => LinkFrame::Event(event),
        Err(err) => LinkFrame::Undecodable(err),
    }
}

#[async_trait]
impl ChannelLink for WsLink {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ConnectionError> {
        let text = encode_client_event(event)
            .map_err(|e| ConnectionError::transport(format!("encode {}: {}", event.name(), e)))?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectionError::transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<LinkFrame, ConnectionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(decode_frame(text.as_str())),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(match std::str::from_utf8(&data) {
                        Ok(text) => decode_frame(text),
                        Err(_) => LinkFrame::Undecodable(DecodeError::Malformed(
                            "binary frame is not utf-8".to_string(),
                        )),
                    });
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| ConnectionError::transport(e.to_string()))?;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        reason = frame.as_ref().map(|f| f.reason.as_str()).unwrap_or(""),
                        "服务器关闭了 WebSocket"
                    );
                    return Err(ConnectionError::Closed);
                }
                Some(Err(err)) => return Err(ConnectionError::transport(err.to_string())),
                None => return Err(ConnectionError::Closed),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "关闭 WebSocket 时出错");
        }
    }
}
