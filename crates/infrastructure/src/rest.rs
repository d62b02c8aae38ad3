//! REST 协作方的 HTTP 实现
//!
//! 每个请求都从共享的凭证句柄读取当前 token，`rebind` 之后立即生效。

use std::time::Duration;

use application::{ChatApi, CredentialStore, RequestError};
use async_trait::async_trait;
use domain::{Invitation, InvitationId, Message, RoomId, RoomRecord, UserId};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Deserialize)]
struct RoomsEnvelope {
    rooms: Vec<RoomRecord>,
}

#[derive(Deserialize)]
struct RoomEnvelope {
    room: RoomRecord,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct InvitationsEnvelope {
    invitations: Vec<Invitation>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InviteBody {
    room_id: RoomId,
    to: UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupBody<'a> {
    name: &'a str,
    is_group: bool,
}

pub struct HttpChatApi {
    client: Client,
    base_url: String,
    credentials: CredentialStore,
}

impl HttpChatApi {
    pub fn new(
        base_url: impl Into<String>,
        credentials: CredentialStore,
        timeout: Duration,
    ) -> Result<Self, RequestError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RequestError::transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, RequestError> {
        let credential = self
            .credentials
            .current()
            .ok_or_else(|| RequestError::http(401, "no credential bound"))?;
        let response = builder
            .bearer_auth(credential.token())
            .send()
            .await
            .map_err(|e| RequestError::transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "REST 请求失败");
            return Err(RequestError::http(status.as_u16(), message));
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RequestError> {
        self.send(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RequestError::decode(e.to_string()))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, RequestError> {
        let envelope: RoomsEnvelope = self
            .json(self.client.get(self.url("/users/rooms")))
            .await?;
        debug!(rooms = envelope.rooms.len(), "已获取房间列表");
        Ok(envelope.rooms)
    }

    async fn fetch_room(&self, room_id: RoomId) -> Result<RoomRecord, RequestError> {
        let envelope: RoomEnvelope = self
            .json(self.client.get(self.url(&format!("/rooms/{}", room_id))))
            .await?;
        Ok(envelope.room)
    }

    async fn fetch_messages(
        &self,
        room_id: RoomId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Message>, RequestError> {
        let request = self
            .client
            .get(self.url(&format!("/messages/{}", room_id)))
            .query(&[("page", page), ("size", size)]);
        let envelope: MessagesEnvelope = self.json(request).await?;
        debug!(room_id = %room_id, page, count = envelope.messages.len(), "已获取消息分页");
        Ok(envelope.messages)
    }

    async fn list_invitations(&self) -> Result<Vec<Invitation>, RequestError> {
        let envelope: InvitationsEnvelope =
            self.json(self.client.get(self.url("/invitations"))).await?;
        Ok(envelope.invitations)
    }

    async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<(), RequestError> {
        self.send(
            self.client
                .put(self.url(&format!("/invitations/{}/accept", invitation_id))),
        )
        .await?;
        Ok(())
    }

    async fn reject_invitation(&self, invitation_id: InvitationId) -> Result<(), RequestError> {
        self.send(
            self.client
                .delete(self.url(&format!("/invitations/{}/reject", invitation_id))),
        )
        .await?;
        Ok(())
    }

    async fn invite_user(&self, room_id: RoomId, user_id: UserId) -> Result<(), RequestError> {
        let body = InviteBody {
            room_id,
            to: user_id,
        };
        self.send(self.client.post(self.url("/invitations/")).json(&body))
            .await?;
        Ok(())
    }

    async fn create_group(&self, name: &str) -> Result<RoomRecord, RequestError> {
        let body = CreateGroupBody {
            name,
            is_group: true,
        };
        let envelope: RoomEnvelope = self
            .json(self.client.post(self.url("/rooms")).json(&body))
            .await?;
        Ok(envelope.room)
    }
}
