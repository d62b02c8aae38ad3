use async_trait::async_trait;
use domain::{Invitation, InvitationId, Message, RoomId, RoomRecord, UserId};

use crate::error::RequestError;

/// REST 协作方
///
/// 所有调用都携带当前凭证；失败只影响本次调用，不会自动重试。
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// 当前用户的全部房间快照
    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, RequestError>;

    /// 单个房间详情
    async fn fetch_room(&self, room_id: RoomId) -> Result<RoomRecord, RequestError>;

    /// 历史消息分页，页码从 1 开始，结果按时间从新到旧；空页表示到头
    async fn fetch_messages(
        &self,
        room_id: RoomId,
        page: u32,
        size: u32,
    ) -> Result<Vec<Message>, RequestError>;

    /// 房间最近的一条消息
    async fn fetch_last_message(&self, room_id: RoomId) -> Result<Option<Message>, RequestError> {
        let mut page = self.fetch_messages(room_id, 1, 1).await?;
        Ok(if page.is_empty() {
            None
        } else {
            Some(page.swap_remove(0))
        })
    }

    async fn list_invitations(&self) -> Result<Vec<Invitation>, RequestError>;

    async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<(), RequestError>;

    async fn reject_invitation(&self, invitation_id: InvitationId) -> Result<(), RequestError>;

    async fn invite_user(&self, room_id: RoomId, user_id: UserId) -> Result<(), RequestError>;

    /// 创建群组，返回新房间
    async fn create_group(&self, name: &str) -> Result<RoomRecord, RequestError>;
}
