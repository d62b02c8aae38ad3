//! 消息实体定义
//!
//! 包含服务器消息记录、本地草稿以及草稿校验规则。

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{MessageId, RoomId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// 消息文本的最大长度（字符）
pub const MAX_TEXT_LENGTH: usize = 10_000;

/// 消息正文：文本和/或媒体引用
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    /// 文本内容
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// 媒体引用（上传后的URL，上传本身由外部协作方完成）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty()) && self.media.is_none()
    }
}

/// 消息记录（服务器权威数据，也是通道回显的载荷）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// 消息唯一ID
    pub id: MessageId,
    /// 聊天室ID
    pub room_id: RoomId,
    /// 发送者ID
    pub sender_id: UserId,
    /// 消息正文
    #[serde(flatten)]
    pub body: MessageBody,
    /// 发送时间
    pub created_at: Timestamp,
    /// 已读用户列表
    #[serde(default)]
    pub seen_by: Vec<UserId>,
}

impl Message {
    /// 由已校验的草稿生成乐观消息记录
    pub fn optimistic(
        id: MessageId,
        room_id: RoomId,
        sender_id: UserId,
        body: MessageBody,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            room_id,
            sender_id,
            body,
            created_at,
            seen_by: Vec::new(),
        }
    }

    /// 检查消息是否由指定用户发送
    pub fn is_from(&self, user_id: UserId) -> bool {
        self.sender_id == user_id
    }

    /// 检查消息是否已被指定用户查看
    pub fn is_seen_by(&self, user_id: UserId) -> bool {
        self.seen_by.contains(&user_id)
    }

    /// 判断本消息是否比另一条更新（时间相同时不算更新）
    pub fn is_newer_than(&self, created_at: Timestamp) -> bool {
        self.created_at > created_at
    }

    /// 获取消息的简短预览（用于房间列表等）
    pub fn get_preview(&self, max_chars: usize) -> String {
        match self.body.text.as_deref() {
            Some(text) if text.chars().count() > max_chars => {
                let head: String = text.chars().take(max_chars).collect();
                format!("{}...", head)
            }
            Some(text) => text.to_string(),
            None if self.body.media.is_some() => "[图片]".to_string(),
            None => String::new(),
        }
    }
}

/// 本地草稿：用户在输入框提交的内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub room_id: RoomId,
    pub text: Option<String>,
    pub media: Option<String>,
}

impl MessageDraft {
    pub fn text(room_id: RoomId, text: impl Into<String>) -> Self {
        Self {
            room_id,
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn media(room_id: RoomId, media: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            room_id,
            text: caption,
            media: Some(media.into()),
        }
    }

    /// 校验草稿并转换为消息正文
    ///
    /// 校验失败的草稿不会进入时间线。
    pub fn validate(self) -> DomainResult<MessageBody> {
        let media = match self.media {
            Some(url) if url.trim().is_empty() => {
                return Err(DomainError::validation_error("media", "媒体引用不能为空"));
            }
            other => other,
        };

        let text = match self.text {
            Some(text) if text.trim().is_empty() => None,
            other => other,
        };

        if let Some(text) = text.as_deref() {
            if text.chars().count() > MAX_TEXT_LENGTH {
                return Err(DomainError::validation_error(
                    "text",
                    "消息内容不能超过10000个字符",
                ));
            }
        }

        if text.is_none() && media.is_none() {
            return Err(DomainError::validation_error("text", "消息内容不能为空"));
        }

        Ok(MessageBody { text, media })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn room() -> RoomId {
        RoomId::from(Uuid::new_v4())
    }

    #[test]
    fn test_draft_validation() {
        // 有效内容
        assert!(MessageDraft::text(room(), "Hello").validate().is_ok());
        assert!(MessageDraft::text(room(), "A".repeat(MAX_TEXT_LENGTH)).validate().is_ok());
        assert!(MessageDraft::media(room(), "https://cdn/x.png", None).validate().is_ok());

        // 无效内容
        assert!(MessageDraft::text(room(), "").validate().is_err());
        assert!(MessageDraft::text(room(), "   ").validate().is_err());
        assert!(MessageDraft::text(room(), "A".repeat(MAX_TEXT_LENGTH + 1))
            .validate()
            .is_err());
        assert!(MessageDraft::media(room(), " ", Some("caption".into()))
            .validate()
            .is_err());
    }

    #[test]
    fn test_blank_caption_is_dropped() {
        let body = MessageDraft::media(room(), "https://cdn/x.png", Some("  ".into()))
            .validate()
            .unwrap();
        assert!(body.text.is_none());
        assert_eq!(body.media.as_deref(), Some("https://cdn/x.png"));
    }

    #[test]
    fn test_message_preview() {
        let message = Message::optimistic(
            MessageId::generate(),
            room(),
            UserId::from(Uuid::new_v4()),
            MessageBody::text("This is a long message content"),
            Utc::now(),
        );

        assert_eq!(message.get_preview(10), "This is a ...");
        assert_eq!(message.get_preview(100), "This is a long message content");
    }

    #[test]
    fn test_message_wire_format() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "roomId": Uuid::new_v4(),
            "senderId": Uuid::new_v4(),
            "text": "hi",
            "createdAt": "2024-01-01T10:00:00Z",
        });

        let message: Message = serde_json::from_value(json).unwrap();
        assert_eq!(message.body.text.as_deref(), Some("hi"));
        assert!(message.body.media.is_none());
        assert!(message.seen_by.is_empty());

        let back = serde_json::to_value(&message).unwrap();
        assert!(back.get("media").is_none());
        assert!(back.get("seenBy").is_some());
    }
}
