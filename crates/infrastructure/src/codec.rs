//! 实时通道帧编解码
//!
//! 文本帧是 `{"event": "...", "data": {...}}` 形式的 JSON。

use application::DecodeError;
use domain::{ClientEvent, ServerEvent};
use serde_json::Value;

/// 客户端能识别的入站事件名
const KNOWN_EVENTS: [&str; 6] = [
    "message",
    "delivery-ack",
    "seen-update",
    "invitation",
    "membership-change",
    "send-rejected",
];

pub fn encode_client_event(event: &ClientEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// 解析入站文本帧
///
/// 不认识的事件名返回 `Unsupported`，其余解析失败返回 `Malformed`。
pub fn decode_server_event(text: &str) -> Result<ServerEvent, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let name = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing event name".to_string()))?;
    if !KNOWN_EVENTS.contains(&name) {
        return Err(DecodeError::Unsupported(name.to_string()));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{MessageBody, MessageId, RoomId};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_decode_message_frame() {
        let id = Uuid::new_v4();
        let room = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let frame = json!({
            "event": "message",
            "data": {
                "id": id,
                "roomId": room,
                "senderId": sender,
                "text": "hello",
                "createdAt": "2024-01-01T10:00:00Z",
                "seenBy": []
            }
        });

        let event = decode_server_event(&frame.to_string()).unwrap();
        match event {
            ServerEvent::Message(message) => {
                assert_eq!(message.id, MessageId::from(id));
                assert_eq!(message.room_id, RoomId::from(room));
                assert_eq!(message.body.text.as_deref(), Some("hello"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_unsupported() {
        let err = decode_server_event(r#"{"event":"typing","data":{}}"#).unwrap_err();
        assert_eq!(err, DecodeError::Unsupported("typing".to_string()));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            decode_server_event("not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            decode_server_event(r#"{"event":"delivery-ack","data":{}}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_send_message_wire_shape() {
        let id = MessageId::generate();
        let room = RoomId::from(Uuid::new_v4());
        let text = encode_client_event(&ClientEvent::SendMessage {
            client_message_id: id,
            room_id: room,
            body: MessageBody::text("hi"),
        })
        .unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "send-message");
        assert_eq!(value["data"]["clientMessageId"], json!(id));
        assert_eq!(value["data"]["roomId"], json!(room));
        assert_eq!(value["data"]["body"]["text"], "hi");
        assert!(value["data"]["body"].get("media").is_none());
    }
}
