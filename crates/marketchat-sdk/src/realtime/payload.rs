//! 推送负载规范化
//!
//! 推送服务对同一逻辑事件可能使用不同的事件名和字段形状：
//! - ID 可能是字符串或数字
//! - 时间可能是 RFC 3339、`YYYY-MM-DD HH:MM:SS`、秒或毫秒时间戳
//! - 消息可能平铺在顶层，也可能嵌套在 `message` 字段下
//! - 会话 ID 可能缺省，由所在的会话频道隐含
//! - `data` 本身可能是一段 JSON 字符串
//!
//! 这里把它们统一转换为 `NormalizedEvent`，无法解析的返回 `MalformedEvent`。

use serde_json::Value;

use crate::config::ChannelConfig;
use crate::error::{MarketChatSDKError, Result};
use crate::network::RawEvent;
use crate::storage::{ConversationId, CorrelationToken, FileAttachment, Message, MessageBody, MessageId, UserId};
use crate::utils::time::{now_millis, parse_timestamp};

/// 逻辑事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    MessageRead,
    UserTyping,
    UserOnline,
    UserOffline,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::NewMessage,
        EventKind::MessageRead,
        EventKind::UserTyping,
        EventKind::UserOnline,
        EventKind::UserOffline,
    ];

    /// 推送服务可能使用的全部事件名
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            EventKind::NewMessage => &["new-message", "message.sent"],
            EventKind::MessageRead => &["message-read", "message.read"],
            EventKind::UserTyping => &["user-typing", "client-typing"],
            EventKind::UserOnline => &["user-online", "presence.online"],
            EventKind::UserOffline => &["user-offline", "presence.offline"],
        }
    }

    pub fn from_event_name(name: &str) -> Option<EventKind> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.aliases().contains(&name))
    }

    /// 所有需要绑定的事件名
    pub fn all_event_names() -> Vec<&'static str> {
        EventKind::ALL
            .iter()
            .flat_map(|kind| kind.aliases().iter().copied())
            .collect()
    }
}

/// 规范化后的推送事件
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    NewMessage {
        conversation_id: ConversationId,
        message: Message,
        /// 会话对端（懒创建会话时使用）
        counterpart: Option<UserId>,
    },
    MessageRead {
        conversation_id: Option<ConversationId>,
        reader_id: Option<UserId>,
        message_ids: Vec<MessageId>,
        read_at: i64,
    },
    Typing {
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        is_typing: bool,
    },
    Presence {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<i64>,
    },
}

/// 将原始事件规范化
pub fn normalize(
    kind: EventKind,
    raw: &RawEvent,
    self_user: &UserId,
    channels: &ChannelConfig,
) -> Result<NormalizedEvent> {
    let data = unwrap_data(&raw.data)?;
    let channel_conversation = channels.conversation_from_channel(&raw.channel);

    match kind {
        EventKind::NewMessage => {
            let body = data.get("message").filter(|m| m.is_object()).unwrap_or(&data);
            let conversation_id = conversation_id_of(body)
                .or_else(|| conversation_id_of(&data))
                .or(channel_conversation)
                .ok_or_else(|| malformed("new message without conversation id"))?;
            let message = parse_message(body, &conversation_id, self_user)?;
            let counterpart = if message.sender_is_self {
                id_field(body, &["recipient_id", "recipientId", "receiver_id"])
                    .or_else(|| nested_id(body, "recipient"))
                    .map(UserId::from)
            } else {
                Some(message.sender_id.clone())
            };
            Ok(NormalizedEvent::NewMessage {
                conversation_id,
                message,
                counterpart,
            })
        }
        EventKind::MessageRead => {
            let mut message_ids: Vec<MessageId> = data
                .get("message_ids")
                .or_else(|| data.get("messageIds"))
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(id_value).map(MessageId::from).collect())
                .unwrap_or_default();
            if let Some(id) = id_field(&data, &["message_id", "messageId"]) {
                message_ids.push(MessageId::from(id));
            }
            let conversation_id = conversation_id_of(&data).or(channel_conversation);
            let reader_id = id_field(&data, &["reader_id", "readerId", "user_id", "userId"]).map(UserId::from);
            if conversation_id.is_none() && reader_id.is_none() {
                return Err(malformed("read receipt without conversation or reader"));
            }
            let read_at = timestamp_field(&data, &["read_at", "readAt", "timestamp"]).unwrap_or_else(now_millis);
            Ok(NormalizedEvent::MessageRead {
                conversation_id,
                reader_id,
                message_ids,
                read_at,
            })
        }
        EventKind::UserTyping => {
            let user_id = id_field(&data, &["user_id", "userId", "sender_id", "senderId"])
                .or_else(|| nested_id(&data, "user"))
                .map(UserId::from)
                .ok_or_else(|| malformed("typing event without user id"))?;
            let is_typing = ["is_typing", "isTyping", "typing"]
                .iter()
                .find_map(|key| data.get(*key).and_then(bool_value))
                .unwrap_or(true);
            Ok(NormalizedEvent::Typing {
                user_id,
                conversation_id: conversation_id_of(&data).or(channel_conversation),
                is_typing,
            })
        }
        EventKind::UserOnline | EventKind::UserOffline => {
            let user_id = id_field(&data, &["user_id", "userId", "id"])
                .or_else(|| nested_id(&data, "user"))
                .map(UserId::from)
                .ok_or_else(|| malformed("presence event without user id"))?;
            Ok(NormalizedEvent::Presence {
                user_id,
                is_online: kind == EventKind::UserOnline,
                last_seen: timestamp_field(&data, &["last_seen", "lastSeen", "last_seen_at", "lastSeenAt"]),
            })
        }
    }
}

fn malformed(reason: &str) -> MarketChatSDKError {
    MarketChatSDKError::MalformedEvent(reason.to_string())
}

/// `data` 可能是对象，也可能是一段 JSON 字符串
fn unwrap_data(data: &Value) -> Result<Value> {
    match data {
        Value::Object(_) => Ok(data.clone()),
        Value::String(text) => {
            let parsed: Value = serde_json::from_str(text)
                .map_err(|e| MarketChatSDKError::MalformedEvent(format!("payload is not JSON: {}", e)))?;
            if parsed.is_object() {
                Ok(parsed)
            } else {
                Err(malformed("payload is not an object"))
            }
        }
        _ => Err(malformed("payload is not an object")),
    }
}

fn parse_message(body: &Value, conversation_id: &ConversationId, self_user: &UserId) -> Result<Message> {
    let id = id_field(body, &["id", "message_id", "messageId"])
        .map(MessageId::from)
        .ok_or_else(|| malformed("message without id"))?;
    let sender_id = id_field(body, &["sender_id", "senderId", "user_id", "userId", "from"])
        .or_else(|| nested_id(body, "sender"))
        .map(UserId::from)
        .ok_or_else(|| malformed("message without sender"))?;
    let body_content = parse_body(body).ok_or_else(|| malformed("message without content or file"))?;
    let server_timestamp = timestamp_field(body, &["created_at", "createdAt", "timestamp", "sent_at"]);
    let read_at = timestamp_field(body, &["read_at", "readAt"]);
    let seen = read_at.is_some()
        || ["seen", "is_read", "read"]
            .iter()
            .any(|key| body.get(*key).and_then(bool_value) == Some(true));
    let correlation_token = ["correlation_token", "correlationToken", "client_token", "clientToken"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .filter(|token| !token.is_empty())
        .map(CorrelationToken::from);

    Ok(Message {
        sender_is_self: &sender_id == self_user,
        id,
        conversation_id: conversation_id.clone(),
        sender_id,
        body: body_content,
        created_at: server_timestamp.unwrap_or_else(now_millis),
        server_timestamp,
        seen,
        read_at,
        pending: false,
        correlation_token,
    })
}

fn parse_body(body: &Value) -> Option<MessageBody> {
    let file = body
        .get("file")
        .or_else(|| body.get("attachment"))
        .and_then(|file| match file {
            Value::String(url) if !url.trim().is_empty() => Some(FileAttachment::new(url.as_str())),
            Value::Object(_) => {
                let url = ["url", "path", "file_url"]
                    .iter()
                    .find_map(|key| file.get(*key).and_then(Value::as_str))
                    .filter(|url| !url.trim().is_empty())?;
                let mut attachment = FileAttachment::new(url);
                if let Some(name) = ["name", "filename", "file_name"]
                    .iter()
                    .find_map(|key| file.get(*key).and_then(Value::as_str))
                {
                    attachment = attachment.with_filename(name);
                }
                if let Some(mime) = file.get("mime_type").and_then(Value::as_str) {
                    attachment = attachment.with_mime_type(mime);
                }
                attachment.size = file.get("size").and_then(Value::as_u64);
                Some(attachment)
            }
            _ => None,
        })
        .or_else(|| {
            body.get("file_url")
                .and_then(Value::as_str)
                .filter(|url| !url.trim().is_empty())
                .map(|url| {
                    let attachment = FileAttachment::new(url);
                    match body.get("file_name").and_then(Value::as_str) {
                        Some(name) => attachment.with_filename(name),
                        None => attachment,
                    }
                })
        });
    if let Some(file) = file {
        return Some(MessageBody::File(file));
    }

    ["content", "body", "text", "message"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .filter(|text| !text.trim().is_empty())
        .map(|text| MessageBody::Text(text.to_string()))
}

fn conversation_id_of(value: &Value) -> Option<ConversationId> {
    id_field(value, &["conversation_id", "conversationId", "chat_id"])
        .or_else(|| nested_id(value, "conversation"))
        .map(ConversationId::from)
}

/// 字符串或数字形式的 ID
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => n
            .as_u64()
            .map(|n| n.to_string())
            .or_else(|| n.as_i64().map(|n| n.to_string())),
        _ => None,
    }
}

fn id_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| value.get(*key).and_then(id_value))
}

fn nested_id(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|inner| inner.get("id")).and_then(id_value)
}

fn timestamp_field(value: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| value.get(*key).and_then(parse_timestamp))
}

fn bool_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channels() -> ChannelConfig {
        ChannelConfig::default()
    }

    fn me() -> UserId {
        UserId::from("7")
    }

    #[test]
    fn test_aliases_resolve_to_same_kind() {
        assert_eq!(EventKind::from_event_name("new-message"), Some(EventKind::NewMessage));
        assert_eq!(EventKind::from_event_name("message.sent"), Some(EventKind::NewMessage));
        assert_eq!(EventKind::from_event_name("client-typing"), Some(EventKind::UserTyping));
        assert_eq!(EventKind::from_event_name("pusher:subscription_succeeded"), None);
        assert_eq!(EventKind::all_event_names().len(), 10);
    }

    #[test]
    fn test_nested_message_with_numeric_ids() {
        let raw = RawEvent::new(
            "private-conversation.C7",
            "message.sent",
            json!({
                "message": {
                    "id": 42,
                    "sender": {"id": 9},
                    "content": "is it available?",
                    "created_at": "2023-11-14 22:13:20"
                }
            }),
        );

        let event = normalize(EventKind::NewMessage, &raw, &me(), &channels()).unwrap();
        let NormalizedEvent::NewMessage {
            conversation_id,
            message,
            counterpart,
        } = event
        else {
            panic!("expected new message");
        };
        assert_eq!(conversation_id, ConversationId::from("C7"));
        assert_eq!(message.id, MessageId::from("42"));
        assert_eq!(message.sender_id, UserId::from("9"));
        assert!(!message.sender_is_self);
        assert_eq!(message.created_at, 1_700_000_000_000);
        assert_eq!(counterpart, Some(UserId::from("9")));
    }

    #[test]
    fn test_own_message_echo_with_token_and_file() {
        let raw = RawEvent::new(
            "private-user.7",
            "new-message",
            json!({
                "id": "43",
                "conversation_id": "C7",
                "sender_id": "7",
                "recipient_id": "9",
                "file": {"url": "https://cdn/x.jpg", "name": "x.jpg"},
                "correlation_token": "T1",
                "created_at": 1_700_000_000
            }),
        );

        let NormalizedEvent::NewMessage {
            message, counterpart, ..
        } = normalize(EventKind::NewMessage, &raw, &me(), &channels()).unwrap()
        else {
            panic!("expected new message");
        };
        assert!(message.sender_is_self);
        assert_eq!(message.correlation_token, Some(CorrelationToken::from("T1")));
        assert_eq!(message.body.preview(), "x.jpg");
        assert_eq!(counterpart, Some(UserId::from("9")));
    }

    #[test]
    fn test_string_encoded_payload() {
        let raw = RawEvent::new(
            "private-conversation.C7",
            "user-typing",
            Value::String(r#"{"userId": "9", "typing": false}"#.to_string()),
        );
        let event = normalize(EventKind::UserTyping, &raw, &me(), &channels()).unwrap();
        assert_eq!(
            event,
            NormalizedEvent::Typing {
                user_id: UserId::from("9"),
                conversation_id: Some(ConversationId::from("C7")),
                is_typing: false,
            }
        );
    }

    #[test]
    fn test_read_receipt_by_reader_only() {
        let raw = RawEvent::new(
            "private-user.7",
            "message.read",
            json!({"reader_id": 9, "message_ids": [41, "42"], "read_at": "2023-11-14T22:13:20Z"}),
        );
        let event = normalize(EventKind::MessageRead, &raw, &me(), &channels()).unwrap();
        assert_eq!(
            event,
            NormalizedEvent::MessageRead {
                conversation_id: None,
                reader_id: Some(UserId::from("9")),
                message_ids: vec![MessageId::from("41"), MessageId::from("42")],
                read_at: 1_700_000_000_000,
            }
        );
    }

    #[test]
    fn test_presence_offline_last_seen() {
        let raw = RawEvent::new("private-user.7", "presence.offline", json!({"user": {"id": "9"}, "lastSeen": 1_700_000_000_123i64}));
        let event = normalize(EventKind::UserOffline, &raw, &me(), &channels()).unwrap();
        assert_eq!(
            event,
            NormalizedEvent::Presence {
                user_id: UserId::from("9"),
                is_online: false,
                last_seen: Some(1_700_000_000_123),
            }
        );
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        let cases = [
            (EventKind::NewMessage, json!({"id": 1, "sender_id": 9, "content": "x"}), "private-user.7"),
            (EventKind::NewMessage, json!({"sender_id": 9, "content": "x"}), "private-conversation.C7"),
            (EventKind::NewMessage, json!({"id": 1, "sender_id": 9, "content": "  "}), "private-conversation.C7"),
            (EventKind::UserTyping, json!({"typing": true}), "private-conversation.C7"),
            (EventKind::MessageRead, json!({"message_ids": [1]}), "private-user.7"),
            (EventKind::UserOnline, json!([1, 2]), "private-user.7"),
        ];
        for (kind, data, channel) in cases {
            let raw = RawEvent::new(channel, "x", data);
            assert!(
                matches!(normalize(kind, &raw, &me(), &channels()), Err(MarketChatSDKError::MalformedEvent(_))),
                "expected malformed: {:?}",
                raw
            );
        }
    }
}
