//! 数据实体定义 - 会话、消息、参与者
//!
//! 这里定义了同步引擎内所有存储对象对应的 Rust 结构体，用于：
//! - 类型安全的标识符（会话 / 消息 / 用户 ID 互不混用）
//! - 统一的消息排序键 `(created_at, id)`
//! - 序列化/反序列化支持（事件推送给 UI 层）

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(
    /// 会话 ID（服务端分配，生命周期内稳定）
    ConversationId
);

opaque_id!(
    /// 用户 ID
    UserId
);

opaque_id!(
    /// 消息 ID，会话内唯一，作为去重键
    ///
    /// 服务端 ID 多为数字字符串，比较时按数值大小；乐观消息使用 `local:` 前缀的本地 ID，
    /// 同一时间戳下排在服务端消息之后。
    MessageId
);

impl MessageId {
    const LOCAL_PREFIX: &'static str = "local:";

    /// 乐观消息的本地 ID
    pub fn local(token: &CorrelationToken) -> Self {
        Self(format!("{}{}", Self::LOCAL_PREFIX, token))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(Self::LOCAL_PREFIX)
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse::<u64>().ok()
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 发送关联令牌
///
/// 客户端生成，随发送请求带给服务端并在响应/推送回显中原样返回，
/// 用于把乐观消息精确匹配到服务端消息（不依赖内容或时间猜测）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 文件附件引用（上传由外部完成，这里只保存引用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// 文件访问地址或服务端文件 ID
    pub url: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

impl FileAttachment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            filename: None,
            mime_type: None,
            size: None,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// 消息内容：文本与文件互斥
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    File(FileAttachment),
}

impl MessageBody {
    /// 会话列表预览用的摘要
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::File(file) => file
                .filename
                .clone()
                .unwrap_or_else(|| "[file]".to_string()),
        }
    }
}

/// 待发送的消息草稿
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub body: MessageBody,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            body: MessageBody::Text(content.into()),
        }
    }

    pub fn file(attachment: FileAttachment) -> Self {
        Self {
            body: MessageBody::File(attachment),
        }
    }
}

/// 发往服务端的消息（草稿 + 关联令牌）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub correlation_token: CorrelationToken,
    pub draft: MessageDraft,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    /// 入库时确定，之后不再重新推导
    pub sender_is_self: bool,
    /// 毫秒时间戳（UTC），排序主键
    pub created_at: i64,
    /// 服务端确认时间（毫秒），乐观消息为 None
    pub server_timestamp: Option<i64>,
    /// 单调：一旦为 true 不会再回到 false
    pub seen: bool,
    pub read_at: Option<i64>,
    /// 仅本地乐观消息为 true
    pub pending: bool,
    pub correlation_token: Option<CorrelationToken>,
}

impl Message {
    pub fn sort_key(&self) -> (i64, &MessageId) {
        (self.created_at, &self.id)
    }

    pub fn cmp_order(&self, other: &Message) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// 会话对端摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
    /// 最后在线时间（毫秒）
    pub last_seen: Option<i64>,
}

impl Participant {
    /// 推送引用了未知会话时使用的最小占位
    pub fn stub(id: UserId) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            avatar_url: None,
            is_online: false,
            last_seen: None,
        }
    }
}

/// 拉取会话列表得到的会话摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participant: Participant,
    pub last_message: Option<Message>,
    pub unread_count: u32,
    /// 会话自身的更新时间（毫秒）
    pub updated_at: Option<i64>,
}

/// 会话实体（会话索引中的条目）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant: Participant,
    /// 最后一条消息快照（不是实时引用）
    pub last_message: Option<Message>,
    pub unread_count: u32,
    pub updated_at: Option<i64>,
    /// 排序键（毫秒）
    pub activity_timestamp: i64,
}
