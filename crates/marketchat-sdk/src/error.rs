use thiserror::Error;

use crate::storage::entities::{ConversationId, MessageDraft, MessageId};

#[derive(Debug, Error)]
pub enum MarketChatSDKError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not connected")]
    NotConnected,
    // 推送通道错误（订阅/绑定失败）
    #[error("Transport error: {0}")]
    Transport(String),
    // 请求/响应调用失败（由 HTTP 协作方上报）
    #[error("Network error: {0}")]
    Network(String),
    /// 发送失败，原始草稿随错误一起返回，调用方可直接重发
    #[error("Send failed: {reason}")]
    SendFailed {
        draft: MessageDraft,
        reason: String,
    },
    #[error("Mark read failed for {} message(s) in {conversation_id}: {reason}", .message_ids.len())]
    MarkReadFailed {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        reason: String,
    },
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<serde_json::Error> for MarketChatSDKError {
    fn from(error: serde_json::Error) -> Self {
        MarketChatSDKError::Serialization(error.to_string())
    }
}

impl MarketChatSDKError {
    /// 是否应该展示给用户（用户主动操作引发的失败）
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            MarketChatSDKError::InvalidInput(_)
                | MarketChatSDKError::NotConnected
                | MarketChatSDKError::Network(_)
                | MarketChatSDKError::SendFailed { .. }
                | MarketChatSDKError::MarkReadFailed { .. }
        )
    }

    /// 是否属于可重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketChatSDKError::NotConnected
                | MarketChatSDKError::Network(_)
                | MarketChatSDKError::Transport(_)
                | MarketChatSDKError::SendFailed { .. }
                | MarketChatSDKError::MarkReadFailed { .. }
        )
    }

    /// 取回发送失败时的草稿
    pub fn into_draft(self) -> Option<MessageDraft> {
        match self {
            MarketChatSDKError::SendFailed { draft, .. } => Some(draft),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MarketChatSDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_failed_returns_draft() {
        let err = MarketChatSDKError::SendFailed {
            draft: MessageDraft::text("hello"),
            reason: "offline".to_string(),
        };
        assert!(err.is_user_facing());
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Send failed: offline");

        let draft = err.into_draft().unwrap();
        assert_eq!(draft, MessageDraft::text("hello"));
    }

    #[test]
    fn test_passive_errors_are_not_user_facing() {
        let err = MarketChatSDKError::MalformedEvent("missing id".to_string());
        assert!(!err.is_user_facing());
        assert!(!err.is_retryable());
        assert!(err.into_draft().is_none());
    }

    #[test]
    fn test_mark_read_failed_message() {
        let err = MarketChatSDKError::MarkReadFailed {
            conversation_id: ConversationId::from("c7"),
            message_ids: vec![MessageId::from("1"), MessageId::from("2")],
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Mark read failed for 2 message(s) in c7: timeout");
    }
}
