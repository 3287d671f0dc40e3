//! 发送管道
//!
//! 一次发送 = 校验草稿 -> 插入乐观消息 -> 恰好一次网络调用 -> 确认或回滚。
//! 不做自动重试：失败时乐观消息被移除，草稿随错误返回给调用方。

use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::{MarketChatSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::rpc_client::ChatApi;
use crate::storage::{
    ConversationId, ConversationIndex, CorrelationToken, Message, MessageBody, MessageDraft, MessageId,
    MessageLog, OutgoingMessage, Participant, UserId,
};
use crate::utils::time::now_millis;

/// 校验草稿：文本去掉首尾空白后不能为空，文件必须带引用地址
pub fn validate_draft(draft: &MessageDraft) -> Result<()> {
    match &draft.body {
        MessageBody::Text(text) if text.trim().is_empty() => {
            Err(MarketChatSDKError::InvalidInput("message text is empty".to_string()))
        }
        MessageBody::File(file) if file.url.trim().is_empty() => {
            Err(MarketChatSDKError::InvalidInput("file reference is empty".to_string()))
        }
        _ => Ok(()),
    }
}

pub struct SendPipeline {
    api: Arc<dyn ChatApi>,
    message_log: Arc<MessageLog>,
    conversation_index: Arc<ConversationIndex>,
    event_manager: Arc<EventManager>,
    self_user: UserId,
}

impl SendPipeline {
    pub fn new(
        api: Arc<dyn ChatApi>,
        message_log: Arc<MessageLog>,
        conversation_index: Arc<ConversationIndex>,
        event_manager: Arc<EventManager>,
        self_user: UserId,
    ) -> Self {
        Self {
            api,
            message_log,
            conversation_index,
            event_manager,
            self_user,
        }
    }

    /// 向已有会话发送消息，成功返回服务端确认后的消息
    ///
    /// 会话不在索引中时返回 `NotFound`，不写乐观消息也不发请求：
    /// 发送方无法得知对端，新会话应通过 `start_conversation` 创建。
    #[instrument(skip(self, draft))]
    pub async fn send(&self, conversation_id: &ConversationId, draft: MessageDraft) -> Result<Message> {
        validate_draft(&draft)?;
        if !self.conversation_index.contains(conversation_id) {
            return Err(MarketChatSDKError::NotFound(format!("conversation {}", conversation_id)));
        }

        let token = CorrelationToken::generate();
        let local_id = MessageId::local(&token);
        let optimistic = self.message_log.mark_optimistic(
            conversation_id,
            &token,
            self.local_message(conversation_id, &local_id, &draft),
        );
        self.event_manager
            .emit(event_builders::timeline_insert(optimistic))
            .await;

        let outgoing = OutgoingMessage {
            correlation_token: token.clone(),
            draft,
        };

        match self.api.send_message(conversation_id, &outgoing).await {
            Ok(mut server_message) => {
                server_message.conversation_id = conversation_id.clone();
                server_message.sender_is_self = true;
                // 推送回显可能已经抢先替换了乐观行
                let replaced_id = if self.message_log.contains(conversation_id, &local_id) {
                    local_id
                } else {
                    server_message.id.clone()
                };
                let resolved = self.message_log.resolve_optimistic(&token, server_message);
                info!("[SendPipeline] 发送成功: conversation={}, id={}", conversation_id, resolved.id);

                self.event_manager
                    .emit(event_builders::timeline_update(replaced_id, resolved.clone()))
                    .await;
                self.after_sent(conversation_id, &resolved, token).await;
                Ok(resolved)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("[SendPipeline] 发送失败，回滚乐观消息: conversation={}, reason={}", conversation_id, reason);
                if self.message_log.fail_optimistic(&token).is_some() {
                    self.event_manager
                        .emit(event_builders::timeline_remove(conversation_id.clone(), local_id))
                        .await;
                }
                self.event_manager
                    .emit(event_builders::message_send_failed(conversation_id.clone(), token, reason.clone()))
                    .await;
                Err(MarketChatSDKError::SendFailed {
                    draft: outgoing.draft,
                    reason,
                })
            }
        }
    }

    /// 与新用户的第一条消息：服务端创建会话，本地随后落地会话与消息
    ///
    /// 会话 ID 在响应之前未知，因此不插入乐观消息。
    #[instrument(skip(self, draft, participant))]
    pub async fn start_conversation(
        &self,
        recipient_id: &UserId,
        draft: MessageDraft,
        participant: Participant,
    ) -> Result<Message> {
        validate_draft(&draft)?;

        let token = CorrelationToken::generate();
        let outgoing = OutgoingMessage {
            correlation_token: token.clone(),
            draft,
        };

        let mut message = match self.api.create_conversation(recipient_id, &outgoing).await {
            Ok(message) => message,
            Err(e) => {
                warn!("[SendPipeline] 创建会话失败: recipient={}, reason={}", recipient_id, e);
                return Err(MarketChatSDKError::SendFailed {
                    draft: outgoing.draft,
                    reason: e.to_string(),
                });
            }
        };
        message.sender_is_self = true;
        message.pending = false;
        message.correlation_token.get_or_insert_with(|| token.clone());

        let conversation_id = message.conversation_id.clone();
        self.conversation_index.ensure(&conversation_id, participant);
        let outcome = self.message_log.append(&conversation_id, message);
        let stored = self
            .message_log
            .messages(&conversation_id)
            .into_iter()
            .find(|m| m.correlation_token.as_ref() == Some(&token))
            .ok_or_else(|| MarketChatSDKError::NotFound(format!("message for {}", token)))?;
        info!(
            "[SendPipeline] 新会话已创建: conversation={}, id={}, outcome={:?}",
            conversation_id, stored.id, outcome
        );

        if outcome.is_new() {
            self.event_manager
                .emit(event_builders::timeline_insert(stored.clone()))
                .await;
        }
        self.after_sent(&conversation_id, &stored, token).await;
        Ok(stored)
    }

    async fn after_sent(&self, conversation_id: &ConversationId, message: &Message, token: CorrelationToken) {
        self.conversation_index
            .bump_on_message(conversation_id, message, false);
        if let Some(conversation) = self.conversation_index.get(conversation_id) {
            self.event_manager
                .emit(event_builders::conversation_updated(conversation))
                .await;
        }
        self.event_manager
            .emit(event_builders::message_sent(message, token))
            .await;
    }

    fn local_message(&self, conversation_id: &ConversationId, local_id: &MessageId, draft: &MessageDraft) -> Message {
        Message {
            id: local_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: self.self_user.clone(),
            body: draft.body.clone(),
            sender_is_self: true,
            created_at: now_millis(),
            server_timestamp: None,
            seen: false,
            read_at: None,
            pending: true,
            correlation_token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SDKEvent;
    use crate::rpc_client::test_helpers::{ApiCall, MockChatApi};
    use crate::storage::{ConversationSummary, FileAttachment};

    struct Fixture {
        api: Arc<MockChatApi>,
        log: Arc<MessageLog>,
        index: Arc<ConversationIndex>,
        events: Arc<EventManager>,
        pipeline: Arc<SendPipeline>,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(MockChatApi::new("me"));
        let log = Arc::new(MessageLog::new());
        let index = Arc::new(ConversationIndex::new());
        let events = Arc::new(EventManager::new(64));
        index.upsert(ConversationSummary {
            id: ConversationId::from("C7"),
            participant: Participant::stub(UserId::from("U9")),
            last_message: None,
            unread_count: 0,
            updated_at: Some(1),
        });
        let pipeline = Arc::new(SendPipeline::new(
            api.clone(),
            log.clone(),
            index.clone(),
            events.clone(),
            UserId::from("me"),
        ));
        Fixture {
            api,
            log,
            index,
            events,
            pipeline,
        }
    }

    fn server_message(id: &str, created_at: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("C7"),
            sender_id: UserId::from("me"),
            body: MessageBody::Text("hello".to_string()),
            sender_is_self: true,
            created_at,
            server_timestamp: Some(created_at),
            seen: false,
            read_at: None,
            pending: false,
            correlation_token: None,
        }
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_and_returns_draft() {
        let f = fixture();
        f.api.fail_sends("offline");
        let mut receiver = f.events.subscribe();
        let c7 = ConversationId::from("C7");

        let err = f
            .pipeline
            .send(&c7, MessageDraft::text("hello"))
            .await
            .unwrap_err();

        assert!(err.is_user_facing());
        assert_eq!(err.into_draft(), Some(MessageDraft::text("hello")));
        assert!(f.log.is_empty(&c7));
        assert_eq!(f.log.pending_count(), 0);

        // 乐观消息先出现，随后被移除
        let inserted = receiver.recv().await.unwrap();
        assert!(matches!(
            inserted,
            SDKEvent::TimelineDiff { diff_kind: crate::events::TimelineDiffKind::Insert { ref message }, .. } if message.pending
        ));
        assert_eq!(receiver.recv().await.unwrap().event_type(), "timeline_diff");
        assert_eq!(receiver.recv().await.unwrap().event_type(), "message_send_failed");
        assert_eq!(f.api.count_calls(|c| matches!(c, ApiCall::SendMessage(..))), 1);
    }

    #[tokio::test]
    async fn test_pending_entry_is_visible_until_server_responds() {
        let f = fixture();
        let gate = f.api.hold_sends();
        let c7 = ConversationId::from("C7");

        let pipeline = f.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.send(&ConversationId::from("C7"), MessageDraft::text("hello")).await });
        tokio::task::yield_now().await;
        while f.log.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let pending = f.log.messages(&c7);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].pending);
        assert!(pending[0].id.is_local());

        gate.notify_one();
        let sent = task.await.unwrap().unwrap();
        assert!(!sent.pending);
        assert_eq!(f.log.len(&c7), 1);
    }

    #[tokio::test]
    async fn test_server_echo_replaces_pending_in_place() {
        let f = fixture();
        let c7 = ConversationId::from("C7");
        f.log.append(&c7, {
            let mut earlier = server_message("41", 1);
            earlier.sender_is_self = false;
            earlier.sender_id = UserId::from("U9");
            earlier
        });
        f.api.push_send_response(server_message("42", now_millis()));

        let sent = f.pipeline.send(&c7, MessageDraft::text("hello")).await.unwrap();

        assert_eq!(sent.id, MessageId::from("42"));
        assert!(!sent.pending);
        let messages = f.log.messages(&c7);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, MessageId::from("42"));
        assert_eq!(f.log.pending_count(), 0);

        let conversation = f.index.get(&c7).unwrap();
        assert_eq!(conversation.last_message.unwrap().id, MessageId::from("42"));
        assert_eq!(conversation.unread_count, 0);
    }

    #[tokio::test]
    async fn test_push_echo_racing_send_response_yields_one_row() {
        let f = fixture();
        let gate = f.api.hold_sends();
        let c7 = ConversationId::from("C7");
        f.api.push_send_response(server_message("42", now_millis()));

        let pipeline = f.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.send(&ConversationId::from("C7"), MessageDraft::text("hello")).await });
        while f.log.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        // 推送回显先到（携带同一个关联令牌）
        let token = f.log.messages(&c7)[0].correlation_token.clone();
        let mut echo = server_message("42", now_millis());
        echo.correlation_token = token;
        f.log.append(&c7, echo);

        gate.notify_one();
        task.await.unwrap().unwrap();

        let messages = f.log.messages(&c7);
        assert_eq!(messages.iter().filter(|m| m.id == MessageId::from("42")).count(), 1);
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_drafts_are_rejected_without_network_call() {
        let f = fixture();
        let c7 = ConversationId::from("C7");

        let err = f.pipeline.send(&c7, MessageDraft::text("   ")).await.unwrap_err();
        assert!(matches!(err, MarketChatSDKError::InvalidInput(_)));
        let err = f
            .pipeline
            .send(&c7, MessageDraft::file(FileAttachment::new("")))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketChatSDKError::InvalidInput(_)));

        let err = f
            .pipeline
            .send(&ConversationId::from("nope"), MessageDraft::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketChatSDKError::NotFound(_)));
        assert!(f.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_start_conversation_materializes_conversation() {
        let f = fixture();
        let recipient = UserId::from("U20");

        let message = f
            .pipeline
            .start_conversation(&recipient, MessageDraft::text("is this still available?"), Participant::stub(recipient.clone()))
            .await
            .unwrap();

        let conversation_id = ConversationId::from("new-U20");
        assert_eq!(message.conversation_id, conversation_id);
        assert!(message.sender_is_self);
        assert_eq!(f.log.len(&conversation_id), 1);
        let conversation = f.index.get(&conversation_id).unwrap();
        assert_eq!(conversation.participant.id, recipient);
        assert_eq!(conversation.last_message.unwrap().id, message.id);
    }

    #[tokio::test]
    async fn test_start_conversation_failure_returns_draft() {
        let f = fixture();
        f.api.fail_sends("rejected");
        let err = f
            .pipeline
            .start_conversation(&UserId::from("U20"), MessageDraft::text("hi"), Participant::stub(UserId::from("U20")))
            .await
            .unwrap_err();
        assert_eq!(err.into_draft(), Some(MessageDraft::text("hi")));
        assert_eq!(f.index.len(), 1);
    }
}
