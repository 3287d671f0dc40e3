//! 聊天服务请求/响应接口
//!
//! HTTP 传输、鉴权与序列化由外部协作方实现，引擎只依赖这里的 trait。
//! 所有时间字段统一为 UTC 毫秒时间戳。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::entities::{
    ConversationId, ConversationSummary, Message, MessageId, OutgoingMessage, UserId,
};

/// 一页历史消息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// 聊天服务接口
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// 拉取会话列表
    async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>>;

    /// 拉取历史消息，`page` 从 1 开始，页内顺序不做要求
    async fn fetch_messages(&self, conversation_id: &ConversationId, page: u32) -> Result<MessagePage>;

    /// 发送消息，服务端需原样返回关联令牌
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        message: &OutgoingMessage,
    ) -> Result<Message>;

    /// 与新用户的第一条消息：服务端创建会话并返回消息（含会话 ID）
    async fn create_conversation(&self, recipient_id: &UserId, message: &OutgoingMessage) -> Result<Message>;

    async fn mark_read(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Result<()>;

    /// 服务端是否支持批量标记已读
    fn supports_batch_mark_read(&self) -> bool {
        false
    }

    /// 批量标记已读；默认逐条调用 `mark_read`
    async fn mark_read_batch(&self, conversation_id: &ConversationId, message_ids: &[MessageId]) -> Result<()> {
        for message_id in message_ids {
            self.mark_read(conversation_id, message_id).await?;
        }
        Ok(())
    }

    /// 通知对方本地用户的输入状态
    async fn set_typing_status(&self, target_user_id: &UserId, is_typing: bool) -> Result<()>;
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::error::MarketChatSDKError;
    use crate::storage::entities::MessageBody;
    use crate::utils::time::now_millis;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// 记录下来的接口调用
    #[derive(Debug, Clone, PartialEq)]
    pub enum ApiCall {
        FetchConversations,
        FetchMessages(ConversationId, u32),
        SendMessage(ConversationId, String),
        CreateConversation(UserId, String),
        MarkRead(ConversationId, MessageId),
        MarkReadBatch(ConversationId, Vec<MessageId>),
        SetTyping(UserId, bool),
    }

    /// 测试用聊天服务：记录调用，可配置失败、延迟与返回值
    pub struct MockChatApi {
        self_user: UserId,
        calls: Mutex<Vec<ApiCall>>,
        conversations: Mutex<Vec<ConversationSummary>>,
        pages: Mutex<HashMap<(ConversationId, u32), MessagePage>>,
        send_responses: Mutex<VecDeque<Message>>,
        send_error: Mutex<Option<String>>,
        send_gate: Mutex<Option<Arc<Notify>>>,
        failing_reads: Mutex<HashSet<MessageId>>,
        read_delay: Mutex<Option<Duration>>,
        batch: AtomicBool,
        next_id: AtomicU64,
    }

    impl MockChatApi {
        pub fn new(self_user: &str) -> Self {
            Self {
                self_user: UserId::from(self_user),
                calls: Mutex::new(Vec::new()),
                conversations: Mutex::new(Vec::new()),
                pages: Mutex::new(HashMap::new()),
                send_responses: Mutex::new(VecDeque::new()),
                send_error: Mutex::new(None),
                send_gate: Mutex::new(None),
                failing_reads: Mutex::new(HashSet::new()),
                read_delay: Mutex::new(None),
                batch: AtomicBool::new(false),
                next_id: AtomicU64::new(1000),
            }
        }

        pub fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().clone()
        }

        pub fn count_calls(&self, predicate: impl Fn(&ApiCall) -> bool) -> usize {
            self.calls.lock().iter().filter(|c| predicate(c)).count()
        }

        pub fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
            *self.conversations.lock() = conversations;
        }

        pub fn set_page(&self, conversation_id: &ConversationId, page: u32, messages: Vec<Message>, has_more: bool) {
            self.pages
                .lock()
                .insert((conversation_id.clone(), page), MessagePage { messages, has_more });
        }

        /// 下一次发送返回指定的服务端消息（关联令牌仍以请求为准）
        pub fn push_send_response(&self, message: Message) {
            self.send_responses.lock().push_back(message);
        }

        pub fn fail_sends(&self, reason: &str) {
            *self.send_error.lock() = Some(reason.to_string());
        }

        /// 发送请求挂起，直到返回的 `Notify` 被唤醒
        pub fn hold_sends(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.send_gate.lock() = Some(gate.clone());
            gate
        }

        pub fn fail_mark_read(&self, message_id: &str) {
            self.failing_reads.lock().insert(MessageId::from(message_id));
        }

        pub fn delay_mark_read(&self, delay: Duration) {
            *self.read_delay.lock() = Some(delay);
        }

        pub fn enable_batch(&self) {
            self.batch.store(true, Ordering::SeqCst);
        }

        fn record(&self, call: ApiCall) {
            self.calls.lock().push(call);
        }

        async fn respond_to_send(&self, conversation_id: ConversationId, message: &OutgoingMessage) -> Result<Message> {
            let gate = self.send_gate.lock().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if let Some(reason) = self.send_error.lock().clone() {
                return Err(MarketChatSDKError::Network(reason));
            }

            let queued = self.send_responses.lock().pop_front();
            let mut response = queued.unwrap_or_else(|| {
                let now = now_millis();
                Message {
                    id: MessageId::from(self.next_id.fetch_add(1, Ordering::SeqCst)),
                    conversation_id: conversation_id.clone(),
                    sender_id: self.self_user.clone(),
                    body: message.draft.body.clone(),
                    sender_is_self: true,
                    created_at: now,
                    server_timestamp: Some(now),
                    seen: false,
                    read_at: None,
                    pending: false,
                    correlation_token: None,
                }
            });
            response.correlation_token = Some(message.correlation_token.clone());
            Ok(response)
        }

        async fn settle_read(&self, message_id: &MessageId) -> Result<()> {
            let delay = *self.read_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing_reads.lock().contains(message_id) {
                return Err(MarketChatSDKError::Network(format!("mark read rejected: {}", message_id)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChatApi for MockChatApi {
        async fn fetch_conversations(&self) -> Result<Vec<ConversationSummary>> {
            self.record(ApiCall::FetchConversations);
            Ok(self.conversations.lock().clone())
        }

        async fn fetch_messages(&self, conversation_id: &ConversationId, page: u32) -> Result<MessagePage> {
            self.record(ApiCall::FetchMessages(conversation_id.clone(), page));
            Ok(self
                .pages
                .lock()
                .get(&(conversation_id.clone(), page))
                .cloned()
                .unwrap_or_default())
        }

        async fn send_message(&self, conversation_id: &ConversationId, message: &OutgoingMessage) -> Result<Message> {
            self.record(ApiCall::SendMessage(
                conversation_id.clone(),
                message.correlation_token.to_string(),
            ));
            self.respond_to_send(conversation_id.clone(), message).await
        }

        async fn create_conversation(&self, recipient_id: &UserId, message: &OutgoingMessage) -> Result<Message> {
            self.record(ApiCall::CreateConversation(
                recipient_id.clone(),
                message.correlation_token.to_string(),
            ));
            let conversation_id = ConversationId::from(format!("new-{}", recipient_id));
            self.respond_to_send(conversation_id, message).await
        }

        async fn mark_read(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Result<()> {
            self.record(ApiCall::MarkRead(conversation_id.clone(), message_id.clone()));
            self.settle_read(message_id).await
        }

        fn supports_batch_mark_read(&self) -> bool {
            self.batch.load(Ordering::SeqCst)
        }

        async fn mark_read_batch(&self, conversation_id: &ConversationId, message_ids: &[MessageId]) -> Result<()> {
            self.record(ApiCall::MarkReadBatch(conversation_id.clone(), message_ids.to_vec()));
            for message_id in message_ids {
                self.settle_read(message_id).await?;
            }
            Ok(())
        }

        async fn set_typing_status(&self, target_user_id: &UserId, is_typing: bool) -> Result<()> {
            self.record(ApiCall::SetTyping(target_user_id.clone(), is_typing));
            Ok(())
        }
    }

    /// 构造一条对方发来的文本消息
    pub fn incoming(conversation_id: &str, id: &str, sender: &str, created_at: i64, text: &str) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from(conversation_id),
            sender_id: UserId::from(sender),
            body: MessageBody::Text(text.to_string()),
            sender_is_self: false,
            created_at,
            server_timestamp: Some(created_at),
            seen: false,
            read_at: None,
            pending: false,
            correlation_token: None,
        }
    }
}

#[cfg(test)]
pub use test_helpers::MockChatApi;
