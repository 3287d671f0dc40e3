//! 会话列表与历史消息加载

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{MarketChatSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::rpc_client::ChatApi;
use crate::storage::{Conversation, ConversationId, ConversationIndex, MessageLog, UserId};
use crate::subscription::SubscriptionManager;

/// 同步统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySyncStats {
    pub conversation_loads: u64,
    pub pages_loaded: u64,
    pub messages_inserted: u64,
}

pub struct HistorySync {
    api: Arc<dyn ChatApi>,
    message_log: Arc<MessageLog>,
    conversation_index: Arc<ConversationIndex>,
    subscriptions: Arc<SubscriptionManager>,
    event_manager: Arc<EventManager>,
    self_user: UserId,
    conversation_loads: AtomicU64,
    pages_loaded: AtomicU64,
    messages_inserted: AtomicU64,
}

impl HistorySync {
    pub fn new(
        api: Arc<dyn ChatApi>,
        message_log: Arc<MessageLog>,
        conversation_index: Arc<ConversationIndex>,
        subscriptions: Arc<SubscriptionManager>,
        event_manager: Arc<EventManager>,
        self_user: UserId,
    ) -> Self {
        Self {
            api,
            message_log,
            conversation_index,
            subscriptions,
            event_manager,
            self_user,
            conversation_loads: AtomicU64::new(0),
            pages_loaded: AtomicU64::new(0),
            messages_inserted: AtomicU64::new(0),
        }
    }

    /// 拉取会话列表，写入索引并对齐频道订阅
    ///
    /// 只增不删：本地已有而服务端列表里没有的会话保留，删除需要显式调用。
    #[instrument(skip(self))]
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        let summaries = self.api.fetch_conversations().await?;
        let total = summaries.len();
        let inserted = summaries
            .into_iter()
            .map(|summary| self.conversation_index.upsert(summary))
            .filter(|inserted| *inserted)
            .count();
        self.conversation_loads.fetch_add(1, Ordering::Relaxed);
        info!("[HistorySync] 会话列表已加载: total={}, new={}", total, inserted);

        let conversations = self.conversation_index.list_sorted();
        self.event_manager
            .emit(event_builders::conversation_list_reset(conversations.clone()))
            .await;
        self.subscriptions.sync_with_index().await;
        Ok(conversations)
    }

    /// 拉取一页历史消息并合并，返回是否还有更早的消息
    #[instrument(skip(self))]
    pub async fn load_messages(&self, conversation_id: &ConversationId, page: u32) -> Result<bool> {
        if page == 0 {
            return Err(MarketChatSDKError::InvalidInput("page starts at 1".to_string()));
        }
        if !self.conversation_index.contains(conversation_id) {
            return Err(MarketChatSDKError::NotFound(format!("conversation {}", conversation_id)));
        }

        let fetched = self.api.fetch_messages(conversation_id, page).await?;
        let count = fetched.messages.len();
        let messages = fetched
            .messages
            .into_iter()
            .map(|mut message| {
                message.sender_is_self = message.sender_id == self.self_user;
                message.pending = false;
                message
            })
            .collect();
        let inserted = self.message_log.merge_page(conversation_id, messages);
        self.pages_loaded.fetch_add(1, Ordering::Relaxed);
        self.messages_inserted.fetch_add(inserted as u64, Ordering::Relaxed);
        debug!(
            "[HistorySync] 历史消息: conversation={}, page={}, fetched={}, new={}, has_more={}",
            conversation_id, page, count, inserted, fetched.has_more
        );

        // 乐观消息不参与会话排序
        let last_confirmed = self
            .message_log
            .messages(conversation_id)
            .into_iter()
            .rev()
            .find(|message| !message.pending);
        if let Some(last) = last_confirmed {
            self.conversation_index
                .bump_on_message(conversation_id, &last, false);
        }
        self.event_manager
            .emit(event_builders::timeline_reset(
                conversation_id.clone(),
                self.message_log.messages(conversation_id),
            ))
            .await;
        Ok(fetched.has_more)
    }

    pub fn get_stats(&self) -> HistorySyncStats {
        HistorySyncStats {
            conversation_loads: self.conversation_loads.load(Ordering::Relaxed),
            pages_loaded: self.pages_loaded.load(Ordering::Relaxed),
            messages_inserted: self.messages_inserted.load(Ordering::Relaxed),
        }
    }
}
