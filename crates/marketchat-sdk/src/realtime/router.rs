//! 实时事件路由器
//!
//! 一张分发表：事件名（含别名）-> `EventKind` -> 处理函数。
//! 单个事件处理失败只记录日志，不会影响后续事件；重复投递的结果与投递一次相同。

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::connection_state::ConnectionStateManager;
use crate::events::{event_builders, EventManager};
use crate::network::RawEvent;
use crate::presence::PresenceManager;
use crate::read_receipt::ReadReceiptReconciler;
use crate::realtime::payload::{normalize, EventKind, NormalizedEvent};
use crate::storage::{AppendOutcome, ConversationId, ConversationIndex, Message, MessageId, MessageLog, UserId};
use crate::subscription::SubscriptionManager;
use crate::typing::TypingManager;

/// 路由器依赖的组件
pub struct RouterContext {
    pub self_user: UserId,
    pub channels: ChannelConfig,
    pub auto_mark_as_read: bool,
    pub message_log: Arc<MessageLog>,
    pub conversation_index: Arc<ConversationIndex>,
    pub reconciler: Arc<ReadReceiptReconciler>,
    pub typing: Arc<TypingManager>,
    pub presence: Arc<PresenceManager>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub connection_state: ConnectionStateManager,
    pub event_manager: Arc<EventManager>,
}

pub struct RealtimeRouter {
    ctx: RouterContext,
    dispatch: HashMap<&'static str, EventKind>,
}

impl RealtimeRouter {
    pub fn new(ctx: RouterContext) -> Self {
        let dispatch = EventKind::ALL
            .iter()
            .flat_map(|kind| kind.aliases().iter().map(move |name| (*name, *kind)))
            .collect();
        Self { ctx, dispatch }
    }

    /// 处理一个原始推送事件
    pub async fn route(&self, raw: RawEvent) {
        let Some(kind) = self.dispatch.get(raw.event.as_str()).copied() else {
            debug!("[Router] 忽略未注册的事件: {} on {}", raw.event, raw.channel);
            return;
        };

        let event = match normalize(kind, &raw, &self.ctx.self_user, &self.ctx.channels) {
            Ok(event) => event,
            Err(e) => {
                warn!("[Router] 丢弃无法解析的事件: {} on {}: {}", raw.event, raw.channel, e);
                self.ctx.connection_state.record_event_dropped().await;
                self.ctx
                    .event_manager
                    .emit(event_builders::malformed_event_dropped(&raw.channel, &raw.event, e.to_string()))
                    .await;
                return;
            }
        };

        self.ctx.connection_state.record_event_received().await;
        self.dispatch_event(event).await;
    }

    async fn dispatch_event(&self, event: NormalizedEvent) {
        match event {
            NormalizedEvent::NewMessage {
                conversation_id,
                message,
                counterpart,
            } => self.on_new_message(conversation_id, message, counterpart).await,
            NormalizedEvent::MessageRead {
                conversation_id,
                reader_id,
                message_ids,
                read_at,
            } => {
                self.on_message_read(conversation_id, reader_id, message_ids, read_at)
                    .await
            }
            NormalizedEvent::Typing {
                user_id,
                conversation_id,
                is_typing,
            } => {
                if user_id != self.ctx.self_user {
                    self.ctx
                        .typing
                        .handle_remote_typing(user_id, conversation_id, is_typing)
                        .await;
                }
            }
            NormalizedEvent::Presence {
                user_id,
                is_online,
                last_seen,
            } => {
                if user_id != self.ctx.self_user {
                    self.ctx
                        .presence
                        .handle_status_change(user_id, is_online, last_seen)
                        .await;
                }
            }
        }
    }

    /// 推送引用了未知会话时懒创建，并在已连接时订阅其频道
    async fn materialize(&self, conversation_id: &ConversationId, counterpart: &UserId) {
        if self.ctx.conversation_index.contains(conversation_id) {
            return;
        }
        let participant = self.ctx.presence.participant_for(counterpart).await;
        if self.ctx.conversation_index.ensure(conversation_id, participant) {
            info!("[Router] 懒创建会话: {}", conversation_id);
            self.ctx
                .subscriptions
                .on_conversation_added(conversation_id)
                .await;
        }
    }

    async fn on_new_message(&self, conversation_id: ConversationId, message: Message, counterpart: Option<UserId>) {
        let counterpart = counterpart.unwrap_or_else(|| message.sender_id.clone());
        self.materialize(&conversation_id, &counterpart).await;

        let message_id = message.id.clone();
        let token = message.correlation_token.clone();
        let is_incoming = !message.sender_is_self;
        let outcome = self.ctx.message_log.append(&conversation_id, message);
        let Some(stored) = self.ctx.message_log.get(&conversation_id, &message_id) else {
            warn!("[Router] 消息写入后未找到: {}/{}", conversation_id, message_id);
            return;
        };

        let diff = match (outcome, token) {
            (AppendOutcome::Inserted, _) => event_builders::timeline_insert(stored.clone()),
            (AppendOutcome::ResolvedPending, Some(token)) => {
                event_builders::timeline_update(MessageId::local(&token), stored.clone())
            }
            _ => event_builders::timeline_update(message_id.clone(), stored.clone()),
        };
        self.ctx.event_manager.emit(diff).await;

        if outcome == AppendOutcome::Merged {
            debug!("[Router] 重复消息已合并: {}/{}", conversation_id, message_id);
            return;
        }

        let is_incoming = is_incoming && outcome.is_new();
        let before = self
            .ctx
            .conversation_index
            .get(&conversation_id)
            .map(|c| c.unread_count);
        let unread = self
            .ctx
            .conversation_index
            .bump_on_message(&conversation_id, &stored, is_incoming);
        if let Some(conversation) = self.ctx.conversation_index.get(&conversation_id) {
            self.ctx
                .event_manager
                .emit(event_builders::conversation_updated(conversation))
                .await;
        }
        if let Some(unread) = unread.filter(|unread| Some(*unread) != before) {
            self.ctx
                .event_manager
                .emit(event_builders::unread_count_changed(conversation_id.clone(), unread))
                .await;
        }

        if is_incoming
            && self.ctx.auto_mark_as_read
            && self.ctx.conversation_index.is_active(&conversation_id)
        {
            let reconciler = self.ctx.reconciler.clone();
            tokio::spawn(async move {
                reconciler
                    .request_mark_read(&conversation_id, &[message_id])
                    .await;
            });
        }
    }

    /// 已读回执：会话 ID 是主键，读者 ID 只用于查找会话
    async fn on_message_read(
        &self,
        conversation_id: Option<ConversationId>,
        reader_id: Option<UserId>,
        message_ids: Vec<MessageId>,
        read_at: i64,
    ) {
        let conversations = match (conversation_id, &reader_id) {
            (Some(conversation_id), reader) => {
                if let Some(reader) = reader.as_ref().filter(|r| **r != self.ctx.self_user) {
                    self.materialize(&conversation_id, reader).await;
                }
                vec![conversation_id]
            }
            (None, Some(reader)) => self.ctx.conversation_index.find_by_participant(reader),
            (None, None) => Vec::new(),
        };
        if conversations.is_empty() {
            debug!("[Router] 已读回执没有对应的会话: reader={:?}", reader_id);
            return;
        }

        for conversation_id in conversations {
            let changed = self
                .ctx
                .message_log
                .apply_read_receipt(&conversation_id, &message_ids, read_at);
            for id in &changed {
                if let Some(message) = self.ctx.message_log.get(&conversation_id, id) {
                    self.ctx
                        .event_manager
                        .emit(event_builders::timeline_update(id.clone(), message))
                        .await;
                }
            }
            if !changed.is_empty() {
                self.ctx
                    .event_manager
                    .emit(event_builders::read_receipt_received(conversation_id.clone(), changed, read_at))
                    .await;
            }
            if self.ctx.conversation_index.clear_unread(&conversation_id) {
                self.ctx
                    .event_manager
                    .emit(event_builders::unread_count_changed(conversation_id, 0))
                    .await;
            }
        }
    }
}
