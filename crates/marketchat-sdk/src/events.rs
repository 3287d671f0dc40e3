//! 事件系统模块 - 把引擎内的状态变化推送给 UI 层
//!
//! 功能包括：
//! - 消息时间线差异（追加 / 更新 / 移除 / 重置）
//! - 会话列表更新与未读数变更
//! - 已读回执、输入状态、在线状态事件
//! - 连接状态变更
//! - 用户操作失败与丢弃推送的诊断事件
//! - 事件广播和订阅机制
//!
//! UI 层只能通过查询接口和这里的事件读取状态，不能直接修改存储。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection_state::ConnectionStatus;
use crate::storage::entities::{Conversation, ConversationId, CorrelationToken, Message, MessageId, UserId};
use crate::utils::time::now_millis;

/// 时间线差异类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TimelineDiffKind {
    /// 重置整个时间线（加载历史页之后）
    Reset { messages: Vec<Message> },
    /// 插入新消息；位置由 `(created_at, id)` 决定，UI 需按排序键插入
    Insert { message: Message },
    /// 更新指定消息（去重合并、乐观消息被确认、已读）
    UpdateByItemId { item_id: MessageId, message: Message },
    /// 删除指定消息（发送失败回滚）
    RemoveByItemId { item_id: MessageId },
}

/// 会话列表更新类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConversationListUpdateKind {
    /// 重置整个会话列表（已排序）
    Reset { conversations: Vec<Conversation> },
    /// 更新单个会话
    Update { conversation: Conversation },
    /// 删除会话
    Remove { conversation_id: ConversationId },
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 时间线差异
    TimelineDiff {
        conversation_id: ConversationId,
        diff_kind: TimelineDiffKind,
        timestamp: i64,
    },
    /// 会话列表更新
    ConversationListUpdate {
        update_kind: ConversationListUpdateKind,
        timestamp: i64,
    },
    /// 未读数变更
    UnreadCountChanged {
        conversation_id: ConversationId,
        unread_count: u32,
        timestamp: i64,
    },
    /// 已读回执接收（对方已读我的消息，或我的标记已读被确认）
    ReadReceiptReceived {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        read_at: i64,
    },
    /// 用户开始输入
    TypingStarted {
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        timestamp: i64,
    },
    /// 用户停止输入（显式停止或超时）
    TypingStopped {
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        timestamp: i64,
    },
    /// 用户在线状态变更
    UserPresenceChanged {
        user_id: UserId,
        is_online: bool,
        last_seen: Option<i64>,
        timestamp: i64,
    },
    /// 连接状态变更
    ConnectionStateChanged {
        old_state: ConnectionStatus,
        new_state: ConnectionStatus,
        timestamp: i64,
    },
    /// 消息发送成功
    MessageSent {
        conversation_id: ConversationId,
        message_id: MessageId,
        correlation_token: CorrelationToken,
        timestamp: i64,
    },
    /// 消息发送失败（乐观消息已回滚）
    MessageSendFailed {
        conversation_id: ConversationId,
        correlation_token: CorrelationToken,
        error: String,
        timestamp: i64,
    },
    /// 标记已读失败
    MarkReadFailed {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        error: String,
        timestamp: i64,
    },
    /// 无法解析的推送事件已被丢弃
    MalformedEventDropped {
        channel: String,
        event_name: String,
        reason: String,
        timestamp: i64,
    },
}

impl SDKEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::TimelineDiff { .. } => "timeline_diff",
            SDKEvent::ConversationListUpdate { .. } => "conversation_list_update",
            SDKEvent::UnreadCountChanged { .. } => "unread_count_changed",
            SDKEvent::ReadReceiptReceived { .. } => "read_receipt_received",
            SDKEvent::TypingStarted { .. } => "typing_started",
            SDKEvent::TypingStopped { .. } => "typing_stopped",
            SDKEvent::UserPresenceChanged { .. } => "user_presence_changed",
            SDKEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SDKEvent::MessageSent { .. } => "message_sent",
            SDKEvent::MessageSendFailed { .. } => "message_send_failed",
            SDKEvent::MarkReadFailed { .. } => "mark_read_failed",
            SDKEvent::MalformedEventDropped { .. } => "malformed_event_dropped",
        }
    }

    /// 获取事件关联的会话ID
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            SDKEvent::TimelineDiff { conversation_id, .. } => Some(conversation_id),
            SDKEvent::ConversationListUpdate { update_kind, .. } => match update_kind {
                ConversationListUpdateKind::Update { conversation } => Some(&conversation.id),
                ConversationListUpdateKind::Remove { conversation_id } => Some(conversation_id),
                ConversationListUpdateKind::Reset { .. } => None,
            },
            SDKEvent::UnreadCountChanged { conversation_id, .. } => Some(conversation_id),
            SDKEvent::ReadReceiptReceived { conversation_id, .. } => Some(conversation_id),
            SDKEvent::TypingStarted { conversation_id, .. } => conversation_id.as_ref(),
            SDKEvent::TypingStopped { conversation_id, .. } => conversation_id.as_ref(),
            SDKEvent::MessageSent { conversation_id, .. } => Some(conversation_id),
            SDKEvent::MessageSendFailed { conversation_id, .. } => Some(conversation_id),
            SDKEvent::MarkReadFailed { conversation_id, .. } => Some(conversation_id),
            _ => None,
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::TimelineDiff { timestamp, .. }
            | SDKEvent::ConversationListUpdate { timestamp, .. }
            | SDKEvent::UnreadCountChanged { timestamp, .. }
            | SDKEvent::TypingStarted { timestamp, .. }
            | SDKEvent::TypingStopped { timestamp, .. }
            | SDKEvent::UserPresenceChanged { timestamp, .. }
            | SDKEvent::ConnectionStateChanged { timestamp, .. }
            | SDKEvent::MessageSent { timestamp, .. }
            | SDKEvent::MessageSendFailed { timestamp, .. }
            | SDKEvent::MarkReadFailed { timestamp, .. }
            | SDKEvent::MalformedEventDropped { timestamp, .. } => *timestamp,
            SDKEvent::ReadReceiptReceived { read_at, .. } => *read_at,
        }
    }

    /// 获取事件相关的用户ID
    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            SDKEvent::TypingStarted { user_id, .. }
            | SDKEvent::TypingStopped { user_id, .. }
            | SDKEvent::UserPresenceChanged { user_id, .. } => Some(user_id),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 会话ID过滤器
    pub conversation_ids: Option<Vec<ConversationId>>,
    /// 用户ID过滤器
    pub user_ids: Option<Vec<UserId>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_conversation_ids(mut self, conversation_ids: Vec<ConversationId>) -> Self {
        self.conversation_ids = Some(conversation_ids);
        self
    }

    pub fn with_user_ids(mut self, user_ids: Vec<UserId>) -> Self {
        self.user_ids = Some(user_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref conversation_ids) = self.conversation_ids {
            match event.conversation_id() {
                Some(id) if conversation_ids.contains(id) => {}
                _ => return false,
            }
        }

        if let Some(ref user_ids) = self.user_ids {
            match event.user_id() {
                Some(id) if user_ids.contains(id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景（无 UI 的客户端），仅打 debug
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`"*"` 表示监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(Vec::len).sum();

        info!("Added listener for event type: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn timeline_insert(message: Message) -> SDKEvent {
        SDKEvent::TimelineDiff {
            conversation_id: message.conversation_id.clone(),
            diff_kind: TimelineDiffKind::Insert { message },
            timestamp: now_millis(),
        }
    }

    pub fn timeline_update(item_id: MessageId, message: Message) -> SDKEvent {
        SDKEvent::TimelineDiff {
            conversation_id: message.conversation_id.clone(),
            diff_kind: TimelineDiffKind::UpdateByItemId { item_id, message },
            timestamp: now_millis(),
        }
    }

    pub fn timeline_remove(conversation_id: ConversationId, item_id: MessageId) -> SDKEvent {
        SDKEvent::TimelineDiff {
            conversation_id,
            diff_kind: TimelineDiffKind::RemoveByItemId { item_id },
            timestamp: now_millis(),
        }
    }

    pub fn timeline_reset(conversation_id: ConversationId, messages: Vec<Message>) -> SDKEvent {
        SDKEvent::TimelineDiff {
            conversation_id,
            diff_kind: TimelineDiffKind::Reset { messages },
            timestamp: now_millis(),
        }
    }

    pub fn conversation_updated(conversation: Conversation) -> SDKEvent {
        SDKEvent::ConversationListUpdate {
            update_kind: ConversationListUpdateKind::Update { conversation },
            timestamp: now_millis(),
        }
    }

    pub fn conversation_removed(conversation_id: ConversationId) -> SDKEvent {
        SDKEvent::ConversationListUpdate {
            update_kind: ConversationListUpdateKind::Remove { conversation_id },
            timestamp: now_millis(),
        }
    }

    pub fn conversation_list_reset(conversations: Vec<Conversation>) -> SDKEvent {
        SDKEvent::ConversationListUpdate {
            update_kind: ConversationListUpdateKind::Reset { conversations },
            timestamp: now_millis(),
        }
    }

    pub fn unread_count_changed(conversation_id: ConversationId, unread_count: u32) -> SDKEvent {
        SDKEvent::UnreadCountChanged {
            conversation_id,
            unread_count,
            timestamp: now_millis(),
        }
    }

    pub fn read_receipt_received(
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        read_at: i64,
    ) -> SDKEvent {
        SDKEvent::ReadReceiptReceived {
            conversation_id,
            message_ids,
            read_at,
        }
    }

    pub fn typing_indicator(
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        is_typing: bool,
    ) -> SDKEvent {
        let timestamp = now_millis();
        if is_typing {
            SDKEvent::TypingStarted {
                user_id,
                conversation_id,
                timestamp,
            }
        } else {
            SDKEvent::TypingStopped {
                user_id,
                conversation_id,
                timestamp,
            }
        }
    }

    pub fn user_presence_changed(user_id: UserId, is_online: bool, last_seen: Option<i64>) -> SDKEvent {
        SDKEvent::UserPresenceChanged {
            user_id,
            is_online,
            last_seen,
            timestamp: now_millis(),
        }
    }

    pub fn connection_state_changed(old_state: ConnectionStatus, new_state: ConnectionStatus) -> SDKEvent {
        SDKEvent::ConnectionStateChanged {
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }

    pub fn message_sent(message: &Message, correlation_token: CorrelationToken) -> SDKEvent {
        SDKEvent::MessageSent {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            correlation_token,
            timestamp: now_millis(),
        }
    }

    pub fn message_send_failed(
        conversation_id: ConversationId,
        correlation_token: CorrelationToken,
        error: String,
    ) -> SDKEvent {
        SDKEvent::MessageSendFailed {
            conversation_id,
            correlation_token,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn mark_read_failed(
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        error: String,
    ) -> SDKEvent {
        SDKEvent::MarkReadFailed {
            conversation_id,
            message_ids,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn malformed_event_dropped(channel: &str, event_name: &str, reason: String) -> SDKEvent {
        SDKEvent::MalformedEventDropped {
            channel: channel.to_string(),
            event_name: event_name.to_string(),
            reason,
            timestamp: now_millis(),
        }
    }
}
