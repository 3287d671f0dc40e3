//! 频道订阅管理
//!
//! - 个人频道 + 每个已知会话一个频道
//! - 连接建立后订阅全部频道；未连接时新会话的订阅推迟到下一次连接
//! - 订阅幂等：频道在 `.await` 之前预占，失败时释放
//! - 每个频道绑定所有事件别名，回调只把原始事件转发到引擎队列

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::connection_state::ConnectionStateManager;
use crate::error::Result;
use crate::network::{PushHandler, PushTransport, RawEvent};
use crate::realtime::EventKind;
use crate::storage::{ConversationId, ConversationIndex, UserId};

pub struct SubscriptionManager {
    transport: Arc<dyn PushTransport>,
    connection_state: ConnectionStateManager,
    conversation_index: Arc<ConversationIndex>,
    channels: ChannelConfig,
    self_user: UserId,
    event_sender: mpsc::UnboundedSender<RawEvent>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        connection_state: ConnectionStateManager,
        conversation_index: Arc<ConversationIndex>,
        channels: ChannelConfig,
        self_user: UserId,
        event_sender: mpsc::UnboundedSender<RawEvent>,
    ) -> Self {
        Self {
            transport,
            connection_state,
            conversation_index,
            channels,
            self_user,
            event_sender,
        }
    }

    pub fn personal_channel(&self) -> String {
        self.channels.user_channel(&self.self_user)
    }

    pub fn conversation_channel(&self, conversation_id: &ConversationId) -> String {
        self.channels.conversation_channel(conversation_id)
    }

    /// 订阅频道；返回 true 表示本次真正发起了订阅
    ///
    /// 未连接或已订阅时直接返回 false。
    pub async fn subscribe(&self, channel: &str) -> Result<bool> {
        if !self
            .connection_state
            .reserve_channel_if_connected(channel)
            .await
        {
            debug!("[Subscription] 未连接或已订阅，跳过: {}", channel);
            return Ok(false);
        }

        // 先绑定再订阅，避免订阅成功到绑定之间的事件丢失
        self.bind_channel(channel);
        match self.transport.subscribe(channel).await {
            Ok(()) => {
                debug!("[Subscription] 已订阅: {}", channel);
                Ok(true)
            }
            Err(e) => {
                warn!("[Subscription] 订阅失败: {}, {}", channel, e);
                self.transport.unbind_all(channel);
                self.connection_state.release_channel(channel).await;
                Err(e)
            }
        }
    }

    fn bind_channel(&self, channel: &str) {
        self.transport.unbind_all(channel);
        for event_name in EventKind::all_event_names() {
            let sender = self.event_sender.clone();
            let handler: PushHandler = Arc::new(move |raw: RawEvent| {
                if sender.send(raw).is_err() {
                    debug!("[Subscription] 引擎已停止，丢弃推送事件");
                }
            });
            self.transport.bind(channel, event_name, handler);
        }
    }

    /// 连接建立：订阅个人频道和全部会话频道，返回新订阅数
    pub async fn on_connected(&self) -> usize {
        let mut channels = vec![self.personal_channel()];
        channels.extend(
            self.conversation_index
                .ids()
                .iter()
                .map(|id| self.conversation_channel(id)),
        );

        let mut subscribed = 0;
        for channel in &channels {
            match self.subscribe(channel).await {
                Ok(true) => subscribed += 1,
                Ok(false) => {}
                Err(e) => warn!("[Subscription] 重新订阅失败: {}, {}", channel, e),
            }
        }
        info!("[Subscription] 连接后订阅 {} / {} 个频道", subscribed, channels.len());
        subscribed
    }

    /// 会话索引新增会话：已连接则立即订阅，否则等待下一次连接
    pub async fn on_conversation_added(&self, conversation_id: &ConversationId) {
        let channel = self.conversation_channel(conversation_id);
        if let Err(e) = self.subscribe(&channel).await {
            warn!("[Subscription] 新会话订阅失败: {}, {}", conversation_id, e);
        }
    }

    /// 与会话索引对齐：订阅缺失的会话频道，退订不再被引用的会话频道
    pub async fn sync_with_index(&self) {
        let known = self.conversation_index.ids();
        for conversation_id in &known {
            self.on_conversation_added(conversation_id).await;
        }

        let stale: Vec<String> = self
            .connection_state
            .subscribed_channels()
            .await
            .into_iter()
            .filter(|channel| {
                self.channels
                    .conversation_from_channel(channel)
                    .is_some_and(|id| !known.contains(&id))
            })
            .collect();
        for channel in stale {
            self.unsubscribe(&channel).await;
        }
    }

    pub async fn unsubscribe_conversation(&self, conversation_id: &ConversationId) {
        let channel = self.conversation_channel(conversation_id);
        self.unsubscribe(&channel).await;
    }

    async fn unsubscribe(&self, channel: &str) {
        self.transport.unbind_all(channel);
        if !self.connection_state.release_channel(channel).await {
            return;
        }
        match self.transport.unsubscribe(channel).await {
            Ok(()) => debug!("[Subscription] 已退订: {}", channel),
            Err(e) => warn!("[Subscription] 退订失败: {}, {}", channel, e),
        }
    }

    /// 会话结束：解绑并退订全部频道
    pub async fn teardown(&self) -> usize {
        let channels = self.connection_state.clear_channels().await;
        for channel in &channels {
            self.transport.unbind_all(channel);
            if let Err(e) = self.transport.unsubscribe(channel).await {
                warn!("[Subscription] 退订失败: {}, {}", channel, e);
            }
        }
        info!("[Subscription] 已清理 {} 个频道", channels.len());
        channels.len()
    }
}
