//! 统一 SDK 接口 - MarketChatSDK 主入口
//!
//! 分层架构：
//! ```text
//! MarketChatSDK (对外接口)
//!   ├── SendPipeline / ReadReceiptReconciler / TypingManager (用户操作)
//!   ├── RealtimeRouter (推送事件分发，运行在引擎任务上)
//!   ├── SubscriptionManager + ConnectionStateManager (推送通道)
//!   ├── MessageLog + ConversationIndex (内存存储)
//!   └── EventManager (UI 只读订阅)
//! ```
//!
//! 推送事件与连接事件都在同一个引擎任务上串行处理；用户操作直接在调用方任务上执行，
//! 通过存储层的同步锁与引擎任务交错。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MarketChatConfig;
use crate::connection_state::{ConnectionState, ConnectionStateManager, ConnectionStatus};
use crate::error::{MarketChatSDKError, Result};
use crate::events::{event_builders, EventFilter, EventManager, FilteredEventReceiver, SDKEvent};
use crate::network::{PushTransport, RawEvent, TransportEvent};
use crate::presence::{PresenceInfo, PresenceManager};
use crate::read_receipt::{MarkReadReport, ReadReceiptReconciler};
use crate::realtime::{RealtimeRouter, RouterContext};
use crate::rpc_client::ChatApi;
use crate::send_pipeline::SendPipeline;
use crate::storage::{Conversation, ConversationId, ConversationIndex, Message, MessageDraft, MessageId, MessageLog, UserId};
use crate::subscription::SubscriptionManager;
use crate::sync::{HistorySync, HistorySyncStats};
use crate::typing::TypingManager;
use crate::version::SDK_VERSION;

/// MarketChat SDK 主入口
pub struct MarketChatSDK {
    config: MarketChatConfig,
    transport: Arc<dyn PushTransport>,
    event_manager: Arc<EventManager>,
    message_log: Arc<MessageLog>,
    conversation_index: Arc<ConversationIndex>,
    connection_state: ConnectionStateManager,
    typing: Arc<TypingManager>,
    presence: Arc<PresenceManager>,
    reconciler: Arc<ReadReceiptReconciler>,
    send_pipeline: SendPipeline,
    subscriptions: Arc<SubscriptionManager>,
    history: HistorySync,
    cancel: CancellationToken,
    engine: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl MarketChatSDK {
    /// 初始化 SDK 并启动引擎任务（尚未连接推送通道）
    pub async fn initialize(
        config: MarketChatConfig,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            "[SDK] 初始化 MarketChatSDK v{}: user={}",
            SDK_VERSION, config.user_id
        );

        let self_user = config.user_id.clone();
        let event_manager = Arc::new(EventManager::new(config.event_config.buffer_size));
        let message_log = Arc::new(MessageLog::new());
        let conversation_index = Arc::new(ConversationIndex::new());
        let connection_state = ConnectionStateManager::new();
        let (raw_sender, raw_receiver) = mpsc::unbounded_channel::<RawEvent>();

        let typing = Arc::new(TypingManager::with_timeout(
            event_manager.clone(),
            api.clone(),
            config.typing_timeout(),
        ));
        let presence = Arc::new(PresenceManager::new(conversation_index.clone(), event_manager.clone()));
        let reconciler = Arc::new(ReadReceiptReconciler::new(
            api.clone(),
            message_log.clone(),
            conversation_index.clone(),
            event_manager.clone(),
        ));
        let send_pipeline = SendPipeline::new(
            api.clone(),
            message_log.clone(),
            conversation_index.clone(),
            event_manager.clone(),
            self_user.clone(),
        );
        let subscriptions = Arc::new(SubscriptionManager::new(
            transport.clone(),
            connection_state.clone(),
            conversation_index.clone(),
            config.channel_config.clone(),
            self_user.clone(),
            raw_sender,
        ));
        let history = HistorySync::new(
            api.clone(),
            message_log.clone(),
            conversation_index.clone(),
            subscriptions.clone(),
            event_manager.clone(),
            self_user.clone(),
        );
        let router = RealtimeRouter::new(RouterContext {
            self_user,
            channels: config.channel_config.clone(),
            auto_mark_as_read: config.auto_mark_as_read,
            message_log: message_log.clone(),
            conversation_index: conversation_index.clone(),
            reconciler: reconciler.clone(),
            typing: typing.clone(),
            presence: presence.clone(),
            subscriptions: subscriptions.clone(),
            connection_state: connection_state.clone(),
            event_manager: event_manager.clone(),
        });

        let cancel = CancellationToken::new();
        let engine = Engine {
            router,
            connection_state: connection_state.clone(),
            subscriptions: subscriptions.clone(),
            event_manager: event_manager.clone(),
            debug_mode: config.debug_mode,
        };
        let handle = tokio::spawn(engine.run(raw_receiver, transport.connection_events(), cancel.clone()));

        Ok(Arc::new(Self {
            config,
            transport,
            event_manager,
            message_log,
            conversation_index,
            connection_state,
            typing,
            presence,
            reconciler,
            send_pipeline,
            subscriptions,
            history,
            cancel,
            engine: Mutex::new(Some(handle)),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn version(&self) -> &'static str {
        SDK_VERSION
    }

    pub fn config(&self) -> &MarketChatConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MarketChatSDKError::ShuttingDown("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    // ========== 连接生命周期 ==========

    /// 发起推送通道连接，连接结果经引擎任务异步应用
    pub async fn connect(&self) -> Result<()> {
        self.ensure_running()?;
        info!("[SDK] 正在连接推送通道...");
        self.transport.connect().await
    }

    /// 关闭 SDK：解绑并退订全部频道，清除输入状态定时器与在线状态缓存，断开连接，停止引擎任务
    ///
    /// 在途的网络请求不会被取消。
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[SDK] 正在关闭 MarketChatSDK...");

        let channels = self.subscriptions.teardown().await;
        let timers = self.typing.clear_all();
        self.presence.clear_cache().await;
        debug!("[SDK] 已清理 {} 个频道, {} 个输入状态", channels, timers);

        let disconnect_result = self.transport.disconnect().await;
        self.cancel.cancel();
        let engine = self.engine.lock().take();
        if let Some(handle) = engine {
            if let Err(e) = handle.await {
                warn!("[SDK] 引擎任务异常退出: {}", e);
            }
        }
        self.connection_state
            .apply_transport_event(&TransportEvent::Disconnected)
            .await;

        info!("[SDK] MarketChatSDK 关闭完成");
        disconnect_result
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state.is_connected().await
    }

    /// 连接快照：状态、已订阅频道、连接时间、最近错误与计数
    pub async fn connection_state(&self) -> ConnectionState {
        self.connection_state.get_state().await
    }

    // ========== 查询 ==========

    /// 按活跃时间倒序的会话列表
    pub fn list_conversations(&self) -> Vec<Conversation> {
        self.conversation_index.list_sorted()
    }

    pub fn get_conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.conversation_index.get(conversation_id)
    }

    /// 会话内按 `(created_at, id)` 升序的消息，包含发送中的乐观消息
    pub fn list_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.message_log.messages(conversation_id)
    }

    pub fn unread_total(&self) -> u64 {
        self.conversation_index.unread_total()
    }

    pub fn is_user_typing(&self, user_id: &UserId) -> bool {
        self.typing.is_user_typing(user_id)
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.typing.typing_users()
    }

    pub async fn get_presence(&self, user_id: &UserId) -> Option<PresenceInfo> {
        self.presence.get_presence(user_id).await
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.conversation_index.active()
    }

    pub fn history_stats(&self) -> HistorySyncStats {
        self.history.get_stats()
    }

    // ========== 历史同步 ==========

    pub async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.ensure_running()?;
        self.history.load_conversations().await
    }

    /// 加载一页历史消息，返回是否还有更早的消息
    pub async fn load_messages(&self, conversation_id: &ConversationId, page: u32) -> Result<bool> {
        self.ensure_running()?;
        self.history.load_messages(conversation_id, page).await
    }

    // ========== 消息操作 ==========

    /// 发送消息；失败时乐观消息被移除，草稿随 `SendFailed` 返回
    ///
    /// 只能发往已知会话，未知会话返回 `NotFound`（给新用户发消息用 `start_conversation`）。
    pub async fn send_message(&self, conversation_id: &ConversationId, draft: MessageDraft) -> Result<Message> {
        self.ensure_running()?;
        self.send_pipeline.send(conversation_id, draft).await
    }

    /// 给尚无会话的用户发送第一条消息
    #[instrument(skip(self, draft))]
    pub async fn start_conversation(&self, recipient_id: &UserId, draft: MessageDraft) -> Result<Message> {
        self.ensure_running()?;
        let participant = self.presence.participant_for(recipient_id).await;
        let message = self
            .send_pipeline
            .start_conversation(recipient_id, draft, participant)
            .await?;
        self.subscriptions
            .on_conversation_added(&message.conversation_id)
            .await;
        Ok(message)
    }

    /// 标记消息已读；部分失败时返回 `MarkReadFailed`，成功的部分已经生效
    pub async fn mark_messages_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<MarkReadReport> {
        self.ensure_running()?;
        self.reconciler
            .request_mark_read(conversation_id, message_ids)
            .await
            .into_result(conversation_id)
    }

    /// 标记会话内所有已加载的未读来信为已读，并清零未读数
    ///
    /// 有消息因已有请求在途而被跳过时不清零，未读数在那次请求确认后归零。
    pub async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<MarkReadReport> {
        self.ensure_running()?;
        if !self.conversation_index.contains(conversation_id) {
            return Err(MarketChatSDKError::NotFound(format!("conversation {}", conversation_id)));
        }

        let unseen = self.message_log.unseen_incoming(conversation_id);
        let report = if unseen.is_empty() {
            MarkReadReport::default()
        } else {
            self.reconciler.request_mark_read(conversation_id, &unseen).await
        };

        // 跳过的消息由在途请求负责，确认后由协调器清零
        if report.is_success()
            && report.skipped.is_empty()
            && self.conversation_index.clear_unread(conversation_id)
        {
            self.event_manager
                .emit(event_builders::unread_count_changed(conversation_id.clone(), 0))
                .await;
        }
        report.into_result(conversation_id)
    }

    /// 通知对方本地用户的输入状态（不做防抖）
    pub async fn set_typing_status(&self, target_user_id: &UserId, is_typing: bool) -> Result<()> {
        self.ensure_running()?;
        self.typing.set_local_typing(target_user_id, is_typing).await
    }

    /// 设置当前查看的会话
    ///
    /// 离开的会话清除输入状态；进入的会话在开启自动已读时标记已读（失败只记录日志）。
    pub async fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        let previous = self.conversation_index.active();
        if previous == conversation_id {
            return;
        }
        self.conversation_index.set_active(conversation_id.clone());
        debug!("[SDK] 当前会话: {:?} -> {:?}", previous, conversation_id);

        if let Some(previous) = previous {
            self.typing.clear_conversation(&previous).await;
        }
        if let Some(conversation_id) = conversation_id {
            if self.config.auto_mark_as_read && self.conversation_index.contains(&conversation_id) {
                if let Err(e) = self.mark_conversation_read(&conversation_id).await {
                    warn!("[SDK] 自动标记已读失败: {}, {}", conversation_id, e);
                }
            }
        }
    }

    /// 删除本地会话：清除消息、输入状态并退订频道
    pub async fn remove_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        self.ensure_running()?;
        let removed = self
            .conversation_index
            .remove(conversation_id)
            .ok_or_else(|| MarketChatSDKError::NotFound(format!("conversation {}", conversation_id)))?;
        let messages = self.message_log.remove_conversation(conversation_id);
        self.typing.clear_conversation(conversation_id).await;
        self.subscriptions.unsubscribe_conversation(conversation_id).await;
        info!(
            "[SDK] 会话已删除: {}, participant={}, messages={}",
            conversation_id, removed.participant.id, messages
        );
        self.event_manager
            .emit(event_builders::conversation_removed(conversation_id.clone()))
            .await;
        Ok(())
    }

    // ========== 事件订阅 ==========

    pub fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.event_manager.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.event_manager.subscribe_filtered(filter)
    }

    pub fn event_manager(&self) -> Arc<EventManager> {
        self.event_manager.clone()
    }
}

/// 引擎任务：串行处理推送事件与连接生命周期事件
struct Engine {
    router: RealtimeRouter,
    connection_state: ConnectionStateManager,
    subscriptions: Arc<SubscriptionManager>,
    event_manager: Arc<EventManager>,
    debug_mode: bool,
}

impl Engine {
    async fn run(
        self,
        mut raw_events: mpsc::UnboundedReceiver<RawEvent>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        debug!("[Engine] 引擎任务已启动");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = transport_events.recv() => match event {
                    Ok(event) => self.on_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[Engine] 连接事件积压，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("[Engine] 推送通道已关闭");
                        break;
                    }
                },
                raw = raw_events.recv() => match raw {
                    Some(raw) => {
                        if self.debug_mode {
                            info!("[Engine] 推送事件: {} on {}", raw.event, raw.channel);
                        }
                        self.router.route(raw).await;
                    }
                    None => break,
                },
            }
        }
        debug!("[Engine] 引擎任务已退出");
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        let Some((old_state, new_state)) = self.connection_state.apply_transport_event(&event).await else {
            return;
        };
        self.event_manager
            .emit(event_builders::connection_state_changed(old_state, new_state))
            .await;
        if new_state == ConnectionStatus::Connected {
            self.subscriptions.on_connected().await;
        }
        if self.debug_mode {
            self.connection_state.log_state().await;
        }
    }
}
