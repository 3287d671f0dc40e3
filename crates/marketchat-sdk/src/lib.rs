//! MarketChat SDK - 市场买卖双方一对一聊天的实时同步引擎
//!
//! 本 SDK 把三类输入合并成一份一致的本地视图：
//! - 请求/响应接口（拉取会话、历史消息，发送消息，标记已读，输入状态）
//! - 推送通道（新消息、已读回执、输入状态、在线状态）
//! - 用户操作（发送、阅读、切换当前会话）
//!
//! 并保证：消息按 `(created_at, id)` 排序且按 id 去重、乐观消息通过关联令牌精确落地、
//! 已读状态单调、未读数不为负、对方输入状态自动过期、推送重复投递幂等。
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marketchat_sdk::{ChatApi, MarketChatConfig, MarketChatSDK, MessageDraft, PushTransport};
//!
//! async fn run(api: Arc<dyn ChatApi>, transport: Arc<dyn PushTransport>) -> marketchat_sdk::Result<()> {
//!     let config = MarketChatConfig::builder().user_id("42").build();
//!     let sdk = MarketChatSDK::initialize(config, api, transport).await?;
//!
//!     let mut events = sdk.subscribe_events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{}", event.event_type());
//!         }
//!     });
//!
//!     sdk.load_conversations().await?;
//!     sdk.connect().await?;
//!
//!     if let Some(conversation) = sdk.list_conversations().first() {
//!         sdk.set_active_conversation(Some(conversation.id.clone())).await;
//!         sdk.send_message(&conversation.id, MessageDraft::text("还在吗？")).await?;
//!     }
//!
//!     sdk.shutdown().await
//! }
//! ```

pub mod config;
pub mod connection_state;
pub mod error;
pub mod events;
pub mod network;
pub mod presence;
pub mod read_receipt;
pub mod realtime;
pub mod rpc_client;
pub mod sdk;
pub mod send_pipeline;
pub mod storage;
pub mod subscription;
pub mod sync;
pub mod typing;
pub mod utils;
pub mod version;

pub use config::{ChannelConfig, EventConfig, MarketChatConfig, MarketChatConfigBuilder};
pub use connection_state::{ConnectionState, ConnectionStateManager, ConnectionStats, ConnectionStatus};
pub use error::{MarketChatSDKError, Result};
pub use events::{
    ConversationListUpdateKind, EventFilter, EventManager, EventStats, FilteredEventReceiver, SDKEvent,
    TimelineDiffKind,
};
pub use network::{PushHandler, PushTransport, RawEvent, TransportEvent};
pub use presence::{PresenceCacheConfig, PresenceCacheStats, PresenceInfo, PresenceManager};
pub use read_receipt::{MarkReadReport, ReadReceiptReconciler};
pub use realtime::{EventKind, NormalizedEvent, RealtimeRouter};
pub use rpc_client::{ChatApi, MessagePage};
pub use sdk::MarketChatSDK;
pub use send_pipeline::SendPipeline;
pub use storage::{
    AppendOutcome, Conversation, ConversationId, ConversationIndex, ConversationSummary, CorrelationToken,
    FileAttachment, Message, MessageBody, MessageDraft, MessageId, MessageLog, OutgoingMessage, Participant,
    UserId,
};
pub use subscription::SubscriptionManager;
pub use sync::{HistorySync, HistorySyncStats};
pub use typing::{TypingManager, TypingStats, TypingTracker, TypingTransition, DEFAULT_TYPING_TIMEOUT};
pub use utils::TimeFormatter;
pub use version::SDK_VERSION;
