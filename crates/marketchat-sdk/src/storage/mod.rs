//! 存储模块 - 同步引擎的内存状态层
//!
//! - Entities: 数据实体定义，类型安全的标识符
//! - MessageLog: 每个会话的有序、去重消息日志
//! - ConversationIndex: 会话索引（未读数、活跃时间、当前会话）
//!
//! 持久化由外部协作方负责，这里只维护内存中的一致视图。
//! 所有锁都是同步锁，调用方不得跨 `.await` 持有。

pub mod conversation_index;
pub mod entities;
pub mod message_log;

pub use conversation_index::ConversationIndex;
pub use entities::{
    Conversation, ConversationId, ConversationSummary, CorrelationToken, FileAttachment, Message,
    MessageBody, MessageDraft, MessageId, OutgoingMessage, Participant, UserId,
};
pub use message_log::{AppendOutcome, MessageLog};
