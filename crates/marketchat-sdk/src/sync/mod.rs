//! 历史同步模块
//!
//! 职责：
//! - 拉取会话列表并写入会话索引
//! - 分页拉取历史消息，经由消息日志的 `append` 合并，与推送、乐观消息交错也不会乱序

pub mod history;

pub use history::{HistorySync, HistorySyncStats};
