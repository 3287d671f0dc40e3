//! 已读回执协调器
//!
//! 同一条消息同一时间最多只有一个标记已读请求在途：在途集合在第一个 `.await`
//! 之前同步写入，请求结束（无论成功失败，包括调用方取消）时移除。
//! 只有服务端确认后才会在消息日志中设置 `seen`。

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{MarketChatSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::rpc_client::ChatApi;
use crate::storage::{ConversationId, ConversationIndex, MessageId, MessageLog};
use crate::utils::time::now_millis;

type InFlightKey = (ConversationId, MessageId);

/// 一次标记已读请求的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkReadReport {
    /// 本次实际发出请求的消息
    pub requested: Vec<MessageId>,
    /// 已有请求在途而跳过的消息
    pub skipped: Vec<MessageId>,
    /// 服务端确认的消息
    pub confirmed: Vec<MessageId>,
    /// 失败的消息及原因
    pub failed: Vec<(MessageId, String)>,
}

impl MarkReadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 有失败时转换为用户可见的错误（成功部分已经生效）
    pub fn into_result(self, conversation_id: &ConversationId) -> Result<MarkReadReport> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let reason = self
            .failed
            .first()
            .map(|(_, reason)| reason.clone())
            .unwrap_or_default();
        Err(MarketChatSDKError::MarkReadFailed {
            conversation_id: conversation_id.clone(),
            message_ids: self.failed.into_iter().map(|(id, _)| id).collect(),
            reason,
        })
    }
}

/// 在途标记，离开作用域时自动释放
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<InFlightKey>>,
    keys: Vec<InFlightKey>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        for key in &self.keys {
            in_flight.remove(key);
        }
    }
}

/// 已读回执协调器
pub struct ReadReceiptReconciler {
    api: Arc<dyn ChatApi>,
    message_log: Arc<MessageLog>,
    conversation_index: Arc<ConversationIndex>,
    event_manager: Arc<EventManager>,
    in_flight: Mutex<HashSet<InFlightKey>>,
}

impl ReadReceiptReconciler {
    pub fn new(
        api: Arc<dyn ChatApi>,
        message_log: Arc<MessageLog>,
        conversation_index: Arc<ConversationIndex>,
        event_manager: Arc<EventManager>,
    ) -> Self {
        Self {
            api,
            message_log,
            conversation_index,
            event_manager,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// 请求标记已读
    ///
    /// 已在途的消息会被跳过；服务端支持批量时只发一次请求，否则每条消息一次。
    #[instrument(skip(self, message_ids), fields(count = message_ids.len()))]
    pub async fn request_mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> MarkReadReport {
        let mut report = MarkReadReport::default();
        let guard = self.reserve(conversation_id, message_ids, &mut report);
        if report.requested.is_empty() {
            debug!("[ReadReceipt] 没有需要发送的已读请求: skipped={}", report.skipped.len());
            return report;
        }

        let outcomes: Vec<(MessageId, std::result::Result<(), String>)> =
            if self.api.supports_batch_mark_read() {
                let result = self
                    .api
                    .mark_read_batch(conversation_id, &report.requested)
                    .await
                    .map_err(|e| e.to_string());
                report
                    .requested
                    .iter()
                    .map(|id| (id.clone(), result.clone()))
                    .collect()
            } else {
                let calls = report.requested.iter().map(|id| async move {
                    let result = self
                        .api
                        .mark_read(conversation_id, id)
                        .await
                        .map_err(|e| e.to_string());
                    (id.clone(), result)
                });
                join_all(calls).await
            };
        drop(guard);

        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.confirmed.push(id),
                Err(reason) => report.failed.push((id, reason)),
            }
        }

        self.apply_confirmed(conversation_id, &report.confirmed).await;

        if !report.failed.is_empty() {
            let failed_ids: Vec<MessageId> = report.failed.iter().map(|(id, _)| id.clone()).collect();
            let reason = report.failed[0].1.clone();
            warn!(
                "[ReadReceipt] 标记已读失败: conversation={}, count={}, reason={}",
                conversation_id,
                failed_ids.len(),
                reason
            );
            self.event_manager
                .emit(event_builders::mark_read_failed(conversation_id.clone(), failed_ids, reason))
                .await;
        }

        report
    }

    /// 同步预占在途集合（必须在任何 `.await` 之前完成）
    fn reserve<'a>(
        &'a self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
        report: &mut MarkReadReport,
    ) -> InFlightGuard<'a> {
        let mut in_flight = self.in_flight.lock();
        let mut keys = Vec::new();
        for id in message_ids {
            let key = (conversation_id.clone(), id.clone());
            if in_flight.insert(key.clone()) {
                report.requested.push(id.clone());
                keys.push(key);
            } else {
                report.skipped.push(id.clone());
            }
        }
        InFlightGuard {
            in_flight: &self.in_flight,
            keys,
        }
    }

    async fn apply_confirmed(&self, conversation_id: &ConversationId, confirmed: &[MessageId]) {
        if confirmed.is_empty() {
            return;
        }

        let read_at = now_millis();
        let changed = self
            .message_log
            .apply_read_receipt(conversation_id, confirmed, read_at);
        info!(
            "[ReadReceipt] 已确认 {} 条，状态变化 {} 条: conversation={}",
            confirmed.len(),
            changed.len(),
            conversation_id
        );

        for id in &changed {
            if let Some(message) = self.message_log.get(conversation_id, id) {
                self.event_manager
                    .emit(event_builders::timeline_update(id.clone(), message))
                    .await;
            }
        }

        if self.message_log.unseen_incoming(conversation_id).is_empty()
            && self.conversation_index.clear_unread(conversation_id)
        {
            self.event_manager
                .emit(event_builders::unread_count_changed(conversation_id.clone(), 0))
                .await;
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_in_flight(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.in_flight
            .lock()
            .contains(&(conversation_id.clone(), message_id.clone()))
    }
}
