//! 消息日志 - 每个会话一条按 `(created_at, id)` 升序、按 id 去重的消息序列
//!
//! 所有写入（推送、分页拉取、乐观发送、已读回执）都必须经过这里的接口，
//! 排序与去重不变式只在这一处维护。

use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::storage::entities::{ConversationId, CorrelationToken, Message, MessageId};

/// 暂存的"先到的已读回执"上限（消息尚未加载时），超出后淘汰最早暂存的一条
const MAX_EARLY_RECEIPTS: usize = 4096;

type ReceiptKey = (ConversationId, MessageId);

/// `append` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 新插入一条消息
    Inserted,
    /// 同 id 已存在，合并（重复投递 / 自己发送的回显）
    Merged,
    /// 携带的关联令牌命中了一条乐观消息，原位替换
    ResolvedPending,
}

impl AppendOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, AppendOutcome::Inserted)
    }
}

#[derive(Default)]
struct LogInner {
    conversations: HashMap<ConversationId, Vec<Message>>,
    pending: HashMap<CorrelationToken, ConversationId>,
    /// 消息到达之前先收到的已读回执：(会话, 消息) -> read_at
    early_receipts: HashMap<ReceiptKey, i64>,
    /// 暂存顺序，与 `early_receipts` 的键一一对应
    early_order: VecDeque<ReceiptKey>,
}

/// 消息日志
#[derive(Default)]
pub struct MessageLog {
    inner: RwLock<LogInner>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入消息并保持排序；同 id 覆盖（`seen` 取或，`read_at` 取最早）
    pub fn append(&self, conversation_id: &ConversationId, mut message: Message) -> AppendOutcome {
        message.conversation_id = conversation_id.clone();
        let mut inner = self.inner.write();
        let LogInner {
            conversations,
            pending,
            early_receipts,
            early_order,
        } = &mut *inner;

        let key = (conversation_id.clone(), message.id.clone());
        if let Some(read_at) = early_receipts.remove(&key) {
            early_order.retain(|k| k != &key);
            message.seen = true;
            message.read_at = earliest(message.read_at, Some(read_at));
        }

        let log = conversations.entry(conversation_id.clone()).or_default();

        let pending_index = message
            .correlation_token
            .as_ref()
            .filter(|token| pending.get(*token) == Some(conversation_id))
            .and_then(|token| position_of(log, &MessageId::local(token)));

        if let Some(index) = position_of(log, &message.id) {
            merge_into(&mut log[index], message);
            let token = log[index].correlation_token.clone();
            reposition(log, index);
            // 回显已经到达，残留的乐观行直接丢弃
            if let Some(token) = token {
                if pending.remove(&token).is_some() {
                    let local_id = MessageId::local(&token);
                    log.retain(|m| m.id != local_id);
                }
            }
            return AppendOutcome::Merged;
        }

        if let Some(index) = pending_index {
            if let Some(token) = message.correlation_token.clone() {
                pending.remove(&token);
            }
            message.pending = false;
            merge_into(&mut log[index], message);
            reposition(log, index);
            return AppendOutcome::ResolvedPending;
        }

        insert_sorted(log, message);
        AppendOutcome::Inserted
    }

    /// 批量合并一页历史消息，返回新插入的条数
    pub fn merge_page(&self, conversation_id: &ConversationId, messages: Vec<Message>) -> usize {
        messages
            .into_iter()
            .map(|message| self.append(conversation_id, message))
            .filter(AppendOutcome::is_new)
            .count()
    }

    /// 应用已读回执，返回本次由未读变为已读的消息 ID
    ///
    /// 未加载的 id 不算错误（该页可能尚未拉取），回执会暂存到消息到达时再应用。
    pub fn apply_read_receipt(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
        read_at: i64,
    ) -> Vec<MessageId> {
        let mut inner = self.inner.write();
        let LogInner {
            conversations,
            early_receipts,
            early_order,
            ..
        } = &mut *inner;

        let mut changed = Vec::new();
        let log = conversations.get_mut(conversation_id);
        let mut unknown = Vec::new();

        match log {
            Some(log) => {
                for id in message_ids {
                    match log.iter_mut().find(|m| &m.id == id) {
                        Some(message) => {
                            if !message.seen {
                                changed.push(id.clone());
                            }
                            message.seen = true;
                            message.read_at = earliest(message.read_at, Some(read_at));
                        }
                        None => unknown.push(id.clone()),
                    }
                }
            }
            None => unknown.extend(message_ids.iter().cloned()),
        }

        for id in unknown {
            match early_receipts.entry((conversation_id.clone(), id)) {
                Entry::Occupied(mut entry) => {
                    let first = (*entry.get()).min(read_at);
                    entry.insert(first);
                }
                Entry::Vacant(entry) => {
                    early_order.push_back(entry.key().clone());
                    entry.insert(read_at);
                }
            }
        }
        while early_receipts.len() > MAX_EARLY_RECEIPTS {
            let Some(oldest) = early_order.pop_front() else {
                break;
            };
            early_receipts.remove(&oldest);
            warn!("[MessageLog] 暂存已读回执已满，淘汰最早一条: {}/{}", oldest.0, oldest.1);
        }

        changed
    }

    /// 插入一条乐观消息（pending=true），按本地发起时间排序
    pub fn mark_optimistic(
        &self,
        conversation_id: &ConversationId,
        token: &CorrelationToken,
        mut draft: Message,
    ) -> Message {
        draft.id = MessageId::local(token);
        draft.conversation_id = conversation_id.clone();
        draft.pending = true;
        draft.seen = false;
        draft.server_timestamp = None;
        draft.correlation_token = Some(token.clone());

        let mut inner = self.inner.write();
        inner.pending.insert(token.clone(), conversation_id.clone());
        let log = inner.conversations.entry(conversation_id.clone()).or_default();
        insert_sorted(log, draft.clone());
        debug!("[MessageLog] 乐观消息入列: conversation={}, token={}", conversation_id, token);
        draft
    }

    /// 用服务端消息替换乐观消息
    ///
    /// 排序仍成立时保持原位，否则重新排序；若服务端 id 已经由推送写入，
    /// 则丢弃乐观行并合并到已有记录。乐观行已不存在时退化为普通 `append`。
    pub fn resolve_optimistic(&self, token: &CorrelationToken, mut server_message: Message) -> Message {
        server_message.pending = false;
        server_message
            .correlation_token
            .get_or_insert_with(|| token.clone());

        let mut inner = self.inner.write();
        let Some(conversation_id) = inner.pending.remove(token) else {
            drop(inner);
            debug!("[MessageLog] 未找到乐观消息，按普通消息写入: token={}", token);
            let conversation_id = server_message.conversation_id.clone();
            let id = server_message.id.clone();
            self.append(&conversation_id, server_message.clone());
            return self.get(&conversation_id, &id).unwrap_or(server_message);
        };

        server_message.conversation_id = conversation_id.clone();
        let log = inner.conversations.entry(conversation_id).or_default();
        let local_id = MessageId::local(token);

        if let Some(pending_index) = position_of(log, &local_id) {
            if position_of(log, &server_message.id).is_some() {
                log.remove(pending_index);
            }
        }

        let index = match position_of(log, &server_message.id).or_else(|| position_of(log, &local_id)) {
            Some(index) => {
                merge_into(&mut log[index], server_message);
                reposition(log, index)
            }
            None => insert_sorted(log, server_message),
        };
        log[index].clone()
    }

    /// 发送失败：移除乐观消息并返回，供上层提供重发
    pub fn fail_optimistic(&self, token: &CorrelationToken) -> Option<Message> {
        let mut inner = self.inner.write();
        let conversation_id = inner.pending.remove(token)?;
        let local_id = MessageId::local(token);
        let log = inner.conversations.get_mut(&conversation_id)?;
        let index = position_of(log, &local_id)?;
        Some(log.remove(index))
    }

    /// 会话内全部消息（已排序的快照）
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .read()
            .conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, conversation_id: &ConversationId, message_id: &MessageId) -> Option<Message> {
        let inner = self.inner.read();
        let log = inner.conversations.get(conversation_id)?;
        position_of(log, message_id).map(|index| log[index].clone())
    }

    pub fn contains(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        self.inner
            .read()
            .conversations
            .get(conversation_id)
            .is_some_and(|log| position_of(log, message_id).is_some())
    }

    pub fn len(&self, conversation_id: &ConversationId) -> usize {
        self.inner
            .read()
            .conversations
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, conversation_id: &ConversationId) -> bool {
        self.len(conversation_id) == 0
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    /// 会话内对方发来、尚未已读的服务端消息
    pub fn unseen_incoming(&self, conversation_id: &ConversationId) -> Vec<MessageId> {
        self.inner
            .read()
            .conversations
            .get(conversation_id)
            .map(|log| {
                log.iter()
                    .filter(|m| !m.sender_is_self && !m.seen && !m.pending)
                    .map(|m| m.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 移除整个会话的消息（会话被外部归档/删除时）
    pub fn remove_conversation(&self, conversation_id: &ConversationId) -> usize {
        let mut inner = self.inner.write();
        inner.pending.retain(|_, c| c != conversation_id);
        inner.early_receipts.retain(|(c, _), _| c != conversation_id);
        inner.early_order.retain(|(c, _)| c != conversation_id);
        inner
            .conversations
            .remove(conversation_id)
            .map_or(0, |log| log.len())
    }
}

fn position_of(log: &[Message], id: &MessageId) -> Option<usize> {
    log.iter().position(|m| &m.id == id)
}

fn earliest(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// 最后写入者覆盖，`seen` 单调，`read_at` 取最早，关联令牌不丢失
///
/// 没有服务端时间的写入（推送缺时间字段）保留已有的排序时间。
fn merge_into(existing: &mut Message, incoming: Message) {
    let seen = existing.seen || incoming.seen;
    let read_at = earliest(existing.read_at, incoming.read_at);
    let correlation_token = incoming
        .correlation_token
        .clone()
        .or_else(|| existing.correlation_token.take());
    let (created_at, server_timestamp) = match incoming.server_timestamp {
        Some(_) => (incoming.created_at, incoming.server_timestamp),
        None => (existing.created_at, existing.server_timestamp),
    };
    *existing = Message {
        seen,
        read_at,
        correlation_token,
        created_at,
        server_timestamp,
        ..incoming
    };
}

fn insert_sorted(log: &mut Vec<Message>, message: Message) -> usize {
    let index = log.partition_point(|m| m.cmp_order(&message).is_lt());
    log.insert(index, message);
    index
}

/// 原位仍有序则不动，否则取出重新插入；返回最终下标
fn reposition(log: &mut Vec<Message>, index: usize) -> usize {
    let before_ok = index == 0 || log[index - 1].cmp_order(&log[index]).is_lt();
    let after_ok = index + 1 >= log.len() || log[index].cmp_order(&log[index + 1]).is_lt();
    if before_ok && after_ok {
        return index;
    }
    let message = log.remove(index);
    insert_sorted(log, message)
}
