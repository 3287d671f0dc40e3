//! 会话索引 - 会话 ID 到会话摘要的映射，按活跃时间倒序
//!
//! 未读数、最后一条消息与排序时间都只通过这里的接口修改。
//! 当前正在查看的会话由调用方显式设置（`set_active`），引擎不推断 UI 焦点。

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::storage::entities::{
    Conversation, ConversationId, ConversationSummary, Message, Participant, UserId,
};
use crate::utils::time::now_millis;

#[derive(Default)]
struct IndexInner {
    conversations: HashMap<ConversationId, Conversation>,
    active: Option<ConversationId>,
}

/// 会话索引
#[derive(Default)]
pub struct ConversationIndex {
    inner: RwLock<IndexInner>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或合并会话摘要，返回是否为新会话
    ///
    /// 服务端摘要是未读数的权威来源，当前查看的会话除外（保持为 0）；
    /// 最后一条消息只会前进不会倒退。
    pub fn upsert(&self, summary: ConversationSummary) -> bool {
        let mut inner = self.inner.write();
        let unread_count = if inner.active.as_ref() == Some(&summary.id) {
            0
        } else {
            summary.unread_count
        };
        match inner.conversations.get_mut(&summary.id) {
            Some(existing) => {
                existing.participant = summary.participant;
                existing.unread_count = unread_count;
                existing.updated_at = latest(existing.updated_at, summary.updated_at);
                if let Some(message) = summary.last_message {
                    advance_last_message(existing, message);
                }
                existing.activity_timestamp = existing.activity_timestamp.max(activity_of(
                    existing.last_message.as_ref(),
                    existing.updated_at,
                ));
                false
            }
            None => {
                let activity_timestamp = activity_of(summary.last_message.as_ref(), summary.updated_at);
                inner.conversations.insert(
                    summary.id.clone(),
                    Conversation {
                        id: summary.id,
                        participant: summary.participant,
                        last_message: summary.last_message,
                        unread_count,
                        updated_at: summary.updated_at,
                        activity_timestamp,
                    },
                );
                true
            }
        }
    }

    /// 推送引用了未知会话时懒创建一个占位条目，返回是否新建
    pub fn ensure(&self, conversation_id: &ConversationId, participant: Participant) -> bool {
        let mut inner = self.inner.write();
        if inner.conversations.contains_key(conversation_id) {
            return false;
        }
        debug!("[ConversationIndex] 懒创建会话: {}", conversation_id);
        inner.conversations.insert(
            conversation_id.clone(),
            Conversation {
                id: conversation_id.clone(),
                participant,
                last_message: None,
                unread_count: 0,
                updated_at: None,
                activity_timestamp: now_millis(),
            },
        );
        true
    }

    /// 新消息到达/发送成功后更新会话，返回更新后的未读数
    ///
    /// 只有对方发来且会话不是当前查看的会话时才累加未读。
    pub fn bump_on_message(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
        is_incoming: bool,
    ) -> Option<u32> {
        let mut inner = self.inner.write();
        let is_active = inner.active.as_ref() == Some(conversation_id);
        let conversation = inner.conversations.get_mut(conversation_id)?;

        advance_last_message(conversation, message.clone());
        conversation.activity_timestamp = conversation.activity_timestamp.max(message.created_at);
        if is_incoming && !is_active {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        Some(conversation.unread_count)
    }

    /// 清零未读数（幂等），返回是否发生了变化
    pub fn clear_unread(&self, conversation_id: &ConversationId) -> bool {
        let mut inner = self.inner.write();
        match inner.conversations.get_mut(conversation_id) {
            Some(conversation) if conversation.unread_count > 0 => {
                conversation.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// 按活跃时间倒序列出会话，时间相同按 id 排序
    pub fn list_sorted(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.inner.read().conversations.values().cloned().collect();
        conversations.sort_by(|a, b| {
            b.activity_timestamp
                .cmp(&a.activity_timestamp)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        conversations
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.inner.read().conversations.get(conversation_id).cloned()
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.inner.read().conversations.contains_key(conversation_id)
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.inner.read().conversations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 设置当前正在查看的会话（None 表示没有打开的会话）
    pub fn set_active(&self, conversation_id: Option<ConversationId>) {
        self.inner.write().active = conversation_id;
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.inner.read().active.clone()
    }

    pub fn is_active(&self, conversation_id: &ConversationId) -> bool {
        self.inner.read().active.as_ref() == Some(conversation_id)
    }

    /// 通过对端用户查找会话（只是查找，会话 ID 才是已读状态的主键）
    pub fn find_by_participant(&self, user_id: &UserId) -> Vec<ConversationId> {
        self.inner
            .read()
            .conversations
            .values()
            .filter(|c| &c.participant.id == user_id)
            .map(|c| c.id.clone())
            .collect()
    }

    /// 更新所有引用该用户的会话的在线状态，返回受影响的会话
    pub fn apply_presence(
        &self,
        user_id: &UserId,
        is_online: bool,
        last_seen: Option<i64>,
    ) -> Vec<ConversationId> {
        let mut inner = self.inner.write();
        inner
            .conversations
            .values_mut()
            .filter(|c| &c.participant.id == user_id)
            .map(|c| {
                c.participant.is_online = is_online;
                if last_seen.is_some() {
                    c.participant.last_seen = last_seen;
                }
                c.id.clone()
            })
            .collect()
    }

    pub fn remove(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        let mut inner = self.inner.write();
        if inner.active.as_ref() == Some(conversation_id) {
            inner.active = None;
        }
        inner.conversations.remove(conversation_id)
    }

    /// 所有会话未读数之和
    pub fn unread_total(&self) -> u64 {
        self.inner
            .read()
            .conversations
            .values()
            .map(|c| u64::from(c.unread_count))
            .sum()
    }
}

fn latest(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// 最后消息时间与会话更新时间取较新者；两者都没有时取当前时间，新会话排在最前
fn activity_of(last_message: Option<&Message>, updated_at: Option<i64>) -> i64 {
    latest(last_message.map(|m| m.created_at), updated_at).unwrap_or_else(now_millis)
}

fn advance_last_message(conversation: &mut Conversation, message: Message) {
    let is_newer = match &conversation.last_message {
        Some(current) => current.id == message.id || current.cmp_order(&message).is_le(),
        None => true,
    };
    if is_newer {
        conversation.last_message = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{MessageBody, MessageId};

    fn participant(id: &str) -> Participant {
        Participant {
            id: UserId::from(id),
            display_name: format!("User {}", id),
            avatar_url: None,
            is_online: false,
            last_seen: None,
        }
    }

    fn summary(id: &str, user: &str, updated_at: Option<i64>) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::from(id),
            participant: participant(user),
            last_message: None,
            unread_count: 0,
            updated_at,
        }
    }

    fn message(conversation: &str, id: &str, created_at: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from(conversation),
            sender_id: UserId::from("U1"),
            body: MessageBody::Text("hi".to_string()),
            sender_is_self: false,
            created_at,
            server_timestamp: Some(created_at),
            seen: false,
            read_at: None,
            pending: false,
            correlation_token: None,
        }
    }

    #[test]
    fn test_list_sorted_by_activity_then_id() {
        let index = ConversationIndex::new();
        index.upsert(summary("b", "U1", Some(100)));
        index.upsert(summary("a", "U2", Some(100)));
        index.upsert(summary("c", "U3", Some(300)));

        let ids: Vec<_> = index.list_sorted().into_iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_new_conversation_without_timestamps_sorts_first() {
        let index = ConversationIndex::new();
        index.upsert(summary("old", "U1", Some(1_000)));
        index.upsert(summary("fresh", "U2", None));
        assert_eq!(index.list_sorted()[0].id, ConversationId::from("fresh"));
    }

    #[test]
    fn test_activity_uses_most_recent_source() {
        let index = ConversationIndex::new();
        let mut s = summary("c1", "U1", Some(500));
        s.last_message = Some(message("c1", "1", 900));
        index.upsert(s);
        assert_eq!(index.get(&ConversationId::from("c1")).unwrap().activity_timestamp, 900);
    }

    #[test]
    fn test_bump_increments_unread_only_for_inactive_incoming() {
        let index = ConversationIndex::new();
        let id = ConversationId::from("c1");
        index.upsert(summary("c1", "U1", Some(100)));

        assert_eq!(index.bump_on_message(&id, &message("c1", "1", 200), true), Some(1));
        assert_eq!(index.bump_on_message(&id, &message("c1", "2", 300), false), Some(1));

        index.set_active(Some(id.clone()));
        assert_eq!(index.bump_on_message(&id, &message("c1", "3", 400), true), Some(1));

        let conversation = index.get(&id).unwrap();
        assert_eq!(conversation.activity_timestamp, 400);
        assert_eq!(conversation.last_message.unwrap().id, MessageId::from("3"));
        assert_eq!(index.unread_total(), 1);
    }

    #[test]
    fn test_older_message_does_not_replace_last_message() {
        let index = ConversationIndex::new();
        let id = ConversationId::from("c1");
        index.upsert(summary("c1", "U1", None));
        index.bump_on_message(&id, &message("c1", "5", 500), true);
        index.bump_on_message(&id, &message("c1", "4", 400), true);
        assert_eq!(index.get(&id).unwrap().last_message.unwrap().id, MessageId::from("5"));
    }

    #[test]
    fn test_unread_never_negative_and_clear_is_idempotent() {
        let index = ConversationIndex::new();
        let id = ConversationId::from("c1");
        index.upsert(summary("c1", "U1", None));
        assert!(!index.clear_unread(&id));
        index.bump_on_message(&id, &message("c1", "1", 1), true);
        assert!(index.clear_unread(&id));
        assert!(!index.clear_unread(&id));
        assert_eq!(index.get(&id).unwrap().unread_count, 0);
        assert!(!index.clear_unread(&ConversationId::from("missing")));
    }

    #[test]
    fn test_ensure_materializes_stub_once() {
        let index = ConversationIndex::new();
        let id = ConversationId::from("c9");
        assert!(index.ensure(&id, Participant::stub(UserId::from("U9"))));
        assert!(!index.ensure(&id, Participant::stub(UserId::from("U9"))));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&id).unwrap().participant.display_name, "U9");
    }

    #[test]
    fn test_presence_updates_every_matching_conversation() {
        let index = ConversationIndex::new();
        index.upsert(summary("c1", "U1", None));
        index.upsert(summary("c2", "U1", None));
        index.upsert(summary("c3", "U2", None));

        let mut touched = index.apply_presence(&UserId::from("U1"), true, None);
        touched.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(touched, vec![ConversationId::from("c1"), ConversationId::from("c2")]);

        index.apply_presence(&UserId::from("U1"), false, Some(1_234));
        let c1 = index.get(&ConversationId::from("c1")).unwrap();
        assert!(!c1.participant.is_online);
        assert_eq!(c1.participant.last_seen, Some(1_234));
        assert!(!index.get(&ConversationId::from("c3")).unwrap().participant.is_online);
    }

    #[test]
    fn test_upsert_keeps_active_conversation_read() {
        let index = ConversationIndex::new();
        let id = ConversationId::from("c1");
        index.upsert(summary("c1", "U1", Some(100)));
        index.set_active(Some(id.clone()));

        let mut refreshed = summary("c1", "U1", Some(200));
        refreshed.unread_count = 3;
        index.upsert(refreshed.clone());
        assert_eq!(index.get(&id).unwrap().unread_count, 0);

        // 非当前会话仍以服务端未读数为准
        index.set_active(None);
        index.upsert(refreshed);
        assert_eq!(index.get(&id).unwrap().unread_count, 3);
    }

    #[test]
    fn test_remove_clears_active() {
        let index = ConversationIndex::new();
        let id = ConversationId::from("c1");
        index.upsert(summary("c1", "U1", None));
        index.set_active(Some(id.clone()));
        assert!(index.remove(&id).is_some());
        assert!(index.active().is_none());
        assert!(index.is_empty());
    }
}
