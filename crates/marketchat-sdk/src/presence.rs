//! 在线状态管理模块
//!
//! 功能包括：
//! - 缓存用户最后已知的在线状态
//! - 处理推送的上线/下线事件，同步到所有引用该用户的会话
//! - 为懒创建的会话提供带在线状态的参与者占位

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::events::{event_builders, EventManager};
use crate::storage::{ConversationIndex, Participant, UserId};
use crate::utils::time::now_millis;

/// 在线状态信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub user_id: UserId,
    pub is_online: bool,
    /// 最后在线时间（毫秒）
    pub last_seen: Option<i64>,
    /// 本地收到该状态的时间（毫秒）
    pub updated_at: i64,
}

/// 缓存配置
#[derive(Debug, Clone)]
pub struct PresenceCacheConfig {
    /// 最大缓存条目数
    pub max_cache_size: usize,
}

impl Default for PresenceCacheConfig {
    fn default() -> Self {
        Self { max_cache_size: 10000 }
    }
}

/// 缓存统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceCacheStats {
    pub cached_users: usize,
    pub online_users: usize,
    pub max_cache_size: usize,
}

/// 在线状态管理器
pub struct PresenceManager {
    status_cache: Arc<RwLock<HashMap<UserId, PresenceInfo>>>,
    conversation_index: Arc<ConversationIndex>,
    event_manager: Arc<EventManager>,
    config: PresenceCacheConfig,
}

impl PresenceManager {
    pub fn new(conversation_index: Arc<ConversationIndex>, event_manager: Arc<EventManager>) -> Self {
        Self::with_config(conversation_index, event_manager, PresenceCacheConfig::default())
    }

    pub fn with_config(
        conversation_index: Arc<ConversationIndex>,
        event_manager: Arc<EventManager>,
        config: PresenceCacheConfig,
    ) -> Self {
        Self {
            status_cache: Arc::new(RwLock::new(HashMap::new())),
            conversation_index,
            event_manager,
            config,
        }
    }

    /// 处理推送的在线状态变化，返回受影响的会话数
    pub async fn handle_status_change(&self, user_id: UserId, is_online: bool, last_seen: Option<i64>) -> usize {
        // 下线事件没有带时间：已知离线则沿用原值，否则以收到的时间作为最后在线时间
        let last_seen = match (is_online, last_seen) {
            (false, None) => {
                let known = self
                    .get_presence(&user_id)
                    .await
                    .filter(|info| !info.is_online)
                    .and_then(|info| info.last_seen);
                Some(known.unwrap_or_else(now_millis))
            }
            (_, last_seen) => last_seen,
        };

        let changed = self.update_status(&user_id, is_online, last_seen).await;
        let affected = self
            .conversation_index
            .apply_presence(&user_id, is_online, last_seen);

        if !changed {
            debug!("[Presence] {} 状态未变化，忽略", user_id);
            return affected.len();
        }

        self.event_manager
            .emit(event_builders::user_presence_changed(user_id.clone(), is_online, last_seen))
            .await;
        for conversation_id in &affected {
            if let Some(conversation) = self.conversation_index.get(conversation_id) {
                self.event_manager
                    .emit(event_builders::conversation_updated(conversation))
                    .await;
            }
        }

        debug!(
            "[Presence] {} -> {}, 影响 {} 个会话",
            user_id,
            if is_online { "online" } else { "offline" },
            affected.len()
        );
        affected.len()
    }

    /// 更新缓存，返回在线状态是否发生变化
    async fn update_status(&self, user_id: &UserId, is_online: bool, last_seen: Option<i64>) -> bool {
        let mut cache = self.status_cache.write().await;

        if cache.len() >= self.config.max_cache_size && !cache.contains_key(user_id) {
            warn!("[Presence] 缓存已满 ({})，移除最早的条目", self.config.max_cache_size);
            let oldest = cache
                .values()
                .min_by_key(|info| info.updated_at)
                .map(|info| info.user_id.clone());
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }

        let previous = cache.insert(
            user_id.clone(),
            PresenceInfo {
                user_id: user_id.clone(),
                is_online,
                last_seen,
                updated_at: now_millis(),
            },
        );
        previous.map_or(true, |info| info.is_online != is_online || info.last_seen != last_seen)
    }

    pub async fn get_presence(&self, user_id: &UserId) -> Option<PresenceInfo> {
        self.status_cache.read().await.get(user_id).cloned()
    }

    /// 懒创建会话时的参与者占位，带上已知的在线状态
    pub async fn participant_for(&self, user_id: &UserId) -> Participant {
        let mut participant = Participant::stub(user_id.clone());
        if let Some(info) = self.get_presence(user_id).await {
            participant.is_online = info.is_online;
            participant.last_seen = info.last_seen;
        }
        participant
    }

    pub async fn clear_cache(&self) {
        self.status_cache.write().await.clear();
    }

    pub async fn get_cache_stats(&self) -> PresenceCacheStats {
        let cache = self.status_cache.read().await;
        PresenceCacheStats {
            cached_users: cache.len(),
            online_users: cache.values().filter(|info| info.is_online).count(),
            max_cache_size: self.config.max_cache_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SDKEvent;
    use crate::storage::{ConversationId, ConversationSummary};

    fn summary(id: &str, user: &str) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::from(id),
            participant: Participant::stub(UserId::from(user)),
            last_message: None,
            unread_count: 0,
            updated_at: Some(1),
        }
    }

    #[tokio::test]
    async fn test_presence_updates_every_conversation_with_user() {
        let index = Arc::new(ConversationIndex::new());
        index.upsert(summary("c1", "U1"));
        index.upsert(summary("c2", "U1"));
        index.upsert(summary("c3", "U2"));
        let events = Arc::new(EventManager::new(64));
        let mut receiver = events.subscribe();
        let manager = PresenceManager::new(index.clone(), events);

        let affected = manager.handle_status_change(UserId::from("U1"), true, None).await;
        assert_eq!(affected, 2);
        assert!(index.get(&ConversationId::from("c1")).unwrap().participant.is_online);
        assert!(index.get(&ConversationId::from("c2")).unwrap().participant.is_online);
        assert!(!index.get(&ConversationId::from("c3")).unwrap().participant.is_online);

        assert!(matches!(
            receiver.recv().await.unwrap(),
            SDKEvent::UserPresenceChanged { is_online: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_presence_is_idempotent() {
        let index = Arc::new(ConversationIndex::new());
        let events = Arc::new(EventManager::new(64));
        let manager = PresenceManager::new(index, events.clone());

        manager.handle_status_change(UserId::from("U1"), false, Some(500)).await;
        manager.handle_status_change(UserId::from("U1"), false, Some(500)).await;

        let stats = events.get_stats().await;
        assert_eq!(stats.events_by_type.get("user_presence_changed"), Some(&1));

        let info = manager.get_presence(&UserId::from("U1")).await.unwrap();
        assert!(!info.is_online);
        assert_eq!(info.last_seen, Some(500));
    }

    #[tokio::test]
    async fn test_replayed_offline_without_last_seen_keeps_first_time() {
        let index = Arc::new(ConversationIndex::new());
        index.upsert(summary("c1", "U1"));
        let events = Arc::new(EventManager::new(64));
        let manager = PresenceManager::new(index.clone(), events.clone());
        manager.handle_status_change(UserId::from("U1"), true, None).await;

        manager.handle_status_change(UserId::from("U1"), false, None).await;
        let first = manager.get_presence(&UserId::from("U1")).await.unwrap().last_seen;
        assert!(first.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.handle_status_change(UserId::from("U1"), false, None).await;

        assert_eq!(manager.get_presence(&UserId::from("U1")).await.unwrap().last_seen, first);
        assert_eq!(index.get(&ConversationId::from("c1")).unwrap().participant.last_seen, first);
        let stats = events.get_stats().await;
        assert_eq!(stats.events_by_type.get("user_presence_changed"), Some(&2));
    }

    #[tokio::test]
    async fn test_participant_stub_carries_known_presence() {
        let index = Arc::new(ConversationIndex::new());
        let manager = PresenceManager::new(index, Arc::new(EventManager::new(8)));
        manager.handle_status_change(UserId::from("U5"), true, Some(42)).await;

        let participant = manager.participant_for(&UserId::from("U5")).await;
        assert!(participant.is_online);
        assert_eq!(participant.last_seen, Some(42));
        assert!(!manager.participant_for(&UserId::from("U6")).await.is_online);
    }

    #[tokio::test]
    async fn test_cache_evicts_oldest_when_full() {
        let index = Arc::new(ConversationIndex::new());
        let manager = PresenceManager::with_config(
            index,
            Arc::new(EventManager::new(8)),
            PresenceCacheConfig { max_cache_size: 2 },
        );
        for user in ["a", "b", "c"] {
            manager.handle_status_change(UserId::from(user), true, None).await;
        }
        let stats = manager.get_cache_stats().await;
        assert_eq!(stats.cached_users, 2);
        assert_eq!(stats.online_users, 2);
    }
}
