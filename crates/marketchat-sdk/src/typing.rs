//! 输入状态管理模块
//!
//! 功能包括：
//! - 接收并处理其他用户的输入状态（开始 / 刷新 / 停止 / 超时）
//! - 向服务端转发本地用户的输入状态（不做防抖，由调用方控制频率）
//!
//! 状态转换集中在纯数据结构 `TypingTracker` 中，不依赖定时器即可测试；
//! `TypingManager` 在其外层为每个用户维护一个 tokio 定时任务。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::rpc_client::ChatApi;
use crate::storage::entities::{ConversationId, UserId};

/// 默认输入状态超时
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

/// `TypingTracker::start` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTransition {
    /// idle -> typing
    Started,
    /// typing -> typing，截止时间重新计算
    Refreshed,
}

#[derive(Debug, Clone)]
struct TypingEntry {
    conversation_id: Option<ConversationId>,
    deadline: Instant,
    generation: u64,
}

/// 输入状态机（纯转换，不持有定时器）
#[derive(Debug, Default)]
pub struct TypingTracker {
    entries: HashMap<UserId, TypingEntry>,
    next_generation: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始或刷新输入状态，返回转换类型与本次的代数（用于识别过期定时器）
    pub fn start(
        &mut self,
        user_id: &UserId,
        conversation_id: Option<ConversationId>,
        now: Instant,
        timeout: Duration,
    ) -> (TypingTransition, u64) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let entry = TypingEntry {
            conversation_id,
            deadline: now + timeout,
            generation,
        };

        let transition = match self.entries.insert(user_id.clone(), entry) {
            Some(previous) if previous.deadline > now => TypingTransition::Refreshed,
            _ => TypingTransition::Started,
        };
        (transition, generation)
    }

    /// 显式停止，返回被移除条目所属的会话（没有条目时为 None）
    pub fn stop(&mut self, user_id: &UserId) -> Option<Option<ConversationId>> {
        self.entries.remove(user_id).map(|entry| entry.conversation_id)
    }

    /// 定时器到期：只有代数匹配且确实已过截止时间才会生效
    pub fn expire(&mut self, user_id: &UserId, generation: u64, now: Instant) -> Option<Option<ConversationId>> {
        match self.entries.get(user_id) {
            Some(entry) if entry.generation == generation && entry.deadline <= now => self
                .entries
                .remove(user_id)
                .map(|entry| entry.conversation_id),
            _ => None,
        }
    }

    pub fn is_typing(&self, user_id: &UserId, now: Instant) -> bool {
        self.entries
            .get(user_id)
            .is_some_and(|entry| entry.deadline > now)
    }

    pub fn typing_users(&self, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline > now)
            .map(|(user_id, _)| user_id.clone())
            .collect();
        users.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        users
    }

    /// 某个会话内正在输入的用户
    pub fn users_in(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.conversation_id.as_ref() == Some(conversation_id))
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

/// 输入状态统计
#[derive(Debug, Clone)]
pub struct TypingStats {
    pub active_typing_count: usize,
    pub pending_timers: usize,
}

/// 输入状态管理器
pub struct TypingManager {
    tracker: Arc<Mutex<TypingTracker>>,
    /// 每个用户当前的超时任务（代数, 任务句柄）
    timers: Arc<Mutex<HashMap<UserId, (u64, JoinHandle<()>)>>>,
    event_manager: Arc<EventManager>,
    api: Arc<dyn ChatApi>,
    timeout: Duration,
}

impl TypingManager {
    pub fn new(event_manager: Arc<EventManager>, api: Arc<dyn ChatApi>) -> Self {
        Self::with_timeout(event_manager, api, DEFAULT_TYPING_TIMEOUT)
    }

    pub fn with_timeout(event_manager: Arc<EventManager>, api: Arc<dyn ChatApi>, timeout: Duration) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(TypingTracker::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
            event_manager,
            api,
            timeout,
        }
    }

    /// 处理其他用户的输入状态推送
    pub async fn handle_remote_typing(
        &self,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        is_typing: bool,
    ) {
        if is_typing {
            let (transition, generation) =
                self.tracker
                    .lock()
                    .start(&user_id, conversation_id.clone(), Instant::now(), self.timeout);
            self.schedule_expiry(user_id.clone(), conversation_id.clone(), generation);

            if transition == TypingTransition::Started {
                debug!("[TypingManager] {} 开始输入", user_id);
                self.event_manager
                    .emit(event_builders::typing_indicator(user_id, conversation_id, true))
                    .await;
            }
        } else {
            self.cancel_timer(&user_id);
            let stopped = self.tracker.lock().stop(&user_id);
            if let Some(conversation_id) = stopped {
                debug!("[TypingManager] {} 停止输入", user_id);
                self.event_manager
                    .emit(event_builders::typing_indicator(user_id, conversation_id, false))
                    .await;
            }
        }
    }

    fn schedule_expiry(&self, user_id: UserId, conversation_id: Option<ConversationId>, generation: u64) {
        let tracker = self.tracker.clone();
        let timers = self.timers.clone();
        let event_manager = self.event_manager.clone();
        let timeout = self.timeout;
        let task_user = user_id.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let expired = tracker.lock().expire(&task_user, generation, Instant::now());
            {
                let mut timers = timers.lock();
                if timers.get(&task_user).is_some_and(|(g, _)| *g == generation) {
                    timers.remove(&task_user);
                }
            }

            if expired.is_some() {
                debug!("[TypingManager] {} 输入状态超时", task_user);
                event_manager
                    .emit(event_builders::typing_indicator(task_user, conversation_id, false))
                    .await;
            }
        });

        if let Some((_, previous)) = self.timers.lock().insert(user_id, (generation, handle)) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, user_id: &UserId) {
        if let Some((_, handle)) = self.timers.lock().remove(user_id) {
            handle.abort();
        }
    }

    pub fn is_user_typing(&self, user_id: &UserId) -> bool {
        self.tracker.lock().is_typing(user_id, Instant::now())
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.tracker.lock().typing_users(Instant::now())
    }

    /// 转发本地用户的输入状态，失败只记录日志后返回给调用方
    pub async fn set_local_typing(&self, target_user_id: &UserId, is_typing: bool) -> Result<()> {
        self.api
            .set_typing_status(target_user_id, is_typing)
            .await
            .inspect_err(|e| warn!("[TypingManager] 发送输入状态失败: {}", e))
    }

    /// 关闭会话视图：清除该会话内的输入状态与定时器
    pub async fn clear_conversation(&self, conversation_id: &ConversationId) {
        let users = self.tracker.lock().users_in(conversation_id);
        for user_id in users {
            self.handle_remote_typing(user_id, Some(conversation_id.clone()), false)
                .await;
        }
    }

    /// 关闭时清除全部定时器与状态
    pub fn clear_all(&self) -> usize {
        for (_, (_, handle)) in self.timers.lock().drain() {
            handle.abort();
        }
        self.tracker.lock().clear()
    }

    pub fn get_stats(&self) -> TypingStats {
        TypingStats {
            active_typing_count: self.typing_users().len(),
            pending_timers: self.timers.lock().len(),
        }
    }
}

impl Drop for TypingManager {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
