//! 连接状态管理
//!
//! 提供推送连接的状态信息，包括：
//! - 连接状态（只由推送通道生命周期事件驱动）
//! - 已订阅频道集合
//! - 事件统计
//!
//! 断开或出错时订阅集合被清空：推送通道已经丢失了这些订阅，
//! 下一次 `Connected` 会全部重新订阅。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::network::TransportEvent;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 连接出错（推送通道会自行回到 Connecting）
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Error => write!(f, "连接出错"),
        }
    }
}

/// 事件统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// 已处理的推送事件数
    pub events_received: u64,
    /// 因无法解析而丢弃的推送事件数
    pub events_dropped: u64,
    /// 重新连接次数（第一次连接不计）
    pub reconnect_count: u64,
    /// 最后活动时间（UTC毫秒时间戳）
    pub last_activity_time: Option<i64>,
}

/// 连接状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub subscribed_channels: BTreeSet<String>,
    /// 连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
    pub last_error: Option<String>,
    pub stats: ConnectionStats,
    pub sdk_version: String,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            subscribed_channels: BTreeSet::new(),
            connected_at: None,
            last_error: None,
            stats: ConnectionStats::default(),
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }

    /// 获取连接持续时间（秒）
    pub fn connection_duration_secs(&self) -> Option<i64> {
        self.connected_at
            .map(|connected_at| (Utc::now().timestamp_millis() - connected_at) / 1000)
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "【连接状态】\n\
             状态: {}\n\
             已订阅频道: {}\n\
             已连接: {}秒\n\
             统计: 接收{}条/丢弃{}条/重连{}次\n\
             SDK版本: {}",
            self.status,
            self.subscribed_channels.len(),
            self.connection_duration_secs().unwrap_or(0),
            self.stats.events_received,
            self.stats.events_dropped,
            self.stats.reconnect_count,
            self.sdk_version
        )
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接状态管理器（线程安全）
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateManager {
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用推送通道生命周期事件，状态发生变化时返回 `(旧状态, 新状态)`
    pub async fn apply_transport_event(
        &self,
        event: &TransportEvent,
    ) -> Option<(ConnectionStatus, ConnectionStatus)> {
        let next = match event {
            TransportEvent::Connecting => ConnectionStatus::Connecting,
            TransportEvent::Connected => ConnectionStatus::Connected,
            TransportEvent::Disconnected => ConnectionStatus::Disconnected,
            TransportEvent::Error(_) => ConnectionStatus::Error,
            TransportEvent::StateChange { current, .. } => *current,
        };

        let mut state = self.state.write().await;
        if let TransportEvent::Error(reason) = event {
            warn!("[ConnectionState] 推送通道错误: {}", reason);
            state.last_error = Some(reason.clone());
        }

        let previous = state.status;
        if previous == next {
            return None;
        }
        state.status = next;

        match next {
            ConnectionStatus::Connected => {
                if state.connected_at.is_some() || state.stats.last_activity_time.is_some() {
                    state.stats.reconnect_count += 1;
                }
                state.connected_at = Some(Utc::now().timestamp_millis());
                state.stats.last_activity_time = state.connected_at;
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                state.connected_at = None;
                state.subscribed_channels.clear();
            }
            ConnectionStatus::Connecting => {}
        }

        info!("[ConnectionState] {} -> {}", previous, next);
        Some((previous, next))
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == ConnectionStatus::Connected
    }

    /// 预占频道：返回 true 表示此前未订阅，调用方负责真正发起订阅
    ///
    /// 未连接或已被预占时返回 false。状态检查与插入在同一把写锁下完成。
    pub async fn reserve_channel_if_connected(&self, channel: &str) -> bool {
        let mut state = self.state.write().await;
        if state.status != ConnectionStatus::Connected {
            return false;
        }
        state.subscribed_channels.insert(channel.to_string())
    }

    /// 释放频道（订阅失败或主动退订）
    pub async fn release_channel(&self, channel: &str) -> bool {
        self.state.write().await.subscribed_channels.remove(channel)
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.state.read().await.subscribed_channels.contains(channel)
    }

    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .subscribed_channels
            .iter()
            .cloned()
            .collect()
    }

    pub async fn clear_channels(&self) -> Vec<String> {
        let mut state = self.state.write().await;
        std::mem::take(&mut state.subscribed_channels)
            .into_iter()
            .collect()
    }

    pub async fn record_event_received(&self) {
        let mut state = self.state.write().await;
        state.stats.events_received += 1;
        state.stats.last_activity_time = Some(Utc::now().timestamp_millis());
    }

    pub async fn record_event_dropped(&self) {
        self.state.write().await.stats.events_dropped += 1;
    }

    /// 获取当前状态快照
    pub async fn get_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// 打印状态到日志
    pub async fn log_state(&self) {
        let summary = self.state.read().await.summary();
        info!("\n{}", summary);
    }
}
