//! 推送通道抽象
//!
//! 底层握手、鉴权与重连由平台层的推送客户端完成，这里只定义引擎需要的最小接口：
//! 频道订阅、事件绑定和连接生命周期事件。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::connection_state::ConnectionStatus;
use crate::error::Result;

/// 推送通道收到的原始事件（尚未规范化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

impl RawEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

/// 推送通道生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
    StateChange {
        previous: ConnectionStatus,
        current: ConnectionStatus,
    },
}

/// 事件回调（由推送客户端在其自身线程上同步调用）
pub type PushHandler = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// 推送通道（由平台层实现）
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// 发起连接；结果通过 `connection_events` 异步通知
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// 订阅频道（私有频道的鉴权由实现方处理）
    async fn subscribe(&self, channel: &str) -> Result<()>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// 在频道上绑定事件回调
    fn bind(&self, channel: &str, event_name: &str, handler: PushHandler);

    /// 解绑频道上的全部回调
    fn unbind_all(&self, channel: &str);

    /// 订阅连接生命周期事件
    fn connection_events(&self) -> broadcast::Receiver<TransportEvent>;
}


#[cfg(test)]
pub use test_helpers::MockTransport;
