//! SDK 配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{MarketChatSDKError, Result};
use crate::storage::{ConversationId, UserId};

/// 推送频道命名规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// 个人频道前缀，完整名称为 `{prefix}{user_id}`
    pub user_channel_prefix: String,
    /// 会话频道前缀，完整名称为 `{prefix}{conversation_id}`
    pub conversation_channel_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            user_channel_prefix: "private-user.".to_string(),
            conversation_channel_prefix: "private-conversation.".to_string(),
        }
    }
}

impl ChannelConfig {
    pub fn user_channel(&self, user_id: &UserId) -> String {
        format!("{}{}", self.user_channel_prefix, user_id)
    }

    pub fn conversation_channel(&self, conversation_id: &ConversationId) -> String {
        format!("{}{}", self.conversation_channel_prefix, conversation_id)
    }

    /// 从会话频道名还原会话 ID（个人频道返回 None）
    pub fn conversation_from_channel(&self, channel: &str) -> Option<ConversationId> {
        channel
            .strip_prefix(&self.conversation_channel_prefix)
            .filter(|id| !id.is_empty())
            .map(ConversationId::from)
    }
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
        }
    }
}

/// MarketChat SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketChatConfig {
    /// 当前登录用户
    pub user_id: UserId,
    /// 频道命名
    pub channel_config: ChannelConfig,
    /// 对方输入状态的超时时间（毫秒）
    pub typing_timeout_ms: u64,
    /// 当前查看的会话收到新消息时自动标记已读
    pub auto_mark_as_read: bool,
    /// 事件配置
    pub event_config: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

impl Default for MarketChatConfig {
    fn default() -> Self {
        Self {
            user_id: UserId::from(""),
            channel_config: ChannelConfig::default(),
            typing_timeout_ms: 3000,
            auto_mark_as_read: true,
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl MarketChatConfig {
    pub fn builder() -> MarketChatConfigBuilder {
        MarketChatConfigBuilder::new()
    }

    /// 从 JSON 文档加载配置，缺省字段使用默认值
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MarketChatConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.user_id.as_str().trim().is_empty() {
            return Err(MarketChatSDKError::Config("用户ID不能为空".to_string()));
        }
        if self.typing_timeout_ms == 0 {
            return Err(MarketChatSDKError::Config("输入状态超时不能为0".to_string()));
        }
        if self.event_config.buffer_size == 0 {
            return Err(MarketChatSDKError::Config("事件缓冲区大小不能为0".to_string()));
        }
        if self.channel_config.conversation_channel_prefix.is_empty()
            || self.channel_config.conversation_channel_prefix == self.channel_config.user_channel_prefix
        {
            return Err(MarketChatSDKError::Config(
                "会话频道前缀不能为空且不能与个人频道前缀相同".to_string(),
            ));
        }
        Ok(())
    }
}

/// MarketChat SDK 配置构建器
pub struct MarketChatConfigBuilder {
    config: MarketChatConfig,
}

impl MarketChatConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MarketChatConfig::default(),
        }
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.config.user_id = UserId::from(user_id.into());
        self
    }

    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.config.channel_config = config;
        self
    }

    pub fn typing_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.typing_timeout_ms = timeout_ms;
        self
    }

    pub fn auto_mark_as_read(mut self, enabled: bool) -> Self {
        self.config.auto_mark_as_read = enabled;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_config.buffer_size = size;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> MarketChatConfig {
        self.config
    }
}

impl Default for MarketChatConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = MarketChatConfig::builder().user_id("42").build();
        assert_eq!(config.typing_timeout(), Duration::from_secs(3));
        assert!(config.auto_mark_as_read);
        assert_eq!(config.event_config.buffer_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(MarketChatConfig::default().validate().is_err());
        let config = MarketChatConfig::builder()
            .user_id("42")
            .typing_timeout_ms(0)
            .build();
        assert!(matches!(config.validate(), Err(MarketChatSDKError::Config(_))));
    }

    #[test]
    fn test_from_json_str_fills_defaults() {
        let config = MarketChatConfig::from_json_str(r#"{"user_id": "7", "auto_mark_as_read": false}"#).unwrap();
        assert_eq!(config.user_id, UserId::from("7"));
        assert!(!config.auto_mark_as_read);
        assert_eq!(config.typing_timeout_ms, 3000);

        assert!(MarketChatConfig::from_json_str("{").is_err());
        assert!(MarketChatConfig::from_json_str("{}").is_err());
    }

    #[test]
    fn test_channel_names() {
        let channels = ChannelConfig::default();
        assert_eq!(channels.user_channel(&UserId::from("7")), "private-user.7");
        assert_eq!(
            channels.conversation_from_channel("private-conversation.C7"),
            Some(ConversationId::from("C7"))
        );
        assert_eq!(channels.conversation_from_channel("private-user.7"), None);
        assert_eq!(channels.conversation_from_channel("private-conversation."), None);
    }
}
