//! 实时事件路由
//!
//! - payload: 原始推送负载规范化
//! - router: 分发表与各事件的处理逻辑

pub mod payload;
pub mod router;

pub use payload::{normalize, EventKind, NormalizedEvent};
pub use router::{RealtimeRouter, RouterContext};
