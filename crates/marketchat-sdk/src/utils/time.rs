//! 时间处理工具模块
//!
//! # 设计原则
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（i64）
//! - **业务层**: 统一使用 `now_millis()` 生成时间
//! - **推送载荷**: 服务端可能给出 RFC 3339 字符串、`YYYY-MM-DD HH:MM:SS`、
//!   秒级或毫秒级数字，入库前统一由 `parse_timestamp` 归一化

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// 小于该值的数字按秒级时间戳处理（约 2001-09-09 的毫秒值）
const SECONDS_THRESHOLD: i64 = 1_000_000_000_000;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 把推送载荷里的时间字段归一化为 UTC 毫秒时间戳
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .map(normalize_epoch),
        Value::String(text) => parse_timestamp_str(text),
        _ => None,
    }
}

/// 解析字符串形式的时间
pub fn parse_timestamp_str(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(epoch) = text.parse::<i64>() {
        return Some(normalize_epoch(epoch));
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(text) {
        return Some(datetime.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis())
}

fn normalize_epoch(epoch: i64) -> i64 {
    if epoch.abs() < SECONDS_THRESHOLD {
        epoch * 1000
    } else {
        epoch
    }
}

/// 时间格式化工具（日志与调试输出）
pub struct TimeFormatter;

impl TimeFormatter {
    /// 格式化为 ISO 8601 格式，非法时间戳返回空串
    pub fn format_iso8601(utc_timestamp_ms: i64) -> String {
        Utc.timestamp_millis_opt(utc_timestamp_ms)
            .single()
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }

    /// 距离现在的秒数（正数表示过去，负数表示未来）
    pub fn seconds_since(utc_timestamp_ms: i64) -> i64 {
        (now_millis() - utc_timestamp_ms) / 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_epoch_numbers() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000)), Some(1_700_000_000_000));
        assert_eq!(parse_timestamp(&json!(1_700_000_000_123i64)), Some(1_700_000_000_123));
        assert_eq!(parse_timestamp(&json!("1700000000")), Some(1_700_000_000_000));
    }

    #[test]
    fn test_parse_datetime_strings() {
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            parse_timestamp(&json!("2023-11-14T22:13:20.000000Z")),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            parse_timestamp(&json!("2023-11-14 22:13:20")),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
        assert_eq!(parse_timestamp(&json!("")), None);
        assert_eq!(parse_timestamp(&json!({"at": 1})), None);
    }

    #[test]
    fn test_format_iso8601() {
        assert_eq!(
            TimeFormatter::format_iso8601(1_700_000_000_000),
            "2023-11-14T22:13:20+00:00"
        );
        assert!(TimeFormatter::seconds_since(now_millis() - 5_000) >= 5);
    }
}
