//! 消息信封定义
//!
//! 线上格式:
//! ```text
//! {"meta": {"name": "<event_name>", "type": "event"}, "data": <任意 JSON>}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::{DEFAULT_EVENT_TYPE, MAX_EVENT_NAME_LEN};

/// 事件元数据
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// 事件名
    pub name: String,
    /// 事件类型，默认为 "event"
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
}

fn default_event_type() -> String {
    DEFAULT_EVENT_TYPE.to_string()
}

/// 消息信封: 元数据 + 负载
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub meta: Meta,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// 创建指定类型的信封
    pub fn new(name: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            meta: Meta {
                name: name.into(),
                event_type: event_type.into(),
            },
            data,
        }
    }

    /// 创建默认类型 ("event") 的信封
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::new(name, DEFAULT_EVENT_TYPE, data)
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn event_type(&self) -> &str {
        &self.meta.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    /// 校验事件名是否符合约束
    pub fn validate(&self) -> Result<()> {
        let len = self.meta.name.chars().count();
        if len == 0 || len > MAX_EVENT_NAME_LEN {
            return Err(ProtocolError::InvalidEventName {
                len,
                max: MAX_EVENT_NAME_LEN,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::event("ping", json!({"n": 1}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"meta": {"name": "ping", "type": "event"}, "data": {"n": 1}})
        );
    }

    #[test]
    fn test_envelope_missing_type_defaults_to_event() {
        let env: Envelope =
            serde_json::from_str(r#"{"meta": {"name": "move"}, "data": [1, 2]}"#).unwrap();
        assert_eq!(env.name(), "move");
        assert_eq!(env.event_type(), DEFAULT_EVENT_TYPE);
        assert_eq!(env.data(), &json!([1, 2]));
    }

    #[test]
    fn test_envelope_missing_data_is_null() {
        let env: Envelope =
            serde_json::from_str(r#"{"meta": {"name": "tick", "type": "system"}}"#).unwrap();
        assert_eq!(env.event_type(), "system");
        assert!(env.into_data().is_null());
    }

    #[test]
    fn test_validate_name_empty() {
        assert!(Envelope::event("", Value::Null).validate().is_err());
    }

    #[test]
    fn test_validate_name_too_long() {
        let env = Envelope::event("a".repeat(MAX_EVENT_NAME_LEN + 1), Value::Null);
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_validate_name_ok() {
        assert!(Envelope::event("score", json!(3)).validate().is_ok());
    }
}
