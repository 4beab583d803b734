//! 阶段输入与规范化输出

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::FailureKind;
use crate::stage::{InputKind, StageId};

/// 单张工单的卷宗（批处理阶段输入元素）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dossier {
    pub ticket_id: i64,
    pub dossier: String,
}

/// 阶段输入
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    Text(String),
    Dossiers(Vec<Dossier>),
}

impl StageInput {
    pub fn kind(&self) -> InputKind {
        match self {
            StageInput::Text(_) => InputKind::Text,
            StageInput::Dossiers(_) => InputKind::Dossiers,
        }
    }

    /// 渲染为发给补全能力的文本
    pub fn render(&self) -> Result<String, serde_json::Error> {
        match self {
            StageInput::Text(text) => Ok(text.clone()),
            StageInput::Dossiers(dossiers) => serde_json::to_string(dossiers),
        }
    }
}

/// 一次阶段执行的规范化结果；创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: StageId,
    pub payload: Map<String, Value>,
    /// 解析前的原始文本（诊断用，可能已截断）
    pub raw_text: String,
    /// 合成的失败结果：调用或解析失败时由编排器生成
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl StageResult {
    pub fn new(stage_id: StageId, payload: Map<String, Value>, raw_text: impl Into<String>) -> Self {
        Self {
            stage_id,
            payload,
            raw_text: raw_text.into(),
            failure: None,
        }
    }

    /// 合成失败结果，payload 仅带错误标记
    pub fn failure(stage_id: StageId, kind: FailureKind, raw_text: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert(
            "error".to_string(),
            serde_json::to_value(kind).unwrap_or(Value::Null),
        );
        Self {
            stage_id,
            payload,
            raw_text: raw_text.into(),
            failure: Some(kind),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key).filter(|v| !v.is_null())
    }

    /// 非空字符串字段
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn user_message(&self) -> Option<&str> {
        self.get_str("user_message")
    }

    /// 协调者收集到的结构化信息（非空对象才算）
    pub fn gathered_info(&self) -> Option<&Value> {
        self.get("gathered_info").filter(|v| match v {
            Value::Object(map) => !map.is_empty(),
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => false,
        })
    }

    /// 阶段自报的下一步（仅供参考，Router 会重新校验）
    pub fn routing_hint(&self) -> Option<&str> {
        self.get_str("next_node")
    }

    pub fn payload_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(value: Value) -> StageResult {
        let payload = value.as_object().cloned().unwrap();
        StageResult::new(StageId::Coordinator, payload, value.to_string())
    }

    #[test]
    fn test_gathered_info_requires_content() {
        assert!(result(json!({"gathered_info": {}})).gathered_info().is_none());
        assert!(result(json!({"gathered_info": null})).gathered_info().is_none());
        assert!(result(json!({"gathered_info": {"module": "reports"}}))
            .gathered_info()
            .is_some());
    }

    #[test]
    fn test_blank_user_message_is_absent() {
        assert!(result(json!({"user_message": "   "})).user_message().is_none());
        assert_eq!(
            result(json!({"user_message": "hi"})).user_message(),
            Some("hi")
        );
    }

    #[test]
    fn test_failure_payload_carries_marker_only() {
        let r = StageResult::failure(StageId::Lookup, FailureKind::Transient, "timeout");
        assert!(r.is_failure());
        assert_eq!(r.payload_value(), json!({"error": "transient"}));
    }

    #[test]
    fn test_dossier_input_renders_json_array() {
        let input = StageInput::Dossiers(vec![Dossier {
            ticket_id: 7,
            dossier: "report blank".into(),
        }]);
        assert_eq!(input.kind(), InputKind::Dossiers);
        assert_eq!(
            input.render().unwrap(),
            r#"[{"ticket_id":7,"dossier":"report blank"}]"#
        );
    }
}
