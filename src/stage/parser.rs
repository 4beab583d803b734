//! ResponseParser：将阶段原始输出规范化为 StageResult
//!
//! 1. 去掉最外层的代码围栏（```json ... ``` 或 ``` ... ```），首尾围栏必须成对出现
//! 2. 严格 JSON 解码
//! 3. 按阶段 Schema 校验必填字段；可选列表字段缺失时补为空数组
//!
//! 已结构化的输出跳过 1、2 直接校验。任何一步失败都返回带截断原文的 ParseError，不猜测、不补默认值。

use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::truncate_chars;
use crate::llm::RawCompletion;
use crate::stage::{StageId, StageResult, StageSchema};

const FENCE: &str = "```";

/// 默认保留的原文字符数
pub const DEFAULT_RAW_EXCERPT: usize = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("mismatched code fence in response: {raw}")]
    MismatchedFence { raw: String },

    #[error("invalid JSON ({message}): {raw}")]
    InvalidJson { message: String, raw: String },

    #[error("response is not a JSON object: {raw}")]
    NotAMapping { raw: String },

    #[error("stage {stage} response is missing required field '{field}': {raw}")]
    MissingField {
        stage: StageId,
        field: String,
        raw: String,
    },

    #[error("stage {stage} response needs one of {fields:?}: {raw}")]
    MissingAnyOf {
        stage: StageId,
        fields: Vec<String>,
        raw: String,
    },

    #[error("stage {stage} field '{field}' must be {expected}: {raw}")]
    InvalidField {
        stage: StageId,
        field: String,
        expected: &'static str,
        raw: String,
    },
}

/// 去掉最外层代码围栏；无围栏时原样返回（已 trim）
///
/// 允许围栏带语言标记（```json）；只有开头或只有结尾的围栏视为错误。
pub fn unwrap_fenced_json(text: &str) -> Result<&str, ParseError> {
    let trimmed = text.trim();
    let opens = trimmed.starts_with(FENCE);
    let closes = trimmed.len() >= FENCE.len() * 2 && trimmed.ends_with(FENCE);

    match (opens, closes) {
        (false, false) => Ok(trimmed),
        (true, true) => {
            let inner = &trimmed[FENCE.len()..trimmed.len() - FENCE.len()];
            Ok(strip_language_tag(inner).trim())
        }
        _ => Err(ParseError::MismatchedFence {
            raw: truncate_chars(trimmed, DEFAULT_RAW_EXCERPT),
        }),
    }
}

/// ```json\n{...} 中的 json 标记：紧跟开头围栏、由字母数字组成、其后是空白
fn strip_language_tag(inner: &str) -> &str {
    let tag_len = inner
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    if tag_len == 0 {
        return inner;
    }
    match inner[tag_len..].chars().next() {
        Some(c) if c.is_whitespace() => &inner[tag_len..],
        _ => inner,
    }
}

/// 响应解析器
#[derive(Debug, Clone)]
pub struct ResponseParser {
    max_raw_chars: usize,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            max_raw_chars: DEFAULT_RAW_EXCERPT,
        }
    }
}

impl ResponseParser {
    pub fn new(max_raw_chars: usize) -> Self {
        Self { max_raw_chars }
    }

    pub fn parse(&self, raw: &RawCompletion, stage: StageId) -> Result<StageResult, ParseError> {
        let raw_text = raw.as_raw_text();
        let excerpt = truncate_chars(&raw_text, self.max_raw_chars);

        let value = match raw {
            RawCompletion::Structured(value) => value.clone(),
            RawCompletion::Text(text) => {
                let body = unwrap_fenced_json(text)?;
                serde_json::from_str::<Value>(body).map_err(|e| ParseError::InvalidJson {
                    message: e.to_string(),
                    raw: excerpt.clone(),
                })?
            }
        };

        let Value::Object(mut payload) = value else {
            return Err(ParseError::NotAMapping { raw: excerpt });
        };

        validate(stage, stage.schema(), &mut payload, &excerpt)?;
        if stage == StageId::Resolution {
            // 解决方案一律需要人工审批，不采信模型给出的值
            payload.insert("requires_human_approval".to_string(), Value::Bool(true));
        }
        Ok(StageResult::new(stage, payload, excerpt))
    }
}

fn validate(
    stage: StageId,
    schema: &StageSchema,
    payload: &mut Map<String, Value>,
    excerpt: &str,
) -> Result<(), ParseError> {
    check_required(stage, schema.required, payload, excerpt)?;

    if !schema.any_of.is_empty() && !schema.any_of.iter().any(|k| is_present(payload.get(*k))) {
        return Err(ParseError::MissingAnyOf {
            stage,
            fields: schema.any_of.iter().map(|s| s.to_string()).collect(),
            raw: excerpt.to_string(),
        });
    }

    default_lists(stage, schema.optional_lists, payload, excerpt)?;

    if let Some(items) = schema.items {
        let Some(Value::Array(list)) = payload.get_mut(items.field) else {
            return Err(ParseError::InvalidField {
                stage,
                field: items.field.to_string(),
                expected: "a list",
                raw: excerpt.to_string(),
            });
        };
        for (index, item) in list.iter_mut().enumerate() {
            let Value::Object(record) = item else {
                return Err(ParseError::InvalidField {
                    stage,
                    field: format!("{}[{}]", items.field, index),
                    expected: "an object",
                    raw: excerpt.to_string(),
                });
            };
            check_required(stage, items.required, record, excerpt).map_err(|e| match e {
                ParseError::MissingField { stage, field, raw } => ParseError::MissingField {
                    stage,
                    field: format!("{}[{}].{}", items.field, index, field),
                    raw,
                },
                other => other,
            })?;
            default_lists(stage, items.optional_lists, record, excerpt)?;
        }
    }
    Ok(())
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn check_required(
    stage: StageId,
    required: &[&str],
    payload: &Map<String, Value>,
    excerpt: &str,
) -> Result<(), ParseError> {
    match required.iter().find(|k| matches!(payload.get(**k), None | Some(Value::Null))) {
        Some(field) => Err(ParseError::MissingField {
            stage,
            field: field.to_string(),
            raw: excerpt.to_string(),
        }),
        None => Ok(()),
    }
}

fn default_lists(
    stage: StageId,
    lists: &[&str],
    payload: &mut Map<String, Value>,
    excerpt: &str,
) -> Result<(), ParseError> {
    for key in lists {
        match payload.get(*key) {
            None | Some(Value::Null) => {
                payload.insert(key.to_string(), Value::Array(Vec::new()));
            }
            Some(Value::Array(_)) => {}
            Some(_) => {
                return Err(ParseError::InvalidField {
                    stage,
                    field: key.to_string(),
                    expected: "a list",
                    raw: excerpt.to_string(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> RawCompletion {
        RawCompletion::Text(s.to_string())
    }

    #[test]
    fn test_unwrap_without_fence() {
        assert_eq!(unwrap_fenced_json("  {\"a\":1} \n").unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_unwrap_fence_with_language_tag() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(unwrap_fenced_json(raw).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_unwrap_fence_without_language_tag() {
        assert_eq!(unwrap_fenced_json("```\n{\"a\":1}\n```").unwrap(), "{\"a\":1}");
        assert_eq!(unwrap_fenced_json("```{\"a\":1}```").unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_unwrap_mismatched_fences() {
        assert!(matches!(
            unwrap_fenced_json("```json\n{\"a\":1}"),
            Err(ParseError::MismatchedFence { .. })
        ));
        assert!(matches!(
            unwrap_fenced_json("{\"a\":1}\n```"),
            Err(ParseError::MismatchedFence { .. })
        ));
        assert!(matches!(
            unwrap_fenced_json("```"),
            Err(ParseError::MismatchedFence { .. })
        ));
    }

    #[test]
    fn test_unwrap_only_outermost() {
        let raw = "```json\n{\"sql\":\"```inner```\"}\n```";
        assert_eq!(
            unwrap_fenced_json(raw).unwrap(),
            "{\"sql\":\"```inner```\"}"
        );
    }

    #[test]
    fn test_fenced_and_plain_parse_equal() {
        let parser = ResponseParser::default();
        let body = r#"{"status":"answered","internal_summary":"ticket 12345: adjust visit date"}"#;
        let plain = parser.parse(&text(body), StageId::Lookup).unwrap();
        let fenced = parser
            .parse(&text(&format!("```json\n{body}\n```")), StageId::Lookup)
            .unwrap();
        assert_eq!(plain.payload, fenced.payload);
        assert_eq!(plain.stage_id, fenced.stage_id);
    }

    #[test]
    fn test_structured_bypasses_decoding() {
        let parser = ResponseParser::default();
        let raw = RawCompletion::Structured(json!({"status": "not_found"}));
        let result = parser.parse(&raw, StageId::Lookup).unwrap();
        assert_eq!(result.get_str("status"), Some("not_found"));
    }

    #[test]
    fn test_invalid_json_keeps_excerpt() {
        let parser = ResponseParser::new(20);
        let err = parser
            .parse(&text(&format!("{{not json {}", "x".repeat(100))), StageId::Lookup)
            .unwrap_err();
        match err {
            ParseError::InvalidJson { raw, .. } => assert_eq!(raw.chars().count(), 20),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_not_a_mapping() {
        let parser = ResponseParser::default();
        assert!(matches!(
            parser.parse(&text("[1,2]"), StageId::Lookup),
            Err(ParseError::NotAMapping { .. })
        ));
    }

    #[test]
    fn test_missing_required_field_is_error() {
        let parser = ResponseParser::default();
        let err = parser
            .parse(&text(r#"{"diagnostic_summary":"x"}"#), StageId::Diagnosis)
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField { ref field, .. } if field == "investigation_details_md"));
    }

    #[test]
    fn test_coordinator_needs_message_or_info() {
        let parser = ResponseParser::default();
        assert!(matches!(
            parser.parse(&text(r#"{"next_node":"END"}"#), StageId::Coordinator),
            Err(ParseError::MissingAnyOf { .. })
        ));
        assert!(parser
            .parse(&text(r#"{"gathered_info":{"module":"reports"}}"#), StageId::Coordinator)
            .is_ok());
    }

    #[test]
    fn test_record_optional_list_defaults_to_empty() {
        let parser = ResponseParser::default();
        let raw = RawCompletion::Structured(json!({
            "records": [{
                "ticket_id": 1, "title": "t", "problem_summary": "p",
                "root_cause_analysis": "r", "solution_applied": "s",
                "solution_type": "User Guidance", "tags": ["a"], "ticket_level": 1
            }]
        }));
        let result = parser.parse(&raw, StageId::KnowledgeBuilder).unwrap();
        assert_eq!(result.payload["records"][0]["sql_template"], json!([]));
    }

    #[test]
    fn test_record_missing_required_field() {
        let parser = ResponseParser::default();
        let raw = RawCompletion::Structured(json!({
            "records": [{ "ticket_id": 1, "title": "t" }]
        }));
        let err = parser.parse(&raw, StageId::KnowledgeBuilder).unwrap_err();
        assert!(matches!(err, ParseError::MissingField { ref field, .. } if field == "records[0].problem_summary"));
    }

    #[test]
    fn test_resolution_always_requires_approval() {
        let parser = ResponseParser::default();
        let raw = RawCompletion::Structured(json!({
            "action_type": "SQL Script",
            "description": "update the visit date",
            "requires_human_approval": false
        }));
        let result = parser.parse(&raw, StageId::Resolution).unwrap();
        assert_eq!(result.payload["requires_human_approval"], json!(true));
    }

    #[test]
    fn test_records_must_be_list() {
        let parser = ResponseParser::default();
        let raw = RawCompletion::Structured(json!({ "records": "none" }));
        assert!(matches!(
            parser.parse(&raw, StageId::KnowledgeBuilder),
            Err(ParseError::InvalidField { .. })
        ));
    }
}
