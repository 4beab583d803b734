//! StageInvoker：对单一补全能力的封装
//!
//! invoke 负责一次调用（校验输入形态 → 渲染 → 补全），错误按 TriageError 分类；
//! execute 在其上叠加重试策略并交给 ResponseParser 规范化。解析失败不重试。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::TriageError;
use crate::llm::{
    retry_with_backoff, CompletionClient, CompletionRequest, RawCompletion, RetryConfig,
    SessionContext,
};
use crate::stage::{ResponseParser, StageId, StageInput, StageRegistry, StageResult};

#[derive(Clone)]
pub struct StageInvoker {
    client: Arc<dyn CompletionClient>,
    registry: Arc<StageRegistry>,
    parser: ResponseParser,
}

impl StageInvoker {
    pub fn new(client: Arc<dyn CompletionClient>, registry: Arc<StageRegistry>) -> Self {
        Self {
            client,
            registry,
            parser: ResponseParser::default(),
        }
    }

    /// 单次调用，返回原始结果
    pub async fn invoke(
        &self,
        stage: StageId,
        input: &StageInput,
        session: &SessionContext,
    ) -> Result<RawCompletion, TriageError> {
        let expected = stage.schema().input;
        if input.kind() != expected {
            return Err(TriageError::InvalidStageInput {
                stage,
                expected: expected.describe(),
            });
        }
        let rendered = input
            .render()
            .map_err(|e| TriageError::SchemaValidation(format!("cannot serialise input: {e}")))?;

        tracing::debug!(
            stage = %stage,
            session_id = %session.session_id,
            input_chars = rendered.chars().count(),
            "Invoking stage"
        );

        let request = CompletionRequest {
            stage,
            system_prompt: self.registry.prompt(stage),
            input: &rendered,
            session,
        };
        self.client.complete(request).await.map_err(TriageError::from)
    }

    /// 带重试的调用 + 解析
    pub async fn execute(
        &self,
        stage: StageId,
        input: &StageInput,
        session: &SessionContext,
        policy: &RetryConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<StageResult, TriageError> {
        let raw = retry_with_backoff(policy, cancel, TriageError::is_retryable, |_| {
            self.invoke(stage, input, session)
        })
        .await?;

        self.parser.parse(&raw, stage).map_err(|e| {
            tracing::warn!(stage = %stage, "Stage output rejected: {}", e);
            TriageError::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedClient};
    use crate::stage::Dossier;
    use std::time::Duration;

    fn invoker(client: Arc<ScriptedClient>) -> StageInvoker {
        StageInvoker::new(client, Arc::new(StageRegistry::new()))
    }

    fn fast_policy(attempts: u32) -> RetryConfig {
        RetryConfig::new(attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_rejects_wrong_input_kind() {
        let client = Arc::new(ScriptedClient::new());
        let err = invoker(client.clone())
            .invoke(
                StageId::KnowledgeBuilder,
                &StageInput::Text("hello".into()),
                &SessionContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::InvalidStageInput { .. }));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dossiers_rendered_as_json_array() {
        let client = Arc::new(ScriptedClient::new());
        client.push_text(StageId::KnowledgeBuilder, r#"{"records": []}"#);
        let input = StageInput::Dossiers(vec![Dossier {
            ticket_id: 3,
            dossier: "closed ticket".into(),
        }]);
        invoker(client.clone())
            .execute(
                StageId::KnowledgeBuilder,
                &input,
                &SessionContext::default(),
                &RetryConfig::none(),
                None,
            )
            .await
            .unwrap();
        assert!(client.calls()[0].input.starts_with('['));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_error(StageId::Lookup, LlmError::Timeout)
            .push_text(StageId::Lookup, r#"{"status": "not_found"}"#);
        let result = invoker(client.clone())
            .execute(
                StageId::Lookup,
                &StageInput::Text("info".into()),
                &SessionContext::default(),
                &fast_policy(2),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.get_str("status"), Some("not_found"));
        assert_eq!(client.calls_for(StageId::Lookup), 2);
    }

    #[tokio::test]
    async fn test_parse_error_is_not_retried() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_text(StageId::Lookup, "not json at all")
            .push_text(StageId::Lookup, r#"{"status": "answered"}"#);
        let err = invoker(client.clone())
            .execute(
                StageId::Lookup,
                &StageInput::Text("info".into()),
                &SessionContext::default(),
                &fast_policy(3),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::Parse(_)));
        assert_eq!(client.calls_for(StageId::Lookup), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let client = Arc::new(ScriptedClient::new());
        client.push_error(StageId::Diagnosis, LlmError::Unavailable("401".into()));
        let err = invoker(client.clone())
            .execute(
                StageId::Diagnosis,
                &StageInput::Text("info".into()),
                &SessionContext::default(),
                &fast_policy(3),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(client.calls_for(StageId::Diagnosis), 1);
    }
}
