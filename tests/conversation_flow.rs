//! 会话编排集成测试：Scripted 补全客户端驱动完整的 阶段 → 路由 循环

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use triage::config::AppConfig;
    use triage::core::recovery::{CONVERSATION_CLOSED_MESSAGE, HOP_LIMIT_MESSAGE};
    use triage::core::{FailureKind, RecoveryEngine};
    use triage::llm::{LlmError, RetryConfig, ScriptedClient};
    use triage::stage::{StageId, StageInvoker, StageRegistry, PRESENT_MARKER, RECOVERY_MARKER};
    use triage::triage::{
        ChatRequest, ChatResponse, ConversationOrchestrator, MemorySessionStore, TurnEvent,
        TurnReply,
    };

    fn orchestrator_with(client: Arc<ScriptedClient>, cfg: AppConfig) -> Arc<ConversationOrchestrator> {
        let invoker = StageInvoker::new(client, Arc::new(StageRegistry::new()));
        Arc::new(
            ConversationOrchestrator::new(invoker, Arc::new(MemorySessionStore::new()), &cfg)
                .with_retry(RetryConfig::new(
                    2,
                    Duration::from_millis(1),
                    Duration::from_millis(2),
                )),
        )
    }

    fn orchestrator(client: Arc<ScriptedClient>) -> Arc<ConversationOrchestrator> {
        orchestrator_with(client, AppConfig::default())
    }

    async fn ask(orch: &Arc<ConversationOrchestrator>, session: &str, message: &str) -> TurnReply {
        let request = ChatRequest {
            message: message.to_string(),
            session_id: session.to_string(),
            stream: false,
        };
        match orch.chat(request).await {
            ChatResponse::Complete(reply) => reply,
            ChatResponse::Stream(_) => panic!("expected a complete reply"),
        }
    }

    #[tokio::test]
    async fn test_clarify_then_lookup_answer_is_presented() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Which report shows the problem?"}),
            )
            .push_json(
                StageId::Coordinator,
                json!({
                    "user_message": "Thanks, checking now.",
                    "gathered_info": {"module": "visits report", "symptom": "blank rows"}
                }),
            )
            .push_json(
                StageId::Lookup,
                json!({"status": "answered", "internal_summary": "ticket 12345: adjust the visit date"}),
            )
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Please adjust the visit date and reload the report."}),
            );
        let orch = orchestrator(client.clone());

        let first = ask(&orch, "s1", "my report is broken").await;
        assert_eq!(first.user_message, "Which report shows the problem?");
        assert_eq!(first.next_node, None);

        let second = ask(&orch, "s1", "the visits report shows blank rows").await;
        assert_eq!(
            second.user_message,
            "Please adjust the visit date and reload the report."
        );
        assert!(second.is_end());

        assert_eq!(client.calls_for(StageId::Coordinator), 3);
        assert_eq!(client.calls_for(StageId::Lookup), 1);
        assert_eq!(client.calls_for(StageId::Diagnosis), 0);

        let presenting_call = client
            .calls()
            .into_iter()
            .filter(|c| c.stage == StageId::Coordinator)
            .last()
            .unwrap();
        assert!(presenting_call.input.contains(PRESENT_MARKER));
        assert!(presenting_call.input.contains("ticket 12345"));

        let state = orch.state("s1").await.unwrap();
        assert!(state.terminal);
        assert_eq!(state.turn, 2);
        assert_eq!(state.history.len(), 4);
        assert_eq!(
            state.gathered_info,
            Some(json!({"module": "visits report", "symptom": "blank rows"}))
        );
    }

    #[tokio::test]
    async fn test_not_found_escalates_through_diagnosis_and_resolution() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_text(
                StageId::Coordinator,
                "```json\n{\"user_message\": \"Looking into it.\", \"gathered_info\": {\"problem\": \"wrong total\"}}\n```",
            )
            .push_text(StageId::Lookup, "```\n{\"status\": \"not_found\"}\n```")
            .push_text(
                StageId::Diagnosis,
                r#"{"diagnostic_summary": "duplicated visits", "investigation_details_md": "- checked totals", "next_step_recommendation": "remove duplicates"}"#,
            )
            .push_text(
                StageId::Resolution,
                "```json\n{\"action_type\": \"SQL Script\", \"description\": \"delete duplicated visits\", \"sql_script\": \"DELETE FROM visits WHERE id = :id\", \"requires_human_approval\": false}\n```",
            )
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "I found duplicated visits; our team will remove them after approval."}),
            );
        let orch = orchestrator(client.clone());

        let reply = ask(&orch, "s2", "the monthly total is wrong for my farm").await;
        assert!(reply.is_end());
        assert!(reply.user_message.contains("duplicated visits"));

        let state = orch.state("s2").await.unwrap();
        let stages: Vec<StageId> = state.history.iter().map(|r| r.stage_id).collect();
        assert_eq!(
            stages,
            vec![
                StageId::Coordinator,
                StageId::Lookup,
                StageId::Diagnosis,
                StageId::Resolution,
                StageId::Coordinator,
            ]
        );
        let plan = state.latest_from(StageId::Resolution).unwrap();
        assert_eq!(plan.payload["requires_human_approval"], json!(true));

        let resolution_call = client
            .calls()
            .into_iter()
            .find(|c| c.stage == StageId::Resolution)
            .unwrap();
        assert!(resolution_call.input.contains("duplicated visits"));
    }

    #[tokio::test]
    async fn test_timeout_turns_into_apology() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_error(StageId::Coordinator, LlmError::Timeout)
            .push_error(StageId::Coordinator, LlmError::Timeout);
        let orch = orchestrator(client.clone());

        let reply = ask(&orch, "s3", "hello?").await;
        let expected = RecoveryEngine::new().handle(FailureKind::Transient);
        assert_eq!(reply.user_message, expected.user_message());
        assert_eq!(reply.next_node, None);
        let text = reply.user_message.to_lowercase();
        for leak in ["timeout", "timed out", "coordinator", "error", "{"] {
            assert!(!text.contains(leak), "reply leaks '{leak}'");
        }
        // 交互轮次最多重试一次
        assert_eq!(client.calls_for(StageId::Coordinator), 2);

        let state = orch.state("s3").await.unwrap();
        assert!(!state.terminal);
        assert!(state.history[0].is_failure());
    }

    #[tokio::test]
    async fn test_specialist_failure_routes_back_to_coordinator() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Checking.", "gathered_info": {"problem": "sync fails"}}),
            )
            .push_json(StageId::Lookup, json!({"status": "not_found"}))
            .push_text(StageId::Diagnosis, "I think it is the network")
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Could you tell me again what happens when you sync?"}),
            );
        let orch = orchestrator(client.clone());

        let reply = ask(&orch, "s4", "sync fails on my tablet every morning since monday").await;
        assert_eq!(
            reply.user_message,
            "Could you tell me again what happens when you sync?"
        );
        assert!(!reply.is_end());

        let recovery_call = client
            .calls()
            .into_iter()
            .filter(|c| c.stage == StageId::Coordinator)
            .last()
            .unwrap();
        assert!(recovery_call.input.contains(RECOVERY_MARKER));
        assert_eq!(client.calls_for(StageId::Resolution), 0);
    }

    #[tokio::test]
    async fn test_unknown_routing_hint_falls_back() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Checking.", "gathered_info": {"problem": "login"}}),
            )
            .push_json(
                StageId::Lookup,
                json!({"status": "answered", "internal_summary": "reset password", "next_node": "N9_SuperAgent"}),
            )
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Could you describe the login problem again?"}),
            );
        let orch = orchestrator(client.clone());

        let reply = ask(&orch, "s5", "cannot log in").await;
        assert_eq!(reply.user_message, "Could you describe the login problem again?");
        assert!(!reply.is_end());
        assert!(!orch.state("s5").await.unwrap().terminal);
    }

    #[tokio::test]
    async fn test_hop_limit_yields_holding_message() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Checking.", "gathered_info": {"problem": "export"}}),
            )
            .push_json(StageId::Lookup, json!({"status": "not_found"}));
        let mut cfg = AppConfig::default();
        cfg.app.max_stage_hops = 2;
        let orch = orchestrator_with(client.clone(), cfg);

        let reply = ask(&orch, "s6", "export to excel fails").await;
        assert_eq!(reply.user_message, HOP_LIMIT_MESSAGE);
        assert_eq!(client.calls_for(StageId::Diagnosis), 0);
        let state = orch.state("s6").await.unwrap();
        assert_eq!(state.current_stage, StageId::Coordinator);
    }

    #[tokio::test]
    async fn test_streaming_emits_progress_then_reply() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Checking.", "gathered_info": {"problem": "report"}}),
            )
            .push_json(StageId::Lookup, json!({"status": "answered", "internal_summary": "known fix"}))
            .push_json(StageId::Coordinator, json!({"user_message": "Here is the fix."}));
        let orch = orchestrator(client);

        let request = ChatRequest {
            message: "report is empty".into(),
            session_id: "s7".into(),
            stream: true,
        };
        let mut events = match orch.chat(request).await {
            ChatResponse::Stream(rx) => rx,
            ChatResponse::Complete(_) => panic!("expected a stream"),
        };

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }

        assert_eq!(received.len(), 4);
        for (i, event) in received[..3].iter().enumerate() {
            match event {
                TurnEvent::Progress { step, message } => {
                    assert_eq!(*step, i + 1);
                    let lower = message.to_lowercase();
                    assert!(!lower.contains("lookup") && !lower.contains("coordinator"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        match &received[3] {
            TurnEvent::Reply(reply) => {
                assert_eq!(reply.user_message, "Here is the fix.");
                assert!(reply.is_end());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concluded_conversation_runs_no_stage() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(
                StageId::Coordinator,
                json!({"user_message": "Checking.", "gathered_info": {"problem": "report"}}),
            )
            .push_json(StageId::Lookup, json!({"status": "answered", "internal_summary": "known fix"}))
            .push_json(StageId::Coordinator, json!({"user_message": "Here is the fix."}));
        let orch = orchestrator(client.clone());

        assert!(ask(&orch, "s8", "report is empty").await.is_end());
        let calls_before = client.calls().len();

        let reply = ask(&orch, "s8", "thanks!").await;
        assert_eq!(reply.user_message, CONVERSATION_CLOSED_MESSAGE);
        assert_eq!(client.calls().len(), calls_before);
        assert_eq!(orch.state("s8").await.unwrap().history.len(), 3);
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_state() {
        let client = Arc::new(ScriptedClient::new());
        client
            .push_json(StageId::Coordinator, json!({"user_message": "Question for A?"}))
            .push_json(StageId::Coordinator, json!({"user_message": "Question for B?"}));
        let orch = orchestrator(client.clone());

        ask(&orch, "a", "first user").await;
        ask(&orch, "b", "second user").await;

        let a = orch.state("a").await.unwrap();
        let b = orch.state("b").await.unwrap();
        assert_eq!(a.user_messages, vec!["first user".to_string()]);
        assert_eq!(b.user_messages, vec!["second user".to_string()]);
        let sessions: Vec<String> = client.calls().into_iter().map(|c| c.session_id).collect();
        assert_eq!(sessions, vec!["a".to_string(), "b".to_string()]);
    }
}
