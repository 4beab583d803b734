//! 各阶段的输入组装
//!
//! 协调者看到用户对话（或待呈现的结果）；专家阶段看到收集到的信息与上游阶段的结论。

use serde_json::Value;

use crate::stage::{StageId, StageInput, StageResult, PRESENT_MARKER, RECOVERY_MARKER};
use crate::triage::ConversationState;

/// 组装阶段输入；`recovering` 表示上一步回退到了协调者
pub fn compose_input(
    stage: StageId,
    state: &ConversationState,
    recovering: bool,
    transcript_window: usize,
) -> StageInput {
    let mut sections = Vec::new();

    match stage {
        StageId::Coordinator => {
            if recovering {
                sections.push(format!(
                    "{RECOVERY_MARKER}\nThe last analysis step could not be completed. Ask the user to describe the problem again."
                ));
            } else if state.presenting {
                if let Some(result) = state.presentable() {
                    sections.push(format!("{PRESENT_MARKER}\n{}", present(result)));
                }
            }
            sections.push(transcript(state, transcript_window));
            if let Some(info) = &state.gathered_info {
                sections.push(format!("## Gathered information\n{}", pretty(info)));
            }
        }
        StageId::Lookup => {
            sections.push(gathered(state));
            sections.push(transcript(state, transcript_window));
        }
        StageId::Diagnosis => {
            sections.push(gathered(state));
            if let Some(lookup) = state.latest_from(StageId::Lookup) {
                sections.push(format!(
                    "## Knowledge lookup\n{}",
                    lookup.get_str("internal_summary").unwrap_or("no similar ticket found")
                ));
            }
        }
        StageId::Resolution => {
            sections.push(gathered(state));
            if let Some(diagnosis) = state.latest_from(StageId::Diagnosis) {
                sections.push(format!("## Diagnosis\n{}", pretty(&diagnosis.payload_value())));
            }
        }
        StageId::KnowledgeBuilder => return StageInput::Dossiers(Vec::new()),
    }

    StageInput::Text(sections.join("\n\n"))
}

fn transcript(state: &ConversationState, window: usize) -> String {
    let lines: Vec<String> = state
        .recent_user_messages(window)
        .iter()
        .map(|m| format!("- {m}"))
        .collect();
    format!("## User messages (oldest first)\n{}", lines.join("\n"))
}

fn gathered(state: &ConversationState) -> String {
    match &state.gathered_info {
        Some(info) => format!("## Gathered information\n{}", pretty(info)),
        None => "## Gathered information\n(none)".to_string(),
    }
}

fn present(result: &StageResult) -> String {
    match result.stage_id {
        StageId::Lookup => result
            .get_str("internal_summary")
            .unwrap_or("A known solution applies to this problem.")
            .to_string(),
        _ => pretty(&result.payload_value()),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(input: StageInput) -> String {
        match input {
            StageInput::Text(t) => t,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_coordinator_sees_transcript() {
        let mut state = ConversationState::new("s");
        state.begin_turn("the report is blank");
        let input = text(compose_input(StageId::Coordinator, &state, false, 10));
        assert!(input.contains("the report is blank"));
        assert!(!input.contains(PRESENT_MARKER));
    }

    #[test]
    fn test_coordinator_presenting_includes_result() {
        let mut state = ConversationState::new("s");
        state.begin_turn("help");
        state.record(StageResult::new(
            StageId::Lookup,
            json!({"status": "answered", "internal_summary": "ticket 12345: adjust the visit date"})
                .as_object()
                .cloned()
                .unwrap(),
            "",
        ));
        state.presenting = true;
        let input = text(compose_input(StageId::Coordinator, &state, false, 10));
        assert!(input.contains(PRESENT_MARKER));
        assert!(input.contains("ticket 12345"));
    }

    #[test]
    fn test_recovery_marker() {
        let state = ConversationState::new("s");
        let input = text(compose_input(StageId::Coordinator, &state, true, 10));
        assert!(input.contains(RECOVERY_MARKER));
    }

    #[test]
    fn test_resolution_sees_diagnosis() {
        let mut state = ConversationState::new("s");
        state.gathered_info = Some(json!({"module": "visits"}));
        state.record(StageResult::new(
            StageId::Diagnosis,
            json!({"diagnostic_summary": "wrong date", "investigation_details_md": "-", "next_step_recommendation": "fix"})
                .as_object()
                .cloned()
                .unwrap(),
            "",
        ));
        let input = text(compose_input(StageId::Resolution, &state, false, 10));
        assert!(input.contains("wrong date"));
        assert!(input.contains("visits"));
    }
}
