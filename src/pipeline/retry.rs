//! Targeted retry of the final synthesis.
//!
//! Re-runs only the chairman (council) or moderator (arena) call against the
//! intermediate data preserved in the last assistant message; peers are
//! never re-queried. The stored message is updated in place only when the
//! fresh synthesis is not itself an `"Error:"` placeholder.

use super::{handle_pipeline_failure, synthesize_with_retry, PipelineCtx, RequestContext};
use crate::deliberation::{DeliberationMode, MemberRanking, MemberResponse};
use crate::error::{CouncilError, Result};
use crate::events::{EventSink, StreamEvent};
use crate::metrics::{aggregate_arena, aggregate_council, AggregateMetrics};
use crate::prompts;
use crate::storage::AssistantMessage;
use std::time::Instant;

/// Inputs for one retry-synthesis run.
#[derive(Debug, Clone)]
pub struct RetryInput {
    pub conversation_id: String,
    /// The synthesis model to use this time (may differ from the original).
    pub chairman_model: String,
}

/// Council intermediate data extracted from a stored assistant message.
///
/// The unified `rounds` shape is tried first (responses round + rankings
/// round); legacy flat documents reach this point already migrated by the
/// storage layer's lazy read-time conversion.
pub(crate) fn extract_council_stages(
    message: &AssistantMessage,
) -> Option<(Vec<MemberResponse>, Vec<MemberRanking>)> {
    if message.rounds.len() < 2 {
        return None;
    }

    let stage1: Vec<MemberResponse> = message.rounds[0]
        .responses
        .iter()
        .map(|r| MemberResponse {
            model: r.model.clone(),
            content: r.content.clone(),
            metrics: r.metrics.clone(),
            reasoning_details: r.reasoning_details.clone(),
        })
        .collect();

    let stage2: Vec<MemberRanking> = message.rounds[1]
        .responses
        .iter()
        .map(|r| MemberRanking {
            model: r.model.clone(),
            critique: r.content.clone(),
            parsed_ranking: r.parsed_ranking.clone().unwrap_or_default(),
            metrics: r.metrics.clone(),
            reasoning_details: r.reasoning_details.clone(),
        })
        .collect();

    if stage1.is_empty() || stage2.is_empty() {
        return None;
    }
    Some((stage1, stage2))
}

/// Run retry-synthesis, reporting progress and errors through `sink`.
pub async fn run(ctx: &PipelineCtx, request: &RequestContext, input: RetryInput, sink: &EventSink) {
    if let Err(e) = run_inner(ctx, request, &input, sink).await {
        handle_pipeline_failure(ctx, request, &input.conversation_id, sink, e).await;
    }
}

async fn run_inner(
    ctx: &PipelineCtx,
    request: &RequestContext,
    input: &RetryInput,
    sink: &EventSink,
) -> Result<()> {
    let retry_start = Instant::now();
    let user = request.user_scope();
    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        chairman = %input.chairman_model,
        "beginning synthesis retry"
    );

    let conversation = ctx
        .store
        .get(&input.conversation_id, user)?
        .ok_or_else(|| CouncilError::ConversationNotFound(input.conversation_id.clone()))?;

    let (_, assistant, user_query) = ctx
        .store
        .last_assistant_with_query(&conversation)
        .ok_or_else(|| CouncilError::Precondition("No deliberation found to retry".into()))?;

    let (prompt, fallback) = match assistant.mode {
        DeliberationMode::Council => {
            let (stage1, stage2) = extract_council_stages(&assistant).ok_or_else(|| {
                CouncilError::Precondition("Stage 1 or Stage 2 data missing".into())
            })?;
            (
                prompts::chairman_prompt(&user_query, &stage1, &stage2),
                "Error: Unable to generate final synthesis.",
            )
        }
        DeliberationMode::Arena => {
            if assistant.rounds.is_empty() {
                return Err(CouncilError::Precondition(
                    "Stored debate has no rounds".into(),
                ));
            }
            (
                prompts::arena_synthesis_prompt(
                    &user_query,
                    &assistant.rounds,
                    &assistant.participant_mapping,
                ),
                "Error: Unable to generate synthesis.",
            )
        }
    };

    sink.emit(StreamEvent::Stage3Start).await?;
    let synthesis = synthesize_with_retry(ctx, &input.chairman_model, prompt, fallback).await;

    if synthesis.is_error() {
        tracing::warn!(
            conversation_id = %input.conversation_id,
            chairman = %input.chairman_model,
            "synthesis retry failed again"
        );
        sink.emit(StreamEvent::Stage3Complete { data: synthesis }).await?;
        sink.emit(StreamEvent::Error {
            message: "Synthesis model failed again".into(),
        })
        .await?;
        return Ok(());
    }

    sink.emit(StreamEvent::Stage3Complete {
        data: synthesis.clone(),
    })
    .await?;

    let metrics = match assistant.mode {
        DeliberationMode::Council => {
            let (stage1, stage2) =
                extract_council_stages(&assistant).expect("validated above");
            AggregateMetrics::Council(aggregate_council(&stage1, &stage2, &synthesis))
        }
        DeliberationMode::Arena => {
            AggregateMetrics::Arena(aggregate_arena(&assistant.rounds, &synthesis))
        }
    };
    sink.emit(StreamEvent::MetricsComplete {
        data: metrics.clone(),
    })
    .await?;

    ctx.store
        .update_last_synthesis(&input.conversation_id, &synthesis, &metrics, user)?;

    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        duration_ms = retry_start.elapsed().as_millis() as u64,
        "synthesis retry complete"
    );
    sink.emit(StreamEvent::Complete).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliberation::{
        DeliberationResult, ParticipantResponse, Round, RoundType, Synthesis,
    };
    use crate::gateway::mock::{MockGateway, MockOutcome};
    use crate::pipeline::testutil::{collect_events, kinds, mock_ctx};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn council_with_error_synthesis() -> DeliberationResult {
        let mapping: BTreeMap<String, String> =
            [("Response A".to_string(), "alpha/one".to_string())].into();
        DeliberationResult {
            mode: DeliberationMode::Council,
            rounds: vec![
                Round::new(
                    1,
                    RoundType::Responses,
                    vec![ParticipantResponse {
                        participant: "Response A".into(),
                        model: "alpha/one".into(),
                        content: "the answer".into(),
                        metrics: None,
                        reasoning_details: None,
                        parsed_ranking: None,
                    }],
                ),
                Round::new(
                    2,
                    RoundType::Rankings,
                    vec![ParticipantResponse {
                        participant: "alpha/one".into(),
                        model: "alpha/one".into(),
                        content: "FINAL RANKING:\n1. Response A".into(),
                        metrics: None,
                        reasoning_details: None,
                        parsed_ranking: Some(vec!["Response A".into()]),
                    }],
                ),
            ],
            synthesis: Some(Synthesis {
                model: "chair/model".into(),
                content: "Error: Unable to generate final synthesis.".into(),
                metrics: None,
                reasoning_details: None,
            }),
            participant_mapping: mapping,
            metrics: None,
        }
    }

    async fn run_retry(ctx: &PipelineCtx, input: RetryInput) -> Vec<StreamEvent> {
        let request = RequestContext::new(None);
        let (sink, rx) = EventSink::channel(1024);
        run(ctx, &request, input, &sink).await;
        drop(sink);
        collect_events(rx).await
    }

    fn retry_input() -> RetryInput {
        RetryInput {
            conversation_id: "conv-1".into(),
            chairman_model: "backup/chair".into(),
        }
    }

    #[tokio::test]
    async fn test_retry_replaces_failed_synthesis_in_place() {
        let mock = MockGateway::default();
        mock.push_for_model("backup/chair", MockOutcome::reply("A proper answer."));
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();
        ctx.store.add_user_message("conv-1", "the question", None).unwrap();
        ctx.store
            .add_assistant_result("conv-1", &council_with_error_synthesis(), None)
            .unwrap();

        let events = run_retry(&ctx, retry_input()).await;
        assert_eq!(
            kinds(&events),
            vec!["stage3_start", "stage3_complete", "metrics_complete", "complete"]
        );

        let conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        let assistant = &conversation.messages[1];
        assert_eq!(assistant["synthesis"]["content"], "A proper answer.");
        assert_eq!(assistant["synthesis"]["model"], "backup/chair");
        // Rounds preserved untouched.
        assert_eq!(assistant["rounds"].as_array().unwrap().len(), 2);
        assert_eq!(assistant["rounds"][0]["responses"][0]["content"], "the answer");
        // Peers were not re-queried: exactly one upstream call.
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_failing_again_does_not_persist() {
        let mock = MockGateway::default();
        mock.push_for_model("backup/chair", MockOutcome::status(400, "down"));
        mock.push_for_model("backup/chair", MockOutcome::status(400, "down"));
        let (_dir, ctx) = mock_ctx(mock);
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();
        ctx.store.add_user_message("conv-1", "q", None).unwrap();
        ctx.store
            .add_assistant_result("conv-1", &council_with_error_synthesis(), None)
            .unwrap();

        let events = run_retry(&ctx, retry_input()).await;
        assert_eq!(kinds(&events), vec!["stage3_start", "stage3_complete", "error"]);

        // Stored synthesis unchanged: still the original error marker.
        let conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        assert!(conversation.messages[1]["synthesis"]["content"]
            .as_str()
            .unwrap()
            .starts_with("Error:"));
        assert_eq!(conversation.messages[1]["synthesis"]["model"], "chair/model");
    }

    #[tokio::test]
    async fn test_retry_without_assistant_message_errors() {
        let mock = MockGateway::default();
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();
        ctx.store.add_user_message("conv-1", "q", None).unwrap();

        let events = run_retry(&ctx, retry_input()).await;
        assert_eq!(kinds(&events), vec!["error"]);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_missing_conversation_errors() {
        let mock = MockGateway::default();
        let (_dir, ctx) = mock_ctx(mock);
        let events = run_retry(&ctx, retry_input()).await;
        assert_eq!(kinds(&events), vec!["error"]);
    }

    #[tokio::test]
    async fn test_retry_works_against_legacy_document() {
        let mock = MockGateway::default();
        mock.push_for_model("backup/chair", MockOutcome::reply("modern answer"));
        let (_dir, ctx) = mock_ctx(mock);
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();

        // Write a legacy flat-format document directly.
        let mut conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        conversation.messages.push(json!({"role": "user", "content": "old question"}));
        conversation.messages.push(json!({
            "role": "assistant",
            "stage1": [{"model": "alpha/one", "response": "legacy answer"}],
            "stage2": [{"model": "alpha/one", "ranking": "FINAL RANKING:\n1. Response A"}],
            "stage3": {"model": "chair/model", "response": "Error: old failure"}
        }));
        let store_dir = ctx.settings.data_dir.join("conversations");
        std::fs::write(
            store_dir.join("conv-1.json"),
            serde_json::to_string_pretty(&conversation).unwrap(),
        )
        .unwrap();

        let events = run_retry(&ctx, retry_input()).await;
        assert_eq!(*kinds(&events).last().unwrap(), "complete");

        let loaded = ctx.store.get("conv-1", None).unwrap().unwrap();
        let assistant = &loaded.messages[2];
        // Legacy message was upgraded in place with the fresh synthesis.
        assert!(assistant.get("rounds").is_some());
        assert_eq!(assistant["synthesis"]["content"], "modern answer");
    }

    #[tokio::test]
    async fn test_retry_arena_message_reruns_moderator() {
        let mock = MockGateway::default();
        mock.push_for_model("backup/chair", MockOutcome::reply("fresh moderation"));
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();
        ctx.store.add_user_message("conv-1", "debate q", None).unwrap();

        let mapping: BTreeMap<String, String> =
            [("Participant A".to_string(), "alpha/one".to_string())].into();
        let arena = DeliberationResult {
            mode: DeliberationMode::Arena,
            rounds: vec![Round::new(
                1,
                RoundType::Opening,
                vec![ParticipantResponse {
                    participant: "Participant A".into(),
                    model: "alpha/one".into(),
                    content: "opening".into(),
                    metrics: None,
                    reasoning_details: None,
                    parsed_ranking: None,
                }],
            )],
            synthesis: Some(Synthesis {
                model: "chair/model".into(),
                content: "Error: Unable to generate synthesis.".into(),
                metrics: None,
                reasoning_details: None,
            }),
            participant_mapping: mapping,
            metrics: None,
        };
        ctx.store.add_assistant_result("conv-1", &arena, None).unwrap();

        let events = run_retry(&ctx, retry_input()).await;
        assert_eq!(*kinds(&events).last().unwrap(), "complete");

        let loaded = ctx.store.get("conv-1", None).unwrap().unwrap();
        assert_eq!(loaded.messages[1]["synthesis"]["content"], "fresh moderation");
        // The moderator prompt carried the identity reveal.
        let prompts_seen = mock.seen_prompts();
        assert!(prompts_seen[0].contains("alpha/one"));
    }
}
