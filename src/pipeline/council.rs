//! The 3-stage council pipeline.
//!
//! `Start → WebSearch? → Stage1 → Stage2 → Stage3 → Persist → Done`, with a
//! `Resume` side entry that re-enters at Stage 2 when the pending marker
//! already holds stage-1 data. Stage 1 streams progressively: each model's
//! answer is forwarded the moment it arrives, while slower members are
//! still running.

use super::{
    handle_pipeline_failure, synthesize_with_retry, web_search_step, PipelineCtx, PriorContext,
    RequestContext,
};
use crate::attachments::{attachment_context, AttachmentMeta};
use crate::deliberation::{
    council_to_unified, label_mapping, CouncilMetadata, DeliberationMode, MemberRanking,
    MemberResponse,
};
use crate::error::{CouncilError, Result};
use crate::events::{EventSink, Stage1StartData, StreamEvent, TitleData, TokenData};
use crate::fanout::{Fanout, FanoutEvent, FanoutOptions, FanoutPrompt};
use crate::gateway::ChatMessage;
use crate::metrics::{aggregate_council, AggregateMetrics};
use crate::pending::PartialData;
use crate::prompts;
use crate::ranking::aggregate_rankings;
use std::time::Instant;

/// All inputs needed by one council run.
#[derive(Debug, Clone)]
pub struct CouncilInput {
    pub conversation_id: String,
    pub content: String,
    pub council_models: Vec<String>,
    pub chairman_model: String,
    pub is_first_message: bool,
    pub use_web_search: bool,
    pub resume: bool,
    pub attachments: Vec<AttachmentMeta>,
    pub prior_context: Option<PriorContext>,
}

/// Run the council pipeline, reporting progress and errors through `sink`.
pub async fn run(ctx: &PipelineCtx, request: &RequestContext, input: CouncilInput, sink: &EventSink) {
    if let Err(e) = run_inner(ctx, request, &input, sink).await {
        handle_pipeline_failure(ctx, request, &input.conversation_id, sink, e).await;
    }
}

async fn run_inner(
    ctx: &PipelineCtx,
    request: &RequestContext,
    input: &CouncilInput,
    sink: &EventSink,
) -> Result<()> {
    let pipeline_start = Instant::now();
    let user = request.user_scope();
    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        models = input.council_models.len(),
        chairman = %input.chairman_model,
        web_search = input.use_web_search,
        resume = input.resume,
        "beginning council pipeline"
    );

    if input.council_models.is_empty() {
        return Err(CouncilError::Precondition(
            "council must contain at least one model".into(),
        ));
    }

    // --- Resume check ---
    let resumed_stage1 = if input.resume {
        ctx.pending
            .get(&input.conversation_id, user)
            .and_then(|marker| marker.partial_data.stage1)
            .filter(|stage1| !stage1.is_empty())
    } else {
        None
    };
    let can_resume = resumed_stage1.is_some();

    let mut web_search_used = false;
    let mut web_search_error = None;

    let stage1_results: Vec<MemberResponse> = if let Some(stored) = resumed_stage1 {
        tracing::info!(
            conversation_id = %input.conversation_id,
            cached_responses = stored.len(),
            "resuming council pipeline from stage 2"
        );
        sink.emit(StreamEvent::ResumeStart {
            data: crate::events::ResumeData { from_stage: 2 },
        })
        .await?;
        sink.emit(StreamEvent::Stage1Complete {
            data: stored.clone(),
            resumed: Some(true),
        })
        .await?;
        stored
    } else {
        // --- Normal flow ---
        ctx.store
            .add_user_message(&input.conversation_id, &input.content, user)?;
        ctx.pending.mark_pending(
            &input.conversation_id,
            DeliberationMode::Council,
            &input.content,
            user,
        )?;

        if let Some(source_id) = input
            .prior_context
            .as_ref()
            .and_then(|p| p.source_conversation_id.clone())
        {
            sink.emit(StreamEvent::PriorContext {
                data: crate::events::PriorContextData { source_id },
            })
            .await?;
        }

        let (web_context, search_error) =
            web_search_step(ctx, sink, &input.content, input.use_web_search).await?;
        web_search_used = web_context.is_some();
        web_search_error = search_error;

        let combined_context = build_combined_context(ctx, input, user, web_context.as_deref());

        // --- Stage 1: progressive parallel responses ---
        sink.emit(StreamEvent::Stage1Start {
            data: Stage1StartData {
                models: input.council_models.clone(),
            },
        })
        .await?;

        let stage1_start = Instant::now();
        let messages = vec![
            ChatMessage::system(prompts::STAGE1_SYSTEM_PROMPT),
            ChatMessage::user(prompts::stage1_user_prompt(
                &input.content,
                combined_context.as_deref(),
            )),
        ];

        let mut fanout = Fanout::spawn(
            ctx.gateway.clone(),
            ctx.backoff.clone(),
            &input.council_models,
            FanoutPrompt::Shared(messages),
            FanoutOptions {
                stream_tokens: true,
                timeout: None,
            },
        )?;

        let mut results: Vec<MemberResponse> = Vec::new();
        let total = input.council_models.len();
        while let Some(event) = fanout.next_event().await {
            match event {
                FanoutEvent::Completed {
                    model,
                    outcome: Ok(reply),
                } => {
                    let response = MemberResponse {
                        model,
                        content: reply.content,
                        metrics: Some(reply.metrics),
                        reasoning_details: reply.reasoning_details,
                    };
                    results.push(response.clone());
                    sink.emit(StreamEvent::Stage1ModelResponse {
                        data: response,
                        index: results.len(),
                        total,
                    })
                    .await?;
                }
                FanoutEvent::Completed {
                    model,
                    outcome: Err(e),
                } => {
                    tracing::warn!(
                        conversation_id = %input.conversation_id,
                        model,
                        category = ?e.category,
                        error = %e,
                        "council member failed, excluded from stage 1"
                    );
                }
                FanoutEvent::Progress(progress) => {
                    sink.emit(StreamEvent::Stage1Progress { data: progress }).await?;
                }
                FanoutEvent::Token { model, token } => {
                    sink.emit(StreamEvent::Stage1Token {
                        data: TokenData { model, token },
                    })
                    .await?;
                }
            }
        }

        tracing::info!(
            conversation_id = %input.conversation_id,
            responses = results.len(),
            total,
            duration_ms = stage1_start.elapsed().as_millis() as u64,
            "stage 1 complete"
        );

        if results.is_empty() {
            return Err(CouncilError::Other(
                "All models failed to respond. Please try again.".into(),
            ));
        }

        sink.emit(StreamEvent::Stage1Complete {
            data: results.clone(),
            resumed: None,
        })
        .await?;
        ctx.pending.update_progress(
            &input.conversation_id,
            PartialData::stage1(results.clone()),
            user,
        )?;

        results
    };

    // --- Title generation, concurrent with stages 2 and 3 ---
    let title_task = if input.is_first_message && !can_resume {
        let title_ctx = ctx.clone();
        let content = input.content.clone();
        Some(tokio::spawn(async move {
            super::generate_title(&title_ctx, &content).await
        }))
    } else {
        None
    };

    // --- Stage 2: peer rankings ---
    sink.emit(StreamEvent::Stage2Start).await?;
    let stage2_start = Instant::now();

    let ranking_messages = vec![ChatMessage::user(prompts::ranking_prompt(
        &input.content,
        &stage1_results,
    ))];
    let mut fanout = Fanout::spawn(
        ctx.gateway.clone(),
        ctx.backoff.clone(),
        &input.council_models,
        FanoutPrompt::Shared(ranking_messages),
        FanoutOptions::default(),
    )?;

    let mut stage2_results: Vec<MemberRanking> = Vec::new();
    while let Some(event) = fanout.next_event().await {
        if let FanoutEvent::Completed { model, outcome } = event {
            match outcome {
                Ok(reply) => {
                    let parsed_ranking = crate::ranking::parse_ranking(&reply.content);
                    stage2_results.push(MemberRanking {
                        model,
                        critique: reply.content,
                        parsed_ranking,
                        metrics: Some(reply.metrics),
                        reasoning_details: reply.reasoning_details,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %input.conversation_id,
                        model,
                        error = %e,
                        "evaluator failed, excluded from stage 2"
                    );
                }
            }
        }
    }

    let label_to_model = label_mapping(&stage1_results);
    let parsed: Vec<Vec<String>> = stage2_results
        .iter()
        .map(|r| r.parsed_ranking.clone())
        .collect();
    let rankings = aggregate_rankings(&parsed, &label_to_model);
    let metadata = CouncilMetadata {
        label_to_model: label_to_model.clone(),
        aggregate_rankings: rankings.clone(),
        web_search_used,
        web_search_error,
    };

    tracing::info!(
        conversation_id = %input.conversation_id,
        rankings = stage2_results.len(),
        duration_ms = stage2_start.elapsed().as_millis() as u64,
        "stage 2 complete"
    );
    sink.emit(StreamEvent::Stage2Complete {
        data: stage2_results.clone(),
        metadata: metadata.clone(),
    })
    .await?;
    ctx.pending.update_progress(
        &input.conversation_id,
        PartialData {
            stage1: Some(stage1_results.clone()),
            stage2: Some(stage2_results.clone()),
            metadata: Some(metadata),
            ..PartialData::default()
        },
        user,
    )?;

    // --- Stage 3: anonymous chairman synthesis ---
    sink.emit(StreamEvent::Stage3Start).await?;
    let stage3_start = Instant::now();
    let chairman_prompt = prompts::chairman_prompt(&input.content, &stage1_results, &stage2_results);
    let synthesis = synthesize_with_retry(
        ctx,
        &input.chairman_model,
        chairman_prompt,
        "Error: Unable to generate final synthesis.",
    )
    .await;
    tracing::info!(
        conversation_id = %input.conversation_id,
        chairman = %input.chairman_model,
        failed = synthesis.is_error(),
        duration_ms = stage3_start.elapsed().as_millis() as u64,
        "stage 3 complete"
    );
    sink.emit(StreamEvent::Stage3Complete {
        data: synthesis.clone(),
    })
    .await?;

    // --- Metrics ---
    let metrics = aggregate_council(&stage1_results, &stage2_results, &synthesis);
    sink.emit(StreamEvent::MetricsComplete {
        data: AggregateMetrics::Council(metrics.clone()),
    })
    .await?;

    // --- Title ---
    if let Some(task) = title_task {
        if let Ok(title) = task.await {
            ctx.store.update_title(&input.conversation_id, &title, user)?;
            sink.emit(StreamEvent::TitleComplete {
                data: TitleData { title },
            })
            .await?;
        }
    }

    // --- Persist and complete ---
    // An "Error:" synthesis is persisted too, so retry-synthesis can run
    // against the preserved stage data.
    let unified = council_to_unified(
        &stage1_results,
        &stage2_results,
        synthesis,
        label_to_model,
        rankings,
        Some(AggregateMetrics::Council(metrics)),
    );
    ctx.store
        .add_assistant_result(&input.conversation_id, &unified, user)?;
    ctx.pending.clear(&input.conversation_id, user)?;

    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        duration_ms = pipeline_start.elapsed().as_millis() as u64,
        "council pipeline complete"
    );
    sink.emit(StreamEvent::Complete).await?;
    Ok(())
}

fn build_combined_context(
    ctx: &PipelineCtx,
    input: &CouncilInput,
    user: Option<&str>,
    web_context: Option<&str>,
) -> Option<String> {
    let mut combined = String::new();

    if let Some(prior) = &input.prior_context {
        combined.push_str(&prompts::prior_context_preface(
            &prior.original_question,
            &prior.synthesis,
        ));
    }

    let doc_text = ctx.attachments.process(&input.attachments, user);
    combined.push_str(&attachment_context(&doc_text));

    if let Some(web) = web_context {
        combined.push_str(web);
    }

    if combined.is_empty() {
        None
    } else {
        Some(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{test_metrics, MockGateway, MockOutcome};
    use crate::pipeline::testutil::{collect_events, kinds, mock_ctx};
    use crate::pipeline::RequestContext;

    fn council_input(conversation_id: &str) -> CouncilInput {
        CouncilInput {
            conversation_id: conversation_id.into(),
            content: "What is 2+2?".into(),
            council_models: vec!["alpha/one".into(), "beta/two".into()],
            chairman_model: "chair/model".into(),
            is_first_message: true,
            use_web_search: false,
            resume: false,
            attachments: vec![],
            prior_context: None,
        }
    }

    fn wire_happy_path(mock: &MockGateway) {
        mock.push_for_model(
            "alpha/one",
            MockOutcome::reply_with_metrics("Answer from alpha", test_metrics(0.001, 100, 300)),
        );
        mock.push_for_model(
            "alpha/one",
            MockOutcome::reply("Good work.\nFINAL RANKING:\n1. Response B\n2. Response A"),
        );
        mock.push_for_model(
            "beta/two",
            MockOutcome::reply_with_metrics("Answer from beta", test_metrics(0.002, 200, 500)),
        );
        mock.push_for_model(
            "beta/two",
            MockOutcome::reply("FINAL RANKING:\n1. Response A\n2. Response B"),
        );
        mock.push_for_model("chair/model", MockOutcome::reply("It is four."));
        mock.push_for_model(crate::config::TITLE_MODEL, MockOutcome::reply("Simple Math"));
    }

    async fn run_council(ctx: &PipelineCtx, input: CouncilInput) -> Vec<StreamEvent> {
        let request = RequestContext::new(None);
        let (sink, rx) = EventSink::channel(1024);
        run(ctx, &request, input, &sink).await;
        drop(sink);
        collect_events(rx).await
    }

    /// Event kinds with the interleaved token/progress noise removed.
    fn stage_kinds(events: &[StreamEvent]) -> Vec<&'static str> {
        kinds(events)
            .into_iter()
            .filter(|k| !matches!(*k, "stage1_token" | "stage1_progress"))
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_event_order_and_persistence() {
        let mock = MockGateway::default();
        wire_happy_path(&mock);
        let (_dir, ctx) = mock_ctx(mock);
        let (council, chairman) = (
            vec!["alpha/one".to_string(), "beta/two".to_string()],
            "chair/model".to_string(),
        );
        ctx.store.create("conv-1", None, council, chairman).unwrap();

        let events = run_council(&ctx, council_input("conv-1")).await;
        assert_eq!(
            stage_kinds(&events),
            vec![
                "stage1_start",
                "stage1_model_response",
                "stage1_model_response",
                "stage1_complete",
                "stage2_start",
                "stage2_complete",
                "stage3_start",
                "stage3_complete",
                "metrics_complete",
                "title_complete",
                "complete",
            ]
        );

        let conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        assert_eq!(conversation.title, "Simple Math");
        assert_eq!(conversation.messages.len(), 2);

        let assistant = &conversation.messages[1];
        assert_eq!(assistant["mode"], "council");
        let rounds = assistant["rounds"].as_array().unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0]["round_type"], "responses");
        assert_eq!(rounds[1]["round_type"], "rankings");
        assert_eq!(assistant["synthesis"]["content"], "It is four.");

        // Pending cleared on success.
        assert!(ctx.pending.get("conv-1", None).is_none());
    }

    #[tokio::test]
    async fn test_chairman_anonymity_enforced() {
        let mock = MockGateway::default();
        wire_happy_path(&mock);
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create(
                "conv-1",
                None,
                vec!["alpha/one".into(), "beta/two".into()],
                "chair/model".into(),
            )
            .unwrap();

        run_council(&ctx, council_input("conv-1")).await;

        // The chairman saw anonymized labels only.
        let prompts_seen = mock.seen_prompts();
        let chairman_prompt = prompts_seen
            .iter()
            .find(|p| p.contains("Chairman"))
            .expect("chairman was called");
        assert!(!chairman_prompt.contains("alpha/one"));
        assert!(!chairman_prompt.contains("beta/two"));
        assert!(chairman_prompt.contains("Response A"));
        assert!(chairman_prompt.contains("Evaluator 1"));
    }

    #[tokio::test]
    async fn test_chairman_double_failure_persists_error_synthesis() {
        let mock = MockGateway::default();
        mock.push_for_model("alpha/one", MockOutcome::reply("Answer A"));
        mock.push_for_model("alpha/one", MockOutcome::reply("FINAL RANKING:\n1. Response A"));
        mock.push_for_model("chair/model", MockOutcome::status(400, "chairman down"));
        mock.push_for_model("chair/model", MockOutcome::status(400, "chairman down"));
        let (_dir, ctx) = mock_ctx(mock);
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();

        let mut input = council_input("conv-1");
        input.council_models = vec!["alpha/one".into()];
        input.is_first_message = false;
        let events = run_council(&ctx, input).await;

        let kinds = stage_kinds(&events);
        assert_eq!(
            kinds[kinds.len() - 4..],
            ["stage3_start", "stage3_complete", "metrics_complete", "complete"]
        );

        let synthesis_event = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::Stage3Complete { data } => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        assert!(synthesis_event.content.starts_with("Error:"));

        // The error synthesis is still persisted for retry-synthesis.
        let conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        assert!(conversation.messages[1]["synthesis"]["content"]
            .as_str()
            .unwrap()
            .starts_with("Error:"));
        assert!(ctx.pending.get("conv-1", None).is_none());
    }

    #[tokio::test]
    async fn test_zero_stage1_responses_short_circuits() {
        let mock = MockGateway::scripted(vec![MockOutcome::status(400, "all down")]);
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create(
                "conv-1",
                None,
                vec!["alpha/one".into(), "beta/two".into()],
                "chair/model".into(),
            )
            .unwrap();

        let events = run_council(&ctx, council_input("conv-1")).await;

        let kinds = stage_kinds(&events);
        assert_eq!(*kinds.last().unwrap(), "error");
        assert!(!kinds.contains(&"stage2_start"));
        // Two council calls; no stage 2, no chairman, no title.
        assert_eq!(mock.call_count(), 2);

        // Pending marker keeps the failure, preserving the resume path.
        let marker = ctx.pending.get("conv-1", None).unwrap();
        assert!(marker.partial_data.error.is_some());
        assert!(marker.partial_data.stage1.is_none());
    }

    #[tokio::test]
    async fn test_resume_skips_stage1_and_user_append() {
        let mock = MockGateway::default();
        mock.push_for_model("alpha/one", MockOutcome::reply("FINAL RANKING:\n1. Response A"));
        mock.push_for_model("chair/model", MockOutcome::reply("resumed synthesis"));
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create("conv-1", None, vec!["alpha/one".into()], "chair/model".into())
            .unwrap();
        ctx.store.add_user_message("conv-1", "What is 2+2?", None).unwrap();

        // A prior run left stage-1 data in the pending marker.
        ctx.pending
            .mark_pending("conv-1", DeliberationMode::Council, "What is 2+2?", None)
            .unwrap();
        ctx.pending
            .update_progress(
                "conv-1",
                PartialData::stage1(vec![MemberResponse {
                    model: "alpha/one".into(),
                    content: "cached answer".into(),
                    metrics: None,
                    reasoning_details: None,
                }]),
                None,
            )
            .unwrap();

        let mut input = council_input("conv-1");
        input.council_models = vec!["alpha/one".into()];
        input.resume = true;
        let events = run_council(&ctx, input).await;

        let kinds = stage_kinds(&events);
        assert_eq!(kinds[0], "resume_start");
        assert_eq!(kinds[1], "stage1_complete");
        assert_eq!(kinds[2], "stage2_start");
        assert!(!kinds.contains(&"stage1_start"));
        // No title on resume either.
        assert!(!kinds.contains(&"title_complete"));

        match &events[1] {
            StreamEvent::Stage1Complete { data, resumed } => {
                assert_eq!(resumed, &Some(true));
                assert_eq!(data[0].content, "cached answer");
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Only stage 2 + chairman went upstream.
        assert_eq!(mock.call_count(), 2);
        // No second user message was appended.
        let conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        assert_eq!(
            conversation
                .messages
                .iter()
                .filter(|m| m["role"] == "user")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_resume_without_marker_falls_through_to_fresh_run() {
        let mock = MockGateway::default();
        wire_happy_path(&mock);
        let (_dir, ctx) = mock_ctx(mock);
        ctx.store
            .create(
                "conv-1",
                None,
                vec!["alpha/one".into(), "beta/two".into()],
                "chair/model".into(),
            )
            .unwrap();

        let mut input = council_input("conv-1");
        input.resume = true; // no pending marker exists
        let events = run_council(&ctx, input).await;

        let kinds = stage_kinds(&events);
        assert_eq!(kinds[0], "stage1_start");
        assert!(!kinds.contains(&"resume_start"));
        // Fresh run appends the user message.
        let conversation = ctx.store.get("conv-1", None).unwrap().unwrap();
        assert_eq!(conversation.messages[0]["role"], "user");
    }

    #[tokio::test]
    async fn test_empty_council_rejected_before_any_call() {
        let mock = MockGateway::default();
        let (_dir, ctx) = mock_ctx(mock.clone());
        ctx.store
            .create("conv-1", None, vec![], "chair/model".into())
            .unwrap();

        let mut input = council_input("conv-1");
        input.council_models = vec![];
        let events = run_council(&ctx, input).await;

        assert_eq!(kinds(&events), vec!["error"]);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_rankings_in_stage2_metadata() {
        let mock = MockGateway::default();
        wire_happy_path(&mock);
        let (_dir, ctx) = mock_ctx(mock);
        ctx.store
            .create(
                "conv-1",
                None,
                vec!["alpha/one".into(), "beta/two".into()],
                "chair/model".into(),
            )
            .unwrap();

        let events = run_council(&ctx, council_input("conv-1")).await;
        let metadata = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::Stage2Complete { metadata, .. } => Some(metadata.clone()),
                _ => None,
            })
            .unwrap();

        // Both evaluators ranked; positions average to 1.5 for each model.
        assert_eq!(metadata.aggregate_rankings.len(), 2);
        for entry in &metadata.aggregate_rankings {
            assert_eq!(entry.average_rank, 1.5);
            assert_eq!(entry.rankings_count, 2);
        }
        assert_eq!(metadata.label_to_model.len(), 2);
    }
}
