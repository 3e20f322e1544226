//! The arena pipeline: a multi-round debate among anonymized participants.
//!
//! Round 1 collects opening positions; rounds 2..N are rebuttals against the
//! accumulated transcript; a moderator synthesis closes the debate. Peers
//! only ever see `Participant X` labels; the participant-to-model mapping is
//! revealed to the moderator alone, because the moderator queries no peers.
//!
//! The extend operator appends exactly one more rebuttal round to a
//! persisted debate and re-runs the moderator; preserved rounds are never
//! re-queried or mutated.

use super::{
    handle_pipeline_failure, synthesize_with_retry, web_search_step, PipelineCtx, PriorContext,
    RequestContext,
};
use crate::attachments::{attachment_context, AttachmentMeta};
use crate::deliberation::{
    DeliberationMode, DeliberationResult, ParticipantResponse, Round, RoundType, Synthesis,
};
use crate::error::{CouncilError, Result};
use crate::events::{ArenaStartData, EventSink, RoundStartData, StreamEvent, TitleData};
use crate::fanout::{Fanout, FanoutEvent, FanoutOptions, FanoutPrompt};
use crate::gateway::ChatMessage;
use crate::labels::participant_label;
use crate::metrics::{aggregate_arena, AggregateMetrics};
use crate::pending::PartialData;
use crate::prompts;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

const SYNTHESIS_FALLBACK: &str = "Error: Unable to generate synthesis.";

/// All inputs needed by one arena run.
#[derive(Debug, Clone)]
pub struct ArenaInput {
    pub conversation_id: String,
    pub content: String,
    /// Number of debate rounds, already clamped to the supported range.
    pub round_count: u32,
    pub council_models: Vec<String>,
    pub chairman_model: String,
    pub is_first_message: bool,
    pub use_web_search: bool,
    pub attachments: Vec<AttachmentMeta>,
    pub prior_context: Option<PriorContext>,
}

/// Inputs for the extend-debate operator.
#[derive(Debug, Clone)]
pub struct ExtendInput {
    pub conversation_id: String,
    pub chairman_model: String,
}

/// Anonymous labels for the debaters, in panel order.
pub fn participant_mapping(models: &[String]) -> Vec<(String, String)> {
    models
        .iter()
        .enumerate()
        .map(|(i, model)| (participant_label(i), model.clone()))
        .collect()
}

/// Run the arena pipeline, reporting progress and errors through `sink`.
pub async fn run(ctx: &PipelineCtx, request: &RequestContext, input: ArenaInput, sink: &EventSink) {
    if let Err(e) = run_inner(ctx, request, &input, sink).await {
        handle_pipeline_failure(ctx, request, &input.conversation_id, sink, e).await;
    }
}

async fn run_inner(
    ctx: &PipelineCtx,
    request: &RequestContext,
    input: &ArenaInput,
    sink: &EventSink,
) -> Result<()> {
    let pipeline_start = Instant::now();
    let user = request.user_scope();
    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        participants = input.council_models.len(),
        rounds = input.round_count,
        "beginning arena pipeline"
    );

    if input.council_models.is_empty() {
        return Err(CouncilError::Precondition(
            "arena requires at least one participant".into(),
        ));
    }

    ctx.store
        .add_user_message(&input.conversation_id, &input.content, user)?;
    ctx.pending.mark_pending(
        &input.conversation_id,
        DeliberationMode::Arena,
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

    let title_task = if input.is_first_message {
        let title_ctx = ctx.clone();
        let content = input.content.clone();
        Some(tokio::spawn(async move {
            super::generate_title(&title_ctx, &content).await
        }))
    } else {
        None
    };

    let (web_context, _search_error) =
        web_search_step(ctx, sink, &input.content, input.use_web_search).await?;

    let mut combined_context = String::new();
    if let Some(prior) = &input.prior_context {
        combined_context.push_str(&prompts::prior_context_preface(
            &prior.original_question,
            &prior.synthesis,
        ));
    }
    combined_context.push_str(&attachment_context(
        &ctx.attachments.process(&input.attachments, user),
    ));
    if let Some(web) = &web_context {
        combined_context.push_str(web);
    }
    let opening_context = if combined_context.is_empty() {
        None
    } else {
        Some(combined_context)
    };

    let participants = participant_mapping(&input.council_models);
    let mapping: BTreeMap<String, String> = participants.iter().cloned().collect();

    sink.emit(StreamEvent::ArenaStart {
        data: ArenaStartData {
            participant_count: participants.len(),
            round_count: input.round_count,
            participants: participants.iter().map(|(label, _)| label.clone()).collect(),
        },
    })
    .await?;

    let mut rounds: Vec<Round> = Vec::with_capacity(input.round_count as usize);

    for round_number in 1..=input.round_count {
        let round_type = if round_number == 1 {
            RoundType::Opening
        } else {
            RoundType::Rebuttal
        };
        sink.emit(StreamEvent::RoundStart {
            data: RoundStartData { round_number, round_type },
        })
        .await?;

        let round_start = Instant::now();
        let transcript = prompts::format_transcript(&rounds);
        let round = run_round(
            ctx,
            input,
            &participants,
            round_number,
            input.round_count,
            round_type,
            &transcript,
            opening_context.as_deref(),
        )
        .await?;

        tracing::info!(
            conversation_id = %input.conversation_id,
            round = round_number,
            responses = round.responses.len(),
            duration_ms = round_start.elapsed().as_millis() as u64,
            "arena round complete"
        );
        sink.emit(StreamEvent::RoundComplete { data: round.clone() }).await?;

        rounds.push(round);
        ctx.pending.update_progress(
            &input.conversation_id,
            PartialData::rounds(rounds.clone()),
            user,
        )?;
    }

    // --- Moderator synthesis ---
    sink.emit(StreamEvent::SynthesisStart).await?;
    let synthesis_prompt = prompts::arena_synthesis_prompt(&input.content, &rounds, &mapping);
    let synthesis =
        synthesize_with_retry(ctx, &input.chairman_model, synthesis_prompt, SYNTHESIS_FALLBACK)
            .await;
    sink.emit(StreamEvent::SynthesisComplete {
        data: synthesis.clone(),
        participant_mapping: mapping.clone(),
    })
    .await?;

    let metrics = aggregate_arena(&rounds, &synthesis);
    sink.emit(StreamEvent::MetricsComplete {
        data: AggregateMetrics::Arena(metrics.clone()),
    })
    .await?;

    if let Some(task) = title_task {
        if let Ok(title) = task.await {
            ctx.store.update_title(&input.conversation_id, &title, user)?;
            sink.emit(StreamEvent::TitleComplete {
                data: TitleData { title },
            })
            .await?;
        }
    }

    let result = DeliberationResult {
        mode: DeliberationMode::Arena,
        rounds,
        synthesis: Some(synthesis),
        participant_mapping: mapping,
        metrics: Some(AggregateMetrics::Arena(metrics)),
    };
    ctx.store
        .add_assistant_result(&input.conversation_id, &result, user)?;
    ctx.pending.clear(&input.conversation_id, user)?;

    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        duration_ms = pipeline_start.elapsed().as_millis() as u64,
        "arena pipeline complete"
    );
    sink.emit(StreamEvent::Complete).await?;
    Ok(())
}

/// One debate round: a per-participant fan-out collected in panel order.
#[allow(clippy::too_many_arguments)]
async fn run_round(
    ctx: &PipelineCtx,
    input: &ArenaInput,
    participants: &[(String, String)],
    round_number: u32,
    total_rounds: u32,
    round_type: RoundType,
    transcript: &str,
    opening_context: Option<&str>,
) -> Result<Round> {
    let mut model_prompts = HashMap::new();
    for (label, model) in participants {
        let prompt = match round_type {
            RoundType::Opening => prompts::arena_opening_prompt(
                label,
                &input.content,
                total_rounds,
                opening_context,
            ),
            _ => prompts::arena_rebuttal_prompt(
                label,
                &input.content,
                round_number,
                total_rounds,
                transcript,
            ),
        };
        model_prompts.insert(model.clone(), vec![ChatMessage::user(prompt)]);
    }

    let models: Vec<String> = participants.iter().map(|(_, m)| m.clone()).collect();
    let fanout = Fanout::spawn(
        ctx.gateway.clone(),
        ctx.backoff.clone(),
        &models,
        FanoutPrompt::PerModel(model_prompts),
        FanoutOptions::default(),
    )?;
    let results = fanout.finish().await;

    // Collect in stable panel order; failed participants sit the round out.
    let mut responses = Vec::new();
    for (label, model) in participants {
        match results.get(model) {
            Some(Ok(reply)) => responses.push(ParticipantResponse {
                participant: label.clone(),
                model: model.clone(),
                content: reply.content.clone(),
                metrics: Some(reply.metrics.clone()),
                reasoning_details: reply.reasoning_details.clone(),
                parsed_ranking: None,
            }),
            Some(Err(e)) => {
                tracing::warn!(
                    conversation_id = %input.conversation_id,
                    participant = %label,
                    model = %model,
                    error = %e,
                    "participant failed, excluded from round"
                );
            }
            None => {}
        }
    }

    if responses.is_empty() {
        return Err(CouncilError::Other(
            "All participants failed to respond. Please try again.".into(),
        ));
    }

    Ok(Round::new(round_number, round_type, responses))
}

/// Extend a persisted arena debate by exactly one rebuttal round and a
/// fresh moderator synthesis, replacing the stored message in place.
pub async fn extend(ctx: &PipelineCtx, request: &RequestContext, input: ExtendInput, sink: &EventSink) {
    if let Err(e) = extend_inner(ctx, request, &input, sink).await {
        handle_pipeline_failure(ctx, request, &input.conversation_id, sink, e).await;
    }
}

async fn extend_inner(
    ctx: &PipelineCtx,
    request: &RequestContext,
    input: &ExtendInput,
    sink: &EventSink,
) -> Result<()> {
    let user = request.user_scope();
    let conversation = ctx
        .store
        .get(&input.conversation_id, user)?
        .ok_or_else(|| CouncilError::ConversationNotFound(input.conversation_id.clone()))?;

    let (_, assistant, user_query) = ctx
        .store
        .last_assistant_with_query(&conversation)
        .ok_or_else(|| CouncilError::Precondition("No debate found to extend".into()))?;

    if assistant.mode != DeliberationMode::Arena {
        return Err(CouncilError::Precondition(
            "Last message is not an arena debate".into(),
        ));
    }
    if assistant.rounds.is_empty() || assistant.participant_mapping.is_empty() {
        return Err(CouncilError::Precondition(
            "Stored debate has no rounds to extend".into(),
        ));
    }

    let mut rounds = assistant.rounds;
    let mapping = assistant.participant_mapping;
    let participants: Vec<(String, String)> =
        mapping.iter().map(|(l, m)| (l.clone(), m.clone())).collect();
    let round_number = rounds.len() as u32 + 1;
    tracing::info!(
        conversation_id = %input.conversation_id,
        correlation_id = %request.correlation_id,
        round = round_number,
        "extending arena debate"
    );

    sink.emit(StreamEvent::RoundStart {
        data: RoundStartData {
            round_number,
            round_type: RoundType::Rebuttal,
        },
    })
    .await?;

    let arena_input = ArenaInput {
        conversation_id: input.conversation_id.clone(),
        content: user_query,
        round_count: round_number,
        council_models: participants.iter().map(|(_, m)| m.clone()).collect(),
        chairman_model: input.chairman_model.clone(),
        is_first_message: false,
        use_web_search: false,
        attachments: vec![],
        prior_context: None,
    };
    let transcript = prompts::format_transcript(&rounds);
    let round = run_round(
        ctx,
        &arena_input,
        &participants,
        round_number,
        round_number,
        RoundType::Rebuttal,
        &transcript,
        None,
    )
    .await?;
    sink.emit(StreamEvent::RoundComplete { data: round.clone() }).await?;
    rounds.push(round);

    sink.emit(StreamEvent::SynthesisStart).await?;
    let synthesis_prompt =
        prompts::arena_synthesis_prompt(&arena_input.content, &rounds, &mapping);
    let synthesis: Synthesis =
        synthesize_with_retry(ctx, &input.chairman_model, synthesis_prompt, SYNTHESIS_FALLBACK)
            .await;
    sink.emit(StreamEvent::SynthesisComplete {
        data: synthesis.clone(),
        participant_mapping: mapping.clone(),
    })
    .await?;

    let metrics = aggregate_arena(&rounds, &synthesis);
    sink.emit(StreamEvent::MetricsComplete {
        data: AggregateMetrics::Arena(metrics.clone()),
    })
    .await?;

    let result = DeliberationResult {
        mode: DeliberationMode::Arena,
        rounds,
        synthesis: Some(synthesis),
        participant_mapping: mapping,
        metrics: Some(AggregateMetrics::Arena(metrics)),
    };
    ctx.store
        .replace_last_arena_message(&input.conversation_id, &result, user)?;

    sink.emit(StreamEvent::Complete).await?;
    Ok(())
}
