//! Aggregation of per-call metrics into per-turn totals.
//!
//! Latency rule: a parallel stage costs the *max* across its participants;
//! total wall time is the sum of stage maxima plus the sequential synthesis
//! call. Costs are rounded to 6 decimals for display; missing or null metric
//! fields count as zero.

use crate::deliberation::{null_to_default, MemberRanking, MemberResponse, Metrics, Round, RoundType, Synthesis};
use serde::{Deserialize, Serialize};

/// Round a currency amount to 6 decimal places.
pub fn round_cost(cost: f64) -> f64 {
    (cost * 1_000_000.0).round() / 1_000_000.0
}

/// Per-model row inside a council stage breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStageMetrics {
    pub model: String,
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Subtotals for one parallel council stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageMetrics {
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub tokens: u64,
    /// Max across the stage's participants (parallel execution).
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
    #[serde(default)]
    pub models: Vec<ModelStageMetrics>,
}

/// Subtotals for the sequential synthesis stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SynthesisStageMetrics {
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CouncilStageBreakdown {
    pub stage1: StageMetrics,
    pub stage2: StageMetrics,
    pub stage3: SynthesisStageMetrics,
}

/// Aggregated metrics for one council turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilMetrics {
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_latency_ms: u64,
    pub by_stage: CouncilStageBreakdown,
}

/// Per-participant row inside an arena round breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRoundMetrics {
    pub participant: String,
    pub model: String,
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
}

/// Subtotals for one arena round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundMetricsEntry {
    pub round_number: u32,
    pub round_type: RoundType,
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub tokens: u64,
    /// Max across the round's participants (parallel execution).
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
    #[serde(default)]
    pub participants: Vec<ParticipantRoundMetrics>,
}

/// Moderator-synthesis subtotals in an arena turn.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArenaSynthesisMetrics {
    #[serde(default)]
    pub model: String,
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
}

/// Aggregated metrics for one arena turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaMetrics {
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_latency_ms: u64,
    pub by_round: Vec<RoundMetricsEntry>,
    pub synthesis: ArenaSynthesisMetrics,
}

/// Aggregated metrics of either mode. The JSON shapes are disjoint
/// (`by_stage` vs `by_round`), so the untagged representation is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateMetrics {
    Council(CouncilMetrics),
    Arena(ArenaMetrics),
}

impl AggregateMetrics {
    pub fn total_cost(&self) -> f64 {
        match self {
            AggregateMetrics::Council(m) => m.total_cost,
            AggregateMetrics::Arena(m) => m.total_cost,
        }
    }
}

fn call_numbers(metrics: &Option<Metrics>) -> (f64, u64, u64) {
    match metrics {
        Some(m) => (m.cost, m.total_tokens, m.latency_ms),
        None => (0.0, 0, 0),
    }
}

/// Aggregate council metrics across stages 1-3.
pub fn aggregate_council(
    stage1: &[MemberResponse],
    stage2: &[MemberRanking],
    synthesis: &Synthesis,
) -> CouncilMetrics {
    let mut breakdown = CouncilStageBreakdown::default();
    let mut total_cost = 0.0;
    let mut total_tokens = 0u64;

    for result in stage1 {
        let (cost, tokens, latency) = call_numbers(&result.metrics);
        total_cost += cost;
        total_tokens += tokens;
        breakdown.stage1.cost += cost;
        breakdown.stage1.tokens += tokens;
        breakdown.stage1.latency_ms = breakdown.stage1.latency_ms.max(latency);
        breakdown.stage1.models.push(ModelStageMetrics {
            model: result.model.clone(),
            cost,
            tokens,
            latency_ms: latency,
            provider: result.metrics.as_ref().and_then(|m| m.provider.clone()),
        });
    }

    for result in stage2 {
        let (cost, tokens, latency) = call_numbers(&result.metrics);
        total_cost += cost;
        total_tokens += tokens;
        breakdown.stage2.cost += cost;
        breakdown.stage2.tokens += tokens;
        breakdown.stage2.latency_ms = breakdown.stage2.latency_ms.max(latency);
        breakdown.stage2.models.push(ModelStageMetrics {
            model: result.model.clone(),
            cost,
            tokens,
            latency_ms: latency,
            provider: result.metrics.as_ref().and_then(|m| m.provider.clone()),
        });
    }

    let (cost, tokens, latency) = call_numbers(&synthesis.metrics);
    total_cost += cost;
    total_tokens += tokens;
    breakdown.stage3 = SynthesisStageMetrics {
        cost: round_cost(cost),
        tokens,
        latency_ms: latency,
    };

    // Stages are sequential; each parallel stage contributes its max.
    let total_latency_ms = breakdown.stage1.latency_ms + breakdown.stage2.latency_ms + latency;

    breakdown.stage1.cost = round_cost(breakdown.stage1.cost);
    breakdown.stage2.cost = round_cost(breakdown.stage2.cost);

    CouncilMetrics {
        total_cost: round_cost(total_cost),
        total_tokens,
        total_latency_ms,
        by_stage: breakdown,
    }
}

/// Aggregate arena metrics across all rounds plus the moderator synthesis.
pub fn aggregate_arena(rounds: &[Round], synthesis: &Synthesis) -> ArenaMetrics {
    let mut total_cost = 0.0;
    let mut total_tokens = 0u64;
    let mut total_latency_ms = 0u64;
    let mut by_round = Vec::with_capacity(rounds.len());

    for round in rounds {
        let mut entry = RoundMetricsEntry {
            round_number: round.round_number,
            round_type: round.round_type,
            cost: 0.0,
            tokens: 0,
            latency_ms: 0,
            participants: Vec::with_capacity(round.responses.len()),
        };

        for response in &round.responses {
            let (cost, tokens, latency) = call_numbers(&response.metrics);
            entry.cost += cost;
            entry.tokens += tokens;
            entry.latency_ms = entry.latency_ms.max(latency);
            entry.participants.push(ParticipantRoundMetrics {
                participant: response.participant.clone(),
                model: response.model.clone(),
                cost,
                tokens,
                latency_ms: latency,
            });
        }

        entry.cost = round_cost(entry.cost);
        total_cost += entry.cost;
        total_tokens += entry.tokens;
        total_latency_ms += entry.latency_ms;
        by_round.push(entry);
    }

    let (synth_cost, synth_tokens, synth_latency) = call_numbers(&synthesis.metrics);
    total_cost += synth_cost;
    total_tokens += synth_tokens;
    total_latency_ms += synth_latency;

    ArenaMetrics {
        total_cost: round_cost(total_cost),
        total_tokens,
        total_latency_ms,
        by_round,
        synthesis: ArenaSynthesisMetrics {
            model: synthesis.model.clone(),
            cost: round_cost(synth_cost),
            tokens: synth_tokens,
            latency_ms: synth_latency,
        },
    }
}
