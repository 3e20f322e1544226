//! Unified deliberation data model shared by council and arena modes.
//!
//! A persisted assistant turn is a [`DeliberationResult`]: an ordered list of
//! [`Round`]s, one [`Synthesis`], the participant-label → model mapping, and
//! aggregated metrics. Conversations written by older builds used flat
//! `stage1`/`stage2`/`stage3` keys; those documents stay readable forever via
//! [`migrate_message`], which converts them lazily and in memory on read.

use crate::labels::response_label;
use crate::metrics::AggregateMetrics;
use crate::ranking::{aggregate_rankings, parse_ranking, AggregateRanking};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Deserialize helper: JSON `null` collapses to the type's default.
///
/// Upstream metric fields are occasionally `null` instead of absent; sums
/// must treat both as zero.
pub(crate) fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Deliberation mode of an assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliberationMode {
    #[default]
    Council,
    Arena,
}

impl std::fmt::Display for DeliberationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliberationMode::Council => write!(f, "council"),
            DeliberationMode::Arena => write!(f, "arena"),
        }
    }
}

/// Kind of a deliberation round.
///
/// Council turns produce `responses` then `rankings`; arena turns produce one
/// `opening` followed by `rebuttal`s. The `initial`/`deliberation` aliases
/// accept round types written by older arena builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundType {
    Responses,
    Rankings,
    #[serde(alias = "initial")]
    Opening,
    #[serde(alias = "deliberation")]
    Rebuttal,
    Closing,
}

impl std::fmt::Display for RoundType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoundType::Responses => "responses",
            RoundType::Rankings => "rankings",
            RoundType::Opening => "opening",
            RoundType::Rebuttal => "rebuttal",
            RoundType::Closing => "closing",
        };
        write!(f, "{}", s)
    }
}

/// Per-call performance metrics reported by the gateway.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, deserialize_with = "null_to_default")]
    pub prompt_tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub completion_tokens: u64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub total_tokens: u64,
    /// Cost in upstream currency units.
    #[serde(default, deserialize_with = "null_to_default")]
    pub cost: f64,
    #[serde(default, deserialize_with = "null_to_default")]
    pub latency_ms: u64,
    /// Upstream provider tag, when the gateway reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Upstream request id, for correlating against provider logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// A single participant's contribution to a round.
///
/// The `participant` field is the anonymous label peers saw (`Response A`,
/// `Participant B`); `model` is the real identifier, hidden from peers while
/// the deliberation is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantResponse {
    pub participant: String,
    pub model: String,
    #[serde(alias = "response")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
    /// Rankings rounds only: the evaluator's parsed label order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_ranking: Option<Vec<String>>,
}

/// Metadata attached to a rankings round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoundMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_to_model: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregate_rankings: Vec<AggregateRanking>,
}

/// One round of deliberation: a parallel fan-out across the panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    /// 1-indexed round number.
    pub round_number: u32,
    pub round_type: RoundType,
    pub responses: Vec<ParticipantResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RoundMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

impl Round {
    pub fn new(round_number: u32, round_type: RoundType, responses: Vec<ParticipantResponse>) -> Self {
        Self {
            round_number,
            round_type,
            responses,
            metadata: None,
            metrics: None,
        }
    }

    pub fn with_metadata(mut self, metadata: RoundMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// The chairman's (or arena moderator's) final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub model: String,
    #[serde(alias = "response")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

impl Synthesis {
    /// A failed synthesis is persisted with this content marker so the user
    /// can invoke retry-synthesis against the preserved intermediate data.
    pub fn is_error(&self) -> bool {
        self.content.starts_with("Error:")
    }
}

/// Complete result of one deliberation, council or arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliberationResult {
    pub mode: DeliberationMode,
    pub rounds: Vec<Round>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<Synthesis>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub participant_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AggregateMetrics>,
}

// --- Council stage working forms ---
//
// The council pipeline accumulates per-stage results in the same wire shape
// the events and the pending marker use; the `response`/`ranking` keys match
// documents written by older builds.

/// A council member's stage-1 answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberResponse {
    pub model: String,
    #[serde(rename = "response", alias = "content")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

/// A council member's stage-2 critique and extracted ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRanking {
    pub model: String,
    #[serde(rename = "ranking", alias = "content")]
    pub critique: String,
    #[serde(default)]
    pub parsed_ranking: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_details: Option<Value>,
}

/// Stage metadata produced after the rankings stage, persisted in the
/// pending marker and echoed in the `stage2_complete` event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CouncilMetadata {
    #[serde(default)]
    pub label_to_model: BTreeMap<String, String>,
    #[serde(default)]
    pub aggregate_rankings: Vec<AggregateRanking>,
    #[serde(default)]
    pub web_search_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_error: Option<String>,
}

/// Build the `Response <label>` → model mapping for stage-1 results in order.
pub fn label_mapping(stage1: &[MemberResponse]) -> BTreeMap<String, String> {
    stage1
        .iter()
        .enumerate()
        .map(|(i, r)| (response_label(i), r.model.clone()))
        .collect()
}

/// Convert council stage outputs into the unified result form.
pub fn council_to_unified(
    stage1: &[MemberResponse],
    stage2: &[MemberRanking],
    synthesis: Synthesis,
    label_to_model: BTreeMap<String, String>,
    rankings: Vec<AggregateRanking>,
    metrics: Option<AggregateMetrics>,
) -> DeliberationResult {
    let round1_responses = stage1
        .iter()
        .enumerate()
        .map(|(i, r)| ParticipantResponse {
            participant: response_label(i),
            model: r.model.clone(),
            content: r.content.clone(),
            metrics: r.metrics.clone(),
            reasoning_details: r.reasoning_details.clone(),
            parsed_ranking: None,
        })
        .collect();

    // Rankings round: the participant *is* the evaluator model. The label
    // only anonymizes peers inside prompts, never in the stored document.
    let round2_responses = stage2
        .iter()
        .map(|r| ParticipantResponse {
            participant: r.model.clone(),
            model: r.model.clone(),
            content: r.critique.clone(),
            metrics: r.metrics.clone(),
            reasoning_details: r.reasoning_details.clone(),
            parsed_ranking: if r.parsed_ranking.is_empty() {
                None
            } else {
                Some(r.parsed_ranking.clone())
            },
        })
        .collect();

    let rounds = vec![
        Round::new(1, RoundType::Responses, round1_responses),
        Round::new(2, RoundType::Rankings, round2_responses).with_metadata(RoundMetadata {
            label_to_model: label_to_model.clone(),
            aggregate_rankings: rankings,
        }),
    ];

    DeliberationResult {
        mode: DeliberationMode::Council,
        rounds,
        synthesis: Some(synthesis),
        participant_mapping: label_to_model,
        metrics,
    }
}

/// Migrate a stored message to the unified shape, in memory.
///
/// Non-assistant messages, unified messages (a `rounds` key is present), and
/// arena messages pass through untouched, which also makes the migration
/// idempotent. Legacy council messages (`stage1`/`stage2`/`stage3`) are
/// rebuilt into `rounds` + `synthesis`; any unrelated extra keys survive.
pub fn migrate_message(message: Value) -> Value {
    let obj = match message.as_object() {
        Some(o) => o,
        None => return message,
    };

    if obj.get("role").and_then(Value::as_str) != Some("assistant") {
        return message;
    }
    if obj.contains_key("rounds") {
        return message;
    }
    if obj.get("mode").and_then(Value::as_str) == Some("arena") {
        return message;
    }

    let stage1: Vec<MemberResponse> = match obj.get("stage1") {
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(s) => s,
            Err(_) => return message,
        },
        None => return message,
    };
    if stage1.is_empty() {
        return message;
    }

    let stage2: Vec<MemberRanking> = obj
        .get("stage2")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let synthesis: Synthesis = obj
        .get("stage3")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(Synthesis {
            model: String::new(),
            content: String::new(),
            metrics: None,
            reasoning_details: None,
        });

    let label_to_model = label_mapping(&stage1);
    let parsed: Vec<Vec<String>> = stage2
        .iter()
        .map(|r| {
            if r.parsed_ranking.is_empty() {
                parse_ranking(&r.critique)
            } else {
                r.parsed_ranking.clone()
            }
        })
        .collect();
    let rankings = aggregate_rankings(&parsed, &label_to_model);

    let metrics: Option<AggregateMetrics> = obj
        .get("metrics")
        .and_then(|v| serde_json::from_value(v.clone()).ok());

    let unified = council_to_unified(&stage1, &stage2, synthesis, label_to_model, rankings, metrics);

    let mut out = match serde_json::to_value(&unified) {
        Ok(Value::Object(map)) => map,
        _ => return message,
    };
    out.insert("role".into(), Value::String("assistant".into()));

    // Preserve unrelated fields from the legacy document.
    for (key, value) in obj {
        if !matches!(key.as_str(), "role" | "stage1" | "stage2" | "stage3" | "metrics")
            && !out.contains_key(key)
        {
            out.insert(key.clone(), value.clone());
        }
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_metrics() -> Metrics {
        Metrics {
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
            cost: 0.00123,
            latency_ms: 450,
            provider: Some("TestProvider".into()),
            request_id: Some("req-1".into()),
        }
    }

    fn sample_result() -> DeliberationResult {
        let responses = vec![ParticipantResponse {
            participant: "Response A".into(),
            model: "alpha/one".into(),
            content: "four".into(),
            metrics: Some(sample_metrics()),
            reasoning_details: None,
            parsed_ranking: None,
        }];
        let rankings = vec![ParticipantResponse {
            participant: "alpha/one".into(),
            model: "alpha/one".into(),
            content: "FINAL RANKING:\n1. Response A".into(),
            metrics: None,
            reasoning_details: None,
            parsed_ranking: Some(vec!["Response A".into()]),
        }];
        let mapping: BTreeMap<String, String> =
            [("Response A".to_string(), "alpha/one".to_string())].into();

        DeliberationResult {
            mode: DeliberationMode::Council,
            rounds: vec![
                Round::new(1, RoundType::Responses, responses),
                Round::new(2, RoundType::Rankings, rankings).with_metadata(RoundMetadata {
                    label_to_model: mapping.clone(),
                    aggregate_rankings: vec![AggregateRanking {
                        model: "alpha/one".into(),
                        average_rank: 1.0,
                        rankings_count: 1,
                    }],
                }),
            ],
            synthesis: Some(Synthesis {
                model: "chair/model".into(),
                content: "the answer".into(),
                metrics: Some(sample_metrics()),
                reasoning_details: None,
            }),
            participant_mapping: mapping,
            metrics: None,
        }
    }

    #[test]
    fn test_round_trip_identity() {
        let result = sample_result();
        let value = serde_json::to_value(&result).unwrap();
        let back: DeliberationResult = serde_json::from_value(value).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn test_round_trip_round_and_synthesis() {
        let result = sample_result();
        for round in &result.rounds {
            let value = serde_json::to_value(round).unwrap();
            let back: Round = serde_json::from_value(value).unwrap();
            assert_eq!(round, &back);
        }
        let synthesis = result.synthesis.unwrap();
        let value = serde_json::to_value(&synthesis).unwrap();
        let back: Synthesis = serde_json::from_value(value).unwrap();
        assert_eq!(synthesis, back);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let synthesis = Synthesis {
            model: "m".into(),
            content: "c".into(),
            metrics: None,
            reasoning_details: None,
        };
        let value = serde_json::to_value(&synthesis).unwrap();
        assert!(value.get("metrics").is_none());
        assert!(value.get("reasoning_details").is_none());
    }

    #[test]
    fn test_legacy_response_key_accepted() {
        let value = json!({"model": "m", "response": "legacy content"});
        let synthesis: Synthesis = serde_json::from_value(value).unwrap();
        assert_eq!(synthesis.content, "legacy content");
    }

    #[test]
    fn test_legacy_round_type_aliases() {
        let value = json!({
            "round_number": 1,
            "round_type": "initial",
            "responses": []
        });
        let round: Round = serde_json::from_value(value).unwrap();
        assert_eq!(round.round_type, RoundType::Opening);

        let value = json!({
            "round_number": 2,
            "round_type": "deliberation",
            "responses": []
        });
        let round: Round = serde_json::from_value(value).unwrap();
        assert_eq!(round.round_type, RoundType::Rebuttal);
    }

    #[test]
    fn test_null_metric_fields_coerced_to_zero() {
        let value = json!({"cost": null, "total_tokens": null, "latency_ms": 5});
        let metrics: Metrics = serde_json::from_value(value).unwrap();
        assert_eq!(metrics.cost, 0.0);
        assert_eq!(metrics.total_tokens, 0);
        assert_eq!(metrics.latency_ms, 5);
    }

    fn legacy_message() -> Value {
        json!({
            "role": "assistant",
            "stage1": [
                {"model": "alpha/one", "response": "answer one", "metrics": {"cost": 0.001, "total_tokens": 10, "latency_ms": 100}},
                {"model": "beta/two", "response": "answer two"}
            ],
            "stage2": [
                {"model": "alpha/one", "ranking": "FINAL RANKING:\n1. Response B\n2. Response A"},
                {"model": "beta/two", "ranking": "FINAL RANKING:\n1. Response A\n2. Response B"}
            ],
            "stage3": {"model": "chair/model", "response": "final"},
            "custom_field": "kept"
        })
    }

    #[test]
    fn test_migrate_legacy_council_message() {
        let migrated = migrate_message(legacy_message());

        assert_eq!(migrated["role"], "assistant");
        assert_eq!(migrated["mode"], "council");
        let rounds = migrated["rounds"].as_array().unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0]["round_type"], "responses");
        assert_eq!(rounds[1]["round_type"], "rankings");
        assert_eq!(rounds[0]["responses"][0]["participant"], "Response A");
        assert_eq!(rounds[0]["responses"][0]["content"], "answer one");
        assert_eq!(migrated["synthesis"]["content"], "final");
        assert_eq!(migrated["custom_field"], "kept");

        let mapping = &rounds[1]["metadata"]["label_to_model"];
        assert_eq!(mapping["Response A"], "alpha/one");
        assert_eq!(mapping["Response B"], "beta/two");
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let once = migrate_message(legacy_message());
        let twice = migrate_message(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_migrate_leaves_user_messages_alone() {
        let msg = json!({"role": "user", "content": "hello"});
        assert_eq!(migrate_message(msg.clone()), msg);
    }

    #[test]
    fn test_migrate_leaves_arena_alone() {
        let msg = json!({"role": "assistant", "mode": "arena", "rounds": []});
        assert_eq!(migrate_message(msg.clone()), msg);
    }

    #[test]
    fn test_migrated_parses_as_unified() {
        let migrated = migrate_message(legacy_message());
        let mut obj = migrated.as_object().unwrap().clone();
        obj.remove("role");
        obj.remove("custom_field");
        let result: DeliberationResult =
            serde_json::from_value(Value::Object(obj)).unwrap();
        assert_eq!(result.mode, DeliberationMode::Council);
        assert_eq!(result.rounds.len(), 2);
        // beta/two averaged better (positions 1 and 2 vs 2 and 1 -> tie at 1.5 each,
        // sorted deterministically by rank then insertion)
        let meta = result.rounds[1].metadata.as_ref().unwrap();
        assert_eq!(meta.aggregate_rankings.len(), 2);
    }
}
