//! Extraction and aggregation of peer rankings.
//!
//! Evaluator critiques end with a `FINAL RANKING:` block of numbered
//! `N. Response <label>` lines, but models are sloppy about format. The
//! parser degrades gracefully: structured list first, then bare label
//! mentions inside the ranking section, then label mentions anywhere.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker an evaluator is instructed to emit before its ranked list.
pub const FINAL_RANKING_MARKER: &str = "FINAL RANKING:";

static NUMBERED_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+\.\s*(Response [A-Z]+)").expect("valid regex"));

static BARE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Response [A-Z]+").expect("valid regex"));

/// One model's standing in the aggregate ranking table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRanking {
    /// Real model identifier.
    pub model: String,
    /// Mean 1-indexed position across all evaluators, rounded to 2 decimals.
    pub average_rank: f64,
    /// How many evaluators ranked this model.
    pub rankings_count: usize,
}

/// Extract an ordered list of response labels from a critique.
///
/// Precedence:
/// 1. Numbered `N. Response <label>` items after the first `FINAL RANKING:`.
/// 2. Any `Response <label>` occurrence after the marker, in document order.
/// 3. Any `Response <label>` occurrence anywhere in the text.
///
/// Repeated labels are preserved in order of appearance; the aggregation
/// step is responsible for dropping labels it does not recognize.
pub fn parse_ranking(text: &str) -> Vec<String> {
    if let Some(pos) = text.find(FINAL_RANKING_MARKER) {
        let section = &text[pos + FINAL_RANKING_MARKER.len()..];

        let numbered: Vec<String> = NUMBERED_ITEM
            .captures_iter(section)
            .map(|c| c[1].to_string())
            .collect();
        if !numbered.is_empty() {
            return numbered;
        }

        return BARE_LABEL
            .find_iter(section)
            .map(|m| m.as_str().to_string())
            .collect();
    }

    BARE_LABEL
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Compute the aggregate ranking across all evaluators.
///
/// `parsed_rankings` holds each evaluator's label order (1-indexed positions
/// are implied by list position). Labels absent from `label_to_model` are
/// silently dropped. The result is sorted ascending by mean position,
/// best first.
pub fn aggregate_rankings(
    parsed_rankings: &[Vec<String>],
    label_to_model: &BTreeMap<String, String>,
) -> Vec<AggregateRanking> {
    let mut positions: BTreeMap<&str, Vec<usize>> = BTreeMap::new();

    for ranking in parsed_rankings {
        for (index, label) in ranking.iter().enumerate() {
            if let Some(model) = label_to_model.get(label) {
                positions.entry(model.as_str()).or_default().push(index + 1);
            }
        }
    }

    let mut aggregate: Vec<AggregateRanking> = positions
        .into_iter()
        .map(|(model, positions)| {
            let mean = positions.iter().sum::<usize>() as f64 / positions.len() as f64;
            AggregateRanking {
                model: model.to_string(),
                average_rank: (mean * 100.0).round() / 100.0,
                rankings_count: positions.len(),
            }
        })
        .collect();

    aggregate.sort_by(|a, b| {
        a.average_rank
            .partial_cmp(&b.average_rank)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    aggregate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(l, m)| (l.to_string(), m.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_structured_ranking() {
        let text = "Response A is weak on X.\n\nFINAL RANKING:\n1. Response C\n2. Response B\n3. Response A\n";
        assert_eq!(
            parse_ranking(text),
            vec!["Response C", "Response B", "Response A"]
        );
    }

    #[test]
    fn test_parse_ignores_labels_before_marker() {
        let text = "Response B did well, Response A poorly.\nFINAL RANKING:\n1. Response A\n2. Response B";
        assert_eq!(parse_ranking(text), vec!["Response A", "Response B"]);
    }

    #[test]
    fn test_parse_fallback_bare_labels_in_section() {
        let text = "critique...\nFINAL RANKING:\nBest was Response B, then Response A.";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn test_parse_fallback_whole_text() {
        let text = "I prefer Response B over Response A, with Response C last.";
        assert_eq!(
            parse_ranking(text),
            vec!["Response B", "Response A", "Response C"]
        );
    }

    #[test]
    fn test_parse_no_labels() {
        assert!(parse_ranking("no ranking here at all").is_empty());
    }

    #[test]
    fn test_parse_multi_letter_labels() {
        let text = "FINAL RANKING:\n1. Response AA\n2. Response Z\n3. Response AB";
        assert_eq!(
            parse_ranking(text),
            vec!["Response AA", "Response Z", "Response AB"]
        );
    }

    #[test]
    fn test_parse_preserves_duplicates() {
        let text = "FINAL RANKING:\n1. Response A\n2. Response A\n3. Response B";
        assert_eq!(
            parse_ranking(text),
            vec!["Response A", "Response A", "Response B"]
        );
    }

    #[test]
    fn test_aggregate_basic() {
        let map = mapping(&[
            ("Response A", "alpha/one"),
            ("Response B", "beta/two"),
        ]);
        let parsed = vec![
            vec!["Response A".to_string(), "Response B".to_string()],
            vec!["Response B".to_string(), "Response A".to_string()],
            vec!["Response A".to_string(), "Response B".to_string()],
        ];

        let agg = aggregate_rankings(&parsed, &map);
        assert_eq!(agg.len(), 2);
        // alpha/one: positions 1, 2, 1 -> 1.33
        assert_eq!(agg[0].model, "alpha/one");
        assert_eq!(agg[0].average_rank, 1.33);
        assert_eq!(agg[0].rankings_count, 3);
        // beta/two: positions 2, 1, 2 -> 1.67
        assert_eq!(agg[1].model, "beta/two");
        assert_eq!(agg[1].average_rank, 1.67);
    }

    #[test]
    fn test_aggregate_drops_unknown_labels() {
        let map = mapping(&[("Response A", "alpha/one")]);
        let parsed = vec![vec![
            "Response Q".to_string(),
            "Response A".to_string(),
        ]];

        let agg = aggregate_rankings(&parsed, &map);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].model, "alpha/one");
        // Unknown label still occupied position 1; Response A was ranked 2nd.
        assert_eq!(agg[0].average_rank, 2.0);
    }

    #[test]
    fn test_aggregate_empty() {
        let map = mapping(&[("Response A", "alpha/one")]);
        assert!(aggregate_rankings(&[], &map).is_empty());
    }

    #[test]
    fn test_aggregate_sorted_best_first() {
        let map = mapping(&[
            ("Response A", "alpha/one"),
            ("Response B", "beta/two"),
            ("Response C", "gamma/three"),
        ]);
        let parsed = vec![
            vec![
                "Response C".to_string(),
                "Response A".to_string(),
                "Response B".to_string(),
            ],
            vec![
                "Response C".to_string(),
                "Response B".to_string(),
                "Response A".to_string(),
            ],
        ];

        let agg = aggregate_rankings(&parsed, &map);
        assert_eq!(agg[0].model, "gamma/three");
        assert!(agg[0].average_rank <= agg[1].average_rank);
        assert!(agg[1].average_rank <= agg[2].average_rank);
    }
}
