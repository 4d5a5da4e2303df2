//! Ranking Parser: pure extraction of an evaluator's ordered preference list
//! from free-form text, plus aggregation across evaluators.
//!
//! Deliberately side-effect-free — every function here is a plain
//! transformation of its inputs, tested exhaustively below on adversarial
//! text an LLM evaluator might actually produce.

use std::collections::BTreeMap;

use regex::Regex;

use crate::model::AggregateRankingEntry;

const SENTINEL: &str = "FINAL RANKING:";

fn response_label_re() -> Regex {
    Regex::new(r"Response [A-Z]").expect("static pattern")
}

fn numbered_item_re() -> Regex {
    Regex::new(r"(?m)^\s*\d+\.\s*(Response [A-Z])").expect("static pattern")
}

/// Extracts an ordered list of `"Response X"` labels from one evaluator's
/// free text. Looks for the `FINAL RANKING:` sentinel and, if present,
/// parses only the text after it; prefers a numbered-list match, falling
/// back to any bare `Response X` occurrences in text order. Without the
/// sentinel, the whole input is scanned the same way. May return an empty
/// list if nothing matches.
pub fn parse_ranking(text: &str) -> Vec<String> {
    let scope = match text.find(SENTINEL) {
        Some(idx) => &text[idx + SENTINEL.len()..],
        None => text,
    };

    let numbered: Vec<String> = numbered_item_re()
        .captures_iter(scope)
        .map(|c| c[1].to_string())
        .collect();
    if !numbered.is_empty() {
        return numbered;
    }

    response_label_re()
        .find_iter(scope)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Computes each model's average 1-based rank position across evaluators,
/// rounded to two decimals, sorted ascending (ties preserve the order
/// models first appear in `label_to_model`). Parsed labels absent from
/// `label_to_model` are silently skipped — they don't belong to any model
/// and don't error.
pub fn aggregate(
    parsed_orders: &[Vec<String>],
    label_to_model: &BTreeMap<String, String>,
) -> Vec<AggregateRankingEntry> {
    let mut positions: BTreeMap<String, (u64, u32)> = BTreeMap::new();

    for order in parsed_orders {
        for (idx, label) in order.iter().enumerate() {
            let Some(model) = label_to_model.get(label) else {
                continue;
            };
            let entry = positions.entry(model.clone()).or_insert((0, 0));
            entry.0 += (idx + 1) as u64;
            entry.1 += 1;
        }
    }

    // Preserve label_to_model's insertion-adjacent order for ties by
    // iterating models in the order they appear as values there first,
    // then stable-sorting by average position.
    let model_order: Vec<String> = label_to_model.values().cloned().collect();
    let mut entries: Vec<AggregateRankingEntry> = model_order
        .into_iter()
        .filter_map(|model| {
            positions.remove(&model).map(|(sum, count)| {
                let average = (sum as f64 / count as f64 * 100.0).round() / 100.0;
                AggregateRankingEntry { model, average_position: average, ranking_count: count }
            })
        })
        .collect();

    entries.sort_by(|a, b| a.average_position.partial_cmp(&b.average_position).unwrap());
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbered_list_after_sentinel() {
        let text = "Some reasoning.\n\nFINAL RANKING:\n1. Response B\n2. Response A\n";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn falls_back_to_bare_labels_without_numbers() {
        let text = "FINAL RANKING:\nResponse C then Response A then Response B";
        assert_eq!(
            parse_ranking(text),
            vec!["Response C", "Response A", "Response B"]
        );
    }

    #[test]
    fn scans_whole_text_without_sentinel() {
        let text = "I'd rank them Response B first, then Response A.";
        assert_eq!(parse_ranking(text), vec!["Response B", "Response A"]);
    }

    #[test]
    fn empty_when_nothing_matches() {
        assert_eq!(parse_ranking("I have no opinion."), Vec::<String>::new());
    }

    #[test]
    fn ignores_lowercase_noise() {
        let text = "FINAL RANKING:\n1. response a\n2. Response A";
        assert_eq!(parse_ranking(text), vec!["Response A"]);
    }

    #[test]
    fn duplicate_labels_are_preserved_in_order() {
        let text = "FINAL RANKING:\n1. Response A\n2. Response A";
        assert_eq!(parse_ranking(text), vec!["Response A", "Response A"]);
    }

    #[test]
    fn aggregate_computes_average_position_and_sorts_ascending() {
        let mut labels = BTreeMap::new();
        labels.insert("Response A".to_string(), "m1".to_string());
        labels.insert("Response B".to_string(), "m2".to_string());

        let orders = vec![
            vec!["Response A".to_string(), "Response B".to_string()],
            vec!["Response B".to_string(), "Response A".to_string()],
        ];

        let result = aggregate(&orders, &labels);
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|e| e.average_position == 1.5));
        assert!(result.iter().all(|e| e.ranking_count == 2));
    }

    #[test]
    fn aggregate_skips_unknown_labels() {
        let mut labels = BTreeMap::new();
        labels.insert("Response A".to_string(), "m1".to_string());

        let orders = vec![vec!["Response A".to_string(), "Response Z".to_string()]];
        let result = aggregate(&orders, &labels);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].model, "m1");
        assert_eq!(result[0].average_position, 1.0);
    }

    #[test]
    fn aggregate_empty_when_no_rankings_reference_known_labels() {
        let labels = BTreeMap::new();
        let orders = vec![vec!["Response A".to_string()]];
        assert!(aggregate(&orders, &labels).is_empty());
    }
}
