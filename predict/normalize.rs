// ========================================================================================
//
//                              THE RESULT NORMALIZER
//
// ========================================================================================
//
// ### Purpose ###
//
// Every adapter hands over the same intermediate records. This module turns them
// into the one output schema: a deterministic ranking, a clamped top-N view, the
// primary call across hierarchical levels, and a confidence that is looked up rather
// than guessed.
//
// ### Ordering Contract ###
//
// Ranking is a stable sort, descending by probability. Labels with equal scores keep
// the order in which the classifier reported them. Scores are treated as independent
// values: nothing here assumes they sum to one.

use crate::types::{
    AdaptedPrediction, AdaptedResults, LabelScores, LevelSummary, PredictionResult, RankedLabel,
    UnifiedResult,
};
use itertools::Itertools;
use std::cmp::Ordering;
use std::io::{self, Write};

/// Labels that mean "no call". Compared case-sensitively.
pub const REJECTED_CALLS: &[&str] = &["Unclassified", "None", "NA", "nan"];

/// Descending by probability, stable on ties, non-finite entries removed.
pub fn rank(scores: &LabelScores) -> Vec<RankedLabel> {
    scores
        .finite()
        .map(|(label, probability)| RankedLabel {
            label: label.to_string(),
            probability,
        })
        .sorted_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(Ordering::Equal)
        })
        .collect()
}

/// The number of entries a caller actually gets: never fewer than one.
pub fn clamp_top_n(requested: i64) -> usize {
    requested.max(1) as usize
}

/// The first `max(1, requested)` entries of a ranked list.
pub fn top_n(ranked: &[RankedLabel], requested: i64) -> Vec<RankedLabel> {
    ranked.iter().take(clamp_top_n(requested)).cloned().collect()
}

/// The ranked probability of `label`, or `None` if the label was never scored.
pub fn resolve_confidence(ranked: &[RankedLabel], label: Option<&str>) -> Option<f64> {
    let label = label?;
    ranked
        .iter()
        .find(|entry| entry.label == label)
        .map(|entry| entry.probability)
}

/// A call counts if it is present, non-empty, and not one of the "no call" values.
pub fn is_affirmative(label: Option<&str>) -> bool {
    match label {
        Some(l) => !l.is_empty() && !REJECTED_CALLS.contains(&l),
        None => false,
    }
}

/// The index of the primary result: the last affirmative one, else the first.
///
/// Later levels are finer-grained, so an affirmative fine call overrides an
/// affirmative coarse one.
pub fn select_primary(results: &[PredictionResult]) -> Option<usize> {
    if results.is_empty() {
        return None;
    }
    let last_affirmative = results
        .iter()
        .rposition(|r| is_affirmative(r.predicted_label.as_deref()));
    Some(last_affirmative.unwrap_or(0))
}

fn summarize_level(result: &PredictionResult, requested: i64) -> LevelSummary {
    let ranked = rank(&result.label_probabilities);
    LevelSummary {
        level: result.level_name.clone(),
        prediction: result.predicted_label.clone(),
        confidence: resolve_confidence(&ranked, result.predicted_label.as_deref()),
        top_predictions: top_n(&ranked, requested),
        probabilities: result.label_probabilities.clone(),
    }
}

/// The headline fields of the unified output.
struct Headline {
    prediction: Option<String>,
    confidence: Option<f64>,
    top_predictions: Vec<RankedLabel>,
    probabilities: LabelScores,
    primary_level: Option<String>,
    levels: Option<Vec<LevelSummary>>,
}

fn headline_of(result: &PredictionResult, requested: i64) -> Headline {
    let ranked = rank(&result.label_probabilities);
    Headline {
        prediction: result.predicted_label.clone(),
        confidence: resolve_confidence(&ranked, result.predicted_label.as_deref()),
        top_predictions: top_n(&ranked, requested),
        probabilities: result.label_probabilities.clone(),
        primary_level: None,
        levels: None,
    }
}

fn normalize_flat(result: &PredictionResult, requested: i64) -> Headline {
    headline_of(result, requested)
}

fn normalize_levels(levels: &[PredictionResult], requested: i64) -> Headline {
    let summaries = levels.iter().map(|r| summarize_level(r, requested)).collect();
    match select_primary(levels).map(|i| &levels[i]) {
        Some(primary) => Headline {
            primary_level: Some(primary.level_name.clone()),
            levels: Some(summaries),
            ..headline_of(primary, requested)
        },
        None => Headline {
            prediction: None,
            confidence: None,
            top_predictions: Vec::new(),
            probabilities: LabelScores::new(),
            primary_level: None,
            levels: Some(summaries),
        },
    }
}

/// Builds the unified output for one sample.
pub fn normalize(adapted: AdaptedPrediction, requested_top_n: i64) -> UnifiedResult {
    let family = adapted.family;
    let headline = match &adapted.results {
        AdaptedResults::Flat(result) => normalize_flat(result, requested_top_n),
        AdaptedResults::Hierarchical(levels) => normalize_levels(levels, requested_top_n),
    };

    let diagnostics = adapted.diagnostics;
    UnifiedResult {
        sample_id: adapted.sample_id,
        model: family.display_name().to_string(),
        prediction: headline.prediction,
        confidence: headline.confidence,
        top_predictions: headline.top_predictions,
        probabilities: headline.probabilities,
        primary_level: headline.primary_level,
        levels: headline.levels,
        input_gene_count: diagnostics.input_gene_count,
        model_gene_count: diagnostics.model_gene_count,
        matched_gene_count: diagnostics.matched_gene_count,
        latent_dim: diagnostics.latent_dim,
        n_input_features: diagnostics.n_input_features,
        matched_nonzero_features: diagnostics.matched_nonzero_features,
        normalization: diagnostics.normalization,
        log1p_rna: diagnostics.log1p_rna,
        bridge_sample_id: diagnostics.bridge_sample_id,
        reported_probability: diagnostics.reported_probability,
        compatibility_patches: diagnostics.compatibility_patches,
        warning: adapted.warning,
        implementation: family.implementation_tag().to_string(),
    }
}

/// Writes the result as a single line of JSON.
pub fn write_json<W: Write>(result: &UnifiedResult, mut writer: W) -> io::Result<()> {
    serde_json::to_writer(&mut writer, result)?;
    writeln!(writer)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Diagnostics, ModelFamily};

    fn scores(pairs: &[(&str, f64)]) -> LabelScores {
        pairs.iter().map(|(l, p)| (*l, *p)).collect()
    }

    fn level(name: &str, label: Option<&str>, pairs: &[(&str, f64)]) -> PredictionResult {
        PredictionResult {
            level_name: name.to_string(),
            predicted_label: label.map(str::to_string),
            label_probabilities: scores(pairs),
        }
    }

    fn adapted(family: ModelFamily, results: AdaptedResults) -> AdaptedPrediction {
        AdaptedPrediction {
            family,
            sample_id: "S1".to_string(),
            results,
            diagnostics: Diagnostics::default(),
            warning: None,
        }
    }

    #[test]
    fn equal_scores_keep_encounter_order() {
        let ranked = rank(&scores(&[("A", 0.5), ("B", 0.5), ("C", 0.9)]));
        let top: Vec<String> = top_n(&ranked, 2).into_iter().map(|r| r.label).collect();
        assert_eq!(top, vec!["C", "A"]);
    }

    #[test]
    fn nan_scores_are_excluded_not_zeroed() {
        let ranked = rank(&scores(&[("A", f64::NAN), ("B", 0.0), ("C", 0.1)]));
        let labels: Vec<&str> = ranked.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["C", "B"]);
    }

    #[test]
    fn non_positive_top_n_still_returns_one_entry() {
        let ranked = rank(&scores(&[("A", 0.2), ("B", 0.3)]));
        assert_eq!(top_n(&ranked, 0).len(), 1);
        assert_eq!(top_n(&ranked, -5).len(), 1);
        assert_eq!(top_n(&ranked, -5)[0].label, "B");
        assert_eq!(top_n(&ranked, 10).len(), 2);
        assert!(top_n(&[], 3).is_empty());
    }

    #[test]
    fn confidence_is_null_when_label_is_not_scored() {
        let ranked = rank(&scores(&[("Ph", 0.7)]));
        assert_eq!(resolve_confidence(&ranked, Some("Ph")), Some(0.7));
        assert_eq!(resolve_confidence(&ranked, Some("Ph-like")), None);
        assert_eq!(resolve_confidence(&ranked, None), None);
    }

    #[test]
    fn non_affirmative_fine_level_falls_back_to_coarse() {
        let results = vec![
            level("coarse", Some("X"), &[("X", 0.8)]),
            level("fine", Some("Unclassified"), &[("Y", 0.4)]),
        ];
        let out = normalize(
            adapted(ModelFamily::TallSorts, AdaptedResults::Hierarchical(results)),
            5,
        );
        assert_eq!(out.primary_level.as_deref(), Some("coarse"));
        assert_eq!(out.prediction.as_deref(), Some("X"));
        assert_eq!(out.confidence, Some(0.8));
        assert_eq!(out.levels.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn last_affirmative_level_wins() {
        let results = vec![
            level("coarse", Some("X"), &[]),
            level("fine", Some("X.1"), &[]),
            level("finest", Some("NA"), &[]),
        ];
        assert_eq!(select_primary(&results), Some(1));
    }

    #[test]
    fn without_any_affirmative_level_the_first_is_used() {
        let results = vec![
            level("coarse", None, &[]),
            level("fine", Some(""), &[]),
            level("finest", Some("nan"), &[]),
        ];
        assert_eq!(select_primary(&results), Some(0));
        assert_eq!(select_primary(&[]), None);
    }

    #[test]
    fn rejection_is_case_sensitive() {
        assert!(!is_affirmative(Some("Unclassified")));
        assert!(is_affirmative(Some("unclassified")));
        assert!(is_affirmative(Some("NONE")));
    }

    #[test]
    fn every_family_emits_the_same_field_set() {
        let keys = |family, results| {
            let value = serde_json::to_value(normalize(adapted(family, results), 3)).unwrap();
            value
                .as_object()
                .unwrap()
                .keys()
                .cloned()
                .collect::<Vec<_>>()
        };
        let flat_result = || AdaptedResults::Flat(level("", Some("A"), &[("A", 0.9)]));
        let flat = keys(ModelFamily::AllSorts, flat_result());
        assert_eq!(
            flat,
            keys(
                ModelFamily::TallSorts,
                AdaptedResults::Hierarchical(vec![level("l0", Some("A"), &[("A", 0.9)])])
            )
        );
        assert_eq!(flat, keys(ModelFamily::Bridge, flat_result()));
        for required in [
            "sample_id",
            "model",
            "prediction",
            "confidence",
            "top_predictions",
            "probabilities",
            "warning",
            "implementation",
        ] {
            assert!(flat.iter().any(|k| k == required), "missing {required}");
        }
    }

    #[test]
    fn write_json_emits_one_line() {
        let empty = AdaptedResults::Flat(PredictionResult::flat(None, LabelScores::new()));
        let out = normalize(adapted(ModelFamily::AllSorts, empty), 3);
        let mut buffer = Vec::new();
        write_json(&out, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(parsed["prediction"].is_null());
        assert_eq!(parsed["model"], "ALLSorts (B-ALL)");
    }

    #[test]
    fn flat_results_carry_no_levels() {
        let result = level("", Some("Ph"), &[("Ph", 0.6), ("ETV6-RUNX1", 0.3)]);
        let out = normalize(adapted(ModelFamily::AllSorts, AdaptedResults::Flat(result)), 5);
        assert!(out.primary_level.is_none());
        assert!(out.levels.is_none());
        assert_eq!(out.top_predictions.len(), 2);
    }

    #[test]
    fn hierarchical_results_without_levels_have_no_headline() {
        let out = normalize(
            adapted(ModelFamily::TallSorts, AdaptedResults::Hierarchical(Vec::new())),
            5,
        );
        assert!(out.prediction.is_none());
        assert!(out.primary_level.is_none());
        assert_eq!(out.levels.map(|l| l.len()), Some(0));
    }
}
