// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;

/// The three classifier families the adaptation layer knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// ALLSorts: flat predictions table plus a parallel probabilities table.
    AllSorts,
    /// TALLSorts: one calls/probabilities pair per hierarchical level.
    TallSorts,
    /// Bridge: an external service that predicts straight from a raw count file.
    Bridge,
}

impl ModelFamily {
    /// The human-readable family name emitted in the `model` field.
    pub fn display_name(self) -> &'static str {
        match self {
            ModelFamily::AllSorts => "ALLSorts (B-ALL)",
            ModelFamily::TallSorts => "TALLSorts (T-ALL)",
            ModelFamily::Bridge => "Bridge (official package)",
        }
    }

    /// The section of the runner configuration that names this family's host command.
    pub fn config_key(self) -> &'static str {
        match self {
            ModelFamily::AllSorts => "allsorts",
            ModelFamily::TallSorts => "tallsorts",
            ModelFamily::Bridge => "bridge",
        }
    }

    /// The `implementation` tag naming the package that produced the result.
    pub fn implementation_tag(self) -> &'static str {
        match self {
            ModelFamily::AllSorts => "official_allsorts_python_package_repo",
            ModelFamily::TallSorts => "official_tallsorts_python_package_repo",
            ModelFamily::Bridge => "official_bridge_python_package",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One label and its score, as it appears in a ranked list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedLabel {
    pub label: String,
    pub probability: f64,
}

/// A label → probability map that remembers encounter order.
///
/// Values may be NaN; those entries are kept here so the record is faithful to the
/// native output, and are filtered out by the ranking code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelScores {
    entries: Vec<(String, f64)>,
}

impl LabelScores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a score. A repeated label keeps its first position and takes the latest value.
    pub fn insert(&mut self, label: impl Into<String>, probability: f64) {
        let label = label.into();
        match self.entries.iter_mut().find(|(l, _)| *l == label) {
            Some(slot) => slot.1 = probability,
            None => self.entries.push((label, probability)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(l, p)| (l.as_str(), *p))
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| *p)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries that carry a usable score, in encounter order.
    pub fn finite(&self) -> impl Iterator<Item = (&str, f64)> {
        self.iter().filter(|(_, p)| p.is_finite())
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for LabelScores {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut scores = LabelScores::new();
        for (label, probability) in iter {
            scores.insert(label, probability);
        }
        scores
    }
}

/// Serialized as a JSON object in encounter order, without the NaN entries
/// (JSON has no representation for them).
impl Serialize for LabelScores {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let finite: Vec<(&str, f64)> = self.finite().collect();
        let mut map = serializer.serialize_map(Some(finite.len()))?;
        for (label, probability) in finite {
            map.serialize_entry(label, &probability)?;
        }
        map.end()
    }
}

/// Family-specific facts gathered while adapting a native result.
///
/// Every field is optional; a family fills in what applies to it and the rest are
/// emitted as `null` so that the output schema never changes shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub input_gene_count: Option<usize>,
    pub model_gene_count: Option<usize>,
    pub matched_gene_count: Option<usize>,
    pub latent_dim: Option<usize>,
    pub n_input_features: Option<usize>,
    pub matched_nonzero_features: Option<usize>,
    pub normalization: Option<String>,
    pub log1p_rna: Option<bool>,
    pub bridge_sample_id: Option<String>,
    pub reported_probability: Option<f64>,
    pub compatibility_patches: Vec<String>,
}

/// The intermediate, family-agnostic record: one per (sample, level).
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    /// Empty for flat, non-hierarchical classifiers.
    pub level_name: String,
    pub predicted_label: Option<String>,
    pub label_probabilities: LabelScores,
}

impl PredictionResult {
    pub fn flat(predicted_label: Option<String>, label_probabilities: LabelScores) -> Self {
        Self {
            level_name: String::new(),
            predicted_label,
            label_probabilities,
        }
    }
}

/// The adapted records, by the shape of the classifier's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptedResults {
    /// One record: ALLSorts and Bridge.
    Flat(PredictionResult),
    /// One record per level, coarse to fine in native order: TALLSorts.
    Hierarchical(Vec<PredictionResult>),
}

/// Everything an adapter hands to the normalizer for one sample.
#[derive(Debug, Clone)]
pub struct AdaptedPrediction {
    pub family: ModelFamily,
    pub sample_id: String,
    pub results: AdaptedResults,
    pub diagnostics: Diagnostics,
    pub warning: Option<String>,
}

/// Per-level view emitted for hierarchical classifiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelSummary {
    pub level: String,
    pub prediction: Option<String>,
    pub confidence: Option<f64>,
    pub top_predictions: Vec<RankedLabel>,
    pub probabilities: LabelScores,
}

/// The one output schema, identical in shape for every family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedResult {
    pub sample_id: String,
    pub model: String,
    pub prediction: Option<String>,
    pub confidence: Option<f64>,
    pub top_predictions: Vec<RankedLabel>,
    pub probabilities: LabelScores,
    pub primary_level: Option<String>,
    pub levels: Option<Vec<LevelSummary>>,
    pub input_gene_count: Option<usize>,
    pub model_gene_count: Option<usize>,
    pub matched_gene_count: Option<usize>,
    pub latent_dim: Option<usize>,
    pub n_input_features: Option<usize>,
    pub matched_nonzero_features: Option<usize>,
    pub normalization: Option<String>,
    pub log1p_rna: Option<bool>,
    pub bridge_sample_id: Option<String>,
    pub reported_probability: Option<f64>,
    pub compatibility_patches: Vec<String>,
    pub warning: Option<String>,
    pub implementation: String,
}
