// ========================================================================================
//
//                  THE HIERARCHICAL-LEVELS ADAPTER: TALLSORTS (T-ALL)
//
// ========================================================================================
//
// TALLSorts makes one decision per level, coarse to fine. Each level carries a calls
// table (`y_pred` per sample) and a raw probabilities table (one column per label at
// that level). This adapter emits one `PredictionResult` per level, in the
// classifier's order; choosing the primary level is left to the normalizer.
//
// TALLSorts is trained on unversioned Ensembl gene ids, so version suffixes are
// stripped (and the resulting duplicates summed) at load time.

use super::{PredictError, first_sample};
use crate::matrix::{self, FeatureMatrix, IdentifierPolicy, LoadOptions, Orientation};
use crate::native::{HierarchicalNative, NativeLevel, cell_label, collect_scores};
use crate::runner::RunnerError;
use crate::types::{
    AdaptedPrediction, AdaptedResults, Diagnostics, ModelFamily, PredictionResult,
};
use std::path::Path;

pub const LOAD_OPTIONS: LoadOptions = LoadOptions {
    orientation: Orientation::SamplesAsRows,
    identifiers: IdentifierPolicy::StripVersion,
};

/// The column of a level's calls table that holds the call.
pub const CALL_COLUMN: &str = "y_pred";

/// A fitted TALLSorts classifier.
pub trait HierarchicalClassifier {
    fn predict(&mut self, samples: &FeatureMatrix) -> Result<HierarchicalNative, RunnerError>;
}

/// Loads the samples and predicts.
pub fn run_tallsorts<C: HierarchicalClassifier>(
    mut classifier: C,
    input_csv: &Path,
    sample_name: &str,
) -> Result<AdaptedPrediction, PredictError> {
    let samples = matrix::load_feature_matrix(input_csv, LOAD_OPTIONS)?;
    let sample_key = first_sample(&samples)?;
    let native = classifier.predict(&samples)?;
    let results = translate(&native, sample_key)?;

    Ok(AdaptedPrediction {
        family: ModelFamily::TallSorts,
        sample_id: sample_name.to_string(),
        results: AdaptedResults::Hierarchical(results),
        diagnostics: Diagnostics {
            input_gene_count: Some(samples.n_genes()),
            ..Diagnostics::default()
        },
        warning: None,
    })
}

/// One record per level, in native order, for the sample `sample_key`.
pub fn translate(
    native: &HierarchicalNative,
    sample_key: &str,
) -> Result<Vec<PredictionResult>, PredictError> {
    if native.levels.is_empty() {
        return Err(PredictError::EmptyResult(
            "TALLSorts returned no classification levels".to_string(),
        ));
    }
    Ok(native
        .levels
        .iter()
        .map(|level| translate_level(level, sample_key))
        .collect())
}

fn translate_level(level: &NativeLevel, sample_key: &str) -> PredictionResult {
    let predicted_label = level
        .calls_df
        .as_ref()
        .and_then(|calls| calls.row_by_index(sample_key))
        .and_then(|row| row.get(CALL_COLUMN))
        .and_then(cell_label);

    let label_probabilities = level
        .probs_raw_df
        .as_ref()
        .and_then(|probs| probs.row_by_index(sample_key))
        .map(|row| collect_scores(row, |column| Some(column.to_string())))
        .unwrap_or_default();

    if predicted_label.is_none() {
        log::debug!("Level '{}' has no call for '{}'.", level.name, sample_key);
    }

    PredictionResult {
        level_name: level.name.clone(),
        predicted_label,
        label_probabilities,
    }
}
