// ========================================================================================
//
//                     THE FLAT-PROBABILITY ADAPTER: ALLSORTS (B-ALL)
//
// ========================================================================================
//
// ALLSorts answers with two parallel tables: `predictions` (one `Prediction` column
// per sample) and `probabilities` (one column per subtype, plus the bookkeeping
// columns `Pred` and `True`). Its artifacts were fitted under an older scikit-learn,
// so the object graph is patched once, when the adapter is constructed, and before
// any prediction is requested.

use super::{PredictError, first_sample};
use crate::graph::{ObjectRef, Value};
use crate::matrix::{self, FeatureMatrix, IdentifierPolicy, LoadOptions, Orientation};
use crate::native::{FlatNative, cell_label, collect_scores};
use crate::normalize::rank;
use crate::patch::{COMPATIBILITY_PATCHES, apply_compatibility_patches, fix_names};
use crate::runner::RunnerError;
use crate::types::{
    AdaptedPrediction, AdaptedResults, Diagnostics, ModelFamily, PredictionResult,
};
use std::path::Path;

/// ALLSorts is trained on gene symbols, given as columns of a samples × genes table.
pub const LOAD_OPTIONS: LoadOptions = LoadOptions {
    orientation: Orientation::SamplesAsRows,
    identifiers: IdentifierPolicy::Verbatim,
};

/// Columns of the probabilities table that are not subtype scores.
pub const NON_PROBABILITY_COLUMNS: &[&str] = &["Pred", "True"];

/// The column of the predictions table holding the classifier's own call.
pub const PREDICTION_COLUMN: &str = "Prediction";

/// The host runs ALLSorts with `DataFrame.iteritems` restored as an alias of
/// `DataFrame.items`, which current pandas removed.
pub const DATAFRAME_ITERATION_SHIM: &str = "pandas_iteritems_alias";

/// A fitted ALLSorts classifier.
pub trait FlatClassifier {
    /// The fitted object graph. It is patched in place before prediction.
    fn artifact(&self) -> &ObjectRef;

    /// Runs the classifier's native prediction entry point.
    fn run_predictions(
        &mut self,
        samples: &FeatureMatrix,
        parents: bool,
    ) -> Result<FlatNative, RunnerError>;
}

/// A classifier whose artifact has been brought up to date.
pub struct FlatAdapter<C: FlatClassifier> {
    classifier: C,
}

impl<C: FlatClassifier> FlatAdapter<C> {
    /// Patches the classifier's artifact. This is the family's one-time setup.
    pub fn new(classifier: C) -> Self {
        let report = apply_compatibility_patches(classifier.artifact());
        if report.aliases_added == 0 {
            log::debug!("ALLSorts artifact needed no compatibility aliases.");
        }
        Self { classifier }
    }

    pub fn predict(
        &mut self,
        samples: &FeatureMatrix,
        sample_name: &str,
        parents: bool,
    ) -> Result<AdaptedPrediction, PredictError> {
        first_sample(samples)?;
        let native = self.classifier.run_predictions(samples, parents)?;
        let result = translate(&native)?;

        let model_genes = model_genes(self.classifier.artifact());
        let matched = model_genes
            .as_ref()
            .map(|genes| genes.iter().filter(|g| samples.contains_gene(g)).count());

        let mut compatibility_patches: Vec<String> = fix_names(COMPATIBILITY_PATCHES)
            .into_iter()
            .map(str::to_string)
            .collect();
        compatibility_patches.push(DATAFRAME_ITERATION_SHIM.to_string());

        Ok(AdaptedPrediction {
            family: ModelFamily::AllSorts,
            sample_id: sample_name.to_string(),
            results: AdaptedResults::Flat(result),
            diagnostics: Diagnostics {
                input_gene_count: Some(samples.n_genes()),
                model_gene_count: model_genes.as_ref().map(Vec::len),
                matched_gene_count: matched,
                compatibility_patches,
                ..Diagnostics::default()
            },
            warning: None,
        })
    }
}

/// Loads the samples, patches the model, and predicts, in that order.
pub fn run_allsorts<C: FlatClassifier>(
    classifier: C,
    input_csv: &Path,
    sample_name: &str,
    parents: bool,
) -> Result<AdaptedPrediction, PredictError> {
    let samples = matrix::load_feature_matrix(input_csv, LOAD_OPTIONS)?;
    let mut adapter = FlatAdapter::new(classifier);
    adapter.predict(&samples, sample_name, parents)
}

/// Turns the first row of each native table into one flat `PredictionResult`.
pub fn translate(native: &FlatNative) -> Result<PredictionResult, PredictError> {
    let prediction_row = native.predictions.row(0).ok_or_else(|| {
        PredictError::EmptyResult("ALLSorts returned an empty predictions table".to_string())
    })?;

    let scores = match native.probabilities.row(0) {
        Some(row) => collect_scores(row, |column| {
            (!NON_PROBABILITY_COLUMNS.contains(&column)).then(|| column.to_string())
        }),
        None => Default::default(),
    };

    let predicted = prediction_row
        .get(PREDICTION_COLUMN)
        .and_then(cell_label)
        .or_else(|| rank(&scores).into_iter().next().map(|top| top.label));

    Ok(PredictionResult::flat(predicted, scores))
}

/// `named_steps["preprocess"].genes`, if the artifact has it.
pub fn model_genes(artifact: &ObjectRef) -> Option<Vec<String>> {
    let steps = child(artifact, "named_steps")?;
    let preprocess = child(steps.as_node()?, "preprocess")?;
    let genes = child(preprocess.as_node()?, "genes")?;
    genes.as_node()?.strings().filter(|g| !g.is_empty())
}

fn child(node: &ObjectRef, key: &str) -> Option<Value> {
    node.attr(key).or_else(|| node.entry(key))
}
