// ========================================================================================
//
//                      THE EXTERNAL-SERVICE ADAPTER: BRIDGE
//
// ========================================================================================
//
// ### Purpose ###
//
// Bridge is a multi-omic model served by a long-lived handle: it is opened with a
// set of artifacts, asked to predict from a raw RNA count file, and must be closed
// afterwards. It reads the count file itself, so the generic loader is bypassed
// for prediction. The loader's long-format aggregation is still used afterwards,
// to measure how many of Bridge's input features the upload actually covers.
//
// ### Resource Contract ###
//
// Once a handle has been opened it is owned by a `ServiceGuard`, and it is closed
// exactly once when the guard goes out of scope, whether the adapter returns a
// result or an error.

use super::PredictError;
use crate::matrix::{self, IdentifierPolicy};
use crate::native::{BridgeNative, Coerced, cell_label, coerce_number, collect_scores};
use crate::normalize::rank;
use crate::runner::RunnerError;
use crate::types::{
    AdaptedPrediction, AdaptedResults, Diagnostics, ModelFamily, PredictionResult,
};
use serde::Deserialize;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// Below this many non-zero matched features the result is flagged, not refused.
pub const LOW_OVERLAP_THRESHOLD: usize = 100;

pub const LOW_OVERLAP_WARNING: &str = "Very low Bridge RNA feature overlap. Check that uploaded genes are Ensembl IDs (ENSG...) and represent raw RNA counts.";

/// Probability columns are named `proba_<label>`.
pub const PROBABILITY_PREFIX: &str = "proba_";

const SAMPLE_ID_COLUMN: &str = "sample_id";
const LABEL_COLUMN: &str = "predicted_label";
const PROBABILITY_COLUMN: &str = "predicted_proba";

/// The artifact paths as given by the caller; any of them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeArtifacts {
    pub bundle: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
    pub classifier: Option<PathBuf>,
}

/// A complete set of artifacts: a combined bundle, or all three separate files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSet {
    Bundle(PathBuf),
    Separate {
        checkpoint: PathBuf,
        metadata: PathBuf,
        classifier: PathBuf,
    },
}

impl BridgeArtifacts {
    /// A bundle wins when present; otherwise every one of the trio is required.
    pub fn validate(&self) -> Result<ArtifactSet, PredictError> {
        if let Some(bundle) = &self.bundle {
            return Ok(ArtifactSet::Bundle(bundle.clone()));
        }
        match (&self.checkpoint, &self.metadata, &self.classifier) {
            (Some(checkpoint), Some(metadata), Some(classifier)) => Ok(ArtifactSet::Separate {
                checkpoint: checkpoint.clone(),
                metadata: metadata.clone(),
                classifier: classifier.clone(),
            }),
            _ => {
                let missing: Vec<&str> = [
                    ("--ckpt", self.checkpoint.is_none()),
                    ("--meta", self.metadata.is_none()),
                    ("--lr", self.classifier.is_none()),
                ]
                .into_iter()
                .filter_map(|(flag, absent)| absent.then_some(flag))
                .collect();
                Err(PredictError::Validation(format!(
                    "Missing Bridge artifact arguments: {} (or pass --bundle)",
                    missing.join(", ")
                )))
            }
        }
    }
}

/// Preprocessing options the service reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BridgeOptions {
    #[serde(default)]
    pub rna_normalization: Option<String>,
    #[serde(default)]
    pub log1p_rna: Option<bool>,
}

/// An open Bridge handle.
pub trait BridgeService {
    fn predict_rna(&mut self, counts: &Path) -> Result<BridgeNative, RunnerError>;

    /// The RNA feature ids the model consumes.
    fn rna_features(&self) -> &[String];

    fn options(&self) -> &BridgeOptions;

    /// Releases the handle. Called exactly once, by `ServiceGuard`.
    fn close(&mut self);
}

/// Opens Bridge handles.
pub trait BridgeConnector {
    fn connect(
        &self,
        artifacts: &ArtifactSet,
        device: &str,
    ) -> Result<Box<dyn BridgeService>, RunnerError>;
}

/// Owns an open handle and closes it on drop.
pub struct ServiceGuard {
    service: Box<dyn BridgeService>,
}

impl ServiceGuard {
    pub fn new(service: Box<dyn BridgeService>) -> Self {
        Self { service }
    }
}

impl Deref for ServiceGuard {
    type Target = dyn BridgeService;

    fn deref(&self) -> &Self::Target {
        self.service.as_ref()
    }
}

impl DerefMut for ServiceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.service.as_mut()
    }
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        log::debug!("Closing Bridge service handle.");
        self.service.close();
    }
}

/// Validates the artifacts, opens a handle, predicts, and always releases the handle.
pub fn run_bridge(
    connector: &dyn BridgeConnector,
    artifacts: &BridgeArtifacts,
    device: &str,
    input_csv: &Path,
    sample_name: &str,
) -> Result<AdaptedPrediction, PredictError> {
    let artifact_set = artifacts.validate()?;
    let mut service = ServiceGuard::new(connector.connect(&artifact_set, device)?);

    let native = service.predict_rna(input_csv)?;
    if native.predictions.is_empty() {
        return Err(PredictError::EmptyResult(
            "Bridge returned no predictions".to_string(),
        ));
    }

    let counts = matrix::load_long_counts(input_csv, IdentifierPolicy::StripVersion)?;
    let features = service.rna_features();
    let matched_nonzero = counts.count_nonzero(features.iter().map(String::as_str));
    let warning = if matched_nonzero < LOW_OVERLAP_THRESHOLD {
        log::warn!(
            "Only {} of {} Bridge RNA features are present with non-zero counts.",
            matched_nonzero,
            features.len()
        );
        Some(LOW_OVERLAP_WARNING.to_string())
    } else {
        None
    };

    let (result, mut diagnostics) = translate(&native)?;
    let options = service.options();
    diagnostics.n_input_features = Some(features.len());
    diagnostics.matched_nonzero_features = Some(matched_nonzero);
    diagnostics.normalization = Some(
        options
            .rna_normalization
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    );
    diagnostics.log1p_rna = Some(options.log1p_rna.unwrap_or(false));

    Ok(AdaptedPrediction {
        family: ModelFamily::Bridge,
        sample_id: sample_name.to_string(),
        results: AdaptedResults::Flat(result),
        diagnostics,
        warning,
    })
}

/// Reads the first prediction, its `proba_*` scores, and the latent width.
pub fn translate(native: &BridgeNative) -> Result<(PredictionResult, Diagnostics), PredictError> {
    let prediction_row = native.predictions.row(0).ok_or_else(|| {
        PredictError::EmptyResult("Bridge returned no predictions".to_string())
    })?;

    let scores = match native.probabilities.row(0) {
        Some(row) => collect_scores(row, |column| {
            if column == SAMPLE_ID_COLUMN {
                return None;
            }
            column.strip_prefix(PROBABILITY_PREFIX).map(str::to_string)
        }),
        None => Default::default(),
    };
    let top = rank(&scores).into_iter().next();

    let predicted = prediction_row
        .get(LABEL_COLUMN)
        .and_then(cell_label)
        .or_else(|| top.as_ref().map(|t| t.label.clone()));
    let reported_probability = match prediction_row.get(PROBABILITY_COLUMN).map(coerce_number) {
        Some(Coerced::Number(p)) => Some(p),
        _ => top.as_ref().map(|t| t.probability),
    };

    let latent_dim = if native.latents.is_empty() {
        0
    } else {
        native.latents.columns.len().saturating_sub(1)
    };

    let diagnostics = Diagnostics {
        latent_dim: Some(latent_dim),
        bridge_sample_id: Some(
            prediction_row
                .get(SAMPLE_ID_COLUMN)
                .and_then(cell_label)
                .unwrap_or_default(),
        ),
        reported_probability,
        ..Diagnostics::default()
    };
    Ok((PredictionResult::flat(predicted, scores), diagnostics))
}
