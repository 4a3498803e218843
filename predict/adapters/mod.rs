//! # Prediction Adapters
//!
//! One adapter per classifier family. Each one drives its classifier through a
//! trait (the classifier packages themselves are external) and translates the
//! family's native answer into `AdaptedPrediction` records for the normalizer.
//!
//! - `flat`: ALLSorts, a predictions table plus a parallel probabilities table.
//! - `hierarchical`: TALLSorts, one calls/probabilities pair per level.
//! - `bridge`: the Bridge service, which reads the raw count file itself and must
//!   be released on every path.

pub mod bridge;
pub mod flat;
pub mod hierarchical;

use crate::graph::GraphError;
use crate::matrix::{FeatureMatrix, MatrixError};
use crate::runner::RunnerError;
use thiserror::Error;

/// Everything that can stop an adapter from producing a result.
///
/// Input tables with the wrong shape are `Validation` errors; `Matrix` is left for
/// failures to read the file at all.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Empty result: {0}")]
    EmptyResult(String),
    #[error(transparent)]
    Matrix(MatrixError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl From<MatrixError> for PredictError {
    fn from(err: MatrixError) -> Self {
        match err {
            MatrixError::TooFewColumns { .. } | MatrixError::NoSamples(_) => {
                PredictError::Validation(err.to_string())
            }
            other => PredictError::Matrix(other),
        }
    }
}

/// The identifier of the sample a single-sample adapter reports on.
///
/// Matrices with more than one sample are accepted; only the first row is used.
fn first_sample(samples: &FeatureMatrix) -> Result<&str, PredictError> {
    match samples.sample_ids() {
        [] => Err(PredictError::Validation(
            "the input matrix contains no samples".to_string(),
        )),
        [only] => Ok(only),
        [first, rest @ ..] => {
            log::warn!(
                "Input matrix has {} samples; only '{}' is reported.",
                rest.len() + 1,
                first
            );
            Ok(first)
        }
    }
}
