//! # Model Fitting and Validation
//!
//! Fits the configured ensemble on the training partition and scores it on
//! the held-out partition. A test partition whose targets are constant makes
//! R² undefined; that is reported as `DegenerateTarget` before any tree is
//! grown, never as a metric of zero or NaN.

use crate::encode::FeatureMatrix;
use crate::ensemble::{FittedEnsemble, ModelSpec};
use crate::metrics::{Metrics, mean_absolute_error, r_squared, root_mean_squared_error};
use crate::split::{SplitError, TrainTestSplit};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Could not partition the observations: {0}")]
    Split(#[from] SplitError),
    #[error("Invalid model hyperparameters: {0}")]
    InvalidModel(String),
    #[error(
        "All {test_count} held-out targets equal {value}; R² is undefined for a zero-variance test partition."
    )]
    DegenerateTarget { test_count: usize, value: f64 },
    #[error("The feature matrix has {rows} rows but {targets} targets were supplied.")]
    ShapeMismatch { rows: usize, targets: usize },
    #[error("The split covers {split_rows} rows but the feature matrix has {rows}.")]
    SplitMismatch { split_rows: usize, rows: usize },
}

/// Splits with `(test_fraction, random_seed)`, then fits and validates.
pub fn fit(
    features: &FeatureMatrix,
    targets: ArrayView1<f64>,
    test_fraction: f64,
    random_seed: u64,
    spec: &ModelSpec,
) -> Result<(FittedEnsemble, Metrics), FitError> {
    let split = TrainTestSplit::new(features.nrows(), test_fraction, random_seed)?;
    fit_with_split(features, targets, &split, random_seed, spec)
}

/// Fits on `split.train` and computes metrics on `split.test`.
pub fn fit_with_split(
    features: &FeatureMatrix,
    targets: ArrayView1<f64>,
    split: &TrainTestSplit,
    random_seed: u64,
    spec: &ModelSpec,
) -> Result<(FittedEnsemble, Metrics), FitError> {
    spec.validate().map_err(FitError::InvalidModel)?;
    if features.nrows() != targets.len() {
        return Err(FitError::ShapeMismatch {
            rows: features.nrows(),
            targets: targets.len(),
        });
    }
    if split.rows() != features.nrows() {
        return Err(FitError::SplitMismatch {
            split_rows: split.rows(),
            rows: features.nrows(),
        });
    }

    let test_targets: Array1<f64> = split.test.iter().map(|&r| targets[r]).collect();
    let first = test_targets[0];
    if test_targets.iter().all(|&v| v == first) {
        return Err(FitError::DegenerateTarget {
            test_count: test_targets.len(),
            value: first,
        });
    }

    let model = spec.fit(
        features.values.view(),
        targets,
        &split.train,
        random_seed,
        features.columns.clone(),
    );

    let test_rows = features.select_rows(&split.test);
    let test_predictions = model.predict(test_rows.view());
    let r2 = r_squared(test_targets.view(), test_predictions.view()).ok_or(
        FitError::DegenerateTarget {
            test_count: test_targets.len(),
            value: first,
        },
    )?;

    let train_rows = features.select_rows(&split.train);
    let train_targets: Array1<f64> = split.train.iter().map(|&r| targets[r]).collect();
    let train_predictions = model.predict(train_rows.view());

    let metrics = Metrics {
        r2,
        mae: mean_absolute_error(test_targets.view(), test_predictions.view()),
        rmse: root_mean_squared_error(test_targets.view(), test_predictions.view()),
        train_count: split.train.len(),
        test_count: split.test.len(),
        train_r2: r_squared(train_targets.view(), train_predictions.view()),
    };

    log::info!(
        "Held-out fit: R² {:.4}, MAE {:.3}, RMSE {:.3} ({} train / {} test)",
        metrics.r2,
        metrics.mae,
        metrics.rmse,
        metrics.train_count,
        metrics.test_count
    );
    if let Some(train_r2) = metrics.train_r2 {
        log::debug!("In-sample R² {train_r2:.4}");
    }

    Ok((model, metrics))
}
