//! # Value-Added Pipeline
//!
//! Runs the four stages in order over one table:
//!
//! ```text
//! assemble -> split -> fit encoder on train rows -> encode all rows
//!          -> fit and validate -> score and rank all rows
//! ```
//!
//! All intermediate state lives in `run_value_added`'s frame; nothing is
//! cached between runs.

use crate::assemble::{DropReport, assemble};
use crate::config::RunConfig;
use crate::encode::{EncodingError, FeatureEncoder};
use crate::ensemble::{FeatureImportance, FittedEnsemble};
use crate::error::ValueAddedError;
use crate::fit::fit_with_split;
use crate::metrics::Metrics;
use crate::rank::{Ranking, score_and_rank};
use crate::split::TrainTestSplit;
use crate::types::CovariateValue;
use polars::prelude::DataFrame;
use std::collections::HashMap;

/// The fitted ensemble together with the encoder that produced its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedModel {
    pub encoder: FeatureEncoder,
    pub ensemble: FittedEnsemble,
}

impl FittedModel {
    /// Expected score for one covariate profile given by name.
    pub fn predict_profile(
        &self,
        profile: &HashMap<String, CovariateValue>,
    ) -> Result<f64, EncodingError> {
        let row = self.encoder.encode_profile(profile)?;
        Ok(self.ensemble.predict_row(row.view()))
    }
}

#[derive(Debug, Clone)]
pub struct ValueAddedReport {
    pub metrics: Metrics,
    pub importance: Vec<FeatureImportance>,
    pub ranking: Ranking,
    pub dropped: DropReport,
    /// Cells mapped to an unknown code under `UnseenCategoryPolicy::UnknownBucket`.
    pub unseen_categories: usize,
    pub model: FittedModel,
}

pub fn run_value_added(
    table: &DataFrame,
    config: &RunConfig,
) -> Result<ValueAddedReport, ValueAddedError> {
    config.validate()?;

    let assembled = assemble(table, &config.selection(), config.min_rows)?;
    let observations = assembled.observations;

    let split = TrainTestSplit::new(observations.len(), config.test_fraction, config.random_seed)?;
    let encoder = FeatureEncoder::fit(&observations.subset(&split.train), config.unseen_category);
    let features = encoder.encode(&observations)?;
    let targets = observations.targets();

    let (ensemble, metrics) = fit_with_split(
        &features,
        targets.view(),
        &split,
        config.random_seed,
        &config.model,
    )?;

    let importance = ensemble.feature_importance();
    if let Some(first) = importance.first() {
        log::info!(
            "Most important covariate: '{}' ({:.3})",
            first.covariate,
            first.importance
        );
    }

    let ranking = score_and_rank(&ensemble, &features, &observations, &config.ranking_options())?;

    Ok(ValueAddedReport {
        metrics,
        importance,
        ranking,
        dropped: assembled.dropped,
        unseen_categories: features.unseen,
        model: FittedModel { encoder, ensemble },
    })
}
