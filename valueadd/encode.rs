//! # Feature Encoding
//!
//! Turns observations into the fixed-width numeric matrix consumed by the
//! tree ensembles. Categorical covariates use ordinal codes: the distinct
//! levels seen in the training partition are sorted lexicographically and
//! numbered from zero. The level table is frozen at fit time and reused
//! unchanged for every later `encode` call, so a code means the same level
//! for the whole run.
//!
//! A level absent from the training partition is never coerced to an
//! existing code. Depending on `UnseenCategoryPolicy` it either fails the
//! run or maps to the covariate's unknown code, which is one past the last
//! known level.

use crate::types::{CovariateKind, CovariateSchema, CovariateValue, ObservationSet};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// What to do with a categorical level that was not present at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnseenCategoryPolicy {
    #[default]
    Fail,
    UnknownBucket,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error(
        "Category '{value}' of covariate '{covariate}' was not present in the training partition."
    )]
    UnseenCategory { covariate: String, value: String },
    #[error("Covariate '{covariate}' expects a {expected} value but received a {found} value.")]
    KindMismatch {
        covariate: String,
        expected: CovariateKind,
        found: CovariateKind,
    },
    #[error("No value was provided for covariate '{0}'.")]
    MissingCovariate(String),
    #[error("Observations were assembled for a different covariate schema than the encoder.")]
    SchemaMismatch,
}

/// Encoded covariates, one row per observation, columns in schema order.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
    /// Number of cells mapped to an unknown code.
    pub unseen: usize,
}

impl FeatureMatrix {
    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Copies the rows at `indices` into a new matrix.
    pub fn select_rows(&self, indices: &[usize]) -> Array2<f64> {
        self.values.select(ndarray::Axis(0), indices)
    }
}

/// The per-run encoding table.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureEncoder {
    schema: CovariateSchema,
    policy: UnseenCategoryPolicy,
    /// `Some(levels)` for categorical covariates, sorted; `None` for continuous ones.
    levels: Vec<Option<Vec<String>>>,
}

impl FeatureEncoder {
    /// Builds the level tables from the training observations.
    pub fn fit(training: &ObservationSet, policy: UnseenCategoryPolicy) -> Self {
        let schema = training.schema().clone();
        let levels = schema
            .iter()
            .enumerate()
            .map(|(position, covariate)| match covariate.kind {
                CovariateKind::Continuous => None,
                CovariateKind::Categorical => {
                    let distinct: BTreeSet<&str> = training
                        .iter()
                        .filter_map(|o| match &o.covariates[position] {
                            CovariateValue::Categorical(level) => Some(level.as_str()),
                            CovariateValue::Continuous(_) => None,
                        })
                        .collect();
                    Some(distinct.into_iter().map(str::to_string).collect())
                }
            })
            .collect::<Vec<Option<Vec<String>>>>();

        for (covariate, table) in schema.iter().zip(&levels) {
            if let Some(table) = table {
                log::debug!(
                    "Encoding '{}' with {} levels: {:?}",
                    covariate.name,
                    table.len(),
                    table
                );
            }
        }

        Self {
            schema,
            policy,
            levels,
        }
    }

    pub fn schema(&self) -> &CovariateSchema {
        &self.schema
    }

    pub fn policy(&self) -> UnseenCategoryPolicy {
        self.policy
    }

    /// The known levels of a categorical covariate, in code order.
    pub fn levels(&self, covariate: &str) -> Option<&[String]> {
        let position = self.schema.position(covariate)?;
        self.levels[position].as_deref()
    }

    /// The code assigned to unseen levels of a categorical covariate.
    pub fn unknown_code(&self, covariate: &str) -> Option<f64> {
        self.levels(covariate).map(|l| l.len() as f64)
    }

    /// Encodes every observation of `set` in schema column order.
    pub fn encode(&self, set: &ObservationSet) -> Result<FeatureMatrix, EncodingError> {
        if set.schema() != &self.schema {
            return Err(EncodingError::SchemaMismatch);
        }

        let width = self.schema.len();
        let mut values = Array2::zeros((set.len(), width));
        let mut unseen = 0usize;

        for (row, observation) in set.iter().enumerate() {
            for (col, value) in observation.covariates.iter().enumerate() {
                let (code, bucketed) = self.encode_value(col, value)?;
                if bucketed {
                    unseen += 1;
                }
                values[[row, col]] = code;
            }
        }

        if unseen > 0 {
            log::warn!("{unseen} categorical values were not seen during fitting and were bucketed as unknown");
        }

        Ok(FeatureMatrix {
            columns: self.schema.names().into_iter().map(str::to_string).collect(),
            values,
            unseen,
        })
    }

    /// Encodes a single covariate profile given by name, as used for what-if predictions.
    pub fn encode_profile(
        &self,
        profile: &HashMap<String, CovariateValue>,
    ) -> Result<Array1<f64>, EncodingError> {
        self.schema
            .iter()
            .enumerate()
            .map(|(col, covariate)| {
                let value = profile
                    .get(&covariate.name)
                    .ok_or_else(|| EncodingError::MissingCovariate(covariate.name.clone()))?;
                self.encode_value(col, value).map(|(code, _)| code)
            })
            .collect()
    }

    /// Returns the code for one cell and whether it landed in the unknown bucket.
    fn encode_value(&self, col: usize, value: &CovariateValue) -> Result<(f64, bool), EncodingError> {
        let covariate = self.schema.get(col).ok_or(EncodingError::SchemaMismatch)?;
        match (&self.levels[col], value) {
            (None, CovariateValue::Continuous(v)) => Ok((*v, false)),
            (Some(levels), CovariateValue::Categorical(level)) => {
                match levels.binary_search_by(|probe| probe.as_str().cmp(level.as_str())) {
                    Ok(code) => Ok((code as f64, false)),
                    Err(_) => match self.policy {
                        UnseenCategoryPolicy::Fail => Err(EncodingError::UnseenCategory {
                            covariate: covariate.name.clone(),
                            value: level.clone(),
                        }),
                        UnseenCategoryPolicy::UnknownBucket => Ok((levels.len() as f64, true)),
                    },
                }
            }
            (_, other) => Err(EncodingError::KindMismatch {
                covariate: covariate.name.clone(),
                expected: covariate.kind,
                found: other.kind(),
            }),
        }
    }
}
