//! Value-added estimation over SABER standardized-test results.
//!
//! A run fits a tree ensemble that predicts expected scores from context
//! covariates, then ranks students or schools by `actual - expected`.
//! `run_value_added` drives the whole pipeline; the stage modules are public
//! for callers that need finer control.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod assemble;
pub mod config;
pub mod encode;
pub mod ensemble;
pub mod error;
pub mod fit;
pub mod metrics;
pub mod pipeline;
pub mod rank;
pub mod split;
pub mod tree;
pub mod types;

pub use assemble::{Assembled, AssemblyError, ColumnSelection, DropReport, assemble};
pub use config::{ConfigError, RunConfig};
pub use encode::{EncodingError, FeatureEncoder, FeatureMatrix, UnseenCategoryPolicy};
pub use ensemble::{
    FeatureImportance, FittedEnsemble, GradientBoostingParams, ModelSpec, RandomForestParams,
};
pub use error::{ErrorKind, ValueAddedError};
pub use fit::{FitError, fit, fit_with_split};
pub use metrics::Metrics;
pub use pipeline::{FittedModel, ValueAddedReport, run_value_added};
pub use rank::{
    LowConfidencePolicy, RankError, RankOrder, Ranking, RankingOptions, ResidualRecord,
    rank_predictions, score_and_rank,
};
pub use split::{SplitError, TrainTestSplit};
pub use types::{
    AggregationLevel, Covariate, CovariateKind, CovariateSchema, CovariateValue, Observation,
    ObservationSet,
};
