//! # Run Configuration
//!
//! Everything a value-added run needs besides the table itself. A
//! configuration is normally read from a TOML file:
//!
//! ```toml
//! target = "punt_global"
//! entity = "cole_cod_dane_establecimiento"
//! label = "cole_nombre_establecimiento"
//! sample_count = "n_estudiantes"
//! aggregation_level = "school"
//!
//! [[covariates]]
//! name = "fami_estratovivienda"
//! kind = "categorical"
//!
//! [[covariates]]
//! name = "cole_naturaleza"
//! kind = "categorical"
//!
//! [model]
//! family = "random_forest"
//! n_estimators = 200
//! ```
//!
//! Omitted keys take their defaults; unknown keys are rejected.

use crate::assemble::ColumnSelection;
use crate::encode::UnseenCategoryPolicy;
use crate::ensemble::ModelSpec;
use crate::rank::{LowConfidencePolicy, RankingOptions};
use crate::types::{AggregationLevel, CovariateSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub target: String,
    pub covariates: CovariateSchema,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Column holding the students behind each row, for tables with one row per school.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<String>,
    #[serde(default = "defaults::min_rows")]
    pub min_rows: usize,
    #[serde(default = "defaults::test_fraction")]
    pub test_fraction: f64,
    #[serde(default = "defaults::random_seed")]
    pub random_seed: u64,
    #[serde(default)]
    pub aggregation_level: AggregationLevel,
    #[serde(default = "defaults::min_sample_count")]
    pub min_sample_count: usize,
    #[serde(default)]
    pub low_confidence: LowConfidencePolicy,
    #[serde(default)]
    pub unseen_category: UnseenCategoryPolicy,
    #[serde(default)]
    pub model: ModelSpec,
}

mod defaults {
    pub(super) fn min_rows() -> usize {
        30
    }

    pub(super) fn test_fraction() -> f64 {
        0.2
    }

    pub(super) fn random_seed() -> u64 {
        42
    }

    pub(super) fn min_sample_count() -> usize {
        10
    }
}

impl RunConfig {
    /// A configuration with every optional setting at its default.
    pub fn new(
        target: impl Into<String>,
        covariates: CovariateSchema,
        entity: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            covariates,
            entity: entity.into(),
            label: None,
            sample_count: None,
            min_rows: defaults::min_rows(),
            test_fraction: defaults::test_fraction(),
            random_seed: defaults::random_seed(),
            aggregation_level: AggregationLevel::default(),
            min_sample_count: defaults::min_sample_count(),
            low_confidence: LowConfidencePolicy::default(),
            unseen_category: UnseenCategoryPolicy::default(),
            model: ModelSpec::default(),
        }
    }

    pub fn from_toml_str(toml_string: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_string)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks every setting before any data is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.target.trim().is_empty() {
            return invalid("target column name is empty".to_string());
        }
        if self.entity.trim().is_empty() {
            return invalid("entity column name is empty".to_string());
        }
        if self
            .sample_count
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return invalid("sample_count column name is empty".to_string());
        }
        if self.covariates.is_empty() {
            return invalid("at least one covariate is required".to_string());
        }
        let mut seen = HashSet::new();
        for covariate in &self.covariates {
            if covariate.name.trim().is_empty() {
                return invalid("covariate names must not be empty".to_string());
            }
            if !seen.insert(covariate.name.as_str()) {
                return invalid(format!("covariate '{}' is listed twice", covariate.name));
            }
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return invalid(format!(
                "test_fraction must lie strictly between 0 and 1, got {}",
                self.test_fraction
            ));
        }
        if self.min_rows < 2 {
            return invalid(format!(
                "min_rows must be at least 2 so both partitions can be non-empty, got {}",
                self.min_rows
            ));
        }
        if self.min_sample_count == 0 {
            return invalid("min_sample_count must be at least 1".to_string());
        }
        self.model.validate().map_err(ConfigError::Invalid)
    }

    pub fn selection(&self) -> ColumnSelection {
        ColumnSelection {
            target: self.target.clone(),
            covariates: self.covariates.clone(),
            entity: self.entity.clone(),
            label: self.label.clone(),
            sample_count: self.sample_count.clone(),
        }
    }

    pub fn ranking_options(&self) -> RankingOptions {
        RankingOptions {
            level: self.aggregation_level,
            min_sample_count: self.min_sample_count,
            low_confidence: self.low_confidence,
        }
    }
}
