use serde::{Deserialize, Serialize};
use std::fmt;

/// How a covariate is interpreted by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovariateKind {
    /// Discrete labels such as socioeconomic stratum, school type or area.
    Categorical,
    /// Real-valued context such as a socioeconomic index.
    Continuous,
}

impl fmt::Display for CovariateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categorical => f.write_str("categorical"),
            Self::Continuous => f.write_str("continuous"),
        }
    }
}

/// A single named covariate in the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Covariate {
    pub name: String,
    pub kind: CovariateKind,
}

impl Covariate {
    pub fn categorical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CovariateKind::Categorical,
        }
    }

    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CovariateKind::Continuous,
        }
    }
}

/// The ordered covariate set for one run.
///
/// The order defines the column order of every feature matrix produced during
/// the run, and is therefore part of the fitted model's contract.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CovariateSchema {
    covariates: Vec<Covariate>,
}

impl CovariateSchema {
    pub fn new(covariates: Vec<Covariate>) -> Self {
        Self { covariates }
    }

    pub fn len(&self) -> usize {
        self.covariates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covariates.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Covariate> {
        self.covariates.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.covariates.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.covariates.iter().position(|c| c.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&Covariate> {
        self.covariates.get(index)
    }
}

impl<'a> IntoIterator for &'a CovariateSchema {
    type Item = &'a Covariate;
    type IntoIter = std::slice::Iter<'a, Covariate>;

    fn into_iter(self) -> Self::IntoIter {
        self.covariates.iter()
    }
}

/// A covariate value carried by an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateValue {
    Categorical(String),
    Continuous(f64),
}

impl CovariateValue {
    pub fn kind(&self) -> CovariateKind {
        match self {
            Self::Categorical(_) => CovariateKind::Categorical,
            Self::Continuous(_) => CovariateKind::Continuous,
        }
    }
}

impl fmt::Display for CovariateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categorical(level) => f.write_str(level),
            Self::Continuous(value) => write!(f, "{value}"),
        }
    }
}

/// One student, or one school-aggregate row, that passed assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub target_score: f64,
    /// Values aligned with the run's `CovariateSchema`.
    pub covariates: Vec<CovariateValue>,
    pub entity_id: String,
    pub entity_label: Option<String>,
    /// Students behind this row: 1 for a student row, the enrolment for a school row.
    pub sample_count: usize,
    /// Row position in the input table.
    pub row_index: usize,
}

/// The fit-eligible observations of a run, in input row order.
#[derive(Debug, Clone)]
pub struct ObservationSet {
    schema: CovariateSchema,
    observations: Vec<Observation>,
}

impl ObservationSet {
    pub fn new(schema: CovariateSchema, observations: Vec<Observation>) -> Self {
        Self {
            schema,
            observations,
        }
    }

    pub fn schema(&self) -> &CovariateSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.observations.iter()
    }

    pub fn targets(&self) -> ndarray::Array1<f64> {
        self.observations.iter().map(|o| o.target_score).collect()
    }

    /// Returns a new set holding only the observations at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> ObservationSet {
        let observations = indices
            .iter()
            .map(|&i| self.observations[i].clone())
            .collect();
        ObservationSet::new(self.schema.clone(), observations)
    }
}

/// Granularity at which residuals are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationLevel {
    /// One record per observation.
    Student,
    /// Observations averaged per entity id.
    #[default]
    School,
}

impl fmt::Display for AggregationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Student => f.write_str("student"),
            Self::School => f.write_str("school"),
        }
    }
}
