//! # Residual Ranking
//!
//! Scores every assembled observation with the fitted ensemble, takes
//! `actual - predicted` as the value-added residual, and orders entities by
//! it. At school level a record averages the rows sharing an entity id,
//! weighting each row by the students it represents. Schools with too few
//! students are either flagged or excluded.
//!
//! The model is fitted on a sample but applied to the whole population, so
//! training rows are scored in-sample. `Ranking::population_scoring_note`
//! carries the wording shown to end users.

use crate::encode::FeatureMatrix;
use crate::ensemble::FittedEnsemble;
use crate::types::{AggregationLevel, ObservationSet};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

const POPULATION_SCORING_NOTE: &str = "Expected scores come from a model fitted on a training sample and applied to every observation, including the rows it was trained on. Residuals of training rows are in-sample and tend to be smaller in magnitude.";

/// Handling of aggregates whose sample size is below `min_sample_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowConfidencePolicy {
    /// Keep the record and mark it `low_confidence`.
    #[default]
    Flag,
    /// Drop the record and count it in `Ranking::excluded_low_confidence`.
    Exclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    /// Most below expectation first.
    Ascending,
    /// Most above expectation first.
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingOptions {
    pub level: AggregationLevel,
    pub min_sample_count: usize,
    pub low_confidence: LowConfidencePolicy,
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            level: AggregationLevel::School,
            min_sample_count: 10,
            low_confidence: LowConfidencePolicy::Flag,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RankError {
    #[error("Cannot rank {observations} observations with {predictions} predictions.")]
    RowMismatch {
        observations: usize,
        predictions: usize,
    },
    #[error("The feature matrix has {found} columns but the model was fitted on {expected}.")]
    ColumnMismatch { expected: usize, found: usize },
}

/// The value-added result for one student or one school.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualRecord {
    pub entity_id: String,
    pub entity_label: Option<String>,
    pub actual_score: f64,
    pub predicted_score: f64,
    /// `actual_score - predicted_score`.
    pub residual: f64,
    pub sample_count: usize,
    pub low_confidence: bool,
    /// Input row of the record's first observation.
    pub row_index: usize,
}

/// Residual records, materialized in descending residual order.
#[derive(Debug, Clone)]
pub struct Ranking {
    level: AggregationLevel,
    records: Vec<ResidualRecord>,
    excluded_low_confidence: usize,
}

impl Ranking {
    pub fn level(&self) -> AggregationLevel {
        self.level
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, largest residual first.
    pub fn records(&self) -> &[ResidualRecord] {
        &self.records
    }

    /// Records in the requested order. Ties are broken by entity id, then row index.
    pub fn ordered(&self, order: RankOrder) -> Vec<&ResidualRecord> {
        match order {
            RankOrder::Descending => self.records.iter().collect(),
            RankOrder::Ascending => {
                let mut ascending: Vec<&ResidualRecord> = self.records.iter().collect();
                ascending.sort_by(|a, b| compare(a, b, RankOrder::Ascending));
                ascending
            }
        }
    }

    /// The `n` strongest over-performers.
    pub fn top(&self, n: usize) -> Vec<&ResidualRecord> {
        self.records.iter().take(n).collect()
    }

    /// The `n` strongest under-performers, most negative first.
    pub fn bottom(&self, n: usize) -> Vec<&ResidualRecord> {
        let mut ascending = self.ordered(RankOrder::Ascending);
        ascending.truncate(n);
        ascending
    }

    /// Aggregates removed under `LowConfidencePolicy::Exclude`.
    pub fn excluded_low_confidence(&self) -> usize {
        self.excluded_low_confidence
    }

    pub fn low_confidence_count(&self) -> usize {
        self.records.iter().filter(|r| r.low_confidence).count()
    }

    pub fn population_scoring_note(&self) -> &'static str {
        POPULATION_SCORING_NOTE
    }
}

/// Predicts every row of `features` and ranks the resulting residuals.
///
/// `features` must be the encoding of `observations`, row for row.
pub fn score_and_rank(
    model: &FittedEnsemble,
    features: &FeatureMatrix,
    observations: &ObservationSet,
    options: &RankingOptions,
) -> Result<Ranking, RankError> {
    if features.ncols() != model.columns().len() {
        return Err(RankError::ColumnMismatch {
            expected: model.columns().len(),
            found: features.ncols(),
        });
    }
    if features.nrows() != observations.len() {
        return Err(RankError::RowMismatch {
            observations: observations.len(),
            predictions: features.nrows(),
        });
    }
    log::info!(
        "Scoring all {} observations with the fitted model",
        observations.len()
    );
    let predictions = model.predict(features.values.view());
    rank_predictions(observations, predictions.view(), options)
}

/// Builds the ranking from precomputed predictions aligned with `observations`.
pub fn rank_predictions(
    observations: &ObservationSet,
    predictions: ArrayView1<f64>,
    options: &RankingOptions,
) -> Result<Ranking, RankError> {
    if predictions.len() != observations.len() {
        return Err(RankError::RowMismatch {
            observations: observations.len(),
            predictions: predictions.len(),
        });
    }

    let mut records = match options.level {
        AggregationLevel::Student => internal::student_records(observations, predictions),
        AggregationLevel::School => {
            internal::school_records(observations, predictions, options.min_sample_count)
        }
    };

    let mut excluded_low_confidence = 0;
    let flagged = records.iter().filter(|r| r.low_confidence).count();
    if flagged > 0 {
        match options.low_confidence {
            LowConfidencePolicy::Flag => log::warn!(
                "{flagged} entities have fewer than {} students and are flagged as low-confidence",
                options.min_sample_count
            ),
            LowConfidencePolicy::Exclude => {
                records.retain(|r| !r.low_confidence);
                excluded_low_confidence = flagged;
                log::warn!(
                    "Excluded {flagged} entities with fewer than {} students",
                    options.min_sample_count
                );
            }
        }
    }

    records.sort_by(|a, b| compare(a, b, RankOrder::Descending));
    log::info!(
        "Ranked {} {}-level records",
        records.len(),
        options.level
    );

    Ok(Ranking {
        level: options.level,
        records,
        excluded_low_confidence,
    })
}

fn compare(a: &ResidualRecord, b: &ResidualRecord, order: RankOrder) -> Ordering {
    let by_residual = match order {
        RankOrder::Ascending => a.residual.total_cmp(&b.residual),
        RankOrder::Descending => b.residual.total_cmp(&a.residual),
    };
    by_residual
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .then_with(|| a.row_index.cmp(&b.row_index))
}

mod internal {
    use super::*;

    pub(super) fn student_records(
        observations: &ObservationSet,
        predictions: ArrayView1<f64>,
    ) -> Vec<ResidualRecord> {
        observations
            .iter()
            .zip(predictions.iter())
            .map(|(obs, &predicted)| ResidualRecord {
                entity_id: obs.entity_id.clone(),
                entity_label: obs.entity_label.clone(),
                actual_score: obs.target_score,
                predicted_score: predicted,
                residual: obs.target_score - predicted,
                sample_count: obs.sample_count,
                low_confidence: false,
                row_index: obs.row_index,
            })
            .collect()
    }

    struct Group {
        entity_id: String,
        entity_label: Option<String>,
        actual_sum: f64,
        predicted_sum: f64,
        count: usize,
        first_row: usize,
    }

    pub(super) fn school_records(
        observations: &ObservationSet,
        predictions: ArrayView1<f64>,
        min_sample_count: usize,
    ) -> Vec<ResidualRecord> {
        let mut position: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();

        for (obs, &predicted) in observations.iter().zip(predictions.iter()) {
            let slot = *position.entry(obs.entity_id.as_str()).or_insert_with(|| {
                groups.push(Group {
                    entity_id: obs.entity_id.clone(),
                    entity_label: None,
                    actual_sum: 0.0,
                    predicted_sum: 0.0,
                    count: 0,
                    first_row: obs.row_index,
                });
                groups.len() - 1
            });
            let group = &mut groups[slot];
            let weight = obs.sample_count as f64;
            group.actual_sum += weight * obs.target_score;
            group.predicted_sum += weight * predicted;
            group.count += obs.sample_count;
            if group.entity_label.is_none() {
                group.entity_label = obs
                    .entity_label
                    .as_ref()
                    .filter(|label| !label.trim().is_empty())
                    .cloned();
            }
        }

        groups
            .into_iter()
            .map(|group| {
                let n = group.count as f64;
                let actual = group.actual_sum / n;
                let predicted = group.predicted_sum / n;
                ResidualRecord {
                    entity_id: group.entity_id,
                    entity_label: group.entity_label,
                    actual_score: actual,
                    predicted_score: predicted,
                    residual: actual - predicted,
                    sample_count: group.count,
                    low_confidence: group.count < min_sample_count,
                    row_index: group.first_row,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Covariate, CovariateSchema, CovariateValue, Observation};
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn observations(rows: &[(&str, f64)]) -> ObservationSet {
        let schema = CovariateSchema::new(vec![Covariate::continuous("inse")]);
        let observations = rows
            .iter()
            .enumerate()
            .map(|(i, (school, actual))| Observation {
                target_score: *actual,
                covariates: vec![CovariateValue::Continuous(0.0)],
                entity_id: school.to_string(),
                entity_label: Some(format!("Colegio {school}")),
                sample_count: 1,
                row_index: i,
            })
            .collect();
        ObservationSet::new(schema, observations)
    }

    /// School A residuals +2, +4, -1; school B residual -5.
    fn two_schools() -> (ObservationSet, Array1<f64>) {
        let set = observations(&[("A", 52.0), ("A", 54.0), ("B", 45.0), ("A", 49.0)]);
        let predictions = Array1::from_elem(4, 50.0);
        (set, predictions)
    }

    #[test]
    fn test_school_means_and_low_confidence_flag() {
        let (set, predictions) = two_schools();
        let options = RankingOptions {
            min_sample_count: 2,
            ..RankingOptions::default()
        };
        let ranking = rank_predictions(&set, predictions.view(), &options).unwrap();

        assert_eq!(ranking.len(), 2);
        let first = &ranking.ordered(RankOrder::Descending)[0];
        assert_eq!(first.entity_id, "A");
        assert_abs_diff_eq!(first.residual, 5.0 / 3.0, epsilon = 1e-9);
        assert_eq!(first.sample_count, 3);
        assert!(!first.low_confidence);

        let last = &ranking.records()[1];
        assert_eq!(last.entity_id, "B");
        assert_abs_diff_eq!(last.residual, -5.0, epsilon = 1e-9);
        assert_eq!(last.sample_count, 1);
        assert!(last.low_confidence);
        assert_eq!(ranking.low_confidence_count(), 1);
        assert_eq!(ranking.excluded_low_confidence(), 0);
    }

    #[test]
    fn test_exclude_policy_counts_removed_entities() {
        let (set, predictions) = two_schools();
        let options = RankingOptions {
            min_sample_count: 2,
            low_confidence: LowConfidencePolicy::Exclude,
            ..RankingOptions::default()
        };
        let ranking = rank_predictions(&set, predictions.view(), &options).unwrap();
        assert_eq!(ranking.len(), 1);
        assert_eq!(ranking.records()[0].entity_id, "A");
        assert_eq!(ranking.excluded_low_confidence(), 1);
    }

    #[test]
    fn test_school_residual_equals_mean_student_residual() {
        let set = observations(&[("X", 61.5), ("Y", 40.0), ("X", 58.25), ("Y", 43.0), ("X", 70.0)]);
        let predictions = Array1::from_vec(vec![60.0, 41.0, 57.0, 44.5, 63.0]);
        let school = rank_predictions(&set, predictions.view(), &RankingOptions::default()).unwrap();
        let student = rank_predictions(
            &set,
            predictions.view(),
            &RankingOptions {
                level: AggregationLevel::Student,
                ..RankingOptions::default()
            },
        )
        .unwrap();

        for record in school.records() {
            let members: Vec<f64> = student
                .records()
                .iter()
                .filter(|r| r.entity_id == record.entity_id)
                .map(|r| r.residual)
                .collect();
            let mean = members.iter().sum::<f64>() / members.len() as f64;
            assert_abs_diff_eq!(record.residual, mean, epsilon = 1e-9);
            assert_eq!(record.sample_count, members.len());
        }
    }

    #[test]
    fn test_student_level_keeps_every_row() {
        let (set, predictions) = two_schools();
        let ranking = rank_predictions(
            &set,
            predictions.view(),
            &RankingOptions {
                level: AggregationLevel::Student,
                ..RankingOptions::default()
            },
        )
        .unwrap();
        assert_eq!(ranking.len(), 4);
        assert!(ranking.records().iter().all(|r| r.sample_count == 1 && !r.low_confidence));
        let residuals: Vec<f64> = ranking.records().iter().map(|r| r.residual).collect();
        assert_eq!(residuals, vec![4.0, 2.0, -1.0, -5.0]);
    }

    #[test]
    fn test_ties_break_by_entity_then_row() {
        let set = observations(&[("C", 50.0), ("A", 50.0), ("B", 50.0), ("A", 50.0)]);
        let predictions = Array1::from_elem(4, 50.0);
        let ranking = rank_predictions(
            &set,
            predictions.view(),
            &RankingOptions {
                level: AggregationLevel::Student,
                ..RankingOptions::default()
            },
        )
        .unwrap();
        let keys: Vec<(&str, usize)> = ranking
            .ordered(RankOrder::Ascending)
            .iter()
            .map(|r| (r.entity_id.as_str(), r.row_index))
            .collect();
        assert_eq!(keys, vec![("A", 1), ("A", 3), ("B", 2), ("C", 0)]);
        let descending: Vec<(&str, usize)> = ranking
            .records()
            .iter()
            .map(|r| (r.entity_id.as_str(), r.row_index))
            .collect();
        assert_eq!(descending, keys);
    }

    #[test]
    fn test_top_and_bottom_slices() {
        let set = observations(&[("A", 10.0), ("B", 20.0), ("C", 30.0), ("D", 40.0), ("E", 50.0)]);
        let predictions = Array1::from_elem(5, 30.0);
        let ranking =
            rank_predictions(&set, predictions.view(), &RankingOptions::default()).unwrap();
        let top: Vec<&str> = ranking.top(2).iter().map(|r| r.entity_id.as_str()).collect();
        let bottom: Vec<&str> = ranking.bottom(2).iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(top, vec!["E", "D"]);
        assert_eq!(bottom, vec!["A", "B"]);
        assert_eq!(ranking.top(99).len(), 5);
    }

    #[test]
    fn test_label_is_first_non_empty() {
        let schema = CovariateSchema::new(vec![Covariate::continuous("inse")]);
        let labels = [None, Some("  "), Some("IE San José"), Some("Otro")];
        let set = ObservationSet::new(
            schema,
            labels
                .iter()
                .enumerate()
                .map(|(i, label)| Observation {
                    target_score: 1.0,
                    covariates: vec![CovariateValue::Continuous(0.0)],
                    entity_id: "105001000001".to_string(),
                    entity_label: label.map(str::to_string),
                    sample_count: 1,
                    row_index: i,
                })
                .collect(),
        );
        let ranking = rank_predictions(
            &set,
            Array1::zeros(4).view(),
            &RankingOptions::default(),
        )
        .unwrap();
        assert_eq!(
            ranking.records()[0].entity_label.as_deref(),
            Some("IE San José")
        );
    }

    #[test]
    fn test_school_rows_weight_by_student_count() {
        let schema = CovariateSchema::new(vec![Covariate::continuous("inse")]);
        let rows = [("A", 60.0, 200), ("B", 40.0, 150), ("B", 50.0, 50), ("C", 70.0, 4)];
        let set = ObservationSet::new(
            schema,
            rows.iter()
                .enumerate()
                .map(|(i, (school, actual, students))| Observation {
                    target_score: *actual,
                    covariates: vec![CovariateValue::Continuous(0.0)],
                    entity_id: school.to_string(),
                    entity_label: None,
                    sample_count: *students,
                    row_index: i,
                })
                .collect(),
        );
        let predictions = Array1::from_vec(vec![55.0, 45.0, 45.0, 60.0]);

        let ranking =
            rank_predictions(&set, predictions.view(), &RankingOptions::default()).unwrap();
        assert_eq!(ranking.len(), 3);
        let b = ranking.records().iter().find(|r| r.entity_id == "B").unwrap();
        assert_eq!(b.sample_count, 200);
        // (150 * 40 + 50 * 50) / 200
        assert_abs_diff_eq!(b.actual_score, 42.5, epsilon = 1e-9);
        assert_abs_diff_eq!(b.residual, -2.5, epsilon = 1e-9);
        assert!(!b.low_confidence);
        let a = ranking.records().iter().find(|r| r.entity_id == "A").unwrap();
        assert_eq!(a.sample_count, 200);
        assert!(!a.low_confidence);
        assert_eq!(ranking.low_confidence_count(), 1);

        let excluded = rank_predictions(
            &set,
            predictions.view(),
            &RankingOptions {
                low_confidence: LowConfidencePolicy::Exclude,
                ..RankingOptions::default()
            },
        )
        .unwrap();
        assert_eq!(excluded.len(), 2);
        assert_eq!(excluded.excluded_low_confidence(), 1);
    }

    #[test]
    fn test_prediction_count_must_match() {
        let (set, _) = two_schools();
        let err = rank_predictions(&set, Array1::zeros(3).view(), &RankingOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            RankError::RowMismatch {
                observations: 4,
                predictions: 3
            }
        );
    }
}
