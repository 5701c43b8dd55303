//! # Tree Ensembles
//!
//! The two model families behind `FittedEnsemble`:
//!
//! - **Random forest**: bootstrap-bagged trees averaged together. Each tree's
//!   seed is drawn from the run seed before any tree is grown, so the trees can
//!   be fitted in parallel and still come out identical on every run.
//! - **Gradient boosting**: squared-loss boosting started from the training
//!   mean, each stage fitting a tree to the current residuals.
//!
//! Both expose impurity-decrease feature importance: each tree's importance is
//! normalised to sum to one, averaged over trees, and renormalised.

use crate::tree::{RegressionTree, TreeParams};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Hyperparameters of a bagged random forest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomForestParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Draw a bootstrap sample per tree. Without it every tree sees the full training set.
    pub bootstrap: bool,
}

impl Default for RandomForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_depth: 10,
            min_samples_leaf: 1,
            bootstrap: true,
        }
    }
}

/// Hyperparameters of squared-loss gradient boosting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GradientBoostingParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_leaf: usize,
}

impl Default for GradientBoostingParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 5,
            learning_rate: 0.1,
            min_samples_leaf: 1,
        }
    }
}

/// The regression family used for a run.
///
/// Large student-level tables default to the lighter boosted ensemble; the
/// deeper forest suits smaller school-aggregate tables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ModelSpec {
    GradientBoosting(GradientBoostingParams),
    RandomForest(RandomForestParams),
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self::GradientBoosting(GradientBoostingParams::default())
    }
}

impl ModelSpec {
    /// Checks hyperparameters, returning a description of the first invalid one.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::GradientBoosting(params) => {
                if params.n_estimators == 0 {
                    return Err("gradient_boosting.n_estimators must be at least 1".to_string());
                }
                if !(params.learning_rate > 0.0 && params.learning_rate <= 1.0) {
                    return Err(format!(
                        "gradient_boosting.learning_rate must lie in (0, 1], got {}",
                        params.learning_rate
                    ));
                }
                if params.min_samples_leaf == 0 {
                    return Err("gradient_boosting.min_samples_leaf must be at least 1".to_string());
                }
            }
            Self::RandomForest(params) => {
                if params.n_estimators == 0 {
                    return Err("random_forest.n_estimators must be at least 1".to_string());
                }
                if params.min_samples_leaf == 0 {
                    return Err("random_forest.min_samples_leaf must be at least 1".to_string());
                }
            }
        }
        Ok(())
    }

    pub fn family_name(&self) -> &'static str {
        match self {
            Self::GradientBoosting(_) => "gradient boosting",
            Self::RandomForest(_) => "random forest",
        }
    }

    /// Fits the ensemble on the `train` rows of `features`.
    pub fn fit(
        &self,
        features: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        train: &[usize],
        seed: u64,
        columns: Vec<String>,
    ) -> FittedEnsemble {
        log::info!(
            "Fitting {} on {} rows x {} covariates",
            self.family_name(),
            train.len(),
            features.ncols()
        );
        let (kind, trees) = match self {
            Self::RandomForest(params) => (
                EnsembleKind::Forest,
                internal::fit_forest(features, targets, train, seed, params),
            ),
            Self::GradientBoosting(params) => {
                let base = train.iter().map(|&r| targets[r]).sum::<f64>() / train.len() as f64;
                let trees = internal::fit_boosted(features, targets, train, base, params);
                (
                    EnsembleKind::Boosted {
                        base,
                        learning_rate: params.learning_rate,
                    },
                    trees,
                )
            }
        };
        FittedEnsemble {
            kind,
            columns,
            trees,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EnsembleKind {
    Forest,
    Boosted { base: f64, learning_rate: f64 },
}

/// A per-covariate importance score. Comparable by rank only.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub covariate: String,
    pub importance: f64,
}

/// An immutable fitted regression function over encoded feature rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedEnsemble {
    kind: EnsembleKind,
    columns: Vec<String>,
    trees: Vec<RegressionTree>,
}

impl FittedEnsemble {
    /// Feature names in the column order the model expects.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn trees(&self) -> &[RegressionTree] {
        &self.trees
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        match self.kind {
            EnsembleKind::Forest => {
                self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
                    / self.trees.len() as f64
            }
            EnsembleKind::Boosted {
                base,
                learning_rate,
            } => {
                base + learning_rate * self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
            }
        }
    }

    /// Predicts every row of `features`.
    pub fn predict(&self, features: ArrayView2<f64>) -> Array1<f64> {
        let predictions: Vec<f64> = (0..features.nrows())
            .into_par_iter()
            .map(|i| self.predict_row(features.row(i)))
            .collect();
        Array1::from_vec(predictions)
    }

    /// Covariates ordered by descending importance, ties by name.
    pub fn feature_importance(&self) -> Vec<FeatureImportance> {
        let width = self.columns.len();
        let mut averaged = vec![0.0; width];
        for tree in &self.trees {
            for (slot, value) in averaged.iter_mut().zip(tree.normalized_importance()) {
                *slot += value;
            }
        }
        let total: f64 = averaged.iter().sum();
        if total > 0.0 {
            averaged.iter_mut().for_each(|v| *v /= total);
        }

        let mut ranked: Vec<FeatureImportance> = self
            .columns
            .iter()
            .zip(averaged)
            .map(|(covariate, importance)| FeatureImportance {
                covariate: covariate.clone(),
                importance,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| a.covariate.cmp(&b.covariate))
        });
        ranked
    }
}

mod internal {
    use super::*;

    pub(super) fn fit_forest(
        features: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        train: &[usize],
        seed: u64,
        params: &RandomForestParams,
    ) -> Vec<RegressionTree> {
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
        };

        let mut seeder = StdRng::seed_from_u64(seed);
        let tree_seeds: Vec<u64> = (0..params.n_estimators)
            .map(|_| seeder.next_u64())
            .collect();

        let bootstrap = params.bootstrap;
        tree_seeds
            .par_iter()
            .enumerate()
            .map(|(index, &tree_seed)| {
                let sample: Vec<usize> = if bootstrap {
                    let mut rng = StdRng::seed_from_u64(tree_seed);
                    (0..train.len())
                        .map(|_| train[rng.gen_range(0..train.len())])
                        .collect()
                } else {
                    train.to_vec()
                };
                let tree = RegressionTree::fit(features, targets, &sample, &tree_params);
                log::debug!(
                    "Forest tree {} grown: {} leaves, depth {}",
                    index,
                    tree.n_leaves(),
                    tree.depth()
                );
                tree
            })
            .collect()
    }

    pub(super) fn fit_boosted(
        features: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        train: &[usize],
        base: f64,
        params: &GradientBoostingParams,
    ) -> Vec<RegressionTree> {
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
        };

        let train_rows: Array2<f64> = features.select(Axis(0), train);
        let train_targets: Array1<f64> = train.iter().map(|&r| targets[r]).collect();
        let local: Vec<usize> = (0..train.len()).collect();

        let mut fitted = Array1::from_elem(train.len(), base);
        let mut trees = Vec::with_capacity(params.n_estimators);

        for stage in 0..params.n_estimators {
            let residuals = &train_targets - &fitted;
            let tree = RegressionTree::fit(train_rows.view(), residuals.view(), &local, &tree_params);
            for (i, value) in fitted.iter_mut().enumerate() {
                *value += params.learning_rate * tree.predict_row(train_rows.row(i));
            }
            if stage % 10 == 0 || stage + 1 == params.n_estimators {
                let mse = (&train_targets - &fitted).mapv(|r| r * r).mean().unwrap_or(0.0);
                log::debug!("Boosting stage {}: train MSE {:.6}", stage + 1, mse);
            }
            trees.push(tree);
        }
        trees
    }
}
