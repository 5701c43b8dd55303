//! # Regression Trees
//!
//! Exact-split CART regression trees under squared error, shared by both
//! ensemble families. A node is split on the feature and threshold with the
//! largest reduction in the sum of squared errors; rows with
//! `value <= threshold` go left.
//!
//! Each feature keeps its own ordering of the node's sample positions. When a
//! node splits, every ordering is partitioned stably into its left and right
//! halves, so a whole tree level costs `O(n * p)` after a single initial sort.
//!
//! Ties between candidate splits resolve to the lowest feature index and then
//! the lowest threshold, which keeps a fit fully determined by its inputs.

use ndarray::{ArrayView1, ArrayView2};

/// Growth limits for a single tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 5,
            min_samples_leaf: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    /// Total squared-error reduction credited to each feature.
    impurity_decrease: Vec<f64>,
}

impl RegressionTree {
    /// Fits a tree on the rows listed in `sample`. Repeated indices count with
    /// multiplicity, which is how bootstrap samples are expressed.
    pub fn fit(
        features: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        sample: &[usize],
        params: &TreeParams,
    ) -> Self {
        let n_features = features.ncols();
        let min_leaf = params.min_samples_leaf.max(1);

        if sample.is_empty() {
            return Self {
                nodes: vec![Node::Leaf { value: 0.0 }],
                impurity_decrease: vec![0.0; n_features],
            };
        }

        let mut workspace = internal::Workspace::new(features, targets, sample);
        let mut nodes = vec![Node::Leaf { value: 0.0 }];
        let mut impurity_decrease = vec![0.0; n_features];

        // (node id, start, end, depth)
        let mut pending = vec![(0usize, 0usize, sample.len(), 0usize)];
        while let Some((id, start, end, depth)) = pending.pop() {
            let stats = workspace.stats(start, end);
            let can_split = depth < params.max_depth
                && end - start >= 2 * min_leaf
                && stats.sse() > 1e-12 * stats.count;

            let split = if can_split {
                workspace.best_split(start, end, min_leaf, &stats)
            } else {
                None
            };

            match split {
                Some(split) => {
                    workspace.partition(start, end, split.feature, split.left_count);
                    let left = nodes.len();
                    let right = left + 1;
                    nodes.push(Node::Leaf { value: 0.0 });
                    nodes.push(Node::Leaf { value: 0.0 });
                    nodes[id] = Node::Split {
                        feature: split.feature,
                        threshold: split.threshold,
                        left,
                        right,
                    };
                    impurity_decrease[split.feature] += split.gain;

                    let mid = start + split.left_count;
                    pending.push((right, mid, end, depth + 1));
                    pending.push((left, start, mid, depth + 1));
                }
                None => {
                    nodes[id] = Node::Leaf {
                        value: stats.mean(),
                    };
                }
            }
        }

        log::trace!(
            "Fitted tree with {} nodes on {} samples",
            nodes.len(),
            sample.len()
        );

        Self {
            nodes,
            impurity_decrease,
        }
    }

    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut id = 0;
        loop {
            match &self.nodes[id] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    id = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match &nodes[id] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn impurity_decrease(&self) -> &[f64] {
        &self.impurity_decrease
    }

    /// Impurity-decrease importance scaled to sum to one, or all zeros for a stump.
    pub fn normalized_importance(&self) -> Vec<f64> {
        let total: f64 = self.impurity_decrease.iter().sum();
        if total > 0.0 {
            self.impurity_decrease.iter().map(|v| v / total).collect()
        } else {
            vec![0.0; self.impurity_decrease.len()]
        }
    }
}

mod internal {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    pub(super) struct NodeStats {
        pub count: f64,
        pub sum: f64,
        pub sum_sq: f64,
    }

    impl NodeStats {
        pub(super) fn mean(&self) -> f64 {
            self.sum / self.count
        }

        pub(super) fn sse(&self) -> f64 {
            (self.sum_sq - self.sum * self.sum / self.count).max(0.0)
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub(super) struct Split {
        pub feature: usize,
        pub threshold: f64,
        pub left_count: usize,
        pub gain: f64,
    }

    /// Column-major copy of the sampled rows plus one sorted ordering per feature.
    pub(super) struct Workspace {
        columns: Vec<Vec<f64>>,
        targets: Vec<f64>,
        order: Vec<Vec<usize>>,
        goes_left: Vec<bool>,
        scratch: Vec<usize>,
    }

    impl Workspace {
        pub(super) fn new(
            features: ArrayView2<f64>,
            targets: ArrayView1<f64>,
            sample: &[usize],
        ) -> Self {
            let columns: Vec<Vec<f64>> = (0..features.ncols())
                .map(|f| sample.iter().map(|&row| features[[row, f]]).collect())
                .collect();
            let targets: Vec<f64> = sample.iter().map(|&row| targets[row]).collect();

            let order = columns
                .iter()
                .map(|column| {
                    let mut positions: Vec<usize> = (0..column.len()).collect();
                    positions.sort_by(|&a, &b| column[a].total_cmp(&column[b]).then(a.cmp(&b)));
                    positions
                })
                .collect();

            Self {
                columns,
                goes_left: vec![false; targets.len()],
                scratch: Vec::with_capacity(targets.len()),
                targets,
                order,
            }
        }

        pub(super) fn stats(&self, start: usize, end: usize) -> NodeStats {
            let positions = match self.order.first() {
                Some(order) => &order[start..end],
                None => return self.stats_without_features(start, end),
            };
            let mut stats = NodeStats {
                count: positions.len() as f64,
                sum: 0.0,
                sum_sq: 0.0,
            };
            for &pos in positions {
                let y = self.targets[pos];
                stats.sum += y;
                stats.sum_sq += y * y;
            }
            stats
        }

        fn stats_without_features(&self, start: usize, end: usize) -> NodeStats {
            let slice = &self.targets[start..end];
            NodeStats {
                count: slice.len() as f64,
                sum: slice.iter().sum(),
                sum_sq: slice.iter().map(|y| y * y).sum(),
            }
        }

        pub(super) fn best_split(
            &self,
            start: usize,
            end: usize,
            min_leaf: usize,
            parent: &NodeStats,
        ) -> Option<Split> {
            let n = end - start;
            let parent_score = parent.sum * parent.sum / parent.count;
            let mut best: Option<Split> = None;

            for (feature, order) in self.order.iter().enumerate() {
                let positions = &order[start..end];
                let column = &self.columns[feature];
                let mut left_sum = 0.0;

                for i in 0..n - 1 {
                    left_sum += self.targets[positions[i]];
                    let left_count = i + 1;
                    let here = column[positions[i]];
                    let next = column[positions[i + 1]];
                    if here == next || left_count < min_leaf || n - left_count < min_leaf {
                        continue;
                    }

                    let right_sum = parent.sum - left_sum;
                    let score = left_sum * left_sum / left_count as f64
                        + right_sum * right_sum / (n - left_count) as f64;
                    let gain = score - parent_score;

                    let improves = match &best {
                        Some(current) => gain > current.gain,
                        None => gain > 0.0,
                    };
                    if improves {
                        let mut threshold = here + (next - here) / 2.0;
                        if threshold >= next {
                            threshold = here;
                        }
                        best = Some(Split {
                            feature,
                            threshold,
                            left_count,
                            gain,
                        });
                    }
                }
            }

            best.filter(|split| split.gain > 1e-12 * parent.sse().max(1.0))
        }

        /// Reorders every feature's node segment so the first `left_count`
        /// positions are those sent left by the chosen split.
        pub(super) fn partition(&mut self, start: usize, end: usize, feature: usize, left_count: usize) {
            for (i, &pos) in self.order[feature][start..end].iter().enumerate() {
                self.goes_left[pos] = i < left_count;
            }

            for order in self.order.iter_mut() {
                let segment = &mut order[start..end];
                self.scratch.clear();
                self.scratch
                    .extend(segment.iter().copied().filter(|&p| self.goes_left[p]));
                self.scratch
                    .extend(segment.iter().copied().filter(|&p| !self.goes_left[p]));
                segment.copy_from_slice(&self.scratch);
            }
        }
    }
}
