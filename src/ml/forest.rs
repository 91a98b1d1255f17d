//! Bagged regression trees.

use nalgebra::{DMatrix, DVector};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::models::{check_dimensions, Regressor};
use crate::error::ModelError;

pub const DEFAULT_MAX_DEPTH: usize = 5;
pub const DEFAULT_MIN_SAMPLES_LEAF: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
}

struct TreeBuilder<'a> {
    x: &'a DMatrix<f64>,
    y: &'a DVector<f64>,
    max_depth: usize,
    min_samples_leaf: usize,
    max_features: usize,
    rng: &'a mut ChaCha8Rng,
    nodes: Vec<TreeNode>,
}

impl TreeBuilder<'_> {
    fn build(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let n = samples.len();
        let mean = samples.iter().map(|&i| self.y[i]).sum::<f64>() / n as f64;
        let node = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { value: mean });

        if depth >= self.max_depth || n < 2 * self.min_samples_leaf {
            return node;
        }
        let Some((feature, threshold)) = self.best_split(&samples) else {
            return node;
        };

        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&i| self.x[(i, feature)] <= threshold);
        let left = self.build(left_samples, depth + 1);
        let right = self.build(right_samples, depth + 1);
        self.nodes[node] = TreeNode::Split {
            feature,
            threshold,
            left,
            right,
        };
        node
    }

    /// Best variance-reduction split over a random subset of features.
    fn best_split(&mut self, samples: &[usize]) -> Option<(usize, f64)> {
        let n = samples.len();
        let total: f64 = samples.iter().map(|&i| self.y[i]).sum();
        let parent_score = total * total / n as f64;
        let mut best: Option<(f64, usize, f64)> = None;

        let features = sample(self.rng, self.x.ncols(), self.max_features);
        let mut sorted: Vec<(f64, f64)> = Vec::with_capacity(n);
        for feature in features.iter() {
            sorted.clear();
            sorted.extend(samples.iter().map(|&i| (self.x[(i, feature)], self.y[i])));
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_sum = 0.0;
            for i in 1..n {
                left_sum += sorted[i - 1].1;
                if i < self.min_samples_leaf || n - i < self.min_samples_leaf {
                    continue;
                }
                let (lo, hi) = (sorted[i - 1].0, sorted[i].0);
                if lo >= hi {
                    continue;
                }
                let right_sum = total - left_sum;
                let score = left_sum * left_sum / i as f64 + right_sum * right_sum / (n - i) as f64;
                if score > parent_score + 1e-12 && best.map_or(true, |(s, _, _)| score > s) {
                    let mut threshold = lo + (hi - lo) / 2.0;
                    if threshold >= hi || !threshold.is_finite() {
                        threshold = lo;
                    }
                    best = Some((score, feature, threshold));
                }
            }
        }
        best.map(|(_, feature, threshold)| (feature, threshold))
    }
}

impl DecisionTree {
    pub fn fit(
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        samples: Vec<usize>,
        max_depth: usize,
        min_samples_leaf: usize,
        max_features: usize,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        let mut builder = TreeBuilder {
            x,
            y,
            max_depth,
            min_samples_leaf: min_samples_leaf.max(1),
            max_features: max_features.clamp(1, x.ncols()),
            rng,
            nodes: Vec::new(),
        };
        builder.build(samples, 0);
        Self {
            nodes: builder.nodes,
        }
    }

    pub fn predict_row(&self, x: &DMatrix<f64>, row: usize) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[(row, *feature)] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match &nodes[idx] {
                TreeNode::Leaf { .. } => 0,
                TreeNode::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }
}

/// Bootstrap-aggregated trees with `sqrt(n_features)` candidate features per
/// split. Each tree gets its own RNG stream derived from the seed, so the
/// result does not depend on thread scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForestRegressor {
    pub fn new(n_estimators: usize, seed: u64) -> Self {
        Self {
            n_estimators,
            max_depth: DEFAULT_MAX_DEPTH,
            min_samples_leaf: DEFAULT_MIN_SAMPLES_LEAF,
            seed,
            n_features: 0,
            trees: Vec::new(),
        }
    }

    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }
}

impl Regressor for RandomForestRegressor {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
        check_dimensions(x, y)?;
        if self.n_estimators == 0 {
            return Err(ModelError::TrainingError("n_estimators must be positive".to_string()));
        }
        let n = x.nrows();
        let max_features = ((x.ncols() as f64).sqrt() as usize).max(1);

        self.trees = (0..self.n_estimators)
            .into_par_iter()
            .map(|t| {
                let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
                rng.set_stream(t as u64);
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                DecisionTree::fit(
                    x,
                    y,
                    bootstrap,
                    self.max_depth,
                    self.min_samples_leaf,
                    max_features,
                    &mut rng,
                )
            })
            .collect();
        self.n_features = x.ncols();
        debug!("Fitted {} trees on {} rows", self.trees.len(), n);
        Ok(())
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::NotFitted);
        }
        if x.ncols() != self.n_features {
            return Err(ModelError::DimensionMismatch(format!(
                "model expects {} features, got {}",
                self.n_features,
                x.ncols()
            )));
        }
        let count = self.trees.len() as f64;
        Ok(DVector::from_fn(x.nrows(), |row, _| {
            self.trees.iter().map(|t| t.predict_row(x, row)).sum::<f64>() / count
        }))
    }
}
