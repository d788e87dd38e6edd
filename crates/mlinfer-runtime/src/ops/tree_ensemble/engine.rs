//! Flattened decision-tree ensembles.
//!
//! A [`TreeEnsemble`] is built once from the parallel per-node arrays of the
//! ONNX encoding ([`TreeEnsembleSpec`]) and evaluated row by row. The engine
//! is generic over the computation float ([`TreeFloat`]); it never mixes
//! `f32` and `f64` within one evaluation.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::fmt::Debug;
use std::str::FromStr;

use mlinfer_core::TensorElement;
use ndarray::{Array2, ArrayView1, ArrayView2};
use num_traits::Float;

use crate::error::{Error, Result};

/// Float types a tree ensemble can be evaluated in.
pub trait TreeFloat: Float + TensorElement + Debug {}

impl TreeFloat for f32 {}
impl TreeFloat for f64 {}

/// Comparison performed at a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// `x <= threshold`
    BranchLeq,
    /// `x < threshold`
    BranchLt,
    /// `x >= threshold`
    BranchGte,
    /// `x > threshold`
    BranchGt,
    /// `x == threshold`
    BranchEq,
    /// `x != threshold`
    BranchNeq,
    /// Terminal node carrying weights.
    Leaf,
}

impl NodeMode {
    fn goes_true<T: Float>(self, value: T, threshold: T) -> bool {
        match self {
            NodeMode::BranchLeq => value <= threshold,
            NodeMode::BranchLt => value < threshold,
            NodeMode::BranchGte => value >= threshold,
            NodeMode::BranchGt => value > threshold,
            NodeMode::BranchEq => value == threshold,
            NodeMode::BranchNeq => value != threshold,
            NodeMode::Leaf => false,
        }
    }
}

impl FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "BRANCH_LEQ" => Ok(NodeMode::BranchLeq),
            "BRANCH_LT" => Ok(NodeMode::BranchLt),
            "BRANCH_GTE" => Ok(NodeMode::BranchGte),
            "BRANCH_GT" => Ok(NodeMode::BranchGt),
            "BRANCH_EQ" => Ok(NodeMode::BranchEq),
            "BRANCH_NEQ" => Ok(NodeMode::BranchNeq),
            "LEAF" => Ok(NodeMode::Leaf),
            other => Err(format!("unknown node mode '{other}'")),
        }
    }
}

/// How the leaf weights of different trees are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Aggregate {
    /// Sum of the weights.
    #[default]
    Sum,
    /// Sum divided by the number of trees.
    Average,
    /// Smallest weight; 0 when no tree contributes.
    Min,
    /// Largest weight; 0 when no tree contributes.
    Max,
}

impl FromStr for Aggregate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SUM" => Ok(Aggregate::Sum),
            "AVERAGE" => Ok(Aggregate::Average),
            "MIN" => Ok(Aggregate::Min),
            "MAX" => Ok(Aggregate::Max),
            other => Err(format!("unknown aggregate function '{other}'")),
        }
    }
}

/// Transform applied to each output row after aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostTransform {
    /// Identity.
    #[default]
    None,
    /// `1 / (1 + exp(-x))` per element.
    Logistic,
    /// Softmax over the row.
    Softmax,
    /// Softmax over the non-zero entries; zeros stay zero.
    SoftmaxZero,
    /// Inverse of the standard normal CDF per element.
    Probit,
}

impl FromStr for PostTransform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(PostTransform::None),
            "LOGISTIC" => Ok(PostTransform::Logistic),
            "SOFTMAX" => Ok(PostTransform::Softmax),
            "SOFTMAX_ZERO" => Ok(PostTransform::SoftmaxZero),
            "PROBIT" => Ok(PostTransform::Probit),
            other => Err(format!("unknown post transform '{other}'")),
        }
    }
}

pub(crate) fn logistic<T: Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

/// Winitzki's closed-form approximation of `erf^-1`.
fn erf_inv(x: f64) -> f64 {
    const A: f64 = 0.147;
    let ln = (1.0 - x * x).ln();
    let t = 2.0 / (PI * A) + ln / 2.0;
    x.signum() * ((t * t - ln / A).sqrt() - t).sqrt()
}

fn probit<T: Float>(p: T) -> T {
    let p = p.to_f64().unwrap_or(f64::NAN);
    num_traits::cast(std::f64::consts::SQRT_2 * erf_inv(2.0 * p - 1.0)).unwrap_or_else(T::nan)
}

impl PostTransform {
    /// Apply the transform to one row of scores in place.
    pub fn apply<T: Float>(self, scores: &mut [T]) {
        match self {
            PostTransform::None => {}
            PostTransform::Logistic => scores.iter_mut().for_each(|s| *s = logistic(*s)),
            PostTransform::Probit => scores.iter_mut().for_each(|s| *s = probit(*s)),
            PostTransform::Softmax => {
                let max = scores.iter().fold(T::neg_infinity(), |m, &s| m.max(s));
                let mut sum = T::zero();
                for s in scores.iter_mut() {
                    *s = (*s - max).exp();
                    sum = sum + *s;
                }
                scores.iter_mut().for_each(|s| *s = *s / sum);
            }
            PostTransform::SoftmaxZero => {
                let max = scores
                    .iter()
                    .filter(|s| !s.is_zero())
                    .fold(T::neg_infinity(), |m, &s| m.max(s));
                let mut sum = T::zero();
                for s in scores.iter_mut().filter(|s| !s.is_zero()) {
                    *s = (*s - max).exp();
                    sum = sum + *s;
                }
                if sum > T::zero() {
                    scores
                        .iter_mut()
                        .filter(|s| !s.is_zero())
                        .for_each(|s| *s = *s / sum);
                }
            }
        }
    }
}

/// Raw per-node and per-target arrays of an ensemble.
///
/// Node arrays are parallel and indexed by node; `missing_tracks_true` may
/// be empty, meaning false everywhere. Target arrays are parallel and attach
/// a weight for one output column to one leaf.
#[derive(Debug, Clone, Default)]
pub struct TreeEnsembleSpec {
    /// Tree id of each node.
    pub tree_ids: Vec<i64>,
    /// Node id of each node, unique within its tree.
    pub node_ids: Vec<i64>,
    /// Feature column compared at each node.
    pub feature_ids: Vec<i64>,
    /// Threshold compared at each node.
    pub thresholds: Vec<f64>,
    /// Node id taken when the comparison holds.
    pub true_ids: Vec<i64>,
    /// Node id taken otherwise.
    pub false_ids: Vec<i64>,
    /// Comparison of each node.
    pub modes: Vec<NodeMode>,
    /// Whether a NaN feature takes the true branch.
    pub missing_tracks_true: Vec<bool>,
    /// Tree id of each weight.
    pub target_tree_ids: Vec<i64>,
    /// Node id of each weight.
    pub target_node_ids: Vec<i64>,
    /// Output column of each weight.
    pub target_ids: Vec<i64>,
    /// The weights.
    pub target_weights: Vec<f64>,
    /// Number of output columns.
    pub n_targets: usize,
    /// How trees are combined.
    pub aggregate: Aggregate,
    /// Transform applied by [`TreeEnsemble::predict`].
    pub post_transform: PostTransform,
    /// Added to each column after aggregation; empty or `n_targets` long.
    pub base_values: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Node<T> {
    feature: usize,
    threshold: T,
    mode: NodeMode,
    true_child: usize,
    false_child: usize,
    missing_tracks_true: bool,
    weights: Vec<(usize, T)>,
}

/// A validated, flattened tree ensemble.
#[derive(Debug, Clone)]
pub struct TreeEnsemble<T> {
    nodes: Vec<Node<T>>,
    roots: Vec<usize>,
    n_targets: usize,
    n_features: usize,
    aggregate: Aggregate,
    post_transform: PostTransform,
    base_values: Vec<T>,
}

fn cast<T: TreeFloat>(value: f64) -> T {
    num_traits::cast(value).unwrap_or_else(T::nan)
}

impl<T: TreeFloat> TreeEnsemble<T> {
    /// Validate and flatten `spec`.
    pub fn new(spec: &TreeEnsembleSpec) -> std::result::Result<Self, String> {
        let n = spec.node_ids.len();
        let node_lengths = [
            ("nodes_treeids", spec.tree_ids.len()),
            ("nodes_featureids", spec.feature_ids.len()),
            ("nodes_values", spec.thresholds.len()),
            ("nodes_truenodeids", spec.true_ids.len()),
            ("nodes_falsenodeids", spec.false_ids.len()),
            ("nodes_modes", spec.modes.len()),
        ];
        for (name, len) in node_lengths {
            if len != n {
                return Err(format!("{name} has {len} entries, expected {n}"));
            }
        }
        if !spec.missing_tracks_true.is_empty() && spec.missing_tracks_true.len() != n {
            return Err(format!(
                "nodes_missing_value_tracks_true has {} entries, expected {n}",
                spec.missing_tracks_true.len()
            ));
        }
        let m = spec.target_weights.len();
        if spec.target_tree_ids.len() != m || spec.target_node_ids.len() != m || spec.target_ids.len() != m {
            return Err(format!("target arrays must all have {m} entries"));
        }
        if spec.n_targets == 0 {
            return Err("the ensemble needs at least one target".to_string());
        }
        if !spec.base_values.is_empty() && spec.base_values.len() != spec.n_targets {
            return Err(format!(
                "base_values has {} entries, expected {}",
                spec.base_values.len(),
                spec.n_targets
            ));
        }

        let mut index = HashMap::with_capacity(n);
        let mut tree_order = Vec::new();
        for i in 0..n {
            let key = (spec.tree_ids[i], spec.node_ids[i]);
            if index.insert(key, i).is_some() {
                return Err(format!("duplicate node {} in tree {}", key.1, key.0));
            }
            if !tree_order.contains(&key.0) {
                tree_order.push(key.0);
            }
        }

        let mut nodes = Vec::with_capacity(n);
        let mut n_features = 0;
        for i in 0..n {
            let tree = spec.tree_ids[i];
            let mode = spec.modes[i];
            let (feature, true_child, false_child) = if mode == NodeMode::Leaf {
                (0, i, i)
            } else {
                let feature = usize::try_from(spec.feature_ids[i]).map_err(|_| {
                    format!("node {} of tree {tree} has feature id {}", spec.node_ids[i], spec.feature_ids[i])
                })?;
                let child = |id: i64| {
                    index.get(&(tree, id)).copied().ok_or_else(|| {
                        format!("node {} of tree {tree} points to missing node {id}", spec.node_ids[i])
                    })
                };
                n_features = n_features.max(feature + 1);
                (feature, child(spec.true_ids[i])?, child(spec.false_ids[i])?)
            };
            nodes.push(Node {
                feature,
                threshold: cast(spec.thresholds[i]),
                mode,
                true_child,
                false_child,
                missing_tracks_true: spec.missing_tracks_true.get(i).copied().unwrap_or(false),
                weights: Vec::new(),
            });
        }

        for j in 0..m {
            let key = (spec.target_tree_ids[j], spec.target_node_ids[j]);
            let node = index
                .get(&key)
                .copied()
                .ok_or_else(|| format!("weight refers to missing node {} of tree {}", key.1, key.0))?;
            let target = usize::try_from(spec.target_ids[j])
                .ok()
                .filter(|&t| t < spec.n_targets)
                .ok_or_else(|| {
                    format!("target id {} out of range for {} targets", spec.target_ids[j], spec.n_targets)
                })?;
            nodes[node].weights.push((target, cast(spec.target_weights[j])));
        }

        let roots = Self::find_roots(&nodes, spec, &tree_order)?;
        Ok(Self {
            nodes,
            roots,
            n_targets: spec.n_targets,
            n_features,
            aggregate: spec.aggregate,
            post_transform: spec.post_transform,
            base_values: spec.base_values.iter().map(|&b| cast(b)).collect(),
        })
    }

    /// The root of each tree is its first node that no other node points to.
    /// Every node reachable from a root must be reached exactly once.
    fn find_roots(
        nodes: &[Node<T>],
        spec: &TreeEnsembleSpec,
        tree_order: &[i64],
    ) -> std::result::Result<Vec<usize>, String> {
        let mut children = HashSet::new();
        for (i, node) in nodes.iter().enumerate() {
            if node.mode != NodeMode::Leaf {
                children.insert(node.true_child);
                children.insert(node.false_child);
            }
            if node.mode != NodeMode::Leaf && (node.true_child == i || node.false_child == i) {
                return Err(format!("node {} of tree {} points to itself", spec.node_ids[i], spec.tree_ids[i]));
            }
        }

        let mut roots = Vec::with_capacity(tree_order.len());
        for &tree in tree_order {
            let root = (0..nodes.len())
                .find(|&i| spec.tree_ids[i] == tree && !children.contains(&i))
                .ok_or_else(|| format!("tree {tree} has no root"))?;

            let mut seen = HashSet::new();
            let mut stack = vec![root];
            while let Some(i) = stack.pop() {
                if !seen.insert(i) {
                    return Err(format!("tree {tree} revisits node {}", spec.node_ids[i]));
                }
                let node = &nodes[i];
                if node.mode != NodeMode::Leaf {
                    stack.push(node.true_child);
                    if node.false_child != node.true_child {
                        stack.push(node.false_child);
                    }
                }
            }
            roots.push(root);
        }
        Ok(roots)
    }

    /// Number of trees.
    pub fn n_trees(&self) -> usize {
        self.roots.len()
    }

    /// Number of output columns.
    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// Smallest column count an input row needs.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// The configured post transform.
    pub fn post_transform(&self) -> PostTransform {
        self.post_transform
    }

    fn leaf(&self, root: usize, row: ArrayView1<'_, T>) -> &Node<T> {
        let mut node = &self.nodes[root];
        while node.mode != NodeMode::Leaf {
            let value = row[node.feature];
            let goes_true = if value.is_nan() {
                node.missing_tracks_true
            } else {
                node.mode.goes_true(value, node.threshold)
            };
            let next = if goes_true { node.true_child } else { node.false_child };
            node = &self.nodes[next];
        }
        node
    }

    fn score_row(&self, row: ArrayView1<'_, T>, out: &mut [T]) {
        let mut contributed = vec![false; self.n_targets];
        for &root in &self.roots {
            for &(target, weight) in &self.leaf(root, row).weights {
                let slot = &mut out[target];
                *slot = match self.aggregate {
                    Aggregate::Sum | Aggregate::Average => *slot + weight,
                    Aggregate::Min if contributed[target] => (*slot).min(weight),
                    Aggregate::Max if contributed[target] => (*slot).max(weight),
                    Aggregate::Min | Aggregate::Max => weight,
                };
                contributed[target] = true;
            }
        }
        if self.aggregate == Aggregate::Average && !self.roots.is_empty() {
            let trees = cast::<T>(self.roots.len() as f64);
            out.iter_mut().for_each(|s| *s = *s / trees);
        }
        for (slot, &base) in out.iter_mut().zip(&self.base_values) {
            *slot = *slot + base;
        }
    }

    /// Aggregated scores plus base values, `[rows, n_targets]`, without the
    /// post transform.
    pub fn predict_raw(&self, x: ArrayView2<'_, T>) -> Result<Array2<T>> {
        if x.ncols() < self.n_features {
            return Err(Error::dimension(format!(
                "tree ensemble reads feature {} but the input has {} columns",
                self.n_features - 1,
                x.ncols()
            )));
        }
        let mut out = Array2::from_elem((x.nrows(), self.n_targets), T::zero());
        for (row, mut scores) in x.rows().into_iter().zip(out.rows_mut()) {
            if let Some(slice) = scores.as_slice_mut() {
                self.score_row(row, slice);
            }
        }
        Ok(out)
    }

    /// Scores with the post transform applied, `[rows, n_targets]`.
    pub fn predict(&self, x: ArrayView2<'_, T>) -> Result<Array2<T>> {
        let mut out = self.predict_raw(x)?;
        for mut row in out.rows_mut() {
            if let Some(slice) = row.as_slice_mut() {
                self.post_transform.apply(slice);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// One split on feature 0 at 0.5: true leaf 1.0, false leaf 2.0.
    fn stump(mode: NodeMode) -> TreeEnsembleSpec {
        TreeEnsembleSpec {
            tree_ids: vec![0, 0, 0],
            node_ids: vec![0, 1, 2],
            feature_ids: vec![0, 0, 0],
            thresholds: vec![0.5, 0.0, 0.0],
            true_ids: vec![1, 0, 0],
            false_ids: vec![2, 0, 0],
            modes: vec![mode, NodeMode::Leaf, NodeMode::Leaf],
            target_tree_ids: vec![0, 0],
            target_node_ids: vec![1, 2],
            target_ids: vec![0, 0],
            target_weights: vec![1.0, 2.0],
            n_targets: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_stump_routes_rows() {
        let mut spec = stump(NodeMode::BranchLt);
        spec.base_values = vec![10.0];
        let ensemble = TreeEnsemble::<f32>::new(&spec).unwrap();
        let out = ensemble.predict(array![[0.2f32], [0.7]].view()).unwrap();
        assert_eq!(out, array![[11.0f32], [12.0]]);
    }

    #[test]
    fn test_missing_value_routing() {
        let mut spec = stump(NodeMode::BranchLeq);
        let x = array![[f64::NAN]];
        let ensemble = TreeEnsemble::<f64>::new(&spec).unwrap();
        assert_eq!(ensemble.predict(x.view()).unwrap()[[0, 0]], 2.0);

        spec.missing_tracks_true = vec![true, false, false];
        let ensemble = TreeEnsemble::<f64>::new(&spec).unwrap();
        assert_eq!(ensemble.predict(x.view()).unwrap()[[0, 0]], 1.0);
    }

    #[test]
    fn test_average_and_max_over_two_trees() {
        let mut spec = stump(NodeMode::BranchLeq);
        // Second tree: a single leaf weighted 4.0.
        spec.tree_ids.push(1);
        spec.node_ids.push(0);
        spec.feature_ids.push(0);
        spec.thresholds.push(0.0);
        spec.true_ids.push(0);
        spec.false_ids.push(0);
        spec.modes.push(NodeMode::Leaf);
        spec.target_tree_ids.push(1);
        spec.target_node_ids.push(0);
        spec.target_ids.push(0);
        spec.target_weights.push(4.0);

        spec.aggregate = Aggregate::Average;
        let average = TreeEnsemble::<f64>::new(&spec).unwrap();
        assert_eq!(average.n_trees(), 2);
        assert_eq!(average.predict(array![[0.0]].view()).unwrap()[[0, 0]], 2.5);

        spec.aggregate = Aggregate::Max;
        let max = TreeEnsemble::<f64>::new(&spec).unwrap();
        assert_eq!(max.predict(array![[0.0]].view()).unwrap()[[0, 0]], 4.0);
    }

    #[test]
    fn test_construction_rejects_bad_children() {
        let mut spec = stump(NodeMode::BranchLt);
        spec.true_ids[0] = 7;
        assert!(TreeEnsemble::<f32>::new(&spec).unwrap_err().contains("missing node 7"));

        let mut spec = stump(NodeMode::BranchLt);
        spec.feature_ids[0] = -1;
        assert!(TreeEnsemble::<f32>::new(&spec).is_err());

        let mut spec = stump(NodeMode::BranchLt);
        spec.target_ids[0] = 3;
        assert!(TreeEnsemble::<f32>::new(&spec).is_err());
    }

    #[test]
    fn test_too_few_columns() {
        let mut spec = stump(NodeMode::BranchLt);
        spec.feature_ids[0] = 2;
        let ensemble = TreeEnsemble::<f32>::new(&spec).unwrap();
        assert_eq!(ensemble.n_features(), 3);
        let err = ensemble.predict(array![[0.0f32, 1.0]].view()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }

    #[test]
    fn test_post_transforms() {
        let mut row = [0.0f64, 0.0];
        PostTransform::Logistic.apply(&mut row);
        assert_eq!(row, [0.5, 0.5]);

        let mut row = [1.0f64, 1.0, 0.0];
        PostTransform::SoftmaxZero.apply(&mut row);
        assert_eq!(row, [0.5, 0.5, 0.0]);

        let mut row = [0.5f64, 0.975];
        PostTransform::Probit.apply(&mut row);
        assert!(row[0].abs() < 1e-9);
        assert!((row[1] - 1.96).abs() < 0.01);

        assert_eq!("SOFTMAX".parse::<PostTransform>(), Ok(PostTransform::Softmax));
        assert!("SIGMOID".parse::<PostTransform>().is_err());
    }
}
