//! Tree-ensemble regressor and classifier kernels.
//!
//! The kernels read the ONNX-ML attribute arrays into a
//! [`TreeEnsembleSpec`], flatten it once into a [`TreeEnsemble`], and
//! evaluate every row in a single computation float chosen at construction.

mod engine;

pub use engine::{Aggregate, NodeMode, PostTransform, TreeEnsemble, TreeEnsembleSpec, TreeFloat};
pub(crate) use engine::logistic;

use std::collections::BTreeSet;

use mlinfer_core::{AttributeKind, DataType, Tensor, Value, ML_DOMAIN, MLINFER_DOMAIN};
use ndarray::Array2;
use tracing::debug;

use super::ml::{argmax, binary_scores, ClassLabels};
use super::{matrix_view, tensor_input, OpKernel};
use crate::attributes::{AttributeSchema, BoundAttributes};
use crate::error::Result;
use crate::registry::{Arity, KernelContext, KernelDescriptor, KernelRegistry};

pub(super) fn register(registry: &mut KernelRegistry) {
    registry.register(
        KernelDescriptor::new("TreeEnsembleRegressor", ML_DOMAIN, Arity::Unary, |ctx, attrs| {
            let dtype = if ctx.dtype() == DataType::F64 {
                DataType::F64
            } else {
                DataType::F32
            };
            regressor(ctx, &attrs, "TreeEnsembleRegressor", dtype)
        })
        .with_schema(regressor_schema()),
    );
    registry.register(
        KernelDescriptor::new(
            "TreeEnsembleRegressorDouble",
            MLINFER_DOMAIN,
            Arity::Unary,
            |ctx, attrs| regressor(ctx, &attrs, "TreeEnsembleRegressorDouble", DataType::F64),
        )
        .with_schema(regressor_schema()),
    );
    registry.register(
        KernelDescriptor::new(
            "TreeEnsembleClassifier",
            ML_DOMAIN,
            Arity::Fixed {
                inputs: (1, 1),
                outputs: (1, 2),
            },
            classifier,
        )
        .with_schema(
            node_schema("class")
                .ints("classlabels_int64s", &[])
                .strings("classlabels_strings", &[]),
        ),
    );
}

fn node_schema(weights: &str) -> AttributeSchema {
    AttributeSchema::new()
        .string("aggregate_function", "SUM")
        .string("post_transform", "NONE")
        .floats("base_values", &[])
        .optional("base_values_as_tensor", AttributeKind::Tensor)
        .ints("nodes_treeids", &[])
        .ints("nodes_nodeids", &[])
        .ints("nodes_featureids", &[])
        .floats("nodes_values", &[])
        .optional("nodes_values_as_tensor", AttributeKind::Tensor)
        .floats("nodes_hitrates", &[])
        .optional("nodes_hitrates_as_tensor", AttributeKind::Tensor)
        .strings("nodes_modes", &[])
        .ints("nodes_truenodeids", &[])
        .ints("nodes_falsenodeids", &[])
        .ints("nodes_missing_value_tracks_true", &[])
        .ints(&format!("{weights}_treeids"), &[])
        .ints(&format!("{weights}_nodeids"), &[])
        .ints(&format!("{weights}_ids"), &[])
        .floats(&format!("{weights}_weights"), &[])
        .optional(&format!("{weights}_weights_as_tensor"), AttributeKind::Tensor)
}

fn regressor_schema() -> AttributeSchema {
    node_schema("target").int("n_targets", 1)
}

/// A float array attribute, preferring its `_as_tensor` double form.
fn float_array(attrs: &BoundAttributes, name: &str) -> Result<Vec<f64>> {
    match attrs.tensor(&format!("{name}_as_tensor")) {
        Some(tensor) => Ok(tensor.to_f64_vec()?),
        None => Ok(attrs.floats(name).unwrap_or_default().to_vec()),
    }
}

fn int_array(attrs: &BoundAttributes, name: &str) -> Vec<i64> {
    attrs.ints(name).unwrap_or_default().to_vec()
}

fn parse_attr<T: std::str::FromStr<Err = String>>(
    ctx: &KernelContext<'_>,
    attrs: &BoundAttributes,
    name: &str,
    default: &str,
) -> Result<T> {
    attrs
        .string(name)
        .as_deref()
        .unwrap_or(default)
        .parse()
        .map_err(|reason: String| ctx.unsupported(reason))
}

/// Collect the node and weight arrays; `weights` is `target` or `class`.
fn read_spec(
    ctx: &KernelContext<'_>,
    attrs: &BoundAttributes,
    weights: &str,
    n_targets: usize,
) -> Result<TreeEnsembleSpec> {
    let modes = attrs
        .strings("nodes_modes")
        .unwrap_or_default()
        .iter()
        .map(|mode| mode.parse::<NodeMode>().map_err(|reason| ctx.unsupported(reason)))
        .collect::<Result<Vec<_>>>()?;

    Ok(TreeEnsembleSpec {
        tree_ids: int_array(attrs, "nodes_treeids"),
        node_ids: int_array(attrs, "nodes_nodeids"),
        feature_ids: int_array(attrs, "nodes_featureids"),
        thresholds: float_array(attrs, "nodes_values")?,
        true_ids: int_array(attrs, "nodes_truenodeids"),
        false_ids: int_array(attrs, "nodes_falsenodeids"),
        modes,
        missing_tracks_true: int_array(attrs, "nodes_missing_value_tracks_true")
            .into_iter()
            .map(|flag| flag != 0)
            .collect(),
        target_tree_ids: int_array(attrs, &format!("{weights}_treeids")),
        target_node_ids: int_array(attrs, &format!("{weights}_nodeids")),
        target_ids: int_array(attrs, &format!("{weights}_ids")),
        target_weights: float_array(attrs, &format!("{weights}_weights"))?,
        n_targets,
        aggregate: parse_attr(ctx, attrs, "aggregate_function", "SUM")?,
        post_transform: parse_attr(ctx, attrs, "post_transform", "NONE")?,
        base_values: float_array(attrs, "base_values")?,
    })
}

/// A flattened ensemble in its computation float.
#[derive(Debug)]
enum Ensemble {
    F32(TreeEnsemble<f32>),
    F64(TreeEnsemble<f64>),
}

impl Ensemble {
    fn build(ctx: &KernelContext<'_>, spec: &TreeEnsembleSpec, dtype: DataType) -> Result<Self> {
        let ensemble = match dtype {
            DataType::F64 => TreeEnsemble::new(spec).map(Ensemble::F64),
            _ => TreeEnsemble::new(spec).map(Ensemble::F32),
        }
        .map_err(|reason| ctx.unsupported(reason))?;
        debug!(
            "Flattened {} trees of node '{}' ({} targets, {})",
            spec.tree_ids.iter().collect::<BTreeSet<_>>().len(),
            ctx.node.display_name(),
            spec.n_targets,
            dtype
        );
        Ok(ensemble)
    }
}

fn regressor(
    ctx: &KernelContext<'_>,
    attrs: &BoundAttributes,
    op_type: &'static str,
    dtype: DataType,
) -> Result<Box<dyn OpKernel>> {
    let n_targets = attrs.int("n_targets").unwrap_or(1);
    let n_targets = usize::try_from(n_targets)
        .map_err(|_| ctx.unsupported(format!("n_targets must be positive, got {n_targets}")))?;
    let spec = read_spec(ctx, attrs, "target", n_targets)?;
    Ok(Box::new(TreeEnsembleRegressorOp {
        op_type,
        ensemble: Ensemble::build(ctx, &spec, dtype)?,
    }))
}

fn regress<T: TreeFloat>(ensemble: &TreeEnsemble<T>, x: &Tensor, op: &str) -> Result<Tensor> {
    let x = x.cast(T::DTYPE)?;
    let rows = matrix_view(x.view::<T>()?, op)?;
    Ok(T::wrap(ensemble.predict(rows)?.into_dyn()))
}

/// `[rows, n_targets]` predictions.
struct TreeEnsembleRegressorOp {
    op_type: &'static str,
    ensemble: Ensemble,
}

impl OpKernel for TreeEnsembleRegressorOp {
    fn op_type(&self) -> &str {
        self.op_type
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, self.op_type)?;
        let out = match &self.ensemble {
            Ensemble::F32(ensemble) => regress(ensemble, x, self.op_type)?,
            Ensemble::F64(ensemble) => regress(ensemble, x, self.op_type)?,
        };
        Ok(vec![Value::Tensor(out)])
    }
}

/// Two-class ensembles whose weights all target one class.
#[derive(Debug, Clone, Copy)]
struct BinaryCase {
    column: usize,
    positive_weights: bool,
}

fn classifier(ctx: &KernelContext<'_>, attrs: BoundAttributes) -> Result<Box<dyn OpKernel>> {
    let labels = ClassLabels::from_attributes(&attrs, "classlabels_int64s")
        .ok_or_else(|| ctx.missing_attribute("classlabels_int64s"))?;
    let spec = read_spec(ctx, &attrs, "class", labels.len())?;

    let classes: BTreeSet<i64> = spec.target_ids.iter().copied().collect();
    let binary = match (labels.len(), classes.iter().next()) {
        (2, Some(&only)) if classes.len() == 1 => Some(BinaryCase {
            column: usize::try_from(only).unwrap_or(0),
            positive_weights: spec.target_weights.iter().all(|&w| w >= 0.0),
        }),
        _ => None,
    };
    let dtype = if ctx.dtype() == DataType::F64 {
        DataType::F64
    } else {
        DataType::F32
    };
    Ok(Box::new(TreeEnsembleClassifierOp {
        ensemble: Ensemble::build(ctx, &spec, dtype)?,
        labels,
        binary,
    }))
}

/// Labels and `[rows, n_classes]` scores.
struct TreeEnsembleClassifierOp {
    ensemble: Ensemble,
    labels: ClassLabels,
    binary: Option<BinaryCase>,
}

impl TreeEnsembleClassifierOp {
    fn classify<T: TreeFloat>(&self, ensemble: &TreeEnsemble<T>, x: &Tensor) -> Result<(Vec<usize>, Tensor)> {
        let x = x.cast(T::DTYPE)?;
        let rows = matrix_view(x.view::<T>()?, "TreeEnsembleClassifier")?;
        let raw = ensemble.predict_raw(rows)?;
        let post = ensemble.post_transform();

        let (picks, scores) = match self.binary {
            Some(case) => {
                let mut scores = Array2::from_elem((raw.nrows(), 2), T::zero());
                let mut picks = Vec::with_capacity(raw.nrows());
                for (row, mut out) in raw.rows().into_iter().zip(scores.rows_mut()) {
                    let (pair, pick) = binary_scores(row[case.column], case.positive_weights, post);
                    out[0] = pair[0];
                    out[1] = pair[1];
                    picks.push(pick);
                }
                (picks, scores)
            }
            None => {
                let mut scores = raw;
                let mut picks = Vec::with_capacity(scores.nrows());
                for mut row in scores.rows_mut() {
                    if let Some(slice) = row.as_slice_mut() {
                        post.apply(slice);
                    }
                    picks.push(argmax(row.view()));
                }
                (picks, scores)
            }
        };
        Ok((picks, T::wrap(scores.into_dyn())))
    }
}

impl OpKernel for TreeEnsembleClassifierOp {
    fn op_type(&self) -> &str {
        "TreeEnsembleClassifier"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "TreeEnsembleClassifier")?;
        let (picks, scores) = match &self.ensemble {
            Ensemble::F32(ensemble) => self.classify(ensemble, x)?,
            Ensemble::F64(ensemble) => self.classify(ensemble, x)?,
        };
        Ok(vec![
            Value::Tensor(self.labels.select(&picks)?),
            Value::Tensor(scores),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RuntimeEnv;
    use crate::registry::KernelRegistry;
    use crate::session::SessionOptions;
    use mlinfer_core::{AttributeValue, GraphNode};
    use std::sync::Arc;

    fn stump(op_type: &str, weights: &str) -> GraphNode {
        GraphNode::new(op_type)
            .with_domain(ML_DOMAIN)
            .with_name("trees")
            .with_inputs(&["x"])
            .with_attribute("nodes_treeids", AttributeValue::Ints(vec![0, 0, 0]))
            .with_attribute("nodes_nodeids", AttributeValue::Ints(vec![0, 1, 2]))
            .with_attribute("nodes_featureids", AttributeValue::Ints(vec![0, 0, 0]))
            .with_attribute("nodes_values", AttributeValue::Floats(vec![0.5, 0.0, 0.0]))
            .with_attribute("nodes_truenodeids", AttributeValue::Ints(vec![1, 0, 0]))
            .with_attribute("nodes_falsenodeids", AttributeValue::Ints(vec![2, 0, 0]))
            .with_attribute(
                "nodes_modes",
                AttributeValue::texts(&["BRANCH_LT", "LEAF", "LEAF"]),
            )
            .with_attribute(&format!("{weights}_treeids"), AttributeValue::Ints(vec![0, 0]))
            .with_attribute(&format!("{weights}_nodeids"), AttributeValue::Ints(vec![1, 2]))
    }

    fn build(node: GraphNode, dtype: DataType) -> Result<Box<dyn OpKernel>> {
        let registry = Arc::new(KernelRegistry::with_builtin());
        let env = RuntimeEnv::new(Arc::clone(&registry), SessionOptions::new().with_dtype(dtype));
        let ctx = KernelContext::new(&node, &env);
        registry.resolve(&ctx, crate::providers::Provider::Cpu)
    }

    fn run(kernel: &dyn OpKernel, x: Tensor) -> Vec<Tensor> {
        let x = Value::from(x);
        kernel
            .execute(&[&x])
            .unwrap()
            .into_iter()
            .map(|v| v.into_tensor().unwrap())
            .collect()
    }

    #[test]
    fn test_regressor_follows_session_dtype() {
        let node = stump("TreeEnsembleRegressor", "target")
            .with_outputs(&["y"])
            .with_attribute("target_ids", AttributeValue::Ints(vec![0, 0]))
            .with_attribute("target_weights", AttributeValue::Floats(vec![1.0, 2.0]))
            .with_attribute("base_values", AttributeValue::Floats(vec![0.5]));
        let x = Tensor::from_vec(vec![2, 1], vec![0.2f32, 0.7]).unwrap();

        let single = build(node.clone(), DataType::F32).unwrap();
        let out = run(single.as_ref(), x.clone()).remove(0);
        assert_eq!(out.dtype(), DataType::F32);
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out.to_f64_vec().unwrap(), vec![1.5, 2.5]);

        let double = build(node, DataType::F64).unwrap();
        assert_eq!(run(double.as_ref(), x).remove(0).dtype(), DataType::F64);
    }

    #[test]
    fn test_double_regressor_reads_tensor_attributes() {
        let node = stump("TreeEnsembleRegressorDouble", "target")
            .with_domain(MLINFER_DOMAIN)
            .with_outputs(&["y"])
            .with_attribute("target_ids", AttributeValue::Ints(vec![0, 0]))
            .with_attribute(
                "target_weights_as_tensor",
                AttributeValue::Tensor(Tensor::from_vec(vec![2], vec![0.1f64, 0.2]).unwrap()),
            );
        let kernel = build(node, DataType::F32).unwrap();
        let out = run(kernel.as_ref(), Tensor::from_vec(vec![1], vec![0.9f64]).unwrap()).remove(0);
        assert_eq!(out.dtype(), DataType::F64);
        assert_eq!(out.to_f64_vec().unwrap(), vec![0.2]);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let node = stump("TreeEnsembleRegressor", "target")
            .with_outputs(&["y"])
            .with_attribute("nodes_modes", AttributeValue::texts(&["BRANCH_XX", "LEAF", "LEAF"]));
        let err = build(node, DataType::F32).err().unwrap();
        assert!(matches!(err, crate::error::Error::UnsupportedConfiguration { .. }));
    }

    #[test]
    fn test_binary_classifier_with_string_labels() {
        let node = stump("TreeEnsembleClassifier", "class")
            .with_outputs(&["label", "scores"])
            .with_attribute("class_ids", AttributeValue::Ints(vec![1, 1]))
            .with_attribute("class_weights", AttributeValue::Floats(vec![0.25, 0.75]))
            .with_attribute("classlabels_strings", AttributeValue::texts(&["no", "yes"]));
        let kernel = build(node, DataType::F32).unwrap();
        let out = run(
            kernel.as_ref(),
            Tensor::from_vec(vec![2, 1], vec![0.2f32, 0.7]).unwrap(),
        );
        assert_eq!(
            out[0],
            Tensor::from_vec(vec![2], vec!["no".to_string(), "yes".to_string()]).unwrap()
        );
        assert_eq!(out[1].shape(), &[2, 2]);
        assert_eq!(out[1].to_f64_vec().unwrap(), vec![0.75, 0.25, 0.25, 0.75]);
    }

    #[test]
    fn test_multiclass_classifier_picks_argmax() {
        let node = stump("TreeEnsembleClassifier", "class")
            .with_outputs(&["label", "scores"])
            .with_attribute("class_treeids", AttributeValue::Ints(vec![0, 0, 0]))
            .with_attribute("class_nodeids", AttributeValue::Ints(vec![1, 2, 2]))
            .with_attribute("class_ids", AttributeValue::Ints(vec![0, 1, 2]))
            .with_attribute("class_weights", AttributeValue::Floats(vec![1.0, 0.5, 2.0]))
            .with_attribute("classlabels_int64s", AttributeValue::Ints(vec![10, 20, 30]));
        let kernel = build(node, DataType::F32).unwrap();
        let out = run(
            kernel.as_ref(),
            Tensor::from_vec(vec![2, 1], vec![0.2f32, 0.7]).unwrap(),
        );
        assert_eq!(out[0].to_i64_vec().unwrap(), vec![10, 30]);
        assert_eq!(out[1].to_f64_vec().unwrap(), vec![1.0, 0.0, 0.0, 0.0, 0.5, 2.0]);
    }
}
