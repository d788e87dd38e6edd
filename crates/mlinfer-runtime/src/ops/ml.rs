// Classical ML operators of the ai.onnx.ml domain

use mlinfer_core::{
    with_numeric_type, AttributeKind, DataType, NumericElement, Tensor, Value,
    ML_DOMAIN,
};
use ndarray::{Array2, ArrayView1, ArrayView2};
use num_traits::Float;

use super::tree_ensemble::PostTransform;
use super::{matrix_view, single, tensor_input, unsupported_type, FloatElement, OpKernel};
use crate::attributes::{AttributeSchema, BoundAttributes};
use crate::error::{Error, Result};
use crate::registry::{Arity, KernelContext, KernelDescriptor, KernelRegistry};

pub(super) fn register(registry: &mut KernelRegistry) {
    registry.register(
        KernelDescriptor::new("Binarizer", ML_DOMAIN, Arity::Unary, |_, attrs| {
            Ok(Box::new(BinarizerOp {
                threshold: attrs.float("threshold").unwrap_or(0.0),
            }))
        })
        .with_schema(AttributeSchema::new().float("threshold", 0.0)),
    );
    registry.register(
        KernelDescriptor::new("Scaler", ML_DOMAIN, Arity::Unary, |ctx, attrs| {
            Ok(Box::new(ScalerOp {
                offset: attrs.floats("offset").unwrap_or_default().to_vec(),
                scale: attrs.floats("scale").unwrap_or_default().to_vec(),
                dtype: ctx.dtype(),
            }))
        })
        .with_schema(AttributeSchema::new().floats("offset", &[]).floats("scale", &[])),
    );
    registry.register(
        KernelDescriptor::new("LinearRegressor", ML_DOMAIN, Arity::Unary, |ctx, attrs| {
            let targets = attrs.int("targets").unwrap_or(1);
            let targets = usize::try_from(targets)
                .ok()
                .filter(|&t| t > 0)
                .ok_or_else(|| ctx.unsupported(format!("targets must be positive, got {targets}")))?;
            Ok(Box::new(LinearRegressorOp {
                linear: Linear::new(&attrs, targets),
                post_transform: post_transform(ctx, &attrs)?,
                dtype: ctx.dtype(),
            }))
        })
        .with_schema(
            AttributeSchema::new()
                .floats("coefficients", &[])
                .floats("intercepts", &[])
                .int("targets", 1)
                .string("post_transform", "NONE"),
        ),
    );
    registry.register(
        KernelDescriptor::new(
            "LinearClassifier",
            ML_DOMAIN,
            Arity::Fixed {
                inputs: (1, 1),
                outputs: (1, 2),
            },
            |ctx, attrs| {
                let labels = ClassLabels::from_attributes(&attrs, "classlabels_ints")
                    .ok_or_else(|| ctx.missing_attribute("classlabels_ints"))?;
                // Binary models store a single row of coefficients.
                let rows = match attrs.floats("intercepts").map(<[f64]>::len) {
                    Some(n) if n > 0 => n,
                    _ if labels.len() == 2 => 1,
                    _ => labels.len(),
                };
                Ok(Box::new(LinearClassifierOp {
                    linear: Linear::new(&attrs, rows),
                    labels,
                    post_transform: post_transform(ctx, &attrs)?,
                    dtype: ctx.dtype(),
                }))
            },
        )
        .with_schema(
            AttributeSchema::new()
                .required("coefficients", AttributeKind::Floats)
                .floats("intercepts", &[])
                .ints("classlabels_ints", &[])
                .strings("classlabels_strings", &[])
                .int("multi_class", 0)
                .string("post_transform", "NONE"),
        ),
    );
    registry.register(
        KernelDescriptor::new("ZipMap", ML_DOMAIN, Arity::Unary, |ctx, attrs| {
            let labels = ClassLabels::from_attributes(&attrs, "classlabels_int64s")
                .ok_or_else(|| ctx.missing_attribute("classlabels_int64s"))?;
            Ok(Box::new(ZipMapOp {
                keys: labels.keys(),
            }))
        })
        .with_schema(
            AttributeSchema::new()
                .ints("classlabels_int64s", &[])
                .strings("classlabels_strings", &[]),
        ),
    );
    registry.register(KernelDescriptor::new(
        "ArrayFeatureExtractor",
        ML_DOMAIN,
        Arity::Binary,
        |_, _| Ok(Box::new(ArrayFeatureExtractorOp)),
    ));
}

fn post_transform(ctx: &KernelContext<'_>, attrs: &BoundAttributes) -> Result<PostTransform> {
    attrs
        .string("post_transform")
        .as_deref()
        .unwrap_or("NONE")
        .parse()
        .map_err(|reason: String| ctx.unsupported(reason))
}

/// Class labels of a classifier, integer or string.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum ClassLabels {
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl ClassLabels {
    /// String labels win over the integer list named `ints`; `None` when
    /// both are empty.
    pub(super) fn from_attributes(attrs: &BoundAttributes, ints: &str) -> Option<Self> {
        match attrs.strings("classlabels_strings") {
            Some(strings) if !strings.is_empty() => Some(ClassLabels::Strings(strings)),
            _ => attrs
                .ints(ints)
                .filter(|values| !values.is_empty())
                .map(|values| ClassLabels::Ints(values.to_vec())),
        }
    }

    pub(super) fn len(&self) -> usize {
        match self {
            ClassLabels::Ints(labels) => labels.len(),
            ClassLabels::Strings(labels) => labels.len(),
        }
    }

    /// Map keys; integer labels are rendered in decimal.
    fn keys(&self) -> Vec<String> {
        match self {
            ClassLabels::Ints(labels) => labels.iter().map(i64::to_string).collect(),
            ClassLabels::Strings(labels) => labels.clone(),
        }
    }

    /// 1-D label tensor for the class indices `picks`.
    pub(super) fn select(&self, picks: &[usize]) -> Result<Tensor> {
        fn gather<T: Clone>(labels: &[T], picks: &[usize]) -> Result<Vec<T>> {
            picks
                .iter()
                .map(|&i| {
                    labels.get(i).cloned().ok_or_else(|| {
                        Error::dimension(format!("class index {i} out of range for {} labels", labels.len()))
                    })
                })
                .collect()
        }
        let tensor = match self {
            ClassLabels::Ints(labels) => Tensor::from_vec(vec![picks.len()], gather(labels, picks)?)?,
            ClassLabels::Strings(labels) => Tensor::from_vec(vec![picks.len()], gather(labels, picks)?)?,
        };
        Ok(tensor)
    }
}

/// Index of the first maximal entry; NaN entries never win.
pub(super) fn argmax<T: PartialOrd + Copy>(row: ArrayView1<'_, T>) -> usize {
    let mut best: Option<(usize, T)> = None;
    for (i, &v) in row.iter().enumerate() {
        match best {
            Some((_, current)) if !(v > current) => {}
            _ if v.partial_cmp(&v).is_none() => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i).unwrap_or(0)
}

/// Two score columns from the single positive-class score `v`.
///
/// Non-negative tree weights read `v` as a probability (`[1 - v, v]`,
/// threshold 0.5); margins read it as a signed score (`[-v, v]`,
/// threshold 0).
pub(super) fn binary_scores<T: Float>(v: T, probability: bool, post: PostTransform) -> ([T; 2], usize) {
    let half = num_traits::cast(0.5).unwrap_or_else(T::zero);
    match post {
        PostTransform::None if probability => ([T::one() - v, v], usize::from(v > half)),
        PostTransform::None => ([-v, v], usize::from(v > T::zero())),
        PostTransform::Logistic => {
            let p = super::tree_ensemble::logistic(v);
            ([T::one() - p, p], usize::from(p > half))
        }
        other => {
            let mut pair = [-v, v];
            other.apply(&mut pair);
            let pick = argmax(ArrayView1::from(&pair[..]));
            (pair, pick)
        }
    }
}

/// Float view of an input: float tensors as they are, others cast to the
/// session float.
fn float_input(x: &Tensor, fallback: DataType) -> Result<Tensor> {
    if x.dtype().is_float() {
        Ok(x.clone())
    } else {
        Ok(x.cast(fallback)?)
    }
}

fn cast<T: FloatElement>(value: f64) -> T {
    num_traits::cast(value).unwrap_or_else(T::nan)
}

struct BinarizerOp {
    threshold: f64,
}

fn binarize<T: NumericElement>(x: &Tensor, threshold: f64) -> Result<Tensor> {
    let out = x
        .view::<T>()?
        .mapv(|v| if v.to_f64() > threshold { T::one() } else { T::zero() });
    Ok(T::wrap(out))
}

impl OpKernel for BinarizerOp {
    fn op_type(&self) -> &str {
        "Binarizer"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "Binarizer")?;
        let out = with_numeric_type!(
            x.dtype(),
            T => binarize::<T>(x, self.threshold)?,
            _ => return Err(unsupported_type("Binarizer", "a numeric tensor", x.dtype()))
        );
        single(out)
    }
}

/// `(x - offset) * scale` per column; single-entry lists apply to every
/// column.
struct ScalerOp {
    offset: Vec<f64>,
    scale: Vec<f64>,
    dtype: DataType,
}

impl ScalerOp {
    fn column_values(values: &[f64], columns: usize, default: f64, name: &str) -> Result<Vec<f64>> {
        match values.len() {
            0 => Ok(vec![default; columns]),
            1 => Ok(vec![values[0]; columns]),
            n if n == columns => Ok(values.to_vec()),
            n => Err(Error::dimension(format!(
                "Scaler {name} has {n} entries for {columns} columns"
            ))),
        }
    }

    fn scale<T: FloatElement>(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.view::<T>()?.clone();
        let columns = out.shape().last().copied().unwrap_or(1);
        let offset = Self::column_values(&self.offset, columns, 0.0, "offset")?;
        let scale = Self::column_values(&self.scale, columns, 1.0, "scale")?;
        for (i, v) in out.iter_mut().enumerate() {
            let j = i % columns.max(1);
            *v = (*v - cast(offset[j])) * cast(scale[j]);
        }
        Ok(T::wrap(out))
    }
}

impl OpKernel for ScalerOp {
    fn op_type(&self) -> &str {
        "Scaler"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = float_input(tensor_input(inputs, 0, "Scaler")?, self.dtype)?;
        let out = match x.dtype() {
            DataType::F64 => self.scale::<f64>(&x)?,
            _ => self.scale::<f32>(&x)?,
        };
        single(out)
    }
}

/// `x · Wᵀ + b` with `W` stored row-major as `rows × features`.
struct Linear {
    coefficients: Vec<f64>,
    intercepts: Vec<f64>,
    rows: usize,
}

impl Linear {
    fn new(attrs: &BoundAttributes, rows: usize) -> Self {
        Self {
            coefficients: attrs.floats("coefficients").unwrap_or_default().to_vec(),
            intercepts: attrs.floats("intercepts").unwrap_or_default().to_vec(),
            rows,
        }
    }

    fn apply<T: FloatElement>(&self, x: ArrayView2<'_, T>) -> Result<Array2<T>> {
        let features = x.ncols();
        if self.coefficients.len() != self.rows * features {
            return Err(Error::dimension(format!(
                "{} coefficients do not form {} rows of {features} features",
                self.coefficients.len(),
                self.rows
            )));
        }
        let weights = Array2::from_shape_vec(
            (self.rows, features),
            self.coefficients.iter().map(|&c| cast(c)).collect(),
        )
        .map_err(mlinfer_core::CoreError::from)?;
        let mut y = x.dot(&weights.t());
        if !self.intercepts.is_empty() {
            for mut row in y.rows_mut() {
                for (v, &b) in row.iter_mut().zip(&self.intercepts) {
                    *v = *v + cast(b);
                }
            }
        }
        Ok(y)
    }
}

struct LinearRegressorOp {
    linear: Linear,
    post_transform: PostTransform,
    dtype: DataType,
}

impl LinearRegressorOp {
    fn regress<T: FloatElement>(&self, x: &Tensor) -> Result<Tensor> {
        let mut y = self.linear.apply(matrix_view(x.view::<T>()?, "LinearRegressor")?)?;
        for mut row in y.rows_mut() {
            if let Some(slice) = row.as_slice_mut() {
                self.post_transform.apply(slice);
            }
        }
        Ok(T::wrap(y.into_dyn()))
    }
}

impl OpKernel for LinearRegressorOp {
    fn op_type(&self) -> &str {
        "LinearRegressor"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = float_input(tensor_input(inputs, 0, "LinearRegressor")?, self.dtype)?;
        let out = match x.dtype() {
            DataType::F64 => self.regress::<f64>(&x)?,
            _ => self.regress::<f32>(&x)?,
        };
        single(out)
    }
}

/// Labels and scores of a linear model. A single coefficient row with two
/// labels is a binary model producing two score columns.
struct LinearClassifierOp {
    linear: Linear,
    labels: ClassLabels,
    post_transform: PostTransform,
    dtype: DataType,
}

impl LinearClassifierOp {
    fn classify<T: FloatElement>(&self, x: &Tensor) -> Result<(Vec<usize>, Tensor)> {
        let raw = self.linear.apply(matrix_view(x.view::<T>()?, "LinearClassifier")?)?;
        let mut picks = Vec::with_capacity(raw.nrows());

        if raw.ncols() == 1 && self.labels.len() == 2 {
            let mut scores = Array2::from_elem((raw.nrows(), 2), T::zero());
            for (margin, mut out) in raw.iter().zip(scores.rows_mut()) {
                let (pair, pick) = binary_scores(*margin, false, self.post_transform);
                out[0] = pair[0];
                out[1] = pair[1];
                picks.push(pick);
            }
            return Ok((picks, T::wrap(scores.into_dyn())));
        }

        if raw.ncols() != self.labels.len() {
            return Err(Error::dimension(format!(
                "LinearClassifier produces {} scores for {} labels",
                raw.ncols(),
                self.labels.len()
            )));
        }
        let mut scores = raw;
        for mut row in scores.rows_mut() {
            if let Some(slice) = row.as_slice_mut() {
                self.post_transform.apply(slice);
            }
            picks.push(argmax(row.view()));
        }
        Ok((picks, T::wrap(scores.into_dyn())))
    }
}

impl OpKernel for LinearClassifierOp {
    fn op_type(&self) -> &str {
        "LinearClassifier"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = float_input(tensor_input(inputs, 0, "LinearClassifier")?, self.dtype)?;
        let (picks, scores) = match x.dtype() {
            DataType::F64 => self.classify::<f64>(&x)?,
            _ => self.classify::<f32>(&x)?,
        };
        Ok(vec![
            Value::Tensor(self.labels.select(&picks)?),
            Value::Tensor(scores),
        ])
    }
}

/// Turns each score row into a label-keyed map.
struct ZipMapOp {
    keys: Vec<String>,
}

impl OpKernel for ZipMapOp {
    fn op_type(&self) -> &str {
        "ZipMap"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "ZipMap")?;
        let columns = x.shape().last().copied().unwrap_or(0);
        if x.ndim() > 2 || columns != self.keys.len() {
            return Err(Error::dimension(format!(
                "ZipMap has {} labels but scores of shape {:?}",
                self.keys.len(),
                x.shape()
            )));
        }
        let scores = x.to_f64_vec()?;
        let maps = scores
            .chunks(columns)
            .map(|row| Value::Map(self.keys.iter().cloned().zip(row.iter().copied()).collect()))
            .collect();
        Ok(vec![Value::Sequence(maps)])
    }
}

/// Selects columns of the last axis; a 1-D input yields one row.
struct ArrayFeatureExtractorOp;

impl OpKernel for ArrayFeatureExtractorOp {
    fn op_type(&self) -> &str {
        "ArrayFeatureExtractor"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "ArrayFeatureExtractor")?;
        let requested = tensor_input(inputs, 1, "ArrayFeatureExtractor")?.to_i64_vec()?;
        let axis = x
            .ndim()
            .checked_sub(1)
            .ok_or_else(|| Error::dimension("ArrayFeatureExtractor needs at least one axis"))?;
        let width = x.shape()[axis];
        let indices = requested
            .iter()
            .map(|&i| {
                usize::try_from(i).ok().filter(|&i| i < width).ok_or_else(|| {
                    Error::dimension(format!("feature index {i} out of range for {width} columns"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let out = x.select(axis, &indices)?;
        if x.ndim() == 1 {
            return single(out.reshape(&[1, indices.len()])?);
        }
        single(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(shape: &[usize], data: Vec<f32>) -> Value {
        Value::from(Tensor::from_vec(shape.to_vec(), data).unwrap())
    }

    fn linear(coefficients: Vec<f64>, intercepts: Vec<f64>, rows: usize) -> Linear {
        Linear {
            coefficients,
            intercepts,
            rows,
        }
    }

    #[test]
    fn test_binarizer_keeps_dtype() {
        let x = floats(&[3], vec![-1.0, 0.5, 2.0]);
        let out = BinarizerOp { threshold: 0.5 }.execute(&[&x]).unwrap();
        let out = out[0].as_tensor().unwrap();
        assert_eq!(out.dtype(), DataType::F32);
        assert_eq!(out.to_f64_vec().unwrap(), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_scaler_casts_integers() {
        let x = Value::from(Tensor::from_vec(vec![2, 2], vec![1i64, 2, 3, 4]).unwrap());
        let op = ScalerOp {
            offset: vec![1.0, 2.0],
            scale: vec![2.0],
            dtype: DataType::F64,
        };
        let out = op.execute(&[&x]).unwrap().remove(0).into_tensor().unwrap();
        assert_eq!(out.dtype(), DataType::F64);
        assert_eq!(out.to_f64_vec().unwrap(), vec![0.0, 0.0, 4.0, 4.0]);
    }

    #[test]
    fn test_linear_regressor_with_two_targets() {
        let op = LinearRegressorOp {
            linear: linear(vec![1.0, 2.0, 0.0, -1.0], vec![0.5, 0.0], 2),
            post_transform: PostTransform::None,
            dtype: DataType::F32,
        };
        let x = floats(&[1, 2], vec![3.0, 4.0]);
        let out = op.execute(&[&x]).unwrap().remove(0).into_tensor().unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        assert_eq!(out.to_f64_vec().unwrap(), vec![11.5, -4.0]);
    }

    #[test]
    fn test_binary_linear_classifier() {
        let op = LinearClassifierOp {
            linear: linear(vec![1.0], vec![0.0], 1),
            labels: ClassLabels::Ints(vec![0, 1]),
            post_transform: PostTransform::None,
            dtype: DataType::F32,
        };
        let x = floats(&[2, 1], vec![-2.0, 3.0]);
        let out = op.execute(&[&x]).unwrap();
        let labels = out[0].as_tensor().unwrap();
        let scores = out[1].as_tensor().unwrap();
        assert_eq!(labels.to_i64_vec().unwrap(), vec![0, 1]);
        assert_eq!(scores.to_f64_vec().unwrap(), vec![2.0, -2.0, -3.0, 3.0]);
    }

    #[test]
    fn test_multiclass_linear_classifier_softmax() {
        let op = LinearClassifierOp {
            linear: linear(vec![1.0, 0.0, 0.0, 1.0, 0.0, 0.0], vec![], 3),
            labels: ClassLabels::Strings(vec!["a".into(), "b".into(), "c".into()]),
            post_transform: PostTransform::Softmax,
            dtype: DataType::F32,
        };
        let x = floats(&[1, 2], vec![0.0, 5.0]);
        let out = op.execute(&[&x]).unwrap();
        assert_eq!(
            out[0].as_tensor().unwrap(),
            &Tensor::from_vec(vec![1], vec!["b".to_string()]).unwrap()
        );
        let total: f64 = out[1].as_tensor().unwrap().to_f64_vec().unwrap().iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zipmap_builds_maps() {
        let op = ZipMapOp {
            keys: ClassLabels::Ints(vec![3, 7]).keys(),
        };
        let x = floats(&[2, 2], vec![0.25, 0.75, 1.0, 0.0]);
        let out = op.execute(&[&x]).unwrap().remove(0);
        let Value::Sequence(maps) = out else {
            panic!("expected a sequence");
        };
        assert_eq!(maps.len(), 2);
        let Value::Map(first) = &maps[0] else {
            panic!("expected a map");
        };
        assert_eq!(first["3"], 0.25);
        assert_eq!(first["7"], 0.75);

        let wrong = floats(&[1, 3], vec![0.0; 3]);
        assert!(op.execute(&[&wrong]).is_err());
    }

    #[test]
    fn test_array_feature_extractor() {
        let x = floats(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let idx = Value::from(Tensor::from_vec(vec![2], vec![2i64, 0]).unwrap());
        let out = ArrayFeatureExtractorOp.execute(&[&x, &idx]).unwrap().remove(0);
        let out = out.as_tensor().unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.to_f64_vec().unwrap(), vec![3.0, 1.0, 6.0, 4.0]);

        let row = floats(&[3], vec![1.0, 2.0, 3.0]);
        let out = ArrayFeatureExtractorOp.execute(&[&row, &idx]).unwrap().remove(0);
        assert_eq!(out.as_tensor().unwrap().shape(), &[1, 2]);

        let bad = Value::from(Tensor::from_vec(vec![1], vec![3i64]).unwrap());
        assert!(ArrayFeatureExtractorOp.execute(&[&x, &bad]).is_err());
    }

    #[test]
    fn test_argmax_skips_nan_and_keeps_first() {
        let row = [f64::NAN, 2.0, 2.0, 1.0];
        assert_eq!(argmax(ArrayView1::from(&row[..])), 1);
    }
}
