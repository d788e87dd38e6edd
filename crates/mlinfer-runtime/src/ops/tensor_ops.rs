// Shape manipulation, type conversion and selection

use std::cmp::Ordering;

use mlinfer_core::{
    with_element_type, with_numeric_type, AttributeKind, DataType, NumericElement, Tensor,
    TensorElement, Value,
};
use mlinfer_onnx::DataTypeMapper;
use ndarray::{ArrayD, Axis, IxDyn};

use super::{normalize_axis, scalar_value, single, tensor_input, unsupported_type, OpKernel};
use crate::attributes::AttributeSchema;
use crate::error::{Error, Result};
use crate::registry::{Arity, KernelDescriptor, KernelRegistry};

pub(super) fn register(registry: &mut KernelRegistry) {
    registry.register(
        KernelDescriptor::new("Reshape", "", Arity::Binary, |_, attrs| {
            Ok(Box::new(ReshapeOp {
                allow_zero: attrs.int("allowzero").unwrap_or(0) != 0,
            }))
        })
        .with_schema(AttributeSchema::new().int("allowzero", 0)),
    );
    registry.register(
        KernelDescriptor::new("Transpose", "", Arity::Unary, |ctx, attrs| {
            let perm = attrs
                .ints("perm")
                .unwrap_or_default()
                .iter()
                .map(|&p| usize::try_from(p).map_err(|_| ctx.unsupported(format!("negative perm entry {p}"))))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(TransposeOp {
                perm: (!perm.is_empty()).then_some(perm),
            }))
        })
        .with_schema(AttributeSchema::new().ints("perm", &[])),
    );
    registry.register(
        KernelDescriptor::new("Concat", "", Arity::Variadic { min: 1 }, |ctx, attrs| {
            let axis = attrs.int("axis").ok_or_else(|| ctx.missing_attribute("axis"))?;
            Ok(Box::new(ConcatOp { axis }))
        })
        .with_schema(AttributeSchema::new().required("axis", AttributeKind::Int)),
    );
    registry.register(
        KernelDescriptor::new(
            "Squeeze",
            "",
            Arity::Fixed {
                inputs: (1, 2),
                outputs: (1, 1),
            },
            |_, attrs| {
                Ok(Box::new(SqueezeOp {
                    axes: attrs.ints("axes").unwrap_or_default().to_vec(),
                }))
            },
        )
        .with_schema(AttributeSchema::new().ints("axes", &[])),
    );
    registry.register(KernelDescriptor::new("Shape", "", Arity::Unary, |_, _| {
        Ok(Box::new(ShapeOp))
    }));
    registry.register(
        KernelDescriptor::new("Cast", "", Arity::Unary, |ctx, attrs| {
            let to = attrs.int("to").ok_or_else(|| ctx.missing_attribute("to"))?;
            let code = i32::try_from(to).map_err(|_| ctx.unsupported(format!("cast target {to}")))?;
            let context = format!("Cast node '{}'", ctx.node.display_name());
            Ok(Box::new(CastOp {
                to: DataTypeMapper::from_onnx(code, &context)?,
            }))
        })
        .with_schema(AttributeSchema::new().required("to", AttributeKind::Int)),
    );
    registry.register(
        KernelDescriptor::new("ConstantOfShape", "", Arity::Unary, |_, attrs| {
            let value = attrs
                .tensor("value")
                .cloned()
                .unwrap_or_else(|| Tensor::scalar(0.0f32));
            Ok(Box::new(ConstantOfShapeOp { value }))
        })
        .with_schema(AttributeSchema::new().tensor("value", Tensor::scalar(0.0f32))),
    );
    registry.register(
        KernelDescriptor::new(
            "TopK",
            "",
            Arity::Fixed {
                inputs: (2, 2),
                outputs: (1, 2),
            },
            |_, attrs| {
                Ok(Box::new(TopKOp {
                    axis: attrs.int("axis").unwrap_or(-1),
                    largest: attrs.int("largest").unwrap_or(1) != 0,
                }))
            },
        )
        .with_schema(
            AttributeSchema::new()
                .int("axis", -1)
                .int("largest", 1)
                .int("sorted", 1),
        ),
    );
}

/// Reshape with ONNX conventions: `-1` infers one dimension, `0` copies
/// the input dimension unless `allowzero` is set.
struct ReshapeOp {
    allow_zero: bool,
}

impl ReshapeOp {
    fn target_shape(&self, input: &[usize], requested: &[i64]) -> Result<Vec<usize>> {
        let fail = || {
            Error::dimension(format!(
                "cannot reshape {input:?} to {requested:?}"
            ))
        };
        let mut inferred = None;
        let mut shape = Vec::with_capacity(requested.len());
        for (i, &dim) in requested.iter().enumerate() {
            let resolved = match dim {
                -1 if inferred.is_none() => {
                    inferred = Some(i);
                    1
                }
                0 if !self.allow_zero => *input.get(i).ok_or_else(fail)?,
                d if d >= 0 => d as usize,
                _ => return Err(fail()),
            };
            shape.push(resolved);
        }

        let total: usize = input.iter().product();
        if let Some(i) = inferred {
            let known: usize = shape.iter().product();
            if known == 0 || total % known != 0 {
                return Err(fail());
            }
            shape[i] = total / known;
        }
        if shape.iter().product::<usize>() != total {
            return Err(fail());
        }
        Ok(shape)
    }
}

impl OpKernel for ReshapeOp {
    fn op_type(&self) -> &str {
        "Reshape"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let data = tensor_input(inputs, 0, "Reshape")?;
        let requested = tensor_input(inputs, 1, "Reshape")?.to_i64_vec()?;
        let shape = self.target_shape(data.shape(), &requested)?;
        single(data.reshape(&shape)?)
    }
}

struct TransposeOp {
    perm: Option<Vec<usize>>,
}

impl OpKernel for TransposeOp {
    fn op_type(&self) -> &str {
        "Transpose"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let data = tensor_input(inputs, 0, "Transpose")?;
        single(data.transpose(self.perm.as_deref())?)
    }
}

struct ConcatOp {
    axis: i64,
}

impl OpKernel for ConcatOp {
    fn op_type(&self) -> &str {
        "Concat"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let tensors = (0..inputs.len())
            .map(|i| tensor_input(inputs, i, "Concat").map(Tensor::clone))
            .collect::<Result<Vec<_>>>()?;
        let rank = tensors.first().map(Tensor::ndim).unwrap_or(0);
        let axis = normalize_axis(self.axis, rank)?;
        single(Tensor::concat(&tensors, axis)?)
    }
}

/// Removes size-one axes: the listed ones, or all of them.
struct SqueezeOp {
    axes: Vec<i64>,
}

impl OpKernel for SqueezeOp {
    fn op_type(&self) -> &str {
        "Squeeze"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let data = tensor_input(inputs, 0, "Squeeze")?;
        // Newer opsets pass the axes as a second input.
        let axes = match inputs.len() {
            2 => tensor_input(inputs, 1, "Squeeze")?.to_i64_vec()?,
            _ => self.axes.clone(),
        };
        let rank = data.ndim();
        let drop = axes
            .iter()
            .map(|&a| normalize_axis(a, rank))
            .collect::<Result<Vec<_>>>()?;

        let mut shape = Vec::with_capacity(rank);
        for (i, &dim) in data.shape().iter().enumerate() {
            let listed = drop.contains(&i);
            if listed && dim != 1 {
                return Err(Error::dimension(format!(
                    "cannot squeeze axis {i} of size {dim}"
                )));
            }
            let squeezed = if drop.is_empty() { dim == 1 } else { listed };
            if !squeezed {
                shape.push(dim);
            }
        }
        single(data.reshape(&shape)?)
    }
}

struct ShapeOp;

impl OpKernel for ShapeOp {
    fn op_type(&self) -> &str {
        "Shape"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let data = tensor_input(inputs, 0, "Shape")?;
        let dims: Vec<i64> = data.shape().iter().map(|&d| d as i64).collect();
        single(Tensor::from_vec(vec![dims.len()], dims)?)
    }
}

struct CastOp {
    to: DataType,
}

impl OpKernel for CastOp {
    fn op_type(&self) -> &str {
        "Cast"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        single(tensor_input(inputs, 0, "Cast")?.cast(self.to)?)
    }
}

struct ConstantOfShapeOp {
    value: Tensor,
}

fn filled<T: TensorElement>(value: &Tensor, shape: &[usize]) -> Result<Tensor> {
    let fill = value
        .view::<T>()?
        .iter()
        .next()
        .cloned()
        .ok_or_else(|| Error::dimension("ConstantOfShape value must hold one element"))?;
    Ok(T::wrap(ArrayD::from_elem(IxDyn(shape), fill)))
}

impl OpKernel for ConstantOfShapeOp {
    fn op_type(&self) -> &str {
        "ConstantOfShape"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let dims = tensor_input(inputs, 0, "ConstantOfShape")?.to_i64_vec()?;
        let shape = dims
            .iter()
            .map(|&d| {
                usize::try_from(d)
                    .map_err(|_| Error::dimension(format!("negative dimension {d} in ConstantOfShape")))
            })
            .collect::<Result<Vec<_>>>()?;
        single(with_element_type!(self.value.dtype(), T => filled::<T>(&self.value, &shape)?))
    }
}

/// Largest (or smallest) `k` entries along an axis with their indices.
/// Ties keep the lower index first.
struct TopKOp {
    axis: i64,
    largest: bool,
}

fn topk_typed<T: NumericElement>(
    x: &ArrayD<T>,
    k: usize,
    axis: usize,
    largest: bool,
) -> Result<(ArrayD<T>, ArrayD<i64>)> {
    let n = x.shape()[axis];
    if k > n {
        return Err(Error::dimension(format!(
            "TopK k={k} exceeds axis length {n}"
        )));
    }
    let mut out_shape = x.shape().to_vec();
    out_shape[axis] = k;
    let mut values = ArrayD::from_elem(IxDyn(&out_shape), T::zero());
    let mut indices = ArrayD::<i64>::zeros(IxDyn(&out_shape));

    let lanes = x
        .lanes(Axis(axis))
        .into_iter()
        .zip(values.lanes_mut(Axis(axis)))
        .zip(indices.lanes_mut(Axis(axis)));
    for ((lane, mut value_lane), mut index_lane) in lanes {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&i, &j| {
            let ord = lane[i].partial_cmp(&lane[j]).unwrap_or(Ordering::Equal);
            if largest {
                ord.reverse()
            } else {
                ord
            }
        });
        for (slot, &i) in order.iter().take(k).enumerate() {
            value_lane[slot] = lane[i];
            index_lane[slot] = i as i64;
        }
    }
    Ok((values, indices))
}

impl OpKernel for TopKOp {
    fn op_type(&self) -> &str {
        "TopK"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "TopK")?;
        let k = scalar_value::<i64>(tensor_input(inputs, 1, "TopK")?)?;
        let k = usize::try_from(k).map_err(|_| Error::dimension(format!("TopK k={k} is negative")))?;
        let axis = normalize_axis(self.axis, x.ndim())?;
        let (values, indices) = with_numeric_type!(
            x.dtype(),
            T => {
                let (values, indices) = topk_typed::<T>(x.view::<T>()?, k, axis, self.largest)?;
                (T::wrap(values), indices)
            },
            _ => return Err(unsupported_type("TopK", "a numeric tensor", x.dtype()))
        );
        Ok(vec![Value::Tensor(values), Value::Tensor(Tensor::I64(indices))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kernel: &dyn OpKernel, inputs: &[Value]) -> Vec<Tensor> {
        let refs: Vec<&Value> = inputs.iter().collect();
        kernel
            .execute(&refs)
            .unwrap()
            .into_iter()
            .map(|v| v.into_tensor().unwrap())
            .collect()
    }

    fn ints(shape: &[usize], data: Vec<i64>) -> Value {
        Value::from(Tensor::from_vec(shape.to_vec(), data).unwrap())
    }

    #[test]
    fn test_reshape_infers_and_copies() {
        let op = ReshapeOp { allow_zero: false };
        assert_eq!(op.target_shape(&[2, 3, 4], &[0, -1]).unwrap(), vec![2, 12]);
        assert_eq!(op.target_shape(&[6], &[3, -1]).unwrap(), vec![3, 2]);
        assert!(op.target_shape(&[6], &[4, -1]).is_err());
        assert!(op.target_shape(&[6], &[-1, -1]).is_err());
    }

    #[test]
    fn test_squeeze_all_and_listed() {
        let x = Value::from(Tensor::from_vec(vec![1, 3, 1], vec![1.0f32, 2.0, 3.0]).unwrap());
        let all = run(&SqueezeOp { axes: vec![] }, &[x.clone()]);
        assert_eq!(all[0].shape(), &[3]);

        let first = run(&SqueezeOp { axes: vec![] }, &[x.clone(), ints(&[1], vec![0])]);
        assert_eq!(first[0].shape(), &[3, 1]);

        let op = SqueezeOp { axes: vec![1] };
        assert!(op.execute(&[&x]).is_err());
    }

    #[test]
    fn test_shape_and_constant_of_shape() {
        let x = Value::from(Tensor::from_vec(vec![2, 3], vec![0i32; 6]).unwrap());
        let shape = run(&ShapeOp, &[x]).remove(0);
        assert_eq!(shape.to_i64_vec().unwrap(), vec![2, 3]);

        let op = ConstantOfShapeOp {
            value: Tensor::from_vec(vec![1], vec![7i64]).unwrap(),
        };
        let filled = run(&op, &[Value::from(shape)]).remove(0);
        assert_eq!(filled.shape(), &[2, 3]);
        assert_eq!(filled.to_i64_vec().unwrap(), vec![7; 6]);
    }

    #[test]
    fn test_topk_largest_with_ties() {
        let x = Value::from(
            Tensor::from_vec(vec![2, 3], vec![1.0f32, 3.0, 3.0, 5.0, 4.0, 6.0]).unwrap(),
        );
        let op = TopKOp {
            axis: -1,
            largest: true,
        };
        let out = run(&op, &[x, ints(&[1], vec![2])]);
        assert_eq!(out[0].to_f64_vec().unwrap(), vec![3.0, 3.0, 6.0, 5.0]);
        assert_eq!(out[1].to_i64_vec().unwrap(), vec![1, 2, 2, 0]);
    }

    #[test]
    fn test_cast_and_concat() {
        let x = Value::from(Tensor::from_vec(vec![2], vec![1.7f64, -0.2]).unwrap());
        let cast = run(&CastOp { to: DataType::I64 }, &[x]).remove(0);
        assert_eq!(cast.to_i64_vec().unwrap(), vec![1, 0]);

        let joined = run(
            &ConcatOp { axis: -1 },
            &[ints(&[1, 1], vec![1]), ints(&[1, 2], vec![2, 3])],
        )
        .remove(0);
        assert_eq!(joined.shape(), &[1, 3]);
        assert_eq!(joined.to_i64_vec().unwrap(), vec![1, 2, 3]);
    }
}
