// Index and sum reductions along axes

use mlinfer_core::{with_numeric_type, NumericElement, Tensor, TensorElement, Value};
use ndarray::{ArrayD, Axis};

use super::{normalize_axis, single, tensor_input, unsupported_type, OpKernel};
use crate::attributes::AttributeSchema;
use crate::error::{Error, Result};
use crate::registry::{Arity, KernelDescriptor, KernelRegistry};

pub(super) fn register(registry: &mut KernelRegistry) {
    for (name, largest) in [("ArgMax", true), ("ArgMin", false)] {
        registry.register(
            KernelDescriptor::new(name, "", Arity::Unary, move |_, attrs| {
                Ok(Box::new(ArgReduceOp {
                    name,
                    largest,
                    axis: attrs.int("axis").unwrap_or(0),
                    keepdims: attrs.int("keepdims").unwrap_or(1) != 0,
                    select_last: attrs.int("select_last_index").unwrap_or(0) != 0,
                }))
            })
            .with_schema(
                AttributeSchema::new()
                    .int("axis", 0)
                    .int("keepdims", 1)
                    .int("select_last_index", 0),
            ),
        );
    }
    for (name, mean) in [("ReduceSum", false), ("ReduceMean", true)] {
        registry.register(
            KernelDescriptor::new(
                name,
                "",
                Arity::Fixed {
                    inputs: (1, 2),
                    outputs: (1, 1),
                },
                move |_, attrs| {
                    Ok(Box::new(ReduceOp {
                        name,
                        mean,
                        axes: attrs.ints("axes").unwrap_or_default().to_vec(),
                        keepdims: attrs.int("keepdims").unwrap_or(1) != 0,
                        noop_with_empty_axes: attrs.int("noop_with_empty_axes").unwrap_or(0) != 0,
                    }))
                },
            )
            .with_schema(
                AttributeSchema::new()
                    .ints("axes", &[])
                    .int("keepdims", 1)
                    .int("noop_with_empty_axes", 0),
            ),
        );
    }
}

/// ArgMax / ArgMin: int64 indices of the extreme value along one axis.
/// Ties resolve to the first index unless `select_last_index` is set.
struct ArgReduceOp {
    name: &'static str,
    largest: bool,
    axis: i64,
    keepdims: bool,
    select_last: bool,
}

impl ArgReduceOp {
    fn reduce<T: NumericElement>(&self, x: &ArrayD<T>, axis: usize) -> ArrayD<i64> {
        let indices = x.map_axis(Axis(axis), |lane| {
            let mut best = 0;
            for (i, &v) in lane.iter().enumerate().skip(1) {
                let current = lane[best];
                let better = if self.largest { v > current } else { v < current };
                if better || (self.select_last && v == current) {
                    best = i;
                }
            }
            best as i64
        });
        if self.keepdims {
            indices.insert_axis(Axis(axis))
        } else {
            indices
        }
    }
}

impl OpKernel for ArgReduceOp {
    fn op_type(&self) -> &str {
        self.name
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, self.name)?;
        let axis = normalize_axis(self.axis, x.ndim())?;
        if x.shape()[axis] == 0 {
            return Err(Error::dimension(format!(
                "{} over empty axis {axis}",
                self.name
            )));
        }
        let indices = with_numeric_type!(
            x.dtype(),
            T => self.reduce::<T>(x.view::<T>()?, axis),
            _ => return Err(unsupported_type(self.name, "a numeric tensor", x.dtype()))
        );
        single(Tensor::I64(indices))
    }
}

/// ReduceSum / ReduceMean over the listed axes, or all axes when none are
/// given.
struct ReduceOp {
    name: &'static str,
    mean: bool,
    axes: Vec<i64>,
    keepdims: bool,
    noop_with_empty_axes: bool,
}

impl ReduceOp {
    fn reduce<T: NumericElement>(&self, x: &ArrayD<T>, axes: &[usize]) -> ArrayD<T> {
        let mut out = x.clone();
        for &axis in axes.iter().rev() {
            let count = out.shape()[axis];
            let mut reduced = out.fold_axis(Axis(axis), T::zero(), |acc, &v| acc.add(v));
            if self.mean {
                reduced.mapv_inplace(|v| T::from_f64(v.to_f64() / count as f64));
            }
            out = if self.keepdims {
                reduced.insert_axis(Axis(axis))
            } else {
                reduced
            };
        }
        out
    }
}

impl OpKernel for ReduceOp {
    fn op_type(&self) -> &str {
        self.name
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, self.name)?;
        // Opset 13+ passes the axes as an optional second input.
        let requested = match inputs.len() {
            2 => tensor_input(inputs, 1, self.name)?.to_i64_vec()?,
            _ => self.axes.clone(),
        };
        if requested.is_empty() && self.noop_with_empty_axes {
            return single(x.clone());
        }

        let rank = x.ndim();
        let mut axes = if requested.is_empty() {
            (0..rank).collect::<Vec<_>>()
        } else {
            requested
                .iter()
                .map(|&a| normalize_axis(a, rank))
                .collect::<Result<Vec<_>>>()?
        };
        axes.sort_unstable();
        axes.dedup();

        let out = with_numeric_type!(
            x.dtype(),
            T => T::wrap(self.reduce::<T>(x.view::<T>()?, &axes)),
            _ => return Err(unsupported_type(self.name, "a numeric tensor", x.dtype()))
        );
        single(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(largest: bool, axis: i64, keepdims: bool) -> ArgReduceOp {
        ArgReduceOp {
            name: if largest { "ArgMax" } else { "ArgMin" },
            largest,
            axis,
            keepdims,
            select_last: false,
        }
    }

    fn reduce(mean: bool, axes: Vec<i64>, keepdims: bool) -> ReduceOp {
        ReduceOp {
            name: if mean { "ReduceMean" } else { "ReduceSum" },
            mean,
            axes,
            keepdims,
            noop_with_empty_axes: false,
        }
    }

    fn run(kernel: &dyn OpKernel, x: Tensor) -> Tensor {
        let x = Value::from(x);
        kernel.execute(&[&x]).unwrap().remove(0).into_tensor().unwrap()
    }

    #[test]
    fn test_argmax_last_axis_first_tie() {
        let x = Tensor::from_vec(vec![2, 3], vec![1.0f32, 5.0, 5.0, 7.0, 2.0, 3.0]).unwrap();
        let out = run(&arg(true, -1, false), x);
        assert_eq!(out.shape(), &[2]);
        assert_eq!(out.to_i64_vec().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_argmin_keepdims_rank3() {
        let x = Tensor::from_vec(vec![2, 2, 2], vec![4i64, 3, 2, 1, 0, 9, 8, 7]).unwrap();
        let out = run(&arg(false, 0, true), x);
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out.to_i64_vec().unwrap(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_argmax_select_last_index() {
        let op = ArgReduceOp {
            select_last: true,
            ..arg(true, 0, false)
        };
        let x = Tensor::from_vec(vec![3], vec![2i32, 2, 1]).unwrap();
        assert_eq!(run(&op, x).to_i64_vec().unwrap(), vec![1]);
    }

    #[test]
    fn test_reduce_sum_and_mean() {
        let x = Tensor::from_vec(vec![2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let rows = run(&reduce(false, vec![1], false), x.clone());
        assert_eq!(rows.to_f64_vec().unwrap(), vec![6.0, 15.0]);

        let all = run(&reduce(true, vec![], true), x);
        assert_eq!(all.shape(), &[1, 1]);
        assert_eq!(all.to_f64_vec().unwrap(), vec![3.5]);
    }

    #[test]
    fn test_reduce_axes_from_input() {
        let x = Value::from(Tensor::from_vec(vec![2, 2], vec![1i64, 2, 3, 4]).unwrap());
        let axes = Value::from(Tensor::from_vec(vec![1], vec![0i64]).unwrap());
        let out = reduce(false, vec![], false).execute(&[&x, &axes]).unwrap();
        assert_eq!(out[0].as_tensor().unwrap().to_i64_vec().unwrap(), vec![4, 6]);
    }
}
