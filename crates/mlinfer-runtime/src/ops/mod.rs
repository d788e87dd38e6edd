// CPU operator kernels over ndarray
//
// Each module registers its kernels with the registry; the kernels share the
// input helpers and the broadcasting zip defined here.

mod math;
mod ml;
mod reduction;
mod scan;
mod tensor_ops;
pub mod tree_ensemble;

pub use scan::ScanKernel;

use mlinfer_core::{CoreError, DataType, NumericElement, Tensor, TensorElement, Value};
use ndarray::{ArrayD, ArrayView2, Axis, Ix2, IxDyn, LinalgScalar, ScalarOperand, Zip};
use num_traits::Float;

use crate::error::{Error, Result};
use crate::registry::KernelRegistry;

/// Trait for operator execution
///
/// Kernels are built once per node at planning time and must not keep
/// state between calls, since one kernel serves every concurrent run.
pub trait OpKernel: Send + Sync {
    /// Get the operator type name
    fn op_type(&self) -> &str;

    /// Execute the operator on the node's non-empty inputs, in order
    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>>;
}

/// Register every built-in kernel.
pub(crate) fn register_builtin(registry: &mut KernelRegistry) {
    math::register(registry);
    tensor_ops::register(registry);
    reduction::register(registry);
    ml::register(registry);
    scan::register(registry);
    tree_ensemble::register(registry);
}

/// The tensor at `index`, or a dimension error naming the operator.
pub(crate) fn tensor_input<'a>(inputs: &[&'a Value], index: usize, op: &str) -> Result<&'a Tensor> {
    let value = inputs.get(index).ok_or_else(|| {
        Error::dimension(format!(
            "{op} expects input {index}, got {} inputs",
            inputs.len()
        ))
    })?;
    Ok(value.as_tensor()?)
}

/// Resolve a possibly negative axis against `rank`.
pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if resolved < 0 || resolved >= rank_i {
        return Err(Error::dimension(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(resolved as usize)
}

/// Element-wise `f` over two arrays under numpy broadcasting.
pub(crate) fn broadcast_zip<A, B, R, F>(a: &ArrayD<A>, b: &ArrayD<B>, f: F) -> Result<ArrayD<R>>
where
    F: Fn(&A, &B) -> R,
{
    let shape = Tensor::broadcast_shape(a.shape(), b.shape())?;
    let fail = || {
        Error::dimension(format!(
            "cannot broadcast {:?} with {:?}",
            a.shape(),
            b.shape()
        ))
    };
    let a = a.broadcast(IxDyn(&shape)).ok_or_else(fail)?;
    let b = b.broadcast(IxDyn(&shape)).ok_or_else(fail)?;
    Ok(Zip::from(&a).and(&b).map_collect(|x, y| f(x, y)))
}

/// Floating point element types the float kernels are generic over.
pub(crate) trait FloatElement:
    TensorElement + Float + LinalgScalar + ScalarOperand + std::iter::Sum
{
}

impl FloatElement for f32 {}
impl FloatElement for f64 {}

/// A type error for an operator that does not accept `actual`.
pub(crate) fn unsupported_type(op: &str, expected: &str, actual: DataType) -> Error {
    Error::Core(CoreError::TypeMismatch {
        expected: format!("{expected} for {op}"),
        actual: actual.to_string(),
    })
}

/// First element of `tensor` converted to `T`.
pub(crate) fn scalar_value<T: NumericElement>(tensor: &Tensor) -> Result<T> {
    let cast = tensor.cast(T::DTYPE)?;
    let value = cast
        .view::<T>()?
        .iter()
        .next()
        .copied()
        .ok_or_else(|| Error::dimension("expected a scalar, got an empty tensor"))?;
    Ok(value)
}

/// View a `[F]` or `[N, F]` array as a matrix of rows.
pub(crate) fn matrix_view<'a, T>(x: &'a ArrayD<T>, op: &str) -> Result<ArrayView2<'a, T>> {
    let view = match x.ndim() {
        1 => x.view().insert_axis(Axis(0)),
        2 => x.view(),
        rank => {
            return Err(Error::dimension(format!(
                "{op} expects a 1-D or 2-D input, got rank {rank}"
            )))
        }
    };
    Ok(view.into_dimensionality::<Ix2>().map_err(CoreError::from)?)
}

/// Single tensor output.
pub(crate) fn single(tensor: Tensor) -> Result<Vec<Value>> {
    Ok(vec![Value::Tensor(tensor)])
}
