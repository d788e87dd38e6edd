// Element-wise math, comparisons and matrix products

use mlinfer_core::{
    with_element_type, with_numeric_type, AttributeKind, CoreError, DataType, NumericElement,
    Tensor, TensorElement, Value,
};
use ndarray::{ArrayD, Axis, Ix2, IxDyn, Zip};

use super::{
    broadcast_zip, normalize_axis, scalar_value, single, tensor_input, unsupported_type,
    FloatElement, OpKernel,
};
use crate::attributes::AttributeSchema;
use crate::error::{Error, Result};
use crate::registry::{Arity, KernelDescriptor, KernelRegistry};

pub(super) fn register(registry: &mut KernelRegistry) {
    for op in UnaryOp::ALL {
        registry.register(KernelDescriptor::new(op.name(), "", Arity::Unary, move |_, _| {
            Ok(Box::new(UnaryKernel { op }))
        }));
    }
    for op in BinaryOp::ALL {
        registry.register(KernelDescriptor::new(op.name(), "", Arity::Binary, move |_, _| {
            Ok(Box::new(BinaryKernel { op }))
        }));
    }
    for op in CompareOp::ALL {
        registry.register(KernelDescriptor::new(op.name(), "", Arity::Binary, move |_, _| {
            Ok(Box::new(CompareKernel { op }))
        }));
    }
    for op in VariadicOp::ALL {
        registry.register(KernelDescriptor::new(
            op.name(),
            "",
            Arity::Variadic { min: 1 },
            move |_, _| Ok(Box::new(VariadicKernel { op })),
        ));
    }

    registry.register(KernelDescriptor::new("Not", "", Arity::Unary, |_, _| {
        Ok(Box::new(NotOp))
    }));
    registry.register(KernelDescriptor::new("Identity", "", Arity::Unary, |_, _| {
        Ok(Box::new(IdentityOp))
    }));
    registry.register(KernelDescriptor::new(
        "Where",
        "",
        Arity::Fixed {
            inputs: (3, 3),
            outputs: (1, 1),
        },
        |_, _| Ok(Box::new(WhereOp)),
    ));
    registry.register(
        KernelDescriptor::new(
            "Clip",
            "",
            Arity::Fixed {
                inputs: (1, 3),
                outputs: (1, 1),
            },
            |ctx, attrs| {
                let slot = |i: usize| ctx.node.inputs.get(i).is_some_and(|n| !n.is_empty());
                Ok(Box::new(ClipOp {
                    min_input: slot(1),
                    max_input: slot(2),
                    min_attr: attrs.float("min"),
                    max_attr: attrs.float("max"),
                }))
            },
        )
        .with_schema(
            AttributeSchema::new()
                .optional("min", AttributeKind::Float)
                .optional("max", AttributeKind::Float),
        ),
    );
    registry.register(KernelDescriptor::new("MatMul", "", Arity::Binary, |_, _| {
        Ok(Box::new(MatMulOp))
    }));
    registry.register(
        KernelDescriptor::new(
            "Gemm",
            "",
            Arity::Fixed {
                inputs: (2, 3),
                outputs: (1, 1),
            },
            |_, attrs| {
                Ok(Box::new(GemmOp {
                    alpha: attrs.float("alpha").unwrap_or(1.0),
                    beta: attrs.float("beta").unwrap_or(1.0),
                    trans_a: attrs.int("transA").unwrap_or(0) != 0,
                    trans_b: attrs.int("transB").unwrap_or(0) != 0,
                }))
            },
        )
        .with_schema(
            AttributeSchema::new()
                .float("alpha", 1.0)
                .float("beta", 1.0)
                .int("transA", 0)
                .int("transB", 0),
        ),
    );
    registry.register(
        KernelDescriptor::new("Softmax", "", Arity::Unary, |_, attrs| {
            Ok(Box::new(SoftmaxOp {
                axis: attrs.int("axis").unwrap_or(-1),
            }))
        })
        .with_schema(AttributeSchema::new().int("axis", -1)),
    );
}

/// Single-input element-wise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Abs,
    Ceil,
    Exp,
    Floor,
    Log,
    Reciprocal,
    Relu,
    Sigmoid,
    Sign,
    Sin,
    Sqrt,
}

impl UnaryOp {
    const ALL: [UnaryOp; 11] = [
        UnaryOp::Abs,
        UnaryOp::Ceil,
        UnaryOp::Exp,
        UnaryOp::Floor,
        UnaryOp::Log,
        UnaryOp::Reciprocal,
        UnaryOp::Relu,
        UnaryOp::Sigmoid,
        UnaryOp::Sign,
        UnaryOp::Sin,
        UnaryOp::Sqrt,
    ];

    fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "Abs",
            UnaryOp::Ceil => "Ceil",
            UnaryOp::Exp => "Exp",
            UnaryOp::Floor => "Floor",
            UnaryOp::Log => "Log",
            UnaryOp::Reciprocal => "Reciprocal",
            UnaryOp::Relu => "Relu",
            UnaryOp::Sigmoid => "Sigmoid",
            UnaryOp::Sign => "Sign",
            UnaryOp::Sin => "Sin",
            UnaryOp::Sqrt => "Sqrt",
        }
    }

    /// Operators that are also defined on integers.
    fn accepts_integers(self) -> bool {
        matches!(self, UnaryOp::Abs | UnaryOp::Relu | UnaryOp::Sign)
    }

    fn apply<T: FloatElement>(self, x: T) -> T {
        match self {
            UnaryOp::Abs => x.abs(),
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Reciprocal => x.recip(),
            // NaN passes through.
            UnaryOp::Relu => {
                if x < T::zero() {
                    T::zero()
                } else {
                    x
                }
            }
            UnaryOp::Sigmoid => T::one() / (T::one() + (-x).exp()),
            UnaryOp::Sign => {
                if x > T::zero() {
                    T::one()
                } else if x < T::zero() {
                    -T::one()
                } else {
                    x
                }
            }
            UnaryOp::Sin => x.sin(),
            UnaryOp::Sqrt => x.sqrt(),
        }
    }

    fn apply_int<T: NumericElement>(self, x: T) -> T {
        match self {
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sign => x.signum(),
            UnaryOp::Relu if x < T::zero() => T::zero(),
            _ => x,
        }
    }
}

struct UnaryKernel {
    op: UnaryOp,
}

impl OpKernel for UnaryKernel {
    fn op_type(&self) -> &str {
        self.op.name()
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let op = self.op;
        let out = match tensor_input(inputs, 0, op.name())? {
            Tensor::F32(a) => Tensor::F32(a.mapv(|v| op.apply(v))),
            Tensor::F64(a) => Tensor::F64(a.mapv(|v| op.apply(v))),
            Tensor::I32(a) if op.accepts_integers() => Tensor::I32(a.mapv(|v| op.apply_int(v))),
            Tensor::I64(a) if op.accepts_integers() => Tensor::I64(a.mapv(|v| op.apply_int(v))),
            other => return Err(unsupported_type(op.name(), "float or double", other.dtype())),
        };
        single(out)
    }
}

/// Broadcasting arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    const ALL: [BinaryOp; 5] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Pow,
    ];

    fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::Div => "Div",
            BinaryOp::Pow => "Pow",
        }
    }

    fn apply<T: NumericElement>(self, a: T, b: T) -> T {
        match self {
            BinaryOp::Add => a.add(b),
            BinaryOp::Sub => a.sub(b),
            BinaryOp::Mul => a.mul(b),
            // Integer zero divisors are rejected before the zip.
            BinaryOp::Div => a.checked_div(b).unwrap_or_else(T::zero),
            BinaryOp::Pow => a.pow(b),
        }
    }
}

struct BinaryKernel {
    op: BinaryOp,
}

fn binary_typed<T: NumericElement>(a: &Tensor, b: &Tensor, op: BinaryOp) -> Result<Tensor> {
    let b = b.view::<T>()?;
    if op == BinaryOp::Div && !T::DTYPE.is_float() && b.iter().any(|&v| v == T::zero()) {
        return Err(Error::Core(CoreError::InvalidArgument(
            "integer division by zero".to_string(),
        )));
    }
    Ok(T::wrap(broadcast_zip(a.view::<T>()?, b, |&x, &y| {
        op.apply(x, y)
    })?))
}

impl OpKernel for BinaryKernel {
    fn op_type(&self) -> &str {
        self.op.name()
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let a = tensor_input(inputs, 0, self.op.name())?;
        let b = tensor_input(inputs, 1, self.op.name())?;
        // Pow takes its exponent in any numeric type.
        let b = if self.op == BinaryOp::Pow && a.dtype() != b.dtype() {
            b.cast(a.dtype())?
        } else {
            b.clone()
        };
        let out = with_numeric_type!(
            a.dtype(),
            T => binary_typed::<T>(a, &b, self.op)?,
            _ => return Err(unsupported_type(self.op.name(), "a numeric tensor", a.dtype()))
        );
        single(out)
    }
}

/// Broadcasting comparisons producing booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Greater,
    Less,
    Equal,
}

impl CompareOp {
    const ALL: [CompareOp; 3] = [CompareOp::Greater, CompareOp::Less, CompareOp::Equal];

    fn name(self) -> &'static str {
        match self {
            CompareOp::Greater => "Greater",
            CompareOp::Less => "Less",
            CompareOp::Equal => "Equal",
        }
    }

    fn apply<T: PartialOrd>(self, a: &T, b: &T) -> bool {
        match self {
            CompareOp::Greater => a > b,
            CompareOp::Less => a < b,
            CompareOp::Equal => a == b,
        }
    }
}

struct CompareKernel {
    op: CompareOp,
}

fn compare_typed<T: TensorElement + PartialOrd>(a: &Tensor, b: &Tensor, op: CompareOp) -> Result<Tensor> {
    let out = broadcast_zip(a.view::<T>()?, b.view::<T>()?, |x, y| op.apply(x, y))?;
    Ok(Tensor::Bool(out))
}

impl OpKernel for CompareKernel {
    fn op_type(&self) -> &str {
        self.op.name()
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let a = tensor_input(inputs, 0, self.op.name())?;
        let b = tensor_input(inputs, 1, self.op.name())?;
        if a.dtype() != b.dtype() {
            return Err(unsupported_type(
                self.op.name(),
                &format!("a second input of type {}", a.dtype()),
                b.dtype(),
            ));
        }
        single(with_element_type!(a.dtype(), T => compare_typed::<T>(a, b, self.op)?))
    }
}

/// Folds over any number of broadcast inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VariadicOp {
    Max,
    Min,
    Sum,
    Mean,
}

impl VariadicOp {
    const ALL: [VariadicOp; 4] = [
        VariadicOp::Max,
        VariadicOp::Min,
        VariadicOp::Sum,
        VariadicOp::Mean,
    ];

    fn name(self) -> &'static str {
        match self {
            VariadicOp::Max => "Max",
            VariadicOp::Min => "Min",
            VariadicOp::Sum => "Sum",
            VariadicOp::Mean => "Mean",
        }
    }

    fn combine<T: NumericElement>(self, a: T, b: T) -> T {
        match self {
            // NaN on either side wins.
            VariadicOp::Max => {
                if a.is_nan() || a >= b {
                    a
                } else {
                    b
                }
            }
            VariadicOp::Min => {
                if a.is_nan() || a <= b {
                    a
                } else {
                    b
                }
            }
            VariadicOp::Sum | VariadicOp::Mean => a.add(b),
        }
    }
}

struct VariadicKernel {
    op: VariadicOp,
}

fn fold_typed<T: NumericElement>(tensors: &[&Tensor], op: VariadicOp) -> Result<Tensor> {
    let (first, rest) = tensors
        .split_first()
        .ok_or_else(|| Error::dimension(format!("{} needs at least one input", op.name())))?;
    let mut acc: ArrayD<T> = first.view::<T>()?.clone();
    for tensor in rest {
        acc = broadcast_zip(&acc, tensor.view::<T>()?, |&x, &y| op.combine(x, y))?;
    }
    if op == VariadicOp::Mean {
        let count = T::from_f64(tensors.len() as f64);
        acc.mapv_inplace(|v| v.checked_div(count).unwrap_or(v));
    }
    Ok(T::wrap(acc))
}

impl OpKernel for VariadicKernel {
    fn op_type(&self) -> &str {
        self.op.name()
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let tensors = (0..inputs.len())
            .map(|i| tensor_input(inputs, i, self.op.name()))
            .collect::<Result<Vec<_>>>()?;
        let dtype = tensors
            .first()
            .map(|t| t.dtype())
            .ok_or_else(|| Error::dimension(format!("{} needs at least one input", self.op.name())))?;
        if self.op == VariadicOp::Mean && !dtype.is_float() {
            return Err(unsupported_type("Mean", "float or double", dtype));
        }
        let out = with_numeric_type!(
            dtype,
            T => fold_typed::<T>(&tensors, self.op)?,
            _ => return Err(unsupported_type(self.op.name(), "a numeric tensor", dtype))
        );
        single(out)
    }
}

struct NotOp;

impl OpKernel for NotOp {
    fn op_type(&self) -> &str {
        "Not"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "Not")?;
        let x = x
            .view::<bool>()
            .map_err(|_| unsupported_type("Not", "bool", x.dtype()))?;
        single(Tensor::Bool(x.mapv(|v| !v)))
    }
}

struct IdentityOp;

impl OpKernel for IdentityOp {
    fn op_type(&self) -> &str {
        "Identity"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let value = inputs
            .first()
            .ok_or_else(|| Error::dimension("Identity expects one input"))?;
        Ok(vec![(*value).clone()])
    }
}

struct WhereOp;

fn where_typed<T: TensorElement>(cond: &ArrayD<bool>, x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let x = x.view::<T>()?;
    let y = y.view::<T>()?;
    let shape = Tensor::broadcast_shape(
        &Tensor::broadcast_shape(cond.shape(), x.shape())?,
        y.shape(),
    )?;
    let fail = || Error::dimension(format!("Where cannot broadcast to {shape:?}"));
    let c = cond.broadcast(IxDyn(&shape)).ok_or_else(fail)?;
    let xv = x.broadcast(IxDyn(&shape)).ok_or_else(fail)?;
    let yv = y.broadcast(IxDyn(&shape)).ok_or_else(fail)?;
    Ok(T::wrap(Zip::from(&c).and(&xv).and(&yv).map_collect(
        |&keep, a, b| if keep { a.clone() } else { b.clone() },
    )))
}

impl OpKernel for WhereOp {
    fn op_type(&self) -> &str {
        "Where"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let cond = tensor_input(inputs, 0, "Where")?;
        let cond = cond
            .view::<bool>()
            .map_err(|_| unsupported_type("Where", "a bool condition", cond.dtype()))?;
        let x = tensor_input(inputs, 1, "Where")?;
        let y = tensor_input(inputs, 2, "Where")?;
        single(with_element_type!(x.dtype(), T => where_typed::<T>(cond, x, y)?))
    }
}

struct ClipOp {
    min_input: bool,
    max_input: bool,
    min_attr: Option<f64>,
    max_attr: Option<f64>,
}

impl ClipOp {
    fn bound<T: NumericElement>(
        &self,
        inputs: &[&Value],
        present: bool,
        index: usize,
        attr: Option<f64>,
    ) -> Result<Option<T>> {
        if present {
            scalar_value::<T>(tensor_input(inputs, index, "Clip")?).map(Some)
        } else {
            Ok(attr.map(T::from_f64))
        }
    }

    fn clip<T: NumericElement>(&self, inputs: &[&Value], x: &Tensor) -> Result<Tensor> {
        // Inputs arrive without the omitted slots.
        let max_index = if self.min_input { 2 } else { 1 };
        let lo = self.bound::<T>(inputs, self.min_input, 1, self.min_attr)?;
        let hi = self.bound::<T>(inputs, self.max_input, max_index, self.max_attr)?;
        Ok(T::wrap(x.view::<T>()?.mapv(|v| {
            let v = match lo {
                Some(lo) if v < lo => lo,
                _ => v,
            };
            match hi {
                Some(hi) if v > hi => hi,
                _ => v,
            }
        })))
    }
}

impl OpKernel for ClipOp {
    fn op_type(&self) -> &str {
        "Clip"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "Clip")?;
        let out = with_numeric_type!(
            x.dtype(),
            T => self.clip::<T>(inputs, x)?,
            _ => return Err(unsupported_type("Clip", "a numeric tensor", x.dtype()))
        );
        single(out)
    }
}

struct MatMulOp;

fn matmul_typed<T: NumericElement + ndarray::LinalgScalar>(
    a: &ArrayD<T>,
    b: &ArrayD<T>,
) -> Result<ArrayD<T>> {
    let shape_error = || {
        Error::dimension(format!(
            "MatMul cannot multiply {:?} by {:?}",
            a.shape(),
            b.shape()
        ))
    };
    if b.ndim() > 2 || a.ndim() == 0 || b.ndim() == 0 {
        return Err(shape_error());
    }

    let b2 = match b.ndim() {
        1 => b.view().insert_axis(Axis(1)),
        _ => b.view(),
    }
    .into_dimensionality::<Ix2>()
    .map_err(CoreError::from)?;

    // Leading axes of `a` are flattened into rows.
    let k = a.shape()[a.ndim() - 1];
    let rows: usize = a.shape()[..a.ndim() - 1].iter().product();
    if k != b2.nrows() {
        return Err(shape_error());
    }
    let a2 = a
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((rows, k))
        .map_err(CoreError::from)?;
    let product = a2.dot(&b2);

    let mut shape: Vec<usize> = a.shape()[..a.ndim() - 1].to_vec();
    if b.ndim() == 2 {
        shape.push(b2.ncols());
    }
    Ok(product
        .into_shape_with_order(IxDyn(&shape))
        .map_err(CoreError::from)?)
}

impl OpKernel for MatMulOp {
    fn op_type(&self) -> &str {
        "MatMul"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let a = tensor_input(inputs, 0, "MatMul")?;
        let b = tensor_input(inputs, 1, "MatMul")?;
        let out = with_numeric_type!(
            a.dtype(),
            T => T::wrap(matmul_typed::<T>(a.view::<T>()?, b.view::<T>()?)?),
            _ => return Err(unsupported_type("MatMul", "a numeric tensor", a.dtype()))
        );
        single(out)
    }
}

struct GemmOp {
    alpha: f64,
    beta: f64,
    trans_a: bool,
    trans_b: bool,
}

impl GemmOp {
    fn gemm<T: FloatElement>(&self, a: &Tensor, b: &Tensor, c: Option<&Tensor>) -> Result<Tensor> {
        let to_matrix = |t: &Tensor, transpose: bool| -> Result<ndarray::Array2<T>> {
            let m = t
                .view::<T>()?
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|_| Error::dimension(format!("Gemm expects matrices, got {:?}", t.shape())))?;
            Ok(if transpose {
                m.t().to_owned()
            } else {
                m.to_owned()
            })
        };
        let a = to_matrix(a, self.trans_a)?;
        let b = to_matrix(b, self.trans_b)?;
        if a.ncols() != b.nrows() {
            return Err(Error::dimension(format!(
                "Gemm inner dimensions differ: {:?} x {:?}",
                a.shape(),
                b.shape()
            )));
        }
        let alpha = num_traits::cast(self.alpha).unwrap_or_else(T::one);
        let mut y = a.dot(&b) * alpha;
        if let Some(c) = c {
            let beta = num_traits::cast(self.beta).unwrap_or_else(T::one);
            let c = c.cast(T::DTYPE)?;
            let c = c
                .view::<T>()?
                .broadcast(IxDyn(y.shape()))
                .ok_or_else(|| {
                    Error::dimension(format!(
                        "Gemm bias {:?} does not broadcast to {:?}",
                        c.shape(),
                        y.shape()
                    ))
                })?
                .into_dimensionality::<Ix2>()
                .map_err(CoreError::from)?;
            y.zip_mut_with(&c, |acc, &bias| *acc = *acc + beta * bias);
        }
        Ok(T::wrap(y.into_dyn()))
    }
}

impl OpKernel for GemmOp {
    fn op_type(&self) -> &str {
        "Gemm"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let a = tensor_input(inputs, 0, "Gemm")?;
        let b = tensor_input(inputs, 1, "Gemm")?.cast(a.dtype())?;
        let c = match inputs.len() {
            3 => Some(tensor_input(inputs, 2, "Gemm")?),
            _ => None,
        };
        let out = match a.dtype() {
            DataType::F32 => self.gemm::<f32>(a, &b, c)?,
            DataType::F64 => self.gemm::<f64>(a, &b, c)?,
            other => return Err(unsupported_type("Gemm", "float or double", other)),
        };
        single(out)
    }
}

struct SoftmaxOp {
    axis: i64,
}

fn softmax_typed<T: FloatElement>(x: &ArrayD<T>, axis: usize) -> ArrayD<T> {
    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.iter().fold(T::neg_infinity(), |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum: T = lane.iter().copied().sum();
        lane.mapv_inplace(|v| v / sum);
    }
    out
}

impl OpKernel for SoftmaxOp {
    fn op_type(&self) -> &str {
        "Softmax"
    }

    fn execute(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        let x = tensor_input(inputs, 0, "Softmax")?;
        let axis = normalize_axis(self.axis, x.ndim())?;
        let out = match x {
            Tensor::F32(a) => Tensor::F32(softmax_typed(a, axis)),
            Tensor::F64(a) => Tensor::F64(softmax_typed(a, axis)),
            other => return Err(unsupported_type("Softmax", "float or double", other.dtype())),
        };
        single(out)
    }
}
