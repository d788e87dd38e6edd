//! End-to-end execution tests.
//!
//! Graphs are assembled with `GraphBuilder`, planned into a `Session` and
//! run with concrete inputs.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use mlinfer_core::logging::{init_logging, LoggingConfig};
use mlinfer_core::{
    AttributeValue, DataType, GraphBuilder, GraphNode, ModelGraph, Tensor, Value, ValueInfo,
    ValueType, ML_DOMAIN,
};
use mlinfer_runtime::{Error, Session, SessionOptions};

fn f32_tensor(shape: Vec<usize>, data: Vec<f32>) -> Tensor {
    Tensor::from_vec(shape, data).unwrap()
}

fn output(outputs: &HashMap<String, Value>, name: &str) -> Vec<f64> {
    outputs[name].as_tensor().unwrap().to_f64_vec().unwrap()
}

/// `x < 0.5` goes to leaf 1 (weight 1), otherwise leaf 2 (weight 2).
fn stump_regressor(base: f64) -> ModelGraph {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::tensor("y", DataType::F32));
    builder.node(
        GraphNode::new("TreeEnsembleRegressor")
            .with_domain(ML_DOMAIN)
            .with_name("stump")
            .with_inputs(&["x"])
            .with_outputs(&["y"])
            .with_attribute("nodes_treeids", AttributeValue::Ints(vec![0, 0, 0]))
            .with_attribute("nodes_nodeids", AttributeValue::Ints(vec![0, 1, 2]))
            .with_attribute("nodes_featureids", AttributeValue::Ints(vec![0, 0, 0]))
            .with_attribute("nodes_values", AttributeValue::Floats(vec![0.5, 0.0, 0.0]))
            .with_attribute(
                "nodes_modes",
                AttributeValue::texts(&["BRANCH_LT", "LEAF", "LEAF"]),
            )
            .with_attribute("nodes_truenodeids", AttributeValue::Ints(vec![1, 0, 0]))
            .with_attribute("nodes_falsenodeids", AttributeValue::Ints(vec![2, 0, 0]))
            .with_attribute("target_treeids", AttributeValue::Ints(vec![0, 0]))
            .with_attribute("target_nodeids", AttributeValue::Ints(vec![1, 2]))
            .with_attribute("target_ids", AttributeValue::Ints(vec![0, 0]))
            .with_attribute("target_weights", AttributeValue::Floats(vec![1.0, 2.0]))
            .with_attribute("base_values", AttributeValue::Floats(vec![base])),
    );
    builder.build().unwrap()
}

/// Scan over `xs` accumulating into `s`, with the running sums as `ys`.
fn running_sum() -> ModelGraph {
    let mut body = GraphBuilder::new();
    body.input(ValueInfo::tensor("s", DataType::F32))
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::tensor("s_next", DataType::F32))
        .output(ValueInfo::tensor("y", DataType::F32));
    body.add_op("Add", &["s", "x"], &["s_next"]);
    body.add_op("Identity", &["s_next"], &["y"]);
    let body = body.build().unwrap();

    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("s0", DataType::F32))
        .input(ValueInfo::tensor("xs", DataType::F32))
        .output(ValueInfo::tensor("total", DataType::F32))
        .output(ValueInfo::tensor("sums", DataType::F32));
    builder.node(
        GraphNode::new("Scan")
            .with_name("accumulate")
            .with_inputs(&["s0", "xs"])
            .with_outputs(&["total", "sums"])
            .with_attribute("num_scan_inputs", AttributeValue::Int(1))
            .with_attribute("body", AttributeValue::Graph(Arc::new(body))),
    );
    builder.build().unwrap()
}

/// `x -> Relu -> a`, `a -> Abs -> b`, `x -> Sigmoid -> side`.
fn branching() -> ModelGraph {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::new("b"))
        .output(ValueInfo::new("side"));
    builder.add_op("Relu", &["x"], &["a"]);
    builder.add_op("Abs", &["a"], &["b"]);
    builder.add_op("Sigmoid", &["x"], &["side"]);
    builder.build().unwrap()
}

#[test]
fn test_tree_regressor_routes_rows() -> Result<()> {
    let session = Session::new(stump_regressor(10.0))?;
    let x = f32_tensor(vec![2, 1], vec![0.2, 0.7]);

    let outputs = session.run([("x", x)], None)?;
    let y = outputs["y"].as_tensor()?;
    assert_eq!(y.dtype(), DataType::F32);
    assert_eq!(y.shape(), &[2, 1]);
    assert_eq!(y.to_f64_vec()?, vec![11.0, 12.0]);
    Ok(())
}

#[test]
fn test_tree_regressor_follows_session_dtype() -> Result<()> {
    let options = SessionOptions::new().with_dtype(DataType::F64);
    let session = Session::with_options(stump_regressor(0.0), options)?;
    let x = f32_tensor(vec![2, 1], vec![0.9, 0.1]);

    let outputs = session.run([("x", x)], None)?;
    let y = outputs["y"].as_tensor()?;
    assert_eq!(y.dtype(), DataType::F64);
    assert_eq!(y.to_f64_vec()?, vec![2.0, 1.0]);
    Ok(())
}

#[test]
fn test_scan_running_sum() -> Result<()> {
    let session = Session::new(running_sum())?;
    let inputs = [
        ("s0", f32_tensor(vec![1], vec![0.0])),
        ("xs", f32_tensor(vec![3, 1], vec![1.0, 2.0, 3.0])),
    ];

    let outputs = session.run(inputs, None)?;
    assert_eq!(output(&outputs, "total"), vec![6.0]);
    let sums = outputs["sums"].as_tensor()?;
    assert_eq!(sums.shape()[0], 3);
    assert_eq!(sums.to_f64_vec()?, vec![1.0, 3.0, 6.0]);
    Ok(())
}

#[test]
fn test_static_types_are_resolved() -> Result<()> {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::new("as_int"))
        .output(ValueInfo::new("positive"))
        .initializer("zero", Tensor::scalar(0.0f32));
    let cast = builder.add_op("Cast", &["x"], &["as_int"]);
    builder.add_attribute(cast, "to", AttributeValue::Int(7));
    builder.add_op("Greater", &["x", "zero"], &["positive"]);
    let session = Session::new(builder.build()?)?;

    let types = session.static_types();
    assert_eq!(types["as_int"], ValueType::Tensor(DataType::I64));
    assert_eq!(types["positive"], ValueType::Tensor(DataType::Bool));

    let x = f32_tensor(vec![3], vec![-1.5, 0.0, 2.0]);
    let outputs = session.run([("x", x)], None)?;
    assert_eq!(outputs["as_int"].as_tensor()?.dtype(), DataType::I64);
    assert_eq!(
        outputs["positive"],
        Value::from(Tensor::from_vec(vec![3], vec![false, false, true])?)
    );
    Ok(())
}

#[test]
fn test_missing_input_is_reported() {
    let session = Session::new(branching()).unwrap();
    let err = session
        .run(Vec::<(String, Value)>::new(), None)
        .unwrap_err();
    match err {
        Error::MissingValue { name, .. } => assert_eq!(name, "x"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unknown_requested_output() {
    let session = Session::new(branching()).unwrap();
    let x = f32_tensor(vec![1], vec![1.0]);
    let err = session.run([("x", x)], Some(&["nowhere"])).unwrap_err();
    assert!(matches!(err, Error::MissingValue { name, .. } if name == "nowhere"));
}

#[test]
fn test_cycle_is_rejected_at_planning() {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::new("a"));
    builder.add_op("Add", &["x", "b"], &["a"]);
    builder.add_op("Relu", &["a"], &["b"]);

    let err = Session::new(builder.build_unchecked()).err().unwrap();
    match err {
        Error::CyclicGraphError { nodes } => assert_eq!(nodes.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_subset_returns_exactly_the_requested_names() -> Result<()> {
    let session = Session::new(branching())?;
    let x = f32_tensor(vec![2], vec![-2.0, 3.0]);

    let outputs = session.run([("x", x)], Some(&["a"]))?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(output(&outputs, "a"), vec![0.0, 3.0]);
    Ok(())
}

#[test]
fn test_inputs_can_be_requested() -> Result<()> {
    let session = Session::new(branching())?;
    let x = f32_tensor(vec![1], vec![4.0]);

    let outputs = session.run([("x", x.clone())], Some(&["x", "b"]))?;
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs["x"], Value::from(x));
    assert_eq!(output(&outputs, "b"), vec![4.0]);
    Ok(())
}

#[test]
fn test_runs_are_deterministic() -> Result<()> {
    let session = Session::new(stump_regressor(1.0))?;
    let x = f32_tensor(vec![4, 1], vec![0.1, 0.6, 0.5, -3.0]);

    let first = session.run([("x", x.clone())], None)?;
    for _ in 0..5 {
        assert_eq!(session.run([("x", x.clone())], None)?, first);
    }
    Ok(())
}

#[test]
fn test_concurrent_runs_share_a_session() -> Result<()> {
    let session = Session::new(running_sum())?;

    std::thread::scope(|scope| {
        let handles: Vec<_> = (1..=8)
            .map(|n| {
                let session = &session;
                scope.spawn(move || {
                    let xs = f32_tensor(vec![n, 1], vec![1.0; n]);
                    let inputs = [("s0", f32_tensor(vec![1], vec![0.0])), ("xs", xs)];
                    let outputs = session.run(inputs, None).unwrap();
                    (n, output(&outputs, "total")[0])
                })
            })
            .collect();
        for handle in handles {
            let (n, total) = handle.join().unwrap();
            assert_eq!(total, n as f64);
        }
    });
    Ok(())
}

#[test]
fn test_verbose_runs_match_quiet_runs() -> Result<()> {
    init_logging(LoggingConfig::for_tests());
    let quiet = Session::new(branching())?;
    let verbose = Session::with_options(branching(), SessionOptions::new().with_verbose(true))?;
    let x = f32_tensor(vec![3], vec![-1.0, 0.5, 2.0]);

    assert_eq!(
        quiet.run([("x", x.clone())], None)?,
        verbose.run([("x", x)], None)?
    );
    Ok(())
}

#[test]
fn test_kernel_failure_names_the_node() {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .input(ValueInfo::tensor("y", DataType::F32))
        .output(ValueInfo::new("z"));
    builder.node(
        GraphNode::new("Add")
            .with_name("sum")
            .with_inputs(&["x", "y"])
            .with_outputs(&["z"]),
    );
    let session = Session::new(builder.build().unwrap()).unwrap();

    let inputs = [
        ("x", f32_tensor(vec![2], vec![1.0, 2.0])),
        ("y", f32_tensor(vec![3], vec![1.0, 2.0, 3.0])),
    ];
    match session.run(inputs, None).unwrap_err() {
        Error::KernelExecutionError {
            node_name, op_type, ..
        } => {
            assert_eq!(node_name, "sum");
            assert_eq!(op_type, "Add");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_linear_classifier_with_zipmap() -> Result<()> {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::new("label"))
        .output(ValueInfo::new("probabilities"));
    builder.node(
        GraphNode::new("LinearClassifier")
            .with_domain(ML_DOMAIN)
            .with_inputs(&["x"])
            .with_outputs(&["label", "scores"])
            .with_attribute("coefficients", AttributeValue::Floats(vec![1.0, 0.0, 0.0, 1.0]))
            .with_attribute("intercepts", AttributeValue::Floats(vec![0.0, 0.0]))
            .with_attribute("classlabels_strings", AttributeValue::texts(&["a", "b"])),
    );
    builder.node(
        GraphNode::new("ZipMap")
            .with_domain(ML_DOMAIN)
            .with_inputs(&["scores"])
            .with_outputs(&["probabilities"])
            .with_attribute("classlabels_strings", AttributeValue::texts(&["a", "b"])),
    );
    let session = Session::new(builder.build()?)?;

    let x = f32_tensor(vec![2, 2], vec![3.0, 1.0, 0.0, 2.0]);
    let outputs = session.run([("x", x)], None)?;
    assert_eq!(
        outputs["label"],
        Value::from(Tensor::from_vec(
            vec![2],
            vec!["a".to_string(), "b".to_string()]
        )?)
    );
    let Value::Sequence(rows) = &outputs["probabilities"] else {
        panic!("ZipMap must produce a sequence");
    };
    assert_eq!(rows.len(), 2);
    let Value::Map(first) = &rows[0] else {
        panic!("ZipMap rows must be maps");
    };
    assert_eq!(first["a"], 3.0);
    assert_eq!(first["b"], 1.0);
    Ok(())
}

#[test]
fn test_zipmap_static_type_matches_produced_value() -> Result<()> {
    let mut builder = GraphBuilder::new();
    builder
        .input(ValueInfo::tensor("x", DataType::F32))
        .output(ValueInfo::new("label"))
        .output(ValueInfo::new("probabilities"));
    builder.node(
        GraphNode::new("LinearClassifier")
            .with_domain(ML_DOMAIN)
            .with_inputs(&["x"])
            .with_outputs(&["label", "scores"])
            .with_attribute("coefficients", AttributeValue::Floats(vec![1.0, 0.0, 0.0, 1.0]))
            .with_attribute("intercepts", AttributeValue::Floats(vec![0.0, 0.0]))
            .with_attribute("classlabels_ints", AttributeValue::Ints(vec![10, 2])),
    );
    builder.node(
        GraphNode::new("ZipMap")
            .with_domain(ML_DOMAIN)
            .with_inputs(&["scores"])
            .with_outputs(&["probabilities"])
            .with_attribute("classlabels_int64s", AttributeValue::Ints(vec![10, 2])),
    );
    let session = Session::new(builder.build()?)?;

    let x = f32_tensor(vec![1, 2], vec![0.5, 1.5]);
    let outputs = session.run([("x", x)], None)?;
    let types = session.static_types();
    for name in ["label", "probabilities"] {
        assert_eq!(types[name], outputs[name].value_type(), "type of '{name}'");
    }

    let Value::Sequence(rows) = &outputs["probabilities"] else {
        panic!("ZipMap must produce a sequence");
    };
    let Value::Map(row) = &rows[0] else {
        panic!("ZipMap rows must be maps");
    };
    assert_eq!(row["10"], 0.5);
    assert_eq!(row["2"], 1.5);
    Ok(())
}
