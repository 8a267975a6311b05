//! Reference executor semantics for named-dimension ops.

use anyhow::Result;
use approx::assert_relative_eq;
use jannet::graph::{DType, Dim, Graph, Shape, VarInit};
use jannet_backend_ref::Executor;

#[test]
fn named_reductions_and_broadcasts_round_by_dimension_name() -> Result<()> {
    let rows = Dim::new("rows", 2);
    let cols = Dim::new("cols", 3);
    let full = Shape::new(vec![rows.clone(), cols.clone()]);

    let mut graph = Graph::new();
    let w = graph.get_or_create_variable("w", full.clone(), DType::F32, false, VarInit::Zeros)?;
    let row_sums = graph.reduce_sum(w, Shape::new(vec![rows]))?;
    let mean = graph.reduce_mean(w, Shape::scalar())?;
    let spread = graph.broadcast(row_sums, full)?;

    let mut exec = Executor::new();
    exec.set_variable("w", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let env = exec.run(&graph)?;

    assert_eq!(env.tensor(row_sums).unwrap().data, vec![3.0, 12.0]);
    assert_relative_eq!(env.scalar(mean).unwrap(), 2.5, epsilon = 1e-6);
    assert_eq!(
        env.tensor(spread).unwrap().data,
        vec![3.0, 3.0, 3.0, 12.0, 12.0, 12.0]
    );
    Ok(())
}

#[test]
fn scalar_constants_broadcast_into_binary_ops() -> Result<()> {
    let shape = Shape::new(vec![Dim::new("f", 3)]);
    let mut graph = Graph::new();
    let w = graph.get_or_create_variable("w", shape, DType::F32, false, VarInit::Ones)?;
    let two = graph.constant(2.0, DType::F32);
    let doubled = graph.mul(w, two)?;

    let mut exec = Executor::new();
    exec.set_variable("w", vec![1.0, 2.0, 3.0]);
    let env = exec.run(&graph)?;
    assert_eq!(env.tensor(doubled).unwrap().data, vec![2.0, 4.0, 6.0]);
    Ok(())
}

#[test]
fn assignments_mutate_storage_in_declaration_order() -> Result<()> {
    let shape = Shape::new(vec![Dim::new("f", 2)]);
    let mut graph = Graph::new();
    let read = graph.get_or_create_variable(
        "w",
        shape.clone(),
        DType::F32,
        false,
        VarInit::Constant(10.0),
    )?;
    let var = graph.variable_by_name("w").unwrap();

    let one = graph.constant(1.0, DType::F32);
    let bumped = graph.add(read, one)?;
    let first = graph.assign(var, bumped)?;
    let three = graph.constant(3.0, DType::F32);
    let spread = graph.broadcast(three, shape)?;
    let second = graph.assign_sub(var, spread)?;
    graph.combine_assignments(&[first, second])?;

    let mut exec = Executor::new();
    exec.run(&graph)?;
    // assign(w, w + 1) lands first, then w -= 3 applies to the new value.
    assert_eq!(exec.read_variable("w").unwrap(), &[8.0, 8.0]);
    Ok(())
}
