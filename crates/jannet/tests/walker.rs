//! Structural tests for the reverse-mode graph walker.

use anyhow::Result;
use jannet::grads::{backward, downstream_ops};
use jannet::graph::{DType, Dim, Graph, Shape, TensorId, VarInit};

fn vector(name: &str, size: usize) -> Shape {
    Shape::new(vec![Dim::new(name, size)])
}

#[test]
fn gradients_reach_only_connected_variables() -> Result<()> {
    let mut graph = Graph::new();
    let w = graph.get_or_create_variable("w", vector("f", 4), DType::F32, true, VarInit::Ones)?;
    let _unused =
        graph.get_or_create_variable("u", vector("f", 4), DType::F32, true, VarInit::Ones)?;

    let squared = graph.square(w);
    let loss = graph.reduce_sum(squared, Shape::scalar())?;

    let mut finalized = Vec::new();
    backward(&mut graph, loss, |g, var, _| {
        finalized.push(g.variable(var).name.clone());
        Ok(())
    })?;

    assert_eq!(finalized, vec!["w".to_string()]);
    Ok(())
}

#[test]
fn each_variable_finalizes_exactly_once_with_fanout() -> Result<()> {
    let mut graph = Graph::new();
    let x = graph.get_or_create_variable("w", Shape::scalar(), DType::F32, true, VarInit::Ones)?;

    // x consumed three times: loss = x*x + x.
    let sq = graph.mul(x, x)?;
    let loss = graph.add(sq, x)?;

    let mut count = 0;
    backward(&mut graph, loss, |_, _, _| {
        count += 1;
        Ok(())
    })?;
    assert_eq!(count, 1);
    Ok(())
}

#[test]
fn downstream_set_excludes_constant_only_chains() -> Result<()> {
    let mut graph = Graph::new();
    let w = graph.get_or_create_variable("w", Shape::scalar(), DType::F32, true, VarInit::Ones)?;

    let connected = graph.square(w);
    let before = downstream_ops(&graph).len();

    // A chain fed only by constants must never enter the downstream set.
    let a = graph.constant(2.0, DType::F32);
    let b = graph.constant(3.0, DType::F32);
    let c = graph.mul(a, b)?;
    let _d = graph.square(c);

    let after = downstream_ops(&graph);
    assert_eq!(after.len(), before);
    assert!(after.contains(&graph.tensor(connected).producer));
    Ok(())
}

#[test]
fn fanout_walk_drains_every_accumulation_record() -> Result<()> {
    let mut graph = Graph::new();
    let w = graph.get_or_create_variable("w", vector("f", 3), DType::F32, true, VarInit::Ones)?;

    // Layered fan-out: w feeds three branches, the middle branch itself
    // fans out again before everything rejoins into one scalar loss.
    let sq = graph.mul(w, w)?;
    let doubled = graph.add(w, w)?;
    let mixed = graph.mul(sq, doubled)?;
    let rejoined = graph.add(mixed, sq)?;
    let with_root = graph.add(rejoined, w)?;
    let loss = graph.reduce_sum(with_root, Shape::scalar())?;

    let mut finalized: Vec<TensorId> = Vec::new();
    let stats = backward(&mut graph, loss, |_, _, grad| {
        finalized.push(grad);
        Ok(())
    })?;

    assert_eq!(stats.finalized, 1);
    assert_eq!(finalized.len(), 1);
    assert_eq!(stats.leaked_records, 0);
    Ok(())
}

#[test]
fn stop_gradient_blocks_the_walk() -> Result<()> {
    let mut graph = Graph::new();
    let w = graph.get_or_create_variable("w", Shape::scalar(), DType::F32, true, VarInit::Ones)?;

    let frozen = graph.stop_gradient(w);
    let loss = graph.square(frozen);

    let mut count = 0;
    backward(&mut graph, loss, |_, _, _| {
        count += 1;
        Ok(())
    })?;
    assert_eq!(count, 0);
    Ok(())
}
