//! Structural tests for the macro-batch driver.

use anyhow::Result;
use jannet::graph::{DType, Dim, Graph, OpKind, Shape, VarInit};
use jannet::optim::train_step;
use jannet::{StepHyper, TrainConfig};

fn matrix() -> Shape {
    Shape::new(vec![Dim::new("rows", 2), Dim::new("cols", 3)])
}

fn build_slice(graph: &mut Graph) -> Result<Vec<jannet::TensorId>> {
    let w = graph.get_or_create_variable("layer/w", matrix(), DType::F32, true, VarInit::Ones)?;
    let sq = graph.square(w);
    let loss = graph.reduce_sum(sq, Shape::scalar())?;
    Ok(vec![loss])
}

fn committed_graph(macro_batching: usize) -> Result<(Graph, usize)> {
    let mut config = TrainConfig::default();
    config.macro_batching = macro_batching;
    let hyper = StepHyper {
        manual_step: 0,
        learning_rate: 1e-3,
    };
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper, |g, _, _| build_slice(g))?;
    let count = graph.assignment_count();
    Ok((graph, count))
}

#[test]
fn two_slice_run_commits_as_many_assignments_as_one_slice() -> Result<()> {
    let (_, single) = committed_graph(1)?;
    let (_, double) = committed_graph(2)?;
    assert_eq!(single, double);
    Ok(())
}

#[test]
fn update_op_is_a_combined_assignment() -> Result<()> {
    let mut config = TrainConfig::default();
    config.macro_batching = 3;
    let hyper = StepHyper {
        manual_step: 0,
        learning_rate: 1e-3,
    };
    let mut graph = Graph::new();
    let build = train_step(&mut graph, &config, &hyper, |g, _, _| build_slice(g))?;
    assert_eq!(graph.op(build.update_op).kind, OpKind::CombinedAssign);
    Ok(())
}

#[test]
fn debug_gradients_are_keyed_by_loss_and_variable() -> Result<()> {
    let mut config = TrainConfig::default();
    config.debug_gradients = true;
    let hyper = StepHyper {
        manual_step: 0,
        learning_rate: 1e-3,
    };
    let mut graph = Graph::new();
    let build = train_step(&mut graph, &config, &hyper, |g, _, _| build_slice(g))?;
    assert_eq!(
        build.debug_gradients.get("loss_0/layer/w"),
        Some(&"layer/w/adam/loss_0".to_string())
    );
    Ok(())
}
