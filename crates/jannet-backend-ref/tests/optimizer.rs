//! End-to-end optimizer behavior on the reference executor.

use anyhow::Result;
use approx::assert_relative_eq;
use jannet::graph::{DType, Dim, Graph, Shape, TensorId, VarInit};
use jannet::optim::train_step;
use jannet::{MultiLossStrategy, OptimizerKind, StepHyper, TrainConfig};
use jannet_backend_ref::Executor;

fn vector(size: usize) -> Shape {
    Shape::new(vec![Dim::new("f", size)])
}

fn matrix() -> Shape {
    Shape::new(vec![Dim::new("rows", 2), Dim::new("cols", 2)])
}

fn hyper(step: u64, lr: f64) -> StepHyper {
    StepHyper {
        manual_step: step,
        learning_rate: lr,
    }
}

/// loss = sum(w^2), so dl/dw = 2w.
fn quadratic_loss(graph: &mut Graph, name: &str, shape: Shape, init: f64) -> Result<TensorId> {
    let w = graph.get_or_create_variable(name, shape, DType::F32, true, VarInit::Constant(init))?;
    let sq = graph.square(w);
    Ok(graph.reduce_sum(sq, Shape::scalar())?)
}

/// loss = sum(w * mask), so dl/dw = mask. The mask lives in a non-trainable
/// variable whose contents the test sets directly.
fn masked_loss(graph: &mut Graph, var: &str, mask: &str, size: usize) -> Result<TensorId> {
    let shape = Shape::new(vec![Dim::new("rows", 2), Dim::new("cols", size / 2)]);
    let w = graph.get_or_create_variable(var, shape.clone(), DType::F32, true, VarInit::Ones)?;
    let m = graph.get_or_create_variable(mask, shape, DType::F32, false, VarInit::Zeros)?;
    let prod = graph.mul(w, m)?;
    Ok(graph.reduce_sum(prod, Shape::scalar())?)
}

#[test]
fn sgd_update_is_exactly_lr_times_gradient() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        Ok(vec![quadratic_loss(g, "layer/w", matrix(), 3.0)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;
    for &value in exec.read_variable("layer/w").unwrap() {
        assert_relative_eq!(value, 3.0 - 0.1 * 6.0, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn adam_first_step_matches_closed_form() -> Result<()> {
    let config = TrainConfig::default();
    let lr = 0.01;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, lr), |g, _, _| {
        Ok(vec![quadratic_loss(g, "w", vector(3), 2.0)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;

    let grad = 4.0f64;
    let v = (1.0 - config.opt_beta2 as f64) * grad * grad;
    let m = (1.0 - config.opt_beta1 as f64) * grad;
    let expected = 2.0 - lr * m / (v + config.opt_epsilon as f64).sqrt();
    for &value in exec.read_variable("w").unwrap() {
        assert_relative_eq!(value, expected as f32, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn novograd_first_step_matches_closed_form() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Novograd;
    let lr = 0.01;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, lr), |g, _, _| {
        Ok(vec![quadratic_loss(g, "w", matrix(), 2.0)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;

    // grad = 4 per element; the second moment is one scalar, the sum of the
    // squared gradient over all four elements.
    let grad = 4.0f64;
    let v = (1.0 - config.opt_beta2 as f64) * grad * grad * 4.0;
    let update = grad / (v + config.opt_epsilon as f64).sqrt();
    let expected = (2.0 - lr * update) as f32;
    for &value in exec.read_variable("w").unwrap() {
        assert_relative_eq!(value, expected, epsilon = 1e-5);
    }

    let second = exec.read_variable("w/novograd/exp_avg_p2").unwrap();
    assert_eq!(second.len(), 1);
    assert_relative_eq!(second[0], v as f32, epsilon = 1e-6);
    for &m in exec.read_variable("w/novograd/exp_avg_p1").unwrap() {
        assert_relative_eq!(m, update as f32, epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn sm3_first_step_updates_weights_and_per_dim_buffers() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sm3;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        Ok(vec![quadratic_loss(g, "w", matrix(), 3.0)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;

    // Zero buffers on the first step: the effective second moment is just
    // the squared gradient, 36 everywhere.
    let grad = 6.0f64;
    let update = grad / (grad * grad + config.opt_epsilon as f64).sqrt();
    let expected = (3.0 - 0.1 * update) as f32;
    for &value in exec.read_variable("w").unwrap() {
        assert_relative_eq!(value, expected, epsilon = 1e-5);
    }

    // Each per-dimension buffer holds the reduce-max of the accumulator
    // along its own axis.
    for buffer in ["w/sm3/dim0", "w/sm3/dim1"] {
        let held = exec.read_variable(buffer).unwrap();
        assert_eq!(held.len(), 2);
        for &value in held {
            assert_relative_eq!(value, 36.0, epsilon = 1e-4);
        }
    }
    Ok(())
}

#[test]
fn factorized_adam_keeps_per_dimension_moment_factors() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::FactorizedAdam;
    let lr = 0.01;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, lr), |g, _, _| {
        Ok(vec![quadratic_loss(g, "w", matrix(), 2.0)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;

    // A uniform gradient makes every per-dimension factor equal, so the
    // averaged update collapses to the plain adam closed form.
    let grad = 4.0f64;
    let v = (1.0 - config.opt_beta2 as f64) * grad * grad;
    let m = (1.0 - config.opt_beta1 as f64) * grad;
    let expected = (2.0 - lr * m / (v + config.opt_epsilon as f64).sqrt()) as f32;
    for &value in exec.read_variable("w").unwrap() {
        assert_relative_eq!(value, expected, epsilon = 1e-5);
    }

    // Factors hold one value per axis element, not per weight element.
    for buffer in [
        "w/factorized_adam/exp_avg_p2_dim0",
        "w/factorized_adam/exp_avg_p2_dim1",
    ] {
        let held = exec.read_variable(buffer).unwrap();
        assert_eq!(held.len(), 2);
        for &value in held {
            assert_relative_eq!(value, v as f32, epsilon = 1e-6);
        }
    }
    Ok(())
}

#[test]
fn adaptive_clipping_rescales_by_the_inverse_norm_ratio() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    config.gradient_clip = 1.0;
    config.adaptive_gradient_clipping = true;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        let w = g.get_or_create_variable(
            "layer/w",
            matrix(),
            DType::F32,
            true,
            VarInit::Constant(3.0),
        )?;
        Ok(vec![g.reduce_sum(w, Shape::scalar())?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;

    // Per column (fan-in is the row axis): grd = sqrt(2 + 1e-5),
    // wgt = sqrt(18 + 1e-3). wgt/grd is about 3, above the clip of 1, so
    // the unit gradient is rescaled to clip * grd/wgt.
    let grd = (2.0f64 + 1e-5).sqrt();
    let wgt = (18.0f64 + 1e-3).sqrt();
    let expected = (3.0 - 0.1 * (grd / wgt)) as f32;
    for &value in exec.read_variable("layer/w").unwrap() {
        assert_relative_eq!(value, expected, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn adaptive_clipping_keeps_gradients_under_the_threshold() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    config.gradient_clip = 5.0;
    config.adaptive_gradient_clipping = true;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        let w = g.get_or_create_variable(
            "layer/w",
            matrix(),
            DType::F32,
            true,
            VarInit::Constant(3.0),
        )?;
        Ok(vec![g.reduce_sum(w, Shape::scalar())?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;

    // wgt/grd is about 3, under the clip of 5: plain sgd step.
    for &value in exec.read_variable("layer/w").unwrap() {
        assert_relative_eq!(value, 3.0 - 0.1, epsilon = 1e-5);
    }
    Ok(())
}

#[test]
fn low_rank_variables_take_the_adam_path_under_any_optimizer() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        Ok(vec![quadratic_loss(g, "w", vector(2), 3.0)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;
    // Moment buffers exist even though sgd itself keeps no state.
    assert!(exec.read_variable("w/sgd/exp_avg_p2").is_some());
    assert!(exec.read_variable("w/sgd/exp_avg_p1").is_some());
    let plain_sgd = 3.0 - 0.1 * 6.0;
    for &value in exec.read_variable("w").unwrap() {
        assert!((value - plain_sgd).abs() > 1e-3);
    }
    Ok(())
}

#[test]
fn gradient_accumulation_gates_the_real_update() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    config.grad_accumulation = 2;
    let mut exec = Executor::new();

    // Step 0: mid-accumulation, the gate is closed. The gradient lands in
    // the buffer and the weights stay put.
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.5), |g, _, _| {
        Ok(vec![quadratic_loss(g, "layer/w", matrix(), 1.0)?])
    })?;
    exec.run(&graph)?;
    for &value in exec.read_variable("layer/w").unwrap() {
        assert_relative_eq!(value, 1.0, epsilon = 1e-6);
    }
    for &value in exec.read_variable("layer/w/sgd/grad_accumulation").unwrap() {
        assert_relative_eq!(value, 2.0, epsilon = 1e-6);
    }

    // Step 1: commit. Effective gradient is the buffered mean; the buffer
    // clears for the next accumulation round.
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(1, 0.5), |g, _, _| {
        Ok(vec![quadratic_loss(g, "layer/w", matrix(), 1.0)?])
    })?;
    exec.run(&graph)?;
    for &value in exec.read_variable("layer/w").unwrap() {
        // mean gradient (2 + 2) / 2 = 2, update 0.5 * 2.
        assert_relative_eq!(value, 0.0, epsilon = 1e-6);
    }
    for &value in exec.read_variable("layer/w/sgd/grad_accumulation").unwrap() {
        assert_relative_eq!(value, 0.0, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn pcgrad_is_identity_for_nonconflicting_gradients() -> Result<()> {
    let run = |strategy: MultiLossStrategy| -> Result<Vec<f32>> {
        let mut config = TrainConfig::default();
        config.optimizer = OptimizerKind::Sgd;
        config.multi_loss_strategy = strategy;
        let mut graph = Graph::new();
        train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
            Ok(vec![
                masked_loss(g, "body/w", "mask_a", 4)?,
                masked_loss(g, "body/w", "mask_b", 4)?,
            ])
        })?;

        let mut exec = Executor::new();
        // Orthogonal masks: the gradients never conflict.
        exec.set_variable("mask_a", vec![1.0, 0.0, 0.0, 0.0]);
        exec.set_variable("mask_b", vec![0.0, 0.0, 0.0, 1.0]);
        exec.run(&graph)?;
        Ok(exec.read_variable("body/w").unwrap().to_vec())
    };

    let projected = run(MultiLossStrategy::Pcgrad)?;
    let additive = run(MultiLossStrategy::Linear)?;
    for (&p, &a) in projected.iter().zip(&additive) {
        assert_relative_eq!(p, a, epsilon = 1e-6);
    }
    assert_relative_eq!(projected[0], 0.9, epsilon = 1e-6);
    assert_relative_eq!(projected[3], 0.9, epsilon = 1e-6);
    Ok(())
}

fn mgda_gamma(mask_a: Vec<f32>, mask_b: Vec<f32>) -> Result<f32> {
    let mut config = TrainConfig::default();
    config.multi_loss_strategy = MultiLossStrategy::Mgda;
    let mut graph = Graph::new();
    let build = train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        Ok(vec![
            masked_loss(g, "body/w", "mask_a", 4)?,
            masked_loss(g, "body/w", "mask_b", 4)?,
        ])
    })?;

    let mut exec = Executor::new();
    exec.set_variable("mask_a", mask_a);
    exec.set_variable("mask_b", mask_b);
    let env = exec.run(&graph)?;
    Ok(env.scalar(build.mgda_gamma.unwrap()).unwrap())
}

#[test]
fn mgda_mixing_weight_takes_the_closed_form_inside_the_bounds() -> Result<()> {
    // v11 = 1, v12 = 0, v22 = 4 -> gamma = -(0 - 4) / (1 + 4 - 0) = 0.8.
    let gamma = mgda_gamma(vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 0.0, 0.0, 2.0])?;
    assert_relative_eq!(gamma, 0.8, epsilon = 1e-5);
    Ok(())
}

#[test]
fn mgda_mixing_weight_saturates_at_the_boundaries() -> Result<()> {
    // Identical gradients: v12 >= v11 pins gamma high.
    let high = mgda_gamma(vec![1.0, 1.0, 0.0, 0.0], vec![1.0, 1.0, 0.0, 0.0])?;
    assert_relative_eq!(high, 0.999, epsilon = 1e-5);

    // v11 = 4, v12 = 2, v22 = 1: v12 >= v22 pins gamma low.
    let low = mgda_gamma(vec![2.0, 0.0, 0.0, 0.0], vec![1.0, 0.0, 0.0, 0.0])?;
    assert_relative_eq!(low, 0.001, epsilon = 1e-5);
    Ok(())
}

#[test]
fn macro_batch_slices_sum_their_gradients() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    config.macro_batching = 2;
    let mut graph = Graph::new();
    train_step(&mut graph, &config, &hyper(0, 0.25), |g, _, _| {
        let w = g.get_or_create_variable("layer/w", matrix(), DType::F32, true, VarInit::Ones)?;
        Ok(vec![g.reduce_sum(w, Shape::scalar())?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;
    // Two slices, gradient 1 each: update = 0.25 * (1 + 1).
    for &value in exec.read_variable("layer/w").unwrap() {
        assert_relative_eq!(value, 0.5, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn debug_buffers_capture_the_raw_gradient() -> Result<()> {
    let mut config = TrainConfig::default();
    config.optimizer = OptimizerKind::Sgd;
    config.debug_gradients = true;
    let mut graph = Graph::new();
    let build = train_step(&mut graph, &config, &hyper(0, 0.1), |g, _, _| {
        // loss = w^2 + w, dl/dw = 2w + 1 = 7 at w = 3.
        let w = g.get_or_create_variable(
            "w",
            Shape::scalar(),
            DType::F32,
            true,
            VarInit::Constant(3.0),
        )?;
        let sq = g.mul(w, w)?;
        Ok(vec![g.add(sq, w)?])
    })?;

    let mut exec = Executor::new();
    exec.run(&graph)?;
    let buffer = build.debug_gradients.get("loss_0/w").unwrap();
    assert_eq!(buffer, "w/sgd/loss_0");
    assert_relative_eq!(exec.read_variable(buffer).unwrap()[0], 7.0, epsilon = 1e-6);
    Ok(())
}
