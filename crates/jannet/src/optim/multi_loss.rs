//! Gradient combination across multiple loss heads.
//!
//! A slice produces one to two scalar losses (text and video heads). Body
//! parameters (name contains `"body"`) receive gradients from every head and
//! are where the strategies differ; head parameters always take their own
//! loss's gradient unchanged.

use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::config::{MultiLossStrategy, TrainConfig};
use crate::grads::backward;
use crate::graph::{CompareOp, Graph, Shape, TensorId, VarId};

/// One gradient ready for the update pipeline. `tag` is the index of the
/// loss pass that produced it (the MGDA combined pass is tagged 2).
#[derive(Debug, Clone, Copy)]
pub struct StagedGrad {
    pub tag: usize,
    pub var: VarId,
    pub grad: TensorId,
}

/// All gradients staged for one slice, plus the MGDA mixing weight when that
/// strategy ran (exposed for inspection).
#[derive(Debug)]
pub struct StagedLosses {
    pub grads: Vec<StagedGrad>,
    pub mgda_gamma: Option<TensorId>,
}

/// Differentiates every loss and applies the configured combination
/// strategy, returning the per-variable gradients to feed the update rules.
pub fn stage(graph: &mut Graph, config: &TrainConfig, losses: &[TensorId]) -> Result<StagedLosses> {
    ensure!(!losses.is_empty(), "at least one loss is required");
    for &loss in losses {
        ensure!(
            graph.shape(loss).rank() == 0,
            "losses must be scalar, got shape {}",
            graph.shape(loss)
        );
    }

    if losses.len() == 1 {
        return linear(graph, losses);
    }
    match config.multi_loss_strategy {
        MultiLossStrategy::Linear => linear(graph, losses),
        MultiLossStrategy::Pcgrad => pcgrad(graph, losses),
        MultiLossStrategy::Mgda => mgda(graph, losses),
    }
}

fn collect(graph: &mut Graph, loss: TensorId) -> Result<Vec<(VarId, TensorId)>> {
    let mut finalized = Vec::new();
    backward(graph, loss, |_, var, grad| {
        finalized.push((var, grad));
        Ok(())
    })?;
    Ok(finalized)
}

fn is_body(graph: &Graph, var: VarId) -> bool {
    graph.variable(var).name.contains("body")
}

/// Every loss differentiated and applied independently; updates are additive
/// because each gradient runs its own update chain.
fn linear(graph: &mut Graph, losses: &[TensorId]) -> Result<StagedLosses> {
    let mut grads = Vec::new();
    for (tag, &loss) in losses.iter().enumerate() {
        for (var, grad) in collect(graph, loss)? {
            grads.push(StagedGrad { tag, var, grad });
        }
    }
    Ok(StagedLosses {
        grads,
        mgda_gamma: None,
    })
}

/// Body gradients from earlier losses are held back; at the final loss the
/// conflicting components are projected out pairwise and the deconflicted
/// gradients summed. Non-conflicting inputs pass through unchanged.
fn pcgrad(graph: &mut Graph, losses: &[TensorId]) -> Result<StagedLosses> {
    let last = losses.len() - 1;
    let mut held: HashMap<VarId, Vec<TensorId>> = HashMap::new();
    let mut grads = Vec::new();

    for (tag, &loss) in losses.iter().enumerate() {
        for (var, grad) in collect(graph, loss)? {
            if !is_body(graph, var) {
                grads.push(StagedGrad { tag, var, grad });
            } else if tag < last {
                held.entry(var).or_default().push(grad);
            } else {
                let mut all = held.remove(&var).unwrap_or_default();
                all.push(grad);
                let combined = project_conflicts(graph, &all)?;
                grads.push(StagedGrad {
                    tag,
                    var,
                    grad: combined,
                });
            }
        }
    }
    Ok(StagedLosses {
        grads,
        mgda_gamma: None,
    })
}

/// `g_i' = g_i - sum_j min(<g_i, g_j>, 0) / (1e-6 + <g_j, g_j>) * g_j`,
/// summed over all deconflicted gradients.
fn project_conflicts(graph: &mut Graph, grads: &[TensorId]) -> Result<TensorId> {
    if grads.len() == 1 {
        return Ok(grads[0]);
    }
    let dtype = graph.dtype(grads[0]);
    let zero = graph.constant(0.0, dtype);

    let mut denominators = Vec::with_capacity(grads.len());
    for &g in grads {
        let sq = graph.square(g);
        let sum = graph.reduce_sum(sq, Shape::scalar())?;
        let floor = graph.constant(1e-6, dtype);
        denominators.push(graph.add(sum, floor)?);
    }

    let mut adjusted = Vec::with_capacity(grads.len());
    for (i, &gi) in grads.iter().enumerate() {
        let mut current = gi;
        for (j, &gj) in grads.iter().enumerate() {
            if i == j {
                continue;
            }
            let prod = graph.mul(current, gj)?;
            let dot = graph.reduce_sum(prod, Shape::scalar())?;
            let conflict = graph.minimum(dot, zero)?;
            let coeff = graph.div(conflict, denominators[j])?;
            let projection = graph.mul(coeff, gj)?;
            current = graph.sub(current, projection)?;
        }
        adjusted.push(current);
    }

    let mut total = adjusted[0];
    for &g in &adjusted[1..] {
        total = graph.add(total, g)?;
    }
    Ok(total)
}

/// Min-norm mixing of exactly two losses. Passes 0 and 1 accumulate the
/// inner products of the body gradients; the closed-form mixing weight then
/// drives a third differentiation of `gamma * loss1 + (1 - gamma) * loss2`,
/// which is the only pass that updates body parameters. Head parameters are
/// updated by their own loss's pass and skip the combined one.
fn mgda(graph: &mut Graph, losses: &[TensorId]) -> Result<StagedLosses> {
    ensure!(losses.len() == 2, "mgda requires exactly two losses");
    let dtype = graph.dtype(losses[0]);
    let mut grads = Vec::new();
    let mut first: HashMap<VarId, TensorId> = HashMap::new();

    for (var, grad) in collect(graph, losses[0])? {
        if is_body(graph, var) {
            first.insert(var, grad);
        } else {
            grads.push(StagedGrad { tag: 0, var, grad });
        }
    }

    let mut v11 = graph.constant(0.0, dtype);
    let mut v12 = graph.constant(0.0, dtype);
    let mut v22 = graph.constant(0.0, dtype);
    for (var, grad) in collect(graph, losses[1])? {
        if is_body(graph, var) {
            // Only shared parameters reached by both losses inform gamma.
            if let Some(held) = first.remove(&var) {
                v11 = accumulate_dot(graph, v11, held, held)?;
                v12 = accumulate_dot(graph, v12, held, grad)?;
                v22 = accumulate_dot(graph, v22, grad, grad)?;
            }
        } else {
            grads.push(StagedGrad { tag: 1, var, grad });
        }
    }

    let gamma = mixing_weight(graph, v11, v12, v22)?;
    let one = graph.constant(1.0, dtype);
    let inverse = graph.sub(one, gamma)?;
    let weighted_0 = graph.mul(losses[0], gamma)?;
    let weighted_1 = graph.mul(losses[1], inverse)?;
    let combined = graph.add(weighted_0, weighted_1)?;

    for (var, grad) in collect(graph, combined)? {
        if is_body(graph, var) {
            grads.push(StagedGrad { tag: 2, var, grad });
        }
    }
    Ok(StagedLosses {
        grads,
        mgda_gamma: Some(gamma),
    })
}

fn accumulate_dot(graph: &mut Graph, acc: TensorId, a: TensorId, b: TensorId) -> Result<TensorId> {
    let prod = graph.mul(a, b)?;
    let dot = graph.reduce_sum(prod, Shape::scalar())?;
    graph.add(acc, dot)
}

/// Closed-form mixing weight with boundary rules:
/// `v12 >= v11` fixes gamma at 0.999; otherwise `v12 >= v22` fixes it at
/// 0.001; otherwise `gamma = -(v12 - v22) / (v11 + v22 - 2 v12)`. The result
/// is clamped into `[0.001, 0.999]` and wrapped in a stop gradient so the
/// combined pass never differentiates through it.
fn mixing_weight(
    graph: &mut Graph,
    v11: TensorId,
    v12: TensorId,
    v22: TensorId,
) -> Result<TensorId> {
    let dtype = graph.dtype(v11);
    let high = graph.constant(0.999, dtype);
    let low = graph.constant(0.001, dtype);
    let zero = graph.constant(0.0, dtype);
    let two = graph.constant(2.0, dtype);

    let at_high = graph.compare(CompareOp::GreaterEqual, v12, v11)?;
    let at_low = graph.compare(CompareOp::GreaterEqual, v12, v22)?;

    let mut gamma = graph.mul(high, at_high)?;
    let unset = graph.compare(CompareOp::Equal, gamma, zero)?;
    let low_term = graph.mul(low, at_low)?;
    let low_term = graph.mul(low_term, unset)?;
    gamma = graph.add(gamma, low_term)?;

    // When a boundary rule fired the closed form may divide by zero; pin the
    // denominator to 1 there so the masked-out term stays finite.
    let fired = graph.maximum(at_high, at_low)?;
    let numerator = graph.sub(v12, v22)?;
    let sum = graph.add(v11, v22)?;
    let cross = graph.mul(two, v12)?;
    let denominator = graph.sub(sum, cross)?;
    let one = graph.constant(1.0, dtype);
    let kept = graph.mul(fired, one)?;
    let inv_fired = graph.sub(one, fired)?;
    let open = graph.mul(denominator, inv_fired)?;
    let safe_denominator = graph.add(kept, open)?;
    let quotient = graph.div(numerator, safe_denominator)?;
    let closed = graph.neg(quotient);

    let unset = graph.compare(CompareOp::Equal, gamma, zero)?;
    let closed_term = graph.mul(closed, unset)?;
    gamma = graph.add(gamma, closed_term)?;

    gamma = graph.maximum(gamma, low)?;
    gamma = graph.minimum(gamma, high)?;
    Ok(graph.stop_gradient(gamma))
}
