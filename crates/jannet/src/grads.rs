//! Reverse-mode gradient engine: graph walker and gradient accumulator.
//!
//! The walker threads gradient tensors from a scalar loss back to every
//! trainable variable reachable from it. Three structural passes run over a
//! snapshot of the operation list:
//!
//! 1. forward: the *downstream set*, ops reachable forward from trainable
//!    variables; anything outside can never contribute a gradient and is
//!    pruned from the walk entirely;
//! 2. backward: the *live set*, ops that will actually receive an output
//!    gradient, used to precompute the true consumer count of every tensor;
//! 3. the reverse walk itself, in reverse declaration order (valid because
//!    ops are declared in forward dependency order).
//!
//! Accumulation records are keyed by tensor and deleted as soon as their
//! producer gathers them, so the pending map never grows with graph size.
//! Completion is detected against the true consumer count computed in pass
//! 2; the producer-arity heuristic is only consulted as a debug-mode
//! regression check.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::graph::{Graph, OpId, OpKind, TensorId, VarId};

/// Transient per-tensor accumulation state:
/// `(consumers seen, total consumers, running gradient sum)`.
#[derive(Debug)]
struct GradRecord {
    seen: usize,
    total: usize,
    grad: TensorId,
}

/// Counters reported by one completed walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkStats {
    /// Trainable variables whose accumulated gradient completed.
    pub finalized: usize,
    /// Accumulation records still pending after the walk. Zero for every
    /// well-formed graph; nonzero means a consumer count was overestimated
    /// and a gradient never completed.
    pub leaked_records: usize,
}

/// Walks the graph backward from `loss`, invoking `on_final` once per
/// trainable variable whose accumulated gradient has completed.
///
/// Variables unreachable from the loss are silently excluded; that is a
/// legitimate state (frozen or unused parameter), not an error.
pub fn backward<F>(graph: &mut Graph, loss: TensorId, mut on_final: F) -> Result<WalkStats>
where
    F: FnMut(&mut Graph, VarId, TensorId) -> Result<()>,
{
    let mut stats = WalkStats::default();
    let op_count = graph.ops().len();

    // Pass 1: downstream set, seeded with the trainable variables' reads.
    let mut downstream: HashSet<TensorId> = graph
        .trainable_variables()
        .iter()
        .map(|&var| graph.read(var))
        .collect();
    for idx in 0..op_count {
        let op = graph.op(OpId(idx));
        if op.kind.has_gradient() && op.inputs.iter().any(|t| downstream.contains(t)) {
            downstream.extend(op.outputs.iter().copied());
        }
    }

    // Pass 2: true consumer counts. An op contributes gradients exactly
    // when it has a rule, at least one output carries a gradient, and at
    // least one input is downstream; only its downstream inputs receive a
    // contribution.
    let mut receives: HashSet<TensorId> = HashSet::new();
    receives.insert(loss);
    let mut total_consumers: HashMap<TensorId, usize> = HashMap::new();
    for idx in (0..op_count).rev() {
        let op = graph.op(OpId(idx));
        if !op.kind.has_gradient() {
            continue;
        }
        if !op.outputs.iter().any(|t| receives.contains(t)) {
            continue;
        }
        if !op.inputs.iter().any(|t| downstream.contains(t)) {
            continue;
        }
        for input in &op.inputs {
            if downstream.contains(input) {
                *total_consumers.entry(*input).or_insert(0) += 1;
                receives.insert(*input);
            }
        }
    }

    // Pass 3: the reverse walk. Seed the loss with a constant gradient of 1.
    let mut pending: HashMap<TensorId, GradRecord> = HashMap::new();
    let seed = graph.constant(1.0, graph.dtype(loss));
    pending.insert(
        loss,
        GradRecord {
            seen: 0,
            total: 0,
            grad: seed,
        },
    );

    for idx in (0..op_count).rev() {
        let op = graph.op(OpId(idx)).clone();

        // Gather output gradients; a tensor is gathered exactly once (by
        // its unique producer), which is the moment its record dies.
        let mut grad_outputs: Vec<Option<TensorId>> = Vec::with_capacity(op.outputs.len());
        for output in &op.outputs {
            match pending.remove(output) {
                Some(record) => {
                    #[cfg(debug_assertions)]
                    check_arity_heuristic(graph, &record);
                    grad_outputs.push(Some(record.grad));
                }
                None => grad_outputs.push(None),
            }
        }

        if !op.kind.has_gradient()
            || grad_outputs.iter().all(Option::is_none)
            || !op.inputs.iter().any(|t| downstream.contains(t))
        {
            continue;
        }

        let input_grads = graph.gradient(OpId(idx), &grad_outputs)?;
        for (input, grad) in op.inputs.iter().zip(input_grads) {
            let grad = match grad {
                Some(grad) if downstream.contains(input) => grad,
                _ => continue,
            };

            let total = total_consumers.get(input).copied().unwrap_or(1);
            let record = match pending.remove(input) {
                Some(mut record) => {
                    record.seen += 1;
                    record.grad = graph.add(record.grad, grad)?;
                    record
                }
                None => GradRecord {
                    seen: 1,
                    total,
                    grad,
                },
            };

            let complete = record.seen == record.total;
            let finalized = record.grad;
            pending.insert(*input, record);

            if complete {
                if let Some(var) = graph.variable_of(*input) {
                    if graph.variable(var).trainable {
                        stats.finalized += 1;
                        on_final(graph, var, finalized)?;
                    }
                }
            }
        }
    }

    stats.leaked_records = pending.len();
    Ok(stats)
}

/// Compares true-count completion against the producer-arity heuristic
/// (`grad.producer.inputs.len()`) and flags divergence as a regression
/// signal rather than silently reproducing the ambiguity.
#[cfg(debug_assertions)]
fn check_arity_heuristic(graph: &Graph, record: &GradRecord) {
    if record.total == 0 {
        return; // synthetic loss seed
    }
    let producer = graph.tensor(record.grad).producer;
    let arity = graph.op(producer).inputs.len();
    if record.seen != record.total {
        tracing::warn!(
            seen = record.seen,
            total = record.total,
            "gradient record gathered before completion"
        );
    }
    if arity != record.seen && record.seen > 1 {
        tracing::debug!(
            arity,
            seen = record.seen,
            "consumer-count heuristic diverges from true count"
        );
    }
}

/// The set of operations reachable forward from the trainable variables.
/// Exposed for tests asserting the pruning/reachability invariant.
pub fn downstream_ops(graph: &Graph) -> HashSet<OpId> {
    let mut downstream: HashSet<TensorId> = graph
        .trainable_variables()
        .iter()
        .map(|&var| graph.read(var))
        .collect();
    let mut ops = HashSet::new();
    for idx in 0..graph.ops().len() {
        let op = graph.op(OpId(idx));
        if op.kind.has_gradient() && op.inputs.iter().any(|t| downstream.contains(t)) {
            downstream.extend(op.outputs.iter().copied());
            ops.insert(OpId(idx));
        }
        if matches!(op.kind, OpKind::Variable(_)) && downstream.contains(&op.outputs[0]) {
            ops.insert(OpId(idx));
        }
    }
    ops
}
