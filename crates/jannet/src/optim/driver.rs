//! Macro-batch training step driver.
//!
//! One optimizer step may span several forward/backward slices when the
//! wanted batch does not fit device memory. Each slice rebuilds the model
//! under a fresh `BuildContext` (so parameter names resolve to the same
//! variables), stages its gradients, and either banks them (`Add`) or
//! commits the merged totals through the update pipeline (`Update`). Only
//! the committing slice emits assignment ops, so the committed graph has
//! exactly as many assignments as a single-slice run.

use std::collections::BTreeMap;

use anyhow::{anyhow, ensure, Result};
use tracing::debug;

use crate::config::TrainConfig;
use crate::graph::{BuildContext, Graph, TensorId, VarId};

use super::multi_loss::{self, StagedGrad};
use super::update::UpdateEmitter;
use super::{OptimizerBuild, StepHyper};

/// What a slice does with its staged gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Bank the gradients for a later slice; no assignments.
    Add,
    /// Merge all banked gradients and commit the update.
    Update,
}

/// Gradients banked by `Add` slices, frozen behind stop-gradients and keyed
/// by loss tag and fully qualified variable name. Keying by name makes the
/// carry robust to per-slice rebuilds: slice k's variable ids are resolved
/// again when the totals are merged.
#[derive(Debug, Default)]
pub struct UpdateSet {
    pending: BTreeMap<(usize, String), TensorId>,
}

impl UpdateSet {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn absorb(&mut self, graph: &mut Graph, staged: Vec<StagedGrad>) -> Result<()> {
        for entry in staged {
            let name = graph.variable(entry.var).name.clone();
            let frozen = graph.stop_gradient(entry.grad);
            let key = (entry.tag, name);
            let value = match self.pending.remove(&key) {
                Some(previous) => graph.add(previous, frozen)?,
                None => frozen,
            };
            self.pending.insert(key, value);
        }
        Ok(())
    }
}

/// Builds one full optimizer step: `macro_batching` slices, one committed
/// update. `build_fn` constructs the model for a slice's inputs and returns
/// its scalar losses.
pub fn train_step<F>(
    graph: &mut Graph,
    config: &TrainConfig,
    hyper: &StepHyper,
    mut build_fn: F,
) -> Result<OptimizerBuild>
where
    F: FnMut(&mut Graph, &mut BuildContext, usize) -> Result<Vec<TensorId>>,
{
    config.validate()?;
    let slices = config.macro_batching;
    let mut carry = UpdateSet::default();
    let mut gamma = None;

    for slice in 0..slices {
        let mode = if slice + 1 < slices {
            UpdateMode::Add
        } else {
            UpdateMode::Update
        };
        let mut ctx = BuildContext::new();
        let losses = build_fn(graph, &mut ctx, slice)?;
        ensure!(!losses.is_empty(), "slice {slice} produced no losses");

        let staged = multi_loss::stage(graph, config, &losses)?;
        debug!(slice, ?mode, staged = staged.grads.len(), "slice gradients staged");
        gamma = staged.mgda_gamma;

        match mode {
            UpdateMode::Add => carry.absorb(graph, staged.grads)?,
            UpdateMode::Update => {
                let merged = merge(graph, carry, staged.grads)?;
                let mut emitter = UpdateEmitter::new(graph, config, hyper);
                for ((tag, _), (var, grad)) in merged {
                    emitter.apply(graph, var, tag, grad)?;
                }
                let (update_op, debug_gradients) = emitter.finish(graph)?;
                return Ok(OptimizerBuild {
                    update_op,
                    learning_rate: hyper.learning_rate,
                    debug_gradients,
                    mgda_gamma: gamma,
                });
            }
        }
    }
    unreachable!("macro_batching >= 1 is enforced by validate")
}

/// Sums the banked per-variable totals into the committing slice's staged
/// gradients, resolving banked names against the current variable table.
fn merge(
    graph: &mut Graph,
    carry: UpdateSet,
    staged: Vec<StagedGrad>,
) -> Result<BTreeMap<(usize, String), (VarId, TensorId)>> {
    let mut merged: BTreeMap<(usize, String), (VarId, TensorId)> = BTreeMap::new();
    for entry in staged {
        let name = graph.variable(entry.var).name.clone();
        merged.insert((entry.tag, name), (entry.var, entry.grad));
    }
    for ((tag, name), banked) in carry.pending {
        let var = graph
            .variable_by_name(&name)
            .ok_or_else(|| anyhow!("banked gradient for unknown variable `{name}`"))?;
        let value = match merged.remove(&(tag, name.clone())) {
            Some((var, grad)) => (var, graph.add(grad, banked)?),
            None => (var, banked),
        };
        merged.insert((tag, name), value);
    }
    Ok(merged)
}
