//! Optimizer construction: multi-loss combination, per-variable update
//! rules, the macro-batch driver, and the host-side schedule.

pub mod driver;
pub mod multi_loss;
pub mod schedule;
pub mod update;

use std::collections::HashMap;

use crate::graph::{OpId, TensorId};

pub use driver::{train_step, UpdateMode, UpdateSet};
pub use multi_loss::{StagedGrad, StagedLosses};
pub use schedule::{PlateauTracker, Schedule};
pub use update::UpdateEmitter;

/// Host-computed scalars for one optimizer step. The learning rate comes
/// from [`Schedule::learning_rate`]; `manual_step` is the caller-maintained
/// step counter the gradient-accumulation gate is derived from.
#[derive(Debug, Clone, Copy)]
pub struct StepHyper {
    pub manual_step: u64,
    pub learning_rate: f64,
}

/// Result of staging one optimizer step into the graph.
#[derive(Debug)]
pub struct OptimizerBuild {
    /// The single combined assignment op to execute.
    pub update_op: OpId,
    /// The scheduled rate that was baked into the update chains.
    pub learning_rate: f64,
    /// `"loss_{i}/{var}"` -> flattened-gradient buffer variable name,
    /// populated when `debug_gradients` is enabled.
    pub debug_gradients: HashMap<String, String>,
    /// The MGDA mixing weight tensor, when that strategy ran.
    pub mgda_gamma: Option<TensorId>,
}
