//! Optimizer core for a mesh-parallel multi-modal transformer trainer.
//!
//! The crate stages a training step as an operation graph: the caller builds
//! the model forward pass through [`graph::Graph`], and [`optim`] appends the
//! reverse-mode gradient expressions and per-variable update rules, returning
//! a single combined assignment op for the mesh runtime to execute. Learning
//! rate scheduling and plateau tracking run host-side in [`optim::schedule`].

pub mod config;
pub mod grads;
pub mod graph;
pub mod optim;

pub use config::{ConfigError, MultiLossStrategy, OptimizerKind, TrainConfig};
pub use graph::{BuildContext, DType, Dim, Graph, Shape, TensorId, VarId, VarInit};
pub use optim::{train_step, OptimizerBuild, StepHyper};
