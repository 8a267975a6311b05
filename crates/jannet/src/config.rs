//! Strongly-typed training configuration.
//!
//! Every recognized option is a named, defaulted field, and the optimizer
//! and multi-loss strategy names are closed enums that fail at parse time.
//! `validate` runs once before any graph construction and rejects nonsense
//! combinations up front.

use serde::Deserialize;
use thiserror::Error;

use crate::graph::DType;

/// Errors surfaced by configuration validation, before graph construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("grad_accumulation must be >= 1 (got {0})")]
    GradAccumulation(usize),
    #[error("macro_batching must be >= 1 (got {0})")]
    MacroBatching(usize),
    #[error("reduce_lr_on_plateau_reduction must be > 1 (got {0})")]
    PlateauReduction(f64),
    #[error("opt_beta2 must lie in (0, 1) (got {0})")]
    Beta2(f32),
    #[error("opt_beta1 must lie in [0, 1) (got {0})")]
    Beta1(f32),
    #[error("n_blocks must be >= 1 (got {0})")]
    Blocks(usize),
    #[error("learning_rate must be positive (got {0})")]
    LearningRate(f32),
    #[error("failed to parse training config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The optimizer family. Unknown names fail at deserialization, which is
/// the startup validation point demanded of strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Novograd,
    Sm3,
    FactorizedAdam,
}

impl OptimizerKind {
    /// Name used in optimizer state buffer keys (`{var}/{optimizer}/{buf}`).
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Novograd => "novograd",
            OptimizerKind::Sm3 => "sm3",
            OptimizerKind::FactorizedAdam => "factorized_adam",
        }
    }
}

/// How gradients from multiple loss heads are merged for body parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiLossStrategy {
    Linear,
    Pcgrad,
    Mgda,
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-5
}

fn default_learning_rate() -> f32 {
    5e-5
}

fn default_decay_multi() -> f64 {
    1.0
}

fn default_decay_min() -> f64 {
    1e-7
}

fn default_plateau_reduction() -> f64 {
    2.0
}

fn default_one() -> usize {
    1
}

fn default_rezero_multiplier() -> f32 {
    0.1
}

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Adam
}

fn default_strategy() -> MultiLossStrategy {
    MultiLossStrategy::Linear
}

fn default_feature_dims() -> Vec<String> {
    vec!["heads".to_string(), "key".to_string()]
}

fn default_key_dim() -> String {
    "key".to_string()
}

/// All options recognized by the optimizer core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub optimizer: OptimizerKind,
    pub multi_loss_strategy: MultiLossStrategy,
    /// <= 0 disables clipping.
    pub gradient_clip: f32,
    pub adaptive_gradient_clipping: bool,
    pub grad_accumulation: usize,
    pub weight_decay: f32,
    pub weight_centralisation: bool,
    pub weight_standardisation: bool,
    /// 0 disables the first moment.
    pub opt_beta1: f32,
    pub opt_beta2: f32,
    pub opt_epsilon: f32,
    pub learning_rate: f32,
    pub warmup_steps: usize,
    pub learning_rate_decay_multi: f64,
    pub learning_rate_decay_start_step: usize,
    pub learning_rate_decay_min: f64,
    /// 0 disables plateau reduction.
    pub reduce_lr_on_plateau_timespan: usize,
    pub reduce_lr_on_plateau_reduction: f64,
    pub macro_batching: usize,
    pub debug_gradients: bool,
    pub rezero_lr_multiplier: f32,
    pub n_blocks: usize,
    /// Dimension names making up a parameter's feature axes.
    pub feature_dims: Vec<String>,
    pub key_dim: String,
    pub optimizer_dtype: DType,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            optimizer: default_optimizer(),
            multi_loss_strategy: default_strategy(),
            gradient_clip: 0.0,
            adaptive_gradient_clipping: false,
            grad_accumulation: 1,
            weight_decay: 0.0,
            weight_centralisation: false,
            weight_standardisation: false,
            opt_beta1: default_beta1(),
            opt_beta2: default_beta2(),
            opt_epsilon: default_epsilon(),
            learning_rate: default_learning_rate(),
            warmup_steps: 0,
            learning_rate_decay_multi: default_decay_multi(),
            learning_rate_decay_start_step: 0,
            learning_rate_decay_min: default_decay_min(),
            reduce_lr_on_plateau_timespan: 0,
            reduce_lr_on_plateau_reduction: default_plateau_reduction(),
            macro_batching: default_one(),
            debug_gradients: false,
            rezero_lr_multiplier: default_rezero_multiplier(),
            n_blocks: default_one(),
            feature_dims: default_feature_dims(),
            key_dim: default_key_dim(),
            optimizer_dtype: DType::F32,
        }
    }
}

impl TrainConfig {
    /// Parses a JSON config document and validates it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: TrainConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Fails fast on malformed option combinations. Called once at startup;
    /// the optimizer core assumes a validated config afterwards.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grad_accumulation == 0 {
            return Err(ConfigError::GradAccumulation(self.grad_accumulation));
        }
        if self.macro_batching == 0 {
            return Err(ConfigError::MacroBatching(self.macro_batching));
        }
        if self.reduce_lr_on_plateau_timespan > 0 && self.reduce_lr_on_plateau_reduction <= 1.0 {
            return Err(ConfigError::PlateauReduction(
                self.reduce_lr_on_plateau_reduction,
            ));
        }
        if !(self.opt_beta2 > 0.0 && self.opt_beta2 < 1.0) {
            return Err(ConfigError::Beta2(self.opt_beta2));
        }
        if !(0.0..1.0).contains(&self.opt_beta1) {
            return Err(ConfigError::Beta1(self.opt_beta1));
        }
        if self.n_blocks == 0 {
            return Err(ConfigError::Blocks(self.n_blocks));
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::LearningRate(self.learning_rate));
        }
        Ok(())
    }
}
