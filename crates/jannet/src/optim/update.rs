//! Per-variable update rule pipeline.
//!
//! For each finalized (variable, gradient) pair the emitter appends one
//! fixed-order chain of graph ops: debug capture, gradient-accumulation
//! buffering, clipping, the optimizer's moment update, learning-rate and
//! rezero scaling, decay/centralisation for large tensors, the accumulation
//! step gate, and finally either weight standardisation or a plain
//! subtractive assignment. Optimizer state lives in auxiliary non-trainable
//! variables named `{var}/{optimizer}/{buffer}`, created lazily and found by
//! name on every later step.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::config::{OptimizerKind, TrainConfig};
use crate::graph::{CompareOp, Dim, Graph, OpId, Shape, TensorId, VarId, VarInit};

use super::StepHyper;

/// `left * alpha + right * (1 - alpha)`, the moving-average blend used by
/// every moment update. With the accumulation gate folded into `alpha`,
/// a gated-off step degenerates to `left`, freezing the state buffer.
pub(crate) fn weighted_add(
    graph: &mut Graph,
    left: TensorId,
    right: TensorId,
    alpha: TensorId,
) -> Result<TensorId> {
    let one = graph.constant(1.0, graph.dtype(left));
    let keep = graph.mul(left, alpha)?;
    let inverse = graph.sub(one, alpha)?;
    let blend = graph.mul(right, inverse)?;
    graph.add(keep, blend)
}

/// Emits update chains for one committed slice and collects the assignment
/// outputs for the final `CombinedAssign`.
pub struct UpdateEmitter<'a> {
    config: &'a TrainConfig,
    /// Scheduled learning rate, injected as a scalar constant.
    lr: TensorId,
    /// Accumulation step gate (1 on commit steps, else 0) and its inverse.
    step: TensorId,
    mstep: TensorId,
    /// Gate-folded moment coefficients: `1 - step * (1 - beta)`.
    beta1: TensorId,
    beta2: TensorId,
    epsilon: TensorId,
    assigns: Vec<TensorId>,
    debug_gradients: HashMap<String, String>,
}

impl<'a> UpdateEmitter<'a> {
    pub fn new(graph: &mut Graph, config: &'a TrainConfig, hyper: &StepHyper) -> Self {
        let dtype = config.optimizer_dtype;
        let gate = if config.grad_accumulation > 1 {
            let committing = (hyper.manual_step + 1) % config.grad_accumulation as u64 == 0;
            committing as u64 as f64
        } else {
            1.0
        };
        let lr = graph.constant(hyper.learning_rate, dtype);
        let step = graph.constant(gate, dtype);
        let mstep = graph.constant(1.0 - gate, dtype);
        let beta1 = graph.constant(1.0 - gate * (1.0 - config.opt_beta1 as f64), dtype);
        let beta2 = graph.constant(1.0 - gate * (1.0 - config.opt_beta2 as f64), dtype);
        let epsilon = graph.constant(config.opt_epsilon as f64, dtype);
        UpdateEmitter {
            config,
            lr,
            step,
            mstep,
            beta1,
            beta2,
            epsilon,
            assigns: Vec::new(),
            debug_gradients: HashMap::new(),
        }
    }

    fn buffer_name(&self, graph: &Graph, var: VarId, buffer: &str) -> String {
        format!(
            "{}/{}/{}",
            graph.variable(var).name,
            self.config.optimizer.as_str(),
            buffer
        )
    }

    /// Optimizer state buffer: lazily created, zero-initialized,
    /// non-trainable, resolved by name on reuse.
    fn state(&self, graph: &mut Graph, var: VarId, buffer: &str, shape: Shape) -> Result<(VarId, TensorId)> {
        let name = self.buffer_name(graph, var, buffer);
        let read = graph.get_or_create_variable(
            name.clone(),
            shape,
            self.config.optimizer_dtype,
            false,
            VarInit::Zeros,
        )?;
        let id = graph
            .variable_by_name(&name)
            .ok_or_else(|| anyhow!("state buffer `{name}` vanished after creation"))?;
        Ok((id, read))
    }

    /// The fan-in dimensions of a parameter, used to restrict clipping norms
    /// and to size weight standardisation.
    fn fan_in(&self, shape: &Shape) -> Vec<Dim> {
        let dims = shape.dims();
        let rank = shape.rank();
        let features_used = self.features_used(shape);
        if features_used && rank > 0 && shape.index_of(&self.config.key_dim) == Some(rank - 1) {
            dims[..rank.saturating_sub(2)].to_vec()
        } else if features_used {
            dims[..rank.min(2)].to_vec()
        } else {
            dims[..rank.min(1)].to_vec()
        }
    }

    fn features_used(&self, shape: &Shape) -> bool {
        self.config
            .feature_dims
            .iter()
            .all(|name| shape.contains(name))
    }

    /// Runs the full pipeline for one finalized gradient. `tag` is the loss
    /// index the gradient came from, used only for debug capture keys.
    pub fn apply(&mut self, graph: &mut Graph, var: VarId, tag: usize, grad: TensorId) -> Result<()> {
        let var_name = graph.variable(var).name.clone();
        let var_shape = graph.variable(var).shape.clone();
        let dtype = graph.dtype(grad);
        let mut grad = grad;

        if self.config.debug_gradients {
            let flat = Shape::new(vec![Dim::new("flat_dim", var_shape.size())]);
            let buffer = format!("loss_{tag}");
            let (flat_var, _) = self.state(graph, var, &buffer, flat.clone())?;
            let reshaped = graph.reshape(grad, flat)?;
            let assigned = graph.assign(flat_var, reshaped)?;
            self.assigns.push(assigned);
            self.debug_gradients.insert(
                format!("loss_{tag}/{var_name}"),
                self.buffer_name(graph, var, &buffer),
            );
        }

        if self.config.grad_accumulation > 1 {
            let (buf_var, buf_read) = self.state(graph, var, "grad_accumulation", var_shape.clone())?;
            let next = graph.add(grad, buf_read)?;
            // Buffer survives mid-accumulation, zeroes on the commit step.
            let cleared = graph.mul(next, self.mstep)?;
            let assigned = graph.assign(buf_var, cleared)?;
            self.assigns.push(assigned);
            let gated = graph.mul(next, self.step)?;
            let scale = graph.constant(1.0 / self.config.grad_accumulation as f64, dtype);
            grad = graph.mul(gated, scale)?;
        }

        let fan_in = self.fan_in(&var_shape);
        let fan_in_names: Vec<&str> = fan_in.iter().map(|d| d.name()).collect();

        if self.config.gradient_clip > 0.0 && self.config.adaptive_gradient_clipping {
            let reduced = var_shape.without(&fan_in_names);
            let g_sq = graph.square(grad);
            let g_sum = graph.reduce_sum(g_sq, reduced.clone())?;
            let g_floor = graph.constant(1e-5, dtype);
            let g_biased = graph.add(g_sum, g_floor)?;
            let grd_norm = graph.sqrt(g_biased);

            let weight = graph.read(var);
            let w_sq = graph.square(weight);
            let w_sum = graph.reduce_sum(w_sq, reduced)?;
            let w_floor = graph.constant(1e-3, dtype);
            let w_biased = graph.add(w_sum, w_floor)?;
            let wgt_norm = graph.sqrt(w_biased);

            // Rescale by clip * grd/wgt where wgt/grd exceeds the clip
            // threshold; keep the gradient unchanged elsewhere.
            let clip = graph.constant(self.config.gradient_clip as f64, dtype);
            let inv_ratio = graph.div(grd_norm, wgt_norm)?;
            let scale = graph.mul(inv_ratio, clip)?;
            let rescaled = graph.mul(grad, scale)?;
            let ratio = graph.div(wgt_norm, grd_norm)?;
            let fired = graph.compare(CompareOp::Greater, ratio, clip)?;
            grad = weighted_add(graph, rescaled, grad, fired)?;
        } else if self.config.gradient_clip > 0.0 {
            let g_sq = graph.square(grad);
            let total = graph.reduce_sum(g_sq, Shape::scalar())?;
            let floor = graph.constant(1e-6, dtype);
            let biased = graph.add(total, floor)?;
            let inv_norm = graph.rsqrt(biased);
            let inv_clip = graph.constant(1.0 / self.config.gradient_clip as f64, dtype);
            let bounded = graph.minimum(inv_norm, inv_clip)?;
            let clip = graph.constant(self.config.gradient_clip as f64, dtype);
            let scaled = graph.mul(grad, bounded)?;
            grad = graph.mul(scaled, clip)?;
        }

        // Scalars and vectors always take the adam path, whatever the
        // configured optimizer.
        let kind = if var_shape.rank() <= 1 {
            OptimizerKind::Adam
        } else {
            self.config.optimizer
        };
        let mut update = match kind {
            OptimizerKind::Adam => self.adam(graph, var, var_shape.clone(), grad)?,
            OptimizerKind::Sgd => grad,
            OptimizerKind::Novograd => self.novograd(graph, var, var_shape.clone(), grad)?,
            OptimizerKind::Sm3 => self.sm3(graph, var, &var_shape, grad)?,
            OptimizerKind::FactorizedAdam => self.factorized_adam(graph, var, &var_shape, grad)?,
        };

        update = graph.mul(update, self.lr)?;
        if var_name.contains("rezero") {
            let multi = graph.constant(self.config.rezero_lr_multiplier as f64, dtype);
            update = graph.mul(update, multi)?;
        }

        let features_used = self.features_used(&var_shape);
        let mut large_tensor = (features_used && var_shape.rank() > self.config.feature_dims.len())
            || (!features_used && var_shape.rank() >= 2);
        large_tensor &= var_shape.size() > 1;
        large_tensor &= !var_name.contains("embed");
        large_tensor &= !var_name.contains("input")
            || var_name.contains("lang_in")
            || var_name.contains("vid_in");
        large_tensor &= !var_name.contains("output")
            || var_name.contains("lang_out")
            || var_name.contains("vid_out");

        if large_tensor && self.config.weight_decay > 0.0 {
            let decay = graph.constant(self.config.weight_decay as f64, dtype);
            let weight = graph.read(var);
            let shrink = graph.mul(decay, weight)?;
            let scaled = graph.mul(shrink, self.lr)?;
            update = graph.add(update, scaled)?;
        }
        if large_tensor && self.config.weight_centralisation {
            let weight = graph.read(var);
            let mean = graph.reduce_mean(weight, Shape::scalar())?;
            update = graph.add(update, mean)?;
        }
        if self.config.grad_accumulation > 1 {
            update = graph.mul(update, self.step)?;
        }

        if large_tensor && self.config.weight_standardisation {
            let weight = graph.read(var);
            let value = graph.sub(weight, update)?;
            let value_sq = graph.square(value);
            let sum_sq = graph.reduce_sum(value_sq, Shape::scalar())?;
            let size = var_shape.size();
            let norm_scale = graph.constant((size as f64).powf(-0.5), dtype);
            let normed = graph.mul(sum_sq, norm_scale)?;
            let floor = graph.constant(1e-6, dtype);
            let biased = graph.add(normed, floor)?;
            let std = graph.rsqrt(biased);
            let fan_in_size: usize = fan_in.iter().map(|d| d.size()).product();
            let gain = ((fan_in_size as f64 - 2.0) / size as f64 / self.config.n_blocks as f64)
                .sqrt();
            let gain = graph.constant(gain, dtype);
            let standardized = graph.mul(value, std)?;
            let scaled = graph.mul(standardized, gain)?;
            let assigned = graph.assign(var, scaled)?;
            self.assigns.push(assigned);
        } else {
            let assigned = graph.assign_sub(var, update)?;
            self.assigns.push(assigned);
        }
        Ok(())
    }

    fn adam(&mut self, graph: &mut Graph, var: VarId, shape: Shape, grad: TensorId) -> Result<TensorId> {
        let (v_var, v_read) = self.state(graph, var, "exp_avg_p2", shape.clone())?;
        let grad_sq = graph.square(grad);
        let second = weighted_add(graph, v_read, grad_sq, self.beta2)?;
        let assigned = graph.assign(v_var, second)?;
        self.assigns.push(assigned);

        let mut first = grad;
        if self.config.opt_beta1 > 0.0 {
            let (m_var, m_read) = self.state(graph, var, "exp_avg_p1", shape)?;
            first = weighted_add(graph, m_read, grad, self.beta1)?;
            let assigned = graph.assign(m_var, first)?;
            self.assigns.push(assigned);
        }
        let biased = graph.add(second, self.epsilon)?;
        let inv = graph.rsqrt(biased);
        graph.mul(first, inv)
    }

    fn novograd(&mut self, graph: &mut Graph, var: VarId, shape: Shape, grad: TensorId) -> Result<TensorId> {
        let (m_var, m_read) = self.state(graph, var, "exp_avg_p1", shape)?;
        let (v_var, v_read) = self.state(graph, var, "exp_avg_p2", Shape::scalar())?;

        let grad_sq = graph.square(grad);
        let grad_sq_sum = graph.reduce_sum(grad_sq, Shape::scalar())?;
        let second = weighted_add(graph, v_read, grad_sq_sum, self.beta2)?;

        let biased = graph.add(second, self.epsilon)?;
        let inv = graph.rsqrt(biased);
        let normed = graph.mul(grad, inv)?;
        let momentum = graph.mul(self.beta1, m_read)?;
        let update = graph.add(momentum, normed)?;

        let assigned = graph.assign(m_var, update)?;
        self.assigns.push(assigned);
        let assigned = graph.assign(v_var, second)?;
        self.assigns.push(assigned);
        Ok(update)
    }

    fn sm3(&mut self, graph: &mut Graph, var: VarId, shape: &Shape, grad: TensorId) -> Result<TensorId> {
        let dims = shape.dims().to_vec();
        let mut buffers = Vec::with_capacity(dims.len());
        let mut accumulator = None;
        for (index, dim) in dims.iter().enumerate() {
            let axis = Shape::new(vec![dim.clone()]);
            let (buf_var, buf_read) = self.state(graph, var, &format!("dim{index}"), axis)?;
            buffers.push(buf_var);
            accumulator = Some(match accumulator {
                Some(acc) => graph.minimum(acc, buf_read)?,
                None => buf_read,
            });
        }
        let acc = accumulator.ok_or_else(|| anyhow!("sm3 applied to a zero-rank variable"))?;

        let grad_sq = graph.square(grad);
        let acc = graph.add(acc, grad_sq)?;
        let biased = graph.add(acc, self.epsilon)?;
        let inv = graph.rsqrt(biased);
        let update = graph.mul(grad, inv)?;

        for (buf_var, dim) in buffers.into_iter().zip(dims) {
            let axis = Shape::new(vec![dim]);
            let ceiling = graph.reduce_max(acc, axis)?;
            let assigned = graph.assign(buf_var, ceiling)?;
            self.assigns.push(assigned);
        }
        Ok(update)
    }

    fn factorized_adam(
        &mut self,
        graph: &mut Graph,
        var: VarId,
        shape: &Shape,
        grad: TensorId,
    ) -> Result<TensorId> {
        let dims = shape.dims().to_vec();
        let mut parts = Vec::with_capacity(dims.len());
        for (index, dim) in dims.iter().enumerate() {
            let axis = Shape::new(vec![dim.clone()]);
            let (v_var, v_read) = self.state(graph, var, &format!("exp_avg_p2_dim{index}"), axis.clone())?;
            let grad_sq = graph.square(grad);
            let grad_sq_mean = graph.reduce_mean(grad_sq, axis.clone())?;
            let second = weighted_add(graph, v_read, grad_sq_mean, self.beta2)?;
            let assigned = graph.assign(v_var, second)?;
            self.assigns.push(assigned);

            let first = if self.config.opt_beta1 > 0.0 {
                let (m_var, m_read) =
                    self.state(graph, var, &format!("exp_avg_p1_dim{index}"), axis.clone())?;
                let grad_mean = graph.reduce_mean(grad, axis)?;
                let momentum = weighted_add(graph, m_read, grad_mean, self.beta1)?;
                let assigned = graph.assign(m_var, momentum)?;
                self.assigns.push(assigned);
                momentum
            } else {
                graph.reduce_mean(grad, axis)?
            };
            let biased = graph.add(second, self.epsilon)?;
            let inv = graph.rsqrt(biased);
            parts.push(graph.mul(first, inv)?);
        }

        let mut update = parts
            .first()
            .copied()
            .ok_or_else(|| anyhow!("factorized adam applied to a zero-rank variable"))?;
        for part in &parts[1..] {
            update = graph.add(update, *part)?;
        }
        let mean = graph.constant(1.0 / parts.len() as f64, graph.dtype(grad));
        graph.mul(update, mean)
    }

    pub fn debug_gradients(&self) -> &HashMap<String, String> {
        &self.debug_gradients
    }

    /// Fans every collected assignment into one `CombinedAssign` op.
    pub fn finish(self, graph: &mut Graph) -> Result<(OpId, HashMap<String, String>)> {
        let op = graph.combine_assignments(&self.assigns)?;
        Ok((op, self.debug_gradients))
    }
}
