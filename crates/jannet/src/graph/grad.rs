//! Gradient rules for every differentiable operation kind.
//!
//! Each rule maps (operation, output gradients) to one gradient per input,
//! emitting the backward expressions into the same graph. Broadcasting
//! binary ops reduce their gradient back onto the operand's own shape, so a
//! scalar constant used against a full tensor receives a scalar gradient.

use anyhow::{bail, Result};

use super::{BinaryOp, CompareOp, Graph, OpId, OpKind, ReduceKind, Shape, TensorId, UnaryOp};

impl Graph {
    /// Reduce-sums `value` down to `target` when the shapes differ.
    fn reduce_to(&mut self, value: TensorId, target: &Shape) -> Result<TensorId> {
        if self.shape(value) == target {
            return Ok(value);
        }
        self.reduce_sum(value, target.clone())
    }

    /// Invokes the gradient rule of `op`, returning one optional gradient
    /// per input. Callers must only pass ops with `has_gradient()`.
    pub(crate) fn gradient(
        &mut self,
        op: OpId,
        grad_outputs: &[Option<TensorId>],
    ) -> Result<Vec<Option<TensorId>>> {
        let record = self.op(op).clone();
        let dy = match grad_outputs.first().copied().flatten() {
            Some(dy) => dy,
            None => return Ok(vec![None; record.inputs.len()]),
        };

        match record.kind {
            OpKind::Binary(binary) => {
                let lhs = record.inputs[0];
                let rhs = record.inputs[1];
                let lhs_shape = self.shape(lhs).clone();
                let rhs_shape = self.shape(rhs).clone();
                let (dl, dr) = match binary {
                    BinaryOp::Add => (dy, dy),
                    BinaryOp::Sub => {
                        let negated = self.neg(dy);
                        (dy, negated)
                    }
                    BinaryOp::Mul => {
                        let dl = self.mul(dy, rhs)?;
                        let dr = self.mul(dy, lhs)?;
                        (dl, dr)
                    }
                    BinaryOp::Div => {
                        let dl = self.div(dy, rhs)?;
                        let quotient = self.div(lhs, rhs)?;
                        let scaled = self.mul(dy, quotient)?;
                        let over = self.div(scaled, rhs)?;
                        (dl, self.neg(over))
                    }
                    BinaryOp::Maximum | BinaryOp::Minimum => {
                        let mask = if matches!(binary, BinaryOp::Maximum) {
                            self.compare(CompareOp::GreaterEqual, lhs, rhs)?
                        } else {
                            self.compare(CompareOp::GreaterEqual, rhs, lhs)?
                        };
                        let one = self.constant(1.0, self.dtype(dy));
                        let inverse = self.sub(one, mask)?;
                        let dl = self.mul(dy, mask)?;
                        let dr = self.mul(dy, inverse)?;
                        (dl, dr)
                    }
                };
                let dl = self.reduce_to(dl, &lhs_shape)?;
                let dr = self.reduce_to(dr, &rhs_shape)?;
                Ok(vec![Some(dl), Some(dr)])
            }
            OpKind::Unary(unary) => {
                let x = record.inputs[0];
                let dx = match unary {
                    UnaryOp::Neg => self.neg(dy),
                    UnaryOp::Square => {
                        let two = self.constant(2.0, self.dtype(x));
                        let scaled = self.mul(two, x)?;
                        self.mul(dy, scaled)?
                    }
                    UnaryOp::Sqrt => {
                        let half = self.constant(0.5, self.dtype(x));
                        let inv = self.rsqrt(x);
                        let scaled = self.mul(half, inv)?;
                        self.mul(dy, scaled)?
                    }
                    UnaryOp::Rsqrt => {
                        let coeff = self.constant(-0.5, self.dtype(x));
                        let inv_sqrt = self.rsqrt(x);
                        let inv = self.reciprocal(x);
                        let a = self.mul(coeff, inv_sqrt)?;
                        let b = self.mul(a, inv)?;
                        self.mul(dy, b)?
                    }
                    UnaryOp::Reciprocal => {
                        let sq = self.square(x);
                        let over = self.div(dy, sq)?;
                        self.neg(over)
                    }
                    UnaryOp::Abs => {
                        let zero = self.constant(0.0, self.dtype(x));
                        let positive = self.compare(CompareOp::GreaterEqual, x, zero)?;
                        let two = self.constant(2.0, self.dtype(x));
                        let one = self.constant(1.0, self.dtype(x));
                        let doubled = self.mul(two, positive)?;
                        let sign = self.sub(doubled, one)?;
                        self.mul(dy, sign)?
                    }
                };
                Ok(vec![Some(dx)])
            }
            OpKind::Reduce { kind, .. } => {
                let x = record.inputs[0];
                let in_shape = self.shape(x).clone();
                match kind {
                    ReduceKind::Sum => {
                        let dx = self.broadcast(dy, in_shape)?;
                        Ok(vec![Some(dx)])
                    }
                    ReduceKind::Mean => {
                        let out_size = self.shape(dy).size().max(1);
                        let scale = out_size as f64 / in_shape.size() as f64;
                        let spread = self.broadcast(dy, in_shape)?;
                        let coeff = self.constant(scale, self.dtype(dy));
                        let dx = self.mul(spread, coeff)?;
                        Ok(vec![Some(dx)])
                    }
                    ReduceKind::Max | ReduceKind::Min => {
                        bail!("reduce max/min carries no gradient rule")
                    }
                }
            }
            OpKind::Broadcast { .. } => {
                let x = record.inputs[0];
                let in_shape = self.shape(x).clone();
                let dx = self.reduce_to(dy, &in_shape)?;
                Ok(vec![Some(dx)])
            }
            OpKind::Reshape { .. } => {
                let x = record.inputs[0];
                let in_shape = self.shape(x).clone();
                let dx = self.reshape(dy, in_shape)?;
                Ok(vec![Some(dx)])
            }
            OpKind::Cast(_) => {
                let x = record.inputs[0];
                let dx = self.cast(dy, self.dtype(x));
                Ok(vec![Some(dx)])
            }
            OpKind::Variable(_) | OpKind::Constant(_) => Ok(Vec::new()),
            OpKind::Compare(_)
            | OpKind::StopGradient
            | OpKind::Assign(_)
            | OpKind::AssignSub(_)
            | OpKind::CombinedAssign => {
                bail!("operation {:?} has no gradient rule", record.kind)
            }
        }
    }
}
