//! Reference CPU executor for the jannet optimizer graph.
//!
//! Interprets a [`Graph`] on host `f32` buffers: ops are evaluated in
//! declaration order into a `TensorId -> HostTensor` environment, and
//! variable storage persists across runs keyed by variable name, so a
//! training loop that rebuilds the graph each step still sees its optimizer
//! state. Exists to test the optimizer core; it is not a training runtime.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use jannet::graph::{
    BinaryOp, CompareOp, Graph, Op, OpKind, ReduceKind, Shape, TensorId, UnaryOp, VarInit,
    Variable,
};

/// Errors raised while interpreting a graph.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("tensor value missing during execution")]
    MissingValue,
    #[error("variable `{0}` has no storage")]
    MissingVariable(String),
    #[error("operand dim `{0}` missing from result shape")]
    MissingDim(String),
    #[error("variable `{name}` holds {held} elements, graph expects {expected}")]
    StorageSize {
        name: String,
        held: usize,
        expected: usize,
    },
}

/// A dense host tensor with named dimensions.
#[derive(Debug, Clone)]
pub struct HostTensor {
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn scalar(value: f32) -> Self {
        HostTensor {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }
}

/// Tensor values produced by one run.
#[derive(Debug, Default)]
pub struct Env {
    values: HashMap<TensorId, HostTensor>,
}

impl Env {
    pub fn tensor(&self, id: TensorId) -> Option<&HostTensor> {
        self.values.get(&id)
    }

    pub fn scalar(&self, id: TensorId) -> Option<f32> {
        self.values.get(&id).and_then(|t| t.data.first().copied())
    }
}

/// Persistent interpreter state: variable storage and the init RNG.
pub struct Executor {
    storage: HashMap<String, Vec<f32>>,
    rng: StdRng,
}

impl Default for Executor {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(seed: u64) -> Self {
        Executor {
            storage: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn read_variable(&self, name: &str) -> Option<&[f32]> {
        self.storage.get(name).map(Vec::as_slice)
    }

    pub fn set_variable(&mut self, name: &str, data: Vec<f32>) {
        self.storage.insert(name.to_string(), data);
    }

    fn ensure_storage(&mut self, var: &Variable) -> Result<(), ExecError> {
        let expected = var.shape.size();
        if let Some(held) = self.storage.get(&var.name) {
            if held.len() != expected {
                return Err(ExecError::StorageSize {
                    name: var.name.clone(),
                    held: held.len(),
                    expected,
                });
            }
            return Ok(());
        }
        let data = match var.init {
            VarInit::Zeros => vec![0.0; expected],
            VarInit::Ones => vec![1.0; expected],
            VarInit::Constant(value) => vec![value as f32; expected],
            VarInit::Normal { stddev } => {
                let rng = &mut self.rng;
                (0..expected)
                    .map(|_| {
                        // Box-Muller over two uniform draws.
                        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                        let u2: f64 = rng.gen();
                        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                        (z * stddev) as f32
                    })
                    .collect()
            }
        };
        self.storage.insert(var.name.clone(), data);
        Ok(())
    }

    /// Evaluates every op in declaration order, applying assignments to the
    /// persistent variable storage.
    pub fn run(&mut self, graph: &Graph) -> Result<Env, ExecError> {
        let mut env = Env::default();
        for op in graph.ops() {
            let result = self.eval(graph, op, &env)?;
            env.values.insert(op.outputs[0], result);
        }
        Ok(env)
    }

    fn eval(&mut self, graph: &Graph, op: &Op, env: &Env) -> Result<HostTensor, ExecError> {
        let out_shape = graph.shape(op.outputs[0]).clone();

        match &op.kind {
            OpKind::Variable(var_id) => {
                let var = graph.variable(*var_id);
                self.ensure_storage(var)?;
                let data = self
                    .storage
                    .get(&var.name)
                    .ok_or_else(|| ExecError::MissingVariable(var.name.clone()))?
                    .clone();
                Ok(HostTensor {
                    shape: out_shape,
                    data,
                })
            }
            OpKind::Constant(value) => Ok(HostTensor::scalar(*value as f32)),
            OpKind::Binary(binary) => {
                let op_fn = match binary {
                    BinaryOp::Add => |a: f32, b: f32| a + b,
                    BinaryOp::Sub => |a: f32, b: f32| a - b,
                    BinaryOp::Mul => |a: f32, b: f32| a * b,
                    BinaryOp::Div => |a: f32, b: f32| a / b,
                    BinaryOp::Maximum => f32::max,
                    BinaryOp::Minimum => f32::min,
                };
                broadcast_zip(fetch(env, op, 0)?, fetch(env, op, 1)?, &out_shape, op_fn)
            }
            OpKind::Compare(compare) => {
                let op_fn = match compare {
                    CompareOp::Greater => |a: f32, b: f32| (a > b) as u8 as f32,
                    CompareOp::GreaterEqual => |a: f32, b: f32| (a >= b) as u8 as f32,
                    CompareOp::Equal => |a: f32, b: f32| (a == b) as u8 as f32,
                };
                broadcast_zip(fetch(env, op, 0)?, fetch(env, op, 1)?, &out_shape, op_fn)
            }
            OpKind::Unary(unary) => {
                let op_fn = match unary {
                    UnaryOp::Neg => |x: f32| -x,
                    UnaryOp::Square => |x: f32| x * x,
                    UnaryOp::Sqrt => f32::sqrt,
                    UnaryOp::Rsqrt => |x: f32| x.sqrt().recip(),
                    UnaryOp::Reciprocal => f32::recip,
                    UnaryOp::Abs => f32::abs,
                };
                let operand = fetch(env, op, 0)?;
                Ok(HostTensor {
                    shape: out_shape,
                    data: operand.data.iter().copied().map(op_fn).collect(),
                })
            }
            OpKind::Reduce { kind, .. } => reduce(fetch(env, op, 0)?, &out_shape, *kind),
            OpKind::Broadcast { .. } => {
                let operand = fetch(env, op, 0)?;
                let mut data = Vec::with_capacity(out_shape.size());
                for flat in 0..out_shape.size() {
                    let coords = unravel(flat, &out_shape);
                    data.push(operand.data[project(&operand.shape, &out_shape, &coords)?]);
                }
                Ok(HostTensor {
                    shape: out_shape,
                    data,
                })
            }
            OpKind::Reshape { .. } => Ok(HostTensor {
                shape: out_shape,
                data: fetch(env, op, 0)?.data.clone(),
            }),
            OpKind::Cast(_) | OpKind::StopGradient => Ok(HostTensor {
                shape: out_shape,
                data: fetch(env, op, 0)?.data.clone(),
            }),
            OpKind::Assign(var_id) => {
                let var = graph.variable(*var_id);
                self.ensure_storage(var)?;
                let value = fetch(env, op, 0)?;
                let mut data = Vec::with_capacity(out_shape.size());
                for flat in 0..out_shape.size() {
                    let coords = unravel(flat, &out_shape);
                    data.push(value.data[project(&value.shape, &out_shape, &coords)?]);
                }
                self.storage.insert(var.name.clone(), data.clone());
                Ok(HostTensor {
                    shape: out_shape,
                    data,
                })
            }
            OpKind::AssignSub(var_id) => {
                let var = graph.variable(*var_id);
                self.ensure_storage(var)?;
                let value = fetch(env, op, 0)?;
                let held = self
                    .storage
                    .get(&var.name)
                    .ok_or_else(|| ExecError::MissingVariable(var.name.clone()))?;
                let mut data = Vec::with_capacity(out_shape.size());
                for (flat, current) in held.iter().enumerate() {
                    let coords = unravel(flat, &out_shape);
                    data.push(current - value.data[project(&value.shape, &out_shape, &coords)?]);
                }
                self.storage.insert(var.name.clone(), data.clone());
                Ok(HostTensor {
                    shape: out_shape,
                    data,
                })
            }
            OpKind::CombinedAssign => Ok(HostTensor::scalar(0.0)),
        }
    }
}

fn fetch<'e>(env: &'e Env, op: &Op, slot: usize) -> Result<&'e HostTensor, ExecError> {
    env.values
        .get(&op.inputs[slot])
        .ok_or(ExecError::MissingValue)
}

/// Row-major coordinates of `flat` within `shape`.
fn unravel(flat: usize, shape: &Shape) -> Vec<usize> {
    let mut coords = vec![0; shape.rank()];
    let mut rest = flat;
    for (slot, dim) in shape.dims().iter().enumerate().rev() {
        coords[slot] = rest % dim.size();
        rest /= dim.size();
    }
    coords
}

/// Flat index into `operand` for the element addressed by `coords` in the
/// enclosing `out` shape. Dimensions are matched by name; dims of `out`
/// absent from the operand are broadcast over.
fn project(operand: &Shape, out: &Shape, coords: &[usize]) -> Result<usize, ExecError> {
    let mut flat = 0;
    for dim in operand.dims() {
        let slot = out
            .index_of(dim.name())
            .ok_or_else(|| ExecError::MissingDim(dim.name().to_string()))?;
        flat = flat * dim.size() + coords[slot];
    }
    Ok(flat)
}

fn broadcast_zip(
    lhs: &HostTensor,
    rhs: &HostTensor,
    out_shape: &Shape,
    op_fn: impl Fn(f32, f32) -> f32,
) -> Result<HostTensor, ExecError> {
    let mut data = Vec::with_capacity(out_shape.size());
    for flat in 0..out_shape.size() {
        let coords = unravel(flat, out_shape);
        let a = lhs.data[project(&lhs.shape, out_shape, &coords)?];
        let b = rhs.data[project(&rhs.shape, out_shape, &coords)?];
        data.push(op_fn(a, b));
    }
    Ok(HostTensor {
        shape: out_shape.clone(),
        data,
    })
}

fn reduce(operand: &HostTensor, out_shape: &Shape, kind: ReduceKind) -> Result<HostTensor, ExecError> {
    let fill = match kind {
        ReduceKind::Sum | ReduceKind::Mean => 0.0,
        ReduceKind::Max => f32::NEG_INFINITY,
        ReduceKind::Min => f32::INFINITY,
    };
    let mut data = vec![fill; out_shape.size()];
    for flat in 0..operand.shape.size() {
        let coords = unravel(flat, &operand.shape);
        let slot = project(out_shape, &operand.shape, &coords)?;
        let value = operand.data[flat];
        match kind {
            ReduceKind::Sum | ReduceKind::Mean => data[slot] += value,
            ReduceKind::Max => data[slot] = data[slot].max(value),
            ReduceKind::Min => data[slot] = data[slot].min(value),
        }
    }
    if kind == ReduceKind::Mean {
        let group = (operand.shape.size() / out_shape.size().max(1)).max(1) as f32;
        for value in &mut data {
            *value /= group;
        }
    }
    Ok(HostTensor {
        shape: out_shape.clone(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jannet::graph::{DType, Dim};

    #[test]
    fn unravel_and_project_agree_on_transposed_operands() {
        let a = Dim::new("a", 2);
        let b = Dim::new("b", 3);
        let out = Shape::new(vec![a.clone(), b.clone()]);
        let transposed = Shape::new(vec![b, a]);
        // out coords (1, 2) -> operand coords (2, 1) -> flat 2*2 + 1.
        let coords = unravel(5, &out);
        assert_eq!(coords, vec![1, 2]);
        assert_eq!(project(&transposed, &out, &coords).unwrap(), 5);
    }

    #[test]
    fn variables_initialize_once_and_persist() {
        let mut graph = Graph::new();
        let shape = Shape::new(vec![Dim::new("features", 3)]);
        graph
            .get_or_create_variable("w", shape, DType::F32, true, VarInit::Ones)
            .unwrap();

        let mut exec = Executor::new();
        exec.run(&graph).unwrap();
        assert_eq!(exec.read_variable("w").unwrap(), &[1.0, 1.0, 1.0]);

        exec.set_variable("w", vec![2.0, 3.0, 4.0]);
        exec.run(&graph).unwrap();
        assert_eq!(exec.read_variable("w").unwrap(), &[2.0, 3.0, 4.0]);
    }
}
