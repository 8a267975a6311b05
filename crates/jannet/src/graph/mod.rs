//! Operation graph staged by the optimizer core.
//!
//! The graph is an append-only arena of operation records: emitting an op
//! allocates output tensor ids and preserves insertion order, which later
//! doubles as a valid forward dependency order (ops are always declared
//! after their operands). The mesh runtime that executes the graph is an
//! external collaborator; nothing here schedules computation.
//!
//! ```text
//! BuildContext (naming / weight sharing)
//!        |
//!        v
//! Graph::emit_* -> Op records + TensorMeta
//!        |
//!        v
//! grads::backward (reverse walk)  ->  optim::update (assignment ops)
//! ```

mod context;
mod grad;
mod shape;

pub use context::{BuildContext, ShareKey};
pub use shape::{DType, Dim, Shape};

use std::collections::HashMap;
use std::fmt;

use anyhow::{anyhow, bail, ensure, Result};

/// Identifies a tensor edge in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

/// Identifies an operation node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

/// Identifies a persistent variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    Minimum,
}

/// Elementwise unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Square,
    Sqrt,
    Rsqrt,
    Reciprocal,
    Abs,
}

/// Comparators producing 0/1-valued tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Greater,
    GreaterEqual,
    Equal,
}

/// Reduction families over named dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Sum,
    Mean,
    Max,
    Min,
}

/// The operation payload. Attribute-bearing variants carry their result
/// shape explicitly so the record stays self-describing.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Reads a persistent variable; the single output is the variable value.
    Variable(VarId),
    /// Scalar constant, broadcast implicitly by consuming ops.
    Constant(f64),
    Binary(BinaryOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    Reduce { kind: ReduceKind, out: Shape },
    Broadcast { out: Shape },
    Reshape { out: Shape },
    Cast(DType),
    /// Identity forward, blocks the reverse walk.
    StopGradient,
    /// Overwrites the variable with the input value.
    Assign(VarId),
    /// Subtracts the input value from the variable.
    AssignSub(VarId),
    /// Fans in assignment outputs so the caller sees one atomic update op.
    CombinedAssign,
}

impl OpKind {
    /// Whether a gradient rule exists for this operation. Ops without one
    /// are silently skipped by the reverse walk; that is a legitimate state
    /// (control flow and assignments never need gradients), not an error.
    pub fn has_gradient(&self) -> bool {
        match self {
            OpKind::Variable(_)
            | OpKind::Constant(_)
            | OpKind::Compare(_)
            | OpKind::StopGradient
            | OpKind::Assign(_)
            | OpKind::AssignSub(_)
            | OpKind::CombinedAssign => false,
            OpKind::Reduce { kind, .. } => matches!(kind, ReduceKind::Sum | ReduceKind::Mean),
            _ => true,
        }
    }
}

/// A node in the computation graph. Immutable once emitted.
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// Shape/dtype metadata for a tensor edge, plus its unique producer.
#[derive(Debug, Clone)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
    pub producer: OpId,
}

/// Initialization recipe for a variable. Resolved by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum VarInit {
    Zeros,
    Ones,
    Constant(f64),
    Normal { stddev: f64 },
}

/// A persistent, device-sharded parameter. Lives for the whole training
/// process; mutated only through explicit assignment operations.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    pub trainable: bool,
    pub init: VarInit,
}

/// Append-only arena of operations, tensors, and variables.
#[derive(Debug, Default)]
pub struct Graph {
    ops: Vec<Op>,
    tensors: Vec<TensorMeta>,
    variables: Vec<Variable>,
    var_reads: HashMap<VarId, TensorId>,
    read_owner: HashMap<TensorId, VarId>,
    var_by_name: HashMap<String, VarId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn op(&self, id: OpId) -> &Op {
        &self.ops[id.0]
    }

    pub fn tensor(&self, id: TensorId) -> &TensorMeta {
        &self.tensors[id.0]
    }

    pub fn shape(&self, id: TensorId) -> &Shape {
        &self.tensors[id.0].shape
    }

    pub fn dtype(&self, id: TensorId) -> DType {
        self.tensors[id.0].dtype
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn variable_by_name(&self, name: &str) -> Option<VarId> {
        self.var_by_name.get(name).copied()
    }

    /// Ids of all trainable variables in creation order.
    pub fn trainable_variables(&self) -> Vec<VarId> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, var)| var.trainable)
            .map(|(idx, _)| VarId(idx))
            .collect()
    }

    /// The read tensor produced by a variable's op.
    pub fn read(&self, var: VarId) -> TensorId {
        self.var_reads[&var]
    }

    /// The variable whose read op produced this tensor, if any.
    pub fn variable_of(&self, tensor: TensorId) -> Option<VarId> {
        self.read_owner.get(&tensor).copied()
    }

    /// Number of input slots across the graph referencing each tensor.
    /// Computed from the true graph structure, not from gradient arity.
    pub fn consumer_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.tensors.len()];
        for op in &self.ops {
            for input in &op.inputs {
                counts[input.0] += 1;
            }
        }
        counts
    }

    fn alloc_tensor(&mut self, shape: Shape, dtype: DType, producer: OpId) -> TensorId {
        let id = TensorId(self.tensors.len());
        self.tensors.push(TensorMeta {
            shape,
            dtype,
            producer,
        });
        id
    }

    fn push_op(&mut self, kind: OpKind, inputs: Vec<TensorId>, out: Shape, dtype: DType) -> TensorId {
        let op_id = OpId(self.ops.len());
        let output = self.alloc_tensor(out, dtype, op_id);
        self.ops.push(Op {
            kind,
            inputs,
            outputs: vec![output],
        });
        output
    }

    /// Creates a variable (or returns the existing one when the name is
    /// already taken) and returns its read tensor. Optimizer state buffers
    /// rely on the reuse path: they are created lazily on first use and
    /// looked up by name on every later touch.
    pub fn get_or_create_variable(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        dtype: DType,
        trainable: bool,
        init: VarInit,
    ) -> Result<TensorId> {
        let name = name.into();
        if let Some(&existing) = self.var_by_name.get(&name) {
            let var = &self.variables[existing.0];
            ensure!(
                var.shape == shape,
                "variable `{}` redeclared with shape {} (was {})",
                name,
                shape,
                var.shape
            );
            return Ok(self.var_reads[&existing]);
        }

        let var_id = VarId(self.variables.len());
        self.variables.push(Variable {
            name: name.clone(),
            shape: shape.clone(),
            dtype,
            trainable,
            init,
        });
        self.var_by_name.insert(name, var_id);
        let read = self.push_op(OpKind::Variable(var_id), Vec::new(), shape, dtype);
        self.var_reads.insert(var_id, read);
        self.read_owner.insert(read, var_id);
        Ok(read)
    }

    /// Scalar constant.
    pub fn constant(&mut self, value: f64, dtype: DType) -> TensorId {
        self.push_op(OpKind::Constant(value), Vec::new(), Shape::scalar(), dtype)
    }

    /// Elementwise binary op. Operands broadcast against each other by
    /// dimension name; the result shape is the named union.
    pub fn binary(&mut self, op: BinaryOp, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        let lhs_shape = self.shape(lhs).clone();
        let rhs_shape = self.shape(rhs).clone();
        let out = lhs_shape.union(&rhs_shape).ok_or_else(|| {
            anyhow!(
                "binary {:?} operand shapes disagree: {} vs {}",
                op,
                lhs_shape,
                rhs_shape
            )
        })?;
        let dtype = self.dtype(lhs);
        Ok(self.push_op(OpKind::Binary(op), vec![lhs, rhs], out, dtype))
    }

    pub fn add(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn minimum(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Minimum, lhs, rhs)
    }

    pub fn maximum(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.binary(BinaryOp::Maximum, lhs, rhs)
    }

    pub fn unary(&mut self, op: UnaryOp, value: TensorId) -> TensorId {
        let meta = self.tensor(value).clone();
        self.push_op(OpKind::Unary(op), vec![value], meta.shape, meta.dtype)
    }

    pub fn neg(&mut self, value: TensorId) -> TensorId {
        self.unary(UnaryOp::Neg, value)
    }

    pub fn square(&mut self, value: TensorId) -> TensorId {
        self.unary(UnaryOp::Square, value)
    }

    pub fn sqrt(&mut self, value: TensorId) -> TensorId {
        self.unary(UnaryOp::Sqrt, value)
    }

    pub fn rsqrt(&mut self, value: TensorId) -> TensorId {
        self.unary(UnaryOp::Rsqrt, value)
    }

    pub fn reciprocal(&mut self, value: TensorId) -> TensorId {
        self.unary(UnaryOp::Reciprocal, value)
    }

    /// 0/1-valued comparison, broadcasting like a binary op.
    pub fn compare(&mut self, op: CompareOp, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        let lhs_shape = self.shape(lhs).clone();
        let rhs_shape = self.shape(rhs).clone();
        let out = lhs_shape.union(&rhs_shape).ok_or_else(|| {
            anyhow!(
                "compare {:?} operand shapes disagree: {} vs {}",
                op,
                lhs_shape,
                rhs_shape
            )
        })?;
        let dtype = self.dtype(lhs);
        Ok(self.push_op(OpKind::Compare(op), vec![lhs, rhs], out, dtype))
    }

    /// Reduces the named dimensions away. `out` must be a sub-shape of the
    /// operand (same names, same sizes, operand order).
    pub fn reduce(&mut self, kind: ReduceKind, value: TensorId, out: Shape) -> Result<TensorId> {
        let in_shape = self.shape(value).clone();
        for dim in out.dims() {
            let found = in_shape
                .dims()
                .iter()
                .find(|d| d.name() == dim.name())
                .ok_or_else(|| {
                    anyhow!(
                        "reduce output dim `{}` missing from operand shape {}",
                        dim.name(),
                        in_shape
                    )
                })?;
            ensure!(
                found.size() == dim.size(),
                "reduce output dim `{}` size mismatch: {} vs {}",
                dim.name(),
                dim.size(),
                found.size()
            );
        }
        let dtype = self.dtype(value);
        Ok(self.push_op(OpKind::Reduce { kind, out: out.clone() }, vec![value], out, dtype))
    }

    pub fn reduce_sum(&mut self, value: TensorId, out: Shape) -> Result<TensorId> {
        self.reduce(ReduceKind::Sum, value, out)
    }

    pub fn reduce_mean(&mut self, value: TensorId, out: Shape) -> Result<TensorId> {
        self.reduce(ReduceKind::Mean, value, out)
    }

    pub fn reduce_max(&mut self, value: TensorId, out: Shape) -> Result<TensorId> {
        self.reduce(ReduceKind::Max, value, out)
    }

    /// Replicates the operand into a larger shape. Every operand dim must
    /// appear in the target with the same size.
    pub fn broadcast(&mut self, value: TensorId, out: Shape) -> Result<TensorId> {
        let in_shape = self.shape(value).clone();
        for dim in in_shape.dims() {
            ensure!(
                out.dims().iter().any(|d| d.name() == dim.name() && d.size() == dim.size()),
                "broadcast target {} does not carry operand dim `{}`",
                out,
                dim.name()
            );
        }
        let dtype = self.dtype(value);
        Ok(self.push_op(OpKind::Broadcast { out: out.clone() }, vec![value], out, dtype))
    }

    /// Reinterprets the operand with a new shape of identical element count.
    pub fn reshape(&mut self, value: TensorId, out: Shape) -> Result<TensorId> {
        let in_shape = self.shape(value);
        ensure!(
            in_shape.size() == out.size(),
            "reshape element count mismatch: {} -> {}",
            in_shape,
            out
        );
        let dtype = self.dtype(value);
        Ok(self.push_op(OpKind::Reshape { out: out.clone() }, vec![value], out, dtype))
    }

    pub fn cast(&mut self, value: TensorId, dtype: DType) -> TensorId {
        let shape = self.shape(value).clone();
        self.push_op(OpKind::Cast(dtype), vec![value], shape, dtype)
    }

    /// Identity forward; the reverse walk never crosses it.
    pub fn stop_gradient(&mut self, value: TensorId) -> TensorId {
        let meta = self.tensor(value).clone();
        self.push_op(OpKind::StopGradient, vec![value], meta.shape, meta.dtype)
    }

    /// Emits an assignment overwriting `var` with `value`. The op's output
    /// is the assigned value, so assignments can fan into `CombinedAssign`.
    pub fn assign(&mut self, var: VarId, value: TensorId) -> Result<TensorId> {
        self.emit_assign(OpKind::Assign(var), var, value)
    }

    /// Emits `var <- var - value`.
    pub fn assign_sub(&mut self, var: VarId, value: TensorId) -> Result<TensorId> {
        self.emit_assign(OpKind::AssignSub(var), var, value)
    }

    fn emit_assign(&mut self, kind: OpKind, var: VarId, value: TensorId) -> Result<TensorId> {
        let var_shape = self.variable(var).shape.clone();
        let value_shape = self.shape(value).clone();
        for dim in value_shape.dims() {
            ensure!(
                var_shape
                    .dims()
                    .iter()
                    .any(|d| d.name() == dim.name() && d.size() == dim.size()),
                "assignment to `{}` {} from incompatible value shape {}",
                self.variable(var).name,
                var_shape,
                value_shape
            );
        }
        let dtype = self.variable(var).dtype;
        Ok(self.push_op(kind, vec![value], var_shape, dtype))
    }

    /// Fans all pending assignment outputs into one op so callers can treat
    /// the whole update as a single atomic operation.
    pub fn combine_assignments(&mut self, assigns: &[TensorId]) -> Result<OpId> {
        for &tensor in assigns {
            let producer = self.tensor(tensor).producer;
            ensure!(
                matches!(
                    self.op(producer).kind,
                    OpKind::Assign(_) | OpKind::AssignSub(_)
                ),
                "combine_assignments input is not an assignment output"
            );
        }
        let op_id = OpId(self.ops.len());
        let output = self.alloc_tensor(Shape::scalar(), DType::F32, op_id);
        self.ops.push(Op {
            kind: OpKind::CombinedAssign,
            inputs: assigns.to_vec(),
            outputs: vec![output],
        });
        Ok(op_id)
    }

    /// Count of assignment ops currently in the graph. Used by the
    /// macro-batch driver to check that intermediate slices leaked nothing.
    pub fn assignment_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op.kind, OpKind::Assign(_) | OpKind::AssignSub(_)))
            .count()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "graph: {} ops, {} tensors, {} variables",
            self.ops.len(),
            self.tensors.len(),
            self.variables.len()
        )
    }
}
