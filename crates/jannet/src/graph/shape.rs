//! Named-dimension shapes for mesh-sharded tensors.
//!
//! Every axis carries a name in addition to its extent. Downstream layout
//! logic (fan-in inference, feature-dimension classification, reductions)
//! selects axes by name, never by position alone, so the same parameter can
//! be reasoned about regardless of how the mesh runtime laid it out.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Scalar element types tracked at the graph level.
///
/// The reference executor computes everything in f32; the dtype is carried
/// for bookkeeping and checkpoint layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    Bf16,
    F64,
}

impl Default for DType {
    fn default() -> Self {
        DType::F32
    }
}

/// A single named axis extent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dim {
    name: Arc<str>,
    size: usize,
}

impl Dim {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: Arc::<str>::from(name.into()),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.size)
    }
}

/// Ordered list of named dimensions. A rank-0 shape is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<Dim>,
}

impl Shape {
    /// Builds a shape, dropping repeated dimension names while keeping the
    /// first occurrence.
    pub fn new(dims: impl Into<Vec<Dim>>) -> Self {
        let mut seen: Vec<Arc<str>> = Vec::new();
        let mut out = Vec::new();
        for dim in dims.into() {
            if seen.iter().any(|name| **name == *dim.name) {
                continue;
            }
            seen.push(Arc::clone(&dim.name));
            out.push(dim);
        }
        Self { dims: out }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Total element count.
    pub fn size(&self) -> usize {
        self.dims.iter().map(Dim::size).product()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name() == name)
    }

    /// New shape with the listed dimension names removed.
    pub fn without(&self, names: &[&str]) -> Shape {
        Shape {
            dims: self
                .dims
                .iter()
                .filter(|d| !names.contains(&d.name()))
                .cloned()
                .collect(),
        }
    }

    /// Union of two shapes: this shape's dims followed by the other's dims
    /// whose names are not already present. Sizes of shared names must agree.
    pub fn union(&self, other: &Shape) -> Option<Shape> {
        let mut dims = self.dims.clone();
        for dim in &other.dims {
            match self.dims.iter().find(|d| d.name() == dim.name()) {
                Some(existing) if existing.size() != dim.size() => return None,
                Some(_) => {}
                None => dims.push(dim.clone()),
            }
        }
        Some(Shape { dims })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<Dim>> for Shape {
    fn from(dims: Vec<Dim>) -> Self {
        Shape::new(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_dedups_repeated_names() {
        let shape = Shape::new(vec![
            Dim::new("heads", 4),
            Dim::new("key", 8),
            Dim::new("heads", 4),
        ]);
        assert_eq!(shape.rank(), 2);
        assert_eq!(shape.size(), 32);
    }

    #[test]
    fn union_rejects_conflicting_sizes() {
        let a = Shape::new(vec![Dim::new("batch", 2)]);
        let b = Shape::new(vec![Dim::new("batch", 3)]);
        assert!(a.union(&b).is_none());

        let c = Shape::new(vec![Dim::new("batch", 2), Dim::new("key", 8)]);
        let joined = a.union(&c).unwrap();
        assert_eq!(joined.rank(), 2);
        assert_eq!(joined.index_of("key"), Some(1));
    }
}
