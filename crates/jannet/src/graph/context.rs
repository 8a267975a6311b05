//! Per-build construction state.
//!
//! Name counters and the weight-sharing cache live in a `BuildContext`
//! created fresh at each macro-batch slice boundary, so name resolution and
//! parameter sharing are deterministic and slice-independent. Nothing here
//! is process-global.

use std::collections::HashMap;

use anyhow::Result;

use super::{DType, Graph, Shape, TensorId, VarInit};

/// Identifies a weight-sharing site: which block instance is being built,
/// under which block configuration, inside which named builder function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareKey {
    pub block: usize,
    pub config: String,
    pub function: String,
}

impl ShareKey {
    pub fn new(block: usize, config: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            block,
            config: config.into(),
            function: function.into(),
        }
    }
}

/// Construction-scoped caches: unique-name counters and the parameter cache
/// deduplicating shared variables across repeated invocations of the same
/// named block.
#[derive(Debug, Default)]
pub struct BuildContext {
    name_indices: HashMap<String, usize>,
    parameter_cache: HashMap<(String, String), Vec<TensorId>>,
    call_indices: HashMap<(String, String), usize>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `prefix` on first use, `prefix_{n}` afterwards. Counters are
    /// per-context, so two contexts produce identical name sequences for
    /// identical build calls.
    pub fn unique_name(&mut self, prefix: &str) -> String {
        let index = self.name_indices.entry(prefix.to_string()).or_insert(0);
        *index += 1;
        if *index == 1 {
            prefix.to_string()
        } else {
            format!("{prefix}_{index}")
        }
    }

    /// Creates a trainable parameter, or resolves a shared one.
    ///
    /// Block 0 always creates and records the variable; later blocks replay
    /// the recorded variables in call order, cycling once the call index
    /// reaches the number of creations, so every block past the first maps
    /// onto the same underlying parameters.
    pub fn shared_parameter(
        &mut self,
        graph: &mut Graph,
        key: &ShareKey,
        shape: Shape,
        dtype: DType,
        init: VarInit,
    ) -> Result<TensorId> {
        let cache_key = (key.config.clone(), key.function.clone());
        if key.block == 0 {
            let name = self.unique_name(&format!(
                "body/{}_{}/{}",
                key.block, key.config, key.function
            ));
            let read = graph.get_or_create_variable(name, shape, dtype, true, init)?;
            self.parameter_cache.entry(cache_key).or_default().push(read);
            return Ok(read);
        }

        let created = self
            .parameter_cache
            .get(&cache_key)
            .cloned()
            .unwrap_or_default();
        if created.is_empty() {
            // Nothing recorded to share; fall back to a private parameter.
            let name = self.unique_name(&format!(
                "body/{}_{}/{}",
                key.block, key.config, key.function
            ));
            return graph.get_or_create_variable(name, shape, dtype, true, init);
        }
        let counter = self.call_indices.entry(cache_key).or_insert(0);
        let read = created[*counter % created.len()];
        *counter += 1;
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Dim;

    #[test]
    fn unique_names_are_deterministic_per_context() {
        let mut a = BuildContext::new();
        let mut b = BuildContext::new();
        for _ in 0..3 {
            assert_eq!(a.unique_name("attn"), b.unique_name("attn"));
        }
        assert_eq!(a.unique_name("attn"), "attn_4");
    }

    #[test]
    fn shared_parameters_replay_in_call_order() {
        let mut graph = Graph::new();
        let mut ctx = BuildContext::new();
        let shape = Shape::new(vec![Dim::new("features", 4)]);

        let key0 = ShareKey::new(0, "wide", "linear");
        let w0 = ctx
            .shared_parameter(&mut graph, &key0, shape.clone(), DType::F32, VarInit::Zeros)
            .unwrap();
        let w1 = ctx
            .shared_parameter(&mut graph, &key0, shape.clone(), DType::F32, VarInit::Zeros)
            .unwrap();
        assert_ne!(w0, w1);

        let key1 = ShareKey::new(1, "wide", "linear");
        let r0 = ctx
            .shared_parameter(&mut graph, &key1, shape.clone(), DType::F32, VarInit::Zeros)
            .unwrap();
        let r1 = ctx
            .shared_parameter(&mut graph, &key1, shape, DType::F32, VarInit::Zeros)
            .unwrap();
        assert_eq!(r0, w0);
        assert_eq!(r1, w1);
    }
}
