//! The QR expansion pass.
//!
//! Scans the module's entry graph for custom operations tagged
//! [`QR_CUSTOM_OP_TARGET`], emits (or reuses) a sub-program computing the
//! blocked Householder factorization for the operand's shape, and rewrites
//! the matched node into a call to it.
//!
//! Sub-programs are memoized per expander instance, keyed by the string
//! rendering of the operand shape, so every call site with an identical
//! signature shares one sub-program. The cache lives on the expander, not
//! in any process-wide state: the intended lifecycle is one expander per
//! compilation.

pub(crate) mod block;
pub(crate) mod house;
pub(crate) mod panel;
pub(crate) mod wy;

use std::collections::HashMap;

use crate::graph::{Graph, NodeId, OpKind};
use crate::module::Module;
use crate::types::{ExpandError, ExpandResult, Precision, Shape};

/// Custom-call target name this pass matches.
pub const QR_CUSTOM_OP_TARGET: &str = "QrDecomposition";

/// Expansion knobs. The defaults are contractual: block size 128 for
/// numeric compatibility, and highest-precision matmul for the internal
/// products (lower precision measurably degrades the orthogonality of
/// `Q`).
#[derive(Debug, Clone, Copy)]
pub struct ExpanderOptions {
    pub block_size: usize,
    pub precision: Precision,
}

impl Default for ExpanderOptions {
    fn default() -> Self {
        ExpanderOptions {
            block_size: 128,
            precision: Precision::Highest,
        }
    }
}

/// The expansion pass. Holds the per-instance sub-program cache.
pub struct QrExpander {
    options: ExpanderOptions,
    /// Operand shape signature → installed sub-program index.
    cache: HashMap<String, usize>,
}

impl QrExpander {
    pub fn new() -> Self {
        Self::with_options(ExpanderOptions::default())
    }

    pub fn with_options(options: ExpanderOptions) -> Self {
        QrExpander {
            options,
            cache: HashMap::new(),
        }
    }

    /// Number of distinct sub-programs this expander has emitted.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Expand every matching custom operation in the module's entry graph.
    /// Returns whether anything was rewritten.
    pub fn run(&mut self, module: &mut Module) -> ExpandResult<bool> {
        let matches: Vec<NodeId> = module
            .entry
            .nodes
            .iter()
            .filter(|node| {
                matches!(&node.kind, OpKind::CustomOp { target } if target == QR_CUSTOM_OP_TARGET)
            })
            .map(|node| node.id)
            .collect();

        let mut changed = false;
        for node_id in matches {
            self.expand_instruction(module, node_id)?;
            changed = true;
        }
        Ok(changed)
    }

    fn expand_instruction(&mut self, module: &mut Module, node_id: NodeId) -> ExpandResult<()> {
        let node = module
            .entry
            .node(node_id)
            .ok_or_else(|| ExpandError::Internal(format!("unknown node id {}", node_id.0)))?;
        if node.inputs.len() != 1 {
            return Err(ExpandError::InvalidArgument(format!(
                "{QR_CUSTOM_OP_TARGET} takes exactly one operand, got {}",
                node.inputs.len()
            )));
        }
        let operand_shape = module.entry.shape(node.inputs[0])?.clone();
        let key = operand_shape.to_string();

        let callee = match self.cache.get(&key) {
            Some(&index) => {
                log::debug!("qr expansion cache hit for {key}");
                index
            }
            None => {
                let sub = build_qr_subprogram(
                    &operand_shape,
                    self.options.block_size,
                    self.options.precision,
                )?;
                log::debug!(
                    "qr expansion cache miss for {key}: emitted `{}` with {} nodes",
                    sub.name,
                    sub.num_nodes()
                );
                let index = module.add_subprogram(sub);
                self.cache.insert(key, index);
                index
            }
        };

        module.rewrite_to_call(node_id, callee)
    }
}

impl Default for QrExpander {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a self-contained sub-program `a -> (q, r)` for one operand shape.
pub fn build_qr_subprogram(
    shape: &Shape,
    block_size: usize,
    precision: Precision,
) -> ExpandResult<Graph> {
    let mut graph = Graph::new(format!("qr_{shape}"));
    let a = graph.parameter(shape.clone());
    let (q, r) = block::emit_qr_blocked(&mut graph, a, block_size, precision)?;
    graph.set_outputs(vec![q, r]);
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    /// Entry graph with one QR custom op of the given operand dims.
    fn qr_module(dims: &[usize]) -> Module {
        let mut entry = Graph::new("main");
        let shape = Shape::new(dims.to_vec(), DType::F32);
        let a = entry.parameter(shape.clone());
        let rank = dims.len();
        let m = dims[rank - 2];
        let mut q_dims = dims[..rank - 2].to_vec();
        q_dims.push(m);
        q_dims.push(m);
        let outs = entry.custom_op(
            QR_CUSTOM_OP_TARGET,
            vec![a],
            vec![Shape::new(q_dims, DType::F32), shape],
        );
        entry.set_outputs(outs);
        Module::new(entry)
    }

    #[test]
    fn expands_matching_custom_op() {
        let mut module = qr_module(&[4, 3]);
        let mut expander = QrExpander::new();
        let changed = expander.run(&mut module).unwrap();
        assert!(changed);
        assert_eq!(module.subprograms.len(), 1);
        assert!(module
            .entry
            .nodes
            .iter()
            .all(|n| !matches!(n.kind, OpKind::CustomOp { .. })));
        // The installed sub-program takes one parameter and returns (q, r).
        let sub = module.subprogram(0).unwrap();
        assert_eq!(sub.graph.num_parameters(), 1);
        assert_eq!(sub.graph.outputs.len(), 2);
    }

    #[test]
    fn leaves_other_targets_alone() {
        let mut entry = Graph::new("main");
        let a = entry.parameter(Shape::new(vec![3, 3], DType::F32));
        let outs = entry.custom_op("Cholesky", vec![a], vec![Shape::new(vec![3, 3], DType::F32)]);
        entry.set_outputs(outs);
        let mut module = Module::new(entry);

        let mut expander = QrExpander::new();
        let changed = expander.run(&mut module).unwrap();
        assert!(!changed);
        assert!(module.subprograms.is_empty());
    }

    #[test]
    fn same_signature_shares_one_subprogram() {
        let mut entry = Graph::new("main");
        let shape = Shape::new(vec![2, 5, 3], DType::F32);
        let a = entry.parameter(shape.clone());
        let b = entry.parameter(shape.clone());
        let q_shape = Shape::new(vec![2, 5, 5], DType::F32);
        let first = entry.custom_op(
            QR_CUSTOM_OP_TARGET,
            vec![a],
            vec![q_shape.clone(), shape.clone()],
        );
        let second = entry.custom_op(QR_CUSTOM_OP_TARGET, vec![b], vec![q_shape, shape]);
        let mut outputs = first;
        outputs.extend(second);
        entry.set_outputs(outputs);
        let mut module = Module::new(entry);

        let mut expander = QrExpander::new();
        expander.run(&mut module).unwrap();
        assert_eq!(module.subprograms.len(), 1, "signature must be shared");
        assert_eq!(expander.cache_size(), 1);
        let callees: Vec<usize> = module
            .entry
            .nodes
            .iter()
            .filter_map(|n| match n.kind {
                OpKind::Call { callee } => Some(callee),
                _ => None,
            })
            .collect();
        assert_eq!(callees, vec![0, 0]);
    }

    #[test]
    fn different_signatures_get_distinct_subprograms() {
        let mut entry = Graph::new("main");
        let s1 = Shape::new(vec![4, 3], DType::F32);
        let s2 = Shape::new(vec![3, 3], DType::F32);
        let a = entry.parameter(s1.clone());
        let b = entry.parameter(s2.clone());
        let mut outs = entry.custom_op(
            QR_CUSTOM_OP_TARGET,
            vec![a],
            vec![Shape::new(vec![4, 4], DType::F32), s1],
        );
        outs.extend(entry.custom_op(
            QR_CUSTOM_OP_TARGET,
            vec![b],
            vec![Shape::new(vec![3, 3], DType::F32), s2],
        ));
        entry.set_outputs(outs);
        let mut module = Module::new(entry);

        let mut expander = QrExpander::new();
        expander.run(&mut module).unwrap();
        assert_eq!(module.subprograms.len(), 2);
        assert_eq!(expander.cache_size(), 2);
    }

    #[test]
    fn invalid_operand_leaves_node_unmodified() {
        let mut entry = Graph::new("main");
        let a = entry.parameter(Shape::new(vec![5], DType::F32));
        let outs = entry.custom_op(
            QR_CUSTOM_OP_TARGET,
            vec![a],
            vec![Shape::new(vec![5], DType::F32)],
        );
        entry.set_outputs(outs.clone());
        let node_id = entry.value(outs[0]).unwrap().producer.unwrap();
        let mut module = Module::new(entry);

        let mut expander = QrExpander::new();
        let err = expander.run(&mut module).unwrap_err();
        assert!(matches!(err, ExpandError::InvalidArgument(_)));
        let node = module.entry.node(node_id).unwrap();
        assert!(matches!(node.kind, OpKind::CustomOp { .. }));
        assert!(module.subprograms.is_empty());
    }
}
