//! Host module — the entry graph plus the sub-programs installed by the
//! expander.
//!
//! A [`Subprogram`] is a self-contained callable graph (one parameter, a
//! pair of results for QR). Substitution happens directly in the module
//! representation: a matched custom operation keeps its node id, operands,
//! and declared output values; only its kind is rewritten to a `Call`.

use crate::graph::{Graph, NodeId, OpKind};
use crate::types::{ExpandError, ExpandResult, Shape};

/// A named, self-contained callable graph owned by the module.
#[derive(Debug, Clone)]
pub struct Subprogram {
    pub name: String,
    pub graph: Graph,
}

/// The compilation unit the expander rewrites: an entry graph and the
/// sub-programs referenced by its `Call` nodes.
#[derive(Debug, Clone)]
pub struct Module {
    pub entry: Graph,
    pub subprograms: Vec<Subprogram>,
}

impl Module {
    pub fn new(entry: Graph) -> Self {
        Module {
            entry,
            subprograms: Vec::new(),
        }
    }

    /// Install a sub-program and return the index `Call` nodes use.
    pub fn add_subprogram(&mut self, graph: Graph) -> usize {
        let index = self.subprograms.len();
        self.subprograms.push(Subprogram {
            name: graph.name.clone(),
            graph,
        });
        index
    }

    pub fn subprogram(&self, index: usize) -> ExpandResult<&Subprogram> {
        self.subprograms
            .get(index)
            .ok_or_else(|| ExpandError::Internal(format!("unknown subprogram index {index}")))
    }

    /// Rewrite an entry node in place to a `Call` of `callee`, after
    /// validating that the callee's signature matches the node's operands
    /// and declared output shapes. On error the node is left unmodified.
    pub fn rewrite_to_call(&mut self, node_id: NodeId, callee: usize) -> ExpandResult<()> {
        let sub = self.subprogram(callee)?;
        let node = self
            .entry
            .node(node_id)
            .ok_or_else(|| ExpandError::Internal(format!("unknown node id {}", node_id.0)))?;

        let param_shapes = sub.graph.parameter_shapes();
        if param_shapes.len() != node.inputs.len() {
            return Err(ExpandError::Internal(format!(
                "sub-program `{}` takes {} parameters, call site has {} operands",
                sub.name,
                param_shapes.len(),
                node.inputs.len()
            )));
        }
        for (i, &input) in node.inputs.iter().enumerate() {
            let got = self.entry.shape(input)?;
            if got != &param_shapes[i] {
                return Err(ExpandError::Internal(format!(
                    "sub-program `{}` parameter {i} is {}, operand is {got}",
                    sub.name, param_shapes[i]
                )));
            }
        }

        let result_shapes: Vec<Shape> = sub
            .graph
            .outputs
            .iter()
            .map(|&v| sub.graph.shape(v).cloned())
            .collect::<ExpandResult<_>>()?;
        if result_shapes.len() != node.outputs.len() {
            return Err(ExpandError::InvalidArgument(format!(
                "call site declares {} outputs, sub-program `{}` returns {}",
                node.outputs.len(),
                sub.name,
                result_shapes.len()
            )));
        }
        for (i, &out) in node.outputs.iter().enumerate() {
            let declared = self.entry.shape(out)?;
            if declared != &result_shapes[i] {
                return Err(ExpandError::InvalidArgument(format!(
                    "call site output {i} declared as {declared}, sub-program `{}` returns {}",
                    sub.name, result_shapes[i]
                )));
            }
        }

        self.entry.nodes[node_id.0 as usize].kind = OpKind::Call { callee };
        Ok(())
    }
}
