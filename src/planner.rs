//! Dependency ordering and temporary planning for expression DAGs.
use crate::expression::{ExpressionDag, NodeId, TensorKind};
use log::debug;
use rustc_hash::FxHashMap;
use std::fmt;

/// Returns every node reachable from `root`, ordered so that each node comes after all of its
/// operands. The root is always last.
///
/// # Panics
///
/// Panics if the operand graph contains a cycle. The arena makes this impossible for
/// expressions built through [`ExpressionDag`], so a cycle is an internal error.
pub fn topological_sort(dag: &ExpressionDag, root: NodeId) -> Vec<NodeId> {
    #[derive(Copy, Clone, PartialEq, Eq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: FxHashMap<NodeId, Mark> = FxHashMap::default();
    let mut order = Vec::new();
    // Each stack entry holds a node and the position of the next operand to visit
    let mut stack = vec![(root, 0)];
    marks.insert(root, Mark::InProgress);

    while let Some((id, next_operand)) = stack.pop() {
        let operands = dag.node(id).operands();
        if let Some(&operand) = operands.get(next_operand) {
            stack.push((id, next_operand + 1));
            match marks.get(&operand) {
                None => {
                    marks.insert(operand, Mark::InProgress);
                    stack.push((operand, 0));
                }
                Some(Mark::InProgress) => panic!("Internal error: expression DAG contains a cycle"),
                Some(Mark::Done) => {}
            }
        } else {
            marks.insert(id, Mark::Done);
            order.push(id);
        }
    }

    order
}

/// Number of distinct parent nodes referencing each node reachable from a root.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCounts {
    counts: FxHashMap<NodeId, usize>,
}

impl ReferenceCounts {
    pub fn from_order(dag: &ExpressionDag, order: &[NodeId]) -> Self {
        let mut counts = FxHashMap::default();
        for &id in order {
            counts.entry(id).or_insert(0);
            let operands = dag.node(id).operands();
            for (i, operand) in operands.iter().enumerate() {
                // A parent using the same operand twice is still a single parent
                if !operands[..i].contains(operand) {
                    *counts.entry(*operand).or_insert(0) += 1;
                }
            }
        }
        Self { counts }
    }

    pub fn get(&self, id: NodeId) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TemporaryKind {
    /// Holds an assembled form, filled by local kernel calls.
    Tensor,
    /// Holds the packed local values of a coefficient.
    Coefficient,
    /// Holds a shared intermediate result.
    Auxiliary,
    /// Holds the matrix a factorization is computed from.
    Factorization,
}

impl TemporaryKind {
    fn prefix(&self) -> &'static str {
        match self {
            TemporaryKind::Tensor => "T",
            TemporaryKind::Coefficient => "VT",
            TemporaryKind::Auxiliary => "auxT",
            TemporaryKind::Factorization => "dec",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Temporary {
    pub node: NodeId,
    pub name: String,
    pub kind: TemporaryKind,
    /// Matrix view of the temporary, see [`TensorNode::matrix_shape`](crate::expression::TensorNode::matrix_shape).
    pub shape: (usize, usize),
}

impl Temporary {
    pub fn len(&self) -> usize {
        self.shape.0 * self.shape.1
    }
}

/// Named temporaries in the order they were created.
///
/// The table only ever grows.
#[derive(Debug, Clone, Default)]
pub struct TemporaryTable {
    temporaries: Vec<Temporary>,
    by_node: FxHashMap<NodeId, usize>,
}

impl TemporaryTable {
    /// Assigns a fresh temporary to `node`, or returns the one it already has.
    pub fn declare(&mut self, dag: &ExpressionDag, node: NodeId, kind: TemporaryKind) -> &Temporary {
        let index = match self.by_node.get(&node) {
            Some(&index) => index,
            None => {
                let name = format!("{}{}", kind.prefix(), self.temporaries.len());
                self.temporaries.push(Temporary {
                    node,
                    name,
                    kind,
                    shape: dag.node(node).matrix_shape(),
                });
                self.by_node.insert(node, self.temporaries.len() - 1);
                self.temporaries.len() - 1
            }
        };
        &self.temporaries[index]
    }

    pub fn get(&self, node: NodeId) -> Option<&Temporary> {
        self.by_node.get(&node).map(|&index| &self.temporaries[index])
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.by_node.contains_key(&node)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Temporary> {
        self.temporaries.iter()
    }

    pub fn len(&self) -> usize {
        self.temporaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temporaries.is_empty()
    }
}

impl fmt::Display for TemporaryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for temporary in &self.temporaries {
            writeln!(
                f,
                "{} <- node {} ({}x{})",
                temporary.name,
                temporary.node.index(),
                temporary.shape.0,
                temporary.shape.1
            )?;
        }
        Ok(())
    }
}

/// The outcome of planning an expression.
#[derive(Debug, Clone)]
pub struct ExpressionPlan {
    pub root: NodeId,
    pub order: Vec<NodeId>,
    pub reference_counts: ReferenceCounts,
    pub temporaries: TemporaryTable,
}

/// Decides which nodes need a materialized temporary.
///
/// Terminals and factorizations always do. Any other node does if more than one parent refers
/// to it, except transposes and negations, which are cheap enough to recompute inline.
pub fn requires_temporary(kind: &TensorKind, reference_count: usize) -> Option<TemporaryKind> {
    match kind {
        TensorKind::Tensor(_) => Some(TemporaryKind::Tensor),
        TensorKind::AssembledVector(_) => Some(TemporaryKind::Coefficient),
        TensorKind::Factorization(_) => Some(TemporaryKind::Factorization),
        TensorKind::Transpose | TensorKind::Negative => None,
        _ if reference_count > 1 => Some(TemporaryKind::Auxiliary),
        _ => None,
    }
}

pub fn plan_expression(dag: &ExpressionDag, root: NodeId) -> ExpressionPlan {
    let order = topological_sort(dag, root);
    let reference_counts = ReferenceCounts::from_order(dag, &order);
    let mut temporaries = TemporaryTable::default();
    for &id in &order {
        if let Some(kind) = requires_temporary(dag.node(id).kind(), reference_counts.get(id)) {
            temporaries.declare(dag, id, kind);
        }
    }
    debug!("Planned {} temporaries:\n{}", temporaries.len(), temporaries);

    ExpressionPlan {
        root,
        order,
        reference_counts,
        temporaries,
    }
}
