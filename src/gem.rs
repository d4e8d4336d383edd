//! An index-based intermediate representation of tensor algebra.
//!
//! Every tensor-valued node is viewed as a matrix. Scalar expressions refer to tensor
//! entries through explicit multi-indices ([`GemNode::Indexed`]), contractions are explicit
//! index sums, and [`GemNode::ComponentTensor`] turns a scalar expression with free indices back
//! into a tensor. Inverses and solves are opaque calls to external routines.
//!
//! Nodes live in an arena and are only appended, never mutated.
use crate::routines::ExternalRoutine;
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GemId(usize);

impl GemId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A free or summation index with a fixed extent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index {
    pub id: usize,
    pub extent: usize,
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.id)
    }
}

/// One entry of a multi-index: an optional index plus a constant offset.
///
/// A term without an index is a fixed position.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct IndexTerm {
    pub index: Option<Index>,
    pub offset: usize,
}

impl IndexTerm {
    pub fn fixed(offset: usize) -> Self {
        Self { index: None, offset }
    }

    pub fn shifted(index: Index, offset: usize) -> Self {
        Self {
            index: Some(index),
            offset,
        }
    }

    /// Shifts the term by a further constant offset.
    pub fn offset_by(self, offset: usize) -> Self {
        Self {
            index: self.index,
            offset: self.offset + offset,
        }
    }
}

impl From<Index> for IndexTerm {
    fn from(index: Index) -> Self {
        Self::shifted(index, 0)
    }
}

impl fmt::Display for IndexTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.index, self.offset) {
            (None, offset) => write!(f, "{}", offset),
            (Some(index), 0) => write!(f, "{}", index),
            (Some(index), offset) => write!(f, "{} + {}", index, offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GemNode {
    /// A named buffer with a matrix shape.
    Variable { name: String, shape: (usize, usize) },
    Literal(f64),
    /// A scalar entry of a tensor-valued node.
    Indexed { tensor: GemId, multiindex: [IndexTerm; 2] },
    /// A tensor whose entry at `indices` is the scalar `expression`.
    ComponentTensor { expression: GemId, indices: [Index; 2] },
    Sum(GemId, GemId),
    Product(GemId, GemId),
    IndexSum { expression: GemId, index: Index },
    /// A tensor computed by an external routine from tensor-valued operands.
    Call {
        routine: ExternalRoutine,
        operands: Vec<GemId>,
        shape: (usize, usize),
    },
}

/// Arena of intermediate form nodes.
#[derive(Debug, Clone, Default)]
pub struct IntermediateForm {
    nodes: Vec<GemNode>,
    index_count: usize,
}

impl IntermediateForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: GemId) -> &GemNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of indices created so far. Index ids are `0 .. index_count`.
    pub fn index_count(&self) -> usize {
        self.index_count
    }

    pub fn index(&mut self, extent: usize) -> Index {
        let index = Index {
            id: self.index_count,
            extent,
        };
        self.index_count += 1;
        index
    }

    fn push(&mut self, node: GemNode) -> GemId {
        self.nodes.push(node);
        GemId(self.nodes.len() - 1)
    }

    pub fn variable(&mut self, name: impl Into<String>, shape: (usize, usize)) -> GemId {
        self.push(GemNode::Variable {
            name: name.into(),
            shape,
        })
    }

    pub fn literal(&mut self, value: f64) -> GemId {
        self.push(GemNode::Literal(value))
    }

    pub fn indexed(&mut self, tensor: GemId, multiindex: [IndexTerm; 2]) -> GemId {
        debug_assert!(self.is_tensor(tensor));
        self.push(GemNode::Indexed { tensor, multiindex })
    }

    pub fn component_tensor(&mut self, expression: GemId, indices: [Index; 2]) -> GemId {
        debug_assert!(!self.is_tensor(expression));
        self.push(GemNode::ComponentTensor { expression, indices })
    }

    pub fn sum(&mut self, a: GemId, b: GemId) -> GemId {
        self.push(GemNode::Sum(a, b))
    }

    pub fn product(&mut self, a: GemId, b: GemId) -> GemId {
        self.push(GemNode::Product(a, b))
    }

    pub fn index_sum(&mut self, expression: GemId, index: Index) -> GemId {
        self.push(GemNode::IndexSum { expression, index })
    }

    pub fn call(&mut self, routine: ExternalRoutine, operands: Vec<GemId>, shape: (usize, usize)) -> GemId {
        debug_assert_eq!(operands.len(), routine.descriptor().arity);
        self.push(GemNode::Call {
            routine,
            operands,
            shape,
        })
    }

    /// Whether the node is tensor-valued (as opposed to a scalar expression).
    pub fn is_tensor(&self, id: GemId) -> bool {
        matches!(
            self.node(id),
            GemNode::Variable { .. } | GemNode::ComponentTensor { .. } | GemNode::Call { .. }
        )
    }

    /// The matrix shape of a tensor-valued node.
    pub fn shape(&self, id: GemId) -> (usize, usize) {
        match self.node(id) {
            GemNode::Variable { shape, .. } | GemNode::Call { shape, .. } => *shape,
            GemNode::ComponentTensor { indices, .. } => (indices[0].extent, indices[1].extent),
            _ => panic!("Internal error: scalar expressions have no shape"),
        }
    }

    /// Whether the scalar expression `id` contains an index sum, not counting the index sums
    /// inside the tensors it refers to.
    pub fn contains_index_sum(&self, id: GemId) -> bool {
        match self.node(id) {
            GemNode::IndexSum { .. } => true,
            GemNode::Sum(a, b) | GemNode::Product(a, b) => self.contains_index_sum(*a) || self.contains_index_sum(*b),
            _ => false,
        }
    }

    /// Formats the node as a nested expression.
    pub fn display(&self, id: GemId) -> DisplayGem {
        DisplayGem { form: self, id }
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: GemId) -> fmt::Result {
        match self.node(id) {
            GemNode::Variable { name, .. } => write!(f, "{}", name),
            GemNode::Literal(value) => write!(f, "{}", value),
            GemNode::Indexed { tensor, multiindex } => {
                self.fmt_node(f, *tensor)?;
                write!(f, "[{}, {}]", multiindex[0], multiindex[1])
            }
            GemNode::ComponentTensor { expression, indices } => {
                write!(f, "{{")?;
                self.fmt_node(f, *expression)?;
                write!(f, " | {}, {}}}", indices[0], indices[1])
            }
            GemNode::Sum(a, b) => {
                write!(f, "(")?;
                self.fmt_node(f, *a)?;
                write!(f, " + ")?;
                self.fmt_node(f, *b)?;
                write!(f, ")")
            }
            GemNode::Product(a, b) => {
                self.fmt_node(f, *a)?;
                write!(f, " * ")?;
                self.fmt_node(f, *b)
            }
            GemNode::IndexSum { expression, index } => {
                write!(f, "sum_{}(", index)?;
                self.fmt_node(f, *expression)?;
                write!(f, ")")
            }
            GemNode::Call { routine, operands, .. } => {
                write!(f, "{}(", routine.descriptor().name)?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.fmt_node(f, *operand)?;
                }
                write!(f, ")")
            }
        }
    }
}

pub struct DisplayGem<'a> {
    form: &'a IntermediateForm,
    id: GemId,
}

impl<'a> fmt::Display for DisplayGem<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.form.fmt_node(f, self.id)
    }
}
