//! Symbolic tensor expressions.
//!
//! Expressions are stored in an arena ([`ExpressionDag`]) and referred to by [`NodeId`].
//! A node may be an operand of several parents, so the expression is a DAG rather than a
//! tree. Node identity, not structural equality, distinguishes nodes: two terminals
//! holding identical forms are still two different tensors.
//!
//! Every node records its shape as a list of *component extents* per axis. For tensors on
//! mixed function spaces an axis has one extent per component space, which is what makes
//! block extraction possible. The shape of an axis is the sum of its component extents.
use crate::error::CompileError;
use crate::form::Form;
use crate::planner::topological_sort;
use crate::space::{Coefficient, CoefficientId, Domain, DomainId, FunctionSpace};
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The kind of matrix decomposition requested by a factorization node.
///
/// The requested kind distinguishes expressions (it takes part in the structural hash and the
/// printed form), but it does not change the generated code: every solve against a factorization
/// uses the LU-based `solve` routine, whichever decomposition was asked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Decomposition {
    PartialPivLu,
    FullPivLu,
    /// Cholesky (LLT) decomposition.
    Cholesky,
    Ldlt,
    HouseholderQr,
    ColPivHouseholderQr,
    FullPivHouseholderQr,
}

impl Decomposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decomposition::PartialPivLu => "PartialPivLU",
            Decomposition::FullPivLu => "FullPivLU",
            Decomposition::Cholesky => "LLT",
            Decomposition::Ldlt => "LDLT",
            Decomposition::HouseholderQr => "HouseholderQR",
            Decomposition::ColPivHouseholderQr => "ColPivHouseholderQR",
            Decomposition::FullPivHouseholderQr => "FullPivHouseholderQR",
        }
    }
}

/// Component indices selected by a block node.
///
/// `columns` is `None` for blocks of vectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockIndices {
    pub rows: Vec<usize>,
    pub columns: Option<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub enum TensorKind {
    /// An assembled form, evaluated by external local kernels.
    Tensor(Form),
    /// The local values of a coefficient function.
    AssembledVector(CoefficientId),
    Transpose,
    Inverse,
    Negative,
    Add,
    Mul,
    Block(BlockIndices),
    /// `Solve` with operands `[A, B]` computes `A^{-1} B`.
    Solve,
    Factorization(Decomposition),
}

impl TensorKind {
    pub fn name(&self) -> &'static str {
        match self {
            TensorKind::Tensor(_) => "Tensor",
            TensorKind::AssembledVector(_) => "AssembledVector",
            TensorKind::Transpose => "Transpose",
            TensorKind::Inverse => "Inverse",
            TensorKind::Negative => "Negative",
            TensorKind::Add => "Add",
            TensorKind::Mul => "Mul",
            TensorKind::Block(_) => "Block",
            TensorKind::Solve => "Solve",
            TensorKind::Factorization(_) => "Factorization",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorNode {
    kind: TensorKind,
    operands: Vec<NodeId>,
    shapes: Vec<Vec<usize>>,
}

impl TensorNode {
    pub fn kind(&self) -> &TensorKind {
        &self.kind
    }

    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }

    /// Component extents for each axis.
    pub fn shapes(&self) -> &[Vec<usize>] {
        &self.shapes
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shapes.iter().map(|axis| axis.iter().sum()).collect()
    }

    pub fn rank(&self) -> usize {
        self.shapes.len()
    }

    /// The shape of the node when viewed as a matrix.
    ///
    /// Scalars are 1x1 matrices and vectors are column matrices.
    pub fn matrix_shape(&self) -> (usize, usize) {
        match self.shape().as_slice() {
            [] => (1, 1),
            [n] => (*n, 1),
            [m, n] => (*m, *n),
            _ => unreachable!("Internal error: rank is validated on construction"),
        }
    }

    /// Operator precedence used for parenthesization.
    pub fn precedence(&self) -> u8 {
        match self.kind {
            TensorKind::Add | TensorKind::Negative => 1,
            TensorKind::Mul | TensorKind::Solve => 2,
            TensorKind::Transpose | TensorKind::Inverse | TensorKind::Block(_) | TensorKind::Factorization(_) => 3,
            TensorKind::Tensor(_) | TensorKind::AssembledVector(_) => 4,
        }
    }
}

/// Arena holding expression nodes together with the domains and coefficients they refer to.
#[derive(Debug, Clone, Default)]
pub struct ExpressionDag {
    nodes: Vec<TensorNode>,
    domains: Vec<Domain>,
    coefficients: Vec<Coefficient>,
}

impl ExpressionDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&mut self, domain: Domain) -> DomainId {
        self.domains.push(domain);
        DomainId(self.domains.len() - 1)
    }

    pub fn domain(&self, id: DomainId) -> &Domain {
        &self.domains[id.0]
    }

    pub fn add_coefficient(&mut self, name: impl Into<String>, space: FunctionSpace) -> CoefficientId {
        assert!(space.domain.0 < self.domains.len(), "Coefficient space refers to unknown domain");
        self.coefficients.push(Coefficient {
            name: name.into(),
            space,
        });
        CoefficientId(self.coefficients.len() - 1)
    }

    pub fn coefficient(&self, id: CoefficientId) -> &Coefficient {
        &self.coefficients[id.0]
    }

    pub fn node(&self, id: NodeId) -> &TensorNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, kind: TensorKind, operands: Vec<NodeId>, shapes: Vec<Vec<usize>>) -> NodeId {
        debug_assert!(operands.iter().all(|op| op.0 < self.nodes.len()));
        self.nodes.push(TensorNode { kind, operands, shapes });
        NodeId(self.nodes.len() - 1)
    }

    /// Adds a terminal tensor assembled from the given form.
    pub fn tensor(&mut self, form: Form) -> Result<NodeId, CompileError> {
        if form.rank() > 2 {
            return Err(CompileError::unsupported(format!(
                "{}-rank tensors are not supported",
                form.rank()
            )));
        }
        assert!(form.domain.0 < self.domains.len(), "Form refers to unknown domain");
        for coefficient in &form.coefficients {
            assert!(coefficient.0 < self.coefficients.len(), "Form refers to unknown coefficient");
        }

        let extruded = self.domain(form.domain).is_extruded();
        for integral in &form.integrals {
            let integral_type = integral.integral_type;
            if integral_type.requires_extrusion() && !extruded {
                return Err(CompileError::unsupported(format!(
                    "{} integral {} on a domain that is not extruded",
                    integral_type, integral.name
                )));
            }
            if integral.subdomain_id.is_some() && !integral_type.is_facet_loop() {
                return Err(CompileError::unsupported(format!(
                    "subdomain-restricted {} integrals",
                    integral_type
                )));
            }
            if let Some(&index) = integral
                .coefficient_map
                .iter()
                .find(|&&index| index >= form.coefficients.len())
            {
                return Err(CompileError::unsupported(format!(
                    "kernel {} refers to coefficient {} of a form with {} coefficients",
                    integral.name,
                    index,
                    form.coefficients.len()
                )));
            }
        }

        let shapes = form
            .arguments
            .iter()
            .map(|space| space.element.component_extents())
            .collect();
        Ok(self.push(TensorKind::Tensor(form), vec![], shapes))
    }

    /// Adds a terminal vector holding the local values of the given coefficient.
    pub fn assembled_vector(&mut self, coefficient: CoefficientId) -> NodeId {
        let shapes = vec![self.coefficient(coefficient).space.element.component_extents()];
        self.push(TensorKind::AssembledVector(coefficient), vec![], shapes)
    }

    pub fn transpose(&mut self, a: NodeId) -> NodeId {
        let shapes = self.node(a).shapes.iter().rev().cloned().collect();
        self.push(TensorKind::Transpose, vec![a], shapes)
    }

    pub fn negative(&mut self, a: NodeId) -> NodeId {
        let shapes = self.node(a).shapes.clone();
        self.push(TensorKind::Negative, vec![a], shapes)
    }

    pub fn inverse(&mut self, a: NodeId) -> Result<NodeId, CompileError> {
        let shapes = self.square_shapes("inverse", a)?;
        Ok(self.push(TensorKind::Inverse, vec![a], shapes))
    }

    pub fn factorize(&mut self, a: NodeId, decomposition: Decomposition) -> Result<NodeId, CompileError> {
        let shapes = self.square_shapes("factorization", a)?;
        Ok(self.push(TensorKind::Factorization(decomposition), vec![a], shapes))
    }

    fn square_shapes(&self, operation: &'static str, a: NodeId) -> Result<Vec<Vec<usize>>, CompileError> {
        let node = self.node(a);
        let shape = node.shape();
        match shape.as_slice() {
            [m, n] if m == n => Ok(node.shapes.clone()),
            _ => Err(CompileError::shape_mismatch(operation, &shape, &shape)),
        }
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, CompileError> {
        let (shape_a, shape_b) = (self.node(a).shape(), self.node(b).shape());
        if shape_a != shape_b {
            return Err(CompileError::shape_mismatch("add", &shape_a, &shape_b));
        }
        let shapes = self.node(a).shapes.clone();
        Ok(self.push(TensorKind::Add, vec![a, b], shapes))
    }

    /// Convenience for `a + (-b)`.
    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, CompileError> {
        let negated = self.negative(b);
        self.add(a, negated)
    }

    /// Tensor product contracting the last axis of `a` with the first axis of `b`.
    ///
    /// Two scalars multiply as 1x1 matrices.
    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, CompileError> {
        let (node_a, node_b) = (self.node(a), self.node(b));
        let (shape_a, shape_b) = (node_a.shape(), node_b.shape());
        let shapes = match (node_a.rank(), node_b.rank()) {
            (0, 0) => vec![],
            (0, _) | (_, 0) => return Err(CompileError::shape_mismatch("mul", &shape_a, &shape_b)),
            (rank_a, _) => {
                if shape_a[rank_a - 1] != shape_b[0] {
                    return Err(CompileError::shape_mismatch("mul", &shape_a, &shape_b));
                }
                node_a.shapes[..rank_a - 1]
                    .iter()
                    .chain(&node_b.shapes[1..])
                    .cloned()
                    .collect()
            }
        };
        Ok(self.push(TensorKind::Mul, vec![a, b], shapes))
    }

    /// Solves `A x = B` for a single right-hand side `B`.
    pub fn solve(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, CompileError> {
        let (node_a, node_b) = (self.node(a), self.node(b));
        let (shape_a, shape_b) = (node_a.shape(), node_b.shape());
        match (shape_a.as_slice(), shape_b.as_slice()) {
            ([m, n], [k]) if m == n && n == k => {}
            ([m, n], [k, _]) if m == n && n == k => {
                return Err(CompileError::unsupported("solves with multiple right-hand sides"))
            }
            _ => return Err(CompileError::shape_mismatch("solve", &shape_a, &shape_b)),
        }
        let shapes = vec![node_a.shapes[1].clone()];
        Ok(self.push(TensorKind::Solve, vec![a, b], shapes))
    }

    /// Extracts the block formed by the given component indices of a tensor on mixed spaces.
    ///
    /// Only contiguous index ranges are supported.
    pub fn block(&mut self, a: NodeId, rows: Vec<usize>, columns: Option<Vec<usize>>) -> Result<NodeId, CompileError> {
        let node = self.node(a);
        let shape = node.shape();
        let axes: Vec<&Vec<usize>> = match (node.rank(), &columns) {
            (1, None) => vec![&rows],
            (2, Some(columns)) => vec![&rows, columns],
            (0, _) => return Err(CompileError::unsupported("blocks of scalar tensors")),
            _ => return Err(CompileError::shape_mismatch("block", &shape, &[rows.len()])),
        };

        let mut shapes = Vec::with_capacity(axes.len());
        for (ids, components) in axes.into_iter().zip(&node.shapes) {
            if ids.is_empty() || ids.iter().any(|&id| id >= components.len()) {
                return Err(CompileError::shape_mismatch("block", &shape, ids));
            }
            if !ids.windows(2).all(|pair| pair[0] + 1 == pair[1]) {
                return Err(CompileError::unsupported("Non-contiguous blocks not implemented"));
            }
            shapes.push(ids.iter().map(|&id| components[id]).collect());
        }

        Ok(self.push(TensorKind::Block(BlockIndices { rows, columns }), vec![a], shapes))
    }

    /// Coefficients referenced by the expression, in order of first appearance.
    pub fn coefficients(&self, root: NodeId) -> Vec<CoefficientId> {
        let mut seen = BTreeSet::new();
        let mut coefficients = Vec::new();
        for id in topological_sort(self, root) {
            let referenced: &[CoefficientId] = match &self.node(id).kind {
                TensorKind::Tensor(form) => &form.coefficients,
                TensorKind::AssembledVector(coefficient) => std::slice::from_ref(coefficient),
                _ => &[],
            };
            for &coefficient in referenced {
                if seen.insert(coefficient) {
                    coefficients.push(coefficient);
                }
            }
        }
        coefficients
    }

    /// The distinct domains the terminals of the expression live on.
    pub fn domains(&self, root: NodeId) -> Vec<DomainId> {
        let mut domains = BTreeSet::new();
        for id in topological_sort(self, root) {
            match &self.node(id).kind {
                TensorKind::Tensor(form) => {
                    domains.insert(form.domain);
                    domains.extend(form.arguments.iter().map(|space| space.domain));
                }
                TensorKind::AssembledVector(coefficient) => {
                    domains.insert(self.coefficient(*coefficient).space.domain);
                }
                _ => {}
            }
        }
        domains.into_iter().collect()
    }

    /// Estimated floating point operations of the linear algebra in the expression.
    ///
    /// Terminals are not included, and shared nodes are counted once.
    pub fn flops(&self, root: NodeId) -> usize {
        topological_sort(self, root)
            .into_iter()
            .map(|id| self.node_flops(id))
            .sum()
    }

    fn node_flops(&self, id: NodeId) -> usize {
        let node = self.node(id);
        let (rows, cols) = node.matrix_shape();
        match node.kind {
            TensorKind::Add | TensorKind::Negative => rows * cols,
            TensorKind::Mul => {
                let a = self.node(node.operands[0]);
                let contraction = a.shape().last().copied().unwrap_or(1);
                2 * rows * cols * contraction
            }
            TensorKind::Inverse => 2 * rows.pow(3),
            TensorKind::Solve => 2 * rows.pow(3) / 3 + 2 * rows.pow(2),
            TensorKind::Factorization(_) => 2 * rows.pow(3) / 3,
            TensorKind::Tensor(_) | TensorKind::AssembledVector(_) | TensorKind::Transpose | TensorKind::Block(_) => 0,
        }
    }

    /// A structural hash of the expression rooted at `root`.
    ///
    /// Structurally identical expressions hash to the same value, regardless of node identity.
    pub fn expression_hash(&self, root: NodeId) -> u64 {
        let mut hashes: FxHashMap<NodeId, u64> = FxHashMap::default();
        for id in topological_sort(self, root) {
            let node = self.node(id);
            let mut hasher = FxHasher::default();
            node.kind.name().hash(&mut hasher);
            node.shapes.hash(&mut hasher);
            match &node.kind {
                TensorKind::Tensor(form) => self.hash_form(form, &mut hasher),
                TensorKind::AssembledVector(coefficient) => {
                    coefficient.hash(&mut hasher);
                    self.coefficient(*coefficient).hash(&mut hasher);
                }
                TensorKind::Block(indices) => indices.hash(&mut hasher),
                TensorKind::Factorization(decomposition) => decomposition.hash(&mut hasher),
                _ => {}
            }
            for operand in &node.operands {
                hashes[operand].hash(&mut hasher);
            }
            hashes.insert(id, hasher.finish());
        }
        hashes[&root]
    }

    fn hash_form(&self, form: &Form, hasher: &mut FxHasher) {
        form.name.hash(hasher);
        self.domain(form.domain).hash(hasher);
        form.arguments.hash(hasher);
        form.coefficients.hash(hasher);
        for integral in &form.integrals {
            integral.name.hash(hasher);
            integral.integral_type.hash(hasher);
            integral.subdomain_id.hash(hasher);
            integral.oriented.hash(hasher);
            integral.needs_cell_sizes.hash(hasher);
            integral.coefficient_map.hash(hasher);
        }
    }

    /// Returns a value that formats the expression in infix notation.
    pub fn display(&self, root: NodeId) -> DisplayExpression {
        DisplayExpression { dag: self, root }
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, parent_precedence: Option<u8>) -> fmt::Result {
        let node = self.node(id);
        let precedence = node.precedence();
        let parenthesize = parent_precedence.map_or(false, |parent| precedence < parent);
        if parenthesize {
            write!(f, "(")?;
        }
        let operand = |i: usize| node.operands[i];
        match &node.kind {
            TensorKind::Tensor(form) => write!(f, "{}", form.name)?,
            TensorKind::AssembledVector(coefficient) => {
                write!(f, "AV({})", self.coefficient(*coefficient).name)?
            }
            TensorKind::Transpose => {
                self.fmt_node(f, operand(0), Some(precedence + 1))?;
                write!(f, ".T")?;
            }
            TensorKind::Inverse => {
                self.fmt_node(f, operand(0), Some(precedence + 1))?;
                write!(f, ".inv")?;
            }
            TensorKind::Negative => {
                write!(f, "-")?;
                self.fmt_node(f, operand(0), Some(precedence + 1))?;
            }
            TensorKind::Add | TensorKind::Mul => {
                let symbol = if matches!(node.kind, TensorKind::Add) { "+" } else { "*" };
                self.fmt_node(f, operand(0), Some(precedence))?;
                write!(f, " {} ", symbol)?;
                self.fmt_node(f, operand(1), Some(precedence))?;
            }
            TensorKind::Block(indices) => {
                self.fmt_node(f, operand(0), Some(precedence + 1))?;
                match &indices.columns {
                    Some(columns) => write!(f, ".block({:?}, {:?})", indices.rows, columns)?,
                    None => write!(f, ".block({:?})", indices.rows)?,
                }
            }
            TensorKind::Solve => {
                self.fmt_node(f, operand(0), Some(precedence + 1))?;
                write!(f, ".solve(")?;
                self.fmt_node(f, operand(1), None)?;
                write!(f, ")")?;
            }
            TensorKind::Factorization(decomposition) => {
                write!(f, "{}(", decomposition.as_str())?;
                self.fmt_node(f, operand(0), None)?;
                write!(f, ")")?;
            }
        }
        if parenthesize {
            write!(f, ")")?;
        }
        Ok(())
    }
}

pub struct DisplayExpression<'a> {
    dag: &'a ExpressionDag,
    root: NodeId,
}

impl<'a> fmt::Display for DisplayExpression<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dag.fmt_node(f, self.root, None)
    }
}
