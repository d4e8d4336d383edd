//! Loop-level kernel bodies and their construction from the intermediate form.
//!
//! A kernel body is a list of [`Statement`]s over dense, row-major buffers. Loop variables
//! and scalar accumulators are numbered per body. The same body is interpreted by
//! [`crate::execute`] and printed as C by [`crate::emit`].
//!
//! Lowering tensor-valued intermediate nodes works by assignment: the target buffer gets a
//! loop nest over its rows and columns, and the scalar value of each entry is found by
//! substituting the loop variables into the tensor's [`GemNode::ComponentTensor`] definitions.
//! Index sums turn into scalar accumulators. Calls to external routines, and contractions
//! used as operands, are evaluated once into scratch buffers in front of the loop nest that
//! uses them, so nested products never recompute each other.
use crate::form::HorizontalFacet;
use crate::gem::{GemId, GemNode, IndexTerm, IntermediateForm};
use crate::routines::ExternalRoutine;
use rustc_hash::FxHashMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(usize);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoopVar(usize);

impl LoopVar {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScalarId(usize);

impl ScalarId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// The kernel output, accumulated into.
    Output,
    /// A coefficient buffer passed to the kernel. `component` is set for mixed coefficients.
    Coefficient { index: usize, component: Option<usize> },
    /// A named temporary of the expression plan.
    Temporary,
    /// Working storage for operands of external routines.
    Scratch,
}

impl BufferRole {
    /// Whether the buffer is supplied by the caller rather than allocated by the kernel.
    pub fn is_argument(&self) -> bool {
        matches!(self, BufferRole::Output | BufferRole::Coefficient { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDecl {
    pub name: String,
    pub role: BufferRole,
    pub shape: (usize, usize),
}

impl BufferDecl {
    pub fn len(&self) -> usize {
        self.shape.0 * self.shape.1
    }
}

/// `constant + sum(stride * var)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinearIndex {
    pub constant: usize,
    pub terms: Vec<(LoopVar, usize)>,
}

impl LinearIndex {
    pub fn constant(constant: usize) -> Self {
        Self {
            constant,
            terms: Vec::new(),
        }
    }

    pub fn plus(mut self, var: LoopVar, stride: usize) -> Self {
        self.terms.push((var, stride));
        self
    }

    /// Index of the entry `(row, col)` of a row-major matrix with `cols` columns.
    fn entry(row: Term, col: Term, cols: usize) -> Self {
        let mut index = Self::constant(row.offset * cols + col.offset);
        if let Some(var) = row.var {
            index.terms.push((var, cols));
        }
        if let Some(var) = col.var {
            index.terms.push((var, 1));
        }
        index
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub buffer: BufferId,
    pub index: LinearIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Literal(f64),
    Load(Access),
    Scalar(ScalarId),
    Add(Box<ScalarExpr>, Box<ScalarExpr>),
    Mul(Box<ScalarExpr>, Box<ScalarExpr>),
}

/// The facet number passed to a local kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FacetSelector {
    /// The current iteration of the facet loop.
    Loop(LoopVar),
    Horizontal(HorizontalFacet),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `cell_facets[facet][column] == value`
    CellFacet { facet: LoopVar, column: usize, value: i64 },
    /// `layer == value`
    Layer(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Comment(String),
    /// Sets every entry of a buffer to zero.
    Zero(BufferId),
    Loop {
        var: LoopVar,
        extent: usize,
        body: Vec<Statement>,
    },
    Assign {
        target: Access,
        value: ScalarExpr,
    },
    Increment {
        target: Access,
        value: ScalarExpr,
    },
    /// Declares (or redefines) a scalar.
    ScalarAssign {
        scalar: ScalarId,
        value: ScalarExpr,
    },
    ScalarIncrement {
        scalar: ScalarId,
        value: ScalarExpr,
    },
    /// Evaluates the local kernel of an integral, accumulating into `output`.
    CallLocalKernel {
        /// Index into the integral kernels of the compiled kernel.
        kernel: usize,
        output: BufferId,
        coefficients: Vec<BufferId>,
        facet: Option<FacetSelector>,
    },
    /// Calls an external routine on `n x n` operands, in place.
    CallRoutine {
        routine: ExternalRoutine,
        operands: Vec<BufferId>,
        dimension: usize,
    },
    If {
        condition: Condition,
        then: Vec<Statement>,
        otherwise: Vec<Statement>,
    },
}

/// A complete kernel body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelBody {
    pub buffers: Vec<BufferDecl>,
    pub statements: Vec<Statement>,
    pub loop_var_count: usize,
    pub scalar_count: usize,
}

impl KernelBody {
    pub fn buffer(&self, id: BufferId) -> &BufferDecl {
        &self.buffers[id.0]
    }

    pub fn buffer_by_name(&self, name: &str) -> Option<BufferId> {
        self.buffers
            .iter()
            .position(|buffer| buffer.name == name)
            .map(BufferId)
    }

    /// Routines called anywhere in the body, in order of first use.
    pub fn routines(&self) -> Vec<ExternalRoutine> {
        fn visit(statements: &[Statement], routines: &mut Vec<ExternalRoutine>) {
            for statement in statements {
                match statement {
                    Statement::CallRoutine { routine, .. } if !routines.contains(routine) => {
                        routines.push(*routine)
                    }
                    Statement::Loop { body, .. } => visit(body, routines),
                    Statement::If { then, otherwise, .. } => {
                        visit(then, routines);
                        visit(otherwise, routines);
                    }
                    _ => {}
                }
            }
        }
        let mut routines = Vec::new();
        visit(&self.statements, &mut routines);
        routines
    }
}

/// A resolved position along one axis: an optional loop variable plus a constant offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Term {
    var: Option<LoopVar>,
    offset: usize,
}

impl Term {
    fn var(var: LoopVar) -> Self {
        Self {
            var: Some(var),
            offset: 0,
        }
    }
}

/// Maps intermediate form indices (by id) to their positions in the enclosing loop nest.
type Environment = FxHashMap<usize, Term>;

/// Incrementally builds a [`KernelBody`].
#[derive(Debug)]
pub struct BodyBuilder<'a> {
    form: &'a IntermediateForm,
    body: KernelBody,
    by_name: FxHashMap<String, BufferId>,
    /// Statement blocks under construction, innermost last.
    blocks: Vec<Vec<Statement>>,
    /// Statements that must run before the assignment under construction.
    hoisted: Vec<Statement>,
    /// Scratch buffers holding tensors that were already evaluated.
    evaluated: FxHashMap<GemId, BufferId>,
}

impl<'a> BodyBuilder<'a> {
    pub fn new(form: &'a IntermediateForm) -> Self {
        Self {
            form,
            body: KernelBody::default(),
            by_name: FxHashMap::default(),
            blocks: Vec::new(),
            hoisted: Vec::new(),
            evaluated: FxHashMap::default(),
        }
    }

    pub fn declare_buffer(&mut self, name: impl Into<String>, role: BufferRole, shape: (usize, usize)) -> BufferId {
        let name = name.into();
        let id = BufferId(self.body.buffers.len());
        self.by_name.insert(name.clone(), id);
        self.body.buffers.push(BufferDecl { name, role, shape });
        id
    }

    pub fn buffer_by_name(&self, name: &str) -> Option<BufferId> {
        self.by_name.get(name).copied()
    }

    pub fn buffer(&self, id: BufferId) -> &BufferDecl {
        self.body.buffer(id)
    }

    pub fn loop_var(&mut self) -> LoopVar {
        let var = LoopVar(self.body.loop_var_count);
        self.body.loop_var_count += 1;
        var
    }

    fn scalar(&mut self) -> ScalarId {
        let scalar = ScalarId(self.body.scalar_count);
        self.body.scalar_count += 1;
        scalar
    }

    fn scratch(&mut self, shape: (usize, usize)) -> BufferId {
        let name = format!("t{}", self.body.buffers.len());
        self.declare_buffer(name, BufferRole::Scratch, shape)
    }

    pub fn push(&mut self, statement: Statement) {
        self.body.statements.push(statement);
    }

    pub fn extend(&mut self, statements: impl IntoIterator<Item = Statement>) {
        self.body.statements.extend(statements);
    }

    /// Statements storing the tensor `value` into `target`, overwriting its contents.
    pub fn assign(&mut self, target: BufferId, value: GemId) -> Vec<Statement> {
        self.store(target, value, false)
    }

    /// Statements adding the tensor `value` to `target`.
    pub fn accumulate(&mut self, target: BufferId, value: GemId) -> Vec<Statement> {
        self.store(target, value, true)
    }

    fn store(&mut self, target: BufferId, value: GemId, accumulate: bool) -> Vec<Statement> {
        let saved_blocks = std::mem::take(&mut self.blocks);
        let saved_hoisted = std::mem::take(&mut self.hoisted);

        let (rows, cols) = self.form.shape(value);
        let target_shape = self.buffer(target).shape;
        assert_eq!(
            target_shape,
            (rows, cols),
            "Internal error: assignment to buffer of a different shape"
        );
        let i = self.loop_var();
        let j = self.loop_var();

        self.blocks.push(Vec::new());
        let terms = [Term::var(i), Term::var(j)];
        let form = self.form;
        let entry = match form.node(value) {
            GemNode::ComponentTensor { .. } => self.expand(value, terms, &Environment::default()),
            _ => self.entry(value, terms, &Environment::default()),
        };
        let mut body = self
            .blocks
            .pop()
            .expect("Internal error: unbalanced statement blocks");
        let access = Access {
            buffer: target,
            index: LinearIndex::entry(Term::var(i), Term::var(j), cols),
        };
        body.push(if accumulate {
            Statement::Increment {
                target: access,
                value: entry,
            }
        } else {
            Statement::Assign {
                target: access,
                value: entry,
            }
        });

        let mut statements = std::mem::replace(&mut self.hoisted, saved_hoisted);
        statements.push(Statement::Loop {
            var: i,
            extent: rows,
            body: vec![Statement::Loop {
                var: j,
                extent: cols,
                body,
            }],
        });
        self.blocks = saved_blocks;
        statements
    }

    /// The scalar value of the entry `terms` of a tensor-valued node.
    fn entry(&mut self, tensor: GemId, terms: [Term; 2], env: &Environment) -> ScalarExpr {
        let form = self.form;
        match form.node(tensor) {
            GemNode::Variable { name, shape } => {
                let buffer = self
                    .buffer_by_name(name)
                    .unwrap_or_else(|| panic!("Internal error: no buffer declared for {}", name));
                ScalarExpr::Load(Access {
                    buffer,
                    index: LinearIndex::entry(terms[0], terms[1], shape.1),
                })
            }
            GemNode::Call { shape, .. } => {
                let buffer = self.hoist_call(tensor);
                ScalarExpr::Load(Access {
                    buffer,
                    index: LinearIndex::entry(terms[0], terms[1], shape.1),
                })
            }
            GemNode::ComponentTensor { expression, .. } if form.contains_index_sum(*expression) => {
                let buffer = self.hoist_tensor(tensor);
                ScalarExpr::Load(Access {
                    buffer,
                    index: LinearIndex::entry(terms[0], terms[1], form.shape(tensor).1),
                })
            }
            GemNode::ComponentTensor { .. } => self.expand(tensor, terms, env),
            _ => panic!("Internal error: scalar expression used as a tensor"),
        }
    }

    /// Substitutes `terms` for the free indices of a component tensor.
    fn expand(&mut self, tensor: GemId, terms: [Term; 2], env: &Environment) -> ScalarExpr {
        let form = self.form;
        match form.node(tensor) {
            GemNode::ComponentTensor { expression, indices } => {
                let mut inner = env.clone();
                inner.insert(indices[0].id, terms[0]);
                inner.insert(indices[1].id, terms[1]);
                self.scalar_expr(*expression, &inner)
            }
            _ => panic!("Internal error: expected a component tensor"),
        }
    }

    fn resolve(&self, term: &IndexTerm, env: &Environment) -> Term {
        match term.index {
            Some(index) => {
                let bound = env
                    .get(&index.id)
                    .unwrap_or_else(|| panic!("Internal error: free index {} is unbound", index));
                Term {
                    var: bound.var,
                    offset: bound.offset + term.offset,
                }
            }
            None => Term {
                var: None,
                offset: term.offset,
            },
        }
    }

    fn scalar_expr(&mut self, id: GemId, env: &Environment) -> ScalarExpr {
        let form = self.form;
        match form.node(id) {
            GemNode::Literal(value) => ScalarExpr::Literal(*value),
            GemNode::Sum(a, b) => {
                let (a, b) = (*a, *b);
                let a = self.scalar_expr(a, env);
                let b = self.scalar_expr(b, env);
                ScalarExpr::Add(Box::new(a), Box::new(b))
            }
            GemNode::Product(a, b) => {
                let (a, b) = (*a, *b);
                let a = self.scalar_expr(a, env);
                let b = self.scalar_expr(b, env);
                ScalarExpr::Mul(Box::new(a), Box::new(b))
            }
            GemNode::Indexed { tensor, multiindex } => {
                let terms = [self.resolve(&multiindex[0], env), self.resolve(&multiindex[1], env)];
                self.entry(*tensor, terms, env)
            }
            GemNode::IndexSum { expression, index } => {
                let (expression, index) = (*expression, *index);
                let var = self.loop_var();
                let accumulator = self.scalar();
                let mut inner = env.clone();
                inner.insert(index.id, Term::var(var));

                self.blocks.push(Vec::new());
                let summand = self.scalar_expr(expression, &inner);
                let mut body = self
                    .blocks
                    .pop()
                    .expect("Internal error: unbalanced statement blocks");
                body.push(Statement::ScalarIncrement {
                    scalar: accumulator,
                    value: summand,
                });

                let block = self
                    .blocks
                    .last_mut()
                    .expect("Internal error: index sum outside of an assignment");
                block.push(Statement::ScalarAssign {
                    scalar: accumulator,
                    value: ScalarExpr::Literal(0.0),
                });
                block.push(Statement::Loop {
                    var,
                    extent: index.extent,
                    body,
                });
                ScalarExpr::Scalar(accumulator)
            }
            GemNode::Variable { .. } | GemNode::ComponentTensor { .. } | GemNode::Call { .. } => {
                panic!("Internal error: tensor used as a scalar expression")
            }
        }
    }

    /// Evaluates a tensor once into a scratch buffer.
    fn hoist_tensor(&mut self, tensor: GemId) -> BufferId {
        if let Some(&buffer) = self.evaluated.get(&tensor) {
            return buffer;
        }
        let buffer = self.scratch(self.form.shape(tensor));
        let statements = self.assign(buffer, tensor);
        self.hoisted.extend(statements);
        self.evaluated.insert(tensor, buffer);
        buffer
    }

    /// Evaluates a routine call once, returning the buffer holding its result.
    fn hoist_call(&mut self, call: GemId) -> BufferId {
        if let Some(&buffer) = self.evaluated.get(&call) {
            return buffer;
        }
        let (routine, operands) = match self.form.node(call) {
            GemNode::Call { routine, operands, .. } => (*routine, operands.clone()),
            _ => panic!("Internal error: expected a routine call"),
        };

        let mut statements = Vec::new();
        let mut buffers = Vec::with_capacity(operands.len());
        for operand in operands {
            let shape = self.form.shape(operand);
            let buffer = self.scratch(shape);
            statements.extend(self.assign(buffer, operand));
            buffers.push(buffer);
        }
        let dimension = self.buffer(buffers[0]).shape.0;
        let result = match routine {
            ExternalRoutine::Inverse => buffers[0],
            ExternalRoutine::Solve => buffers[1],
        };
        statements.push(Statement::CallRoutine {
            routine,
            operands: buffers,
            dimension,
        });

        self.hoisted.extend(statements);
        self.evaluated.insert(call, result);
        result
    }

    pub fn finish(self) -> KernelBody {
        self.body
    }
}
