//! Lowering of expression DAGs into the intermediate tensor form.
use crate::error::CompileError;
use crate::expression::{ExpressionDag, NodeId, TensorKind};
use crate::gem::{GemId, IndexTerm, IntermediateForm};
use crate::planner::{ExpressionPlan, TemporaryKind};
use crate::routines::ExternalRoutine;
use rustc_hash::FxHashMap;

/// A translated expression.
#[derive(Debug, Clone)]
pub struct LoweredExpression {
    pub form: IntermediateForm,
    /// The value of the root expression.
    pub root: GemId,
    /// Values of auxiliary and factorization temporaries, in dependency order.
    pub definitions: Vec<(String, GemId)>,
}

/// Translates nodes one at a time, reusing the lowered form of nodes it has already seen.
///
/// Nodes with a temporary are referred to through a variable naming the temporary. All other
/// nodes are lowered inline, at most once each.
pub struct Translator<'a> {
    dag: &'a ExpressionDag,
    plan: &'a ExpressionPlan,
    form: IntermediateForm,
    memo: FxHashMap<NodeId, GemId>,
}

impl<'a> Translator<'a> {
    pub fn new(dag: &'a ExpressionDag, plan: &'a ExpressionPlan) -> Self {
        Self {
            dag,
            plan,
            form: IntermediateForm::new(),
            memo: FxHashMap::default(),
        }
    }

    /// Returns the tensor-valued node standing for `id` wherever it is used as an operand.
    pub fn lower(&mut self, id: NodeId) -> Result<GemId, CompileError> {
        if let Some(&lowered) = self.memo.get(&id) {
            return Ok(lowered);
        }
        let lowered = match self.plan.temporaries.get(id) {
            Some(temporary) => self
                .form
                .variable(temporary.name.clone(), temporary.shape),
            None => self.lower_definition(id)?,
        };
        self.memo.insert(id, lowered);
        Ok(lowered)
    }

    /// Lowers the operation of `id` itself, with operands resolved through [`Self::lower`].
    pub fn lower_definition(&mut self, id: NodeId) -> Result<GemId, CompileError> {
        let dag = self.dag;
        let node = dag.node(id);
        let operands = node.operands();
        let (rows, cols) = node.matrix_shape();

        let lowered = match node.kind() {
            TensorKind::Tensor(_) | TensorKind::AssembledVector(_) => {
                let temporary = self
                    .plan
                    .temporaries
                    .get(id)
                    .expect("Internal error: terminals always have a temporary");
                self.form
                    .variable(temporary.name.clone(), temporary.shape)
            }
            TensorKind::Transpose => {
                let a = self.lower(operands[0])?;
                if dag.node(operands[0]).rank() < 2 {
                    // Vectors and scalars carry no orientation
                    a
                } else {
                    let i = self.form.index(rows);
                    let j = self.form.index(cols);
                    let entry = self.form.indexed(a, [j.into(), i.into()]);
                    self.form.component_tensor(entry, [i, j])
                }
            }
            TensorKind::Negative => {
                let a = self.lower(operands[0])?;
                let i = self.form.index(rows);
                let j = self.form.index(cols);
                let minus_one = self.form.literal(-1.0);
                let entry = self.form.indexed(a, [i.into(), j.into()]);
                let negated = self.form.product(minus_one, entry);
                self.form.component_tensor(negated, [i, j])
            }
            TensorKind::Add => {
                let a = self.lower(operands[0])?;
                let b = self.lower(operands[1])?;
                let i = self.form.index(rows);
                let j = self.form.index(cols);
                let entry_a = self.form.indexed(a, [i.into(), j.into()]);
                let entry_b = self.form.indexed(b, [i.into(), j.into()]);
                let sum = self.form.sum(entry_a, entry_b);
                self.form.component_tensor(sum, [i, j])
            }
            TensorKind::Mul => {
                let a = self.lower(operands[0])?;
                let b = self.lower(operands[1])?;
                let (a_rows, a_cols) = self.form.shape(a);
                let i = self.form.index(rows);
                let j = self.form.index(cols);
                let (entry_a, entry_b, k) = if dag.node(operands[0]).rank() == 1 {
                    // A vector on the left is contracted over its only axis
                    let k = self.form.index(a_rows);
                    let entry_a = self.form.indexed(a, [k.into(), IndexTerm::fixed(0)]);
                    let entry_b = if dag.node(operands[1]).rank() == 1 {
                        self.form.indexed(b, [k.into(), IndexTerm::fixed(0)])
                    } else {
                        self.form.indexed(b, [k.into(), i.into()])
                    };
                    (entry_a, entry_b, k)
                } else {
                    let k = self.form.index(a_cols);
                    let entry_a = self.form.indexed(a, [i.into(), k.into()]);
                    let entry_b = self.form.indexed(b, [k.into(), j.into()]);
                    (entry_a, entry_b, k)
                };
                let product = self.form.product(entry_a, entry_b);
                let contracted = self.form.index_sum(product, k);
                self.form.component_tensor(contracted, [i, j])
            }
            TensorKind::Block(indices) => {
                let a = self.lower(operands[0])?;
                let shapes = dag.node(operands[0]).shapes();
                let row_offset = block_offset(&shapes[0], &indices.rows)?;
                let col_offset = match &indices.columns {
                    Some(columns) => block_offset(&shapes[1], columns)?,
                    None => 0,
                };
                let i = self.form.index(rows);
                let j = self.form.index(cols);
                let entry = self.form.indexed(
                    a,
                    [IndexTerm::shifted(i, row_offset), IndexTerm::shifted(j, col_offset)],
                );
                self.form.component_tensor(entry, [i, j])
            }
            TensorKind::Inverse => {
                let a = self.lower(operands[0])?;
                self.form
                    .call(ExternalRoutine::Inverse, vec![a], (rows, cols))
            }
            TensorKind::Solve => {
                let a = self.lower(operands[0])?;
                let b = self.lower(operands[1])?;
                self.form
                    .call(ExternalRoutine::Solve, vec![a, b], (rows, cols))
            }
            // The factorization temporary holds the matrix it decomposes
            TensorKind::Factorization(_) => self.lower(operands[0])?,
        };
        Ok(lowered)
    }

    pub fn into_form(self) -> IntermediateForm {
        self.form
    }
}

/// Offset of the first selected component along an axis.
fn block_offset(components: &[usize], ids: &[usize]) -> Result<usize, CompileError> {
    if !ids.windows(2).all(|pair| pair[0] + 1 == pair[1]) {
        return Err(CompileError::unsupported("Non-contiguous blocks not implemented"));
    }
    let first = ids.iter().copied().min().unwrap_or(0);
    Ok(components[..first].iter().sum())
}

/// Lowers the root expression and the definitions of all non-terminal temporaries.
pub fn translate(dag: &ExpressionDag, plan: &ExpressionPlan) -> Result<LoweredExpression, CompileError> {
    let mut translator = Translator::new(dag, plan);
    let mut definitions = Vec::new();
    for temporary in plan.temporaries.iter() {
        if matches!(temporary.kind, TemporaryKind::Auxiliary | TemporaryKind::Factorization) {
            let value = translator.lower_definition(temporary.node)?;
            definitions.push((temporary.name.clone(), value));
        }
    }
    let root = translator.lower(plan.root)?;
    Ok(LoweredExpression {
        form: translator.into_form(),
        root,
        definitions,
    })
}
