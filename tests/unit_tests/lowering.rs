use crate::{compile, count_statements, matrix_tensor, run, triangle_domain, vector_tensor};
use matrixcompare::assert_matrix_eq;
use nalgebra::DMatrix;
use proptest::prelude::*;
use slac::error::CompileError;
use slac::expression::ExpressionDag;
use slac::form::{Form, IntegralType};
use slac::generate::OUTPUT_NAME;
use slac::loops::{BufferRole, Statement};
use slac::planner::plan_expression;
use slac::space::{ElementLayout, FiniteElement, FunctionSpace};

const A: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
const B: [f64; 4] = [0.5, -1.0, 2.0, 0.0];

fn a_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &A)
}

fn b_matrix() -> DMatrix<f64> {
    DMatrix::from_row_slice(2, 2, &B)
}

#[test]
fn matrix_expression_matches_dense_evaluation() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let b = matrix_tensor(&mut dag, domain, "b", 2, 2, B.to_vec());
    // a^T b - b
    let at = dag.transpose(a);
    let product = dag.mul(at, b).unwrap();
    let root = dag.sub(product, b).unwrap();

    let kernel = compile(&dag, root);
    let output = run(&kernel, &[]);
    let expected = a_matrix().transpose() * b_matrix() - b_matrix();
    assert_matrix_eq!(DMatrix::from_row_slice(2, 2, &output), expected, comp = abs, tol = 1e-12);
}

#[test]
fn shared_subexpression_is_assigned_once() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let b = matrix_tensor(&mut dag, domain, "b", 2, 2, B.to_vec());
    let shared = dag.add(a, b).unwrap();
    let left = dag.mul(shared, a).unwrap();
    let right = dag.mul(shared, b).unwrap();
    let root = dag.add(left, right).unwrap();

    let plan = plan_expression(&dag, root);
    let auxiliary = plan.temporaries.get(shared).unwrap().name.clone();
    let kernel = compile(&dag, root);
    let buffer = kernel.body.buffer_by_name(&auxiliary).unwrap();
    let assignments = count_statements(&kernel.body.statements, &|statement| {
        matches!(statement, Statement::Assign { target, .. } if target.buffer == buffer)
    });
    assert_eq!(assignments, 1);

    let output = run(&kernel, &[]);
    let m = a_matrix() + b_matrix();
    let expected = &m * a_matrix() + &m * b_matrix();
    assert_matrix_eq!(DMatrix::from_row_slice(2, 2, &output), expected, comp = abs, tol = 1e-12);
}

#[test]
fn repeated_operand_is_lowered_inline() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let b = matrix_tensor(&mut dag, domain, "b", 2, 2, B.to_vec());
    let sum = dag.add(a, b).unwrap();
    let root = dag.mul(sum, sum).unwrap();

    let kernel = compile(&dag, root);
    assert!(kernel
        .body
        .buffers
        .iter()
        .all(|buffer| !buffer.name.starts_with("auxT")));
    let output = run(&kernel, &[]);
    let m = a_matrix() + b_matrix();
    assert_matrix_eq!(DMatrix::from_row_slice(2, 2, &output), &m * &m, comp = abs, tol = 1e-12);
}

#[test]
fn temporaries_are_zeroed_before_use() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let b = matrix_tensor(&mut dag, domain, "b", 2, 2, B.to_vec());
    let root = dag.add(a, b).unwrap();
    let kernel = compile(&dag, root);

    let zeroed: Vec<_> = kernel
        .body
        .statements
        .iter()
        .filter_map(|statement| match statement {
            Statement::Zero(buffer) => Some(kernel.body.buffer(*buffer).name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(zeroed, vec!["T0", "T1"]);

    // Local kernels accumulate, so repeated invocations with a reused workspace must agree
    let mut workspace = Default::default();
    for _ in 0..2 {
        let mut output = vec![0.0; 4];
        let coordinates = vec![0.0; 6];
        kernel
            .invoke_with_workspace(slac::KernelArguments::new(&mut output, &coordinates), &mut workspace)
            .unwrap();
        assert_eq!(output, vec![1.5, 1.0, 5.0, 4.0]);
    }
}

#[test]
fn output_is_accumulated_into() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let kernel = compile(&dag, a);

    let mut output = vec![10.0; 4];
    let coordinates = vec![0.0; 6];
    kernel
        .invoke(slac::KernelArguments::new(&mut output, &coordinates))
        .unwrap();
    assert_eq!(output, vec![11.0, 12.0, 13.0, 14.0]);
}

#[test]
fn scalar_product_is_a_single_increment() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let two = dag
        .tensor(Form::new("two", domain, vec![]).with_integral(crate::constant_integral(
            "two_cell",
            IntegralType::Cell,
            vec![2.0],
        )))
        .unwrap();
    let three = dag
        .tensor(Form::new("three", domain, vec![]).with_integral(crate::constant_integral(
            "three_cell",
            IntegralType::Cell,
            vec![3.0],
        )))
        .unwrap();
    let root = dag.mul(two, three).unwrap();
    let kernel = compile(&dag, root);

    let output = kernel.body.buffer_by_name(OUTPUT_NAME).unwrap();
    assert_eq!(kernel.body.buffer(output).role, BufferRole::Output);
    let increments = count_statements(&kernel.body.statements, &|statement| {
        matches!(statement, Statement::Increment { target, .. } if target.buffer == output)
    });
    assert_eq!(increments, 1);
    assert!(kernel.index.is_empty());
    assert_eq!(run(&kernel, &[]), vec![6.0]);
}

#[test]
fn vector_products_contract_the_vector_axis() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let v = vector_tensor(&mut dag, domain, "v", vec![1.0, -2.0]);
    let w = vector_tensor(&mut dag, domain, "w", vec![3.0, 0.5]);

    // v^T a as a vector
    let left = dag.mul(v, a).unwrap();
    let output = run(&compile(&dag, left), &[]);
    let expected = DMatrix::from_row_slice(1, 2, &[1.0, -2.0]) * a_matrix();
    assert_matrix_eq!(DMatrix::from_row_slice(1, 2, &output), expected, comp = abs, tol = 1e-12);

    // a v
    let right = dag.mul(a, v).unwrap();
    let output = run(&compile(&dag, right), &[]);
    assert_eq!(output, vec![-3.0, -5.0]);

    // v . w
    let dot = dag.mul(v, w).unwrap();
    assert_eq!(dag.node(dot).rank(), 0);
    assert_eq!(run(&compile(&dag, dot), &[]), vec![2.0]);
}

fn mixed_matrix(dag: &mut ExpressionDag) -> slac::expression::NodeId {
    let domain = triangle_domain(dag);
    // Components of dimension 2, 2 and 1
    let components = [ElementLayout::new(2, 1), ElementLayout::new(1, 2), ElementLayout::scalar(1)];
    let space = FunctionSpace::mixed(domain, components);
    let values = (0..25).map(|x| x as f64).collect();
    let form = Form::new("mixed", domain, vec![space.clone(), space]).with_integral(crate::constant_integral(
        "mixed_cell",
        IntegralType::Cell,
        values,
    ));
    dag.tensor(form).unwrap()
}

#[test]
fn blocks_index_into_the_mixed_tensor() {
    let mut dag = ExpressionDag::new();
    let m = mixed_matrix(&mut dag);
    let block = dag.block(m, vec![1, 2], Some(vec![0])).unwrap();
    assert_eq!(dag.node(block).shape(), vec![3, 2]);

    let output = run(&compile(&dag, block), &[]);
    let full = DMatrix::from_row_slice(5, 5, &(0..25).map(|x| x as f64).collect::<Vec<_>>());
    let expected = full.view((2, 0), (3, 2)).into_owned();
    assert_matrix_eq!(DMatrix::from_row_slice(3, 2, &output), expected, comp = abs, tol = 1e-12);
}

#[test]
fn products_of_blocks_match_dense_evaluation() {
    let mut dag = ExpressionDag::new();
    let m = mixed_matrix(&mut dag);
    let upper = dag.block(m, vec![0], Some(vec![1, 2])).unwrap();
    let lower = dag.block(m, vec![1, 2], Some(vec![0])).unwrap();
    let root = dag.mul(upper, lower).unwrap();

    let output = run(&compile(&dag, root), &[]);
    let full = DMatrix::from_row_slice(5, 5, &(0..25).map(|x| x as f64).collect::<Vec<_>>());
    let expected = full.view((0, 2), (2, 3)) * full.view((2, 0), (3, 2));
    assert_matrix_eq!(DMatrix::from_row_slice(2, 2, &output), expected, comp = abs, tol = 1e-12);
}

#[test]
fn non_contiguous_blocks_are_rejected() {
    let mut dag = ExpressionDag::new();
    let m = mixed_matrix(&mut dag);
    let result = dag.block(m, vec![0, 2], Some(vec![0]));
    assert!(matches!(result, Err(CompileError::UnsupportedFeature(_))));
}

#[test]
fn non_conformable_shapes_are_rejected() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, A.to_vec());
    let c = matrix_tensor(&mut dag, domain, "c", 3, 2, vec![0.0; 6]);

    assert_eq!(
        dag.add(a, c),
        Err(CompileError::ShapeMismatch {
            operation: "add",
            left: vec![2, 2],
            right: vec![3, 2],
        })
    );
    assert!(matches!(dag.mul(a, c), Err(CompileError::ShapeMismatch { operation: "mul", .. })));
    assert!(matches!(dag.inverse(c), Err(CompileError::ShapeMismatch { .. })));
    let product = dag.mul(c, a).unwrap();
    assert_eq!(dag.node(product).shape(), vec![3, 2]);
}

/// Deepest loop nesting in `statements`.
fn loop_depth(statements: &[Statement]) -> usize {
    statements
        .iter()
        .map(|statement| match statement {
            Statement::Loop { body, .. } => 1 + loop_depth(body),
            Statement::If { then, otherwise, .. } => loop_depth(then).max(loop_depth(otherwise)),
            _ => 0,
        })
        .max()
        .unwrap_or(0)
}

/// Number of scalar accumulations executed when running `statements`.
fn executed_accumulations(statements: &[Statement]) -> usize {
    statements
        .iter()
        .map(|statement| match statement {
            Statement::Loop { extent, body, .. } => extent * executed_accumulations(body),
            Statement::If { then, otherwise, .. } => executed_accumulations(then) + executed_accumulations(otherwise),
            Statement::ScalarIncrement { .. } => 1,
            _ => 0,
        })
        .sum()
}

#[test]
fn chained_products_are_evaluated_once_per_factor() {
    let n = 10;
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let mut expected = DMatrix::<f64>::identity(n, n);
    let mut root = None;
    for factor in 0..4 {
        let values: Vec<f64> = (0..n * n)
            .map(|k| ((k * (factor + 3)) % 7) as f64 - 3.0)
            .collect();
        expected = expected * DMatrix::from_row_slice(n, n, &values);
        let m = matrix_tensor(&mut dag, domain, &format!("m{}", factor), n, n, values);
        root = Some(match root {
            None => m,
            Some(product) => dag.mul(product, m).unwrap(),
        });
    }
    let kernel = compile(&dag, root.unwrap());

    // Every product is a single row, column and contraction loop nest
    assert_eq!(loop_depth(&kernel.body.statements), 3);
    assert_eq!(executed_accumulations(&kernel.body.statements), 3 * n * n * n);
    assert_eq!(kernel.estimated_flops, 2 * executed_accumulations(&kernel.body.statements));

    let output = run(&kernel, &[]);
    assert_matrix_eq!(DMatrix::from_row_slice(n, n, &output), expected, comp = abs, tol = 1e-9);
}

/// A mixed element together with a contiguous, non-empty range of its components.
fn element_with_component_range() -> impl Strategy<Value = (FiniteElement, Vec<usize>)> {
    slac::proptest::mixed_element(4).prop_flat_map(|element| {
        let count = element.components().len();
        let range = (0..count).prop_flat_map(move |start| {
            (start + 1..=count).prop_map(move |end| (start..end).collect::<Vec<usize>>())
        });
        (Just(element), range)
    })
}

/// Offset and extent of the selected components along one axis.
fn component_span(element: &FiniteElement, ids: &[usize]) -> (usize, usize) {
    let extents: Vec<_> = element.components().iter().map(ElementLayout::extent).collect();
    let offset = extents[..ids[0]].iter().sum();
    let extent = ids.iter().map(|&id| extents[id]).sum();
    (offset, extent)
}

proptest! {
    #[test]
    fn contiguous_blocks_match_dense_views(
        (row_element, rows) in element_with_component_range(),
        (col_element, columns) in element_with_component_range(),
    ) {
        let mut dag = ExpressionDag::new();
        let domain = triangle_domain(&mut dag);
        let (m, n) = (row_element.dimension(), col_element.dimension());
        let values: Vec<f64> = (0..m * n).map(|x| x as f64).collect();
        let form = Form::new(
            "mixed",
            domain,
            vec![FunctionSpace::new(domain, row_element.clone()), FunctionSpace::new(domain, col_element.clone())],
        )
        .with_integral(crate::constant_integral("mixed_cell", IntegralType::Cell, values.clone()));
        let tensor = dag.tensor(form).unwrap();
        let block = dag.block(tensor, rows.clone(), Some(columns.clone())).unwrap();

        let (row_offset, block_rows) = component_span(&row_element, &rows);
        let (col_offset, block_cols) = component_span(&col_element, &columns);
        prop_assert_eq!(dag.node(block).matrix_shape(), (block_rows, block_cols));

        let output = run(&compile(&dag, block), &[]);
        let full = DMatrix::from_row_slice(m, n, &values);
        let expected = full.view((row_offset, col_offset), (block_rows, block_cols)).into_owned();
        assert_matrix_eq!(DMatrix::from_row_slice(block_rows, block_cols, &output), expected, comp = abs, tol = 1e-12);
    }
}

#[test]
fn tensors_of_rank_above_two_are_rejected() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let space = FunctionSpace::simple(domain, 3, 1);
    let form = Form::new("trilinear", domain, vec![space.clone(), space.clone(), space]);
    assert!(matches!(dag.tensor(form), Err(CompileError::UnsupportedFeature(_))));
}
