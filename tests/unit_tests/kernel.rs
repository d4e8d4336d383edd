use crate::{compile, constant_integral, matrix_tensor, triangle_domain, vector_tensor};
use slac::expression::ExpressionDag;
use slac::form::{Form, IntegralKernel, IntegralType, LocalKernelArgs};
use slac::kernel::{ArgumentRole, KERNEL_NAME};
use slac::space::{CellTopology, Domain, ElementLayout, FunctionSpace};
use slac::{Compiler, CompilerParameters, KernelArguments};

#[test]
fn arguments_are_ordered_by_role() {
    let mut dag = ExpressionDag::new();
    let layout = ElementLayout::new(6, 3);
    let domain = dag.add_domain(Domain::extruded(CellTopology::triangle(), layout, 4).unwrap());
    let f = dag.add_coefficient(
        "f",
        FunctionSpace::mixed(domain, [ElementLayout::scalar(6), ElementLayout::new(6, 3)]),
    );
    let exterior = IntegralKernel::new("exterior", IntegralType::ExteriorFacet, |_: &mut [f64], _: &LocalKernelArgs| {})
        .oriented()
        .with_coefficients([0]);
    let top = IntegralKernel::new("top", IntegralType::ExteriorFacetTop, |_: &mut [f64], _: &LocalKernelArgs| {})
        .with_cell_sizes();
    let form = Form::new("a", domain, vec![FunctionSpace::simple(domain, 6, 1), FunctionSpace::simple(domain, 6, 1)])
        .with_coefficients([f])
        .with_integral(exterior)
        .with_integral(top);
    let root = dag.tensor(form).unwrap();
    let kernel = compile(&dag, root);

    let names: Vec<_> = kernel
        .arguments
        .iter()
        .map(|argument| argument.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["A", "coords", "cell_orientations", "w_0_0", "w_0_1", "cell_sizes", "arg_cell_facets", "layer"]
    );
    let extents: Vec<_> = kernel
        .arguments
        .iter()
        .map(|argument| argument.extent)
        .collect();
    assert_eq!(extents, vec![36, 18, 1, 6, 18, 6, 6, 1]);
    assert_eq!(
        kernel.arguments[4].role,
        ArgumentRole::Coefficient {
            index: 0,
            component: Some(1)
        }
    );

    assert_eq!(kernel.name, KERNEL_NAME);
    assert_eq!(kernel.index, vec![0, 0]);
    assert_eq!(kernel.coefficient_count, 1);
    let info = &kernel.info;
    assert_eq!(info.integral_type, IntegralType::Cell);
    assert_eq!(info.subdomain_id, "otherwise");
    assert_eq!(info.domain_number, 0);
    assert_eq!(info.coefficient_map, vec![0]);
    assert!(info.oriented);
    assert!(info.needs_cell_facets);
    assert!(info.needs_mesh_layers);
    assert!(info.needs_cell_sizes);
}

#[test]
fn local_kernels_receive_the_cell_data() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let integral = IntegralKernel::new("area", IntegralType::Cell, |output: &mut [f64], args: &LocalKernelArgs| {
        let orientation = args.cell_orientations.map_or(0, |orientations| orientations[0]);
        let size: f64 = args.cell_sizes.map_or(0.0, |sizes| sizes.iter().sum());
        output[0] += args.coordinates.iter().sum::<f64>() + f64::from(orientation) + size;
    })
    .oriented()
    .with_cell_sizes();
    let form = Form::new("area", domain, vec![]).with_integral(integral);
    let root = dag.tensor(form).unwrap();
    let kernel = compile(&dag, root);

    let mut output = vec![0.0];
    let coordinates = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    let orientations = [1];
    let sizes = [0.25, 0.25, 0.5];
    kernel
        .invoke(
            KernelArguments::new(&mut output, &coordinates)
                .with_cell_orientations(&orientations)
                .with_cell_sizes(&sizes),
        )
        .unwrap();
    assert_eq!(output, vec![4.0]);
}

#[test]
fn wrong_number_of_coefficients_is_reported() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let f = dag.add_coefficient("f", FunctionSpace::simple(domain, 3, 1));
    let root = dag.assembled_vector(f);
    let kernel = compile(&dag, root);

    let mut output = vec![0.0; 3];
    let coordinates = vec![0.0; 6];
    let result = kernel.invoke(KernelArguments::new(&mut output, &coordinates));
    assert!(result.is_err());

    let short = [1.0, 2.0];
    let result = kernel.invoke(KernelArguments::new(&mut output, &coordinates).with_coefficients([&short[..]]));
    assert!(result.is_err());
    assert_eq!(output, vec![0.0; 3]);
}

#[test]
fn c_source_declares_the_kernel_and_its_callees() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, vec![1.0, 0.0, 0.0, 1.0]);
    let b = matrix_tensor(&mut dag, domain, "b", 2, 2, vec![1.0; 4]);
    let root = dag.sub(a, b).unwrap();
    let source = compile(&dag, root).c_source();

    assert!(source.contains("#include <stdint.h>"));
    assert!(source.contains("void compile_slate(double *__restrict__ A, double const *__restrict__ coords)"));
    assert!(source.contains("void a_cell(double *__restrict__, double const *__restrict__);"));
    assert!(source.contains("a_cell(T0, coords);"));
    assert!(source.contains("memset(T0, 0, 4 * sizeof(double));"));
    assert!(source.contains("/* Linear algebra expression */"));
    assert!(source.contains("-1e0"));
    assert!(!source.contains("inverse_"));
    assert!(!source.contains("solve_"));
}

#[test]
fn c_source_includes_preambles_of_used_routines_only() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 2, 2, vec![2.0, 0.0, 0.0, 2.0]);
    let inverse = dag.inverse(a).unwrap();
    let source = compile(&dag, inverse).c_source();
    assert!(source.contains("static void inverse_(PetscScalar* A, PetscBLASInt N)"));
    assert!(!source.contains("static void solve_"));

    let b = vector_tensor(&mut dag, domain, "b", vec![1.0, 1.0]);
    let solve = dag.solve(a, b).unwrap();
    let source = compile(&dag, solve).c_source();
    assert!(source.contains("static void solve_(PetscScalar* A, PetscScalar* B, PetscBLASInt N)"));
    assert!(!source.contains("static void inverse_"));
}

#[test]
fn c_source_passes_facet_numbers_and_markers() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let form = Form::new("functional", domain, vec![])
        .with_integral(constant_integral("ds", IntegralType::ExteriorFacet, vec![1.0]));
    let root = dag.tensor(form).unwrap();
    let source = compile(&dag, root).c_source();

    assert!(source.contains("int8_t const *__restrict__ arg_cell_facets"));
    assert!(source.contains("int8_t (*cell_facets)[2] = (int8_t (*)[2])arg_cell_facets;"));
    assert!(source.contains("== 0) {"));
    assert!(source.contains("(unsigned int[]){"));
}

#[test]
fn literal_precision_follows_the_parameters() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, domain, "a", 1, 1, vec![1.0]);
    let root = dag.negative(a);
    let parameters = CompilerParameters::default().with("precision", "3");
    let kernel = Compiler::default()
        .generate_kernel(&dag, root, &parameters)
        .unwrap();
    assert!(kernel.c_source().contains("-1e0"));

    let invalid = CompilerParameters::default().with("precision", "many");
    assert!(Compiler::default()
        .generate_kernel(&dag, root, &invalid)
        .is_err());
    let single = CompilerParameters::default().with("scalar_type", "float");
    assert!(Compiler::default()
        .generate_kernel(&dag, root, &single)
        .is_err());
}

#[test]
fn expressions_over_several_domains_are_rejected() {
    let mut dag = ExpressionDag::new();
    let first = triangle_domain(&mut dag);
    let second = triangle_domain(&mut dag);
    let a = matrix_tensor(&mut dag, first, "a", 2, 2, vec![1.0; 4]);
    let b = matrix_tensor(&mut dag, second, "b", 2, 2, vec![1.0; 4]);
    let root = dag.add(a, b).unwrap();
    let result = Compiler::default().generate_kernel(&dag, root, &CompilerParameters::default());
    assert!(matches!(result, Err(slac::CompileError::UnsupportedFeature(_))));
}

#[test]
fn estimated_flops_include_the_linear_algebra() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let form = Form::new("a", domain, vec![FunctionSpace::simple(domain, 2, 1), FunctionSpace::simple(domain, 2, 1)])
        .with_integral(constant_integral("a_cell", IntegralType::Cell, vec![1.0; 4]).with_flops(100));
    let a = dag.tensor(form).unwrap();
    let root = dag.mul(a, a).unwrap();
    let kernel = compile(&dag, root);
    // 2 * rows * cols * inner for the product
    assert_eq!(kernel.estimated_flops, 100 + 2 * 2 * 2 * 2);
}
