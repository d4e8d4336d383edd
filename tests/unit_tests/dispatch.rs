use crate::{compile, count_statements, triangle_domain};
use slac::error::CompileError;
use slac::expression::{ExpressionDag, NodeId};
use slac::form::{Form, IntegralKernel, IntegralType, LocalKernelArgs};
use slac::kernel::CompiledKernel;
use slac::loops::{Condition, Statement};
use slac::space::{CellTopology, Domain, DomainId, ElementLayout};
use slac::KernelArguments;

/// A local kernel on a scalar form that adds `scale * (facet + 1)`.
fn facet_integral(name: &str, integral_type: IntegralType, scale: f64) -> IntegralKernel {
    IntegralKernel::new(name, integral_type, move |output: &mut [f64], args: &LocalKernelArgs| {
        let facet = args.facet.expect("Facet integrals receive a facet number");
        output[0] += scale * (facet + 1) as f64;
    })
}

fn scalar_form(dag: &mut ExpressionDag, domain: DomainId, integrals: Vec<IntegralKernel>) -> NodeId {
    let form = integrals
        .into_iter()
        .fold(Form::new("functional", domain, vec![]), Form::with_integral);
    dag.tensor(form).unwrap()
}

fn invoke(kernel: &CompiledKernel, cell_facets: Option<&[[i8; 2]]>, layer: Option<i32>) -> f64 {
    let mut output = vec![0.0];
    let coordinates = vec![0.0; kernel.arguments[1].extent];
    let mut args = KernelArguments::new(&mut output, &coordinates);
    if let Some(cell_facets) = cell_facets {
        args = args.with_cell_facets(cell_facets);
    }
    if let Some(layer) = layer {
        args = args.with_layer(layer);
    }
    kernel.invoke(args).unwrap();
    output[0]
}

#[test]
fn facet_integrals_follow_the_facet_markers() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![
            crate::constant_integral("cell", IntegralType::Cell, vec![1000.0]),
            facet_integral("exterior", IntegralType::ExteriorFacet, 1.0),
            facet_integral("interior", IntegralType::InteriorFacet, 10.0),
            facet_integral("interior_2", IntegralType::InteriorFacet, 100.0).with_subdomain(2),
        ],
    );
    let kernel = compile(&dag, root);
    assert!(kernel.info.needs_cell_facets);
    assert!(!kernel.info.needs_mesh_layers);

    // Facet 0 is interior, facet 1 exterior, facet 2 interior and in subdomain 2
    let markers: [[i8; 2]; 3] = [[1, 0], [0, 0], [1, 2]];
    let value = invoke(&kernel, Some(&markers[..]), None);
    // cell + exterior on facet 1 + interior on facets 0 and 2 + subdomain 2 on facet 2
    assert_eq!(value, 1000.0 + 2.0 + (10.0 + 30.0) + 300.0);

    let all_exterior: [[i8; 2]; 3] = [[0, 0], [0, 0], [0, 2]];
    assert_eq!(invoke(&kernel, Some(&all_exterior[..]), None), 1000.0 + 1.0 + 2.0 + 3.0);
}

#[test]
fn facet_loop_runs_over_every_facet_of_the_cell() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![facet_integral("exterior", IntegralType::ExteriorFacet, 1.0)],
    );
    let kernel = compile(&dag, root);

    let loops = count_statements(&kernel.body.statements, &|statement| match statement {
        Statement::Loop { extent: 3, body, .. } => matches!(
            body.first(),
            Some(Statement::If { condition: Condition::CellFacet { column: 0, value: 0, .. }, .. })
        ),
        _ => false,
    });
    assert_eq!(loops, 1);
    let facets = kernel
        .arguments
        .iter()
        .find(|argument| argument.name == "arg_cell_facets")
        .unwrap();
    assert_eq!(facets.extent, 6);
    assert_eq!(facets.dtype, "int8_t");
}

#[test]
fn subdomain_calls_are_grouped_by_subdomain() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![
            facet_integral("b", IntegralType::ExteriorFacet, 1.0).with_subdomain(7),
            facet_integral("a", IntegralType::ExteriorFacet, 10.0).with_subdomain(3),
            facet_integral("c", IntegralType::ExteriorFacet, 100.0).with_subdomain(7),
        ],
    );
    let kernel = compile(&dag, root);

    let subdomain_checks = count_statements(&kernel.body.statements, &|statement| {
        matches!(statement, Statement::If { condition: Condition::CellFacet { column: 1, .. }, .. })
    });
    assert_eq!(subdomain_checks, 2);

    let markers: [[i8; 2]; 3] = [[0, 7], [0, 3], [1, 7]];
    // Subdomain 7 on facet 0, subdomain 3 on facet 1, facet 2 is interior
    assert_eq!(invoke(&kernel, Some(&markers[..]), None), 1.0 + 100.0 + 20.0);
}

fn extruded_domain(dag: &mut ExpressionDag, layers: usize) -> DomainId {
    dag.add_domain(Domain::extruded(CellTopology::triangle(), ElementLayout::new(6, 3), layers).unwrap())
}

#[test]
fn horizontal_facets_are_dispatched_on_the_layer() {
    let mut dag = ExpressionDag::new();
    let domain = extruded_domain(&mut dag, 5);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![
            // Adds 2 on the top facet (local index 1) and 1 on the bottom facet (0)
            facet_integral("interior_horiz", IntegralType::InteriorFacetHoriz, 1.0),
            facet_integral("top", IntegralType::ExteriorFacetTop, 100.0),
            facet_integral("bottom", IntegralType::ExteriorFacetBottom, 1000.0),
        ],
    );
    let kernel = compile(&dag, root);
    assert!(kernel.info.needs_mesh_layers);
    assert!(!kernel.info.needs_cell_facets);
    assert_eq!(kernel.arguments.last().unwrap().name, "layer");

    // Bottom layer: interior on the top facet and the exterior bottom facet
    assert_eq!(invoke(&kernel, None, Some(0)), 2.0 + 1000.0);
    // Top layer: interior on the bottom facet and the exterior top facet
    assert_eq!(invoke(&kernel, None, Some(4)), 1.0 + 200.0);
    // Everything in between sees both interior facets
    for layer in 1..4 {
        assert_eq!(invoke(&kernel, None, Some(layer)), 1.0 + 2.0);
    }
}

#[test]
fn single_layer_sees_both_exterior_horizontal_facets() {
    let mut dag = ExpressionDag::new();
    let domain = extruded_domain(&mut dag, 1);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![
            facet_integral("interior_horiz", IntegralType::InteriorFacetHoriz, 1.0),
            facet_integral("top", IntegralType::ExteriorFacetTop, 100.0),
            facet_integral("bottom", IntegralType::ExteriorFacetBottom, 1000.0),
        ],
    );
    let kernel = compile(&dag, root);
    assert!(kernel.info.needs_mesh_layers);

    // The top facet has local index 1, so the top integral adds 200
    assert_eq!(invoke(&kernel, None, Some(0)), 1000.0 + 200.0);
}

#[test]
fn extruded_domains_need_a_layer() {
    let result = Domain::extruded(CellTopology::triangle(), ElementLayout::new(6, 3), 0);
    assert!(matches!(result, Err(CompileError::InvalidDomain(_))));
}

#[test]
fn vertical_facets_use_the_facet_loop() {
    let mut dag = ExpressionDag::new();
    let domain = extruded_domain(&mut dag, 2);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![
            facet_integral("exterior_vert", IntegralType::ExteriorFacetVert, 1.0),
            facet_integral("interior_vert", IntegralType::InteriorFacetVert, 10.0),
        ],
    );
    let kernel = compile(&dag, root);
    assert!(kernel.info.needs_cell_facets);
    assert!(!kernel.info.needs_mesh_layers);

    let markers: [[i8; 2]; 3] = [[0, 0], [1, 0], [0, 0]];
    assert_eq!(invoke(&kernel, Some(&markers[..]), None), 1.0 + 20.0 + 3.0);
}

#[test]
fn extruded_integrals_require_an_extruded_domain() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let form = Form::new("functional", domain, vec![])
        .with_integral(facet_integral("top", IntegralType::ExteriorFacetTop, 1.0));
    assert!(matches!(dag.tensor(form), Err(CompileError::UnsupportedFeature(_))));
}

#[test]
fn subdomains_are_only_supported_on_facet_integrals() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let form = Form::new("functional", domain, vec![])
        .with_integral(crate::constant_integral("cell", IntegralType::Cell, vec![1.0]).with_subdomain(1));
    assert!(matches!(dag.tensor(form), Err(CompileError::UnsupportedFeature(_))));
}

#[test]
fn missing_facet_markers_are_reported() {
    let mut dag = ExpressionDag::new();
    let domain = triangle_domain(&mut dag);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![facet_integral("exterior", IntegralType::ExteriorFacet, 1.0)],
    );
    let kernel = compile(&dag, root);

    let mut output = vec![0.0];
    let coordinates = vec![0.0; 6];
    let result = kernel.invoke(KernelArguments::new(&mut output, &coordinates));
    let message = result.unwrap_err().to_string();
    assert!(message.contains("arg_cell_facets"), "unexpected error: {}", message);

    // Too few facets
    let markers: [[i8; 2]; 2] = [[0, 0], [0, 0]];
    let mut output = vec![0.0];
    let result = kernel.invoke(KernelArguments::new(&mut output, &coordinates).with_cell_facets(&markers));
    assert!(result.is_err());
    assert_eq!(output, vec![0.0]);
}

#[test]
fn terminal_flops_count_every_dispatch() {
    let mut dag = ExpressionDag::new();
    let domain = extruded_domain(&mut dag, 3);
    let root = scalar_form(
        &mut dag,
        domain,
        vec![
            crate::constant_integral("cell", IntegralType::Cell, vec![1.0]).with_flops(10),
            facet_integral("exterior_vert", IntegralType::ExteriorFacetVert, 1.0).with_flops(5),
            facet_integral("top", IntegralType::ExteriorFacetTop, 1.0).with_flops(7),
            facet_integral("interior_horiz", IntegralType::InteriorFacetHoriz, 1.0).with_flops(3),
        ],
    );
    let kernel = compile(&dag, root);
    assert_eq!(kernel.estimated_flops, 10 + 3 * 5 + 7 + 2 * 3);
}
