//! Generation of the complete kernel body.
//!
//! The statements of a body always come in the same order:
//!
//! 1. every temporary is zeroed, in the order the temporaries were declared;
//! 2. the local kernels of the terminal tensors are called: cell integrals first, then the loop
//!    over cell facets, then the dispatch on the mesh layer;
//! 3. coefficient values are packed into their vector temporaries;
//! 4. auxiliary and factorization temporaries are assigned, in dependency order;
//! 5. the root expression is added to the output.
use crate::coefficients::CoefficientLayout;
use crate::expression::{ExpressionDag, TensorKind};
use crate::form::{HorizontalFacet, IntegralKernel, IntegralType};
use crate::loops::{
    Access, BodyBuilder, BufferId, BufferRole, Condition, FacetSelector, KernelBody, LinearIndex, ScalarExpr,
    Statement,
};
use crate::planner::{ExpressionPlan, TemporaryKind};
use crate::space::CoefficientId;
use crate::translate::LoweredExpression;
use log::debug;
use std::collections::BTreeMap;

/// Name of the output buffer.
pub const OUTPUT_NAME: &str = "A";

/// A kernel body together with what it needs from its caller.
#[derive(Debug, Clone)]
pub struct GeneratedBody {
    pub body: KernelBody,
    /// Local kernels referenced by [`Statement::CallLocalKernel`], by position.
    pub integrals: Vec<IntegralKernel>,
    /// Coefficients passed to the kernel, in argument order.
    pub coefficients: Vec<CoefficientId>,
    pub oriented: bool,
    pub needs_cell_sizes: bool,
    pub needs_cell_facets: bool,
    pub needs_mesh_layers: bool,
    pub num_facets: usize,
    /// Estimated cost of evaluating all local kernels once.
    pub terminal_flops: usize,
}

/// Local kernel calls sorted by where they are dispatched.
#[derive(Default)]
struct CallSets {
    cell: Vec<Statement>,
    exterior: Vec<Statement>,
    interior: Vec<Statement>,
    /// Subdomain-restricted facet calls by subdomain id, as (exterior, interior).
    subdomains: BTreeMap<i64, (Vec<Statement>, Vec<Statement>)>,
    exterior_top: Vec<Statement>,
    exterior_bottom: Vec<Statement>,
    /// Interior horizontal facet calls evaluated on the top facet of the cell.
    interior_top: Vec<Statement>,
    /// Interior horizontal facet calls evaluated on the bottom facet of the cell.
    interior_bottom: Vec<Statement>,
}

pub fn generate(
    dag: &ExpressionDag,
    plan: &ExpressionPlan,
    layout: &CoefficientLayout,
    lowered: &LoweredExpression,
) -> GeneratedBody {
    let mut builder = BodyBuilder::new(&lowered.form);
    let root_shape = dag.node(plan.root).matrix_shape();
    let output = builder.declare_buffer(OUTPUT_NAME, BufferRole::Output, root_shape);

    // Coefficient buffers, one per component of a mixed coefficient
    let coefficients = dag.coefficients(plan.root);
    let mut coefficient_buffers: BTreeMap<CoefficientId, Vec<BufferId>> = BTreeMap::new();
    for (index, &coefficient) in coefficients.iter().enumerate() {
        let element = &dag.coefficient(coefficient).space.element;
        let buffers = if element.is_mixed() {
            element
                .components()
                .iter()
                .enumerate()
                .map(|(component, layout)| {
                    builder.declare_buffer(
                        format!("w_{}_{}", index, component),
                        BufferRole::Coefficient {
                            index,
                            component: Some(component),
                        },
                        (layout.extent(), 1),
                    )
                })
                .collect()
        } else {
            vec![builder.declare_buffer(
                format!("w_{}", index),
                BufferRole::Coefficient { index, component: None },
                (element.dimension(), 1),
            )]
        };
        coefficient_buffers.insert(coefficient, buffers);
    }

    let temporaries: Vec<BufferId> = plan
        .temporaries
        .iter()
        .map(|temporary| builder.declare_buffer(temporary.name.clone(), BufferRole::Temporary, temporary.shape))
        .collect();

    if !temporaries.is_empty() {
        builder.push(Statement::Comment("Declare and initialize".to_string()));
        builder.extend(temporaries.iter().map(|&buffer| Statement::Zero(buffer)));
    }

    // Local kernel calls
    let domain_id = *dag
        .domains(plan.root)
        .first()
        .expect("Internal error: expression without terminals");
    let domain = dag.domain(domain_id);
    let num_facets = domain.num_facets();
    let facet_var = builder.loop_var();
    let mut calls = CallSets::default();
    let mut integrals = Vec::new();
    let mut terminal_flops = 0;
    for temporary in plan.temporaries.iter() {
        let form = match dag.node(temporary.node).kind() {
            TensorKind::Tensor(form) => form,
            _ => continue,
        };
        let target = builder
            .buffer_by_name(&temporary.name)
            .expect("Internal error: temporary buffer was not declared");
        for integral in &form.integrals {
            let kernel = integrals.len();
            integrals.push(integral.clone());
            let call_coefficients: Vec<BufferId> = integral
                .coefficient_map
                .iter()
                .flat_map(|&local| coefficient_buffers[&form.coefficients[local]].iter().copied())
                .collect();
            let call = |facet: Option<FacetSelector>| Statement::CallLocalKernel {
                kernel,
                output: target,
                coefficients: call_coefficients.clone(),
                facet,
            };

            let on_facet = Some(FacetSelector::Loop(facet_var));
            let on_top = Some(FacetSelector::Horizontal(HorizontalFacet::Top));
            let on_bottom = Some(FacetSelector::Horizontal(HorizontalFacet::Bottom));
            use IntegralType::*;
            match (integral.integral_type, integral.subdomain_id) {
                (Cell, _) => {
                    calls.cell.push(call(None));
                    terminal_flops += integral.flops;
                }
                (ExteriorFacet | ExteriorFacetVert, None) => calls.exterior.push(call(on_facet)),
                (InteriorFacet | InteriorFacetVert, None) => calls.interior.push(call(on_facet)),
                (ExteriorFacet | ExteriorFacetVert, Some(id)) => {
                    calls.subdomains.entry(id).or_default().0.push(call(on_facet))
                }
                (InteriorFacet | InteriorFacetVert, Some(id)) => {
                    calls.subdomains.entry(id).or_default().1.push(call(on_facet))
                }
                (ExteriorFacetTop, _) => {
                    calls.exterior_top.push(call(on_top));
                    terminal_flops += integral.flops;
                }
                (ExteriorFacetBottom, _) => {
                    calls.exterior_bottom.push(call(on_bottom));
                    terminal_flops += integral.flops;
                }
                (InteriorFacetHoriz, _) => {
                    calls.interior_top.push(call(on_top));
                    calls.interior_bottom.push(call(on_bottom));
                    terminal_flops += 2 * integral.flops;
                }
            }
            if integral.integral_type.is_facet_loop() {
                terminal_flops += num_facets * integral.flops;
            }
        }
    }

    let oriented = integrals.iter().any(|integral| integral.oriented);
    let needs_cell_sizes = integrals.iter().any(|integral| integral.needs_cell_sizes);
    let needs_cell_facets = integrals
        .iter()
        .any(|integral| integral.integral_type.is_facet_loop());
    let needs_mesh_layers = integrals
        .iter()
        .any(|integral| integral.integral_type.is_horizontal());

    if !integrals.is_empty() {
        builder.push(Statement::Comment("Assemble local tensors".to_string()));
    }
    builder.extend(calls.cell.drain(..));

    if needs_cell_facets {
        builder.push(Statement::Comment("Loop over cell facets".to_string()));
        let mut exterior = std::mem::take(&mut calls.exterior);
        let mut interior = std::mem::take(&mut calls.interior);
        for (&id, (exterior_gated, interior_gated)) in &calls.subdomains {
            let in_subdomain = Condition::CellFacet {
                facet: facet_var,
                column: 1,
                value: id,
            };
            for (gated, target) in [(exterior_gated, &mut exterior), (interior_gated, &mut interior)] {
                if !gated.is_empty() {
                    target.push(Statement::If {
                        condition: in_subdomain,
                        then: gated.clone(),
                        otherwise: vec![],
                    });
                }
            }
        }

        let mut body = Vec::new();
        for (calls, marker) in [(exterior, 0), (interior, 1)] {
            if !calls.is_empty() {
                body.push(Statement::If {
                    condition: Condition::CellFacet {
                        facet: facet_var,
                        column: 0,
                        value: marker,
                    },
                    then: calls,
                    otherwise: vec![],
                });
            }
        }
        builder.push(Statement::Loop {
            var: facet_var,
            extent: num_facets,
            body,
        });
    }

    if needs_mesh_layers {
        let num_layers = domain
            .layers
            .expect("Internal error: horizontal facet integrals on a domain that is not extruded");
        builder.push(Statement::Comment("Mesh levels".to_string()));
        if num_layers == 1 {
            // The only layer is both the bottom and the top, so no horizontal facet is interior
            builder.extend(calls.exterior_bottom);
            builder.extend(calls.exterior_top);
        } else {
            let bottom_layer = [calls.interior_top.clone(), calls.exterior_bottom].concat();
            let top_layer = [calls.interior_bottom.clone(), calls.exterior_top].concat();
            let other_layers = [calls.interior_bottom, calls.interior_top].concat();
            builder.push(Statement::If {
                condition: Condition::Layer(0),
                then: bottom_layer,
                otherwise: vec![Statement::If {
                    condition: Condition::Layer(num_layers - 1),
                    then: top_layer,
                    otherwise: other_layers,
                }],
            });
        }
    }

    if !layout.is_empty() {
        builder.push(Statement::Comment("Pack coefficients".to_string()));
    }
    for group in layout.groups() {
        let node = builder.loop_var();
        let dof = builder.loop_var();
        let dofs = group.extents.dof_extent;
        let assignments = group
            .members
            .iter()
            .map(|info| {
                let source = coefficient_buffers[&info.coefficient][info.space_index];
                let target = builder
                    .buffer_by_name(&info.local_temp)
                    .expect("Internal error: coefficient temporary was not declared");
                Statement::Assign {
                    target: Access {
                        buffer: target,
                        index: LinearIndex::constant(info.offset_index)
                            .plus(node, dofs)
                            .plus(dof, 1),
                    },
                    value: ScalarExpr::Load(Access {
                        buffer: source,
                        index: LinearIndex::constant(0).plus(node, dofs).plus(dof, 1),
                    }),
                }
            })
            .collect();
        builder.push(Statement::Loop {
            var: node,
            extent: group.extents.node_extent,
            body: vec![Statement::Loop {
                var: dof,
                extent: dofs,
                body: assignments,
            }],
        });
    }

    for (name, value) in &lowered.definitions {
        let target = builder
            .buffer_by_name(name)
            .expect("Internal error: auxiliary temporary was not declared");
        let kind = plan
            .temporaries
            .iter()
            .find(|temporary| &temporary.name == name)
            .map(|temporary| temporary.kind);
        let comment = match kind {
            Some(TemporaryKind::Factorization) => format!("Factorization {}", name),
            _ => format!("Auxiliary {}", name),
        };
        builder.push(Statement::Comment(comment));
        let statements = builder.assign(target, *value);
        builder.extend(statements);
    }

    builder.push(Statement::Comment("Linear algebra expression".to_string()));
    let statements = builder.accumulate(output, lowered.root);
    builder.extend(statements);

    let body = builder.finish();
    debug!(
        "Generated kernel body with {} buffers, {} local kernel calls and {} routines",
        body.buffers.len(),
        integrals.len(),
        body.routines().len()
    );

    GeneratedBody {
        body,
        integrals,
        coefficients,
        oriented,
        needs_cell_sizes,
        needs_cell_facets,
        needs_mesh_layers,
        num_facets,
        terminal_flops,
    }
}
