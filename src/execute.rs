//! In-process execution of compiled kernels.
use crate::form::LocalKernelArgs;
use crate::kernel::{ArgumentRole, CompiledKernel, KernelArguments};
use crate::loops::{Access, BufferId, BufferRole, Condition, FacetSelector, KernelBody, ScalarExpr, Statement};
use crate::routines::{self, ExternalRoutine};
use eyre::eyre;
use log::error;

/// Storage for the temporaries of a kernel body.
///
/// A workspace can be reused across invocations (and kernels) to avoid allocating for every cell.
#[derive(Debug, Default)]
pub struct KernelWorkspace {
    storage: Vec<Vec<f64>>,
    loop_vars: Vec<usize>,
    scalars: Vec<f64>,
}

impl KernelWorkspace {
    fn prepare(&mut self, body: &KernelBody) {
        self.storage.resize_with(body.buffers.len(), Vec::new);
        for (storage, buffer) in self.storage.iter_mut().zip(&body.buffers) {
            storage.clear();
            if !buffer.role.is_argument() {
                storage.resize(buffer.len(), 0.0);
            }
        }
        self.loop_vars.clear();
        self.loop_vars.resize(body.loop_var_count, 0);
        self.scalars.clear();
        self.scalars.resize(body.scalar_count, 0.0);
    }
}

#[derive(Debug, Copy, Clone)]
enum Location {
    Output,
    /// Position in the coefficient arguments.
    Coefficient(usize),
    Local,
}

struct Machine<'k, 'a, 'w> {
    kernel: &'k CompiledKernel,
    args: KernelArguments<'a>,
    locations: Vec<Location>,
    workspace: &'w mut KernelWorkspace,
}

/// Checks the arguments against the kernel signature, then interprets its body.
pub(crate) fn run(kernel: &CompiledKernel, args: KernelArguments, workspace: &mut KernelWorkspace) -> eyre::Result<()> {
    check_arguments(kernel, &args)?;

    let mut coefficient_position = 0;
    let locations = kernel
        .body
        .buffers
        .iter()
        .map(|buffer| match buffer.role {
            BufferRole::Output => Location::Output,
            BufferRole::Coefficient { .. } => {
                coefficient_position += 1;
                Location::Coefficient(coefficient_position - 1)
            }
            BufferRole::Temporary | BufferRole::Scratch => Location::Local,
        })
        .collect();

    workspace.prepare(&kernel.body);
    let mut machine = Machine {
        kernel,
        args,
        locations,
        workspace,
    };
    machine.execute(&kernel.body.statements);
    Ok(())
}

fn check_arguments(kernel: &CompiledKernel, args: &KernelArguments) -> eyre::Result<()> {
    let coefficient_count = kernel
        .arguments
        .iter()
        .filter(|argument| matches!(argument.role, ArgumentRole::Coefficient { .. }))
        .count();
    if args.coefficients.len() != coefficient_count {
        return Err(eyre!(
            "Kernel expects {} coefficient buffers, but {} were given",
            coefficient_count,
            args.coefficients.len()
        ));
    }

    let mut coefficients = args.coefficients.iter();
    for argument in &kernel.arguments {
        let given = match argument.role {
            ArgumentRole::Output => Some(args.output.len()),
            ArgumentRole::Coordinates => Some(args.coordinates.len()),
            ArgumentRole::CellOrientations => args.cell_orientations.map(<[i32]>::len),
            ArgumentRole::Coefficient { .. } => coefficients.next().map(|buffer| buffer.len()),
            ArgumentRole::CellSizes => args.cell_sizes.map(<[f64]>::len),
            ArgumentRole::CellFacets => args.cell_facets.map(|facets| 2 * facets.len()),
            ArgumentRole::Layer => args.layer.map(|_| 1),
        };
        match given {
            None => return Err(eyre!("Missing kernel argument {}", argument.name)),
            Some(len) if len < argument.extent => {
                return Err(eyre!(
                    "Kernel argument {} has {} entries, but at least {} are required",
                    argument.name,
                    len,
                    argument.extent
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

impl<'k, 'a, 'w> Machine<'k, 'a, 'w> {
    fn execute(&mut self, statements: &[Statement]) {
        for statement in statements {
            match statement {
                Statement::Comment(_) => {}
                Statement::Zero(buffer) => self.buffer_mut(*buffer).fill(0.0),
                Statement::Loop { var, extent, body } => {
                    for i in 0..*extent {
                        self.workspace.loop_vars[var.index()] = i;
                        self.execute(body);
                    }
                }
                Statement::Assign { target, value } => {
                    let value = self.evaluate(value);
                    let index = self.offset(target);
                    self.buffer_mut(target.buffer)[index] = value;
                }
                Statement::Increment { target, value } => {
                    let value = self.evaluate(value);
                    let index = self.offset(target);
                    self.buffer_mut(target.buffer)[index] += value;
                }
                Statement::ScalarAssign { scalar, value } => {
                    let value = self.evaluate(value);
                    self.workspace.scalars[scalar.index()] = value;
                }
                Statement::ScalarIncrement { scalar, value } => {
                    let value = self.evaluate(value);
                    self.workspace.scalars[scalar.index()] += value;
                }
                Statement::CallLocalKernel {
                    kernel,
                    output,
                    coefficients,
                    facet,
                } => self.call_local_kernel(*kernel, *output, coefficients, *facet),
                Statement::CallRoutine {
                    routine,
                    operands,
                    dimension,
                } => self.call_routine(*routine, operands, *dimension),
                Statement::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    if self.holds(condition) {
                        self.execute(then);
                    } else {
                        self.execute(otherwise);
                    }
                }
            }
        }
    }

    fn offset(&self, access: &Access) -> usize {
        access.index.constant
            + access
                .index
                .terms
                .iter()
                .map(|(var, stride)| self.workspace.loop_vars[var.index()] * stride)
                .sum::<usize>()
    }

    fn buffer(&self, id: BufferId) -> &[f64] {
        match self.locations[id.index()] {
            Location::Output => &*self.args.output,
            Location::Coefficient(position) => self.args.coefficients[position],
            Location::Local => &self.workspace.storage[id.index()],
        }
    }

    fn buffer_mut(&mut self, id: BufferId) -> &mut [f64] {
        match self.locations[id.index()] {
            Location::Output => &mut *self.args.output,
            Location::Local => &mut self.workspace.storage[id.index()],
            Location::Coefficient(_) => panic!("Internal error: kernel writes to a coefficient buffer"),
        }
    }

    fn evaluate(&self, expression: &ScalarExpr) -> f64 {
        match expression {
            ScalarExpr::Literal(value) => *value,
            ScalarExpr::Load(access) => self.buffer(access.buffer)[self.offset(access)],
            ScalarExpr::Scalar(scalar) => self.workspace.scalars[scalar.index()],
            ScalarExpr::Add(a, b) => self.evaluate(a) + self.evaluate(b),
            ScalarExpr::Mul(a, b) => self.evaluate(a) * self.evaluate(b),
        }
    }

    fn holds(&self, condition: &Condition) -> bool {
        match *condition {
            Condition::CellFacet { facet, column, value } => {
                let facets = self
                    .args
                    .cell_facets
                    .expect("Internal error: cell facets were checked before execution");
                i64::from(facets[self.workspace.loop_vars[facet.index()]][column]) == value
            }
            Condition::Layer(layer) => self.args.layer.map_or(false, |current| current as i64 == layer as i64),
        }
    }

    fn call_local_kernel(
        &mut self,
        kernel: usize,
        output: BufferId,
        coefficients: &[BufferId],
        facet: Option<FacetSelector>,
    ) {
        let coefficients: Vec<&[f64]> = coefficients
            .iter()
            .map(|&buffer| match self.locations[buffer.index()] {
                Location::Coefficient(position) => self.args.coefficients[position],
                _ => panic!("Internal error: local kernel coefficient is not a kernel argument"),
            })
            .collect();
        let facet = facet.map(|facet| match facet {
            FacetSelector::Loop(var) => self.workspace.loop_vars[var.index()],
            FacetSelector::Horizontal(facet) => facet.local_index(),
        });
        let local_args = LocalKernelArgs {
            coordinates: self.args.coordinates,
            cell_orientations: self.args.cell_orientations,
            coefficients: &coefficients,
            cell_sizes: self.args.cell_sizes,
            facet,
        };
        let integral = &self.kernel.integrals[kernel];
        let output = match self.locations[output.index()] {
            Location::Local => &mut self.workspace.storage[output.index()],
            _ => panic!("Internal error: local kernels write to temporaries only"),
        };
        integral.kernel.evaluate(output, &local_args);
    }

    fn call_routine(&mut self, routine: ExternalRoutine, operands: &[BufferId], dimension: usize) {
        let result = match routine {
            ExternalRoutine::Inverse => routines::inverse(self.buffer_mut(operands[0]), dimension),
            ExternalRoutine::Solve => {
                let mut rhs = std::mem::take(&mut self.workspace.storage[operands[1].index()]);
                let result = routines::solve(self.buffer(operands[0]), &mut rhs, dimension);
                self.workspace.storage[operands[1].index()] = rhs;
                result
            }
        };
        if let Err(failure) = result {
            error!("{}", failure);
        }
    }
}
