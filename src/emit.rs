//! C code emission for compiled kernels.
use crate::kernel::{ArgumentRole, CompiledKernel, KernelArgument};
use crate::loops::{
    Access, BufferId, BufferRole, Condition, FacetSelector, KernelBody, LinearIndex, LoopVar, ScalarExpr, Statement,
};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Name the facet marker argument is cast to.
const CELL_FACETS: &str = "cell_facets";

/// Formats a literal with the given number of significant digits.
pub fn format_literal(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0.0".to_string();
    }
    let formatted = format!("{:.*e}", precision.max(1) - 1, value);
    let (mantissa, exponent) = formatted
        .split_once('e')
        .expect("Internal error: exponential format without exponent");
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{}e{}", mantissa, exponent)
}

fn loop_var(var: LoopVar) -> String {
    format!("i{}", var.index())
}

fn linear_index(index: &LinearIndex) -> String {
    let mut terms: Vec<String> = index
        .terms
        .iter()
        .map(|&(var, stride)| match stride {
            1 => loop_var(var),
            _ => format!("{}*{}", stride, loop_var(var)),
        })
        .collect();
    if index.constant != 0 || terms.is_empty() {
        terms.push(index.constant.to_string());
    }
    terms.join(" + ")
}

/// Formal parameters of a local kernel, as inferred from its calls.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalSignature {
    oriented: bool,
    coefficients: usize,
    cell_sizes: bool,
    facet: bool,
}

struct Emitter<'k> {
    kernel: &'k CompiledKernel,
    body: &'k KernelBody,
    out: String,
    indent: usize,
    prototypes: BTreeMap<String, LocalSignature>,
}

impl<'k> Emitter<'k> {
    fn name(&self, buffer: BufferId) -> &str {
        &self.body.buffer(buffer).name
    }

    fn access(&self, access: &Access) -> String {
        format!("{}[{}]", self.name(access.buffer), linear_index(&access.index))
    }

    fn scalar(&self, expression: &ScalarExpr) -> String {
        match expression {
            ScalarExpr::Literal(value) => format_literal(*value, self.kernel.precision),
            ScalarExpr::Load(access) => self.access(access),
            ScalarExpr::Scalar(scalar) => format!("s{}", scalar.index()),
            ScalarExpr::Add(a, b) => format!("({} + {})", self.scalar(a), self.scalar(b)),
            ScalarExpr::Mul(a, b) => format!("({} * {})", self.scalar(a), self.scalar(b)),
        }
    }

    fn condition(&self, condition: &Condition) -> String {
        match condition {
            Condition::CellFacet { facet, column, value } => {
                format!("{}[{}][{}] == {}", CELL_FACETS, loop_var(*facet), column, value)
            }
            Condition::Layer(layer) => format!("layer == {}", layer),
        }
    }

    fn line(&mut self, line: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(line);
        self.out.push('\n');
    }

    fn statements(&mut self, statements: &[Statement]) {
        for statement in statements {
            self.statement(statement);
        }
    }

    fn block(&mut self, header: &str, statements: &[Statement]) {
        self.line(&format!("{}{{", header));
        self.indent += 1;
        self.statements(statements);
        self.indent -= 1;
    }

    fn statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Comment(comment) => self.line(&format!("/* {} */", comment)),
            Statement::Zero(buffer) => {
                let line = format!(
                    "memset({}, 0, {} * sizeof(double));",
                    self.name(*buffer),
                    self.body.buffer(*buffer).len()
                );
                self.line(&line)
            }
            Statement::Loop { var, extent, body } => {
                let var = loop_var(*var);
                self.block(&format!("for (int {v} = 0; {v} < {}; ++{v}) ", extent, v = var), body);
                self.line("}");
            }
            Statement::Assign { target, value } => {
                let line = format!("{} = {};", self.access(target), self.scalar(value));
                self.line(&line)
            }
            Statement::Increment { target, value } => {
                let line = format!("{} += {};", self.access(target), self.scalar(value));
                self.line(&line)
            }
            Statement::ScalarAssign { scalar, value } => {
                let line = format!("double s{} = {};", scalar.index(), self.scalar(value));
                self.line(&line)
            }
            Statement::ScalarIncrement { scalar, value } => {
                let line = format!("s{} += {};", scalar.index(), self.scalar(value));
                self.line(&line)
            }
            Statement::CallLocalKernel {
                kernel,
                output,
                coefficients,
                facet,
            } => {
                let integral = &self.kernel.integrals()[*kernel];
                let mut args = vec![self.name(*output).to_string(), "coords".to_string()];
                if integral.oriented {
                    args.push("cell_orientations".to_string());
                }
                args.extend(coefficients.iter().map(|&buffer| self.name(buffer).to_string()));
                if integral.needs_cell_sizes {
                    args.push("cell_sizes".to_string());
                }
                match facet {
                    Some(FacetSelector::Loop(var)) => args.push(format!("(unsigned int[]){{{}}}", loop_var(*var))),
                    Some(FacetSelector::Horizontal(facet)) => {
                        args.push(format!("(unsigned int[]){{{}}}", facet.local_index()))
                    }
                    None => {}
                }
                self.prototypes
                    .entry(integral.name.clone())
                    .or_insert(LocalSignature {
                        oriented: integral.oriented,
                        coefficients: coefficients.len(),
                        cell_sizes: integral.needs_cell_sizes,
                        facet: facet.is_some(),
                    });
                let line = format!("{}({});", integral.name, args.join(", "));
                self.line(&line)
            }
            Statement::CallRoutine {
                routine,
                operands,
                dimension,
            } => {
                let line = format!(
                    "{}({}, {});",
                    routine.descriptor().name_in_target,
                    operands.iter().map(|&buffer| self.name(buffer)).join(", "),
                    dimension
                );
                self.line(&line)
            }
            Statement::If {
                condition,
                then,
                otherwise,
            } => {
                let header = format!("if ({}) ", self.condition(condition));
                self.block(&header, then);
                if otherwise.is_empty() {
                    self.line("}");
                } else {
                    self.block("} else ", otherwise);
                    self.line("}");
                }
            }
        }
    }
}

fn parameter(argument: &KernelArgument) -> String {
    match argument.role {
        ArgumentRole::Output => format!("{} *__restrict__ {}", argument.dtype, argument.name),
        ArgumentRole::Layer => format!("{} {}", argument.dtype, argument.name),
        _ => format!("{} const *__restrict__ {}", argument.dtype, argument.name),
    }
}

fn prototype(name: &str, signature: &LocalSignature) -> String {
    let mut parameters = vec!["double *__restrict__".to_string(), "double const *__restrict__".to_string()];
    if signature.oriented {
        parameters.push("int const *__restrict__".to_string());
    }
    parameters.extend(std::iter::repeat("double const *__restrict__".to_string()).take(signature.coefficients));
    if signature.cell_sizes {
        parameters.push("double const *__restrict__".to_string());
    }
    if signature.facet {
        parameters.push("unsigned int const *__restrict__".to_string());
    }
    format!("void {}({});", name, parameters.join(", "))
}

/// Renders the kernel as a self-contained C translation unit.
///
/// Preambles are included only for the external routines the kernel calls.
pub fn c_source(kernel: &CompiledKernel) -> String {
    let body = &kernel.body;
    let mut emitter = Emitter {
        kernel,
        body,
        out: String::new(),
        indent: 1,
        prototypes: BTreeMap::new(),
    };

    if kernel.info.needs_cell_facets {
        emitter.line(&format!(
            "int8_t (*{f})[2] = (int8_t (*)[2])arg_cell_facets;",
            f = CELL_FACETS
        ));
    }
    for buffer in &body.buffers {
        if matches!(buffer.role, BufferRole::Temporary | BufferRole::Scratch) {
            emitter.line(&format!("double {}[{}];", buffer.name, buffer.len()));
        }
    }
    emitter.statements(&body.statements);

    let mut source = String::new();
    source.push_str("#include <stdint.h>\n#include <string.h>\n\n");
    for routine in body.routines() {
        source.push_str(routine.descriptor().preamble);
        source.push('\n');
    }
    for (name, signature) in &emitter.prototypes {
        // Writing to a String cannot fail
        let _ = writeln!(source, "{}", prototype(name, signature));
    }
    let parameters = kernel.arguments.iter().map(parameter).join(", ");
    let _ = write!(source, "\nvoid {}({})\n{{\n", kernel.name, parameters);
    source.push_str(&emitter.out);
    source.push_str("}\n");
    source
}
