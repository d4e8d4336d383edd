//! Compilation of expressions into kernels.
use crate::cache::{CacheKey, KernelCache};
use crate::coefficients::resolve_coefficients;
use crate::config::{CompilerParameters, ExternalLibraries};
use crate::error::CompileError;
use crate::expression::{ExpressionDag, NodeId};
use crate::generate::generate;
use crate::kernel::CompiledKernel;
use crate::planner::plan_expression;
use crate::translate::translate;
use log::{debug, info};
use std::sync::Arc;
use std::time::Instant;

/// Compiles expressions against a fixed set of external numerical libraries.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    libraries: ExternalLibraries,
}

impl Compiler {
    pub fn new(libraries: ExternalLibraries) -> Self {
        Self { libraries }
    }

    /// Creates a compiler for the PETSc installation named by the environment.
    pub fn discover() -> Result<Self, CompileError> {
        ExternalLibraries::from_env().map(Self::new)
    }

    pub fn libraries(&self) -> &ExternalLibraries {
        &self.libraries
    }

    /// Returns the kernel for the expression rooted at `root`, compiling it on a cache miss.
    pub fn compile_expression(
        &self,
        dag: &ExpressionDag,
        root: NodeId,
        parameters: &CompilerParameters,
        cache: &dyn KernelCache,
    ) -> Result<Arc<CompiledKernel>, CompileError> {
        let key = CacheKey::new(dag.expression_hash(root), parameters);
        cache.get_or_compile(&key, &mut || self.generate_kernel(dag, root, parameters))
    }

    /// Compiles the expression rooted at `root`, bypassing any cache.
    pub fn generate_kernel(
        &self,
        dag: &ExpressionDag,
        root: NodeId,
        parameters: &CompilerParameters,
    ) -> Result<CompiledKernel, CompileError> {
        let start = Instant::now();
        let precision = parameters.precision()?;
        let scalar_type = parameters.scalar_type()?;

        let domains = dag.domains(root);
        if domains.len() > 1 {
            return Err(CompileError::unsupported("Multiple domains not implemented"));
        }
        let domain = dag.domain(domains[0]);
        debug!("Compiling expression {}", dag.display(root));

        let plan = plan_expression(dag, root);
        let layout = resolve_coefficients(dag, &plan);
        let lowered = translate(dag, &plan)?;
        let generated = generate(dag, &plan, &layout, &lowered);
        for routine in generated.body.routines() {
            let descriptor = routine.descriptor();
            if descriptor.dtype != scalar_type {
                return Err(CompileError::unsupported(format!(
                    "{} on {} buffers in a {} kernel",
                    descriptor.name, descriptor.dtype, scalar_type
                )));
            }
        }

        let kernel = CompiledKernel::assemble(
            generated,
            domain,
            dag.node(root).rank(),
            dag.flops(root),
            CacheKey::new(dag.expression_hash(root), parameters),
            self.libraries.clone(),
            precision,
        );
        info!(
            "compile_slate_expression finished in {} seconds",
            start.elapsed().as_secs_f64()
        );
        Ok(kernel)
    }
}
