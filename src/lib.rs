//! Compilation of local linear algebra on finite element tensors into per-cell kernels.
//!
//! An expression over assembled local tensors (built in an [`expression::ExpressionDag`]) is
//! planned, translated into an index-based intermediate form, and generated into a single
//! kernel body. The resulting [`kernel::CompiledKernel`] can be executed in-process or emitted
//! as C.
pub mod cache;
pub mod coefficients;
pub mod compiler;
pub mod config;
pub mod emit;
pub mod error;
pub mod execute;
pub mod expression;
pub mod form;
pub mod gem;
pub mod generate;
pub mod kernel;
pub mod loops;
pub mod planner;
pub mod routines;
pub mod space;
pub mod translate;

#[cfg(feature = "proptest")]
pub mod proptest;

pub extern crate nalgebra;

pub use cache::{CacheKey, InMemoryKernelCache, KernelCache};
pub use compiler::Compiler;
pub use config::{CompilerParameters, ExternalLibraries};
pub use error::{CompileError, NumericalFailure};
pub use kernel::{CompiledKernel, KernelArguments};
