//! Error types produced during compilation and kernel execution.
use crate::routines::ExternalRoutine;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// An error that aborts the compilation of an expression.
///
/// No kernel is cached for an expression whose compilation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The expression uses a construct the compiler does not support.
    UnsupportedFeature(String),
    /// The operands of an operation have non-conformable shapes.
    ShapeMismatch {
        operation: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// A compilation parameter could not be interpreted.
    InvalidParameter { key: String, value: String },
    /// The external numerical libraries are not configured.
    Configuration(String),
    /// A mesh domain that no cell can belong to.
    InvalidDomain(String),
}

impl CompileError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        CompileError::UnsupportedFeature(msg.into())
    }

    pub fn shape_mismatch(operation: &'static str, left: &[usize], right: &[usize]) -> Self {
        CompileError::ShapeMismatch {
            operation,
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        CompileError::Configuration(msg.into())
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnsupportedFeature(msg) => write!(f, "Unsupported feature: {}", msg),
            CompileError::ShapeMismatch { operation, left, right } => write!(
                f,
                "Shape mismatch in {}: operands have shapes {:?} and {:?}",
                operation, left, right
            ),
            CompileError::InvalidParameter { key, value } => {
                write!(f, "Invalid compilation parameter {}={:?}", key, value)
            }
            CompileError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            CompileError::InvalidDomain(msg) => write!(f, "Invalid domain: {}", msg),
        }
    }
}

impl Error for CompileError {}

/// A failure reported by an external numerical routine while a kernel runs.
///
/// These failures are written to the diagnostic log and never abort the kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NumericalFailure {
    pub routine: ExternalRoutine,
    pub dimension: usize,
}

impl Display for NumericalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} throws nonzero info: {}x{} matrix is singular",
            self.routine.descriptor().name_in_target,
            self.dimension,
            self.dimension
        )
    }
}

impl Error for NumericalFailure {}
