//! Dense numerical routines that generated kernels call out to.
//!
//! Each routine is described once in a static registry, which carries the name used in
//! expressions, the symbol called from generated code, and the C preamble that defines it.
//! The same routines are implemented natively for kernels executed in-process.
//!
//! All buffers are dense and row-major. Routines work in place: [`inverse`] overwrites its
//! matrix with the inverse, [`solve`] overwrites the right-hand side with the solution.
//! When a routine fails, its output buffer is left untouched.
use crate::error::NumericalFailure;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExternalRoutine {
    Inverse,
    Solve,
}

/// Static description of an external routine.
#[derive(Debug)]
pub struct RoutineDescriptor {
    /// Name used in expressions.
    pub name: &'static str,
    /// Symbol called from generated code.
    pub name_in_target: &'static str,
    /// Number of matrix operands. The dimension is passed as an extra trailing argument.
    pub arity: usize,
    /// Scalar type of the operands. Must match the scalar type of the kernels calling it.
    pub dtype: &'static str,
    /// C source defining `name_in_target`.
    pub preamble: &'static str,
}

static INVERSE: RoutineDescriptor = RoutineDescriptor {
    name: "inverse",
    name_in_target: "inverse_",
    arity: 1,
    dtype: "double",
    preamble: r#"#ifndef SLAC_INVERSE_H
#define SLAC_INVERSE_H
#include <stdio.h>
#include <stdlib.h>
#include <petscsystypes.h>
#include <petscblaslapack.h>
static void inverse_(PetscScalar* A, PetscBLASInt N)
{
    PetscBLASInt info;
    PetscBLASInt* ipiv = (PetscBLASInt*) malloc(N * sizeof(PetscBLASInt));
    PetscScalar* Awork = (PetscScalar*) malloc(N * N * sizeof(PetscScalar));
    LAPACKgetrf_(&N, &N, A, &N, ipiv, &info);
    if (info == 0)
        LAPACKgetri_(&N, A, &N, ipiv, Awork, &N, &info);
    if (info != 0)
        fprintf(stderr, "Getri throws nonzero info.");
    free(Awork);
    free(ipiv);
}
#endif
"#,
};

// A row-major matrix is its own transpose to LAPACK, hence the transposed solve.
static SOLVE: RoutineDescriptor = RoutineDescriptor {
    name: "solve",
    name_in_target: "solve_",
    arity: 2,
    dtype: "double",
    preamble: r#"#ifndef SLAC_SOLVE_H
#define SLAC_SOLVE_H
#include <stdio.h>
#include <stdlib.h>
#include <petscsystypes.h>
#include <petscblaslapack.h>
static void solve_(PetscScalar* A, PetscScalar* B, PetscBLASInt N)
{
    PetscBLASInt info;
    PetscBLASInt NRHS = 1;
    PetscBLASInt* ipiv = (PetscBLASInt*) malloc(N * sizeof(PetscBLASInt));
    LAPACKgetrf_(&N, &N, A, &N, ipiv, &info);
    if (info == 0)
        LAPACKgetrs_("T", &N, &NRHS, A, &N, ipiv, B, &N, &info);
    if (info != 0)
        fprintf(stderr, "Gesv throws nonzero info.");
    free(ipiv);
}
#endif
"#,
};

impl ExternalRoutine {
    pub fn descriptor(&self) -> &'static RoutineDescriptor {
        match self {
            ExternalRoutine::Inverse => &INVERSE,
            ExternalRoutine::Solve => &SOLVE,
        }
    }
}

/// Inverts the row-major `n x n` matrix `a` in place.
pub fn inverse(a: &mut [f64], n: usize) -> Result<(), NumericalFailure> {
    assert_eq!(a.len(), n * n, "Matrix buffer must hold n * n entries");
    let failure = NumericalFailure {
        routine: ExternalRoutine::Inverse,
        dimension: n,
    };
    let matrix = DMatrix::from_row_slice(n, n, a);
    let inverse = matrix.lu().try_inverse().ok_or(failure)?;
    if inverse.iter().any(|x| !x.is_finite()) {
        return Err(failure);
    }
    for i in 0..n {
        for j in 0..n {
            a[n * i + j] = inverse[(i, j)];
        }
    }
    Ok(())
}

/// Solves `a x = b` for a single right-hand side, overwriting `b` with `x`.
///
/// The matrix `a` is row-major and is not modified.
pub fn solve(a: &[f64], b: &mut [f64], n: usize) -> Result<(), NumericalFailure> {
    assert_eq!(a.len(), n * n, "Matrix buffer must hold n * n entries");
    assert_eq!(b.len(), n, "Right-hand side must hold n entries");
    let failure = NumericalFailure {
        routine: ExternalRoutine::Solve,
        dimension: n,
    };
    let matrix = DMatrix::from_row_slice(n, n, a);
    let rhs = DVector::from_column_slice(b);
    let x = matrix.lu().solve(&rhs).ok_or(failure)?;
    if x.iter().any(|x| !x.is_finite()) {
        return Err(failure);
    }
    b.copy_from_slice(x.as_slice());
    Ok(())
}
