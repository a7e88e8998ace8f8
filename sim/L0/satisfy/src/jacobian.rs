//! The restriction Jacobian `dC/dR` and its solve back-ends.
//!
//! The matrix is square with one row and one column per scalar equation of
//! the active constraints. It is block-structured: the block at
//! `(consumer range, producer range)` holds the derivative of the consumer's
//! error with respect to the producer's restriction. Most blocks are zero,
//! since a restriction only reaches constraints sharing a body with it.
//!
//! # Solve Methods
//!
//! Three back-ends form an escalation ladder, cheapest first:
//!
//! | Method | Factorization | Singular when |
//! |--------|---------------|---------------|
//! | [`SolveMethod::Direct`] | LU with back-substitution | a pivot falls below the threshold |
//! | [`SolveMethod::ConjugateGradient`] | none (CG on the normal equations over CSR) | the search breaks down |
//! | [`SolveMethod::Svd`] | singular value decomposition | the smallest singular value falls below the cutoff |
//!
//! The conjugate-gradient back-end works on `JᵀJ x = Jᵀb` so that the
//! non-symmetric Jacobians produced by coupled restrictions are handled. It
//! only accepts a solution whose residual on the original system is small;
//! inconsistent systems are left to the SVD rung, which returns the
//! least-squares correction.

use std::ops::Range;

use nalgebra::linalg::{LU, SVD};
use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::SatisfyConfig;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Linear solve strategy, ordered from cheapest to most robust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SolveMethod {
    /// LU factorization with back-substitution.
    #[default]
    Direct,
    /// Conjugate gradient on the normal equations.
    ConjugateGradient,
    /// Singular value decomposition (pseudo-inverse).
    Svd,
}

impl SolveMethod {
    /// The escalation ladder, bottom rung first.
    pub const LADDER: [Self; 3] = [Self::Direct, Self::ConjugateGradient, Self::Svd];

    /// Next, more robust method, or `None` at the top of the ladder.
    #[must_use]
    pub const fn escalate(self) -> Option<Self> {
        match self {
            Self::Direct => Some(Self::ConjugateGradient),
            Self::ConjugateGradient => Some(Self::Svd),
            Self::Svd => None,
        }
    }

    /// Whether this is the most robust method.
    #[must_use]
    pub const fn is_top(self) -> bool {
        matches!(self, Self::Svd)
    }
}

impl std::fmt::Display for SolveMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Direct => "direct",
            Self::ConjugateGradient => "conjugate-gradient",
            Self::Svd => "svd",
        };
        f.write_str(name)
    }
}

/// Numerical settings shared by the solve back-ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveSettings {
    /// Relative threshold for pivots and singular values.
    pub singular_threshold: f64,
    /// Iteration cap of the conjugate-gradient back-end.
    pub cg_max_iterations: usize,
    /// Relative residual tolerance of the conjugate-gradient back-end.
    pub cg_tolerance: f64,
}

impl Default for SolveSettings {
    fn default() -> Self {
        Self::from_config(&SatisfyConfig::default())
    }
}

impl SolveSettings {
    /// Extract the solve settings from a manager configuration.
    #[must_use]
    pub fn from_config(config: &SatisfyConfig) -> Self {
        Self {
            singular_threshold: config.singular_threshold,
            cg_max_iterations: config.cg_max_iterations,
            cg_tolerance: config.cg_tolerance,
        }
    }
}

/// Square, block-structured Jacobian of stacked errors with respect to
/// stacked restrictions.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianMatrix {
    entries: DMatrix<f64>,
}

impl Default for JacobianMatrix {
    fn default() -> Self {
        Self::zeros(0)
    }
}

impl JacobianMatrix {
    /// All-zero matrix of the given size.
    #[must_use]
    pub fn zeros(size: usize) -> Self {
        Self {
            entries: DMatrix::zeros(size, size),
        }
    }

    /// Wrap a dense square matrix.
    ///
    /// Returns `None` if the matrix is not square.
    #[must_use]
    pub fn from_dense(entries: DMatrix<f64>) -> Option<Self> {
        (entries.nrows() == entries.ncols()).then_some(Self { entries })
    }

    /// Total constraint dimension.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.nrows()
    }

    /// Resize to `size` and clear every entry.
    pub fn reset(&mut self, size: usize) {
        if self.size() == size {
            self.entries.fill(0.0);
        } else {
            self.entries = DMatrix::zeros(size, size);
        }
    }

    /// Entry at `(row, col)`.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.entries[(row, col)]
    }

    /// Write a non-zero block with its top-left corner at `(row, col)`.
    pub fn set_block(&mut self, row: usize, col: usize, block: &DMatrix<f64>) {
        self.entries
            .view_mut((row, col), (block.nrows(), block.ncols()))
            .copy_from(block);
    }

    /// Write an explicit zero block.
    pub fn set_zero_block(&mut self, row: usize, col: usize, nrows: usize, ncols: usize) {
        self.entries.view_mut((row, col), (nrows, ncols)).fill(0.0);
    }

    /// Overwrite one column.
    pub fn set_column(&mut self, col: usize, values: &DVector<f64>) {
        self.entries.set_column(col, values);
    }

    /// Copy out the block with its top-left corner at `(row, col)`.
    #[must_use]
    pub fn block(&self, row: usize, col: usize, nrows: usize, ncols: usize) -> DMatrix<f64> {
        self.entries.view((row, col), (nrows, ncols)).into_owned()
    }

    /// Whether the block of two index ranges has any non-zero entry.
    #[must_use]
    pub fn block_is_nonzero(&self, rows: &Range<usize>, cols: &Range<usize>) -> bool {
        self.entries
            .view((rows.start, cols.start), (rows.len(), cols.len()))
            .iter()
            .any(|&v| v != 0.0)
    }

    /// Dense view of the matrix.
    #[must_use]
    pub const fn as_dense(&self) -> &DMatrix<f64> {
        &self.entries
    }

    /// Number of non-zero entries.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.entries.iter().filter(|&&v| v != 0.0).count()
    }

    /// Largest `|row - col|` over the non-zero entries.
    #[must_use]
    pub fn bandwidth(&self) -> usize {
        let n = self.size();
        let mut bandwidth = 0;
        for col in 0..n {
            for row in 0..n {
                if self.entries[(row, col)] != 0.0 {
                    bandwidth = bandwidth.max(row.abs_diff(col));
                }
            }
        }
        bandwidth
    }

    /// The same matrix with constraints laid out in `order`.
    ///
    /// `ranges[k]` is the index range of constraint `k` in the current
    /// layout; `order[p]` is the current position of the constraint placed
    /// at new position `p`.
    #[must_use]
    pub fn permuted(&self, ranges: &[Range<usize>], order: &[usize]) -> Self {
        let scalar: Vec<usize> = order.iter().flat_map(|&old| ranges[old].clone()).collect();
        let n = scalar.len();
        Self {
            entries: DMatrix::from_fn(n, n, |i, j| self.entries[(scalar[i], scalar[j])]),
        }
    }

    /// Compressed sparse row copy of the non-zero entries.
    #[must_use]
    pub fn to_csr(&self) -> CsrMatrix<f64> {
        let n = self.size();
        let mut coo = CooMatrix::new(n, n);
        for col in 0..n {
            for row in 0..n {
                let value = self.entries[(row, col)];
                if value != 0.0 {
                    coo.push(row, col, value);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    /// Factor or otherwise prepare the matrix for `method`.
    ///
    /// A matrix with a non-finite entry is reported singular on every rung
    /// and never yields a solution.
    #[must_use]
    pub fn prepare(&self, method: SolveMethod, settings: &SolveSettings) -> PreparedSolve {
        if self.size() == 0 {
            return PreparedSolve {
                method,
                backend: Backend::Empty,
                singular: false,
            };
        }
        if !self.entries.iter().all(|v| v.is_finite()) {
            return PreparedSolve {
                method,
                backend: Backend::NonFinite,
                singular: true,
            };
        }

        match method {
            SolveMethod::Direct => {
                let lu = self.entries.clone().lu();
                let pivots = lu.u().diagonal();
                let largest = pivots.amax();
                let singular = !(largest > 0.0 && largest.is_finite())
                    || pivots
                        .iter()
                        .any(|p| !(p.abs() > settings.singular_threshold * largest));
                PreparedSolve {
                    method,
                    backend: Backend::Direct(lu),
                    singular,
                }
            }
            SolveMethod::ConjugateGradient => {
                let matrix = self.to_csr();
                PreparedSolve {
                    method,
                    backend: Backend::ConjugateGradient {
                        transpose: matrix.transpose(),
                        matrix,
                        max_iterations: settings.cg_max_iterations,
                        tolerance: settings.cg_tolerance,
                    },
                    singular: false,
                }
            }
            SolveMethod::Svd => {
                match SVD::try_new(self.entries.clone(), true, true, f64::EPSILON, 0) {
                    Some(svd) => {
                        let largest = svd.singular_values.max();
                        let cutoff = settings.singular_threshold * largest;
                        let singular = !(svd.singular_values.min() > cutoff);
                        PreparedSolve {
                            method,
                            backend: Backend::Svd { svd, cutoff },
                            singular,
                        }
                    }
                    None => PreparedSolve {
                        method,
                        backend: Backend::NonFinite,
                        singular: true,
                    },
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Backend {
    Empty,
    NonFinite,
    Direct(LU<f64, Dyn, Dyn>),
    ConjugateGradient {
        matrix: CsrMatrix<f64>,
        transpose: CsrMatrix<f64>,
        max_iterations: usize,
        tolerance: f64,
    },
    Svd {
        svd: SVD<f64, Dyn, Dyn>,
        cutoff: f64,
    },
}

/// A Jacobian prepared for repeated solves with one method.
#[derive(Debug, Clone)]
pub struct PreparedSolve {
    method: SolveMethod,
    backend: Backend,
    singular: bool,
}

impl PreparedSolve {
    /// Method this preparation belongs to.
    #[must_use]
    pub const fn method(&self) -> SolveMethod {
        self.method
    }

    /// Whether the back-end reported the matrix singular.
    ///
    /// For conjugate gradient this is only known after a solve.
    #[must_use]
    pub const fn is_singular(&self) -> bool {
        self.singular
    }

    /// Solve `J x = rhs`.
    ///
    /// Returns `None` when the back-end cannot produce a usable solution.
    pub fn solve(&mut self, rhs: &DVector<f64>) -> Option<DVector<f64>> {
        match &self.backend {
            Backend::Empty => Some(DVector::zeros(0)),
            Backend::NonFinite => None,
            Backend::Direct(lu) => {
                if self.singular {
                    None
                } else {
                    lu.solve(rhs)
                }
            }
            Backend::ConjugateGradient {
                matrix,
                transpose,
                max_iterations,
                tolerance,
            } => {
                let (x, breakdown, relative_residual) =
                    cg_normal_equations(matrix, transpose, rhs, *max_iterations, *tolerance);
                if breakdown {
                    self.singular = true;
                }
                (relative_residual <= tolerance.sqrt()).then_some(x)
            }
            Backend::Svd { svd, cutoff } => svd.solve(rhs, *cutoff).ok(),
        }
    }
}

/// Conjugate gradient on `AᵀA x = Aᵀb` (CGNR).
///
/// Returns the solution, whether the search broke down, and the relative
/// residual `||A x - b|| / ||b||` of the original system.
#[allow(clippy::many_single_char_names)]
fn cg_normal_equations(
    a: &CsrMatrix<f64>,
    a_t: &CsrMatrix<f64>,
    b: &DVector<f64>,
    max_iterations: usize,
    tolerance: f64,
) -> (DVector<f64>, bool, f64) {
    let mut x = DVector::zeros(a.ncols());
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return (x, false, 0.0);
    }

    let mut r = b.clone();
    let mut z: DVector<f64> = a_t * &r;
    let mut p = z.clone();
    let mut z_dot_z = z.dot(&z);
    let mut breakdown = false;

    for _ in 0..max_iterations {
        let w: DVector<f64> = a * &p;
        let w_dot_w = w.dot(&w);
        if w_dot_w < 1e-300 {
            breakdown = true;
            break;
        }

        let alpha = z_dot_z / w_dot_w;
        x += alpha * &p;
        r -= alpha * &w;

        if r.norm() <= tolerance * b_norm {
            break;
        }

        z = a_t * &r;
        let z_dot_z_new = z.dot(&z);
        if z_dot_z_new < 1e-300 {
            // Stationary point of the least-squares problem.
            break;
        }
        let beta = z_dot_z_new / z_dot_z;
        z_dot_z = z_dot_z_new;
        p = &z + beta * &p;
    }

    let relative_residual = r.norm() / b_norm;
    (x, breakdown, relative_residual)
}
