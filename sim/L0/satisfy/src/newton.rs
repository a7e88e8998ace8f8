//! Newton iteration on the restriction Jacobian.
//!
//! Each iteration solves the linearized system
//!
//! ```text
//! dC/dR * ΔR = -C
//! ```
//!
//! applies `ΔR` through the constraints, and measures the new error.
//!
//! # Escalation
//!
//! A step diverges when the solve yields no usable correction, or when the
//! new error is `NaN` or exceeds `divergence_factor` times the reference
//! error. A diverging step is undone exactly (through the problem's
//! snapshot) and the solve method moves one rung up the ladder
//! direct → conjugate gradient → SVD, never down within one call. If the
//! SVD rung diverges too, the call is abandoned and the last good estimate
//! is kept.
//!
//! # Demotion
//!
//! An escalated method is kept across calls. It is demoted back to the
//! preferred method only after the solve converges without singularity and
//! the run of consecutive improving iterations exceeds `demotion_streak`.
//!
//! # Structural Changes
//!
//! If applying a correction removes constraints, the problem is reindexed
//! (which rebuilds the Jacobian), the method is prepared again, and the
//! loop continues without a divergence check for that step.

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::set::error_norm;
use crate::{JacobianMatrix, Result, SatisfyConfig, SolveMethod, SolveSettings};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Effect of applying a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// The active set is unchanged.
    Applied,
    /// Constraints asked to leave the active set.
    Structural,
}

/// The system a [`NewtonIterator`] drives toward zero error.
pub trait NewtonProblem {
    /// Exact snapshot of everything a correction can change.
    type Snapshot;

    /// Current stacked error vector.
    fn error(&mut self) -> DVector<f64>;

    /// Apply a correction of length `jacobian().size()`.
    fn apply_correction(&mut self, delta: &DVector<f64>) -> Result<StepKind>;

    /// Capture the current state.
    fn snapshot(&self) -> Self::Snapshot;

    /// Revert to a captured state.
    fn restore(&mut self, snapshot: &Self::Snapshot);

    /// Redo index administration and rebuild the Jacobian.
    fn reindex(&mut self) -> Result<()>;

    /// The current Jacobian.
    fn jacobian(&self) -> &JacobianMatrix;

    /// Frame number reported in diagnostics.
    fn frame(&self) -> u64 {
        0
    }
}

/// Settings of the Newton loop.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NewtonSettings {
    /// Convergence tolerance on the error norm.
    pub tolerance: f64,
    /// Iteration cap per call.
    pub max_iterations: usize,
    /// Growth factor that counts as divergence.
    pub divergence_factor: f64,
    /// Improving iterations required before demotion.
    pub demotion_streak: usize,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self::from_config(&SatisfyConfig::default())
    }
}

impl NewtonSettings {
    /// Extract the Newton settings from a manager configuration.
    #[must_use]
    pub fn from_config(config: &SatisfyConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            divergence_factor: config.divergence_factor,
            demotion_streak: config.demotion_streak,
        }
    }
}

/// Result of one [`NewtonIterator::iterate`] call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NewtonOutcome {
    /// Solves performed.
    pub iterations: usize,
    /// Error norm on entry.
    pub initial_error: f64,
    /// Error norm on exit.
    pub final_error: f64,
    /// Whether the error reached the tolerance.
    pub converged: bool,
    /// Whether iteration stopped because the SVD rung diverged.
    pub abandoned: bool,
    /// Rungs climbed during this call.
    pub escalations: usize,
    /// Structural changes absorbed during this call.
    pub structural_changes: usize,
    /// Method in use on exit, after any demotion.
    pub method: SolveMethod,
}

/// Newton iterator with an escalating choice of solve method.
#[derive(Debug, Clone)]
pub struct NewtonIterator {
    settings: NewtonSettings,
    solve: SolveSettings,
    preferred: SolveMethod,
    method: SolveMethod,
    success_streak: usize,
    non_demotions: usize,
}

impl Default for NewtonIterator {
    fn default() -> Self {
        Self::new(NewtonSettings::default(), SolveSettings::default())
    }
}

impl NewtonIterator {
    /// Create an iterator starting on the direct method.
    #[must_use]
    pub fn new(settings: NewtonSettings, solve: SolveSettings) -> Self {
        Self {
            settings,
            solve,
            preferred: SolveMethod::Direct,
            method: SolveMethod::Direct,
            success_streak: 0,
            non_demotions: 0,
        }
    }

    /// Create an iterator from a manager configuration.
    #[must_use]
    pub fn from_config(config: &SatisfyConfig) -> Self {
        let mut iterator = Self::new(
            NewtonSettings::from_config(config),
            SolveSettings::from_config(config),
        );
        iterator.set_preferred_method(config.preferred_method);
        iterator
    }

    /// Select the baseline method. The current method is reset to it.
    pub fn set_preferred_method(&mut self, method: SolveMethod) {
        self.preferred = method;
        self.method = method;
        self.success_streak = 0;
    }

    /// Baseline method.
    #[must_use]
    pub const fn preferred_method(&self) -> SolveMethod {
        self.preferred
    }

    /// Method the next call starts from.
    #[must_use]
    pub const fn current_method(&self) -> SolveMethod {
        self.method
    }

    /// Consecutive improving, non-singular iterations.
    #[must_use]
    pub const fn success_streak(&self) -> usize {
        self.success_streak
    }

    /// Consecutive calls that ended escalated without demotion.
    #[must_use]
    pub const fn non_demotions(&self) -> usize {
        self.non_demotions
    }

    /// Drive `problem` toward zero error.
    pub fn iterate<P: NewtonProblem>(&mut self, problem: &mut P) -> Result<NewtonOutcome> {
        let frame = problem.frame();
        let mut prepared = problem.jacobian().prepare(self.method, &self.solve);
        let mut errors = problem.error();
        let mut error = error_norm(&errors);
        let initial_error = error;
        let mut reference = error;

        let mut iterations = 0;
        let mut escalations = 0;
        let mut structural_changes = 0;
        let mut abandoned = false;

        // `!(a <= b)` so that a NaN error keeps iterating toward escalation.
        while !(error <= self.settings.tolerance) && iterations < self.settings.max_iterations {
            iterations += 1;

            let rhs = -&errors;
            let correction = prepared
                .solve(&rhs)
                .filter(|delta| delta.iter().all(|v| v.is_finite()));

            let mut trial = None;
            if let Some(delta) = correction {
                let snapshot = problem.snapshot();
                match problem.apply_correction(&delta)? {
                    StepKind::Structural => {
                        structural_changes += 1;
                        problem.reindex()?;
                        prepared = problem.jacobian().prepare(self.method, &self.solve);
                        errors = problem.error();
                        error = error_norm(&errors);
                        reference = error;
                        self.success_streak = 0;
                        debug!(
                            frame,
                            total_dim = errors.len(),
                            error,
                            "structural change during iteration"
                        );
                        continue;
                    }
                    StepKind::Applied => {
                        let new_errors = problem.error();
                        let new_error = error_norm(&new_errors);
                        trial = Some((snapshot, new_errors, new_error));
                    }
                }
            }

            let diverged = match &trial {
                None => true,
                Some((_, _, new_error)) => {
                    new_error.is_nan() || *new_error > self.settings.divergence_factor * reference
                }
            };

            if !diverged {
                if let Some((_, new_errors, new_error)) = trial {
                    if new_error < error && !prepared.is_singular() {
                        self.success_streak += 1;
                    } else {
                        self.success_streak = 0;
                    }
                    errors = new_errors;
                    error = new_error;
                }
                continue;
            }

            self.success_streak = 0;
            if let Some((snapshot, _, _)) = trial {
                problem.restore(&snapshot);
                errors = problem.error();
                error = error_norm(&errors);
            }

            match self.method.escalate() {
                Some(next) => {
                    debug!(
                        frame,
                        from = %self.method,
                        to = %next,
                        error,
                        "escalating solve method"
                    );
                    self.method = next;
                    escalations += 1;
                    prepared = problem.jacobian().prepare(self.method, &self.solve);
                }
                None => {
                    warn!(
                        frame,
                        iterations,
                        error,
                        "svd solve diverged; keeping last estimate for this frame"
                    );
                    abandoned = true;
                    break;
                }
            }
        }

        let converged = error <= self.settings.tolerance;
        if self.method != self.preferred {
            if converged
                && !prepared.is_singular()
                && self.success_streak > self.settings.demotion_streak
            {
                debug!(
                    frame,
                    from = %self.method,
                    to = %self.preferred,
                    "demoting solve method"
                );
                self.method = self.preferred;
                self.success_streak = 0;
                self.non_demotions = 0;
            } else {
                self.non_demotions += 1;
            }
        }

        Ok(NewtonOutcome {
            iterations,
            initial_error,
            final_error: error,
            converged,
            abandoned,
            escalations,
            structural_changes,
            method: self.method,
        })
    }
}
