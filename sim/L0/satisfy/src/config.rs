//! Configuration for per-frame constraint satisfaction.

use crate::{Result, SatisfyError, SolveMethod};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How the Jacobian `dC/dR` is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DifferentiationMode {
    /// Closed-form blocks supplied by the constraints. Falls back to
    /// probing if any constraint reports [`crate::Derivative::Unsupported`].
    #[default]
    Analytical,
    /// Finite-difference probing through the explicit-Euler stand-in.
    Empirical,
}

/// Configuration for the [`crate::ConstraintManager`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SatisfyConfig {
    /// Frame timestep handed to the integrators (seconds).
    pub timestep: f64,

    /// Convergence tolerance on the Euclidean norm of the error vector.
    pub tolerance: f64,

    /// Maximum Newton iterations per solve pass.
    pub max_iterations: usize,

    /// An error growing past this multiple of the reference error counts as
    /// divergence.
    pub divergence_factor: f64,

    /// Maximum detect-then-resolve passes per frame.
    pub max_collision_passes: usize,

    /// Recompute an unchanged Jacobian every `jacobian_skip` frames.
    pub jacobian_skip: u64,

    /// Jacobian assembly path.
    pub differentiation: DifferentiationMode,

    /// Attempt bandwidth-reducing reordering after each full rebuild.
    pub reorder: bool,

    /// Baseline solve method.
    pub preferred_method: SolveMethod,

    /// Consecutive improving iterations required before demoting an
    /// escalated solve method back to the preferred one.
    pub demotion_streak: usize,

    /// Magnitude of the unit impulse used when probing.
    pub probe_impulse: f64,

    /// Relative pivot or singular-value threshold below which a
    /// factorization counts as singular.
    pub singular_threshold: f64,

    /// Iteration cap of the conjugate-gradient back-end.
    pub cg_max_iterations: usize,

    /// Relative residual tolerance of the conjugate-gradient back-end.
    pub cg_tolerance: f64,
}

impl Default for SatisfyConfig {
    fn default() -> Self {
        Self {
            timestep: 1.0 / 240.0,
            tolerance: 1e-6,
            max_iterations: 20,
            divergence_factor: 4.0,
            max_collision_passes: 4,
            jacobian_skip: 1,
            differentiation: DifferentiationMode::Analytical,
            reorder: true,
            preferred_method: SolveMethod::Direct,
            demotion_streak: 10,
            probe_impulse: 1.0,
            singular_threshold: 1e-12,
            cg_max_iterations: 200,
            cg_tolerance: 1e-10,
        }
    }
}

impl SatisfyConfig {
    /// Fast configuration for real-time applications.
    ///
    /// Reuses the Jacobian for four frames and caps iterations low.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            timestep: 1.0 / 60.0,
            tolerance: 1e-4,
            max_iterations: 8,
            max_collision_passes: 2,
            jacobian_skip: 4,
            ..Default::default()
        }
    }

    /// High-accuracy configuration for offline simulation.
    #[must_use]
    pub fn high_accuracy() -> Self {
        Self {
            timestep: 1.0 / 1000.0,
            tolerance: 1e-10,
            max_iterations: 50,
            max_collision_passes: 8,
            cg_max_iterations: 1000,
            cg_tolerance: 1e-14,
            ..Default::default()
        }
    }

    /// Set the timestep.
    #[must_use]
    pub const fn with_timestep(mut self, timestep: f64) -> Self {
        self.timestep = timestep;
        self
    }

    /// Set the convergence tolerance.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the Newton iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the collision pass cap.
    #[must_use]
    pub const fn with_max_collision_passes(mut self, passes: usize) -> Self {
        self.max_collision_passes = passes;
        self
    }

    /// Set the Jacobian skip count.
    #[must_use]
    pub const fn with_jacobian_skip(mut self, skip: u64) -> Self {
        self.jacobian_skip = skip;
        self
    }

    /// Set the differentiation mode.
    #[must_use]
    pub const fn with_differentiation(mut self, mode: DifferentiationMode) -> Self {
        self.differentiation = mode;
        self
    }

    /// Enable or disable reordering.
    #[must_use]
    pub const fn with_reorder(mut self, enabled: bool) -> Self {
        self.reorder = enabled;
        self
    }

    /// Set the preferred solve method.
    #[must_use]
    pub const fn with_preferred_method(mut self, method: SolveMethod) -> Self {
        self.preferred_method = method;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.timestep.is_finite() || self.timestep <= 0.0 {
            return Err(SatisfyError::invalid_config(format!(
                "timestep must be positive and finite, got {}",
                self.timestep
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(SatisfyError::invalid_config(
                "tolerance must be positive and finite",
            ));
        }
        if !self.divergence_factor.is_finite() || self.divergence_factor <= 1.0 {
            return Err(SatisfyError::invalid_config(
                "divergence_factor must be finite and greater than 1",
            ));
        }
        if !self.probe_impulse.is_finite() || self.probe_impulse == 0.0 {
            return Err(SatisfyError::invalid_config(
                "probe_impulse must be finite and non-zero",
            ));
        }
        if !self.singular_threshold.is_finite() || self.singular_threshold < 0.0 {
            return Err(SatisfyError::invalid_config(
                "singular_threshold must be finite and non-negative",
            ));
        }
        if !self.cg_tolerance.is_finite() || self.cg_tolerance <= 0.0 {
            return Err(SatisfyError::invalid_config(
                "cg_tolerance must be positive and finite",
            ));
        }
        if self.max_iterations == 0 {
            return Err(SatisfyError::invalid_config("max_iterations must be at least 1"));
        }
        if self.max_collision_passes == 0 {
            return Err(SatisfyError::invalid_config(
                "max_collision_passes must be at least 1",
            ));
        }
        if self.jacobian_skip == 0 {
            return Err(SatisfyError::invalid_config("jacobian_skip must be at least 1"));
        }
        if self.cg_max_iterations == 0 {
            return Err(SatisfyError::invalid_config(
                "cg_max_iterations must be at least 1",
            ));
        }
        Ok(())
    }
}
