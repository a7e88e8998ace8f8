//! Constraint capability interface and the collaborators it is driven through.
//!
//! A constraint is one vector-valued equation `C(R) = 0` in the restrictions
//! `R` (the reaction-force-like corrections each constraint applies). The
//! manager never looks at bodies directly: positions and velocities live in
//! a [`BodySystem`], are advanced by an [`Integrator`], and are observed by
//! constraints through [`Constraint::error`].

use std::any::Any;

use nalgebra::DMatrix;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Stable handle to a constraint owned by a [`crate::ConstraintManager`].
///
/// Handles are arena slots tagged with a generation. Once a constraint is
/// removed its handle goes stale and is rejected by every manager operation,
/// even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConstraintId {
    slot: u32,
    generation: u32,
}

impl ConstraintId {
    pub(crate) const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Arena slot of this handle.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Generation of the slot when the handle was issued.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Constraint({}v{})", self.slot, self.generation)
    }
}

/// Verdict of [`Constraint::test_restriction_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionCheck {
    /// The change may be applied.
    Accept,
    /// The constraint wants to leave the active set instead.
    Detach,
}

/// Result of [`Constraint::apply_restriction_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was applied; topology is unchanged.
    Applied,
    /// The change was applied and the constraint asks to be removed.
    Detach,
}

/// Result of [`Constraint::post_process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
    /// Keep the constraint active.
    Keep,
    /// Remove the constraint from the active set.
    Remove,
}

/// Partial derivative of a consumer's error with respect to a producer's
/// restriction.
#[derive(Debug, Clone, PartialEq)]
pub enum Derivative {
    /// No closed form is available; the Jacobian must be probed.
    Unsupported,
    /// The producer has no effect on the consumer.
    Zero,
    /// Dense `consumer.dim() x producer.dim()` block.
    Block(DMatrix<f64>),
}

impl Derivative {
    /// Whether a closed-form answer was given.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

/// The body and geometry state that constraints are measured against.
///
/// Every effect of [`Constraint::apply_restriction_change`] must be routed
/// into the system so that [`BodySystem::restore_undo`] reverts it exactly.
pub trait BodySystem {
    /// Snapshot sufficient to revert forces and estimates.
    type Undo;

    /// Capture the current state.
    fn save_undo(&self) -> Self::Undo;

    /// Revert to a previously captured state.
    fn restore_undo(&mut self, undo: &Self::Undo);

    /// Recompute the end-of-step estimate with one explicit-Euler step of
    /// length `dt` from the start-of-step state and the applied forces.
    fn euler_estimate(&mut self, dt: f64);
}

/// Time-stepping strategy that produces the end-of-step estimate.
///
/// `estimate` must be idempotent for a fixed set of applied forces: calling
/// it twice in a row yields the same state as calling it once.
pub trait Integrator<S> {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Recompute the end-of-step estimate of `system`.
    fn estimate(&self, system: &mut S, dt: f64);
}

/// Explicit Euler integration.
///
/// This is the default live integrator and always the integrator used while
/// probing an empirical Jacobian.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitEuler;

impl<S: BodySystem> Integrator<S> for ExplicitEuler {
    fn name(&self) -> &'static str {
        "explicit-euler"
    }

    fn estimate(&self, system: &mut S, dt: f64) {
        system.euler_estimate(dt);
    }
}

/// One vector-valued equation driven to zero by the manager.
///
/// Only [`Constraint::dim`], [`Constraint::error`],
/// [`Constraint::apply_restriction_change`] and the `Any` accessors are
/// required. A constraint that does not override
/// [`Constraint::derivative_block`] forces the empirical Jacobian path.
///
/// # State
///
/// A constraint must not hold restriction or accumulated force state of its
/// own. The manager applies changes it later reverts with
/// [`BodySystem::restore_undo`]: once per column while differentiating
/// empirically, and again when a Newton step diverges. Only state held by
/// the system is reverted, so anything a constraint keeps in `self` across
/// [`Constraint::apply_restriction_change`] calls goes out of sync. Display
/// flags and handles to collision bookkeeping are fine.
pub trait Constraint<S> {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        "constraint"
    }

    /// Number of scalar equations.
    fn dim(&self) -> usize;

    /// Write the current error into `out` (length `dim`).
    fn error(&self, system: &S, out: &mut [f64]);

    /// Validate a proposed restriction change without side effects.
    fn test_restriction_change(&self, _system: &S, _delta: &[f64]) -> RestrictionCheck {
        RestrictionCheck::Accept
    }

    /// Apply a restriction change (length `dim`) to the system.
    ///
    /// Every effect must land in `system`; see the trait's state rules.
    fn apply_restriction_change(&mut self, system: &mut S, delta: &[f64]) -> ApplyOutcome;

    /// Block of `consumer`'s error with respect to this constraint's
    /// restriction, shaped `consumer.dim() x self.dim()`.
    fn derivative_block(&self, _system: &S, _consumer: &dyn Constraint<S>) -> Derivative {
        Derivative::Unsupported
    }

    /// Attach force visualization.
    fn show_forces(&mut self) {}

    /// Detach force visualization.
    fn hide_forces(&mut self) {}

    /// Called once after the collision loop for constraints it created.
    fn post_process(&mut self, _system: &S) -> PostProcess {
        PostProcess::Keep
    }

    /// Upcast for inspecting constraints of a known kind.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for inspecting constraints of a known kind.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Collision detection as seen by the satisfaction loop.
///
/// Each call is one detection pass. New contacts are registered with
/// [`crate::ConstraintManager::add`]; the manager counts them itself.
pub trait CollisionScene<S: BodySystem> {
    /// Run one detection pass, returning the number of constraints added.
    fn detect_and_register(
        &mut self,
        system: &S,
        manager: &mut crate::ConstraintManager<S>,
    ) -> usize;
}

/// Scene that never produces contacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCollisions;

impl<S: BodySystem> CollisionScene<S> for NoCollisions {
    fn detect_and_register(
        &mut self,
        _system: &S,
        _manager: &mut crate::ConstraintManager<S>,
    ) -> usize {
        0
    }
}
