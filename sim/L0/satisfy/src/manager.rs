//! Per-frame orchestration of constraint satisfaction.
//!
//! One [`ConstraintManager`] exists per simulation run and owns every piece
//! of mutable satisfaction state: the constraint arena, index ranges, the
//! Jacobian, and the solve-method selection. Collaborators (the body system,
//! the integrator, the collision scene) are passed in explicitly.
//!
//! # Frame Structure
//!
//! [`ConstraintManager::satisfy`] runs:
//!
//! 1. Index administration if the set changed.
//! 2. The first estimate with the live integrator, measuring the error before
//!    (`first_error`) and after (`error`).
//! 3. The divergence guard: a `NaN` error, or one above
//!    `divergence_factor * first_error`, rolls the bodies back.
//! 4. The collision loop: detect, administer, and when the error exceeds
//!    tolerance refresh the Jacobian and run Newton. It stops after a pass
//!    that registered nothing, or at the pass cap.
//! 5. Post-processing of every constraint the collision loop created.
//!
//! `add` and `del` only mark the set changed; index ranges and the Jacobian
//! are recomputed lazily at the next administration pass.

use std::ops::Range;

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::differentiation::{JacobianCache, JacobianRefresh};
use crate::newton::{NewtonIterator, NewtonOutcome, NewtonProblem, StepKind};
use crate::set::{error_norm, ConstraintSet};
use crate::{
    ApplyOutcome, BodySystem, CollisionScene, Constraint, ConstraintId, ExplicitEuler,
    Integrator, JacobianMatrix, PostProcess, RestrictionCheck, Result, SatisfyConfig,
    SatisfyError, SolveMethod,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Summary of one [`ConstraintManager::satisfy`] call.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SatisfyReport {
    /// Frame number, starting at 1.
    pub frame: u64,
    /// Error norm before the first estimate.
    pub first_error: f64,
    /// Error norm when the frame finished.
    pub error: f64,
    /// Whether the first estimate was rolled back.
    pub rolled_back: bool,
    /// Detection passes run.
    pub collision_passes: usize,
    /// Constraints registered by the scene over all passes.
    pub collisions_registered: usize,
    /// Constraints that were post-processed.
    pub post_processed: usize,
    /// Constraints removed by post-processing.
    pub removed: usize,
    /// Last Jacobian refresh decision.
    pub jacobian: JacobianRefresh,
    /// One entry per Newton run.
    pub newton: Vec<NewtonOutcome>,
    /// Whether the final error is within tolerance.
    pub converged: bool,
}

impl SatisfyReport {
    /// Total Newton iterations over the frame.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.newton.iter().map(|n| n.iterations).sum()
    }

    /// Whether any Newton run abandoned the frame.
    #[must_use]
    pub fn abandoned(&self) -> bool {
        self.newton.iter().any(|n| n.abandoned)
    }
}

/// Owner of the active constraint set and driver of per-frame satisfaction.
pub struct ConstraintManager<S: BodySystem> {
    config: SatisfyConfig,
    set: ConstraintSet<S>,
    jacobian: JacobianCache,
    newton: NewtonIterator,
    integrator: Box<dyn Integrator<S>>,
    frame: u64,
    collecting: bool,
    registered: usize,
    collision_ids: Vec<ConstraintId>,
}

impl<S: BodySystem> std::fmt::Debug for ConstraintManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintManager")
            .field("frame", &self.frame)
            .field("constraints", &self.len())
            .field("total_dim", &self.set.total_dim())
            .field("integrator", &self.integrator.name())
            .field("method", &self.newton.current_method())
            .finish_non_exhaustive()
    }
}

impl<S: BodySystem> Default for ConstraintManager<S> {
    fn default() -> Self {
        Self::build(SatisfyConfig::default())
    }
}

impl<S: BodySystem> ConstraintManager<S> {
    /// Create a manager with a validated configuration and the
    /// [`ExplicitEuler`] integrator.
    pub fn new(config: SatisfyConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SatisfyConfig) -> Self {
        Self {
            newton: NewtonIterator::from_config(&config),
            config,
            set: ConstraintSet::default(),
            jacobian: JacobianCache::default(),
            integrator: Box::new(ExplicitEuler),
            frame: 0,
            collecting: false,
            registered: 0,
            collision_ids: Vec::new(),
        }
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &SatisfyConfig {
        &self.config
    }

    /// Replace the live integrator. Probing keeps using [`ExplicitEuler`].
    pub fn set_integrator(&mut self, integrator: Box<dyn Integrator<S>>) {
        self.integrator = integrator;
    }

    /// Name of the live integrator.
    #[must_use]
    pub fn integrator_name(&self) -> &'static str {
        self.integrator.name()
    }

    /// Select the baseline solve method.
    pub fn set_preferred_method(&mut self, method: SolveMethod) {
        self.config.preferred_method = method;
        self.newton.set_preferred_method(method);
    }

    /// Baseline solve method.
    #[must_use]
    pub const fn preferred_method(&self) -> SolveMethod {
        self.newton.preferred_method()
    }

    /// Method the next Newton run starts from.
    #[must_use]
    pub const fn current_method(&self) -> SolveMethod {
        self.newton.current_method()
    }

    /// Frames satisfied so far.
    #[must_use]
    pub const fn frame(&self) -> u64 {
        self.frame
    }

    /// Add a constraint. Takes effect at the next administration pass.
    ///
    /// Constraints added while a collision pass is running are treated as
    /// collision constraints and post-processed at the end of the frame.
    pub fn add(&mut self, constraint: Box<dyn Constraint<S>>) -> Result<ConstraintId> {
        let id = self.set.add(constraint, self.collecting)?;
        if self.collecting {
            self.registered += 1;
            self.collision_ids.push(id);
        }
        debug!(%id, collision = self.collecting, "constraint added");
        Ok(id)
    }

    /// Remove a constraint. Takes effect at the next administration pass.
    pub fn del(&mut self, id: ConstraintId) -> Result<()> {
        self.set.remove(id)?;
        debug!(%id, "constraint removed");
        Ok(())
    }

    /// Whether `id` refers to an active constraint.
    #[must_use]
    pub fn contains(&self, id: ConstraintId) -> bool {
        self.set.contains(id)
    }

    /// Number of active constraints.
    #[must_use]
    pub fn len(&self) -> usize {
        (0..self.set.len())
            .filter(|&p| !self.set.is_pending_at(p))
            .count()
    }

    /// Whether there are no active constraints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constraint by handle.
    pub fn get(&self, id: ConstraintId) -> Result<&dyn Constraint<S>> {
        self.set.get(id)
    }

    /// Mutable constraint by handle.
    pub fn get_mut(&mut self, id: ConstraintId) -> Result<&mut dyn Constraint<S>> {
        self.set.get_mut(id)
    }

    /// Constraint by handle, downcast to its concrete kind.
    #[must_use]
    pub fn get_as<T: 'static>(&self, id: ConstraintId) -> Option<&T> {
        self.set.get(id).ok()?.as_any().downcast_ref()
    }

    /// Mutable constraint by handle, downcast to its concrete kind.
    pub fn get_as_mut<T: 'static>(&mut self, id: ConstraintId) -> Option<&mut T> {
        self.set.get_mut(id).ok()?.as_any_mut().downcast_mut()
    }

    /// Whether the constraint was registered by the collision loop.
    #[must_use]
    pub fn is_collision(&self, id: ConstraintId) -> bool {
        self.set.is_from_collision(id)
    }

    /// Switch force visualization for all current and future constraints.
    pub fn set_force_display(&mut self, show: bool) {
        self.set.set_display_forces(show);
    }

    /// Global force visualization state.
    #[must_use]
    pub const fn force_display(&self) -> bool {
        self.set.display_forces()
    }

    /// Run index administration now if the set changed.
    ///
    /// Returns the handles of constraints that were dropped.
    pub fn administer_indices(&mut self) -> Vec<ConstraintId> {
        administer(&mut self.set, &mut self.jacobian, &mut self.collision_ids)
    }

    /// Total scalar dimension as of the last administration pass.
    #[must_use]
    pub const fn total_dim(&self) -> usize {
        self.set.total_dim()
    }

    /// Handles and index ranges in global index order, as of the last
    /// administration pass.
    #[must_use]
    pub fn layout(&self) -> Vec<(ConstraintId, Range<usize>)> {
        self.set
            .ids()
            .into_iter()
            .zip(self.set.ranges().iter().cloned())
            .collect()
    }

    /// Index range of one constraint.
    #[must_use]
    pub fn range_of(&self, id: ConstraintId) -> Option<Range<usize>> {
        let position = self.set.position(id)?;
        self.set.ranges().get(position).cloned()
    }

    /// Dependency edges of the current Jacobian as `(consumer, producer)`.
    #[must_use]
    pub fn pairs(&self) -> Vec<(ConstraintId, ConstraintId)> {
        self.jacobian
            .pairs
            .iter()
            .map(|pair| (self.set.id_at(pair.consumer), self.set.id_at(pair.producer)))
            .collect()
    }

    /// The current Jacobian.
    #[must_use]
    pub const fn jacobian(&self) -> &JacobianMatrix {
        &self.jacobian.matrix
    }

    /// Stacked error vector, administering indices first.
    pub fn error_vector(&mut self, system: &S) -> DVector<f64> {
        self.administer_indices();
        self.set.errors(system)
    }

    /// Satisfy the constraints for one frame.
    pub fn satisfy(
        &mut self,
        system: &mut S,
        scene: &mut dyn CollisionScene<S>,
    ) -> Result<SatisfyReport> {
        self.frame += 1;
        let frame = self.frame;
        let tolerance = self.config.tolerance;
        self.collision_ids.clear();
        self.administer_indices();

        let undo = system.save_undo();
        let first_error = error_norm(&self.set.errors(system));
        self.integrator.estimate(system, self.config.timestep);
        let mut error = error_norm(&self.set.errors(system));

        let mut report = SatisfyReport {
            frame,
            first_error,
            ..Default::default()
        };

        if error.is_nan() || error > self.config.divergence_factor * first_error {
            warn!(frame, error, first_error, "first estimate diverged; rolling back");
            system.restore_undo(&undo);
            error = error_norm(&self.set.errors(system));
            report.rolled_back = true;
        }

        while report.collision_passes < self.config.max_collision_passes {
            report.collision_passes += 1;

            self.collecting = true;
            self.registered = 0;
            let reported = scene.detect_and_register(system, self);
            self.collecting = false;
            let registered = self.registered;
            report.collisions_registered += registered;
            if reported != registered {
                debug!(frame, reported, registered, "scene count differs from registrations");
            }

            if self.set.is_changed() {
                self.administer_indices();
                error = error_norm(&self.set.errors(system));
            }

            if !(error <= tolerance) {
                report.jacobian = self
                    .jacobian
                    .refresh(&mut self.set, system, &self.config, frame)?;
                let outcome = self.run_newton(system)?;
                error = outcome.final_error;
                report.newton.push(outcome);
            }

            debug!(
                frame,
                pass = report.collision_passes,
                registered,
                error,
                "collision pass finished"
            );
            if registered == 0 {
                break;
            }
        }

        for id in std::mem::take(&mut self.collision_ids) {
            if !self.set.contains(id) {
                continue;
            }
            report.post_processed += 1;
            if self.set.get_mut(id)?.post_process(system) == PostProcess::Remove {
                self.set.remove(id)?;
                report.removed += 1;
            }
        }

        report.error = error;
        report.converged = error <= tolerance;
        Ok(report)
    }

    fn run_newton(&mut self, system: &mut S) -> Result<NewtonOutcome> {
        let mut problem = FrameProblem {
            set: &mut self.set,
            jacobian: &mut self.jacobian,
            collision_ids: &mut self.collision_ids,
            system,
            integrator: self.integrator.as_ref(),
            config: &self.config,
            frame: self.frame,
        };
        self.newton.iterate(&mut problem)
    }
}

fn administer<S>(
    set: &mut ConstraintSet<S>,
    jacobian: &mut JacobianCache,
    collision_ids: &mut Vec<ConstraintId>,
) -> Vec<ConstraintId> {
    if !set.is_changed() {
        return Vec::new();
    }
    let dropped = set.administer();
    jacobian.invalidate(set.total_dim());
    collision_ids.retain(|id| !dropped.contains(id));
    debug!(
        constraints = set.len(),
        total_dim = set.total_dim(),
        dropped = dropped.len(),
        "index administration"
    );
    dropped
}

/// The manager's state seen as a Newton problem for one frame.
struct FrameProblem<'a, S: BodySystem> {
    set: &'a mut ConstraintSet<S>,
    jacobian: &'a mut JacobianCache,
    collision_ids: &'a mut Vec<ConstraintId>,
    system: &'a mut S,
    integrator: &'a dyn Integrator<S>,
    config: &'a SatisfyConfig,
    frame: u64,
}

impl<S: BodySystem> NewtonProblem for FrameProblem<'_, S> {
    type Snapshot = S::Undo;

    fn error(&mut self) -> DVector<f64> {
        self.set.errors(self.system)
    }

    fn apply_correction(&mut self, delta: &DVector<f64>) -> Result<StepKind> {
        if delta.len() != self.set.total_dim() {
            return Err(SatisfyError::DimensionMismatch {
                expected: self.set.total_dim(),
                actual: delta.len(),
            });
        }

        let mut kind = StepKind::Applied;
        for position in 0..self.set.len() {
            let range = self.set.ranges()[position].clone();
            let slice = &delta.as_slice()[range];

            let check = self
                .set
                .at(position)
                .test_restriction_change(self.system, slice);
            if check == RestrictionCheck::Detach {
                self.set.remove_at(position);
                kind = StepKind::Structural;
                continue;
            }

            let outcome = self
                .set
                .at_mut(position)
                .apply_restriction_change(self.system, slice);
            if outcome == ApplyOutcome::Detach {
                self.set.remove_at(position);
                kind = StepKind::Structural;
            }
        }

        self.integrator.estimate(self.system, self.config.timestep);
        Ok(kind)
    }

    fn snapshot(&self) -> S::Undo {
        self.system.save_undo()
    }

    fn restore(&mut self, snapshot: &S::Undo) {
        self.system.restore_undo(snapshot);
    }

    fn reindex(&mut self) -> Result<()> {
        administer(self.set, self.jacobian, self.collision_ids);
        self.jacobian
            .rebuild(self.set, self.system, self.config, self.frame)?;
        Ok(())
    }

    fn jacobian(&self) -> &JacobianMatrix {
        &self.jacobian.matrix
    }

    fn frame(&self) -> u64 {
        self.frame
    }
}
