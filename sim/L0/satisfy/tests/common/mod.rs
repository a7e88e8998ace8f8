//! Shared fixtures: a linear body system and constraints that read it.
//!
//! The system's estimate is `base + coupling * forces`, so `coupling` is the
//! exact Jacobian of the constraints reading it and every Newton step is
//! exact when the Jacobian is.

#![allow(dead_code)]

use std::any::Any;
use std::cell::Cell;

use nalgebra::{DMatrix, DVector};
use sim_satisfy::{
    ApplyOutcome, BodySystem, CollisionScene, Constraint, ConstraintId, ConstraintManager,
    Derivative, Integrator, PostProcess, RestrictionCheck,
};

// =============================================================================
// Body system
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LinearBodies {
    pub base: DVector<f64>,
    pub coupling: DMatrix<f64>,
    pub forces: DVector<f64>,
    pub estimate: DVector<f64>,
    pub log: Vec<&'static str>,
}

impl LinearBodies {
    pub fn new(base: &[f64], coupling: DMatrix<f64>) -> Self {
        let n = base.len();
        assert_eq!(coupling.shape(), (n, n));
        let mut bodies = Self {
            base: DVector::from_column_slice(base),
            coupling,
            forces: DVector::zeros(n),
            estimate: DVector::zeros(n),
            log: Vec::new(),
        };
        bodies.euler_estimate(0.0);
        bodies.log.clear();
        bodies
    }

    pub fn identity(base: &[f64]) -> Self {
        Self::new(base, DMatrix::identity(base.len(), base.len()))
    }

    /// Move the start-of-step state and refresh the estimate.
    pub fn drift(&mut self, index: usize, amount: f64) {
        self.base[index] += amount;
        self.euler_estimate(0.0);
        self.log.clear();
    }

    pub fn count(&self, event: &str) -> usize {
        self.log.iter().filter(|&&e| e == event).count()
    }
}

impl BodySystem for LinearBodies {
    type Undo = (DVector<f64>, DVector<f64>);

    fn save_undo(&self) -> Self::Undo {
        (self.forces.clone(), self.estimate.clone())
    }

    fn restore_undo(&mut self, undo: &Self::Undo) {
        self.forces.copy_from(&undo.0);
        self.estimate.copy_from(&undo.1);
        self.log.push("restore");
    }

    fn euler_estimate(&mut self, _dt: f64) {
        self.estimate = &self.base + &self.coupling * &self.forces;
        self.log.push("estimate");
    }
}

// =============================================================================
// Constraints
// =============================================================================

/// Drives `estimate[offset..offset + dim]` to zero by applying forces there.
#[derive(Debug, Clone)]
pub struct Linear {
    pub offset: usize,
    pub dim: usize,
    pub shown: bool,
}

impl Linear {
    pub fn new(offset: usize, dim: usize) -> Self {
        Self {
            offset,
            dim,
            shown: false,
        }
    }

    pub fn boxed(offset: usize, dim: usize) -> Box<dyn Constraint<LinearBodies>> {
        Box::new(Self::new(offset, dim))
    }

    fn write_error(&self, system: &LinearBodies, out: &mut [f64]) {
        out.copy_from_slice(&system.estimate.as_slice()[self.offset..self.offset + self.dim]);
    }

    fn push(&self, system: &mut LinearBodies, delta: &[f64]) {
        for (k, d) in delta.iter().enumerate() {
            system.forces[self.offset + k] += d;
        }
        system.log.push("apply");
    }

    fn block_for(
        &self,
        system: &LinearBodies,
        consumer: &dyn Constraint<LinearBodies>,
    ) -> Derivative {
        let Some((offset, dim)) = footprint(consumer) else {
            return Derivative::Unsupported;
        };
        let block = system
            .coupling
            .view((offset, self.offset), (dim, self.dim))
            .into_owned();
        if block.iter().all(|&v| v == 0.0) {
            Derivative::Zero
        } else {
            Derivative::Block(block)
        }
    }
}

/// Offset and dimension of any fixture constraint.
fn footprint(constraint: &dyn Constraint<LinearBodies>) -> Option<(usize, usize)> {
    let any = constraint.as_any();
    if let Some(c) = any.downcast_ref::<Linear>() {
        return Some((c.offset, c.dim));
    }
    if let Some(c) = any.downcast_ref::<Opaque>() {
        return Some((c.0.offset, c.0.dim));
    }
    if let Some(c) = any.downcast_ref::<Contact>() {
        return Some((c.inner.offset, c.inner.dim));
    }
    if let Some(c) = any.downcast_ref::<Rejecting>() {
        return Some((c.inner.offset, c.inner.dim));
    }
    any.downcast_ref::<Detaching>()
        .map(|c| (c.inner.offset, c.inner.dim))
}

impl Constraint<LinearBodies> for Linear {
    fn name(&self) -> &str {
        "linear"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn error(&self, system: &LinearBodies, out: &mut [f64]) {
        self.write_error(system, out);
    }

    fn apply_restriction_change(
        &mut self,
        system: &mut LinearBodies,
        delta: &[f64],
    ) -> ApplyOutcome {
        self.push(system, delta);
        ApplyOutcome::Applied
    }

    fn derivative_block(
        &self,
        system: &LinearBodies,
        consumer: &dyn Constraint<LinearBodies>,
    ) -> Derivative {
        self.block_for(system, consumer)
    }

    fn show_forces(&mut self) {
        self.shown = true;
    }

    fn hide_forces(&mut self) {
        self.shown = false;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A [`Linear`] constraint without a closed-form derivative.
#[derive(Debug, Clone)]
pub struct Opaque(pub Linear);

impl Opaque {
    pub fn boxed(offset: usize, dim: usize) -> Box<dyn Constraint<LinearBodies>> {
        Box::new(Self(Linear::new(offset, dim)))
    }
}

impl Constraint<LinearBodies> for Opaque {
    fn dim(&self) -> usize {
        self.0.dim
    }

    fn error(&self, system: &LinearBodies, out: &mut [f64]) {
        self.0.write_error(system, out);
    }

    fn apply_restriction_change(
        &mut self,
        system: &mut LinearBodies,
        delta: &[f64],
    ) -> ApplyOutcome {
        self.0.push(system, delta);
        ApplyOutcome::Applied
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Collision-created constraint that asks to be removed after the frame.
#[derive(Debug, Clone)]
pub struct Contact {
    pub inner: Linear,
    pub post_processed: bool,
}

impl Contact {
    pub fn boxed(offset: usize) -> Box<dyn Constraint<LinearBodies>> {
        Box::new(Self {
            inner: Linear::new(offset, 1),
            post_processed: false,
        })
    }
}

impl Constraint<LinearBodies> for Contact {
    fn name(&self) -> &str {
        "contact"
    }

    fn dim(&self) -> usize {
        self.inner.dim
    }

    fn error(&self, system: &LinearBodies, out: &mut [f64]) {
        self.inner.write_error(system, out);
    }

    fn apply_restriction_change(
        &mut self,
        system: &mut LinearBodies,
        delta: &[f64],
    ) -> ApplyOutcome {
        self.inner.push(system, delta);
        ApplyOutcome::Applied
    }

    fn derivative_block(
        &self,
        system: &LinearBodies,
        consumer: &dyn Constraint<LinearBodies>,
    ) -> Derivative {
        self.inner.block_for(system, consumer)
    }

    fn post_process(&mut self, _system: &LinearBodies) -> PostProcess {
        self.post_processed = true;
        PostProcess::Remove
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Applies its first correction, then asks to leave the active set.
#[derive(Debug, Clone)]
pub struct Detaching {
    pub inner: Linear,
}

impl Detaching {
    pub fn boxed(offset: usize) -> Box<dyn Constraint<LinearBodies>> {
        Box::new(Self {
            inner: Linear::new(offset, 1),
        })
    }
}

impl Constraint<LinearBodies> for Detaching {
    fn dim(&self) -> usize {
        self.inner.dim
    }

    fn error(&self, system: &LinearBodies, out: &mut [f64]) {
        self.inner.write_error(system, out);
    }

    fn apply_restriction_change(
        &mut self,
        system: &mut LinearBodies,
        delta: &[f64],
    ) -> ApplyOutcome {
        self.inner.push(system, delta);
        ApplyOutcome::Detach
    }

    fn derivative_block(
        &self,
        system: &LinearBodies,
        consumer: &dyn Constraint<LinearBodies>,
    ) -> Derivative {
        self.inner.block_for(system, consumer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Refuses every restriction change, asking to leave the active set instead.
#[derive(Debug, Clone)]
pub struct Rejecting {
    pub inner: Linear,
}

impl Rejecting {
    pub fn boxed(offset: usize) -> Box<dyn Constraint<LinearBodies>> {
        Box::new(Self {
            inner: Linear::new(offset, 1),
        })
    }
}

impl Constraint<LinearBodies> for Rejecting {
    fn dim(&self) -> usize {
        self.inner.dim
    }

    fn error(&self, system: &LinearBodies, out: &mut [f64]) {
        self.inner.write_error(system, out);
    }

    fn test_restriction_change(&self, _system: &LinearBodies, _delta: &[f64]) -> RestrictionCheck {
        RestrictionCheck::Detach
    }

    fn apply_restriction_change(
        &mut self,
        system: &mut LinearBodies,
        delta: &[f64],
    ) -> ApplyOutcome {
        self.inner.push(system, delta);
        ApplyOutcome::Applied
    }

    fn derivative_block(
        &self,
        system: &LinearBodies,
        consumer: &dyn Constraint<LinearBodies>,
    ) -> Derivative {
        self.inner.block_for(system, consumer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opaque 1-dimensional constraint whose error is `NaN` once any force
/// acts on its body.
#[derive(Debug, Clone)]
pub struct Brittle {
    pub inner: Linear,
}

impl Brittle {
    pub fn boxed(offset: usize) -> Box<dyn Constraint<LinearBodies>> {
        Box::new(Self {
            inner: Linear::new(offset, 1),
        })
    }
}

impl Constraint<LinearBodies> for Brittle {
    fn dim(&self) -> usize {
        self.inner.dim
    }

    fn error(&self, system: &LinearBodies, out: &mut [f64]) {
        if system.forces[self.inner.offset] == 0.0 {
            self.inner.write_error(system, out);
        } else {
            out.fill(f64::NAN);
        }
    }

    fn apply_restriction_change(
        &mut self,
        system: &mut LinearBodies,
        delta: &[f64],
    ) -> ApplyOutcome {
        self.inner.push(system, delta);
        ApplyOutcome::Applied
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// =============================================================================
// Integrators and scenes
// =============================================================================

/// Produces a `NaN` estimate on its first call only.
#[derive(Debug, Default)]
pub struct PoisonOnce {
    fired: Cell<bool>,
}

impl Integrator<LinearBodies> for PoisonOnce {
    fn name(&self) -> &'static str {
        "poison-once"
    }

    fn estimate(&self, system: &mut LinearBodies, dt: f64) {
        system.euler_estimate(dt);
        if !self.fired.replace(true) {
            system.estimate.fill(f64::NAN);
        }
    }
}

/// Registers one queued contact per detection pass.
#[derive(Debug, Default)]
pub struct QueuedContacts {
    pub queue: Vec<usize>,
    pub registered: Vec<ConstraintId>,
    pub passes: usize,
}

impl QueuedContacts {
    pub fn new(offsets: &[usize]) -> Self {
        Self {
            queue: offsets.iter().rev().copied().collect(),
            ..Default::default()
        }
    }
}

impl CollisionScene<LinearBodies> for QueuedContacts {
    fn detect_and_register(
        &mut self,
        _system: &LinearBodies,
        manager: &mut ConstraintManager<LinearBodies>,
    ) -> usize {
        self.passes += 1;
        let Some(offset) = self.queue.pop() else {
            return 0;
        };
        match manager.add(Contact::boxed(offset)) {
            Ok(id) => {
                self.registered.push(id);
                1
            }
            Err(_) => 0,
        }
    }
}

/// Dense coupling from a row-major slice.
pub fn coupling(n: usize, rows: &[f64]) -> DMatrix<f64> {
    DMatrix::from_row_slice(n, n, rows)
}
