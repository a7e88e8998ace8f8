//! Newton-based satisfaction of articulated-body constraints.
//!
//! Every constraint is a vector-valued equation `C(R) = 0` in its
//! *restrictions* `R`, the reaction-force-like corrections it applies to the
//! bodies it connects. Once per frame the [`ConstraintManager`] drives the
//! stacked error of all active constraints toward zero:
//!
//! ```text
//! ┌──────────────┐   estimate   ┌──────────────┐   C(R)   ┌──────────────┐
//! │  Integrator  │ ───────────► │  BodySystem  │ ───────► │ Constraints  │
//! └──────────────┘              └──────────────┘          └──────┬───────┘
//!        ▲                                                       │
//!        │          ΔR from  dC/dR · ΔR = -C                     │
//!        └──────────────── NewtonIterator ◄──── JacobianMatrix ◄─┘
//! ```
//!
//! The pieces:
//!
//! - [`JacobianMatrix`]: the square `dC/dR` in global index order with
//!   direct, conjugate-gradient and SVD solves.
//! - [`sort_constraints`]: Cuthill-McKee ordering of constraints by their
//!   dependency edges, used to shrink the Jacobian's bandwidth.
//! - [`DifferentiationMode`]: analytical blocks from the constraints, or
//!   empirical probing with unit impulses.
//! - [`NewtonIterator`]: the Newton loop with divergence detection and the
//!   escalation ladder direct → conjugate gradient → SVD.
//! - [`ConstraintManager`]: the active set, index administration, the
//!   collision loop and the per-frame rollback guard.
//!
//! # Layer 0 Crate
//!
//! This crate has **zero Bevy dependencies**. Bodies, integration and
//! collision detection are reached only through the [`BodySystem`],
//! [`Integrator`] and [`CollisionScene`] traits.
//!
//! # Quick Start
//!
//! ```ignore
//! use sim_satisfy::{ConstraintManager, NoCollisions, SatisfyConfig};
//!
//! let mut manager = ConstraintManager::new(SatisfyConfig::realtime())?;
//! let hinge = manager.add(Box::new(Hinge::between(arm, forearm)))?;
//!
//! for _ in 0..240 {
//!     let report = manager.satisfy(&mut bodies, &mut NoCollisions)?;
//!     if !report.converged {
//!         tracing::warn!(error = report.error, "frame left unconverged");
//!     }
//!     bodies.commit();
//! }
//!
//! manager.del(hinge)?;
//! ```

#![doc(html_root_url = "https://docs.rs/sim-satisfy/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,       // Many methods can't be const due to nalgebra
    clippy::neg_cmp_op_on_partial_ord,  // !(x <= tol) is intentional so NaN keeps iterating
    clippy::doc_markdown,               // Not all technical terms need backticks
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::float_cmp))]

mod config;
mod differentiation;
mod error;
mod jacobian;
mod manager;
mod newton;
mod reorder;
mod set;
mod types;

pub use config::{DifferentiationMode, SatisfyConfig};
pub use differentiation::JacobianRefresh;
pub use error::{Result, SatisfyError};
pub use jacobian::{JacobianMatrix, PreparedSolve, SolveMethod, SolveSettings};
pub use manager::{ConstraintManager, SatisfyReport};
pub use newton::{NewtonIterator, NewtonOutcome, NewtonProblem, NewtonSettings, StepKind};
pub use reorder::{inverse_order, is_identity, sort_constraints, ConstraintPair};
pub use types::{
    ApplyOutcome, BodySystem, CollisionScene, Constraint, ConstraintId, Derivative,
    ExplicitEuler, Integrator, NoCollisions, PostProcess, RestrictionCheck,
};
