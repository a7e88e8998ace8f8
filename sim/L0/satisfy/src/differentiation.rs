//! Jacobian assembly and the refresh schedule.
//!
//! Two strategies fill `dC/dR`:
//!
//! - **Analytical**: every producer is asked for the block of every
//!   consumer's error with respect to its own restriction. Non-zero blocks
//!   become [`ConstraintPair`] edges; everything else is written as an
//!   explicit zero block. Later analytical refreshes only revisit the
//!   cached edges.
//! - **Empirical**: each scalar restriction component is probed with a test
//!   impulse and the resulting error change is one Jacobian column.
//!
//! # Probing
//!
//! The probe always uses [`ExplicitEuler`], whatever the live integrator is,
//! so that the probed Jacobian is reproducible bit for bit. Each probe is
//! scoped: save undo, apply impulse, estimate, measure, restore undo.
//!
//! ```text
//! column(j) = (C(R + h e_j) - C(R)) / h
//! ```

use nalgebra::DVector;
use tracing::debug;

use crate::reorder::{inverse_order, is_identity, sort_constraints};
use crate::set::ConstraintSet;
use crate::{
    BodySystem, ConstraintPair, Derivative, DifferentiationMode, ExplicitEuler, Integrator,
    JacobianMatrix, Result, SatisfyConfig, SatisfyError,
};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What happened to the Jacobian when a solve was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum JacobianRefresh {
    /// No refresh was requested this frame.
    #[default]
    Untouched,
    /// Topology changed; sparsity and every block were derived again.
    Rebuilt {
        /// Whether reordering was committed.
        reordered: bool,
        /// Whether the empirical path was used.
        empirical: bool,
    },
    /// Values were recomputed on the cached sparsity.
    Recomputed {
        /// Whether the empirical path was used.
        empirical: bool,
    },
    /// The previous Jacobian was reused unchanged.
    Reused,
}

/// Assemble analytically over all ordered pairs.
///
/// Returns `None` if any constraint has no closed-form derivative.
pub(crate) fn analytical_full<S>(
    set: &ConstraintSet<S>,
    system: &S,
    matrix: &mut JacobianMatrix,
) -> Result<Option<Vec<ConstraintPair>>> {
    matrix.reset(set.total_dim());
    let ranges = set.ranges();
    let mut pairs = Vec::new();

    for (consumer, rows) in ranges.iter().enumerate() {
        for (producer, cols) in ranges.iter().enumerate() {
            let block = set.at(producer).derivative_block(system, set.at(consumer));
            match block {
                Derivative::Unsupported => return Ok(None),
                Derivative::Zero => {
                    matrix.set_zero_block(rows.start, cols.start, rows.len(), cols.len());
                }
                Derivative::Block(block) => {
                    check_shape(&block, rows.len(), cols.len())?;
                    if block.iter().any(|&v| v != 0.0) {
                        matrix.set_block(rows.start, cols.start, &block);
                        pairs.push(ConstraintPair::new(consumer, producer));
                    } else {
                        matrix.set_zero_block(rows.start, cols.start, rows.len(), cols.len());
                    }
                }
            }
        }
    }

    Ok(Some(pairs))
}

/// Recompute analytical blocks on the cached edges only.
///
/// Returns `false` if a cached edge no longer has a closed form.
pub(crate) fn analytical_refresh<S>(
    set: &ConstraintSet<S>,
    system: &S,
    pairs: &[ConstraintPair],
    matrix: &mut JacobianMatrix,
) -> Result<bool> {
    matrix.reset(set.total_dim());
    let ranges = set.ranges();

    for pair in pairs {
        let rows = &ranges[pair.consumer];
        let cols = &ranges[pair.producer];
        let block = set
            .at(pair.producer)
            .derivative_block(system, set.at(pair.consumer));
        match block {
            Derivative::Unsupported => return Ok(false),
            Derivative::Zero => {}
            Derivative::Block(block) => {
                check_shape(&block, rows.len(), cols.len())?;
                matrix.set_block(rows.start, cols.start, &block);
            }
        }
    }

    Ok(true)
}

/// Assemble by finite-difference probing.
///
/// Leaves `system` exactly as it was found. Returns the non-zero blocks as
/// pairs.
pub(crate) fn empirical<S: BodySystem>(
    set: &mut ConstraintSet<S>,
    system: &mut S,
    config: &SatisfyConfig,
    matrix: &mut JacobianMatrix,
) -> Vec<ConstraintPair> {
    let n = set.total_dim();
    matrix.reset(n);
    let dt = config.timestep;
    let impulse = config.probe_impulse;
    let probe = ExplicitEuler;

    let undo = system.save_undo();
    probe.estimate(system, dt);
    let baseline = set.errors(system);
    system.restore_undo(&undo);

    let ranges = set.ranges().to_vec();
    for (producer, cols) in ranges.iter().enumerate() {
        let mut delta = vec![0.0; cols.len()];
        for k in 0..cols.len() {
            delta[k] = impulse;
            // Removal requests are meaningless for a probe and are dropped.
            let _ = set.at_mut(producer).apply_restriction_change(system, &delta);
            probe.estimate(system, dt);
            let probed = set.errors(system);
            system.restore_undo(&undo);
            delta[k] = 0.0;

            let column: DVector<f64> = (probed - &baseline) / impulse;
            matrix.set_column(cols.start + k, &column);
        }
    }

    let mut pairs = Vec::new();
    for (consumer, rows) in ranges.iter().enumerate() {
        for (producer, cols) in ranges.iter().enumerate() {
            if matrix.block_is_nonzero(rows, cols) {
                pairs.push(ConstraintPair::new(consumer, producer));
            }
        }
    }
    pairs
}

fn check_shape(block: &nalgebra::DMatrix<f64>, rows: usize, cols: usize) -> Result<()> {
    if block.shape() == (rows, cols) {
        Ok(())
    } else {
        Err(SatisfyError::BlockShape {
            expected: (rows, cols),
            actual: block.shape(),
        })
    }
}

/// The manager's Jacobian with its cached sparsity and refresh schedule.
#[derive(Debug, Clone, Default)]
pub(crate) struct JacobianCache {
    pub(crate) matrix: JacobianMatrix,
    pub(crate) pairs: Vec<ConstraintPair>,
    stale: bool,
    last_refresh: Option<u64>,
}

impl JacobianCache {
    /// Topology changed: the next refresh must rebuild.
    pub(crate) fn invalidate(&mut self, total_dim: usize) {
        self.matrix.reset(total_dim);
        self.pairs.clear();
        self.stale = true;
    }

    /// Bring the Jacobian up to date for `frame` following the schedule.
    pub(crate) fn refresh<S: BodySystem>(
        &mut self,
        set: &mut ConstraintSet<S>,
        system: &mut S,
        config: &SatisfyConfig,
        frame: u64,
    ) -> Result<JacobianRefresh> {
        if self.stale {
            return self.rebuild(set, system, config, frame);
        }

        let due = self
            .last_refresh
            .is_none_or(|last| frame.saturating_sub(last) >= config.jacobian_skip);
        if !due {
            return Ok(JacobianRefresh::Reused);
        }

        let empirical_path = match config.differentiation {
            DifferentiationMode::Analytical => {
                !analytical_refresh(set, system, &self.pairs, &mut self.matrix)?
            }
            DifferentiationMode::Empirical => true,
        };
        if empirical_path {
            // Sparsity stays as derived by the last rebuild.
            let _ = empirical(set, system, config, &mut self.matrix);
        }

        self.last_refresh = Some(frame);
        debug!(frame, empirical = empirical_path, "recomputed jacobian");
        Ok(JacobianRefresh::Recomputed {
            empirical: empirical_path,
        })
    }

    /// Derive sparsity and all blocks, then try to reorder.
    pub(crate) fn rebuild<S: BodySystem>(
        &mut self,
        set: &mut ConstraintSet<S>,
        system: &mut S,
        config: &SatisfyConfig,
        frame: u64,
    ) -> Result<JacobianRefresh> {
        let analytical = match config.differentiation {
            DifferentiationMode::Analytical => analytical_full(set, system, &mut self.matrix)?,
            DifferentiationMode::Empirical => None,
        };
        let empirical_path = analytical.is_none();
        self.pairs = match analytical {
            Some(pairs) => pairs,
            None => empirical(set, system, config, &mut self.matrix),
        };

        let reordered = config.reorder && self.try_reorder(set);
        self.stale = false;
        self.last_refresh = Some(frame);

        debug!(
            frame,
            total_dim = set.total_dim(),
            pairs = self.pairs.len(),
            bandwidth = self.matrix.bandwidth(),
            empirical = empirical_path,
            reordered,
            "rebuilt jacobian"
        );
        Ok(JacobianRefresh::Rebuilt {
            reordered,
            empirical: empirical_path,
        })
    }

    /// Commit a Cuthill-McKee order only if it strictly lowers bandwidth.
    fn try_reorder<S>(&mut self, set: &mut ConstraintSet<S>) -> bool {
        let n = set.len();
        if n < 2 {
            return false;
        }

        let order = sort_constraints(n, &self.pairs);
        if is_identity(&order) {
            return false;
        }

        let candidate = self.matrix.permuted(set.ranges(), &order);
        let before = self.matrix.bandwidth();
        let after = candidate.bandwidth();
        if after >= before {
            debug!(before, after, "reorder rejected");
            return false;
        }

        let new_position = inverse_order(&order);
        set.reorder(&order);
        self.matrix = candidate;
        for pair in &mut self.pairs {
            *pair = pair.remapped(&new_position);
        }
        true
    }
}
