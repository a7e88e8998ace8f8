//! Arena of active constraints and their index administration.
//!
//! Constraints live in generation-tagged slots. The active order is a list
//! of slot numbers; the index range of each constraint follows from its
//! position in that order. Removal only marks a slot: marked slots keep
//! their place until [`ConstraintSet::administer`] runs, so callbacks may
//! request removal while the order is being traversed.

use std::ops::Range;

use nalgebra::DVector;

use crate::{Constraint, ConstraintId, Result, SatisfyError};

struct Slot<S> {
    constraint: Box<dyn Constraint<S>>,
    pending_removal: bool,
    forces_shown: bool,
    from_collision: bool,
}

struct Entry<S> {
    generation: u32,
    slot: Option<Slot<S>>,
}

/// Constraint arena with index bookkeeping.
pub(crate) struct ConstraintSet<S> {
    entries: Vec<Entry<S>>,
    free: Vec<u32>,
    order: Vec<u32>,
    ranges: Vec<Range<usize>>,
    total_dim: usize,
    changed: bool,
    display_forces: bool,
}

impl<S> Default for ConstraintSet<S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            ranges: Vec::new(),
            total_dim: 0,
            changed: false,
            display_forces: false,
        }
    }
}

impl<S> ConstraintSet<S> {
    /// Insert a constraint at the end of the order.
    pub(crate) fn add(
        &mut self,
        mut constraint: Box<dyn Constraint<S>>,
        from_collision: bool,
    ) -> Result<ConstraintId> {
        if constraint.dim() == 0 {
            return Err(SatisfyError::ZeroDimension {
                name: constraint.name().to_owned(),
            });
        }

        if self.display_forces {
            constraint.show_forces();
        }
        let slot = Slot {
            constraint,
            pending_removal: false,
            forces_shown: self.display_forces,
            from_collision,
        };

        let index = if let Some(index) = self.free.pop() {
            self.entries[index as usize].slot = Some(slot);
            index
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                slot: Some(slot),
            });
            index
        };

        self.order.push(index);
        self.changed = true;
        Ok(ConstraintId::new(index, self.entries[index as usize].generation))
    }

    /// Mark a constraint for removal at the next administration pass.
    pub(crate) fn remove(&mut self, id: ConstraintId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.pending_removal {
            return Ok(());
        }
        if slot.forces_shown {
            slot.constraint.hide_forces();
            slot.forces_shown = false;
        }
        slot.pending_removal = true;
        self.changed = true;
        Ok(())
    }

    /// Mark the constraint at `position` for removal.
    pub(crate) fn remove_at(&mut self, position: usize) {
        let id = self.id_at(position);
        // The id was read from the order, so it is live.
        let _ = self.remove(id);
    }

    /// Drop marked constraints and recompute index ranges.
    ///
    /// Returns the handles of the constraints that were dropped.
    pub(crate) fn administer(&mut self) -> Vec<ConstraintId> {
        let mut dropped = Vec::new();
        let entries = &mut self.entries;
        let free = &mut self.free;
        self.order.retain(|&index| {
            let entry = &mut entries[index as usize];
            let pending = entry.slot.as_ref().is_some_and(|slot| slot.pending_removal);
            if pending {
                dropped.push(ConstraintId::new(index, entry.generation));
                entry.slot = None;
                entry.generation = entry.generation.wrapping_add(1);
                free.push(index);
            }
            !pending
        });

        self.recompute_ranges();
        self.changed = false;
        dropped
    }

    /// Replace the order with `order` (`order[new] = old` positions).
    pub(crate) fn reorder(&mut self, order: &[usize]) {
        self.order = order.iter().map(|&old| self.order[old]).collect();
        self.recompute_ranges();
    }

    fn recompute_ranges(&mut self) {
        self.ranges.clear();
        let mut offset = 0;
        for &index in &self.order {
            let dim = self.entries[index as usize]
                .slot
                .as_ref()
                .map_or(0, |slot| slot.constraint.dim());
            self.ranges.push(offset..offset + dim);
            offset += dim;
        }
        self.total_dim = offset;
    }

    /// Whether the set changed since the last administration pass.
    pub(crate) const fn is_changed(&self) -> bool {
        self.changed
    }

    /// Total scalar dimension after the last administration pass.
    pub(crate) const fn total_dim(&self) -> usize {
        self.total_dim
    }

    /// Number of constraints in the order, including ones marked for removal.
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Index ranges by position.
    pub(crate) fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Handle of the constraint at `position`.
    pub(crate) fn id_at(&self, position: usize) -> ConstraintId {
        let index = self.order[position];
        ConstraintId::new(index, self.entries[index as usize].generation)
    }

    /// Handles in index order.
    pub(crate) fn ids(&self) -> Vec<ConstraintId> {
        (0..self.order.len()).map(|p| self.id_at(p)).collect()
    }

    /// Position of a live constraint in the order.
    pub(crate) fn position(&self, id: ConstraintId) -> Option<usize> {
        self.slot(id).ok()?;
        self.order.iter().position(|&index| index == id.slot())
    }

    /// Constraint at `position`.
    pub(crate) fn at(&self, position: usize) -> &dyn Constraint<S> {
        self.slot_at(position).constraint.as_ref()
    }

    /// Mutable constraint at `position`.
    pub(crate) fn at_mut(&mut self, position: usize) -> &mut dyn Constraint<S> {
        let index = self.order[position] as usize;
        match self.entries[index].slot.as_mut() {
            Some(slot) => slot.constraint.as_mut(),
            None => unreachable!("ordered slot {index} is empty"),
        }
    }

    /// Whether the constraint at `position` awaits removal.
    pub(crate) fn is_pending_at(&self, position: usize) -> bool {
        self.slot_at(position).pending_removal
    }

    fn slot_at(&self, position: usize) -> &Slot<S> {
        let index = self.order[position] as usize;
        match self.entries[index].slot.as_ref() {
            Some(slot) => slot,
            None => unreachable!("ordered slot {index} is empty"),
        }
    }

    /// Whether `id` refers to a live constraint not marked for removal.
    pub(crate) fn contains(&self, id: ConstraintId) -> bool {
        self.slot(id).is_ok_and(|slot| !slot.pending_removal)
    }

    /// Whether the constraint was created by the collision loop.
    pub(crate) fn is_from_collision(&self, id: ConstraintId) -> bool {
        self.slot(id).is_ok_and(|slot| slot.from_collision)
    }

    /// Live constraint by handle.
    pub(crate) fn get(&self, id: ConstraintId) -> Result<&dyn Constraint<S>> {
        self.slot(id).map(|slot| slot.constraint.as_ref())
    }

    /// Mutable live constraint by handle.
    pub(crate) fn get_mut(&mut self, id: ConstraintId) -> Result<&mut dyn Constraint<S>> {
        match self.slot_mut(id) {
            Ok(slot) => Ok(slot.constraint.as_mut()),
            Err(err) => Err(err),
        }
    }

    fn slot(&self, id: ConstraintId) -> Result<&Slot<S>> {
        self.entries
            .get(id.slot() as usize)
            .filter(|entry| entry.generation == id.generation())
            .and_then(|entry| entry.slot.as_ref())
            .ok_or(SatisfyError::UnknownConstraint(id))
    }

    fn slot_mut(&mut self, id: ConstraintId) -> Result<&mut Slot<S>> {
        self.entries
            .get_mut(id.slot() as usize)
            .filter(|entry| entry.generation == id.generation())
            .and_then(|entry| entry.slot.as_mut())
            .ok_or(SatisfyError::UnknownConstraint(id))
    }

    /// Switch force visualization on or off for every constraint.
    pub(crate) fn set_display_forces(&mut self, show: bool) {
        self.display_forces = show;
        for slot in self.entries.iter_mut().filter_map(|e| e.slot.as_mut()) {
            if slot.pending_removal || slot.forces_shown == show {
                continue;
            }
            if show {
                slot.constraint.show_forces();
            } else {
                slot.constraint.hide_forces();
            }
            slot.forces_shown = show;
        }
    }

    pub(crate) const fn display_forces(&self) -> bool {
        self.display_forces
    }

    /// Stacked error vector of all constraints.
    pub(crate) fn errors(&self, system: &S) -> DVector<f64> {
        let mut errors = DVector::zeros(self.total_dim);
        for (position, range) in self.ranges.iter().enumerate() {
            let out = &mut errors.as_mut_slice()[range.clone()];
            self.at(position).error(system, out);
        }
        errors
    }
}

/// Euclidean norm of an error vector; `NaN` propagates.
pub(crate) fn error_norm(errors: &DVector<f64>) -> f64 {
    errors.norm()
}
