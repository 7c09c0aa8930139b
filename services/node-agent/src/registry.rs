//! Controllers of the machines placed on this node, keyed by machine id.
//!
//! A placement in progress holds a [`Claim`] on its machine id, so two
//! concurrent placements of the same machine cannot both get past admission.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleet_id::MachineId;

use crate::machine::MachineController;

#[derive(Default)]
struct Entries {
    machines: HashMap<MachineId, MachineController>,
    claimed: HashSet<MachineId>,
}

impl Entries {
    fn is_taken(&self, machine_id: &MachineId) -> bool {
        self.machines.contains_key(machine_id) || self.claimed.contains(machine_id)
    }
}

#[derive(Default)]
pub struct MachineRegistry {
    entries: RwLock<Entries>,
}

/// Exclusive right to register one machine id.
///
/// Dropping the claim without [`Claim::fill`] frees the id again.
#[must_use = "dropping a claim releases it"]
pub struct Claim<'a> {
    registry: &'a MachineRegistry,
    machine_id: MachineId,
    filled: bool,
}

impl Claim<'_> {
    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    /// Registers `controller` under the claimed id.
    pub fn fill(mut self, controller: MachineController) {
        debug_assert_eq!(controller.id(), self.machine_id);
        let mut entries = self.registry.write();
        entries.claimed.remove(&self.machine_id);
        entries.machines.insert(self.machine_id, controller);
        self.filled = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.registry.write().claimed.remove(&self.machine_id);
        }
    }
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `machine_id` for a placement. Returns `None` if the id is
    /// registered or claimed by another placement.
    pub fn claim(&self, machine_id: MachineId) -> Option<Claim<'_>> {
        let mut entries = self.write();
        if entries.is_taken(&machine_id) {
            return None;
        }
        entries.claimed.insert(machine_id);
        Some(Claim {
            registry: self,
            machine_id,
            filled: false,
        })
    }

    /// Registers `controller`. Returns `false` if the id is taken.
    pub fn add(&self, controller: MachineController) -> bool {
        let mut entries = self.write();
        if entries.is_taken(&controller.id()) {
            return false;
        }
        entries.machines.insert(controller.id(), controller);
        true
    }

    pub fn remove(&self, machine_id: MachineId) -> Option<MachineController> {
        self.write().machines.remove(&machine_id)
    }

    pub fn get(&self, machine_id: MachineId) -> Option<MachineController> {
        self.read().machines.get(&machine_id).cloned()
    }

    pub fn contains(&self, machine_id: MachineId) -> bool {
        self.read().machines.contains_key(&machine_id)
    }

    /// Calls `f` on every registered controller.
    ///
    /// The registry is locked for the duration, so `f` must not add or
    /// remove machines.
    pub fn for_each(&self, mut f: impl FnMut(&MachineController)) {
        for controller in self.read().machines.values() {
            f(controller);
        }
    }

    pub fn ids(&self) -> Vec<MachineId> {
        self.read().machines.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().machines.is_empty()
    }
}
