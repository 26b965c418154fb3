use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use ulid::Ulid;

use crate::{Machine, NewMachine};

/// Persistence seam consumed by [`crate::MachineService`].
///
/// Stores hold every record ever inserted, including soft-deleted ones.
/// Visibility filtering on `deleted` is done explicitly by the caller of
/// [`MachineStore::find_by_id`] and by [`MachineStore::find_all_not_deleted`].
pub trait MachineStore {
    /// Assigns a fresh id and stores the record as not deleted.
    fn insert(&mut self, machine: NewMachine) -> Result<Machine>;

    fn find_by_id(&self, id: &str) -> Result<Option<Machine>>;

    /// Returns records with `deleted = false`, most recently updated first.
    fn find_all_not_deleted(&self) -> Result<Vec<Machine>>;

    /// Overwrites an existing record in place. Fails if the id is unknown.
    fn save(&mut self, machine: &Machine) -> Result<Machine>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryMachineStore {
    machines: BTreeMap<String, Machine>,
}

impl InMemoryMachineStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

impl MachineStore for InMemoryMachineStore {
    fn insert(&mut self, machine: NewMachine) -> Result<Machine> {
        let stored = machine.into_machine(Ulid::new().to_string());
        self.machines.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Machine>> {
        Ok(self.machines.get(id).cloned())
    }

    fn find_all_not_deleted(&self) -> Result<Vec<Machine>> {
        let mut active: Vec<Machine> =
            self.machines.values().filter(|machine| !machine.deleted).cloned().collect();
        active.sort_by(|lhs, rhs| {
            rhs.updated_at.cmp(&lhs.updated_at).then_with(|| rhs.id.cmp(&lhs.id))
        });
        Ok(active)
    }

    fn save(&mut self, machine: &Machine) -> Result<Machine> {
        let slot = self
            .machines
            .get_mut(&machine.id)
            .ok_or_else(|| anyhow!("machine {} is not stored", machine.id))?;
        *slot = machine.clone();
        Ok(machine.clone())
    }
}
