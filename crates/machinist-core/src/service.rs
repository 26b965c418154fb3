use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    now_utc, CreateMachineRequest, Machine, MachineDto, MachineError, MachineStore, NewMachine,
};

/// Business operations over machine records.
///
/// Soft-deleted records are invisible to every operation here: reading,
/// updating or deleting one fails with [`MachineError::NotFound`]. Each
/// mutating operation issues exactly one write to the store, and each read
/// issues exactly one lookup.
///
/// Field constraints are checked by the caller; only structurally required
/// values (`id`, `name`) are guarded.
#[derive(Debug)]
pub struct MachineService<S> {
    store: S,
    clock: fn() -> OffsetDateTime,
}

impl<S: MachineStore> MachineService<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, now_utc)
    }

    pub fn with_clock(store: S, clock: fn() -> OffsetDateTime) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lists non-deleted machines, most recently touched first.
    ///
    /// # Errors
    /// Returns [`MachineError::Store`] when the store lookup fails.
    pub fn get_all(&self) -> Result<Vec<MachineDto>, MachineError> {
        let machines = self.store.find_all_not_deleted()?;
        debug!(count = machines.len(), "fetched machines");
        Ok(machines.iter().map(Machine::to_dto).collect())
    }

    /// # Errors
    /// Returns [`MachineError::NotFound`] when no non-deleted machine has `id`.
    pub fn get_by_id(&self, id: &str) -> Result<MachineDto, MachineError> {
        Ok(self.find_active(id)?.to_dto())
    }

    /// Stores a new machine with `createdAt == updatedAt == now`.
    ///
    /// # Errors
    /// Returns [`MachineError::Validation`] when `name` is absent, or
    /// [`MachineError::Store`] when the insert fails.
    pub fn create(&mut self, request: CreateMachineRequest) -> Result<MachineDto, MachineError> {
        let name = request.name.ok_or_else(|| missing("name"))?;
        let now = (self.clock)();
        let saved = self.store.insert(NewMachine {
            name,
            description: request.description,
            year_of_production: request.year_of_production,
            created_at: now,
            updated_at: now,
        })?;
        debug!(machine_id = %saved.id, "machine created");
        Ok(saved.to_dto())
    }

    /// Overwrites `name`, `description` and `yearOfProduction` of the machine
    /// identified by `dto.id`. Client-supplied timestamps are ignored.
    ///
    /// # Errors
    /// Returns [`MachineError::NotFound`] when the machine is absent or
    /// deleted, [`MachineError::Validation`] when `id` or `name` is absent.
    pub fn update(&mut self, dto: MachineDto) -> Result<(), MachineError> {
        let id = dto.id.as_deref().ok_or_else(|| missing("id"))?;
        let mut machine = self.find_active(id)?;
        machine.name = dto.name.ok_or_else(|| missing("name"))?;
        machine.description = dto.description;
        machine.year_of_production = dto.year_of_production;
        machine.updated_at = self.touch(machine.updated_at);
        self.store.save(&machine)?;
        debug!(machine_id = %machine.id, "machine updated");
        Ok(())
    }

    /// Marks the machine deleted. The record stays in the store.
    ///
    /// # Errors
    /// Returns [`MachineError::NotFound`] when the machine is absent or
    /// already deleted.
    pub fn delete_by_id(&mut self, id: &str) -> Result<(), MachineError> {
        let mut machine = self.find_active(id)?;
        machine.deleted = true;
        machine.updated_at = self.touch(machine.updated_at);
        debug!(machine_id = %id, "deleting machine");
        self.store.save(&machine)?;
        Ok(())
    }

    fn find_active(&self, id: &str) -> Result<Machine, MachineError> {
        self.store
            .find_by_id(id)?
            .filter(|machine| !machine.deleted)
            .ok_or_else(|| MachineError::NotFound(id.to_string()))
    }

    // updatedAt must move strictly forward even when the clock has not.
    fn touch(&self, previous: OffsetDateTime) -> OffsetDateTime {
        let now = (self.clock)();
        if now > previous {
            now
        } else {
            previous + Duration::nanoseconds(1)
        }
    }
}

fn missing(field: &str) -> MachineError {
    MachineError::Validation(format!("{field}: must not be null"))
}
