//! EnvironmentRegistry: the set of live environments and their ranges.
//!
//! Allocation has to see every range already handed out and record the new
//! one before anyone else looks. [`EnvironmentRegistry::register_with`] runs
//! that read-compute-write sequence inside one redb write transaction; redb
//! admits a single writer at a time, so concurrent creators serialize.

use asiaq_network::Cidr;
use redb::ReadableTable;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, map_err};
use crate::tables::ENVIRONMENTS;
use crate::types::Environment;

#[derive(Clone)]
pub struct EnvironmentRegistry {
    store: StateStore,
}

impl EnvironmentRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn list(&self) -> StateResult<Vec<Environment>> {
        self.store.list_environments()
    }

    pub fn get(&self, name: &str) -> StateResult<Option<Environment>> {
        self.store.get_environment(name)
    }

    /// Ranges of every environment except `name`.
    pub fn ranges_excluding(&self, name: &str) -> StateResult<Vec<Cidr>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.name != name)
            .map(|e| e.range)
            .collect())
    }

    /// Register a fully computed environment.
    pub fn register(&self, env: Environment) -> StateResult<Environment> {
        self.register_with(|_| Ok::<_, StateError>(env))
    }

    /// Replace an existing environment's record, keeping the range checks.
    pub fn update(&self, env: Environment) -> StateResult<Environment> {
        self.transact(true, |_| Ok::<_, StateError>(env))
    }

    /// Remove an environment, releasing its range. Returns true if it existed.
    pub fn unregister(&self, name: &str) -> StateResult<bool> {
        let existed = self.store.delete_environment(name)?;
        if existed {
            info!(environment = %name, "environment unregistered");
        }
        Ok(existed)
    }

    /// Snapshot all environments, compute a new one, and register it, atomically.
    ///
    /// `compute` sees the environments live at the start of the transaction.
    /// If it fails, or the result collides with an existing name or range,
    /// nothing is written.
    pub fn register_with<F, E>(&self, compute: F) -> Result<Environment, E>
    where
        F: FnOnce(&[Environment]) -> Result<Environment, E>,
        E: From<StateError>,
    {
        self.transact(false, compute)
    }

    fn transact<F, E>(&self, replace: bool, compute: F) -> Result<Environment, E>
    where
        F: FnOnce(&[Environment]) -> Result<Environment, E>,
        E: From<StateError>,
    {
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;
        let env = {
            let mut table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
            let mut existing = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let env: Environment =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                existing.push(env);
            }
            debug!(live = existing.len(), "registry snapshot taken");

            let env = compute(&existing)?;
            check_registrable(&env, &existing, replace)?;

            let bytes = serde_json::to_vec(&env).map_err(map_err!(Serialize))?;
            table
                .insert(env.name.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            env
        };
        txn.commit().map_err(map_err!(Transaction))?;
        info!(environment = %env.name, range = %env.range, "environment registered");
        Ok(env)
    }
}

/// Name must be free (unless replacing) and the range disjoint from every
/// other environment drawn from an overlapping parent space.
fn check_registrable(env: &Environment, existing: &[Environment], replace: bool) -> StateResult<()> {
    let same_name = existing.iter().any(|e| e.name == env.name);
    if same_name && !replace {
        return Err(StateError::AlreadyExists(format!("environment {}", env.name)));
    }
    if !same_name && replace {
        return Err(StateError::NotFound(format!("environment {}", env.name)));
    }
    if let Some(other) = existing.iter().find(|e| {
        e.name != env.name && e.parent_space.overlaps(&env.parent_space) && e.range.overlaps(&env.range)
    }) {
        return Err(StateError::OverlapConflict {
            range: env.range,
            existing: other.name.clone(),
            existing_range: other.range,
        });
    }
    Ok(())
}
