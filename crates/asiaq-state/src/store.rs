//! StateStore: redb-backed state persistence for Asiaq.
//!
//! Provides typed CRUD operations over environments, groups, instances,
//! deployment attempts, snapshots and images. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use asiaq_core::ImageStage;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [ENVIRONMENTS, GROUPS, INSTANCES, DEPLOYMENTS, SNAPSHOTS, IMAGES] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix lists everything).
    fn scan<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn remove_prefix(&self, table: JsonTable, prefix: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let keys: Vec<String> = t
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect();
            count = keys.len() as u32;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Environments ───────────────────────────────────────────────

    /// Insert or update an environment without range checks.
    ///
    /// Use [`crate::EnvironmentRegistry`] for registration.
    pub fn put_environment(&self, env: &Environment) -> StateResult<()> {
        self.put(ENVIRONMENTS, &env.name, env)?;
        debug!(name = %env.name, range = %env.range, "environment stored");
        Ok(())
    }

    pub fn get_environment(&self, name: &str) -> StateResult<Option<Environment>> {
        self.get(ENVIRONMENTS, name)
    }

    pub fn list_environments(&self) -> StateResult<Vec<Environment>> {
        self.scan(ENVIRONMENTS, "")
    }

    /// Delete an environment by name. Returns true if it existed.
    pub fn delete_environment(&self, name: &str) -> StateResult<bool> {
        let existed = self.remove(ENVIRONMENTS, name)?;
        debug!(%name, existed, "environment deleted");
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    pub fn put_group(&self, group: &AutoscalingGroup) -> StateResult<()> {
        let key = group.table_key();
        self.put(GROUPS, &key, group)?;
        debug!(%key, image = %group.image_id, desired = group.desired_size, "group stored");
        Ok(())
    }

    pub fn get_group(&self, environment: &str, name: &str) -> StateResult<Option<AutoscalingGroup>> {
        self.get(GROUPS, &format!("{environment}/{name}"))
    }

    pub fn list_groups(&self, environment: &str) -> StateResult<Vec<AutoscalingGroup>> {
        self.scan(GROUPS, &format!("{environment}/"))
    }

    pub fn delete_group(&self, environment: &str, name: &str) -> StateResult<bool> {
        self.remove(GROUPS, &format!("{environment}/{name}"))
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.table_key(), instance)
    }

    /// All instances of one group.
    pub fn list_instances_for_group(&self, environment: &str, group: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, &format!("{environment}/{group}:"))
    }

    /// All instances in an environment.
    pub fn list_instances(&self, environment: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, &format!("{environment}/"))
    }

    pub fn delete_instance(&self, instance: &Instance) -> StateResult<bool> {
        self.remove(INSTANCES, &instance.table_key())
    }

    /// Delete all instances of a group. Returns number deleted.
    pub fn delete_instances_for_group(&self, environment: &str, group: &str) -> StateResult<u32> {
        self.remove_prefix(INSTANCES, &format!("{environment}/{group}:"))
    }

    // ── Deployment attempts ────────────────────────────────────────

    pub fn put_attempt(&self, attempt: &DeploymentAttempt) -> StateResult<()> {
        self.put(DEPLOYMENTS, &attempt.id, attempt)?;
        debug!(id = %attempt.id, phase = %attempt.phase, "deployment attempt stored");
        Ok(())
    }

    pub fn get_attempt(&self, id: &str) -> StateResult<Option<DeploymentAttempt>> {
        self.get(DEPLOYMENTS, id)
    }

    /// Attempts for an environment, oldest first.
    pub fn list_attempts(&self, environment: &str) -> StateResult<Vec<DeploymentAttempt>> {
        let mut attempts: Vec<DeploymentAttempt> = self
            .scan::<DeploymentAttempt>(DEPLOYMENTS, "")?
            .into_iter()
            .filter(|a| a.environment == environment)
            .collect();
        attempts.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(attempts)
    }

    // ── Snapshots ──────────────────────────────────────────────────

    pub fn put_snapshot(&self, snapshot: &Snapshot) -> StateResult<()> {
        self.put(SNAPSHOTS, &snapshot.table_key(), snapshot)
    }

    pub fn list_snapshots(&self, hostclass: &str) -> StateResult<Vec<Snapshot>> {
        self.scan(SNAPSHOTS, &format!("{hostclass}:"))
    }

    /// Most recently created snapshot tagged for the hostclass.
    pub fn latest_snapshot(&self, hostclass: &str) -> StateResult<Option<Snapshot>> {
        Ok(self
            .list_snapshots(hostclass)?
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))))
    }

    // ── Images ─────────────────────────────────────────────────────

    pub fn put_image(&self, image: &Image) -> StateResult<()> {
        self.put(IMAGES, &image.id, image)?;
        debug!(id = %image.id, hostclass = %image.hostclass, stage = %image.stage, "image stored");
        Ok(())
    }

    pub fn get_image(&self, id: &str) -> StateResult<Option<Image>> {
        self.get(IMAGES, id)
    }

    /// Images, optionally restricted to one hostclass, oldest first.
    pub fn list_images(&self, hostclass: Option<&str>) -> StateResult<Vec<Image>> {
        let mut images: Vec<Image> = self
            .scan::<Image>(IMAGES, "")?
            .into_iter()
            .filter(|i| hostclass.is_none_or(|h| i.hostclass == h))
            .collect();
        images.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(images)
    }

    /// Move an image to a new stage.
    pub fn set_image_stage(&self, id: &str, stage: ImageStage) -> StateResult<Image> {
        let mut image = self
            .get_image(id)?
            .ok_or_else(|| StateError::NotFound(format!("image {id}")))?;
        image.stage = stage;
        self.put_image(&image)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asiaq_core::DeploymentStrategy;

    fn test_group(environment: &str, hostclass: &str) -> AutoscalingGroup {
        AutoscalingGroup {
            name: group_name(environment, hostclass),
            environment: environment.to_string(),
            hostclass: hostclass.to_string(),
            image_id: "ami-1".to_string(),
            min_size: 1,
            desired_size: 2,
            max_size: 4,
            schedule: Vec::new(),
            instance_type: "m5.large".to_string(),
            snapshot_id: None,
            extra_disk: None,
            iops: None,
            subnets: vec!["10.0.0.0/26".parse().unwrap()],
            ip_address: None,
            public_ip: false,
            load_balancer: None,
            chaos: true,
            testing: false,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_instance(environment: &str, group: &str, id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            environment: environment.to_string(),
            group: group.to_string(),
            hostclass: "mhcweb".to_string(),
            image_id: "ami-1".to_string(),
            private_ip: None,
            status: InstanceStatus::Running,
            launched_at: 1000,
        }
    }

    fn test_image(id: &str, hostclass: &str, created_at: u64) -> Image {
        Image {
            id: id.to_string(),
            hostclass: hostclass.to_string(),
            stage: ImageStage::Untested,
            created_at,
        }
    }

    // ── Group CRUD ─────────────────────────────────────────────────

    #[test]
    fn group_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let group = test_group("ci", "mhcweb");

        store.put_group(&group).unwrap();
        let retrieved = store.get_group("ci", "ci_mhcweb").unwrap();

        assert_eq!(retrieved, Some(group));
    }

    #[test]
    fn groups_are_scoped_by_environment() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_group(&test_group("ci", "mhcweb")).unwrap();
        store.put_group(&test_group("ci", "mhcdb")).unwrap();
        store.put_group(&test_group("ci2", "mhcweb")).unwrap();

        assert_eq!(store.list_groups("ci").unwrap().len(), 2);
        assert_eq!(store.list_groups("ci2").unwrap().len(), 1);
        assert!(store.delete_group("ci", "ci_mhcdb").unwrap());
        assert!(!store.delete_group("ci", "ci_mhcdb").unwrap());
        assert_eq!(store.list_groups("ci").unwrap().len(), 1);
    }

    // ── Instance CRUD ──────────────────────────────────────────────

    #[test]
    fn instance_list_and_delete_for_group() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("ci", "ci_web", "i-1")).unwrap();
        store.put_instance(&test_instance("ci", "ci_web", "i-2")).unwrap();
        store.put_instance(&test_instance("ci", "ci_web2", "i-3")).unwrap();

        assert_eq!(store.list_instances_for_group("ci", "ci_web").unwrap().len(), 2);
        assert_eq!(store.list_instances("ci").unwrap().len(), 3);

        let deleted = store.delete_instances_for_group("ci", "ci_web").unwrap();
        assert_eq!(deleted, 2);
        // ci_web2 shares a prefix but is untouched
        assert_eq!(store.list_instances_for_group("ci", "ci_web2").unwrap().len(), 1);
    }

    // ── Attempts ───────────────────────────────────────────────────

    #[test]
    fn attempts_round_trip_and_sort() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, started) in [("b", 20), ("a", 10)] {
            store
                .put_attempt(&DeploymentAttempt {
                    id: id.to_string(),
                    environment: "ci".to_string(),
                    hostclass: "mhcweb".to_string(),
                    strategy: DeploymentStrategy::BlueGreen,
                    image_id: "ami-2".to_string(),
                    stable_group: Some("ci_mhcweb".to_string()),
                    new_group: None,
                    phase: DeploymentPhase::Pending,
                    smoke: None,
                    integration: None,
                    error: None,
                    history: Vec::new(),
                    started_at: started,
                    updated_at: started,
                })
                .unwrap();
        }
        let attempts = store.list_attempts("ci").unwrap();
        assert_eq!(attempts.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(store.list_attempts("prod").unwrap().is_empty());
        assert_eq!(store.get_attempt("a").unwrap().unwrap().started_at, 10);
    }

    // ── Snapshots and images ───────────────────────────────────────

    #[test]
    fn latest_snapshot_by_creation_time() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, created_at) in [("snap-old", 1), ("snap-new", 5), ("snap-mid", 3)] {
            store
                .put_snapshot(&Snapshot {
                    id: id.to_string(),
                    hostclass: "mhcdb".to_string(),
                    size_gb: 100,
                    created_at,
                })
                .unwrap();
        }
        assert_eq!(store.latest_snapshot("mhcdb").unwrap().unwrap().id, "snap-new");
        assert!(store.latest_snapshot("mhcweb").unwrap().is_none());
    }

    #[test]
    fn image_stage_promotion() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_image(&test_image("ami-2", "mhcweb", 20)).unwrap();
        store.put_image(&test_image("ami-1", "mhcweb", 10)).unwrap();
        store.put_image(&test_image("ami-9", "mhcdb", 5)).unwrap();

        let web: Vec<String> = store
            .list_images(Some("mhcweb"))
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(web, ["ami-1", "ami-2"]);
        assert_eq!(store.list_images(None).unwrap().len(), 3);

        let promoted = store.set_image_stage("ami-2", ImageStage::Tested).unwrap();
        assert_eq!(promoted.stage, ImageStage::Tested);
        assert_eq!(store.get_image("ami-2").unwrap().unwrap().stage, ImageStage::Tested);
        assert!(matches!(
            store.set_image_stage("ami-404", ImageStage::Failed),
            Err(StateError::NotFound(_))
        ));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asiaq.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store.put_group(&test_group("ci", "mhcweb")).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_group("ci", "ci_mhcweb").unwrap().is_some());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_environments().unwrap().is_empty());
        assert!(store.list_groups("ci").unwrap().is_empty());
        assert!(store.list_instances("ci").unwrap().is_empty());
        assert_eq!(store.delete_instances_for_group("ci", "ci_web").unwrap(), 0);
        assert!(!store.delete_environment("ci").unwrap());
    }
}
