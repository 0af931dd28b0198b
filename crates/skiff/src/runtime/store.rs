//! Container state persistence.
//!
//! Mirrors container descriptors to `<root>/containers/<id>/state.json` so
//! that other `skiff` processes can list, inspect, stop and remove
//! containers owned by a detached supervisor. Names are reserved under
//! `<root>/names/` with create-new semantics.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use skiff_api::ContainerDescriptor;
use skiff_common::{SkiffError, SkiffPaths, SkiffResult};
use tempfile::NamedTempFile;

const STOP_MARKER: &str = "stop-requested";

/// Manages container state persistence.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: SkiffPaths,
}

impl StateStore {
    /// Create a new state store.
    #[must_use]
    pub const fn new(paths: SkiffPaths) -> Self {
        Self { paths }
    }

    /// Paths the store writes to.
    #[must_use]
    pub const fn paths(&self) -> &SkiffPaths {
        &self.paths
    }

    /// Get the path to a container's state file.
    #[must_use]
    pub fn state_path(&self, container_id: &str) -> PathBuf {
        self.paths.container_state(container_id)
    }

    /// Reserve the container's name and write its first state.
    ///
    /// The container directory exists before the name is reserved, so a
    /// reservation whose owner has no directory is known to be stale.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Conflict`] if another container holds the name.
    pub fn create(&self, descriptor: &ContainerDescriptor) -> SkiffResult<()> {
        if let Some(name) = &descriptor.name {
            self.reserve_name(name, &descriptor.id)?;
        } else {
            fs::create_dir_all(self.paths.container(&descriptor.id))?;
        }

        let saved = self.save(descriptor);
        if saved.is_err() {
            let _ = self.delete(&descriptor.id, descriptor.name.as_deref());
        }
        saved
    }

    /// Atomically reserve `name` for container `id`.
    ///
    /// Creates the container directory first. On failure the directory is
    /// removed again.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Conflict`] if a live container holds the name.
    pub fn reserve_name(&self, name: &str, id: &str) -> SkiffResult<()> {
        let dir = self.paths.container(id);
        fs::create_dir_all(&dir)?;

        let result = self.claim_name(name, id);
        if result.is_err() {
            let _ = fs::remove_dir_all(&dir);
        }
        result
    }

    fn claim_name(&self, name: &str, id: &str) -> SkiffResult<()> {
        let names = self.paths.names();
        fs::create_dir_all(&names)?;
        let path = self.paths.name_reservation(name);

        loop {
            let mut file = NamedTempFile::new_in(&names)?;
            file.write_all(id.as_bytes())?;
            file.flush()?;

            match file.persist_noclobber(&path) {
                Ok(_) => return Ok(()),
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => return Err(SkiffError::Io(err.error)),
            }

            let owner = match fs::read_to_string(&path) {
                Ok(owner) => owner.trim().to_string(),
                // Released in the meantime.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if owner == id {
                return Ok(());
            }
            if !owner.is_empty() && self.paths.container(&owner).is_dir() {
                return Err(SkiffError::conflict(format!(
                    "container name \"{name}\" is already in use by container {owner}"
                )));
            }

            // The owner's directory is gone: it was removed, or its process
            // died before creating it.
            tracing::debug!(name = %name, owner = %owner, "Reclaiming stale name reservation");
            let still_stale = fs::read_to_string(&path).is_ok_and(|current| current.trim() == owner);
            if still_stale {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }

    fn release_name(&self, name: &str, id: &str) {
        let path = self.paths.name_reservation(name);
        let owned = fs::read_to_string(&path).is_ok_and(|owner| owner.trim() == id);
        if owned {
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(name = %name, error = %err, "Failed to release container name");
            }
        }
    }

    /// Save container state.
    ///
    /// Does nothing once the container has been deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be written.
    pub fn save(&self, descriptor: &ContainerDescriptor) -> SkiffResult<()> {
        let dir = self.paths.container(&descriptor.id);
        if !dir.is_dir() {
            return Ok(());
        }

        let mut file = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut file, descriptor)?;
        file.persist(self.state_path(&descriptor.id))
            .map_err(|err| SkiffError::Io(err.error))?;

        tracing::debug!(
            container_id = %descriptor.id,
            status = %descriptor.state.status,
            "Saved container state"
        );

        Ok(())
    }

    /// Load container state by full ID, name or unambiguous ID prefix.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] if nothing matches and
    /// [`SkiffError::Conflict`] if a prefix is ambiguous.
    pub fn load(&self, key: &str) -> SkiffResult<ContainerDescriptor> {
        let key = key.strip_prefix('/').unwrap_or(key);
        if key.is_empty() || key.contains('/') {
            return Err(SkiffError::not_found(key));
        }

        if self.exists(key) {
            return self.read(key);
        }

        if let Ok(owner) = fs::read_to_string(self.paths.name_reservation(key)) {
            if self.exists(owner.trim()) {
                return self.read(owner.trim());
            }
        }

        let mut matches = self.ids()?.into_iter().filter(|id| id.starts_with(key));
        match (matches.next(), matches.next()) {
            (Some(id), None) => self.read(&id),
            (None, _) => Err(SkiffError::not_found(key)),
            (Some(_), Some(_)) => Err(SkiffError::conflict(format!(
                "multiple containers match id prefix {key}"
            ))),
        }
    }

    fn read(&self, container_id: &str) -> SkiffResult<ContainerDescriptor> {
        let json = match fs::read_to_string(self.state_path(container_id)) {
            Ok(json) => json,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(SkiffError::not_found(container_id));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    fn ids(&self) -> SkiffResult<Vec<String>> {
        let mut ids = Vec::new();
        let dir = self.paths.containers();

        if !dir.exists() {
            return Ok(ids);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().join("state.json").exists() {
                if let Some(id) = entry.file_name().to_str() {
                    ids.push(id.to_string());
                }
            }
        }

        Ok(ids)
    }

    /// List all containers, newest first.
    ///
    /// Entries deleted while listing are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be read.
    pub fn list(&self) -> SkiffResult<Vec<ContainerDescriptor>> {
        let mut descriptors = Vec::new();
        for id in self.ids()? {
            match self.read(&id) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(SkiffError::ContainerNotFound { .. }) => {}
                Err(err) => {
                    tracing::warn!(container_id = %id, error = %err, "Skipping unreadable state");
                }
            }
        }

        descriptors.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        Ok(descriptors)
    }

    /// Delete container state and release its name.
    ///
    /// # Errors
    ///
    /// Returns an error if the container directory cannot be removed.
    pub fn delete(&self, container_id: &str, name: Option<&str>) -> SkiffResult<()> {
        let container_dir = self.paths.container(container_id);

        if container_dir.exists() {
            fs::remove_dir_all(&container_dir)?;
            tracing::debug!(
                container_id = %container_id,
                path = %container_dir.display(),
                "Deleted container state"
            );
        }

        if let Some(name) = name {
            self.release_name(name, container_id);
        }

        Ok(())
    }

    /// Check if a container exists.
    #[must_use]
    pub fn exists(&self, container_id: &str) -> bool {
        !container_id.is_empty() && self.state_path(container_id).exists()
    }

    /// Leave a stop request for the process supervising the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn request_stop(&self, container_id: &str) -> SkiffResult<()> {
        let dir = self.paths.container(container_id);
        if dir.is_dir() {
            fs::write(dir.join(STOP_MARKER), b"")?;
        }
        Ok(())
    }

    /// Consume a stop request. Returns true if one was present.
    #[must_use]
    pub fn take_stop_request(&self, container_id: &str) -> bool {
        fs::remove_file(self.paths.container(container_id).join(STOP_MARKER)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use skiff_api::{ConfigDescriptor, HostConfigDescriptor, LifecycleState, StateDescriptor};
    use skiff_common::ContainerId;
    use tempfile::tempdir;

    fn descriptor(name: Option<&str>) -> ContainerDescriptor {
        ContainerDescriptor {
            id: ContainerId::generate().to_string(),
            name: name.map(ToString::to_string),
            image: "busybox:latest".to_string(),
            created: Utc::now(),
            restart_count: 0,
            config: ConfigDescriptor::default(),
            host_config: HostConfigDescriptor::default(),
            state: StateDescriptor::created(),
        }
    }

    fn store() -> (tempfile::TempDir, StateStore) {
        let temp = tempdir().unwrap();
        let store = StateStore::new(SkiffPaths::with_root(temp.path()));
        (temp, store)
    }

    #[test]
    fn save_and_load_state() {
        let (_temp, store) = store();
        let mut web = descriptor(Some("web"));
        store.create(&web).unwrap();

        web.state.status = LifecycleState::Running;
        store.save(&web).unwrap();

        assert_eq!(store.load(&web.id).unwrap(), web);
        assert_eq!(store.load("web").unwrap().id, web.id);
        assert_eq!(store.load(&web.id[..12]).unwrap().id, web.id);
    }

    #[test]
    fn names_are_reserved() {
        let (_temp, store) = store();
        store.create(&descriptor(Some("web"))).unwrap();

        let err = store.create(&descriptor(Some("web"))).unwrap_err();
        assert!(matches!(err, SkiffError::Conflict { .. }));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn stale_reservations_are_reclaimed() {
        let (_temp, store) = store();
        fs::create_dir_all(store.paths().names()).unwrap();
        fs::write(store.paths().name_reservation("web"), "deadbeef").unwrap();

        store.create(&descriptor(Some("web"))).unwrap();
    }

    #[test]
    fn reservation_holds_before_state_is_written() {
        let (_temp, store) = store();
        let first = descriptor(Some("web"));
        store.reserve_name("web", &first.id).unwrap();

        let err = store.create(&descriptor(Some("web"))).unwrap_err();
        assert!(matches!(err, SkiffError::Conflict { .. }));

        store.create(&first).unwrap();
        assert_eq!(store.load("web").unwrap().id, first.id);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn losing_a_name_race_leaves_nothing_behind() {
        let (_temp, store) = store();
        store.create(&descriptor(Some("web"))).unwrap();

        let loser = descriptor(Some("web"));
        assert!(store.create(&loser).is_err());
        assert!(!store.paths().container(&loser.id).exists());
    }

    #[test]
    fn delete_state() {
        let (_temp, store) = store();
        let web = descriptor(Some("web"));
        store.create(&web).unwrap();

        store.delete(&web.id, Some("web")).unwrap();
        assert!(!store.exists(&web.id));
        assert!(matches!(
            store.load("web"),
            Err(SkiffError::ContainerNotFound { .. })
        ));

        // Saving after deletion does not resurrect the record.
        store.save(&web).unwrap();
        assert!(!store.exists(&web.id));
        store.create(&descriptor(Some("web"))).unwrap();
    }

    #[test]
    fn list_newest_first() {
        let (_temp, store) = store();
        let mut old = descriptor(None);
        old.created = Utc::now() - Duration::hours(1);
        let new = descriptor(None);
        store.create(&old).unwrap();
        store.create(&new).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![new.id, old.id]);
    }

    #[test]
    fn stop_requests() {
        let (_temp, store) = store();
        let web = descriptor(None);
        store.create(&web).unwrap();

        assert!(!store.take_stop_request(&web.id));
        store.request_stop(&web.id).unwrap();
        assert!(store.take_stop_request(&web.id));
        assert!(!store.take_stop_request(&web.id));
    }
}
