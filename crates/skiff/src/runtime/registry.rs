//! Container registry.
//!
//! The registry maps IDs and names to container entities. It is the only
//! structure shared by every container; each access takes the lock briefly
//! and hands out `Arc<Container>` clones.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use skiff_common::{ContainerId, SkiffError, SkiffResult};

use super::container::Container;

#[derive(Debug, Default)]
struct Entries {
    containers: HashMap<ContainerId, Arc<Container>>,
    names: HashMap<String, ContainerId>,
}

/// In-memory registry of containers.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<Entries>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Conflict`] if its ID or name is already taken.
    pub fn insert(&self, container: Arc<Container>) -> SkiffResult<()> {
        let mut entries = self.entries.write();

        if entries.containers.contains_key(container.id()) {
            return Err(SkiffError::conflict(format!(
                "container id {} is already in use",
                container.id()
            )));
        }

        if let Some(name) = container.name() {
            if let Some(owner) = entries.names.get(name.as_str()) {
                return Err(SkiffError::conflict(format!(
                    "container name \"{name}\" is already in use by container {owner}"
                )));
            }
            entries
                .names
                .insert(name.as_str().to_string(), container.id().clone());
        }

        entries
            .containers
            .insert(container.id().clone(), container);
        Ok(())
    }

    /// Look up a container by full ID, name or unambiguous ID prefix.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] if nothing matches and
    /// [`SkiffError::Conflict`] if a prefix matches several containers.
    pub fn get(&self, key: &str) -> SkiffResult<Arc<Container>> {
        let key = key.strip_prefix('/').unwrap_or(key);
        let entries = self.entries.read();

        if let Some(container) = entries.containers.get(key) {
            return Ok(container.clone());
        }

        if let Some(container) = entries
            .names
            .get(key)
            .and_then(|id| entries.containers.get(id))
        {
            return Ok(container.clone());
        }

        if key.is_empty() {
            return Err(SkiffError::not_found(key));
        }

        let mut matches = entries
            .containers
            .iter()
            .filter(|(id, _)| id.as_str().starts_with(key));

        match (matches.next(), matches.next()) {
            (Some((_, container)), None) => Ok(container.clone()),
            (None, _) => Err(SkiffError::not_found(key)),
            (Some(_), Some(_)) => Err(SkiffError::conflict(format!(
                "multiple containers match id prefix {key}"
            ))),
        }
    }

    /// Look up a container by exact ID.
    #[must_use]
    pub fn get_by_id(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.entries.read().containers.get(id).cloned()
    }

    /// Erase a container and release its name.
    pub fn remove(&self, id: &ContainerId) -> Option<Arc<Container>> {
        let mut entries = self.entries.write();
        let container = entries.containers.remove(id)?;
        if let Some(name) = container.name() {
            entries.names.remove(name.as_str());
        }
        Some(container)
    }

    /// All containers, newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Container>> {
        let mut containers: Vec<_> = self.entries.read().containers.values().cloned().collect();
        containers.sort_by(|a, b| b.created().cmp(&a.created()).then_with(|| a.id().cmp(b.id())));
        containers
    }

    /// Number of registered containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().containers.len()
    }

    /// Returns true if no container is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runspec::RunSpec;

    fn container(name: Option<&str>) -> Arc<Container> {
        let mut builder = RunSpec::builder("busybox");
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let spec = builder.build().unwrap();
        let id = ContainerId::generate();
        let isolation = crate::isolation::configure(&spec, &id).unwrap();
        Arc::new(Container::new(id, spec, isolation))
    }

    #[test]
    fn lookup_by_id_name_and_prefix() {
        let registry = Registry::new();
        let web = container(Some("web"));
        registry.insert(web.clone()).unwrap();

        assert_eq!(registry.get(web.id().as_str()).unwrap().id(), web.id());
        assert_eq!(registry.get("web").unwrap().id(), web.id());
        assert_eq!(registry.get("/web").unwrap().id(), web.id());
        assert_eq!(registry.get(web.id().short()).unwrap().id(), web.id());
    }

    #[test]
    fn duplicate_names_conflict() {
        let registry = Registry::new();
        registry.insert(container(Some("web"))).unwrap();

        let err = registry.insert(container(Some("web"))).unwrap_err();
        assert!(matches!(err, SkiffError::Conflict { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_container() {
        let registry = Registry::new();
        let err = registry.get("nope").unwrap_err();
        assert_eq!(err.to_string(), "container nope: not found");
        assert!(matches!(registry.get(""), Err(SkiffError::ContainerNotFound { .. })));
    }

    #[test]
    fn remove_releases_name() {
        let registry = Registry::new();
        let web = container(Some("web"));
        registry.insert(web.clone()).unwrap();

        assert!(registry.remove(web.id()).is_some());
        assert!(registry.remove(web.id()).is_none());
        assert!(registry.is_empty());
        registry.insert(container(Some("web"))).unwrap();
    }

    #[test]
    fn snapshot_lists_everything() {
        let registry = Registry::new();
        for _ in 0..3 {
            registry.insert(container(None)).unwrap();
        }
        assert_eq!(registry.snapshot().len(), 3);
    }
}
