//! Container lifecycle management.
//!
//! [`LifecycleManager`] drives every container through
//! `Created → Running → Exited/Dead → (Running again | Removed)`:
//!
//! - transitions of one container are ordered by its operation lock
//! - process terminations arrive from the exit monitor as
//!   [`ExitReport`]s tagged with a generation, stale ones are dropped
//! - restarts are one-shot delayed tasks that re-check the generation
//!   before launching

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skiff_api::{ContainerDescriptor, LifecycleState};
use skiff_common::{ContainerId, SkiffError, SkiffResult};

use super::config::RuntimeConfig;
use super::container::{Container, Settlement, Transition};
use super::events::{EventBus, RuntimeEvent, now};
use super::lifecycle::LifecyclePhase;
use super::monitor::{self, ExitReport, ExitSink};
use super::registry::Registry;
use super::store::StateStore;
use crate::exec::{IsolationRuntime, SpawnRequest, StdioMode};
use crate::image::ImageResolver;
use crate::isolation::{self, NamespaceJoin};
use crate::restart::{RestartDecision, decide};
use crate::runspec::RunSpec;

/// Working directory used when neither the run request nor the image sets one.
const DEFAULT_WORKING_DIR: &str = "/";

/// Which containers [`LifecycleManager::list`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Include containers that are not running.
    pub all: bool,
}

impl ListFilter {
    /// Running containers only.
    #[must_use]
    pub const fn running() -> Self {
        Self { all: false }
    }

    /// Every container.
    #[must_use]
    pub const fn all() -> Self {
        Self { all: true }
    }
}

/// Result of [`LifecycleManager::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// The new container.
    pub id: ContainerId,
    /// Exit code of a foreground run; `None` for detached runs.
    pub exit_code: Option<i64>,
}

struct Shared {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    runtime: Arc<dyn IsolationRuntime>,
    images: Arc<dyn ImageResolver>,
    events: EventBus,
    store: Option<StateStore>,
}

/// Drives containers through their lifecycle.
#[derive(Clone)]
pub struct LifecycleManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("root", &self.shared.config.paths.root)
            .field("containers", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Create a manager with its own registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created.
    pub fn new(
        config: RuntimeConfig,
        runtime: Arc<dyn IsolationRuntime>,
        images: Arc<dyn ImageResolver>,
    ) -> SkiffResult<Self> {
        Self::with_registry(config, Arc::new(Registry::new()), runtime, images)
    }

    /// Create a manager around an existing registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directories cannot be created.
    pub fn with_registry(
        config: RuntimeConfig,
        registry: Arc<Registry>,
        runtime: Arc<dyn IsolationRuntime>,
        images: Arc<dyn ImageResolver>,
    ) -> SkiffResult<Self> {
        let store = if config.persist_state {
            config.paths.create_dirs()?;
            Some(StateStore::new(config.paths.clone()))
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry,
                runtime,
                images,
                events: EventBus::new(),
                store,
            }),
        })
    }

    /// The registry this manager owns.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Runtime events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Create a container from a run request.
    ///
    /// Nothing is registered if the isolation configuration is invalid.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] for invalid isolation settings and
    /// [`SkiffError::Conflict`] if the name is taken.
    pub fn create(&self, spec: RunSpec) -> SkiffResult<ContainerId> {
        self.register(spec).map(|container| container.id().clone())
    }

    fn register(&self, spec: RunSpec) -> SkiffResult<Arc<Container>> {
        let id = ContainerId::generate();
        let isolation = isolation::configure(&spec, &id)?;
        let container = Arc::new(Container::new(id.clone(), spec, isolation));

        self.shared.registry.insert(container.clone())?;
        if let Some(store) = &self.shared.store {
            if let Err(err) = store.create(&container.describe()) {
                self.shared.registry.remove(&id);
                return Err(err);
            }
        }

        tracing::info!(
            container_id = %id,
            name = container.name().map(|name| name.as_str()),
            image = %container.spec().image(),
            "Container created"
        );
        self.shared.events.publish(RuntimeEvent::ContainerCreated {
            id: id.to_string(),
            name: container.name().map(ToString::to_string),
            timestamp: now(),
        });

        Ok(container)
    }

    /// Start a created or terminated container.
    ///
    /// Returns once the process has been launched.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Conflict`] if the container is running and
    /// [`SkiffError::StartFailure`] if the launch fails; the container is
    /// then `Dead`.
    pub async fn start(&self, key: &str) -> SkiffResult<()> {
        let container = self.shared.registry.get(key)?;
        self.start_container(&container).await
    }

    async fn start_container(&self, container: &Arc<Container>) -> SkiffResult<()> {
        let _guard = container.lock().await;

        match container.state() {
            LifecycleState::Running => {
                return Err(SkiffError::conflict(format!(
                    "container {} is already running",
                    container.id()
                )));
            }
            LifecycleState::Removed => return Err(SkiffError::not_found(container.id().as_str())),
            _ => {}
        }

        container.cancel_restart();
        container.clear_stop_request();
        if let Some(store) = &self.shared.store {
            let _ = store.take_stop_request(container.id().as_str());
        }

        self.launch(container).await
    }

    /// Create and start a container.
    ///
    /// Foreground runs return once the container has settled, with its exit
    /// code. Detached runs return as soon as the process is running.
    ///
    /// # Errors
    ///
    /// Returns any error of [`create`](Self::create) or
    /// [`start`](Self::start).
    pub async fn run(&self, spec: RunSpec) -> SkiffResult<RunOutcome> {
        let detach = spec.detach();
        let container = self.register(spec)?;
        let id = container.id().clone();

        self.start_container(&container).await?;

        if detach {
            return Ok(RunOutcome { id, exit_code: None });
        }

        wait_settled(&container).await;
        Ok(RunOutcome {
            id,
            exit_code: container.record().exit_code,
        })
    }

    /// Wait until a container has settled and return its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] for unknown containers.
    pub async fn wait(&self, key: &str) -> SkiffResult<Option<i64>> {
        let container = self.shared.registry.get(key)?;
        wait_settled(&container).await;
        Ok(container.record().exit_code)
    }

    /// Stop a container.
    ///
    /// Delivers `signal` (default from the configuration), waits up to
    /// `timeout` and escalates to `SIGKILL`. A container that is not
    /// running has any pending restart cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] for unknown containers and
    /// [`SkiffError::Internal`] if the process survives `SIGKILL`.
    pub async fn stop(
        &self,
        key: &str,
        signal: Option<i32>,
        timeout: Option<Duration>,
    ) -> SkiffResult<()> {
        let container = self.shared.registry.get(key)?;
        let signal = signal.unwrap_or(self.shared.config.stop_signal);
        let timeout = timeout.unwrap_or(self.shared.config.stop_timeout);
        self.terminate(&container, signal, timeout).await
    }

    async fn terminate(
        &self,
        container: &Arc<Container>,
        signal: i32,
        timeout: Duration,
    ) -> SkiffResult<()> {
        let mut transitions = container.subscribe();

        let target = {
            let _guard = container.lock().await;
            let target = container.request_stop();
            if let Some((pid, _)) = target {
                tracing::info!(container_id = %container.id(), pid, signal, "Stopping container");
                self.shared.runtime.signal(pid, signal)?;
            }
            self.persist(container);
            target
        };

        self.shared.events.publish(RuntimeEvent::ContainerStopped {
            id: container.id().to_string(),
            timestamp: now(),
        });

        let Some((pid, generation)) = target else {
            return Ok(());
        };

        let exited = move |transition: &Transition| transition.has_left(generation);

        if tokio::time::timeout(timeout, transitions.wait_for(exited))
            .await
            .is_ok()
        {
            return Ok(());
        }

        tracing::warn!(
            container_id = %container.id(),
            pid,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Container did not stop in time, killing"
        );
        self.shared.runtime.kill(pid)?;

        if tokio::time::timeout(self.shared.config.kill_grace, transitions.wait_for(exited))
            .await
            .is_ok()
        {
            return Ok(());
        }

        Err(SkiffError::internal(format!(
            "container {} did not exit after SIGKILL",
            container.id()
        )))
    }

    /// Remove a container.
    ///
    /// Unknown and already removed containers are not an error. A running
    /// container is only removed with `force`, after being killed.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Conflict`] if the container is running and
    /// `force` is not set.
    pub async fn remove(&self, key: &str, force: bool) -> SkiffResult<()> {
        let container = match self.shared.registry.get(key) {
            Ok(container) => container,
            Err(SkiffError::ContainerNotFound { .. }) => {
                tracing::debug!(key = %key, "Nothing to remove");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        {
            let _guard = container.lock().await;
            if !container.state().is_running() {
                self.erase(&container);
                return Ok(());
            }
            if !force {
                return Err(SkiffError::conflict(format!(
                    "cannot remove running container {}: stop the container before removing or force remove",
                    container.id()
                )));
            }
        }

        self.terminate(&container, libc::SIGKILL, self.shared.config.kill_grace)
            .await?;

        let _guard = container.lock().await;
        if container.state().is_running() {
            return Err(SkiffError::conflict(format!(
                "container {} was restarted during removal",
                container.id()
            )));
        }
        self.erase(&container);
        Ok(())
    }

    /// Describe a container.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ContainerNotFound`] for unknown containers.
    pub fn inspect(&self, key: &str) -> SkiffResult<ContainerDescriptor> {
        Ok(self.shared.registry.get(key)?.describe())
    }

    /// Describe containers, newest first.
    #[must_use]
    pub fn list(&self, filter: ListFilter) -> Vec<ContainerDescriptor> {
        self.shared
            .registry
            .snapshot()
            .into_iter()
            .map(|container| container.describe())
            .filter(|descriptor| {
                descriptor.state.status != LifecycleState::Removed
                    && (filter.all || descriptor.state.running)
            })
            .collect()
    }

    /// Launch the container's process. The caller holds the operation lock.
    async fn launch(&self, container: &Arc<Container>) -> SkiffResult<()> {
        let request = match self.prepare(container) {
            Ok(request) => request,
            Err((phase, err)) => return Err(self.start_failed(container, phase, &err)),
        };
        let command = request.args.clone();

        let process = match self.shared.runtime.spawn(request).await {
            Ok(process) => process,
            Err(err) => return Err(self.start_failed(container, LifecyclePhase::Process, &err)),
        };

        let generation = container.mark_running(process.pid, command);
        let sink: Arc<dyn ExitSink> = Arc::new(self.clone());
        monitor::spawn(
            sink,
            container.id().clone(),
            generation,
            process.pid,
            process.exit,
        );

        tracing::info!(
            container_id = %container.id(),
            pid = process.pid,
            generation,
            "Container started"
        );
        self.persist(container);
        self.shared.events.publish(RuntimeEvent::ContainerStarted {
            id: container.id().to_string(),
            pid: process.pid,
            generation,
            timestamp: now(),
        });

        Ok(())
    }

    fn prepare(&self, container: &Container) -> Result<SpawnRequest, (LifecyclePhase, SkiffError)> {
        let spec = container.spec();

        let image = self
            .shared
            .images
            .resolve(spec.image())
            .map_err(|err| (LifecyclePhase::Image, err))?;

        let joins = self
            .namespace_joins(container)
            .map_err(|err| (LifecyclePhase::Namespaces, err))?;

        let args = if spec.command().is_empty() {
            image.cmd.clone()
        } else {
            spec.command().to_vec()
        };
        if args.is_empty() {
            return Err((
                LifecyclePhase::Command,
                SkiffError::validation(format!(
                    "no command specified and image {} has no default command",
                    image.reference
                )),
            ));
        }

        let env = merge_env(&image.env, spec.env());
        let working_dir = spec
            .working_dir()
            .map(ToString::to_string)
            .or_else(|| image.working_dir.clone())
            .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string());

        let stdio = match (&self.shared.store, spec.detach()) {
            (Some(store), true) => {
                let id = container.id().as_str();
                StdioMode::Log {
                    stdout: store.paths().container_log(id, "stdout"),
                    stderr: store.paths().container_log(id, "stderr"),
                }
            }
            _ => StdioMode::Inherit,
        };

        Ok(SpawnRequest {
            container_id: container.id().clone(),
            rootfs: image.rootfs,
            args,
            env,
            working_dir,
            isolation: container.isolation().clone(),
            joins,
            stdio,
        })
    }

    /// Resolve `container:<ref>` namespace targets to the target's process.
    fn namespace_joins(&self, container: &Container) -> SkiffResult<Vec<NamespaceJoin>> {
        let mut joins = Vec::new();

        for (kind, target) in container.isolation().namespaces.shared() {
            let pid = match self.shared.registry.get(target) {
                Ok(other) if other.id() == container.id() => None,
                Ok(other) => {
                    let record = other.record();
                    record.pid.filter(|_| record.state.is_running())
                }
                Err(SkiffError::ContainerNotFound { .. }) => {
                    let descriptor = match &self.shared.store {
                        Some(store) => store.load(target)?,
                        None => return Err(SkiffError::not_found(target)),
                    };
                    descriptor.state.pid.filter(|_| descriptor.state.running)
                }
                Err(err) => return Err(err),
            };

            let Some(pid) = pid else {
                return Err(SkiffError::conflict(format!(
                    "cannot join {} namespace of container {target}: container is not running",
                    kind.proc_name()
                )));
            };

            tracing::debug!(
                container_id = %container.id(),
                target = %target,
                pid,
                namespace = kind.proc_name(),
                "Joining namespace"
            );
            joins.push(NamespaceJoin::of_process(kind, pid));
        }

        Ok(joins)
    }

    fn start_failed(
        &self,
        container: &Container,
        phase: LifecyclePhase,
        err: &SkiffError,
    ) -> SkiffError {
        let reason = format!("{phase}: {err}");
        container.mark_start_failed(&reason);

        tracing::warn!(container_id = %container.id(), reason = %reason, "Container failed to start");
        self.shared.events.publish(RuntimeEvent::ContainerStartFailed {
            id: container.id().to_string(),
            reason: reason.clone(),
            timestamp: now(),
        });

        if container.spec().auto_remove() {
            self.erase(container);
        } else {
            self.persist(container);
        }

        SkiffError::StartFailure {
            id: container.id().to_string(),
            reason,
        }
    }

    /// Restart after a backoff delay, unless the restart was cancelled or
    /// another process instance took over in the meantime.
    async fn restart(&self, container: Arc<Container>, generation: u64, delay: Duration) {
        tokio::time::sleep(delay).await;

        let _guard = container.lock().await;
        if let Some(store) = &self.shared.store {
            let id = container.id().as_str();
            if !store.exists(id) && container.cancel_restart() {
                // Removed by another process while the restart was pending.
                self.shared.registry.remove(container.id());
                container.mark_removed();
                tracing::info!(container_id = %id, "Container removed externally, restart cancelled");
                self.shared.events.publish(RuntimeEvent::ContainerRemoved {
                    id: id.to_string(),
                    timestamp: now(),
                });
                return;
            }
            if store.take_stop_request(id) && container.cancel_restart() {
                tracing::info!(container_id = %container.id(), "Restart cancelled by stop request");
                self.persist(&container);
                return;
            }
        }
        if !container.begin_restart(generation) {
            tracing::debug!(container_id = %container.id(), generation, "Restart cancelled");
            return;
        }

        tracing::info!(
            container_id = %container.id(),
            restart_count = container.record().restart_count,
            "Restarting container"
        );
        if let Err(err) = self.launch(&container).await {
            tracing::warn!(container_id = %container.id(), error = %err, "Restart failed");
        }
    }

    /// Erase a container. The caller holds the operation lock.
    fn erase(&self, container: &Container) {
        self.shared.registry.remove(container.id());
        container.mark_removed();
        self.delete_state(container);
    }

    fn delete_state(&self, container: &Container) {
        if let Some(store) = &self.shared.store {
            let name = container.name().map(|name| name.as_str());
            if let Err(err) = store.delete(container.id().as_str(), name) {
                tracing::warn!(container_id = %container.id(), error = %err, "Failed to delete container state");
            }
        }

        tracing::info!(container_id = %container.id(), "Container removed");
        self.shared.events.publish(RuntimeEvent::ContainerRemoved {
            id: container.id().to_string(),
            timestamp: now(),
        });
    }

    fn persist(&self, container: &Container) {
        if let Some(store) = &self.shared.store {
            if let Err(err) = store.save(&container.describe()) {
                tracing::warn!(container_id = %container.id(), error = %err, "Failed to save container state");
            }
        }
    }
}

#[async_trait]
impl ExitSink for LifecycleManager {
    async fn process_terminated(&self, report: ExitReport) {
        let Some(container) = self.shared.registry.get_by_id(&report.container_id) else {
            tracing::debug!(container_id = %report.container_id, "Exit of unknown container ignored");
            return;
        };

        let _guard = container.lock().await;
        let Some(mut exit) = container.exit_record(report.generation, &report.status) else {
            tracing::debug!(
                container_id = %report.container_id,
                generation = report.generation,
                "Stale exit report ignored"
            );
            return;
        };

        let mut deleted = false;
        if let Some(store) = &self.shared.store {
            let id = container.id().as_str();
            // Another process may have stopped or deleted the container.
            deleted = !store.exists(id);
            if store.take_stop_request(id) || deleted {
                exit.stop_requested = true;
            }
        }

        tracing::info!(
            container_id = %container.id(),
            pid = report.pid,
            exit_code = exit.exit_code,
            generation = exit.generation,
            "Container exited"
        );
        self.shared.events.publish(RuntimeEvent::ContainerDied {
            id: container.id().to_string(),
            exit_code: exit.exit_code,
            timestamp: now(),
        });

        let spec = container.spec();
        let decision = decide(
            spec.restart_policy(),
            exit.exit_code,
            exit.stop_requested,
            exit.restart_count,
        );

        match decision {
            RestartDecision::Restart => {
                container.finish(&exit, Settlement::Restart);
                self.persist(&container);

                let delay = self.shared.config.backoff.delay(exit.restart_count, exit.ran_for);
                tracing::info!(
                    container_id = %container.id(),
                    policy = %spec.restart_policy(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling restart"
                );
                self.shared.events.publish(RuntimeEvent::ContainerRestarting {
                    id: container.id().to_string(),
                    restart_count: exit.restart_count + 1,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    timestamp: now(),
                });

                let manager = self.clone();
                let target = container.clone();
                let generation = exit.generation;
                tokio::spawn(async move { manager.restart(target, generation, delay).await });
            }
            RestartDecision::Stay if deleted => {
                self.shared.registry.remove(container.id());
                container.finish(&exit, Settlement::Remove);
                tracing::info!(container_id = %container.id(), "Container removed externally");
                self.shared.events.publish(RuntimeEvent::ContainerRemoved {
                    id: container.id().to_string(),
                    timestamp: now(),
                });
            }
            RestartDecision::Stay if spec.auto_remove() => {
                self.shared.registry.remove(container.id());
                container.finish(&exit, Settlement::Remove);
                self.delete_state(&container);
            }
            RestartDecision::Stay => {
                container.finish(&exit, Settlement::Stay);
                self.persist(&container);
            }
        }
    }
}

async fn wait_settled(container: &Container) {
    let mut transitions = container.subscribe();
    // The sender lives as long as the container.
    let _ = transitions.wait_for(Transition::is_settled).await;
}

/// Image environment overridden key by key by the run request.
fn merge_env(image: &[String], overrides: &[String]) -> Vec<String> {
    let key = |entry: &str| entry.split_once('=').map_or(entry, |(key, _)| key).to_string();

    let mut env: Vec<String> = image
        .iter()
        .filter(|entry| !overrides.iter().any(|o| key(o) == key(entry)))
        .cloned()
        .collect();
    env.extend(overrides.iter().cloned());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_image_defaults() {
        let image = vec!["PATH=/bin".to_string(), "HOME=/root".to_string()];
        let overrides = vec!["HOME=/tmp".to_string(), "A=1".to_string()];
        assert_eq!(
            merge_env(&image, &overrides),
            vec!["PATH=/bin", "HOME=/tmp", "A=1"]
        );
    }

    #[test]
    fn list_filters() {
        assert!(!ListFilter::running().all);
        assert!(ListFilter::all().all);
        assert_eq!(ListFilter::default(), ListFilter::running());
    }
}
