//! Container entities.
//!
//! A [`Container`] owns its run request, its isolation configuration and a
//! [`ContainerRecord`] with everything that changes over its lifetime. The
//! record is only mutated by the lifecycle manager while it holds the
//! container's operation lock; readers take a short read lock and clone.
//!
//! Every visible change is also published as a [`Transition`] on a watch
//! channel, which is what `stop` and `wait` block on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use skiff_api::{
    ConfigDescriptor, ContainerDescriptor, HostConfigDescriptor, LifecycleState, StateDescriptor,
};
use skiff_common::{ContainerId, ContainerName};
use tokio::sync::{Mutex, MutexGuard, watch};

use crate::exec::ExitStatus;
use crate::isolation::IsolationConfig;
use crate::runspec::RunSpec;

/// Exit code recorded when a container fails to start.
pub const START_FAILURE_EXIT_CODE: i64 = 128;

/// Mutable lifecycle data of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    /// Current state.
    pub state: LifecycleState,
    /// Pid of the current process.
    pub pid: Option<u32>,
    /// Command of the last launch.
    pub command: Vec<String>,
    /// Exit code of the last termination.
    pub exit_code: Option<i64>,
    /// Last start error.
    pub error: Option<String>,
    /// Policy restarts so far.
    pub restart_count: u32,
    /// Token of the current (or last) process instance.
    pub generation: u64,
    /// A stop was requested for the current run attempt.
    pub stop_requested: bool,
    /// A policy restart is scheduled.
    pub restart_pending: bool,
    /// Last start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Last finish time.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Published view of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after the change.
    pub state: LifecycleState,
    /// Generation after the change.
    pub generation: u64,
    /// Whether a policy restart is pending.
    pub restart_pending: bool,
}

impl Transition {
    /// Terminal with no restart pending.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.state.is_terminal() && !self.restart_pending
    }

    /// Returns true once the process of `generation` is no longer running.
    #[must_use]
    pub const fn has_left(&self, generation: u64) -> bool {
        self.generation != generation || !self.state.is_running()
    }
}

/// Facts about one process termination, taken before it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    /// Generation of the terminated process.
    pub generation: u64,
    /// Exit code to record.
    pub exit_code: i64,
    /// The process could not be reaped cleanly.
    pub dead: bool,
    /// A stop was requested for this run attempt.
    pub stop_requested: bool,
    /// Policy restarts before this termination.
    pub restart_count: u32,
    /// How long the process ran.
    pub ran_for: Duration,
}

/// Where a container goes after a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Terminal, with a policy restart scheduled.
    Restart,
    /// Terminal.
    Stay,
    /// Erased from the registry.
    Remove,
}

/// A container entity.
#[derive(Debug)]
pub struct Container {
    id: ContainerId,
    spec: Arc<RunSpec>,
    isolation: IsolationConfig,
    created: DateTime<Utc>,
    record: RwLock<ContainerRecord>,
    operations: Mutex<()>,
    transitions: watch::Sender<Transition>,
}

impl Container {
    /// Create a container in the `Created` state.
    #[must_use]
    pub fn new(id: ContainerId, spec: RunSpec, isolation: IsolationConfig) -> Self {
        let record = ContainerRecord {
            state: LifecycleState::Created,
            pid: None,
            command: spec.command().to_vec(),
            exit_code: None,
            error: None,
            restart_count: 0,
            generation: 0,
            stop_requested: false,
            restart_pending: false,
            started_at: None,
            finished_at: None,
        };
        let (transitions, _) = watch::channel(Transition {
            state: LifecycleState::Created,
            generation: 0,
            restart_pending: false,
        });

        Self {
            id,
            spec: Arc::new(spec),
            isolation,
            created: Utc::now(),
            record: RwLock::new(record),
            operations: Mutex::new(()),
            transitions,
        }
    }

    /// Container ID.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Container name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&ContainerName> {
        self.spec.name()
    }

    /// The run request the container was created from.
    #[must_use]
    pub fn spec(&self) -> &Arc<RunSpec> {
        &self.spec
    }

    /// Isolation configuration.
    #[must_use]
    pub const fn isolation(&self) -> &IsolationConfig {
        &self.isolation
    }

    /// Creation time.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Take the operation lock that orders all transitions of this container.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.operations.lock().await
    }

    /// Snapshot of the record.
    #[must_use]
    pub fn record(&self) -> ContainerRecord {
        self.record.read().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.record.read().state
    }

    /// Watch published transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Build a descriptor from a consistent snapshot.
    #[must_use]
    pub fn describe(&self) -> ContainerDescriptor {
        let record = self.record();
        let spec = &self.spec;
        let security = spec.security();

        ContainerDescriptor {
            id: self.id.to_string(),
            name: self.name().map(ToString::to_string),
            image: spec.image().to_string(),
            created: self.created,
            restart_count: record.restart_count,
            config: ConfigDescriptor {
                image: spec.image().to_string(),
                cmd: record.command.clone(),
                env: spec.env().to_vec(),
                working_dir: spec.working_dir().map(ToString::to_string),
                hostname: self.isolation.hostname.clone(),
                spec_annotation: spec.annotations().clone(),
            },
            host_config: HostConfigDescriptor {
                ipc_mode: spec.ipc_mode().to_string(),
                uts_mode: spec.uts_mode().to_string(),
                privileged: security.privileged,
                cap_add: security.cap_add.clone(),
                cap_drop: security.cap_drop.clone(),
                security_opt: security.raw.clone(),
                sysctls: spec.sysctls().clone(),
                restart_policy: spec.restart_policy().descriptor(),
                auto_remove: spec.auto_remove(),
            },
            state: StateDescriptor {
                status: record.state,
                running: record.state.is_running(),
                restarting: record.restart_pending,
                dead: record.state == LifecycleState::Dead,
                pid: record.pid,
                exit_code: record.exit_code,
                error: record.error,
                started_at: record.started_at,
                finished_at: record.finished_at,
            },
        }
    }

    /// Record a launched process and return its generation.
    pub(crate) fn mark_running(&self, pid: u32, command: Vec<String>) -> u64 {
        let mut record = self.record.write();
        record.generation += 1;
        record.state = LifecycleState::Running;
        record.pid = Some(pid);
        record.command = command;
        record.error = None;
        record.restart_pending = false;
        record.started_at = Some(Utc::now());
        self.publish(&record);
        record.generation
    }

    /// Record a failed launch. The container becomes `Dead`.
    pub(crate) fn mark_start_failed(&self, reason: &str) {
        let mut record = self.record.write();
        record.state = LifecycleState::Dead;
        record.pid = None;
        record.exit_code = Some(START_FAILURE_EXIT_CODE);
        record.error = Some(reason.to_string());
        record.restart_pending = false;
        record.finished_at = Some(Utc::now());
        self.publish(&record);
    }

    /// Check a termination report against the current process.
    ///
    /// Returns `None` for reports about an earlier process instance.
    pub(crate) fn exit_record(&self, generation: u64, status: &ExitStatus) -> Option<ExitRecord> {
        let record = self.record.read();
        if record.generation != generation || !record.state.is_running() {
            return None;
        }

        let ran_for = record
            .started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
            .unwrap_or_default();

        Some(ExitRecord {
            generation,
            exit_code: status.exit_code(),
            dead: !status.was_reaped(),
            stop_requested: record.stop_requested,
            restart_count: record.restart_count,
            ran_for,
        })
    }

    /// Apply a termination and publish the result.
    pub(crate) fn finish(&self, exit: &ExitRecord, settlement: Settlement) {
        let mut record = self.record.write();
        record.state = match (settlement, exit.dead) {
            (Settlement::Remove, _) => LifecycleState::Removed,
            (_, true) => LifecycleState::Dead,
            (_, false) => LifecycleState::Exited,
        };
        record.pid = None;
        record.exit_code = Some(exit.exit_code);
        record.restart_pending = settlement == Settlement::Restart;
        record.finished_at = Some(Utc::now());
        self.publish(&record);
    }

    /// Claim a scheduled restart of `generation`.
    ///
    /// Fails if the restart was cancelled or superseded in the meantime.
    pub(crate) fn begin_restart(&self, generation: u64) -> bool {
        let mut record = self.record.write();
        if !record.restart_pending || record.generation != generation {
            return false;
        }
        record.restart_pending = false;
        record.restart_count += 1;
        true
    }

    /// Cancel a scheduled restart. Returns true if one was pending.
    pub(crate) fn cancel_restart(&self) -> bool {
        let mut record = self.record.write();
        if !record.restart_pending {
            return false;
        }
        record.restart_pending = false;
        self.publish(&record);
        true
    }

    /// Flag an explicit stop and cancel any scheduled restart.
    ///
    /// Returns the pid and generation to signal if a process is running.
    pub(crate) fn request_stop(&self) -> Option<(u32, u64)> {
        let mut record = self.record.write();
        record.stop_requested = true;
        if record.restart_pending {
            record.restart_pending = false;
            self.publish(&record);
        }
        match (record.state, record.pid) {
            (LifecycleState::Running, Some(pid)) => Some((pid, record.generation)),
            _ => None,
        }
    }

    /// Clear the stop flag ahead of an explicit start.
    pub(crate) fn clear_stop_request(&self) {
        self.record.write().stop_requested = false;
    }

    /// Mark the container removed.
    pub(crate) fn mark_removed(&self) {
        let mut record = self.record.write();
        record.state = LifecycleState::Removed;
        record.pid = None;
        record.restart_pending = false;
        self.publish(&record);
    }

    fn publish(&self, record: &ContainerRecord) {
        self.transitions.send_replace(Transition {
            state: record.state,
            generation: record.generation,
            restart_pending: record.restart_pending,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> Container {
        let spec = RunSpec::builder("busybox")
            .name("web")
            .command(["sh"])
            .annotation("a=b")
            .build()
            .unwrap();
        let id = ContainerId::generate();
        let isolation = crate::isolation::configure(&spec, &id).unwrap();
        Container::new(id, spec, isolation)
    }

    #[test]
    fn starts_created() {
        let container = container();
        let record = container.record();
        assert_eq!(record.state, LifecycleState::Created);
        assert!(record.exit_code.is_none());
        assert!(!container.subscribe().borrow().is_settled());
    }

    #[test]
    fn run_and_exit() {
        let container = container();
        let generation = container.mark_running(42, vec!["sh".to_string()]);
        assert_eq!(generation, 1);
        assert_eq!(container.state(), LifecycleState::Running);

        let exit = container
            .exit_record(generation, &ExitStatus::Exited(101))
            .unwrap();
        assert_eq!(exit.exit_code, 101);
        assert!(!exit.dead);

        container.finish(&exit, Settlement::Stay);
        let record = container.record();
        assert_eq!(record.state, LifecycleState::Exited);
        assert_eq!(record.exit_code, Some(101));
        assert!(record.pid.is_none());
        assert!(container.subscribe().borrow().is_settled());
    }

    #[test]
    fn stale_reports_are_ignored() {
        let container = container();
        let first = container.mark_running(1, Vec::new());
        let exit = container.exit_record(first, &ExitStatus::Exited(1)).unwrap();
        container.finish(&exit, Settlement::Restart);
        assert!(container.begin_restart(first));
        let second = container.mark_running(2, Vec::new());

        assert!(container.exit_record(first, &ExitStatus::Exited(0)).is_none());
        assert!(container.exit_record(second, &ExitStatus::Exited(0)).is_some());
        assert_eq!(container.record().restart_count, 1);
    }

    #[test]
    fn lost_process_is_dead() {
        let container = container();
        let generation = container.mark_running(7, Vec::new());
        let exit = container
            .exit_record(generation, &ExitStatus::Lost("gone".into()))
            .unwrap();
        container.finish(&exit, Settlement::Stay);
        assert_eq!(container.state(), LifecycleState::Dead);
    }

    #[test]
    fn stop_cancels_pending_restart() {
        let container = container();
        let generation = container.mark_running(3, Vec::new());
        let exit = container.exit_record(generation, &ExitStatus::Exited(1)).unwrap();
        container.finish(&exit, Settlement::Restart);
        assert!(container.record().restart_pending);

        assert!(container.request_stop().is_none());
        assert!(!container.begin_restart(generation));
        assert!(container.subscribe().borrow().is_settled());
    }

    #[test]
    fn start_failure() {
        let container = container();
        container.mark_start_failed("image: image busybox: not found");
        let descriptor = container.describe();
        assert_eq!(descriptor.state.status, LifecycleState::Dead);
        assert!(descriptor.state.dead);
        assert_eq!(descriptor.state.exit_code, Some(START_FAILURE_EXIT_CODE));
        assert!(descriptor.state.error.unwrap().contains("not found"));
    }

    #[test]
    fn descriptor_carries_annotations() {
        let descriptor = container().describe();
        assert_eq!(descriptor.name.as_deref(), Some("web"));
        assert_eq!(descriptor.config.spec_annotation["a"], "b");
        assert_eq!(descriptor.host_config.restart_policy.name, "no");
        assert_eq!(descriptor.host_config.ipc_mode, "private");
    }
}
