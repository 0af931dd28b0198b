//! Shared test fixtures: a scripted isolation runtime and a manager wired
//! to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff::exec::{ExitStatus, IsolationRuntime, SpawnRequest, SpawnedProcess};
use skiff::image::{ImageConfig, LocalImageStore};
use skiff::restart::BackoffPolicy;
use skiff::runspec::RunSpecBuilder;
use skiff::runtime::{LifecycleManager, RuntimeConfig};
use skiff::RunSpec;
use skiff_common::{SkiffError, SkiffResult};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// What a fake process does, derived from its command line.
enum Script {
    /// Exit immediately with a code.
    Exit(i32),
    /// Vanish without an exit status.
    Lost,
    /// Run until signalled.
    LongRunning { ignores_term: bool },
    /// The executable does not exist.
    Missing,
}

fn script(args: &[String]) -> Script {
    match args.first().map(String::as_str) {
        Some("missing") => Script::Missing,
        Some("crash") => Script::Lost,
        Some("sleep" | "top") => Script::LongRunning { ignores_term: false },
        Some("trap") => Script::LongRunning { ignores_term: true },
        Some("false") => Script::Exit(1),
        Some("sh") if args.get(1).map(String::as_str) == Some("-c") => args
            .get(2)
            .and_then(|body| body.trim().strip_prefix("exit "))
            .and_then(|code| code.trim().parse().ok())
            .map_or(Script::Exit(0), Script::Exit),
        _ => Script::Exit(0),
    }
}

struct Process {
    exit: oneshot::Sender<ExitStatus>,
    ignores_term: bool,
}

/// Isolation runtime that pretends to run processes.
///
/// - `sh -c "exit N"` exits with `N`, any other command exits 0
/// - `sleep`/`top` run until signalled, `trap` also ignores `SIGTERM`
/// - `crash` is lost without an exit status
/// - `missing` fails to spawn
#[derive(Default)]
pub struct FakeRuntime {
    next_pid: AtomicU32,
    processes: Mutex<HashMap<u32, Process>>,
    spawned: Mutex<Vec<SpawnRequest>>,
    signals: Mutex<Vec<(u32, i32)>>,
}

impl FakeRuntime {
    /// Every request that produced a process.
    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().clone()
    }

    /// Number of processes launched.
    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().len()
    }

    /// Signals delivered, in order.
    pub fn signals(&self) -> Vec<(u32, i32)> {
        self.signals.lock().clone()
    }

    /// Terminate a running fake process as if it exited by itself.
    pub fn exit(&self, pid: u32, code: i32) {
        if let Some(process) = self.processes.lock().remove(&pid) {
            let _ = process.exit.send(ExitStatus::Exited(code));
        }
    }
}

#[async_trait]
impl IsolationRuntime for FakeRuntime {
    async fn spawn(&self, request: SpawnRequest) -> SkiffResult<SpawnedProcess> {
        let script = script(&request.args);
        if matches!(script, Script::Missing) {
            return Err(SkiffError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("exec {}: No such file or directory", request.args[0]),
            )));
        }

        self.spawned.lock().push(request);
        let pid = 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (sender, exit) = oneshot::channel();

        match script {
            Script::Exit(code) => {
                let _ = sender.send(ExitStatus::Exited(code));
            }
            Script::Lost => drop(sender),
            Script::LongRunning { ignores_term } => {
                self.processes.lock().insert(
                    pid,
                    Process {
                        exit: sender,
                        ignores_term,
                    },
                );
            }
            Script::Missing => unreachable!(),
        }

        Ok(SpawnedProcess { pid, exit })
    }

    fn signal(&self, pid: u32, signal: i32) -> SkiffResult<()> {
        self.signals.lock().push((pid, signal));

        let mut processes = self.processes.lock();
        let ignored = processes
            .get(&pid)
            .is_none_or(|process| process.ignores_term && signal == libc::SIGTERM);
        if ignored {
            return Ok(());
        }

        if let Some(process) = processes.remove(&pid) {
            let _ = process.exit.send(ExitStatus::Signaled(signal));
        }
        Ok(())
    }
}

/// A manager on a temporary root with a fake runtime.
pub struct Harness {
    pub temp: TempDir,
    pub runtime: Arc<FakeRuntime>,
    pub manager: LifecycleManager,
}

impl Harness {
    /// State kept in memory only.
    pub fn new() -> Self {
        Self::configured(RuntimeConfig::in_memory)
    }

    /// State mirrored under the temporary root.
    pub fn persistent() -> Self {
        Self::configured(|config| config)
    }

    /// A manager whose configuration is adjusted by `configure`.
    pub fn configured(configure: impl FnOnce(RuntimeConfig) -> RuntimeConfig) -> Self {
        let temp = TempDir::new().unwrap();
        let config = configure(
            RuntimeConfig::default()
                .with_root(temp.path())
                .with_backoff(BackoffPolicy {
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(5),
                    reset_after: Duration::from_secs(10),
                })
                .with_stop_timeout(Duration::from_millis(500))
                .with_kill_grace(Duration::from_secs(2)),
        );

        let images = LocalImageStore::new(config.paths.images());
        images
            .register(
                "busybox",
                &ImageConfig {
                    cmd: vec!["sh".to_string()],
                    env: vec!["PATH=/bin".to_string()],
                    ..ImageConfig::default()
                },
            )
            .unwrap();
        images.register("scratch", &ImageConfig::default()).unwrap();

        let runtime = Arc::new(FakeRuntime::default());
        let manager = LifecycleManager::new(config, runtime.clone(), Arc::new(images)).unwrap();

        Self {
            temp,
            runtime,
            manager,
        }
    }
}

/// A busybox run request running `command`.
pub fn busybox<I, S>(command: I) -> RunSpecBuilder
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    RunSpec::builder("busybox").command(command)
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
