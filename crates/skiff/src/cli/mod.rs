//! CLI command definitions and handlers.
//!
//! `run` drives a [`LifecycleManager`] in this process. Every other command
//! works on the state mirror under `--root`, so it can act on containers
//! owned by a detached supervisor.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use skiff_api::{ContainerDescriptor, LifecycleState};
use skiff_common::{SkiffError, SkiffResult};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::exec::{IsolationRuntime, NativeRuntime, parse_signal, process_exists};
use crate::image::{ImageResolver, LocalImageStore};
use crate::runspec::RunSpec;
use crate::runtime::{LifecycleManager, ListFilter, RuntimeConfig, StateStore};

/// Exit status for errors raised by skiff itself rather than the container.
pub const EXIT_MANAGER_ERROR: i32 = 125;

/// Exit status for lookups that found nothing.
const EXIT_NOT_FOUND: i32 = 1;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Skiff - Container Lifecycle Manager
#[derive(Parser)]
#[command(name = "skiff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for skiff data
    #[arg(
        long,
        global = true,
        env = "SKIFF_ROOT",
        default_value = "/var/lib/skiff"
    )]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Skiff commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create and start a container
    Run(RunArgs),

    /// List containers
    Ps {
        /// Show all containers (default shows just running)
        #[arg(short, long)]
        all: bool,

        /// Only display container IDs
        #[arg(short, long)]
        quiet: bool,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Display detailed information on containers
    Inspect {
        /// Container IDs or names
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Remove containers
    Rm {
        /// Kill and remove running containers
        #[arg(short, long)]
        force: bool,

        /// Container IDs or names
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// Stop running containers
    Stop {
        /// Seconds to wait before killing the container
        #[arg(short, long, default_value = "10")]
        time: u64,

        /// Signal to send
        #[arg(short, long, default_value = "SIGTERM")]
        signal: String,

        /// Container IDs or names
        #[arg(required = true)]
        containers: Vec<String>,
    },

    /// List images
    Images {
        /// Only show image IDs
        #[arg(short, long)]
        quiet: bool,
    },

    /// Fetch the logs of a detached container
    Logs {
        /// Container ID or name
        container: String,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,
    },
}

/// Options of `skiff run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Assign a name to the container
    #[arg(long)]
    pub name: Option<String>,

    /// Run the container in the background and print its ID
    #[arg(short, long)]
    pub detach: bool,

    /// Remove the container when it exits
    #[arg(long = "rm")]
    pub auto_remove: bool,

    /// Restart policy (no, always, on-failure[:N], unless-stopped)
    #[arg(long, default_value = "no")]
    pub restart: String,

    /// IPC namespace (private, host, container:<name|id>)
    #[arg(long)]
    pub ipc: Option<String>,

    /// UTS namespace (private, host, container:<name|id>)
    #[arg(long)]
    pub uts: Option<String>,

    /// Security options (apparmor=, seccomp=, no-new-privileges)
    #[arg(long = "security-opt")]
    pub security_opt: Vec<String>,

    /// Add Linux capabilities
    #[arg(long = "cap-add")]
    pub cap_add: Vec<String>,

    /// Drop Linux capabilities
    #[arg(long = "cap-drop")]
    pub cap_drop: Vec<String>,

    /// Give extended privileges to the container
    #[arg(long)]
    pub privileged: bool,

    /// Sysctl options (key=value)
    #[arg(long)]
    pub sysctl: Vec<String>,

    /// Annotations (key=value)
    #[arg(long)]
    pub annotation: Vec<String>,

    /// Environment variables (KEY=VALUE)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Container hostname
    #[arg(long)]
    pub hostname: Option<String>,

    /// Run as the supervisor of a detached container
    #[arg(long, hide = true)]
    pub supervised: bool,

    /// Image to run
    pub image: String,

    /// Command and arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Build the run request.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Validation`] for malformed options.
    pub fn to_spec(&self) -> SkiffResult<RunSpec> {
        let mut builder = RunSpec::builder(&self.image)
            .command(&self.command)
            .restart(&self.restart)
            .privileged(self.privileged)
            .auto_remove(self.auto_remove)
            .detach(self.detach);

        if let Some(name) = &self.name {
            builder = builder.name(name);
        }
        if let Some(ipc) = &self.ipc {
            builder = builder.ipc(ipc);
        }
        if let Some(uts) = &self.uts {
            builder = builder.uts(uts);
        }
        if let Some(workdir) = &self.workdir {
            builder = builder.working_dir(workdir);
        }
        if let Some(hostname) = &self.hostname {
            builder = builder.hostname(hostname);
        }
        for entry in &self.env {
            builder = builder.env(entry);
        }
        for option in &self.security_opt {
            builder = builder.security_opt(option);
        }
        for cap in &self.cap_add {
            builder = builder.cap_add(cap);
        }
        for cap in &self.cap_drop {
            builder = builder.cap_drop(cap);
        }
        for entry in &self.sysctl {
            builder = builder.sysctl(entry);
        }
        for entry in &self.annotation {
            builder = builder.annotation(entry);
        }

        builder.build()
    }
}

impl Cli {
    /// Execute the CLI command and return the process exit status.
    ///
    /// # Errors
    ///
    /// Returns an error for failures outside the container lifecycle, such
    /// as an unreadable log file.
    pub async fn execute(self) -> Result<i32> {
        let config = RuntimeConfig::default().with_root(self.root.clone());
        let store = StateStore::new(config.paths.clone());

        match self.command {
            Commands::Run(args) => run(config, args).await,
            Commands::Ps { all, quiet, format } => Ok(report(ps(&store, all, quiet, &format))),
            Commands::Inspect { containers } => inspect(&store, &containers),
            Commands::Rm { force, containers } => {
                Ok(report(remove(&config, &store, &containers, force).await))
            }
            Commands::Stop {
                time,
                signal,
                containers,
            } => Ok(report(
                stop(&config, &store, &containers, &signal, Duration::from_secs(time)).await,
            )),
            Commands::Images { quiet } => Ok(report(images(&config, quiet))),
            Commands::Logs { container, follow } => logs(&store, &container, follow).await,
        }
    }
}

/// Print a manager error and map it to an exit status.
fn report(result: SkiffResult<i32>) -> i32 {
    result.unwrap_or_else(|err| {
        eprintln!("{:?}", miette::Report::new(err));
        EXIT_MANAGER_ERROR
    })
}

fn manager(config: RuntimeConfig) -> SkiffResult<LifecycleManager> {
    let runtime = Arc::new(NativeRuntime::new(config.paths.clone()));
    let images = Arc::new(LocalImageStore::new(config.paths.images()));
    LifecycleManager::new(config, runtime, images)
}

async fn run(config: RuntimeConfig, args: RunArgs) -> Result<i32> {
    let spec = match args.to_spec() {
        Ok(spec) => spec,
        Err(err) => return Ok(report(Err(err))),
    };

    if spec.detach() && !args.supervised {
        return spawn_supervisor();
    }

    let manager = match manager(config) {
        Ok(manager) => manager,
        Err(err) => return Ok(report(Err(err))),
    };

    if args.supervised {
        return Ok(report(supervise(&manager, spec).await));
    }

    let run = manager.run(spec);
    tokio::pin!(run);

    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping container");
            stop_all(&manager).await;
            run.await
        }
    };

    Ok(report(outcome.map(|outcome| {
        outcome
            .exit_code
            .and_then(|code| i32::try_from(code).ok())
            .filter(|code| (0..=255).contains(code))
            .unwrap_or(EXIT_MANAGER_ERROR)
    })))
}

async fn stop_all(manager: &LifecycleManager) {
    let running = manager.list(ListFilter::running());
    let stops = running
        .iter()
        .map(|container| manager.stop(&container.id, None, None));

    for (container, result) in running.iter().zip(futures::future::join_all(stops).await) {
        if let Err(err) = result {
            tracing::warn!(container_id = %container.id, error = %err, "Failed to stop container");
        }
    }
}

/// Re-execute as a supervisor in its own process group and report the
/// container ID it prints.
fn spawn_supervisor() -> Result<i32> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let mut args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let position = args
        .iter()
        .position(|arg| arg == "run")
        .map_or(0, |idx| idx + 1);
    args.insert(position, OsString::from("--supervised"));

    let current_exe = std::env::current_exe().wrap_err("Failed to resolve current executable")?;
    let mut child = Command::new(current_exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .wrap_err("Failed to launch container supervisor")?;

    let mut line = String::new();
    if let Some(stdout) = child.stdout.take() {
        BufReader::new(stdout).read_line(&mut line)?;
    }

    let id = line.trim();
    if !id.is_empty() {
        println!("{id}");
        return Ok(0);
    }

    let mut errors = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        stderr.read_to_string(&mut errors)?;
    }
    eprint!("{errors}");

    let status = child.wait()?;
    Ok(status.code().unwrap_or(EXIT_MANAGER_ERROR))
}

/// Run a detached container until it settles.
async fn supervise(manager: &LifecycleManager, spec: RunSpec) -> SkiffResult<i32> {
    let outcome = manager.run(spec).await?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", outcome.id)?;
    stdout.flush()?;

    tokio::select! {
        result = manager.wait(outcome.id.as_str()) => match result {
            Ok(_) | Err(SkiffError::ContainerNotFound { .. }) => {}
            Err(err) => return Err(err),
        },
        _ = tokio::signal::ctrl_c() => stop_all(manager).await,
    }

    tracing::debug!(container_id = %outcome.id, "Supervisor exiting");
    Ok(0)
}

#[derive(Tabled)]
struct PsRow {
    #[tabled(rename = "CONTAINER ID")]
    id: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "CREATED")]
    created: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "NAMES")]
    names: String,
}

impl PsRow {
    fn new(descriptor: &ContainerDescriptor) -> Self {
        Self {
            id: short_id(&descriptor.id).to_string(),
            image: descriptor.image.clone(),
            command: format!("\"{}\"", truncate(&descriptor.config.cmd.join(" "), 20)),
            created: format!("{} ago", human_duration(Utc::now() - descriptor.created)),
            status: status(descriptor),
            names: descriptor.name.clone().unwrap_or_default(),
        }
    }
}

/// Reconcile a stored descriptor with the processes actually alive.
fn reconcile(mut descriptor: ContainerDescriptor) -> ContainerDescriptor {
    let alive = descriptor.state.pid.is_some_and(process_exists);
    if descriptor.state.running && !alive {
        descriptor.state.status = LifecycleState::Dead;
        descriptor.state.running = false;
        descriptor.state.dead = true;
        descriptor.state.pid = None;
        descriptor.state.error = Some("supervisor exited while the container was running".into());
    }
    descriptor
}

fn ps(store: &StateStore, all: bool, quiet: bool, format: &str) -> SkiffResult<i32> {
    let containers: Vec<_> = store
        .list()?
        .into_iter()
        .map(reconcile)
        .filter(|descriptor| all || descriptor.state.running)
        .collect();

    if quiet {
        for descriptor in &containers {
            println!("{}", short_id(&descriptor.id));
        }
    } else if format == "json" {
        println!("{}", serde_json::to_string_pretty(&containers)?);
    } else {
        let rows: Vec<_> = containers.iter().map(PsRow::new).collect();
        println!("{}", Table::new(rows).with(Style::blank()));
    }

    Ok(0)
}

fn inspect(store: &StateStore, keys: &[String]) -> Result<i32> {
    let mut found = Vec::new();
    let mut code = 0;

    for key in keys {
        match store.load(key) {
            Ok(descriptor) => found.push(reconcile(descriptor)),
            Err(err @ SkiffError::ContainerNotFound { .. }) => {
                eprintln!("Error: {err}");
                code = EXIT_NOT_FOUND;
            }
            Err(err) => {
                eprintln!("{:?}", miette::Report::new(err));
                code = EXIT_MANAGER_ERROR;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(code)
}

/// The pid of a stored container that is still running, re-read from disk.
fn running_pid(store: &StateStore, id: &str) -> SkiffResult<Option<u32>> {
    match store.load(id) {
        Ok(descriptor) => {
            let state = reconcile(descriptor).state;
            Ok(state.pid.filter(|_| state.running))
        }
        Err(SkiffError::ContainerNotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Stop a stored container, escalating to `SIGKILL`.
///
/// The stop marker is left before the first signal, and the state is
/// re-read on every poll so that a process started by a concurrent restart
/// is signalled as well.
async fn terminate(
    config: &RuntimeConfig,
    store: &StateStore,
    descriptor: &ContainerDescriptor,
    signal: i32,
    timeout: Duration,
) -> SkiffResult<()> {
    let id = descriptor.id.as_str();
    store.request_stop(id)?;

    let runtime = NativeRuntime::new(config.paths.clone());
    let mut signal = signal;
    let mut deadline = Instant::now() + timeout;
    let mut signalled = None;

    while let Some(pid) = running_pid(store, id)? {
        if signalled != Some(pid) {
            tracing::info!(container_id = %id, pid, signal, "Stopping container");
            runtime.signal(pid, signal)?;
            signalled = Some(pid);
        }

        if Instant::now() >= deadline {
            if signal == libc::SIGKILL {
                return Err(SkiffError::internal(format!(
                    "container {id} did not exit after SIGKILL"
                )));
            }
            tracing::warn!(container_id = %id, pid, "Container did not stop in time, killing");
            signal = libc::SIGKILL;
            signalled = None;
            deadline = Instant::now() + config.kill_grace;
            continue;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Ok(())
}

async fn stop(
    config: &RuntimeConfig,
    store: &StateStore,
    keys: &[String],
    signal: &str,
    timeout: Duration,
) -> SkiffResult<i32> {
    let signal = parse_signal(signal)?;

    for key in keys {
        let descriptor = reconcile(store.load(key)?);
        terminate(config, store, &descriptor, signal, timeout).await?;
        println!("{key}");
    }

    Ok(0)
}

async fn remove(
    config: &RuntimeConfig,
    store: &StateStore,
    keys: &[String],
    force: bool,
) -> SkiffResult<i32> {
    for key in keys {
        let descriptor = match store.load(key) {
            Ok(descriptor) => reconcile(descriptor),
            Err(SkiffError::ContainerNotFound { .. }) => {
                tracing::debug!(key = %key, "Nothing to remove");
                continue;
            }
            Err(err) => return Err(err),
        };

        if descriptor.state.running {
            if !force {
                return Err(SkiffError::conflict(format!(
                    "cannot remove running container {}: stop the container before removing or force remove",
                    descriptor.id
                )));
            }
            terminate(config, store, &descriptor, libc::SIGKILL, config.kill_grace).await?;
        }

        store.delete(&descriptor.id, descriptor.name.as_deref())?;
        tracing::info!(container_id = %descriptor.id, "Container removed");
        println!("{key}");
    }

    Ok(0)
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "REPOSITORY")]
    repository: String,
    #[tabled(rename = "TAG")]
    tag: String,
    #[tabled(rename = "IMAGE ID")]
    id: String,
}

fn images(config: &RuntimeConfig, quiet: bool) -> SkiffResult<i32> {
    let images = LocalImageStore::new(config.paths.images()).list()?;

    if quiet {
        for image in &images {
            println!("{}", image.id.short());
        }
        return Ok(0);
    }

    let rows: Vec<_> = images
        .iter()
        .map(|image| {
            let (repository, tag) = image
                .reference
                .rsplit_once(':')
                .unwrap_or((image.reference.as_str(), "latest"));
            ImageRow {
                repository: repository.to_string(),
                tag: tag.to_string(),
                id: image.id.short().to_string(),
            }
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::blank()));

    Ok(0)
}

async fn logs(store: &StateStore, key: &str, follow: bool) -> Result<i32> {
    let descriptor = match store.load(key) {
        Ok(descriptor) => descriptor,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(EXIT_NOT_FOUND);
        }
    };

    let paths = store.paths();
    let stdout_path = paths.container_log(&descriptor.id, "stdout");
    let stderr_path = paths.container_log(&descriptor.id, "stderr");

    if !stdout_path.exists() && !stderr_path.exists() {
        return Err(color_eyre::eyre::eyre!(
            "No logs for container {key}. (Note: only detached containers have logs)"
        ));
    }

    let mut stdout = LogFollower::open(&stdout_path)?;
    let mut stderr = LogFollower::open(&stderr_path)?;

    loop {
        let out = stdout.drain(&mut std::io::stdout())?;
        let err = stderr.drain(&mut std::io::stderr())?;
        if out || err {
            continue;
        }
        if !follow {
            break;
        }

        let running = store
            .load(&descriptor.id)
            .is_ok_and(|descriptor| reconcile(descriptor).state.running);
        if !running {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Ok(0)
}

/// Incrementally copies a log file.
struct LogFollower {
    reader: Option<BufReader<std::fs::File>>,
}

impl LogFollower {
    fn open(path: &Path) -> Result<Self> {
        let reader = if path.exists() {
            let file = std::fs::File::open(path)
                .wrap_err_with(|| format!("Failed to open log {}", path.display()))?;
            Some(BufReader::new(file))
        } else {
            None
        };
        Ok(Self { reader })
    }

    /// Copy complete lines to `out`. Returns true if anything was copied.
    fn drain(&mut self, out: &mut impl Write) -> Result<bool> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };

        let mut copied = false;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).wrap_err("Failed to read log")? == 0 {
                break;
            }
            out.write_all(line.as_bytes())?;
            copied = true;
        }
        out.flush()?;
        Ok(copied)
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(skiff_common::ContainerId::SHORT_LENGTH)]
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let mut truncated: String = value.chars().take(max - 1).collect();
        truncated.push('…');
        truncated
    }
}

fn status(descriptor: &ContainerDescriptor) -> String {
    let state = &descriptor.state;
    let since = |time: Option<chrono::DateTime<Utc>>| {
        time.map_or_else(String::new, |time| human_duration(Utc::now() - time))
    };

    match state.status {
        LifecycleState::Created => "Created".to_string(),
        LifecycleState::Running => format!("Up {}", since(state.started_at)),
        LifecycleState::Exited if state.restarting => {
            format!(
                "Restarting ({}) {} ago",
                state.exit_code.unwrap_or_default(),
                since(state.finished_at)
            )
        }
        LifecycleState::Exited => format!(
            "Exited ({}) {} ago",
            state.exit_code.unwrap_or_default(),
            since(state.finished_at)
        ),
        LifecycleState::Dead => "Dead".to_string(),
        LifecycleState::Removed => "Removal In Progress".to_string(),
    }
}

fn human_duration(duration: chrono::Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    match seconds {
        0 => "Less than a second".to_string(),
        1 => "1 second".to_string(),
        2..=59 => format!("{seconds} seconds"),
        60..=119 => "About a minute".to_string(),
        120..=3599 => format!("{} minutes", seconds / 60),
        3600..=7199 => "About an hour".to_string(),
        7200..=172_799 => format!("{} hours", seconds / 3600),
        _ => format!("{} days", seconds / 86_400),
    }
}
