#![allow(unsafe_code)]
//! Native Linux isolation runtime.
//!
//! Everything that can fail for a reason other than the kernel refusing a
//! syscall (profile compilation, path conversion, capability reads) happens
//! in the parent while building a [`LaunchPlan`]. The pre-exec hook that runs
//! in the forked child only issues syscalls on precomputed data:
//!
//! 1. enter namespaces of other containers
//! 2. unshare mount, network and private IPC/UTS namespaces
//! 3. hostname and sysctls
//! 4. bind the rootfs, mount `/proc` and devices, `pivot_root`
//! 5. AppArmor exec transition, capabilities, `no_new_privs`
//! 6. seccomp, last

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use rustix::thread::UnshareFlags;
use seccompiler::BpfProgram;
use skiff_common::{SkiffError, SkiffPaths, SkiffResult};
use tokio::process::Command;
use tokio::sync::oneshot;

use super::{ExitStatus, IsolationRuntime, SpawnRequest, SpawnedProcess, StdioMode, rootfs};
use crate::isolation::CapabilityPlan;
use crate::isolation::apparmor::ExecTransition;
use crate::isolation::seccomp;

/// `PATH` used when neither the image nor the request sets one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Spawns container processes with Linux namespaces, capabilities,
/// AppArmor and seccomp.
#[derive(Debug, Clone)]
pub struct NativeRuntime {
    paths: SkiffPaths,
}

impl NativeRuntime {
    /// Create a runtime resolving named seccomp profiles under `paths`.
    #[must_use]
    pub const fn new(paths: SkiffPaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl IsolationRuntime for NativeRuntime {
    async fn spawn(&self, request: SpawnRequest) -> SkiffResult<SpawnedProcess> {
        let Some((program, args)) = request.args.split_first() else {
            return Err(SkiffError::config("no command specified"));
        };

        let plan = LaunchPlan::new(&request, &self.paths)?;
        let (stdout, stderr) = open_stdio(&request.stdio)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let mut saw_path = false;
        for entry in &request.env {
            if let Some((key, value)) = entry.split_once('=') {
                saw_path |= key == "PATH";
                command.env(key, value);
            }
        }
        if !saw_path {
            command.env("PATH", DEFAULT_PATH);
        }

        // SAFETY: the hook only performs syscalls on data owned by `plan`
        // and does not touch locks held by other threads of the parent.
        unsafe {
            command.pre_exec(move || plan.enter());
        }

        let mut child = command.spawn().map_err(|err| {
            SkiffError::Io(io::Error::new(err.kind(), format!("exec {program}: {err}")))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SkiffError::internal("spawned process has no pid"))?;

        tracing::debug!(
            container_id = %request.container_id,
            pid,
            command = ?request.args,
            "Container process spawned"
        );

        let (sender, exit) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(err) => ExitStatus::Lost(format!("wait failed: {err}")),
            };
            let _ = sender.send(status);
        });

        Ok(SpawnedProcess { pid, exit })
    }

    fn signal(&self, pid: u32, signal: i32) -> SkiffResult<()> {
        let target = i32::try_from(pid)
            .map_err(|_| SkiffError::internal(format!("pid out of range: {pid}")))?;

        tracing::debug!(pid, signal, "Sending signal to container process");

        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(target, signal) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                tracing::debug!(pid, "Process already gone");
                return Ok(());
            }
            return Err(SkiffError::Io(err));
        }

        Ok(())
    }
}

/// Syscall arguments prepared in the parent for the pre-exec hook.
struct LaunchPlan {
    joins: Vec<(CString, libc::c_int)>,
    unshare: UnshareFlags,
    hostname: Option<Vec<u8>>,
    sysctls: Vec<(CString, Vec<u8>)>,
    root: CString,
    proc: CString,
    devices: Vec<(CString, CString)>,
    workdir: CString,
    apparmor: Option<ExecTransition>,
    capabilities: CapabilityPlan,
    no_new_privileges: bool,
    seccomp: Option<BpfProgram>,
}

impl LaunchPlan {
    fn new(request: &SpawnRequest, paths: &SkiffPaths) -> SkiffResult<Self> {
        let isolation = &request.isolation;
        let layout = rootfs::prepare(&request.rootfs)?;

        let workdir = request.working_dir.trim_start_matches('/');
        if !workdir.is_empty() {
            std::fs::create_dir_all(layout.root.join(workdir))?;
        }

        let joins = request
            .joins
            .iter()
            .map(|join| Ok((path_cstring(&join.path)?, join.kind.clone_flag())))
            .collect::<SkiffResult<_>>()?;

        let sysctls = isolation
            .sysctls
            .iter()
            .map(|(key, value)| {
                let path = format!("/proc/sys/{}", key.replace('.', "/"));
                Ok((cstring(path)?, value.clone().into_bytes()))
            })
            .collect::<SkiffResult<_>>()?;

        let devices = layout
            .devices
            .iter()
            .map(|(source, target)| Ok((path_cstring(source)?, path_cstring(target)?)))
            .collect::<SkiffResult<_>>()?;

        let apparmor = match &isolation.apparmor {
            Some(profile) => profile.exec_transition()?,
            None => None,
        };

        Ok(Self {
            joins,
            unshare: isolation.namespaces.to_unshare_flags(),
            hostname: isolation.hostname.as_ref().map(|name| name.clone().into_bytes()),
            sysctls,
            root: path_cstring(&layout.root)?,
            proc: path_cstring(&layout.proc)?,
            devices,
            workdir: cstring(request.working_dir.clone())?,
            apparmor,
            capabilities: isolation.capabilities.plan()?,
            no_new_privileges: isolation.no_new_privileges,
            seccomp: isolation.seccomp.compile(paths)?,
        })
    }

    /// Runs in the child between fork and exec.
    fn enter(&self) -> io::Result<()> {
        for (path, nstype) in &self.joins {
            join_namespace(path, *nstype)?;
        }

        // SAFETY: the child is single-threaded here.
        unsafe { rustix::thread::unshare_unsafe(self.unshare) }.map_err(io::Error::from)?;

        if let Some(hostname) = &self.hostname {
            // SAFETY: pointer and length describe a live buffer.
            check(unsafe { libc::sethostname(hostname.as_ptr().cast(), hostname.len()) })?;
        }

        for (path, value) in &self.sysctls {
            write_file(path, value)?;
        }

        self.pivot()?;

        if let Some(transition) = &self.apparmor {
            write_file(&transition.path, &transition.command)?;
        }

        self.capabilities.apply()?;

        if self.no_new_privileges {
            let (one, zero): (libc::c_ulong, libc::c_ulong) = (1, 0);
            // SAFETY: prctl with integer arguments only.
            check(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, one, zero, zero, zero) })?;
        }

        if let Some(program) = &self.seccomp {
            seccomp::install(program)?;
        }

        Ok(())
    }

    fn pivot(&self) -> io::Result<()> {
        // SAFETY: every pointer is either null or a NUL-terminated string
        // owned by `self` or a static literal.
        unsafe {
            check(libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ))?;
            check(libc::mount(
                self.root.as_ptr(),
                self.root.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                std::ptr::null(),
            ))?;
            check(libc::mount(
                c"proc".as_ptr(),
                self.proc.as_ptr(),
                c"proc".as_ptr(),
                libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                std::ptr::null(),
            ))?;
            for (source, target) in &self.devices {
                check(libc::mount(
                    source.as_ptr(),
                    target.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND,
                    std::ptr::null(),
                ))?;
            }

            check(libc::chdir(self.root.as_ptr()))?;
            // pivot_root(".", ".") stacks the old root on top of the new one.
            if libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            check(libc::umount2(c".".as_ptr(), libc::MNT_DETACH))?;
            check(libc::chdir(self.workdir.as_ptr()))?;
        }

        Ok(())
    }
}

fn join_namespace(path: &CString, nstype: libc::c_int) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated; the fd is closed on every path.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC);
        check(fd)?;
        let result = libc::setns(fd, nstype);
        libc::close(fd);
        check(result)
    }
}

fn write_file(path: &CString, value: &[u8]) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated and `value` outlives the write.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        check(fd)?;
        let written = libc::write(fd, value.as_ptr().cast(), value.len());
        libc::close(fd);
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn check(result: libc::c_int) -> io::Result<()> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn cstring(value: String) -> SkiffResult<CString> {
    CString::new(value).map_err(|err| SkiffError::config(format!("invalid path: {err}")))
}

fn path_cstring(path: &Path) -> SkiffResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|err| SkiffError::config(format!("invalid path {}: {err}", path.display())))
}

fn open_stdio(mode: &StdioMode) -> SkiffResult<(Stdio, Stdio)> {
    match mode {
        StdioMode::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
        StdioMode::Log { stdout, stderr } => {
            let open = |path: &Path| -> SkiffResult<Stdio> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            };
            Ok((open(stdout)?, open(stderr)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_stdio_creates_files() {
        let temp = tempfile::tempdir().unwrap();
        let stdout = temp.path().join("c1/stdout.log");
        let stderr = temp.path().join("c1/stderr.log");
        open_stdio(&StdioMode::Log {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
        })
        .unwrap();
        assert!(stdout.exists());
        assert!(stderr.exists());
    }

    #[test]
    fn rejects_interior_nul() {
        assert!(cstring("bad\0path".to_string()).is_err());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let runtime = NativeRuntime::new(SkiffPaths::with_root(temp.path()));
        let spec = crate::runspec::RunSpec::builder("busybox").build().unwrap();
        let id = skiff_common::ContainerId::generate();
        let isolation = crate::isolation::configure(&spec, &id).unwrap();

        let err = runtime
            .spawn(SpawnRequest {
                container_id: id,
                rootfs: temp.path().to_path_buf(),
                args: Vec::new(),
                env: Vec::new(),
                working_dir: "/".to_string(),
                isolation,
                joins: Vec::new(),
                stdio: StdioMode::Inherit,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn signalling_a_missing_process_is_not_an_error() {
        let runtime = NativeRuntime::new(SkiffPaths::with_root("/nonexistent"));
        // pid_max is at most 2^22, so this pid never exists.
        assert!(runtime.signal(i32::MAX as u32, 0).is_ok());
    }
}
