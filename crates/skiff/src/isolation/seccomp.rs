//! Seccomp syscall filtering.
//!
//! Profiles are compiled into BPF programs in the parent with
//! [`seccompiler`]; only installing the program happens in the child.

use std::path::Path;

use seccompiler::{BpfMap, BpfProgram, TargetArch};
use skiff_common::{SkiffError, SkiffPaths, SkiffResult};

/// Syscalls the default profile rejects with `EPERM`.
pub const DEFAULT_BLOCKED_SYSCALLS: &[&str] = &[
    "acct",
    "add_key",
    "bpf",
    "clock_settime",
    "delete_module",
    "finit_module",
    "init_module",
    "kexec_file_load",
    "kexec_load",
    "keyctl",
    "mount",
    "open_by_handle_at",
    "perf_event_open",
    "pivot_root",
    "reboot",
    "request_key",
    "settimeofday",
    "swapoff",
    "swapon",
    "syslog",
    "umount2",
];

/// Seccomp profile selection for a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SeccompProfile {
    /// The built-in blocklist.
    #[default]
    Default,
    /// No filter.
    Unconfined,
    /// A seccompiler JSON profile, by name or absolute path.
    Named(String),
}

impl SeccompProfile {
    /// Compile the profile for the running architecture.
    ///
    /// Returns `None` for [`SeccompProfile::Unconfined`].
    ///
    /// # Errors
    ///
    /// Returns an error if the profile cannot be read or compiled.
    pub fn compile(&self, paths: &SkiffPaths) -> SkiffResult<Option<BpfProgram>> {
        match self {
            Self::Unconfined => Ok(None),
            Self::Default => {
                let json = default_profile_json()?;
                let program = compile_single(json.as_slice(), "default")?;
                Ok(Some(program))
            }
            Self::Named(name) => {
                let path = paths.seccomp_profile(name);
                let program = compile_file(&path).map_err(|err| {
                    SkiffError::config(format!("seccomp profile '{name}': {err}"))
                })?;
                Ok(Some(program))
            }
        }
    }
}

fn default_profile_json() -> SkiffResult<Vec<u8>> {
    let filter: Vec<serde_json::Value> = DEFAULT_BLOCKED_SYSCALLS
        .iter()
        .map(|syscall| serde_json::json!({ "syscall": syscall }))
        .collect();

    let profile = serde_json::json!({
        "default": {
            "mismatch_action": "allow",
            "match_action": { "errno": libc::EPERM },
            "filter": filter,
        }
    });

    Ok(serde_json::to_vec(&profile)?)
}

fn compile_file(path: &Path) -> SkiffResult<BpfProgram> {
    let bytes = std::fs::read(path)?;
    compile_single(bytes.as_slice(), "default")
}

/// Compile a profile document and pick its program.
///
/// A document with a single filter uses it whatever its name; otherwise
/// the filter named `preferred` is used.
fn compile_single(json: &[u8], preferred: &str) -> SkiffResult<BpfProgram> {
    let arch = target_arch()?;
    let mut filters: BpfMap = seccompiler::compile_from_json(json, arch)
        .map_err(|err| SkiffError::config(format!("invalid seccomp profile: {err}")))?;

    if filters.len() == 1 {
        if let Some(program) = filters.drain().map(|(_, program)| program).next() {
            return Ok(program);
        }
    }

    filters.remove(preferred).ok_or_else(|| {
        SkiffError::config(format!(
            "seccomp profile defines several filters but none named '{preferred}'"
        ))
    })
}

fn target_arch() -> SkiffResult<TargetArch> {
    TargetArch::try_from(std::env::consts::ARCH).map_err(|err| SkiffError::Unsupported {
        feature: format!("seccomp on {}: {err}", std::env::consts::ARCH),
    })
}

/// Install a compiled filter on the calling thread.
///
/// Also sets `no_new_privs`, which seccomp requires for unprivileged callers.
///
/// # Errors
///
/// Returns the failing `prctl`/`seccomp` call as an I/O error.
#[cfg(target_os = "linux")]
pub fn install(program: &BpfProgram) -> std::io::Result<()> {
    seccompiler::apply_filter(program).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_compiles() {
        let paths = SkiffPaths::with_root("/nonexistent");
        let program = SeccompProfile::Default.compile(&paths).unwrap();
        assert!(program.is_some_and(|program| !program.is_empty()));
    }

    #[test]
    fn unconfined_has_no_program() {
        let paths = SkiffPaths::with_root("/nonexistent");
        assert!(SeccompProfile::Unconfined.compile(&paths).unwrap().is_none());
    }

    #[test]
    fn named_profile_from_root() {
        let temp = tempfile::tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        std::fs::create_dir_all(paths.seccomp_profiles()).unwrap();
        std::fs::write(
            paths.seccomp_profile("no-reboot"),
            r#"{"main":{"mismatch_action":"allow","match_action":"kill_process","filter":[{"syscall":"reboot"}]}}"#,
        )
        .unwrap();

        let program = SeccompProfile::Named("no-reboot".to_string())
            .compile(&paths)
            .unwrap();
        assert!(program.is_some());
    }

    #[test]
    fn missing_named_profile_fails() {
        let temp = tempfile::tempdir().unwrap();
        let paths = SkiffPaths::with_root(temp.path());
        let err = SeccompProfile::Named("absent".to_string())
            .compile(&paths)
            .unwrap_err();
        assert!(err.to_string().contains("absent"));
    }
}
