//! AppArmor profile selection.
//!
//! Skiff never loads profiles; it only asks the kernel to switch to an
//! already loaded profile at exec time.

use std::ffi::CString;
use std::path::Path;

use skiff_common::{SkiffError, SkiffResult};

/// Profile name meaning "no AppArmor confinement".
pub const UNCONFINED: &str = "unconfined";

/// AppArmor profile for a container process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppArmorProfile {
    /// Profile name.
    pub name: String,
}

impl AppArmorProfile {
    /// Reference an already loaded profile.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Unconfined profile (no restrictions).
    #[must_use]
    pub fn unconfined() -> Self {
        Self::new(UNCONFINED)
    }

    /// Returns true for the unconfined profile.
    #[must_use]
    pub fn is_unconfined(&self) -> bool {
        self.name == UNCONFINED
    }

    /// Check if AppArmor is enabled on the system.
    #[must_use]
    pub fn is_enabled() -> bool {
        Path::new("/sys/module/apparmor").exists()
            && Path::new("/sys/kernel/security/apparmor").exists()
    }

    /// Prepare the write that switches the child's profile at exec.
    ///
    /// Returns `None` for the unconfined profile.
    ///
    /// # Errors
    ///
    /// Returns an error if a profile is requested but AppArmor is disabled.
    pub fn exec_transition(&self) -> SkiffResult<Option<ExecTransition>> {
        if self.is_unconfined() {
            tracing::debug!("Skipping unconfined AppArmor profile");
            return Ok(None);
        }

        if !Self::is_enabled() {
            return Err(SkiffError::config(format!(
                "apparmor profile '{}' requested but AppArmor is not enabled",
                self.name
            )));
        }

        let attr = if Path::new("/proc/self/attr/apparmor/exec").exists() {
            "/proc/self/attr/apparmor/exec"
        } else {
            "/proc/self/attr/exec"
        };

        let path = CString::new(attr)
            .map_err(|err| SkiffError::internal(format!("invalid attr path: {err}")))?;
        Ok(Some(ExecTransition {
            path,
            command: format!("exec {}", self.name).into_bytes(),
        }))
    }
}

/// A precomputed `exec <profile>` write to the process attribute file.
#[derive(Debug, Clone)]
pub struct ExecTransition {
    /// `/proc/self/attr/.../exec`.
    pub path: CString,
    /// `exec <profile>`.
    pub command: Vec<u8>,
}
