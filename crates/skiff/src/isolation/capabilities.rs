//! Capability sets for container processes.

use caps::{CapSet, Capability, CapsHashSet};
use skiff_common::{SkiffError, SkiffResult};

/// Capabilities every unprivileged container keeps unless dropped.
pub const DEFAULT_CAPABILITIES: [Capability; 14] = [
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_FSETID,
    Capability::CAP_FOWNER,
    Capability::CAP_MKNOD,
    Capability::CAP_NET_RAW,
    Capability::CAP_SETGID,
    Capability::CAP_SETUID,
    Capability::CAP_SETFCAP,
    Capability::CAP_SETPCAP,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_KILL,
    Capability::CAP_AUDIT_WRITE,
];

/// The capabilities a container process retains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    retained: CapsHashSet,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self {
            retained: DEFAULT_CAPABILITIES.into_iter().collect(),
        }
    }
}

impl CapabilitySet {
    /// Every capability the library knows about.
    #[must_use]
    pub fn all() -> Self {
        Self {
            retained: caps::all(),
        }
    }

    /// No capabilities at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            retained: CapsHashSet::new(),
        }
    }

    /// Apply `--cap-add` / `--cap-drop` to the default set.
    ///
    /// `ALL` is accepted in either list. Drops are applied before adds, so
    /// `--cap-drop ALL --cap-add NET_ADMIN` keeps exactly `CAP_NET_ADMIN`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] for unknown capability names.
    pub fn resolve(add: &[String], drop: &[String]) -> SkiffResult<Self> {
        let mut set = Self::default();

        if add.iter().any(|name| is_all(name)) {
            set = Self::all();
        }
        if drop.iter().any(|name| is_all(name)) {
            set = Self::empty();
        }

        for name in drop.iter().filter(|name| !is_all(name)) {
            set.retained.remove(&parse_capability(name)?);
        }
        for name in add.iter().filter(|name| !is_all(name)) {
            set.retained.insert(parse_capability(name)?);
        }

        Ok(set)
    }

    /// Returns true if `cap` is retained.
    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.retained.contains(&cap)
    }

    /// Retained capabilities.
    #[must_use]
    pub const fn retained(&self) -> &CapsHashSet {
        &self.retained
    }

    /// Retained capability names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.retained.iter().map(ToString::to_string).collect();
        names.sort();
        names
    }

    /// Plan the capability changes for a child of the current process.
    ///
    /// Reads the current bounding and inheritable sets so the child only
    /// has to issue the `prctl`/`capset` calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the current sets cannot be read.
    pub fn plan(&self) -> SkiffResult<CapabilityPlan> {
        let bounding = caps::read(None, CapSet::Bounding).map_err(caps_error)?;
        let inheritable = caps::read(None, CapSet::Inheritable).map_err(caps_error)?;

        let drop: Vec<Capability> = bounding
            .iter()
            .filter(|cap| !self.retained.contains(cap))
            .copied()
            .collect();
        let inheritable = inheritable
            .into_iter()
            .filter(|cap| self.retained.contains(cap))
            .collect();

        Ok(CapabilityPlan { drop, inheritable })
    }
}

/// Capability changes computed in the parent and applied in the child.
#[derive(Debug, Clone, Default)]
pub struct CapabilityPlan {
    /// Capabilities to remove from the bounding set.
    pub drop: Vec<Capability>,
    /// The inheritable set to install.
    pub inheritable: CapsHashSet,
}

impl CapabilityPlan {
    /// Shrink the bounding set and the inheritable set of the calling thread.
    ///
    /// Runs between fork and exec. After exec the permitted and effective
    /// sets of a root process are bounded by what remains here.
    ///
    /// # Errors
    ///
    /// Returns the first failing `prctl`/`capset` as an I/O error.
    pub fn apply(&self) -> std::io::Result<()> {
        for cap in &self.drop {
            caps::drop(None, CapSet::Bounding, *cap).map_err(std::io::Error::other)?;
        }
        caps::set(None, CapSet::Inheritable, &self.inheritable).map_err(std::io::Error::other)?;
        // Ambient capabilities are optional on older kernels.
        let _ = caps::clear(None, CapSet::Ambient);
        Ok(())
    }
}

fn is_all(name: &str) -> bool {
    name.eq_ignore_ascii_case("all")
}

/// Parse `chown`, `CHOWN` or `CAP_CHOWN`.
///
/// # Errors
///
/// Returns [`SkiffError::Config`] if the name is unknown.
pub fn parse_capability(name: &str) -> SkiffResult<Capability> {
    let upper = name.trim().to_ascii_uppercase();
    let canonical = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };

    canonical
        .parse::<Capability>()
        .map_err(|_| SkiffError::config(format!("unknown capability: {name}")))
}

fn caps_error(err: caps::errors::CapsError) -> SkiffError {
    SkiffError::internal(format!("failed to read capabilities: {err}"))
}
