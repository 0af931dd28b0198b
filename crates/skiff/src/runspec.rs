//! Run requests.
//!
//! A [`RunSpec`] is built once through [`RunSpecBuilder`], which validates and
//! canonicalizes the raw option strings a caller collected, and is never
//! mutated afterwards.

use std::collections::{BTreeMap, HashMap};

use skiff_common::{ContainerName, SkiffError, SkiffResult};

use crate::isolation::NamespaceMode;
use crate::restart::RestartPolicy;

/// Requested confinement for one security layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Confinement {
    /// The layer's built-in default.
    #[default]
    Default,
    /// Layer disabled.
    Unconfined,
    /// A named profile.
    Profile(String),
}

impl Confinement {
    fn parse(value: &str) -> Self {
        if value == "unconfined" {
            Self::Unconfined
        } else {
            Self::Profile(value.to_string())
        }
    }
}

/// Security options of a run request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityOptions {
    /// AppArmor profile.
    pub apparmor: Confinement,
    /// Seccomp profile.
    pub seccomp: Confinement,
    /// Set `no_new_privs` on the container process.
    pub no_new_privileges: bool,
    /// Capabilities added to the default set, as given.
    pub cap_add: Vec<String>,
    /// Capabilities removed from the default set, as given.
    pub cap_drop: Vec<String>,
    /// Disable AppArmor, seccomp and capability restriction.
    pub privileged: bool,
    /// `--security-opt` values as given.
    pub raw: Vec<String>,
}

/// An immutable, validated run request.
#[derive(Debug, Clone)]
pub struct RunSpec {
    image: String,
    command: Vec<String>,
    name: Option<ContainerName>,
    env: Vec<String>,
    working_dir: Option<String>,
    hostname: Option<String>,
    ipc_mode: NamespaceMode,
    uts_mode: NamespaceMode,
    security: SecurityOptions,
    sysctls: BTreeMap<String, String>,
    annotations: HashMap<String, String>,
    restart_policy: RestartPolicy,
    auto_remove: bool,
    detach: bool,
}

impl RunSpec {
    /// Start building a run request for `image`.
    #[must_use]
    pub fn builder(image: impl Into<String>) -> RunSpecBuilder {
        RunSpecBuilder::new(image)
    }

    /// Image reference.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Command and arguments; empty means the image's default command.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Container name, if one was given.
    #[must_use]
    pub const fn name(&self) -> Option<&ContainerName> {
        self.name.as_ref()
    }

    /// Extra environment (`KEY=VALUE`).
    #[must_use]
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Working directory override.
    #[must_use]
    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    /// Hostname override.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// IPC namespace mode.
    #[must_use]
    pub const fn ipc_mode(&self) -> &NamespaceMode {
        &self.ipc_mode
    }

    /// UTS namespace mode.
    #[must_use]
    pub const fn uts_mode(&self) -> &NamespaceMode {
        &self.uts_mode
    }

    /// Security options.
    #[must_use]
    pub const fn security(&self) -> &SecurityOptions {
        &self.security
    }

    /// Sysctls to apply at process start.
    #[must_use]
    pub const fn sysctls(&self) -> &BTreeMap<String, String> {
        &self.sysctls
    }

    /// Annotations, passed through verbatim.
    #[must_use]
    pub const fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    /// Restart policy.
    #[must_use]
    pub const fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    /// Remove the container once it settles.
    #[must_use]
    pub const fn auto_remove(&self) -> bool {
        self.auto_remove
    }

    /// Return from `run` as soon as the container is running.
    #[must_use]
    pub const fn detach(&self) -> bool {
        self.detach
    }
}

/// Collects raw run options and validates them in [`RunSpecBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct RunSpecBuilder {
    image: String,
    command: Vec<String>,
    name: Option<String>,
    env: Vec<String>,
    working_dir: Option<String>,
    hostname: Option<String>,
    ipc: Option<String>,
    uts: Option<String>,
    security_opts: Vec<String>,
    cap_add: Vec<String>,
    cap_drop: Vec<String>,
    privileged: bool,
    sysctls: Vec<String>,
    annotations: Vec<String>,
    restart: Option<String>,
    restart_policy: Option<RestartPolicy>,
    auto_remove: bool,
    detach: bool,
}

impl RunSpecBuilder {
    /// Create a builder for `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Set the command and its arguments.
    #[must_use]
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Set the container name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment entry (`KEY=VALUE`).
    #[must_use]
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the hostname.
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the IPC namespace mode (`private`, `host`, `container:<ref>`).
    #[must_use]
    pub fn ipc(mut self, mode: impl Into<String>) -> Self {
        self.ipc = Some(mode.into());
        self
    }

    /// Set the UTS namespace mode.
    #[must_use]
    pub fn uts(mut self, mode: impl Into<String>) -> Self {
        self.uts = Some(mode.into());
        self
    }

    /// Add a security option (`apparmor=...`, `seccomp=...`, `no-new-privileges`).
    #[must_use]
    pub fn security_opt(mut self, option: impl Into<String>) -> Self {
        self.security_opts.push(option.into());
        self
    }

    /// Add a capability to the default set.
    #[must_use]
    pub fn cap_add(mut self, cap: impl Into<String>) -> Self {
        self.cap_add.push(cap.into());
        self
    }

    /// Remove a capability from the default set.
    #[must_use]
    pub fn cap_drop(mut self, cap: impl Into<String>) -> Self {
        self.cap_drop.push(cap.into());
        self
    }

    /// Disable confinement.
    #[must_use]
    pub const fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Add a sysctl (`key=value`).
    #[must_use]
    pub fn sysctl(mut self, entry: impl Into<String>) -> Self {
        self.sysctls.push(entry.into());
        self
    }

    /// Add an annotation (`key=value`).
    #[must_use]
    pub fn annotation(mut self, entry: impl Into<String>) -> Self {
        self.annotations.push(entry.into());
        self
    }

    /// Set the restart policy from its string form.
    #[must_use]
    pub fn restart(mut self, policy: impl Into<String>) -> Self {
        self.restart = Some(policy.into());
        self.restart_policy = None;
        self
    }

    /// Set the restart policy.
    #[must_use]
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self.restart = None;
        self
    }

    /// Remove the container once it settles.
    #[must_use]
    pub const fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    /// Return from `run` once the container is running.
    #[must_use]
    pub const fn detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Validate and canonicalize.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Validation`] (or [`SkiffError::InvalidName`])
    /// for any malformed or contradictory option.
    pub fn build(self) -> SkiffResult<RunSpec> {
        let image = self.image.trim().to_string();
        if image.is_empty() || image.contains(char::is_whitespace) {
            return Err(SkiffError::validation(format!(
                "invalid image reference: '{}'",
                self.image
            )));
        }

        let name = self.name.map(ContainerName::new).transpose()?;

        for entry in &self.env {
            split_key_value("environment variable", entry)?;
        }

        if let Some(dir) = &self.working_dir {
            if !dir.starts_with('/') {
                return Err(SkiffError::validation(format!(
                    "working directory must be absolute: {dir}"
                )));
            }
        }

        let ipc_mode = self
            .ipc
            .as_deref()
            .map_or(Ok(NamespaceMode::Private), str::parse)?;
        let uts_mode = self
            .uts
            .as_deref()
            .map_or(Ok(NamespaceMode::Private), str::parse)?;

        if let Some(hostname) = &self.hostname {
            if !uts_mode.is_private() {
                return Err(SkiffError::validation(format!(
                    "conflicting options: hostname and the {uts_mode} UTS namespace"
                )));
            }
            validate_hostname(hostname)?;
        }

        let mut security = SecurityOptions {
            cap_add: self.cap_add,
            cap_drop: self.cap_drop,
            privileged: self.privileged,
            ..SecurityOptions::default()
        };
        for option in &self.security_opts {
            apply_security_opt(&mut security, option)?;
        }
        security.raw = self.security_opts;

        if let Some(cap) = security
            .cap_add
            .iter()
            .chain(&security.cap_drop)
            .find(|cap| cap.trim().is_empty())
        {
            return Err(SkiffError::validation(format!("invalid capability: '{cap}'")));
        }

        let mut sysctls = BTreeMap::new();
        for entry in &self.sysctls {
            let (key, value) = split_key_value("sysctl", entry)?;
            if key.contains(char::is_whitespace) {
                return Err(SkiffError::validation(format!("invalid sysctl key: {key}")));
            }
            sysctls.insert(key.to_string(), value.to_string());
        }

        let mut annotations = HashMap::new();
        for entry in &self.annotations {
            let (key, value) = split_key_value("annotation", entry)?;
            annotations.insert(key.to_string(), value.to_string());
        }

        let restart_policy = match (self.restart_policy, self.restart.as_deref()) {
            (Some(policy), _) => policy,
            (None, Some(text)) => text.parse()?,
            (None, None) => RestartPolicy::No,
        };

        if self.auto_remove && restart_policy.restarts() {
            return Err(SkiffError::validation(format!(
                "conflicting options: auto-remove and restart policy '{restart_policy}'"
            )));
        }

        Ok(RunSpec {
            image,
            command: self.command,
            name,
            env: self.env,
            working_dir: self.working_dir,
            hostname: self.hostname,
            ipc_mode,
            uts_mode,
            security,
            sysctls,
            annotations,
            restart_policy,
            auto_remove: self.auto_remove,
            detach: self.detach,
        })
    }
}

fn split_key_value<'a>(what: &str, entry: &'a str) -> SkiffResult<(&'a str, &'a str)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(SkiffError::validation(format!(
            "invalid {what} '{entry}': expected key=value"
        ))),
    }
}

fn apply_security_opt(security: &mut SecurityOptions, option: &str) -> SkiffResult<()> {
    if option == "no-new-privileges" {
        security.no_new_privileges = true;
        return Ok(());
    }

    // Older clients separate with ':'.
    let (key, value) = option
        .split_once('=')
        .or_else(|| option.split_once(':'))
        .ok_or_else(|| SkiffError::validation(format!("invalid security option: {option}")))?;

    if value.is_empty() {
        return Err(SkiffError::validation(format!(
            "invalid security option '{option}': empty value"
        )));
    }

    match key {
        "apparmor" => security.apparmor = Confinement::parse(value),
        "seccomp" => security.seccomp = Confinement::parse(value),
        "no-new-privileges" => {
            security.no_new_privileges = value.parse::<bool>().map_err(|_| {
                SkiffError::validation(format!("invalid no-new-privileges value: {value}"))
            })?;
        }
        _ => {
            return Err(SkiffError::validation(format!(
                "invalid security option: {option}"
            )));
        }
    }

    Ok(())
}

fn validate_hostname(hostname: &str) -> SkiffResult<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 64
        && hostname
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });

    if valid {
        Ok(())
    } else {
        Err(SkiffError::validation(format!("invalid hostname: {hostname}")))
    }
}
