//! Local image resolution.
//!
//! Images are unpacked directory trees under `<root>/images`. Each image
//! directory holds a `rootfs/` and an optional `image.json` carrying the
//! default command, environment and working directory:
//!
//! ```text
//! images/
//!   busybox+latest/
//!     image.json
//!     rootfs/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use skiff_common::{Digest, SkiffError, SkiffResult};

const IMAGE_CONFIG_FILE: &str = "image.json";
const ROOTFS_DIR: &str = "rootfs";

/// Minimum length of an image ID prefix.
pub const MIN_ID_PREFIX: usize = 4;

/// Image configuration stored next to the rootfs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Reference the image was stored under.
    #[serde(rename = "Reference", default)]
    pub reference: Option<String>,
    /// Default command.
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
    /// Default environment.
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    /// Default working directory.
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
}

/// An image ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Normalized reference (`name:tag`).
    pub reference: String,
    /// Image ID.
    pub id: Digest,
    /// Unpacked root filesystem.
    pub rootfs: PathBuf,
    /// Default command.
    pub cmd: Vec<String>,
    /// Default environment.
    pub env: Vec<String>,
    /// Default working directory.
    pub working_dir: Option<String>,
}

/// Resolves image references to runnable images.
pub trait ImageResolver: Send + Sync {
    /// Resolve a reference, full ID or ID prefix.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::ImageNotFound`] if nothing matches and
    /// [`SkiffError::Conflict`] for ambiguous ID prefixes.
    fn resolve(&self, reference: &str) -> SkiffResult<ResolvedImage>;

    /// All available images.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn list(&self) -> SkiffResult<Vec<ResolvedImage>>;
}

/// Append `:latest` to references without a tag.
#[must_use]
pub fn normalize_reference(reference: &str) -> String {
    let name_start = reference.rfind('/').map_or(0, |idx| idx + 1);
    if reference[name_start..].contains(':') || reference.contains('@') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

/// Image ID of a normalized reference.
#[must_use]
pub fn image_id(reference: &str) -> Digest {
    Digest::sha256(hex::encode(Sha256::digest(reference.as_bytes())))
}

/// Image store backed by a directory.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    /// Create a store rooted at `root` (usually `<skiff root>/images`).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the image stored under `reference`.
    #[must_use]
    pub fn image_dir(&self, reference: &str) -> PathBuf {
        let normalized = normalize_reference(reference);
        self.root.join(normalized.replace('/', "_").replace(':', "+"))
    }

    /// Register an image and return its (possibly empty) rootfs directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the image directory cannot be written.
    pub fn register(&self, reference: &str, config: &ImageConfig) -> SkiffResult<PathBuf> {
        let reference = normalize_reference(reference);
        let dir = self.image_dir(&reference);
        let rootfs = dir.join(ROOTFS_DIR);
        fs::create_dir_all(&rootfs)?;

        let config = ImageConfig {
            reference: Some(reference.clone()),
            ..config.clone()
        };
        fs::write(
            dir.join(IMAGE_CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )?;

        tracing::info!(reference = %reference, "Image registered");
        Ok(rootfs)
    }

    fn load(&self, dir: &Path, fallback_reference: Option<&str>) -> SkiffResult<Option<ResolvedImage>> {
        let rootfs = dir.join(ROOTFS_DIR);
        if !rootfs.is_dir() {
            return Ok(None);
        }

        let config_path = dir.join(IMAGE_CONFIG_FILE);
        let config: ImageConfig = if config_path.exists() {
            serde_json::from_str(&fs::read_to_string(&config_path)?)?
        } else {
            ImageConfig::default()
        };

        let reference = match (config.reference.as_deref(), fallback_reference) {
            (Some(reference), _) | (None, Some(reference)) => normalize_reference(reference),
            (None, None) => match dir.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.replace('+', ":").replace('_', "/"),
                None => return Ok(None),
            },
        };

        Ok(Some(ResolvedImage {
            id: image_id(&reference),
            reference,
            rootfs,
            cmd: config.cmd,
            env: config.env,
            working_dir: config.working_dir,
        }))
    }

    fn resolve_id(&self, prefix: &str) -> SkiffResult<Option<ResolvedImage>> {
        let mut matches = self
            .list()?
            .into_iter()
            .filter(|image| image.id.hash.starts_with(prefix));

        match (matches.next(), matches.next()) {
            (Some(image), None) => Ok(Some(image)),
            (None, _) => Ok(None),
            (Some(_), Some(_)) => Err(SkiffError::conflict(format!(
                "image id prefix {prefix} is ambiguous"
            ))),
        }
    }
}

fn looks_like_id(value: &str) -> Option<&str> {
    let hash = value.strip_prefix("sha256:").unwrap_or(value);
    let is_hex = hash.len() >= MIN_ID_PREFIX
        && hash.len() <= 64
        && hash.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    is_hex.then_some(hash)
}

impl ImageResolver for LocalImageStore {
    fn resolve(&self, reference: &str) -> SkiffResult<ResolvedImage> {
        let normalized = normalize_reference(reference);
        if let Some(image) = self.load(&self.image_dir(&normalized), Some(&normalized))? {
            tracing::debug!(reference = %image.reference, id = %image.id.short(), "Resolved image");
            return Ok(image);
        }

        if let Some(prefix) = looks_like_id(reference) {
            if let Some(image) = self.resolve_id(prefix)? {
                tracing::debug!(reference = %image.reference, id = %image.id.short(), "Resolved image by id");
                return Ok(image);
            }
        }

        Err(SkiffError::ImageNotFound {
            reference: reference.to_string(),
        })
    }

    fn list(&self) -> SkiffResult<Vec<ResolvedImage>> {
        let mut images = Vec::new();

        if !self.root.exists() {
            return Ok(images);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(image) = self.load(&entry.path(), None)? {
                    images.push(image);
                }
            }
        }

        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn busybox() -> ImageConfig {
        ImageConfig {
            cmd: vec!["sh".to_string()],
            env: vec!["PATH=/bin".to_string()],
            ..ImageConfig::default()
        }
    }

    #[test]
    fn normalizes_references() {
        assert_eq!(normalize_reference("busybox"), "busybox:latest");
        assert_eq!(normalize_reference("busybox:1.36"), "busybox:1.36");
        assert_eq!(
            normalize_reference("registry:5000/team/app"),
            "registry:5000/team/app:latest"
        );
    }

    #[test]
    fn resolve_by_reference() {
        let temp = tempdir().unwrap();
        let store = LocalImageStore::new(temp.path());
        store.register("busybox", &busybox()).unwrap();

        let image = store.resolve("busybox").unwrap();
        assert_eq!(image.reference, "busybox:latest");
        assert_eq!(image.cmd, vec!["sh".to_string()]);
        assert_eq!(store.resolve("busybox:latest").unwrap(), image);
    }

    #[test]
    fn resolve_by_id() {
        let temp = tempdir().unwrap();
        let store = LocalImageStore::new(temp.path());
        store.register("busybox", &busybox()).unwrap();
        store.register("alpine:3", &ImageConfig::default()).unwrap();

        let id = image_id("busybox:latest");
        assert_eq!(store.resolve(&id.hash).unwrap().reference, "busybox:latest");
        assert_eq!(store.resolve(&id.to_string()).unwrap().reference, "busybox:latest");
        assert_eq!(store.resolve(&id.hash[..8]).unwrap().reference, "busybox:latest");
    }

    #[test]
    fn missing_image() {
        let temp = tempdir().unwrap();
        let store = LocalImageStore::new(temp.path());
        let err = store.resolve("nothere").unwrap_err();
        assert!(matches!(err, SkiffError::ImageNotFound { .. }));
    }

    #[test]
    fn list_images() {
        let temp = tempdir().unwrap();
        let store = LocalImageStore::new(temp.path());
        store.register("busybox", &busybox()).unwrap();
        store.register("team/app:v1", &ImageConfig::default()).unwrap();
        std::fs::create_dir_all(temp.path().join("not-an-image")).unwrap();

        let references: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|image| image.reference)
            .collect();
        assert_eq!(references, vec!["busybox:latest", "team/app:v1"]);
    }
}
