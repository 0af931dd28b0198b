//! # Skiff Container Lifecycle Manager
//!
//! Skiff turns run requests into isolated Linux processes and keeps track of
//! them until they are removed.
//!
//! ## Features
//!
//! - **Run requests**: a validated [`RunSpec`] built from CLI-style options
//! - **Isolation**: private or shared IPC/UTS namespaces, capabilities, seccomp and AppArmor
//! - **Restart policies**: `no`, `always`, `on-failure[:N]` and `unless-stopped` with backoff
//! - **Registry**: lookup by ID, name or ID prefix with atomic name reservation
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use skiff::exec::NativeRuntime;
//! use skiff::image::LocalImageStore;
//! use skiff::runtime::{LifecycleManager, RuntimeConfig};
//! use skiff::RunSpec;
//!
//! # async fn example() -> skiff_common::SkiffResult<()> {
//! let config = RuntimeConfig::default();
//! let runtime = Arc::new(NativeRuntime::new(config.paths.clone()));
//! let images = Arc::new(LocalImageStore::new(config.paths.images()));
//! let manager = LifecycleManager::new(config, runtime, images)?;
//!
//! let spec = RunSpec::builder("busybox")
//!     .command(["sh", "-c", "exit 101"])
//!     .build()?;
//!
//! let outcome = manager.run(spec).await?;
//! assert_eq!(outcome.exit_code, Some(101));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod exec;
pub mod image;
pub mod isolation;
pub mod restart;
pub mod runspec;
pub mod runtime;

pub use restart::RestartPolicy;
pub use runspec::{RunSpec, RunSpecBuilder};
pub use runtime::LifecycleManager;
