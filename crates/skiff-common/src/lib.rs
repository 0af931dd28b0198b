//! # skiff-common
//!
//! Shared utilities and types for the Skiff container lifecycle manager.
//!
//! This crate provides common functionality used across all Skiff crates:
//! - Container ID generation and name validation
//! - Standard filesystem paths
//! - The error taxonomy shared by the manager and its collaborators

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ErrorKind, SkiffError, SkiffResult};
pub use id::{ContainerId, ContainerName, Digest};
pub use paths::SkiffPaths;
