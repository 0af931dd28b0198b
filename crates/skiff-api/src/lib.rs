//! # skiff-api
//!
//! Types exchanged between the Skiff lifecycle manager and its callers.
//!
//! This crate provides:
//! - The container lifecycle state enumeration
//! - Container descriptors returned by `inspect` and `list`

#![warn(missing_docs)]

pub mod descriptor;
pub mod state;

pub use descriptor::{
    ConfigDescriptor, ContainerDescriptor, HostConfigDescriptor, RestartPolicyDescriptor,
    StateDescriptor,
};
pub use state::LifecycleState;
