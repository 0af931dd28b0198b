//! Container runtime core.
//!
//! This module provides the container entity, the registry holding all
//! containers and the [`LifecycleManager`] that drives them.

mod config;
mod container;
pub mod events;
mod lifecycle;
mod manager;
pub mod monitor;
mod registry;
mod store;

pub use config::RuntimeConfig;
pub use container::{
    Container, ContainerRecord, ExitRecord, START_FAILURE_EXIT_CODE, Settlement, Transition,
};
pub use events::{EventBus, RuntimeEvent};
pub use lifecycle::LifecyclePhase;
pub use manager::{LifecycleManager, ListFilter, RunOutcome};
pub use monitor::{ExitReport, ExitSink};
pub use registry::Registry;
pub use store::StateStore;
