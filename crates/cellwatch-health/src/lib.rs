//! cellwatch-health - the health-check registry boundary.
//!
//! The topology watcher only tells a registry which endpoints exist;
//! probing them and tracking their health is the registry's business.
//! [`HealthCheck`] is that two-call capability set, and
//! [`EndpointRegistry`] is an in-memory implementation of it.

pub mod registry;

pub use registry::{EndpointEntry, EndpointRegistry, HealthCheck};
