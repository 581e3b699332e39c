//! Ephemera - ephemeral browser-sandbox containers behind an HTTP API.
//!
//! Containers are provisioned on demand, recorded in a durable store and
//! reclaimed automatically once their TTL runs out, including after a
//! process restart.

pub mod config;
pub mod error;
pub mod http_server;
pub mod lifecycle;
pub mod ports;
pub mod record;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::{Error, Result};
pub use lifecycle::{DeleteOutcome, DeleteReason, LifecycleConfig, LifecycleManager};
pub use record::{ContainerRecord, ContainerState};
