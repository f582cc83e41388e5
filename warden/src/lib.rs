//! Single-host manager for isolated code-execution sandboxes.
//!
//! The [`Registry`] owns every sandbox: it issues IDs, enforces the
//! concurrency ceiling, delegates environment setup to the backend
//! provisioners, dispatches executions, and reaps processes and disk state
//! on destroy. Callers are expected to be in-process; there is no network
//! surface at this layer.

pub mod config;
mod dispatch;
mod error;
mod reaper;
mod registry;

pub use config::WardenConfig;
pub use error::{WardenError, WardenResult};
pub use reaper::spawn_sweeper;
pub use registry::Registry;
