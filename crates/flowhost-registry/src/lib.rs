//! Session registry and lifecycle management for flowhost.
//!
//! Provides:
//! - `Session` - One tracked execution attempt
//! - `SessionRegistry` - The authoritative session map with background sweep

pub mod registry;
pub mod session;

pub use registry::{RegistryError, RegistryStats, SessionRegistry};
pub use session::{Session, SessionSnapshot};
