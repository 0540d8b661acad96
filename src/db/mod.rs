//! Database module.
//!
//! SQLite storage with embedded migrations: device registry, data targets,
//! delivery log and the message bus log.

mod bus_log;
mod models;
mod registry;
mod seed;
mod store;
mod targets;

pub use models::*;
pub use seed::*;
pub use store::*;
pub use targets::LoadedTargets;
