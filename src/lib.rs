//! A render farm.
//!
//! Jobs are frame ranges split into allocations. One process on the farm
//! holds the coordinator lock in a shared SQLite database; it ingests job
//! descriptors from a drop directory and hands allocations to idle workers
//! over WebSocket sessions. Consoles connect the same way to watch and
//! steer the farm.

pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ingest;
pub mod net;
pub mod node;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use error::{FarmError, Result};
