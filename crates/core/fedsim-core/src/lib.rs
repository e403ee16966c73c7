//! Fedsim Core - Shared types and traits
//!
//! This crate defines the core abstractions used by:
//! - fedsim-simulation-engine (virtual clock, state machine, round protocol)
//! - coordinators plugging sampling and aggregation logic into the engine
//!
//! Key types:
//! - ClientState / ClientVariables (per-client simulation record)
//! - Package (what a client sends back in a round)
//! - Policy traits (availability, connectivity, completeness, responsiveness)
//! - Error types

pub mod error;
pub mod package;
pub mod rng;
pub mod server;
pub mod traits;
pub mod types;

pub use error::*;
pub use package::*;
pub use rng::*;
pub use server::*;
pub use traits::*;
pub use types::*;
