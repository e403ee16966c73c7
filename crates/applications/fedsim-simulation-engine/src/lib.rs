//! Fedsim Simulation Engine
//!
//! Discrete-event simulator of client heterogeneity in federated learning:
//! a virtual clock, a per-client state machine with pluggable system
//! policies, and the round protocol that times coordinator/client exchanges.

pub mod clock;
pub mod config;
pub mod policies;
pub mod protocol;
pub mod simulator;
pub mod state;

pub use clock::VirtualClock;
pub use config::{PolicyConfig, SimulationConfig};
pub use policies::SystemPolicies;
pub use protocol::{with_completeness, Coordinator, Link, RoundProtocol, RoundReport};
pub use simulator::{Simulation, SimulationResult};
pub use state::ClientStateMachine;
