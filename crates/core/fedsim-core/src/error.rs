//! Error types for Fedsim

use thiserror::Error;

use crate::types::{ClientId, Time};

/// Result type for simulation operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Core error type for simulation operations
///
/// Every variant is a contract violation by the caller. Modeled outcomes
/// (unavailable, dropped or overdue clients) are never reported as errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    /// Attempt to move virtual time backwards
    #[error("Cannot inverse virtual time: current {current}, requested {requested}")]
    TimeInversion { current: Time, requested: Time },

    /// Negative arrival time on the clock queue
    #[error("Invalid arrival time: {0}")]
    InvalidTime(Time),

    /// Unrecognized client state label
    #[error("{0} is not a valid client state")]
    InvalidState(String),

    /// Id list and value list differ in length
    #[error("Arity mismatch: {ids} client ids but {values} values")]
    ArityMismatch { ids: usize, values: usize },

    /// Client id outside the simulated population
    #[error("Client {0} not found")]
    ClientNotFound(ClientId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SimError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(label: impl Into<String>) -> Self {
        Self::InvalidState(label.into())
    }
}
