//! Core types for the client population

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Client identity (index into the population, `0..N`)
pub type ClientId = usize;

/// Virtual time in discrete units
pub type Time = i64;

/// State of a simulated client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    /// Unreachable by the coordinator
    Offline,
    /// Reachable and eligible for sampling
    Idle,
    /// Picked for the current round
    Selected,
    /// Computing or uploading a response
    Working,
    /// Lost the connection mid-round
    Dropped,
}

impl ClientState {
    /// Every state, in declaration order
    pub const ALL: [ClientState; 5] = [
        ClientState::Offline,
        ClientState::Idle,
        ClientState::Selected,
        ClientState::Working,
        ClientState::Dropped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Offline => "offline",
            ClientState::Idle => "idle",
            ClientState::Selected => "selected",
            ClientState::Working => "working",
            ClientState::Dropped => "dropped",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientState {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClientState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| SimError::invalid_state(s))
    }
}

/// Names of the per-client variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    ProbAvailable,
    ProbUnavailable,
    ProbDrop,
    WorkingAmount,
    Latency,
    ModelSize,
    UploadPackageSize,
    DownloadPackageSize,
}

impl Variable {
    pub const ALL: [Variable; 8] = [
        Variable::ProbAvailable,
        Variable::ProbUnavailable,
        Variable::ProbDrop,
        Variable::WorkingAmount,
        Variable::Latency,
        Variable::ModelSize,
        Variable::UploadPackageSize,
        Variable::DownloadPackageSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Variable::ProbAvailable => "prob_available",
            Variable::ProbUnavailable => "prob_unavailable",
            Variable::ProbDrop => "prob_drop",
            Variable::WorkingAmount => "working_amount",
            Variable::Latency => "latency",
            Variable::ModelSize => "model_size",
            Variable::UploadPackageSize => "upload_package_size",
            Variable::DownloadPackageSize => "download_package_size",
        }
    }

    /// Look up a variable by its snake_case name
    pub fn from_name(name: &str) -> Option<Self> {
        Variable::ALL.into_iter().find(|v| v.as_str() == name)
    }
}

/// Value held by a client variable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Int(u64),
    Float(f64),
}

impl VariableValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            VariableValue::Int(v) => v as f64,
            VariableValue::Float(v) => v,
        }
    }

    /// Integer view; floats are rounded and clamped at zero
    pub fn as_u64(&self) -> u64 {
        match *self {
            VariableValue::Int(v) => v,
            VariableValue::Float(v) => v.max(0.0).round() as u64,
        }
    }
}

impl From<u64> for VariableValue {
    fn from(v: u64) -> Self {
        VariableValue::Int(v)
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        VariableValue::Float(v)
    }
}

/// Per-client variable record
///
/// The tunable fields are always present. The measured package sizes stay
/// `None` until the client has responded in a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientVariables {
    pub prob_available: f64,
    pub prob_unavailable: f64,
    pub prob_drop: f64,
    pub working_amount: u64,
    pub latency: u64,
    pub model_size: Option<u64>,
    pub upload_package_size: Option<u64>,
    pub download_package_size: Option<u64>,
}

impl ClientVariables {
    /// Always available, never drops, zero latency
    pub fn new(working_amount: u64) -> Self {
        ClientVariables {
            prob_available: 1.0,
            prob_unavailable: 0.0,
            prob_drop: 0.0,
            working_amount,
            latency: 0,
            model_size: None,
            upload_package_size: None,
            download_package_size: None,
        }
    }

    pub fn get(&self, var: Variable) -> Option<VariableValue> {
        match var {
            Variable::ProbAvailable => Some(self.prob_available.into()),
            Variable::ProbUnavailable => Some(self.prob_unavailable.into()),
            Variable::ProbDrop => Some(self.prob_drop.into()),
            Variable::WorkingAmount => Some(self.working_amount.into()),
            Variable::Latency => Some(self.latency.into()),
            Variable::ModelSize => self.model_size.map(VariableValue::from),
            Variable::UploadPackageSize => self.upload_package_size.map(VariableValue::from),
            Variable::DownloadPackageSize => self.download_package_size.map(VariableValue::from),
        }
    }

    pub fn set(&mut self, var: Variable, value: VariableValue) {
        match var {
            Variable::ProbAvailable => self.prob_available = value.as_f64(),
            Variable::ProbUnavailable => self.prob_unavailable = value.as_f64(),
            Variable::ProbDrop => self.prob_drop = value.as_f64(),
            Variable::WorkingAmount => self.working_amount = value.as_u64(),
            Variable::Latency => self.latency = value.as_u64(),
            Variable::ModelSize => self.model_size = Some(value.as_u64()),
            Variable::UploadPackageSize => self.upload_package_size = Some(value.as_u64()),
            Variable::DownloadPackageSize => self.download_package_size = Some(value.as_u64()),
        }
    }

    /// Total transferred size measured in the last response
    pub fn transferred_size(&self) -> u64 {
        self.upload_package_size.unwrap_or(0) + self.download_package_size.unwrap_or(0)
    }
}

/// Countdown counters; at most one is non-zero at a time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounters {
    pub dropped_counter: u64,
    pub latency_counter: u64,
}
