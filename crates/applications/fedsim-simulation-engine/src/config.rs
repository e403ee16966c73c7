//! Simulation configuration
//!
//! Loaded from JSON (every field optional, falling back to [`Default`]) and
//! refined with builder methods or CLI overrides.

use std::fs;
use std::path::Path;

use fedsim_core::{Result, SimError};
use serde::{Deserialize, Serialize};

use crate::policies::{
    BandwidthResponsiveness, LogNormalResponsiveness, PeriodicAvailability, RandomCompleteness,
    StaticAvailability, StaticConnectivity, SystemPolicies,
};

/// Availability policy selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AvailabilityConfig {
    #[default]
    None,
    Static {
        prob_available: f64,
        prob_unavailable: f64,
    },
    Periodic {
        period: u64,
        peak: f64,
        trough: f64,
    },
}

/// Connectivity policy selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectivityConfig {
    #[default]
    None,
    Static { prob_drop: f64 },
}

/// Completeness policy selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompletenessConfig {
    #[default]
    None,
    Random { min_fraction: f64 },
}

/// Responsiveness policy selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponsivenessConfig {
    #[default]
    None,
    Bandwidth { base_latency: u64, bandwidth: u64 },
    LogNormal { mu: f64, sigma: f64, max_latency: u64 },
}

/// One policy choice per capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub availability: AvailabilityConfig,
    pub connectivity: ConnectivityConfig,
    pub completeness: CompletenessConfig,
    pub responsiveness: ResponsivenessConfig,
}

fn check_probability(name: &str, p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(SimError::config(format!("{name} must be within [0, 1], got {p}")))
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        match self.availability {
            AvailabilityConfig::None => {}
            AvailabilityConfig::Static {
                prob_available,
                prob_unavailable,
            } => {
                check_probability("prob_available", prob_available)?;
                check_probability("prob_unavailable", prob_unavailable)?;
            }
            AvailabilityConfig::Periodic { period, peak, trough } => {
                if period == 0 {
                    return Err(SimError::config("availability period must be positive"));
                }
                check_probability("peak", peak)?;
                check_probability("trough", trough)?;
            }
        }
        if let ConnectivityConfig::Static { prob_drop } = self.connectivity {
            check_probability("prob_drop", prob_drop)?;
        }
        if let CompletenessConfig::Random { min_fraction } = self.completeness {
            if !(min_fraction > 0.0 && min_fraction <= 1.0) {
                return Err(SimError::config(format!(
                    "min_fraction must be within (0, 1], got {min_fraction}"
                )));
            }
        }
        match self.responsiveness {
            ResponsivenessConfig::Bandwidth { bandwidth: 0, .. } => {
                Err(SimError::config("bandwidth must be positive"))
            }
            ResponsivenessConfig::LogNormal { sigma, .. } if !(sigma >= 0.0) => Err(
                SimError::config(format!("sigma must be non-negative, got {sigma}")),
            ),
            _ => Ok(()),
        }
    }

    /// Build the policies; `num_steps` is the full workload of each client
    pub fn build(&self, num_steps: &[u64]) -> Result<SystemPolicies> {
        self.validate()?;
        let mut policies = SystemPolicies::new();
        policies = match self.availability {
            AvailabilityConfig::None => policies,
            AvailabilityConfig::Static {
                prob_available,
                prob_unavailable,
            } => policies.with_availability(StaticAvailability::new(prob_available, prob_unavailable)),
            AvailabilityConfig::Periodic { period, peak, trough } => {
                policies.with_availability(PeriodicAvailability::new(period, peak, trough))
            }
        };
        policies = match self.connectivity {
            ConnectivityConfig::None => policies,
            ConnectivityConfig::Static { prob_drop } => {
                policies.with_connectivity(StaticConnectivity::new(prob_drop))
            }
        };
        policies = match self.completeness {
            CompletenessConfig::None => policies,
            CompletenessConfig::Random { min_fraction } => policies
                .with_completeness(RandomCompleteness::new(num_steps.to_vec(), min_fraction)),
        };
        policies = match self.responsiveness {
            ResponsivenessConfig::None => policies,
            ResponsivenessConfig::Bandwidth {
                base_latency,
                bandwidth,
            } => policies.with_responsiveness(BandwidthResponsiveness::new(base_latency, bandwidth)),
            ResponsivenessConfig::LogNormal {
                mu,
                sigma,
                max_latency,
            } => {
                let policy = LogNormalResponsiveness::new(mu, sigma, max_latency).ok_or_else(|| {
                    SimError::config(format!("invalid lognormal parameters mu={mu} sigma={sigma}"))
                })?;
                policies.with_responsiveness(policy)
            }
        };
        Ok(policies)
    }
}

/// Configuration of a synthetic simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Size of the client population
    pub num_clients: usize,
    /// Clients sampled per round
    pub clients_per_round: usize,
    /// Rounds to simulate
    pub num_rounds: u64,
    /// Local steps per client per round
    pub num_steps: u64,
    /// Seed of the simulation's random streams
    pub seed: u64,
    /// Synchronous wait budget per round
    pub tolerance_for_latency: u64,
    /// Collect without waiting
    pub asynchronous: bool,
    /// Toggle availability at most once per round
    pub roundwise_fixed_availability: bool,
    /// Parameters in each synthetic model package
    pub model_params: usize,
    pub policies: PolicyConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_clients: 100,
            clients_per_round: 10,
            num_rounds: 20,
            num_steps: 10,
            seed: 0,
            tolerance_for_latency: 10,
            asynchronous: false,
            roundwise_fixed_availability: false,
            model_params: 64,
            policies: PolicyConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Read a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| SimError::config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SimError::config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_clients == 0 {
            return Err(SimError::config("num_clients must be positive"));
        }
        if self.clients_per_round > self.num_clients {
            return Err(SimError::config(format!(
                "clients_per_round ({}) exceeds num_clients ({})",
                self.clients_per_round, self.num_clients
            )));
        }
        self.policies.validate()
    }

    pub fn with_clients(mut self, num_clients: usize) -> Self {
        self.num_clients = num_clients;
        self
    }

    pub fn with_clients_per_round(mut self, clients_per_round: usize) -> Self {
        self.clients_per_round = clients_per_round;
        self
    }

    pub fn with_rounds(mut self, num_rounds: u64) -> Self {
        self.num_rounds = num_rounds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tolerance_for_latency(mut self, tolerance: u64) -> Self {
        self.tolerance_for_latency = tolerance;
        self
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_roundwise_fixed_availability(mut self, enabled: bool) -> Self {
        self.roundwise_fixed_availability = enabled;
        self
    }

    pub fn with_policies(mut self, policies: PolicyConfig) -> Self {
        self.policies = policies;
        self
    }
}
