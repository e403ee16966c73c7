//! System policies for client heterogeneity
//!
//! Implements policies that plug into the state machine:
//! - Availability: static or periodic (day/night) online probabilities
//! - Connectivity: static dropout probability
//! - Completeness: randomly truncated local workload
//! - Responsiveness: bandwidth-derived or lognormal latency
//!
//! Every policy defaults to [`NoOpPolicy`], which keeps variables unchanged.

use fedsim_core::{
    rng, AvailabilityPolicy, ClientId, CompletenessPolicy, ConnectivityPolicy, NoOpPolicy,
    PolicyContext, ResponsivenessPolicy,
};
use rand_distr::{Distribution, LogNormal};

/// The four policies a state machine consults
pub struct SystemPolicies {
    pub availability: Box<dyn AvailabilityPolicy>,
    pub connectivity: Box<dyn ConnectivityPolicy>,
    pub completeness: Box<dyn CompletenessPolicy>,
    pub responsiveness: Box<dyn ResponsivenessPolicy>,
}

impl Default for SystemPolicies {
    fn default() -> Self {
        SystemPolicies {
            availability: Box::new(NoOpPolicy),
            connectivity: Box::new(NoOpPolicy),
            completeness: Box::new(NoOpPolicy),
            responsiveness: Box::new(NoOpPolicy),
        }
    }
}

impl SystemPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_availability(mut self, policy: impl AvailabilityPolicy + 'static) -> Self {
        self.availability = Box::new(policy);
        self
    }

    pub fn with_connectivity(mut self, policy: impl ConnectivityPolicy + 'static) -> Self {
        self.connectivity = Box::new(policy);
        self
    }

    pub fn with_completeness(mut self, policy: impl CompletenessPolicy + 'static) -> Self {
        self.completeness = Box::new(policy);
        self
    }

    pub fn with_responsiveness(mut self, policy: impl ResponsivenessPolicy + 'static) -> Self {
        self.responsiveness = Box::new(policy);
        self
    }

    /// Policy names as (availability, connectivity, completeness, responsiveness)
    pub fn names(&self) -> [&str; 4] {
        [
            self.availability.name(),
            self.connectivity.name(),
            self.completeness.name(),
            self.responsiveness.name(),
        ]
    }
}

/// Same online/offline probabilities for every client, every tick
#[derive(Debug, Clone, Copy)]
pub struct StaticAvailability {
    pub prob_available: f64,
    pub prob_unavailable: f64,
}

impl StaticAvailability {
    pub fn new(prob_available: f64, prob_unavailable: f64) -> Self {
        StaticAvailability {
            prob_available,
            prob_unavailable,
        }
    }
}

impl AvailabilityPolicy for StaticAvailability {
    fn update(&mut self, ids: &[ClientId], ctx: &mut PolicyContext<'_>) {
        for &cid in ids {
            if let Some(vars) = ctx.variables.get_mut(cid) {
                vars.prob_available = self.prob_available;
                vars.prob_unavailable = self.prob_unavailable;
            }
        }
    }

    fn name(&self) -> &str {
        "Static"
    }
}

/// Availability following a sinusoidal day/night cycle over flush ticks
///
/// Clients are spread evenly over the cycle so that the population is never
/// entirely online or offline at once.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicAvailability {
    /// Ticks per full cycle
    pub period: u64,
    /// Probability of coming online at the peak of the cycle
    pub peak: f64,
    /// Probability of coming online at the trough of the cycle
    pub trough: f64,
}

impl PeriodicAvailability {
    pub fn new(period: u64, peak: f64, trough: f64) -> Self {
        PeriodicAvailability {
            period: period.max(1),
            peak,
            trough,
        }
    }

    /// Online probability of `cid` (out of `n`) at `tick`
    pub fn prob_available_at(&self, tick: u64, cid: ClientId, n: usize) -> f64 {
        let offset = cid as f64 / n.max(1) as f64;
        let phase = tick as f64 / self.period as f64 + offset;
        let wave = 0.5 * (1.0 + (2.0 * std::f64::consts::PI * phase).sin());
        self.trough + (self.peak - self.trough) * wave
    }
}

impl AvailabilityPolicy for PeriodicAvailability {
    fn update(&mut self, ids: &[ClientId], ctx: &mut PolicyContext<'_>) {
        let n = ctx.variables.len();
        for &cid in ids {
            let p = self.prob_available_at(ctx.tick, cid, n);
            if let Some(vars) = ctx.variables.get_mut(cid) {
                vars.prob_available = p;
                vars.prob_unavailable = 1.0 - p;
            }
        }
    }

    fn name(&self) -> &str {
        "Periodic"
    }
}

/// Same dropout probability for every selected client
#[derive(Debug, Clone, Copy)]
pub struct StaticConnectivity {
    pub prob_drop: f64,
}

impl StaticConnectivity {
    pub fn new(prob_drop: f64) -> Self {
        StaticConnectivity { prob_drop }
    }
}

impl ConnectivityPolicy for StaticConnectivity {
    fn update(&mut self, ids: &[ClientId], ctx: &mut PolicyContext<'_>) {
        for &cid in ids {
            if let Some(vars) = ctx.variables.get_mut(cid) {
                vars.prob_drop = self.prob_drop;
            }
        }
    }

    fn name(&self) -> &str {
        "Static"
    }
}

/// Workload drawn uniformly in `[min_fraction * num_steps, num_steps]`
#[derive(Debug, Clone)]
pub struct RandomCompleteness {
    num_steps: Vec<u64>,
    min_fraction: f64,
}

impl RandomCompleteness {
    /// # Arguments
    /// * `num_steps` - Full step count of each client, indexed by id
    /// * `min_fraction` - Smallest share of the full workload a client may do
    pub fn new(num_steps: Vec<u64>, min_fraction: f64) -> Self {
        RandomCompleteness {
            num_steps,
            min_fraction: min_fraction.clamp(0.0, 1.0),
        }
    }
}

impl CompletenessPolicy for RandomCompleteness {
    fn update(&mut self, ids: &[ClientId], ctx: &mut PolicyContext<'_>) {
        for &cid in ids {
            let Some(&full) = self.num_steps.get(cid) else {
                continue;
            };
            let fraction = self.min_fraction + (1.0 - self.min_fraction) * rng::uniform(&mut *ctx.rng);
            if let Some(vars) = ctx.variables.get_mut(cid) {
                // at least one step whenever the client has any work
                vars.working_amount = ((full as f64 * fraction).ceil() as u64).clamp(full.min(1), full);
            }
        }
    }

    fn name(&self) -> &str {
        "Random"
    }
}

/// Latency = base + ceil(transferred size / bandwidth)
///
/// Transferred size is the measured upload plus download package size.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthResponsiveness {
    pub base_latency: u64,
    /// Size units transferred per unit of virtual time
    pub bandwidth: u64,
}

impl BandwidthResponsiveness {
    pub fn new(base_latency: u64, bandwidth: u64) -> Self {
        BandwidthResponsiveness {
            base_latency,
            bandwidth: bandwidth.max(1),
        }
    }
}

impl ResponsivenessPolicy for BandwidthResponsiveness {
    fn update(&mut self, ids: &[ClientId], ctx: &mut PolicyContext<'_>) {
        for &cid in ids {
            if let Some(vars) = ctx.variables.get_mut(cid) {
                vars.latency = self.base_latency + vars.transferred_size().div_ceil(self.bandwidth);
            }
        }
    }

    fn name(&self) -> &str {
        "Bandwidth"
    }
}

/// Latency drawn from a lognormal distribution, rounded up, capped at `max_latency`
#[derive(Debug, Clone, Copy)]
pub struct LogNormalResponsiveness {
    distribution: LogNormal<f64>,
    max_latency: u64,
}

impl LogNormalResponsiveness {
    /// Returns `None` when `sigma` is negative or not finite
    pub fn new(mu: f64, sigma: f64, max_latency: u64) -> Option<Self> {
        if !(sigma >= 0.0 && sigma.is_finite()) {
            return None;
        }
        let distribution = LogNormal::new(mu, sigma).ok()?;
        Some(LogNormalResponsiveness {
            distribution,
            max_latency,
        })
    }
}

impl ResponsivenessPolicy for LogNormalResponsiveness {
    fn update(&mut self, ids: &[ClientId], ctx: &mut PolicyContext<'_>) {
        for &cid in ids {
            let sample: f64 = self.distribution.sample(&mut *ctx.rng);
            if let Some(vars) = ctx.variables.get_mut(cid) {
                vars.latency = (sample.ceil() as u64).min(self.max_latency);
            }
        }
    }

    fn name(&self) -> &str {
        "LogNormal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedsim_core::{seeded, ClientVariables};

    fn population(n: usize) -> Vec<ClientVariables> {
        (0..n).map(|_| ClientVariables::new(10)).collect()
    }

    #[test]
    fn test_default_policies_are_noop() {
        let policies = SystemPolicies::default();
        assert_eq!(policies.names(), ["none"; 4]);

        let mut vars = population(2);
        let before = vars.clone();
        let mut rng = seeded(0);
        let mut policies = policies;
        let mut ctx = PolicyContext { round: 0, tick: 0, variables: &mut vars, rng: &mut rng };
        policies.availability.update(&[0, 1], &mut ctx);
        policies.responsiveness.update(&[0, 1], &mut ctx);
        assert_eq!(vars, before);
    }

    #[test]
    fn test_static_policies() {
        let mut vars = population(3);
        let mut rng = seeded(0);
        let mut ctx = PolicyContext { round: 0, tick: 0, variables: &mut vars, rng: &mut rng };

        StaticAvailability::new(0.7, 0.2).update(&[0, 2], &mut ctx);
        StaticConnectivity::new(0.1).update(&[1], &mut ctx);

        assert_eq!(vars[0].prob_available, 0.7);
        assert_eq!(vars[2].prob_unavailable, 0.2);
        assert_eq!(vars[1].prob_available, 1.0);
        assert_eq!(vars[1].prob_drop, 0.1);
    }

    #[test]
    fn test_periodic_availability_stays_in_bounds() {
        let policy = PeriodicAvailability::new(24, 0.9, 0.1);
        for tick in 0..48 {
            for cid in 0..5 {
                let p = policy.prob_available_at(tick, cid, 5);
                assert!((0.1 - 1e-9..=0.9 + 1e-9).contains(&p));
            }
        }
        // a quarter cycle in, client 0 is at its peak
        assert!((policy.prob_available_at(6, 0, 5) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_random_completeness_bounds() {
        let mut vars = population(4);
        let mut rng = seeded(3);
        let mut policy = RandomCompleteness::new(vec![10, 10, 10, 0], 0.5);
        for _ in 0..50 {
            let mut ctx = PolicyContext { round: 0, tick: 0, variables: &mut vars, rng: &mut rng };
            policy.update(&[0, 1, 2, 3], &mut ctx);
            for v in &vars[..3] {
                assert!((5..=10).contains(&v.working_amount));
            }
            assert_eq!(vars[3].working_amount, 0);
        }
    }

    #[test]
    fn test_bandwidth_latency_grows_with_size() {
        let mut vars = population(2);
        vars[0].upload_package_size = Some(100);
        vars[0].download_package_size = Some(100);
        vars[1].upload_package_size = Some(1000);
        let mut rng = seeded(0);
        let mut ctx = PolicyContext { round: 0, tick: 0, variables: &mut vars, rng: &mut rng };

        BandwidthResponsiveness::new(1, 100).update(&[0, 1], &mut ctx);
        assert_eq!(vars[0].latency, 3);
        assert_eq!(vars[1].latency, 11);
    }

    #[test]
    fn test_lognormal_latency_capped() {
        assert!(LogNormalResponsiveness::new(0.0, -1.0, 10).is_none());
        assert!(LogNormalResponsiveness::new(0.0, f64::NAN, 10).is_none());
        assert!(LogNormalResponsiveness::new(0.0, f64::INFINITY, 10).is_none());

        let mut policy = LogNormalResponsiveness::new(3.0, 1.0, 15).unwrap();
        let mut vars = population(20);
        let ids: Vec<ClientId> = (0..20).collect();
        let mut rng = seeded(9);
        let mut ctx = PolicyContext { round: 0, tick: 0, variables: &mut vars, rng: &mut rng };
        policy.update(&ids, &mut ctx);
        assert!(vars.iter().all(|v| v.latency <= 15));
    }
}
