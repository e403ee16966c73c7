//! Core traits for Fedsim
//!
//! The engine talks to the outside world only through these seams: the
//! server handle, the per-tick flush hook, the four system policies and the
//! workload knob of a client.

use std::rc::Rc;

use crate::rng::SimRng;
use crate::types::{ClientId, ClientVariables};

/// Coordinator-side facts the engine reads
pub trait ServerHandle {
    /// Current round; never decreases
    fn current_round(&self) -> u64;

    /// Maximum virtual time the coordinator waits for synchronous responses
    fn tolerance_for_latency(&self) -> u64;
}

impl<T: ServerHandle + ?Sized> ServerHandle for Rc<T> {
    fn current_round(&self) -> u64 {
        (**self).current_round()
    }

    fn tolerance_for_latency(&self) -> u64 {
        (**self).tolerance_for_latency()
    }
}

/// Invoked once per unit of virtual time
pub trait FlushHook {
    fn flush(&mut self);
}

/// What a policy may look at and change
pub struct PolicyContext<'a> {
    /// Current coordinator round
    pub round: u64,
    /// Number of flushes performed so far
    pub tick: u64,
    /// Variable records of the whole population, indexed by client id
    pub variables: &'a mut [ClientVariables],
    /// The simulation's shared random stream
    pub rng: &'a mut SimRng,
}

/// Time-varying availability: writes `prob_available` / `prob_unavailable`
/// before the idle/offline toggle of every flush
pub trait AvailabilityPolicy {
    fn update(&mut self, _ids: &[ClientId], _ctx: &mut PolicyContext<'_>) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Connection quality: writes `prob_drop` before the dropout draw
pub trait ConnectivityPolicy {
    fn update(&mut self, _ids: &[ClientId], _ctx: &mut PolicyContext<'_>) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Local workload: writes `working_amount` before communication
pub trait CompletenessPolicy {
    fn update(&mut self, _ids: &[ClientId], _ctx: &mut PolicyContext<'_>) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Response time: writes `latency` once package sizes are measured
pub trait ResponsivenessPolicy {
    fn update(&mut self, _ids: &[ClientId], _ctx: &mut PolicyContext<'_>) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Default policy: keeps every variable as it is
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpPolicy;

impl AvailabilityPolicy for NoOpPolicy {}
impl ConnectivityPolicy for NoOpPolicy {}
impl CompletenessPolicy for NoOpPolicy {}
impl ResponsivenessPolicy for NoOpPolicy {}

/// A client whose local step count can be overridden for one computation
pub trait WorkloadClient {
    fn num_steps(&self) -> u64;
    fn set_num_steps(&mut self, steps: u64);
}
