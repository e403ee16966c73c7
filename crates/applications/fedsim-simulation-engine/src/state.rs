//! Per-client state machine
//!
//! Owns the state, variables and countdown counters of every client and
//! evolves them once per unit of virtual time through [`FlushHook::flush`].
//!
//! ```text
//!            prob_available            sampled
//!   offline ───────────────► idle ─────────────► selected
//!      ▲  ◄───────────────    ▲                    │    │
//!      │   prob_unavailable   │ overdue        drop│    │ transmit
//!      │                      │                    ▼    ▼
//!      │                      └──── dropped      working
//!      │  dropout resolved (prob_unavailable)         │
//!      └──────────────────────────────────────────────┘ received
//! ```

use std::rc::Rc;

use fedsim_core::{
    rng, ClientId, ClientState, ClientVariables, FlushHook, PolicyContext, Result, ServerHandle,
    SimError, SimRng, StateCounters, Variable, VariableValue,
};
use tracing::{debug, info};

use crate::policies::SystemPolicies;

/// State machine for the whole client population
pub struct ClientStateMachine {
    server: Rc<dyn ServerHandle>,
    states: Vec<ClientState>,
    variables: Vec<ClientVariables>,
    counters: Vec<StateCounters>,
    rng: SimRng,
    policies: SystemPolicies,
    roundwise_fixed_availability: bool,
    availability_latest_round: Option<u64>,
    ticks: u64,
}

impl ClientStateMachine {
    /// Every client starts idle with its configured step count as workload
    ///
    /// # Arguments
    /// * `server` - Handle providing the current round and latency tolerance
    /// * `num_steps` - Local step count of each client, indexed by id
    /// * `rng` - The simulation's random stream
    pub fn new(server: Rc<dyn ServerHandle>, num_steps: &[u64], rng: SimRng) -> Self {
        ClientStateMachine {
            server,
            states: vec![ClientState::Idle; num_steps.len()],
            variables: num_steps.iter().map(|&s| ClientVariables::new(s)).collect(),
            counters: vec![StateCounters::default(); num_steps.len()],
            rng,
            policies: SystemPolicies::default(),
            roundwise_fixed_availability: false,
            availability_latest_round: None,
            ticks: 0,
        }
    }

    /// Set the system policies
    pub fn with_policies(mut self, policies: SystemPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Toggle availability at most once per round
    pub fn with_roundwise_fixed_availability(mut self, enabled: bool) -> Self {
        self.roundwise_fixed_availability = enabled;
        self
    }

    pub fn num_clients(&self) -> usize {
        self.states.len()
    }

    pub fn all_clients(&self) -> Vec<ClientId> {
        (0..self.states.len()).collect()
    }

    pub fn server(&self) -> &dyn ServerHandle {
        self.server.as_ref()
    }

    pub fn policies(&self) -> &SystemPolicies {
        &self.policies
    }

    /// Number of flushes performed so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn state(&self, cid: ClientId) -> Option<ClientState> {
        self.states.get(cid).copied()
    }

    pub fn states(&self) -> &[ClientState] {
        &self.states
    }

    pub fn counters(&self, cid: ClientId) -> Option<StateCounters> {
        self.counters.get(cid).copied()
    }

    pub fn variables(&self, cid: ClientId) -> Option<&ClientVariables> {
        self.variables.get(cid)
    }

    /// Ids currently in `state`, ascending
    pub fn clients_in_state(&self, state: ClientState) -> Vec<ClientId> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == state)
            .map(|(cid, _)| cid)
            .collect()
    }

    pub fn idle_clients(&self) -> Vec<ClientId> {
        self.clients_in_state(ClientState::Idle)
    }

    pub fn working_clients(&self) -> Vec<ClientId> {
        self.clients_in_state(ClientState::Working)
    }

    pub fn offline_clients(&self) -> Vec<ClientId> {
        self.clients_in_state(ClientState::Offline)
    }

    pub fn selected_clients(&self) -> Vec<ClientId> {
        self.clients_in_state(ClientState::Selected)
    }

    pub fn dropped_clients(&self) -> Vec<ClientId> {
        self.clients_in_state(ClientState::Dropped)
    }

    fn check_ids(&self, ids: &[ClientId]) -> Result<()> {
        match ids.iter().find(|&&cid| cid >= self.states.len()) {
            Some(&cid) => Err(SimError::ClientNotFound(cid)),
            None => Ok(()),
        }
    }

    /// Move `ids` into `state`, applying its entry action
    ///
    /// - dropped: latency counter cleared, dropped counter = tolerance for latency
    /// - working: dropped counter cleared, latency counter = client latency
    /// - idle: both counters cleared
    pub fn set_client_state(&mut self, ids: &[ClientId], state: ClientState) -> Result<()> {
        self.check_ids(ids)?;
        let tolerance = self.server.tolerance_for_latency();
        for &cid in ids {
            self.states[cid] = state;
            let counters = &mut self.counters[cid];
            match state {
                ClientState::Dropped => {
                    counters.latency_counter = 0;
                    counters.dropped_counter = tolerance;
                }
                ClientState::Working => {
                    counters.dropped_counter = 0;
                    counters.latency_counter = self.variables[cid].latency;
                }
                ClientState::Idle => *counters = StateCounters::default(),
                ClientState::Offline | ClientState::Selected => {}
            }
        }
        Ok(())
    }

    /// Same as [`set_client_state`](Self::set_client_state) with a state label
    pub fn set_client_state_by_name(&mut self, ids: &[ClientId], state: &str) -> Result<()> {
        let state = state.parse::<ClientState>()?;
        self.set_client_state(ids, state)
    }

    /// Value of `var` for each id; `None` where it is not set or the id is unknown
    pub fn get_variable(&self, ids: &[ClientId], var: Variable) -> Vec<Option<VariableValue>> {
        ids.iter()
            .map(|&cid| self.variables.get(cid).and_then(|v| v.get(var)))
            .collect()
    }

    /// Like [`get_variable`](Self::get_variable); unknown names yield `None` per id
    pub fn get_variable_by_name(&self, ids: &[ClientId], name: &str) -> Vec<Option<VariableValue>> {
        match Variable::from_name(name) {
            Some(var) => self.get_variable(ids, var),
            None => vec![None; ids.len()],
        }
    }

    pub fn set_variable(
        &mut self,
        ids: &[ClientId],
        var: Variable,
        values: &[VariableValue],
    ) -> Result<()> {
        if ids.len() != values.len() {
            return Err(SimError::ArityMismatch {
                ids: ids.len(),
                values: values.len(),
            });
        }
        self.check_ids(ids)?;
        for (&cid, &value) in ids.iter().zip(values) {
            self.variables[cid].set(var, value);
        }
        Ok(())
    }

    /// Latency of each id (0 for unknown ids)
    pub fn latencies(&self, ids: &[ClientId]) -> Vec<u64> {
        ids.iter()
            .map(|&cid| self.variables.get(cid).map_or(0, |v| v.latency))
            .collect()
    }

    /// One uniform draw from the shared stream
    pub fn draw(&mut self) -> f64 {
        rng::uniform(&mut self.rng)
    }

    fn policy_context(&mut self) -> (&mut SystemPolicies, PolicyContext<'_>) {
        let ctx = PolicyContext {
            round: self.server.current_round(),
            tick: self.ticks,
            variables: &mut self.variables,
            rng: &mut self.rng,
        };
        (&mut self.policies, ctx)
    }

    pub fn update_client_availability(&mut self) {
        let ids = self.all_clients();
        let (policies, mut ctx) = self.policy_context();
        policies.availability.update(&ids, &mut ctx);
    }

    pub fn update_client_connectivity(&mut self, ids: &[ClientId]) {
        let (policies, mut ctx) = self.policy_context();
        policies.connectivity.update(ids, &mut ctx);
    }

    pub fn update_client_completeness(&mut self, ids: &[ClientId]) {
        let (policies, mut ctx) = self.policy_context();
        policies.completeness.update(ids, &mut ctx);
    }

    pub fn update_client_responsiveness(&mut self, ids: &[ClientId]) {
        let (policies, mut ctx) = self.policy_context();
        policies.responsiveness.update(ids, &mut ctx);
    }

    fn toggle_availability(&mut self) {
        let round = self.server.current_round();
        let idle = self.idle_clients();
        let round_changed = self.availability_latest_round.is_none_or(|latest| round > latest);
        if !(idle.is_empty() || !self.roundwise_fixed_availability || round_changed) {
            return;
        }
        self.availability_latest_round = Some(round);

        let offline = self.offline_clients();
        let mut new_idle = Vec::new();
        for cid in offline {
            if rng::uniform(&mut self.rng) <= self.variables[cid].prob_available {
                new_idle.push(cid);
            }
        }
        let mut new_offline = Vec::new();
        for cid in idle {
            if rng::uniform(&mut self.rng) <= self.variables[cid].prob_unavailable {
                new_offline.push(cid);
            }
        }
        for cid in new_idle {
            self.enter(cid, ClientState::Idle);
        }
        for cid in new_offline {
            self.enter(cid, ClientState::Offline);
        }
    }

    fn resolve_dropouts(&mut self) {
        for cid in self.dropped_clients() {
            let counters = &mut self.counters[cid];
            if counters.dropped_counter > 0 {
                counters.dropped_counter -= 1;
                continue;
            }
            if rng::uniform(&mut self.rng) < self.variables[cid].prob_unavailable {
                info!(client = cid, "Client had just dropped out and is currently offline");
                self.enter(cid, ClientState::Offline);
            } else {
                info!(client = cid, "Client had just dropped out and is currently available");
                self.enter(cid, ClientState::Idle);
            }
        }
    }

    /// Infallible transition for ids already known to exist
    fn enter(&mut self, cid: ClientId, state: ClientState) {
        if let Err(e) = self.set_client_state(&[cid], state) {
            debug!(client = cid, error = %e, "state transition skipped");
        }
    }
}

impl FlushHook for ClientStateMachine {
    /// Availability policy, then the idle/offline toggle, then dropout countdowns.
    /// Working clients are resolved by the round protocol, not here.
    fn flush(&mut self) {
        self.update_client_availability();
        self.toggle_availability();
        self.resolve_dropouts();
        self.ticks += 1;
    }
}
