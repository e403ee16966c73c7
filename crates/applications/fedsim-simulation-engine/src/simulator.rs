//! Synthetic end-to-end simulation
//!
//! Couples the round protocol to a toy coordinator so the engine can be run
//! from the command line. Each synthetic client pulls the global model towards
//! its own target vector for a number of local steps; the coordinator averages
//! whatever comes back in time.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use fedsim_core::{
    ClientId, Columns, Package, Result, SeedSequence, ServerInfo, SimError, SimRng, Time,
    WorkloadClient, MODEL_FIELD,
};
use rand::seq::index;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::protocol::{self, Coordinator, Link, RoundProtocol};
use crate::state::ClientStateMachine;

const LEARNING_RATE: f64 = 0.1;

/// A client minimizing the squared distance to its own target vector
#[derive(Debug, Clone)]
pub struct SyntheticClient {
    pub id: ClientId,
    target: Vec<f64>,
    model: Vec<f64>,
    num_steps: u64,
}

impl SyntheticClient {
    pub fn new(id: ClientId, target: Vec<f64>, num_steps: u64) -> Self {
        let model = vec![0.0; target.len()];
        SyntheticClient {
            id,
            target,
            model,
            num_steps,
        }
    }

    /// Mean squared distance between the local model and the target
    pub fn loss(&self) -> f64 {
        if self.target.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .model
            .iter()
            .zip(&self.target)
            .map(|(w, t)| (w - t) * (w - t))
            .sum();
        sum / self.target.len() as f64
    }

    /// Run `num_steps` gradient steps and return the final loss
    pub fn train(&mut self) -> f64 {
        for _ in 0..self.num_steps {
            for (w, t) in self.model.iter_mut().zip(&self.target) {
                *w -= LEARNING_RATE * 2.0 * (*w - *t);
            }
        }
        self.loss()
    }
}

impl WorkloadClient for SyntheticClient {
    fn num_steps(&self) -> u64 {
        self.num_steps
    }

    fn set_num_steps(&mut self, steps: u64) {
        self.num_steps = steps;
    }
}

/// Aggregation outcome of one round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundUpdate {
    pub received: usize,
    /// Mean local loss of the received clients
    pub mean_loss: Option<f64>,
}

/// Uniform sampling and plain model averaging
pub struct SyntheticCoordinator {
    clients: Vec<SyntheticClient>,
    global: Vec<f64>,
    clients_per_round: usize,
    rng: SimRng,
    outbound: BTreeMap<ClientId, Package>,
}

impl SyntheticCoordinator {
    /// Targets are drawn around 1.0 so the averaged model has somewhere to go
    pub fn new(
        num_clients: usize,
        clients_per_round: usize,
        num_steps: u64,
        model_params: usize,
        mut rng: SimRng,
    ) -> Result<Self> {
        let normal = Normal::new(1.0, 0.5)
            .map_err(|e| SimError::config(format!("invalid target distribution: {e}")))?;
        let clients = (0..num_clients)
            .map(|cid| {
                let target = (0..model_params).map(|_| normal.sample(&mut rng)).collect();
                SyntheticClient::new(cid, target, num_steps)
            })
            .collect();
        Ok(SyntheticCoordinator {
            clients,
            global: vec![0.0; model_params],
            clients_per_round,
            rng,
            outbound: BTreeMap::new(),
        })
    }

    pub fn global_model(&self) -> &[f64] {
        &self.global
    }

    pub fn clients(&self) -> &[SyntheticClient] {
        &self.clients
    }
}

impl Link for SyntheticCoordinator {
    type Output = RoundUpdate;

    fn communicate(
        &mut self,
        ids: &[ClientId],
        _asynchronous: bool,
        states: &ClientStateMachine,
    ) -> Result<Columns> {
        self.outbound.clear();
        let mut models = Vec::with_capacity(ids.len());
        let mut losses = Vec::with_capacity(ids.len());
        let mut steps = Vec::with_capacity(ids.len());

        for &cid in ids {
            let download = Package::new().with(MODEL_FIELD, json!(self.global));
            self.outbound.insert(cid, download);

            let Some(client) = self.clients.get_mut(cid) else {
                return Err(SimError::ClientNotFound(cid));
            };
            client.model.clone_from(&self.global);
            let working_amount = states
                .variables(cid)
                .map_or(client.num_steps, |v| v.working_amount);
            let (loss, done) = protocol::with_completeness(client, working_amount, |c| {
                (c.train(), c.num_steps())
            });

            models.push(json!(client.model));
            losses.push(json!(loss));
            steps.push(json!(done));
        }

        let mut columns = Columns::new();
        columns.insert(MODEL_FIELD.to_string(), models);
        columns.insert("loss".to_string(), losses);
        columns.insert("steps".to_string(), steps);
        Ok(columns)
    }

    fn sent_package(&self, cid: ClientId) -> Option<&Package> {
        self.outbound.get(&cid)
    }

    fn unpack(&mut self, packages: Vec<Package>) -> RoundUpdate {
        let models: Vec<Vec<f64>> = packages
            .iter()
            .filter_map(|p| p.get(MODEL_FIELD))
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .filter(|m: &Vec<f64>| m.len() == self.global.len())
            .collect();
        let losses: Vec<f64> = packages
            .iter()
            .filter_map(|p| p.get("loss").and_then(Value::as_f64))
            .collect();

        if !models.is_empty() {
            let n = models.len() as f64;
            for (i, w) in self.global.iter_mut().enumerate() {
                *w = models.iter().map(|m| m[i]).sum::<f64>() / n;
            }
        }

        RoundUpdate {
            received: packages.len(),
            mean_loss: (!losses.is_empty())
                .then(|| losses.iter().sum::<f64>() / losses.len() as f64),
        }
    }
}

impl Coordinator for SyntheticCoordinator {
    fn sample(&mut self, states: &ClientStateMachine) -> Vec<ClientId> {
        let n = states.num_clients();
        let k = self.clients_per_round.min(n);
        index::sample(&mut self.rng, n, k).into_vec()
    }
}

/// Per-round record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u64,
    pub start_time: Time,
    pub end_time: Time,
    pub selected: Vec<ClientId>,
    pub unavailable: Vec<ClientId>,
    pub dropped: Vec<ClientId>,
    pub overdue: Vec<ClientId>,
    pub received: Vec<ClientId>,
    pub mean_loss: Option<f64>,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub policies: Vec<String>,
    pub rounds: Vec<RoundSummary>,
    pub final_time: Time,
    pub total_selected: usize,
    pub total_unavailable: usize,
    pub total_dropped: usize,
    pub total_overdue: usize,
    pub total_received: usize,
    /// Mean squared distance of the final global model to the clients' mean target
    pub final_loss: f64,
}

/// Runs `num_rounds` rounds of [`SyntheticCoordinator`] on the engine
pub struct Simulation {
    config: SimulationConfig,
    server: Rc<ServerInfo>,
    protocol: RoundProtocol,
    coordinator: SyntheticCoordinator,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let mut seeds = SeedSequence::new(config.seed);

        let server = Rc::new(ServerInfo::new(config.tolerance_for_latency));
        let num_steps = vec![config.num_steps; config.num_clients];
        let policies = config.policies.build(&num_steps)?;
        let states = ClientStateMachine::new(server.clone(), &num_steps, seeds.next_rng())
            .with_policies(policies)
            .with_roundwise_fixed_availability(config.roundwise_fixed_availability);
        let protocol = RoundProtocol::new(Rc::new(RefCell::new(states)), server.clone());
        let coordinator = SyntheticCoordinator::new(
            config.num_clients,
            config.clients_per_round,
            config.num_steps,
            config.model_params,
            seeds.next_rng(),
        )?;

        Ok(Simulation {
            config,
            server,
            protocol,
            coordinator,
        })
    }

    pub fn protocol(&self) -> &RoundProtocol {
        &self.protocol
    }

    pub fn coordinator(&self) -> &SyntheticCoordinator {
        &self.coordinator
    }

    /// Run one round and summarize it
    ///
    /// Asynchronous rounds step the clock once beforehand; nothing else moves
    /// time forward when responses are collected without waiting.
    pub fn run_round(&mut self) -> Result<RoundSummary> {
        let round = self.server.next_round();
        let start_time = self.protocol.current_time();
        let asynchronous = self.config.asynchronous;

        let coordinator = &mut self.coordinator;
        let mut collect = |p: &mut RoundProtocol| -> Result<(Vec<ClientId>, RoundUpdate)> {
            let selected = p.with_availability(|states| coordinator.sample(states))?;
            let update = p.communicate(&selected, asynchronous, coordinator)?;
            Ok((selected, update))
        };
        let (selected, update) = if asynchronous {
            self.protocol.time_step(collect)?
        } else {
            collect(&mut self.protocol)?
        };

        let report = self.protocol.report();
        let summary = RoundSummary {
            round,
            start_time,
            end_time: self.protocol.current_time(),
            selected,
            unavailable: report.unavailable_selected_clients.clone(),
            dropped: report.dropped_selected_clients.clone(),
            overdue: report.overdue_clients.clone(),
            received: report.received_clients.clone(),
            mean_loss: update.mean_loss,
        };
        info!(
            round,
            time = summary.end_time,
            received = update.received,
            dropped = summary.dropped.len(),
            overdue = summary.overdue.len(),
            "round finished"
        );
        Ok(summary)
    }

    pub fn run(&mut self) -> Result<SimulationResult> {
        let names = self.protocol.states().policies().names().map(str::to_string);
        debug!(policies = ?names, "starting simulation");

        let mut rounds = Vec::with_capacity(self.config.num_rounds as usize);
        for _ in 0..self.config.num_rounds {
            rounds.push(self.run_round()?);
        }

        Ok(SimulationResult {
            policies: names.to_vec(),
            final_time: self.protocol.current_time(),
            total_selected: rounds.iter().map(|r| r.selected.len()).sum(),
            total_unavailable: rounds.iter().map(|r| r.unavailable.len()).sum(),
            total_dropped: rounds.iter().map(|r| r.dropped.len()).sum(),
            total_overdue: rounds.iter().map(|r| r.overdue.len()).sum(),
            total_received: rounds.iter().map(|r| r.received.len()).sum(),
            final_loss: self.final_loss(),
            rounds,
        })
    }

    fn final_loss(&self) -> f64 {
        let clients = self.coordinator.clients();
        let global = self.coordinator.global_model();
        if clients.is_empty() || global.is_empty() {
            return 0.0;
        }
        let n = clients.len() as f64;
        let sum: f64 = global
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let mean_target = clients.iter().map(|c| c.target[i]).sum::<f64>() / n;
                (w - mean_target) * (w - mean_target)
            })
            .sum();
        sum / global.len() as f64
    }
}
