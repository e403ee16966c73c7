//! End-to-end behaviour of the round protocol against the virtual clock

use std::cell::RefCell;
use std::rc::Rc;

use fedsim_core::{
    seeded, ClientId, ClientState, Columns, FlushHook, Package, Result, ServerInfo, Variable,
    VariableValue,
};
use fedsim_simulation_engine::config::{ConnectivityConfig, PolicyConfig, ResponsivenessConfig};
use fedsim_simulation_engine::policies::{StaticAvailability, StaticConnectivity, SystemPolicies};
use fedsim_simulation_engine::{
    ClientStateMachine, Coordinator, Link, RoundProtocol, Simulation, SimulationConfig,
};
use serde_json::json;

/// Sends each client its id and reads it back
struct IdLink {
    picks: Vec<ClientId>,
    sample_times: Vec<u64>,
}

impl IdLink {
    fn picking(picks: Vec<ClientId>) -> Self {
        IdLink {
            picks,
            sample_times: Vec::new(),
        }
    }
}

impl Link for IdLink {
    type Output = Vec<ClientId>;

    fn communicate(
        &mut self,
        ids: &[ClientId],
        _asynchronous: bool,
        _states: &ClientStateMachine,
    ) -> Result<Columns> {
        let mut columns = Columns::new();
        columns.insert("id".into(), ids.iter().map(|&c| json!(c)).collect());
        Ok(columns)
    }

    fn unpack(&mut self, packages: Vec<Package>) -> Vec<ClientId> {
        packages
            .iter()
            .filter_map(|p| p.get("id").and_then(|v| v.as_u64()))
            .map(|c| c as ClientId)
            .collect()
    }
}

impl Coordinator for IdLink {
    fn sample(&mut self, states: &ClientStateMachine) -> Vec<ClientId> {
        self.sample_times.push(states.ticks());
        self.picks.clone()
    }
}

fn engine(
    latencies: &[u64],
    tolerance: u64,
    policies: SystemPolicies,
    seed: u64,
) -> (Rc<ServerInfo>, RoundProtocol) {
    let server = Rc::new(ServerInfo::new(tolerance));
    let mut states =
        ClientStateMachine::new(server.clone(), &vec![5; latencies.len()], seeded(seed))
            .with_policies(policies);
    let ids: Vec<ClientId> = (0..latencies.len()).collect();
    let values: Vec<VariableValue> = latencies.iter().map(|&l| l.into()).collect();
    states.set_variable(&ids, Variable::Latency, &values).unwrap();
    let protocol = RoundProtocol::new(Rc::new(RefCell::new(states)), server.clone());
    (server, protocol)
}

#[test]
fn test_synchronous_round_abandons_slow_clients() {
    let (_, mut protocol) = engine(&[1, 2, 3, 10, 10], 5, SystemPolicies::new(), 0);
    let mut link = IdLink::picking((0..5).collect());

    let received = protocol.run_round(&mut link, false).unwrap();

    assert_eq!(received, vec![0, 1, 2]);
    assert_eq!(protocol.current_time(), 5);
    assert_eq!(protocol.report().overdue_clients, vec![3, 4]);
    assert!(protocol.report().dropped_selected_clients.is_empty());

    let states = protocol.states();
    for cid in 0..3 {
        assert_eq!(states.state(cid), Some(ClientState::Offline));
    }
    for cid in 3..5 {
        assert_eq!(states.state(cid), Some(ClientState::Idle));
        assert_eq!(states.counters(cid).unwrap().latency_counter, 0);
    }
    drop(states);
    assert!(protocol.clock().is_empty());
}

#[test]
fn test_overdue_packages_never_surface_later() {
    let (_, mut protocol) = engine(&[1, 8], 2, SystemPolicies::new(), 0);
    let mut link = IdLink::picking(vec![0, 1]);
    assert_eq!(protocol.run_round(&mut link, false).unwrap(), vec![0]);

    // long after the slow package would have arrived
    protocol.advance(20).unwrap();
    let mut link = IdLink::picking(Vec::new());
    let received = protocol.communicate(&[], true, &mut link).unwrap();
    assert!(received.is_empty());
}

#[test]
fn test_sampling_waits_for_an_idle_client() {
    let (_, mut protocol) = engine(&[0, 0, 0], 5, SystemPolicies::new(), 0);
    protocol
        .states_mut()
        .set_client_state(&[0, 1, 2], ClientState::Offline)
        .unwrap();
    let mut link = IdLink::picking(vec![2, 0]);

    let received = protocol.run_round(&mut link, false).unwrap();

    // default availability brings every offline client back on the first flush
    assert_eq!(link.sample_times, vec![1]);
    assert_eq!(protocol.current_time(), 1);
    assert_eq!(received, vec![2, 0]);
}

#[test]
fn test_asynchronous_collection_never_waits() {
    let (_, mut protocol) = engine(&[0, 2, 4], 1, SystemPolicies::new(), 0);
    let mut link = IdLink::picking(vec![0, 1, 2]);

    assert_eq!(protocol.run_round(&mut link, true).unwrap(), vec![0]);
    assert_eq!(protocol.current_time(), 0);

    protocol.advance(2).unwrap();
    let received = protocol.communicate(&[], true, &mut link).unwrap();
    assert_eq!(received, vec![1]);
    assert_eq!(protocol.current_time(), 2);
    assert_eq!(protocol.states().working_clients(), vec![2]);

    protocol.advance(2).unwrap();
    assert_eq!(protocol.communicate(&[], true, &mut link).unwrap(), vec![2]);
}

#[test]
fn test_dropped_clients_recover_after_tolerance() {
    let policies = SystemPolicies::new().with_connectivity(StaticConnectivity::new(1.0));
    let (_, mut protocol) = engine(&[1, 1], 3, policies, 0);
    let mut link = IdLink::picking(vec![0, 1]);

    let received = protocol.run_round(&mut link, false).unwrap();
    assert!(received.is_empty());
    assert_eq!(protocol.report().dropped_selected_clients, vec![0, 1]);
    // nobody left to wait for, yet the coordinator waits out the deadline
    assert_eq!(protocol.current_time(), 3);
    assert_eq!(protocol.states().dropped_clients(), vec![0, 1]);

    // counter hits zero on the third flush, resolved on the fourth
    protocol.advance(1).unwrap();
    assert_eq!(protocol.states().dropped_clients(), Vec::<ClientId>::new());
    assert_eq!(protocol.states().idle_clients(), vec![0, 1]);
}

#[test]
fn test_roundwise_fixed_availability_skips_repeat_toggles() {
    let server = Rc::new(ServerInfo::new(5));
    server.set_round(1);
    let mut states = ClientStateMachine::new(server.clone(), &[5; 10], seeded(4))
        .with_policies(SystemPolicies::new().with_availability(StaticAvailability::new(1.0, 1.0)))
        .with_roundwise_fixed_availability(true);
    states
        .set_client_state(&[0, 1, 2], ClientState::Offline)
        .unwrap();

    // every draw succeeds: offline and idle clients swap sides
    states.flush();
    assert_eq!(states.idle_clients(), vec![0, 1, 2]);
    let settled = states.states().to_vec();

    states.flush();
    states.flush();
    assert_eq!(states.states(), settled.as_slice());

    // a new round re-enables the toggle
    server.next_round();
    states.flush();
    assert_eq!(states.idle_clients(), (3..10).collect::<Vec<ClientId>>());
    assert_eq!(states.offline_clients(), vec![0, 1, 2]);
}

#[test]
fn test_identically_seeded_engines_agree() {
    let run = || {
        let policies = SystemPolicies::new()
            .with_availability(StaticAvailability::new(0.6, 0.3))
            .with_connectivity(StaticConnectivity::new(0.25));
        let (server, mut protocol) = engine(&[1, 3, 5, 7, 2, 4], 4, policies, 11);
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            server.next_round();
            let mut link = IdLink::picking(vec![5, 3, 1, 0]);
            let received = protocol.run_round(&mut link, false).unwrap();
            outcomes.push((
                received,
                protocol.report().clone(),
                protocol.states().states().to_vec(),
                protocol.current_time(),
            ));
        }
        outcomes
    };
    assert_eq!(run(), run());
}

#[test]
fn test_counters_never_both_set() {
    let config = SimulationConfig::default()
        .with_clients(12)
        .with_clients_per_round(6)
        .with_rounds(1)
        .with_seed(5)
        .with_tolerance_for_latency(4)
        .with_policies(PolicyConfig {
            connectivity: ConnectivityConfig::Static { prob_drop: 0.4 },
            responsiveness: ResponsivenessConfig::LogNormal {
                mu: 1.2,
                sigma: 0.6,
                max_latency: 10,
            },
            ..Default::default()
        });
    let mut simulation = Simulation::new(config).unwrap();
    for _ in 0..15 {
        simulation.run_round().unwrap();
        let states = simulation.protocol().states();
        for cid in 0..states.num_clients() {
            let c = states.counters(cid).unwrap();
            assert!(c.dropped_counter == 0 || c.latency_counter == 0);
        }
    }
}

#[test]
fn test_simulation_from_json_config() {
    let json = r#"{
        "num_clients": 20,
        "clients_per_round": 5,
        "num_rounds": 8,
        "seed": 17,
        "tolerance_for_latency": 6,
        "policies": {
            "availability": { "kind": "periodic", "period": 24, "peak": 0.9, "trough": 0.2 },
            "completeness": { "kind": "random", "min_fraction": 0.5 },
            "responsiveness": { "kind": "bandwidth", "base_latency": 1, "bandwidth": 400 }
        }
    }"#;
    let config: SimulationConfig = serde_json::from_str(json).unwrap();
    let result = Simulation::new(config).unwrap().run().unwrap();

    assert_eq!(result.rounds.len(), 8);
    assert_eq!(result.policies, ["Periodic", "none", "Random", "Bandwidth"]);
    for round in &result.rounds {
        assert!(round.end_time >= round.start_time);
        assert!(round.received.len() + round.overdue.len() + round.dropped.len() == round.selected.len());
    }
}
