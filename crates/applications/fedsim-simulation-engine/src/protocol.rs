//! Round protocol: the simulated lifecycle of one coordinator round
//!
//! ```text
//! sample ──► with_availability ──► with_dropout ──► with_clock ──► unpack
//!            (wait for idle,       (drop draws,     (latency, queue,
//!             filter unavailable)   filter dropped)   wait or abandon)
//! ```
//!
//! Each stage takes the next one as an ordinary closure with the same
//! `(ids, asynchronous)` shape, so a coordinator composes exactly the stages
//! it wants. [`RoundProtocol::run_round`] chains all of them.
//!
//! Local computation is wrapped separately by [`with_completeness`], which
//! swaps a client's step count for its assigned workload for the duration of
//! one call.

use std::cell::{Ref, RefCell, RefMut};
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use fedsim_core::{
    transpose, ClientId, ClientState, Columns, Package, Result, ServerHandle, Time, TimedPackage,
    Variable, VariableValue, WorkloadClient,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::VirtualClock;
use crate::state::ClientStateMachine;

/// Round-scoped outcome sets, recomputed by every round
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReport {
    /// Sampled but not idle at sampling time
    pub unavailable_selected_clients: Vec<ClientId>,
    /// Lost their connection before transmitting
    pub dropped_selected_clients: Vec<ClientId>,
    /// Missed the synchronous deadline
    pub overdue_clients: Vec<ClientId>,
    /// Whose packages were handed back to the coordinator
    pub received_clients: Vec<ClientId>,
}

/// The communication side of a coordinator
pub trait Link {
    /// Coordinator-level result of one round
    type Output;

    /// Exchange messages with `ids`; one column per field, aligned to `ids`
    fn communicate(
        &mut self,
        ids: &[ClientId],
        asynchronous: bool,
        states: &ClientStateMachine,
    ) -> Result<Columns>;

    /// What was sent to `cid` this round, for download size accounting
    fn sent_package(&self, _cid: ClientId) -> Option<&Package> {
        None
    }

    /// Reshape collected packages into the coordinator's result
    fn unpack(&mut self, packages: Vec<Package>) -> Self::Output;
}

/// A coordinator that also picks clients
pub trait Coordinator: Link {
    fn sample(&mut self, states: &ClientStateMachine) -> Vec<ClientId>;
}

/// Drives clients through a round against the virtual clock
pub struct RoundProtocol {
    clock: VirtualClock<TimedPackage>,
    states: Rc<RefCell<ClientStateMachine>>,
    server: Rc<dyn ServerHandle>,
    report: RoundReport,
}

impl RoundProtocol {
    /// Registers `states` as the clock's flush hook
    pub fn new(states: Rc<RefCell<ClientStateMachine>>, server: Rc<dyn ServerHandle>) -> Self {
        let mut clock = VirtualClock::new();
        clock.register_flush_hook(states.clone());
        RoundProtocol {
            clock,
            states,
            server,
            report: RoundReport::default(),
        }
    }

    pub fn clock(&self) -> &VirtualClock<TimedPackage> {
        &self.clock
    }

    pub fn current_time(&self) -> Time {
        self.clock.current_time()
    }

    /// Advance virtual time, flushing client states once per unit
    pub fn advance(&mut self, delta: Time) -> Result<()> {
        self.clock.advance(delta)
    }

    pub fn states(&self) -> Ref<'_, ClientStateMachine> {
        self.states.borrow()
    }

    /// Must be released before the clock advances
    pub fn states_mut(&self) -> RefMut<'_, ClientStateMachine> {
        self.states.borrow_mut()
    }

    pub fn report(&self) -> &RoundReport {
        &self.report
    }

    /// Packages still travelling (asynchronous responses not yet collected)
    pub fn in_flight(&self) -> usize {
        self.clock.len()
    }

    /// Step the clock one unit, then run `f`
    pub fn time_step<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Self) -> Result<R>,
    {
        self.clock.step()?;
        f(self)
    }

    /// Sampling stage
    ///
    /// Waits, one unit at a time, until at least one client is idle; then
    /// samples once and keeps only the sampled clients that are idle, in
    /// sampling order. Survivors become `selected`.
    pub fn with_availability<F>(&mut self, sample: F) -> Result<Vec<ClientId>>
    where
        F: FnOnce(&ClientStateMachine) -> Vec<ClientId>,
    {
        self.report = RoundReport::default();
        let mut available = self.states.borrow().idle_clients();
        while available.is_empty() {
            self.clock.step()?;
            available = self.states.borrow().idle_clients();
        }

        let sampled = sample(&self.states.borrow());

        let mut selected: Vec<ClientId> = Vec::with_capacity(sampled.len());
        for cid in sampled {
            if selected.contains(&cid) {
                continue;
            }
            if available.binary_search(&cid).is_ok() {
                selected.push(cid);
            } else if !self.report.unavailable_selected_clients.contains(&cid) {
                self.report.unavailable_selected_clients.push(cid);
            }
        }
        if !self.report.unavailable_selected_clients.is_empty() {
            info!(
                clients = ?self.report.unavailable_selected_clients,
                "The selected clients are not currently available"
            );
        }
        self.states
            .borrow_mut()
            .set_client_state(&selected, ClientState::Selected)?;
        Ok(selected)
    }

    /// Dropout stage
    ///
    /// Draws once per selected client (in order) and drops it when the draw is
    /// at most its `prob_drop`; the rest are passed on to `communicate`.
    pub fn with_dropout<F, R>(
        &mut self,
        selected: &[ClientId],
        asynchronous: bool,
        communicate: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut Self, &[ClientId], bool) -> Result<R>,
    {
        self.report.dropped_selected_clients.clear();
        if selected.is_empty() {
            return communicate(self, selected, asynchronous);
        }

        let dropped = {
            let mut states = self.states.borrow_mut();
            states.update_client_connectivity(selected);
            let mut dropped = Vec::new();
            for &cid in selected {
                let prob_drop = states.variables(cid).map_or(0.0, |v| v.prob_drop);
                if states.draw() <= prob_drop {
                    dropped.push(cid);
                }
            }
            states.set_client_state(&dropped, ClientState::Dropped)?;
            dropped
        };
        if !dropped.is_empty() {
            debug!(clients = ?dropped, "selected clients dropped out");
        }

        let survivors: Vec<ClientId> = selected
            .iter()
            .copied()
            .filter(|cid| !dropped.contains(cid))
            .collect();
        self.report.dropped_selected_clients = dropped;
        communicate(self, &survivors, asynchronous)
    }

    /// Timing stage
    ///
    /// Measures package sizes, lets the responsiveness policy set latencies,
    /// queues every package at `now + latency` and collects:
    /// - asynchronously: whatever has arrived by now, without waiting
    /// - synchronously: everything arriving within the deadline, then advances
    ///   the clock to it; late clients are purged and sent back to `idle`
    ///
    /// Collected clients go `offline`.
    pub fn with_clock<L: Link>(
        &mut self,
        selected: &[ClientId],
        asynchronous: bool,
        link: &mut L,
    ) -> Result<L::Output> {
        self.report.overdue_clients.clear();
        self.report.received_clients.clear();
        let tolerance = to_time(self.server.tolerance_for_latency());

        self.states
            .borrow_mut()
            .update_client_completeness(selected);
        let columns = link.communicate(selected, asynchronous, &self.states.borrow())?;

        if !asynchronous && selected.is_empty() {
            // nobody to wait for, but the coordinator only learns of dropouts at the deadline
            if !self.report.dropped_selected_clients.is_empty() {
                self.clock.advance(tolerance)?;
            }
            return Ok(link.unpack(Vec::new()));
        }

        let packages = transpose(columns, selected.len())?;
        let now = self.clock.current_time();
        let latencies = if selected.is_empty() {
            Vec::new()
        } else {
            self.dispatch(selected, packages, link, now)?
        };

        let collected = if asynchronous {
            self.clock.pop_ready()
        } else {
            let max_latency = to_time(latencies.iter().copied().max().unwrap_or(0));
            let any_drop = !self.report.dropped_selected_clients.is_empty();
            let any_overdue = max_latency > tolerance;
            let delta = if any_drop || any_overdue { tolerance } else { max_latency };

            let arrived = self.clock.pop_until(now + delta);
            self.clock.advance(delta)?;

            let overdue: Vec<ClientId> = selected
                .iter()
                .copied()
                .filter(|cid| !arrived.iter().any(|p| p.cid == *cid))
                .collect();
            if !overdue.is_empty() {
                info!(clients = ?overdue, "Clients missed the deadline and are abandoned");
                self.clock.remove_if(|p| overdue.contains(&p.cid));
                self.states
                    .borrow_mut()
                    .set_client_state(&overdue, ClientState::Idle)?;
            }
            self.report.overdue_clients = overdue;
            arrived
        };

        let arrived_ids: Vec<ClientId> = collected.iter().map(|p| p.cid).collect();
        self.states
            .borrow_mut()
            .set_client_state(&arrived_ids, ClientState::Offline)?;

        let collected = if asynchronous {
            collected
        } else {
            reorder(collected, selected)
        };
        self.report.received_clients = collected.iter().map(|p| p.cid).collect();
        debug!(
            time = self.clock.current_time(),
            received = ?self.report.received_clients,
            "round collection finished"
        );
        Ok(link.unpack(collected.into_iter().map(|p| p.package).collect()))
    }

    /// Record sizes, set latencies, mark `working` and queue the packages
    fn dispatch<L: Link>(
        &mut self,
        selected: &[ClientId],
        packages: Vec<Package>,
        link: &L,
        now: Time,
    ) -> Result<Vec<u64>> {
        let model_sizes: Vec<VariableValue> =
            packages.iter().map(|p| p.model_size().into()).collect();
        let upload_sizes: Vec<VariableValue> = packages.iter().map(|p| p.size().into()).collect();
        let download_sizes: Vec<VariableValue> = selected
            .iter()
            .map(|&cid| link.sent_package(cid).map_or(0, Package::size).into())
            .collect();

        let latencies = {
            let mut states = self.states.borrow_mut();
            states.set_variable(selected, Variable::ModelSize, &model_sizes)?;
            states.set_variable(selected, Variable::UploadPackageSize, &upload_sizes)?;
            states.set_variable(selected, Variable::DownloadPackageSize, &download_sizes)?;
            states.update_client_responsiveness(selected);
            states.set_client_state(selected, ClientState::Working)?;
            states.latencies(selected)
        };

        for ((package, &cid), &latency) in packages.into_iter().zip(selected).zip(&latencies) {
            let arrival = now.saturating_add(to_time(latency));
            self.clock.put(
                TimedPackage {
                    cid,
                    arrival,
                    package,
                },
                arrival,
            )?;
        }
        Ok(latencies)
    }

    /// Dropout stage followed by the timing stage
    pub fn communicate<L: Link>(
        &mut self,
        selected: &[ClientId],
        asynchronous: bool,
        link: &mut L,
    ) -> Result<L::Output> {
        self.with_dropout(selected, asynchronous, |protocol, ids, asynchronous| {
            protocol.with_clock(ids, asynchronous, link)
        })
    }

    /// Sample, drop, transmit, wait and collect
    pub fn run_round<C: Coordinator>(
        &mut self,
        coordinator: &mut C,
        asynchronous: bool,
    ) -> Result<C::Output> {
        let selected = self.with_availability(|states| coordinator.sample(states))?;
        self.communicate(&selected, asynchronous, coordinator)
    }

    /// Run `train` on `client` with its step count replaced by the assigned workload
    pub fn with_completeness<C, F, R>(&self, cid: ClientId, client: &mut C, train: F) -> R
    where
        C: WorkloadClient,
        F: FnOnce(&mut C) -> R,
    {
        let working_amount = self
            .states
            .borrow()
            .variables(cid)
            .map(|v| v.working_amount);
        match working_amount {
            Some(steps) => with_completeness(client, steps, train),
            None => train(client),
        }
    }
}

/// Virtual-time view of a duration, saturating at `Time::MAX`
fn to_time(units: u64) -> Time {
    Time::try_from(units).unwrap_or(Time::MAX)
}

/// Keep only packages from `selected`, in selection order
fn reorder(collected: Vec<TimedPackage>, selected: &[ClientId]) -> Vec<TimedPackage> {
    let mut slots: Vec<Option<TimedPackage>> = selected.iter().map(|_| None).collect();
    for package in collected {
        if let Some(pos) = selected.iter().position(|&cid| cid == package.cid) {
            slots[pos] = Some(package);
        }
    }
    slots.into_iter().flatten().collect()
}

/// Restores the original step count when dropped, including on unwind
struct StepsGuard<'a, C: WorkloadClient> {
    client: &'a mut C,
    original: u64,
}

impl<'a, C: WorkloadClient> StepsGuard<'a, C> {
    fn new(client: &'a mut C, steps: u64) -> Self {
        let original = client.num_steps();
        client.set_num_steps(steps);
        StepsGuard { client, original }
    }
}

impl<C: WorkloadClient> Deref for StepsGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client
    }
}

impl<C: WorkloadClient> DerefMut for StepsGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client
    }
}

impl<C: WorkloadClient> Drop for StepsGuard<'_, C> {
    fn drop(&mut self) {
        self.client.set_num_steps(self.original);
    }
}

/// Workload-substitution stage
///
/// `train` sees `client` with `working_amount` steps; the original step count
/// is restored afterwards, even if `train` returns an error or panics.
pub fn with_completeness<C, F, R>(client: &mut C, working_amount: u64, train: F) -> R
where
    C: WorkloadClient,
    F: FnOnce(&mut C) -> R,
{
    let mut guard = StepsGuard::new(client, working_amount);
    train(&mut *guard)
}
