//! Per-CPU receive polling.
//!
//! The pool keeps one record per CPU id. A CPU that owns at least one
//! (device, queue) assignment runs a polling worker; its last removal stops
//! the worker. New assignments go to the least-loaded online eligible CPU,
//! ties to the lowest CPU id.
//!
//! Hotplug is driven from outside through [`RxThreadPool::online`] and
//! [`RxThreadPool::offline`]. Offlining a CPU hands its queues out one at a
//! time by the same least-loaded rule; onlining one moves the last queue of
//! the most-loaded CPU over until the two differ by at most one. Queues with
//! nowhere to go are parked until a CPU comes back.

use crate::cpu::{self, MAX_CPUS};
use crate::device::DeviceId;
use crate::error::{AvpError, Result};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Something with receive queues a worker can poll.
pub trait QueuePoller: Send + Sync {
    fn device_id(&self) -> DeviceId;

    /// Poll one queue; returns the number of entries processed.
    fn poll_queue(&self, queue: u16, burst: usize) -> usize;

    /// Deliver any pending control response.
    fn service_control(&self) {}
}

/// How workers poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Busy passes over all queues before servicing control and yielding
    pub max_passes: usize,
    /// Sleep after a pass that found nothing
    pub idle_backoff: Duration,
    /// Burst handed to each queue poll
    pub rx_burst: usize,
    /// Pin each worker to its CPU
    pub pin_workers: bool,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_passes: 16,
            idle_backoff: Duration::from_micros(50),
            rx_burst: crate::rx::MAX_RX_BURST,
            pin_workers: false,
        }
    }
}

#[derive(Clone)]
struct Assignment {
    poller: Arc<dyn QueuePoller>,
    queue: u16,
}

impl Assignment {
    fn key(&self) -> (DeviceId, u16) {
        (self.poller.device_id(), self.queue)
    }
}

type Responders = spin::RwLock<Vec<Arc<dyn QueuePoller>>>;

/// State a CPU record shares with its worker thread.
struct WorkerShared {
    cpu: usize,
    // Replaced wholesale on every change; workers poll a snapshot
    queues: spin::Mutex<Arc<Vec<Assignment>>>,
    stop: AtomicBool,
}

struct CpuSlot {
    eligible: bool,
    online: bool,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl CpuSlot {
    fn load(&self) -> usize {
        self.shared.queues.lock().len()
    }

    fn update(&self, f: impl FnOnce(&mut Vec<Assignment>)) {
        let mut queues = self.shared.queues.lock();
        let mut next = Vec::clone(&queues);
        f(&mut next);
        *queues = Arc::new(next);
    }
}

struct PoolState {
    slots: Vec<CpuSlot>,
    parked: Vec<Assignment>,
}

impl PoolState {
    fn active(&self) -> impl Iterator<Item = (usize, &CpuSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.eligible && s.online)
    }

    fn least_loaded(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (cpu, slot) in self.active() {
            let load = slot.load();
            if best.map_or(true, |(_, l)| load < l) {
                best = Some((cpu, load));
            }
        }
        best.map(|(cpu, _)| cpu)
    }

    fn most_loaded(&self) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (cpu, slot) in self.active() {
            let load = slot.load();
            if best.map_or(true, |(_, l)| load > l) {
                best = Some((cpu, load));
            }
        }
        best.map(|(cpu, _)| cpu)
    }

    fn locate(&self, key: (DeviceId, u16)) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.shared.queues.lock().iter().any(|a| a.key() == key))
    }

    fn is_active(&self, cpu: usize) -> bool {
        self.slots.get(cpu).is_some_and(|s| s.eligible && s.online)
    }
}

/// The RX thread pool.
pub struct RxThreadPool {
    policy: PollPolicy,
    state: Mutex<PoolState>,
    responders: Arc<Responders>,
}

impl RxThreadPool {
    /// Create a pool over `eligible` CPUs (every CPU the OS reports when
    /// empty). All eligible CPUs start online; no worker runs until a queue
    /// is assigned.
    pub fn new(policy: PollPolicy, eligible: &[usize]) -> Self {
        let eligible: Vec<usize> = if eligible.is_empty() {
            (0..cpu::available_cpus()).collect()
        } else {
            eligible.to_vec()
        };
        let slots = (0..MAX_CPUS)
            .map(|cpu| CpuSlot {
                eligible: eligible.contains(&cpu),
                online: true,
                shared: Arc::new(WorkerShared {
                    cpu,
                    queues: spin::Mutex::new(Arc::new(Vec::new())),
                    stop: AtomicBool::new(false),
                }),
                handle: None,
            })
            .collect();
        Self {
            policy,
            state: Mutex::new(PoolState {
                slots,
                parked: Vec::new(),
            }),
            responders: Arc::new(spin::RwLock::new(Vec::new())),
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Eligible CPU ids
    pub fn eligible_cpus(&self) -> Vec<usize> {
        let state = self.state();
        state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.eligible)
            .map(|(cpu, _)| cpu)
            .collect()
    }

    /// Home a queue on the least-loaded CPU. Returns the CPU, or `None`
    /// when the queue had to be parked.
    pub fn assign(&self, poller: Arc<dyn QueuePoller>, queue: u16) -> Option<usize> {
        let mut state = self.state();
        let assignment = Assignment { poller, queue };
        if let Some(cpu) = state.locate(assignment.key()) {
            return Some(cpu);
        }
        if state.parked.iter().any(|a| a.key() == assignment.key()) {
            return None;
        }
        self.place(&mut state, assignment)
    }

    /// Home a queue on a specific CPU.
    pub fn assign_to(&self, cpu: usize, poller: Arc<dyn QueuePoller>, queue: u16) -> Result<()> {
        let mut state = self.state();
        if !state.is_active(cpu) {
            return Err(AvpError::InvalidCpu(cpu));
        }
        let assignment = Assignment { poller, queue };
        if state.locate(assignment.key()).is_some() {
            return Ok(());
        }
        state.slots[cpu].update(|q| q.push(assignment));
        self.ensure_running(&mut state, cpu);
        Ok(())
    }

    fn place(&self, state: &mut PoolState, assignment: Assignment) -> Option<usize> {
        let Some(cpu) = state.least_loaded() else {
            let (device, queue) = assignment.key();
            tracing::warn!(%device, queue, "No eligible CPU online, queue parked");
            state.parked.push(assignment);
            return None;
        };
        let (device, queue) = assignment.key();
        state.slots[cpu].update(|q| q.push(assignment));
        tracing::debug!(%device, queue, cpu, "Queue assigned");
        self.ensure_running(state, cpu);
        Some(cpu)
    }

    /// Remove one queue. Returns whether it was assigned or parked.
    pub fn remove(&self, device: DeviceId, queue: u16) -> bool {
        self.remove_where(|a| a.key() == (device, queue)) > 0
    }

    /// Remove every queue of a device. Returns the number removed.
    pub fn remove_device(&self, device: DeviceId) -> usize {
        self.remove_where(|a| a.poller.device_id() == device)
    }

    fn remove_where(&self, matches: impl Fn(&Assignment) -> bool) -> usize {
        let mut state = self.state();
        let mut removed = 0;
        for cpu in 0..state.slots.len() {
            let slot = &state.slots[cpu];
            let hits = slot.shared.queues.lock().iter().filter(|a| matches(*a)).count();
            if hits == 0 {
                continue;
            }
            slot.update(|q| q.retain(|a| !matches(a)));
            removed += hits;
            if slot.load() == 0 {
                self.stop_worker(&mut state, cpu);
            }
        }
        let before = state.parked.len();
        state.parked.retain(|a| !matches(a));
        removed + before - state.parked.len()
    }

    /// Take a CPU out of service and rehome its queues.
    pub fn offline(&self, cpu: usize) -> bool {
        let mut state = self.state();
        let Some(slot) = state.slots.get_mut(cpu) else {
            return false;
        };
        if !slot.online {
            return false;
        }
        slot.online = false;

        let orphans = {
            let mut queues = slot.shared.queues.lock();
            core::mem::replace(&mut *queues, Arc::new(Vec::new()))
        };
        self.stop_worker(&mut state, cpu);

        let moved = orphans.len();
        for assignment in orphans.iter().cloned() {
            self.place(&mut state, assignment);
        }
        tracing::info!(cpu, moved, parked = state.parked.len(), "CPU offline");
        true
    }

    /// Bring a CPU into service and pull load onto it.
    pub fn online(&self, cpu: usize) -> bool {
        let mut state = self.state();
        let Some(slot) = state.slots.get_mut(cpu) else {
            return false;
        };
        if slot.online {
            return false;
        }
        slot.online = true;
        if !slot.eligible {
            tracing::debug!(cpu, "CPU online but not eligible for RX workers");
            return true;
        }

        for assignment in core::mem::take(&mut state.parked) {
            self.place(&mut state, assignment);
        }

        let mut moved = 0;
        while let Some(busiest) = state.most_loaded() {
            if busiest == cpu || state.slots[busiest].load() <= state.slots[cpu].load() + 1 {
                break;
            }
            let mut taken = None;
            state.slots[busiest].update(|q| taken = q.pop());
            let Some(assignment) = taken else {
                break;
            };
            state.slots[cpu].update(|q| q.push(assignment));
            moved += 1;
        }
        self.ensure_running(&mut state, cpu);
        tracing::info!(cpu, moved, "CPU online");
        true
    }

    /// `(cpu, queues)` for every online eligible CPU
    pub fn loads(&self) -> Vec<(usize, usize)> {
        let state = self.state();
        state.active().map(|(cpu, s)| (cpu, s.load())).collect()
    }

    /// Queues owned by `cpu`
    pub fn queues_on(&self, cpu: usize) -> Vec<(DeviceId, u16)> {
        let state = self.state();
        state.slots.get(cpu).map_or_else(Vec::new, |s| {
            s.shared.queues.lock().iter().map(Assignment::key).collect()
        })
    }

    /// Whether `cpu` has a running worker
    pub fn is_running(&self, cpu: usize) -> bool {
        let state = self.state();
        state.slots.get(cpu).is_some_and(|s| s.handle.is_some())
    }

    /// Number of parked queues
    pub fn parked(&self) -> usize {
        self.state().parked.len()
    }

    /// Have workers deliver control responses for `poller`.
    pub fn register_response_poll(&self, poller: Arc<dyn QueuePoller>) {
        let mut responders = self.responders.write();
        let id = poller.device_id();
        if !responders.iter().any(|p| p.device_id() == id) {
            responders.push(poller);
        }
    }

    pub fn unregister_response_poll(&self, device: DeviceId) {
        self.responders.write().retain(|p| p.device_id() != device);
    }

    /// Stop every worker and drop all assignments.
    pub fn shutdown(&self) {
        let mut state = self.state();
        for cpu in 0..state.slots.len() {
            state.slots[cpu].update(Vec::clear);
            self.stop_worker(&mut state, cpu);
        }
        state.parked.clear();
        self.responders.write().clear();
    }

    fn ensure_running(&self, state: &mut PoolState, cpu: usize) {
        let slot = &mut state.slots[cpu];
        if slot.handle.is_some() || slot.load() == 0 {
            return;
        }
        slot.shared.stop.store(false, Ordering::Release);
        let shared = slot.shared.clone();
        let responders = self.responders.clone();
        let policy = self.policy;
        match std::thread::Builder::new()
            .name(format!("avp-rx/{cpu}"))
            .spawn(move || run_worker(shared, responders, policy))
        {
            Ok(handle) => {
                slot.handle = Some(handle);
                tracing::debug!(cpu, "RX worker started");
            }
            Err(e) => tracing::error!(cpu, error = %e, "Failed to start RX worker"),
        }
    }

    fn stop_worker(&self, state: &mut PoolState, cpu: usize) {
        let slot = &mut state.slots[cpu];
        let Some(handle) = slot.handle.take() else {
            return;
        };
        slot.shared.stop.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            tracing::error!(cpu, "RX worker panicked");
        }
        tracing::debug!(cpu, "RX worker stopped");
    }
}

impl Drop for RxThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<WorkerShared>, responders: Arc<Responders>, policy: PollPolicy) {
    if policy.pin_workers {
        if let Err(e) = cpu::pin_current_thread(shared.cpu) {
            tracing::warn!(cpu = shared.cpu, error = %e, "Could not pin RX worker");
        }
    }

    while !shared.stop.load(Ordering::Acquire) {
        let queues = shared.queues.lock().clone();
        let mut passes = 0;
        let mut processed;
        loop {
            processed = queues
                .iter()
                .map(|a| a.poller.poll_queue(a.queue, policy.rx_burst))
                .sum::<usize>();
            passes += 1;
            if processed == 0 || passes >= policy.max_passes {
                break;
            }
        }

        for poller in responders.read().iter() {
            poller.service_control();
        }

        if processed == 0 {
            std::thread::park_timeout(policy.idle_backoff);
        }
    }
}
