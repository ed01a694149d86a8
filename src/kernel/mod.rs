/*!
Deterministic two-phase discrete-event kernel.

One cycle of a clock domain runs in ordered phases:

- Acquire: every runnable process executes once with mutations suppressed;
  arbitrated services record which processes contend for them.
- arbitration: each service resolves a single winner.
- Check + Commit: each runnable process (in registration order) executes in
  the Check phase; if the step reports `Success` it immediately executes
  again in the Commit phase, where storage mutations are recorded. A step
  that reports `Failed` has all its effects discarded and retries next
  cycle.
- Update: every storage with a deferred mutation applies it atomically;
  full/empty transitions toggle process notifications for the next cycle.

The same step code runs in all phases; storage and service handles behave
phase-appropriately, so a step must be written without side effects outside
the storage/service API (or guarded by `ctx.committing()`).

Determinism: processes run in registration order, clocks fire in creation
order, and arbitration ties break by service discipline. Nothing depends on
wall-clock time or hashing order.

A watchdog aborts the run when, for a configurable number of consecutive
cycles, at least one process reported back-pressure and none made progress.
*/

pub mod clock;
pub mod ports;
pub mod process;
pub mod sampling;
pub mod serialize;
pub mod storage;

use thiserror::Error;

pub use clock::{ClockId, CycleNo};
pub use ports::{Discipline, ServiceId};
pub use process::{ComponentId, ProcessId, StepResult};
pub use sampling::SampleSink;
pub use storage::{
    BufferHandle, FlagHandle, LinkedListHandle, RegisterHandle, RegisterPair, StorageId,
};

use clock::ClockRegistry;
use ports::Service;
use process::ProcessEntry;
use storage::AnyStorage;

/// Phase of the cycle currently executing. `Idle` outside any cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Acquire,
    Check,
    Commit,
    Update,
}

/// Fatal simulation-level failures. Back-pressure never surfaces here; it
/// is retried silently until the watchdog trips.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("deadlock: no process made progress for {cycles} cycles ({} stalled)", stalled.len())]
    Deadlock {
        cycles: u64,
        /// One line per stalled process: name plus its declared storages.
        stalled: Vec<String>,
    },
}

/// Anything that owns processes. The kernel dispatches a process by its
/// component and the component-local process index.
pub trait Component {
    fn name(&self) -> &str;
    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult;
    /// Contribute named state values to a sampling pass.
    fn sample_state(&self, _sink: &mut SampleSink) {}
}

/// Mutable simulation state visible to process steps: the clock registry,
/// the process table, the storage arena and the arbitrated services.
pub struct SimCtx {
    pub(crate) clocks: ClockRegistry,
    pub(crate) processes: Vec<ProcessEntry>,
    pub(crate) component_names: Vec<String>,
    pub(crate) storages: Vec<Box<dyn AnyStorage>>,
    pub(crate) pending_updates: Vec<StorageId>,
    pub(crate) services: Vec<Service>,
    pub(crate) phase: Phase,
    pub(crate) active_clock: ClockId,
    pub(crate) current: Option<ProcessId>,
}

impl SimCtx {
    fn new() -> Self {
        SimCtx {
            clocks: ClockRegistry::default(),
            processes: Vec::new(),
            component_names: Vec::new(),
            storages: Vec::new(),
            pending_updates: Vec::new(),
            services: Vec::new(),
            phase: Phase::Idle,
            active_clock: ClockId(0),
            current: None,
        }
    }

    pub fn create_clock(&mut self, name: &str, freq: u64) -> ClockId {
        self.clocks.create(name, freq)
    }

    /// Reserve a component slot; its processes reference this id.
    pub fn allocate_component(&mut self, name: &str) -> ComponentId {
        let id = ComponentId(self.component_names.len());
        self.component_names.push(name.to_string());
        id
    }

    pub fn register_process(
        &mut self,
        component: ComponentId,
        local: usize,
        name: &str,
        clock: ClockId,
    ) -> ProcessId {
        let id = ProcessId(self.processes.len());
        self.processes.push(ProcessEntry {
            name: format!("{}.{}", self.component_names[component.0], name),
            component,
            local,
            clock,
            signals: 0,
            traces: Vec::new(),
            stalled: false,
        });
        id
    }

    /// Declare the storages a process may enqueue into (used by the
    /// deadlock report).
    pub fn add_trace(&mut self, process: ProcessId, storage: StorageId) {
        self.processes[process.0].traces.push(storage);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True while effects committed by the running step will be kept.
    pub fn committing(&self) -> bool {
        self.phase == Phase::Commit
    }

    /// Cycle number of the active clock domain.
    pub fn now(&self) -> CycleNo {
        self.clocks.slots[self.active_clock.0].cycle
    }

    pub fn cycle_of(&self, clock: ClockId) -> CycleNo {
        self.clocks.slots[clock.0].cycle
    }

    pub fn current_process(&self) -> ProcessId {
        self.current
            .expect("no process is executing in this context")
    }

    pub fn process_name(&self, pid: ProcessId) -> &str {
        &self.processes[pid.0].name
    }

    /// Whether any process is currently runnable, on any clock.
    pub fn any_runnable(&self) -> bool {
        self.processes.iter().any(|p| p.runnable())
    }

    fn runnable_on(&self, clock: ClockId) -> Vec<ProcessId> {
        self.processes
            .iter()
            .enumerate()
            .filter(|(_, p)| p.clock == clock && p.runnable())
            .map(|(i, _)| ProcessId(i))
            .collect()
    }
}

/// The simulation: a context plus the components whose processes it drives.
pub struct Simulation {
    pub ctx: SimCtx,
    components: Vec<Option<Box<dyn Component>>>,
    /// Consecutive cycles with back-pressure and no progress.
    stall_streak: u64,
    deadlock_threshold: u64,
}

impl Simulation {
    pub fn new() -> Self {
        Simulation {
            ctx: SimCtx::new(),
            components: Vec::new(),
            stall_streak: 0,
            deadlock_threshold: 5000,
        }
    }

    pub fn set_deadlock_threshold(&mut self, cycles: u64) {
        self.deadlock_threshold = cycles;
    }

    /// Install the component for a previously allocated id.
    pub fn install(&mut self, id: ComponentId, component: Box<dyn Component>) {
        if self.components.len() <= id.0 {
            self.components.resize_with(id.0 + 1, || None);
        }
        assert!(
            self.components[id.0].is_none(),
            "component {} installed twice",
            self.ctx.component_names[id.0]
        );
        self.components[id.0] = Some(component);
    }

    fn dispatch(&mut self, pid: ProcessId) -> StepResult {
        let (cid, local) = {
            let entry = &self.ctx.processes[pid.0];
            (entry.component, entry.local)
        };
        self.ctx.current = Some(pid);
        let component = self.components[cid.0]
            .as_mut()
            .unwrap_or_else(|| panic!("component {cid:?} not installed"));
        let result = component.step(local, &mut self.ctx);
        self.ctx.current = None;
        result
    }

    /// Run one master tick: every clock domain due now executes one cycle.
    pub fn cycle(&mut self) -> Result<(), SimError> {
        let ticking = self.ctx.clocks.ticking();
        let mut any_success = false;
        let mut any_failed = false;
        let mut any_work = false;

        for clk in ticking {
            self.ctx.active_clock = clk;
            let runnable = self.ctx.runnable_on(clk);
            if !runnable.is_empty() {
                any_work = true;

                self.ctx.phase = Phase::Acquire;
                for &pid in &runnable {
                    self.dispatch(pid);
                }
                self.ctx.arbitrate_services();

                for &pid in &runnable {
                    self.ctx.phase = Phase::Check;
                    let checked = self.dispatch(pid);
                    let result = if checked == StepResult::Success {
                        self.ctx.phase = Phase::Commit;
                        self.dispatch(pid)
                    } else {
                        checked
                    };
                    self.ctx.processes[pid.0].stalled = result == StepResult::Failed;
                    match result {
                        StepResult::Success => any_success = true,
                        StepResult::Failed => any_failed = true,
                        StepResult::Delayed => {}
                    }
                }

                self.ctx.phase = Phase::Update;
                self.ctx.apply_updates();
                self.ctx.end_cycle_services();
            }
            self.ctx.clocks.slots[clk.0].cycle += 1;
        }

        self.ctx.phase = Phase::Idle;
        self.ctx.clocks.advance();

        if any_work && any_failed && !any_success {
            self.stall_streak += 1;
        } else {
            self.stall_streak = 0;
        }
        if self.stall_streak >= self.deadlock_threshold {
            let stalled = self.deadlock_report();
            log::error!(
                "deadlock detected after {} stalled cycles: {:?}",
                self.stall_streak,
                stalled
            );
            return Err(SimError::Deadlock {
                cycles: self.stall_streak,
                stalled,
            });
        }
        Ok(())
    }

    /// Run until nothing is runnable or `max_ticks` master ticks elapsed.
    /// Returns the number of ticks executed.
    pub fn run_until_idle(&mut self, max_ticks: u64) -> Result<u64, SimError> {
        for tick in 0..max_ticks {
            if !self.ctx.any_runnable() {
                return Ok(tick);
            }
            self.cycle()?;
        }
        Ok(max_ticks)
    }

    /// Run exactly `ticks` master ticks.
    pub fn run_for(&mut self, ticks: u64) -> Result<(), SimError> {
        for _ in 0..ticks {
            self.cycle()?;
        }
        Ok(())
    }

    fn deadlock_report(&self) -> Vec<String> {
        self.ctx
            .processes
            .iter()
            .filter(|p| p.stalled)
            .map(|p| {
                let traces: Vec<&str> = p
                    .traces
                    .iter()
                    .map(|&s| self.ctx.storage_name(s))
                    .collect();
                if traces.is_empty() {
                    p.name.clone()
                } else {
                    format!("{} (blocked towards {})", p.name, traces.join(", "))
                }
            })
            .collect()
    }

    /// Collect a named state snapshot from every installed component.
    pub fn sample(&self, sink: &mut SampleSink) {
        for component in self.components.iter().flatten() {
            component.sample_state(sink);
        }
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// One producer process pushing a counter into a buffer, one consumer
    /// popping it; exercises sensitivity, commit gating and updates.
    struct Chain {
        buf: BufferHandle<u64>,
        tick: FlagHandle,
        produced: u64,
        limit: u64,
        consumed: Rc<RefCell<Vec<u64>>>,
    }

    impl Component for Chain {
        fn name(&self) -> &str {
            "chain"
        }
        fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
            match local {
                // producer
                0 => {
                    if self.produced == self.limit {
                        return StepResult::Delayed;
                    }
                    if !self.buf.push(ctx, self.produced, 0) {
                        return StepResult::Failed;
                    }
                    if ctx.committing() {
                        self.produced += 1;
                        if self.produced == self.limit {
                            self.tick.clear(ctx);
                        }
                    }
                    StepResult::Success
                }
                // consumer
                1 => {
                    let v = self.buf.front(ctx);
                    if ctx.committing() {
                        self.consumed.borrow_mut().push(v);
                    }
                    self.buf.pop(ctx);
                    StepResult::Success
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn produce_consume_in_order() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("chain");
        let producer = sim.ctx.register_process(comp, 0, "produce", clk);
        let consumer = sim.ctx.register_process(comp, 1, "consume", clk);
        let buf = sim.ctx.create_buffer::<u64>("b_data", clk, 2, 1);
        let tick = sim.ctx.create_flag("f_tick", clk, true);
        sim.ctx.sensitive(tick.storage_id(), producer);
        sim.ctx.sensitive(buf.storage_id(), consumer);
        let consumed = Rc::new(RefCell::new(Vec::new()));
        sim.install(
            comp,
            Box::new(Chain {
                buf,
                tick,
                produced: 0,
                limit: 5,
                consumed: consumed.clone(),
            }),
        );
        let ticks = sim.run_until_idle(100).unwrap();
        assert!(ticks < 100, "did not drain");
        assert_eq!(*consumed.borrow(), vec![0, 1, 2, 3, 4]);
        let _ = producer;
    }

    /// A value produced in one clock domain crosses into another through a
    /// register pair.
    struct CrossDomain {
        pair: RegisterPair<u64>,
        keep: FlagHandle,
        sent: bool,
        received: Rc<RefCell<Option<(CycleNo, u64)>>>,
    }

    impl Component for CrossDomain {
        fn name(&self) -> &str {
            "xdomain"
        }
        fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
            match local {
                // source-domain writer: writes once
                0 => {
                    if self.sent {
                        if ctx.committing() {
                            // nothing further to send
                        }
                        self.keep.clear(ctx);
                        return StepResult::Success;
                    }
                    self.pair.src.write(ctx, 42);
                    if ctx.committing() {
                        self.sent = true;
                    }
                    StepResult::Success
                }
                // destination-domain transfer + sink
                1 => {
                    let r = self.pair.step_transfer(ctx);
                    if r == StepResult::Success && ctx.committing() {
                        *self.received.borrow_mut() =
                            Some((ctx.now(), self.pair.src.get(ctx)));
                    }
                    r
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn register_pair_crosses_domains() {
        let mut sim = Simulation::new();
        let fast = sim.ctx.create_clock("fast", 2);
        let slow = sim.ctx.create_clock("slow", 1);
        let comp = sim.ctx.allocate_component("xdomain");
        let writer = sim.ctx.register_process(comp, 0, "write", fast);
        let transfer = sim.ctx.register_process(comp, 1, "transfer", slow);
        let src = sim.ctx.create_register::<u64>("r_src", fast);
        let dst = sim.ctx.create_register::<u64>("r_dst", slow);
        let keep = sim.ctx.create_flag("f_keep", fast, true);
        sim.ctx.sensitive(keep.storage_id(), writer);
        sim.ctx.sensitive(src.storage_id(), transfer);
        let received = Rc::new(RefCell::new(None));
        sim.install(
            comp,
            Box::new(CrossDomain {
                pair: RegisterPair { src, dst },
                keep,
                sent: false,
                received: received.clone(),
            }),
        );
        sim.run_until_idle(50).unwrap();
        let got = received.borrow().expect("value never crossed");
        assert_eq!(got.1, 42);
        assert!(!dst.is_empty(&sim.ctx));
    }

    /// Two processes contending for one service; the loser must observe its
    /// failure after the winner ran.
    struct Contenders {
        svc: ServiceId,
        out: BufferHandle<u64>,
        go: FlagHandle,
        rounds: u64,
        winners: Rc<RefCell<Vec<u64>>>,
    }

    impl Component for Contenders {
        fn name(&self) -> &str {
            "contenders"
        }
        fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
            match local {
                id @ (0 | 1) => {
                    if self.rounds == 0 {
                        return StepResult::Delayed;
                    }
                    if !self.svc.invoke(ctx) {
                        return StepResult::Failed;
                    }
                    if !self.out.push(ctx, id as u64, 0) {
                        return StepResult::Failed;
                    }
                    StepResult::Success
                }
                2 => {
                    let v = self.out.front(ctx);
                    if ctx.committing() {
                        self.winners.borrow_mut().push(v);
                        self.rounds -= 1;
                        if self.rounds == 0 {
                            self.go.clear(ctx);
                        }
                    }
                    self.out.pop(ctx);
                    StepResult::Success
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn cyclic_arbitration_alternates_winners() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("contenders");
        let a = sim.ctx.register_process(comp, 0, "a", clk);
        let b = sim.ctx.register_process(comp, 1, "b", clk);
        let drain = sim.ctx.register_process(comp, 2, "drain", clk);
        let svc = sim.ctx.create_service("p_out", Discipline::Cyclic);
        sim.ctx.service_add_cyclic(svc, a);
        sim.ctx.service_add_cyclic(svc, b);
        let out = sim.ctx.create_buffer::<u64>("b_out", clk, 1, 1);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), a);
        // b polls on its own permanently-set flag
        let go_b = sim.ctx.create_flag("f_go_b", clk, true);
        sim.ctx.sensitive(go_b.storage_id(), b);
        sim.ctx.sensitive(out.storage_id(), drain);
        let winners = Rc::new(RefCell::new(Vec::new()));
        sim.install(
            comp,
            Box::new(Contenders {
                svc,
                out,
                go,
                rounds: 4,
                winners: winners.clone(),
            }),
        );
        sim.run_for(20).unwrap();
        let w = winners.borrow();
        assert!(w.len() >= 4);
        // Round robin: winners alternate.
        assert_ne!(w[0], w[1]);
        assert_ne!(w[1], w[2]);
    }

    /// A process that always fails trips the watchdog.
    struct Stuck {
        full: BufferHandle<u64>,
        go: FlagHandle,
    }

    impl Component for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }
        fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
            if !self.full.push(ctx, 1, 0) {
                return StepResult::Failed;
            }
            let _ = self.go;
            StepResult::Success
        }
    }

    #[test]
    fn watchdog_reports_deadlock() {
        let mut sim = Simulation::new();
        sim.set_deadlock_threshold(10);
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("stuck");
        let p = sim.ctx.register_process(comp, 0, "push", clk);
        // Capacity-1 buffer with nothing draining it.
        let full = sim.ctx.create_buffer::<u64>("b_full", clk, 1, 1);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), p);
        sim.ctx.add_trace(p, full.storage_id());
        sim.install(comp, Box::new(Stuck { full, go }));
        let err = sim.run_for(50).unwrap_err();
        match err {
            SimError::Deadlock { stalled, .. } => {
                assert_eq!(stalled.len(), 1);
                assert!(stalled[0].contains("stuck.push"));
                assert!(stalled[0].contains("b_full"));
            }
        }
    }

    #[test]
    fn linked_list_splice_and_pop() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("list");
        struct ListDriver {
            list: LinkedListHandle,
            go: FlagHandle,
            step: u32,
        }
        impl Component for ListDriver {
            fn name(&self) -> &str {
                "list"
            }
            fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
                match self.step {
                    0 => {
                        // splice the chain 3 -> 1 -> 4
                        self.list.set_next(ctx, 3, 1);
                        self.list.set_next(ctx, 1, 4);
                        self.list.append(ctx, 3, 4);
                        if ctx.committing() {
                            self.step = 1;
                        }
                    }
                    1 => {
                        self.list.push(ctx, 2);
                        if ctx.committing() {
                            self.step = 2;
                        }
                    }
                    2 => {
                        self.list.pop(ctx);
                        if ctx.committing() {
                            self.step = 3;
                            self.go.clear(ctx);
                        }
                    }
                    _ => return StepResult::Delayed,
                }
                StepResult::Success
            }
        }
        let p = sim.ctx.register_process(comp, 0, "drive", clk);
        let list = sim.ctx.create_linked_list("l_items", clk, 8);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), p);
        sim.install(comp, Box::new(ListDriver { list, go, step: 0 }));
        sim.run_for(1).unwrap();
        assert_eq!(list.iter_snapshot(&sim.ctx), vec![3, 1, 4]);
        sim.run_for(1).unwrap();
        assert_eq!(list.iter_snapshot(&sim.ctx), vec![3, 1, 4, 2]);
        sim.run_for(1).unwrap();
        assert_eq!(list.iter_snapshot(&sim.ctx), vec![1, 4, 2]);
        assert!(list.singular(&sim.ctx) == false);
    }
}
