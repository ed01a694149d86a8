//! Shared test utilities: scripted memory clients and system builders.
//!
//! These helpers de-duplicate harness construction across the backend and
//! hierarchy test modules. A `TestClient` is a component driving a script
//! of operations through its memory port, one per cycle, recording every
//! callback it receives; builders assemble a simulation with a memory
//! system, N clients and small, fast default parameters.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::Config;
use crate::kernel::{
    ClockId, Component, CycleNo, FlagHandle, SampleSink, SimCtx, Simulation, StepResult,
};
use crate::mem::cdma::CdmaMemory;
use crate::mem::zlcdma::ZlcdmaMemory;
use crate::mem::{MemAddr, MemData, Memory, MemoryCallback, MemoryPort};

/// Line size used by the harnesses.
pub const LINE: usize = 64;

/// Everything a client observed through its callback.
#[derive(Debug, Default)]
pub struct ClientState {
    pub reads: Vec<(MemAddr, Vec<u8>)>,
    pub write_acks: Vec<u64>,
    pub snoops: Vec<(MemAddr, Vec<u8>, Vec<bool>)>,
    pub invalidations: Vec<MemAddr>,
}

impl ClientState {
    /// Data of the most recent completed read of `addr`.
    pub fn last_read(&self, addr: MemAddr) -> Option<&[u8]> {
        self.reads
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, d)| d.as_slice())
    }
}

impl MemoryCallback for ClientState {
    fn on_memory_read_completed(&mut self, addr: MemAddr, data: &[u8]) -> bool {
        self.reads.push((addr, data.to_vec()));
        true
    }
    fn on_memory_write_completed(&mut self, wid: u64) -> bool {
        self.write_acks.push(wid);
        true
    }
    fn on_memory_snooped(&mut self, addr: MemAddr, data: &[u8], mask: &[bool]) -> bool {
        self.snoops.push((addr, data.to_vec(), mask.to_vec()));
        true
    }
    fn on_memory_invalidated(&mut self, addr: MemAddr) -> bool {
        self.invalidations.push(addr);
        true
    }
}

/// One scripted operation.
#[derive(Debug, Clone)]
pub enum Op {
    Read(MemAddr),
    /// Masked write of `bytes` at byte `offset` within the line at `addr`.
    Write(MemAddr, usize, Vec<u8>),
    /// Block until this many reads have completed.
    WaitReads(usize),
    /// Block until this many write acknowledgements have arrived.
    WaitWrites(usize),
    /// Sit out this many cycles.
    Idle(CycleNo),
}

pub struct TestClient {
    port: MemoryPort,
    script: Rc<RefCell<VecDeque<Op>>>,
    state: Rc<RefCell<ClientState>>,
    go: FlagHandle,
    next_wid: u64,
    idle_until: Option<CycleNo>,
}

impl Component for TestClient {
    fn name(&self) -> &str {
        "client"
    }

    fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
        let front = self.script.borrow().front().cloned();
        let Some(op) = front else {
            let _ = self.go;
            return StepResult::Delayed;
        };
        match op {
            Op::Read(addr) => {
                if !self.port.read(ctx, addr) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.script.borrow_mut().pop_front();
                }
                StepResult::Success
            }
            Op::Write(addr, offset, bytes) => {
                let mut data = MemData::new(self.port.line_size());
                data.patch(offset, &bytes);
                let wid = self.next_wid;
                if !self.port.write(ctx, addr, &data, wid) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.next_wid += 1;
                    self.script.borrow_mut().pop_front();
                }
                StepResult::Success
            }
            Op::WaitReads(n) => {
                if self.state.borrow().reads.len() >= n {
                    if ctx.committing() {
                        self.script.borrow_mut().pop_front();
                    }
                    StepResult::Success
                } else {
                    StepResult::Delayed
                }
            }
            Op::WaitWrites(n) => {
                if self.state.borrow().write_acks.len() >= n {
                    if ctx.committing() {
                        self.script.borrow_mut().pop_front();
                    }
                    StepResult::Success
                } else {
                    StepResult::Delayed
                }
            }
            Op::Idle(cycles) => match self.idle_until {
                None => {
                    if ctx.committing() {
                        self.idle_until = Some(ctx.now() + cycles);
                    }
                    StepResult::Success
                }
                Some(until) if ctx.now() >= until => {
                    if ctx.committing() {
                        self.idle_until = None;
                        self.script.borrow_mut().pop_front();
                    }
                    StepResult::Success
                }
                Some(_) => StepResult::Delayed,
            },
        }
    }
}

/// Handle to one attached client.
pub struct ClientHandle {
    pub state: Rc<RefCell<ClientState>>,
    pub script: Rc<RefCell<VecDeque<Op>>>,
}

impl ClientHandle {
    pub fn push(&self, op: Op) {
        self.script.borrow_mut().push_back(op);
    }

    pub fn script_done(&self) -> bool {
        self.script.borrow().is_empty()
    }
}

/// Forwarding shim so tests keep shared access to an installed component.
pub struct Shim<T: Component> {
    name: String,
    pub inner: Rc<RefCell<T>>,
}

impl<T: Component> Shim<T> {
    pub fn new(name: &str, inner: Rc<RefCell<T>>) -> Self {
        Shim {
            name: name.to_string(),
            inner,
        }
    }
}

impl<T: Component> Component for Shim<T> {
    fn name(&self) -> &str {
        &self.name
    }
    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        self.inner.borrow_mut().step(local, ctx)
    }
    fn sample_state(&self, sink: &mut SampleSink) {
        self.inner.borrow().sample_state(sink)
    }
}

/// Small, fast defaults shared by the system builders.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut cfg = Config::new();
    cfg.set("CacheLineSize", LINE);
    cfg.set("L2CacheNumSets", 4);
    cfg.set("L2CacheAssociativity", 2);
    cfg.set("BankSelector", "DIRECT");
    cfg.set("NumRootDirectories", 1);
    cfg.set("NumL2CachesPerRing", 4);
    cfg.set("NumClientsPerL2Cache", 1);
    cfg.set("NodeBufferSize", 2);
    cfg.set("BaseRequestTime", 2);
    cfg.set("TimePerLine", 2);
    cfg.set("BufferSize", 4);
    cfg.set("NumBanks", 4);
    cfg.set("NumInterfaces", 2);
    cfg.set("DDR_tCL", 4);
    cfg.set("DDR_tRCD", 4);
    cfg.set("DDR_tRP", 4);
    cfg.set("DDR_BurstLength", 8);
    for (k, v) in overrides {
        cfg.set(k, v);
    }
    cfg
}

/// Create a driver process plus recorder state and register it with the
/// memory; returns the handle tests use to push operations.
pub fn attach_client<M: Memory>(
    sim: &mut Simulation,
    mem: &mut M,
    clock: ClockId,
    index: usize,
) -> ClientHandle {
    let comp = sim.ctx.allocate_component(&format!("client{index}"));
    let pid = sim.ctx.register_process(comp, 0, "drive", clock);
    let go = sim
        .ctx
        .create_flag(&format!("client{index}.f_go"), clock, true);
    sim.ctx.sensitive(go.storage_id(), pid);
    let state = Rc::new(RefCell::new(ClientState::default()));
    let (_, port) = mem
        .register_client(&mut sim.ctx, state.clone(), pid, false)
        .expect("client registration");
    let script = Rc::new(RefCell::new(VecDeque::new()));
    sim.install(
        comp,
        Box::new(TestClient {
            port,
            script: script.clone(),
            state: state.clone(),
            go,
            next_wid: index as u64 * 10_000,
            idle_until: None,
        }),
    );
    ClientHandle { state, script }
}

/// A built system around one memory system.
pub struct Harness<M: Memory + Component + 'static> {
    pub sim: Simulation,
    pub mem: Rc<RefCell<M>>,
    pub clients: Vec<ClientHandle>,
}

impl<M: Memory + Component + 'static> Harness<M> {
    pub fn preload(&self, addr: MemAddr, bytes: &[u8]) {
        self.mem
            .borrow()
            .store()
            .borrow_mut()
            .write(addr, bytes, None);
    }

    pub fn store_byte(&self, addr: MemAddr) -> u8 {
        self.mem.borrow().store().borrow().read_u8(addr)
    }

    pub fn scripts_done(&self) -> bool {
        self.clients.iter().all(|c| c.script_done())
    }

    /// Run until every script finished and `drained` holds; panics if
    /// `max_ticks` is not enough.
    pub fn quiesce_with(&mut self, max_ticks: u64, drained: impl Fn(&M) -> bool) {
        for _ in 0..max_ticks {
            if self.scripts_done() && drained(&self.mem.borrow()) {
                return;
            }
            self.sim.cycle().expect("simulation error");
        }
        panic!("system did not quiesce within {max_ticks} ticks");
    }

    /// Run until the scripts finished, without waiting for ring traffic.
    pub fn run_scripts(&mut self, max_ticks: u64) {
        self.quiesce_with(max_ticks, |_| true);
    }
}

impl Harness<CdmaMemory> {
    /// Scripts finished and no message is alive anywhere.
    pub fn quiesce(&mut self, max_ticks: u64) {
        self.quiesce_with(max_ticks, |m| m.live_messages() == 0);
    }
}

impl Harness<ZlcdmaMemory> {
    pub fn quiesce(&mut self, max_ticks: u64) {
        self.quiesce_with(max_ticks, |m| m.live_messages() == 0);
    }
}

/// Build a CDMA system with `num_clients` single-client caches.
pub fn cdma_harness(
    num_clients: usize,
    two_level: bool,
    overrides: &[(&str, &str)],
) -> Harness<CdmaMemory> {
    let cfg = test_config(overrides);
    let mut sim = Simulation::new();
    sim.set_deadlock_threshold(1000);
    let clock = sim.ctx.create_clock("mem", 1);
    let mut mem = CdmaMemory::new(&mut sim.ctx, clock, &cfg, two_level).expect("config");
    let comp = mem.component_id();
    let clients = (0..num_clients)
        .map(|i| attach_client(&mut sim, &mut mem, clock, i))
        .collect();
    mem.initialize(&mut sim.ctx).expect("topology");
    let mem = Rc::new(RefCell::new(mem));
    sim.install(comp, Box::new(Shim::new("cdma", mem.clone())));
    Harness { sim, mem, clients }
}

/// Build a ZLCDMA system with `num_clients` single-client caches.
pub fn zlcdma_harness(num_clients: usize, overrides: &[(&str, &str)]) -> Harness<ZlcdmaMemory> {
    let cfg = test_config(overrides);
    let mut sim = Simulation::new();
    sim.set_deadlock_threshold(1000);
    let clock = sim.ctx.create_clock("mem", 1);
    let mut mem = ZlcdmaMemory::new(&mut sim.ctx, clock, &cfg).expect("config");
    let comp = mem.component_id();
    let clients = (0..num_clients)
        .map(|i| attach_client(&mut sim, &mut mem, clock, i))
        .collect();
    mem.initialize(&mut sim.ctx).expect("topology");
    let mem = Rc::new(RefCell::new(mem));
    sim.install(comp, Box::new(Shim::new("zlcdma", mem.clone())));
    Harness { sim, mem, clients }
}

/// A line-sized pattern with a recognizable byte sequence.
pub fn pattern(seed: u8) -> Vec<u8> {
    (0..LINE).map(|i| seed.wrapping_add(i as u8)).collect()
}
