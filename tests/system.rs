//! Black-box checks through the public crate surface: build each memory
//! system by its configured name, drive it with a minimal client, and
//! observe the callbacks and statistics.

use std::cell::RefCell;
use std::rc::Rc;

use comasim::config::Config;
use comasim::kernel::{Component, SampleSink, SimCtx, Simulation, StepResult};
use comasim::mem::{create_memory, MemAddr, MemData, MemoryCallback, MemoryPort, MemorySystem};

const LINE: usize = 64;

#[derive(Default)]
struct Recorder {
    reads: Vec<(MemAddr, Vec<u8>)>,
    write_acks: usize,
}

impl MemoryCallback for Recorder {
    fn on_memory_read_completed(&mut self, addr: MemAddr, data: &[u8]) -> bool {
        self.reads.push((addr, data.to_vec()));
        true
    }
    fn on_memory_write_completed(&mut self, _wid: u64) -> bool {
        self.write_acks += 1;
        true
    }
}

/// A one-shot client: writes a value, waits for the ack, reads it back.
struct WriteThenRead {
    port: MemoryPort,
    state: Rc<RefCell<Recorder>>,
    addr: MemAddr,
    stage: u8,
    go: comasim::kernel::FlagHandle,
}

impl Component for WriteThenRead {
    fn name(&self) -> &str {
        "client"
    }
    fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
        match self.stage {
            0 => {
                let mut data = MemData::new(LINE);
                data.patch(0, &[0x5a; 8]);
                if !self.port.write(ctx, self.addr, &data, 1) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.stage = 1;
                }
                StepResult::Success
            }
            1 => {
                if self.state.borrow().write_acks == 0 {
                    return StepResult::Delayed;
                }
                if !self.port.read(ctx, self.addr) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.stage = 2;
                }
                StepResult::Success
            }
            _ => {
                if self.state.borrow().reads.is_empty() {
                    return StepResult::Delayed;
                }
                self.go.clear(ctx);
                StepResult::Delayed
            }
        }
    }
}

struct Shim(Rc<RefCell<Box<dyn MemorySystem>>>);

impl Component for Shim {
    fn name(&self) -> &str {
        "memory"
    }
    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        self.0.borrow_mut().step(local, ctx)
    }
    fn sample_state(&self, sink: &mut SampleSink) {
        self.0.borrow().sample_state(sink)
    }
}

fn base_config() -> Config {
    Config::from_str_contents(
        "CacheLineSize = 64\n\
         L2CacheNumSets = 4\n\
         L2CacheAssociativity = 2\n\
         BankSelector = DIRECT\n\
         NumRootDirectories = 1\n\
         NumL2CachesPerRing = 2\n\
         NumClientsPerL2Cache = 1\n\
         BaseRequestTime = 2\n\
         TimePerLine = 2\n\
         BufferSize = 4\n\
         NumBanks = 2\n\
         NumInterfaces = 1\n\
         DDR_tCL = 3\n\
         DDR_tRCD = 3\n\
         DDR_tRP = 3\n",
    )
}

fn write_then_read_round_trip(kind: &str) {
    let cfg = base_config();
    let mut sim = Simulation::new();
    sim.set_deadlock_threshold(1000);
    let clock = sim.ctx.create_clock("mem", 100);
    let mut memory = create_memory(&mut sim.ctx, clock, &cfg, kind).expect("backend builds");
    assert_eq!(memory.line_size(), LINE);

    // Two clients so the coherent hierarchies get two caches.
    let mut states = Vec::new();
    for i in 0..2 {
        let comp = sim.ctx.allocate_component(&format!("client{i}"));
        let pid = sim.ctx.register_process(comp, 0, "drive", clock);
        let go = sim.ctx.create_flag(&format!("client{i}.f_go"), clock, true);
        sim.ctx.sensitive(go.storage_id(), pid);
        let state = Rc::new(RefCell::new(Recorder::default()));
        let (_, port) = memory
            .register_client(&mut sim.ctx, state.clone(), pid, false)
            .expect("registration");
        sim.install(
            comp,
            Box::new(WriteThenRead {
                port,
                state: state.clone(),
                addr: (i as u64) * LINE as u64,
                stage: 0,
                go,
            }),
        );
        states.push(state);
    }
    memory.initialize(&mut sim.ctx).expect("topology");
    let comp = memory.component_id();
    let memory = Rc::new(RefCell::new(memory));
    sim.install(comp, Box::new(Shim(memory.clone())));

    let ticks = sim.run_until_idle(20_000).expect("no deadlock");
    assert!(ticks < 20_000, "{kind}: system never went idle");

    for (i, state) in states.iter().enumerate() {
        let state = state.borrow();
        assert_eq!(state.write_acks, 1, "{kind}: client {i} write not acked");
        let (_, data) = state.reads.last().expect("read completed");
        assert_eq!(&data[..8], &[0x5a; 8], "{kind}: client {i} read stale data");
    }
    let stats = memory.borrow().statistics();
    assert_eq!(stats.nreads, 2, "{kind}");
    assert_eq!(stats.nwrites, 2, "{kind}");

    let mut sink = SampleSink::new();
    sim.sample(&mut sink);
    assert!(!sink.values().is_empty(), "{kind}: nothing sampled");
}

#[test]
fn parallel_memory_round_trip() {
    write_then_read_round_trip("ParallelMemory");
}

#[test]
fn banked_memory_round_trip() {
    write_then_read_round_trip("BankedMemory");
}

#[test]
fn ddr_memory_round_trip() {
    write_then_read_round_trip("DDRMemory");
}

#[test]
fn one_level_cdma_round_trip() {
    write_then_read_round_trip("OneLevelCDMA");
}

#[test]
fn two_level_cdma_round_trip() {
    write_then_read_round_trip("TwoLevelCDMA");
}

#[test]
fn zlcdma_round_trip() {
    write_then_read_round_trip("ZLCDMA");
}

#[test]
fn unknown_backend_is_a_configuration_error() {
    let cfg = base_config();
    let mut sim = Simulation::new();
    let clock = sim.ctx.create_clock("mem", 100);
    let err = create_memory(&mut sim.ctx, clock, &cfg, "HoloMemory").unwrap_err();
    assert!(err.to_string().contains("HoloMemory"));
}

#[test]
fn unaligned_access_is_rejected() {
    let cfg = base_config();
    let mut sim = Simulation::new();
    let clock = sim.ctx.create_clock("mem", 100);
    let mut memory = create_memory(&mut sim.ctx, clock, &cfg, "ParallelMemory").unwrap();
    let comp = sim.ctx.allocate_component("client");
    let pid = sim.ctx.register_process(comp, 0, "drive", clock);
    let go = sim.ctx.create_flag("f_go", clock, true);
    sim.ctx.sensitive(go.storage_id(), pid);
    let state = Rc::new(RefCell::new(Recorder::default()));
    let (_, port) = memory
        .register_client(&mut sim.ctx, state, pid, false)
        .unwrap();
    memory.initialize(&mut sim.ctx).unwrap();

    struct Unaligned {
        port: MemoryPort,
    }
    impl Component for Unaligned {
        fn name(&self) -> &str {
            "client"
        }
        fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
            self.port.read(ctx, 7);
            StepResult::Success
        }
    }
    let mem_comp = memory.component_id();
    sim.install(mem_comp, memory.into_component());
    sim.install(comp, Box::new(Unaligned { port }));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = sim.run_for(1);
    }));
    assert!(result.is_err(), "unaligned read must abort");
}
