/*!
Command-line harness: build a memory system from a configuration file,
attach a deterministic random workload, run it for a number of cycles and
print the statistics.

Exits non-zero when the deadlock watchdog trips, printing the stalled
processes.
*/

use std::cell::RefCell;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use comasim::breakpoints::{BreakPointManager, BREAK_READ, BREAK_WRITE};
use comasim::config::Config;
use comasim::kernel::{Component, SampleSink, SimCtx, Simulation, StepResult};
use comasim::mem::{create_memory, MemAddr, MemData, MemoryCallback, MemoryPort, MemorySystem};

/// Keeps the memory system reachable after installation so the final
/// statistics and dumps can be printed.
struct MemShim(Rc<RefCell<Box<dyn MemorySystem>>>);

impl Component for MemShim {
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

#[derive(Parser, Debug)]
#[command(name = "comasim", about = "Cycle-accurate COMA memory-system simulator")]
struct Args {
    /// Configuration file (key = value lines).
    #[arg(short, long)]
    config: Option<String>,

    /// Memory system to build.
    #[arg(short, long, default_value = "TwoLevelCDMA")]
    memory: String,

    /// Number of master cycles to run.
    #[arg(long, default_value_t = 100_000)]
    cycles: u64,

    /// Number of memory clients to attach.
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Operations each client issues.
    #[arg(long, default_value_t = 1000)]
    ops: u64,

    /// Workload random seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Lines in the workload's working set.
    #[arg(long, default_value_t = 64)]
    working_set: u64,

    /// Watch an address: break on reads and writes touching its line.
    #[arg(long)]
    watch: Option<String>,

    /// Write a binary state-sample stream to this file.
    #[arg(long)]
    sample: Option<String>,

    /// Only print the final statistics.
    #[arg(short, long)]
    quiet: bool,
}

/// Records completions; the workload only needs the counts.
#[derive(Default)]
struct WorkloadState {
    reads_done: u64,
    writes_done: u64,
}

impl MemoryCallback for WorkloadState {
    fn on_memory_read_completed(&mut self, _addr: MemAddr, _data: &[u8]) -> bool {
        self.reads_done += 1;
        true
    }
    fn on_memory_write_completed(&mut self, _wid: u64) -> bool {
        self.writes_done += 1;
        true
    }
}

/// Issues random line reads and masked writes over a small working set.
struct Workload {
    port: MemoryPort,
    state: Rc<RefCell<WorkloadState>>,
    rng: StdRng,
    remaining: u64,
    issued: u64,
    working_set: u64,
    go: comasim::kernel::FlagHandle,
    breakpoints: Rc<RefCell<BreakPointManager>>,
    /// Planned next operation, fixed until it is accepted so that retries
    /// do not re-roll the dice.
    planned: Option<(bool, u64, u8)>,
}

impl Component for Workload {
    fn name(&self) -> &str {
        "workload"
    }

    fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
        if self.remaining == 0 {
            // Stand down once everything we issued has completed.
            let state = self.state.borrow();
            if state.reads_done + state.writes_done >= self.issued {
                self.go.clear(ctx);
            }
            return StepResult::Delayed;
        }
        let line = self.port.line_size() as u64;
        let (write, slot, value) = *self.planned.get_or_insert_with(|| {
            (
                self.rng.random_bool(0.3),
                self.rng.random_range(0..self.working_set),
                self.rng.random(),
            )
        });
        let addr = slot * line;
        let accepted = if write {
            let mut data = MemData::new(line as usize);
            data.patch((value % 56) as usize, &[value; 8]);
            self.port.write(ctx, addr, &data, self.issued)
        } else {
            self.port.read(ctx, addr)
        };
        if !accepted {
            return StepResult::Failed;
        }
        if ctx.committing() {
            self.breakpoints.borrow_mut().check(
                if write { BREAK_WRITE } else { BREAK_READ },
                addr,
                "workload",
            );
            self.planned = None;
            self.remaining -= 1;
            self.issued += 1;
        }
        StepResult::Success
    }
}

fn run(args: &Args) -> Result<(), String> {
    let cfg = match &args.config {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string())?,
        None => {
            let mut cfg = Config::new();
            cfg.set("CacheLineSize", 64);
            cfg.set("L2CacheNumSets", 64);
            cfg.set("L2CacheAssociativity", 4);
            cfg.set("NumRootDirectories", 1);
            cfg.set("NumL2CachesPerRing", 4);
            cfg.set("NumClientsPerL2Cache", 1);
            cfg.set("BaseRequestTime", 2);
            cfg.set("TimePerLine", 2);
            cfg.set("BufferSize", 4);
            cfg.set("NumBanks", 8);
            cfg.set("NumInterfaces", 2);
            cfg
        }
    };

    let mut sim = Simulation::new();
    sim.set_deadlock_threshold(cfg.get_or("DeadlockThreshold", 5000u64).map_err(|e| e.to_string())?);
    let clock = sim.ctx.create_clock("mem", 100);
    let mut memory =
        create_memory(&mut sim.ctx, clock, &cfg, &args.memory).map_err(|e| e.to_string())?;

    let breakpoints = Rc::new(RefCell::new(BreakPointManager::new()));
    if let Some(watch) = &args.watch {
        let addr = u64::from_str_radix(watch.trim_start_matches("0x"), 16)
            .map_err(|_| format!("bad watch address `{watch}`"))?;
        breakpoints.borrow_mut().add(addr, BREAK_READ | BREAK_WRITE);
        log::info!("watching {addr:#x}");
    }

    // Attach the workload clients.
    let line = memory.line_size() as u64;
    let mut states = Vec::new();
    for i in 0..args.clients {
        let comp = sim.ctx.allocate_component(&format!("workload{i}"));
        let pid = sim.ctx.register_process(comp, 0, "issue", clock);
        let go = sim
            .ctx
            .create_flag(&format!("workload{i}.f_go"), clock, true);
        sim.ctx.sensitive(go.storage_id(), pid);
        let state = Rc::new(RefCell::new(WorkloadState::default()));
        let (_, port) = memory
            .register_client(&mut sim.ctx, state.clone(), pid, false)
            .map_err(|e| e.to_string())?;
        sim.install(
            comp,
            Box::new(Workload {
                port,
                state: state.clone(),
                rng: StdRng::seed_from_u64(args.seed.wrapping_add(i as u64)),
                remaining: args.ops,
                issued: 0,
                working_set: args.working_set,
                go,
                breakpoints: breakpoints.clone(),
                planned: None,
            }),
        );
        states.push(state);
    }
    // Touch the working set so cold reads return recognizable data.
    for slot in 0..args.working_set {
        let seed = (slot & 0xff) as u8;
        let bytes: Vec<u8> = (0..line).map(|i| seed.wrapping_add(i as u8)).collect();
        memory.store().borrow_mut().write(slot * line, &bytes, None);
    }

    memory.initialize(&mut sim.ctx).map_err(|e| e.to_string())?;
    let mem_comp = memory.component_id();
    let memory = Rc::new(RefCell::new(memory));
    sim.install(mem_comp, Box::new(MemShim(memory.clone())));

    let ticks = sim
        .run_until_idle(args.cycles)
        .map_err(|e| e.to_string())?;

    let mut sink = SampleSink::new();
    sim.sample(&mut sink);
    if let Some(path) = &args.sample {
        let file = std::fs::File::create(path).map_err(|e| e.to_string())?;
        let mut sampler = comasim::kernel::sampling::BinarySampler::new(file);
        sampler.begin(&sink).map_err(|e| e.to_string())?;
        sampler.frame(&sink).map_err(|e| e.to_string())?;
        log::info!("wrote {} sample frames to {path}", sampler.frames_written());
    }
    if !args.quiet {
        for (name, value) in sink.values() {
            println!("{name:40} {value}");
        }
    }
    let reads: u64 = states.iter().map(|s| s.borrow().reads_done).sum();
    let writes: u64 = states.iter().map(|s| s.borrow().writes_done).sum();
    let stats = memory.borrow().statistics();
    println!("cycles run      : {ticks}");
    println!("reads completed : {reads}");
    println!("writes completed: {writes}");
    println!(
        "memory traffic  : {} reads / {} writes ({} external reads, {} external writes)",
        stats.nreads, stats.nwrites, stats.external_reads, stats.external_writes
    );
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("final state:\n{}", memory.borrow().dump(&sim.ctx));
    }
    for hit in breakpoints.borrow_mut().resume() {
        println!("breakpoint hit  : {:#x} by {}", hit.addr, hit.component);
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
