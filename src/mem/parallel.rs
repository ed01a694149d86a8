/*!
Parallel memory: one private port per client, no contention.

Every client gets its own request pipeline; a request completes
`BaseRequestTime + TimePerLine * ceil(size / line)` cycles after it was
issued. Useful both as the simplest timing model and as the reference the
banked and DDR models are measured against.

Completion callbacks fire during the Commit phase, before the step records
any storage mutation, so a refused callback cleanly retries next cycle.
*/

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{Config, ConfigError};
use crate::kernel::{
    BufferHandle, ClockId, Component, ComponentId, CycleNo, ProcessId, SampleSink, SimCtx,
    StepResult,
};
use crate::mem::store::SparseMemory;
use crate::mem::{
    ClientCallback, ClientEntry, MemAddr, MemData, Memory, MemoryPort, Mcid, WClientId,
};

#[derive(Debug, Clone)]
struct Request {
    write: bool,
    address: MemAddr,
    data: MemData,
    wid: WClientId,
    done: CycleNo,
}

#[derive(Debug, Default)]
pub(crate) struct MemStats {
    pub nreads: u64,
    pub nwrites: u64,
    pub nread_bytes: u64,
    pub nwrite_bytes: u64,
}

pub struct ParallelMemory {
    comp: ComponentId,
    clock: ClockId,
    line_size: usize,
    base_time: CycleNo,
    time_per_line: CycleNo,
    buffer_size: usize,
    clients: Rc<RefCell<Vec<ClientEntry>>>,
    pipes: Vec<BufferHandle<Request>>,
    store: Rc<RefCell<SparseMemory>>,
    stats: Rc<RefCell<MemStats>>,
}

impl ParallelMemory {
    pub fn new(ctx: &mut SimCtx, clock: ClockId, cfg: &Config) -> Result<Self, ConfigError> {
        let comp = ctx.allocate_component("pmem");
        Ok(ParallelMemory {
            comp,
            clock,
            line_size: cfg.get_power_of_two("CacheLineSize")? as usize,
            base_time: cfg.get("BaseRequestTime")?,
            time_per_line: cfg.get("TimePerLine")?,
            buffer_size: cfg.get("BufferSize")?,
            clients: Rc::new(RefCell::new(Vec::new())),
            pipes: Vec::new(),
            store: Rc::new(RefCell::new(SparseMemory::new())),
            stats: Rc::new(RefCell::new(MemStats::default())),
        })
    }

    pub fn component_id(&self) -> ComponentId {
        self.comp
    }

    fn latency(&self) -> CycleNo {
        self.base_time + self.time_per_line
    }
}

impl Memory for ParallelMemory {
    fn register_client(
        &mut self,
        ctx: &mut SimCtx,
        callback: ClientCallback,
        process: ProcessId,
        grouped: bool,
    ) -> Result<(Mcid, MemoryPort), ConfigError> {
        let id = if grouped {
            self.clients.borrow().len() - 1
        } else {
            let id = self.clients.borrow().len();
            self.clients.borrow_mut().push(ClientEntry {
                callback: Some(callback),
                process,
            });
            let pipe = ctx.create_buffer::<Request>(
                &format!("pmem.port{id}.b_pipeline"),
                self.clock,
                self.buffer_size,
                1,
            );
            let deliver =
                ctx.register_process(self.comp, self.pipes.len(), "deliver", self.clock);
            ctx.sensitive(pipe.storage_id(), deliver);
            ctx.add_trace(process, pipe.storage_id());
            self.pipes.push(pipe);
            id
        };
        let port = ParallelPort {
            line_size: self.line_size,
            latency: self.latency(),
            pipe: self.pipes[id],
            client: id,
            clients: self.clients.clone(),
            stats: self.stats.clone(),
        };
        Ok((id, MemoryPort::Parallel(port)))
    }

    fn unregister_client(&mut self, id: Mcid) {
        self.clients.borrow_mut()[id].callback = None;
    }

    fn initialize(&mut self, _ctx: &mut SimCtx) -> Result<(), ConfigError> {
        Ok(())
    }

    fn component_id(&self) -> crate::kernel::ComponentId {
        self.comp
    }

    fn statistics(&self) -> crate::mem::MemoryStatistics {
        let stats = self.stats.borrow();
        crate::mem::MemoryStatistics {
            nreads: stats.nreads,
            nwrites: stats.nwrites,
            nread_bytes: stats.nread_bytes,
            nwrite_bytes: stats.nwrite_bytes,
            // Every access goes straight to storage.
            external_reads: stats.nreads,
            external_writes: stats.nwrites,
        }
    }

    fn dump(&self, ctx: &SimCtx) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, pipe) in self.pipes.iter().enumerate() {
            let _ = writeln!(out, "port{i}:");
            for r in pipe.iter_snapshot(ctx) {
                let _ = writeln!(
                    out,
                    "  {:#018x} | {} | done {}",
                    r.address,
                    if r.write { "write" } else { "read " },
                    r.done
                );
            }
        }
        out
    }

    fn line_size(&self) -> usize {
        self.line_size
    }

    fn store(&self) -> Rc<RefCell<SparseMemory>> {
        self.store.clone()
    }
}

impl Component for ParallelMemory {
    fn name(&self) -> &str {
        "pmem"
    }

    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        let pipe = self.pipes[local];
        let request = pipe.front(ctx);
        if ctx.now() < request.done {
            // Not arrived yet; stay runnable and poll again next cycle.
            return StepResult::Delayed;
        }
        let callback = self.clients.borrow()[local]
            .callback
            .clone()
            .expect("client unregistered with requests in flight");
        if request.write {
            if ctx.committing() {
                self.store.borrow_mut().write(
                    request.address,
                    &request.data.data,
                    Some(&request.data.mask),
                );
                if !callback.borrow_mut().on_memory_write_completed(request.wid) {
                    return StepResult::Failed;
                }
            }
        } else if ctx.committing() {
            let mut data = vec![0; self.line_size];
            self.store.borrow().read(request.address, &mut data);
            if !callback
                .borrow_mut()
                .on_memory_read_completed(request.address, &data)
            {
                return StepResult::Failed;
            }
        }
        pipe.pop(ctx);
        StepResult::Success
    }

    fn sample_state(&self, sink: &mut SampleSink) {
        let stats = self.stats.borrow();
        sink.record("pmem.nreads", stats.nreads);
        sink.record("pmem.nwrites", stats.nwrites);
    }
}

/// Client handle for the parallel memory.
#[derive(Clone)]
pub struct ParallelPort {
    pub(crate) line_size: usize,
    latency: CycleNo,
    pipe: BufferHandle<Request>,
    client: usize,
    clients: Rc<RefCell<Vec<ClientEntry>>>,
    stats: Rc<RefCell<MemStats>>,
}

impl ParallelPort {
    pub fn read(&self, ctx: &mut SimCtx, addr: MemAddr) -> bool {
        let request = Request {
            write: false,
            address: addr,
            data: MemData::new(self.line_size),
            wid: 0,
            done: ctx.now() + self.latency,
        };
        if !self.pipe.push(ctx, request, 0) {
            return false;
        }
        if ctx.committing() {
            let mut stats = self.stats.borrow_mut();
            stats.nreads += 1;
            stats.nread_bytes += self.line_size as u64;
        }
        true
    }

    pub fn write(&self, ctx: &mut SimCtx, addr: MemAddr, data: &MemData, wid: WClientId) -> bool {
        let request = Request {
            write: true,
            address: addr,
            data: data.clone(),
            wid,
            done: ctx.now() + self.latency,
        };
        if !self.pipe.push(ctx, request, 0) {
            return false;
        }
        if ctx.committing() {
            // Other clients observe the write immediately (snoop).
            for (i, entry) in self.clients.borrow().iter().enumerate() {
                if i == self.client {
                    continue;
                }
                if let Some(cb) = &entry.callback {
                    cb.borrow_mut().on_memory_snooped(addr, &data.data, &data.mask);
                }
            }
            let mut stats = self.stats.borrow_mut();
            stats.nwrites += 1;
            stats.nwrite_bytes += self.line_size as u64;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::test_utils::{attach_client, pattern, test_config, Harness, Op, Shim, LINE};

    fn harness(clients: usize) -> Harness<ParallelMemory> {
        let cfg = test_config(&[]);
        let mut sim = crate::kernel::Simulation::new();
        let clock = sim.ctx.create_clock("mem", 1);
        let mut mem = ParallelMemory::new(&mut sim.ctx, clock, &cfg).unwrap();
        let comp = mem.component_id();
        let clients = (0..clients)
            .map(|i| attach_client(&mut sim, &mut mem, clock, i))
            .collect();
        mem.initialize(&mut sim.ctx).unwrap();
        let mem = Rc::new(RefCell::new(mem));
        sim.install(comp, Box::new(Shim::new("pmem", mem.clone())));
        Harness { sim, mem, clients }
    }

    #[test]
    fn read_completes_after_the_configured_latency() {
        let mut h = harness(1);
        h.preload(0x100 * LINE as u64, &pattern(9));
        h.clients[0].push(Op::Read(0x100 * LINE as u64));
        // BaseRequestTime 2 + TimePerLine 2: nothing can be back yet.
        h.sim.run_for(2).unwrap();
        assert!(h.clients[0].state.borrow().reads.is_empty());
        h.clients[0].push(Op::WaitReads(1));
        h.run_scripts(100);
        assert_eq!(
            h.clients[0].state.borrow().last_read(0x100 * LINE as u64).unwrap(),
            &pattern(9)[..]
        );
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut h = harness(1);
        let addr = 8 * LINE as u64;
        h.clients[0].push(Op::Write(addr, 0, vec![0x42; 16]));
        h.clients[0].push(Op::WaitWrites(1));
        h.clients[0].push(Op::Read(addr));
        h.clients[0].push(Op::WaitReads(1));
        h.run_scripts(200);
        let state = h.clients[0].state.borrow();
        assert_eq!(&state.last_read(addr).unwrap()[..16], &[0x42; 16]);
        assert_eq!(state.write_acks.len(), 1);
    }

    #[test]
    fn clients_do_not_contend() {
        let mut h = harness(3);
        for (i, c) in h.clients.iter().enumerate() {
            c.push(Op::Read(i as u64 * LINE as u64));
            c.push(Op::WaitReads(1));
        }
        h.run_scripts(100);
        for c in &h.clients {
            assert_eq!(c.state.borrow().reads.len(), 1);
        }
    }

    #[test]
    fn writes_are_snooped_by_other_clients() {
        let mut h = harness(2);
        h.clients[0].push(Op::Write(0, 0, vec![7; 8]));
        h.clients[0].push(Op::WaitWrites(1));
        h.run_scripts(100);
        let snoops = &h.clients[1].state.borrow().snoops;
        assert_eq!(snoops.len(), 1);
        assert_eq!(&snoops[0].1[..8], &[7; 8]);
        assert!(h.clients[0].state.borrow().snoops.is_empty());
    }
}
