/*!
Banked memory: a switched network between P clients and N banks.

The configured bank selector maps each line address to a bank; every bank
serializes its requests through an incoming queue, a single processing slot
and an outgoing queue. The network between clients and banks is modeled as
a head delay of `log2(N)` cycles plus one cycle per line of payload and one
for the header; consecutive messages to the same bank pipeline behind each
other instead of paying the head delay again.

Each client owns a delivery service arbitrating the banks' outgoing
processes, so at most one bank completes towards a given client per cycle.
*/

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{Config, ConfigError};
use crate::kernel::{
    BufferHandle, ClockId, Component, ComponentId, CycleNo, Discipline, FlagHandle, ProcessId,
    SampleSink, ServiceId, SimCtx, StepResult,
};
use crate::mem::parallel::MemStats;
use crate::mem::selector::BankSelector;
use crate::mem::store::SparseMemory;
use crate::mem::{
    ClientCallback, ClientEntry, MemAddr, MemData, Memory, MemoryPort, Mcid, WClientId,
};

#[derive(Debug, Clone)]
struct Request {
    write: bool,
    address: MemAddr,
    data: MemData,
    client: usize,
    wid: WClientId,
    done: CycleNo,
}

struct Bank {
    incoming: BufferHandle<Request>,
    outgoing: BufferHandle<Request>,
    busy: FlagHandle,
    request: Option<Request>,
    p_incoming: ServiceId,
    p_outgoing_pid: ProcessId,
}

/// Shared routing state captured by every client port.
pub(crate) struct BankedShared {
    pub line_size: usize,
    selector: BankSelector,
    head_delay: CycleNo,
    banks: Vec<(BufferHandle<Request>, ServiceId)>,
}

pub struct BankedMemory {
    comp: ComponentId,
    clock: ClockId,
    line_size: usize,
    base_time: CycleNo,
    time_per_line: CycleNo,
    banks: Vec<Bank>,
    shared: Rc<BankedShared>,
    clients: Rc<RefCell<Vec<ClientEntry>>>,
    client_services: Vec<ServiceId>,
    store: Rc<RefCell<SparseMemory>>,
    stats: Rc<RefCell<MemStats>>,
}

const P_INCOMING: usize = 0;
const P_OUTGOING: usize = 1;
const P_BANK: usize = 2;
const PROCS_PER_BANK: usize = 3;

impl BankedMemory {
    pub fn new(ctx: &mut SimCtx, clock: ClockId, cfg: &Config) -> Result<Self, ConfigError> {
        let comp = ctx.allocate_component("bmem");
        let line_size = cfg.get_power_of_two("CacheLineSize")? as usize;
        let num_banks: usize = cfg.get("NumBanks")?;
        let buffer_size: usize = cfg.get("BufferSize")?;
        let selector_name: String = cfg.get_or("BankSelector", "DIRECT".to_string())?;
        let selector = BankSelector::from_name(&selector_name, num_banks)?;
        log::info!("bmem: {num_banks} banks, mapping: {}", selector.name());

        let mut banks = Vec::with_capacity(num_banks);
        let mut shared_banks = Vec::with_capacity(num_banks);
        for i in 0..num_banks {
            let incoming = ctx.create_buffer::<Request>(
                &format!("bmem.bank{i}.b_incoming"),
                clock,
                buffer_size,
                1,
            );
            let outgoing = ctx.create_buffer::<Request>(
                &format!("bmem.bank{i}.b_outgoing"),
                clock,
                buffer_size,
                1,
            );
            let busy = ctx.create_flag(&format!("bmem.bank{i}.f_busy"), clock, false);
            let p_incoming =
                ctx.create_service(&format!("bmem.bank{i}.p_incoming"), Discipline::Cyclic);
            let pid_in =
                ctx.register_process(comp, i * PROCS_PER_BANK + P_INCOMING, "incoming", clock);
            let pid_out =
                ctx.register_process(comp, i * PROCS_PER_BANK + P_OUTGOING, "outgoing", clock);
            let pid_bank = ctx.register_process(comp, i * PROCS_PER_BANK + P_BANK, "bank", clock);
            ctx.sensitive(incoming.storage_id(), pid_in);
            ctx.sensitive(outgoing.storage_id(), pid_out);
            ctx.sensitive(busy.storage_id(), pid_bank);
            ctx.add_trace(pid_in, busy.storage_id());
            ctx.add_trace(pid_bank, outgoing.storage_id());
            banks.push(Bank {
                incoming,
                outgoing,
                busy,
                request: None,
                p_incoming,
                p_outgoing_pid: pid_out,
            });
            shared_banks.push((incoming, p_incoming));
        }

        let head_delay = if num_banks > 1 {
            (usize::BITS - 1 - num_banks.leading_zeros()) as CycleNo
        } else {
            0
        };

        Ok(BankedMemory {
            comp,
            clock,
            line_size,
            base_time: cfg.get("BaseRequestTime")?,
            time_per_line: cfg.get("TimePerLine")?,
            banks,
            shared: Rc::new(BankedShared {
                line_size,
                selector,
                head_delay,
                banks: shared_banks,
            }),
            clients: Rc::new(RefCell::new(Vec::new())),
            client_services: Vec::new(),
            store: Rc::new(RefCell::new(SparseMemory::new())),
            stats: Rc::new(RefCell::new(MemStats::default())),
        })
    }

    pub fn component_id(&self) -> ComponentId {
        self.comp
    }

    /// Time for a bank to process one arrived request.
    fn memory_delay(&self, size: usize) -> CycleNo {
        self.base_time + self.time_per_line * ((size + self.line_size - 1) / self.line_size) as u64
    }

    fn step_incoming(&mut self, bank: usize, ctx: &mut SimCtx) -> StepResult {
        let request = self.banks[bank].incoming.front(ctx);
        if ctx.now() < request.done {
            return StepResult::Delayed;
        }
        if self.banks[bank].busy.is_set(ctx) {
            return StepResult::Failed;
        }
        let delay = self.memory_delay(self.line_size);
        if ctx.committing() {
            let mut r = request;
            r.done = ctx.now() + delay;
            self.banks[bank].request = Some(r);
        }
        self.banks[bank].busy.set(ctx);
        self.banks[bank].incoming.pop(ctx);
        StepResult::Success
    }

    fn step_bank(&mut self, bank: usize, ctx: &mut SimCtx) -> StepResult {
        let Some(request) = self.banks[bank].request.clone() else {
            return StepResult::Delayed;
        };
        if ctx.now() < request.done {
            return StepResult::Delayed;
        }
        if !self.banks[bank].outgoing.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let mut out = request.clone();
            if request.write {
                self.store.borrow_mut().write(
                    request.address,
                    &request.data.data,
                    Some(&request.data.mask),
                );
            } else {
                self.store
                    .borrow()
                    .read(request.address, &mut out.data.data);
                out.data.mask.fill(true);
            }
            let body = if request.write { 0 } else { self.line_size };
            out.done = network_done(
                ctx.now(),
                self.shared.head_delay,
                self.line_size,
                body,
                tail_done(ctx, self.banks[bank].outgoing),
            );
            self.banks[bank].outgoing.push(ctx, out, 0);
            self.banks[bank].request = None;
        }
        self.banks[bank].busy.clear(ctx);
        StepResult::Success
    }

    fn step_outgoing(&mut self, bank: usize, ctx: &mut SimCtx) -> StepResult {
        let request = self.banks[bank].outgoing.front(ctx);
        if ctx.now() < request.done {
            return StepResult::Delayed;
        }
        if !self.client_services[request.client].invoke(ctx) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let callback = self.clients.borrow()[request.client]
                .callback
                .clone()
                .expect("client unregistered with requests in flight");
            let delivered = if request.write {
                callback.borrow_mut().on_memory_write_completed(request.wid)
            } else {
                callback
                    .borrow_mut()
                    .on_memory_read_completed(request.address, &request.data.data)
            };
            if !delivered {
                return StepResult::Failed;
            }
        }
        self.banks[bank].outgoing.pop(ctx);
        StepResult::Success
    }
}

/// Arrival time of a message entering a pipelined network queue: pay the
/// head delay, skip it when pipelining behind the queue tail, then pay one
/// cycle per line of body plus one for the header.
fn network_done(
    now: CycleNo,
    head_delay: CycleNo,
    line_size: usize,
    body: usize,
    tail: Option<CycleNo>,
) -> CycleNo {
    let mut done = now + head_delay;
    if let Some(t) = tail {
        if done < t {
            done = t;
        }
    }
    done + ((body + line_size - 1) / line_size) as u64 + 1
}

fn tail_done(ctx: &SimCtx, buf: BufferHandle<Request>) -> Option<CycleNo> {
    buf.iter_snapshot(ctx).last().map(|r| r.done)
}

impl Memory for BankedMemory {
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
            let service =
                ctx.create_service(&format!("bmem.client{id}.p_deliver"), Discipline::Priority);
            for bank in &self.banks {
                ctx.service_add(service, bank.p_outgoing_pid);
                ctx.service_add_cyclic(bank.p_incoming, process);
                ctx.add_trace(process, bank.incoming.storage_id());
            }
            self.client_services.push(service);
            id
        };
        let port = BankedPort {
            line_size: self.line_size,
            client: id,
            shared: self.shared.clone(),
            clients: self.clients.clone(),
            stats: self.stats.clone(),
        };
        Ok((id, MemoryPort::Banked(port)))
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
            external_reads: stats.nreads,
            external_writes: stats.nwrites,
        }
    }

    fn dump(&self, ctx: &SimCtx) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, bank) in self.banks.iter().enumerate() {
            let _ = writeln!(out, "bank{i}:");
            for r in bank.incoming.iter_snapshot(ctx) {
                let _ = writeln!(out, "  > {:#018x} | done {}", r.address, r.done);
            }
            match &bank.request {
                Some(r) => {
                    let _ = writeln!(out, "  * {:#018x} | done {}", r.address, r.done);
                }
                None => {
                    let _ = writeln!(out, "  * idle");
                }
            }
            for r in bank.outgoing.iter_snapshot(ctx) {
                let _ = writeln!(out, "  < {:#018x} | done {}", r.address, r.done);
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

impl Component for BankedMemory {
    fn name(&self) -> &str {
        "bmem"
    }

    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        let bank = local / PROCS_PER_BANK;
        match local % PROCS_PER_BANK {
            P_INCOMING => self.step_incoming(bank, ctx),
            P_OUTGOING => self.step_outgoing(bank, ctx),
            P_BANK => self.step_bank(bank, ctx),
            _ => unreachable!(),
        }
    }

    fn sample_state(&self, sink: &mut SampleSink) {
        let stats = self.stats.borrow();
        sink.record("bmem.nreads", stats.nreads);
        sink.record("bmem.nwrites", stats.nwrites);
        sink.record("bmem.nread_bytes", stats.nread_bytes);
        sink.record("bmem.nwrite_bytes", stats.nwrite_bytes);
    }
}

/// Client handle for the banked memory.
#[derive(Clone)]
pub struct BankedPort {
    pub(crate) line_size: usize,
    client: usize,
    shared: Rc<BankedShared>,
    clients: Rc<RefCell<Vec<ClientEntry>>>,
    stats: Rc<RefCell<MemStats>>,
}

impl BankedPort {
    fn enqueue(&self, ctx: &mut SimCtx, request: Request) -> bool {
        let (_, bank_index) = self
            .shared
            .selector
            .map(request.address / self.line_size as u64);
        let (incoming, service) = self.shared.banks[bank_index];
        if !service.invoke(ctx) {
            return false;
        }
        if !incoming.can_push(ctx, 0) {
            return false;
        }
        if ctx.committing() {
            let mut r = request;
            let body = if r.write { self.line_size } else { 0 };
            r.done = network_done(
                ctx.now(),
                self.shared.head_delay,
                self.line_size,
                body,
                tail_done(ctx, incoming),
            );
            incoming.push(ctx, r, 0);
        }
        true
    }

    pub fn read(&self, ctx: &mut SimCtx, addr: MemAddr) -> bool {
        let request = Request {
            write: false,
            address: addr,
            data: MemData::new(self.line_size),
            client: self.client,
            wid: 0,
            done: 0,
        };
        if !self.enqueue(ctx, request) {
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
            client: self.client,
            wid,
            done: 0,
        };
        if !self.enqueue(ctx, request) {
            return false;
        }
        if ctx.committing() {
            // Broadcast the write to every client's snoop hook.
            for entry in self.clients.borrow().iter() {
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
    use crate::test_utils::{attach_client, pattern, test_config, Harness, Op, LINE, Shim};

    fn harness(clients: usize, overrides: &[(&str, &str)]) -> Harness<BankedMemory> {
        let cfg = test_config(overrides);
        let mut sim = crate::kernel::Simulation::new();
        let clock = sim.ctx.create_clock("mem", 1);
        let mut mem = BankedMemory::new(&mut sim.ctx, clock, &cfg).unwrap();
        let comp = mem.component_id();
        let clients = (0..clients)
            .map(|i| attach_client(&mut sim, &mut mem, clock, i))
            .collect();
        mem.initialize(&mut sim.ctx).unwrap();
        let mem = Rc::new(RefCell::new(mem));
        sim.install(comp, Box::new(Shim::new("bmem", mem.clone())));
        Harness { sim, mem, clients }
    }

    #[test]
    fn round_trip_through_a_bank() {
        let mut h = harness(1, &[]);
        let addr = 5 * LINE as u64;
        h.clients[0].push(Op::Write(addr, 0, vec![0x31; 8]));
        h.clients[0].push(Op::WaitWrites(1));
        h.clients[0].push(Op::Read(addr));
        h.clients[0].push(Op::WaitReads(1));
        h.run_scripts(500);
        let state = h.clients[0].state.borrow();
        assert_eq!(&state.last_read(addr).unwrap()[..8], &[0x31; 8]);
    }

    #[test]
    fn requests_spread_across_banks_and_serialize_within_one() {
        let mut h = harness(2, &[("NumBanks", "2"), ("BankSelector", "DIRECT")]);
        for l in 0..4u64 {
            h.preload(l * LINE as u64, &pattern(l as u8));
        }
        // Lines 0 and 2 hit bank 0; lines 1 and 3 hit bank 1.
        h.clients[0].push(Op::Read(0));
        h.clients[0].push(Op::Read(2 * LINE as u64));
        h.clients[1].push(Op::Read(LINE as u64));
        h.clients[1].push(Op::Read(3 * LINE as u64));
        h.clients[0].push(Op::WaitReads(2));
        h.clients[1].push(Op::WaitReads(2));
        h.run_scripts(500);
        for (c, lines) in [(0usize, [0u64, 2]), (1, [1, 3])] {
            let state = h.clients[c].state.borrow();
            for l in lines {
                assert_eq!(
                    state.last_read(l * LINE as u64).unwrap(),
                    &pattern(l as u8)[..]
                );
            }
        }
    }

    #[test]
    fn single_bank_with_zero_selector_still_serves_everyone() {
        let mut h = harness(2, &[("NumBanks", "1"), ("BankSelector", "ZERO")]);
        h.preload(0, &pattern(3));
        h.preload(LINE as u64, &pattern(4));
        h.clients[0].push(Op::Read(0));
        h.clients[1].push(Op::Read(LINE as u64));
        h.clients[0].push(Op::WaitReads(1));
        h.clients[1].push(Op::WaitReads(1));
        h.run_scripts(500);
        assert_eq!(h.clients[0].state.borrow().reads.len(), 1);
        assert_eq!(h.clients[1].state.borrow().reads.len(), 1);
    }

    #[test]
    fn write_snoop_reaches_every_client() {
        let mut h = harness(2, &[]);
        h.clients[0].push(Op::Write(0, 4, vec![9; 4]));
        h.clients[0].push(Op::WaitWrites(1));
        h.run_scripts(500);
        // The banked bus snoops every port, including the writer's.
        assert_eq!(h.clients[0].state.borrow().snoops.len(), 1);
        assert_eq!(h.clients[1].state.borrow().snoops.len(), 1);
    }
}
