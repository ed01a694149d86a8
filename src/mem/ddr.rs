/*!
DDR channel timing model and the DDR-backed memory.

A channel keeps one open row per bank. A request to the open row pays the
CAS latency only; a conflicting row pays precharge + activate first. Data
transfers serialize on the channel's data bus, so back-to-back requests
pipeline behind each other's burst. Completed reads surface through a
pipeline buffer the owning component polls; writes complete silently after
their slot is accounted.

`DdrMemory` exposes the same client interface as the other backends: N
interfaces selected by line address, each fronting one channel.
*/

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{Config, ConfigError};
use crate::kernel::{
    BufferHandle, ClockId, Component, ComponentId, CycleNo, Discipline, ProcessId, SampleSink,
    ServiceId, SimCtx, StepResult,
};
use crate::mem::parallel::MemStats;
use crate::mem::selector::BankSelector;
use crate::mem::store::SparseMemory;
use crate::mem::{
    ClientCallback, ClientEntry, MemAddr, MemData, Memory, MemoryPort, Mcid, WClientId,
};

#[derive(Debug, Clone)]
pub struct DdrTiming {
    /// Activate-to-read, precharge and CAS latencies, in channel cycles.
    pub t_rcd: CycleNo,
    pub t_rp: CycleNo,
    pub t_cl: CycleNo,
    /// Write recovery before a precharge may follow a write.
    pub t_wr: CycleNo,
    /// Transfers per burst; two transfers complete per cycle.
    pub burst_length: u64,
    pub column_bits: u32,
    pub banks: usize,
    pub ranks: usize,
    /// Refresh interval; 0 disables refresh. Each refresh holds the
    /// channel for `t_rfc`.
    pub t_refi: CycleNo,
    pub t_rfc: CycleNo,
}

impl DdrTiming {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Ok(DdrTiming {
            t_rcd: cfg.get_or("DDR_tRCD", 5u64)?,
            t_rp: cfg.get_or("DDR_tRP", 5u64)?,
            t_cl: cfg.get_or("DDR_tCL", 5u64)?,
            t_wr: cfg.get_or("DDR_tWR", 4u64)?,
            burst_length: cfg.get_or("DDR_BurstLength", 8u64)?,
            column_bits: cfg.get_or("DDR_ColumnBits", 10u32)?,
            banks: cfg.get_or("DDR_Banks", 8usize)?,
            ranks: cfg.get_or("DDR_Ranks", 2usize)?,
            t_refi: cfg.get_or("DDR_tREFI", 0u64)?,
            t_rfc: cfg.get_or("DDR_tRFC", 20u64)?,
        })
    }

    fn burst_cycles(&self) -> CycleNo {
        self.burst_length.div_ceil(2)
    }

    fn rows(&self) -> usize {
        self.banks * self.ranks
    }
}

#[derive(Debug, Clone)]
pub struct DdrRequest {
    pub write: bool,
    pub address: MemAddr,
}

#[derive(Debug, Clone)]
struct DdrDone {
    address: MemAddr,
    done: CycleNo,
}

/// One DDR channel: request queue in, completed reads out.
pub(crate) struct DdrChannel {
    requests: BufferHandle<DdrRequest>,
    pipeline: BufferHandle<DdrDone>,
    open_rows: Vec<Option<u64>>,
    data_bus_free: CycleNo,
    last_refresh: CycleNo,
    timing: DdrTiming,
    pub nreads: u64,
    pub nwrites: u64,
}

impl DdrChannel {
    pub fn new(ctx: &mut SimCtx, name: &str, clock: ClockId, timing: DdrTiming, depth: usize) -> Self {
        let requests =
            ctx.create_buffer::<DdrRequest>(&format!("{name}.b_requests"), clock, depth, 1);
        let pipeline =
            ctx.create_buffer::<DdrDone>(&format!("{name}.b_pipeline"), clock, depth, 1);
        let rows = timing.rows();
        DdrChannel {
            requests,
            pipeline,
            open_rows: vec![None; rows],
            data_bus_free: 0,
            last_refresh: 0,
            timing,
            nreads: 0,
            nwrites: 0,
        }
    }

    pub fn requests_storage(&self) -> crate::kernel::StorageId {
        self.requests.storage_id()
    }

    pub fn pipeline_storage(&self) -> crate::kernel::StorageId {
        self.pipeline.storage_id()
    }

    /// Queue a request. Back-pressured when the channel queue is full.
    pub fn try_request(&self, ctx: &mut SimCtx, request: DdrRequest) -> bool {
        self.requests.push(ctx, request, 0)
    }

    /// The channel's own process: assign timing to the front request.
    pub fn step_requests(&mut self, ctx: &mut SimCtx) -> StepResult {
        let request = self.requests.front(ctx);
        if !request.write && !self.pipeline.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            // Periodic refresh closes every row and holds the channel.
            if self.timing.t_refi > 0 && ctx.now() >= self.last_refresh + self.timing.t_refi {
                self.last_refresh = ctx.now();
                self.open_rows.fill(None);
                self.data_bus_free = self.data_bus_free.max(ctx.now() + self.timing.t_rfc);
            }
            let bank = ((request.address >> self.timing.column_bits)
                % self.timing.rows() as u64) as usize;
            let row = request.address
                >> (self.timing.column_bits + self.timing.rows().ilog2());
            let access = match self.open_rows[bank] {
                Some(open) if open == row => self.timing.t_cl,
                Some(_) => self.timing.t_rp + self.timing.t_rcd + self.timing.t_cl,
                None => self.timing.t_rcd + self.timing.t_cl,
            };
            self.open_rows[bank] = Some(row);
            let ready = (ctx.now() + access).max(self.data_bus_free);
            let done = ready + self.timing.burst_cycles();
            // Writes keep the bank busy through the recovery window.
            self.data_bus_free = if request.write {
                done + self.timing.t_wr
            } else {
                done
            };
            if request.write {
                self.nwrites += 1;
            } else {
                self.nreads += 1;
                self.pipeline.push(
                    ctx,
                    DdrDone {
                        address: request.address,
                        done,
                    },
                    0,
                );
            }
        }
        self.requests.pop(ctx);
        StepResult::Success
    }

    /// The front completed read, once its time has come.
    pub fn read_done(&self, ctx: &SimCtx) -> Option<MemAddr> {
        if self.pipeline.is_empty(ctx) {
            return None;
        }
        let front = self.pipeline.front(ctx);
        (ctx.now() >= front.done).then_some(front.address)
    }

    pub fn pop_done(&self, ctx: &mut SimCtx) {
        self.pipeline.pop(ctx);
    }

    pub fn pipeline_pending(&self, ctx: &SimCtx) -> bool {
        !self.pipeline.is_empty(ctx)
    }
}

/// The set of channels serving one memory system, indexed by channel id.
pub(crate) struct DdrChannelRegistry {
    pub channels: Vec<DdrChannel>,
}

impl DdrChannelRegistry {
    pub fn new(
        ctx: &mut SimCtx,
        name: &str,
        clock: ClockId,
        cfg: &Config,
        count: usize,
    ) -> Result<Self, ConfigError> {
        let timing = DdrTiming::from_config(cfg)?;
        let depth = cfg.get_or("ExternalOutputQueueSize", 4usize)?;
        let channels = (0..count)
            .map(|i| DdrChannel::new(ctx, &format!("{name}.channel{i}"), clock, timing.clone(), depth))
            .collect();
        Ok(DdrChannelRegistry { channels })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

// ---------------------------------------------------------------------------
// DDR-backed flat memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct IfRequest {
    write: bool,
    address: MemAddr,
    data: MemData,
    client: usize,
    wid: WClientId,
}

struct Interface {
    requests: BufferHandle<IfRequest>,
    responses: BufferHandle<IfRequest>,
    /// Reads currently inside the DDR channel, oldest first.
    active: std::collections::VecDeque<IfRequest>,
    p_service: ServiceId,
}

pub struct DdrMemory {
    comp: ComponentId,
    line_size: usize,
    ifs: Vec<Interface>,
    ddr: DdrChannelRegistry,
    shared: Rc<DdrShared>,
    clients: Rc<RefCell<Vec<ClientEntry>>>,
    client_services: Vec<ServiceId>,
    response_pids: Vec<ProcessId>,
    store: Rc<RefCell<SparseMemory>>,
    stats: Rc<RefCell<MemStats>>,
}

pub(crate) struct DdrShared {
    pub line_size: usize,
    selector: BankSelector,
    ifs: Vec<(BufferHandle<IfRequest>, ServiceId)>,
}

const P_REQUESTS: usize = 0;
const P_CHANNEL: usize = 1;
const P_DONE: usize = 2;
const P_RESPONSES: usize = 3;
const PROCS_PER_IF: usize = 4;

impl DdrMemory {
    pub fn new(ctx: &mut SimCtx, clock: ClockId, cfg: &Config) -> Result<Self, ConfigError> {
        let comp = ctx.allocate_component("ddrmem");
        let line_size = cfg.get_power_of_two("CacheLineSize")? as usize;
        let num_ifs: usize = cfg.get("NumInterfaces")?;
        let in_depth = cfg.get_or("ExternalInputQueueSize", 4usize)?;
        let out_depth = cfg.get_or("ExternalOutputQueueSize", 4usize)?;
        let selector_name: String = cfg.get_or("InterfaceSelector", "DIRECT".to_string())?;
        let selector = BankSelector::from_name(&selector_name, num_ifs)?;
        let ddr = DdrChannelRegistry::new(ctx, "ddrmem", clock, cfg, num_ifs)?;

        let mut ifs = Vec::with_capacity(num_ifs);
        let mut shared_ifs = Vec::with_capacity(num_ifs);
        let mut response_pids = Vec::new();
        for i in 0..num_ifs {
            let requests = ctx.create_buffer::<IfRequest>(
                &format!("ddrmem.extif{i}.b_requests"),
                clock,
                out_depth,
                1,
            );
            let responses = ctx.create_buffer::<IfRequest>(
                &format!("ddrmem.extif{i}.b_responses"),
                clock,
                in_depth,
                1,
            );
            let p_service =
                ctx.create_service(&format!("ddrmem.extif{i}.p_service"), Discipline::Cyclic);
            let pid_req =
                ctx.register_process(comp, i * PROCS_PER_IF + P_REQUESTS, "requests", clock);
            let pid_chan =
                ctx.register_process(comp, i * PROCS_PER_IF + P_CHANNEL, "channel", clock);
            let pid_done = ctx.register_process(comp, i * PROCS_PER_IF + P_DONE, "done", clock);
            let pid_resp =
                ctx.register_process(comp, i * PROCS_PER_IF + P_RESPONSES, "responses", clock);
            ctx.sensitive(requests.storage_id(), pid_req);
            ctx.sensitive(responses.storage_id(), pid_resp);
            ctx.sensitive(ddr.channels[i].requests_storage(), pid_chan);
            ctx.sensitive(ddr.channels[i].pipeline_storage(), pid_done);
            ctx.add_trace(pid_req, ddr.channels[i].requests_storage());
            ctx.add_trace(pid_done, responses.storage_id());
            response_pids.push(pid_resp);
            ifs.push(Interface {
                requests,
                responses,
                active: std::collections::VecDeque::new(),
                p_service,
            });
            shared_ifs.push((requests, p_service));
        }

        Ok(DdrMemory {
            comp,
            line_size,
            ifs,
            ddr,
            shared: Rc::new(DdrShared {
                line_size,
                selector,
                ifs: shared_ifs,
            }),
            clients: Rc::new(RefCell::new(Vec::new())),
            client_services: Vec::new(),
            response_pids,
            store: Rc::new(RefCell::new(SparseMemory::new())),
            stats: Rc::new(RefCell::new(MemStats::default())),
        })
    }

    pub fn component_id(&self) -> ComponentId {
        self.comp
    }

    fn step_if_requests(&mut self, i: usize, ctx: &mut SimCtx) -> StepResult {
        let request = self.ifs[i].requests.front(ctx);
        if !self.ddr.channels[i].try_request(
            ctx,
            DdrRequest {
                write: request.write,
                address: request.address,
            },
        ) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            if request.write {
                self.store.borrow_mut().write(
                    request.address,
                    &request.data.data,
                    Some(&request.data.mask),
                );
                let callback = self.clients.borrow()[request.client]
                    .callback
                    .clone()
                    .expect("client unregistered with requests in flight");
                callback.borrow_mut().on_memory_write_completed(request.wid);
            } else {
                self.ifs[i].active.push_back(request.clone());
            }
        }
        self.ifs[i].requests.pop(ctx);
        StepResult::Success
    }

    fn step_if_done(&mut self, i: usize, ctx: &mut SimCtx) -> StepResult {
        let Some(_) = self.ddr.channels[i].read_done(ctx) else {
            return StepResult::Delayed;
        };
        if !self.ifs[i].responses.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let mut request = self.ifs[i]
                .active
                .pop_front()
                .expect("read completion without an active request");
            self.store
                .borrow()
                .read(request.address, &mut request.data.data);
            request.data.mask.fill(true);
            self.ifs[i].responses.push(ctx, request, 0);
        }
        self.ddr.channels[i].pop_done(ctx);
        StepResult::Success
    }

    fn step_if_responses(&mut self, i: usize, ctx: &mut SimCtx) -> StepResult {
        let request = self.ifs[i].responses.front(ctx);
        if !self.client_services[request.client].invoke(ctx) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let callback = self.clients.borrow()[request.client]
                .callback
                .clone()
                .expect("client unregistered with requests in flight");
            if !callback
                .borrow_mut()
                .on_memory_read_completed(request.address, &request.data.data)
            {
                return StepResult::Failed;
            }
        }
        self.ifs[i].responses.pop(ctx);
        StepResult::Success
    }
}

impl Memory for DdrMemory {
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
                ctx.create_service(&format!("ddrmem.client{id}.p_deliver"), Discipline::Priority);
            for (i, interface) in self.ifs.iter().enumerate() {
                ctx.service_add(service, self.response_pids[i]);
                ctx.service_add_cyclic(interface.p_service, process);
                ctx.add_trace(process, interface.requests.storage_id());
            }
            self.client_services.push(service);
            id
        };
        let port = DdrPort {
            line_size: self.line_size,
            client: id,
            shared: self.shared.clone(),
            clients: self.clients.clone(),
            stats: self.stats.clone(),
        };
        Ok((id, MemoryPort::Ddr(port)))
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
            external_reads: self.ddr.channels.iter().map(|c| c.nreads).sum(),
            external_writes: self.ddr.channels.iter().map(|c| c.nwrites).sum(),
        }
    }

    fn dump(&self, ctx: &SimCtx) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for (i, interface) in self.ifs.iter().enumerate() {
            let _ = writeln!(
                out,
                "extif{i}: {} queued, {} active, {} responses",
                interface.requests.len(ctx),
                interface.active.len(),
                interface.responses.len(ctx)
            );
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

impl Component for DdrMemory {
    fn name(&self) -> &str {
        "ddrmem"
    }

    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        let i = local / PROCS_PER_IF;
        match local % PROCS_PER_IF {
            P_REQUESTS => self.step_if_requests(i, ctx),
            P_CHANNEL => self.ddr.channels[i].step_requests(ctx),
            P_DONE => self.step_if_done(i, ctx),
            P_RESPONSES => self.step_if_responses(i, ctx),
            _ => unreachable!(),
        }
    }

    fn sample_state(&self, sink: &mut SampleSink) {
        let stats = self.stats.borrow();
        sink.record("ddrmem.nreads", stats.nreads);
        sink.record("ddrmem.nwrites", stats.nwrites);
        for (i, channel) in self.ddr.channels.iter().enumerate() {
            sink.record(&format!("ddrmem.channel{i}.nreads"), channel.nreads);
            sink.record(&format!("ddrmem.channel{i}.nwrites"), channel.nwrites);
        }
    }
}

/// Client handle for the DDR memory.
#[derive(Clone)]
pub struct DdrPort {
    pub(crate) line_size: usize,
    client: usize,
    shared: Rc<DdrShared>,
    clients: Rc<RefCell<Vec<ClientEntry>>>,
    stats: Rc<RefCell<MemStats>>,
}

impl DdrPort {
    fn enqueue(&self, ctx: &mut SimCtx, request: IfRequest) -> bool {
        let (_, index) = self
            .shared
            .selector
            .map(request.address / self.line_size as u64);
        let (requests, service) = self.shared.ifs[index];
        if !service.invoke(ctx) {
            return false;
        }
        requests.push(ctx, request, 0)
    }

    pub fn read(&self, ctx: &mut SimCtx, addr: MemAddr) -> bool {
        let ok = self.enqueue(
            ctx,
            IfRequest {
                write: false,
                address: addr,
                data: MemData::new(self.line_size),
                client: self.client,
                wid: 0,
            },
        );
        if ok && ctx.committing() {
            let mut stats = self.stats.borrow_mut();
            stats.nreads += 1;
            stats.nread_bytes += self.line_size as u64;
        }
        ok
    }

    pub fn write(&self, ctx: &mut SimCtx, addr: MemAddr, data: &MemData, wid: WClientId) -> bool {
        let ok = self.enqueue(
            ctx,
            IfRequest {
                write: true,
                address: addr,
                data: data.clone(),
                client: self.client,
                wid,
            },
        );
        if ok && ctx.committing() {
            for entry in self.clients.borrow().iter() {
                if let Some(cb) = &entry.callback {
                    cb.borrow_mut().on_memory_snooped(addr, &data.data, &data.mask);
                }
            }
            let mut stats = self.stats.borrow_mut();
            stats.nwrites += 1;
            stats.nwrite_bytes += self.line_size as u64;
        }
        ok
    }
}
