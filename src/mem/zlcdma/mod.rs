/*!
The token-priority COMA hierarchy.

Same two-level ring construction as the plain token hierarchy, different
engine: reads are served with single-token donations or whole-line
migration, writes gather all tokens with `AcquireTokens`, racing writers
settle on the priority token, and directories account permanent tokens
with notification repair. Cache injection (optional) absorbs passing
evictions into free ways to keep data on chip.
*/

pub mod cache;
pub mod directory;
pub mod message;
pub mod root;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::config::{Config, ConfigError};
use crate::kernel::{
    BufferHandle, ClockId, Component, ComponentId, ProcessId, SampleSink, ServiceId, SimCtx,
    StepResult,
};
use crate::mem::ddr::DdrChannelRegistry;
use crate::mem::parallel::MemStats;
use crate::mem::ring::{MsgId, Slab};
use crate::mem::selector::BankSelector;
use crate::mem::store::SparseMemory;
use crate::mem::zlcdma::cache::{Cache, CacheProcessIds, LineState};
use crate::mem::zlcdma::directory::{Directory, DirectoryProcessIds};
use crate::mem::zlcdma::message::{BusRequest, Message};
use crate::mem::zlcdma::root::{RootDirectory, RootProcessIds};
use crate::mem::{
    ClientCallback, ClientEntry, MemAddr, MemData, Memory, MemoryPort, Mcid, WClientId,
};

#[derive(Debug, Clone, Copy)]
enum Proc {
    CacheRequests(usize),
    CacheIncoming(usize),
    CacheResponses(usize),
    CacheForward(usize),
    DirInBottom(usize),
    DirInTop(usize),
    DirFwdBottom(usize),
    DirFwdTop(usize),
    RootIncoming(usize),
    RootRequests(usize),
    RootChannel(usize),
    RootDdrDone(usize),
    RootResponses(usize),
    RootForward(usize),
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Cache(usize),
    DirBottom(usize),
    DirTop(usize),
    Root(usize),
}

pub struct ZlcdmaMemory {
    comp: ComponentId,
    clock: ClockId,
    line_size: usize,
    clients_per_cache: usize,
    caches_per_ring: usize,
    sets: usize,
    assoc: usize,
    buffer_size: usize,
    inject: bool,
    num_clients: usize,
    selector: Rc<BankSelector>,
    msgs: Rc<RefCell<Slab<Message>>>,
    caches: Vec<Cache>,
    dirs: Vec<Directory>,
    roots: Vec<RootDirectory>,
    procs: Vec<Proc>,
    client_map: Vec<(usize, usize)>,
    store: Rc<RefCell<SparseMemory>>,
    stats: Rc<RefCell<MemStats>>,
    initialized: bool,
}

impl ZlcdmaMemory {
    pub fn new(ctx: &mut SimCtx, clock: ClockId, cfg: &Config) -> Result<Self, ConfigError> {
        let comp = ctx.allocate_component("zlcdma");
        let line_size = cfg.get_power_of_two("CacheLineSize")? as usize;
        let sets: usize = cfg.get("L2CacheNumSets")?;
        let selector_name: String = cfg.get_or("BankSelector", "XORFOLD".to_string())?;
        let selector = Rc::new(BankSelector::from_name(&selector_name, sets)?);
        let num_roots = cfg.get_power_of_two("NumRootDirectories")? as usize;
        let buffer_size = cfg.get_or("NodeBufferSize", 2usize)?;

        let ddr = DdrChannelRegistry::new(ctx, "zlcdma.ddr", clock, cfg, num_roots)?;
        let mut memory = ZlcdmaMemory {
            comp,
            clock,
            line_size,
            clients_per_cache: cfg.get("NumClientsPerL2Cache")?,
            caches_per_ring: cfg.get("NumL2CachesPerRing")?,
            sets,
            assoc: cfg.get("L2CacheAssociativity")?,
            buffer_size,
            inject: cfg.get_or("EnableCacheInjection", false)?,
            num_clients: 0,
            selector,
            msgs: Rc::new(RefCell::new(Slab::new())),
            caches: Vec::new(),
            dirs: Vec::new(),
            roots: Vec::new(),
            procs: Vec::new(),
            client_map: Vec::new(),
            store: Rc::new(RefCell::new(SparseMemory::new())),
            stats: Rc::new(RefCell::new(MemStats::default())),
            initialized: false,
        };

        for (i, channel) in ddr.channels.into_iter().enumerate() {
            memory.add_root(ctx, i, num_roots, channel);
        }
        Ok(memory)
    }

    pub fn component_id(&self) -> ComponentId {
        self.comp
    }

    fn register(&mut self, ctx: &mut SimCtx, name: &str, proc: Proc) -> ProcessId {
        let local = self.procs.len();
        self.procs.push(proc);
        ctx.register_process(self.comp, local, name, self.clock)
    }

    fn add_root(
        &mut self,
        ctx: &mut SimCtx,
        id: usize,
        num_roots: usize,
        channel: crate::mem::ddr::DdrChannel,
    ) {
        let i = self.roots.len();
        let pids = RootProcessIds {
            incoming: self.register(ctx, &format!("rootdir{id}.incoming"), Proc::RootIncoming(i)),
            requests: self.register(ctx, &format!("rootdir{id}.requests"), Proc::RootRequests(i)),
            channel: self.register(ctx, &format!("rootdir{id}.channel"), Proc::RootChannel(i)),
            ddr_done: self.register(ctx, &format!("rootdir{id}.ddr-done"), Proc::RootDdrDone(i)),
            responses: self.register(
                ctx,
                &format!("rootdir{id}.responses"),
                Proc::RootResponses(i),
            ),
            forward: self.register(ctx, &format!("rootdir{id}.forward"), Proc::RootForward(i)),
        };
        let root = RootDirectory::new(
            ctx,
            &format!("zlcdma.rootdir{id}"),
            self.clock,
            1_000_000 + id,
            id,
            num_roots,
            self.line_size,
            self.buffer_size,
            channel,
            self.msgs.clone(),
            self.store.clone(),
            pids,
        );
        self.roots.push(root);
    }

    fn add_cache(&mut self, ctx: &mut SimCtx) {
        assert!(!self.initialized, "cache added after ring construction");
        if self.caches.len() % self.caches_per_ring == 0 {
            self.add_directory(ctx);
        }
        let id = self.caches.len();
        let pids = CacheProcessIds {
            requests: self.register(ctx, &format!("cache{id}.requests"), Proc::CacheRequests(id)),
            incoming: self.register(ctx, &format!("cache{id}.incoming"), Proc::CacheIncoming(id)),
            responses: self.register(
                ctx,
                &format!("cache{id}.responses"),
                Proc::CacheResponses(id),
            ),
            forward: self.register(ctx, &format!("cache{id}.forward"), Proc::CacheForward(id)),
        };
        let cache = Cache::new(
            ctx,
            &format!("zlcdma.cache{id}"),
            self.clock,
            id,
            self.sets,
            self.assoc,
            self.line_size,
            self.buffer_size,
            self.inject,
            self.selector.clone(),
            self.msgs.clone(),
            pids,
        );
        self.caches.push(cache);
    }

    fn add_directory(&mut self, ctx: &mut SimCtx) {
        let id = self.dirs.len();
        let pids = DirectoryProcessIds {
            in_bottom: self.register(ctx, &format!("dir{id}.bottom-incoming"), Proc::DirInBottom(id)),
            in_top: self.register(ctx, &format!("dir{id}.top-incoming"), Proc::DirInTop(id)),
            fwd_bottom: self.register(ctx, &format!("dir{id}.bottom-forward"), Proc::DirFwdBottom(id)),
            fwd_top: self.register(ctx, &format!("dir{id}.top-forward"), Proc::DirFwdTop(id)),
        };
        let dir = Directory::new(
            ctx,
            &format!("zlcdma.dir{id}"),
            self.clock,
            500_000 + 2 * id,
            500_000 + 2 * id + 1,
            self.sets,
            self.assoc * self.caches_per_ring,
            self.line_size,
            self.buffer_size,
            self.selector.clone(),
            self.msgs.clone(),
            pids,
        );
        self.dirs.push(dir);
    }

    fn incoming_of(&self, slot: Slot) -> BufferHandle<MsgId> {
        match slot {
            Slot::Cache(i) => self.caches[i].node.incoming,
            Slot::DirBottom(i) => self.dirs[i].bottom.incoming,
            Slot::DirTop(i) => self.dirs[i].top.incoming,
            Slot::Root(i) => self.roots[i].node.incoming,
        }
    }

    fn connect(&mut self, slot: Slot, next: BufferHandle<MsgId>) {
        match slot {
            Slot::Cache(i) => self.caches[i].node.connect(next),
            Slot::DirBottom(i) => self.dirs[i].bottom.connect(next),
            Slot::DirTop(i) => self.dirs[i].top.connect(next),
            Slot::Root(i) => self.roots[i].node.connect(next),
        }
    }

    fn wire_ring(&mut self, slots: &[Slot]) {
        let n = slots.len();
        for i in 0..n {
            let next = slots[if i == 0 { n } else { i } - 1];
            let handle = self.incoming_of(next);
            self.connect(slots[i], handle);
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.caches.len() as u32
    }

    /// Distributed token state of one line.
    pub fn line_snapshot(&self, addr: MemAddr) -> ZlLineSnapshot {
        let mut snap = ZlLineSnapshot::default();
        for cache in &self.caches {
            if let Some(i) = cache.find_line(addr) {
                let line = &cache.lines[i];
                snap.caches.push((
                    cache.name.clone(),
                    line.state,
                    line.tokens,
                    line.priority,
                    line.dirty,
                ));
            }
        }
        for dir in &self.dirs {
            let t = dir.tokens_below(addr);
            if t > 0 {
                snap.directories.push((dir.name.clone(), t));
            }
        }
        for root in &self.roots {
            if let Some(line) = root.dir.get(&addr) {
                snap.root_tokens = line.tokens;
                snap.root_priority = line.priority;
                snap.root_present = true;
                snap.root_full = line.state == root::RootLineState::Full;
            }
        }
        for (_, m) in self.msgs.borrow().iter_live() {
            if m.address == addr && m.kind != message::MessageKind::LocalDirNotification {
                snap.in_flight_tokens += m.tokens;
            }
        }
        snap
    }

    /// Number of live protocol messages.
    pub fn live_messages(&self) -> usize {
        self.msgs.borrow().live()
    }

    /// Total evictions absorbed into free ways.
    pub fn injections(&self) -> u64 {
        self.caches.iter().map(|c| c.stats.injections).sum()
    }

    /// Assert the protocol invariants; the directory comparison and the
    /// priority-uniqueness check require drained rings.
    pub fn check_invariants(&self, drained: bool) {
        let total = self.total_tokens();
        let mut addrs = std::collections::BTreeSet::new();
        for cache in &self.caches {
            for (i, line) in cache.lines.iter().enumerate() {
                match line.state {
                    LineState::Empty => continue,
                    LineState::Loading => assert_eq!(
                        line.tokens, 0,
                        "{}: loading line holds tokens",
                        cache.name
                    ),
                    LineState::Full => {
                        if line.dirty {
                            assert_eq!(
                                line.tokens, total,
                                "{}: dirty line without the full token budget",
                                cache.name
                            );
                        }
                    }
                }
                addrs.insert(cache.line_address(i));
            }
        }
        for root in &self.roots {
            addrs.extend(root.dir.keys().copied());
        }
        for addr in addrs {
            let snap = self.line_snapshot(addr);
            if !snap.root_full {
                continue;
            }
            assert_eq!(
                snap.visible_tokens(),
                total,
                "token conservation broken at {addr:#x}: {snap:?}"
            );
            if drained {
                assert_eq!(
                    snap.priority_holders(),
                    1,
                    "priority token lost or duplicated at {addr:#x}: {snap:?}"
                );
                let below: u32 = snap.directories.iter().map(|d| d.1).sum();
                let held: u32 = snap.caches.iter().map(|c| c.2).sum();
                assert_eq!(
                    below, held,
                    "directory counters disagree with caches at {addr:#x}: {snap:?}"
                );
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ZlLineSnapshot {
    pub caches: Vec<(String, LineState, u32, bool, bool)>,
    pub directories: Vec<(String, u32)>,
    pub root_present: bool,
    pub root_full: bool,
    pub root_tokens: u32,
    pub root_priority: bool,
    pub in_flight_tokens: u32,
}

impl ZlLineSnapshot {
    pub fn visible_tokens(&self) -> u32 {
        self.caches.iter().map(|c| c.2).sum::<u32>() + self.root_tokens + self.in_flight_tokens
    }

    /// Exactly one priority token should be visible once traffic drains.
    pub fn priority_holders(&self) -> usize {
        self.caches.iter().filter(|c| c.3).count() + usize::from(self.root_priority)
    }
}

impl Memory for ZlcdmaMemory {
    fn register_client(
        &mut self,
        ctx: &mut SimCtx,
        callback: ClientCallback,
        process: ProcessId,
        grouped: bool,
    ) -> Result<(Mcid, MemoryPort), ConfigError> {
        let id = self.client_map.len();
        let abstract_id = if grouped {
            assert!(self.num_clients > 0, "grouped client with no predecessor");
            self.num_clients - 1
        } else {
            let n = self.num_clients;
            self.num_clients += 1;
            n
        };
        let cache_id = abstract_id / self.clients_per_cache;
        if cache_id == self.caches.len() {
            self.add_cache(ctx);
        }
        let cache = &mut self.caches[cache_id];
        let id_in_cache = cache.clients.borrow().len();
        cache.clients.borrow_mut().push(ClientEntry {
            callback: Some(callback),
            process,
        });
        ctx.service_add_cyclic(cache.p_bus, process);
        ctx.add_trace(process, cache.requests.storage_id());
        self.client_map.push((cache_id, id_in_cache));

        let port = ZlcdmaPort {
            line_size: self.line_size,
            client: id_in_cache,
            requests: cache.requests,
            p_bus: cache.p_bus,
            stats: self.stats.clone(),
        };
        Ok((id, MemoryPort::Zlcdma(port)))
    }

    fn unregister_client(&mut self, id: Mcid) {
        let (cache_id, id_in_cache) = self.client_map[id];
        self.caches[cache_id].clients.borrow_mut()[id_in_cache].callback = None;
    }

    fn initialize(&mut self, _ctx: &mut SimCtx) -> Result<(), ConfigError> {
        assert!(!self.initialized, "rings wired twice");
        if self.caches.is_empty() {
            return Err(ConfigError::Invalid(
                "no clients registered: the hierarchy has no caches".into(),
            ));
        }
        let total = self.total_tokens();
        for cache in &mut self.caches {
            cache.set_total_tokens(total);
        }
        for root in &mut self.roots {
            root.set_total_tokens(total);
        }

        let n = self.caches.len();
        let k = self.caches_per_ring;
        for d in 0..self.dirs.len() {
            let first = d * k;
            let last = (first + k).min(n) - 1;
            let mut ring: Vec<Slot> = vec![Slot::DirBottom(d)];
            ring.extend((first..=last).map(Slot::Cache));
            self.wire_ring(&ring);
            self.dirs[d].set_range(first, last)?;
        }

        let dirs: Vec<Slot> = (0..self.dirs.len()).map(Slot::DirTop).collect();
        let mut slots: Vec<Option<Slot>> = vec![None; dirs.len() + self.roots.len()];
        for i in 0..self.roots.len() {
            let mut pos = i * dirs.len() / self.roots.len() + i;
            while slots[pos].is_some() {
                pos = (pos + 1) % slots.len();
            }
            slots[pos] = Some(Slot::Root(i));
        }
        let mut d = dirs.iter();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(*d.next().expect("slot arithmetic out of balance"));
            }
        }
        let ring: Vec<Slot> = slots.into_iter().map(|s| s.expect("slot filled")).collect();
        self.wire_ring(&ring);

        log::info!(
            "zlcdma: {} caches, {} directories, {} roots, {} tokens per line, injection {}",
            self.caches.len(),
            self.dirs.len(),
            self.roots.len(),
            total,
            if self.inject { "on" } else { "off" }
        );
        self.initialized = true;
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
            external_reads: self.roots.iter().map(|r| r.nreads).sum(),
            external_writes: self.roots.iter().map(|r| r.nwrites).sum(),
        }
    }

    fn dump(&self, _ctx: &SimCtx) -> String {
        let mut out = String::new();
        for cache in &self.caches {
            cache.dump(&mut out);
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

impl Component for ZlcdmaMemory {
    fn name(&self) -> &str {
        "zlcdma"
    }

    fn step(&mut self, local: usize, ctx: &mut SimCtx) -> StepResult {
        debug_assert!(self.initialized, "cycle before ring construction");
        match self.procs[local] {
            Proc::CacheRequests(i) => self.caches[i].step_requests(ctx),
            Proc::CacheIncoming(i) => self.caches[i].step_incoming(ctx),
            Proc::CacheResponses(i) => self.caches[i].step_responses(ctx),
            Proc::CacheForward(i) => self.caches[i].step_forward(ctx),
            Proc::DirInBottom(i) => self.dirs[i].step_in_bottom(ctx),
            Proc::DirInTop(i) => self.dirs[i].step_in_top(ctx),
            Proc::DirFwdBottom(i) => self.dirs[i].step_forward_bottom(ctx),
            Proc::DirFwdTop(i) => self.dirs[i].step_forward_top(ctx),
            Proc::RootIncoming(i) => self.roots[i].step_incoming(ctx),
            Proc::RootRequests(i) => self.roots[i].step_requests(ctx),
            Proc::RootChannel(i) => self.roots[i].step_channel(ctx),
            Proc::RootDdrDone(i) => self.roots[i].step_ddr_done(ctx),
            Proc::RootResponses(i) => self.roots[i].step_responses(ctx),
            Proc::RootForward(i) => self.roots[i].step_forward(ctx),
        }
    }

    fn sample_state(&self, sink: &mut SampleSink) {
        let stats = self.stats.borrow();
        sink.record("zlcdma.nreads", stats.nreads);
        sink.record("zlcdma.nwrites", stats.nwrites);
        for cache in &self.caches {
            sink.record(&format!("{}.read_hits", cache.name), cache.stats.read_hits);
            sink.record(&format!("{}.misses", cache.name), cache.stats.misses);
            sink.record(
                &format!("{}.injections", cache.name),
                cache.stats.injections,
            );
            sink.record(
                &format!("{}.merged_writes", cache.name),
                cache.stats.merged_writes,
            );
        }
        sink.record("zlcdma.live_messages", self.msgs.borrow().live() as u64);
    }
}

/// Client handle for the token-priority hierarchy.
#[derive(Clone)]
pub struct ZlcdmaPort {
    pub(crate) line_size: usize,
    client: usize,
    requests: BufferHandle<BusRequest>,
    p_bus: ServiceId,
    stats: Rc<RefCell<MemStats>>,
}

impl ZlcdmaPort {
    pub fn read(&self, ctx: &mut SimCtx, addr: MemAddr) -> bool {
        if !self.p_bus.invoke(ctx) {
            return false;
        }
        let request = BusRequest {
            write: false,
            address: addr,
            data: MemData::new(self.line_size),
            client: self.client,
            wid: 0,
        };
        if !self.requests.push(ctx, request, 0) {
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
        if !self.p_bus.invoke(ctx) {
            return false;
        }
        let request = BusRequest {
            write: true,
            address: addr,
            data: data.clone(),
            client: self.client,
            wid,
        };
        if !self.requests.push(ctx, request, 0) {
            return false;
        }
        if ctx.committing() {
            let mut stats = self.stats.borrow_mut();
            stats.nwrites += 1;
            stats.nwrite_bytes += self.line_size as u64;
        }
        true
    }
}
