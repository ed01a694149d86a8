/*!
The CDMA memory hierarchy: caches, directories and root directories on
unidirectional rings, kept coherent by counted tokens.

One-level: a single ring of caches and root directories. Two-level: rings
of caches anchored by a directory each, and a top ring of directory heads
plus the root directories. The container grows caches (and directories) as
clients register, wires the rings at `initialize`, and dispatches every
subcomponent process.

The total token budget T equals the number of caches; a line present
anywhere satisfies `cache tokens + parked root tokens + in-flight tokens
= T`, which `line_snapshot` exposes for inspection and tests.
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
use crate::mem::cdma::cache::{Cache, CacheProcessIds, LineState};
use crate::mem::cdma::directory::{Directory, DirectoryProcessIds};
use crate::mem::cdma::message::{BusRequest, Message};
use crate::mem::cdma::root::{RootDirectory, RootLineState, RootProcessIds};
use crate::mem::ddr::DdrChannelRegistry;
use crate::mem::parallel::MemStats;
use crate::mem::ring::{MsgId, Slab};
use crate::mem::selector::BankSelector;
use crate::mem::store::SparseMemory;
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

/// Where a topology slot's ring interface lives.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Cache(usize),
    DirBottom(usize),
    DirTop(usize),
    Root(usize),
}

pub struct CdmaMemory {
    comp: ComponentId,
    clock: ClockId,
    two_level: bool,
    line_size: usize,
    clients_per_cache: usize,
    caches_per_ring: usize,
    sets: usize,
    assoc: usize,
    buffer_size: usize,
    num_clients: usize,
    selector: Rc<BankSelector>,
    msgs: Rc<RefCell<Slab<Message>>>,
    caches: Vec<Cache>,
    dirs: Vec<Directory>,
    roots: Vec<RootDirectory>,
    procs: Vec<Proc>,
    client_map: Vec<(usize, usize)>,
    store: Rc<RefCell<SparseMemory>>,
    traces: Rc<RefCell<BTreeSet<MemAddr>>>,
    stats: Rc<RefCell<MemStats>>,
    initialized: bool,
}

impl CdmaMemory {
    pub fn new(
        ctx: &mut SimCtx,
        clock: ClockId,
        cfg: &Config,
        two_level: bool,
    ) -> Result<Self, ConfigError> {
        let comp = ctx.allocate_component(if two_level { "cdma2" } else { "cdma" });
        let line_size = cfg.get_power_of_two("CacheLineSize")? as usize;
        let sets: usize = cfg.get("L2CacheNumSets")?;
        let selector_name: String = cfg.get_or("BankSelector", "XORFOLD".to_string())?;
        let selector = Rc::new(BankSelector::from_name(&selector_name, sets)?);
        let num_roots = cfg.get_power_of_two("NumRootDirectories")? as usize;
        let buffer_size = cfg.get_or("NodeBufferSize", 2usize)?;
        let store = Rc::new(RefCell::new(SparseMemory::new()));
        let msgs = Rc::new(RefCell::new(Slab::new()));
        let traces = Rc::new(RefCell::new(BTreeSet::new()));

        let ddr = DdrChannelRegistry::new(ctx, "cdma.ddr", clock, cfg, num_roots)?;
        let mut memory = CdmaMemory {
            comp,
            clock,
            two_level,
            line_size,
            clients_per_cache: cfg.get("NumClientsPerL2Cache")?,
            caches_per_ring: cfg.get("NumL2CachesPerRing")?,
            sets,
            assoc: cfg.get("L2CacheAssociativity")?,
            buffer_size,
            num_clients: 0,
            selector,
            msgs,
            caches: Vec::new(),
            dirs: Vec::new(),
            roots: Vec::new(),
            procs: Vec::new(),
            client_map: Vec::new(),
            store,
            traces,
            stats: Rc::new(RefCell::new(MemStats::default())),
            initialized: false,
        };

        let mut channels: Vec<_> = ddr.channels.into_iter().collect();
        for (i, channel) in channels.drain(..).enumerate() {
            let ddr_id: usize = cfg.get_or("DDRChannelID", i)?;
            if ddr_id >= num_roots {
                return Err(ConfigError::Invalid(format!(
                    "invalid DDR channel id {ddr_id} for root directory {i}"
                )));
            }
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
        let name = format!("cdma.rootdir{id}");
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
        // Node ids: roots live above all possible cache and directory ids.
        let node_id = 1_000_000 + id;
        let root = RootDirectory::new(
            ctx,
            &name,
            self.clock,
            node_id,
            id,
            num_roots,
            self.line_size,
            self.buffer_size,
            channel,
            self.msgs.clone(),
            self.store.clone(),
            self.traces.clone(),
            pids,
        );
        self.roots.push(root);
    }

    fn add_cache(&mut self, ctx: &mut SimCtx) {
        assert!(!self.initialized, "cache added after ring construction");
        if self.two_level && self.caches.len() % self.caches_per_ring == 0 {
            self.add_directory(ctx);
        }
        let id = self.caches.len();
        let name = format!("cdma.cache{id}");
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
            &name,
            self.clock,
            id,
            self.sets,
            self.assoc,
            self.line_size,
            self.buffer_size,
            self.selector.clone(),
            self.msgs.clone(),
            self.traces.clone(),
            pids,
        );
        self.caches.push(cache);
    }

    fn add_directory(&mut self, ctx: &mut SimCtx) {
        let id = self.dirs.len();
        let name = format!("cdma.dir{id}");
        let pids = DirectoryProcessIds {
            in_bottom: self.register(ctx, &format!("dir{id}.bottom-incoming"), Proc::DirInBottom(id)),
            in_top: self.register(ctx, &format!("dir{id}.top-incoming"), Proc::DirInTop(id)),
            fwd_bottom: self.register(ctx, &format!("dir{id}.bottom-forward"), Proc::DirFwdBottom(id)),
            fwd_top: self.register(ctx, &format!("dir{id}.top-forward"), Proc::DirFwdTop(id)),
        };
        // Directory interfaces take node ids above any cache's.
        let bottom_id = 500_000 + 2 * id;
        let top_id = 500_000 + 2 * id + 1;
        let dir = Directory::new(
            ctx,
            &name,
            self.clock,
            bottom_id,
            top_id,
            self.buffer_size,
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

    /// Lay out a ring: every slot's forward process sends to the slot one
    /// position earlier, wrapping at the front.
    fn wire_ring(&mut self, slots: &[Slot]) {
        let n = slots.len();
        for i in 0..n {
            let next = slots[if i == 0 { n } else { i } - 1];
            let handle = self.incoming_of(next);
            self.connect(slots[i], handle);
        }
    }

    /// Place roots as evenly as possible among `others` on a ring; uneven
    /// counts spill each root to the next free position.
    fn top_ring_slots(&self, others: &[Slot]) -> Vec<Slot> {
        let mut slots: Vec<Option<Slot>> = vec![None; others.len() + self.roots.len()];
        for i in 0..self.roots.len() {
            let mut pos = i * others.len() / self.roots.len() + i;
            while slots[pos].is_some() {
                pos = (pos + 1) % slots.len();
            }
            slots[pos] = Some(Slot::Root(i));
        }
        let mut o = others.iter();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(*o.next().expect("slot arithmetic out of balance"));
            }
        }
        slots.into_iter().map(|s| s.expect("slot filled")).collect()
    }

    pub fn total_tokens(&self) -> u32 {
        self.caches.len() as u32
    }

    /// Enable or disable protocol tracing for one line address.
    pub fn trace_address(&mut self, addr: MemAddr, enable: bool) {
        let line = addr / self.line_size as u64 * self.line_size as u64;
        if enable {
            self.traces.borrow_mut().insert(line);
        } else {
            self.traces.borrow_mut().remove(&line);
        }
    }

    /// Distributed state of one line, for inspection and invariant checks.
    pub fn line_snapshot(&self, addr: MemAddr) -> LineSnapshot {
        let mut snap = LineSnapshot::default();
        for cache in &self.caches {
            if let Some(i) = cache.find_line(addr) {
                let line = &cache.lines[i];
                snap.caches.push(CacheLineView {
                    name: cache.name.clone(),
                    state: line.state,
                    tokens: line.tokens,
                    dirty: line.dirty,
                    updating: line.updating() as u32,
                });
            }
        }
        for dir in &self.dirs {
            if let Some(&tokens) = dir.dir.get(&addr) {
                snap.directories.push((dir.name.clone(), tokens));
            }
        }
        for root in &self.roots {
            if let Some(line) = root.dir.get(&addr) {
                snap.root = Some(RootLineView {
                    name: root.name.clone(),
                    state: line.state,
                    tokens: line.tokens,
                });
            }
        }
        for (_, m) in self.msgs.borrow().iter_live() {
            if m.address == addr {
                snap.in_flight_tokens += m.tokens;
                snap.in_flight_messages += 1;
            }
        }
        snap
    }

    /// Sum of all live message tokens (any address).
    pub fn tokens_in_flight(&self) -> u32 {
        self.msgs.borrow().iter_live().map(|(_, m)| m.tokens).sum()
    }

    /// Number of live protocol messages.
    pub fn live_messages(&self) -> usize {
        self.msgs.borrow().live()
    }

    /// DDR reads issued by all roots.
    pub fn external_reads(&self) -> u64 {
        self.roots.iter().map(|r| r.nreads).sum()
    }

    /// DDR writes issued by all roots.
    pub fn external_writes(&self) -> u64 {
        self.roots.iter().map(|r| r.nwrites).sum()
    }

    /// Per-root DDR read counts, in root order.
    pub fn root_reads(&self) -> Vec<u64> {
        self.roots.iter().map(|r| r.nreads).collect()
    }

    /// Directory and root state dump for the interactive monitor.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        for dir in &self.dirs {
            dir.dump(&mut out);
        }
        for root in &self.roots {
            root.dump(&mut out);
        }
        out
    }

    /// Every line address currently tracked anywhere in the hierarchy.
    pub fn tracked_addresses(&self) -> BTreeSet<MemAddr> {
        let mut addrs = BTreeSet::new();
        for cache in &self.caches {
            for (i, line) in cache.lines.iter().enumerate() {
                if line.state != LineState::Empty {
                    addrs.insert(cache.line_address(i));
                }
            }
        }
        for dir in &self.dirs {
            addrs.extend(dir.dir.keys().copied());
        }
        for root in &self.roots {
            addrs.extend(root.dir.keys().copied());
        }
        for (_, m) in self.msgs.borrow().iter_live() {
            addrs.insert(m.address);
        }
        addrs
    }

    /// Assert the protocol invariants. Token conservation and the per-line
    /// rules hold at any cycle boundary; the directory counter comparison
    /// is only valid once ring traffic has drained, so it is gated.
    pub fn check_invariants(&self, drained: bool) {
        let total = self.total_tokens();
        for cache in &self.caches {
            for line in &cache.lines {
                match line.state {
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
                    LineState::Empty => {}
                }
            }
        }
        for addr in self.tracked_addresses() {
            let snap = self.line_snapshot(addr);
            // Tokens are explicit only once the root has introduced them;
            // before that (no entry, or the initial fetch still loading)
            // the whole budget is implicit at the root.
            let introduced = snap
                .root
                .as_ref()
                .is_some_and(|r| r.state == RootLineState::Full);
            if introduced {
                assert_eq!(
                    snap.visible_tokens(),
                    total,
                    "token conservation broken at {addr:#x}: {snap:?}"
                );
            }
        }
        if drained {
            for dir in &self.dirs {
                dir.check_against(&self.caches);
            }
        }
    }
}

/// Where a line lives right now.
#[derive(Debug, Default)]
pub struct LineSnapshot {
    pub caches: Vec<CacheLineView>,
    pub directories: Vec<(String, u32)>,
    pub root: Option<RootLineView>,
    pub in_flight_tokens: u32,
    pub in_flight_messages: u32,
}

#[derive(Debug)]
pub struct CacheLineView {
    pub name: String,
    pub state: LineState,
    pub tokens: u32,
    pub dirty: bool,
    pub updating: u32,
}

#[derive(Debug)]
pub struct RootLineView {
    pub name: String,
    pub state: RootLineState,
    pub tokens: u32,
}

impl LineSnapshot {
    /// Tokens held in caches plus parked at the root plus in flight.
    pub fn visible_tokens(&self) -> u32 {
        self.caches.iter().map(|c| c.tokens).sum::<u32>()
            + self.root.as_ref().map_or(0, |r| r.tokens)
            + self.in_flight_tokens
    }

    pub fn present(&self) -> bool {
        self.root.is_some()
            || !self.caches.is_empty()
            || self.in_flight_messages > 0
    }
}

impl Memory for CdmaMemory {
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

        let port = CdmaPort {
            line_size: self.line_size,
            client: id_in_cache,
            requests: cache.requests,
            p_bus: cache.p_bus,
            stats: self.stats.clone(),
        };
        Ok((id, MemoryPort::Cdma(port)))
    }

    fn unregister_client(&mut self, id: Mcid) {
        let (cache_id, id_in_cache) = self.client_map[id];
        self.caches[cache_id].clients.borrow_mut()[id_in_cache].callback = None;
    }

    /// Wire the rings. All clients must be registered first.
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

        if !self.two_level {
            // Single ring of caches and roots.
            let others: Vec<Slot> = (0..self.caches.len()).map(Slot::Cache).collect();
            let ring = self.top_ring_slots(&others);
            self.wire_ring(&ring);
        } else {
            // Bottom rings: each directory with its caches.
            let n = self.caches.len();
            let k = self.caches_per_ring;
            for d in 0..self.dirs.len() {
                let first = d * k;
                let last = (first + k).min(n) - 1;
                let mut ring: Vec<Slot> = vec![Slot::DirBottom(d)];
                // Ring order bottom: dir, then caches last..first (forward
                // sends to the previous slot).
                ring.extend((first..=last).map(Slot::Cache));
                self.wire_ring(&ring);
                let lines = (last - first + 1) * self.sets * self.assoc;
                self.dirs[d].set_range(first, last, lines)?;
            }
            let others: Vec<Slot> = (0..self.dirs.len()).map(Slot::DirTop).collect();
            let ring = self.top_ring_slots(&others);
            self.wire_ring(&ring);
        }
        log::info!(
            "{}: {} caches, {} directories, {} roots, {} tokens per line",
            if self.two_level { "cdma2" } else { "cdma" },
            self.caches.len(),
            self.dirs.len(),
            self.roots.len(),
            total
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
            external_reads: self.external_reads(),
            external_writes: self.external_writes(),
        }
    }

    fn dump(&self, _ctx: &SimCtx) -> String {
        let mut out = self.dump_state();
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

impl Component for CdmaMemory {
    fn name(&self) -> &str {
        if self.two_level { "cdma2" } else { "cdma" }
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
        sink.record("cdma.nreads", stats.nreads);
        sink.record("cdma.nwrites", stats.nwrites);
        for cache in &self.caches {
            sink.record(
                &format!("{}.read_hits", cache.name),
                cache.stats.read_hits,
            );
            sink.record(&format!("{}.misses", cache.name), cache.stats.misses);
            sink.record(&format!("{}.evictions", cache.name), cache.stats.evictions);
        }
        for root in &self.roots {
            sink.record(&format!("{}.nreads", root.name), root.nreads);
            sink.record(&format!("{}.nwrites", root.name), root.nwrites);
        }
        sink.record("cdma.live_messages", self.msgs.borrow().live() as u64);
    }
}

/// Client handle for the CDMA hierarchies.
#[derive(Clone)]
pub struct CdmaPort {
    pub(crate) line_size: usize,
    client: usize,
    requests: BufferHandle<BusRequest>,
    p_bus: ServiceId,
    stats: Rc<RefCell<MemStats>>,
}

impl CdmaPort {
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
