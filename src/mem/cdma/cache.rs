/*!
The L2 cache of the token-coherence hierarchy.

A set-associative store of lines, each carrying a token count; the line's
state machine is EMPTY -> LOADING -> FULL, with FULL -> EMPTY on eviction.
Clients share the cache through an arbitrated bus feeding a request queue;
the ring side snoops every passing message. Read completions are broadcast
to all clients of the cache, which is also how waiters on a LOADING line
are drained when the fill arrives.

Token rules implemented here:
- a holder of at least one token may satisfy local reads;
- a clean holder donates half its tokens (at least one) to a passing read;
- a dirty holder owns every token, and a passing read migrates the whole
  line (data, tokens, dirty bit) to the requester;
- exclusive writes (all tokens held) are local and set the dirty bit;
- partial-token writes propagate as `Update` messages and leave every copy
  clean; the queued acknowledgements fire when the update returns.
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::kernel::{
    BufferHandle, ClockId, CycleNo, ProcessId, ServiceId, SimCtx, StepResult,
};
use crate::mem::cdma::message::{BusRequest, Message, MessageKind};
use crate::mem::ring::{MsgId, NodeId, RingNode, Slab, MINSPACE_FORWARD};
use crate::mem::selector::BankSelector;
use crate::mem::{ClientEntry, MemAddr, WClientId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Empty,
    Loading,
    Full,
}

#[derive(Debug)]
pub(crate) struct CacheLine {
    pub state: LineState,
    pub tag: MemAddr,
    pub data: Vec<u8>,
    pub valid: Vec<bool>,
    /// Last access cycle, for LRU replacement.
    pub access: CycleNo,
    pub tokens: u32,
    pub dirty: bool,
    /// Clients waiting for a write acknowledgement, oldest first. The line
    /// is not evictable while this is non-empty.
    pub acks: VecDeque<(usize, WClientId)>,
}

impl CacheLine {
    fn new(line_size: usize) -> Self {
        CacheLine {
            state: LineState::Empty,
            tag: 0,
            data: vec![0; line_size],
            valid: vec![false; line_size],
            access: 0,
            tokens: 0,
            dirty: false,
            acks: VecDeque::new(),
        }
    }

    pub fn updating(&self) -> usize {
        self.acks.len()
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    pub read_accesses: u64,
    pub write_accesses: u64,
    pub read_hits: u64,
    pub misses: u64,
    pub loading_hits: u64,
    pub evictions: u64,
    pub received_messages: u64,
    pub ignored_messages: u64,
    pub forward_stalls: u64,
}

pub(crate) struct Cache {
    pub name: String,
    pub node: RingNode,
    sets: usize,
    assoc: usize,
    line_size: usize,
    total_tokens: u32,
    pub lines: Vec<CacheLine>,
    selector: Rc<BankSelector>,
    msgs: Rc<RefCell<Slab<Message>>>,
    pub clients: Rc<RefCell<Vec<ClientEntry>>>,
    pub requests: BufferHandle<BusRequest>,
    responses: BufferHandle<(MemAddr, Vec<u8>)>,
    p_lines: ServiceId,
    pub p_bus: ServiceId,
    traces: Rc<RefCell<std::collections::BTreeSet<MemAddr>>>,
    pub stats: CacheStats,
}

impl Cache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &mut SimCtx,
        name: &str,
        clock: ClockId,
        id: NodeId,
        sets: usize,
        assoc: usize,
        line_size: usize,
        buffer_size: usize,
        selector: Rc<BankSelector>,
        msgs: Rc<RefCell<Slab<Message>>>,
        traces: Rc<RefCell<std::collections::BTreeSet<MemAddr>>>,
        pids: CacheProcessIds,
    ) -> Self {
        let node = RingNode::new(ctx, name, clock, id, buffer_size);
        let requests = ctx.create_buffer::<BusRequest>(
            &format!("{name}.b_requests"),
            clock,
            buffer_size.max(2),
            2,
        );
        let responses = ctx.create_buffer::<(MemAddr, Vec<u8>)>(
            &format!("{name}.b_responses"),
            clock,
            buffer_size.max(2),
            2,
        );
        let p_lines = ctx.create_service(
            &format!("{name}.p_lines"),
            crate::kernel::Discipline::Priority,
        );
        let p_bus = ctx.create_service(
            &format!("{name}.p_bus"),
            crate::kernel::Discipline::PriorityCyclic,
        );
        ctx.sensitive(requests.storage_id(), pids.requests);
        ctx.sensitive(responses.storage_id(), pids.responses);
        ctx.sensitive(node.incoming.storage_id(), pids.incoming);
        ctx.sensitive(node.outgoing.storage_id(), pids.forward);
        ctx.service_add(p_lines, pids.requests);
        ctx.service_add(p_lines, pids.incoming);
        ctx.add_trace(pids.requests, node.outgoing.storage_id());
        ctx.add_trace(pids.requests, responses.storage_id());
        ctx.add_trace(pids.incoming, node.outgoing.storage_id());
        ctx.add_trace(pids.incoming, responses.storage_id());
        Cache {
            name: name.to_string(),
            node,
            sets,
            assoc,
            line_size,
            total_tokens: 0,
            lines: (0..sets * assoc).map(|_| CacheLine::new(line_size)).collect(),
            selector,
            msgs,
            clients: Rc::new(RefCell::new(Vec::new())),
            requests,
            responses,
            p_lines,
            p_bus,
            traces,
            stats: CacheStats::default(),
        }
    }

    pub fn set_total_tokens(&mut self, total: u32) {
        self.total_tokens = total;
    }

    fn traced(&self, addr: MemAddr) -> bool {
        let line = addr / self.line_size as u64 * self.line_size as u64;
        let traces = self.traces.borrow();
        !traces.is_empty() && traces.contains(&line)
    }

    fn trace(&self, addr: MemAddr, what: &str) {
        if self.traced(addr) {
            log::trace!("{}: {:#x}: {}", self.name, addr, what);
        }
    }

    /// Locate the line holding `addr`, if any.
    pub fn find_line(&self, addr: MemAddr) -> Option<usize> {
        let (tag, set) = self.selector.map(addr / self.line_size as u64);
        debug_assert!(set < self.sets);
        (0..self.assoc)
            .map(|way| set * self.assoc + way)
            .find(|&i| self.lines[i].state != LineState::Empty && self.lines[i].tag == tag)
    }

    /// Pick a line to hold `addr`: an empty way if available, otherwise the
    /// least recently used FULL way with no pending acknowledgements.
    /// `None` means nothing is evictable this cycle.
    fn pick_victim(&self, set: usize) -> Option<usize> {
        let ways = || (0..self.assoc).map(|w| set * self.assoc + w);
        if let Some(i) = ways().find(|&i| self.lines[i].state == LineState::Empty) {
            return Some(i);
        }
        ways()
            .filter(|&i| self.lines[i].state == LineState::Full && self.lines[i].acks.is_empty())
            .min_by_key(|&i| self.lines[i].access)
    }

    /// Full byte address of the line at `index`.
    pub(crate) fn line_address(&self, index: usize) -> MemAddr {
        let set = index / self.assoc;
        self.selector.unmap(self.lines[index].tag, set) * self.line_size as u64
    }

    // -- client bus ---------------------------------------------------------

    pub fn step_requests(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let req = self.requests.front(ctx);
        let result = if req.write {
            self.on_write_request(ctx, &req)
        } else {
            self.on_read_request(ctx, &req)
        };
        if result == StepResult::Success {
            self.requests.pop(ctx);
        }
        result
    }

    fn on_read_request(&mut self, ctx: &mut SimCtx, req: &BusRequest) -> StepResult {
        match self.find_line(req.address).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Full)) => {
                if !self.responses.can_push(ctx, 0) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.trace(req.address, "read hit");
                    self.responses
                        .push(ctx, (req.address, self.lines[i].data.clone()), 0);
                    self.lines[i].access = ctx.now();
                    self.stats.read_accesses += 1;
                    self.stats.read_hits += 1;
                }
                StepResult::Success
            }
            Some((_, LineState::Loading)) => {
                // The client is an implicit waiter; the fill broadcast will
                // reach it. No network activity.
                if ctx.committing() {
                    self.trace(req.address, "read hit on loading line, waiting");
                    self.stats.read_accesses += 1;
                    self.stats.loading_hits += 1;
                }
                StepResult::Success
            }
            _ => self.on_miss(ctx, req, MessageKind::ReadRequest),
        }
    }

    fn on_write_request(&mut self, ctx: &mut SimCtx, req: &BusRequest) -> StepResult {
        match self.find_line(req.address).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Full)) => {
                if self.lines[i].tokens == self.total_tokens {
                    // Exclusive: write locally, no network traffic.
                    if ctx.committing() {
                        self.trace(req.address, "exclusive write hit");
                        self.ack_write(req.client, req.wid);
                        self.snoop_local(req);
                        let line = &mut self.lines[i];
                        apply_masked(&mut line.data, &req.data.data, &req.data.mask);
                        line.dirty = true;
                        line.access = ctx.now();
                        self.stats.write_accesses += 1;
                    }
                    StepResult::Success
                } else {
                    // Shared: propagate an update around the rings.
                    if !self.node.outgoing.can_push(ctx, 0) {
                        return StepResult::Failed;
                    }
                    if ctx.committing() {
                        self.trace(req.address, "shared write hit, sending update");
                        self.snoop_local(req);
                        let line = &mut self.lines[i];
                        apply_masked(&mut line.data, &req.data.data, &req.data.mask);
                        line.access = ctx.now();
                        line.acks.push_back((req.client, req.wid));
                        let mut msg = Message::new(
                            MessageKind::Update,
                            req.address,
                            self.node.id,
                            self.line_size,
                        );
                        msg.merge_bytes(&req.data.data, &req.data.mask);
                        msg.acks = 1;
                        let mid = self.msgs.borrow_mut().alloc(msg);
                        self.node.send(ctx, mid, 0);
                        self.stats.write_accesses += 1;
                    }
                    StepResult::Success
                }
            }
            Some((i, LineState::Loading)) => {
                // Merge the write into the loading line; it resolves when
                // the fill arrives.
                if ctx.committing() {
                    self.trace(req.address, "write queued on loading line");
                    self.snoop_local(req);
                    let line = &mut self.lines[i];
                    apply_masked_valid(
                        &mut line.data,
                        &mut line.valid,
                        &req.data.data,
                        &req.data.mask,
                    );
                    line.acks.push_back((req.client, req.wid));
                    self.stats.write_accesses += 1;
                }
                StepResult::Success
            }
            _ => self.on_miss(ctx, req, MessageKind::RequestData),
        }
    }

    /// Allocate a line for a missing address, evicting if necessary, and
    /// send the given request onto the ring.
    fn on_miss(&mut self, ctx: &mut SimCtx, req: &BusRequest, kind: MessageKind) -> StepResult {
        let (tag, set) = self.selector.map(req.address / self.line_size as u64);
        let Some(victim) = self.pick_victim(set) else {
            log::debug!("{}: no evictable line in set {set}", self.name);
            return StepResult::Failed;
        };
        let evicting = self.lines[victim].state == LineState::Full;
        // An eviction plus the new request makes two sends this cycle.
        if evicting && !self.node.outgoing.can_push(ctx, 1) {
            return StepResult::Failed;
        }
        if !self.node.outgoing.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            if evicting {
                self.evict_line(ctx, victim);
            }
            let line = &mut self.lines[victim];
            line.state = LineState::Loading;
            line.tag = tag;
            line.tokens = 0;
            line.dirty = false;
            line.data.fill(0);
            line.valid.fill(false);
            line.access = ctx.now();
            line.acks.clear();

            let mut msg = Message::new(kind, req.address, self.node.id, self.line_size);
            if req.write {
                // Carry the written bytes so they survive merges en route.
                msg.merge_bytes(&req.data.data, &req.data.mask);
                let line = &mut self.lines[victim];
                apply_masked_valid(
                    &mut line.data,
                    &mut line.valid,
                    &req.data.data,
                    &req.data.mask,
                );
                line.acks.push_back((req.client, req.wid));
                self.snoop_local(req);
                self.stats.write_accesses += 1;
            } else {
                self.stats.read_accesses += 1;
            }
            self.stats.misses += 1;
            self.trace(req.address, "miss, requesting line");
            let mid = self.msgs.borrow_mut().alloc(msg);
            self.node.send(ctx, mid, 0);
        }
        StepResult::Success
    }

    /// Turn a FULL line into an eviction message. Commit phase only.
    fn evict_line(&mut self, ctx: &mut SimCtx, index: usize) {
        let addr = self.line_address(index);
        self.trace(addr, "evicting line");
        let line = &self.lines[index];
        let mut msg = Message::new(MessageKind::Eviction, addr, self.node.id, self.line_size);
        msg.tokens = line.tokens;
        msg.dirty = line.dirty;
        msg.data = line.data.clone();
        msg.mask = vec![true; self.line_size];
        let mid = self.msgs.borrow_mut().alloc(msg);
        self.node.send(ctx, mid, 0);
        for entry in self.clients.borrow().iter() {
            if let Some(cb) = &entry.callback {
                cb.borrow_mut().on_memory_invalidated(addr);
            }
        }
        self.lines[index].state = LineState::Empty;
        self.stats.evictions += 1;
    }

    fn ack_write(&self, client: usize, wid: WClientId) {
        if let Some(cb) = &self.clients.borrow()[client].callback {
            cb.borrow_mut().on_memory_write_completed(wid);
        }
    }

    /// Tell the cache's other clients about a local write.
    fn snoop_local(&self, req: &BusRequest) {
        for (i, entry) in self.clients.borrow().iter().enumerate() {
            if i == req.client {
                continue;
            }
            if let Some(cb) = &entry.callback {
                cb.borrow_mut()
                    .on_memory_snooped(req.address, &req.data.data, &req.data.mask);
            }
        }
    }

    // -- read-completion broadcast -----------------------------------------

    pub fn step_responses(&mut self, ctx: &mut SimCtx) -> StepResult {
        let (addr, data) = self.responses.front(ctx);
        if ctx.committing() {
            for entry in self.clients.borrow().iter() {
                if let Some(cb) = &entry.callback {
                    if !cb.borrow_mut().on_memory_read_completed(addr, &data) {
                        return StepResult::Failed;
                    }
                }
            }
        }
        self.responses.pop(ctx);
        StepResult::Success
    }

    // -- ring side ----------------------------------------------------------

    pub fn step_forward(&mut self, ctx: &mut SimCtx) -> StepResult {
        let r = self.node.step_forward(ctx);
        if r == StepResult::Failed && ctx.phase() == crate::kernel::Phase::Check {
            self.stats.forward_stalls += 1;
        }
        r
    }

    pub fn step_incoming(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.node.incoming.front(ctx);
        let (kind, ignore) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.kind, m.ignore)
        };
        let result = if ignore {
            if ctx.committing() {
                self.stats.ignored_messages += 1;
            }
            self.forward(ctx, mid)
        } else {
            match kind {
                MessageKind::ReadRequest => self.on_read_snoop(ctx, mid, false),
                MessageKind::RequestData => self.on_read_snoop(ctx, mid, true),
                MessageKind::RequestDataToken => self.on_data_token(ctx, mid),
                MessageKind::Update => self.on_update_snoop(ctx, mid),
                MessageKind::Eviction => self.on_eviction_snoop(ctx, mid),
            }
        };
        if result == StepResult::Success {
            if ctx.committing() {
                self.stats.received_messages += 1;
            }
            self.node.incoming.pop(ctx);
        }
        result
    }

    fn forward(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        if !self.node.send(ctx, mid, MINSPACE_FORWARD) {
            return StepResult::Failed;
        }
        StepResult::Success
    }

    /// A read (`ReadRequest`) or write-read (`RequestData`) from another
    /// cache passes by.
    fn on_read_snoop(&mut self, ctx: &mut SimCtx, mid: MsgId, with_data: bool) -> StepResult {
        let (addr, sender) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.address, m.sender)
        };

        if sender == self.node.id {
            // Our own request came back around. If the line filled in the
            // meantime (an absorbed eviction), the request is moot.
            if let Some(i) = self.find_line(addr) {
                if self.lines[i].state == LineState::Full {
                    if ctx.committing() {
                        self.trace(addr, "own request returned, line already full");
                        self.msgs.borrow_mut().free(mid);
                    }
                    return StepResult::Success;
                }
            }
            return self.forward(ctx, mid);
        }

        let Some(i) = self.find_line(addr) else {
            return self.forward(ctx, mid);
        };
        if self.lines[i].state != LineState::Full {
            return self.forward(ctx, mid);
        }

        if self.lines[i].dirty {
            // Dirty implies every token is here; migrate the whole line.
            if ctx.committing() {
                self.trace(addr, "migrating dirty line to reader");
                {
                    let line = &self.lines[i];
                    let mut msgs = self.msgs.borrow_mut();
                    let m = msgs.get_mut(mid);
                    m.kind = MessageKind::RequestDataToken;
                    m.tokens = line.tokens;
                    m.dirty = true;
                    m.data = line.data.clone();
                    m.mask = vec![true; self.line_size];
                }
                let addr_full = self.line_address(i);
                for entry in self.clients.borrow().iter() {
                    if let Some(cb) = &entry.callback {
                        cb.borrow_mut().on_memory_invalidated(addr_full);
                    }
                }
                self.lines[i].state = LineState::Empty;
            }
            return self.forward(ctx, mid);
        }

        if self.lines[i].tokens >= 2 {
            // Donate half our tokens along with the data.
            if ctx.committing() {
                let donate = self.lines[i].tokens / 2;
                self.trace(addr, "donating tokens to reader");
                {
                    let line = &self.lines[i];
                    let mut msgs = self.msgs.borrow_mut();
                    let m = msgs.get_mut(mid);
                    m.kind = MessageKind::RequestDataToken;
                    m.tokens = donate;
                    if with_data {
                        m.merge_bytes(&line.data, &line.valid);
                        m.mask.fill(true);
                    } else {
                        m.data = line.data.clone();
                        m.mask = vec![true; self.line_size];
                    }
                }
                self.lines[i].tokens -= donate;
            }
            return self.forward(ctx, mid);
        }

        // A single token cannot be split; merge data if asked and pass on.
        if with_data && ctx.committing() {
            let line = &self.lines[i];
            let mut msgs = self.msgs.borrow_mut();
            let m = msgs.get_mut(mid);
            // Only bytes the message does not already carry.
            for b in 0..self.line_size {
                if !m.mask[b] && line.valid[b] {
                    m.data[b] = line.data[b];
                    m.mask[b] = true;
                }
            }
        }
        self.forward(ctx, mid)
    }

    /// A read reply carrying data and tokens.
    fn on_data_token(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        let (addr, sender) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.address, m.sender)
        };
        if sender != self.node.id {
            return self.forward(ctx, mid);
        }

        match self.find_line(addr).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Loading)) => self.fill_line(ctx, i, mid),
            Some((i, LineState::Full)) => {
                // Filled earlier by an absorbed eviction; pocket the tokens.
                if ctx.committing() {
                    let (tokens, dirty) = {
                        let msgs = self.msgs.borrow();
                        let m = msgs.get(mid);
                        (m.tokens, m.dirty)
                    };
                    self.trace(addr, "reply to full line, pocketing tokens");
                    self.lines[i].tokens += tokens;
                    self.lines[i].dirty |= dirty;
                    self.msgs.borrow_mut().free(mid);
                }
                StepResult::Success
            }
            _ => {
                // The line was evicted while the reply was in flight; its
                // tokens and data go back into circulation as an eviction.
                if ctx.committing() {
                    self.trace(addr, "reply without line, re-issuing as eviction");
                    self.msgs.borrow_mut().get_mut(mid).kind = MessageKind::Eviction;
                }
                self.forward(ctx, mid)
            }
        }
    }

    /// Complete a LOADING line from a reply or an absorbed eviction, then
    /// resolve any writes queued on it. Pops nothing; callers do that.
    fn fill_line(&mut self, ctx: &mut SimCtx, i: usize, mid: MsgId) -> StepResult {
        if !self.responses.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        let has_acks = !self.lines[i].acks.is_empty();
        // With partial tokens, queued writes propagate as one update.
        let needs_update = {
            let msgs = self.msgs.borrow();
            has_acks && self.lines[i].tokens + msgs.get(mid).tokens < self.total_tokens
        };
        if needs_update && !self.node.outgoing.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let addr;
            let written: Vec<bool> = self.lines[i].valid.clone();
            {
                let msgs = self.msgs.borrow();
                let m = msgs.get(mid);
                addr = m.address;
                let line = &mut self.lines[i];
                for b in 0..line.data.len() {
                    if !line.valid[b] {
                        line.data[b] = m.data[b];
                    }
                    line.valid[b] = true;
                }
                line.tokens += m.tokens;
                line.dirty |= m.dirty;
                line.state = LineState::Full;
                line.access = ctx.now();
            }
            self.trace(addr, "line filled");
            self.responses.push(ctx, (addr, self.lines[i].data.clone()), 0);
            if has_acks {
                if self.lines[i].tokens == self.total_tokens {
                    self.lines[i].dirty = true;
                    let acks: Vec<_> = self.lines[i].acks.drain(..).collect();
                    for (client, wid) in acks {
                        self.ack_write(client, wid);
                    }
                } else {
                    let mut msg =
                        Message::new(MessageKind::Update, addr, self.node.id, self.line_size);
                    msg.merge_bytes(&self.lines[i].data, &written);
                    msg.acks = self.lines[i].acks.len() as u32;
                    let umid = self.msgs.borrow_mut().alloc(msg);
                    self.node.send(ctx, umid, 0);
                }
            }
            self.msgs.borrow_mut().free(mid);
        }
        StepResult::Success
    }

    /// A write-propagation message passes by.
    fn on_update_snoop(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        let (addr, sender) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.address, m.sender)
        };

        if sender == self.node.id {
            // Our update came back: the write is globally applied.
            if ctx.committing() {
                self.trace(addr, "update returned, acknowledging writes");
                let covered = self.msgs.borrow().get(mid).acks as usize;
                if let Some(i) = self.find_line(addr) {
                    let take = covered.min(self.lines[i].acks.len());
                    let acks: Vec<_> = self.lines[i].acks.drain(..take).collect();
                    for (client, wid) in acks {
                        self.ack_write(client, wid);
                    }
                }
                self.msgs.borrow_mut().free(mid);
            }
            return StepResult::Success;
        }

        if let Some(i) = self.find_line(addr) {
            if ctx.committing() {
                self.trace(addr, "applying remote update");
                let msgs = self.msgs.borrow();
                let m = msgs.get(mid);
                let line = &mut self.lines[i];
                match line.state {
                    LineState::Full => {
                        apply_masked(&mut line.data, &m.data, &m.mask);
                    }
                    LineState::Loading => {
                        // Updated bytes are newer than the fill in flight.
                        apply_masked_valid(&mut line.data, &mut line.valid, &m.data, &m.mask);
                    }
                    LineState::Empty => {}
                }
                for entry in self.clients.borrow().iter() {
                    if let Some(cb) = &entry.callback {
                        cb.borrow_mut().on_memory_snooped(addr, &m.data, &m.mask);
                    }
                }
            }
        }
        self.forward(ctx, mid)
    }

    /// Tokens and data leaving another cache pass by.
    fn on_eviction_snoop(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        let addr = self.msgs.borrow().get(mid).address;
        match self.find_line(addr).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Full)) => {
                if ctx.committing() {
                    self.trace(addr, "absorbing eviction");
                    let msgs = self.msgs.borrow();
                    let m = msgs.get(mid);
                    let line = &mut self.lines[i];
                    line.tokens += m.tokens;
                    if m.dirty {
                        line.data.copy_from_slice(&m.data);
                        line.dirty = true;
                    }
                    drop(msgs);
                    self.msgs.borrow_mut().free(mid);
                }
                StepResult::Success
            }
            Some((i, LineState::Loading)) => self.fill_line(ctx, i, mid),
            _ => self.forward(ctx, mid),
        }
    }
}

impl Cache {
    /// Line-table dump: one row per allocated line.
    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "{}: {} sets x {} ways", self.name, self.sets, self.assoc);
        for (i, line) in self.lines.iter().enumerate() {
            if line.state == LineState::Empty {
                continue;
            }
            let state = match line.state {
                LineState::Loading => 'L',
                LineState::Full => 'F',
                LineState::Empty => unreachable!(),
            };
            let _ = writeln!(
                out,
                "  way {:3} | {:#018x} | {state} | {:2} tokens |{}{} {} acks",
                i,
                self.line_address(i),
                line.tokens,
                if line.dirty { " dirty" } else { "" },
                if line.acks.is_empty() { "" } else { " updating" },
                line.acks.len(),
            );
        }
    }
}

/// Process ids for one cache, registered by the container.
pub(crate) struct CacheProcessIds {
    pub requests: ProcessId,
    pub incoming: ProcessId,
    pub responses: ProcessId,
    pub forward: ProcessId,
}

impl crate::kernel::serialize::Persist for CacheLine {
    fn serialize(&mut self, ar: &mut dyn crate::kernel::serialize::Archive) {
        let mut state = self.state as u32;
        ar.field_u32("state", &mut state);
        self.state = match state {
            0 => LineState::Empty,
            1 => LineState::Loading,
            2 => LineState::Full,
            _ => panic!("corrupt cache-line archive"),
        };
        ar.field_u64("tag", &mut self.tag);
        ar.field_u64("access", &mut self.access);
        ar.field_u32("tokens", &mut self.tokens);
        ar.field_bool("dirty", &mut self.dirty);
        ar.field_bytes("data", &mut self.data);
        let mut valid: Vec<u8> = self.valid.iter().map(|&b| u8::from(b)).collect();
        ar.field_bytes("valid", &mut valid);
        for (v, b) in self.valid.iter_mut().zip(valid) {
            *v = b != 0;
        }
    }
}

pub(crate) fn apply_masked(dst: &mut [u8], src: &[u8], mask: &[bool]) {
    for i in 0..dst.len() {
        if mask[i] {
            dst[i] = src[i];
        }
    }
}

pub(crate) fn apply_masked_valid(dst: &mut [u8], valid: &mut [bool], src: &[u8], mask: &[bool]) {
    for i in 0..dst.len() {
        if mask[i] {
            dst[i] = src[i];
            valid[i] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::serialize::{BinReader, BinWriter, Persist};

    #[test]
    fn cache_line_archive_round_trip() {
        let mut line = CacheLine::new(8);
        line.state = LineState::Full;
        line.tag = 0x40;
        line.access = 17;
        line.tokens = 3;
        line.dirty = true;
        line.data.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        line.valid.fill(true);

        let mut writer = BinWriter::default();
        line.serialize(&mut writer);

        let mut restored = CacheLine::new(8);
        let mut reader = BinReader::new(writer.out);
        restored.serialize(&mut reader);
        assert_eq!(restored.state, LineState::Full);
        assert_eq!(restored.tag, 0x40);
        assert_eq!(restored.access, 17);
        assert_eq!(restored.tokens, 3);
        assert!(restored.dirty);
        assert_eq!(restored.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(restored.valid.iter().all(|&v| v));
    }

    #[test]
    fn loading_line_reports_pending_updates() {
        let mut line = CacheLine::new(4);
        assert_eq!(line.updating(), 0);
        line.acks.push_back((0, 1));
        line.acks.push_back((1, 2));
        assert_eq!(line.updating(), 2);
    }
}
