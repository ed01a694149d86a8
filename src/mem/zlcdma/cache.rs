/*!
The L2 cache of the token-priority hierarchy.

Differences from the plain token cache: reads are served with a single
donated token (a dirty holder migrates the whole line instead), write
upgrades gather every token with `AcquireTokens` and invalidate the other
copies, racing writers are linearized by the priority token, and passing
evictions may be injected into a free way when the feature is enabled.
*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::kernel::{BufferHandle, ClockId, CycleNo, ProcessId, ServiceId, SimCtx, StepResult};
use crate::mem::ring::{MsgId, NodeId, RingNode, Slab, MINSPACE_FORWARD};
use crate::mem::selector::BankSelector;
use crate::mem::zlcdma::message::{BusRequest, Message, MessageKind};
use crate::mem::{ClientEntry, MemAddr, WClientId};

pub use crate::mem::cdma::cache::LineState;
use crate::mem::cdma::cache::{apply_masked, apply_masked_valid};

#[derive(Debug)]
pub(crate) struct CacheLine {
    pub state: LineState,
    pub tag: MemAddr,
    pub data: Vec<u8>,
    pub valid: Vec<bool>,
    pub access: CycleNo,
    pub tokens: u32,
    /// This line holds the priority token.
    pub priority: bool,
    pub dirty: bool,
    /// An `AcquireTokens` for this line is in flight.
    pub gathering: bool,
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
            priority: false,
            dirty: false,
            gathering: false,
            acks: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    pub read_accesses: u64,
    pub write_accesses: u64,
    pub read_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub injections: u64,
    pub merged_writes: u64,
}

pub(crate) struct Cache {
    pub name: String,
    pub node: RingNode,
    sets: usize,
    assoc: usize,
    line_size: usize,
    total_tokens: u32,
    inject: bool,
    pub lines: Vec<CacheLine>,
    selector: Rc<BankSelector>,
    msgs: Rc<RefCell<Slab<Message>>>,
    pub clients: Rc<RefCell<Vec<ClientEntry>>>,
    pub requests: BufferHandle<BusRequest>,
    responses: BufferHandle<(MemAddr, Vec<u8>)>,
    p_lines: ServiceId,
    pub p_bus: ServiceId,
    pub stats: CacheStats,
}

pub(crate) struct CacheProcessIds {
    pub requests: ProcessId,
    pub incoming: ProcessId,
    pub responses: ProcessId,
    pub forward: ProcessId,
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
        inject: bool,
        selector: Rc<BankSelector>,
        msgs: Rc<RefCell<Slab<Message>>>,
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
        ctx.add_trace(pids.incoming, node.outgoing.storage_id());
        ctx.add_trace(pids.incoming, responses.storage_id());
        Cache {
            name: name.to_string(),
            node,
            sets,
            assoc,
            line_size,
            total_tokens: 0,
            inject,
            lines: (0..sets * assoc).map(|_| CacheLine::new(line_size)).collect(),
            selector,
            msgs,
            clients: Rc::new(RefCell::new(Vec::new())),
            requests,
            responses,
            p_lines,
            p_bus,
            stats: CacheStats::default(),
        }
    }

    pub fn set_total_tokens(&mut self, total: u32) {
        self.total_tokens = total;
    }

    pub fn find_line(&self, addr: MemAddr) -> Option<usize> {
        let (tag, set) = self.selector.map(addr / self.line_size as u64);
        debug_assert!(set < self.sets);
        (0..self.assoc)
            .map(|way| set * self.assoc + way)
            .find(|&i| self.lines[i].state != LineState::Empty && self.lines[i].tag == tag)
    }

    fn pick_victim(&self, set: usize) -> Option<usize> {
        let ways = || (0..self.assoc).map(|w| set * self.assoc + w);
        if let Some(i) = ways().find(|&i| self.lines[i].state == LineState::Empty) {
            return Some(i);
        }
        ways()
            .filter(|&i| {
                let line = &self.lines[i];
                line.state == LineState::Full && line.acks.is_empty() && !line.gathering
            })
            .min_by_key(|&i| self.lines[i].access)
    }

    fn empty_way(&self, set: usize) -> Option<usize> {
        (0..self.assoc)
            .map(|w| set * self.assoc + w)
            .find(|&i| self.lines[i].state == LineState::Empty)
    }

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
                    self.responses
                        .push(ctx, (req.address, self.lines[i].data.clone()), 0);
                    self.lines[i].access = ctx.now();
                    self.stats.read_accesses += 1;
                    self.stats.read_hits += 1;
                }
                StepResult::Success
            }
            Some((_, LineState::Loading)) => {
                if ctx.committing() {
                    self.stats.read_accesses += 1;
                }
                StepResult::Success
            }
            _ => {
                let (tag, set) = self.selector.map(req.address / self.line_size as u64);
                let Some(victim) = self.pick_victim(set) else {
                    return StepResult::Failed;
                };
                let evicting = self.lines[victim].state == LineState::Full;
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
                    self.reset_line(ctx, victim, tag);
                    let msg =
                        Message::new(MessageKind::Read, req.address, self.node.id, self.line_size);
                    let mid = self.msgs.borrow_mut().alloc(msg);
                    self.node.send(ctx, mid, 0);
                    self.stats.read_accesses += 1;
                    self.stats.misses += 1;
                }
                StepResult::Success
            }
        }
    }

    fn on_write_request(&mut self, ctx: &mut SimCtx, req: &BusRequest) -> StepResult {
        match self.find_line(req.address).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Full)) => {
                if self.lines[i].tokens == self.total_tokens {
                    if ctx.committing() {
                        self.ack_write(req.client, req.wid);
                        self.snoop_local(req);
                        let line = &mut self.lines[i];
                        apply_masked(&mut line.data, &req.data.data, &req.data.mask);
                        line.dirty = true;
                        line.access = ctx.now();
                        self.stats.write_accesses += 1;
                    }
                    StepResult::Success
                } else if self.lines[i].gathering {
                    // Fold into the acquisition already in flight.
                    if ctx.committing() {
                        self.snoop_local(req);
                        let line = &mut self.lines[i];
                        apply_masked(&mut line.data, &req.data.data, &req.data.mask);
                        line.acks.push_back((req.client, req.wid));
                        self.stats.write_accesses += 1;
                    }
                    StepResult::Success
                } else {
                    if !self.node.outgoing.can_push(ctx, 0) {
                        return StepResult::Failed;
                    }
                    if ctx.committing() {
                        self.snoop_local(req);
                        let priority = self.lines[i].priority;
                        let line = &mut self.lines[i];
                        apply_masked(&mut line.data, &req.data.data, &req.data.mask);
                        line.access = ctx.now();
                        line.acks.push_back((req.client, req.wid));
                        line.gathering = true;
                        let mut msg = Message::new(
                            MessageKind::AcquireTokens,
                            req.address,
                            self.node.id,
                            self.line_size,
                        );
                        msg.merge_bytes(&req.data.data, &req.data.mask);
                        msg.priority = priority;
                        let mid = self.msgs.borrow_mut().alloc(msg);
                        self.node.send(ctx, mid, 0);
                        self.stats.write_accesses += 1;
                    }
                    StepResult::Success
                }
            }
            Some((i, LineState::Loading)) => {
                if ctx.committing() {
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
            _ => {
                // Write miss: allocate and gather data and tokens at once.
                let (tag, set) = self.selector.map(req.address / self.line_size as u64);
                let Some(victim) = self.pick_victim(set) else {
                    return StepResult::Failed;
                };
                let evicting = self.lines[victim].state == LineState::Full;
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
                    self.reset_line(ctx, victim, tag);
                    {
                        let line = &mut self.lines[victim];
                        apply_masked_valid(
                            &mut line.data,
                            &mut line.valid,
                            &req.data.data,
                            &req.data.mask,
                        );
                        line.acks.push_back((req.client, req.wid));
                        line.gathering = true;
                    }
                    self.snoop_local(req);
                    let mut msg = Message::new(
                        MessageKind::AcquireTokens,
                        req.address,
                        self.node.id,
                        self.line_size,
                    );
                    msg.merge_bytes(&req.data.data, &req.data.mask);
                    let mid = self.msgs.borrow_mut().alloc(msg);
                    self.node.send(ctx, mid, 0);
                    self.stats.write_accesses += 1;
                    self.stats.misses += 1;
                }
                StepResult::Success
            }
        }
    }

    /// Commit-phase line reset into LOADING.
    fn reset_line(&mut self, ctx: &mut SimCtx, index: usize, tag: MemAddr) {
        let line = &mut self.lines[index];
        line.state = LineState::Loading;
        line.tag = tag;
        line.tokens = 0;
        line.priority = false;
        line.dirty = false;
        line.gathering = false;
        line.data.fill(0);
        line.valid.fill(false);
        line.access = ctx.now();
        line.acks.clear();
    }

    fn evict_line(&mut self, ctx: &mut SimCtx, index: usize) {
        let addr = self.line_address(index);
        let line = &self.lines[index];
        let mut msg = Message::new(MessageKind::Eviction, addr, self.node.id, self.line_size);
        msg.tokens = line.tokens;
        msg.priority = line.priority;
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

    fn invalidate_line(&mut self, index: usize) {
        let addr = self.line_address(index);
        for entry in self.clients.borrow().iter() {
            if let Some(cb) = &entry.callback {
                cb.borrow_mut().on_memory_invalidated(addr);
            }
        }
        self.lines[index].state = LineState::Empty;
    }

    fn ack_write(&self, client: usize, wid: WClientId) {
        if let Some(cb) = &self.clients.borrow()[client].callback {
            cb.borrow_mut().on_memory_write_completed(wid);
        }
    }

    fn ack_all(&mut self, index: usize) {
        let acks: Vec<_> = self.lines[index].acks.drain(..).collect();
        for (client, wid) in acks {
            self.ack_write(client, wid);
        }
    }

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

    /// Report a token delta invisible to boundary accounting.
    fn notify_local_dir(&mut self, ctx: &mut SimCtx, addr: MemAddr, tokens: u32, debit: bool) {
        if tokens == 0 {
            return;
        }
        let mut msg =
            Message::new(MessageKind::LocalDirNotification, addr, self.node.id, 0);
        msg.tokens = tokens;
        msg.debit = debit;
        let mid = self.msgs.borrow_mut().alloc(msg);
        self.node.send(ctx, mid, 0);
    }

    // -- responses and forwarding ------------------------------------------

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

    pub fn step_forward(&mut self, ctx: &mut SimCtx) -> StepResult {
        self.node.step_forward(ctx)
    }

    // -- ring side ----------------------------------------------------------

    pub fn step_incoming(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.node.incoming.front(ctx);
        let (kind, ignore) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            log::trace!("{}: snooping {}", self.name, m.describe());
            (m.kind, m.ignore)
        };
        let result = if ignore {
            self.forward(ctx, mid)
        } else {
            match kind {
                MessageKind::Read => self.on_read_snoop(ctx, mid),
                MessageKind::AcquireTokens => self.on_acquire_snoop(ctx, mid),
                MessageKind::Eviction => self.on_eviction_snoop(ctx, mid),
                MessageKind::LocalDirNotification => self.forward(ctx, mid),
            }
        };
        if result == StepResult::Success {
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

    fn on_read_snoop(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        let (addr, sender, reply) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.address, m.sender, m.is_reply())
        };

        if sender == self.node.id {
            if reply {
                return self.on_read_reply(ctx, mid, addr);
            }
            match self.find_line(addr).map(|i| self.lines[i].state) {
                Some(LineState::Full) => {
                    // Satisfied meanwhile (injection); drop the request.
                    if ctx.committing() {
                        self.msgs.borrow_mut().free(mid);
                    }
                    StepResult::Success
                }
                _ => self.forward(ctx, mid),
            }
        } else {
            if reply {
                // A reply in transit to someone else; hands off.
                return self.forward(ctx, mid);
            }
            let Some(i) = self.find_line(addr) else {
                return self.forward(ctx, mid);
            };
            if self.lines[i].state != LineState::Full {
                return self.forward(ctx, mid);
            }
            if self.lines[i].dirty {
                // Sole owner of modified data: migrate everything.
                if ctx.committing() {
                    {
                        let line = &self.lines[i];
                        let mut msgs = self.msgs.borrow_mut();
                        let m = msgs.get_mut(mid);
                        m.tokens = line.tokens;
                        m.priority = line.priority;
                        m.dirty = true;
                        m.data = line.data.clone();
                        m.mask = vec![true; self.line_size];
                    }
                    self.invalidate_line(i);
                }
                self.forward(ctx, mid)
            } else if self.lines[i].tokens >= 2 {
                // Donate one token with the data; priority stays home.
                if ctx.committing() {
                    {
                        let line = &self.lines[i];
                        let mut msgs = self.msgs.borrow_mut();
                        let m = msgs.get_mut(mid);
                        m.tokens = 1;
                        m.data = line.data.clone();
                        m.mask = vec![true; self.line_size];
                    }
                    self.lines[i].tokens -= 1;
                }
                self.forward(ctx, mid)
            } else {
                self.forward(ctx, mid)
            }
        }
    }

    /// Our read came home with data and tokens.
    fn on_read_reply(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        match self.find_line(addr).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Loading)) => self.fill_line(ctx, i, mid),
            Some((i, LineState::Full)) => {
                if ctx.committing() {
                    let (tokens, priority, dirty) = {
                        let msgs = self.msgs.borrow();
                        let m = msgs.get(mid);
                        (m.tokens, m.priority, m.dirty)
                    };
                    let line = &mut self.lines[i];
                    line.tokens += tokens;
                    line.priority |= priority;
                    line.dirty |= dirty;
                    self.msgs.borrow_mut().free(mid);
                }
                StepResult::Success
            }
            _ => {
                // Line evicted while the reply was in flight.
                if ctx.committing() {
                    self.msgs.borrow_mut().get_mut(mid).kind = MessageKind::Eviction;
                }
                self.forward(ctx, mid)
            }
        }
    }

    fn fill_line(&mut self, ctx: &mut SimCtx, i: usize, mid: MsgId) -> StepResult {
        if !self.responses.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        let needs_acquire = {
            let msgs = self.msgs.borrow();
            !self.lines[i].acks.is_empty()
                && !self.lines[i].gathering
                && self.lines[i].tokens + msgs.get(mid).tokens < self.total_tokens
        };
        if needs_acquire && !self.node.outgoing.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let addr;
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
                line.priority |= m.priority;
                line.dirty |= m.dirty;
                line.state = LineState::Full;
                line.access = ctx.now();
            }
            self.responses.push(ctx, (addr, self.lines[i].data.clone()), 0);
            if !self.lines[i].acks.is_empty() && !self.lines[i].gathering {
                if self.lines[i].tokens == self.total_tokens {
                    self.lines[i].dirty = true;
                    self.ack_all(i);
                } else {
                    let priority = self.lines[i].priority;
                    let written = self.lines[i].valid.clone();
                    let mut msg =
                        Message::new(MessageKind::AcquireTokens, addr, self.node.id, self.line_size);
                    msg.merge_bytes(&self.lines[i].data, &written);
                    msg.priority = priority;
                    let amid = self.msgs.borrow_mut().alloc(msg);
                    self.node.send(ctx, amid, 0);
                    self.lines[i].gathering = true;
                }
            }
            self.msgs.borrow_mut().free(mid);
        }
        StepResult::Success
    }

    fn on_acquire_snoop(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        let (addr, sender) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.address, m.sender)
        };
        if sender == self.node.id {
            return self.on_acquire_return(ctx, mid, addr);
        }

        let Some(i) = self.find_line(addr) else {
            return self.forward(ctx, mid);
        };
        if self.lines[i].state != LineState::Full {
            return self.forward(ctx, mid);
        }
        // Room for the forwarded message plus a possible accounting
        // notification.
        if !self.node.outgoing.can_push(ctx, 1) {
            return StepResult::Failed;
        }

        let our_priority = self.lines[i].priority;
        let our_pending = self.lines[i].gathering || !self.lines[i].acks.is_empty();
        let msg_priority = self.msgs.borrow().get(mid).priority;

        if our_pending && our_priority {
            // We linearize: absorb the passing acquisition. Its bytes apply
            // before ours persist... their write is ordered first, ours
            // stays pending on our own message.
            if ctx.committing() {
                let (tokens, transient, data, mask) = {
                    let msgs = self.msgs.borrow();
                    let m = msgs.get(mid);
                    (m.tokens, m.transient, m.data.clone(), m.mask.clone())
                };
                let line = &mut self.lines[i];
                apply_masked(&mut line.data, &data, &mask);
                line.tokens += tokens;
                {
                    let mut msgs = self.msgs.borrow_mut();
                    let m = msgs.get_mut(mid);
                    m.tokens = 0;
                    m.transient = false;
                    m.merged = true;
                    // Hand the loser our current bytes so its clients read
                    // the merged result.
                    m.data = self.lines[i].data.clone();
                    m.mask = vec![true; self.line_size];
                }
                if transient {
                    self.notify_local_dir(ctx, addr, tokens, false);
                }
                self.stats.merged_writes += 1;
            }
            return self.forward(ctx, mid);
        }

        if our_pending && !msg_priority && !our_priority {
            // Two non-priority gatherers: neither yields; the priority
            // token settles the race elsewhere.
            if ctx.committing() {
                let line = &self.lines[i];
                let mut msgs = self.msgs.borrow_mut();
                msgs.get_mut(mid).merge_bytes(&line.data, &line.valid);
            }
            return self.forward(ctx, mid);
        }

        // Surrender the copy: tokens and newer bytes move onto the message.
        if ctx.committing() {
            let line_tokens = self.lines[i].tokens;
            let line_priority = self.lines[i].priority;
            let was_transient = self.msgs.borrow().get(mid).transient;
            {
                let line = &self.lines[i];
                let mut msgs = self.msgs.borrow_mut();
                let m = msgs.get_mut(mid);
                m.merge_bytes(&line.data, &line.valid);
                m.tokens += line_tokens;
                m.priority |= line_priority;
                if m.priority {
                    m.transient = false;
                } else {
                    m.transient = true;
                }
            }
            if our_pending {
                // Our own write loses the race but its bytes are already on
                // the winner's message; acknowledge and stand down.
                self.ack_all(i);
                self.stats.merged_writes += 1;
            }
            self.invalidate_line(i);
            let now_priority = self.msgs.borrow().get(mid).priority;
            if was_transient && now_priority {
                // Tokens that entered this ring untracked just became
                // permanent.
                let converted = self.msgs.borrow().get(mid).tokens - line_tokens;
                self.notify_local_dir(ctx, addr, converted, false);
            } else if !now_priority {
                // Our counted tokens leave on a transient message.
                self.notify_local_dir(ctx, addr, line_tokens, true);
            }
        }
        self.forward(ctx, mid)
    }

    /// Our acquisition came home.
    fn on_acquire_return(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        let (tokens, priority, transient, merged) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.tokens, m.priority, m.transient, m.merged)
        };
        let line_index = self.find_line(addr);

        if merged {
            // A priority holder took our write; acknowledge and send our
            // remaining tokens after it.
            let Some(i) = line_index else {
                if ctx.committing() {
                    self.msgs.borrow_mut().free(mid);
                }
                return StepResult::Success;
            };
            if !self.node.outgoing.can_push(ctx, 0) {
                return StepResult::Failed;
            }
            if ctx.committing() {
                {
                    let data = {
                        let msgs = self.msgs.borrow();
                        msgs.get(mid).data.clone()
                    };
                    let line = &mut self.lines[i];
                    line.data.copy_from_slice(&data);
                    line.valid.fill(true);
                    line.gathering = false;
                }
                self.ack_all(i);
                self.evict_line(ctx, i);
                self.msgs.borrow_mut().free(mid);
            }
            return StepResult::Success;
        }

        let Some(i) = line_index else {
            // Invalidated while gathering: the collected tokens drift home
            // as an eviction. A transient load becoming permanent must be
            // reported before it leaves the ring.
            if transient && !self.node.outgoing.can_push(ctx, 1) {
                return StepResult::Failed;
            }
            if ctx.committing() {
                if transient {
                    self.notify_local_dir(ctx, addr, tokens, false);
                }
                let mut msgs = self.msgs.borrow_mut();
                let m = msgs.get_mut(mid);
                m.kind = MessageKind::Eviction;
                m.transient = false;
                m.merged = false;
            }
            return self.forward(ctx, mid);
        };

        if transient && !priority && !self.lines[i].priority {
            // Nothing here can convert them; keep circulating.
            return self.forward(ctx, mid);
        }

        // Decide on pre-update state so Check and Commit agree.
        let complete = self.lines[i].tokens + tokens >= self.total_tokens;

        if self.lines[i].state == LineState::Loading {
            // Write miss still gathering. A loading line cannot hold
            // tokens, so either everything arrived and the line fills, or
            // the message keeps lapping the rings.
            if !complete {
                return self.forward(ctx, mid);
            }
            if !self.responses.can_push(ctx, 0) {
                return StepResult::Failed;
            }
            if transient && !self.node.outgoing.can_push(ctx, 0) {
                return StepResult::Failed;
            }
            if ctx.committing() {
                if transient {
                    self.notify_local_dir(ctx, addr, tokens, false);
                }
                {
                    let msgs = self.msgs.borrow();
                    let m = msgs.get(mid);
                    let line = &mut self.lines[i];
                    for b in 0..line.data.len() {
                        if !line.valid[b] {
                            line.data[b] = m.data[b];
                        }
                        line.valid[b] = true;
                    }
                    line.tokens += m.tokens;
                    line.priority |= m.priority;
                    line.state = LineState::Full;
                    line.dirty = true;
                    line.gathering = false;
                    line.access = ctx.now();
                }
                self.responses
                    .push(ctx, (addr, self.lines[i].data.clone()), 0);
                self.ack_all(i);
                self.msgs.borrow_mut().free(mid);
            }
            return StepResult::Success;
        }

        let reissue = !complete;
        let pushes = usize::from(transient) + usize::from(reissue);
        if pushes > 0 && !self.node.outgoing.can_push(ctx, pushes - 1) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            if transient {
                // Converted by our priority token: the ring gains tokens the
                // directory never counted in.
                self.notify_local_dir(ctx, addr, tokens, false);
            }
            {
                let line = &mut self.lines[i];
                line.tokens += tokens;
                line.priority |= priority;
            }
            self.msgs.borrow_mut().free(mid);
            if complete {
                let line = &mut self.lines[i];
                line.gathering = false;
                line.dirty = true;
                self.ack_all(i);
            } else {
                // Some tokens are still adrift; try again.
                let priority_now = self.lines[i].priority;
                let written = self.lines[i].valid.clone();
                let mut msg =
                    Message::new(MessageKind::AcquireTokens, addr, self.node.id, self.line_size);
                msg.merge_bytes(&self.lines[i].data, &written);
                msg.priority = priority_now;
                let amid = self.msgs.borrow_mut().alloc(msg);
                self.node.send(ctx, amid, 0);
            }
        }
        StepResult::Success
    }

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
                "  way {:3} | {:#018x} | {state} | {:2} tokens{}{}{}",
                i,
                self.line_address(i),
                line.tokens,
                if line.priority { " P" } else { "" },
                if line.dirty { " dirty" } else { "" },
                if line.gathering { " gathering" } else { "" },
            );
        }
    }

    fn on_eviction_snoop(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        let addr = self.msgs.borrow().get(mid).address;
        match self.find_line(addr).map(|i| (i, self.lines[i].state)) {
            Some((i, LineState::Full)) => {
                if ctx.committing() {
                    let (tokens, priority, dirty) = {
                        let msgs = self.msgs.borrow();
                        let m = msgs.get(mid);
                        (m.tokens, m.priority, m.dirty)
                    };
                    let line = &mut self.lines[i];
                    line.tokens += tokens;
                    line.priority |= priority;
                    if dirty {
                        let data = self.msgs.borrow().get(mid).data.clone();
                        self.lines[i].data.copy_from_slice(&data);
                        self.lines[i].dirty = true;
                    }
                    self.msgs.borrow_mut().free(mid);
                }
                StepResult::Success
            }
            Some((i, LineState::Loading)) => self.fill_line(ctx, i, mid),
            _ => {
                if self.inject {
                    let (_, set) = self.selector.map(addr / self.line_size as u64);
                    if let Some(i) = self.empty_way(set) {
                        // Keep the line on chip instead of letting it sink
                        // to memory.
                        if ctx.committing() {
                            let (tag, _) = self.selector.map(addr / self.line_size as u64);
                            self.reset_line(ctx, i, tag);
                            let msgs = self.msgs.borrow();
                            let m = msgs.get(mid);
                            let line = &mut self.lines[i];
                            line.data.copy_from_slice(&m.data);
                            line.valid.fill(true);
                            line.tokens = m.tokens;
                            line.priority = m.priority;
                            line.dirty = m.dirty;
                            line.state = LineState::Full;
                            drop(msgs);
                            self.msgs.borrow_mut().free(mid);
                            self.stats.injections += 1;
                        }
                        return StepResult::Success;
                    }
                }
                self.forward(ctx, mid)
            }
        }
    }
}
