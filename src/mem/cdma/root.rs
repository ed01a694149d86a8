/*!
Root directory: the authoritative token owner for its address stripe and
the proxy to one DDR channel.

Line addresses are striped across the R roots by line index modulo R; when
a root talks to its DDR channel it first densifies the address so each
channel sees a contiguous space. A root line exists while the line is
anywhere in the system: LOADING while the initial read is in DDR, FULL
afterwards, deleted when an eviction returns the last token. Tokens parked
here by partial evictions are re-attached to passing requests.
*/

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::kernel::{ClockId, ProcessId, ServiceId, SimCtx, StepResult};
use crate::mem::cdma::message::{Message, MessageKind};
use crate::mem::ddr::{DdrChannel, DdrRequest};
use crate::mem::ring::{MsgId, NodeId, RingNode, Slab, MINSPACE_FORWARD, MINSPACE_SHORTCUT};
use crate::mem::store::SparseMemory;
use crate::mem::MemAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootLineState {
    Loading,
    Full,
}

#[derive(Debug)]
pub(crate) struct RootLine {
    pub state: RootLineState,
    /// Tokens parked at memory (accumulated from partial evictions).
    pub tokens: u32,
    /// While LOADING: the cache whose read created the line.
    pub sender: NodeId,
}

/// Work parked off the ring: queued DDR traffic and long-path re-entries.
#[derive(Debug, Clone)]
pub(crate) enum RootReq {
    Ring(MsgId),
    /// Timing charge for a write-through committed in passing.
    Flush(MemAddr),
}

pub(crate) struct RootDirectory {
    pub name: String,
    pub node: RingNode,
    id: usize,
    num_roots: usize,
    line_size: usize,
    total_tokens: u32,
    pub dir: BTreeMap<MemAddr, RootLine>,
    p_lines: ServiceId,
    requests: crate::kernel::BufferHandle<RootReq>,
    responses: crate::kernel::BufferHandle<MsgId>,
    active: VecDeque<MsgId>,
    pub channel: DdrChannel,
    msgs: Rc<RefCell<Slab<Message>>>,
    store: Rc<RefCell<SparseMemory>>,
    traces: Rc<RefCell<std::collections::BTreeSet<MemAddr>>>,
    pub nreads: u64,
    pub nwrites: u64,
}

pub(crate) struct RootProcessIds {
    pub incoming: ProcessId,
    pub requests: ProcessId,
    pub channel: ProcessId,
    pub ddr_done: ProcessId,
    pub responses: ProcessId,
    pub forward: ProcessId,
}

impl RootDirectory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &mut SimCtx,
        name: &str,
        clock: ClockId,
        node_id: NodeId,
        id: usize,
        num_roots: usize,
        line_size: usize,
        buffer_size: usize,
        channel: DdrChannel,
        msgs: Rc<RefCell<Slab<Message>>>,
        store: Rc<RefCell<SparseMemory>>,
        traces: Rc<RefCell<std::collections::BTreeSet<MemAddr>>>,
        pids: RootProcessIds,
    ) -> Self {
        let node = RingNode::new(ctx, name, clock, node_id, buffer_size);
        let requests = ctx.create_buffer::<RootReq>(
            &format!("{name}.b_requests"),
            clock,
            buffer_size.max(4),
            2,
        );
        let responses = ctx.create_buffer::<MsgId>(
            &format!("{name}.b_responses"),
            clock,
            buffer_size.max(2),
            1,
        );
        let p_lines = ctx.create_service(
            &format!("{name}.p_lines"),
            crate::kernel::Discipline::Priority,
        );
        ctx.sensitive(node.incoming.storage_id(), pids.incoming);
        ctx.sensitive(node.outgoing.storage_id(), pids.forward);
        ctx.sensitive(requests.storage_id(), pids.requests);
        ctx.sensitive(responses.storage_id(), pids.responses);
        ctx.sensitive(channel.requests_storage(), pids.channel);
        ctx.sensitive(channel.pipeline_storage(), pids.ddr_done);
        ctx.service_add(p_lines, pids.responses);
        ctx.service_add(p_lines, pids.incoming);
        ctx.add_trace(pids.incoming, requests.storage_id());
        ctx.add_trace(pids.incoming, node.outgoing.storage_id());
        ctx.add_trace(pids.requests, responses.storage_id());
        ctx.add_trace(pids.ddr_done, responses.storage_id());
        ctx.add_trace(pids.responses, node.outgoing.storage_id());
        RootDirectory {
            name: name.to_string(),
            node,
            id,
            num_roots,
            line_size,
            total_tokens: 0,
            dir: BTreeMap::new(),
            p_lines,
            requests,
            responses,
            active: VecDeque::new(),
            channel,
            msgs,
            store,
            traces,
            nreads: 0,
            nwrites: 0,
        }
    }

    pub fn set_total_tokens(&mut self, total: u32) {
        self.total_tokens = total;
    }

    pub fn is_local(&self, addr: MemAddr) -> bool {
        (addr / self.line_size as u64) % self.num_roots as u64 == self.id as u64
    }

    /// The address the DDR channel sees: striping folded out.
    fn dense_address(&self, addr: MemAddr) -> MemAddr {
        (addr / self.line_size as u64) / self.num_roots as u64 * self.line_size as u64
    }

    fn traced(&self, addr: MemAddr) -> bool {
        let traces = self.traces.borrow();
        !traces.is_empty() && traces.contains(&addr)
    }

    fn trace(&self, addr: MemAddr, what: &str) {
        if self.traced(addr) {
            log::trace!("{}: {:#x}: {}", self.name, addr, what);
        }
    }

    /// Forward on the top ring, falling back to the long path through the
    /// request queue with the ignore flag raised.
    fn forward_or_park(&mut self, ctx: &mut SimCtx, mid: MsgId) -> StepResult {
        if self.node.send(ctx, mid, MINSPACE_SHORTCUT) {
            return StepResult::Success;
        }
        if !self.requests.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            self.msgs.borrow_mut().get_mut(mid).ignore = true;
            self.requests.push(ctx, RootReq::Ring(mid), 0);
        }
        StepResult::Success
    }

    pub fn step_incoming(&mut self, ctx: &mut SimCtx) -> StepResult {
        let mid = self.node.incoming.front(ctx);
        let (kind, addr) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            debug_assert!(!m.ignore, "ignored message on the top ring");
            if self.traced(m.address) {
                log::trace!("{}: received {}", self.name, m.describe());
            }
            (m.kind, m.address)
        };

        let result = if self.is_local(addr) {
            if !self.p_lines.invoke(ctx) {
                return StepResult::Failed;
            }
            match kind {
                MessageKind::ReadRequest => self.on_read_request(ctx, mid, addr),
                MessageKind::RequestData => self.on_request_data(ctx, mid, addr),
                MessageKind::Eviction => self.on_eviction(ctx, mid, addr),
                MessageKind::Update => self.on_update(ctx, mid, addr),
                MessageKind::RequestDataToken => self.forward_or_park(ctx, mid),
            }
        } else {
            self.forward_or_park(ctx, mid)
        };
        if result == StepResult::Success {
            self.node.incoming.pop(ctx);
        }
        result
    }

    fn on_read_request(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        match self.dir.get(&addr) {
            None => {
                // First sight of this line: park the message and go to DDR.
                if !self.requests.can_push(ctx, 0) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.trace(addr, "read miss, queuing DDR fetch");
                    let sender = self.msgs.borrow().get(mid).sender;
                    self.dir.insert(
                        addr,
                        RootLine {
                            state: RootLineState::Loading,
                            tokens: 0,
                            sender,
                        },
                    );
                    self.requests.push(ctx, RootReq::Ring(mid), 0);
                }
                StepResult::Success
            }
            Some(line) if line.state == RootLineState::Full && line.tokens > 0 => {
                // Parked tokens: satisfy the request here instead of letting
                // it circle again.
                if ctx.committing() {
                    self.trace(addr, "attaching parked tokens to read");
                    let tokens = line.tokens;
                    {
                        let mut msgs = self.msgs.borrow_mut();
                        let m = msgs.get_mut(mid);
                        m.kind = MessageKind::RequestDataToken;
                        m.tokens = tokens;
                        m.dirty = false;
                        self.store.borrow().read(addr, &mut m.data);
                        m.mask.fill(true);
                    }
                    self.dir.get_mut(&addr).expect("line just seen").tokens = 0;
                }
                self.forward_or_park(ctx, mid)
            }
            Some(_) => {
                // Loading, or in caches: let it go around; a holder will
                // serve it.
                if ctx.committing() {
                    self.trace(addr, "read request circulating");
                }
                self.forward_or_park(ctx, mid)
            }
        }
    }

    fn on_request_data(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        let line_tokens = match self.dir.get(&addr) {
            None => None,
            Some(line) if line.state == RootLineState::Full => Some(line.tokens),
            Some(_) => Some(0),
        };
        match line_tokens {
            None => {
                // The last copy was evicted while this request was in
                // flight: reintroduce the full token budget, no DDR read.
                if ctx.committing() {
                    self.trace(addr, "reintroducing all tokens on data request");
                    let total = self.total_tokens;
                    {
                        let mut msgs = self.msgs.borrow_mut();
                        let m = msgs.get_mut(mid);
                        m.kind = MessageKind::RequestDataToken;
                        m.tokens = total;
                        // Bytes the request gathered win over backing store.
                        let mut from_store = vec![0; self.line_size];
                        self.store.borrow().read(addr, &mut from_store);
                        for b in 0..self.line_size {
                            if !m.mask[b] {
                                m.data[b] = from_store[b];
                                m.mask[b] = true;
                            }
                        }
                    }
                    self.dir.insert(
                        addr,
                        RootLine {
                            state: RootLineState::Full,
                            tokens: 0,
                            sender: 0,
                        },
                    );
                }
                self.forward_or_park(ctx, mid)
            }
            Some(tokens) if tokens > 0 => {
                if ctx.committing() {
                    self.trace(addr, "attaching parked tokens to data request");
                    {
                        let mut msgs = self.msgs.borrow_mut();
                        let m = msgs.get_mut(mid);
                        m.kind = MessageKind::RequestDataToken;
                        m.tokens += tokens;
                        let mut from_store = vec![0; self.line_size];
                        self.store.borrow().read(addr, &mut from_store);
                        for b in 0..self.line_size {
                            if !m.mask[b] {
                                m.data[b] = from_store[b];
                                m.mask[b] = true;
                            }
                        }
                    }
                    self.dir.get_mut(&addr).expect("line just seen").tokens = 0;
                }
                self.forward_or_park(ctx, mid)
            }
            Some(_) => self.forward_or_park(ctx, mid),
        }
    }

    fn on_eviction(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        let (msg_tokens, dirty) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.tokens, m.dirty)
        };
        let line = self
            .dir
            .get(&addr)
            .unwrap_or_else(|| panic!("{}: eviction for untracked line {addr:#x}", self.name));
        assert_eq!(line.state, RootLineState::Full, "eviction while loading");
        let tokens = msg_tokens + line.tokens;
        assert!(
            tokens <= self.total_tokens,
            "{}: token overflow at {addr:#x}",
            self.name
        );

        if tokens < self.total_tokens {
            // Park the tokens; the line is still live in some cache.
            if ctx.committing() {
                self.trace(addr, "parking eviction tokens");
                self.dir.get_mut(&addr).expect("line just seen").tokens = tokens;
                self.msgs.borrow_mut().free(mid);
            }
            StepResult::Success
        } else if dirty {
            // Last copy, modified: write back, then drop the line.
            if !self.requests.can_push(ctx, 0) {
                return StepResult::Failed;
            }
            if ctx.committing() {
                self.trace(addr, "last tokens, dirty: queueing writeback");
                self.requests.push(ctx, RootReq::Ring(mid), 0);
                self.dir.remove(&addr);
            }
            StepResult::Success
        } else {
            if ctx.committing() {
                self.trace(addr, "last tokens, clean: dropping line");
                self.msgs.borrow_mut().free(mid);
                self.dir.remove(&addr);
            }
            StepResult::Success
        }
    }

    /// Write-through of a passing update at its home root.
    fn on_update(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        if !self.requests.can_push(ctx, 1) {
            // Keep one slot for a possible long-path park of this message.
            return StepResult::Failed;
        }
        if ctx.committing() {
            self.trace(addr, "committing update to backing store");
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            self.store.borrow_mut().write(addr, &m.data, Some(&m.mask));
            drop(msgs);
            self.requests.push(ctx, RootReq::Flush(addr), 0);
        }
        self.forward_or_park(ctx, mid)
    }

    /// Drain the parked queue into the DDR channel (or back onto the ring
    /// for long-path re-entries).
    pub fn step_requests(&mut self, ctx: &mut SimCtx) -> StepResult {
        match self.requests.front(ctx) {
            RootReq::Ring(mid) => {
                let (kind, addr, ignore) = {
                    let msgs = self.msgs.borrow();
                    let m = msgs.get(mid);
                    (m.kind, m.address, m.ignore)
                };
                if ignore {
                    if !self.responses.push(ctx, mid, 0) {
                        return StepResult::Failed;
                    }
                    self.requests.pop(ctx);
                    return StepResult::Success;
                }
                match kind {
                    MessageKind::ReadRequest => {
                        let dense = self.dense_address(addr);
                        if !self.channel.try_request(
                            ctx,
                            DdrRequest {
                                write: false,
                                address: dense,
                            },
                        ) {
                            return StepResult::Failed;
                        }
                        if ctx.committing() {
                            self.active.push_back(mid);
                            self.nreads += 1;
                        }
                        self.requests.pop(ctx);
                        StepResult::Success
                    }
                    MessageKind::Eviction => {
                        let dense = self.dense_address(addr);
                        if !self.channel.try_request(
                            ctx,
                            DdrRequest {
                                write: true,
                                address: dense,
                            },
                        ) {
                            return StepResult::Failed;
                        }
                        if ctx.committing() {
                            let msgs = self.msgs.borrow();
                            let m = msgs.get(mid);
                            self.store.borrow_mut().write(addr, &m.data, None);
                            drop(msgs);
                            self.msgs.borrow_mut().free(mid);
                            self.nwrites += 1;
                        }
                        self.requests.pop(ctx);
                        StepResult::Success
                    }
                    _ => unreachable!("unexpected parked message"),
                }
            }
            RootReq::Flush(addr) => {
                let dense = self.dense_address(addr);
                if !self.channel.try_request(
                    ctx,
                    DdrRequest {
                        write: true,
                        address: dense,
                    },
                ) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    self.nwrites += 1;
                }
                self.requests.pop(ctx);
                StepResult::Success
            }
        }
    }

    pub fn step_channel(&mut self, ctx: &mut SimCtx) -> StepResult {
        self.channel.step_requests(ctx)
    }

    /// A DDR read finished: turn the parked read into a reply.
    pub fn step_ddr_done(&mut self, ctx: &mut SimCtx) -> StepResult {
        if self.channel.read_done(ctx).is_none() {
            return StepResult::Delayed;
        }
        if !self.responses.can_push(ctx, 0) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            let mid = self
                .active
                .pop_front()
                .expect("DDR completion without an active read");
            {
                let mut msgs = self.msgs.borrow_mut();
                let m = msgs.get_mut(mid);
                m.kind = MessageKind::RequestDataToken;
                m.dirty = false;
                self.store.borrow().read(m.address, &mut m.data);
                m.mask.fill(true);
            }
            self.responses.push(ctx, mid, 0);
        }
        self.channel.pop_done(ctx);
        StepResult::Success
    }

    /// Emit a finished reply (or a long-path re-entry) onto the ring.
    pub fn step_responses(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.responses.front(ctx);
        let (addr, ignore) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.address, m.ignore)
        };
        if !self.node.send(ctx, mid, MINSPACE_FORWARD) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            if !ignore {
                self.trace(addr, "sending read reply with all tokens");
                let total = self.total_tokens;
                let sender = {
                    let line = self.dir.get_mut(&addr).unwrap_or_else(|| {
                        panic!("reply for untracked line {addr:#x}")
                    });
                    assert_eq!(line.state, RootLineState::Loading, "reply for a loaded line");
                    let sender = line.sender;
                    line.state = RootLineState::Full;
                    line.tokens = 0;
                    sender
                };
                let mut msgs = self.msgs.borrow_mut();
                let m = msgs.get_mut(mid);
                // Fresh from memory: the reply owns every token.
                m.tokens = total;
                m.sender = sender;
            }
            self.msgs.borrow_mut().get_mut(mid).ignore = false;
        }
        self.responses.pop(ctx);
        StepResult::Success
    }

    pub fn step_forward(&mut self, ctx: &mut SimCtx) -> StepResult {
        self.node.step_forward(ctx)
    }

    /// Inspection dump.
    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "{}: {} lines, {} reads, {} writes", self.name, self.dir.len(), self.nreads, self.nwrites);
        for (addr, line) in &self.dir {
            let state = match line.state {
                RootLineState::Loading => format!("loading (for cache {})", line.sender),
                RootLineState::Full => format!("loaded, {} tokens parked", line.tokens),
            };
            let _ = writeln!(out, "  {addr:#018x} | {state}");
        }
    }
}
