/*!
Root directory of the token-priority hierarchy.

Owns its address stripe's token budget, including the single priority
token, and fronts one DDR channel. A read for a line that is nowhere in
the system fetches the data and grants all T tokens plus priority; tokens
and priority returned by partial evictions are parked here and re-attached
to the next passing request.
*/

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::kernel::{ClockId, ProcessId, ServiceId, SimCtx, StepResult};
use crate::mem::ddr::{DdrChannel, DdrRequest};
use crate::mem::ring::{MsgId, NodeId, RingNode, Slab, MINSPACE_FORWARD, MINSPACE_SHORTCUT};
use crate::mem::store::SparseMemory;
use crate::mem::zlcdma::message::{Message, MessageKind};
use crate::mem::MemAddr;

pub use crate::mem::cdma::root::RootLineState;

#[derive(Debug)]
pub(crate) struct RootLine {
    pub state: RootLineState,
    pub tokens: u32,
    /// The priority token is parked here.
    pub priority: bool,
    pub sender: NodeId,
}

#[derive(Debug, Clone)]
pub(crate) enum RootReq {
    Ring(MsgId),
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

    fn dense_address(&self, addr: MemAddr) -> MemAddr {
        (addr / self.line_size as u64) / self.num_roots as u64 * self.line_size as u64
    }

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

    /// Attach the parked tokens (and priority) plus backing-store bytes to
    /// a passing request. Commit phase only.
    fn attach_parked(&mut self, mid: MsgId, addr: MemAddr) {
        let line = self.dir.get_mut(&addr).expect("attach without a line");
        let tokens = line.tokens;
        let priority = line.priority;
        line.tokens = 0;
        line.priority = false;
        let mut from_store = vec![0; self.line_size];
        self.store.borrow().read(addr, &mut from_store);
        let mut msgs = self.msgs.borrow_mut();
        let m = msgs.get_mut(mid);
        m.tokens += tokens;
        m.priority |= priority;
        if m.priority {
            m.transient = false;
        }
        for b in 0..self.line_size {
            if !m.mask[b] {
                m.data[b] = from_store[b];
                m.mask[b] = true;
            }
        }
    }

    pub fn step_incoming(&mut self, ctx: &mut SimCtx) -> StepResult {
        let mid = self.node.incoming.front(ctx);
        let (kind, addr) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            debug_assert!(!m.ignore, "ignored message on the top ring");
            (m.kind, m.address)
        };

        let result = if self.is_local(addr) {
            if !self.p_lines.invoke(ctx) {
                return StepResult::Failed;
            }
            match kind {
                MessageKind::Read => self.on_read(ctx, mid, addr),
                MessageKind::AcquireTokens => self.on_acquire(ctx, mid, addr),
                MessageKind::Eviction => self.on_eviction(ctx, mid, addr),
                MessageKind::LocalDirNotification => {
                    unreachable!("notification on the top ring")
                }
            }
        } else {
            self.forward_or_park(ctx, mid)
        };
        if result == StepResult::Success {
            self.node.incoming.pop(ctx);
        }
        result
    }

    fn on_read(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        if self.msgs.borrow().get(mid).is_reply() {
            // A granted reply passing home on its way to the sender.
            return self.forward_or_park(ctx, mid);
        }
        match self.dir.get(&addr) {
            None => {
                if !self.requests.can_push(ctx, 0) {
                    return StepResult::Failed;
                }
                if ctx.committing() {
                    let sender = self.msgs.borrow().get(mid).sender;
                    self.dir.insert(
                        addr,
                        RootLine {
                            state: RootLineState::Loading,
                            tokens: 0,
                            priority: false,
                            sender,
                        },
                    );
                    self.requests.push(ctx, RootReq::Ring(mid), 0);
                }
                StepResult::Success
            }
            Some(line) if line.state == RootLineState::Full && line.tokens > 0 => {
                if ctx.committing() {
                    self.attach_parked(mid, addr);
                }
                self.forward_or_park(ctx, mid)
            }
            Some(_) => self.forward_or_park(ctx, mid),
        }
    }

    fn on_acquire(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        match self.dir.get(&addr) {
            None => {
                // Write miss with the line nowhere in the system: grant the
                // whole budget from here, no DDR fetch needed for data the
                // writer will overwrite; the rest comes from the store.
                if ctx.committing() {
                    let total = self.total_tokens;
                    let mut from_store = vec![0; self.line_size];
                    self.store.borrow().read(addr, &mut from_store);
                    {
                        let mut msgs = self.msgs.borrow_mut();
                        let m = msgs.get_mut(mid);
                        m.tokens += total;
                        m.priority = true;
                        m.transient = false;
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
                            priority: false,
                            sender: 0,
                        },
                    );
                }
                self.forward_or_park(ctx, mid)
            }
            Some(line) if line.state == RootLineState::Full && line.tokens > 0 => {
                if ctx.committing() {
                    self.attach_parked(mid, addr);
                }
                self.forward_or_park(ctx, mid)
            }
            Some(_) => self.forward_or_park(ctx, mid),
        }
    }

    fn on_eviction(&mut self, ctx: &mut SimCtx, mid: MsgId, addr: MemAddr) -> StepResult {
        let (msg_tokens, msg_priority, dirty) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.tokens, m.priority, m.dirty)
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
            if ctx.committing() {
                let line = self.dir.get_mut(&addr).expect("line just seen");
                line.tokens = tokens;
                line.priority |= msg_priority;
                if dirty {
                    let msgs = self.msgs.borrow();
                    let m = msgs.get(mid);
                    self.store.borrow_mut().write(addr, &m.data, None);
                }
                self.msgs.borrow_mut().free(mid);
            }
            StepResult::Success
        } else if dirty {
            if !self.requests.can_push(ctx, 0) {
                return StepResult::Failed;
            }
            if ctx.committing() {
                self.requests.push(ctx, RootReq::Ring(mid), 0);
                self.dir.remove(&addr);
            }
            StepResult::Success
        } else {
            if ctx.committing() {
                self.msgs.borrow_mut().free(mid);
                self.dir.remove(&addr);
            }
            StepResult::Success
        }
    }

    pub fn step_requests(&mut self, ctx: &mut SimCtx) -> StepResult {
        let RootReq::Ring(mid) = self.requests.front(ctx);
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
            MessageKind::Read => {
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
                    {
                        let msgs = self.msgs.borrow();
                        let m = msgs.get(mid);
                        self.store.borrow_mut().write(addr, &m.data, None);
                    }
                    self.msgs.borrow_mut().free(mid);
                    self.nwrites += 1;
                }
                self.requests.pop(ctx);
                StepResult::Success
            }
            _ => unreachable!("unexpected parked message"),
        }
    }

    pub fn step_channel(&mut self, ctx: &mut SimCtx) -> StepResult {
        self.channel.step_requests(ctx)
    }

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
                let mut data = vec![0; self.line_size];
                self.store.borrow().read(m.address, &mut data);
                // Bytes merged from caches on the way in are newer.
                for b in 0..self.line_size {
                    if !m.mask[b] {
                        m.data[b] = data[b];
                        m.mask[b] = true;
                    }
                }
                m.dirty = false;
            }
            self.responses.push(ctx, mid, 0);
        }
        self.channel.pop_done(ctx);
        StepResult::Success
    }

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
                let total = self.total_tokens;
                let sender = {
                    let line = self.dir.get_mut(&addr).unwrap_or_else(|| {
                        panic!("reply for untracked line {addr:#x}")
                    });
                    assert_eq!(line.state, RootLineState::Loading);
                    let sender = line.sender;
                    line.state = RootLineState::Full;
                    line.tokens = 0;
                    line.priority = false;
                    sender
                };
                let mut msgs = self.msgs.borrow_mut();
                let m = msgs.get_mut(mid);
                // First fetch: the reply carries the whole budget and the
                // priority token.
                m.tokens = total;
                m.priority = true;
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
}
