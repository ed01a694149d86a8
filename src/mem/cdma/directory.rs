/*!
Subring directory.

Sits between a bottom ring of caches and the top ring, holding one token
counter per address: the number of tokens currently inside its subring. A
counter exists only while the subring holds at least one token.

Both interfaces update the counter and forward through a single arbitrated
service, so the counter and the routing decision always move together; the
counter may only be out of date while a message is in flight across the
boundary, and is consistent again before any dependent event.

Routing downward prefers the shortcut across the top ring when the subring
holds no copy; when the shortcut is blocked the message takes the long way
through the bottom ring with its `ignore` flag raised, and the flag drops
when it comes back up.
*/

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::ConfigError;
use crate::kernel::{ClockId, ProcessId, ServiceId, SimCtx, StepResult};
use crate::mem::cdma::message::{Message, MessageKind};
use crate::mem::ring::{MsgId, NodeId, RingNode, Slab, MINSPACE_FORWARD, MINSPACE_SHORTCUT};
use crate::mem::MemAddr;

pub(crate) struct Directory {
    pub name: String,
    pub bottom: RingNode,
    pub top: RingNode,
    /// Line address -> tokens inside the subring.
    pub dir: BTreeMap<MemAddr, u32>,
    first_node: NodeId,
    last_node: NodeId,
    max_lines: usize,
    p_lines: ServiceId,
    msgs: Rc<RefCell<Slab<Message>>>,
}

pub(crate) struct DirectoryProcessIds {
    pub in_bottom: ProcessId,
    pub in_top: ProcessId,
    pub fwd_bottom: ProcessId,
    pub fwd_top: ProcessId,
}

impl Directory {
    pub fn new(
        ctx: &mut SimCtx,
        name: &str,
        clock: ClockId,
        bottom_id: NodeId,
        top_id: NodeId,
        buffer_size: usize,
        msgs: Rc<RefCell<Slab<Message>>>,
        pids: DirectoryProcessIds,
    ) -> Self {
        let bottom = RingNode::new(ctx, &format!("{name}.bottom"), clock, bottom_id, buffer_size);
        let top = RingNode::new(ctx, &format!("{name}.top"), clock, top_id, buffer_size);
        let p_lines = ctx.create_service(
            &format!("{name}.p_lines"),
            crate::kernel::Discipline::Priority,
        );
        ctx.sensitive(bottom.incoming.storage_id(), pids.in_bottom);
        ctx.sensitive(top.incoming.storage_id(), pids.in_top);
        ctx.sensitive(bottom.outgoing.storage_id(), pids.fwd_bottom);
        ctx.sensitive(top.outgoing.storage_id(), pids.fwd_top);
        ctx.service_add(p_lines, pids.in_top);
        ctx.service_add(p_lines, pids.in_bottom);
        ctx.add_trace(pids.in_bottom, top.outgoing.storage_id());
        ctx.add_trace(pids.in_top, bottom.outgoing.storage_id());
        ctx.add_trace(pids.in_top, top.outgoing.storage_id());
        Directory {
            name: name.to_string(),
            bottom,
            top,
            dir: BTreeMap::new(),
            first_node: 0,
            last_node: 0,
            max_lines: 0,
            p_lines,
            msgs,
        }
    }

    /// Record the subring's cache id range. The ids must be contiguous so
    /// membership stays a constant-time range check.
    pub fn set_range(&mut self, first: NodeId, last: NodeId, max_lines: usize) -> Result<(), ConfigError> {
        if first > last {
            return Err(ConfigError::Invalid(format!(
                "{}: subring cache ids {first}..{last} are not contiguous",
                self.name
            )));
        }
        self.first_node = first;
        self.last_node = last;
        self.max_lines = max_lines;
        Ok(())
    }

    fn is_below(&self, id: NodeId) -> bool {
        id >= self.first_node && id <= self.last_node
    }

    /// A message from the subring heads for the top ring.
    pub fn step_in_bottom(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.bottom.incoming.front(ctx);
        let (kind, addr, tokens, ignore) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.kind, m.address, m.tokens, m.ignore)
        };
        // The upward hop is also where a long-path detour ends.
        if !self.top.send(ctx, mid, MINSPACE_FORWARD) {
            log::debug!("{}: top ring full, cannot forward upward", self.name);
            return StepResult::Failed;
        }
        if ctx.committing() {
            if !ignore {
                match kind {
                    MessageKind::RequestDataToken | MessageKind::Eviction => {
                        // Tokens leave the subring with this message.
                        let entry = self
                            .dir
                            .get_mut(&addr)
                            .unwrap_or_else(|| panic!("{}: tokens leaving untracked line {addr:#x}", self.name));
                        assert!(
                            *entry >= tokens,
                            "{}: directory counter underflow at {addr:#x}",
                            self.name
                        );
                        *entry -= tokens;
                        if *entry == 0 {
                            self.dir.remove(&addr);
                        }
                    }
                    _ => {}
                }
            }
            self.msgs.borrow_mut().get_mut(mid).ignore = false;
        }
        self.bottom.incoming.pop(ctx);
        StepResult::Success
    }

    /// A message from the top ring: route into the subring or shortcut.
    pub fn step_in_top(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.top.incoming.front(ctx);
        let (kind, addr, sender, tokens) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.kind, m.address, m.sender, m.tokens)
        };

        let down = match kind {
            MessageKind::ReadRequest | MessageKind::RequestData | MessageKind::Update => {
                self.dir.contains_key(&addr)
            }
            MessageKind::RequestDataToken => self.is_below(sender),
            // Evictions never descend; they drift towards a holder or root.
            MessageKind::Eviction => false,
        };

        if down {
            if !self.bottom.send(ctx, mid, MINSPACE_FORWARD) {
                log::debug!("{}: bottom ring full, cannot route down", self.name);
                return StepResult::Failed;
            }
            if ctx.committing() && kind == MessageKind::RequestDataToken {
                // The reply's tokens enter the subring here.
                let entry = self.dir.entry(addr).or_insert(0);
                *entry += tokens;
                debug_assert!(self.dir.len() <= self.max_lines.max(1));
            }
        } else if !self.top.send(ctx, mid, MINSPACE_SHORTCUT) {
            // Shortcut blocked: take the long way through the subring with
            // protocol effects suppressed.
            if !self.bottom.send(ctx, mid, MINSPACE_FORWARD) {
                log::debug!("{}: both paths blocked", self.name);
                return StepResult::Failed;
            }
            if ctx.committing() {
                self.msgs.borrow_mut().get_mut(mid).ignore = true;
            }
        }
        self.top.incoming.pop(ctx);
        StepResult::Success
    }

    pub fn step_forward_bottom(&mut self, ctx: &mut SimCtx) -> StepResult {
        self.bottom.step_forward(ctx)
    }

    pub fn step_forward_top(&mut self, ctx: &mut SimCtx) -> StepResult {
        self.top.step_forward(ctx)
    }

    /// Verify the counters against the caches of this subring. Only
    /// meaningful once ring traffic has drained.
    pub fn check_against(&self, caches: &[crate::mem::cdma::cache::Cache]) {
        for (&addr, &counted) in &self.dir {
            let held: u32 = caches
                .iter()
                .filter(|c| self.is_below(c.node.id))
                .filter_map(|c| c.find_line(addr).map(|i| c.lines[i].tokens))
                .sum();
            assert_eq!(
                counted, held,
                "{}: counter for {addr:#x} disagrees with subring",
                self.name
            );
        }
    }

    /// Inspection dump: the live counters.
    pub fn dump(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "{}: {} lines tracked (max {})", self.name, self.dir.len(), self.max_lines);
        let _ = writeln!(out, "  node range below: {}..{}", self.first_node, self.last_node);
        for (addr, tokens) in &self.dir {
            let _ = writeln!(out, "  {addr:#018x} | {tokens:6} tokens");
        }
    }
}
