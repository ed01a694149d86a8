/*!
Subring directory of the token-priority hierarchy.

Unlike the plain variant's address map, this directory keeps its counters
in a set-associative table indexed by the shared selector, sized to cover
every line its caches can hold. The counters track *permanent* tokens
crossing the ring boundary; transient tokens are invisible here, and the
caches repair the difference with `LocalDirNotification` messages, which
the directory consumes.
*/

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::ConfigError;
use crate::kernel::{ClockId, ProcessId, ServiceId, SimCtx, StepResult};
use crate::mem::ring::{MsgId, NodeId, RingNode, Slab, MINSPACE_FORWARD, MINSPACE_SHORTCUT};
use crate::mem::selector::BankSelector;
use crate::mem::zlcdma::message::{Message, MessageKind};
use crate::mem::MemAddr;

#[derive(Debug, Clone)]
pub(crate) struct DirLine {
    pub valid: bool,
    pub tag: MemAddr,
    pub tokens: u32,
}

pub(crate) struct Directory {
    pub name: String,
    pub bottom: RingNode,
    pub top: RingNode,
    sets: usize,
    assoc: usize,
    line_size: usize,
    pub lines: Vec<DirLine>,
    selector: Rc<BankSelector>,
    first_cache: NodeId,
    last_cache: NodeId,
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
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &mut SimCtx,
        name: &str,
        clock: ClockId,
        bottom_id: NodeId,
        top_id: NodeId,
        sets: usize,
        assoc: usize,
        line_size: usize,
        buffer_size: usize,
        selector: Rc<BankSelector>,
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
            sets,
            assoc,
            line_size,
            lines: vec![
                DirLine {
                    valid: false,
                    tag: 0,
                    tokens: 0,
                };
                sets * assoc
            ],
            selector,
            first_cache: 0,
            last_cache: 0,
            p_lines,
            msgs,
        }
    }

    pub fn set_range(&mut self, first: NodeId, last: NodeId) -> Result<(), ConfigError> {
        if first > last {
            return Err(ConfigError::Invalid(format!(
                "{}: subring cache ids {first}..{last} are not contiguous",
                self.name
            )));
        }
        self.first_cache = first;
        self.last_cache = last;
        Ok(())
    }

    fn is_below(&self, id: NodeId) -> bool {
        id >= self.first_cache && id <= self.last_cache
    }

    pub fn find_line(&self, addr: MemAddr) -> Option<usize> {
        let (tag, set) = self.selector.map(addr / self.line_size as u64);
        debug_assert!(set < self.sets);
        (0..self.assoc)
            .map(|way| set * self.assoc + way)
            .find(|&i| self.lines[i].valid && self.lines[i].tag == tag)
    }

    fn allocate_line(&self, addr: MemAddr) -> Option<usize> {
        let (_, set) = self.selector.map(addr / self.line_size as u64);
        (0..self.assoc)
            .map(|way| set * self.assoc + way)
            .find(|&i| !self.lines[i].valid)
    }

    /// Tokens tracked for `addr`, for inspection.
    pub fn tokens_below(&self, addr: MemAddr) -> u32 {
        self.find_line(addr).map_or(0, |i| self.lines[i].tokens)
    }

    pub fn step_in_bottom(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.bottom.incoming.front(ctx);
        let (kind, addr, permanent, debit, tokens, ignore) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (
                m.kind,
                m.address,
                m.permanent_tokens(),
                m.debit,
                m.tokens,
                m.ignore,
            )
        };

        if kind == MessageKind::LocalDirNotification {
            // Consumed here: apply the reported delta.
            let slot = self.find_line(addr).or_else(|| {
                if debit { None } else { self.allocate_line(addr) }
            });
            if slot.is_none() && !debit {
                return StepResult::Failed;
            }
            if ctx.committing() {
                let i = slot.unwrap_or_else(|| {
                    panic!("{}: debit notification for untracked line {addr:#x}", self.name)
                });
                let (tag, _) = self.selector.map(addr / self.line_size as u64);
                if debit {
                    assert!(
                        self.lines[i].tokens >= tokens,
                        "{}: notification underflow at {addr:#x}",
                        self.name
                    );
                    self.lines[i].tokens -= tokens;
                    if self.lines[i].tokens == 0 {
                        self.lines[i].valid = false;
                    }
                } else {
                    let line = &mut self.lines[i];
                    if !line.valid {
                        line.valid = true;
                        line.tag = tag;
                        line.tokens = 0;
                    }
                    line.tokens += tokens;
                }
                self.msgs.borrow_mut().free(mid);
            }
            self.bottom.incoming.pop(ctx);
            return StepResult::Success;
        }

        if !self.top.send(ctx, mid, MINSPACE_FORWARD) {
            return StepResult::Failed;
        }
        if ctx.committing() {
            if !ignore && permanent > 0 {
                let i = self
                    .find_line(addr)
                    .unwrap_or_else(|| panic!("{}: tokens leaving untracked line {addr:#x}", self.name));
                assert!(
                    self.lines[i].tokens >= permanent,
                    "{}: counter underflow at {addr:#x}",
                    self.name
                );
                self.lines[i].tokens -= permanent;
                if self.lines[i].tokens == 0 {
                    self.lines[i].valid = false;
                }
            }
            self.msgs.borrow_mut().get_mut(mid).ignore = false;
        }
        self.bottom.incoming.pop(ctx);
        StepResult::Success
    }

    pub fn step_in_top(&mut self, ctx: &mut SimCtx) -> StepResult {
        if !self.p_lines.invoke(ctx) {
            return StepResult::Failed;
        }
        let mid = self.top.incoming.front(ctx);
        let (kind, addr, sender, permanent) = {
            let msgs = self.msgs.borrow();
            let m = msgs.get(mid);
            (m.kind, m.address, m.sender, m.permanent_tokens())
        };
        debug_assert!(
            kind != MessageKind::LocalDirNotification,
            "notification escaped onto the top ring"
        );

        let has_line = self.find_line(addr).is_some();
        let down = match kind {
            MessageKind::Read | MessageKind::AcquireTokens => {
                self.is_below(sender) || has_line
            }
            MessageKind::Eviction => false,
            MessageKind::LocalDirNotification => false,
        };

        if down {
            // Entering tokens need a counter line.
            let slot = if has_line {
                self.find_line(addr)
            } else if permanent > 0 {
                self.allocate_line(addr)
            } else {
                None
            };
            if permanent > 0 && slot.is_none() {
                log::debug!("{}: counter set full for {addr:#x}", self.name);
                return StepResult::Failed;
            }
            if !self.bottom.send(ctx, mid, MINSPACE_FORWARD) {
                return StepResult::Failed;
            }
            if ctx.committing() && permanent > 0 {
                let i = slot.expect("counter slot reserved");
                let (tag, _) = self.selector.map(addr / self.line_size as u64);
                let line = &mut self.lines[i];
                if !line.valid {
                    line.valid = true;
                    line.tag = tag;
                    line.tokens = 0;
                }
                line.tokens += permanent;
            }
        } else if !self.top.send(ctx, mid, MINSPACE_SHORTCUT) {
            if !self.bottom.send(ctx, mid, MINSPACE_FORWARD) {
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
}
