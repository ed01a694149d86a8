/*!
Ring transport shared by the COMA hierarchies.

Messages live in a typed slab owned by the memory container; ring buffers
carry only slab indices, so a message is owned by exactly one buffer or
process at any moment and moving it between nodes is an index copy. A node
exposes an incoming and an outgoing buffer; one transfer process per node
moves a single message per cycle from its outgoing buffer to the next
node's incoming buffer.

`send` takes a `min_space` reservation: the push is admitted only if that
many slots remain free afterwards. Shortcut paths reserve more than
forwarding paths, which keeps the two from deadlocking each other.
*/

use crate::kernel::{BufferHandle, ClockId, SimCtx, StepResult};

/// Space reservation for messages taking a shortcut across a ring.
pub const MINSPACE_SHORTCUT: usize = 2;
/// Space reservation for plain forwarding.
pub const MINSPACE_FORWARD: usize = 1;

/// Index of a live message in its slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub(crate) u32);

/// Typed slab allocator with a free list. Replaces a global pool: each
/// memory container owns one, so teardown is just dropping it.
#[derive(Debug)]
pub struct Slab<M> {
    slots: Vec<Option<M>>,
    free: Vec<u32>,
    live: usize,
}

impl<M> Slab<M> {
    pub fn new() -> Self {
        Slab {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, msg: M) -> MsgId {
        self.live += 1;
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = Some(msg);
            MsgId(i)
        } else {
            self.slots.push(Some(msg));
            MsgId(self.slots.len() as u32 - 1)
        }
    }

    pub fn free(&mut self, id: MsgId) -> M {
        let msg = self.slots[id.0 as usize]
            .take()
            .unwrap_or_else(|| panic!("message {id:?} freed twice"));
        self.free.push(id.0);
        self.live -= 1;
        msg
    }

    pub fn get(&self, id: MsgId) -> &M {
        self.slots[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("message {id:?} used after free"))
    }

    pub fn get_mut(&mut self, id: MsgId) -> &mut M {
        self.slots[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("message {id:?} used after free"))
    }

    /// Number of live messages (token-conservation checks count these).
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (MsgId, &M)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (MsgId(i as u32), m)))
    }
}

impl<M> Default for Slab<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ring-node id. Caches take the low ids; directory and root interfaces
/// get ids above the caches for diagnostics.
pub type NodeId = usize;

/// One ring interface: a pair of message buffers plus the link to the next
/// node, established when the topology is wired.
#[derive(Debug, Clone, Copy)]
pub struct RingNode {
    pub id: NodeId,
    pub incoming: BufferHandle<MsgId>,
    pub outgoing: BufferHandle<MsgId>,
    next_incoming: Option<BufferHandle<MsgId>>,
}

impl RingNode {
    pub fn new(ctx: &mut SimCtx, name: &str, clock: ClockId, id: NodeId, depth: usize) -> Self {
        // Two pushes per cycle: an eviction and the request that caused it.
        let incoming =
            ctx.create_buffer::<MsgId>(&format!("{name}.b_incoming"), clock, depth, 2);
        let outgoing =
            ctx.create_buffer::<MsgId>(&format!("{name}.b_outgoing"), clock, depth, 2);
        RingNode {
            id,
            incoming,
            outgoing,
            next_incoming: None,
        }
    }

    /// Wire this node to its successor's incoming buffer.
    pub fn connect(&mut self, next_incoming: BufferHandle<MsgId>) {
        self.next_incoming = Some(next_incoming);
    }

    pub fn is_connected(&self) -> bool {
        self.next_incoming.is_some()
    }

    /// Queue a message for the next node, honoring the space reservation.
    pub fn send(&self, ctx: &mut SimCtx, msg: MsgId, min_space: usize) -> bool {
        self.outgoing.push(ctx, msg, min_space)
    }

    /// The per-node transfer process: move one message to the next node.
    pub fn step_forward(&self, ctx: &mut SimCtx) -> StepResult {
        let next = self
            .next_incoming
            .expect("ring node forwarded before the topology was wired");
        let msg = self.outgoing.front(ctx);
        if !next.push(ctx, msg, 0) {
            log::debug!("ring node {}: next hop full, stalling", self.id);
            return StepResult::Failed;
        }
        self.outgoing.pop(ctx);
        StepResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_reuses_slots() {
        let mut slab: Slab<u32> = Slab::new();
        let a = slab.alloc(1);
        let b = slab.alloc(2);
        assert_eq!(slab.live(), 2);
        assert_eq!(slab.free(a), 1);
        let c = slab.alloc(3);
        assert_eq!(c, a, "freed slot is reused first");
        assert_eq!(*slab.get(b), 2);
        assert_eq!(*slab.get(c), 3);
        assert_eq!(slab.live(), 2);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_panics() {
        let mut slab: Slab<u32> = Slab::new();
        let a = slab.alloc(1);
        slab.free(a);
        slab.free(a);
    }
}
