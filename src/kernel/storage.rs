/*!
Sensitive storage primitives: registers, flags, bounded buffers and intrusive
index lists.

All storages live in one arena inside the simulation context; components keep
`Copy` handles. Reads observe committed (pre-update) state at any time.
Mutations are recorded only while the kernel is in the Commit phase and are
applied atomically in the Update phase at the end of the cycle; outside the
Commit phase the mutating calls perform their feasibility checks and nothing
else, which is what lets a process run identically in the Check and Commit
phases.

Each storage accepts at most one mutation of each kind per cycle (one
write + one clear, one pop + a bounded number of pushes); exceeding that is a
fatal invariant violation. An empty-to-non-empty transition notifies the
single process registered as sensitive, waking it for the next cycle; the
reverse transition takes the notification away.
*/

use std::any::Any;
use std::collections::VecDeque;
use std::marker::PhantomData;

use crate::kernel::clock::ClockId;
use crate::kernel::process::ProcessId;
use crate::kernel::{Phase, SimCtx};

/// Index of a storage in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub(crate) usize);

/// Common bookkeeping shared by every storage slot.
#[derive(Debug)]
pub(crate) struct StorageBase {
    pub name: String,
    pub clock: ClockId,
    pub sensitive: Option<ProcessId>,
    /// Whether an update is already queued for this cycle.
    pub scheduled: bool,
}

impl StorageBase {
    fn new(name: &str, clock: ClockId) -> Self {
        StorageBase {
            name: name.to_string(),
            clock,
            sensitive: None,
            scheduled: false,
        }
    }
}

/// Object-safe face of a storage slot, used by the arena for the Update
/// phase and the sensitivity bookkeeping.
pub(crate) trait AnyStorage: Any {
    fn base(&self) -> &StorageBase;
    fn base_mut(&mut self) -> &mut StorageBase;
    /// Whether the storage currently holds anything (committed state).
    fn nonempty(&self) -> bool;
    /// Apply the pending mutations; returns (was_nonempty, now_nonempty).
    fn apply_update(&mut self) -> (bool, bool);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ---------------------------------------------------------------------------
// Register<T>
// ---------------------------------------------------------------------------

pub(crate) struct RegisterSlot<T> {
    base: StorageBase,
    cur: Option<T>,
    incoming: Option<T>,
    assigned: bool,
    cleared: bool,
}

impl<T: 'static> AnyStorage for RegisterSlot<T> {
    fn base(&self) -> &StorageBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut StorageBase {
        &mut self.base
    }
    fn nonempty(&self) -> bool {
        self.cur.is_some()
    }
    fn apply_update(&mut self) -> (bool, bool) {
        let was = self.cur.is_some();
        if self.assigned {
            assert!(
                self.cur.is_none() || self.cleared,
                "register `{}`: write while full without clear",
                self.base.name
            );
            self.cur = self.incoming.take();
        } else if self.cleared {
            // A clear together with a write in the same cycle resolves to
            // the write; a lone clear empties the register.
            self.cur = None;
        }
        self.assigned = false;
        self.cleared = false;
        (was, self.cur.is_some())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to a single-value full/empty register.
pub struct RegisterHandle<T> {
    pub(crate) id: StorageId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RegisterHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RegisterHandle<T> {}

impl<T> std::fmt::Debug for RegisterHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterHandle").field("id", &self.id).finish()
    }
}

impl<T: Clone + 'static> RegisterHandle<T> {
    pub fn storage_id(&self) -> StorageId {
        self.id
    }

    pub fn is_empty(&self, ctx: &SimCtx) -> bool {
        ctx.register_slot::<T>(self.id).cur.is_none()
    }

    /// Read the committed value. Panics when empty.
    pub fn get(&self, ctx: &SimCtx) -> T {
        let slot = ctx.register_slot::<T>(self.id);
        slot.cur
            .clone()
            .unwrap_or_else(|| panic!("register `{}`: read while empty", slot.base.name))
    }

    /// Write a value; takes effect at the end of the cycle. Writing a full
    /// register is an invariant violation unless it is also cleared this
    /// cycle.
    pub fn write(&self, ctx: &mut SimCtx, value: T) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.register_slot_mut::<T>(self.id);
        assert!(
            !slot.assigned,
            "register `{}`: written twice in one cycle",
            slot.base.name
        );
        slot.incoming = Some(value);
        slot.assigned = true;
    }

    /// Flush the register back to empty at the end of the cycle.
    pub fn clear(&self, ctx: &mut SimCtx) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.register_slot_mut::<T>(self.id);
        assert!(
            !slot.cleared,
            "register `{}`: cleared twice in one cycle",
            slot.base.name
        );
        assert!(
            slot.cur.is_some(),
            "register `{}`: clear while empty",
            slot.base.name
        );
        slot.cleared = true;
    }
}

// ---------------------------------------------------------------------------
// Flag
// ---------------------------------------------------------------------------

pub(crate) struct FlagSlot {
    base: StorageBase,
    value: bool,
    set_pending: bool,
    clear_pending: bool,
}

impl AnyStorage for FlagSlot {
    fn base(&self) -> &StorageBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut StorageBase {
        &mut self.base
    }
    fn nonempty(&self) -> bool {
        self.value
    }
    fn apply_update(&mut self) -> (bool, bool) {
        let was = self.value;
        if self.set_pending {
            self.value = true;
        } else if self.clear_pending {
            self.value = false;
        }
        self.set_pending = false;
        self.clear_pending = false;
        (was, self.value)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to a boolean flag storage.
#[derive(Debug, Clone, Copy)]
pub struct FlagHandle {
    pub(crate) id: StorageId,
}

impl FlagHandle {
    pub fn storage_id(&self) -> StorageId {
        self.id
    }

    pub fn is_set(&self, ctx: &SimCtx) -> bool {
        ctx.flag_slot(self.id).value
    }

    pub fn set(&self, ctx: &mut SimCtx) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.flag_slot_mut(self.id);
        assert!(
            !slot.set_pending,
            "flag `{}`: set twice in one cycle",
            slot.base.name
        );
        slot.set_pending = true;
    }

    pub fn clear(&self, ctx: &mut SimCtx) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.flag_slot_mut(self.id);
        assert!(
            !slot.clear_pending,
            "flag `{}`: cleared twice in one cycle",
            slot.base.name
        );
        slot.clear_pending = true;
    }
}

// ---------------------------------------------------------------------------
// Buffer<T>
// ---------------------------------------------------------------------------

pub(crate) struct BufferSlot<T> {
    base: StorageBase,
    q: VecDeque<T>,
    capacity: usize,
    max_pushes: usize,
    pending: Vec<T>,
    popped: bool,
}

impl<T: 'static> AnyStorage for BufferSlot<T> {
    fn base(&self) -> &StorageBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut StorageBase {
        &mut self.base
    }
    fn nonempty(&self) -> bool {
        !self.q.is_empty()
    }
    fn apply_update(&mut self) -> (bool, bool) {
        let was = !self.q.is_empty();
        if self.popped {
            self.q.pop_front();
            self.popped = false;
        }
        for v in self.pending.drain(..) {
            self.q.push_back(v);
        }
        assert!(
            self.q.len() <= self.capacity,
            "buffer `{}`: capacity exceeded",
            self.base.name
        );
        (was, !self.q.is_empty())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to a bounded FIFO.
pub struct BufferHandle<T> {
    pub(crate) id: StorageId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for BufferHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for BufferHandle<T> {}

impl<T> std::fmt::Debug for BufferHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle").field("id", &self.id).finish()
    }
}

impl<T: Clone + 'static> BufferHandle<T> {
    pub fn storage_id(&self) -> StorageId {
        self.id
    }

    pub fn is_empty(&self, ctx: &SimCtx) -> bool {
        ctx.buffer_slot::<T>(self.id).q.is_empty()
    }

    pub fn len(&self, ctx: &SimCtx) -> usize {
        ctx.buffer_slot::<T>(self.id).q.len()
    }

    /// Whether a push with the given space reservation would be admitted:
    /// at least `min_space + 1` slots must be free after accounting for
    /// pushes already recorded this cycle.
    pub fn can_push(&self, ctx: &SimCtx, min_space: usize) -> bool {
        let slot = ctx.buffer_slot::<T>(self.id);
        let used = slot.q.len() + slot.pending.len();
        slot.pending.len() < slot.max_pushes && slot.capacity - used >= min_space + 1
    }

    /// Push a value, honoring the space reservation. The value is appended
    /// at the end of the cycle. Returns false when rejected.
    pub fn push(&self, ctx: &mut SimCtx, value: T, min_space: usize) -> bool {
        if !self.can_push(ctx, min_space) {
            return false;
        }
        if ctx.committing() {
            ctx.schedule_update(self.id);
            let slot = ctx.buffer_slot_mut::<T>(self.id);
            slot.pending.push(value);
        }
        true
    }

    /// Clone of the front element. Panics when empty.
    pub fn front(&self, ctx: &SimCtx) -> T {
        let slot = ctx.buffer_slot::<T>(self.id);
        slot.q
            .front()
            .cloned()
            .unwrap_or_else(|| panic!("buffer `{}`: front of empty buffer", slot.base.name))
    }

    /// Remove the front element at the end of the cycle.
    pub fn pop(&self, ctx: &mut SimCtx) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.buffer_slot_mut::<T>(self.id);
        assert!(
            !slot.q.is_empty(),
            "buffer `{}`: pop from empty buffer",
            slot.base.name
        );
        assert!(
            !slot.popped,
            "buffer `{}`: popped twice in one cycle",
            slot.base.name
        );
        slot.popped = true;
    }

    /// Committed contents, front first (for inspection dumps).
    pub fn iter_snapshot(&self, ctx: &SimCtx) -> Vec<T> {
        ctx.buffer_slot::<T>(self.id).q.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// LinkedList
// ---------------------------------------------------------------------------

pub(crate) struct LinkedListSlot {
    base: StorageBase,
    /// The next-index table threaded alongside the external table.
    next: Vec<usize>,
    head: usize,
    tail: usize,
    empty: bool,
    pushed: bool,
    first: usize,
    last: usize,
    popped: bool,
    popped_next: usize,
}

impl AnyStorage for LinkedListSlot {
    fn base(&self) -> &StorageBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut StorageBase {
        &mut self.base
    }
    fn nonempty(&self) -> bool {
        !self.empty
    }
    fn apply_update(&mut self) -> (bool, bool) {
        let was = !self.empty;
        if self.popped {
            if self.head == self.tail {
                self.empty = true;
            } else {
                self.head = self.popped_next;
            }
            self.popped = false;
        }
        if self.pushed {
            if self.empty {
                self.head = self.first;
                self.empty = false;
            } else {
                self.next[self.tail] = self.first;
            }
            self.tail = self.last;
            self.pushed = false;
        }
        (was, !self.empty)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Handle to an intrusive index list over an external table. The list owns
/// the `next` links; the table rows themselves stay with the component.
#[derive(Debug, Clone, Copy)]
pub struct LinkedListHandle {
    pub(crate) id: StorageId,
}

impl LinkedListHandle {
    pub fn storage_id(&self) -> StorageId {
        self.id
    }

    pub fn is_empty(&self, ctx: &SimCtx) -> bool {
        ctx.list_slot(self.id).empty
    }

    /// Does the list contain exactly one item?
    pub fn singular(&self, ctx: &SimCtx) -> bool {
        let slot = ctx.list_slot(self.id);
        assert!(!slot.empty, "list `{}`: singular on empty list", slot.base.name);
        slot.head == slot.tail
    }

    pub fn front(&self, ctx: &SimCtx) -> usize {
        let slot = ctx.list_slot(self.id);
        assert!(!slot.empty, "list `{}`: front of empty list", slot.base.name);
        slot.head
    }

    pub fn push(&self, ctx: &mut SimCtx, item: usize) {
        self.append(ctx, item, item);
    }

    /// Splice a pre-built chain (linked via `set_next`) onto the tail.
    pub fn append(&self, ctx: &mut SimCtx, first: usize, last: usize) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.list_slot_mut(self.id);
        assert!(
            !slot.pushed,
            "list `{}`: pushed twice in one cycle",
            slot.base.name
        );
        slot.first = first;
        slot.last = last;
        slot.pushed = true;
    }

    pub fn pop(&self, ctx: &mut SimCtx) {
        if !ctx.committing() {
            return;
        }
        ctx.schedule_update(self.id);
        let slot = ctx.list_slot_mut(self.id);
        assert!(!slot.empty, "list `{}`: pop from empty list", slot.base.name);
        assert!(
            !slot.popped,
            "list `{}`: popped twice in one cycle",
            slot.base.name
        );
        slot.popped = true;
        slot.popped_next = slot.next[slot.head];
    }

    /// Link `item -> succ` while building a chain for `append`. Immediate;
    /// only legal in the Commit phase on rows not currently on the list.
    pub fn set_next(&self, ctx: &mut SimCtx, item: usize, succ: usize) {
        if !ctx.committing() {
            return;
        }
        let slot = ctx.list_slot_mut(self.id);
        slot.next[item] = succ;
    }

    /// Walk the committed list, front to back (for inspection).
    pub fn iter_snapshot(&self, ctx: &SimCtx) -> Vec<usize> {
        let slot = ctx.list_slot(self.id);
        let mut out = Vec::new();
        if slot.empty {
            return out;
        }
        let mut i = slot.head;
        loop {
            out.push(i);
            if i == slot.tail {
                break;
            }
            i = slot.next[i];
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Register pair: cross-domain transfer
// ---------------------------------------------------------------------------

/// Two registers in adjacent clock domains joined by a transfer step run by
/// a process in the destination domain. A value written in the source
/// domain at cycle `c` becomes visible in the destination at the earliest
/// destination cycle starting at or after the end of `c`.
#[derive(Debug, Clone, Copy)]
pub struct RegisterPair<T> {
    pub src: RegisterHandle<T>,
    pub dst: RegisterHandle<T>,
}

impl<T: Clone + 'static> RegisterPair<T> {
    /// One step of the transfer process: move the source value into the
    /// destination when the destination is free.
    pub fn step_transfer(&self, ctx: &mut SimCtx) -> crate::kernel::StepResult {
        use crate::kernel::StepResult;
        if self.src.is_empty(ctx) {
            return StepResult::Delayed;
        }
        if !self.dst.is_empty(ctx) {
            return StepResult::Failed;
        }
        let value = self.src.get(ctx);
        self.dst.write(ctx, value);
        self.src.clear(ctx);
        StepResult::Success
    }
}

// ---------------------------------------------------------------------------
// Arena plumbing on the simulation context
// ---------------------------------------------------------------------------

impl SimCtx {
    pub fn create_register<T: 'static>(&mut self, name: &str, clock: ClockId) -> RegisterHandle<T> {
        let id = self.add_storage(Box::new(RegisterSlot::<T> {
            base: StorageBase::new(name, clock),
            cur: None,
            incoming: None,
            assigned: false,
            cleared: false,
        }));
        RegisterHandle {
            id,
            _marker: PhantomData,
        }
    }

    pub fn create_flag(&mut self, name: &str, clock: ClockId, initial: bool) -> FlagHandle {
        let id = self.add_storage(Box::new(FlagSlot {
            base: StorageBase::new(name, clock),
            value: initial,
            set_pending: false,
            clear_pending: false,
        }));
        FlagHandle { id }
    }

    pub fn create_buffer<T: 'static>(
        &mut self,
        name: &str,
        clock: ClockId,
        capacity: usize,
        max_pushes: usize,
    ) -> BufferHandle<T> {
        assert!(capacity > 0, "buffer `{name}`: zero capacity");
        let id = self.add_storage(Box::new(BufferSlot::<T> {
            base: StorageBase::new(name, clock),
            q: VecDeque::with_capacity(capacity),
            capacity,
            max_pushes: max_pushes.max(1),
            pending: Vec::new(),
            popped: false,
        }));
        BufferHandle {
            id,
            _marker: PhantomData,
        }
    }

    pub fn create_linked_list(
        &mut self,
        name: &str,
        clock: ClockId,
        table_size: usize,
    ) -> LinkedListHandle {
        let id = self.add_storage(Box::new(LinkedListSlot {
            base: StorageBase::new(name, clock),
            next: vec![usize::MAX; table_size],
            head: 0,
            tail: 0,
            empty: true,
            pushed: false,
            first: 0,
            last: 0,
            popped: false,
            popped_next: 0,
        }));
        LinkedListHandle { id }
    }

    /// Register `process` as the single process woken by `storage`.
    pub fn sensitive(&mut self, storage: StorageId, process: ProcessId) {
        let nonempty = {
            let slot = &mut self.storages[storage.0];
            assert!(
                slot.base().sensitive.is_none(),
                "storage `{}`: sensitive process registered twice",
                slot.base().name
            );
            slot.base_mut().sensitive = Some(process);
            slot.nonempty()
        };
        if nonempty {
            self.processes[process.0].signals += 1;
        }
    }

    pub fn storage_name(&self, id: StorageId) -> &str {
        &self.storages[id.0].base().name
    }

    fn add_storage(&mut self, slot: Box<dyn AnyStorage>) -> StorageId {
        let id = StorageId(self.storages.len());
        self.storages.push(slot);
        id
    }

    pub(crate) fn schedule_update(&mut self, id: StorageId) {
        debug_assert_eq!(self.phase, Phase::Commit);
        let slot = &mut self.storages[id.0];
        if !slot.base().scheduled {
            slot.base_mut().scheduled = true;
            self.pending_updates.push(id);
        }
    }

    /// Apply all deferred mutations and toggle process notifications.
    pub(crate) fn apply_updates(&mut self) {
        let pending = std::mem::take(&mut self.pending_updates);
        for id in pending {
            let (was, now, sensitive) = {
                let slot = &mut self.storages[id.0];
                slot.base_mut().scheduled = false;
                let (was, now) = slot.apply_update();
                (was, now, slot.base().sensitive)
            };
            if let Some(pid) = sensitive {
                if !was && now {
                    self.processes[pid.0].signals += 1;
                } else if was && !now {
                    let signals = &mut self.processes[pid.0].signals;
                    assert!(*signals > 0, "notification imbalance on process {pid:?}");
                    *signals -= 1;
                }
            }
        }
    }

    fn slot_as<S: 'static>(&self, id: StorageId) -> &S {
        self.storages[id.0]
            .as_any()
            .downcast_ref::<S>()
            .unwrap_or_else(|| panic!("storage {id:?}: handle/slot type mismatch"))
    }

    fn slot_as_mut<S: 'static>(&mut self, id: StorageId) -> &mut S {
        self.storages[id.0]
            .as_any_mut()
            .downcast_mut::<S>()
            .unwrap_or_else(|| panic!("storage {id:?}: handle/slot type mismatch"))
    }

    pub(crate) fn register_slot<T: 'static>(&self, id: StorageId) -> &RegisterSlot<T> {
        self.slot_as::<RegisterSlot<T>>(id)
    }
    pub(crate) fn register_slot_mut<T: 'static>(&mut self, id: StorageId) -> &mut RegisterSlot<T> {
        self.slot_as_mut::<RegisterSlot<T>>(id)
    }
    pub(crate) fn flag_slot(&self, id: StorageId) -> &FlagSlot {
        self.slot_as::<FlagSlot>(id)
    }
    pub(crate) fn flag_slot_mut(&mut self, id: StorageId) -> &mut FlagSlot {
        self.slot_as_mut::<FlagSlot>(id)
    }
    pub(crate) fn buffer_slot<T: 'static>(&self, id: StorageId) -> &BufferSlot<T> {
        self.slot_as::<BufferSlot<T>>(id)
    }
    pub(crate) fn buffer_slot_mut<T: 'static>(&mut self, id: StorageId) -> &mut BufferSlot<T> {
        self.slot_as_mut::<BufferSlot<T>>(id)
    }
    pub(crate) fn list_slot(&self, id: StorageId) -> &LinkedListSlot {
        self.slot_as::<LinkedListSlot>(id)
    }
    pub(crate) fn list_slot_mut(&mut self, id: StorageId) -> &mut LinkedListSlot {
        self.slot_as_mut::<LinkedListSlot>(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Component, Simulation, StepResult};

    /// Drive a one-shot closure through a full cycle so its mutations pass
    /// through the Commit and Update phases.
    fn run_one<F>(build: impl FnOnce(&mut Simulation) -> F) -> Simulation
    where
        F: FnMut(&mut SimCtx) -> StepResult + 'static,
    {
        struct Driver<F> {
            f: F,
            go: FlagHandle,
            done: bool,
        }
        impl<F: FnMut(&mut SimCtx) -> StepResult> Component for Driver<F> {
            fn name(&self) -> &str {
                "driver"
            }
            fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
                if self.done {
                    self.go.clear(ctx);
                    return StepResult::Delayed;
                }
                let r = (self.f)(ctx);
                if ctx.committing() {
                    self.done = true;
                }
                r
            }
        }
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("driver");
        let pid = sim.ctx.register_process(comp, 0, "drive", clk);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), pid);
        let f = build(&mut sim);
        sim.install(comp, Box::new(Driver { f, go, done: false }));
        sim.run_for(1).unwrap();
        sim
    }

    #[test]
    fn buffer_honors_space_reservation() {
        run_one(|sim| {
            let clk = ClockId(0);
            let buf = sim.ctx.create_buffer::<u32>("b_test", clk, 3, 2);
            move |ctx: &mut SimCtx| {
                // Recorded pushes count against later reservations, so the
                // interesting behavior is in the Commit phase: with three
                // free slots, a push reserving two succeeds, a second push
                // reserving two does not (only one slot would remain), and
                // an unreserved push still fits.
                if ctx.committing() {
                    assert!(buf.push(ctx, 1, 2));
                    assert!(!buf.push(ctx, 2, 2));
                    assert!(buf.push(ctx, 3, 0));
                }
                StepResult::Success
            }
        });
    }

    #[test]
    #[should_panic(expected = "written twice")]
    fn double_register_write_is_fatal() {
        run_one(|sim| {
            let clk = ClockId(0);
            let reg = sim.ctx.create_register::<u32>("r_test", clk);
            move |ctx: &mut SimCtx| {
                reg.write(ctx, 1);
                reg.write(ctx, 2);
                StepResult::Success
            }
        });
    }

    #[test]
    #[should_panic(expected = "write while full")]
    fn write_to_full_register_without_clear_is_fatal() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("driver");
        let pid = sim.ctx.register_process(comp, 0, "drive", clk);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), pid);
        let reg = sim.ctx.create_register::<u32>("r_test", clk);

        struct Writer {
            reg: RegisterHandle<u32>,
        }
        impl Component for Writer {
            fn name(&self) -> &str {
                "driver"
            }
            fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
                self.reg.write(ctx, 7);
                StepResult::Success
            }
        }
        sim.install(comp, Box::new(Writer { reg }));
        // First cycle fills the register; the second write hits it full.
        sim.run_for(2).unwrap();
    }

    #[test]
    fn clear_and_write_in_one_cycle_resolves_to_write() {
        let mut sim = Simulation::new();
        let clk = sim.ctx.create_clock("test", 1);
        let comp = sim.ctx.allocate_component("driver");
        let pid = sim.ctx.register_process(comp, 0, "drive", clk);
        let go = sim.ctx.create_flag("f_go", clk, true);
        sim.ctx.sensitive(go.storage_id(), pid);
        let reg = sim.ctx.create_register::<u32>("r_test", clk);

        struct Writer {
            reg: RegisterHandle<u32>,
            round: u32,
            go: FlagHandle,
        }
        impl Component for Writer {
            fn name(&self) -> &str {
                "driver"
            }
            fn step(&mut self, _local: usize, ctx: &mut SimCtx) -> StepResult {
                match self.round {
                    0 => self.reg.write(ctx, 7),
                    1 => {
                        self.reg.clear(ctx);
                        self.reg.write(ctx, 9);
                    }
                    _ => self.go.clear(ctx),
                }
                if ctx.committing() {
                    self.round += 1;
                }
                StepResult::Success
            }
        }
        sim.install(
            comp,
            Box::new(Writer {
                reg,
                round: 0,
                go,
            }),
        );
        sim.run_for(2).unwrap();
        assert_eq!(reg.get(&sim.ctx), 9);
    }
}
