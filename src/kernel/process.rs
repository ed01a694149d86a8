/*!
Process handles and per-step results.

A process is the unit of scheduling: it belongs to a component, runs at most
once per cycle of its clock, and is runnable only while at least one of its
sensitive storages is non-empty. The kernel tracks that with a signal count
incremented/decremented by storage update notifications.
*/

use crate::kernel::clock::ClockId;
use crate::kernel::storage::StorageId;

/// Identifies a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) usize);

/// Identifies a registered component (the dispatch target of its processes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(pub(crate) usize);

/// Outcome of one process step.
///
/// `Success` commits the step's effects. `Delayed` is cooperative waiting:
/// legal lack of progress, not counted by the watchdog. `Failed` is
/// back-pressure: effects are discarded and the step is retried next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Success,
    Delayed,
    Failed,
}

#[derive(Debug)]
pub(crate) struct ProcessEntry {
    pub name: String,
    pub component: ComponentId,
    pub local: usize,
    pub clock: ClockId,
    /// Number of non-empty sensitive storages; runnable iff > 0.
    pub signals: u32,
    /// Storages this process may enqueue into, declared at registration.
    /// Used by the deadlock report.
    pub traces: Vec<StorageId>,
    /// Whether the last executed step returned `Failed`.
    pub stalled: bool,
}

impl ProcessEntry {
    pub fn runnable(&self) -> bool {
        self.signals > 0
    }
}
