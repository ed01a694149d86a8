/*!
Memory interface: the client-facing trait implemented by every timing model
(parallel, banked, DDR, and the COMA hierarchies), plus the shared address
and data types.

Clients register a callback and a process, and receive a `MemoryPort`: a
cheap handle through which that process issues line-aligned reads and
writes from inside its step. Both operations return `false` under
back-pressure, in which case the caller yields `Failed` and retries.
Completions arrive later through the callback:

- `on_memory_read_completed(addr, data)` is broadcast to every client of
  the serving cache or channel (callers match it against their own
  outstanding misses);
- `on_memory_write_completed(wid)` goes to the writer only;
- `on_memory_snooped(addr, data, mask)` tells co-clients about writes they
  did not issue;
- `on_memory_invalidated(addr)` reports a line taken away by the coherence
  protocol.

Callbacks are held as `Rc<RefCell<dyn MemoryCallback>>` so the memory side
can call into a client while the client component is at rest.
*/

pub mod banked;
pub mod cdma;
pub mod ddr;
pub mod parallel;
pub mod ring;
pub mod selector;
pub mod store;
pub mod zlcdma;

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::ConfigError;
use crate::kernel::{Component, ProcessId, SimCtx};

/// Byte address in the simulated physical address space.
pub type MemAddr = u64;
/// Write-completion tag chosen by the client.
pub type WClientId = u64;
/// Memory client id, assigned at registration.
pub type Mcid = usize;

/// Line-sized write payload: data bytes plus a byte-validity mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemData {
    pub data: Vec<u8>,
    pub mask: Vec<bool>,
}

impl MemData {
    pub fn new(line_size: usize) -> Self {
        MemData {
            data: vec![0; line_size],
            mask: vec![false; line_size],
        }
    }

    /// A fully-valid payload.
    pub fn full(data: Vec<u8>) -> Self {
        let mask = vec![true; data.len()];
        MemData { data, mask }
    }

    /// Write `bytes` at `offset` and mark them valid.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        for m in &mut self.mask[offset..offset + bytes.len()] {
            *m = true;
        }
    }
}

/// Client-side completion interface.
pub trait MemoryCallback {
    fn on_memory_read_completed(&mut self, addr: MemAddr, data: &[u8]) -> bool;
    fn on_memory_write_completed(&mut self, wid: WClientId) -> bool;
    fn on_memory_snooped(&mut self, _addr: MemAddr, _data: &[u8], _mask: &[bool]) -> bool {
        true
    }
    fn on_memory_invalidated(&mut self, _addr: MemAddr) -> bool {
        true
    }
}

pub type ClientCallback = Rc<RefCell<dyn MemoryCallback>>;

/// A registered client slot, shared between a memory component and the
/// ports handed to clients.
pub(crate) struct ClientEntry {
    pub callback: Option<ClientCallback>,
    pub process: ProcessId,
}

/// Aggregate traffic counters of a memory system. `external_*` counts
/// the accesses that actually reached off-chip storage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatistics {
    pub nreads: u64,
    pub nwrites: u64,
    pub nread_bytes: u64,
    pub nwrite_bytes: u64,
    pub external_reads: u64,
    pub external_writes: u64,
}

/// The memory-system surface consumed by the pipeline side.
pub trait Memory {
    /// Register a client; `grouped` shares the most recent client slot so
    /// several sub-clients present one id to the system.
    fn register_client(
        &mut self,
        ctx: &mut SimCtx,
        callback: ClientCallback,
        process: ProcessId,
        grouped: bool,
    ) -> Result<(Mcid, MemoryPort), ConfigError>;

    fn unregister_client(&mut self, id: Mcid);

    /// Finish construction once all clients are registered (ring wiring,
    /// placement checks). Must be called before the first cycle.
    fn initialize(&mut self, ctx: &mut SimCtx) -> Result<(), ConfigError>;

    /// The component slot this system was allocated at construction.
    fn component_id(&self) -> crate::kernel::ComponentId;

    /// Aggregate traffic counters since construction.
    fn statistics(&self) -> MemoryStatistics;

    /// Human-readable dump of the system's queues and tables.
    fn dump(&self, ctx: &SimCtx) -> String;

    fn line_size(&self) -> usize;

    /// Direct access to the functional backing store (test preloading and
    /// final-state inspection).
    fn store(&self) -> Rc<RefCell<store::SparseMemory>>;
}

/// A memory system is a `Memory` that the kernel can also drive.
pub trait MemorySystem: Memory + Component {
    /// Surrender the box for installation into the simulation.
    fn into_component(self: Box<Self>) -> Box<dyn Component>;
}

impl std::fmt::Debug for dyn MemorySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySystem").field("name", &self.name()).finish()
    }
}

impl<T: Memory + Component + 'static> MemorySystem for T {
    fn into_component(self: Box<Self>) -> Box<dyn Component> {
        self
    }
}

/// Per-client operation handle. All routing state is captured at
/// registration so a client process can issue operations with only the
/// simulation context in hand.
#[derive(Clone)]
pub enum MemoryPort {
    Parallel(parallel::ParallelPort),
    Banked(banked::BankedPort),
    Ddr(ddr::DdrPort),
    Cdma(cdma::CdmaPort),
    Zlcdma(zlcdma::ZlcdmaPort),
}

impl MemoryPort {
    /// Issue a line read. `false` means back-pressure; retry next cycle.
    pub fn read(&self, ctx: &mut SimCtx, addr: MemAddr) -> bool {
        self.check_aligned(addr);
        match self {
            MemoryPort::Parallel(p) => p.read(ctx, addr),
            MemoryPort::Banked(p) => p.read(ctx, addr),
            MemoryPort::Ddr(p) => p.read(ctx, addr),
            MemoryPort::Cdma(p) => p.read(ctx, addr),
            MemoryPort::Zlcdma(p) => p.read(ctx, addr),
        }
    }

    /// Issue a masked line write. `false` means back-pressure.
    pub fn write(&self, ctx: &mut SimCtx, addr: MemAddr, data: &MemData, wid: WClientId) -> bool {
        self.check_aligned(addr);
        match self {
            MemoryPort::Parallel(p) => p.write(ctx, addr, data, wid),
            MemoryPort::Banked(p) => p.write(ctx, addr, data, wid),
            MemoryPort::Ddr(p) => p.write(ctx, addr, data, wid),
            MemoryPort::Cdma(p) => p.write(ctx, addr, data, wid),
            MemoryPort::Zlcdma(p) => p.write(ctx, addr, data, wid),
        }
    }

    pub fn line_size(&self) -> usize {
        match self {
            MemoryPort::Parallel(p) => p.line_size,
            MemoryPort::Banked(p) => p.line_size,
            MemoryPort::Ddr(p) => p.line_size,
            MemoryPort::Cdma(p) => p.line_size,
            MemoryPort::Zlcdma(p) => p.line_size,
        }
    }

    fn check_aligned(&self, addr: MemAddr) {
        let line = self.line_size() as u64;
        assert!(
            addr % line == 0,
            "unaligned memory operation at {addr:#x} (line size {line})"
        );
    }
}

/// Construct a memory system by its configured name.
pub fn create_memory(
    ctx: &mut SimCtx,
    clock: crate::kernel::ClockId,
    cfg: &crate::config::Config,
    kind: &str,
) -> Result<Box<dyn MemorySystem>, ConfigError> {
    match kind {
        "ParallelMemory" => Ok(Box::new(parallel::ParallelMemory::new(ctx, clock, cfg)?)),
        "BankedMemory" => Ok(Box::new(banked::BankedMemory::new(ctx, clock, cfg)?)),
        "DDRMemory" => Ok(Box::new(ddr::DdrMemory::new(ctx, clock, cfg)?)),
        "OneLevelCDMA" => Ok(Box::new(cdma::CdmaMemory::new(ctx, clock, cfg, false)?)),
        "TwoLevelCDMA" => Ok(Box::new(cdma::CdmaMemory::new(ctx, clock, cfg, true)?)),
        "ZLCDMA" => Ok(Box::new(zlcdma::ZlcdmaMemory::new(ctx, clock, cfg)?)),
        _ => Err(ConfigError::UnknownName {
            what: "memory system",
            name: kind.to_string(),
        }),
    }
}
