use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Software breakpoint instruction (`int3`).
pub const TRAP_INSN: u8 = 0xCC;

/// Saved state of one patched address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Patch {
    pub addr: usize,
    pub saved: u8,
}

/// Owner of breakpoint bookkeeping.
///
/// The inferior operation table only patches text, it asks the manager which breakpoints exist
/// and which original bytes they replaced.
pub trait BreakpointManager: Send + Sync {
    /// Remember a freshly patched address, return its id.
    fn register(&self, patch: Patch) -> u64;

    /// Id of the breakpoint at `addr`, if any.
    fn find_by_address(&self, addr: usize) -> Option<u64>;

    fn lookup(&self, id: u64) -> Option<Patch>;

    fn unregister(&self, id: u64) -> Option<Patch>;
}

/// In-memory breakpoint manager used by the server binary.
#[derive(Default)]
pub struct BreakpointTable {
    next_id: AtomicU64,
    patches: Mutex<HashMap<u64, Patch>>,
}

impl BreakpointTable {
    fn patches(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Patch>> {
        // a poisoned table is still consistent: every mutation is a single map operation
        self.patches.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BreakpointManager for BreakpointTable {
    fn register(&self, patch: Patch) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.patches().insert(id, patch);
        id
    }

    fn find_by_address(&self, addr: usize) -> Option<u64> {
        self.patches()
            .iter()
            .find(|(_, p)| p.addr == addr)
            .map(|(id, _)| *id)
    }

    fn lookup(&self, id: u64) -> Option<Patch> {
        self.patches().get(&id).copied()
    }

    fn unregister(&self, id: u64) -> Option<Patch> {
        self.patches().remove(&id)
    }
}
