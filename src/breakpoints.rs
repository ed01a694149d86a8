/*!
Breakpoint manager.

Numbered breakpoints on memory addresses, each with a mode set (read,
write, execute, fetch, trace-only) and an enabled bit. Checks are cheap
when the manager is disabled. Trace-only breakpoints log the hit and do
not stop the run; everything else accumulates into the active set until
`resume` is called.
*/

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::mem::MemAddr;

pub const BREAK_FETCH: u8 = 1;
pub const BREAK_EXEC: u8 = 2;
pub const BREAK_READ: u8 = 4;
pub const BREAK_WRITE: u8 = 8;
pub const BREAK_TRACE: u8 = 16;

#[derive(Debug, Clone)]
struct BreakPoint {
    id: u32,
    modes: u8,
    enabled: bool,
}

/// One triggered breakpoint: where, which mode, and who hit it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ActiveBreak {
    pub addr: MemAddr,
    pub mode: u8,
    pub component: String,
}

#[derive(Debug, Default)]
pub struct BreakPointManager {
    points: BTreeMap<MemAddr, BreakPoint>,
    active: Vec<ActiveBreak>,
    counter: u32,
    enabled: bool,
}

fn mode_name(mode: u8) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (BREAK_FETCH, "fetch"),
        (BREAK_EXEC, "exec"),
        (BREAK_READ, "read"),
        (BREAK_WRITE, "write"),
        (BREAK_TRACE, "trace"),
    ] {
        if mode & bit != 0 {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(name);
        }
    }
    out
}

impl BreakPointManager {
    pub fn new() -> Self {
        BreakPointManager::default()
    }

    pub fn enable_checks(&mut self) {
        self.enabled = true;
    }

    pub fn disable_checks(&mut self) {
        self.enabled = false;
    }

    /// Add (or extend) a breakpoint; returns its number.
    pub fn add(&mut self, addr: MemAddr, modes: u8) -> u32 {
        if let Some(bp) = self.points.get_mut(&addr) {
            bp.modes |= modes;
            bp.enabled = true;
            return bp.id;
        }
        let id = self.counter;
        self.counter += 1;
        self.points.insert(
            addr,
            BreakPoint {
                id,
                modes,
                enabled: true,
            },
        );
        self.enabled = true;
        id
    }

    pub fn enable(&mut self, id: u32) {
        if let Some(bp) = self.points.values_mut().find(|bp| bp.id == id) {
            bp.enabled = true;
        }
    }

    pub fn disable(&mut self, id: u32) {
        if let Some(bp) = self.points.values_mut().find(|bp| bp.id == id) {
            bp.enabled = false;
        }
    }

    pub fn delete(&mut self, id: u32) {
        self.points.retain(|_, bp| bp.id != id);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Test an access against the table. Trace-only hits are logged and do
    /// not become active.
    pub fn check(&mut self, mode: u8, addr: MemAddr, component: &str) {
        if !self.enabled {
            return;
        }
        let Some(bp) = self.points.get(&addr) else {
            return;
        };
        if !bp.enabled || bp.modes & mode == 0 {
            return;
        }
        if bp.modes & BREAK_TRACE != 0 {
            log::info!(
                "trace point {:#x} ({}) touched by {component}",
                addr,
                mode_name(mode)
            );
            return;
        }
        let hit = ActiveBreak {
            addr,
            mode,
            component: component.to_string(),
        };
        if !self.active.contains(&hit) {
            self.active.push(hit);
        }
    }

    pub fn hit(&self) -> bool {
        !self.active.is_empty()
    }

    /// Report and clear the active set before continuing.
    pub fn resume(&mut self) -> Vec<ActiveBreak> {
        std::mem::take(&mut self.active)
    }

    pub fn list(&self) -> String {
        let mut out = String::new();
        for (addr, bp) in &self.points {
            let _ = writeln!(
                out,
                "{:3} {addr:#018x} {} {}",
                bp.id,
                mode_name(bp.modes),
                if bp.enabled { "enabled" } else { "disabled" }
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_only_matching_modes() {
        let mut mgr = BreakPointManager::new();
        let id = mgr.add(0x1000, BREAK_READ | BREAK_WRITE);
        mgr.check(BREAK_EXEC, 0x1000, "cpu0");
        assert!(!mgr.hit());
        mgr.check(BREAK_READ, 0x1000, "cpu0");
        assert!(mgr.hit());
        let hits = mgr.resume();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].addr, 0x1000);
        assert!(!mgr.hit());
        let _ = id;
    }

    #[test]
    fn disabled_points_do_not_fire() {
        let mut mgr = BreakPointManager::new();
        let id = mgr.add(0x40, BREAK_WRITE);
        mgr.disable(id);
        mgr.check(BREAK_WRITE, 0x40, "cache0");
        assert!(!mgr.hit());
        mgr.enable(id);
        mgr.check(BREAK_WRITE, 0x40, "cache0");
        assert!(mgr.hit());
    }

    #[test]
    fn trace_only_does_not_stop() {
        let mut mgr = BreakPointManager::new();
        mgr.add(0x80, BREAK_READ | BREAK_TRACE);
        mgr.check(BREAK_READ, 0x80, "cpu1");
        assert!(!mgr.hit());
    }

    #[test]
    fn delete_and_list() {
        let mut mgr = BreakPointManager::new();
        let a = mgr.add(0x10, BREAK_EXEC);
        let b = mgr.add(0x20, BREAK_READ);
        assert!(mgr.list().contains("exec"));
        mgr.delete(a);
        assert!(!mgr.list().contains("exec"));
        assert!(mgr.list().contains("read"));
        let _ = b;
    }
}
