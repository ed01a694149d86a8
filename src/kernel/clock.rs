/*!
Clock domains and master-tick scheduling.

A clock has an integer frequency (in abstract MHz) and a monotonically
increasing cycle counter. Several domains coexist; the kernel advances a
master counter running at the least common multiple of all frequencies and
fires each clock whenever the master counter crosses one of its period
boundaries. Clocks fire in creation order within a master tick, which keeps
multi-domain runs deterministic.
*/

/// Cycle number within one clock domain.
pub type CycleNo = u64;

/// Identifies a clock domain. Clocks are created once, before the first
/// cycle, and live for the whole simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(pub(crate) usize);

#[derive(Debug)]
pub(crate) struct ClockSlot {
    pub name: String,
    pub freq: u64,
    /// Master ticks per cycle of this clock. Recomputed whenever a clock
    /// is added (the master frequency is the LCM of all frequencies).
    pub period: u64,
    pub cycle: CycleNo,
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

pub(crate) fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// The set of clock domains, owned by the simulation context.
#[derive(Debug, Default)]
pub(crate) struct ClockRegistry {
    pub slots: Vec<ClockSlot>,
    pub master_freq: u64,
    /// Master ticks elapsed so far.
    pub master: u64,
}

impl ClockRegistry {
    pub fn create(&mut self, name: &str, freq: u64) -> ClockId {
        assert!(freq > 0, "clock `{name}` must have a non-zero frequency");
        let id = ClockId(self.slots.len());
        self.slots.push(ClockSlot {
            name: name.to_string(),
            freq,
            period: 1,
            cycle: 0,
        });
        self.master_freq = self.slots.iter().fold(1, |m, c| lcm(m, c.freq));
        for slot in &mut self.slots {
            slot.period = self.master_freq / slot.freq;
        }
        id
    }

    /// Clocks that fire at the current master tick, in creation order.
    pub fn ticking(&self) -> Vec<ClockId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, c)| self.master % c.period == 0)
            .map(|(i, _)| ClockId(i))
            .collect()
    }

    /// Advance the master counter to the next tick at which any clock fires.
    pub fn advance(&mut self) {
        let next = self
            .slots
            .iter()
            .map(|c| (self.master / c.period + 1) * c.period)
            .min()
            .expect("no clocks registered");
        self.master = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_clock_fires_every_tick() {
        let mut reg = ClockRegistry::default();
        let c = reg.create("core", 100);
        assert_eq!(reg.ticking(), vec![c]);
        reg.advance();
        assert_eq!(reg.master, 1);
        assert_eq!(reg.ticking(), vec![c]);
    }

    #[test]
    fn two_domains_interleave_by_frequency() {
        let mut reg = ClockRegistry::default();
        let fast = reg.create("core", 200);
        let slow = reg.create("mem", 100);
        // Master runs at 200; the slow clock fires every second tick.
        assert_eq!(reg.ticking(), vec![fast, slow]);
        reg.advance();
        assert_eq!(reg.ticking(), vec![fast]);
        reg.advance();
        assert_eq!(reg.ticking(), vec![fast, slow]);
    }

    #[test]
    fn lcm_master_frequency() {
        let mut reg = ClockRegistry::default();
        reg.create("a", 300);
        reg.create("b", 200);
        assert_eq!(reg.master_freq, 600);
        assert_eq!(reg.slots[0].period, 2);
        assert_eq!(reg.slots[1].period, 3);
    }
}
