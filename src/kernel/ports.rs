/*!
Arbitrated services.

A service guards one resource. The set of eligible processes is fixed after
construction; each cycle the processes that intend to use the resource
register themselves during the Acquire phase, the service resolves a single
winner before the Check phase, and `invoke` then answers whether the calling
process holds the service this cycle. Arbitration state (the cyclic
position) is committed at the cycle boundary, and only when the winner
actually invoked the service during its Commit run.

Disciplines:
- priority: registration order wins;
- cyclic: round robin over all members;
- priority-cyclic: members with a priority level win first, the rest form a
  round-robin cohort behind them.
*/

use crate::kernel::process::ProcessId;
use crate::kernel::{Phase, SimCtx};

/// Identifies an arbitrated service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Priority,
    Cyclic,
    PriorityCyclic,
}

#[derive(Debug)]
struct Member {
    pid: ProcessId,
    /// Priority level; `None` puts the member in the cyclic cohort.
    priority: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Service {
    name: String,
    discipline: Discipline,
    members: Vec<Member>,
    /// Member indexes that requested the service this cycle.
    requests: Vec<usize>,
    winner: Option<usize>,
    invoked: bool,
    cyclic_pos: usize,
}

impl Service {
    fn member_index(&self, pid: ProcessId) -> usize {
        self.members
            .iter()
            .position(|m| m.pid == pid)
            .unwrap_or_else(|| {
                panic!("service `{}`: process not registered as a member", self.name)
            })
    }

    fn arbitrate(&mut self) {
        self.winner = None;
        if self.requests.is_empty() {
            return;
        }
        // Priority members first, lowest level wins.
        let best = self
            .requests
            .iter()
            .filter_map(|&i| self.members[i].priority.map(|p| (p, i)))
            .min();
        if let Some((_, i)) = best {
            self.winner = Some(i);
            return;
        }
        // Cyclic cohort: first requester at or after the rotating position.
        let n = self.members.len();
        for off in 0..n {
            let i = (self.cyclic_pos + off) % n;
            if self.members[i].priority.is_none() && self.requests.contains(&i) {
                self.winner = Some(i);
                return;
            }
        }
    }

    fn end_cycle(&mut self) {
        if self.invoked {
            if let Some(w) = self.winner {
                if self.members[w].priority.is_none() {
                    self.cyclic_pos = (w + 1) % self.members.len();
                }
            }
        }
        self.requests.clear();
        self.winner = None;
        self.invoked = false;
    }
}

impl ServiceId {
    /// Contend for / query the service. During Acquire this registers the
    /// calling process as a contender and optimistically returns true;
    /// during Check and Commit it reports whether the caller won.
    pub fn invoke(&self, ctx: &mut SimCtx) -> bool {
        let pid = ctx.current_process();
        let phase = ctx.phase();
        let svc = &mut ctx.services[self.0];
        let idx = svc.member_index(pid);
        match phase {
            Phase::Acquire => {
                if !svc.requests.contains(&idx) {
                    svc.requests.push(idx);
                }
                true
            }
            Phase::Check | Phase::Commit => {
                let won = svc.winner == Some(idx);
                if won && phase == Phase::Commit {
                    svc.invoked = true;
                }
                won
            }
            _ => panic!("service `{}`: invoked outside a cycle phase", svc.name),
        }
    }
}

impl SimCtx {
    pub fn create_service(&mut self, name: &str, discipline: Discipline) -> ServiceId {
        let id = ServiceId(self.services.len());
        self.services.push(Service {
            name: name.to_string(),
            discipline,
            members: Vec::new(),
            requests: Vec::new(),
            winner: None,
            invoked: false,
            cyclic_pos: 0,
        });
        id
    }

    /// Add a member. Priority-discipline services assign priority by
    /// registration order; cyclic services put everyone in the round-robin
    /// cohort.
    pub fn service_add(&mut self, service: ServiceId, pid: ProcessId) {
        let svc = &mut self.services[service.0];
        let priority = match svc.discipline {
            Discipline::Priority => Some(svc.members.len()),
            Discipline::Cyclic => None,
            Discipline::PriorityCyclic => Some(svc.members.len()),
        };
        svc.members.push(Member { pid, priority });
    }

    /// Add a member to the cyclic cohort of a priority-cyclic (or cyclic)
    /// service.
    pub fn service_add_cyclic(&mut self, service: ServiceId, pid: ProcessId) {
        let svc = &mut self.services[service.0];
        svc.members.push(Member { pid, priority: None });
    }

    pub(crate) fn arbitrate_services(&mut self) {
        for svc in &mut self.services {
            svc.arbitrate();
        }
    }

    pub(crate) fn end_cycle_services(&mut self) {
        for svc in &mut self.services {
            svc.end_cycle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(discipline: Discipline, members: &[(ProcessId, Option<usize>)]) -> Service {
        Service {
            name: "p_test".into(),
            discipline,
            members: members
                .iter()
                .map(|&(pid, priority)| Member { pid, priority })
                .collect(),
            requests: Vec::new(),
            winner: None,
            invoked: false,
            cyclic_pos: 0,
        }
    }

    #[test]
    fn priority_discipline_prefers_registration_order() {
        let mut svc = service(
            Discipline::Priority,
            &[
                (ProcessId(10), Some(0)),
                (ProcessId(11), Some(1)),
                (ProcessId(12), Some(2)),
            ],
        );
        svc.requests = vec![2, 1];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(1));
    }

    #[test]
    fn cyclic_discipline_rotates_past_the_last_winner() {
        let mut svc = service(
            Discipline::Cyclic,
            &[
                (ProcessId(10), None),
                (ProcessId(11), None),
                (ProcessId(12), None),
            ],
        );
        svc.requests = vec![0, 1, 2];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(0));
        svc.invoked = true;
        svc.end_cycle();
        svc.requests = vec![0, 1, 2];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(1), "rotation moved past the winner");
    }

    #[test]
    fn cyclic_position_holds_when_the_winner_never_invoked() {
        let mut svc = service(
            Discipline::Cyclic,
            &[(ProcessId(10), None), (ProcessId(11), None)],
        );
        svc.requests = vec![0, 1];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(0));
        // The winner's step failed before invoking in its Commit run.
        svc.end_cycle();
        svc.requests = vec![0, 1];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(0));
    }

    #[test]
    fn priority_members_preempt_the_cyclic_cohort() {
        let mut svc = service(
            Discipline::PriorityCyclic,
            &[
                (ProcessId(10), Some(0)),
                (ProcessId(11), None),
                (ProcessId(12), None),
            ],
        );
        svc.requests = vec![1, 2];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(1), "cyclic cohort wins when unopposed");
        svc.invoked = true;
        svc.end_cycle();
        svc.requests = vec![0, 1, 2];
        svc.arbitrate();
        assert_eq!(svc.winner, Some(0), "priority member preempts");
    }

    #[test]
    fn no_requests_means_no_winner() {
        let mut svc = service(Discipline::Cyclic, &[(ProcessId(10), None)]);
        svc.arbitrate();
        assert_eq!(svc.winner, None);
    }
}
