use std::collections::HashSet;

use foreman_executor::Machine;

use crate::candidate::Candidate;

/// Greedily assign machines to candidates.
///
/// `candidates` must already be in dispatch order; each takes the first
/// eligible machine, machines sorted by ID so the assignment is
/// deterministic. Greedy is deliberate: scores are well separated in
/// practice and an optimal matching would buy little.
pub fn assign(candidates: &[Candidate], machines: &[Machine]) -> Vec<(usize, String)> {
    let mut pool: Vec<&Machine> = machines.iter().collect();
    pool.sort_by(|a, b| a.id.cmp(&b.id));
    let mut taken: HashSet<&str> = HashSet::new();
    let mut assignments = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let machine = pool
            .iter()
            .find(|m| !taken.contains(m.id.as_str()) && m.can_run(&candidate.spec.dimensions));
        if let Some(machine) = machine {
            taken.insert(machine.id.as_str());
            assignments.push((index, machine.id.clone()));
        }
    }
    assignments
}
