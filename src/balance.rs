//! Producer load balancing
//!
//! Producers of a group are partitioned over the group's ready
//! aggregators: with `p` producers and `a` ready aggregators, the first
//! `p mod a` aggregators in declared order take `p div a + 1` consecutive
//! producers, the rest take `p div a`. The split is a pure function of
//! its inputs, so two passes over the same fleet state produce the same
//! assignment and the same command stream.

use std::collections::BTreeMap;

use crate::model::{Aggregator, Producer};

/// Assignment of producer names per aggregator name for one group.
pub type GroupAssignment = BTreeMap<String, Vec<String>>;

/// Partition `producers` (declared order) across `ready` aggregators
/// (declared order). Empty when no aggregator is ready.
pub fn balance_group(producers: &[Producer], ready: &[&Aggregator]) -> GroupAssignment {
    let mut assignment = GroupAssignment::new();
    if ready.is_empty() {
        return assignment;
    }

    let base = producers.len() / ready.len();
    let extra = producers.len() % ready.len();

    let mut cursor = 0;
    for (idx, agg) in ready.iter().enumerate() {
        let share = base + usize::from(idx < extra);
        let names = producers[cursor..cursor + share]
            .iter()
            .map(|p| p.name.clone())
            .collect();
        cursor += share;
        assignment.insert(agg.name.clone(), names);
    }
    assignment
}
