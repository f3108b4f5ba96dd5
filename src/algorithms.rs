use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::models::{ClosureViolation, Link, NodeId};

/// Direct edges only, keyed by ancestor.
pub fn direct_adjacency(links: &[Link]) -> BTreeMap<NodeId, Vec<NodeId>> {
    let mut adjacency: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for link in links.iter().filter(|link| link.direct) {
        adjacency.entry(link.descendant_id).or_default();
        adjacency
            .entry(link.ancestor_id)
            .or_default()
            .push(link.descendant_id);
    }
    adjacency
}

/// Kahn's algorithm over the direct edges. `None` when they contain a cycle.
fn topological_order(adjacency: &BTreeMap<NodeId, Vec<NodeId>>) -> Option<Vec<NodeId>> {
    let mut indegree: BTreeMap<NodeId, usize> =
        adjacency.keys().map(|node_id| (*node_id, 0)).collect();
    for children in adjacency.values() {
        for child in children {
            *indegree.entry(*child).or_default() += 1;
        }
    }

    let mut queue = indegree
        .iter()
        .filter_map(|(node_id, degree)| (*degree == 0).then_some(*node_id))
        .collect::<VecDeque<_>>();

    let mut ordered = Vec::with_capacity(indegree.len());
    while let Some(node_id) = queue.pop_front() {
        ordered.push(node_id);
        if let Some(children) = adjacency.get(&node_id) {
            for child in children {
                if let Some(child_degree) = indegree.get_mut(child) {
                    *child_degree -= 1;
                    if *child_degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    (ordered.len() == indegree.len()).then_some(ordered)
}

/// Number of distinct paths between every connected pair, recomputed from the
/// direct edges. Fails with `CycleDetected` when the direct edges contain a
/// cycle, or `PathCountOverflow` for the first pair whose total exceeds `i64`.
pub fn path_counts(links: &[Link]) -> Result<BTreeMap<(NodeId, NodeId), i64>, ClosureViolation> {
    let adjacency = direct_adjacency(links);
    let order = topological_order(&adjacency).ok_or(ClosureViolation::CycleDetected)?;

    let mut reach: HashMap<NodeId, BTreeMap<NodeId, i64>> = HashMap::with_capacity(order.len());
    for node_id in order.iter().rev() {
        let mut paths: BTreeMap<NodeId, i64> = BTreeMap::new();
        for child in adjacency.get(node_id).into_iter().flatten() {
            add_paths(&mut paths, *node_id, *child, 1)?;
            if let Some(below) = reach.get(child) {
                for (descendant, count) in below {
                    add_paths(&mut paths, *node_id, *descendant, *count)?;
                }
            }
        }
        reach.insert(*node_id, paths);
    }

    let mut counts = BTreeMap::new();
    for (ancestor, paths) in reach {
        for (descendant, count) in paths {
            counts.insert((ancestor, descendant), count);
        }
    }
    Ok(counts)
}

fn add_paths(
    paths: &mut BTreeMap<NodeId, i64>,
    ancestor_id: NodeId,
    descendant_id: NodeId,
    count: i64,
) -> Result<(), ClosureViolation> {
    let total = paths.entry(descendant_id).or_default();
    *total = total
        .checked_add(count)
        .ok_or(ClosureViolation::PathCountOverflow {
            ancestor_id,
            descendant_id,
        })?;
    Ok(())
}

/// Compares a stored closure against the one implied by its direct links.
/// Links are expected to share one scope.
pub fn closure_violations(links: &[Link]) -> Vec<ClosureViolation> {
    let mut violations = Vec::new();

    let stored: BTreeMap<(NodeId, NodeId), &Link> = links
        .iter()
        .map(|link| ((link.ancestor_id, link.descendant_id), link))
        .collect();

    for link in links {
        if link.ancestor_id == link.descendant_id {
            violations.push(ClosureViolation::SelfLoop {
                node_id: link.ancestor_id,
            });
        }
    }

    let mut opposite = BTreeSet::new();
    for (ancestor, descendant) in stored.keys() {
        if ancestor < descendant && stored.contains_key(&(*descendant, *ancestor)) {
            opposite.insert((*ancestor, *descendant));
        }
    }
    violations.extend(
        opposite
            .into_iter()
            .map(|(ancestor_id, descendant_id)| ClosureViolation::OppositeLinks {
                ancestor_id,
                descendant_id,
            }),
    );

    let expected = match path_counts(links) {
        Ok(expected) => expected,
        Err(violation) => {
            violations.push(violation);
            return violations;
        }
    };

    for (&(ancestor_id, descendant_id), &paths) in &expected {
        match stored.get(&(ancestor_id, descendant_id)) {
            None => violations.push(ClosureViolation::MissingLink {
                ancestor_id,
                descendant_id,
                expected_count: paths,
            }),
            Some(link) => {
                let expected_count = paths - i64::from(link.direct);
                if link.count != expected_count {
                    violations.push(ClosureViolation::CountMismatch {
                        ancestor_id,
                        descendant_id,
                        expected: expected_count,
                        actual: link.count,
                    });
                }
            }
        }
    }

    for &(ancestor_id, descendant_id) in stored.keys() {
        if ancestor_id != descendant_id && !expected.contains_key(&(ancestor_id, descendant_id)) {
            violations.push(ClosureViolation::UnexpectedLink {
                ancestor_id,
                descendant_id,
            });
        }
    }

    violations
}
