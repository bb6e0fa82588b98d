// src/clustering/exact_matches.rs

use petgraph::graphmap::UnGraphMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::CanonicalAssignment;

/// One minimal edge per pair of equal-valued canonical-id groups: every
/// canonical id of a value group is linked to the group's smallest id.
/// Rows with a NULL in any subset column never match.
pub fn minimal_edges<I>(rows: I) -> Vec<(i32, i32)>
where
    I: IntoIterator<Item = (i32, Vec<Option<String>>)>,
{
    let mut groups: HashMap<Vec<String>, BTreeSet<i32>> = HashMap::new();
    for (canon_id, values) in rows {
        let Some(key) = values.into_iter().collect::<Option<Vec<String>>>() else {
            continue;
        };
        groups.entry(key).or_default().insert(canon_id);
    }

    let mut edges: BTreeSet<(i32, i32)> = BTreeSet::new();
    for ids in groups.values() {
        let mut iter = ids.iter();
        if let Some(&min) = iter.next() {
            edges.extend(iter.map(|&other| (min, other)));
        }
    }
    edges.into_iter().collect()
}

/// Connected components of the undirected edge set, found with an explicit
/// stack. Members are sorted; components are ordered by their smallest id.
pub fn connected_components(edges: &[(i32, i32)]) -> Vec<Vec<i32>> {
    let mut graph: UnGraphMap<i32, ()> = UnGraphMap::new();
    for &(a, b) in edges {
        if a != b {
            graph.add_edge(a, b, ());
        }
    }

    let mut nodes: Vec<i32> = graph.nodes().collect();
    nodes.sort_unstable();

    let mut visited: BTreeSet<i32> = BTreeSet::new();
    let mut components = Vec::new();
    for start in nodes {
        if visited.contains(&start) {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            component.push(current);
            for neighbor in graph.neighbors(current) {
                if !visited.contains(&neighbor) {
                    stack.push(neighbor);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }
    components
}

/// `member → representative` for every non-representative id, where the
/// representative is the component minimum.
pub fn component_rewrites(edges: &[(i32, i32)]) -> BTreeMap<i32, i32> {
    let mut rewrites = BTreeMap::new();
    for component in connected_components(edges) {
        let representative = component[0];
        for &member in &component[1..] {
            rewrites.insert(member, representative);
        }
    }
    rewrites
}

/// Rewrites canonical ids in place. Returns the number of rows changed.
pub fn apply_rewrites(assignments: &mut [CanonicalAssignment], rewrites: &BTreeMap<i32, i32>) -> usize {
    let mut changed = 0;
    for assignment in assignments.iter_mut() {
        if let Some(&representative) = rewrites.get(&assignment.canon_id) {
            assignment.canon_id = representative;
            changed += 1;
        }
    }
    changed
}

/// In-memory merge of one subset. `values` maps a record id to its full
/// field values; `positions` selects the subset columns.
pub fn merge_subset(
    assignments: &mut [CanonicalAssignment],
    values: &HashMap<i32, Vec<Option<String>>>,
    positions: &[usize],
) -> usize {
    let rows = assignments.iter().filter_map(|a| {
        values.get(&a.record_id).map(|v| {
            let subset = positions.iter().map(|&p| v.get(p).cloned().flatten()).collect();
            (a.canon_id, subset)
        })
    });
    let edges = minimal_edges(rows);
    let rewrites = component_rewrites(&edges);
    apply_rewrites(assignments, &rewrites)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(pairs: &[(i32, i32)]) -> Vec<CanonicalAssignment> {
        pairs
            .iter()
            .map(|&(record_id, canon_id)| CanonicalAssignment {
                record_id,
                canon_id,
                cluster_score: 1.0,
            })
            .collect()
    }

    fn v(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|x| x.map(str::to_string)).collect()
    }

    #[test]
    fn test_minimal_edges_link_to_group_min_and_skip_nulls() {
        let edges = minimal_edges(vec![
            (30, v(&[Some("x")])),
            (10, v(&[Some("x")])),
            (20, v(&[Some("x")])),
            (10, v(&[Some("x")])),
            (40, v(&[None])),
            (50, v(&[None])),
        ]);
        assert_eq!(edges, vec![(10, 20), (10, 30)]);
    }

    #[test]
    fn test_components_are_iterative_and_min_rooted() {
        // a long chain would overflow a recursive traversal at scale
        let chain: Vec<(i32, i32)> = (1..50_000).map(|i| (i + 1, i)).collect();
        let components = connected_components(&chain);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), 50_000);
        let rewrites = component_rewrites(&chain);
        assert!(rewrites.values().all(|&r| r == 1));
    }

    #[test]
    fn test_representative_independent_of_edge_order() {
        let edges = vec![(5, 9), (9, 2), (7, 8), (3, 5), (8, 11)];
        let expected = component_rewrites(&edges);
        let mut reversed = edges.clone();
        reversed.reverse();
        let flipped: Vec<(i32, i32)> = edges.iter().map(|&(a, b)| (b, a)).collect();
        assert_eq!(component_rewrites(&reversed), expected);
        assert_eq!(component_rewrites(&flipped), expected);
        assert_eq!(expected[&9], 2);
        assert_eq!(expected[&11], 7);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut assignments = assign(&[(1, 1), (2, 2), (3, 3), (4, 3)]);
        let values: HashMap<i32, Vec<Option<String>>> = HashMap::from([
            (1, v(&[Some("111")])),
            (2, v(&[Some("111")])),
            (3, v(&[Some("222")])),
            (4, v(&[Some("111")])),
        ]);
        assert_eq!(merge_subset(&mut assignments, &values, &[0]), 3);
        assert!(assignments.iter().all(|a| a.canon_id == 1));

        let before = assignments.clone();
        assert_eq!(merge_subset(&mut assignments, &values, &[0]), 0);
        assert_eq!(assignments, before);
    }

    #[test]
    fn test_sequential_subsets_operate_on_collapsed_ids() {
        // columns: ssn, last_name, dob
        let values: HashMap<i32, Vec<Option<String>>> = HashMap::from([
            (1, v(&[Some("123"), Some("smith"), Some("1980")])),
            (2, v(&[Some("123"), Some("jones"), Some("1975")])),
            (3, v(&[None, Some("jones"), Some("1975")])),
        ]);
        let mut assignments = assign(&[(1, 10), (2, 20), (3, 30)]);

        merge_subset(&mut assignments, &values, &[0]);
        assert_eq!(assignments[1].canon_id, 10);
        assert_eq!(assignments[2].canon_id, 30);

        merge_subset(&mut assignments, &values, &[1, 2]);
        assert!(assignments.iter().all(|a| a.canon_id == 10));
    }
}
