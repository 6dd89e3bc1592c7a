//! Small directed graph with labelled edges and a depth-first cycle search.

use std::collections::{BTreeMap, BTreeSet};

/// A cycle found in the graph. `edges[i]` links `nodes[i]` to
/// `nodes[(i + 1) % len]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Cycle<V, E> {
    pub(crate) nodes: Vec<V>,
    pub(crate) edges: Vec<E>,
}

pub(crate) struct Graph<V, E> {
    adjacency: BTreeMap<V, Vec<(V, E)>>,
}

impl<V, E> Graph<V, E>
where
    V: Ord + Copy,
    E: Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            adjacency: BTreeMap::new(),
        }
    }

    pub(crate) fn add_edge(&mut self, from: V, to: V, label: E) {
        self.adjacency.entry(from).or_default().push((to, label));
        self.adjacency.entry(to).or_default();
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = V> + '_ {
        self.adjacency.keys().copied()
    }

    /// First cycle reachable from `start`, in depth-first order
    pub(crate) fn find_cycle_from(&self, start: V) -> Option<Cycle<V, E>> {
        if !self.adjacency.contains_key(&start) {
            return None;
        }
        let mut search = Search {
            graph: self,
            path: Vec::new(),
            labels: Vec::new(),
            on_path: BTreeSet::new(),
            done: BTreeSet::new(),
        };
        search.visit(start)
    }
}

struct Search<'a, V, E> {
    graph: &'a Graph<V, E>,
    path: Vec<V>,
    /// `labels[i]` is the edge from `path[i]` to `path[i + 1]`
    labels: Vec<E>,
    on_path: BTreeSet<V>,
    done: BTreeSet<V>,
}

impl<V, E> Search<'_, V, E>
where
    V: Ord + Copy,
    E: Clone,
{
    fn visit(&mut self, node: V) -> Option<Cycle<V, E>> {
        self.path.push(node);
        self.on_path.insert(node);

        let graph = self.graph;
        if let Some(edges) = graph.adjacency.get(&node) {
            for (next, label) in edges {
                if self.on_path.contains(next) {
                    let start = self.path.iter().position(|v| v == next)?;
                    let mut edges: Vec<E> = self.labels[start..].to_vec();
                    edges.push(label.clone());
                    return Some(Cycle {
                        nodes: self.path[start..].to_vec(),
                        edges,
                    });
                }
                if self.done.contains(next) {
                    continue;
                }
                self.labels.push(label.clone());
                if let Some(cycle) = self.visit(*next) {
                    return Some(cycle);
                }
                self.labels.pop();
            }
        }

        self.path.pop();
        self.on_path.remove(&node);
        self.done.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_cycle() {
        let mut graph = Graph::new();
        graph.add_edge(1, 2, "a");
        graph.add_edge(2, 1, "b");

        let cycle = graph.find_cycle_from(1).unwrap();
        assert_eq!(cycle.nodes, vec![1, 2]);
        assert_eq!(cycle.edges, vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_reachable_but_not_through_start() {
        let mut graph = Graph::new();
        graph.add_edge(1, 2, "x");
        graph.add_edge(2, 3, "y");
        graph.add_edge(3, 2, "z");

        let cycle = graph.find_cycle_from(1).unwrap();
        assert_eq!(cycle.nodes, vec![2, 3]);
        assert_eq!(cycle.edges, vec!["y", "z"]);
    }

    #[test]
    fn test_acyclic_and_unknown_start() {
        let mut graph = Graph::new();
        graph.add_edge(1, 2, ());
        graph.add_edge(2, 3, ());
        graph.add_edge(1, 3, ());

        assert!(graph.find_cycle_from(1).is_none());
        assert!(graph.find_cycle_from(42).is_none());
        assert_eq!(graph.nodes().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_self_loop() {
        let mut graph = Graph::new();
        graph.add_edge(7, 7, "self");
        let cycle = graph.find_cycle_from(7).unwrap();
        assert_eq!(cycle.nodes, vec![7]);
        assert_eq!(cycle.edges, vec!["self"]);
    }
}
