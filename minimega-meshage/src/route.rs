//! Shortest-path routing over the adjacency view

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::wire::View;

/// Compute the shortest path from `from` to `to` in the view, treating
/// every reported peering as bidirectional. BFS expands neighbors in
/// lexicographic order, so ties resolve to the lexicographically
/// smallest next hop and routes are stable across recomputation.
pub fn shortest_path(view: &View, from: &str, to: &str) -> Option<Vec<String>> {
    if from == to {
        return Some(vec![from.to_string()]);
    }

    let mut prev: HashMap<&str, &str> = HashMap::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(from);
    prev.insert(from, from);

    while let Some(current) = queue.pop_front() {
        for next in neighbors(view, current) {
            if prev.contains_key(next) {
                continue;
            }
            prev.insert(next, current);

            if next == to {
                let mut path = vec![to.to_string()];
                let mut hop = to;
                while hop != from {
                    hop = prev[hop];
                    path.push(hop.to_string());
                }
                path.reverse();
                return Some(path);
            }

            queue.push_back(next);
        }
    }

    None
}

/// Union of the node's own row and every row that lists it, sorted
fn neighbors<'a>(view: &'a View, name: &str) -> BTreeSet<&'a str> {
    let mut out: BTreeSet<&str> = BTreeSet::new();

    if let Some(peers) = view.get(name) {
        out.extend(peers.iter().map(String::as_str));
    }

    for (other, peers) in view {
        if peers.contains(name) {
            out.insert(other.as_str());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(edges: &[(&str, &[&str])]) -> View {
        edges
            .iter()
            .map(|(name, peers)| {
                (
                    name.to_string(),
                    peers.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn line_graph_routes_through_middle() {
        let v = view(&[
            ("a", &["b"] as &[&str]),
            ("b", &["a", "c"]),
            ("c", &["b"]),
        ]);

        assert_eq!(
            shortest_path(&v, "a", "c"),
            Some(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn missing_destination_has_no_route() {
        let v = view(&[("a", &["b"] as &[&str]), ("b", &["a"])]);
        assert_eq!(shortest_path(&v, "a", "z"), None);
    }

    #[test]
    fn ties_break_lexicographically() {
        // two equal-length paths a-b-d and a-c-d; b wins
        let v = view(&[
            ("a", &["b", "c"] as &[&str]),
            ("b", &["a", "d"]),
            ("c", &["a", "d"]),
            ("d", &["b", "c"]),
        ]);

        assert_eq!(
            shortest_path(&v, "a", "d"),
            Some(vec!["a".into(), "b".into(), "d".into()])
        );
    }

    #[test]
    fn asymmetric_rows_still_route() {
        // only b reports the b-c edge; routing treats it as bidirectional
        let v = view(&[("a", &["b"] as &[&str]), ("b", &["a", "c"])]);

        assert_eq!(
            shortest_path(&v, "c", "a"),
            Some(vec!["c".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn direct_peer_is_a_two_hop_route() {
        let v = view(&[("a", &["b"] as &[&str]), ("b", &["a"])]);
        assert_eq!(
            shortest_path(&v, "a", "b"),
            Some(vec!["a".into(), "b".into()])
        );
    }
}
