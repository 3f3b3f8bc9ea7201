//! Graphviz DOT export, grounded on `dispenso/utils/graph_dot.h`
//! (`graphsToDot`): one cluster per subgraph, nodes colored by completion
//! state, bidirectional-propagation edges style-coded.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::Graph;

/// Renders `graph` as Graphviz DOT text. `names` optionally labels nodes
/// by id; unnamed nodes fall back to their numeric index.
pub fn to_dot(graph: &Graph, names: &HashMap<usize, String>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph {{");
    let _ = writeln!(out, "  rankdir = LR");
    let _ = writeln!(
        out,
        "  node [shape = rectangle, style = filled, colorscheme=pastel19]"
    );
    let _ = writeln!(out, "  graph [style = filled, color = Gray95]");

    for (sg_idx, node_ids) in graph.subgraph_node_ids().iter().enumerate() {
        if sg_idx != 0 {
            let _ = writeln!(out, "  subgraph cluster_{sg_idx} {{ label = \"{sg_idx}\"");
        }
        for &idx in node_ids {
            let label = names
                .get(&idx)
                .cloned()
                .unwrap_or_else(|| idx.to_string());
            let color = if graph.is_completed(idx) { 2 } else { 1 };
            let _ = writeln!(out, "    {idx} [color = {color} label = \"{label}\"]");
        }
        if sg_idx != 0 {
            let _ = writeln!(out, "  }}");
        }
    }

    for (sg_idx, node_ids) in graph.subgraph_node_ids().iter().enumerate() {
        let _ = sg_idx;
        for &idx in node_ids {
            for d in graph.dependents_of(idx) {
                if graph.group_root(idx) == graph.group_root(d) {
                    let _ = writeln!(out, "    {idx} -> {d} [arrowhead=onormal]");
                } else {
                    let _ = writeln!(out, "    {idx} -> {d}");
                }
            }
        }
    }

    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn renders_nodes_and_edges() {
        let mut g = Graph::new();
        let a = g.add_node(0, || {});
        let b = g.add_node(0, || {});
        g.add_dependency(b, a);

        let dot = to_dot(&g, &HashMap::new());
        assert!(dot.contains("digraph {"));
        assert!(dot.contains(&format!("{} -> {}", a.0, b.0)));
    }
}
