//! Exporters rendering an analysed graph as text, JSON, or DOT.

use serde::Serialize;

use crate::graph::{TACBasicBlock, TACGraph};

const BLOCK_SEP: &str = "\n\n-----\n\n";
const SECTION_SEP: &str = "---";
/// Pseudo-node jumped to by blocks whose destination never resolved.
const UNRES_DEST: &str = "?";

/// Render one block in the canonical record layout.
pub fn block_to_string(cfg: &TACGraph, block: &TACBasicBlock) -> String {
    let idents = |ids: &[primitives::variable::BlockId]| -> String {
        cfg.sort_blocks(ids.iter().copied())
            .into_iter()
            .map(|id| cfg[id].ident())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut out = String::new();
    out.push_str(&format!("Block {}\n", block.ident()));
    out.push_str(&format!("[{:#x}:{:#x}]\n", block.entry, block.exit));
    out.push_str(SECTION_SEP);
    out.push('\n');
    out.push_str(&format!("Predecessors: [{}]\n", idents(&block.preds)));
    out.push_str(&format!("Successors: [{}]", idents(&block.succs)));
    if block.has_unresolved_jump {
        out.push_str("\nHas unresolved jump.");
    }
    out.push('\n');
    out.push_str(SECTION_SEP);
    out.push('\n');
    for op in &block.tac_ops {
        out.push_str(&format!("{op}\n"));
    }
    out.push_str(SECTION_SEP);
    out.push('\n');
    out.push_str(&format!("Entry stack: {}\n", block.entry_stack));
    out.push_str(&format!("Stack pops: {}\n", block.delta_stack.empty_pops));
    out.push_str(&format!("Stack additions: {}\n", block.delta_stack));
    out.push_str(&format!("Exit stack: {}", block.exit_stack));
    out
}

/// Render the whole graph as text, one record per block in address order.
pub fn cfg_to_string(cfg: &TACGraph) -> String {
    cfg.sorted_traversal()
        .into_iter()
        .map(|id| block_to_string(cfg, &cfg[id]))
        .collect::<Vec<_>>()
        .join(BLOCK_SEP)
}

#[derive(Debug, Serialize)]
struct JsonGraph {
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
}

/// Render the graph topology as JSON: nodes are block identifiers, edges
/// are (pred, succ) identifier pairs.
pub fn cfg_to_json(cfg: &TACGraph) -> String {
    let nodes = cfg
        .sorted_traversal()
        .into_iter()
        .map(|id| cfg[id].ident())
        .collect();
    let mut edges: Vec<(String, String)> = cfg
        .edge_list()
        .into_iter()
        .map(|(p, s)| (cfg[p].ident(), cfg[s].ident()))
        .collect();
    edges.sort();

    let graph = JsonGraph { nodes, edges };
    serde_json::to_string_pretty(&graph).unwrap_or_default()
}

/// Render the graph topology in DOT form, with an auxiliary `?` node as
/// the target of unresolved jumps.
pub fn cfg_to_dot(cfg: &TACGraph) -> String {
    let mut out = String::from("digraph cfg {\n");
    for id in cfg.sorted_traversal() {
        out.push_str(&format!("  \"{}\";\n", cfg[id].ident()));
    }
    for id in cfg.sorted_traversal() {
        for succ in cfg.sort_blocks(cfg[id].succs.clone()) {
            out.push_str(&format!(
                "  \"{}\" -> \"{}\";\n",
                cfg[id].ident(),
                cfg[succ].ident()
            ));
        }
        if cfg[id].has_unresolved_jump {
            out.push_str(&format!("  \"{}\" -> \"{UNRES_DEST}\";\n", cfg[id].ident()));
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::analyse_graph;
    use crate::settings::Settings;

    fn analysed(hex: &str) -> TACGraph {
        let mut settings = Settings::default();
        let mut graph = TACGraph::from_bytecode(hex, &settings).unwrap();
        analyse_graph(&mut graph, &mut settings).unwrap();
        graph
    }

    #[test]
    fn text_record_layout() {
        let graph = analysed("6003565b00");
        let text = cfg_to_string(&graph);

        assert!(text.starts_with("Block 0x0\n[0x0:0x2]\n---\n"));
        assert!(text.contains("Predecessors: []\nSuccessors: [0x3]\n---\n"));
        assert!(text.contains("0x0: V0 = 0x3\n"));
        assert!(text.contains("0x2: JUMP 0x3\n"));
        assert!(text.contains("\n\n-----\n\nBlock 0x3\n"));
        assert!(text.contains("Predecessors: [0x0]"));
        assert!(text.contains("Stack pops: 0"));
        assert!(!text.contains("Has unresolved jump."));
    }

    #[test]
    fn unresolved_jump_is_reported() {
        // Jump on unconstrained calldata.
        let graph = analysed("6000355600");
        let text = cfg_to_string(&graph);
        assert!(text.contains("Has unresolved jump."));

        let dot = cfg_to_dot(&graph);
        assert!(dot.contains("-> \"?\";"));
    }

    #[test]
    fn json_graph_topology() {
        let graph = analysed("6003565b00");
        let json: serde_json::Value = serde_json::from_str(&cfg_to_json(&graph)).unwrap();
        assert_eq!(json["nodes"], serde_json::json!(["0x0", "0x3"]));
        assert_eq!(json["edges"], serde_json::json!([["0x0", "0x3"]]));
    }
}
