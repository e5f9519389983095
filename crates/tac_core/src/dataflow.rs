//! Fixed-point dataflow analyses over TAC control flow graphs.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use primitives::lattice::{IntLattice, Lattice};
use primitives::stack::VariableStack;
use primitives::variable::BlockId;

use crate::error::Result;
use crate::function::FunctionExtraction;
use crate::graph::TACGraph;
use crate::settings::Settings;

/// Statistics collected while analysing a graph, populated when the
/// `analytics` setting is on.
#[derive(Debug, Default, Serialize)]
pub struct Analytics {
    /// Whether the outer loop gave up before reaching a fixed point.
    pub bailout: bool,
    /// Elapsed seconds at the time of bailout.
    pub bail_time: Option<f64>,
    /// Number of outer dataflow iterations performed.
    pub num_iterations: u64,
    /// Identifiers of blocks removed as unreachable.
    pub unreachable_blocks: Vec<String>,
    /// Number of blocks in the final graph.
    pub num_blocks: usize,
    /// Per-block (in-degree, out-degree, duplication multiplicity).
    pub blocks: BTreeMap<String, (usize, usize, usize)>,
    /// Signatures of extracted public functions.
    pub funcs: Vec<String>,
    /// Number of extracted private functions.
    pub n_private_funcs: usize,
}

/// Infer a CFG's structure by performing dataflow analyses to resolve new
/// edges, until a fixed point, the max time, or the max iteration count is
/// reached. The graph is modified in place.
pub fn analyse_graph(cfg: &mut TACGraph, settings: &mut Settings) -> Result<Analytics> {
    info!("Beginning dataflow analysis loop.");

    let mut analytics = Analytics::default();
    let bail_time = settings.bailout_seconds;
    let start = Instant::now();
    let mut iterations: i64 = 0;

    // Alternate stack analysis with procedure cloning until neither makes
    // progress.
    while settings.max_iterations < 0 || iterations != settings.max_iterations {
        let loop_start = Instant::now();
        iterations += 1;

        let mut modified = stack_analysis(cfg, settings)?;
        modified |= cfg.clone_ambiguous_jump_blocks();
        if !modified {
            break;
        }

        // Break out if the next iteration looks to need more than the
        // remaining time budget, or the budget is already spent.
        if bail_time >= 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let loop_time = loop_start.elapsed().as_secs_f64();
            if elapsed > bail_time as f64 || 2.0 * loop_time > bail_time as f64 - elapsed {
                info!("Bailed out after {elapsed:.2} seconds");
                analytics.bailout = true;
                analytics.bail_time = Some(elapsed);
                break;
            }
        }
    }
    analytics.num_iterations = iterations.max(0) as u64;

    info!("Completed {iterations} dataflow iterations.");
    info!("Finalising graph.");

    // The finalisation pass: resolve what def sites still can, then run the
    // analysis once under the finalisation flags. The worklist itself keeps
    // jump mutation off; the flags take effect in the global inference pass
    // at the end of the call.
    cfg.hook_up_def_site_jumps();
    settings.save();
    settings.mutate_jumps = settings.final_mutate_jumps;
    settings.generate_throws = settings.final_generate_throws;
    stack_analysis(cfg, settings)?;

    // Count how often each address was duplicated, before merging.
    let mut dupe_counts: BTreeMap<String, usize> = BTreeMap::new();
    if settings.analytics {
        for (_, block) in cfg.blocks() {
            dupe_counts
                .entry(format!("{:#x}", block.entry))
                .and_modify(|c| *c += 1)
                .or_insert(0);
        }
    }

    // Final graph manipulations: fold split blocks back together and clean
    // up variable names.
    cfg.merge_duplicate_blocks(true, true, settings)?;
    cfg.hook_up_def_site_jumps();
    cfg.prop_vars_between_blocks();
    cfg.make_stack_names_unique();

    if settings.merge_unreachable {
        let merge_groups = cfg.merge_unreachable_blocks(&[0])?;
        if !merge_groups.is_empty() {
            info!(
                "Merged {} unreachable blocks into {}.",
                merge_groups.iter().map(Vec::len).sum::<usize>(),
                merge_groups.len()
            );
        }
    }
    if settings.remove_unreachable {
        let removed = cfg.remove_unreachable_blocks(&[0]);
        if settings.analytics {
            analytics.unreachable_blocks = removed.iter().map(|b| b.ident()).collect();
        }
        info!("Removed {} unreachable blocks.", removed.len());
    }

    if settings.extract_functions || settings.mark_functions {
        info!("Extracting functions");
        let extraction = FunctionExtraction::extract(cfg);
        info!(
            "Detected {} public and {} private function(s).",
            extraction.public.len(),
            extraction.private.len()
        );

        if settings.mark_functions {
            info!("Marking functions.");
            extraction.mark_functions(cfg);
        }
        if settings.analytics {
            analytics.funcs = extraction
                .public
                .iter()
                .map(|f| f.signature.clone())
                .collect();
            analytics.n_private_funcs = extraction.private.len();
        }
        cfg.functions = Some(extraction);
    }

    settings.restore();

    info!("Produced control flow graph with {} basic blocks.", cfg.len());
    if settings.analytics {
        analytics.num_blocks = cfg.len();
        for (_, block) in cfg.blocks() {
            let ident = block.ident();
            let multiplicity = dupe_counts.get(&ident).copied().unwrap_or(0);
            analytics
                .blocks
                .insert(ident, (block.preds.len(), block.succs.len(), multiplicity));
        }
        info!(
            "Graph has {} edges.",
            analytics.blocks.values().map(|v| v.0).sum::<usize>()
        );
        if !analytics.blocks.is_empty() {
            let clones: usize = analytics.blocks.values().map(|v| v.2).sum();
            let avg_clone = clones as f64 / analytics.blocks.len() as f64;
            if avg_clone > 0.0 {
                info!(
                    "Procedure cloning occurred during analysis; blocks were cloned \
                     an average of {avg_clone:.2} times each."
                );
            }
        }
    }

    Ok(analytics)
}

/// Determine all possible stack states at block exits: stacks obtain their
/// maximum possible depth and variables the maximal value sets possible at
/// their position. Returns true iff the graph was structurally modified.
pub fn stack_analysis(cfg: &mut TACGraph, settings: &mut Settings) -> Result<bool> {
    let mut graph_modified = false;

    if settings.reinit_stacks {
        for id in cfg.ids() {
            let block = &mut cfg[id];
            block.symbolic_overflow = false;
            block.entry_stack = VariableStack::new();
            block.exit_stack = VariableStack::new();
        }
    }

    // Seed the worklist with the blocks nothing flows into.
    let mut queue: VecDeque<BlockId> = cfg
        .ids()
        .into_iter()
        .filter(|&id| cfg[id].preds.is_empty())
        .collect();
    let mut visited: BTreeMap<BlockId, bool> = BTreeMap::new();

    // Stack changes seen since the last structural change of the graph;
    // more of these than there are blocks signals a positive growth cycle.
    let mut unmod_stack_changed_count = 0usize;
    let graph_size = cfg.len();
    let mut stacks_clamped = false;

    // The join of every state each entry stack has ever inhabited.
    let mut cumulative_entry_stacks: BTreeMap<String, VariableStack> = BTreeMap::new();

    // No jump mutation and no throw generation until the graph stabilises;
    // variables have not attained their final values before that.
    settings.save();
    settings.mutate_jumps = false;
    settings.generate_throws = false;

    let bail_time = settings.bailout_seconds;
    let start = Instant::now();
    let mut counter = 0u64;

    while let Some(curr) = queue.pop_front() {
        counter += 1;
        if counter % 1000 == 0
            && bail_time >= 0
            && start.elapsed().as_secs_f64() > bail_time as f64
        {
            break;
        }
        if !cfg.contains(curr) {
            continue;
        }

        // An unchanged entry stack means an unchanged exit stack; nothing
        // to do, as long as the block has been seen once.
        let entry_changed = cfg.build_entry_stack(curr);
        if !entry_changed && visited.get(&curr).copied().unwrap_or(false) {
            continue;
        }

        if settings.widen_variables {
            widen_block_entry(cfg, curr, settings, &mut cumulative_entry_stacks);
        }

        if settings.clamp_large_stacks && !stacks_clamped {
            if visited.get(&curr).copied().unwrap_or(false) {
                unmod_stack_changed_count += 1;
            }
            if unmod_stack_changed_count > graph_size {
                debug!(
                    "Clamping stack sizes after {unmod_stack_changed_count} unmodified iterations."
                );
                stacks_clamped = true;
                let minimum = settings.clamp_stack_minimum.max(0) as usize;
                for id in cfg.ids() {
                    let new_size = cfg[id].entry_stack.len().max(cfg[id].exit_stack.len());
                    if new_size >= minimum {
                        cfg[id].entry_stack.set_max_size(new_size);
                        cfg[id].exit_stack.set_max_size(new_size);
                    }
                }
            }
        }

        // On symbolic overflow the exit stack did not change; skip the rest
        // of the processing, as with an unchanged entry stack.
        if cfg.build_exit_stack(curr, settings)? {
            continue;
        }

        if settings.mutate_blockwise {
            // Evolve the graph as we go rather than all at once at the end.
            if settings.hook_up_stack_vars {
                cfg.hook_up_block_stack_vars(curr);
                cfg.apply_block_operations(curr, settings.set_valued_ops);
                // Folded values flow into the delta stack; rebuild the exit
                // stack so successors see them.
                cfg.build_exit_stack(curr, settings)?;
            }

            if settings.hook_up_jumps {
                let old_succs = cfg[curr].succs.clone();
                let modified = cfg.hook_up_block_jumps(curr, settings);
                graph_modified |= modified;

                if modified {
                    // Former successors of a modified block may need
                    // rechecking, and the stall detectors start over.
                    for s in cfg.sort_blocks(old_succs) {
                        if !queue.contains(&s) {
                            queue.push_back(s);
                        }
                    }
                    if settings.widen_variables {
                        cumulative_entry_stacks.clear();
                    }
                    if settings.clamp_large_stacks {
                        unmod_stack_changed_count = 0;
                        for s in cfg[curr].succs.clone() {
                            visited.insert(s, false);
                        }
                    }
                }
            }
        }

        // The exit stack changed, so every successor needs a look.
        for s in cfg.sort_blocks(cfg[curr].succs.clone()) {
            if !queue.contains(&s) {
                queue.push_back(s);
            }
        }
        visited.insert(curr, true);
    }

    settings.restore();

    // Recondition the graph globally to pick up relationships only
    // determinable now the analysis has run.
    if settings.hook_up_stack_vars {
        cfg.hook_up_stack_vars();
        cfg.apply_operations(false);
    }
    if settings.hook_up_jumps {
        graph_modified |= cfg.hook_up_jumps(settings);
        graph_modified |= cfg.add_missing_split_edges();
    }

    Ok(graph_modified)
}

/// Join the block's entry stack into its accumulated stack and widen any
/// slot whose accumulated value set has outgrown the threshold. Without
/// this, value sets could grow without bound around cycles.
fn widen_block_entry(
    cfg: &mut TACGraph,
    curr: BlockId,
    settings: &Settings,
    cumulative_entry_stacks: &mut BTreeMap<String, VariableStack>,
) {
    let ident = cfg[curr].ident();
    let prev = cumulative_entry_stacks.remove(&ident).unwrap_or_default();
    let mut joined = VariableStack::join(&prev, &cfg[curr].entry_stack);

    let threshold = settings.widen_threshold.max(0) as usize;
    for depth in 0..joined.len() {
        let joined_idx = joined.len() - 1 - depth;
        let slot = &joined.slots()[joined_idx];
        if slot.is_unconstrained() || slot.values().len() <= threshold {
            continue;
        }
        debug!(block = %ident, depth, "widening stack variable to top");
        joined.slots_mut()[joined_idx].widen_to_top();

        let block = &mut cfg[curr];
        let entry_len = block.entry_stack.len();
        if depth < entry_len {
            block.entry_stack.slots_mut()[entry_len - 1 - depth].widen_to_top();
        }
    }

    cumulative_entry_stacks.insert(ident, joined);
}

/// Determine the stack depth of every block at entry and exit, where it can
/// be known. The entry depth of a block is the meet of its predecessors'
/// exit depths, with origin blocks pinned at zero; incompatible depths meet
/// to Bottom.
pub fn stack_size_analysis(
    cfg: &TACGraph,
) -> (
    BTreeMap<BlockId, IntLattice<i64>>,
    BTreeMap<BlockId, IntLattice<i64>>,
) {
    let block_delta = |id: BlockId| {
        let block = &cfg[id];
        block.delta_stack.len() as i64 - block.delta_stack.empty_pops as i64
    };

    let mut entry_info: BTreeMap<BlockId, IntLattice<i64>> =
        cfg.ids().into_iter().map(|id| (id, IntLattice::Top)).collect();
    let mut exit_info = entry_info.clone();

    // Pin an empty stack at the root and anything else nothing flows into,
    // so each connected component can be reasoned about.
    let mut origin: Vec<BlockId> = cfg
        .ids()
        .into_iter()
        .filter(|&id| cfg[id].preds.is_empty())
        .collect();
    if let Some(root) = cfg.root {
        if !origin.contains(&root) {
            origin.push(root);
        }
    }

    let mut queue: Vec<BlockId> = cfg.ids();
    while let Some(curr) = queue.pop() {
        let mut incoming: Vec<IntLattice<i64>> = cfg[curr]
            .preds
            .iter()
            .filter_map(|p| exit_info.get(p).copied())
            .collect();
        if origin.contains(&curr) {
            incoming.push(IntLattice::Elem(0));
        }
        let new_entry = IntLattice::meet_all(incoming.iter());

        if entry_info.get(&curr) != Some(&new_entry) {
            entry_info.insert(curr, new_entry);
            exit_info.insert(curr, new_entry + IntLattice::Elem(block_delta(curr)));
            queue.extend(cfg.sort_blocks(cfg[curr].succs.clone()));
        }
    }

    (entry_info, exit_info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(hex: &str, settings: &mut Settings) -> (TACGraph, Analytics) {
        let mut graph = TACGraph::from_bytecode(hex, settings).unwrap();
        let analytics = analyse_graph(&mut graph, settings).unwrap();
        (graph, analytics)
    }

    #[test]
    fn straight_line_graph_stabilises() {
        let mut settings = Settings::default();
        let (graph, _) = run("6003565b00", &mut settings);
        let ids = graph.sorted_traversal();
        assert_eq!(ids.len(), 2);
        assert_eq!(graph[ids[0]].succs, vec![ids[1]]);
        assert!(graph[ids[1]].succs.is_empty());
        assert!(!graph.has_unresolved_jump());
    }

    #[test]
    fn entry_stacks_are_joins_of_pred_exits() {
        let mut settings = Settings::default();
        let (graph, _) = run("6003565b00", &mut settings);
        for (_, block) in graph.blocks() {
            let joined =
                VariableStack::join_all(block.preds.iter().map(|&p| &graph[p].exit_stack));
            assert_eq!(block.entry_stack.len(), joined.len());
        }
    }

    #[test]
    fn settings_survive_analysis() {
        let mut settings = Settings::default();
        settings.mutate_jumps = true;
        settings.analytics = true;
        let (_, analytics) = run("6003565b00", &mut settings);
        assert!(settings.mutate_jumps);
        assert!(!analytics.bailout);
        assert_eq!(analytics.num_blocks, 2);
    }

    #[test]
    fn stack_size_analysis_propagates_depths() {
        let settings = Settings::default();
        // PUSH1 3, JUMP | JUMPDEST, STOP
        let graph = TACGraph::from_bytecode("6003565b00", &settings).unwrap();
        let (entry, exit) = stack_size_analysis(&graph);
        let ids = graph.sorted_traversal();

        assert_eq!(entry[&ids[0]], IntLattice::Elem(0));
        // The pushed destination is consumed by the jump.
        assert_eq!(exit[&ids[0]], IntLattice::Elem(0));
        assert_eq!(entry[&ids[1]], IntLattice::Elem(0));
    }
}
