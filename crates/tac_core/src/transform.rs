//! Whole-graph transformations: procedure cloning, duplicate and
//! unreachable-block merging, and the final variable cleanup passes.

use std::collections::BTreeSet;

use tracing::error;

use primitives::lattice::Lattice;
use primitives::stack::VariableStack;
use primitives::variable::{BlockId, Variable};

use crate::error::{DecompileError, Result};
use crate::graph::{TACBasicBlock, TACGraph};
use crate::opcodes::OpCode;
use crate::settings::Settings;

impl TACGraph {
    /// Procedure cloning. If a block ends in a jump with an ambiguous but
    /// constrained destination, find its most recent ancestral confluence
    /// point and split the path of blocks between into parallel copies, one
    /// per predecessor of the confluence. This isolates the call sites of a
    /// shared private function so that each one's jump target can be
    /// resolved independently.
    ///
    /// Returns true iff some block was cloned.
    pub fn clone_ambiguous_jump_blocks(&mut self) -> bool {
        let mut split_occurred = false;
        let mut modified = true;
        let mut skip: BTreeSet<BlockId> = BTreeSet::new();

        while modified {
            modified = false;

            for id in self.ids() {
                if !self.contains(id) || !self.block_is_splittable(id, &skip) {
                    continue;
                }

                // Walk back through single-predecessor ancestors. The first
                // block with any other in-degree is the confluence point,
                // and belongs to the path: it is what gets specialised.
                let mut path = vec![id];
                let mut curr = id;
                let mut cycle = false;
                while self[curr].preds.len() == 1 {
                    curr = self[curr].preds[0];
                    if !path.contains(&curr) {
                        path.push(curr);
                    } else {
                        cycle = true;
                        break;
                    }
                }
                let path_preds = self[curr].preds.clone();

                // Split neither cycles nor paths flowing out of themselves.
                if cycle || path_preds.is_empty() {
                    continue;
                }
                if path_preds.iter().any(|p| path.contains(p)) {
                    continue;
                }

                let removed = self.split_remove_path(&path, &mut skip);
                self.split_copy_path(&removed, &path_preds, &mut skip);

                modified = true;
                split_occurred = true;
            }
        }

        split_occurred
    }

    /// Whether a block qualifies as the final node of a fissionable path:
    /// it ends in a jump whose destination set has multiple values defined
    /// at multiple different sites.
    fn block_is_splittable(&self, id: BlockId, skip: &BTreeSet<BlockId>) -> bool {
        // Don't split blocks we only just generated; some will certainly
        // satisfy the fission condition.
        if skip.contains(&id) {
            return false;
        }

        let Some(last_op) = self[id].last_op() else {
            return false;
        };
        if !matches!(last_op.opcode, OpCode::JUMP | OpCode::JUMPI) {
            return false;
        }

        let dests = last_op.args[0].value();
        !(dests.is_const()
            || dests.def_sites.is_const()
            || (dests.is_unconstrained() && dests.def_sites.is_top()))
    }

    /// Resect the path from the graph, recording each member's successors
    /// in `split_node_succs` so the edges can be restored after merging.
    /// Returns the removed blocks, in path order.
    fn split_remove_path(
        &mut self,
        path: &[BlockId],
        skip: &mut BTreeSet<BlockId>,
    ) -> Vec<(BlockId, TACBasicBlock)> {
        let mut removed = Vec::new();
        for &b in path {
            let entry = self[b].entry;
            let succs = self.sort_blocks(self[b].succs.clone());
            let list = self.split_node_succs.entry(entry).or_default();
            for s in succs {
                if !list.contains(&s) {
                    list.push(s);
                }
            }

            skip.insert(b);
            if let Some(block) = self.remove_block(b) {
                removed.push((b, block));
            }
        }
        removed
    }

    /// Duplicate the removed path once per confluence predecessor, each
    /// pred becoming the sole parent of its own copy of the path.
    fn split_copy_path(
        &mut self,
        path: &[(BlockId, TACBasicBlock)],
        path_preds: &[BlockId],
        skip: &mut BTreeSet<BlockId>,
    ) {
        let mut copies_per_pred: Vec<Vec<BlockId>> = Vec::new();
        for _ in path_preds {
            let mut copy_ids = Vec::new();
            for (_, block) in path {
                let new_id = self.add_block(block.clone());
                self.reset_block_refs(new_id);
                copy_ids.push(new_id);
            }
            copies_per_pred.push(copy_ids);
        }

        // Anywhere a resected block was recorded as a pending successor,
        // its copies stand in for it now.
        for (i, (old_id, _)) in path.iter().enumerate() {
            let replacements: Vec<BlockId> =
                copies_per_pred.iter().map(|ids| ids[i]).collect();
            for list in self.split_node_succs.values_mut() {
                if let Some(pos) = list.iter().position(|x| x == old_id) {
                    list.remove(pos);
                    list.extend(replacements.iter().copied());
                }
            }
        }

        // Hook each pred up to its own copy of the path, and chain the
        // copies up internally. The last path element is the confluence.
        for (i, &p) in path_preds.iter().enumerate() {
            let suffix = format!("_{}", self[p].ident());
            let copy_ids = copies_per_pred[i].clone();

            if let Some(&deepest) = copy_ids.last() {
                self.add_edge(p, deepest);
            }
            for &c in &copy_ids {
                self[c].ident_suffix.push_str(&suffix);
            }
            for j in 0..copy_ids.len().saturating_sub(1) {
                self.add_edge(copy_ids[j + 1], copy_ids[j]);
            }
        }

        for copy_ids in &copies_per_pred {
            skip.extend(copy_ids.iter().copied());
        }
    }

    fn blocks_equal(
        &self,
        a: BlockId,
        b: BlockId,
        ignore_preds: bool,
        ignore_succs: bool,
    ) -> bool {
        if self[a].entry != self[b].entry {
            return false;
        }
        let as_set = |ids: &[BlockId]| ids.iter().copied().collect::<BTreeSet<_>>();
        if !ignore_preds && as_set(&self[a].preds) != as_set(&self[b].preds) {
            return false;
        }
        if !ignore_succs && as_set(&self[a].succs) != as_set(&self[b].succs) {
            return false;
        }
        true
    }

    /// Merge blocks sharing an entry address (and, unless ignored, incident
    /// edge sets). Stacks are joined, edge lists unioned; the code is
    /// assumed identical, as it is for blocks produced by cloning.
    ///
    /// When a merge leaves a block as the only occupant of its address, its
    /// disambiguating suffix is dropped and any pending split edges for
    /// that address are reinstated.
    pub fn merge_duplicate_blocks(
        &mut self,
        ignore_preds: bool,
        ignore_succs: bool,
        settings: &Settings,
    ) -> Result<()> {
        // Merging continues until nothing merges further. The equivalence
        // is such that one pass should suffice, but new candidates can in
        // principle appear after reconditioning.
        loop {
            let mut groups: Vec<Vec<BlockId>> = Vec::new();
            for id in self.ids() {
                let mut grouped = false;
                for group in &mut groups {
                    if self.blocks_equal(id, group[0], ignore_preds, ignore_succs) {
                        group.push(id);
                        grouped = true;
                        break;
                    }
                }
                if !grouped {
                    groups.push(vec![id]);
                }
            }
            groups.retain(|g| g.len() > 1);
            if groups.is_empty() {
                return Ok(());
            }

            for (i, group) in groups.iter().enumerate() {
                let mut entry_stack =
                    VariableStack::join_all(group.iter().map(|&b| &self[b].entry_stack));
                entry_stack.metafy();
                let mut exit_stack =
                    VariableStack::join_all(group.iter().map(|&b| &self[b].exit_stack));
                exit_stack.metafy();

                let symbolic_overflow = group.iter().any(|&b| self[b].symbolic_overflow);
                let has_unresolved_jump =
                    group.iter().any(|&b| self[b].has_unresolved_jump);

                let preds: BTreeSet<BlockId> =
                    group.iter().flat_map(|&b| self[b].preds.clone()).collect();
                let succs: BTreeSet<BlockId> =
                    group.iter().flat_map(|&b| self[b].succs.clone()).collect();

                let mut new_block = self[group[0]].clone();
                new_block.entry_stack = entry_stack;
                new_block.exit_stack = exit_stack;
                new_block.preds = self.sort_blocks(preds.iter().copied());
                new_block.succs = self.sort_blocks(succs.iter().copied());
                new_block.ident_suffix = format!("_{i}");
                new_block.symbolic_overflow = symbolic_overflow;
                new_block.has_unresolved_jump = has_unresolved_jump;

                let new_id = self.add_block(new_block);
                self.reset_block_refs(new_id);

                for &pred in &preds {
                    self.add_edge(pred, new_id);
                    for &b in group {
                        self.remove_edge(pred, b);
                    }
                }
                for &succ in &succs {
                    self.add_edge(new_id, succ);
                    for &b in group {
                        self.remove_edge(b, succ);
                    }
                }
                for &b in group {
                    self.remove_block(b);
                }

                // The last copy standing at its address no longer needs a
                // suffix, and its pending split edges come back.
                let entry = self[new_id].entry;
                if self.get_blocks_by_pc(entry).len() == 1 {
                    self[new_id].ident_suffix.clear();

                    for list in self.split_node_succs.values_mut() {
                        list.retain(|x| !group.contains(x));
                    }
                    if let Some(pending) = self.split_node_succs.remove(&entry) {
                        for succ in pending {
                            if self.contains(succ) && !self.has_edge(new_id, succ) {
                                self.add_edge(new_id, succ);
                            }
                        }
                    }
                }
            }

            // Recondition the graph, having merged everything.
            for id in self.ids() {
                self.build_entry_stack(id);
                self.build_exit_stack(id, settings)?;
                self.hook_up_block_stack_vars(id);
                self.apply_block_operations(id, false);
                self.hook_up_block_jumps(id, settings);
            }
        }
    }

    /// Merge two contiguous blocks; pred must have no successors and succ
    /// no predecessors.
    pub fn merge_contiguous(&mut self, pred: BlockId, succ: BlockId) -> Result<BlockId> {
        if self[succ].entry != self[pred].exit + 1
            || !self[pred].succs.is_empty()
            || !self[succ].preds.is_empty()
        {
            let err = DecompileError::Unmergeable(self[pred].ident(), self[succ].ident());
            error!("{err}");
            return Err(err);
        }

        let pred_preds = self[pred].preds.clone();
        let succ_succs = self[succ].succs.clone();
        let (Some(pred_block), Some(succ_block)) =
            (self.remove_block(pred), self.remove_block(succ))
        else {
            return Err(DecompileError::Unmergeable(
                format!("{pred}"),
                format!("{succ}"),
            ));
        };

        let mut tac_ops = pred_block.tac_ops;
        tac_ops.extend(succ_block.tac_ops);
        let mut evm_ops = pred_block.evm_ops;
        evm_ops.extend(succ_block.evm_ops);

        // Apply pred's delta first, then succ's on top of it.
        let mut delta_stack = pred_block.delta_stack.clone();
        delta_stack.pop_many(succ_block.delta_stack.empty_pops);
        delta_stack.push_many(succ_block.delta_stack.slots().iter().cloned());

        let mut merged = TACBasicBlock::new(
            pred_block.entry,
            succ_block.exit,
            tac_ops,
            evm_ops,
            delta_stack,
        );
        merged.entry_stack = pred_block.entry_stack.clone();
        merged.has_unresolved_jump = succ_block.has_unresolved_jump;
        merged.ident_suffix = pred_block.ident_suffix.clone();

        let new_id = self.add_block(merged);
        self.reset_block_refs(new_id);
        for p in pred_preds {
            self.add_edge(p, new_id);
        }
        for s in succ_succs {
            self.add_edge(new_id, s);
        }

        Ok(new_id)
    }

    /// Fold every maximal run of contiguous, edge-free unreachable blocks
    /// into a single block. Returns the groups that were merged.
    pub fn merge_unreachable_blocks(
        &mut self,
        origin_addresses: &[usize],
    ) -> Result<Vec<Vec<BlockId>>> {
        let reached = self.transitive_closure(origin_addresses);

        let mut unreached: Vec<BlockId> = self
            .ids()
            .into_iter()
            .filter(|id| !reached.contains(id))
            .collect();
        unreached.sort_by_key(|&id| (self[id].entry, self[id].ident_suffix.clone()));
        if unreached.is_empty() {
            return Ok(Vec::new());
        }

        let mut groups: Vec<Vec<BlockId>> = Vec::new();
        let mut group = vec![unreached[0]];
        for &b in &unreached[1..] {
            let prev = group[group.len() - 1];
            // Extend the run only while blocks stay contiguous and carry no
            // incident edges.
            if self[b].entry == self[prev].exit + 1
                && self[prev].succs.is_empty()
                && self[b].preds.is_empty()
            {
                group.push(b);
                continue;
            }
            if group.len() > 1 {
                groups.push(group);
            }
            group = vec![b];
        }
        if group.len() > 1 {
            groups.push(group);
        }

        for g in &groups {
            let mut merged = g[0];
            for &next in &g[1..] {
                merged = self.merge_contiguous(merged, next)?;
            }
        }

        Ok(groups)
    }

    /// After node splitting, newly inferred edges must reach every copy of
    /// a split node, but without collapsing the split paths back together:
    /// add a recorded successor only where no copy already reaches it.
    /// Returns true iff an edge was added.
    pub fn add_missing_split_edges(&mut self) -> bool {
        let mut modified = false;

        let addresses: Vec<usize> = self.split_node_succs.keys().copied().collect();
        for pred_address in addresses {
            let preds = self.get_blocks_by_pc(pred_address);
            let present: BTreeSet<BlockId> = preds
                .iter()
                .flat_map(|&p| self[p].succs.clone())
                .collect();
            let pending = self.split_node_succs[&pred_address].clone();
            for succ in pending {
                if !self.contains(succ) || present.contains(&succ) {
                    continue;
                }
                for &pred in &preds {
                    if !self.has_edge(pred, succ) {
                        self.add_edge(pred, succ);
                        modified = true;
                    }
                }
            }
        }

        modified
    }

    /// Where an entry stack slot has a single definition site, substitute
    /// in the variable produced there, along with all its occurrences in
    /// the block's operations and exit stack. A pure renaming.
    pub fn prop_vars_between_blocks(&mut self) {
        for id in self.ids() {
            for i in 0..self[id].entry_stack.len() {
                let slot = self[id].entry_stack.slots()[i].clone();
                if !slot.def_sites.is_const() {
                    continue;
                }
                let Some(&site) = slot.def_sites.iter().next() else {
                    continue;
                };
                let Some(new_var) = self.def_site_variable(site).cloned() else {
                    continue;
                };

                let block = &mut self[id];
                block.entry_stack.slots_mut()[i] = new_var.clone();
                for exit_slot in block.exit_stack.slots_mut() {
                    if exit_slot.is_same(&slot) {
                        *exit_slot = new_var.clone();
                    }
                }
                for op in &mut block.tac_ops {
                    for arg in &mut op.args {
                        if arg.value().is_same(&slot) {
                            arg.set_var(new_var.clone());
                        }
                    }
                }
            }
        }
    }

    /// If two distinct variables on the same entry stack share a name,
    /// append an index to each so that names identify variables uniquely.
    /// The renaming propagates to all occurrences within the block.
    pub fn make_stack_names_unique(&mut self) {
        for id in self.ids() {
            let mut variables: Vec<Variable> = self[id].entry_stack.slots().to_vec();
            variables.sort_by(|a, b| a.name.cmp(&b.name));

            let mut groups: Vec<Vec<Variable>> = Vec::new();
            for var in variables {
                match groups.last_mut() {
                    Some(group) if group[0].name == var.name => {
                        // A variable appearing in several slots only needs
                        // renaming once.
                        if !group.iter().any(|g| g.is_same(&var)) {
                            group.push(var);
                        }
                    }
                    _ => groups.push(vec![var]),
                }
            }

            for group in groups.iter().filter(|g| g.len() > 1) {
                for (i, old) in group.iter().enumerate() {
                    let new_name = format!("{}{}", old.name, i);
                    self.rename_in_block(id, old, &new_name);
                }
            }
        }
    }

    fn rename_in_block(&mut self, id: BlockId, old: &Variable, new_name: &str) {
        let block = &mut self[id];
        for slot in block.entry_stack.slots_mut() {
            if slot.is_same(old) {
                slot.name = new_name.to_string();
            }
        }
        for slot in block.exit_stack.slots_mut() {
            if slot.is_same(old) {
                slot.name = new_name.to_string();
            }
        }
        for op in &mut block.tac_ops {
            if let Some(lhs) = &mut op.lhs {
                if lhs.is_same(old) {
                    lhs.name = new_name.to_string();
                }
            }
            for arg in &mut op.args {
                if arg.value().is_same(old) {
                    arg.value_mut().name = new_name.to_string();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use primitives::variable::{DefSite, DefSiteSet};
    use crate::tac::{TACArg, TACOp};

    fn nop_block(entry: usize, exit: usize) -> TACBasicBlock {
        TACBasicBlock::new(
            entry,
            exit,
            vec![TACOp::new(OpCode::NOP, Vec::new(), entry)],
            Vec::new(),
            VariableStack::new(),
        )
    }

    #[test]
    fn merge_contiguous_requires_adjacency() {
        let mut graph = TACGraph::default();
        let a = graph.add_block(nop_block(0, 1));
        let b = graph.add_block(nop_block(5, 6));
        assert!(graph.merge_contiguous(a, b).is_err());
    }

    #[test]
    fn merge_contiguous_combines_spans_and_edges() {
        let mut graph = TACGraph::default();
        let up = graph.add_block(nop_block(10, 11));
        let a = graph.add_block(nop_block(0, 1));
        let b = graph.add_block(nop_block(2, 3));
        let down = graph.add_block(nop_block(20, 21));
        graph.add_edge(up, a);
        graph.add_edge(b, down);

        // a itself may have predecessors and b successors; only the facing
        // sides must be free.
        let merged = graph.merge_contiguous(a, b).unwrap();
        assert_eq!(graph[merged].entry, 0);
        assert_eq!(graph[merged].exit, 3);
        assert_eq!(graph[merged].tac_ops.len(), 2);
        assert_eq!(graph[merged].preds, vec![up]);
        assert_eq!(graph[merged].succs, vec![down]);
        assert!(!graph.contains(a) && !graph.contains(b));
    }

    #[test]
    fn unreachable_runs_are_grouped_and_merged() {
        let mut graph = TACGraph::default();
        let root = graph.add_block(nop_block(0, 1));
        graph.root = Some(root);
        // Contiguous unreachable run: [2,3] [4,5]; separate singleton [9,10].
        let u1 = graph.add_block(nop_block(2, 3));
        let u2 = graph.add_block(nop_block(4, 5));
        let u3 = graph.add_block(nop_block(9, 10));

        let groups = graph.merge_unreachable_blocks(&[0]).unwrap();
        assert_eq!(groups, vec![vec![u1, u2]]);
        // Three blocks remain: root, the merged run, and the singleton.
        assert_eq!(graph.len(), 3);
        assert!(graph.contains(u3));
    }

    #[test]
    fn duplicate_blocks_merge_back() {
        let settings = Settings::default();
        let mut graph = TACGraph::default();
        let mut dup_a = nop_block(4, 5);
        dup_a.ident_suffix = "_0x0".to_string();
        let mut dup_b = nop_block(4, 5);
        dup_b.ident_suffix = "_0x2".to_string();
        let a = graph.add_block(dup_a);
        let b = graph.add_block(dup_b);

        graph
            .merge_duplicate_blocks(true, true, &settings)
            .unwrap();
        assert_eq!(graph.len(), 1);
        assert!(!graph.contains(a) && !graph.contains(b));
        let merged = graph.ids()[0];
        // Unique at its address again, so no disambiguating suffix.
        assert_eq!(graph[merged].ident(), "0x4");
    }

    #[test]
    fn prop_vars_substitutes_single_def_site_slots() {
        let mut graph = TACGraph::default();

        // Producer block defines V0 at pc 0.
        let mut producer = nop_block(0, 1);
        let lhs = Variable::constant(U256::from(7), "V0");
        let mut op = TACOp::assign(
            lhs,
            OpCode::CONST,
            vec![TACArg::from_var(Variable::constant(U256::from(7), "C"))],
            0,
        );
        op.print_name = false;
        producer.tac_ops = vec![op];
        let producer_id = graph.add_block(producer);
        graph.reset_block_refs(producer_id);

        // Consumer's entry stack holds a placeholder defined only there.
        let mut consumer = nop_block(2, 3);
        let def_sites = DefSiteSet::singleton(DefSite::new(producer_id, 0));
        consumer.entry_stack.push(Variable::slot(0, def_sites));
        let consumer_id = graph.add_block(consumer);

        graph.prop_vars_between_blocks();
        let slot = &graph[consumer_id].entry_stack.slots()[0];
        assert_eq!(slot.name, "V0");
        assert_eq!(slot.const_value(), Some(U256::from(7)));
    }

    #[test]
    fn shared_names_become_unique() {
        let mut graph = TACGraph::default();
        let mut block = nop_block(0, 1);
        // Two distinct variables named V1, one uniquely-named V2.
        block
            .entry_stack
            .push(Variable::constant(U256::from(1), "V1"));
        block
            .entry_stack
            .push(Variable::constant(U256::from(2), "V1"));
        block
            .entry_stack
            .push(Variable::constant(U256::from(3), "V2"));
        let id = graph.add_block(block);

        graph.make_stack_names_unique();
        let names: Vec<&str> = graph[id]
            .entry_stack
            .slots()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(names, vec!["V10", "V11", "V2"]);
    }

    #[test]
    fn cloning_splits_ambiguous_jumps() {
        // Two call sites push distinct return addresses and jump into a
        // shared block ending in a jump on that address variable.
        let settings = Settings::default();
        let mut graph = TACGraph::default();

        // Shared block at pc 8: JUMP S0 with two def sites.
        let mut shared = nop_block(8, 9);
        let call_a = graph.add_block(nop_block(0, 3));
        let call_b = graph.add_block(nop_block(4, 7));
        let mut dest = Variable::new([U256::from(10), U256::from(12)], "S0");
        dest.def_sites = DefSiteSet::new([
            DefSite::new(call_a, 0),
            DefSite::new(call_b, 4),
        ]);
        shared.tac_ops = vec![TACOp::new(
            OpCode::JUMP,
            vec![TACArg::from_var(dest)],
            8,
        )];
        let shared_id = graph.add_block(shared);

        let ret_a = graph.add_block(nop_block(10, 11));
        let ret_b = graph.add_block(nop_block(12, 13));
        graph.add_edge(call_a, shared_id);
        graph.add_edge(call_b, shared_id);
        graph.add_edge(shared_id, ret_a);
        graph.add_edge(shared_id, ret_b);

        assert!(graph.clone_ambiguous_jump_blocks());

        // The shared block is gone; each call site owns a private copy.
        assert!(!graph.contains(shared_id));
        let copies = graph.get_blocks_by_pc(8);
        assert_eq!(copies.len(), 2);
        for &copy in &copies {
            assert_eq!(graph[copy].preds.len(), 1);
        }
        // Its successors were recorded for later restoration.
        assert_eq!(
            graph.split_node_succs.get(&8),
            Some(&vec![ret_a, ret_b])
        );
    }
}
