//! Per-block transfer functions: entry/exit stack construction, stack
//! variable substitution, constant folding, and jump edge inference.

use std::collections::{BTreeMap, BTreeSet};

use alloy::primitives::U256;
use tracing::error;

use primitives::stack::VariableStack;
use primitives::variable::{BlockId, Variable};

use crate::error::{DecompileError, Result};
use crate::graph::TACGraph;
use crate::opcodes::OpCode;
use crate::settings::Settings;
use crate::tac::TACOp;

fn as_pc(value: &U256) -> Option<usize> {
    u64::try_from(*value).ok().map(|v| v as usize)
}

/// Write a variable's refined value set through to its other occurrences in
/// the block: argument uses, and any stack slot carrying the variable. The
/// defining op at `def_index` itself is left alone.
fn write_through_values(
    block: &mut crate::graph::TACBasicBlock,
    def_index: usize,
    name: &str,
    values: &primitives::variable::ValueSet,
) {
    for (i, op) in block.tac_ops.iter_mut().enumerate() {
        if i == def_index {
            continue;
        }
        for arg in &mut op.args {
            let var = arg.value();
            if !var.is_meta() && var.name == name {
                arg.value_mut().set_values(values.clone());
            }
        }
    }
    for stack in [
        &mut block.delta_stack,
        &mut block.entry_stack,
        &mut block.exit_stack,
    ] {
        for slot in stack.slots_mut() {
            if !slot.is_meta() && slot.name == name {
                slot.set_values(values.clone());
            }
        }
    }
}

impl TACGraph {
    /// Construct the block's entry stack by joining all predecessor exit
    /// stacks. Returns true iff the entry stack changed.
    pub fn build_entry_stack(&mut self, id: BlockId) -> bool {
        let pred_stacks: Vec<&VariableStack> = self[id]
            .preds
            .iter()
            .map(|&p| &self[p].exit_stack)
            .collect();
        let mut new_stack = VariableStack::join_all(pred_stacks);

        let block = &mut self[id];
        new_stack.set_max_size(block.entry_stack.max_size);
        new_stack.metafy();
        let changed = new_stack != block.entry_stack;
        block.entry_stack = new_stack;
        changed
    }

    /// Apply the block's delta stack to its entry stack to construct its
    /// exit stack. Returns true iff a symbolic overflow occurred.
    ///
    /// Placeholders in the delta stack are substituted with the concrete
    /// entry stack slots they refer to.
    pub fn build_exit_stack(&mut self, id: BlockId, settings: &Settings) -> Result<bool> {
        let block = &self[id];

        // Popping deeper than there are extant stack items means the program
        // may be popping from an empty stack.
        if settings.die_on_empty_pop && block.entry_stack.len() < block.delta_stack.empty_pops {
            let ident = block.ident();
            error!("Popped empty stack in {ident}.");
            return Err(DecompileError::EmptyPop(ident));
        }

        // If executing this block would overflow the stack, maybe skip it.
        let delta = block.delta_stack.len() as isize - block.delta_stack.empty_pops as isize;
        let overflow =
            block.entry_stack.len() as isize + delta > block.exit_stack.max_size as isize;
        if overflow {
            self[id].symbolic_overflow = true;
            if settings.skip_stack_on_overflow {
                return Ok(true);
            }
        }

        let block = &self[id];
        let mut exit_stack = block.entry_stack.clone();

        // Resolve delta placeholders against the entry stack before popping.
        let mut slot_map: BTreeMap<usize, Variable> = BTreeMap::new();
        for var in block.delta_stack.iter() {
            if let Some(n) = var.payload() {
                slot_map.insert(n, exit_stack.peek(n));
            }
        }

        exit_stack.pop_many(block.delta_stack.empty_pops);
        for var in block.delta_stack.slots() {
            match var.payload().and_then(|n| slot_map.get(&n)) {
                Some(resolved) => exit_stack.push(resolved.clone()),
                None => exit_stack.push(var.clone()),
            }
        }

        self[id].exit_stack = exit_stack;
        Ok(overflow)
    }

    /// Replace stack placeholder arguments in the block's operations with
    /// the entry stack variables they refer to. Arguments referring past the
    /// known stack depth are left alone, so no information is lost.
    pub fn hook_up_block_stack_vars(&mut self, id: BlockId) {
        let block = &mut self[id];
        let entry_stack = &block.entry_stack;
        for op in &mut block.tac_ops {
            for arg in &mut op.args {
                if let Some(slot) = arg.stack_slot() {
                    if slot < entry_stack.len() {
                        arg.set_var(entry_stack.peek(slot));
                    }
                }
            }
        }
    }

    /// Propagate and fold constants through the block's arithmetic
    /// operations.
    ///
    /// With `use_sets`, folding is also performed on arguments holding
    /// multiple possible values, operating over every combination.
    ///
    /// A folded result is written through to every other occurrence of the
    /// defined variable in the block: later argument uses and delta/entry/
    /// exit stack slots all see the refined value set.
    pub fn apply_block_operations(&mut self, id: BlockId, use_sets: bool) {
        let block = &mut self[id];
        for i in 0..block.tac_ops.len() {
            let op = &mut block.tac_ops[i];
            let updated: Option<(String, primitives::variable::ValueSet)>;

            if op.opcode == OpCode::CONST {
                let values = op.args[0].value().values().clone();
                updated = op.lhs.as_mut().map(|lhs| {
                    lhs.set_values(values.clone());
                    (lhs.name.clone(), values)
                });
            } else if op.opcode.is_arithmetic() && op.lhs.is_some() {
                if op.constant_args() || (op.constrained_args() && use_sets) {
                    let args: Vec<Variable> =
                        op.args.iter().map(|a| a.value().clone()).collect();
                    updated = Variable::arith_op(op.opcode.name, &args).and_then(|result| {
                        let values = result.values().clone();
                        op.lhs.as_mut().map(|lhs| {
                            lhs.set_values(values.clone());
                            (lhs.name.clone(), values)
                        })
                    });
                } else {
                    // Widen a stale folded value rather than let it linger.
                    updated = op.lhs.as_mut().and_then(|lhs| {
                        if lhs.is_unconstrained() {
                            None
                        } else {
                            lhs.widen_to_top();
                            Some((lhs.name.clone(), lhs.values().clone()))
                        }
                    });
                }
            } else {
                updated = None;
            }

            if let Some((name, values)) = updated {
                write_through_values(block, i, &name, &values);
            }
        }
    }

    /// Collect the valid jump destinations among the values of `dest` into
    /// `jumpdests`, mapping each destination pc to the blocks addressed at
    /// it. Returns false iff the destination set is unconstrained; a jump is
    /// invalid when a finite enumeration yielded no destinations.
    fn handle_valid_dests(
        &self,
        dest: &Variable,
        jumpdests: &mut BTreeMap<usize, Vec<BlockId>>,
    ) -> bool {
        if dest.is_unconstrained() {
            return false;
        }

        for value in dest.values().iter() {
            let Some(pc) = as_pc(value) else { continue };
            if self.is_valid_jump_dest(pc) {
                let hosts: Vec<BlockId> =
                    self.get_ops_by_pc(pc).into_iter().map(|(id, _)| id).collect();
                jumpdests.insert(pc, hosts);
            }
        }

        true
    }

    /// Connect the block to any successors that can be inferred from its
    /// jump condition and destination, rewriting provably-decided JUMPIs and
    /// invalid jumps if the settings allow. Returns true iff the successor
    /// set changed.
    pub fn hook_up_block_jumps(&mut self, id: BlockId, settings: &Settings) -> bool {
        let Some(last_op) = self[id].last_op() else {
            return false;
        };
        let last_opcode = last_op.opcode;
        let last_pc = last_op.pc;

        let mut jumpdests: BTreeMap<usize, Vec<BlockId>> = BTreeMap::new();
        let mut fallthrough: Vec<BlockId> = Vec::new();
        let mut invalid_jump = false;
        let mut unresolved = true;
        let mut remove_non_fallthrough = false;
        let mut remove_fallthrough = false;
        let mut drop_jump = false;
        let mut to_plain_jump = false;

        match last_opcode {
            OpCode::JUMPI => {
                let dest = last_op.args[0].value().clone();
                let cond = last_op.args[1].value().clone();

                if settings.mutate_jumps && cond.is_false() {
                    // The condition can never hold; the jump goes away.
                    drop_jump = true;
                    fallthrough = self.get_blocks_by_pc(last_pc + 1);
                    unresolved = false;
                    remove_non_fallthrough = true;
                } else if settings.mutate_jumps && cond.is_true() {
                    // The condition always holds; the JUMPI behaves like a JUMP.
                    to_plain_jump = true;
                    if self.handle_valid_dests(&dest, &mut jumpdests) && jumpdests.is_empty() {
                        invalid_jump = true;
                    }
                    unresolved = false;
                    remove_fallthrough = true;
                } else {
                    // Undecided condition; take the destination and the
                    // fallthrough both.
                    fallthrough = self.get_blocks_by_pc(last_pc + 1);
                    if self.handle_valid_dests(&dest, &mut jumpdests) && jumpdests.is_empty() {
                        invalid_jump = true;
                    }
                    if !dest.is_unconstrained() {
                        unresolved = false;
                    }
                }
            }
            OpCode::JUMP => {
                let dest = last_op.args[0].value().clone();
                if self.handle_valid_dests(&dest, &mut jumpdests) && jumpdests.is_empty() {
                    invalid_jump = true;
                }
                if !dest.is_unconstrained() {
                    unresolved = false;
                }
            }
            // No terminating jump; this also covers THROW and THROWI.
            _ => {
                unresolved = false;
                if !last_opcode.halts() {
                    fallthrough = self.get_blocks_by_pc(self[id].exit + 1);
                }
            }
        }

        {
            let block = &mut self[id];
            if drop_jump {
                block.tac_ops.pop();
            } else if to_plain_jump {
                if let Some(op) = block.last_op_mut() {
                    op.opcode = OpCode::JUMP;
                    op.args.pop();
                }
            }
            // A JUMPI may still throw at runtime, but only becomes a THROWI
            // when every destination is invalid.
            if settings.generate_throws && invalid_jump {
                if let Some(op) = block.last_op_mut() {
                    let throw = TACOp::convert_jump_to_throw(op);
                    *op = throw;
                }
            }
            block.has_unresolved_jump = unresolved;
        }

        // Where an inferred destination group intersects the current
        // successors, keep only the intersection: this preserves split-path
        // identity when duplicate blocks exist at a destination.
        let succs_now = self[id].succs.clone();
        for hosts in jumpdests.values_mut() {
            let keep: Vec<BlockId> =
                hosts.iter().copied().filter(|h| succs_now.contains(h)).collect();
            if !keep.is_empty() {
                *hosts = keep;
            }
        }
        let keep: Vec<BlockId> =
            fallthrough.iter().copied().filter(|f| succs_now.contains(f)).collect();
        if !keep.is_empty() {
            fallthrough = keep;
        }

        let old_succs: BTreeSet<BlockId> = succs_now.iter().copied().collect();
        let mut new_succs: BTreeSet<BlockId> = jumpdests.values().flatten().copied().collect();
        new_succs.extend(fallthrough.iter().copied());

        if let Some(&first) = fallthrough.first() {
            self[id].fallthrough = Some(first);
        }

        for &s in &old_succs {
            if !new_succs.contains(&s) && jumpdests.contains_key(&self[s].entry) {
                self.remove_edge(id, s);
            }
        }
        for &s in &new_succs {
            if !self.has_edge(id, s) {
                self.add_edge(id, s);
            }
        }

        if settings.mutate_jumps {
            let fallthrough = self.get_blocks_by_pc(last_pc + 1);
            if remove_non_fallthrough {
                for s in self[id].succs.clone() {
                    if !fallthrough.contains(&s) {
                        self.remove_edge(id, s);
                    }
                }
            }
            if remove_fallthrough {
                for s in fallthrough {
                    self.remove_edge(id, s);
                }
            }
        }

        let final_succs: BTreeSet<BlockId> = self[id].succs.iter().copied().collect();
        old_succs != final_succs
    }

    /// Add jump edges that can be inferred from the destination variable's
    /// definition sites, for blocks whose jumps are otherwise unresolved.
    /// The jump stays unresolved only if every def-site variable is
    /// unconstrained.
    pub fn hook_up_block_def_site_jumps(&mut self, id: BlockId) {
        let Some(last_op) = self[id].last_op() else {
            return;
        };
        if !matches!(last_op.opcode, OpCode::JUMP | OpCode::JUMPI) {
            return;
        }
        let dest = last_op.args[0].value().clone();

        let site_vars: Vec<Variable> = dest
            .def_sites
            .iter()
            .filter_map(|&site| self.def_site_variable(site).cloned())
            .collect();
        let non_top_vars: Vec<&Variable> =
            site_vars.iter().filter(|v| !v.is_unconstrained()).collect();

        let existing_dests: Vec<usize> =
            self[id].succs.iter().map(|&s| self[s].entry).collect();

        let joined = Variable::join_all(non_top_vars.iter().copied());
        let mut edges = Vec::new();
        for value in joined.values().iter() {
            let Some(pc) = as_pc(value) else { continue };
            if existing_dests.contains(&pc) || !self.is_valid_jump_dest(pc) {
                continue;
            }
            edges.extend(self.get_blocks_by_pc(pc));
        }
        let unresolved = non_top_vars.is_empty();
        for host in edges {
            self.add_edge(id, host);
        }

        self[id].has_unresolved_jump = unresolved;
    }

    /// Graph-wide constant propagation and folding.
    pub fn apply_operations(&mut self, use_sets: bool) {
        for id in self.ids() {
            self.apply_block_operations(id, use_sets);
        }
    }

    /// Graph-wide stack placeholder substitution.
    pub fn hook_up_stack_vars(&mut self) {
        for id in self.ids() {
            self.hook_up_block_stack_vars(id);
        }
    }

    /// Connect all edges in the graph that can be inferred from constant
    /// jump destinations and conditions. Returns true iff any edge changed.
    ///
    /// `mutate_jumps` and `generate_throws` should only be enabled once the
    /// analysis has stabilised; used too early, they may prevent valid edges
    /// from being added later.
    pub fn hook_up_jumps(&mut self, settings: &Settings) -> bool {
        let mut modified = false;
        for id in self.ids() {
            modified |= self.hook_up_block_jumps(id, settings);
        }
        modified
    }

    /// Graph-wide def-site jump inference.
    pub fn hook_up_def_site_jumps(&mut self) {
        for id in self.ids() {
            self.hook_up_block_def_site_jumps(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn analysed(hex: &str, settings: &Settings) -> TACGraph {
        let mut graph = TACGraph::from_bytecode(hex, settings).unwrap();
        for id in graph.ids() {
            graph.build_entry_stack(id);
            graph.build_exit_stack(id, settings).unwrap();
        }
        graph
    }

    #[test]
    fn constant_jump_resolves_at_construction() {
        // PUSH1 3, JUMP | JUMPDEST, STOP
        let settings = Settings::default();
        let graph = analysed("6003565b00", &settings);

        let ids = graph.sorted_traversal();
        assert_eq!(ids.len(), 2);
        assert_eq!(graph[ids[0]].succs, vec![ids[1]]);
        assert_eq!(graph[ids[1]].preds, vec![ids[0]]);
        assert!(!graph.has_unresolved_jump());
    }

    #[test]
    fn non_jump_block_falls_through() {
        // PUSH1 0 | JUMPDEST, STOP
        let settings = Settings::default();
        let graph = analysed("60005b00", &settings);
        let ids = graph.sorted_traversal();
        assert_eq!(graph[ids[0]].succs, vec![ids[1]]);
        assert_eq!(graph[ids[0]].fallthrough, Some(ids[1]));
    }

    #[test]
    fn exit_stack_substitutes_placeholders() {
        // Block digging into the entry stack: bare SWAP1.
        let settings = Settings::default();
        let mut graph = TACGraph::from_bytecode("90", &settings).unwrap();
        let id = graph.ids()[0];

        let mut entry = VariableStack::new();
        entry.push(Variable::constant(U256::from(7), "a"));
        entry.push(Variable::constant(U256::from(9), "b"));
        graph[id].entry_stack = entry;

        graph.build_exit_stack(id, &settings).unwrap();
        let exit = &graph[id].exit_stack;
        assert_eq!(exit.len(), 2);
        assert_eq!(exit.peek(0).const_value(), Some(U256::from(7)));
        assert_eq!(exit.peek(1).const_value(), Some(U256::from(9)));
    }

    #[test]
    fn empty_pop_raises_when_configured() {
        let mut settings = Settings::default();
        settings.die_on_empty_pop = true;
        // A bare POP pops past the bottom of an empty entry stack.
        let mut graph = TACGraph::from_bytecode("50", &settings).unwrap();
        let id = graph.ids()[0];
        assert!(matches!(
            graph.build_exit_stack(id, &settings),
            Err(DecompileError::EmptyPop(_))
        ));
    }

    #[test]
    fn overflow_is_recorded_and_skipped() {
        let settings = Settings::default();
        let mut graph = TACGraph::from_bytecode("6001", &settings).unwrap();
        let id = graph.ids()[0];
        graph[id].entry_stack.set_max_size(0);
        graph[id].exit_stack.set_max_size(0);
        for i in 0..VariableStack::DEFAULT_MIN_MAX_SIZE {
            graph[id]
                .entry_stack
                .push(Variable::constant(U256::from(i as u64), "C"));
        }

        let overflowed = graph.build_exit_stack(id, &settings).unwrap();
        assert!(overflowed);
        assert!(graph[id].symbolic_overflow);
        // skip_stack_on_overflow holds by default: exit stack untouched.
        assert_eq!(graph[id].exit_stack.len(), 0);
    }

    #[test]
    fn invalid_jump_generates_throw() {
        // PUSH1 0x42, JUMP, STOP with no JUMPDEST anywhere.
        let mut settings = Settings::default();
        settings.generate_throws = true;
        let mut graph = TACGraph::from_bytecode("60425600", &settings).unwrap();
        for id in graph.ids() {
            graph.hook_up_block_jumps(id, &settings);
        }

        let ids = graph.sorted_traversal();
        let first = &graph[ids[0]];
        assert_eq!(first.last_op().unwrap().opcode, OpCode::THROW);
        assert!(first.succs.is_empty());
        assert!(!first.has_unresolved_jump);
    }

    #[test]
    fn unconstrained_jump_stays_unresolved() {
        // CALLDATALOAD's result is unconstrained: PUSH1 0, CALLDATALOAD, JUMP
        let settings = Settings::default();
        let graph = TACGraph::from_bytecode("6000355600", &settings).unwrap();
        let ids = graph.sorted_traversal();
        assert!(graph[ids[0]].has_unresolved_jump);
        assert!(graph.has_unresolved_jump());
    }
}
