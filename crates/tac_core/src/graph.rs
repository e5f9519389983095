//! The control flow graph of three-address basic blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Index, IndexMut};

use primitives::stack::VariableStack;
use primitives::variable::{BlockId, DefSite, Variable};

use crate::destack::Destackifier;
use crate::error::Result;
use crate::function::FunctionExtraction;
use crate::opcodes::OpCode;
use crate::parse::{self, EVMBasicBlock, EVMOp};
use crate::settings::Settings;
use crate::tac::TACOp;

/// A basic block of three-address code, alongside the EVM code it was
/// derived from and the stack transformation its execution causes.
#[derive(Debug, Clone)]
pub struct TACBasicBlock {
    /// The pc of the first byte in the source EVM block.
    pub entry: usize,
    /// The pc of the last byte in the source EVM block; possibly a PUSH
    /// argument rather than an instruction.
    pub exit: usize,
    /// Blocks which pass control to this one.
    pub preds: Vec<BlockId>,
    /// Blocks which receive control from this one.
    pub succs: Vec<BlockId>,
    /// True if the block contains a jump whose destination is a variable
    /// that could not be fully resolved.
    pub has_unresolved_jump: bool,
    /// Extra information appended to the block identifier, used to
    /// disambiguate duplicated blocks.
    pub ident_suffix: String,
    /// The source EVM code.
    pub evm_ops: Vec<EVMOp>,
    /// The equivalent three-address code.
    pub tac_ops: Vec<TACOp>,
    /// The stack change caused by running this block: the items left on top
    /// after execution, above the number of entry items consumed. `S{n}`
    /// placeholders denote whatever was n slots from the top at entry.
    pub delta_stack: VariableStack,
    /// The complete stack state before execution of the block.
    pub entry_stack: VariableStack,
    /// The complete stack state after execution of the block.
    pub exit_stack: VariableStack,
    /// Whether dataflow analysis overflowed the symbolic stack here.
    pub symbolic_overflow: bool,
    /// The fallthrough successor, once jump inference has identified one.
    pub fallthrough: Option<BlockId>,
}

impl TACBasicBlock {
    pub fn new(
        entry: usize,
        exit: usize,
        tac_ops: Vec<TACOp>,
        evm_ops: Vec<EVMOp>,
        delta_stack: VariableStack,
    ) -> Self {
        TACBasicBlock {
            entry,
            exit,
            preds: Vec::new(),
            succs: Vec::new(),
            has_unresolved_jump: false,
            ident_suffix: String::new(),
            evm_ops,
            tac_ops,
            delta_stack,
            entry_stack: VariableStack::new(),
            exit_stack: VariableStack::new(),
            symbolic_overflow: false,
            fallthrough: None,
        }
    }

    /// The block's identifier: its entry pc in hex, plus any suffix.
    pub fn ident(&self) -> String {
        format!("{:#x}{}", self.entry, self.ident_suffix)
    }

    /// The ordering key blocks are sorted by wherever traversal order
    /// matters.
    pub fn sort_key(&self) -> (usize, String) {
        (self.entry, self.ident_suffix.clone())
    }

    pub fn last_op(&self) -> Option<&TACOp> {
        self.tac_ops.last()
    }

    pub fn last_op_mut(&mut self) -> Option<&mut TACOp> {
        self.tac_ops.last_mut()
    }

    /// Update all operations and def sites within to refer to the given
    /// block handle. Must be called after any copy or merge.
    pub fn reset_block_refs(&mut self, id: BlockId) {
        for op in &mut self.tac_ops {
            op.block = id;
            if let Some(lhs) = &mut op.lhs {
                lhs.def_sites = lhs
                    .def_sites
                    .map(|site| DefSite::new(id, site.pc));
            }
        }
    }
}

/// A control flow graph of TAC basic blocks.
///
/// Blocks live in an arena keyed by stable `BlockId`s, in creation order;
/// edges are the symmetric `preds`/`succs` lists on the blocks themselves.
#[derive(Debug, Default)]
pub struct TACGraph {
    blocks: BTreeMap<BlockId, TACBasicBlock>,
    next_id: usize,
    /// The root block; the program entry point at pc zero, if present.
    pub root: Option<BlockId>,
    /// Maps an entry pc to the successors its block had at the time it was
    /// split by procedure cloning, so the edges can be restored at merge
    /// time.
    pub split_node_succs: BTreeMap<usize, Vec<BlockId>>,
    /// Solidity functions discovered by the extraction pass, if it ran.
    pub functions: Option<FunctionExtraction>,
}

impl Index<BlockId> for TACGraph {
    type Output = TACBasicBlock;

    fn index(&self, id: BlockId) -> &TACBasicBlock {
        &self.blocks[&id]
    }
}

impl IndexMut<BlockId> for TACGraph {
    fn index_mut(&mut self, id: BlockId) -> &mut TACBasicBlock {
        self.blocks.get_mut(&id).expect("stale block id")
    }
}

impl TACGraph {
    /// Build a graph from a sequence of EVM blocks. Constants are folded and
    /// edges connected up wherever they can already be inferred.
    pub fn from_evm_blocks(evm_blocks: &[EVMBasicBlock], settings: &Settings) -> TACGraph {
        let mut graph = TACGraph::default();
        let mut destack = Destackifier::new();

        for evm_block in evm_blocks {
            let block = destack.convert_block(evm_block);
            let id = graph.add_block(block);
            graph.reset_block_refs(id);
        }
        graph.root = graph.ids().into_iter().find(|&id| graph[id].entry == 0);

        graph.apply_operations(false);
        graph.hook_up_jumps(settings);
        graph
    }

    /// Build a graph from a hex string of EVM bytecode.
    pub fn from_bytecode(src: &str, settings: &Settings) -> Result<TACGraph> {
        let ops = parse::parse_bytecode(src, settings.strict)?;
        Ok(Self::from_evm_blocks(&parse::blocks_from_ops(ops), settings))
    }

    /// Build a graph from disassembly lines.
    pub fn from_dasm<'a, I: IntoIterator<Item = &'a str>>(
        lines: I,
        settings: &Settings,
    ) -> Result<TACGraph> {
        let ops = parse::parse_dasm(lines, settings.strict)?;
        Ok(Self::from_evm_blocks(&parse::blocks_from_ops(ops), settings))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    pub fn get(&self, id: BlockId) -> Option<&TACBasicBlock> {
        self.blocks.get(&id)
    }

    /// All block handles in creation order.
    pub fn ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &TACBasicBlock)> {
        self.blocks.iter().map(|(id, b)| (*id, b))
    }

    /// Add the given block to the graph, returning its new handle.
    pub fn add_block(&mut self, block: TACBasicBlock) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.blocks.insert(id, block);
        id
    }

    /// Remove the given block, disconnecting all incident edges. Returns the
    /// removed block.
    pub fn remove_block(&mut self, id: BlockId) -> Option<TACBasicBlock> {
        if !self.contains(id) {
            return None;
        }
        if self.root == Some(id) {
            self.root = None;
        }
        for pred in self[id].preds.clone() {
            self.remove_edge(pred, id);
        }
        for succ in self[id].succs.clone() {
            self.remove_edge(id, succ);
        }
        self.blocks.remove(&id)
    }

    /// Refresh op and def-site back-references inside the given block.
    pub fn reset_block_refs(&mut self, id: BlockId) {
        self[id].reset_block_refs(id);
    }

    pub fn has_edge(&self, head: BlockId, tail: BlockId) -> bool {
        self.get(head).is_some_and(|b| b.succs.contains(&tail))
    }

    /// Add a CFG edge from head to tail, keeping the edge lists symmetric.
    /// Adding an existing edge changes nothing.
    pub fn add_edge(&mut self, head: BlockId, tail: BlockId) {
        if !self[head].succs.contains(&tail) {
            self[head].succs.push(tail);
        }
        if !self[tail].preds.contains(&head) {
            self[tail].preds.push(head);
        }
    }

    /// Remove the CFG edge from head to tail, if it exists.
    pub fn remove_edge(&mut self, head: BlockId, tail: BlockId) {
        if let Some(block) = self.blocks.get_mut(&head) {
            block.succs.retain(|s| *s != tail);
        }
        if let Some(block) = self.blocks.get_mut(&tail) {
            block.preds.retain(|p| *p != head);
        }
    }

    /// The blocks whose spans include the given program counter, in
    /// creation order.
    pub fn get_blocks_by_pc(&self, pc: usize) -> Vec<BlockId> {
        self.blocks()
            .filter(|(_, b)| b.entry <= pc && pc <= b.exit)
            .map(|(id, _)| id)
            .collect()
    }

    /// The block with the given identifier, if one exists.
    pub fn get_block_by_ident(&self, ident: &str) -> Option<BlockId> {
        self.blocks()
            .find(|(_, b)| b.ident() == ident)
            .map(|(id, _)| id)
    }

    /// The operations with the given pc, as (block, op index) pairs.
    pub fn get_ops_by_pc(&self, pc: usize) -> Vec<(BlockId, usize)> {
        let mut ops = Vec::new();
        for id in self.get_blocks_by_pc(pc) {
            for (i, op) in self[id].tac_ops.iter().enumerate() {
                if op.pc == pc {
                    ops.push((id, i));
                }
            }
        }
        ops
    }

    /// True iff the given program counter refers to a valid jumpdest.
    pub fn is_valid_jump_dest(&self, pc: usize) -> bool {
        self.get_ops_by_pc(pc)
            .iter()
            .any(|&(id, i)| self[id].tac_ops[i].opcode == OpCode::JUMPDEST)
    }

    /// The lhs variable of the operation a def site refers to, if any.
    pub fn def_site_variable(&self, site: DefSite) -> Option<&Variable> {
        self.get(site.block)?
            .tac_ops
            .iter()
            .filter(|op| op.pc == site.pc)
            .next_back()?
            .lhs
            .as_ref()
    }

    /// Repopulate every block's predecessor list from the successor lists.
    pub fn recalc_preds(&mut self) {
        let ids = self.ids();
        for &id in &ids {
            self[id].preds.clear();
        }
        for &id in &ids {
            for succ in self[id].succs.clone() {
                if !self[succ].preds.contains(&id) {
                    self[succ].preds.push(id);
                }
            }
        }
    }

    /// Whether the given block can reach any of the destination blocks.
    pub fn reaches(&self, block: BlockId, dests: &[BlockId]) -> bool {
        if dests.contains(&block) {
            return true;
        }
        let mut queue = vec![block];
        let mut traversed = Vec::new();
        while let Some(curr) = queue.pop() {
            traversed.push(curr);
            let succs = &self[curr].succs;
            if dests.iter().any(|d| succs.contains(d)) {
                return true;
            }
            for &succ in succs {
                if !traversed.contains(&succ) && !queue.contains(&succ) {
                    queue.push(succ);
                }
            }
        }
        false
    }

    /// The blocks reachable from the given origin addresses.
    pub fn transitive_closure(&self, origin_addresses: &[usize]) -> Vec<BlockId> {
        let mut queue = Vec::new();
        for &address in origin_addresses {
            for id in self.get_blocks_by_pc(address) {
                if !queue.contains(&id) {
                    queue.push(id);
                }
            }
        }

        let mut reached = Vec::new();
        while let Some(id) = queue.pop() {
            reached.push(id);
            for &succ in &self[id].succs {
                if !queue.contains(&succ) && !reached.contains(&succ) {
                    queue.push(succ);
                }
            }
        }
        reached
    }

    /// Remove all blocks unreachable from the given origin addresses,
    /// returning the removed blocks.
    ///
    /// If not all jumps have been resolved, unreached blocks may actually be
    /// reachable.
    pub fn remove_unreachable_blocks(&mut self, origin_addresses: &[usize]) -> Vec<TACBasicBlock> {
        let reached = self.transitive_closure(origin_addresses);
        let mut removed = Vec::new();
        for id in self.ids() {
            if !reached.contains(&id) {
                removed.extend(self.remove_block(id));
            }
        }
        removed
    }

    /// The graph's edges as (pred, succ) pairs.
    pub fn edge_list(&self) -> Vec<(BlockId, BlockId)> {
        self.blocks()
            .flat_map(|(id, b)| b.succs.iter().map(move |&s| (id, s)))
            .collect()
    }

    /// Block handles sorted by entry pc, ties broken by identifier suffix.
    pub fn sorted_traversal(&self) -> Vec<BlockId> {
        let mut ids = self.ids();
        ids.sort_by(|&a, &b| self[a].sort_key().cmp(&self[b].sort_key()));
        ids
    }

    /// Sort the given handles by entry pc and identifier suffix, skipping
    /// any that are no longer in the graph.
    pub fn sort_blocks(&self, ids: impl IntoIterator<Item = BlockId>) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = ids.into_iter().filter(|&id| self.contains(id)).collect();
        ids.sort_by(|&a, &b| self[a].sort_key().cmp(&self[b].sort_key()));
        ids
    }

    /// True iff any block in this graph contains an unresolved jump.
    pub fn has_unresolved_jump(&self) -> bool {
        self.blocks().any(|(_, b)| b.has_unresolved_jump)
    }

    /// The blocks whose last operation may halt execution, plus the block
    /// holding the last operation of the program.
    pub fn terminal_blocks(&self) -> Vec<BlockId> {
        let mut terminals: Vec<BlockId> = self
            .blocks()
            .filter(|(_, b)| b.last_op().is_some_and(|op| op.opcode.possibly_halts()))
            .map(|(id, _)| id)
            .collect();
        if let Some((last, _)) = self
            .blocks()
            .max_by_key(|(_, b)| b.last_op().map(|op| op.pc).unwrap_or_default())
        {
            if !terminals.contains(&last) {
                terminals.push(last);
            }
        }
        self.sort_blocks(terminals)
    }

    /// The dominator sets of this graph: each reachable block mapped to the
    /// set of blocks through which every path to it passes. With `post`,
    /// post-dominators are computed instead, flowing backwards from the
    /// terminal blocks.
    ///
    /// Blocks unreachable in the chosen direction are absent from the map.
    pub fn dominators(&self, post: bool) -> BTreeMap<BlockId, BTreeSet<BlockId>> {
        let roots: Vec<BlockId> = if post {
            self.terminal_blocks()
        } else {
            self.root.into_iter().collect()
        };
        let upstream = |id: BlockId| -> Vec<BlockId> {
            if post { self[id].succs.clone() } else { self[id].preds.clone() }
        };

        let reachable: BTreeSet<BlockId> = {
            let mut seen: BTreeSet<BlockId> = roots.iter().copied().collect();
            let mut queue: Vec<BlockId> = roots.clone();
            while let Some(id) = queue.pop() {
                let downstream = if post {
                    self[id].preds.clone()
                } else {
                    self[id].succs.clone()
                };
                for next in downstream {
                    if seen.insert(next) {
                        queue.push(next);
                    }
                }
            }
            seen
        };

        let mut doms: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        for &id in &reachable {
            if roots.contains(&id) {
                doms.insert(id, BTreeSet::from([id]));
            } else {
                doms.insert(id, reachable.clone());
            }
        }

        let order = self.sort_blocks(reachable.iter().copied());
        let mut changed = true;
        while changed {
            changed = false;
            for &id in &order {
                if roots.contains(&id) {
                    continue;
                }
                let mut new_doms: Option<BTreeSet<BlockId>> = None;
                for up in upstream(id) {
                    let Some(up_doms) = doms.get(&up) else { continue };
                    new_doms = Some(match new_doms {
                        None => up_doms.clone(),
                        Some(acc) => acc.intersection(up_doms).copied().collect(),
                    });
                }
                let mut new_doms = new_doms.unwrap_or_default();
                new_doms.insert(id);
                if doms.get(&id) != Some(&new_doms) {
                    doms.insert(id, new_doms);
                    changed = true;
                }
            }
        }

        doms
    }

    /// The immediate dominator of each reachable block: its unique closest
    /// strict dominator. Roots map to themselves. With `post`, immediate
    /// post-dominators.
    pub fn immediate_dominators(&self, post: bool) -> BTreeMap<BlockId, BlockId> {
        let doms = self.dominators(post);
        let mut idoms = BTreeMap::new();

        for (&id, dom_set) in &doms {
            let strict: Vec<BlockId> =
                dom_set.iter().copied().filter(|&d| d != id).collect();
            if strict.is_empty() {
                idoms.insert(id, id);
                continue;
            }
            // The immediate dominator is the strict dominator dominated by
            // every other strict dominator.
            let closest = strict.iter().copied().max_by_key(|d| {
                doms.get(d).map(BTreeSet::len).unwrap_or_default()
            });
            if let Some(closest) = closest {
                idoms.insert(id, closest);
            }
        }

        idoms
    }
}
