//! Identification of solidity functions in an analysed control flow graph.
//!
//! Public functions are discovered from the dispatch sequence comparing the
//! call-data signature against constants; private functions from confluence
//! blocks whose callers push a return address before jumping in.

use std::collections::{BTreeMap, VecDeque};

use alloy::primitives::U256;

use primitives::stack::VariableStack;
use primitives::variable::{BlockId, Variable};

use crate::graph::TACGraph;
use crate::opcodes::OpCode;

/// A solidity function with associated metadata.
#[derive(Debug, Clone)]
pub struct Function {
    /// The blocks composing the function.
    pub body: Vec<BlockId>,
    pub start_block: BlockId,
    pub end_block: Option<BlockId>,
    /// The hashed solidity signature dispatched on; empty for the fallback
    /// function and for private functions.
    pub signature: String,
    pub is_private: bool,
    /// Caller blocks, for private functions.
    pub preds: Vec<BlockId>,
    /// Return blocks, for private functions.
    pub succs: Vec<BlockId>,
}

impl Function {
    pub fn describe(&self, cfg: &TACGraph) -> String {
        let sig = if self.is_private {
            "Private function".to_string()
        } else if self.signature.is_empty() {
            "Public fallback function".to_string()
        } else {
            format!("Public function signature: {}", self.signature)
        };
        let ident = |id: BlockId| {
            cfg.get(id)
                .map(|b| b.ident())
                .unwrap_or_else(|| "<removed>".to_string())
        };
        let entry = format!("Entry block: {}", ident(self.start_block));
        let exit = match self.end_block {
            Some(end) => format!("Exit block: {}", ident(end)),
            None => "Exit block: None identified".to_string(),
        };
        let body: Vec<String> = cfg
            .sort_blocks(self.body.iter().copied())
            .into_iter()
            .map(ident)
            .collect();
        format!("{sig}\n{entry}\n{exit}\nBody: {}", body.join(", "))
    }
}

/// The outcome of function extraction over a graph.
#[derive(Debug, Default)]
pub struct FunctionExtraction {
    pub public: Vec<Function>,
    pub private: Vec<Function>,
    /// Maps each private-function invocation site to its return block, so
    /// body searches can step over calls.
    invoc_pairs: BTreeMap<BlockId, BlockId>,
}

impl FunctionExtraction {
    /// Extract private and public functions from the given graph.
    pub fn extract(cfg: &TACGraph) -> FunctionExtraction {
        let mut extraction = FunctionExtraction::default();
        extraction.extract_private_functions(cfg);
        extraction.extract_public_functions(cfg);
        extraction
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.public.iter().chain(self.private.iter())
    }

    /// Tag every block of every function body with an identifying suffix.
    pub fn mark_functions(&self, cfg: &mut TACGraph) {
        for (i, function) in self.functions().enumerate() {
            for &b in &function.body {
                if cfg.contains(b) {
                    cfg[b].ident_suffix.push_str(&format!("_F{i}"));
                }
            }
        }
    }

    pub fn describe(&self, cfg: &TACGraph) -> String {
        self.functions()
            .enumerate()
            .map(|(i, f)| format!("Function {i}:\n{}\n", f.describe(cfg)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn extract_private_functions(&mut self, cfg: &TACGraph) {
        let mut start_blocks = Vec::new();
        let mut pair_list = Vec::new();
        for &id in cfg.ids().iter().rev() {
            if let Some(pairs) = self.private_func_invocations(cfg, id) {
                start_blocks.push(id);
                pair_list.push(pairs);
            }
        }

        for pairs in &pair_list {
            for (&site, &ret) in pairs {
                self.invoc_pairs.insert(site, ret);
            }
        }

        for (i, &block) in start_blocks.iter().enumerate() {
            let return_blocks: Vec<BlockId> = pair_list[i].values().copied().collect();
            if let Some(mut function) = self.find_func_body(cfg, block, &return_blocks) {
                // A one-block function cannot exist on the EVM.
                if function.body.len() == 1 {
                    continue;
                }
                function.is_private = true;
                self.private.push(function);
            }
        }
    }

    /// If the given block begins a private function, the mapping from its
    /// invocation sites to their return blocks.
    ///
    /// A function start is a confluence whose callers each push a return
    /// address the caller can actually reach again.
    fn private_func_invocations(
        &self,
        cfg: &TACGraph,
        block: BlockId,
    ) -> Option<BTreeMap<BlockId, BlockId>> {
        let preds = cfg.sort_blocks(cfg[block].preds.clone());
        if preds.len() <= 1 || cfg[block].succs.is_empty() {
            return None;
        }

        let mut func_mapping = BTreeMap::new();
        let mut found_succ = false;
        for &pre in &preds {
            if cfg[block].succs.contains(&pre) {
                continue;
            }
            // A call site pushes at least the return address and the jump
            // destination, and leaves something on the stack.
            let push_count = cfg[pre]
                .evm_ops
                .iter()
                .filter(|op| op.opcode.is_push())
                .count();
            if push_count <= 1 {
                return None;
            }
            if cfg[pre].delta_stack.is_empty() {
                return None;
            }

            for val in cfg[pre].delta_stack.iter() {
                let Some(ref_block) = cfg.get_block_by_ident(&val.to_string()) else {
                    continue;
                };
                if cfg.reaches(pre, &[ref_block]) {
                    func_mapping.insert(pre, ref_block);
                    found_succ = true;
                    break;
                }
            }
        }

        if !found_succ || func_mapping.len() == 1 {
            return None;
        }
        Some(func_mapping)
    }

    /// BFS from a definite function start until a block with all the return
    /// addresses among its successors is found.
    fn find_func_body(
        &self,
        cfg: &TACGraph,
        block: BlockId,
        return_blocks: &[BlockId],
    ) -> Option<Function> {
        let mut body: Vec<BlockId> = Vec::new();
        let mut queue = VecDeque::from([block]);
        let mut end = false;

        while let Some(mut curr) = queue.pop_front() {
            // Calls to other functions are stepped over to their return.
            if let Some(&ret) = self.invoc_pairs.get(&curr) {
                if !body.contains(&curr) {
                    body.push(curr);
                }
                curr = ret;
            }
            let succs = &cfg[curr].succs;
            if return_blocks.iter().all(|r| succs.contains(r)) {
                end = true;
            }
            if !body.contains(&curr) && cfg.reaches(curr, return_blocks) {
                body.push(curr);
                for &s in succs {
                    if !return_blocks.contains(&s) {
                        queue.push_back(s);
                    }
                }
            }
        }

        if !end {
            return None;
        }

        // The exit block is the common predecessor of all returns, taking
        // the last in disassembly order among candidates.
        let mut exit_candidates: Option<Vec<BlockId>> = None;
        for &ret in return_blocks {
            let preds = &cfg[ret].preds;
            exit_candidates = Some(match exit_candidates {
                None => preds.clone(),
                Some(prev) => prev.into_iter().filter(|p| preds.contains(p)).collect(),
            });
        }
        let end_block = cfg
            .sort_blocks(exit_candidates.unwrap_or_default())
            .last()
            .copied();

        Some(Function {
            body,
            start_block: block,
            end_block,
            signature: String::new(),
            is_private: false,
            preds: cfg.sort_blocks(cfg[block].preds.clone()),
            succs: cfg.sort_blocks(return_blocks.iter().copied()),
        })
    }

    fn extract_public_functions(&mut self, cfg: &TACGraph) {
        // Find the variable loaded from call data zero, at the earliest
        // query of that location in the program.
        let mut sig_var: Option<Variable> = None;
        let mut load_block = None;
        'outer: for id in cfg.sorted_traversal() {
            for op in &cfg[id].tac_ops {
                if op.opcode == OpCode::CALLDATALOAD
                    && op.args[0].value().const_value() == Some(U256::ZERO)
                {
                    sig_var = op.lhs.clone();
                    load_block = Some(id);
                    break 'outer;
                }
            }
        }
        let (Some(mut sig_var), Some(load_block)) = (sig_var, load_block) else {
            return;
        };

        // Follow the signature until it is transformed into its final shape.
        for op in &cfg[load_block].tac_ops {
            if op.lhs.is_none()
                || !op.args.iter().any(|a| a.value().is_same(&sig_var))
            {
                continue;
            }
            if op.opcode == OpCode::EQ {
                break;
            }
            if let Some(lhs) = &op.lhs {
                sig_var = lhs.clone();
            }
        }

        // Find all the places the signature is compared against a constant.
        let mut func_sigs: Vec<(BlockId, String)> = Vec::new();
        let mut fallthroughs: Vec<BlockId> = Vec::new();
        for id in cfg.ids() {
            for op in &cfg[id].tac_ops {
                if op.lhs.is_none()
                    || op.opcode != OpCode::EQ
                    || !op.args.iter().any(|a| a.value().is_same(&sig_var))
                {
                    continue;
                }
                let sig = op
                    .args
                    .iter()
                    .map(|a| a.value())
                    .find(|v| !v.is_same(&sig_var))
                    .and_then(Variable::const_value)
                    .map(|v| format!("{v:#x}"))
                    .unwrap_or_default();

                // The matched branch heads a function; the fallthrough goes
                // on dispatching, the last one falling into the fallback.
                for &succ in &cfg[id].succs {
                    if cfg[id].fallthrough != Some(succ) {
                        func_sigs.push((succ, sig.clone()));
                    }
                }
                if let Some(ft) = cfg[id].fallthrough {
                    fallthroughs.push(ft);
                }
            }
        }
        if let Some(&last) = fallthroughs.last() {
            func_sigs.push((last, String::new()));
        }

        for (block, signature) in func_sigs {
            let function = self.public_function_at(cfg, block, signature);
            self.public.push(function);
        }
    }

    /// The function reachable from the given entry block, stepping over any
    /// already-identified function bodies and invocation sites.
    fn public_function_at(&self, cfg: &TACGraph, block: BlockId, signature: String) -> Function {
        let mut body: Vec<BlockId> = Vec::new();
        let mut queue = VecDeque::from([block]);
        let mut end_block = None;
        let mut prev_block: Option<BlockId> = None;
        let mut jumped = false;
        let mut pre_jump_block = block;

        while let Some(popped) = queue.pop_front() {
            let mut curr = Some(popped);

            // Jump over other function bodies. After stepping over a call,
            // the relevant stack is the one from before the jump.
            loop {
                let Some(c) = curr else { break };
                if !self.functions().any(|f| f.body.contains(&c)) {
                    break;
                }
                let reference_stack = if jumped {
                    jumped = false;
                    Some(&cfg[pre_jump_block].exit_stack)
                } else {
                    prev_block.map(|p| &cfg[p].exit_stack)
                };
                let next = self.jump_to_next_loc(cfg, c, &body, reference_stack);
                if next == curr {
                    break;
                }
                curr = next;
            }
            let Some(mut curr) = curr else { continue };
            prev_block = Some(popped);

            // Step over invocation sites after adding them to the body; an
            // invocation site always has a successor, so it cannot be the
            // end block.
            if let Some(&ret) = self.invoc_pairs.get(&curr) {
                jumped = true;
                pre_jump_block = curr;
                if !body.contains(&curr) {
                    body.push(curr);
                }
                curr = ret;
            }

            if cfg[curr].succs.is_empty() {
                end_block = Some(curr);
            }
            if !body.contains(&curr) {
                body.push(curr);
                for &s in &cfg[curr].succs {
                    queue.push_back(s);
                }
            }
        }

        Function {
            body,
            start_block: block,
            end_block,
            signature,
            is_private: false,
            preds: Vec::new(),
            succs: Vec::new(),
        }
    }

    /// The next available block not belonging to any function, found by
    /// search from `start`. A block is the continuation of the function
    /// being identified if it appears in the reference exit stack.
    fn jump_to_next_loc(
        &self,
        cfg: &TACGraph,
        start: BlockId,
        body: &[BlockId],
        reference_stack: Option<&VariableStack>,
    ) -> Option<BlockId> {
        let stack_str = reference_stack.map(|s| s.to_string()).unwrap_or_default();
        let mut queue = vec![start];
        let mut visited = vec![start];

        while let Some(b) = queue.pop() {
            if cfg[b].succs.is_empty() {
                return Some(b);
            }
            visited.push(b);

            let in_func = self.functions().any(|f| f.body.contains(&b));
            if !in_func
                && !self.invoc_pairs.contains_key(&b)
                && stack_str.contains(&cfg[b].ident())
                && !body.contains(&b)
            {
                return Some(b);
            }
            for &s in &cfg[b].succs {
                if !visited.contains(&s) {
                    queue.push(s);
                }
            }
        }
        None
    }
}
