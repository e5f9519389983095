//! Conversion of EVM basic blocks into three-address form.

use primitives::stack::VariableStack;
use primitives::variable::{BlockId, DefSite, DefSiteSet, Variable};

use crate::graph::TACBasicBlock;
use crate::opcodes::OpCode;
use crate::parse::{EVMBasicBlock, EVMOp};
use crate::tac::{TACArg, TACOp};

/// Converts EVM basic blocks into equivalent TAC basic blocks.
///
/// Most instructions map over directly, except:
/// - POP pops the symbolic stack and generates no operation;
/// - PUSH generates a CONST assignment;
/// - DUP and SWAP permute the symbolic stack, generating no operations;
/// - LOG0 through LOG4 all become a generic LOG instruction.
///
/// A block whose instructions generate no operations receives a single NOP
/// so that it stays non-empty and locatable by pc.
#[derive(Debug, Default)]
pub struct Destackifier {
    /// The three-address operations emitted so far for the current block.
    ops: Vec<TACOp>,
    /// The symbolic stack being operated on.
    stack: VariableStack,
    /// Entry pc of the block being converted.
    block_entry: usize,
    /// Counter giving fresh variables globally-unique names.
    stack_vars: usize,
}

impl Destackifier {
    pub fn new() -> Self {
        Destackifier::default()
    }

    /// Produce the TAC equivalent of the given EVM block. The result's stack
    /// is the delta stack: what the block pushes, atop how far it digs.
    pub fn convert_block(&mut self, evm_block: &EVMBasicBlock) -> TACBasicBlock {
        self.ops = Vec::new();
        self.stack = VariableStack::new();
        self.block_entry = evm_block.entry;

        for op in &evm_block.evm_ops {
            self.handle_evm_op(op);
        }

        if self.ops.is_empty() {
            self.ops.push(TACOp::new(OpCode::NOP, Vec::new(), evm_block.entry));
        }

        TACBasicBlock::new(
            evm_block.entry,
            evm_block.exit,
            std::mem::take(&mut self.ops),
            evm_block.evm_ops.clone(),
            std::mem::replace(&mut self.stack, VariableStack::new()),
        )
    }

    /// A fresh unconstrained variable defined at the given pc. The def site
    /// block is linked up once the containing block joins a graph.
    fn new_var(&mut self, pc: usize) -> Variable {
        let def_sites = DefSiteSet::singleton(DefSite::new(BlockId::UNLINKED, pc));
        let var = Variable::top(format!("V{}", self.stack_vars), def_sites);
        self.stack_vars += 1;
        var
    }

    fn handle_evm_op(&mut self, op: &EVMOp) {
        if op.opcode.is_swap() {
            self.stack.swap(op.opcode.pop - 1);
        } else if op.opcode.is_dup() {
            self.stack.dup(op.opcode.pop);
        } else if op.opcode == OpCode::POP {
            self.stack.pop();
        } else {
            self.gen_instruction(op);
        }
    }

    /// Emit the TAC operation for one EVM instruction and adjust the stack.
    /// The result variable, if any, is pushed only after the operation's
    /// arguments have been popped.
    fn gen_instruction(&mut self, op: &EVMOp) {
        // Everything that pushes anything pushes exactly one word.
        let new_var = (op.opcode.push == 1).then(|| self.new_var(op.pc));

        let inst = if op.opcode.is_push() {
            let c = Variable::constant(op.value.unwrap_or_default(), "C");
            let mut inst = TACOp::assign(
                new_var.clone().unwrap_or_else(|| self.new_var(op.pc)),
                OpCode::CONST,
                vec![TACArg::from_var(c)],
                op.pc,
            );
            inst.print_name = false;
            inst
        } else if op.opcode.is_missing() {
            let c = Variable::constant(op.value.unwrap_or_default(), "C");
            TACOp::new(op.opcode, vec![TACArg::from_var(c)], op.pc)
        } else if op.opcode.is_log() {
            let args = self.pop_args(op.opcode.pop);
            TACOp::new(OpCode::LOG, args, op.pc)
        } else {
            let args = self.pop_args(op.opcode.pop);
            match new_var.clone() {
                Some(lhs) => TACOp::assign(lhs, op.opcode, args, op.pc),
                None => TACOp::new(op.opcode, args, op.pc),
            }
        };

        self.ops.push(inst);
        if let Some(var) = new_var {
            self.stack.push(var);
        }
    }

    fn pop_args(&mut self, n: usize) -> Vec<TACArg> {
        self.stack
            .pop_many(n)
            .into_iter()
            .map(TACArg::from_var)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use alloy::primitives::U256;

    fn convert(hex: &str) -> Vec<TACBasicBlock> {
        let ops = parse::parse_bytecode(hex, false).unwrap();
        let mut destack = Destackifier::new();
        parse::blocks_from_ops(ops)
            .iter()
            .map(|b| destack.convert_block(b))
            .collect()
    }

    #[test]
    fn push_becomes_const_assign() {
        let blocks = convert("600400");
        let ops = &blocks[0].tac_ops;
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].opcode, OpCode::CONST);
        assert_eq!(ops[0].lhs.as_ref().map(|l| l.name.as_str()), Some("V0"));
        assert_eq!(ops[0].args[0].value().const_value(), Some(U256::from(4)));
        assert_eq!(ops[1].opcode, OpCode::STOP);
    }

    #[test]
    fn delta_stack_tracks_pushes() {
        // PUSH1 1, PUSH1 2, ADD
        let blocks = convert("6001600201");
        let block = &blocks[0];
        // One ADD result remains on the delta stack.
        assert_eq!(block.delta_stack.len(), 1);
        assert_eq!(block.delta_stack.peek(0).name, "V2");
        assert_eq!(block.delta_stack.empty_pops, 0);
        // The ADD consumed the two pushed constants.
        let add = &block.tac_ops[2];
        assert_eq!(add.opcode, OpCode::ADD);
        assert_eq!(add.args.len(), 2);
    }

    #[test]
    fn stack_manipulation_emits_no_ops() {
        // PUSH1 1, PUSH1 2, SWAP1, POP, DUP1, POP, STOP
        let blocks = convert("600160029050805000");
        let block = &blocks[0];
        let codes: Vec<&str> = block.tac_ops.iter().map(|o| o.opcode.name).collect();
        assert_eq!(codes, vec!["CONST", "CONST", "STOP"]);
        // SWAP1 then POP discarded the first push; DUP1 then POP cancel out.
        assert_eq!(block.delta_stack.len(), 1);
        assert_eq!(block.delta_stack.peek(0).name, "V1");
    }

    #[test]
    fn deep_operands_become_placeholders() {
        // A bare ADD digs two slots from below the block entry.
        let blocks = convert("01");
        let block = &blocks[0];
        let add = &block.tac_ops[0];
        assert_eq!(add.args[0].value().name, "S0");
        assert_eq!(add.args[1].value().name, "S1");
        assert_eq!(block.delta_stack.empty_pops, 2);
        assert_eq!(block.delta_stack.len(), 1);
    }

    #[test]
    fn logs_are_generic() {
        // PUSH1 0, PUSH1 0, LOG0
        let blocks = convert("60006000a000");
        let ops = &blocks[0].tac_ops;
        assert_eq!(ops[2].opcode, OpCode::LOG);
        assert_eq!(ops[2].args.len(), 2);
    }

    #[test]
    fn empty_block_receives_a_nop() {
        // A lone JUMPDEST emits nothing.
        let blocks = convert("5b");
        assert_eq!(blocks[0].tac_ops.len(), 1);
        assert_eq!(blocks[0].tac_ops[0].opcode, OpCode::NOP);
        assert_eq!(blocks[0].tac_ops[0].pc, 0);
    }

    #[test]
    fn variable_names_are_globally_unique() {
        let blocks = convert("6001565b6002");
        let v0 = blocks[0].tac_ops[0].lhs.as_ref().unwrap();
        let v1 = blocks[1].tac_ops[0].lhs.as_ref().unwrap();
        assert_eq!(v0.name, "V0");
        assert_eq!(v1.name, "V1");
    }
}
