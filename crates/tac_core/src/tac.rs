//! Three-address code operations and their arguments.

use std::fmt;

use primitives::variable::{BlockId, Variable};

use crate::opcodes::OpCode;

/// An argument to a TAC operation.
///
/// Besides its current variable, an argument remembers the entry-stack slot
/// it originally came from, if any, so that refined stack information can be
/// substituted into the body of a block as analysis proceeds.
#[derive(Debug, Clone, PartialEq)]
pub struct TACArg {
    var: Variable,
    stack_slot: Option<usize>,
}

impl TACArg {
    /// Wrap a variable, remembering its stack slot if it is a placeholder.
    pub fn from_var(var: Variable) -> Self {
        let stack_slot = var.payload();
        TACArg { var, stack_slot }
    }

    /// The argument's current value.
    pub fn value(&self) -> &Variable {
        &self.var
    }

    pub fn value_mut(&mut self) -> &mut Variable {
        &mut self.var
    }

    /// The entry-stack depth this argument originally referred to.
    pub fn stack_slot(&self) -> Option<usize> {
        self.stack_slot
    }

    /// Replace the argument's variable, keeping its stack-slot origin.
    pub fn set_var(&mut self, var: Variable) {
        self.var = var;
    }
}

impl fmt::Display for TACArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.var.fmt(f)
    }
}

/// A single three-address operation: an opcode applied to arguments at a
/// given pc, optionally binding its result to a variable.
///
/// `block` points back at the containing block and must be refreshed after
/// any block copy or merge.
#[derive(Debug, Clone, PartialEq)]
pub struct TACOp {
    pub opcode: OpCode,
    pub args: Vec<TACArg>,
    pub pc: usize,
    pub block: BlockId,
    pub lhs: Option<Variable>,
    /// CONST assignments read better without their opcode name printed.
    pub print_name: bool,
}

impl TACOp {
    pub fn new(opcode: OpCode, args: Vec<TACArg>, pc: usize) -> Self {
        TACOp {
            opcode,
            args,
            pc,
            block: BlockId::UNLINKED,
            lhs: None,
            print_name: true,
        }
    }

    pub fn assign(lhs: Variable, opcode: OpCode, args: Vec<TACArg>, pc: usize) -> Self {
        TACOp {
            opcode,
            args,
            pc,
            block: BlockId::UNLINKED,
            lhs: Some(lhs),
            print_name: true,
        }
    }

    pub fn is_assign(&self) -> bool {
        self.lhs.is_some()
    }

    /// True iff each of this operation's arguments is a constant value.
    pub fn constant_args(&self) -> bool {
        self.args.iter().all(|arg| arg.value().is_const())
    }

    /// True iff none of this operation's arguments is value-unconstrained.
    pub fn constrained_args(&self) -> bool {
        self.args.iter().all(|arg| !arg.value().is_unconstrained())
    }

    /// Given a jump, convert it to a throw, preserving the condition if it
    /// was a JUMPI. Any other operation is returned unchanged.
    pub fn convert_jump_to_throw(op: &TACOp) -> TACOp {
        let mut new_op = match op.opcode {
            OpCode::JUMP => TACOp::new(OpCode::THROW, Vec::new(), op.pc),
            OpCode::JUMPI => TACOp::new(OpCode::THROWI, vec![op.args[1].clone()], op.pc),
            _ => return op.clone(),
        };
        new_op.block = op.block;
        new_op
    }
}

impl fmt::Display for TACOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rest = |args: &[TACArg]| {
            args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ")
        };

        // Store operations print their location argument as the destination.
        match self.opcode {
            OpCode::MSTORE => {
                return write!(f, "{:#x}: M[{}] = {}", self.pc, self.args[0], rest(&self.args[1..]));
            }
            OpCode::MSTORE8 => {
                return write!(f, "{:#x}: M8[{}] = {}", self.pc, self.args[0], rest(&self.args[1..]));
            }
            OpCode::SSTORE => {
                return write!(f, "{:#x}: S[{}] = {}", self.pc, self.args[0], rest(&self.args[1..]));
            }
            _ => {}
        }

        match &self.lhs {
            Some(lhs) => match self.opcode {
                OpCode::MLOAD => write!(f, "{:#x}: {} = M[{}]", self.pc, lhs.name, self.args[0]),
                OpCode::SLOAD => write!(f, "{:#x}: {} = S[{}]", self.pc, lhs.name, self.args[0]),
                _ => {
                    let mut parts = Vec::new();
                    if self.print_name {
                        parts.push(self.opcode.to_string());
                    }
                    parts.extend(self.args.iter().map(|a| a.to_string()));
                    write!(f, "{:#x}: {} = {}", self.pc, lhs.name, parts.join(" "))
                }
            },
            None => {
                if self.args.is_empty() {
                    write!(f, "{:#x}: {}", self.pc, self.opcode)
                } else {
                    write!(f, "{:#x}: {} {}", self.pc, self.opcode, rest(&self.args))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use primitives::lattice::Lattice;
    use primitives::variable::DefSiteSet;

    fn constant_arg(n: u64) -> TACArg {
        TACArg::from_var(Variable::constant(U256::from(n), "C"))
    }

    #[test]
    fn args_remember_their_slot() {
        let arg = TACArg::from_var(Variable::slot(2, DefSiteSet::bottom()));
        assert_eq!(arg.stack_slot(), Some(2));

        let mut arg = arg;
        arg.set_var(Variable::constant(U256::from(5), "V0"));
        assert_eq!(arg.stack_slot(), Some(2));
        assert_eq!(arg.value().const_value(), Some(U256::from(5)));
    }

    #[test]
    fn jump_to_throw() {
        let jump = TACOp::new(OpCode::JUMP, vec![constant_arg(9)], 4);
        let throw = TACOp::convert_jump_to_throw(&jump);
        assert_eq!(throw.opcode, OpCode::THROW);
        assert!(throw.args.is_empty());

        let jumpi = TACOp::new(OpCode::JUMPI, vec![constant_arg(9), constant_arg(1)], 4);
        let throwi = TACOp::convert_jump_to_throw(&jumpi);
        assert_eq!(throwi.opcode, OpCode::THROWI);
        assert_eq!(throwi.args.len(), 1);
        assert_eq!(throwi.args[0].value().const_value(), Some(U256::from(1)));
    }

    #[test]
    fn display_forms() {
        let v = Variable::top("V3", DefSiteSet::bottom());

        let store = TACOp::new(OpCode::MSTORE, vec![constant_arg(64), constant_arg(7)], 10);
        assert_eq!(store.to_string(), "0xa: M[0x40] = 0x7");

        let mut load = TACOp::assign(v.clone(), OpCode::MLOAD, vec![constant_arg(64)], 11);
        load.print_name = true;
        assert_eq!(load.to_string(), "0xb: V3 = M[0x40]");

        let mut konst = TACOp::assign(v.clone(), OpCode::CONST, vec![constant_arg(3)], 0);
        konst.print_name = false;
        assert_eq!(konst.to_string(), "0x0: V3 = 0x3");

        let add = TACOp::assign(v, OpCode::ADD, vec![constant_arg(1), constant_arg(2)], 1);
        assert_eq!(add.to_string(), "0x1: V3 = ADD 0x1 0x2");

        let plain = TACOp::new(OpCode::JUMP, vec![constant_arg(3)], 2);
        assert_eq!(plain.to_string(), "0x2: JUMP 0x3");
    }
}
