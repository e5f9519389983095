//! Parsing of EVM bytecode and disassembly into basic blocks of operations.

use alloy::primitives::U256;
use tracing::debug;

use crate::error::{DecompileError, Result};
use crate::opcodes::OpCode;

/// A single parsed EVM instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EVMOp {
    /// Program counter of this operation.
    pub pc: usize,
    /// The operation code.
    pub opcode: OpCode,
    /// Immediate value for PUSH operations, or the raw byte of an
    /// unrecognised one.
    pub value: Option<U256>,
}

impl EVMOp {
    pub fn new(pc: usize, opcode: OpCode, value: Option<U256>) -> Self {
        EVMOp { pc, opcode, value }
    }
}

impl std::fmt::Display for EVMOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value {
            Some(v) => write!(f, "{:#x} {} {:#x}", self.pc, self.opcode, v),
            None => write!(f, "{:#x} {}", self.pc, self.opcode),
        }
    }
}

/// A maximal straight-line run of EVM operations, spanning the half-open
/// byte range `[entry, exit]`. PUSH immediates belong to the span of the
/// block containing the PUSH.
#[derive(Debug, Clone)]
pub struct EVMBasicBlock {
    pub entry: usize,
    pub exit: usize,
    pub evm_ops: Vec<EVMOp>,
}

/// Parse a hexadecimal string of EVM bytecode into operations.
///
/// Whitespace anywhere in the input and an optional `0x` prefix are
/// accepted. With `strict` set, unrecognised bytes and truncated PUSH
/// immediates are errors; otherwise the former decode to MISSING and the
/// latter are zero-padded on the right.
pub fn parse_bytecode(src: &str, strict: bool) -> Result<Vec<EVMOp>> {
    let joined: String = src.split_whitespace().collect();
    let stripped = joined.strip_prefix("0x").unwrap_or(&joined);
    let bytes = alloy::hex::decode(stripped).map_err(|e| DecompileError::BadHex(e.to_string()))?;
    ops_from_bytes(&bytes, strict)
}

fn ops_from_bytes(bytes: &[u8], strict: bool) -> Result<Vec<EVMOp>> {
    let mut ops = Vec::new();
    let mut pc = 0;

    while pc < bytes.len() {
        let byte = bytes[pc];
        match OpCode::from_byte(byte) {
            Some(opcode) if opcode.is_push() => {
                let len = opcode.push_len();
                let end = pc + 1 + len;
                if end > bytes.len() && strict {
                    return Err(DecompileError::TruncatedPush { pc });
                }
                let avail = &bytes[(pc + 1).min(bytes.len())..end.min(bytes.len())];
                let mut imm = [0u8; 32];
                imm[32 - len..32 - len + avail.len()].copy_from_slice(avail);
                ops.push(EVMOp::new(pc, opcode, Some(U256::from_be_bytes(imm))));
                pc = end;
            }
            Some(opcode) => {
                ops.push(EVMOp::new(pc, opcode, None));
                pc += 1;
            }
            None => {
                if strict {
                    return Err(DecompileError::UnknownOpcode { byte, pc });
                }
                debug!(byte, pc, "skipping unrecognised opcode");
                ops.push(EVMOp::new(pc, OpCode::MISSING, Some(U256::from(byte))));
                pc += 1;
            }
        }
    }

    Ok(ops)
}

/// Parse disassembly lines of the form `PC OPCODE [=> 0xIMMEDIATE]` with
/// flexible whitespace. Blank lines are ignored.
pub fn parse_dasm<'a, I: IntoIterator<Item = &'a str>>(lines: I, strict: bool) -> Result<Vec<EVMOp>> {
    let mut ops = Vec::new();

    for (lineno, line) in lines.into_iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();

        let pc_field = fields.next().unwrap_or_default();
        let pc = parse_int(pc_field).ok_or_else(|| DecompileError::BadDasmLine {
            line: lineno + 1,
            reason: format!("bad program counter {pc_field:?}"),
        })?;

        let name = fields.next().ok_or_else(|| DecompileError::BadDasmLine {
            line: lineno + 1,
            reason: "missing opcode".to_string(),
        })?;

        let opcode = match OpCode::from_name(name) {
            Some(op) => op,
            None if strict => return Err(DecompileError::UnknownMnemonic(name.to_string())),
            None => {
                debug!(name, line = lineno + 1, "skipping unrecognised mnemonic");
                OpCode::MISSING
            }
        };

        let value = match fields.next() {
            Some("=>") => {
                let imm = fields.next().ok_or_else(|| DecompileError::BadDasmLine {
                    line: lineno + 1,
                    reason: "missing immediate after =>".to_string(),
                })?;
                let imm = imm.strip_prefix("0x").unwrap_or(imm);
                Some(U256::from_str_radix(imm, 16).map_err(|e| DecompileError::BadDasmLine {
                    line: lineno + 1,
                    reason: e.to_string(),
                })?)
            }
            _ => None,
        };

        ops.push(EVMOp::new(pc, opcode, value));
    }

    Ok(ops)
}

fn parse_int(field: &str) -> Option<usize> {
    match field.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

/// Group a stream of operations into basic blocks: a JUMPDEST opens a new
/// block, and jumps and halting operations close the current one. Every pc
/// between zero and the final operation lands in exactly one block.
pub fn blocks_from_ops<I: IntoIterator<Item = EVMOp>>(ops: I) -> Vec<EVMBasicBlock> {
    let mut blocks = Vec::new();
    let mut current: Vec<EVMOp> = Vec::new();

    for op in ops {
        if op.opcode == OpCode::JUMPDEST && !current.is_empty() {
            blocks.push(seal_block(std::mem::take(&mut current)));
        }
        let closes = op.opcode.alters_flow();
        current.push(op);
        if closes {
            blocks.push(seal_block(std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        blocks.push(seal_block(current));
    }

    blocks
}

fn seal_block(ops: Vec<EVMOp>) -> EVMBasicBlock {
    let entry = ops.first().map(|op| op.pc).unwrap_or_default();
    let exit = ops
        .last()
        .map(|op| op.pc + op.opcode.push_len())
        .unwrap_or_default();
    EVMBasicBlock { entry, exit, evm_ops: ops }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_push_immediates() {
        let ops = parse_bytecode("6003565b00", false).unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].opcode.name, "PUSH1");
        assert_eq!(ops[0].value, Some(U256::from(3)));
        assert_eq!(ops[1], EVMOp::new(2, OpCode::JUMP, None));
        assert_eq!(ops[2], EVMOp::new(3, OpCode::JUMPDEST, None));
        assert_eq!(ops[3], EVMOp::new(4, OpCode::STOP, None));
    }

    #[test]
    fn accepts_prefix_and_whitespace() {
        let ops = parse_bytecode("0x60 03\n56", false).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].opcode, OpCode::JUMP);
    }

    #[test]
    fn truncated_push_is_zero_padded() {
        let ops = parse_bytecode("61aa", false).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].value, Some(U256::from(0xaa00)));

        assert!(matches!(
            parse_bytecode("61aa", true),
            Err(DecompileError::TruncatedPush { pc: 0 })
        ));
    }

    #[test]
    fn unknown_bytes_become_missing() {
        let ops = parse_bytecode("0c00", false).unwrap();
        assert_eq!(ops[0].opcode, OpCode::MISSING);
        assert_eq!(ops[0].value, Some(U256::from(0x0c)));
        assert_eq!(ops[1].opcode, OpCode::STOP);

        assert!(matches!(
            parse_bytecode("0c00", true),
            Err(DecompileError::UnknownOpcode { byte: 0x0c, pc: 0 })
        ));
    }

    #[test]
    fn parses_dasm_lines() {
        let lines = ["0 PUSH1 => 0x60", "", "  2   JUMP  ", "3 JUMPDEST"];
        let ops = parse_dasm(lines, false).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].value, Some(U256::from(0x60)));
        assert_eq!(ops[1].opcode, OpCode::JUMP);
        assert_eq!(ops[2].pc, 3);
    }

    #[test]
    fn block_boundaries() {
        // PUSH1 3; JUMP | JUMPDEST; STOP
        let ops = parse_bytecode("6003565b00", false).unwrap();
        let blocks = blocks_from_ops(ops);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].entry, blocks[0].exit), (0, 2));
        assert_eq!((blocks[1].entry, blocks[1].exit), (3, 4));
    }

    #[test]
    fn push_immediate_extends_block_span() {
        // PUSH3 0xaabbcc; STOP
        let ops = parse_bytecode("62aabbcc00", false).unwrap();
        let blocks = blocks_from_ops(ops);
        assert_eq!(blocks.len(), 1);
        assert_eq!((blocks[0].entry, blocks[0].exit), (0, 4));
    }

    #[test]
    fn jumpdest_opens_a_block() {
        // JUMPDEST; JUMPDEST; STOP
        let ops = parse_bytecode("5b5b00", false).unwrap();
        let blocks = blocks_from_ops(ops);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].entry, blocks[0].exit), (0, 0));
        assert_eq!((blocks[1].entry, blocks[1].exit), (1, 2));
    }
}
