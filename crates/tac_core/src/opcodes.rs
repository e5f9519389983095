//! The EVM instruction set, plus the synthetic codes used by three-address
//! form (CONST, NOP, the generic LOG, THROW/THROWI and MISSING).

use std::fmt;

/// An EVM operation: its mnemonic, byte value, and the number of stack items
/// it pops and pushes.
///
/// Synthetic three-address codes carry negative byte values, so they can
/// never collide with anything decoded from a bytecode stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpCode {
    pub name: &'static str,
    pub code: i16,
    pub pop: usize,
    pub push: usize,
}

static PUSH_NAMES: [&str; 32] = [
    "PUSH1", "PUSH2", "PUSH3", "PUSH4", "PUSH5", "PUSH6", "PUSH7", "PUSH8", "PUSH9", "PUSH10",
    "PUSH11", "PUSH12", "PUSH13", "PUSH14", "PUSH15", "PUSH16", "PUSH17", "PUSH18", "PUSH19",
    "PUSH20", "PUSH21", "PUSH22", "PUSH23", "PUSH24", "PUSH25", "PUSH26", "PUSH27", "PUSH28",
    "PUSH29", "PUSH30", "PUSH31", "PUSH32",
];

static DUP_NAMES: [&str; 16] = [
    "DUP1", "DUP2", "DUP3", "DUP4", "DUP5", "DUP6", "DUP7", "DUP8", "DUP9", "DUP10", "DUP11",
    "DUP12", "DUP13", "DUP14", "DUP15", "DUP16",
];

static SWAP_NAMES: [&str; 16] = [
    "SWAP1", "SWAP2", "SWAP3", "SWAP4", "SWAP5", "SWAP6", "SWAP7", "SWAP8", "SWAP9", "SWAP10",
    "SWAP11", "SWAP12", "SWAP13", "SWAP14", "SWAP15", "SWAP16",
];

static LOG_NAMES: [&str; 5] = ["LOG0", "LOG1", "LOG2", "LOG3", "LOG4"];

impl OpCode {
    const fn new(name: &'static str, code: i16, pop: usize, push: usize) -> Self {
        OpCode { name, code, pop, push }
    }

    pub const STOP: OpCode = OpCode::new("STOP", 0x00, 0, 0);
    pub const ADD: OpCode = OpCode::new("ADD", 0x01, 2, 1);
    pub const MUL: OpCode = OpCode::new("MUL", 0x02, 2, 1);
    pub const SUB: OpCode = OpCode::new("SUB", 0x03, 2, 1);
    pub const DIV: OpCode = OpCode::new("DIV", 0x04, 2, 1);
    pub const SDIV: OpCode = OpCode::new("SDIV", 0x05, 2, 1);
    pub const MOD: OpCode = OpCode::new("MOD", 0x06, 2, 1);
    pub const SMOD: OpCode = OpCode::new("SMOD", 0x07, 2, 1);
    pub const ADDMOD: OpCode = OpCode::new("ADDMOD", 0x08, 3, 1);
    pub const MULMOD: OpCode = OpCode::new("MULMOD", 0x09, 3, 1);
    pub const EXP: OpCode = OpCode::new("EXP", 0x0a, 2, 1);
    pub const SIGNEXTEND: OpCode = OpCode::new("SIGNEXTEND", 0x0b, 2, 1);

    pub const LT: OpCode = OpCode::new("LT", 0x10, 2, 1);
    pub const GT: OpCode = OpCode::new("GT", 0x11, 2, 1);
    pub const SLT: OpCode = OpCode::new("SLT", 0x12, 2, 1);
    pub const SGT: OpCode = OpCode::new("SGT", 0x13, 2, 1);
    pub const EQ: OpCode = OpCode::new("EQ", 0x14, 2, 1);
    pub const ISZERO: OpCode = OpCode::new("ISZERO", 0x15, 1, 1);
    pub const AND: OpCode = OpCode::new("AND", 0x16, 2, 1);
    pub const OR: OpCode = OpCode::new("OR", 0x17, 2, 1);
    pub const XOR: OpCode = OpCode::new("XOR", 0x18, 2, 1);
    pub const NOT: OpCode = OpCode::new("NOT", 0x19, 1, 1);
    pub const BYTE: OpCode = OpCode::new("BYTE", 0x1a, 2, 1);
    pub const SHL: OpCode = OpCode::new("SHL", 0x1b, 2, 1);
    pub const SHR: OpCode = OpCode::new("SHR", 0x1c, 2, 1);
    pub const SAR: OpCode = OpCode::new("SAR", 0x1d, 2, 1);

    pub const SHA3: OpCode = OpCode::new("SHA3", 0x20, 2, 1);

    pub const ADDRESS: OpCode = OpCode::new("ADDRESS", 0x30, 0, 1);
    pub const BALANCE: OpCode = OpCode::new("BALANCE", 0x31, 1, 1);
    pub const ORIGIN: OpCode = OpCode::new("ORIGIN", 0x32, 0, 1);
    pub const CALLER: OpCode = OpCode::new("CALLER", 0x33, 0, 1);
    pub const CALLVALUE: OpCode = OpCode::new("CALLVALUE", 0x34, 0, 1);
    pub const CALLDATALOAD: OpCode = OpCode::new("CALLDATALOAD", 0x35, 1, 1);
    pub const CALLDATASIZE: OpCode = OpCode::new("CALLDATASIZE", 0x36, 0, 1);
    pub const CALLDATACOPY: OpCode = OpCode::new("CALLDATACOPY", 0x37, 3, 0);
    pub const CODESIZE: OpCode = OpCode::new("CODESIZE", 0x38, 0, 1);
    pub const CODECOPY: OpCode = OpCode::new("CODECOPY", 0x39, 3, 0);
    pub const GASPRICE: OpCode = OpCode::new("GASPRICE", 0x3a, 0, 1);
    pub const EXTCODESIZE: OpCode = OpCode::new("EXTCODESIZE", 0x3b, 1, 1);
    pub const EXTCODECOPY: OpCode = OpCode::new("EXTCODECOPY", 0x3c, 4, 0);
    pub const RETURNDATASIZE: OpCode = OpCode::new("RETURNDATASIZE", 0x3d, 0, 1);
    pub const RETURNDATACOPY: OpCode = OpCode::new("RETURNDATACOPY", 0x3e, 3, 0);
    pub const EXTCODEHASH: OpCode = OpCode::new("EXTCODEHASH", 0x3f, 1, 1);

    pub const BLOCKHASH: OpCode = OpCode::new("BLOCKHASH", 0x40, 1, 1);
    pub const COINBASE: OpCode = OpCode::new("COINBASE", 0x41, 0, 1);
    pub const TIMESTAMP: OpCode = OpCode::new("TIMESTAMP", 0x42, 0, 1);
    pub const NUMBER: OpCode = OpCode::new("NUMBER", 0x43, 0, 1);
    pub const DIFFICULTY: OpCode = OpCode::new("DIFFICULTY", 0x44, 0, 1);
    pub const GASLIMIT: OpCode = OpCode::new("GASLIMIT", 0x45, 0, 1);
    pub const CHAINID: OpCode = OpCode::new("CHAINID", 0x46, 0, 1);
    pub const SELFBALANCE: OpCode = OpCode::new("SELFBALANCE", 0x47, 0, 1);
    pub const BASEFEE: OpCode = OpCode::new("BASEFEE", 0x48, 0, 1);

    pub const POP: OpCode = OpCode::new("POP", 0x50, 1, 0);
    pub const MLOAD: OpCode = OpCode::new("MLOAD", 0x51, 1, 1);
    pub const MSTORE: OpCode = OpCode::new("MSTORE", 0x52, 2, 0);
    pub const MSTORE8: OpCode = OpCode::new("MSTORE8", 0x53, 2, 0);
    pub const SLOAD: OpCode = OpCode::new("SLOAD", 0x54, 1, 1);
    pub const SSTORE: OpCode = OpCode::new("SSTORE", 0x55, 2, 0);
    pub const JUMP: OpCode = OpCode::new("JUMP", 0x56, 1, 0);
    pub const JUMPI: OpCode = OpCode::new("JUMPI", 0x57, 2, 0);
    pub const PC: OpCode = OpCode::new("PC", 0x58, 0, 1);
    pub const MSIZE: OpCode = OpCode::new("MSIZE", 0x59, 0, 1);
    pub const GAS: OpCode = OpCode::new("GAS", 0x5a, 0, 1);
    pub const JUMPDEST: OpCode = OpCode::new("JUMPDEST", 0x5b, 0, 0);

    pub const CREATE: OpCode = OpCode::new("CREATE", 0xf0, 3, 1);
    pub const CALL: OpCode = OpCode::new("CALL", 0xf1, 7, 1);
    pub const CALLCODE: OpCode = OpCode::new("CALLCODE", 0xf2, 7, 1);
    pub const RETURN: OpCode = OpCode::new("RETURN", 0xf3, 2, 0);
    pub const DELEGATECALL: OpCode = OpCode::new("DELEGATECALL", 0xf4, 6, 1);
    pub const CREATE2: OpCode = OpCode::new("CREATE2", 0xf5, 4, 1);
    pub const STATICCALL: OpCode = OpCode::new("STATICCALL", 0xfa, 6, 1);
    pub const REVERT: OpCode = OpCode::new("REVERT", 0xfd, 2, 0);
    pub const INVALID: OpCode = OpCode::new("INVALID", 0xfe, 0, 0);
    pub const SELFDESTRUCT: OpCode = OpCode::new("SELFDESTRUCT", 0xff, 1, 0);

    // Synthetic three-address codes.
    pub const CONST: OpCode = OpCode::new("CONST", -1, 0, 0);
    pub const NOP: OpCode = OpCode::new("NOP", -2, 0, 0);
    pub const LOG: OpCode = OpCode::new("LOG", -3, 0, 0);
    pub const THROW: OpCode = OpCode::new("THROW", -4, 0, 0);
    pub const THROWI: OpCode = OpCode::new("THROWI", -5, 1, 0);
    pub const MISSING: OpCode = OpCode::new("MISSING", -6, 0, 0);

    const FIXED: [OpCode; 74] = [
        Self::STOP, Self::ADD, Self::MUL, Self::SUB, Self::DIV, Self::SDIV, Self::MOD,
        Self::SMOD, Self::ADDMOD, Self::MULMOD, Self::EXP, Self::SIGNEXTEND, Self::LT, Self::GT,
        Self::SLT, Self::SGT, Self::EQ, Self::ISZERO, Self::AND, Self::OR, Self::XOR, Self::NOT,
        Self::BYTE, Self::SHL, Self::SHR, Self::SAR, Self::SHA3, Self::ADDRESS, Self::BALANCE,
        Self::ORIGIN, Self::CALLER, Self::CALLVALUE, Self::CALLDATALOAD, Self::CALLDATASIZE,
        Self::CALLDATACOPY, Self::CODESIZE, Self::CODECOPY, Self::GASPRICE, Self::EXTCODESIZE,
        Self::EXTCODECOPY, Self::RETURNDATASIZE, Self::RETURNDATACOPY, Self::EXTCODEHASH,
        Self::BLOCKHASH, Self::COINBASE, Self::TIMESTAMP, Self::NUMBER, Self::DIFFICULTY,
        Self::GASLIMIT, Self::CHAINID, Self::SELFBALANCE, Self::BASEFEE, Self::POP, Self::MLOAD,
        Self::MSTORE, Self::MSTORE8, Self::SLOAD, Self::SSTORE, Self::JUMP, Self::JUMPI,
        Self::PC, Self::MSIZE, Self::GAS, Self::JUMPDEST, Self::CREATE, Self::CALL,
        Self::CALLCODE, Self::RETURN, Self::DELEGATECALL, Self::CREATE2, Self::STATICCALL,
        Self::REVERT, Self::INVALID, Self::SELFDESTRUCT,
    ];

    /// PUSHn for 1 <= n <= 32.
    pub fn push_op(n: usize) -> OpCode {
        OpCode::new(PUSH_NAMES[n - 1], 0x5f + n as i16, 0, 1)
    }

    /// DUPn for 1 <= n <= 16.
    pub fn dup_op(n: usize) -> OpCode {
        OpCode::new(DUP_NAMES[n - 1], 0x7f + n as i16, n, n + 1)
    }

    /// SWAPn for 1 <= n <= 16.
    pub fn swap_op(n: usize) -> OpCode {
        OpCode::new(SWAP_NAMES[n - 1], 0x8f + n as i16, n + 1, n + 1)
    }

    /// LOGn for 0 <= n <= 4.
    pub fn log_op(n: usize) -> OpCode {
        OpCode::new(LOG_NAMES[n], 0xa0 + n as i16, n + 2, 0)
    }

    /// Decode a bytecode byte into an operation, if it is one.
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        match byte {
            0x60..=0x7f => Some(Self::push_op(byte as usize - 0x5f)),
            0x80..=0x8f => Some(Self::dup_op(byte as usize - 0x7f)),
            0x90..=0x9f => Some(Self::swap_op(byte as usize - 0x8f)),
            0xa0..=0xa4 => Some(Self::log_op(byte as usize - 0xa0)),
            _ => Self::FIXED.iter().find(|op| op.code == byte as i16).copied(),
        }
    }

    /// Look an operation up by its mnemonic, as found in disassembly.
    pub fn from_name(name: &str) -> Option<OpCode> {
        Self::FIXED
            .iter()
            .find(|op| op.name == name)
            .copied()
            .or_else(|| PUSH_NAMES.iter().position(|n| *n == name).map(|i| Self::push_op(i + 1)))
            .or_else(|| DUP_NAMES.iter().position(|n| *n == name).map(|i| Self::dup_op(i + 1)))
            .or_else(|| SWAP_NAMES.iter().position(|n| *n == name).map(|i| Self::swap_op(i + 1)))
            .or_else(|| LOG_NAMES.iter().position(|n| *n == name).map(Self::log_op))
            .or_else(|| {
                [Self::CONST, Self::NOP, Self::LOG, Self::THROW, Self::THROWI, Self::MISSING]
                    .into_iter()
                    .find(|op| op.name == name)
            })
    }

    pub fn is_push(&self) -> bool {
        (0x60..=0x7f).contains(&self.code)
    }

    /// The width in bytes of this operation's immediate; zero for non-PUSH.
    pub fn push_len(&self) -> usize {
        if self.is_push() { (self.code - 0x5f) as usize } else { 0 }
    }

    pub fn is_dup(&self) -> bool {
        (0x80..=0x8f).contains(&self.code)
    }

    pub fn is_swap(&self) -> bool {
        (0x90..=0x9f).contains(&self.code)
    }

    pub fn is_log(&self) -> bool {
        (0xa0..=0xa4).contains(&self.code)
    }

    /// The number of topics of a LOGn operation.
    pub fn log_len(&self) -> usize {
        if self.is_log() { (self.code - 0xa0) as usize } else { 0 }
    }

    pub fn is_missing(&self) -> bool {
        *self == Self::MISSING
    }

    /// True for the operations whose semantics are defined on symbolic
    /// variables: arithmetic, comparison and bitwise codes.
    pub fn is_arithmetic(&self) -> bool {
        (0x01..=0x0b).contains(&self.code) || (0x10..=0x1d).contains(&self.code)
    }

    pub fn is_memory(&self) -> bool {
        matches!(*self, Self::MLOAD | Self::MSTORE | Self::MSTORE8)
    }

    pub fn is_storage(&self) -> bool {
        matches!(*self, Self::SLOAD | Self::SSTORE)
    }

    /// True iff execution never continues past this operation.
    pub fn halts(&self) -> bool {
        matches!(
            *self,
            Self::STOP | Self::RETURN | Self::REVERT | Self::INVALID | Self::SELFDESTRUCT
                | Self::THROW
        )
    }

    /// True iff execution might not continue past this operation.
    pub fn possibly_halts(&self) -> bool {
        self.halts() || *self == Self::THROWI
    }

    /// True iff this operation ends a basic block.
    pub fn alters_flow(&self) -> bool {
        matches!(*self, Self::JUMP | Self::JUMPI) || self.halts()
    }

    /// The net effect of this operation on the stack depth.
    pub fn stack_delta(&self) -> isize {
        self.push as isize - self.pop as isize
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
