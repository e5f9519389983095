use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecompileError>;

#[derive(Debug, Error)]
pub enum DecompileError {
    #[error("invalid hex in bytecode: {0}")]
    BadHex(String),

    #[error("unrecognised opcode {byte:#04x} at pc {pc:#x}")]
    UnknownOpcode { byte: u8, pc: usize },

    #[error("truncated PUSH immediate at pc {pc:#x}")]
    TruncatedPush { pc: usize },

    #[error("unrecognised opcode mnemonic {0:?}")]
    UnknownMnemonic(String),

    #[error("malformed disassembly on line {line}: {reason}")]
    BadDasmLine { line: usize, reason: String },

    #[error("popped empty stack in {0}")]
    EmptyPop(String),

    #[error("attempted to merge unmergeable blocks {0} and {1}")]
    Unmergeable(String, String),

    #[error("unrecognised setting {0:?}")]
    UnknownSetting(String),

    #[error("cannot interpret {value:?} as {kind} for setting {name:?}")]
    BadSettingValue {
        name: String,
        value: String,
        kind: &'static str,
    },

    #[error("failed to parse config: {0}")]
    BadConfig(String),
}
