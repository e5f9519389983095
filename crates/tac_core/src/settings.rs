//! Dataflow analysis settings.
//!
//! Defaults can be overridden from a TOML config file or from
//! `name=value` strings supplied on the command line. A small LIFO stack
//! supports temporary overrides: the driver saves before forcing flags for
//! a phase and restores afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{DecompileError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The maximum number of graph analysis iterations. Lower is faster but
    /// potentially less precise. Negative means no limit.
    pub max_iterations: i64,

    /// Begin to terminate the analysis loop if it looks to take more time
    /// than this. Not a hard cap; at least one iteration always runs and
    /// the finalisation steps still follow. Negative means no cap.
    pub bailout_seconds: i64,

    /// After analysis, delete blocks unreachable from the contract root.
    pub remove_unreachable: bool,

    /// After analysis, merge contiguous runs of unreachable blocks.
    pub merge_unreachable: bool,

    /// Raise an error if an empty stack is popped.
    pub die_on_empty_pop: bool,

    /// Do not update exit stacks after a symbolic overflow in their block.
    pub skip_stack_on_overflow: bool,

    /// Reinitialise every block's stacks at the start of each stack
    /// analysis.
    pub reinit_stacks: bool,

    /// Propagate entry stack values into block bodies.
    pub hook_up_stack_vars: bool,

    /// Connect edges inferable from resolved jump destinations.
    pub hook_up_jumps: bool,

    /// Rewrite JUMPIs whose condition is decided: known-true becomes JUMP,
    /// known-false is deleted.
    pub mutate_jumps: bool,

    /// Rewrite JUMP/JUMPI with no valid destination to THROW/THROWI.
    pub generate_throws: bool,

    /// Value taken by `mutate_jumps` during the finalisation phase.
    pub final_mutate_jumps: bool,

    /// Value taken by `generate_throws` during the finalisation phase.
    pub final_generate_throws: bool,

    /// Apply stack-var hookup and jump inference after each block, rather
    /// than only globally after the analysis sweep.
    pub mutate_blockwise: bool,

    /// Freeze per-block stack depths if stacks keep growing without the
    /// graph structure changing.
    pub clamp_large_stacks: bool,

    /// Stacks are never clamped smaller than this.
    pub clamp_stack_minimum: i64,

    /// Widen a variable's value set to Top once it exceeds the threshold.
    pub widen_variables: bool,

    /// The value-set size at which widening kicks in.
    pub widen_threshold: i64,

    /// Fold arithmetic over multi-valued but constrained arguments, not
    /// only over constants. Slower, more precise.
    pub set_valued_ops: bool,

    /// Collect statistics about the analysis into the results.
    pub analytics: bool,

    /// Attempt to extract solidity functions after analysis.
    pub extract_functions: bool,

    /// Tag block identifiers with the functions they belong to.
    pub mark_functions: bool,

    /// Fail on unrecognised opcodes and invalid disassembly rather than
    /// skipping them.
    pub strict: bool,

    #[serde(skip)]
    saved: Vec<Settings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_iterations: -1,
            bailout_seconds: -1,
            remove_unreachable: false,
            merge_unreachable: true,
            die_on_empty_pop: false,
            skip_stack_on_overflow: true,
            reinit_stacks: true,
            hook_up_stack_vars: true,
            hook_up_jumps: true,
            mutate_jumps: false,
            generate_throws: false,
            final_mutate_jumps: false,
            final_generate_throws: true,
            mutate_blockwise: true,
            clamp_large_stacks: true,
            clamp_stack_minimum: 20,
            widen_variables: true,
            widen_threshold: 10,
            set_valued_ops: true,
            analytics: false,
            extract_functions: false,
            mark_functions: false,
            strict: false,
            saved: Vec::new(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML, with absent keys taking their defaults.
    pub fn from_toml(src: &str) -> Result<Settings> {
        toml::from_str(src).map_err(|e| DecompileError::BadConfig(e.to_string()))
    }

    /// Push the current configuration onto the save stack.
    pub fn save(&mut self) {
        let mut snapshot = self.clone();
        snapshot.saved = Vec::new();
        self.saved.push(snapshot);
    }

    /// Restore the configuration from the top of the save stack.
    pub fn restore(&mut self) {
        if let Some(snapshot) = self.saved.pop() {
            let saved = std::mem::take(&mut self.saved);
            *self = snapshot;
            self.saved = saved;
        }
    }

    /// Assign the named setting from a string value. Booleans accept
    /// 1/yes/true/on and 0/no/false/off, case-insensitively.
    pub fn set_from_str(&mut self, name: &str, value: &str) -> Result<()> {
        let name = name.to_lowercase();
        let value = value.to_lowercase();

        let as_bool = |value: &str| match value {
            "1" | "yes" | "true" | "on" => Ok(true),
            "0" | "no" | "false" | "off" => Ok(false),
            _ => Err(DecompileError::BadSettingValue {
                name: name.clone(),
                value: value.to_string(),
                kind: "boolean",
            }),
        };
        let as_int = |value: &str| {
            value
                .parse::<i64>()
                .map_err(|_| DecompileError::BadSettingValue {
                    name: name.clone(),
                    value: value.to_string(),
                    kind: "integer",
                })
        };

        match name.as_str() {
            "max_iterations" => self.max_iterations = as_int(&value)?,
            "bailout_seconds" => self.bailout_seconds = as_int(&value)?,
            "remove_unreachable" => self.remove_unreachable = as_bool(&value)?,
            "merge_unreachable" => self.merge_unreachable = as_bool(&value)?,
            "die_on_empty_pop" => self.die_on_empty_pop = as_bool(&value)?,
            "skip_stack_on_overflow" => self.skip_stack_on_overflow = as_bool(&value)?,
            "reinit_stacks" => self.reinit_stacks = as_bool(&value)?,
            "hook_up_stack_vars" => self.hook_up_stack_vars = as_bool(&value)?,
            "hook_up_jumps" => self.hook_up_jumps = as_bool(&value)?,
            "mutate_jumps" => self.mutate_jumps = as_bool(&value)?,
            "generate_throws" => self.generate_throws = as_bool(&value)?,
            "final_mutate_jumps" => self.final_mutate_jumps = as_bool(&value)?,
            "final_generate_throws" => self.final_generate_throws = as_bool(&value)?,
            "mutate_blockwise" => self.mutate_blockwise = as_bool(&value)?,
            "clamp_large_stacks" => self.clamp_large_stacks = as_bool(&value)?,
            "clamp_stack_minimum" => self.clamp_stack_minimum = as_int(&value)?,
            "widen_variables" => self.widen_variables = as_bool(&value)?,
            "widen_threshold" => self.widen_threshold = as_int(&value)?,
            "set_valued_ops" => self.set_valued_ops = as_bool(&value)?,
            "analytics" => self.analytics = as_bool(&value)?,
            "extract_functions" => self.extract_functions = as_bool(&value)?,
            "mark_functions" => self.mark_functions = as_bool(&value)?,
            "strict" => self.strict = as_bool(&value)?,
            _ => return Err(DecompileError::UnknownSetting(name.clone())),
        }
        Ok(())
    }
}
