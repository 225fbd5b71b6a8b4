//! A global store of flags that tune the recovery heuristics.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different recovery executions in the same process). Knobs
//! that legitimately differ per function live in
//! [`RecoveryOptions`](crate::recovery::RecoveryOptions) instead.

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct RecoveryConfig {
    /// Relate the types of the two operands of a comparison. For example, an observation of the
    /// comparison `a < b` yields the constraint `a <: b`.
    pub relate_operand_types_on_comparison: bool,
    /// When the address of a stack variable is put into a register, link the register's pointee
    /// type to the variable (`reg.load <: var` and `var <: reg.store`).
    pub link_address_taken_locals: bool,
    /// Give loaded values the derived type `addr.load.σN@k`, so that whatever they are assigned to
    /// gets related to the memory they came from.
    pub type_loaded_values: bool,
    /// When a call site has no known stack delta, assume the callee pops the return address, as
    /// is the case on architectures that push it on call.
    pub guess_stack_delta_for_unknown_calls: bool,
    /// For loads through pointers, take the field offset from pointer arithmetic (`+N`) on the
    /// address's type.
    pub derive_pointer_offsets_from_addn: bool,
    /// Whether to dump each block's output state at trace level (useful when debugging)
    pub trace_states_after_each_block: bool,
}

impl RecoveryConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        // Reading `CONFIG` without `initialize` (e.g., from tests) falls back to defaults.
        let init = unsafe { INTERNAL_CONFIG_INITIALIZER.take() };
        init.flatten().unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineRecoveryConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<RecoveryConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: RecoveryConfig = RecoveryConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Recovery configuration parameters
pub enum CommandLineRecoveryConfig {
    DisableComparisonOperandRelation,
    DisableAddressTakenLocalLinking,
    DisableLoadedValueTyping,
    DisableStackDeltaGuessForUnknownCalls,
    DisablePointerOffsetsFromAddN,
    EnableTraceStatesAfterEachBlock,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            relate_operand_types_on_comparison: true,
            link_address_taken_locals: true,
            type_loaded_values: true,
            guess_stack_delta_for_unknown_calls: true,
            derive_pointer_offsets_from_addn: true,
            trace_states_after_each_block: false,
        }
    }
}

impl From<Vec<CommandLineRecoveryConfig>> for RecoveryConfig {
    fn from(v: Vec<CommandLineRecoveryConfig>) -> Self {
        use CommandLineRecoveryConfig::*;
        let mut r = RecoveryConfig::default();
        for v in v {
            match v {
                DisableComparisonOperandRelation => {
                    r.relate_operand_types_on_comparison = false;
                }
                DisableAddressTakenLocalLinking => {
                    r.link_address_taken_locals = false;
                }
                DisableLoadedValueTyping => {
                    r.type_loaded_values = false;
                }
                DisableStackDeltaGuessForUnknownCalls => {
                    r.guess_stack_delta_for_unknown_calls = false;
                }
                DisablePointerOffsetsFromAddN => {
                    r.derive_pointer_offsets_from_addn = false;
                }
                EnableTraceStatesAfterEachBlock => {
                    r.trace_states_after_each_block = true;
                }
            }
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_flags_override_defaults() {
        let c: RecoveryConfig = vec![
            CommandLineRecoveryConfig::DisableLoadedValueTyping,
            CommandLineRecoveryConfig::EnableTraceStatesAfterEachBlock,
        ]
        .into();
        assert!(!c.type_loaded_values);
        assert!(c.trace_states_after_each_block);
        assert!(c.relate_operand_types_on_comparison);
    }
}
