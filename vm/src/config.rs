/// Profiling ticks a function must accumulate before the optimizing
/// pipeline is attempted.
pub const DEFAULT_COMPILE_THRESHOLD: u32 = 1000;

/// VM behavior switches, mostly diagnostic output.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Disassemble every bytecode unit after compilation.
    pub print_bytecode: bool,
    /// Print the IR graph whenever the optimizing pipeline runs.
    pub print_graph: bool,
    /// Print the generated structured instruction stream.
    pub print_code: bool,
    pub compile_threshold: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            print_bytecode: false,
            print_graph: false,
            print_code: false,
            compile_threshold: DEFAULT_COMPILE_THRESHOLD,
        }
    }
}
