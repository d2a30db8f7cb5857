//! The execution engine: bytecode compiler, profiling interpreter
//! (Tier 0), and the optimizing pipeline (Tier 1) that lowers hot
//! functions to a directly executable structured instruction stream.
//!
//! [`VM::run_source`] is the front door: parse, compile every function to
//! bytecode, then interpret the synthetic top-level function. Functions
//! that get hot tier up transparently; compilation failures are silent
//! and the function simply stays interpreted.

pub mod compiler;
pub mod config;
pub mod ffi;
pub mod function;
pub mod interpreter;
pub mod jit;
pub mod memory;

use std::collections::HashMap;

use bytecode::BytecodeDecoder;

use crate::compiler::CompileError;
use crate::config::VmConfig;
use crate::ffi::ForeignRegistry;
use crate::function::{FunctionId, FunctionMeta, Functions};
use crate::interpreter::RuntimeError;
use crate::memory::Memory;
use parser::ParseError;

/// Anything that can abort a run, with a `Display` suitable for the CLI.
#[derive(Debug)]
pub enum VmError {
    Parse(ParseError),
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "{e}"),
            Self::Compile(e) => write!(f, "{e}"),
            Self::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<ParseError> for VmError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<CompileError> for VmError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<RuntimeError> for VmError {
    fn from(e: RuntimeError) -> Self {
        Self::Runtime(e)
    }
}

/// The VM owns the function arena, the linear memory both tiers execute
/// against, and the configuration. Foreign bindings are registered once
/// at construction.
pub struct VM {
    pub functions: Functions,
    pub memory: Memory,
    pub config: VmConfig,
    foreign: HashMap<String, FunctionId>,
    pub(crate) call_depth: usize,
}

impl VM {
    pub fn new(config: VmConfig, registry: &ForeignRegistry) -> Self {
        let mut functions = Functions::new();
        let mut foreign = HashMap::new();
        for (name, binding) in registry.iter() {
            let id = functions.add(FunctionMeta::new_foreign(
                name.to_string(),
                binding.parameter_count,
                binding.callback.clone(),
            ));
            foreign.insert(name.to_string(), id);
        }
        Self {
            functions,
            memory: Memory::default(),
            config,
            foreign,
            call_depth: 0,
        }
    }

    /// Parse, compile, and execute a program. Returns the top-level
    /// function's result.
    pub fn run_source(&mut self, source: &str) -> Result<f64, VmError> {
        let program = parser::parse(source)?;
        let top = compiler::compile_program(
            &program,
            &self.foreign,
            &mut self.functions,
        )?;
        if self.config.print_bytecode {
            self.dump_bytecode();
        }

        let stack_start = self.memory.stack_start();
        // Frame-base sentinel for the outermost frame.
        self.memory.write_slot(stack_start, -1.0);
        Ok(interpreter::execute(self, top, stack_start)?)
    }

    /// Disassemble every bytecode unit to stdout.
    pub fn dump_bytecode(&self) {
        for (_, meta) in self.functions.iter() {
            let Some(unit) = meta.bytecode() else { continue };
            println!(">>> Bytecode for \"{}\".", meta.name);
            for (offset, instruction) in BytecodeDecoder::new(&unit.code) {
                println!("    {offset:<5} {instruction}");
            }
            if !unit.constants.is_empty() {
                let pool: Vec<String> = unit
                    .constants
                    .iter()
                    .enumerate()
                    .map(|(i, id)| {
                        format!("[{i}] {}", self.functions.get(*id).name)
                    })
                    .collect();
                println!("    constants: {}", pool.join(", "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Test harness: a `print` foreign binding that appends to a shared
    /// buffer.
    pub(crate) struct TestOutput(pub Rc<RefCell<String>>);

    pub(crate) fn test_vm(config: VmConfig) -> (VM, TestOutput) {
        let out = Rc::new(RefCell::new(String::new()));
        let sink = out.clone();
        let mut registry = ForeignRegistry::new();
        registry.register("print", 1, move |args| {
            use std::fmt::Write;
            write!(sink.borrow_mut(), "{}", args[0]).unwrap();
            0.0
        });
        (VM::new(config, &registry), TestOutput(out))
    }

    fn run(source: &str) -> String {
        let (mut vm, out) = test_vm(VmConfig::default());
        vm.run_source(source).expect("run");
        let result = out.0.borrow().clone();
        result
    }

    #[test]
    fn run_print_42() {
        assert_eq!(run("print(42);"), "42");
    }

    #[test]
    fn run_print_plus() {
        assert_eq!(run("print(42 + 1);"), "43");
    }

    #[test]
    fn run_print_var() {
        assert_eq!(run("var x = 42; print(x);"), "42");
    }

    #[test]
    fn run_print_var_arith() {
        assert_eq!(run("var x = 42; print(2 + x);"), "44");
        assert_eq!(run("var x = 42; print(2 - x);"), "-40");
        assert_eq!(run("var x = 42; print(2 * x);"), "84");
        assert_eq!(run("var x = 42; print(84 / x);"), "2");
    }

    #[test]
    fn run_print_compare() {
        assert_eq!(run("var x = 2; print((x == 1) + 0);"), "0");
        assert_eq!(run("var x = 1; print((x == 1) + 0);"), "1");
    }

    #[test]
    fn run_print_assign() {
        assert_eq!(run("var x = 1; x = x + 1; print(x);"), "2");
    }

    #[test]
    fn run_while() {
        assert_eq!(
            run("var i = 0; var s = 0;
                 while (i < 10) {
                     i = i + 1;
                     s = s + 2;
                 }
                 print(s);"),
            "20"
        );
    }

    #[test]
    fn run_while_skip() {
        assert_eq!(
            run("var i = 0; var s = 5;
                 while (i < 0) {
                     i = i + 1;
                     s = s + 2;
                 }
                 print(s);"),
            "5"
        );
    }

    #[test]
    fn run_if_both_arms() {
        assert_eq!(
            run("var i = 0; var s = 0;
                 if (i < 10) { s = 3; } else { s = 4; }
                 print(s);"),
            "3"
        );
        assert_eq!(
            run("var i = 0; var s = 0;
                 if (10 < i) { s = 3; } else { s = 4; }
                 print(s);"),
            "4"
        );
    }

    #[test]
    fn run_function_call() {
        assert_eq!(
            run("function add(a, b) { return a + b; }
                 print(add(40, 2));"),
            "42"
        );
    }

    #[test]
    fn run_recursion() {
        assert_eq!(
            run("function fib(n) {
                     if (n < 2) { return n; }
                     return fib(n - 1) + fib(n - 2);
                 }
                 print(fib(10));"),
            "55"
        );
    }

    #[test]
    fn parameters_are_addressable_in_any_order() {
        assert_eq!(
            run("function sub(a, b) { return a - b; }
                 print(sub(10, 4));"),
            "6"
        );
    }

    #[test]
    fn top_level_result_is_returned() {
        let (mut vm, _) = test_vm(VmConfig::default());
        assert_eq!(vm.run_source("var x = 5;").unwrap(), 0.0);
    }

    #[test]
    fn deep_recursion_overflows_cleanly() {
        let (mut vm, _) = test_vm(VmConfig::default());
        let err = vm
            .run_source(
                "function spin(n) { return spin(n + 1); }
                 spin(0);",
            )
            .unwrap_err();
        assert!(matches!(err, VmError::Runtime(RuntimeError::StackOverflow)));
    }

    #[test]
    fn compile_error_aborts_run() {
        let (mut vm, out) = test_vm(VmConfig::default());
        assert!(vm.run_source("missing(1);").is_err());
        assert_eq!(out.0.borrow().as_str(), "");
    }
}

/// Differential checks: the same program must behave identically whether
/// or not the optimizing tier activates.
#[cfg(test)]
mod tier_tests {
    use super::tests::test_vm;
    use super::*;

    fn interpret_only() -> VmConfig {
        VmConfig {
            compile_threshold: u32::MAX,
            ..VmConfig::default()
        }
    }

    fn eager_jit() -> VmConfig {
        VmConfig {
            compile_threshold: 1,
            ..VmConfig::default()
        }
    }

    fn run_with(config: VmConfig, source: &str) -> (String, VM) {
        let (mut vm, out) = test_vm(config);
        vm.run_source(source).expect("run");
        let printed = out.0.borrow().clone();
        (printed, vm)
    }

    /// The compiled tier must actually have been exercised, otherwise the
    /// differential comparison proves nothing.
    fn assert_tiered_up(vm: &VM, name: &str) {
        let (_, meta) = vm
            .functions
            .iter()
            .find(|(_, m)| m.name == name)
            .expect("function exists");
        assert!(
            meta.compiled().is_some(),
            "`{name}` was expected to tier up"
        );
    }

    #[test]
    fn alternating_branch_sum_matches_across_tiers() {
        let source = "var i = 0; var t = 0; var s = 0;
             while (i < 600) {
                 s = s + f(t * 400);
                 t = 1 - t;
                 i = i + 1;
             }
             print(s);
             function f(x) {
                 if (x < 200) { return x + 1; } else { return x + 2; }
             }";
        let (interpreted, _) = run_with(interpret_only(), source);
        let (jitted, vm) = run_with(VmConfig::default(), source);
        assert_tiered_up(&vm, "f");
        assert_eq!(interpreted, jitted);
        // 300 calls take each branch: 300 * 1 + 300 * 402.
        assert_eq!(jitted, "120900");
    }

    #[test]
    fn loop_function_result_survives_tier_up() {
        let source = "var r = 0; var k = 0;
             while (k < 5) {
                 r = count(10);
                 k = k + 1;
             }
             print(r);
             function count(n) {
                 var i = 0;
                 while (i < n) { i = i + 1; }
                 return i;
             }";
        let (interpreted, _) = run_with(interpret_only(), source);
        let (jitted, vm) = run_with(eager_jit(), source);
        assert_tiered_up(&vm, "count");
        assert_eq!(interpreted, "10");
        assert_eq!(jitted, "10");
    }

    #[test]
    fn nested_loop_function_matches_across_tiers() {
        let source = "var k = 0; var r = 0;
             while (k < 3) {
                 r = tri(7);
                 k = k + 1;
             }
             print(r);
             function tri(n) {
                 var i = 0; var s = 0;
                 while (i < n) {
                     var j = 0;
                     while (j < i) { s = s + 1; j = j + 1; }
                     i = i + 1;
                 }
                 return s;
             }";
        let (interpreted, _) = run_with(interpret_only(), source);
        let (jitted, vm) = run_with(eager_jit(), source);
        assert_tiered_up(&vm, "tri");
        assert_eq!(interpreted, jitted);
        assert_eq!(jitted, "21");
    }

    #[test]
    fn function_with_calls_stays_interpreted_but_correct() {
        // `caller` contains a Call, which the graph builder declines;
        // the function must be marked non-optimizable and keep running.
        let source = "var k = 0; var r = 0;
             while (k < 40) {
                 r = r + caller(k);
                 k = k + 1;
             }
             print(r);
             function caller(x) { return leaf(x) + 1; }
             function leaf(x) { return x * 2; }";
        let (interpreted, _) = run_with(interpret_only(), source);
        let (jitted, vm) = run_with(eager_jit(), source);
        let (_, caller) = vm
            .functions
            .iter()
            .find(|(_, m)| m.name == "caller")
            .unwrap();
        assert!(caller.compiled().is_none());
        assert!(!caller.is_optimizable());
        assert_tiered_up(&vm, "leaf");
        assert_eq!(interpreted, jitted);
    }

    #[test]
    fn hotness_counter_resets_on_tier_up_attempt() {
        let source = "var k = 0;
             while (k < 50) { k = k + spin(20); }
             function spin(n) {
                 var i = 0;
                 while (i < n) { i = i + 1; }
                 return 1;
             }";
        let (_, vm) = run_with(eager_jit(), source);
        let (_, meta) = vm
            .functions
            .iter()
            .find(|(_, m)| m.name == "spin")
            .unwrap();
        // Once compiled, the interpreter no longer runs the function, so
        // the counter stays where the reset left it.
        assert!(meta.compiled().is_some());
        assert_eq!(meta.profile_counter(), 0);
    }
}
