//! Tier 1: the optimizing pipeline.
//!
//! `compile` runs bytecode → graph → block order → structured code and
//! caches the result on the function's metadata. Any stage can decline —
//! that is a negative result, not an error: the function is marked
//! non-optimizable and keeps running in the interpreter, with identical
//! semantics.

pub mod codegen;
pub mod graph;
pub mod graph_builder;
pub mod machine;
pub mod scheduler;

use log::debug;

use crate::function::FunctionId;
use crate::VM;

/// Try to compile `function`. Returns whether compiled code is installed.
pub fn compile(vm: &mut VM, function: FunctionId) -> bool {
    let (unit, parameter_count, name) = {
        let meta = vm.functions.get(function);
        let Some(unit) = meta.bytecode() else {
            return false;
        };
        (unit.clone(), meta.parameter_count, meta.name.clone())
    };

    debug!("jit: compiling `{name}`");
    let Some(mut graph) = graph_builder::build(parameter_count, &unit) else {
        debug!("jit: `{name}` has an unsupported bytecode shape; it stays interpreted");
        vm.functions.get_mut(function).mark_cannot_optimize();
        return false;
    };
    if vm.config.print_graph {
        println!(">>> Graph for \"{name}\".");
        print!("{}", graph.dump());
    }

    let order = scheduler::compute_block_order(&mut graph);

    let Some(code) = codegen::generate(&graph, &order) else {
        debug!("jit: code generation declined for `{name}`; it stays interpreted");
        vm.functions.get_mut(function).mark_cannot_optimize();
        return false;
    };
    if vm.config.print_code {
        println!(">>> Code for \"{name}\".");
        print!("{}", code.dump());
    }

    debug!("jit: installed compiled code for `{name}`");
    vm.functions.get_mut(function).set_compiled(code);
    true
}
