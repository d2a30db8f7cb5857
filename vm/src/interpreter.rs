//! Tier 0: the bytecode interpreter.
//!
//! Frames live in the shared linear memory: slot 0 of a frame holds the
//! caller's frame base, slot 1 is reserved, user locals follow, and the
//! operand stack grows directly above the locals. Parameters sit below
//! the frame base, so both tiers address them at slot `-(i + 1)`.
//!
//! Profiling: each function accumulates ticks on backward jumps (by the
//! distance jumped) and on return (by the final program counter) — a
//! cheap proxy for work done. When the counter passes the configured
//! threshold at function entry, it resets and the optimizing pipeline
//! runs; on success the compiled entry point handles the current call
//! already, on failure the function stays interpreted for good.

use bytecode::{decode_at, Instruction};

use crate::function::{FunctionId, FunctionKind};
use crate::jit;
use crate::memory::Memory;
use crate::VM;

const MAX_CALL_DEPTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The frame or operand stack ran past the stack region, or calls
    /// nested too deeply.
    StackOverflow,
    /// Allocation failed even after a collection attempt.
    HeapExhausted,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::HeapExhausted => write!(f, "heap exhausted"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<crate::memory::HeapExhausted> for RuntimeError {
    fn from(_: crate::memory::HeapExhausted) -> Self {
        Self::HeapExhausted
    }
}

/// Execute `function` with its frame at `frame_base` (a slot index).
/// Arguments, if any, must already be on the stack below the frame base
/// and slot 0 must hold the caller's frame base.
///
/// Re-enters itself for calls; a call transparently resolves to compiled
/// code when the callee has been tiered up.
pub fn execute(
    vm: &mut VM,
    function: FunctionId,
    frame_base: usize,
) -> Result<f64, RuntimeError> {
    vm.call_depth += 1;
    let result = run(vm, function, frame_base);
    vm.call_depth -= 1;
    result
}

fn push(
    memory: &mut Memory,
    stack_ptr: &mut usize,
    value: f64,
) -> Result<(), RuntimeError> {
    if *stack_ptr >= memory.stack_limit() {
        return Err(RuntimeError::StackOverflow);
    }
    memory.write_slot(*stack_ptr, value);
    *stack_ptr += 1;
    Ok(())
}

fn pop(memory: &Memory, stack_ptr: &mut usize) -> f64 {
    *stack_ptr -= 1;
    memory.read_slot(*stack_ptr)
}

fn run(
    vm: &mut VM,
    function: FunctionId,
    frame_base: usize,
) -> Result<f64, RuntimeError> {
    if vm.call_depth > MAX_CALL_DEPTH {
        return Err(RuntimeError::StackOverflow);
    }

    // Tier-up check. The counter approximates loop iterations executed in
    // past calls; once it trips, compile and let the compiled entry point
    // serve this very call.
    if vm.functions.get(function).profile_counter() > vm.config.compile_threshold
    {
        vm.functions.get_mut(function).reset_profile_counter();
        if vm.functions.get(function).is_optimizable() {
            jit::compile(vm, function);
        }
    }
    if let Some(code) = vm.functions.get(function).compiled().cloned() {
        return Ok(code.invoke(&mut vm.memory, frame_base));
    }

    let (unit, parameter_count, name) = {
        let meta = vm.functions.get(function);
        let unit = meta
            .bytecode()
            .expect("foreign functions are never interpreted")
            .clone();
        (unit, meta.parameter_count as i32, meta.name.clone())
    };
    let local_count = unit.local_count as usize;

    if frame_base + local_count >= vm.memory.stack_limit() {
        return Err(RuntimeError::StackOverflow);
    }
    // Slot 0 was written by the caller; clear the reserved slot and the
    // locals.
    for slot in 1..local_count {
        vm.memory.write_slot(frame_base + slot, 0.0);
    }

    let mut stack_ptr = frame_base + local_count;
    let mut pc = 0usize;
    let mut ticks = 0u32;
    let code = &unit.code;

    let slot_address = |slot: i16| -> usize {
        debug_assert!((slot as i32) < local_count as i32);
        debug_assert!(-(slot as i32) - 1 < parameter_count);
        (frame_base as i64 + slot as i64) as usize
    };

    while pc < code.len() {
        let Some((instruction, next_pc)) = decode_at(code, pc) else {
            // Unreachable for units produced by the compiler; a corrupt
            // unit is an unrecoverable defect.
            panic!("unknown opcode in `{name}` at offset {pc}");
        };
        let mut new_pc = next_pc;

        match instruction {
            Instruction::Drop => {
                stack_ptr -= 1;
            }
            Instruction::Dup => {
                let top = vm.memory.read_slot(stack_ptr - 1);
                push(&mut vm.memory, &mut stack_ptr, top)?;
            }
            Instruction::LoadNumber { value } => {
                push(&mut vm.memory, &mut stack_ptr, value)?;
            }
            Instruction::LoadLocal { slot } => {
                let value = vm.memory.read_slot(slot_address(slot));
                push(&mut vm.memory, &mut stack_ptr, value)?;
            }
            Instruction::StoreLocal { slot } => {
                let value = pop(&vm.memory, &mut stack_ptr);
                vm.memory.write_slot(slot_address(slot), value);
            }
            Instruction::Add => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, left + right)?;
            }
            Instruction::Sub => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, left - right)?;
            }
            Instruction::Mul => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, left * right)?;
            }
            Instruction::Div => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, left / right)?;
            }
            Instruction::TestEqual => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, bool_value(left == right))?;
            }
            Instruction::TestLessThan => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, bool_value(left < right))?;
            }
            Instruction::TestLessThanOrEqual => {
                let right = pop(&vm.memory, &mut stack_ptr);
                let left = pop(&vm.memory, &mut stack_ptr);
                push(&mut vm.memory, &mut stack_ptr, bool_value(left <= right))?;
            }
            Instruction::Jump { target } | Instruction::JumpLoop { target } => {
                let target = target as usize;
                if target < next_pc {
                    ticks += (next_pc - target) as u32;
                }
                new_pc = target;
            }
            Instruction::JumpIfTrue { target } => {
                if pop(&vm.memory, &mut stack_ptr) != 0.0 {
                    let target = target as usize;
                    if target < next_pc {
                        ticks += (next_pc - target) as u32;
                    }
                    new_pc = target;
                }
            }
            Instruction::JumpIfFalse { target } => {
                if pop(&vm.memory, &mut stack_ptr) == 0.0 {
                    let target = target as usize;
                    if target < next_pc {
                        ticks += (next_pc - target) as u32;
                    }
                    new_pc = target;
                }
            }
            Instruction::LoopHeader => {}
            Instruction::Call { constant, argc } => {
                let callee = unit.constants[constant as usize];
                let argc = argc as usize;
                // The callee frame starts at the current stack pointer;
                // its slot 0 records our frame base so Return can unwind
                // across tier boundaries.
                let callee_base = stack_ptr;
                if callee_base >= vm.memory.stack_limit() {
                    return Err(RuntimeError::StackOverflow);
                }
                vm.memory.write_slot(callee_base, frame_base as f64);

                let foreign = match vm.functions.get(callee).kind() {
                    FunctionKind::Foreign(callback) => Some(callback.clone()),
                    FunctionKind::Bytecode(_) => None,
                };
                let result = match foreign {
                    Some(callback) => {
                        let mut args = Vec::with_capacity(argc);
                        for i in 0..argc {
                            args.push(vm.memory.read_slot(callee_base - 1 - i));
                        }
                        callback(&args)
                    }
                    None => execute(vm, callee, callee_base)?,
                };

                // Drop the arguments, push the result.
                stack_ptr -= argc;
                push(&mut vm.memory, &mut stack_ptr, result)?;
            }
            Instruction::Return => {
                let value = pop(&vm.memory, &mut stack_ptr);
                ticks += next_pc as u32;
                vm.functions.get_mut(function).add_profile_ticks(ticks);
                return Ok(value);
            }
        }
        pc = new_pc;
    }

    // Ran off the end: the compiler always terminates units with Return,
    // but an empty unit yields the undefined value.
    vm.functions.get_mut(function).add_profile_ticks(ticks);
    Ok(0.0)
}

fn bool_value(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}
