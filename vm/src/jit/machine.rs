//! The compiled-code target: a structured low-level instruction stream
//! over typed locals, plus the executor that runs it.
//!
//! The stream uses explicit `Block`/`Loop`/`End` nesting with
//! depth-indexed branches: `Br(0)` targets the innermost enclosing
//! construct, branching to a `Block` exits past its `End`, branching to a
//! `Loop` continues at its head. Local 0 always holds the frame base;
//! the prologue converts it from a slot index to a byte address, and all
//! stack accesses go through the same linear memory the interpreter
//! uses, so the two tiers share frames directly.

use crate::memory::Memory;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MachineInst {
    Block,
    Loop,
    End,
    /// Branch to the construct `depth` levels out (0 = innermost).
    Br(u32),
    /// Pop a value; branch if it is non-zero.
    BrIf(u32),
    Return,
    LocalGet(u32),
    LocalSet(u32),
    F64Const(f64),
    I32Const(i32),
    I32Add,
    I32Shl,
    /// Pop a byte address, push the f64 stored there.
    F64Load,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    // Comparisons push an integer 0/1.
    F64Eq,
    F64Ne,
    F64Lt,
    F64Le,
    /// Convert the integer comparison result to the f64 value
    /// representation.
    F64ConvertI32U,
}

/// A directly callable compiled routine: the instruction stream, the
/// number of locals it needs, and a precomputed matching-`End` table for
/// the structured constructs.
pub struct CompiledCode {
    code: Vec<MachineInst>,
    local_count: u32,
    matching_end: Vec<u32>,
}

struct Control {
    is_loop: bool,
    start: usize,
    end: usize,
}

impl CompiledCode {
    /// Wrap a finished instruction stream. The stream must be balanced:
    /// every `Block`/`Loop` has a matching `End`.
    pub fn new(code: Vec<MachineInst>, local_count: u32) -> Self {
        let mut matching_end = vec![0u32; code.len()];
        let mut open: Vec<usize> = Vec::new();
        for (i, inst) in code.iter().enumerate() {
            match inst {
                MachineInst::Block | MachineInst::Loop => open.push(i),
                MachineInst::End => {
                    let start = open.pop().expect("balanced construct nesting");
                    matching_end[start] = i as u32;
                }
                _ => {}
            }
        }
        assert!(open.is_empty(), "unterminated construct");
        Self {
            code,
            local_count,
            matching_end,
        }
    }

    pub fn instructions(&self) -> &[MachineInst] {
        &self.code
    }

    pub fn local_count(&self) -> u32 {
        self.local_count
    }

    /// Execute against `memory` with the frame at `frame_base` (a slot
    /// index). Returns the routine's result.
    pub fn invoke(&self, memory: &mut Memory, frame_base: usize) -> f64 {
        let mut locals = vec![0.0f64; self.local_count as usize];
        locals[0] = frame_base as f64;
        let mut stack: Vec<f64> = Vec::new();
        let mut control: Vec<Control> = Vec::new();
        let mut pc = 0usize;

        macro_rules! pop {
            () => {
                stack.pop().expect("compiled code underflowed its stack")
            };
        }

        while pc < self.code.len() {
            match self.code[pc] {
                MachineInst::Block => control.push(Control {
                    is_loop: false,
                    start: pc,
                    end: self.matching_end[pc] as usize,
                }),
                MachineInst::Loop => control.push(Control {
                    is_loop: true,
                    start: pc,
                    end: self.matching_end[pc] as usize,
                }),
                MachineInst::End => {
                    control.pop();
                }
                MachineInst::Br(depth) => {
                    pc = branch(&mut control, depth);
                }
                MachineInst::BrIf(depth) => {
                    if pop!() != 0.0 {
                        pc = branch(&mut control, depth);
                    }
                }
                MachineInst::Return => return pop!(),
                MachineInst::LocalGet(local) => {
                    stack.push(locals[local as usize]);
                }
                MachineInst::LocalSet(local) => {
                    locals[local as usize] = pop!();
                }
                MachineInst::F64Const(value) => stack.push(value),
                MachineInst::I32Const(value) => stack.push(value as f64),
                MachineInst::I32Add => {
                    let right = pop!() as i64 as i32;
                    let left = pop!() as i64 as i32;
                    stack.push(left.wrapping_add(right) as f64);
                }
                MachineInst::I32Shl => {
                    let shift = pop!() as i64 as i32;
                    let value = pop!() as i64 as i32;
                    stack.push((value << (shift & 31)) as f64);
                }
                MachineInst::F64Load => {
                    let address = pop!() as i64 as usize;
                    stack.push(memory.read_f64(address));
                }
                MachineInst::F64Add => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left + right);
                }
                MachineInst::F64Sub => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left - right);
                }
                MachineInst::F64Mul => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left * right);
                }
                MachineInst::F64Div => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(left / right);
                }
                MachineInst::F64Eq => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(if left == right { 1.0 } else { 0.0 });
                }
                MachineInst::F64Ne => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(if left != right { 1.0 } else { 0.0 });
                }
                MachineInst::F64Lt => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(if left < right { 1.0 } else { 0.0 });
                }
                MachineInst::F64Le => {
                    let right = pop!();
                    let left = pop!();
                    stack.push(if left <= right { 1.0 } else { 0.0 });
                }
                MachineInst::F64ConvertI32U => {
                    let value = pop!();
                    stack.push(value as i64 as u32 as f64);
                }
            }
            pc += 1;
        }

        // Falling off the end means every path returned already; keep the
        // undefined value as a safety net.
        stack.pop().unwrap_or(0.0)
    }

    /// Indented listing of the structured stream.
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let mut depth = 0usize;
        for inst in &self.code {
            if matches!(inst, MachineInst::End) {
                depth = depth.saturating_sub(1);
            }
            let _ = writeln!(out, "{:indent$}{}", "", format_inst(inst), indent = depth * 2);
            if matches!(inst, MachineInst::Block | MachineInst::Loop) {
                depth += 1;
            }
        }
        out
    }
}

/// Resolve a branch: to a loop's head, or past a block's `End`. The
/// control stack is cut back to the target either way.
fn branch(control: &mut Vec<Control>, depth: u32) -> usize {
    let target = control.len() - 1 - depth as usize;
    if control[target].is_loop {
        let pc = control[target].start;
        control.truncate(target + 1);
        pc
    } else {
        let pc = control[target].end;
        control.truncate(target);
        pc
    }
}

fn format_inst(inst: &MachineInst) -> String {
    match inst {
        MachineInst::Block => "block".into(),
        MachineInst::Loop => "loop".into(),
        MachineInst::End => "end".into(),
        MachineInst::Br(d) => format!("br {d}"),
        MachineInst::BrIf(d) => format!("br_if {d}"),
        MachineInst::Return => "return".into(),
        MachineInst::LocalGet(l) => format!("local.get {l}"),
        MachineInst::LocalSet(l) => format!("local.set {l}"),
        MachineInst::F64Const(v) => format!("f64.const {v}"),
        MachineInst::I32Const(v) => format!("i32.const {v}"),
        MachineInst::I32Add => "i32.add".into(),
        MachineInst::I32Shl => "i32.shl".into(),
        MachineInst::F64Load => "f64.load".into(),
        MachineInst::F64Add => "f64.add".into(),
        MachineInst::F64Sub => "f64.sub".into(),
        MachineInst::F64Mul => "f64.mul".into(),
        MachineInst::F64Div => "f64.div".into(),
        MachineInst::F64Eq => "f64.eq".into(),
        MachineInst::F64Ne => "f64.ne".into(),
        MachineInst::F64Lt => "f64.lt".into(),
        MachineInst::F64Le => "f64.le".into(),
        MachineInst::F64ConvertI32U => "f64.convert_i32_u".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MachineInst as I;

    fn run(code: Vec<MachineInst>, locals: u32) -> f64 {
        let mut memory = Memory::default();
        CompiledCode::new(code, locals).invoke(&mut memory, 0)
    }

    #[test]
    fn arithmetic_and_return() {
        let result = run(
            vec![
                I::F64Const(40.0),
                I::F64Const(2.0),
                I::F64Add,
                I::Return,
            ],
            1,
        );
        assert_eq!(result, 42.0);
    }

    #[test]
    fn branch_to_block_skips_past_end() {
        // block { 1.0; br 0; unreachable } → falls through to Return 7.
        let result = run(
            vec![
                I::Block,
                I::F64Const(1.0),
                I::BrIf(0),
                I::F64Const(999.0),
                I::Return,
                I::End,
                I::F64Const(7.0),
                I::Return,
            ],
            1,
        );
        assert_eq!(result, 7.0);
    }

    #[test]
    fn branch_to_loop_repeats() {
        // Count local 1 up to 3 using a loop construct.
        let result = run(
            vec![
                I::Loop,
                I::LocalGet(1),
                I::F64Const(1.0),
                I::F64Add,
                I::LocalSet(1),
                I::LocalGet(1),
                I::F64Const(3.0),
                I::F64Lt,
                I::F64ConvertI32U,
                I::BrIf(0),
                I::End,
                I::LocalGet(1),
                I::Return,
            ],
            2,
        );
        assert_eq!(result, 3.0);
    }

    #[test]
    fn frame_relative_load() {
        let mut memory = Memory::default();
        let base = memory.stack_start();
        memory.write_slot(base - 1, 123.0);
        // Prologue shape: shift the frame base to bytes, then load the
        // first parameter at byte offset -8.
        let code = CompiledCode::new(
            vec![
                I::LocalGet(0),
                I::I32Const(3),
                I::I32Shl,
                I::LocalSet(0),
                I::LocalGet(0),
                I::I32Const(-8),
                I::I32Add,
                I::F64Load,
                I::Return,
            ],
            1,
        );
        assert_eq!(code.invoke(&mut memory, base), 123.0);
    }

    #[test]
    fn dump_indents_structure() {
        let code = CompiledCode::new(
            vec![I::Block, I::Loop, I::Br(1), I::End, I::End],
            1,
        );
        let dump = code.dump();
        assert!(dump.contains("block"));
        assert!(dump.contains("  loop"));
        assert!(dump.contains("    br 1"));
    }
}
