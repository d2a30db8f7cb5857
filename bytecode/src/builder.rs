use crate::op::{Op, UNBOUND_TARGET};

/// A jump target that may be referenced before its position is known.
///
/// An unbound label records every byte position where its value was
/// emitted; [`BytecodeBuilder::bind`] walks that patch list and overwrites
/// the [`UNBOUND_TARGET`] sentinel at each position with the now-known
/// offset. Jumps emitted after binding resolve immediately, so backward
/// jumps (loop back edges) need no patching at all.
///
/// Labels are local to one builder; there is no cross-function sharing.
#[derive(Debug, Default)]
pub struct Label {
    resolved: Option<u32>,
    patches: Vec<usize>,
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bound offset, if [`BytecodeBuilder::bind`] has run.
    pub fn target(&self) -> Option<u32> {
        self.resolved
    }
}

/// Builds an encoded bytecode byte sequence.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    // ── stack management ───────────────────────────────────────────

    /// `Drop` — remove the top of the stack.
    pub fn drop_top(&mut self) {
        self.emit_op(Op::Drop);
    }

    /// `Dup` — duplicate the top of the stack.
    pub fn dup(&mut self) {
        self.emit_op(Op::Dup);
    }

    /// `LoadNumber <value:f64>` — push a number constant.
    pub fn load_number(&mut self, value: f64) {
        self.emit_op(Op::LoadNumber);
        self.emit_f64(value);
    }

    /// `LoadLocal <slot:i16>` — push a local (or parameter) value.
    pub fn load_local(&mut self, slot: i16) {
        self.emit_op(Op::LoadLocal);
        self.emit_i16(slot);
    }

    /// `StoreLocal <slot:i16>` — pop into a local (or parameter) slot.
    pub fn store_local(&mut self, slot: i16) {
        self.emit_op(Op::StoreLocal);
        self.emit_i16(slot);
    }

    // ── arithmetic and comparisons ─────────────────────────────────

    pub fn add(&mut self) {
        self.emit_op(Op::Add);
    }

    pub fn sub(&mut self) {
        self.emit_op(Op::Sub);
    }

    pub fn mul(&mut self) {
        self.emit_op(Op::Mul);
    }

    pub fn div(&mut self) {
        self.emit_op(Op::Div);
    }

    pub fn test_equal(&mut self) {
        self.emit_op(Op::TestEqual);
    }

    pub fn test_less_than(&mut self) {
        self.emit_op(Op::TestLessThan);
    }

    pub fn test_less_than_or_equal(&mut self) {
        self.emit_op(Op::TestLessThanOrEqual);
    }

    // ── control flow ───────────────────────────────────────────────

    /// `Jump <label>` — unconditional jump.
    pub fn jump(&mut self, label: &mut Label) {
        self.emit_jump(Op::Jump, label);
    }

    /// `JumpIfTrue <label>` — pop condition, jump if non-zero.
    pub fn jump_if_true(&mut self, label: &mut Label) {
        self.emit_jump(Op::JumpIfTrue, label);
    }

    /// `JumpIfFalse <label>` — pop condition, jump if zero.
    pub fn jump_if_false(&mut self, label: &mut Label) {
        self.emit_jump(Op::JumpIfFalse, label);
    }

    /// `LoopHeader` — mark the target of a following [`jump_loop`].
    ///
    /// [`jump_loop`]: Self::jump_loop
    pub fn loop_header(&mut self) {
        self.emit_op(Op::LoopHeader);
    }

    /// `JumpLoop <label>` — the loop back edge. The label must already be
    /// bound (loops jump backward).
    pub fn jump_loop(&mut self, label: &mut Label) {
        self.emit_jump(Op::JumpLoop, label);
    }

    /// `Call <constant:u16> <argc:u8>` — call the function in the
    /// constant pool. Arguments are expected on the stack.
    pub fn call(&mut self, constant: u16, argc: u8) {
        self.emit_op(Op::Call);
        self.emit_u16(constant);
        self.emit_u8(argc);
    }

    /// `Return` — pop the return value and leave the function.
    pub fn return_(&mut self) {
        self.emit_op(Op::Return);
    }

    /// Bind `label` to the current offset and patch every recorded use.
    ///
    /// Binding is idempotent in effect: all recorded patch positions are
    /// resolved exactly once, and later jumps through the same label are
    /// emitted already-resolved.
    pub fn bind(&mut self, label: &mut Label) {
        debug_assert!(label.resolved.is_none(), "label bound twice");
        let target = self.current_offset();
        label.resolved = Some(target);
        for pos in label.patches.drain(..) {
            self.buf[pos..pos + 4].copy_from_slice(&target.to_le_bytes());
        }
    }

    fn emit_jump(&mut self, op: Op, label: &mut Label) {
        self.emit_op(op);
        match label.resolved {
            Some(target) => self.emit_u32(target),
            None => {
                label.patches.push(self.buf.len());
                self.emit_u32(UNBOUND_TARGET);
            }
        }
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
