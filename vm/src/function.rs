//! Function metadata and the function arena.
//!
//! Every function the VM knows about — the synthetic top-level, declared
//! functions, foreign bindings — is a [`FunctionMeta`] stored in the
//! [`Functions`] arena. Cross-references (constant pools, call targets)
//! are plain [`FunctionId`] indices into that arena, never pointers.

use std::rc::Rc;

use crate::ffi::ForeignFn;
use crate::jit::machine::CompiledCode;

/// Index of a function in the [`Functions`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Slots 0 and 1 of every frame are reserved for call linkage: slot 0
/// holds the caller's frame base, slot 1 is reserved. User locals are
/// allocated from slot 2; parameters sit below the frame base at slot
/// `-(i + 1)`.
pub const FIXED_SLOT_COUNT: u16 = 2;

/// A compiled unit of bytecode, owned by its function metadata.
///
/// `local_count` includes the [`FIXED_SLOT_COUNT`] linkage slots. The
/// constant pool holds call targets. Invariant: by the time compilation
/// finishes, every jump operand in `code` is a resolved absolute offset —
/// no [`bytecode::UNBOUND_TARGET`] sentinel survives.
#[derive(Debug, Clone)]
pub struct BytecodeUnit {
    pub code: Vec<u8>,
    pub local_count: u16,
    pub constants: Vec<FunctionId>,
}

/// What a function's body is: a bytecode unit or a native callback.
#[derive(Clone)]
pub enum FunctionKind {
    /// Shared behind `Rc` so the interpreter can walk the code while the
    /// arena stays mutable (counter updates, re-entrant calls); the
    /// metadata remains the unit's only lasting owner.
    Bytecode(Rc<BytecodeUnit>),
    Foreign(ForeignFn),
}

/// Per-function metadata: identity, calling shape, profiling state, and
/// the optimized-code handle once the JIT has produced one.
///
/// Created once per function and never destroyed during a run. The
/// interpreter mutates the hotness counter; the compiler pipeline writes
/// the compiled handle and the optimizability flag.
pub struct FunctionMeta {
    pub name: String,
    pub parameter_count: u16,
    kind: FunctionKind,
    profile_counter: u32,
    optimizable: bool,
    compiled: Option<Rc<CompiledCode>>,
}

impl FunctionMeta {
    pub fn new_bytecode_placeholder(name: String, parameter_count: u16) -> Self {
        Self {
            name,
            parameter_count,
            // Replaced by `attach_unit` once the body is compiled.
            kind: FunctionKind::Bytecode(Rc::new(BytecodeUnit {
                code: Vec::new(),
                local_count: FIXED_SLOT_COUNT,
                constants: Vec::new(),
            })),
            profile_counter: 0,
            optimizable: true,
            compiled: None,
        }
    }

    pub fn new_foreign(name: String, parameter_count: u16, callback: ForeignFn) -> Self {
        Self {
            name,
            parameter_count,
            kind: FunctionKind::Foreign(callback),
            profile_counter: 0,
            // Foreign bindings are never candidates for the optimizing tier.
            optimizable: false,
            compiled: None,
        }
    }

    pub fn attach_unit(&mut self, unit: BytecodeUnit) {
        debug_assert!(matches!(self.kind, FunctionKind::Bytecode(_)));
        self.kind = FunctionKind::Bytecode(Rc::new(unit));
    }

    pub fn kind(&self) -> &FunctionKind {
        &self.kind
    }

    pub fn bytecode(&self) -> Option<&Rc<BytecodeUnit>> {
        match &self.kind {
            FunctionKind::Bytecode(unit) => Some(unit),
            FunctionKind::Foreign(_) => None,
        }
    }

    pub fn is_optimizable(&self) -> bool {
        self.optimizable
    }

    /// Permanently exclude this function from the optimizing tier.
    pub fn mark_cannot_optimize(&mut self) {
        self.optimizable = false;
    }

    pub fn profile_counter(&self) -> u32 {
        self.profile_counter
    }

    pub fn add_profile_ticks(&mut self, ticks: u32) {
        self.profile_counter = self.profile_counter.saturating_add(ticks);
    }

    pub fn reset_profile_counter(&mut self) {
        self.profile_counter = 0;
    }

    pub fn set_compiled(&mut self, code: CompiledCode) {
        self.compiled = Some(Rc::new(code));
    }

    pub fn compiled(&self) -> Option<&Rc<CompiledCode>> {
        self.compiled.as_ref()
    }
}

/// Arena of all function metadata for one VM instance.
#[derive(Default)]
pub struct Functions {
    metas: Vec<FunctionMeta>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, meta: FunctionMeta) -> FunctionId {
        let id = FunctionId(self.metas.len() as u32);
        self.metas.push(meta);
        id
    }

    pub fn get(&self, id: FunctionId) -> &FunctionMeta {
        &self.metas[id.index()]
    }

    pub fn get_mut(&mut self, id: FunctionId) -> &mut FunctionMeta {
        &mut self.metas[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (FunctionId, &FunctionMeta)> {
        self.metas
            .iter()
            .enumerate()
            .map(|(i, m)| (FunctionId(i as u32), m))
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }
}
