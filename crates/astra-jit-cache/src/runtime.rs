//! Seams to the collaborators this cache drives but does not implement: the
//! translator, the executable-memory mapper, the jump-table runtime, and the
//! helper-delegate pointer table.

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::jump_table::JumpTableSnapshot;
use crate::reloc::RelocEntry;

/// Guest execution mode recorded per profiled address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecMode {
    Real = 0,
    Protected = 1,
    Long = 2,
}

impl ExecMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ExecMode::Real),
            1 => Some(ExecMode::Protected),
            2 => Some(ExecMode::Long),
            _ => None,
        }
    }
}

/// Compilation tier. `Low` is cheap to produce; `High` is optimized and
/// registered for direct jump-table dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Low,
    High,
}

impl Quality {
    pub fn from_high(high: bool) -> Self {
        if high {
            Quality::High
        } else {
            Quality::Low
        }
    }

    pub fn is_high(self) -> bool {
        matches!(self, Quality::High)
    }
}

/// Output of one translation.
///
/// `code` is ready to execute in the producing process (the translator embeds
/// this run's concrete pointers); `relocs` records where those run-specific
/// pointers live so the bytes can be re-patched when a future process loads
/// them from the cache.
#[derive(Debug, Clone, Default)]
pub struct TranslatedCode {
    pub code: Vec<u8>,
    pub relocs: Vec<RelocEntry>,
}

/// The guest-instruction-to-host-code translator.
pub trait Translator {
    fn translate(&self, address: u64, mode: ExecMode, quality: Quality) -> Result<TranslatedCode>;
}

/// Opaque callable handle to host code mapped into executable pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodePtr(pub u64);

/// Maps finished (patched) code bytes into runnable pages.
pub trait ExecutableMapper {
    fn map(&self, code: &[u8]) -> Result<CodePtr>;
}

/// A materialized guest function: its host entry point plus the tier it was
/// compiled at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatedFunction {
    pub ptr: CodePtr,
    pub high_quality: bool,
}

/// Guest address -> materialized function.
pub type FunctionTable = FxHashMap<u64, TranslatedFunction>;

/// The indirect/direct branch dispatch runtime. The cache persists its
/// content as a [`JumpTableSnapshot`] and resolves two of its native base
/// pointers as relocation targets.
pub trait JumpTableRuntime {
    /// Seed the runtime from a persisted snapshot and the freshly
    /// materialized function table.
    fn initialize(&self, snapshot: &JumpTableSnapshot, functions: &FunctionTable);

    /// Re-derive the persistable tables from the live runtime.
    fn snapshot(&self) -> JumpTableSnapshot;

    /// Register a function for direct dispatch.
    fn register(&self, address: u64, function: &TranslatedFunction);

    /// Native base of the direct-branch stub region.
    fn base_pointer(&self) -> u64;

    /// Native base of the dynamic-dispatch stub region.
    fn dynamic_base_pointer(&self) -> u64;
}

/// Process-wide ordered table of helper-function pointers.
pub trait DelegateTable {
    fn lookup(&self, index: u64) -> Option<u64>;
}
