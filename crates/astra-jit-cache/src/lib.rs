//! Profiled, persistent cache of JIT-compiled machine code.
//!
//! Host code produced for guest addresses is kept across process runs, so a
//! previously-seen program does not recompile from scratch every launch, and
//! hot functions are progressively upgraded to a higher compilation tier
//! based on a profile gathered on a prior run.
//!
//! The moving parts:
//!
//! - [`TranslationCache`]: the on-disk format (versioned, digest-checked,
//!   deflate-compressed), the three append-only segment buffers, and the
//!   enable/wind-down state machine.
//! - Relocations ([`RelocEntry`], [`apply_relocations`]): cached code carries
//!   pointer-sized placeholders that are patched at load time with this run's
//!   page-table base, jump-table stubs, and helper-delegate pointers.
//! - [`Profiler`]: per-address execution profile with its own persistence
//!   cycle and autosave tick.
//! - [`rejit_from_profile`]: the parallel recompilation pass that reconciles
//!   the materialized function set with the profile.
//!
//! Corrupt or incompatible cache files silently degrade to a cold start; the
//! only hard failures are internal inconsistencies that would otherwise
//! execute under-patched machine code.

mod builder;
mod error;
mod format;
mod io;
mod jump_table;
mod profiler;
mod reloc;
mod rejit;
mod runtime;
mod store;

pub use crate::builder::EntryBuilder;
pub use crate::error::{CacheError, Result};
pub use crate::format::{
    open_envelope, seal_envelope, CacheHeader, EntryInfo, CACHE_MAGIC, CACHE_VERSION, DIGEST_SIZE,
    ENTRY_INFO_SIZE, HEADER_SIZE,
};
pub use crate::jump_table::{BranchRecord, DynamicRecord, JumpTableSnapshot};
pub use crate::profiler::{ProfileEntry, Profiler, AUTOSAVE_PERIOD};
pub use crate::reloc::{
    apply_relocations, special, RelocEntry, RelocTargets, Symbol, SymbolKind, RELOC_ENTRY_SIZE,
};
pub use crate::rejit::{rejit_from_profile, RejitConfig, RejitStats};
pub use crate::runtime::{
    CodePtr, DelegateTable, ExecMode, ExecutableMapper, FunctionTable, JumpTableRuntime, Quality,
    TranslatedCode, TranslatedFunction, Translator,
};
pub use crate::store::{
    CacheState, LoadStatus, TranslationCache, CACHE_FILE_EXTENSION, PROFILE_FILE_EXTENSION,
};
