//! The persistent translation cache store.
//!
//! Owns the three growable segment buffers (entry metadata, concatenated
//! code, concatenated relocations) plus the in-memory jump-table snapshot,
//! the enable/wind-down state machine, and the save gate that admits at most
//! one background save at a time.
//!
//! A corrupted or incompatible cache file silently degrades to a cold start:
//! the file is truncated to zero length and the store stays empty. Internal
//! inconsistencies discovered while materializing entries are fatal instead,
//! since continuing would execute under-patched machine code.

use std::fs;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::builder::EntryBuilder;
use crate::error::{CacheError, Result};
use crate::format::{self, CacheHeader, EntryInfo, ENTRY_INFO_SIZE, HEADER_SIZE};
use crate::io::ReadLeExt;
use crate::jump_table::JumpTableSnapshot;
use crate::profiler::Profiler;
use crate::reloc::{apply_relocations, RelocEntry, RelocTargets};
use crate::runtime::{
    DelegateTable, ExecutableMapper, FunctionTable, JumpTableRuntime, TranslatedFunction,
};

pub const CACHE_FILE_EXTENSION: &str = "jtc";
pub const PROFILE_FILE_EXTENSION: &str = "jtp";

/// Lifecycle of the cache and its background recompilation/save pipeline.
///
/// `Disabled -> Enabled -> Continuing -> Closing -> Disabled`. `Continuing`
/// stops admitting new rejit cycles while in-flight work finishes; `Closing`
/// additionally signals in-flight parallel loops to stop early. Only
/// `Disabled` is re-enterable: initializing for a new program resets here
/// before conditionally enabling again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Disabled = 0,
    Enabled = 1,
    Continuing = 2,
    Closing = 3,
}

impl CacheState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CacheState::Disabled,
            1 => CacheState::Enabled,
            2 => CacheState::Continuing,
            3 => CacheState::Closing,
            _ => unreachable!("invalid cache state tag"),
        }
    }
}

/// Outcome of [`TranslationCache::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// No cache file yet (or the cache is disabled): cold start.
    Cold,
    Loaded {
        entries: usize,
    },
    /// The three segments parsed but the jump-table snapshot did not; the
    /// segments were kept and the on-disk file was invalidated.
    Salvaged {
        entries: usize,
    },
    /// The file was corrupt or incompatible; it was truncated and the store
    /// left empty.
    Invalidated,
}

/// Admits at most one save at a time and lets callers block until no save is
/// in flight.
pub(crate) struct SaveGate {
    busy: Mutex<bool>,
    idle: Condvar,
}

impl SaveGate {
    pub(crate) fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn try_begin(&self) -> bool {
        let mut busy = self.busy.lock().unwrap();
        if *busy {
            return false;
        }
        *busy = true;
        true
    }

    pub(crate) fn begin(&self) {
        let mut busy = self.busy.lock().unwrap();
        while *busy {
            busy = self.idle.wait(busy).unwrap();
        }
        *busy = true;
    }

    pub(crate) fn end(&self) {
        *self.busy.lock().unwrap() = false;
        self.idle.notify_all();
    }

    pub(crate) fn wait_idle(&self) {
        let mut busy = self.busy.lock().unwrap();
        while *busy {
            busy = self.idle.wait(busy).unwrap();
        }
    }
}

/// Create parent directories and write a file image; on a mid-stream write
/// failure the file is truncated back to a valid (empty) prefix so a partial
/// image is never left behind.
pub(crate) fn write_file_image(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            warn!("failed to create cache directory {}: {err}", parent.display());
            return;
        }
    }
    let mut file = match fs::File::create(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("failed to create {}: {err}", path.display());
            return;
        }
    };
    if let Err(err) = file.write_all(bytes) {
        warn!("failed to write {}: {err}", path.display());
        let _ = file.set_len(0);
    }
}

/// Truncate a file to zero length, leaving a valid empty cache behind.
pub(crate) fn truncate_file(path: &Path) {
    match fs::OpenOptions::new().write(true).truncate(true).open(path) {
        Ok(_) => debug!("invalidated {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to invalidate {}: {err}", path.display()),
    }
}

#[derive(Default)]
struct Segments {
    infos: Vec<u8>,
    code: Vec<u8>,
    relocs: Vec<u8>,
    jump_table: JumpTableSnapshot,
}

pub struct TranslationCache {
    state: AtomicU8,
    feature_flags: u64,
    root: PathBuf,
    path: Mutex<Option<PathBuf>>,
    segments: Mutex<Segments>,
    save_gate: SaveGate,
}

impl TranslationCache {
    /// `root` is the directory caches are stored under; `feature_flags` is
    /// the running process's CPU capability bitmask. A cache saved under a
    /// different bitmask never loads.
    pub fn new(root: impl Into<PathBuf>, feature_flags: u64) -> Self {
        Self {
            state: AtomicU8::new(CacheState::Disabled as u8),
            feature_flags,
            root: root.into(),
            path: Mutex::new(None),
            segments: Mutex::new(Segments::default()),
            save_gate: SaveGate::new(),
        }
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `Enabled -> Continuing`: finish in-flight work, admit no new rejit
    /// cycles. No-op in any other state.
    pub fn wind_down(&self) {
        let _ = self.state.compare_exchange(
            CacheState::Enabled as u8,
            CacheState::Continuing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Signal in-flight parallel recompilation loops to stop early.
    pub fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        while current == CacheState::Enabled as u8 || current == CacheState::Continuing as u8 {
            match self.state.compare_exchange(
                current,
                CacheState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn disable(&self) {
        self.set_state(CacheState::Disabled);
    }

    pub fn feature_flags(&self) -> u64 {
        self.feature_flags
    }

    pub fn entry_count(&self) -> usize {
        self.segments.lock().unwrap().infos.len() / ENTRY_INFO_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Copies of the three segment buffers, for diagnostics and tests.
    pub fn segment_bytes(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let segs = self.segments.lock().unwrap();
        (segs.infos.clone(), segs.code.clone(), segs.relocs.clone())
    }

    pub fn jump_table_snapshot(&self) -> JumpTableSnapshot {
        self.segments.lock().unwrap().jump_table.clone()
    }

    /// Re-read the live jump table's persistable tables into the store, so
    /// the next save carries them.
    pub fn refresh_snapshot(&self, jump_table: &dyn JumpTableRuntime) {
        self.segments.lock().unwrap().jump_table = jump_table.snapshot();
    }

    /// Block until no save is in flight.
    pub fn wait_idle(&self) {
        self.save_gate.wait_idle();
    }

    /// Truncate the on-disk cache file to zero length. The in-memory buffers
    /// are left alone.
    pub fn invalidate(&self) {
        if let Some(path) = self.path() {
            truncate_file(&path);
        }
    }

    fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    fn clear_in_memory(&self) {
        let mut segs = self.segments.lock().unwrap();
        segs.infos.clear();
        segs.code.clear();
        segs.relocs.clear();
        segs.jump_table = JumpTableSnapshot::default();
    }

    /// Reset for a new program identity. Blocks until any in-flight save
    /// (cache or profile) completes, clears all in-memory state including the
    /// profiler's map, derives the per-program cache paths, and either leaves
    /// the cache disabled (empty program id, or `enabled == false`) or
    /// enables it and loads both files.
    pub fn initialize(
        &self,
        profiler: &Profiler,
        program_id: &str,
        program_version: &str,
        enabled: bool,
    ) -> Result<LoadStatus> {
        self.save_gate.wait_idle();
        profiler.wait_idle();

        self.set_state(CacheState::Disabled);
        self.clear_in_memory();
        profiler.clear_entries();

        if !enabled || program_id.is_empty() {
            *self.path.lock().unwrap() = None;
            profiler.set_path(None);
            return Ok(LoadStatus::Cold);
        }

        let dir = self.root.join(program_id);
        *self.path.lock().unwrap() =
            Some(dir.join(format!("{program_version}.{CACHE_FILE_EXTENSION}")));
        profiler.set_path(Some(
            dir.join(format!("{program_version}.{PROFILE_FILE_EXTENSION}")),
        ));

        self.set_state(CacheState::Enabled);
        let status = self.load()?;
        profiler.load()?;
        Ok(status)
    }

    /// Load the on-disk cache. An absent or empty file is a cold start, not
    /// an error. A corrupt, incompatible, or unreadable file truncates the
    /// file (best effort) and leaves the store empty; it is never surfaced
    /// as a failure.
    pub fn load(&self) -> Result<LoadStatus> {
        let Some(path) = self.path() else {
            return Ok(LoadStatus::Cold);
        };
        let compressed = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LoadStatus::Cold),
            Err(err) => {
                // An unreadable file is no better than a corrupt one.
                warn!("translation cache unreadable ({err}); starting cold");
                truncate_file(&path);
                return Ok(LoadStatus::Invalidated);
            }
        };
        if compressed.is_empty() {
            return Ok(LoadStatus::Cold);
        }

        match self.parse_and_commit(&compressed, &path) {
            Ok(status) => Ok(status),
            Err(err) => {
                warn!("translation cache unusable ({err}); starting cold");
                self.clear_in_memory();
                truncate_file(&path);
                Ok(LoadStatus::Invalidated)
            }
        }
    }

    /// Two-phase parse: validate and copy the three segments first, then
    /// decode the jump-table snapshot. A snapshot failure keeps the segments
    /// (best-effort salvage) but still invalidates the file; a segment
    /// failure propagates so the caller clears everything.
    fn parse_and_commit(&self, compressed: &[u8], path: &Path) -> Result<LoadStatus> {
        let payload = format::open_envelope(compressed)?;
        let mut cursor = Cursor::new(payload.as_slice());
        let header = CacheHeader::decode(&mut cursor)?;
        if header.feature_flags != self.feature_flags {
            return Err(CacheError::FeatureMismatch {
                cached: header.feature_flags,
                host: self.feature_flags,
            });
        }

        let infos_len = header.infos_len as usize;
        if infos_len % ENTRY_INFO_SIZE != 0 {
            return Err(CacheError::Corrupt("entry-info segment length"));
        }
        let infos = cursor.read_exact_vec(infos_len)?;
        let code = cursor.read_exact_vec(header.code_len as usize)?;
        let relocs = cursor.read_exact_vec(header.relocs_len as usize)?;
        let entries = infos_len / ENTRY_INFO_SIZE;

        let tail = &payload[cursor.position() as usize..];
        let mut tail_cursor = Cursor::new(tail);
        let snapshot = match JumpTableSnapshot::decode(&mut tail_cursor) {
            Ok(snapshot) if tail_cursor.position() as usize == tail.len() => Some(snapshot),
            Ok(_) => None,
            Err(_) => None,
        };

        let mut segs = self.segments.lock().unwrap();
        segs.infos = infos;
        segs.code = code;
        segs.relocs = relocs;
        match snapshot {
            Some(snapshot) => {
                segs.jump_table = snapshot;
                debug!("translation cache loaded ({entries} entries)");
                Ok(LoadStatus::Loaded { entries })
            }
            None => {
                segs.jump_table = JumpTableSnapshot::default();
                drop(segs);
                warn!("jump-table snapshot unreadable; kept {entries} entries, invalidated file");
                truncate_file(path);
                Ok(LoadStatus::Salvaged { entries })
            }
        }
    }

    /// Commit one translated function to the shared segments. Called
    /// concurrently by recompilation workers; the single coarse lock only
    /// covers the brief memory copies, not translation itself.
    pub fn append(&self, address: u64, high_quality: bool, builder: &EntryBuilder) -> Result<()> {
        let code_len: u32 = builder
            .code()
            .len()
            .try_into()
            .map_err(|_| CacheError::Corrupt("function code too large"))?;
        let reloc_count: u32 = builder
            .relocs()
            .len()
            .try_into()
            .map_err(|_| CacheError::Corrupt("too many relocations"))?;
        let info = EntryInfo {
            address,
            high_quality,
            code_len,
            reloc_count,
        };

        let mut segs = self.segments.lock().unwrap();
        info.encode(&mut segs.infos)?;
        segs.code.extend_from_slice(builder.code());
        for reloc in builder.relocs() {
            reloc.encode(&mut segs.relocs)?;
        }
        Ok(())
    }

    /// Turn every cached entry into a runnable function before the guest
    /// starts: patch relocations, map the code executable, and key the result
    /// by guest address. Afterwards the jump table is seeded from the
    /// persisted snapshot and the snapshot re-derived from the initialized
    /// runtime, so the next save carries fresh tables.
    ///
    /// Errors here are fatal to materialization: they mean the cache is
    /// self-inconsistent or was built against an incompatible binary.
    pub fn materialize_all(
        &self,
        functions: &mut FunctionTable,
        page_table_base: u64,
        mapper: &dyn ExecutableMapper,
        jump_table: &dyn JumpTableRuntime,
        delegates: &dyn DelegateTable,
    ) -> Result<usize> {
        assert!(functions.is_empty(), "function table must start empty");

        let mut segs = self.segments.lock().unwrap();
        let segs = &mut *segs;
        if segs.infos.len() % ENTRY_INFO_SIZE != 0 {
            return Err(CacheError::SegmentCursorMismatch);
        }

        let targets = RelocTargets {
            page_table: page_table_base,
            jump_table: jump_table.base_pointer(),
            dynamic_table: jump_table.dynamic_base_pointer(),
        };

        let entry_count = segs.infos.len() / ENTRY_INFO_SIZE;
        let mut infos_cursor = Cursor::new(segs.infos.as_slice());
        let mut relocs_cursor = Cursor::new(segs.relocs.as_slice());
        let mut code_pos = 0usize;

        for _ in 0..entry_count {
            let info = EntryInfo::decode(&mut infos_cursor)?;

            let code_end = code_pos
                .checked_add(info.code_len as usize)
                .filter(|&end| end <= segs.code.len())
                .ok_or(CacheError::SegmentCursorMismatch)?;
            let mut code = segs.code[code_pos..code_end].to_vec();
            code_pos = code_end;

            let reloc_count = info.reloc_count as usize;
            let mut relocs = Vec::with_capacity(reloc_count.min(64));
            for _ in 0..reloc_count {
                relocs.push(RelocEntry::decode(&mut relocs_cursor)?);
            }

            apply_relocations(&mut code, &relocs, &targets, delegates)?;
            let ptr = mapper.map(&code)?;
            functions.insert(
                info.address,
                TranslatedFunction {
                    ptr,
                    high_quality: info.high_quality,
                },
            );
        }

        // All three cursors must land exactly on their segment ends;
        // anything else means the segments disagree with each other.
        if infos_cursor.position() as usize != segs.infos.len()
            || code_pos != segs.code.len()
            || relocs_cursor.position() as usize != segs.relocs.len()
        {
            return Err(CacheError::SegmentCursorMismatch);
        }
        drop(infos_cursor);
        drop(relocs_cursor);

        jump_table.initialize(&segs.jump_table, functions);
        segs.jump_table = jump_table.snapshot();
        Ok(functions.len())
    }

    fn build_file_image(&self) -> Result<Vec<u8>> {
        let segs = self.segments.lock().unwrap();
        let header = CacheHeader {
            feature_flags: self.feature_flags,
            infos_len: segs
                .infos
                .len()
                .try_into()
                .map_err(|_| CacheError::Corrupt("entry-info segment too large"))?,
            code_len: segs
                .code
                .len()
                .try_into()
                .map_err(|_| CacheError::Corrupt("code segment too large"))?,
            relocs_len: segs
                .relocs
                .len()
                .try_into()
                .map_err(|_| CacheError::Corrupt("relocation segment too large"))?,
        };

        let mut payload =
            Vec::with_capacity(HEADER_SIZE + segs.infos.len() + segs.code.len() + segs.relocs.len());
        header.encode(&mut payload)?;
        payload.extend_from_slice(&segs.infos);
        payload.extend_from_slice(&segs.code);
        payload.extend_from_slice(&segs.relocs);
        segs.jump_table.encode(&mut payload)?;
        drop(segs);

        format::seal_envelope(&payload)
    }

    fn save_now(&self) {
        let Some(path) = self.path() else {
            return;
        };
        match self.build_file_image() {
            Ok(image) => {
                write_file_image(&path, &image);
                debug!("translation cache saved to {}", path.display());
            }
            Err(err) => warn!("failed to serialize translation cache: {err}"),
        }
    }

    /// Kick off a background save. At most one save runs at a time; if one is
    /// already in flight this call is a no-op (the in-flight save will pick
    /// up any appends that happened before its buffer snapshot).
    pub fn save_async(self: &Arc<Self>) {
        if !self.save_gate.try_begin() {
            return;
        }
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("jit-cache-save".into())
            .spawn(move || {
                this.save_now();
                this.save_gate.end();
            });
        if spawned.is_err() {
            self.save_gate.end();
            warn!("failed to spawn translation cache save thread");
        }
    }

    /// Save on the calling thread. Used at shutdown and in tests.
    pub fn save_blocking(&self) {
        self.save_gate.begin();
        self.save_now();
        self.save_gate.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reloc::{Symbol, SymbolKind};

    #[test]
    fn state_machine_transitions() {
        let cache = TranslationCache::new("/nonexistent", 0);
        assert_eq!(cache.state(), CacheState::Disabled);

        // wind_down/close are no-ops while disabled.
        cache.wind_down();
        assert_eq!(cache.state(), CacheState::Disabled);
        cache.close();
        assert_eq!(cache.state(), CacheState::Disabled);

        cache.set_state(CacheState::Enabled);
        cache.wind_down();
        assert_eq!(cache.state(), CacheState::Continuing);
        // Continuing is one-way; wind_down does not re-enter it.
        cache.wind_down();
        assert_eq!(cache.state(), CacheState::Continuing);
        cache.close();
        assert_eq!(cache.state(), CacheState::Closing);
        cache.disable();
        assert_eq!(cache.state(), CacheState::Disabled);
    }

    #[test]
    fn append_grows_all_three_segments() {
        let cache = TranslationCache::new("/nonexistent", 0);
        let mut builder = EntryBuilder::new();
        builder.write_code(&[0x90; 32]);
        builder.push_reloc(8, Symbol::new(SymbolKind::DelegateTableIndex, 0));
        builder.push_reloc(16, Symbol::new(SymbolKind::Special, 0));

        cache.append(0x1000, false, &builder).unwrap();
        cache.append(0x2000, true, &builder).unwrap();

        assert_eq!(cache.entry_count(), 2);
        let (infos, code, relocs) = cache.segment_bytes();
        assert_eq!(infos.len(), 2 * ENTRY_INFO_SIZE);
        assert_eq!(code.len(), 64);
        assert_eq!(relocs.len(), 4 * crate::reloc::RELOC_ENTRY_SIZE);
    }
}
