//! Execution profile: which guest addresses ran, in which mode, and whether
//! they were compiled at high quality. Persisted independently of the code
//! cache so a crash between saves loses profile data, never code integrity.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::format::{self, PROFILE_MAGIC, PROFILE_VERSION};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::runtime::ExecMode;
use crate::store::{truncate_file, write_file_image, CacheState, LoadStatus, SaveGate};

pub const AUTOSAVE_PERIOD: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileEntry {
    pub mode: ExecMode,
    pub high_quality: bool,
}

struct AutosaveHandle {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: thread::JoinHandle<()>,
}

pub struct Profiler {
    entries: Mutex<FxHashMap<u64, ProfileEntry>>,
    path: Mutex<Option<PathBuf>>,
    save_gate: SaveGate,
    autosave: Mutex<Option<AutosaveHandle>>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            path: Mutex::new(None),
            save_gate: SaveGate::new(),
            autosave: Mutex::new(None),
        }
    }

    /// Record a newly-executed address at low quality.
    ///
    /// Calling this for an address already present is a caller bug: the map
    /// never overwrites an existing key with a low-quality entry.
    pub fn add_entry(&self, address: u64, mode: ExecMode) {
        let mut entries = self.entries.lock().unwrap();
        let prev = entries.insert(
            address,
            ProfileEntry {
                mode,
                high_quality: false,
            },
        );
        assert!(prev.is_none(), "profile entry {address:#x} already exists");
    }

    /// Upgrade an existing entry to high quality.
    ///
    /// Calling this for an address not already present is a caller bug; an
    /// existing key is only ever overwritten by a high-quality entry.
    pub fn update_entry(&self, address: u64, mode: ExecMode) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&address)
            .unwrap_or_else(|| panic!("profile entry {address:#x} does not exist"));
        *entry = ProfileEntry {
            mode,
            high_quality: true,
        };
    }

    pub fn clear_entries(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn get(&self, address: u64) -> Option<ProfileEntry> {
        self.entries.lock().unwrap().get(&address).copied()
    }

    /// Sorted copy of the map, for the recompilation pass and for
    /// deterministic serialization.
    pub fn snapshot_entries(&self) -> Vec<(u64, ProfileEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(&addr, &entry)| (addr, entry))
            .collect();
        entries.sort_unstable_by_key(|&(addr, _)| addr);
        entries
    }

    pub(crate) fn set_path(&self, path: Option<PathBuf>) {
        *self.path.lock().unwrap() = path;
    }

    fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    /// Block until no profile save is in flight.
    pub fn wait_idle(&self) {
        self.save_gate.wait_idle();
    }

    fn build_file_image(&self) -> Result<Vec<u8>> {
        let entries = self.snapshot_entries();
        let count: u32 = entries
            .len()
            .try_into()
            .map_err(|_| CacheError::Corrupt("too many profile entries"))?;

        let mut payload = Vec::with_capacity(16 + entries.len() * 10);
        payload.write_bytes(PROFILE_MAGIC)?;
        payload.write_u32_le(PROFILE_VERSION)?;
        payload.write_u32_le(count)?;
        for (address, entry) in &entries {
            payload.write_u64_le(*address)?;
            payload.write_u8(entry.mode as u8)?;
            payload.write_u8(entry.high_quality as u8)?;
        }
        format::seal_envelope(&payload)
    }

    fn parse_and_commit(&self, compressed: &[u8]) -> Result<usize> {
        let payload = format::open_envelope(compressed)?;
        let mut cursor = Cursor::new(payload.as_slice());

        let mut magic = [0u8; 8];
        cursor
            .read_exact(&mut magic)
            .map_err(|_| CacheError::Corrupt("profile too short"))?;
        if &magic != PROFILE_MAGIC {
            return Err(CacheError::InvalidMagic);
        }
        let version = cursor.read_u32_le()?;
        if version != PROFILE_VERSION {
            return Err(CacheError::UnsupportedVersion(version));
        }

        let count = cursor.read_u32_le()? as usize;
        let mut map = FxHashMap::default();
        map.reserve(count.min(1 << 20));
        for _ in 0..count {
            let address = cursor.read_u64_le()?;
            let mode = ExecMode::from_u8(cursor.read_u8()?)
                .ok_or(CacheError::Corrupt("unknown execution mode"))?;
            let high_quality = match cursor.read_u8()? {
                0 => false,
                1 => true,
                _ => return Err(CacheError::Corrupt("invalid quality flag")),
            };
            if map
                .insert(
                    address,
                    ProfileEntry {
                        mode,
                        high_quality,
                    },
                )
                .is_some()
            {
                return Err(CacheError::Corrupt("duplicate profile entry"));
            }
        }
        if cursor.position() as usize != payload.len() {
            return Err(CacheError::Corrupt("trailing profile bytes"));
        }

        let len = map.len();
        *self.entries.lock().unwrap() = map;
        Ok(len)
    }

    /// Load the on-disk profile. Same recovery policy as the code cache:
    /// corruption truncates the file and continues with an empty map.
    pub fn load(&self) -> Result<LoadStatus> {
        let Some(path) = self.path() else {
            return Ok(LoadStatus::Cold);
        };
        let compressed = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoadStatus::Cold)
            }
            Err(err) => {
                warn!("profile unreadable ({err}); starting cold");
                truncate_file(&path);
                return Ok(LoadStatus::Invalidated);
            }
        };
        if compressed.is_empty() {
            return Ok(LoadStatus::Cold);
        }

        match self.parse_and_commit(&compressed) {
            Ok(entries) => {
                debug!("profile loaded ({entries} entries)");
                Ok(LoadStatus::Loaded { entries })
            }
            Err(err) => {
                warn!("profile unusable ({err}); starting cold");
                self.clear_entries();
                truncate_file(&path);
                Ok(LoadStatus::Invalidated)
            }
        }
    }

    fn save_now(&self) {
        let Some(path) = self.path() else {
            return;
        };
        match self.build_file_image() {
            Ok(image) => write_file_image(&path, &image),
            Err(err) => warn!("failed to serialize profile: {err}"),
        }
    }

    pub fn save_async(self: &Arc<Self>) {
        if !self.save_gate.try_begin() {
            return;
        }
        let this = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("jit-profile-save".into())
            .spawn(move || {
                this.save_now();
                this.save_gate.end();
            });
        if spawned.is_err() {
            self.save_gate.end();
            warn!("failed to spawn profile save thread");
        }
    }

    pub fn save_blocking(&self) {
        self.save_gate.begin();
        self.save_now();
        self.save_gate.end();
    }

    /// Start the periodic autosave tick. The tick only saves while `state`
    /// reports the owning cache as `Enabled` or `Continuing`.
    pub fn start<F>(self: &Arc<Self>, state: F)
    where
        F: Fn() -> CacheState + Send + 'static,
    {
        self.start_with_period(AUTOSAVE_PERIOD, state);
    }

    pub fn start_with_period<F>(self: &Arc<Self>, period: Duration, state: F)
    where
        F: Fn() -> CacheState + Send + 'static,
    {
        let mut autosave = self.autosave.lock().unwrap();
        if autosave.is_some() {
            return;
        }

        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);
        // Weak, so an owner that forgets to call stop() can still drop the
        // profiler; the tick then exits on its next wakeup.
        let this = Arc::downgrade(self);
        let thread = thread::Builder::new()
            .name("jit-profile-autosave".into())
            .spawn(move || {
                let (lock, cv) = &*stop_for_thread;
                let mut stopped = lock.lock().unwrap();
                while !*stopped {
                    let (guard, timeout) = cv.wait_timeout(stopped, period).unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    if !timeout.timed_out() {
                        continue;
                    }
                    if !matches!(state(), CacheState::Enabled | CacheState::Continuing) {
                        continue;
                    }
                    let Some(profiler) = this.upgrade() else {
                        break;
                    };
                    drop(stopped);
                    profiler.save_blocking();
                    stopped = lock.lock().unwrap();
                }
            });
        match thread {
            Ok(thread) => *autosave = Some(AutosaveHandle { stop, thread }),
            Err(err) => warn!("failed to spawn profile autosave thread: {err}"),
        }
    }

    /// Disable the autosave tick. A tick already executing finishes under its
    /// own gate.
    pub fn stop(&self) {
        let handle = self.autosave.lock().unwrap().take();
        if let Some(handle) = handle {
            *handle.stop.0.lock().unwrap() = true;
            handle.stop.1.notify_all();
            let _ = handle.thread.join();
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_update_leaves_one_high_quality_entry() {
        let profiler = Profiler::new();
        profiler.add_entry(0x1000, ExecMode::Protected);
        assert_eq!(
            profiler.get(0x1000),
            Some(ProfileEntry {
                mode: ExecMode::Protected,
                high_quality: false
            })
        );

        profiler.update_entry(0x1000, ExecMode::Protected);
        assert_eq!(profiler.len(), 1);
        assert_eq!(
            profiler.get(0x1000),
            Some(ProfileEntry {
                mode: ExecMode::Protected,
                high_quality: true
            })
        );
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn duplicate_add_is_a_contract_violation() {
        let profiler = Profiler::new();
        profiler.add_entry(0x1000, ExecMode::Protected);
        profiler.add_entry(0x1000, ExecMode::Long);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn update_of_missing_entry_is_a_contract_violation() {
        let profiler = Profiler::new();
        profiler.update_entry(0x2000, ExecMode::Protected);
    }

    #[test]
    fn snapshot_is_sorted_by_address() {
        let profiler = Profiler::new();
        profiler.add_entry(0x3000, ExecMode::Long);
        profiler.add_entry(0x1000, ExecMode::Protected);
        profiler.add_entry(0x2000, ExecMode::Real);

        let addrs: Vec<u64> = profiler
            .snapshot_entries()
            .iter()
            .map(|&(addr, _)| addr)
            .collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jtp");

        let profiler = Profiler::new();
        profiler.set_path(Some(path.clone()));
        profiler.add_entry(0x1000, ExecMode::Protected);
        profiler.add_entry(0x2000, ExecMode::Long);
        profiler.update_entry(0x2000, ExecMode::Long);
        profiler.save_blocking();

        let reloaded = Profiler::new();
        reloaded.set_path(Some(path));
        assert_eq!(reloaded.load().unwrap(), LoadStatus::Loaded { entries: 2 });
        assert_eq!(
            reloaded.get(0x2000),
            Some(ProfileEntry {
                mode: ExecMode::Long,
                high_quality: true
            })
        );
    }

    #[test]
    fn corrupt_profile_invalidates_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jtp");

        let profiler = Profiler::new();
        profiler.set_path(Some(path.clone()));
        profiler.add_entry(0x1000, ExecMode::Protected);
        profiler.save_blocking();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let reloaded = Profiler::new();
        reloaded.set_path(Some(path.clone()));
        assert_eq!(reloaded.load().unwrap(), LoadStatus::Invalidated);
        assert!(reloaded.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn unreadable_profile_degrades_to_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the profile path makes every read fail with a
        // non-NotFound error.
        let path = dir.path().join("test.jtp");
        std::fs::create_dir_all(&path).unwrap();

        let profiler = Profiler::new();
        profiler.set_path(Some(path));
        assert_eq!(profiler.load().unwrap(), LoadStatus::Invalidated);
        assert!(profiler.is_empty());
    }

    #[test]
    fn autosave_tick_writes_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jtp");

        let profiler = Arc::new(Profiler::new());
        profiler.set_path(Some(path.clone()));
        profiler.add_entry(0x1000, ExecMode::Protected);
        profiler.start_with_period(Duration::from_millis(10), || CacheState::Enabled);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        profiler.stop();
        assert!(path.exists());
    }

    #[test]
    fn autosave_tick_is_inert_while_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jtp");

        let profiler = Arc::new(Profiler::new());
        profiler.set_path(Some(path.clone()));
        profiler.add_entry(0x1000, ExecMode::Protected);
        profiler.start_with_period(Duration::from_millis(10), || CacheState::Disabled);

        thread::sleep(Duration::from_millis(120));
        profiler.stop();
        assert!(!path.exists());
    }
}
