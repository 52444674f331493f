//! Profile-driven recompilation: brings the materialized function set up to
//! date with the execution profile gathered on a prior run, translating in
//! parallel and feeding results back into the cache store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::builder::EntryBuilder;
use crate::error::{CacheError, Result};
use crate::profiler::{ProfileEntry, Profiler};
use crate::runtime::{
    ExecutableMapper, FunctionTable, JumpTableRuntime, Quality, TranslatedFunction, Translator,
};
use crate::store::{CacheState, TranslationCache};

#[derive(Debug, Clone)]
pub struct RejitConfig {
    /// Worker threads for the parallel pass. Defaults to half the available
    /// hardware threads, minimum one.
    pub threads: Option<usize>,
    /// Progress-report interval.
    pub report_period: Duration,
}

impl Default for RejitConfig {
    fn default() -> Self {
        Self {
            threads: None,
            report_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RejitStats {
    /// Profiled addresses translated for the first time this pass.
    pub translated: usize,
    /// Low-quality functions re-translated at high quality.
    pub rejitted: usize,
    /// Total profiled addresses considered.
    pub profiled: usize,
}

fn default_worker_count() -> usize {
    let available = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    (available / 2).max(1)
}

/// Run one recompilation pass over the profile.
///
/// For every profiled address: translate it now if it was never materialized,
/// re-translate at high quality if the profile upgraded it, otherwise leave
/// it alone. Workers poll the cache state after each item and stop admitting
/// new items once it leaves `Enabled`; in-flight translations finish. If the
/// pass produced any new code, the jump-table snapshot is refreshed and an
/// asynchronous save is triggered.
pub fn rejit_from_profile<T, M, J>(
    cache: &Arc<TranslationCache>,
    profiler: &Profiler,
    functions: &Mutex<FunctionTable>,
    translator: &T,
    mapper: &M,
    jump_table: &J,
    config: &RejitConfig,
) -> Result<RejitStats>
where
    T: Translator + Sync + ?Sized,
    M: ExecutableMapper + Sync + ?Sized,
    J: JumpTableRuntime + Sync,
{
    let entries = profiler.snapshot_entries();
    if entries.is_empty() {
        return Ok(RejitStats::default());
    }

    let profiled = entries.len();
    let preexisting = functions.lock().unwrap().len();
    let translated = Arc::new(AtomicUsize::new(0));
    let rejitted = Arc::new(AtomicUsize::new(0));
    let stop = AtomicBool::new(false);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads.unwrap_or_else(default_worker_count))
        .thread_name(|i| format!("jit-rejit-{i}"))
        .build()
        .map_err(|err| CacheError::WorkerPool(err.to_string()))?;

    let reporter = spawn_reporter(
        config.report_period,
        preexisting,
        profiled,
        Arc::clone(&translated),
        Arc::clone(&rejitted),
    );

    pool.install(|| {
        entries.par_iter().for_each(|&(address, entry)| {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            if let Err(err) = process_entry(
                cache, functions, translator, mapper, jump_table, address, entry, &translated,
                &rejitted,
            ) {
                warn!("rejit of {address:#x} failed: {err}");
            }
            if cache.state() != CacheState::Enabled {
                stop.store(true, Ordering::Relaxed);
            }
        });
    });

    reporter.finish();

    let stats = RejitStats {
        translated: translated.load(Ordering::Relaxed),
        rejitted: rejitted.load(Ordering::Relaxed),
        profiled,
    };
    info!(
        "jit cache: {} newly translated, {} rejitted of {} profiled functions",
        stats.translated, stats.rejitted, stats.profiled
    );

    if stats.translated + stats.rejitted > 0 {
        cache.refresh_snapshot(jump_table);
        cache.save_async();
    }
    Ok(stats)
}

#[allow(clippy::too_many_arguments)]
fn process_entry<T, M, J>(
    cache: &Arc<TranslationCache>,
    functions: &Mutex<FunctionTable>,
    translator: &T,
    mapper: &M,
    jump_table: &J,
    address: u64,
    entry: ProfileEntry,
    translated: &AtomicUsize,
    rejitted: &AtomicUsize,
) -> Result<()>
where
    T: Translator + Sync + ?Sized,
    M: ExecutableMapper + Sync + ?Sized,
    J: JumpTableRuntime + Sync + ?Sized,
{
    let existing = functions.lock().unwrap().get(&address).copied();
    let (quality, is_rejit) = match existing {
        None => (Quality::from_high(entry.high_quality), false),
        Some(function) if entry.high_quality && !function.high_quality => (Quality::High, true),
        Some(_) => return Ok(()),
    };

    let code = translator.translate(address, entry.mode, quality)?;
    let builder = EntryBuilder::from(code);
    let ptr = mapper.map(builder.code())?;
    let function = TranslatedFunction {
        ptr,
        high_quality: quality.is_high(),
    };

    functions.lock().unwrap().insert(address, function);
    if quality.is_high() {
        jump_table.register(address, &function);
    }
    cache.append(address, quality.is_high(), &builder)?;

    if is_rejit {
        rejitted.fetch_add(1, Ordering::Relaxed);
    } else {
        translated.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

struct Reporter {
    done: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reporter {
    fn finish(mut self) {
        *self.done.0.lock().unwrap() = true;
        self.done.1.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn spawn_reporter(
    period: Duration,
    preexisting: usize,
    profiled: usize,
    translated: Arc<AtomicUsize>,
    rejitted: Arc<AtomicUsize>,
) -> Reporter {
    let done = Arc::new((Mutex::new(false), Condvar::new()));
    let done_for_thread = Arc::clone(&done);
    let thread = thread::Builder::new()
        .name("jit-rejit-report".into())
        .spawn(move || {
            let (lock, cv) = &*done_for_thread;
            let mut finished = lock.lock().unwrap();
            while !*finished {
                let (guard, _timeout) = cv.wait_timeout(finished, period).unwrap();
                finished = guard;
                if *finished {
                    break;
                }
                info!(
                    "jit cache: {} of {} profiled functions ready ({} rejit)",
                    preexisting + translated.load(Ordering::Relaxed),
                    profiled,
                    rejitted.load(Ordering::Relaxed)
                );
            }
        })
        .ok();
    Reporter { done, thread }
}
