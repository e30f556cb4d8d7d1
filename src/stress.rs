//! Concurrent load generator for the inode cache.
//!
//! Every worker hammers the same cache with lookups over a fixed key space and drops each handle
//! immediately. Afterwards the cache table is checked for duplicate identities and for overflowing
//! its capacity.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use ananas_vfs::cache::{ICache, ICacheError, ICacheStats};
use ananas_vfs::config::ICacheConfig;
use ananas_vfs::fs::memfs::{MemFs, ROOT_ADDR};
use ananas_vfs::fs::{FsId, InodeAddr};

/// Parameters of one run.
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    pub threads: usize,
    pub ops: usize,
    pub keys: u64,
}

#[derive(Debug, Error)]
pub enum StressError {
    #[error("Failed to build the filesystem: {0}")]
    Setup(#[from] std::io::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] ICacheError),

    #[error("Cache invariant violated: {0}")]
    Invariant(String),

    #[error("A worker thread panicked.")]
    WorkerPanicked,
}

/// Outcome of a run.
#[derive(Debug)]
pub struct StressReport {
    pub elapsed: Duration,
    pub stats: ICacheStats,
    pub exhausted: u64,
    pub loads: usize,
}

/// Xorshift generator, seeded per worker.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn build_fs(keys: u64) -> Result<(Arc<MemFs>, Vec<InodeAddr>), StressError> {
    let fs = Arc::new(MemFs::new(FsId(0)));
    let mut addrs = Vec::new();
    for key in 0..keys {
        addrs.push(fs.create(ROOT_ADDR, format!("f{key}"), &key.to_le_bytes())?);
    }
    Ok((fs, addrs))
}

/// Check that no identity occupies two slots and the table is within capacity.
fn check_table(cache: &ICache<Arc<MemFs>>) -> Result<(), StressError> {
    let dump = cache.dump();
    if dump.len() > cache.capacity() {
        return Err(StressError::Invariant(format!(
            "{} slots in use with capacity {}",
            dump.len(),
            cache.capacity()
        )));
    }
    let mut seen = FxHashSet::default();
    for entry in &dump {
        if !seen.insert(entry.identity) {
            return Err(StressError::Invariant(format!(
                "identity {} cached twice",
                entry.identity
            )));
        }
    }
    Ok(())
}

fn worker(
    cache: &ICache<Arc<MemFs>>,
    fs: &MemFs,
    addrs: &[InodeAddr],
    seed: u64,
    ops: usize,
) -> Result<u64, StressError> {
    let mut rng = XorShift(seed | 1);
    let mut exhausted = 0;
    for _ in 0..ops {
        let Ok(index) = usize::try_from(rng.next() % addrs.len() as u64) else {
            continue;
        };
        let identity = fs.identity(addrs[index]);
        match cache.get_or_load(identity) {
            Ok(handle) => {
                if handle.identity() != identity {
                    return Err(StressError::Invariant(format!(
                        "asked for {identity}, got {}",
                        handle.identity()
                    )));
                }
            }
            Err(ICacheError::ResourceExhausted { .. }) => exhausted += 1,
            Err(e) => return Err(e.into()),
        }
        if cache.len() > cache.capacity() {
            return Err(StressError::Invariant("capacity exceeded".to_owned()));
        }
    }
    Ok(exhausted)
}

/// Run `workload` against a fresh cache configured by `config`.
pub fn run(config: &ICacheConfig, workload: Workload) -> Result<StressReport, StressError> {
    let (fs, addrs) = build_fs(workload.keys)?;
    let cache = ICache::new(
        Arc::clone(&fs),
        config,
        Arc::new(ananas_vfs::cache::NoNames),
    );
    info!(
        threads = workload.threads,
        ops = workload.ops,
        keys = workload.keys,
        capacity = cache.capacity(),
        "starting stress run"
    );

    let started = Instant::now();
    let results: Vec<Result<u64, StressError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workload.threads)
            .map(|t| {
                let cache = &cache;
                let fs = &*fs;
                let addrs = &addrs;
                std::thread::Builder::new()
                    .name(format!("stress-{t}"))
                    .spawn_scoped(scope, move || {
                        worker(cache, fs, addrs, t as u64 + 1, workload.ops)
                    })
            })
            .collect();
        handles
            .into_iter()
            .map(|spawned| match spawned {
                Ok(handle) => handle.join().map_err(|_| StressError::WorkerPanicked)?,
                Err(e) => Err(StressError::Setup(e)),
            })
            .collect()
    });
    let elapsed = started.elapsed();

    let mut exhausted = 0;
    for result in results {
        exhausted += result?;
    }
    check_table(&cache)?;

    let report = StressReport {
        elapsed,
        stats: cache.stats(),
        exhausted,
        loads: fs.total_loads(),
    };
    if exhausted > 0 {
        warn!(exhausted, "some lookups found the cache exhausted");
    }
    debug!(table = ?cache.dump(), "final cache table");
    Ok(report)
}
