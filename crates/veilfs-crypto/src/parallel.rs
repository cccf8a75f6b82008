//! Threshold-based dispatch for per-block work.
//!
//! Small groups run serially, medium groups as one preallocated batch,
//! large groups across scoped worker threads. The driver is a pure
//! function of the worker and the group size: threads are spawned per
//! call and joined before it returns, and no pool outlives a call.

use std::thread;

/// Below this many blocks, plain serial processing wins.
pub const BATCH_THRESHOLD: usize = 2;
/// At or above this many blocks, worker threads pay off.
pub const PARALLEL_THRESHOLD: usize = 4;
/// Hard cap on worker threads per call.
pub const MAX_WORKERS: usize = 16;
/// Parallel dispatch needs at least this many CPUs to help.
const MIN_CPUS: usize = 2;

/// Number of worker threads a group of `group_size` blocks would use.
pub fn worker_count(group_size: usize) -> usize {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    if cpus < MIN_CPUS || group_size < PARALLEL_THRESHOLD {
        return 1;
    }
    MAX_WORKERS.min(cpus).min(group_size)
}

/// Runs `worker(i)` for every `i` in `0..group_size` and returns the
/// results in index order regardless of scheduling.
pub fn process<T, F>(group_size: usize, worker: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let workers = worker_count(group_size);
    if workers <= 1 {
        if group_size < BATCH_THRESHOLD {
            return (0..group_size).map(worker).collect();
        }
        return process_batch(group_size, worker);
    }

    // Contiguous shards of roughly equal size, one scoped thread each.
    let shard = group_size.div_ceil(workers);
    let mut out: Vec<Option<T>> = Vec::with_capacity(group_size);
    out.resize_with(group_size, || None);

    thread::scope(|s| {
        for (w, chunk) in out.chunks_mut(shard).enumerate() {
            let worker = &worker;
            let base = w * shard;
            s.spawn(move || {
                for (i, slot) in chunk.iter_mut().enumerate() {
                    *slot = Some(worker(base + i));
                }
            });
        }
    });

    out.into_iter()
        .map(|slot| slot.expect("every shard was processed"))
        .collect()
}

/// Single-threaded, but with the output preallocated up front so the
/// per-block bookkeeping of the serial path is skipped.
fn process_batch<T, F>(group_size: usize, worker: F) -> Vec<T>
where
    F: Fn(usize) -> T,
{
    let mut out = Vec::with_capacity(group_size);
    out.extend((0..group_size).map(worker));
    out
}
