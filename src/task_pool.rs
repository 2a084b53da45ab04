//! Bounded worker-pool execution of independent indexed tasks.
//!
//! Both statistical testers fan out self-contained units of work — one
//! permutation fit or one feature-combination fit. Results land in a
//! pre-sized vector slot named by the task index, so output ordering is
//! deterministic regardless of completion order. With the `parallel`
//! feature a rayon pool with a fixed worker count executes the tasks;
//! otherwise they run sequentially on the calling thread.

/// Run `num_tasks` independent tasks with at most `max_workers` running
/// concurrently, returning results in task-index order.
///
/// Each task receives its own index and must be fully self-contained; the
/// closure is shared by reference across workers.
#[cfg_attr(not(feature = "parallel"), allow(unused_variables))]
pub fn run_indexed<T, F>(max_workers: usize, num_tasks: usize, task: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        if num_tasks > 1 {
            let workers = max_workers.max(1).min(num_tasks);
            match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                Ok(pool) => {
                    return pool.install(|| (0..num_tasks).into_par_iter().map(&task).collect());
                }
                Err(error) => {
                    log::warn!("worker pool unavailable, running sequentially: {}", error);
                }
            }
        }
    }

    (0..num_tasks).map(task).collect()
}

/// Resolve a configured thread count: zero means one worker per available
/// CPU.
pub fn resolve_worker_count(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
