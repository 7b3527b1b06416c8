//! Per-worker scratch state shared by the tile and scroll phases.

use crate::draw::codec::MatchFinder;
use crate::draw::pool::WorkerPool;
use crate::draw::scroll::CorrelationScratch;

/// Everything one worker thread reuses between work items.
#[derive(Default)]
pub struct WorkerScratch {
    pub finder: MatchFinder,
    pub correlation: CorrelationScratch,
}

/// The pool type the engine dispatches on.
pub type DrawPool = WorkerPool<WorkerScratch>;

/// Start a pool of `workers` threads with fresh scratch per thread.
pub fn draw_pool(workers: usize) -> DrawPool {
    WorkerPool::new(workers, WorkerScratch::default)
}
