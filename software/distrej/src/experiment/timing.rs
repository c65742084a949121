//! Per-block compute timing against the block deadline

use std::time::{Duration, Instant};

use tracing::warn;

use super::LoopPhase;

/// Timing and progress summary of a run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunStats {
    /// Warm-up blocks written and read
    pub warm_up_blocks: usize,

    /// Active blocks written and read
    pub active_blocks: usize,

    /// Longest time spent computing one block, excluding the driver calls
    pub worst_compute: Duration,

    /// Blocks whose compute time alone exceeded the block period
    pub overruns: usize,

    /// Wall time from the start of the tasks to the end of the last block
    pub elapsed: Duration,
}

impl RunStats {
    pub fn blocks(&self) -> usize {
        self.warm_up_blocks + self.active_blocks
    }
}

/// Measures the compute portion of each block.
///
/// The driver calls block on the sample clock and are excluded, so the margin
/// reflects only what the loop itself spends out of each period.
pub(super) struct BlockTimer {
    deadline: Duration,
    run_start: Instant,
    block_start: Instant,
}

impl BlockTimer {
    pub(super) fn new(deadline: Duration) -> Self {
        let now = Instant::now();
        Self {
            deadline,
            run_start: now,
            block_start: now,
        }
    }

    pub(super) fn start_block(&mut self) {
        self.block_start = Instant::now();
    }

    /// Close out the compute portion of block `index`
    pub(super) fn end_compute(&mut self, index: usize, stats: &mut RunStats) {
        let compute = self.block_start.elapsed();
        stats.worst_compute = stats.worst_compute.max(compute);
        if compute > self.deadline {
            stats.overruns += 1;
            warn!(
                "Block {index} compute took {:.3} ms of a {:.3} ms period",
                compute.as_secs_f64() * 1e3,
                self.deadline.as_secs_f64() * 1e3
            );
        }
    }

    /// Count a block that completed its I/O
    pub(super) fn end_block(&self, phase: LoopPhase, stats: &mut RunStats) {
        match phase {
            LoopPhase::WarmUp => stats.warm_up_blocks += 1,
            LoopPhase::Active => stats.active_blocks += 1,
            LoopPhase::Finalizing | LoopPhase::Terminated => {}
        }
        stats.elapsed = self.run_start.elapsed();
    }
}
