//! Launch geometry and host execution for the pooling kernels
//!
//! Kernels are written as "one logical worker per work item". The work-item
//! space is a flat range `0..n`; a [`LaunchGeometry`] splits it into at most
//! `max_grid_size` grid blocks, each owning a contiguous span of items. On the
//! host every grid block becomes one rayon task.

use crate::{Result, TensorError};
use rayon::prelude::*;
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::RwLock;

/// Configuration for kernel launches
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct LaunchConfig {
    /// Work items per grid block
    pub block_size: usize,
    /// Upper bound on the number of grid blocks
    pub max_grid_size: usize,
    /// Run on a dedicated thread pool of this size instead of the global rayon pool
    pub num_threads: Option<usize>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            max_grid_size: 4096,
            num_threads: None,
        }
    }
}

impl LaunchConfig {
    /// Configuration that executes every launch on one thread
    pub fn single_threaded() -> Self {
        Self {
            num_threads: Some(1),
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_grid_size(mut self, max_grid_size: usize) -> Self {
        self.max_grid_size = max_grid_size;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Run `f` inside the configured thread pool.
    ///
    /// Failing to build a dedicated pool is reported as a device error.
    pub fn install<R, F>(&self, operation: &str, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match self.num_threads {
            None => Ok(f()),
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| TensorError::device_error(operation, &e.to_string(), "cpu"))?;
                Ok(pool.install(f))
            }
        }
    }
}

lazy_static::lazy_static! {
    static ref LAUNCH_CONFIG: RwLock<LaunchConfig> = RwLock::new(LaunchConfig::default());
}

/// Get the process-wide launch configuration
pub fn get_launch_config() -> LaunchConfig {
    match LAUNCH_CONFIG.read() {
        Ok(config) => config.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Replace the process-wide launch configuration
pub fn set_launch_config(config: LaunchConfig) {
    match LAUNCH_CONFIG.write() {
        Ok(mut guard) => *guard = config,
        Err(poisoned) => *poisoned.into_inner() = config,
    }
}

/// Partition of a flat work-item range into grid blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub work_items: usize,
    pub block_size: usize,
    pub grid_size: usize,
    /// Contiguous work items owned by each grid block
    pub span: usize,
}

impl LaunchGeometry {
    /// `grid = min(ceil(n / block), max_grid)` and `span = ceil(n / grid)`.
    pub fn for_work_items(work_items: usize, config: &LaunchConfig) -> Self {
        let block_size = config.block_size.max(1);
        if work_items == 0 {
            return Self {
                work_items,
                block_size,
                grid_size: 0,
                span: 0,
            };
        }
        let grid_size = work_items
            .div_ceil(block_size)
            .min(config.max_grid_size.max(1));
        Self {
            work_items,
            block_size,
            grid_size,
            span: work_items.div_ceil(grid_size),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.work_items == 0
    }

    /// Work items owned by grid block `block`
    pub fn block_range(&self, block: usize) -> Range<usize> {
        let start = (block * self.span).min(self.work_items);
        let end = (start + self.span).min(self.work_items);
        start..end
    }

    /// Run `kernel` once per grid block, in parallel, with that block's work items.
    ///
    /// The kernel must only perform writes that are safe under concurrency,
    /// which for the pooling kernels means atomic accumulation.
    pub fn for_each_block<F>(&self, kernel: F)
    where
        F: Fn(Range<usize>) + Send + Sync,
    {
        (0..self.grid_size)
            .into_par_iter()
            .for_each(|block| kernel(self.block_range(block)));
    }

    /// Run `kernel` over two output buffers that are partitioned by grid block.
    ///
    /// `kernel` receives the first work item of the block and the block's
    /// disjoint slices of both buffers.
    pub fn for_each_block_mut<A, B, F>(&self, first: &mut [A], second: &mut [B], kernel: F)
    where
        A: Send,
        B: Send,
        F: Fn(usize, &mut [A], &mut [B]) + Send + Sync,
    {
        if self.is_empty() {
            return;
        }
        first
            .par_chunks_mut(self.span)
            .zip(second.par_chunks_mut(self.span))
            .enumerate()
            .for_each(|(block, (a, b))| kernel(block * self.span, a, b));
    }
}

impl std::fmt::Display for LaunchGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "work_items={}, grid={}x{}, span={}",
            self.work_items, self.grid_size, self.block_size, self.span
        )
    }
}
