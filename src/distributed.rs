//! Process-group collaborator interface.
//!
//! Distribution is across workers running the identical update loop on their
//! own data shards. The only cross-worker synchronization the loop performs
//! itself is an asynchronous all-reduce of non-policy gradients, issued after
//! the backward pass and awaited before the optimizer step. The group is
//! injected rather than read from process-global state, so single-process
//! tests stay deterministic.
//!
//! [`SingleProcess`] is the degenerate implementation. [`LocalGroup`] is a
//! real N-rank implementation over threads in one process, used by the test
//! suite and usable by thread-based embedders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

// ============================================================================
// ProcessGroup / ReduceHandle
// ============================================================================

/// Completion handle for an in-flight all-reduce.
pub trait ReduceHandle: Send {
    /// Block until every rank has contributed, returning the reduced values.
    fn wait(self: Box<Self>) -> Vec<f32>;
}

/// Distributed process-group primitives consumed by the update loop.
pub trait ProcessGroup: Send + Sync {
    /// Whether a multi-worker group is active. When false the loop skips
    /// gradient synchronization entirely.
    fn is_initialized(&self) -> bool;

    /// Number of workers in the group.
    fn world_size(&self) -> usize;

    /// Start an asynchronous elementwise sum across all workers.
    fn all_reduce_sum(&self, values: Vec<f32>) -> Box<dyn ReduceHandle>;
}

// ============================================================================
// SingleProcess
// ============================================================================

/// No-op group for single-worker training.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

struct Immediate(Vec<f32>);

impl ReduceHandle for Immediate {
    fn wait(self: Box<Self>) -> Vec<f32> {
        self.0
    }
}

impl ProcessGroup for SingleProcess {
    fn is_initialized(&self) -> bool {
        false
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, values: Vec<f32>) -> Box<dyn ReduceHandle> {
        Box::new(Immediate(values))
    }
}

// ============================================================================
// LocalGroup
// ============================================================================

struct RoundState {
    /// Elementwise running sum and contribution count per open round.
    open: HashMap<u64, (Vec<f32>, usize)>,
    /// Completed rounds awaiting readers: reduced values + remaining reads.
    done: HashMap<u64, (Vec<f32>, usize)>,
}

struct LocalGroupShared {
    world_size: usize,
    state: Mutex<RoundState>,
    complete: Condvar,
}

/// In-process N-rank group.
///
/// [`LocalGroup::new`] hands one handle to each rank. Rounds are matched by
/// per-rank call order, so every rank must issue the same sequence of
/// reductions — the same requirement a real collective backend imposes.
pub struct LocalGroup {
    shared: Arc<LocalGroupShared>,
    /// This rank's next round number.
    next_round: AtomicU64,
}

impl LocalGroup {
    /// Create handles for a group of `world_size` ranks.
    pub fn new(world_size: usize) -> Vec<LocalGroup> {
        assert!(world_size > 0, "world_size must be > 0");
        let shared = Arc::new(LocalGroupShared {
            world_size,
            state: Mutex::new(RoundState {
                open: HashMap::new(),
                done: HashMap::new(),
            }),
            complete: Condvar::new(),
        });
        (0..world_size)
            .map(|_| LocalGroup {
                shared: Arc::clone(&shared),
                next_round: AtomicU64::new(0),
            })
            .collect()
    }
}

struct LocalHandle {
    shared: Arc<LocalGroupShared>,
    round: u64,
}

impl ReduceHandle for LocalHandle {
    fn wait(self: Box<Self>) -> Vec<f32> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some((values, readers)) = state.done.get_mut(&self.round) {
                let result = values.clone();
                *readers -= 1;
                if *readers == 0 {
                    state.done.remove(&self.round);
                }
                return result;
            }
            self.shared.complete.wait(&mut state);
        }
    }
}

impl ProcessGroup for LocalGroup {
    fn is_initialized(&self) -> bool {
        self.shared.world_size > 1
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, values: Vec<f32>) -> Box<dyn ReduceHandle> {
        let round = self.next_round.fetch_add(1, Ordering::Relaxed);
        let world_size = self.shared.world_size;

        let mut state = self.shared.state.lock();
        let (sum, count) = state
            .open
            .entry(round)
            .or_insert_with(|| (vec![0.0; values.len()], 0));
        assert_eq!(
            sum.len(),
            values.len(),
            "all ranks must reduce the same number of values"
        );
        for (acc, v) in sum.iter_mut().zip(values.iter()) {
            *acc += v;
        }
        *count += 1;

        if *count == world_size {
            let (sum, _) = state.open.remove(&round).expect("round present");
            state.done.insert(round, (sum, world_size));
            self.shared.complete.notify_all();
        }

        Box::new(LocalHandle {
            shared: Arc::clone(&self.shared),
            round,
        })
    }
}
