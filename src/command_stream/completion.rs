use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// What `flush_task` hands back: the task count assigned to the submission
/// and the backend's handle for waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionStamp {
    pub task_count: u32,
    pub flush_stamp: u64,
}

impl CompletionStamp {
    /// Task count of a stamp whose submission has not happened yet.
    pub const NOT_READY: u32 = 0xFFFF_FFF0;

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.task_count != Self::NOT_READY
    }
}

/// The page the GPU writes completed task counts into.
#[repr(C, align(4096))]
#[derive(Debug, Default)]
pub struct TagBuffer {
    pub tag: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<TagBuffer>() == 4096);

impl TagBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cpu_address(&self) -> usize {
        (&raw const self.tag) as usize
    }

    #[must_use]
    pub fn load(&self) -> u32 {
        self.tag.load(Ordering::Acquire)
    }

    /// Stands in for the GPU's post-sync write on simulated devices.
    pub fn store(&self, task_count: u32) {
        self.tag.store(task_count, Ordering::Release);
    }

    #[must_use]
    pub fn is_completed(&self, task_count: u32) -> bool {
        self.load() >= task_count
    }
}

const SPIN_DURATION: Duration = Duration::from_micros(20);

/// Polls `tag` until it reaches `task_count`.
///
/// Busy-spins briefly, then yields the thread between polls. Without a
/// timeout it only returns once the task completed.
pub fn base_wait_function(tag: &TagBuffer, enable_timeout: bool, timeout_us: i64, task_count: u32) -> bool {
    let start = Instant::now();
    let timeout = Duration::from_micros(u64::try_from(timeout_us).unwrap_or(0));

    loop {
        if tag.is_completed(task_count) {
            return true;
        }

        let elapsed = start.elapsed();
        if enable_timeout && elapsed >= timeout {
            debug!(task_count, current = tag.load(), timeout_us, "wait for task count timed out");
            return tag.is_completed(task_count);
        }

        if elapsed < SPIN_DURATION {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}
