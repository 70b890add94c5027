//! Reentrancy tracking for the allocator wrappers.
//!
//! The host's allocation domains call each other: an object-domain malloc
//! may fall back to the memory domain for large requests. Each wrapper
//! holds a [`ReentryGuard`] for its whole body, and only the outermost
//! guard on a thread reports `is_top_level`, so a chained allocation is
//! profiled exactly once.

use std::cell::Cell;

thread_local! {
    static IN_ALLOCATOR: Cell<bool> = const { Cell::new(false) };
}

pub struct ReentryGuard {
    top_level: bool,
}

impl ReentryGuard {
    pub fn enter() -> Self {
        let top_level = IN_ALLOCATOR.with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        });
        ReentryGuard { top_level }
    }

    pub fn is_top_level(&self) -> bool {
        self.top_level
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        if self.top_level {
            IN_ALLOCATOR.with(|flag| flag.set(false));
        }
    }
}
