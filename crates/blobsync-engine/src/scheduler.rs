//! Tick-driven one-shot task scheduler
//!
//! Runs on the owning thread only; there is no internal synchronization.
//! Each entry counts down once per [`DelayedTaskScheduler::tick`] and fires
//! when its counter reaches zero.

use std::collections::VecDeque;

#[derive(Debug)]
struct Entry<T> {
    remaining: u32,
    task: T,
}

/// Ordered list of `{remaining_ticks, task}` entries
#[derive(Debug)]
pub struct DelayedTaskScheduler<T> {
    entries: VecDeque<Entry<T>>,
}

impl<T> Default for DelayedTaskScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DelayedTaskScheduler<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Schedule `task` to fire after `delay` ticks
    ///
    /// A delay of 0 fires on the next tick, same as 1.
    pub fn schedule(&mut self, delay: u32, task: T) {
        self.entries.push_back(Entry {
            remaining: delay.max(1),
            task,
        });
    }

    /// Advance one tick, returning due tasks in scheduling order
    pub fn tick(&mut self) -> Vec<T> {
        let mut due = Vec::new();
        let mut pending = VecDeque::with_capacity(self.entries.len());

        for mut entry in self.entries.drain(..) {
            entry.remaining -= 1;
            if entry.remaining == 0 {
                due.push(entry.task);
            } else {
                pending.push_back(entry);
            }
        }

        self.entries = pending;
        due
    }

    /// Keep only entries whose task satisfies `keep`
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.entries.retain(|entry| keep(&entry.task));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
