// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 commlink developers

//! Retry scheduling: deadline min-heap and jitter.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use super::state::ConnState;

// ============================================================================
// Retry entry
// ============================================================================

/// One pending retry: a record plus the deadline captured when it was
/// scheduled. Entries are snapshots; a record that reconnects (or is
/// poisoned by removal) while its entry sits in the heap is discarded
/// when the entry surfaces.
pub(crate) struct RetryEntry {
    pub deadline: Instant,
    pub state: Arc<ConnState>,
}

impl RetryEntry {
    pub fn new(deadline: Instant, state: Arc<ConnState>) -> Self {
        Self { deadline, state }
    }
}

impl PartialEq for RetryEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for RetryEntry {}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline must
        // surface first.
        other.deadline.cmp(&self.deadline)
    }
}

// ============================================================================
// Retry queue
// ============================================================================

/// Min-heap of pending retries ordered by deadline.
#[derive(Default)]
pub(crate) struct RetryQueue {
    heap: BinaryHeap<RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: RetryEntry) {
        self.heap.push(entry);
    }

    /// Entry with the earliest deadline, if any.
    pub fn peek(&self) -> Option<&RetryEntry> {
        self.heap.peek()
    }

    pub fn pop(&mut self) -> Option<RetryEntry> {
        self.heap.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

// ============================================================================
// Jitter
// ============================================================================

/// Compute the next retry deadline: `now + base ± uniform(0..max_jitter)`,
/// sign chosen by one random bit.
///
/// The jitter de-correlates reconnection storms after a peer outage. The
/// result is clamped to stay strictly after `now`: a deadline in the past
/// would collapse the whole wave onto the next worker wake-up, defeating
/// the spread.
pub(crate) fn jittered_deadline(now: Instant, base: Duration, max_jitter: Duration) -> Instant {
    let interval = if max_jitter.is_zero() {
        base
    } else {
        let mut rng = rand::thread_rng();
        let adjust = Duration::from_millis(rng.gen_range(0..max_jitter.as_millis() as u64));
        if rng.gen::<bool>() {
            base + adjust
        } else {
            base.saturating_sub(adjust)
        }
    };

    now + interval.max(Duration::from_millis(1))
}

// ============================================================================
// Tests
// ============================================================================
