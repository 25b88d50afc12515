/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Saturating failure counter shared by live traffic and health probes

use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive-failure counter of one upstream.
///
/// Increments saturate at `u32::MAX` inside a single compare-and-swap loop,
/// so two racing increments near the boundary can never wrap the value.
#[derive(Debug, Default)]
pub struct FailureCounter {
    fails: AtomicU32,
}

impl FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_value(value: u32) -> Self {
        Self {
            fails: AtomicU32::new(value),
        }
    }

    pub fn get(&self) -> u32 {
        self.fails.load(Ordering::Acquire)
    }

    /// Add one failure; a no-op once the counter sits at `u32::MAX`
    pub fn increment(&self) {
        let _ = self
            .fails
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1));
    }

    /// Set the counter back to exactly zero
    pub fn reset(&self) {
        self.fails.store(0, Ordering::Release);
    }

    /// True iff `max_fails > 0` and the count is strictly above it
    pub fn down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.get() > max_fails
    }
}
