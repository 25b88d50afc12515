/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream ordering policies
//!
//! A policy reorders the upstream list into the attempt order of one
//! query. It never filters: skipping upstreams that are down is the
//! forwarder's job.

use crate::config::types::PolicyKind;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Uniform random order drawn from the policy's own generator
#[derive(Debug)]
pub struct RandomPolicy {
    rng: Mutex<StdRng>,
}

impl RandomPolicy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic generator, for reproducible orderings
    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn list<T: Clone>(&self, pool: &[T]) -> Vec<T> {
        let mut out = pool.to_vec();
        if out.len() < 2 {
            return out;
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if out.len() == 2 {
            if rng.random_bool(0.5) {
                out.swap(0, 1);
            }
        } else {
            out.shuffle(&mut *rng);
        }
        out
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Rotation starting one step further on every call
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    robin: AtomicU32,
}

impl RoundRobinPolicy {
    fn list<T: Clone>(&self, pool: &[T]) -> Vec<T> {
        if pool.is_empty() {
            return Vec::new();
        }
        let robin = self.robin.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let start = robin as usize % pool.len();

        let mut out = Vec::with_capacity(pool.len());
        out.extend_from_slice(&pool[start..]);
        out.extend_from_slice(&pool[..start]);
        out
    }
}

#[derive(Debug)]
pub enum Policy {
    Random(RandomPolicy),
    RoundRobin(RoundRobinPolicy),
    Sequential,
}

impl Policy {
    pub fn from_kind(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Random => Policy::Random(RandomPolicy::new()),
            PolicyKind::RoundRobin => Policy::RoundRobin(RoundRobinPolicy::default()),
            PolicyKind::Sequential => Policy::Sequential,
        }
    }

    #[cfg(test)]
    pub fn random_with_seed(seed: u64) -> Self {
        Policy::Random(RandomPolicy::with_seed(seed))
    }

    /// Attempt order for one query: a permutation of `pool`
    pub fn list<T: Clone>(&self, pool: &[T]) -> Vec<T> {
        match self {
            Policy::Random(p) => p.list(pool),
            Policy::RoundRobin(p) => p.list(pool),
            Policy::Sequential => pool.to_vec(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::Random(_) => PolicyKind::Random,
            Policy::RoundRobin(_) => PolicyKind::RoundRobin,
            Policy::Sequential => PolicyKind::Sequential,
        }
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.kind(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut v: Vec<u32>) -> Vec<u32> {
        v.sort_unstable();
        v
    }

    #[test]
    fn sequential_is_identity() {
        let policy = Policy::from_kind(PolicyKind::Sequential);
        for len in 0..=10u32 {
            let pool: Vec<u32> = (0..len).collect();
            assert_eq!(policy.list(&pool), pool);
        }
    }

    #[test]
    fn round_robin_rotates() {
        let policy = Policy::from_kind(PolicyKind::RoundRobin);
        let pool = ['A', 'B', 'C'];
        assert_eq!(policy.list(&pool), vec!['B', 'C', 'A']);
        assert_eq!(policy.list(&pool), vec!['C', 'A', 'B']);
        assert_eq!(policy.list(&pool), vec!['A', 'B', 'C']);
        assert_eq!(policy.list(&pool), vec!['B', 'C', 'A']);
    }

    #[test]
    fn round_robin_survives_counter_wrap() {
        let policy = RoundRobinPolicy {
            robin: AtomicU32::new(u32::MAX - 1),
        };
        let pool = [1u32, 2, 3];
        for _ in 0..4 {
            assert_eq!(sorted(policy.list(&pool)), vec![1, 2, 3]);
        }
    }

    #[test]
    fn random_two_elements_is_a_fair_coin() {
        let policy = Policy::random_with_seed(0x5eed);
        let pool = ['A', 'B'];
        let trials = 10_000;
        let swapped = (0..trials)
            .filter(|_| policy.list(&pool) == vec!['B', 'A'])
            .count();
        let ratio = swapped as f64 / trials as f64;
        assert!((0.47..=0.53).contains(&ratio), "swap ratio {}", ratio);
    }

    #[test]
    fn random_is_always_a_permutation() {
        let policy = Policy::random_with_seed(7);
        for len in 0..=10u32 {
            let pool: Vec<u32> = (0..len).collect();
            for _ in 0..20 {
                assert_eq!(sorted(policy.list(&pool)), pool);
            }
        }
    }

    #[test]
    fn random_reorders_larger_pools() {
        let policy = Policy::random_with_seed(42);
        let pool: Vec<u32> = (0..5).collect();
        assert!((0..50).any(|_| policy.list(&pool) != pool));
    }

    #[test]
    fn seeded_policies_agree() {
        let a = Policy::random_with_seed(99);
        let b = Policy::random_with_seed(99);
        let pool: Vec<u32> = (0..8).collect();
        for _ in 0..10 {
            assert_eq!(a.list(&pool), b.list(&pool));
        }
    }

    #[test]
    fn empty_and_single_pools() {
        for kind in [
            PolicyKind::Random,
            PolicyKind::RoundRobin,
            PolicyKind::Sequential,
        ] {
            let policy = Policy::from_kind(kind);
            assert!(policy.list::<u32>(&[]).is_empty());
            assert_eq!(policy.list(&[9u32]), vec![9]);
            assert_eq!(policy.to_string(), kind.to_string());
        }
    }
}
