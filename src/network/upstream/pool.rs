/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-upstream connection pool
//!
//! One LIFO stack per transport kind. Entries are pushed with the time they
//! were returned, so each stack is ordered oldest-first and an expired
//! entry implies every entry below it is expired too.

use crate::network::upstream::TransportKind;
use crate::network::upstream::conn::PersistConn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct PooledConn {
    conn: PersistConn,
    used: Instant,
}

/// Idle connections of one upstream, keyed by transport kind
#[derive(Debug)]
pub struct ConnectionPool {
    stacks: Mutex<[Vec<PooledConn>; TransportKind::COUNT]>,
    /// Idle expiry in milliseconds
    expire_ms: AtomicU64,
}

impl ConnectionPool {
    pub fn new(expire: Duration) -> Self {
        Self {
            stacks: Mutex::new(Default::default()),
            expire_ms: AtomicU64::new(expire.as_millis() as u64),
        }
    }

    pub fn expire(&self) -> Duration {
        Duration::from_millis(self.expire_ms.load(Ordering::Relaxed))
    }

    pub fn set_expire(&self, expire: Duration) {
        self.expire_ms
            .store(expire.as_millis() as u64, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, [Vec<PooledConn>; TransportKind::COUNT]> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the most recently returned connection of `kind` that has not
    /// been idle longer than the expire duration.
    ///
    /// Finding an expired entry on top drops the whole stack, since
    /// everything beneath it is older.
    pub fn get(&self, kind: TransportKind) -> Option<PersistConn> {
        let expire = self.expire();
        let now = Instant::now();

        let expired: Vec<PooledConn> = {
            let mut stacks = self.lock();
            let stack = &mut stacks[kind.index()];
            match stack.pop() {
                None => return None,
                Some(entry) if now.saturating_duration_since(entry.used) <= expire => {
                    return Some(entry.conn);
                }
                Some(entry) => {
                    let mut expired: Vec<PooledConn> = stack.drain(..).collect();
                    expired.push(entry);
                    expired
                }
            }
        };

        debug!(
            kind = %kind,
            dropped = expired.len(),
            "Dropped expired pooled connections"
        );
        None
    }

    /// Return a connection after a fully successful exchange
    ///
    /// The entry is stamped under the lock so each stack stays ordered by
    /// return time.
    pub fn put(&self, kind: TransportKind, conn: PersistConn) {
        let mut stacks = self.lock();
        stacks[kind.index()].push(PooledConn {
            conn,
            used: Instant::now(),
        });
    }

    /// Drop every connection idle for longer than the expire duration.
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let expire = self.expire();
        let now = Instant::now();

        let expired: Vec<PooledConn> = {
            let mut stacks = self.lock();
            let mut expired = Vec::new();
            for stack in stacks.iter_mut() {
                let keep_from =
                    stack.partition_point(|e| now.saturating_duration_since(e.used) > expire);
                expired.extend(stack.drain(..keep_from));
            }
            expired
        };

        if !expired.is_empty() {
            debug!(dropped = expired.len(), "Connection pool sweep");
        }
        expired.len()
    }

    /// Remove every pooled connection and hand them back for closing
    pub fn drain(&self) -> Vec<PersistConn> {
        let mut stacks = self.lock();
        stacks
            .iter_mut()
            .flat_map(|stack| stack.drain(..))
            .map(|entry| entry.conn)
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self, kind: TransportKind) -> usize {
        self.lock()[kind.index()].len()
    }

    #[cfg(test)]
    pub fn total(&self) -> usize {
        self.lock().iter().map(Vec::len).sum()
    }
}
