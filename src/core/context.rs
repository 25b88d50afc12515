/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Per-query request state
//!
//! `DnsRequest` carries the decoded query together with the protocol the
//! client used. `RequestContext` carries the caller's deadline and a
//! cancellation signal; every blocking step of an upstream exchange races
//! against `RequestContext::done()`.

use hickory_proto::op::Message;
use hickory_proto::xfer::Protocol;
use std::future::pending;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::select;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

/// A decoded inbound query
#[derive(Debug, Clone)]
pub struct DnsRequest {
    /// Client's socket address, when known
    pub src_addr: Option<SocketAddr>,
    /// DNS request message from the client
    pub message: Message,
    /// Transport the client used (Udp or Tcp)
    pub protocol: Protocol,
}

impl DnsRequest {
    pub fn new(message: Message, protocol: Protocol) -> Self {
        Self {
            src_addr: None,
            message,
            protocol,
        }
    }

    pub fn with_src(mut self, src_addr: SocketAddr) -> Self {
        self.src_addr = Some(src_addr);
        self
    }

    pub fn id(&self) -> u16 {
        self.message.id()
    }
}

/// Cancellation handle paired with a `RequestContext`
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation to every clone of the paired context
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Deadline and cancellation scope of one query
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel_rx: watch::Receiver<bool>,
}

impl RequestContext {
    /// A context that never expires and cannot be cancelled
    #[cfg(test)]
    pub fn background() -> Self {
        let (_tx, cancel_rx) = watch::channel(false);
        Self {
            deadline: None,
            cancel_rx,
        }
    }

    /// A context that expires after `timeout`
    #[cfg(test)]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_timeout(timeout)
    }

    /// A cancellable context plus the handle that cancels it
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, cancel_rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel_rx,
            },
            CancelHandle { tx },
        )
    }

    /// Derive a context sharing this one's cancellation whose deadline is
    /// the earlier of the current deadline and `now + timeout`
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(current) if current < candidate => current,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel_rx: self.cancel_rx.clone(),
        }
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline
    #[cfg(test)]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    #[cfg(test)]
    pub fn is_done(&self) -> bool {
        *self.cancel_rx.borrow() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        let mut rx = self.cancel_rx.clone();
        let cancelled = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // sender gone without cancelling: never cancelled
                    pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => select! {
                _ = cancelled => {}
                _ = sleep_until(deadline) => {}
            },
            None => cancelled.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn background_context_never_completes() {
        let ctx = RequestContext::background();
        assert!(!ctx.is_done());
        assert!(
            timeout(Duration::from_millis(50), ctx.done())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let (ctx, handle) = RequestContext::with_cancel();
        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.done().await }
        });
        handle.cancel();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("done() should resolve after cancel")
            .unwrap();
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn child_keeps_earlier_deadline() {
        let parent = RequestContext::with_timeout(Duration::from_millis(100));
        let child = parent.child_with_timeout(Duration::from_secs(10));
        assert_eq!(parent.deadline(), child.deadline());

        let shorter = parent.child_with_timeout(Duration::from_millis(10));
        assert!(shorter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn deadline_expires() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(20));
        timeout(Duration::from_secs(1), ctx.done()).await.unwrap();
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
