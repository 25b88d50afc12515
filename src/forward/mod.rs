/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS forwarding over a pool of upstreams
//!
//! For each query the policy orders the pool, upstreams that are down are
//! skipped, and the remaining candidates are tried in order until one
//! answers. When every candidate is down the last one is tried anyway:
//! the health checks are then more likely broken than every upstream.

pub mod policy;

use crate::config::types::ForwardConfig;
use crate::core::context::{DnsRequest, RequestContext};
use crate::core::error::{Result, UpstreamError};
use crate::forward::policy::Policy;
use crate::network::upstream::{Options, Upstream, UpstreamBuilder};
use arc_swap::ArcSwap;
use hickory_proto::op::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Behavior of one forwarding rule
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    pub max_fails: u32,
    /// Upper bound for the whole attempt sequence of one query
    pub timeout: Duration,
    /// Periodic health probe interval; zero disables periodic probes
    pub hc_interval: Duration,
    pub reset_fails_on_success: bool,
    pub opts: Options,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            max_fails: 2,
            timeout: Duration::from_secs(5),
            hc_interval: Duration::from_millis(500),
            reset_fails_on_success: false,
            opts: Options::default(),
        }
    }
}

impl ForwardSettings {
    pub fn from_config(config: &ForwardConfig) -> Self {
        Self {
            max_fails: config.max_fails,
            timeout: Duration::from_millis(config.timeout),
            hc_interval: Duration::from_millis(config.health_check.interval),
            reset_fails_on_success: config.reset_fails_on_success,
            opts: Options {
                force_tcp: config.force_tcp,
                prefer_udp: config.prefer_udp,
                hc_recursion_desired: config.health_check.recursion_desired,
                hc_domain: config.health_check.domain.clone(),
            },
        }
    }
}

#[derive(Debug)]
pub struct Forwarder {
    tag: String,
    upstreams: ArcSwap<Vec<Arc<Upstream>>>,
    policy: Policy,
    settings: ForwardSettings,
}

impl Forwarder {
    pub fn new(
        tag: String,
        upstreams: Vec<Upstream>,
        policy: Policy,
        settings: ForwardSettings,
    ) -> Self {
        Self {
            tag,
            upstreams: ArcSwap::from_pointee(upstreams.into_iter().map(Arc::new).collect()),
            policy,
            settings,
        }
    }

    pub fn from_config(config: &ForwardConfig) -> Result<Self> {
        let settings = ForwardSettings::from_config(config);
        let upstreams = build_upstreams(config, &settings.opts)?;

        info!(
            tag = %config.tag,
            policy = %config.policy,
            upstreams = upstreams.len(),
            max_fails = settings.max_fails,
            timeout = ?settings.timeout,
            "Forwarder initialized"
        );
        Ok(Self::new(
            config.tag.clone(),
            upstreams,
            Policy::from_kind(config.policy),
            settings,
        ))
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Snapshot of the current upstream list
    #[cfg(test)]
    pub fn upstreams(&self) -> Arc<Vec<Arc<Upstream>>> {
        self.upstreams.load_full()
    }

    /// Start health checking of every upstream
    pub fn start(&self) {
        for upstream in self.upstreams.load().iter() {
            upstream.start(self.settings.hc_interval);
        }
    }

    /// Stop health checking and close pooled connections
    pub fn stop(&self) {
        for upstream in self.upstreams.load().iter() {
            upstream.stop();
        }
    }

    /// Atomically swap in a new upstream list. The new upstreams are
    /// started, the previous ones stopped.
    pub fn replace_upstreams(&self, upstreams: Vec<Upstream>) {
        let next: Vec<Arc<Upstream>> = upstreams.into_iter().map(Arc::new).collect();
        for upstream in &next {
            upstream.start(self.settings.hc_interval);
        }
        let previous = self.upstreams.swap(Arc::new(next));
        for upstream in previous.iter() {
            upstream.stop();
        }
        info!(
            tag = %self.tag,
            upstreams = self.upstreams.load().len(),
            "Upstream list replaced"
        );
    }

    /// Rebuild the upstream list from `config` and swap it in. The rule's
    /// other settings stay as they were at startup.
    pub fn reload(&self, config: &ForwardConfig) -> Result<()> {
        let upstreams = build_upstreams(config, &self.settings.opts)?;
        self.replace_upstreams(upstreams);
        Ok(())
    }

    /// Forward `request`, trying upstreams in policy order
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        request: &DnsRequest,
    ) -> std::result::Result<Message, UpstreamError> {
        let ctx = ctx.child_with_timeout(self.settings.timeout);
        let upstreams = self.upstreams.load_full();
        let candidates = self.policy.list(upstreams.as_slice());
        let total = candidates.len();

        let mut down = 0;
        let mut last_err = None;
        for upstream in &candidates {
            if upstream.down(self.settings.max_fails) {
                down += 1;
                if down < total {
                    continue;
                }
                warn!(
                    tag = %self.tag,
                    upstream = upstream.addr(),
                    "All upstreams are down, trying the last candidate anyway"
                );
            }

            match self.attempt(&ctx, upstream, request).await {
                Ok(reply) => {
                    if self.settings.reset_fails_on_success {
                        upstream.reset_fails();
                    }
                    return Ok(reply);
                }
                Err(UpstreamError::Cancelled) => return Err(UpstreamError::Cancelled),
                Err(e) => {
                    debug!(
                        tag = upstream.name(),
                        upstream = upstream.addr(),
                        client = ?request.src_addr,
                        id = request.id(),
                        fails = upstream.fails(),
                        error = %e,
                        "Upstream attempt failed, trying next"
                    );
                    if self.settings.max_fails != 0 {
                        upstream.healthcheck();
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(UpstreamError::UpstreamDown {
            last: last_err.map(Box::new),
        })
    }

    /// One upstream's share of a query: retries closed cached connections
    /// on a fresh dial and truncated UDP replies over TCP
    async fn attempt(
        &self,
        ctx: &RequestContext,
        upstream: &Upstream,
        request: &DnsRequest,
    ) -> std::result::Result<Message, UpstreamError> {
        let mut tcp_opts = None;
        loop {
            let opts = tcp_opts.as_ref().unwrap_or(&self.settings.opts);
            let reply = match upstream.connect(ctx, request, opts).await {
                Err(UpstreamError::CachedClosed { .. }) => {
                    debug!(upstream = upstream.addr(), "Cached connection closed, redialing");
                    continue;
                }
                other => other?,
            };

            if reply.truncated() && tcp_opts.is_none() && opts.prefer_udp && !opts.force_tcp {
                debug!(
                    upstream = upstream.addr(),
                    id = reply.id(),
                    "Truncated reply, retrying over TCP"
                );
                tcp_opts = Some(Options {
                    force_tcp: true,
                    ..self.settings.opts.clone()
                });
                continue;
            }
            return Ok(reply);
        }
    }
}

fn build_upstreams(config: &ForwardConfig, opts: &Options) -> Result<Vec<Upstream>> {
    config
        .upstreams
        .iter()
        .map(|u| UpstreamBuilder::build(&config.tag, u, opts))
        .collect()
}
