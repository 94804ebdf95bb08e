//! Membership convergence detection.
//!
//! Convergence is level-triggered: the full predicate is re-evaluated on every
//! checksum event from any node. No single event has to be "the" convergence
//! event; it is enough that one fires after the views agree.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::{
    error::{Error, Result},
    event::Subscription,
    mesh::{HostList, Membership},
};

/// Whether one membership view matches the canonical host list as a set.
pub fn view_matches(view: &[String], canonical: &[String]) -> bool {
    if view.len() != canonical.len() {
        return false;
    }
    let mut view: Vec<&String> = view.iter().collect();
    let mut canonical: Vec<&String> = canonical.iter().collect();
    view.sort();
    canonical.sort();
    view == canonical
}

/// Whether every view matches the canonical host list.
pub fn is_converged<I>(views: I, canonical: &[String]) -> bool
where
    I: IntoIterator<Item = Vec<String>>,
{
    views
        .into_iter()
        .all(|view| view_matches(&view, canonical))
}

/// Whether every membership in `memberships` matches `hosts`.
pub fn memberships_converged<M: Membership>(memberships: &[M], hosts: &HostList) -> bool {
    let canonical = hosts.snapshot();
    is_converged(memberships.iter().map(Membership::hosts), &canonical)
}

/// Outcome of a convergence wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Checksum events observed before convergence.
    pub events_observed: usize,
    /// Times the predicate was evaluated.
    pub checks: usize,
}

impl ConvergenceReport {
    /// Whether the cluster was already converged when the wait started.
    pub fn was_immediate(&self) -> bool {
        self.events_observed == 0
    }
}

/// Wait until every membership view matches `hosts`.
///
/// Returns without subscribing when already converged. Otherwise one
/// subscription per node is held until the predicate holds and released
/// together on return. Never times out on its own; a cluster that never
/// converges stalls the caller. Fails only if every event source goes away
/// before the views agree.
pub async fn wait_for_convergence<M: Membership>(
    memberships: &[M],
    hosts: &HostList,
) -> Result<ConvergenceReport> {
    let mut report = ConvergenceReport {
        events_observed: 0,
        checks: 1,
    };
    if memberships_converged(memberships, hosts) {
        return Ok(report);
    }

    let mut pending: FuturesUnordered<_> = memberships
        .iter()
        .enumerate()
        .map(|(index, m)| next_event(index, m.subscribe_checksum()))
        .collect();

    // An event may have fired between the first check and subscribing.
    report.checks += 1;
    if memberships_converged(memberships, hosts) {
        return Ok(report);
    }

    while let Some((index, event, subscription)) = pending.next().await {
        let Some(checksum) = event else {
            debug!(index, "membership event source closed during convergence wait");
            continue;
        };
        report.events_observed += 1;
        report.checks += 1;
        if memberships_converged(memberships, hosts) {
            debug!(
                index,
                checksum,
                events = report.events_observed,
                "membership converged"
            );
            return Ok(report);
        }
        pending.push(next_event(index, subscription));
    }
    Err(Error::Disconnected("membership checksum events"))
}

async fn next_event(
    index: usize,
    mut subscription: Subscription<u32>,
) -> (usize, Option<u32>, Subscription<u32>) {
    let event = subscription.recv().await;
    (index, event, subscription)
}
