//! Per-interface rank assertions and advisories.
//!
//! Other processes may assert a rank for an interface (for example to keep
//! an expensive link from becoming primary) or flag it with an advisory.
//! Several sessions can speak about the same interface; the table resolves
//! them into one effective override following a [`RankConflictPolicy`].

use ipmon_types::RankAssertion;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Opaque identity of a control session.
pub type SessionId = u64;

/// How disagreeing assertions from different sessions are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankConflictPolicy {
    /// The most restrictive assertion wins.
    #[default]
    Strongest,
    /// The least restrictive assertion wins.
    Weakest,
    /// Conflicts are logged and the interface gets no override.
    Error,
}

/// Rank assertions and advisories keyed by interface and session.
#[derive(Debug, Clone, Default)]
pub struct InterfaceRankTable {
    policy: RankConflictPolicy,
    assertions: BTreeMap<String, BTreeMap<SessionId, RankAssertion>>,
    advisories: BTreeMap<String, BTreeSet<SessionId>>,
}

impl InterfaceRankTable {
    pub fn new(policy: RankConflictPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> RankConflictPolicy {
        self.policy
    }

    /// Sets or clears a session's assertion for an interface.
    ///
    /// `Default` clears the assertion. Returns true if the interface's
    /// effective override changed.
    pub fn set_assertion(&mut self, session: SessionId, ifname: &str, assertion: Option<RankAssertion>) -> bool {
        let before = self.interface_rank_override(ifname);
        match assertion {
            Some(assertion) if assertion != RankAssertion::Default => {
                self.assertions
                    .entry(ifname.to_string())
                    .or_default()
                    .insert(session, assertion);
            }
            _ => {
                if let Some(sessions) = self.assertions.get_mut(ifname) {
                    sessions.remove(&session);
                    if sessions.is_empty() {
                        self.assertions.remove(ifname);
                    }
                }
            }
        }
        let changed = before != self.interface_rank_override(ifname);
        if changed {
            debug!(
                "IpMonitor: session {} set rank assertion {:?} on {}",
                session, assertion, ifname
            );
        }
        changed
    }

    /// Sets or clears a session's advisory for an interface.
    ///
    /// Returns true if the interface's effective override changed.
    pub fn set_advisory(&mut self, session: SessionId, ifname: &str, active: bool) -> bool {
        let before = self.interface_rank_override(ifname);
        if active {
            self.advisories
                .entry(ifname.to_string())
                .or_default()
                .insert(session);
        } else if let Some(sessions) = self.advisories.get_mut(ifname) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.advisories.remove(ifname);
            }
        }
        before != self.interface_rank_override(ifname)
    }

    /// Returns true if any session has an advisory on the interface.
    pub fn has_advisory(&self, ifname: &str) -> bool {
        self.advisories.contains_key(ifname)
    }

    /// Drops everything a session asserted.
    ///
    /// Returns the interfaces whose effective override changed.
    pub fn close_session(&mut self, session: SessionId) -> Vec<String> {
        let touched: BTreeSet<String> = self
            .assertions
            .iter()
            .filter(|(_, sessions)| sessions.contains_key(&session))
            .map(|(ifname, _)| ifname.clone())
            .chain(
                self.advisories
                    .iter()
                    .filter(|(_, sessions)| sessions.contains(&session))
                    .map(|(ifname, _)| ifname.clone()),
            )
            .collect();

        let mut changed = Vec::new();
        for ifname in touched {
            let before = self.interface_rank_override(&ifname);
            self.set_assertion(session, &ifname, None);
            self.set_advisory(session, &ifname, false);
            if before != self.interface_rank_override(&ifname) {
                changed.push(ifname);
            }
        }
        changed
    }

    /// Returns the effective rank override for an interface.
    pub fn interface_rank_override(&self, ifname: &str) -> Option<RankAssertion> {
        let mut values: Vec<RankAssertion> = self
            .assertions
            .get(ifname)
            .map(|sessions| sessions.values().copied().collect())
            .unwrap_or_default();
        if self.has_advisory(ifname) {
            values.push(RankAssertion::Last);
        }
        let first = *values.first()?;
        match self.policy {
            RankConflictPolicy::Strongest => values.into_iter().max(),
            RankConflictPolicy::Weakest => values.into_iter().min(),
            RankConflictPolicy::Error => {
                if values.iter().all(|&v| v == first) {
                    Some(first)
                } else {
                    warn!(
                        "IpMonitor: conflicting rank assertions on {}: {:?}, ignoring",
                        ifname, values
                    );
                    None
                }
            }
        }
    }
}
