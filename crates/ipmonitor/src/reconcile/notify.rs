//! Debounced network-change notification.
//!
//! Change bits accumulate until the downstream consumers of the DNS
//! configuration and the network information snapshot have acknowledged
//! the previous publication, or until the post delay expires.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::route::flag_ops;

/// Categories of a network change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeBits(u32);

impl ChangeBits {
    pub const NET: Self = Self(0x1);
    pub const DNS: Self = Self(0x2);
    pub const PROXY: Self = Self(0x4);
    /// Reserved; SMB configuration is not tracked.
    pub const SMB: Self = Self(0x8);
    pub const NAT64: Self = Self(0x10);
}

flag_ops!(ChangeBits);

/// A downstream consumer whose acknowledgement gates notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncedConsumer {
    DnsInfo,
    Nwi,
}

/// A notification posted to downstream listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The network information snapshot changed.
    Nwi,
    Dns,
    Proxy,
    Nat64,
    /// Generic "network changed" carrying the remaining bits.
    NetworkChange(ChangeBits),
}

#[derive(Debug)]
pub struct NetworkChangeNotifier {
    post_delay: Duration,
    needed: ChangeBits,
    start: Option<Instant>,
    deadline: Option<Instant>,
    timed_out: bool,
    dnsinfo_synced: bool,
    nwi_synced: bool,
}

impl NetworkChangeNotifier {
    pub fn new(post_delay: Duration) -> Self {
        Self {
            post_delay,
            needed: ChangeBits::NONE,
            start: None,
            deadline: None,
            timed_out: false,
            dnsinfo_synced: true,
            nwi_synced: true,
        }
    }

    /// Bits waiting to be posted.
    pub fn pending(&self) -> ChangeBits {
        self.needed
    }

    /// When the outstanding timer fires, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn all_synced(&self) -> bool {
        self.dnsinfo_synced && self.nwi_synced
    }

    /// Records changes and posts them if nothing is pending downstream.
    ///
    /// Any armed timer is cancelled; a new one is armed while a consumer has
    /// not acknowledged.
    pub fn post(&mut self, bits: ChangeBits, now: Instant) -> Vec<Notification> {
        if bits.is_empty() {
            return Vec::new();
        }
        if self.needed.is_empty() {
            self.start = Some(now);
        }
        self.needed |= bits;

        self.deadline = None;
        self.timed_out = false;
        if !self.all_synced() {
            self.deadline = Some(now + self.post_delay);
        }
        self.post_when_ready(now)
    }

    /// Posts the accumulated bits once allowed.
    pub fn post_when_ready(&mut self, now: Instant) -> Vec<Notification> {
        if self.needed.is_empty() {
            return Vec::new();
        }
        if !self.timed_out && !self.all_synced() {
            debug!(
                "Notifier: defer network change ({}, {})",
                if self.dnsinfo_synced { "DNS" } else { "!DNS" },
                if self.nwi_synced { "nwi" } else { "!nwi" }
            );
            return Vec::new();
        }

        let elapsed = self.start.map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
        info!(
            "Notifier: Post network change ({}: {}.{:06}: 0x{:x})",
            if self.timed_out { "timeout" } else { "delayed" },
            elapsed.as_secs(),
            elapsed.subsec_micros(),
            self.needed.bits()
        );
        self.deadline = None;
        self.timed_out = false;

        let mut notifications = Vec::new();
        if self.needed.contains(ChangeBits::NET) {
            notifications.push(Notification::Nwi);
        }
        if self.needed.contains(ChangeBits::DNS) {
            notifications.push(Notification::Dns);
        }
        if self.needed.contains(ChangeBits::PROXY) {
            notifications.push(Notification::Proxy);
        }
        if self.needed.contains(ChangeBits::NAT64) {
            notifications.push(Notification::Nat64);
            self.needed.remove(ChangeBits::NAT64);
        }
        if !self.needed.is_empty() {
            notifications.push(Notification::NetworkChange(self.needed));
        }
        self.needed = ChangeBits::NONE;
        self.start = None;
        notifications
    }

    /// The post delay expired.
    pub fn timer_fired(&mut self, now: Instant) -> Vec<Notification> {
        self.timed_out = true;
        self.post_when_ready(now)
    }

    /// A consumer picked up the latest publication.
    ///
    /// Every DNS acknowledgement results in a DNS change being posted.
    pub fn ack(&mut self, consumer: SyncedConsumer, now: Instant) -> Vec<Notification> {
        match consumer {
            SyncedConsumer::DnsInfo => {
                self.dnsinfo_synced = true;
                if !self.needed.contains(ChangeBits::DNS) {
                    return self.post(ChangeBits::DNS, now);
                }
            }
            SyncedConsumer::Nwi => self.nwi_synced = true,
        }
        self.post_when_ready(now)
    }

    /// A new publication went out; wait for the consumer to pick it up.
    pub fn published(&mut self, consumer: SyncedConsumer) {
        match consumer {
            SyncedConsumer::DnsInfo => self.dnsinfo_synced = false,
            SyncedConsumer::Nwi => self.nwi_synced = false,
        }
    }
}
