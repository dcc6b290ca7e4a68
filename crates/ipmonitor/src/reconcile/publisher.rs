//! Downstream publication seam.
//!
//! The reconciler reports primaries, route tables, the network information
//! snapshot and recomputation requests through [`Publisher`]. The DNS and
//! proxy aggregation that consumes them lives outside this crate.

use async_trait::async_trait;
use ipmon_types::{IpAddress, ServiceId};
use log::{debug, info};
use serde::Serialize;
use tokio::sync::Mutex;

use super::notify::Notification;
use crate::election::NwiState;
use crate::route::{Family, Ipv4RouteList, Ipv6RouteList};

/// Global state of a family's primary service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimaryInfo {
    pub service: ServiceId,
    pub interface: Option<String>,
    pub router: Option<IpAddress>,
}

/// Borrowed view of an installed route table.
#[derive(Debug, Clone, Copy)]
pub enum RouteTable<'a> {
    Ipv4(Option<&'a Ipv4RouteList>),
    Ipv6(Option<&'a Ipv6RouteList>),
}

impl RouteTable<'_> {
    pub fn family(&self) -> Family {
        match self {
            RouteTable::Ipv4(_) => Family::Ipv4,
            RouteTable::Ipv6(_) => Family::Ipv6,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RouteTable::Ipv4(list) => list.map_or(0, |list| list.len()),
            RouteTable::Ipv6(list) => list.map_or(0, |list| list.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recomputation delegated to the DNS and proxy components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamUpdate {
    /// The primary DNS service or its configuration changed.
    Dns { primary: Option<ServiceId> },
    /// The resolver configuration must be regenerated.
    DnsInfo { primary: Option<ServiceId> },
    Proxies { primary: Option<ServiceId> },
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_primary(&self, family: Family, primary: Option<&PrimaryInfo>);

    async fn publish_routes(&self, routes: RouteTable<'_>);

    async fn publish_nwi(&self, nwi: &NwiState);

    async fn request_update(&self, update: DownstreamUpdate);

    async fn notify(&self, notification: Notification);
}

/// Publisher that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

#[async_trait]
impl Publisher for LoggingPublisher {
    async fn publish_primary(&self, family: Family, primary: Option<&PrimaryInfo>) {
        match primary {
            Some(primary) => info!(
                "IpMonitor: {} primary {} interface {} router {}",
                family,
                primary.service,
                primary.interface.as_deref().unwrap_or("<none>"),
                primary.router.map_or_else(|| "<none>".to_string(), |router| router.to_string())
            ),
            None => info!("IpMonitor: {} has no primary", family),
        }
    }

    async fn publish_routes(&self, routes: RouteTable<'_>) {
        debug!("IpMonitor: {} route table has {} routes", routes.family(), routes.len());
    }

    async fn publish_nwi(&self, nwi: &NwiState) {
        info!(
            "IpMonitor: network information generation {} ({} IPv4, {} IPv6 interfaces)",
            nwi.generation,
            nwi.ipv4.len(),
            nwi.ipv6.len()
        );
    }

    async fn request_update(&self, update: DownstreamUpdate) {
        debug!("IpMonitor: update {:?}", update);
    }

    async fn notify(&self, notification: Notification) {
        info!("IpMonitor: notify {:?}", notification);
    }
}

/// Owned copy of one publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Published {
    Primary(Family, Option<PrimaryInfo>),
    /// Family and number of installed routes.
    Routes(Family, usize),
    Nwi(NwiState),
    Update(DownstreamUpdate),
    Notification(Notification),
}

/// Publisher that keeps everything it is handed, in order.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Published> {
        self.events.lock().await.clone()
    }

    /// Returns the recorded events and forgets them.
    pub async fn take(&self) -> Vec<Published> {
        std::mem::take(&mut *self.events.lock().await)
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| match event {
                Published::Notification(notification) => Some(*notification),
                _ => None,
            })
            .collect()
    }

    async fn record(&self, event: Published) {
        self.events.lock().await.push(event);
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish_primary(&self, family: Family, primary: Option<&PrimaryInfo>) {
        self.record(Published::Primary(family, primary.cloned())).await;
    }

    async fn publish_routes(&self, routes: RouteTable<'_>) {
        self.record(Published::Routes(routes.family(), routes.len())).await;
    }

    async fn publish_nwi(&self, nwi: &NwiState) {
        self.record(Published::Nwi(nwi.clone())).await;
    }

    async fn request_update(&self, update: DownstreamUpdate) {
        self.record(Published::Update(update)).await;
    }

    async fn notify(&self, notification: Notification) {
        self.record(Published::Notification(notification)).await;
    }
}
