//! The reconciliation worker and its handle.
//!
//! All state lives in one task. Other tasks talk to it through a cloneable
//! [`MonitorHandle`] that only enqueues [`MonitorEvent`]s.

use ipmon_types::{RankAssertion, ServiceId};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::instrument;

use super::consumer::ChangeQueue;
use super::{DaemonError, Result};
use crate::assertions::{InterfaceRankTable, SessionId};
use crate::config::{GlobalConfig, MonitorConfig, ServiceConfig, ServicesSnapshot};
use crate::election::{ElectionResults, NwiState};
use crate::kernel::RouteKernel;
use crate::reconcile::{
    ChangeBits, NetworkChangeNotifier, Notification, PrimaryInfo, Publisher, ReconcilerState, SyncedConsumer,
};
use crate::route::{Ipv4, Ipv4RouteList, Ipv6, Ipv6RouteList};

/// Input of the worker.
#[derive(Debug)]
pub enum MonitorEvent {
    ServicesChanged {
        changes: Vec<(ServiceId, Option<ServiceConfig>)>,
    },
    GlobalChanged(GlobalConfig),
    /// Interface name to index updates; index 0 removes the interface.
    InterfacesChanged(Vec<(String, u32)>),
    InterfaceRank {
        session: SessionId,
        ifname: String,
        assertion: Option<RankAssertion>,
    },
    InterfaceAdvisory {
        session: SessionId,
        ifname: String,
        active: bool,
    },
    SessionClosed {
        session: SessionId,
    },
    Ack(SyncedConsumer),
    Snapshot(oneshot::Sender<MonitorSnapshot>),
    Shutdown,
}

/// Point-in-time view of the worker's state.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub primary_ipv4: Option<PrimaryInfo>,
    pub primary_ipv6: Option<PrimaryInfo>,
    pub primary_dns: Option<ServiceId>,
    pub primary_proxies: Option<ServiceId>,
    pub ipv4_routes: Option<Ipv4RouteList>,
    pub ipv6_routes: Option<Ipv6RouteList>,
    pub ipv4_candidates: ElectionResults<Ipv4>,
    pub ipv6_candidates: ElectionResults<Ipv6>,
    pub nwi: NwiState,
    /// Change bits not posted yet.
    pub pending: ChangeBits,
}

/// Cloneable sender side of the worker.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub async fn send(&self, event: MonitorEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| DaemonError::ChannelClosed)
    }

    pub async fn set_service(&self, id: impl Into<ServiceId>, config: Option<ServiceConfig>) -> Result<()> {
        self.send(MonitorEvent::ServicesChanged {
            changes: vec![(id.into(), config)],
        })
        .await
    }

    pub async fn set_global(&self, global: GlobalConfig) -> Result<()> {
        self.send(MonitorEvent::GlobalChanged(global)).await
    }

    pub async fn set_interfaces(&self, interfaces: Vec<(String, u32)>) -> Result<()> {
        self.send(MonitorEvent::InterfacesChanged(interfaces)).await
    }

    /// Feeds a whole configuration snapshot, interfaces first.
    pub async fn load(&self, snapshot: ServicesSnapshot) -> Result<()> {
        self.set_interfaces(snapshot.interfaces.into_iter().collect()).await?;
        self.set_global(snapshot.global).await?;
        self.send(MonitorEvent::ServicesChanged {
            changes: snapshot
                .services
                .into_iter()
                .map(|(id, config)| (id, Some(config)))
                .collect(),
        })
        .await
    }

    pub async fn set_interface_rank(
        &self,
        session: SessionId,
        ifname: impl Into<String>,
        assertion: Option<RankAssertion>,
    ) -> Result<()> {
        self.send(MonitorEvent::InterfaceRank {
            session,
            ifname: ifname.into(),
            assertion,
        })
        .await
    }

    pub async fn set_interface_advisory(&self, session: SessionId, ifname: impl Into<String>, active: bool) -> Result<()> {
        self.send(MonitorEvent::InterfaceAdvisory {
            session,
            ifname: ifname.into(),
            active,
        })
        .await
    }

    pub async fn close_session(&self, session: SessionId) -> Result<()> {
        self.send(MonitorEvent::SessionClosed { session }).await
    }

    pub async fn ack(&self, consumer: SyncedConsumer) -> Result<()> {
        self.send(MonitorEvent::Ack(consumer)).await
    }

    /// Returns the state after every event sent before this call.
    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(MonitorEvent::Snapshot(tx)).await?;
        rx.await.map_err(|_| DaemonError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(MonitorEvent::Shutdown).await
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The serialization worker.
pub struct Monitor {
    state: ReconcilerState,
    source: ServicesSnapshot,
    queue: ChangeQueue,
    notifier: NetworkChangeNotifier,
    kernel: Arc<dyn RouteKernel>,
    publisher: Arc<dyn Publisher>,
    rx: mpsc::Receiver<MonitorEvent>,
}

impl Monitor {
    pub fn new(
        config: &MonitorConfig,
        kernel: Arc<dyn RouteKernel>,
        publisher: Arc<dyn Publisher>,
    ) -> (Self, MonitorHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let state = ReconcilerState::new(InterfaceRankTable::new(config.rank_conflict_policy))
            .with_netboot(config.netboot);
        let monitor = Self {
            state,
            source: ServicesSnapshot::new(),
            queue: ChangeQueue::new(),
            notifier: NetworkChangeNotifier::new(Duration::from_millis(config.post_delay_ms)),
            kernel,
            publisher,
            rx,
        };
        (monitor, MonitorHandle { tx })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!("IpMonitor: worker started");
        loop {
            let deadline = self.notifier.deadline();
            let event = tokio::select! {
                event = self.rx.recv() => event,
                _ = wait_deadline(deadline) => None,
            };
            let Some(event) = event else {
                if deadline.is_some_and(|deadline| deadline <= Instant::now()) {
                    let notifications = self.notifier.timer_fired(Instant::now());
                    self.deliver(notifications).await;
                    continue;
                }
                break;
            };

            let mut shutdown = false;
            let mut replies = Vec::new();
            self.handle(event, &mut shutdown, &mut replies).await;
            while let Ok(event) = self.rx.try_recv() {
                self.handle(event, &mut shutdown, &mut replies).await;
            }
            self.flush().await;

            for reply in replies {
                if reply.send(self.snapshot()).is_err() {
                    debug!("IpMonitor: snapshot requester went away");
                }
            }
            if shutdown {
                break;
            }
        }
        self.post_pending().await;
        info!("IpMonitor: worker stopped");
    }

    /// Posts changes still waiting on an unacknowledged consumer.
    async fn post_pending(&mut self) {
        let pending = self.notifier.pending();
        if pending.is_empty() {
            return;
        }
        debug!("IpMonitor: posting pending changes 0x{:x} before exit", pending.bits());
        let notifications = self.notifier.timer_fired(Instant::now());
        self.deliver(notifications).await;
    }

    async fn handle(
        &mut self,
        event: MonitorEvent,
        shutdown: &mut bool,
        replies: &mut Vec<oneshot::Sender<MonitorSnapshot>>,
    ) {
        match event {
            MonitorEvent::ServicesChanged { changes } => self.queue.add_services(changes),
            MonitorEvent::GlobalChanged(global) => self.queue.set_global(global),
            MonitorEvent::InterfacesChanged(interfaces) => self.queue.set_interfaces(interfaces),
            MonitorEvent::InterfaceRank {
                session,
                ifname,
                assertion,
            } => {
                if self.state.rank_table_mut().set_assertion(session, &ifname, assertion) {
                    self.queue.interface_rank_changed(ifname);
                }
            }
            MonitorEvent::InterfaceAdvisory { session, ifname, active } => {
                if self.state.rank_table_mut().set_advisory(session, &ifname, active) {
                    self.queue.interface_rank_changed(ifname);
                }
            }
            MonitorEvent::SessionClosed { session } => {
                for ifname in self.state.rank_table_mut().close_session(session) {
                    self.queue.interface_rank_changed(ifname);
                }
            }
            MonitorEvent::Ack(consumer) => {
                let notifications = self.notifier.ack(consumer, Instant::now());
                self.deliver(notifications).await;
            }
            MonitorEvent::Snapshot(reply) => replies.push(reply),
            MonitorEvent::Shutdown => *shutdown = true,
        }
    }

    /// Processes everything queued as one batch.
    #[instrument(skip(self), fields(pending = self.queue.pending_count()))]
    async fn flush(&mut self) {
        if !self.queue.has_pending() {
            return;
        }
        let batch = self.queue.drain_into(&mut self.source);
        if batch.is_empty() {
            return;
        }
        debug!(
            "IpMonitor: processing {} services, {} interface rank changes",
            batch.services.len(),
            batch.interface_rank_changes.len()
        );
        let summary = self
            .state
            .process_changes(&batch, &self.source, self.kernel.as_ref(), self.publisher.as_ref())
            .await;

        if summary.nwi_published {
            self.notifier.published(SyncedConsumer::Nwi);
        }
        if summary.dnsinfo_published {
            self.notifier.published(SyncedConsumer::DnsInfo);
        }
        let notifications = self.notifier.post(summary.bits, Instant::now());
        self.deliver(notifications).await;
    }

    #[instrument(skip_all, fields(count = notifications.len()))]
    async fn deliver(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.publisher.notify(notification).await;
        }
    }

    fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            primary_ipv4: self.state.ipv4().primary_info.clone(),
            primary_ipv6: self.state.ipv6().primary_info.clone(),
            primary_dns: self.state.primary_dns().cloned(),
            primary_proxies: self.state.primary_proxies().cloned(),
            ipv4_routes: self.state.ipv4().routes.clone(),
            ipv6_routes: self.state.ipv6().routes.clone(),
            ipv4_candidates: self.state.ipv4().results.clone(),
            ipv6_candidates: self.state.ipv6().results.clone(),
            nwi: self.state.nwi().clone(),
            pending: self.notifier.pending(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ipv4Config;
    use crate::kernel::LoggingKernel;
    use crate::reconcile::RecordingPublisher;
    use ipmon_types::Ipv4Address;
    use pretty_assertions::assert_eq;

    fn wifi() -> ServiceConfig {
        ServiceConfig {
            ipv4: Some(Ipv4Config {
                interface_name: Some("en0".to_string()),
                addresses: vec![Ipv4Address::new(10, 0, 0, 2)],
                subnet_masks: vec![Ipv4Address::new(255, 255, 255, 0)],
                router: Some(Ipv4Address::new(10, 0, 0, 1)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn start(post_delay_ms: u64) -> (MonitorHandle, Arc<RecordingPublisher>, JoinHandle<()>) {
        let publisher = Arc::new(RecordingPublisher::new());
        let config = MonitorConfig {
            post_delay_ms,
            ..Default::default()
        };
        let (monitor, handle) = Monitor::new(&config, Arc::new(LoggingKernel), publisher.clone());
        (handle, publisher, monitor.spawn())
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_elects_and_snapshots() {
        let (handle, _publisher, worker) = start(5000);
        handle.set_interfaces(vec![("en0".to_string(), 4)]).await.unwrap();
        handle.set_service("wifi", Some(wifi())).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        let primary = snapshot.primary_ipv4.unwrap();
        assert_eq!(primary.service, ServiceId::from("wifi"));
        assert_eq!(primary.interface.as_deref(), Some("en0"));
        assert!(snapshot.ipv4_routes.unwrap().first().unwrap().is_default());
        assert_eq!(snapshot.ipv4_candidates.len(), 1);

        handle.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_change_posts_on_timeout() {
        let (handle, publisher, worker) = start(5000);
        handle.set_interfaces(vec![("en0".to_string(), 4)]).await.unwrap();
        handle.set_service("wifi", Some(wifi())).await.unwrap();

        // Consumers have not acked the first snapshot, so the change waits.
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.pending.contains(ChangeBits::NET));
        assert!(publisher.notifications().await.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let notifications = publisher.notifications().await;
        assert!(notifications.contains(&Notification::Nwi));
        assert!(notifications.contains(&Notification::Dns));
        assert!(handle.snapshot().await.unwrap().pending.is_empty());

        handle.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acks_post_immediately() {
        let (handle, publisher, worker) = start(60_000);
        handle.set_interfaces(vec![("en0".to_string(), 4)]).await.unwrap();
        handle.set_service("wifi", Some(wifi())).await.unwrap();
        handle.snapshot().await.unwrap();

        handle.ack(SyncedConsumer::Nwi).await.unwrap();
        handle.ack(SyncedConsumer::DnsInfo).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert!(publisher.notifications().await.contains(&Notification::Nwi));

        handle.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_interface_rank_event_reaches_election() {
        let (handle, _publisher, worker) = start(5000);
        handle.set_interfaces(vec![("en0".to_string(), 4)]).await.unwrap();
        handle.set_service("wifi", Some(wifi())).await.unwrap();
        handle.snapshot().await.unwrap();

        handle.set_interface_rank(1, "en0", Some(RankAssertion::Never)).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.primary_ipv4, None);

        handle.close_session(1).await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.primary_ipv4.map(|p| p.service), Some(ServiceId::from("wifi")));

        handle.shutdown().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_posts_pending_changes() {
        let (handle, publisher, worker) = start(60_000);
        handle.set_interfaces(vec![("en0".to_string(), 4)]).await.unwrap();
        handle.set_service("wifi", Some(wifi())).await.unwrap();
        assert!(handle.snapshot().await.unwrap().pending.contains(ChangeBits::NET));
        assert!(publisher.notifications().await.is_empty());

        handle.shutdown().await.unwrap();
        worker.await.unwrap();
        let notifications = publisher.notifications().await;
        assert!(notifications.contains(&Notification::Nwi));
        assert!(notifications.contains(&Notification::Dns));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handles_post_pending_changes() {
        let (handle, publisher, worker) = start(60_000);
        handle.set_interfaces(vec![("en0".to_string(), 4)]).await.unwrap();
        handle.set_service("wifi", Some(wifi())).await.unwrap();
        handle.snapshot().await.unwrap();

        drop(handle);
        worker.await.unwrap();
        assert!(publisher.notifications().await.contains(&Notification::Nwi));
    }

    #[tokio::test]
    async fn test_closed_worker_is_an_error() {
        let (handle, _publisher, worker) = start(5000);
        handle.shutdown().await.unwrap();
        worker.await.unwrap();
        assert!(matches!(handle.snapshot().await, Err(DaemonError::ChannelClosed)));
    }
}
