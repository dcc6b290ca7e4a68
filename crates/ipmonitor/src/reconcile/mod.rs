//! Reconciliation of configuration changes into kernel routes.
//!
//! [`ReconcilerState`] is owned by the single daemon worker. Each
//! [`ChangeBatch`] rebuilds the affected services, re-runs the election,
//! applies the route table diff and yields the [`ChangeBits`] the
//! [`NetworkChangeNotifier`] posts once downstream consumers are ready.

mod notify;
mod publisher;
mod state;

pub use notify::{ChangeBits, NetworkChangeNotifier, Notification, SyncedConsumer};
pub use publisher::{
    DownstreamUpdate, LoggingPublisher, PrimaryInfo, Published, Publisher, RecordingPublisher, RouteTable,
};
pub use state::{ChangeBatch, ChangeSummary, FamilyTables, ReconcileFamily, ReconcilerState};
