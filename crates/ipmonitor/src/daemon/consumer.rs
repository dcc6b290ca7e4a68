//! Coalescing queue of configuration changes.

use ipmon_types::ServiceId;
use std::collections::BTreeMap;

use crate::config::{GlobalConfig, ServiceConfig, ServicesSnapshot};
use crate::reconcile::ChangeBatch;

/// Operation on one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOp {
    Set(Box<ServiceConfig>),
    Del,
}

impl From<Option<ServiceConfig>> for ServiceOp {
    fn from(config: Option<ServiceConfig>) -> Self {
        match config {
            Some(config) => ServiceOp::Set(Box::new(config)),
            None => ServiceOp::Del,
        }
    }
}

/// Changes received since the last batch.
///
/// A service keeps only its latest operation: configurations are complete,
/// so a newer SET or DEL replaces whatever was pending. Services are handed
/// out in the order they were first seen.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    order: Vec<ServiceId>,
    services: BTreeMap<ServiceId, ServiceOp>,
    global: Option<GlobalConfig>,
    interfaces: BTreeMap<String, u32>,
    rank_changes: Vec<String>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> usize {
        self.services.len()
            + usize::from(self.global.is_some())
            + self.interfaces.len()
            + self.rank_changes.len()
    }

    pub fn add_service(&mut self, id: ServiceId, op: ServiceOp) {
        if !self.services.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.services.insert(id, op);
    }

    pub fn add_services(&mut self, changes: Vec<(ServiceId, Option<ServiceConfig>)>) {
        for (id, config) in changes {
            self.add_service(id, config.into());
        }
    }

    pub fn set_global(&mut self, global: GlobalConfig) {
        self.global = Some(global);
    }

    /// Records interface index updates; an index of 0 removes the interface.
    pub fn set_interfaces(&mut self, interfaces: Vec<(String, u32)>) {
        self.interfaces.extend(interfaces);
    }

    pub fn interface_rank_changed(&mut self, ifname: impl Into<String>) {
        let ifname = ifname.into();
        if !self.rank_changes.contains(&ifname) {
            self.rank_changes.push(ifname);
        }
    }

    /// Stores the pending changes into `snapshot` and returns the batch the
    /// reconciler must process.
    ///
    /// Renumbered interfaces invalidate every service configured on them.
    pub fn drain_into(&mut self, snapshot: &mut ServicesSnapshot) -> ChangeBatch {
        let pending = std::mem::take(self);
        let mut batch = ChangeBatch::new();

        if let Some(global) = pending.global {
            batch.global_changed = snapshot.set_global(global);
        }

        for (name, index) in pending.interfaces {
            if snapshot.interfaces.get(&name).copied().unwrap_or(0) == index {
                continue;
            }
            snapshot.set_interface(name.clone(), index);
            let affected: Vec<ServiceId> = snapshot
                .services
                .iter()
                .filter(|(_, config)| config.interface_names().any(|ifname| ifname == name))
                .map(|(id, _)| id.clone())
                .collect();
            for id in affected {
                batch.add_service(id);
            }
        }

        let mut services = pending.services;
        for id in pending.order {
            let Some(op) = services.remove(&id) else {
                continue;
            };
            let config = match op {
                ServiceOp::Set(config) => Some(*config),
                ServiceOp::Del => None,
            };
            if snapshot.set_service(id.clone(), config) {
                batch.add_service(id);
            }
        }

        for ifname in pending.rank_changes {
            batch.add_interface(ifname);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Ipv4Config;
    use pretty_assertions::assert_eq;

    fn config(ifname: &str) -> ServiceConfig {
        ServiceConfig {
            ipv4: Some(Ipv4Config {
                interface_name: Some(ifname.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_operation_wins() {
        let mut snapshot = ServicesSnapshot::new().with_service("a", config("en0"));
        let mut queue = ChangeQueue::new();
        queue.add_service(ServiceId::from("b"), ServiceOp::from(Some(config("en1"))));
        queue.add_service(ServiceId::from("a"), ServiceOp::from(Some(config("en3"))));
        queue.add_service(ServiceId::from("a"), ServiceOp::Del);
        assert_eq!(queue.pending_count(), 2);

        let batch = queue.drain_into(&mut snapshot);
        // Arrival order is kept even though "a" changed last.
        assert_eq!(batch.services, vec![ServiceId::from("b"), ServiceId::from("a")]);
        assert!(!snapshot.services.contains_key(&ServiceId::from("a")));
        assert!(snapshot.services.contains_key(&ServiceId::from("b")));
    }

    #[test]
    fn test_set_after_del_replaces() {
        let mut snapshot = ServicesSnapshot::new().with_service("a", config("en0"));
        let mut queue = ChangeQueue::new();
        queue.add_services(vec![
            (ServiceId::from("a"), None),
            (ServiceId::from("a"), Some(config("en2"))),
        ]);
        assert_eq!(queue.pending_count(), 1);

        let batch = queue.drain_into(&mut snapshot);
        assert_eq!(batch.services, vec![ServiceId::from("a")]);
        assert_eq!(snapshot.services.get(&ServiceId::from("a")), Some(&config("en2")));
    }

    #[test]
    fn test_drain_into_snapshot() {
        let mut snapshot = ServicesSnapshot::new().with_service("b", config("en1"));
        let mut queue = ChangeQueue::new();
        queue.add_services(vec![
            (ServiceId::from("c"), Some(config("en2"))),
            // Unchanged, not part of the batch.
            (ServiceId::from("b"), Some(config("en1"))),
            // Unknown, nothing to delete.
            (ServiceId::from("z"), None),
        ]);
        queue.set_global(GlobalConfig {
            service_order: vec![ServiceId::from("c")],
            ppp_override_primary: false,
        });
        queue.interface_rank_changed("en0");
        queue.interface_rank_changed("en0");

        let batch = queue.drain_into(&mut snapshot);
        assert!(!queue.has_pending());
        assert_eq!(batch.services, vec![ServiceId::from("c")]);
        assert_eq!(batch.interface_rank_changes, vec!["en0".to_string()]);
        assert!(batch.global_changed);
        assert!(snapshot.services.contains_key(&ServiceId::from("c")));
    }

    #[test]
    fn test_renumbered_interface_touches_services() {
        let mut snapshot = ServicesSnapshot::new()
            .with_interface("en1", 5)
            .with_service("b", config("en1"))
            .with_service("c", config("en2"));
        let mut queue = ChangeQueue::new();
        queue.set_interfaces(vec![("en1".to_string(), 7), ("en2".to_string(), 0)]);

        let batch = queue.drain_into(&mut snapshot);
        assert_eq!(batch.services, vec![ServiceId::from("b")]);
        assert_eq!(snapshot.interfaces.get("en1"), Some(&7));
    }
}
