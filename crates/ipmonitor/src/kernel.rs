//! Kernel capabilities used by the route engine.
//!
//! The daemon never talks to a routing socket directly. Route writes go
//! through [`RouteKernel`] and interface name/index resolution through
//! [`InterfaceTable`], so tests and dry runs can substitute their own.

use ipmon_types::IpAddress;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Errno-like result of a kernel route operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("route already exists")]
    Exists,

    #[error("route not found")]
    NotFound,

    #[error("no interface specified")]
    NoInterface,

    #[error("route intentionally not applied")]
    NotApplied,

    #[error("routing socket not open")]
    BadDescriptor,

    #[error("kernel error {0}")]
    Os(i32),
}

/// Result type for kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Route operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RouteOp {
    Add,
    Delete,
}

impl fmt::Display for RouteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteOp::Add => f.write_str("add"),
            RouteOp::Delete => f.write_str("delete"),
        }
    }
}

/// Gateway of a route message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Gateway {
    /// Next hop address, with its scope for link-local IPv6.
    Address { addr: IpAddress, scope_id: Option<u32> },
    /// Directly connected through the interface.
    Link(u32),
}

/// A fully serialized route add/delete request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteMessage {
    pub op: RouteOp,
    pub dest: IpAddress,
    pub dest_scope_id: Option<u32>,
    /// Absent for host routes.
    pub netmask: Option<IpAddress>,
    pub gateway: Gateway,
    pub ifindex: u32,
    /// Source address; absent when unspecified.
    pub ifa: Option<IpAddress>,
    /// Interface the route is scoped to.
    pub ifscope: Option<u32>,
    pub host: bool,
    pub cloning: bool,
    pub static_route: bool,
}

impl fmt::Display for RouteMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.dest)?;
        if let Some(mask) = &self.netmask {
            write!(f, " mask {}", mask)?;
        }
        match &self.gateway {
            Gateway::Address { addr, .. } => write!(f, " gateway {}", addr)?,
            Gateway::Link(index) => write!(f, " link #{}", index)?,
        }
        write!(f, " ifp #{}", self.ifindex)?;
        if let Some(ifa) = &self.ifa {
            write!(f, " ifa {}", ifa)?;
        }
        if let Some(scope) = self.ifscope {
            write!(f, " ifscope #{}", scope)?;
        }
        Ok(())
    }
}

/// Writes route messages to the kernel routing table.
///
/// Calls are synchronous and run on the reconciliation worker.
pub trait RouteKernel: Send + Sync {
    fn apply(&self, message: &RouteMessage) -> Result<()>;
}

/// Kernel stand-in that only logs what would be written.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingKernel;

impl RouteKernel for LoggingKernel {
    fn apply(&self, message: &RouteMessage) -> Result<()> {
        info!("IpMonitor: [dry-run] route {}", message);
        Ok(())
    }
}

/// Interface name and index resolution.
pub trait InterfaceTable: Send + Sync {
    fn index_for(&self, name: &str) -> Option<u32>;
    fn name_for(&self, index: u32) -> Option<String>;
}

/// In-memory interface table fed from configuration and events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticInterfaces {
    by_name: HashMap<String, u32>,
}

impl StaticInterfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an interface. An index of 0 removes it.
    pub fn set(&mut self, name: impl Into<String>, index: u32) {
        let name = name.into();
        if index == 0 {
            self.by_name.remove(&name);
        } else {
            self.by_name.insert(name, index);
        }
    }

    pub fn with(mut self, name: impl Into<String>, index: u32) -> Self {
        self.set(name, index);
        self
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for StaticInterfaces {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (name, index) in iter {
            table.set(name, index);
        }
        table
    }
}

impl InterfaceTable for StaticInterfaces {
    fn index_for(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    fn name_for(&self, index: u32) -> Option<String> {
        self.by_name
            .iter()
            .find(|(_, &i)| i == index)
            .map(|(name, _)| name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipmon_types::Ipv4Address;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_static_interfaces() {
        let mut table: StaticInterfaces = [("lo0", 1), ("en0", 4)].into_iter().collect();
        assert_eq!(table.index_for("en0"), Some(4));
        assert_eq!(table.name_for(1).as_deref(), Some("lo0"));
        assert_eq!(table.index_for("en1"), None);

        table.set("en0", 0);
        assert_eq!(table.index_for("en0"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_route_message_display() {
        let message = RouteMessage {
            op: RouteOp::Add,
            dest: IpAddress::V4(Ipv4Address::UNSPECIFIED),
            dest_scope_id: None,
            netmask: Some(IpAddress::V4(Ipv4Address::UNSPECIFIED)),
            gateway: Gateway::Address {
                addr: IpAddress::V4(Ipv4Address::new(10, 0, 0, 1)),
                scope_id: None,
            },
            ifindex: 4,
            ifa: Some(IpAddress::V4(Ipv4Address::new(10, 0, 0, 2))),
            ifscope: None,
            host: false,
            cloning: false,
            static_route: true,
        };
        assert_eq!(
            message.to_string(),
            "add 0.0.0.0 mask 0.0.0.0 gateway 10.0.0.1 ifp #4 ifa 10.0.0.2"
        );
        assert!(LoggingKernel.apply(&message).is_ok());
    }
}
