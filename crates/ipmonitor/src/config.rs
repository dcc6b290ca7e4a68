//! Configuration model.
//!
//! [`MonitorConfig`] tunes the daemon itself. [`GlobalConfig`] and
//! [`ServiceConfig`] are the typed view of the network configuration the
//! election runs on; they are delivered by the configuration store (or a
//! snapshot file) and read through [`ConfigSource`].

use ipmon_types::{IpAddress, Ipv4Address, Ipv6Address, RankAssertion, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::assertions::RankConflictPolicy;
use crate::kernel::{InterfaceTable, StaticInterfaces};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Daemon tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long to wait for downstream consumers before posting anyway.
    pub post_delay_ms: u64,
    /// The system booted from the network; never touch the IPv4 default route.
    pub netboot: bool,
    /// How disagreeing interface rank assertions are resolved.
    pub rank_conflict_policy: RankConflictPolicy,
    /// Worker mailbox size.
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            post_delay_ms: 5000,
            netboot: false,
            rank_conflict_policy: RankConflictPolicy::default(),
            channel_capacity: 128,
        }
    }
}

impl MonitorConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration shared by every service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Configured service preference order, best first.
    pub service_order: Vec<ServiceId>,
    /// Dial-up (`ppp*`) services assert `First`.
    pub ppp_override_primary: bool,
}

/// A static IPv4 route from a service's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4RouteSpec {
    pub destination_address: Option<Ipv4Address>,
    pub subnet_mask: Option<Ipv4Address>,
    pub gateway_address: Option<Ipv4Address>,
    /// Interface that must carry an excluded route.
    pub interface_name: Option<String>,
}

/// A static IPv6 route from a service's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6RouteSpec {
    pub destination_address: Option<Ipv6Address>,
    pub prefix_length: Option<u32>,
    pub gateway_address: Option<Ipv6Address>,
    pub interface_name: Option<String>,
}

/// IPv4 state of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Config {
    pub interface_name: Option<String>,
    pub confirmed_interface_name: Option<String>,
    pub addresses: Vec<Ipv4Address>,
    pub subnet_masks: Vec<Ipv4Address>,
    pub router: Option<Ipv4Address>,
    pub dest_addresses: Vec<Ipv4Address>,
    pub additional_routes: Vec<Ipv4RouteSpec>,
    pub excluded_routes: Vec<Ipv4RouteSpec>,
    pub override_primary: bool,
    pub is_null: bool,
    pub network_signature: Option<String>,
}

/// IPv6 state of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Config {
    pub interface_name: Option<String>,
    pub confirmed_interface_name: Option<String>,
    pub addresses: Vec<Ipv6Address>,
    pub prefix_lengths: Vec<u32>,
    pub router: Option<Ipv6Address>,
    pub dest_addresses: Vec<Ipv6Address>,
    pub additional_routes: Vec<Ipv6RouteSpec>,
    pub excluded_routes: Vec<Ipv6RouteSpec>,
    pub override_primary: bool,
    pub is_null: bool,
    pub network_signature: Option<String>,
}

/// Administrator overrides layered on top of a family's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupOverride<A, R> {
    pub router: Option<A>,
    pub additional_routes: Vec<R>,
}

impl<A, R> Default for SetupOverride<A, R> {
    fn default() -> Self {
        Self {
            router: None,
            additional_routes: Vec::new(),
        }
    }
}

/// Per-service options that feed the rank computation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptionsConfig {
    /// Rank assertion published with the service state.
    pub primary_rank: Option<RankAssertion>,
    /// Rank assertion configured by the administrator.
    pub setup_primary_rank: Option<RankAssertion>,
    /// Explicit position in the service order.
    pub service_index: Option<i64>,
    pub ip_is_coupled: bool,
    /// Metered/expensive services always couple IPv4 and IPv6.
    pub expensive: bool,
}

/// Status of a VPN/dial-up connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnStatus {
    #[default]
    Connected,
    Connecting,
    Disconnecting,
    Idle,
}

/// Transient (VPN/dial-up) connection attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    pub server_address: Option<IpAddress>,
    pub status: Option<VpnStatus>,
    /// Connects automatically on traffic.
    pub on_demand: bool,
}

/// Complete configuration of one network service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub ipv4: Option<Ipv4Config>,
    pub ipv4_setup: Option<SetupOverride<Ipv4Address, Ipv4RouteSpec>>,
    pub ipv6: Option<Ipv6Config>,
    pub ipv6_setup: Option<SetupOverride<Ipv6Address, Ipv6RouteSpec>>,
    pub service: ServiceOptionsConfig,
    /// The service publishes DNS configuration.
    pub dns: bool,
    /// The service publishes proxy configuration.
    pub proxies: bool,
    /// IPv4 is provided through CLAT46 translation.
    pub clat46: bool,
    pub vpn: Option<VpnConfig>,
}

impl ServiceConfig {
    /// Returns the interface names used by either family.
    pub fn interface_names(&self) -> impl Iterator<Item = &str> {
        let v4 = self.ipv4.as_ref().and_then(|c| c.interface_name.as_deref());
        let v6 = self.ipv6.as_ref().and_then(|c| c.interface_name.as_deref());
        v4.into_iter().chain(v6)
    }
}

/// Read access to the current configuration.
pub trait ConfigSource: Send + Sync {
    fn global(&self) -> &GlobalConfig;
    fn service(&self, id: &ServiceId) -> Option<&ServiceConfig>;
    fn service_ids(&self) -> Vec<ServiceId>;
    fn interfaces(&self) -> &dyn InterfaceTable;
}

/// In-memory configuration store maintained by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesSnapshot {
    pub global: GlobalConfig,
    pub services: BTreeMap<ServiceId, ServiceConfig>,
    pub interfaces: BTreeMap<String, u32>,
    #[serde(skip)]
    interface_table: StaticInterfaces,
}

impl ServicesSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a snapshot from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut snapshot: Self = read_json(path.as_ref())?;
        snapshot.rebuild_interface_table();
        Ok(snapshot)
    }

    /// Parses a snapshot from a JSON string.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut snapshot: Self = serde_json::from_str(text)?;
        snapshot.rebuild_interface_table();
        Ok(snapshot)
    }

    fn rebuild_interface_table(&mut self) {
        self.interface_table = self
            .interfaces
            .iter()
            .map(|(name, index)| (name.clone(), *index))
            .collect();
    }

    /// Stores or removes a service. Returns true if the entry changed.
    pub fn set_service(&mut self, id: ServiceId, config: Option<ServiceConfig>) -> bool {
        match config {
            Some(config) => self.services.insert(id, config.clone()).as_ref() != Some(&config),
            None => self.services.remove(&id).is_some(),
        }
    }

    pub fn set_global(&mut self, global: GlobalConfig) -> bool {
        let changed = self.global != global;
        self.global = global;
        changed
    }

    /// Adds, renumbers or (with index 0) removes an interface.
    pub fn set_interface(&mut self, name: impl Into<String>, index: u32) {
        let name = name.into();
        if index == 0 {
            self.interfaces.remove(&name);
        } else {
            self.interfaces.insert(name.clone(), index);
        }
        self.interface_table.set(name, index);
    }

    pub fn with_interface(mut self, name: impl Into<String>, index: u32) -> Self {
        self.set_interface(name, index);
        self
    }

    pub fn with_service(mut self, id: impl Into<ServiceId>, config: ServiceConfig) -> Self {
        self.set_service(id.into(), Some(config));
        self
    }

    pub fn with_global(mut self, global: GlobalConfig) -> Self {
        self.global = global;
        self
    }
}

impl ConfigSource for ServicesSnapshot {
    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn service(&self, id: &ServiceId) -> Option<&ServiceConfig> {
        self.services.get(id)
    }

    fn service_ids(&self) -> Vec<ServiceId> {
        self.services.keys().cloned().collect()
    }

    fn interfaces(&self) -> &dyn InterfaceTable {
        &self.interface_table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_monitor_config_defaults() {
        let config: MonitorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MonitorConfig::default());
        assert_eq!(config.post_delay_ms, 5000);
        assert_eq!(config.rank_conflict_policy, RankConflictPolicy::Strongest);
    }

    #[test]
    fn test_monitor_config_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"post_delay_ms": 250, "netboot": true, "rank_conflict_policy": "weakest"}}"#
        )
        .unwrap();

        let config = MonitorConfig::load(file.path()).unwrap();
        assert_eq!(config.post_delay_ms, 250);
        assert!(config.netboot);
        assert_eq!(config.rank_conflict_policy, RankConflictPolicy::Weakest);
        assert_eq!(config.channel_capacity, 128);
    }

    #[test]
    fn test_monitor_config_rejects_zero_capacity() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"channel_capacity": 0}}"#).unwrap();
        assert!(matches!(
            MonitorConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            MonitorConfig::load("/nonexistent/ipmonitor.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_snapshot_parse() {
        let snapshot = ServicesSnapshot::from_json(
            r#"{
                "global": { "service_order": ["wifi", "ether"] },
                "services": {
                    "wifi": {
                        "ipv4": {
                            "interface_name": "en0",
                            "addresses": ["10.0.0.2"],
                            "subnet_masks": ["255.255.255.0"],
                            "router": "10.0.0.1"
                        },
                        "service": { "primary_rank": "Never" },
                        "dns": true
                    }
                },
                "interfaces": { "lo0": 1, "en0": 4 }
            }"#,
        )
        .unwrap();

        let wifi = snapshot.service(&ServiceId::from("wifi")).unwrap();
        let ipv4 = wifi.ipv4.as_ref().unwrap();
        assert_eq!(ipv4.router, Some(Ipv4Address::new(10, 0, 0, 1)));
        assert_eq!(wifi.service.primary_rank, Some(RankAssertion::Never));
        assert!(wifi.dns);
        assert_eq!(snapshot.interfaces().index_for("en0"), Some(4));
        assert_eq!(snapshot.global().service_order.len(), 2);
    }

    #[test]
    fn test_set_service_reports_changes() {
        let mut snapshot = ServicesSnapshot::new();
        let id = ServiceId::from("wifi");
        assert!(snapshot.set_service(id.clone(), Some(ServiceConfig::default())));
        assert!(!snapshot.set_service(id.clone(), Some(ServiceConfig::default())));
        assert!(snapshot.set_service(id.clone(), None));
        assert!(!snapshot.set_service(id, None));
    }

    #[test]
    fn test_interface_names() {
        let config = ServiceConfig {
            ipv4: Some(Ipv4Config {
                interface_name: Some("en0".to_string()),
                ..Default::default()
            }),
            ipv6: Some(Ipv6Config {
                interface_name: Some("en0".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(config.interface_names().collect::<Vec<_>>(), vec!["en0", "en0"]);
    }
}
