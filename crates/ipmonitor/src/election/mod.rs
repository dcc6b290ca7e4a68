//! Primary service election.
//!
//! Each family ranks its services into [`ElectionResults`], then
//! [`get_primary`] walks them best-first to pick the primary while merging
//! every service's routes into the family's aggregate table and recording
//! the network information snapshot.

mod candidate;
mod nwi;
mod primary;

pub use candidate::{build_candidates, Candidate, ElectionResults, ReachabilityFlags};
pub use nwi::{NwiFlags, NwiInterfaceState, NwiState};
pub use primary::{get_primary, needs_demotion, ElectionOutcome};

use crate::builder::{FamilyState, ServiceState};
use crate::route::{AddressFamily, Ipv4, Ipv6};

/// Per-family access used by the election.
pub trait ElectionFamily: AddressFamily {
    /// Family label of the other family, for log lines.
    const OTHER_LABEL: char;
    /// Whether candidates of this family can carry a CLAT46 address.
    const SUPPORTS_CLAT46: bool;

    /// Returns the service's state for this family.
    fn state(service: &ServiceState) -> Option<&FamilyState<Self>>;

    /// Returns this family's interface list in the snapshot.
    fn nwi_interfaces(nwi: &mut NwiState) -> &mut Vec<NwiInterfaceState>;
}

impl ElectionFamily for Ipv4 {
    const OTHER_LABEL: char = '6';
    const SUPPORTS_CLAT46: bool = true;

    fn state(service: &ServiceState) -> Option<&FamilyState<Self>> {
        service.ipv4.as_ref()
    }

    fn nwi_interfaces(nwi: &mut NwiState) -> &mut Vec<NwiInterfaceState> {
        &mut nwi.ipv4
    }
}

impl ElectionFamily for Ipv6 {
    const OTHER_LABEL: char = '4';
    const SUPPORTS_CLAT46: bool = false;

    fn state(service: &ServiceState) -> Option<&FamilyState<Self>> {
        service.ipv6.as_ref()
    }

    fn nwi_interfaces(nwi: &mut NwiState) -> &mut Vec<NwiInterfaceState> {
        &mut nwi.ipv6
    }
}
