//! Network service identifier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a configured network service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        ServiceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        ServiceId(id.to_string())
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        ServiceId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_service_id_ordering() {
        let mut ids = vec![ServiceId::from("b"), ServiceId::from("a")];
        ids.sort();
        assert_eq!(ids, vec![ServiceId::from("a"), ServiceId::from("b")]);
    }

    #[test]
    fn test_service_id_serde_is_transparent() {
        let json = serde_json::to_string(&ServiceId::new("svc-1")).unwrap();
        assert_eq!(json, "\"svc-1\"");
    }
}
