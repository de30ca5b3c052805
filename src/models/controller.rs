//! Directory entry for one physical controller.

use serde::{Deserialize, Serialize};

/// One embedded controller as reported by the `/hosts` directory.
///
/// The directory owns these records; the sync core only reads them.
/// `visible` and a usable `ip_address` gate participation in sync and
/// lock coordination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Controller {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub visible: bool,
}

impl Controller {
    pub fn new(
        id: impl Into<String>,
        hostname: impl Into<String>,
        ip_address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            online: false,
            visible: true,
        }
    }

    /// Whether this controller takes part in sync and lock coordination.
    pub fn is_syncable(&self) -> bool {
        !self.id.is_empty() && !self.ip_address.is_empty() && self.visible
    }

    /// Display label: hostname when present, ip address otherwise.
    pub fn label(&self) -> &str {
        if self.hostname.is_empty() {
            &self.ip_address
        } else {
            &self.hostname
        }
    }
}
