//! Datastore instance identifiers.

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

const LOOPBACK_NAMES: &[&str] = &["localhost", "localhost.localdomain", "ip6-localhost"];

const UNKNOWN_HOST: &str = "unknown";

/// Canonical `(host, port)` pair naming a datastore instance.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct InstanceId {
    host: Arc<str>,
    port: u16,
}

impl InstanceId {
    /// Returns the canonical host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.port)
    }
}

/// Derives [`InstanceId`] values, collapsing loopback spellings onto the local
/// host name.
///
/// Resolution performs no I/O: the local host name is captured once at
/// construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceResolver {
    local_hostname: Arc<str>,
}

impl InstanceResolver {
    /// Creates a resolver that reports loopback hosts as `local_hostname`.
    #[must_use]
    pub fn new(local_hostname: impl AsRef<str>) -> Self {
        let trimmed = local_hostname.as_ref().trim();
        let local = if trimmed.is_empty() {
            "localhost".to_owned()
        } else {
            trimmed.to_ascii_lowercase()
        };
        Self {
            local_hostname: Arc::from(local),
        }
    }

    /// Creates a resolver that reports loopback hosts under the machine's host
    /// name, read once from the operating system.
    ///
    /// Falls back to `localhost` when the host name is empty or not valid
    /// UTF-8.
    #[must_use]
    pub fn from_system() -> Self {
        let hostname = gethostname::gethostname();
        Self::new(hostname.to_str().unwrap_or_default())
    }

    /// Returns the label substituted for loopback hosts.
    #[must_use]
    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }

    /// Resolves a raw host and port to a canonical instance label.
    #[must_use]
    pub fn resolve(&self, host: &str, port: u16) -> InstanceId {
        let host = host.trim();
        let host = if host.is_empty() {
            Arc::from(UNKNOWN_HOST)
        } else if is_loopback(host) {
            Arc::clone(&self.local_hostname)
        } else {
            Arc::from(host.to_ascii_lowercase())
        };
        InstanceId { host, port }
    }
}

impl Default for InstanceResolver {
    fn default() -> Self {
        Self::from_system()
    }
}

fn is_loopback(host: &str) -> bool {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if LOOPBACK_NAMES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(host))
    {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => addr.is_loopback() || addr == Ipv4Addr::UNSPECIFIED,
        Ok(IpAddr::V6(addr)) => {
            addr.is_loopback()
                || addr == Ipv6Addr::UNSPECIFIED
                || addr.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        Err(_) => false,
    }
}
