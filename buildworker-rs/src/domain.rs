//! Resolution of the externally reachable domain name of a worker.
//!
//! Two strategies are supported:
//!
//! - [`DomainStrategy::EphemeralWildcard`]: the name is derived from the
//!   worker's public address through a wildcard DNS service, which maps
//!   `<ip>.sslip.io` back to `<ip>`. No DNS resource is needed, but the name
//!   only exists once the address has been assigned.
//!
//! - [`DomainStrategy::ManagedZone`]: the name is `<hostname>.<zone>` in an
//!   operator-controlled DNS zone. It is known immediately; the planner
//!   additionally creates an A record pointing at the address.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::output::Output;

/// Wildcard DNS service used by [`DomainStrategy::EphemeralWildcard`].
pub const WILDCARD_DNS_SUFFIX: &str = "sslip.io";

/// Worker hostname used in a managed zone when none is configured.
pub const DEFAULT_WORKER_HOSTNAME: &str = "buildworker";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DomainStrategy {
    EphemeralWildcard,
    ManagedZone {
        hostname: Option<String>,
        zone_name: String,
        /// Resource group holding the (pre-existing) zone.
        zone_resource_group: String,
    },
}

impl Default for DomainStrategy {
    fn default() -> Self {
        DomainStrategy::EphemeralWildcard
    }
}

impl DomainStrategy {
    /// Resolve the worker's domain.
    ///
    /// For the ephemeral strategy the returned output is only known once
    /// `ip_address` is. The managed strategy never reads the address.
    pub fn resolve(&self, ip_address: &Output<Ipv4Addr>) -> Output<Domain> {
        match self {
            DomainStrategy::EphemeralWildcard => ip_address.map(Domain::ephemeral),
            DomainStrategy::ManagedZone {
                hostname,
                zone_name,
                ..
            } => Output::known(Domain::ManagedRecord {
                hostname: hostname
                    .clone()
                    .unwrap_or_else(|| DEFAULT_WORKER_HOSTNAME.to_string()),
                zone: zone_name.clone(),
            }),
        }
    }

    /// Whether this strategy needs a DNS record resource.
    pub fn requires_record(&self) -> bool {
        matches!(self, DomainStrategy::ManagedZone { .. })
    }
}

/// The single domain name a worker answers on.
///
/// Ephemeral domains are dotted IPv4 names under the wildcard service, backed
/// by the worker's A record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Domain {
    EphemeralWildcard { ip_address: Ipv4Addr },
    ManagedRecord { hostname: String, zone: String },
}

impl Domain {
    pub fn ephemeral(ip_address: Ipv4Addr) -> Self {
        Domain::EphemeralWildcard { ip_address }
    }

    pub fn name(&self) -> String {
        match self {
            Domain::EphemeralWildcard { ip_address } => {
                format!("{ip_address}.{WILDCARD_DNS_SUFFIX}")
            }
            Domain::ManagedRecord { hostname, zone } => format!("{hostname}.{zone}"),
        }
    }

    pub fn url(&self) -> String {
        format!("https://{}", self.name())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
