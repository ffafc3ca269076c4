//! Specifications of the cloud resources making up a worker.
//!
//! These are plain, fully resolved values. The planner assembles them from
//! deferred [`Output`](crate::output::Output)s, and the engine hands them to
//! the provider serialized as JSON. Field names double as the dotted paths
//! used by [`ResourceOptions::replace_on_changes`](crate::provider::ResourceOptions).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::perimeter::SecurityRule;

/// Path of the bootstrap document within [`ComputeInstanceSpec`].
pub const CUSTOM_DATA_PATH: &str = "os_profile.custom_data";

/// Output attribute names reported by providers.
pub mod attr {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const IP_ADDRESS: &str = "ip_address";
    pub const PUBLIC_KEY_OPENSSH: &str = "public_key_openssh";
    pub const PRIVATE_KEY_OPENSSH: &str = "private_key_openssh";
    pub const FQDN: &str = "fqdn";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ResourceGroup,
    VirtualNetwork,
    Subnet,
    SecurityGroup,
    PublicAddress,
    NetworkInterface,
    KeyPair,
    DnsZone,
    DnsRecord,
    ComputeInstance,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ResourceGroup => "resource_group",
            ResourceKind::VirtualNetwork => "virtual_network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::PublicAddress => "public_address",
            ResourceKind::NetworkInterface => "network_interface",
            ResourceKind::KeyPair => "key_pair",
            ResourceKind::DnsZone => "dns_zone",
            ResourceKind::DnsRecord => "dns_record",
            ResourceKind::ComputeInstance => "compute_instance",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupSpec {
    pub location: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationMethod {
    Static,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAddressSpec {
    pub resource_group_name: String,
    pub allocation_method: AllocationMethod,
    pub sku: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNetworkSpec {
    pub resource_group_name: String,
    pub address_prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSpec {
    pub resource_group_name: String,
    pub virtual_network_name: String,
    pub address_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    pub resource_group_name: String,
    pub security_rules: Vec<SecurityRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfiguration {
    pub name: String,
    pub subnet_id: String,
    pub public_address_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub resource_group_name: String,
    pub security_group_id: String,
    pub ip_configurations: Vec<IpConfiguration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyAlgorithm {
    Ed25519,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairSpec {
    pub algorithm: KeyAlgorithm,
}

/// Lookup of an existing DNS zone. Zones are never created by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZoneQuery {
    pub resource_group_name: String,
    pub zone_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ARecord {
    /// Empty while the address is not known yet.
    pub ipv4_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordSpec {
    pub resource_group_name: String,
    pub zone_name: String,
    pub relative_record_set_name: String,
    pub record_type: String,
    pub ttl: u32,
    pub a_records: Vec<ARecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub vm_size: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshPublicKey {
    pub path: String,
    pub key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxConfiguration {
    pub disable_password_authentication: bool,
    pub ssh_public_keys: Vec<SshPublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsProfile {
    pub computer_name: String,
    pub admin_username: String,
    pub linux_configuration: LinuxConfiguration,
    /// Base64-encoded bootstrap document.
    pub custom_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

impl ImageReference {
    /// Ubuntu 24.04 LTS server, latest patch level.
    pub fn ubuntu_lts() -> Self {
        ImageReference {
            publisher: "Canonical".to_string(),
            offer: "ubuntu-24_04-lts".to_string(),
            sku: "server".to_string(),
            version: "latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsDisk {
    pub create_option: String,
    pub caching: String,
    pub storage_account_type: String,
    pub delete_option: String,
}

impl Default for OsDisk {
    fn default() -> Self {
        OsDisk {
            create_option: "FromImage".to_string(),
            caching: "ReadWrite".to_string(),
            storage_account_type: "StandardSSD_LRS".to_string(),
            delete_option: "Delete".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProfile {
    pub image_reference: ImageReference,
    pub os_disk: OsDisk,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub network_interface_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeInstanceSpec {
    pub resource_group_name: String,
    pub hardware_profile: HardwareProfile,
    pub os_profile: OsProfile,
    pub storage_profile: StorageProfile,
    pub network_profile: NetworkProfile,
}
