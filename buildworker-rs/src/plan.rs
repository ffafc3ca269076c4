//! Provisioning plan of a single build worker.
//!
//! [`plan_build_worker`] declares every resource of a worker on a [`Stack`]
//! and wires the deferred values between them: the public address feeds the
//! domain, the domain feeds the reverse-proxy configuration and bootstrap
//! document, and the document ends up in the compute instance's spec. None of
//! these values are awaited here.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use crate::cloud_init::{self, BootstrapDocument, BootstrapInputs};
use crate::domain::{Domain, DomainStrategy, DEFAULT_WORKER_HOSTNAME};
use crate::engine::{Resource, Stack};
use crate::image::ImageReference;
use crate::output::{DependencyError, Output, Resolved};
use crate::perimeter;
use crate::provider::ResourceOptions;
use crate::proxy_config;
use crate::resources::{
    attr, ARecord, AllocationMethod, ComputeInstanceSpec, DnsRecordSpec, DnsZoneQuery,
    HardwareProfile, ImageReference as OsImage, IpConfiguration, KeyAlgorithm, KeyPairSpec,
    LinuxConfiguration, NetworkInterfaceSpec, NetworkProfile, OsDisk, OsProfile,
    PublicAddressSpec, ResourceGroupSpec, ResourceKind, SshPublicKey, StorageProfile,
    CUSTOM_DATA_PATH,
};
use crate::secrets::{SecretBundle, SecretValue};

pub const RESOURCE_GROUP_NAME: &str = "caddy-rg";
pub const PUBLIC_ADDRESS_NAME: &str = "caddy-pip";
pub const NETWORK_INTERFACE_NAME: &str = "caddy-nic";
pub const KEY_PAIR_NAME: &str = "caddy-ssh-key";
pub const DNS_ZONE_NAME: &str = "caddy-dns-zone";
pub const DNS_RECORD_NAME: &str = "caddy-dns-record";
pub const COMPUTE_INSTANCE_NAME: &str = "caddy-vm";

const DNS_RECORD_TTL: u32 = 300;

/// Size and identity of the compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeSettings {
    pub vm_size: String,
    pub computer_name: String,
    pub admin_username: String,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        ComputeSettings {
            vm_size: "Standard_B4s_v2".to_string(),
            computer_name: "caddy-builder".to_string(),
            admin_username: "azureuser".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerInputs {
    pub container_image: ImageReference,
    pub secrets: SecretBundle,
    pub domain: DomainStrategy,
    pub compute: ComputeSettings,
    pub location: Option<String>,
}

/// Outputs of a planned worker.
#[derive(Debug, Clone)]
pub struct BuildWorker {
    pub resource_group_name: Output<String>,
    pub public_ip_address: Output<Ipv4Addr>,
    pub vm_name: Output<String>,
    pub vm_id: Output<String>,
    pub url: Output<String>,
    pub wildcard_url: Output<String>,
    pub ssh_private_key: Output<SecretValue>,
    pub bootstrap_document: Output<BootstrapDocument>,
}

/// Settled outputs of a worker. Values a preview cannot know are
/// [`Resolved::Unknown`].
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub resource_group_name: Resolved<String>,
    pub public_ip_address: Resolved<Ipv4Addr>,
    pub vm_name: Resolved<String>,
    pub vm_id: Resolved<String>,
    pub url: Resolved<String>,
    pub wildcard_url: Resolved<String>,
    pub ssh_private_key: Resolved<SecretValue>,
}

impl BuildWorker {
    pub async fn resolve(&self) -> Result<WorkerSummary, DependencyError> {
        Ok(WorkerSummary {
            resource_group_name: self.resource_group_name.resolve().await?,
            public_ip_address: self.public_ip_address.resolve().await?,
            vm_name: self.vm_name.resolve().await?,
            vm_id: self.vm_id.resolve().await?,
            url: self.url.resolve().await?,
            wildcard_url: self.wildcard_url.resolve().await?,
            ssh_private_key: self.ssh_private_key.resolve().await?,
        })
    }
}

/// Resource options of the compute instance: replaced, old one first,
/// whenever its bootstrap document changes.
pub fn compute_instance_options() -> ResourceOptions {
    ResourceOptions {
        replace_on_changes: vec![CUSTOM_DATA_PATH.to_string()],
        delete_before_replace: true,
    }
}

/// Spec of the compute instance, given its resolved dependencies.
pub fn compute_instance_spec(
    settings: &ComputeSettings,
    resource_group_name: String,
    network_interface_id: String,
    admin_public_key: String,
    document: &BootstrapDocument,
) -> ComputeInstanceSpec {
    ComputeInstanceSpec {
        resource_group_name,
        hardware_profile: HardwareProfile {
            vm_size: settings.vm_size.clone(),
        },
        os_profile: OsProfile {
            computer_name: settings.computer_name.clone(),
            admin_username: settings.admin_username.clone(),
            linux_configuration: LinuxConfiguration {
                disable_password_authentication: true,
                ssh_public_keys: vec![SshPublicKey {
                    path: format!("/home/{}/.ssh/authorized_keys", settings.admin_username),
                    key_data: admin_public_key,
                }],
            },
            custom_data: document.to_base64(),
        },
        storage_profile: StorageProfile {
            image_reference: OsImage::ubuntu_lts(),
            os_disk: OsDisk::default(),
        },
        network_profile: NetworkProfile {
            network_interface_ids: vec![network_interface_id],
        },
    }
}

/// Bootstrap document of a worker answering on `domain`.
pub fn bootstrap_document(
    domain: &Domain,
    container_image: ImageReference,
    secrets: &SecretBundle,
) -> Result<BootstrapDocument, DependencyError> {
    let proxy = proxy_config::build(domain, &secrets.auth_password_hash);
    cloud_init::synthesize(&BootstrapInputs::new(container_image, secrets, proxy)).map_err(|e| {
        DependencyError::Derivation {
            what: "bootstrap document",
            message: e.to_string(),
        }
    })
}

/// Declare an A record for the worker in a pre-existing zone.
fn declare_dns_record(
    stack: &mut Stack,
    hostname: &str,
    zone_name: &str,
    zone_resource_group: &str,
    ip_address: &Output<Ipv4Addr>,
) -> Resource {
    let zone = stack.lookup(
        ResourceKind::DnsZone,
        DNS_ZONE_NAME,
        &DnsZoneQuery {
            resource_group_name: zone_resource_group.to_string(),
            zone_name: zone_name.to_string(),
        },
    );

    // The record is declared without waiting for the address; until it is
    // known the target is empty.
    let target = ip_address.map(|ip| ip.to_string()).unwrap_or(String::new());

    let hostname = hostname.to_string();
    let zone_resource_group = zone_resource_group.to_string();
    stack.register(
        ResourceKind::DnsRecord,
        DNS_RECORD_NAME,
        zone.name().zip(&target).map(move |(zone_name, target)| DnsRecordSpec {
            resource_group_name: zone_resource_group,
            zone_name,
            relative_record_set_name: hostname,
            record_type: "A".to_string(),
            ttl: DNS_RECORD_TTL,
            a_records: vec![ARecord {
                ipv4_address: target,
            }],
        }),
        ResourceOptions::default(),
    )
}

/// Declare all resources of one build worker on `stack`.
#[instrument(skip_all, fields(image = %inputs.container_image))]
pub fn plan_build_worker(stack: &mut Stack, inputs: &WorkerInputs) -> BuildWorker {
    let resource_group = stack.register(
        ResourceKind::ResourceGroup,
        RESOURCE_GROUP_NAME,
        Output::known(ResourceGroupSpec {
            location: inputs.location.clone(),
        }),
        ResourceOptions::default(),
    );
    let resource_group_name = resource_group.name();

    let public_address = stack.register(
        ResourceKind::PublicAddress,
        PUBLIC_ADDRESS_NAME,
        resource_group_name.map(|resource_group_name| PublicAddressSpec {
            resource_group_name,
            allocation_method: AllocationMethod::Static,
            sku: "Standard".to_string(),
        }),
        ResourceOptions::default(),
    );
    let ip_address: Output<Ipv4Addr> = public_address.output(attr::IP_ADDRESS);

    let domain = inputs.domain.resolve(&ip_address);
    if let DomainStrategy::ManagedZone {
        hostname,
        zone_name,
        zone_resource_group,
    } = &inputs.domain
    {
        declare_dns_record(
            stack,
            hostname.as_deref().unwrap_or(DEFAULT_WORKER_HOSTNAME),
            zone_name,
            zone_resource_group,
            &ip_address,
        );
    }

    let perimeter = perimeter::declare(stack, &resource_group_name);

    let network_interface = stack.register(
        ResourceKind::NetworkInterface,
        NETWORK_INTERFACE_NAME,
        resource_group_name
            .zip(&perimeter.subnet_id)
            .zip(&public_address.id())
            .zip(&perimeter.security_group_id)
            .map(
                |(((resource_group_name, subnet_id), public_address_id), security_group_id)| {
                    NetworkInterfaceSpec {
                        resource_group_name,
                        security_group_id,
                        ip_configurations: vec![IpConfiguration {
                            name: "ipconfig".to_string(),
                            subnet_id,
                            public_address_id,
                        }],
                    }
                },
            ),
        ResourceOptions::default(),
    );

    let key_pair = stack.register(
        ResourceKind::KeyPair,
        KEY_PAIR_NAME,
        Output::known(KeyPairSpec {
            algorithm: KeyAlgorithm::Ed25519,
        }),
        ResourceOptions::default(),
    );
    let admin_public_key: Output<String> = key_pair.output(attr::PUBLIC_KEY_OPENSSH);
    let ssh_private_key = key_pair
        .output::<String>(attr::PRIVATE_KEY_OPENSSH)
        .map(SecretValue::from);

    let container_image = inputs.container_image.clone();
    let secrets = inputs.secrets.clone();
    let document =
        domain.try_map(move |domain| bootstrap_document(&domain, container_image, &secrets));

    let settings = inputs.compute.clone();
    let compute_instance = stack.register(
        ResourceKind::ComputeInstance,
        COMPUTE_INSTANCE_NAME,
        resource_group_name
            .zip(&network_interface.id())
            .zip(&admin_public_key)
            .zip(&document)
            .map(move |(((resource_group_name, nic_id), public_key), document)| {
                compute_instance_spec(&settings, resource_group_name, nic_id, public_key, &document)
            }),
        compute_instance_options(),
    );

    event!(
        Level::INFO,
        resources = stack.resources().len(),
        managed_dns = inputs.domain.requires_record(),
        "Planned build worker"
    );

    BuildWorker {
        resource_group_name,
        url: domain.map(|domain| domain.url()),
        wildcard_url: ip_address.map(|ip| Domain::ephemeral(ip).url()),
        public_ip_address: ip_address,
        vm_name: compute_instance.name(),
        vm_id: compute_instance.id(),
        ssh_private_key,
        bootstrap_document: document,
    }
}
