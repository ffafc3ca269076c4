//! Network perimeter of a worker: virtual network, subnet and security group.

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::engine::Stack;
use crate::output::Output;
use crate::provider::ResourceOptions;
use crate::resources::{ResourceKind, SecurityGroupSpec, SubnetSpec, VirtualNetworkSpec};

pub const VIRTUAL_NETWORK_NAME: &str = "caddy-vnet";
pub const SUBNET_NAME: &str = "caddy-subnet";
pub const SECURITY_GROUP_NAME: &str = "caddy-nsg";

pub const VIRTUAL_NETWORK_PREFIX: &str = "10.0.0.0/16";
pub const SUBNET_PREFIX: &str = "10.0.1.0/24";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Icmp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub name: String,
    pub priority: u16,
    pub direction: Direction,
    pub access: Access,
    pub protocol: Protocol,
    pub source_port_range: String,
    pub destination_port_range: String,
    pub source_address_prefix: String,
    pub destination_address_prefix: String,
}

impl SecurityRule {
    fn allow_inbound(name: &str, priority: u16, protocol: Protocol, port: &str) -> Self {
        SecurityRule {
            name: name.to_string(),
            priority,
            direction: Direction::Inbound,
            access: Access::Allow,
            protocol,
            source_port_range: "*".to_string(),
            destination_port_range: port.to_string(),
            source_address_prefix: "*".to_string(),
            destination_address_prefix: "*".to_string(),
        }
    }
}

/// The complete inbound rule set, in ascending priority order.
///
/// Lower numbers take precedence. Nothing is allowed in except ICMP, HTTP,
/// HTTPS and SSH.
pub fn inbound_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule::allow_inbound("allow-icmp", 100, Protocol::Icmp, "*"),
        SecurityRule::allow_inbound("allow-http", 110, Protocol::Tcp, "80"),
        SecurityRule::allow_inbound("allow-https", 120, Protocol::Tcp, "443"),
        SecurityRule::allow_inbound("allow-ssh", 130, Protocol::Tcp, "22"),
    ]
}

/// Identifiers of the perimeter resources, available once they exist.
#[derive(Debug, Clone)]
pub struct NetworkPerimeter {
    pub virtual_network_id: Output<String>,
    pub subnet_id: Output<String>,
    pub security_group_id: Output<String>,
}

/// Register the perimeter resources inside `resource_group_name`.
pub fn declare(stack: &mut Stack, resource_group_name: &Output<String>) -> NetworkPerimeter {
    let vnet = stack.register(
        ResourceKind::VirtualNetwork,
        VIRTUAL_NETWORK_NAME,
        resource_group_name.map(|resource_group_name| VirtualNetworkSpec {
            resource_group_name,
            address_prefixes: vec![VIRTUAL_NETWORK_PREFIX.to_string()],
        }),
        ResourceOptions::default(),
    );

    let subnet = stack.register(
        ResourceKind::Subnet,
        SUBNET_NAME,
        resource_group_name
            .zip(&vnet.name())
            .map(|(resource_group_name, virtual_network_name)| SubnetSpec {
                resource_group_name,
                virtual_network_name,
                address_prefix: SUBNET_PREFIX.to_string(),
            }),
        ResourceOptions::default(),
    );

    let security_group = stack.register(
        ResourceKind::SecurityGroup,
        SECURITY_GROUP_NAME,
        resource_group_name.map(|resource_group_name| SecurityGroupSpec {
            resource_group_name,
            security_rules: inbound_rules(),
        }),
        ResourceOptions::default(),
    );

    event!(Level::DEBUG, "Declared network perimeter");

    NetworkPerimeter {
        virtual_network_id: vnet.id(),
        subnet_id: subnet.id(),
        security_group_id: security_group.id(),
    }
}
