//! Typed records for the EC2 networking API.
//!
//! Every record is built once from a describe/create response and never
//! written back into; changes go through [`Ec2Api`](super::Ec2Api) calls.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Peering states in which a connection still exists and can be manipulated.
pub const LIVE_PEERING_STATES: &[&str] = &["pending-acceptance", "provisioning", "active"];

/// Destination of the default route.
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

// ============================================================================
// Tags, filters and pages
// ============================================================================

/// A resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Collapse a tag list into a map. Later duplicates win.
#[must_use]
pub fn tags_to_map(tags: &[Tag]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|t| (t.key.clone(), t.value.clone()))
        .collect()
}

/// Records that carry tags.
pub trait Tagged {
    fn tags(&self) -> &[Tag];

    /// Value of the tag with the given key.
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags()
            .iter()
            .rev()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

macro_rules! impl_tagged {
    ($($ty:ty),* $(,)?) => {
        $(impl Tagged for $ty {
            fn tags(&self) -> &[Tag] {
                &self.tags
            }
        })*
    };
}

/// A describe filter (`Name` plus accepted `Values`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Filter {
    /// Filter name, e.g. `vpc-id` or `tag:Name`.
    pub name: String,
    /// Accepted values.
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Match resources belonging to a VPC.
    pub fn vpc(vpc_id: impl Into<String>) -> Self {
        Self::new("vpc-id", [vpc_id.into()])
    }

    /// Match resources carrying `key=value`.
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{key}"), [value.into()])
    }
}

/// One page of a paginated describe call.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// A single, final page.
    #[must_use]
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

// ============================================================================
// VPC, subnets and route tables
// ============================================================================

/// A VPC (the remote record behind an environment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Vpc {
    pub vpc_id: String,
    pub cidr_block: String,
    pub state: String,
    #[serde(default)]
    pub dhcp_options_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// VPC attributes that can be switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpcAttribute {
    EnableDnsSupport,
    EnableDnsHostnames,
}

/// A subnet in one availability zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subnet {
    pub subnet_id: String,
    pub vpc_id: String,
    pub cidr_block: String,
    pub availability_zone: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Where a route sends traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteTarget {
    /// Internet gateway, VPN gateway or `local`.
    #[serde(rename = "GatewayId")]
    Gateway(String),
    #[serde(rename = "NatGatewayId")]
    NatGateway(String),
    #[serde(rename = "VpcPeeringConnectionId")]
    Peering(String),
    #[serde(rename = "NetworkInterfaceId")]
    NetworkInterface(String),
}

impl RouteTarget {
    /// The implicit route for the VPC's own block.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Gateway(id) if id == "local")
    }

    /// Identifier of the target resource.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Gateway(id)
            | Self::NatGateway(id)
            | Self::Peering(id)
            | Self::NetworkInterface(id) => id,
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// A route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route {
    pub destination_cidr_block: String,
    #[serde(flatten)]
    pub target: RouteTarget,
}

impl Route {
    pub fn new(destination: impl Into<String>, target: RouteTarget) -> Self {
        Self {
            destination_cidr_block: destination.into(),
            target,
        }
    }
}

/// Link between a route table and a subnet (or the VPC, for the main table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteTableAssociation {
    pub route_table_association_id: String,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub main: bool,
}

/// A route table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteTable {
    pub route_table_id: String,
    pub vpc_id: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub associations: Vec<RouteTableAssociation>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl RouteTable {
    /// The implicit main table of a VPC, which cannot be deleted directly.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.associations.iter().any(|a| a.main)
    }

    /// The active route for a destination.
    #[must_use]
    pub fn route_to(&self, destination: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.destination_cidr_block == destination)
    }

    /// Association with the given subnet.
    #[must_use]
    pub fn association_for(&self, subnet_id: &str) -> Option<&RouteTableAssociation> {
        self.associations
            .iter()
            .find(|a| a.subnet_id.as_deref() == Some(subnet_id))
    }
}

// ============================================================================
// NAT gateways and elastic addresses
// ============================================================================

/// A NAT gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NatGateway {
    pub nat_gateway_id: String,
    pub subnet_id: String,
    pub vpc_id: String,
    pub state: String,
    #[serde(default)]
    pub allocation_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl NatGateway {
    /// Deleted gateways stay visible for a while; they hold nothing.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self.state.as_str(), "deleting" | "deleted" | "failed")
    }
}

/// An elastic (public) address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Address {
    pub allocation_id: String,
    pub public_ip: String,
    #[serde(default)]
    pub association_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

// ============================================================================
// Security groups and interfaces
// ============================================================================

/// Source of an ingress rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleSource {
    #[serde(rename = "CidrIp")]
    Cidr(String),
    #[serde(rename = "SourceGroupId")]
    Group(String),
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cidr(cidr) => f.write_str(cidr),
            Self::Group(id) => f.write_str(id),
        }
    }
}

/// An ingress rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityRule {
    pub ip_protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    #[serde(flatten)]
    pub source: RuleSource,
}

impl fmt::Display for SecurityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{}",
            self.ip_protocol, self.source, self.from_port, self.to_port
        )
    }
}

/// A security group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroup {
    pub group_id: String,
    pub group_name: String,
    pub vpc_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ingress_rules: Vec<SecurityRule>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl SecurityGroup {
    /// Every VPC owns a `default` group that is removed with the VPC itself.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.group_name == "default"
    }
}

/// An elastic network interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    pub network_interface_id: String,
    pub subnet_id: String,
    pub vpc_id: String,
    pub private_ip_address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    /// Managed by a service such as a NAT gateway; cannot be detached or deleted.
    #[serde(default)]
    pub requester_managed: bool,
}

// ============================================================================
// Gateways
// ============================================================================

/// Attachment of a gateway to a VPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GatewayAttachment {
    pub vpc_id: String,
    pub state: String,
}

/// An internet gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InternetGateway {
    pub internet_gateway_id: String,
    #[serde(default)]
    pub attachments: Vec<GatewayAttachment>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// A virtual private (VPN) gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpnGateway {
    pub vpn_gateway_id: String,
    #[serde(default, rename = "VpcAttachments")]
    pub attachments: Vec<GatewayAttachment>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl VpnGateway {
    /// The VPC this gateway is attached (or attaching) to.
    #[must_use]
    pub fn attached_vpc(&self) -> Option<&str> {
        self.attachments
            .iter()
            .find(|a| a.state != "detached")
            .map(|a| a.vpc_id.as_str())
    }
}

// ============================================================================
// Peering and DHCP
// ============================================================================

/// A VPC peering connection as reported by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpcPeering {
    pub vpc_peering_connection_id: String,
    pub requester_vpc_id: String,
    pub accepter_vpc_id: String,
    /// Status code, e.g. `pending-acceptance` or `active`.
    pub status: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl VpcPeering {
    /// Whether the connection still exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        LIVE_PEERING_STATES.contains(&self.status.as_str())
    }

    /// Whether this connection links the two VPCs, in either direction.
    #[must_use]
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.requester_vpc_id == a && self.accepter_vpc_id == b)
            || (self.requester_vpc_id == b && self.accepter_vpc_id == a)
    }

    /// The VPC on the other side from `vpc_id`.
    #[must_use]
    pub fn peer_of(&self, vpc_id: &str) -> &str {
        if self.accepter_vpc_id == vpc_id {
            &self.requester_vpc_id
        } else {
            &self.accepter_vpc_id
        }
    }
}

/// One DHCP option (`domain-name`, `domain-name-servers`, `ntp-servers`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DhcpConfiguration {
    pub key: String,
    pub values: Vec<String>,
}

impl DhcpConfiguration {
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// A DHCP option set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DhcpOptions {
    pub dhcp_options_id: String,
    #[serde(default)]
    pub dhcp_configurations: Vec<DhcpConfiguration>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl_tagged!(
    Vpc,
    Subnet,
    RouteTable,
    NatGateway,
    Address,
    SecurityGroup,
    InternetGateway,
    VpnGateway,
    VpcPeering,
    DhcpOptions,
);
