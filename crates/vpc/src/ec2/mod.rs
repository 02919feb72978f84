//! Remote networking API surface.
//!
//! [`Ec2Api`] is the only way this crate talks to the cloud. Implementations
//! report exactly what the remote said; retries, pagination and waits live in
//! [`crate::remote`].

pub mod client;
pub mod memory;
pub mod models;

use async_trait::async_trait;

pub use client::HttpEc2;
pub use memory::InMemoryEc2;
pub use models::{
    tags_to_map, Address, DhcpConfiguration, DhcpOptions, Filter, GatewayAttachment,
    InternetGateway, NatGateway, NetworkInterface, Page, Route, RouteTable,
    RouteTableAssociation, RouteTarget, RuleSource, SecurityGroup, SecurityRule, Subnet, Tag,
    Tagged, Vpc, VpcAttribute, VpcPeering, VpnGateway, DEFAULT_ROUTE, LIVE_PEERING_STATES,
};

use crate::error::RemoteError;

/// Remote networking API.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    // ========================================================================
    // Regions, VPCs and tags
    // ========================================================================

    /// Names of the availability zones usable in this region.
    async fn describe_availability_zones(&self) -> Result<Vec<String>, RemoteError>;

    async fn describe_vpcs(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<Vpc>, RemoteError>;

    async fn create_vpc(&self, cidr_block: &str) -> Result<Vpc, RemoteError>;

    async fn modify_vpc_attribute(
        &self,
        vpc_id: &str,
        attribute: VpcAttribute,
        value: bool,
    ) -> Result<(), RemoteError>;

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), RemoteError>;

    /// Add or overwrite tags on any taggable resource.
    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), RemoteError>;

    // ========================================================================
    // Subnets and route tables
    // ========================================================================

    async fn describe_subnets(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<Subnet>, RemoteError>;

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr_block: &str,
        availability_zone: &str,
    ) -> Result<Subnet, RemoteError>;

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), RemoteError>;

    async fn describe_route_tables(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<RouteTable>, RemoteError>;

    async fn create_route_table(&self, vpc_id: &str) -> Result<RouteTable, RemoteError>;

    async fn delete_route_table(&self, route_table_id: &str) -> Result<(), RemoteError>;

    /// Associate a subnet with a table. Returns the association id.
    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> Result<String, RemoteError>;

    async fn disassociate_route_table(&self, association_id: &str) -> Result<(), RemoteError>;

    /// Point an existing association at another table. Returns the new association id.
    async fn replace_route_table_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> Result<String, RemoteError>;

    /// Fails with `RouteAlreadyExists` when the destination is taken.
    async fn create_route(&self, route_table_id: &str, route: &Route) -> Result<(), RemoteError>;

    /// Fails with `InvalidRoute.NotFound` when the destination has no route.
    async fn replace_route(&self, route_table_id: &str, route: &Route) -> Result<(), RemoteError>;

    async fn delete_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
    ) -> Result<(), RemoteError>;

    // ========================================================================
    // NAT gateways and elastic addresses
    // ========================================================================

    async fn describe_nat_gateways(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<NatGateway>, RemoteError>;

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        client_token: &str,
    ) -> Result<NatGateway, RemoteError>;

    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> Result<(), RemoteError>;

    async fn describe_addresses(&self, filters: &[Filter]) -> Result<Vec<Address>, RemoteError>;

    async fn allocate_address(&self) -> Result<Address, RemoteError>;

    async fn release_address(&self, allocation_id: &str) -> Result<(), RemoteError>;

    // ========================================================================
    // Security groups and network interfaces
    // ========================================================================

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<SecurityGroup>, RemoteError>;

    async fn create_security_group(
        &self,
        vpc_id: &str,
        group_name: &str,
        description: &str,
    ) -> Result<SecurityGroup, RemoteError>;

    async fn delete_security_group(&self, group_id: &str) -> Result<(), RemoteError>;

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), RemoteError>;

    async fn revoke_ingress(&self, group_id: &str, rules: &[SecurityRule])
        -> Result<(), RemoteError>;

    async fn describe_network_interfaces(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<NetworkInterface>, RemoteError>;

    async fn create_network_interface(
        &self,
        subnet_id: &str,
        private_ip_address: &str,
        description: &str,
    ) -> Result<NetworkInterface, RemoteError>;

    async fn detach_network_interface(&self, attachment_id: &str) -> Result<(), RemoteError>;

    async fn delete_network_interface(&self, network_interface_id: &str)
        -> Result<(), RemoteError>;

    // ========================================================================
    // Internet and VPN gateways
    // ========================================================================

    async fn describe_internet_gateways(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<InternetGateway>, RemoteError>;

    async fn create_internet_gateway(&self) -> Result<InternetGateway, RemoteError>;

    async fn attach_internet_gateway(&self, gateway_id: &str, vpc_id: &str)
        -> Result<(), RemoteError>;

    async fn detach_internet_gateway(&self, gateway_id: &str, vpc_id: &str)
        -> Result<(), RemoteError>;

    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), RemoteError>;

    async fn describe_vpn_gateways(&self, filters: &[Filter])
        -> Result<Vec<VpnGateway>, RemoteError>;

    async fn attach_vpn_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<(), RemoteError>;

    async fn detach_vpn_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<(), RemoteError>;

    // ========================================================================
    // Peering connections
    // ========================================================================

    async fn describe_vpc_peering_connections(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<VpcPeering>, RemoteError>;

    async fn create_vpc_peering_connection(
        &self,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
    ) -> Result<VpcPeering, RemoteError>;

    async fn accept_vpc_peering_connection(&self, peering_id: &str) -> Result<(), RemoteError>;

    async fn delete_vpc_peering_connection(&self, peering_id: &str) -> Result<(), RemoteError>;

    // ========================================================================
    // DHCP option sets
    // ========================================================================

    async fn describe_dhcp_options(&self, filters: &[Filter])
        -> Result<Vec<DhcpOptions>, RemoteError>;

    async fn create_dhcp_options(
        &self,
        configurations: &[DhcpConfiguration],
    ) -> Result<DhcpOptions, RemoteError>;

    async fn associate_dhcp_options(
        &self,
        dhcp_options_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError>;

    async fn delete_dhcp_options(&self, dhcp_options_id: &str) -> Result<(), RemoteError>;
}
