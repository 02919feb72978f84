//! In-process simulation of the EC2 networking API.
//!
//! Enforces the resource dependencies that make teardown order matter, moves
//! NAT gateways and VPCs through their states on later describes, paginates
//! describe results, and can inject throttling or arbitrary error codes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::models::{
    Address, DhcpConfiguration, DhcpOptions, Filter, GatewayAttachment, InternetGateway,
    NatGateway, NetworkInterface, Page, Route, RouteTable, RouteTableAssociation, RouteTarget,
    RuleSource, SecurityGroup, SecurityRule, Subnet, Tag, Vpc, VpcAttribute, VpcPeering,
    VpnGateway,
};
use super::Ec2Api;
use crate::error::RemoteError;

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_DHCP_OPTIONS_ID: &str = "dopt-default";

/// In-memory EC2.
pub struct InMemoryEc2 {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    page_size: usize,
    zones: Vec<String>,
    vpcs: BTreeMap<String, Vpc>,
    subnets: BTreeMap<String, Subnet>,
    route_tables: BTreeMap<String, RouteTable>,
    nat_gateways: BTreeMap<String, NatGateway>,
    nat_tokens: HashMap<String, String>,
    nat_interfaces: HashMap<String, String>,
    addresses: BTreeMap<String, Address>,
    security_groups: BTreeMap<String, SecurityGroup>,
    interfaces: BTreeMap<String, NetworkInterface>,
    internet_gateways: BTreeMap<String, InternetGateway>,
    vpn_gateways: BTreeMap<String, VpnGateway>,
    peerings: BTreeMap<String, VpcPeering>,
    dhcp_options: BTreeMap<String, DhcpOptions>,
    throttles: HashMap<String, u32>,
    failures: HashMap<String, VecDeque<String>>,
    journal: Vec<String>,
}

impl Default for InMemoryEc2 {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEc2 {
    /// Empty account with zones `us-east-1a`..`c` and the default DHCP set.
    #[must_use]
    pub fn new() -> Self {
        let mut state = State {
            page_size: DEFAULT_PAGE_SIZE,
            zones: ["us-east-1a", "us-east-1b", "us-east-1c"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            ..State::default()
        };
        state.dhcp_options.insert(
            DEFAULT_DHCP_OPTIONS_ID.to_string(),
            DhcpOptions {
                dhcp_options_id: DEFAULT_DHCP_OPTIONS_ID.to_string(),
                dhcp_configurations: vec![DhcpConfiguration::new(
                    "domain-name",
                    ["ec2.internal"],
                )],
                tags: Vec::new(),
            },
        );

        Self {
            state: Mutex::new(state),
        }
    }

    /// Replace the availability zones.
    #[must_use]
    pub fn with_zones<I, S>(self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().zones = zones.into_iter().map(Into::into).collect();
        self
    }

    /// Limit describe results per page.
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    /// Make the next `times` calls to `operation` fail with a throttling error.
    pub fn throttle_next(&self, operation: &str, times: u32) {
        *self.lock().throttles.entry(operation.to_string()).or_default() += times;
    }

    /// Make the next call to `operation` fail with the given error code.
    pub fn fail_next(&self, operation: &str, code: &str) {
        self.lock()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(code.to_string());
    }

    /// Successful mutating calls, oldest first, as `"<Operation> <resource>"`.
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Operation names of the journal entries.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter_map(|entry| entry.split_whitespace().next())
            .map(str::to_string)
            .collect()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Seed an elastic address with a known public IP. Returns its allocation id.
    pub fn add_address(&self, public_ip: &str) -> String {
        let mut state = self.lock();
        let allocation_id = state.id("eipalloc");
        state.addresses.insert(
            allocation_id.clone(),
            Address {
                allocation_id: allocation_id.clone(),
                public_ip: public_ip.to_string(),
                association_id: None,
                tags: Vec::new(),
            },
        );
        allocation_id
    }

    /// Seed a detached VPN gateway tagged `Name=<name>`. Returns its id.
    pub fn add_vpn_gateway(&self, name: &str) -> String {
        let mut state = self.lock();
        let gateway_id = state.id("vgw");
        state.vpn_gateways.insert(
            gateway_id.clone(),
            VpnGateway {
                vpn_gateway_id: gateway_id.clone(),
                attachments: Vec::new(),
                tags: vec![Tag::new("Name", name)],
            },
        );
        gateway_id
    }

    /// Mark an interface as attached to an instance.
    pub fn attach_interface(&self, network_interface_id: &str) {
        let mut state = self.lock();
        let attachment_id = state.id("eni-attach");
        if let Some(interface) = state.interfaces.get_mut(network_interface_id) {
            interface.attachment_id = Some(attachment_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock state and apply any injected fault for `operation`.
    fn begin(&self, operation: &str) -> Result<MutexGuard<'_, State>, RemoteError> {
        let mut state = self.lock();

        if let Some(remaining) = state.throttles.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::from_code(
                    "RequestLimitExceeded",
                    "Request limit exceeded.",
                ));
            }
        }
        if let Some(code) = state
            .failures
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return Err(RemoteError::from_code(code, "injected failure"));
        }

        Ok(state)
    }
}

// ============================================================================
// State helpers
// ============================================================================

fn not_found(code: &str, id: &str) -> RemoteError {
    RemoteError::from_code(code, format!("The ID '{id}' does not exist"))
}

fn dependency(message: String) -> RemoteError {
    RemoteError::from_code("DependencyViolation", message)
}

fn not_permitted(network_interface_id: &str) -> RemoteError {
    RemoteError::from_code(
        "OperationNotPermitted",
        format!("Interface {network_interface_id} is managed by another service"),
    )
}

fn invalid(message: String) -> RemoteError {
    RemoteError::from_code("InvalidParameterValue", message)
}

fn parse_net(cidr: &str) -> Result<Ipv4Net, RemoteError> {
    cidr.parse()
        .map_err(|_| invalid(format!("Value ({cidr}) for parameter cidrBlock is invalid")))
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }

    fn record(&mut self, operation: &str, resource: &str) {
        self.journal.push(format!("{operation} {resource}"));
    }

    fn vpc(&self, vpc_id: &str) -> Result<&Vpc, RemoteError> {
        self.vpcs
            .get(vpc_id)
            .ok_or_else(|| not_found("InvalidVpcID.NotFound", vpc_id))
    }

    fn route_table_mut(&mut self, route_table_id: &str) -> Result<&mut RouteTable, RemoteError> {
        self.route_tables
            .get_mut(route_table_id)
            .ok_or_else(|| not_found("InvalidRouteTableID.NotFound", route_table_id))
    }

    fn tags_mut(&mut self, id: &str) -> Option<&mut Vec<Tag>> {
        match id.split('-').next() {
            Some("vpc") => self.vpcs.get_mut(id).map(|r| &mut r.tags),
            Some("subnet") => self.subnets.get_mut(id).map(|r| &mut r.tags),
            Some("rtb") => self.route_tables.get_mut(id).map(|r| &mut r.tags),
            Some("nat") => self.nat_gateways.get_mut(id).map(|r| &mut r.tags),
            Some("eipalloc") => self.addresses.get_mut(id).map(|r| &mut r.tags),
            Some("sg") => self.security_groups.get_mut(id).map(|r| &mut r.tags),
            Some("igw") => self.internet_gateways.get_mut(id).map(|r| &mut r.tags),
            Some("vgw") => self.vpn_gateways.get_mut(id).map(|r| &mut r.tags),
            Some("pcx") => self.peerings.get_mut(id).map(|r| &mut r.tags),
            Some("dopt") => self.dhcp_options.get_mut(id).map(|r| &mut r.tags),
            _ => None,
        }
    }

    fn check_target(&self, target: &RouteTarget) -> Result<(), RemoteError> {
        let known = match target {
            RouteTarget::Gateway(id) => {
                target.is_local()
                    || self.internet_gateways.contains_key(id)
                    || self.vpn_gateways.contains_key(id)
            }
            RouteTarget::NatGateway(id) => self.nat_gateways.get(id).is_some_and(|n| !n.is_gone()),
            RouteTarget::Peering(id) => self.peerings.get(id).is_some_and(VpcPeering::is_live),
            RouteTarget::NetworkInterface(id) => self.interfaces.contains_key(id),
        };
        if known {
            Ok(())
        } else {
            Err(not_found("InvalidGatewayID.NotFound", target.id()))
        }
    }

    fn page<T: Clone>(
        &self,
        items: Vec<T>,
        next_token: Option<String>,
    ) -> Result<Page<T>, RemoteError> {
        let start = match next_token {
            Some(token) => token
                .strip_prefix("token-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| {
                    RemoteError::from_code("InvalidPaginationToken", format!("bad token {token}"))
                })?,
            None => 0,
        };
        let end = (start + self.page_size).min(items.len());
        let next_token = (end < items.len()).then(|| format!("token-{end}"));

        Ok(Page {
            items: items.get(start..end).map(<[T]>::to_vec).unwrap_or_default(),
            next_token,
        })
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Records that can be matched against describe filters.
trait Filterable {
    /// Values exposed under a filter name, or `None` if the filter is unsupported.
    fn field(&self, name: &str) -> Option<Vec<String>>;
}

fn tag_values(tags: &[Tag], name: &str) -> Option<Vec<String>> {
    let key = name.strip_prefix("tag:")?;
    Some(
        tags.iter()
            .filter(|t| t.key == key)
            .map(|t| t.value.clone())
            .collect(),
    )
}

fn one(value: &str) -> Option<Vec<String>> {
    Some(vec![value.to_string()])
}

fn select<'a, T, I>(items: I, filters: &[Filter]) -> Result<Vec<T>, RemoteError>
where
    T: Filterable + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut selected = Vec::new();
    'items: for item in items {
        for filter in filters {
            let values = item.field(&filter.name).ok_or_else(|| {
                invalid(format!("The filter '{}' is invalid", filter.name))
            })?;
            if !values.iter().any(|v| filter.values.contains(v)) {
                continue 'items;
            }
        }
        selected.push(item.clone());
    }
    Ok(selected)
}

impl Filterable for Vpc {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-id" => one(&self.vpc_id),
            "cidr" | "cidr-block" => one(&self.cidr_block),
            "state" => one(&self.state),
            "dhcp-options-id" => Some(self.dhcp_options_id.iter().cloned().collect()),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for Subnet {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-id" => one(&self.vpc_id),
            "subnet-id" => one(&self.subnet_id),
            "cidr-block" => one(&self.cidr_block),
            "availability-zone" => one(&self.availability_zone),
            _ => tag_values(&self.tags, name),
        }
    }
}

fn route_target_ids(
    table: &RouteTable,
    wanted: impl Fn(&RouteTarget) -> bool,
) -> Option<Vec<String>> {
    Some(
        table
            .routes
            .iter()
            .filter(|r| wanted(&r.target))
            .map(|r| r.target.id().to_string())
            .collect(),
    )
}

impl Filterable for RouteTable {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-id" => one(&self.vpc_id),
            "route-table-id" => one(&self.route_table_id),
            "association.subnet-id" => Some(
                self.associations
                    .iter()
                    .filter_map(|a| a.subnet_id.clone())
                    .collect(),
            ),
            "association.main" => one(if self.is_main() { "true" } else { "false" }),
            "route.destination-cidr-block" => Some(
                self.routes
                    .iter()
                    .map(|r| r.destination_cidr_block.clone())
                    .collect(),
            ),
            "route.vpc-peering-connection-id" => {
                route_target_ids(self, |t| matches!(t, RouteTarget::Peering(_)))
            }
            "route.nat-gateway-id" => {
                route_target_ids(self, |t| matches!(t, RouteTarget::NatGateway(_)))
            }
            "route.gateway-id" => route_target_ids(self, |t| matches!(t, RouteTarget::Gateway(_))),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for NatGateway {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-id" => one(&self.vpc_id),
            "subnet-id" => one(&self.subnet_id),
            "nat-gateway-id" => one(&self.nat_gateway_id),
            "state" => one(&self.state),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for Address {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "public-ip" => one(&self.public_ip),
            "allocation-id" => one(&self.allocation_id),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for SecurityGroup {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-id" => one(&self.vpc_id),
            "group-id" => one(&self.group_id),
            "group-name" => one(&self.group_name),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for NetworkInterface {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-id" => one(&self.vpc_id),
            "subnet-id" => one(&self.subnet_id),
            "network-interface-id" => one(&self.network_interface_id),
            "private-ip-address" => one(&self.private_ip_address),
            _ => None,
        }
    }
}

impl Filterable for InternetGateway {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "internet-gateway-id" => one(&self.internet_gateway_id),
            "attachment.vpc-id" => Some(self.attachments.iter().map(|a| a.vpc_id.clone()).collect()),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for VpnGateway {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpn-gateway-id" => one(&self.vpn_gateway_id),
            "attachment.vpc-id" => Some(
                self.attachments
                    .iter()
                    .filter(|a| a.state != "detached")
                    .map(|a| a.vpc_id.clone())
                    .collect(),
            ),
            "attachment.state" => Some(self.attachments.iter().map(|a| a.state.clone()).collect()),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for VpcPeering {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "vpc-peering-connection-id" => one(&self.vpc_peering_connection_id),
            "requester-vpc-info.vpc-id" => one(&self.requester_vpc_id),
            "accepter-vpc-info.vpc-id" => one(&self.accepter_vpc_id),
            "status-code" => one(&self.status),
            _ => tag_values(&self.tags, name),
        }
    }
}

impl Filterable for DhcpOptions {
    fn field(&self, name: &str) -> Option<Vec<String>> {
        match name {
            "dhcp-options-id" => one(&self.dhcp_options_id),
            _ => tag_values(&self.tags, name),
        }
    }
}

// ============================================================================
// API
// ============================================================================

#[async_trait]
impl Ec2Api for InMemoryEc2 {
    async fn describe_availability_zones(&self) -> Result<Vec<String>, RemoteError> {
        let state = self.begin("DescribeAvailabilityZones")?;
        Ok(state.zones.clone())
    }

    async fn describe_vpcs(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<Vpc>, RemoteError> {
        let mut state = self.begin("DescribeVpcs")?;
        let page = state.page(select(state.vpcs.values(), filters)?, next_token)?;
        for vpc in state.vpcs.values_mut() {
            if vpc.state == "pending" {
                vpc.state = "available".to_string();
            }
        }
        Ok(page)
    }

    async fn create_vpc(&self, cidr_block: &str) -> Result<Vpc, RemoteError> {
        let mut state = self.begin("CreateVpc")?;
        parse_net(cidr_block)?;

        let vpc_id = state.id("vpc");
        let vpc = Vpc {
            vpc_id: vpc_id.clone(),
            cidr_block: cidr_block.to_string(),
            state: "pending".to_string(),
            dhcp_options_id: Some(DEFAULT_DHCP_OPTIONS_ID.to_string()),
            tags: Vec::new(),
        };
        state.vpcs.insert(vpc_id.clone(), vpc.clone());

        let route_table_id = state.id("rtb");
        let association_id = state.id("rtbassoc");
        state.route_tables.insert(
            route_table_id.clone(),
            RouteTable {
                route_table_id,
                vpc_id: vpc_id.clone(),
                routes: vec![Route::new(
                    cidr_block,
                    RouteTarget::Gateway("local".to_string()),
                )],
                associations: vec![RouteTableAssociation {
                    route_table_association_id: association_id,
                    subnet_id: None,
                    main: true,
                }],
                tags: Vec::new(),
            },
        );

        let group_id = state.id("sg");
        state.security_groups.insert(
            group_id.clone(),
            SecurityGroup {
                group_id,
                group_name: "default".to_string(),
                vpc_id: vpc_id.clone(),
                description: "default VPC security group".to_string(),
                ingress_rules: Vec::new(),
                tags: Vec::new(),
            },
        );

        state.record("CreateVpc", &vpc_id);
        Ok(vpc)
    }

    async fn modify_vpc_attribute(
        &self,
        vpc_id: &str,
        attribute: VpcAttribute,
        _value: bool,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("ModifyVpcAttribute")?;
        state.vpc(vpc_id)?;
        state.record("ModifyVpcAttribute", &format!("{vpc_id} {attribute:?}"));
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteVpc")?;
        state.vpc(vpc_id)?;

        let blocked = state.subnets.values().any(|s| s.vpc_id == vpc_id)
            || state
                .route_tables
                .values()
                .any(|t| t.vpc_id == vpc_id && !t.is_main())
            || state
                .security_groups
                .values()
                .any(|g| g.vpc_id == vpc_id && !g.is_default())
            || state
                .internet_gateways
                .values()
                .any(|g| g.attachments.iter().any(|a| a.vpc_id == vpc_id))
            || state
                .vpn_gateways
                .values()
                .any(|g| g.attached_vpc() == Some(vpc_id));
        if blocked {
            return Err(dependency(format!(
                "The vpc '{vpc_id}' has dependencies and cannot be deleted."
            )));
        }

        state.vpcs.remove(vpc_id);
        state.route_tables.retain(|_, t| t.vpc_id != vpc_id);
        state.security_groups.retain(|_, g| g.vpc_id != vpc_id);
        state.record("DeleteVpc", vpc_id);
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &[Tag]) -> Result<(), RemoteError> {
        let mut state = self.begin("CreateTags")?;
        for id in resource_ids {
            let existing = state
                .tags_mut(id)
                .ok_or_else(|| not_found("InvalidID.NotFound", id))?;
            for tag in tags {
                existing.retain(|t| t.key != tag.key);
                existing.push(tag.clone());
            }
        }
        state.record("CreateTags", &resource_ids.join(","));
        Ok(())
    }

    // ========================================================================
    // Subnets and route tables
    // ========================================================================

    async fn describe_subnets(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<Subnet>, RemoteError> {
        let state = self.begin("DescribeSubnets")?;
        state.page(select(state.subnets.values(), filters)?, next_token)
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr_block: &str,
        availability_zone: &str,
    ) -> Result<Subnet, RemoteError> {
        let mut state = self.begin("CreateSubnet")?;
        let vpc_net = parse_net(&state.vpc(vpc_id)?.cidr_block)?;
        let net = parse_net(cidr_block)?;

        if !vpc_net.contains(&net) {
            return Err(RemoteError::from_code(
                "InvalidSubnet.Range",
                format!("The CIDR '{cidr_block}' is invalid."),
            ));
        }
        if !state.zones.iter().any(|z| z == availability_zone) {
            return Err(invalid(format!(
                "Value ({availability_zone}) for parameter availabilityZone is invalid."
            )));
        }
        let conflict = state
            .subnets
            .values()
            .filter(|s| s.vpc_id == vpc_id)
            .filter_map(|s| s.cidr_block.parse::<Ipv4Net>().ok())
            .any(|other| other.contains(&net) || net.contains(&other));
        if conflict {
            return Err(RemoteError::from_code(
                "InvalidSubnet.Conflict",
                format!("The CIDR '{cidr_block}' conflicts with another subnet"),
            ));
        }

        let subnet = Subnet {
            subnet_id: state.id("subnet"),
            vpc_id: vpc_id.to_string(),
            cidr_block: cidr_block.to_string(),
            availability_zone: availability_zone.to_string(),
            tags: Vec::new(),
        };
        state
            .subnets
            .insert(subnet.subnet_id.clone(), subnet.clone());
        state.record("CreateSubnet", &subnet.subnet_id);
        Ok(subnet)
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteSubnet")?;
        if !state.subnets.contains_key(subnet_id) {
            return Err(not_found("InvalidSubnetID.NotFound", subnet_id));
        }

        let nat_in_use = state
            .nat_gateways
            .values()
            .any(|n| n.subnet_id == subnet_id && n.state != "deleted");
        let interface_in_use = state.interfaces.values().any(|i| i.subnet_id == subnet_id);
        if nat_in_use || interface_in_use {
            return Err(dependency(format!(
                "The subnet '{subnet_id}' has dependencies and cannot be deleted."
            )));
        }

        state.subnets.remove(subnet_id);
        for table in state.route_tables.values_mut() {
            table
                .associations
                .retain(|a| a.subnet_id.as_deref() != Some(subnet_id));
        }
        state.record("DeleteSubnet", subnet_id);
        Ok(())
    }

    async fn describe_route_tables(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<RouteTable>, RemoteError> {
        let state = self.begin("DescribeRouteTables")?;
        state.page(select(state.route_tables.values(), filters)?, next_token)
    }

    async fn create_route_table(&self, vpc_id: &str) -> Result<RouteTable, RemoteError> {
        let mut state = self.begin("CreateRouteTable")?;
        let vpc_cidr = state.vpc(vpc_id)?.cidr_block.clone();

        let table = RouteTable {
            route_table_id: state.id("rtb"),
            vpc_id: vpc_id.to_string(),
            routes: vec![Route::new(
                vpc_cidr,
                RouteTarget::Gateway("local".to_string()),
            )],
            associations: Vec::new(),
            tags: Vec::new(),
        };
        state
            .route_tables
            .insert(table.route_table_id.clone(), table.clone());
        state.record("CreateRouteTable", &table.route_table_id);
        Ok(table)
    }

    async fn delete_route_table(&self, route_table_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteRouteTable")?;
        let table = state.route_table_mut(route_table_id)?;
        if !table.associations.is_empty() {
            return Err(dependency(format!(
                "The routeTable '{route_table_id}' has dependencies and cannot be deleted."
            )));
        }

        state.route_tables.remove(route_table_id);
        state.record("DeleteRouteTable", route_table_id);
        Ok(())
    }

    async fn associate_route_table(
        &self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> Result<String, RemoteError> {
        let mut state = self.begin("AssociateRouteTable")?;
        if !state.subnets.contains_key(subnet_id) {
            return Err(not_found("InvalidSubnetID.NotFound", subnet_id));
        }
        if state
            .route_tables
            .values()
            .any(|t| t.association_for(subnet_id).is_some())
        {
            return Err(RemoteError::from_code(
                "Resource.AlreadyAssociated",
                format!("the specified association for route table already exists: {subnet_id}"),
            ));
        }

        let association_id = state.id("rtbassoc");
        state
            .route_table_mut(route_table_id)?
            .associations
            .push(RouteTableAssociation {
                route_table_association_id: association_id.clone(),
                subnet_id: Some(subnet_id.to_string()),
                main: false,
            });
        state.record("AssociateRouteTable", &format!("{route_table_id} {subnet_id}"));
        Ok(association_id)
    }

    async fn disassociate_route_table(&self, association_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DisassociateRouteTable")?;
        let table = state
            .route_tables
            .values_mut()
            .find(|t| {
                t.associations
                    .iter()
                    .any(|a| a.route_table_association_id == association_id && !a.main)
            })
            .ok_or_else(|| not_found("InvalidAssociationID.NotFound", association_id))?;
        table
            .associations
            .retain(|a| a.route_table_association_id != association_id);
        state.record("DisassociateRouteTable", association_id);
        Ok(())
    }

    async fn replace_route_table_association(
        &self,
        association_id: &str,
        route_table_id: &str,
    ) -> Result<String, RemoteError> {
        let mut state = self.begin("ReplaceRouteTableAssociation")?;
        state.route_table_mut(route_table_id)?;

        let old = state
            .route_tables
            .values_mut()
            .find_map(|t| {
                let index = t
                    .associations
                    .iter()
                    .position(|a| a.route_table_association_id == association_id)?;
                Some(t.associations.remove(index))
            })
            .ok_or_else(|| not_found("InvalidAssociationID.NotFound", association_id))?;

        let new_id = state.id("rtbassoc");
        state
            .route_table_mut(route_table_id)?
            .associations
            .push(RouteTableAssociation {
                route_table_association_id: new_id.clone(),
                subnet_id: old.subnet_id,
                main: old.main,
            });
        state.record(
            "ReplaceRouteTableAssociation",
            &format!("{association_id} {route_table_id}"),
        );
        Ok(new_id)
    }

    async fn create_route(&self, route_table_id: &str, route: &Route) -> Result<(), RemoteError> {
        let mut state = self.begin("CreateRoute")?;
        state.check_target(&route.target)?;
        let table = state.route_table_mut(route_table_id)?;
        if table.route_to(&route.destination_cidr_block).is_some() {
            return Err(RemoteError::from_code(
                "RouteAlreadyExists",
                format!(
                    "The route identified by {} already exists.",
                    route.destination_cidr_block
                ),
            ));
        }

        table.routes.push(route.clone());
        state.record(
            "CreateRoute",
            &format!("{route_table_id} {}", route.destination_cidr_block),
        );
        Ok(())
    }

    async fn replace_route(&self, route_table_id: &str, route: &Route) -> Result<(), RemoteError> {
        let mut state = self.begin("ReplaceRoute")?;
        state.check_target(&route.target)?;
        let table = state.route_table_mut(route_table_id)?;
        let existing = table
            .routes
            .iter_mut()
            .find(|r| r.destination_cidr_block == route.destination_cidr_block)
            .ok_or_else(|| {
                not_found("InvalidRoute.NotFound", &route.destination_cidr_block)
            })?;
        if existing.target.is_local() {
            return Err(invalid("cannot replace local route".to_string()));
        }

        existing.target = route.target.clone();
        state.record(
            "ReplaceRoute",
            &format!("{route_table_id} {}", route.destination_cidr_block),
        );
        Ok(())
    }

    async fn delete_route(
        &self,
        route_table_id: &str,
        destination_cidr_block: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteRoute")?;
        let table = state.route_table_mut(route_table_id)?;
        let before = table.routes.len();
        table
            .routes
            .retain(|r| r.destination_cidr_block != destination_cidr_block || r.target.is_local());
        if table.routes.len() == before {
            return Err(not_found("InvalidRoute.NotFound", destination_cidr_block));
        }

        state.record(
            "DeleteRoute",
            &format!("{route_table_id} {destination_cidr_block}"),
        );
        Ok(())
    }

    // ========================================================================
    // NAT gateways and elastic addresses
    // ========================================================================

    async fn describe_nat_gateways(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<NatGateway>, RemoteError> {
        let mut state = self.begin("DescribeNatGateways")?;
        let page = state.page(select(state.nat_gateways.values(), filters)?, next_token)?;

        let mut released = Vec::new();
        let mut deleted = Vec::new();
        for gateway in state.nat_gateways.values_mut() {
            match gateway.state.as_str() {
                "pending" => gateway.state = "available".to_string(),
                "deleting" => {
                    gateway.state = "deleted".to_string();
                    released.extend(gateway.allocation_id.clone());
                    deleted.push(gateway.nat_gateway_id.clone());
                }
                _ => {}
            }
        }
        for allocation_id in released {
            if let Some(address) = state.addresses.get_mut(&allocation_id) {
                address.association_id = None;
            }
        }
        for nat_gateway_id in deleted {
            if let Some(interface_id) = state.nat_interfaces.remove(&nat_gateway_id) {
                state.interfaces.remove(&interface_id);
            }
        }
        Ok(page)
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &str,
        allocation_id: &str,
        client_token: &str,
    ) -> Result<NatGateway, RemoteError> {
        let mut state = self.begin("CreateNatGateway")?;
        if let Some(existing) = state
            .nat_tokens
            .get(client_token)
            .and_then(|id| state.nat_gateways.get(id))
        {
            return Ok(existing.clone());
        }

        let subnet = state
            .subnets
            .get(subnet_id)
            .ok_or_else(|| not_found("InvalidSubnetID.NotFound", subnet_id))?;
        let vpc_id = subnet.vpc_id.clone();
        let net = parse_net(&subnet.cidr_block)?;
        let private_ip = net
            .hosts()
            .skip(3)
            .map(|ip| ip.to_string())
            .find(|ip| {
                !state
                    .interfaces
                    .values()
                    .any(|i| i.vpc_id == vpc_id && i.private_ip_address == *ip)
            })
            .ok_or_else(|| {
                RemoteError::from_code(
                    "InsufficientFreeAddressesInSubnet",
                    format!("Subnet {subnet_id} has no free addresses"),
                )
            })?;
        let nat_gateway_id = state.id("nat");
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| not_found("InvalidAllocationID.NotFound", allocation_id))?;
        if address.association_id.is_some() {
            return Err(RemoteError::from_code(
                "Resource.AlreadyAssociated",
                format!("Elastic IP address [{allocation_id}] is already associated"),
            ));
        }
        address.association_id = Some(nat_gateway_id.clone());

        let interface = NetworkInterface {
            network_interface_id: state.id("eni"),
            subnet_id: subnet_id.to_string(),
            vpc_id: vpc_id.clone(),
            private_ip_address: private_ip,
            description: format!("Interface for NAT Gateway {nat_gateway_id}"),
            attachment_id: Some(state.id("ela-attach")),
            requester_managed: true,
        };
        state
            .nat_interfaces
            .insert(nat_gateway_id.clone(), interface.network_interface_id.clone());
        state
            .interfaces
            .insert(interface.network_interface_id.clone(), interface);

        let gateway = NatGateway {
            nat_gateway_id: nat_gateway_id.clone(),
            subnet_id: subnet_id.to_string(),
            vpc_id,
            state: "pending".to_string(),
            allocation_id: Some(allocation_id.to_string()),
            tags: Vec::new(),
        };
        state
            .nat_gateways
            .insert(nat_gateway_id.clone(), gateway.clone());
        state
            .nat_tokens
            .insert(client_token.to_string(), nat_gateway_id.clone());
        state.record("CreateNatGateway", &nat_gateway_id);
        Ok(gateway)
    }

    async fn delete_nat_gateway(&self, nat_gateway_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteNatGateway")?;
        let gateway = state
            .nat_gateways
            .get_mut(nat_gateway_id)
            .filter(|n| n.state != "deleted")
            .ok_or_else(|| not_found("InvalidNatGatewayID.NotFound", nat_gateway_id))?;
        if gateway.state != "deleting" {
            gateway.state = "deleting".to_string();
        }
        state.record("DeleteNatGateway", nat_gateway_id);
        Ok(())
    }

    async fn describe_addresses(&self, filters: &[Filter]) -> Result<Vec<Address>, RemoteError> {
        let state = self.begin("DescribeAddresses")?;
        select(state.addresses.values(), filters)
    }

    async fn allocate_address(&self) -> Result<Address, RemoteError> {
        let mut state = self.begin("AllocateAddress")?;
        let allocation_id = state.id("eipalloc");
        let last_octet = state.addresses.len() % 250 + 1;
        let address = Address {
            allocation_id: allocation_id.clone(),
            public_ip: format!("203.0.113.{last_octet}"),
            association_id: None,
            tags: Vec::new(),
        };
        state.addresses.insert(allocation_id.clone(), address.clone());
        state.record("AllocateAddress", &allocation_id);
        Ok(address)
    }

    async fn release_address(&self, allocation_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("ReleaseAddress")?;
        let address = state
            .addresses
            .get(allocation_id)
            .ok_or_else(|| not_found("InvalidAllocationID.NotFound", allocation_id))?;
        if address.association_id.is_some() {
            return Err(RemoteError::from_code(
                "InvalidIPAddress.InUse",
                format!("Address {} is in use", address.public_ip),
            ));
        }

        state.addresses.remove(allocation_id);
        state.record("ReleaseAddress", allocation_id);
        Ok(())
    }

    // ========================================================================
    // Security groups and network interfaces
    // ========================================================================

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<SecurityGroup>, RemoteError> {
        let state = self.begin("DescribeSecurityGroups")?;
        state.page(select(state.security_groups.values(), filters)?, next_token)
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        group_name: &str,
        description: &str,
    ) -> Result<SecurityGroup, RemoteError> {
        let mut state = self.begin("CreateSecurityGroup")?;
        state.vpc(vpc_id)?;
        if state
            .security_groups
            .values()
            .any(|g| g.vpc_id == vpc_id && g.group_name == group_name)
        {
            return Err(RemoteError::from_code(
                "InvalidGroup.Duplicate",
                format!("The security group '{group_name}' already exists"),
            ));
        }

        let group = SecurityGroup {
            group_id: state.id("sg"),
            group_name: group_name.to_string(),
            vpc_id: vpc_id.to_string(),
            description: description.to_string(),
            ingress_rules: Vec::new(),
            tags: Vec::new(),
        };
        state
            .security_groups
            .insert(group.group_id.clone(), group.clone());
        state.record("CreateSecurityGroup", &group.group_id);
        Ok(group)
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteSecurityGroup")?;
        let group = state
            .security_groups
            .get(group_id)
            .ok_or_else(|| not_found("InvalidGroup.NotFound", group_id))?;
        if group.is_default() {
            return Err(RemoteError::from_code(
                "CannotDelete",
                "the specified group: \"default\" name cannot be deleted",
            ));
        }
        let source = RuleSource::Group(group_id.to_string());
        if state
            .security_groups
            .values()
            .any(|g| g.group_id != group_id && g.ingress_rules.iter().any(|r| r.source == source))
        {
            return Err(dependency(format!(
                "resource {group_id} has a dependent object"
            )));
        }

        state.security_groups.remove(group_id);
        state.record("DeleteSecurityGroup", group_id);
        Ok(())
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("AuthorizeSecurityGroupIngress")?;
        for rule in rules {
            if let RuleSource::Group(source) = &rule.source {
                if !state.security_groups.contains_key(source) {
                    return Err(not_found("InvalidGroup.NotFound", source));
                }
            }
        }
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("InvalidGroup.NotFound", group_id))?;
        if let Some(duplicate) = rules.iter().find(|r| group.ingress_rules.contains(r)) {
            return Err(RemoteError::from_code(
                "InvalidPermission.Duplicate",
                format!("the specified rule \"{duplicate}\" already exists"),
            ));
        }

        group.ingress_rules.extend(rules.iter().cloned());
        state.record("AuthorizeSecurityGroupIngress", group_id);
        Ok(())
    }

    async fn revoke_ingress(
        &self,
        group_id: &str,
        rules: &[SecurityRule],
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("RevokeSecurityGroupIngress")?;
        let group = state
            .security_groups
            .get_mut(group_id)
            .ok_or_else(|| not_found("InvalidGroup.NotFound", group_id))?;
        if let Some(missing) = rules.iter().find(|r| !group.ingress_rules.contains(r)) {
            return Err(RemoteError::from_code(
                "InvalidPermission.NotFound",
                format!("The specified rule does not exist in this security group: {missing}"),
            ));
        }

        group.ingress_rules.retain(|r| !rules.contains(r));
        state.record("RevokeSecurityGroupIngress", group_id);
        Ok(())
    }

    async fn describe_network_interfaces(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<NetworkInterface>, RemoteError> {
        let state = self.begin("DescribeNetworkInterfaces")?;
        state.page(select(state.interfaces.values(), filters)?, next_token)
    }

    async fn create_network_interface(
        &self,
        subnet_id: &str,
        private_ip_address: &str,
        description: &str,
    ) -> Result<NetworkInterface, RemoteError> {
        let mut state = self.begin("CreateNetworkInterface")?;
        let subnet = state
            .subnets
            .get(subnet_id)
            .ok_or_else(|| not_found("InvalidSubnetID.NotFound", subnet_id))?;
        let vpc_id = subnet.vpc_id.clone();
        let net = parse_net(&subnet.cidr_block)?;
        let address: Ipv4Addr = private_ip_address
            .parse()
            .map_err(|_| invalid(format!("invalid address {private_ip_address}")))?;
        if !net.contains(&address) {
            return Err(invalid(format!(
                "Address {private_ip_address} does not fall within the subnet's address range"
            )));
        }
        if state
            .interfaces
            .values()
            .any(|i| i.private_ip_address == private_ip_address && i.vpc_id == vpc_id)
        {
            return Err(RemoteError::from_code(
                "InvalidIPAddress.InUse",
                format!("The specified address is already in use: {private_ip_address}"),
            ));
        }

        let interface = NetworkInterface {
            network_interface_id: state.id("eni"),
            subnet_id: subnet_id.to_string(),
            vpc_id,
            private_ip_address: private_ip_address.to_string(),
            description: description.to_string(),
            attachment_id: None,
            requester_managed: false,
        };
        state
            .interfaces
            .insert(interface.network_interface_id.clone(), interface.clone());
        state.record("CreateNetworkInterface", &interface.network_interface_id);
        Ok(interface)
    }

    async fn detach_network_interface(&self, attachment_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DetachNetworkInterface")?;
        let interface = state
            .interfaces
            .values_mut()
            .find(|i| i.attachment_id.as_deref() == Some(attachment_id))
            .ok_or_else(|| not_found("InvalidAttachmentID.NotFound", attachment_id))?;
        if interface.requester_managed {
            return Err(not_permitted(&interface.network_interface_id));
        }
        interface.attachment_id = None;
        state.record("DetachNetworkInterface", attachment_id);
        Ok(())
    }

    async fn delete_network_interface(
        &self,
        network_interface_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteNetworkInterface")?;
        let interface = state
            .interfaces
            .get(network_interface_id)
            .ok_or_else(|| not_found("InvalidNetworkInterfaceID.NotFound", network_interface_id))?;
        if interface.requester_managed {
            return Err(not_permitted(network_interface_id));
        }
        if interface.attachment_id.is_some() {
            return Err(RemoteError::from_code(
                "InvalidNetworkInterface.InUse",
                format!("Interface {network_interface_id} is currently in use"),
            ));
        }

        state.interfaces.remove(network_interface_id);
        state.record("DeleteNetworkInterface", network_interface_id);
        Ok(())
    }

    // ========================================================================
    // Internet and VPN gateways
    // ========================================================================

    async fn describe_internet_gateways(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<InternetGateway>, RemoteError> {
        let state = self.begin("DescribeInternetGateways")?;
        select(state.internet_gateways.values(), filters)
    }

    async fn create_internet_gateway(&self) -> Result<InternetGateway, RemoteError> {
        let mut state = self.begin("CreateInternetGateway")?;
        let gateway = InternetGateway {
            internet_gateway_id: state.id("igw"),
            attachments: Vec::new(),
            tags: Vec::new(),
        };
        state
            .internet_gateways
            .insert(gateway.internet_gateway_id.clone(), gateway.clone());
        state.record("CreateInternetGateway", &gateway.internet_gateway_id);
        Ok(gateway)
    }

    async fn attach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("AttachInternetGateway")?;
        state.vpc(vpc_id)?;
        let gateway = state
            .internet_gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found("InvalidInternetGatewayID.NotFound", gateway_id))?;
        if !gateway.attachments.is_empty() {
            return Err(RemoteError::from_code(
                "Resource.AlreadyAssociated",
                format!("resource {gateway_id} is already attached"),
            ));
        }

        gateway.attachments.push(GatewayAttachment {
            vpc_id: vpc_id.to_string(),
            state: "available".to_string(),
        });
        state.record("AttachInternetGateway", &format!("{gateway_id} {vpc_id}"));
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        gateway_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("DetachInternetGateway")?;
        let gateway = state
            .internet_gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found("InvalidInternetGatewayID.NotFound", gateway_id))?;
        if !gateway.attachments.iter().any(|a| a.vpc_id == vpc_id) {
            return Err(RemoteError::from_code(
                "Gateway.NotAttached",
                format!("resource {gateway_id} is not attached to network {vpc_id}"),
            ));
        }

        gateway.attachments.retain(|a| a.vpc_id != vpc_id);
        state.record("DetachInternetGateway", &format!("{gateway_id} {vpc_id}"));
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteInternetGateway")?;
        let gateway = state
            .internet_gateways
            .get(gateway_id)
            .ok_or_else(|| not_found("InvalidInternetGatewayID.NotFound", gateway_id))?;
        if !gateway.attachments.is_empty() {
            return Err(dependency(format!(
                "The internetGateway '{gateway_id}' has dependencies and cannot be deleted."
            )));
        }

        state.internet_gateways.remove(gateway_id);
        state.record("DeleteInternetGateway", gateway_id);
        Ok(())
    }

    async fn describe_vpn_gateways(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<VpnGateway>, RemoteError> {
        let state = self.begin("DescribeVpnGateways")?;
        select(state.vpn_gateways.values(), filters)
    }

    async fn attach_vpn_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("AttachVpnGateway")?;
        state.vpc(vpc_id)?;
        let gateway = state
            .vpn_gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found("InvalidVpnGatewayID.NotFound", gateway_id))?;
        if gateway.attached_vpc().is_some() {
            return Err(RemoteError::from_code(
                "InvalidVpnGatewayAttachment.LimitExceeded",
                format!("{gateway_id} is already attached"),
            ));
        }

        gateway.attachments.retain(|a| a.vpc_id != vpc_id);
        gateway.attachments.push(GatewayAttachment {
            vpc_id: vpc_id.to_string(),
            state: "attached".to_string(),
        });
        state.record("AttachVpnGateway", &format!("{gateway_id} {vpc_id}"));
        Ok(())
    }

    async fn detach_vpn_gateway(&self, gateway_id: &str, vpc_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DetachVpnGateway")?;
        let gateway = state
            .vpn_gateways
            .get_mut(gateway_id)
            .ok_or_else(|| not_found("InvalidVpnGatewayID.NotFound", gateway_id))?;
        let attachment = gateway
            .attachments
            .iter_mut()
            .find(|a| a.vpc_id == vpc_id && a.state != "detached")
            .ok_or_else(|| {
                not_found(
                    "InvalidVpnGatewayAttachment.NotFound",
                    &format!("{gateway_id}/{vpc_id}"),
                )
            })?;

        attachment.state = "detached".to_string();
        state.record("DetachVpnGateway", &format!("{gateway_id} {vpc_id}"));
        Ok(())
    }

    // ========================================================================
    // Peering connections
    // ========================================================================

    async fn describe_vpc_peering_connections(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<Page<VpcPeering>, RemoteError> {
        let state = self.begin("DescribeVpcPeeringConnections")?;
        state.page(select(state.peerings.values(), filters)?, next_token)
    }

    async fn create_vpc_peering_connection(
        &self,
        requester_vpc_id: &str,
        accepter_vpc_id: &str,
    ) -> Result<VpcPeering, RemoteError> {
        let mut state = self.begin("CreateVpcPeeringConnection")?;
        state.vpc(requester_vpc_id)?;
        state.vpc(accepter_vpc_id)?;

        let peering = VpcPeering {
            vpc_peering_connection_id: state.id("pcx"),
            requester_vpc_id: requester_vpc_id.to_string(),
            accepter_vpc_id: accepter_vpc_id.to_string(),
            status: "pending-acceptance".to_string(),
            tags: Vec::new(),
        };
        state
            .peerings
            .insert(peering.vpc_peering_connection_id.clone(), peering.clone());
        state.record(
            "CreateVpcPeeringConnection",
            &peering.vpc_peering_connection_id,
        );
        Ok(peering)
    }

    async fn accept_vpc_peering_connection(&self, peering_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("AcceptVpcPeeringConnection")?;
        let peering = state
            .peerings
            .get_mut(peering_id)
            .ok_or_else(|| not_found("InvalidVpcPeeringConnectionID.NotFound", peering_id))?;
        if peering.status != "pending-acceptance" {
            return Err(RemoteError::from_code(
                "InvalidStateTransition",
                format!("{peering_id} is in state {}", peering.status),
            ));
        }

        peering.status = "active".to_string();
        state.record("AcceptVpcPeeringConnection", peering_id);
        Ok(())
    }

    async fn delete_vpc_peering_connection(&self, peering_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteVpcPeeringConnection")?;
        let peering = state
            .peerings
            .get_mut(peering_id)
            .filter(|p| p.is_live())
            .ok_or_else(|| not_found("InvalidVpcPeeringConnectionID.NotFound", peering_id))?;

        peering.status = "deleted".to_string();
        state.record("DeleteVpcPeeringConnection", peering_id);
        Ok(())
    }

    // ========================================================================
    // DHCP option sets
    // ========================================================================

    async fn describe_dhcp_options(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<DhcpOptions>, RemoteError> {
        let state = self.begin("DescribeDhcpOptions")?;
        select(state.dhcp_options.values(), filters)
    }

    async fn create_dhcp_options(
        &self,
        configurations: &[DhcpConfiguration],
    ) -> Result<DhcpOptions, RemoteError> {
        let mut state = self.begin("CreateDhcpOptions")?;
        if configurations.is_empty() {
            return Err(invalid("At least one DHCP configuration is required".to_string()));
        }
        let options = DhcpOptions {
            dhcp_options_id: state.id("dopt"),
            dhcp_configurations: configurations.to_vec(),
            tags: Vec::new(),
        };
        state
            .dhcp_options
            .insert(options.dhcp_options_id.clone(), options.clone());
        state.record("CreateDhcpOptions", &options.dhcp_options_id);
        Ok(options)
    }

    async fn associate_dhcp_options(
        &self,
        dhcp_options_id: &str,
        vpc_id: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.begin("AssociateDhcpOptions")?;
        if !state.dhcp_options.contains_key(dhcp_options_id) {
            return Err(not_found("InvalidDhcpOptionID.NotFound", dhcp_options_id));
        }
        let vpc = state
            .vpcs
            .get_mut(vpc_id)
            .ok_or_else(|| not_found("InvalidVpcID.NotFound", vpc_id))?;

        vpc.dhcp_options_id = Some(dhcp_options_id.to_string());
        state.record("AssociateDhcpOptions", &format!("{dhcp_options_id} {vpc_id}"));
        Ok(())
    }

    async fn delete_dhcp_options(&self, dhcp_options_id: &str) -> Result<(), RemoteError> {
        let mut state = self.begin("DeleteDhcpOptions")?;
        if !state.dhcp_options.contains_key(dhcp_options_id) {
            return Err(not_found("InvalidDhcpOptionID.NotFound", dhcp_options_id));
        }
        if state
            .vpcs
            .values()
            .any(|v| v.dhcp_options_id.as_deref() == Some(dhcp_options_id))
        {
            return Err(dependency(format!(
                "The dhcpOptions '{dhcp_options_id}' has dependencies and cannot be deleted."
            )));
        }

        state.dhcp_options.remove(dhcp_options_id);
        state.record("DeleteDhcpOptions", dhcp_options_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subnet_blocked_by_nat_gateway() {
        let ec2 = InMemoryEc2::new();
        let vpc = ec2.create_vpc("10.0.0.0/16").await.unwrap();
        let subnet = ec2
            .create_subnet(&vpc.vpc_id, "10.0.0.0/24", "us-east-1a")
            .await
            .unwrap();
        let address = ec2.allocate_address().await.unwrap();
        let nat = ec2
            .create_nat_gateway(&subnet.subnet_id, &address.allocation_id, "token")
            .await
            .unwrap();

        let err = ec2.delete_subnet(&subnet.subnet_id).await.unwrap_err();
        assert_eq!(err.code(), Some("DependencyViolation"));

        // the gateway's own interface belongs to the service
        let interfaces = ec2.describe_network_interfaces(&[], None).await.unwrap().items;
        assert_eq!(interfaces.len(), 1);
        assert!(interfaces[0].requester_managed);
        assert_eq!(interfaces[0].private_ip_address, "10.0.0.4");
        let err = ec2
            .delete_network_interface(&interfaces[0].network_interface_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("OperationNotPermitted"));

        ec2.delete_nat_gateway(&nat.nat_gateway_id).await.unwrap();
        // deleting -> deleted happens on the next describe
        ec2.describe_nat_gateways(&[], None).await.unwrap();
        assert!(ec2.describe_network_interfaces(&[], None).await.unwrap().items.is_empty());
        ec2.delete_subnet(&subnet.subnet_id).await.unwrap();
        ec2.release_address(&address.allocation_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_pagination_and_unknown_filter() {
        let ec2 = InMemoryEc2::new().with_page_size(2);
        for i in 0..5 {
            ec2.create_vpc(&format!("10.{i}.0.0/16")).await.unwrap();
        }

        let first = ec2.describe_vpcs(&[], None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.next_token.unwrap();
        let second = ec2.describe_vpcs(&[], Some(token)).await.unwrap();
        assert_eq!(second.items.len(), 2);
        let third = ec2.describe_vpcs(&[], second.next_token).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_token.is_none());

        let err = ec2
            .describe_vpcs(&[Filter::new("bogus", ["x"])], None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("InvalidParameterValue"));
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let ec2 = InMemoryEc2::new();
        ec2.throttle_next("CreateVpc", 1);
        ec2.fail_next("CreateVpc", "VpcLimitExceeded");

        assert!(ec2.create_vpc("10.0.0.0/16").await.unwrap_err().is_throttling());
        assert_eq!(
            ec2.create_vpc("10.0.0.0/16").await.unwrap_err().code(),
            Some("VpcLimitExceeded")
        );
        ec2.create_vpc("10.0.0.0/16").await.unwrap();
        assert_eq!(ec2.operations(), vec!["CreateVpc"]);
    }
}
