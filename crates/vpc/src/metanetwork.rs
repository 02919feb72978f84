//! Meta-networks: named partitions of an environment's address space.
//!
//! A meta-network owns one subnet per availability zone, the route table(s)
//! those subnets use, any NAT gateways inside them, and one security group.
//! Its resources are found again through the `meta_network` tag, so nothing
//! here is cached beyond identifiers that never change after creation.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

use crate::allocator::{child_prefix_len, child_prefix_offset};
use crate::ec2::{
    Filter, NatGateway, NetworkInterface, Route, RouteTable, RouteTarget, SecurityGroup,
    SecurityRule, Subnet, Tag, Tagged, DEFAULT_ROUTE,
};
use crate::error::{Result, VpcError};
use crate::lifecycle::Environment;
use crate::remote::{tolerate_missing, Remote, DEFAULT_TIMEOUT};

/// Tag key naming the meta-network a resource belongs to.
pub const META_NETWORK_TAG: &str = "meta_network";

/// Tag marking elastic addresses acquired for (and released with) a NAT gateway.
pub const DYNAMIC_TAG: &str = "dynamic";

/// NAT gateways take minutes to come up and go away.
const NAT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(900);

/// Provisioning progress of a meta-network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MetaNetworkState {
    Unprovisioned,
    SubnetsCreated,
    RouteTableBound,
    NoNat,
    NatConfigured,
    SecurityGroupBound,
    Active,
}

/// Outcome of a security-group rule reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub added: Vec<SecurityRule>,
    pub removed: Vec<SecurityRule>,
}

impl RuleDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One meta-network of an environment.
#[derive(Clone)]
pub struct MetaNetwork {
    remote: Remote,
    name: String,
    environment: String,
    vpc_id: String,
    cidr: Ipv4Net,
    subnets: Vec<Subnet>,
    security_group_id: Option<String>,
    state: MetaNetworkState,
}

impl std::fmt::Debug for MetaNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaNetwork")
            .field("name", &self.name)
            .field("environment", &self.environment)
            .field("cidr", &self.cidr)
            .field("subnets", &self.subnets.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Smallest block covering all subnets, given one subnet per zone.
fn supernet(subnets: &[Subnet]) -> Option<Ipv4Net> {
    let first = subnets
        .iter()
        .filter_map(|s| s.cidr_block.parse::<Ipv4Net>().ok())
        .min()?;
    let prefix_len = first
        .prefix_len()
        .checked_sub(child_prefix_offset(subnets.len()))?;
    Ipv4Net::new(first.network(), prefix_len)
        .ok()
        .map(|net| net.trunc())
}

impl MetaNetwork {
    /// A meta-network that does not exist remotely yet.
    pub fn new(remote: Remote, environment: &Environment, name: &str, cidr: Ipv4Net) -> Self {
        Self {
            remote,
            name: name.to_string(),
            environment: environment.name.clone(),
            vpc_id: environment.vpc_id.clone(),
            cidr,
            subnets: Vec::new(),
            security_group_id: None,
            state: MetaNetworkState::Unprovisioned,
        }
    }

    /// Rebuild every meta-network of an environment from live state.
    ///
    /// # Errors
    /// Any remote failure while describing.
    pub async fn load_all(
        remote: &Remote,
        environment: &Environment,
    ) -> Result<BTreeMap<String, MetaNetwork>> {
        let filters = [Filter::vpc(&environment.vpc_id)];
        let subnets = remote
            .call_paged("DescribeSubnets", |api, token| {
                api.describe_subnets(&filters, token)
            })
            .await?;
        let groups = remote
            .call_paged("DescribeSecurityGroups", |api, token| {
                api.describe_security_groups(&filters, token)
            })
            .await?;

        let mut by_network: BTreeMap<String, Vec<Subnet>> = BTreeMap::new();
        for subnet in subnets {
            if let Some(name) = subnet.tag(META_NETWORK_TAG).map(str::to_string) {
                by_network.entry(name).or_default().push(subnet);
            }
        }

        let mut networks = BTreeMap::new();
        for (name, mut subnets) in by_network {
            subnets.sort_by(|a, b| a.availability_zone.cmp(&b.availability_zone));
            let Some(cidr) = supernet(&subnets) else {
                warn!(network = %name, "Cannot derive meta-network block from subnets");
                continue;
            };
            let security_group_id = groups
                .iter()
                .find(|g| g.tag(META_NETWORK_TAG) == Some(name.as_str()))
                .map(|g| g.group_id.clone());
            let state = if security_group_id.is_some() {
                MetaNetworkState::Active
            } else {
                MetaNetworkState::RouteTableBound
            };

            networks.insert(
                name.clone(),
                MetaNetwork {
                    remote: remote.clone(),
                    name,
                    environment: environment.name.clone(),
                    vpc_id: environment.vpc_id.clone(),
                    cidr,
                    subnets,
                    security_group_id,
                    state,
                },
            );
        }

        debug!(environment = %environment.name, count = networks.len(), "Loaded meta-networks");
        Ok(networks)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    #[must_use]
    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    #[must_use]
    pub fn security_group_id(&self) -> Option<&str> {
        self.security_group_id.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> MetaNetworkState {
        self.state
    }

    /// `<env>_<network>` or `<env>_<network>_<suffix>`.
    #[must_use]
    pub fn resource_name(&self, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}_{}_{suffix}", self.environment, self.name),
            None => format!("{}_{}", self.environment, self.name),
        }
    }

    fn resource_filters(&self) -> [Filter; 2] {
        [
            Filter::vpc(&self.vpc_id),
            Filter::tag(META_NETWORK_TAG, &self.name),
        ]
    }

    async fn tag_resource(&self, resource_id: &str, suffix: Option<&str>) -> Result<()> {
        let ids = [resource_id.to_string()];
        let tags = [
            Tag::new("Name", self.resource_name(suffix)),
            Tag::new(META_NETWORK_TAG, &self.name),
        ];
        self.remote
            .keep_trying("CreateTags", DEFAULT_TIMEOUT, |api| {
                api.create_tags(&ids, &tags)
            })
            .await
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create one subnet per zone and bind them to a shared route table.
    ///
    /// # Errors
    /// `Config` if there are no zones or the block is too small to split;
    /// any remote failure aborts creation.
    pub async fn create(&mut self, zones: &[String]) -> Result<()> {
        if zones.is_empty() {
            return Err(VpcError::Config(format!(
                "no availability zones to place {} in",
                self.resource_name(None)
            )));
        }
        info!(network = %self.resource_name(None), cidr = %self.cidr, "Creating meta-network");

        let prefix_len = child_prefix_len(self.cidr, zones.len())?;
        let blocks: Vec<Ipv4Net> = self
            .cidr
            .subnets(prefix_len)
            .map_err(|e| VpcError::Config(format!("cannot split {}: {e}", self.cidr)))?
            .take(zones.len())
            .collect();

        for (zone, block) in zones.iter().zip(blocks) {
            let cidr_block = block.to_string();
            let subnet = self
                .remote
                .call("CreateSubnet", |api| {
                    api.create_subnet(&self.vpc_id, &cidr_block, zone)
                })
                .await?;
            self.tag_resource(&subnet.subnet_id, Some(zone.as_str())).await?;
            debug!(subnet_id = %subnet.subnet_id, zone = %zone, cidr = %cidr_block, "Created subnet");
            self.subnets.push(subnet);
        }
        self.state = MetaNetworkState::SubnetsCreated;

        let table = self
            .remote
            .call("CreateRouteTable", |api| api.create_route_table(&self.vpc_id))
            .await?;
        self.tag_resource(&table.route_table_id, None).await?;
        for subnet in &self.subnets {
            self.remote
                .call("AssociateRouteTable", |api| {
                    api.associate_route_table(&table.route_table_id, &subnet.subnet_id)
                })
                .await?;
        }
        self.state = MetaNetworkState::RouteTableBound;

        Ok(())
    }

    /// Create the network's security group if it does not exist yet.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn bind_security_group(&mut self, description: &str) -> Result<&str> {
        let group_id = match self.security_group_id.take() {
            Some(group_id) => group_id,
            None => {
                let group_name = self.resource_name(None);
                let group = self
                    .remote
                    .call("CreateSecurityGroup", |api| {
                        api.create_security_group(&self.vpc_id, &group_name, description)
                    })
                    .await?;
                self.tag_resource(&group.group_id, None).await?;
                info!(group_id = %group.group_id, network = %group_name, "Created security group");
                group.group_id
            }
        };

        if self.state < MetaNetworkState::SecurityGroupBound {
            self.state = MetaNetworkState::SecurityGroupBound;
        }
        Ok(self.security_group_id.insert(group_id).as_str())
    }

    // ========================================================================
    // Routes
    // ========================================================================

    /// Route tables used by this network's subnets.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn route_tables(&self) -> Result<Vec<RouteTable>> {
        let filters = self.resource_filters();
        self.remote
            .call_paged("DescribeRouteTables", |api, token| {
                api.describe_route_tables(&filters, token)
            })
            .await
    }

    /// Whether every subnet has a route table of its own.
    fn has_per_subnet_tables(&self, tables: &[RouteTable]) -> bool {
        self.subnets.iter().all(|subnet| {
            tables
                .iter()
                .find(|t| t.association_for(&subnet.subnet_id).is_some())
                .is_some_and(|t| t.associations.len() == 1)
        })
    }

    /// Add a route to every route table of the network.
    ///
    /// # Errors
    /// Any remote failure, including `RouteAlreadyExists`.
    pub async fn add_route(&self, destination: &str, target: RouteTarget) -> Result<()> {
        let route = Route::new(destination, target);
        for table in self.route_tables().await? {
            self.remote
                .call("CreateRoute", |api| {
                    api.create_route(&table.route_table_id, &route)
                })
                .await?;
            info!(route_table_id = %table.route_table_id, destination, target = %route.target, "Added route");
        }
        Ok(())
    }

    /// Point `destination` at `target` in every route table of the network,
    /// replacing a different existing route. Returns whether anything changed.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn replace_or_create_route(
        &self,
        destination: &str,
        target: RouteTarget,
    ) -> Result<bool> {
        let route = Route::new(destination, target);
        let mut changed = false;
        for table in self.route_tables().await? {
            changed |= self.upsert_route(&table, &route).await?;
        }
        Ok(changed)
    }

    async fn upsert_route(&self, table: &RouteTable, route: &Route) -> Result<bool> {
        match table.route_to(&route.destination_cidr_block) {
            Some(existing) if existing.target == route.target => Ok(false),
            Some(existing) => {
                info!(
                    route_table_id = %table.route_table_id,
                    destination = %route.destination_cidr_block,
                    old_target = %existing.target,
                    new_target = %route.target,
                    "Replacing route"
                );
                self.remote
                    .call("ReplaceRoute", |api| {
                        api.replace_route(&table.route_table_id, route)
                    })
                    .await?;
                Ok(true)
            }
            None => {
                info!(
                    route_table_id = %table.route_table_id,
                    destination = %route.destination_cidr_block,
                    target = %route.target,
                    "Creating route"
                );
                self.remote
                    .call("CreateRoute", |api| {
                        api.create_route(&table.route_table_id, route)
                    })
                    .await?;
                Ok(true)
            }
        }
    }

    /// Upsert a route to a peer network through a peering connection.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn create_peering_route(
        &self,
        peering_id: &str,
        remote_cidr: &str,
    ) -> Result<bool> {
        self.replace_or_create_route(remote_cidr, RouteTarget::Peering(peering_id.to_string()))
            .await
    }

    /// Remove the route for `destination` from every route table of the network.
    ///
    /// # Errors
    /// Any remote failure other than the route already being gone.
    pub async fn delete_route(&self, destination: &str) -> Result<()> {
        for table in self.route_tables().await? {
            if table
                .route_to(destination)
                .is_some_and(|r| !r.target.is_local())
            {
                let result = self
                    .remote
                    .call("DeleteRoute", |api| {
                        api.delete_route(&table.route_table_id, destination)
                    })
                    .await;
                tolerate_missing(result, "route")?;
            }
        }
        Ok(())
    }

    /// Give every subnet its own route table, carrying over all routes of
    /// the shared table it used before.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn recreate_route_table(&self) -> Result<()> {
        let tables = self.route_tables().await?;
        if self.has_per_subnet_tables(&tables) {
            return Ok(());
        }
        info!(network = %self.resource_name(None), "Splitting shared route table");

        let mut retired = BTreeSet::new();
        for subnet in &self.subnets {
            let Some(old) = tables
                .iter()
                .find(|t| t.association_for(&subnet.subnet_id).is_some())
            else {
                continue;
            };
            let Some(association) = old.association_for(&subnet.subnet_id) else {
                continue;
            };
            if old.associations.len() == 1 {
                continue;
            }

            let new = self
                .remote
                .call("CreateRouteTable", |api| api.create_route_table(&self.vpc_id))
                .await?;
            self.tag_resource(&new.route_table_id, Some(subnet.availability_zone.as_str()))
                .await?;
            for route in old.routes.iter().filter(|r| !r.target.is_local()) {
                self.remote
                    .call("CreateRoute", |api| {
                        api.create_route(&new.route_table_id, route)
                    })
                    .await?;
            }
            self.remote
                .call("ReplaceRouteTableAssociation", |api| {
                    api.replace_route_table_association(
                        &association.route_table_association_id,
                        &new.route_table_id,
                    )
                })
                .await?;
            retired.insert(old.route_table_id.clone());
        }

        for route_table_id in &retired {
            let result = self
                .remote
                .call("DeleteRouteTable", |api| api.delete_route_table(route_table_id))
                .await;
            tolerate_missing(result, "route table")?;
        }
        Ok(())
    }

    // ========================================================================
    // NAT gateways
    // ========================================================================

    /// Live NAT gateways inside this network's subnets.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn nat_gateways(&self) -> Result<Vec<NatGateway>> {
        if self.subnets.is_empty() {
            return Ok(Vec::new());
        }
        let filters = [
            Filter::vpc(&self.vpc_id),
            Filter::new(
                "subnet-id",
                self.subnets.iter().map(|s| s.subnet_id.clone()),
            ),
        ];
        let gateways = self
            .remote
            .call_paged("DescribeNatGateways", |api, token| {
                api.describe_nat_gateways(&filters, token)
            })
            .await?;
        Ok(gateways.into_iter().filter(|n| !n.is_gone()).collect())
    }

    /// Create a NAT gateway in `subnet`. Without an allocation id a dynamic
    /// address is acquired and tagged so teardown knows to release it.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn add_nat_gateway(
        &self,
        subnet: &Subnet,
        allocation_id: Option<&str>,
    ) -> Result<NatGateway> {
        let allocation_id = match allocation_id {
            Some(id) => id.to_string(),
            None => {
                let address = self
                    .remote
                    .call("AllocateAddress", |api| api.allocate_address())
                    .await?;
                let ids = [address.allocation_id.clone()];
                let tags = [Tag::new(DYNAMIC_TAG, "true")];
                self.remote
                    .keep_trying("CreateTags", DEFAULT_TIMEOUT, |api| {
                        api.create_tags(&ids, &tags)
                    })
                    .await?;
                debug!(allocation_id = %address.allocation_id, public_ip = %address.public_ip, "Allocated dynamic address");
                address.allocation_id
            }
        };

        let client_token = uuid::Uuid::new_v4().to_string();
        let gateway = self
            .remote
            .call("CreateNatGateway", |api| {
                api.create_nat_gateway(&subnet.subnet_id, &allocation_id, &client_token)
            })
            .await?;
        self.tag_resource(&gateway.nat_gateway_id, Some(subnet.availability_zone.as_str()))
            .await?;

        info!(
            nat_gateway_id = %gateway.nat_gateway_id,
            subnet_id = %subnet.subnet_id,
            "Created NAT gateway"
        );
        Ok(gateway)
    }

    /// Ensure one NAT gateway per subnet and wait until they are available.
    ///
    /// `allocation_ids` holds one entry per subnet, in zone order; `None`
    /// entries get a dynamic address. Subnets that already have a gateway
    /// are left alone.
    ///
    /// # Errors
    /// `Config` if the number of entries does not match the subnets;
    /// `TerminalState`/`Timeout` if a gateway does not come up.
    pub async fn add_nat_gateways(&mut self, allocation_ids: &[Option<String>]) -> Result<()> {
        if allocation_ids.len() != self.subnets.len() {
            return Err(VpcError::Config(format!(
                "{} NAT gateway addresses configured for {} subnets of {}",
                allocation_ids.len(),
                self.subnets.len(),
                self.resource_name(None)
            )));
        }

        let existing = self.nat_gateways().await?;
        let mut created = Vec::new();
        for (subnet, allocation_id) in self.subnets.iter().zip(allocation_ids) {
            if existing.iter().any(|n| n.subnet_id == subnet.subnet_id) {
                continue;
            }
            let gateway = self
                .add_nat_gateway(subnet, allocation_id.as_deref())
                .await?;
            created.push(gateway.nat_gateway_id);
        }

        if !created.is_empty() {
            let filters = [Filter::new("nat-gateway-id", created)];
            let filters = &filters[..];
            self.remote
                .wait_for_state(
                    "NAT gateways",
                    |api| async move {
                        api.describe_nat_gateways(filters, None)
                            .await
                            .map(|page| page.items)
                    },
                    |n: &NatGateway| n.state.as_str(),
                    "available",
                    NAT_GATEWAY_TIMEOUT,
                )
                .await?;
        }

        self.state = MetaNetworkState::NatConfigured;
        Ok(())
    }

    /// Delete every NAT gateway, wait until they are gone, then release the
    /// dynamic addresses they held.
    ///
    /// # Errors
    /// Any remote failure other than a gateway already being gone.
    pub async fn delete_nat_gateways(&mut self) -> Result<()> {
        let gateways = self.nat_gateways().await?;
        if gateways.is_empty() {
            if self.state == MetaNetworkState::NatConfigured {
                self.state = MetaNetworkState::NoNat;
            }
            return Ok(());
        }

        for gateway in &gateways {
            info!(nat_gateway_id = %gateway.nat_gateway_id, "Deleting NAT gateway");
            let result = self
                .remote
                .call("DeleteNatGateway", |api| {
                    api.delete_nat_gateway(&gateway.nat_gateway_id)
                })
                .await;
            tolerate_missing(result, "NAT gateway")?;
        }

        let filters = [Filter::new(
            "nat-gateway-id",
            gateways.iter().map(|n| n.nat_gateway_id.clone()),
        )];
        let filters = &filters[..];
        self.remote
            .wait_for_state(
                "NAT gateway deletion",
                |api| async move {
                    api.describe_nat_gateways(filters, None)
                        .await
                        .map(|page| page.items)
                },
                |n: &NatGateway| n.state.as_str(),
                "deleted",
                NAT_GATEWAY_TIMEOUT,
            )
            .await?;

        let allocation_ids: Vec<String> = gateways
            .iter()
            .filter_map(|n| n.allocation_id.clone())
            .collect();
        if !allocation_ids.is_empty() {
            let filters = [
                Filter::new("allocation-id", allocation_ids),
                Filter::tag(DYNAMIC_TAG, "true"),
            ];
            let dynamic = self
                .remote
                .call("DescribeAddresses", |api| api.describe_addresses(&filters))
                .await?;
            for address in dynamic {
                debug!(allocation_id = %address.allocation_id, "Releasing dynamic address");
                let result = self
                    .remote
                    .call("ReleaseAddress", |api| {
                        api.release_address(&address.allocation_id)
                    })
                    .await;
                tolerate_missing(result, "elastic address")?;
            }
        }

        self.state = MetaNetworkState::NoNat;
        Ok(())
    }

    /// Mark a network that needs no NAT gateways.
    pub fn mark_no_nat(&mut self) {
        if self.state < MetaNetworkState::NoNat {
            self.state = MetaNetworkState::NoNat;
        }
    }

    /// Route each subnet's default traffic through `target`'s NAT gateway in
    /// the same zone, giving each subnet its own table first.
    ///
    /// # Errors
    /// `Config` if `target` has no NAT gateway in one of this network's zones.
    pub async fn add_nat_gateway_route(&self, target: &MetaNetwork) -> Result<()> {
        let gateways = target.nat_gateways().await?;
        let zone_gateways: BTreeMap<&str, &str> = gateways
            .iter()
            .filter_map(|n| {
                target
                    .subnets
                    .iter()
                    .find(|s| s.subnet_id == n.subnet_id)
                    .map(|s| (s.availability_zone.as_str(), n.nat_gateway_id.as_str()))
            })
            .collect();

        let mut routes = Vec::with_capacity(self.subnets.len());
        for subnet in &self.subnets {
            let nat_gateway_id = zone_gateways
                .get(subnet.availability_zone.as_str())
                .ok_or_else(|| {
                    VpcError::Config(format!(
                        "{} has no NAT gateway in {} for {}",
                        target.resource_name(None),
                        subnet.availability_zone,
                        self.resource_name(None)
                    ))
                })?;
            routes.push((
                subnet.subnet_id.as_str(),
                Route::new(
                    DEFAULT_ROUTE,
                    RouteTarget::NatGateway((*nat_gateway_id).to_string()),
                ),
            ));
        }

        self.recreate_route_table().await?;
        let tables = self.route_tables().await?;
        for (subnet_id, route) in &routes {
            if let Some(table) = tables
                .iter()
                .find(|t| t.association_for(subnet_id).is_some())
            {
                self.upsert_route(table, route).await?;
            }
        }
        Ok(())
    }

    /// Drop default routes that go through a NAT gateway.
    ///
    /// # Errors
    /// Any remote failure other than the route already being gone.
    pub async fn delete_nat_gateway_route(&self) -> Result<()> {
        for table in self.route_tables().await? {
            let through_nat = table
                .route_to(DEFAULT_ROUTE)
                .is_some_and(|r| matches!(r.target, RouteTarget::NatGateway(_)));
            if through_nat {
                info!(route_table_id = %table.route_table_id, "Deleting NAT default route");
                let result = self
                    .remote
                    .call("DeleteRoute", |api| {
                        api.delete_route(&table.route_table_id, DEFAULT_ROUTE)
                    })
                    .await;
                tolerate_missing(result, "route")?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Security group
    // ========================================================================

    /// The network's security group as it is now.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn security_group(&self) -> Result<Option<SecurityGroup>> {
        let Some(group_id) = self.security_group_id.as_deref() else {
            return Ok(None);
        };
        let filters = [Filter::new("group-id", [group_id])];
        let groups = self
            .remote
            .call_paged("DescribeSecurityGroups", |api, token| {
                api.describe_security_groups(&filters, token)
            })
            .await?;
        Ok(groups.into_iter().next())
    }

    /// Make the group's ingress rules exactly `desired`.
    ///
    /// # Errors
    /// `Config` if the network has no security group yet.
    pub async fn update_sg_rules(
        &mut self,
        desired: &[SecurityRule],
        dry_run: bool,
    ) -> Result<RuleDiff> {
        let group = self.security_group().await?.ok_or_else(|| {
            VpcError::Config(format!(
                "{} has no security group",
                self.resource_name(None)
            ))
        })?;

        let desired: BTreeSet<&SecurityRule> = desired.iter().collect();
        let existing: BTreeSet<&SecurityRule> = group.ingress_rules.iter().collect();
        let diff = RuleDiff {
            added: desired.difference(&existing).map(|r| (*r).clone()).collect(),
            removed: existing.difference(&desired).map(|r| (*r).clone()).collect(),
        };

        for rule in &diff.added {
            info!(group_id = %group.group_id, rule = %rule, dry_run, "Authorizing ingress");
        }
        for rule in &diff.removed {
            info!(group_id = %group.group_id, rule = %rule, dry_run, "Revoking ingress");
        }
        if dry_run {
            return Ok(diff);
        }

        if !diff.removed.is_empty() {
            self.remote
                .call("RevokeSecurityGroupIngress", |api| {
                    api.revoke_ingress(&group.group_id, &diff.removed)
                })
                .await?;
        }
        if !diff.added.is_empty() {
            self.remote
                .call("AuthorizeSecurityGroupIngress", |api| {
                    api.authorize_ingress(&group.group_id, &diff.added)
                })
                .await?;
        }

        self.state = MetaNetworkState::Active;
        Ok(diff)
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    /// The subnet whose block contains `address`.
    #[must_use]
    pub fn subnet_by_ip(&self, address: Ipv4Addr) -> Option<&Subnet> {
        self.subnets.iter().find(|s| {
            s.cidr_block
                .parse::<Ipv4Net>()
                .is_ok_and(|net| net.contains(&address))
        })
    }

    /// Resolve an address or a `+N`/`-N` offset from the network's first
    /// and last address.
    ///
    /// # Errors
    /// `Config` if the value is malformed or falls outside the network.
    pub fn ip_by_offset(&self, value: &str) -> Result<Ipv4Addr> {
        let value = value.trim();
        let first = u32::from(self.cidr.network());
        let last = u32::from(self.cidr.broadcast());

        let address = if let Some(offset) = value.strip_prefix('+') {
            offset
                .parse::<u32>()
                .ok()
                .and_then(|n| first.checked_add(n))
        } else if let Some(offset) = value.strip_prefix('-') {
            offset
                .parse::<u32>()
                .ok()
                .and_then(|n| last.checked_sub(n))
        } else {
            value.parse::<Ipv4Addr>().ok().map(u32::from)
        };

        address
            .filter(|a| (first..=last).contains(a))
            .map(Ipv4Addr::from)
            .ok_or_else(|| {
                VpcError::Config(format!(
                    "'{value}' is not an address inside {} ({})",
                    self.resource_name(None),
                    self.cidr
                ))
            })
    }

    /// Pre-create an interface holding `address`, or return the one that does.
    ///
    /// # Errors
    /// `Config` if no subnet contains the address; any remote failure.
    pub async fn reserve_interface(&self, address: Ipv4Addr) -> Result<NetworkInterface> {
        let ip = address.to_string();
        let filters = [
            Filter::vpc(&self.vpc_id),
            Filter::new("private-ip-address", [ip.clone()]),
        ];
        let existing = self
            .remote
            .call_paged("DescribeNetworkInterfaces", |api, token| {
                api.describe_network_interfaces(&filters, token)
            })
            .await?;
        if let Some(interface) = existing.into_iter().next() {
            debug!(address = %ip, network_interface_id = %interface.network_interface_id, "Address already reserved");
            return Ok(interface);
        }

        let subnet = self.subnet_by_ip(address).ok_or_else(|| {
            VpcError::Config(format!(
                "no subnet of {} contains {ip}",
                self.resource_name(None)
            ))
        })?;
        let description = format!("{} reserved", self.resource_name(None));
        let interface = self
            .remote
            .call("CreateNetworkInterface", |api| {
                api.create_network_interface(&subnet.subnet_id, &ip, &description)
            })
            .await?;

        info!(address = %ip, network_interface_id = %interface.network_interface_id, "Reserved address");
        Ok(interface)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ec2::{Ec2Api, InMemoryEc2};

    async fn environment(api: &Arc<InMemoryEc2>) -> Environment {
        let vpc = api.create_vpc("10.0.0.0/16").await.unwrap();
        Environment {
            name: "ci".into(),
            env_type: "sandbox".into(),
            vpc_id: vpc.vpc_id,
            cidr: "10.0.0.0/16".parse().unwrap(),
            created_at: None,
            tags: BTreeMap::new(),
        }
    }

    fn zones() -> Vec<String> {
        vec!["us-east-1a".into(), "us-east-1b".into(), "us-east-1c".into()]
    }

    async fn create(api: &Arc<InMemoryEc2>, env: &Environment, name: &str, cidr: &str) -> MetaNetwork {
        let mut network = MetaNetwork::new(Remote::new(api.clone()), env, name, cidr.parse().unwrap());
        network.create(&zones()).await.unwrap();
        network
    }

    async fn created(api: &Arc<InMemoryEc2>) -> (Environment, MetaNetwork) {
        let env = environment(api).await;
        let network = create(api, &env, "intranet", "10.0.0.0/18").await;
        (env, network)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_reload() {
        let api = Arc::new(InMemoryEc2::new());
        let (env, network) = created(&api).await;

        assert_eq!(network.state(), MetaNetworkState::RouteTableBound);
        let blocks: Vec<&str> = network.subnets().iter().map(|s| s.cidr_block.as_str()).collect();
        assert_eq!(blocks, vec!["10.0.0.0/20", "10.0.16.0/20", "10.0.32.0/20"]);

        let tables = network.route_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].associations.len(), 3);

        let loaded = MetaNetwork::load_all(&Remote::new(api.clone()), &env)
            .await
            .unwrap();
        let intranet = &loaded["intranet"];
        assert_eq!(intranet.cidr(), network.cidr());
        assert_eq!(intranet.subnets().len(), 3);
        assert_eq!(intranet.subnets()[1].tag("Name"), Some("ci_intranet_us-east-1b"));
        assert_eq!(intranet.state(), MetaNetworkState::RouteTableBound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_upsert_keeps_one_entry() {
        let api = Arc::new(InMemoryEc2::new());
        let (_env, network) = created(&api).await;
        let peer_vpc = api.create_vpc("10.1.0.0/16").await.unwrap();
        let first = api
            .create_vpc_peering_connection(&network.vpc_id, &peer_vpc.vpc_id)
            .await
            .unwrap();
        let second = api
            .create_vpc_peering_connection(&network.vpc_id, &peer_vpc.vpc_id)
            .await
            .unwrap();

        assert!(network
            .create_peering_route(&first.vpc_peering_connection_id, "10.1.0.0/18")
            .await
            .unwrap());
        assert!(network
            .create_peering_route(&second.vpc_peering_connection_id, "10.1.0.0/18")
            .await
            .unwrap());
        assert!(!network
            .create_peering_route(&second.vpc_peering_connection_id, "10.1.0.0/18")
            .await
            .unwrap());

        let tables = network.route_tables().await.unwrap();
        let routes: Vec<&Route> = tables[0]
            .routes
            .iter()
            .filter(|r| r.destination_cidr_block == "10.1.0.0/18")
            .collect();
        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes[0].target,
            RouteTarget::Peering(second.vpc_peering_connection_id.clone())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nat_gateways_with_dynamic_addresses() {
        let api = Arc::new(InMemoryEc2::new());
        let (_env, mut network) = created(&api).await;

        let err = network.add_nat_gateways(&[None]).await.unwrap_err();
        assert!(matches!(err, VpcError::Config(_)));

        network.add_nat_gateways(&[None, None, None]).await.unwrap();
        assert_eq!(network.state(), MetaNetworkState::NatConfigured);
        let gateways = network.nat_gateways().await.unwrap();
        assert_eq!(gateways.len(), 3);
        assert!(gateways.iter().all(|n| n.state == "available"));

        // a second pass finds every subnet covered
        api.clear_journal();
        network.add_nat_gateways(&[None, None, None]).await.unwrap();
        assert!(api.journal().is_empty());

        network.delete_nat_gateways().await.unwrap();
        assert!(network.nat_gateways().await.unwrap().is_empty());
        let released = api
            .operations()
            .iter()
            .filter(|op| *op == "ReleaseAddress")
            .count();
        assert_eq!(released, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nat_route_splits_shared_table() {
        let api = Arc::new(InMemoryEc2::new());
        let (env, intranet) = created(&api).await;
        let mut dmz = create(&api, &env, "dmz", "10.0.64.0/18").await;
        dmz.add_nat_gateways(&[None, None, None]).await.unwrap();

        intranet.add_nat_gateway_route(&dmz).await.unwrap();

        let tables = intranet.route_tables().await.unwrap();
        assert_eq!(tables.len(), 3);
        for table in &tables {
            assert_eq!(table.associations.len(), 1);
            assert!(matches!(
                table.route_to(DEFAULT_ROUTE).map(|r| &r.target),
                Some(RouteTarget::NatGateway(_))
            ));
        }

        intranet.delete_nat_gateway_route().await.unwrap();
        let tables = intranet.route_tables().await.unwrap();
        assert!(tables.iter().all(|t| t.route_to(DEFAULT_ROUTE).is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offsets_and_reservation() {
        let api = Arc::new(InMemoryEc2::new());
        let (_env, network) = created(&api).await;

        assert_eq!(network.ip_by_offset("+10").unwrap(), Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(network.ip_by_offset("-1").unwrap(), Ipv4Addr::new(10, 0, 63, 254));
        assert_eq!(network.ip_by_offset("10.0.16.5").unwrap(), Ipv4Addr::new(10, 0, 16, 5));
        assert!(network.ip_by_offset("+70000").is_err());
        assert!(network.ip_by_offset("10.9.0.1").is_err());

        let address = network.ip_by_offset("+10").unwrap();
        let first = network.reserve_interface(address).await.unwrap();
        let again = network.reserve_interface(address).await.unwrap();
        assert_eq!(first.network_interface_id, again.network_interface_id);
        assert_eq!(first.subnet_id, network.subnets()[0].subnet_id);

        // the last zone's subnet ends before the block's broadcast address
        let beyond = network.ip_by_offset("-1").unwrap();
        assert!(network.reserve_interface(beyond).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_security_group_rules_diff() {
        let api = Arc::new(InMemoryEc2::new());
        let (_env, mut network) = created(&api).await;
        let err = network.update_sg_rules(&[], false).await.unwrap_err();
        assert!(matches!(err, VpcError::Config(_)));

        network.bind_security_group("test").await.unwrap();
        let rule = SecurityRule {
            ip_protocol: "tcp".into(),
            from_port: 22,
            to_port: 22,
            source: crate::ec2::RuleSource::Cidr("10.0.0.0/16".into()),
        };

        let dry = network.update_sg_rules(&[rule.clone()], true).await.unwrap();
        assert_eq!(dry.added.len(), 1);
        assert!(api.operations().iter().all(|op| op != "AuthorizeSecurityGroupIngress"));

        let applied = network.update_sg_rules(&[rule.clone()], false).await.unwrap();
        assert_eq!(applied.added, vec![rule]);
        assert_eq!(network.state(), MetaNetworkState::Active);
        assert!(network.update_sg_rules(&applied.added, false).await.unwrap().is_empty());

        let removed = network.update_sg_rules(&[], false).await.unwrap();
        assert_eq!(removed.removed.len(), 1);
    }
}
