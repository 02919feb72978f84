//! Environment lifecycle.
//!
//! An environment is a VPC tagged `Name=<env>` and `type=<envtype>`. It is
//! built in dependency order and torn down in the inverse order; both paths
//! recompute everything from live remote state, so either can be re-run after
//! a partial failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::allocator::{allocate, allocate_siblings};
use crate::collaborators::Collaborators;
use crate::config::{network_spec, EnvConfig, VpcConfig};
use crate::dhcp::{
    associated_dhcp_options_id, delete_owned_dhcp_options, desired_dhcp_configurations,
    update_dhcp_options,
};
use crate::ec2::{tags_to_map, Filter, Tag, Tagged, Vpc, VpcAttribute};
use crate::error::{Result, VpcError};
use crate::gateways::{
    attach_vpn_gateway, create_internet_gateway, destroy_gateways, find_internet_gateway,
    find_vpn_gateway, update_gateway_routes, update_nat_gateways_and_routes, GatewayIds,
};
use crate::metanetwork::{MetaNetwork, RuleDiff};
use crate::peering::{PeeringResolver, ReconcileReport};
use crate::remote::{tolerate_missing, Remote, DEFAULT_TIMEOUT};
use crate::sg_rules::{destroy_security_groups, update_meta_network_sg_rules};

/// Character that joins environment and network names in derived resource names.
pub const RESERVED_DELIMITER: char = '_';

const NAME_TAG: &str = "Name";
const TYPE_TAG: &str = "type";
const CREATE_DATE_TAG: &str = "create_date";

/// A live environment, read from its VPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub env_type: String,
    pub vpc_id: String,
    pub cidr: Ipv4Net,
    pub created_at: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
}

fn parse_create_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // older environments were tagged with a naive UTC timestamp
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| n.and_utc())
        })
}

impl Environment {
    /// Read an environment from a VPC; `None` unless it carries both the
    /// `Name` and `type` tags.
    #[must_use]
    pub fn from_vpc(vpc: &Vpc) -> Option<Self> {
        let name = vpc.tag(NAME_TAG)?;
        let env_type = vpc.tag(TYPE_TAG)?;
        let Ok(cidr) = vpc.cidr_block.parse() else {
            warn!(vpc_id = %vpc.vpc_id, cidr = %vpc.cidr_block, "VPC block is not an IPv4 CIDR");
            return None;
        };
        Some(Self {
            name: name.to_string(),
            env_type: env_type.to_string(),
            vpc_id: vpc.vpc_id.clone(),
            cidr,
            created_at: vpc.tag(CREATE_DATE_TAG).and_then(parse_create_date),
            tags: tags_to_map(&vpc.tags),
        })
    }
}

/// Every live environment.
///
/// # Errors
/// Any remote failure.
pub async fn list_environments(remote: &Remote) -> Result<Vec<Environment>> {
    let vpcs = remote
        .call_paged("DescribeVpcs", |api, token| api.describe_vpcs(&[], token))
        .await?;
    Ok(vpcs.iter().filter_map(Environment::from_vpc).collect())
}

/// One line of `list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: String,
    pub vpc_id: String,
    pub cidr: Ipv4Net,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Environment> for EnvironmentSummary {
    fn from(environment: &Environment) -> Self {
        Self {
            name: environment.name.clone(),
            env_type: environment.env_type.clone(),
            vpc_id: environment.vpc_id.clone(),
            cidr: environment.cidr,
            created_at: environment.created_at,
        }
    }
}

/// What to do when several live environments share a name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Refuse with [`VpcError::DuplicateEnvironment`].
    #[default]
    Fail,
    /// Use the one with the newest `create_date`.
    MostRecent,
}

/// Pick one environment out of those sharing a name.
///
/// # Errors
/// `DuplicateEnvironment` under [`DuplicatePolicy::Fail`] when more than one matches.
pub fn select_environment(
    name: &str,
    mut matches: Vec<Environment>,
    policy: DuplicatePolicy,
) -> Result<Option<Environment>> {
    if matches.len() <= 1 {
        return Ok(matches.pop());
    }
    match policy {
        DuplicatePolicy::Fail => Err(VpcError::DuplicateEnvironment {
            name: name.to_string(),
            count: matches.len(),
        }),
        DuplicatePolicy::MostRecent => {
            warn!(name, count = matches.len(), "Several environments share a name, using the newest");
            Ok(matches.into_iter().max_by_key(|e| e.created_at))
        }
    }
}

/// Options for [`EnvironmentLifecycle::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Extra tags for the VPC.
    pub tags: BTreeMap<String, String>,
    /// Do not pre-create interfaces for `{net}_reserved_ips`.
    pub skip_interface_reservation: bool,
}

/// What an update changed (or, on a dry run, would change).
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub dhcp_options_replaced: bool,
    pub security_group_rules: BTreeMap<String, RuleDiff>,
    pub peerings: ReconcileReport,
}

/// Creates, reconciles and destroys environments.
#[derive(Debug, Clone)]
pub struct EnvironmentLifecycle {
    remote: Remote,
    config: Arc<VpcConfig>,
    collaborators: Collaborators,
    duplicate_policy: DuplicatePolicy,
}

impl EnvironmentLifecycle {
    pub fn new(remote: Remote, config: Arc<VpcConfig>) -> Self {
        Self {
            remote,
            config,
            collaborators: Collaborators::default(),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    #[must_use]
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    #[must_use]
    pub fn peering_resolver(&self) -> PeeringResolver {
        PeeringResolver::new(self.remote.clone(), self.config.clone())
    }

    /// Summaries of every live environment, sorted by name.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn list(&self) -> Result<Vec<EnvironmentSummary>> {
        let mut environments = list_environments(&self.remote).await?;
        environments.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(environments.iter().map(EnvironmentSummary::from).collect())
    }

    /// Look an environment up by name or by `vpc-` id.
    ///
    /// # Errors
    /// `DuplicateEnvironment` per the duplicate policy; any remote failure.
    pub async fn fetch(&self, name_or_id: &str) -> Result<Option<Environment>> {
        let environments = list_environments(&self.remote).await?;
        if name_or_id.starts_with("vpc-") {
            return Ok(environments.into_iter().find(|e| e.vpc_id == name_or_id));
        }
        let matches = environments
            .into_iter()
            .filter(|e| e.name == name_or_id)
            .collect();
        select_environment(name_or_id, matches, self.duplicate_policy)
    }

    async fn require(&self, name_or_id: &str) -> Result<Environment> {
        self.fetch(name_or_id)
            .await?
            .ok_or_else(|| VpcError::EnvironmentNotFound(name_or_id.to_string()))
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Build a new environment end to end.
    ///
    /// # Errors
    /// `Config` for an invalid name, an unknown type, an existing environment
    /// of the same name or no configured meta-networks;
    /// `AddressSpaceExhausted` if no block is free; any remote or
    /// collaborator failure aborts the remaining steps.
    pub async fn create(
        &self,
        name: &str,
        env_type: &str,
        options: CreateOptions,
    ) -> Result<Environment> {
        if name.is_empty() || name.contains(RESERVED_DELIMITER) {
            return Err(VpcError::Config(format!(
                "environment name '{name}' must be non-empty and must not contain '{RESERVED_DELIMITER}'"
            )));
        }
        if !self.config.has_env_type(env_type) {
            return Err(VpcError::Config(format!(
                "unknown environment type '{env_type}'"
            )));
        }
        let config = self.config.for_environment(name, env_type);
        let network_settings = config.network_cidrs()?;
        if network_settings.is_empty() {
            return Err(VpcError::Config(format!(
                "no meta-networks configured for environment '{name}' of type '{env_type}'"
            )));
        }

        let live = list_environments(&self.remote).await?;
        if live.iter().any(|e| e.name == name) {
            return Err(VpcError::Config(format!("environment '{name}' already exists")));
        }

        let cidr = match config.vpc_cidr()? {
            Some(cidr) => cidr,
            None => {
                let (space, prefix_len) = config.ip_space()?;
                let occupied = live.iter().map(|e| e.cidr).collect();
                allocate(name, space, prefix_len, occupied)?.block
            }
        };
        let blocks = allocate_siblings(name, cidr, &network_settings)?;
        info!(environment = name, env_type, %cidr, "Creating environment");

        let environment = self.create_vpc(name, env_type, cidr, &options).await?;
        let zones = self
            .remote
            .call("DescribeAvailabilityZones", |api| {
                api.describe_availability_zones()
            })
            .await?;

        let mut networks = BTreeMap::new();
        for (network_name, block) in blocks {
            let mut network =
                MetaNetwork::new(self.remote.clone(), &environment, &network_name, block);
            network.create(&zones).await?;
            networks.insert(network_name, network);
        }

        if options.skip_interface_reservation {
            debug!(environment = name, "Skipping interface reservation");
        } else {
            self.reserve_interfaces(&config, &networks).await?;
        }

        let desired = desired_dhcp_configurations(&config, &networks).await?;
        update_dhcp_options(&self.remote, &environment, &desired, false).await?;

        let internet = create_internet_gateway(&self.remote, &environment).await?;
        let vpn = attach_vpn_gateway(&self.remote, &environment).await?;
        let gateways = GatewayIds {
            internet: Some(internet.internet_gateway_id),
            vpn: vpn.map(|g| g.vpn_gateway_id),
        };
        update_gateway_routes(&self.remote, &config, &networks, &gateways, false).await?;
        update_nat_gateways_and_routes(&self.remote, &config, &mut networks, false).await?;

        self.bind_security_groups(&mut networks).await?;
        update_meta_network_sg_rules(&config, cidr, &mut networks, false).await?;

        self.collaborators.create_all(&environment).await?;

        let report = self
            .peering_resolver()
            .reconcile(Some(&environment), false)
            .await?;
        info!(
            environment = name,
            vpc_id = %environment.vpc_id,
            peerings = report.created.len(),
            "Environment created"
        );
        Ok(environment)
    }

    async fn create_vpc(
        &self,
        name: &str,
        env_type: &str,
        cidr: Ipv4Net,
        options: &CreateOptions,
    ) -> Result<Environment> {
        let cidr_block = cidr.to_string();
        let vpc = self
            .remote
            .call("CreateVpc", |api| api.create_vpc(&cidr_block))
            .await?;

        let filters = [Filter::vpc(&vpc.vpc_id)];
        let filters = &filters[..];
        self.remote
            .wait_for_state(
                "VPC",
                |api| async move { api.describe_vpcs(filters, None).await.map(|page| page.items) },
                |v: &Vpc| v.state.as_str(),
                "available",
                DEFAULT_TIMEOUT,
            )
            .await?;

        let created_at = Utc::now();
        let mut tags = vec![
            Tag::new(NAME_TAG, name),
            Tag::new(TYPE_TAG, env_type),
            Tag::new(
                CREATE_DATE_TAG,
                created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        ];
        tags.extend(options.tags.iter().map(|(k, v)| Tag::new(k, v)));
        let ids = [vpc.vpc_id.clone()];
        self.remote
            .keep_trying("CreateTags", DEFAULT_TIMEOUT, |api| {
                api.create_tags(&ids, &tags)
            })
            .await?;

        for attribute in [VpcAttribute::EnableDnsSupport, VpcAttribute::EnableDnsHostnames] {
            self.remote
                .call("ModifyVpcAttribute", |api| {
                    api.modify_vpc_attribute(&vpc.vpc_id, attribute, true)
                })
                .await?;
        }

        info!(vpc_id = %vpc.vpc_id, %cidr, "Created VPC");
        Ok(Environment {
            name: name.to_string(),
            env_type: env_type.to_string(),
            vpc_id: vpc.vpc_id,
            cidr,
            created_at: Some(created_at),
            tags: tags_to_map(&tags),
        })
    }

    async fn reserve_interfaces(
        &self,
        config: &EnvConfig<'_>,
        networks: &BTreeMap<String, MetaNetwork>,
    ) -> Result<()> {
        for (name, network) in networks {
            for entry in config.reserved_ips(name) {
                match network.ip_by_offset(&entry) {
                    Ok(address) => {
                        network.reserve_interface(address).await?;
                    }
                    Err(VpcError::Config(reason)) => {
                        warn!(network = %name, entry = %entry, %reason, "Skipping reserved address");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    async fn bind_security_groups(&self, networks: &mut BTreeMap<String, MetaNetwork>) -> Result<()> {
        for (name, network) in networks.iter_mut() {
            let description = network_spec(name).map_or("", |spec| spec.description);
            network.bind_security_group(description).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Reconcile an existing environment against configuration. The address
    /// block is never changed. A dry run only logs what would change.
    ///
    /// # Errors
    /// `EnvironmentNotFound`; `Config` for bad configuration; any remote failure.
    pub async fn update(&self, name_or_id: &str, dry_run: bool) -> Result<UpdateReport> {
        let environment = self.require(name_or_id).await?;
        let config = self
            .config
            .for_environment(&environment.name, &environment.env_type);
        let mut networks = MetaNetwork::load_all(&self.remote, &environment).await?;
        info!(environment = %environment.name, vpc_id = %environment.vpc_id, dry_run, "Updating environment");

        let desired = desired_dhcp_configurations(&config, &networks).await?;
        let dhcp_options_replaced =
            update_dhcp_options(&self.remote, &environment, &desired, dry_run).await?;

        if !dry_run {
            self.bind_security_groups(&mut networks).await?;
        }
        let security_group_rules =
            update_meta_network_sg_rules(&config, environment.cidr, &mut networks, dry_run).await?;

        let internet = find_internet_gateway(&self.remote, &environment.vpc_id).await?;
        let vpn = if dry_run {
            find_vpn_gateway(&self.remote, &environment.name)
                .await?
                .filter(|g| g.attached_vpc() == Some(environment.vpc_id.as_str()))
        } else {
            attach_vpn_gateway(&self.remote, &environment).await?
        };
        let gateways = GatewayIds {
            internet: internet.map(|g| g.internet_gateway_id),
            vpn: vpn.map(|g| g.vpn_gateway_id),
        };
        update_gateway_routes(&self.remote, &config, &networks, &gateways, dry_run).await?;
        update_nat_gateways_and_routes(&self.remote, &config, &mut networks, dry_run).await?;

        let peerings = self
            .peering_resolver()
            .reconcile(Some(&environment), dry_run)
            .await?;

        Ok(UpdateReport {
            dhcp_options_replaced,
            security_group_rules,
            peerings,
        })
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    /// Tear an environment down in inverse dependency order. Destroying an
    /// environment that does not exist is a no-op.
    ///
    /// # Errors
    /// Any collaborator or remote failure other than a resource already being
    /// gone; the remaining steps are not attempted.
    pub async fn destroy(&self, name_or_id: &str) -> Result<()> {
        let Some(environment) = self.fetch(name_or_id).await? else {
            warn!(environment = name_or_id, "Environment not found, nothing to destroy");
            return Ok(());
        };
        let vpc_id = environment.vpc_id.as_str();
        info!(environment = %environment.name, vpc_id, "Destroying environment");

        self.collaborators.destroy_all(&environment).await?;
        self.destroy_interfaces(vpc_id).await?;
        self.peering_resolver().delete_peerings(vpc_id).await?;

        let networks = MetaNetwork::load_all(&self.remote, &environment).await?;
        for mut network in networks.into_values() {
            network.delete_nat_gateways().await?;
        }

        self.destroy_subnets(vpc_id).await?;
        destroy_security_groups(&self.remote, vpc_id).await?;
        destroy_gateways(&self.remote, &environment).await?;
        self.destroy_route_tables(vpc_id).await?;

        let dhcp_options_id = associated_dhcp_options_id(&self.remote, vpc_id).await?;
        let result = self
            .remote
            .call("DeleteVpc", |api| api.delete_vpc(vpc_id))
            .await;
        tolerate_missing(result, "VPC")?;

        if let Some(dhcp_options_id) = dhcp_options_id {
            delete_owned_dhcp_options(&self.remote, &environment.name, &dhcp_options_id).await?;
        }

        info!(environment = %environment.name, vpc_id, "Environment destroyed");
        Ok(())
    }

    async fn destroy_interfaces(&self, vpc_id: &str) -> Result<()> {
        let filters = [Filter::vpc(vpc_id)];
        let interfaces = self
            .remote
            .call_paged("DescribeNetworkInterfaces", |api, token| {
                api.describe_network_interfaces(&filters, token)
            })
            .await?;

        for interface in interfaces {
            let id = interface.network_interface_id.as_str();
            // NAT gateway interfaces go away with their gateway
            if interface.requester_managed {
                debug!(network_interface_id = id, "Skipping requester-managed interface");
                continue;
            }
            debug!(network_interface_id = id, "Deleting network interface");
            if let Some(attachment_id) = &interface.attachment_id {
                let result = self
                    .remote
                    .call("DetachNetworkInterface", |api| {
                        api.detach_network_interface(attachment_id)
                    })
                    .await;
                tolerate_missing(result, "interface attachment")?;
                // detaching completes asynchronously
                self.remote
                    .keep_trying("DeleteNetworkInterface", DEFAULT_TIMEOUT, |api| {
                        api.delete_network_interface(id)
                    })
                    .await?;
            } else {
                let result = self
                    .remote
                    .call("DeleteNetworkInterface", |api| {
                        api.delete_network_interface(id)
                    })
                    .await;
                tolerate_missing(result, "network interface")?;
            }
        }
        Ok(())
    }

    async fn destroy_subnets(&self, vpc_id: &str) -> Result<()> {
        let filters = [Filter::vpc(vpc_id)];
        let subnets = self
            .remote
            .call_paged("DescribeSubnets", |api, token| {
                api.describe_subnets(&filters, token)
            })
            .await?;
        for subnet in subnets {
            debug!(subnet_id = %subnet.subnet_id, "Deleting subnet");
            let result = self
                .remote
                .call("DeleteSubnet", |api| api.delete_subnet(&subnet.subnet_id))
                .await;
            tolerate_missing(result, "subnet")?;
        }
        Ok(())
    }

    async fn destroy_route_tables(&self, vpc_id: &str) -> Result<()> {
        let filters = [Filter::vpc(vpc_id)];
        let tables = self
            .remote
            .call_paged("DescribeRouteTables", |api, token| {
                api.describe_route_tables(&filters, token)
            })
            .await?;

        for table in tables.iter().filter(|t| !t.is_main()) {
            for association in &table.associations {
                let result = self
                    .remote
                    .call("DisassociateRouteTable", |api| {
                        api.disassociate_route_table(&association.route_table_association_id)
                    })
                    .await;
                tolerate_missing(result, "route table association")?;
            }
            debug!(route_table_id = %table.route_table_id, "Deleting route table");
            let result = self
                .remote
                .call("DeleteRouteTable", |api| {
                    api.delete_route_table(&table.route_table_id)
                })
                .await;
            tolerate_missing(result, "route table")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpc(tags: &[(&str, &str)]) -> Vpc {
        Vpc {
            vpc_id: "vpc-00000001".into(),
            cidr_block: "10.0.0.0/20".into(),
            state: "available".into(),
            dhcp_options_id: None,
            tags: tags.iter().map(|(k, v)| Tag::new(*k, *v)).collect(),
        }
    }

    fn named(name: &str, created: Option<&str>) -> Environment {
        Environment {
            name: name.into(),
            env_type: "sandbox".into(),
            vpc_id: format!("vpc-{name}"),
            cidr: "10.0.0.0/20".parse().unwrap(),
            created_at: created.and_then(parse_create_date),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_environment_from_vpc() {
        let env = Environment::from_vpc(&vpc(&[
            ("Name", "ci"),
            ("type", "sandbox"),
            ("create_date", "2024-03-01T12:30:00Z"),
        ]))
        .unwrap();
        assert_eq!(env.name, "ci");
        assert_eq!(env.env_type, "sandbox");
        assert_eq!(env.cidr.to_string(), "10.0.0.0/20");
        assert_eq!(env.created_at.unwrap().to_rfc3339(), "2024-03-01T12:30:00+00:00");

        assert!(Environment::from_vpc(&vpc(&[("Name", "ci")])).is_none());
        assert!(Environment::from_vpc(&vpc(&[])).is_none());
    }

    #[test]
    fn test_naive_create_date() {
        let parsed = parse_create_date("2017-06-02T19:04:11.123456").unwrap();
        assert_eq!(parsed.timestamp(), 1_496_430_251);
        assert!(parse_create_date("yesterday").is_none());
    }

    #[test]
    fn test_duplicate_policy() {
        let dupes = vec![
            named("ci", Some("2024-01-01T00:00:00Z")),
            named("ci", Some("2024-06-01T00:00:00Z")),
        ];

        let err = select_environment("ci", dupes.clone(), DuplicatePolicy::Fail).unwrap_err();
        assert!(matches!(err, VpcError::DuplicateEnvironment { count: 2, .. }));

        let newest = select_environment("ci", dupes, DuplicatePolicy::MostRecent)
            .unwrap()
            .unwrap();
        assert_eq!(
            newest.created_at,
            parse_create_date("2024-06-01T00:00:00Z")
        );

        assert!(select_environment("ci", Vec::new(), DuplicatePolicy::Fail)
            .unwrap()
            .is_none());
    }
}
