//! Internet, VPN and NAT gateway wiring for an environment.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{EnvConfig, GatewayKind, NatSetting};
use crate::ec2::{
    Filter, GatewayAttachment, InternetGateway, RouteTarget, Tag, Tagged, VpnGateway,
    DEFAULT_ROUTE,
};
use crate::error::{Result, VpcError};
use crate::lifecycle::Environment;
use crate::metanetwork::MetaNetwork;
use crate::remote::{tolerate_missing, Remote, DEFAULT_TIMEOUT};

const VGW_ATTACH_TIMEOUT: Duration = Duration::from_secs(600);

/// Gateways an environment's routes may point at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayIds {
    pub internet: Option<String>,
    pub vpn: Option<String>,
}

impl GatewayIds {
    fn get(&self, kind: GatewayKind) -> Option<&str> {
        match kind {
            GatewayKind::Internet => self.internet.as_deref(),
            GatewayKind::Vpn => self.vpn.as_deref(),
        }
    }
}

// ============================================================================
// Internet and VPN gateways
// ============================================================================

/// Create an internet gateway and attach it to the environment.
///
/// # Errors
/// Any remote failure.
pub async fn create_internet_gateway(
    remote: &Remote,
    environment: &Environment,
) -> Result<InternetGateway> {
    let gateway = remote
        .call("CreateInternetGateway", |api| api.create_internet_gateway())
        .await?;
    let ids = [gateway.internet_gateway_id.clone()];
    let tags = [Tag::new("Name", &environment.name)];
    remote
        .keep_trying("CreateTags", DEFAULT_TIMEOUT, |api| {
            api.create_tags(&ids, &tags)
        })
        .await?;
    remote
        .call("AttachInternetGateway", |api| {
            api.attach_internet_gateway(&gateway.internet_gateway_id, &environment.vpc_id)
        })
        .await?;

    info!(
        internet_gateway_id = %gateway.internet_gateway_id,
        vpc_id = %environment.vpc_id,
        "Attached internet gateway"
    );
    Ok(gateway)
}

/// The internet gateway attached to `vpc_id`, if any.
///
/// # Errors
/// Any remote failure.
pub async fn find_internet_gateway(remote: &Remote, vpc_id: &str) -> Result<Option<InternetGateway>> {
    let filters = [Filter::new("attachment.vpc-id", [vpc_id])];
    let gateways = remote
        .call("DescribeInternetGateways", |api| {
            api.describe_internet_gateways(&filters)
        })
        .await?;
    if gateways.is_empty() {
        warn!(vpc_id, "No internet gateway attached");
    }
    Ok(gateways.into_iter().next())
}

/// The VPN gateway reserved for an environment (tagged with its name).
///
/// # Errors
/// Any remote failure.
pub async fn find_vpn_gateway(remote: &Remote, environment_name: &str) -> Result<Option<VpnGateway>> {
    let filters = [Filter::tag("Name", environment_name)];
    let gateways = remote
        .call("DescribeVpnGateways", |api| api.describe_vpn_gateways(&filters))
        .await?;
    Ok(gateways.into_iter().next())
}

async fn wait_for_vgw_attachment(
    remote: &Remote,
    gateway_id: &str,
    vpc_id: &str,
    expected: &str,
) -> Result<()> {
    let filters = [Filter::new("vpn-gateway-id", [gateway_id])];
    let filters = &filters[..];
    remote
        .wait_for_state(
            "VPN gateway attachment",
            |api| async move {
                api.describe_vpn_gateways(filters).await.map(|gateways| {
                    gateways
                        .into_iter()
                        .flat_map(|g| g.attachments)
                        .filter(|a| a.vpc_id == vpc_id)
                        .collect::<Vec<_>>()
                })
            },
            |a: &GatewayAttachment| a.state.as_str(),
            expected,
            VGW_ATTACH_TIMEOUT,
        )
        .await?;
    Ok(())
}

/// Detach the environment's VPN gateway from wherever it is, then attach it
/// here. Returns `None` when no gateway is reserved for the environment.
///
/// # Errors
/// Any remote failure, or the attachment not settling in time.
pub async fn attach_vpn_gateway(
    remote: &Remote,
    environment: &Environment,
) -> Result<Option<VpnGateway>> {
    let Some(gateway) = find_vpn_gateway(remote, &environment.name).await? else {
        debug!(environment = %environment.name, "No VPN gateway to attach");
        return Ok(None);
    };

    match gateway.attached_vpc() {
        Some(vpc_id) if vpc_id == environment.vpc_id => return Ok(Some(gateway)),
        Some(vpc_id) => {
            info!(
                vpn_gateway_id = %gateway.vpn_gateway_id,
                from = vpc_id,
                to = %environment.vpc_id,
                "Moving VPN gateway"
            );
            remote
                .call("DetachVpnGateway", |api| {
                    api.detach_vpn_gateway(&gateway.vpn_gateway_id, vpc_id)
                })
                .await?;
            wait_for_vgw_attachment(remote, &gateway.vpn_gateway_id, vpc_id, "detached").await?;
        }
        None => {}
    }

    remote
        .call("AttachVpnGateway", |api| {
            api.attach_vpn_gateway(&gateway.vpn_gateway_id, &environment.vpc_id)
        })
        .await?;
    wait_for_vgw_attachment(
        remote,
        &gateway.vpn_gateway_id,
        &environment.vpc_id,
        "attached",
    )
    .await?;

    info!(vpn_gateway_id = %gateway.vpn_gateway_id, vpc_id = %environment.vpc_id, "Attached VPN gateway");
    Ok(Some(gateway))
}

/// Make each network's routes to the internet and VPN gateways match
/// `{net}_igw_routes` / `{net}_vgw_routes`.
///
/// # Errors
/// Any remote failure.
pub async fn update_gateway_routes(
    remote: &Remote,
    config: &EnvConfig<'_>,
    networks: &BTreeMap<String, MetaNetwork>,
    gateways: &GatewayIds,
    dry_run: bool,
) -> Result<()> {
    for (name, network) in networks {
        for kind in [GatewayKind::Internet, GatewayKind::Vpn] {
            let desired = config.gateway_routes(name, kind);
            let Some(gateway_id) = gateways.get(kind) else {
                if !desired.is_empty() {
                    warn!(network = %name, ?kind, "Routes configured but no gateway present");
                }
                continue;
            };
            let target = RouteTarget::Gateway(gateway_id.to_string());

            for table in network.route_tables().await? {
                let stale = table
                    .routes
                    .iter()
                    .filter(|r| r.target == target && !desired.contains(&r.destination_cidr_block));
                for route in stale {
                    info!(
                        route_table_id = %table.route_table_id,
                        destination = %route.destination_cidr_block,
                        dry_run,
                        "Removing gateway route"
                    );
                    if !dry_run {
                        let result = remote
                            .call("DeleteRoute", |api| {
                                api.delete_route(&table.route_table_id, &route.destination_cidr_block)
                            })
                            .await;
                        tolerate_missing(result, "route")?;
                    }
                }
            }

            for destination in &desired {
                if dry_run {
                    info!(network = %name, destination = %destination, target = %target, "Would route via gateway");
                } else {
                    network
                        .replace_or_create_route(destination, target.clone())
                        .await?;
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// NAT gateways
// ============================================================================

/// Allocation ids for a network's NAT gateways, one entry per zone.
///
/// # Errors
/// `Config` if a configured public IP is not an elastic address of the account.
pub async fn nat_allocation_ids(
    remote: &Remote,
    setting: &NatSetting,
    zone_count: usize,
) -> Result<Vec<Option<String>>> {
    let ips = match setting {
        NatSetting::Auto => return Ok(vec![None; zone_count]),
        NatSetting::Static(ips) => ips,
    };

    let filters = [Filter::new("public-ip", ips.iter().cloned())];
    let addresses = remote
        .call("DescribeAddresses", |api| api.describe_addresses(&filters))
        .await?;

    ips.iter()
        .map(|ip| {
            addresses
                .iter()
                .find(|a| &a.public_ip == ip)
                .map(|a| Some(a.allocation_id.clone()))
                .ok_or_else(|| VpcError::Config(format!("cannot find elastic IP {ip}")))
        })
        .collect()
}

/// `(source, target)` pairs currently routing `0.0.0.0/0` through a NAT
/// gateway of another network.
async fn current_nat_routes(
    networks: &BTreeMap<String, MetaNetwork>,
) -> Result<BTreeSet<(String, String)>> {
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    for (name, network) in networks {
        for gateway in network.nat_gateways().await? {
            owners.insert(gateway.nat_gateway_id, name.clone());
        }
    }

    let mut routes = BTreeSet::new();
    for (name, network) in networks {
        for table in network.route_tables().await? {
            if let Some(RouteTarget::NatGateway(id)) =
                table.route_to(DEFAULT_ROUTE).map(|r| &r.target)
            {
                if let Some(owner) = owners.get(id) {
                    routes.insert((name.clone(), owner.clone()));
                }
            }
        }
    }
    Ok(routes)
}

/// Bring NAT gateways and the default routes through them in line with
/// configuration.
///
/// Stale routes go first, then each network's gateways are created or
/// deleted, then missing routes are installed.
///
/// # Errors
/// `Config` for bad NAT settings or routes naming unknown networks; any
/// remote failure.
pub async fn update_nat_gateways_and_routes(
    remote: &Remote,
    config: &EnvConfig<'_>,
    networks: &mut BTreeMap<String, MetaNetwork>,
    dry_run: bool,
) -> Result<()> {
    let desired: BTreeSet<(String, String)> = config.nat_gateway_routes()?.into_iter().collect();
    for (source, target) in &desired {
        for name in [source, target] {
            if !networks.contains_key(name) {
                return Err(VpcError::Config(format!(
                    "nat_gateway_routes names unknown meta-network '{name}'"
                )));
            }
        }
    }

    let current = current_nat_routes(networks).await?;
    let stale: Vec<_> = current.difference(&desired).cloned().collect();
    let missing: Vec<_> = desired.difference(&current).cloned().collect();
    info!(?stale, ?missing, dry_run, "NAT gateway routes (source, target)");

    if !dry_run {
        for (source, _) in &stale {
            if let Some(network) = networks.get(source) {
                network.delete_nat_gateway_route().await?;
            }
        }
    }

    for (name, network) in networks.iter_mut() {
        match config.nat_gateways(name) {
            Some(setting) => {
                let allocation_ids =
                    nat_allocation_ids(remote, &setting, network.subnets().len()).await?;
                debug!(network = %name, ?allocation_ids, dry_run, "NAT gateway addresses");
                if !dry_run {
                    network.add_nat_gateways(&allocation_ids).await?;
                }
            }
            None => {
                debug!(network = %name, dry_run, "Removing NAT gateways if any");
                if !dry_run {
                    network.delete_nat_gateways().await?;
                    network.mark_no_nat();
                }
            }
        }
    }

    if !dry_run {
        for (source, target) in &missing {
            if let (Some(source), Some(target)) = (networks.get(source), networks.get(target)) {
                source.add_nat_gateway_route(target).await?;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Teardown
// ============================================================================

/// Detach and delete the environment's internet gateways; detach (but keep)
/// its VPN gateways so they can be re-used.
///
/// # Errors
/// Any remote failure other than a gateway already being gone.
pub async fn destroy_gateways(remote: &Remote, environment: &Environment) -> Result<()> {
    let vpc_id = environment.vpc_id.as_str();
    let filters = [Filter::new("attachment.vpc-id", [vpc_id])];

    let internet = remote
        .call("DescribeInternetGateways", |api| {
            api.describe_internet_gateways(&filters)
        })
        .await?;
    for gateway in internet {
        info!(internet_gateway_id = %gateway.internet_gateway_id, "Deleting internet gateway");
        let result = remote
            .call("DetachInternetGateway", |api| {
                api.detach_internet_gateway(&gateway.internet_gateway_id, vpc_id)
            })
            .await;
        tolerate_missing(result, "internet gateway attachment")?;
        let result = remote
            .call("DeleteInternetGateway", |api| {
                api.delete_internet_gateway(&gateway.internet_gateway_id)
            })
            .await;
        tolerate_missing(result, "internet gateway")?;
    }

    let vpn = remote
        .call("DescribeVpnGateways", |api| api.describe_vpn_gateways(&filters))
        .await?;
    for gateway in vpn.iter().filter(|g| g.attached_vpc() == Some(vpc_id)) {
        info!(
            vpn_gateway_id = %gateway.vpn_gateway_id,
            name = gateway.tag("Name").unwrap_or_default(),
            "Detaching VPN gateway"
        );
        let result = remote
            .call("DetachVpnGateway", |api| {
                api.detach_vpn_gateway(&gateway.vpn_gateway_id, vpc_id)
            })
            .await;
        if tolerate_missing(result, "VPN gateway attachment")?.is_some() {
            wait_for_vgw_attachment(remote, &gateway.vpn_gateway_id, vpc_id, "detached").await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ec2::{Ec2Api, InMemoryEc2};

    async fn environment(api: &Arc<InMemoryEc2>, name: &str, cidr: &str) -> Environment {
        let vpc = api.create_vpc(cidr).await.unwrap();
        Environment {
            name: name.into(),
            env_type: "sandbox".into(),
            vpc_id: vpc.vpc_id,
            cidr: cidr.parse().unwrap(),
            created_at: None,
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_vpn_gateway_moves_between_environments() {
        let api = Arc::new(InMemoryEc2::new());
        let remote = Remote::new(api.clone());
        let old = environment(&api, "old", "10.0.0.0/16").await;
        let mut new = environment(&api, "new", "10.1.0.0/16").await;
        let gateway_id = api.add_vpn_gateway("new");
        api.attach_vpn_gateway(&gateway_id, &old.vpc_id).await.unwrap();
        api.clear_journal();

        let gateway = attach_vpn_gateway(&remote, &new).await.unwrap().unwrap();
        assert_eq!(gateway.vpn_gateway_id, gateway_id);
        let now = find_vpn_gateway(&remote, "new").await.unwrap().unwrap();
        assert_eq!(now.attached_vpc(), Some(new.vpc_id.as_str()));
        assert_eq!(
            api.operations(),
            vec!["DetachVpnGateway", "AttachVpnGateway"]
        );

        // no gateway reserved under this name
        new.name = "other".into();
        assert!(attach_vpn_gateway(&remote, &new).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_nat_addresses_are_looked_up() {
        let api = Arc::new(InMemoryEc2::new());
        let remote = Remote::new(api.clone());
        let allocation_id = api.add_address("52.0.0.1");

        let ids = nat_allocation_ids(&remote, &NatSetting::Static(vec!["52.0.0.1".into()]), 1)
            .await
            .unwrap();
        assert_eq!(ids, vec![Some(allocation_id)]);

        let err = nat_allocation_ids(&remote, &NatSetting::Static(vec!["52.0.0.9".into()]), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, VpcError::Config(_)));

        let auto = nat_allocation_ids(&remote, &NatSetting::Auto, 3).await.unwrap();
        assert_eq!(auto, vec![None, None, None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_gateways_keeps_vpn_gateway() {
        let api = Arc::new(InMemoryEc2::new());
        let remote = Remote::new(api.clone());
        let env = environment(&api, "ci", "10.0.0.0/16").await;
        create_internet_gateway(&remote, &env).await.unwrap();
        let vgw = api.add_vpn_gateway("ci");
        api.attach_vpn_gateway(&vgw, &env.vpc_id).await.unwrap();

        destroy_gateways(&remote, &env).await.unwrap();

        assert!(find_internet_gateway(&remote, &env.vpc_id).await.unwrap().is_none());
        let kept = find_vpn_gateway(&remote, "ci").await.unwrap().unwrap();
        assert_eq!(kept.attached_vpc(), None);
        assert!(api.operations().contains(&"DeleteInternetGateway".to_string()));
    }
}
