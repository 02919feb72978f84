//! Environment lifecycle tests against the in-memory EC2.
//!
//! Backoff sleeps run on paused tokio time, so waits complete instantly.

use std::sync::Arc;

use vpc::ec2::{Ec2Api, Filter, InMemoryEc2, RouteTarget, DEFAULT_ROUTE};
use vpc::{
    CreateOptions, EnvironmentLifecycle, MetaNetwork, MetaNetworkState, Remote, VpcConfig,
    VpcError,
};

const CONFIG: &str = r#"
[envtype.sandbox]
ip_space = "10.0.0.0/16"
vpc_cidr_size = 20
intranet_cidr = "auto"
dmz_cidr = "auto"
dmz_nat_gateways = "auto"
nat_gateway_routes = "intranet/dmz"
intranet_sg_rules = "tcp all 0:65535, udp intranet 53"
dmz_sg_rules = "tcp 0.0.0.0/0 80 443"
dmz_igw_routes = "0.0.0.0/0"
intranet_vgw_routes = "192.168.0.0/16"
intranet_reserved_ips = "+10 +100000"
domain_name = "sandbox.example.com"
internal_dns = "10.0.0.2"
external_dns = "8.8.8.8"

[envtype.empty]
ip_space = "10.0.0.0/16"
vpc_cidr_size = 20

[envtype.tiny]
ip_space = "172.16.0.0/20"
vpc_cidr_size = 20
intranet_cidr = "auto"

[peerings]
connection_1 = "*:sandbox/intranet hub:sandbox/intranet"
"#;

fn setup() -> (Arc<InMemoryEc2>, EnvironmentLifecycle) {
    let api = Arc::new(InMemoryEc2::new());
    let config = VpcConfig::from_toml_str(CONFIG).unwrap();
    let lifecycle = EnvironmentLifecycle::new(Remote::new(api.clone()), Arc::new(config));
    (api, lifecycle)
}

fn position(ops: &[String], op: &str) -> Option<usize> {
    ops.iter().position(|o| o == op)
}

fn last_position(ops: &[String], op: &str) -> Option<usize> {
    ops.iter().rposition(|o| o == op)
}

fn count(ops: &[String], op: &str) -> usize {
    ops.iter().filter(|o| *o == op).count()
}

#[tokio::test(start_paused = true)]
async fn test_create_builds_full_environment() {
    let (api, lifecycle) = setup();
    let vgw = api.add_vpn_gateway("ci");

    let env = lifecycle
        .create("ci", "sandbox", CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(env.cidr.prefix_len(), 20);
    assert_eq!(env.tags.get("type").map(String::as_str), Some("sandbox"));

    let fetched = lifecycle.fetch("ci").await.unwrap().unwrap();
    assert_eq!(fetched.vpc_id, env.vpc_id);
    assert_eq!(lifecycle.fetch(&env.vpc_id).await.unwrap().unwrap().name, "ci");

    let remote = Remote::new(api.clone());
    let networks = MetaNetwork::load_all(&remote, &env).await.unwrap();
    assert_eq!(networks.len(), 2);
    let intranet = &networks["intranet"];
    let dmz = &networks["dmz"];
    assert!(env.cidr.contains(&intranet.cidr()) && env.cidr.contains(&dmz.cidr()));
    assert!(!intranet.cidr().contains(&dmz.cidr()) && !dmz.cidr().contains(&intranet.cidr()));
    assert_eq!(intranet.state(), MetaNetworkState::Active);

    // one NAT gateway per dmz zone, intranet routed through them per zone
    assert_eq!(dmz.nat_gateways().await.unwrap().len(), 3);
    let intranet_tables = intranet.route_tables().await.unwrap();
    assert_eq!(intranet_tables.len(), 3);
    for table in &intranet_tables {
        assert!(matches!(
            table.route_to(DEFAULT_ROUTE).map(|r| &r.target),
            Some(RouteTarget::NatGateway(_))
        ));
        assert_eq!(
            table.route_to("192.168.0.0/16").map(|r| &r.target),
            Some(&RouteTarget::Gateway(vgw.clone()))
        );
    }
    let dmz_tables = dmz.route_tables().await.unwrap();
    assert!(matches!(
        dmz_tables[0].route_to(DEFAULT_ROUTE).map(|r| &r.target),
        Some(RouteTarget::Gateway(id)) if id.starts_with("igw-")
    ));

    // the in-range reservation is made, the out-of-range one skipped
    let (nat_interfaces, interfaces): (Vec<_>, Vec<_>) = api
        .describe_network_interfaces(&[Filter::vpc(&env.vpc_id)], None)
        .await
        .unwrap()
        .items
        .into_iter()
        .partition(|i| i.requester_managed);
    assert_eq!(nat_interfaces.len(), 3);
    assert_eq!(interfaces.len(), 1);
    assert_eq!(
        interfaces[0].private_ip_address,
        intranet.ip_by_offset("+10").unwrap().to_string()
    );

    let ops = api.operations();
    assert_eq!(count(&ops, "ModifyVpcAttribute"), 2);
    assert_eq!(count(&ops, "AssociateDhcpOptions"), 1);
    // a lone environment has nothing to peer with
    assert_eq!(count(&ops, "CreateVpcPeeringConnection"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_is_idempotent_after_create() {
    let (api, lifecycle) = setup();
    lifecycle
        .create("hub", "sandbox", CreateOptions::default())
        .await
        .unwrap();
    lifecycle
        .create("ci", "sandbox", CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(count(&api.operations(), "CreateVpcPeeringConnection"), 1);

    api.clear_journal();
    let report = lifecycle.update("ci", false).await.unwrap();
    assert!(!report.dhcp_options_replaced);
    assert!(report.security_group_rules.values().all(|d| d.is_empty()));
    assert!(report.peerings.created.is_empty() && report.peerings.deleted.is_empty());
    assert!(api.journal().is_empty(), "{:?}", api.journal());
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_update_makes_no_changes() {
    let (api, lifecycle) = setup();
    let env = lifecycle
        .create("ci", "sandbox", CreateOptions::default())
        .await
        .unwrap();

    // drift: revoke a rule out of band
    let remote = Remote::new(api.clone());
    let networks = MetaNetwork::load_all(&remote, &env).await.unwrap();
    let group = networks["dmz"].security_group().await.unwrap().unwrap();
    api.revoke_ingress(&group.group_id, &group.ingress_rules[..1])
        .await
        .unwrap();

    api.clear_journal();
    let report = lifecycle.update("ci", true).await.unwrap();
    assert_eq!(report.security_group_rules["dmz"].added.len(), 1);
    assert!(api.journal().is_empty());

    let report = lifecycle.update("ci", false).await.unwrap();
    assert_eq!(report.security_group_rules["dmz"].added.len(), 1);
    assert_eq!(api.operations(), vec!["AuthorizeSecurityGroupIngress"]);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_follows_dependency_order() {
    let (api, lifecycle) = setup();
    api.add_vpn_gateway("ci");
    lifecycle
        .create("hub", "sandbox", CreateOptions::default())
        .await
        .unwrap();
    let env = lifecycle
        .create("ci", "sandbox", CreateOptions::default())
        .await
        .unwrap();

    api.clear_journal();
    lifecycle.destroy("ci").await.unwrap();
    let ops = api.operations();

    let peering_deleted = position(&ops, "DeleteVpcPeeringConnection").unwrap();
    let first_route_deleted = position(&ops, "DeleteRoute").unwrap();
    let first_nat_deleted = position(&ops, "DeleteNatGateway").unwrap();
    let last_nat_deleted = last_position(&ops, "DeleteNatGateway").unwrap();
    let first_table_deleted = position(&ops, "DeleteRouteTable").unwrap();
    let last_table_deleted = last_position(&ops, "DeleteRouteTable").unwrap();
    let vpc_deleted = position(&ops, "DeleteVpc").unwrap();

    assert!(position(&ops, "DeleteNetworkInterface").unwrap() < peering_deleted);
    // only the reservation; NAT gateway interfaces leave with their gateways
    assert_eq!(count(&ops, "DeleteNetworkInterface"), 1);
    assert_eq!(count(&ops, "DetachNetworkInterface"), 0);
    assert!(first_route_deleted < peering_deleted);
    assert!(peering_deleted < first_nat_deleted);
    assert!(last_nat_deleted < position(&ops, "DeleteSubnet").unwrap());
    assert!(last_position(&ops, "DeleteSubnet").unwrap() < position(&ops, "DeleteSecurityGroup").unwrap());
    assert!(last_nat_deleted < first_table_deleted);
    assert!(position(&ops, "DetachVpnGateway").unwrap() < first_table_deleted);
    assert!(last_table_deleted < vpc_deleted);
    assert_eq!(ops.last().map(String::as_str), Some("DeleteDhcpOptions"));
    assert_eq!(count(&ops, "ReleaseAddress"), 3);

    assert!(lifecycle.fetch("ci").await.unwrap().is_none());
    assert!(lifecycle.fetch(&env.vpc_id).await.unwrap().is_none());
    assert_eq!(lifecycle.list().await.unwrap().len(), 1);

    // the surviving side no longer routes to the destroyed environment
    let hub = lifecycle.fetch("hub").await.unwrap().unwrap();
    let remote = Remote::new(api.clone());
    let hub_networks = MetaNetwork::load_all(&remote, &hub).await.unwrap();
    for table in hub_networks["intranet"].route_tables().await.unwrap() {
        assert!(!table
            .routes
            .iter()
            .any(|r| matches!(r.target, RouteTarget::Peering(_))));
    }
}

#[tokio::test(start_paused = true)]
async fn test_destroy_tolerates_resources_already_gone() {
    let (api, lifecycle) = setup();
    lifecycle
        .create("hub", "sandbox", CreateOptions::default())
        .await
        .unwrap();
    lifecycle
        .create("ci", "sandbox", CreateOptions::default())
        .await
        .unwrap();

    // removed concurrently by someone else
    api.fail_next("DeleteRoute", "InvalidRoute.NotFound");
    api.fail_next("DeleteVpcPeeringConnection", "InvalidVpcPeeringConnectionID.NotFound");

    lifecycle.destroy("ci").await.unwrap();
    assert!(lifecycle.fetch("ci").await.unwrap().is_none());
    assert_eq!(lifecycle.list().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_recovers_partial_create() {
    let (api, lifecycle) = setup();
    api.fail_next("CreateNatGateway", "InsufficientAddressCapacity");

    let err = lifecycle
        .create("ci", "sandbox", CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.remote_code(), Some("InsufficientAddressCapacity"));
    assert!(lifecycle.fetch("ci").await.unwrap().is_some());

    lifecycle.destroy("ci").await.unwrap();
    assert!(lifecycle.list().await.unwrap().is_empty());

    // destroying again is a no-op
    api.clear_journal();
    lifecycle.destroy("ci").await.unwrap();
    assert!(api.journal().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_validation() {
    let (api, lifecycle) = setup();

    let err = lifecycle
        .create("ci_1", "sandbox", CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VpcError::Config(_)));

    let err = lifecycle
        .create("ci", "empty", CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VpcError::Config(_)));

    let err = lifecycle
        .create("ci", "missing", CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VpcError::Config(_)));
    assert!(api.journal().is_empty());

    lifecycle
        .create("one", "tiny", CreateOptions::default())
        .await
        .unwrap();
    let err = lifecycle
        .create("two", "tiny", CreateOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, VpcError::AddressSpaceExhausted { requester, .. } if requester == "two"),
        "{err}"
    );

    let err = lifecycle
        .create("one", "tiny", CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VpcError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_update_unknown_environment() {
    let (_api, lifecycle) = setup();
    let err = lifecycle.update("nowhere", false).await.unwrap_err();
    assert!(matches!(err, VpcError::EnvironmentNotFound(name) if name == "nowhere"));
}
