//! DHCP option sets.
//!
//! Each environment owns one option set tagged `Name=<env>`. A changed
//! configuration produces a new set; the old one is deleted only when it
//! belongs to the environment, never a shared or default set.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, info};

use crate::config::EnvConfig;
use crate::ec2::{DhcpConfiguration, DhcpOptions, Filter, Tag, Tagged};
use crate::error::{Result, VpcError};
use crate::lifecycle::Environment;
use crate::metanetwork::MetaNetwork;
use crate::remote::{tolerate_missing, Remote, DEFAULT_TIMEOUT};

const NTP_PORT: u16 = 123;

async fn resolve_host(host: &str) -> Result<Ipv4Addr> {
    if let Ok(address) = host.parse::<Ipv4Addr>() {
        return Ok(address);
    }
    tokio::net::lookup_host((host, NTP_PORT))
        .await
        .map_err(|e| VpcError::Config(format!("cannot resolve NTP server {host}: {e}")))?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| VpcError::Config(format!("NTP server {host} has no IPv4 address")))
}

/// NTP servers from `ntp_server`, or from a meta-network offset when that is unset.
///
/// # Errors
/// `Config` if a host name does not resolve or the offset is invalid.
pub async fn ntp_servers(
    config: &EnvConfig<'_>,
    networks: &BTreeMap<String, MetaNetwork>,
) -> Result<Vec<String>> {
    let configured = config.words("ntp_server");
    if !configured.is_empty() {
        let mut servers = Vec::with_capacity(configured.len());
        for host in &configured {
            servers.push(resolve_host(host).await?.to_string());
        }
        return Ok(servers);
    }

    let (Some(network), Some(offset)) = (
        config.get("ntp_server_metanetwork"),
        config.get("ntp_server_offset"),
    ) else {
        return Ok(Vec::new());
    };
    let network = networks.get(&network).ok_or_else(|| {
        VpcError::Config(format!("ntp_server_metanetwork names unknown network {network}"))
    })?;
    Ok(vec![network.ip_by_offset(&offset)?.to_string()])
}

/// The option set the environment should carry.
///
/// # Errors
/// As [`ntp_servers`].
pub async fn desired_dhcp_configurations(
    config: &EnvConfig<'_>,
    networks: &BTreeMap<String, MetaNetwork>,
) -> Result<Vec<DhcpConfiguration>> {
    let mut configurations = Vec::new();
    if let Some(domain_name) = config.get("domain_name") {
        configurations.push(DhcpConfiguration::new("domain-name", [domain_name]));
    }

    // the internal server is listed first so it is the default resolver
    let servers: Vec<String> = ["internal_dns", "external_dns"]
        .into_iter()
        .filter_map(|key| config.get(key))
        .collect();
    if !servers.is_empty() {
        configurations.push(DhcpConfiguration::new("domain-name-servers", servers));
    }

    let ntp = ntp_servers(config, networks).await?;
    if !ntp.is_empty() {
        configurations.push(DhcpConfiguration::new("ntp-servers", ntp));
    }
    Ok(configurations)
}

fn same_configurations(a: &[DhcpConfiguration], b: &[DhcpConfiguration]) -> bool {
    let as_map = |configs: &[DhcpConfiguration]| -> BTreeMap<String, Vec<String>> {
        configs
            .iter()
            .map(|c| (c.key.clone(), c.values.clone()))
            .collect()
    };
    as_map(a) == as_map(b)
}

async fn describe_options(remote: &Remote, dhcp_options_id: &str) -> Result<Option<DhcpOptions>> {
    let filters = [Filter::new("dhcp-options-id", [dhcp_options_id])];
    let options = remote
        .call("DescribeDhcpOptions", |api| api.describe_dhcp_options(&filters))
        .await?;
    Ok(options.into_iter().next())
}

/// Id of the option set currently associated with the environment.
///
/// # Errors
/// Any remote failure.
pub async fn associated_dhcp_options_id(remote: &Remote, vpc_id: &str) -> Result<Option<String>> {
    let filters = [Filter::vpc(vpc_id)];
    let vpcs = remote
        .call_paged("DescribeVpcs", |api, token| api.describe_vpcs(&filters, token))
        .await?;
    Ok(vpcs.into_iter().find_map(|v| v.dhcp_options_id))
}

/// Replace the environment's option set if it differs from `desired`.
/// Returns whether a new set was (or, on a dry run, would be) associated.
///
/// # Errors
/// Any remote failure.
pub async fn update_dhcp_options(
    remote: &Remote,
    environment: &Environment,
    desired: &[DhcpConfiguration],
    dry_run: bool,
) -> Result<bool> {
    if desired.is_empty() {
        debug!(environment = %environment.name, "No DHCP options configured, keeping current set");
        return Ok(false);
    }
    let current_id = associated_dhcp_options_id(remote, &environment.vpc_id).await?;
    let current = match &current_id {
        Some(id) => describe_options(remote, id)
            .await?
            .filter(|o| o.tag("Name") == Some(environment.name.as_str())),
        None => None,
    };

    let existing = current
        .as_ref()
        .map(|o| o.dhcp_configurations.as_slice())
        .unwrap_or_default();
    if current.is_some() && same_configurations(desired, existing) {
        debug!(environment = %environment.name, "DHCP options up to date");
        return Ok(false);
    }
    info!(environment = %environment.name, ?desired, ?existing, dry_run, "Updating DHCP options");
    if dry_run {
        return Ok(true);
    }

    let created = remote
        .call("CreateDhcpOptions", |api| api.create_dhcp_options(desired))
        .await?;
    let ids = [created.dhcp_options_id.clone()];
    let tags = [Tag::new("Name", &environment.name)];
    remote
        .keep_trying("CreateTags", DEFAULT_TIMEOUT, |api| api.create_tags(&ids, &tags))
        .await?;
    remote
        .keep_trying("AssociateDhcpOptions", DEFAULT_TIMEOUT, |api| {
            api.associate_dhcp_options(&created.dhcp_options_id, &environment.vpc_id)
        })
        .await?;

    if let Some(previous) = current {
        info!(dhcp_options_id = %previous.dhcp_options_id, "Deleting replaced DHCP options");
        let result = remote
            .call("DeleteDhcpOptions", |api| {
                api.delete_dhcp_options(&previous.dhcp_options_id)
            })
            .await;
        tolerate_missing(result, "DHCP options")?;
    }
    Ok(true)
}

/// Delete an option set once its environment is gone, if it is tagged as
/// belonging to that environment.
///
/// # Errors
/// Any remote failure other than the set already being gone.
pub async fn delete_owned_dhcp_options(
    remote: &Remote,
    environment_name: &str,
    dhcp_options_id: &str,
) -> Result<()> {
    let Some(options) = describe_options(remote, dhcp_options_id).await? else {
        return Ok(());
    };
    if options.tag("Name") != Some(environment_name) {
        debug!(dhcp_options_id, "DHCP options not owned by environment, keeping");
        return Ok(());
    }

    info!(dhcp_options_id, "Deleting DHCP options");
    let result = remote
        .call("DeleteDhcpOptions", |api| api.delete_dhcp_options(dhcp_options_id))
        .await;
    tolerate_missing(result, "DHCP options")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::VpcConfig;
    use crate::ec2::{Ec2Api, InMemoryEc2};

    const CONFIG: &str = r#"
[envtype.sandbox]
domain_name = "ci.example.com"
internal_dns = "10.0.0.2"
external_dns = "8.8.8.8"
ntp_server = "10.0.0.5 10.0.0.6"
"#;

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

    #[tokio::test]
    async fn test_desired_configurations() {
        let config = VpcConfig::from_toml_str(CONFIG).unwrap();
        let desired = desired_dhcp_configurations(&config.for_environment("ci", "sandbox"), &BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            desired,
            vec![
                DhcpConfiguration::new("domain-name", ["ci.example.com"]),
                DhcpConfiguration::new("domain-name-servers", ["10.0.0.2", "8.8.8.8"]),
                DhcpConfiguration::new("ntp-servers", ["10.0.0.5", "10.0.0.6"]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_replaces_only_owned_sets() {
        let api = Arc::new(InMemoryEc2::new());
        let remote = Remote::new(api.clone());
        let env = environment(&api).await;
        let first = vec![DhcpConfiguration::new("domain-name", ["a.example.com"])];

        assert!(update_dhcp_options(&remote, &env, &first, true).await.unwrap());
        assert!(!api.operations().contains(&"CreateDhcpOptions".to_string()));

        assert!(update_dhcp_options(&remote, &env, &first, false).await.unwrap());
        assert!(!update_dhcp_options(&remote, &env, &first, false).await.unwrap());
        let first_id = associated_dhcp_options_id(&remote, &env.vpc_id).await.unwrap().unwrap();

        let second = vec![DhcpConfiguration::new("domain-name", ["b.example.com"])];
        api.clear_journal();
        assert!(update_dhcp_options(&remote, &env, &second, false).await.unwrap());
        assert_eq!(
            api.operations(),
            vec!["CreateDhcpOptions", "CreateTags", "AssociateDhcpOptions", "DeleteDhcpOptions"]
        );
        assert!(api.journal().last().unwrap().ends_with(&first_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_configured_keeps_default_set() {
        let api = Arc::new(InMemoryEc2::new());
        let remote = Remote::new(api.clone());
        let env = environment(&api).await;
        let config = VpcConfig::from_toml_str("[envtype.bare]\n").unwrap();
        let desired = desired_dhcp_configurations(&config.for_environment("ci", "bare"), &BTreeMap::new())
            .await
            .unwrap();
        assert!(desired.is_empty());
        api.clear_journal();

        assert!(!update_dhcp_options(&remote, &env, &desired, false).await.unwrap());
        assert!(api.journal().is_empty());
        assert_eq!(
            associated_dhcp_options_id(&remote, &env.vpc_id).await.unwrap().as_deref(),
            Some("dopt-default")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_keeps_foreign_sets() {
        let api = Arc::new(InMemoryEc2::new());
        let remote = Remote::new(api.clone());
        let foreign = api
            .create_dhcp_options(&[DhcpConfiguration::new("domain-name", ["shared"])])
            .await
            .unwrap();

        delete_owned_dhcp_options(&remote, "ci", &foreign.dhcp_options_id)
            .await
            .unwrap();
        assert!(!api.operations().contains(&"DeleteDhcpOptions".to_string()));

        api.create_tags(&[foreign.dhcp_options_id.clone()], &[Tag::new("Name", "ci")])
            .await
            .unwrap();
        delete_owned_dhcp_options(&remote, "ci", &foreign.dhcp_options_id)
            .await
            .unwrap();
        assert!(api.operations().contains(&"DeleteDhcpOptions".to_string()));
    }
}
