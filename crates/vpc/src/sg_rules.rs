//! Security-group ingress rules declared per meta-network.
//!
//! `{net}_sg_rules` holds comma-separated `protocol source port...` tuples.
//! A source is a CIDR block, another meta-network (its security group) or
//! `all` (the whole environment block).

use std::collections::BTreeMap;
use std::str::FromStr;

use ipnet::Ipv4Net;
use tracing::{info, warn};

use crate::config::{network_spec, EnvConfig};
use crate::ec2::{Filter, RuleSource, SecurityRule};
use crate::error::{Result, VpcError};
use crate::metanetwork::{MetaNetwork, RuleDiff};
use crate::remote::{tolerate_missing, Remote};

/// Where a rule admits traffic from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Cidr(Ipv4Net),
    Network(String),
    /// The environment's own block.
    All,
}

/// One parsed rule tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub protocol: String,
    pub source: SourceSpec,
    pub ports: Vec<(i32, i32)>,
}

fn parse_port_range(value: &str) -> Option<(i32, i32)> {
    let (from, to) = match value.split_once(':') {
        Some((from, to)) => (from.parse().ok()?, to.parse().ok()?),
        None => {
            let port = value.parse().ok()?;
            (port, port)
        }
    };
    (from <= to).then_some((from, to))
}

impl FromStr for RuleSpec {
    type Err = VpcError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(protocol), Some(source)) = (parts.next(), parts.next()) else {
            return Err(VpcError::Config(format!(
                "security group rule '{s}' needs a protocol and a source"
            )));
        };

        let protocol = match protocol.to_ascii_lowercase().as_str() {
            "all" | "-1" => "-1".to_string(),
            p @ ("tcp" | "udp" | "icmp") => p.to_string(),
            other => {
                return Err(VpcError::Config(format!(
                    "unknown protocol '{other}' in security group rule '{s}'"
                )))
            }
        };

        let source = if source.eq_ignore_ascii_case("all") {
            SourceSpec::All
        } else if let Ok(cidr) = source.parse::<Ipv4Net>() {
            SourceSpec::Cidr(cidr)
        } else if network_spec(source).is_some() {
            SourceSpec::Network(source.to_string())
        } else {
            return Err(VpcError::Config(format!(
                "'{source}' in security group rule '{s}' is neither a CIDR nor a meta-network"
            )));
        };

        let mut ports = parts
            .map(|p| {
                parse_port_range(p).ok_or_else(|| {
                    VpcError::Config(format!("bad port '{p}' in security group rule '{s}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if protocol == "-1" {
            ports = vec![(-1, -1)];
        } else if ports.is_empty() {
            return Err(VpcError::Config(format!(
                "security group rule '{s}' names no ports"
            )));
        }

        Ok(Self {
            protocol,
            source,
            ports,
        })
    }
}

/// Parse a whole `{net}_sg_rules` value.
///
/// # Errors
/// `Config` for the first malformed tuple.
pub fn parse_rules(text: &str) -> Result<Vec<RuleSpec>> {
    text.split(',')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(str::parse)
        .collect()
}

impl RuleSpec {
    /// Concrete ingress rules, or `None` if the source network does not exist
    /// in this environment.
    #[must_use]
    pub fn resolve(
        &self,
        environment_cidr: Ipv4Net,
        group_ids: &BTreeMap<String, String>,
    ) -> Option<Vec<SecurityRule>> {
        let source = match &self.source {
            SourceSpec::Cidr(cidr) => RuleSource::Cidr(cidr.to_string()),
            SourceSpec::All => RuleSource::Cidr(environment_cidr.to_string()),
            SourceSpec::Network(name) => RuleSource::Group(group_ids.get(name)?.clone()),
        };
        Some(
            self.ports
                .iter()
                .map(|&(from_port, to_port)| SecurityRule {
                    ip_protocol: self.protocol.clone(),
                    from_port,
                    to_port,
                    source: source.clone(),
                })
                .collect(),
        )
    }
}

/// Desired ingress rules of one meta-network.
///
/// # Errors
/// `Config` if the configured rules are malformed.
pub fn desired_rules(
    config: &EnvConfig<'_>,
    network: &str,
    environment_cidr: Ipv4Net,
    group_ids: &BTreeMap<String, String>,
) -> Result<Vec<SecurityRule>> {
    let Some(text) = config.sg_rules(network) else {
        return Ok(Vec::new());
    };

    let mut rules = Vec::new();
    for spec in parse_rules(&text)? {
        match spec.resolve(environment_cidr, group_ids) {
            Some(resolved) => rules.extend(resolved),
            None => warn!(
                network,
                source = ?spec.source,
                "Rule source network is not part of this environment, skipping"
            ),
        }
    }
    Ok(rules)
}

/// Reconcile the rules of every meta-network against configuration.
///
/// # Errors
/// `Config` for malformed rules; any remote failure.
pub async fn update_meta_network_sg_rules(
    config: &EnvConfig<'_>,
    environment_cidr: Ipv4Net,
    networks: &mut BTreeMap<String, MetaNetwork>,
    dry_run: bool,
) -> Result<BTreeMap<String, RuleDiff>> {
    let group_ids: BTreeMap<String, String> = networks
        .iter()
        .filter_map(|(name, network)| {
            network
                .security_group_id()
                .map(|id| (name.clone(), id.to_string()))
        })
        .collect();

    let mut diffs = BTreeMap::new();
    for (name, network) in networks.iter_mut() {
        let desired = desired_rules(config, name, environment_cidr, &group_ids)?;
        let diff = network.update_sg_rules(&desired, dry_run).await?;
        if !diff.is_empty() {
            info!(
                network = %name,
                added = diff.added.len(),
                removed = diff.removed.len(),
                dry_run,
                "Security group rules changed"
            );
        }
        diffs.insert(name.clone(), diff);
    }
    Ok(diffs)
}

/// Revoke every ingress rule of the environment's own groups, then delete them.
///
/// # Errors
/// Any remote failure other than a rule or group already being gone.
pub async fn destroy_security_groups(remote: &Remote, vpc_id: &str) -> Result<()> {
    let filters = [Filter::vpc(vpc_id)];
    let groups = remote
        .call_paged("DescribeSecurityGroups", |api, token| {
            api.describe_security_groups(&filters, token)
        })
        .await?;
    let groups: Vec<_> = groups.into_iter().filter(|g| !g.is_default()).collect();

    for group in groups.iter().filter(|g| !g.ingress_rules.is_empty()) {
        let result = remote
            .call("RevokeSecurityGroupIngress", |api| {
                api.revoke_ingress(&group.group_id, &group.ingress_rules)
            })
            .await;
        tolerate_missing(result, "security group rules")?;
    }

    for group in &groups {
        info!(group_id = %group.group_id, group_name = %group.group_name, "Deleting security group");
        let result = remote
            .call("DeleteSecurityGroup", |api| {
                api.delete_security_group(&group.group_id)
            })
            .await;
        tolerate_missing(result, "security group")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> BTreeMap<String, String> {
        BTreeMap::from([("intranet".to_string(), "sg-00000001".to_string())])
    }

    #[test]
    fn test_parse_rule_tuples() {
        let rules = parse_rules("tcp all 0:65535, udp intranet 53 123, icmp 0.0.0.0/0 -1").unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].source, SourceSpec::All);
        assert_eq!(rules[0].ports, vec![(0, 65535)]);
        assert_eq!(rules[1].source, SourceSpec::Network("intranet".into()));
        assert_eq!(rules[1].ports, vec![(53, 53), (123, 123)]);
        assert_eq!(rules[2].ports, vec![(-1, -1)]);
    }

    #[test]
    fn test_all_protocols_ignore_ports() {
        let rule: RuleSpec = "all dmz".parse().unwrap();
        assert_eq!(rule.protocol, "-1");
        assert_eq!(rule.ports, vec![(-1, -1)]);
    }

    #[test]
    fn test_malformed_rules() {
        for bad in [
            "tcp",
            "gre all 22",
            "tcp nowhere 22",
            "tcp all",
            "tcp all 22:21",
            "udp all x",
        ] {
            assert!(matches!(bad.parse::<RuleSpec>(), Err(VpcError::Config(_))), "{bad}");
        }
        assert!(parse_rules("").unwrap().is_empty());
    }

    #[test]
    fn test_resolve_sources() {
        let cidr: Ipv4Net = "10.0.0.0/20".parse().unwrap();
        let all: RuleSpec = "tcp all 22".parse().unwrap();
        assert_eq!(
            all.resolve(cidr, &groups()).unwrap()[0].source,
            RuleSource::Cidr("10.0.0.0/20".into())
        );

        let group: RuleSpec = "udp intranet 53 123".parse().unwrap();
        let resolved = group.resolve(cidr, &groups()).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[1].source, RuleSource::Group("sg-00000001".into()));
        assert_eq!(resolved[1].from_port, 123);

        let missing: RuleSpec = "tcp dmz 443".parse().unwrap();
        assert!(missing.resolve(cidr, &groups()).is_none());
    }
}
