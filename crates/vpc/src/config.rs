//! Layered environment configuration.
//!
//! A single TOML document holds defaults per environment type, overrides per
//! environment, and the declarative peering lines:
//!
//! ```toml
//! [envtype.sandbox]
//! ip_space = "10.0.0.0/16"
//! vpc_cidr_size = 20
//! intranet_cidr = "auto"
//!
//! [env.ci]
//! vpc_cidr = "10.200.0.0/20"
//!
//! [peerings]
//! connection_1 = "ci:sandbox/intranet build:sandbox/intranet"
//! ```
//!
//! Lookups check `[env.<name>]`, then `[envtype.<type>]`, then `[peerings]`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use ipnet::Ipv4Net;
use serde::Deserialize;
use tracing::info;

use crate::allocator::CidrSetting;
use crate::error::{Result, VpcError};

/// A meta-network every environment may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: &'static str,
    /// Description given to the network's security group.
    pub description: &'static str,
}

/// The fixed meta-network catalogue, in creation order.
pub const NETWORKS: &[NetworkSpec] = &[
    NetworkSpec {
        name: "intranet",
        description: "Internal services reachable only from inside the environment",
    },
    NetworkSpec {
        name: "tunnel",
        description: "VPN and tunnel endpoints",
    },
    NetworkSpec {
        name: "dmz",
        description: "Internet-facing load balancers and proxies",
    },
    NetworkSpec {
        name: "maintenance",
        description: "Administrative access hosts",
    },
];

/// Look up a catalogued network.
#[must_use]
pub fn network_spec(name: &str) -> Option<&'static NetworkSpec> {
    NETWORKS.iter().find(|n| n.name == name)
}

/// A raw configuration value. Every value is read back as text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Text(String),
    Integer(i64),
    Bool(bool),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Key/value pairs of one section.
pub type Section = BTreeMap<String, ConfigValue>;

/// NAT gateway addressing for one meta-network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatSetting {
    /// Acquire one dynamic address per zone.
    Auto,
    /// Use these pre-allocated public IPs, one per zone.
    Static(Vec<String>),
}

/// Which gateway a `{net}_*_routes` key routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Internet,
    Vpn,
}

impl GatewayKind {
    fn key_suffix(self) -> &'static str {
        match self {
            Self::Internet => "igw_routes",
            Self::Vpn => "vgw_routes",
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VpcConfig {
    /// Defaults per environment type.
    #[serde(default)]
    pub envtype: BTreeMap<String, Section>,
    /// Overrides per environment name.
    #[serde(default)]
    pub env: BTreeMap<String, Section>,
    /// Peering lines plus fallback values.
    #[serde(default)]
    pub peerings: Section,
}

impl VpcConfig {
    /// Load configuration from a file.
    ///
    /// # Errors
    /// `Config` if the file cannot be read or is not valid TOML.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Reading VPC config");

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VpcError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    /// `Config` if the text is not valid TOML of the expected shape.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| VpcError::Config(format!("invalid VPC config: {e}")))
    }

    /// View of the configuration for one environment.
    #[must_use]
    pub fn for_environment(&self, name: &str, env_type: &str) -> EnvConfig<'_> {
        EnvConfig {
            config: self,
            name: name.to_string(),
            env_type: env_type.to_string(),
        }
    }

    /// Whether an environment type is defined.
    #[must_use]
    pub fn has_env_type(&self, env_type: &str) -> bool {
        self.envtype.contains_key(env_type)
    }

    /// `connection_<n>` lines of the `[peerings]` section, keyed by name.
    #[must_use]
    pub fn peering_lines(&self) -> Vec<(String, String)> {
        self.peerings
            .iter()
            .filter(|(key, _)| key.starts_with("connection_"))
            .map(|(key, value)| (key.clone(), value.to_string()))
            .collect()
    }
}

/// Configuration as seen by one environment.
#[derive(Debug, Clone)]
pub struct EnvConfig<'a> {
    config: &'a VpcConfig,
    name: String,
    env_type: String,
}

impl EnvConfig<'_> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn env_type(&self) -> &str {
        &self.env_type
    }

    /// Raw value of `key`, or `None` when unset or blank.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.config
            .env
            .get(&self.name)
            .and_then(|s| s.get(key))
            .or_else(|| {
                self.config
                    .envtype
                    .get(&self.env_type)
                    .and_then(|s| s.get(key))
            })
            .or_else(|| self.config.peerings.get(key))
            .map(ToString::to_string)
            .filter(|v| !v.trim().is_empty())
    }

    /// Whitespace-separated words of `key`.
    #[must_use]
    pub fn words(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn parse_net(&self, key: &str, value: &str) -> Result<Ipv4Net> {
        value.trim().parse().map_err(|_| {
            VpcError::Config(format!(
                "{key} = '{value}' for {} is not a CIDR block",
                self.name
            ))
        })
    }

    /// Explicit environment block, if configured.
    ///
    /// # Errors
    /// `Config` if the value is not a CIDR block.
    pub fn vpc_cidr(&self) -> Result<Option<Ipv4Net>> {
        self.get("vpc_cidr")
            .map(|v| self.parse_net("vpc_cidr", &v))
            .transpose()
    }

    /// Parent block and prefix length for allocating the environment block.
    ///
    /// # Errors
    /// `Config` if either key is missing or malformed.
    pub fn ip_space(&self) -> Result<(Ipv4Net, u8)> {
        let space = self.get("ip_space").ok_or_else(|| {
            VpcError::Config(format!(
                "environment {} needs vpc_cidr or ip_space and vpc_cidr_size",
                self.name
            ))
        })?;
        let space = self.parse_net("ip_space", &space)?;

        let size = self.get("vpc_cidr_size").ok_or_else(|| {
            VpcError::Config(format!("vpc_cidr_size missing for {}", self.name))
        })?;
        let size: u8 = size
            .trim()
            .parse()
            .ok()
            .filter(|s| (space.prefix_len()..=32).contains(s))
            .ok_or_else(|| {
                VpcError::Config(format!(
                    "vpc_cidr_size = '{size}' does not fit inside {space}"
                ))
            })?;

        Ok((space, size))
    }

    /// Configured meta-networks, in catalogue order.
    ///
    /// # Errors
    /// `Config` if a `{net}_cidr` value is malformed.
    pub fn network_cidrs(&self) -> Result<Vec<(String, CidrSetting)>> {
        NETWORKS
            .iter()
            .filter_map(|spec| {
                let key = format!("{}_cidr", spec.name);
                self.get(&key).map(|value| {
                    value
                        .parse::<CidrSetting>()
                        .map(|setting| (spec.name.to_string(), setting))
                        .map_err(|_| {
                            VpcError::Config(format!(
                                "{key} = '{value}' for {} is neither 'auto' nor a CIDR block",
                                self.name
                            ))
                        })
                })
            })
            .collect()
    }

    /// NAT gateway addressing for a meta-network, if any.
    #[must_use]
    pub fn nat_gateways(&self, network: &str) -> Option<NatSetting> {
        let value = self.get(&format!("{network}_nat_gateways"))?;
        if value.trim().eq_ignore_ascii_case("auto") {
            return Some(NatSetting::Auto);
        }
        let ips: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .collect();
        (!ips.is_empty()).then_some(NatSetting::Static(ips))
    }

    /// Raw security-group rules of a meta-network.
    #[must_use]
    pub fn sg_rules(&self, network: &str) -> Option<String> {
        self.get(&format!("{network}_sg_rules"))
    }

    /// Destination blocks routed to a gateway from a meta-network.
    #[must_use]
    pub fn gateway_routes(&self, network: &str, kind: GatewayKind) -> Vec<String> {
        self.words(&format!("{network}_{}", kind.key_suffix()))
    }

    /// Addresses (or `+N`/`-N` offsets) to pre-reserve in a meta-network.
    #[must_use]
    pub fn reserved_ips(&self, network: &str) -> Vec<String> {
        self.words(&format!("{network}_reserved_ips"))
    }

    /// `(source, target)` meta-network pairs for default routes via NAT.
    ///
    /// # Errors
    /// `Config` if an entry is not `source/target`.
    pub fn nat_gateway_routes(&self) -> Result<Vec<(String, String)>> {
        self.words("nat_gateway_routes")
            .into_iter()
            .map(|pair| match pair.split_once('/') {
                Some((source, target)) if !source.is_empty() && !target.is_empty() => {
                    Ok((source.to_string(), target.to_string()))
                }
                _ => Err(VpcError::Config(format!(
                    "nat_gateway_routes entry '{pair}' is not source/target"
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
[envtype.sandbox]
ip_space = "10.0.0.0/16"
vpc_cidr_size = 20
intranet_cidr = "auto"
dmz_cidr = "auto"
dmz_nat_gateways = "auto"
intranet_nat_gateways = "52.0.0.1, 52.0.0.2"
intranet_sg_rules = "tcp all 0:65535"
intranet_igw_routes = "0.0.0.0/0"
nat_gateway_routes = "intranet/dmz"
domain_name = "sandbox.example.com"

[env.ci]
vpc_cidr = "10.200.0.0/20"
domain_name = "ci.example.com"
maintenance_cidr = "10.200.8.0/22"

[peerings]
connection_2 = "ci:sandbox/intranet build:sandbox/intranet"
connection_1 = "*:sandbox/dmz ci:sandbox/dmz"
internal_dns = "10.0.0.2"
"#;

    fn sample() -> VpcConfig {
        VpcConfig::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_lookup_precedence() {
        let config = sample();
        let ci = config.for_environment("ci", "sandbox");
        assert_eq!(ci.get("domain_name").as_deref(), Some("ci.example.com"));
        assert_eq!(ci.get("vpc_cidr_size").as_deref(), Some("20"));
        assert_eq!(ci.get("internal_dns").as_deref(), Some("10.0.0.2"));
        assert_eq!(ci.get("missing"), None);

        let other = config.for_environment("qa", "sandbox");
        assert_eq!(other.get("domain_name").as_deref(), Some("sandbox.example.com"));
        assert_eq!(other.vpc_cidr().unwrap(), None);
        assert_eq!(
            other.ip_space().unwrap(),
            ("10.0.0.0/16".parse().unwrap(), 20)
        );
    }

    #[test]
    fn test_network_settings() {
        let config = sample();
        let ci = config.for_environment("ci", "sandbox");

        let networks = ci.network_cidrs().unwrap();
        let names: Vec<&str> = networks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["intranet", "dmz", "maintenance"]);
        assert_eq!(networks[0].1, CidrSetting::Auto);

        assert_eq!(ci.nat_gateways("dmz"), Some(NatSetting::Auto));
        assert_eq!(
            ci.nat_gateways("intranet"),
            Some(NatSetting::Static(vec!["52.0.0.1".into(), "52.0.0.2".into()]))
        );
        assert_eq!(ci.nat_gateways("tunnel"), None);
        assert_eq!(
            ci.gateway_routes("intranet", GatewayKind::Internet),
            vec!["0.0.0.0/0"]
        );
        assert!(ci.gateway_routes("intranet", GatewayKind::Vpn).is_empty());
        assert_eq!(
            ci.nat_gateway_routes().unwrap(),
            vec![("intranet".to_string(), "dmz".to_string())]
        );
    }

    #[test]
    fn test_peering_lines_sorted_by_key() {
        let lines = sample().peering_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, "connection_1");
        assert!(lines[1].1.starts_with("ci:sandbox"));
    }

    #[test]
    fn test_malformed_values() {
        let config = VpcConfig::from_toml_str(
            r#"
[envtype.broken]
ip_space = "10.0.0.0/16"
vpc_cidr_size = 12
dmz_cidr = "everywhere"
nat_gateway_routes = "intranet"
"#,
        )
        .unwrap();
        let env = config.for_environment("x", "broken");
        assert!(matches!(env.ip_space(), Err(VpcError::Config(_))));
        assert!(matches!(env.network_cidrs(), Err(VpcError::Config(_))));
        assert!(matches!(env.nat_gateway_routes(), Err(VpcError::Config(_))));

        assert!(VpcConfig::from_toml_str("[env").is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = VpcConfig::load(file.path()).await.unwrap();
        assert!(config.has_env_type("sandbox"));

        let missing = VpcConfig::load("/nonexistent/vpc.toml").await;
        assert!(matches!(missing, Err(VpcError::Config(_))));
    }
}
