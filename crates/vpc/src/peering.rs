//! Declarative peering between environments' meta-networks.
//!
//! Configuration lines name two endpoints, `env[:type]/network`, where `env`
//! may be `*` for every live environment of that type. Resolved connections
//! are unordered pairs; they are diffed against what the remote routes show,
//! then missing connections are created and stale ones removed. Routes on
//! both sides are upserted for every desired connection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::VpcConfig;
use crate::ec2::{Filter, RouteTable, RouteTarget, Tagged, VpcPeering, LIVE_PEERING_STATES};
use crate::error::{Result, VpcError};
use crate::lifecycle::{list_environments, Environment};
use crate::metanetwork::{MetaNetwork, META_NETWORK_TAG};
use crate::remote::{tolerate_missing, Remote};

const WILDCARD: &str = "*";

const PEERING_TIMEOUT: Duration = Duration::from_secs(300);

/// One side of a peering connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeeringEndpoint {
    pub env_name: String,
    pub env_type: String,
    pub metanetwork: String,
}

impl PeeringEndpoint {
    pub fn new(
        env_name: impl Into<String>,
        env_type: impl Into<String>,
        metanetwork: impl Into<String>,
    ) -> Self {
        Self {
            env_name: env_name.into(),
            env_type: env_type.into(),
            metanetwork: metanetwork.into(),
        }
    }

    fn is_wildcard(&self) -> bool {
        self.env_name == WILDCARD
    }

    /// Every live environment this endpoint names.
    fn resolve(&self, live: &[Environment]) -> Vec<PeeringEndpoint> {
        live.iter()
            .filter(|env| {
                (self.is_wildcard() || env.name == self.env_name) && env.env_type == self.env_type
            })
            .map(|env| PeeringEndpoint::new(&env.name, &env.env_type, &self.metanetwork))
            .collect()
    }
}

impl std::str::FromStr for PeeringEndpoint {
    type Err = VpcError;

    /// `name[:type]/metanetwork`; the type defaults to the name.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            VpcError::Config(format!(
                "invalid peering endpoint '{s}', expected name[:type]/metanetwork"
            ))
        };
        let (env, metanetwork) = s.split_once('/').ok_or_else(invalid)?;
        let (name, env_type) = env.split_once(':').unwrap_or((env, env));
        let (name, env_type, metanetwork) = (name.trim(), env_type.trim(), metanetwork.trim());
        if name.is_empty() || env_type.is_empty() || metanetwork.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(name, env_type, metanetwork))
    }
}

impl fmt::Display for PeeringEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.env_name, self.env_type, self.metanetwork)
    }
}

/// An unordered pair of endpoints.
///
/// Endpoints are stored sorted, so `(a, b)` and `(b, a)` compare, hash and
/// order identically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeeringConnection {
    first: PeeringEndpoint,
    second: PeeringEndpoint,
}

impl PeeringConnection {
    #[must_use]
    pub fn new(a: PeeringEndpoint, b: PeeringEndpoint) -> Self {
        if a <= b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }

    /// Parse a configuration line without resolving wildcards.
    ///
    /// # Errors
    /// `Config` unless the line holds exactly two well-formed endpoints.
    pub fn parse_line(line: &str) -> Result<Self> {
        let endpoints: Vec<&str> = line.split_whitespace().collect();
        let &[a, b] = endpoints.as_slice() else {
            return Err(VpcError::Config(format!(
                "peering line '{line}' must hold exactly two endpoints"
            )));
        };
        Ok(Self::new(a.parse()?, b.parse()?))
    }

    #[must_use]
    pub fn endpoints(&self) -> [&PeeringEndpoint; 2] {
        [&self.first, &self.second]
    }

    #[must_use]
    pub fn contains_env(&self, env_name: &str) -> bool {
        self.first.env_name == env_name || self.second.env_name == env_name
    }
}

impl fmt::Display for PeeringConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.first, self.second)
    }
}

/// What a reconciliation pass did (or, on a dry run, would do).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<PeeringConnection>,
    pub deleted: Vec<PeeringConnection>,
    /// Stale connections or routes that could not be removed.
    pub failures: usize,
}

type NetworkCache = BTreeMap<String, BTreeMap<String, MetaNetwork>>;

/// Resolves peering configuration and reconciles it against live state.
#[derive(Clone)]
pub struct PeeringResolver {
    remote: Remote,
    config: Arc<VpcConfig>,
}

impl PeeringResolver {
    pub fn new(remote: Remote, config: Arc<VpcConfig>) -> Self {
        Self { remote, config }
    }

    /// Expand one configuration line against the live environments.
    ///
    /// Pairs inside a single environment are dropped. A literal environment
    /// that is not live yields no connections.
    ///
    /// # Errors
    /// `Config` for malformed lines or a wildcard environment type.
    pub fn resolve_config_line(
        &self,
        line: &str,
        live: &[Environment],
    ) -> Result<BTreeSet<PeeringConnection>> {
        let unresolved = PeeringConnection::parse_line(line)?;
        if unresolved.endpoints().iter().any(|e| e.env_type == WILDCARD) {
            return Err(VpcError::Config(format!(
                "wildcards are not allowed for the environment type in '{line}'"
            )));
        }

        let [a, b] = unresolved.endpoints().map(|e| e.resolve(live));
        let mut connections = BTreeSet::new();
        for source in &a {
            for target in b.iter().filter(|t| t.env_name != source.env_name) {
                connections.insert(PeeringConnection::new(source.clone(), target.clone()));
            }
        }
        Ok(connections)
    }

    /// Every connection the configuration asks for, optionally only those
    /// touching `scope`.
    ///
    /// # Errors
    /// `Config` for malformed lines.
    pub fn get_desired_peerings(
        &self,
        live: &[Environment],
        scope: Option<&str>,
    ) -> Result<BTreeSet<PeeringConnection>> {
        let mut desired = BTreeSet::new();
        for (key, line) in self.config.peering_lines() {
            let resolved = self.resolve_config_line(&line, live)?;
            if resolved.is_empty() {
                info!(key = %key, line = %line, "Peering line matches no pair of live environments, skipping");
                continue;
            }
            desired.extend(
                resolved
                    .into_iter()
                    .filter(|c| scope.is_none_or(|env| c.contains_env(env))),
            );
        }
        Ok(desired)
    }

    /// Live peering connections, optionally only those of one VPC.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn list_peerings(&self, vpc_id: Option<&str>) -> Result<Vec<VpcPeering>> {
        let status = Filter::new("status-code", LIVE_PEERING_STATES.iter().copied());
        let filter_sets: Vec<Vec<Filter>> = match vpc_id {
            Some(vpc_id) => vec![
                vec![status.clone(), Filter::new("requester-vpc-info.vpc-id", [vpc_id])],
                vec![status, Filter::new("accepter-vpc-info.vpc-id", [vpc_id])],
            ],
            None => vec![vec![status]],
        };

        let mut peerings: Vec<VpcPeering> = Vec::new();
        for filters in &filter_sets {
            let found = self
                .remote
                .call_paged("DescribeVpcPeeringConnections", |api, token| {
                    api.describe_vpc_peering_connections(filters, token)
                })
                .await?;
            for peering in found {
                if !peerings
                    .iter()
                    .any(|p| p.vpc_peering_connection_id == peering.vpc_peering_connection_id)
                {
                    peerings.push(peering);
                }
            }
        }
        Ok(peerings)
    }

    async fn route_tables_via(&self, peering_id: &str) -> Result<Vec<RouteTable>> {
        let filters = [Filter::new("route.vpc-peering-connection-id", [peering_id])];
        self.remote
            .call_paged("DescribeRouteTables", |api, token| {
                api.describe_route_tables(&filters, token)
            })
            .await
    }

    async fn networks_of<'c>(
        &self,
        cache: &'c mut NetworkCache,
        environment: &Environment,
    ) -> Result<&'c BTreeMap<String, MetaNetwork>> {
        if !cache.contains_key(&environment.name) {
            let networks = MetaNetwork::load_all(&self.remote, environment).await?;
            cache.insert(environment.name.clone(), networks);
        }
        cache
            .get(&environment.name)
            .ok_or_else(|| VpcError::EnvironmentNotFound(environment.name.clone()))
    }

    /// Connections that exist remotely, keyed to their remote id.
    ///
    /// A connection is recognised from a route table of one side that routes
    /// the other side's meta-network block through the peering connection.
    ///
    /// # Errors
    /// Any remote failure.
    pub async fn get_existing_peerings(
        &self,
        live: &[Environment],
        scope: Option<&Environment>,
    ) -> Result<BTreeMap<PeeringConnection, String>> {
        let mut cache = NetworkCache::new();
        self.existing_peerings(live, scope, &mut cache).await
    }

    async fn existing_peerings(
        &self,
        live: &[Environment],
        scope: Option<&Environment>,
        cache: &mut NetworkCache,
    ) -> Result<BTreeMap<PeeringConnection, String>> {
        let by_vpc: BTreeMap<&str, &Environment> =
            live.iter().map(|e| (e.vpc_id.as_str(), e)).collect();
        let mut existing = BTreeMap::new();

        for peering in self.list_peerings(scope.map(|e| e.vpc_id.as_str())).await? {
            let peering_id = &peering.vpc_peering_connection_id;
            let target = RouteTarget::Peering(peering_id.clone());

            for table in self.route_tables_via(peering_id).await? {
                let (Some(source_env), Some(peer_env)) = (
                    by_vpc.get(table.vpc_id.as_str()),
                    by_vpc.get(peering.peer_of(&table.vpc_id)),
                ) else {
                    warn!(peering_id = %peering_id, "Peering connects a VPC that is not a live environment");
                    continue;
                };
                let Some(source_network) = table.tag(META_NETWORK_TAG) else {
                    continue;
                };

                let destinations: Vec<&str> = table
                    .routes
                    .iter()
                    .filter(|r| r.target == target)
                    .map(|r| r.destination_cidr_block.as_str())
                    .collect();
                let peer_networks = self.networks_of(cache, peer_env).await?;
                for peer_network in peer_networks.values() {
                    if destinations.contains(&peer_network.cidr().to_string().as_str()) {
                        existing.insert(
                            PeeringConnection::new(
                                PeeringEndpoint::new(
                                    &source_env.name,
                                    &source_env.env_type,
                                    source_network,
                                ),
                                PeeringEndpoint::new(
                                    &peer_env.name,
                                    &peer_env.env_type,
                                    peer_network.name(),
                                ),
                            ),
                            peering_id.clone(),
                        );
                    }
                }
            }
        }
        Ok(existing)
    }

    /// Make live peerings match configuration, for one environment or, with
    /// no scope, for every live environment.
    ///
    /// Deleting stale connections and routes is best effort; failures are
    /// logged and counted.
    ///
    /// # Errors
    /// `Config` for malformed lines; any remote failure while creating.
    pub async fn reconcile(
        &self,
        scope: Option<&Environment>,
        dry_run: bool,
    ) -> Result<ReconcileReport> {
        let live = list_environments(&self.remote).await?;
        let mut cache = NetworkCache::new();

        let desired = self.get_desired_peerings(&live, scope.map(|e| e.name.as_str()))?;
        let existing = self.existing_peerings(&live, scope, &mut cache).await?;
        info!(desired = desired.len(), existing = existing.len(), dry_run, "Reconciling peerings");

        let by_name: BTreeMap<&str, &Environment> =
            live.iter().map(|e| (e.name.as_str(), e)).collect();
        let vpc_pair = |c: &PeeringConnection| -> Option<(String, String)> {
            let [a, b] = c.endpoints();
            let a = by_name.get(a.env_name.as_str())?.vpc_id.clone();
            let b = by_name.get(b.env_name.as_str())?.vpc_id.clone();
            Some(if a <= b { (a, b) } else { (b, a) })
        };
        let desired_pairs: BTreeSet<(String, String)> =
            desired.iter().filter_map(&vpc_pair).collect();

        let mut report = ReconcileReport::default();

        for (connection, peering_id) in &existing {
            if desired.contains(connection) {
                continue;
            }
            info!(connection = %connection, peering_id = %peering_id, dry_run, "Removing peering");
            report.deleted.push(connection.clone());
            if dry_run {
                continue;
            }

            let shared = vpc_pair(connection).is_some_and(|pair| desired_pairs.contains(&pair));
            if shared {
                report.failures += self
                    .delete_connection_routes(connection, peering_id, &by_name, &mut cache)
                    .await;
            } else {
                report.failures += self.delete_peering(peering_id).await.len();
            }
        }

        let mut peerings = self.list_peerings(None).await?;
        for connection in &desired {
            let Some((a, b)) = self.networks_for(connection, &by_name, &mut cache).await? else {
                continue;
            };
            let created = !existing.contains_key(connection);
            if created {
                info!(connection = %connection, dry_run, "Creating peering");
                report.created.push(connection.clone());
            }
            if dry_run {
                continue;
            }

            let [ea, eb] = connection.endpoints();
            let (Some(env_a), Some(env_b)) = (
                by_name.get(ea.env_name.as_str()),
                by_name.get(eb.env_name.as_str()),
            ) else {
                continue;
            };
            let peering_id = self
                .ensure_peering(&env_a.vpc_id, &env_b.vpc_id, &mut peerings)
                .await?;
            a.create_peering_route(&peering_id, &b.cidr().to_string())
                .await?;
            b.create_peering_route(&peering_id, &a.cidr().to_string())
                .await?;
        }

        Ok(report)
    }

    /// The meta-networks on both sides of a connection, or `None` (logged)
    /// when either is missing.
    async fn networks_for(
        &self,
        connection: &PeeringConnection,
        by_name: &BTreeMap<&str, &Environment>,
        cache: &mut NetworkCache,
    ) -> Result<Option<(MetaNetwork, MetaNetwork)>> {
        let mut found = Vec::with_capacity(2);
        for endpoint in connection.endpoints() {
            let Some(environment) = by_name.get(endpoint.env_name.as_str()) else {
                warn!(endpoint = %endpoint, "Environment is not live, skipping peering");
                return Ok(None);
            };
            let networks = self.networks_of(cache, environment).await?;
            let Some(network) = networks.get(&endpoint.metanetwork) else {
                warn!(endpoint = %endpoint, "Meta-network does not exist, skipping peering");
                return Ok(None);
            };
            found.push(network.clone());
        }
        let b = found.pop();
        let a = found.pop();
        Ok(a.zip(b))
    }

    /// The live connection between two VPCs, created and accepted if missing.
    async fn ensure_peering(
        &self,
        vpc_a: &str,
        vpc_b: &str,
        peerings: &mut Vec<VpcPeering>,
    ) -> Result<String> {
        if let Some(peering) = peerings.iter_mut().find(|p| p.connects(vpc_a, vpc_b)) {
            if peering.status == "pending-acceptance" {
                self.remote
                    .call("AcceptVpcPeeringConnection", |api| {
                        api.accept_vpc_peering_connection(&peering.vpc_peering_connection_id)
                    })
                    .await?;
                peering.status = "active".to_string();
            }
            return Ok(peering.vpc_peering_connection_id.clone());
        }

        let peering = self
            .remote
            .call("CreateVpcPeeringConnection", |api| {
                api.create_vpc_peering_connection(vpc_a, vpc_b)
            })
            .await?;
        let peering_id = peering.vpc_peering_connection_id.clone();

        let filters = [Filter::new("vpc-peering-connection-id", [peering_id.as_str()])];
        let filters = &filters[..];
        self.remote
            .wait_for_state(
                "peering connection",
                |api| async move {
                    api.describe_vpc_peering_connections(filters, None)
                        .await
                        .map(|page| page.items)
                },
                |p: &VpcPeering| p.status.as_str(),
                "pending-acceptance",
                PEERING_TIMEOUT,
            )
            .await?;
        self.remote
            .call("AcceptVpcPeeringConnection", |api| {
                api.accept_vpc_peering_connection(&peering_id)
            })
            .await?;

        info!(peering_id = %peering_id, requester = vpc_a, accepter = vpc_b, "Created peering connection");
        peerings.push(VpcPeering {
            status: "active".to_string(),
            ..peering
        });
        Ok(peering_id)
    }

    /// Delete every route through a connection, then the connection.
    ///
    /// Resources already gone are skipped; every other failure is logged and
    /// returned so the caller decides whether it is fatal.
    async fn delete_peering(&self, peering_id: &str) -> Vec<VpcError> {
        let mut errors = Vec::new();
        let target = RouteTarget::Peering(peering_id.to_string());

        match self.route_tables_via(peering_id).await {
            Ok(tables) => {
                for table in tables {
                    for route in table.routes.iter().filter(|r| r.target == target) {
                        let result = self
                            .remote
                            .call("DeleteRoute", |api| {
                                api.delete_route(&table.route_table_id, &route.destination_cidr_block)
                            })
                            .await;
                        if let Err(err) = tolerate_missing(result, "peering route") {
                            warn!(route_table_id = %table.route_table_id, error = %err, "Failed to delete peering route");
                            errors.push(err);
                        }
                    }
                }
            }
            Err(err) => {
                warn!(peering_id, error = %err, "Failed to list peering routes");
                errors.push(err);
            }
        }

        let result = self
            .remote
            .call("DeleteVpcPeeringConnection", |api| {
                api.delete_vpc_peering_connection(peering_id)
            })
            .await;
        if let Err(err) = tolerate_missing(result, "peering connection") {
            warn!(peering_id, error = %err, "Failed to delete peering connection");
            errors.push(err);
        }
        errors
    }

    /// Delete only the two routes of one connection through a shared
    /// peering. Returns the number of failed deletions.
    async fn delete_connection_routes(
        &self,
        connection: &PeeringConnection,
        peering_id: &str,
        by_name: &BTreeMap<&str, &Environment>,
        cache: &mut NetworkCache,
    ) -> usize {
        let (a, b) = match self.networks_for(connection, by_name, cache).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return 0,
            Err(err) => {
                warn!(connection = %connection, error = %err, "Failed to load peered networks");
                return 1;
            }
        };

        let target = RouteTarget::Peering(peering_id.to_string());
        let mut failures = 0;
        for (network, destination) in [(&a, b.cidr().to_string()), (&b, a.cidr().to_string())] {
            let tables = match network.route_tables().await {
                Ok(tables) => tables,
                Err(err) => {
                    warn!(network = %network.name(), error = %err, "Failed to list route tables");
                    failures += 1;
                    continue;
                }
            };
            for table in tables {
                if table.route_to(&destination).is_some_and(|r| r.target == target) {
                    let result = self
                        .remote
                        .call("DeleteRoute", |api| {
                            api.delete_route(&table.route_table_id, &destination)
                        })
                        .await;
                    if let Err(err) = tolerate_missing(result, "peering route") {
                        warn!(route_table_id = %table.route_table_id, error = %err, "Failed to delete peering route");
                        failures += 1;
                    }
                }
            }
        }
        failures
    }

    /// Delete every live connection of a VPC along with the routes through it.
    ///
    /// # Errors
    /// Any remote failure while listing; the first failed deletion.
    pub async fn delete_peerings(&self, vpc_id: &str) -> Result<()> {
        for peering in self.list_peerings(Some(vpc_id)).await? {
            info!(peering_id = %peering.vpc_peering_connection_id, "Deleting peering connection");
            if let Some(err) = self
                .delete_peering(&peering.vpc_peering_connection_id)
                .await
                .into_iter()
                .next()
            {
                return Err(err);
            }
        }
        debug!(vpc_id, "Peerings deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(envs: &[(&str, &str)]) -> Vec<Environment> {
        envs.iter()
            .enumerate()
            .map(|(i, (name, env_type))| Environment {
                name: (*name).to_string(),
                env_type: (*env_type).to_string(),
                vpc_id: format!("vpc-{i:08x}"),
                cidr: format!("10.{i}.0.0/16").parse().unwrap(),
                created_at: None,
                tags: BTreeMap::new(),
            })
            .collect()
    }

    fn resolver() -> PeeringResolver {
        PeeringResolver::new(
            Remote::new(Arc::new(crate::ec2::InMemoryEc2::new())),
            Arc::new(VpcConfig::default()),
        )
    }

    fn endpoint(s: &str) -> PeeringEndpoint {
        s.parse().unwrap()
    }

    #[test]
    fn test_connection_symmetry() {
        let a = endpoint("ci:sandbox/intranet");
        let b = endpoint("build:sandbox/dmz");
        let ab = PeeringConnection::new(a.clone(), b.clone());
        let ba = PeeringConnection::new(b, a);
        assert_eq!(ab, ba);
        assert_eq!(BTreeSet::from([ab.clone(), ba]).len(), 1);
        assert_eq!(ab.to_string(), "build:sandbox/dmz ci:sandbox/intranet");
    }

    #[test]
    fn test_endpoint_type_defaults_to_name() {
        let e = endpoint("ci/intranet");
        assert_eq!(e.env_type, "ci");
        assert_eq!(e.metanetwork, "intranet");
        assert!("ci:sandbox".parse::<PeeringEndpoint>().is_err());
        assert!("ci:/intranet".parse::<PeeringEndpoint>().is_err());
    }

    #[test]
    fn test_line_must_have_two_endpoints() {
        for line in ["ci/intranet", "a/x b/y c/z", ""] {
            assert!(matches!(
                PeeringConnection::parse_line(line),
                Err(VpcError::Config(_))
            ));
        }
    }

    #[test]
    fn test_wildcard_expansion() {
        let envs = live(&[
            ("a", "sandbox"),
            ("b", "sandbox"),
            ("c", "sandbox"),
            ("other", "sandbox"),
            ("prod", "production"),
        ]);
        let resolved = resolver()
            .resolve_config_line("*:sandbox/intranet other:sandbox/dmz", &envs)
            .unwrap();

        assert_eq!(resolved.len(), 3);
        for connection in &resolved {
            assert!(connection.contains_env("other"));
            assert!(connection
                .endpoints()
                .iter()
                .any(|e| e.env_name == "other" && e.metanetwork == "dmz"));
        }
    }

    #[test]
    fn test_double_wildcard_pairs_distinct_environments() {
        let envs = live(&[("a", "sandbox"), ("b", "sandbox"), ("c", "sandbox")]);
        let resolved = resolver()
            .resolve_config_line("*:sandbox/intranet *:sandbox/intranet", &envs)
            .unwrap();
        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn test_wildcard_type_rejected_and_missing_env_skipped() {
        let envs = live(&[("a", "sandbox")]);
        assert!(resolver()
            .resolve_config_line("*/intranet a:sandbox/intranet", &envs)
            .is_err());
        assert!(resolver()
            .resolve_config_line("gone:sandbox/intranet a:sandbox/intranet", &envs)
            .unwrap()
            .is_empty());
    }
}
