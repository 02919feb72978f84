//! VPC environment provisioning.
//!
//! This crate builds and tears down isolated network environments and keeps
//! the peering between them in line with a declarative configuration:
//!
//! - **Remote** - throttling-aware retries, pagination and state waits around
//!   every call to the networking API
//! - **Allocator** - collision-free carving of address blocks
//! - **Meta-networks** - named partitions of an environment (subnets per
//!   zone, route tables, NAT gateways, security groups)
//! - **Lifecycle** - dependency-ordered create, update and destroy
//! - **Peering** - wildcard peering lines resolved against live environments
//!   and reconciled idempotently
//!
//! ## Remote API
//!
//! All remote access goes through the [`ec2::Ec2Api`] trait:
//!
//! 1. [`ec2::HttpEc2`] talks JSON over HTTP to a real endpoint
//! 2. [`ec2::InMemoryEc2`] simulates one in process, with dependency checks,
//!    eventual state transitions and fault injection

pub mod allocator;
pub mod collaborators;
pub mod config;
pub mod dhcp;
pub mod ec2;
pub mod error;
pub mod gateways;
pub mod lifecycle;
pub mod metanetwork;
pub mod peering;
pub mod remote;
pub mod sg_rules;

pub use allocator::{allocate, allocate_siblings, pick_free_subnet, AddressAllocation, CidrSetting};
pub use collaborators::{Collaborator, Collaborators};
pub use config::{EnvConfig, VpcConfig};
pub use error::{RemoteError, Result, VpcError};
pub use lifecycle::{
    CreateOptions, DuplicatePolicy, Environment, EnvironmentLifecycle, EnvironmentSummary,
    UpdateReport,
};
pub use metanetwork::{MetaNetwork, MetaNetworkState};
pub use peering::{PeeringConnection, PeeringEndpoint, PeeringResolver, ReconcileReport};
pub use remote::{BackoffPolicy, Remote};
