//! VPC CLI - create, update and destroy network environments.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vpc::ec2::HttpEc2;
use vpc::{CreateOptions, DuplicatePolicy, EnvironmentLifecycle, Remote, VpcConfig};

/// VPC CLI - environment provisioning and peering.
#[derive(Parser)]
#[command(name = "vpc")]
#[command(about = "Provision VPC environments and reconcile peerings", version)]
struct Cli {
    /// Path to the environment configuration.
    #[arg(long, env = "VPC_CONFIG", default_value = "vpc.toml")]
    config: PathBuf,

    /// AWS region.
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Override the EC2 endpoint (e.g. a local signing proxy).
    #[arg(long, env = "EC2_ENDPOINT")]
    endpoint: Option<String>,

    /// AWS access key id (or set `AWS_ACCESS_KEY_ID` env var).
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: String,

    /// AWS secret access key (or set `AWS_SECRET_ACCESS_KEY` env var).
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: String,

    /// When several environments share a name, use the newest instead of failing.
    #[arg(long, default_value = "false")]
    most_recent: bool,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new environment.
    Create {
        /// Environment name (must not contain '_').
        #[arg(long)]
        name: String,

        /// Environment type, a section of the configuration.
        #[arg(long = "type")]
        env_type: String,

        /// Extra VPC tags as key=value.
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,

        /// Do not pre-reserve configured addresses.
        #[arg(long, default_value = "false")]
        skip_interface_reservation: bool,
    },

    /// Reconcile an environment against configuration.
    Update {
        /// Environment name or VPC id.
        #[arg(long)]
        env: String,

        /// Only log what would change.
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Destroy an environment and everything in it.
    Destroy {
        /// Environment name or VPC id.
        #[arg(long)]
        env: String,

        /// Do not ask for confirmation.
        #[arg(long, default_value = "false")]
        yes: bool,
    },

    /// List live environments.
    List {
        /// Print JSON instead of a table.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Reconcile peering connections across every live environment.
    Peerings {
        /// Only log what would change.
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
}

fn parse_tag(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("'{value}' is not key=value")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = VpcConfig::load(&cli.config)
        .await
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let mut api = HttpEc2::new(&cli.access_key_id, &cli.secret_access_key, &cli.region)
        .context("Failed to create EC2 client")?;
    if let Some(endpoint) = &cli.endpoint {
        api = api.with_endpoint(endpoint);
    }
    let remote = Remote::new(Arc::new(api));

    let policy = if cli.most_recent {
        DuplicatePolicy::MostRecent
    } else {
        DuplicatePolicy::Fail
    };
    let lifecycle = EnvironmentLifecycle::new(remote, Arc::new(config)).with_duplicate_policy(policy);

    match cli.command {
        Commands::Create {
            name,
            env_type,
            tags,
            skip_interface_reservation,
        } => {
            let options = CreateOptions {
                tags: tags.into_iter().collect::<BTreeMap<_, _>>(),
                skip_interface_reservation,
            };
            let environment = lifecycle.create(&name, &env_type, options).await?;
            println!("\n✅ Created {} ({}) {}", environment.name, environment.vpc_id, environment.cidr);
        }

        Commands::Update { env, dry_run } => {
            let report = lifecycle.update(&env, dry_run).await?;
            let rule_changes: usize = report
                .security_group_rules
                .values()
                .map(|d| d.added.len() + d.removed.len())
                .sum();
            println!("\nUpdate of {env}{}:", if dry_run { " (dry run)" } else { "" });
            println!("  DHCP options replaced: {}", report.dhcp_options_replaced);
            println!("  Security group rule changes: {rule_changes}");
            println!("  Peerings created: {}", report.peerings.created.len());
            println!("  Peerings deleted: {}", report.peerings.deleted.len());
        }

        Commands::Destroy { env, yes } => {
            if !yes {
                bail!("Refusing to destroy {env} without --yes");
            }
            lifecycle.destroy(&env).await?;
            println!("\n✅ Destroyed {env}");
        }

        Commands::List { json } => {
            let environments = lifecycle.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&environments)?);
            } else {
                println!(
                    "\n{:<24} {:<16} {:<24} {:<18} {:<20}",
                    "NAME", "TYPE", "VPC ID", "CIDR", "CREATED"
                );
                println!("{}", "-".repeat(104));
                for env in environments {
                    println!(
                        "{:<24} {:<16} {:<24} {:<18} {:<20}",
                        env.name,
                        env.env_type,
                        env.vpc_id,
                        env.cidr.to_string(),
                        env.created_at
                            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_default()
                    );
                }
            }
        }

        Commands::Peerings { dry_run } => {
            let report = lifecycle.peering_resolver().reconcile(None, dry_run).await?;
            for connection in &report.created {
                info!(%connection, dry_run, "Created");
            }
            for connection in &report.deleted {
                info!(%connection, dry_run, "Deleted");
            }
            if report.failures > 0 {
                bail!("{} stale peering resources could not be removed", report.failures);
            }
        }
    }

    Ok(())
}
