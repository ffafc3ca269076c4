use std::collections::BTreeSet;
use std::fmt::Display;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use buildworker_rs::config::{self, BuildWorkerConfig};
use buildworker_rs::domain::{Domain, DomainStrategy, WILDCARD_DNS_SUFFIX};
use buildworker_rs::engine::Stack;
use buildworker_rs::output::Resolved;
use buildworker_rs::plan::{self, WorkerInputs, WorkerSummary};
use buildworker_rs::proxy_config;
use bw_local_provider::{JournalEntry, LocalProvider, Mode};

const DEFAULT_STATE_FILE: &str = "buildworker-state.json";

#[derive(Parser, Debug)]
#[command(
    name = "buildworker",
    version,
    about = "Build worker provisioning CLI",
    long_about = "Plans and provisions a single build worker host: a VM running a \
                  containerized reverse proxy in front of a remote build service."
)]
struct Cli {
    /// Sets a custom config file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the bootstrap document for a given domain
    Render {
        /// Worker domain, e.g. `1.2.3.4.sslip.io` or `worker-0.infra.example.com`
        #[arg(long = "domain", value_name = "NAME")]
        domain: String,
    },
    /// Print the reverse-proxy configuration for a given domain
    ProxyConfig {
        #[arg(long = "domain", value_name = "NAME")]
        domain: String,
    },
    /// Show what `up` would do, without changing anything
    Preview {
        /// State file to compare against
        #[arg(long = "state", value_name = "FILE")]
        state: Option<PathBuf>,
    },
    /// Provision the worker, or bring it in line with the configuration
    Up {
        #[arg(long = "state", value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,

        /// Also print the administrative private key
        #[arg(long = "show-secrets")]
        show_secrets: bool,
    },
    /// Delete all resources of the worker
    Down {
        #[arg(long = "state", value_name = "FILE", default_value = DEFAULT_STATE_FILE)]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        // buildworker render --domain <NAME>
        Commands::Render { domain } => {
            let domain = parse_domain(&domain)?;
            let inputs = inputs(config)?;
            let document =
                plan::bootstrap_document(&domain, inputs.container_image, &inputs.secrets)
                    .context("Failed to synthesize bootstrap document")?;
            print!("{}", document.as_str());
        }

        // buildworker proxy-config --domain <NAME>
        Commands::ProxyConfig { domain } => {
            let domain = parse_domain(&domain)?;
            let inputs = inputs(config)?;
            let proxy = proxy_config::build(&domain, &inputs.secrets.auth_password_hash);
            println!(
                "{}",
                proxy
                    .to_canonical_json()
                    .context("Failed to encode reverse-proxy configuration")?
            );
        }

        // buildworker preview [--state <FILE>]
        Commands::Preview { state } => {
            let inputs = inputs(config)?;
            let provider = match state {
                Some(path) => LocalProvider::open(Mode::Preview, &path).await?,
                None => LocalProvider::new(Mode::Preview),
            };
            let provider = Arc::new(with_zone(provider, &inputs.domain));

            let summary = run(&provider, &inputs).await?;
            print_journal(&provider.journal().await);
            print_summary(&summary, false);
        }

        // buildworker up [--state <FILE>] [--show-secrets]
        Commands::Up { state, show_secrets } => {
            let inputs = inputs(config)?;
            let provider = LocalProvider::open(Mode::Apply, &state)
                .await
                .with_context(|| format!("Failed to open state file {}", state.display()))?;
            let provider = Arc::new(with_zone(provider, &inputs.domain));

            let summary = run(&provider, &inputs).await?;
            print_journal(&provider.journal().await);
            print_summary(&summary, show_secrets);
        }

        // buildworker down [--state <FILE>]
        Commands::Down { state } => {
            let provider = LocalProvider::open(Mode::Apply, &state)
                .await
                .with_context(|| format!("Failed to open state file {}", state.display()))?;
            let deleted = provider.destroy().await?;
            print_journal(&deleted);
            event!(Level::INFO, resources = deleted.len(), "Worker destroyed");
        }
    }

    Ok(())
}

fn inputs(config: BuildWorkerConfig) -> Result<WorkerInputs> {
    config
        .into_inputs()
        .context("Invalid build worker configuration")
}

/// The local provider only knows about zones it is told exist.
fn with_zone(provider: LocalProvider, domain: &DomainStrategy) -> LocalProvider {
    match domain {
        DomainStrategy::ManagedZone {
            zone_name,
            zone_resource_group,
            ..
        } => provider.with_zone(zone_resource_group, zone_name),
        DomainStrategy::EphemeralWildcard => provider,
    }
}

/// Plan the worker, wait for every resource and drop resources that are no
/// longer declared.
async fn run(provider: &Arc<LocalProvider>, inputs: &WorkerInputs) -> Result<WorkerSummary> {
    let mut stack = Stack::new(provider.clone());
    let worker = plan::plan_build_worker(&mut stack, inputs);

    stack.settle().await.context("Provisioning failed")?;
    let summary = worker
        .resolve()
        .await
        .context("Failed to resolve worker outputs")?;

    let keep: BTreeSet<_> = stack
        .resources()
        .iter()
        .map(|r| (r.kind(), r.logical_name().to_string()))
        .collect();
    provider
        .prune(&keep)
        .await
        .context("Failed to delete stale resources")?;

    Ok(summary)
}

/// Interpret a domain given on the command line. Names under the wildcard
/// DNS service, and bare addresses, are ephemeral domains.
fn parse_domain(name: &str) -> Result<Domain> {
    let name = name.trim().trim_end_matches('.');

    let ip = name
        .strip_suffix(WILDCARD_DNS_SUFFIX)
        .and_then(|ip| ip.strip_suffix('.'))
        .unwrap_or(name);
    if let Ok(ip) = ip.parse::<Ipv4Addr>() {
        return Ok(Domain::ephemeral(ip));
    }

    match name.split_once('.') {
        Some((hostname, zone)) if !hostname.is_empty() && !zone.is_empty() => {
            Ok(Domain::ManagedRecord {
                hostname: hostname.to_string(),
                zone: zone.to_string(),
            })
        }
        _ => bail!("Invalid domain {name:?}: expected an address or <hostname>.<zone>"),
    }
}

fn print_journal(entries: &[JournalEntry]) {
    for entry in entries {
        if entry.changed.is_empty() {
            println!("{:<10} {:<18} {}", entry.action, entry.kind, entry.name);
        } else {
            println!(
                "{:<10} {:<18} {} ({})",
                entry.action,
                entry.kind,
                entry.name,
                entry.changed.join(", ")
            );
        }
    }
}

fn print_output<T: Display>(label: &str, value: &Resolved<T>) {
    match value {
        Resolved::Known(value) => println!("{label:<22}{value}"),
        Resolved::Unknown => println!("{label:<22}(known after apply)"),
    }
}

fn print_summary(summary: &WorkerSummary, show_secrets: bool) {
    println!();
    print_output("resource_group_name", &summary.resource_group_name);
    print_output("public_ip_address", &summary.public_ip_address);
    print_output("vm_name", &summary.vm_name);
    print_output("vm_id", &summary.vm_id);
    print_output("url", &summary.url);
    print_output("wildcard_url", &summary.wildcard_url);

    match &summary.ssh_private_key {
        Resolved::Known(key) if show_secrets => println!("ssh_private_key:\n{}", key.expose()),
        Resolved::Known(_) => println!("{:<22}[secret]", "ssh_private_key"),
        Resolved::Unknown => println!("{:<22}(known after apply)", "ssh_private_key"),
    }
}
