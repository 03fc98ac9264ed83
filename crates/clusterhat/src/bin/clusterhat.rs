//! ClusterHAT CLI - power sequencing and SSH key distribution for cluster nodes.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clusterhat::board::{Auxiliary, BoardController, ClusterCtrl, Switch};
use clusterhat::config::{AuthMode, RunConfig};
use clusterhat::host::{NetworkMode, NodeLabel};
use clusterhat::orchestrator::{Orchestrator, ProvisionPlan};
use clusterhat::remote::{OpenSsh, Secret};
use clusterhat::report::RunReport;

/// Exit status when the operator interrupts a run.
const EXIT_INTERRUPTED: u8 = 130;

/// Environment variable consulted before prompting for the node password.
const PASSWORD_ENV: &str = "CLUSTERHAT_PASSWORD";

/// ClusterHAT CLI - bring up ClusterHAT / ClusterCTRL nodes.
#[derive(Parser)]
#[command(name = "clusterhat")]
#[command(about = "Power ClusterHAT nodes and install SSH keys on them")]
#[command(version)]
struct Cli {
    /// Config file (defaults to `~/.config/clusterhat/config.yaml`).
    #[arg(short, long, env = "CLUSTERHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Power each node, wait for SSH, install the public key, power it off.
    Provision(ProvisionArgs),

    /// Show the board status.
    Status {
        /// Print the raw status fields as JSON.
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Switch one node slot, or `all`, on or off.
    Power {
        /// `on` or `off`.
        state: Switch,

        /// Node label (e.g. p1) or `all`.
        target: String,
    },

    /// Switch a board auxiliary on or off.
    Aux {
        /// hub, led, alert, wp or fan.
        name: Auxiliary,

        /// `on` or `off`.
        state: Switch,
    },
}

#[derive(Args)]
struct ProvisionArgs {
    /// Nodes to provision, in order (comma-separated).
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<NodeLabel>,

    /// Network mode: cnat (address translated) or cbridge (bridged).
    #[arg(long)]
    mode: Option<NetworkMode>,

    /// Seconds to wait for each node to answer.
    #[arg(long)]
    deadline: Option<u64>,

    /// Seconds between reachability attempts.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Seconds allowed for a single reachability attempt.
    #[arg(long)]
    attempt_timeout: Option<u64>,

    /// Address override for one node, as `label=address` (repeatable).
    #[arg(long = "host", value_parser = parse_host_override)]
    hosts: Vec<(NodeLabel, String)>,

    /// Login user on the nodes.
    #[arg(long)]
    user: Option<String>,

    /// Private key the nodes already trust.
    #[arg(long)]
    identity_file: Option<PathBuf>,

    /// Public key to install (defaults to `<identity-file>.pub`).
    #[arg(long)]
    public_key: Option<PathBuf>,

    /// Authenticate with the node password instead of a key.
    #[arg(long, default_value = "false")]
    password: bool,

    /// Auxiliary kept on during the run.
    #[arg(long)]
    auxiliary: Option<Auxiliary>,

    /// Print the report as JSON.
    #[arg(long, default_value = "false")]
    json: bool,
}

impl ProvisionArgs {
    fn apply(self, config: &mut RunConfig) {
        if !self.nodes.is_empty() {
            config.nodes = self.nodes;
        }
        if let Some(mode) = self.mode {
            config.network_mode = mode;
        }
        if let Some(secs) = self.deadline {
            config.overall_deadline_secs = secs;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(secs) = self.attempt_timeout {
            config.per_attempt_timeout_secs = secs;
        }
        if let Some(user) = self.user {
            config.default_username = user;
        }
        if let Some(path) = self.identity_file {
            config.identity_file = path;
        }
        if self.public_key.is_some() {
            config.public_key = self.public_key;
        }
        if self.password {
            config.auth = AuthMode::Password;
        }
        if let Some(aux) = self.auxiliary {
            config.auxiliary = aux;
        }
        for (label, address) in self.hosts {
            config.overrides.entry(label).or_default().address = Some(address);
        }
    }
}

fn parse_host_override(raw: &str) -> Result<(NodeLabel, String), String> {
    let (label, address) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected label=address, got '{raw}'"))?;
    let label = NodeLabel::parse(label).map_err(|e| e.to_string())?;
    let address = address.trim();
    if address.is_empty() {
        return Err(format!("empty address for {label}"));
    }
    Ok((label, address.to_string()))
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_secret() -> Result<Secret> {
    if let Ok(value) = std::env::var(PASSWORD_ENV) {
        info!("Using node password from {PASSWORD_ENV}");
        return Ok(Secret::new(value));
    }
    let value = dialoguer::Password::new()
        .with_prompt("Node password")
        .interact()
        .context("Failed to read node password")?;
    Ok(Secret::new(value))
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting after the current step");
            cancel.cancel();
        }
    });
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.aborted_at.is_some() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn provision(config: RunConfig, json: bool) -> Result<ExitCode> {
    config.validate().context("Invalid configuration")?;
    let secret = match config.auth {
        AuthMode::Password => Some(read_secret()?),
        AuthMode::Key => None,
    };
    let plan = ProvisionPlan::build(&config, secret).context("Invalid configuration")?;

    for node in &plan.nodes {
        info!(node = %node.label, host = %node.host, "Planned node");
    }

    let orchestrator = Orchestrator::new(
        Arc::new(ClusterCtrl::from_config(&config.board)),
        Arc::new(OpenSsh::new()),
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let report = orchestrator.run(&plan, &cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        print!("{report}");
        if report.all_succeeded() {
            println!("\n✅ All {} nodes provisioned", report.nodes.len());
        } else {
            println!("\n⚠️  Some nodes need attention");
        }
    }

    Ok(exit_code(&report))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let mut config = RunConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Provision(args) => {
            let json = args.json;
            args.apply(&mut config);
            provision(config, json).await
        }
        Commands::Status { json } => {
            let board = ClusterCtrl::from_config(&config.board);
            let status = board.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status.summary());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Power { state, target } => {
            let board = ClusterCtrl::from_config(&config.board);
            if target.eq_ignore_ascii_case("all") {
                board.power_all(state).await?;
                println!("✅ All nodes switched {state}");
            } else {
                let label = NodeLabel::parse(&target)?;
                match state {
                    Switch::On => board.power_on(&label).await?,
                    Switch::Off => board.power_off(&label).await?,
                };
                println!("✅ {} switched {state}", label.as_str().to_uppercase());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Aux { name, state } => {
            let board = ClusterCtrl::from_config(&config.board);
            board.set_auxiliary(name, state).await?;
            println!("✅ {} switched {state}", name.as_str().to_uppercase());
            Ok(ExitCode::SUCCESS)
        }
    }
}
