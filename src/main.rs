//! Burrow CLI - Forwarding rule tooling
//!
//! Validate forwarding shorthands and run them locally over an in-process
//! session.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use burrow_proto::RemoteEndpoint;
use burrow_proxy::{ForwardConfig, ProxyContext, ProxyState, TargetDialer};
use burrow_transport::fixed_session;
use burrow_transport::memory::MemorySession;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Burrow - Port forwarding over multiplexed tunnel sessions
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - Port forwarding over multiplexed tunnel sessions")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse forwarding rules and print their canonical form
    #[command(long_about = r#"
Parse forwarding rules and print each one in canonical form.
Exits with an error on the first rule that does not parse.

EXAMPLES:
  burrow check 3000 8080:example.com:80 R:2222:localhost:22
  burrow check --config burrow.yaml
    "#)]
    Check(RuleArgs),

    /// Run forwarding rules locally until Ctrl+C
    #[command(long_about = r#"
Bind every rule's local side and forward accepted connections through an
in-process session to the rule's target. Reverse rules are served the
same way, since both ends run in this process.

EXAMPLES:
  # Forward local port 5433 to a database
  burrow forward 5433:127.0.0.1:5432

  # Rules from a file
  burrow forward --config burrow.yaml

ENVIRONMENT VARIABLES:
  BURROW_CONFIG  Path to a YAML file with a `remotes` list
    "#)]
    Forward(RuleArgs),
}

#[derive(Args, Debug)]
struct RuleArgs {
    /// YAML file with a `remotes` list
    #[arg(short, long, env = "BURROW_CONFIG")]
    config: Option<PathBuf>,

    /// Forwarding rules, e.g. 3000, 8080:example.com:80, R:2222:localhost:22, socks
    remotes: Vec<String>,
}

impl RuleArgs {
    /// Rules from the config file first, then the command line
    fn load(&self) -> Result<ForwardConfig> {
        let mut config = match &self.config {
            Some(path) => ForwardConfig::load(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ForwardConfig::default(),
        };

        for remote in &self.remotes {
            let endpoint: RemoteEndpoint = remote
                .parse()
                .with_context(|| format!("Invalid rule '{}'", remote))?;
            config.remotes.push(endpoint);
        }

        if config.remotes.is_empty() {
            bail!("No forwarding rules given");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Check(args) => check(&args),
        Commands::Forward(args) => forward(&args).await,
    }
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn check(args: &RuleArgs) -> Result<()> {
    if let Some(path) = &args.config {
        let config = ForwardConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        for endpoint in &config.remotes {
            println!("{} => {}", path.display(), endpoint);
        }
    }

    for remote in &args.remotes {
        let endpoint: RemoteEndpoint = remote
            .parse()
            .with_context(|| format!("Invalid rule '{}'", remote))?;
        println!("{} => {}", remote, endpoint);
    }

    Ok(())
}

async fn forward(args: &RuleArgs) -> Result<()> {
    let config = args.load()?;
    let cancel = CancellationToken::new();

    let (session, acceptor) = MemorySession::pair();
    let dialer = TargetDialer::new();
    let dialer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { dialer.serve(acceptor, cancel).await }
    });

    let logger = info_span!("burrow");
    let proxies = config.proxies(&logger, fixed_session(session));
    let ctx = ProxyContext::new(cancel.clone());

    for proxy in &proxies {
        if proxy.endpoint().is_socks() {
            warn!("{}: SOCKS rules need a SOCKS server on the far side", proxy.label());
        }
        if let Err(e) = proxy.start(&ctx).await {
            error!("{}", e);
            cancel.cancel();
            return Err(e).context("Failed to start forwarding");
        }
    }

    info!("Forwarding {} rule(s), press Ctrl+C to stop", proxies.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");

    cancel.cancel();
    for proxy in &proxies {
        let mut state = proxy.subscribe_state();
        let _ = state
            .wait_for(|s| *s == ProxyState::Closed)
            .await;
    }
    let _ = dialer_task.await;

    Ok(())
}
