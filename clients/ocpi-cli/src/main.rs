//! ocpi-cli - OCPI credentials registration from the command line

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ocpi::{
    AttemptOutcome, AttemptReport, FilePeerStore, HttpTransport, PeerConfig, PeerStore, Registrar,
    RegistrarConfig, TracingObserver, VersionId,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local name for the peer; records are stored under it
    #[arg(short, long, env = "OCPI_PEER_ID", default_value = "default")]
    peer: String,

    /// The peer's versions endpoint
    #[arg(short, long, env = "OCPI_PEER_URL")]
    url: Option<String>,

    /// Token the peer handed over out of band (Token A)
    #[arg(short, long, env = "OCPI_PEER_TOKEN")]
    token: Option<String>,

    /// Config directory (default: ~/.ocpi-cli)
    #[arg(long, env = "OCPI_CLI_HOME")]
    config_dir: Option<PathBuf>,

    /// Log as JSON lines instead of human-readable text
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the versions a peer offers and the one that would be selected
    Versions,

    /// Register with a peer (POST), or rotate if already registered (PUT)
    Register {
        /// Negotiate exactly this version
        #[arg(long)]
        version: Option<String>,
    },

    /// Issue new credentials to a registered peer (PUT)
    Rotate,

    /// End the relationship with a peer (DELETE)
    Unregister,

    /// Fetch the peer's view of our credentials (GET)
    Credentials,

    /// Show the locally stored record for a peer
    Show,

    /// List all peers with a stored record
    List,
}

fn config_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(ref dir) = cli.config_dir {
        return Ok(dir.clone());
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".ocpi-cli"))
}

fn create_store(cli: &Cli) -> Result<Arc<FilePeerStore>> {
    let dir = config_dir(cli)?.join("peers");
    Ok(Arc::new(
        FilePeerStore::new(dir).context("Failed to open peer store")?,
    ))
}

fn create_registrar(cli: &Cli) -> Result<Registrar> {
    let config = RegistrarConfig::from_env().context("Invalid OCPI_* configuration")?;
    let transport = HttpTransport::with_timeout(config.request_timeout);
    let registrar = Registrar::new(Arc::new(transport), create_store(cli)?, config);
    registrar.bus().subscribe(Arc::new(TracingObserver));
    Ok(registrar)
}

fn peer_config(cli: &Cli) -> Result<PeerConfig> {
    let url = cli
        .url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("--url (or OCPI_PEER_URL) is required"))?;
    let mut peer = PeerConfig::new(&cli.peer, url);
    if let Some(token) = &cli.token {
        peer = peer.with_bootstrap_token(token);
    }
    Ok(peer)
}

/// Show the first and last few characters of a token.
fn mask(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

fn print_report(report: &AttemptReport) {
    let state = report.attempt.state.to_string();
    let state = match report.outcome() {
        Some(AttemptOutcome::Registered) | Some(AttemptOutcome::Deregistered) => state.green(),
        Some(_) => state.red(),
        None => state.normal(),
    };
    println!("  State:       {}", state);
    println!(
        "  Correlation: {}",
        report.attempt.correlation_id.to_string().dimmed()
    );
    if let Some(version) = report.attempt.version() {
        println!("  Version:     {}", version.to_string().cyan());
    }
    if let Some(url) = &report.attempt.credentials_url {
        println!("  Endpoint:    {}", url);
    }
    if let Some(creds) = &report.credentials {
        println!("  Peer:        {}", creds.business_details.name);
        println!("  Peer token:  {}", mask(&creds.token));
        println!("  Peer URL:    {}", creds.url);
    }
    for error in &report.observer_errors {
        println!("  {} {}", "Observer error:".yellow(), error);
    }
}

async fn cmd_versions(cli: &Cli) -> Result<()> {
    let registrar = create_registrar(cli)?;
    let peer = peer_config(cli)?;
    println!(
        "{}",
        format!("Fetching versions from {}...", peer.versions_url).green()
    );

    let mut registration = registrar.begin(&peer);
    registration.request_versions().await?;

    if registration.versions().is_empty() {
        println!("{}", "Peer offers no versions.".yellow());
        return Ok(());
    }

    println!();
    println!("{}", "Offered Versions:".cyan().bold());
    for info in registration.versions() {
        let accepted = if registrar.config().catalog.accepts(&info.version) {
            "supported".green()
        } else {
            "unsupported".dimmed()
        };
        println!("  {} [{}] - {}", info.version, accepted, info.url);
    }

    match registration.select_version().await {
        Ok(selected) => println!(
            "\n  Selected: {}",
            selected.version.to_string().cyan().bold()
        ),
        Err(e) => println!("\n  {} {}", "No selection:".red(), e),
    }

    Ok(())
}

async fn cmd_register(cli: &Cli, version: Option<&str>) -> Result<()> {
    let registrar = create_registrar(cli)?;
    let peer = peer_config(cli)?;
    println!("{}", format!("Registering with {}...", peer.peer_id).green());

    let report = registrar
        .register(&peer, version.map(VersionId::new))
        .await
        .context("Registration failed")?;

    println!("{}", "Registration successful!".green().bold());
    print_report(&report);
    Ok(())
}

async fn cmd_rotate(cli: &Cli) -> Result<()> {
    let registrar = create_registrar(cli)?;
    let peer = peer_config(cli)?;
    println!(
        "{}",
        format!("Rotating credentials with {}...", peer.peer_id).green()
    );

    let report = registrar.rotate(&peer).await.context("Rotation failed")?;

    println!("{}", "Credentials rotated!".green().bold());
    print_report(&report);
    Ok(())
}

async fn cmd_unregister(cli: &Cli) -> Result<()> {
    let registrar = create_registrar(cli)?;
    let peer = peer_config(cli)?;
    println!(
        "{}",
        format!("Unregistering from {}...", peer.peer_id).yellow()
    );

    let report = registrar
        .unregister(&peer)
        .await
        .context("Unregistration failed")?;

    println!("{}", "Unregistered.".green().bold());
    print_report(&report);
    Ok(())
}

async fn cmd_credentials(cli: &Cli) -> Result<()> {
    let registrar = create_registrar(cli)?;
    let peer = peer_config(cli)?;

    let report = registrar
        .fetch_credentials(&peer)
        .await
        .context("Failed to fetch credentials")?;

    println!("{}", "Peer credentials:".cyan().bold());
    print_report(&report);
    Ok(())
}

async fn cmd_show(cli: &Cli) -> Result<()> {
    let store = create_store(cli)?;
    let record = store
        .load(&cli.peer)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No record stored for peer: {}", cli.peer))?;

    println!("{}", format!("Peer {}", record.peer_id).cyan().bold());
    match &record.default_version {
        Some(version) => println!("  Default version: {}", version),
        None => println!("  Default version: {}", "-".dimmed()),
    }

    match &record.relationship {
        Some(rel) => {
            println!("  Status:          {}", "REGISTERED".green());
            println!("  Version:         {}", rel.version);
            println!("  Endpoint:        {}", rel.credentials_url);
            println!("  Registered at:   {}", rel.registered_at);
            println!("  Our token:       {}", mask(&rel.local.token));
            println!("  Peer token:      {}", mask(&rel.remote.token));
            println!("  Peer roles:");
            for role in &rel.remote.roles {
                println!("    {} {}*{}", role.role, role.country_code, role.party_id);
            }
        }
        None => println!("  Status:          {}", "NOT REGISTERED".yellow()),
    }

    Ok(())
}

async fn cmd_list(cli: &Cli) -> Result<()> {
    let store = create_store(cli)?;
    let peers = store.list().await?;

    println!("{}", "Stored peers:".cyan().bold());
    if peers.is_empty() {
        println!("{}", "  (none)".yellow());
        return Ok(());
    }

    for peer_id in peers {
        let registered = store
            .load(&peer_id)
            .await?
            .is_some_and(|r| r.is_registered());
        let status = if registered {
            "REGISTERED".green()
        } else {
            "NOT REGISTERED".yellow()
        };
        println!("  {} [{}]", peer_id, status);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ocpi=info,ocpi_cli=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config_dir = config_dir(&cli)?;
    std::fs::create_dir_all(&config_dir)?;
    tracing::debug!(config_dir = %config_dir.display(), "Using config directory");

    match &cli.command {
        Commands::Versions => cmd_versions(&cli).await,
        Commands::Register { version } => cmd_register(&cli, version.as_deref()).await,
        Commands::Rotate => cmd_rotate(&cli).await,
        Commands::Unregister => cmd_unregister(&cli).await,
        Commands::Credentials => cmd_credentials(&cli).await,
        Commands::Show => cmd_show(&cli).await,
        Commands::List => cmd_list(&cli).await,
    }
}
