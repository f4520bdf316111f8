use std::path::Path;
use std::sync::Arc;

/// Reset SIGPIPE to default behavior so piping (e.g. `stratus list | head`) exits cleanly
/// instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use stratus::cloud::onprem::OnpremCloud;
use stratus::cloud::test::TestCloud;
use stratus::cloud::CloudRegistry;
use stratus::config::{load_settings, DEFAULT_SETTINGS_FILE};
use stratus::output::formatter;
use stratus::store::backend::ServerStore;
use stratus::store::sqlite::SqliteBackend;
use stratus::{Cloud, Configuration, Orchestrator, State};

/// stratus - compute server lifecycle orchestrator
#[derive(Parser)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ./stratus.yaml when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Working directory for the .stratus state database
    #[arg(short, long, default_value = ".stratus")]
    working_dir: String,

    /// Account the command acts as
    #[arg(short, long, default_value = "local")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state database
    Init,

    /// Create a compute server (starts out deprovisioned)
    Create {
        /// Project the server belongs to
        #[arg(short, long)]
        project: String,

        /// Cloud backend (test, google-cloud, lambda-cloud, fluid-stack, core-weave, onprem)
        #[arg(long, default_value = "test")]
        cloud: String,

        /// Display name
        #[arg(short, long, default_value = "")]
        title: String,

        /// Cloud-specific configuration as a JSON object
        #[arg(long, default_value = "{}")]
        configuration: String,
    },

    /// List compute servers visible to the account
    List,

    /// Show one compute server
    Show { id: i64 },

    /// Start a compute server and wait until it is running
    Start { id: i64 },

    /// Stop a compute server
    Stop { id: i64 },

    /// Release all backend resources of a compute server
    Deprovision { id: i64 },

    /// Suspend a running compute server
    Suspend { id: i64 },

    /// Resume a suspended compute server
    Resume { id: i64 },

    /// Reboot a running compute server
    Reboot { id: i64 },

    /// Query the live state from the backend
    State { id: i64 },

    /// Change configuration keys (JSON object; null removes a key)
    Configure {
        id: i64,

        changes: String,

        /// Only validate the change
        #[arg(long)]
        dry_run: bool,
    },

    /// Show hourly cost and purchase history
    Cost { id: i64 },

    /// Show network egress over a recent window
    NetworkUsage {
        id: i64,

        /// Window length in hours
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Compare the configuration against what the server was started with
    Drift { id: i64 },

    /// Print the boot parameters for the server's startup script
    StartupParams { id: i64 },

    /// Give another account read access to a project's servers
    Share {
        /// Project to share
        #[arg(short, long)]
        project: String,

        /// Account to grant access to
        #[arg(long = "with")]
        with_account: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init => cmd_init(&cli).await,
        Commands::Create {
            ref project,
            ref cloud,
            ref title,
            ref configuration,
        } => cmd_create(&cli, project, cloud, title, configuration).await,
        Commands::List => cmd_list(&cli).await,
        Commands::Show { id } => cmd_show(&cli, id).await,
        Commands::Start { id } => cmd_lifecycle(&cli, "start", id).await,
        Commands::Stop { id } => cmd_lifecycle(&cli, "stop", id).await,
        Commands::Deprovision { id } => cmd_lifecycle(&cli, "deprovision", id).await,
        Commands::Suspend { id } => cmd_lifecycle(&cli, "suspend", id).await,
        Commands::Resume { id } => cmd_lifecycle(&cli, "resume", id).await,
        Commands::Reboot { id } => cmd_lifecycle(&cli, "reboot", id).await,
        Commands::State { id } => cmd_lifecycle(&cli, "state", id).await,
        Commands::Configure {
            id,
            ref changes,
            dry_run,
        } => cmd_configure(&cli, id, changes, dry_run).await,
        Commands::Cost { id } => cmd_cost(&cli, id).await,
        Commands::NetworkUsage { id, hours } => cmd_network_usage(&cli, id, hours).await,
        Commands::Drift { id } => cmd_drift(&cli, id).await,
        Commands::StartupParams { id } => cmd_startup_params(&cli, id).await,
        Commands::Share {
            ref project,
            ref with_account,
        } => cmd_share(&cli, project, with_account).await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_backend(working_dir: &str) -> Result<SqliteBackend> {
    let db_path = format!("{}/stratus.db", working_dir);
    SqliteBackend::open(&db_path)
}

/// Open the state database and wire the orchestrator to it, with the
/// built-in adapters registered.
async fn orchestrator(cli: &Cli) -> Result<(Orchestrator, Arc<SqliteBackend>)> {
    let settings_file = match &cli.config {
        Some(path) => load_settings(Path::new(path), true)?,
        None => load_settings(Path::new(DEFAULT_SETTINGS_FILE), false)?,
    };
    let settings = settings_file.orchestrator_settings()?;

    if !Path::new(&cli.working_dir).exists() {
        bail!(
            "No state directory at '{}'. Run 'stratus init' first.",
            cli.working_dir
        );
    }
    let backend = Arc::new(open_backend(&cli.working_dir)?);
    backend.initialize().await?;

    let clouds = CloudRegistry::new()
        .with(Arc::new(
            TestCloud::new().with_boot_polls(settings_file.clouds.test_boot_polls),
        ))
        .with(Arc::new(OnpremCloud::new(
            &settings_file.clouds.onprem_api_server,
        )));

    let orchestrator = Orchestrator::sqlite(
        backend.clone(),
        Arc::new(clouds),
        settings,
        settings_file.dns.enabled,
    );
    Ok((orchestrator, backend))
}

fn parse_object(json: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    match serde_json::from_str(json).context("Changes must be valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("Changes must be a JSON object, got: {}", other),
    }
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_init(cli: &Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.working_dir)?;
    let backend = open_backend(&cli.working_dir)?;
    backend.initialize().await?;
    formatter::print_success("State database initialized.");
    Ok(())
}

async fn cmd_create(
    cli: &Cli,
    project: &str,
    cloud: &str,
    title: &str,
    configuration: &str,
) -> Result<()> {
    let cloud: Cloud = cloud.parse()?;
    let configuration = Configuration::parse(configuration, cloud)?;
    let (orchestrator, _) = orchestrator(cli).await?;
    let server = orchestrator
        .create(&cli.account, project, title, configuration)
        .await?;
    formatter::print_success(&format!(
        "Created compute server {} on {} ({}).",
        server.id, server.cloud, server.state
    ));
    Ok(())
}

async fn cmd_list(cli: &Cli) -> Result<()> {
    let (orchestrator, _) = orchestrator(cli).await?;
    let servers = orchestrator.list(&cli.account).await?;
    formatter::print_server_list(&servers);
    Ok(())
}

async fn cmd_show(cli: &Cli, id: i64) -> Result<()> {
    let (orchestrator, _) = orchestrator(cli).await?;
    let server = orchestrator.get(&cli.account, id).await?;
    formatter::print_server_detail(&server);
    Ok(())
}

async fn cmd_lifecycle(cli: &Cli, operation: &str, id: i64) -> Result<()> {
    let (orchestrator, _) = orchestrator(cli).await?;
    let account = cli.account.as_str();
    let result = match operation {
        "start" => orchestrator.start(account, id).await,
        "stop" => orchestrator.stop(account, id).await,
        "deprovision" => orchestrator.deprovision(account, id).await,
        "suspend" => orchestrator.suspend(account, id).await,
        "resume" => orchestrator.resume(account, id).await,
        "reboot" => orchestrator.reboot(account, id).await,
        _ => orchestrator.state(account, id).await,
    };

    match result {
        Ok(state) => {
            formatter::print_state(id, state);
            if operation == "reboot" && state != State::Running {
                println!(
                    "  {}",
                    format!("Run 'stratus state {}' to follow the reboot.", id).dimmed()
                );
            }
            Ok(())
        }
        Err(e) => {
            formatter::print_error(&format!("{} failed: {}", operation, e));
            Err(e.into())
        }
    }
}

async fn cmd_configure(cli: &Cli, id: i64, changes: &str, dry_run: bool) -> Result<()> {
    let changes = parse_object(changes)?;
    let (orchestrator, _) = orchestrator(cli).await?;

    if dry_run {
        orchestrator
            .validate_configuration_change(&cli.account, id, &changes)
            .await?;
        formatter::print_success("Configuration change is valid.");
        return Ok(());
    }

    let server = orchestrator
        .set_configuration(&cli.account, id, &changes)
        .await?;
    formatter::print_success(&format!("Configuration of compute server {} updated.", id));
    formatter::print_server_detail(&server);
    Ok(())
}

async fn cmd_cost(cli: &Cli, id: i64) -> Result<()> {
    let (orchestrator, backend) = orchestrator(cli).await?;
    let server = orchestrator.get(&cli.account, id).await?;
    let cost = orchestrator.cost(&cli.account, id).await?;
    let purchases = backend.list_purchases(id)?;
    formatter::print_cost(&server, cost, &purchases);
    Ok(())
}

async fn cmd_network_usage(cli: &Cli, id: i64, hours: u32) -> Result<()> {
    let (orchestrator, _) = orchestrator(cli).await?;
    let end = chrono::Utc::now();
    let start = end - chrono::Duration::hours(i64::from(hours));
    let usage = orchestrator
        .network_usage(&cli.account, id, start, end)
        .await?;
    formatter::print_network_usage(id, hours, &usage);
    Ok(())
}

async fn cmd_drift(cli: &Cli, id: i64) -> Result<()> {
    let (orchestrator, _) = orchestrator(cli).await?;
    let drifts = orchestrator.drift(&cli.account, id).await?;
    formatter::print_drift(id, &drifts);
    Ok(())
}

async fn cmd_startup_params(cli: &Cli, id: i64) -> Result<()> {
    let (orchestrator, _) = orchestrator(cli).await?;
    // Only the owner may read a server's boot parameters from the CLI.
    orchestrator.get(&cli.account, id).await.and_then(|server| {
        if server.account_id == cli.account {
            Ok(())
        } else {
            Err(stratus::ServerError::Unauthorized {
                account_id: cli.account.clone(),
                id,
                action: "read the startup parameters of",
            })
        }
    })?;
    let params = orchestrator.startup_params(id).await?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

async fn cmd_share(cli: &Cli, project: &str, with_account: &str) -> Result<()> {
    let (_, backend) = orchestrator(cli).await?;
    let owns_project = backend
        .list(&cli.account)
        .await?
        .iter()
        .any(|s| s.project_id == project && s.account_id == cli.account);
    if !owns_project {
        bail!(
            "Account '{}' owns no compute servers in project '{}'.",
            cli.account,
            project
        );
    }
    backend.add_collaborator(project, with_account).await?;
    formatter::print_success(&format!(
        "Shared project {} with {}.",
        project, with_account
    ));
    Ok(())
}
