//! `bespoke` — the coordinator-commands CLI (§6.4): a `clap` derive
//! surface that either brings up a whole executor process (`launch`) or
//! talks to one already running over HTTP (`submit`, `list`, `watch`,
//! `retrieve`, `cancel`).

mod commands;
mod error;
mod output;
mod workflow_doc;

use std::path::PathBuf;

use bespoke_client::{BespokeClient, ClientConfig};
use clap::{Parser, Subcommand};
use error::CliError;

/// Default coordinator address a bare `bespoke` invocation talks to,
/// matching `ExecutorConfig::default().bind_address` (§6.2).
const DEFAULT_COORDINATOR_URL: &str = "http://127.0.0.1:15323";

#[derive(Debug, Parser)]
#[command(name = "bespoke", version, about = "Bespoke Executor coordinator CLI", styles = output::clap_styles())]
struct Cli {
    /// Coordinator base URL for every command except `launch`.
    #[arg(long, global = true, env = "BESPOKE_COORDINATOR_URL", default_value = DEFAULT_COORDINATOR_URL)]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring up a coordinator, its worker pools, and its HTTP surface in this process (§4.7).
    Launch(LaunchArgs),
    /// Submit one workflow document, producing a new submission (§6.1 `POST /submissions`).
    Submit {
        /// Path to a complete workflow document (or a JSON array of several). Mutually exclusive with --smiles.
        #[arg(long, conflicts_with = "smiles")]
        file: Option<PathBuf>,
        /// SMILES string for the parent molecule, folded into the chosen workflow template.
        #[arg(long, conflicts_with = "file")]
        smiles: Option<String>,
        /// Name of a bundled workflow template (only "default" ships today).
        #[arg(long, conflicts_with = "workflow_file")]
        workflow: Option<String>,
        /// Path to a custom workflow template to use instead of a bundled name.
        #[arg(long = "workflow-file", conflicts_with = "workflow")]
        workflow_file: Option<PathBuf>,
    },
    /// List submissions, optionally filtered by status (§6.1 `GET /submissions`).
    List {
        /// One of waiting, running, success, errored, cancelled.
        #[arg(long)]
        status: Option<String>,
    },
    /// Poll a submission until it reaches a terminal status.
    Watch {
        #[arg(long)]
        id: u64,
    },
    /// Fetch a successful submission's result and write it to a file.
    Retrieve {
        #[arg(long)]
        id: u64,
        #[arg(long)]
        output: PathBuf,
        /// Base force field to fold the result's parameters into.
        #[arg(long = "force-field")]
        force_field: Option<PathBuf>,
    },
    /// Cancel a submission (§6.1 `DELETE /submissions/{id}`, idempotent).
    Cancel {
        #[arg(long)]
        id: u64,
    },
}

#[derive(Debug, clap::Args)]
pub(crate) struct LaunchArgs {
    /// Result Store directory (§6.2 default `./bespoke-state`).
    #[arg(long)]
    directory: Option<String>,
    #[arg(long)]
    n_fragmenter_workers: Option<usize>,
    #[arg(long)]
    n_optimizer_workers: Option<usize>,
    #[arg(long)]
    n_qc_compute_workers: Option<usize>,
    #[arg(long)]
    qc_compute_n_cores: Option<usize>,
    #[arg(long)]
    qc_compute_max_mem: Option<f64>,
    /// HTTP bind address (§6.2 default `127.0.0.1:15323`).
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;

    if let Err(err) = result {
        output::error(&err);
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Launch(args) => commands::handle_launch(args).await,
        other => {
            let config = ClientConfig::new(&cli.coordinator).map_err(|e| CliError::UserError(e.to_string()))?;
            let client = BespokeClient::new(config).map_err(|e| CliError::UserError(e.to_string()))?;
            match other {
                Commands::Submit { file, smiles, workflow, workflow_file } => {
                    commands::handle_submit(&client, file, smiles, workflow, workflow_file).await
                }
                Commands::List { status } => commands::handle_list(&client, status).await,
                Commands::Watch { id } => commands::handle_watch(&client, id).await,
                Commands::Retrieve { id, output, force_field } => {
                    commands::handle_retrieve(&client, id, output, force_field).await
                }
                Commands::Cancel { id } => commands::handle_cancel(&client, id).await,
                Commands::Launch(_) => unreachable!("handled above"),
            }
        }
    }
}
