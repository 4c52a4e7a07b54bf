//! Command handlers for the `bespoke` CLI (§6.4), one function per
//! subcommand, delegating to `bespoke-client` for everything that talks to
//! a running coordinator and to `bespoke-orchestration::Supervisor`
//! directly for `launch`.

use std::path::PathBuf;
use std::time::Duration;

use bespoke_client::types::SubmissionStatusFilter;
use bespoke_client::BespokeClient;
use bespoke_orchestration::Supervisor;
use bespoke_shared::config::ExecutorConfig;
use serde_json::Value;
use tokio::signal;

use crate::error::{CliError, CliResult};
use crate::output;
use crate::workflow_doc::build_workflows;
use crate::LaunchArgs;

/// Brings up a full executor process in this one (§4.7): Result Store,
/// Task Queue, Coordinator HTTP server, and all three worker pools, using
/// the CLI flags as overrides over `ExecutorConfig::from_env()`.
pub(crate) async fn handle_launch(args: LaunchArgs) -> CliResult<()> {
    let mut config = ExecutorConfig::from_env();

    if let Some(directory) = args.directory {
        config.result_store_dir = directory;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(n) = args.n_fragmenter_workers {
        config.worker_counts.fragment_workers = n;
    }
    if let Some(n) = args.n_optimizer_workers {
        config.worker_counts.optimize_workers = n;
    }
    if let Some(n) = args.n_qc_compute_workers {
        config.worker_counts.qc_workers = n;
    }
    if let Some(n) = args.qc_compute_n_cores {
        config.qc_core_budget.core_budget = Some(n);
    }
    if let Some(gib) = args.qc_compute_max_mem {
        config.qc_core_budget.memory_gib_per_core = Some(gib);
    }

    output::dim(format!("bringing up coordinator on {}", config.bind_address));
    let mut supervisor = Supervisor::bootstrap(config.clone())
        .await
        .map_err(|e| CliError::Unreachable(format!("failed to bootstrap the executor: {e}")))?;
    output::success(format!("bespoke-executor listening on {}", config.bind_address));

    shutdown_signal().await;
    output::dim("shutdown signal received, draining in-flight work");

    match tokio::time::timeout(config.shutdown_grace + Duration::from_secs(5), supervisor.stop()).await {
        Ok(Ok(())) => output::success("supervisor stopped cleanly"),
        Ok(Err(e)) => output::error(format!("supervisor reported an error while stopping: {e}")),
        Err(_) => output::error("supervisor shutdown exceeded its grace period, exiting anyway"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub(crate) async fn handle_submit(
    client: &BespokeClient,
    file: Option<PathBuf>,
    smiles: Option<String>,
    workflow: Option<String>,
    workflow_file: Option<PathBuf>,
) -> CliResult<()> {
    let workflows = build_workflows(file.as_deref(), smiles.as_deref(), workflow.as_deref(), workflow_file.as_deref())?;
    let submissions = client.submit(workflows).await?;
    for submission in &submissions {
        output::success(format!("submitted #{}", submission.id));
        output::label("  self", &submission.self_url);
    }
    Ok(())
}

pub(crate) async fn handle_list(client: &BespokeClient, status: Option<String>) -> CliResult<()> {
    let filter = match status {
        None => None,
        Some(s) => Some(parse_status_filter(&s)?),
    };
    let response = client.list(filter, None, None).await?;
    if response.items.is_empty() {
        output::dim("no submissions found");
        return Ok(());
    }
    for submission in &response.items {
        output::item(format!("#{} — {}", submission.id, submission.status));
    }
    if response.next.is_some() {
        output::dim("more results available; pass --cursor to page further");
    }
    Ok(())
}

fn parse_status_filter(s: &str) -> CliResult<SubmissionStatusFilter> {
    match s {
        "waiting" => Ok(SubmissionStatusFilter::Waiting),
        "running" => Ok(SubmissionStatusFilter::Running),
        "success" => Ok(SubmissionStatusFilter::Success),
        "errored" => Ok(SubmissionStatusFilter::Errored),
        "cancelled" => Ok(SubmissionStatusFilter::Cancelled),
        other => Err(CliError::UserError(format!(
            "invalid status filter '{other}' (expected one of waiting, running, success, errored, cancelled)"
        ))),
    }
}

/// Polls `GET /submissions/{id}` until the submission reaches a terminal
/// status (§3), printing stage transitions as they're observed.
pub(crate) async fn handle_watch(client: &BespokeClient, id: u64) -> CliResult<()> {
    let mut last_printed = Vec::new();
    loop {
        let view = client.get(id).await?;
        let stage_statuses: Vec<(String, String)> =
            view.stages.iter().map(|s| (s.name.clone(), s.status.clone())).collect();
        if stage_statuses != last_printed {
            output::header(format!("submission #{id}: {}", view.status));
            for (name, status) in &stage_statuses {
                output::label(format!("  {name}"), status);
            }
            last_printed = stage_statuses;
        }
        if view.is_terminal() {
            return finish_on_terminal(&view.status, view.error.as_deref());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

fn finish_on_terminal(status: &str, error: Option<&str>) -> CliResult<()> {
    match status {
        "success" => {
            output::success("submission reached success");
            Ok(())
        }
        "errored" => Err(CliError::SubmissionErrored(error.unwrap_or("no error detail recorded").to_string())),
        "cancelled" => Err(CliError::SubmissionCancelled),
        other => Err(CliError::UserError(format!("unexpected terminal status '{other}'"))),
    }
}

/// Fetches a completed submission's result and writes it to `--output`,
/// optionally folded over a base force field (§6.4 `--force-field`). The
/// combination logic itself belongs to the force-field combination
/// utility (§1 "out of scope"); this performs the shallow merge that
/// utility's CLI-facing contract describes — result keys win over the
/// base document's.
pub(crate) async fn handle_retrieve(
    client: &BespokeClient,
    id: u64,
    output_path: PathBuf,
    force_field: Option<PathBuf>,
) -> CliResult<()> {
    let view = client.get(id).await?;
    if view.status != "success" {
        return finish_on_terminal(&view.status, view.error.as_deref());
    }
    let result = view
        .result
        .ok_or_else(|| CliError::UserError(format!("submission #{id} succeeded but carries no result document")))?;

    let combined = match force_field {
        Some(path) => combine_force_field(&path, result)?,
        None => result,
    };

    let rendered = serde_json::to_string_pretty(&combined)
        .map_err(|e| CliError::UserError(format!("failed to render result as JSON: {e}")))?;
    std::fs::write(&output_path, rendered)
        .map_err(|e| CliError::UserError(format!("failed to write {}: {e}", output_path.display())))?;
    output::success(format!("wrote {}", output_path.display()));
    Ok(())
}

fn combine_force_field(base_path: &std::path::Path, result: Value) -> CliResult<Value> {
    let base_raw = std::fs::read_to_string(base_path)
        .map_err(|e| CliError::UserError(format!("cannot read force field {}: {e}", base_path.display())))?;
    let base: Value = serde_json::from_str(&base_raw)
        .map_err(|e| CliError::UserError(format!("force field {} is not valid JSON: {e}", base_path.display())))?;

    let (mut base_obj, result_obj) = match (base, result) {
        (Value::Object(b), Value::Object(r)) => (b, r),
        _ => return Err(CliError::UserError("both the base force field and the result must be JSON objects".into())),
    };
    for (key, value) in result_obj {
        base_obj.insert(key, value);
    }
    Ok(Value::Object(base_obj))
}

pub(crate) async fn handle_cancel(client: &BespokeClient, id: u64) -> CliResult<()> {
    client.cancel(id).await?;
    output::success(format!("submission #{id} cancelled"));
    Ok(())
}
