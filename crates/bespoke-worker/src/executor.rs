//! Stage executors (§4.4 step 3): the boundary between a worker and the
//! external scientific program for a stage kind (fragmenter, QC engine,
//! optimizer). The worker pool is agnostic to which program runs; it only
//! knows the `StageExecutor` contract.

use async_trait::async_trait;
use bespoke_shared::config::ResourceBudget;
use bespoke_shared::error::{ExecutorError, ExecutorResult};
use serde_json::Value;

/// Runs one task's input document through the program for its stage and
/// returns the output document, or a *reported* failure (§4.4 step 6) that
/// is distinct from a transient I/O error — the caller decides which path
/// applies by inspecting the `Result`.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn run(&self, input: &Value, budget: &ResourceBudget) -> ExecutorResult<Value>;
}

/// Invokes an external program as a subprocess, passing the input document
/// on stdin and reading the output document from stdout (§4.4 "invoke the
/// external executor for the stage kind"). The program is expected to exit
/// zero on success; a non-zero exit or malformed stdout is a reported
/// failure rather than a crash, since the process itself came up and ran.
pub struct SubprocessExecutor {
    program: String,
    args: Vec<String>,
}

impl SubprocessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn core_env(budget: &ResourceBudget) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(cores) = budget.core_budget {
            env.push(("BESPOKE_CORE_BUDGET".to_string(), cores.to_string()));
        }
        if let Some(mem) = budget.memory_gib_per_core {
            env.push(("BESPOKE_MEMORY_GIB_PER_CORE".to_string(), mem.to_string()));
        }
        env
    }
}

#[async_trait]
impl StageExecutor for SubprocessExecutor {
    async fn run(&self, input: &Value, budget: &ResourceBudget) -> ExecutorResult<Value> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(Self::core_env(budget))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::WorkerCrashed(format!("failed to spawn {}: {e}", self.program)))?;

        let payload = serde_json::to_vec(input).map_err(ExecutorError::internal)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ExecutorError::WorkerCrashed(format!("stdin write failed: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutorError::WorkerCrashed(format!("subprocess wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(ExecutorError::ExecutorFailed(format!(
                "{} exited with {}: {}",
                self.program, output.status, stderr
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ExecutorError::ExecutorFailed(format!("malformed output document: {e}"))
        })
    }
}

/// A deterministic stand-in executor used where no external program is
/// configured (tests, `EchoExecutor`'s namesake in dry runs): echoes the
/// input back under an `"echoed"` key, tagged with the stage kind it was
/// constructed for.
pub struct EchoExecutor {
    stage_name: String,
}

impl EchoExecutor {
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
        }
    }
}

#[async_trait]
impl StageExecutor for EchoExecutor {
    async fn run(&self, input: &Value, _budget: &ResourceBudget) -> ExecutorResult<Value> {
        Ok(serde_json::json!({
            "stage": self.stage_name,
            "echoed": input,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_executor_wraps_input() {
        let executor = EchoExecutor::new("fragmentation");
        let budget = ResourceBudget::single_core();
        let out = executor.run(&json!({"smiles": "CC"}), &budget).await.unwrap();
        assert_eq!(out["stage"], "fragmentation");
        assert_eq!(out["echoed"]["smiles"], "CC");
    }
}
