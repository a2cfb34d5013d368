use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use super::adapter::{AllocationPayload, RenderAdapter, TaskReporter};
use crate::error::Result;

/// Outcome of rendering one frame.
#[derive(Debug, PartialEq)]
pub struct FrameResult {
    pub frame: i64,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl FrameResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Renders each frame by running `parameters.command` through `sh -c`.
///
/// `{frame}` in the command is replaced with the frame number, and the
/// job environment is exported to the child process. Frames run one after
/// another; the first failing frame fails the allocation.
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    kind: String,
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new("shell")
    }
}

impl ShellAdapter {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }

    pub fn command_for(template: &str, frame: i64) -> String {
        template.replace("{frame}", &frame.to_string())
    }

    /// Run one frame's command.
    pub async fn execute(&self, command: &str, frame: i64, payload: &AllocationPayload) -> FrameResult {
        tracing::info!(
            job_id = payload.job,
            allocation_id = payload.allocation,
            frame,
            command,
            "Rendering frame"
        );

        let envs = payload.environment.iter().map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        });

        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        Self::process_output(frame, result)
    }

    fn process_output(frame: i64, result: std::io::Result<std::process::Output>) -> FrameResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let exit_code = output.status.code();

                let error = if output.status.success() {
                    None
                } else if stderr.is_empty() {
                    Some(format!("Exit code: {:?}", exit_code))
                } else {
                    Some(stderr)
                };

                tracing::info!(frame, exit_code = ?exit_code, ok = error.is_none(), "Frame finished");

                FrameResult {
                    frame,
                    exit_code,
                    output: (!stdout.is_empty()).then_some(stdout),
                    error,
                }
            }
            Err(e) => {
                tracing::error!(frame, error = %e, "Failed to spawn frame command");
                FrameResult {
                    frame,
                    exit_code: None,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl RenderAdapter for ShellAdapter {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn render(&self, payload: AllocationPayload, reporter: TaskReporter) -> Result<()> {
        let Some(template) = payload.parameters.get("command").and_then(Value::as_str) else {
            return reporter
                .fail_allocation(payload.allocation, "parameters.command is missing")
                .await;
        };

        let total = payload.tasks.len();
        for (done, &(task_id, frame)) in payload.tasks.iter().enumerate() {
            reporter.start_task(task_id).await?;
            let result = self
                .execute(&Self::command_for(template, frame), frame, &payload)
                .await;
            match result.error {
                None => reporter.finish_task(task_id).await?,
                Some(reason) => {
                    // Failing one task fails its allocation on the coordinator.
                    return reporter.fail_task(task_id, &reason).await;
                }
            }
            reporter.progress((done + 1) as f64 * 100.0 / total as f64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn payload(command: &str) -> AllocationPayload {
        let mut parameters = Map::new();
        parameters.insert("command".into(), json!(command));
        let mut environment = Map::new();
        environment.insert("SCENE".into(), json!("forest"));
        AllocationPayload {
            job: 1,
            allocation: 1,
            kind: "shell".into(),
            tasks: vec![(1, 7)],
            environment,
            parameters,
        }
    }

    #[test]
    fn frame_placeholder_is_substituted() {
        assert_eq!(
            ShellAdapter::command_for("render -f {frame} -o out_{frame}.exr", 12),
            "render -f 12 -o out_12.exr"
        );
    }

    #[tokio::test]
    async fn execute_exports_environment() {
        let adapter = ShellAdapter::default();
        let payload = payload("echo $SCENE");
        let command = ShellAdapter::command_for("echo $SCENE-{frame}", 7);
        let result = adapter.execute(&command, 7, &payload).await;
        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output.as_deref(), Some("forest-7"));
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let adapter = ShellAdapter::default();
        let payload = payload("");
        let result = adapter.execute("echo boom >&2; exit 3", 7, &payload).await;
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn silent_failure_reports_exit_code() {
        let adapter = ShellAdapter::default();
        let payload = payload("");
        let result = adapter.execute("exit 2", 7, &payload).await;
        assert_eq!(result.error.as_deref(), Some("Exit code: Some(2)"));
    }
}
