//! Podman image builds
//!
//! Handles the external side of a build:
//! - Checking podman availability
//! - Checking out remote build contexts with git
//! - Running `podman build` and `podman push` with output streamed to the
//!   build log
//! - Stopping the process on cancellation or timeout
//! - Classifying failures as infrastructure or build logic

use anyhow::{Context, Result};
use cygni_core::domain::build::BuildJob;
use cygni_core::domain::log::LogLevel;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::BuildContext;
use crate::execution::ExecutionResult;

/// Exit status podman uses for errors in podman itself
const PODMAN_ERROR: i32 = 125;
/// Command found but not executable, or not found
const COMMAND_NOT_RUNNABLE: [i32; 2] = [126, 127];

/// Checks if podman is installed and available
pub async fn check_podman_available() -> Result<()> {
    let output = Command::new("podman")
        .arg("--version")
        .output()
        .await
        .context("Failed to execute 'podman --version'. Is podman installed?")?;

    if !output.status.success() {
        anyhow::bail!("Podman is not working correctly");
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Podman is available: {}", version.trim());

    Ok(())
}

/// How a spawned step ended
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Exited(i32),
    Cancelled { termination_error: Option<String> },
    TimedOut,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Cancel,
    Timeout,
}

/// Runs a command to completion, forwarding its output into the build log.
/// Stops the process when the build is cancelled or `deadline` passes.
pub async fn run_step(
    ctx: &Arc<BuildContext>,
    mut command: Command,
    deadline: Instant,
) -> Result<StepOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().context("Failed to spawn process")?;

    let mut forwarders = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(tokio::spawn(forward_lines(stdout, Arc::clone(ctx))));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(tokio::spawn(forward_lines(stderr, Arc::clone(ctx))));
    }

    let stop = tokio::select! {
        status = child.wait() => Stop::Exited(status),
        _ = ctx.cancelled() => Stop::Cancel,
        _ = tokio::time::sleep_until(deadline) => Stop::Timeout,
    };

    let outcome = match stop {
        Stop::Exited(status) => {
            let status = status.context("Failed to wait for process")?;
            StepOutcome::Exited(status.code().unwrap_or(-1))
        }
        Stop::Cancel => StepOutcome::Cancelled {
            termination_error: terminate(&mut child).await,
        },
        Stop::Timeout => {
            if let Some(e) = terminate(&mut child).await {
                warn!("Failed to stop timed out build {}: {}", ctx.build_id, e);
            }
            StepOutcome::TimedOut
        }
    };

    // Output still in the pipes belongs to this step
    for forwarder in forwarders {
        if tokio::time::timeout(Duration::from_secs(5), forwarder)
            .await
            .is_err()
        {
            debug!("Output of build {} still open after exit", ctx.build_id);
        }
    }

    Ok(outcome)
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, ctx: Arc<BuildContext>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        ctx.log(LogLevel::Info, line);
    }
}

/// Kills the process and reaps it; returns the error if that failed
async fn terminate(child: &mut Child) -> Option<String> {
    if let Err(e) = child.start_kill() {
        return Some(format!("failed to kill process: {}", e));
    }
    match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
        Ok(Ok(_)) => None,
        Ok(Err(e)) => Some(format!("failed to reap process: {}", e)),
        Err(_) => Some("process did not exit within 10s of being killed".to_string()),
    }
}

/// Classifies a failed `podman build` exit status
pub fn classify_build_exit(code: i32) -> ExecutionResult {
    if code == PODMAN_ERROR || COMMAND_NOT_RUNNABLE.contains(&code) || code < 0 {
        ExecutionResult::infrastructure(format!("podman build failed with exit code {}", code))
    } else {
        ExecutionResult::build_logic(format!(
            "image build failed: podman build exited with {}",
            code
        ))
    }
}

/// A step either continues with a value or ends the build with a result
type Step<T> = std::result::Result<T, ExecutionResult>;

/// Builds and pushes container images with podman
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    registry: String,
    workspace_base: PathBuf,
    timeout: Duration,
}

impl ImageBuilder {
    pub fn new(registry: impl Into<String>, workspace_base: PathBuf, timeout: Duration) -> Self {
        Self {
            registry: registry.into(),
            workspace_base,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `{registry}/{project}:{commit}`
    pub fn image_ref(&self, job: &BuildJob) -> String {
        format!(
            "{}/{}:{}",
            self.registry.trim_end_matches('/'),
            job.project_id.to_lowercase(),
            job.commit_sha
        )
    }

    pub fn build_args(
        &self,
        build_id: Uuid,
        job: &BuildJob,
        context_dir: &Path,
        image_ref: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--file".to_string(),
            context_dir.join(&job.manifest_path).display().to_string(),
            "--tag".to_string(),
            image_ref.to_string(),
            "--label".to_string(),
            format!("cygni.build-id={}", build_id),
            "--label".to_string(),
            format!("cygni.commit={}", job.commit_sha),
        ];

        let mut build_args: Vec<_> = job.build_args.iter().collect();
        build_args.sort();
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(context_dir.display().to_string());
        args
    }

    /// Checks out the context, builds the image and pushes it
    pub async fn run(&self, ctx: &Arc<BuildContext>, job: &BuildJob) -> ExecutionResult {
        let deadline = Instant::now() + self.timeout;

        let (context_dir, cloned) = match self.prepare_context(ctx, job, deadline).await {
            Ok(prepared) => prepared,
            Err(result) => return result,
        };

        let result = match self.build_and_push(ctx, job, &context_dir, deadline).await {
            Ok(image_ref) => ExecutionResult::Succeeded { image_ref },
            Err(result) => result,
        };

        if cloned {
            if let Err(e) = tokio::fs::remove_dir_all(&context_dir).await {
                warn!(
                    "Failed to remove workspace {}: {}",
                    context_dir.display(),
                    e
                );
            }
        }

        result
    }

    /// Local directories are used in place; anything else is cloned with git
    async fn prepare_context(
        &self,
        ctx: &Arc<BuildContext>,
        job: &BuildJob,
        deadline: Instant,
    ) -> Step<(PathBuf, bool)> {
        let local = PathBuf::from(&job.context_location);
        if tokio::fs::metadata(&local)
            .await
            .is_ok_and(|m| m.is_dir())
        {
            ctx.log_info(format!("Using local build context {}", local.display()));
            return Ok((local, false));
        }

        let workspace = self.workspace_base.join(ctx.build_id.to_string());
        if tokio::fs::metadata(&workspace).await.is_ok() {
            // Left over from an earlier attempt on this machine
            let _ = tokio::fs::remove_dir_all(&workspace).await;
        }
        tokio::fs::create_dir_all(&self.workspace_base)
            .await
            .map_err(|e| ExecutionResult::infrastructure(format!("workspace: {}", e)))?;

        ctx.log_info(format!("Cloning {}", job.context_location));
        let mut clone = Command::new("git");
        clone
            .arg("clone")
            .arg("--quiet")
            .arg(&job.context_location)
            .arg(&workspace);
        match self.step(ctx, clone, deadline, "git clone").await? {
            0 => {}
            code => {
                return Err(ExecutionResult::infrastructure(format!(
                    "git clone of {} failed with exit code {}",
                    job.context_location, code
                )));
            }
        }

        let mut checkout = Command::new("git");
        checkout
            .arg("-C")
            .arg(&workspace)
            .arg("checkout")
            .arg("--quiet")
            .arg(&job.commit_sha);
        match self.step(ctx, checkout, deadline, "git checkout").await? {
            0 => Ok((workspace, true)),
            code => {
                let _ = tokio::fs::remove_dir_all(&workspace).await;
                Err(ExecutionResult::build_logic(format!(
                    "commit {} not found in {} (git checkout exited with {})",
                    job.commit_sha, job.context_location, code
                )))
            }
        }
    }

    async fn build_and_push(
        &self,
        ctx: &Arc<BuildContext>,
        job: &BuildJob,
        context_dir: &Path,
        deadline: Instant,
    ) -> Step<String> {
        let manifest = context_dir.join(&job.manifest_path);
        if tokio::fs::metadata(&manifest).await.is_err() {
            return Err(ExecutionResult::build_logic(format!(
                "manifest {} not found in build context",
                job.manifest_path
            )));
        }

        let image_ref = self.image_ref(job);
        ctx.log_info(format!("Building {}", image_ref));

        let mut build = Command::new("podman");
        build.args(self.build_args(ctx.build_id, job, context_dir, &image_ref));
        match self.step(ctx, build, deadline, "podman build").await? {
            0 => {}
            code => return Err(classify_build_exit(code)),
        }

        ctx.log_info(format!("Pushing {}", image_ref));
        let mut push = Command::new("podman");
        push.arg("push").arg(&image_ref);
        match self.step(ctx, push, deadline, "podman push").await? {
            0 => {
                ctx.log_info(format!("Pushed {}", image_ref));
                Ok(image_ref)
            }
            code => Err(ExecutionResult::infrastructure(format!(
                "podman push of {} failed with exit code {}",
                image_ref, code
            ))),
        }
    }

    /// Runs one command; cancellation, timeout and spawn errors end the build
    async fn step(
        &self,
        ctx: &Arc<BuildContext>,
        command: Command,
        deadline: Instant,
        name: &str,
    ) -> Step<i32> {
        debug!("Build {}: running {}", ctx.build_id, name);
        match run_step(ctx, command, deadline).await {
            Ok(StepOutcome::Exited(code)) => Ok(code),
            Ok(StepOutcome::Cancelled { termination_error }) => {
                ctx.log_warning(format!("{} stopped: build cancelled", name));
                Err(ExecutionResult::Cancelled { termination_error })
            }
            Ok(StepOutcome::TimedOut) => {
                ctx.log_error(format!(
                    "{} stopped: build exceeded {}s",
                    name,
                    self.timeout.as_secs()
                ));
                Err(ExecutionResult::TimedOut {
                    after_secs: self.timeout.as_secs(),
                })
            }
            Err(e) => Err(ExecutionResult::infrastructure(format!("{}: {:#}", name, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cygni_core::domain::build::FailureKind;
    use std::collections::HashMap;

    fn job() -> BuildJob {
        BuildJob {
            project_id: "Web".to_string(),
            repository: "https://git.example.com/web.git".to_string(),
            commit_sha: "abc123".to_string(),
            branch: Some("main".to_string()),
            context_location: "https://git.example.com/web.git".to_string(),
            manifest_path: "Containerfile".to_string(),
            build_args: HashMap::from([
                ("VERSION".to_string(), "1.2".to_string()),
                ("ARCH".to_string(), "amd64".to_string()),
            ]),
        }
    }

    fn builder() -> ImageBuilder {
        ImageBuilder::new(
            "registry.local:5000/",
            std::env::temp_dir(),
            Duration::from_secs(60),
        )
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn test_image_ref() {
        assert_eq!(builder().image_ref(&job()), "registry.local:5000/web:abc123");
    }

    #[test]
    fn test_build_args_are_sorted_and_context_last() {
        let id = Uuid::nil();
        let args = builder().build_args(id, &job(), Path::new("/work/web"), "img:1");
        assert_eq!(args[0], "build");
        assert!(args.contains(&"/work/web/Containerfile".to_string()));
        let arch = args.iter().position(|a| a == "ARCH=amd64").unwrap();
        let version = args.iter().position(|a| a == "VERSION=1.2").unwrap();
        assert!(arch < version);
        assert_eq!(args.last().map(String::as_str), Some("/work/web"));
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            classify_build_exit(125),
            ExecutionResult::Failed { kind: FailureKind::Infrastructure, .. }
        ));
        assert!(matches!(
            classify_build_exit(127),
            ExecutionResult::Failed { kind: FailureKind::Infrastructure, .. }
        ));
        assert!(matches!(
            classify_build_exit(1),
            ExecutionResult::Failed { kind: FailureKind::BuildLogic, .. }
        ));
    }

    #[tokio::test]
    async fn test_run_step_streams_output() {
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());
        let deadline = Instant::now() + Duration::from_secs(10);

        let outcome = run_step(&ctx, sh("echo compiling; echo warning >&2; exit 3"), deadline)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Exited(3));

        let messages: Vec<_> = ctx.drain_logs().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"compiling".to_string()));
        assert!(messages.contains(&"warning".to_string()));
    }

    #[tokio::test]
    async fn test_run_step_stops_on_cancel() {
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());
        let deadline = Instant::now() + Duration::from_secs(30);

        let canceller = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                ctx.request_cancel();
            })
        };

        let outcome = run_step(&ctx, sh("sleep 30"), deadline).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Cancelled {
                termination_error: None
            }
        );
    }

    #[tokio::test]
    async fn test_run_step_times_out() {
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());
        let deadline = Instant::now() + Duration::from_millis(100);

        let outcome = run_step(&ctx, sh("sleep 30"), deadline).await.unwrap();
        assert_eq!(outcome, StepOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_build_logic_failure() {
        let dir = std::env::temp_dir().join(format!("cygni-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut job = job();
        job.context_location = dir.display().to_string();
        let ctx = BuildContext::new(Uuid::new_v4(), Uuid::new_v4());

        let result = builder().run(&ctx, &job).await;
        tokio::fs::remove_dir_all(&dir).await.unwrap();

        match result {
            ExecutionResult::Failed { kind, reason } => {
                assert_eq!(kind, FailureKind::BuildLogic);
                assert!(reason.contains("Containerfile"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
