//! Launches the script behind one deployment step

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::MonitorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::request::{ComponentSpec, DeploymentRequest};
use crate::runner::cancel::CancelRegistration;
use crate::runner::process::{RunnerProcess, PROCESS_TERMINATED_EXIT_CODE};

/// Bytes of script output kept on the result row
const LOG_TAIL_BYTES: usize = 4096;

/// Why a step did not exit on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The request (or the monitor) was cancelled
    Cancelled,

    /// The step ran past its timeout
    TimedOut,
}

/// Outcome of one dispatched step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub termination: Option<Termination>,
    pub log: String,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.termination.is_none() && self.exit_code == 0
    }
}

/// Dispatcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Working directory for scripts that do not set one
    pub scripts_dir: PathBuf,

    /// Where step output is written
    pub logs_dir: PathBuf,

    /// Step timeout when the component does not set one
    pub default_step_timeout: Option<Duration>,
}

/// Runs deployment steps as native processes
pub struct ScriptDispatcher {
    options: Options,
}

impl ScriptDispatcher {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    /// Per-request log directory
    pub fn request_log_dir(&self, request_id: i64) -> Dir {
        Dir::new(&self.options.logs_dir).subdir(&format!("request-{}", request_id))
    }

    /// Run `component` for `request`, killing the process when `token` is cancelled
    pub async fn dispatch(
        &self,
        request: &DeploymentRequest,
        component: &ComponentSpec,
        token: &CancellationToken,
    ) -> Result<StepOutcome, MonitorError> {
        let log_dir = self.request_log_dir(request.id);
        log_dir.create().await?;
        let log_file = File::new(log_dir.path().join(format!("{}.log", component.id)));

        let command = self.build_command(request, component, &log_file).await?;
        let runner = RunnerProcess::spawn(command)?;
        info!(
            "Started component {} of request {} (pid {:?})",
            component.id,
            request.id,
            runner.pid()
        );

        let step_token = token.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = component
            .script
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.options.default_step_timeout)
            .map(|timeout| spawn_step_timer(timeout, step_token.clone(), timed_out.clone()));

        let kill_switch = runner.kill_switch();
        let registration = CancelRegistration::register(&step_token, move || kill_switch.kill());

        let waited = runner.wait_for_exit().await;

        registration.unregister();
        drop(timer);
        if let Err(e) = runner.close() {
            warn!("Failed to close process of component {}: {}", component.id, e);
        }

        let exit_code = waited?;
        let termination = if exit_code == PROCESS_TERMINATED_EXIT_CODE {
            if timed_out.load(Ordering::SeqCst) {
                Some(Termination::TimedOut)
            } else {
                Some(Termination::Cancelled)
            }
        } else {
            None
        };

        let log = read_log_tail(&log_file).await;
        debug!(
            "Component {} of request {} exited with {} ({:?})",
            component.id, request.id, exit_code, termination
        );

        Ok(StepOutcome {
            exit_code,
            termination,
            log,
        })
    }

    async fn build_command(
        &self,
        request: &DeploymentRequest,
        component: &ComponentSpec,
        log_file: &File,
    ) -> Result<Command, MonitorError> {
        let (stdout, stderr) = log_file.create_output().await?;

        let working_dir = component
            .script
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.options.scripts_dir.clone());

        let mut command = Command::new(&component.script.program);
        command
            .args(&component.script.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("DEPLOY_REQUEST_ID", request.id.to_string())
            .env("DEPLOY_ENVIRONMENT", &request.environment_name)
            .env("DEPLOY_USER", &request.user_name)
            .env("DEPLOY_COMPONENT", &component.id);

        if let Some(version) = &request.build_version {
            command.env("DEPLOY_BUILD_VERSION", version);
        }

        for (name, value) in &request.detail.property_overrides {
            command.env(property_env_name(name), value);
        }

        Ok(command)
    }
}

/// Cancels the step token once the timeout elapses; dropping the guard stops it
fn spawn_step_timer(
    timeout: Duration,
    step_token: CancellationToken,
    timed_out: Arc<AtomicBool>,
) -> tokio_util::sync::DropGuard {
    let stop = CancellationToken::new();
    let stopped = stop.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = stopped.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                timed_out.store(true, Ordering::SeqCst);
                step_token.cancel();
            }
        }
    });

    stop.drop_guard()
}

/// `db.host` -> `DEPLOY_PROP_DB_HOST`
pub fn property_env_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("DEPLOY_PROP_{}", normalized)
}

async fn read_log_tail(log_file: &File) -> String {
    match log_file.read_bytes().await {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(LOG_TAIL_BYTES);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(e) => {
            debug!("Could not read step log {:?}: {}", log_file.path(), e);
            String::new()
        }
    }
}
