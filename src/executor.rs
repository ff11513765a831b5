//! One-shot remote shutdown: upload the script, run it, report the result.
//!
//! Nothing here is retried. A failed upload or a non-zero exit ends the
//! cycle; another attempt needs a fresh countdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::remote::{RemoteConnector, RemoteError, RemoteSession};
use crate::report::{StatusEvent, StatusReporter};
use crate::shell;

/// Bound on the closing handshake; the host may already be powering off.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub upload_ok: bool,
    /// `-1` when the command never ran or reported no exit status.
    pub exit_code: i32,
    pub succeeded: bool,
}

impl ShutdownOutcome {
    fn not_started() -> Self {
        Self {
            upload_ok: false,
            exit_code: -1,
            succeeded: false,
        }
    }

    fn finished(exit_code: i32) -> Self {
        Self {
            upload_ok: true,
            exit_code,
            succeeded: exit_code == 0,
        }
    }
}

/// What the countdown controller invokes when its timer fires.
#[async_trait]
pub trait ShutdownRunner: Send + Sync {
    async fn execute(&self) -> ShutdownOutcome;
}

/// Values handed to the shutdown script.
#[derive(Clone)]
pub struct ScriptParams {
    pub esxi_ip: String,
    pub esxi_username: String,
    pub esxi_password: Option<String>,
    pub esxi_timeout: String,
    pub vm_to_skip: Option<String>,
}

impl ScriptParams {
    /// Environment names read by the script.
    fn env_vars<'a>(&'a self, password: &'a str) -> [(&'static str, &'a str); 5] {
        [
            ("esxiip", self.esxi_ip.as_str()),
            ("esxiusername", self.esxi_username.as_str()),
            ("esxipassword", password),
            ("esxitimeout", self.esxi_timeout.as_str()),
            ("esxivmnametoskip", self.vm_to_skip.as_deref().unwrap_or_default()),
        ]
    }
}

pub struct ShutdownExecutor {
    connector: Arc<dyn RemoteConnector>,
    reporter: Arc<StatusReporter>,
    script_path: PathBuf,
    remote_script_path: String,
    interpreter: Option<String>,
    params: ScriptParams,
    step_timeout: Duration,
    report_failures: bool,
}

/// Run one remote step under `limit`, folding expiry into [`RemoteError::Timeout`].
async fn bounded<T>(
    limit: Duration,
    step: impl std::future::Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::time::timeout(limit, step)
        .await
        .unwrap_or(Err(RemoteError::Timeout(limit)))
}

impl ShutdownExecutor {
    pub fn new(
        config: &Config,
        connector: Arc<dyn RemoteConnector>,
        reporter: Arc<StatusReporter>,
    ) -> Self {
        Self {
            connector,
            reporter,
            script_path: config.script_path.clone(),
            remote_script_path: config.remote_script_path.clone(),
            interpreter: config.script_interpreter.clone(),
            params: ScriptParams {
                esxi_ip: config.esxi_ip.clone(),
                esxi_username: config.esxi_username.clone(),
                esxi_password: config.esxi_password.clone(),
                esxi_timeout: config.esxi_timeout.clone(),
                vm_to_skip: config.esxi_vm_to_skip.clone(),
            },
            step_timeout: config.ssh_command_timeout,
            report_failures: config.report_failures,
        }
    }

    /// `chmod +x <script> && esxiip=... <interpreter> <script>`.
    ///
    /// With `redact` set the password is masked, for logging.
    fn command(&self, redact: bool) -> String {
        let script = shell::quote(&self.remote_script_path);
        let run = match &self.interpreter {
            Some(interpreter) => format!("{interpreter} {script}"),
            None => script.clone(),
        };
        let password = match (&self.params.esxi_password, redact) {
            (Some(_), true) => "<redacted>",
            (Some(password), false) => password.as_str(),
            (None, _) => "",
        };
        format!(
            "chmod +x {script} && {}",
            shell::with_env(&self.params.env_vars(password), &run)
        )
    }

    async fn run(&self) -> ShutdownOutcome {
        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Could not connect to remote host");
                return ShutdownOutcome::not_started();
            }
        };

        let outcome = self.run_on(session.as_mut()).await;

        if let Err(e) = bounded(DISCONNECT_TIMEOUT, session.disconnect()).await {
            tracing::warn!(error = %e, "Error while disconnecting from remote host");
        }
        outcome
    }

    async fn run_on(&self, session: &mut dyn RemoteSession) -> ShutdownOutcome {
        let upload = session.upload_file(&self.script_path, &self.remote_script_path);
        if let Err(e) = bounded(self.step_timeout, upload).await {
            tracing::error!(
                error = %e,
                local = %self.script_path.display(),
                remote = %self.remote_script_path,
                "Uploading shutdown script failed"
            );
            return ShutdownOutcome::not_started();
        }

        tracing::info!(command = %self.command(true), "Running shutdown script");
        let command = self.command(false);
        let output = match bounded(self.step_timeout, session.run_command(&command)).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "Running shutdown script failed");
                return ShutdownOutcome::finished(-1);
            }
        };

        for line in output.stdout.lines() {
            tracing::info!("{line}");
        }
        for line in output.stderr.lines() {
            tracing::error!("{line}");
        }

        let exit_code = output
            .exit_code
            .map(|code| i32::try_from(code).unwrap_or(i32::MAX))
            .unwrap_or(-1);
        ShutdownOutcome::finished(exit_code)
    }
}

#[async_trait]
impl ShutdownRunner for ShutdownExecutor {
    async fn execute(&self) -> ShutdownOutcome {
        tracing::info!("Starting remote shutdown");
        let outcome = self.run().await;

        if outcome.succeeded {
            tracing::info!("Remote shutdown completed");
            let _ = self.reporter.report(StatusEvent::ShutdownCompleted).await;
        } else {
            tracing::error!(
                upload_ok = outcome.upload_ok,
                exit_code = outcome.exit_code,
                "Remote shutdown failed"
            );
            if self.report_failures {
                let _ = self.reporter.report(StatusEvent::ShutdownFailed).await;
            }
        }
        outcome
    }
}
