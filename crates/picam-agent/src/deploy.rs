use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use picam_proto::DeploymentCommand;
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: String },
}

/// Device lifecycle collaborator.
#[async_trait]
pub trait DeploymentAgent: Send + Sync {
    async fn reboot(&self) -> Result<(), DeployError>;
    async fn shutdown(&self) -> Result<(), DeployError>;
    async fn restart(&self) -> Result<(), DeployError>;
    /// Updates the deployed checkout, then restarts.
    async fn pull_and_restart(&self) -> Result<(), DeployError>;
    /// Invoked after the bus reports a disconnect.
    async fn reconnect(&self) -> Result<(), DeployError>;
}

/// What the agent did with one deployment-topic message.
#[derive(Debug)]
pub enum DeploymentDisposition {
    /// The agent's run loop must end.
    Stop,
    /// A detached task was started for the command. The handle is returned
    /// for observation only; the agent never joins it.
    Spawned(DeploymentCommand, JoinHandle<()>),
    Ignored,
}

/// Routes deployment text to `agent`. Never blocks on the action itself.
pub fn dispatch_deployment(agent: &Arc<dyn DeploymentAgent>, text: &str) -> DeploymentDisposition {
    let Some(command) = DeploymentCommand::parse(text) else {
        return DeploymentDisposition::Ignored;
    };
    if command == DeploymentCommand::Stop {
        return DeploymentDisposition::Stop;
    }

    let agent = Arc::clone(agent);
    let handle = tokio::spawn(async move {
        let result = match command {
            DeploymentCommand::Reboot => agent.reboot().await,
            DeploymentCommand::Shutdown => agent.shutdown().await,
            DeploymentCommand::Restart => agent.restart().await,
            DeploymentCommand::GitPull => agent.pull_and_restart().await,
            DeploymentCommand::Stop => Ok(()),
        };
        if let Err(err) = result {
            warn!(
                target = "picam.deploy",
                command = command.as_str(),
                error = %err,
                "deployment action failed"
            );
        }
    });
    DeploymentDisposition::Spawned(command, handle)
}

/// Runs lifecycle actions as host commands through `sudo`.
#[derive(Debug, Clone)]
pub struct SystemDeploymentAgent {
    /// Account owning the deployed checkout.
    pub username: String,
    pub repo_path: PathBuf,
    /// systemd unit running the agent.
    pub service_name: String,
    pub reconnect_command: Option<Vec<String>>,
}

impl SystemDeploymentAgent {
    async fn run(&self, program: &str, args: &[&str]) -> Result<(), DeployError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        info!(target = "picam.deploy", %command, "running deployment command");
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|source| DeployError::Spawn {
                command: command.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(DeployError::CommandFailed {
                command,
                status: status.to_string(),
            })
        }
    }
}

#[async_trait]
impl DeploymentAgent for SystemDeploymentAgent {
    async fn reboot(&self) -> Result<(), DeployError> {
        self.run("sudo", &["reboot"]).await
    }

    async fn shutdown(&self) -> Result<(), DeployError> {
        self.run("sudo", &["shutdown", "-h", "now"]).await
    }

    async fn restart(&self) -> Result<(), DeployError> {
        self.run("sudo", &["systemctl", "restart", &self.service_name])
            .await
    }

    async fn pull_and_restart(&self) -> Result<(), DeployError> {
        let repo = self.repo_path.to_string_lossy();
        self.run("sudo", &["-u", &self.username, "git", "-C", &repo, "pull"])
            .await?;
        self.restart().await
    }

    async fn reconnect(&self) -> Result<(), DeployError> {
        match self.reconnect_command.as_deref() {
            Some([program, args @ ..]) => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(program, &args).await
            }
            _ => {
                info!(target = "picam.deploy", "no reconnect command configured");
                Ok(())
            }
        }
    }
}

/// Logs lifecycle actions without touching the host.
#[derive(Debug, Clone, Default)]
pub struct DryRunDeploymentAgent;

#[async_trait]
impl DeploymentAgent for DryRunDeploymentAgent {
    async fn reboot(&self) -> Result<(), DeployError> {
        info!(target = "picam.deploy", "dry run: reboot");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DeployError> {
        info!(target = "picam.deploy", "dry run: shutdown");
        Ok(())
    }

    async fn restart(&self) -> Result<(), DeployError> {
        info!(target = "picam.deploy", "dry run: restart");
        Ok(())
    }

    async fn pull_and_restart(&self) -> Result<(), DeployError> {
        info!(target = "picam.deploy", "dry run: git pull and restart");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), DeployError> {
        info!(target = "picam.deploy", "dry run: reconnect");
        Ok(())
    }
}
