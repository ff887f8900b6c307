//! [`ProxyControl`] backed by the `traffic_ctl` command line tool.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use super::ProxyControl;

#[derive(Error, Debug)]
pub enum ProxyControlError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Runs `traffic_ctl` and an optional verify command.
#[derive(Debug, Clone)]
pub struct TrafficCtl {
    binary: PathBuf,
    /// Program and arguments run before each reload.
    verify_command: Option<Vec<String>>,
}

impl TrafficCtl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            verify_command: None,
        }
    }

    /// Run `command` (split on whitespace) before every reload.
    pub fn with_verify_command(mut self, command: &str) -> Self {
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        self.verify_command = (!argv.is_empty()).then_some(argv);
        self
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<(), ProxyControlError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(%command, "Running proxy command");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProxyControlError::Spawn {
                command: command.clone(),
                source,
            })?;
        check(command, output)
    }

    fn binary(&self) -> String {
        self.binary.display().to_string()
    }
}

fn check(command: String, output: Output) -> Result<(), ProxyControlError> {
    if output.status.success() {
        return Ok(());
    }
    Err(ProxyControlError::Failed {
        command,
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl ProxyControl for TrafficCtl {
    async fn verify(&self) -> Result<(), ProxyControlError> {
        match self.verify_command.as_deref() {
            Some([program, args @ ..]) => {
                let args: Vec<&str> = args.iter().map(String::as_str).collect();
                self.run(program, &args).await
            }
            _ => Ok(()),
        }
    }

    async fn set_record(&self, name: &str, value: &str) -> Result<(), ProxyControlError> {
        self.run(&self.binary(), &["config", "set", name, value])
            .await
    }

    async fn reload(&self) -> Result<(), ProxyControlError> {
        self.run(&self.binary(), &["config", "reload"]).await
    }
}
