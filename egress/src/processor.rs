//! Adapters handing claimed rows to the delivery pipeline

use std::{path::PathBuf, process::Stdio, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use egress_common::internal;
use egress_queue::{MessageProcessor, QueuedMessage};
use serde::Deserialize;

/// Which processing callback the worker runs for each claimed row
///
/// `Log` is a dry run. Rows it sees stay claimed, so nothing else picks them
/// up until the pipeline's stale-lock sweep clears `locked_by`. Configure
/// `Command` for any deployment that should actually deliver:
///
/// ```ron
/// processor: Command(program: "/usr/local/bin/deliver", args: ["--quiet"]),
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum ProcessorConfig {
    /// Log the row and leave it claimed
    #[default]
    Log,
    /// Run `program args... <queued row id>` per row
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ProcessorConfig {
    /// Whether claimed rows are only logged, never handed on
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        matches!(self, Self::Log)
    }

    #[must_use]
    pub fn build(&self) -> Arc<dyn MessageProcessor> {
        match self {
            Self::Log => Arc::new(LogProcessor),
            Self::Command { program, args } => Arc::new(CommandProcessor {
                program: program.clone(),
                args: args.clone(),
            }),
        }
    }
}

/// Dry-run processor
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProcessor;

#[async_trait]
impl MessageProcessor for LogProcessor {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        internal!(
            level = INFO,
            id = message.id,
            message_id = message.message_id,
            domain = %message.domain,
            ip_address_id = ?message.ip_address_id,
            "Claimed message ready for delivery"
        );
        Ok(())
    }
}

/// Spawns an external program per row
///
/// The queued row id is appended to `args`. The row's fields are also set in
/// the child's environment as `EGRESS_QUEUED_MESSAGE_ID`, `EGRESS_MESSAGE_ID`,
/// `EGRESS_DOMAIN` and `EGRESS_IP_ADDRESS_ID` (empty when unpinned).
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandProcessor {
    #[must_use]
    pub const fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl MessageProcessor for CommandProcessor {
    async fn process(&self, message: &QueuedMessage) -> anyhow::Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(message.id.to_string())
            .env("EGRESS_QUEUED_MESSAGE_ID", message.id.to_string())
            .env("EGRESS_MESSAGE_ID", message.message_id.to_string())
            .env("EGRESS_DOMAIN", &message.domain)
            .env(
                "EGRESS_IP_ADDRESS_ID",
                message
                    .ip_address_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
            )
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        if !status.success() {
            anyhow::bail!("{} exited with {status}", self.program.display());
        }

        tracing::debug!(id = message.id, "Processing command succeeded");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use chrono::Utc;

    use super::*;

    fn message() -> QueuedMessage {
        QueuedMessage {
            id: 7,
            message_id: 42,
            domain: "example.org".to_string(),
            ip_address_id: Some(3),
            attempts: 0,
            retry_after: None,
            locked_by: Some("mx1:1:01J".to_string()),
            locked_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    fn shell(script: &str) -> CommandProcessor {
        CommandProcessor::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string(), "deliver".to_string()],
        )
    }

    #[tokio::test]
    async fn test_command_receives_row() {
        let processor = shell(
            r#"test "$1" = 7 && test "$EGRESS_MESSAGE_ID" = 42 \
               && test "$EGRESS_DOMAIN" = example.org && test "$EGRESS_IP_ADDRESS_ID" = 3"#,
        );
        processor.process(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_failure() {
        let err = shell("exit 75").process(&message()).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn test_missing_program_is_a_failure() {
        let processor = CommandProcessor::new(PathBuf::from("/nonexistent/deliver"), Vec::new());
        let err = processor.process(&message()).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_log_processor_accepts_everything() {
        LogProcessor.process(&message()).await.unwrap();
    }

    #[test]
    fn test_only_log_is_a_dry_run() {
        assert!(ProcessorConfig::default().is_dry_run());
        assert!(
            !ProcessorConfig::Command {
                program: PathBuf::from("/usr/local/bin/deliver"),
                args: Vec::new(),
            }
            .is_dry_run()
        );
    }
}
