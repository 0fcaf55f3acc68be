//! `bd` CLI adapter for the beads issue tracker

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::command::{CommandExecutor, ProcessCommandExecutor};
use super::{CreateIssueRequest, IssueStatus, TicketingError, TicketingStore};
use crate::config::TicketingConfig;
use crate::models::IssueId;

const IDEMPOTENCY_LABEL_PREFIX: &str = "idem:";

/// Ticketing store backed by the `bd` command line tool
pub struct BeadsCliTicketing {
    executor: Arc<dyn CommandExecutor>,
    binary: String,
    actor: String,
    extra_labels: Vec<String>,
}

impl BeadsCliTicketing {
    /// Run the real `bd` binary in the configured beads workspace
    pub fn from_config(config: &TicketingConfig) -> Self {
        let mut executor = ProcessCommandExecutor::with_timeout(config.command_timeout());
        if let Some(dir) = &config.workspace_dir {
            executor = executor.in_dir(dir);
        }
        Self::new(Arc::new(executor), config)
    }

    pub fn new(executor: Arc<dyn CommandExecutor>, config: &TicketingConfig) -> Self {
        Self {
            executor,
            binary: config.bd_path.clone(),
            actor: config.actor.clone(),
            extra_labels: config.labels.clone(),
        }
    }

    async fn run_bd(&self, args: &[&str]) -> Result<String, TicketingError> {
        let mut full_args = vec!["--actor", self.actor.as_str()];
        full_args.extend_from_slice(args);
        debug!(binary = %self.binary, args = ?full_args, "Running bd");

        let output = self.executor.execute(&self.binary, &full_args).await?;
        if !output.success() {
            return Err(self.classify_bd_error(args, &output.stderr));
        }
        Ok(output.stdout)
    }

    fn classify_bd_error(&self, args: &[&str], stderr: &str) -> TicketingError {
        let lowered = stderr.to_lowercase();
        if lowered.contains("not found") {
            let id_position = if args.first() == Some(&"comments") { 2 } else { 1 };
            if let Some(id) = args.get(id_position) {
                return TicketingError::IssueNotFound(IssueId::new(*id));
            }
        }
        if lowered.contains("database is locked") || lowered.contains("no beads database") {
            return TicketingError::Unavailable(stderr.trim().to_string());
        }
        TicketingError::CommandFailed {
            command: format!("{} {}", self.binary, args.join(" ")),
            stderr: stderr.trim().to_string(),
        }
    }

    fn parse_json(output: &str) -> Result<serde_json::Value, TicketingError> {
        serde_json::from_str(output.trim())
            .map_err(|e| TicketingError::InvalidResponse(format!("invalid JSON from bd: {}", e)))
    }

    fn issue_id_from(value: &serde_json::Value) -> Option<IssueId> {
        value.get("id").and_then(|id| id.as_str()).map(IssueId::new)
    }

    async fn find_by_idempotency_label(
        &self,
        label: &str,
    ) -> Result<Option<IssueId>, TicketingError> {
        let output = self.run_bd(&["list", "--label", label, "--json"]).await?;
        let listed = Self::parse_json(&output)?;
        Ok(listed
            .as_array()
            .and_then(|issues| issues.first())
            .and_then(Self::issue_id_from))
    }
}

#[async_trait]
impl TicketingStore for BeadsCliTicketing {
    async fn create_issue(&self, request: &CreateIssueRequest) -> Result<IssueId, TicketingError> {
        let idem_label = format!("{}{}", IDEMPOTENCY_LABEL_PREFIX, request.idempotency_key);
        if let Some(existing) = self.find_by_idempotency_label(&idem_label).await? {
            info!(issue_id = %existing, "Issue already created for idempotency key");
            return Ok(existing);
        }

        let mut labels = vec![request.work_type.to_string(), idem_label];
        labels.extend(self.extra_labels.iter().cloned());
        labels.extend(request.labels.iter().cloned());
        let labels = labels.join(",");
        let priority = request.priority.as_cli_arg();
        let description = request.description.clone().unwrap_or_default();

        let args = [
            "create",
            request.title.as_str(),
            "-p",
            priority.as_str(),
            "-t",
            "task",
            "-d",
            description.as_str(),
            "-l",
            labels.as_str(),
            "--json",
        ];
        let output = self.run_bd(&args).await?;
        let created = Self::parse_json(&output)?;
        Self::issue_id_from(&created).ok_or_else(|| {
            TicketingError::InvalidResponse(format!("bd create returned no id: {}", output.trim()))
        })
    }

    async fn update_issue_status(
        &self,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> Result<(), TicketingError> {
        match status {
            IssueStatus::Closed => {
                self.run_bd(&["close", issue_id.as_str(), "--reason", "workflow completed"])
                    .await?;
            }
            other => {
                self.run_bd(&["update", issue_id.as_str(), "--status", other.as_str()])
                    .await?;
            }
        }
        Ok(())
    }

    async fn add_comment(&self, issue_id: &IssueId, text: &str) -> Result<(), TicketingError> {
        self.run_bd(&["comments", "add", issue_id.as_str(), text]).await?;
        Ok(())
    }

    async fn issue_status(&self, issue_id: &IssueId) -> Result<IssueStatus, TicketingError> {
        let output = self.run_bd(&["show", issue_id.as_str(), "--json"]).await?;
        let shown = Self::parse_json(&output)?;
        // `bd show --json` returns a one-element array for a single id
        let issue = shown.as_array().and_then(|a| a.first()).unwrap_or(&shown);
        let raw = issue
            .get("status")
            .and_then(|s| s.as_str())
            .ok_or_else(|| TicketingError::InvalidResponse("bd show returned no status".to_string()))?;
        IssueStatus::parse(raw)
            .ok_or_else(|| TicketingError::InvalidResponse(format!("unknown issue status '{}'", raw)))
    }
}
