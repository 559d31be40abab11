//! Directive log: append-only record of every enforcement action
//!
//! Each executed directive (and each whole-namespace operation) is appended as
//! one JSON object per line: `{timestamp, event_type, directive, result, ...}`.
use crate::core::model::EntityRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of logged events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplyDirective,
    RemoveDirective,
    Rebuild,
    Sync,
    ImportMapping,
    Teardown,
    Restore,
}

/// Outcome of a logged event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventResult {
    Applied,
    Failed,
}

/// A single directive log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    /// Directive notation, e.g. `DNAT(8080→192.168.1.50:80)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<String>,

    /// Entity the directive belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<EntityRef>,

    pub result: EventResult,

    /// Additional structured data (argument vector, counts)
    #[serde(default)]
    pub details: serde_json::Value,

    /// Error message if the operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: EventType, success: bool, details: serde_json::Value, error: Option<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            directive: None,
            owner: None,
            result: if success {
                EventResult::Applied
            } else {
                EventResult::Failed
            },
            details,
            error,
        }
    }

    pub fn with_directive(mut self, directive: impl ToString, owner: EntityRef) -> Self {
        self.directive = Some(directive.to_string());
        self.owner = Some(owner);
        self
    }
}

/// Directive log writer
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("directives.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Appends an event; failures are logged and otherwise ignored so that
    /// enforcement never stops on a full disk
    pub async fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.log(event).await {
            tracing::warn!("Failed to write directive log: {}", e);
        }
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
