use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Classification of everything that can stop a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    TransientNetwork,
    RemoteFailure,
    Verification,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::TransientNetwork => "transient_network",
            Self::RemoteFailure => "remote_failure",
            Self::Verification => "verification",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
}

impl ErrorContext {
    fn is_empty(&self) -> bool {
        self.phase.is_none() && self.task_id.is_none() && self.asset_id.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(phase) = &self.phase {
            parts.push(format!("phase={phase}"));
        }
        if let Some(asset_id) = &self.asset_id {
            parts.push(format!("assetId={asset_id}"));
        }
        if let Some(task_id) = &self.task_id {
            parts.push(format!("taskId={task_id}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Error surfaced by phases, pollers and verifiers.
///
/// The context fields are filled innermost-first: once a task or asset id is
/// attached, outer layers do not overwrite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TesterError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
}

impl TesterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientNetwork, message)
    }

    pub fn remote_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteFailure, message)
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Verification, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "lifetime cancelled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        if self.context.phase.is_none() {
            self.context.phase = Some(phase.into());
        }
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        if self.context.task_id.is_none() {
            self.context.task_id = Some(task_id.into());
        }
        self
    }

    pub fn with_asset(mut self, asset_id: impl Into<String>) -> Self {
        if self.context.asset_id.is_none() {
            self.context.asset_id = Some(asset_id.into());
        }
        self
    }

    /// Prefixes the message, keeping kind and context.
    pub fn wrap(mut self, prefix: impl fmt::Display) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn phase(&self) -> Option<&str> {
        self.context.phase.as_deref()
    }

    /// Process exit code for this error; cancellation counts as a clean exit.
    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for TesterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}: {}", self.kind, self.message)
        } else {
            write!(f, "{}: {} ({})", self.kind, self.message, self.context)
        }
    }
}

impl std::error::Error for TesterError {}

impl From<ConfigError> for TesterError {
    fn from(error: ConfigError) -> Self {
        TesterError::configuration(error.to_string())
    }
}

pub type TesterResult<T> = std::result::Result<T, TesterError>;
