//! Execution settings for one query, fixed before any producer runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{tracked_bad_request, ExchangeResult};
use crate::streaming_state::BackupBufferConfig;

/// What a producer does when a destination stops accepting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FtMode {
    /// A rejected write fails the query.
    #[default]
    None,
    /// Stop sending to the channel and keep its data queued.
    Abandon,
    /// Keep data queued and mirrored in a backup buffer so it can be
    /// replayed once the worker rejoins.
    Rejoin,
}

impl FtMode {
    /// Do unavailable channels get skipped instead of failing?
    pub fn tolerates_failures(self) -> bool {
        matches!(self, Self::Abandon | Self::Rejoin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Writes are submitted without waiting.
    #[default]
    NonBlocking,
    /// Each write waits, with capped exponential backoff, until the
    /// channel is writable.
    Blocking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExchangeConfig {
    pub execution_mode: ExecutionMode,
    pub ft_mode: FtMode,
    /// Ceiling on a single backoff sleep in blocking mode.
    pub max_backoff_ms: u64,
    /// Bound of each producer's availability event queue.
    pub availability_queue_depth: usize,
    pub backup_buffer: BackupBufferConfig,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            ft_mode: FtMode::default(),
            max_backoff_ms: 100,
            availability_queue_depth: 1024,
            backup_buffer: BackupBufferConfig::default(),
        }
    }
}

impl ExchangeConfig {
    pub fn from_json(json: &str) -> ExchangeResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| tracked_bad_request(&format!("invalid exchange config: {err}")))
    }

    pub fn with_ft_mode(mut self, ft_mode: FtMode) -> Self {
        self.ft_mode = ft_mode;
        self
    }

    pub fn with_execution_mode(mut self, execution_mode: ExecutionMode) -> Self {
        self.execution_mode = execution_mode;
        self
    }

    pub fn with_backup_buffer(mut self, backup_buffer: BackupBufferConfig) -> Self {
        self.backup_buffer = backup_buffer;
        self
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[test]
fn ft_mode_tokens() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(
        &FtMode::Rejoin,
        &[Token::UnitVariant {
            name: "FtMode",
            variant: "REJOIN",
        }],
    );
    assert_tokens(
        &ExecutionMode::NonBlocking,
        &[Token::UnitVariant {
            name: "ExecutionMode",
            variant: "NON_BLOCKING",
        }],
    );
}

#[test]
fn missing_fields_take_defaults() {
    let config = ExchangeConfig::from_json(r#"{"ftMode":"ABANDON"}"#).unwrap();
    assert_eq!(config.ft_mode, FtMode::Abandon);
    assert_eq!(config.execution_mode, ExecutionMode::NonBlocking);
    assert_eq!(config.max_backoff(), Duration::from_millis(100));
    assert_eq!(config.availability_queue_depth, 1024);
    assert_eq!(config.backup_buffer, BackupBufferConfig::SimpleAppender);

    let config = ExchangeConfig::from_json(
        r#"{"executionMode":"BLOCKING","backupBuffer":{"type":"DupElim"},"maxBackoffMs":5}"#,
    )
    .unwrap();
    assert_eq!(config.execution_mode, ExecutionMode::Blocking);
    assert_eq!(config.backup_buffer, BackupBufferConfig::DupElim);
    assert_eq!(config.max_backoff_ms, 5);
}

#[test]
fn unknown_mode_is_bad_request() {
    let err = ExchangeConfig::from_json(r#"{"ftMode":"RETRY"}"#).unwrap_err();
    assert!(err.is_bad_request());
}
