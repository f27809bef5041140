use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::groups::ExecutionGroup;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u64);

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Completed,
    Cancelled,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub command: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<ExecutionGroup>,
}

/// Captured result of a command that ran to completion (or timed out).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<OutputSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSection {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamChannel {
    Stdout,
    Stderr,
}

/// Events published on a stream's channel, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Data {
        stream_id: String,
        #[serde(rename = "type")]
        channel: StreamChannel,
        data: String,
        timestamp: i64,
    },
    End {
        stream_id: String,
        exit_code: Option<i32>,
        full_output: String,
        timestamp: i64,
    },
    Error {
        stream_id: String,
        error: String,
        timestamp: i64,
    },
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Data { .. } => "stream-data",
            Self::End { .. } => "stream-end",
            Self::Error { .. } => "stream-error",
        }
    }

    pub fn stream_id(&self) -> &str {
        match self {
            Self::Data { stream_id, .. }
            | Self::End { stream_id, .. }
            | Self::Error { stream_id, .. } => stream_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }
}
