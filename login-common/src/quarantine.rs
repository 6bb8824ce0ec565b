use std::fmt;

use serde::{Deserialize, Serialize};

/// The processing step at which a message failed. Stored alongside every quarantine row so
/// readers know whether `message_body` holds the raw, the parsed, or the normalized payload.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    /// The body could not be parsed into a login event.
    Parse,
    /// The login event was parsed but could not be normalized.
    Normalize,
    /// The normalized event was rejected by the store.
    Persist,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Parse => "parse",
            FailureStage::Normalize => "normalize",
            FailureStage::Persist => "persist",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row for the `error_records` table. `error_id` is assigned by the store on insert.
#[derive(Serialize, Debug, PartialEq, Clone)]
pub struct QuarantineRecord {
    pub error_message: String,
    /// The full transport envelope the message arrived in.
    pub message: serde_json::Value,
    /// Best-effort payload at the time of failure, `None` if the body was not JSON at all.
    pub message_body: Option<serde_json::Value>,
    pub stage: FailureStage,
}

impl QuarantineRecord {
    pub fn new(
        stage: FailureStage,
        error_message: &str,
        message: serde_json::Value,
        message_body: Option<serde_json::Value>,
    ) -> Self {
        Self {
            error_message: error_message.to_owned(),
            message,
            message_body,
            stage,
        }
    }
}
