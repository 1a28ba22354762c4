use serde::{Deserialize, Serialize};

/// One chunk of an execution's output, as seen by the log pipeline.
///
/// `Stdout`/`Stderr` carry raw bytes decoded as UTF-8 (lossily, if needed) from the
/// container's combined output stream. `SessionId` and `JsonPatch` are derived
/// out-of-band by normalizers that watch the same stream (e.g. the result parser
/// noticing a `session_id` field before the run finishes). `Finished` is the
/// terminal marker pushed exactly once when the pipeline closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogMsg {
    Stdout(String),
    Stderr(String),
    SessionId(String),
    JsonPatch(serde_json::Value),
    Finished,
}

impl LogMsg {
    pub fn is_finished(&self) -> bool {
        matches!(self, LogMsg::Finished)
    }

    /// Raw bytes this entry contributes to the durable log, if any.
    ///
    /// `SessionId`/`JsonPatch`/`Finished` are control messages, not log bytes;
    /// only `Stdout`/`Stderr` count toward invariant #6 (log bytes equal
    /// container output).
    pub fn as_log_bytes(&self) -> Option<&str> {
        match self {
            LogMsg::Stdout(s) | LogMsg::Stderr(s) => Some(s),
            _ => None,
        }
    }
}
