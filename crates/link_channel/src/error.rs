use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors the linking channel can hand back to its callers.
#[derive(Error, Debug, Serialize, Deserialize, JsonSchema)]
pub enum ChannelError {
    /// Something went wrong encoding or decoding an event payload.
    #[error("JSON error: {0}")]
    Json(String),

    /// The local endpoint was closed; nothing more can be sent.
    #[error("channel `{0}` is closed")]
    Closed(String),

    /// The peer dropped its end of the transport.
    #[error("channel `{0}` peer is gone")]
    Disconnected(String),

    /// An event arrived that is not valid for this direction.
    #[error("unexpected event `{0}`")]
    UnexpectedEvent(String),

    /// An event that requires a payload arrived without one.
    #[error("event `{0}` arrived without its payload")]
    MissingPayload(String),

    /// Unspecified failure.
    #[error("channel error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> ChannelError {
        ChannelError::Json(err.to_string())
    }
}

impl From<anyhow::Error> for ChannelError {
    fn from(err: anyhow::Error) -> ChannelError {
        ChannelError::Other(err.to_string())
    }
}
