use thiserror::Error;

use etl_common::stream::StreamError;

/// Errors that end a sink worker's run loop. Per-record store failures are
/// retried or dead-lettered in place; these are the systemic ones its
/// supervisor reacts to.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("stream transport failed: {0}")]
    Stream(#[from] StreamError),
    #[error("failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),
}
