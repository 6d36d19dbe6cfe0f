use thiserror::Error;

use etl_common::schema::SchemaError;
use etl_common::stream::StreamError;

use crate::blob::BlobError;

/// Errors that end an enrichment worker's run loop. Per-record failures are
/// handled in place; these are the systemic ones its supervisor reacts to.
#[derive(Error, Debug)]
pub enum EnricherError {
    #[error("stream transport failed: {0}")]
    Stream(#[from] StreamError),
    #[error("malformed record aborted the batch: {0}")]
    AbortedBatch(#[from] SchemaError),
    #[error("failed to encode enriched record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("output append exhausted retries: {0}")]
    OutputExhausted(StreamError),
}

/// A reference refresh that did not complete. The previous snapshot stays
/// active; these are reported, never fatal to the pipeline.
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("reference blob unreadable: {0}")]
    Blob(#[from] BlobError),
    #[error("reference blob is not valid JSON: {0}")]
    Parse(String),
    #[error("reference row {index}: {source}")]
    Row { index: usize, source: SchemaError },
    #[error("duplicate productId {0} in reference blob")]
    DuplicateProduct(i64),
    #[error("reference blob contains no products")]
    Empty,
}
