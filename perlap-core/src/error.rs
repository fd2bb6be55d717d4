//! Errors raised by the core's record codecs

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid JSON document: {0}")]
    Json(#[from] serde_json::Error),
}
