//! Error types for the liquidation service.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("External service error: {0}")]
    ExternalService(#[from] external_services::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
