use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::EngineError;
use crate::session::StoreError;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("no media workers available")]
    NoWorkersAvailable,

    #[error("no consuming transport available for peer")]
    NoConsumingTransport,

    #[error("incompatible rtp capabilities for producer {producer_id}")]
    CapabilityMismatch { producer_id: Uuid },

    #[error("media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Result shared between concurrent callers awaiting the same
    /// router creation
    #[error("{0}")]
    Shared(Arc<MediaError>),
}

impl MediaError {
    /// Unwrap to the underlying error when this one was shared between
    /// concurrent callers.
    pub fn root(&self) -> &MediaError {
        match self {
            MediaError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
