//! Storage-level errors, converted into [`CfdError`] at the crate boundary.

use cfdx_types::CfdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<StoreError> for CfdError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Sled(e) => Self::PersistenceFailure {
                reason: e.to_string(),
            },
            StoreError::Encoding(e) => Self::CorruptLog {
                reason: e.to_string(),
            },
        }
    }
}
