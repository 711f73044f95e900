//! Error types for the listing pipeline.

use fleet_filter::FilterError;
use thiserror::Error;

use crate::instance::{InvalidInstanceType, LoadError};
use crate::store::StoreError;

/// Errors that abort a listing request.
///
/// Node- and instance-scoped failures never show up here; they are turned
/// into error records inside the result.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store stayed locked for the whole retry budget.
    #[error("cluster database is locked (gave up after {attempts} attempts)")]
    LockExhausted { attempts: u32 },

    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),

    #[error(transparent)]
    InstanceType(#[from] InvalidInstanceType),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl ListingError {
    /// Returns true if re-running the whole pipeline may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ListingError::Store(e) if e.is_retriable())
    }
}
