//! Error kinds callers can act on. Everything else is recovered locally
//! (cold-start priors, identity multipliers, skipped habit effects) or
//! wrapped in `Repository`.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PantryError {
    #[error("inventory_log row not found for log_id={0}")]
    MissingLogRow(Uuid),

    #[error("feedback direction must be 'more' or 'less', got '{0}'")]
    InvalidFeedbackDirection(String),

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("inventory item not found for product {0}")]
    MissingInventoryItem(Uuid),

    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

impl PantryError {
    /// Whether this error is the caller's fault (a missing or invalid
    /// reference) rather than a store failure.
    pub fn is_bad_request(&self) -> bool {
        !matches!(self, PantryError::Repository(_))
    }
}
