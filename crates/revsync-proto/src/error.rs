//! Protocol error types.

use thiserror::Error;

/// Errors raised while interpreting protocol-level data.
#[derive(Debug, Error)]
pub enum Error {
    /// An entity name on the wire did not match any known entity class.
    #[error("unknown entity kind: {0}")]
    UnknownEntity(String),

    /// A payload could not be decoded into, or encoded from, its typed row.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
