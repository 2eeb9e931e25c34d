use thiserror::Error;

use crate::bucket::Error as BucketError;
use crate::config::Error as ConfigError;
use crate::crypto::Error as CryptoError;
use crate::encode::Error as EncodeError;
use crate::happiness::Happiness;
use crate::selection::SelectionError;
use crate::uploadable::Error as UploadableError;

/// Top-level error returned by the upload coordinator, aggregating every
/// layer underneath it so callers can match on one enum end to end.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload parameters: {0}")]
    InvalidParameters(#[from] ConfigError),

    #[error("failed reading the upload source: {0}")]
    Source(#[from] UploadableError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("could not place shares: {0}")]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Bucket(#[from] BucketError),

    #[error("upload was cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this failure is local (no server was ever contacted) as
    /// opposed to one surfaced only after some server interaction.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::InvalidParameters(_)
                | Error::Cancelled
                | Error::Selection(SelectionError::NoServers | SelectionError::Cancelled)
        )
    }

    /// The happiness snapshot at time of failure, when available.
    pub fn happiness(&self) -> Option<&Happiness> {
        match self {
            Error::Selection(SelectionError::NotHappy { happiness, .. }) => Some(happiness),
            _ => None,
        }
    }
}
