//! Error types for billing operations
//!
//! Only faults live here. A verification check that does not pass is an
//! outcome, see [`crate::verify::CheckOutcome`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::UserId;

/// Result type for billing operations
pub type Result<T> = std::result::Result<T, PricingError>;

/// Billing protocol errors
#[derive(Debug, Error)]
pub enum PricingError {
    /// The range-proof backend refused a value outside the declared interval
    #[error("Invalid range: value must be in [{0}, {1})")]
    InvalidRange(u64, u64),

    /// Bulletproofs failure
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Proof generation failed for one user; the whole phase is aborted
    #[error("Proof generation failed for user {user}: {source}")]
    UserProofFailed {
        user: UserId,
        #[source]
        source: Box<PricingError>,
    },

    /// Bytes that do not decode to a curve point
    #[error("Invalid commitment point")]
    InvalidCommitment,

    /// Proof bytes that cannot be decoded
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// Audit path whose shape is inconsistent
    #[error("Malformed path: {0}")]
    MalformedPath(String),

    /// No leaf carries the requested user index
    #[error("Leaf not found for user {0}")]
    LeafNotFound(UserId),

    /// Aggregation over zero users
    #[error("No readings to aggregate")]
    EmptyPopulation,

    /// A reading was submitted without a blinding factor
    #[error("Missing blinding factor for user {0}")]
    MissingBlinding(UserId),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error while persisting a record
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PricingError {
    /// Attach a user index to a backend fault
    pub fn for_user(self, user: UserId) -> Self {
        match self {
            err @ PricingError::UserProofFailed { .. } => err,
            other => PricingError::UserProofFailed {
                user,
                source: Box::new(other),
            },
        }
    }

    /// Whether the fault comes from the shape of the input rather than from cryptography
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PricingError::MalformedPath(_) | PricingError::LeafNotFound(_)
        )
    }
}

impl From<serde_json::Error> for PricingError {
    fn from(err: serde_json::Error) -> Self {
        PricingError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_user_wraps_once() {
        let err = PricingError::InvalidRange(0, 120).for_user(3).for_user(7);
        match err {
            PricingError::UserProofFailed { user, source } => {
                assert_eq!(user, 3);
                assert!(matches!(*source, PricingError::InvalidRange(0, 120)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_structural_classification() {
        assert!(PricingError::LeafNotFound(1).is_structural());
        assert!(PricingError::MalformedPath("x".into()).is_structural());
        assert!(!PricingError::InvalidCommitment.is_structural());
    }
}
