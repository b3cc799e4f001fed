//! Persisted state of one user after an interval
//!
//! The record is what the `produce` step hands to the `verify` step. Proof
//! bytes are stored as hex and come back byte for byte.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::commitment::Blinding;
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::range::ProofBlob;
use crate::strategy::AuditBundle;
use crate::verify::{Participant, VerificationReport};
use crate::UserId;

/// One user's view of an interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Number of users in the interval
    pub population: u64,
    /// Threshold, margin and backend width of the interval
    pub config: ProtocolConfig,
    pub user: UserId,
    pub reading: u64,
    pub blinding: Blinding,
    pub bundle: AuditBundle,
    /// The aggregate sum proof
    pub sum_proof: ProofBlob,
}

impl UserRecord {
    /// Write the record as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)?;
        log::debug!("Saved record of user {} to {}", self.user, path.as_ref().display());
        Ok(())
    }

    /// Read a record written by [`UserRecord::save`]
    ///
    /// # Errors
    /// Returns `Config` if the stored protocol configuration is unusable.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let record: Self = serde_json::from_str(&json)?;
        record.config.validate()?;
        Ok(record)
    }

    pub fn participant(&self) -> Participant {
        Participant::new(
            self.user,
            self.reading,
            self.blinding,
            self.population,
            self.config,
        )
    }

    /// Run the verification protocol on this record
    pub fn verify(&self) -> VerificationReport {
        self.participant().verify(&self.bundle, &self.sum_proof)
    }
}
