//! User-side verification protocol
//!
//! A user knows only their own reading and blinding factor. With the audit
//! material from the company they run three independent checks:
//!
//! 1. **Commitment**: the commitments published for the user open to the
//!    user's own reading.
//! 2. **Sum**: the sum proof reconciles with the published commitments
//!    (every user's in the flat scheme, the tree root otherwise) and with
//!    the population size.
//! 3. **Range proofs**: every proof the user received is valid and matches
//!    its published commitments.
//!
//! A check that does not pass is an outcome, never an error, and one failed
//! check never stops the others.

use std::fmt;

use bulletproofs::PedersenGens;
use serde::{Deserialize, Serialize};

use crate::commitment::{Blinding, Commitment};
use crate::config::ProtocolConfig;
use crate::error::PricingError;
use crate::range::{ProofBlob, RangeProof};
use crate::strategy::{dummy_offset, AuditBundle, AuditUnit, ProofFailure};
use crate::UserId;

/// Why a check did not pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The company published commitments to a different value
    ValueSubstituted,
    /// The sum proof does not reconcile with the published commitments
    SumMismatch,
    /// Proofs that failed, all of them
    InvalidProofs(Vec<ProofFailure>),
    /// The audit path is inconsistent in shape
    MalformedPath(String),
    /// The audit material could not be processed
    Fault(String),
}

impl From<PricingError> for FailureReason {
    fn from(err: PricingError) -> Self {
        if err.is_structural() {
            FailureReason::MalformedPath(err.to_string())
        } else {
            FailureReason::Fault(err.to_string())
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ValueSubstituted => {
                f.write_str("published commitments do not match the reading")
            }
            FailureReason::SumMismatch => f.write_str("sum proof does not match the aggregate"),
            FailureReason::InvalidProofs(failures) => {
                write!(f, "{} proof failure(s)", failures.len())?;
                for failure in failures {
                    write!(f, "; {}", failure)?;
                }
                Ok(())
            }
            FailureReason::MalformedPath(msg) => write!(f, "malformed path: {}", msg),
            FailureReason::Fault(msg) => write!(f, "{}", msg),
        }
    }
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOutcome {
    Passed,
    Failed(FailureReason),
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckOutcome::Passed => f.write_str("succeeded"),
            CheckOutcome::Failed(reason) => write!(f, "FAILED ({})", reason),
        }
    }
}

/// Policy outcome of the sum check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SumVerdict {
    /// Sum correct and above the margin
    ChargePeakRate,
    /// Sum correct, but the margin is not certified
    CannotChargePeakRate,
    Failed,
}

/// Sub-results of the sum check, reported separately
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumCheckReport {
    pub population_matched: bool,
    /// Threshold-adjusted sum
    pub commitment1_matched: bool,
    /// Plain sum
    pub commitment2_matched: bool,
    pub range_proof_verified: bool,
    /// Set when the material could not be checked at all
    pub fault: Option<FailureReason>,
}

impl SumCheckReport {
    fn faulted(reason: FailureReason) -> Self {
        Self {
            population_matched: false,
            commitment1_matched: false,
            commitment2_matched: false,
            range_proof_verified: false,
            fault: Some(reason),
        }
    }

    pub fn verdict(&self) -> SumVerdict {
        let reconciled = self.fault.is_none()
            && self.population_matched
            && self.commitment1_matched
            && self.commitment2_matched;
        match (reconciled, self.range_proof_verified) {
            (true, true) => SumVerdict::ChargePeakRate,
            (true, false) => SumVerdict::CannotChargePeakRate,
            (false, _) => SumVerdict::Failed,
        }
    }

    pub fn outcome(&self) -> CheckOutcome {
        match (&self.fault, self.verdict()) {
            (Some(reason), _) => CheckOutcome::Failed(reason.clone()),
            (None, SumVerdict::Failed) => CheckOutcome::Failed(FailureReason::SumMismatch),
            (None, _) => CheckOutcome::Passed,
        }
    }
}

/// Result of the protocol for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub user: UserId,
    pub commitment: CheckOutcome,
    pub sum: SumCheckReport,
    pub range: CheckOutcome,
}

impl VerificationReport {
    /// All three checks passed
    ///
    /// A sum that cannot be charged at peak rate is still accepted.
    pub fn accepted(&self) -> bool {
        self.commitment.passed() && self.sum.outcome().passed() && self.range.passed()
    }

    pub fn can_charge_peak_rate(&self) -> bool {
        self.accepted() && self.sum.verdict() == SumVerdict::ChargePeakRate
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "check 1 for user {}: {}", self.user, self.commitment)?;
        match self.sum.verdict() {
            SumVerdict::ChargePeakRate => {
                writeln!(f, "check 2 for user {}: succeeded, can charge peak rate", self.user)?
            }
            SumVerdict::CannotChargePeakRate => writeln!(
                f,
                "check 2 for user {}: succeeded, but CANNOT charge peak rate",
                self.user
            )?,
            SumVerdict::Failed => writeln!(
                f,
                "check 2 for user {}: {} (users {}, commitment 1 {}, commitment 2 {}, range proof {})",
                self.user,
                self.sum.outcome(),
                self.sum.population_matched,
                self.sum.commitment1_matched,
                self.sum.commitment2_matched,
                self.sum.range_proof_verified
            )?,
        }
        write!(f, "check 3 for user {}: {}", self.user, self.range)
    }
}

/// A user holding their own reading and blinding factor
#[derive(Clone)]
pub struct Participant {
    user: UserId,
    reading: u64,
    blinding: Blinding,
    population: u64,
    config: ProtocolConfig,
    gens: PedersenGens,
}

impl Participant {
    pub fn new(
        user: UserId,
        reading: u64,
        blinding: Blinding,
        population: u64,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            user,
            reading,
            blinding,
            population,
            config,
            gens: PedersenGens::default(),
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Check 1: recompute both commitments and compare with the published slot
    pub fn check_commitment(&self, unit: &dyn AuditUnit) -> CheckOutcome {
        let (c1, c2) = match unit.slot(self.user) {
            Ok(slot) => slot,
            Err(e) => return CheckOutcome::Failed(e.into()),
        };

        let x = i128::from(self.reading);
        let shifted = x - i128::from(self.config.delta) + self.max_range_end();
        let v1 = Commitment::commit(shifted, &self.blinding, &self.gens);
        let v2 = Commitment::commit(x, &self.blinding, &self.gens);

        if v1.equals(&c1) && v2.equals(&c2) {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed(FailureReason::ValueSubstituted)
        }
    }

    /// Check 2: reconcile the sum proof with the aggregate
    pub fn check_sum(&self, unit: &dyn AuditUnit, sum_proof: &ProofBlob) -> SumCheckReport {
        let proof = match sum_proof.decode() {
            Ok(proof) => proof,
            Err(e) => return SumCheckReport::faulted(e.into()),
        };
        match self.reconcile(unit, &proof) {
            Ok(report) => report,
            Err(e) => SumCheckReport::faulted(e.into()),
        }
    }

    fn reconcile(
        &self,
        unit: &dyn AuditUnit,
        proof: &RangeProof,
    ) -> crate::error::Result<SumCheckReport> {
        let view = unit.aggregate_view()?;
        let offset = dummy_offset(&self.config);

        // P1 + (excess * MAX) == C1, P2 + gamma == C2
        let excess = i128::from(view.excess_range_ends) * self.max_range_end();
        let commitment1_matched = offset.equals_shifted(&proof.p1, excess, &view.c1, 0)?;
        let commitment2_matched =
            offset.equals_shifted(&proof.p2, i128::from(self.config.gamma), &view.c2, 0)?;

        let declared = self
            .config
            .population_threshold(self.population)
            .map_or(false, |upper| proof.declares(self.config.gamma, upper));
        let range_proof_verified = declared && proof.verify().unwrap_or(false);

        Ok(SumCheckReport {
            population_matched: view.population == self.population,
            commitment1_matched,
            commitment2_matched,
            range_proof_verified,
            fault: None,
        })
    }

    /// Check 3: every proof the user received
    pub fn check_range_proofs(&self, unit: &dyn AuditUnit) -> CheckOutcome {
        match unit.range_failures(&self.config) {
            Ok(failures) if failures.is_empty() => CheckOutcome::Passed,
            Ok(failures) => CheckOutcome::Failed(FailureReason::InvalidProofs(failures)),
            Err(e) => CheckOutcome::Failed(e.into()),
        }
    }

    /// Run the three checks
    pub fn verify(&self, bundle: &AuditBundle, sum_proof: &ProofBlob) -> VerificationReport {
        if let Err(e) = self.config.validate() {
            log::warn!("User {} cannot check with this configuration: {}", self.user, e);
            let reason = FailureReason::from(PricingError::from(e));
            return VerificationReport {
                user: self.user,
                commitment: CheckOutcome::Failed(reason.clone()),
                sum: SumCheckReport::faulted(reason.clone()),
                range: CheckOutcome::Failed(reason),
            };
        }

        let unit = bundle.as_unit();
        let report = VerificationReport {
            user: self.user,
            commitment: self.check_commitment(unit),
            sum: self.check_sum(unit, sum_proof),
            range: self.check_range_proofs(unit),
        };

        if report.accepted() {
            log::debug!("User {} accepted the {} aggregate", self.user, bundle.scheme());
        } else {
            log::warn!("User {} rejected the {} aggregate", self.user, bundle.scheme());
        }
        report
    }

    fn max_range_end(&self) -> i128 {
        // n_bits <= 64
        self.config.max_range_end() as i128
    }
}
