//! Aggregation strategies and the audit material they hand out
//!
//! Both schemes, flat and tree, are used through the same two traits:
//! [`AggregationStrategy`] turns readings into an [`Aggregate`], and an
//! aggregate hands every user an [`AuditBundle`]. The verification protocol
//! only ever sees a bundle through [`AuditUnit`], so each check is written
//! once for both schemes.

use std::collections::BTreeMap;
use std::fmt;

use bulletproofs::PedersenGens;
use serde::{Deserialize, Serialize};

use crate::commitment::{Blinding, Commitment, DummyOffset};
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::flat::{FlatAggregator, FlatBundle};
use crate::path::MerklePath;
use crate::range::{ProofBlob, RangeProof};
use crate::tree::TreeAggregator;
use crate::UserId;

/// Which aggregation scheme a company runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// One proof per user plus one sum proof
    Flat,
    /// Partial sums proven level by level
    Tree,
}

impl Scheme {
    pub fn strategy(self) -> Box<dyn AggregationStrategy> {
        match self {
            Scheme::Flat => Box::new(FlatAggregator),
            Scheme::Tree => Box::new(TreeAggregator),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Flat => f.write_str("flat"),
            Scheme::Tree => f.write_str("tree"),
        }
    }
}

/// Turns one interval's readings into proof material
pub trait AggregationStrategy: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// Process the readings of every user.
    ///
    /// Any reading the backend refuses aborts the whole phase, with the
    /// offending user attached to the error.
    fn aggregate(
        &self,
        readings: &BTreeMap<UserId, u64>,
        blindings: &BTreeMap<UserId, Blinding>,
        config: &ProtocolConfig,
    ) -> Result<Box<dyn Aggregate>>;
}

/// The company's result for one interval
pub trait Aggregate: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// Sum of all readings
    fn sum(&self) -> u64;

    /// Number of users aggregated
    fn population(&self) -> u64;

    /// Proof for the sum under `Setup(gamma, population * delta)`
    fn sum_proof(&self) -> &RangeProof;

    /// Audit material sent to `user`
    fn bundle_for(&self, user: UserId) -> Result<AuditBundle>;
}

/// Audit material one user receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBundle {
    /// Every user's commitments and proof
    Flat(FlatBundle),
    /// The audit path from the user's leaf to the root
    Tree(MerklePath),
}

impl AuditBundle {
    pub fn scheme(&self) -> Scheme {
        match self {
            AuditBundle::Flat(_) => Scheme::Flat,
            AuditBundle::Tree(_) => Scheme::Tree,
        }
    }

    pub fn as_unit(&self) -> &dyn AuditUnit {
        match self {
            AuditBundle::Flat(bundle) => bundle,
            AuditBundle::Tree(path) => path,
        }
    }
}

/// What the sum proof is reconciled against
///
/// The proof commits to `sum - population * delta + MAX_RANGE_END` and
/// `sum - gamma`. `c1` commits to the same threshold-adjusted sum plus
/// `excess_range_ends * MAX_RANGE_END`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateView {
    pub c1: Commitment,
    /// Plain commitment to the sum
    pub c2: Commitment,
    pub population: u64,
    pub excess_range_ends: u64,
}

/// Audit material as seen by the verification protocol
pub trait AuditUnit {
    /// The `(C1, C2)` pair published for `user`
    fn slot(&self, user: UserId) -> Result<(Commitment, Commitment)>;

    fn aggregate_view(&self) -> Result<AggregateView>;

    /// Verify every proof carried by the unit and list what failed
    ///
    /// An empty list means every proof is valid.
    fn range_failures(&self, config: &ProtocolConfig) -> Result<Vec<ProofFailure>>;
}

/// Where a failing proof sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofSubject {
    /// A user's proof in the flat scheme
    User(UserId),
    /// `Core[i]` of an audit path
    Core(usize),
    /// `Edge[i]` of an audit path
    Edge(usize),
    /// The `(Core[i + 1], Core[i], Edge[i])` triple of an audit path
    Level(usize),
}

impl fmt::Display for ProofSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofSubject::User(user) => write!(f, "user {}", user),
            ProofSubject::Core(i) => write!(f, "core node {}", i),
            ProofSubject::Edge(i) => write!(f, "edge node {}", i),
            ProofSubject::Level(i) => write!(f, "path level {}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofDefect {
    /// `P1` of the proof differs from the published `C1`
    Commitment1Mismatch,
    /// `P2` of the proof differs from the published `C2`
    Commitment2Mismatch,
    /// The Bulletproofs do not verify
    InvalidProof,
    /// The proof declares `[lower, upper)` instead of the protocol's interval
    WrongRange { lower: u64, upper: u64 },
    /// Commitments of a path level do not add up
    InconsistentSums,
    /// No proof published for the subject
    Missing,
    /// Proof bytes do not decode
    Undecodable(String),
}

impl fmt::Display for ProofDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofDefect::Commitment1Mismatch => f.write_str("commitment 1 did not match"),
            ProofDefect::Commitment2Mismatch => f.write_str("commitment 2 did not match"),
            ProofDefect::InvalidProof => f.write_str("invalid proof"),
            ProofDefect::WrongRange { lower, upper } => {
                write!(f, "proof declares [{}, {})", lower, upper)
            }
            ProofDefect::InconsistentSums => f.write_str("not a valid path"),
            ProofDefect::Missing => f.write_str("missing proof"),
            ProofDefect::Undecodable(msg) => write!(f, "undecodable proof: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofFailure {
    pub subject: ProofSubject,
    pub defect: ProofDefect,
}

impl ProofFailure {
    pub fn new(subject: ProofSubject, defect: ProofDefect) -> Self {
        Self { subject, defect }
    }
}

impl fmt::Display for ProofFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.defect)
    }
}

/// Check one published proof against its published commitments and, when
/// given, the interval it must declare.
///
/// Every defect is reported, not only the first.
pub(crate) fn inspect_proof(
    subject: ProofSubject,
    blob: &ProofBlob,
    c1: &Commitment,
    c2: &Commitment,
    expected_range: Option<(u64, u64)>,
) -> Vec<ProofFailure> {
    let proof = match blob.decode() {
        Ok(proof) => proof,
        Err(e) => {
            return vec![ProofFailure::new(
                subject,
                ProofDefect::Undecodable(e.to_string()),
            )]
        }
    };

    let mut failures = Vec::new();
    if let Some((lower, upper)) = expected_range {
        if !proof.declares(lower, upper) {
            failures.push(ProofFailure::new(
                subject,
                ProofDefect::WrongRange {
                    lower: proof.lower,
                    upper: proof.upper,
                },
            ));
        }
    }
    if !proof.p1.equals(c1) {
        failures.push(ProofFailure::new(subject, ProofDefect::Commitment1Mismatch));
    }
    if !proof.p2.equals(c2) {
        failures.push(ProofFailure::new(subject, ProofDefect::Commitment2Mismatch));
    }
    match proof.verify() {
        Ok(true) => {}
        Ok(false) => failures.push(ProofFailure::new(subject, ProofDefect::InvalidProof)),
        Err(e) => failures.push(ProofFailure::new(
            subject,
            ProofDefect::Undecodable(e.to_string()),
        )),
    }
    failures
}

/// Dummy offset over the backend's generators
pub(crate) fn dummy_offset(config: &ProtocolConfig) -> DummyOffset {
    DummyOffset::from_config(config, PedersenGens::default())
}
