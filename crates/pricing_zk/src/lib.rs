#![doc = include_str!("../README.md")]
//! # Pricing ZK - Verifiable Billing over Hidden Readings
//!
//! A company bills many users on the sum of their meter readings. It learns
//! every reading, but each user can check, without learning anyone else's
//! reading, that:
//!
//! - their own reading entered the sum unchanged
//! - the published sum is the sum of all readings
//! - every reading stayed below the agreed threshold `delta`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Pricing ZK                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Commitments │ Range proofs │ Flat │ Tree + Paths │ Verify   │
//! └─────────────────────────────────────────────────────────────┘
//!        │             │          │          │             │
//!        ├─ Pedersen   ├─ Setup   │          ├─ Build      ├─ Commitment
//!        └─ Dummy      ├─ Prove   │          ├─ GetLeaf    ├─ Sum
//!           offset     └─ Verify  │          └─ MerklePath └─ Range proofs
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use pricing_zk::{Aggregate, BillingSession, ProtocolConfig, Scheme};
//!
//! let mut session = BillingSession::initialize(3, ProtocolConfig::test_mode()).unwrap();
//! session.set_readings(&[10, 20, 30]).unwrap();
//! session.share_readings();
//!
//! let aggregate = session.process(Scheme::Tree).unwrap();
//! assert_eq!(aggregate.sum(), 60);
//!
//! let record = session.record_for(0).unwrap();
//! assert!(record.verify().accepted());
//! ```
//!
//! ## Security Considerations
//!
//! - **Shared generators**: every commitment uses `bulletproofs::PedersenGens::default()`,
//!   otherwise commitments cannot be added
//! - **Blinding factors must be random**: a user's blinding factor is as secret as the reading
//! - **Honest-but-curious company**: the proofs show the sum is right; they do not stop a
//!   company from refusing to bill

pub mod commitment;
pub mod config;
pub mod error;
pub mod flat;
pub mod path;
pub mod range;
pub mod record;
pub mod session;
pub mod strategy;
pub mod tree;
pub mod verify;

/// Index of a user within one interval
pub type UserId = u32;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export main types
pub use commitment::{Blinding, Commitment, DummyOffset};
pub use config::{ConfigError, ProtocolConfig};
pub use error::{PricingError, Result};
pub use flat::{FlatAggregate, FlatAggregator, FlatBundle};
pub use path::{MerklePath, PathNode, PathRef};
pub use range::{ProofBlob, RangeParams, RangeProof};
pub use record::UserRecord;
pub use session::BillingSession;
pub use strategy::{
    Aggregate, AggregateView, AggregationStrategy, AuditBundle, AuditUnit, ProofDefect,
    ProofFailure, ProofSubject, Scheme,
};
pub use tree::{AggregationTree, NodeId, TreeAggregate, TreeAggregator, TreeNode};
pub use verify::{
    CheckOutcome, FailureReason, Participant, SumCheckReport, SumVerdict, VerificationReport,
};
