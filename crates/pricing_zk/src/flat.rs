//! Flat aggregation: one range proof per user plus one proof for the sum
//!
//! Every user receives the full set of published commitments and proofs, so
//! each user can recompute the homomorphic sum and check every other proof.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::commitment::{Blinding, Commitment};
use crate::config::ProtocolConfig;
use crate::error::{PricingError, Result};
use crate::range::{ProofBlob, RangeParams, RangeProof};
use crate::strategy::{
    inspect_proof, Aggregate, AggregateView, AggregationStrategy, AuditBundle, AuditUnit,
    ProofDefect, ProofFailure, ProofSubject, Scheme,
};
use crate::UserId;

/// Pair every reading with its blinding factor, in ascending user order.
pub(crate) fn collect_inputs(
    readings: &BTreeMap<UserId, u64>,
    blindings: &BTreeMap<UserId, Blinding>,
) -> Result<Vec<(UserId, u64, Blinding)>> {
    if readings.is_empty() {
        return Err(PricingError::EmptyPopulation);
    }
    readings
        .iter()
        .map(|(&user, &value)| {
            blindings
                .get(&user)
                .map(|blinding| (user, value, *blinding))
                .ok_or(PricingError::MissingBlinding(user))
        })
        .collect()
}

/// Prove the sum of all readings with the sum of all blinding factors.
///
/// A sum below `gamma` still yields a proof, one that does not certify the
/// margin.
pub(crate) fn prove_sum(
    inputs: &[(UserId, u64, Blinding)],
    config: &ProtocolConfig,
) -> Result<(u64, RangeProof)> {
    let sum = inputs
        .iter()
        .try_fold(0u64, |acc, (_, value, _)| acc.checked_add(*value))
        .ok_or_else(|| PricingError::InvalidInput("sum of readings overflows".into()))?;
    let total_blinding = Blinding::sum(inputs.iter().map(|(_, _, blinding)| blinding));

    let params = RangeParams::for_sum(config, inputs.len() as u64)?;
    let proof = RangeProof::prove_with_shortfall(sum, &params, &total_blinding)?;
    if !proof.is_certified() {
        log::warn!(
            "Sum {} is below the peak margin {}: peak rate cannot be charged",
            sum,
            config.gamma
        );
    }
    Ok((sum, proof))
}

/// The flat scheme
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatAggregator;

impl FlatAggregator {
    /// `Process(readings, blindings, params) -> (sum, perUserProofs, aggregateProof)`
    pub fn process(
        &self,
        readings: &BTreeMap<UserId, u64>,
        blindings: &BTreeMap<UserId, Blinding>,
        config: &ProtocolConfig,
    ) -> Result<FlatAggregate> {
        let inputs = collect_inputs(readings, blindings)?;
        let params = RangeParams::for_reading(config)?;
        log::debug!("Proving {} readings (flat)", inputs.len());

        let (proofs, sum_result) = rayon::join(
            || {
                inputs
                    .par_iter()
                    .map(|(user, value, blinding)| {
                        RangeProof::prove(*value, &params, blinding)
                            .map(|proof| (*user, proof))
                            .map_err(|e| e.for_user(*user))
                    })
                    .collect::<Result<Vec<_>>>()
            },
            || prove_sum(&inputs, config),
        );

        let proofs: BTreeMap<UserId, RangeProof> = proofs?.into_iter().collect();
        let (sum, sum_proof) = sum_result?;
        log::info!("Aggregated {} readings, sum {}", proofs.len(), sum);

        Ok(FlatAggregate {
            sum,
            proofs,
            sum_proof,
        })
    }
}

impl AggregationStrategy for FlatAggregator {
    fn scheme(&self) -> Scheme {
        Scheme::Flat
    }

    fn aggregate(
        &self,
        readings: &BTreeMap<UserId, u64>,
        blindings: &BTreeMap<UserId, Blinding>,
        config: &ProtocolConfig,
    ) -> Result<Box<dyn Aggregate>> {
        Ok(Box::new(self.process(readings, blindings, config)?))
    }
}

/// Result of the flat scheme
#[derive(Debug, Clone)]
pub struct FlatAggregate {
    sum: u64,
    proofs: BTreeMap<UserId, RangeProof>,
    sum_proof: RangeProof,
}

impl FlatAggregate {
    /// Per-user proofs keyed by user id
    pub fn proofs(&self) -> &BTreeMap<UserId, RangeProof> {
        &self.proofs
    }

    /// Threshold-adjusted commitments keyed by user id
    pub fn commits1(&self) -> BTreeMap<UserId, Commitment> {
        self.proofs.iter().map(|(&user, p)| (user, p.p1)).collect()
    }

    /// Plain value commitments keyed by user id
    pub fn commits2(&self) -> BTreeMap<UserId, Commitment> {
        self.proofs.iter().map(|(&user, p)| (user, p.p2)).collect()
    }

    /// What every user receives
    pub fn bundle(&self) -> FlatBundle {
        FlatBundle {
            commits1: self.commits1(),
            commits2: self.commits2(),
            proofs: self
                .proofs
                .iter()
                .map(|(&user, p)| (user, ProofBlob::from_proof(p)))
                .collect(),
        }
    }
}

impl Aggregate for FlatAggregate {
    fn scheme(&self) -> Scheme {
        Scheme::Flat
    }

    fn sum(&self) -> u64 {
        self.sum
    }

    fn population(&self) -> u64 {
        self.proofs.len() as u64
    }

    fn sum_proof(&self) -> &RangeProof {
        &self.sum_proof
    }

    fn bundle_for(&self, user: UserId) -> Result<AuditBundle> {
        if !self.proofs.contains_key(&user) {
            return Err(PricingError::InvalidInput(format!(
                "user {} did not take part in the interval",
                user
            )));
        }
        Ok(AuditBundle::Flat(self.bundle()))
    }
}

/// Audit material of the flat scheme: three maps keyed by user id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatBundle {
    pub commits1: BTreeMap<UserId, Commitment>,
    pub commits2: BTreeMap<UserId, Commitment>,
    pub proofs: BTreeMap<UserId, ProofBlob>,
}

impl AuditUnit for FlatBundle {
    fn slot(&self, user: UserId) -> Result<(Commitment, Commitment)> {
        match (self.commits1.get(&user), self.commits2.get(&user)) {
            (Some(c1), Some(c2)) => Ok((*c1, *c2)),
            _ => Err(PricingError::InvalidInput(format!(
                "no commitments published for user {}",
                user
            ))),
        }
    }

    fn aggregate_view(&self) -> Result<AggregateView> {
        let population = self.commits2.len() as u64;
        Ok(AggregateView {
            c1: Commitment::sum(self.commits1.values())?,
            c2: Commitment::sum(self.commits2.values())?,
            population,
            // each threshold-adjusted commitment carries one MAX_RANGE_END
            excess_range_ends: population.saturating_sub(1),
        })
    }

    fn range_failures(&self, config: &ProtocolConfig) -> Result<Vec<ProofFailure>> {
        let reading_range = Some((0, config.delta));
        let users: Vec<UserId> = self
            .proofs
            .keys()
            .chain(self.commits1.keys())
            .chain(self.commits2.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let failures = users
            .par_iter()
            .flat_map_iter(|&user| {
                let subject = ProofSubject::User(user);
                match (
                    self.proofs.get(&user),
                    self.commits1.get(&user),
                    self.commits2.get(&user),
                ) {
                    (Some(blob), Some(c1), Some(c2)) => {
                        inspect_proof(subject, blob, c1, c2, reading_range)
                    }
                    _ => vec![ProofFailure::new(subject, ProofDefect::Missing)],
                }
            })
            .collect();

        Ok(failures)
    }
}
