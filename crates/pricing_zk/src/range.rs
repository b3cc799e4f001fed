//! Range proofs over an interval `[lower, upper)` using Bulletproofs
//!
//! A Bulletproof only shows that a committed value lies in `[0, 2^n)`. An
//! arbitrary interval is covered with two of them sharing one blinding
//! factor `r`:
//!
//! - `P1 = Commit(x - upper + MAX_RANGE_END, r)` in `[0, 2^n)` shows `x < upper`
//! - `P2 = Commit(x - lower, r)` in `[0, 2^n)` shows `x >= lower`
//!
//! With `lower = 0`, `P2` is the plain commitment to `x` used for homomorphic
//! summation, and `P1` is the threshold-adjusted commitment.
//!
//! ## Example
//!
//! ```rust
//! use pricing_zk::{Blinding, RangeParams, RangeProof};
//!
//! // Setup(0, 120): readings must stay below 120
//! let params = RangeParams::setup(0, 120, 32).unwrap();
//! let proof = RangeProof::prove(119, &params, &Blinding::random()).unwrap();
//! assert!(proof.verify().unwrap());
//!
//! // At the threshold the backend refuses to prove
//! assert!(RangeProof::prove(120, &params, &Blinding::random()).is_err());
//! ```

use bulletproofs::{BulletproofGens, PedersenGens, RangeProof as BPRangeProof};
use merlin::Transcript;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::commitment::{Blinding, Commitment};
use crate::config::ProtocolConfig;
use crate::error::{PricingError, Result};

/// Bulletproofs are produced one value at a time
const PARTY_CAPACITY: usize = 1;

/// Transcript label of the `x < upper` component
const UPPER_BOUND_LABEL: &[u8] = b"pricing_zk_upper_bound";
/// Transcript label of the `x >= lower` component
const LOWER_BOUND_LABEL: &[u8] = b"pricing_zk_lower_bound";

/// Generators per supported width, built on first use
static GENS_8: Lazy<BulletproofGens> = Lazy::new(|| BulletproofGens::new(8, PARTY_CAPACITY));
static GENS_16: Lazy<BulletproofGens> = Lazy::new(|| BulletproofGens::new(16, PARTY_CAPACITY));
static GENS_32: Lazy<BulletproofGens> = Lazy::new(|| BulletproofGens::new(32, PARTY_CAPACITY));
static GENS_64: Lazy<BulletproofGens> = Lazy::new(|| BulletproofGens::new(64, PARTY_CAPACITY));

/// Shared Bulletproof generators for a `n_bits` wide range
fn bulletproof_gens(n_bits: usize) -> Result<&'static BulletproofGens> {
    match n_bits {
        8 => Ok(&GENS_8),
        16 => Ok(&GENS_16),
        32 => Ok(&GENS_32),
        64 => Ok(&GENS_64),
        _ => Err(PricingError::InvalidInput(format!(
            "unsupported range width: {} bits",
            n_bits
        ))),
    }
}

/// Setup of a range proof: declared interval and generators
///
/// Bulletproof generators are built once per width and shared by every
/// setup of that width.
#[derive(Clone)]
pub struct RangeParams {
    lower: u64,
    upper: u64,
    n_bits: usize,
    /// Bulletproof generators (precomputed elliptic curve points)
    bp_gens: &'static BulletproofGens,
    /// Pedersen generators (G and H points), shared by every commitment
    pc_gens: PedersenGens,
}

impl RangeParams {
    /// `Setup(lower, upper)` for a `n_bits` wide backend
    ///
    /// # Errors
    /// Returns `InvalidInput` if the width is not 8, 16, 32 or 64 bits or if
    /// `upper` exceeds `2^n_bits`.
    pub fn setup(lower: u64, upper: u64, n_bits: usize) -> Result<Self> {
        let bp_gens = bulletproof_gens(n_bits)?;
        if u128::from(upper) > 1u128 << n_bits {
            return Err(PricingError::InvalidInput(format!(
                "upper bound {} exceeds the {}-bit range",
                upper, n_bits
            )));
        }

        Ok(Self {
            lower,
            upper,
            n_bits,
            bp_gens,
            pc_gens: PedersenGens::default(),
        })
    }

    /// `Setup(0, delta)`: the parameters of one user's reading
    pub fn for_reading(config: &ProtocolConfig) -> Result<Self> {
        Self::setup(0, config.delta, config.n_bits)
    }

    /// `Setup(0, delta * size)`: the parameters of a subtree of `size` users
    pub fn for_subtree(config: &ProtocolConfig, size: u64) -> Result<Self> {
        Self::setup(0, config.population_threshold(size)?, config.n_bits)
    }

    /// `Setup(gamma, delta * population)`: the parameters of the aggregate sum proof
    pub fn for_sum(config: &ProtocolConfig, population: u64) -> Result<Self> {
        Self::setup(
            config.gamma,
            config.population_threshold(population)?,
            config.n_bits,
        )
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    pub fn n_bits(&self) -> usize {
        self.n_bits
    }

    /// `2^n_bits`
    pub fn max_range_end(&self) -> u128 {
        1u128 << self.n_bits
    }

    /// Generators every commitment of this protocol must share
    pub fn pedersen_gens(&self) -> &PedersenGens {
        &self.pc_gens
    }

    /// Produce one Bulletproof for `value` in `[0, 2^n_bits)`
    fn prove_component(
        &self,
        value: u128,
        blinding: &Blinding,
        label: &'static [u8],
    ) -> Result<(Vec<u8>, Commitment)> {
        if value >= self.max_range_end() {
            return Err(PricingError::InvalidRange(self.lower, self.upper));
        }
        let value = u64::try_from(value)
            .map_err(|_| PricingError::InvalidRange(self.lower, self.upper))?;

        let mut transcript = Transcript::new(label);
        let (proof, committed) = BPRangeProof::prove_single(
            self.bp_gens,
            &self.pc_gens,
            &mut transcript,
            value,
            &blinding.to_scalar(),
            self.n_bits,
        )
        .map_err(|e| PricingError::CryptoError(format!("Range proof generation failed: {:?}", e)))?;

        Ok((proof.to_bytes(), Commitment::from_compressed(&committed)))
    }
}

/// Verify one Bulletproof against its commitment
fn verify_component(
    bp_gens: &BulletproofGens,
    pc_gens: &PedersenGens,
    proof_bytes: &[u8],
    commitment: &Commitment,
    label: &'static [u8],
    n_bits: usize,
) -> Result<bool> {
    let proof = BPRangeProof::from_bytes(proof_bytes)
        .map_err(|e| PricingError::InvalidProof(format!("Invalid proof bytes: {:?}", e)))?;

    let mut transcript = Transcript::new(label);
    Ok(proof
        .verify_single(
            bp_gens,
            pc_gens,
            &mut transcript,
            &commitment.to_compressed(),
            n_bits,
        )
        .is_ok())
}

/// A proof that a committed value lies in `[lower, upper)`
///
/// Carries its two public commitments and the declared interval, so that
/// [`RangeProof::verify`] needs nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProof {
    /// `Commit(x - upper + MAX_RANGE_END, r)`
    pub p1: Commitment,
    /// `Commit(x - lower, r)`
    pub p2: Commitment,
    /// Declared lower bound (inclusive)
    pub lower: u64,
    /// Declared upper bound (exclusive)
    pub upper: u64,
    /// Width of the Bulletproofs range
    pub n_bits: usize,
    /// Bulletproof over `P1`
    pub upper_proof: Vec<u8>,
    /// Bulletproof over `P2`, absent when the value fell short of `lower`
    pub lower_proof: Option<Vec<u8>>,
}

impl RangeProof {
    /// `Prove(value, params, blinding)`
    ///
    /// # Errors
    /// Returns `InvalidRange` if `value` is outside `[lower, upper)`.
    pub fn prove(value: u64, params: &RangeParams, blinding: &Blinding) -> Result<Self> {
        if value < params.lower {
            return Err(PricingError::InvalidRange(params.lower, params.upper));
        }
        Self::prove_with_shortfall(value, params, blinding)
    }

    /// Like [`RangeProof::prove`], but a value below `lower` still yields a
    /// proof with well-formed commitments. Its lower-bound component is left
    /// out, so the proof never verifies: the sum is auditable but the margin
    /// is not certified.
    ///
    /// # Errors
    /// Returns `InvalidRange` if `value >= upper`.
    pub fn prove_with_shortfall(
        value: u64,
        params: &RangeParams,
        blinding: &Blinding,
    ) -> Result<Self> {
        if value >= params.upper {
            return Err(PricingError::InvalidRange(params.lower, params.upper));
        }

        let shifted = u128::from(value) + params.max_range_end() - u128::from(params.upper);
        let (upper_proof, p1) = params.prove_component(shifted, blinding, UPPER_BOUND_LABEL)?;

        let (lower_proof, p2) = if value >= params.lower {
            let (proof, p2) = params.prove_component(
                u128::from(value - params.lower),
                blinding,
                LOWER_BOUND_LABEL,
            )?;
            (Some(proof), p2)
        } else {
            let deficit = i128::from(value) - i128::from(params.lower);
            (None, Commitment::commit(deficit, blinding, &params.pc_gens))
        };

        Ok(Self {
            p1,
            p2,
            lower: params.lower,
            upper: params.upper,
            n_bits: params.n_bits,
            upper_proof,
            lower_proof,
        })
    }

    /// `Proof.Verify()`
    ///
    /// `Ok(false)` if either component fails or the lower-bound component is
    /// missing. Errors only on undecodable proof bytes or an unsupported width.
    pub fn verify(&self) -> Result<bool> {
        let bp_gens = bulletproof_gens(self.n_bits)?;
        let lower_proof = match &self.lower_proof {
            Some(proof) => proof,
            None => return Ok(false),
        };

        let pc_gens = PedersenGens::default();

        let upper_ok = verify_component(
            bp_gens,
            &pc_gens,
            &self.upper_proof,
            &self.p1,
            UPPER_BOUND_LABEL,
            self.n_bits,
        )?;
        let lower_ok = verify_component(
            bp_gens,
            &pc_gens,
            lower_proof,
            &self.p2,
            LOWER_BOUND_LABEL,
            self.n_bits,
        )?;

        Ok(upper_ok && lower_ok)
    }

    /// Whether the lower bound was proven
    pub fn is_certified(&self) -> bool {
        self.lower_proof.is_some()
    }

    /// Whether this proof declares the interval `[lower, upper)`
    pub fn declares(&self, lower: u64, upper: u64) -> bool {
        self.lower == lower && self.upper == upper
    }

    /// Get the proof size in bytes
    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Serialize to compact binary format
    ///
    /// More efficient than JSON for storage and transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        let lower_proof = self.lower_proof.as_deref().unwrap_or(&[]);
        let mut bytes =
            Vec::with_capacity(90 + self.upper_proof.len() + lower_proof.len());

        // n_bits as u16 (2 bytes)
        bytes.extend_from_slice(&(self.n_bits as u16).to_le_bytes());

        // declared interval (8 + 8 bytes)
        bytes.extend_from_slice(&self.lower.to_le_bytes());
        bytes.extend_from_slice(&self.upper.to_le_bytes());

        // commitments (32 + 32 bytes)
        bytes.extend_from_slice(&self.p1.point);
        bytes.extend_from_slice(&self.p2.point);

        // length-prefixed components, a zero length marks a missing lower proof
        bytes.extend_from_slice(&(self.upper_proof.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.upper_proof);
        bytes.extend_from_slice(&(lower_proof.len() as u32).to_le_bytes());
        bytes.extend_from_slice(lower_proof);

        bytes
    }

    /// Deserialize from compact binary format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        let n_bits = u16::from_le_bytes(reader.array()?) as usize;
        let lower = u64::from_le_bytes(reader.array()?);
        let upper = u64::from_le_bytes(reader.array()?);
        let p1 = Commitment::from_bytes(reader.array()?);
        let p2 = Commitment::from_bytes(reader.array()?);

        let upper_len = u32::from_le_bytes(reader.array()?) as usize;
        let upper_proof = reader.take(upper_len)?.to_vec();
        let lower_len = u32::from_le_bytes(reader.array()?) as usize;
        let lower_proof = match lower_len {
            0 => None,
            len => Some(reader.take(len)?.to_vec()),
        };

        if !reader.is_empty() {
            return Err(PricingError::InvalidProof("Trailing bytes after proof".into()));
        }

        Ok(Self {
            p1,
            p2,
            lower,
            upper,
            n_bits,
            upper_proof,
            lower_proof,
        })
    }
}

/// A range proof in compact binary form, as exchanged with users
///
/// Serialized as a hex string, so the bytes survive a JSON round trip
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBlob(#[serde(with = "hex")] pub Vec<u8>);

impl ProofBlob {
    pub fn from_proof(proof: &RangeProof) -> Self {
        Self(proof.to_bytes())
    }

    pub fn decode(&self) -> Result<RangeProof> {
        RangeProof::from_bytes(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&RangeProof> for ProofBlob {
    fn from(proof: &RangeProof) -> Self {
        Self::from_proof(proof)
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| PricingError::InvalidProof("Proof bytes truncated".into()))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        slice
            .try_into()
            .map_err(|_| PricingError::InvalidProof("Invalid field length".into()))
    }

    fn is_empty(&self) -> bool {
        self.offset == self.bytes.len()
    }
}
