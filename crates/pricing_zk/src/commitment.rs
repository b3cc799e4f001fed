//! Commitment algebra
//!
//! A Pedersen commitment to value `v` with blinding factor `r` is:
//! `C = v*G + r*H`
//!
//! where `G` and `H` are the generators of the range-proof backend
//! (`bulletproofs::PedersenGens`). Every commitment that will later be added
//! to another one must use the same generators, otherwise
//! `Commit(a, ra) + Commit(b, rb) = Commit(a + b, ra + rb)` does not hold.
//!
//! Values are signed: threshold-adjusted commitments such as
//! `Commit(x - delta + MAX_RANGE_END, r)` and the dummy offsets below can go
//! negative, which maps to the additive inverse in the scalar field.

use std::fmt;
use std::ops::Add;

use bulletproofs::PedersenGens;
use curve25519_dalek_ng::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::ProtocolConfig;
use crate::error::{PricingError, Result};

/// Map a signed integer into the scalar field.
pub(crate) fn scalar_from_i128(value: i128) -> Scalar {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(&value.unsigned_abs().to_le_bytes());
    let magnitude = Scalar::from_bytes_mod_order(bytes);
    if value < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Blinding factor (the randomness of a commitment)
///
/// Blinding factors are additive: the aggregate proof for a sum of readings
/// uses the sum of the users' blinding factors.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blinding {
    /// Canonical scalar bytes
    pub bytes: [u8; 32],
}

impl Blinding {
    /// Fresh random blinding factor
    pub fn random() -> Self {
        Self::from_scalar(&Scalar::random(&mut OsRng))
    }

    /// Small deterministic blinding factor, for reproducible runs
    pub fn from_u64(value: u64) -> Self {
        Self::from_scalar(&Scalar::from(value))
    }

    pub fn from_scalar(scalar: &Scalar) -> Self {
        Self {
            bytes: scalar.to_bytes(),
        }
    }

    pub fn to_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.bytes)
    }

    /// Sum of several blinding factors
    pub fn sum<'a, I>(blindings: I) -> Self
    where
        I: IntoIterator<Item = &'a Blinding>,
    {
        let total = blindings
            .into_iter()
            .fold(Scalar::zero(), |acc, b| acc + b.to_scalar());
        Self::from_scalar(&total)
    }
}

impl Add for Blinding {
    type Output = Blinding;

    fn add(self, rhs: Blinding) -> Blinding {
        Blinding::from_scalar(&(self.to_scalar() + rhs.to_scalar()))
    }
}

// Never print the secret.
impl fmt::Debug for Blinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Blinding(..)")
    }
}

/// Pedersen commitment, stored as a compressed Ristretto point
///
/// Properties:
/// - **Hiding**: Given C, you cannot determine v
/// - **Binding**: Given C, you cannot find different (v', r') such that C = v'*G + r'*H
/// - **Homomorphic**: commitments add like the values and blindings they hide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment {
    /// Compressed point representation
    pub point: [u8; 32],
}

impl Commitment {
    /// `Commit(value, blinding, H) = value*G + blinding*H`
    pub fn commit(value: i128, blinding: &Blinding, gens: &PedersenGens) -> Self {
        let point = gens.commit(scalar_from_i128(value), blinding.to_scalar());
        Self::from_point(&point)
    }

    pub fn from_point(point: &RistrettoPoint) -> Self {
        Self {
            point: point.compress().to_bytes(),
        }
    }

    pub fn from_compressed(compressed: &CompressedRistretto) -> Self {
        Self {
            point: compressed.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { point: bytes }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.point
    }

    pub fn to_compressed(&self) -> CompressedRistretto {
        CompressedRistretto(self.point)
    }

    /// Decompress the point
    pub fn to_point(&self) -> Result<RistrettoPoint> {
        self.to_compressed()
            .decompress()
            .ok_or(PricingError::InvalidCommitment)
    }

    /// Group addition
    ///
    /// If C1 = v1*G + r1*H and C2 = v2*G + r2*H
    /// Then C1 + C2 = (v1+v2)*G + (r1+r2)*H
    pub fn add(&self, other: &Self) -> Result<Self> {
        let sum = self.to_point()? + other.to_point()?;
        Ok(Self::from_point(&sum))
    }

    /// Sum of a non-empty set of commitments
    pub fn sum<'a, I>(commitments: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Commitment>,
    {
        let mut points = commitments.into_iter().map(Commitment::to_point);
        let first = points.next().ok_or(PricingError::EmptyPopulation)??;
        let total = points.try_fold(first, |acc, p| p.map(|p| acc + p))?;
        Ok(Self::from_point(&total))
    }

    /// Constant-time equality of the encoded points
    pub fn equals(&self, other: &Self) -> bool {
        self.point[..].ct_eq(&other.point[..]).into()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.point)
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Dummy-offset comparison of commitments
///
/// Checks of the form `A == B` where the values behind `A` and `B` differ by a
/// public constant are rewritten as
/// `A + Commit(dummy + shift_a, dummy) == B + Commit(dummy + shift_b, dummy)`.
/// The same nonzero `dummy` sits in both offsets, so the transform never asks
/// the backend to commit to zero with a zero blinding factor and leaves the
/// truth of the original equality unchanged.
#[derive(Clone, Copy)]
pub struct DummyOffset {
    dummy: u64,
    gens: PedersenGens,
}

impl DummyOffset {
    pub fn new(dummy: u64, gens: PedersenGens) -> Self {
        Self { dummy, gens }
    }

    pub fn from_config(config: &ProtocolConfig, gens: PedersenGens) -> Self {
        Self::new(config.dummy, gens)
    }

    /// `Commit(dummy + shift, dummy)`
    pub fn offset(&self, shift: i128) -> Commitment {
        Commitment::commit(
            i128::from(self.dummy) + shift,
            &Blinding::from_u64(self.dummy),
            &self.gens,
        )
    }

    /// `A + Commit(dummy, dummy) == B + Commit(dummy, dummy)`
    pub fn equals(&self, lhs: &Commitment, rhs: &Commitment) -> Result<bool> {
        self.equals_shifted(lhs, 0, rhs, 0)
    }

    /// `A + Commit(dummy + shift_a, dummy) == B + Commit(dummy + shift_b, dummy)`
    pub fn equals_shifted(
        &self,
        lhs: &Commitment,
        lhs_shift: i128,
        rhs: &Commitment,
        rhs_shift: i128,
    ) -> Result<bool> {
        let adjusted_lhs = lhs.add(&self.offset(lhs_shift))?;
        let adjusted_rhs = rhs.add(&self.offset(rhs_shift))?;
        Ok(adjusted_lhs.equals(&adjusted_rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_homomorphic_addition() {
        let gens = PedersenGens::default();
        let (ra, rb) = (Blinding::random(), Blinding::random());

        let ca = Commitment::commit(100, &ra, &gens);
        let cb = Commitment::commit(50, &rb, &gens);
        let expected = Commitment::commit(150, &(ra + rb), &gens);

        assert!(ca.add(&cb).unwrap().equals(&expected));
    }

    #[test]
    fn test_negative_values_cancel() {
        let gens = PedersenGens::default();
        let r = Blinding::from_u64(7);
        let zero_blinding = Blinding::from_scalar(&Scalar::zero());

        let c = Commitment::commit(-25, &r, &gens);
        let d = Commitment::commit(25, &zero_blinding, &gens);
        let expected = Commitment::commit(0, &r, &gens);

        assert!(c.add(&d).unwrap().equals(&expected));
    }

    #[test]
    fn test_sum_of_commitments() {
        let gens = PedersenGens::default();
        let blindings: Vec<Blinding> = (0..4).map(|_| Blinding::random()).collect();
        let commitments: Vec<Commitment> = blindings
            .iter()
            .zip([1i128, 2, 3, 4])
            .map(|(r, v)| Commitment::commit(v, r, &gens))
            .collect();

        let total = Commitment::sum(&commitments).unwrap();
        let expected = Commitment::commit(10, &Blinding::sum(&blindings), &gens);
        assert!(total.equals(&expected));

        assert!(matches!(
            Commitment::sum(&Vec::<Commitment>::new()),
            Err(PricingError::EmptyPopulation)
        ));
    }

    #[test]
    fn test_dummy_offset_preserves_equality() {
        let gens = PedersenGens::default();
        let offset = DummyOffset::new(10, gens);
        let r = Blinding::random();

        let a = Commitment::commit(40, &r, &gens);
        let b = Commitment::commit(40, &r, &gens);
        let c = Commitment::commit(41, &r, &gens);

        assert!(offset.equals(&a, &b).unwrap());
        assert!(!offset.equals(&a, &c).unwrap());

        // a hides 40, c hides 41: shifting a by one more than c reconciles them
        assert!(offset.equals_shifted(&a, 1, &c, 0).unwrap());
        assert!(!offset.equals_shifted(&a, 0, &c, 1).unwrap());
    }

    #[test]
    fn test_invalid_point() {
        let garbage = Commitment::from_bytes([0xff; 32]);
        assert!(matches!(
            garbage.to_point(),
            Err(PricingError::InvalidCommitment)
        ));
    }

    #[test]
    fn test_blinding_debug_is_redacted() {
        let r = Blinding::from_u64(12345);
        assert_eq!(format!("{:?}", r), "Blinding(..)");
    }

    #[test]
    fn test_commitment_serialization() {
        let gens = PedersenGens::default();
        let c = Commitment::commit(42, &Blinding::random(), &gens);

        let json = serde_json::to_string(&c).unwrap();
        let deserialized: Commitment = serde_json::from_str(&json).unwrap();

        assert_eq!(c, deserialized);
    }
}
