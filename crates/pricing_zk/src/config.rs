//! Protocol configuration for one billing interval.
//!
//! The aggregator and every user must agree on the same [`ProtocolConfig`]:
//! it fixes the per-interval threshold `delta`, the peak-excess margin
//! `gamma`, the Bulletproofs width and the dummy offset used when comparing
//! commitments.
//!
//! # Examples
//!
//! ```
//! # use pricing_zk::ProtocolConfig;
//! let config = ProtocolConfig::default().with_delta(200).with_gamma(0);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_range_end(), 1u128 << 32);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the per-interval threshold
pub const ENV_DELTA: &str = "PRICING_DELTA";
/// Environment variable overriding the peak-excess margin
pub const ENV_GAMMA: &str = "PRICING_GAMMA";
/// Environment variable overriding the range-proof width in bits
pub const ENV_RANGE_BITS: &str = "PRICING_RANGE_BITS";
/// Environment variable overriding the dummy offset
pub const ENV_DUMMY: &str = "PRICING_DUMMY";

/// Bit widths supported by the Bulletproofs backend
pub const SUPPORTED_RANGE_BITS: [usize; 4] = [8, 16, 32, 64];

/// Errors raised while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The threshold must be strictly positive.
    #[error("delta must be greater than zero")]
    ZeroDelta,
    /// The dummy offset must be nonzero.
    #[error("dummy offset must be nonzero")]
    ZeroDummy,
    /// The backend only proves 8, 16, 32 or 64 bit ranges.
    #[error("unsupported range width: {0} bits")]
    UnsupportedRangeBits(usize),
    /// The threshold does not fit the proof width.
    #[error("delta {delta} does not fit in a {n_bits}-bit range")]
    DeltaTooLarge { delta: u64, n_bits: usize },
    /// The population threshold `n * delta` does not fit the proof width.
    #[error("population threshold for {population} users exceeds the {n_bits}-bit range")]
    PopulationTooLarge { population: u64, n_bits: usize },
    /// An environment variable could not be parsed.
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Parameters shared by the aggregator and all users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Per-user threshold: every reading must be `< delta`.
    pub delta: u64,
    /// Peak-excess margin: the peak rate applies only when the sum is `>= gamma`.
    pub gamma: u64,
    /// Width of the Bulletproofs range, `MAX_RANGE_END = 2^n_bits`.
    pub n_bits: usize,
    /// Nonzero offset added to both sides of a commitment comparison.
    pub dummy: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            delta: 120,
            gamma: 500,
            n_bits: 32,
            dummy: 10,
        }
    }
}

impl ProtocolConfig {
    /// Configuration for tests: no peak-excess margin.
    pub fn test_mode() -> Self {
        Self {
            gamma: 0,
            ..Self::default()
        }
    }

    /// Set the per-user threshold.
    pub fn with_delta(mut self, delta: u64) -> Self {
        self.delta = delta;
        self
    }

    /// Set the peak-excess margin.
    pub fn with_gamma(mut self, gamma: u64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set the range-proof width.
    pub fn with_range_bits(mut self, n_bits: usize) -> Self {
        self.n_bits = n_bits;
        self
    }

    /// Set the dummy offset.
    pub fn with_dummy(mut self, dummy: u64) -> Self {
        self.dummy = dummy;
        self
    }

    /// Load the default configuration, overridden by `PRICING_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(delta) = read_env(ENV_DELTA)? {
            config.delta = delta;
        }
        if let Some(gamma) = read_env(ENV_GAMMA)? {
            config.gamma = gamma;
        }
        if let Some(bits) = read_env::<usize>(ENV_RANGE_BITS)? {
            config.n_bits = bits;
        }
        if let Some(dummy) = read_env(ENV_DUMMY)? {
            config.dummy = dummy;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable by the backend.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delta == 0 {
            return Err(ConfigError::ZeroDelta);
        }
        if self.dummy == 0 {
            return Err(ConfigError::ZeroDummy);
        }
        if !SUPPORTED_RANGE_BITS.contains(&self.n_bits) {
            return Err(ConfigError::UnsupportedRangeBits(self.n_bits));
        }
        if u128::from(self.delta) >= self.max_range_end() {
            return Err(ConfigError::DeltaTooLarge {
                delta: self.delta,
                n_bits: self.n_bits,
            });
        }
        Ok(())
    }

    /// `2^n_bits`, the exclusive end of every Bulletproofs range.
    ///
    /// Saturates at `u128::MAX` for widths no backend supports.
    pub fn max_range_end(&self) -> u128 {
        u32::try_from(self.n_bits)
            .ok()
            .and_then(|bits| 1u128.checked_shl(bits))
            .unwrap_or(u128::MAX)
    }

    /// Threshold of a subtree or population of `population` users: `population * delta`.
    pub fn population_threshold(&self, population: u64) -> Result<u64, ConfigError> {
        let too_large = ConfigError::PopulationTooLarge {
            population,
            n_bits: self.n_bits,
        };
        let threshold = self.delta.checked_mul(population).ok_or(too_large.clone())?;
        if u128::from(threshold) > self.max_range_end() {
            return Err(too_large);
        }
        Ok(threshold)
    }
}

fn read_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}
