//! One billing interval: users, their company, and the exchange between them

use std::collections::BTreeMap;

use rand::Rng;
use rayon::prelude::*;

use crate::commitment::Blinding;
use crate::config::ProtocolConfig;
use crate::error::{PricingError, Result};
use crate::range::ProofBlob;
use crate::record::UserRecord;
use crate::strategy::{Aggregate, Scheme};
use crate::verify::VerificationReport;
use crate::UserId;

#[derive(Debug, Clone)]
struct UserState {
    reading: u64,
    blinding: Blinding,
}

/// The company's state, rebuilt every interval
#[derive(Default)]
struct Company {
    readings: BTreeMap<UserId, u64>,
    blindings: BTreeMap<UserId, Blinding>,
    aggregate: Option<Box<dyn Aggregate>>,
}

/// Users and company for one interval
///
/// # Examples
///
/// ```no_run
/// use pricing_zk::{BillingSession, ProtocolConfig, Scheme};
///
/// let mut session = BillingSession::initialize(10, ProtocolConfig::default()).unwrap();
/// session.draw_readings(100).unwrap();
/// session.share_readings();
/// session.process(Scheme::Tree).unwrap();
///
/// for report in session.verify_all().unwrap() {
///     println!("{}", report);
/// }
/// ```
pub struct BillingSession {
    config: ProtocolConfig,
    users: BTreeMap<UserId, UserState>,
    company: Company,
}

impl BillingSession {
    /// Create `n` users with zero readings and fresh blinding factors
    pub fn initialize(n: usize, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        if n == 0 {
            return Err(PricingError::EmptyPopulation);
        }
        let population = u64::try_from(n)
            .map_err(|_| PricingError::InvalidInput(format!("population {} too large", n)))?;
        config.population_threshold(population)?;
        let last = UserId::try_from(n - 1)
            .map_err(|_| PricingError::InvalidInput(format!("population {} too large", n)))?;

        let users = (0..=last)
            .map(|user| {
                (
                    user,
                    UserState {
                        reading: 0,
                        blinding: Blinding::random(),
                    },
                )
            })
            .collect();

        Ok(Self {
            config,
            users,
            company: Company::default(),
        })
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn population(&self) -> u64 {
        self.users.len() as u64
    }

    pub fn reading(&self, user: UserId) -> Option<u64> {
        self.users.get(&user).map(|state| state.reading)
    }

    /// Draw every reading uniformly from `[0, max)`
    pub fn draw_readings(&mut self, max: u64) -> Result<()> {
        if max == 0 {
            return Err(PricingError::InvalidInput("maximum reading must be positive".into()));
        }
        let mut rng = rand::thread_rng();
        for state in self.users.values_mut() {
            state.reading = rng.gen_range(0..max);
        }
        log::debug!("Drew {} readings below {}", self.users.len(), max);
        Ok(())
    }

    /// Set the readings of users `0..n` in order
    pub fn set_readings(&mut self, readings: &[u64]) -> Result<()> {
        if readings.len() != self.users.len() {
            return Err(PricingError::InvalidInput(format!(
                "{} readings for {} users",
                readings.len(),
                self.users.len()
            )));
        }
        for (state, &reading) in self.users.values_mut().zip(readings) {
            state.reading = reading;
        }
        Ok(())
    }

    /// Every user hands reading and blinding factor to the company
    pub fn share_readings(&mut self) {
        self.company = Company {
            readings: self
                .users
                .iter()
                .map(|(&user, state)| (user, state.reading))
                .collect(),
            blindings: self
                .users
                .iter()
                .map(|(&user, state)| (user, state.blinding))
                .collect(),
            aggregate: None,
        };
    }

    /// The company runs `scheme` over the shared readings
    pub fn process(&mut self, scheme: Scheme) -> Result<&dyn Aggregate> {
        let aggregate = scheme.strategy().aggregate(
            &self.company.readings,
            &self.company.blindings,
            &self.config,
        )?;
        let stored = self.company.aggregate.insert(aggregate);
        Ok(&**stored)
    }

    pub fn aggregate(&self) -> Option<&dyn Aggregate> {
        self.company.aggregate.as_deref()
    }

    /// What `user` keeps after the company shared its proof data
    pub fn record_for(&self, user: UserId) -> Result<UserRecord> {
        let aggregate = self
            .aggregate()
            .ok_or_else(|| PricingError::InvalidInput("readings not processed yet".into()))?;
        let state = self
            .users
            .get(&user)
            .ok_or_else(|| PricingError::InvalidInput(format!("unknown user {}", user)))?;

        Ok(UserRecord {
            population: self.population(),
            config: self.config,
            user,
            reading: state.reading,
            blinding: state.blinding,
            bundle: aggregate.bundle_for(user)?,
            sum_proof: ProofBlob::from_proof(aggregate.sum_proof()),
        })
    }

    /// Every user runs the verification protocol
    pub fn verify_all(&self) -> Result<Vec<VerificationReport>> {
        let users: Vec<UserId> = self.users.keys().copied().collect();
        users
            .par_iter()
            .map(|&user| Ok(self.record_for(user)?.verify()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize() {
        let session = BillingSession::initialize(4, ProtocolConfig::default()).unwrap();
        assert_eq!(session.population(), 4);
        assert_eq!(session.reading(3), Some(0));
        assert_eq!(session.reading(4), None);

        assert!(matches!(
            BillingSession::initialize(0, ProtocolConfig::default()),
            Err(PricingError::EmptyPopulation)
        ));
        assert!(BillingSession::initialize(3, ProtocolConfig::default().with_delta(0)).is_err());
    }

    #[test]
    fn test_draw_readings_bounded() {
        let mut session = BillingSession::initialize(20, ProtocolConfig::default()).unwrap();
        session.draw_readings(100).unwrap();
        for user in 0..20 {
            assert!(session.reading(user).unwrap() < 100);
        }
        assert!(session.draw_readings(0).is_err());
    }

    #[test]
    fn test_set_readings_length() {
        let mut session = BillingSession::initialize(2, ProtocolConfig::default()).unwrap();
        assert!(session.set_readings(&[1, 2, 3]).is_err());
        session.set_readings(&[1, 2]).unwrap();
        assert_eq!(session.reading(1), Some(2));
    }

    #[test]
    fn test_record_requires_processing() {
        let mut session = BillingSession::initialize(2, ProtocolConfig::test_mode()).unwrap();
        session.share_readings();
        assert!(session.record_for(0).is_err());

        session.process(Scheme::Flat).unwrap();
        assert!(session.record_for(0).is_ok());
        assert!(session.record_for(2).is_err());
    }

    #[test]
    fn test_sharing_resets_company() {
        let mut session = BillingSession::initialize(2, ProtocolConfig::test_mode()).unwrap();
        session.set_readings(&[3, 4]).unwrap();
        session.share_readings();
        assert_eq!(session.process(Scheme::Flat).unwrap().sum(), 7);

        session.set_readings(&[5, 6]).unwrap();
        session.share_readings();
        assert!(session.aggregate().is_none());
        assert_eq!(session.process(Scheme::Flat).unwrap().sum(), 11);
    }

    #[test]
    fn test_verify_all_both_schemes() {
        for scheme in [Scheme::Flat, Scheme::Tree] {
            let mut session = BillingSession::initialize(5, ProtocolConfig::default()).unwrap();
            session.draw_readings(100).unwrap();
            session.share_readings();
            session.process(scheme).unwrap();

            let reports = session.verify_all().unwrap();
            assert_eq!(reports.len(), 5);
            assert!(reports.iter().all(VerificationReport::accepted));
        }
    }
}
