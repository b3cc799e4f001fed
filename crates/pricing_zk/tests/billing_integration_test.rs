//! Integration tests for the billing protocol

use std::collections::BTreeMap;

use bulletproofs::PedersenGens;
use pricing_zk::{
    Aggregate, AggregationTree, AuditBundle, AuditUnit, BillingSession, Blinding, CheckOutcome,
    Commitment, FailureReason, FlatAggregator, PricingError, ProofBlob, ProofDefect, ProofFailure,
    ProofSubject, ProtocolConfig, RangeParams, RangeProof, Scheme, SumVerdict, TreeAggregator,
    UserId, UserRecord,
};

fn session_with(readings: &[u64], config: ProtocolConfig, scheme: Scheme) -> BillingSession {
    let mut session = BillingSession::initialize(readings.len(), config).unwrap();
    session.set_readings(readings).unwrap();
    session.share_readings();
    session.process(scheme).unwrap();
    session
}

fn inputs(values: &[u64]) -> (BTreeMap<UserId, u64>, BTreeMap<UserId, Blinding>) {
    let readings: BTreeMap<UserId, u64> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as UserId, v))
        .collect();
    let blindings = readings.keys().map(|&u| (u, Blinding::random())).collect();
    (readings, blindings)
}

#[test]
fn test_homomorphism() {
    let gens = PedersenGens::default();
    for (a, b) in [(0i128, 0i128), (1, 2), (119, 119), (1 << 40, 3)] {
        let (ra, rb) = (Blinding::random(), Blinding::random());
        let lhs = Commitment::commit(a, &ra, &gens)
            .add(&Commitment::commit(b, &rb, &gens))
            .unwrap();
        let rhs = Commitment::commit(a + b, &(ra + rb), &gens);
        assert!(lhs.equals(&rhs));
    }
}

#[test]
fn test_flat_scheme_accepted_by_everyone() {
    let session = session_with(&[5, 17, 99, 0, 64], ProtocolConfig::test_mode(), Scheme::Flat);
    assert_eq!(session.aggregate().unwrap().sum(), 185);

    let reports = session.verify_all().unwrap();
    assert_eq!(reports.len(), 5);
    for report in &reports {
        assert_eq!(report.commitment, CheckOutcome::Passed);
        assert_eq!(report.sum.verdict(), SumVerdict::ChargePeakRate);
        assert_eq!(report.range, CheckOutcome::Passed);
        assert!(report.accepted());
    }
}

#[test]
fn test_tree_scheme_for_several_populations() {
    let config = ProtocolConfig::test_mode();
    for n in [1u64, 2, 3, 5, 8] {
        let values: Vec<u64> = (0..n).map(|i| (i * 13 + 1) % config.delta).collect();
        let (readings, blindings) = inputs(&values);
        let tree = AggregationTree::build(&readings, &blindings, &config).unwrap();

        assert_eq!(tree.root().l, n);
        assert!(tree.verify_tree(&config).unwrap());
        for user in 0..n as UserId {
            let leaf = tree.get_leaf(user).unwrap();
            let path = tree.merkle_path(leaf).unwrap();
            assert!(path.verify_structure(&config).unwrap());
            assert!(path.verify_proofs());
        }
    }
}

#[test]
fn test_tree_scheme_accepted_by_everyone() {
    let readings = [30, 40, 50, 60, 70, 80, 90];
    let session = session_with(&readings, ProtocolConfig::default(), Scheme::Tree);
    let reports = session.verify_all().unwrap();

    // 420 is below the default margin of 500
    for report in &reports {
        assert!(report.accepted(), "{}", report);
        assert_eq!(report.sum.verdict(), SumVerdict::CannotChargePeakRate);
    }
}

#[test]
fn test_peak_rate_above_margin() {
    let config = ProtocolConfig::default().with_gamma(300);
    for scheme in [Scheme::Flat, Scheme::Tree] {
        let session = session_with(&[119, 119, 119], config, scheme);
        let report = session.record_for(2).unwrap().verify();
        assert!(report.can_charge_peak_rate(), "{}", report);
    }
}

#[test]
fn test_threshold_boundary() {
    let config = ProtocolConfig::test_mode();
    let delta = config.delta;

    let session = session_with(&[delta - 1], config, Scheme::Flat);
    let report = session.record_for(0).unwrap().verify();
    assert!(report.can_charge_peak_rate());

    let mut session = BillingSession::initialize(2, config).unwrap();
    session.set_readings(&[1, delta]).unwrap();
    session.share_readings();
    for scheme in [Scheme::Flat, Scheme::Tree] {
        match session.process(scheme) {
            Err(PricingError::UserProofFailed { user, .. }) => assert_eq!(user, 1),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("reading at the threshold was proven"),
        }
    }
}

#[test]
fn test_tampered_leaf_detected_only_on_its_paths() {
    let config = ProtocolConfig::test_mode();
    let (readings, blindings) = inputs(&[10, 20, 30, 40]);
    let tree = AggregationTree::build(&readings, &blindings, &config).unwrap();

    let victim: UserId = 0;
    let forged = Commitment::commit(11, &blindings[&victim], &PedersenGens::default());
    let mut paths: Vec<_> = (0..4).map(|u| tree.path_for(u).unwrap()).collect();

    // leaf 0 sits in core[0] of its own path and edge[0] of its sibling's
    paths[0].core[0].c2 = forged;
    paths[1].edge[0].c2 = forged;

    for (user, path) in paths.iter().enumerate() {
        let intact = path.verify_structure(&config).unwrap();
        assert_eq!(intact, user >= 2, "path of user {}", user);
    }
}

#[test]
fn test_three_users_scenario() {
    let config = ProtocolConfig::test_mode();
    let (readings, blindings) = inputs(&[10, 20, 30]);

    let flat = FlatAggregator.process(&readings, &blindings, &config).unwrap();
    let tree = TreeAggregator.process(&readings, &blindings, &config).unwrap();

    assert_eq!(flat.sum(), 60);
    assert_eq!(tree.sum(), 60);
    assert_eq!(tree.tree().root().l, 3);

    // the sum proof commits to 60 under Setup(0, 360)
    let total = Blinding::sum(blindings.values());
    let gens = PedersenGens::default();
    assert!(flat.sum_proof().p2.equals(&Commitment::commit(60, &total, &gens)));
    assert!(flat.sum_proof().declares(0, 360));
    assert_eq!(flat.sum_proof().p1, tree.sum_proof().p1);

    // identical blindings give identical leaf commitments in both schemes
    let commits1 = flat.commits1();
    for user in 0..3 {
        assert_eq!(tree.tree().get_leaf(user).unwrap().c1, commits1[&user]);
    }
}

#[test]
fn test_verification_is_idempotent() {
    for scheme in [Scheme::Flat, Scheme::Tree] {
        let session = session_with(&[3, 1, 4, 1, 5], ProtocolConfig::default(), scheme);
        let record = session.record_for(3).unwrap();

        assert_eq!(record.verify(), record.verify());
    }
}

#[test]
fn test_record_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    for scheme in [Scheme::Flat, Scheme::Tree] {
        let session = session_with(&[9, 8, 7], ProtocolConfig::test_mode(), scheme);
        let record = session.record_for(0).unwrap();
        let file = dir.path().join(format!("{}.json", scheme));

        record.save(&file).unwrap();
        let loaded = UserRecord::load(&file).unwrap();

        assert_eq!(loaded, record);
        assert_eq!(loaded.sum_proof.as_bytes(), record.sum_proof.as_bytes());
        assert_eq!(loaded.bundle.scheme(), scheme);
        assert_eq!(loaded.verify(), record.verify());
        assert!(loaded.verify().accepted());
    }
}

#[test]
fn test_substituted_value_detected() {
    let config = ProtocolConfig::test_mode();
    let session = session_with(&[10, 20, 30], config, Scheme::Flat);
    let mut record = session.record_for(1).unwrap();

    // the company commits to 25 instead of 20 for user 1
    let params = RangeParams::for_reading(&config).unwrap();
    let swapped = RangeProof::prove(25, &params, &record.blinding).unwrap();
    if let AuditBundle::Flat(bundle) = &mut record.bundle {
        bundle.commits1.insert(1, swapped.p1);
        bundle.commits2.insert(1, swapped.p2);
        bundle.proofs.insert(1, ProofBlob::from_proof(&swapped));
    }

    let report = record.verify();
    assert_eq!(
        report.commitment,
        CheckOutcome::Failed(FailureReason::ValueSubstituted)
    );
    // the sum no longer reconciles, every proof is still valid
    assert_eq!(report.sum.verdict(), SumVerdict::Failed);
    assert!(!report.sum.commitment2_matched);
    assert_eq!(report.range, CheckOutcome::Passed);
    assert!(!report.accepted());
}

#[test]
fn test_forged_proofs_enumerated() {
    let config = ProtocolConfig::test_mode();
    let session = session_with(&[10, 20, 30], config, Scheme::Flat);
    let mut record = session.record_for(0).unwrap();

    // proofs for delta - 1 passed off under the honest commitments
    let params = RangeParams::for_reading(&config).unwrap();
    if let AuditBundle::Flat(bundle) = &mut record.bundle {
        for user in 0..3 {
            let mut forged = RangeProof::prove(119, &params, &Blinding::random()).unwrap();
            forged.p1 = bundle.commits1[&user];
            forged.p2 = bundle.commits2[&user];
            bundle.proofs.insert(user, ProofBlob::from_proof(&forged));
        }
    }

    let report = record.verify();
    assert_eq!(report.commitment, CheckOutcome::Passed);
    assert_eq!(report.sum.verdict(), SumVerdict::ChargePeakRate);
    match &report.range {
        CheckOutcome::Failed(FailureReason::InvalidProofs(failures)) => {
            let users: Vec<_> = failures.iter().map(|f| f.subject).collect();
            assert_eq!(
                users,
                vec![ProofSubject::User(0), ProofSubject::User(1), ProofSubject::User(2)]
            );
            assert!(failures.iter().all(|f| f.defect == ProofDefect::InvalidProof));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_reading_above_threshold_under_wider_range_rejected() {
    let config = ProtocolConfig::test_mode();
    let session = session_with(&[10, 20, 30], config, Scheme::Flat);
    let mut record = session.record_for(0).unwrap();

    // user 2's slot carries 500 under Setup(0, 1000) instead of Setup(0, delta)
    let wide = RangeParams::setup(0, 1000, config.n_bits).unwrap();
    let proof = RangeProof::prove(500, &wide, &Blinding::random()).unwrap();
    let other: UserId = 2;
    if let AuditBundle::Flat(bundle) = &mut record.bundle {
        bundle.commits1.insert(other, proof.p1);
        bundle.commits2.insert(other, proof.p2);
        bundle.proofs.insert(other, ProofBlob::from_proof(&proof));
    }

    let report = record.verify();
    assert_eq!(report.commitment, CheckOutcome::Passed);
    assert_eq!(
        report.range,
        CheckOutcome::Failed(FailureReason::InvalidProofs(vec![ProofFailure::new(
            ProofSubject::User(other),
            ProofDefect::WrongRange {
                lower: 0,
                upper: 1000
            },
        )]))
    );
    assert!(!report.accepted());
}

#[test]
fn test_truncated_path_is_malformed() {
    let session = session_with(&[1, 2, 3, 4], ProtocolConfig::test_mode(), Scheme::Tree);
    let mut record = session.record_for(2).unwrap();
    if let AuditBundle::Tree(path) = &mut record.bundle {
        path.edge.pop();
    }

    let report = record.verify();
    assert!(matches!(
        report.range,
        CheckOutcome::Failed(FailureReason::MalformedPath(_))
    ));
    // the leaf slot is untouched
    assert_eq!(report.commitment, CheckOutcome::Passed);
}

#[test]
fn test_unknown_leaf() {
    let session = session_with(&[1, 2], ProtocolConfig::test_mode(), Scheme::Tree);
    let err = session.aggregate().unwrap().bundle_for(7).unwrap_err();
    assert!(matches!(err, PricingError::LeafNotFound(7)));
    assert!(err.is_structural());

    let record = session.record_for(0).unwrap();
    assert!(record.bundle.as_unit().slot(1).is_err());
}
