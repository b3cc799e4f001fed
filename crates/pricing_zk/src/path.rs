//! Audit paths and their verification
//!
//! A [`MerklePath`] is the part of an aggregation tree one user needs: the
//! chain of nodes from the user's leaf up to the root (`core`) and the
//! sibling of every chain node below the root (`edge`). It is a plain copy,
//! so it can be serialized and checked without the rest of the tree.
//!
//! For a parent `p` with children `a` and `b`:
//!
//! - plain commitments add up: `C2a + C2b == C2p`
//! - threshold-adjusted commitments add up once the extra `MAX_RANGE_END`
//!   is removed: `C1a + C1b - MAX_RANGE_END == C1p`, since
//!   `(Sa - La*delta + MAX) + (Sb - Lb*delta + MAX) = Sp - Lp*delta + 2*MAX`
//!
//! Both are compared through a [`DummyOffset`].

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::commitment::{Commitment, DummyOffset};
use crate::config::ProtocolConfig;
use crate::error::{PricingError, Result};
use crate::range::ProofBlob;
use crate::strategy::{
    dummy_offset, inspect_proof, AggregateView, AuditUnit, ProofDefect, ProofFailure,
    ProofSubject,
};
use crate::UserId;

/// Link from a core node to one of its children inside the same path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathRef {
    Core(usize),
    Edge(usize),
}

/// Detached copy of a tree node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub c1: Commitment,
    pub c2: Commitment,
    /// The node's range proof, compact encoding
    pub proof: ProofBlob,
    /// Number of leaves below the node
    pub l: u64,
    /// `(left, right)`, set on core nodes above the leaf
    pub children: Option<(PathRef, PathRef)>,
}

/// Audit path from one leaf to the root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    /// User carried by `core[0]`
    pub leaf: UserId,
    /// Leaf first, root last
    pub core: Vec<PathNode>,
    /// `edge[i]` is the sibling of `core[i]`
    pub edge: Vec<PathNode>,
}

/// `C2a + C2b == C2p` and `C1a + C1b - MAX_RANGE_END == C1p`
pub(crate) fn node_sums_consistent(
    offset: &DummyOffset,
    config: &ProtocolConfig,
    parent: (Commitment, Commitment),
    left: (Commitment, Commitment),
    right: (Commitment, Commitment),
) -> Result<bool> {
    let max = i128::try_from(config.max_range_end())
        .map_err(|_| PricingError::InvalidInput("range end out of bounds".into()))?;

    let children_c2 = left.1.add(&right.1)?;
    if !offset.equals(&children_c2, &parent.1)? {
        return Ok(false);
    }

    let children_c1 = left.0.add(&right.0)?;
    offset.equals_shifted(&children_c1, -max, &parent.0, 0)
}

impl MerklePath {
    /// The leaf copy
    pub fn leaf_node(&self) -> Result<&PathNode> {
        self.core
            .first()
            .ok_or_else(|| PricingError::MalformedPath("empty core".into()))
    }

    /// The root copy
    pub fn root(&self) -> Result<&PathNode> {
        self.core
            .last()
            .ok_or_else(|| PricingError::MalformedPath("empty core".into()))
    }

    /// Check lengths and children links.
    fn check_shape(&self) -> Result<()> {
        if self.core.len() != self.edge.len() + 1 {
            return Err(PricingError::MalformedPath(format!(
                "{} core nodes for {} edge nodes",
                self.core.len(),
                self.edge.len()
            )));
        }
        if self.core[0].children.is_some() {
            return Err(PricingError::MalformedPath("leaf has children".into()));
        }

        for (level, parent) in self.core.iter().enumerate().skip(1) {
            let below = level - 1;
            match parent.children {
                Some((PathRef::Core(a), PathRef::Edge(b)))
                | Some((PathRef::Edge(b), PathRef::Core(a)))
                    if a == below && b == below => {}
                _ => {
                    return Err(PricingError::MalformedPath(format!(
                        "dangling children link at core node {}",
                        level
                    )))
                }
            }
        }
        Ok(())
    }

    /// Whether `node`'s proof declares `[0, L * delta)`
    fn declares_subtree_range(node: &PathNode, config: &ProtocolConfig) -> Result<bool> {
        let proof = node.proof.decode()?;
        Ok(config
            .population_threshold(node.l)
            .map_or(false, |upper| proof.declares(0, upper)))
    }

    /// First level whose triple `(core[i + 1], core[i], edge[i])` does not
    /// add up, `Some(0)` also when the leaf itself is inconsistent.
    ///
    /// # Errors
    /// `MalformedPath` if the shape of the path is broken.
    pub fn first_inconsistent_level(&self, config: &ProtocolConfig) -> Result<Option<usize>> {
        self.check_shape()?;
        let offset = dummy_offset(config);

        let leaf = &self.core[0];
        if leaf.l != 1 || !Self::declares_subtree_range(leaf, config)? {
            return Ok(Some(0));
        }

        for (level, sibling) in self.edge.iter().enumerate() {
            let child = &self.core[level];
            let parent = &self.core[level + 1];

            let consistent = child.l.checked_add(sibling.l) == Some(parent.l)
                && Self::declares_subtree_range(sibling, config)?
                && Self::declares_subtree_range(parent, config)?
                && node_sums_consistent(
                    &offset,
                    config,
                    (parent.c1, parent.c2),
                    (child.c1, child.c2),
                    (sibling.c1, sibling.c2),
                )?;

            if !consistent {
                log::debug!("Path of user {} inconsistent at level {}", self.leaf, level);
                return Ok(Some(level));
            }
        }
        Ok(None)
    }

    /// `VerifyStructure(path, delta)`
    ///
    /// Stops at the first inconsistent level.
    pub fn verify_structure(&self, config: &ProtocolConfig) -> Result<bool> {
        Ok(self.first_inconsistent_level(config)?.is_none())
    }

    /// Every failing proof of the path, core nodes first
    pub fn proof_failures(&self) -> Vec<ProofFailure> {
        let core = self
            .core
            .iter()
            .enumerate()
            .map(|(i, node)| (ProofSubject::Core(i), node));
        let edge = self
            .edge
            .iter()
            .enumerate()
            .map(|(i, node)| (ProofSubject::Edge(i), node));
        let nodes: Vec<_> = core.chain(edge).collect();

        nodes
            .par_iter()
            .flat_map_iter(|(subject, node)| {
                inspect_proof(*subject, &node.proof, &node.c1, &node.c2, None)
            })
            .collect()
    }

    /// `VerifyProofs(path)`
    ///
    /// Fails if any single node's proof fails or does not match the node's
    /// commitments.
    pub fn verify_proofs(&self) -> bool {
        self.proof_failures().is_empty()
    }
}

impl AuditUnit for MerklePath {
    fn slot(&self, user: UserId) -> Result<(Commitment, Commitment)> {
        if user != self.leaf {
            return Err(PricingError::LeafNotFound(user));
        }
        let leaf = self.leaf_node()?;
        Ok((leaf.c1, leaf.c2))
    }

    fn aggregate_view(&self) -> Result<AggregateView> {
        let root = self.root()?;
        Ok(AggregateView {
            c1: root.c1,
            c2: root.c2,
            population: root.l,
            excess_range_ends: 0,
        })
    }

    fn range_failures(&self, config: &ProtocolConfig) -> Result<Vec<ProofFailure>> {
        let mut failures = Vec::new();
        if let Some(level) = self.first_inconsistent_level(config)? {
            failures.push(ProofFailure::new(
                ProofSubject::Level(level),
                ProofDefect::InconsistentSums,
            ));
        }
        failures.extend(self.proof_failures());
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::commitment::Blinding;
    use crate::tree::AggregationTree;

    fn tree_of(values: &[u64], config: &ProtocolConfig) -> AggregationTree {
        let readings: BTreeMap<UserId, u64> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as UserId, v))
            .collect();
        let blindings = readings.keys().map(|&u| (u, Blinding::random())).collect();
        AggregationTree::build(&readings, &blindings, config).unwrap()
    }

    #[test]
    fn test_every_path_verifies() {
        let config = ProtocolConfig::test_mode();
        for n in [1u64, 2, 3, 5, 8] {
            let values: Vec<u64> = (0..n).map(|i| (i * 31) % 120).collect();
            let tree = tree_of(&values, &config);
            for user in 0..n as UserId {
                let path = tree.path_for(user).unwrap();
                assert!(path.verify_structure(&config).unwrap());
                assert!(path.verify_proofs());
                assert_eq!(path.root().unwrap().l, n);
            }
        }
    }

    #[test]
    fn test_shape_errors_are_malformed() {
        let config = ProtocolConfig::test_mode();
        let tree = tree_of(&[1, 2, 3], &config);

        let mut path = tree.path_for(0).unwrap();
        path.edge.pop();
        let err = path.verify_structure(&config).unwrap_err();
        assert!(matches!(err, PricingError::MalformedPath(_)));

        let mut path = tree.path_for(0).unwrap();
        path.core[1].children = Some((PathRef::Core(0), PathRef::Core(0)));
        assert!(path.verify_structure(&config).unwrap_err().is_structural());

        let empty = MerklePath {
            leaf: 0,
            core: Vec::new(),
            edge: Vec::new(),
        };
        assert!(empty.verify_structure(&config).is_err());
    }

    #[test]
    fn test_inflated_population_detected() {
        let config = ProtocolConfig::test_mode();
        let tree = tree_of(&[1, 2, 3, 4], &config);
        let mut path = tree.path_for(3).unwrap();

        path.core.last_mut().unwrap().l = 5;
        assert_eq!(path.first_inconsistent_level(&config).unwrap(), Some(1));
    }

    #[test]
    fn test_swapped_edge_commitment() {
        let config = ProtocolConfig::test_mode();
        let tree = tree_of(&[7, 8, 9, 10], &config);
        let mut path = tree.path_for(0).unwrap();
        let intruder = tree.get_leaf(2).unwrap().c1;
        path.edge[0].c1 = intruder;

        assert!(!path.verify_structure(&config).unwrap());
        assert!(!path.verify_proofs());
        assert_eq!(
            path.proof_failures(),
            vec![ProofFailure::new(
                ProofSubject::Edge(0),
                ProofDefect::Commitment1Mismatch
            )]
        );
    }

    #[test]
    fn test_path_serialization() {
        let config = ProtocolConfig::test_mode();
        let tree = tree_of(&[1, 2, 3, 4, 5], &config);
        let path = tree.path_for(2).unwrap();

        let json = serde_json::to_string(&path).unwrap();
        let back: MerklePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(back.verify_structure(&config).unwrap());
    }
}
