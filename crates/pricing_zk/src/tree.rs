//! Aggregation tree of partial sums
//!
//! Each leaf proves one reading under `Setup(0, delta)`. Nodes of a level
//! are paired left to right; every pair gets a parent proving the combined
//! value and blinding under `Setup(0, L * delta)`, where `L` counts the
//! leaves below it. An odd node at the end of a level moves up unchanged.
//!
//! Nodes live in an arena and refer to each other by index, so the tree has
//! no ownership cycles. Leaves are created in ascending user order, which
//! fixes the shape of the tree for a given population.
//!
//! ```text
//!            root (L=3)
//!           /          \
//!      n3 (L=2)         |
//!      /      \         |
//!  leaf 0   leaf 1   leaf 2
//! ```

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::commitment::{Blinding, Commitment};
use crate::config::ProtocolConfig;
use crate::error::{PricingError, Result};
use crate::flat::{collect_inputs, prove_sum};
use crate::path::{node_sums_consistent, MerklePath, PathNode, PathRef};
use crate::range::{ProofBlob, RangeParams, RangeProof};
use crate::strategy::{dummy_offset, Aggregate, AggregationStrategy, AuditBundle, Scheme};
use crate::UserId;

/// Index of a node in the tree arena
pub type NodeId = usize;

/// A node of the aggregation tree
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: NodeId,
    /// User carried by a leaf
    pub leaf: Option<UserId>,
    /// Threshold-adjusted commitment `Commit(sum - L*delta + MAX_RANGE_END, r)`
    pub c1: Commitment,
    /// Plain commitment `Commit(sum, r)`
    pub c2: Commitment,
    pub proof: RangeProof,
    /// Number of leaves below this node
    pub l: u64,
    pub parent: Option<NodeId>,
    /// `(left, right)` of an internal node
    pub children: Option<(NodeId, NodeId)>,
    value: u64,
    blinding: Blinding,
}

impl TreeNode {
    fn new(value: u64, blinding: Blinding, l: u64, proof: RangeProof) -> Self {
        Self {
            id: 0,
            leaf: None,
            c1: proof.p1,
            c2: proof.p2,
            proof,
            l,
            parent: None,
            children: None,
            value,
            blinding,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Detached copy carrying only the public fields
    fn to_path_node(&self, children: Option<(PathRef, PathRef)>) -> PathNode {
        PathNode {
            c1: self.c1,
            c2: self.c2,
            proof: ProofBlob::from_proof(&self.proof),
            l: self.l,
            children,
        }
    }
}

/// Binary tree of partial-sum proofs over one interval's readings
#[derive(Debug, Clone)]
pub struct AggregationTree {
    nodes: Vec<TreeNode>,
    root: NodeId,
}

impl AggregationTree {
    /// `Build(readings, blindings, delta) -> root`
    pub fn build(
        readings: &BTreeMap<UserId, u64>,
        blindings: &BTreeMap<UserId, Blinding>,
        config: &ProtocolConfig,
    ) -> Result<Self> {
        let inputs = collect_inputs(readings, blindings)?;
        let leaf_params = RangeParams::for_reading(config)?;

        let leaves = inputs
            .par_iter()
            .map(|(user, value, blinding)| {
                let proof = RangeProof::prove(*value, &leaf_params, blinding)
                    .map_err(|e| e.for_user(*user))?;
                let mut node = TreeNode::new(*value, *blinding, 1, proof);
                node.leaf = Some(*user);
                Ok(node)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut nodes = Vec::with_capacity(2 * leaves.len());
        for mut leaf in leaves {
            leaf.id = nodes.len();
            nodes.push(leaf);
        }

        let mut level: Vec<NodeId> = (0..nodes.len()).collect();
        while level.len() > 1 {
            let parents = level
                .par_chunks(2)
                .filter(|pair| pair.len() == 2)
                .map(|pair| combine(&nodes[pair[0]], &nodes[pair[1]], config))
                .collect::<Result<Vec<_>>>()?;

            let mut parents = parents.into_iter();
            let mut next = Vec::with_capacity(level.len() / 2 + 1);
            for pair in level.chunks(2) {
                match (pair, parents.next()) {
                    (&[left, right], Some(mut parent)) => {
                        let id = nodes.len();
                        parent.id = id;
                        parent.children = Some((left, right));
                        nodes[left].parent = Some(id);
                        nodes[right].parent = Some(id);
                        nodes.push(parent);
                        next.push(id);
                    }
                    (&[single], None) => next.push(single),
                    _ => {
                        return Err(PricingError::CryptoError(
                            "tree level out of step with its proofs".into(),
                        ))
                    }
                }
            }
            log::debug!("Tree level with {} nodes", next.len());
            level = next;
        }

        let root = level[0];
        log::debug!(
            "Built aggregation tree: {} nodes, {} leaves",
            nodes.len(),
            nodes[root].l
        );
        Ok(Self { nodes, root })
    }

    /// The root node
    pub fn root(&self) -> &TreeNode {
        &self.nodes[self.root]
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn num_leaves(&self) -> u64 {
        self.root().l
    }

    /// Number of edges from the root to the deepest leaf
    pub fn height(&self) -> usize {
        self.depth_below(self.root)
    }

    fn depth_below(&self, id: NodeId) -> usize {
        match self.nodes[id].children {
            None => 0,
            Some((left, right)) => 1 + self.depth_below(left).max(self.depth_below(right)),
        }
    }

    /// `GetLeaf(root, id)`
    pub fn get_leaf(&self, user: UserId) -> Result<&TreeNode> {
        self.find_leaf(self.root, user)
            .map(|id| &self.nodes[id])
            .ok_or(PricingError::LeafNotFound(user))
    }

    fn find_leaf(&self, id: NodeId, user: UserId) -> Option<NodeId> {
        let node = &self.nodes[id];
        match node.children {
            None => (node.leaf == Some(user)).then_some(id),
            Some((left, right)) => self
                .find_leaf(left, user)
                .or_else(|| self.find_leaf(right, user)),
        }
    }

    /// `MerklePath(root, leaf)`
    ///
    /// Copies the chain from `leaf` to the root into `core` and the sibling
    /// of each chain node into `edge`. Children links of the copies point
    /// into the path, never into the tree.
    pub fn merkle_path(&self, leaf: &TreeNode) -> Result<MerklePath> {
        let (start, user) = match (self.nodes.get(leaf.id), leaf.leaf) {
            (Some(node), Some(user)) if node.leaf == Some(user) && node.c2 == leaf.c2 => {
                (node, user)
            }
            _ => return Err(PricingError::MalformedPath("node is not a leaf of this tree".into())),
        };

        let mut core = vec![start.to_path_node(None)];
        let mut edge = Vec::new();
        let mut current = leaf.id;

        while let Some(parent_id) = self.nodes[current].parent {
            let parent = &self.nodes[parent_id];
            let level = edge.len();
            let (sibling, children) = match parent.children {
                Some((left, right)) if left == current => {
                    (right, (PathRef::Core(level), PathRef::Edge(level)))
                }
                Some((left, right)) if right == current => {
                    (left, (PathRef::Edge(level), PathRef::Core(level)))
                }
                _ => {
                    return Err(PricingError::MalformedPath(format!(
                        "node {} is not a child of its parent",
                        current
                    )))
                }
            };

            edge.push(self.nodes[sibling].to_path_node(None));
            core.push(parent.to_path_node(Some(children)));
            current = parent_id;
        }

        Ok(MerklePath { leaf: user, core, edge })
    }

    /// Audit path of `user`'s leaf
    pub fn path_for(&self, user: UserId) -> Result<MerklePath> {
        self.merkle_path(self.get_leaf(user)?)
    }

    /// Check the sums of every internal node against its two children.
    pub fn verify_tree(&self, config: &ProtocolConfig) -> Result<bool> {
        let offset = dummy_offset(config);
        for node in &self.nodes {
            if let Some((left, right)) = node.children {
                let (a, b) = (&self.nodes[left], &self.nodes[right]);
                if node.l != a.l + b.l {
                    return Ok(false);
                }
                if !node_sums_consistent(
                    &offset,
                    config,
                    (node.c1, node.c2),
                    (a.c1, a.c2),
                    (b.c1, b.c2),
                )? {
                    log::debug!("Inconsistent sums at node {}", node.id);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Parent of two adjacent nodes
fn combine(left: &TreeNode, right: &TreeNode, config: &ProtocolConfig) -> Result<TreeNode> {
    let value = left.value + right.value;
    let blinding = left.blinding + right.blinding;
    let l = left.l + right.l;
    let params = RangeParams::for_subtree(config, l)?;
    let proof = RangeProof::prove(value, &params, &blinding)?;
    Ok(TreeNode::new(value, blinding, l, proof))
}

/// The tree scheme
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeAggregator;

impl TreeAggregator {
    /// Build the tree and, alongside it, the proof for the sum
    pub fn process(
        &self,
        readings: &BTreeMap<UserId, u64>,
        blindings: &BTreeMap<UserId, Blinding>,
        config: &ProtocolConfig,
    ) -> Result<TreeAggregate> {
        let inputs = collect_inputs(readings, blindings)?;
        let (tree, sum_result) = rayon::join(
            || AggregationTree::build(readings, blindings, config),
            || prove_sum(&inputs, config),
        );
        let tree = tree?;
        let (sum, sum_proof) = sum_result?;
        log::info!(
            "Aggregated {} readings into a tree of height {}, sum {}",
            tree.num_leaves(),
            tree.height(),
            sum
        );

        Ok(TreeAggregate {
            tree,
            sum,
            sum_proof,
        })
    }
}

impl AggregationStrategy for TreeAggregator {
    fn scheme(&self) -> Scheme {
        Scheme::Tree
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

/// Result of the tree scheme
#[derive(Debug, Clone)]
pub struct TreeAggregate {
    tree: AggregationTree,
    sum: u64,
    sum_proof: RangeProof,
}

impl TreeAggregate {
    pub fn tree(&self) -> &AggregationTree {
        &self.tree
    }
}

impl Aggregate for TreeAggregate {
    fn scheme(&self) -> Scheme {
        Scheme::Tree
    }

    fn sum(&self) -> u64 {
        self.sum
    }

    fn population(&self) -> u64 {
        self.tree.num_leaves()
    }

    fn sum_proof(&self) -> &RangeProof {
        &self.sum_proof
    }

    fn bundle_for(&self, user: UserId) -> Result<AuditBundle> {
        Ok(AuditBundle::Tree(self.tree.path_for(user)?))
    }
}
