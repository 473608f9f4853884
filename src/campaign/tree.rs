//! Mutation tree parsed from a Dredd mutation-description document.
//!
//! Every mutation lives on exactly one node of a forest of syntactic regions.
//! Two mutations conflict when one node contains the other, so a batch must
//! never enable both.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one mutation, stable for the lifetime of a compiler build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(pub u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Identifier of one tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutation tree errors.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Document could not be read.
    #[error("failed to read mutation tree {path}: {source}")]
    Io {
        /// Document path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Document is not valid JSON for the expected shape.
    #[error("invalid mutation tree document: {0}")]
    Json(#[from] serde_json::Error),
    /// Document is structurally inconsistent.
    #[error("malformed mutation tree: {0}")]
    Malformed(String),
    /// Queried mutation is not part of this tree.
    #[error("mutation {0} is not part of the mutation tree")]
    UnknownMutation(MutationId),
    /// Two trees expected to be identical differ.
    #[error("mutation trees differ in `{field}`")]
    Mismatch {
        /// First field found to differ.
        field: &'static str,
    },
}

/// Serialized form of a mutation tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationTreeDocument {
    /// Node owning each mutation.
    pub mutation_to_node: BTreeMap<u64, u64>,
    /// Parent of each non-root node.
    pub parent: BTreeMap<u64, u64>,
    /// Number of nodes; node ids are `0..num_nodes`.
    pub num_nodes: u64,
    /// Number of mutations; mutation ids are `0..num_mutations`.
    pub num_mutations: u64,
}

impl MutationTreeDocument {
    /// Read a document from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, TreeError> {
        let raw = std::fs::read(path).map_err(|source| TreeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Validated, indexed mutation tree.
#[derive(Debug, Clone)]
pub struct MutationTree {
    document: MutationTreeDocument,
    node_of_mutation: Vec<usize>,
    parent_of_node: Vec<Option<usize>>,
    direct: Vec<Vec<MutationId>>,
    covering: Vec<Vec<MutationId>>,
}

impl MutationTree {
    /// Load and validate a tree from a JSON document on disk.
    pub fn from_path(path: &Path) -> Result<Self, TreeError> {
        Self::from_document(MutationTreeDocument::from_path(path)?)
    }

    /// Validate a document and build the ancestry and subtree indexes.
    pub fn from_document(document: MutationTreeDocument) -> Result<Self, TreeError> {
        let num_nodes = to_index(document.num_nodes, "num_nodes")?;
        let num_mutations = to_index(document.num_mutations, "num_mutations")?;

        let mut parent_of_node = filled(num_nodes, None, "num_nodes")?;
        for (&child, &parent) in &document.parent {
            let child = node_index(child, num_nodes)?;
            let parent = node_index(parent, num_nodes)?;
            if child == parent {
                return Err(TreeError::Malformed(format!("node {child} is its own parent")));
            }
            parent_of_node[child] = Some(parent);
        }

        let mut node_of_mutation = Vec::new();
        reserve(&mut node_of_mutation, num_mutations, "num_mutations")?;
        let mut direct = filled(num_nodes, Vec::new(), "num_nodes")?;
        for mutation in 0..document.num_mutations {
            let node = document.mutation_to_node.get(&mutation).ok_or_else(|| {
                TreeError::Malformed(format!("mutation {mutation} has no node"))
            })?;
            let node = node_index(*node, num_nodes)?;
            node_of_mutation.push(node);
            direct[node].push(MutationId(mutation));
        }
        if let Some(extra) = document
            .mutation_to_node
            .keys()
            .find(|&&mutation| mutation >= document.num_mutations)
        {
            return Err(TreeError::Malformed(format!(
                "mutation {extra} is outside 0..{}",
                document.num_mutations
            )));
        }

        let mut covering = filled(num_nodes, Vec::new(), "num_nodes")?;
        for node in 0..num_nodes {
            let chain = ancestry(&parent_of_node, node)?;
            if direct[node].is_empty() {
                continue;
            }
            for ancestor in std::iter::once(node).chain(chain) {
                covering[ancestor].extend_from_slice(&direct[node]);
            }
        }
        for mutations in &mut covering {
            mutations.sort_unstable();
        }

        Ok(Self {
            document,
            node_of_mutation,
            parent_of_node,
            direct,
            covering,
        })
    }

    /// Source document.
    pub fn document(&self) -> &MutationTreeDocument {
        &self.document
    }

    /// Number of mutations in the tree.
    pub fn num_mutations(&self) -> u64 {
        self.document.num_mutations
    }

    /// Number of nodes in the tree.
    pub fn num_nodes(&self) -> u64 {
        self.document.num_nodes
    }

    /// True if `mutation` is part of this tree.
    pub fn contains(&self, mutation: MutationId) -> bool {
        mutation.0 < self.document.num_mutations
    }

    /// Node owning `mutation`.
    pub fn node_of(&self, mutation: MutationId) -> Result<NodeId, TreeError> {
        self.node_index(mutation).map(|node| NodeId(node as u64))
    }

    /// Strict ancestors of `node`, nearest first.
    pub fn ancestors(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = usize::try_from(node.0)
            .ok()
            .and_then(|index| self.parent_of_node.get(index).copied().flatten());
        while let Some(index) = current {
            out.push(NodeId(index as u64));
            current = self.parent_of_node[index];
        }
        out
    }

    /// Mutations that must not be enabled together with `mutation`.
    ///
    /// Covers every mutation on the same node, on an ancestor, or on a
    /// descendant. The result always contains `mutation` itself.
    pub fn incompatible_with(&self, mutation: MutationId) -> Result<BTreeSet<MutationId>, TreeError> {
        let node = self.node_index(mutation)?;
        let mut out: BTreeSet<MutationId> = self.covering[node].iter().copied().collect();
        let mut current = self.parent_of_node[node];
        while let Some(ancestor) = current {
            out.extend(self.direct[ancestor].iter().copied());
            current = self.parent_of_node[ancestor];
        }
        Ok(out)
    }

    /// True if both trees carry identical maps and counts.
    pub fn structurally_equal(&self, other: &MutationTree) -> bool {
        self.document == other.document
    }

    /// Fail with the first differing field if the trees are not identical.
    pub fn ensure_matches(&self, other: &MutationTree) -> Result<(), TreeError> {
        let (a, b) = (&self.document, &other.document);
        let field = if a.num_mutations != b.num_mutations {
            "num_mutations"
        } else if a.num_nodes != b.num_nodes {
            "num_nodes"
        } else if a.mutation_to_node != b.mutation_to_node {
            "mutation_to_node"
        } else if a.parent != b.parent {
            "parent"
        } else {
            return Ok(());
        };
        Err(TreeError::Mismatch { field })
    }

    fn node_index(&self, mutation: MutationId) -> Result<usize, TreeError> {
        usize::try_from(mutation.0)
            .ok()
            .and_then(|index| self.node_of_mutation.get(index).copied())
            .ok_or(TreeError::UnknownMutation(mutation))
    }
}

fn to_index(value: u64, field: &str) -> Result<usize, TreeError> {
    usize::try_from(value)
        .map_err(|_| TreeError::Malformed(format!("{field} {value} does not fit in memory")))
}

fn reserve<T>(vec: &mut Vec<T>, additional: usize, field: &str) -> Result<(), TreeError> {
    vec.try_reserve_exact(additional).map_err(|_| {
        TreeError::Malformed(format!("{field} {additional} does not fit in memory"))
    })
}

/// `len` copies of `value`, failing instead of aborting when `len` is absurd.
fn filled<T: Clone>(len: usize, value: T, field: &str) -> Result<Vec<T>, TreeError> {
    let mut vec = Vec::new();
    reserve(&mut vec, len, field)?;
    vec.resize(len, value);
    Ok(vec)
}

fn node_index(node: u64, num_nodes: usize) -> Result<usize, TreeError> {
    match usize::try_from(node) {
        Ok(index) if index < num_nodes => Ok(index),
        _ => Err(TreeError::Malformed(format!(
            "node {node} is outside 0..{num_nodes}"
        ))),
    }
}

/// Strict ancestors of `node`; a chain longer than the node count is a cycle.
fn ancestry(parent_of_node: &[Option<usize>], node: usize) -> Result<Vec<usize>, TreeError> {
    let mut chain = Vec::new();
    let mut current = parent_of_node[node];
    while let Some(ancestor) = current {
        if chain.len() >= parent_of_node.len() {
            return Err(TreeError::Malformed(format!(
                "cycle detected in ancestry of node {node}"
            )));
        }
        chain.push(ancestor);
        current = parent_of_node[ancestor];
    }
    Ok(chain)
}
