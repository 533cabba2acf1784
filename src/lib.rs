//! Protein phylogeny workflow: align, infer a maximum-likelihood tree with
//! external tools, then annotate and draw the tree as SVG.
//!
//! The external tools (t_coffee, Gblocks, phyml) are driven by
//! [`pipeline::Driver`]. Sequence identifiers never reach those tools: they
//! are swapped for short tokens by the [`codec`] and restored afterwards.

pub mod annotation;
pub mod codec;
pub mod fasta;
pub mod newick;
pub mod pipeline;
pub mod render;
pub mod tools;
pub mod tree;

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `bytes`, used to compare stage outputs across runs.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
