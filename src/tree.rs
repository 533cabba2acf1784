//! Rooted phylogenetic tree stored as an arena of [`Node`]s.
//!
//! Every node except the root has exactly one parent, and a parent lists its
//! children in display order. Nodes are referenced by [`NodeIndex`]; indices
//! are only stable until the next re-rooting, which renumbers the arena.

use rustc_hash::FxHashSet;
use std::ops::{Index, IndexMut};
use thiserror::Error;

/// Index of a node in the arena.
pub type NodeIndex = usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Leaf '{name}' not found in tree")]
    LeafNotFound { name: String },
    #[error("Leaf name '{name}' occurs {count} times in tree")]
    AmbiguousLeaf { name: String, count: usize },
}

// ============================================================================
// Style record
// ============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Circle,
    Square,
    Sphere,
}

/// Text drawn by a label column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaceText {
    /// Fixed text, e.g. a blank spacer.
    Static(String),
    /// The node's own name.
    NodeName,
}

/// One text column drawn to the right of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFace {
    pub text: FaceText,
    pub font_size: f64,
    pub color: String,
}

impl TextFace {
    pub fn resolve<'a>(&'a self, node: &'a Node) -> &'a str {
        match &self.text {
            FaceText::Static(text) => text,
            FaceText::NodeName => node.name().unwrap_or(""),
        }
    }
}

/// Visual attributes attached to a node during annotation.
///
/// Not part of the biological data; never written back to Newick.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStyle {
    pub shape: Shape,
    /// Diameter (or side length) in pixels.
    pub size: f64,
    pub fgcolor: String,
    pub bgcolor: Option<String>,
    pub hz_line_color: String,
    pub vt_line_color: String,
    /// Label columns, in column order.
    pub faces: Vec<TextFace>,
}

impl Default for NodeStyle {
    fn default() -> Self {
        NodeStyle {
            shape: Shape::Circle,
            size: 3.0,
            fgcolor: "#0030c1".to_string(),
            bgcolor: None,
            hz_line_color: "#000000".to_string(),
            vt_line_color: "#000000".to_string(),
            faces: Vec::new(),
        }
    }
}

// ============================================================================
// Node
// ============================================================================
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    name: Option<String>,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
    branch_length: Option<f64>,
    support: Option<f64>,
    pub style: NodeStyle,
}

impl Node {
    pub fn new() -> Self {
        Node::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_branch_length(mut self, length: f64) -> Self {
        self.branch_length = Some(length);
        self
    }

    pub fn with_support(mut self, support: f64) -> Self {
        self.support = Some(support);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    /// Length of the branch to the parent.
    pub fn branch_length(&self) -> Option<f64> {
        self.branch_length
    }

    pub fn set_branch_length(&mut self, length: Option<f64>) {
        self.branch_length = length;
    }

    /// Support of the branch to the parent (bootstrap or aLRT).
    pub fn support(&self) -> Option<f64> {
        self.support
    }

    pub fn set_support(&mut self, support: Option<f64>) {
        self.support = support;
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

// ============================================================================
// Tree
// ============================================================================
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeIndex,
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

impl Tree {
    /// Creates a tree consisting of a single unnamed root.
    pub fn new() -> Self {
        Tree {
            nodes: vec![Node::new()],
            root: 0,
        }
    }

    /// Appends `node` as the last child of `parent` and returns its index.
    pub fn add_child(&mut self, parent: NodeIndex, mut node: Node) -> NodeIndex {
        let index = self.nodes.len();
        node.parent = Some(parent);
        node.children.clear();
        self.nodes.push(node);
        self.nodes[parent].children.push(index);
        index
    }

    pub fn root_index(&self) -> NodeIndex {
        self.root
    }

    pub fn root(&self) -> &Node {
        &self.nodes[self.root]
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    /// Indices of all nodes, parents before children, children left to right.
    pub fn pre_order(&self) -> Vec<NodeIndex> {
        self.subtree(self.root)
    }

    /// Indices of `index` and all its descendants in pre-order.
    pub fn subtree(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut order = Vec::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            order.push(current);
            stack.extend(self.nodes[current].children.iter().rev());
        }
        order
    }

    /// Leaf indices in display order.
    pub fn leaves(&self) -> Vec<NodeIndex> {
        self.pre_order()
            .into_iter()
            .filter(|&i| self.nodes[i].is_leaf())
            .collect()
    }

    pub fn leaf_names(&self) -> Vec<&str> {
        self.leaves()
            .into_iter()
            .filter_map(|i| self.nodes[i].name())
            .collect()
    }

    /// Iterates over the ancestors of `index`, nearest first, ending at the root.
    pub fn ancestors(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        std::iter::successors(self.nodes[index].parent, move |&p| self.nodes[p].parent)
    }

    /// Finds the unique leaf with exactly this name.
    pub fn find_leaf(&self, name: &str) -> Result<NodeIndex, TreeError> {
        let matches: Vec<NodeIndex> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_leaf() && self.nodes[i].name() == Some(name))
            .collect();
        match matches.as_slice() {
            [index] => Ok(*index),
            [] => Err(TreeError::LeafNotFound {
                name: name.to_string(),
            }),
            _ => Err(TreeError::AmbiguousLeaf {
                name: name.to_string(),
                count: matches.len(),
            }),
        }
    }

    /// Lowest common ancestor of two nodes.
    pub fn lca(&self, a: NodeIndex, b: NodeIndex) -> NodeIndex {
        let a_path: FxHashSet<NodeIndex> =
            std::iter::once(a).chain(self.ancestors(a)).collect();
        std::iter::once(b)
            .chain(self.ancestors(b))
            .find(|n| a_path.contains(n))
            .unwrap_or(self.root)
    }

    /// Lowest common ancestor of two named leaves.
    pub fn common_ancestor(&self, leaf_a: &str, leaf_b: &str) -> Result<NodeIndex, TreeError> {
        let a = self.find_leaf(leaf_a)?;
        let b = self.find_leaf(leaf_b)?;
        Ok(self.lca(a, b))
    }

    /// Reverses the order of the immediate children of `index`.
    pub fn swap_children(&mut self, index: NodeIndex) {
        self.nodes[index].children.reverse();
    }

    /// Re-roots the tree on the branch above the named leaf.
    ///
    /// A new root is placed in the middle of the leaf's branch, so the root's
    /// children become the leaf and the rest of the tree as one clade. Branch
    /// lengths and supports stay with the branch they describe; an old root
    /// left with a single child is dissolved. Node indices are renumbered.
    pub fn set_outgroup(&mut self, leaf_name: &str) -> Result<(), TreeError> {
        let outgroup = self.find_leaf(leaf_name)?;
        let Some(parent) = self.nodes[outgroup].parent else {
            return Ok(());
        };
        let old_root = self.root;

        if parent == old_root && self.nodes[old_root].children.len() == 2 {
            let children = &mut self.nodes[old_root].children;
            if children[0] != outgroup {
                children.swap(0, 1);
            }
            return Ok(());
        }

        let path: Vec<NodeIndex> = self.ancestors(outgroup).collect();
        let half = self.nodes[outgroup].branch_length.map(|len| len / 2.0);
        let outgroup_support = self.nodes[outgroup].support;

        self.nodes[parent].children.retain(|&c| c != outgroup);
        let new_root = self.nodes.len();
        self.nodes.push(Node {
            children: vec![outgroup, parent],
            ..Node::default()
        });
        self.nodes[outgroup].parent = Some(new_root);
        self.nodes[outgroup].branch_length = half;

        // Flip every edge on the path; each edge keeps its length and support.
        let mut carried = (half, outgroup_support);
        let mut new_parent = new_root;
        for &current in &path {
            let old_parent = self.nodes[current].parent;
            let node = &mut self.nodes[current];
            let edge = (node.branch_length, node.support);
            node.parent = Some(new_parent);
            node.branch_length = carried.0;
            node.support = carried.1;

            if let Some(up) = old_parent {
                self.nodes[up].children.retain(|&c| c != current);
                self.nodes[current].children.push(up);
            }
            carried = edge;
            new_parent = current;
        }

        self.dissolve_if_degenerate(old_root);
        self.root = new_root;
        self.compact();
        Ok(())
    }

    /// Removes a non-root node with fewer than two children, joining its
    /// branch to its only child (if any).
    fn dissolve_if_degenerate(&mut self, index: NodeIndex) {
        let Some(parent) = self.nodes[index].parent else {
            return;
        };
        let children = self.nodes[index].children.clone();
        match children.as_slice() {
            [] => {
                self.nodes[parent].children.retain(|&c| c != index);
            }
            [only] => {
                let only = *only;
                let removed_length = self.nodes[index].branch_length;
                let removed_support = self.nodes[index].support;
                let child = &mut self.nodes[only];
                child.parent = Some(parent);
                child.branch_length = match (child.branch_length, removed_length) {
                    (Some(a), Some(b)) => Some(a + b),
                    (a, b) => a.or(b),
                };
                child.support = child.support.or(removed_support);
                for c in self.nodes[parent].children.iter_mut() {
                    if *c == index {
                        *c = only;
                    }
                }
            }
            _ => return,
        }
        self.nodes[index].parent = None;
        self.nodes[index].children.clear();
    }

    /// Rebuilds the arena in pre-order from the root, dropping detached nodes.
    fn compact(&mut self) {
        let order = self.pre_order();
        let mut new_index = vec![usize::MAX; self.nodes.len()];
        for (new, &old) in order.iter().enumerate() {
            new_index[old] = new;
        }

        let nodes = order
            .iter()
            .map(|&old| {
                let mut node = self.nodes[old].clone();
                node.parent = node.parent.map(|p| new_index[p]);
                for child in node.children.iter_mut() {
                    *child = new_index[*child];
                }
                node
            })
            .collect();
        self.nodes = nodes;
        self.root = 0;
    }

    /// Checks that parent and child references agree and every node is reachable.
    pub fn is_valid(&self) -> bool {
        if self.root >= self.nodes.len() || self.nodes[self.root].parent.is_some() {
            return false;
        }
        for (index, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                if child >= self.nodes.len() || self.nodes[child].parent != Some(index) {
                    return false;
                }
            }
            if let Some(parent) = node.parent {
                if parent >= self.nodes.len() || !self.nodes[parent].children.contains(&index) {
                    return false;
                }
            }
        }
        self.pre_order().len() == self.nodes.len()
    }
}

impl Index<NodeIndex> for Tree {
    type Output = Node;

    fn index(&self, index: NodeIndex) -> &Self::Output {
        &self.nodes[index]
    }
}

impl IndexMut<NodeIndex> for Tree {
    fn index_mut(&mut self, index: NodeIndex) -> &mut Self::Output {
        &mut self.nodes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newick::parse_str;

    fn child_names(tree: &Tree, index: NodeIndex) -> Vec<String> {
        tree.node(index)
            .children()
            .iter()
            .map(|&c| {
                let node = tree.node(c);
                node.name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("({})", child_names(tree, c).join(",")))
            })
            .collect()
    }

    #[test]
    fn builds_tree_by_adding_children() {
        let mut tree = Tree::new();
        let root = tree.root_index();
        let inner = tree.add_child(root, Node::new().with_branch_length(0.5));
        tree.add_child(inner, Node::new().with_name("A"));
        tree.add_child(inner, Node::new().with_name("B"));
        tree.add_child(root, Node::new().with_name("C"));

        assert!(tree.is_valid());
        assert_eq!(tree.num_leaves(), 3);
        assert_eq!(tree.leaf_names(), vec!["A", "B", "C"]);
        assert_eq!(tree.node(inner).parent(), Some(root));
    }

    #[test]
    fn lca_of_sibling_leaves() {
        let tree = parse_str("((A,B),(C,D));").unwrap();
        let ab = tree.common_ancestor("A", "B").unwrap();
        assert_eq!(child_names(&tree, ab), vec!["A", "B"]);
        assert_eq!(tree.common_ancestor("A", "D").unwrap(), tree.root_index());
    }

    #[test]
    fn lca_of_leaf_with_itself_is_the_leaf() {
        let tree = parse_str("((A,B),C);").unwrap();
        let a = tree.find_leaf("A").unwrap();
        assert_eq!(tree.common_ancestor("A", "A").unwrap(), a);
    }

    #[test]
    fn missing_and_duplicate_leaves_are_errors() {
        let tree = parse_str("((A,B),(A,C));").unwrap();
        assert_eq!(
            tree.find_leaf("X"),
            Err(TreeError::LeafNotFound {
                name: "X".to_string()
            })
        );
        assert_eq!(
            tree.common_ancestor("A", "B"),
            Err(TreeError::AmbiguousLeaf {
                name: "A".to_string(),
                count: 2
            })
        );
    }

    #[test]
    fn outgroup_becomes_root_child() {
        let mut tree = parse_str("((A:1,B:1):1,(C:2,D:1):1);").unwrap();
        tree.set_outgroup("C").unwrap();

        assert!(tree.is_valid());
        assert_eq!(child_names(&tree, tree.root_index()), vec!["C", "(D,(A,B))"]);
        let mut leaves = tree.leaf_names();
        leaves.sort();
        assert_eq!(leaves, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn outgroup_keeps_branch_lengths_on_their_edges() {
        let mut tree = parse_str("((A:1,B:1):1,(C:2,D:1):0.5);").unwrap();
        tree.set_outgroup("C").unwrap();

        let c = tree.find_leaf("C").unwrap();
        assert_eq!(tree.node(c).branch_length(), Some(1.0));
        let rest = tree.root().children()[1];
        assert_eq!(tree.node(rest).branch_length(), Some(1.0));
        // old root dissolved: (A,B) now hangs off (C,D)'s node with both root edges joined
        let ab = tree.common_ancestor("A", "B").unwrap();
        assert_eq!(tree.node(ab).branch_length(), Some(1.5));
        assert_eq!(tree.node(ab).parent(), Some(rest));
    }

    #[test]
    fn outgroup_on_unrooted_trifurcation() {
        let mut tree = parse_str("(A:1,B:1,(C:1,R:4)0.9:1);").unwrap();
        tree.set_outgroup("R").unwrap();

        assert!(tree.is_valid());
        assert_eq!(child_names(&tree, tree.root_index()), vec!["R", "(C,(A,B))"]);
        // support 0.9 described the edge between (C,R) and the old root
        let ab = tree.common_ancestor("A", "B").unwrap();
        assert_eq!(tree.node(ab).support(), Some(0.9));
        assert_eq!(tree.node(ab).branch_length(), Some(1.0));
    }

    #[test]
    fn outgroup_already_at_root_split_moves_first() {
        let mut tree = parse_str("((A,B),C);").unwrap();
        tree.set_outgroup("C").unwrap();
        assert_eq!(child_names(&tree, tree.root_index()), vec!["C", "(A,B)"]);
    }

    #[test]
    fn outgroup_missing_leaf_fails() {
        let mut tree = parse_str("((A,B),C);").unwrap();
        let before = tree.clone();
        assert!(tree.set_outgroup("R").is_err());
        assert_eq!(tree, before);
    }

    #[test]
    fn swap_reverses_children_only() {
        let mut tree = parse_str("((A,B)0.8,C);").unwrap();
        let ab = tree.common_ancestor("A", "B").unwrap();
        tree.swap_children(ab);
        assert_eq!(child_names(&tree, ab), vec!["B", "A"]);
        assert_eq!(tree.node(ab).support(), Some(0.8));
    }
}
