//! Newick reading and writing for the decoded tree file.
//!
//! Grammar accepted by [`parse_str`]:
//! * `tree ::= subtree ';'`
//! * `subtree ::= '(' subtree (',' subtree)* ')' [label] [':' length] | [label] [':' length]`
//!
//! Furthermore:
//! * Labels are either unquoted, ending at whitespace or one of `()[]':;,`,
//!   or single-quoted with `''` standing for a literal quote
//! * `[...]` comments can appear wherever whitespace can
//! * A numeric label on an internal node is read as its support value
//!   (phyml writes aLRT or bootstrap values there)
//! * Nodes may have any number of children

use crate::tree::{Node, NodeIndex, Tree};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Characters that end an unquoted label.
const DELIMITERS: &[u8] = b"()[]':;,";

/// Bytes of input shown around a syntax error.
const CONTEXT_LENGTH: usize = 20;

#[derive(Debug, Error)]
pub enum NewickError {
    #[error("Failed to read Newick file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid Newick at byte {position}: {message} (near '{context}')")]
    Syntax {
        position: usize,
        message: String,
        context: String,
    },
}

/// Reads the first tree of a Newick file.
pub fn read_file(path: &Path) -> Result<Tree, NewickError> {
    let content = std::fs::read_to_string(path).map_err(|source| NewickError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&content)
}

/// Parses a single Newick tree; anything after its terminating `;` is ignored.
pub fn parse_str(newick: &str) -> Result<Tree, NewickError> {
    let mut reader = NewickReader {
        bytes: newick.as_bytes(),
        position: 0,
    };
    let mut tree = Tree::new();
    let root = tree.root_index();

    reader.skip_whitespace_and_comments()?;
    reader.parse_subtree(&mut tree, root)?;
    reader.skip_whitespace_and_comments()?;
    match reader.peek() {
        Some(b';') | None => Ok(tree),
        Some(_) => Err(reader.error("expected ';' after tree")),
    }
}

/// Quotes `label` if it cannot be written as a bare Newick label.
pub fn quote_label(label: &str) -> Cow<'_, str> {
    let needs_quotes = label
        .bytes()
        .any(|b| b.is_ascii_whitespace() || DELIMITERS.contains(&b));
    if needs_quotes {
        Cow::Owned(format!("'{}'", label.replace('\'', "''")))
    } else {
        Cow::Borrowed(label)
    }
}

/// Writes `tree` as a single-line Newick string (structure, names, supports
/// and branch lengths; styles are not written).
pub fn to_newick(tree: &Tree) -> String {
    let mut out = String::new();
    write_subtree(tree, tree.root_index(), &mut out);
    out.push(';');
    out
}

fn write_subtree(tree: &Tree, index: NodeIndex, out: &mut String) {
    let node = tree.node(index);
    if !node.is_leaf() {
        out.push('(');
        for (i, &child) in node.children().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_subtree(tree, child, out);
        }
        out.push(')');
    }
    if let Some(name) = node.name() {
        out.push_str(&quote_label(name));
    } else if let Some(support) = node.support() {
        out.push_str(&support.to_string());
    }
    if let Some(length) = node.branch_length() {
        out.push(':');
        out.push_str(&length.to_string());
    }
}

struct NewickReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl NewickReader<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.position).copied()
    }

    fn error(&self, message: &str) -> NewickError {
        let start = self.position.saturating_sub(CONTEXT_LENGTH);
        let end = (self.position + CONTEXT_LENGTH).min(self.bytes.len());
        NewickError::Syntax {
            position: self.position,
            message: message.to_string(),
            context: String::from_utf8_lossy(&self.bytes[start..end]).into_owned(),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), NewickError> {
        while let Some(b) = self.peek() {
            if b.is_ascii_whitespace() {
                self.position += 1;
            } else if b == b'[' {
                match self.bytes[self.position..].iter().position(|&c| c == b']') {
                    Some(offset) => self.position += offset + 1,
                    None => return Err(self.error("unclosed comment")),
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Fills node `index` (already in the tree) from the input.
    fn parse_subtree(&mut self, tree: &mut Tree, index: NodeIndex) -> Result<(), NewickError> {
        if self.peek() == Some(b'(') {
            self.position += 1;
            loop {
                self.skip_whitespace_and_comments()?;
                let child = tree.add_child(index, Node::new());
                self.parse_subtree(tree, child)?;
                self.skip_whitespace_and_comments()?;
                match self.peek() {
                    Some(b',') => self.position += 1,
                    Some(b')') => {
                        self.position += 1;
                        break;
                    }
                    Some(_) => return Err(self.error("expected ',' or ')'")),
                    None => return Err(self.error("unexpected end of input")),
                }
            }
            self.skip_whitespace_and_comments()?;
        }

        if let Some(label) = self.parse_label()? {
            let node = tree.node_mut(index);
            match label.parse::<f64>() {
                Ok(support) if support.is_finite() && !node.is_leaf() => {
                    node.set_support(Some(support))
                }
                _ => node.set_name(label),
            }
        }

        self.skip_whitespace_and_comments()?;
        if self.peek() == Some(b':') {
            self.position += 1;
            self.skip_whitespace_and_comments()?;
            let length = self.parse_number()?;
            tree.node_mut(index).set_branch_length(Some(length));
        }
        Ok(())
    }

    fn parse_label(&mut self) -> Result<Option<String>, NewickError> {
        match self.peek() {
            Some(b'\'') => self.parse_quoted_label().map(Some),
            _ => {
                let start = self.position;
                while let Some(b) = self.peek() {
                    if b.is_ascii_whitespace() || DELIMITERS.contains(&b) {
                        break;
                    }
                    self.position += 1;
                }
                if start == self.position {
                    Ok(None)
                } else {
                    Ok(Some(
                        String::from_utf8_lossy(&self.bytes[start..self.position]).into_owned(),
                    ))
                }
            }
        }
    }

    fn parse_quoted_label(&mut self) -> Result<String, NewickError> {
        self.position += 1;
        let mut label = Vec::new();
        loop {
            match self.peek() {
                Some(b'\'') if self.bytes.get(self.position + 1) == Some(&b'\'') => {
                    label.push(b'\'');
                    self.position += 2;
                }
                Some(b'\'') => {
                    self.position += 1;
                    return Ok(String::from_utf8_lossy(&label).into_owned());
                }
                Some(b) => {
                    label.push(b);
                    self.position += 1;
                }
                None => return Err(self.error("unclosed quoted label")),
            }
        }
    }

    fn parse_number(&mut self) -> Result<f64, NewickError> {
        let start = self.position;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E') {
                self.position += 1;
            } else {
                break;
            }
        }
        std::str::from_utf8(&self.bytes[start..self.position])
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| self.error("invalid branch length"))
    }
}
