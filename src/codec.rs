//! Name codec: swaps sequence identifiers for short opaque tokens and back.
//!
//! External tools truncate or re-escape identifiers with spaces, pipes or
//! punctuation, so only tokens (`SEQ0001`, `SEQ0002`, ...) are handed to them.
//! The [`NameMapping`] is written to a code table file after encoding and
//! read back for decoding.

use crate::fasta::SequenceRecord;
use crate::newick::quote_label;
use rustc_hash::{FxHashMap, FxHashSet};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TOKEN_PREFIX: &str = "SEQ";

const MIN_TOKEN_DIGITS: usize = 4;

/// Strict phylip keeps only the first 10 characters of a name.
const MAX_TOKEN_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Token '{token}' has no entry in the code table")]
    UnknownToken { token: String },
    #[error("Code table line {line}: {reason}")]
    MalformedTable { line: usize, reason: String },
    #[error("Cannot encode {count} identifiers with tokens of at most 10 characters")]
    TooManyIdentifiers { count: usize },
    #[error("Failed to access code table '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable bijection between identifiers and tokens.
///
/// Entries keep the order in which identifiers were first seen, so the
/// written table doubles as an audit trail of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMapping {
    entries: Vec<(String, String)>,
    by_identifier: FxHashMap<String, usize>,
    by_token: FxHashMap<String, usize>,
}

impl NameMapping {
    /// Assigns one token per distinct identifier, in first-seen order.
    pub fn from_identifiers<'a, I>(identifiers: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut distinct: Vec<&str> = Vec::new();
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for id in identifiers {
            if seen.insert(id) {
                distinct.push(id);
            }
        }

        let digits = MIN_TOKEN_DIGITS.max(distinct.len().to_string().len());
        if TOKEN_PREFIX.len() + digits > MAX_TOKEN_LEN {
            return Err(CodecError::TooManyIdentifiers {
                count: distinct.len(),
            });
        }

        let entries = distinct
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                (
                    i + 1,
                    format!("{}{:0width$}", TOKEN_PREFIX, i + 1, width = digits),
                    id.to_string(),
                )
            })
            .collect();
        Self::from_entries(entries)
    }

    /// Takes `(line, token, identifier)` triples; `line` is only used in errors.
    fn from_entries(numbered: Vec<(usize, String, String)>) -> Result<Self, CodecError> {
        let mut by_identifier = FxHashMap::default();
        let mut by_token = FxHashMap::default();
        let mut entries = Vec::with_capacity(numbered.len());
        for (idx, (line, token, id)) in numbered.into_iter().enumerate() {
            if by_token.insert(token.clone(), idx).is_some() {
                return Err(CodecError::MalformedTable {
                    line,
                    reason: format!("duplicate token '{}'", token),
                });
            }
            if by_identifier.insert(id.clone(), idx).is_some() {
                return Err(CodecError::MalformedTable {
                    line,
                    reason: format!("duplicate identifier '{}'", id),
                });
            }
            entries.push((token, id));
        }
        Ok(NameMapping {
            entries,
            by_identifier,
            by_token,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn token_for(&self, identifier: &str) -> Option<&str> {
        self.by_identifier
            .get(identifier)
            .map(|&i| self.entries[i].0.as_str())
    }

    pub fn identifier_for(&self, token: &str) -> Option<&str> {
        self.by_token
            .get(token)
            .map(|&i| self.entries[i].1.as_str())
    }

    /// `(token, identifier)` pairs in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(t, id)| (t.as_str(), id.as_str()))
    }

    /// Serializes the table, one `token<TAB>identifier` line per entry.
    pub fn to_table_string(&self) -> String {
        let mut content = String::from("# token\tidentifier\n");
        for (token, id) in self.entries() {
            content.push_str(&format!("{}\t{}\n", token, id));
        }
        content
    }

    pub fn write_table(&self, path: &Path) -> Result<(), CodecError> {
        let io_err = |source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(self.to_table_string().as_bytes())
            .map_err(io_err)
    }

    pub fn read_table(path: &Path) -> Result<Self, CodecError> {
        let io_err = |source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            // Identifiers may contain tabs; tokens never do.
            let (token, id) = line.split_once('\t').ok_or_else(|| CodecError::MalformedTable {
                line: line_no + 1,
                reason: "expected '<token>\\t<identifier>'".to_string(),
            })?;
            if !is_token(token) {
                return Err(CodecError::MalformedTable {
                    line: line_no + 1,
                    reason: format!("'{}' is not a token", token),
                });
            }
            entries.push((line_no + 1, token.to_string(), id.to_string()));
        }

        Self::from_entries(entries)
    }
}

/// Builds the mapping for `records` and returns copies with tokens as ids.
pub fn encode(
    records: &[SequenceRecord],
) -> Result<(NameMapping, Vec<SequenceRecord>), CodecError> {
    let mapping = NameMapping::from_identifiers(records.iter().map(|r| r.id.as_str()))?;
    let encoded = records
        .iter()
        .map(|r| {
            let token = mapping
                .token_for(&r.id)
                .ok_or_else(|| CodecError::UnknownToken { token: r.id.clone() })?;
            Ok(SequenceRecord::new(token, r.residues.clone()))
        })
        .collect::<Result<Vec<_>, CodecError>>()?;
    Ok((mapping, encoded))
}

/// Replaces every token in `text` with its identifier, verbatim.
pub fn decode(mapping: &NameMapping, text: &str) -> Result<String, CodecError> {
    decode_with(mapping, text, Cow::Borrowed)
}

/// Like [`decode`], but quotes identifiers that are not valid bare Newick labels.
pub fn decode_newick(mapping: &NameMapping, text: &str) -> Result<String, CodecError> {
    decode_with(mapping, text, quote_label)
}

fn decode_with<'m, F>(mapping: &'m NameMapping, text: &str, render: F) -> Result<String, CodecError>
where
    F: Fn(&'m str) -> Cow<'m, str>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(is_word_char) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail.find(|c: char| !is_word_char(c)).unwrap_or(tail.len());
        let word = &tail[..end];

        if is_token(word) {
            let id = mapping
                .identifier_for(word)
                .ok_or_else(|| CodecError::UnknownToken {
                    token: word.to_string(),
                })?;
            out.push_str(&render(id));
        } else {
            out.push_str(word);
        }
        rest = &tail[end..];
    }
    out.push_str(rest);

    Ok(out)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_token(word: &str) -> bool {
    word.strip_prefix(TOKEN_PREFIX)
        .map_or(false, |digits| {
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        })
}
