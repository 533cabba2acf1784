//! FASTA reading and writing for the alignment hand-off files.

use bio::io::fasta;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FastaError {
    #[error("Failed to access FASTA file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed FASTA file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: record {record}: {message}", .path.display())]
    InvalidRecord {
        path: PathBuf,
        record: usize,
        message: String,
    },
}

/// One sequence: the full header text after `>` and its residues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub id: String,
    pub residues: String,
}

impl SequenceRecord {
    pub fn new(id: impl Into<String>, residues: impl Into<String>) -> Self {
        SequenceRecord {
            id: id.into(),
            residues: residues.into(),
        }
    }

    fn from_fasta_record(record: &fasta::Record) -> Self {
        let id = match record.desc() {
            Some(desc) if !desc.is_empty() => format!("{} {}", record.id(), desc),
            _ => record.id().to_string(),
        };
        SequenceRecord::new(id, String::from_utf8_lossy(record.seq()))
    }
}

/// Reads all records of a FASTA file in file order.
///
/// The identifier is the whole header line (name and description), so
/// descriptions with spaces, pipes or dots are kept intact.
pub fn read_fasta(path: &Path) -> Result<Vec<SequenceRecord>, FastaError> {
    let file = File::open(path).map_err(|source| FastaError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut records = Vec::new();
    for (index, result) in fasta::Reader::new(file).records().enumerate() {
        let record = result.map_err(|source| FastaError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        record.check().map_err(|message| FastaError::InvalidRecord {
            path: path.to_path_buf(),
            record: index + 1,
            message: message.to_string(),
        })?;
        records.push(SequenceRecord::from_fasta_record(&record));
    }
    Ok(records)
}

pub fn write_fasta(path: &Path, records: &[SequenceRecord]) -> Result<(), FastaError> {
    let io_err = |source| FastaError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = fasta::Writer::new(file);

    for record in records {
        writer
            .write(&record.id, None, record.residues.as_bytes())
            .map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}
