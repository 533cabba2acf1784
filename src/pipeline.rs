//! Stage sequencing from raw sequences to a decoded Newick tree.
//!
//! Stages run strictly in order, each consuming the previous stage's file:
//!
//! | Stage             | Produces                           | Tool                        |
//! |-------------------|------------------------------------|-----------------------------|
//! | `Raw`             | input FASTA                        | -                           |
//! | `Aligned`         | `<stem>_aligned.fasta`             | t_coffee (+ Gblocks)        |
//! | `Encoded`         | `<stem>.lst`, `<stem>_aligned_encoded.fasta` | name codec        |
//! | `PhylipConverted` | `<stem>.phylip`                    | t_coffee seq_reformat       |
//! | `TreeInferred`    | `<stem>.phylip_phyml_tree.txt`     | phyml or mpirun phyml-mpi   |
//! | `Decoded`         | `<stem>.tree`                      | name codec                  |
//!
//! Any failure aborts the run; nothing is retried.

use crate::codec::{self, CodecError, NameMapping};
use crate::fasta::{self, FastaError};
use crate::fingerprint;
use crate::tools::{
    Capabilities, CapabilityProbe, Executables, ToolCommand, ToolError, ToolRunner,
};
use log::{debug, info};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix phyml appends to its input name for the tree file.
const PHYML_TREE_SUFFIX: &str = "_phyml_tree";

/// Extension some phyml versions add and others do not.
const PHYML_TREE_EXTENSION: &str = ".txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Raw,
    Aligned,
    Encoded,
    PhylipConverted,
    TreeInferred,
    Decoded,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Raw => Some(Stage::Aligned),
            Stage::Aligned => Some(Stage::Encoded),
            Stage::Encoded => Some(Stage::PhylipConverted),
            Stage::PhylipConverted => Some(Stage::TreeInferred),
            Stage::TreeInferred => Some(Stage::Decoded),
            Stage::Decoded => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Raw => "raw",
            Stage::Aligned => "alignment",
            Stage::Encoded => "encoding",
            Stage::PhylipConverted => "phylip conversion",
            Stage::TreeInferred => "tree inference",
            Stage::Decoded => "decoding",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Input file '{}' does not exist", .path.display())]
    MissingInput { path: PathBuf },
    #[error("{stage} stage failed: {source}")]
    Tool {
        stage: Stage,
        #[source]
        source: ToolError,
    },
    #[error("{stage} stage: `{command}` did not produce '{}'", .path.display())]
    MissingOutput {
        stage: Stage,
        command: String,
        path: PathBuf,
    },
    #[error("{stage} stage failed: {source}")]
    Codec {
        stage: Stage,
        #[source]
        source: CodecError,
    },
    #[error("{stage} stage failed: {source}")]
    Fasta {
        stage: Stage,
        #[source]
        source: FastaError,
    },
    #[error("Failed to access '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Current position in the stage sequence and the file produced there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub stage: Stage,
    pub path: PathBuf,
}

impl PipelineState {
    /// Starts directly at the terminal stage from a previously decoded tree.
    pub fn reuse_decoded(path: &Path) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::MissingInput {
                path: path.to_path_buf(),
            });
        }
        info!("Reusing decoded tree {:?}, skipping all external tools", path);
        Ok(PipelineState {
            stage: Stage::Decoded,
            path: path.to_path_buf(),
        })
    }
}

// ============================================================================
// Configuration
// ============================================================================
/// Gblocks `-b5` allowed gap positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapPolicy {
    None,
    Half,
    All,
}

impl GapPolicy {
    fn flag(self) -> &'static str {
        match self {
            GapPolicy::None => "n",
            GapPolicy::Half => "h",
            GapPolicy::All => "a",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimSettings {
    /// Gblocks `-b4`, minimum length of a block.
    pub min_block: u32,
    pub gaps: Option<GapPolicy>,
}

impl Default for TrimSettings {
    fn default() -> Self {
        TrimSettings {
            min_block: 10,
            gaps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceSettings {
    /// Process count for the parallel command.
    pub parallelism: u32,
    /// phyml `-d`.
    pub data_type: String,
    /// phyml `-b`; `-1` selects aLRT statistics.
    pub bootstrap: i32,
    /// Use the serial command even when MPI is available.
    pub force_serial: bool,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        InferenceSettings {
            parallelism: 4,
            data_type: "aa".to_string(),
            bootstrap: -1,
            force_serial: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub executables: Executables,
    pub inference: InferenceSettings,
    /// Gap trimming after alignment; skipped when `None`.
    pub trim: Option<TrimSettings>,
}

/// Paths of every hand-off file, derived from the input name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFiles {
    pub input: PathBuf,
    pub aligned: PathBuf,
    pub code_table: PathBuf,
    pub encoded: PathBuf,
    pub phylip: PathBuf,
    pub decoded: PathBuf,
}

impl WorkFiles {
    pub fn new(input: &Path, work_dir: &Path) -> Self {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sequences".to_string());
        WorkFiles {
            input: input.to_path_buf(),
            aligned: work_dir.join(format!("{}_aligned.fasta", stem)),
            code_table: work_dir.join(format!("{}.lst", stem)),
            encoded: work_dir.join(format!("{}_aligned_encoded.fasta", stem)),
            phylip: work_dir.join(format!("{}.phylip", stem)),
            decoded: work_dir.join(format!("{}.tree", stem)),
        }
    }

    pub fn inference_output(&self) -> PathBuf {
        canonical_inference_output(&self.phylip)
    }
}

// ============================================================================
// Tree inference helpers
// ============================================================================
/// Picks the parallel command only when both MPI pieces are available.
pub fn inference_command(
    capabilities: Capabilities,
    phylip: &Path,
    executables: &Executables,
    settings: &InferenceSettings,
) -> ToolCommand {
    let base = if capabilities.supports_parallel() && !settings.force_serial {
        ToolCommand::new(&executables.mpirun)
            .arg("-n")
            .arg(settings.parallelism.to_string())
            .arg(&executables.phyml_mpi)
    } else {
        ToolCommand::new(&executables.phyml)
    };
    base.arg("-i")
        .path_arg(phylip)
        .arg("-d")
        .arg(&settings.data_type)
        .arg("-b")
        .arg(settings.bootstrap.to_string())
}

/// `<phylip>_phyml_tree.txt`, the name later stages read.
pub fn canonical_inference_output(phylip: &Path) -> PathBuf {
    let mut name = undecorated_inference_output(phylip).into_os_string();
    name.push(PHYML_TREE_EXTENSION);
    PathBuf::from(name)
}

fn undecorated_inference_output(phylip: &Path) -> PathBuf {
    let mut name: OsString = phylip.as_os_str().to_owned();
    name.push(PHYML_TREE_SUFFIX);
    PathBuf::from(name)
}

/// Renames an undecorated phyml tree file to the canonical name, if present,
/// and returns the canonical name.
pub fn normalize_inference_output(phylip: &Path) -> Result<PathBuf, PipelineError> {
    let bare = undecorated_inference_output(phylip);
    let canonical = canonical_inference_output(phylip);
    if bare.is_file() {
        debug!("Renaming {:?} to {:?}", bare, canonical);
        std::fs::rename(&bare, &canonical)
            .map_err(|source| PipelineError::Io { path: bare, source })?;
    }
    Ok(canonical)
}

// ============================================================================
// Driver
// ============================================================================
/// Runs the stages one at a time against real or substituted tools.
pub struct Driver<'a> {
    runner: &'a dyn ToolRunner,
    probe: &'a dyn CapabilityProbe,
    config: PipelineConfig,
    files: WorkFiles,
    state: PipelineState,
}

impl<'a> Driver<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        probe: &'a dyn CapabilityProbe,
        config: PipelineConfig,
        files: WorkFiles,
    ) -> Result<Self, PipelineError> {
        if !files.input.is_file() {
            return Err(PipelineError::MissingInput {
                path: files.input.clone(),
            });
        }
        let state = PipelineState {
            stage: Stage::Raw,
            path: files.input.clone(),
        };
        Ok(Driver {
            runner,
            probe,
            config,
            files,
            state,
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn files(&self) -> &WorkFiles {
        &self.files
    }

    /// Runs every remaining stage and returns the decoded tree file.
    pub fn run(mut self) -> Result<PathBuf, PipelineError> {
        while self.state.stage != Stage::Decoded {
            self.advance()?;
        }
        if let Ok(bytes) = std::fs::read(&self.state.path) {
            debug!("Decoded tree sha256 {}", fingerprint(&bytes));
        }
        Ok(self.state.path)
    }

    /// Runs the next stage. Does nothing once `Decoded` is reached.
    pub fn advance(&mut self) -> Result<&PipelineState, PipelineError> {
        let Some(next) = self.state.stage.next() else {
            return Ok(&self.state);
        };
        let path = match next {
            Stage::Raw => unreachable!("Raw is never a successor"),
            Stage::Aligned => self.align()?,
            Stage::Encoded => self.encode()?,
            Stage::PhylipConverted => self.convert_to_phylip()?,
            Stage::TreeInferred => self.infer_tree()?,
            Stage::Decoded => self.decode()?,
        };
        self.state = PipelineState { stage: next, path };
        Ok(&self.state)
    }

    fn run_tool(&self, stage: Stage, command: &ToolCommand) -> Result<(), PipelineError> {
        info!("{}: {}", stage, command);
        self.runner
            .run(command)
            .map_err(|source| PipelineError::Tool { stage, source })
    }

    /// Deletes a previous run's output so only a fresh file can pass `expect_output`.
    fn remove_stale(path: &Path) -> Result<(), PipelineError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed stale {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PipelineError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// An empty file counts as missing.
    fn expect_output(stage: Stage, command: &str, path: &Path) -> Result<(), PipelineError> {
        let written = path
            .metadata()
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if written {
            Ok(())
        } else {
            Err(PipelineError::MissingOutput {
                stage,
                command: command.to_string(),
                path: path.to_path_buf(),
            })
        }
    }

    fn align(&self) -> Result<PathBuf, PipelineError> {
        let stage = Stage::Aligned;
        let aligned = &self.files.aligned;
        let command = ToolCommand::new(&self.config.executables.t_coffee)
            .path_arg(&self.state.path)
            .arg("-outfile")
            .path_arg(aligned)
            .arg("-output=fasta_aln")
            .arg("-mode")
            .arg("mcoffee");
        Self::remove_stale(aligned)?;
        self.run_tool(stage, &command)?;
        Self::expect_output(stage, &command.to_string(), aligned)?;

        if let Some(trim) = self.config.trim {
            self.trim(trim)?;
        }
        Ok(aligned.clone())
    }

    /// Trims the alignment in place; Gblocks writes `<file>-gb` next to it.
    fn trim(&self, settings: TrimSettings) -> Result<(), PipelineError> {
        let stage = Stage::Aligned;
        let aligned = &self.files.aligned;
        let mut command = ToolCommand::new(&self.config.executables.gblocks)
            .path_arg(aligned)
            .arg("-t=p")
            .arg(format!("-b4={}", settings.min_block));
        if let Some(gaps) = settings.gaps {
            command = command.arg(format!("-b5={}", gaps.flag()));
        }

        let mut trimmed: OsString = aligned.as_os_str().to_owned();
        trimmed.push("-gb");
        let trimmed = PathBuf::from(trimmed);
        Self::remove_stale(&trimmed)?;
        self.run_tool(stage, &command)?;

        Self::expect_output(stage, &command.to_string(), &trimmed)?;
        std::fs::rename(&trimmed, aligned).map_err(|source| PipelineError::Io {
            path: trimmed.clone(),
            source,
        })
    }

    /// Swaps identifiers for tokens; writes the code table and encoded FASTA.
    fn encode(&self) -> Result<PathBuf, PipelineError> {
        let stage = Stage::Encoded;
        let fasta_err = |source| PipelineError::Fasta { stage, source };
        let codec_err = |source| PipelineError::Codec { stage, source };

        info!(
            "{}: replacing sequence descriptions with tokens ({:?} -> {:?})",
            stage, self.files.code_table, self.files.encoded
        );
        let records = fasta::read_fasta(&self.state.path).map_err(fasta_err)?;
        let (mapping, encoded) = codec::encode(&records).map_err(codec_err)?;
        mapping
            .write_table(&self.files.code_table)
            .map_err(codec_err)?;
        fasta::write_fasta(&self.files.encoded, &encoded).map_err(fasta_err)?;
        debug!("{} identifiers encoded", mapping.len());

        let description = "name codec";
        Self::expect_output(stage, description, &self.files.code_table)?;
        Self::expect_output(stage, description, &self.files.encoded)?;
        Ok(self.files.encoded.clone())
    }

    fn convert_to_phylip(&self) -> Result<PathBuf, PipelineError> {
        let stage = Stage::PhylipConverted;
        let phylip = &self.files.phylip;
        let command = ToolCommand::new(&self.config.executables.t_coffee)
            .arg("-other_pg")
            .arg("seq_reformat")
            .arg("-in")
            .path_arg(&self.state.path)
            .arg("-output")
            .arg("phylip_aln")
            .stdout_to(phylip);
        Self::remove_stale(phylip)?;
        self.run_tool(stage, &command)?;
        Self::expect_output(stage, &command.to_string(), phylip)?;
        Ok(phylip.clone())
    }

    fn infer_tree(&self) -> Result<PathBuf, PipelineError> {
        let stage = Stage::TreeInferred;
        let capabilities = if self.config.inference.force_serial {
            Capabilities::default()
        } else {
            self.probe.detect()
        };
        debug!("Tool capabilities: {:?}", capabilities);

        let command = inference_command(
            capabilities,
            &self.state.path,
            &self.config.executables,
            &self.config.inference,
        );
        Self::remove_stale(&undecorated_inference_output(&self.state.path))?;
        Self::remove_stale(&canonical_inference_output(&self.state.path))?;
        self.run_tool(stage, &command)?;

        let output = normalize_inference_output(&self.state.path)?;
        Self::expect_output(stage, &command.to_string(), &output)?;
        Ok(output)
    }

    /// Restores identifiers using the code table written by `encode`.
    fn decode(&self) -> Result<PathBuf, PipelineError> {
        let stage = Stage::Decoded;
        let decoded = &self.files.decoded;
        info!(
            "{}: restoring sequence descriptions in {:?} -> {:?}",
            stage, self.state.path, decoded
        );

        let mapping = NameMapping::read_table(&self.files.code_table)
            .map_err(|source| PipelineError::Codec { stage, source })?;
        let text = std::fs::read_to_string(&self.state.path).map_err(|source| {
            PipelineError::Io {
                path: self.state.path.clone(),
                source,
            }
        })?;
        let restored = codec::decode_newick(&mapping, &text)
            .map_err(|source| PipelineError::Codec { stage, source })?;
        std::fs::write(decoded, restored).map_err(|source| PipelineError::Io {
            path: decoded.clone(),
            source,
        })?;

        Self::expect_output(stage, "name codec", decoded)?;
        Ok(decoded.clone())
    }
}
