//! External tool plumbing: executable names, capability probing and
//! running a command to completion.

use log::debug;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

pub const TCOFFEE_ENV_BIN: &str = "PHYLOPIPE_TCOFFEE_BIN";
pub const GBLOCKS_ENV_BIN: &str = "PHYLOPIPE_GBLOCKS_BIN";
pub const PHYML_ENV_BIN: &str = "PHYLOPIPE_PHYML_BIN";
pub const PHYML_MPI_ENV_BIN: &str = "PHYLOPIPE_PHYML_MPI_BIN";
pub const MPIRUN_ENV_BIN: &str = "PHYLOPIPE_MPIRUN_BIN";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Could not find executable '{program}' (install it or set the matching PHYLOPIPE_*_BIN variable)")]
    NotFound { program: String },
    #[error("Command `{command}` failed ({}): {}", exit_description(.status), .stderr.trim())]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("Could not run `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

fn exit_description(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

// ============================================================================
// Executables
// ============================================================================
/// Names (or paths) of the external programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executables {
    pub t_coffee: String,
    pub gblocks: String,
    pub phyml: String,
    pub phyml_mpi: String,
    pub mpirun: String,
}

impl Default for Executables {
    fn default() -> Self {
        Executables {
            t_coffee: "t_coffee".to_string(),
            gblocks: "Gblocks".to_string(),
            phyml: "phyml".to_string(),
            phyml_mpi: "phyml-mpi".to_string(),
            mpirun: "mpirun".to_string(),
        }
    }
}

impl Executables {
    /// Defaults, overridden by non-blank `PHYLOPIPE_*_BIN` variables.
    pub fn from_env() -> Self {
        let defaults = Executables::default();
        let pick = |var: &str, default: String| {
            configured_or_default(std::env::var(var).ok(), default)
        };
        Executables {
            t_coffee: pick(TCOFFEE_ENV_BIN, defaults.t_coffee),
            gblocks: pick(GBLOCKS_ENV_BIN, defaults.gblocks),
            phyml: pick(PHYML_ENV_BIN, defaults.phyml),
            phyml_mpi: pick(PHYML_MPI_ENV_BIN, defaults.phyml_mpi),
            mpirun: pick(MPIRUN_ENV_BIN, defaults.mpirun),
        }
    }
}

fn configured_or_default(configured: Option<String>, default: String) -> String {
    configured
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

/// Resolves `program` the way a shell would, using the current `PATH`.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    resolve_in(program, &search_path)
}

/// Resolves `program` against an explicit search path. Names containing a
/// path separator are checked as given.
pub fn resolve_in(program: &str, search_path: &OsStr) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }
    std::env::split_paths(search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ============================================================================
// Capability detection
// ============================================================================
/// Which optional parallel inference pieces are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub has_parallel_runner: bool,
    pub has_parallel_inferrer: bool,
}

impl Capabilities {
    /// Parallel inference needs both the MPI launcher and the MPI build of the inferrer.
    pub fn supports_parallel(&self) -> bool {
        self.has_parallel_runner && self.has_parallel_inferrer
    }
}

pub trait CapabilityProbe {
    fn detect(&self) -> Capabilities;
}

/// Fixed answer, for callers that already know what is installed.
impl CapabilityProbe for Capabilities {
    fn detect(&self) -> Capabilities {
        *self
    }
}

/// Probes by looking the executables up on a search path at every call.
#[derive(Debug, Clone)]
pub struct PathProbe {
    runner: String,
    inferrer: String,
    search_path: Option<OsString>,
}

impl PathProbe {
    pub fn new(executables: &Executables) -> Self {
        PathProbe {
            runner: executables.mpirun.clone(),
            inferrer: executables.phyml_mpi.clone(),
            search_path: None,
        }
    }

    /// Uses `search_path` instead of the process `PATH`.
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        match &self.search_path {
            Some(path) => resolve_in(program, path),
            None => resolve_executable(program),
        }
    }
}

impl CapabilityProbe for PathProbe {
    fn detect(&self) -> Capabilities {
        let runner = self.lookup(&self.runner);
        let inferrer = self.lookup(&self.inferrer);
        debug!("{} resolved to {:?}", self.runner, runner);
        debug!("{} resolved to {:?}", self.inferrer, inferrer);
        Capabilities {
            has_parallel_runner: runner.is_some(),
            has_parallel_inferrer: inferrer.is_some(),
        }
    }
}

// ============================================================================
// Commands
// ============================================================================
/// A program invocation, optionally with stdout captured into a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdout: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        ToolCommand {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(path) = &self.stdout {
            write!(f, " > {}", path.display())?;
        }
        Ok(())
    }
}

/// Runs a command to completion. Implementations block until it exits.
pub trait ToolRunner {
    fn run(&self, command: &ToolCommand) -> Result<(), ToolError>;
}

/// Runs commands as OS subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<(), ToolError> {
        let io_err = |source| ToolError::Io {
            command: command.to_string(),
            source,
        };

        // Captured stdout goes to a sibling file that only replaces the
        // target once the command has succeeded.
        let capture = command.stdout.as_deref().map(|path| (path, partial_path(path)));

        let mut process = Command::new(&command.program);
        process.args(&command.args).stdin(Stdio::null());
        if let Some((_, partial)) = &capture {
            let file = File::create(partial).map_err(io_err)?;
            process.stdout(Stdio::from(file));
        }

        let output = process.output().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ToolError::NotFound {
                    program: command.program.clone(),
                }
            } else {
                io_err(e)
            }
        });
        let output = match output {
            Ok(output) if output.status.success() => output,
            other => {
                if let Some((_, partial)) = &capture {
                    let _ = std::fs::remove_file(partial);
                }
                let output = other?;
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                return Err(ToolError::Failed {
                    command: command.to_string(),
                    status: output.status.code(),
                    stderr,
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("{} stderr:\n{}", command.program, stderr.trim_end());
        }
        if let Some((path, partial)) = &capture {
            std::fs::rename(partial, path).map_err(io_err)?;
        }
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}
