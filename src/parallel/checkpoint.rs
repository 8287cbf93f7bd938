//! Best-effort checkpoints of the best solution.

use crate::error::{InversionError, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Receives the best solution at checkpoint times.
///
/// Errors are logged by the coordinator and never abort a run.
pub trait CheckpointWriter: Send + fmt::Debug {
    /// Writes `solution`. `label` is the cumulative checkpoint time, e.g.
    /// `2h30m`, and `iterations` the coordinator's iteration count.
    fn write_checkpoint(&mut self, label: &str, iterations: u64, solution: &[f64]) -> Result<()>;
}

/// Writes each checkpoint to `<prefix>_checkpoint_<label>.bin` as raw
/// big-endian `f64`s.
#[derive(Debug, Clone)]
pub struct FileCheckpointWriter {
    prefix: PathBuf,
}

impl FileCheckpointWriter {
    /// `prefix` is a path whose last component starts every file name.
    ///
    /// # Errors
    /// The prefix has no file-name component.
    pub fn new(prefix: impl Into<PathBuf>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.file_name().is_none() {
            return Err(InversionError::InvalidConfig(format!(
                "checkpoint prefix {} has no file name",
                prefix.display()
            )));
        }
        Ok(Self { prefix })
    }

    /// File written for `label`.
    pub fn path_for(&self, label: &str) -> PathBuf {
        let mut name = self.prefix.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(format!("_checkpoint_{label}.bin"));
        self.prefix.with_file_name(name)
    }
}

impl CheckpointWriter for FileCheckpointWriter {
    fn write_checkpoint(&mut self, label: &str, iterations: u64, solution: &[f64]) -> Result<()> {
        let path = self.path_for(label);
        tracing::info!(path = %path.display(), iterations, "writing checkpoint");
        write_solution(&path, solution)
    }
}

/// Writes `solution` to `path` as big-endian `f64`s.
pub fn write_solution(path: &Path, solution: &[f64]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for v in solution {
        out.write_all(&v.to_be_bytes())?;
    }
    out.flush()?;
    Ok(())
}
