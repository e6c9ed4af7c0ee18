//! Per-worker breakpoint registry.
use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("line numbers start at 1")]
    InvalidLine,
    #[error("cannot open {}: {reason}", path.display())]
    UnreadableFile { path: PathBuf, reason: String },
    #[error("{} has only {count} lines", path.display())]
    LineOutOfRange { path: PathBuf, count: usize },
}

/// Mapping of canonical source file to the set of lines to stop at.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    files: HashMap<PathBuf, BTreeSet<u32>>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a breakpoint. The file must exist and contain `line`.
    #[tracing::instrument(skip(self))]
    pub fn set(&mut self, file: &Path, line: u32) -> Result<PathBuf, BreakpointError> {
        if line == 0 {
            return Err(BreakpointError::InvalidLine);
        }
        let path = canonical(file).map_err(|reason| BreakpointError::UnreadableFile {
            path: file.to_path_buf(),
            reason,
        })?;
        let contents =
            std::fs::read(&path).map_err(|e| BreakpointError::UnreadableFile {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let count = line_count(&contents);
        if line as usize > count {
            return Err(BreakpointError::LineOutOfRange { path, count });
        }

        tracing::debug!(path = %path.display(), line, "breakpoint set");
        self.files.entry(path.clone()).or_default().insert(line);
        Ok(path)
    }

    /// Disarm a breakpoint. Clearing a breakpoint that was never set is
    /// not an error.
    pub fn clear(&mut self, file: &Path, line: u32) -> Result<PathBuf, BreakpointError> {
        if line == 0 {
            return Err(BreakpointError::InvalidLine);
        }
        let path = canonical(file).unwrap_or_else(|_| file.to_path_buf());
        if let Some(lines) = self.files.get_mut(&path) {
            lines.remove(&line);
            if lines.is_empty() {
                self.files.remove(&path);
            }
        }
        Ok(path)
    }

    /// `file` must already be canonical.
    pub fn contains(&self, file: &Path, line: u32) -> bool {
        self.files
            .get(file)
            .is_some_and(|lines| lines.contains(&line))
    }
}

fn canonical(file: &Path) -> Result<PathBuf, String> {
    std::fs::canonicalize(file).map_err(|e| e.to_string())
}

fn line_count(contents: &[u8]) -> usize {
    let newlines = contents.iter().filter(|&&b| b == b'\n').count();
    match contents.last() {
        None => 0,
        Some(b'\n') => newlines,
        Some(_) => newlines + 1,
    }
}
