use eyre::Context;
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use transport::SourceBreakpoint;

// Serialize/Deserialize are required for persisting
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    pub path: PathBuf,
    pub line: u32,
}

impl Breakpoint {
    pub fn new(path: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }

    pub fn normalised_path(&self) -> Cow<'_, Path> {
        expand_home(&self.path)
    }

    /// Whether `file` and `line` as reported by the worker refer to this
    /// breakpoint.
    pub fn matches(&self, file: &Path, line: u32) -> bool {
        if self.line != line {
            return false;
        }
        let path = self.normalised_path();
        if path == file {
            return true;
        }
        match (path.canonicalize(), file.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn to_source(&self) -> SourceBreakpoint {
        SourceBreakpoint {
            file: self.normalised_path().into_owned(),
            line: self.line,
        }
    }
}

/// `~/x` becomes `$HOME/x`; anything else is returned untouched.
fn expand_home(path: &Path) -> Cow<'_, Path> {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => Cow::Owned(home.join(rest)),
        (Ok(_), None) => {
            tracing::warn!(path = %path.display(), "no home directory to expand");
            Cow::Borrowed(path)
        }
        (Err(_), _) => Cow::Borrowed(path),
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.line)
    }
}

impl FromStr for Breakpoint {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path_str, lineno_str) = s
            .rsplit_once(':')
            .ok_or_else(|| eyre::eyre!("breakpoint specification '{s}' has no colon"))?;

        let lineno: u32 = lineno_str.parse().wrap_err("invalid line number")?;
        eyre::ensure!(lineno > 0, "line numbers start at 1");
        let mut path = expand_home(Path::new(path_str)).into_owned();

        // if passed a relative path, assume the current working directory
        if path.is_relative() {
            path = std::env::current_dir()
                .context("getting current working directory")?
                .join(path);
        }

        eyre::ensure!(
            path.is_file(),
            "breakpoint cannot be set on a non-existent file: {}",
            path.display()
        );

        Ok(Self {
            path,
            line: lineno,
        })
    }
}
