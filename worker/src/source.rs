//! Chunk name resolution and the internal frame predicate.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
};

use transport::WorkerOptions;

/// Where a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Canonical path for chunks loaded from a file.
    pub file: Option<PathBuf>,
    /// What to show the user.
    pub display: PathBuf,
    pub internal: bool,
}

/// Decides which frames belong to infrastructure the user never asked to
/// step through.
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    pub skip_non_file_sources: bool,
    pub skip_prefixes: Vec<PathBuf>,
}

impl FrameFilter {
    pub fn from_options(options: &WorkerOptions) -> Self {
        Self {
            skip_non_file_sources: options.skip_non_file_sources,
            skip_prefixes: options
                .skip_prefixes
                .iter()
                .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
                .collect(),
        }
    }

    pub fn is_internal(&self, file: Option<&Path>) -> bool {
        match file {
            None => self.skip_non_file_sources,
            Some(path) => self.skip_prefixes.iter().any(|prefix| path.starts_with(prefix)),
        }
    }
}

/// Resolves each chunk name once and remembers the answer.
#[derive(Debug)]
pub struct SourceMap {
    filter: FrameFilter,
    cache: HashMap<String, Rc<Location>>,
}

impl SourceMap {
    pub fn new(filter: FrameFilter) -> Self {
        Self {
            filter,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, source: &str) -> Rc<Location> {
        if let Some(location) = self.cache.get(source) {
            return Rc::clone(location);
        }

        let location = match source.strip_prefix('@') {
            Some(path) => {
                let path = Path::new(path);
                let file = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
                Location {
                    internal: self.filter.is_internal(Some(&file)),
                    display: file.clone(),
                    file: Some(file),
                }
            }
            None => Location {
                file: None,
                display: PathBuf::from(source.strip_prefix('=').unwrap_or(source)),
                internal: source == crate::inspect::CHUNK_NAME || self.filter.is_internal(None),
            },
        };
        tracing::trace!(source, ?location, "resolved chunk");

        let location = Rc::new(location);
        self.cache.insert(source.to_string(), Rc::clone(&location));
        location
    }
}
