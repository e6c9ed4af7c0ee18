//! Breakpoints and script arguments remembered between debugging sessions,
//! keyed by script path.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use eyre::Context;
use serde::{Deserialize, Serialize};

pub struct StateManager {
    save_path: PathBuf,
    current: Persistence,
}

impl StateManager {
    /// `<data dir>/luadbg/state.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("luadbg").join("state.json"))
    }

    pub fn new(path: impl Into<PathBuf>) -> eyre::Result<Self> {
        let path = path.into();
        let span = tracing::debug_span!("StateManager", state_path = %path.display());
        let _guard = span.enter();

        if !path.exists() {
            tracing::debug!("no state file, starting fresh");
            let current = Persistence::default();
            crate::save_to(&current, &path).wrap_err("creating state file")?;
            return Ok(Self {
                save_path: path,
                current,
            });
        }

        // an unreadable file is left alone rather than replaced
        let current = crate::load_from(&path)
            .wrap_err_with(|| format!("corrupt state file {}", path.display()))?;
        tracing::debug!(projects = current.projects.len(), "state loaded");
        Ok(Self {
            save_path: path,
            current,
        })
    }

    pub fn save(self) -> eyre::Result<Self> {
        crate::save_to(&self.current, &self.save_path).wrap_err("saving state")?;
        Ok(self)
    }

    pub fn current(&self) -> &Persistence {
        &self.current
    }

    /// Saved state of `script`, if it was debugged before.
    pub fn for_script(&self, script: &Path) -> Option<&PerFile> {
        self.current.projects.iter().find(|p| p.path == script)
    }

    /// Replace the saved state of `file.path`.
    pub fn update(&mut self, file: PerFile) {
        self.current.version = env!("CARGO_PKG_VERSION").to_string();
        match self
            .current
            .projects
            .iter_mut()
            .find(|p| p.path == file.path)
        {
            Some(existing) => *existing = file,
            None => self.current.projects.push(file),
        }
    }
}

/// State that is persisted
#[derive(Default, Serialize, Deserialize, Debug)]
pub struct Persistence {
    pub projects: Vec<PerFile>,
    pub version: String,
}

/// State that is persisted per script
#[derive(Default, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PerFile {
    pub path: PathBuf,
    pub breakpoints: Vec<debugger::Breakpoint>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Write `state` as pretty printed JSON.
pub fn save(state: &Persistence, writer: impl Write) -> eyre::Result<()> {
    let mut writer = BufWriter::new(writer);
    serde_json::to_writer_pretty(&mut writer, state).context("serialising debugger state")?;
    writer.flush().context("flushing debugger state")
}

/// Write `state` to `path`, creating missing parent directories.
pub fn save_to(state: &Persistence, path: impl AsRef<Path>) -> eyre::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    save(state, file)
}

pub fn load(reader: impl Read) -> eyre::Result<Persistence> {
    serde_json::from_reader(BufReader::new(reader)).context("parsing debugger state")
}

pub fn load_from(path: impl AsRef<Path>) -> eyre::Result<Persistence> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    load(file)
}
