//! Resumption state for the sitemap crawl.
//!
//! The crawl has three nested loop levels (sitemap, artist, listing page), so
//! the in-flight path records one pointer per level. Completed top-level
//! sitemaps are kept in a separate append-only list.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use uuid::Uuid;

use crate::error::{HarvestError, Result};

/// The single in-flight path through the sitemap tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlightPath {
    pub parent: Option<String>,
    pub child: Option<String>,
    pub page: Option<String>,
}

impl InFlightPath {
    pub fn is_empty(&self) -> bool {
        self.parent.is_none() && self.child.is_none() && self.page.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlCheckpoint {
    /// Fully processed sitemap units, in completion order. Never shrinks.
    pub completed: Vec<String>,
    pub current: InFlightPath,
}

impl CrawlCheckpoint {
    pub fn is_completed(&self, unit_url: &str) -> bool {
        self.completed.iter().any(|url| url == unit_url)
    }

    /// Drops child/page pointers that have no enclosing parent (or page
    /// without child). Returns `true` when something was cleared.
    fn normalize(&mut self) -> bool {
        let mut changed = false;
        if self.current.parent.is_none()
            && (self.current.child.is_some() || self.current.page.is_some())
        {
            self.current.child = None;
            self.current.page = None;
            changed = true;
        }
        if self.current.child.is_none() && self.current.page.is_some() {
            self.current.page = None;
            changed = true;
        }
        changed
    }
}

/// Persistence port for [`CrawlCheckpoint`].
pub trait CheckpointStore {
    /// Returns an empty checkpoint when nothing has been saved yet.
    fn load(&self) -> Result<CrawlCheckpoint>;
    /// Replaces the persisted checkpoint in full.
    fn save(&mut self, checkpoint: &CrawlCheckpoint) -> Result<()>;
}

#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
struct CheckpointFile {
    #[serde(default)]
    completed: Vec<String>,
    #[serde(default)]
    current: CurrentSection,
}

#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
struct CurrentSection {
    #[serde(default)]
    parent: String,
    #[serde(default)]
    child: String,
    #[serde(default)]
    page: String,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl From<CheckpointFile> for CrawlCheckpoint {
    fn from(file: CheckpointFile) -> Self {
        let mut completed: Vec<String> = Vec::with_capacity(file.completed.len());
        for url in file.completed.into_iter().filter_map(non_empty) {
            if !completed.contains(&url) {
                completed.push(url);
            }
        }
        Self {
            completed,
            current: InFlightPath {
                parent: non_empty(file.current.parent),
                child: non_empty(file.current.child),
                page: non_empty(file.current.page),
            },
        }
    }
}

impl From<&CrawlCheckpoint> for CheckpointFile {
    fn from(checkpoint: &CrawlCheckpoint) -> Self {
        Self {
            completed: checkpoint.completed.clone(),
            current: CurrentSection {
                parent: checkpoint.current.parent.clone().unwrap_or_default(),
                child: checkpoint.current.child.clone().unwrap_or_default(),
                page: checkpoint.current.page.clone().unwrap_or_default(),
            },
        }
    }
}

/// TOML file with a `completed` list and a `[current]` table.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<CrawlCheckpoint> {
        if !self.path.exists() {
            return Ok(CrawlCheckpoint::default());
        }
        let content =
            fs::read_to_string(&self.path).map_err(|err| HarvestError::io(&self.path, err))?;
        let parsed: CheckpointFile =
            toml::from_str(&content).map_err(|err| HarvestError::Checkpoint {
                path: self.path.display().to_string(),
                message: err.to_string(),
            })?;
        Ok(parsed.into())
    }

    fn save(&mut self, checkpoint: &CrawlCheckpoint) -> Result<()> {
        let rendered = toml::to_string(&CheckpointFile::from(checkpoint)).map_err(|err| {
            HarvestError::Checkpoint {
                path: self.path.display().to_string(),
                message: err.to_string(),
            }
        })?;
        write_atomically(&self.path, rendered.as_bytes())
    }
}

/// Writes to a sibling temp file and renames it over `path`.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| HarvestError::io(parent, err))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    fs::write(&temp_path, contents).map_err(|err| HarvestError::io(&temp_path, err))?;
    fs::rename(&temp_path, path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        HarvestError::io(path, err)
    })
}

/// In-memory store; keeps every saved snapshot for inspection.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    pub snapshots: Vec<CrawlCheckpoint>,
    initial: CrawlCheckpoint,
}

#[cfg(test)]
impl MemoryCheckpointStore {
    pub fn new(initial: CrawlCheckpoint) -> Self {
        Self {
            snapshots: Vec::new(),
            initial,
        }
    }

    pub fn latest(&self) -> CrawlCheckpoint {
        self.snapshots
            .last()
            .cloned()
            .unwrap_or_else(|| self.initial.clone())
    }
}

#[cfg(test)]
impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<CrawlCheckpoint> {
        Ok(self.latest())
    }

    fn save(&mut self, checkpoint: &CrawlCheckpoint) -> Result<()> {
        self.snapshots.push(checkpoint.clone());
        Ok(())
    }
}

/// Owns the live checkpoint and rewrites it through the store on every change.
pub struct CheckpointTracker<S: CheckpointStore> {
    store: S,
    state: CrawlCheckpoint,
}

impl<S: CheckpointStore> CheckpointTracker<S> {
    pub fn open(store: S) -> Result<Self> {
        let mut state = store.load()?;
        if state.normalize() {
            warn!("Checkpoint had a child/page pointer without its parent; cleared it");
        }
        info!(
            "Checkpoint loaded: {} completed unit(s), resume path {:?}",
            state.completed.len(),
            state.current
        );
        Ok(Self { store, state })
    }

    pub fn state(&self) -> &CrawlCheckpoint {
        &self.state
    }

    pub fn is_completed(&self, unit_url: &str) -> bool {
        self.state.is_completed(unit_url)
    }

    /// Merges only the supplied levels into the in-flight path and rewrites
    /// the checkpoint. `Some("")` clears a level.
    pub fn save_progress(
        &mut self,
        parent: Option<&str>,
        child: Option<&str>,
        page: Option<&str>,
    ) -> Result<()> {
        let merge = |slot: &mut Option<String>, value: Option<&str>| {
            if let Some(value) = value {
                *slot = non_empty(value.to_string());
            }
        };
        merge(&mut self.state.current.parent, parent);
        merge(&mut self.state.current.child, child);
        merge(&mut self.state.current.page, page);
        self.store.save(&self.state)
    }

    /// Appends `unit_url` to the completed list (once) and clears the in-flight path.
    pub fn mark_unit_complete(&mut self, unit_url: &str) -> Result<()> {
        if !self.state.is_completed(unit_url) {
            self.state.completed.push(unit_url.to_string());
        }
        self.state.current = InFlightPath::default();
        self.store.save(&self.state)?;
        info!("Completed sitemap unit {unit_url}");
        Ok(())
    }

    #[cfg(test)]
    pub fn into_store(self) -> S {
        self.store
    }
}
