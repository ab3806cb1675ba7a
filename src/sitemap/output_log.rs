//! Append-only log of discovered item URLs and the dedup set seeded from it.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{HarvestError, Result};

/// Every item URL already recorded. Never persisted on its own.
#[derive(Debug, Default, Clone)]
pub struct SeenUrls {
    urls: HashSet<String>,
}

impl SeenUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `url` was not seen before.
    pub fn insert(&mut self, url: &str) -> bool {
        if self.urls.contains(url) {
            return false;
        }
        self.urls.insert(url.to_string())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for SeenUrls {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut seen = Self::new();
        for url in iter {
            seen.insert(url.as_ref());
        }
        seen
    }
}

/// Reads the non-empty lines of the log. A missing log is an empty set.
pub fn load_seen_urls(path: &Path) -> Result<SeenUrls> {
    if !path.exists() {
        return Ok(SeenUrls::new());
    }
    let file = File::open(path).map_err(|err| HarvestError::io(path, err))?;
    let mut seen = SeenUrls::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| HarvestError::io(path, err))?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            seen.insert(trimmed);
        }
    }
    Ok(seen)
}

/// Destination for newly discovered item URLs.
pub trait ItemSink {
    fn append(&mut self, urls: &[String]) -> Result<()>;
}

impl ItemSink for Vec<String> {
    fn append(&mut self, urls: &[String]) -> Result<()> {
        self.extend(urls.iter().cloned());
        Ok(())
    }
}

/// Newline-delimited file opened in append mode; flushed after each batch.
pub struct OutputLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OutputLog {
    pub fn open_append(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| HarvestError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| HarvestError::io(&path, err))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }
}

impl ItemSink for OutputLog {
    fn append(&mut self, urls: &[String]) -> Result<()> {
        for url in urls {
            writeln!(self.writer, "{url}").map_err(|err| HarvestError::io(&self.path, err))?;
        }
        self.writer
            .flush()
            .map_err(|err| HarvestError::io(&self.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::{load_seen_urls, ItemSink, OutputLog, SeenUrls};

    #[test]
    fn test_seen_urls_insert_reports_novelty() {
        let mut seen = SeenUrls::new();
        assert!(seen.insert("https://nhac.test/bai-hat/a"));
        assert!(!seen.insert("https://nhac.test/bai-hat/a"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_output_log_appends_across_reopen_and_seeds_seen_set() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("links.txt");

        let mut log = OutputLog::open_append(&path).expect("log should open");
        log.append(&["a".to_string(), "b".to_string()])
            .expect("append should succeed");
        drop(log);

        let mut log = OutputLog::open_append(&path).expect("log should reopen");
        log.append(&["c".to_string()]).expect("append should succeed");
        drop(log);

        let raw = std::fs::read_to_string(&path).expect("log should be readable");
        assert_eq!(raw, "a\nb\nc\n");

        let seen = load_seen_urls(&path).expect("seen set should load");
        assert_eq!(seen.len(), 3);
        assert!(seen.contains("b"));
    }

    #[test]
    fn test_load_seen_urls_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let seen = load_seen_urls(&dir.path().join("absent.txt")).expect("should load");
        assert!(seen.is_empty());
    }
}
