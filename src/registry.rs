use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{HarvestError, Result};

pub const NO_CONTENT: &str = "no_content";
pub const FAILED_RETRIES: &str = "failed_retries";

/// Column order of the `urls` table, shared with the CSV export.
pub const URL_COLUMNS: [&str; 11] = [
    "url",
    "discovered_by",
    "processed",
    "last_error",
    "title",
    "artist",
    "lyrics",
    "has_audio",
    "has_karaoke",
    "has_sheet",
    "id_num",
];

/// Fields extracted from one song page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SongMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub lyrics: Option<String>,
    pub has_audio: bool,
    pub has_karaoke: bool,
    pub has_sheet: bool,
}

impl SongMetadata {
    /// A page with neither a title nor lyrics is a confirmed empty page.
    pub fn is_empty(&self) -> bool {
        let blank = |value: &Option<String>| value.as_deref().map_or(true, |v| v.trim().is_empty());
        blank(&self.title) && blank(&self.lyrics)
    }
}

/// Candidate URL produced by a discovery strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub url: String,
    pub discovered_by: String,
    pub id_num: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryRow {
    pub url: String,
    pub discovered_by: Option<String>,
    pub processed: bool,
    pub last_error: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub lyrics: Option<String>,
    pub has_audio: bool,
    pub has_karaoke: bool,
    pub has_sheet: bool,
    pub id_num: Option<i64>,
}

impl RegistryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            url: row.get(0)?,
            discovered_by: row.get(1)?,
            processed: row.get::<_, Option<bool>>(2)?.unwrap_or(false),
            last_error: row.get(3)?,
            title: row.get(4)?,
            artist: row.get(5)?,
            lyrics: row.get(6)?,
            has_audio: row.get::<_, Option<bool>>(7)?.unwrap_or(false),
            has_karaoke: row.get::<_, Option<bool>>(8)?.unwrap_or(false),
            has_sheet: row.get::<_, Option<bool>>(9)?.unwrap_or(false),
            id_num: row.get(10)?,
        })
    }

    /// Values in [`URL_COLUMNS`] order, booleans as `0`/`1`.
    pub fn to_record(&self) -> Vec<String> {
        let flag = |value: bool| if value { "1" } else { "0" }.to_string();
        vec![
            self.url.clone(),
            self.discovered_by.clone().unwrap_or_default(),
            flag(self.processed),
            self.last_error.clone().unwrap_or_default(),
            self.title.clone().unwrap_or_default(),
            self.artist.clone().unwrap_or_default(),
            self.lyrics.clone().unwrap_or_default(),
            flag(self.has_audio),
            flag(self.has_karaoke),
            flag(self.has_sheet),
            self.id_num.map(|id| id.to_string()).unwrap_or_default(),
        ]
    }
}

/// Durable registry of candidate song URLs keyed by URL.
pub struct SongRegistry {
    conn: Connection,
}

impl SongRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| HarvestError::io(parent, err))?;
        }
        let conn = Connection::open(path)?;
        let registry = Self { conn };
        registry.initialize_schema()?;
        Ok(registry)
    }

    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self> {
        let registry = Self {
            conn: Connection::open_in_memory()?,
        };
        registry.initialize_schema()?;
        Ok(registry)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS urls (
                url TEXT PRIMARY KEY,
                discovered_by TEXT,
                processed INTEGER DEFAULT 0,
                last_error TEXT,
                title TEXT,
                artist TEXT,
                lyrics TEXT,
                has_audio INTEGER DEFAULT 0,
                has_karaoke INTEGER DEFAULT 0,
                has_sheet INTEGER DEFAULT 0,
                id_num INTEGER
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                k TEXT PRIMARY KEY,
                v TEXT
            )",
            [],
        )?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS search_keywords (
                keyword TEXT PRIMARY KEY,
                hits INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Returns `true` when the URL was new. An existing row keeps its
    /// original provenance.
    pub fn insert_if_absent(&self, url: &str, discovered_by: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO urls (url, discovered_by) VALUES (?1, ?2)",
            params![url, discovered_by],
        )?;
        Ok(inserted > 0)
    }

    /// Inserts a batch in one transaction; returns how many rows were new.
    pub fn insert_batch_if_absent(&self, candidates: &[Candidate]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO urls (url, discovered_by, id_num) VALUES (?1, ?2, ?3)",
            )?;
            for candidate in candidates {
                inserted += stmt.execute(params![
                    candidate.url,
                    candidate.discovered_by,
                    candidate.id_num
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn unprocessed(&self, limit: usize) -> Result<Vec<RegistryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, discovered_by, processed, last_error, title, artist, lyrics,
                    has_audio, has_karaoke, has_sheet, id_num
             FROM urls WHERE processed = 0 ORDER BY rowid LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RegistryRow::from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn count_unprocessed(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM urls WHERE processed = 0", [], |r| {
                    r.get(0)
                })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn mark_fetched(&self, url: &str, metadata: &SongMetadata) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE urls SET processed = 1, last_error = NULL, title = ?1, artist = ?2,
                    lyrics = ?3, has_audio = ?4, has_karaoke = ?5, has_sheet = ?6
             WHERE url = ?7 AND processed = 0",
            params![
                metadata.title,
                metadata.artist,
                metadata.lyrics,
                metadata.has_audio,
                metadata.has_karaoke,
                metadata.has_sheet,
                url
            ],
        )?;
        Ok(changed > 0)
    }

    /// Terminal: the page exists but carries nothing worth keeping.
    /// Both terminal marks return `false` for a row that was already settled.
    pub fn mark_no_content(&self, url: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE urls SET processed = 1, last_error = ?1 WHERE url = ?2 AND processed = 0",
            params![NO_CONTENT, url],
        )?;
        Ok(changed > 0)
    }

    /// Leaves the row unprocessed so a later run retries it.
    pub fn mark_failed_retries(&self, url: &str) -> Result<()> {
        self.record_error(url, FAILED_RETRIES)
    }

    pub fn record_error(&self, url: &str, message: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE urls SET last_error = ?1 WHERE url = ?2",
            params![message, url],
        )?;
        Ok(())
    }

    pub fn record_keyword(&self, keyword: &str, hits: usize) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO search_keywords (keyword, hits) VALUES (?1, ?2)",
            params![keyword, i64::try_from(hits).unwrap_or(i64::MAX)],
        )?;
        Ok(())
    }

    /// Every processed search keyword with its hit count.
    pub fn processed_keywords(&self) -> Result<HashMap<String, usize>> {
        let mut stmt = self
            .conn
            .prepare("SELECT keyword, hits FROM search_keywords")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut keywords = HashMap::new();
        for row in rows {
            let (keyword, hits) = row?;
            keywords.insert(keyword, usize::try_from(hits).unwrap_or(0));
        }
        Ok(keywords)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO meta (k, v) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;

        let value = self
            .conn
            .query_row("SELECT v FROM meta WHERE k = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Every row in insertion order.
    pub fn export_rows(&self) -> Result<Vec<RegistryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, discovered_by, processed, last_error, title, artist, lyrics,
                    has_audio, has_karaoke, has_sheet, id_num
             FROM urls ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], RegistryRow::from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    #[cfg(test)]
    pub fn row(&self, url: &str) -> Result<Option<RegistryRow>> {
        use rusqlite::OptionalExtension;

        let row = self
            .conn
            .query_row(
                "SELECT url, discovered_by, processed, last_error, title, artist, lyrics,
                        has_audio, has_karaoke, has_sheet, id_num
                 FROM urls WHERE url = ?1",
                params![url],
                RegistryRow::from_row,
            )
            .optional()?;
        Ok(row)
    }
}
