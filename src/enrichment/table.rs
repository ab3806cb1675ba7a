//! CSV table of songs whose release year is being filled.

use std::path::Path;

use log::warn;

use crate::checkpoint::write_atomically;
use crate::enrichment::resolver::Resolution;
use crate::enrichment::sources::SongQuery;
use crate::error::{HarvestError, Result};
use crate::export::UTF8_BOM;

const TITLE: &str = "title";
const YEAR: &str = "year";
const NOTE: &str = "note";
const COMPOSERS: &str = "composers";
const ARTIST: &str = "artist";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    title: usize,
    year: usize,
    note: usize,
    composers: Option<usize>,
    artist: Option<usize>,
}

impl EnrichmentTable {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|err| HarvestError::io(path, err))?;
        Self::parse(&bytes, path)
    }

    /// Parses CSV bytes. Headers are trimmed and lower-cased; `year` and
    /// `note` columns are appended when missing. Fields past the header row
    /// land in trailing `extra_N` columns.
    pub fn parse(bytes: &[u8], origin: &Path) -> Result<Self> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes);

        let mut headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| header.trim().to_lowercase())
            .collect();
        let position = |headers: &[String], name: &str| headers.iter().position(|h| h == name);

        let title = position(&headers, TITLE).ok_or_else(|| HarvestError::MissingColumn {
            path: origin.display().to_string(),
            column: TITLE.to_string(),
        })?;
        let source_columns = headers.len();
        for column in [YEAR, NOTE] {
            if position(&headers, column).is_none() {
                headers.push(column.to_string());
            }
        }

        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut extra_columns = 0usize;
        for (index, record) in reader.records().enumerate() {
            let mut row: Vec<String> = record?.iter().map(str::to_string).collect();
            let extras = if row.len() > source_columns {
                row.split_off(source_columns)
            } else {
                Vec::new()
            };
            if !extras.is_empty() {
                warn!(
                    "{}: row {} has {} field(s) past the header, kept as extra columns",
                    origin.display(),
                    index + 1,
                    extras.len()
                );
                while extra_columns < extras.len() {
                    extra_columns += 1;
                    headers.push(format!("extra_{extra_columns}"));
                }
            }
            row.resize(headers.len() - extra_columns, String::new());
            row.extend(extras);
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        for row in &mut rows {
            row.resize(headers.len(), String::new());
        }

        Ok(Self {
            year: position(&headers, YEAR).unwrap_or(headers.len() - 2),
            note: position(&headers, NOTE).unwrap_or(headers.len() - 1),
            composers: position(&headers, COMPOSERS),
            artist: position(&headers, ARTIST),
            title,
            headers,
            rows,
        })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Blank year and blank note: never attempted.
    pub fn needs_fill(&self, index: usize) -> bool {
        self.rows.get(index).is_some_and(|row| {
            row[self.year].trim().is_empty() && row[self.note].trim().is_empty()
        })
    }

    pub fn pending_rows(&self) -> Vec<usize> {
        (0..self.rows.len())
            .filter(|&index| self.needs_fill(index))
            .collect()
    }

    /// Title plus an artist hint: the first composer, else the artist.
    /// `None` when the row has no title to search for.
    pub fn query(&self, index: usize) -> Option<SongQuery> {
        let row = self.rows.get(index)?;
        let title = row[self.title].trim();
        if title.is_empty() {
            return None;
        }
        let first_composer = self
            .composers
            .and_then(|column| row[column].split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let artist = first_composer
            .or_else(|| {
                self.artist
                    .map(|column| row[column].trim())
                    .filter(|value| !value.is_empty())
            })
            .map(str::to_string);
        Some(SongQuery {
            title: title.to_string(),
            artist,
        })
    }

    pub fn apply(&mut self, index: usize, resolution: &Resolution) {
        let (year, note) = (self.year, self.note);
        let Some(row) = self.rows.get_mut(index) else {
            return;
        };
        if let Resolution::Filled { year: value, .. } = resolution {
            row[year] = value.to_string();
        }
        row[note] = resolution.note();
    }

    #[cfg(test)]
    pub fn cell(&self, index: usize, column: &str) -> Option<&str> {
        let column = self.headers.iter().position(|h| h == column)?;
        self.rows.get(index).map(|row| row[column].as_str())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = UTF8_BOM.to_vec();
        {
            let mut writer = csv::Writer::from_writer(&mut buffer);
            writer.write_record(&self.headers)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            writer.flush().map_err(csv::Error::from)?;
        }
        Ok(buffer)
    }

    /// Atomic full rewrite of `path`, UTF-8 with BOM.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.to_csv_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::EnrichmentTable;
    use crate::enrichment::resolver::Resolution;
    use crate::export::UTF8_BOM;

    fn table(csv: &str) -> EnrichmentTable {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(csv.as_bytes());
        EnrichmentTable::parse(&bytes, Path::new("songs.csv")).expect("table should parse")
    }

    #[test]
    fn test_parse_normalizes_headers_and_adds_year_and_note() {
        let table = table(" Title ,Composers\nMưa,\"Ngọc, Lan\"\n");
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.cell(0, "year"), Some(""));
        assert_eq!(table.cell(0, "note"), Some(""));
        assert!(table.needs_fill(0));

        let query = table.query(0).expect("row should have a title");
        assert_eq!(query.title, "Mưa");
        assert_eq!(query.artist.as_deref(), Some("Ngọc"));
    }

    #[test]
    fn test_missing_title_column_is_rejected() {
        let parsed = EnrichmentTable::parse(b"name,year\nx,\n", Path::new("bad.csv"));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_attempted_rows_are_not_pending() {
        let mut table = table(
            "title,artist,year,note\nA,Singer,,\nB,,1999,\nC,,,no release year found\nD,,,\n",
        );
        assert_eq!(table.pending_rows(), vec![0, 3]);
        assert_eq!(
            table.query(0).and_then(|query| query.artist).as_deref(),
            Some("Singer")
        );

        table.apply(
            0,
            &Resolution::Filled {
                year: 2001,
                source: "iTunes".to_string(),
            },
        );
        table.apply(3, &Resolution::NotFound);
        assert!(table.pending_rows().is_empty());
        assert_eq!(table.cell(0, "year"), Some("2001"));
        assert_eq!(table.cell(0, "note"), Some("filled 'year' using iTunes"));
    }

    #[test]
    fn test_overlong_rows_keep_their_extra_fields() {
        let table = table("title,artist\nA,\nB,Singer,live,2009\n");
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "extra_1"), Some(""));
        assert_eq!(table.cell(1, "title"), Some("B"));
        assert_eq!(table.cell(1, "artist"), Some("Singer"));
        assert_eq!(table.cell(1, "year"), Some(""));
        assert_eq!(table.cell(1, "extra_1"), Some("live"));
        assert_eq!(table.cell(1, "extra_2"), Some("2009"));
        assert_eq!(table.pending_rows(), vec![0, 1]);
    }

    #[test]
    fn test_write_round_trips_through_bom() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("out.csv");
        let before = table("title,year,note\n\"Mưa, chiều\",,\n");

        before.write(&path).expect("table should write");
        let raw = std::fs::read(&path).expect("output should exist");
        assert!(raw.starts_with(UTF8_BOM));

        let reloaded = EnrichmentTable::load(&path).expect("table should reload");
        assert_eq!(reloaded, before);
    }
}
