//! Registry → CSV export.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;

use crate::error::{HarvestError, Result};
use crate::registry::{RegistryRow, SongRegistry, NO_CONTENT, URL_COLUMNS};

/// Byte order mark so spreadsheet tools detect UTF-8.
pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

fn carries_sentinel(record: &[String]) -> bool {
    record
        .iter()
        .any(|field| field.to_lowercase().contains(NO_CONTENT))
}

/// Writes `rows` (header first), skipping any row with the no-content
/// marker in one of its fields. Returns the number of data rows written.
pub fn write_rows<W: Write>(writer: W, rows: &[RegistryRow]) -> Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(URL_COLUMNS)?;
    let mut written = 0;
    for row in rows {
        let record = row.to_record();
        if carries_sentinel(&record) {
            continue;
        }
        csv_writer.write_record(&record)?;
        written += 1;
    }
    csv_writer.flush().map_err(csv::Error::from)?;
    Ok(written)
}

pub fn export_registry(registry: &SongRegistry, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| HarvestError::io(parent, err))?;
    }
    let rows = registry.export_rows()?;
    let mut file = BufWriter::new(File::create(path).map_err(|err| HarvestError::io(path, err))?);
    file.write_all(UTF8_BOM)
        .map_err(|err| HarvestError::io(path, err))?;
    let written = write_rows(&mut file, &rows)?;
    file.flush().map_err(|err| HarvestError::io(path, err))?;
    info!(
        "Exported {written} of {} row(s) to {}",
        rows.len(),
        path.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::{export_registry, UTF8_BOM};
    use crate::registry::{SongMetadata, SongRegistry};

    #[test]
    fn test_export_writes_bom_header_and_skips_no_content_rows() {
        let registry = SongRegistry::new_in_memory().expect("registry should open");
        for url in ["https://t.test/1/a.html", "https://t.test/2/x.html", "https://t.test/3/x.html"] {
            registry
                .insert_if_absent(url, "id:1")
                .expect("insert should succeed");
        }
        registry
            .mark_fetched(
                "https://t.test/1/a.html",
                &SongMetadata {
                    title: Some("Mưa, chiều".to_string()),
                    lyrics: Some("line one\nline two".to_string()),
                    ..SongMetadata::default()
                },
            )
            .expect("update should succeed");
        registry
            .mark_no_content("https://t.test/2/x.html")
            .expect("update should succeed");

        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("out.csv");
        let written = export_registry(&registry, &path).expect("export should succeed");
        assert_eq!(written, 2);

        let bytes = std::fs::read(&path).expect("export should be readable");
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).expect("utf-8 output");

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers().expect("header row").clone();
        assert_eq!(headers.get(0), Some("url"));
        assert_eq!(headers.len(), 11);

        let records: Vec<csv::StringRecord> = reader
            .records()
            .map(|record| record.expect("valid record"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get(4), Some("Mưa, chiều"));
        assert_eq!(records[0].get(6), Some("line one\nline two"));
        assert!(records.iter().all(|record| record.get(0) != Some("https://t.test/2/x.html")));
    }
}
