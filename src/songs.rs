//! Per-song detail harvest over the item links collected by the sitemap crawl.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use scraper::{ElementRef, Html, Node, Selector};

use crate::checkpoint::write_atomically;
use crate::config::SongsConfig;
use crate::error::{HarvestError, Result};
use crate::export::UTF8_BOM;
use crate::fetch::{PageFetcher, Politeness};
use crate::shutdown::ShutdownFlag;

pub const SONG_COLUMNS: [&str; 6] = ["id", "title", "artist", "composer", "genre", "lyrics"];

const COMPOSER_LABEL: &str = "Nhạc sĩ:";
const GENRE_LABEL: &str = "Thể loại:";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SongRecord {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub composer: String,
    pub genre: String,
    pub lyrics: String,
}

impl SongRecord {
    fn to_record(&self) -> [&str; 6] {
        [
            self.id.as_str(),
            self.title.as_str(),
            self.artist.as_str(),
            self.composer.as_str(),
            self.genre.as_str(),
            self.lyrics.as_str(),
        ]
    }
}

/// Trailing `-` segment of a song URL.
pub fn song_id(url: &str) -> &str {
    url.rsplit('-').next().unwrap_or(url)
}

fn spaced_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_expander(element: ElementRef<'_>) -> bool {
    element.value().classes().any(|class| class == "btn-exp-coll")
}

/// nhac.vn song detail pages.
pub struct SongPageParser {
    heading: Selector,
    singer: Selector,
    detail_row: Selector,
    label: Selector,
    composer_value: Selector,
    genre_value: Selector,
    lyrics: Selector,
}

impl Default for SongPageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SongPageParser {
    pub fn new() -> Self {
        Self {
            heading: Selector::parse("h1.name_detail").expect("valid heading selector"),
            singer: Selector::parse("a.singer").expect("valid singer selector"),
            detail_row: Selector::parse("ul.detail-info li p").expect("valid detail selector"),
            label: Selector::parse("span.label").expect("valid label selector"),
            composer_value: Selector::parse("span.val").expect("valid composer selector"),
            genre_value: Selector::parse("a.val").expect("valid genre selector"),
            lyrics: Selector::parse("div.content_lyrics.dsc-body").expect("valid lyrics selector"),
        }
    }

    pub fn parse(&self, url: &str, body: &str) -> SongRecord {
        let document = Html::parse_document(body);
        let mut song = SongRecord {
            id: song_id(url).to_string(),
            ..SongRecord::default()
        };

        if let Some(heading) = document.select(&self.heading).next() {
            let heading = spaced_text(heading);
            match heading.split_once(" - ") {
                Some((title, artist)) => {
                    song.title = title.to_string();
                    song.artist = artist.to_string();
                }
                None => song.title = heading,
            }
        }
        if let Some(singer) = document.select(&self.singer).next() {
            song.artist = spaced_text(singer);
        }

        for row in document.select(&self.detail_row) {
            let Some(label) = row.select(&self.label).next() else {
                continue;
            };
            let label = label.text().collect::<String>();
            if song.composer.is_empty() && label.contains(COMPOSER_LABEL) {
                if let Some(value) = row.select(&self.composer_value).next() {
                    song.composer = spaced_text(value);
                }
            } else if song.genre.is_empty() && label.contains(GENRE_LABEL) {
                if let Some(value) = row.select(&self.genre_value).next() {
                    song.genre = spaced_text(value);
                }
            }
        }

        if let Some(container) = document.select(&self.lyrics).next() {
            song.lyrics = lyrics_text(container);
        }
        song
    }
}

/// Lyrics lines with `<br>` as line breaks and the expand/collapse
/// buttons left out.
fn lyrics_text(container: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in container.descendants() {
        let inside_expander = node
            .ancestors()
            .chain(std::iter::once(node))
            .filter_map(ElementRef::wrap)
            .any(is_expander);
        if inside_expander {
            continue;
        }
        match node.value() {
            Node::Text(text) => raw.push_str(text),
            Node::Element(element) if element.name() == "br" => raw.push('\n'),
            _ => {}
        }
    }
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Song CSV opened for appending; the BOM and header go in only when the
/// file starts out empty.
pub struct SongCsv {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl SongCsv {
    pub fn open_append(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| HarvestError::io(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| HarvestError::io(path, err))?;
        let empty = file
            .metadata()
            .map_err(|err| HarvestError::io(path, err))?
            .len()
            == 0;
        if empty {
            file.write_all(UTF8_BOM)
                .map_err(|err| HarvestError::io(path, err))?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if empty {
            writer.write_record(SONG_COLUMNS)?;
            writer.flush().map_err(|err| HarvestError::io(path, err))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    pub fn write_song(&mut self, song: &SongRecord) -> Result<()> {
        self.writer.write_record(song.to_record())?;
        self.writer
            .flush()
            .map_err(|err| HarvestError::io(&self.path, err))
    }
}

fn read_song_checkpoint(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|err| HarvestError::io(path, err))?;
    let last = contents.trim();
    Ok((!last.is_empty()).then(|| last.to_string()))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SongReport {
    pub skipped: usize,
    pub written: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct SongHarvester<'a> {
    fetcher: &'a dyn PageFetcher,
    parser: SongPageParser,
    links_file: PathBuf,
    checkpoint_file: PathBuf,
    politeness: Politeness,
    shutdown: ShutdownFlag,
}

impl<'a> SongHarvester<'a> {
    pub fn new(fetcher: &'a dyn PageFetcher, config: &SongsConfig) -> Self {
        Self {
            fetcher,
            parser: SongPageParser::new(),
            links_file: config.links_file.clone(),
            checkpoint_file: config.checkpoint_file.clone(),
            politeness: Politeness::from_millis(config.delay_ms, 0),
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Harvests every link after the checkpointed one. Failed pages are
    /// skipped without moving the checkpoint.
    pub fn run(&self, output: &mut SongCsv) -> Result<SongReport> {
        let mut report = SongReport::default();
        let mut resume_after = read_song_checkpoint(&self.checkpoint_file)?;
        if let Some(last) = &resume_after {
            info!("Resuming song harvest after {last}");
        }

        let links = File::open(&self.links_file)
            .map_err(|err| HarvestError::io(&self.links_file, err))?;
        for line in BufReader::new(links).lines() {
            let line = line.map_err(|err| HarvestError::io(&self.links_file, err))?;
            let url = line.trim();
            if url.is_empty() {
                continue;
            }
            if let Some(last) = &resume_after {
                if url == last {
                    resume_after = None;
                }
                report.skipped += 1;
                continue;
            }
            if self.shutdown.is_requested() {
                warn!("Stopping song harvest before {url}");
                report.cancelled = true;
                break;
            }

            match self.fetcher.fetch(url, &[]) {
                Some(page) if page.is_success() => {
                    let song = self.parser.parse(url, &page.body);
                    output.write_song(&song)?;
                    write_atomically(&self.checkpoint_file, url.as_bytes())?;
                    report.written += 1;
                    info!("Saved {} - {}", song.title, song.artist);
                }
                Some(page) => {
                    warn!("HTTP {} for {url}, skipping", page.status);
                    report.failed += 1;
                }
                None => {
                    warn!("No response for {url}, skipping");
                    report.failed += 1;
                }
            }
            self.politeness.pause();
        }

        if let Some(last) = resume_after {
            warn!(
                "Checkpointed link {last} is not in {}; nothing was harvested",
                self.links_file.display()
            );
        }
        info!(
            "Song harvest: {} written, {} failed, {} skipped",
            report.written, report.failed, report.skipped
        );
        Ok(report)
    }
}
