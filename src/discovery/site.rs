//! Per-site rules for keyword search, ID URLs and song page fields.

use std::collections::BTreeSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::SearchConfig;
use crate::error::{HarvestError, Result};
use crate::registry::SongMetadata;

pub trait SearchSite: Send + Sync {
    fn search_url(&self) -> String;
    /// Query parameters for results page `page` (1-based) of `keyword`.
    fn search_params(&self, keyword: &str, page: u32) -> Vec<(String, String)>;
    /// Absolute song links on a search results page, sorted and unique.
    fn song_links(&self, body: &str) -> Vec<String>;
    /// Number of results pages advertised by the first page; at least 1.
    fn page_count(&self, body: &str) -> u32;
    fn id_url(&self, id: u64) -> String;
    fn extract_metadata(&self, body: &str) -> SongMetadata;
}

/// Composed and decomposed spellings of "nốt nhạc" (sheet music).
const SHEET_MUSIC_MARKERS: [&str; 2] = ["nốt nhạc", "no\u{302}\u{301}t nha\u{323}c"];

/// lyric.tkaraoke.com
pub struct TkaraokeSite {
    base: Url,
    search_path: String,
    page_param: String,
    song_path: Regex,
    anchor: Selector,
    pager_anchor: Selector,
    title: Selector,
    author: Selector,
    lyrics: Selector,
    audio: Selector,
    karaoke_link: Selector,
    sheet_link: Selector,
}

impl TkaraokeSite {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|err| {
            HarvestError::Config(format!("invalid search base_url {}: {err}", config.base_url))
        })?;
        Ok(Self {
            base,
            search_path: config.search_path.clone(),
            page_param: config.page_param.clone(),
            song_path: Regex::new(r"/\d+/.+\.html$").expect("valid song path pattern"),
            anchor: Selector::parse("a[href]").expect("valid anchor selector"),
            pager_anchor: Selector::parse("a").expect("valid pager selector"),
            title: Selector::parse("h3.h3-title-song").expect("valid title selector"),
            author: Selector::parse("div.div-author").expect("valid author selector"),
            lyrics: Selector::parse("div.div-content-lyric").expect("valid lyrics selector"),
            audio: Selector::parse("audio, [href*='DownloadMp3.aspx'], .btn-play, .play-btn")
                .expect("valid audio selector"),
            karaoke_link: Selector::parse("[href*='KaraokeLyric.aspx']")
                .expect("valid karaoke selector"),
            sheet_link: Selector::parse("[href*='ViewMusicSheet.aspx']")
                .expect("valid sheet selector"),
        })
    }
}

fn compact_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

impl SearchSite for TkaraokeSite {
    fn search_url(&self) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        format!("{base}{}", self.search_path)
    }

    fn search_params(&self, keyword: &str, page: u32) -> Vec<(String, String)> {
        let mut params = vec![("kw".to_string(), keyword.to_string())];
        if page > 1 {
            params.push((self.page_param.clone(), page.to_string()));
        }
        params
    }

    fn song_links(&self, body: &str) -> Vec<String> {
        let document = Html::parse_document(body);
        let mut links = BTreeSet::new();
        for anchor in document.select(&self.anchor) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let href = href.split('#').next().unwrap_or_default();
            if !self.song_path.is_match(href) {
                continue;
            }
            if let Ok(resolved) = self.base.join(href) {
                links.insert(resolved.to_string());
            }
        }
        links.into_iter().collect()
    }

    fn page_count(&self, body: &str) -> u32 {
        let document = Html::parse_document(body);
        document
            .select(&self.pager_anchor)
            .filter_map(|anchor| {
                let text = anchor.text().collect::<String>();
                let text = text.trim();
                if !text.is_empty() && text.chars().all(|ch| ch.is_ascii_digit()) {
                    text.parse::<u32>().ok()
                } else {
                    None
                }
            })
            .max()
            .unwrap_or(1)
            .max(1)
    }

    fn id_url(&self, id: u64) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        format!("{base}/{id}/x.html")
    }

    fn extract_metadata(&self, body: &str) -> SongMetadata {
        let document = Html::parse_document(body);
        let title = document
            .select(&self.title)
            .next()
            .map(compact_text)
            .and_then(non_blank);
        let artist = document
            .select(&self.author)
            .next()
            .map(compact_text)
            .and_then(non_blank);
        let lyrics = document
            .select(&self.lyrics)
            .next()
            .map(|node| {
                node.text()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .and_then(non_blank);

        let page_text = document.root_element().text().collect::<String>().to_lowercase();
        SongMetadata {
            title,
            artist,
            lyrics,
            has_audio: document.select(&self.audio).next().is_some(),
            has_karaoke: document.select(&self.karaoke_link).next().is_some()
                || page_text.contains("karaoke"),
            has_sheet: document.select(&self.sheet_link).next().is_some()
                || SHEET_MUSIC_MARKERS
                    .iter()
                    .any(|marker| page_text.contains(marker)),
        }
    }
}
