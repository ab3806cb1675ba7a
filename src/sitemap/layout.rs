//! Per-site extraction rules for sitemap-driven discovery.

use scraper::{Html, Selector};
use url::Url;

/// Site-specific reading of sitemap documents and artist listing pages.
pub trait SitemapLayout: Send + Sync {
    /// Every `<loc>` entry of a sitemap document, in document order.
    fn locations(&self, body: &str) -> Vec<String>;
    /// Whether a `<loc>` entry points at another sitemap document.
    fn is_sitemap_reference(&self, loc: &str) -> bool;
    /// Maps an item-group entry (an artist) to its first listing page.
    fn group_listing_url(&self, loc: &str) -> Option<String>;
    fn listing_page_url(&self, group_url: &str, page: u32) -> String;
    /// Page number encoded in a listing page URL, if any.
    fn page_number(&self, page_url: &str) -> Option<u32>;
    /// Absolute item URLs on a listing page, deduplicated, in page order.
    fn item_links(&self, body: &str, page_url: &str) -> Vec<String>;
}

const PAGE_MARKER: &str = "?p=";

/// nhac.vn: sitemap index → artist sitemaps → `/nghe-si/<slug>/bai-hat?p=N`.
pub struct NhacvnLayout {
    loc_selector: Selector,
    song_link_selector: Selector,
}

impl NhacvnLayout {
    pub fn new() -> Self {
        Self {
            loc_selector: Selector::parse("loc").expect("valid loc selector"),
            song_link_selector: Selector::parse("ul.list_song li div.info h3.name a")
                .expect("valid song link selector"),
        }
    }
}

impl Default for NhacvnLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl SitemapLayout for NhacvnLayout {
    fn locations(&self, body: &str) -> Vec<String> {
        let document = Html::parse_document(body);
        document
            .select(&self.loc_selector)
            .map(|node| node.text().collect::<String>().trim().to_string())
            .filter(|loc| !loc.is_empty())
            .collect()
    }

    fn is_sitemap_reference(&self, loc: &str) -> bool {
        loc.contains("sitemap") && loc.ends_with(".xml")
    }

    fn group_listing_url(&self, loc: &str) -> Option<String> {
        if !loc.contains("/nghe-si/") {
            return None;
        }
        Some(format!("{}/bai-hat", loc.trim_end_matches('/')))
    }

    fn listing_page_url(&self, group_url: &str, page: u32) -> String {
        if page <= 1 {
            group_url.to_string()
        } else {
            format!("{group_url}{PAGE_MARKER}{page}")
        }
    }

    fn page_number(&self, page_url: &str) -> Option<u32> {
        let (_, raw) = page_url.rsplit_once(PAGE_MARKER)?;
        raw.trim().parse().ok()
    }

    fn item_links(&self, body: &str, page_url: &str) -> Vec<String> {
        let Ok(base) = Url::parse(page_url) else {
            return Vec::new();
        };
        let document = Html::parse_document(body);
        let mut links: Vec<String> = Vec::new();
        for anchor in document.select(&self.song_link_selector) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            if !href.contains("/bai-hat/") {
                continue;
            }
            if let Ok(resolved) = base.join(href) {
                let resolved = resolved.to_string();
                if !links.contains(&resolved) {
                    links.push(resolved);
                }
            }
        }
        links
    }
}
