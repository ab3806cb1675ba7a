//! Breadth-first keyword search with adaptive prefix expansion.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use log::{debug, info, warn};

use crate::config::SearchConfig;
use crate::discovery::site::SearchSite;
use crate::error::Result;
use crate::fetch::{FetchedPage, PageFetcher, Politeness};
use crate::registry::SongRegistry;
use crate::shutdown::ShutdownFlag;

pub const SEARCH_ITER_KEY: &str = "search_iter";
const PROGRESS_EVERY: usize = 50;
/// Failed fetches tolerated per keyword before it is left for the next run.
const MAX_KEYWORD_REQUEUES: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchReport {
    pub keywords_processed: usize,
    /// Keywords answered from the registry instead of the network.
    pub keywords_recalled: usize,
    pub links_found: usize,
    pub new_urls: usize,
    pub requeued: usize,
    pub abandoned: Vec<String>,
    pub limit_reached: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchLimits {
    pub alphabet: Vec<char>,
    pub expand_threshold: usize,
    pub max_prefix_len: usize,
    pub max_keywords: usize,
    pub max_result_pages: u32,
}

impl From<&SearchConfig> for SearchLimits {
    fn from(config: &SearchConfig) -> Self {
        Self {
            alphabet: config.alphabet.chars().collect(),
            expand_threshold: config.expand_threshold,
            max_prefix_len: config.max_prefix_len,
            max_keywords: config.max_keywords,
            max_result_pages: config.max_result_pages,
        }
    }
}

pub struct SearchCrawler<'a> {
    fetcher: &'a dyn PageFetcher,
    site: &'a dyn SearchSite,
    registry: &'a SongRegistry,
    limits: SearchLimits,
    politeness: Politeness,
    shutdown: ShutdownFlag,
}

impl<'a> SearchCrawler<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        site: &'a dyn SearchSite,
        registry: &'a SongRegistry,
        limits: SearchLimits,
    ) -> Self {
        Self {
            fetcher,
            site,
            registry,
            limits,
            politeness: Politeness::none(),
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_politeness(mut self, politeness: Politeness) -> Self {
        self.politeness = politeness;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Processes keywords until the queue drains, the keyword cap is hit or
    /// shutdown is requested. Keywords recorded by an earlier run are not
    /// fetched again; their stored hit counts rebuild the same frontier.
    pub fn run(&self) -> Result<SearchReport> {
        let recalled = self.registry.processed_keywords()?;
        if !recalled.is_empty() {
            info!("Search: {} keyword(s) already processed", recalled.len());
        }

        let mut report = SearchReport::default();
        let mut processed: HashSet<String> = HashSet::new();
        let mut failures: HashMap<String, u32> = HashMap::new();
        let mut queue: VecDeque<String> = self
            .limits
            .alphabet
            .iter()
            .map(|ch| ch.to_string())
            .collect();

        while let Some(keyword) = queue.pop_front() {
            if processed.len() >= self.limits.max_keywords {
                info!("Search: keyword limit {} reached", self.limits.max_keywords);
                report.limit_reached = true;
                break;
            }
            if self.shutdown.is_requested() {
                report.cancelled = true;
                break;
            }
            if processed.contains(&keyword) {
                continue;
            }

            let hits = if let Some(&hits) = recalled.get(&keyword) {
                report.keywords_recalled += 1;
                hits
            } else {
                let Some(links) = self.harvest_keyword(&keyword) else {
                    let attempts = failures.entry(keyword.clone()).or_insert(0);
                    *attempts += 1;
                    if *attempts >= MAX_KEYWORD_REQUEUES {
                        warn!("Search: giving up on keyword {keyword:?} for this run");
                        report.abandoned.push(keyword);
                    } else {
                        debug!("Search: requeueing keyword {keyword:?}");
                        report.requeued += 1;
                        queue.push_back(keyword);
                    }
                    continue;
                };

                let provenance = format!("search:{keyword}");
                for link in &links {
                    if self.registry.insert_if_absent(link, &provenance)? {
                        report.new_urls += 1;
                    }
                }
                self.registry.record_keyword(&keyword, links.len())?;
                report.keywords_processed += 1;
                report.links_found += links.len();
                links.len()
            };

            if hits >= self.limits.expand_threshold
                && keyword.chars().count() < self.limits.max_prefix_len
            {
                for ch in &self.limits.alphabet {
                    let extended = format!("{keyword}{ch}");
                    if !processed.contains(&extended) {
                        queue.push_back(extended);
                    }
                }
            }

            processed.insert(keyword);
            if processed.len() % PROGRESS_EVERY == 0 {
                self.registry
                    .set_meta(SEARCH_ITER_KEY, &processed.len().to_string())?;
                info!(
                    "Search: {} keyword(s) done, {} queued, {} new URL(s)",
                    processed.len(),
                    queue.len(),
                    report.new_urls
                );
            }
        }

        self.registry
            .set_meta(SEARCH_ITER_KEY, &processed.len().to_string())?;
        info!(
            "Search finished: {} keyword(s) fetched, {} recalled, {} link(s), {} new URL(s){}",
            report.keywords_processed,
            report.keywords_recalled,
            report.links_found,
            report.new_urls,
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }

    /// Union of song links over every results page of `keyword`. `None` when
    /// the first page was missing or not a 200, or shutdown interrupted the
    /// page walk.
    fn harvest_keyword(&self, keyword: &str) -> Option<BTreeSet<String>> {
        let url = self.site.search_url();
        let first = self.fetch_results(&url, keyword, 1);
        self.politeness.pause();
        let first = match first {
            Some(page) if page.is_success() => page,
            Some(page) => {
                warn!("Search: keyword {keyword:?} got HTTP {}", page.status);
                return None;
            }
            None => return None,
        };

        let pages = self
            .site
            .page_count(&first.body)
            .min(self.limits.max_result_pages);
        let mut links: BTreeSet<String> = self.site.song_links(&first.body).into_iter().collect();
        for page in 2..=pages {
            if self.shutdown.is_requested() {
                return None;
            }
            let fetched = self.fetch_results(&url, keyword, page);
            self.politeness.pause();
            match fetched.filter(FetchedPage::is_success) {
                Some(fetched) => links.extend(self.site.song_links(&fetched.body)),
                None => warn!("Search: page {page} of keyword {keyword:?} failed, skipping it"),
            }
        }
        debug!("Search: keyword {keyword:?} -> {} link(s) over {pages} page(s)", links.len());
        Some(links)
    }

    fn fetch_results(&self, url: &str, keyword: &str, page: u32) -> Option<FetchedPage> {
        let params = self.site.search_params(keyword, page);
        let params: Vec<(&str, &str)> = params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        self.fetcher.fetch(url, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::{SearchCrawler, SearchLimits, SEARCH_ITER_KEY};
    use crate::config::SearchConfig;
    use crate::discovery::site::fixtures::results_page;
    use crate::discovery::site::TkaraokeSite;
    use crate::fetch::test_support::ScriptedFetcher;
    use crate::registry::SongRegistry;

    const SEARCH: &str = "https://t.test/SearchResult.aspx";

    fn site() -> TkaraokeSite {
        TkaraokeSite::new(&SearchConfig {
            base_url: "https://t.test".to_string(),
            ..SearchConfig::default()
        })
        .expect("site should build")
    }

    fn limits(alphabet: &str, threshold: usize) -> SearchLimits {
        SearchLimits {
            alphabet: alphabet.chars().collect(),
            expand_threshold: threshold,
            max_prefix_len: 2,
            max_keywords: 100,
            max_result_pages: 10,
        }
    }

    fn registry() -> SongRegistry {
        SongRegistry::new_in_memory().expect("registry should open")
    }

    fn search_key(keyword: &str) -> String {
        format!("{SEARCH}?kw={keyword}")
    }

    fn expanding_site() -> ScriptedFetcher {
        ScriptedFetcher::new()
            .page(
                &search_key("a"),
                &results_page(&["/1/one.html", "/2/two.html"], &[1, 2]),
            )
            .page(
                &format!("{SEARCH}?kw=a&p=2"),
                &results_page(&["/2/two.html", "/3/three.html"], &[1, 2]),
            )
            .page(&search_key("b"), &results_page(&["/4/four.html"], &[]))
            .page(&search_key("aa"), &results_page(&["/1/one.html"], &[]))
            .page(&search_key("ab"), &results_page(&[], &[]))
    }

    #[test]
    fn test_high_hit_keyword_is_expanded_and_links_are_unioned() {
        let fetcher = expanding_site();
        let site = site();
        let registry = registry();

        let report = SearchCrawler::new(&fetcher, &site, &registry, limits("ab", 3))
            .run()
            .expect("search should succeed");

        assert_eq!(report.keywords_processed, 4);
        assert_eq!(report.new_urls, 4);
        assert_eq!(
            fetcher.calls(),
            vec![
                search_key("a"),
                format!("{SEARCH}?kw=a&p=2"),
                search_key("b"),
                search_key("aa"),
                search_key("ab"),
            ]
        );
        let row = registry
            .row("https://t.test/1/one.html")
            .expect("lookup should succeed")
            .expect("row should exist");
        assert_eq!(row.discovered_by.as_deref(), Some("search:a"));
        assert_eq!(
            registry.meta(SEARCH_ITER_KEY).expect("meta should load").as_deref(),
            Some("4")
        );
    }

    #[test]
    fn test_failed_keyword_is_requeued_not_dropped() {
        let fetcher = ScriptedFetcher::new().page(&search_key("b"), &results_page(&[], &[]));
        let site = site();
        let registry = registry();

        let report = SearchCrawler::new(&fetcher, &site, &registry, limits("ab", 3))
            .run()
            .expect("search should succeed");

        assert_eq!(fetcher.call_count(&search_key("a")), 5);
        assert_eq!(report.requeued, 4);
        assert_eq!(report.abandoned, vec!["a".to_string()]);
        assert!(!registry
            .processed_keywords()
            .expect("keywords should load")
            .contains_key("a"));
    }

    #[test]
    fn test_blocked_keyword_is_not_recorded_and_is_fetched_next_run() {
        let site = site();
        let registry = registry();
        let blocked = ScriptedFetcher::new().status(&search_key("a"), 503, "busy");

        let first = SearchCrawler::new(&blocked, &site, &registry, limits("a", 3))
            .run()
            .expect("first search should succeed");
        assert_eq!(first.keywords_processed, 0);
        assert_eq!(first.abandoned, vec!["a".to_string()]);
        assert!(registry
            .processed_keywords()
            .expect("keywords should load")
            .is_empty());

        let recovered = ScriptedFetcher::new()
            .page(&search_key("a"), &results_page(&["/1/one.html"], &[]));
        let second = SearchCrawler::new(&recovered, &site, &registry, limits("a", 3))
            .run()
            .expect("second search should succeed");
        assert_eq!(recovered.call_count(&search_key("a")), 1);
        assert_eq!(second.keywords_processed, 1);
        assert_eq!(second.new_urls, 1);
    }

    #[test]
    fn test_rerun_recalls_keywords_without_fetching() {
        let site = site();
        let registry = registry();
        SearchCrawler::new(&expanding_site(), &site, &registry, limits("ab", 3))
            .run()
            .expect("first search should succeed");

        let fetcher = ScriptedFetcher::new();
        let report = SearchCrawler::new(&fetcher, &site, &registry, limits("ab", 3))
            .run()
            .expect("second search should succeed");

        assert!(fetcher.calls().is_empty());
        assert_eq!(report.keywords_recalled, 4);
        assert_eq!(report.new_urls, 0);
    }

    #[test]
    fn test_keyword_cap_stops_the_queue() {
        let fetcher = expanding_site();
        let site = site();
        let registry = registry();
        let mut capped = limits("ab", 3);
        capped.max_keywords = 1;

        let report = SearchCrawler::new(&fetcher, &site, &registry, capped)
            .run()
            .expect("search should succeed");

        assert!(report.limit_reached);
        assert_eq!(report.keywords_processed, 1);
        assert_eq!(fetcher.call_count(&search_key("b")), 0);
    }
}
