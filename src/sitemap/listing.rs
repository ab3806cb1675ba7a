//! Paginated artist listing enumeration.

use log::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, CheckpointTracker};
use crate::error::Result;
use crate::fetch::{PageFetcher, Politeness};
use crate::shutdown::ShutdownFlag;
use crate::sitemap::layout::SitemapLayout;
use crate::sitemap::output_log::{ItemSink, SeenUrls};

/// Why enumeration of one listing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStop {
    FetchFailed,
    EmptyPage,
    NoNewItems,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingScan {
    /// Newly discovered item URLs, in discovery order.
    pub items: Vec<String>,
    pub pages_visited: u32,
    pub stop: ListingStop,
}

pub struct ListingEnumerator<'a> {
    fetcher: &'a dyn PageFetcher,
    layout: &'a dyn SitemapLayout,
    politeness: Politeness,
    shutdown: ShutdownFlag,
}

impl<'a> ListingEnumerator<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        layout: &'a dyn SitemapLayout,
        politeness: Politeness,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            fetcher,
            layout,
            politeness,
            shutdown,
        }
    }

    /// Walks `group_url` page by page from the page encoded in `resume_from`
    /// (or page 1). Each page is written to the checkpoint before it is
    /// fetched, so an interrupted scan re-enters at that exact page. New
    /// links are appended to `sink` page by page.
    ///
    /// A resumed page was usually already written to the log by the
    /// interrupted run, so it never triggers the "no new items" stop.
    pub fn enumerate<S: CheckpointStore>(
        &self,
        group_url: &str,
        resume_from: Option<&str>,
        seen: &mut SeenUrls,
        sink: &mut dyn ItemSink,
        tracker: &mut CheckpointTracker<S>,
    ) -> Result<ListingScan> {
        let resumed_page = resume_from.and_then(|url| self.layout.page_number(url));
        let mut page = resumed_page.unwrap_or(1).max(1);
        let mut items = Vec::new();
        let mut pages_visited = 0u32;

        let stop = loop {
            if self.shutdown.is_requested() {
                break ListingStop::Cancelled;
            }

            let page_url = self.layout.listing_page_url(group_url, page);
            debug!("Scanning listing page {page_url}");
            tracker.save_progress(None, None, Some(&page_url))?;

            let fetched = self.fetcher.fetch(&page_url, &[]);
            pages_visited += 1;
            let Some(fetched) = fetched.filter(|fetched| fetched.is_success()) else {
                warn!("Listing page {page_url} could not be fetched, stopping");
                break ListingStop::FetchFailed;
            };

            let links = self.layout.item_links(&fetched.body, &page_url);
            if links.is_empty() {
                info!("Listing page {page} of {group_url} has no songs, stopping");
                break ListingStop::EmptyPage;
            }

            let fresh: Vec<String> = links.into_iter().filter(|link| seen.insert(link)).collect();
            if fresh.is_empty() {
                if resumed_page != Some(page) {
                    info!("Listing page {page} of {group_url} has no new songs, stopping");
                    break ListingStop::NoNewItems;
                }
                debug!("Resumed page {page} of {group_url} was already recorded");
            } else {
                sink.append(&fresh)?;
                items.extend(fresh);
            }

            page += 1;
            self.politeness.pause();
        };

        Ok(ListingScan {
            items,
            pages_visited,
            stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ListingEnumerator, ListingStop};
    use crate::checkpoint::{CheckpointTracker, MemoryCheckpointStore};
    use crate::fetch::test_support::ScriptedFetcher;
    use crate::fetch::Politeness;
    use crate::shutdown::ShutdownFlag;
    use crate::sitemap::layout::fixtures::listing_page;
    use crate::sitemap::layout::NhacvnLayout;
    use crate::sitemap::output_log::SeenUrls;

    const GROUP: &str = "https://nhac.test/nghe-si/x/bai-hat";

    fn tracker() -> CheckpointTracker<MemoryCheckpointStore> {
        CheckpointTracker::open(MemoryCheckpointStore::default()).expect("tracker opens")
    }

    #[test]
    fn test_overlapping_pages_yield_each_song_once_and_stop_on_empty_page() {
        let fetcher = ScriptedFetcher::new()
            .page(GROUP, &listing_page(&["/bai-hat/song-1", "/bai-hat/song-2"]))
            .page(
                &format!("{GROUP}?p=2"),
                &listing_page(&["/bai-hat/song-2", "/bai-hat/song-3"]),
            )
            .page(&format!("{GROUP}?p=3"), &listing_page(&[]));
        let layout = NhacvnLayout::new();
        let enumerator =
            ListingEnumerator::new(&fetcher, &layout, Politeness::none(), ShutdownFlag::new());
        let mut seen = SeenUrls::new();
        let mut tracker = tracker();

        let mut sink: Vec<String> = Vec::new();
        let scan = enumerator
            .enumerate(GROUP, None, &mut seen, &mut sink, &mut tracker)
            .expect("scan should succeed");

        assert_eq!(
            scan.items,
            vec![
                "https://nhac.test/bai-hat/song-1".to_string(),
                "https://nhac.test/bai-hat/song-2".to_string(),
                "https://nhac.test/bai-hat/song-3".to_string(),
            ]
        );
        assert_eq!(sink, scan.items);
        assert_eq!(scan.pages_visited, 3);
        assert_eq!(scan.stop, ListingStop::EmptyPage);
        assert_eq!(seen.len(), 3);
        assert_eq!(
            tracker.state().current.page.as_deref(),
            Some("https://nhac.test/nghe-si/x/bai-hat?p=3")
        );
    }

    #[test]
    fn test_stops_when_page_has_only_seen_songs() {
        let fetcher = ScriptedFetcher::new()
            .page(GROUP, &listing_page(&["/bai-hat/song-1"]))
            .page(&format!("{GROUP}?p=2"), &listing_page(&["/bai-hat/song-1"]));
        let layout = NhacvnLayout::new();
        let enumerator =
            ListingEnumerator::new(&fetcher, &layout, Politeness::none(), ShutdownFlag::new());
        let mut seen = SeenUrls::new();

        let scan = enumerator
            .enumerate(GROUP, None, &mut seen, &mut Vec::<String>::new(), &mut tracker())
            .expect("scan should succeed");

        assert_eq!(scan.items.len(), 1);
        assert_eq!(scan.stop, ListingStop::NoNewItems);
        assert_eq!(fetcher.call_count(&format!("{GROUP}?p=3")), 0);
    }

    #[test]
    fn test_resume_starts_at_checkpointed_page() {
        let fetcher = ScriptedFetcher::new()
            .page(&format!("{GROUP}?p=4"), &listing_page(&["/bai-hat/song-9"]));
        let layout = NhacvnLayout::new();
        let enumerator =
            ListingEnumerator::new(&fetcher, &layout, Politeness::none(), ShutdownFlag::new());
        let mut seen = SeenUrls::new();

        let scan = enumerator
            .enumerate(
                GROUP,
                Some("https://nhac.test/nghe-si/x/bai-hat?p=4"),
                &mut seen,
                &mut Vec::<String>::new(),
                &mut tracker(),
            )
            .expect("scan should succeed");

        assert_eq!(fetcher.calls()[0], format!("{GROUP}?p=4"));
        assert_eq!(fetcher.call_count(GROUP), 0);
        assert_eq!(scan.items, vec!["https://nhac.test/bai-hat/song-9".to_string()]);
        assert_eq!(scan.stop, ListingStop::FetchFailed);
    }

    #[test]
    fn test_non_200_page_counts_as_fetch_failure() {
        let fetcher = ScriptedFetcher::new().status(GROUP, 500, "oops");
        let layout = NhacvnLayout::new();
        let enumerator =
            ListingEnumerator::new(&fetcher, &layout, Politeness::none(), ShutdownFlag::new());

        let scan = enumerator
            .enumerate(
                GROUP,
                None,
                &mut SeenUrls::new(),
                &mut Vec::<String>::new(),
                &mut tracker(),
            )
            .expect("scan should succeed");
        assert!(scan.items.is_empty());
        assert_eq!(scan.stop, ListingStop::FetchFailed);
    }

    #[test]
    fn test_resumed_page_already_in_log_does_not_end_listing() {
        let fetcher = ScriptedFetcher::new()
            .page(&format!("{GROUP}?p=2"), &listing_page(&["/bai-hat/song-2"]))
            .page(&format!("{GROUP}?p=3"), &listing_page(&["/bai-hat/song-3"]));
        let layout = NhacvnLayout::new();
        let enumerator =
            ListingEnumerator::new(&fetcher, &layout, Politeness::none(), ShutdownFlag::new());
        let mut seen: SeenUrls = ["https://nhac.test/bai-hat/song-2"].into_iter().collect();
        let mut sink: Vec<String> = Vec::new();

        let scan = enumerator
            .enumerate(
                GROUP,
                Some(format!("{GROUP}?p=2").as_str()),
                &mut seen,
                &mut sink,
                &mut tracker(),
            )
            .expect("scan should succeed");

        assert_eq!(sink, vec!["https://nhac.test/bai-hat/song-3".to_string()]);
        assert_eq!(scan.pages_visited, 3);
        assert_eq!(scan.stop, ListingStop::FetchFailed);
    }
}
