//! Checkpointed depth-first walk over a sitemap tree.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, CheckpointTracker, InFlightPath};
use crate::error::Result;
use crate::fetch::{PageFetcher, Politeness};
use crate::shutdown::ShutdownFlag;
use crate::sitemap::layout::SitemapLayout;
use crate::sitemap::listing::{ListingEnumerator, ListingStop};
use crate::sitemap::output_log::{ItemSink, SeenUrls};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub completed_units: usize,
    pub skipped_units: usize,
    pub groups_scanned: usize,
    pub new_items: usize,
    pub failed_branches: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitOutcome {
    Completed,
    Skipped,
    Incomplete,
    Cancelled,
}

/// Index of the first candidate to process given a saved resume pointer.
///
/// The pointer only filters when it names one of `candidates`; it is then
/// consumed so later nodes are processed unconditionally. A pointer that is
/// not among the candidates belongs to another branch and filters nothing.
fn resume_start(candidates: &[String], pointer: &mut Option<String>) -> Option<usize> {
    let target = pointer.as_deref()?;
    let index = candidates.iter().position(|candidate| candidate == target)?;
    *pointer = None;
    Some(index)
}

pub struct SitemapCrawler<'a, S: CheckpointStore> {
    fetcher: &'a dyn PageFetcher,
    layout: &'a dyn SitemapLayout,
    tracker: &'a mut CheckpointTracker<S>,
    seen: &'a mut SeenUrls,
    sink: &'a mut dyn ItemSink,
    politeness: Politeness,
    shutdown: ShutdownFlag,
    resume: InFlightPath,
    visited: HashSet<String>,
    report: CrawlReport,
}

impl<'a, S: CheckpointStore> SitemapCrawler<'a, S> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        layout: &'a dyn SitemapLayout,
        tracker: &'a mut CheckpointTracker<S>,
        seen: &'a mut SeenUrls,
        sink: &'a mut dyn ItemSink,
    ) -> Self {
        let resume = tracker.state().current.clone();
        Self {
            fetcher,
            layout,
            tracker,
            seen,
            sink,
            politeness: Politeness::none(),
            shutdown: ShutdownFlag::new(),
            resume,
            visited: HashSet::new(),
            report: CrawlReport::default(),
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

    /// Walks the tree below `root`. The root itself is never recorded as a
    /// completed unit, so a later run re-reads it to find new children.
    pub fn crawl(mut self, root: &str) -> Result<CrawlReport> {
        if !self.resume.is_empty() {
            info!("Resuming sitemap crawl at {:?}", self.resume);
        }
        let outcome = self.visit(root)?;
        self.report.cancelled = outcome == VisitOutcome::Cancelled;
        info!(
            "Sitemap crawl finished: {} unit(s) completed, {} skipped, {} artist listing(s), {} new link(s), {} failed branch(es){}",
            self.report.completed_units,
            self.report.skipped_units,
            self.report.groups_scanned,
            self.report.new_items,
            self.report.failed_branches,
            if self.report.cancelled { ", cancelled" } else { "" }
        );
        Ok(self.report)
    }

    fn visit(&mut self, node_url: &str) -> Result<VisitOutcome> {
        if self.shutdown.is_requested() {
            return Ok(VisitOutcome::Cancelled);
        }
        if self.tracker.is_completed(node_url) {
            debug!("Skipping completed sitemap {node_url}");
            self.report.skipped_units += 1;
            return Ok(VisitOutcome::Skipped);
        }
        if !self.visited.insert(node_url.to_string()) {
            warn!("Sitemap {node_url} was already visited in this run, skipping");
            return Ok(VisitOutcome::Skipped);
        }

        let Some(page) = self
            .fetcher
            .fetch(node_url, &[])
            .filter(|page| page.is_success())
        else {
            warn!("Could not fetch sitemap {node_url}, leaving it for a later run");
            self.report.failed_branches += 1;
            return Ok(VisitOutcome::Incomplete);
        };

        let locations = self.layout.locations(&page.body);
        let sitemap_children: Vec<String> = locations
            .iter()
            .filter(|loc| self.layout.is_sitemap_reference(loc))
            .cloned()
            .collect();

        if sitemap_children.is_empty() {
            self.expand_leaf(node_url, &locations)
        } else {
            self.visit_interior(node_url, &sitemap_children)
        }
    }

    fn visit_interior(&mut self, node_url: &str, children: &[String]) -> Result<VisitOutcome> {
        debug!("Sitemap {node_url} references {} sitemap(s)", children.len());
        let start = resume_start(children, &mut self.resume.parent).unwrap_or(0);
        if start > 0 {
            info!("Resuming {node_url} at child {}", children[start]);
        }

        let mut complete = true;
        for child in &children[start..] {
            if self.shutdown.is_requested() {
                return Ok(VisitOutcome::Cancelled);
            }
            if self.tracker.is_completed(child) {
                self.report.skipped_units += 1;
                continue;
            }

            // Keep the artist/page pointers only while they may still be
            // consumed further down this branch.
            if self.resume.child.is_some() {
                self.tracker.save_progress(Some(child), None, None)?;
            } else {
                self.tracker.save_progress(Some(child), Some(""), Some(""))?;
            }
            self.politeness.pause();

            match self.visit(child)? {
                VisitOutcome::Completed => {
                    self.tracker.mark_unit_complete(child)?;
                    self.report.completed_units += 1;
                }
                VisitOutcome::Skipped => {}
                VisitOutcome::Incomplete => complete = false,
                VisitOutcome::Cancelled => return Ok(VisitOutcome::Cancelled),
            }
        }

        Ok(if complete {
            VisitOutcome::Completed
        } else {
            VisitOutcome::Incomplete
        })
    }

    fn expand_leaf(&mut self, node_url: &str, locations: &[String]) -> Result<VisitOutcome> {
        let mut groups: Vec<String> = Vec::new();
        for group in locations
            .iter()
            .filter_map(|loc| self.layout.group_listing_url(loc))
        {
            if !groups.contains(&group) {
                groups.push(group);
            }
        }
        debug!("Sitemap {node_url} lists {} artist(s)", groups.len());

        let (start, mut resume_page) = match resume_start(&groups, &mut self.resume.child) {
            Some(index) => {
                info!("Resuming {node_url} at artist {}", groups[index]);
                (index, self.resume.page.take())
            }
            None => (0, None),
        };

        let enumerator = ListingEnumerator::new(
            self.fetcher,
            self.layout,
            self.politeness,
            self.shutdown.clone(),
        );

        for group in &groups[start..] {
            if self.shutdown.is_requested() {
                return Ok(VisitOutcome::Cancelled);
            }
            let resume_from = resume_page.take();
            if resume_from.is_none() {
                self.tracker
                    .save_progress(Some(node_url), Some(group), Some(""))?;
            }

            let scan = enumerator.enumerate(
                group,
                resume_from.as_deref(),
                &mut *self.seen,
                &mut *self.sink,
                &mut *self.tracker,
            )?;
            self.report.groups_scanned += 1;
            self.report.new_items += scan.items.len();
            if !scan.items.is_empty() {
                info!(
                    "Artist {group}: {} new link(s) over {} page(s)",
                    scan.items.len(),
                    scan.pages_visited
                );
            }
            if scan.stop == ListingStop::Cancelled {
                return Ok(VisitOutcome::Cancelled);
            }

            self.tracker.save_progress(None, Some(""), Some(""))?;
            self.politeness.pause();
        }

        Ok(VisitOutcome::Completed)
    }
}
