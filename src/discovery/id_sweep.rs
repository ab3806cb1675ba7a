//! Brute-force numeric ID discovery fallback.

use log::info;

use crate::config::IdSweepConfig;
use crate::discovery::site::SearchSite;
use crate::error::Result;
use crate::fetch::Politeness;
use crate::registry::{Candidate, SongRegistry};
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: u64,
    pub new_urls: usize,
    pub batches: u64,
    pub cancelled: bool,
}

pub struct IdSweep<'a> {
    site: &'a dyn SearchSite,
    registry: &'a SongRegistry,
    start_id: u64,
    end_id: u64,
    batch_size: u64,
    politeness: Politeness,
    shutdown: ShutdownFlag,
}

impl<'a> IdSweep<'a> {
    pub fn new(site: &'a dyn SearchSite, registry: &'a SongRegistry, config: &IdSweepConfig) -> Self {
        Self {
            site,
            registry,
            start_id: config.start_id,
            end_id: config.end_id,
            batch_size: config.batch_size.max(1),
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

    /// Inserts `{base}/{id}/x.html` for every id in the inclusive range. URLs
    /// already known (from search or an earlier sweep) are left untouched.
    pub fn run(&self) -> Result<SweepReport> {
        info!("ID sweep {}..={}", self.start_id, self.end_id);
        let mut report = SweepReport::default();
        let mut batch_start = self.start_id;

        while batch_start <= self.end_id {
            if self.shutdown.is_requested() {
                report.cancelled = true;
                break;
            }
            let batch_end = batch_start
                .saturating_add(self.batch_size - 1)
                .min(self.end_id);
            let candidates: Vec<Candidate> = (batch_start..=batch_end)
                .map(|id| Candidate {
                    url: self.site.id_url(id),
                    discovered_by: format!("id:{id}"),
                    id_num: i64::try_from(id).ok(),
                })
                .collect();

            report.new_urls += self.registry.insert_batch_if_absent(&candidates)?;
            report.candidates += candidates.len() as u64;
            report.batches += 1;

            if batch_end == u64::MAX {
                break;
            }
            batch_start = batch_end + 1;
            self.politeness.pause();
        }

        info!(
            "ID sweep finished: {} candidate(s) in {} batch(es), {} new URL(s){}",
            report.candidates,
            report.batches,
            report.new_urls,
            if report.cancelled { ", cancelled" } else { "" }
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::IdSweep;
    use crate::config::{IdSweepConfig, SearchConfig};
    use crate::discovery::site::TkaraokeSite;
    use crate::registry::SongRegistry;
    use crate::shutdown::ShutdownFlag;

    fn site() -> TkaraokeSite {
        TkaraokeSite::new(&SearchConfig {
            base_url: "https://t.test".to_string(),
            ..SearchConfig::default()
        })
        .expect("site should build")
    }

    fn sweep_config(start_id: u64, end_id: u64, batch_size: u64) -> IdSweepConfig {
        IdSweepConfig {
            start_id,
            end_id,
            batch_size,
            ..IdSweepConfig::default()
        }
    }

    #[test]
    fn test_sweep_inserts_range_in_batches_without_overwriting_search_rows() {
        let site = site();
        let registry = SongRegistry::new_in_memory().expect("registry should open");
        registry
            .insert_if_absent("https://t.test/3/x.html", "search:ab")
            .expect("insert should succeed");

        let report = IdSweep::new(&site, &registry, &sweep_config(1, 5, 2))
            .run()
            .expect("sweep should succeed");

        assert_eq!(report.batches, 3);
        assert_eq!(report.candidates, 5);
        assert_eq!(report.new_urls, 4);

        let existing = registry
            .row("https://t.test/3/x.html")
            .expect("lookup should succeed")
            .expect("row should exist");
        assert_eq!(existing.discovered_by.as_deref(), Some("search:ab"));

        let swept = registry
            .row("https://t.test/5/x.html")
            .expect("lookup should succeed")
            .expect("row should exist");
        assert_eq!(swept.discovered_by.as_deref(), Some("id:5"));
        assert_eq!(swept.id_num, Some(5));
    }

    #[test]
    fn test_cancelled_sweep_inserts_nothing() {
        let site = site();
        let registry = SongRegistry::new_in_memory().expect("registry should open");
        let shutdown = ShutdownFlag::new();
        shutdown.request();

        let report = IdSweep::new(&site, &registry, &sweep_config(1, 100, 10))
            .with_shutdown(shutdown)
            .run()
            .expect("sweep should succeed");

        assert!(report.cancelled);
        assert_eq!(registry.count_unprocessed().expect("count should succeed"), 0);
    }
}
