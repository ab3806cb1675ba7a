//! Release-year enrichment of an exported song table.

mod resolver;
mod sources;
mod table;

use std::path::PathBuf;

use log::{info, warn};

pub use resolver::{Resolution, YearResolver};
pub use sources::{ItunesSource, MusicBrainzSource, WikipediaSource, YearSource};
use table::EnrichmentTable;

use crate::config::EnrichmentConfig;
use crate::error::{HarvestError, Result};
use crate::fetch::Politeness;
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FillReport {
    pub resumed: bool,
    pub pending: usize,
    pub processed: usize,
    pub filled: usize,
    pub not_found: usize,
    pub cancelled: bool,
}

/// Walks the unfilled rows of a table, snapshotting progress to a
/// checkpoint table so an interrupted run picks up where it stopped.
pub struct YearFiller<'a> {
    resolver: &'a YearResolver<'a>,
    input: PathBuf,
    output: PathBuf,
    checkpoint: PathBuf,
    checkpoint_every: usize,
    row_pause: Politeness,
    shutdown: ShutdownFlag,
}

impl<'a> YearFiller<'a> {
    pub fn new(resolver: &'a YearResolver<'a>, config: &EnrichmentConfig) -> Self {
        Self {
            resolver,
            input: config.input_csv.clone(),
            output: config.output_csv.clone(),
            checkpoint: config.checkpoint_csv.clone(),
            checkpoint_every: config.checkpoint_every.max(1),
            row_pause: Politeness::from_millis(config.row_delay_ms, 0),
            shutdown: ShutdownFlag::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn run(&self) -> Result<FillReport> {
        let mut report = FillReport {
            resumed: self.checkpoint.exists(),
            ..FillReport::default()
        };
        let source = if report.resumed {
            info!("Resuming from checkpoint {}", self.checkpoint.display());
            &self.checkpoint
        } else {
            &self.input
        };
        let mut table = EnrichmentTable::load(source)?;
        let pending = table.pending_rows();
        report.pending = pending.len();
        info!(
            "{} of {} row(s) need a release year",
            pending.len(),
            table.row_count()
        );

        for index in pending {
            if self.shutdown.is_requested() {
                warn!("Stopping year fill, snapshot saved to {}", self.checkpoint.display());
                table.write(&self.checkpoint)?;
                report.cancelled = true;
                return Ok(report);
            }

            let resolution = match table.query(index) {
                Some(query) => self.resolver.resolve(&query),
                None => Resolution::NotFound,
            };
            match resolution {
                Resolution::Filled { .. } => report.filled += 1,
                Resolution::NotFound => report.not_found += 1,
            }
            table.apply(index, &resolution);
            report.processed += 1;

            if report.processed % self.checkpoint_every == 0 {
                table.write(&self.checkpoint)?;
                info!(
                    "Checkpoint: {}/{} row(s) processed",
                    report.processed, report.pending
                );
            }
            self.row_pause.pause();
        }

        table.write(&self.output)?;
        if self.checkpoint.exists() {
            std::fs::remove_file(&self.checkpoint)
                .map_err(|err| HarvestError::io(&self.checkpoint, err))?;
        }
        info!(
            "Filled {} year(s), {} not found, written to {}",
            report.filled,
            report.not_found,
            self.output.display()
        );
        Ok(report)
    }
}
