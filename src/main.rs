mod checkpoint;
mod config;
mod discovery;
mod enrichment;
mod error;
mod export;
mod fetch;
mod metadata_worker;
mod registry;
mod shutdown;
mod sitemap;
mod songs;

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use checkpoint::{CheckpointTracker, FileCheckpointStore};
use config::Config;
use discovery::{IdSweep, SearchCrawler, SearchLimits, TkaraokeSite};
use enrichment::{ItunesSource, MusicBrainzSource, WikipediaSource, YearFiller, YearResolver, YearSource};
use error::HarvestError;
use fetch::{HttpFetcher, PageFetcher, Politeness};
use metadata_worker::MetadataWorker;
use registry::SongRegistry;
use shutdown::ShutdownFlag;
use sitemap::{load_seen_urls, NhacvnLayout, OutputLog, SitemapCrawler};
use songs::{SongCsv, SongHarvester};

#[derive(Debug, Parser)]
#[command(name = "lyric-harvest", version, about = "Resumable song lyric and metadata harvester")]
struct Cli {
    /// Config file; defaults to the per-user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk the sitemap tree and append song links to the links file.
    SitemapLinks,
    /// Fetch every collected song link and append its details to a CSV.
    SongDetails,
    /// Discover song URLs through keyword prefix search.
    Search,
    /// Discover song URLs by sweeping numeric IDs.
    IdSweep,
    /// Fetch metadata for every unprocessed registry URL.
    FetchMetadata,
    /// Search, ID sweep, metadata fetch and export in one run.
    Harvest,
    /// Write the registry to CSV.
    Export {
        /// Overrides the configured output path.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fill missing release years in a song table.
    FillYears,
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let mut clog = colog::default_builder();
    clog.filter(None, level);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!(
            "panic in thread '{}': {} ({})",
            thread_name,
            panic_payload_to_string(panic_info.payload()),
            panic_info
                .location()
                .map(|location| location.to_string())
                .unwrap_or_default()
        );
    }));
}

fn run_sitemap_links(
    config: &Config,
    fetcher: &HttpFetcher,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    let layout = NhacvnLayout::new();
    let mut tracker =
        CheckpointTracker::open(FileCheckpointStore::new(&config.sitemap.checkpoint_file))?;
    let mut seen = load_seen_urls(&config.sitemap.links_file)?;
    info!("{} song link(s) already logged", seen.len());
    let mut log = OutputLog::open_append(&config.sitemap.links_file)?;

    let report = SitemapCrawler::new(fetcher, &layout, &mut tracker, &mut seen, &mut log)
        .with_politeness(Politeness::from_millis(config.sitemap.delay_ms, 0))
        .with_shutdown(shutdown.clone())
        .crawl(&config.sitemap.index_url)?;
    info!(
        "Sitemap crawl: {} unit(s) completed, {} group(s) scanned, {} new link(s), {} failed branch(es)",
        report.completed_units, report.groups_scanned, report.new_items, report.failed_branches
    );
    Ok(())
}

fn run_song_details(
    config: &Config,
    fetcher: &HttpFetcher,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    let mut output = SongCsv::open_append(&config.songs.output_csv)?;
    SongHarvester::new(fetcher, &config.songs)
        .with_shutdown(shutdown.clone())
        .run(&mut output)?;
    Ok(())
}

fn run_search(
    config: &Config,
    fetcher: &dyn PageFetcher,
    site: &TkaraokeSite,
    registry: &SongRegistry,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    let report = SearchCrawler::new(fetcher, site, registry, SearchLimits::from(&config.search))
        .with_politeness(Politeness::from_millis(
            config.search.delay_ms,
            config.search.jitter_ms,
        ))
        .with_shutdown(shutdown.clone())
        .run()?;
    if !report.abandoned.is_empty() {
        warn!("Abandoned keyword(s): {}", report.abandoned.join(", "));
    }
    Ok(())
}

fn run_id_sweep(
    config: &Config,
    site: &TkaraokeSite,
    registry: &SongRegistry,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    IdSweep::new(site, registry, &config.id_sweep)
        .with_politeness(Politeness::from_millis(
            config.id_sweep.delay_ms,
            config.id_sweep.jitter_ms,
        ))
        .with_shutdown(shutdown.clone())
        .run()?;
    Ok(())
}

fn run_fetch_metadata(
    config: &Config,
    fetcher: &dyn PageFetcher,
    site: &TkaraokeSite,
    registry: &Mutex<SongRegistry>,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    let report = MetadataWorker::new(fetcher, site, registry, &config.metadata)
        .with_shutdown(shutdown.clone())
        .run_batches()?;
    if report.stalled {
        warn!(
            "Metadata fetch made no progress; {} URL(s) left for the next run",
            report.remaining
        );
    }
    Ok(())
}

/// Exports whatever the registry holds once the phases end, including when
/// shutdown cut them short. A phase error skips the export.
fn run_harvest(
    config: &Config,
    fetcher: &dyn PageFetcher,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    let site = TkaraokeSite::new(&config.search)?;
    let registry = Mutex::new(SongRegistry::open(&config.metadata.database)?);

    let phases = run_harvest_phases(config, fetcher, &site, &registry, shutdown);
    let registry = registry.into_inner().unwrap_or_else(PoisonError::into_inner);
    phases?;
    if shutdown.is_requested() {
        info!("Harvest stopped early, exporting the registry as it stands");
    }
    export::export_registry(&registry, &config.export.output_csv)?;
    Ok(())
}

fn run_harvest_phases(
    config: &Config,
    fetcher: &dyn PageFetcher,
    site: &TkaraokeSite,
    registry: &Mutex<SongRegistry>,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    {
        let registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        run_search(config, fetcher, site, &registry, shutdown)?;
        if shutdown.is_requested() {
            return Ok(());
        }
        run_id_sweep(config, site, &registry, shutdown)?;
        if shutdown.is_requested() {
            return Ok(());
        }
    }
    run_fetch_metadata(config, fetcher, site, registry, shutdown)
}

fn run_fill_years(
    config: &Config,
    fetcher: &HttpFetcher,
    shutdown: &ShutdownFlag,
) -> Result<(), HarvestError> {
    let enrichment = &config.enrichment;
    let sources: Vec<Box<dyn YearSource + '_>> = vec![
        Box::new(MusicBrainzSource::new(fetcher, enrichment.musicbrainz_url.as_str())),
        Box::new(WikipediaSource::new(
            fetcher,
            enrichment.wikipedia_endpoints.clone(),
        )),
        Box::new(ItunesSource::new(
            fetcher,
            enrichment.itunes_url.as_str(),
            enrichment.itunes_country.as_str(),
        )),
    ];
    let resolver = YearResolver::new(sources)
        .with_fallback_pause(Politeness::from_millis(enrichment.source_delay_ms, 0));
    YearFiller::new(&resolver, enrichment)
        .with_shutdown(shutdown.clone())
        .run()?;
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()
            .ok_or_else(|| HarvestError::Config("no per-user config directory".to_string()))?,
    };
    let config = config::load_or_create(&config_path)?;
    info!("Using config {}", config_path.display());

    let shutdown = ShutdownFlag::new();
    shutdown::install_signal_handler(shutdown.clone());
    let fetcher = HttpFetcher::new(&config.http);

    match cli.command {
        Command::SitemapLinks => run_sitemap_links(&config, &fetcher, &shutdown)?,
        Command::SongDetails => run_song_details(&config, &fetcher, &shutdown)?,
        Command::Search => {
            let site = TkaraokeSite::new(&config.search)?;
            let registry = SongRegistry::open(&config.metadata.database)?;
            run_search(&config, &fetcher, &site, &registry, &shutdown)?;
        }
        Command::IdSweep => {
            let site = TkaraokeSite::new(&config.search)?;
            let registry = SongRegistry::open(&config.metadata.database)?;
            run_id_sweep(&config, &site, &registry, &shutdown)?;
        }
        Command::FetchMetadata => {
            let site = TkaraokeSite::new(&config.search)?;
            let registry = Mutex::new(SongRegistry::open(&config.metadata.database)?);
            run_fetch_metadata(&config, &fetcher, &site, &registry, &shutdown)?;
        }
        Command::Harvest => run_harvest(&config, &fetcher, &shutdown)?,
        Command::Export { output } => {
            let registry = SongRegistry::open(&config.metadata.database)?;
            let output = output.unwrap_or_else(|| config.export.output_csv.clone());
            export::export_registry(&registry, &output)?;
        }
        Command::FillYears => run_fill_years(&config, &fetcher, &shutdown)?,
    }

    if shutdown.is_requested() {
        info!("Stopped on request; progress is saved for the next run");
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    run(cli).map_err(|err| {
        error!("{err}");
        err
    })
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{panic_payload_to_string, run_harvest, Cli, Command};
    use crate::config::{Config, ExportConfig, MetadataConfig, SearchConfig};
    use crate::discovery::fixtures::results_page;
    use crate::fetch::test_support::ScriptedFetcher;
    use crate::fetch::{FetchedPage, PageFetcher};
    use crate::shutdown::ShutdownFlag;

    /// Requests shutdown as soon as the first response comes back.
    struct StopAfterFetch {
        inner: ScriptedFetcher,
        shutdown: ShutdownFlag,
    }

    impl PageFetcher for StopAfterFetch {
        fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Option<FetchedPage> {
            let page = self.inner.fetch(url, params);
            self.shutdown.request();
            page
        }
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["lyric-harvest", "export", "--output", "out.csv", "-v"])
            .expect("arguments should parse");
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::Export { output: Some(ref path) } if path.to_str() == Some("out.csv")
        ));
    }

    #[test]
    fn test_cli_accepts_every_phase() {
        for name in [
            "sitemap-links",
            "song-details",
            "search",
            "id-sweep",
            "fetch-metadata",
            "harvest",
            "fill-years",
        ] {
            let cli = Cli::try_parse_from(["lyric-harvest", "--config", "c.toml", name])
                .expect("subcommand should parse");
            assert_eq!(cli.config.as_deref().and_then(|p| p.to_str()), Some("c.toml"));
        }
        assert!(Cli::try_parse_from(["lyric-harvest", "crawl-everything"]).is_err());
    }

    #[test]
    fn test_panic_payload_to_string_handles_common_payloads() {
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("boom");
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_payload_to_string(borrowed.as_ref()), "boom");
        assert_eq!(panic_payload_to_string(owned.as_ref()), "bang");
        assert_eq!(panic_payload_to_string(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_harvest_stopped_mid_search_still_exports() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let output_csv = dir.path().join("out.csv");
        let config = Config {
            search: SearchConfig {
                base_url: "https://t.test".to_string(),
                alphabet: "ab".to_string(),
                delay_ms: 0,
                jitter_ms: 0,
                ..SearchConfig::default()
            },
            metadata: MetadataConfig {
                database: dir.path().join("registry.db"),
                ..MetadataConfig::default()
            },
            export: ExportConfig {
                output_csv: output_csv.clone(),
            },
            ..Config::default()
        };
        let shutdown = ShutdownFlag::new();
        let fetcher = StopAfterFetch {
            inner: ScriptedFetcher::new().page(
                "https://t.test/SearchResult.aspx?kw=a",
                &results_page(&["/1/one.html"], &[]),
            ),
            shutdown: shutdown.clone(),
        };

        run_harvest(&config, &fetcher, &shutdown).expect("harvest should stop cleanly");

        assert!(shutdown.is_requested());
        assert_eq!(fetcher.inner.calls().len(), 1);
        let exported = std::fs::read_to_string(&output_csv).expect("export should be written");
        assert!(exported.contains("https://t.test/1/one.html"));
    }
}
