//! Persistent harvester configuration model and defaults.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::{HarvestError, Result};

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Shared HTTP client and retry policy.
    #[serde(default)]
    pub http: HttpConfig,
    /// Sitemap depth-first link discovery.
    #[serde(default)]
    pub sitemap: SitemapConfig,
    /// Per-song page harvest over the discovered links.
    #[serde(default)]
    pub songs: SongsConfig,
    /// Keyword prefix search discovery.
    #[serde(default)]
    pub search: SearchConfig,
    /// Numeric ID sweep discovery.
    #[serde(default)]
    pub id_sweep: IdSweepConfig,
    /// Registry metadata fetch worker pool.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Registry CSV export.
    #[serde(default)]
    pub export: ExportConfig,
    /// Release-year enrichment.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

/// HTTP client settings shared by every fetch.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SitemapConfig {
    #[serde(default = "default_sitemap_index_url")]
    pub index_url: String,
    /// Append-only log of discovered song URLs.
    #[serde(default = "default_links_file")]
    pub links_file: PathBuf,
    #[serde(default = "default_sitemap_checkpoint_file")]
    pub checkpoint_file: PathBuf,
    #[serde(default = "default_sitemap_delay_ms")]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SongsConfig {
    #[serde(default = "default_links_file")]
    pub links_file: PathBuf,
    #[serde(default = "default_songs_output_csv")]
    pub output_csv: PathBuf,
    /// Holds the last song URL written to `output_csv`.
    #[serde(default = "default_songs_checkpoint_file")]
    pub checkpoint_file: PathBuf,
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    /// Seed keywords and the characters used to extend a prefix.
    #[serde(default = "default_alphabet")]
    pub alphabet: String,
    #[serde(default = "default_expand_threshold")]
    pub expand_threshold: usize,
    #[serde(default = "default_max_prefix_len")]
    pub max_prefix_len: usize,
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
    /// Ceiling on the detected result page count of one keyword.
    #[serde(default = "default_max_result_pages")]
    pub max_result_pages: u32,
    #[serde(default = "default_search_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_search_jitter_ms")]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct IdSweepConfig {
    #[serde(default = "default_start_id")]
    pub start_id: u64,
    #[serde(default = "default_end_id")]
    pub end_id: u64,
    #[serde(default = "default_id_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_id_sweep_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_id_sweep_jitter_ms")]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct MetadataConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Batch size is `concurrency * batch_multiplier`.
    #[serde(default = "default_batch_multiplier")]
    pub batch_multiplier: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_metadata_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_metadata_jitter_ms")]
    pub jitter_ms: u64,
    /// Upper bound on outbound requests across all workers.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_csv")]
    pub output_csv: PathBuf,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_enrichment_input")]
    pub input_csv: PathBuf,
    #[serde(default = "default_enrichment_output")]
    pub output_csv: PathBuf,
    #[serde(default = "default_enrichment_checkpoint")]
    pub checkpoint_csv: PathBuf,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Pause before falling through to the next source.
    #[serde(default = "default_source_delay_ms")]
    pub source_delay_ms: u64,
    /// Pause after every row.
    #[serde(default = "default_row_delay_ms")]
    pub row_delay_ms: u64,
    #[serde(default = "default_musicbrainz_url")]
    pub musicbrainz_url: String,
    /// Tried in order; a 403 from one endpoint falls through to the next.
    #[serde(default = "default_wikipedia_endpoints")]
    pub wikipedia_endpoints: Vec<String>,
    #[serde(default = "default_itunes_url")]
    pub itunes_url: String,
    #[serde(default = "default_itunes_country")]
    pub itunes_country: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

impl Default for SitemapConfig {
    fn default() -> Self {
        Self {
            index_url: default_sitemap_index_url(),
            links_file: default_links_file(),
            checkpoint_file: default_sitemap_checkpoint_file(),
            delay_ms: default_sitemap_delay_ms(),
        }
    }
}

impl Default for SongsConfig {
    fn default() -> Self {
        Self {
            links_file: default_links_file(),
            output_csv: default_songs_output_csv(),
            checkpoint_file: default_songs_checkpoint_file(),
            delay_ms: 0,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_base_url(),
            search_path: default_search_path(),
            page_param: default_page_param(),
            alphabet: default_alphabet(),
            expand_threshold: default_expand_threshold(),
            max_prefix_len: default_max_prefix_len(),
            max_keywords: default_max_keywords(),
            max_result_pages: default_max_result_pages(),
            delay_ms: default_search_delay_ms(),
            jitter_ms: default_search_jitter_ms(),
        }
    }
}

impl Default for IdSweepConfig {
    fn default() -> Self {
        Self {
            start_id: default_start_id(),
            end_id: default_end_id(),
            batch_size: default_id_batch_size(),
            delay_ms: default_id_sweep_delay_ms(),
            jitter_ms: default_id_sweep_jitter_ms(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            concurrency: default_concurrency(),
            batch_multiplier: default_batch_multiplier(),
            max_attempts: default_max_attempts(),
            delay_ms: default_metadata_delay_ms(),
            jitter_ms: default_metadata_jitter_ms(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_csv: default_export_csv(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            input_csv: default_enrichment_input(),
            output_csv: default_enrichment_output(),
            checkpoint_csv: default_enrichment_checkpoint(),
            checkpoint_every: default_checkpoint_every(),
            source_delay_ms: default_source_delay_ms(),
            row_delay_ms: default_row_delay_ms(),
            musicbrainz_url: default_musicbrainz_url(),
            wikipedia_endpoints: default_wikipedia_endpoints(),
            itunes_url: default_itunes_url(),
            itunes_country: default_itunes_country(),
        }
    }
}

fn default_user_agent() -> String {
    "lyric-harvest/0.1.0 (song metadata research crawler)".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_jitter_ms() -> u64 {
    500
}

fn default_sitemap_index_url() -> String {
    "https://nhac.vn/sitemap.xml".to_string()
}

fn default_links_file() -> PathBuf {
    PathBuf::from("all_song_links.txt")
}

fn default_sitemap_checkpoint_file() -> PathBuf {
    PathBuf::from("sitemap_checkpoint.toml")
}

fn default_sitemap_delay_ms() -> u64 {
    1_000
}

fn default_songs_output_csv() -> PathBuf {
    PathBuf::from("songs_nhacvn.csv")
}

fn default_songs_checkpoint_file() -> PathBuf {
    PathBuf::from("songs_checkpoint.txt")
}

fn default_search_base_url() -> String {
    "https://lyric.tkaraoke.com".to_string()
}

fn default_search_path() -> String {
    "/SearchResult.aspx".to_string()
}

fn default_page_param() -> String {
    "p".to_string()
}

fn default_alphabet() -> String {
    "abcdefghijklmnopqrstuvwxyz0123456789".to_string()
}

fn default_expand_threshold() -> usize {
    30
}

fn default_max_prefix_len() -> usize {
    5
}

fn default_max_keywords() -> usize {
    100_000
}

fn default_max_result_pages() -> u32 {
    200
}

fn default_search_delay_ms() -> u64 {
    500
}

fn default_search_jitter_ms() -> u64 {
    400
}

fn default_start_id() -> u64 {
    1
}

fn default_end_id() -> u64 {
    120_000
}

fn default_id_batch_size() -> u64 {
    1_000
}

fn default_id_sweep_delay_ms() -> u64 {
    200
}

fn default_id_sweep_jitter_ms() -> u64 {
    500
}

fn default_database() -> PathBuf {
    PathBuf::from("tkaraoke.db")
}

fn default_concurrency() -> usize {
    5
}

fn default_batch_multiplier() -> usize {
    50
}

fn default_metadata_delay_ms() -> u64 {
    500
}

fn default_metadata_jitter_ms() -> u64 {
    600
}

fn default_requests_per_second() -> u32 {
    8
}

fn default_export_csv() -> PathBuf {
    PathBuf::from("tkaraoke_output.csv")
}

fn default_enrichment_input() -> PathBuf {
    PathBuf::from("songs.csv")
}

fn default_enrichment_output() -> PathBuf {
    PathBuf::from("songs_with_years.csv")
}

fn default_enrichment_checkpoint() -> PathBuf {
    PathBuf::from("checkpoint_years.csv")
}

fn default_checkpoint_every() -> usize {
    10
}

fn default_source_delay_ms() -> u64 {
    400
}

fn default_row_delay_ms() -> u64 {
    1_000
}

fn default_musicbrainz_url() -> String {
    "https://musicbrainz.org/ws/2/recording/".to_string()
}

fn default_wikipedia_endpoints() -> Vec<String> {
    vec![
        "https://vi.wikipedia.org/w/api.php".to_string(),
        "https://en.wikipedia.org/w/api.php".to_string(),
    ]
}

fn default_itunes_url() -> String {
    "https://itunes.apple.com/search".to_string()
}

fn default_itunes_country() -> String {
    "us".to_string()
}

/// Default location of the config file: `<config_dir>/lyric-harvest/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lyric-harvest").join("config.toml"))
}

/// Loads `path`, writing a default config there first when it does not exist.
pub fn load_or_create(path: &Path) -> Result<Config> {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| HarvestError::io(parent, err))?;
        }
        let rendered = toml::to_string(&Config::default())
            .map_err(|err| HarvestError::Config(err.to_string()))?;
        std::fs::write(path, rendered).map_err(|err| HarvestError::io(path, err))?;
    }

    let content = std::fs::read_to_string(path).map_err(|err| HarvestError::io(path, err))?;
    let parsed = toml::from_str::<Config>(&content)
        .map_err(|err| HarvestError::Config(format!("{}: {err}", path.display())))?;
    check_id_range(&parsed.id_sweep)
        .map_err(|reason| HarvestError::Config(format!("{}: {reason}", path.display())))?;
    Ok(sanitize_config(parsed))
}

/// Rejects a sweep range whose end precedes its start.
fn check_id_range(sweep: &IdSweepConfig) -> std::result::Result<(), String> {
    if sweep.end_id < sweep.start_id {
        return Err(format!(
            "id_sweep.end_id ({}) is below id_sweep.start_id ({})",
            sweep.end_id, sweep.start_id
        ));
    }
    Ok(())
}

/// Clamps values that would stall or disable a phase.
pub fn sanitize_config(config: Config) -> Config {
    let mut alphabet: Vec<char> = Vec::new();
    for ch in config.search.alphabet.chars() {
        if !ch.is_whitespace() && !alphabet.contains(&ch) {
            alphabet.push(ch);
        }
    }
    let alphabet = if alphabet.is_empty() {
        default_alphabet()
    } else {
        alphabet.into_iter().collect()
    };
    let start_id = config.id_sweep.start_id.max(1);

    Config {
        http: HttpConfig {
            timeout_secs: config.http.timeout_secs.clamp(1, 300),
            max_attempts: config.http.max_attempts.clamp(1, 10),
            ..config.http
        },
        search: SearchConfig {
            alphabet,
            max_prefix_len: config.search.max_prefix_len.clamp(1, 8),
            expand_threshold: config.search.expand_threshold.max(1),
            max_result_pages: config.search.max_result_pages.max(1),
            ..config.search
        },
        id_sweep: IdSweepConfig {
            start_id,
            end_id: config.id_sweep.end_id.max(start_id),
            batch_size: config.id_sweep.batch_size.max(1),
            ..config.id_sweep
        },
        metadata: MetadataConfig {
            concurrency: config.metadata.concurrency.clamp(1, 64),
            batch_multiplier: config.metadata.batch_multiplier.max(1),
            max_attempts: config.metadata.max_attempts.clamp(1, 10),
            requests_per_second: config.metadata.requests_per_second.max(1),
            ..config.metadata
        },
        enrichment: EnrichmentConfig {
            checkpoint_every: config.enrichment.checkpoint_every.max(1),
            ..config.enrichment
        },
        ..config
    }
}
