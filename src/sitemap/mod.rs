//! Sitemap-driven link discovery.

mod crawler;
mod layout;
mod listing;
mod output_log;

pub use crawler::SitemapCrawler;
pub use layout::NhacvnLayout;
pub use output_log::{load_seen_urls, OutputLog};
