//! Discovery for sites without sitemaps: keyword prefix search and ID sweep.

mod id_sweep;
mod search_crawler;
mod site;

pub use id_sweep::IdSweep;
pub use search_crawler::{SearchCrawler, SearchLimits};
pub use site::{SearchSite, TkaraokeSite};

#[cfg(test)]
pub(crate) use site::fixtures;
