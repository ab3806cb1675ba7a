use log::{debug, warn};

use crate::enrichment::sources::{SongQuery, YearSource};
use crate::fetch::Politeness;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Filled { year: u16, source: String },
    NotFound,
}

impl Resolution {
    /// Audit note stored next to the row.
    pub fn note(&self) -> String {
        match self {
            Resolution::Filled { source, .. } => format!("filled 'year' using {source}"),
            Resolution::NotFound => "no release year found".to_string(),
        }
    }
}

/// Tries each source in order and keeps the first definite year.
pub struct YearResolver<'a> {
    sources: Vec<Box<dyn YearSource + 'a>>,
    fallback_pause: Politeness,
}

impl<'a> YearResolver<'a> {
    pub fn new(sources: Vec<Box<dyn YearSource + 'a>>) -> Self {
        Self {
            sources,
            fallback_pause: Politeness::none(),
        }
    }

    /// Pause taken before falling through to the next source.
    pub fn with_fallback_pause(mut self, pause: Politeness) -> Self {
        self.fallback_pause = pause;
        self
    }

    pub fn resolve(&self, query: &SongQuery) -> Resolution {
        for (index, source) in self.sources.iter().enumerate() {
            if index > 0 {
                self.fallback_pause.pause();
            }
            match source.lookup_year(query) {
                Ok(Some(year)) => {
                    debug!("[{}] {} -> {year}", source.name(), query.title);
                    return Resolution::Filled {
                        year,
                        source: source.name().to_string(),
                    };
                }
                Ok(None) => debug!("[{}] no year for {}", source.name(), query.title),
                Err(reason) => warn!("[{}] lookup failed for {}: {reason}", source.name(), query.title),
            }
        }
        Resolution::NotFound
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{Resolution, YearResolver};
    use crate::enrichment::sources::{SongQuery, YearSource};

    struct FixedSource {
        name: &'static str,
        answer: Result<Option<u16>, String>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl YearSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        fn lookup_year(&self, _query: &SongQuery) -> Result<Option<u16>, String> {
            self.calls.lock().expect("calls lock").push(self.name);
            self.answer.clone()
        }
    }

    fn source(
        name: &'static str,
        answer: Result<Option<u16>, String>,
        calls: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Box<dyn YearSource> {
        Box::new(FixedSource {
            name,
            answer,
            calls: Arc::clone(calls),
        })
    }

    fn query() -> SongQuery {
        SongQuery {
            title: "Mưa".to_string(),
            artist: None,
        }
    }

    #[test]
    fn test_second_source_answers_after_first_is_tried() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = YearResolver::new(vec![
            source("First", Ok(None), &calls),
            source("Second", Ok(Some(1995)), &calls),
            source("Third", Ok(Some(2001)), &calls),
        ]);

        let resolution = resolver.resolve(&query());
        assert_eq!(
            resolution,
            Resolution::Filled {
                year: 1995,
                source: "Second".to_string()
            }
        );
        assert_eq!(resolution.note(), "filled 'year' using Second");
        assert_eq!(*calls.lock().expect("calls lock"), vec!["First", "Second"]);
    }

    #[test]
    fn test_failing_sources_fall_through_to_not_found() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let resolver = YearResolver::new(vec![
            source("First", Err("HTTP 500".to_string()), &calls),
            source("Second", Ok(None), &calls),
        ]);

        let resolution = resolver.resolve(&query());
        assert_eq!(resolution, Resolution::NotFound);
        assert_eq!(resolution.note(), "no release year found");
        assert_eq!(calls.lock().expect("calls lock").len(), 2);
    }
}
