//! HTTP fetch layer with bounded retries, exponential backoff and jitter.
//!
//! Every crawler and enrichment source reaches the network through
//! [`PageFetcher`], so the traversal logic can be exercised against scripted
//! responses in tests.

use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::config::HttpConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Raw response of one logical retrieval. Non-200 statuses are still content:
/// the caller decides whether a body means "not found" or "try elsewhere".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

impl FetchedPage {
    #[cfg(test)]
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    #[cfg(test)]
    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == 403
    }
}

/// Blocking page retrieval. `None` means every attempt failed at the transport level.
pub trait PageFetcher: Send + Sync {
    fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Option<FetchedPage>;
}

/// Returns a uniformly random duration in `[0, max]`.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(0..=max_ms))
}

/// Deliberate pause between outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Politeness {
    base: Duration,
    jitter: Duration,
}

impl Politeness {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub fn from_millis(base_ms: u64, jitter_ms: u64) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(jitter_ms),
        )
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn pause(&self) {
        let delay = self.base + random_jitter(self.jitter);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Doubling delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let multiplier = 1u32 << exponent;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(config: &HttpConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }
}

/// `ureq`-backed fetcher used by every live command.
pub struct HttpFetcher {
    http_client: ureq::Agent,
    policy: RetryPolicy,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http_client = ureq::AgentBuilder::new()
            .user_agent(&config.user_agent)
            .timeout_connect(Duration::from_secs(5).min(timeout))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            http_client,
            policy: RetryPolicy::from(config),
            timeout,
        }
    }

    fn fetch_once(&self, url: &str, params: &[(&str, &str)]) -> Result<FetchedPage, String> {
        let mut request = self.http_client.get(url).timeout(self.timeout);
        for (key, value) in params {
            request = request.query(key, value);
        }

        match request.call() {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .into_string()
                    .map_err(|error| format!("Failed to read response: {error}"))?;
                Ok(FetchedPage { status, body })
            }
            Err(ureq::Error::Status(status, response)) => Ok(FetchedPage {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(transport)) => {
                Err(format!("Request failed: {transport}"))
            }
        }
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Option<FetchedPage> {
        let mut attempt = 1u32;
        loop {
            match self.fetch_once(url, params) {
                Ok(page) => return Some(page),
                Err(reason) if attempt < self.policy.max_attempts => {
                    let backoff =
                        self.policy.backoff_delay(attempt) + random_jitter(self.policy.jitter);
                    debug!(
                        "Fetch {}: attempt {} failed ({}), retrying in {:?}",
                        url, attempt, reason, backoff
                    );
                    thread::sleep(backoff);
                    attempt = attempt.saturating_add(1);
                }
                Err(reason) => {
                    warn!(
                        "Fetch {}: giving up after {} attempts: {}",
                        url, attempt, reason
                    );
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{FetchedPage, PageFetcher};

    /// Canonical key for a request: the URL followed by its params in call order.
    pub fn request_key(url: &str, params: &[(&str, &str)]) -> String {
        if params.is_empty() {
            return url.to_string();
        }
        let query: Vec<String> = params
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        format!("{url}?{}", query.join("&"))
    }

    /// Serves canned pages and records every request in order.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        pages: HashMap<String, FetchedPage>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn page(mut self, key: &str, body: &str) -> Self {
            self.pages.insert(key.to_string(), FetchedPage::ok(body));
            self
        }

        pub fn status(mut self, key: &str, status: u16, body: &str) -> Self {
            self.pages
                .insert(key.to_string(), FetchedPage::with_status(status, body));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock poisoned").clone()
        }

        pub fn call_count(&self, key: &str) -> usize {
            self.calls().iter().filter(|call| *call == key).count()
        }
    }

    impl PageFetcher for ScriptedFetcher {
        fn fetch(&self, url: &str, params: &[(&str, &str)]) -> Option<FetchedPage> {
            let key = request_key(url, params);
            self.calls
                .lock()
                .expect("calls lock poisoned")
                .push(key.clone());
            self.pages.get(&key).cloned()
        }
    }
}
