use crate::config::UserAgent;
use crate::error::Result;
use crate::store::Store;
use crate::types::{parse_candidate, Endpoint, Protocol, ProxyUrl};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Capability set of a scraper plug-in: a name, the protocol its
/// candidates speak by default, and a fetch producing raw endpoint
/// strings. Registration is an explicit list handed to the driver.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &str;
    fn protocol(&self) -> Protocol;
    async fn fetch(&self) -> Result<Vec<String>>;
}

/// Last-run statistics of one source.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeStats {
    pub found: usize,
    pub added: usize,
    pub last_run: DateTime<Utc>,
}

/// Walks the registered scrapers, deduplicates candidates within the run,
/// and ingests the valid ones. One plug-in's failure never aborts the
/// others, and the driver itself never tests proxies.
pub struct ScraperDriver {
    scrapers: Vec<Arc<dyn Scraper>>,
    store: Arc<Store>,
    stats: Mutex<HashMap<String, ScrapeStats>>,
    /// Raw fetches are dumped here for debugging when configured.
    dump_dir: Option<PathBuf>,
}

impl ScraperDriver {
    pub fn new(scrapers: Vec<Arc<dyn Scraper>>, store: Arc<Store>) -> Self {
        ScraperDriver {
            scrapers,
            store,
            stats: Mutex::new(HashMap::new()),
            dump_dir: None,
        }
    }

    pub fn with_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_dir = dir;
        self
    }

    pub async fn stats(&self) -> HashMap<String, ScrapeStats> {
        self.stats.lock().await.clone()
    }

    pub async fn run_once(&self) {
        let mut seen: HashSet<Endpoint> = HashSet::new();
        for scraper in &self.scrapers {
            let name = scraper.name().to_string();
            let candidates = match scraper.fetch().await {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(source = %name, error = %e, "scraper fetch failed");
                    continue;
                }
            };
            self.dump_raw(&name, &candidates).await;

            let found = candidates.len();
            let mut added = 0usize;
            let mut dropped = 0usize;
            for raw in &candidates {
                let endpoint = match parse_candidate(raw, scraper.protocol()) {
                    Ok(endpoint) => endpoint,
                    Err(_) => {
                        dropped += 1;
                        continue;
                    }
                };
                if !seen.insert(endpoint) {
                    continue;
                }
                match self.store.upsert_endpoint(endpoint).await {
                    Ok((_, true)) => added += 1,
                    Ok((_, false)) => {}
                    Err(e) => {
                        warn!(source = %name, endpoint = %endpoint, error = %e,
                              "ingest failed");
                    }
                }
            }
            info!(source = %name, found, added, dropped, "scrape run finished");
            self.stats.lock().await.insert(
                name,
                ScrapeStats {
                    found,
                    added,
                    last_run: Utc::now(),
                },
            );
        }
    }

    async fn dump_raw(&self, source: &str, candidates: &[String]) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("scrape_{source}.txt"));
        if let Err(e) = tokio::fs::write(&path, candidates.join("\n")).await {
            debug!(path = %path.display(), error = %e, "raw scrape dump failed");
        }
    }
}

/// Reference scraper: fetches a newline-separated endpoint list over HTTP,
/// optionally through a front proxy, retrying with exponential backoff.
pub struct HttpListScraper {
    name: String,
    url: String,
    protocol: Protocol,
    retries: u32,
    backoff_factor: f64,
    client: reqwest::Client,
}

impl HttpListScraper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        url: String,
        protocol: Protocol,
        timeout: Duration,
        retries: u32,
        backoff_factor: f64,
        front_proxy: Option<&ProxyUrl>,
        user_agent: UserAgent,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(user_agent.pick());
        if let Some(front) = front_proxy {
            let mut proxy = reqwest::Proxy::all(front.endpoint().url())?;
            if let (Some(user), Some(pass)) = (&front.username, &front.password) {
                proxy = proxy.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy);
        }
        Ok(HttpListScraper {
            name,
            url,
            protocol,
            retries,
            backoff_factor,
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Scraper for HttpListScraper {
    fn name(&self) -> &str {
        &self.name
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let mut last_error = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                let secs = self.backoff_factor * f64::powi(2.0, attempt as i32);
                tokio::time::sleep(Duration::from_secs_f64(secs.min(30.0))).await;
            }
            match self.client.get(&self.url).send().await {
                Ok(response) if response.status().is_success() => {
                    let text = response.text().await?;
                    return Ok(text
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty() && !line.starts_with('#'))
                        .map(str::to_string)
                        .collect());
                }
                Ok(response) => {
                    last_error = Some(crate::error::Error::parse(
                        &self.url,
                        format!("list source returned {}", response.status()),
                    ));
                }
                Err(e) => last_error = Some(e.into()),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            crate::error::Error::parse(&self.url, "list source unreachable")
        }))
    }
}

/// One-shot startup ingest of a local endpoint file, one candidate per
/// line; blank lines and `#` comments are skipped. Returns (found, added).
pub async fn load_proxy_file(
    store: &Store,
    path: &Path,
    default_protocol: Protocol,
) -> Result<(usize, usize)> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut found = 0usize;
    let mut added = 0usize;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        found += 1;
        match parse_candidate(line, default_protocol) {
            Ok(endpoint) => {
                if store.upsert_endpoint(endpoint).await?.1 {
                    added += 1;
                }
            }
            Err(e) => warn!(candidate = line, error = %e, "skipping bad candidate"),
        }
    }
    info!(path = %path.display(), found, added, "proxy file loaded");
    Ok((found, added))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;

    struct FixedScraper {
        name: &'static str,
        protocol: Protocol,
        lines: Vec<&'static str>,
    }

    #[async_trait]
    impl Scraper for FixedScraper {
        fn name(&self) -> &str {
            self.name
        }

        fn protocol(&self) -> Protocol {
            self.protocol
        }

        async fn fetch(&self) -> Result<Vec<String>> {
            Ok(self.lines.iter().map(|s| s.to_string()).collect())
        }
    }

    struct BrokenScraper;

    #[async_trait]
    impl Scraper for BrokenScraper {
        fn name(&self) -> &str {
            "broken"
        }

        fn protocol(&self) -> Protocol {
            Protocol::Http
        }

        async fn fetch(&self) -> Result<Vec<String>> {
            Err(Error::parse("broken", "source is down"))
        }
    }

    async fn new_store() -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("pool.db").display());
        let store = Store::connect(&url, 5).await.unwrap();
        store.migrate().await.unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn test_driver_dedupes_and_skips_invalid_candidates() {
        let (store, _dir) = new_store().await;
        let driver = ScraperDriver::new(
            vec![Arc::new(FixedScraper {
                name: "list-a",
                protocol: Protocol::Http,
                lines: vec![
                    "1.2.3.4:8080",
                    "1.2.3.4:8080", // duplicate within the run
                    "socks5://5.6.7.8:1080",
                    "garbage",
                    "300.1.1.1:80",
                ],
            })],
            store.clone(),
        );
        driver.run_once().await;

        assert_eq!(store.stats().await.unwrap().total, 2);
        let stats = driver.stats().await;
        let entry = &stats["list-a"];
        assert_eq!(entry.found, 5);
        assert_eq!(entry.added, 2);
    }

    #[tokio::test]
    async fn test_one_failing_scraper_never_aborts_others() {
        let (store, _dir) = new_store().await;
        let driver = ScraperDriver::new(
            vec![
                Arc::new(BrokenScraper),
                Arc::new(FixedScraper {
                    name: "list-b",
                    protocol: Protocol::Socks4,
                    lines: vec!["1.2.3.4:1080"],
                }),
            ],
            store.clone(),
        );
        driver.run_once().await;

        assert_eq!(store.stats().await.unwrap().total, 1);
        let stats = driver.stats().await;
        assert!(stats.contains_key("list-b"));
        assert!(!stats.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_duplicate_across_runs_is_not_re_added() {
        let (store, _dir) = new_store().await;
        let driver = ScraperDriver::new(
            vec![Arc::new(FixedScraper {
                name: "list-a",
                protocol: Protocol::Http,
                lines: vec!["1.2.3.4:8080"],
            })],
            store.clone(),
        );
        driver.run_once().await;
        driver.run_once().await;

        assert_eq!(store.stats().await.unwrap().total, 1);
        assert_eq!(driver.stats().await["list-a"].added, 0);
    }

    #[tokio::test]
    async fn test_bare_candidates_inherit_scraper_protocol() {
        let (store, _dir) = new_store().await;
        let driver = ScraperDriver::new(
            vec![Arc::new(FixedScraper {
                name: "socks-list",
                protocol: Protocol::Socks5,
                lines: vec!["1.2.3.4:1080"],
            })],
            store.clone(),
        );
        driver.run_once().await;

        let claimed = store
            .claim_batch(Protocol::Socks5, 10, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].endpoint.protocol, Protocol::Socks5);
    }

    #[tokio::test]
    async fn test_load_proxy_file_skips_comments_and_bad_lines() {
        let (store, dir) = new_store().await;
        let path = dir.path().join("proxies.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# free proxies").unwrap();
        writeln!(file, "1.2.3.4:8080").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "socks4://5.6.7.8:1080").unwrap();
        writeln!(file, "not-a-proxy").unwrap();
        drop(file);

        let (found, added) = load_proxy_file(&store, &path, Protocol::Http)
            .await
            .unwrap();
        assert_eq!(found, 3);
        assert_eq!(added, 2);
        assert_eq!(store.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_driver_dumps_raw_fetch_when_configured() {
        let (store, dir) = new_store().await;
        let driver = ScraperDriver::new(
            vec![Arc::new(FixedScraper {
                name: "list-a",
                protocol: Protocol::Http,
                lines: vec!["1.2.3.4:8080"],
            })],
            store,
        )
        .with_dump_dir(Some(dir.path().to_path_buf()));
        driver.run_once().await;

        let dumped = std::fs::read_to_string(dir.path().join("scrape_list-a.txt")).unwrap();
        assert_eq!(dumped, "1.2.3.4:8080");
    }
}
