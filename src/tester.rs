use crate::config::UserAgent;
use crate::error::Result;
use crate::judge::JudgeReport;
use crate::types::{Anonymity, Endpoint, Outcome, Verdict};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Retry delays are capped regardless of the configured backoff factor.
const MAX_RETRY_DELAY_SECS: f64 = 30.0;

/// Resolves an IPv4 address to an ISO-3166-1 alpha-2 country code. The
/// lookup itself is an external collaborator; `NoGeo` disables the country
/// gate entirely.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn resolve(&self, ip: Ipv4Addr) -> Option<String>;
}

pub struct NoGeo;

#[async_trait]
impl GeoResolver for NoGeo {
    async fn resolve(&self, _ip: Ipv4Addr) -> Option<String> {
        None
    }
}

/// Fixed-map resolver for offline data sets and tests.
pub struct StaticGeo(HashMap<Ipv4Addr, String>);

impl StaticGeo {
    pub fn new(entries: impl IntoIterator<Item = (Ipv4Addr, String)>) -> Self {
        StaticGeo(entries.into_iter().collect())
    }
}

#[async_trait]
impl GeoResolver for StaticGeo {
    async fn resolve(&self, ip: Ipv4Addr) -> Option<String> {
        self.0.get(&ip).cloned()
    }
}

/// The battery as seen by the manager: one endpoint in, one verdict out.
/// Workers never touch the store through this seam.
#[async_trait]
pub trait Harness: Send + Sync {
    async fn run(&self, endpoint: &Endpoint) -> Verdict;
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub judge_url: String,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_factor: f64,
    pub test_anonymity: bool,
    /// Keep probing past a failed step and record the worst outcome.
    pub force: bool,
    pub ignore_countries: Vec<String>,
    pub user_agent: UserAgent,
}

/// Runs the ordered probe battery for one endpoint: country gate,
/// reachability through the proxy, optional anonymity check, latency.
pub struct Tester {
    cfg: ProbeConfig,
    own_ip: Option<Ipv4Addr>,
    geo: std::sync::Arc<dyn GeoResolver>,
    shutdown: watch::Receiver<bool>,
}

impl Tester {
    pub fn new(
        cfg: ProbeConfig,
        own_ip: Option<Ipv4Addr>,
        geo: std::sync::Arc<dyn GeoResolver>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Tester {
            cfg,
            own_ip,
            geo,
            shutdown,
        }
    }

    fn build_client(&self, endpoint: &Endpoint) -> Result<reqwest::Client> {
        let proxy = reqwest::Proxy::all(endpoint.url())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.cfg.timeout)
            .connect_timeout(self.cfg.timeout)
            .user_agent(self.cfg.user_agent.pick())
            .build()?;
        Ok(client)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let secs = self.cfg.backoff_factor * f64::powi(2.0, attempt as i32);
        Duration::from_secs_f64(secs.min(MAX_RETRY_DELAY_SECS))
    }

    async fn battery(&self, endpoint: &Endpoint) -> Verdict {
        let started_at = Utc::now();
        let mut rx = self.shutdown.clone();
        if *rx.borrow() {
            return Verdict::cancelled(started_at);
        }

        let mut worst = Outcome::Ok;
        let mut notes: Vec<String> = Vec::new();
        let mut anonymous = Anonymity::Unknown;

        // Step 1: country gate.
        let country = self.geo.resolve(endpoint.ip).await;
        if let Some(code) = &country {
            if self.cfg.ignore_countries.iter().any(|c| c == code) {
                worst = worst.worst(Outcome::ForbiddenCountry);
                notes.push(format!("country {code} is ignored"));
                if !self.cfg.force {
                    return self.finish(started_at, worst, None, country, anonymous, notes);
                }
            }
        }

        // Step 2: reachability through the proxy, with retries.
        let client = match self.build_client(endpoint) {
            Ok(client) => client,
            Err(e) => {
                notes.push(format!("client setup failed: {e}"));
                return self.finish(
                    started_at,
                    Outcome::InternalError,
                    None,
                    country,
                    anonymous,
                    notes,
                );
            }
        };
        let mut latencies: Vec<i64> = Vec::new();
        let mut body: Option<String> = None;
        let mut reach_failure: Option<(Outcome, String)> = None;

        for attempt in 0..=self.cfg.retries {
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay(attempt)) => {}
                    _ = rx.wait_for(|stop| *stop) => return Verdict::cancelled(started_at),
                }
            }
            let probe_start = Instant::now();
            let response = tokio::select! {
                r = client.get(&self.cfg.judge_url).send() => r,
                _ = rx.wait_for(|stop| *stop) => return Verdict::cancelled(started_at),
            };
            match response {
                Ok(resp) if resp.status().is_success() => {
                    let text = tokio::select! {
                        t = resp.text() => t,
                        _ = rx.wait_for(|stop| *stop) => return Verdict::cancelled(started_at),
                    };
                    match text {
                        Ok(text) => {
                            latencies.push(probe_start.elapsed().as_millis() as i64);
                            body = Some(text);
                            reach_failure = None;
                            break;
                        }
                        Err(e) => reach_failure = Some(classify(&e)),
                    }
                }
                Ok(resp) => {
                    reach_failure =
                        Some((Outcome::BadResponse, format!("status {}", resp.status())));
                }
                Err(e) => reach_failure = Some(classify(&e)),
            }
            debug!(endpoint = %endpoint, attempt, "probe attempt failed");
        }

        if let Some((outcome, note)) = reach_failure {
            worst = worst.worst(outcome);
            notes.push(note);
        }

        // Step 3: anonymity, judged from the echoed environment. Needs a
        // successful reachability body and our own resolved address.
        if self.cfg.test_anonymity && body.is_some() {
            if let (Some(own), Some(text)) = (self.own_ip, &body) {
                let report = JudgeReport::parse(text);
                match report.remote_ip() {
                    None => {
                        worst = worst.worst(Outcome::BadResponse);
                        notes.push("judge response missing REMOTE_ADDR".to_string());
                    }
                    Some(remote) => {
                        if remote == own || report.reveals(own) {
                            anonymous = Anonymity::Transparent;
                            worst = worst.worst(Outcome::NonAnonymous);
                            notes.push("proxy reveals client address".to_string());
                        } else {
                            anonymous = Anonymity::Anonymous;
                        }
                    }
                }
            }
        }

        // Step 4: latency, the median over successful attempts.
        let latency = median(&mut latencies);
        self.finish(started_at, worst, latency, country, anonymous, notes)
    }

    fn finish(
        &self,
        started_at: chrono::DateTime<Utc>,
        outcome: Outcome,
        latency_ms: Option<i64>,
        country: Option<String>,
        anonymous: Anonymity,
        notes: Vec<String>,
    ) -> Verdict {
        let info = if notes.is_empty() {
            "ok".to_string()
        } else {
            notes.join("; ")
        };
        Verdict {
            outcome,
            latency_ms,
            country,
            anonymous,
            info,
            started_at,
            finished_at: Utc::now(),
            cancelled: false,
        }
    }
}

#[async_trait]
impl Harness for Tester {
    async fn run(&self, endpoint: &Endpoint) -> Verdict {
        self.battery(endpoint).await
    }
}

fn classify(e: &reqwest::Error) -> (Outcome, String) {
    if e.is_timeout() {
        (Outcome::Timeout, format!("timed out: {e}"))
    } else if e.is_connect() {
        (Outcome::ConnRefused, format!("connect failed: {e}"))
    } else {
        (Outcome::BadResponse, format!("request failed: {e}"))
    }
}

fn median(samples: &mut Vec<i64>) -> Option<i64> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 1 {
        Some(samples[mid])
    } else {
        Some((samples[mid - 1] + samples[mid]) / 2)
    }
}
