use crate::error::Result;
use crate::store::Store;
use crate::types::{Protocol, Proxy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Downstream list renderings. All are newline-terminated text files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// `[proto://]host:port`, one per line.
    Normal { with_protocol: bool },
    /// `<proto> <host> <port>`, one per line.
    ProxyChains,
    /// Single comma-separated `host:port` line (KinanCity / RocketMap).
    CommaSeparated,
}

impl OutputFormat {
    pub fn render(self, proxies: &[Proxy]) -> String {
        if proxies.is_empty() {
            return String::new();
        }
        match self {
            OutputFormat::Normal { with_protocol } => {
                let mut out = String::new();
                for proxy in proxies {
                    let endpoint = &proxy.endpoint;
                    if with_protocol {
                        out.push_str(&endpoint.url());
                    } else {
                        out.push_str(&format!("{}:{}", endpoint.ip, endpoint.port));
                    }
                    out.push('\n');
                }
                out
            }
            OutputFormat::ProxyChains => {
                let mut out = String::new();
                for proxy in proxies {
                    let endpoint = &proxy.endpoint;
                    out.push_str(&format!(
                        "{} {} {}\n",
                        endpoint.protocol, endpoint.ip, endpoint.port
                    ));
                }
                out
            }
            OutputFormat::CommaSeparated => {
                let line = proxies
                    .iter()
                    .map(|p| format!("{}:{}", p.endpoint.ip, p.endpoint.port))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{line}\n")
            }
        }
    }
}

/// One file to publish: where, how, and which protocols feed it.
#[derive(Debug, Clone)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub format: OutputFormat,
    pub protocols: Vec<Protocol>,
}

/// Periodically renders the freshest working endpoints to every enabled
/// target. Writes are atomic: temp file beside the target, then rename.
pub struct OutputPublisher {
    store: Arc<Store>,
    targets: Vec<OutputTarget>,
    limit: usize,
    ignore_countries: Vec<String>,
}

impl OutputPublisher {
    pub fn new(
        store: Arc<Store>,
        targets: Vec<OutputTarget>,
        limit: usize,
        ignore_countries: Vec<String>,
    ) -> Self {
        OutputPublisher {
            store,
            targets,
            limit,
            ignore_countries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn run_once(&self) {
        for target in &self.targets {
            match self.collect(&target.protocols).await {
                Ok(proxies) => {
                    let contents = target.format.render(&proxies);
                    match write_atomic(&target.path, &contents).await {
                        Ok(()) => info!(
                            path = %target.path.display(),
                            count = proxies.len(),
                            "published proxy list"
                        ),
                        Err(e) => warn!(
                            path = %target.path.display(),
                            error = %e,
                            "publishing failed"
                        ),
                    }
                }
                Err(e) => warn!(error = %e, "top-working query failed"),
            }
        }
    }

    /// Merge the best rows across the target's protocols, keeping global
    /// latency order and the configured limit.
    async fn collect(&self, protocols: &[Protocol]) -> Result<Vec<Proxy>> {
        let mut merged: Vec<Proxy> = Vec::new();
        for protocol in protocols {
            merged.extend(
                self.store
                    .top_working(*protocol, self.limit, &self.ignore_countries)
                    .await?,
            );
        }
        merged.sort_by_key(|p| p.latency_ms.unwrap_or(i64::MAX));
        merged.truncate(self.limit);
        Ok(merged)
    }
}

/// Write-then-rename in the target's directory so readers never observe a
/// partially written list.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Anonymity, Endpoint, Outcome, ProxyStatus, Verdict};
    use chrono::Utc;

    fn proxy(proto: Protocol, ip: &str, port: u16, latency: i64) -> Proxy {
        Proxy {
            id: 0,
            endpoint: Endpoint::new(proto, ip.parse().unwrap(), port),
            country: None,
            status: ProxyStatus::Ok,
            latency_ms: Some(latency),
            anonymous: Anonymity::Unknown,
            test_count: 1,
            fail_count: 0,
            refused_count: 0,
            last_tested_at: Some(Utc::now()),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_normal_format_with_and_without_protocol() {
        let proxies = vec![
            proxy(Protocol::Http, "1.2.3.4", 8080, 10),
            proxy(Protocol::Http, "5.6.7.8", 3128, 20),
        ];
        assert_eq!(
            OutputFormat::Normal { with_protocol: true }.render(&proxies),
            "http://1.2.3.4:8080\nhttp://5.6.7.8:3128\n"
        );
        assert_eq!(
            OutputFormat::Normal {
                with_protocol: false
            }
            .render(&proxies),
            "1.2.3.4:8080\n5.6.7.8:3128\n"
        );
    }

    #[test]
    fn test_proxychains_format() {
        let proxies = vec![
            proxy(Protocol::Socks5, "1.2.3.4", 1080, 10),
            proxy(Protocol::Http, "5.6.7.8", 8080, 20),
        ];
        assert_eq!(
            OutputFormat::ProxyChains.render(&proxies),
            "socks5 1.2.3.4 1080\nhttp 5.6.7.8 8080\n"
        );
    }

    #[test]
    fn test_comma_separated_format_is_one_line() {
        let proxies = vec![
            proxy(Protocol::Http, "1.2.3.4", 8080, 10),
            proxy(Protocol::Http, "5.6.7.8", 3128, 20),
        ];
        assert_eq!(
            OutputFormat::CommaSeparated.render(&proxies),
            "1.2.3.4:8080,5.6.7.8:3128\n"
        );
    }

    #[test]
    fn test_empty_list_renders_empty_file() {
        assert_eq!(OutputFormat::CommaSeparated.render(&[]), "");
        assert_eq!(
            OutputFormat::Normal { with_protocol: true }.render(&[]),
            ""
        );
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        write_atomic(&path, "old\n").await.unwrap();
        write_atomic(&path, "new\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        // No temp file left behind.
        assert!(!dir.path().join("list.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_publisher_end_to_end_with_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("pool.db").display());
        let store = Arc::new(Store::connect(&url, 5).await.unwrap());
        store.migrate().await.unwrap();

        for (ip, latency) in [("1.1.1.1", 100i64), ("2.2.2.2", 50)] {
            let (proxy, _) = store
                .upsert_endpoint(Endpoint::new(Protocol::Http, ip.parse().unwrap(), 80))
                .await
                .unwrap();
            let now = Utc::now();
            store
                .release(
                    proxy.id,
                    &Verdict {
                        outcome: Outcome::Ok,
                        latency_ms: Some(latency),
                        country: None,
                        anonymous: Anonymity::Unknown,
                        info: String::new(),
                        started_at: now,
                        finished_at: now,
                        cancelled: false,
                    },
                    5,
                )
                .await
                .unwrap();
        }

        let path = dir.path().join("http.txt");
        let publisher = OutputPublisher::new(
            store,
            vec![OutputTarget {
                path: path.clone(),
                format: OutputFormat::Normal { with_protocol: true },
                protocols: vec![Protocol::Http],
            }],
            10,
            Vec::new(),
        );
        publisher.run_once().await;

        // Lowest latency first.
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "http://2.2.2.2:80\nhttp://1.1.1.1:80\n"
        );
    }

    #[tokio::test]
    async fn test_publisher_zero_limit_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("pool.db").display());
        let store = Arc::new(Store::connect(&url, 5).await.unwrap());
        store.migrate().await.unwrap();

        let path = dir.path().join("empty.txt");
        let publisher = OutputPublisher::new(
            store,
            vec![OutputTarget {
                path: path.clone(),
                format: OutputFormat::CommaSeparated,
                protocols: vec![Protocol::Http],
            }],
            0,
            Vec::new(),
        );
        publisher.run_once().await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
