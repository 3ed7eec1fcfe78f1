use clap::Parser;
use proxypool::config::{Cli, Config};
use proxypool::error::Error;
use proxypool::judge::JudgeClient;
use proxypool::manager::{Manager, ManagerConfig};
use proxypool::output::{OutputFormat, OutputPublisher, OutputTarget};
use proxypool::scraper::{HttpListScraper, Scraper, ScraperDriver};
use proxypool::status::{self, StatusState};
use proxypool::store::Store;
use proxypool::tester::{NoGeo, ProbeConfig, Tester};
use proxypool::types::Protocol;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) -> Result<(), Error> {
    let default_filter = if config.verbose { "debug" } else { "info" };
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter_layer);

    match &config.log_path {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            registry
                .with(fmt::layer().with_target(true).with_ansi(false).with_writer(Arc::new(file)))
                .init();
        }
        None => {
            registry.with(fmt::layer().with_target(true)).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        // Logging may not be up yet when configuration fails.
        eprintln!("proxypool: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = Config::load(cli)?;
    init_logging(&config)?;

    let pool_size = (config.max_workers + 4) as u32;
    let store = Arc::new(Store::connect(&config.db.url(), pool_size).await?);
    store.migrate().await?;

    if let Some(path) = &config.proxy_file {
        proxypool::scraper::load_proxy_file(&store, path, config.protocol).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The tester's own public address, learned from the judge without a
    // proxy. Anonymity checks are skipped if it cannot be resolved.
    let own_ip = if config.test_anonymity {
        let judge = JudgeClient::new(
            &config.judge_url,
            config.tester_timeout,
            config.user_agent.pick(),
        )?;
        match judge.own_ip().await {
            Ok(ip) => {
                info!(%ip, "resolved own public address");
                Some(ip)
            }
            Err(e) => {
                warn!(error = %e, "cannot resolve own address; anonymity checks disabled");
                None
            }
        }
    } else {
        None
    };

    let tester = Tester::new(
        ProbeConfig {
            judge_url: config.judge_url.clone(),
            timeout: config.tester_timeout,
            retries: config.tester_retries,
            backoff_factor: config.tester_backoff_factor,
            test_anonymity: config.test_anonymity && own_ip.is_some(),
            force: config.tester_force,
            ignore_countries: config.ignore_countries.clone(),
            user_agent: config.user_agent,
        },
        own_ip,
        Arc::new(NoGeo),
        shutdown_rx.clone(),
    );

    let driver = build_driver(&config, &store);
    let publisher = build_publisher(&config, &store);

    let stale_grace = config.tester_timeout * 2 * config.tester_retries.max(1);
    let manager = Arc::new(Manager::new(
        store.clone(),
        Arc::new(tester),
        driver,
        publisher,
        ManagerConfig {
            protocol: config.protocol,
            max_workers: config.max_workers,
            scan_interval: config.scan_interval,
            refresh_interval: config.refresh_interval,
            notice_interval: config.notice_interval,
            output_interval: config.output_interval,
            stop_grace: config.stop_grace,
            ban_threshold: config.ban_threshold,
            stale_grace,
            prune_after: (config.prune_days > 0)
                .then(|| std::time::Duration::from_secs(config.prune_days * 24 * 3600)),
        },
        shutdown_tx,
    ));

    if let Some(port) = config.status_port {
        let state = StatusState {
            store: store.clone(),
            counters: manager.counters(),
            max_workers: manager.max_workers(),
            protocol: config.protocol,
        };
        let rx = manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = status::serve(port, state, rx).await {
                warn!(error = %e, "status server failed");
            }
        });
    }

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            manager.trigger_shutdown();
        });
    }

    manager.run().await
}

fn build_driver(config: &Config, store: &Arc<Store>) -> Option<Arc<ScraperDriver>> {
    if !config.scrape {
        return None;
    }
    let mut scrapers: Vec<Arc<dyn Scraper>> = Vec::new();
    for source in &config.sources {
        match HttpListScraper::new(
            source.name.clone(),
            source.url.clone(),
            source.protocol,
            config.scrapper_timeout,
            config.scrapper_retries,
            config.scrapper_backoff_factor,
            config.scrapper_proxy.as_ref(),
            config.user_agent,
        ) {
            Ok(scraper) => scrapers.push(Arc::new(scraper)),
            Err(e) => warn!(source = %source.name, error = %e, "skipping scraper"),
        }
    }
    if scrapers.is_empty() {
        warn!("scraping enabled but no usable sources configured");
        return None;
    }
    Some(Arc::new(
        ScraperDriver::new(scrapers, store.clone()).with_dump_dir(config.tmp_path.clone()),
    ))
}

fn build_publisher(config: &Config, store: &Arc<Store>) -> Option<Arc<OutputPublisher>> {
    let resolve = |path: &Path| match &config.download_path {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    };
    let mut targets = Vec::new();
    if let Some(path) = &config.output_http {
        targets.push(OutputTarget {
            path: resolve(path),
            format: OutputFormat::Normal {
                with_protocol: !config.output_no_protocol,
            },
            protocols: vec![Protocol::Http],
        });
    }
    if let Some(path) = &config.output_socks {
        targets.push(OutputTarget {
            path: resolve(path),
            format: OutputFormat::Normal {
                with_protocol: !config.output_no_protocol,
            },
            protocols: vec![Protocol::Socks4, Protocol::Socks5],
        });
    }
    if let Some(path) = &config.output_proxychains {
        targets.push(OutputTarget {
            path: resolve(path),
            format: OutputFormat::ProxyChains,
            protocols: vec![config.protocol],
        });
    }
    for path in [&config.output_kinancity, &config.output_rocketmap]
        .into_iter()
        .flatten()
    {
        targets.push(OutputTarget {
            path: resolve(path),
            format: OutputFormat::CommaSeparated,
            protocols: vec![config.protocol],
        });
    }
    if targets.is_empty() {
        return None;
    }
    Some(Arc::new(OutputPublisher::new(
        store.clone(),
        targets,
        config.output_limit as usize,
        config.ignore_countries.clone(),
    )))
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
