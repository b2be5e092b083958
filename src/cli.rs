use crate::{
    format_duration, install_prometheus_recorder, Collector, CollectorMetrics, Config, DbPage,
    DbPageSource, PageRequest, PoolCloseReport,
};
use clap::{Parser, Subcommand};
use futures::FutureExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "legis-collector")]
#[command(about = "Streaming collection engine for legislative data sources")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Number of handler workers")]
    pub workers: Option<usize>,

    #[arg(long, global = true, help = "Maximum number of live browser sessions")]
    pub capacity: Option<usize>,

    #[arg(long, global = true, help = "Expected items per page")]
    pub page_size: Option<usize>,

    #[arg(long, global = true, help = "Run page fetches on the handler pool")]
    pub share_workers: bool,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,
}

impl Cli {
    /// Applies command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.queue.worker_pool_size = workers;
        }
        if let Some(capacity) = self.capacity {
            config.resource_pool.capacity = capacity;
        }
        if let Some(page_size) = self.page_size {
            config.queue.page_size_hint = page_size;
        }
        if self.share_workers {
            config.queue.share_worker_pool = true;
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Collect a synthetic paged table of bills with mock browser sessions
    Run {
        #[arg(long, default_value = "10", help = "Number of pages in the table")]
        pages: usize,

        #[arg(long, default_value = "20", help = "Simulated page query latency in milliseconds")]
        fetch_delay: u64,

        #[arg(long, default_value = "5", help = "Simulated per-item scraping time in milliseconds")]
        work: u64,

        #[arg(long, help = "Fail every Nth item")]
        fail_every: Option<usize>,

        #[arg(long, help = "Print Prometheus metrics after the run")]
        metrics: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(help = "Configuration file to validate")]
        path: PathBuf,
    },

    /// Print the effective configuration as JSON
    ShowConfig,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pages: usize,
    pub fetch_delay: Duration,
    pub work: Duration,
    pub fail_every: Option<usize>,
    pub metrics: bool,
}

/// Mock browser session handed out by the demo pool.
#[derive(Debug)]
pub struct DemoSession {
    pub id: usize,
    pub pages_opened: usize,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs `command`; a message on `shutdown` interrupts a collection run,
    /// which still closes its session pool before returning.
    pub async fn run(
        &self,
        command: Commands,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Run {
                pages,
                fetch_delay,
                work,
                fail_every,
                metrics,
            } => {
                let options = RunOptions {
                    pages,
                    fetch_delay: Duration::from_millis(fetch_delay),
                    work: Duration::from_millis(work),
                    fail_every,
                    metrics,
                };
                self.run_demo(options, &mut shutdown).await.map(|_| ())
            }
            Commands::Validate { path } => self.validate_config(path).await,
            Commands::ShowConfig => self.show_config(),
        }
    }

    pub async fn run_demo(
        &self,
        options: RunOptions,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<PoolCloseReport, Box<dyn std::error::Error>> {
        let prometheus = if options.metrics {
            Some(install_prometheus_recorder()?)
        } else {
            None
        };
        let metrics = Arc::new(CollectorMetrics::new());

        let session_ids = Arc::new(AtomicUsize::new(0));
        let collector = Collector::with_metrics(
            self.config.clone(),
            move || {
                let id = session_ids.fetch_add(1, Ordering::SeqCst);
                async move {
                    debug!("Launching mock browser session {}", id);
                    Ok(DemoSession {
                        id,
                        pages_opened: 0,
                    })
                }
                .boxed()
            },
            |session: DemoSession| {
                async move {
                    debug!(
                        "Closing mock browser session {} after {} pages",
                        session.id, session.pages_opened
                    );
                    Ok(())
                }
                .boxed()
            },
            metrics,
        )?;

        let page_size = self.config.queue.page_size_hint;
        let total_pages = options.pages;
        let fetch_delay = options.fetch_delay;
        let bills = DbPageSource::with_page_size(page_size, move |request: PageRequest| async move {
            tokio::time::sleep(fetch_delay).await;
            if request.number >= total_pages {
                return Ok(DbPage::last(Vec::new()));
            }
            let ids: Vec<usize> = (request.offset()..request.offset() + request.size).collect();
            Ok(DbPage::new(ids, request.number + 1 < total_pages))
        })
        .with_last_page(total_pages.saturating_sub(1));

        println!(
            "Collecting {} bills ({} pages of {}) with {} sessions",
            total_pages * page_size,
            total_pages,
            page_size,
            self.config.resource_pool.capacity
        );

        let work = options.work;
        let fail_every = options.fail_every;
        let collect = collector.collect("bills", bills, move |bill: usize, mut session| async move {
            session.pages_opened += 1;
            tokio::time::sleep(work).await;
            if let Some(n) = fail_every {
                if n > 0 && (bill + 1) % n == 0 {
                    anyhow::bail!("bill {} page did not load", bill);
                }
            }
            debug!("Bill {} scraped with session {}", bill, session.id);
            Ok(())
        });

        let outcome = tokio::select! {
            outcome = collect => Some(outcome),
            _ = shutdown_requested(shutdown) => {
                info!("Shutdown requested, closing sessions");
                None
            }
        };

        let closed = collector.shutdown().await;

        let report = match outcome {
            Some(outcome) => outcome?,
            None => {
                println!(
                    "\nRun {} interrupted; sessions: {} created, {} destroyed",
                    collector.run_id(),
                    closed.created,
                    closed.destroyed
                );
                return Ok(closed);
            }
        };
        println!("\nRun {}", collector.run_id());
        println!("  Dispatched: {}", report.dispatched);
        println!("  Succeeded:  {}", report.succeeded);
        println!("  Failed:     {}", report.failed);
        println!("  Elapsed:    {}", format_duration(report.elapsed()));
        println!(
            "  Sessions:   {} created, {} destroyed",
            closed.created, closed.destroyed
        );
        if closed.leaked > 0 {
            warn!("{} sessions were not returned in time", closed.leaked);
        }

        if let Some(handle) = prometheus {
            println!("\n{}", handle.render());
        }

        Ok(closed)
    }

    pub async fn validate_config(&self, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        println!("Validating configuration: {}", path.display());

        let content = fs::read_to_string(&path).await?;
        let config = Config::from_json_str(&content)?;

        println!("Configuration is valid:");
        println!("  Page size hint: {}", config.queue.page_size_hint);
        println!(
            "  Low-water-mark: {}",
            config.queue.effective_low_water_mark()
        );
        println!("  Handler workers: {}", config.queue.worker_pool_size);
        println!("  Shared worker pool: {}", config.queue.share_worker_pool);
        println!("  Session capacity: {}", config.resource_pool.capacity);
        println!(
            "  Close grace period: {:?}",
            config.resource_pool.close_grace_period
        );

        Ok(())
    }

    pub fn show_config(&self) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(&self.config)?);
        info!("Configuration printed");
        Ok(())
    }
}

/// Resolves once a shutdown message arrives; a closed channel never resolves.
async fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) {
    if let Err(broadcast::error::RecvError::Closed) = shutdown.recv().await {
        std::future::pending::<()>().await;
    }
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_loaded_values() {
        let cli = Cli::parse_from([
            "legis-collector",
            "--workers",
            "3",
            "--capacity",
            "5",
            "--share-workers",
            "show-config",
        ]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.queue.worker_pool_size, 3);
        assert_eq!(config.resource_pool.capacity, 5);
        assert!(config.queue.share_worker_pool);
        assert_eq!(config.queue.page_size_hint, 20);
    }

    #[test]
    fn run_subcommand_parses_options() {
        let cli = Cli::parse_from(["legis-collector", "run", "--pages", "3", "--fail-every", "4"]);
        match cli.command {
            Commands::Run {
                pages, fail_every, ..
            } => {
                assert_eq!(pages, 3);
                assert_eq!(fail_every, Some(4));
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn demo_run_completes() {
        let mut config = Config::default();
        config.queue.page_size_hint = 4;
        config.queue.worker_pool_size = 2;
        config.resource_pool.capacity = 2;

        let runner = CliRunner::new(config);
        let (_shutdown_tx, mut shutdown) = broadcast::channel(1);
        let closed = runner
            .run_demo(
                RunOptions {
                    pages: 3,
                    fetch_delay: Duration::from_millis(1),
                    work: Duration::from_millis(1),
                    fail_every: Some(5),
                    metrics: false,
                },
                &mut shutdown,
            )
            .await
            .unwrap();
        assert!(closed.created >= 1);
        assert_eq!(closed.created, closed.destroyed);
    }

    #[tokio::test]
    async fn interrupted_run_still_closes_sessions() {
        let mut config = Config::default();
        config.queue.page_size_hint = 4;
        config.queue.worker_pool_size = 2;
        config.resource_pool.capacity = 2;
        config.resource_pool.close_grace_period = Duration::from_secs(2);

        let runner = CliRunner::new(config);
        let (shutdown_tx, mut shutdown) = broadcast::channel(1);
        let interrupt = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown_tx.send(());
        });

        let started = std::time::Instant::now();
        let closed = runner
            .run_demo(
                RunOptions {
                    pages: 1000,
                    fetch_delay: Duration::from_millis(1),
                    work: Duration::from_millis(10),
                    fail_every: None,
                    metrics: false,
                },
                &mut shutdown,
            )
            .await
            .unwrap();
        interrupt.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(closed.created >= 1);
        assert_eq!(closed.created, closed.destroyed);
        assert_eq!(closed.leaked, 0);
    }
}
