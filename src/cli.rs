use crate::broker::{AmqpBroker, MessageBroker};
use crate::{
    install_prometheus_exporter, parse_url_list, validate_url, BrokerError, CaptureWorker,
    ChromeLauncher, Config, JobSource, Metrics, PageRenderer, PipelineError, Renderer,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "capture-pipeline")]
#[command(about = "Queue-driven web page capture worker")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "AMQP_URL", help = "Broker address")]
    pub broker_url: Option<String>,

    #[arg(long, help = "Queue URL jobs are consumed from")]
    pub input_queue: Option<String>,

    #[arg(long, help = "Queue captured images are published to")]
    pub output_queue: Option<String>,

    #[arg(long, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume URL jobs and publish captures until stopped
    Worker,

    /// Put URLs on the input queue
    Enqueue {
        #[arg(help = "URLs to enqueue")]
        urls: Vec<String>,

        #[arg(short, long, help = "File with one URL per line")]
        file: Option<PathBuf>,
    },

    /// Capture a single URL straight to a file, bypassing the queues
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,
    },

    /// Show how many messages are waiting on a queue
    Depth {
        #[arg(short, long, help = "Queue name (default: input queue)")]
        queue: Option<String>,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Build the effective configuration: file or defaults, then flags.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };

    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Input queue: {}", config.input_queue);
    info!("Output queue: {}", config.output_queue);
    info!("Navigation timeout: {:?}", config.navigation_timeout);

    Ok(config)
}

pub fn apply_overrides(config: &mut Config, args: &Cli) {
    if let Some(broker_url) = &args.broker_url {
        config.broker_url = broker_url.clone();
    }
    if let Some(input_queue) = &args.input_queue {
        config.input_queue = input_queue.clone();
    }
    if let Some(output_queue) = &args.output_queue {
        config.output_queue = output_queue.clone();
    }
    if let Some(timeout) = args.timeout {
        config.navigation_timeout = Duration::from_secs(timeout);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run<F>(&self, command: Commands, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        match command {
            Commands::Worker => self.run_worker(shutdown).await,
            Commands::Enqueue { urls, file } => {
                tokio::select! {
                    result = self.run_enqueue(urls, file) => result,
                    _ = shutdown => Ok(()),
                }
            }
            Commands::Capture { url, output } => {
                finish_before_shutdown(self.run_capture(&url, output), shutdown).await
            }
            Commands::Depth { queue } => self.show_depth(queue).await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    fn renderer(&self) -> PageRenderer<ChromeLauncher> {
        PageRenderer::new(
            ChromeLauncher::new(self.config.clone()),
            self.config.navigation_timeout,
        )
    }

    async fn connect(&self) -> anyhow::Result<Arc<AmqpBroker>> {
        let broker = AmqpBroker::connect(&self.config.broker_url)
            .await
            .context("Failed to connect to broker")?;
        Ok(Arc::new(broker))
    }

    pub async fn run_worker<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        if let Some(port) = self.config.metrics_port {
            install_prometheus_exporter(port)?;
        }

        let broker = self.connect().await?;
        let worker = CaptureWorker::new(
            self.config.clone(),
            broker.clone(),
            Arc::new(self.renderer()),
            Arc::new(Metrics::new()),
        );

        let result = worker.run_until(shutdown).await;
        worker_exit(result, broker.close().await)
    }

    pub async fn run_enqueue(
        &self,
        mut urls: Vec<String>,
        file: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        if let Some(path) = file {
            let content = fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            urls.extend(parse_url_list(&content));
        }

        if urls.is_empty() {
            anyhow::bail!("No URLs given");
        }

        let broker = self.connect().await?;
        let source = JobSource::new(broker.clone(), &self.config);
        let enqueued = source.enqueue_many(&urls).await;
        broker.close().await?;

        println!("Added {} URLs to '{}'", enqueued?, self.config.input_queue);
        Ok(())
    }

    pub async fn run_capture(&self, url: &str, output: PathBuf) -> anyhow::Result<()> {
        validate_url(url)?;

        let image = self.renderer().render(url).await?;
        fs::write(&output, &image)
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;

        println!(
            "Captured {} ({}) to {}",
            url,
            crate::format_bytes(image.len()),
            output.display()
        );
        Ok(())
    }

    pub async fn show_depth(&self, queue: Option<String>) -> anyhow::Result<()> {
        let queue = queue.unwrap_or_else(|| self.config.input_queue.clone());

        let broker = self.connect().await?;
        let source = JobSource::new(broker.clone(), &self.config);
        let depth = source.queue_depth(&queue).await;
        broker.close().await?;

        println!("Number of messages in {}: {}", queue, depth?);
        Ok(())
    }

    pub async fn validate_config(&self, path: PathBuf) -> anyhow::Result<()> {
        let config = Config::from_file(&path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?;
        config.validate()?;

        println!("Configuration {} is valid", path.display());
        println!("  Broker: {}", config.broker_url);
        println!(
            "  Queues: {} -> {} (dead-letter: {})",
            config.input_queue,
            config.output_queue,
            config.dead_letter_queue.as_deref().unwrap_or("disabled")
        );
        println!("  Navigation timeout: {:?}", config.navigation_timeout);
        Ok(())
    }
}

/// The worker's own failure wins over a failure to close the connection,
/// which usually follows from it.
fn worker_exit(
    result: Result<(), PipelineError>,
    closed: Result<(), BrokerError>,
) -> anyhow::Result<()> {
    if let Err(e) = closed {
        warn!("Failed to close broker connection: {}", e);
        result?;
        return Err(e.into());
    }
    Ok(result?)
}

/// Run `task` to completion even if `shutdown` fires first, so a rendering
/// context that is already up still gets torn down.
async fn finish_before_shutdown<T, F>(task: T, shutdown: F) -> T::Output
where
    T: Future,
    F: Future<Output = ()>,
{
    futures::pin_mut!(task);
    tokio::select! {
        biased;
        output = &mut task => return output,
        _ = shutdown => info!("Shutdown requested, finishing the capture in progress"),
    }
    task.await
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;

    Ok(())
}
