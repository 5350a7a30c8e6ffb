use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Runtime;
use vidq_core::{
    load_vidq_config, ActiveJob, CancelOutcome, DownloadEvent, DownloadPolicy, DownloadQueueStore,
    DownloadRegistry, DownloadRequest, LibraryEntry, MediaExtractor, Orchestrator, QueueItem,
    QueueRunReport, QueueStatus, QueueSummary, VideoLibrary, VidqConfig, YtDlpExtractor,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vidq_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue error: {0}")]
    Queue(#[from] vidq_core::QueueError),
    #[error("library error: {0}")]
    Library(#[from] vidq_core::LibraryError),
    #[error("extractor error: {0}")]
    Extractor(#[from] vidq_core::ExtractorError),
    #[error("download error: {0}")]
    Orchestrator(#[from] vidq_core::OrchestratorError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("download did not complete: {0}")]
    DownloadFailed(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "vidq command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main vidq.toml
    #[arg(long, default_value = "configs/vidq.toml")]
    pub config: PathBuf,
    /// Override for the media output directory
    #[arg(long)]
    pub media_dir: Option<PathBuf>,
    /// Override for the data directory (queue and library files)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a single url, streaming progress events to stdout
    Download(DownloadArgs),
    /// Operations on the durable download queue
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Show active jobs and queue counts
    Status,
    /// Cancel a download job by id (always acknowledges)
    Cancel(CancelArgs),
    /// Operations on the video library
    #[command(subcommand)]
    Library(LibraryCommands),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Source url
    pub url: String,
    /// Caller-supplied correlation id; marks tool failures retryable
    #[arg(long)]
    pub correlation_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Job id as reported by the start event or `status`
    pub job_id: String,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Enqueue a url for a later `queue run`
    Add(QueueAddArgs),
    /// List queue items
    List,
    /// Recover orphaned items, then download everything pending
    Run,
    /// Remove every item from the queue
    Clear,
}

#[derive(Args, Debug)]
pub struct QueueAddArgs {
    /// Source url
    pub url: String,
}

#[derive(Subcommand, Debug)]
pub enum LibraryCommands {
    /// List downloaded videos, newest first
    List,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();

    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "vidqctl", &mut std::io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let runtime = Runtime::new()?;

    match &cli.command {
        Commands::Download(args) => runtime.block_on(context.download(args, cli.format)),
        Commands::Queue(QueueCommands::Add(args)) => {
            let outcome = context.queue_add(args)?;
            render(&outcome, cli.format)
        }
        Commands::Queue(QueueCommands::List) => {
            let items = QueueListing(context.queue.list()?);
            render(&items, cli.format)
        }
        Commands::Queue(QueueCommands::Run) => runtime.block_on(context.queue_run(cli.format)),
        Commands::Queue(QueueCommands::Clear) => {
            let report = ClearReport {
                removed: context.queue.clear_all()?,
            };
            render(&report, cli.format)
        }
        Commands::Status => {
            let status = context.status()?;
            render(&status, cli.format)
        }
        Commands::Cancel(args) => {
            let report = context.cancel(args);
            render(&report, cli.format)
        }
        Commands::Library(LibraryCommands::List) => {
            let entries = LibraryListing(context.library.list()?);
            render(&entries, cli.format)
        }
        Commands::Completions(_) => unreachable!("handled before context setup"),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

struct AppContext {
    config: VidqConfig,
    media_dir: PathBuf,
    queue: Arc<DownloadQueueStore>,
    library: Arc<VideoLibrary>,
    registry: Arc<DownloadRegistry>,
    extractor: Arc<YtDlpExtractor>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = load_vidq_config(&cli.config)?;
        let media_dir = cli.media_dir.clone().unwrap_or_else(|| config.media_dir());
        let data_dir = cli.data_dir.clone().unwrap_or_else(|| config.data_dir());
        let queue = Arc::new(DownloadQueueStore::new(data_dir.join("queue.json"))?);
        let library = Arc::new(VideoLibrary::new(data_dir.join("videos.json")));
        let extractor = Arc::new(YtDlpExtractor::new(
            &config.extractor.binary,
            Duration::from_secs(config.extractor.metadata_timeout_seconds),
        ));
        Ok(Self {
            config,
            media_dir,
            queue,
            library,
            registry: Arc::new(DownloadRegistry::new()),
            extractor,
        })
    }

    fn orchestrator(&self) -> Orchestrator {
        let failure_log = self
            .config
            .resolve_path(&self.config.paths.logs_dir)
            .join("download_failures.log");
        Orchestrator::new(
            self.extractor.clone(),
            self.registry.clone(),
            self.queue.clone(),
            self.library.clone(),
            &self.media_dir,
            DownloadPolicy::from_config(&self.config),
        )
        .with_failure_log(failure_log)
    }

    async fn download(&self, args: &DownloadArgs, format: OutputFormat) -> Result<()> {
        // A missing extractor makes every job fail; refuse to start at all.
        self.extractor.probe().await?;
        self.queue.recover_on_startup()?;

        let mut request = DownloadRequest::new(args.url.clone());
        if let Some(id) = &args.correlation_id {
            request = request.with_correlation_id(id.clone());
        }
        let orchestrator = self.orchestrator();
        let mut stream = orchestrator.start(request)?;

        let mut failure: Option<String> = None;
        while let Some(event) = stream.recv().await {
            render_event(&event, format)?;
            match &event {
                DownloadEvent::Error { message, .. } => failure = Some(message.clone()),
                DownloadEvent::Cancelled { .. } => failure = Some("cancelled".to_string()),
                _ => {}
            }
        }
        match failure {
            Some(message) => Err(AppError::DownloadFailed(message)),
            None => Ok(()),
        }
    }

    async fn queue_run(&self, format: OutputFormat) -> Result<()> {
        self.extractor.probe().await?;
        let report = self.orchestrator().run_pending().await?;
        render(&report, format)
    }

    fn queue_add(&self, args: &QueueAddArgs) -> Result<QueueAddOutcome> {
        match self.queue.insert(QueueItem::new(args.url.clone())) {
            Ok(item) => Ok(QueueAddOutcome { added: true, item }),
            Err(vidq_core::QueueError::DuplicateUrl { existing }) => Ok(QueueAddOutcome {
                added: false,
                item: *existing,
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            active: self.registry.active(),
            queue: self.queue.summary()?,
        })
    }

    fn cancel(&self, args: &CancelArgs) -> CancelReport {
        CancelReport {
            job_id: args.job_id.clone(),
            outcome: self.registry.cancel(&args.job_id),
        }
    }
}

fn render_event(event: &DownloadEvent, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Text => match event {
            DownloadEvent::Started { job_id, url } => println!("started {job_id} {url}"),
            DownloadEvent::Progress { percent, label } => println!("{percent:>3}% {label}"),
            DownloadEvent::Done { file_path, title } => {
                println!("done: {title} -> {}", file_path.display())
            }
            DownloadEvent::Error {
                message, retryable, ..
            } => println!("error: {message} (retryable: {retryable})"),
            DownloadEvent::Cancelled { job_id } => println!("cancelled {job_id}"),
        },
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct QueueAddOutcome {
    added: bool,
    item: QueueItem,
}

impl DisplayFallback for QueueAddOutcome {
    fn display(&self) -> String {
        if self.added {
            format!("queued {} {}", self.item.id, self.item.url)
        } else {
            format!(
                "already queued as {} (status: {})",
                self.item.id, self.item.status
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct QueueListing(Vec<QueueItem>);

impl DisplayFallback for QueueListing {
    fn display(&self) -> String {
        if self.0.is_empty() {
            return "queue is empty".to_string();
        }
        self.0
            .iter()
            .map(|item| {
                format!(
                    "{} {:<11} {:>3}% {} {}",
                    item.id,
                    item.status.as_str(),
                    item.progress,
                    item.url,
                    item.title.as_deref().unwrap_or("-"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DisplayFallback for QueueRunReport {
    fn display(&self) -> String {
        format!(
            "recovered {}, attempted {}: {} completed, {} failed, {} cancelled",
            self.recovered, self.attempted, self.completed, self.failed, self.cancelled
        )
    }
}

#[derive(Debug, Serialize)]
struct ClearReport {
    removed: usize,
}

impl DisplayFallback for ClearReport {
    fn display(&self) -> String {
        format!("removed {} queue items", self.removed)
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    active: Vec<ActiveJob>,
    queue: QueueSummary,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("active jobs: {}", self.active.len())];
        for job in &self.active {
            lines.push(format!(
                "  {} {} running for {}s",
                job.id, job.url, job.duration_seconds
            ));
        }
        lines.push(format!("queue items: {}", self.queue.total));
        let mut counts: Vec<(QueueStatus, usize)> =
            self.queue.counts.iter().map(|(k, v)| (*k, *v)).collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        for (status, count) in counts {
            lines.push(format!("  {}: {}", status.as_str(), count));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct CancelReport {
    job_id: String,
    outcome: CancelOutcome,
}

impl DisplayFallback for CancelReport {
    fn display(&self) -> String {
        let detail = match self.outcome {
            CancelOutcome::Killed => "running process killed",
            CancelOutcome::Flagged => "flagged before start",
            CancelOutcome::Deferred => "recorded for a future start",
        };
        format!("cancel acknowledged for {} ({detail})", self.job_id)
    }
}

#[derive(Debug, Serialize)]
struct LibraryListing(Vec<LibraryEntry>);

impl DisplayFallback for LibraryListing {
    fn display(&self) -> String {
        if self.0.is_empty() {
            return "library is empty".to_string();
        }
        self.0
            .iter()
            .map(|entry| format!("{} -> {}", entry.title, entry.file_path))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
